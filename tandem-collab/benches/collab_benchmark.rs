use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use tandem_collab::protocol::{decode_binary, decode_json, Frame};
use tandem_collab::{
    transform, ClientId, ClientMessage, Codec, DocumentId, DocumentState, MemoryStore, Operation,
    OperationLog, ResyncPlan, ServerConfig, ServerMessage, SessionRegistry, UserId,
};

/// A log of `n` single-character inserts spread over the first 100 chars.
fn busy_log(n: u64) -> (DocumentState, OperationLog) {
    let mut doc = DocumentState::new("x".repeat(100), 0);
    let mut log = OperationLog::new(0, n as usize, n as usize);
    let origin = ClientId::new();
    for v in 0..n {
        let op = Operation::insert((v as usize * 7) % 100, "y", v).with_origin(origin);
        let (version, applied) = doc.apply(op).unwrap();
        log.append(version, applied).unwrap();
    }
    (doc, log)
}

fn bench_transform(c: &mut Criterion) {
    let (_, log) = busy_log(1000);
    let candidate = Operation::insert(50, "z", 0).with_origin(ClientId::new());
    let delete = Operation::delete(10, 40, 0).with_origin(ClientId::new());

    c.bench_function("transform_insert_past_1000", |b| {
        b.iter(|| black_box(transform(black_box(&candidate), log.since(0).unwrap())))
    });
    c.bench_function("transform_delete_past_1000", |b| {
        b.iter(|| black_box(transform(black_box(&delete), log.since(0).unwrap())))
    });
    c.bench_function("transform_insert_past_10", |b| {
        let recent = Operation::insert(50, "z", 990);
        b.iter(|| black_box(transform(black_box(&recent), log.since(990).unwrap())))
    });
}

fn bench_apply(c: &mut Criterion) {
    let base = DocumentState::new("lorem ipsum ".repeat(1000), 0);
    c.bench_function("apply_insert_12k_doc", |b| {
        b.iter(|| {
            let mut doc = base.clone();
            black_box(doc.apply(Operation::insert(6000, "dolor", 0)).unwrap());
        })
    });
}

fn edit_message() -> ServerMessage {
    ServerMessage::Edit {
        version: 42,
        op: Operation::insert(120, "hello world", 41)
            .with_origin(ClientId::new())
            .with_seq(7),
    }
}

fn bench_codec(c: &mut Criterion) {
    let msg = edit_message();
    let Frame::Binary(binary) = msg.encode(Codec::Binary).unwrap() else {
        unreachable!()
    };
    let Frame::Text(json) = msg.encode(Codec::Json).unwrap() else {
        unreachable!()
    };

    c.bench_function("edit_encode_binary", |b| {
        b.iter(|| black_box(black_box(&msg).encode(Codec::Binary).unwrap()))
    });
    c.bench_function("edit_encode_json", |b| {
        b.iter(|| black_box(black_box(&msg).encode(Codec::Json).unwrap()))
    });
    c.bench_function("edit_decode_binary", |b| {
        b.iter(|| black_box(decode_binary::<ServerMessage>(black_box(&binary)).unwrap()))
    });
    c.bench_function("edit_decode_json", |b| {
        b.iter(|| black_box(decode_json::<ServerMessage>(black_box(&json)).unwrap()))
    });

    let join = ClientMessage::Join {
        document_id: DocumentId::from("notes"),
        resume_from: Some(1200),
    };
    c.bench_function("join_encode_binary", |b| {
        b.iter(|| black_box(black_box(&join).encode(Codec::Binary).unwrap()))
    });
}

fn bench_resync(c: &mut Criterion) {
    let (doc, log) = busy_log(1000);
    c.bench_function("resync_replay_500_encode", |b| {
        b.iter(|| {
            let plan = ResyncPlan::plan(&doc, &log, black_box(500));
            black_box(plan.into_message().encode(Codec::Binary).unwrap());
        })
    });
}

fn bench_registry_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = SessionRegistry::new(ServerConfig::default(), Arc::new(MemoryStore::new()));
    let doc = DocumentId::from("bench");
    let client = ClientId::new();
    rt.block_on(registry.join(&doc, client, UserId::from("bench"), None))
        .unwrap();

    c.bench_function("registry_submit_append", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (_, version) = registry.snapshot(&doc).await.unwrap();
                let op = Operation::insert(0, "a", version).with_origin(client);
                black_box(registry.submit_edit(&doc, op).await.unwrap());
            })
        })
    });
}

criterion_group!(
    benches,
    bench_transform,
    bench_apply,
    bench_codec,
    bench_resync,
    bench_registry_submit,
);
criterion_main!(benches);
