//! Property tests for the ordering and transform rules.
//!
//! Verifies, for generated edit sets:
//! - Every replica converges to the server text whatever the arrival order
//! - Accepted versions are dense, starting right after the base
//! - An insert inside a concurrent delete lands at the delete's start

use proptest::prelude::*;
use std::collections::VecDeque;
use tandem_collab::transform::rebase;
use tandem_collab::{transform, ClientId, DocumentState, LoggedOp, Operation, OperationLog, Replica};
use uuid::Uuid;

fn client(n: usize) -> ClientId {
    ClientId::from_uuid(Uuid::from_u128(n as u128 + 1))
}

/// An edit before it is fitted to the text it is authored on.
#[derive(Debug, Clone)]
enum Draft {
    Insert { at: usize, text: String },
    Delete { at: usize, len: usize },
}

fn draft_strategy() -> impl Strategy<Value = Draft> {
    prop_oneof![
        (any::<usize>(), "[A-Z]{1,3}").prop_map(|(at, text)| Draft::Insert { at, text }),
        (any::<usize>(), any::<usize>()).prop_map(|(at, len)| Draft::Delete { at, len }),
    ]
}

/// Base text, each client's drafts, and an arrival order that keeps every
/// client's own edits in sequence.
fn scenario_strategy() -> impl Strategy<Value = (String, Vec<Vec<Draft>>, Vec<usize>)> {
    (
        "[a-z]{0,12}",
        prop::collection::vec(prop::collection::vec(draft_strategy(), 1..=3), 2..=4),
    )
        .prop_flat_map(|(base, drafts)| {
            let arrivals: Vec<usize> = drafts
                .iter()
                .enumerate()
                .flat_map(|(i, d)| std::iter::repeat(i).take(d.len()))
                .collect();
            (Just(base), Just(drafts), Just(arrivals).prop_shuffle())
        })
}

fn author(replica: &mut Replica, draft: &Draft) -> Operation {
    let n = replica.content().chars().count();
    match draft {
        Draft::Insert { at, text } => replica.insert(at % (n + 1), text.clone()).unwrap(),
        Draft::Delete { at, len } => {
            let at = at % (n + 1);
            replica.delete(at, len % (n - at + 1)).unwrap()
        }
    }
}

proptest! {
    #[test]
    fn replicas_converge_for_any_arrival_order((base, drafts, arrivals) in scenario_strategy()) {
        let mut replicas: Vec<Replica> = (0..drafts.len())
            .map(|i| {
                let mut replica = Replica::new();
                replica.set_client(client(i));
                replica.apply_snapshot(base.clone(), 0);
                replica
            })
            .collect();

        // Everyone authors against v0 before hearing from anyone else
        let mut outboxes: Vec<VecDeque<Operation>> = replicas
            .iter_mut()
            .zip(&drafts)
            .map(|(replica, mine)| mine.iter().map(|d| author(replica, d)).collect())
            .collect();

        let mut doc = DocumentState::new(base.clone(), 0);
        let mut log = OperationLog::new(0, 1024, 1024);
        let mut accepted = Vec::new();
        for &i in &arrivals {
            let op = outboxes[i].pop_front().unwrap();
            let rebased = rebase(&op, &log).unwrap();
            let (version, applied) = doc.apply(rebased).unwrap();
            log.append(version, applied.clone()).unwrap();
            accepted.push(LoggedOp { version, op: applied });
        }

        let versions: Vec<u64> = accepted.iter().map(|entry| entry.version).collect();
        let dense: Vec<u64> = (1..=arrivals.len() as u64).collect();
        prop_assert_eq!(versions, dense);

        for replica in &mut replicas {
            for entry in &accepted {
                if entry.op.origin == replica.client_id() {
                    let settled = replica.acknowledge(entry.version, entry.op.seq).unwrap();
                    prop_assert_eq!(settled.as_ref(), Some(&entry.op));
                } else {
                    replica.apply_remote(entry.version, entry.op.clone()).unwrap();
                }
            }
            prop_assert_eq!(replica.content(), doc.content());
            prop_assert_eq!(replica.version(), doc.version());
            prop_assert_eq!(replica.pending_len(), 0);
        }
    }

    #[test]
    fn insert_against_delete_follows_clamp_rule(
        (n, p, len, q) in (1usize..40)
            .prop_flat_map(|n| (Just(n), 0..n))
            .prop_flat_map(|(n, p)| (Just(n), Just(p), 1..=n - p, 0..=n))
    ) {
        let delete = LoggedOp {
            version: 1,
            op: Operation::delete(p, len, 0).with_origin(client(0)),
        };
        let insert = Operation::insert(q, "Z", 0).with_origin(client(1));
        let out = transform(&insert, std::slice::from_ref(&delete));

        let (expected, clamped) = if q <= p {
            (q, false)
        } else if q >= p + len {
            (q - len, false)
        } else {
            (p, true)
        };
        prop_assert_eq!(out.position, expected);
        prop_assert_eq!(out.clamped, clamped);
        prop_assert_eq!(out.base_version, 1);

        let mut doc = DocumentState::new("a".repeat(n), 0);
        doc.apply(delete.op.clone()).unwrap();
        doc.apply(out).unwrap();
        prop_assert_eq!(doc.char_len(), n - len + 1);
        prop_assert_eq!(doc.version(), 2);
    }
}
