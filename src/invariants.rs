use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{GraphInvariantViolation, GraphSnapshot, NodeKind, Uid, predicates};

/// Edges whose target must be a node of a given kind, keyed by the kind of the source.
const TYPED_EDGES: &[(NodeKind, &str, NodeKind)] = &[
    (NodeKind::Device, predicates::LINKED_TO, NodeKind::Device),
    (NodeKind::Device, predicates::INCOMING_MSDIN, NodeKind::Account),
    (NodeKind::Device, predicates::OUTGOING_MSDIN, NodeKind::Account),
    (NodeKind::Account, predicates::ORIGIN_DEVICES, NodeKind::Device),
    (NodeKind::Account, predicates::DESTINATION_DEVICES, NodeKind::Device),
    (NodeKind::Call, predicates::CALL_ORIGIN, NodeKind::Device),
    (NodeKind::Call, predicates::CALL_DESTINATION, NodeKind::Device),
    (NodeKind::Call, predicates::CALL_ACCOUNT, NodeKind::Account),
];

const CALL_REFERENCES: &[&str] = &[
    predicates::CALL_ORIGIN,
    predicates::CALL_DESTINATION,
    predicates::CALL_ACCOUNT,
];

pub fn graph_invariant_violations(snapshot: &GraphSnapshot) -> Vec<GraphInvariantViolation> {
    let kinds: HashMap<Uid, Option<NodeKind>> = snapshot
        .nodes
        .iter()
        .map(|node| (node.uid, node.kind()))
        .collect();

    let mut violations = Vec::new();
    let mut identities: BTreeMap<(NodeKind, &str), Vec<Uid>> = BTreeMap::new();

    for node in &snapshot.nodes {
        let Some(kind) = node.kind() else {
            continue;
        };

        if let Some(identity) = kind
            .identity_predicate()
            .and_then(|predicate| node.str_value(predicate))
        {
            identities.entry((kind, identity)).or_default().push(node.uid);
        }

        for (source_kind, predicate, expected) in TYPED_EDGES {
            if *source_kind != kind {
                continue;
            }
            for target in node.edges(predicate) {
                match kinds.get(&target) {
                    None => violations.push(GraphInvariantViolation::DanglingReference {
                        from_uid: node.uid,
                        predicate: predicate.to_string(),
                        missing_uid: target,
                    }),
                    Some(target_kind) if *target_kind != Some(*expected) => {
                        violations.push(GraphInvariantViolation::WrongReferenceKind {
                            from_uid: node.uid,
                            predicate: predicate.to_string(),
                            target_uid: target,
                            expected: *expected,
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        if kind == NodeKind::Device {
            for target in node.edges(predicates::LINKED_TO) {
                let reciprocal = snapshot
                    .node(target)
                    .is_some_and(|other| other.has_edge(predicates::LINKED_TO, node.uid));
                if kinds.contains_key(&target) && !reciprocal {
                    violations.push(GraphInvariantViolation::AsymmetricLink {
                        from_uid: node.uid,
                        to_uid: target,
                    });
                }
            }
        }

        if kind == NodeKind::Call {
            for predicate in CALL_REFERENCES {
                if node.edges(predicate).next().is_none() {
                    violations.push(GraphInvariantViolation::MissingCallReference {
                        call_uid: node.uid,
                        predicate: predicate.to_string(),
                    });
                }
            }
        }
    }

    for ((kind, identity), uids) in identities {
        if uids.len() > 1 {
            violations.push(GraphInvariantViolation::DuplicateIdentity {
                kind,
                identity: identity.to_string(),
                uids,
            });
        }
    }

    violations
}

pub fn ensure_graph_invariants(snapshot: &GraphSnapshot) -> Result<()> {
    let violations = graph_invariant_violations(snapshot);
    if let Some(first) = violations.first() {
        return Err(LibError::consistency(
            first.public_message(),
            anyhow!(
                "graph invariant check failed ({}): {:?}",
                first.error_code(),
                violations
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::models::{NodeSnapshot, Value};

    fn node(uid: u64, kind: NodeKind, identity: Option<&str>) -> NodeSnapshot {
        let mut values = BTreeMap::new();
        values.insert(
            predicates::TYPE.to_string(),
            Value::from(kind.as_db_value()),
        );
        if let (Some(predicate), Some(identity)) = (kind.identity_predicate(), identity) {
            values.insert(predicate.to_string(), Value::from(identity));
        }
        NodeSnapshot {
            uid: Uid(uid),
            values,
            edges: BTreeMap::new(),
        }
    }

    fn edge(node: &mut NodeSnapshot, predicate: &str, target: u64) {
        node.edges
            .entry(predicate.to_string())
            .or_insert_with(BTreeSet::new)
            .insert(Uid(target));
    }

    fn call_with_refs(uid: u64, origin: u64, destination: u64, account: u64) -> NodeSnapshot {
        let mut call = node(uid, NodeKind::Call, None);
        edge(&mut call, predicates::CALL_ORIGIN, origin);
        edge(&mut call, predicates::CALL_DESTINATION, destination);
        edge(&mut call, predicates::CALL_ACCOUNT, account);
        call
    }

    #[test]
    fn consistent_graph_has_no_violations() {
        let mut a = node(1, NodeKind::Device, Some("10"));
        let mut b = node(2, NodeKind::Device, Some("20"));
        let mut account = node(3, NodeKind::Account, Some("555"));
        edge(&mut a, predicates::LINKED_TO, 2);
        edge(&mut b, predicates::LINKED_TO, 1);
        edge(&mut a, predicates::INCOMING_MSDIN, 3);
        edge(&mut b, predicates::OUTGOING_MSDIN, 3);
        edge(&mut account, predicates::ORIGIN_DEVICES, 1);
        edge(&mut account, predicates::DESTINATION_DEVICES, 2);
        let snapshot = GraphSnapshot {
            nodes: vec![a, b, account, call_with_refs(4, 1, 2, 3)],
        };

        assert!(graph_invariant_violations(&snapshot).is_empty());
        assert!(ensure_graph_invariants(&snapshot).is_ok());
    }

    #[test]
    fn duplicate_identities_are_reported() {
        let snapshot = GraphSnapshot {
            nodes: vec![
                node(1, NodeKind::Device, Some("10")),
                node(2, NodeKind::Device, Some("10")),
                node(3, NodeKind::Account, Some("10")),
            ],
        };
        let violations = graph_invariant_violations(&snapshot);
        assert_eq!(
            violations,
            vec![GraphInvariantViolation::DuplicateIdentity {
                kind: NodeKind::Device,
                identity: "10".to_string(),
                uids: vec![Uid(1), Uid(2)],
            }]
        );
    }

    #[test]
    fn one_way_link_is_reported() {
        let mut a = node(1, NodeKind::Device, Some("10"));
        let b = node(2, NodeKind::Device, Some("20"));
        edge(&mut a, predicates::LINKED_TO, 2);
        let violations = graph_invariant_violations(&GraphSnapshot { nodes: vec![a, b] });
        assert!(violations.iter().any(|v| matches!(
            v,
            GraphInvariantViolation::AsymmetricLink { from_uid, to_uid }
                if *from_uid == Uid(1) && *to_uid == Uid(2)
        )));
    }

    #[test]
    fn dangling_and_mistyped_call_references_are_reported() {
        let device = node(1, NodeKind::Device, Some("10"));
        let account = node(2, NodeKind::Account, Some("555"));
        // Destination points at the account, account reference is missing entirely.
        let call = call_with_refs(3, 1, 2, 99);
        let violations = graph_invariant_violations(&GraphSnapshot {
            nodes: vec![device, account, call],
        });

        assert!(violations.iter().any(|v| matches!(
            v,
            GraphInvariantViolation::WrongReferenceKind { target_uid, expected: NodeKind::Device, .. }
                if *target_uid == Uid(2)
        )));
        assert!(violations.iter().any(|v| matches!(
            v,
            GraphInvariantViolation::DanglingReference { missing_uid, .. } if *missing_uid == Uid(99)
        )));
    }

    #[test]
    fn call_without_account_is_reported() {
        let mut call = node(5, NodeKind::Call, None);
        edge(&mut call, predicates::CALL_ORIGIN, 1);
        edge(&mut call, predicates::CALL_DESTINATION, 1);
        let snapshot = GraphSnapshot {
            nodes: vec![node(1, NodeKind::Device, Some("10")), call],
        };
        let err = ensure_graph_invariants(&snapshot).unwrap_err();
        assert_eq!(err.public, "Call is missing a device or account reference");
    }
}
