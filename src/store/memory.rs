use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::error::{LibError, Result};
use crate::models::{GraphSnapshot, NodeKind, NodeSnapshot, Uid};
use crate::schema::SchemaField;
use crate::store::{GraphStore, Lookup, Mutation, MutationOutcome, Object, Subject};

/// In-process triple store with the same contract as the network backends.
///
/// Scalar predicates hold one value and a repeated set replaces it; uid
/// predicates hold a set of targets, so repeating an edge is a no-op. Clones
/// share the same graph.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    last_uid: u64,
    schema: BTreeMap<String, SchemaField>,
    nodes: BTreeMap<Uid, NodeSnapshot>,
    failing_values: BTreeSet<String>,
    mutations: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.lock();
        GraphSnapshot {
            nodes: inner.nodes.values().cloned().collect(),
        }
    }

    pub fn node(&self, uid: Uid) -> Option<NodeSnapshot> {
        self.inner.lock().nodes.get(&uid).cloned()
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.inner
            .lock()
            .nodes
            .values()
            .filter(|node| node.kind() == Some(kind))
            .count()
    }

    /// Number of committed mutations.
    pub fn mutation_count(&self) -> u64 {
        self.inner.lock().mutations
    }

    /// Makes every lookup or mutation that mentions `value` fail.
    pub fn fail_on_value(&self, value: &str) {
        self.inner.lock().failing_values.insert(value.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failing_values.clear();
    }
}

impl Inner {
    fn check_failing(&self, value: &str) -> Result<()> {
        if self.failing_values.contains(value) {
            return Err(LibError::store(
                "Graph store rejected the request",
                anyhow!("injected failure for value {value:?}"),
            ));
        }
        Ok(())
    }

    fn find(&self, kind: NodeKind, predicate: &str, value: &str) -> Result<Vec<Uid>> {
        self.check_failing(value)?;
        let indexed = self
            .schema
            .get(predicate)
            .is_some_and(SchemaField::is_exact_indexed);
        if !indexed {
            return Err(LibError::store(
                "Lookup predicate is not indexed",
                anyhow!("predicate {predicate} has no exact index"),
            ));
        }

        Ok(self
            .nodes
            .values()
            .filter(|node| node.kind() == Some(kind) && node.str_value(predicate) == Some(value))
            .map(|node| node.uid)
            .collect())
    }

    fn resolve_lookup(&self, lookup: &Lookup) -> Result<Option<Uid>> {
        let found = self.find(lookup.kind, &lookup.predicate, &lookup.value)?;
        Ok(found.first().copied())
    }

    fn allocate(&mut self) -> Uid {
        self.last_uid += 1;
        let uid = Uid(self.last_uid);
        self.nodes.insert(
            uid,
            NodeSnapshot {
                uid,
                ..NodeSnapshot::default()
            },
        );
        uid
    }

    fn subject_uid(&self, subject: &Subject, uids: &BTreeMap<String, Uid>) -> Option<Uid> {
        match subject {
            Subject::Var(var) => uids.get(var).copied(),
            Subject::Uid(uid) => self.nodes.contains_key(uid).then_some(*uid),
        }
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<MutationOutcome> {
        mutation.validate()?;
        for triple in &mutation.set {
            if let Object::Value(value) = &triple.object {
                if let Some(text) = value.as_str() {
                    self.check_failing(text)?;
                }
            }
        }

        let mut bound = BTreeMap::new();
        for lookup in &mutation.lookups {
            if let Some(uid) = self.resolve_lookup(lookup)? {
                bound.insert(lookup.var.clone(), uid);
            }
        }

        // Explicit uids must already exist; nothing is written until all are checked.
        for triple in &mutation.set {
            let subject_missing = matches!(triple.subject, Subject::Uid(uid) if !self.nodes.contains_key(&uid));
            let object_missing = matches!(triple.object, Object::Uid(uid) if !self.nodes.contains_key(&uid));
            if subject_missing || object_missing {
                return Err(LibError::store(
                    "Mutation references an unknown node",
                    anyhow!("unknown uid in triple {:?}", triple),
                ));
            }
        }

        let mut outcome = MutationOutcome::default();
        for var in mutation.vars() {
            let uid = match bound.get(var) {
                Some(uid) => *uid,
                None => {
                    outcome.created.insert(var.to_string());
                    self.allocate()
                }
            };
            outcome.uids.insert(var.to_string(), uid);
        }

        for triple in &mutation.set {
            let Some(subject) = self.subject_uid(&triple.subject, &outcome.uids) else {
                continue;
            };
            let target = match &triple.object {
                Object::Var(var) => outcome.uids.get(var).copied(),
                Object::Uid(uid) => Some(*uid),
                Object::Value(_) => None,
            };
            let Some(node) = self.nodes.get_mut(&subject) else {
                continue;
            };
            match (&triple.object, target) {
                (Object::Value(value), _) => {
                    node.values.insert(triple.predicate.clone(), value.clone());
                }
                (_, Some(target)) => {
                    node.edges
                        .entry(triple.predicate.clone())
                        .or_default()
                        .insert(target);
                }
                (_, None) => {}
            }
        }

        self.mutations += 1;
        Ok(outcome)
    }
}

impl GraphStore for MemoryStore {
    async fn declare_schema(&self, fields: &[SchemaField]) -> Result<()> {
        let mut inner = self.inner.lock();
        for field in fields {
            inner.schema.insert(field.predicate.to_string(), *field);
        }
        Ok(())
    }

    async fn lookup_all(&self, kind: NodeKind, predicate: &str, value: &str) -> Result<Vec<Uid>> {
        self.inner.lock().find(kind, predicate, value)
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<MutationOutcome> {
        let outcome = self.inner.lock().apply(mutation)?;
        tracing::debug!(
            created = outcome.created.len(),
            triples = mutation.set.len(),
            "memory store mutation committed"
        );
        Ok(outcome)
    }
}
