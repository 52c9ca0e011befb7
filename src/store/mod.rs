//! The graph store protocol.
//!
//! Every interaction is a schema declaration, a point lookup, or a
//! query-then-mutate round trip ([`Mutation`]). A mutation names its targets
//! through variables: a variable bound by one of the mutation's lookups refers
//! to the node that lookup found, any other variable refers to a node the store
//! allocates for this mutation. Values never appear inside query text.

#[cfg(feature = "dgraph")]
pub mod dgraph;
pub mod memory;
#[cfg(feature = "sqlx")]
pub mod postgres;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{NodeKind, Uid, Value, predicates};
use crate::schema::SchemaField;

pub use memory::MemoryStore;

pub trait GraphStore: Send + Sync {
    fn declare_schema(&self, fields: &[SchemaField]) -> impl Future<Output = Result<()>> + Send;

    /// Uids of every node of `kind` whose `predicate` equals `value`, lowest first.
    fn lookup_all(
        &self,
        kind: NodeKind,
        predicate: &str,
        value: &str,
    ) -> impl Future<Output = Result<Vec<Uid>>> + Send;

    /// Runs the mutation's lookups and its triples as one committed unit.
    fn mutate(&self, mutation: &Mutation) -> impl Future<Output = Result<MutationOutcome>> + Send;

    fn lookup(
        &self,
        kind: NodeKind,
        predicate: &str,
        value: &str,
    ) -> impl Future<Output = Result<Option<Uid>>> + Send {
        async move {
            let uids = self.lookup_all(kind, predicate, value).await?;
            if uids.len() > 1 {
                tracing::warn!(
                    kind = %kind,
                    predicate,
                    value,
                    count = uids.len(),
                    "identity resolves to more than one node"
                );
            }
            Ok(uids.into_iter().next())
        }
    }
}

/// Binds `var` to the node of `kind` whose `predicate` equals `value`, if one exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub var: String,
    pub kind: NodeKind,
    pub predicate: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    Var(String),
    Uid(Uid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Var(String),
    Uid(Uid),
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Triple {
    pub subject: Subject,
    pub predicate: String,
    pub object: Object,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub lookups: Vec<Lookup>,
    pub set: Vec<Triple>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(
        mut self,
        var: &str,
        kind: NodeKind,
        predicate: &str,
        value: impl Into<String>,
    ) -> Self {
        self.lookups.push(Lookup {
            var: var.to_string(),
            kind,
            predicate: predicate.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn set(mut self, subject: Subject, predicate: &str, object: Object) -> Self {
        self.set.push(Triple {
            subject,
            predicate: predicate.to_string(),
            object,
        });
        self
    }

    pub fn set_value(self, subject: Subject, predicate: &str, value: impl Into<Value>) -> Self {
        self.set(subject, predicate, Object::Value(value.into()))
    }

    pub fn set_type(self, subject: Subject, kind: NodeKind) -> Self {
        self.set_value(subject, predicates::TYPE, kind.as_db_value())
    }

    pub fn extend(mut self, other: Mutation) -> Self {
        self.lookups.extend(other.lookups);
        self.set.extend(other.set);
        self
    }

    pub fn vars(&self) -> BTreeSet<&str> {
        let mut vars = BTreeSet::new();
        for lookup in &self.lookups {
            vars.insert(lookup.var.as_str());
        }
        for triple in &self.set {
            if let Subject::Var(var) = &triple.subject {
                vars.insert(var.as_str());
            }
            if let Object::Var(var) = &triple.object {
                vars.insert(var.as_str());
            }
        }
        vars
    }

    /// Vars that a mutation lookup may bind; all others allocate new nodes.
    pub fn bound_vars(&self) -> BTreeSet<&str> {
        self.lookups.iter().map(|lookup| lookup.var.as_str()).collect()
    }

    /// Rejects mutations whose shape no backend can apply.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for lookup in &self.lookups {
            if !seen.insert(lookup.var.as_str()) {
                return Err(LibError::invalid_with_code(
                    "mutation_duplicate_lookup",
                    "Mutation binds the same variable twice",
                    anyhow!("variable {} is bound by more than one lookup", lookup.var),
                ));
            }
        }
        for var in self.vars() {
            if !is_valid_name(var) {
                return Err(LibError::invalid_with_code(
                    "mutation_invalid_variable",
                    "Mutation variable name is invalid",
                    anyhow!("invalid variable name {var:?}"),
                ));
            }
        }
        let predicates = self
            .lookups
            .iter()
            .map(|lookup| lookup.predicate.as_str())
            .chain(self.set.iter().map(|triple| triple.predicate.as_str()));
        for predicate in predicates {
            if !is_valid_predicate(predicate) {
                return Err(LibError::invalid_with_code(
                    "mutation_invalid_predicate",
                    "Mutation predicate name is invalid",
                    anyhow!("invalid predicate name {predicate:?}"),
                ));
            }
        }
        Ok(())
    }
}

/// Textual triple-pattern form, used for debug logging.
impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for lookup in &self.lookups {
            writeln!(
                f,
                "{} as uid(type({}), eq({}, {:?}))",
                lookup.var, lookup.kind, lookup.predicate, lookup.value
            )?;
        }
        for triple in &self.set {
            match &triple.subject {
                Subject::Var(var) => write!(f, "uid({var})")?,
                Subject::Uid(uid) => write!(f, "<{uid}>")?,
            }
            write!(f, " <{}> ", triple.predicate)?;
            match &triple.object {
                Object::Var(var) => write!(f, "uid({var})")?,
                Object::Uid(uid) => write!(f, "<{uid}>")?,
                Object::Value(value) => write!(f, "{value}")?,
            }
            writeln!(f, " .")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Final uid of every variable in the mutation.
    pub uids: BTreeMap<String, Uid>,
    /// Variables that were not bound and got a newly allocated node.
    pub created: BTreeSet<String>,
}

impl MutationOutcome {
    pub fn uid(&self, var: &str) -> Result<Uid> {
        self.uids.get(var).copied().ok_or_else(|| {
            LibError::store(
                "Store did not return a uid for a mutation variable",
                anyhow!("missing uid for variable {var}"),
            )
        })
    }

    pub fn was_created(&self, var: &str) -> bool {
        self.created.contains(var)
    }
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn is_valid_predicate(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
