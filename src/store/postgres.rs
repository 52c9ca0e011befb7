//! Postgres-backed triple store.
//!
//! Nodes, scalar values and edges live in three tables under the `imei_graph`
//! schema. Each mutation runs inside one SQL transaction: lookups, node
//! allocation and every triple commit together or not at all. Before resolving
//! its lookups a mutation takes a transaction-scoped advisory lock per identity,
//! so two processes upserting the same device or account serialize.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::error::{LibError, Result};
use crate::models::{GraphSnapshot, NodeKind, NodeSnapshot, Uid, Value, predicates};
use crate::schema::{IndexKind, SchemaField};
use crate::store::{GraphStore, Mutation, MutationOutcome, Object, Subject};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_graph_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct ValueRow {
    uid: i64,
    predicate: String,
    value_type: String,
    value: String,
}

#[derive(Debug, Clone, FromRow)]
struct EdgeRow {
    uid: i64,
    predicate: String,
    target: i64,
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::store(public, anyhow!(err))
}

fn encode_value(value: &Value) -> (&'static str, String) {
    match value {
        Value::String(text) => ("string", text.clone()),
        Value::Float(number) => ("float", number.to_string()),
        Value::DateTime(text) => ("datetime", text.clone()),
    }
}

fn decode_value(value_type: &str, value: String) -> Option<Value> {
    match value_type {
        "string" => Some(Value::String(value)),
        "float" => value.parse().ok().map(Value::Float),
        "datetime" => Some(Value::DateTime(value)),
        _ => None,
    }
}

/// Advisory lock keys for the identities a mutation looks up, in a fixed order.
fn lock_keys(mutation: &Mutation) -> Vec<String> {
    mutation
        .lookups
        .iter()
        .map(|lookup| format!("{}:{}:{}", lookup.kind, lookup.predicate, lookup.value))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn uid_param(uid: Uid) -> i64 {
    uid.0 as i64
}

fn uid_from_row(uid: i64) -> Uid {
    Uid(uid as u64)
}

#[derive(Debug, Clone)]
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool and brings the graph tables up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|err| LibError::transport("Failed to connect to postgres", anyhow!(err)))?;
        create_graph_tables(&pool)
            .await
            .map_err(|err| LibError::store("Failed to run graph migrations", anyhow!(err)))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Reads the whole graph; meant for audits and tests on small graphs.
    pub async fn snapshot(&self) -> Result<GraphSnapshot> {
        let uids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT uid
            FROM imei_graph.nodes
            ORDER BY uid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to load nodes", err))?;

        let values: Vec<ValueRow> = sqlx::query_as(
            r#"
            SELECT uid, predicate, value_type, value
            FROM imei_graph.node_values
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to load node values", err))?;

        let edges: Vec<EdgeRow> = sqlx::query_as(
            r#"
            SELECT uid, predicate, target
            FROM imei_graph.node_edges
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to load node edges", err))?;

        let mut nodes: BTreeMap<Uid, NodeSnapshot> = uids
            .into_iter()
            .map(|(uid,)| {
                let uid = uid_from_row(uid);
                (
                    uid,
                    NodeSnapshot {
                        uid,
                        ..NodeSnapshot::default()
                    },
                )
            })
            .collect();

        for row in values {
            let Some(value) = decode_value(&row.value_type, row.value) else {
                tracing::warn!(
                    uid = row.uid,
                    predicate = %row.predicate,
                    value_type = %row.value_type,
                    "skipping undecodable value"
                );
                continue;
            };
            if let Some(node) = nodes.get_mut(&uid_from_row(row.uid)) {
                node.values.insert(row.predicate, value);
            }
        }
        for row in edges {
            if let Some(node) = nodes.get_mut(&uid_from_row(row.uid)) {
                node.edges
                    .entry(row.predicate)
                    .or_default()
                    .insert(uid_from_row(row.target));
            }
        }

        Ok(GraphSnapshot {
            nodes: nodes.into_values().collect(),
        })
    }
}

async fn ensure_exact_index(conn: &mut PgConnection, predicate: &str) -> Result<()> {
    let declared: Option<(Option<String>,)> = sqlx::query_as(
        r#"
        SELECT index_kind
        FROM imei_graph.predicates
        WHERE name = $1
        "#,
    )
    .bind(predicate)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to read predicate schema", err))?;

    match declared {
        Some((Some(index),)) if index == IndexKind::Exact.as_db_value() => Ok(()),
        _ => Err(LibError::store(
            "Lookup predicate is not indexed",
            anyhow!("predicate {predicate} has no exact index"),
        )),
    }
}

async fn find_uids(
    conn: &mut PgConnection,
    kind: NodeKind,
    predicate: &str,
    value: &str,
) -> Result<Vec<Uid>> {
    ensure_exact_index(conn, predicate).await?;

    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT v.uid
        FROM imei_graph.node_values v
        JOIN imei_graph.node_values t
          ON t.uid = v.uid
         AND t.predicate = $1
         AND t.value = $2
        WHERE v.predicate = $3
          AND v.value = $4
        ORDER BY v.uid
        "#,
    )
    .bind(predicates::TYPE)
    .bind(kind.as_db_value())
    .bind(predicate)
    .bind(value)
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to look up node", err))?;

    Ok(rows.into_iter().map(|(uid,)| uid_from_row(uid)).collect())
}

impl GraphStore for PgGraphStore {
    async fn declare_schema(&self, fields: &[SchemaField]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to begin transaction", err))?;

        for field in fields {
            sqlx::query(
                r#"
                INSERT INTO imei_graph.predicates (name, value_type, list, index_kind, upsert)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (name) DO UPDATE
                SET value_type = EXCLUDED.value_type,
                    list = EXCLUDED.list,
                    index_kind = EXCLUDED.index_kind,
                    upsert = EXCLUDED.upsert
                "#,
            )
            .bind(field.predicate)
            .bind(field.value_type.as_db_value())
            .bind(field.list)
            .bind(field.index.map(IndexKind::as_db_value))
            .bind(field.upsert)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to declare schema", err))?;
        }

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit schema", err))?;
        tracing::info!(predicates = fields.len(), "postgres schema declared");
        Ok(())
    }

    async fn lookup_all(&self, kind: NodeKind, predicate: &str, value: &str) -> Result<Vec<Uid>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| db_err("Failed to acquire connection", err))?;
        find_uids(&mut conn, kind, predicate, value).await
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<MutationOutcome> {
        mutation.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to begin transaction", err))?;

        for key in lock_keys(mutation) {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(|err| db_err("Failed to lock identity", err))?;
        }

        let mut bound = BTreeMap::new();
        for lookup in &mutation.lookups {
            let found = find_uids(&mut tx, lookup.kind, &lookup.predicate, &lookup.value).await?;
            if let Some(uid) = found.first() {
                bound.insert(lookup.var.as_str(), *uid);
            }
        }

        let explicit: BTreeSet<i64> = mutation
            .set
            .iter()
            .flat_map(|triple| {
                let subject = match triple.subject {
                    Subject::Uid(uid) => Some(uid_param(uid)),
                    Subject::Var(_) => None,
                };
                let object = match triple.object {
                    Object::Uid(uid) => Some(uid_param(uid)),
                    _ => None,
                };
                subject.into_iter().chain(object)
            })
            .collect();
        if !explicit.is_empty() {
            let existing: Vec<(i64,)> = sqlx::query_as(
                r#"
                SELECT uid
                FROM imei_graph.nodes
                WHERE uid = ANY($1)
                "#,
            )
            .bind(explicit.iter().copied().collect::<Vec<_>>())
            .fetch_all(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to check referenced nodes", err))?;
            if existing.len() != explicit.len() {
                let existing = existing.into_iter().map(|(uid,)| uid).collect::<BTreeSet<_>>();
                let missing = explicit.difference(&existing).collect::<Vec<_>>();
                return Err(LibError::store(
                    "Mutation references an unknown node",
                    anyhow!("unknown uids {missing:?}"),
                ));
            }
        }

        let mut outcome = MutationOutcome::default();
        for var in mutation.vars() {
            let uid = match bound.get(var) {
                Some(uid) => *uid,
                None => {
                    let (uid,): (i64,) = sqlx::query_as(
                        r#"
                        INSERT INTO imei_graph.nodes DEFAULT VALUES
                        RETURNING uid
                        "#,
                    )
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|err| db_err("Failed to allocate node", err))?;
                    outcome.created.insert(var.to_string());
                    uid_from_row(uid)
                }
            };
            outcome.uids.insert(var.to_string(), uid);
        }

        for triple in &mutation.set {
            let subject = match &triple.subject {
                Subject::Var(var) => outcome.uid(var)?,
                Subject::Uid(uid) => *uid,
            };
            let target = match &triple.object {
                Object::Value(value) => {
                    let (value_type, text) = encode_value(value);
                    sqlx::query(
                        r#"
                        INSERT INTO imei_graph.node_values (uid, predicate, value_type, value)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (uid, predicate) DO UPDATE
                        SET value_type = EXCLUDED.value_type,
                            value = EXCLUDED.value
                        "#,
                    )
                    .bind(uid_param(subject))
                    .bind(&triple.predicate)
                    .bind(value_type)
                    .bind(text)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| db_err("Failed to write value", err))?;
                    continue;
                }
                Object::Var(var) => outcome.uid(var)?,
                Object::Uid(uid) => *uid,
            };
            sqlx::query(
                r#"
                INSERT INTO imei_graph.node_edges (uid, predicate, target)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(uid_param(subject))
            .bind(&triple.predicate)
            .bind(uid_param(target))
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to write edge", err))?;
        }

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit mutation", err))?;
        tracing::debug!(
            created = outcome.created.len(),
            triples = mutation.set.len(),
            "postgres mutation committed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_encoding() {
        for value in [
            Value::from("490154203237518"),
            Value::Float(-122.41),
            Value::Float(42.0),
            Value::DateTime("2024-01-01T10:00:00Z".to_string()),
        ] {
            let (value_type, text) = encode_value(&value);
            assert_eq!(decode_value(value_type, text), Some(value));
        }
        assert_eq!(decode_value("float", "abc".to_string()), None);
        assert_eq!(decode_value("geo", "x".to_string()), None);
    }

    #[test]
    fn lock_keys_are_sorted_and_unique() {
        let mutation = Mutation::new()
            .lookup("b", NodeKind::Device, predicates::IMEI, "20")
            .lookup("a", NodeKind::Device, predicates::IMEI, "10")
            .lookup("c", NodeKind::Device, predicates::IMEI, "10");
        assert_eq!(lock_keys(&mutation), ["device:IMEI:10", "device:IMEI:20"]);
    }

    #[test]
    fn uids_map_to_bigint_and_back() {
        let uid = Uid(0x2a);
        assert_eq!(uid_from_row(uid_param(uid)), uid);
    }
}
