//! Dgraph over its HTTP API.
//!
//! Lookups are sent as GraphQL+- queries whose values travel as query
//! variables. An upsert is one Dgraph transaction: a `/query` round trip binds
//! the mutation's lookup variables and opens the transaction, then `/mutate`
//! with that `startTs` commits the JSON mutation. Identity predicates carry
//! `@upsert`, so a concurrent writer creating the same identity aborts at commit.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::anyhow;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};

use crate::error::{LibError, Result};
use crate::models::{NodeKind, Uid, Value, predicates};
use crate::schema::{SchemaField, render_schema};
use crate::store::{GraphStore, Lookup, Mutation, MutationOutcome, Object, Subject};

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    variables: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Response<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<ServerError>,
    #[serde(default)]
    extensions: Option<Extensions>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Extensions {
    txn: Option<TxnContext>,
}

#[derive(Debug, Deserialize)]
struct TxnContext {
    start_ts: u64,
}

#[derive(Debug, Deserialize)]
struct UidRow {
    uid: String,
}

#[derive(Debug, Default, Deserialize)]
struct MutateData {
    #[serde(default)]
    uids: BTreeMap<String, String>,
}

type QueryData = BTreeMap<String, Vec<UidRow>>;

/// Query text and variables binding every lookup of a mutation. Each lookup
/// becomes a block named after its variable.
fn lookup_query(lookups: &[Lookup]) -> (String, BTreeMap<String, String>) {
    let mut params = Vec::with_capacity(lookups.len());
    let mut blocks = String::new();
    let mut variables = BTreeMap::new();
    for (index, lookup) in lookups.iter().enumerate() {
        let param = format!("$v{index}");
        params.push(format!("{param}: string"));
        blocks.push_str(&format!(
            "  {}(func: eq(<{}>, {param})) @filter(eq(<{}>, \"{}\")) {{ uid }}\n",
            lookup.var,
            lookup.predicate,
            predicates::TYPE,
            lookup.kind.as_db_value(),
        ));
        variables.insert(param, lookup.value.clone());
    }
    let query = format!("query q({}) {{\n{blocks}}}", params.join(", "));
    (query, variables)
}

fn parse_uid(raw: &str) -> Result<Uid> {
    Uid::from_str(raw).map_err(|err| {
        LibError::store(
            "Graph store returned a malformed uid",
            anyhow!("{raw:?}: {err}"),
        )
    })
}

fn sorted_uids(rows: Vec<UidRow>) -> Result<Vec<Uid>> {
    let mut uids = rows
        .iter()
        .map(|row| parse_uid(&row.uid))
        .collect::<Result<Vec<_>>>()?;
    uids.sort();
    Ok(uids)
}

fn node_ref(var: &str, bound: &BTreeMap<String, Uid>) -> String {
    match bound.get(var) {
        Some(uid) => uid.to_string(),
        None => format!("_:{var}"),
    }
}

/// JSON has no encoding for NaN or infinity; serde_json would write `null`
/// and Dgraph would drop the predicate.
fn json_value(predicate: &str, value: &Value) -> Result<serde_json::Value> {
    match value {
        Value::String(text) | Value::DateTime(text) => Ok(json!(text)),
        Value::Float(number) if number.is_finite() => Ok(json!(number)),
        Value::Float(number) => Err(LibError::invalid(
            "Value cannot be stored",
            anyhow!("{predicate} is not a finite number: {number}"),
        )),
    }
}

/// The `set` list of a JSON mutation, one object per subject. Vars bound by
/// a lookup become their uid, the rest become blank nodes.
fn mutation_body(
    mutation: &Mutation,
    bound: &BTreeMap<String, Uid>,
) -> Result<serde_json::Value> {
    let mut subjects: BTreeMap<String, Map<String, serde_json::Value>> = BTreeMap::new();
    for triple in &mutation.set {
        let subject = match &triple.subject {
            Subject::Var(var) => node_ref(var, bound),
            Subject::Uid(uid) => uid.to_string(),
        };
        let object = match &triple.object {
            Object::Var(var) => json!({ "uid": node_ref(var, bound) }),
            Object::Uid(uid) => json!({ "uid": uid.to_string() }),
            Object::Value(value) => json_value(&triple.predicate, value)?,
        };
        let entry = subjects.entry(subject.clone()).or_insert_with(|| {
            let mut map = Map::new();
            map.insert("uid".to_string(), json!(subject));
            map
        });
        match entry.get_mut(&triple.predicate) {
            // Repeated edges on one subject go out as a list.
            Some(serde_json::Value::Array(items)) if !matches!(triple.object, Object::Value(_)) => {
                if !items.contains(&object) {
                    items.push(object);
                }
            }
            Some(existing) if !matches!(triple.object, Object::Value(_)) && *existing != object => {
                let first = existing.take();
                *existing = serde_json::Value::Array(vec![first, object]);
            }
            _ => {
                entry.insert(triple.predicate.clone(), object);
            }
        }
    }
    Ok(json!({ "set": subjects.into_values().collect::<Vec<_>>() }))
}

fn decode_response<T: DeserializeOwned>(body: &[u8]) -> Result<Response<T>> {
    let parsed: Response<T> = serde_json::from_slice(body).map_err(|err| {
        LibError::store("Graph store response could not be decoded", anyhow!(err))
    })?;
    if let Some(err) = server_errors(&parsed.errors) {
        return Err(err);
    }
    Ok(parsed)
}

fn server_errors(errors: &[ServerError]) -> Option<LibError> {
    if errors.is_empty() {
        return None;
    }
    let messages = errors
        .iter()
        .map(|err| err.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    Some(LibError::store(
        "Graph store rejected the request",
        anyhow!(messages),
    ))
}

#[derive(Debug, Clone)]
pub struct DgraphStore {
    client: Client,
    base_url: String,
}

impl DgraphStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Fails with a transport error when the server cannot be reached.
    pub async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LibError::transport(
                "Graph store is unhealthy",
                anyhow!("health check returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn read<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Response<T>> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LibError::store(
                "Graph store request failed",
                anyhow!("status {status}: {body}"),
            ));
        }
        let body = response.bytes().await?;
        decode_response(&body)
    }

    async fn query(
        &self,
        query: &str,
        variables: BTreeMap<String, String>,
    ) -> Result<(QueryData, Option<u64>)> {
        let request = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&QueryRequest { query, variables });
        let response: Response<QueryData> = self.read(request).await?;
        let start_ts = response
            .extensions
            .and_then(|extensions| extensions.txn)
            .map(|txn| txn.start_ts);
        Ok((response.data.unwrap_or_default(), start_ts))
    }
}

impl GraphStore for DgraphStore {
    async fn declare_schema(&self, fields: &[SchemaField]) -> Result<()> {
        let request = self
            .client
            .post(format!("{}/alter", self.base_url))
            .body(render_schema(fields));
        let _: Response<serde_json::Value> = self.read(request).await?;
        tracing::info!(predicates = fields.len(), "dgraph schema altered");
        Ok(())
    }

    async fn lookup_all(&self, kind: NodeKind, predicate: &str, value: &str) -> Result<Vec<Uid>> {
        let lookup = Lookup {
            var: "nodes".to_string(),
            kind,
            predicate: predicate.to_string(),
            value: value.to_string(),
        };
        let mutation = Mutation {
            lookups: vec![lookup],
            set: Vec::new(),
        };
        mutation.validate()?;
        let (query, variables) = lookup_query(&mutation.lookups);
        let (mut data, _) = self.query(&query, variables).await?;
        sorted_uids(data.remove("nodes").unwrap_or_default())
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<MutationOutcome> {
        mutation.validate()?;

        let mut bound = BTreeMap::new();
        let mut start_ts = None;
        if !mutation.lookups.is_empty() {
            let (query, variables) = lookup_query(&mutation.lookups);
            let (mut data, ts) = self.query(&query, variables).await?;
            start_ts = ts;
            for lookup in &mutation.lookups {
                let uids = sorted_uids(data.remove(&lookup.var).unwrap_or_default())?;
                if let Some(uid) = uids.first() {
                    bound.insert(lookup.var.clone(), *uid);
                }
            }
        }

        let url = match start_ts {
            Some(ts) => format!("{}/mutate?startTs={ts}&commitNow=true", self.base_url),
            None => format!("{}/mutate?commitNow=true", self.base_url),
        };
        let body = mutation_body(mutation, &bound)?;
        let request = self.client.post(url).json(&body);
        let response: Response<MutateData> = self.read(request).await?;
        let created = response.data.unwrap_or_default().uids;

        let mut outcome = MutationOutcome::default();
        for var in mutation.vars() {
            if let Some(uid) = bound.get(var) {
                outcome.uids.insert(var.to_string(), *uid);
            } else if let Some(raw) = created.get(var) {
                outcome.uids.insert(var.to_string(), parse_uid(raw)?);
                outcome.created.insert(var.to_string());
            }
        }
        tracing::debug!(
            start_ts,
            created = outcome.created.len(),
            triples = mutation.set.len(),
            "dgraph mutation committed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn upsert() -> Mutation {
        Mutation::new()
            .lookup("origin", NodeKind::Device, predicates::IMEI, "4901\" } evil")
            .lookup("destination", NodeKind::Device, predicates::IMEI, "4902")
            .set_value(Subject::Var("origin".into()), predicates::IMEI, "4901")
            .set_type(Subject::Var("origin".into()), NodeKind::Device)
            .set(
                Subject::Var("origin".into()),
                predicates::LINKED_TO,
                Object::Var("destination".into()),
            )
            .set(
                Subject::Var("destination".into()),
                predicates::LINKED_TO,
                Object::Var("origin".into()),
            )
    }

    #[test]
    fn lookup_values_travel_as_variables() {
        let (query, variables) = lookup_query(&upsert().lookups);
        assert_eq!(
            query,
            "query q($v0: string, $v1: string) {\n\
             \x20 origin(func: eq(<IMEI>, $v0)) @filter(eq(<dgraph.type>, \"device\")) { uid }\n\
             \x20 destination(func: eq(<IMEI>, $v1)) @filter(eq(<dgraph.type>, \"device\")) { uid }\n\
             }"
        );
        assert!(!query.contains("evil"));
        assert_eq!(variables["$v0"], "4901\" } evil");
        assert_eq!(variables["$v1"], "4902");
    }

    #[test]
    fn bound_vars_use_uids_and_unbound_vars_use_blank_nodes() {
        let bound = BTreeMap::from([("origin".to_string(), Uid(0x1a))]);
        let body = mutation_body(&upsert(), &bound).unwrap();
        assert_eq!(
            body,
            json!({
                "set": [
                    { "uid": "0x1a", "IMEI": "4901", "dgraph.type": "device", "imeis_to": { "uid": "_:destination" } },
                    { "uid": "_:destination", "imeis_to": { "uid": "0x1a" } },
                ]
            })
        );
    }

    #[test]
    fn repeated_edges_become_lists_and_floats_stay_numbers() {
        let mutation = Mutation::new()
            .set(Subject::Uid(Uid(1)), predicates::LINKED_TO, Object::Uid(Uid(2)))
            .set(Subject::Uid(Uid(1)), predicates::LINKED_TO, Object::Uid(Uid(3)))
            .set(Subject::Uid(Uid(1)), predicates::LINKED_TO, Object::Uid(Uid(3)))
            .set_value(Subject::Var("call".into()), predicates::DURATION, 42.5);
        let body = mutation_body(&mutation, &BTreeMap::new()).unwrap();
        assert_eq!(
            body["set"][0],
            json!({ "uid": "0x1", "imeis_to": [{ "uid": "0x2" }, { "uid": "0x3" }] })
        );
        assert_eq!(body["set"][1], json!({ "uid": "_:call", "duration": 42.5 }));
    }

    #[test]
    fn responses_decode_uids_and_errors() {
        let response: Response<MutateData> = serde_json::from_value(json!({
            "data": { "code": "Success", "message": "Done", "uids": { "call": "0x2b" } },
            "extensions": { "txn": { "start_ts": 17 } }
        }))
        .unwrap();
        assert_eq!(parse_uid(&response.data.unwrap().uids["call"]).unwrap(), Uid(0x2b));

        let response: Response<QueryData> = serde_json::from_value(json!({
            "errors": [{ "message": "Predicate IMEI is not indexed" }]
        }))
        .unwrap();
        let err = server_errors(&response.errors).unwrap();
        assert!(err.is_store());
        assert!(err.to_string().contains("not indexed"));
    }

    #[test]
    fn non_finite_floats_are_refused_instead_of_written_as_null() {
        for number in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let mutation = Mutation::new()
                .set_type(Subject::Var("call".into()), NodeKind::Call)
                .set_value(Subject::Var("call".into()), predicates::LATITUDE, number);
            let err = mutation_body(&mutation, &BTreeMap::new()).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput);
            assert!(err.to_string().contains("latitude"));
        }
    }

    #[test]
    fn decoding_does_not_require_default_data() {
        let response: Response<UidRow> =
            decode_response(br#"{"data": {"uid": "0x7"}}"#).unwrap();
        assert_eq!(parse_uid(&response.data.unwrap().uid).unwrap(), Uid(7));

        let response: Response<UidRow> = decode_response(br#"{"errors": []}"#).unwrap();
        assert!(response.data.is_none());

        let err = decode_response::<UidRow>(br#"{"errors": [{"message": "txn aborted"}]}"#)
            .unwrap_err();
        assert!(err.is_store());
        assert!(decode_response::<UidRow>(b"<html>").unwrap_err().is_store());
    }

    #[test]
    fn lookup_results_are_sorted() {
        let rows = vec![
            UidRow { uid: "0x10".into() },
            UidRow { uid: "0x2".into() },
        ];
        assert_eq!(sorted_uids(rows).unwrap(), [Uid(2), Uid(16)]);
        assert!(sorted_uids(vec![UidRow { uid: "zz".into() }]).is_err());
    }
}
