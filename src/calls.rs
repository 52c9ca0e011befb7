use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{CallRecord, NodeKind, Uid, Value, predicates};
use crate::resolve::{resolve_account, resolve_device};
use crate::store::{GraphStore, Mutation, Object, Subject};

pub(crate) const CALL_VAR: &str = "call";

/// Uids a call node points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallReferences {
    pub origin: Uid,
    pub destination: Uid,
    pub account: Uid,
}

/// Builds the call node triples; references may be existing uids or vars
/// bound in the same mutation.
pub(crate) fn call_mutation(
    record: &CallRecord,
    origin: Object,
    destination: Object,
    account: Object,
) -> Mutation {
    let call = || Subject::Var(CALL_VAR.to_string());
    Mutation::new()
        .set_value(
            call(),
            predicates::CALL_TIME,
            Value::DateTime(record.call_time.clone()),
        )
        .set_value(call(), predicates::LATITUDE, record.latitude)
        .set_value(call(), predicates::LONGITUDE, record.longitude)
        .set_value(call(), predicates::DURATION, record.duration)
        .set(call(), predicates::CALL_ORIGIN, origin)
        .set(call(), predicates::CALL_DESTINATION, destination)
        .set(call(), predicates::CALL_ACCOUNT, account)
        .set_type(call(), NodeKind::Call)
}

/// Resolves the three nodes a call for `record` must reference. None of them
/// is created here; a missing one is a consistency fault.
pub async fn resolve_call_references<S: GraphStore>(
    store: &S,
    record: &CallRecord,
) -> Result<CallReferences> {
    let origin = resolve_device(store, &record.imei_from)
        .await?
        .ok_or_else(|| missing("origin device", &record.imei_from))?;
    let destination = resolve_device(store, &record.imei_to)
        .await?
        .ok_or_else(|| missing("destination device", &record.imei_to))?;
    let account = resolve_account(store, &record.msdin)
        .await?
        .ok_or_else(|| missing("account", &record.msdin))?;

    Ok(CallReferences {
        origin,
        destination,
        account,
    })
}

/// Creates one new call node for `record`. Calls are never merged: writing the
/// same record twice yields two call nodes.
pub async fn write_call<S: GraphStore>(store: &S, record: &CallRecord) -> Result<Uid> {
    let refs = resolve_call_references(store, record).await?;
    let mutation = call_mutation(
        record,
        Object::Uid(refs.origin),
        Object::Uid(refs.destination),
        Object::Uid(refs.account),
    );
    let outcome = store.mutate(&mutation).await?;
    let call = outcome.uid(CALL_VAR)?;
    tracing::debug!(call = %call, msdin = %record.msdin, "call written");
    Ok(call)
}

fn missing(what: &'static str, identity: &str) -> LibError {
    LibError::consistency(
        "Call references a node that was not created",
        anyhow!("{what} {identity} could not be resolved"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::ingest_schema;
    use crate::store::MemoryStore;
    use crate::upsert::{upsert_account_and_link, upsert_devices};

    fn record() -> CallRecord {
        CallRecord {
            msdin: "5550001".to_string(),
            imei_from: "490154203237518".to_string(),
            imei_to: "490154203237519".to_string(),
            latitude: 37.77,
            longitude: -122.41,
            duration: 42.5,
            call_time: "2024-01-01T10:00:00Z".to_string(),
        }
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.declare_schema(&ingest_schema()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn refuses_to_write_without_resolved_references() {
        let store = store().await;
        let record = record();
        // Devices exist, account does not.
        upsert_devices(&store, &record).await.unwrap();

        let err = write_call(&store, &record).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Consistency);
        assert_eq!(store.count(NodeKind::Call), 0);
    }

    #[tokio::test]
    async fn call_carries_fields_and_references() {
        let store = store().await;
        let record = record();
        let devices = upsert_devices(&store, &record).await.unwrap();
        let account = upsert_account_and_link(&store, &record.msdin, devices)
            .await
            .unwrap();

        let call = write_call(&store, &record).await.unwrap();
        let node = store.node(call).unwrap();
        assert_eq!(node.kind(), Some(NodeKind::Call));
        assert_eq!(node.f64_value(predicates::DURATION), Some(42.5));
        assert_eq!(node.f64_value(predicates::LATITUDE), Some(37.77));
        assert_eq!(node.str_value(predicates::CALL_TIME), Some("2024-01-01T10:00:00Z"));
        assert!(node.has_edge(predicates::CALL_ORIGIN, devices.origin));
        assert!(node.has_edge(predicates::CALL_DESTINATION, devices.destination));
        assert!(node.has_edge(predicates::CALL_ACCOUNT, account));
    }

    #[tokio::test]
    async fn identical_records_produce_distinct_calls() {
        let store = store().await;
        let record = record();
        let devices = upsert_devices(&store, &record).await.unwrap();
        upsert_account_and_link(&store, &record.msdin, devices)
            .await
            .unwrap();

        let first = write_call(&store, &record).await.unwrap();
        let second = write_call(&store, &record).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.count(NodeKind::Call), 2);
    }
}
