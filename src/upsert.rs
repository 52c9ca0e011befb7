//! Device and account upserts.
//!
//! Each upsert is one query-then-mutate round trip: the lookup binds a
//! variable to the existing node when there is one, and the same mutation body
//! either refreshes that node or creates it. Identity values and type tags are
//! set unconditionally, which the store treats as a no-op when they already hold.
//!
//! A record's device upsert, account upsert and the two device back-references
//! are separate commits. A failure in a later step leaves the earlier ones in
//! place.

use crate::error::Result;
use crate::models::{CallRecord, DevicePair, NodeKind, Uid, predicates};
use crate::store::{GraphStore, Mutation, Object, Subject};

pub(crate) const ORIGIN_VAR: &str = "origin";
pub(crate) const DESTINATION_VAR: &str = "destination";
pub(crate) const ACCOUNT_VAR: &str = "account";

/// Var naming the destination device; a record whose two IMEIs match has one device.
pub(crate) fn destination_var(record: &CallRecord) -> &'static str {
    if record.imei_from == record.imei_to {
        ORIGIN_VAR
    } else {
        DESTINATION_VAR
    }
}

pub(crate) fn device_mutation(record: &CallRecord) -> Mutation {
    let origin = || Subject::Var(ORIGIN_VAR.to_string());
    let mut mutation = Mutation::new()
        .lookup(ORIGIN_VAR, NodeKind::Device, predicates::IMEI, &record.imei_from)
        .set_value(origin(), predicates::IMEI, record.imei_from.as_str())
        .set_type(origin(), NodeKind::Device);

    if destination_var(record) == DESTINATION_VAR {
        let destination = || Subject::Var(DESTINATION_VAR.to_string());
        mutation = mutation
            .lookup(DESTINATION_VAR, NodeKind::Device, predicates::IMEI, &record.imei_to)
            .set_value(destination(), predicates::IMEI, record.imei_to.as_str())
            .set_type(destination(), NodeKind::Device)
            .set(
                origin(),
                predicates::LINKED_TO,
                Object::Var(DESTINATION_VAR.to_string()),
            )
            .set(
                destination(),
                predicates::LINKED_TO,
                Object::Var(ORIGIN_VAR.to_string()),
            );
    }
    mutation
}

pub(crate) fn account_mutation(msdin: &str, origin: Object, destination: Object) -> Mutation {
    let account = || Subject::Var(ACCOUNT_VAR.to_string());
    Mutation::new()
        .lookup(ACCOUNT_VAR, NodeKind::Account, predicates::MSDIN, msdin)
        .set_value(account(), predicates::MSDIN, msdin)
        .set_type(account(), NodeKind::Account)
        .set(account(), predicates::ORIGIN_DEVICES, origin)
        .set(account(), predicates::DESTINATION_DEVICES, destination)
}

pub(crate) fn back_reference_mutation(device: Subject, predicate: &str, account: Object) -> Mutation {
    Mutation::new().set(device, predicate, account)
}

/// Ensures both devices of `record` exist and link to each other.
pub async fn upsert_devices<S: GraphStore>(store: &S, record: &CallRecord) -> Result<DevicePair> {
    let outcome = store.mutate(&device_mutation(record)).await?;
    let pair = DevicePair {
        origin: outcome.uid(ORIGIN_VAR)?,
        destination: outcome.uid(destination_var(record))?,
    };
    tracing::debug!(
        imei_from = %record.imei_from,
        imei_to = %record.imei_to,
        origin = %pair.origin,
        destination = %pair.destination,
        origin_created = outcome.was_created(ORIGIN_VAR),
        destination_created = outcome.was_created(DESTINATION_VAR),
        "devices upserted"
    );
    Ok(pair)
}

/// Ensures the account for `msdin` exists and points at both devices.
pub async fn upsert_account<S: GraphStore>(
    store: &S,
    msdin: &str,
    devices: DevicePair,
) -> Result<Uid> {
    let mutation = account_mutation(
        msdin,
        Object::Uid(devices.origin),
        Object::Uid(devices.destination),
    );
    let outcome = store.mutate(&mutation).await?;
    let account = outcome.uid(ACCOUNT_VAR)?;
    tracing::debug!(
        msdin,
        account = %account,
        created = outcome.was_created(ACCOUNT_VAR),
        "account upserted"
    );
    Ok(account)
}

/// Writes `incoming_msdin` on the origin device, then `outgoing_msdin` on the
/// destination device, each as its own commit.
pub async fn link_devices_to_account<S: GraphStore>(
    store: &S,
    account: Uid,
    devices: DevicePair,
) -> Result<()> {
    let incoming = back_reference_mutation(
        Subject::Uid(devices.origin),
        predicates::INCOMING_MSDIN,
        Object::Uid(account),
    );
    store.mutate(&incoming).await?;

    let outgoing = back_reference_mutation(
        Subject::Uid(devices.destination),
        predicates::OUTGOING_MSDIN,
        Object::Uid(account),
    );
    store.mutate(&outgoing).await?;
    Ok(())
}

/// Account upsert followed by both device back-references.
pub async fn upsert_account_and_link<S: GraphStore>(
    store: &S,
    msdin: &str,
    devices: DevicePair,
) -> Result<Uid> {
    let account = upsert_account(store, msdin, devices).await?;
    link_devices_to_account(store, account, devices).await?;
    Ok(account)
}
