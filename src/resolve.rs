//! Point lookups from an identifying attribute to a node uid.
//!
//! `Ok(None)` means the node has not been created yet; callers on the upsert
//! path treat it as "needs creation".

use crate::error::Result;
use crate::models::{NodeKind, Uid, predicates};
use crate::store::GraphStore;

pub async fn resolve_device<S: GraphStore>(store: &S, imei: &str) -> Result<Option<Uid>> {
    store.lookup(NodeKind::Device, predicates::IMEI, imei).await
}

pub async fn resolve_account<S: GraphStore>(store: &S, msdin: &str) -> Result<Option<Uid>> {
    store.lookup(NodeKind::Account, predicates::MSDIN, msdin).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ingest_schema;
    use crate::store::{MemoryStore, Mutation, Subject};

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.declare_schema(&ingest_schema()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn unseen_identities_are_not_found() {
        let store = store().await;
        assert_eq!(resolve_device(&store, "490154203237518").await.unwrap(), None);
        assert_eq!(resolve_account(&store, "5550001").await.unwrap(), None);
    }

    #[tokio::test]
    async fn other_kinds_do_not_cross_resolve() {
        let store = store().await;
        let account = Mutation::new()
            .set_value(Subject::Var("a".into()), predicates::IMEI, "777")
            .set_value(Subject::Var("a".into()), predicates::MSDIN, "777")
            .set_type(Subject::Var("a".into()), NodeKind::Account);
        let account_uid = store.mutate(&account).await.unwrap().uid("a").unwrap();

        assert_eq!(resolve_device(&store, "777").await.unwrap(), None);
        assert_eq!(resolve_account(&store, "777").await.unwrap(), Some(account_uid));

        let device = Mutation::new()
            .set_value(Subject::Var("d".into()), predicates::IMEI, "777")
            .set_type(Subject::Var("d".into()), NodeKind::Device);
        let device_uid = store.mutate(&device).await.unwrap().uid("d").unwrap();

        assert_ne!(device_uid, account_uid);
        assert_eq!(resolve_device(&store, "777").await.unwrap(), Some(device_uid));
    }
}
