pub mod calls;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod invariants;
pub mod models;
pub mod resolve;
pub mod schema;
pub mod sheet;
pub mod store;
pub mod upsert;
pub mod validate;

pub mod prelude {
    pub use crate::calls::{CallReferences, resolve_call_references, write_call};
    pub use crate::config::{IngestConfig, StoreBackend};
    pub use crate::error::{ErrorKind, LibError, Result};
    #[cfg(feature = "grpc")]
    pub use crate::fetch::grpc::{GrpcFileSource, XlsxServiceServer};
    pub use crate::fetch::{ChunkStream, FileSource, LocalFileSource, fetch_file};
    pub use crate::ingest::{
        CommitMode, FailurePolicy, IngestOptions, IngestReport, Ingestor, RecordFailure,
        RecordOutcome,
    };
    pub use crate::invariants::{ensure_graph_invariants, graph_invariant_violations};
    pub use crate::models::{
        CallRecord, DevicePair, GraphInvariantViolation, GraphSnapshot, NodeKind, NodeSnapshot,
        Uid, Value,
    };
    pub use crate::resolve::{resolve_account, resolve_device};
    pub use crate::schema::{SchemaField, ingest_schema, render_schema};
    pub use crate::sheet::read_rows;
    #[cfg(feature = "dgraph")]
    pub use crate::store::dgraph::DgraphStore;
    #[cfg(feature = "sqlx")]
    pub use crate::store::postgres::{PgGraphStore, create_graph_tables};
    pub use crate::store::{GraphStore, MemoryStore, Mutation, MutationOutcome};
    pub use crate::upsert::{
        link_devices_to_account, upsert_account, upsert_account_and_link, upsert_devices,
    };
    pub use crate::validate::{Field, RejectReason, Rejection, validate_row, validate_rows};
}
