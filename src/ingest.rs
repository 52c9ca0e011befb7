use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::calls::{self, CALL_VAR, call_mutation};
use crate::error::Result;
use crate::models::{CallRecord, DevicePair, Uid, predicates};
use crate::schema;
use crate::store::{GraphStore, Object, Subject};
use crate::upsert::{self, ACCOUNT_VAR, ORIGIN_VAR};

/// What the orchestrator does when one record's writes fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the batch and return the error.
    #[default]
    FailFast,
    /// Log the failure, remember it in the report and continue with the next record.
    SkipFailed,
}

/// How the writes of one record are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Devices, account, each back-reference and the call commit separately.
    /// A failure part way leaves the earlier commits in place.
    #[default]
    PerStep,
    /// All writes of a record go out as a single query+mutation round trip.
    Atomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOptions {
    pub failure_policy: FailurePolicy,
    pub commit_mode: CommitMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub origin: Uid,
    pub destination: Uid,
    pub account: Uid,
    pub call: Uid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    pub index: usize,
    pub msdin: String,
    pub imei_from: String,
    pub imei_to: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub attempted: usize,
    pub ingested: usize,
    pub failures: Vec<RecordFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn log_summary(&self) {
        tracing::info!(
            attempted = self.attempted,
            ingested = self.ingested,
            failed = self.failures.len(),
            "ingest finished"
        );
    }
}

/// Writes validated call records into a graph store, strictly one at a time.
pub struct Ingestor<S> {
    store: S,
    options: IngestOptions,
    schema_declared: bool,
    last_report: Option<IngestReport>,
}

impl<S: GraphStore> Ingestor<S> {
    pub fn new(store: S, options: IngestOptions) -> Self {
        Self {
            store,
            options,
            schema_declared: false,
            last_report: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> IngestOptions {
        self.options
    }

    /// Report of the most recent [`Ingestor::ingest`] call, including one that
    /// stopped early under [`FailurePolicy::FailFast`].
    pub fn last_report(&self) -> Option<&IngestReport> {
        self.last_report.as_ref()
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Declares the ingest schema unless this ingestor already has.
    pub async fn ensure_schema(&mut self) -> Result<()> {
        if self.schema_declared {
            return Ok(());
        }
        self.store.declare_schema(&schema::ingest_schema()).await?;
        self.schema_declared = true;
        tracing::info!("ingest schema declared");
        Ok(())
    }

    pub async fn ingest_record(&mut self, record: &CallRecord) -> Result<RecordOutcome> {
        self.ensure_schema().await?;
        match self.options.commit_mode {
            CommitMode::PerStep => write_per_step(&self.store, record).await,
            CommitMode::Atomic => write_atomic(&self.store, record).await,
        }
    }

    /// Ingests `records` in order under the configured failure policy.
    ///
    /// With [`FailurePolicy::FailFast`] the first failing record ends the batch
    /// and its error is returned; records before it stay committed. The partial
    /// report, with `attempted` counting the failed record, is kept in
    /// [`Ingestor::last_report`].
    pub async fn ingest(&mut self, records: &[CallRecord]) -> Result<IngestReport> {
        let mut report = IngestReport {
            attempted: 0,
            ingested: 0,
            failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        for (index, record) in records.iter().enumerate() {
            let span = tracing::info_span!(
                "record",
                index,
                msdin = %record.msdin,
                imei_from = %record.imei_from,
                imei_to = %record.imei_to
            );
            report.attempted += 1;
            let result = self.ingest_record(record).instrument(span).await;
            match result {
                Ok(outcome) => {
                    report.ingested += 1;
                    tracing::debug!(index, call = %outcome.call, "record ingested");
                }
                Err(err) => {
                    tracing::error!(
                        index,
                        msdin = %record.msdin,
                        imei_from = %record.imei_from,
                        imei_to = %record.imei_to,
                        kind = ?err.kind,
                        error = %err,
                        "failed to ingest record"
                    );
                    if err.is_store() {
                        // The failure may have been the schema itself.
                        self.schema_declared = false;
                    }
                    report.failures.push(RecordFailure {
                        index,
                        msdin: record.msdin.clone(),
                        imei_from: record.imei_from.clone(),
                        imei_to: record.imei_to.clone(),
                        error: err.to_string(),
                    });
                    if self.options.failure_policy == FailurePolicy::FailFast {
                        report.finished_at = Utc::now();
                        report.log_summary();
                        self.last_report = Some(report);
                        return Err(err);
                    }
                }
            }
        }

        report.finished_at = Utc::now();
        report.log_summary();
        self.last_report = Some(report.clone());
        Ok(report)
    }
}

async fn write_per_step<S: GraphStore>(store: &S, record: &CallRecord) -> Result<RecordOutcome> {
    let devices = upsert::upsert_devices(store, record).await?;
    let account = upsert::upsert_account_and_link(store, &record.msdin, devices).await?;
    let call = calls::write_call(store, record).await?;
    Ok(RecordOutcome {
        origin: devices.origin,
        destination: devices.destination,
        account,
        call,
    })
}

async fn write_atomic<S: GraphStore>(store: &S, record: &CallRecord) -> Result<RecordOutcome> {
    let destination_var = upsert::destination_var(record);
    let origin = || Object::Var(ORIGIN_VAR.to_string());
    let destination = || Object::Var(destination_var.to_string());
    let account = || Object::Var(ACCOUNT_VAR.to_string());

    let mutation = upsert::device_mutation(record)
        .extend(upsert::account_mutation(&record.msdin, origin(), destination()))
        .extend(upsert::back_reference_mutation(
            Subject::Var(ORIGIN_VAR.to_string()),
            predicates::INCOMING_MSDIN,
            account(),
        ))
        .extend(upsert::back_reference_mutation(
            Subject::Var(destination_var.to_string()),
            predicates::OUTGOING_MSDIN,
            account(),
        ))
        .extend(call_mutation(record, origin(), destination(), account()));

    let outcome = store.mutate(&mutation).await?;
    let devices = DevicePair {
        origin: outcome.uid(ORIGIN_VAR)?,
        destination: outcome.uid(destination_var)?,
    };
    Ok(RecordOutcome {
        origin: devices.origin,
        destination: devices.destination,
        account: outcome.uid(ACCOUNT_VAR)?,
        call: outcome.uid(CALL_VAR)?,
    })
}
