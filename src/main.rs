use std::process;

use anyhow::Context;
use clap::Parser;

use imei_graph::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "imei-graph")]
#[command(about = "Loads a call-detail spreadsheet into the device/account/call graph")]
#[command(version)]
struct Cli {
    /// Spreadsheet path, local or as known to the file server.
    path: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!(error = %format!("{err:#}"), "ingestion failed");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = IngestConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        path = %cli.path,
        backend = %config.backend,
        sheet = %config.sheet,
        file_server = config.file_server.as_deref().unwrap_or("local"),
        "starting ingestion"
    );

    let bytes = match &config.file_server {
        Some(addr) => {
            let source = GrpcFileSource::connect(addr)
                .await
                .with_context(|| format!("failed to connect to file server {addr}"))?;
            fetch_file(&source, &cli.path).await
        }
        None => fetch_file(&LocalFileSource::new(), &cli.path).await,
    }
    .with_context(|| format!("failed to fetch {}", cli.path))?;

    let rows = read_rows(&bytes, &config.sheet)
        .with_context(|| format!("failed to read sheet {}", config.sheet))?;
    let records = validate_rows(&rows);

    let report = match config.backend {
        StoreBackend::Dgraph => {
            let store = DgraphStore::new(config.dgraph_url.as_str());
            store
                .health()
                .await
                .with_context(|| format!("dgraph at {} is unavailable", config.dgraph_url))?;
            ingest(store, &config, &records).await?
        }
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let store = PgGraphStore::connect(database_url, config.max_connections)
                .await
                .context("failed to open the postgres graph store")?;
            ingest(store, &config, &records).await?
        }
        StoreBackend::Memory => {
            let store = MemoryStore::new();
            let report = ingest(store.clone(), &config, &records).await?;
            let snapshot = store.snapshot();
            ensure_graph_invariants(&snapshot).context("in-memory graph is inconsistent")?;
            tracing::info!(
                devices = snapshot.count(NodeKind::Device),
                accounts = snapshot.count(NodeKind::Account),
                calls = snapshot.count(NodeKind::Call),
                "dry run finished"
            );
            report
        }
    };

    for failure in &report.failures {
        tracing::warn!(
            index = failure.index,
            msdin = %failure.msdin,
            imei_from = %failure.imei_from,
            imei_to = %failure.imei_to,
            error = %failure.error,
            "record needs reconciliation"
        );
    }
    Ok(())
}

async fn ingest<S: GraphStore>(
    store: S,
    config: &IngestConfig,
    records: &[CallRecord],
) -> anyhow::Result<IngestReport> {
    let mut ingestor = Ingestor::new(store, config.options);
    ingestor
        .ensure_schema()
        .await
        .context("failed to declare the graph schema")?;
    match ingestor.ingest(records).await {
        Ok(report) => Ok(report),
        Err(err) => {
            if let Some(partial) = ingestor.last_report() {
                tracing::error!(
                    attempted = partial.attempted,
                    ingested = partial.ingested,
                    total = records.len(),
                    "ingestion stopped before the end of the batch"
                );
            }
            Err(anyhow::Error::new(err).context("ingestion stopped at a failed record"))
        }
    }
}
