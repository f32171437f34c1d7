// src/main.rs

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use repairsync::backfill::{BackfillMigrator, JsonHistorySource};
use repairsync::config::CONFIG;
use repairsync::consolidate::{InMemoryPointerStore, SessionConsolidator};
use repairsync::dedup::Deduplicator;
use repairsync::notify::ws::{ws_router, StaticTokenAuthenticator};
use repairsync::session::InMemorySessionOwners;
use repairsync::state::{create_app_state, spawn_commit_forwarder};
use repairsync::storage::HttpObjectStore;

#[derive(Parser)]
#[command(name = "repairsync", version, about = "Repair-session mirror and notification core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the realtime notification server
    Serve,
    /// Re-derive consolidated documents from a primary-store export
    Backfill {
        /// Path to the JSON export of historical phase data
        #[arg(long)]
        export: PathBuf,
        /// Limit the run to specific session ids (default: every session
        /// in the export)
        #[arg(long = "session")]
        sessions: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = Level::from_str(&CONFIG.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match Cli::parse().command {
        Command::Serve => serve().await,
        Command::Backfill { export, sessions } => backfill(export, sessions).await,
    }
}

async fn serve() -> anyhow::Result<()> {
    info!("Starting repairsync notification server");
    info!(
        "Blob bucket: {} @ {}",
        CONFIG.blob_bucket, CONFIG.blob_base_url
    );

    let object_store = Arc::new(HttpObjectStore::from_config()?);
    // Pointer and owner rows live in the workflow's primary store; the
    // standalone server wires the in-memory implementations until the
    // workflow embeds this core with its own.
    let state = Arc::new(create_app_state(
        object_store,
        Arc::new(InMemoryPointerStore::new()),
        Arc::new(InMemorySessionOwners::new()),
        Arc::new(StaticTokenAuthenticator::new(CONFIG.ws_auth_token.clone())),
    ));

    let forwarder = spawn_commit_forwarder(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(CONFIG.cors_origin.parse::<axum::http::HeaderValue>()?);
    let app = ws_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let bind_address = CONFIG.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Notification server listening on ws://{}/ws", bind_address);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = forwarder => {
            error!("Commit forwarder unexpectedly terminated");
        }
    }

    Ok(())
}

async fn backfill(export: PathBuf, sessions: Vec<i64>) -> anyhow::Result<()> {
    info!("Backfill from {}", export.display());

    let object_store = Arc::new(HttpObjectStore::from_config()?);
    let deduplicator = Arc::new(Deduplicator::new(
        object_store.clone(),
        CONFIG.dedup_verify_after_store,
    ));
    let consolidator = Arc::new(SessionConsolidator::new(
        object_store,
        deduplicator,
        Arc::new(InMemoryPointerStore::new()),
        CONFIG.commit_max_retries,
        CONFIG.commit_retry_base_delay_ms,
    ));

    let source = Arc::new(JsonHistorySource::from_path(&export)?);
    let migrator = BackfillMigrator::new(consolidator, source);

    if sessions.is_empty() {
        let summary = migrator.migrate_all().await?;
        if summary.failed > 0 {
            anyhow::bail!(
                "{} of {} sessions failed to backfill",
                summary.failed,
                summary.migrated + summary.failed
            );
        }
    } else {
        let mut failed = 0usize;
        for session_id in sessions {
            let report = migrator.migrate(session_id).await;
            if !report.succeeded() {
                failed += 1;
                error!(
                    "Backfill failed for session {}: {}",
                    session_id,
                    report.error.as_deref().unwrap_or("unknown")
                );
            }
        }
        if failed > 0 {
            anyhow::bail!("{failed} sessions failed to backfill");
        }
    }

    Ok(())
}
