// src/state.rs
// Shared application state: every component behind an Arc, wired once at
// startup, injected everywhere else.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    config::CONFIG,
    consolidate::{LatestPointerStore, SessionConsolidator},
    dedup::Deduplicator,
    notify::{ws::ConnectionAuthenticator, NotificationBus, NotificationEvent},
    session::SessionOwnerLookup,
    storage::ObjectStore,
};

#[derive(Clone)]
pub struct AppState {
    // -------- Storage --------
    pub object_store: Arc<dyn ObjectStore>,

    // -------- Mirroring Core --------
    pub deduplicator: Arc<Deduplicator>,
    pub consolidator: Arc<SessionConsolidator>,

    // -------- Notifications --------
    pub bus: Arc<NotificationBus>,
    pub owners: Arc<dyn SessionOwnerLookup>,
    pub authenticator: Arc<dyn ConnectionAuthenticator>,
}

/// Assemble the application state from its injected collaborators.
pub fn create_app_state(
    object_store: Arc<dyn ObjectStore>,
    pointers: Arc<dyn LatestPointerStore>,
    owners: Arc<dyn SessionOwnerLookup>,
    authenticator: Arc<dyn ConnectionAuthenticator>,
) -> AppState {
    let deduplicator = Arc::new(Deduplicator::new(
        object_store.clone(),
        CONFIG.dedup_verify_after_store,
    ));
    let consolidator = Arc::new(SessionConsolidator::new(
        object_store.clone(),
        deduplicator.clone(),
        pointers,
        CONFIG.commit_max_retries,
        CONFIG.commit_retry_base_delay_ms,
    ));
    let bus = Arc::new(NotificationBus::from_config());

    AppState {
        object_store,
        deduplicator,
        consolidator,
        bus,
        owners,
        authenticator,
    }
}

/// Bridge consolidator commits to the notification bus: resolve the session
/// owner, then fan the payload-free event out to that user's connections.
/// Runs until the consolidator is dropped.
pub fn spawn_commit_forwarder(state: Arc<AppState>) -> JoinHandle<()> {
    let mut commits = state.consolidator.subscribe_commits();

    tokio::spawn(async move {
        loop {
            match commits.recv().await {
                Ok(commit) => {
                    let Some(user_id) = state.owners.owner_of(commit.session_id).await else {
                        debug!(
                            "No owner registered for session {}, skipping notification",
                            commit.session_id
                        );
                        continue;
                    };
                    let event = NotificationEvent::session_updated(
                        user_id,
                        commit.session_id,
                        commit.revision,
                    );
                    let accepted = state.bus.publish(&event).await;
                    debug!(
                        "Commit notification for session {} rev {} reached {} connections",
                        commit.session_id, commit.revision, accepted
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Clients reconcile by re-fetching, so skipped signals
                    // only cost staleness, not correctness.
                    warn!("Commit forwarder lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
