//! Asynchronous gallery maintenance.
//!
//! Label, confirmation and high-confidence match events are queued to a
//! single task that applies the gallery policy. Recognition never waits on it.

use crate::engine::EngineError;
use facetag_core::gallery::{GalleryStore, GalleryUpdate, IncorporateOutcome};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Counters reported when the maintainer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintainerStats {
    pub added: usize,
    pub evicted: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// Clone-safe handle for queuing gallery updates.
#[derive(Clone)]
pub struct MaintainerHandle {
    tx: mpsc::Sender<GalleryUpdate>,
}

impl MaintainerHandle {
    pub async fn submit(&self, update: GalleryUpdate) -> Result<(), EngineError> {
        self.tx
            .send(update)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn submit_all(&self, updates: Vec<GalleryUpdate>) -> Result<(), EngineError> {
        for update in updates {
            self.submit(update).await?;
        }
        Ok(())
    }
}

/// Spawn the maintainer task. It runs until every handle is dropped and
/// returns its counters.
pub fn spawn_maintainer(
    store: Arc<GalleryStore>,
    queue_capacity: usize,
) -> (MaintainerHandle, JoinHandle<MaintainerStats>) {
    let (tx, mut rx) = mpsc::channel::<GalleryUpdate>(queue_capacity.max(1));

    let task = tokio::spawn(async move {
        tracing::info!("gallery maintainer started");
        let mut stats = MaintainerStats::default();
        while let Some(update) = rx.recv().await {
            let tag = update.tag.clone();
            match store.incorporate(update) {
                Ok(IncorporateOutcome::Added { evicted, .. }) => {
                    stats.added += 1;
                    if evicted.is_some() {
                        stats.evicted += 1;
                    }
                }
                Ok(IncorporateOutcome::Rejected(_)) => stats.rejected += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(%tag, error = %e, "gallery update failed");
                }
            }
        }
        tracing::info!(?stats, "gallery maintainer exiting");
        stats
    });

    (MaintainerHandle { tx }, task)
}
