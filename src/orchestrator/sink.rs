use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::poller::StopStatus;
use crate::cache::{CacheInfo, SnapshotCache};
use crate::model::{Freshness, StopSnapshot};

/// Messages from stop workers and the handle to the result sink.
#[derive(Debug)]
pub enum SinkMessage {
    Update(StopStatus),
    Seed {
        stop_code: String,
        reply: oneshot::Sender<Option<StopSnapshot>>,
    },
    ClearCache {
        stop_code: Option<String>,
        reply: oneshot::Sender<usize>,
    },
    CacheInfo {
        reply: oneshot::Sender<CacheInfo>,
    },
}

/// Single owner of the snapshot cache. Fans committed updates out to
/// subscribers and records fresh snapshots on disk.
pub async fn run_sink(
    mut rx: mpsc::Receiver<SinkMessage>,
    mut cache: Option<SnapshotCache>,
    updates: broadcast::Sender<StopStatus>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMessage::Update(status) => {
                if let Some(cache) = cache.as_mut() {
                    if status.snapshot.freshness == Freshness::Fresh {
                        cache.insert(status.snapshot.clone(), Utc::now());
                        persist(cache).await;
                    }
                }
                // No subscribers is fine.
                let _ = updates.send(status);
            }
            SinkMessage::Seed { stop_code, reply } => {
                let seed = cache
                    .as_ref()
                    .and_then(|c| c.get(&stop_code, Utc::now()))
                    .map(|entry| entry.snapshot.clone());
                let _ = reply.send(seed);
            }
            SinkMessage::ClearCache { stop_code, reply } => {
                let removed = match cache.as_mut() {
                    Some(cache) => {
                        let removed = cache.clear(stop_code.as_deref());
                        persist(cache).await;
                        removed
                    }
                    None => 0,
                };
                debug!(stop_code = ?stop_code, removed, "Cleared snapshot cache");
                let _ = reply.send(removed);
            }
            SinkMessage::CacheInfo { reply } => {
                let info = cache
                    .as_ref()
                    .map(|c| c.info(Utc::now()))
                    .unwrap_or_else(CacheInfo::disabled);
                let _ = reply.send(info);
            }
        }
    }

    if let Some(cache) = cache.as_mut() {
        persist(cache).await;
    }
    debug!("Result sink stopped");
}

/// Writes the cache on the blocking pool so file I/O never stalls the runtime.
async fn persist(cache: &mut SnapshotCache) {
    let write = match cache.pending_write() {
        Ok(Some(write)) => write,
        Ok(None) => return,
        Err(e) => {
            warn!(path = %cache.path().display(), error = %e, "Failed to serialize snapshot cache");
            return;
        }
    };
    let failure = match tokio::task::spawn_blocking(move || write.commit()).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    cache.mark_dirty();
    warn!(path = %cache.path().display(), error = %failure, "Failed to write snapshot cache");
}
