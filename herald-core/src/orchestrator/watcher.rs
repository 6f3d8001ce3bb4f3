use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ports::MetadataSource;
use crate::types::{EntityId, Metadata};

/// Follows metadata change notifications for one campaign.
///
/// Every notification is followed by a fresh read. The new document is
/// published on `metadata_tx` and its broadcast frequency, when positive, on
/// `rate_tx`. `None` on `metadata_tx` means the campaign is gone.
pub(super) async fn watch_metadata(
    entity: EntityId,
    source: Arc<dyn MetadataSource>,
    rate_tx: watch::Sender<f64>,
    metadata_tx: watch::Sender<Option<Arc<Metadata>>>,
    stop: CancellationToken,
) {
    let mut changes = tokio::select! {
        biased;
        _ = stop.cancelled() => return,
        watched = source.watch(&entity) => match watched {
            Ok(changes) => changes,
            Err(err) => {
                warn!(
                    target: "herald::orchestrator",
                    entity = %entity,
                    error = %err,
                    "metadata watch unavailable; rate follows events only"
                );
                return;
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = changes.next() => {
                if next.is_none() {
                    debug!(target: "herald::orchestrator", entity = %entity, "metadata watch closed");
                    break;
                }
                let fetched = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    fetched = source.get(&entity) => fetched,
                };
                match fetched {
                    Ok(metadata) => {
                        if let Some(hz) = metadata.broadcast_frequency() {
                            rate_tx.send_replace(hz);
                        }
                        metadata_tx.send_replace(Some(metadata));
                    }
                    Err(err) if err.is_gone() => {
                        metadata_tx.send_replace(None);
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target: "herald::orchestrator",
                            entity = %entity,
                            error = %err,
                            "metadata refresh failed; keeping previous document"
                        );
                    }
                }
            }
        }
    }
}
