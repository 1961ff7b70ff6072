//! Expired-blob sweep
//!
//! Periodic reconciliation between the storage tier and the upload
//! registry: each cached group is asked for uploads whose activity clock
//! expired (the storage server aborts them as it reports), and the proxy
//! drops those ids from the registry. The two removals are loosely
//! coupled; an id leaked on one side only makes a later Put or Confirm
//! fail cleanly with an unknown-id error.

use crate::pool::GroupPool;
use crate::registry::UploadRegistry;
use crate::rpc;
use std::sync::Arc;
use std::time::Duration;
use strata_proto::storage::CheckBlobRequest;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn spawn(
    pool: Arc<GroupPool>,
    registry: Arc<UploadRegistry>,
    interval: Duration,
    execute_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let groups = pool.snapshot();
            let mut expired = Vec::new();
            for (group_id, clients) in groups {
                match rpc::send_check_blob(&clients, CheckBlobRequest {}, execute_timeout).await {
                    Ok(response) => expired.extend(response.ids),
                    // One bad group must not stall reclamation of the rest.
                    Err(e) => warn!(group = %group_id, error = %e, "expired-blob check failed"),
                }
            }

            if expired.is_empty() {
                debug!("sweep found nothing to reclaim");
            } else {
                let removed = registry.remove_all(&expired);
                info!(reported = expired.len(), removed, "expired uploads dropped");
            }
        }
    })
}
