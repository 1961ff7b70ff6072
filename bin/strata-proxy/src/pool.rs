//! Group connection pool
//!
//! A bounded cache of channel sets keyed by group id. Channels are opened
//! lazily, so filling the pool never performs network I/O and the lock is
//! never held across an RPC; a replica that is down surfaces as a
//! transport error inside the failover loop instead. At capacity the
//! least-recently-acquired group is evicted and its channels dropped.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::MAX_TRANSPORT_SIZE;
use strata_proto::metadata::Group;
use strata_proto::storage::storage_service_client::StorageServiceClient;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::{debug, info};

struct PoolEntry {
    clients: Vec<StorageServiceClient<Channel>>,
    /// Acquisition tick, for LRU eviction
    last_used: AtomicU64,
}

/// Bounded cache of per-group replica channels.
pub struct GroupPool {
    max_groups: usize,
    clock: AtomicU64,
    inner: RwLock<HashMap<String, PoolEntry>>,
}

impl GroupPool {
    pub fn new(max_groups: usize) -> Self {
        Self {
            max_groups: max_groups.max(1),
            clock: AtomicU64::new(0),
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the replica clients for a group, opening (lazy) channels on
    /// first use and evicting the least-recently-used group at capacity.
    pub fn acquire(&self, group: &Group) -> Result<Vec<StorageServiceClient<Channel>>, Status> {
        {
            let pool = self.inner.read();
            if let Some(entry) = pool.get(&group.group_id) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(entry.clients.clone());
            }
        }

        if group.addresses.is_empty() {
            return Err(Status::unavailable(format!(
                "group {} has no replicas",
                group.group_id
            )));
        }
        let mut clients = Vec::with_capacity(group.addresses.len());
        for address in &group.addresses {
            clients.push(connect(address)?);
        }

        let mut pool = self.inner.write();
        if let Some(entry) = pool.get(&group.group_id) {
            entry.last_used.store(self.tick(), Ordering::Relaxed);
            return Ok(entry.clients.clone());
        }
        if pool.len() >= self.max_groups {
            if let Some(victim) = pool
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(id, _)| id.clone())
            {
                pool.remove(&victim);
                info!(group = %victim, "evicted group channels");
            }
        }
        debug!(group = %group.group_id, replicas = clients.len(), "opened group channels");
        pool.insert(
            group.group_id.clone(),
            PoolEntry {
                clients: clients.clone(),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        Ok(clients)
    }

    /// Snapshot every cached group for the sweep. Does not refresh LRU.
    pub fn snapshot(&self) -> Vec<(String, Vec<StorageServiceClient<Channel>>)> {
        self.inner
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clients.clone()))
            .collect()
    }

    /// Number of cached groups (diagnostic).
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

/// Open a lazy channel to one replica with the transport size limits.
fn connect(address: &str) -> Result<StorageServiceClient<Channel>, Status> {
    let uri = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| Status::unavailable(format!("bad replica address {address}: {e}")))?;
    let channel = endpoint.connect_lazy();
    Ok(StorageServiceClient::new(channel)
        .max_decoding_message_size(MAX_TRANSPORT_SIZE)
        .max_encoding_message_size(MAX_TRANSPORT_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str) -> Group {
        Group {
            group_id: id.to_string(),
            addresses: vec!["127.0.0.1:7001".into(), "127.0.0.1:7002".into()],
        }
    }

    #[tokio::test]
    async fn test_acquire_caches_channels() {
        let pool = GroupPool::new(4);
        let clients = pool.acquire(&group("g0")).unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(pool.len(), 1);

        pool.acquire(&group("g0")).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let pool = GroupPool::new(3);
        for i in 0..10 {
            pool.acquire(&group(&format!("g{i}"))).unwrap();
            assert!(pool.len() <= 3);
        }
    }

    #[tokio::test]
    async fn test_eviction_is_lru() {
        let pool = GroupPool::new(2);
        pool.acquire(&group("a")).unwrap();
        pool.acquire(&group("b")).unwrap();
        // Touch "a" so "b" becomes the least recently used.
        pool.acquire(&group("a")).unwrap();

        pool.acquire(&group("c")).unwrap();
        let cached: Vec<String> = pool.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(pool.len(), 2);
        assert!(cached.contains(&"a".to_string()));
        assert!(cached.contains(&"c".to_string()));
        assert!(!cached.contains(&"b".to_string()));
    }

    #[test]
    fn test_empty_group_rejected() {
        let pool = GroupPool::new(2);
        let empty = Group {
            group_id: "g".into(),
            addresses: Vec::new(),
        };
        let err = pool.acquire(&empty).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }
}
