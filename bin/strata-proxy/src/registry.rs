//! Upload registry
//!
//! Maps live upload ids to the group captured when the upload was
//! created. Put and Confirm consult it; the sweep bulk-removes ids the
//! storage tier reported as expired. The registry has its own lock,
//! independent of the group pool.

use parking_lot::RwLock;
use std::collections::HashMap;
use strata_proto::metadata::Group;
use uuid::Uuid;

pub struct UploadRegistry {
    inner: RwLock<HashMap<String, Group>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a fresh upload id: an unguessable random token shared only
    /// between proxy and client.
    pub fn mint_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn insert(&self, id: &str, group: Group) {
        self.inner.write().insert(id.to_string(), group);
    }

    pub fn get(&self, id: &str) -> Option<Group> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Bulk-remove expired ids; returns how many were actually present.
    pub fn remove_all(&self, ids: &[String]) -> usize {
        let mut inner = self.inner.write();
        ids.iter().filter(|id| inner.remove(*id).is_some()).count()
    }

    /// Number of live upload ids (diagnostic).
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
