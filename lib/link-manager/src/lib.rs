// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link allocation, lookup and teardown (spec.md §4.8, C9).
//!
//! A link's invariant — "while the link exists, its adapter exists" — is
//! enforced structurally: [`Link`] owns its `Arc<dyn Adapter>` for its
//! entire lifetime, and [`LinkManager::destroy_link`] is the only way to
//! drop that reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use adapter::Adapter;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("link {0} not found")]
pub struct LinkNotFound(pub u32);

pub struct Link {
    pub lid: u32,
    pub client_id: i32,
    pub device_name: String,
    pub adapter: Arc<dyn Adapter>,
    has_lock: AtomicBool,
}

impl Link {
    pub fn has_lock(&self) -> bool {
        self.has_lock.load(Ordering::SeqCst)
    }

    pub fn set_has_lock(&self, value: bool) {
        self.has_lock.store(value, Ordering::SeqCst);
    }
}

/// Allocates `lid` from a monotonically increasing counter starting at 1;
/// a given `lid` is never reused within the process (spec.md §3).
#[derive(Default)]
pub struct LinkManager {
    next_lid: AtomicU32,
    links: Mutex<HashMap<u32, Arc<Link>>>,
}

impl LinkManager {
    pub fn new() -> Self {
        Self { next_lid: AtomicU32::new(1), links: Mutex::new(HashMap::new()) }
    }

    pub fn create_link(&self, device_name: String, adapter: Arc<dyn Adapter>, client_id: i32) -> Arc<Link> {
        let lid = self.next_lid.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(Link {
            lid,
            client_id,
            device_name,
            adapter,
            has_lock: AtomicBool::new(false),
        });
        self.links.lock().unwrap().insert(lid, link.clone());
        link
    }

    pub fn destroy_link(&self, lid: u32) -> Result<Arc<Link>, LinkNotFound> {
        self.links.lock().unwrap().remove(&lid).ok_or(LinkNotFound(lid))
    }

    pub fn get(&self, lid: u32) -> Result<Arc<Link>, LinkNotFound> {
        self.links.lock().unwrap().get(&lid).cloned().ok_or(LinkNotFound(lid))
    }

    /// All links currently bound to `device_name`, used during cleanup.
    pub fn find_by_device(&self, device_name: &str) -> Vec<Arc<Link>> {
        self.links
            .lock()
            .unwrap()
            .values()
            .filter(|link| link.device_name == device_name)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Stub;

    #[async_trait]
    impl Adapter for Stub {
        async fn acquire(&self) -> Result<(), adapter::AdapterError> {
            Ok(())
        }
        async fn release(&self) {}
        async fn write(&self, data: &[u8]) -> Result<usize, adapter::AdapterError> {
            Ok(data.len())
        }
        async fn read(&self, _max_bytes: usize) -> Result<Vec<u8>, adapter::AdapterError> {
            Ok(Vec::new())
        }
        fn requires_lock(&self) -> bool {
            false
        }
    }

    #[test]
    fn lids_are_monotonic_and_never_reused() {
        let mgr = LinkManager::new();
        let a = mgr.create_link("dev".into(), Arc::new(Stub), 1);
        let b = mgr.create_link("dev".into(), Arc::new(Stub), 1);
        assert_eq!(a.lid, 1);
        assert_eq!(b.lid, 2);
        mgr.destroy_link(a.lid).unwrap();
        let c = mgr.create_link("dev".into(), Arc::new(Stub), 1);
        assert_eq!(c.lid, 3);
    }

    #[test]
    fn destroying_unknown_link_is_not_found() {
        let mgr = LinkManager::new();
        assert_eq!(mgr.destroy_link(42), Err(LinkNotFound(42)));
    }

    #[test]
    fn find_by_device_filters_correctly() {
        let mgr = LinkManager::new();
        let a = mgr.create_link("dev-a".into(), Arc::new(Stub), 1);
        let _b = mgr.create_link("dev-b".into(), Arc::new(Stub), 1);
        let found = mgr.find_by_device("dev-a");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].lid, a.lid);
    }
}
