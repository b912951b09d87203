//! Process-wide test registry.
//!
//! The registry is the sole owner of server-side `Test` entries. Workers take
//! counted references through `create_or_get` and release them through
//! `safe_delete`; the entry leaves the map only on the last release.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::state::test::{Protocol, Test, TestKind};

/// Registry key: one Test per remote peer, protocol and kind
pub type TestKey = (IpAddr, Protocol, TestKind);

#[derive(Debug, Default)]
pub struct TestRegistry {
    tests: Mutex<HashMap<TestKey, Arc<Test>>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing Test for the key, or create and insert one.
    ///
    /// Linearisable: callers racing on the same key observe a single
    /// creation. The returned reference must be released with `safe_delete`.
    pub fn create_or_get(
        &self,
        remote_ip: IpAddr,
        protocol: Protocol,
        kind: TestKind,
    ) -> (Arc<Test>, bool) {
        let mut tests = self.tests.lock();
        match tests.get(&(remote_ip, protocol, kind)) {
            Some(test) => {
                test.ref_count.fetch_add(1, Ordering::Relaxed);
                (test.clone(), false)
            }
            None => {
                let test = Arc::new(Test::server(remote_ip, protocol, kind));
                test.ref_count.store(1, Ordering::Relaxed);
                tests.insert((remote_ip, protocol, kind), test.clone());
                (test, true)
            }
        }
    }

    /// Release one reference; the Test is removed and cancelled on the last
    /// release. Safe against a concurrent `create_or_get` reviving the key.
    pub fn safe_delete(&self, test: &Arc<Test>) {
        let mut tests = self.tests.lock();
        if test.ref_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            tests.remove(&(test.remote_ip, test.protocol, test.kind));
            test.done.cancel();
        }
    }

    /// Snapshot of current entries, for the stats tick
    pub fn snapshot(&self) -> Vec<Arc<Test>> {
        self.tests.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.lock().is_empty()
    }

    /// Cancel and drop every entry (server shutdown)
    pub fn clear(&self) {
        let mut tests = self.tests.lock();
        for test in tests.values() {
            test.done.cancel();
        }
        tests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn remote(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn test_single_instance_per_key() {
        let registry = TestRegistry::new();

        let (first, is_new) = registry.create_or_get(remote(1), Protocol::Tcp, TestKind::All);
        assert!(is_new);

        let (second, is_new) = registry.create_or_get(remote(1), Protocol::Tcp, TestKind::All);
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_keys_distinct_tests() {
        let registry = TestRegistry::new();

        registry.create_or_get(remote(1), Protocol::Tcp, TestKind::All);
        registry.create_or_get(remote(1), Protocol::Udp, TestKind::All);
        registry.create_or_get(remote(2), Protocol::Tcp, TestKind::All);

        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_delete_on_last_release_only() {
        let registry = TestRegistry::new();

        let (first, _) = registry.create_or_get(remote(1), Protocol::Tcp, TestKind::All);
        let (second, _) = registry.create_or_get(remote(1), Protocol::Tcp, TestKind::All);

        registry.safe_delete(&first);
        assert_eq!(registry.len(), 1);
        assert!(!second.done.is_cancelled());

        registry.safe_delete(&second);
        assert!(registry.is_empty());
        assert!(second.done.is_cancelled());
    }

    #[test]
    fn test_concurrent_create_single_creation() {
        let registry = Arc::new(TestRegistry::new());
        let mut handles = Vec::new();
        let mut creators = 0;

        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let (_, is_new) = registry.create_or_get(remote(1), Protocol::Tcp, TestKind::All);
                is_new
            }));
        }
        for handle in handles {
            if handle.join().unwrap() {
                creators += 1;
            }
        }

        assert_eq!(creators, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clear_cancels() {
        let registry = TestRegistry::new();
        let (test, _) = registry.create_or_get(remote(3), Protocol::Udp, TestKind::All);

        registry.clear();
        assert!(registry.is_empty());
        assert!(test.done.is_cancelled());
    }
}
