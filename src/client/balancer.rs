//! Round-robin endpoint selection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One dialable endpoint of a remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Registration key the endpoint was discovered under.
    pub key: String,
    /// `host:port` to dial.
    pub address: String,
    pub metadata: BTreeMap<String, String>,
}

/// Picks the endpoint for the next call.
pub trait LoadBalancer: Send + Sync {
    fn next_target(&self, targets: &[Arc<Target>]) -> Option<Arc<Target>>;
}

/// Round-robin selector.
/// Stores an internal counter to rotate through targets.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_target(&self, targets: &[Arc<Target>]) -> Option<Arc<Target>> {
        if targets.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % targets.len();
        Some(Arc::clone(&targets[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(address: &str) -> Arc<Target> {
        Arc::new(Target {
            key: format!("k/{}", address),
            address: address.to_string(),
            metadata: BTreeMap::new(),
        })
    }

    #[test]
    fn rotates_through_targets() {
        let lb = RoundRobin::new();
        let targets = vec![target("127.0.0.1:8080"), target("127.0.0.1:8081")];

        let picks: Vec<String> = (0..4)
            .map(|_| lb.next_target(&targets).unwrap().address.clone())
            .collect();
        assert_eq!(
            picks,
            ["127.0.0.1:8080", "127.0.0.1:8081", "127.0.0.1:8080", "127.0.0.1:8081"]
        );
    }

    #[test]
    fn empty_set_yields_none() {
        assert!(RoundRobin::new().next_target(&[]).is_none());
    }
}
