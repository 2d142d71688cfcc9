use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Write-once, read-many map from published device names to topology
/// coordinates.
///
/// A new generation is built off to the side and published with one atomic
/// swap, so readers see either the previous index or the complete new one.
/// Reads never take a lock.
#[derive(Debug)]
pub struct DeviceIndex<C> {
    entries: ArcSwap<HashMap<String, C>>,
}

impl<C> DeviceIndex<C> {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Replaces the whole index.
    pub fn publish(&self, entries: HashMap<String, C>) {
        self.entries.store(Arc::new(entries));
    }

    /// A consistent view to resolve several names against the same generation.
    pub fn snapshot(&self) -> Arc<HashMap<String, C>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
impl<C: Copy> DeviceIndex<C> {
    pub fn lookup(&self, device: &str) -> Option<C> {
        self.entries.load().get(device).copied()
    }
}

impl<C> Default for DeviceIndex<C> {
    fn default() -> Self {
        Self::new()
    }
}
