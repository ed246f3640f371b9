use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Keys of batches currently being admitted. Rejects a second submission of
/// the same batch while the first one is still going through admission.
#[derive(Debug, Default, Clone)]
pub struct ActiveBatches {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl ActiveBatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the key is already held.
    pub fn try_acquire(&self, key: impl Into<String>) -> Option<BatchGuard> {
        let key = key.into();
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }

        Some(BatchGuard {
            key,
            keys: self.keys.clone(),
        })
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its batch key on drop.
#[derive(Debug)]
pub struct BatchGuard {
    key: String,
    keys: Arc<Mutex<HashSet<String>>>,
}

impl BatchGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_blocks_same_key_until_dropped() {
        let batches = ActiveBatches::new();

        let guard = batches.try_acquire("batch-1").unwrap();
        assert_eq!(guard.key(), "batch-1");
        assert!(batches.is_active("batch-1"));
        assert!(batches.try_acquire("batch-1").is_none());

        let other = batches.try_acquire("batch-2");
        assert!(other.is_some());
        assert_eq!(batches.len(), 2);

        drop(guard);
        drop(other);
        assert!(batches.is_empty());
        assert!(batches.try_acquire("batch-1").is_some());
    }
}
