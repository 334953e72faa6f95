use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{LooplineError, Result};

/// Encoded audio captured under one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredAudio {
    pub data: Vec<u8>,
    /// Number of chunks appended so far.
    pub chunks: usize,
}

/// Shared cache of captured and decoded audio, keyed by audio store key.
///
/// Clones share the same storage so capture threads can append while the
/// scheduler side reads.
#[derive(Debug, Clone, Default)]
pub struct AudioStore {
    entries: Arc<Mutex<HashMap<String, StoredAudio>>>,
}

impl AudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` to the blob stored under `key`, creating it if needed.
    pub fn append_chunk(&self, key: &str, chunk: &[u8]) -> Result<()> {
        let mut entries = self.lock()?;
        let entry = entries.entry(key.to_string()).or_default();
        entry.data.extend_from_slice(chunk);
        entry.chunks += 1;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<StoredAudio>> {
        Ok(self.lock()?.get(key).cloned())
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    pub fn remove(&self, key: &str) -> Result<Option<StoredAudio>> {
        Ok(self.lock()?.remove(key))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StoredAudio>>> {
        self.entries
            .lock()
            .map_err(|_| LooplineError::Poisoned("audio store"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_accumulate_per_key() {
        let store = AudioStore::new();
        store.append_chunk("take", &[1, 2]).unwrap();
        store.append_chunk("take", &[3]).unwrap();
        store.append_chunk("other", &[9]).unwrap();

        let take = store.get("take").unwrap().unwrap();
        assert_eq!(take.data, vec![1, 2, 3]);
        assert_eq!(take.chunks, 2);
        assert!(store.contains("other").unwrap());
    }

    #[test]
    fn clones_share_storage() {
        let store = AudioStore::new();
        let writer = store.clone();

        std::thread::spawn(move || writer.append_chunk("take", &[0; 4]).unwrap())
            .join()
            .unwrap();

        assert_eq!(store.get("take").unwrap().map(|audio| audio.data.len()), Some(4));
        assert!(store.remove("take").unwrap().is_some());
        assert!(!store.contains("take").unwrap());
        assert_eq!(store.get("take").unwrap(), None);
    }
}
