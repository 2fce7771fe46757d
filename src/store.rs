use core::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::model::ContainerId;

/// The decrypted chunks of one container, in descriptor order.
#[derive(Clone, Default)]
pub struct StoredContainer(Arc<[Bytes]>);

impl StoredContainer {
    pub fn chunk(&self, index: u32) -> Option<&Bytes> {
        self.0.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn byte_len(&self) -> u64 {
        self.0.iter().map(|chunk| chunk.len() as u64).sum()
    }
}

impl fmt::Debug for StoredContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoredContainer({} chunks, {} bytes)",
            self.len(),
            self.byte_len()
        )
    }
}

/// Decrypted chunks, keyed by container.
///
/// A container is stored whole or not at all, so `contains(c, i)` holds for
/// one valid index of `c` iff it holds for all of them.
#[derive(Debug, Default)]
pub struct ChunkStore {
    containers: DashMap<ContainerId, StoredContainer>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores all chunks of `container`, returning `true` if an earlier entry
    /// got overwritten.
    pub fn put(&self, container: ContainerId, chunks: Vec<Bytes>) -> bool {
        self.containers
            .insert(container, StoredContainer(chunks.into()))
            .is_some()
    }

    pub fn contains(&self, container: &ContainerId, index: u32) -> bool {
        self.containers
            .get(container)
            .is_some_and(|stored| (index as usize) < stored.len())
    }

    pub fn contains_container(&self, container: &ContainerId) -> bool {
        self.containers.contains_key(container)
    }

    /// A handle onto the chunk's bytes. Shares the stored buffer, no copy.
    pub fn reader(&self, container: &ContainerId, index: u32) -> Option<Bytes> {
        let stored = self.containers.get(container)?;
        stored.chunk(index).cloned()
    }

    pub fn chunk_count(&self, container: &ContainerId) -> Option<usize> {
        self.containers.get(container).map(|stored| stored.len())
    }

    /// Drops a container once nothing will read from it anymore.
    pub fn remove(&self, container: &ContainerId) -> bool {
        self.containers.remove(container).is_some()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn byte_len(&self) -> u64 {
        self.containers
            .iter()
            .map(|entry| entry.value().byte_len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn chunks(parts: &[&'static [u8]]) -> Vec<Bytes> {
        parts.iter().map(|part| Bytes::from_static(part)).collect()
    }

    #[test]
    fn test_chunkstore() {
        let store = ChunkStore::new();
        let c1 = ContainerId([1; 16]);
        let c2 = ContainerId([2; 16]);

        assert!(!store.put(c1, chunks(&[b"zero", b"one"])));
        assert!(store.contains(&c1, 0));
        assert!(store.contains(&c1, 1));
        assert!(!store.contains(&c1, 2));
        assert!(!store.contains(&c2, 0));

        assert_eq!(store.reader(&c1, 1).unwrap(), "one");
        assert_eq!(store.reader(&c2, 0), None);
        assert_eq!(store.chunk_count(&c1), Some(2));
        assert_eq!(store.byte_len(), 7);

        dbg!(&store);

        assert!(store.remove(&c1));
        assert!(!store.remove(&c1));
        assert!(store.is_empty());
    }

    #[test]
    fn second_put_reports_overwrite() {
        let store = ChunkStore::new();
        let c1 = ContainerId([1; 16]);

        assert!(!store.put(c1, chunks(&[b"a"])));
        assert!(store.put(c1, chunks(&[b"b", b"c"])));
        assert_eq!(store.reader(&c1, 0).unwrap(), "b");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn readers_share_the_stored_buffer() {
        let store = ChunkStore::new();
        let c1 = ContainerId([1; 16]);
        store.put(c1, vec![Bytes::from(vec![42u8; 1024])]);

        let a = store.reader(&c1, 0).unwrap();
        let b = store.reader(&c1, 0).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());

        // a handle outlives removal from the store
        store.remove(&c1);
        assert_eq!(a.len(), 1024);
    }

    #[test]
    fn containers_are_never_seen_partially() {
        let store = Arc::new(ChunkStore::new());
        let ids: Vec<_> = (0..64u8).map(|i| ContainerId([i; 16])).collect();

        let writer = {
            let store = Arc::clone(&store);
            let ids = ids.clone();
            thread::spawn(move || {
                for id in ids {
                    store.put(id, vec![Bytes::from_static(b"x"); 8]);
                }
            })
        };

        for _ in 0..1000 {
            for id in &ids {
                let first = store.contains(id, 0);
                let last = store.contains(id, 7);
                // `last` is read after `first`, so it can only have appeared in between
                assert!(!first || last, "{id:?} was partially visible");
            }
        }
        writer.join().unwrap();
        assert!(ids.iter().all(|id| store.contains(id, 7)));
    }
}
