use objloader_types::{BaseId, Item};

use crate::error::StoreResult;

/// Opaque key → Item store used as the loader's persistent cache.
///
/// All implementations must satisfy these invariants:
/// - Entries are immutable once written. Ids are content hashes, so a
///   second write of the same id is a no-op.
/// - Concurrent reads are always safe.
/// - The store never interprets Base contents.
/// - I/O errors are returned, never silently ignored; deciding to degrade
///   is the caller's job.
pub trait ObjectStore: Send + Sync {
    /// Point lookup. `Ok(None)` if the id is not stored.
    fn get(&self, id: &BaseId) -> StoreResult<Option<Item>>;

    /// Bulk lookup, one slot per requested id in request order.
    ///
    /// Default implementation calls `get()` for each id.
    fn get_many(&self, ids: &[BaseId]) -> StoreResult<Vec<Option<Item>>> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    /// Store a batch. Returns how many ids were newly stored.
    fn put_batch(&self, items: &[Item]) -> StoreResult<usize>;

    fn contains(&self, id: &BaseId) -> StoreResult<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make earlier writes durable. No-op for volatile stores.
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}
