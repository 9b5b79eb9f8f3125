//! The buffer manager: a bounded cache of `DBPage`s with per-session pin
//! counts and LRU or FIFO eviction.
//!
//! The buffer manager is the single owner of cached page buffers and of the
//! open `DBFile` handles they belong to. A page returned by `get_page` is
//! pinned for the calling session and cannot be evicted until every session
//! unpins it. Dirty victims are written back before eviction, and an
//! observer is consulted first so the write-ahead rule (log before data)
//! holds.

use std::collections::{HashMap, VecDeque};

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::storage::dbfile::DBFile;
use crate::storage::dbpage::{DBPage, PageRef};
use crate::storage::wal::Lsn;
use crate::types::{FileId, SessionId};

/// Which cached page is sacrificed when the cache is over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least recently used: every `get_page` hit refreshes the page.
    Lru,
    /// First in, first out: age is fixed at insertion.
    Fifo,
}

/// Consulted before dirty pages are written back, with the largest page LSN
/// in the batch. The write-ahead log implements this to force itself first;
/// `NoopObserver` serves callers operating outside transaction control.
pub trait BufferObserver {
    fn before_write_dirty_pages(&mut self, max_lsn: Option<Lsn>) -> Result<()>;
}

/// An observer that enforces nothing.
pub struct NoopObserver;

impl BufferObserver for NoopObserver {
    fn before_write_dirty_pages(&mut self, _max_lsn: Option<Lsn>) -> Result<()> {
        Ok(())
    }
}

struct Frame {
    page: PageRef,
    pins: HashMap<SessionId, u32>,
}

impl Frame {
    fn pin_count(&self) -> u32 {
        self.pins.values().sum()
    }
}

pub struct BufferManager {
    max_cache_size: usize,
    policy: EvictionPolicy,
    files: HashMap<FileId, DBFile>,
    ids_by_name: HashMap<String, FileId>,
    frames: HashMap<(FileId, u32), Frame>,
    /// Eviction order; the front is the next victim candidate.
    order: VecDeque<(FileId, u32)>,
    cached_bytes: usize,
}

impl BufferManager {
    pub fn new(max_cache_size: usize, policy: EvictionPolicy) -> BufferManager {
        BufferManager {
            max_cache_size,
            policy,
            files: HashMap::new(),
            ids_by_name: HashMap::new(),
            frames: HashMap::new(),
            order: VecDeque::new(),
            cached_bytes: 0,
        }
    }

    // ------------------------------------------------------------------
    // File registry
    // ------------------------------------------------------------------

    /// Takes ownership of an open file; its pages may now be cached.
    pub fn register_file(&mut self, file: DBFile) -> FileId {
        let id = file.id();
        self.ids_by_name.insert(file.info.name.clone(), id);
        self.files.insert(id, file);
        id
    }

    pub fn file(&self, id: FileId) -> Result<&DBFile> {
        self.files
            .get(&id)
            .ok_or_else(|| Error::invalid_arg(format!("{} is not registered", id)))
    }

    pub fn file_mut(&mut self, id: FileId) -> Result<&mut DBFile> {
        self.files
            .get_mut(&id)
            .ok_or_else(|| Error::invalid_arg(format!("{} is not registered", id)))
    }

    /// Looks up an already-registered file by name.
    pub fn file_id_for(&self, name: &str) -> Option<FileId> {
        self.ids_by_name.get(name).copied()
    }

    pub fn file_name(&self, id: FileId) -> Result<String> {
        Ok(self.file(id)?.info.name.clone())
    }

    // ------------------------------------------------------------------
    // Page cache
    // ------------------------------------------------------------------

    /// Returns the cached page and pins it for `session`, or `None` on a
    /// miss (the caller reads the page from disk and calls `add_page`).
    pub fn get_page(&mut self, session: SessionId, file_id: FileId, page_no: u32) -> Option<PageRef> {
        let key = (file_id, page_no);
        let frame = self.frames.get_mut(&key)?;
        *frame.pins.entry(session).or_insert(0) += 1;
        let page = frame.page.clone();
        if self.policy == EvictionPolicy::Lru {
            self.refresh(key);
        }
        Some(page)
    }

    /// Inserts a freshly loaded page, pinned for `session`, then evicts in
    /// policy order until the cache fits its budget again.
    pub fn add_page(
        &mut self,
        obs: &mut dyn BufferObserver,
        session: SessionId,
        page: DBPage,
    ) -> Result<PageRef> {
        let key = (page.file_id(), page.page_no());
        if let Some(frame) = self.frames.get_mut(&key) {
            warn!("page {:?} is already cached; pinning the existing copy", key);
            *frame.pins.entry(session).or_insert(0) += 1;
            return Ok(frame.page.clone());
        }

        let size = page.page_size();
        let page = std::rc::Rc::new(std::cell::RefCell::new(page));
        let mut pins = HashMap::new();
        pins.insert(session, 1);
        self.frames.insert(
            key,
            Frame {
                page: page.clone(),
                pins,
            },
        );
        self.order.push_back(key);
        self.cached_bytes += size;
        trace!(
            "cached page {} of {} ({} bytes cached)",
            key.1,
            key.0,
            self.cached_bytes
        );

        self.enforce_cache_limit(obs)?;
        Ok(page)
    }

    /// Adds one pin for `session` on an already-cached page.
    pub fn pin_page(&mut self, session: SessionId, file_id: FileId, page_no: u32) -> Result<()> {
        let frame = self
            .frames
            .get_mut(&(file_id, page_no))
            .ok_or_else(|| Error::invalid_arg(format!("page {} of {} is not cached", page_no, file_id)))?;
        *frame.pins.entry(session).or_insert(0) += 1;
        Ok(())
    }

    /// Releases one pin taken by `session`.
    pub fn unpin_page(&mut self, session: SessionId, file_id: FileId, page_no: u32) -> Result<()> {
        let frame = self
            .frames
            .get_mut(&(file_id, page_no))
            .ok_or_else(|| Error::invalid_arg(format!("page {} of {} is not cached", page_no, file_id)))?;
        match frame.pins.get_mut(&session) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                frame.pins.remove(&session);
            }
            None => {
                return Err(Error::invalid_arg(format!(
                    "{} holds no pin on page {} of {}",
                    session, page_no, file_id
                )))
            }
        }
        Ok(())
    }

    /// Drops every pin held by `session`, across all pages. Called when a
    /// session's statement or transaction finishes.
    pub fn unpin_session_pages(&mut self, session: SessionId) {
        for frame in self.frames.values_mut() {
            frame.pins.remove(&session);
        }
    }

    /// Total pin count of a cached page, summed over sessions.
    pub fn pin_count(&self, file_id: FileId, page_no: u32) -> u32 {
        self.frames
            .get(&(file_id, page_no))
            .map_or(0, Frame::pin_count)
    }

    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    pub fn num_cached_pages(&self) -> usize {
        self.frames.len()
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Writes out all dirty pages of one file, syncs it, then drops the
    /// file's unpinned pages from the cache.
    pub fn flush_dbfile(&mut self, obs: &mut dyn BufferObserver, file_id: FileId) -> Result<()> {
        let keys: Vec<_> = self
            .frames
            .keys()
            .filter(|(fid, _)| *fid == file_id)
            .copied()
            .collect();
        self.flush_and_drop(obs, &keys)?;
        if self.files.contains_key(&file_id) {
            self.file_mut(file_id)?.sync()?;
        }
        Ok(())
    }

    /// Writes out every dirty page in the cache, syncs each file, and drops
    /// all unpinned pages.
    pub fn flush_all(&mut self, obs: &mut dyn BufferObserver) -> Result<()> {
        let keys: Vec<_> = self.frames.keys().copied().collect();
        let files: Vec<_> = self.files.keys().copied().collect();
        self.flush_and_drop(obs, &keys)?;
        for fid in files {
            self.file_mut(fid)?.sync()?;
        }
        Ok(())
    }

    /// Flushes one file's pages, then releases and returns its handle.
    pub fn remove_dbfile(&mut self, obs: &mut dyn BufferObserver, file_id: FileId) -> Result<DBFile> {
        self.flush_dbfile(obs, file_id)?;

        // Pinned stragglers indicate a caller bug; drop them anyway so the
        // handle can be released.
        let leftovers: Vec<_> = self
            .frames
            .keys()
            .filter(|(fid, _)| *fid == file_id)
            .copied()
            .collect();
        for key in leftovers {
            warn!("dropping still-pinned page {} of {}", key.1, key.0);
            self.drop_frame(key);
        }

        let file = self
            .files
            .remove(&file_id)
            .ok_or_else(|| Error::invalid_arg(format!("{} is not registered", file_id)))?;
        self.ids_by_name.remove(&file.info.name);
        Ok(file)
    }

    fn flush_and_drop(&mut self, obs: &mut dyn BufferObserver, keys: &[(FileId, u32)]) -> Result<()> {
        let dirty: Vec<_> = keys
            .iter()
            .filter(|key| {
                self.frames
                    .get(*key)
                    .is_some_and(|f| f.page.borrow().is_dirty())
            })
            .copied()
            .collect();

        if !dirty.is_empty() {
            let max_lsn = dirty
                .iter()
                .filter_map(|key| self.frames[key].page.borrow().page_lsn())
                .max();
            obs.before_write_dirty_pages(max_lsn)?;
            for key in &dirty {
                self.write_page_back(*key)?;
            }
        }

        for key in keys {
            let pinned = self.frames.get(key).is_some_and(|f| f.pin_count() > 0);
            if pinned {
                warn!("page {} of {} is pinned; keeping it cached", key.1, key.0);
            } else if self.frames.contains_key(key) {
                self.drop_frame(*key);
            }
        }
        Ok(())
    }

    fn write_page_back(&mut self, key: (FileId, u32)) -> Result<()> {
        let page = self.frames[&key].page.clone();
        {
            let pg = page.borrow();
            let file = self
                .files
                .get_mut(&key.0)
                .ok_or_else(|| Error::invalid_arg(format!("{} is not registered", key.0)))?;
            file.write_page(pg.page_no(), pg.data())?;
        }
        page.borrow_mut().mark_clean();
        trace!("wrote back page {} of {}", key.1, key.0);
        Ok(())
    }

    fn drop_frame(&mut self, key: (FileId, u32)) {
        if let Some(frame) = self.frames.remove(&key) {
            self.cached_bytes -= frame.page.borrow().page_size();
            if let Some(pos) = self.order.iter().position(|k| *k == key) {
                self.order.remove(pos);
            }
        }
    }

    fn refresh(&mut self, key: (FileId, u32)) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
            self.order.push_back(key);
        }
    }

    /// Evicts unpinned victims in policy order while the cache exceeds its
    /// budget. Dirty victims are written back first (observer consulted).
    /// If every page is pinned the budget is exceeded and a warning logged.
    fn enforce_cache_limit(&mut self, obs: &mut dyn BufferObserver) -> Result<()> {
        while self.cached_bytes > self.max_cache_size {
            let victim = self
                .order
                .iter()
                .find(|key| self.frames[*key].pin_count() == 0)
                .copied();
            let Some(key) = victim else {
                warn!(
                    "cache is over budget ({} > {} bytes) but every page is pinned",
                    self.cached_bytes, self.max_cache_size
                );
                break;
            };

            let (dirty, lsn) = {
                let pg = self.frames[&key].page.borrow();
                (pg.is_dirty(), pg.page_lsn())
            };
            if dirty {
                obs.before_write_dirty_pages(lsn)?;
                self.write_page_back(key)?;
            }
            trace!("evicting page {} of {}", key.1, key.0);
            self.drop_frame(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dbfile::DBFileType;
    use crate::storage::file_manager::FileManager;

    const S1: SessionId = SessionId(1);
    const S2: SessionId = SessionId(2);

    fn setup(cache_pages: usize, policy: EvictionPolicy) -> (tempfile::TempDir, BufferManager, FileId) {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(dir.path()).unwrap();
        let file = fm
            .create_dbfile("t.tbl", DBFileType::HeapTupleFile, 512)
            .unwrap();
        let mut buffer = BufferManager::new(cache_pages * 512, policy);
        let fid = buffer.register_file(file);
        (dir, buffer, fid)
    }

    fn page(fid: FileId, no: u32) -> DBPage {
        DBPage::new(fid, no, vec![0u8; 512])
    }

    #[test]
    fn test_hit_and_miss() {
        let (_dir, mut buffer, fid) = setup(4, EvictionPolicy::Lru);
        assert!(buffer.get_page(S1, fid, 1).is_none());

        buffer.add_page(&mut NoopObserver, S1, page(fid, 1)).unwrap();
        assert!(buffer.get_page(S1, fid, 1).is_some());
        assert_eq!(buffer.pin_count(fid, 1), 2);
    }

    #[test]
    fn test_cache_bound_holds() {
        let (_dir, mut buffer, fid) = setup(2, EvictionPolicy::Lru);
        for no in 1..=5 {
            buffer.add_page(&mut NoopObserver, S1, page(fid, no)).unwrap();
            buffer.unpin_page(S1, fid, no).unwrap();
            assert!(buffer.cached_bytes() <= 2 * 512);
        }
        assert_eq!(buffer.num_cached_pages(), 2);
    }

    #[test]
    fn test_pinned_pages_survive_eviction() {
        let (_dir, mut buffer, fid) = setup(2, EvictionPolicy::Lru);
        buffer.add_page(&mut NoopObserver, S1, page(fid, 1)).unwrap();
        buffer.add_page(&mut NoopObserver, S1, page(fid, 2)).unwrap();
        // Page 1 stays pinned; adding more pages must evict page 2 instead.
        buffer.unpin_page(S1, fid, 2).unwrap();
        buffer.add_page(&mut NoopObserver, S1, page(fid, 3)).unwrap();
        assert!(buffer.get_page(S1, fid, 1).is_some());
        assert!(buffer.get_page(S1, fid, 2).is_none());
    }

    #[test]
    fn test_lru_vs_fifo_victim() {
        // LRU: touching page 1 makes page 2 the victim.
        let (_dir, mut buffer, fid) = setup(2, EvictionPolicy::Lru);
        for no in 1..=2 {
            buffer.add_page(&mut NoopObserver, S1, page(fid, no)).unwrap();
            buffer.unpin_page(S1, fid, no).unwrap();
        }
        buffer.get_page(S1, fid, 1).unwrap();
        buffer.unpin_page(S1, fid, 1).unwrap();
        buffer.add_page(&mut NoopObserver, S1, page(fid, 3)).unwrap();
        assert!(buffer.get_page(S1, fid, 1).is_some());
        assert!(buffer.get_page(S1, fid, 2).is_none());

        // FIFO: the same access pattern still evicts page 1.
        let (_dir, mut buffer, fid) = setup(2, EvictionPolicy::Fifo);
        for no in 1..=2 {
            buffer.add_page(&mut NoopObserver, S1, page(fid, no)).unwrap();
            buffer.unpin_page(S1, fid, no).unwrap();
        }
        buffer.get_page(S1, fid, 1).unwrap();
        buffer.unpin_page(S1, fid, 1).unwrap();
        buffer.add_page(&mut NoopObserver, S1, page(fid, 3)).unwrap();
        assert!(buffer.get_page(S1, fid, 1).is_none());
        assert!(buffer.get_page(S1, fid, 2).is_some());
    }

    #[test]
    fn test_per_session_pins() {
        let (_dir, mut buffer, fid) = setup(4, EvictionPolicy::Lru);
        buffer.add_page(&mut NoopObserver, S1, page(fid, 1)).unwrap();
        buffer.pin_page(S2, fid, 1).unwrap();
        assert_eq!(buffer.pin_count(fid, 1), 2);

        // A session cannot release a pin it does not hold.
        buffer.unpin_page(S1, fid, 1).unwrap();
        assert!(buffer.unpin_page(S1, fid, 1).is_err());
        assert_eq!(buffer.pin_count(fid, 1), 1);

        buffer.unpin_session_pages(S2);
        assert_eq!(buffer.pin_count(fid, 1), 0);
    }

    #[test]
    fn test_flush_writes_dirty_pages() {
        let (_dir, mut buffer, fid) = setup(4, EvictionPolicy::Lru);
        let page_ref = buffer.add_page(&mut NoopObserver, S1, page(fid, 1)).unwrap();
        page_ref.borrow_mut().write_u32(100, 0xfeedface);
        buffer.unpin_page(S1, fid, 1).unwrap();

        buffer.flush_dbfile(&mut NoopObserver, fid).unwrap();
        assert_eq!(buffer.num_cached_pages(), 0);

        // Re-read from disk and confirm the bytes arrived.
        let mut buf = vec![0u8; 512];
        buffer.file_mut(fid).unwrap().read_page(1, &mut buf).unwrap();
        assert_eq!(&buf[100..104], &0xfeedfaceu32.to_be_bytes());
    }

    #[test]
    fn test_remove_dbfile_releases_handle() {
        let (_dir, mut buffer, fid) = setup(4, EvictionPolicy::Lru);
        buffer.add_page(&mut NoopObserver, S1, page(fid, 1)).unwrap();
        buffer.unpin_page(S1, fid, 1).unwrap();
        let file = buffer.remove_dbfile(&mut NoopObserver, fid).unwrap();
        assert_eq!(file.id(), fid);
        assert!(buffer.file(fid).is_err());
        assert!(buffer.file_id_for("t.tbl").is_none());
    }
}
