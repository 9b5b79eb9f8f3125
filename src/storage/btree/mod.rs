//! B+ tree index files.
//!
//! Page 0 is the header (root page, first leaf, free-list head, key
//! schema). Every other page is an inner page, a leaf page, or a free-list
//! node, discriminated by byte 0. Keys are ordered tuples with a trailing
//! external tuple pointer, so all stored keys are totally ordered and
//! unique; leaves form a singly linked chain in key order.
//!
//! Inserts descend while recording the page path, then place the key in
//! the leaf: in place when it fits, by relocating entries into a
//! same-parent sibling when one has room, and otherwise by splitting (the
//! new leaf is the chain successor and the first key of the right page
//! propagates up). Deletes mirror this: a leaf under half full steals from
//! a sibling or merges into the left page of the pair, separators cascade
//! out of the parents, and a root inner page with a single child collapses.

pub mod inner_page;
pub mod leaf_page;
pub mod verifier;

use std::any::Any;
use std::cmp::Ordering;
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::stats::TableStats;
use crate::storage::dbfile::DBFileType;
use crate::storage::dbpage::{DBPage, PageRef};
use crate::storage::header_page;
use crate::storage::page_tuple::{self, PageTuple};
use crate::storage::storage_manager::{StorageManager, TableFileInfo};
use crate::storage::{FilePointer, TupleFileManager};
use crate::tuple::{Tuple, TupleLiteral};
use crate::types::{FileId, SessionId, Value};

use inner_page::{rebuild_inner, InnerPage, INNER_HEADER_SIZE};
use leaf_page::{init_leaf_page, rebuild_leaf, set_parent_page, LeafPage, LEAF_HEADER_SIZE};

/// Page-kind bytes. Freshly released pages are zeroed, so "empty" is 0.
pub const BTREE_EMPTY_PAGE: u8 = 0;
pub const BTREE_INNER_PAGE: u8 = 1;
pub const BTREE_LEAF_PAGE: u8 = 2;

/// Header-page field offsets.
pub const OFFSET_ROOT_PAGE: usize = 2;
pub const OFFSET_FIRST_LEAF: usize = 4;
pub const OFFSET_FIRST_FREE: usize = 6;
const OFFSET_SCHEMA_SIZE: usize = 8;
const OFFSET_HEADER_SCHEMA: usize = 10;

/// Empty pages chain through a 2-byte next pointer at offset 1.
pub const OFFSET_NEXT_FREE: usize = 1;

// ============================================================================
// Keys
// ============================================================================

/// A self-contained B+ tree key: the key column values plus the external
/// tuple pointer that makes every stored key unique. Keys are materialized
/// copies, so they stay valid after their source page is unpinned.
#[derive(Debug, Clone, PartialEq)]
pub struct BTreeKey {
    pub values: Vec<Value>,
    pub ptr: FilePointer,
}

impl BTreeKey {
    pub fn new(values: Vec<Value>, ptr: FilePointer) -> BTreeKey {
        BTreeKey { values, ptr }
    }

    /// Column-wise comparison with the tuple pointer as the tiebreaker.
    pub fn compare(&self, other: &BTreeKey) -> Result<Ordering> {
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            match a.compare(b)? {
                Ordering::Equal => {}
                order => return Ok(order),
            }
        }
        Ok(self.ptr.cmp(&other.ptr))
    }

    /// Serialized size: key tuple plus the 4-byte pointer trailer.
    pub fn storage_size(&self, schema: &Schema) -> Result<u32> {
        Ok(page_tuple::get_tuple_storage_size(schema, &self.values)? + 4)
    }
}

/// Reads the key stored at `off`; returns it with its serialized size.
pub fn read_key_at(page: &PageRef, off: u32, schema: &Rc<Schema>) -> Result<(BTreeKey, u32)> {
    let tuple = PageTuple::new(page.clone(), off, schema.clone())?;
    let mut values = Vec::with_capacity(schema.num_columns());
    for i in 0..schema.num_columns() {
        values.push(tuple.get_value(i)?);
    }
    let end = tuple.end_offset();
    let pg = page.borrow();
    let ptr = FilePointer::new(pg.read_u16(end as usize), pg.read_u16(end as usize + 2));
    Ok((BTreeKey::new(values, ptr), end - off + 4))
}

/// Writes a key at `off`; returns the end offset.
pub fn write_key_at(page: &mut DBPage, off: u32, schema: &Schema, key: &BTreeKey) -> Result<u32> {
    let end = page_tuple::store_new_tuple(page, off, schema, &key.values)?;
    page.write_u16(end as usize, key.ptr.page_no);
    page.write_u16(end as usize + 2, key.ptr.offset);
    Ok(end + 4)
}

// ============================================================================
// Free list
// ============================================================================

/// Pops a page off the free list, or extends the file. The returned page
/// is zeroed and left unpinned.
pub fn get_new_data_page(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    header: &PageRef,
) -> Result<u16> {
    let first_free = header.borrow().read_u16(OFFSET_FIRST_FREE);
    if first_free != 0 {
        let page = st.load_dbpage(session, file_id, first_free as u32, false)?;
        {
            let mut pg = page.borrow_mut();
            let next_free = pg.read_u16(OFFSET_NEXT_FREE);
            header.borrow_mut().write_u16(OFFSET_FIRST_FREE, next_free);
            let page_size = pg.page_size();
            pg.fill(0, page_size, 0);
        }
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)?;
        trace!("reused free page {}", first_free);
        return Ok(first_free);
    }

    let num_pages = st.buffer.file(file_id)?.num_pages()?;
    if num_pages > u16::MAX as u32 {
        return Err(Error::invalid_arg("index file is full (65535 pages)"));
    }
    let page = st.load_dbpage(session, file_id, num_pages, true)?;
    st.unpin_page(session, &page)?;
    trace!("extended index file with page {}", num_pages);
    Ok(num_pages as u16)
}

/// Pushes a page onto the free list, zeroing everything after the chain
/// pointer.
pub fn release_data_page(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    header: &PageRef,
    page_no: u16,
) -> Result<()> {
    let page = st.load_dbpage(session, file_id, page_no as u32, false)?;
    {
        let mut pg = page.borrow_mut();
        let old_head = header.borrow().read_u16(OFFSET_FIRST_FREE);
        let page_size = pg.page_size();
        pg.fill(0, page_size, 0);
        pg.write_u8(0, BTREE_EMPTY_PAGE);
        pg.write_u16(OFFSET_NEXT_FREE, old_head);
        header.borrow_mut().write_u16(OFFSET_FIRST_FREE, page_no);
    }
    st.log_page_update(session, &page)?;
    st.unpin_page(session, &page)?;
    trace!("released page {} to the free list", page_no);
    Ok(())
}

// ============================================================================
// Scan tuples
// ============================================================================

/// A key read out of a leaf during a scan. The key is materialized, so the
/// tuple stays usable after its page is evicted; the leaf position fields
/// drive scan continuation.
pub struct BTreeFilePageTuple {
    key: BTreeKey,
    leaf_page: u16,
    entry_index: usize,
}

impl BTreeFilePageTuple {
    pub fn key(&self) -> &BTreeKey {
        &self.key
    }
}

impl Tuple for BTreeFilePageTuple {
    fn column_count(&self) -> usize {
        self.key.values.len()
    }

    fn is_null_value(&self, col: usize) -> Result<bool> {
        Ok(self.value_at(col)?.is_null())
    }

    fn get_column_value(&self, col: usize) -> Result<Value> {
        Ok(self.value_at(col)?.clone())
    }

    fn set_column_value(&mut self, _col: usize, _value: Value) -> Result<()> {
        Err(Error::Unsupported(
            "B+ tree entries are replaced, never edited in place".into(),
        ))
    }

    fn external_reference(&self) -> Option<FilePointer> {
        Some(self.key.ptr)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl BTreeFilePageTuple {
    fn value_at(&self, col: usize) -> Result<&Value> {
        self.key.values.get(col).ok_or_else(|| {
            Error::invalid_arg(format!(
                "column index {} out of range for {}-column key",
                col,
                self.key.values.len()
            ))
        })
    }
}

// ============================================================================
// Navigation
// ============================================================================

/// Descends from the root to the leaf owning `key`, returning the leaf's
/// page number and the stack of inner pages along the way.
fn descend_to_leaf(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    root: u16,
    key: &BTreeKey,
) -> Result<(u16, Vec<u16>)> {
    let mut path = Vec::new();
    let mut cur = root;
    loop {
        let page = st.load_dbpage(session, file_id, cur as u32, false)?;
        let page_type = page.borrow().read_u8(0);
        match page_type {
            BTREE_LEAF_PAGE => {
                st.unpin_page(session, &page)?;
                return Ok((cur, path));
            }
            BTREE_INNER_PAGE => {
                let inner = InnerPage::load(page.clone(), schema.clone())?;
                let idx = inner.navigate(key)?;
                let child = inner.pointer_at(idx);
                st.unpin_page(session, &page)?;
                path.push(cur);
                cur = child;
            }
            other => {
                st.unpin_page(session, &page)?;
                return Err(Error::invalid_arg(format!(
                    "page {} has type byte {} inside the tree",
                    cur, other
                )));
            }
        }
    }
}

fn load_leaf(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    page_no: u16,
) -> Result<LeafPage> {
    let page = st.load_dbpage(session, file_id, page_no as u32, false)?;
    LeafPage::load(page, schema.clone())
}

fn load_inner(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    page_no: u16,
) -> Result<InnerPage> {
    let page = st.load_dbpage(session, file_id, page_no as u32, false)?;
    InnerPage::load(page, schema.clone())
}

fn unpin(st: &mut StorageManager, session: SessionId, page: &PageRef) -> Result<()> {
    st.unpin_page(session, page)
}

// ============================================================================
// Insert
// ============================================================================

fn insert_key(
    st: &mut StorageManager,
    session: SessionId,
    tbl: &TableFileInfo,
    key: BTreeKey,
) -> Result<()> {
    let file_id = tbl.primary_file();
    let schema = tbl.schema.clone();
    let size = key.storage_size(&schema)?;
    let page_size = st.buffer.file(file_id)?.page_size();
    if size > (page_size - LEAF_HEADER_SIZE) / 2 {
        return Err(Error::invalid_arg(format!(
            "key of {} bytes is over half a leaf page",
            size
        )));
    }

    let header = st.load_dbpage(session, file_id, 0, false)?;
    let root = header.borrow().read_u16(OFFSET_ROOT_PAGE);

    if root == 0 {
        let leaf_no = get_new_data_page(st, session, file_id, &header)?;
        let page = st.load_dbpage(session, file_id, leaf_no as u32, false)?;
        init_leaf_page(&mut page.borrow_mut(), 0);
        let mut leaf = LeafPage::load(page.clone(), schema.clone())?;
        leaf.insert_entry(0, &key)?;
        {
            let mut hdr = header.borrow_mut();
            hdr.write_u16(OFFSET_ROOT_PAGE, leaf_no);
            hdr.write_u16(OFFSET_FIRST_LEAF, leaf_no);
        }
        st.log_page_update(session, &page)?;
        st.log_page_update(session, &header)?;
        unpin(st, session, &page)?;
        unpin(st, session, &header)?;
        debug!("index root created as leaf {}", leaf_no);
        return Ok(());
    }

    let (leaf_no, path) = descend_to_leaf(st, session, file_id, &schema, root, &key)?;
    let mut leaf = load_leaf(st, session, file_id, &schema, leaf_no)?;
    let (pos, exists) = leaf.find_position(&key)?;
    if exists {
        let page = leaf.page().clone();
        unpin(st, session, &page)?;
        unpin(st, session, &header)?;
        return Err(Error::invalid_arg(format!(
            "key with pointer {} is already in the index",
            key.ptr
        )));
    }

    if leaf.free_space() >= size {
        leaf.insert_entry(pos, &key)?;
        let page = leaf.page().clone();
        st.log_page_update(session, &page)?;
        unpin(st, session, &page)?;
        unpin(st, session, &header)?;
        return Ok(());
    }

    let page = leaf.page().clone();
    unpin(st, session, &page)?;
    drop(leaf);
    let result = insert_with_overflow(st, session, file_id, &schema, leaf_no, path, key, &header);
    st.log_page_update(session, &header)?;
    unpin(st, session, &header)?;
    result
}

/// The leaf has no room: relocate entries into a same-parent sibling when
/// possible, otherwise split.
#[allow(clippy::too_many_arguments)]
fn insert_with_overflow(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    leaf_no: u16,
    path: Vec<u16>,
    key: BTreeKey,
    header: &PageRef,
) -> Result<()> {
    if let Some(&parent_no) = path.last() {
        let mut parent = load_inner(st, session, file_id, schema, parent_no)?;
        let idx = parent.find_pointer_index(leaf_no).ok_or_else(|| {
            Error::invalid_arg(format!(
                "inner page {} does not reference child {}",
                parent_no, leaf_no
            ))
        })?;

        let mut relocated = false;
        if idx > 0 {
            let left_no = parent.pointer_at(idx - 1);
            relocated =
                try_leaf_relocate(st, session, file_id, schema, &mut parent, idx, left_no, leaf_no, &key, true)?;
        }
        if !relocated && idx + 1 < parent.num_pointers() {
            let right_no = parent.pointer_at(idx + 1);
            relocated =
                try_leaf_relocate(st, session, file_id, schema, &mut parent, idx, leaf_no, right_no, &key, false)?;
        }

        let parent_page = parent.page().clone();
        if relocated {
            st.log_page_update(session, &parent_page)?;
        }
        unpin(st, session, &parent_page)?;
        if relocated {
            return Ok(());
        }
    }

    split_leaf_and_insert(st, session, file_id, schema, leaf_no, path, key, header)
}

/// Tries to make room by moving entries from the overfull leaf into a
/// sibling. `into_left` selects which of (left, right) is the donor's
/// destination: entries move from the right page of the pair into the left
/// one when `into_left`, and the other way otherwise. Returns whether the
/// key was placed.
#[allow(clippy::too_many_arguments)]
fn try_leaf_relocate(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    parent: &mut InnerPage,
    idx: usize,
    left_no: u16,
    right_no: u16,
    key: &BTreeKey,
    into_left: bool,
) -> Result<bool> {
    let left = load_leaf(st, session, file_id, schema, left_no)?;
    let right = load_leaf(st, session, file_id, schema, right_no)?;
    let key_size = key.storage_size(schema)?;

    // The separator between the pair sits before the right page; its key
    // index in the parent is that of the left pointer.
    let sep_index = if into_left { idx - 1 } else { idx };
    let old_sep_size = parent.key_at(sep_index)?.storage_size(schema)?;

    let (donor, receiver) = if into_left {
        (&right, &left)
    } else {
        (&left, &right)
    };
    let donor_keys = donor.keys()?;
    let n = donor_keys.len();
    let donor_sizes: Vec<u32> = (0..n).map(|i| donor.entry_size(i)).collect();

    let mut chosen = None;
    let mut moved = 0u32;
    for m in 1..n {
        // Moving into the left sibling takes the donor's leading entries;
        // moving into the right takes its trailing entries.
        moved += if into_left {
            donor_sizes[m - 1]
        } else {
            donor_sizes[n - m]
        };
        if receiver.free_space() < moved {
            break;
        }

        // After moving m entries the separator is the right page's new
        // first key.
        let sep = if into_left {
            donor_keys[m].clone()
        } else {
            donor_keys[n - m].clone()
        };
        // The new key lands in the receiver exactly when its range moved
        // there with the entries.
        let key_goes_left = key.compare(&sep)? == Ordering::Less;
        let fits = if key_goes_left == into_left {
            receiver.free_space() - moved >= key_size
        } else {
            donor.free_space() + moved >= key_size
        };
        if !fits {
            continue;
        }

        let new_sep_size = sep.storage_size(schema)?;
        if new_sep_size <= old_sep_size || parent.free_space() >= new_sep_size - old_sep_size {
            chosen = Some((m, sep));
            break;
        }
    }

    let Some((m, sep)) = chosen else {
        let (lp, rp) = (left.page().clone(), right.page().clone());
        unpin(st, session, &lp)?;
        unpin(st, session, &rp)?;
        return Ok(false);
    };

    // Build the pair's new contents.
    let left_keys_old = left.keys()?;
    let right_keys_old = right.keys()?;
    let (mut new_left, mut new_right) = if into_left {
        let mut l = left_keys_old;
        l.extend_from_slice(&right_keys_old[..m]);
        (l, right_keys_old[m..].to_vec())
    } else {
        let split = left_keys_old.len() - m;
        let mut r = left_keys_old[split..].to_vec();
        r.extend_from_slice(&right_keys_old);
        (left_keys_old[..split].to_vec(), r)
    };
    let dest = if key.compare(&sep)? == Ordering::Less {
        &mut new_left
    } else {
        &mut new_right
    };
    let pos = sorted_position(dest, key)?;
    dest.insert(pos, key.clone());

    rebuild_leaf(left.page(), schema, left.parent(), left.next_leaf(), &new_left)?;
    rebuild_leaf(right.page(), schema, right.parent(), right.next_leaf(), &new_right)?;
    let new_sep = new_right[0].clone();
    parent.replace_key_at(sep_index, &new_sep)?;

    let (lp, rp) = (left.page().clone(), right.page().clone());
    st.log_page_update(session, &lp)?;
    st.log_page_update(session, &rp)?;
    unpin(st, session, &lp)?;
    unpin(st, session, &rp)?;
    trace!(
        "relocated {} entr{} between leaves {} and {}",
        m,
        if m == 1 { "y" } else { "ies" },
        left_no,
        right_no
    );
    Ok(true)
}

fn sorted_position(keys: &[BTreeKey], key: &BTreeKey) -> Result<usize> {
    for (i, other) in keys.iter().enumerate() {
        if key.compare(other)? == Ordering::Less {
            return Ok(i);
        }
    }
    Ok(keys.len())
}

/// Splits the leaf, inserting the key into whichever half owns its range,
/// and propagates the right page's first key into the parent.
#[allow(clippy::too_many_arguments)]
fn split_leaf_and_insert(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    leaf_no: u16,
    path: Vec<u16>,
    key: BTreeKey,
    header: &PageRef,
) -> Result<()> {
    let leaf = load_leaf(st, session, file_id, schema, leaf_no)?;
    let mut keys = leaf.keys()?;
    let pos = sorted_position(&keys, &key)?;
    keys.insert(pos, key);

    // Split at the byte midpoint so both halves stay near half full.
    let mut sizes = Vec::with_capacity(keys.len());
    for k in &keys {
        sizes.push(k.storage_size(schema)?);
    }
    let total: u32 = sizes.iter().sum();
    let mut split = keys.len() - 1;
    let mut acc = 0u32;
    for (i, size) in sizes.iter().enumerate().take(keys.len() - 1) {
        acc += size;
        if acc >= total / 2 {
            split = i + 1;
            break;
        }
    }
    let right_keys = keys.split_off(split);

    let parent_no = path.last().copied().unwrap_or(0);
    let new_no = get_new_data_page(st, session, file_id, header)?;
    let new_page = st.load_dbpage(session, file_id, new_no as u32, false)?;
    rebuild_leaf(&new_page, schema, parent_no, leaf.next_leaf(), &right_keys)?;
    rebuild_leaf(leaf.page(), schema, parent_no, new_no, &keys)?;

    let sep = right_keys[0].clone();
    let leaf_page = leaf.page().clone();
    st.log_page_update(session, &leaf_page)?;
    st.log_page_update(session, &new_page)?;
    unpin(st, session, &leaf_page)?;
    unpin(st, session, &new_page)?;
    debug!("split leaf {} into {} + {}", leaf_no, leaf_no, new_no);

    insert_into_parent(st, session, file_id, schema, path, leaf_no, sep, new_no, header)
}

/// Records `sep` as the separator between `left_no` and `right_no` in the
/// parent, growing the tree upward as needed.
#[allow(clippy::too_many_arguments)]
fn insert_into_parent(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    mut path: Vec<u16>,
    left_no: u16,
    sep: BTreeKey,
    right_no: u16,
    header: &PageRef,
) -> Result<()> {
    let Some(parent_no) = path.pop() else {
        // The split page was the root: grow a new inner root above it.
        let root_no = get_new_data_page(st, session, file_id, header)?;
        let root_page = st.load_dbpage(session, file_id, root_no as u32, false)?;
        rebuild_inner(&root_page, schema, 0, &[left_no, right_no], &[sep])?;
        header.borrow_mut().write_u16(OFFSET_ROOT_PAGE, root_no);
        st.log_page_update(session, &root_page)?;
        unpin(st, session, &root_page)?;

        for child_no in [left_no, right_no] {
            let child = st.load_dbpage(session, file_id, child_no as u32, false)?;
            set_parent_page(&mut child.borrow_mut(), root_no);
            st.log_page_update(session, &child)?;
            unpin(st, session, &child)?;
        }
        debug!("grew a new root {} over {} and {}", root_no, left_no, right_no);
        return Ok(());
    };

    let mut parent = load_inner(st, session, file_id, schema, parent_no)?;
    let idx = parent.find_pointer_index(left_no).ok_or_else(|| {
        Error::invalid_arg(format!(
            "inner page {} does not reference child {}",
            parent_no, left_no
        ))
    })?;

    let needed = sep.storage_size(schema)? + 2;
    if parent.free_space() >= needed {
        parent.insert_key_and_right_pointer(idx, &sep, right_no)?;
        let parent_page = parent.page().clone();
        st.log_page_update(session, &parent_page)?;
        unpin(st, session, &parent_page)?;
        return Ok(());
    }

    let parent_page = parent.page().clone();
    unpin(st, session, &parent_page)?;
    drop(parent);
    insert_inner_with_overflow(st, session, file_id, schema, parent_no, path, idx, sep, right_no, header)
}

/// An inner page has no room for a new separator: relocate pointer/key
/// groups into a same-parent sibling (rotating separators through the
/// grandparent) or split, promoting the middle key.
#[allow(clippy::too_many_arguments)]
fn insert_inner_with_overflow(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    inner_no: u16,
    path: Vec<u16>,
    insert_idx: usize,
    sep: BTreeKey,
    right_child: u16,
    header: &PageRef,
) -> Result<()> {
    // The page's contents with the new entry already in place, in memory.
    let (mut ptrs, mut keys) = {
        let inner = load_inner(st, session, file_id, schema, inner_no)?;
        let decomposed = inner.decompose()?;
        let page = inner.page().clone();
        unpin(st, session, &page)?;
        decomposed
    };
    keys.insert(insert_idx, sep);
    ptrs.insert(insert_idx + 1, right_child);

    if let Some(&grand_no) = path.last() {
        let mut grand = load_inner(st, session, file_id, schema, grand_no)?;
        if let Some(gidx) = grand.find_pointer_index(inner_no) {
            let mut relocated = false;
            if gidx > 0 {
                relocated = try_inner_relocate(
                    st, session, file_id, schema, &mut grand, gidx, inner_no, &ptrs, &keys, true,
                )?;
            }
            if !relocated && gidx + 1 < grand.num_pointers() {
                relocated = try_inner_relocate(
                    st, session, file_id, schema, &mut grand, gidx, inner_no, &ptrs, &keys, false,
                )?;
            }
            let grand_page = grand.page().clone();
            if relocated {
                st.log_page_update(session, &grand_page)?;
            }
            unpin(st, session, &grand_page)?;
            if relocated {
                return Ok(());
            }
        } else {
            let grand_page = grand.page().clone();
            unpin(st, session, &grand_page)?;
        }
    }

    // Split: left keeps ptrs[..=m], keys[..m]; keys[m] promotes; the rest
    // moves to a fresh inner page.
    let mut sizes = Vec::with_capacity(keys.len());
    for k in &keys {
        sizes.push(k.storage_size(schema)? + 2);
    }
    let total: u32 = sizes.iter().sum();
    let mut m = keys.len() / 2;
    let mut acc = 0u32;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc >= total / 2 {
            m = i;
            break;
        }
    }
    m = m.clamp(1, keys.len() - 2);

    let promoted = keys[m].clone();
    let new_no = get_new_data_page(st, session, file_id, header)?;
    let new_page = st.load_dbpage(session, file_id, new_no as u32, false)?;
    let cur_page = st.load_dbpage(session, file_id, inner_no as u32, false)?;
    let parent_of_pair = path.last().copied().unwrap_or(0);

    rebuild_inner(&new_page, schema, parent_of_pair, &ptrs[m + 1..], &keys[m + 1..])?;
    rebuild_inner(&cur_page, schema, parent_of_pair, &ptrs[..=m], &keys[..m])?;
    st.log_page_update(session, &cur_page)?;
    st.log_page_update(session, &new_page)?;
    unpin(st, session, &cur_page)?;
    unpin(st, session, &new_page)?;

    reparent_children(st, session, file_id, &ptrs[m + 1..], new_no)?;
    debug!("split inner {} into {} + {}", inner_no, inner_no, new_no);

    insert_into_parent(st, session, file_id, schema, path, inner_no, promoted, new_no, header)
}

/// Moves leading (or trailing) pointer/key groups of an overfull inner
/// page into its sibling, rotating the separator through the grandparent.
/// `cur_ptrs`/`cur_keys` already include the entry being inserted.
#[allow(clippy::too_many_arguments)]
fn try_inner_relocate(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    grand: &mut InnerPage,
    gidx: usize,
    cur_no: u16,
    cur_ptrs: &[u16],
    cur_keys: &[BTreeKey],
    to_left: bool,
) -> Result<bool> {
    let sep_index = if to_left { gidx - 1 } else { gidx };
    let sibling_no = grand.pointer_at(if to_left { gidx - 1 } else { gidx + 1 });
    let sibling = load_inner(st, session, file_id, schema, sibling_no)?;
    let (sib_ptrs, sib_keys) = sibling.decompose()?;
    let old_sep = grand.key_at(sep_index)?;
    let old_sep_size = old_sep.storage_size(schema)?;
    let capacity = sibling.page().borrow().page_size() as u32 - INNER_HEADER_SIZE;

    let p = cur_ptrs.len();
    let mut chosen = None;
    for t in 1..p - 1 {
        // New layouts after moving t pointers through the separator.
        let (new_sib_ptrs, new_sib_keys, new_sep, rest_ptrs, rest_keys): (
            Vec<u16>,
            Vec<BTreeKey>,
            BTreeKey,
            Vec<u16>,
            Vec<BTreeKey>,
        ) = if to_left {
            let mut sp = sib_ptrs.clone();
            sp.extend_from_slice(&cur_ptrs[..t]);
            let mut sk = sib_keys.clone();
            sk.push(old_sep.clone());
            sk.extend_from_slice(&cur_keys[..t - 1]);
            (
                sp,
                sk,
                cur_keys[t - 1].clone(),
                cur_ptrs[t..].to_vec(),
                cur_keys[t..].to_vec(),
            )
        } else {
            let keep = p - t;
            let mut sp = cur_ptrs[keep..].to_vec();
            sp.extend_from_slice(&sib_ptrs);
            let mut sk = cur_keys[keep..].to_vec();
            sk.push(old_sep.clone());
            sk.extend_from_slice(&sib_keys);
            (
                sp,
                sk,
                cur_keys[keep - 1].clone(),
                cur_ptrs[..keep].to_vec(),
                cur_keys[..keep - 1].to_vec(),
            )
        };

        let sib_bytes = inner_page::inner_storage_size(schema, new_sib_ptrs.len(), &new_sib_keys)?;
        let rest_bytes = inner_page::inner_storage_size(schema, rest_ptrs.len(), &rest_keys)?;
        if sib_bytes > capacity {
            // The sibling only fills further as t grows.
            break;
        }
        if rest_bytes > capacity {
            // The overfull page still does not fit; move more.
            continue;
        }

        let new_sep_size = new_sep.storage_size(schema)?;
        if new_sep_size <= old_sep_size || grand.free_space() >= new_sep_size - old_sep_size {
            chosen = Some((new_sib_ptrs, new_sib_keys, new_sep, rest_ptrs, rest_keys));
            break;
        }
    }

    let Some((new_sib_ptrs, new_sib_keys, new_sep, rest_ptrs, rest_keys)) = chosen else {
        let sp = sibling.page().clone();
        unpin(st, session, &sp)?;
        return Ok(false);
    };

    let moved: Vec<u16> = if to_left {
        new_sib_ptrs[sib_ptrs.len()..].to_vec()
    } else {
        new_sib_ptrs[..new_sib_ptrs.len() - sib_ptrs.len()].to_vec()
    };

    rebuild_inner(sibling.page(), schema, sibling.parent(), &new_sib_ptrs, &new_sib_keys)?;
    let cur_page = st.load_dbpage(session, file_id, cur_no as u32, false)?;
    rebuild_inner(&cur_page, schema, grand.page_no() as u16, &rest_ptrs, &rest_keys)?;
    grand.replace_key_at(sep_index, &new_sep)?;

    let sp = sibling.page().clone();
    st.log_page_update(session, &sp)?;
    st.log_page_update(session, &cur_page)?;
    unpin(st, session, &sp)?;
    unpin(st, session, &cur_page)?;
    reparent_children(st, session, file_id, &moved, sibling_no)?;
    trace!(
        "rotated {} pointer(s) between inner pages {} and {}",
        moved.len(),
        sibling_no,
        cur_no
    );
    Ok(true)
}

fn reparent_children(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    children: &[u16],
    new_parent: u16,
) -> Result<()> {
    for &child_no in children {
        let child = st.load_dbpage(session, file_id, child_no as u32, false)?;
        set_parent_page(&mut child.borrow_mut(), new_parent);
        st.log_page_update(session, &child)?;
        unpin(st, session, &child)?;
    }
    Ok(())
}

// ============================================================================
// Delete
// ============================================================================

fn delete_key(
    st: &mut StorageManager,
    session: SessionId,
    tbl: &TableFileInfo,
    key: &BTreeKey,
) -> Result<()> {
    let file_id = tbl.primary_file();
    let schema = tbl.schema.clone();

    let header = st.load_dbpage(session, file_id, 0, false)?;
    let root = header.borrow().read_u16(OFFSET_ROOT_PAGE);
    if root == 0 {
        unpin(st, session, &header)?;
        return Err(Error::invalid_arg("key is not in the index (tree is empty)"));
    }

    let (leaf_no, path) = descend_to_leaf(st, session, file_id, &schema, root, key)?;
    let mut leaf = load_leaf(st, session, file_id, &schema, leaf_no)?;
    let (pos, found) = leaf.find_position(key)?;
    if !found {
        let page = leaf.page().clone();
        unpin(st, session, &page)?;
        unpin(st, session, &header)?;
        return Err(Error::invalid_arg(format!(
            "key with pointer {} is not in the index",
            key.ptr
        )));
    }
    leaf.delete_entry(pos)?;
    let page = leaf.page().clone();
    st.log_page_update(session, &page)?;

    let page_size = page.borrow().page_size() as u32;
    let half = (page_size - LEAF_HEADER_SIZE) / 2;
    let empty_root = path.is_empty() && leaf.num_entries() == 0;
    let underfull = !path.is_empty() && leaf.used_bytes() < half;
    unpin(st, session, &page)?;
    drop(leaf);

    if empty_root {
        {
            let mut hdr = header.borrow_mut();
            hdr.write_u16(OFFSET_ROOT_PAGE, 0);
            hdr.write_u16(OFFSET_FIRST_LEAF, 0);
        }
        release_data_page(st, session, file_id, &header, leaf_no)?;
        debug!("index is empty; root leaf {} released", leaf_no);
    } else if underfull {
        rebalance_leaf(st, session, file_id, &schema, leaf_no, path, &header)?;
    }

    st.log_page_update(session, &header)?;
    unpin(st, session, &header)
}

/// An underfull leaf pulls entries from a same-parent sibling, or merges
/// into the left page of the pair.
fn rebalance_leaf(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    cur_no: u16,
    mut path: Vec<u16>,
    header: &PageRef,
) -> Result<()> {
    let parent_no = match path.pop() {
        Some(no) => no,
        None => return Ok(()),
    };
    let mut parent = load_inner(st, session, file_id, schema, parent_no)?;
    let idx = parent.find_pointer_index(cur_no).ok_or_else(|| {
        Error::invalid_arg(format!(
            "inner page {} does not reference child {}",
            parent_no, cur_no
        ))
    })?;

    let mut done = false;
    if idx > 0 {
        let left_no = parent.pointer_at(idx - 1);
        done = try_leaf_steal(st, session, file_id, schema, &mut parent, idx - 1, left_no, cur_no, false)?;
    }
    if !done && idx + 1 < parent.num_pointers() {
        let right_no = parent.pointer_at(idx + 1);
        done = try_leaf_steal(st, session, file_id, schema, &mut parent, idx, cur_no, right_no, true)?;
    }

    let mut parent_underfull = false;
    if !done {
        // Merge with a sibling; the left page of the pair survives.
        let (left_no, right_no, sep_index) = if idx > 0 {
            (parent.pointer_at(idx - 1), cur_no, idx - 1)
        } else {
            (cur_no, parent.pointer_at(idx + 1), idx)
        };
        done = merge_leaves(st, session, file_id, schema, &mut parent, sep_index, left_no, right_no, header)?;
        if done {
            parent_underfull = inner_is_underfull(&parent);
        }
    }

    let parent_page = parent.page().clone();
    if done {
        st.log_page_update(session, &parent_page)?;
    }
    unpin(st, session, &parent_page)?;
    drop(parent);

    if done && parent_underfull {
        rebalance_inner(st, session, file_id, schema, parent_no, path, header)?;
    }
    Ok(())
}

/// Moves entries from the fuller leaf of a pair into the underfull one,
/// leaving the donor at least half full. `donor_is_right` says which side
/// donates. Returns whether a steal happened.
#[allow(clippy::too_many_arguments)]
fn try_leaf_steal(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    parent: &mut InnerPage,
    sep_index: usize,
    left_no: u16,
    right_no: u16,
    donor_is_right: bool,
) -> Result<bool> {
    let left = load_leaf(st, session, file_id, schema, left_no)?;
    let right = load_leaf(st, session, file_id, schema, right_no)?;
    let page_size = left.page().borrow().page_size() as u32;
    let half = (page_size - LEAF_HEADER_SIZE) / 2;

    let (donor, receiver) = if donor_is_right {
        (&right, &left)
    } else {
        (&left, &right)
    };
    let n = donor.num_entries();
    let donor_sizes: Vec<u32> = (0..n).map(|i| donor.entry_size(i)).collect();
    let old_sep_size = parent.key_at(sep_index)?.storage_size(schema)?;
    let donor_keys = donor.keys()?;

    let mut chosen = None;
    let mut moved = 0u32;
    for t in 1..n {
        moved += if donor_is_right {
            donor_sizes[t - 1]
        } else {
            donor_sizes[n - t]
        };
        if donor.used_bytes() - moved < half {
            break;
        }
        if receiver.used_bytes() + moved < half {
            continue;
        }
        // Separator after the move: the right page's new first key.
        let sep = if donor_is_right {
            donor_keys[t].clone()
        } else {
            donor_keys[n - t].clone()
        };
        let new_sep_size = sep.storage_size(schema)?;
        if new_sep_size <= old_sep_size || parent.free_space() >= new_sep_size - old_sep_size {
            chosen = Some((t, sep));
        }
        break;
    }

    let Some((t, sep)) = chosen else {
        let (lp, rp) = (left.page().clone(), right.page().clone());
        unpin(st, session, &lp)?;
        unpin(st, session, &rp)?;
        return Ok(false);
    };

    let left_keys = left.keys()?;
    let right_keys = right.keys()?;
    let (new_left, new_right) = if donor_is_right {
        let mut l = left_keys;
        l.extend_from_slice(&right_keys[..t]);
        (l, right_keys[t..].to_vec())
    } else {
        let split = left_keys.len() - t;
        let mut r = left_keys[split..].to_vec();
        r.extend_from_slice(&right_keys);
        (left_keys[..split].to_vec(), r)
    };

    rebuild_leaf(left.page(), schema, left.parent(), left.next_leaf(), &new_left)?;
    rebuild_leaf(right.page(), schema, right.parent(), right.next_leaf(), &new_right)?;
    parent.replace_key_at(sep_index, &sep)?;

    let (lp, rp) = (left.page().clone(), right.page().clone());
    st.log_page_update(session, &lp)?;
    st.log_page_update(session, &rp)?;
    unpin(st, session, &lp)?;
    unpin(st, session, &rp)?;
    trace!("stole {} entr{} between leaves {} and {}", t, if t == 1 { "y" } else { "ies" }, left_no, right_no);
    Ok(true)
}

/// Merges the right leaf of a pair into the left, removing the separator.
/// Returns false (with a warning) when the combined entries cannot fit.
#[allow(clippy::too_many_arguments)]
fn merge_leaves(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    parent: &mut InnerPage,
    sep_index: usize,
    left_no: u16,
    right_no: u16,
    header: &PageRef,
) -> Result<bool> {
    let left = load_leaf(st, session, file_id, schema, left_no)?;
    let right = load_leaf(st, session, file_id, schema, right_no)?;
    let page_size = left.page().borrow().page_size() as u32;

    if left.used_bytes() + right.used_bytes() > page_size - LEAF_HEADER_SIZE {
        warn!(
            "leaves {} and {} cannot merge ({} + {} bytes); leaving the underfull page",
            left_no,
            right_no,
            left.used_bytes(),
            right.used_bytes()
        );
        let (lp, rp) = (left.page().clone(), right.page().clone());
        unpin(st, session, &lp)?;
        unpin(st, session, &rp)?;
        return Ok(false);
    }

    let mut combined = left.keys()?;
    combined.extend(right.keys()?);
    rebuild_leaf(left.page(), schema, left.parent(), right.next_leaf(), &combined)?;

    let (lp, rp) = (left.page().clone(), right.page().clone());
    st.log_page_update(session, &lp)?;
    unpin(st, session, &lp)?;
    unpin(st, session, &rp)?;
    release_data_page(st, session, file_id, header, right_no)?;
    parent.delete_key_and_right_pointer(sep_index)?;
    debug!("merged leaf {} into {}", right_no, left_no);
    Ok(true)
}

/// An underfull inner page steals pointers from a sibling (rotating the
/// separator through its parent) or merges into the left page of the pair;
/// a root with a single child collapses.
fn rebalance_inner(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    cur_no: u16,
    mut path: Vec<u16>,
    header: &PageRef,
) -> Result<()> {
    let Some(parent_no) = path.pop() else {
        // Root contraction.
        let cur = load_inner(st, session, file_id, schema, cur_no)?;
        if cur.num_pointers() == 1 {
            let child_no = cur.pointer_at(0);
            header.borrow_mut().write_u16(OFFSET_ROOT_PAGE, child_no);
            let cur_page = cur.page().clone();
            unpin(st, session, &cur_page)?;
            drop(cur);

            let child = st.load_dbpage(session, file_id, child_no as u32, false)?;
            set_parent_page(&mut child.borrow_mut(), 0);
            st.log_page_update(session, &child)?;
            unpin(st, session, &child)?;
            release_data_page(st, session, file_id, header, cur_no)?;
            debug!("root {} collapsed into its only child {}", cur_no, child_no);
        } else {
            let cur_page = cur.page().clone();
            unpin(st, session, &cur_page)?;
        }
        return Ok(());
    };

    let mut parent = load_inner(st, session, file_id, schema, parent_no)?;
    let idx = parent.find_pointer_index(cur_no).ok_or_else(|| {
        Error::invalid_arg(format!(
            "inner page {} does not reference child {}",
            parent_no, cur_no
        ))
    })?;

    let mut done = false;
    if idx > 0 {
        let left_no = parent.pointer_at(idx - 1);
        done = try_inner_steal(st, session, file_id, schema, &mut parent, idx - 1, left_no, cur_no, false)?;
    }
    if !done && idx + 1 < parent.num_pointers() {
        let right_no = parent.pointer_at(idx + 1);
        done = try_inner_steal(st, session, file_id, schema, &mut parent, idx, cur_no, right_no, true)?;
    }

    let mut parent_underfull = false;
    if !done {
        let (left_no, right_no, sep_index) = if idx > 0 {
            (parent.pointer_at(idx - 1), cur_no, idx - 1)
        } else {
            (cur_no, parent.pointer_at(idx + 1), idx)
        };
        done = merge_inners(st, session, file_id, schema, &mut parent, sep_index, left_no, right_no, header)?;
        if done {
            parent_underfull = inner_is_underfull(&parent);
        }
    }

    let parent_page = parent.page().clone();
    if done {
        st.log_page_update(session, &parent_page)?;
    }
    unpin(st, session, &parent_page)?;
    drop(parent);

    if done && parent_underfull {
        rebalance_inner(st, session, file_id, schema, parent_no, path, header)?;
    }
    Ok(())
}

fn inner_is_underfull(inner: &InnerPage) -> bool {
    let page_size = inner.page().borrow().page_size() as u32;
    let half = (page_size - INNER_HEADER_SIZE) / 2;
    page_size - inner.free_space() - INNER_HEADER_SIZE < half
}

/// Rotates pointers from the fuller inner page of a pair into the
/// underfull one through the parent separator, leaving the donor at least
/// half full. `donor_is_right` says which side donates.
#[allow(clippy::too_many_arguments)]
fn try_inner_steal(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    parent: &mut InnerPage,
    sep_index: usize,
    left_no: u16,
    right_no: u16,
    donor_is_right: bool,
) -> Result<bool> {
    let left = load_inner(st, session, file_id, schema, left_no)?;
    let right = load_inner(st, session, file_id, schema, right_no)?;
    let capacity = left.page().borrow().page_size() as u32 - INNER_HEADER_SIZE;
    let half = capacity / 2;

    let (left_ptrs, left_keys) = left.decompose()?;
    let (right_ptrs, right_keys) = right.decompose()?;
    let old_sep = parent.key_at(sep_index)?;
    let old_sep_size = old_sep.storage_size(schema)?;

    let donor_len = if donor_is_right {
        right_ptrs.len()
    } else {
        left_ptrs.len()
    };

    let mut chosen = None;
    for t in 1..donor_len {
        let (new_left_ptrs, new_left_keys, new_sep, new_right_ptrs, new_right_keys): (
            Vec<u16>,
            Vec<BTreeKey>,
            BTreeKey,
            Vec<u16>,
            Vec<BTreeKey>,
        ) = if donor_is_right {
            let mut lp = left_ptrs.clone();
            lp.extend_from_slice(&right_ptrs[..t]);
            let mut lk = left_keys.clone();
            lk.push(old_sep.clone());
            lk.extend_from_slice(&right_keys[..t - 1]);
            (
                lp,
                lk,
                right_keys[t - 1].clone(),
                right_ptrs[t..].to_vec(),
                right_keys[t..].to_vec(),
            )
        } else {
            let keep = left_ptrs.len() - t;
            let mut rp = left_ptrs[keep..].to_vec();
            rp.extend_from_slice(&right_ptrs);
            let mut rk = left_keys[keep..].to_vec();
            rk.push(old_sep.clone());
            rk.extend(right_keys.clone());
            (
                left_ptrs[..keep].to_vec(),
                left_keys[..keep - 1].to_vec(),
                left_keys[keep - 1].clone(),
                rp,
                rk,
            )
        };

        let left_bytes = inner_page::inner_storage_size(schema, new_left_ptrs.len(), &new_left_keys)?;
        let right_bytes =
            inner_page::inner_storage_size(schema, new_right_ptrs.len(), &new_right_keys)?;
        let (donor_bytes, receiver_bytes) = if donor_is_right {
            (right_bytes, left_bytes)
        } else {
            (left_bytes, right_bytes)
        };
        if donor_bytes < half {
            break;
        }
        if receiver_bytes < half || receiver_bytes > capacity {
            continue;
        }

        let new_sep_size = new_sep.storage_size(schema)?;
        if new_sep_size <= old_sep_size || parent.free_space() >= new_sep_size - old_sep_size {
            chosen = Some((new_left_ptrs, new_left_keys, new_sep, new_right_ptrs, new_right_keys));
        }
        break;
    }

    let Some((new_left_ptrs, new_left_keys, new_sep, new_right_ptrs, new_right_keys)) = chosen
    else {
        let (lp, rp) = (left.page().clone(), right.page().clone());
        unpin(st, session, &lp)?;
        unpin(st, session, &rp)?;
        return Ok(false);
    };

    let moved: Vec<u16> = if donor_is_right {
        new_left_ptrs[left_ptrs.len()..].to_vec()
    } else {
        new_right_ptrs[..new_right_ptrs.len() - right_ptrs.len()].to_vec()
    };
    let moved_to = if donor_is_right { left_no } else { right_no };

    rebuild_inner(left.page(), schema, left.parent(), &new_left_ptrs, &new_left_keys)?;
    rebuild_inner(right.page(), schema, right.parent(), &new_right_ptrs, &new_right_keys)?;
    parent.replace_key_at(sep_index, &new_sep)?;

    let (lp, rp) = (left.page().clone(), right.page().clone());
    st.log_page_update(session, &lp)?;
    st.log_page_update(session, &rp)?;
    unpin(st, session, &lp)?;
    unpin(st, session, &rp)?;
    reparent_children(st, session, file_id, &moved, moved_to)?;
    trace!(
        "rotated {} pointer(s) between inner pages {} and {}",
        moved.len(),
        left_no,
        right_no
    );
    Ok(true)
}

/// Merges the right inner page of a pair into the left, pulling the
/// separator down between them.
#[allow(clippy::too_many_arguments)]
fn merge_inners(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: &Rc<Schema>,
    parent: &mut InnerPage,
    sep_index: usize,
    left_no: u16,
    right_no: u16,
    header: &PageRef,
) -> Result<bool> {
    let left = load_inner(st, session, file_id, schema, left_no)?;
    let right = load_inner(st, session, file_id, schema, right_no)?;
    let capacity = left.page().borrow().page_size() as u32 - INNER_HEADER_SIZE;

    let sep = parent.key_at(sep_index)?;
    let (mut ptrs, mut keys) = left.decompose()?;
    let (right_ptrs, right_keys) = right.decompose()?;
    keys.push(sep);
    keys.extend(right_keys);
    ptrs.extend_from_slice(&right_ptrs);

    if inner_page::inner_storage_size(schema, ptrs.len(), &keys)? > capacity {
        warn!(
            "inner pages {} and {} cannot merge; leaving the underfull page",
            left_no, right_no
        );
        let (lp, rp) = (left.page().clone(), right.page().clone());
        unpin(st, session, &lp)?;
        unpin(st, session, &rp)?;
        return Ok(false);
    }

    rebuild_inner(left.page(), schema, left.parent(), &ptrs, &keys)?;
    let (lp, rp) = (left.page().clone(), right.page().clone());
    st.log_page_update(session, &lp)?;
    unpin(st, session, &lp)?;
    unpin(st, session, &rp)?;

    reparent_children(st, session, file_id, &right_ptrs, left_no)?;
    release_data_page(st, session, file_id, header, right_no)?;
    parent.delete_key_and_right_pointer(sep_index)?;
    debug!("merged inner {} into {}", right_no, left_no);
    Ok(true)
}

// ============================================================================
// The B+ tree tuple-file manager
// ============================================================================

pub struct BTreeTupleFileManager;

impl BTreeTupleFileManager {
    fn key_from_tuple(&self, tbl: &TableFileInfo, tuple: &dyn Tuple) -> Result<BTreeKey> {
        let ptr = tuple.external_reference().ok_or_else(|| {
            Error::invalid_arg("index entries require the tuple's file pointer")
        })?;
        let mut values = Vec::with_capacity(tbl.schema.num_columns());
        for i in 0..tbl.schema.num_columns() {
            values.push(tuple.get_column_value(i)?);
        }
        Ok(BTreeKey::new(values, ptr))
    }

    /// The first entry at or after the given leaf position, walking the
    /// chain past empty leaves.
    fn entry_at_or_after(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        mut leaf_no: u16,
        mut index: usize,
    ) -> Result<Option<Box<dyn Tuple>>> {
        let file_id = tbl.primary_file();
        while leaf_no != 0 {
            let leaf = load_leaf(st, session, file_id, &tbl.schema, leaf_no)?;
            if index < leaf.num_entries() {
                let key = leaf.key_at(index)?;
                let page = leaf.page().clone();
                unpin(st, session, &page)?;
                return Ok(Some(Box::new(BTreeFilePageTuple {
                    key,
                    leaf_page: leaf_no,
                    entry_index: index,
                })));
            }
            let next = leaf.next_leaf();
            let page = leaf.page().clone();
            unpin(st, session, &page)?;
            leaf_no = next;
            index = 0;
        }
        Ok(None)
    }
}

impl TupleFileManager for BTreeTupleFileManager {
    fn file_type(&self) -> DBFileType {
        DBFileType::BTreeTupleFile
    }

    fn init_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()> {
        let page = st.load_dbpage(session, tbl.primary_file(), 0, true)?;
        {
            let mut pg = page.borrow_mut();
            pg.write_u16(OFFSET_ROOT_PAGE, 0);
            pg.write_u16(OFFSET_FIRST_LEAF, 0);
            pg.write_u16(OFFSET_FIRST_FREE, 0);
            let end = header_page::write_schema(&mut pg, OFFSET_HEADER_SCHEMA, &tbl.schema)?;
            pg.write_u16(OFFSET_SCHEMA_SIZE, (end - OFFSET_HEADER_SCHEMA) as u16);
            header_page::write_stats(&mut pg, end, &tbl.schema, &tbl.stats)?;
        }
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)
    }

    fn load_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()> {
        let page = st.load_dbpage(session, tbl.primary_file(), 0, false)?;
        {
            let pg = page.borrow();
            let (mut schema, end) = header_page::read_schema(&pg, OFFSET_HEADER_SCHEMA)?;
            let recorded = pg.read_u16(OFFSET_SCHEMA_SIZE) as usize;
            if end - OFFSET_HEADER_SCHEMA != recorded {
                return Err(Error::invalid_arg(format!(
                    "index schema is {} bytes but the header records {}",
                    end - OFFSET_HEADER_SCHEMA,
                    recorded
                )));
            }
            schema.set_table_name(&tbl.table_name);
            let (stats, _) = header_page::read_stats(&pg, end, &schema)?;
            tbl.schema = Rc::new(schema);
            tbl.stats = stats;
        }
        st.unpin_page(session, &page)
    }

    fn close_table_file(&self, st: &mut StorageManager, tbl: &TableFileInfo) -> Result<()> {
        for &file_id in &tbl.file_ids {
            st.buffer.remove_dbfile(&mut st.wal, file_id)?;
        }
        Ok(())
    }

    fn drop_table_file(&self, st: &mut StorageManager, tbl: &TableFileInfo) -> Result<()> {
        for &file_id in &tbl.file_ids {
            let name = st.buffer.file_name(file_id)?;
            st.buffer.remove_dbfile(&mut st.wal, file_id)?;
            st.file_manager.delete_dbfile(&name)?;
        }
        Ok(())
    }

    fn get_first_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
    ) -> Result<Option<Box<dyn Tuple>>> {
        let header = st.load_dbpage(session, tbl.primary_file(), 0, false)?;
        let first_leaf = header.borrow().read_u16(OFFSET_FIRST_LEAF);
        st.unpin_page(session, &header)?;
        if first_leaf == 0 {
            return Ok(None);
        }
        self.entry_at_or_after(st, session, tbl, first_leaf, 0)
    }

    fn get_next_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        current: &dyn Tuple,
    ) -> Result<Option<Box<dyn Tuple>>> {
        let cur = current
            .as_any()
            .downcast_ref::<BTreeFilePageTuple>()
            .ok_or_else(|| {
                Error::invalid_arg("B+ tree scans continue only from B+ tree tuples")
            })?;
        self.entry_at_or_after(st, session, tbl, cur.leaf_page, cur.entry_index + 1)
    }

    fn get_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        ptr: FilePointer,
    ) -> Result<Box<dyn Tuple>> {
        // For index files the pointer addresses the entry itself: the leaf
        // page and the entry's byte offset within it.
        let leaf = load_leaf(st, session, tbl.primary_file(), &tbl.schema, ptr.page_no)
            .map_err(|_| Error::InvalidFilePointer(ptr))?;
        let mut found = None;
        for i in 0..leaf.num_entries() {
            if leaf.entry_offset(i) == ptr.offset as u32 {
                found = Some((i, leaf.key_at(i)?));
                break;
            }
        }
        let page = leaf.page().clone();
        st.unpin_page(session, &page)?;
        match found {
            Some((index, key)) => Ok(Box::new(BTreeFilePageTuple {
                key,
                leaf_page: ptr.page_no,
                entry_index: index,
            })),
            None => Err(Error::InvalidFilePointer(ptr)),
        }
    }

    fn add_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &TupleLiteral,
    ) -> Result<FilePointer> {
        let key = self.key_from_tuple(tbl, tuple)?;
        let ptr = key.ptr;
        insert_key(st, session, tbl, key)?;
        Ok(ptr)
    }

    fn update_tuple(
        &self,
        _st: &mut StorageManager,
        _session: SessionId,
        _tbl: &TableFileInfo,
        _tuple: &dyn Tuple,
        _updates: &[(usize, Value)],
    ) -> Result<()> {
        Err(Error::Unsupported(
            "index entries are replaced (delete + add), never updated in place".into(),
        ))
    }

    fn delete_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &dyn Tuple,
    ) -> Result<()> {
        let key = self.key_from_tuple(tbl, tuple)?;
        delete_key(st, session, tbl, &key)
    }

    fn analyze_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()> {
        let mut num_tuples = 0u32;
        let mut total_bytes = 0u64;
        let mut cursor = self.get_first_tuple(st, session, tbl)?;
        while let Some(tuple) = cursor {
            let entry = tuple
                .as_any()
                .downcast_ref::<BTreeFilePageTuple>()
                .ok_or_else(|| Error::invalid_arg("index scan yielded a foreign tuple"))?;
            num_tuples += 1;
            total_bytes += entry.key.storage_size(&tbl.schema)? as u64;
            cursor = self.get_next_tuple(st, session, tbl, tuple.as_ref())?;
        }

        let file_id = tbl.primary_file();
        let num_pages = st.buffer.file(file_id)?.num_pages()?;
        let mut stats = TableStats::empty(tbl.schema.num_columns());
        stats.num_data_pages = (num_pages - 1) as u16;
        stats.num_tuples = num_tuples;
        stats.avg_tuple_size = if num_tuples > 0 {
            total_bytes as f32 / num_tuples as f32
        } else {
            0.0
        };

        let page = st.load_dbpage(session, file_id, 0, false)?;
        {
            let mut pg = page.borrow_mut();
            let schema_size = pg.read_u16(OFFSET_SCHEMA_SIZE) as usize;
            header_page::write_stats(&mut pg, OFFSET_HEADER_SCHEMA + schema_size, &tbl.schema, &stats)?;
        }
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)?;
        tbl.stats = stats;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::schema::{ColumnInfo, ColumnType};
    use crate::storage::btree::verifier::verify_index;

    const SESSION: SessionId = SessionId(1);

    fn open_storage(dir: &std::path::Path, page_size: u32) -> StorageManager {
        let mut config = StorageConfig::default();
        config.base_dir = dir.to_path_buf();
        config.page_size = page_size;
        StorageManager::open(config).unwrap()
    }

    fn int_key_schema() -> Schema {
        Schema::new(vec![ColumnInfo::new("k", ColumnType::Integer)]).unwrap()
    }

    fn entry(k: i32, row: u16) -> TupleLiteral {
        TupleLiteral::with_reference(vec![Value::Integer(k)], FilePointer::new(1, row))
    }

    fn scan_keys(st: &mut StorageManager, tbl: &TableFileInfo) -> Vec<i32> {
        let mut keys = Vec::new();
        let mut cursor = st.get_first_tuple(SESSION, tbl).unwrap();
        while let Some(tuple) = cursor {
            match tuple.get_column_value(0).unwrap() {
                Value::Integer(k) => keys.push(k),
                other => panic!("unexpected value {:?}", other),
            }
            cursor = st.get_next_tuple(SESSION, tbl, tuple.as_ref()).unwrap();
        }
        keys
    }

    fn assert_clean(st: &mut StorageManager, tbl: &TableFileInfo) {
        let problems = verify_index(st, SESSION, tbl).unwrap();
        assert!(problems.is_empty(), "verifier found: {:?}", problems);
    }

    #[test]
    fn test_insert_and_ordered_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path(), 512);
        let tbl = st
            .create_table(SESSION, "idx", int_key_schema(), DBFileType::BTreeTupleFile)
            .unwrap();

        for (row, k) in [42, 7, 19, 3, 88, 51, 23].into_iter().enumerate() {
            st.add_tuple(SESSION, &tbl, &entry(k, row as u16)).unwrap();
        }
        assert_eq!(scan_keys(&mut st, &tbl), vec![3, 7, 19, 23, 42, 51, 88]);
        assert_clean(&mut st, &tbl);
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path(), 512);
        let tbl = st
            .create_table(SESSION, "idx", int_key_schema(), DBFileType::BTreeTupleFile)
            .unwrap();

        st.add_tuple(SESSION, &tbl, &entry(5, 1)).unwrap();
        // Same key value with a different row pointer is fine...
        st.add_tuple(SESSION, &tbl, &entry(5, 2)).unwrap();
        // ...but the identical (key, pointer) pair is not.
        assert!(st.add_tuple(SESSION, &tbl, &entry(5, 1)).is_err());
    }

    #[test]
    fn test_split_with_three_entry_leaves() {
        // 512-byte pages; 120-byte text keys make an entry 127 bytes
        // (1 bitmap + 2 prefix + 120 text + 4 pointer), so a leaf holds 3.
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path(), 512);
        let schema =
            Schema::new(vec![ColumnInfo::new("k", ColumnType::VarChar { length: 200 })]).unwrap();
        let tbl = st
            .create_table(SESSION, "idx", schema, DBFileType::BTreeTupleFile)
            .unwrap();

        let wide = |label: &str| format!("{:-<120}", label);
        for (row, label) in ["k10", "k20", "k30", "k40"].iter().enumerate() {
            st.add_tuple(
                SESSION,
                &tbl,
                &TupleLiteral::with_reference(
                    vec![Value::Text(wide(label))],
                    FilePointer::new(1, row as u16),
                ),
            )
            .unwrap();
        }

        // The root must now be an inner page with one separator equal to
        // the first key of the right leaf ("k30..."), over two leaves
        // [k10, k20] and [k30, k40] chained left-to-right.
        let file_id = tbl.primary_file();
        let header = st.load_dbpage(SESSION, file_id, 0, false).unwrap();
        let root_no = header.borrow().read_u16(OFFSET_ROOT_PAGE);
        let first_leaf = header.borrow().read_u16(OFFSET_FIRST_LEAF);
        st.unpin_page(SESSION, &header).unwrap();

        let root = load_inner(&mut st, SESSION, file_id, &tbl.schema, root_no).unwrap();
        assert_eq!(root.num_pointers(), 2);
        let sep = root.key_at(0).unwrap();
        assert_eq!(sep.values[0], Value::Text(wide("k30")));
        assert_eq!(root.pointer_at(0), first_leaf);
        let root_page = root.page().clone();
        st.unpin_page(SESSION, &root_page).unwrap();

        let left = load_leaf(&mut st, SESSION, file_id, &tbl.schema, first_leaf).unwrap();
        assert_eq!(left.num_entries(), 2);
        let right_no = left.next_leaf();
        let lp = left.page().clone();
        st.unpin_page(SESSION, &lp).unwrap();

        let right = load_leaf(&mut st, SESSION, file_id, &tbl.schema, right_no).unwrap();
        assert_eq!(right.num_entries(), 2);
        assert_eq!(right.next_leaf(), 0);
        assert_eq!(right.key_at(0).unwrap().values[0], Value::Text(wide("k30")));
        let rp = right.page().clone();
        st.unpin_page(SESSION, &rp).unwrap();

        assert_clean(&mut st, &tbl);
    }

    #[test]
    fn test_large_insert_set_stays_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path(), 512);
        let tbl = st
            .create_table(SESSION, "idx", int_key_schema(), DBFileType::BTreeTupleFile)
            .unwrap();

        // A deterministic shuffle of 0..500.
        let mut inserted: Vec<i32> = Vec::new();
        let mut x = 1i64;
        for row in 0..500u16 {
            x = (x * 48271) % 2147483647;
            let k = (x % 10000) as i32;
            let lit = TupleLiteral::with_reference(vec![Value::Integer(k)], FilePointer::new(2, row));
            st.add_tuple(SESSION, &tbl, &lit).unwrap();
            inserted.push(k);
        }
        inserted.sort_unstable();

        assert_eq!(scan_keys(&mut st, &tbl), inserted);
        assert_clean(&mut st, &tbl);
    }

    #[test]
    fn test_delete_mirrors_insert() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path(), 512);
        let tbl = st
            .create_table(SESSION, "idx", int_key_schema(), DBFileType::BTreeTupleFile)
            .unwrap();

        for row in 0..200u16 {
            st.add_tuple(SESSION, &tbl, &entry(row as i32, row)).unwrap();
        }
        assert_clean(&mut st, &tbl);

        // Delete every other key, then verify structure and contents.
        for row in (0..200u16).step_by(2) {
            let lit = entry(row as i32, row);
            st.delete_tuple(SESSION, &tbl, &lit).unwrap();
        }
        let expected: Vec<i32> = (1..200).step_by(2).collect();
        assert_eq!(scan_keys(&mut st, &tbl), expected);
        assert_clean(&mut st, &tbl);

        // Delete the rest; the tree must collapse to empty.
        for row in (1..200u16).step_by(2) {
            let lit = entry(row as i32, row);
            st.delete_tuple(SESSION, &tbl, &lit).unwrap();
        }
        assert_eq!(scan_keys(&mut st, &tbl), Vec::<i32>::new());
        assert_clean(&mut st, &tbl);

        // Freed pages are reused for new inserts.
        for row in 0..50u16 {
            st.add_tuple(SESSION, &tbl, &entry(row as i32, row)).unwrap();
        }
        assert_eq!(scan_keys(&mut st, &tbl).len(), 50);
        assert_clean(&mut st, &tbl);
    }

    #[test]
    fn test_deleting_missing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path(), 512);
        let tbl = st
            .create_table(SESSION, "idx", int_key_schema(), DBFileType::BTreeTupleFile)
            .unwrap();
        assert!(st.delete_tuple(SESSION, &tbl, &entry(1, 1)).is_err());
        st.add_tuple(SESSION, &tbl, &entry(1, 1)).unwrap();
        assert!(st.delete_tuple(SESSION, &tbl, &entry(2, 2)).is_err());
    }
}
