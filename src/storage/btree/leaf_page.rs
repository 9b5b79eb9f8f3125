//! B+ tree leaf pages.
//!
//! Layout: `type(1) parent(2) nextLeaf(2) numEntries(2)` then entries
//! packed in ascending key order from offset 7. Each entry is a key tuple
//! (null bitmap + values) followed by the 4-byte external tuple pointer
//! that makes every stored key unique. A next-leaf of 0 terminates the
//! sibling chain.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::storage::btree::{read_key_at, write_key_at, BTreeKey, BTREE_LEAF_PAGE};
use crate::storage::dbpage::{DBPage, PageRef};

pub const OFFSET_PARENT: usize = 1;
pub const OFFSET_NEXT_LEAF: usize = 3;
pub const OFFSET_NUM_ENTRIES: usize = 5;

/// First byte of entry storage.
pub const LEAF_HEADER_SIZE: u32 = 7;

/// Prepares a zeroed page as an empty leaf.
pub fn init_leaf_page(page: &mut DBPage, parent: u16) {
    page.fill(0, page.page_size(), 0);
    page.write_u8(0, BTREE_LEAF_PAGE);
    page.write_u16(OFFSET_PARENT, parent);
    page.write_u16(OFFSET_NEXT_LEAF, 0);
    page.write_u16(OFFSET_NUM_ENTRIES, 0);
}

/// Parent pointers sit at the same offset in leaf and inner pages, so tree
/// maintenance can re-parent a child without knowing its kind.
pub fn set_parent_page(page: &mut DBPage, parent: u16) {
    page.write_u16(OFFSET_PARENT, parent);
}

pub fn parent_page(page: &DBPage) -> u16 {
    page.read_u16(OFFSET_PARENT)
}

/// A loaded leaf with its entry offsets computed.
pub struct LeafPage {
    page: PageRef,
    schema: Rc<Schema>,
    entry_offsets: Vec<u32>,
    end_offset: u32,
}

impl LeafPage {
    pub fn load(page: PageRef, schema: Rc<Schema>) -> Result<LeafPage> {
        let num_entries = {
            let pg = page.borrow();
            if pg.read_u8(0) != BTREE_LEAF_PAGE {
                return Err(Error::invalid_arg(format!(
                    "page {} is not a leaf page (type byte {})",
                    pg.page_no(),
                    pg.read_u8(0)
                )));
            }
            pg.read_u16(OFFSET_NUM_ENTRIES) as usize
        };

        let mut entry_offsets = Vec::with_capacity(num_entries);
        let mut pos = LEAF_HEADER_SIZE;
        for _ in 0..num_entries {
            entry_offsets.push(pos);
            let (_, size) = read_key_at(&page, pos, &schema)?;
            pos += size;
        }
        Ok(LeafPage {
            page,
            schema,
            entry_offsets,
            end_offset: pos,
        })
    }

    pub fn page(&self) -> &PageRef {
        &self.page
    }

    pub fn page_no(&self) -> u32 {
        self.page.borrow().page_no()
    }

    pub fn num_entries(&self) -> usize {
        self.entry_offsets.len()
    }

    pub fn parent(&self) -> u16 {
        self.page.borrow().read_u16(OFFSET_PARENT)
    }

    pub fn set_parent(&mut self, parent: u16) {
        self.page.borrow_mut().write_u16(OFFSET_PARENT, parent);
    }

    pub fn next_leaf(&self) -> u16 {
        self.page.borrow().read_u16(OFFSET_NEXT_LEAF)
    }

    pub fn set_next_leaf(&mut self, next: u16) {
        self.page.borrow_mut().write_u16(OFFSET_NEXT_LEAF, next);
    }

    pub fn free_space(&self) -> u32 {
        self.page.borrow().page_size() as u32 - self.end_offset
    }

    /// Bytes occupied by entries.
    pub fn used_bytes(&self) -> u32 {
        self.end_offset - LEAF_HEADER_SIZE
    }

    pub fn entry_offset(&self, index: usize) -> u32 {
        self.entry_offsets[index]
    }

    pub fn entry_size(&self, index: usize) -> u32 {
        let end = self
            .entry_offsets
            .get(index + 1)
            .copied()
            .unwrap_or(self.end_offset);
        end - self.entry_offsets[index]
    }

    pub fn key_at(&self, index: usize) -> Result<BTreeKey> {
        let (key, _) = read_key_at(&self.page, self.entry_offsets[index], &self.schema)?;
        Ok(key)
    }

    /// All keys, materialized. Used by relocation, splits, and merges,
    /// which rewrite whole pages rather than shuffling bytes.
    pub fn keys(&self) -> Result<Vec<BTreeKey>> {
        (0..self.num_entries()).map(|i| self.key_at(i)).collect()
    }

    /// Where `key` belongs in sorted order, and whether an identical key
    /// (tuple pointer included) is already stored there.
    pub fn find_position(&self, key: &BTreeKey) -> Result<(usize, bool)> {
        for i in 0..self.num_entries() {
            match key.compare(&self.key_at(i)?)? {
                std::cmp::Ordering::Less => return Ok((i, false)),
                std::cmp::Ordering::Equal => return Ok((i, true)),
                std::cmp::Ordering::Greater => {}
            }
        }
        Ok((self.num_entries(), false))
    }

    /// Inserts an entry at `index`, shifting later entries up the page.
    /// The caller must have confirmed the key fits.
    pub fn insert_entry(&mut self, index: usize, key: &BTreeKey) -> Result<()> {
        let size = key.storage_size(&self.schema)?;
        debug_assert!(self.free_space() >= size);
        let off = self
            .entry_offsets
            .get(index)
            .copied()
            .unwrap_or(self.end_offset);

        {
            let mut pg = self.page.borrow_mut();
            pg.move_bytes(off as usize, (self.end_offset - off) as usize, (off + size) as usize);
            write_key_at(&mut pg, off, &self.schema, key)?;
            let n = pg.read_u16(OFFSET_NUM_ENTRIES);
            pg.write_u16(OFFSET_NUM_ENTRIES, n + 1);
        }

        for later in self.entry_offsets[index..].iter_mut() {
            *later += size;
        }
        self.entry_offsets.insert(index, off);
        self.end_offset += size;
        Ok(())
    }

    /// Removes the entry at `index`, shifting later entries down and
    /// zeroing the freed tail.
    pub fn delete_entry(&mut self, index: usize) -> Result<()> {
        let size = self.entry_size(index);
        let off = self.entry_offsets[index];

        {
            let mut pg = self.page.borrow_mut();
            pg.move_bytes(
                (off + size) as usize,
                (self.end_offset - off - size) as usize,
                off as usize,
            );
            pg.fill((self.end_offset - size) as usize, size as usize, 0);
            let n = pg.read_u16(OFFSET_NUM_ENTRIES);
            pg.write_u16(OFFSET_NUM_ENTRIES, n - 1);
        }

        self.entry_offsets.remove(index);
        for later in self.entry_offsets[index..].iter_mut() {
            *later -= size;
        }
        self.end_offset -= size;
        Ok(())
    }
}

/// Rewrites a page as a leaf holding exactly `keys`, in order.
pub fn rebuild_leaf(
    page: &PageRef,
    schema: &Rc<Schema>,
    parent: u16,
    next_leaf: u16,
    keys: &[BTreeKey],
) -> Result<()> {
    let mut pg = page.borrow_mut();
    let page_size = pg.page_size();
    pg.fill(0, page_size, 0);
    pg.write_u8(0, BTREE_LEAF_PAGE);
    pg.write_u16(OFFSET_PARENT, parent);
    pg.write_u16(OFFSET_NEXT_LEAF, next_leaf);
    pg.write_u16(OFFSET_NUM_ENTRIES, keys.len() as u16);
    let mut pos = LEAF_HEADER_SIZE;
    for key in keys {
        pos = write_key_at(&mut pg, pos, schema, key)?;
    }
    Ok(())
}
