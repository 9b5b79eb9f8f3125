//! B+ tree inner (non-leaf) pages.
//!
//! Layout: `type(1) parent(2) numPointers(2)` then, from offset 5, the
//! alternating sequence `ptr0 key0 ptr1 key1 ... key(k-1) ptrk` with
//! 2-byte child page pointers and keys in the same serialized form as leaf
//! entries. Child `i` holds keys in `[key(i-1), key(i))`.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::storage::btree::{read_key_at, write_key_at, BTreeKey, BTREE_INNER_PAGE};
use crate::storage::dbpage::PageRef;

pub const OFFSET_PARENT: usize = 1;
pub const OFFSET_NUM_POINTERS: usize = 3;

/// First byte of pointer/key storage.
pub const INNER_HEADER_SIZE: u32 = 5;

/// A loaded inner page with pointer and key offsets computed.
pub struct InnerPage {
    page: PageRef,
    schema: Rc<Schema>,
    ptr_offsets: Vec<u32>,
    key_offsets: Vec<u32>,
    end_offset: u32,
}

impl InnerPage {
    pub fn load(page: PageRef, schema: Rc<Schema>) -> Result<InnerPage> {
        let num_pointers = {
            let pg = page.borrow();
            if pg.read_u8(0) != BTREE_INNER_PAGE {
                return Err(Error::invalid_arg(format!(
                    "page {} is not an inner page (type byte {})",
                    pg.page_no(),
                    pg.read_u8(0)
                )));
            }
            pg.read_u16(OFFSET_NUM_POINTERS) as usize
        };

        let mut ptr_offsets = Vec::with_capacity(num_pointers);
        let mut key_offsets = Vec::with_capacity(num_pointers.saturating_sub(1));
        let mut pos = INNER_HEADER_SIZE;
        for i in 0..num_pointers {
            ptr_offsets.push(pos);
            pos += 2;
            if i + 1 < num_pointers {
                key_offsets.push(pos);
                let (_, size) = read_key_at(&page, pos, &schema)?;
                pos += size;
            }
        }
        Ok(InnerPage {
            page,
            schema,
            ptr_offsets,
            key_offsets,
            end_offset: pos,
        })
    }

    pub fn page(&self) -> &PageRef {
        &self.page
    }

    pub fn page_no(&self) -> u32 {
        self.page.borrow().page_no()
    }

    pub fn num_pointers(&self) -> usize {
        self.ptr_offsets.len()
    }

    pub fn num_keys(&self) -> usize {
        self.key_offsets.len()
    }

    pub fn parent(&self) -> u16 {
        self.page.borrow().read_u16(OFFSET_PARENT)
    }

    pub fn free_space(&self) -> u32 {
        self.page.borrow().page_size() as u32 - self.end_offset
    }

    pub fn pointer_at(&self, index: usize) -> u16 {
        self.page
            .borrow()
            .read_u16(self.ptr_offsets[index] as usize)
    }

    pub fn key_at(&self, index: usize) -> Result<BTreeKey> {
        let (key, _) = read_key_at(&self.page, self.key_offsets[index], &self.schema)?;
        Ok(key)
    }

    /// All child pointers and keys, materialized for the rewrite-based
    /// relocation, split, and merge paths.
    pub fn decompose(&self) -> Result<(Vec<u16>, Vec<BTreeKey>)> {
        let ptrs = (0..self.num_pointers()).map(|i| self.pointer_at(i)).collect();
        let keys = (0..self.num_keys())
            .map(|i| self.key_at(i))
            .collect::<Result<Vec<_>>>()?;
        Ok((ptrs, keys))
    }

    /// The position of the child pointer to descend for `key`: the least
    /// `i` with `key < key(i)`, or the last pointer. Equal keys descend
    /// right.
    pub fn navigate(&self, key: &BTreeKey) -> Result<usize> {
        for i in 0..self.num_keys() {
            if key.compare(&self.key_at(i)?)? == Ordering::Less {
                return Ok(i);
            }
        }
        Ok(self.num_pointers() - 1)
    }

    /// Which pointer slot references `child_page`, if any.
    pub fn find_pointer_index(&self, child_page: u16) -> Option<usize> {
        (0..self.num_pointers()).find(|&i| self.pointer_at(i) == child_page)
    }

    /// Inserts separator `key` and the pointer to its right child
    /// immediately after pointer `index`. The caller must have confirmed
    /// there is room.
    pub fn insert_key_and_right_pointer(
        &mut self,
        index: usize,
        key: &BTreeKey,
        right_child: u16,
    ) -> Result<()> {
        let key_size = key.storage_size(&self.schema)?;
        let grow = key_size + 2;
        debug_assert!(self.free_space() >= grow);

        // The new bytes go right after pointer `index`.
        let off = self.ptr_offsets[index] + 2;
        {
            let mut pg = self.page.borrow_mut();
            pg.move_bytes(off as usize, (self.end_offset - off) as usize, (off + grow) as usize);
            let key_end = write_key_at(&mut pg, off, &self.schema, key)?;
            pg.write_u16(key_end as usize, right_child);
            let n = pg.read_u16(OFFSET_NUM_POINTERS);
            pg.write_u16(OFFSET_NUM_POINTERS, n + 1);
        }

        for later in self.key_offsets[index..].iter_mut() {
            *later += grow;
        }
        for later in self.ptr_offsets[index + 1..].iter_mut() {
            *later += grow;
        }
        self.key_offsets.insert(index, off);
        self.ptr_offsets.insert(index + 1, off + key_size);
        self.end_offset += grow;
        Ok(())
    }

    /// Replaces the separator at `key_index` with a (possibly differently
    /// sized) copy. Fails without modifying anything when the page lacks
    /// room for a larger separator.
    pub fn replace_key_at(&mut self, key_index: usize, key: &BTreeKey) -> Result<()> {
        let new_size = key.storage_size(&self.schema)?;
        let old_off = self.key_offsets[key_index];
        let old_size = self.ptr_offsets[key_index + 1] - old_off;

        if new_size > old_size && self.free_space() < new_size - old_size {
            return Err(Error::invalid_arg(format!(
                "inner page {} lacks room to grow a separator by {} bytes",
                self.page_no(),
                new_size - old_size
            )));
        }

        let tail = old_off + old_size;
        {
            let mut pg = self.page.borrow_mut();
            pg.move_bytes(
                tail as usize,
                (self.end_offset - tail) as usize,
                (old_off + new_size) as usize,
            );
            if new_size < old_size {
                let shrink = old_size - new_size;
                pg.fill((self.end_offset - shrink) as usize, shrink as usize, 0);
            }
            write_key_at(&mut pg, old_off, &self.schema, key)?;
        }

        let delta = new_size as i64 - old_size as i64;
        for later in self.key_offsets[key_index + 1..].iter_mut() {
            *later = (*later as i64 + delta) as u32;
        }
        for later in self.ptr_offsets[key_index + 1..].iter_mut() {
            *later = (*later as i64 + delta) as u32;
        }
        self.end_offset = (self.end_offset as i64 + delta) as u32;
        Ok(())
    }

    /// Removes the separator at `key_index` and the pointer to its right;
    /// used when merging the two children it separated.
    pub fn delete_key_and_right_pointer(&mut self, key_index: usize) -> Result<()> {
        let off = self.key_offsets[key_index];
        let end = self.ptr_offsets[key_index + 1] + 2;
        let gone = end - off;

        {
            let mut pg = self.page.borrow_mut();
            pg.move_bytes(end as usize, (self.end_offset - end) as usize, off as usize);
            pg.fill((self.end_offset - gone) as usize, gone as usize, 0);
            let n = pg.read_u16(OFFSET_NUM_POINTERS);
            pg.write_u16(OFFSET_NUM_POINTERS, n - 1);
        }

        self.key_offsets.remove(key_index);
        self.ptr_offsets.remove(key_index + 1);
        for later in self.key_offsets[key_index..].iter_mut() {
            *later -= gone;
        }
        for later in self.ptr_offsets[key_index + 1..].iter_mut() {
            *later -= gone;
        }
        self.end_offset -= gone;
        Ok(())
    }
}

/// Rewrites a page as an inner page holding `ptrs` and `keys`
/// (`ptrs.len() == keys.len() + 1`).
pub fn rebuild_inner(
    page: &PageRef,
    schema: &Rc<Schema>,
    parent: u16,
    ptrs: &[u16],
    keys: &[BTreeKey],
) -> Result<()> {
    debug_assert_eq!(ptrs.len(), keys.len() + 1);
    let mut pg = page.borrow_mut();
    let page_size = pg.page_size();
    pg.fill(0, page_size, 0);
    pg.write_u8(0, BTREE_INNER_PAGE);
    pg.write_u16(OFFSET_PARENT, parent);
    pg.write_u16(OFFSET_NUM_POINTERS, ptrs.len() as u16);

    let mut pos = INNER_HEADER_SIZE;
    for (i, ptr) in ptrs.iter().enumerate() {
        pg.write_u16(pos as usize, *ptr);
        pos += 2;
        if i < keys.len() {
            pos = write_key_at(&mut pg, pos, schema, &keys[i])?;
        }
    }
    Ok(())
}

/// The bytes `ptrs`/`keys` would occupy in an inner page.
pub fn inner_storage_size(schema: &Schema, ptrs_len: usize, keys: &[BTreeKey]) -> Result<u32> {
    let mut size = 2 * ptrs_len as u32;
    for key in keys {
        size += key.storage_size(schema)?;
    }
    Ok(size)
}
