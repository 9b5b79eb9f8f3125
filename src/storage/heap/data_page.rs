//! The slotted data-page layout used by heap files.
//!
//! Layout: a 2-byte slot count at offset 0, then one 2-byte slot per tuple
//! holding the tuple's start offset (`EMPTY_SLOT` marks a deleted tuple).
//! Tuple data is packed at the end of the page and grows downward toward
//! the slot array; the free region lies between the slot array and the
//! lowest tuple offset.

use crate::error::{Error, Result};
use crate::storage::dbpage::DBPage;

/// Offset of the slot count.
pub const OFFSET_NUM_SLOTS: u32 = 0;

/// Slot value marking an empty (deleted) slot. Offset 0 can never hold a
/// tuple, so zero is unambiguous.
pub const EMPTY_SLOT: u16 = 0;

/// Prepares a fresh page as an empty data page.
pub fn init_new_page(page: &mut DBPage) {
    page.fill(0, page.page_size(), 0);
    page.write_u16(OFFSET_NUM_SLOTS as usize, 0);
}

pub fn num_slots(page: &DBPage) -> u16 {
    page.read_u16(OFFSET_NUM_SLOTS as usize)
}

fn set_num_slots(page: &mut DBPage, n: u16) {
    page.write_u16(OFFSET_NUM_SLOTS as usize, n);
}

/// Byte offset of a slot's entry in the slot array.
fn slot_entry_offset(slot: u16) -> usize {
    2 + 2 * slot as usize
}

/// The tuple-start offset stored in `slot`, or `EMPTY_SLOT`.
pub fn slot_value(page: &DBPage, slot: u16) -> Result<u16> {
    if slot >= num_slots(page) {
        return Err(Error::invalid_arg(format!(
            "slot {} out of range ({} slots on page {})",
            slot,
            num_slots(page),
            page.page_no()
        )));
    }
    Ok(page.read_u16(slot_entry_offset(slot)))
}

fn set_slot_value(page: &mut DBPage, slot: u16, value: u16) {
    page.write_u16(slot_entry_offset(slot), value);
}

/// One past the end of the slot array.
pub fn slot_array_end(page: &DBPage) -> u32 {
    2 + 2 * num_slots(page) as u32
}

/// The lowest tuple-start offset on the page, or the page size when the
/// page holds no tuples.
pub fn tuple_data_start(page: &DBPage) -> u32 {
    let mut start = page.page_size() as u32;
    for slot in 0..num_slots(page) {
        let value = page.read_u16(slot_entry_offset(slot));
        if value != EMPTY_SLOT && (value as u32) < start {
            start = value as u32;
        }
    }
    start
}

/// Bytes available between the slot array and the tuple data.
pub fn free_space(page: &DBPage) -> u32 {
    tuple_data_start(page) - slot_array_end(page)
}

/// The stored length of the tuple in `slot`: the gap between its offset and
/// the next-higher tuple offset (or the end of the page).
pub fn get_tuple_length(page: &DBPage, slot: u16) -> Result<u32> {
    let off = slot_value(page, slot)?;
    if off == EMPTY_SLOT {
        return Err(Error::invalid_arg(format!(
            "slot {} on page {} is empty",
            slot,
            page.page_no()
        )));
    }
    let mut end = page.page_size() as u32;
    for other in 0..num_slots(page) {
        let value = page.read_u16(slot_entry_offset(other));
        if value != EMPTY_SLOT && value > off && (value as u32) < end {
            end = value as u32;
        }
    }
    Ok(end - off as u32)
}

/// Allocates space for a `len`-byte tuple, reusing an empty slot when one
/// exists. Returns the slot index and the tuple's start offset; the space
/// is zeroed. Fails when the page lacks room (including the 2 bytes for a
/// new slot entry, when one is needed).
pub fn alloc_new_tuple(page: &mut DBPage, len: u32) -> Result<(u16, u32)> {
    let n = num_slots(page);
    let reuse = (0..n).find(|&s| page.read_u16(slot_entry_offset(s)) == EMPTY_SLOT);
    let needed = len + if reuse.is_none() { 2 } else { 0 };
    if free_space(page) < needed {
        return Err(Error::invalid_arg(format!(
            "page {} has {} free bytes, needs {}",
            page.page_no(),
            free_space(page),
            needed
        )));
    }

    let slot = match reuse {
        Some(s) => s,
        None => {
            set_num_slots(page, n + 1);
            n
        }
    };
    let off = tuple_data_start(page) - len;
    set_slot_value(page, slot, off as u16);
    page.fill(off as usize, len as usize, 0);
    Ok((slot, off))
}

/// Deletes the tuple in `slot`: its bytes are squeezed out of the tuple
/// data region, the slot is marked empty, and trailing empty slots are
/// trimmed from the slot array.
pub fn delete_tuple(page: &mut DBPage, slot: u16) -> Result<()> {
    let off = slot_value(page, slot)?;
    if off == EMPTY_SLOT {
        return Err(Error::invalid_arg(format!(
            "slot {} on page {} is already empty",
            slot,
            page.page_no()
        )));
    }
    let len = get_tuple_length(page, slot)?;
    delete_tuple_data_range(page, off as u32, len)?;
    set_slot_value(page, slot, EMPTY_SLOT);

    let mut n = num_slots(page);
    while n > 0 && page.read_u16(slot_entry_offset(n - 1)) == EMPTY_SLOT {
        n -= 1;
    }
    set_num_slots(page, n);
    Ok(())
}

/// Opens a gap of `len` bytes ending at `off`: tuple data in
/// `[tuple_data_start, off)` slides toward the start of the page by `len`,
/// and every slot pointing below `off` is adjusted. The new space
/// `[off - len, off)` is zeroed.
pub fn insert_tuple_data_range(page: &mut DBPage, off: u32, len: u32) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let start = tuple_data_start(page);
    debug_assert!(off >= start && off <= page.page_size() as u32);
    if free_space(page) < len {
        return Err(Error::invalid_arg(format!(
            "page {} has {} free bytes, cannot open a {}-byte gap",
            page.page_no(),
            free_space(page),
            len
        )));
    }

    page.move_bytes(start as usize, (off - start) as usize, (start - len) as usize);
    page.fill((off - len) as usize, len as usize, 0);

    for slot in 0..num_slots(page) {
        let value = page.read_u16(slot_entry_offset(slot));
        if value != EMPTY_SLOT && (value as u32) < off {
            set_slot_value(page, slot, value - len as u16);
        }
    }
    Ok(())
}

/// Removes the byte range `[off, off + len)`: tuple data in
/// `[tuple_data_start, off)` slides toward the end of the page by `len`,
/// and every slot pointing below `off` is adjusted.
pub fn delete_tuple_data_range(page: &mut DBPage, off: u32, len: u32) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let start = tuple_data_start(page);
    debug_assert!(off >= start && off + len <= page.page_size() as u32);

    page.move_bytes(start as usize, (off - start) as usize, (start + len) as usize);
    page.fill(start as usize, len as usize, 0);

    for slot in 0..num_slots(page) {
        let value = page.read_u16(slot_entry_offset(slot));
        if value != EMPTY_SLOT && (value as u32) < off {
            set_slot_value(page, slot, value + len as u16);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    fn data_page(size: usize) -> DBPage {
        let mut page = DBPage::new(FileId(1), 1, vec![0u8; size]);
        init_new_page(&mut page);
        page
    }

    #[test]
    fn test_alloc_and_layout() {
        let mut page = data_page(512);
        assert_eq!(free_space(&page), 510);

        let (slot0, off0) = alloc_new_tuple(&mut page, 10).unwrap();
        assert_eq!(slot0, 0);
        assert_eq!(off0, 502);

        let (slot1, off1) = alloc_new_tuple(&mut page, 20).unwrap();
        assert_eq!(slot1, 1);
        assert_eq!(off1, 482);

        assert_eq!(num_slots(&page), 2);
        assert_eq!(free_space(&page), 482 - 6);
        assert_eq!(get_tuple_length(&page, 0).unwrap(), 10);
        assert_eq!(get_tuple_length(&page, 1).unwrap(), 20);
    }

    #[test]
    fn test_alloc_rejects_overflow() {
        let mut page = data_page(512);
        assert!(alloc_new_tuple(&mut page, 509).is_err());
        alloc_new_tuple(&mut page, 300).unwrap();
        assert!(alloc_new_tuple(&mut page, 250).is_err());
    }

    #[test]
    fn test_delete_compacts_and_reuses_slot() {
        let mut page = data_page(512);
        let (_s0, _o0) = alloc_new_tuple(&mut page, 10).unwrap();
        let (s1, o1) = alloc_new_tuple(&mut page, 20).unwrap();
        let (_s2, _o2) = alloc_new_tuple(&mut page, 30).unwrap();
        page.write_u8(o1 as usize, 0xaa);

        delete_tuple(&mut page, 0).unwrap();
        // Slot 1's tuple slid toward the end of the page by 10 bytes.
        assert_eq!(slot_value(&page, s1).unwrap(), (o1 + 10) as u16);
        assert_eq!(page.read_u8(slot_value(&page, s1).unwrap() as usize), 0xaa);

        // Slot 0 is reusable; a new allocation takes it.
        let (slot, _off) = alloc_new_tuple(&mut page, 5).unwrap();
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_trailing_empty_slots_trimmed() {
        let mut page = data_page(512);
        alloc_new_tuple(&mut page, 10).unwrap();
        alloc_new_tuple(&mut page, 10).unwrap();
        delete_tuple(&mut page, 1).unwrap();
        assert_eq!(num_slots(&page), 1);
        delete_tuple(&mut page, 0).unwrap();
        assert_eq!(num_slots(&page), 0);
        assert_eq!(free_space(&page), 510);
    }

    #[test]
    fn test_insert_and_delete_ranges_fix_slots() {
        let mut page = data_page(512);
        let (_s0, o0) = alloc_new_tuple(&mut page, 8).unwrap();
        let (_s1, o1) = alloc_new_tuple(&mut page, 8).unwrap();
        page.write_u64(o0 as usize, 0x1111_1111_1111_1111);
        page.write_u64(o1 as usize, 0x2222_2222_2222_2222);

        // Grow the slot-1 tuple by 4 bytes at its end boundary.
        insert_tuple_data_range(&mut page, o1 + 8, 4).unwrap();
        assert_eq!(slot_value(&page, 1).unwrap() as u32, o1 - 4);
        assert_eq!(slot_value(&page, 0).unwrap() as u32, o0);
        assert_eq!(page.read_u64((o1 - 4) as usize), 0x2222_2222_2222_2222);

        // Shrink it back.
        delete_tuple_data_range(&mut page, o1 + 4, 4).unwrap();
        assert_eq!(slot_value(&page, 1).unwrap() as u32, o1);
        assert_eq!(page.read_u64(o1 as usize), 0x2222_2222_2222_2222);
    }
}
