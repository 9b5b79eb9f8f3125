//! Structural verification of B+ tree index files.
//!
//! Five passes: (1) classify every page by its type byte, (2) walk the
//! tree recursively checking intra-page order, parent/child key bounds,
//! parent pointers, and child homogeneity, (3) traverse the leaf chain
//! checking global key order, (4) traverse the free list, (5) reconcile:
//! every inner/leaf page reachable from the root exactly once, every leaf
//! on the chain exactly once, every empty page on the free list exactly
//! once. Problems are collected as messages; nothing is repaired.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::error::Result;
use crate::schema::Schema;
use crate::storage::btree::{
    inner_page::InnerPage, leaf_page::LeafPage, BTreeKey, BTREE_EMPTY_PAGE, BTREE_INNER_PAGE,
    BTREE_LEAF_PAGE, OFFSET_FIRST_FREE, OFFSET_FIRST_LEAF, OFFSET_NEXT_FREE, OFFSET_ROOT_PAGE,
};
use crate::storage::storage_manager::{StorageManager, TableFileInfo};
use crate::types::{FileId, SessionId};

struct Verifier<'a> {
    st: &'a mut StorageManager,
    session: SessionId,
    file_id: FileId,
    schema: Rc<Schema>,
    num_pages: u32,
    page_types: Vec<u8>,
    tree_visits: Vec<u32>,
    chain_visits: Vec<u32>,
    free_visits: Vec<u32>,
    problems: Vec<String>,
}

/// Runs all five verification passes and returns the problems found (empty
/// when the index is structurally sound).
pub fn verify_index(
    st: &mut StorageManager,
    session: SessionId,
    tbl: &TableFileInfo,
) -> Result<Vec<String>> {
    let file_id = tbl.primary_file();
    let num_pages = st.buffer.file(file_id)?.num_pages()?;

    let mut verifier = Verifier {
        st,
        session,
        file_id,
        schema: tbl.schema.clone(),
        num_pages,
        page_types: vec![0; num_pages as usize],
        tree_visits: vec![0; num_pages as usize],
        chain_visits: vec![0; num_pages as usize],
        free_visits: vec![0; num_pages as usize],
        problems: Vec::new(),
    };

    let header = verifier
        .st
        .load_dbpage(session, file_id, 0, false)?;
    let root = header.borrow().read_u16(OFFSET_ROOT_PAGE);
    let first_leaf = header.borrow().read_u16(OFFSET_FIRST_LEAF);
    let first_free = header.borrow().read_u16(OFFSET_FIRST_FREE);
    verifier.st.unpin_page(session, &header)?;

    verifier.scan_page_types()?;
    if root != 0 {
        verifier.walk_tree(root, None, None, 0)?;
    } else if first_leaf != 0 {
        verifier
            .problems
            .push(format!("tree is empty but first leaf is {}", first_leaf));
    }
    verifier.walk_leaf_chain(first_leaf, root)?;
    verifier.walk_free_list(first_free)?;
    verifier.reconcile();

    Ok(verifier.problems)
}

/// Convenience wrapper that turns verifier findings into a `CorruptIndex`
/// error.
pub fn check_index(
    st: &mut StorageManager,
    session: SessionId,
    tbl: &TableFileInfo,
) -> Result<()> {
    let problems = verify_index(st, session, tbl)?;
    if problems.is_empty() {
        Ok(())
    } else {
        Err(crate::error::Error::CorruptIndex {
            file: crate::storage::storage_manager::table_file_name(&tbl.table_name),
            problems,
        })
    }
}

impl<'a> Verifier<'a> {
    fn problem(&mut self, message: String) {
        self.problems.push(message);
    }

    // Pass 1: classify every page.
    fn scan_page_types(&mut self) -> Result<()> {
        for page_no in 1..self.num_pages {
            let page = self
                .st
                .load_dbpage(self.session, self.file_id, page_no, false)?;
            let page_type = page.borrow().read_u8(0);
            self.st.unpin_page(self.session, &page)?;
            self.page_types[page_no as usize] = page_type;
            if !matches!(
                page_type,
                BTREE_EMPTY_PAGE | BTREE_INNER_PAGE | BTREE_LEAF_PAGE
            ) {
                self.problem(format!("page {} has unknown type byte {}", page_no, page_type));
            }
        }
        Ok(())
    }

    // Pass 2: recursive structure walk. `low` is an inclusive bound,
    // `high` exclusive.
    fn walk_tree(
        &mut self,
        page_no: u16,
        low: Option<&BTreeKey>,
        high: Option<&BTreeKey>,
        expected_parent: u16,
    ) -> Result<()> {
        if page_no == 0 || page_no as u32 >= self.num_pages {
            self.problem(format!("tree references out-of-range page {}", page_no));
            return Ok(());
        }
        let idx = page_no as usize;
        if self.tree_visits[idx] > 0 {
            self.problem(format!("page {} is reachable from the root more than once", page_no));
            self.tree_visits[idx] += 1;
            return Ok(());
        }
        self.tree_visits[idx] += 1;

        match self.page_types[idx] {
            BTREE_LEAF_PAGE => self.check_leaf(page_no, low, high, expected_parent),
            BTREE_INNER_PAGE => self.check_inner(page_no, low, high, expected_parent),
            other => {
                self.problem(format!(
                    "page {} inside the tree has type byte {}",
                    page_no, other
                ));
                Ok(())
            }
        }
    }

    fn check_leaf(
        &mut self,
        page_no: u16,
        low: Option<&BTreeKey>,
        high: Option<&BTreeKey>,
        expected_parent: u16,
    ) -> Result<()> {
        let page = self
            .st
            .load_dbpage(self.session, self.file_id, page_no as u32, false)?;
        let leaf = LeafPage::load(page.clone(), self.schema.clone())?;
        if leaf.parent() != expected_parent {
            self.problem(format!(
                "leaf {} records parent {} but was reached from {}",
                page_no,
                leaf.parent(),
                expected_parent
            ));
        }
        let keys = leaf.keys()?;
        self.st.unpin_page(self.session, &page)?;
        self.check_key_run(page_no, "leaf", &keys, low, high)?;
        Ok(())
    }

    fn check_inner(
        &mut self,
        page_no: u16,
        low: Option<&BTreeKey>,
        high: Option<&BTreeKey>,
        expected_parent: u16,
    ) -> Result<()> {
        let page = self
            .st
            .load_dbpage(self.session, self.file_id, page_no as u32, false)?;
        let inner = InnerPage::load(page.clone(), self.schema.clone())?;
        if inner.parent() != expected_parent {
            self.problem(format!(
                "inner page {} records parent {} but was reached from {}",
                page_no,
                inner.parent(),
                expected_parent
            ));
        }
        if inner.num_pointers() < 2 {
            self.problem(format!(
                "inner page {} has {} pointer(s); at least 2 required",
                page_no,
                inner.num_pointers()
            ));
        }
        let (ptrs, keys) = inner.decompose()?;
        self.st.unpin_page(self.session, &page)?;

        self.check_key_run(page_no, "inner page", &keys, low, high)?;

        // All children must be the same kind of page.
        let child_types: Vec<u8> = ptrs
            .iter()
            .map(|&p| {
                self.page_types
                    .get(p as usize)
                    .copied()
                    .unwrap_or(u8::MAX)
            })
            .collect();
        if child_types.windows(2).any(|w| w[0] != w[1]) {
            self.problem(format!(
                "inner page {} mixes child page types {:?}",
                page_no, child_types
            ));
        }

        for (i, &child) in ptrs.iter().enumerate() {
            let child_low = if i == 0 { low } else { Some(&keys[i - 1]) };
            let child_high = if i == keys.len() { high } else { Some(&keys[i]) };
            self.walk_tree(child, child_low, child_high, page_no)?;
        }
        Ok(())
    }

    /// Checks that `keys` are strictly ascending and lie in `[low, high)`.
    fn check_key_run(
        &mut self,
        page_no: u16,
        kind: &str,
        keys: &[BTreeKey],
        low: Option<&BTreeKey>,
        high: Option<&BTreeKey>,
    ) -> Result<()> {
        for window in keys.windows(2) {
            if window[0].compare(&window[1])? != Ordering::Less {
                self.problem(format!("{} {} keys are out of order", kind, page_no));
                break;
            }
        }
        if let (Some(low), Some(first)) = (low, keys.first()) {
            if first.compare(low)? == Ordering::Less {
                self.problem(format!(
                    "{} {} holds a key below its lower bound",
                    kind, page_no
                ));
            }
        }
        if let (Some(high), Some(last)) = (high, keys.last()) {
            if last.compare(high)? != Ordering::Less {
                self.problem(format!(
                    "{} {} holds a key at or above its upper bound",
                    kind, page_no
                ));
            }
        }
        Ok(())
    }

    // Pass 3: the leaf chain, which must visit every leaf in ascending key
    // order and terminate with next = 0.
    fn walk_leaf_chain(&mut self, first_leaf: u16, root: u16) -> Result<()> {
        if first_leaf == 0 {
            return Ok(());
        }
        if root != 0 {
            let leftmost = self.leftmost_leaf(root)?;
            if leftmost != Some(first_leaf) {
                self.problem(format!(
                    "header names {} as the first leaf but the leftmost descent finds {:?}",
                    first_leaf, leftmost
                ));
            }
        }

        let mut prev_key: Option<BTreeKey> = None;
        let mut cur = first_leaf;
        let mut steps = 0u32;
        while cur != 0 {
            if steps > self.num_pages {
                self.problem("leaf chain does not terminate (cycle suspected)".into());
                return Ok(());
            }
            steps += 1;

            let idx = cur as usize;
            if idx >= self.page_types.len() {
                self.problem(format!("leaf chain references out-of-range page {}", cur));
                return Ok(());
            }
            self.chain_visits[idx] += 1;
            if self.chain_visits[idx] > 1 {
                self.problem(format!("leaf chain visits page {} more than once", cur));
                return Ok(());
            }
            if self.page_types[idx] != BTREE_LEAF_PAGE {
                self.problem(format!(
                    "leaf chain includes page {} of type {}",
                    cur, self.page_types[idx]
                ));
                return Ok(());
            }

            let page = self
                .st
                .load_dbpage(self.session, self.file_id, cur as u32, false)?;
            let leaf = LeafPage::load(page.clone(), self.schema.clone())?;
            let keys = leaf.keys()?;
            let next = leaf.next_leaf();
            self.st.unpin_page(self.session, &page)?;

            for key in keys {
                if let Some(prev) = &prev_key {
                    if prev.compare(&key)? != Ordering::Less {
                        self.problem(format!(
                            "leaf chain order breaks at page {} (pointer {})",
                            cur, key.ptr
                        ));
                    }
                }
                prev_key = Some(key);
            }
            cur = next;
        }
        Ok(())
    }

    fn leftmost_leaf(&mut self, root: u16) -> Result<Option<u16>> {
        let mut cur = root;
        let mut steps = 0u32;
        loop {
            if steps > self.num_pages {
                return Ok(None);
            }
            steps += 1;
            match self.page_types.get(cur as usize).copied() {
                Some(BTREE_LEAF_PAGE) => return Ok(Some(cur)),
                Some(BTREE_INNER_PAGE) => {
                    let page = self
                        .st
                        .load_dbpage(self.session, self.file_id, cur as u32, false)?;
                    let inner = InnerPage::load(page.clone(), self.schema.clone())?;
                    let child = inner.pointer_at(0);
                    self.st.unpin_page(self.session, &page)?;
                    cur = child;
                }
                _ => return Ok(None),
            }
        }
    }

    // Pass 4: the free list.
    fn walk_free_list(&mut self, first_free: u16) -> Result<()> {
        let mut cur = first_free;
        let mut steps = 0u32;
        while cur != 0 {
            if steps > self.num_pages {
                self.problem("free list does not terminate (cycle suspected)".into());
                return Ok(());
            }
            steps += 1;

            let idx = cur as usize;
            if idx >= self.page_types.len() {
                self.problem(format!("free list references out-of-range page {}", cur));
                return Ok(());
            }
            self.free_visits[idx] += 1;
            if self.free_visits[idx] > 1 {
                self.problem(format!("free list visits page {} more than once", cur));
                return Ok(());
            }
            if self.page_types[idx] != BTREE_EMPTY_PAGE {
                self.problem(format!(
                    "free list includes page {} of type {}",
                    cur, self.page_types[idx]
                ));
            }

            let page = self
                .st
                .load_dbpage(self.session, self.file_id, cur as u32, false)?;
            let next = page.borrow().read_u16(OFFSET_NEXT_FREE);
            self.st.unpin_page(self.session, &page)?;
            cur = next;
        }
        Ok(())
    }

    // Pass 5: every page accounted for exactly once.
    fn reconcile(&mut self) {
        for page_no in 1..self.num_pages as usize {
            let (page_type, tree, chain, free) = (
                self.page_types[page_no],
                self.tree_visits[page_no],
                self.chain_visits[page_no],
                self.free_visits[page_no],
            );
            match page_type {
                BTREE_INNER_PAGE => {
                    if tree != 1 {
                        self.problem(format!(
                            "inner page {} reached from the root {} time(s)",
                            page_no, tree
                        ));
                    }
                }
                BTREE_LEAF_PAGE => {
                    if tree != 1 {
                        self.problem(format!(
                            "leaf {} reached from the root {} time(s)",
                            page_no, tree
                        ));
                    }
                    if chain != 1 {
                        self.problem(format!(
                            "leaf {} appears on the chain {} time(s)",
                            page_no, chain
                        ));
                    }
                }
                BTREE_EMPTY_PAGE => {
                    if free != 1 {
                        self.problem(format!(
                            "empty page {} appears on the free list {} time(s)",
                            page_no, free
                        ));
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::schema::{ColumnInfo, ColumnType};
    use crate::storage::btree::leaf_page;
    use crate::storage::dbfile::DBFileType;
    use crate::storage::FilePointer;
    use crate::tuple::TupleLiteral;
    use crate::types::Value;

    const SESSION: SessionId = SessionId(1);

    #[test]
    fn test_verifier_flags_seeded_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::default();
        config.base_dir = dir.path().to_path_buf();
        config.page_size = 512;
        let mut st = StorageManager::open(config).unwrap();

        let schema = Schema::new(vec![ColumnInfo::new("k", ColumnType::Integer)]).unwrap();
        let tbl = st
            .create_table(SESSION, "idx", schema, DBFileType::BTreeTupleFile)
            .unwrap();
        for row in 0..100u16 {
            let lit = TupleLiteral::with_reference(
                vec![Value::Integer(row as i32)],
                FilePointer::new(1, row),
            );
            st.add_tuple(SESSION, &tbl, &lit).unwrap();
        }
        assert!(verify_index(&mut st, SESSION, &tbl).unwrap().is_empty());

        // Break the leaf chain head and expect the verifier to notice.
        let header = st.load_dbpage(SESSION, tbl.primary_file(), 0, false).unwrap();
        let first_leaf = header.borrow().read_u16(OFFSET_FIRST_LEAF);
        st.unpin_page(SESSION, &header).unwrap();

        let leaf = st
            .load_dbpage(SESSION, tbl.primary_file(), first_leaf as u32, false)
            .unwrap();
        leaf.borrow_mut().write_u16(leaf_page::OFFSET_NEXT_LEAF, 0);
        st.unpin_page(SESSION, &leaf).unwrap();

        let problems = verify_index(&mut st, SESSION, &tbl).unwrap();
        assert!(!problems.is_empty());
        assert!(matches!(
            check_index(&mut st, SESSION, &tbl),
            Err(crate::error::Error::CorruptIndex { .. })
        ));
    }
}
