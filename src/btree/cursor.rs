/// B+Tree cursors: a stack of (page id, child position) from root to leaf,
/// plus the current leaf and cell index. Seeks descend with binary search;
/// `next`/`prev` walk cells and cross leaves through the sibling links, so
/// ordered range scans never re-descend from the root.
use crate::btree::node::*;
use crate::btree::ops::{resolve_value, BTree, MAX_BTREE_DEPTH};
use crate::error::{DecentError, Result};
use crate::storage::page::{Page, PageId, PageKind};
use crate::storage::page_store::PageStore;

pub struct Cursor<'a, S: PageStore> {
    store: &'a mut S,
    root: PageId,
    /// Positioning trace from the last seek: (internal page id, child
    /// position taken). Leaf-level movement goes through sibling links.
    stack: Vec<(PageId, u16)>,
    leaf: Option<Page>,
    idx: u16,
}

impl<'a, S: PageStore> Cursor<'a, S> {
    pub fn new(tree: &BTree, store: &'a mut S) -> Self {
        Cursor {
            store,
            root: tree.root_page_id(),
            stack: Vec::new(),
            leaf: None,
            idx: 0,
        }
    }

    /// Internal hops the last seek descended through (tree height - 1).
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Positioned on an entry?
    pub fn valid(&self) -> bool {
        self.leaf
            .as_ref()
            .is_some_and(|leaf| self.idx < leaf.cell_count())
    }

    pub fn key(&self) -> Result<&[u8]> {
        let leaf = self
            .leaf
            .as_ref()
            .ok_or_else(|| DecentError::Invalid("cursor is not positioned".into()))?;
        leaf_key(leaf, self.idx)
    }

    /// Materialize the current value, following any overflow chain.
    pub fn value(&mut self) -> Result<Vec<u8>> {
        let leaf = self
            .leaf
            .as_ref()
            .ok_or_else(|| DecentError::Invalid("cursor is not positioned".into()))?;
        let (_, value) = leaf_entry(leaf, self.idx)?;
        resolve_value(self.store, &value)
    }

    /// Descend to a leaf, steering with `pick` at each internal node.
    fn descend<F>(&mut self, mut pick: F) -> Result<()>
    where
        F: FnMut(&Page) -> Result<u16>,
    {
        self.stack.clear();
        self.leaf = None;
        let mut page_id = self.root;
        for _ in 0..MAX_BTREE_DEPTH {
            let page = self.store.read_page(page_id)?;
            match page.kind() {
                PageKind::BtreeLeaf => {
                    self.leaf = Some(page);
                    return Ok(());
                }
                PageKind::BtreeInternal => {
                    let pos = pick(&page)?;
                    self.stack.push((page_id, pos));
                    page_id = child_at(&page, pos)?;
                }
                kind => {
                    return Err(DecentError::Corruption(format!(
                        "page {} in btree has kind {:?}",
                        page.id(),
                        kind
                    )))
                }
            }
        }
        Err(DecentError::Corruption(
            "btree depth exceeds maximum (possible cycle)".into(),
        ))
    }

    /// Position on the smallest key. Returns false for an empty tree.
    pub fn seek_first(&mut self) -> Result<bool> {
        self.descend(|_| Ok(0))?;
        self.idx = 0;
        // The leftmost leaf of a non-empty tree is non-empty, but an empty
        // root leaf is legal.
        if !self.valid() {
            return self.advance_leaf();
        }
        Ok(true)
    }

    /// Position on the largest key. Returns false for an empty tree.
    pub fn seek_last(&mut self) -> Result<bool> {
        self.descend(|page| Ok(page.cell_count()))?;
        let leaf = self.leaf.as_ref().expect("descend sets a leaf");
        if leaf.cell_count() == 0 {
            return self.retreat_leaf();
        }
        self.idx = leaf.cell_count() - 1;
        Ok(true)
    }

    /// Position on the smallest key >= `key`. Returns false when every key
    /// is smaller (end of scan).
    pub fn seek_ge(&mut self, key: &[u8]) -> Result<bool> {
        self.descend(|page| Ok(find_child(page, key)?.1))?;
        let leaf = self.leaf.as_ref().expect("descend sets a leaf");
        self.idx = match leaf_search(leaf, key)? {
            Ok(idx) => idx,
            Err(idx) => idx,
        };
        if self.valid() {
            return Ok(true);
        }
        self.advance_leaf()
    }

    /// Position on the largest key <= `key`. Returns false when every key
    /// is greater.
    pub fn seek_le(&mut self, key: &[u8]) -> Result<bool> {
        self.descend(|page| Ok(find_child(page, key)?.1))?;
        let leaf = self.leaf.as_ref().expect("descend sets a leaf");
        match leaf_search(leaf, key)? {
            Ok(idx) => {
                self.idx = idx;
                Ok(true)
            }
            Err(0) => self.retreat_leaf(),
            Err(idx) => {
                self.idx = idx - 1;
                Ok(true)
            }
        }
    }

    /// Step to the next entry in key order. Returns false at end of scan.
    pub fn next(&mut self) -> Result<bool> {
        let Some(leaf) = self.leaf.as_ref() else {
            return Err(DecentError::Invalid("cursor is not positioned".into()));
        };
        if self.idx + 1 < leaf.cell_count() {
            self.idx += 1;
            return Ok(true);
        }
        self.advance_leaf()
    }

    /// Step to the previous entry. Returns false at start of scan.
    pub fn prev(&mut self) -> Result<bool> {
        if self.leaf.is_none() {
            return Err(DecentError::Invalid("cursor is not positioned".into()));
        }
        if self.idx > 0 {
            self.idx -= 1;
            return Ok(true);
        }
        self.retreat_leaf()
    }

    /// Move to the first entry of the next non-empty leaf.
    fn advance_leaf(&mut self) -> Result<bool> {
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > MAX_BTREE_DEPTH * 1024 {
                return Err(DecentError::Corruption(
                    "leaf sibling chain does not terminate".into(),
                ));
            }
            let next = self.leaf.as_ref().map(leaf_next).unwrap_or(0);
            if next == 0 {
                self.leaf = None;
                return Ok(false);
            }
            let page = self.store.read_page(next)?;
            if page.kind() != PageKind::BtreeLeaf {
                return Err(DecentError::Corruption(format!(
                    "leaf sibling {} has kind {:?}",
                    next,
                    page.kind()
                )));
            }
            let non_empty = page.cell_count() > 0;
            self.leaf = Some(page);
            self.idx = 0;
            if non_empty {
                return Ok(true);
            }
        }
    }

    /// Move to the last entry of the previous non-empty leaf.
    fn retreat_leaf(&mut self) -> Result<bool> {
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > MAX_BTREE_DEPTH * 1024 {
                return Err(DecentError::Corruption(
                    "leaf sibling chain does not terminate".into(),
                ));
            }
            let prev = self.leaf.as_ref().map(leaf_prev).unwrap_or(0);
            if prev == 0 {
                self.leaf = None;
                return Ok(false);
            }
            let page = self.store.read_page(prev)?;
            if page.kind() != PageKind::BtreeLeaf {
                return Err(DecentError::Corruption(format!(
                    "leaf sibling {} has kind {:?}",
                    prev,
                    page.kind()
                )));
            }
            let count = page.cell_count();
            self.leaf = Some(page);
            if count > 0 {
                self.idx = count - 1;
                return Ok(true);
            }
            self.idx = 0;
        }
    }
}
