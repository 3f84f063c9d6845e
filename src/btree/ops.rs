/// B+Tree operations: search, insert with splits, delete with
/// redistribution and merges.
///
/// Mutations go through a `PageStore`, so inside a write transaction every
/// touched page lands in the dirty buffer and a failed operation is undone
/// wholesale by rolling the transaction back; pages allocated by a failed
/// split sit in the transaction's allocation set and return to the
/// freelist on rollback.
use crate::btree::node::*;
use crate::btree::overflow;
use crate::error::{DecentError, Result};
use crate::storage::page::{Page, PageId, PageKind};
use crate::storage::page_store::PageStore;

/// Underflow threshold for rebalancing.
const MIN_ENTRIES: u16 = 2;

/// Depth guard against cycles in corrupted trees.
pub(crate) const MAX_BTREE_DEPTH: usize = 64;

/// B+Tree handle. The root page id moves on root splits and collapses;
/// callers persist it via `root_page_id` after mutating.
pub struct BTree {
    root: PageId,
    /// Page kind used for spilled values. The trigram index stores its
    /// segments behind `TrigramPostings` chains; everything else uses
    /// plain overflow pages.
    overflow_kind: PageKind,
}

struct Split {
    median_key: Vec<u8>,
    right: PageId,
}

impl BTree {
    /// Create a tree with a fresh empty leaf root.
    pub fn create(store: &mut impl PageStore) -> Result<Self> {
        Self::create_with_kind(store, PageKind::Overflow)
    }

    pub fn create_with_kind(store: &mut impl PageStore, overflow_kind: PageKind) -> Result<Self> {
        let root = store.allocate_page(PageKind::BtreeLeaf)?;
        let root_id = root.id();
        store.write_page(root)?;
        Ok(BTree {
            root: root_id,
            overflow_kind,
        })
    }

    pub fn open(root: PageId) -> Self {
        Self::open_with_kind(root, PageKind::Overflow)
    }

    pub fn open_with_kind(root: PageId, overflow_kind: PageKind) -> Self {
        BTree {
            root,
            overflow_kind,
        }
    }

    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    fn check_key(&self, store: &impl PageStore, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(DecentError::Invalid("empty btree key".into()));
        }
        if key.len() > max_key_len(store.page_size()) {
            return Err(DecentError::Invalid(format!(
                "btree key of {} octets exceeds maximum {}",
                key.len(),
                max_key_len(store.page_size())
            )));
        }
        Ok(())
    }

    /// Point lookup. Resolves overflow chains.
    pub fn search(&self, store: &mut impl PageStore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut page_id = self.root;
        for _ in 0..MAX_BTREE_DEPTH {
            let page = store.read_page(page_id)?;
            match page.kind() {
                PageKind::BtreeLeaf => {
                    return match leaf_search(&page, key)? {
                        Ok(idx) => {
                            let (_, value) = leaf_entry(&page, idx)?;
                            Ok(Some(resolve_value(store, &value)?))
                        }
                        Err(_) => Ok(None),
                    };
                }
                PageKind::BtreeInternal => {
                    page_id = find_child(&page, key)?.0;
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

    /// Insert or replace. Values above the inline threshold spill to an
    /// overflow chain; a replaced overflow value's chain is freed.
    pub fn insert(&mut self, store: &mut impl PageStore, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(store, key)?;
        let stored = if value.len() > max_inline_value(store.page_size()) {
            let head = overflow::write_chain(store, value, self.overflow_kind)?;
            LeafValue::Overflow {
                total_len: value.len() as u32,
                head,
            }
        } else {
            LeafValue::Inline(value.to_vec())
        };

        if let Some(split) = self.insert_rec(store, self.root, key, &stored, 0)? {
            // Root split: the tree grows by one level.
            let mut new_root = store.allocate_page(PageKind::BtreeInternal)?;
            let new_root_id = new_root.id();
            set_right_child(&mut new_root, split.right);
            new_root.push_cell(&encode_internal_cell(self.root, &split.median_key))?;
            store.write_page(new_root)?;
            self.root = new_root_id;
        }
        Ok(())
    }

    fn insert_rec(
        &mut self,
        store: &mut impl PageStore,
        page_id: PageId,
        key: &[u8],
        value: &LeafValue,
        depth: usize,
    ) -> Result<Option<Split>> {
        if depth > MAX_BTREE_DEPTH {
            return Err(DecentError::Corruption(
                "btree depth exceeds maximum (possible cycle)".into(),
            ));
        }
        let page = store.read_page(page_id)?;
        match page.kind() {
            PageKind::BtreeLeaf => self.insert_into_leaf(store, page, key, value),
            PageKind::BtreeInternal => {
                let (child, pos) = find_child(&page, key)?;
                let split = self.insert_rec(store, child, key, value, depth + 1)?;
                let Some(split) = split else {
                    return Ok(None);
                };
                // Splice the promoted separator into this node. The old
                // pointer slot at `pos` moves to the new right sibling.
                let page = store.read_page(page_id)?;
                let mut entries = internal_entries(&page)?;
                let mut rc = right_child(&page);
                if (pos as usize) < entries.len() {
                    entries[pos as usize].0 = split.right;
                } else {
                    rc = split.right;
                }
                entries.insert(pos as usize, (child, split.median_key));
                self.write_internal(store, page_id, entries, rc)
            }
            kind => Err(DecentError::Corruption(format!(
                "page {} in btree has kind {:?}",
                page.id(),
                kind
            ))),
        }
    }

    fn insert_into_leaf(
        &self,
        store: &mut impl PageStore,
        page: Page,
        key: &[u8],
        value: &LeafValue,
    ) -> Result<Option<Split>> {
        let page_id = page.id();
        let mut entries = leaf_entries(&page)?;
        match leaf_search(&page, key)? {
            Ok(idx) => {
                if let LeafValue::Overflow { head, .. } = entries[idx as usize].1 {
                    overflow::free_chain(store, head)?;
                }
                entries[idx as usize].1 = value.clone();
            }
            Err(idx) => {
                entries.insert(idx as usize, (key.to_vec(), value.clone()));
            }
        }
        self.write_leaf(
            store,
            page_id,
            entries,
            leaf_prev(&page),
            leaf_next(&page),
        )
    }

    /// Rebuild a leaf from its entry list; split when they no longer fit.
    fn write_leaf(
        &self,
        store: &mut impl PageStore,
        page_id: PageId,
        entries: Vec<(Vec<u8>, LeafValue)>,
        prev: PageId,
        next: PageId,
    ) -> Result<Option<Split>> {
        if let Some(page) = build_leaf(store.page_size(), page_id, &entries, prev, next) {
            store.write_page(page)?;
            return Ok(None);
        }

        // Split: right sibling takes the upper half; the separator promoted
        // to the parent is the right page's first key.
        let mid = entries.len() / 2;
        let right_page = store.allocate_page(PageKind::BtreeLeaf)?;
        let right_id = right_page.id();
        let median_key = entries[mid].0.clone();

        let left = build_leaf(store.page_size(), page_id, &entries[..mid], prev, right_id)
            .ok_or_else(|| DecentError::Internal("leaf split left half does not fit".into()))?;
        let right = build_leaf(store.page_size(), right_id, &entries[mid..], page_id, next)
            .ok_or_else(|| DecentError::Internal("leaf split right half does not fit".into()))?;

        store.write_page(left)?;
        store.write_page(right)?;
        if next != 0 {
            let mut after = store.read_page(next)?;
            set_leaf_prev(&mut after, right_id);
            store.write_page(after)?;
        }
        Ok(Some(Split {
            median_key,
            right: right_id,
        }))
    }

    /// Rebuild an internal node from its entry list; split when it no
    /// longer fits.
    fn write_internal(
        &self,
        store: &mut impl PageStore,
        page_id: PageId,
        entries: Vec<(PageId, Vec<u8>)>,
        rc: PageId,
    ) -> Result<Option<Split>> {
        if let Some(page) = build_internal(store.page_size(), page_id, &entries, rc) {
            store.write_page(page)?;
            return Ok(None);
        }

        // The median entry is promoted, not copied.
        let mid = entries.len() / 2;
        let (median_child, median_key) = entries[mid].clone();
        let right_page = store.allocate_page(PageKind::BtreeInternal)?;
        let right_id = right_page.id();

        let left = build_internal(store.page_size(), page_id, &entries[..mid], median_child)
            .ok_or_else(|| DecentError::Internal("internal split left half does not fit".into()))?;
        let right = build_internal(store.page_size(), right_id, &entries[mid + 1..], rc)
            .ok_or_else(|| DecentError::Internal("internal split right half does not fit".into()))?;
        store.write_page(left)?;
        store.write_page(right)?;
        Ok(Some(Split {
            median_key,
            right: right_id,
        }))
    }

    /// Delete a key. Returns whether it existed. Frees any overflow chain.
    pub fn delete(&mut self, store: &mut impl PageStore, key: &[u8]) -> Result<bool> {
        self.check_key(store, key)?;
        let (deleted, _) = self.delete_rec(store, self.root, key, 0)?;
        if deleted {
            // Collapse an empty internal root onto its single child.
            let root = store.read_page(self.root)?;
            if root.kind() == PageKind::BtreeInternal && root.cell_count() == 0 {
                let child = right_child(&root);
                let old = self.root;
                self.root = child;
                store.free_page(old)?;
            }
        }
        Ok(deleted)
    }

    fn delete_rec(
        &mut self,
        store: &mut impl PageStore,
        page_id: PageId,
        key: &[u8],
        depth: usize,
    ) -> Result<(bool, bool)> {
        if depth > MAX_BTREE_DEPTH {
            return Err(DecentError::Corruption(
                "btree depth exceeds maximum (possible cycle)".into(),
            ));
        }
        let page = store.read_page(page_id)?;
        match page.kind() {
            PageKind::BtreeLeaf => {
                let Ok(idx) = leaf_search(&page, key)? else {
                    return Ok((false, false));
                };
                let (_, value) = leaf_entry(&page, idx)?;
                if let LeafValue::Overflow { head, .. } = value {
                    overflow::free_chain(store, head)?;
                }
                let mut page = store.read_page(page_id)?;
                page.remove_cell(idx);
                let underfull = page.cell_count() < MIN_ENTRIES;
                store.write_page(page)?;
                Ok((true, underfull))
            }
            PageKind::BtreeInternal => {
                let (child, pos) = find_child(&page, key)?;
                let (deleted, child_underfull) = self.delete_rec(store, child, key, depth + 1)?;
                if deleted && child_underfull {
                    self.rebalance(store, page_id, pos)?;
                }
                let page = store.read_page(page_id)?;
                Ok((deleted, page.cell_count() < MIN_ENTRIES))
            }
            kind => Err(DecentError::Corruption(format!(
                "page {} in btree has kind {:?}",
                page.id(),
                kind
            ))),
        }
    }

    /// Fix an underfull child: redistribute from an immediate sibling when
    /// it can spare an entry, otherwise merge and demote the separator.
    /// Skipped silently when variable-size cells leave no legal move; an
    /// underfull node is valid, just wasteful.
    fn rebalance(
        &mut self,
        store: &mut impl PageStore,
        parent_id: PageId,
        child_pos: u16,
    ) -> Result<()> {
        let parent = store.read_page(parent_id)?;
        let n = parent.cell_count();
        if n == 0 {
            return Ok(());
        }
        // Work on the (left, right) pair around one separator.
        let sep_idx = if child_pos > 0 { child_pos - 1 } else { 0 };
        let left_id = child_at(&parent, sep_idx)?;
        let right_id = child_at(&parent, sep_idx + 1)?;
        let sep_key = internal_key(&parent, sep_idx)?.to_vec();

        let left = store.read_page(left_id)?;
        let right = store.read_page(right_id)?;
        if left.kind() != right.kind() {
            return Err(DecentError::Corruption(format!(
                "btree siblings {} and {} have different kinds",
                left_id, right_id
            )));
        }

        match left.kind() {
            PageKind::BtreeLeaf => self.rebalance_leaves(store, parent_id, sep_idx, left, right),
            PageKind::BtreeInternal => {
                self.rebalance_internals(store, parent_id, sep_idx, sep_key, left, right)
            }
            kind => Err(DecentError::Corruption(format!(
                "page in btree has kind {:?}",
                kind
            ))),
        }
    }

    fn rebalance_leaves(
        &mut self,
        store: &mut impl PageStore,
        parent_id: PageId,
        sep_idx: u16,
        left: Page,
        right: Page,
    ) -> Result<()> {
        let ps = store.page_size();
        let (left_id, right_id) = (left.id(), right.id());
        let mut left_entries = leaf_entries(&left)?;
        let mut right_entries = leaf_entries(&right)?;
        let (left_prev, right_next) = (leaf_prev(&left), leaf_next(&right));

        let left_count = left_entries.len() as u16;
        let right_count = right_entries.len() as u16;

        // Redistribution first.
        if right_count < MIN_ENTRIES && left_count > MIN_ENTRIES {
            let moved = left_entries.pop().expect("left has entries");
            right_entries.insert(0, moved);
        } else if left_count < MIN_ENTRIES && right_count > MIN_ENTRIES {
            let moved = right_entries.remove(0);
            left_entries.push(moved);
        } else {
            // Merge right into left if everything fits.
            let mut merged = left_entries.clone();
            merged.extend(right_entries.iter().cloned());
            if let Some(page) = build_leaf(ps, left_id, &merged, left_prev, right_next) {
                store.write_page(page)?;
                if right_next != 0 {
                    let mut after = store.read_page(right_next)?;
                    set_leaf_prev(&mut after, left_id);
                    store.write_page(after)?;
                }
                store.free_page(right_id)?;
                return self.remove_separator(store, parent_id, sep_idx, left_id);
            }
            return Ok(());
        }

        // The separator becomes the right page's new first key.
        let new_sep = right_entries[0].0.clone();
        let Some(new_left) = build_leaf(ps, left_id, &left_entries, left_prev, right_id) else {
            return Ok(());
        };
        let Some(new_right) = build_leaf(ps, right_id, &right_entries, left_id, right_next) else {
            return Ok(());
        };
        store.write_page(new_left)?;
        store.write_page(new_right)?;
        self.replace_separator_key(store, parent_id, sep_idx, &new_sep)
    }

    fn rebalance_internals(
        &mut self,
        store: &mut impl PageStore,
        parent_id: PageId,
        sep_idx: u16,
        sep_key: Vec<u8>,
        left: Page,
        right: Page,
    ) -> Result<()> {
        let ps = store.page_size();
        let (left_id, right_id) = (left.id(), right.id());
        let mut left_entries = internal_entries(&left)?;
        let mut right_entries = internal_entries(&right)?;
        let mut left_rc = right_child(&left);
        let right_rc = right_child(&right);

        let left_count = left_entries.len() as u16;
        let right_count = right_entries.len() as u16;

        if right_count < MIN_ENTRIES && left_count > MIN_ENTRIES {
            // Rotate right: separator descends into the right node, the
            // left node's last key ascends.
            right_entries.insert(0, (left_rc, sep_key));
            let (new_rc, new_sep) = left_entries.pop().expect("left has entries");
            left_rc = new_rc;
            let Some(nl) = build_internal(ps, left_id, &left_entries, left_rc) else {
                return Ok(());
            };
            let Some(nr) = build_internal(ps, right_id, &right_entries, right_rc) else {
                return Ok(());
            };
            store.write_page(nl)?;
            store.write_page(nr)?;
            return self.replace_separator_key(store, parent_id, sep_idx, &new_sep);
        }
        if left_count < MIN_ENTRIES && right_count > MIN_ENTRIES {
            // Rotate left.
            left_entries.push((left_rc, sep_key));
            let (new_left_rc, new_sep) = right_entries.remove(0);
            left_rc = new_left_rc;
            let Some(nl) = build_internal(ps, left_id, &left_entries, left_rc) else {
                return Ok(());
            };
            let Some(nr) = build_internal(ps, right_id, &right_entries, right_rc) else {
                return Ok(());
            };
            store.write_page(nl)?;
            store.write_page(nr)?;
            return self.replace_separator_key(store, parent_id, sep_idx, &new_sep);
        }

        // Merge: separator demotes between the two halves.
        let mut merged = left_entries;
        merged.push((left_rc, sep_key));
        merged.extend(right_entries);
        if let Some(page) = build_internal(ps, left_id, &merged, right_rc) {
            store.write_page(page)?;
            store.free_page(right_id)?;
            return self.remove_separator(store, parent_id, sep_idx, left_id);
        }
        Ok(())
    }

    /// Drop the separator at `sep_idx`; the pointer slot right of it now
    /// refers to the merged (left) page.
    fn remove_separator(
        &mut self,
        store: &mut impl PageStore,
        parent_id: PageId,
        sep_idx: u16,
        merged_id: PageId,
    ) -> Result<()> {
        let parent = store.read_page(parent_id)?;
        let mut entries = internal_entries(&parent)?;
        let mut rc = right_child(&parent);
        entries.remove(sep_idx as usize);
        if (sep_idx as usize) < entries.len() {
            entries[sep_idx as usize].0 = merged_id;
        } else {
            rc = merged_id;
        }
        if let Some(page) = build_internal(store.page_size(), parent_id, &entries, rc) {
            store.write_page(page)?;
            Ok(())
        } else {
            Err(DecentError::Internal(
                "separator removal must shrink the parent".into(),
            ))
        }
    }

    fn replace_separator_key(
        &mut self,
        store: &mut impl PageStore,
        parent_id: PageId,
        sep_idx: u16,
        new_key: &[u8],
    ) -> Result<()> {
        let parent = store.read_page(parent_id)?;
        let mut entries = internal_entries(&parent)?;
        entries[sep_idx as usize].1 = new_key.to_vec();
        let rc = right_child(&parent);
        if let Some(page) = build_internal(store.page_size(), parent_id, &entries, rc) {
            store.write_page(page)?;
            Ok(())
        } else {
            Err(DecentError::Internal(
                "separator replacement overflows the parent".into(),
            ))
        }
    }

    /// Collect every page id reachable from the root: nodes plus overflow
    /// chains. Used when a whole tree is torn down (index rebuild).
    pub fn collect_pages(&self, store: &mut impl PageStore) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut visited = std::collections::HashSet::new();
        self.collect_rec(store, self.root, &mut pages, &mut visited, 0)?;
        Ok(pages)
    }

    fn collect_rec(
        &self,
        store: &mut impl PageStore,
        page_id: PageId,
        pages: &mut Vec<PageId>,
        visited: &mut std::collections::HashSet<PageId>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_BTREE_DEPTH {
            return Err(DecentError::Corruption(
                "btree depth exceeds maximum (possible cycle)".into(),
            ));
        }
        if !visited.insert(page_id) {
            return Err(DecentError::Corruption(format!(
                "btree cycle: page {} reached twice",
                page_id
            )));
        }
        pages.push(page_id);
        let page = store.read_page(page_id)?;
        match page.kind() {
            PageKind::BtreeLeaf => {
                for (_, value) in leaf_entries(&page)? {
                    if let LeafValue::Overflow { head, .. } = value {
                        let mut current = head;
                        while current != 0 {
                            if !visited.insert(current) {
                                return Err(DecentError::Corruption(
                                    "overflow chain cycle during collection".into(),
                                ));
                            }
                            pages.push(current);
                            current = store.read_page(current)?.aux0();
                        }
                    }
                }
                Ok(())
            }
            PageKind::BtreeInternal => {
                for pos in 0..=page.cell_count() {
                    let child = child_at(&page, pos)?;
                    self.collect_rec(store, child, pages, visited, depth + 1)?;
                }
                Ok(())
            }
            kind => Err(DecentError::Corruption(format!(
                "page {} in btree has kind {:?}",
                page_id, kind
            ))),
        }
    }
}

pub(crate) fn resolve_value(store: &mut impl PageStore, value: &LeafValue) -> Result<Vec<u8>> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.clone()),
        LeafValue::Overflow { total_len, head } => overflow::read_chain(store, *head, *total_len),
    }
}

pub(crate) fn leaf_entries(page: &Page) -> Result<Vec<(Vec<u8>, LeafValue)>> {
    let mut out = Vec::with_capacity(page.cell_count() as usize);
    for i in 0..page.cell_count() {
        let (key, value) = leaf_entry(page, i)?;
        out.push((key.to_vec(), value));
    }
    Ok(out)
}

pub(crate) fn internal_entries(page: &Page) -> Result<Vec<(PageId, Vec<u8>)>> {
    let mut out = Vec::with_capacity(page.cell_count() as usize);
    for i in 0..page.cell_count() {
        let cell = page
            .cell(i)
            .ok_or_else(|| DecentError::Corruption("internal cell missing".into()))?;
        let (child, key) = decode_internal_cell(cell)?;
        out.push((child, key.to_vec()));
    }
    Ok(out)
}

/// Build a compacted leaf from entries, or `None` if they do not fit.
fn build_leaf(
    page_size: usize,
    id: PageId,
    entries: &[(Vec<u8>, LeafValue)],
    prev: PageId,
    next: PageId,
) -> Option<Page> {
    let mut page = Page::new(id, page_size, PageKind::BtreeLeaf);
    set_leaf_prev(&mut page, prev);
    set_leaf_next(&mut page, next);
    for (key, value) in entries {
        page.push_cell(&encode_leaf_cell(key, value)).ok()?;
    }
    Some(page)
}

/// Build a compacted internal node, or `None` if the entries do not fit.
fn build_internal(
    page_size: usize,
    id: PageId,
    entries: &[(PageId, Vec<u8>)],
    rc: PageId,
) -> Option<Page> {
    let mut page = Page::new(id, page_size, PageKind::BtreeInternal);
    set_right_child(&mut page, rc);
    for (child, key) in entries {
        page.push_cell(&encode_internal_cell(*child, key)).ok()?;
    }
    Some(page)
}
