/// Trigram inverted index: segmented postings stored in a B+Tree, with a
/// per-transaction delta buffer that is flushed at checkpoint rather than
/// at commit.
///
/// Keys in the postings tree:
///   meta:    [1][table_len: u8][table][tri_len: u8][trigram]
///            -> [seg_count: u32 LE][total_ids: u64 LE]
///   segment: [2][table_len: u8][table][tri_len: u8][trigram][seg: u32 BE]
///            -> encoded postings (delta varints, ascending row ids)
///
/// The trigram octets themselves form the key; no hashing, so there are no
/// collisions to resolve. Segments are capped near a page and appended at
/// the tail, so inserting one row id into a huge postings list touches the
/// tail segment only; spilled segment payloads live behind
/// `TrigramPostings` chain pages.
use std::collections::{BTreeMap, BTreeSet};

use crate::btree::ops::BTree;
use crate::error::{DecentError, Result};
use crate::storage::page::{PageId, PageKind};
use crate::storage::page_store::PageStore;
use crate::trigram::postings;

const META_TAG: u8 = 1;
const SEG_TAG: u8 = 2;

/// Segment payload cap: near one page, as spilled chains hold one chunk.
pub fn max_segment_bytes(page_size: usize) -> usize {
    page_size / 2
}

/// Pending changes for one (table, trigram) posting list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrigramDelta {
    pub added: BTreeSet<u64>,
    pub removed: BTreeSet<u64>,
}

impl TrigramDelta {
    pub fn record_add(&mut self, row_id: u64) {
        self.removed.remove(&row_id);
        self.added.insert(row_id);
    }

    pub fn record_remove(&mut self, row_id: u64) {
        self.added.remove(&row_id);
        self.removed.insert(row_id);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn merge(&mut self, other: &TrigramDelta) {
        for &id in &other.removed {
            self.record_remove(id);
        }
        for &id in &other.added {
            self.record_add(id);
        }
    }
}

/// Overlay a delta onto a sorted base list, preserving order.
pub fn apply_overlay(base: Vec<u64>, delta: &TrigramDelta) -> Vec<u64> {
    if delta.is_empty() {
        return base;
    }
    let mut merged: BTreeSet<u64> = base.into_iter().collect();
    for id in &delta.removed {
        merged.remove(id);
    }
    for &id in &delta.added {
        merged.insert(id);
    }
    merged.into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrigramStats {
    pub trigrams: u64,
    pub segments: u64,
    pub row_entries: u64,
}

pub struct TrigramIndex {
    btree: BTree,
}

impl TrigramIndex {
    pub fn create(store: &mut impl PageStore) -> Result<Self> {
        Ok(TrigramIndex {
            btree: BTree::create_with_kind(store, PageKind::TrigramPostings)?,
        })
    }

    pub fn open(root: PageId) -> Self {
        TrigramIndex {
            btree: BTree::open_with_kind(root, PageKind::TrigramPostings),
        }
    }

    pub fn root_page_id(&self) -> PageId {
        self.btree.root_page_id()
    }

    /// Apply one trigram's delta to its paged postings.
    ///
    /// Ascending additions extend the tail segment in place; an addition
    /// below the tail's high-water mark falls back to rewriting the whole
    /// list. Removals rewrite only the segments that contain removed ids.
    pub fn apply_delta(
        &mut self,
        store: &mut impl PageStore,
        table: &str,
        trigram: &str,
        delta: &TrigramDelta,
    ) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let (mut seg_count, mut total_ids) = self.load_meta(store, table, trigram)?;

        if !delta.removed.is_empty() && seg_count > 0 {
            for seg in 0..seg_count {
                let key = seg_key(table, trigram, seg);
                let Some(data) = self.btree.search(store, &key)? else {
                    return Err(DecentError::Corruption(format!(
                        "missing postings segment {} for trigram {:?}",
                        seg, trigram
                    )));
                };
                let ids = postings::decode_postings(&data)?;
                let kept: Vec<u64> = ids
                    .iter()
                    .copied()
                    .filter(|id| !delta.removed.contains(id))
                    .collect();
                if kept.len() != ids.len() {
                    total_ids = total_ids.saturating_sub((ids.len() - kept.len()) as u64);
                    self.btree
                        .insert(store, &key, &postings::encode_postings(&kept)?)?;
                }
            }
        }

        if !delta.added.is_empty() {
            let cap = max_segment_bytes(store.page_size());
            let tail_high = if seg_count > 0 {
                let key = seg_key(table, trigram, seg_count - 1);
                let data = self.btree.search(store, &key)?.ok_or_else(|| {
                    DecentError::Corruption("missing tail postings segment".into())
                })?;
                postings::decode_postings(&data)?.last().copied()
            } else {
                None
            };

            let in_order = tail_high.map_or(true, |high| {
                delta.added.iter().next().is_some_and(|&first| first > high)
            });
            if in_order {
                // Extend the tail, rolling into fresh segments as it fills.
                let mut tail: Vec<u64> = if seg_count > 0 {
                    let key = seg_key(table, trigram, seg_count - 1);
                    let data = self.btree.search(store, &key)?.ok_or_else(|| {
                        DecentError::Corruption("missing tail postings segment".into())
                    })?;
                    postings::decode_postings(&data)?
                } else {
                    seg_count = 1;
                    Vec::new()
                };
                let mut tail_len = postings::encode_postings(&tail)?.len();
                for &id in &delta.added {
                    let grown = if tail.is_empty() {
                        postings::encode_postings(&[id])?.len()
                    } else {
                        postings::appended_len(tail_len, tail.len(), *tail.last().unwrap(), id)
                    };
                    if grown > cap && !tail.is_empty() {
                        let key = seg_key(table, trigram, seg_count - 1);
                        self.btree
                            .insert(store, &key, &postings::encode_postings(&tail)?)?;
                        seg_count += 1;
                        tail = vec![id];
                        tail_len = postings::encode_postings(&tail)?.len();
                    } else {
                        tail.push(id);
                        tail_len = grown;
                    }
                    total_ids += 1;
                }
                let key = seg_key(table, trigram, seg_count - 1);
                self.btree
                    .insert(store, &key, &postings::encode_postings(&tail)?)?;
            } else {
                // Out-of-order insert: merge the whole list and rewrite.
                let mut all: BTreeSet<u64> = BTreeSet::new();
                for seg in 0..seg_count {
                    let key = seg_key(table, trigram, seg);
                    let data = self.btree.search(store, &key)?.ok_or_else(|| {
                        DecentError::Corruption("missing postings segment".into())
                    })?;
                    all.extend(postings::decode_postings(&data)?);
                }
                for &id in &delta.added {
                    all.insert(id);
                }
                total_ids = all.len() as u64;
                let ids: Vec<u64> = all.into_iter().collect();
                seg_count = self.rewrite_segments(store, table, trigram, &ids, seg_count)?;
            }
        }

        if total_ids == 0 {
            self.drop_trigram(store, table, trigram, seg_count)?;
        } else {
            self.store_meta(store, table, trigram, seg_count, total_ids)?;
        }
        Ok(())
    }

    /// Bounded lookup of the paged base set. Returns the decoded row ids
    /// and whether the decode bound tripped before the list was exhausted;
    /// a tripped bound obliges the caller to fall back to a scan with a
    /// post-filter. No segments yet means an empty base set.
    pub fn seek(
        &self,
        store: &mut impl PageStore,
        table: &str,
        trigram: &str,
        max_ids: usize,
    ) -> Result<(Vec<u64>, bool)> {
        let (seg_count, _) = self.load_meta(store, table, trigram)?;
        let mut ids = Vec::new();
        for seg in 0..seg_count {
            let budget = max_ids.saturating_sub(ids.len());
            if budget == 0 {
                return Ok((ids, true));
            }
            let key = seg_key(table, trigram, seg);
            let Some(data) = self.btree.search(store, &key)? else {
                return Err(DecentError::Corruption(format!(
                    "missing postings segment {} for trigram {:?}",
                    seg, trigram
                )));
            };
            let (mut seg_ids, complete) = postings::decode_postings_bounded(&data, budget)?;
            ids.append(&mut seg_ids);
            if !complete {
                return Ok((ids, true));
            }
        }
        Ok((ids, false))
    }

    /// Rebuild postings from scratch. The index must be freshly created;
    /// rows are grouped per (table, trigram) and written as dense segments.
    pub fn rebuild<I>(&mut self, store: &mut impl PageStore, docs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, u64, String)>,
    {
        let mut grouped: BTreeMap<(String, String), BTreeSet<u64>> = BTreeMap::new();
        for (table, row_id, text) in docs {
            for trigram in crate::trigram::tokenizer::distinct_trigrams(&text) {
                grouped
                    .entry((table.clone(), trigram))
                    .or_default()
                    .insert(row_id);
            }
        }
        for ((table, trigram), ids) in grouped {
            let ids: Vec<u64> = ids.into_iter().collect();
            let seg_count = self.rewrite_segments(store, &table, &trigram, &ids, 0)?;
            self.store_meta(store, &table, &trigram, seg_count, ids.len() as u64)?;
        }
        Ok(())
    }

    /// Operator statistics: walk the meta records.
    pub fn stats(&self, store: &mut impl PageStore) -> Result<TrigramStats> {
        let mut stats = TrigramStats::default();
        let mut cursor = crate::btree::cursor::Cursor::new(&self.btree, store);
        let mut positioned = cursor.seek_ge(&[META_TAG])?;
        while positioned {
            let key = cursor.key()?;
            if key.first() != Some(&META_TAG) {
                break;
            }
            let value = cursor.value()?;
            let (seg_count, total) = decode_meta(&value)?;
            stats.trigrams += 1;
            stats.segments += seg_count as u64;
            stats.row_entries += total;
            positioned = cursor.next()?;
        }
        Ok(stats)
    }

    /// All pages reachable from the postings tree, for rebuild teardown.
    pub fn collect_pages(&self, store: &mut impl PageStore) -> Result<Vec<PageId>> {
        self.btree.collect_pages(store)
    }

    fn load_meta(
        &self,
        store: &mut impl PageStore,
        table: &str,
        trigram: &str,
    ) -> Result<(u32, u64)> {
        match self.btree.search(store, &meta_key(table, trigram))? {
            Some(raw) => decode_meta(&raw),
            None => Ok((0, 0)),
        }
    }

    fn store_meta(
        &mut self,
        store: &mut impl PageStore,
        table: &str,
        trigram: &str,
        seg_count: u32,
        total_ids: u64,
    ) -> Result<()> {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&seg_count.to_le_bytes());
        buf[4..12].copy_from_slice(&total_ids.to_le_bytes());
        self.btree.insert(store, &meta_key(table, trigram), &buf)
    }

    fn drop_trigram(
        &mut self,
        store: &mut impl PageStore,
        table: &str,
        trigram: &str,
        seg_count: u32,
    ) -> Result<()> {
        for seg in 0..seg_count {
            self.btree.delete(store, &seg_key(table, trigram, seg))?;
        }
        self.btree.delete(store, &meta_key(table, trigram))?;
        Ok(())
    }

    /// Write `ids` as dense segments, deleting surplus old segments.
    /// Returns the new segment count.
    fn rewrite_segments(
        &mut self,
        store: &mut impl PageStore,
        table: &str,
        trigram: &str,
        ids: &[u64],
        old_seg_count: u32,
    ) -> Result<u32> {
        let cap = max_segment_bytes(store.page_size());
        let mut seg = 0u32;
        let mut chunk: Vec<u64> = Vec::new();
        let mut chunk_len = postings::encode_postings(&[])?.len();
        for &id in ids {
            let grown = if chunk.is_empty() {
                postings::encode_postings(&[id])?.len()
            } else {
                postings::appended_len(chunk_len, chunk.len(), *chunk.last().unwrap(), id)
            };
            if grown > cap && !chunk.is_empty() {
                self.btree.insert(
                    store,
                    &seg_key(table, trigram, seg),
                    &postings::encode_postings(&chunk)?,
                )?;
                seg += 1;
                chunk = vec![id];
                chunk_len = postings::encode_postings(&chunk)?.len();
            } else {
                chunk.push(id);
                chunk_len = grown;
            }
        }
        if !chunk.is_empty() || seg == 0 {
            self.btree.insert(
                store,
                &seg_key(table, trigram, seg),
                &postings::encode_postings(&chunk)?,
            )?;
            seg += 1;
        }
        for stale in seg..old_seg_count {
            self.btree.delete(store, &seg_key(table, trigram, stale))?;
        }
        Ok(seg)
    }
}

fn key_prefix(tag: u8, table: &str, trigram: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + table.len() + trigram.len());
    key.push(tag);
    key.push(table.len() as u8);
    key.extend_from_slice(table.as_bytes());
    key.push(trigram.len() as u8);
    key.extend_from_slice(trigram.as_bytes());
    key
}

fn meta_key(table: &str, trigram: &str) -> Vec<u8> {
    key_prefix(META_TAG, table, trigram)
}

fn seg_key(table: &str, trigram: &str, seg: u32) -> Vec<u8> {
    let mut key = key_prefix(SEG_TAG, table, trigram);
    key.extend_from_slice(&seg.to_be_bytes());
    key
}

fn decode_meta(raw: &[u8]) -> Result<(u32, u64)> {
    if raw.len() != 12 {
        return Err(DecentError::Corruption(
            "trigram meta record has wrong length".into(),
        ));
    }
    Ok((
        u32::from_le_bytes(raw[0..4].try_into().unwrap()),
        u64::from_le_bytes(raw[4..12].try_into().unwrap()),
    ))
}
