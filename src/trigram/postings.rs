/// Postings segment codec: a strictly ascending sequence of row ids,
/// stored as [count: varint][first id: varint][gap: varint]*.
///
/// Decoding is bounded: a budget of row ids caps how much a lookup will
/// materialize, and tripping the budget surfaces as a `truncated` flag so
/// the caller falls back to a scan instead of risking unbounded memory.
use crate::error::{DecentError, Result};
use crate::storage::page::{decode_varint, encode_varint, varint_len};

pub fn encode_postings(ids: &[u64]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + ids.len() * 2);
    encode_varint(&mut buf, ids.len() as u64);
    let mut prev = 0u64;
    for (i, &id) in ids.iter().enumerate() {
        if i > 0 && id <= prev {
            return Err(DecentError::Internal(
                "postings must be strictly ascending".into(),
            ));
        }
        encode_varint(&mut buf, id - prev);
        prev = id;
    }
    Ok(buf)
}

pub fn decode_postings(data: &[u8]) -> Result<Vec<u64>> {
    let (ids, complete) = decode_postings_bounded(data, usize::MAX)?;
    debug_assert!(complete);
    Ok(ids)
}

/// Decode at most `budget` ids. Returns the ids and whether the segment
/// was fully decoded.
pub fn decode_postings_bounded(data: &[u8], budget: usize) -> Result<(Vec<u64>, bool)> {
    let mut offset = 0;
    let count = decode_varint(data, &mut offset)
        .ok_or_else(|| DecentError::Corruption("postings segment missing count".into()))?
        as usize;
    let take = std::cmp::min(count, budget);
    // Capacity from untrusted count stays bounded; the vec grows as needed.
    let mut ids = Vec::with_capacity(take.min(64 * 1024));
    let mut prev = 0u64;
    for i in 0..take {
        let delta = decode_varint(data, &mut offset)
            .ok_or_else(|| DecentError::Corruption("postings segment truncated".into()))?;
        if i > 0 && delta == 0 {
            return Err(DecentError::Corruption(
                "postings segment has zero gap".into(),
            ));
        }
        prev += delta;
        ids.push(prev);
    }
    Ok((ids, take == count))
}

/// Encoded size after appending `id` to a segment currently holding
/// `count` ids ending at `last`. Used for the O(1) tail-append check.
pub fn appended_len(current_len: usize, count: usize, last: u64, id: u64) -> usize {
    // The count prefix may grow by a octet when it crosses a varint
    // boundary; recompute both prefixes exactly.
    current_len - varint_len(count as u64) + varint_len(count as u64 + 1) + varint_len(id - last)
}

/// Number of ids recorded in a segment without decoding it.
pub fn segment_count(data: &[u8]) -> Result<usize> {
    let mut offset = 0;
    decode_varint(data, &mut offset)
        .map(|c| c as usize)
        .ok_or_else(|| DecentError::Corruption("postings segment missing count".into()))
}

/// Intersect sorted, deduplicated id lists, smallest first: the smallest
/// list seeds the candidate set and every other list filters it with a
/// linear merge.
pub fn intersect(mut lists: Vec<Vec<u64>>) -> Vec<u64> {
    if lists.is_empty() {
        return Vec::new();
    }
    lists.sort_by_key(Vec::len);
    let mut result = lists.remove(0);
    for list in &lists {
        if result.is_empty() {
            break;
        }
        let mut kept = Vec::with_capacity(result.len());
        let mut i = 0;
        for &id in &result {
            while i < list.len() && list[i] < id {
                i += 1;
            }
            if i < list.len() && list[i] == id {
                kept.push(id);
            }
        }
        result = kept;
    }
    result
}
