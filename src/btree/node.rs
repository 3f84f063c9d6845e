/// B+Tree node layout on slotted pages.
///
/// A node is a page of kind `BtreeLeaf` or `BtreeInternal`; the cell region
/// holds its sorted entries.
///
/// Leaf aux slots: aux0 = previous sibling, aux1 = next sibling (page ids,
/// 0 = none). Leaf cell: [key_len: u16][key][flag: u8][value...], where
/// flag 0 means the value bytes follow inline and flag 1 means the cell
/// ends with an overflow-chain head ([total_len: u32][first_page: u32]).
///
/// Internal aux slots: aux0 = rightmost child. Internal cell:
/// [left_child: u32][key_len: u16][key]. Entry i's left child holds keys
/// strictly below key(i); the rightmost child holds keys at or above the
/// last key.
///
/// Keys are opaque byte strings under lexicographic comparison.
use crate::error::{DecentError, Result};
use crate::storage::page::{Page, PageId};

pub const VALUE_INLINE: u8 = 0;
pub const VALUE_OVERFLOW: u8 = 1;

/// Keys are kept small enough that a handful of cells always fit per node.
pub fn max_key_len(page_size: usize) -> usize {
    page_size / 16
}

/// Values above this spill to an overflow chain.
pub fn max_inline_value(page_size: usize) -> usize {
    page_size / 8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    Inline(Vec<u8>),
    Overflow { total_len: u32, head: PageId },
}

// --- leaf cells ---

pub fn encode_leaf_cell(key: &[u8], value: &LeafValue) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + key.len() + 16);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    match value {
        LeafValue::Inline(bytes) => {
            buf.push(VALUE_INLINE);
            buf.extend_from_slice(bytes);
        }
        LeafValue::Overflow { total_len, head } => {
            buf.push(VALUE_OVERFLOW);
            buf.extend_from_slice(&total_len.to_le_bytes());
            buf.extend_from_slice(&head.to_le_bytes());
        }
    }
    buf
}

pub fn decode_leaf_cell(cell: &[u8]) -> Result<(&[u8], LeafValue)> {
    if cell.len() < 3 {
        return Err(DecentError::Corruption("leaf cell too short".into()));
    }
    let key_len = u16::from_le_bytes(cell[0..2].try_into().unwrap()) as usize;
    let rest = cell
        .get(2 + key_len..)
        .ok_or_else(|| DecentError::Corruption("leaf cell key overruns cell".into()))?;
    let key = &cell[2..2 + key_len];
    match rest.first() {
        Some(&VALUE_INLINE) => Ok((key, LeafValue::Inline(rest[1..].to_vec()))),
        Some(&VALUE_OVERFLOW) => {
            if rest.len() != 9 {
                return Err(DecentError::Corruption(
                    "overflow head cell has wrong length".into(),
                ));
            }
            Ok((
                key,
                LeafValue::Overflow {
                    total_len: u32::from_le_bytes(rest[1..5].try_into().unwrap()),
                    head: u32::from_le_bytes(rest[5..9].try_into().unwrap()),
                },
            ))
        }
        _ => Err(DecentError::Corruption("leaf cell missing value flag".into())),
    }
}

pub fn leaf_key(page: &Page, idx: u16) -> Result<&[u8]> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| DecentError::Corruption(format!("leaf cell {} missing", idx)))?;
    let key_len = u16::from_le_bytes(cell[0..2].try_into().unwrap()) as usize;
    cell.get(2..2 + key_len)
        .ok_or_else(|| DecentError::Corruption("leaf cell key overruns cell".into()))
}

pub fn leaf_entry(page: &Page, idx: u16) -> Result<(&[u8], LeafValue)> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| DecentError::Corruption(format!("leaf cell {} missing", idx)))?;
    decode_leaf_cell(cell)
}

pub fn leaf_prev(page: &Page) -> PageId {
    page.aux0()
}

pub fn set_leaf_prev(page: &mut Page, id: PageId) {
    page.set_aux0(id);
}

pub fn leaf_next(page: &Page) -> PageId {
    page.aux1()
}

pub fn set_leaf_next(page: &mut Page, id: PageId) {
    page.set_aux1(id);
}

/// Binary search among leaf cells. `Ok(i)` = exact match at cell i,
/// `Err(i)` = insertion point.
pub fn leaf_search(page: &Page, key: &[u8]) -> Result<std::result::Result<u16, u16>> {
    let mut lo = 0u16;
    let mut hi = page.cell_count();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match leaf_key(page, mid)?.cmp(key) {
            std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    Ok(Err(lo))
}

// --- internal cells ---

pub fn encode_internal_cell(left_child: PageId, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + key.len());
    buf.extend_from_slice(&left_child.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    buf
}

pub fn decode_internal_cell(cell: &[u8]) -> Result<(PageId, &[u8])> {
    if cell.len() < 6 {
        return Err(DecentError::Corruption("internal cell too short".into()));
    }
    let left_child = u32::from_le_bytes(cell[0..4].try_into().unwrap());
    let key_len = u16::from_le_bytes(cell[4..6].try_into().unwrap()) as usize;
    let key = cell
        .get(6..6 + key_len)
        .ok_or_else(|| DecentError::Corruption("internal cell key overruns cell".into()))?;
    Ok((left_child, key))
}

pub fn internal_key(page: &Page, idx: u16) -> Result<&[u8]> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| DecentError::Corruption(format!("internal cell {} missing", idx)))?;
    Ok(decode_internal_cell(cell)?.1)
}

pub fn internal_left_child(page: &Page, idx: u16) -> Result<PageId> {
    let cell = page
        .cell(idx)
        .ok_or_else(|| DecentError::Corruption(format!("internal cell {} missing", idx)))?;
    Ok(decode_internal_cell(cell)?.0)
}

pub fn right_child(page: &Page) -> PageId {
    page.aux0()
}

pub fn set_right_child(page: &mut Page, id: PageId) {
    page.set_aux0(id);
}

/// Child pointer at position `pos` in [0, cell_count]; `cell_count` is the
/// rightmost child.
pub fn child_at(page: &Page, pos: u16) -> Result<PageId> {
    if pos == page.cell_count() {
        Ok(right_child(page))
    } else {
        internal_left_child(page, pos)
    }
}

/// Binary search for the child covering `key`. Returns (child page, child
/// position).
pub fn find_child(page: &Page, key: &[u8]) -> Result<(PageId, u16)> {
    let mut lo = 0u16;
    let mut hi = page.cell_count();
    // First entry whose key is strictly greater than `key`.
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if internal_key(page, mid)? <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok((child_at(page, lo)?, lo))
}
