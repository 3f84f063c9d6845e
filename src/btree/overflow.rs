/// Overflow chains: singly linked page lists carrying one oversized
/// payload. aux0 = next page (0 terminates), aux1 = chunk length; the chunk
/// occupies the payload region.
///
/// The B+Tree writes chains as `Overflow` pages; the trigram index reuses
/// the same machinery with `TrigramPostings` pages for its spilled
/// segments.
use std::collections::HashSet;

use crate::error::{DecentError, Result};
use crate::storage::page::{Page, PageId, PageKind, NIL_PAGE};
use crate::storage::page_store::PageStore;

pub fn chunk_capacity(page_size: usize) -> usize {
    Page::payload_capacity(page_size)
}

/// Write `payload` as a chain of `kind` pages. Returns the head page id.
pub fn write_chain(store: &mut impl PageStore, payload: &[u8], kind: PageKind) -> Result<PageId> {
    if payload.is_empty() {
        return Err(DecentError::Internal("empty overflow payload".into()));
    }
    let chunk = chunk_capacity(store.page_size());
    let mut pages = Vec::with_capacity(payload.len().div_ceil(chunk));
    for _ in 0..payload.len().div_ceil(chunk) {
        pages.push(store.allocate_page(kind)?);
    }

    let ids: Vec<PageId> = pages.iter().map(|p| p.id()).collect();
    for (i, mut page) in pages.into_iter().enumerate() {
        let next = ids.get(i + 1).copied().unwrap_or(NIL_PAGE);
        let start = i * chunk;
        let end = std::cmp::min(start + chunk, payload.len());
        page.set_aux0(next);
        page.set_aux1((end - start) as u32);
        page.payload_mut()[..end - start].copy_from_slice(&payload[start..end]);
        store.write_page(page)?;
    }
    Ok(ids[0])
}

/// Read a whole chain back. `total_len` is the length recorded at the head
/// reference; a mismatch is corruption.
pub fn read_chain(store: &mut impl PageStore, head: PageId, total_len: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len as usize);
    let mut visited = HashSet::new();
    let mut current = head;

    while current != NIL_PAGE {
        if !visited.insert(current) {
            return Err(DecentError::Corruption(format!(
                "overflow chain cycle at page {}",
                current
            )));
        }
        let page = store.read_page(current)?;
        if !matches!(page.kind(), PageKind::Overflow | PageKind::TrigramPostings) {
            return Err(DecentError::Corruption(format!(
                "page {} in overflow chain has kind {:?}",
                current,
                page.kind()
            )));
        }
        let chunk_len = page.aux1() as usize;
        if chunk_len > page.payload().len() {
            return Err(DecentError::Corruption(format!(
                "overflow chunk length {} exceeds page capacity",
                chunk_len
            )));
        }
        out.extend_from_slice(&page.payload()[..chunk_len]);
        current = page.aux0();
    }

    if out.len() != total_len as usize {
        return Err(DecentError::Corruption(format!(
            "overflow chain length {} does not match recorded {}",
            out.len(),
            total_len
        )));
    }
    Ok(out)
}

/// Return every page of a chain to the freelist.
pub fn free_chain(store: &mut impl PageStore, head: PageId) -> Result<()> {
    let mut visited = HashSet::new();
    let mut current = head;
    while current != NIL_PAGE {
        if !visited.insert(current) {
            return Err(DecentError::Corruption(format!(
                "overflow chain cycle at page {} during free",
                current
            )));
        }
        let page = store.read_page(current)?;
        let next = page.aux0();
        store.free_page(current)?;
        current = next;
    }
    Ok(())
}
