//! A reusable source index for delta computation.
//!
//! `compute::compute_delta` builds a block index from scratch for every
//! pair it's asked to diff. The scheduler compares one candidate source
//! against many possible targets while it slides its window, so it builds
//! the index once per source and reuses it across every comparison —
//! this is that index. Unlike `compute::compute_delta`'s index, this one
//! hashes block contents instead of borrowing them, so it can outlive the
//! call that built it without tying down the source buffer's lifetime.

use std::collections::HashMap;

use super::{encode_copy, encode_insert, write_varint};

const BLOCK_SIZE: usize = 16;

fn block_hash(block: &[u8]) -> u64 {
    // FNV-1a. Not cryptographic; collisions are resolved by verifying the
    // actual bytes before accepting a match.
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in block {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// A block index over one source buffer's content, reusable across many
/// targets as long as the same source bytes are passed back in.
pub struct DeltaIndex {
    source_len: usize,
    blocks: HashMap<u64, Vec<usize>>,
}

impl DeltaIndex {
    /// Build an index over `source`. Cheap for small sources, roughly
    /// `source.len() / BLOCK_SIZE` hash-map insertions otherwise.
    pub fn new(source: &[u8]) -> Self {
        let mut blocks: HashMap<u64, Vec<usize>> = HashMap::new();
        if source.len() >= BLOCK_SIZE {
            for offset in (0..=source.len() - BLOCK_SIZE).step_by(BLOCK_SIZE) {
                let block = &source[offset..offset + BLOCK_SIZE];
                blocks.entry(block_hash(block)).or_default().push(offset);
            }
        }
        Self {
            source_len: source.len(),
            blocks,
        }
    }

    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Compute a delta from `source` (the same bytes this index was built
    /// over) to `target`, bailing out early (returning `None`) once the
    /// encoded delta would exceed `max_size` bytes.
    pub fn create_delta(&self, source: &[u8], target: &[u8], max_size: u64) -> Option<Vec<u8>> {
        debug_assert_eq!(source.len(), self.source_len);

        let mut delta = Vec::new();
        delta.extend_from_slice(&write_varint(source.len()));
        delta.extend_from_slice(&write_varint(target.len()));

        if target.is_empty() {
            return Some(delta);
        }

        let mut tpos = 0;
        let mut pending_insert: Vec<u8> = Vec::new();

        while tpos < target.len() {
            if delta.len() as u64 > max_size {
                return None;
            }

            let remaining = target.len() - tpos;
            if remaining >= BLOCK_SIZE {
                let block = &target[tpos..tpos + BLOCK_SIZE];
                if let Some(src_offset) = self.find_match(source, block) {
                    let match_len = extend_match(source, src_offset, target, tpos);
                    flush_insert(&mut delta, &mut pending_insert);
                    emit_copy(&mut delta, src_offset, match_len);
                    tpos += match_len;
                    continue;
                }
            }

            pending_insert.push(target[tpos]);
            tpos += 1;
            if pending_insert.len() == 127 {
                flush_insert(&mut delta, &mut pending_insert);
            }
        }

        flush_insert(&mut delta, &mut pending_insert);

        if delta.len() as u64 > max_size {
            None
        } else {
            Some(delta)
        }
    }

    fn find_match(&self, source: &[u8], block: &[u8]) -> Option<usize> {
        let candidates = self.blocks.get(&block_hash(block))?;
        candidates
            .iter()
            .copied()
            .find(|&offset| &source[offset..offset + BLOCK_SIZE] == block)
    }
}

fn extend_match(source: &[u8], src_off: usize, target: &[u8], tgt_off: usize) -> usize {
    let max_len = std::cmp::min(source.len() - src_off, target.len() - tgt_off);
    let mut len = BLOCK_SIZE;
    while len < max_len && source[src_off + len] == target[tgt_off + len] {
        len += 1;
    }
    len
}

fn flush_insert(delta: &mut Vec<u8>, pending: &mut Vec<u8>) {
    while !pending.is_empty() {
        let chunk_len = std::cmp::min(pending.len(), 127);
        let chunk: Vec<u8> = pending.drain(..chunk_len).collect();
        delta.extend_from_slice(&encode_insert(&chunk));
    }
}

fn emit_copy(delta: &mut Vec<u8>, offset: usize, mut size: usize) {
    let mut off = offset;
    while size > 0 {
        let chunk = std::cmp::min(size, 0x00ff_ffff);
        delta.extend_from_slice(&encode_copy(off as u64, chunk));
        off += chunk;
        size -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::apply::apply_delta;

    #[test]
    fn reused_index_produces_valid_deltas_for_multiple_targets() {
        let source: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let index = DeltaIndex::new(&source);

        let mut target_a = source.clone();
        target_a[10] = 0xAA;
        let mut target_b = source.clone();
        target_b[3000] = 0xBB;

        let delta_a = index.create_delta(&source, &target_a, u64::MAX).unwrap();
        let delta_b = index.create_delta(&source, &target_b, u64::MAX).unwrap();

        assert_eq!(apply_delta(&source, &delta_a).unwrap(), target_a);
        assert_eq!(apply_delta(&source, &delta_b).unwrap(), target_b);
    }

    #[test]
    fn max_size_bails_out() {
        let source: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let target: Vec<u8> = (0..4096u32).map(|i| ((i * 7) % 251) as u8).collect();
        let index = DeltaIndex::new(&source);
        assert!(index.create_delta(&source, &target, 4).is_none());
    }
}
