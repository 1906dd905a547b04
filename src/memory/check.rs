//! Structural verification of a pool, run after every public operation in
//! debug builds. Panics with a descriptive message on the first violation.

use fixedbitset::FixedBitSet;

use super::chunk::{ALIGN, BLOCK_SIZE, BlockHeader, CHUNK_HDR_SIZE, Chunk, FREE_LINK_SIZE};
use super::pool::BlockPool;

fn mark(free_chunks: &[usize], seen: &mut FixedBitSet, chunk: Chunk) {
    let idx = free_chunks
        .binary_search(&(chunk.as_ptr() as usize))
        .expect("listed free chunk not found in any block");
    assert!(!seen.contains(idx), "free chunk present in a list twice");
    seen.insert(idx);
}

pub(crate) fn verify(pool: &BlockPool) {
    // Safety: the pool is quiescent during verification and every handle
    // below derives from its own block list.
    unsafe {
        // Addresses of every trackable free chunk found in the block walk.
        let mut free_chunks: Vec<usize> = Vec::new();

        let mut cur = pool.block_list;
        while let Some(block) = cur {
            let hdr = block.as_ptr();

            if (*hdr).prev.is_none() {
                assert_eq!(
                    pool.block_list,
                    Some(block),
                    "block without predecessor is not the list head"
                );
            }
            if let Some(next) = (*hdr).next {
                assert_eq!(
                    (*next.as_ptr()).prev,
                    Some(block),
                    "block list back-link mismatch"
                );
            }

            let first = BlockHeader::first_chunk(block);
            if first.jumbo() {
                assert!(first.used() && first.last(), "jumbo chunk must be used and last");
                assert_eq!(first.prev_len(), 0, "jumbo chunk with a predecessor");
            } else {
                assert_eq!((*hdr).size, BLOCK_SIZE, "normal block with nonstandard size");

                // The chunk chain must tile the block payload exactly.
                let payload = BlockHeader::payload_size(block);
                let mut offset = 0usize;
                let mut expected_prev = 0usize;
                let mut left_was_used = true;
                let mut chunk = first;
                loop {
                    assert_eq!(chunk.prev_len(), expected_prev, "prev_len chain broken");
                    let len = chunk.len();
                    assert!(
                        len >= CHUNK_HDR_SIZE && len.is_multiple_of(ALIGN),
                        "bad chunk len {len}"
                    );
                    assert!(!chunk.jumbo(), "jumbo chunk inside a normal block");

                    if !chunk.used() {
                        assert!(left_was_used, "two adjacent free chunks");
                        if chunk.data_len() >= FREE_LINK_SIZE {
                            free_chunks.push(chunk.as_ptr() as usize);
                        }
                    }

                    left_was_used = chunk.used();
                    offset += len;
                    expected_prev = len;

                    if chunk.last() {
                        break;
                    }
                    assert!(
                        offset + CHUNK_HDR_SIZE <= payload,
                        "chunk chain overruns its block"
                    );
                    chunk = chunk.next().expect("non-last chunk has a successor");
                }
                assert_eq!(offset, payload, "chunk lens don't cover the block");
            }

            cur = (*hdr).next;
        }

        free_chunks.sort_unstable();
        let mut seen = FixedBitSet::with_capacity(free_chunks.len());

        // Master stack: null-terminated, back-links mirror forward links,
        // members below the head span whole pristine blocks.
        let mut expect_prev: Option<Chunk> = None;
        let mut cur = pool.master_head;
        while let Some(chunk) = cur {
            assert!(
                !chunk.used() && !chunk.jumbo(),
                "master member must be a free normal chunk"
            );
            assert!(
                chunk.data_len() >= FREE_LINK_SIZE,
                "untrackable chunk in the master stack"
            );
            if expect_prev.is_some() {
                assert!(
                    chunk.prev_len() == 0 && chunk.last(),
                    "non-head master member is not pristine"
                );
            }
            let link = chunk.free_link();
            assert_eq!(link.prev, expect_prev, "master back-link mismatch");
            mark(&free_chunks, &mut seen, chunk);
            expect_prev = Some(chunk);
            cur = link.next;
        }

        // Recycler: a closed ring with symmetric links, same length in
        // both directions.
        if let Some(head) = pool.recycler_head {
            let cap = free_chunks.len() + 1;

            let mut forward = 0usize;
            let mut chunk = head;
            loop {
                assert!(
                    !chunk.used() && !chunk.jumbo(),
                    "recycler member must be a free normal chunk"
                );
                assert!(
                    chunk.data_len() >= FREE_LINK_SIZE,
                    "untrackable chunk in the recycler"
                );
                let next = chunk.free_link().ring_next();
                assert_eq!(
                    next.free_link().prev,
                    Some(chunk),
                    "recycler ring back-link mismatch"
                );
                mark(&free_chunks, &mut seen, chunk);
                forward += 1;
                assert!(forward <= cap, "recycler ring does not close");
                chunk = next;
                if chunk == head {
                    break;
                }
            }

            let mut backward = 0usize;
            let mut chunk = head;
            loop {
                chunk = chunk.free_link().ring_prev();
                backward += 1;
                assert!(backward <= cap, "recycler ring does not close backwards");
                if chunk == head {
                    break;
                }
            }
            assert_eq!(forward, backward, "ring length differs by direction");
        }

        assert_eq!(
            seen.count_ones(..),
            free_chunks.len(),
            "trackable free chunk missing from both lists"
        );
    }
}
