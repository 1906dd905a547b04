//! Wheel-of-fortune block pool.
//!
//! The pool draws 8 MiB blocks from the OS and carves them into chunks that
//! form an implicit doubly-linked list inside each block (forward by `len`,
//! backward by `prev_len`). Free chunks big enough to carry a link live in
//! one of two lists, threaded through their own payloads:
//!
//! - the **master** stack: pristine chunks, one per not-yet-consumed block.
//!   The head shrinks as it serves allocations; everything below it spans a
//!   whole block.
//! - the **recycler** ring: chunks produced by `free` or evicted from the
//!   master. Each successful allocation turns the ring once; a turn either
//!   advances the head or, when the clockwise neighbor is smaller, holds
//!   the head in place while the rest of the ring rotates past it. The
//!   largest member therefore reaches the head within one revolution and
//!   stays there, so "is the head big enough?" stands in for a scan.
//!
//! `free_all` rewinds every surviving block to a single pristine chunk in
//! time proportional to the number of blocks, which is the operation this
//! design exists for: dissect one packet, release everything.

use std::ptr::{self, NonNull};

use super::chunk::{
    ALIGN, BLOCK_HDR_SIZE, BLOCK_SIZE, BlockHeader, CHUNK_HDR_SIZE, Chunk, FREE_LINK_SIZE,
    FreeLink, MAX_ALLOC_SIZE, align_above,
};
use super::stats;
use super::sys::{PlatformSysOps, SysError, SysOps};

/// Pool allocator tuned for many short-lived allocations followed by one
/// bulk reset. Single-owner: wrap it in external mutual exclusion (or keep
/// one per thread) if it must be shared.
pub struct BlockPool {
    pub(crate) block_list: Option<NonNull<BlockHeader>>,
    pub(crate) master_head: Option<Chunk>,
    pub(crate) recycler_head: Option<Chunk>,
}

// Safety: the pool owns its blocks outright; moving the pool between
// threads moves ownership of every block with it.
unsafe impl Send for BlockPool {}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_list: None,
            master_head: None,
            recycler_head: None,
        }
    }

    /// Hand out at least `size` bytes, aligned to [`ALIGN`]. `size == 0`
    /// returns a valid pointer to a zero-usable region.
    ///
    /// # Errors
    ///
    /// Fails when the underlying OS allocator cannot supply a new block,
    /// or with [`SysError::SizeOverflow`] when `size` plus header overhead
    /// overflows `usize` on the jumbo path (checked before any OS call).
    /// The pool performs no recovery.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, SysError> {
        if size > MAX_ALLOC_SIZE {
            let ptr = self.alloc_jumbo(size)?;
            self.debug_verify();
            return Ok(ptr);
        }

        // Safety: every chunk handle below derives from a live block owned
        // by this pool.
        unsafe {
            let chunk = match self.recycler_head {
                Some(head) if head.data_len() >= size => head,
                _ => {
                    // An undersized master head still has a reusable tail:
                    // demote it to the recycler instead of discarding it.
                    if let Some(master) = self.master_head
                        && master.data_len() < size
                    {
                        self.pop_master();
                        self.add_to_recycler(master);
                    }
                    match self.master_head {
                        Some(master) => master,
                        None => self.new_block()?,
                    }
                }
            };

            // Carve off the request; any leftover keeps the chunk's spot in
            // its free list.
            self.split_free_chunk(chunk, size);

            if self.recycler_head.is_some() {
                self.cycle_recycler();
            }

            chunk.set_used(true);

            let ptr = chunk.data();
            self.debug_verify();
            Ok(ptr)
        }
    }

    /// Release one allocation.
    ///
    /// # Safety
    ///
    /// - `ptr` must have been returned by `alloc`/`realloc` on this pool.
    /// - `ptr` must not have been freed already.
    /// - `ptr` must not be used after this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        debug_assert!(
            (ptr.as_ptr() as usize).is_multiple_of(ALIGN),
            "pointer {ptr:p} was not produced by this pool (misaligned)"
        );

        // Safety: per the contract above, ptr maps back to a live chunk.
        unsafe {
            let chunk = Chunk::from_data(ptr);

            if chunk.jumbo() {
                self.free_jumbo(chunk);
                self.debug_verify();
                return;
            }

            debug_assert!(chunk.used(), "double free detected for pointer {ptr:p}");

            chunk.set_used(false);
            self.merge_free(chunk);
        }
        self.debug_verify();
    }

    /// Resize an allocation, preserving the first `min(old, size)` payload
    /// bytes. `None` behaves like [`alloc`](Self::alloc). The returned
    /// pointer may differ from `ptr`, which must then no longer be used.
    ///
    /// # Errors
    ///
    /// Fails when the underlying OS allocator cannot supply the memory,
    /// or with [`SysError::SizeOverflow`] when `size` plus header overhead
    /// overflows `usize` — on a jumbo resize, or when relocation hands a
    /// jumbo-sized request to [`alloc`](Self::alloc). The original
    /// allocation is untouched in every failure case.
    ///
    /// # Safety
    ///
    /// `ptr`, when `Some`, must be live and owned by this pool, exactly as
    /// for [`free`](Self::free).
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, SysError> {
        let Some(ptr) = ptr else {
            return self.alloc(size);
        };

        debug_assert!(
            (ptr.as_ptr() as usize).is_multiple_of(ALIGN),
            "pointer {ptr:p} was not produced by this pool (misaligned)"
        );

        // Safety: per the contract above, ptr maps back to a live chunk.
        unsafe {
            let chunk = Chunk::from_data(ptr);

            if chunk.jumbo() {
                let out = self.realloc_jumbo(chunk, size);
                self.debug_verify();
                return out;
            }

            debug_assert!(chunk.used(), "realloc of freed pointer {ptr:p}");

            let cur = chunk.data_len();
            if size > cur {
                if let Some(next) = chunk.next()
                    && !next.used()
                    && cur + next.len() >= size
                {
                    // Grow in place by absorbing from the free right
                    // neighbor. The carve request can underflow by a
                    // header; floor it at zero and the split hands the
                    // neighbor over whole.
                    let mut carve = size - cur;
                    if carve < CHUNK_HDR_SIZE {
                        carve = 0;
                    } else {
                        carve -= CHUNK_HDR_SIZE;
                    }
                    self.split_free_chunk(next, carve);

                    // The split already detached `next` from its list (or
                    // replaced it there), so a plain header merge is enough.
                    // merge_free would momentarily see two free chunks in a
                    // row here and is not guaranteed to handle that.
                    chunk.set_len(chunk.len() + next.len());
                    chunk.set_last(next.last());
                    if let Some(after) = chunk.next() {
                        after.set_prev_len(chunk.len());
                    }

                    self.debug_verify();
                    Ok(ptr)
                } else {
                    // No room on the right; relocate.
                    let moved = self.alloc(size)?;
                    ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), cur);
                    self.free(ptr);
                    Ok(moved)
                }
            } else if size < cur {
                self.split_used_chunk(chunk, size);
                self.debug_verify();
                Ok(ptr)
            } else {
                Ok(ptr)
            }
        }
    }

    /// Release every live allocation at once. Jumbo blocks go back to the
    /// OS; normal blocks are rewound to a single pristine chunk each and
    /// kept for reuse. Cost is linear in blocks, not allocations.
    ///
    /// Every pointer previously returned by this pool is invalidated.
    /// Using one afterwards is undefined behaviour; this call itself is
    /// safe because stale pointers only become dangerous when dereferenced
    /// or passed back in.
    pub fn free_all(&mut self) {
        // The existing free lists are entirely superseded.
        self.master_head = None;
        self.recycler_head = None;

        // Safety: the block list enumerates exactly the blocks this pool
        // owns; `cur` is advanced before a block is released.
        unsafe {
            let mut cur = self.block_list;
            while let Some(block) = cur {
                cur = (*block.as_ptr()).next;
                let chunk = BlockHeader::first_chunk(block);
                if chunk.jumbo() {
                    self.free_jumbo(chunk);
                } else {
                    self.init_block(block);
                }
            }
        }
        self.debug_verify();
    }

    /// Return wholly-unused normal blocks to the OS. Live allocations are
    /// untouched and their pointers remain valid.
    pub fn gc(&mut self) {
        // Safety: the block list enumerates exactly the blocks this pool
        // owns; `cur` is advanced before a block is released.
        unsafe {
            let mut cur = self.block_list;
            self.block_list = None;

            while let Some(block) = cur {
                cur = (*block.as_ptr()).next;
                let chunk = BlockHeader::first_chunk(block);

                if !chunk.jumbo() && !chunk.used() && chunk.last() {
                    // First chunk free and also last: the whole block is
                    // unused. Detach the chunk from whichever free list
                    // holds it and give the block back.
                    let link = chunk.free_link();
                    if let Some(next) = link.next {
                        next.set_free_prev(link.prev);
                    }
                    if let Some(prev) = link.prev {
                        prev.set_free_next(link.next);
                    }
                    if self.recycler_head == Some(chunk) {
                        self.recycler_head = if link.next == Some(chunk) {
                            None
                        } else {
                            link.next
                        };
                    } else if self.master_head == Some(chunk) {
                        self.master_head = link.next;
                    }

                    let total = (*block.as_ptr()).size;
                    PlatformSysOps::free(block.cast(), total);
                    stats::TOTAL_OS_BYTES.sub(total);
                    stats::BLOCKS_LIVE.sub(1);
                } else {
                    self.add_to_block_list(block);
                }
            }
        }
        self.debug_verify();
    }

    /// Blocks (normal and jumbo) currently held from the OS. Walks the
    /// block list.
    #[must_use]
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.block_list;
        // Safety: the block list enumerates live blocks.
        unsafe {
            while let Some(block) = cur {
                count += 1;
                cur = (*block.as_ptr()).next;
            }
        }
        count
    }

    // ----------------------------------------------------------------
    // Master stack
    // ----------------------------------------------------------------

    /// # Safety
    /// `chunk` must be free, trackable, and in no list.
    unsafe fn push_master(&mut self, chunk: Chunk) {
        // Safety: per contract.
        unsafe {
            chunk.set_free_link(FreeLink {
                prev: None,
                next: self.master_head,
            });
            if let Some(old) = self.master_head {
                old.set_free_prev(Some(chunk));
            }
            self.master_head = Some(chunk);
        }
    }

    /// # Safety
    /// All master members must be live chunks.
    unsafe fn pop_master(&mut self) {
        let Some(head) = self.master_head else { return };
        // Safety: per contract.
        unsafe {
            self.master_head = head.free_link().next;
            if let Some(new_head) = self.master_head {
                new_head.set_free_prev(None);
            }
        }
    }

    // ----------------------------------------------------------------
    // Recycler ring
    // ----------------------------------------------------------------

    /// Track a free chunk in the recycler. Chunks too small to carry a
    /// link stay untracked; they only rejoin a list through coalescing.
    ///
    /// # Safety
    /// `chunk` must be free and in no list.
    unsafe fn add_to_recycler(&mut self, chunk: Chunk) {
        // Safety: per contract.
        unsafe {
            if chunk.data_len() < FREE_LINK_SIZE {
                return;
            }

            match self.recycler_head {
                None => {
                    chunk.set_free_link(FreeLink {
                        prev: Some(chunk),
                        next: Some(chunk),
                    });
                    self.recycler_head = Some(chunk);
                }
                Some(head) => {
                    // Splice in just counter-clockwise of the head; a
                    // strictly larger newcomer takes the head spot.
                    let tail = head.free_link().ring_prev();
                    chunk.set_free_link(FreeLink {
                        prev: Some(tail),
                        next: Some(head),
                    });
                    head.set_free_prev(Some(chunk));
                    tail.set_free_next(Some(chunk));

                    if chunk.len() > head.len() {
                        self.recycler_head = Some(chunk);
                    }
                }
            }
        }
    }

    /// # Safety
    /// `chunk` must currently be on the recycler ring.
    unsafe fn remove_from_recycler(&mut self, chunk: Chunk) {
        // Safety: per contract.
        unsafe {
            let link = chunk.free_link();
            if link.prev == Some(chunk) && link.next == Some(chunk) {
                self.recycler_head = None;
            } else {
                // Circular, so no null-checking on either side.
                let prev = link.ring_prev();
                let next = link.ring_next();
                prev.set_free_next(Some(next));
                next.set_free_prev(Some(prev));
                if self.recycler_head == Some(chunk) {
                    self.recycler_head = Some(next);
                }
            }
        }
    }

    /// One wheel-of-fortune turn. A clockwise neighbor smaller than the
    /// head is tucked behind it while the head holds position; otherwise
    /// the head advances one step. Once the largest member is at the head
    /// it never leaves.
    ///
    /// # Safety
    /// All recycler members must be live chunks.
    unsafe fn cycle_recycler(&mut self) {
        let Some(head) = self.recycler_head else { return };
        // Safety: per contract.
        unsafe {
            let link = head.free_link();
            let next = link.ring_next();

            if next.len() < head.len() {
                // Hold the head fixed; rotate the rest of the ring past it.
                let prev = link.ring_prev();
                next.set_free_prev(Some(prev));
                prev.set_free_next(Some(next));

                let new_next = next.free_link().ring_next();
                head.set_free_link(FreeLink {
                    prev: Some(next),
                    next: Some(new_next),
                });
                new_next.set_free_prev(Some(head));
                next.set_free_next(Some(head));
            } else {
                self.recycler_head = Some(next);
            }
        }
    }

    // ----------------------------------------------------------------
    // Split / merge
    // ----------------------------------------------------------------

    /// Carve an aligned request of `size` bytes out of a listed free
    /// chunk. On return the chunk belongs to no list and holds at least
    /// `size` payload bytes; a trackable leftover becomes a new free chunk
    /// occupying the original's list slot.
    ///
    /// # Safety
    /// `chunk` must be free, on exactly one list, with payload >= `size`.
    unsafe fn split_free_chunk(&mut self, chunk: Chunk, size: usize) {
        let want = align_above(size) + CHUNK_HDR_SIZE;

        // Safety: per contract.
        unsafe {
            if chunk.data_len() < want + FREE_LINK_SIZE {
                // The leftover could not carry a free link; hand the chunk
                // over whole.
                if self.master_head == Some(chunk) {
                    self.pop_master();
                } else {
                    self.remove_from_recycler(chunk);
                }
                return;
            }

            let last = chunk.last();
            let leftover = chunk.len() - want;

            chunk.set_len(want);
            chunk.set_last(false);

            let extra = chunk.at_offset(want);

            // The new header for `extra` may land on the old free link, so
            // copy the link out before writing anything through `extra`.
            let old = chunk.free_link();

            if self.master_head == Some(chunk) {
                extra.set_free_link(FreeLink {
                    prev: old.prev,
                    next: old.next,
                });
                if let Some(below) = old.next {
                    below.set_free_prev(Some(extra));
                }
                self.master_head = Some(extra);
            } else {
                if old.prev == Some(chunk) {
                    // Singleton ring.
                    extra.set_free_link(FreeLink {
                        prev: Some(extra),
                        next: Some(extra),
                    });
                } else {
                    extra.set_free_link(FreeLink {
                        prev: old.prev,
                        next: old.next,
                    });
                    old.ring_prev().set_free_next(Some(extra));
                    old.ring_next().set_free_prev(Some(extra));
                }
                if self.recycler_head == Some(chunk) {
                    self.recycler_head = Some(extra);
                }
            }

            // Link is in place; now the header can go down.
            extra.init(want, leftover, false, last, false);

            if let Some(after) = extra.next() {
                after.set_prev_len(leftover);
            }
        }
    }

    /// Shrink a used chunk to `size` payload bytes, releasing the tail.
    /// The tail is coalesced rightward and tracked in the recycler.
    ///
    /// # Safety
    /// `chunk` must be a live used chunk of this pool.
    unsafe fn split_used_chunk(&mut self, chunk: Chunk, size: usize) {
        let want = align_above(size) + CHUNK_HDR_SIZE;

        // Safety: per contract.
        unsafe {
            if want > chunk.data_len() {
                // Not enough room to give anything back.
                return;
            }

            let last = chunk.last();
            let leftover = chunk.len() - want;

            chunk.set_len(want);
            chunk.set_last(false);

            let extra = chunk.at_offset(want);
            extra.init(want, leftover, false, last, false);
            if let Some(after) = extra.next() {
                after.set_prev_len(leftover);
            }

            // The tail's own right neighbor may be free too (it can't be
            // merged left, obviously); this also tracks it.
            self.merge_free(extra);
        }
    }

    /// Coalesce a free, unlisted chunk with any free neighbors and settle
    /// the result into exactly one free list.
    ///
    /// # Safety
    /// `chunk` must be free, in no list, inside a live block.
    unsafe fn merge_free(&mut self, chunk: Chunk) {
        // Safety: per contract.
        unsafe {
            let mut chunk = chunk;
            let mut left_free: Option<Chunk> = None;
            let mut right_free: Option<Chunk> = None;

            // Absorb the right neighbor. Whether it could carry a free
            // link decides list placement below, so remember that before
            // its header stops existing.
            if let Some(right) = chunk.next()
                && !right.used()
            {
                if right.data_len() >= FREE_LINK_SIZE {
                    right_free = Some(right);
                }
                chunk.set_len(chunk.len() + right.len());
                chunk.set_last(right.last());
            }

            // Absorb into the left neighbor, which then stands for the
            // merged chunk.
            if let Some(left) = chunk.prev()
                && !left.used()
            {
                if left.data_len() >= FREE_LINK_SIZE {
                    left_free = Some(left);
                }
                left.set_len(left.len() + chunk.len());
                left.set_last(chunk.last());
                chunk = left;
            }

            if let Some(after) = chunk.next() {
                after.set_prev_len(chunk.len());
            }

            // Headers are consistent; now settle the free lists.
            if let Some(right) = right_free
                && self.master_head == Some(right)
            {
                // The master head was absorbed from the right: the merged
                // chunk inherits its place at the top of the stack,
                // keeping the old head's outgoing link.
                if let Some(left) = left_free {
                    self.remove_from_recycler(left);
                }
                let below = right.free_link().next;
                chunk.set_free_link(FreeLink { prev: None, next: below });
                self.master_head = Some(chunk);
                if let Some(below) = below {
                    below.set_free_prev(Some(chunk));
                }
            } else {
                // A right-merged chunk leaves the recycler. A left-merged
                // chunk already sits in a valid recycler slot; only a
                // chunk that merged neither way needs to be added.
                if let Some(right) = right_free {
                    self.remove_from_recycler(right);
                }
                if left_free.is_none() {
                    self.add_to_recycler(chunk);
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // Block lifecycle
    // ----------------------------------------------------------------

    /// # Safety
    /// `block`'s header must be initialized and not already listed.
    unsafe fn add_to_block_list(&mut self, block: NonNull<BlockHeader>) {
        // Safety: per contract.
        unsafe {
            (*block.as_ptr()).prev = None;
            (*block.as_ptr()).next = self.block_list;
            if let Some(old) = self.block_list {
                (*old.as_ptr()).prev = Some(block);
            }
            self.block_list = Some(block);
        }
    }

    /// # Safety
    /// `block` must currently be on this pool's block list.
    unsafe fn remove_from_block_list(&mut self, block: NonNull<BlockHeader>) {
        // Safety: per contract.
        unsafe {
            let hdr = block.as_ptr();
            match (*hdr).prev {
                Some(prev) => (*prev.as_ptr()).next = (*hdr).next,
                None => self.block_list = (*hdr).next,
            }
            if let Some(next) = (*hdr).next {
                (*next.as_ptr()).prev = (*hdr).prev;
            }
        }
    }

    /// Lay down a single pristine chunk covering the block's payload and
    /// push it onto the master stack.
    ///
    /// # Safety
    /// `block` must be a live normal block whose contents are dead.
    unsafe fn init_block(&mut self, block: NonNull<BlockHeader>) -> Chunk {
        // Safety: per contract.
        unsafe {
            let chunk = BlockHeader::first_chunk(block);
            chunk.init(0, BlockHeader::payload_size(block), false, true, false);
            self.push_master(chunk);
            chunk
        }
    }

    /// Obtain a fresh normal block from the OS; its pristine chunk becomes
    /// the new master head.
    fn new_block(&mut self) -> Result<Chunk, SysError> {
        // Safety: BLOCK_SIZE is non-zero; the header is written before the
        // block is used in any way.
        unsafe {
            let raw = PlatformSysOps::alloc(BLOCK_SIZE)?;
            let block = raw.cast::<BlockHeader>();
            (*block.as_ptr()).size = BLOCK_SIZE;
            self.add_to_block_list(block);

            stats::TOTAL_OS_BYTES.add(BLOCK_SIZE);
            stats::BLOCKS_LIVE.add(1);

            Ok(self.init_block(block))
        }
    }

    // ----------------------------------------------------------------
    // Jumbo path
    // ----------------------------------------------------------------

    /// Serve an oversized request from a dedicated block sized to fit it.
    /// Jumbo chunks never enter the free lists, split, or merge.
    fn alloc_jumbo(&mut self, size: usize) -> Result<NonNull<u8>, SysError> {
        let total = size
            .checked_add(BLOCK_HDR_SIZE + CHUNK_HDR_SIZE)
            .ok_or(SysError::SizeOverflow { requested: size })?;

        // Safety: total is non-zero; the headers are written before use.
        unsafe {
            let raw = PlatformSysOps::alloc(total)?;
            let block = raw.cast::<BlockHeader>();
            (*block.as_ptr()).size = total;
            self.add_to_block_list(block);

            // The block's size is authoritative; len stays 0.
            let chunk = BlockHeader::first_chunk(block);
            chunk.init(0, 0, true, true, true);

            stats::TOTAL_OS_BYTES.add(total);
            stats::JUMBO_LIVE.add(1);

            Ok(chunk.data())
        }
    }

    /// # Safety
    /// `chunk` must be a live jumbo chunk of this pool.
    unsafe fn free_jumbo(&mut self, chunk: Chunk) {
        // Safety: jumbo chunks are the first chunk of their block.
        unsafe {
            let block = chunk.block();
            let total = (*block.as_ptr()).size;
            self.remove_from_block_list(block);
            PlatformSysOps::free(block.cast(), total);

            stats::TOTAL_OS_BYTES.sub(total);
            stats::JUMBO_LIVE.sub(1);
        }
    }

    /// # Safety
    /// `chunk` must be a live jumbo chunk of this pool.
    unsafe fn realloc_jumbo(&mut self, chunk: Chunk, size: usize) -> Result<NonNull<u8>, SysError> {
        let total = size
            .checked_add(BLOCK_HDR_SIZE + CHUNK_HDR_SIZE)
            .ok_or(SysError::SizeOverflow { requested: size })?;

        // Safety: per contract; the OS realloc preserves the headers and
        // payload prefix even when it moves the block.
        unsafe {
            let block = chunk.block();
            let old_total = (*block.as_ptr()).size;
            let moved = PlatformSysOps::realloc(block.cast(), old_total, total)?;
            let block = moved.cast::<BlockHeader>();
            (*block.as_ptr()).size = total;

            // The block may have moved; re-point its list neighbors.
            if let Some(next) = (*block.as_ptr()).next {
                (*next.as_ptr()).prev = Some(block);
            }
            match (*block.as_ptr()).prev {
                Some(prev) => (*prev.as_ptr()).next = Some(block),
                None => self.block_list = Some(block),
            }

            stats::TOTAL_OS_BYTES.sub(old_total);
            stats::TOTAL_OS_BYTES.add(total);

            Ok(BlockHeader::first_chunk(block).data())
        }
    }

    #[inline]
    fn debug_verify(&self) {
        #[cfg(debug_assertions)]
        super::check::verify(self);
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // free_all rewinds every normal block (and releases jumbo blocks);
        // gc then returns the rest to the OS.
        self.free_all();
        self.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Payload a request of `n` bytes actually receives.
    fn granted(n: usize) -> usize {
        align_above(n)
    }

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        // Safety: test code; len is within the allocation.
        unsafe { ptr::write_bytes(ptr.as_ptr(), byte, len) }
    }

    fn check_fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        // Safety: test code.
        unsafe {
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), len);
            assert!(slice.iter().all(|&b| b == byte), "payload corrupted");
        }
    }

    #[test]
    fn test_alloc_basic() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(100).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        assert_eq!(pool.block_count(), 1);
        fill(p, 100, 0x5A);
        check_fill(p, 100, 0x5A);

        // Safety: test code.
        unsafe {
            assert_eq!(Chunk::from_data(p).data_len(), granted(100));
            pool.free(p);
        }
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn test_alloc_zero() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(0).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        assert_eq!(pool.block_count(), 1);

        // Safety: test code.
        unsafe { pool.free(p) };

        // Zero-size requests keep being served from the first block.
        let q = pool.alloc(0).unwrap();
        assert_eq!(pool.block_count(), 1);
        // Safety: test code.
        unsafe { pool.free(q) };
    }

    #[test]
    fn test_alloc_distinct_regions() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(64).unwrap();
        assert_ne!(a, b);

        fill(a, 64, 0x11);
        fill(b, 64, 0x22);
        check_fill(a, 64, 0x11);
        check_fill(b, 64, 0x22);

        // Safety: test code.
        unsafe {
            pool.free(a);
            pool.free(b);
        }
    }

    #[test]
    fn test_max_alloc_consumes_whole_block() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(MAX_ALLOC_SIZE).unwrap();
        assert_eq!(pool.block_count(), 1);
        // Safety: test code.
        unsafe {
            let c = Chunk::from_data(p);
            assert!(!c.jumbo());
            assert_eq!(c.data_len(), MAX_ALLOC_SIZE);
        }
        // The block is fully consumed; the master is empty.
        assert!(pool.master_head.is_none());

        // The next allocation needs a second block.
        let q = pool.alloc(16).unwrap();
        assert_eq!(pool.block_count(), 2);

        // Safety: test code.
        unsafe {
            pool.free(p);
            pool.free(q);
        }
    }

    #[test]
    fn test_jumbo_roundtrip() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(MAX_ALLOC_SIZE + 1).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        assert_eq!(pool.block_count(), 1);
        // Safety: test code.
        unsafe {
            assert!(Chunk::from_data(p).jumbo());
        }
        fill(p, MAX_ALLOC_SIZE + 1, 0x77);
        check_fill(p, MAX_ALLOC_SIZE + 1, 0x77);

        // Jumbo blocks go straight back to the OS.
        // Safety: test code.
        unsafe { pool.free(p) };
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_coalesce_both_directions() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(100).unwrap();

        // Safety: test code.
        unsafe {
            pool.free(a);
            pool.free(b);

            // Both frees collapsed into the master head: one free chunk
            // spanning the whole block payload.
            let head = pool.master_head.expect("master head after frees");
            assert!(pool.recycler_head.is_none());
            assert_eq!(head.data_len(), MAX_ALLOC_SIZE);
            assert!(head.last());
            assert_eq!(head.prev_len(), 0);
        }
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn test_reverse_free_then_large_alloc() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let ptrs: Vec<_> = (0..10).map(|_| pool.alloc(1024).unwrap()).collect();
        assert_eq!(pool.block_count(), 1);

        // Safety: test code.
        unsafe {
            for p in ptrs.into_iter().rev() {
                pool.free(p);
            }
        }

        // Ten 1 KiB regions coalesced back; 10 KiB must fit with no new
        // block.
        let big = pool.alloc(10 * 1024).unwrap();
        assert_eq!(pool.block_count(), 1);
        // Safety: test code.
        unsafe { pool.free(big) };
    }

    #[test]
    fn test_forward_free_then_large_alloc() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let ptrs: Vec<_> = (0..10).map(|_| pool.alloc(1024).unwrap()).collect();

        // Safety: test code.
        unsafe {
            for p in ptrs {
                pool.free(p);
            }
        }

        let big = pool.alloc(10 * 1024).unwrap();
        assert_eq!(pool.block_count(), 1);
        // Safety: test code.
        unsafe { pool.free(big) };
    }

    #[test]
    fn test_master_demotion_keeps_tail_reusable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        // Shrink the first block's master chunk a little.
        let small = pool.alloc(4096).unwrap();

        // Safety: test code.
        unsafe {
            let tail_payload = pool.master_head.unwrap().data_len();

            // Too big for the shrunken tail: the tail is demoted to the
            // recycler and a fresh block serves the request.
            let big = pool.alloc(tail_payload + ALIGN).unwrap();
            assert_eq!(pool.block_count(), 2);
            let recycled = pool.recycler_head.expect("demoted tail in recycler");
            assert_eq!(recycled.data_len(), tail_payload);

            // The demoted tail still serves future requests.
            let reuse = pool.alloc(64).unwrap();
            assert_eq!(pool.block_count(), 2);
            assert!(pool.recycler_head.unwrap().data_len() < tail_payload);

            pool.free(small);
            pool.free(big);
            pool.free(reuse);
        }
    }

    #[test]
    fn test_realloc_grow_in_place() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(100).unwrap();
        fill(p, 100, 0x3C);

        // The right neighbor is the (free) master chunk, so growth happens
        // in place.
        // Safety: test code.
        unsafe {
            let q = pool.realloc(Some(p), 5000).unwrap();
            assert_eq!(q, p);
            check_fill(q, 100, 0x3C);
            assert!(Chunk::from_data(q).data_len() >= 5000);
            pool.free(q);
        }
    }

    #[test]
    fn test_realloc_grow_underflow_floor() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(100).unwrap();
        fill(p, 100, 0x3D);

        // Grow by less than a chunk header; the carve request floors to
        // zero and the neighbor still provides the bytes.
        // Safety: test code.
        unsafe {
            let q = pool.realloc(Some(p), granted(100) + 1).unwrap();
            assert_eq!(q, p);
            check_fill(q, 100, 0x3D);
            assert!(Chunk::from_data(q).data_len() > granted(100));
            pool.free(q);
        }
    }

    #[test]
    fn test_realloc_grow_moves_when_blocked() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(100).unwrap();
        let guard_alloc = pool.alloc(100).unwrap();
        fill(p, 100, 0x41);

        // A used right neighbor forces the alloc-copy-free fallback.
        // Safety: test code.
        unsafe {
            let q = pool.realloc(Some(p), 50_000).unwrap();
            assert_ne!(q, p);
            check_fill(q, 100, 0x41);

            pool.free(q);
            pool.free(guard_alloc);
        }
    }

    #[test]
    fn test_realloc_exact_fit_absorbs_neighbor() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(100).unwrap();
        let _guard_alloc = pool.alloc(100).unwrap();
        fill(a, 100, 0x52);

        // Safety: test code.
        unsafe {
            let b_len = Chunk::from_data(b).len();
            pool.free(b);

            // Exactly the combined payload: absorbed in place, no move.
            let want = granted(100) + b_len;
            let q = pool.realloc(Some(a), want).unwrap();
            assert_eq!(q, a);
            check_fill(q, 100, 0x52);
            assert_eq!(Chunk::from_data(q).data_len(), want);
        }
    }

    #[test]
    fn test_realloc_shrink_keeps_pointer() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(8192).unwrap();
        let guard_alloc = pool.alloc(100).unwrap();
        fill(p, 8192, 0x66);

        // Safety: test code.
        unsafe {
            let q = pool.realloc(Some(p), 128).unwrap();
            assert_eq!(q, p);
            check_fill(q, 128, 0x66);

            // The released tail is reusable without a new block.
            let r = pool.alloc(4096).unwrap();
            assert_eq!(pool.block_count(), 1);

            pool.free(q);
            pool.free(guard_alloc);
            pool.free(r);
        }
    }

    #[test]
    fn test_realloc_same_size_is_noop() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(100).unwrap();
        fill(p, 100, 0x29);

        // Safety: test code.
        unsafe {
            let cur = Chunk::from_data(p).data_len();
            let q = pool.realloc(Some(p), cur).unwrap();
            assert_eq!(q, p);
            check_fill(q, 100, 0x29);
            pool.free(q);
        }
    }

    #[test]
    fn test_realloc_null_behaves_like_alloc() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        // Safety: test code.
        unsafe {
            let p = pool.realloc(None, 256).unwrap();
            assert_eq!(p.as_ptr() as usize % ALIGN, 0);
            fill(p, 256, 0x10);
            check_fill(p, 256, 0x10);
            pool.free(p);
        }
    }

    #[test]
    fn test_jumbo_realloc_preserves_payload() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(MAX_ALLOC_SIZE + 100).unwrap();
        fill(p, MAX_ALLOC_SIZE + 100, 0x9B);

        // Safety: test code.
        unsafe {
            // Grow: still jumbo, payload preserved, block list intact.
            let q = pool.realloc(Some(p), MAX_ALLOC_SIZE * 2).unwrap();
            assert!(Chunk::from_data(q).jumbo());
            check_fill(q, MAX_ALLOC_SIZE + 100, 0x9B);
            assert_eq!(pool.block_count(), 1);

            // Shrink below the jumbo threshold: stays jumbo by design.
            let r = pool.realloc(Some(q), 4096).unwrap();
            assert!(Chunk::from_data(r).jumbo());
            check_fill(r, 4096, 0x9B);

            pool.free(r);
        }
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_cycle_surfaces_largest_recycled_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        // Victims separated by live guards so frees cannot coalesce.
        let v1 = pool.alloc(400).unwrap();
        let _g1 = pool.alloc(16).unwrap();
        let v2 = pool.alloc(200).unwrap();
        let _g2 = pool.alloc(16).unwrap();
        let v3 = pool.alloc(48).unwrap();
        let _g3 = pool.alloc(16).unwrap();

        // Safety: test code.
        unsafe {
            pool.free(v2);
            pool.free(v3);
            pool.free(v1); // largest, takes the ring head on insertion

            // Serving from the big head splits it; the small leftover
            // inherits the head slot, momentarily burying the largest
            // member (v2's region). The turn taken after the very same
            // allocation already surfaces it again.
            let taken = pool.alloc(352).unwrap();
            assert_eq!(pool.recycler_head.unwrap().data_len(), granted(200));

            // Master-served allocations keep turning the wheel; the
            // largest member holds the head.
            let spin = pool.alloc(1024).unwrap();
            assert_eq!(pool.recycler_head.unwrap().data_len(), granted(200));

            // Another turn: the largest member stays put.
            let spin2 = pool.alloc(1024).unwrap();
            assert_eq!(pool.recycler_head.unwrap().data_len(), granted(200));

            // And the recycler, not a new block, now serves a request of
            // exactly that size, reusing v2's region.
            let reuse = pool.alloc(200).unwrap();
            assert_eq!(reuse, v2);
            assert_eq!(pool.block_count(), 1);

            pool.free(taken);
            pool.free(spin);
            pool.free(spin2);
            pool.free(reuse);
        }
    }

    #[test]
    fn test_free_all_rewinds_blocks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        // Two normal blocks plus one jumbo.
        let _a = pool.alloc(MAX_ALLOC_SIZE).unwrap();
        let _b = pool.alloc(1024).unwrap();
        let _j = pool.alloc(MAX_ALLOC_SIZE + 1).unwrap();
        assert_eq!(pool.block_count(), 3);

        pool.free_all();

        // Jumbo gone; both normal blocks rewound to pristine chunks.
        assert_eq!(pool.block_count(), 2);
        assert!(pool.recycler_head.is_none());

        // Safety: test code.
        unsafe {
            let mut depth = 0;
            let mut cur = pool.master_head;
            while let Some(c) = cur {
                assert!(!c.used() && c.last());
                assert_eq!(c.prev_len(), 0);
                assert_eq!(c.data_len(), MAX_ALLOC_SIZE);
                depth += 1;
                cur = c.free_link().next;
            }
            assert_eq!(depth, 2);
        }

        // The pool is fully reusable afterwards.
        let p = pool.alloc(512).unwrap();
        assert_eq!(pool.block_count(), 2);
        // Safety: test code.
        unsafe { pool.free(p) };
    }

    #[test]
    fn test_free_all_gc_returns_everything() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        for _ in 0..50 {
            let _ = pool.alloc(1000).unwrap();
        }
        let _big = pool.alloc(MAX_ALLOC_SIZE).unwrap();
        let _j = pool.alloc(MAX_ALLOC_SIZE + 4096).unwrap();
        assert!(pool.block_count() >= 3);

        pool.free_all();
        pool.gc();

        assert_eq!(pool.block_count(), 0);
        assert!(pool.block_list.is_none());
        assert!(pool.master_head.is_none());
        assert!(pool.recycler_head.is_none());
    }

    #[test]
    fn test_gc_preserves_partial_blocks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        let p = pool.alloc(100).unwrap();
        fill(p, 100, 0xC4);

        pool.gc();
        // The block is partially used and survives; the pointer stays
        // valid.
        assert_eq!(pool.block_count(), 1);
        check_fill(p, 100, 0xC4);

        // Safety: test code.
        unsafe { pool.free(p) };
        pool.gc();
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_gc_unlinks_from_master_stack() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        // Build a two-deep master stack: consume block 1's tail enough
        // that a big request demotes it and opens block 2, then rewind.
        let small = pool.alloc(100).unwrap();
        let big = pool.alloc(MAX_ALLOC_SIZE).unwrap();
        assert_eq!(pool.block_count(), 2);
        // Safety: test code.
        unsafe {
            pool.free(small);
            pool.free(big);
        }
        pool.free_all();

        pool.gc();
        assert_eq!(pool.block_count(), 0);
        assert!(pool.master_head.is_none());
        assert!(pool.recycler_head.is_none());
    }

    #[test]
    fn test_drop_releases_all_memory() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = stats::snapshot();

        {
            let mut pool = BlockPool::new();
            let _p = pool.alloc(64).unwrap();
            let _j = pool.alloc(MAX_ALLOC_SIZE + 1).unwrap();

            let during = stats::snapshot();
            assert_eq!(during.blocks_live, before.blocks_live + 1);
            assert_eq!(during.jumbo_live, before.jumbo_live + 1);
            assert!(during.total_os_bytes >= before.total_os_bytes + BLOCK_SIZE);
            // Live allocations are released by Drop.
        }

        let after = stats::snapshot();
        assert_eq!(after.total_os_bytes, before.total_os_bytes);
        assert_eq!(after.blocks_live, before.blocks_live);
        assert_eq!(after.jumbo_live, before.jumbo_live);
    }

    #[test]
    fn test_stress_mixed_lifecycle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();

        // Deterministic churn: every live allocation carries its own fill
        // byte and is checked before release.
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let mut seq: u32 = 0x1234_5678;

        for round in 0..6 {
            for _ in 0..400 {
                // xorshift, plenty for sizing decisions
                seq ^= seq << 13;
                seq ^= seq >> 17;
                seq ^= seq << 5;

                let action = seq % 10;
                if action < 5 || live.is_empty() {
                    let size = (seq as usize >> 8) % 2048;
                    let byte = (seq >> 24) as u8;
                    let p = pool.alloc(size).unwrap();
                    fill(p, size, byte);
                    live.push((p, size, byte));
                } else if action < 8 {
                    let idx = (seq as usize >> 4) % live.len();
                    let (p, size, byte) = live.swap_remove(idx);
                    check_fill(p, size, byte);
                    // Safety: test code.
                    unsafe { pool.free(p) };
                } else {
                    let idx = (seq as usize >> 4) % live.len();
                    let (p, size, byte) = live[idx];
                    check_fill(p, size, byte);
                    let new_size = (seq as usize >> 9) % 4096;
                    // Safety: test code.
                    let q = unsafe { pool.realloc(Some(p), new_size) }.unwrap();
                    check_fill(q, size.min(new_size), byte);
                    fill(q, new_size, byte);
                    live[idx] = (q, new_size, byte);
                }
            }

            // Everything still intact at the end of the round.
            for &(p, size, byte) in &live {
                check_fill(p, size, byte);
            }

            if round % 2 == 0 {
                live.clear();
                pool.free_all();
            } else {
                pool.gc();
            }
        }

        pool.free_all();
        pool.gc();
        assert_eq!(pool.block_count(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free detected")]
    fn test_double_free_panics() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();
        let p = pool.alloc(64).unwrap();
        // Safety: deliberately violating the contract under debug
        // assertions.
        unsafe {
            pool.free(p);
            pool.free(p);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "misaligned")]
    fn test_misaligned_free_panics() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = BlockPool::new();
        let p = pool.alloc(64).unwrap();
        // Safety: deliberately violating the contract under debug
        // assertions.
        unsafe {
            let bad = NonNull::new_unchecked(p.as_ptr().add(1));
            pool.free(bad);
        }
    }
}
