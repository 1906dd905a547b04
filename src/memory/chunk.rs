use std::ptr::NonNull;

/// Payload alignment: two machine words, matching what the platform
/// `malloc` guarantees. Every chunk size and every data pointer handed to a
/// caller is a multiple of this.
pub const ALIGN: usize = 2 * size_of::<usize>();

/// Normal blocks are requested from the OS in units of this size.
/// Must fit the 29-bit chunk length field.
pub const BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Smallest multiple of `ALIGN` strictly greater than `size`.
/// An already-aligned size gains a full `ALIGN` of slack.
pub(crate) const fn align_above(size: usize) -> usize {
    size + ALIGN - (size & (ALIGN - 1))
}

pub(crate) const CHUNK_HDR_SIZE: usize = align_above(size_of::<ChunkHeader>());
pub(crate) const BLOCK_HDR_SIZE: usize = align_above(size_of::<BlockHeader>());
pub(crate) const FREE_LINK_SIZE: usize = size_of::<FreeLink>();

/// Largest request a normal block can serve; anything bigger goes to a
/// dedicated jumbo block.
pub const MAX_ALLOC_SIZE: usize = BLOCK_SIZE - BLOCK_HDR_SIZE - CHUNK_HDR_SIZE;

const LEN_BITS: u32 = 29;
const LEN_MASK: u32 = (1 << LEN_BITS) - 1;
const FLAG_LAST: u32 = 1 << 31;
const FLAG_USED: u32 = 1 << 30;
const FLAG_JUMBO: u32 = 1 << 29;

const _: () = assert!(BLOCK_SIZE <= 1 << LEN_BITS);
const _: () = assert!(BLOCK_SIZE % ALIGN == 0);
const _: () = assert!(BLOCK_SIZE > BLOCK_HDR_SIZE + CHUNK_HDR_SIZE + FREE_LINK_SIZE);
const _: () = assert!(ALIGN.is_power_of_two() && ALIGN >= 8);

/// Header of an OS-level block. Blocks form an intrusive doubly-linked
/// list owned by the pool. `size` records the exact byte count obtained
/// from the OS (normal blocks: `BLOCK_SIZE`; jumbo blocks: sized to fit).
#[repr(C)]
pub(crate) struct BlockHeader {
    pub prev: Option<NonNull<BlockHeader>>,
    pub next: Option<NonNull<BlockHeader>>,
    pub size: usize,
}

impl BlockHeader {
    /// The chunk sitting immediately after the (padded) block header.
    ///
    /// # Safety
    /// `block` must point to a live block owned by the pool.
    #[inline]
    pub unsafe fn first_chunk(block: NonNull<BlockHeader>) -> Chunk {
        // Safety: the first chunk header lives at a fixed offset inside the
        // block allocation.
        unsafe {
            Chunk(NonNull::new_unchecked(
                block.as_ptr().cast::<u8>().add(BLOCK_HDR_SIZE).cast(),
            ))
        }
    }

    /// Usable bytes after the padded block header.
    ///
    /// # Safety
    /// `block` must point to a live block owned by the pool.
    #[inline]
    pub unsafe fn payload_size(block: NonNull<BlockHeader>) -> usize {
        // Safety: caller guarantees the header is live.
        unsafe { (*block.as_ptr()).size - BLOCK_HDR_SIZE }
    }
}

/// Per-chunk header, packed into 8 bytes.
///
/// Bit layout of `packed: u32`:
/// ```text
///   [31]     last   — final chunk in its block
///   [30]     used   — currently allocated to a caller
///   [29]     jumbo  — sole chunk of a dedicated oversized block
///   [28..0]  len    — total chunk bytes including this header
/// ```
///
/// `prev` is the byte distance back to the previous chunk's header, 0 for
/// the first chunk of a block. For jumbo chunks `len` and `prev` are
/// meaningless; the block header's `size` is authoritative.
#[repr(C)]
pub(crate) struct ChunkHeader {
    prev: u32,
    packed: u32,
}

impl ChunkHeader {
    #[inline]
    fn len(&self) -> usize {
        (self.packed & LEN_MASK) as usize
    }

    #[inline]
    fn set_len(&mut self, len: usize) {
        debug_assert!(len <= LEN_MASK as usize, "chunk len {len} overflows field");
        self.packed = (self.packed & !LEN_MASK) | (len as u32);
    }

    #[inline]
    fn flag(&self, mask: u32) -> bool {
        self.packed & mask != 0
    }

    #[inline]
    fn set_flag(&mut self, mask: u32, v: bool) {
        if v {
            self.packed |= mask;
        } else {
            self.packed &= !mask;
        }
    }
}

/// What a free chunk's payload holds while the chunk sits in the master
/// stack or the recycler ring. Overlays the first 16 payload bytes; only
/// valid while `used == 0` and the payload is big enough to carry it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct FreeLink {
    pub prev: Option<Chunk>,
    pub next: Option<Chunk>,
}

impl FreeLink {
    /// # Safety
    /// Only for links of chunks on the recycler ring, where both
    /// neighbors are always populated.
    #[inline]
    pub unsafe fn ring_prev(self) -> Chunk {
        debug_assert!(self.prev.is_some(), "recycler link missing prev");
        // Safety: ring membership keeps both links populated.
        unsafe { self.prev.unwrap_unchecked() }
    }

    /// # Safety
    /// Only for links of chunks on the recycler ring.
    #[inline]
    pub unsafe fn ring_next(self) -> Chunk {
        debug_assert!(self.next.is_some(), "recycler link missing next");
        // Safety: ring membership keeps both links populated.
        unsafe { self.next.unwrap_unchecked() }
    }
}

/// Handle to a chunk header somewhere inside a block. Plain address
/// equality; all access goes through raw reads/writes because free-list
/// links live inside chunk payloads and may be rewritten out from under
/// any long-lived reference. Transparent over `NonNull` so `Option<Chunk>`
/// is a plain nullable pointer and `FreeLink` is exactly two words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Chunk(NonNull<ChunkHeader>);

impl Chunk {
    #[inline]
    pub fn as_ptr(self) -> *mut ChunkHeader {
        self.0.as_ptr()
    }

    /// Recover the owning chunk from a data pointer previously handed out.
    ///
    /// # Safety
    /// `data` must have been produced by [`Chunk::data`] on a live chunk.
    #[inline]
    pub unsafe fn from_data(data: NonNull<u8>) -> Chunk {
        // Safety: data pointers sit exactly one padded header past the
        // chunk header.
        unsafe { Chunk(NonNull::new_unchecked(data.as_ptr().sub(CHUNK_HDR_SIZE).cast())) }
    }

    /// The pointer handed to callers: one padded header past `self`.
    ///
    /// # Safety
    /// `self` must point into a live block.
    #[inline]
    pub unsafe fn data(self) -> NonNull<u8> {
        // Safety: the payload starts inside the same allocation.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(CHUNK_HDR_SIZE)) }
    }

    /// The sibling chunk whose header sits `bytes` past this one's.
    ///
    /// # Safety
    /// `bytes` must stay within the owning block.
    #[inline]
    pub unsafe fn at_offset(self, bytes: usize) -> Chunk {
        // Safety: caller keeps the offset inside the block.
        unsafe { Chunk(NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(bytes).cast())) }
    }

    /// Next chunk in the block, `None` past the final one.
    ///
    /// # Safety
    /// `self` must point to a live, initialized chunk header.
    #[inline]
    pub unsafe fn next(self) -> Option<Chunk> {
        // Safety: header is live per caller contract.
        unsafe {
            if self.last() {
                None
            } else {
                Some(self.at_offset(self.len()))
            }
        }
    }

    /// Previous chunk in the block, `None` for the first.
    ///
    /// # Safety
    /// `self` must point to a live, initialized chunk header.
    #[inline]
    pub unsafe fn prev(self) -> Option<Chunk> {
        // Safety: header is live per caller contract.
        unsafe {
            let back = self.prev_len();
            if back == 0 {
                None
            } else {
                Some(Chunk(NonNull::new_unchecked(
                    self.0.as_ptr().cast::<u8>().sub(back).cast(),
                )))
            }
        }
    }

    /// The block header this chunk's block starts with. Only meaningful for
    /// the first chunk of a block (jumbo chunks always are).
    ///
    /// # Safety
    /// `self` must be the first chunk of its block.
    #[inline]
    pub unsafe fn block(self) -> NonNull<BlockHeader> {
        // Safety: first chunks sit exactly one padded block header past the
        // block start.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().sub(BLOCK_HDR_SIZE).cast()) }
    }

    /// Write the whole header in one go.
    ///
    /// # Safety
    /// `self` must point to writable header space inside a live block.
    pub unsafe fn init(self, prev_len: usize, len: usize, used: bool, last: bool, jumbo: bool) {
        debug_assert!(len <= LEN_MASK as usize);
        debug_assert!(prev_len <= LEN_MASK as usize);
        let mut packed = (len as u32) & LEN_MASK;
        if last {
            packed |= FLAG_LAST;
        }
        if used {
            packed |= FLAG_USED;
        }
        if jumbo {
            packed |= FLAG_JUMBO;
        }
        // Safety: header space is writable per caller contract.
        unsafe {
            self.0.as_ptr().write(ChunkHeader {
                prev: prev_len as u32,
                packed,
            });
        }
    }

    // Header field access. All unsafe for the same reason: they dereference
    // the raw header, which must be live.

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn len(self) -> usize {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).len() }
    }

    /// # Safety
    /// Header must be live; `len` must fit 29 bits.
    #[inline]
    pub unsafe fn set_len(self, len: usize) {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).set_len(len) }
    }

    /// Payload bytes available to a caller.
    ///
    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn data_len(self) -> usize {
        // Safety: per contract.
        unsafe { self.len() - CHUNK_HDR_SIZE }
    }

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn prev_len(self) -> usize {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).prev as usize }
    }

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn set_prev_len(self, prev_len: usize) {
        debug_assert!(prev_len <= LEN_MASK as usize);
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).prev = prev_len as u32 }
    }

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn used(self) -> bool {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).flag(FLAG_USED) }
    }

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn set_used(self, v: bool) {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).set_flag(FLAG_USED, v) }
    }

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn last(self) -> bool {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).flag(FLAG_LAST) }
    }

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn set_last(self, v: bool) {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).set_flag(FLAG_LAST, v) }
    }

    /// # Safety
    /// Header must be live.
    #[inline]
    pub unsafe fn jumbo(self) -> bool {
        // Safety: per contract.
        unsafe { (*self.0.as_ptr()).flag(FLAG_JUMBO) }
    }

    // Free-link overlay. The link occupies the first 16 payload bytes and
    // is only meaningful while the chunk is free and trackable.

    /// # Safety
    /// Chunk must be free with payload >= `FREE_LINK_SIZE`.
    #[inline]
    pub unsafe fn free_link(self) -> FreeLink {
        // Safety: per contract; the payload is 16-aligned.
        unsafe { self.data().cast::<FreeLink>().as_ptr().read() }
    }

    /// # Safety
    /// Chunk must be free with payload >= `FREE_LINK_SIZE`.
    #[inline]
    pub unsafe fn set_free_link(self, link: FreeLink) {
        // Safety: per contract.
        unsafe { self.data().cast::<FreeLink>().as_ptr().write(link) }
    }

    /// # Safety
    /// Chunk must be free with payload >= `FREE_LINK_SIZE`.
    #[inline]
    pub unsafe fn set_free_prev(self, prev: Option<Chunk>) {
        // Safety: per contract.
        unsafe { (*self.data().cast::<FreeLink>().as_ptr()).prev = prev }
    }

    /// # Safety
    /// Chunk must be free with payload >= `FREE_LINK_SIZE`.
    #[inline]
    pub unsafe fn set_free_next(self, next: Option<Chunk>) {
        // Safety: per contract.
        unsafe { (*self.data().cast::<FreeLink>().as_ptr()).next = next }
    }
}
