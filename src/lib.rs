#[cfg(not(target_pointer_width = "64"))]
compile_error!("blockpool supports only 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// pool + layout constants
pub use memory::chunk::{ALIGN, BLOCK_SIZE, MAX_ALLOC_SIZE};
pub use memory::pool::BlockPool;

// diagnostics
pub use memory::stats::{PoolStats, snapshot as pool_stats};

// errors
pub use memory::sys::SysError;
