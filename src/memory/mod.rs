pub(crate) mod chunk;
pub(crate) mod pool;
pub(crate) mod stats;
pub(crate) mod sys;

#[cfg(debug_assertions)]
pub(crate) mod check;

// Serializes tests that assert on the global counters: ordinary tests take
// a read guard, counter-delta tests take a write guard.
#[cfg(test)]
pub static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
