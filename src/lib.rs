//! Packet-modification test suites.
//!
//! A declarative configuration expands into a Cartesian product of
//! modification pipelines; each concrete pipeline pair becomes one test
//! that diverts the traffic of a user command through the transforms and
//! scores the command's exit status. The three load-bearing pieces are the
//! modification pipeline ([`mods`]), the test-plan expander ([`plan`]),
//! and the per-test runtime ([`runtime`]).

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod carrier;
pub mod config;
pub mod direction;
pub mod error;
pub mod inject;
pub mod mods;
pub mod netfilter;
#[cfg(target_os = "linux")]
pub mod nfqueue;
pub mod packet;
pub mod plan;
pub mod queue;
pub mod report;
pub mod runtime;
pub mod suite;
pub mod utils;

// Test helpers module - available when test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_helpers;

#[cfg(test)]
pub mod tests;

// Re-export commonly used items
pub use carrier::{PacketCarrier, PacketEntry};
pub use direction::Direction;
pub use error::{Error, Result};
pub use packet::{Layer, Packet};
pub use utils::now_ms;
