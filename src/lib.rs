//! framelink - Shared-memory transports for latency-critical sensor frames
//!
//! This library provides single-writer/multi-reader transports for
//! publishing sensor payloads between cooperating processes on the same
//! host. The contract is *always-latest delivery*: a producer publishes at
//! its own rate and consumers observe the most recent frame with minimal
//! copy overhead; overrun silently discards unread frames instead of ever
//! blocking the producer.
//!
//! # Transports
//!
//! - [`double_buffer`] - a two-slot latest-value channel. One region holds a
//!   header plus two payload slots; an atomic front index selects the
//!   published slot. Two tiers: basic (portable) and cache-tuned (huge
//!   pages, page locking, prefetch, non-temporal stores).
//! - [`fanout`] - a per-reader ring-buffer transport. Readers register
//!   their own ring region through a small control channel; the writer
//!   discovers them and pushes every frame into every active ring,
//!   preserving a short per-reader history.
//!
//! # Performance
//!
//! All synchronization is release/acquire on lock-free atomics; no
//! transport operation sleeps, waits or allocates after initialization.
//! The producer pays one `memcpy` per publish, readers pay a pointer
//! return (zero-copy) or one `memcpy`.

pub mod double_buffer;
pub mod error;
pub mod fanout;
pub mod platform;
pub mod shm;

pub use double_buffer::{Frame, FrameInfo, Tier, TransportStats};
pub use error::{FramelinkError, Result};
pub use platform::TuningConfig;
