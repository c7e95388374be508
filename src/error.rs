//! Error types for framelink

use std::io;
use thiserror::Error;

/// Result type for framelink operations
pub type Result<T> = std::result::Result<T, FramelinkError>;

/// Errors that can occur in framelink operations
#[derive(Debug, Error)]
pub enum FramelinkError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Invalid region magic number
    #[error("Invalid region magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Region was created by an incompatible version
    #[error("Unsupported region version: expected 0x{expected:08X}, got 0x{got:08X}")]
    UnsupportedVersion { expected: u32, got: u32 },

    /// Payload exceeds the region's declared capacity
    #[error("Payload too large: max {max} bytes, got {got} bytes")]
    PayloadTooLarge { max: usize, got: usize },

    /// Caller-provided buffer is smaller than the frame to copy out
    #[error("Destination buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall { need: usize, got: usize },

    /// All reader entries in the control-channel directory are claimed
    #[error("Reader directory is full")]
    DirectoryFull,

    /// A zero-copy lease is still held on this reader
    #[error("Zero-copy lease already held; release it first")]
    LeaseHeld,

    /// Per-slot capacity does not match the channel's declared capacity
    #[error("Slot capacity mismatch: channel declares {expected}, got {got}")]
    CapacityMismatch { expected: usize, got: usize },

    /// Region name too long
    #[error("Region name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },
}
