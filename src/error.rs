//! Error taxonomy for the decode-and-present pipeline.
//!
//! Every fallible operation in `dma_heap`, `v4l2`, `buffer_pool`, `streaming`,
//! `display`, `presenter`, and `pipeline` returns `Result<_, PlayerError>`.
//! Glue code (CLI wiring, the receiver) uses `anyhow::Result` the way the
//! rest of the ambient stack does; `PlayerError::Other` is the escape hatch
//! back into that world.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("no DMA heap could be opened")]
    AllocatorUnavailable,

    #[error("DMA buffer allocation of {size} bytes failed: {reason}")]
    AllocFailed { size: u64, reason: String },

    #[error("CPU mapping of buffer fd={fd} failed: {reason}")]
    MapFailed { fd: i32, reason: String },

    #[error("no free input slot available after waiting")]
    NoFreeInputSlot,

    #[error("device reported a poll error, reset required")]
    DeviceError,

    #[error("decoder rejected buffer index {index}")]
    DecoderRejected { index: usize },

    #[error("output buffer index {index} has only {bytes_used} bytes, expected at least {expected}")]
    BufferTooSmall {
        index: usize,
        bytes_used: usize,
        expected: usize,
    },

    #[error("output buffer index {index} appears untouched (still carries the pre-paint sentinel)")]
    BufferUntouched { index: usize },

    #[error("failed to import fd={fd} into the display as a framebuffer: {reason}")]
    DisplayImportFailed { fd: i32, reason: String },

    #[error("failed to present framebuffer: {reason}")]
    DisplayPresentFailed { reason: String },

    /// Not a real failure — callers must not log this as an error. Dequeue
    /// surfaces "nothing ready yet" as `Ok(None)`, not this variant; it
    /// exists so other layers (poll probes) have a named condition to match
    /// on without reaching for a raw errno.
    #[error("operation would block")]
    WouldBlock,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlayerError {
    /// True for conditions the caller should log and continue past,
    /// rather than abort the pipeline over.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            PlayerError::ConfigInvalid(_)
                | PlayerError::DeviceUnavailable(_)
                | PlayerError::AllocatorUnavailable
        )
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
