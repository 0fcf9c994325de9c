//! Frame Presenter.
//!
//! Validates and forwards one dequeued output buffer per call. Holds a
//! read-only context (frame dimensions) and two non-owning mutable outboxes
//! — a zero-copy importer and a present sink — rather than raw references
//! into the pipeline's fields, since both outboxes would otherwise alias
//! the same display controller.

use log::{debug, warn};

use crate::buffer_pool::BufferPool;
use crate::error::{PlayerError, Result};

/// Bytes sampled per content-liveness probe, at this stride, within the
/// leading `LIVENESS_SCAN_BYTES` of the buffer.
const LIVENESS_SCAN_BYTES: usize = 1024;
const LIVENESS_STRIDE: usize = 64;
const SENTINEL_LUMA: u8 = 16;
const SENTINEL_CHROMA: u8 = 128;

/// The bridge to the display controller's `setup_zero_copy_buffer`, called
/// once per slot on first presentation.
pub trait ZeroCopyImporter {
    fn import(&mut self, slot_index: usize, fd: i32, width: u32, height: u32) -> Result<()>;
}

/// The bridge to the display controller's `display_frame`.
pub trait PresentSink {
    fn present(&mut self, fd: i32, width: u32, height: u32) -> Result<()>;
}

/// A single non-owning view combining both outboxes, so a caller can hand
/// the presenter one mutable borrow of its display controller instead of
/// two aliasing ones.
pub trait DisplayTarget: ZeroCopyImporter + PresentSink {}
impl<T: ZeroCopyImporter + PresentSink> DisplayTarget for T {}

#[derive(Debug, Clone, Copy)]
pub struct PresentContext {
    pub frame_width: u32,
    pub frame_height: u32,
}

pub struct FramePresenter {
    context: PresentContext,
    zero_copy_initialized: Vec<bool>,
    decoded_frame_count: u64,
}

impl FramePresenter {
    pub fn new(context: PresentContext, slot_count: usize) -> Self {
        FramePresenter {
            context,
            zero_copy_initialized: vec![false; slot_count],
            decoded_frame_count: 0,
        }
    }

    pub fn decoded_frame_count(&self) -> u64 {
        self.decoded_frame_count
    }

    /// Clears the zero-copy-initialized set, e.g. after a full pipeline
    /// reset where every cached framebuffer became stale.
    pub fn clear_zero_copy_state(&mut self) {
        self.zero_copy_initialized.iter_mut().for_each(|v| *v = false);
    }

    /// Processes one dequeued output buffer. Increments the frame counter
    /// on entry, not on success — it tracks dequeue attempts, not
    /// successful flips. Returns `Ok(())` whether or not the frame was
    /// actually presented; rejections are logged, not propagated — a bad
    /// output buffer is recoverable, not fatal to the pipeline.
    pub fn present_dequeued(
        &mut self,
        pool: &BufferPool,
        index: usize,
        bytes_used: usize,
        has_driver_error: bool,
        target: &mut dyn DisplayTarget,
    ) {
        self.decoded_frame_count += 1;

        if let Err(e) = self.validate(pool, index, bytes_used, has_driver_error) {
            debug!("rejecting output buffer index {index}: {e}");
            return;
        }

        let fd = pool.slot(index).map(|b| b.fd()).unwrap_or(-1);
        let w = self.context.frame_width;
        let h = self.context.frame_height;

        if !self.zero_copy_initialized.get(index).copied().unwrap_or(false) {
            if let Err(e) = target.import(index, fd, w, h) {
                warn!("zero-copy import failed for slot {index}: {e}");
                return;
            }
            if let Some(flag) = self.zero_copy_initialized.get_mut(index) {
                *flag = true;
            }
        }

        if let Err(e) = target.present(fd, w, h) {
            warn!("presenting slot {index} failed: {e}");
        }
    }

    fn validate(
        &self,
        pool: &BufferPool,
        index: usize,
        bytes_used: usize,
        has_driver_error: bool,
    ) -> Result<()> {
        if index >= pool.count() {
            return Err(PlayerError::DecoderRejected { index });
        }
        let slot = pool
            .slot(index)
            .ok_or(PlayerError::DecoderRejected { index })?;
        if slot.fd() < 0 || !slot.is_mapped() {
            return Err(PlayerError::DecoderRejected { index });
        }
        if has_driver_error {
            return Err(PlayerError::DecoderRejected { index });
        }

        let expected = ((self.context.frame_width as u64) * (self.context.frame_height as u64) * 3 / 2) / 2;
        if (bytes_used as u64) < expected {
            return Err(PlayerError::BufferTooSmall {
                index,
                bytes_used,
                expected: expected as usize,
            });
        }

        if self.looks_unwritten(slot.as_slice()) {
            return Err(PlayerError::BufferUntouched { index });
        }

        Ok(())
    }

    /// Scans up to the first 1 KiB at stride 64; rejects only if *every*
    /// sampled byte still equals the pre-paint sentinel.
    fn looks_unwritten(&self, data: &[u8]) -> bool {
        let luma_len = (self.context.frame_width as usize) * (self.context.frame_height as usize);
        let scan_len = data.len().min(LIVENESS_SCAN_BYTES);
        if scan_len == 0 {
            return true;
        }
        (0..scan_len).step_by(LIVENESS_STRIDE).all(|i| {
            let expected = if i < luma_len { SENTINEL_LUMA } else { SENTINEL_CHROMA };
            data[i] == expected
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeTarget {
        presents: usize,
    }
    impl ZeroCopyImporter for FakeTarget {
        fn import(&mut self, _slot_index: usize, _fd: i32, _width: u32, _height: u32) -> Result<()> {
            Ok(())
        }
    }
    impl PresentSink for FakeTarget {
        fn present(&mut self, _fd: i32, _width: u32, _height: u32) -> Result<()> {
            self.presents += 1;
            Ok(())
        }
    }

    fn context() -> PresentContext {
        PresentContext {
            frame_width: 16,
            frame_height: 16,
        }
    }

    #[test]
    fn frame_counter_increments_on_entry_even_for_rejected_buffer() {
        let mut presenter = FramePresenter::new(context(), 1);
        let pool = BufferPool::new(crate::v4l2::Queue::Output, 0);
        let mut target = FakeTarget { presents: 0 };

        presenter.present_dequeued(&pool, 0, 0, false, &mut target);
        assert_eq!(presenter.decoded_frame_count(), 1);
        assert_eq!(target.presents, 0);
    }

    #[test]
    fn all_sentinel_bytes_are_rejected_as_unwritten() {
        let presenter = FramePresenter::new(context(), 1);
        let mut data = vec![0u8; 1024];
        let luma_len = 16 * 16;
        data[..luma_len].fill(16);
        data[luma_len..].fill(128);
        assert!(presenter.looks_unwritten(&data));
    }

    #[test]
    fn a_single_non_sentinel_sample_marks_the_buffer_live() {
        let presenter = FramePresenter::new(context(), 1);
        let mut data = vec![16u8; 1024];
        data[64] = 200;
        assert!(!presenter.looks_unwritten(&data));
    }
}
