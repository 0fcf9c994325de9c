//! Streaming Controller.
//!
//! A small state machine sequencing stream-on/off across the decoder's two
//! queues. `start`/`stop` enforce the required ordering: the output queue
//! (the decoder's scratch area for writing decoded frames) must be fully
//! pre-queued before either queue goes live.

use std::thread;
use std::time::Duration;

use log::warn;

use crate::buffer_pool::BufferPool;
use crate::error::Result;
use crate::v4l2::{Device, Queue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Starting,
    Active,
    Stopping,
    Error,
}

pub struct StreamingController {
    state: StreamState,
}

impl Default for StreamingController {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingController {
    pub fn new() -> Self {
        StreamingController {
            state: StreamState::Stopped,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == StreamState::Active
    }

    /// Pre-queues every output-pool slot, then streams on input then output.
    /// Idempotent in `Active`. Rolls back input stream-on if output
    /// stream-on fails.
    pub fn start(&mut self, device: &mut Device, output_pool: &mut BufferPool) -> Result<()> {
        if self.state == StreamState::Active {
            return Ok(());
        }
        self.state = StreamState::Starting;

        for index in 0..output_pool.count() {
            let size = output_pool.get_slot_size(index)?;
            let fd = output_pool
                .slot(index)
                .map(|b| b.fd())
                .unwrap_or(-1);
            if let Err(e) = device.queue_buffer(Queue::Output, index, fd, 0, size, false) {
                self.state = StreamState::Error;
                return Err(e);
            }
            output_pool.mark_in_use(index);
        }

        if let Err(e) = device.stream_on(Queue::Input) {
            self.state = StreamState::Error;
            return Err(e);
        }

        if let Err(e) = device.stream_on(Queue::Output) {
            if let Err(rollback_err) = device.stream_off(Queue::Input) {
                warn!("rollback stream-off(input) after failed start also failed: {rollback_err}");
            }
            self.state = StreamState::Error;
            return Err(e);
        }

        self.state = StreamState::Active;
        Ok(())
    }

    /// Best-effort teardown: stream-off errors are logged, never propagated.
    pub fn stop(&mut self, device: &mut Device) {
        self.state = StreamState::Stopping;
        if let Err(e) = device.stream_off(Queue::Output) {
            warn!("stream-off(output) failed during stop: {e}");
        }
        if let Err(e) = device.stream_off(Queue::Input) {
            warn!("stream-off(input) failed during stop: {e}");
        }
        thread::sleep(Duration::from_millis(10));
        self.state = StreamState::Stopped;
    }

    /// Forces the state to `Stopped` without touching the device, used when
    /// recovering from an error condition where the device itself will be
    /// fully reset.
    pub fn force_stopped(&mut self) {
        self.state = StreamState::Stopped;
    }

    pub fn mark_error(&mut self) {
        self.state = StreamState::Error;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_controller_starts_stopped() {
        let c = StreamingController::new();
        assert_eq!(c.state(), StreamState::Stopped);
        assert!(!c.is_active());
    }

    #[test]
    fn force_stopped_overrides_any_state() {
        let mut c = StreamingController::new();
        c.mark_error();
        assert_eq!(c.state(), StreamState::Error);
        c.force_stopped();
        assert_eq!(c.state(), StreamState::Stopped);
    }
}
