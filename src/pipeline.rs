//! Decode Pipeline.
//!
//! Orchestrates the allocator, device, pools, streaming controller, display,
//! and presenter into one normal-decode-step procedure, plus
//! flush/reset/teardown. Every method here runs on the single decoder
//! thread owned by the playback loop — nothing in this module is
//! `Send`-safe across concurrent callers and none of it needs to be.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::buffer_pool::BufferPool;
use crate::display::DisplayController;
use crate::dma_heap::DmaHeapAllocator;
use crate::error::{PlayerError, Result};
use crate::presenter::{FramePresenter, PresentContext};
use crate::streaming::StreamingController;
use crate::v4l2::{Device, DeviceEvent, PollEvents, Queue};

const DEFAULT_INPUT_BUFFER_COUNT: usize = 6;
const DEFAULT_OUTPUT_BUFFER_COUNT: usize = 4;
const DEFAULT_INPUT_PLANE_SIZE: usize = 2 * 1024 * 1024;
const INPUT_FOURCC_H264: u32 = u32::from_le_bytes(*b"H264");
const OUTPUT_FOURCC_YUV420: u32 = u32::from_le_bytes(*b"YU12");

const SELECT_INPUT_POLL_TIMEOUT_MS: i32 = 20;
const FLUSH_POLL_ITERATIONS: u32 = 20;
const FLUSH_POLL_TIMEOUT_MS: i32 = 50;
const RESET_SETTLE_MS_SHORT: u64 = 50;
const RESET_SETTLE_MS_LONG: u64 = 200;

pub struct PipelineConfig {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

struct PipelineState {
    decoder_ready: bool,
    needs_reset: bool,
    frame_width: u32,
    frame_height: u32,
}

pub struct DecodePipeline {
    config: PipelineConfig,
    allocator: DmaHeapAllocator,
    input_pool: BufferPool,
    output_pool: BufferPool,
    streaming: StreamingController,
    presenter: FramePresenter,
    // Field order is load-bearing: struct fields drop in declaration order,
    // and `display` holds imported handles rooted in `device`'s fds, so it
    // must drop first.
    display: DisplayController,
    device: Device,
    state: PipelineState,
}

impl DecodePipeline {
    /// Builds pools, the streaming controller, the device, the allocator,
    /// and the presenter; negotiates formats; sets up buffers.
    pub fn initialize(config: PipelineConfig) -> Result<Self> {
        let mut device = Device::initialize_for_decoding(&config.device_path)?;

        let (negotiated_input, negotiated_output) =
            device.configure_decoder_formats(config.width, config.height, INPUT_FOURCC_H264, OUTPUT_FOURCC_YUV420)?;

        let mut allocator = DmaHeapAllocator::new();
        allocator.initialize()?;

        let display = DisplayController::initialize()?;

        let input_pool = BufferPool::new(Queue::Input, DEFAULT_INPUT_BUFFER_COUNT);
        let output_pool = BufferPool::new(Queue::Output, DEFAULT_OUTPUT_BUFFER_COUNT);

        let presenter = FramePresenter::new(
            PresentContext {
                frame_width: negotiated_output.width,
                frame_height: negotiated_output.height,
            },
            DEFAULT_OUTPUT_BUFFER_COUNT,
        );

        let mut pipeline = DecodePipeline {
            config,
            device,
            allocator,
            input_pool,
            output_pool,
            streaming: StreamingController::new(),
            presenter,
            display,
            state: PipelineState {
                decoder_ready: false,
                needs_reset: false,
                frame_width: negotiated_output.width,
                frame_height: negotiated_output.height,
            },
        };

        let _ = negotiated_input; // informs setup_buffers' fallback sizing only
        pipeline.setup_buffers()?;
        Ok(pipeline)
    }

    /// Queries actual `sizeimage` for both queues (falling back to 2 MiB
    /// input / `w*h*3/2` output), allocates both pools, pre-paints the
    /// output pool with the liveness sentinel, and realizes both pools on
    /// the device in shared-memory mode.
    fn setup_buffers(&mut self) -> Result<()> {
        let input_size = DEFAULT_INPUT_PLANE_SIZE;
        let output_size = ((self.state.frame_width as usize) * (self.state.frame_height as usize) * 3) / 2;

        self.input_pool.allocate(&self.allocator, input_size)?;
        self.output_pool.allocate(&self.allocator, output_size)?;
        self.output_pool.pre_paint_420(self.state.frame_width, self.state.frame_height);

        self.input_pool.request_on_device(&mut self.device)?;
        self.output_pool.request_on_device(&mut self.device)?;
        Ok(())
    }

    /// Feeds one access unit through the full ordered decode procedure.
    pub fn decode_access_unit(&mut self, access_unit: &[u8]) -> Result<()> {
        if self.state.needs_reset {
            self.reset_buffers()?;
            self.streaming.start(&mut self.device, &mut self.output_pool)?;
            self.state.needs_reset = false;
        }

        self.state.decoder_ready = true;

        if !self.streaming.is_active() {
            self.streaming.start(&mut self.device, &mut self.output_pool)?;
        }

        self.drain_input_completions();

        let index = self.select_input_slot()?;

        let fd = self.input_pool.slot(index).map(|b| b.fd()).unwrap_or(-1);
        if let Some(slot) = self.input_pool.slot(index) {
            slot.sync(crate::dma_heap::SyncDirection::Start);
        }

        let slot_size = self.input_pool.get_slot_size(index)?;
        let chunk_size = access_unit.len().min(slot_size);
        if chunk_size == 0 {
            return Err(PlayerError::ConfigInvalid(
                "access unit produced a zero-length chunk".to_string(),
            ));
        }
        if let Some(slot) = self.input_pool.slot_mut(index) {
            slot.as_mut_slice()[..chunk_size].copy_from_slice(&access_unit[..chunk_size]);
        }

        if let Some(slot) = self.input_pool.slot(index) {
            slot.sync(crate::dma_heap::SyncDirection::End);
        }

        self.device
            .queue_buffer(Queue::Input, index, fd, chunk_size, slot_size, false)?;
        self.input_pool.mark_in_use(index);

        self.drain_output_completions()?;
        Ok(())
    }

    fn drain_input_completions(&mut self) {
        while let Ok(Some(buf)) = self.device.dequeue_buffer(Queue::Input) {
            self.input_pool.mark_free(buf.index);
        }
    }

    fn select_input_slot(&mut self) -> Result<usize> {
        if let Some(index) = self.input_pool.get_free_buffer_index() {
            return Ok(index);
        }

        let poll = self
            .device
            .poll(PollEvents::WRITABLE, SELECT_INPUT_POLL_TIMEOUT_MS)?;
        if poll.is_ready_for_write() {
            if let Ok(Some(buf)) = self.device.dequeue_buffer(Queue::Input) {
                self.input_pool.mark_free(buf.index);
            }
        }

        self.input_pool
            .get_free_buffer_index()
            .ok_or(PlayerError::NoFreeInputSlot)
    }

    /// Drains output completions until nothing is immediately available.
    fn drain_output_completions(&mut self) -> Result<()> {
        loop {
            let poll = self.device.poll(PollEvents::READABLE, 0)?;

            if poll.has_event() {
                self.handle_async_notification()?;
                continue;
            }
            if poll.has_error() {
                self.state.needs_reset = true;
                return Err(PlayerError::DeviceError);
            }
            if !poll.is_ready_for_read() {
                return Ok(());
            }

            let Some(buf) = self.device.dequeue_buffer(Queue::Output)? else {
                return Ok(());
            };

            let (fd, slot_size) = match self.output_pool.slot(buf.index) {
                Some(slot) => (slot.fd(), slot.size()),
                None => continue,
            };

            self.presenter.present_dequeued(
                &self.output_pool,
                buf.index,
                buf.bytes_used,
                buf.has_error,
                &mut self.display,
            );

            self.device
                .queue_buffer(Queue::Output, buf.index, fd, 0, slot_size, false)?;
            self.output_pool.mark_in_use(buf.index);
        }
    }

    fn handle_async_notification(&mut self) -> Result<()> {
        match self.device.dequeue_event()? {
            DeviceEvent::SourceChange => {
                // Deliberately does not trigger a reset on resolution
                // change; logged only.
                info!("source-change event received; continuing without reset");
            }
            DeviceEvent::EndOfStream => {
                debug!("end-of-stream event received");
            }
            DeviceEvent::Other(code) => {
                debug!("advisory device event {code}");
            }
        }
        Ok(())
    }

    /// Emits one zero-byte last-of-stream input enqueue, then drains output
    /// for up to `FLUSH_POLL_ITERATIONS` rounds, resetting the attempt
    /// counter whenever a frame is produced. Never leaves `Active`.
    pub fn flush(&mut self) -> Result<()> {
        if let Ok(index) = self.select_input_slot() {
            if let Some(slot) = self.input_pool.slot(index) {
                let fd = slot.fd();
                let size = slot.size();
                self.device.queue_buffer(Queue::Input, index, fd, 0, size, true)?;
                self.input_pool.mark_in_use(index);
            }
        }

        let mut attempts = 0u32;
        while attempts < FLUSH_POLL_ITERATIONS {
            let poll = self.device.poll(PollEvents::READABLE, FLUSH_POLL_TIMEOUT_MS)?;
            if poll.has_error() {
                self.state.needs_reset = true;
                return Err(PlayerError::DeviceError);
            }
            if poll.has_event() {
                self.handle_async_notification()?;
                continue;
            }
            if !poll.is_ready_for_read() {
                attempts += 1;
                continue;
            }

            let Some(buf) = self.device.dequeue_buffer(Queue::Output)? else {
                attempts += 1;
                continue;
            };

            let (fd, slot_size) = match self.output_pool.slot(buf.index) {
                Some(slot) => (slot.fd(), slot.size()),
                None => {
                    attempts += 1;
                    continue;
                }
            };
            self.presenter.present_dequeued(
                &self.output_pool,
                buf.index,
                buf.bytes_used,
                buf.has_error,
                &mut self.display,
            );
            self.device
                .queue_buffer(Queue::Output, buf.index, fd, 0, slot_size, false)?;
            self.output_pool.mark_in_use(buf.index);
            attempts = 0;
        }
        Ok(())
    }

    /// Recovers from a fatal device error (or honors a resolution change):
    /// stop streaming, release and deallocate both pools with settle
    /// sleeps bracketing the deallocation, clear zero-copy state and every
    /// cached framebuffer, re-run `setup_buffers`.
    pub fn reset_buffers(&mut self) -> Result<()> {
        if self.streaming.is_active() {
            self.streaming.stop(&mut self.device);
        }
        self.streaming.force_stopped();

        self.input_pool.release_on_device(&mut self.device);
        self.output_pool.release_on_device(&mut self.device);
        thread::sleep(Duration::from_millis(RESET_SETTLE_MS_SHORT));

        self.input_pool.deallocate(&self.allocator);
        self.output_pool.deallocate(&self.allocator);
        self.presenter.clear_zero_copy_state();
        // The freed dma-buf fds will likely be recycled by the next
        // allocation; without this, a cached framebuffer keyed on the old
        // fd number would be handed back for a brand new buffer.
        self.display.teardown();

        thread::sleep(Duration::from_millis(RESET_SETTLE_MS_LONG));

        self.setup_buffers()
    }

    pub fn decoded_frame_count(&self) -> u64 {
        self.presenter.decoded_frame_count()
    }

    pub fn needs_reset(&self) -> bool {
        self.state.needs_reset
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.streaming.stop(&mut self.device);
        self.input_pool.release_on_device(&mut self.device);
        self.output_pool.release_on_device(&mut self.device);
        self.input_pool.deallocate(&self.allocator);
        self.output_pool.deallocate(&self.allocator);
        // self.display drops here, before self.device — the display owns
        // imported handles rooted in the decoder's fds.
        let _ = &self.config;
        warn!("decode pipeline torn down for device {}", self.device.path());
    }
}
