//! Video Device Handle.
//!
//! Typed wrapper around a single opened V4L2 stateful M2M decoder character
//! device. All operations are synchronous request/reply round-trips except
//! `dequeue_buffer` (which reports "would-block" as `Ok(None)`, not an
//! error) and `poll` (which reports readiness, not completion).
//!
//! Naming note: V4L2 calls the bitstream-in queue `OUTPUT` and the
//! decoded-frames-out queue `CAPTURE`, which reads backwards against this
//! crate's "decoder input"/"decoder output" vocabulary. `Queue` below uses
//! the decoder's vocabulary; the V4L2 buffer-type constants are an
//! implementation detail confined to this module.

mod sys;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::{debug, warn};
use log_once::warn_once;

use crate::error::{PlayerError, Result};

/// Which V4L2 queue an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Compressed bitstream goes in here (V4L2 `OUTPUT_MPLANE`).
    Input,
    /// Decoded frames come out here (V4L2 `CAPTURE_MPLANE`).
    Output,
}

impl Queue {
    fn buf_type(self) -> u32 {
        match self {
            Queue::Input => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            Queue::Output => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

/// Negotiated per-queue geometry, returned by `configure_decoder_formats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub plane_size: usize,
}

/// One dequeued buffer's metadata. `index` is always populated on a
/// successful dequeue.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedBuffer {
    pub index: usize,
    pub bytes_used: usize,
    pub is_last: bool,
    pub has_error: bool,
}

/// Result of the last `poll()` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollResult {
    revents: i16,
}

impl PollResult {
    pub fn has_event(&self) -> bool {
        self.revents & libc::POLLPRI != 0
    }
    pub fn has_error(&self) -> bool {
        self.revents & (libc::POLLERR | libc::POLLHUP) != 0
    }
    pub fn is_ready_for_read(&self) -> bool {
        self.revents & libc::POLLIN != 0
    }
    pub fn is_ready_for_write(&self) -> bool {
        self.revents & libc::POLLOUT != 0
    }
}

/// Events a caller can wait on in `poll`. Hand-rolled rather than pulling in
/// the `bitflags` crate for three constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvents(i16);

impl PollEvents {
    pub const READABLE: PollEvents = PollEvents(libc::POLLIN);
    pub const WRITABLE: PollEvents = PollEvents(libc::POLLOUT);
    pub const PRIORITY: PollEvents = PollEvents(libc::POLLPRI);

    pub fn bits(self) -> i16 {
        self.0
    }
}

impl std::ops::BitOr for PollEvents {
    type Output = PollEvents;
    fn bitor(self, rhs: PollEvents) -> PollEvents {
        PollEvents(self.0 | rhs.0)
    }
}

/// Events M2M decoders raise asynchronously on the output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    SourceChange,
    EndOfStream,
    Other(u32),
}

pub struct Device {
    fd: OwnedFd,
    path: String,
    last_poll: PollResult,
}

impl Device {
    /// Opens `path` and verifies it is a multi-planar M2M decoder that
    /// accepts shared-buffer (DMABUF) memory on the input queue. Subscribes
    /// to source-change and end-of-stream events (warnings-only on
    /// failure).
    pub fn initialize_for_decoding(path: &str) -> Result<Self> {
        let cpath = std::ffi::CString::new(path)
            .map_err(|e| PlayerError::ConfigInvalid(format!("device path {path:?}: {e}")))?;
        let raw_fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if raw_fd < 0 {
            return Err(PlayerError::DeviceUnavailable(format!(
                "open {path}: {}",
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let mut dev = Device {
            fd,
            path: path.to_string(),
            last_poll: PollResult::default(),
        };

        let cap = dev.query_capability()?;
        let caps = if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        if caps & sys::V4L2_CAP_VIDEO_M2M_MPLANE == 0 {
            return Err(PlayerError::DeviceUnavailable(format!(
                "{path} does not advertise multi-planar M2M video capability"
            )));
        }
        if caps & sys::V4L2_CAP_STREAMING == 0 {
            return Err(PlayerError::DeviceUnavailable(format!(
                "{path} does not support streaming I/O"
            )));
        }

        dev.verify_dmabuf_support(Queue::Input)?;

        if let Err(e) = dev.subscribe_event(sys::V4L2_EVENT_SOURCE_CHANGE) {
            warn!("failed to subscribe to source-change events on {path}: {e}");
        }
        if let Err(e) = dev.subscribe_event(sys::V4L2_EVENT_EOS) {
            warn!("failed to subscribe to end-of-stream events on {path}: {e}");
        }

        Ok(dev)
    }

    fn query_capability(&self) -> Result<sys::Capability> {
        let mut cap = sys::Capability::default();
        unsafe { sys::querycap(self.fd.as_raw_fd(), &mut cap) }
            .map_err(|e| PlayerError::DeviceUnavailable(format!("VIDIOC_QUERYCAP: {e}")))?;
        Ok(cap)
    }

    /// Probes whether the input queue accepts DMABUF memory by requesting
    /// (and immediately releasing) zero buffers of that memory type — the
    /// standard V4L2 idiom for a capability probe that doesn't allocate
    /// anything.
    fn verify_dmabuf_support(&self, queue: Queue) -> Result<()> {
        let mut rb = sys::RequestBuffers {
            count: 0,
            type_: queue.buf_type(),
            memory: sys::V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        unsafe { sys::reqbufs(self.fd.as_raw_fd(), &mut rb) }.map_err(|e| {
            PlayerError::DeviceUnavailable(format!(
                "{} does not accept DMABUF memory on the {:?} queue: {e}",
                self.path, queue
            ))
        })?;
        Ok(())
    }

    fn subscribe_event(&self, event_type: u32) -> Result<()> {
        let mut sub = sys::EventSubscription {
            type_: event_type,
            id: 0,
            flags: sys::V4L2_EVENT_SUB_FL_SEND_INITIAL,
            reserved: [0; 5],
        };
        unsafe { sys::subscribe_event(self.fd.as_raw_fd(), &mut sub) }
            .map_err(|e| PlayerError::Other(anyhow::anyhow!("VIDIOC_SUBSCRIBE_EVENT: {e}")))?;
        Ok(())
    }

    /// Sets the input queue to `{w, h, input_codec, 1 plane, >=2MiB plane}`
    /// and the output queue to `{w, h, output_pixel_format, 1 plane}`.
    /// Attempts to reduce the capture-side minimum buffer count to 1
    /// (best-effort latency reduction — failure is logged, not fatal).
    pub fn configure_decoder_formats(
        &mut self,
        width: u32,
        height: u32,
        input_fourcc: u32,
        output_fourcc: u32,
    ) -> Result<(NegotiatedFormat, NegotiatedFormat)> {
        if width == 0 || height == 0 {
            return Err(PlayerError::ConfigInvalid(
                "width and height must be non-zero".to_string(),
            ));
        }

        let mut in_fmt = sys::Format {
            type_: Queue::Input.buf_type(),
            ..Default::default()
        };
        in_fmt.fmt.pix_mp.width = width;
        in_fmt.fmt.pix_mp.height = height;
        in_fmt.fmt.pix_mp.pixelformat = input_fourcc;
        in_fmt.fmt.pix_mp.num_planes = 1;
        in_fmt.fmt.pix_mp.plane_fmt[0].sizeimage = 2 * 1024 * 1024;

        unsafe { sys::s_fmt(self.fd.as_raw_fd(), &mut in_fmt) }
            .map_err(|e| PlayerError::ConfigInvalid(format!("VIDIOC_S_FMT(input): {e}")))?;

        let negotiated_input = unsafe {
            NegotiatedFormat {
                width: in_fmt.fmt.pix_mp.width,
                height: in_fmt.fmt.pix_mp.height,
                plane_size: in_fmt.fmt.pix_mp.plane_fmt[0].sizeimage as usize,
            }
        };

        let mut out_fmt = sys::Format {
            type_: Queue::Output.buf_type(),
            ..Default::default()
        };
        out_fmt.fmt.pix_mp.width = width;
        out_fmt.fmt.pix_mp.height = height;
        out_fmt.fmt.pix_mp.pixelformat = output_fourcc;
        out_fmt.fmt.pix_mp.num_planes = 1;

        unsafe { sys::s_fmt(self.fd.as_raw_fd(), &mut out_fmt) }
            .map_err(|e| PlayerError::ConfigInvalid(format!("VIDIOC_S_FMT(output): {e}")))?;

        let negotiated_output = unsafe {
            NegotiatedFormat {
                width: out_fmt.fmt.pix_mp.width,
                height: out_fmt.fmt.pix_mp.height,
                plane_size: out_fmt.fmt.pix_mp.plane_fmt[0].sizeimage as usize,
            }
        };

        self.try_reduce_capture_min_buffers();

        Ok((negotiated_input, negotiated_output))
    }

    fn try_reduce_capture_min_buffers(&self) {
        // There is no dedicated ioctl for this on most stateful decoders
        // beyond re-issuing S_FMT/REQBUFS with a smaller count; drivers that
        // care export it through G_CTRL(V4L2_CID_MIN_BUFFERS_FOR_CAPTURE),
        // which is out of scope for the minimal ioctl surface bound here.
        // Left as a best-effort no-op hook: reducing this count saves
        // latency but is not required for correct decoding.
        debug!("capture-side minimum buffer count reduction is best-effort and currently a no-op");
    }

    pub fn request_buffers(&mut self, queue: Queue, count: u32) -> Result<u32> {
        let mut rb = sys::RequestBuffers {
            count,
            type_: queue.buf_type(),
            memory: sys::V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        unsafe { sys::reqbufs(self.fd.as_raw_fd(), &mut rb) }
            .map_err(|e| PlayerError::DeviceUnavailable(format!("VIDIOC_REQBUFS: {e}")))?;
        Ok(rb.count)
    }

    /// Enqueues a single-plane DMABUF buffer.
    pub fn queue_buffer(
        &mut self,
        queue: Queue,
        index: usize,
        fd: RawFd,
        bytes_used: usize,
        length: usize,
        last_of_stream: bool,
    ) -> Result<()> {
        let mut plane = sys::Plane {
            bytesused: bytes_used as u32,
            length: length as u32,
            ..Default::default()
        };
        plane.m.fd = fd;

        let mut planes = [plane];
        let mut buf = sys::Buffer {
            index: index as u32,
            type_: queue.buf_type(),
            memory: sys::V4L2_MEMORY_DMABUF,
            m_planes: planes.as_mut_ptr(),
            length: 1,
            flags: if last_of_stream {
                sys::V4L2_BUF_FLAG_LAST
            } else {
                0
            },
            ..Default::default()
        };

        unsafe { sys::qbuf(self.fd.as_raw_fd(), &mut buf) }.map_err(|e| {
            PlayerError::Other(anyhow::anyhow!(
                "VIDIOC_QBUF({:?}, index={}): {e}",
                queue,
                index
            ))
        })?;
        Ok(())
    }

    /// Non-blocking dequeue. `Ok(None)` means would-block (nothing ready
    /// yet), never a hard failure.
    pub fn dequeue_buffer(&mut self, queue: Queue) -> Result<Option<DequeuedBuffer>> {
        let mut plane = sys::Plane::default();
        let mut planes = [plane; 1];
        let mut buf = sys::Buffer {
            type_: queue.buf_type(),
            memory: sys::V4L2_MEMORY_DMABUF,
            m_planes: planes.as_mut_ptr(),
            length: 1,
            ..Default::default()
        };

        match unsafe { sys::dqbuf(self.fd.as_raw_fd(), &mut buf) } {
            Ok(_) => {
                plane = planes[0];
                Ok(Some(DequeuedBuffer {
                    index: buf.index as usize,
                    bytes_used: plane.bytesused as usize,
                    is_last: buf.flags & sys::V4L2_BUF_FLAG_LAST != 0,
                    has_error: buf.flags & sys::V4L2_BUF_FLAG_ERROR != 0,
                }))
            }
            Err(nix::errno::Errno::EAGAIN) => Ok(None),
            Err(e) => Err(PlayerError::Other(anyhow::anyhow!(
                "VIDIOC_DQBUF({:?}): {e}",
                queue
            ))),
        }
    }

    pub fn stream_on(&mut self, queue: Queue) -> Result<()> {
        let buf_type = queue.buf_type();
        unsafe { sys::streamon(self.fd.as_raw_fd(), &buf_type) }
            .map_err(|e| PlayerError::Other(anyhow::anyhow!("VIDIOC_STREAMON({:?}): {e}", queue)))?;
        Ok(())
    }

    pub fn stream_off(&mut self, queue: Queue) -> Result<()> {
        let buf_type = queue.buf_type();
        unsafe { sys::streamoff(self.fd.as_raw_fd(), &buf_type) }
            .map_err(|e| PlayerError::Other(anyhow::anyhow!("VIDIOC_STREAMOFF({:?}): {e}", queue)))?;
        Ok(())
    }

    /// Polls for readiness. `timeout_ms == 0` is a non-blocking probe.
    pub fn poll(&mut self, events: PollEvents, timeout_ms: i32) -> Result<PollResult> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: events.bits() | libc::POLLPRI,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(PlayerError::Io(io::Error::last_os_error()));
        }
        self.last_poll = PollResult {
            revents: pfd.revents,
        };
        Ok(self.last_poll)
    }

    pub fn last_poll_result(&self) -> PollResult {
        self.last_poll
    }

    /// Drains and classifies one pending V4L2 event. Call when `poll`
    /// reports `has_event()`.
    pub fn dequeue_event(&mut self) -> Result<DeviceEvent> {
        let mut ev = sys::Event::default();
        unsafe { sys::dqevent(self.fd.as_raw_fd(), &mut ev) }
            .map_err(|e| PlayerError::Other(anyhow::anyhow!("VIDIOC_DQEVENT: {e}")))?;
        Ok(match ev.type_ {
            sys::V4L2_EVENT_SOURCE_CHANGE => DeviceEvent::SourceChange,
            sys::V4L2_EVENT_EOS => DeviceEvent::EndOfStream,
            other => {
                warn_once!("unhandled V4L2 event type {other}");
                DeviceEvent::Other(other)
            }
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl AsRawFd for Device {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
