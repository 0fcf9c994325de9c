//! FFI definitions compatible with `linux/videodev2.h`, restricted to the
//! multi-planar M2M subset this crate actually drives.
//!
//! These types do not provide a "Rusty" API and must not be exposed outside
//! of the `v4l2` module — `Device` in `v4l2::mod` is the safe wrapper.

#![allow(bad_style)]

use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

pub const VIDEO_MAX_PLANES: usize = 8;

// ---- v4l2_buf_type ----
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;

// ---- v4l2_memory ----
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

// ---- v4l2_capability.capabilities / device_caps ----
pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

// ---- v4l2_buffer.flags ----
pub const V4L2_BUF_FLAG_LAST: u32 = 0x0010_0000;
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;

// ---- v4l2_event.type ----
pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;
pub const V4L2_EVENT_ALL: u32 = 0;

// ---- v4l2_event_subscription.flags ----
pub const V4L2_EVENT_SUB_FL_SEND_INITIAL: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanePixFormat {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [PlanePixFormat; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

impl Default for PixFormatMplane {
    fn default() -> Self {
        // zeroed() is sound: every field is a plain integer/array of them.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union FormatUnion {
    pub pix_mp: PixFormatMplane,
    pub raw_data: [u8; 200],
}

impl std::fmt::Debug for FormatUnion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FormatUnion(..)")
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Format {
    pub type_: u32,
    pub fmt: FormatUnion,
}

impl Default for Format {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub reserved: [u32; 1],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union PlaneMemoryUnion {
    pub mem_offset: u32,
    pub userptr: u64,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: PlaneMemoryUnion,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

impl Default for Plane {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl std::fmt::Debug for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plane")
            .field("bytesused", &self.bytesused)
            .field("length", &self.length)
            .finish()
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Timeval {
    pub tv_sec: i64,
    pub tv_usec: i64,
}

impl Default for Timeval {
    fn default() -> Self {
        Timeval {
            tv_sec: 0,
            tv_usec: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

/// `v4l2_buffer` with the `length`/`m.planes` fields used in MPLANE mode:
/// `m.planes` points at a caller-owned array of `length` `Plane`s.
#[repr(C)]
pub struct Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: Timeval,
    pub timecode: Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m_planes: *mut Plane,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl Default for Buffer {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EventSourceChange {
    pub changes: u32,
    pub reserved: [u32; 7],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union EventUnion {
    pub src_change: EventSourceChange,
    pub raw_data: [u8; 64],
}

impl Default for EventUnion {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl std::fmt::Debug for EventUnion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventUnion(..)")
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Event {
    pub type_: u32,
    pub u: EventUnion,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: Timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EventSubscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

ioctl_read!(querycap, b'V', 0, Capability);
ioctl_readwrite!(s_fmt, b'V', 5, Format);
ioctl_readwrite!(g_fmt, b'V', 4, Format);
ioctl_readwrite!(reqbufs, b'V', 8, RequestBuffers);
ioctl_readwrite!(qbuf, b'V', 15, Buffer);
ioctl_readwrite!(dqbuf, b'V', 17, Buffer);
ioctl_write_ptr!(streamon, b'V', 18, u32);
ioctl_write_ptr!(streamoff, b'V', 19, u32);
ioctl_write_ptr!(subscribe_event, b'V', 90, EventSubscription);
ioctl_write_ptr!(unsubscribe_event, b'V', 91, EventSubscription);
ioctl_read!(dqevent, b'V', 89, Event);
