//! Display Controller.
//!
//! Owns a `/dev/dri/card*` mode-setting device and imports decoder output
//! buffers directly as scan-out framebuffers (zero-copy). Built on the
//! `drm` crate's `drm::control::Device` trait, doing full legacy
//! mode-setting (connector/encoder/CRTC discovery, planar framebuffer
//! import, `set_crtc`) since this system owns the display exclusively.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::time::Instant;

use drm::buffer::DrmFourcc;
use drm::control::{connector, crtc, encoder, framebuffer, Device as ControlDevice, Mode};
use drm::Device as BasicDevice;
use log::{debug, info, warn};

use crate::error::{PlayerError, Result};

const CANDIDATE_CARD_PATHS: &[&str] = &[
    "/dev/dri/card0",
    "/dev/dri/card1",
    "/dev/dri/card2",
    "/dev/dri/card3",
];

const MAX_FRAME_DIMENSION: u32 = 8192;
const PREFERRED_WIDTH: u16 = 1920;
const PREFERRED_HEIGHT: u16 = 1080;

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// A ready-to-import set of plane handles/pitches/offsets for an 8-bit
/// 4:2:0 planar format, implementing `drm`'s `PlanarBuffer` contract.
struct Yuv420Planes {
    width: u32,
    height: u32,
    fourcc: DrmFourcc,
    handles: [Option<drm::buffer::Handle>; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
}

impl drm::buffer::Buffer for Yuv420Planes {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
    fn format(&self) -> DrmFourcc {
        self.fourcc
    }
    fn pitch(&self) -> u32 {
        self.pitches[0]
    }
    fn handle(&self) -> drm::buffer::Handle {
        self.handles[0].expect("luma plane handle always present")
    }
}

impl drm::buffer::PlanarBuffer for Yuv420Planes {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
    fn format(&self) -> DrmFourcc {
        self.fourcc
    }
    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }
    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        self.handles
    }
    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

struct CacheEntry {
    framebuffer: framebuffer::Handle,
    /// The driver-side buffer-object handle obtained from PRIME import.
    /// The display controller owns and must close this; it does NOT own
    /// the underlying fd — that belongs to the pool slot.
    bo_handle: drm::buffer::Handle,
}

/// One decoded frame ready for scan-out, as handed in by the presenter.
pub struct FrameDescriptor {
    pub fd: RawFd,
    pub width: u32,
    pub height: u32,
    pub is_dmabuf: bool,
}

pub struct DisplayController {
    card: Card,
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    fb_cache: HashMap<RawFd, CacheEntry>,
}

impl DisplayController {
    pub fn initialize() -> Result<Self> {
        let card = Self::open_first_card()?;
        let resources = card
            .resource_handles()
            .map_err(|e| PlayerError::DisplayImportFailed { fd: -1, reason: e.to_string() })?;

        let (connector_handle, mode) = Self::pick_connector_and_mode(&card, &resources)?;
        let connector_info = card
            .get_connector(connector_handle, false)
            .map_err(|e| PlayerError::DisplayImportFailed { fd: -1, reason: e.to_string() })?;

        let encoder_handle = Self::pick_encoder(&connector_info)?;
        let encoder_info = card
            .get_encoder(encoder_handle)
            .map_err(|e| PlayerError::DisplayImportFailed { fd: -1, reason: e.to_string() })?;

        let crtc_handle = Self::pick_crtc(&card, &resources, &encoder_info)?;

        info!(
            "display bound: connector={connector_handle:?} encoder={encoder_handle:?} crtc={crtc_handle:?} mode={}x{}",
            mode.size().0,
            mode.size().1
        );

        Ok(DisplayController {
            card,
            connector: connector_handle,
            crtc: crtc_handle,
            mode,
            fb_cache: HashMap::new(),
        })
    }

    fn open_first_card() -> Result<Card> {
        for path in CANDIDATE_CARD_PATHS {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => {
                    let card = Card(file);
                    if card.resource_handles().is_ok() {
                        debug!("opened display device {path}");
                        return Ok(card);
                    }
                }
                Err(e) => debug!("could not open {path}: {e}"),
            }
        }
        Err(PlayerError::DeviceUnavailable(
            "no usable /dev/dri/card* mode-setting device found".to_string(),
        ))
    }

    fn pick_connector_and_mode(
        card: &Card,
        resources: &drm::control::ResourceHandles,
    ) -> Result<(connector::Handle, Mode)> {
        for &handle in resources.connectors() {
            let info = match card.get_connector(handle, false) {
                Ok(i) => i,
                Err(e) => {
                    debug!("get_connector({handle:?}) failed: {e}");
                    continue;
                }
            };
            if info.state() != connector::State::Connected {
                continue;
            }
            let modes = info.modes();
            if modes.is_empty() {
                continue;
            }
            let preferred = modes
                .iter()
                .find(|m| m.size() == (PREFERRED_WIDTH, PREFERRED_HEIGHT))
                .copied()
                .unwrap_or(modes[0]);
            return Ok((handle, preferred));
        }
        Err(PlayerError::DeviceUnavailable(
            "no connected display connector with a usable mode".to_string(),
        ))
    }

    fn pick_encoder(connector_info: &connector::Info) -> Result<encoder::Handle> {
        if let Some(handle) = connector_info.curr_encoder() {
            return Ok(handle);
        }
        connector_info
            .encoders()
            .first()
            .copied()
            .ok_or_else(|| PlayerError::DeviceUnavailable("connector has no usable encoder".to_string()))
    }

    fn pick_crtc(
        card: &Card,
        resources: &drm::control::ResourceHandles,
        encoder_info: &encoder::Info,
    ) -> Result<crtc::Handle> {
        if let Some(handle) = encoder_info.crtc() {
            return Ok(handle);
        }
        // `possible_crtcs()` is a bitmask over the position of each handle
        // in `resources.crtcs()` — the standard KMS convention: bit i set
        // means crtcs()[i] is usable by this encoder.
        let possible = encoder_info.possible_crtcs();
        for (i, &handle) in resources.crtcs().iter().enumerate() {
            if possible.0 & (1 << i) == 0 {
                continue;
            }
            if card.get_crtc(handle).is_ok() {
                return Ok(handle);
            }
        }
        Err(PlayerError::DeviceUnavailable(
            "no CRTC could be acquired for the chosen encoder".to_string(),
        ))
    }

    /// Imports `fd` as a 4:2:0 planar framebuffer. Idempotent per-fd: a
    /// second call for an already-cached fd is a no-op success.
    pub fn setup_zero_copy_buffer(&mut self, fd: RawFd, width: u32, height: u32) -> Result<()> {
        if fd < 0 {
            return Err(PlayerError::DisplayImportFailed {
                fd,
                reason: "negative fd".to_string(),
            });
        }
        if width == 0 || height == 0 || width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
            return Err(PlayerError::DisplayImportFailed {
                fd,
                reason: format!("invalid dimensions {width}x{height}"),
            });
        }
        if self.fb_cache.contains_key(&fd) {
            return Ok(());
        }

        let luma_area = (width as u64).checked_mul(height as u64).ok_or_else(|| {
            PlayerError::DisplayImportFailed {
                fd,
                reason: "width*height overflows".to_string(),
            }
        })?;
        if luma_area > u32::MAX as u64 {
            return Err(PlayerError::DisplayImportFailed {
                fd,
                reason: "plane area exceeds 32-bit range".to_string(),
            });
        }

        let bo_handle = self
            .card
            .prime_fd_to_handle(fd)
            .map_err(|e| PlayerError::DisplayImportFailed { fd, reason: e.to_string() })?;

        // Three planes over one contiguous buffer: luma, then Cb, then Cr,
        // each quarter-size chroma plane at half stride.
        let chroma_area = luma_area / 4;
        let cr_offset = luma_area + chroma_area;
        if cr_offset > u32::MAX as u64 {
            return Err(PlayerError::DisplayImportFailed {
                fd,
                reason: "plane layout exceeds 32-bit range".to_string(),
            });
        }

        let planes = Yuv420Planes {
            width,
            height,
            fourcc: DrmFourcc::Yuv420,
            handles: [Some(bo_handle), Some(bo_handle), Some(bo_handle), None],
            pitches: [width, width / 2, width / 2, 0],
            offsets: [0, luma_area as u32, cr_offset as u32, 0],
        };

        let fb_handle = self
            .card
            .add_planar_framebuffer(&planes, drm::control::FbCmd2Flags::empty())
            .map_err(|e| PlayerError::DisplayImportFailed { fd, reason: e.to_string() })?;

        self.fb_cache.insert(
            fd,
            CacheEntry {
                framebuffer: fb_handle,
                bo_handle,
            },
        );
        Ok(())
    }

    /// Mode-sets the bound CRTC/connector onto the framebuffer cached for
    /// `frame.fd`. Returns the presentation latency.
    pub fn display_frame(&mut self, frame: &FrameDescriptor) -> Result<std::time::Duration> {
        if !frame.is_dmabuf || frame.fd < 0 {
            return Err(PlayerError::DisplayPresentFailed {
                reason: "frame is not a valid dmabuf descriptor".to_string(),
            });
        }
        let entry = self.fb_cache.get(&frame.fd).ok_or_else(|| PlayerError::DisplayPresentFailed {
            reason: format!("no cached framebuffer for fd={}", frame.fd),
        })?;

        let start = Instant::now();
        self.card
            .set_crtc(self.crtc, Some(entry.framebuffer), (0, 0), &[self.connector], Some(self.mode))
            .map_err(|e| PlayerError::DisplayPresentFailed { reason: e.to_string() })?;
        Ok(start.elapsed())
    }

    /// Removes every cached framebuffer and closes every imported handle.
    /// Never touches the underlying pool-owned fds. Errors are
    /// logged, never fatal.
    pub fn teardown(&mut self) {
        for (fd, entry) in self.fb_cache.drain() {
            if let Err(e) = self.card.destroy_framebuffer(entry.framebuffer) {
                warn!("destroy_framebuffer for fd={fd} failed: {e}");
            }
            if let Err(e) = self.card.close_buffer(entry.bo_handle) {
                warn!("close_buffer for fd={fd} failed: {e}");
            }
        }
    }
}

impl Drop for DisplayController {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl crate::presenter::ZeroCopyImporter for DisplayController {
    fn import(&mut self, _slot_index: usize, fd: RawFd, width: u32, height: u32) -> Result<()> {
        self.setup_zero_copy_buffer(fd, width, height)
    }
}

impl crate::presenter::PresentSink for DisplayController {
    fn present(&mut self, fd: RawFd, width: u32, height: u32) -> Result<()> {
        self.display_frame(&FrameDescriptor {
            fd,
            width,
            height,
            is_dmabuf: true,
        })
        .map(|_latency| ())
    }
}
