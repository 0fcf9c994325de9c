//! External receiver contract (collaborator, not part of the core).
//!
//! RTP parsing and H.264 depayloading are explicitly out of scope here:
//! the pipeline accepts whole access units and assumes an external receiver
//! reassembles them. This module defines that contract plus exactly one
//! concrete implementation — a receiver that treats each UDP datagram as a
//! whole access unit. It deliberately does **not** parse RTP headers or
//! depayload H.264; a real deployment in front of an RTP source needs its
//! own reassembling receiver upstream of this trait.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};

/// Invoked once per reassembled access unit. The receiver owns the
/// lifetime of the payload only up to the callback's return.
pub type AccessUnitCallback = Box<dyn FnMut(&[u8], u32) + Send>;

pub trait AccessUnitReceiver: Send {
    /// Runs until `running` is cleared. Blocking; call on its own thread.
    fn run(self: Box<Self>, callback: AccessUnitCallback, running: Arc<AtomicBool>);
}

/// Treats each datagram as one whole access unit, with a synthetic
/// monotonically increasing value standing in for the RTP timestamp the
/// real contract would carry.
pub struct UdpAccessUnitReceiver {
    socket: UdpSocket,
}

impl UdpAccessUnitReceiver {
    pub fn bind(ip: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((ip, port))
            .with_context(|| format!("binding UDP receiver to {ip}:{port}"))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .context("setting UDP receive timeout")?;
        Ok(UdpAccessUnitReceiver { socket })
    }
}

impl AccessUnitReceiver for UdpAccessUnitReceiver {
    fn run(self: Box<Self>, mut callback: AccessUnitCallback, running: Arc<AtomicBool>) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut synthetic_timestamp = 0u32;

        while running.load(Ordering::SeqCst) {
            match self.socket.recv(&mut buf) {
                Ok(n) if n > 0 => {
                    callback(&buf[..n], synthetic_timestamp);
                    synthetic_timestamp = synthetic_timestamp.wrapping_add(1);
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    warn!("UDP receive failed: {e}");
                }
            }
        }
        debug!("UDP access unit receiver stopped");
    }
}
