//! Buffered Playback Loop.
//!
//! One bounded queue between the receiver's callback thread and the
//! decode thread, guarded by a `Mutex` + `Condvar`. The decode thread is
//! the only caller of `pipeline::DecodePipeline` and everything under it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::pipeline::DecodePipeline;

const QUEUE_CAPACITY: usize = 5;
const SPS_WAIT_POLL: Duration = Duration::from_secs(1);

struct Inner {
    queue: Mutex<std::collections::VecDeque<Vec<u8>>>,
    condvar: Condvar,
    running: AtomicBool,
    has_sps: AtomicBool,
    frames_dropped: AtomicU64,
}

/// Handle retained by the main thread: push access units, then shut down.
pub struct PlaybackLoop {
    inner: Arc<Inner>,
    join_handle: Option<JoinHandle<()>>,
}

impl PlaybackLoop {
    /// Spawns the decode thread, which owns `pipeline` for its entire
    /// lifetime.
    pub fn spawn(mut pipeline: DecodePipeline) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(std::collections::VecDeque::with_capacity(QUEUE_CAPACITY)),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
            has_sps: AtomicBool::new(false),
            frames_dropped: AtomicU64::new(0),
        });

        let thread_inner = Arc::clone(&inner);
        let join_handle = thread::spawn(move || {
            try_raise_realtime_priority();
            decode_thread_main(&thread_inner, &mut pipeline);
        });

        PlaybackLoop {
            inner,
            join_handle: Some(join_handle),
        }
    }

    /// Called from the receiver's callback thread. On overflow, drops the
    /// **oldest** queued access unit (liveness over completeness).
    pub fn push_access_unit(&self, data: &[u8]) {
        if !self.inner.has_sps.load(Ordering::Relaxed) && contains_sps(data) {
            self.inner.has_sps.store(true, Ordering::Relaxed);
        }

        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(data.to_vec());
        self.inner.condvar.notify_one();
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn has_sps(&self) -> bool {
        self.inner.has_sps.load(Ordering::Relaxed)
    }

    /// Cooperative shutdown: flips `running`, wakes the decode thread, joins it.
    pub fn shutdown(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.condvar.notify_all();
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                warn!("decode thread panicked during shutdown");
            }
        }
    }
}

impl Drop for PlaybackLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn decode_thread_main(inner: &Inner, pipeline: &mut DecodePipeline) {
    while inner.running.load(Ordering::SeqCst) && !inner.has_sps.load(Ordering::Relaxed) {
        thread::sleep(SPS_WAIT_POLL);
    }

    loop {
        let access_unit = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(unit) = queue.pop_front() {
                    break unit;
                }
                queue = inner.condvar.wait(queue).unwrap();
            }
        };

        if let Err(e) = pipeline.decode_access_unit(&access_unit) {
            if e.is_recoverable() {
                warn!("decode step failed (recoverable): {e}");
            } else {
                warn!("decode step failed (fatal): {e}");
                return;
            }
        }
    }
}

/// Scans for a sequence-parameter-set NAL unit (type 7) by walking start
/// codes `00 00 00 01` / `00 00 01` and examining the low 5 bits of the
/// following NAL header byte.
fn contains_sps(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        let (code_len, matched) = if data[i..].starts_with(&[0, 0, 0, 1]) {
            (4, true)
        } else if data[i..].starts_with(&[0, 0, 1]) {
            (3, true)
        } else {
            (1, false)
        };
        if matched {
            if let Some(&header) = data.get(i + code_len) {
                if header & 0x1F == 7 {
                    return true;
                }
            }
            i += code_len;
        } else {
            i += 1;
        }
    }
    false
}

fn try_raise_realtime_priority() {
    let param = libc::sched_param {
        sched_priority: unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) },
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        warn!(
            "failed to raise decode thread to SCHED_FIFO: {}",
            std::io::Error::last_os_error()
        );
    } else {
        info!("decode thread running at SCHED_FIFO max priority");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_sps_with_4_byte_start_code() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42, 0x00];
        assert!(contains_sps(&data));
        data[4] = 0x65; // IDR slice, not SPS
        assert!(!contains_sps(&data));
    }

    #[test]
    fn detects_sps_with_3_byte_start_code() {
        let data = vec![0, 0, 1, 0x27, 0xAA];
        assert!(contains_sps(&data));
    }

    #[test]
    fn no_start_code_means_no_sps() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        assert!(!contains_sps(&data));
    }
}
