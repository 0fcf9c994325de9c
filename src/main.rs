mod buffer_pool;
mod cli;
mod display;
mod dma_heap;
mod error;
mod logging;
mod pipeline;
mod playback;
mod presenter;
mod receiver;
mod streaming;
mod v4l2;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;

use cli::Args;
use pipeline::{DecodePipeline, PipelineConfig};
use playback::PlaybackLoop;
use receiver::{AccessUnitReceiver, UdpAccessUnitReceiver};

const SIGNAL_TOKEN: Token = Token(0);

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(logging::resolve_level(args.log_level.as_deref(), args.verbose));

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let pipeline = DecodePipeline::initialize(PipelineConfig {
        device_path: args.device.clone(),
        width: args.width,
        height: args.height,
    })
    .map_err(|e| anyhow::anyhow!("pipeline initialization failed: {e}"))?;

    let mut playback = Arc::new(PlaybackLoop::spawn(pipeline));

    let receiver: Box<dyn AccessUnitReceiver> =
        Box::new(UdpAccessUnitReceiver::bind(&args.ip, args.port)?);

    let receiver_running = Arc::new(AtomicBool::new(true));
    let receiver_running_for_loop = Arc::clone(&receiver_running);
    let playback_for_callback = Arc::clone(&playback);

    let receiver_thread = std::thread::spawn(move || {
        let callback: receiver::AccessUnitCallback = Box::new(move |data: &[u8], _timestamp: u32| {
            playback_for_callback.push_access_unit(data);
        });
        receiver.run(callback, receiver_running_for_loop);
    });

    wait_for_shutdown_signal()?;
    info!("shutdown signal received, stopping");

    receiver_running.store(false, Ordering::SeqCst);
    if receiver_thread.join().is_err() {
        error!("receiver thread panicked during shutdown");
    }

    Arc::get_mut(&mut playback)
        .expect("receiver thread joined, no other owners of the playback loop remain")
        .shutdown();
    Ok(())
}

/// Blocks the main thread until SIGINT or SIGTERM arrives, via an
/// `mio`-registered `signal-hook` signal source (teacher's own shutdown
/// idiom: `mio` + `signal-hook` + `signal-hook-mio` are all direct
/// dependencies).
fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
    let mut events = Events::with_capacity(8);

    loop {
        poll.poll(&mut events, None)?;
        for event in events.iter() {
            if event.token() == SIGNAL_TOKEN {
                for signal in signals.pending() {
                    if signal == SIGINT || signal == SIGTERM {
                        return Ok(());
                    }
                }
            }
        }
    }
}
