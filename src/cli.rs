//! Command-line argument parsing.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Zero-copy H.264 decode-and-present player for Linux SBCs", long_about = None)]
pub struct Args {
    /// Path to the stateful M2M decoder device.
    #[arg(short, long, default_value = "/dev/video10")]
    pub device: String,

    /// Listen address for the external access-unit receiver.
    #[arg(short, long, default_value = "0.0.0.0")]
    pub ip: String,

    /// Listen port for the external access-unit receiver.
    #[arg(short, long, default_value_t = 5004)]
    pub port: u16,

    /// Expected stream width, used for initial format negotiation.
    #[arg(long, default_value_t = 1920)]
    pub width: u32,

    /// Expected stream height, used for initial format negotiation.
    #[arg(long, default_value_t = 1080)]
    pub height: u32,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Explicit log level, overriding `--verbose` if set.
    #[arg(long)]
    pub log_level: Option<String>,
}
