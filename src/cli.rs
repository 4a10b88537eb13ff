//! Command-line interface for the proxy binary.

use clap::Parser;

/// Local OpenAI-compatible proxy for the BlockRun inference marketplace.
#[derive(Debug, Parser)]
#[command(
    name = "clawrouter",
    about = "Routes chat completions to the cheapest adequate model and pays per request",
    disable_version_flag = true
)]
pub struct Args {
    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Port to listen on (overrides BLOCKRUN_PROXY_PORT)
    #[arg(long)]
    pub port: Option<u16>,
}
