//! Shim binary that calls into the library's `inner_main`.

use clap::Parser as _;
use eyre::Result;
use ezfrontend::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = Cli::parse();
    ezfrontend::inner_main(invocation).await
}
