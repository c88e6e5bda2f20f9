//! Entry point: parse the CLI surface and hand off to the library crate.

use clap::Parser;
use mcp_gateway_lib::cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    mcp_gateway_lib::run(args).await
}
