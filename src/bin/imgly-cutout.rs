//! IMG.LY Cutout CLI Tool
//!
//! Command-line interface for removing image backgrounds and compositing
//! the subject over a new backdrop.

#[cfg(feature = "cli")]
use imgly_cutout::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
