use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clunker")]
#[command(
    author,
    version,
    about = "In-memory filesystem for deterministic fault-injection testing",
    long_about = None
)]
pub struct Cli {
    /// Directory to mount the filesystem at; created if absent and removed
    /// on exit.
    pub mount_path: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
