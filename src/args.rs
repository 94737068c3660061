use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "mail-archiver")]
#[clap(author, version, about)]
pub struct Args {
    /// Path to the configuration file.
    #[clap(short, long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Directory the archive, sync state and summaries are kept in.
    #[clap(short = 'p', long = "data", default_value = ".")]
    pub data: PathBuf,
    /// Suppress any progress output if set.
    #[clap(short, long)]
    pub quiet: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
