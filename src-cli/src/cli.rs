//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tunedrop_core::{AudioFormat, TransferPriority};

/// Fetch media over HTTP with resume, priorities and conversion.
#[derive(Debug, Clone, Parser)]
#[command(name = "tunedrop", version, about, long_about = None)]
pub struct Args {
    /// Resources to fetch.
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Directory for finished files.
    #[arg(short, long, value_name = "DIR")]
    pub dest: Option<PathBuf>,

    /// Transfers running at once.
    #[arg(short, long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub jobs: Option<u16>,

    /// Convert finished files to this format.
    #[arg(short, long, value_enum)]
    pub format: Option<FormatArg>,

    /// Priority given to every transfer.
    #[arg(short, long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,

    /// Configuration file to use instead of the default.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print a JSON summary of every transfer.
    #[arg(long)]
    pub json: bool,

    /// Debug output on the console.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Conversion target selection.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum FormatArg {
    /// MPEG-1 Layer III
    Mp3,
    /// Ogg Vorbis
    Ogg,
    /// Free Lossless Audio Codec
    Flac,
    /// AAC in an MPEG-4 container
    M4a,
}

impl From<FormatArg> for AudioFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Mp3 => Self::Mp3,
            FormatArg::Ogg => Self::Ogg,
            FormatArg::Flac => Self::Flac,
            FormatArg::M4a => Self::M4a,
        }
    }
}

/// Priority selection.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum PriorityArg {
    /// Admitted last
    Low,
    /// Default
    Normal,
    /// Admitted first
    High,
}

impl From<PriorityArg> for TransferPriority {
    fn from(priority: PriorityArg) -> Self {
        match priority {
            PriorityArg::Low => Self::Low,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::High => Self::High,
        }
    }
}
