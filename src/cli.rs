use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "postmux")]
#[command(author, version, about = "Download post-processing: remux DASH/WebM, extract Ogg, convert TTML")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a post-processing algorithm
    Run {
        /// Algorithm name (see `postmux algorithms`)
        #[arg(required = true)]
        algorithm: String,

        /// Output file; with --same-file also the file holding every source
        #[arg(required = true)]
        output: PathBuf,

        /// Input as path[:offset[:length]]; repeat for several sources
        #[arg(short, long = "source", value_name = "SOURCE")]
        sources: Vec<String>,

        /// Source start offsets inside the output file (same-file mode)
        #[arg(long = "offset", value_name = "OFFSET")]
        offsets: Vec<u64>,

        /// Positional algorithm argument; repeat in order
        #[arg(short, long = "arg", value_name = "ARG", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Rewrite the output file in place
        #[arg(long)]
        same_file: bool,
    },

    /// Probe a media file and display its tracks
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the available post-processing algorithms
    Algorithms,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        file: Option<PathBuf>,
    },
}
