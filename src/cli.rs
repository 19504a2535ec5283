use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "unit-hunter")]
#[command(about = "Find Java types in directories and nested archives, with a path-keyed scan cache")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Snapshot location (LMDB file)
    #[arg(long, value_name = "FILE", global = true)]
    pub db: Option<PathBuf>,

    /// Neither read nor write the snapshot
    #[arg(long, global = true)]
    pub no_snapshot: bool,

    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Find {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Fully qualified name contains this text
        #[arg(long, value_name = "TEXT")]
        name: Option<String>,

        /// Extends or implements this type (simple or qualified name)
        #[arg(long, value_name = "TYPE")]
        extends: Option<String>,

        #[arg(long, value_name = "ANNOTATION")]
        annotated: Option<String>,

        /// Declares or inherits a method with this name
        #[arg(long, value_name = "NAME")]
        method: Option<String>,

        /// At least this many methods across the hierarchy
        #[arg(long, value_name = "N")]
        min_methods: Option<usize>,

        #[arg(long, value_name = "N")]
        parallel: Option<usize>,

        /// Print the class paths holding the matches instead of the matches
        #[arg(long)]
        class_paths: bool,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    Load {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    Stats,
    Clear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}
