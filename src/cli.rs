use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "class-proxy")]
#[command(about = "Index JVM classpaths by structural criteria and synthesize version-bound proxy classes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true)]
    pub store: Option<PathBuf>,

    /// Always rescan; do not read or write the index store.
    #[arg(long, global = true)]
    pub no_store: bool,

    #[arg(short = 'c', long = "classpath", value_name = "PATH", global = true)]
    pub classpath: Vec<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Build (or load) the index and print a summary.
    Index,
    /// Print the class names recorded under a category such as `@handlers:subtype`.
    Query {
        category: String,
    },
    /// Synthesize the proxy class bound to a contract.
    Resolve {
        contract: String,

        #[arg(short = 'b', long, value_name = "PATTERN", default_value = "{name}Impl")]
        bind: String,

        #[arg(short = 'p', long = "parent", value_name = "PATTERN")]
        parents: Vec<String>,

        #[arg(short = 'v', long, value_name = "VER")]
        version: Option<String>,

        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    Stats,
    Clear,
}
