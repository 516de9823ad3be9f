use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "birdwatch")]
#[command(about = "Post-mortem introspection for a tracing JIT: audit logs and VM profiles")]
#[command(version)]
pub struct Args {
    /// Set log level (error, warn, info, debug, trace).
    /// Priority: 1. this flag, 2. RUST_LOG env var, 3. default (warn)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load an audit log and print a summary
    Inspect {
        /// Audit log file
        auditlog: PathBuf,
    },
    /// Print the ordered event list of an audit log
    Events {
        auditlog: PathBuf,
    },
    /// Print one trace: lineage, contour, bytecode, and IR
    Trace {
        auditlog: PathBuf,
        /// Trace number
        traceno: u16,
        /// Skip the IR listing
        #[arg(long)]
        no_ir: bool,
    },
    /// Rank hot traces in VM-profile files; two files print their delta
    Profile {
        /// Profile files, oldest first
        #[arg(required = true)]
        profiles: Vec<PathBuf>,
    },
}
