//! Fresh CLI Module
//! Command-line interface for inspecting and driving the update engine

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::config::{EngineConfig, HostContext, CONFIG_FILE};

#[derive(Parser, Debug)]
#[command(name = "fresh-cli")]
#[command(version)]
#[command(about = "Bundle self-update engine", long_about = None)]
pub struct Cli {
    /// Application root holding fresh.config.json and the shipped bundle
    /// (defaults to current directory)
    #[arg(short, long, global = true)]
    pub app_root: Option<PathBuf>,

    /// Config file (defaults to <app-root>/fresh.config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Engine data directory (defaults to the per-user data directory)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Version of the host application reported to the update server
    /// (defaults to this tool's version)
    #[arg(long, global = true)]
    pub app_version: Option<String>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the active bundle, selection and installed versions
    Status,

    /// Check for a newer bundle and install it
    Check,

    /// Verify an installed bundle
    Verify {
        /// Installed version to verify
        version: String,
    },

    /// List installed bundle versions
    List,

    /// Remove old bundles
    Prune {
        /// Number of versions to keep (defaults to keepBundles)
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// Print the active bundle's entry points
    EntryPoints,
}

impl Cli {
    pub fn get_app_root(&self) -> PathBuf {
        self.app_root
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn get_config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.get_app_root().join(CONFIG_FILE))
    }

    pub fn host_context(&self, config: &EngineConfig) -> HostContext {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(|| HostContext::default_data_dir(&config.id));
        let app_version = self
            .app_version
            .as_deref()
            .unwrap_or(env!("CARGO_PKG_VERSION"));
        HostContext::new(data_dir, app_version, self.get_app_root())
    }

    /// `RUST_LOG`-style default directive for the subscriber
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "fresh_lib=debug,fresh_cli=debug"
        } else {
            "fresh_lib=info,fresh_cli=info"
        }
    }
}
