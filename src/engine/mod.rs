// Fresh Engine - Core module structure
pub mod cli;
pub mod config;
pub mod updater;

pub use config::{EngineConfig, HostContext};
pub use updater::UpdateEngine;
