//! Fresh Self-Update System
//!
//! Resolves the active content bundle and replaces it with newer, verified
//! bundles from a remote manifest.
//!
//! Components:
//! - `version` - Version ordering
//! - `hasher` - Streaming digests and stream fan-out
//! - `manifest` - Bundle, verification and remote manifest formats
//! - `state` - Engine states, events and the persisted selection
//! - `store` - On-disk layout and manifest I/O
//! - `verify` - Incremental bundle verification
//! - `resolver` - Active bundle selection
//! - `transport` - HTTP seam
//! - `download` - HTTP download with resume and retry
//! - `extract` - Streaming zip extraction
//! - `engine` - Single-flight update orchestration

pub mod download;
pub mod engine;
pub mod error;
pub mod extract;
pub mod hasher;
pub mod manifest;
pub mod resolver;
pub mod state;
pub mod store;
pub mod transport;
pub mod verify;
pub mod version;

pub use engine::{UpdateEngine, UpdateResult};
pub use error::UpdateError;
pub use manifest::{Bundle, UpdateInfo};
pub use resolver::BundleResolver;
pub use state::{UpdateEvent, UpdateState};
pub use store::BundleStore;
pub use transport::{HttpTransport, Transport};
