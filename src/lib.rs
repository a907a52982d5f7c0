//! Fresh - self-updating content bundles
//!
//! Resolves which versioned bundle an application should load, checks a
//! remote manifest for newer bundles and installs them with resumable,
//! verified downloads.

pub mod engine;
