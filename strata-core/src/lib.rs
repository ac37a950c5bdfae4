//! Strata core library.
//!
//! A daemon-less OCI image builder: Dockerfile planning, step execution
//! against the live root filesystem, layer snapshotting, content-addressed
//! layer caching, and image assembly/pushing. The command-line surface
//! lives in `strata-cli`.

pub mod cache;
pub mod config;
pub mod context;
pub mod creds;
pub mod dockerfile;
pub mod error;
pub mod exec;
pub mod executor;
pub mod image;
pub mod paths;
pub mod snapshot;
pub mod warmer;

pub use config::{BuildOptions, FeatureFlags, WarmerOptions};
pub use error::{Result, StrataError};
pub use executor::{do_build, BuildOutcome};
pub use warmer::warm_cache;
