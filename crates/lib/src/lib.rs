//! nativeboot-lib: reproducible native dependency bootstrap and mirror
//! publication.
//!
//! - `pipeline`: one gated, verified, sandboxed build of a pinned dependency,
//!   and chained plans of them
//! - `fetch` / `integrity`: source acquisition and digest checks
//! - `env`: environment values and overlays threaded through every run
//! - `build`: build specs, the step driver and the toolchain seam
//! - `patch`: post-install rewrites of generated metadata
//! - `publish`: staging built artifacts and uploading them in a safe order

pub mod build;
pub mod config;
pub mod consts;
pub mod env;
pub mod fetch;
pub mod integrity;
pub mod patch;
pub mod pipeline;
pub mod placeholder;
pub mod platform;
pub mod publish;
pub mod workspace;
