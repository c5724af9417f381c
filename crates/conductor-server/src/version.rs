//! Build metadata emitted by `build.rs`

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");
pub const GIT_BRANCH: &str = env!("VERGEN_GIT_BRANCH");
pub const GIT_DIRTY: &str = env!("VERGEN_GIT_DIRTY");
pub const RUSTC_VERSION: &str = env!("VERGEN_RUSTC_SEMVER");
pub const BUILD_TIMESTAMP: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// `<version> (<sha>[ dirty])`
pub fn full_version() -> String {
    let dirty = if GIT_DIRTY == "true" { " dirty" } else { "" };
    format!("{VERSION} ({GIT_SHA}{dirty})")
}

/// Build details served on `/version`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub git_branch: &'static str,
    pub built_at: &'static str,
    pub rustc: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION,
        git_sha: GIT_SHA,
        git_branch: GIT_BRANCH,
        built_at: BUILD_TIMESTAMP,
        rustc: RUSTC_VERSION,
    }
}
