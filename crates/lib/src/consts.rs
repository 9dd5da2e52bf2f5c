pub const APP_NAME: &str = "nativeboot";

/// Prefix used for workspace directories so stray ones are recognisable.
pub const WORKSPACE_PREFIX: &str = "nativeboot-run-";

/// Length of a lowercase hex SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Storage namespace for immutable artifacts in the mirror.
pub const ARTIFACT_DIR: &str = "wheels";

/// Storage namespace for per-project pages in the mirror.
pub const PAGES_DIR: &str = "simple";

/// Well-known path of the authoritative index object.
pub const INDEX_FILE: &str = "packages.json";

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_UPLOAD_JOBS: usize = 8;
