use std::time::Duration;

pub const APP_NAME: &str = "kiln";

/// PATH given to build and test commands unless the recipe passes the host's through.
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Lines of captured output kept in error messages.
pub const OUTPUT_TAIL_LINES: usize = 20;

/// Prefix of the hidden staging directory created inside the install prefix.
pub const STAGING_DIR_PREFIX: &str = ".kiln-staging-";
