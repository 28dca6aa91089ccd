/// Application name used for default directories and environment variables.
pub const APP_NAME: &str = "stackwright";

/// Revision of the cache tag format.
///
/// Bumping this invalidates every snapshot tag written by earlier releases.
pub const CACHE_SERIAL: u32 = 1;

/// Default number of extra attempts for transient fetch failures.
pub const DEFAULT_FETCH_RETRIES: u32 = 3;

/// File name of the version manifest written into the install root.
pub const VERSION_MANIFEST_FILENAME: &str = "version-manifest.json";

/// Suffix of the freshness stamp written next to downloaded artifacts.
pub const FETCH_STAMP_SUFFIX: &str = ".stamp";
