//! Centralized path configuration for the daemon.
//!
//! All time-series data paths go through this module so that the pollers
//! and tests agree on the on-disk layout:
//! `<data root>/<url>/<property>/<level index>/<segment id>`.

use std::path::{Path, PathBuf};

/// Get the root directory for time-series data.
///
/// Resolution order:
/// 1. `MAD_DATA_DIR` environment variable
/// 2. `<system temp dir>/mad`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MAD_DATA_DIR") {
        return PathBuf::from(dir);
    }
    std::env::temp_dir().join("mad")
}

/// Get the table directory for one property of a handler.
///
/// The handler URL keeps its internal slashes but sheds the leading one so
/// it nests under the data root instead of replacing it.
pub fn table_dir(root: &Path, url: &str, property: &str) -> PathBuf {
    root.join(url.trim_start_matches('/')).join(property)
}
