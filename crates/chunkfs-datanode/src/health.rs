//! Health check and disk usage.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{error, warn};

use crate::error::Result;

/// Health check succeeded.
pub const HEALTH_OK: i32 = 0;
/// Health check could not write to the data directory.
pub const HEALTH_FAILED: i32 = 2;

const HEALTH_FILE: &str = "health";
const GIB: u64 = 1024 * 1024 * 1024;

/// Space on the filesystem holding a path, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskUsage {
    pub all: u64,
    pub free: u64,
    pub used: u64,
}

impl DiskUsage {
    pub fn all_gib(&self) -> u64 {
        to_gib(self.all)
    }

    pub fn free_gib(&self) -> u64 {
        to_gib(self.free)
    }

    pub fn used_gib(&self) -> u64 {
        to_gib(self.used)
    }
}

/// Whole GiB in `bytes`, rounded down.
pub fn to_gib(bytes: u64) -> u64 {
    bytes / GIB
}

/// Reports total, free and used space of the filesystem containing `path`.
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL byte")
    })?;

    // SAFETY: c_path is a valid NUL-terminated string and stat is a
    // zeroed statvfs owned by this frame.
    let stat = unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        stat
    };

    let block = stat.f_frsize as u64;
    let all = stat.f_blocks as u64 * block;
    let free = stat.f_bfree as u64 * block;
    Ok(DiskUsage {
        all,
        free,
        used: all.saturating_sub(free),
    })
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub status: i32,
    pub used_gib: u64,
}

/// Writes `ok` to `<data_dir>/health` and reports used space.
pub async fn check_health(data_dir: &Path) -> HealthReport {
    let status = match tokio::fs::write(data_dir.join(HEALTH_FILE), b"ok").await {
        Ok(()) => HEALTH_OK,
        Err(e) => {
            error!("health check write in {} failed: {}", data_dir.display(), e);
            HEALTH_FAILED
        }
    };

    let used_gib = match disk_usage(data_dir) {
        Ok(usage) => usage.used_gib(),
        Err(e) => {
            warn!("disk usage of {} unavailable: {}", data_dir.display(), e);
            0
        }
    };

    HealthReport { status, used_gib }
}
