//! Mount point handling for the ChunkFS client.
//!
//! Parses the `-o` style option string, validates the mount point and runs
//! the blocking `fuser` session.

use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::filesystem::ChunkFs;

/// Mount options understood by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Filesystem name shown in the mount table.
    pub fsname: String,
    /// Allow other users to access.
    pub allow_other: bool,
    /// Allow root to access.
    pub allow_root: bool,
    /// Let the kernel check permissions.
    pub default_permissions: bool,
    /// Unmount when the daemon exits.
    pub auto_unmount: bool,
    /// Read-only mount.
    pub ro: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            fsname: "chunkfs".to_string(),
            allow_other: false,
            allow_root: false,
            default_permissions: false,
            auto_unmount: true,
            ro: false,
        }
    }
}

/// Errors that can occur while mounting.
#[derive(Debug, Error)]
pub enum MountError {
    /// Path does not exist.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Unknown or malformed option.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// The FUSE session failed.
    #[error("Mount failed at {mountpoint}: {reason}")]
    SessionFailed {
        /// Mountpoint the session was started on.
        mountpoint: String,
        /// Why the session ended.
        reason: String,
    },
}

/// Validate a mountpoint path.
pub fn validate_mountpoint(path: &Path) -> Result<(), MountError> {
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }

    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }

    Ok(())
}

/// Parse mount options from a comma-separated string.
///
/// Valid options: allow_other, allow_root, default_permissions, auto_unmount,
/// noauto_unmount, ro, rw, fsname=NAME.
pub fn parse_mount_options(opts_str: &str) -> Result<MountOptions, MountError> {
    let mut options = MountOptions::default();

    for opt in opts_str.split(',') {
        let opt = opt.trim();
        match opt {
            "allow_other" => options.allow_other = true,
            "allow_root" => options.allow_root = true,
            "default_permissions" => options.default_permissions = true,
            "auto_unmount" => options.auto_unmount = true,
            "noauto_unmount" => options.auto_unmount = false,
            "ro" => options.ro = true,
            "rw" => options.ro = false,
            "" => {}
            _ => match opt.strip_prefix("fsname=") {
                Some(name) if !name.is_empty() => options.fsname = name.to_string(),
                _ => return Err(MountError::InvalidOption(opt.to_string())),
            },
        }
    }

    if options.allow_other && options.allow_root {
        return Err(MountError::InvalidOption(
            "allow_other and allow_root are mutually exclusive".to_string(),
        ));
    }

    Ok(options)
}

/// Convert MountOptions to fuser::MountOption vec.
pub fn options_to_fuser(opts: &MountOptions) -> Vec<fuser::MountOption> {
    let mut fuser_opts = vec![fuser::MountOption::FSName(opts.fsname.clone())];

    if opts.allow_other {
        fuser_opts.push(fuser::MountOption::AllowOther);
    }

    if opts.allow_root {
        fuser_opts.push(fuser::MountOption::AllowRoot);
    }

    if opts.default_permissions {
        fuser_opts.push(fuser::MountOption::DefaultPermissions);
    }

    if opts.auto_unmount {
        fuser_opts.push(fuser::MountOption::AutoUnmount);
    }

    fuser_opts.push(if opts.ro {
        fuser::MountOption::RO
    } else {
        fuser::MountOption::RW
    });

    fuser_opts
}

/// Mounts `fs` at `mountpoint` and serves requests until unmounted.
pub fn mount(fs: ChunkFs, mountpoint: &Path, opts: &MountOptions) -> Result<(), MountError> {
    validate_mountpoint(mountpoint)?;
    info!("mounting {} at {}", opts.fsname, mountpoint.display());
    fuser::mount2(fs, mountpoint, &options_to_fuser(opts)).map_err(|e| MountError::SessionFailed {
        mountpoint: mountpoint.display().to_string(),
        reason: e.to_string(),
    })
}
