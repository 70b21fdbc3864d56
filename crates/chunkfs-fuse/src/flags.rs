//! Open flag helpers.

/// Raw `open(2)` flags as delivered by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(i32);

impl OpenFlags {
    /// Read-only open with no extra flags.
    pub const READ_ONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    /// Write-only open with no extra flags.
    pub const WRITE_ONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    /// Read-write open with no extra flags.
    pub const READ_WRITE: OpenFlags = OpenFlags(libc::O_RDWR);

    /// Wraps the flags passed to `open`/`create`/`release`.
    pub fn from_libc(flags: i32) -> Self {
        OpenFlags(flags)
    }

    /// Returns the raw flag bits.
    pub fn bits(&self) -> i32 {
        self.0
    }

    /// Returns a copy with `extra` set.
    pub fn with(self, extra: i32) -> Self {
        OpenFlags(self.0 | extra)
    }

    /// True when the access mode grants write access.
    pub fn is_writable(&self) -> bool {
        matches!(self.0 & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
    }

    /// True when `O_TRUNC` is set.
    pub fn truncates(&self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    /// True when an open that misses on the metadata service should create
    /// the file: `O_CREAT` is set, or the open is a bare write-only open.
    pub fn requests_create(&self) -> bool {
        if self.0 == libc::O_RDONLY {
            return false;
        }
        self.0 & libc::O_CREAT != 0 || self.0 & !(libc::O_WRONLY | libc::O_TRUNC) == 0
    }
}
