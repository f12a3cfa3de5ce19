//! Tracks the set of source paths ever opened read-only, write-only, or
//! read-write. Membership is monotonic for the process lifetime.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Default)]
pub struct AccessStats {
    read_only: HashSet<PathBuf>,
    write_only: HashSet<PathBuf>,
    read_write: HashSet<PathBuf>,
}

/// Which bucket an `open` flags value falls into. RDWR dominates WRONLY
/// dominates read-only, mirroring the bit-priority the original checks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

pub fn classify(flags: i32) -> AccessMode {
    if flags & libc::O_RDWR != 0 {
        AccessMode::ReadWrite
    } else if flags & libc::O_WRONLY != 0 {
        AccessMode::WriteOnly
    } else {
        AccessMode::ReadOnly
    }
}

impl AccessStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: &Path, mode: AccessMode) {
        match mode {
            AccessMode::ReadOnly => self.read_only.insert(path.to_path_buf()),
            AccessMode::WriteOnly => self.write_only.insert(path.to_path_buf()),
            AccessMode::ReadWrite => self.read_write.insert(path.to_path_buf()),
        };
    }

    pub fn read_only(&self) -> &HashSet<PathBuf> {
        &self.read_only
    }

    pub fn write_only(&self) -> &HashSet<PathBuf> {
        &self.write_only
    }

    pub fn read_write(&self) -> &HashSet<PathBuf> {
        &self.read_write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdwr_dominates_wronly_and_rdonly() {
        assert_eq!(
            classify(libc::O_RDWR | libc::O_WRONLY),
            AccessMode::ReadWrite
        );
        assert_eq!(classify(libc::O_WRONLY), AccessMode::WriteOnly);
        assert_eq!(classify(0), AccessMode::ReadOnly);
    }

    #[test]
    fn membership_is_monotonic() {
        let mut stats = AccessStats::new();
        let p = PathBuf::from("/tmp/src/a");
        stats.record(&p, AccessMode::ReadOnly);
        stats.record(&p, AccessMode::ReadOnly);
        assert_eq!(stats.read_only().len(), 1);
        stats.record(&p, AccessMode::ReadWrite);
        assert_eq!(stats.read_only().len(), 1);
        assert_eq!(stats.read_write().len(), 1);
    }
}
