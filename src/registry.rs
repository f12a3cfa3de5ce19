//! The path/fd registry: a bidirectional, many-to-one mapping between
//! kernel-facing inode numbers and host-side paths/open descriptors, with
//! reference counting driven by the lookup/forget protocol.
//!
//! Owned by the filesystem instance and threaded through every handler; see
//! the concurrency note in the crate root for why this needs no locking.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::sys;

/// Reserved inode denoting the source directory root.
pub const ROOT: u64 = 1;

pub struct Registry {
    mountpoint: PathBuf,
    inode_paths: HashMap<u64, HashSet<PathBuf>>,
    lookup_count: HashMap<u64, u64>,
    inode_fd: HashMap<u64, RawFd>,
    fd_inode: HashMap<RawFd, u64>,
    fd_open_count: HashMap<RawFd, u64>,
}

impl Registry {
    pub fn new(source_root: PathBuf, mountpoint: PathBuf) -> Self {
        let mut inode_paths = HashMap::new();
        let mut roots = HashSet::new();
        roots.insert(source_root);
        inode_paths.insert(ROOT, roots);

        Registry {
            mountpoint,
            inode_paths,
            lookup_count: HashMap::new(),
            inode_fd: HashMap::new(),
            fd_inode: HashMap::new(),
            fd_open_count: HashMap::new(),
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// True if `path`, once joined, names the mount point itself. Used by
    /// the self-exclusion guard to keep the filesystem from recursing
    /// through its own mount.
    pub fn is_mount_point(&self, path: &Path) -> bool {
        path == self.mountpoint
    }

    fn prune(paths: &mut HashSet<PathBuf>) {
        paths.retain(|p| p.exists());
    }

    /// Returns any currently valid path for `ino`, pruning stale entries
    /// first. `ENOENT` if the inode is unknown or its path set drains to
    /// empty.
    pub fn inode_to_path(&mut self, ino: u64) -> Result<PathBuf> {
        let paths = self
            .inode_paths
            .get_mut(&ino)
            .ok_or_else(|| Error::from_errno(libc::ENOENT))?;
        Self::prune(paths);
        if paths.is_empty() {
            self.inode_paths.remove(&ino);
            return Err(Error::from_errno(libc::ENOENT));
        }
        Ok(paths.iter().next().unwrap().clone())
    }

    /// Every currently-tracked path for `ino`, for logging call sites that
    /// want the whole alias set (`opendir`, `read`, `write`).
    pub fn paths_of(&self, ino: u64) -> Vec<PathBuf> {
        self.inode_paths
            .get(&ino)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers `path` under `ino` and bumps its lookup count. Refuses to
    /// touch `ROOT` — that entry is seeded once at startup.
    pub fn remember_path(&mut self, ino: u64, path: PathBuf) {
        if ino == ROOT {
            log::warn!(
                target: "passthru_fuse::debug",
                "remember_path called with the reserved root inode, path={:?}",
                path
            );
            return;
        }
        let entry = self.inode_paths.entry(ino).or_insert_with(HashSet::new);
        Self::prune(entry);
        entry.insert(path);
        *self.lookup_count.entry(ino).or_insert(0) += 1;
    }

    /// Removes `path` from `ino`'s alias set; drops the inode entry if it
    /// becomes empty. Does not touch the lookup count.
    pub fn forget_path(&mut self, ino: u64, path: &Path) {
        if let Some(paths) = self.inode_paths.get_mut(&ino) {
            paths.remove(path);
            if paths.is_empty() {
                self.inode_paths.remove(&ino);
            }
        }
    }

    /// Applies a batch of kernel `forget(inode, nlookup)` pairs.
    pub fn forget(&mut self, entries: &[(u64, u64)]) {
        for &(ino, n) in entries {
            let count = match self.lookup_count.get_mut(&ino) {
                Some(count) => count,
                // Already dropped (e.g. forgotten a second time); the
                // original tolerates this rather than asserting.
                None => continue,
            };
            *count = count.saturating_sub(n);
            if *count == 0 {
                assert!(
                    !self.inode_fd.contains_key(&ino),
                    "forget on inode {} with an open fd",
                    ino
                );
                self.lookup_count.remove(&ino);
                self.inode_paths.remove(&ino);
            }
        }
    }

    pub fn fd_for_inode(&self, ino: u64) -> Option<RawFd> {
        self.inode_fd.get(&ino).copied()
    }

    /// Opens `path`, or shares the already-tracked fd for `ino`. Returns the
    /// fd and whether a fresh host `open` was actually performed.
    pub fn open_fd(&mut self, ino: u64, path: &Path, flags: i32) -> Result<(RawFd, bool)> {
        if let Some(&fd) = self.inode_fd.get(&ino) {
            *self.fd_open_count.entry(fd).or_insert(0) += 1;
            return Ok((fd, false));
        }
        let fd = sys::open(path, flags)?;
        self.install_fd(ino, fd);
        Ok((fd, true))
    }

    /// Installs an fd obtained outside of `open_fd` (namely `create`, which
    /// opens the file itself to pick up `O_CREAT`/`O_TRUNC`).
    pub fn install_fd(&mut self, ino: u64, fd: RawFd) {
        self.inode_fd.insert(ino, fd);
        self.fd_inode.insert(fd, ino);
        self.fd_open_count.insert(fd, 1);
    }

    /// Decrements the fd's open count; closes and untracks it at zero.
    /// Returns whether the fd was actually closed.
    pub fn release_fd(&mut self, fd: RawFd) -> Result<bool> {
        let count = self
            .fd_open_count
            .get_mut(&fd)
            .ok_or_else(|| Error::from_errno(libc::EBADF))?;
        if *count > 1 {
            *count -= 1;
            return Ok(false);
        }
        self.fd_open_count.remove(&fd);
        if let Some(ino) = self.fd_inode.remove(&fd) {
            self.inode_fd.remove(&ino);
        }
        sys::close(fd)?;
        Ok(true)
    }

    /// If `ino` is currently tracked, swaps its alias from `old` to `new`
    /// without touching the lookup count, per the rename contract.
    pub fn rename_tracked(&mut self, old: &Path, new: &Path, ino: u64) {
        if let Some(paths) = self.inode_paths.get_mut(&ino) {
            paths.remove(old);
            paths.insert(new.to_path_buf());
        }
    }

    pub fn is_tracked(&self, ino: u64) -> bool {
        self.inode_paths.contains_key(&ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn registry_with_tempdir() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path().to_path_buf(), PathBuf::from("/does/not/exist"));
        (dir, reg)
    }

    #[test]
    fn root_is_seeded_and_protected_from_remember() {
        let (dir, mut reg) = registry_with_tempdir();
        assert_eq!(reg.inode_to_path(ROOT).unwrap(), dir.path());
        // remember_path on ROOT must be a no-op, not a panic or corruption.
        reg.remember_path(ROOT, dir.path().join("bogus"));
        assert_eq!(reg.inode_to_path(ROOT).unwrap(), dir.path());
    }

    #[test]
    fn stale_paths_are_pruned_on_read() {
        let (dir, mut reg) = registry_with_tempdir();
        let file = dir.path().join("a");
        fs::write(&file, b"hi").unwrap();
        reg.remember_path(42, file.clone());
        fs::remove_file(&file).unwrap();
        let err = reg.inode_to_path(42).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(!reg.is_tracked(42));
    }

    #[test]
    fn forget_drains_lookup_count_before_dropping() {
        let (dir, mut reg) = registry_with_tempdir();
        let file = dir.path().join("a");
        fs::write(&file, b"hi").unwrap();
        reg.remember_path(7, file.clone());
        reg.remember_path(7, file.clone());
        assert!(reg.is_tracked(7));
        reg.forget(&[(7, 1)]);
        assert!(reg.is_tracked(7));
        reg.forget(&[(7, 1)]);
        assert!(!reg.is_tracked(7));
    }

    #[test]
    #[should_panic(expected = "open fd")]
    fn forget_asserts_when_fd_still_open() {
        let (dir, mut reg) = registry_with_tempdir();
        let file = dir.path().join("a");
        fs::write(&file, b"hi").unwrap();
        reg.remember_path(9, file.clone());
        let (_fd, opened) = reg.open_fd(9, &file, libc::O_RDONLY).unwrap();
        assert!(opened);
        reg.forget(&[(9, 1)]);
    }

    #[test]
    fn is_mount_point_only_matches_the_exact_mount_path() {
        let dir = tempfile::tempdir().unwrap();
        let mountpoint = dir.path().join("mnt");
        let reg = Registry::new(dir.path().to_path_buf(), mountpoint.clone());
        assert!(reg.is_mount_point(&mountpoint));
        assert!(!reg.is_mount_point(&dir.path().join("mnt2")));
        assert!(!reg.is_mount_point(&mountpoint.join("child")));
    }

    #[test]
    fn fd_is_shared_across_repeat_opens_and_closed_on_last_release() {
        let (dir, mut reg) = registry_with_tempdir();
        let file = dir.path().join("a");
        fs::write(&file, b"hi").unwrap();
        let (fd1, opened1) = reg.open_fd(100, &file, libc::O_RDONLY).unwrap();
        assert!(opened1);
        let (fd2, opened2) = reg.open_fd(100, &file, libc::O_RDONLY).unwrap();
        assert!(!opened2);
        assert_eq!(fd1, fd2);

        assert!(!reg.release_fd(fd1).unwrap());
        assert!(reg.release_fd(fd1).unwrap());
        assert!(reg.fd_for_inode(100).is_none());
    }
}
