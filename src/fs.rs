//! The dispatch shim and operation handlers: presents the `fuser::Filesystem`
//! trait to the transport and translates each kernel request into registry
//! lookups, host syscalls, and replies.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::SystemTime;

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow, FileAttr,
};
use libc::c_int;

use crate::attrs::{self, NO_CACHE};
use crate::error::Result;
use crate::registry::{Registry, ROOT};
use crate::stats::{self, AccessStats};
use crate::sys;

const ACCESS: &str = "passthru_fuse::access";
const DEBUG: &str = "passthru_fuse::debug";

pub struct PassthroughFs {
    registry: Registry,
    stats: AccessStats,
}

impl PassthroughFs {
    pub fn new(source_root: std::path::PathBuf, mountpoint: std::path::PathBuf) -> Self {
        PassthroughFs {
            registry: Registry::new(source_root, mountpoint),
            stats: AccessStats::new(),
        }
    }

    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }

    /// `attrs::attr_from_path`, plus the self-exclusion guard: stat-ing the
    /// mount point itself always fails with `ENOENT`. Every handler that
    /// stats a freshly-joined path goes through this, mirroring how the
    /// original funnels every path stat through its shared `_getattr`.
    fn stat_path(&self, path: &Path) -> Result<FileAttr> {
        if self.registry.is_mount_point(path) {
            return Err(crate::error::Error::from_errno(libc::ENOENT));
        }
        attrs::attr_from_path(path)
    }

    /// getattr's fd-or-path preference, reused by setattr and link.
    fn read_attr(&mut self, ino: u64) -> Result<FileAttr> {
        if let Some(fd) = self.registry.fd_for_inode(ino) {
            attrs::attr_from_fd(fd)
        } else {
            let path = self.registry.inode_to_path(ino)?;
            self.stat_path(&path)
        }
    }

    fn apply_setattr(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<()> {
        let path = match fh {
            Some(_) => None,
            None => Some(self.registry.inode_to_path(ino)?),
        };
        let fd = fh.map(|fh| fh as RawFd);

        if let Some(size) = size {
            match fd {
                Some(fd) => sys::ftruncate(fd, size)?,
                None => sys::truncate(path.as_deref().unwrap(), size)?,
            }
        }
        if let Some(mode) = mode {
            let mode = mode & 0o7777;
            match fd {
                Some(fd) => sys::fchmod(fd, mode)?,
                None => sys::chmod(path.as_deref().unwrap(), mode)?,
            }
        }
        if uid.is_some() || gid.is_some() {
            // -1 leaves the corresponding id unchanged, so setting only one
            // of uid/gid never disturbs the other.
            let u = uid.map(|v| v as i32).unwrap_or(-1);
            let g = gid.map(|v| v as i32).unwrap_or(-1);
            match fd {
                Some(fd) => sys::fchown(fd, u, g)?,
                None => sys::lchown(path.as_deref().unwrap(), u, g)?,
            }
        }

        match (atime, mtime) {
            (None, None) => {}
            (Some(a), Some(m)) => {
                self.apply_utime(fd, path.as_deref(), time_or_now_ns(a), time_or_now_ns(m))?;
            }
            (Some(a), None) => {
                let (_, cur_mtime) = self.read_times(fd, path.as_deref())?;
                self.apply_utime(fd, path.as_deref(), time_or_now_ns(a), cur_mtime)?;
            }
            (None, Some(m)) => {
                let (cur_atime, _) = self.read_times(fd, path.as_deref())?;
                self.apply_utime(fd, path.as_deref(), cur_atime, time_or_now_ns(m))?;
            }
        }

        Ok(())
    }

    fn read_times(&self, fd: Option<RawFd>, path: Option<&Path>) -> Result<(i64, i64)> {
        let st = match fd {
            Some(fd) => sys::fstat(fd)?,
            None => sys::lstat(path.unwrap())?,
        };
        Ok((
            st.st_atime * 1_000_000_000 + st.st_atime_nsec,
            st.st_mtime * 1_000_000_000 + st.st_mtime_nsec,
        ))
    }

    fn apply_utime(
        &self,
        fd: Option<RawFd>,
        path: Option<&Path>,
        atime_ns: i64,
        mtime_ns: i64,
    ) -> Result<()> {
        match fd {
            Some(fd) => sys::futimens(fd, atime_ns, mtime_ns),
            None => sys::utimens_nofollow(path.unwrap(), atime_ns, mtime_ns),
        }
    }
}

fn time_or_now_ns(t: TimeOrNow) -> i64 {
    let st = match t {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    };
    match st.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

impl Filesystem for PassthroughFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        log::debug!(
            target: DEBUG,
            "shutting down: {} read-only, {} write-only, {} read-write paths observed",
            self.stats.read_only().len(),
            self.stats.write_only().len(),
            self.stats.read_write().len(),
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.registry.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let path = parent_path.join(name);
        log::debug!(target: DEBUG, "lookup parent={} name={:?} path={:?}", parent, name, path);

        let attr = match self.stat_path(&path) {
            Ok(a) => a,
            Err(e) => return reply.error(e.errno()),
        };

        if name != OsStr::new(".") && name != OsStr::new("..") {
            self.registry.remember_path(attr.ino, path);
        }
        reply.entry(&NO_CACHE, &attr, 0);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.read_attr(ino) {
            Ok(attr) => reply.attr(&NO_CACHE, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if let Err(e) = self.apply_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            return reply.error(e.errno());
        }
        match self.read_attr(ino) {
            Ok(attr) => reply.attr(&NO_CACHE, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.registry.forget(&[(ino, nlookup)]);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match sys::readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.registry.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let path = parent_path.join(name);

        if let Err(e) = sys::mkdir(&path, mode & !umask) {
            return reply.error(e.errno());
        }
        if let Err(e) = sys::lchown(&path, req.uid() as i32, req.gid() as i32) {
            return reply.error(e.errno());
        }
        let attr = match self.stat_path(&path) {
            Ok(a) => a,
            Err(e) => return reply.error(e.errno()),
        };
        self.registry.remember_path(attr.ino, path.clone());
        log::info!(target: ACCESS, "MKDIR: {:?}", path);
        reply.entry(&NO_CACHE, &attr, 0);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.registry.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let path = parent_path.join(name);
        let attr = match self.stat_path(&path) {
            Ok(a) => a,
            Err(e) => return reply.error(e.errno()),
        };
        if let Err(e) = sys::rmdir(&path) {
            return reply.error(e.errno());
        }
        if self.registry.is_tracked(attr.ino) {
            self.registry.forget_path(attr.ino, &path);
        }
        log::info!(target: ACCESS, "RMDIR: {:?}", path);
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.registry.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let path = parent_path.join(link_name);

        if let Err(e) = sys::symlink(target, &path) {
            return reply.error(e.errno());
        }
        if let Err(e) = sys::lchown(&path, req.uid() as i32, req.gid() as i32) {
            return reply.error(e.errno());
        }
        let attr = match self.stat_path(&path) {
            Ok(a) => a,
            Err(e) => return reply.error(e.errno()),
        };
        self.registry.remember_path(attr.ino, path.clone());
        log::info!(target: ACCESS, "SYMLINK: {:?} -> {:?}", path, target);
        reply.entry(&NO_CACHE, &attr, 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let old_parent = match self.registry.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let new_parent = match self.registry.inode_to_path(newparent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let old_path = old_parent.join(name);
        let new_path = new_parent.join(newname);

        if let Err(e) = sys::rename(&old_path, &new_path) {
            return reply.error(e.errno());
        }
        log::info!(target: ACCESS, "RENAME: {:?} -> {:?}", old_path, new_path);

        let attr = match attrs::attr_from_path(&new_path) {
            Ok(a) => a,
            Err(e) => return reply.error(e.errno()),
        };
        if self.registry.is_tracked(attr.ino) {
            self.registry.rename_tracked(&old_path, &new_path, attr.ino);
        }
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
        reply: ReplyEntry,
    ) {
        let old_path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let new_parent_path = match self.registry.inode_to_path(new_parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let new_path = new_parent_path.join(new_name);

        if let Err(e) = sys::link(&old_path, &new_path) {
            return reply.error(e.errno());
        }
        self.registry.remember_path(ino, new_path.clone());
        log::info!(target: ACCESS, "LINK: {:?}", new_path);

        match self.read_attr(ino) {
            Ok(attr) => reply.entry(&NO_CACHE, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.registry.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let path = parent_path.join(name);
        let attr = match self.stat_path(&path) {
            Ok(a) => a,
            Err(e) => return reply.error(e.errno()),
        };
        if let Err(e) = sys::unlink(&path) {
            return reply.error(e.errno());
        }
        if self.registry.is_tracked(attr.ino) {
            self.registry.forget_path(attr.ino, &path);
        }
        log::info!(target: ACCESS, "UNLINK: {:?}", path);
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.registry.open_fd(ino, &path, flags) {
            Ok((fd, _)) => {
                self.stats.record(&path, stats::classify(flags));
                log::info!(target: ACCESS, "OPEN: {:?}", path);
                reply.opened(fd as u64, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_path = match self.registry.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let path = parent_path.join(name);
        let fd = match sys::open_mode(&path, flags | libc::O_CREAT | libc::O_TRUNC, mode) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e.errno()),
        };
        let attr = match attrs::attr_from_fd(fd) {
            Ok(a) => a,
            Err(e) => {
                let _ = sys::close(fd);
                return reply.error(e.errno());
            }
        };
        self.registry.remember_path(attr.ino, path.clone());
        self.registry.install_fd(attr.ino, fd);
        self.stats.record(&path, stats::classify(flags));
        log::info!(target: ACCESS, "CREATE: {:?}", path);
        reply.created(&NO_CACHE, &attr, 0, fd as u64, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        log::info!(target: ACCESS, "READ: {:?}", self.registry.paths_of(ino));
        match sys::pread(fh as RawFd, offset, size as usize) {
            Ok(buf) => reply.data(&buf),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        log::info!(target: ACCESS, "WRITE: {:?}", self.registry.paths_of(ino));
        match sys::pwrite(fh as RawFd, offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        log::debug!(target: DEBUG, "release fh={}", fh);
        match self.registry.release_fd(fh as RawFd) {
            Ok(closed) => {
                if closed {
                    log::info!(target: ACCESS, "RELEASE: fh={}", fh);
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        log::info!(target: ACCESS, "OPENDIR: {:?}", self.registry.paths_of(ino));
        reply.opened(ino, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir_path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let read_dir = match std::fs::read_dir(&dir_path) {
            Ok(rd) => rd,
            Err(e) => return reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        };

        // std::fs::read_dir never yields "." or "..", unlike the directory
        // stream the original iterates with pyfuse3.listdir.
        let mut entries = Vec::new();
        for dirent in read_dir.flatten() {
            let name = dirent.file_name();
            let child_path = dir_path.join(&name);
            if self.registry.is_mount_point(&child_path) {
                continue;
            }
            if let Ok(attr) = attrs::attr_from_path(&child_path) {
                entries.push((attr.ino, name, attr.kind, child_path));
            }
        }
        // Continuation cursor is the emitted ino, so the list must be
        // ordered by ino first; see the readdir offset scheme design note.
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (child_ino, name, kind, child_path) in entries {
            if child_ino <= offset as u64 {
                continue;
            }
            if reply.add(child_ino, child_ino as i64, kind, &name) {
                break;
            }
            self.registry.remember_path(child_ino, child_path);
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let root = match self.registry.inode_to_path(ROOT) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match sys::statvfs(&root) {
            Ok(st) => {
                let prefix_budget = root.as_os_str().len() as u64 + 1;
                let namemax = (st.f_namemax as u64).saturating_sub(prefix_budget);
                reply.statfs(
                    st.f_blocks,
                    st.f_bfree,
                    st.f_bavail,
                    st.f_files,
                    st.f_ffree,
                    st.f_bsize as u32,
                    namemax as u32,
                    st.f_frsize as u32,
                );
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match sys::setxattr(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match sys::getxattr(&path, name) {
            Ok(value) => reply_sized(reply, &value, size),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match sys::listxattr(&path) {
            Ok(names) => reply_sized(reply, &names, size),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.registry.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match sys::removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}

/// Shared getxattr/listxattr reply convention: `size == 0` asks for the
/// value length only, otherwise the buffer must fit or the call fails with
/// `ERANGE`.
fn reply_sized(reply: ReplyXattr, data: &[u8], size: u32) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() as u32 > size {
        reply.error(libc::ERANGE);
    } else {
        reply.data(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_path_refuses_the_mount_point_itself() {
        let source = tempfile::tempdir().unwrap();
        let mountpoint = source.path().join("mnt");
        let fs = PassthroughFs::new(source.path().to_path_buf(), mountpoint.clone());

        let err = fs.stat_path(&mountpoint).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn stat_path_succeeds_on_a_real_non_mount_entry() {
        let source = tempfile::tempdir().unwrap();
        let mountpoint = source.path().join("mnt");
        let file = source.path().join("a");
        std::fs::write(&file, b"hi").unwrap();
        let fs = PassthroughFs::new(source.path().to_path_buf(), mountpoint);

        let attr = fs.stat_path(&file).unwrap();
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
    }
}
