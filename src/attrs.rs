//! Converts host `stat` results into the protocol's attribute record and
//! fabricates synthetic inode numbers when the underlying host inode
//! collides with the reserved root inode.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};
use rand::Rng;

use crate::error::Result;
use crate::registry::ROOT;
use crate::sys;

/// Range synthetic inode numbers are drawn from; never collides with `ROOT`.
pub const SYNTHETIC_INO_RANGE: std::ops::Range<u64> = 2_000_000..3_000_000;

/// No attribute or entry caching: the kernel is told to re-validate on
/// every lookup.
pub const NO_CACHE: Duration = Duration::ZERO;

fn system_time(secs: i64, nsec: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn mode_to_file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFREG as u32 => FileType::RegularFile,
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        other => {
            log::warn!(target: "passthru_fuse::debug", "unrecognized host mode bits {:o}, treating as regular file", other);
            FileType::RegularFile
        }
    }
}

const FIXED_BLKSIZE: u64 = 512;

fn stat_to_attr(st: &libc::stat, substitute_ino: bool) -> FileAttr {
    let mut ino = st.st_ino;
    if ino == 1 && substitute_ino {
        ino = rand::thread_rng().gen_range(SYNTHETIC_INO_RANGE);
    }

    let size = st.st_size as u64;
    let blocks = (size + FIXED_BLKSIZE - 1) / FIXED_BLKSIZE;
    let ctime = system_time(st.st_ctime, st.st_ctime_nsec);

    FileAttr {
        ino,
        size,
        blocks,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime,
        // Linux exposes no birth time through stat(2); mirror ctime, the
        // same fallback the teacher used for freshly synthesized nodes.
        crtime: ctime,
        kind: mode_to_file_type(st.st_mode as u32),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        flags: 0,
        blksize: FIXED_BLKSIZE as u32,
    }
}

/// Attribute lookup via the host path (`lstat`). `ino == 1` is only ever
/// left alone when `path` is exactly the host root `/`.
pub fn attr_from_path(path: &Path) -> Result<FileAttr> {
    let st = sys::lstat(path)?;
    let substitute = path != Path::new("/");
    Ok(stat_to_attr(&st, substitute))
}

/// Attribute lookup via an already-open fd (`fstat`). There is no path to
/// compare against the host root, so a colliding inode is always replaced,
/// matching the original's `path=None` branch.
pub fn attr_from_fd(fd: RawFd) -> Result<FileAttr> {
    let st = sys::fstat(fd)?;
    Ok(stat_to_attr(&st, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_inode_survives_on_host_root() {
        let attr = attr_from_path(Path::new("/")).unwrap();
        assert_eq!(attr.ino, 1);
    }

    #[test]
    fn non_root_ino_one_is_never_reported() {
        // We can't force a host ino==1 collision from a unit test (that ino
        // belongs to the real filesystem root), but we can exercise the
        // substitution function directly for the boundary it guards.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_ino = 1;
        st.st_mode = libc::S_IFREG as libc::mode_t | 0o644;
        let attr = stat_to_attr(&st, true);
        assert!(SYNTHETIC_INO_RANGE.contains(&attr.ino));
        assert_ne!(attr.ino, ROOT);
    }

    #[test]
    fn regular_file_blocks_round_up() {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_ino = 42;
        st.st_size = 513;
        st.st_mode = libc::S_IFREG as libc::mode_t | 0o644;
        let attr = stat_to_attr(&st, true);
        assert_eq!(attr.blksize, 512);
        assert_eq!(attr.blocks, 2);
    }
}
