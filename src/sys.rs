//! Thin wrappers over the host syscalls the operation handlers translate
//! kernel requests into. Every failure is surfaced as `Error::last_os_error`
//! so callers can propagate the underlying errno unchanged, per spec.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub fn to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::from_errno(libc::EINVAL))
}

fn name_to_cstring(name: &OsStr) -> Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| Error::from_errno(libc::EINVAL))
}

fn zeroed_stat() -> libc::stat {
    unsafe { std::mem::zeroed() }
}

pub fn lstat(path: &Path) -> Result<libc::stat> {
    let c_path = to_cstring(path)?;
    let mut st = zeroed_stat();
    let rc = unsafe { libc::lstat(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(st)
}

pub fn fstat(fd: RawFd) -> Result<libc::stat> {
    let mut st = zeroed_stat();
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(st)
}

pub fn statvfs(path: &Path) -> Result<libc::statvfs> {
    let c_path = to_cstring(path)?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(st)
}

pub fn open(path: &Path, flags: i32) -> Result<RawFd> {
    let c_path = to_cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

pub fn open_mode(path: &Path, flags: i32, mode: u32) -> Result<RawFd> {
    let c_path = to_cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode as libc::mode_t) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

pub fn close(fd: RawFd) -> Result<()> {
    let rc = unsafe { libc::close(fd) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn pread(fd: RawFd, offset: i64, len: usize) -> Result<Vec<u8>> {
    if unsafe { libc::lseek(fd, offset, libc::SEEK_SET) } < 0 {
        return Err(Error::last_os_error());
    }
    let mut buf = vec![0u8; len];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, len) };
    if n < 0 {
        return Err(Error::last_os_error());
    }
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn pwrite(fd: RawFd, offset: i64, data: &[u8]) -> Result<u32> {
    if unsafe { libc::lseek(fd, offset, libc::SEEK_SET) } < 0 {
        return Err(Error::last_os_error());
    }
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(Error::last_os_error());
    }
    Ok(n as u32)
}

pub fn mkdir(path: &Path, mode: u32) -> Result<()> {
    let c_path = to_cstring(path)?;
    let rc = unsafe { libc::mkdir(c_path.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn rmdir(path: &Path) -> Result<()> {
    let c_path = to_cstring(path)?;
    let rc = unsafe { libc::rmdir(c_path.as_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn unlink(path: &Path) -> Result<()> {
    let c_path = to_cstring(path)?;
    let rc = unsafe { libc::unlink(c_path.as_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn rename(old: &Path, new: &Path) -> Result<()> {
    let c_old = to_cstring(old)?;
    let c_new = to_cstring(new)?;
    let rc = unsafe { libc::rename(c_old.as_ptr(), c_new.as_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Hardlink without following a symlink source, mirroring `os.link(...,
/// follow_symlinks=False)` in the original.
pub fn link(existing: &Path, new: &Path) -> Result<()> {
    let c_existing = to_cstring(existing)?;
    let c_new = to_cstring(new)?;
    let rc = unsafe { libc::link(c_existing.as_ptr(), c_new.as_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn symlink(target: &Path, link_path: &Path) -> Result<()> {
    let c_target = to_cstring(target)?;
    let c_link = to_cstring(link_path)?;
    let rc = unsafe { libc::symlink(c_target.as_ptr(), c_link.as_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn readlink(path: &Path) -> Result<PathBuf> {
    let c_path = to_cstring(path)?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let n = unsafe {
        libc::readlink(
            c_path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(Error::last_os_error());
    }
    buf.truncate(n as usize);
    Ok(PathBuf::from(OsString::from_vec(buf)))
}

pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    let c_path = to_cstring(path)?;
    let rc = unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn fchmod(fd: RawFd, mode: u32) -> Result<()> {
    let rc = unsafe { libc::fchmod(fd, mode as libc::mode_t) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Chown without following symlinks, mirroring `follow_symlinks=False`.
/// Passing `-1` for either field leaves that id unchanged.
pub fn lchown(path: &Path, uid: i32, gid: i32) -> Result<()> {
    let c_path = to_cstring(path)?;
    let rc = unsafe {
        libc::lchown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t)
    };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn fchown(fd: RawFd, uid: i32, gid: i32) -> Result<()> {
    let rc = unsafe { libc::fchown(fd, uid as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn to_timespec(ns: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as i64,
    }
}

/// Sets atime/mtime on a path without following a trailing symlink.
pub fn utimens_nofollow(path: &Path, atime_ns: i64, mtime_ns: i64) -> Result<()> {
    let c_path = to_cstring(path)?;
    let times = [to_timespec(atime_ns), to_timespec(mtime_ns)];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn futimens(fd: RawFd, atime_ns: i64, mtime_ns: i64) -> Result<()> {
    let times = [to_timespec(atime_ns), to_timespec(mtime_ns)];
    let rc = unsafe { libc::futimens(fd, times.as_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn truncate(path: &Path, size: u64) -> Result<()> {
    let c_path = to_cstring(path)?;
    let rc = unsafe { libc::truncate(c_path.as_ptr(), size as libc::off_t) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn ftruncate(fd: RawFd, size: u64) -> Result<()> {
    let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn getxattr(path: &Path, name: &OsStr) -> Result<Vec<u8>> {
    let c_path = to_cstring(path)?;
    let c_name = name_to_cstring(name)?;
    let want = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            std::ptr::null_mut(),
            0,
        )
    };
    if want < 0 {
        return Err(Error::last_os_error());
    }
    let mut buf = vec![0u8; want as usize];
    if want == 0 {
        return Ok(buf);
    }
    let got = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if got < 0 {
        return Err(Error::last_os_error());
    }
    buf.truncate(got as usize);
    Ok(buf)
}

pub fn setxattr(path: &Path, name: &OsStr, value: &[u8]) -> Result<()> {
    let c_path = to_cstring(path)?;
    let c_name = name_to_cstring(name)?;
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn removexattr(path: &Path, name: &OsStr) -> Result<()> {
    let c_path = to_cstring(path)?;
    let c_name = name_to_cstring(name)?;
    let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Returns the raw NUL-separated attribute name list the kernel expects.
pub fn listxattr(path: &Path) -> Result<Vec<u8>> {
    let c_path = to_cstring(path)?;
    let want = unsafe { libc::listxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if want < 0 {
        return Err(Error::last_os_error());
    }
    let mut buf = vec![0u8; want as usize];
    if want == 0 {
        return Ok(buf);
    }
    let got = unsafe {
        libc::listxattr(
            c_path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if got < 0 {
        return Err(Error::last_os_error());
    }
    buf.truncate(got as usize);
    Ok(buf)
}
