//! Kernel adapter: implements `fuser::Filesystem` by forwarding every call
//! to [`MailFs`] and translating results into FUSE replies.
//!
//! All real work happens in `MailFs`, which blocks on the tokio runtime with
//! a per-call deadline. This layer only converts names, times and attributes.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};

use crate::fuse::inode::{ms_to_system_time, NodeAttr, NodeType, BLOCK_SIZE};
use crate::fuse::{FsError, MailFs, RenameMode, SetAttr};
use crate::store::MailStore;

/// renameat2(2) flags as passed through by the kernel.
const RENAME_NOREPLACE: u32 = 1;
const RENAME_EXCHANGE: u32 = 2;

/// TTL for attribute/entry replies on files and symlinks.
const FILE_TTL: Duration = Duration::from_secs(1);

/// Directories are never cached by the kernel so listings stay as fresh as
/// the snapshot allows.
const DIR_TTL: Duration = Duration::from_secs(0);

fn ttl_for(kind: FileType) -> Duration {
    if kind == FileType::Directory {
        DIR_TTL
    } else {
        FILE_TTL
    }
}

/// Atomic exchange and whiteouts have no equivalent in the store.
fn rename_mode(flags: u32) -> Result<RenameMode, FsError> {
    match flags {
        0 => Ok(RenameMode::Replace),
        RENAME_NOREPLACE => Ok(RenameMode::NoReplace),
        RENAME_EXCHANGE => Err(FsError::InvalidArgument(
            "RENAME_EXCHANGE is not supported".to_string(),
        )),
        other => Err(FsError::InvalidArgument(format!(
            "unsupported rename flags {:#x}",
            other
        ))),
    }
}

fn file_type(kind: NodeType) -> FileType {
    match kind {
        NodeType::File => FileType::RegularFile,
        NodeType::Directory => FileType::Directory,
        NodeType::Symlink => FileType::Symlink,
    }
}

fn to_system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn utf8(name: &OsStr) -> Result<&str, FsError> {
    name.to_str()
        .ok_or_else(|| FsError::InvalidArgument(format!("non-UTF-8 name {name:?}")))
}

/// Log and convert an error to its errno. Missing entries are routine
/// (shells look up missing names constantly) and stay at debug level.
fn errno_of(op: &str, e: &FsError) -> i32 {
    let code = e.errno();
    if code == libc::ENOENT {
        log::debug!("{op}: {e}");
    } else {
        log::warn!("{op} failed: {e}");
    }
    code
}

pub struct FuseAdapter<S: MailStore> {
    fs: Arc<MailFs<S>>,
    uid: u32,
    gid: u32,
}

impl<S: MailStore> FuseAdapter<S> {
    pub fn new(fs: Arc<MailFs<S>>) -> Self {
        Self { fs, uid: 0, gid: 0 }
    }

    fn file_attr(&self, attr: &NodeAttr) -> FileAttr {
        let mtime = ms_to_system_time(attr.mtime_ms);
        let ctime = ms_to_system_time(attr.ctime_ms);
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: mtime,
            mtime,
            ctime,
            crtime: ctime,
            kind: file_type(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn reply_entry(&self, op: &str, result: Result<NodeAttr, FsError>, reply: ReplyEntry) {
        match result {
            Ok(attr) => {
                let attr = self.file_attr(&attr);
                reply.entry(&ttl_for(attr.kind), &attr, 0);
            }
            Err(e) => reply.error(errno_of(op, &e)),
        }
    }

    fn reply_empty(op: &str, result: Result<(), FsError>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(op, &e)),
        }
    }
}

impl<S: MailStore> Filesystem for FuseAdapter<S> {
    /// The root is resolved before the event loop starts; nothing remote
    /// happens here.
    fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        self.uid = req.uid();
        self.gid = req.gid();
        log::info!("mailfs init (uid {}, gid {})", self.uid, self.gid);
        Ok(())
    }

    /// Flush what is still open or parked and drop cached plaintext.
    fn destroy(&mut self) {
        if let Err(e) = self.fs.shutdown() {
            log::warn!("mailfs destroyed with store errors: {}", e);
        } else {
            log::info!("mailfs destroyed: caches cleared");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match utf8(name) {
            Ok(n) => n,
            Err(e) => return reply.error(errno_of("lookup", &e)),
        };
        let result = match name {
            "." => self.fs.getattr(parent),
            ".." => self.fs.getattr(self.fs.parent_ino(parent)),
            _ => self.fs.lookup(parent, name),
        };
        self.reply_entry("lookup", result, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(attr) => {
                let attr = self.file_attr(&attr);
                reply.attr(&ttl_for(attr.kind), &attr);
            }
            Err(e) => reply.error(errno_of("getattr", &e)),
        }
    }

    /// Handles chmod, truncate and utimens. Ownership changes are ignored:
    /// every node belongs to the mounting user.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode: mode.map(|m| m & 0o7777),
            size,
            mtime_ms: mtime.map(|t| system_time_ms(to_system_time(t))),
        };
        match self.fs.setattr(ino, changes, fh) {
            Ok(attr) => {
                let attr = self.file_attr(&attr);
                reply.attr(&ttl_for(attr.kind), &attr);
            }
            Err(e) => reply.error(errno_of("setattr", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let children = match self.fs.readdir(ino) {
            Ok(c) => c,
            Err(e) => return reply.error(errno_of("readdir", &e)),
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((self.fs.parent_ino(ino), FileType::Directory, "..".to_string()));
        entries.extend(
            children
                .into_iter()
                .map(|c| (c.ino, file_type(c.kind), c.name)),
        );

        for (i, (child_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            // Offset of the *next* entry; a full buffer ends this batch.
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.getattr(ino) {
            Ok(attr) if attr.kind == NodeType::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(errno_of("opendir", &e)),
        }
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

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno_of("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.fs.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_of("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.fs.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno_of("write", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = utf8(name).and_then(|name| {
            self.fs
                .create(parent, name, mode & !umask & 0o7777, flags)
        });
        match result {
            Ok((attr, fh)) => {
                let attr = self.file_attr(&attr);
                reply.created(&FILE_TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(errno_of("create", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result =
            utf8(name).and_then(|name| self.fs.mkdir(parent, name, mode & !umask & 0o7777));
        self.reply_entry("mkdir", result, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = utf8(link_name).and_then(|name| {
            let target = utf8(target.as_os_str())?;
            self.fs.symlink(parent, name, target)
        });
        self.reply_entry("symlink", result, reply);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno_of("readlink", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = utf8(name).and_then(|name| self.fs.unlink(parent, name));
        Self::reply_empty("unlink", result, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = utf8(name).and_then(|name| self.fs.rmdir(parent, name));
        Self::reply_empty("rmdir", result, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        log::debug!("rename: {name:?} (parent {parent}) -> {newname:?} (parent {newparent}, flags {flags:#x})");
        let result = rename_mode(flags).and_then(|mode| {
            let name = utf8(name)?;
            let newname = utf8(newname)?;
            self.fs.rename(parent, name, newparent, newname, mode)
        });
        Self::reply_empty("rename", result, reply);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        Self::reply_empty("flush", self.fs.flush(fh), reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        Self::reply_empty("fsync", self.fs.flush(fh), reply);
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
        Self::reply_empty("release", self.fs.release(fh), reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.blocks,
            stats.blocks_free,
            stats.blocks_free,
            stats.files,
            u64::MAX - stats.files,
            stats.block_size,
            stats.name_max,
            stats.block_size,
        );
    }

    /// Owner-only access based on the permission bits.
    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let attr = match self.fs.getattr(ino) {
            Ok(a) => a,
            Err(e) => return reply.error(errno_of("access", &e)),
        };
        if mask == libc::F_OK {
            return reply.ok();
        }
        if req.uid() != self.uid {
            return reply.error(libc::EACCES);
        }

        let owner_bits = (attr.perm >> 6) & 0o7;
        let denied = (mask & libc::R_OK != 0 && owner_bits & 0o4 == 0)
            || (mask & libc::W_OK != 0 && owner_bits & 0o2 == 0)
            || (mask & libc::X_OK != 0 && owner_bits & 0o1 == 0);
        if denied {
            reply.error(libc::EACCES);
        } else {
            reply.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_mapping() {
        assert_eq!(file_type(NodeType::File), FileType::RegularFile);
        assert_eq!(file_type(NodeType::Directory), FileType::Directory);
        assert_eq!(file_type(NodeType::Symlink), FileType::Symlink);
        assert_eq!(ttl_for(FileType::Directory), DIR_TTL);
        assert_eq!(ttl_for(FileType::Symlink), FILE_TTL);
    }

    #[test]
    fn test_time_conversion() {
        let t = ms_to_system_time(1_700_000_000_123);
        assert_eq!(system_time_ms(to_system_time(TimeOrNow::SpecificTime(t))), 1_700_000_000_123);
        assert!(system_time_ms(to_system_time(TimeOrNow::Now)) > 1_700_000_000_000);
    }

    #[test]
    fn test_rename_flags() {
        assert_eq!(rename_mode(0).unwrap(), RenameMode::Replace);
        assert_eq!(rename_mode(RENAME_NOREPLACE).unwrap(), RenameMode::NoReplace);
        assert_eq!(rename_mode(RENAME_EXCHANGE).unwrap_err().errno(), libc::EINVAL);
        assert_eq!(rename_mode(4).unwrap_err().errno(), libc::EINVAL);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rename_flags_match_libc() {
        assert_eq!(RENAME_NOREPLACE, libc::RENAME_NOREPLACE);
        assert_eq!(RENAME_EXCHANGE, libc::RENAME_EXCHANGE);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_is_invalid() {
        use std::os::unix::ffi::OsStrExt;
        let bad = OsStr::from_bytes(&[0x66, 0xff, 0x6f]);
        let err = utf8(bad).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(utf8(OsStr::new("ok")).unwrap(), "ok");
    }
}
