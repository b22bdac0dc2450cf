use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    consts::FOPEN_DIRECT_IO, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};

use crate::fs::{FileInfo, FileTable};

const TTL: Duration = Duration::ZERO;

/// Adapter between the kernel callback surface and the file table. The
/// table speaks names; the kernel speaks inodes, so this keeps the mapping.
pub struct PingFs {
    table: FileTable,
    uid: u32,
    gid: u32,
    inodes: HashMap<u64, String>,
    by_name: HashMap<String, u64>,
    next_ino: u64,
}

impl PingFs {
    pub fn new(table: FileTable, uid: u32, gid: u32) -> PingFs {
        PingFs {
            table,
            uid,
            gid,
            inodes: HashMap::new(),
            by_name: HashMap::new(),
            next_ino: FUSE_ROOT_ID + 1,
        }
    }

    fn full_name(name: &OsStr) -> Option<String> {
        name.to_str().map(|n| format!("/{}", n))
    }

    fn name_of(&self, ino: u64) -> Option<String> {
        self.inodes.get(&ino).cloned()
    }

    fn attr(&self, ino: u64, info: &FileInfo) -> FileAttr {
        FileAttr {
            ino,
            size: info.size,
            blocks: (info.size + 511) / 512,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: (info.mode & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn root_attr(&self) -> FileAttr {
        FileAttr {
            ino: FUSE_ROOT_ID,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o775,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for PingFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let full = match Self::full_name(name) {
            Some(full) => full,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match (self.by_name.get(&full), self.table.getattr(&full)) {
            (Some(&ino), Ok(info)) => reply.entry(&TTL, &self.attr(ino, &info), 0),
            _ => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == FUSE_ROOT_ID {
            reply.attr(&TTL, &self.root_attr());
            return;
        }
        match self.name_of(ino).map(|name| self.table.getattr(&name)) {
            Some(Ok(info)) => reply.attr(&TTL, &self.attr(ino, &info)),
            Some(Err(err)) => reply.error(err.errno()),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let name = match self.name_of(ino) {
            Some(name) => name,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        if let Some(mode) = mode {
            if let Err(err) = self.table.chmod(&name, mode) {
                reply.error(err.errno());
                return;
            }
        }
        if let Some(size) = size {
            if let Err(err) = self.table.truncate(&name, size) {
                reply.error(err.errno());
                return;
            }
        }
        // Timestamp updates are accepted and forgotten; times stay zero.
        if let Err(err) = self.table.utimens(&name) {
            reply.error(err.errno());
            return;
        }

        match self.table.getattr(&name) {
            Ok(info) => reply.attr(&TTL, &self.attr(ino, &info)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let full = match Self::full_name(name) {
            Some(full) => full,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        let mode = mode & !(umask & 0o7777);
        if let Err(err) = self.table.mknod(&full, mode) {
            reply.error(err.errno());
            return;
        }

        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, full.clone());
        self.by_name.insert(full.clone(), ino);

        match self.table.getattr(&full) {
            Ok(info) => reply.entry(&TTL, &self.attr(ino, &info), 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let full = match Self::full_name(name) {
            Some(full) => full,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.table.unlink(&full) {
            Ok(()) => {
                if let Some(ino) = self.by_name.remove(&full) {
                    self.inodes.remove(&ino);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
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
        if parent != FUSE_ROOT_ID || newparent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let (old, new) = match (Self::full_name(name), Self::full_name(newname)) {
            (Some(old), Some(new)) => (old, new),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.table.rename(&old, &new) {
            Ok(()) => {
                if let Some(target_ino) = self.by_name.remove(&new) {
                    self.inodes.remove(&target_ino);
                }
                if let Some(ino) = self.by_name.remove(&old) {
                    self.inodes.insert(ino, new.clone());
                    self.by_name.insert(new, ino);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if ino != FUSE_ROOT_ID && !self.inodes.contains_key(&ino) {
            reply.error(libc::ENOENT);
            return;
        }
        // Direct I/O keeps partial reads and writes visible to the daemon.
        reply.opened(0, FOPEN_DIRECT_IO);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let name = match self.name_of(ino) {
            Some(name) => name,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.table.read(&name, size as usize, offset as u64) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let name = match self.name_of(ino) {
            Some(name) => name,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.table.write(&name, data, offset as u64) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
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
        if ino != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (FUSE_ROOT_ID, FileType::Directory, ".".to_string()),
            (FUSE_ROOT_ID, FileType::Directory, "..".to_string()),
        ];
        for name in self.table.readdir() {
            if let Some(&file_ino) = self.by_name.get(&name) {
                // Skip the leading '/' in the stored name.
                entries.push((file_ino, FileType::RegularFile, name[1..].to_string()));
            }
        }

        for (i, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Mount in the foreground on the calling thread; the session is
/// single-threaded, which is what serialises the file table.
pub fn mount(fs: PingFs, mountpoint: &Path) -> std::io::Result<()> {
    let options = [
        MountOption::FSName("pingfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AllowOther,
    ];
    fuser::mount2(fs, mountpoint, &options)
}
