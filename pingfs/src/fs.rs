use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use crate::chunk::{Chunk, ChunkDirectory, IoError, CHUNK_SIZE};
use crate::host::Registry;
use crate::net::Transport;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("only regular files are supported")]
    NotSupported,
    #[error("chunk reply timed out")]
    TimedOut,
    #[error("chunk busy")]
    Busy,
    #[error("out of chunk identifiers")]
    NoSpace,
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::TimedOut => libc::EIO,
            FsError::Busy => libc::EBUSY,
            FsError::NoSpace => libc::ENOMEM,
        }
    }
}

impl From<IoError> for FsError {
    fn from(err: IoError) -> FsError {
        match err {
            IoError::Lost => FsError::TimedOut,
            IoError::Busy => FsError::Busy,
        }
    }
}

#[derive(Debug)]
pub struct FileInfo {
    pub mode: u32,
    pub size: u64,
}

struct FsFile {
    mode: u32,
    chunks: Vec<Arc<Chunk>>,
}

impl FsFile {
    fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }
}

/// The flat root directory: names to ordered chunk chains. Driven by a
/// single kernel thread, so operations never overlap.
pub struct FileTable {
    files: BTreeMap<String, FsFile>,
    directory: Arc<ChunkDirectory>,
    hosts: Arc<Registry>,
    net: Arc<dyn Transport>,
    timeout: Duration,
}

impl FileTable {
    pub fn new(
        directory: Arc<ChunkDirectory>,
        hosts: Arc<Registry>,
        net: Arc<dyn Transport>,
        timeout: Duration,
    ) -> FileTable {
        FileTable {
            files: BTreeMap::new(),
            directory,
            hosts,
            net,
            timeout,
        }
    }

    pub fn mknod(&mut self, name: &str, mode: u32) -> Result<(), FsError> {
        if mode & libc::S_IFMT != libc::S_IFREG {
            return Err(FsError::NotSupported);
        }
        if self.files.contains_key(name) {
            return Err(FsError::Exists);
        }
        self.files.insert(
            name.to_string(),
            FsFile {
                mode,
                chunks: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn unlink(&mut self, name: &str) -> Result<(), FsError> {
        let file = self.files.remove(name).ok_or(FsError::NotFound)?;
        for chunk in file.chunks {
            self.directory.remove(chunk.id);
        }
        Ok(())
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), FsError> {
        if !self.files.contains_key(old) {
            return Err(FsError::NotFound);
        }
        if old == new {
            return Ok(());
        }
        // An existing target is replaced, POSIX-style; its chunks must
        // leave the directory so their echoes die out.
        if self.files.contains_key(new) {
            self.unlink(new)?;
        }
        let file = self.files.remove(old).ok_or(FsError::NotFound)?;
        self.files.insert(new.to_string(), file);
        Ok(())
    }

    pub fn chmod(&mut self, name: &str, mode: u32) -> Result<(), FsError> {
        let file = self.files.get_mut(name).ok_or(FsError::NotFound)?;
        file.mode = (file.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
        Ok(())
    }

    /// Timestamps are fixed at zero; accepting the call keeps `touch` happy.
    pub fn utimens(&mut self, name: &str) -> Result<(), FsError> {
        if !self.files.contains_key(name) {
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    pub fn getattr(&self, name: &str) -> Result<FileInfo, FsError> {
        let file = self.files.get(name).ok_or(FsError::NotFound)?;
        Ok(FileInfo {
            mode: file.mode,
            size: file.size(),
        })
    }

    pub fn readdir(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Write at most one chunk's worth of `buf` at `offset`; the kernel
    /// calls again for the rest. Returns the number of bytes consumed.
    pub fn write(&mut self, name: &str, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        let timeout = self.timeout;
        let file = self.files.get_mut(name).ok_or(FsError::NotFound)?;
        if buf.is_empty() {
            return Ok(0);
        }

        // A chunk is the target when the offset falls inside it, or sits at
        // the end of a final chunk that still has room to grow.
        let mut pos = 0u64;
        let mut target = None;
        for chunk in &file.chunks {
            let len = chunk.len();
            let end = pos + len as u64;
            if end > offset || (len < CHUNK_SIZE && end == offset) {
                target = Some((chunk.clone(), (offset - pos) as usize));
                break;
            }
            pos = end;
        }

        match target {
            Some((chunk, in_off)) => {
                let mut data = chunk.wait_for(timeout)?;
                let new_len = CHUNK_SIZE.min(in_off + buf.len());
                data.resize(new_len, 0);
                let n = (new_len - in_off).min(buf.len());
                data[in_off..in_off + n].copy_from_slice(&buf[..n]);
                chunk.done(data);
                debug!(
                    "chunk {}: rewrote {} bytes at {} (seq {})",
                    chunk.id,
                    n,
                    in_off,
                    chunk.seqno()
                );
                Ok(n)
            }
            None => {
                let take = buf.len().min(CHUNK_SIZE);
                let host = self.hosts.next();
                let chunk = self
                    .directory
                    .create(host, take)
                    .ok_or(FsError::NoSpace)?;
                file.chunks.push(chunk.clone());
                // First placement goes straight out; there is no reply to
                // rendezvous with yet.
                if let Err(err) = self.net.send(&chunk.host, chunk.id, 0, &buf[..take]) {
                    warn!("initial send for chunk {} failed: {}", chunk.id, err);
                }
                Ok(take)
            }
        }
    }

    /// Read at most one chunk's worth at `offset`. Past end returns empty.
    pub fn read(&self, name: &str, size: usize, offset: u64) -> Result<Vec<u8>, FsError> {
        let file = self.files.get(name).ok_or(FsError::NotFound)?;

        let mut off = offset;
        for chunk in &file.chunks {
            let len = chunk.len() as u64;
            if off < len {
                let data = chunk.wait_for(self.timeout)?;
                let in_off = off as usize;
                let n = (data.len() - in_off).min(size);
                let out = data[in_off..in_off + n].to_vec();
                chunk.done(data);
                return Ok(out);
            }
            off -= len;
        }
        Ok(Vec::new())
    }

    pub fn truncate(&mut self, name: &str, length: u64) -> Result<(), FsError> {
        let current = self.getattr(name)?.size;

        if length > current {
            // Zero-fill through the normal write path, one echo per step.
            let zeros = [0u8; CHUNK_SIZE];
            let mut at = current;
            while at < length {
                let step = ((length - at).min(CHUNK_SIZE as u64)) as usize;
                let written = self.write(name, &zeros[..step], at)?;
                if written == 0 {
                    return Err(FsError::TimedOut);
                }
                at += written as u64;
            }
            return Ok(());
        }

        if length < current {
            let timeout = self.timeout;
            let file = self.files.get_mut(name).ok_or(FsError::NotFound)?;

            let mut pos = 0u64;
            let mut keep = file.chunks.len();
            for (i, chunk) in file.chunks.iter().enumerate() {
                let len = chunk.len() as u64;
                let end = pos + len;
                if end < length {
                    pos = end;
                    continue;
                }
                if end == length {
                    keep = i + 1;
                } else if pos == length {
                    keep = i;
                } else {
                    // The boundary cuts through this chunk; fetch it and
                    // drop the tail bytes.
                    let mut data = chunk.wait_for(timeout)?;
                    data.truncate((length - pos) as usize);
                    chunk.done(data);
                    keep = i + 1;
                }
                break;
            }

            for chunk in file.chunks.drain(keep..) {
                self.directory.remove(chunk.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::Host;
    use crate::net::ReplyHandler;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};

    const REG: u32 = libc::S_IFREG | 0o644;

    /// The cooperative echo peer: every sent frame comes back through the
    /// chunk directory a moment later, until `lossy` swallows it.
    struct Loopback {
        queue: Mutex<VecDeque<(u16, u16, Vec<u8>)>>,
        lossy: AtomicBool,
    }

    impl Transport for Loopback {
        fn send(&self, _host: &Host, id: u16, seqno: u16, payload: &[u8]) -> std::io::Result<()> {
            if self.lossy.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.queue
                .lock()
                .unwrap()
                .push_back((id, seqno, payload.to_vec()));
            Ok(())
        }

        fn recv(&self, _timeout: Duration, _handler: ReplyHandler<'_>) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    struct Peer {
        net: Arc<Loopback>,
        directory: Arc<ChunkDirectory>,
        stop: Arc<AtomicBool>,
        pump: Option<JoinHandle<()>>,
    }

    impl Peer {
        fn start() -> (Peer, FileTable) {
            let net = Arc::new(Loopback {
                queue: Mutex::new(VecDeque::new()),
                lossy: AtomicBool::new(false),
            });
            let directory = Arc::new(ChunkDirectory::new());
            let registry = Arc::new(Registry::new(vec![Host::new(SocketAddr::from(
                ([192, 0, 2, 1], 0),
            ))]));

            let stop = Arc::new(AtomicBool::new(false));
            let pump = {
                let net = net.clone();
                let directory = directory.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let next = net.queue.lock().unwrap().pop_front();
                        match next {
                            Some((id, seqno, payload)) => {
                                thread::sleep(Duration::from_millis(2));
                                directory.dispatch_reply(&*net, id, seqno, payload);
                            }
                            None => thread::sleep(Duration::from_millis(1)),
                        }
                    }
                })
            };

            let table = FileTable::new(
                directory.clone(),
                registry,
                net.clone(),
                Duration::from_millis(500),
            );
            (
                Peer {
                    net,
                    directory,
                    stop,
                    pump: Some(pump),
                },
                table,
            )
        }

        fn drop_replies(&self) {
            self.net.lossy.store(true, Ordering::Relaxed);
            // Let anything still queued drain into the void.
            thread::sleep(Duration::from_millis(20));
        }
    }

    impl Drop for Peer {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(pump) = self.pump.take() {
                let _ = pump.join();
            }
        }
    }

    fn write_all(table: &mut FileTable, name: &str, buf: &[u8], mut offset: u64) {
        let mut left = buf;
        while !left.is_empty() {
            let n = table.write(name, left, offset).unwrap();
            assert!(n > 0);
            left = &left[n..];
            offset += n as u64;
        }
    }

    fn read_all(table: &FileTable, name: &str, size: usize, mut offset: u64) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < size {
            let part = table.read(name, size - out.len(), offset).unwrap();
            if part.is_empty() {
                break;
            }
            offset += part.len() as u64;
            out.extend_from_slice(&part);
        }
        out
    }

    #[test]
    fn create_write_read() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", b"hello", 0);

        assert_eq!(table.getattr("/a").unwrap().size, 5);
        assert_eq!(read_all(&table, "/a", 5, 0), b"hello");
    }

    #[test]
    fn append_crosses_the_chunk_boundary() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", &[0xaa; CHUNK_SIZE], 0);
        write_all(&mut table, "/a", &[0xbb], CHUNK_SIZE as u64);

        assert_eq!(table.getattr("/a").unwrap().size, 1025);
        let chunks = &table.files["/a"].chunks;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[1].len(), 1);
        assert_eq!(read_all(&table, "/a", 1025, 0)[1024], 0xbb);
    }

    #[test]
    fn overwrite_in_place_advances_the_sequence_number() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", b"hello", 0);
        write_all(&mut table, "/a", b"HELLO", 0);

        assert_eq!(read_all(&table, "/a", 5, 0), b"HELLO");
        let chunks = &table.files["/a"].chunks;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 5);
        assert!(chunks[0].seqno() >= 2);
    }

    #[test]
    fn truncate_shrink_cuts_the_chain() {
        let (_peer, mut table) = Peer::start();
        let data: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", &data, 0);
        assert_eq!(table.files["/a"].chunks.len(), 2);

        table.truncate("/a", 10).unwrap();

        assert_eq!(table.getattr("/a").unwrap().size, 10);
        assert_eq!(table.files["/a"].chunks.len(), 1);
        assert_eq!(table.directory.live(), 1);
        assert_eq!(read_all(&table, "/a", 10, 0), &data[..10]);
    }

    #[test]
    fn truncate_grow_zero_fills() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", b"hello", 0);

        table.truncate("/a", 3000).unwrap();

        assert_eq!(table.getattr("/a").unwrap().size, 3000);
        assert!(table.files["/a"].chunks.len() >= 3);
        assert_eq!(read_all(&table, "/a", 100, 500), vec![0u8; 100]);
        assert_eq!(read_all(&table, "/a", 5, 0), b"hello");
    }

    #[test]
    fn truncate_to_same_size_is_a_noop() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", b"hello", 0);
        let seq_before = table.files["/a"].chunks[0].seqno();

        table.truncate("/a", 5).unwrap();
        assert_eq!(table.getattr("/a").unwrap().size, 5);
        // No rendezvous happened; only the background bouncing moves seqno.
        assert!(table.files["/a"].chunks[0].seqno() >= seq_before);
    }

    #[test]
    fn lost_reply_surfaces_as_timeout_and_unlink_still_works() {
        let (peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", b"hello", 0);

        peer.drop_replies();

        assert_eq!(table.read("/a", 5, 0).unwrap_err(), FsError::TimedOut);
        // Metadata is untouched and the file can still be removed.
        assert_eq!(table.getattr("/a").unwrap().size, 5);
        table.unlink("/a").unwrap();
        assert_eq!(table.directory.live(), 0);
    }

    #[test]
    fn unlinked_chain_identifiers_never_dispatch_again() {
        let (peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", &[7u8; 1500], 0);

        let ids: Vec<u16> = table.files["/a"].chunks.iter().map(|c| c.id).collect();
        table.unlink("/a").unwrap();
        assert_eq!(table.directory.live(), 0);

        // Let the still-circulating echoes come home and die.
        thread::sleep(Duration::from_millis(30));
        for id in ids {
            peer.directory
                .dispatch_reply(&*peer.net, id, 99, vec![0u8; 4]);
        }
        assert_eq!(table.directory.live(), 0);
    }

    #[test]
    fn mknod_refuses_duplicates_and_special_files() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        assert_eq!(table.mknod("/a", REG).unwrap_err(), FsError::Exists);
        assert_eq!(
            table.mknod("/dev", libc::S_IFCHR | 0o644).unwrap_err(),
            FsError::NotSupported
        );
    }

    #[test]
    fn metadata_operations() {
        let (_peer, mut table) = Peer::start();
        assert_eq!(table.unlink("/nope").unwrap_err(), FsError::NotFound);
        assert_eq!(table.read("/nope", 1, 0).unwrap_err(), FsError::NotFound);

        table.mknod("/a", REG).unwrap();
        table.mknod("/b", REG).unwrap();
        assert_eq!(table.readdir(), vec!["/a", "/b"]);

        table.chmod("/a", 0o600).unwrap();
        assert_eq!(table.getattr("/a").unwrap().mode & 0o7777, 0o600);
        table.utimens("/a").unwrap();

        table.rename("/a", "/c").unwrap();
        assert_eq!(table.readdir(), vec!["/b", "/c"]);
        assert_eq!(table.getattr("/a").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn rename_over_existing_target_frees_its_chunks() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        table.mknod("/b", REG).unwrap();
        write_all(&mut table, "/a", b"aaa", 0);
        write_all(&mut table, "/b", b"bbbb", 0);
        assert_eq!(table.directory.live(), 2);

        table.rename("/a", "/b").unwrap();
        assert_eq!(table.readdir(), vec!["/b"]);
        assert_eq!(table.directory.live(), 1);
        assert_eq!(table.getattr("/b").unwrap().size, 3);
    }

    #[test]
    fn read_past_end_is_empty() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        write_all(&mut table, "/a", b"hello", 0);
        assert_eq!(table.read("/a", 10, 100).unwrap(), Vec::<u8>::new());
        assert_eq!(table.read("/a", 10, 5).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn empty_write_allocates_nothing() {
        let (_peer, mut table) = Peer::start();
        table.mknod("/a", REG).unwrap();
        assert_eq!(table.write("/a", &[], 0).unwrap(), 0);
        assert_eq!(table.directory.live(), 0);
        assert_eq!(table.getattr("/a").unwrap().size, 0);
    }
}
