use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{trace, warn};
use thiserror::Error;

use crate::host::Host;
use crate::net::Transport;

pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IoError {
    /// No reply arrived inside the window; the in-flight echo is lost.
    #[error("chunk reply timed out, data lost")]
    Lost,

    /// Another operation already holds a rendezvous on this chunk.
    #[error("chunk busy")]
    Busy,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Owner {
    Net,
    Fs,
}

/// One interception handshake. The payload buffer moves through `data`
/// along with the turn: whoever `owner` names may touch it.
struct IoSlot {
    state: Mutex<IoState>,
    fs_cond: Condvar,
    net_cond: Condvar,
}

struct IoState {
    owner: Owner,
    data: Vec<u8>,
    /// Set when the filesystem side gave up waiting; the receiver must not
    /// start the handshake on such a slot.
    abandoned: bool,
}

impl IoSlot {
    fn new() -> Arc<IoSlot> {
        Arc::new(IoSlot {
            state: Mutex::new(IoState {
                owner: Owner::Net,
                data: Vec::new(),
                abandoned: false,
            }),
            fs_cond: Condvar::new(),
            net_cond: Condvar::new(),
        })
    }
}

struct ChunkState {
    seqno: u16,
    len: usize,
    io: Option<Arc<IoSlot>>,
}

/// A unit of payload kept alive by perpetual echo. The payload itself is
/// never stored here; it exists only in flight and, briefly, in a slot.
pub struct Chunk {
    pub id: u16,
    pub host: Arc<Host>,
    state: Mutex<ChunkState>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len
    }

    pub fn seqno(&self) -> u16 {
        self.state.lock().unwrap().seqno
    }

    /// Intercept the next accepted reply for this chunk. On success the
    /// caller owns the returned payload and must hand it back with `done`.
    pub fn wait_for(&self, timeout: Duration) -> Result<Vec<u8>, IoError> {
        let slot = {
            let mut st = self.state.lock().unwrap();
            if st.io.is_some() {
                return Err(IoError::Busy);
            }
            let slot = IoSlot::new();
            st.io = Some(slot.clone());
            slot
        };

        let deadline = Instant::now() + timeout;
        let mut guard = slot.state.lock().unwrap();
        while guard.owner != Owner::Fs {
            let now = Instant::now();
            if now >= deadline {
                guard.abandoned = true;
                drop(guard);
                self.state.lock().unwrap().io = None;
                return Err(IoError::Lost);
            }
            let (g, _timed_out) = slot.fs_cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }

        Ok(mem::take(&mut guard.data))
    }

    /// Hand the (possibly replaced) payload back to the receiver, which will
    /// re-emit it. The chunk length follows the new payload so the next
    /// inbound reply is matched against it.
    pub fn done(&self, data: Vec<u8>) {
        let slot = {
            let mut st = self.state.lock().unwrap();
            st.len = data.len();
            st.io.take()
        };

        if let Some(slot) = slot {
            let mut guard = slot.state.lock().unwrap();
            guard.data = data;
            guard.owner = Owner::Net;
            slot.net_cond.notify_one();
        }
    }

    /// Receiver-side half of the reply protocol: verify, bump the sequence
    /// number, run the handshake if someone is waiting, re-emit.
    fn reply(&self, net: &dyn Transport, seqno: u16, mut payload: Vec<u8>) {
        let (next_seqno, slot) = {
            let mut st = self.state.lock().unwrap();
            if payload.len() != st.len || seqno != st.seqno {
                trace!(
                    "chunk {}: stale reply (seqno {} len {})",
                    self.id,
                    seqno,
                    payload.len()
                );
                return;
            }
            st.seqno = st.seqno.wrapping_add(1);
            (st.seqno, st.io.clone())
        };

        if let Some(slot) = slot {
            let mut guard = slot.state.lock().unwrap();
            if !guard.abandoned {
                guard.data = payload;
                guard.owner = Owner::Fs;
                slot.fs_cond.notify_one();
                // The filesystem side works on the buffer, then `done`
                // flips the turn back.
                while guard.owner != Owner::Net {
                    guard = slot.net_cond.wait(guard).unwrap();
                }
                payload = mem::take(&mut guard.data);
            }
        }

        if let Err(err) = net.send(&self.host, self.id, next_seqno, &payload) {
            warn!("chunk {}: failed to bounce: {}", self.id, err);
        }
    }
}

struct Directory {
    chunks: HashMap<u16, Arc<Chunk>>,
    next_id: u16,
}

/// The set of live chunks, keyed by echo identifier.
pub struct ChunkDirectory {
    inner: Mutex<Directory>,
}

impl ChunkDirectory {
    pub fn new() -> ChunkDirectory {
        ChunkDirectory {
            inner: Mutex::new(Directory {
                chunks: HashMap::new(),
                // Random start so replies belonging to a previous daemon
                // cannot alias a fresh chunk.
                next_id: rand::random(),
            }),
        }
    }

    /// Allocate an identifier and register a new chunk. The counter wraps
    /// mod 2^16 and probes past identifiers still live; with every
    /// identifier in use this fails.
    pub fn create(&self, host: Arc<Host>, len: usize) -> Option<Arc<Chunk>> {
        let mut dir = self.inner.lock().unwrap();
        if dir.chunks.len() > u16::MAX as usize {
            return None;
        }

        let mut id = dir.next_id;
        while dir.chunks.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        dir.next_id = id.wrapping_add(1);

        let chunk = Arc::new(Chunk {
            id,
            host,
            state: Mutex::new(ChunkState {
                seqno: 0,
                len,
                io: None,
            }),
        });
        dir.chunks.insert(id, chunk.clone());
        Some(chunk)
    }

    /// Drop a chunk. Its outstanding echo will be received once more and
    /// discarded by the lookup in `dispatch_reply`, ending the loop.
    pub fn remove(&self, id: u16) {
        self.inner.lock().unwrap().chunks.remove(&id);
    }

    pub fn live(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    /// Route one accepted echo reply to its chunk, if any.
    pub fn dispatch_reply(&self, net: &dyn Transport, id: u16, seqno: u16, payload: Vec<u8>) {
        let chunk = self.inner.lock().unwrap().chunks.get(&id).cloned();
        match chunk {
            Some(chunk) => chunk.reply(net, seqno, payload),
            None => trace!("reply for unknown chunk {}", id),
        }
    }
}
