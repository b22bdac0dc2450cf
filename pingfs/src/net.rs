use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossterm::style::Stylize;
use log::{trace, warn};
use nix::poll::{poll, PollFd, PollFlags};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::chunk::{ChunkDirectory, CHUNK_SIZE};
use crate::host::Host;
use crate::icmp::{self, Echo, EchoKind, EchoPacket, EchoRequest, IcmpV4, IcmpV6};
use crate::ip;

/// 1 MiB receive buffer per socket.
const RCVBUF_SIZE: usize = 1024 * 1024;

/// setsockopt name from linux/icmpv6.h.
const ICMPV6_FILTER: libc::c_int = 1;

pub type ReplyHandler<'a> = &'a mut dyn FnMut(IpAddr, u16, u16, Vec<u8>);

/// The send/receive seam of the daemon. Raw sockets in production,
/// scripted doubles in tests.
pub trait Transport: Send + Sync {
    /// Encode and emit one echo request towards `host`. A failed send is
    /// surfaced to the caller and not counted.
    fn send(&self, host: &Host, id: u16, seqno: u16, payload: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for any socket to become readable and feed every
    /// decoded echo reply to `handler`. Returns the number of ready sockets,
    /// 0 on timeout.
    fn recv(&self, timeout: Duration, handler: ReplyHandler<'_>) -> io::Result<usize>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PktStats {
    pub packets: u64,
    pub bytes: u64,
}

impl PktStats {
    fn account(&mut self, payload_len: usize) {
        self.packets += 1;
        self.bytes += (payload_len + icmp::HEADER_SIZE) as u64;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Totals {
    pub rx: PktStats,
    pub tx: PktStats,
}

/// Owner of the raw ICMP sockets. Either family may be unavailable
/// (no IPv6 on the box, say); only losing both is fatal.
pub struct IcmpTransport {
    sock_v4: Option<Socket>,
    sock_v6: Option<Socket>,
    stats: Mutex<Totals>,
}

impl IcmpTransport {
    pub fn open() -> io::Result<IcmpTransport> {
        let sock_v4 = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4));
        let sock_v6 = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6));

        let sock_v4 = match sock_v4 {
            Ok(sock) => {
                if let Err(err) = sock.set_recv_buffer_size(RCVBUF_SIZE) {
                    warn!("failed to set receive buffer size on IPv4 socket: {}", err);
                }
                Some(sock)
            }
            Err(err) => {
                if sock_v6.is_err() {
                    return Err(err);
                }
                warn!("failed to open IPv4 socket: {}", err);
                None
            }
        };

        let sock_v6 = match sock_v6 {
            Ok(sock) => {
                if let Err(err) = sock.set_recv_buffer_size(RCVBUF_SIZE) {
                    warn!("failed to set receive buffer size on IPv6 socket: {}", err);
                }
                if let Err(err) = filter_echo_reply(&sock) {
                    warn!("failed to set ICMP filter on IPv6 socket: {}", err);
                }
                Some(sock)
            }
            Err(err) => {
                warn!("failed to open IPv6 socket: {}", err);
                None
            }
        };

        Ok(IcmpTransport {
            sock_v4,
            sock_v6,
            stats: Mutex::new(Totals::default()),
        })
    }

    pub fn totals(&self) -> Totals {
        *self.stats.lock().unwrap()
    }

    fn recv_one(&self, sock: &Socket, v4: bool, handler: ReplyHandler<'_>) {
        let mut buf = [MaybeUninit::<u8>::uninit(); 2048];
        let (len, peer) = match sock.recv_from(&mut buf) {
            Ok(r) => r,
            Err(err) => {
                trace!("recv_from failed: {}", err);
                return;
            }
        };
        // The socket initialised the first `len` bytes.
        let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let peer = match peer.as_socket() {
            Some(addr) => addr,
            None => return,
        };

        let parsed = if v4 {
            match ip::strip_header(data) {
                Ok(frame) => EchoPacket::decode::<IcmpV4>(frame),
                Err(err) => {
                    trace!("dropping frame with bad IPv4 header: {}", err);
                    return;
                }
            }
        } else {
            EchoPacket::decode::<IcmpV6>(data)
        };

        match parsed {
            Ok(pkt) if pkt.kind == EchoKind::Reply => {
                self.stats.lock().unwrap().rx.account(pkt.payload.len());
                handler(peer.ip(), pkt.ident, pkt.seq_cnt, pkt.payload.to_vec());
            }
            // Echo requests from strangers pinging us.
            Ok(_) => {}
            Err(err) => trace!("dropping undecodable frame: {}", err),
        }
    }
}

impl Transport for IcmpTransport {
    fn send(&self, host: &Host, id: u16, seqno: u16, payload: &[u8]) -> io::Result<()> {
        let mut frame = [0u8; icmp::HEADER_SIZE + CHUNK_SIZE];
        let request = EchoRequest {
            ident: id,
            seq_cnt: seqno,
            payload,
        };

        let (sock, encoded) = match host.addr {
            SocketAddr::V4(_) => (self.sock_v4.as_ref(), request.encode::<IcmpV4>(&mut frame)),
            SocketAddr::V6(_) => (self.sock_v6.as_ref(), request.encode::<IcmpV6>(&mut frame)),
        };
        let len = encoded.map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let sock = sock.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "no raw socket for this address family",
            )
        })?;

        sock.send_to(&frame[..len], &SockAddr::from(host.addr))?;
        self.stats.lock().unwrap().tx.account(payload.len());
        Ok(())
    }

    fn recv(&self, timeout: Duration, handler: ReplyHandler<'_>) -> io::Result<usize> {
        let socks: Vec<(&Socket, bool)> = self
            .sock_v4
            .iter()
            .map(|s| (s, true))
            .chain(self.sock_v6.iter().map(|s| (s, false)))
            .collect();

        let mut fds: Vec<PollFd> = socks
            .iter()
            .map(|(sock, _)| PollFd::new(sock.as_raw_fd(), PollFlags::POLLIN))
            .collect();

        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = match poll(&mut fds, millis) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => return Ok(0),
            Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
        };
        if ready <= 0 {
            return Ok(0);
        }

        for (fd, &(sock, v4)) in fds.iter().zip(&socks) {
            if fd.revents().map_or(false, |r| r.contains(PollFlags::POLLIN)) {
                self.recv_one(sock, v4, &mut *handler);
            }
        }
        Ok(ready as usize)
    }
}

/// Block every ICMPv6 type except Echo Reply. The kernel drops a type whose
/// filter bit is set.
fn filter_echo_reply(sock: &Socket) -> io::Result<()> {
    let reply = u32::from(<IcmpV6 as Echo>::REPLY_TYPE);
    let mut filter = [0xffff_ffffu32; 8];
    filter[(reply >> 5) as usize] &= !(1u32 << (reply & 31));

    let res = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_ICMPV6,
            ICMPV6_FILTER,
            filter.as_ptr() as *const libc::c_void,
            std::mem::size_of_val(&filter) as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The receiver and status threads plus their stop flag. `stop` joins both
/// and prints the consumption summary.
pub struct NetRunner {
    net: Arc<IcmpTransport>,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    status: Option<JoinHandle<()>>,
}

pub fn start(net: Arc<IcmpTransport>, directory: Arc<ChunkDirectory>) -> NetRunner {
    let stop = Arc::new(AtomicBool::new(false));

    let receiver = {
        let net = net.clone();
        let stop = stop.clone();
        let directory = directory.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let mut dispatch = |_peer: IpAddr, id: u16, seqno: u16, payload: Vec<u8>| {
                    directory.dispatch_reply(&*net, id, seqno, payload);
                };
                if let Err(err) = net.recv(Duration::from_secs(1), &mut dispatch) {
                    warn!("receive loop error: {}", err);
                }
            }
        })
    };

    let status = {
        let net = net.clone();
        let stop = stop.clone();
        let directory = directory.clone();
        thread::spawn(move || {
            let mut prev = net.totals();
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                let now = net.totals();
                print!(
                    "\rICMP in: {}    ICMP out: {}    {:6} chunks",
                    rate(&now.rx, &prev.rx),
                    rate(&now.tx, &prev.tx),
                    directory.live()
                );
                let _ = io::stdout().flush();
                prev = now;
            }
        })
    };

    NetRunner {
        net,
        stop,
        receiver: Some(receiver),
        status: Some(status),
    }
}

impl NetRunner {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.receiver.take() {
            let _ = t.join();
        }
        if let Some(t) = self.status.take() {
            let _ = t.join();
        }

        let totals = self.net.totals();
        println!("\n\nTotal network resources consumed:");
        println!(
            "in:  {:10} packets, {:10} bytes",
            totals.rx.packets, totals.rx.bytes
        );
        println!(
            "out: {:10} packets, {:10} bytes",
            totals.tx.packets, totals.tx.bytes
        );
        println!(" (bytes counted above IP level)");
    }
}

fn rate(new: &PktStats, old: &PktStats) -> String {
    let packets = new.packets - old.packets;
    let (scaled, suffix) = format_bytes(new.bytes - old.bytes);
    format!(
        "{} pkt/s, {} {:2}/s",
        format!("{:6}", packets).green(),
        format!("{:7.1}", scaled).green(),
        suffix
    )
}

fn format_bytes(bytes: u64) -> (f32, &'static str) {
    const SUFFIXES: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes as f32;
    let mut i = 0;
    while i + 1 < SUFFIXES.len() && value > 1300.0 {
        value /= 1000.0;
        i += 1;
    }
    (value, SUFFIXES[i])
}
