use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::style::Stylize;
use log::warn;

use crate::chunk::CHUNK_SIZE;
use crate::host::Host;
use crate::net::Transport;

const ROUNDS: u32 = 5;

pub struct Evaluation {
    pub hosts: Vec<Arc<Host>>,
    pub avg_rtt: Option<Duration>,
}

struct EvalHost {
    host: Arc<Host>,
    id: u16,
    seqno: u16,
    sent: Instant,
    done: bool,
    tx: u32,
    rx: u32,
}

/// Probe every candidate with five rounds of full-size echoes and keep only
/// the ones that answered every probe exactly. A reply counts only when the
/// peer address, identifier, sequence number and payload all match.
pub fn evaluate(net: &dyn Transport, candidates: Vec<Arc<Host>>, timeout: Duration) -> Evaluation {
    let payload: Vec<u8> = (0..CHUNK_SIZE).map(|i| i as u8).collect();

    let mut probes: Vec<EvalHost> = candidates
        .iter()
        .enumerate()
        .map(|(i, host)| EvalHost {
            host: host.clone(),
            id: i as u16,
            seqno: (i as u16).wrapping_mul(2),
            sent: Instant::now(),
            done: false,
            tx: 0,
            rx: 0,
        })
        .collect();

    let mut rtt_sum = Duration::ZERO;
    let mut rtt_count = 0u32;

    print!(
        "Evaluating {} hosts (timeout={}s).",
        candidates.len(),
        timeout.as_secs()
    );
    let _ = io::stdout().flush();

    for _ in 0..ROUNDS {
        print!(".");
        let _ = io::stdout().flush();

        for probe in probes.iter_mut() {
            probe.done = false;
            probe.sent = Instant::now();
            probe.tx += 1;
            if let Err(err) = net.send(&probe.host, probe.id, probe.seqno, &payload) {
                warn!("probe to {} failed: {}", probe.host.addr, err);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            if probes.iter().all(|p| p.done) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let mut accept = |peer: IpAddr, id: u16, seqno: u16, data: Vec<u8>| {
                let received = Instant::now();
                for probe in probes.iter_mut() {
                    if probe.host.addr.ip() == peer
                        && probe.id == id
                        && probe.seqno == seqno
                        && data == payload
                    {
                        probe.rx += 1;
                        probe.done = true;
                        probe.seqno = probe.seqno.wrapping_add(1);
                        rtt_sum += received - probe.sent;
                        rtt_count += 1;
                        break;
                    }
                }
            };
            match net.recv(deadline - now, &mut accept) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("receive failed during evaluation: {}", err);
                    break;
                }
            }
        }
    }
    println!(" done.");

    let total = probes.len();
    let mut hosts = Vec::new();
    for probe in probes {
        if probe.tx > 0 && probe.tx == probe.rx {
            hosts.push(probe.host);
        }
    }

    let avg_rtt = if rtt_count > 0 {
        Some(rtt_sum / rtt_count)
    } else {
        None
    };

    let good = format!("{}", hosts.len()).green();
    print!(
        "{} of {} hosts responded correctly to all pings",
        good, total
    );
    if let Some(rtt) = avg_rtt {
        print!(
            " (average RTT {} ms)",
            format!("{:.2}", rtt.as_secs_f64() * 1000.0).green()
        );
    }
    println!();

    Evaluation { hosts, avg_rtt }
}
