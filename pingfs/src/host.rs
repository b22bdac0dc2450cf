use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::warn;
use trust_dns_resolver::Resolver;

/// Longest hostname token accepted from the host file.
const MAX_HOSTNAME: usize = 256;

/// A vetted remote endpoint holding chunks for us.
#[derive(Debug)]
pub struct Host {
    pub addr: SocketAddr,
}

impl Host {
    pub fn new(addr: SocketAddr) -> Arc<Host> {
        Arc::new(Host { addr })
    }
}

/// Read whitespace-separated hostnames. Over-long tokens are skipped.
pub fn read_hostnames(mut input: impl Read) -> std::io::Result<Vec<String>> {
    let mut text = String::new();
    input.read_to_string(&mut text)?;

    let mut names = Vec::new();
    for token in text.split_whitespace() {
        if token.len() > MAX_HOSTNAME {
            warn!("skipping over-long hostname token ({} bytes)", token.len());
            continue;
        }
        names.push(token.to_string());
    }
    Ok(names)
}

/// Resolve every hostname to all of its addresses. Names that fail to
/// resolve are skipped with a message; resolving nothing at all is the
/// caller's fatal case.
pub fn resolve(names: &[String]) -> std::io::Result<Vec<Arc<Host>>> {
    let resolver = Resolver::from_system_conf().or_else(|_| Resolver::default())?;

    eprint!("Resolving {} hostnames... ", names.len());
    let mut hosts = Vec::new();
    for name in names {
        match resolver.lookup_ip(name.as_str()) {
            Ok(lookup) => {
                for ip in lookup.iter() {
                    hosts.push(Host::new(SocketAddr::new(ip, 0)));
                }
            }
            Err(err) => eprintln!("Skipping {}: {}", name, err),
        }
    }
    eprintln!("done.");
    Ok(hosts)
}

/// The cyclic sequence of vetted hosts. Immutable after startup; `next`
/// hands hosts out round-robin.
pub struct Registry {
    hosts: Vec<Arc<Host>>,
    cursor: AtomicUsize,
}

impl Registry {
    pub fn new(hosts: Vec<Arc<Host>>) -> Registry {
        assert!(!hosts.is_empty());
        Registry {
            hosts,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> Arc<Host> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.hosts[i % self.hosts.len()].clone()
    }
}
