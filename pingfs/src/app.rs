use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use thiserror::Error;

use crate::chunk::ChunkDirectory;
use crate::eval;
use crate::fs::FileTable;
use crate::fuse::{self, PingFs};
use crate::host::{self, Registry};
use crate::net::{self, IcmpTransport};

const DEFAULT_TIMEOUT_S: u64 = 1;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to check mountpoint: {0}")]
    Mountpoint(io::Error),
    #[error("mountpoint must be a directory")]
    NotADirectory,
    #[error("failed to read host file: {0}")]
    HostFile(io::Error),
    #[error("no hosts configured")]
    NoHosts,
    #[error("no raw sockets opened ({0}), got root?")]
    RawSockets(io::Error),
    #[error("resolver failed: {0}")]
    Resolver(io::Error),
    #[error("no hosts found")]
    NoneResolved,
    #[error("no host passed the test")]
    NoGoodHosts,
    #[error("bad username given")]
    BadUser,
    #[error("mount failed: {0}")]
    Mount(io::Error),
}

pub struct PingFsApp {
    hostfile: String,
    mountpoint: PathBuf,
    timeout: Duration,
    user: Option<String>,
}

impl PingFsApp {
    pub fn from_args() -> PingFsApp {
        let matches = App::new("pingfs")
            .arg(
                Arg::new("HOSTFILE")
                    .takes_value(true)
                    .required(true)
                    .help("Whitespace-separated list of hosts to keep data on, - for stdin"),
            )
            .arg(
                Arg::new("MOUNTPOINT")
                    .takes_value(true)
                    .required(true)
                    .help("Directory to mount the filesystem on"),
            )
            .arg(
                Arg::new("USER")
                    .takes_value(true)
                    .short('u')
                    .long("user")
                    .help("Mount the filesystem as this user"),
            )
            .arg(
                Arg::new("TIMEOUT")
                    .takes_value(true)
                    .short('t')
                    .long("timeout")
                    .help("Max time to wait for icmp reply (seconds, default 1)"),
            )
            .about("Stores your files as ICMP echoes kept bouncing off remote hosts.")
            .version("0.1.0")
            .get_matches();

        let hostfile = matches.value_of("HOSTFILE").expect("required").to_string();
        let mountpoint = PathBuf::from(matches.value_of("MOUNTPOINT").expect("required"));
        let user = matches.value_of("USER").map(str::to_string);
        let timeout = matches
            .value_of("TIMEOUT")
            .map(|t| match t.parse::<u64>() {
                Ok(secs) if (1..60).contains(&secs) => Duration::from_secs(secs),
                _ => {
                    eprintln!("Bad timeout given! Exiting");
                    process::exit(1);
                }
            })
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_S));

        PingFsApp {
            hostfile,
            mountpoint,
            timeout,
            user,
        }
    }

    pub fn run(&self) -> Result<(), AppError> {
        let meta = std::fs::metadata(&self.mountpoint).map_err(AppError::Mountpoint)?;
        if !meta.is_dir() {
            return Err(AppError::NotADirectory);
        }

        let (uid, gid) = self.mount_owner()?;

        let names = self.read_hostnames()?;
        if names.is_empty() {
            return Err(AppError::NoHosts);
        }

        let net = Arc::new(IcmpTransport::open().map_err(AppError::RawSockets)?);

        let candidates = host::resolve(&names).map_err(AppError::Resolver)?;
        if candidates.is_empty() {
            return Err(AppError::NoneResolved);
        }

        let evaluation = eval::evaluate(&*net, candidates, self.timeout);
        if evaluation.hosts.is_empty() {
            return Err(AppError::NoGoodHosts);
        }

        let registry = Arc::new(Registry::new(evaluation.hosts));
        let directory = Arc::new(ChunkDirectory::new());
        let runner = net::start(net.clone(), directory.clone());

        let table = FileTable::new(directory, registry, net, self.timeout);
        let pingfs = PingFs::new(table, uid, gid);

        println!("Mounting filesystem");
        let result = fuse::mount(pingfs, &self.mountpoint);
        runner.stop();
        result.map_err(AppError::Mount)
    }

    fn read_hostnames(&self) -> Result<Vec<String>, AppError> {
        if self.hostfile == "-" {
            host::read_hostnames(io::stdin().lock()).map_err(AppError::HostFile)
        } else {
            let file = File::open(&self.hostfile).map_err(AppError::HostFile)?;
            host::read_hostnames(file).map_err(AppError::HostFile)
        }
    }

    /// The files on the mount belong to `-u`'s user, or to whoever runs
    /// the daemon (root, normally, because of the raw sockets).
    fn mount_owner(&self) -> Result<(u32, u32), AppError> {
        match &self.user {
            Some(name) => match nix::unistd::User::from_name(name) {
                Ok(Some(user)) => Ok((user.uid.as_raw(), user.gid.as_raw())),
                _ => Err(AppError::BadUser),
            },
            None => Ok((
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            )),
        }
    }
}
