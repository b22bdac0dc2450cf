mod app;
mod chunk;
mod eval;
mod fs;
mod fuse;
mod host;
mod icmp;
mod ip;
mod net;

use app::PingFsApp;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let app = PingFsApp::from_args();
    if let Err(err) = app.run() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
