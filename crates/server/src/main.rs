#![forbid(unsafe_code)]

use std::path::PathBuf;

use pimd_server::{Server, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("usage: pimd-server --data-dir <path> [--socket <path>]");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut data_dir: Option<PathBuf> = None;
    let mut socket_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => data_dir = args.next().map(PathBuf::from),
            "--socket" => socket_path = args.next().map(PathBuf::from),
            "--help" | "-h" => {
                print_usage();
                return;
            }
            other => {
                eprintln!("unknown argument: {other}");
                print_usage();
                std::process::exit(2);
            }
        }
    }

    let Some(data_dir) = data_dir else {
        print_usage();
        std::process::exit(2);
    };
    let mut config = ServerConfig::for_data_dir(data_dir);
    if let Some(socket_path) = socket_path {
        config.socket_path = socket_path;
    }

    match Server::start(config, Vec::new()) {
        Ok(mut server) => {
            info!("pimd server running");
            server.wait();
        }
        Err(err) => {
            error!("fatal: {err}");
            std::process::exit(1);
        }
    }
}
