//! `stash-server` binary: CLI parsing, logging and signal wiring around
//! [`stash::Server`].

use std::process;
use std::thread;

use clap::Parser;
use log::{error, info};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use stash::{Server, ServerConfig, DEFAULT_CONN_QUEUE_CAPACITY, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "stash-server", version, about = "Multi-user network file-storage server")]
struct Cli {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Capacity of the accepted-connection queue
    #[arg(default_value_t = DEFAULT_CONN_QUEUE_CAPACITY)]
    connection_queue_capacity: usize,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = ServerConfig {
        port: cli.port,
        conn_queue_capacity: cli.connection_queue_capacity,
        ..ServerConfig::default()
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("stash-server: initialisation failed: {}", err);
            process::exit(1);
        }
    };

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            eprintln!("stash-server: cannot install signal handlers: {}", err);
            process::exit(1);
        }
    };
    let shutdown = server.shutdown_handle();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("received signal {}, shutting down", sig);
            shutdown.shutdown();
        }
    });

    if let Err(err) = server.run() {
        error!("server terminated with error: {}", err);
        process::exit(1);
    }
}
