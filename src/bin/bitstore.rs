//! The bitstore server: loads configuration, initializes logging, opens
//! the store, and serves the TCP line protocol until SHUTDOWN.

#![warn(clippy::all)]

use bitstore::{BitStore, Config, Server};

use std::net::TcpListener;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = clap::command!()
        .about("Starts a bitstore key-value server.")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/bitstore.yaml"),
        )
        .get_matches();
    let config = Config::new(args.get_one::<String>("config").unwrap())?;

    let loglevel = config.log_level.parse()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("bitstore");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let store = BitStore::open_with_capacity(PathBuf::from(&config.path), config.cache_capacity)?;
    let listener = TcpListener::bind(&config.listen)?;
    Server::new(store).serve(listener)?;
    Ok(())
}
