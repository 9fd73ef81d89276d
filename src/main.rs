//! embermq - a small MQTT broker.

mod broker;
mod client;
mod codec;
mod config;
mod connect;
mod connection;
mod error;
mod packet;
mod shared;
mod subscription;

use std::sync::Arc;

use log::error;

use crate::broker::Broker;
use crate::config::Config;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "embermq.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("embermq - a small MQTT broker");
                println!();
                println!("Usage: embermq [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: embermq.toml)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using the EMBERMQ__ prefix:");
                println!();
                println!("  EMBERMQ__SERVER__BIND=0.0.0.0:1884");
                println!("  EMBERMQ__LIMITS__MAX_PACKET_SIZE=2097152");
                println!("  EMBERMQ__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    let broker = Broker::new(Arc::new(config));
    if let Err(e) = broker.start() {
        error!("Broker error: {}", e);
        std::process::exit(1);
    }
}
