//! CLI for AsterMQ
//!
//! Subcommands:
//! - `server`: run the broker behind the WebSocket transport
//! - `bench`: run the non-blocking fan-out scenario against an in-process broker

use astermq::broker::Broker;
use astermq::config::load_config;
use astermq::persistence::Persistence;
use astermq::scenario::{self, NonBlockingOptions};
use astermq::transport::start_websocket_server;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "astermq")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Fan messages out to many in-process receivers and report the timing
    Bench {
        #[arg(long, default_value_t = 100)]
        receivers: usize,
        #[arg(long, default_value_t = 100)]
        messages: u32,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    astermq::utils::logging::init("info");

    let result = match Command::parse() {
        Command::Server => run_server().await,
        Command::Bench {
            receivers,
            messages,
        } => run_bench(receivers, messages).await,
    };
    if let Err(e) = result {
        error!("astermq failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config()?;
    let persistence = Persistence::open(&settings.storage)?;
    let broker = Arc::new(Broker::new_with_persistence(
        persistence,
        settings.broker.clone(),
    )?);
    info!(topics = broker.list_topics().len(), "broker restored");

    tokio::spawn(Broker::start_maintenance_loop(broker.clone()));

    tokio::select! {
        result = start_websocket_server(broker.clone(), settings) => {
            if let Err(e) = result {
                error!("WebSocket server exited: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Flushing storage.");
        }
    }

    broker.persistence().flush().await?;
    Ok(())
}

async fn run_bench(receivers: usize, messages: u32) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(Broker::temporary()?);
    let options = NonBlockingOptions {
        receivers,
        messages,
        ..NonBlockingOptions::default()
    };
    let report = scenario::non_blocking(broker, options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
