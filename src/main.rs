use clap::Parser;
use log::info;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

mod domain;
mod infrastructure;
mod settings;

use infrastructure::broker::MessageBroker;
use infrastructure::handler::BrokerHandler;
use infrastructure::server::SocketServer;
use settings::BrokerSettings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Addresses to bind; repeat for multiple. Defaults to the wildcard
    /// address.
    #[arg(short, long)]
    bind: Vec<IpAddr>,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9044)]
    port: u16,

    /// Root storage directory for topic logs
    #[arg(short, long, default_value = "./data")]
    storage_dir: PathBuf,

    /// Messages per segment file before the log rolls over
    #[arg(long, default_value_t = 10_000)]
    segment_split: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let settings = BrokerSettings {
        storage_dir: args.storage_dir,
        segment_split: args.segment_split,
        bind_addrs: args.bind,
        port: args.port,
    };

    info!(
        "starting corriere broker, storage at {}",
        settings.storage_dir.display()
    );

    let broker = Arc::new(MessageBroker::new(settings.clone()));
    let server = SocketServer::new(settings.bind_addrs.clone(), settings.port);
    server.register_events(Arc::new(BrokerHandler::new(Arc::clone(&broker))));

    let addrs = server.start().await?;
    info!("broker ready on {addrs:?}");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    server.stop().await?;
    broker.stop()?;
    Ok(())
}
