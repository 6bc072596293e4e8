mod backoff;
mod bootstrap;
mod certs;
mod colony;
mod config;
mod connection;
mod discovery;
mod endpoint;
mod identity;
mod preflight;
mod server;
mod startup;
mod storage;
mod stun;
mod wireguard;

use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("[coral-agent] logging already initialized");
    }

    if let Err(e) = startup::run().await {
        error!(phase = %e.phase, "{}", e);
        std::process::exit(1);
    }
}
