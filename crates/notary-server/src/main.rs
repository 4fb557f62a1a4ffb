use clap::Parser;
use notary_server::network::NotaryListener;
use notary_server::Notary;
use std::sync::Arc;
use tracing::{error, info};

/// Command line arguments for the notary server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Secret key seed (32 bytes in hex format)
    #[arg(short, long)]
    seed: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter("info").init();

    let seed = match hex::decode(&args.seed) {
        Ok(bytes) => {
            if bytes.len() != 32 {
                error!("Seed must be 32 bytes (64 hex characters)");
                return;
            }
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            seed
        }
        Err(e) => {
            error!("Failed to parse seed: {}", e);
            return;
        }
    };

    match Notary::new(&seed) {
        Ok(notary) => {
            info!(
                "Starting notary {} on {}",
                hex::encode(notary.id()),
                args.address
            );
            let listener = NotaryListener::new(Arc::new(notary));
            if let Err(e) = listener.listen(&args.address).await {
                error!("Notary failed: {}", e);
            }
        }
        Err(e) => {
            error!("Failed to create notary: {}", e);
        }
    }
}
