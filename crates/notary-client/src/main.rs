use clap::Parser;
use hex::FromHex;
use notary_client::client::NotaryClient;
use notary_client::network::WsChannel;
use notary_client::operation::RetryPolicy;
use notary_client::rest_api::{metrics, session_snapshot, start_operation, ApiState};
use notary_client::session::SessionSnapshot;
use notary_common::Crypto;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

// Command line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: String,

    /// Address for the REST facade
    #[arg(short, long, default_value = "127.0.0.1:3001")]
    listen: String,
}

// The notary endpoint as represented in the YAML file.
#[derive(Debug, serde::Deserialize)]
struct NotaryEntry {
    public_key: String, // hex encoded
    url: String,
}

#[derive(Debug, serde::Deserialize)]
struct RetryEntry {
    max_attempts: u32,
    initial_delay_ms: u64,
}

// The top-level config structure.
#[derive(Debug, serde::Deserialize)]
struct Config {
    notary: NotaryEntry,
    seed: String, // hex encoded 32 bytes
    batch_size: Option<u32>,
    retry: Option<RetryEntry>,
    round_trip_timeout_ms: Option<u64>,
    /// Previously saved session snapshot (JSON); picked up when present.
    session_file: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    let config_content = std::fs::read_to_string(&args.config).expect("Failed to read config file");
    let config: Config =
        serde_yaml::from_str(&config_content).expect("Failed to parse config file");

    let seed_bytes = <[u8; 32]>::from_hex(&config.seed).expect("Seed must be 64 hex characters");
    let crypto = Crypto::from_secret_key(&seed_bytes).expect("Failed to build keypair");

    let policy = config
        .retry
        .map(|r| RetryPolicy {
            max_attempts: r.max_attempts,
            initial_delay: Duration::from_millis(r.initial_delay_ms),
        })
        .unwrap_or_default();
    let deadline = Duration::from_millis(config.round_trip_timeout_ms.unwrap_or(5000));
    let batch_size = config.batch_size.unwrap_or(10);

    let notary_key_bytes =
        Vec::from_hex(&config.notary.public_key).expect("Invalid hex in notary public_key");
    let notary_key =
        Crypto::public_key_from_bytes(&notary_key_bytes).expect("Malformed notary public key");
    let notary_id = Crypto::identity_of(&notary_key);

    let channel = Arc::new(
        WsChannel::connect(&config.notary.url, deadline)
            .await
            .expect("Failed to connect to notary"),
    );

    let client = Arc::new(NotaryClient::new(crypto, policy, batch_size));

    let restored = config
        .session_file
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| serde_json::from_str::<SessionSnapshot>(&content).ok());
    match restored {
        Some(snapshot) if snapshot.notary_id == notary_id => {
            info!("restored persisted session for notary");
            client.adopt_session(snapshot, notary_key, channel.clone());
        }
        _ => {
            client.add_notary(notary_id, notary_key, channel.clone());
            if let Err(e) = client.register(notary_id).await {
                error!("Registration failed: {e}");
                return;
            }
        }
    }

    let state = Arc::new(ApiState {
        client,
        notary_id,
    });
    let app = axum::Router::new()
        .route("/operation", axum::routing::post(start_operation))
        .route("/session", axum::routing::get(session_snapshot))
        .route("/metrics", axum::routing::get(metrics))
        .with_state(state);

    info!("Starting REST API on {}", args.listen);
    let listener = TcpListener::bind(&args.listen).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
