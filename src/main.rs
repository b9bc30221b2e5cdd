use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use rust_chat_sync::common::{ChatMessage, SenderType};
use rust_chat_sync::config;
use rust_chat_sync::network::{Backoff, SubmissionClient, TransportChannel};
use rust_chat_sync::storage::{self, MessageStore};
use rust_chat_sync::sync::SyncEngine;

#[derive(Parser)]
#[command(name = "rust_chat_sync", version, about = "Chat sync client")]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    /// Conversation to open
    #[arg(long, default_value = "default")]
    conversation: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let app_config = config::load_config(&cli.config);
    let auth_token = std::env::var("CHAT_AUTH_TOKEN").unwrap_or_default();

    storage::ensure_data_dir().ok();
    let store = Arc::new(MessageStore::open(&app_config.database_path)?);

    // Channel -> engine queue; bounded so a busy engine backpressures reads.
    let (event_tx, event_rx) = mpsc::channel(100);

    let backoff = Backoff::new(
        Duration::from_millis(app_config.backoff_base_ms),
        Duration::from_millis(app_config.backoff_cap_ms),
    );
    let channel = TransportChannel::new(app_config.channel_url.clone(), backoff, event_tx);
    channel.connect(auth_token.clone());

    let submitter = Arc::new(SubmissionClient::new(
        app_config.api_base_url.clone(),
        auth_token,
    ));
    let engine = Arc::new(SyncEngine::new(store, submitter));

    let pump_engine = engine.clone();
    tokio::spawn(async move { pump_engine.pump_inbound(event_rx).await });

    let mut view = engine.observe(&cli.conversation);
    tokio::spawn(async move {
        while let Some(snapshot) = view.recv().await {
            render(&snapshot);
        }
    });

    log::info!("Opened conversation {}", cli.conversation);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match engine.submit(&cli.conversation, &line) {
            Ok(id) => log::debug!("Submitted {id}"),
            Err(err) => eprintln!("!! {err}"),
        }
    }

    channel.disconnect();
    Ok(())
}

fn render(snapshot: &[ChatMessage]) {
    println!("---- {} message(s) ----", snapshot.len());
    for message in snapshot {
        let who = match message.sender_type {
            SenderType::User => "you",
            SenderType::Bot => "bot",
            SenderType::System => "system",
        };
        println!(
            "[{:>9}] {who}: {}",
            message.delivery_state.as_str(),
            message.content
        );
    }
}
