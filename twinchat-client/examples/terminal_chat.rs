//! Minimal terminal client: connect to one chat, type to send, watch the
//! live stream. Commands: /older loads the previous page, /quit exits.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use twinchat_client::{
    ChatSessionCoordinator, ClientConfig, HttpMessageHistory, StaticTokenProvider,
};

#[derive(Parser)]
#[command(about = "Terminal chat session against a twinchat backend")]
struct Args {
    /// Chat id to join
    chat_id: String,

    /// Bearer token for the backend
    #[arg(long)]
    token: String,

    /// Socket endpoint base
    #[arg(long, default_value = "ws://localhost:8000/ws/chat")]
    ws_url: String,

    /// REST endpoint base
    #[arg(long, default_value = "http://localhost:8000/api")]
    api_url: String,

    /// Local user id, used to filter our own typing echoes
    #[arg(long)]
    user_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = ClientConfig {
        ws_base_url: args.ws_url,
        api_base_url: args.api_url.clone(),
        ..Default::default()
    };

    let tokens = Arc::new(StaticTokenProvider::new(args.token));
    let history = Arc::new(HttpMessageHistory::new(&args.api_url, tokens.clone()));
    let coordinator =
        ChatSessionCoordinator::new(config, tokens, history, args.user_id);

    let events = coordinator.events();
    let mut status = events.subscribe_connection_status();
    let mut new_messages = events.subscribe_new_message();
    let mut typing = events.subscribe_typing();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let connected = *status.borrow();
                    println!("[{}]", if connected { "connected" } else { "disconnected" });
                }
                msg = new_messages.recv() => {
                    if let Ok(msg) = msg {
                        let who = if msg.is_from_user { "you" } else { "twin" };
                        println!("{} {}: {}", msg.created_at.format("%H:%M:%S"), who, msg.text_content);
                    }
                }
                indicator = typing.recv() => {
                    if let Ok(true) = indicator {
                        println!("[typing...]");
                    }
                }
            }
        }
    });

    coordinator.select_chat(Some(&args.chat_id)).await?;
    for message in coordinator.messages() {
        let who = if message.is_from_user { "you" } else { "twin" };
        println!("{} {}: {}", message.created_at.format("%H:%M:%S"), who, message.text_content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/older" => match coordinator.load_older().await {
                Ok(count) => println!("[loaded {} older messages]", count),
                Err(e) => eprintln!("[history fetch failed: {}]", e),
            },
            text => {
                coordinator.set_typing(false).await.ok();
                if let Err(e) = coordinator.send_message(text, None).await {
                    eprintln!("[send failed: {}]", e);
                }
            }
        }
    }

    coordinator.select_chat(None).await?;
    coordinator.shutdown();
    Ok(())
}
