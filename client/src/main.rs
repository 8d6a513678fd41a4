use anyhow::{Context, Result};
use clap::Parser;
use client::event_source::EventSourceTransport;
use client::href::publish_url;
use client::http_poll::HttpPollTransport;
use client::{ClientConnection, ConnectStatus, ConnectionConfig, MessageHistory};
use colored::*;
use events::clock::TokioClock;
use events::message::{TimeMs, CLIENT_ID_HEADER, MIN_TIME_VALUE};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Parser)]
#[command(name = "chat-client")]
#[command(about = "Follow (and optionally post to) a chat relay")]
struct Cli {
    /// Base URL of the relay (e.g., http://localhost:4000)
    #[arg(long, default_value = "http://localhost:4000")]
    base_url: Url,

    /// Skip the event stream and long-poll from the start
    #[arg(long)]
    force_longpoll: bool,

    /// Publish this message once connected
    #[arg(long)]
    publish: Option<String>,

    /// Sender id used when publishing
    #[arg(long, default_value = "chat-client")]
    sender: String,

    /// Stop after this many seconds instead of running until Ctrl-C
    #[arg(long)]
    duration: Option<u64>,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    let http = reqwest::Client::new();
    let mut config = ConnectionConfig::new(cli.base_url.clone());
    config.force_longpoll = cli.force_longpoll;

    let connection = ClientConnection::new(
        config,
        Arc::new(TokioClock::new()),
        Arc::new(EventSourceTransport::new()),
        Arc::new(HttpPollTransport::new(http.clone())),
    );
    let mut status = connection.watch_status();
    let mut history = connection.watch_history();

    println!("{} Connecting to {}", "→".blue(), cli.base_url);
    let _guard = connection.acquire();

    if let Some(body) = &cli.publish {
        publish(&http, &cli.base_url, &cli.sender, body).await?;
    }

    let deadline = tokio::time::sleep(
        cli.duration
            .map(Duration::from_secs)
            .unwrap_or(Duration::MAX),
    );
    tokio::pin!(deadline);

    let mut printed: TimeMs = MIN_TIME_VALUE;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                print_status(current);
                if current == ConnectStatus::Failed {
                    println!("{} Giving up; both transports failed", "✗".red());
                    break;
                }
            }
            changed = history.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = history.borrow_and_update().clone();
                printed = print_new_messages(&current, printed);
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
        }
    }

    Ok(())
}

async fn publish(http: &reqwest::Client, base_url: &Url, sender: &str, body: &str) -> Result<()> {
    let response = http
        .post(publish_url(base_url)?)
        .header(CLIENT_ID_HEADER, sender)
        .json(&json!({ "body": body }))
        .send()
        .await
        .context("Failed to reach the relay")?
        .error_for_status()
        .context("Relay rejected the message")?;

    let created: Value = response.json().await?;
    println!(
        "{} Published message {}",
        "✓".green(),
        created["data"]["timestamp"]
    );
    Ok(())
}

fn print_status(status: ConnectStatus) {
    let label = format!("{status:?} ({})", status.code());
    let label = match status {
        ConnectStatus::Failed => label.red(),
        ConnectStatus::Idle | ConnectStatus::Waiting => label.yellow(),
        ConnectStatus::Message | ConnectStatus::Longpoll => label.green(),
    };
    println!("{} Status: {label}", "→".blue());
}

// Prints messages newer than `printed`, oldest first; returns the new high-water mark.
fn print_new_messages(history: &MessageHistory, printed: TimeMs) -> TimeMs {
    let mut newest = printed;
    for message in history
        .messages()
        .iter()
        .rev()
        .filter(|message| message.timestamp > printed)
    {
        println!(
            "{} {}: {}",
            message.timestamp.to_string().dimmed(),
            message.sender_id.bold(),
            message.body
        );
        newest = newest.max(message.timestamp);
    }
    newest
}
