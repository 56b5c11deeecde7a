mod commands;
mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{ChatSession, ClientEvent, SessionContext, SessionHandle};
use realtime_transport::LocalBroadcastHub;
use shared::{domain::UserId, protocol::Message};
use storage::Storage;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::{parse_input, Input, HELP};

#[derive(Parser, Debug)]
#[command(about = "Terminal chat client")]
struct Args {
    /// TOML settings file (defaults to ./desktop.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    user: Option<String>,
    /// Channel to join on startup.
    #[arg(long)]
    channel: Option<String>,
    #[arg(long)]
    page_size: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(args.config.as_deref())?;
    if let Some(v) = args.database_url {
        settings.database_url = config::normalize_database_url(&v);
    }
    if let Some(v) = args.user {
        settings.user_id = v;
    }
    if let Some(v) = args.channel {
        settings.channel = Some(v);
    }
    if let Some(v) = args.page_size {
        settings.history_page_size = v;
    }

    let storage = Arc::new(Storage::new(&settings.database_url).await?);
    storage.health_check().await?;
    info!(database_url = %settings.database_url, user_id = %settings.user_id, "desktop: starting");

    let session = ChatSession::spawn(SessionContext {
        user_id: UserId::from(settings.user_id.as_str()),
        durable: storage,
        transport: Arc::new(LocalBroadcastHub::new(settings.event_capacity)),
        config: settings.sync_config(),
    });
    let printer = tokio::spawn(print_events(session.subscribe_events()));

    println!("{HELP}");
    if let Some(channel) = settings.channel.clone() {
        run_input(&session, Input::Join(channel)).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Ok(Input::Quit) => break,
            Ok(input) => run_input(&session, input).await,
            Err(reason) => println!("! {reason}"),
        }
    }

    if let Err(err) = session.shutdown().await {
        warn!("desktop: shutdown: {err}");
    }
    printer.abort();
    Ok(())
}

async fn run_input(session: &SessionHandle, input: Input) {
    let result = match input {
        Input::Send(text) => session.send_text(text).await.map(|_| ()),
        Input::Join(channel) => session.select_channel(channel).await.map(|_| ()),
        Input::Leave => session.clear_selection().await,
        Input::Reload => session.reload().await.map(|_| ()),
        Input::Retry(attempt) => session.retry_send(attempt).await.map(|_| ()),
        Input::Dismiss(attempt) => session
            .dismiss_failed_send(attempt)
            .await
            .map(|failed| println!("dismissed: {}", failed.message.content)),
        Input::Help => {
            println!("{HELP}");
            Ok(())
        }
        Input::Quit | Input::Nothing => Ok(()),
    };
    if let Err(err) = result {
        println!("! {err}");
    }
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "desktop: event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::SelectionChanged {
            channel_id: Some(channel_id),
            ..
        } => println!("== joined #{channel_id}"),
        ClientEvent::SelectionChanged { channel_id: None, .. } => println!("== no channel"),
        ClientEvent::LoadingChanged { loading: true, channel_id } => {
            println!("   loading #{channel_id} ...")
        }
        ClientEvent::LoadingChanged { loading: false, .. } => {}
        ClientEvent::MessagesChanged {
            channel_id,
            messages,
        } => {
            if let Some(channel_id) = channel_id {
                println!("---- #{channel_id} ({} messages)", messages.len());
            }
            for message in messages {
                println!("{}", transcript_line(message));
            }
        }
        ClientEvent::LoadFailed { channel_id, reason } => {
            println!("! could not load #{channel_id}: {reason} (use /reload)")
        }
        ClientEvent::SendFailed(failed) => println!(
            "! message not sent: {} (/retry {} or /dismiss {})",
            failed.reason, failed.attempt, failed.attempt
        ),
        ClientEvent::Error(reason) => println!("! {reason}"),
    }
}

fn transcript_line(message: &Message) -> String {
    format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.user_id,
        message.content
    )
}
