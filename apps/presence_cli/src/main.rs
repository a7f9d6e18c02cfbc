mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{SyncEngine, SyncEvent, SyncHandle};
use shared::domain::PeerId;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::load_settings;

#[derive(Parser, Debug)]
struct Args {
    /// Identity to sign in as.
    #[arg(long)]
    identity: String,
    #[arg(long)]
    server_url: Option<String>,
    /// TOML settings file; `presence.toml` is read when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Peers whose presence is printed after start-up.
    #[arg(long = "watch")]
    watch: Vec<String>,
    #[arg(long, requires = "message")]
    to: Option<String>,
    #[arg(long, requires = "to")]
    message: Option<String>,
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Connected { identity } => println!("connected as {identity}"),
        SyncEvent::Disconnected { reason } => {
            println!("disconnected ({})", reason.as_deref().unwrap_or("closed"))
        }
        SyncEvent::ReconnectExhausted { attempts } => {
            println!("gave up reconnecting after {attempts} attempts, polling only")
        }
        SyncEvent::PresenceChanged { peer_id, online } => {
            println!("{peer_id} is {}", if *online { "online" } else { "offline" })
        }
        SyncEvent::MessageReceived(envelope) => {
            println!("[{}] {} -> {}: {}", envelope.timestamp, envelope.from, envelope.to, envelope.body)
        }
        SyncEvent::UnreadUpdated {
            peer_id,
            count,
            total,
        } => println!("unread from {peer_id}: {count} (total {total})"),
        SyncEvent::UnreadReconciled { total } => println!("unread total: {total}"),
        SyncEvent::TypingChanged { peer_id, is_typing } => {
            if *is_typing {
                println!("{peer_id} is typing...");
            }
        }
        SyncEvent::OnlineCountChanged { count } => println!("{count} users online"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let engine = SyncEngine::new(settings.engine_config()).context("failed to build sync engine")?;
    let mut events = BroadcastStream::new(engine.subscribe_events());

    engine
        .initialize(PeerId::new(args.identity))
        .await
        .context("failed to start session")?;

    for peer in args.watch {
        let peer_id = PeerId::new(peer);
        let online = engine.is_online(&peer_id).await;
        println!("{peer_id} is {}", if online { "online" } else { "offline" });
    }

    if let (Some(to), Some(body)) = (args.to, args.message) {
        match engine.send_message(PeerId::new(to), &body).await {
            Ok(envelope) => println!("sent {}", envelope.id),
            Err(err) => eprintln!("send failed: {err}"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = events.next() => match next {
                Some(Ok(event)) => print_event(&event),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "cli: event stream lagged");
                }
                None => break,
            }
        }
    }

    engine.disconnect().await;
    Ok(())
}
