use anyhow::{Context, Result};
use chat_core::{load_settings, ChatClient, ConnectionState};
use chat_shared::domain::Cid;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Connects, watches channels and prints every event until interrupted.
#[derive(Parser, Debug)]
struct Args {
    /// Overrides `base_url` from the config file.
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Channel to watch, as `type:id`. Repeatable.
    #[arg(long = "channel")]
    channels: Vec<Cid>,
    /// Print full event JSON instead of one summary line per event.
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = Some(user_id);
    }
    if let Some(token) = args.token {
        settings.token = Some(token);
    }

    let client = ChatClient::from_settings(settings).context("failed to build client")?;
    let mut events = client.subscribe_events();
    let mut state = client.watch_state();

    let connection_id = client.connect().await.context("connect failed")?;
    info!(%connection_id, "connected");
    for cid in args.channels {
        if let Err(err) = client.watch_channel(cid.clone()).await {
            warn!(%cid, error = %err, "failed to watch channel");
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = events.recv() => match received {
                Ok(event) if args.raw => println!("{}", serde_json::to_string(&event)?),
                Ok(event) => {
                    let cid = event
                        .target_cid()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".to_string());
                    println!("{} {} {}", event.created_at.to_rfc3339(), event.kind, cid);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!(state = ?current, "connection state changed");
                if current == ConnectionState::Disconnected {
                    if let Some(err) = client.connection().last_error().await {
                        warn!(error = %err, "connection gave up");
                        break;
                    }
                }
            }
        }
    }

    client.dispose().await;
    let stats = client.stats().await;
    info!(
        total_failures = stats.total_failures,
        generation = stats.generation,
        "disconnected"
    );
    Ok(())
}
