use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use unichat_core::{ChannelKind, FederationConfig, Message};
use unichat_router::Router;

mod backends;

/// Federated chat over relay, graph and secure-channel backends.
#[derive(Parser)]
#[command(name = "unichat", version)]
struct Cli {
    /// Config file. Falls back to $UNICHAT_CONFIG, then ~/.unichat/unichat.toml.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the capability matrix of one kind's backend, or of every routed kind.
    Capabilities { kind: Option<ChannelKind> },
    /// List the channels of every backend.
    Channels,
    /// Send a message. CHANNEL is a channel id, or a bare kind (`team`) to
    /// create a fresh channel of that kind first.
    Send { channel: String, text: String },
    /// Create a channel per routed kind, subscribe, send and list.
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unichat=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit path > UNICHAT_CONFIG env > ~/.unichat/unichat.toml
    let config_path = cli.config.or_else(|| std::env::var("UNICHAT_CONFIG").ok());
    let config = FederationConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        FederationConfig::default()
    });

    let adapters = backends::loopback_adapters(&config);
    let router = Router::from_config(&config, &adapters)?;

    if let Command::Capabilities { kind } = &cli.command {
        return print_capabilities(&router, *kind);
    }

    router.connect().await?;
    let result = match cli.command {
        Command::Capabilities { .. } => Ok(()),
        Command::Channels => list_channels(&router).await,
        Command::Send { channel, text } => send(&router, &channel, &text).await,
        Command::Demo => demo(&router, Duration::from_millis(config.secure.poll_interval_ms)).await,
    };
    router.disconnect().await?;
    result
}

fn print_capabilities(router: &Router, kind: Option<ChannelKind>) -> anyhow::Result<()> {
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => router.routed_kinds(),
    };
    let mut matrices = BTreeMap::new();
    for kind in kinds {
        let caps = router
            .capabilities(kind)
            .ok_or_else(|| anyhow::anyhow!("no backend is routed for {} channels", kind))?;
        matrices.insert(kind.as_str(), caps.matrix().clone());
    }
    println!("{}", serde_json::to_string_pretty(&matrices)?);
    Ok(())
}

async fn list_channels(router: &Router) -> anyhow::Result<()> {
    let listed = router.get_channels().await?;
    for failure in &listed.failures {
        warn!(backend = %failure.backend(), error = %failure, "backend could not list channels");
    }
    if listed.items.is_empty() {
        println!("no channels");
    }
    for channel in &listed.items {
        println!(
            "{:<48} {:<7} {:<7} {}",
            channel.id, channel.kind, channel.backend, channel.name
        );
    }
    Ok(())
}

async fn send(router: &Router, channel: &str, text: &str) -> anyhow::Result<()> {
    let channel_id = match channel.parse::<ChannelKind>() {
        Ok(kind) => router.create_channel("cli", kind, &[]).await?.id,
        Err(_) => channel.to_string(),
    };
    let message = router.send_message(&channel_id, text, Vec::new()).await?;
    println!("{} {} {:?}", channel_id, message.id, message.status);
    Ok(())
}

async fn demo(router: &Router, poll_interval: Duration) -> anyhow::Result<()> {
    let mut subscriptions = Vec::new();
    let mut channels = Vec::new();
    for kind in router.routed_kinds() {
        if !router.is_available(kind) {
            warn!(kind = %kind, "kind unavailable, skipping");
            continue;
        }
        let channel = router
            .create_channel(&format!("demo-{}", kind), kind, &[])
            .await?;
        let label = kind.as_str();
        let callback = Arc::new(move |m: Message| {
            println!("[{}] <{}> {}", label, m.sender_name, m.content);
        });
        subscriptions.push(router.subscribe_to_messages(&channel.id, callback).await?);
        channels.push(channel);
    }

    for channel in &channels {
        router
            .send_message(&channel.id, &format!("hello from {}", channel.name), Vec::new())
            .await?;
    }

    // polling backends deliver on their next tick
    tokio::time::sleep(poll_interval + Duration::from_millis(200)).await;

    list_channels(router).await?;
    for channel in &channels {
        let history = router.get_messages(&channel.id, Some(10), None).await?;
        info!(channel = %channel.id, messages = history.len(), "history fetched");
    }
    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    Ok(())
}
