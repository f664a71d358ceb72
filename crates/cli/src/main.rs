//! peerlink - run two local endpoints against each other
//!
//! Both endpoints live in this process and talk over the loopback transport, so the
//! demo exercises the full session lifecycle without a signaling server.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use peerlink_core::events::EventIterator;
use peerlink_core::media::{MediaConstraints, MockBehavior, MockMediaDevices};
use peerlink_core::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "Peer-to-peer chat and call demo over a loopback transport")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Print every session event
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a chat channel and exchange messages
    Chat {
        /// Identity of the connecting endpoint
        #[arg(long, default_value = "alice")]
        from: String,
        /// Identity of the accepting endpoint
        #[arg(long, default_value = "bob")]
        to: String,
        /// Messages sent by the connecting endpoint
        #[arg(required = true)]
        messages: Vec<String>,
    },
    /// Place a call with mock camera/microphone and hang up
    Call {
        #[arg(long, default_value = "alice")]
        from: String,
        #[arg(long, default_value = "bob")]
        to: String,
        /// Caller's devices refuse access
        #[arg(long)]
        deny_media: bool,
        /// Request the microphone only
        #[arg(long)]
        audio_only: bool,
        /// How long to keep the call up, in milliseconds
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peerlink=info,peerlink_core=info")),
        )
        .init();

    let config = match &cli.config {
        Some(path) => PeerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PeerConfig::default(),
    };

    match cli.command {
        Command::Chat { from, to, messages } => run_chat(&config, &from, &to, &messages, cli.verbose).await,
        Command::Call {
            from,
            to,
            deny_media,
            audio_only,
            hold_ms,
        } => {
            let mut config = config;
            if audio_only {
                config.call.constraints = MediaConstraints::audio_only();
            }
            run_call(&config, &from, &to, deny_media, Duration::from_millis(hold_ms), cli.verbose).await
        }
        Command::Config => {
            println!("{}", config.to_json_string()?);
            Ok(())
        }
    }
}

/// Register an endpoint with a fixed identity
async fn endpoint(network: &LoopbackNetwork, name: &str, config: &PeerConfig, verbose: bool) -> Result<IdentityManager> {
    let mut manager = IdentityManager::new(network.endpoint_with_identity(name), config);
    let identity = manager
        .initialize()
        .await
        .with_context(|| format!("registering {}", name))?;
    println!("{} registered as {}", "●".green(), identity.to_string().bold());

    if verbose {
        let mut events = EventIterator::new(manager.events());
        let label = identity.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                println!("  {} {:?}", format!("[{}]", label).dimmed(), event);
            }
        });
    }
    Ok(manager)
}

fn print_log(owner: &str, chat: &ChatSession) {
    println!("{}", format!("── {}'s log ──", owner).bold());
    for message in chat.messages() {
        let tag = match message.sender {
            Sender::Local => "self".cyan(),
            Sender::Peer => "peer".magenta(),
        };
        println!("  #{:<3} {:>4}  {}", message.seq, tag, message.text);
    }
}

async fn run_chat(config: &PeerConfig, from: &str, to: &str, messages: &[String], verbose: bool) -> Result<()> {
    let network = LoopbackNetwork::new();
    let mut initiator = endpoint(&network, from, config, verbose).await?;
    let mut acceptor = endpoint(&network, to, config, verbose).await?;

    let mut outbound = ChatSession::new(initiator.handle(), config.chat.clone());
    let mut inbound = ChatSession::new(acceptor.handle(), config.chat.clone());

    outbound.connect(to).await?;
    inbound.process_next().await;
    if outbound.process_next().await != Some(ChannelState::Open) {
        bail!("chat channel to {} did not open", to);
    }
    info!(remote = %to, "Chat channel open");

    for (n, text) in messages.iter().enumerate() {
        if !outbound.send(text) {
            println!("{} skipped empty message #{}", "○".yellow(), n);
            continue;
        }
        inbound.process_next().await;

        inbound.send(&format!("got \"{}\"", text.trim()));
        outbound.process_next().await;
    }

    print_log(from, &outbound);
    print_log(to, &inbound);

    outbound.close();
    let state = inbound.process_next().await;
    debug!("Acceptor side after close: {:?}", state);

    initiator.teardown();
    acceptor.teardown();
    Ok(())
}

async fn run_call(
    config: &PeerConfig,
    from: &str,
    to: &str,
    deny_media: bool,
    hold: Duration,
    verbose: bool,
) -> Result<()> {
    let network = LoopbackNetwork::new();
    let mut caller_identity = endpoint(&network, from, config, verbose).await?;
    let mut callee_identity = endpoint(&network, to, config, verbose).await?;

    let caller_devices = Arc::new(MockMediaDevices::with_behavior(if deny_media {
        MockBehavior::Deny
    } else {
        MockBehavior::Grant
    }));
    let callee_devices = Arc::new(MockMediaDevices::new());

    let mut caller = CallSession::new(caller_identity.handle(), caller_devices.clone(), config.call.clone());
    let mut callee = CallSession::new(callee_identity.handle(), callee_devices.clone(), config.call.clone());

    if let Err(e) = caller.place_call(to).await {
        println!("{} call failed: {}", "✗".red(), e);
        println!("  caller state: {}", caller.state());
        caller_identity.teardown();
        callee_identity.teardown();
        return Err(e).with_context(|| format!("calling {}", to));
    }
    println!("{} dialing {}", "☎".yellow(), to);

    while callee.state() != CallState::Active {
        match callee.process_next().await {
            Some(CallState::Idle) | None => bail!("{} did not pick up", to),
            Some(state) => debug!("Callee state: {}", state),
        }
    }
    if caller.process_next().await != Some(CallState::Active) {
        bail!("call to {} did not become active", to);
    }

    for (name, session) in [(from, &caller), (to, &callee)] {
        let local = session.local_stream().map(|s| s.tracks().len()).unwrap_or(0);
        let remote = session.remote_stream().map(|s| s.tracks().len()).unwrap_or(0);
        println!(
            "{} {} active: {} local tracks, {} remote tracks",
            "●".green(),
            name.bold(),
            local,
            remote
        );
    }

    tokio::time::sleep(hold).await;
    caller.end_call();
    callee.process_next().await;

    println!(
        "{} call ended; live tracks: {} = {}, {} = {}",
        "■".blue(),
        from,
        caller_devices.live_tracks(),
        to,
        callee_devices.live_tracks()
    );

    caller_identity.teardown();
    callee_identity.teardown();
    Ok(())
}
