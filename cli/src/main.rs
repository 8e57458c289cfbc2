//! feedmux CLI: stream market-data channels from the terminal.
//!
//! Usage:
//! ```bash
//! # Stream BTC order-book updates
//! feedmux stream --channel l2Book --coin BTC
//!
//! # Stream account updates for an address, stop after 10 frames
//! feedmux stream --channel userEvents --user 0xabc... --count 10
//!
//! # Check that an endpoint accepts connections
//! feedmux ping --url wss://api.hyperliquid.xyz/ws
//! ```

use std::env;
use std::process;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use feedmux_core::{Channel, FeedError, SubscriptionKey};
use feedmux_ws::{FeedClient, FeedConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    init_tracing(parse_flag(&args, "--log-level").as_deref());

    let result = match args[1].as_str() {
        "stream" => cmd_stream(&args[2..]).await,
        "ping" => cmd_ping(&args[2..]).await,
        "channels" => {
            cmd_channels();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("feedmux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_usage() {
    println!("feedmux {}", env!("CARGO_PKG_VERSION"));
    println!("Multiplexed market-data streaming client\n");
    println!("USAGE:");
    println!("    feedmux <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    stream     Subscribe to a channel and print each payload as JSON");
    println!("    ping       Connect to an endpoint and report handshake latency");
    println!("    channels   List supported channels");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL>          WebSocket endpoint  [default: wss://api.hyperliquid.xyz/ws]");
    println!("    --config <FILE>      JSON config file (see FeedConfig)");
    println!("    --channel <NAME>     l2Book | trades | userEvents | allMids");
    println!("    --coin <SYMBOL>      Market symbol for l2Book / trades");
    println!("    --user <ADDRESS>     Account address for userEvents");
    println!("    --count <N>          Stop after N payloads");
    println!("    --log-level <LEVEL>  Log filter, e.g. info or feedmux_ws=debug  [default: $RUST_LOG]");
}

fn load_config(args: &[String]) -> Result<FeedConfig> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            FeedConfig::from_json(&json).with_context(|| format!("parsing config {path}"))?
        }
        None => FeedConfig::default(),
    };
    if let Some(url) = parse_flag(args, "--url") {
        config.url = url;
    }
    Ok(config)
}

fn parse_key(args: &[String]) -> Result<SubscriptionKey> {
    let name = parse_flag(args, "--channel").ok_or_else(|| anyhow!("--channel is required"))?;
    let channel = Channel::from_wire(&name).ok_or_else(|| anyhow!("unknown channel: {name}"))?;
    let param = match channel {
        Channel::OrderBook | Channel::Trades => {
            Some(parse_flag(args, "--coin").ok_or_else(|| anyhow!("--coin is required for {channel}"))?)
        }
        Channel::UserEvents => {
            Some(parse_flag(args, "--user").ok_or_else(|| anyhow!("--user is required for {channel}"))?)
        }
        Channel::AllMids => None,
    };
    SubscriptionKey::from_parts(channel, param.as_deref())
        .ok_or_else(|| anyhow!("invalid subscription for {channel}"))
}

async fn cmd_stream(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let key = parse_key(args)?;
    let limit = match parse_flag(args, "--count") {
        Some(n) => Some(n.parse::<u64>().context("--count must be a number")?),
        None => None,
    };

    let attempts = config.reconnect.max_attempts;
    let client = FeedClient::websocket(config);
    let (handle, mut rx) = client.subscribe_channel(key.clone()).await?;
    eprintln!("Streaming {key} from {} (Ctrl-C to stop)", client.url());

    let mut status = client.watch_status();
    let mut received = 0u64;
    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                println!("{payload}");
                received += 1;
                if limit.is_some_and(|n| received >= n) {
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                if status.borrow().reconnect_exhausted {
                    client.release(&handle);
                    return Err(FeedError::ReconnectExhausted { attempts }).context("stream ended");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.release(&handle);
    client.disconnect().await;
    eprintln!("Received {received} payloads");
    Ok(())
}

async fn cmd_ping(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let client = FeedClient::websocket(config);

    println!("Connecting to {}...", client.url());
    let start = Instant::now();
    if let Err(e) = client.connect().await {
        if e.is_retryable() {
            eprintln!("  (transient failure, the endpoint may accept a later attempt)");
        }
        return Err(e.into());
    }
    let latency = start.elapsed();

    println!("  Status:   {}", client.status().state);
    println!("  Latency:  {}ms", latency.as_millis());

    client.disconnect().await;
    Ok(())
}

fn cmd_channels() {
    println!("Supported channels:\n");
    println!("  l2Book      Order-book snapshots        --coin <SYMBOL>");
    println!("  trades      Trade prints                --coin <SYMBOL>");
    println!("  userEvents  Fills, fundings, liquidations for an account  --user <ADDRESS>");
    println!("  allMids     Mid prices for every market (no parameter)");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
