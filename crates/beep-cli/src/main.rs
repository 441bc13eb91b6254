//! BEEP CLI
//!
//! Echo server and client for exercising BEEP sessions over TCP.

mod config;
mod echo;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use beep_core::ProfileRegistry;
use beep_transport::{Listener, connect};

use config::Config;
use echo::ECHO_PROFILE;

/// BEEP - channel-multiplexed request/reply sessions over TCP
#[derive(Parser)]
#[command(name = "beep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept sessions and serve the echo profile
    Serve {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Open an echo channel and check the replies
    Ping {
        /// Peer address (overrides the config file)
        addr: Option<String>,

        /// Number of messages to send
        #[arg(short = 'n', long)]
        count: Option<u32>,

        /// Payload size in bytes
        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },

    /// Print the effective configuration
    Config {
        /// Write a default configuration file instead
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::load_or_default(&config_path)?
    };

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
        .init();

    config.validate()?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.listen_addr.clone());
            serve(bind, &config).await?;
        }
        Commands::Ping { addr, count, size } => {
            let addr = addr.unwrap_or_else(|| config.client.peer_addr.clone());
            let count = count.unwrap_or(config.client.count);
            ping(addr, count, size, &config).await?;
        }
        Commands::Config { init } => {
            if init {
                config.save(&config_path)?;
                println!("Wrote {}", config_path.display());
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Serve the echo profile until interrupted
async fn serve(bind: String, config: &Config) -> anyhow::Result<()> {
    let listener = Listener::bind(&bind, config.transport(), echo::registry()).await?;
    println!("Serving {} on {}", ECHO_PROFILE, listener.local_addr()?);

    loop {
        tokio::select! {
            incoming = listener.accept() => {
                let incoming = incoming?;
                let peer = incoming.peer_addr();
                tokio::spawn(async move {
                    let connection = match incoming.establish().await {
                        Ok(connection) => connection,
                        Err(e) => {
                            tracing::warn!("Session with {} failed to start: {}", peer, e);
                            return;
                        }
                    };
                    let id = connection.session().id();
                    tracing::info!("Session {} started with {}", id, peer);
                    match connection.join().await {
                        Ok(()) => tracing::info!("Session {} with {} ended", id, peer),
                        Err(e) => tracing::warn!("Session {} with {} failed: {}", id, peer, e),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Send `count` echo requests of `size` bytes and verify each reply
async fn ping(addr: String, count: u32, size: usize, config: &Config) -> anyhow::Result<()> {
    let connection = connect(&addr, &config.transport(), ProfileRegistry::new()).await?;
    let session = connection.session();

    if !session.peer_profiles().iter().any(|p| p == ECHO_PROFILE) {
        anyhow::bail!("{} does not offer {}", addr, ECHO_PROFILE);
    }
    let channel = session.start_channel(ECHO_PROFILE, None).await?;
    println!("Channel {} started with {}", channel.number(), addr);

    let started = Instant::now();
    for seq in 0..count {
        let payload = ping_payload(seq, size);
        let sent = Instant::now();
        let reply = channel.request(payload.clone()).await?;
        let echoed = reply.read_to_end().await?;
        if echoed[..] != payload[..] {
            anyhow::bail!("Reply {} does not match the request", seq);
        }
        println!(
            "{} bytes from {}: seq={} time={:.2?}",
            echoed.len(),
            addr,
            seq,
            sent.elapsed()
        );
    }

    let stats = channel.stats();
    channel.close().await?;
    connection.close().await?;
    println!(
        "{} messages, {} bytes sent, {} bytes received in {:.2?}",
        count,
        stats.sent_sequence,
        stats.recv_sequence,
        started.elapsed()
    );
    Ok(())
}

/// Repeating `seq` pattern of `size` bytes
fn ping_payload(seq: u32, size: usize) -> Vec<u8> {
    let pattern = format!("ping {seq} ");
    pattern.bytes().cycle().take(size.max(1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_payload() {
        assert_eq!(ping_payload(3, 10), b"ping 3 pin".to_vec());
        assert_eq!(ping_payload(0, 0).len(), 1);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["beep", "ping", "127.0.0.1:10288", "-n", "2"]).unwrap();
        match cli.command {
            Commands::Ping { addr, count, size } => {
                assert_eq!(addr.as_deref(), Some("127.0.0.1:10288"));
                assert_eq!(count, Some(2));
                assert_eq!(size, 64);
            }
            _ => panic!("expected ping"),
        }
    }
}
