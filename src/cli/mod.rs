//! Command-line surface
//!
//! `pair`, `join`, `unpair`, `status`, `start`, and `config` run against
//! the core library; service management (`stop`, `logs`, install) lives
//! in the script layer around the binary.

use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::auth::pairing::{join_with_pin, PairingHost, PAIRING_TIMEOUT};
use crate::auth::{AuthError, PairingStore};
use crate::clipboard::SystemClipboard;
use crate::config::Config;
use crate::discovery;
use crate::ignore::SyncIgnore;
use crate::sync::events::LogSink;
use crate::sync::{AgentOptions, SyncAgent};
use crate::transfer::chunked::format_bytes;

/// Exit codes shared with the script layer.
pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOT_PAIRED: i32 = 3;
pub const EXIT_PAIRING_FAILED: i32 = 4;
pub const EXIT_CONNECTION_FAILED: i32 = 5;
pub const EXIT_IO: i32 = 6;
pub const EXIT_INTERNAL: i32 = 7;

/// Map an error to its process exit code.
pub fn exit_code_for(error: &crate::Error) -> i32 {
    match error {
        crate::Error::Auth(AuthError::NotPaired) => EXIT_NOT_PAIRED,
        crate::Error::Auth(AuthError::PairingFailed(_)) => EXIT_PAIRING_FAILED,
        crate::Error::Auth(_) => EXIT_CONNECTION_FAILED,
        crate::Error::Transport(_) | crate::Error::Discovery(_) => EXIT_CONNECTION_FAILED,
        crate::Error::Io(_) | crate::Error::Config(_) => EXIT_IO,
        crate::Error::Clipboard(_) => EXIT_IO,
        crate::Error::Transfer(_) => EXIT_INTERNAL,
        crate::Error::Internal(_) => EXIT_INTERNAL,
    }
}

#[derive(Parser)]
#[command(name = "yank")]
#[command(about = "LAN clipboard synchronization between two paired devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Host pairing: print a PIN and wait for the other device")]
    Pair {
        /// Seconds to wait for the joiner
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },

    #[command(about = "Join a device that is in pairing mode")]
    Join {
        /// Host address shown by `yank pair`
        host: String,
        /// 6-digit PIN shown by `yank pair`
        pin: String,
    },

    #[command(about = "Forget the paired device")]
    Unpair {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    #[command(about = "Show pairing, peer, and configuration state")]
    Status,

    #[command(about = "Run the sync agent until signalled")]
    Start {
        /// Fallback peer address when discovery finds nothing
        #[arg(long)]
        peer: Option<String>,
        /// Disable handshake authentication and frame encryption
        #[arg(long)]
        no_security: bool,
    },

    #[command(about = "Show or change configuration")]
    Config {
        /// Set one key: --set KEY VALUE
        #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"])]
        set: Option<Vec<String>>,
        /// Restore all defaults
        #[arg(long)]
        reset: bool,
    },
}

pub struct CliHandler {
    config: Config,
    config_path: PathBuf,
    store: Arc<PairingStore>,
}

impl CliHandler {
    pub fn new() -> crate::Result<Self> {
        let config_path = Config::default_path();
        let config = Config::load(&config_path)?;
        let store = Arc::new(PairingStore::new(PairingStore::default_path()));
        Ok(Self {
            config,
            config_path,
            store,
        })
    }

    pub async fn handle_command(&mut self, command: Commands) -> crate::Result<()> {
        match command {
            Commands::Pair { timeout } => self.cmd_pair(Duration::from_secs(timeout)).await,
            Commands::Join { host, pin } => self.cmd_join(&host, &pin).await,
            Commands::Unpair { yes } => self.cmd_unpair(yes),
            Commands::Status => self.cmd_status().await,
            Commands::Start { peer, no_security } => self.cmd_start(peer, no_security).await,
            Commands::Config { set, reset } => self.cmd_config(set, reset),
        }
    }

    async fn cmd_pair(&self, timeout: Duration) -> crate::Result<()> {
        if self.store.is_paired() {
            println!("Already paired. Run `yank unpair` first to pair again.");
            return Err(AuthError::PairingFailed("already paired".into()).into());
        }

        let host = PairingHost::start(self.config.port).await?;
        let addresses = discovery::local_addresses().unwrap_or_default();

        println!();
        println!("  PAIRING MODE");
        println!();
        println!("  PIN: {}", host.pin());
        println!();
        println!("  On the other device, run:");
        for addr in &addresses {
            println!("    yank join {addr} {}", host.pin());
        }
        if addresses.is_empty() {
            println!("    yank join <this-host-ip> {}", host.pin());
        }
        println!();
        println!(
            "  Waiting for a device... (timeout: {}s)",
            timeout.as_secs()
        );
        println!();

        let record = host.wait_for_joiner(&self.store, timeout).await?;
        println!("Paired with {}.", record.peer_name);
        Ok(())
    }

    async fn cmd_join(&self, host: &str, pin: &str) -> crate::Result<()> {
        if self.store.is_paired() {
            println!("Already paired. Run `yank unpair` first to pair again.");
            return Err(AuthError::PairingFailed("already paired".into()).into());
        }
        let record = join_with_pin(
            &self.store,
            host,
            self.config.port,
            pin,
            PAIRING_TIMEOUT.min(Duration::from_secs(30)),
        )
        .await?;
        println!("Paired with {}.", record.peer_name);
        Ok(())
    }

    fn cmd_unpair(&self, yes: bool) -> crate::Result<()> {
        let Some(record) = self.store.load()? else {
            println!("Not paired.");
            return Ok(());
        };

        if !yes {
            print!("Forget pairing with {}? [y/N] ", record.peer_name);
            std::io::stdout().flush()?;
            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer)?;
            if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        self.store.clear()?;
        println!("Pairing removed.");
        Ok(())
    }

    async fn cmd_status(&self) -> crate::Result<()> {
        println!("yank v{}", crate::VERSION);

        match self.store.load()? {
            Some(record) => {
                println!("  Paired with: {} ({})", record.peer_name, record.peer_device_id);
                println!("  Paired at:   {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
                if let Some(seen) = record.last_seen {
                    println!("  Last seen:   {}", seen.format("%Y-%m-%d %H:%M:%S"));
                }

                print!("  Peer address: ");
                std::io::stdout().flush()?;
                match discovery::resolve_once(&record.peer_device_id, Duration::from_secs(2))
                    .await
                {
                    Ok(Some(addr)) => println!("{addr}"),
                    _ => println!("not found (is the peer online?)"),
                }
            }
            None => {
                println!("  Not paired. Run `yank pair` on one device and `yank join` on the other.");
            }
        }

        println!("  Port: {}", self.config.port);
        println!(
            "  Sync: text={} images={} files={}",
            self.config.sync_text, self.config.sync_images, self.config.sync_files
        );
        println!(
            "  Lazy threshold: {}, chunk size: {}",
            format_bytes(self.config.lazy_threshold),
            format_bytes(self.config.chunk_size)
        );
        println!("  Session state and transfers are reported by the running agent (`yank start`).");
        Ok(())
    }

    async fn cmd_start(&self, peer: Option<String>, no_security: bool) -> crate::Result<()> {
        let peer_override = match peer {
            Some(raw) => Some(parse_peer(&raw, self.config.port)?),
            None => None,
        };

        let ignore = SyncIgnore::load(&SyncIgnore::default_path())
            .unwrap_or_default()
            .with_extensions(&self.config.ignored_extensions);

        let adapter = Arc::new(SystemClipboard::new()?);
        let agent = SyncAgent::new(
            Arc::new(self.config.clone()),
            self.store.clone(),
            adapter,
            Arc::new(LogSink),
            Arc::new(ignore),
            AgentOptions {
                peer_override,
                secure: !no_security,
                enable_discovery: true,
            },
        )?;

        if no_security {
            tracing::warn!("running with --no-security: frames are not encrypted");
        }

        let runner = agent.clone();
        let signal_agent = agent.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            signal_agent.shutdown();
        });

        runner.run().await
    }

    fn cmd_config(&mut self, set: Option<Vec<String>>, reset: bool) -> crate::Result<()> {
        if reset {
            self.config = Config::default();
            self.config.save(&self.config_path)?;
            println!("Configuration reset to defaults.");
            return Ok(());
        }

        if let Some(pair) = set {
            // clap guarantees exactly two values.
            let (key, value) = (&pair[0], &pair[1]);
            self.config.set(key, value)?;
            self.config.save(&self.config_path)?;
            println!("{key} = {value}");
            return Ok(());
        }

        let rendered = serde_json::to_string_pretty(&self.config)
            .map_err(|e| crate::Error::Internal(e.to_string()))?;
        println!("{rendered}");
        println!("\nConfig file: {}", self.config_path.display());
        Ok(())
    }
}

fn parse_peer(raw: &str, default_port: u16) -> crate::Result<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(crate::Error::Internal(format!(
        "invalid --peer address: {raw} (expected IP or IP:PORT)"
    )))
}
