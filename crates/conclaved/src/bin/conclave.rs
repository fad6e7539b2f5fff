//! # conclave - operator CLI
//!
//! Drives a trust session through the local daemon's control socket.
//! `init` runs on the system that forms the cluster, `join` on every
//! other system.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use conclave_common::constants::timeouts;
use conclave_common::{JoinIntent, SessionRole};
use conclaved::certs::{Certificate, CertificateStore};
use conclaved::config::{AppConfig, Overrides};
use conclaved::context::Context;
use conclaved::formation::{Formation, SystemInformation};
use conclaved::gateway::Gateway;
use conclaved::protocol::{
    InitiatingOptions, JoiningOptions, SessionObserver, initiating_session, joining_session,
};
use conclaved::services::remote::{Peer, RemoteSystem};
use conclaved::tls::TlsIdentity;

/// Conclave CLI - form a cluster out of trusted systems
#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/conclaved.toml", env = "CONCLAVE_CONFIG")]
    config: String,

    /// Control socket of the local daemon (overrides config)
    #[arg(long, env = "CONTROL_ADDR")]
    control: Option<String>,

    /// Session lifetime in seconds; 0 uses the daemon's default
    #[arg(long, default_value = "0")]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and form the cluster once systems reached out
    Init {
        /// Systems to wait for; without any, everyone seen before the
        /// lookup timeout is taken
        #[arg(long = "system", value_name = "NAME")]
        systems: Vec<String>,

        /// Interface to answer multicast lookups on
        #[arg(long, default_value = "")]
        interface: String,

        /// Address advertised for this session
        #[arg(long, default_value = "")]
        address: String,

        /// Reuse a passphrase instead of generating one
        #[arg(long, default_value = "")]
        passphrase: String,

        /// Seconds to wait for systems to reach out
        #[arg(long, default_value_t = timeouts::LOOKUP_DEFAULT_SECS)]
        lookup_timeout: u64,
    },

    /// Join a session started on another system
    Join {
        /// Passphrase shown by `conclave init`
        #[arg(long)]
        passphrase: String,

        /// Interface to look up the initiator on
        #[arg(long, default_value = "")]
        interface: String,

        /// Contact the initiator directly instead of looking it up
        #[arg(long)]
        initiator: Option<String>,

        /// Address advertised for this session
        #[arg(long, default_value = "")]
        address: String,

        /// Seconds to wait for the initiator to answer a lookup
        #[arg(long, default_value_t = timeouts::LOOKUP_DEFAULT_SECS)]
        lookup_timeout: u64,
    },
}

/// Prints session progress for the operator
#[derive(Default)]
struct Console {
    passphrase: Mutex<String>,
}

impl SessionObserver for Console {
    fn passphrase(&self, passphrase: &str) {
        if let Ok(mut slot) = self.passphrase.lock() {
            *slot = passphrase.to_string();
        }
        println!("Passphrase: {passphrase}");
        println!("Run `conclave join --passphrase \"{passphrase}\"` on every other system");
    }

    fn intent(&self, intent: &JoinIntent, fingerprint: &str) {
        println!("  {} ({}) fingerprint {}", intent.name, intent.address, fingerprint);
    }

    fn initiator(&self, name: &str, address: &str, fingerprint: &str) {
        println!("Reached {name} ({address}), fingerprint {fingerprint}");
        println!("Waiting for the initiator to confirm this system...");
    }

    fn confirmed(&self, name: &str) {
        println!("Confirmed by {name}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let overrides = Overrides {
        control: cli.control.clone(),
        ..Default::default()
    };
    let config = AppConfig::load(&cli.config, &overrides)?;

    let certs = CertificateStore::load_or_generate(&config.state_dir(), &config.name)
        .context("Failed to load this system's certificate")?;
    let identity = certs.identity()?;
    println!("{} fingerprint {}", config.name, identity.short_fingerprint());

    let timeout = cli.timeout;
    match cli.command {
        Command::Init {
            systems,
            interface,
            address,
            passphrase,
            lookup_timeout,
        } => {
            let opts = InitiatingOptions {
                address,
                interface,
                services: config.services.registry().types(),
                passphrase,
                expected: systems,
                lookup_timeout: Duration::from_secs(lookup_timeout),
            };
            init(&config, certs, &control_url(&config, SessionRole::Initiating, timeout), opts).await
        }
        Command::Join {
            passphrase,
            interface,
            initiator,
            address,
            lookup_timeout,
        } => {
            let opts = JoiningOptions {
                address,
                interface,
                services: config.services.registry().types(),
                passphrase,
                initiator_address: initiator,
                lookup_timeout: Duration::from_secs(lookup_timeout),
            };
            join(&control_url(&config, SessionRole::Joining, timeout), opts).await
        }
    }
}

fn control_url(config: &AppConfig, role: SessionRole, timeout: u64) -> String {
    format!("ws://{}/1.0/session/{role}?timeout={timeout}", config.control_addr)
}

async fn connect(url: &str, ctx: &Context) -> Result<Arc<Gateway>> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("Failed to reach the daemon at {url}"))?;
    Ok(Gateway::new(ctx, ws))
}

async fn init(config: &AppConfig, certs: CertificateStore, url: &str, opts: InitiatingOptions) -> Result<()> {
    let ctx = Context::new();
    let gw = connect(url, &ctx).await?;
    let console = Console::default();

    println!("Waiting for systems to reach out...");
    let systems = initiating_session(&gw, &opts, &console).await?;
    let passphrase = console.passphrase.lock().map(|p| p.clone()).unwrap_or_default();

    let address = if opts.address.is_empty() {
        config.advertised_address()?
    } else {
        opts.address.clone()
    };
    let services = config.services.registry();
    let kinds = services.types();

    // Peers only accept this host's certificate, the one the daemon serves
    let tls = TlsIdentity::new(&certs);
    let mut peers: Vec<Arc<dyn Peer>> = Vec::new();
    let mut reports = vec![SystemInformation::local(&config.name, &address, &services).await?];
    for info in systems.values() {
        let pem = info
            .certificate
            .as_deref()
            .with_context(|| format!("No certificate for system {:?}", info.name))?;
        let cert = Certificate::from_pem(pem)?;
        let remote = RemoteSystem::new(&info.name, &info.address, &tls, Some(&cert), &passphrase)?;
        reports.push(SystemInformation::remote(&remote, &info.address, &kinds).await?);
        peers.push(Arc::new(remote));
    }

    println!("Forming the cluster with {} system(s)...", peers.len() + 1);
    info!(systems = ?systems.keys().collect::<Vec<_>>(), "Starting formation");
    Formation::new(&config.name, &address, services, peers, reports)
        .with_certificates(certs)
        .run()
        .await?;

    println!("Cluster formed");
    Ok(())
}

async fn join(url: &str, opts: JoiningOptions) -> Result<()> {
    let ctx = Context::new();
    let gw = connect(url, &ctx).await?;

    if opts.initiator_address.is_none() {
        println!("Looking up the initiator...");
    }
    let initiator = joining_session(&gw, &opts, &Console::default()).await?;

    println!("Joined the cluster formed by {}", initiator.name);
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    Ok(())
}
