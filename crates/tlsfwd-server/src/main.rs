//! tlsfwd: TLS forwarding relay.
//!
//! Accepts TCP clients on a listening port, opens a matching connection to a
//! fixed destination, upgrades one of the two legs to TLS, and relays bytes
//! in both directions until either side disconnects.

mod config;
mod dialer;
mod server;
mod session;
mod stats;
mod tls;
mod watch;

use clap::Parser;
use config::{RelayConfig, TlsSettings};
use dialer::Dialer;
use server::Relay;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tls::TlsUpgrade;
use tlsfwd_core::UpgradeMode;
use tracing::{error, info, warn};

/// Forward TCP connections, adding or removing TLS on one leg.
#[derive(Parser, Debug)]
#[command(name = "tlsfwd", version, about = "TLS forwarding relay")]
struct Cli {
    /// Port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    listen_port: u16,

    /// Destination address (host name or IP)
    dest_addr: String,

    /// Destination port
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    dest_port: u16,

    /// Which leg gets TLS: start-tls (outbound) or recv-tls (inbound)
    mode: UpgradeMode,

    /// Local address to bind the listener to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TLS certificate chain (PEM) presented in recv-tls mode
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key (PEM) for --cert
    #[arg(long)]
    key: Option<PathBuf>,

    /// Generate a self-signed certificate for development (recv-tls)
    #[arg(long)]
    generate_cert: bool,

    /// CA certificates (PEM) trusted in start-tls mode
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification in start-tls mode (development only)
    #[arg(long)]
    insecure: bool,

    /// Server name for SNI and verification (defaults to the destination address)
    #[arg(long)]
    server_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        RelayConfig::new(
            self.bind,
            self.listen_port,
            self.dest_addr,
            self.dest_port,
            self.mode,
            TlsSettings {
                cert_path: self.cert,
                key_path: self.key,
                generate_cert: self.generate_cert,
                ca_cert: self.ca_cert,
                insecure: self.insecure,
                server_name: self.server_name,
                ..TlsSettings::default()
            },
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = cli.into_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr(),
        destination = %config.dest_host,
        port = config.dest_port,
        mode = %config.mode,
        "starting tlsfwd"
    );

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let hook = match TlsUpgrade::from_config(&config) {
        Ok(h) => Arc::new(h),
        Err(e) => {
            error!(error = %e, "failed to set up TLS");
            std::process::exit(1);
        }
    };

    let relay = match Relay::bind(
        config.listen_addr(),
        Dialer::new(config.dest_host.clone(), config.dest_port),
        hook,
        config.mode,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };
    let stats = relay.stats();

    // Run until shutdown signal; in-flight sessions are dropped.
    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(error = %e, "relay error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!(
        sessions = stats.sessions_opened(),
        active = stats.active_sessions(),
        legs_closed = stats.legs_closed(),
        dial_failures = stats.dial_failures(),
        upgrade_failures = stats.upgrade_failures(),
        bytes = stats.bytes_forwarded(),
        "tlsfwd stopped"
    );
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
