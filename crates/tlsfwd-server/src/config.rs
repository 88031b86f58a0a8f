//! Relay configuration: CLI arguments resolved into a validated view.
//!
//! There is no config file and no persisted state; everything comes from the
//! command line.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tlsfwd_core::{FwdError, FwdResult, UpgradeMode};

/// TLS credentials and verification settings.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM certificate chain presented in `recv-tls` mode.
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`.
    pub key_path: Option<PathBuf>,
    /// Generate a self-signed certificate into `cert_dir` instead.
    pub generate_cert: bool,
    /// Where generated certificates are written.
    pub cert_dir: PathBuf,
    /// PEM trust roots for `start-tls` mode.
    pub ca_cert: Option<PathBuf>,
    /// Accept any server certificate in `start-tls` mode.
    pub insecure: bool,
    /// SNI and verification name; defaults to the destination host.
    pub server_name: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            generate_cert: false,
            cert_dir: default_cert_dir(),
            ca_cert: None,
            insecure: false,
            server_name: None,
        }
    }
}

/// Resolved relay configuration (paths expanded, defaults applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: IpAddr,
    pub listen_port: u16,
    pub dest_host: String,
    pub dest_port: u16,
    pub mode: UpgradeMode,
    pub tls: TlsSettings,
}

impl RelayConfig {
    /// Build a configuration, expanding `~/` in every path.
    pub fn new(
        bind_addr: IpAddr,
        listen_port: u16,
        dest_host: String,
        dest_port: u16,
        mode: UpgradeMode,
        mut tls: TlsSettings,
    ) -> Self {
        tls.cert_path = tls.cert_path.as_deref().map(expand_tilde);
        tls.key_path = tls.key_path.as_deref().map(expand_tilde);
        tls.ca_cert = tls.ca_cert.as_deref().map(expand_tilde);
        tls.cert_dir = expand_tilde(&tls.cert_dir);
        Self {
            bind_addr,
            listen_port,
            dest_host,
            dest_port,
            mode,
            tls,
        }
    }

    /// Address the relay listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.listen_port)
    }

    /// Name used for SNI and certificate verification on the outbound leg.
    pub fn server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.dest_host)
    }

    /// Check that the credentials needed by the selected mode are present.
    ///
    /// # Errors
    ///
    /// Returns [`FwdError::Config`] describing the first problem found.
    pub fn validate(&self) -> FwdResult<()> {
        if self.dest_host.is_empty() {
            return Err(FwdError::Config("empty destination address".into()));
        }
        if self.listen_port == 0 || self.dest_port == 0 {
            return Err(FwdError::Config("port numbers range from 1 to 65535".into()));
        }

        let tls = &self.tls;
        match self.mode {
            UpgradeMode::UpgradeInbound => {
                if tls.generate_cert {
                    if tls.cert_path.is_some() || tls.key_path.is_some() {
                        return Err(FwdError::Config(
                            "--generate-cert conflicts with --cert/--key".into(),
                        ));
                    }
                } else if tls.cert_path.is_none() || tls.key_path.is_none() {
                    return Err(FwdError::Config(
                        "recv-tls needs --cert and --key, or --generate-cert".into(),
                    ));
                }
            }
            UpgradeMode::UpgradeOutbound => {
                if tls.ca_cert.is_none() && !tls.insecure {
                    return Err(FwdError::Config(
                        "start-tls needs --ca-cert or --insecure".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Default directory for generated certificates (`~/.tlsfwd`).
pub fn default_cert_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tlsfwd")
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
