//! TLS upgrade hook backed by rustls.
//!
//! `start-tls` wraps the outbound leg in a TLS client session; `recv-tls`
//! wraps the inbound leg in a TLS server session. Credentials are loaded once
//! at startup; handshake failures surface as [`FwdError::Upgrade`].

use crate::config::RelayConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};
use tlsfwd_core::{BoxedIo, FwdError, FwdResult, UpgradeFuture, UpgradeHook, UpgradeMode};

/// Upgrade hook performing in-process TLS handshakes.
pub struct TlsUpgrade {
    /// Client side, used for [`UpgradeMode::UpgradeOutbound`].
    connector: Option<(TlsConnector, ServerName<'static>)>,
    /// Server side, used for [`UpgradeMode::UpgradeInbound`].
    acceptor: Option<TlsAcceptor>,
}

impl TlsUpgrade {
    /// Hook that acts as TLS client towards `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> FwdResult<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| FwdError::Tls(format!("invalid server name '{server_name}': {e}")))?;
        Ok(Self {
            connector: Some((TlsConnector::from(config), name)),
            acceptor: None,
        })
    }

    /// Hook that acts as TLS server with the given identity.
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            connector: None,
            acceptor: Some(TlsAcceptor::from(config)),
        }
    }

    /// Build the hook for the mode and credentials in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`FwdError::Tls`] if certificates or keys cannot be loaded,
    /// generated, or assembled into a rustls configuration.
    pub fn from_config(config: &RelayConfig) -> FwdResult<Self> {
        let tls = &config.tls;
        match config.mode {
            UpgradeMode::UpgradeOutbound => {
                let client = load_client_config(tls.ca_cert.as_deref(), tls.insecure)?;
                if tls.insecure {
                    warn!("server certificate verification disabled (--insecure)");
                }
                Self::client(Arc::new(client), config.server_name())
            }
            UpgradeMode::UpgradeInbound => {
                let (cert, key) = if tls.generate_cert {
                    let (cert, key) = generate_self_signed_cert(&tls.cert_dir)?;
                    info!(cert = %cert.display(), key = %key.display(), "generated self-signed certificate");
                    (cert, key)
                } else {
                    match (&tls.cert_path, &tls.key_path) {
                        (Some(cert), Some(key)) => (cert.clone(), key.clone()),
                        _ => {
                            return Err(FwdError::Tls(
                                "recv-tls needs --cert and --key, or --generate-cert".into(),
                            ))
                        }
                    }
                };
                let server = load_server_config(&cert, &key)?;
                Ok(Self::server(Arc::new(server)))
            }
        }
    }
}

impl UpgradeHook for TlsUpgrade {
    fn upgrade(&self, io: BoxedIo, mode: UpgradeMode) -> UpgradeFuture<'_> {
        Box::pin(async move {
            match mode {
                UpgradeMode::UpgradeOutbound => {
                    let (connector, name) = self.connector.as_ref().ok_or_else(|| {
                        FwdError::Upgrade("no TLS client configuration".into())
                    })?;
                    let stream = connector
                        .connect(name.clone(), io)
                        .await
                        .map_err(|e| FwdError::Upgrade(format!("TLS client handshake: {e}")))?;
                    let (_, session) = stream.get_ref();
                    debug!(
                        version = ?session.protocol_version(),
                        cipher = ?session.negotiated_cipher_suite().map(|s| s.suite()),
                        "outbound leg upgraded"
                    );
                    Ok(Box::new(stream) as BoxedIo)
                }
                UpgradeMode::UpgradeInbound => {
                    let acceptor = self.acceptor.as_ref().ok_or_else(|| {
                        FwdError::Upgrade("no TLS server configuration".into())
                    })?;
                    let stream = acceptor
                        .accept(io)
                        .await
                        .map_err(|e| FwdError::Upgrade(format!("TLS server handshake: {e}")))?;
                    let (_, session) = stream.get_ref();
                    debug!(
                        version = ?session.protocol_version(),
                        sni = ?session.server_name(),
                        "inbound leg upgraded"
                    );
                    Ok(Box::new(stream) as BoxedIo)
                }
            }
        })
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_pem(path: &Path, what: &str) -> FwdResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| FwdError::Tls(format!("cannot read {what} {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> FwdResult<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FwdError::Tls(format!("bad PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(FwdError::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> FwdResult<PrivateKeyDer<'static>> {
    let pem = read_pem(path, "key")?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| FwdError::Tls(format!("bad PEM in {}: {e}", path.display())))?
        .ok_or_else(|| FwdError::Tls(format!("no private key found in {}", path.display())))
}

/// Load a certificate chain and private key from PEM files into a rustls
/// server configuration.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> FwdResult<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| FwdError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FwdError::Tls(format!("invalid certificate/key pair: {e}")))
}

/// Build a rustls client configuration.
///
/// Trusts the certificates in `ca_path`, or (with `insecure`) any
/// certificate at all.
pub fn load_client_config(ca_path: Option<&Path>, insecure: bool) -> FwdResult<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| FwdError::Tls(e.to_string()))?;

    if insecure {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth());
    }

    let ca_path = ca_path
        .ok_or_else(|| FwdError::Tls("start-tls needs --ca-cert or --insecure".into()))?;
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| FwdError::Tls(format!("bad CA certificate in {}: {e}", ca_path.display())))?;
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Generate a self-signed certificate for development use.
///
/// Writes `cert.pem` and `key.pem` into `dir`, creating it if needed, and
/// returns their paths.
pub fn generate_self_signed_cert(dir: &Path) -> FwdResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(|e| FwdError::Tls(format!("certificate parameters: {e}")))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "tlsfwd dev cert");

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| FwdError::Tls(format!("key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| FwdError::Tls(format!("self-signing: {e}")))?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Certificate verifier that accepts any server certificate.
///
/// Development only; selected with `--insecure`.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsfwd_core::split_session;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dev_server(dir: &Path) -> TlsUpgrade {
        let (cert, key) = generate_self_signed_cert(dir).unwrap();
        TlsUpgrade::server(Arc::new(load_server_config(&cert, &key).unwrap()))
    }

    #[test]
    fn generated_cert_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = generate_self_signed_cert(&dir.path().join("nested")).unwrap();
        assert!(cert.exists());
        assert!(key.exists());
        assert!(load_server_config(&cert, &key).is_ok());
    }

    #[test]
    fn missing_files_are_tls_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        assert!(matches!(load_server_config(&missing, &missing), Err(FwdError::Tls(_))));
        assert!(matches!(load_client_config(Some(&missing), false), Err(FwdError::Tls(_))));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "not a certificate\n").unwrap();
        assert!(matches!(load_client_config(Some(&empty), false), Err(FwdError::Tls(_))));
    }

    #[test]
    fn client_needs_roots_or_insecure() {
        assert!(load_client_config(None, false).is_err());
        assert!(load_client_config(None, true).is_ok());
    }

    #[test]
    fn invalid_server_name_rejected() {
        let config = Arc::new(load_client_config(None, true).unwrap());
        assert!(TlsUpgrade::client(config, "not a valid name!").is_err());
    }

    #[tokio::test]
    async fn handshake_round_trip_over_duplex() {
        let dir = tempfile::tempdir().unwrap();
        let server = dev_server(dir.path());
        let client =
            TlsUpgrade::client(Arc::new(load_client_config(None, true).unwrap()), "localhost")
                .unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (outbound, inbound) = tokio::join!(
            client.upgrade(Box::new(a), UpgradeMode::UpgradeOutbound),
            server.upgrade(Box::new(b), UpgradeMode::UpgradeInbound),
        );
        let (_, mut client_writer) = split_session(outbound.unwrap());
        let (mut server_reader, _) = split_session(inbound.unwrap());

        client_writer.write(b"ping\0pong").await.unwrap();
        let mut buf = [0u8; 9];
        let mut got = 0;
        while got < buf.len() {
            let n = server_reader.read(&mut buf[got..]).await.unwrap();
            assert!(n > 0);
            got += n;
        }
        assert_eq!(&buf, b"ping\0pong");
    }

    #[tokio::test]
    async fn untrusted_certificate_fails_upgrade() {
        let server_dir = tempfile::tempdir().unwrap();
        let other_dir = tempfile::tempdir().unwrap();
        let server = dev_server(server_dir.path());
        // Trust a different self-signed certificate than the one presented.
        let (other_cert, _) = generate_self_signed_cert(other_dir.path()).unwrap();
        let client = TlsUpgrade::client(
            Arc::new(load_client_config(Some(&other_cert), false).unwrap()),
            "localhost",
        )
        .unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (outbound, _inbound) = tokio::join!(
            client.upgrade(Box::new(a), UpgradeMode::UpgradeOutbound),
            server.upgrade(Box::new(b), UpgradeMode::UpgradeInbound),
        );
        assert!(matches!(outbound, Err(FwdError::Upgrade(_))));
    }

    #[tokio::test]
    async fn plaintext_peer_fails_inbound_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let server = dev_server(dir.path());
        let (a, mut b) = tokio::io::duplex(1024);

        b.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let result = server.upgrade(Box::new(a), UpgradeMode::UpgradeInbound).await;
        assert!(matches!(result, Err(FwdError::Upgrade(_))));

        let mut rest = Vec::new();
        let _ = b.read_to_end(&mut rest).await;
    }

    #[tokio::test]
    async fn wrong_direction_is_upgrade_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = dev_server(dir.path());
        let (a, _b) = tokio::io::duplex(64);
        let result = server.upgrade(Box::new(a), UpgradeMode::UpgradeOutbound).await;
        assert!(matches!(result, Err(FwdError::Upgrade(_))));
    }
}
