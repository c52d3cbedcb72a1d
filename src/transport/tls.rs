//! # TLS Integration
//!
//! Loads certificate material once per transport and hands out `rustls`
//! sessions for individual connections.
//!
//! Sessions are sans-I/O: a [`Connection`](super::connection::Connection)
//! feeds ciphertext between its non-blocking socket and the session itself, so
//! the handshake runs inside the scheduler's normal read/write passes.
//!
//! ## Verification
//! - Both sides present certificates; chains are checked against the
//!   configured CA by `rustls`
//! - The server name is not checked during the handshake. Once the handshake
//!   completes, the peer certificate's common name (lower-cased) must equal
//!   the textual peer IP address unless hostname verification is disabled or
//!   the name is exempted
//! - The peer's SubjectPublicKeyInfo is kept for [`CryptoTransport`](super::CryptoTransport)

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{
    Certificate, CertificateError, ClientConfig, ClientConnection, PrivateKey, RootCertStore,
    ServerConfig, ServerConnection, ServerName,
};
use rustls_pemfile::Item;
use tracing::{debug, info, instrument};
use x509_parser::prelude::parse_x509_certificate;

use crate::config::TlsConfig;
use crate::error::constants::{ERR_TLS_BAD_CERT, ERR_TLS_HOSTNAME, ERR_TLS_NO_PEER_CERT};
use crate::error::{Result, TransportError};

/// Verified identity of a TLS peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub common_name: String,
    pub public_key: Vec<u8>,
}

/// Shared TLS configuration for every connection of a transport.
pub struct TlsContext {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    policy: TlsConfig,
    local: PeerIdentity,
}

impl TlsContext {
    /// Load the certificate chain, private key and CA bundle named by `config`.
    #[instrument(skip(config), fields(cert = %config.cert_path))]
    pub fn load(config: &TlsConfig) -> Result<Self> {
        let chain = load_certs(&config.cert_path)?;
        let key = load_private_key(&config.key_path)?;
        let roots = load_roots(&config.ca_path)?;

        let leaf = chain
            .first()
            .ok_or_else(|| TransportError::TlsError("No certificates found".into()))?;
        let local = certificate_identity(&leaf.0).map_err(TransportError::TlsError)?;

        let server = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots.clone())))
            .with_single_cert(chain.clone(), key.clone())
            .map_err(|e| TransportError::TlsError(format!("TLS server config error: {e}")))?;

        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier {
                inner: WebPkiVerifier::new(roots, None),
            }))
            .with_client_auth_cert(chain, key)
            .map_err(|e| TransportError::TlsError(format!("Failed to set client certificate: {e}")))?;

        info!(common_name = %local.common_name, "TLS context loaded");
        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
            policy: config.clone(),
            local,
        })
    }

    /// Session for a connection we accepted.
    pub fn server_session(&self) -> Result<rustls::Connection> {
        ServerConnection::new(Arc::clone(&self.server))
            .map(rustls::Connection::from)
            .map_err(|e| TransportError::TlsError(e.to_string()))
    }

    /// Session for a connection we dialed to `peer`.
    pub fn client_session(&self, peer: IpAddr) -> Result<rustls::Connection> {
        ClientConnection::new(Arc::clone(&self.client), ServerName::IpAddress(peer))
            .map(rustls::Connection::from)
            .map_err(|e| TransportError::TlsError(e.to_string()))
    }

    /// Check the peer certificate of a completed handshake against `peer_host`.
    pub fn verify_peer(
        &self,
        session: &rustls::Connection,
        peer_host: &str,
    ) -> std::result::Result<PeerIdentity, String> {
        let leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ERR_TLS_NO_PEER_CERT.to_string())?;
        let identity = certificate_identity(&leaf.0)?;

        if identity.common_name != peer_host.to_lowercase()
            && !self.policy.hostname_exempt(&identity.common_name)
        {
            return Err(format!(
                "{ERR_TLS_HOSTNAME}: {} != {peer_host}",
                identity.common_name
            ));
        }
        debug!(peer = peer_host, common_name = %identity.common_name, "peer certificate verified");
        Ok(identity)
    }

    pub fn local_common_name(&self) -> &str {
        &self.local.common_name
    }

    pub fn local_public_key(&self) -> &[u8] {
        &self.local.public_key
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("common_name", &self.local.common_name)
            .finish()
    }
}

/// Chain validation without the server-name check; names are checked
/// against the common name after the handshake.
struct ChainOnlyVerifier {
    inner: WebPkiVerifier,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }
}

/// Lower-cased common name and raw SubjectPublicKeyInfo of a DER certificate.
pub fn certificate_identity(der: &[u8]) -> std::result::Result<PeerIdentity, String> {
    let (_, cert) = parse_x509_certificate(der).map_err(|e| format!("{ERR_TLS_BAD_CERT}: {e}"))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_lowercase)
        .unwrap_or_default();
    Ok(PeerIdentity {
        common_name,
        public_key: cert.public_key().raw.to_vec(),
    })
}

fn read_pem(path: &str, what: &str) -> Result<Vec<Item>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open {what} file: {e}")))?;
    rustls_pemfile::read_all(&mut BufReader::new(file))
        .map_err(|_| TransportError::TlsError(format!("Failed to parse {what}")))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let certs: Vec<Certificate> = read_pem(path, "cert")?
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();
    if certs.is_empty() {
        return Err(TransportError::TlsError(format!("No certificates found in {path}")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    read_pem(path, "key")?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| TransportError::TlsError("No supported private key format found".into()))
}

fn load_roots(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| TransportError::TlsError(format!("Failed to add CA cert: {e}")))?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use std::path::Path;

    fn write_identity(dir: &Path, cn: &str) -> TlsConfig {
        let mut params = CertificateParams::new(vec![cn.to_string()]).expect("params");
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        let key = KeyPair::generate().expect("key");
        let cert = params.self_signed(&key).expect("cert");

        let cert_path = dir.join("node.pem");
        let key_path = dir.join("node.key");
        std::fs::write(&cert_path, cert.pem()).expect("write cert");
        std::fs::write(&key_path, key.serialize_pem()).expect("write key");

        TlsConfig {
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
            ca_path: cert_path.to_string_lossy().into_owned(),
            ..TlsConfig::default()
        }
    }

    fn pump(from: &mut rustls::Connection, to: &mut rustls::Connection) {
        let mut wire = Vec::new();
        while from.wants_write() {
            from.write_tls(&mut wire).expect("write_tls");
        }
        let mut rd = &wire[..];
        while !rd.is_empty() {
            to.read_tls(&mut rd).expect("read_tls");
        }
        to.process_new_packets().expect("process");
    }

    #[test]
    fn loads_local_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = TlsContext::load(&write_identity(dir.path(), "127.0.0.1")).expect("load");
        assert_eq!(ctx.local_common_name(), "127.0.0.1");
        assert!(!ctx.local_public_key().is_empty());
    }

    #[test]
    fn missing_files_are_tls_errors() {
        let config = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            ca_path: "/nonexistent/ca.pem".into(),
            ..TlsConfig::default()
        };
        assert!(matches!(TlsContext::load(&config), Err(TransportError::TlsError(_))));
    }

    #[test]
    fn mutual_handshake_and_hostname_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = TlsContext::load(&write_identity(dir.path(), "127.0.0.1")).expect("load");

        let mut client = ctx
            .client_session(IpAddr::from([127, 0, 0, 1]))
            .expect("client");
        let mut server = ctx.server_session().expect("server");
        for _ in 0..10 {
            if !client.is_handshaking() && !server.is_handshaking() {
                break;
            }
            pump(&mut client, &mut server);
            pump(&mut server, &mut client);
        }
        assert!(!client.is_handshaking());
        assert!(!server.is_handshaking());

        let peer = ctx.verify_peer(&server, "127.0.0.1").expect("verified");
        assert_eq!(peer.public_key, ctx.local_public_key());
        assert!(ctx.verify_peer(&client, "10.9.9.9").is_err());
    }

    #[test]
    fn exempt_names_skip_hostname_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = write_identity(dir.path(), "127.0.0.1");
        config.no_verify_hostnames = vec!["127.0.0.1".into()];
        let ctx = TlsContext::load(&config).expect("load");

        let mut client = ctx
            .client_session(IpAddr::from([127, 0, 0, 1]))
            .expect("client");
        let mut server = ctx.server_session().expect("server");
        for _ in 0..10 {
            pump(&mut client, &mut server);
            pump(&mut server, &mut client);
        }
        assert!(ctx.verify_peer(&client, "10.9.9.9").is_ok());
    }
}
