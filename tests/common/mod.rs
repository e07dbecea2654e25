//! Shared helpers for integration tests: a throwaway PKI, TLS clients, and a
//! handler factory that records what each connection was classified as.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use mock_push_gateway::handler::{HandlerFuture, TlsConnection};
use mock_push_gateway::{tls, HandlerContext, HandlerError, HandlerFactory, ProtocolHandler};

/// How long tests wait for something that should happen
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Object identifier of the `UID` subject attribute
const OID_UID: [u64; 7] = [0, 9, 2342, 19200300, 100, 1, 1];

// ============================================================================
// Test PKI
// ============================================================================

/// A CA issuing one server certificate for `localhost` and any number of
/// client certificates
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
    server_cert: CertificateDer<'static>,
    server_key: Vec<u8>,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "Mock Push Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        TestPki {
            server_cert: server_cert.der().clone(),
            server_key: server_key.serialize_der(),
            ca_cert,
            ca_key,
        }
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.der().clone()).unwrap();
        roots
    }

    /// Server config offering h2; `client_auth` enables optional client
    /// certificates issued by this CA
    pub fn server_config(&self, client_auth: bool) -> ServerConfig {
        tls::server_config(
            vec![self.server_cert.clone()],
            PrivatePkcs8KeyDer::from(self.server_key.clone()).into(),
            client_auth.then(|| self.roots()),
        )
        .unwrap()
    }

    /// Client certificate chain and key, with `UID=<uid>` in the subject when
    /// given
    pub fn client_identity(
        &self,
        uid: Option<&str>,
    ) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Push Client");
        if let Some(uid) = uid {
            dn.push(DnType::CustomDnType(OID_UID.to_vec()), uid);
        }

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        (
            vec![cert.der().clone()],
            PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        )
    }

    /// Client config offering `alpn`, optionally presenting a certificate
    pub fn client_config(
        &self,
        alpn: &[&[u8]],
        identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    ) -> ClientConfig {
        let builder = ClientConfig::builder_with_provider(tls::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(self.roots());

        let mut config = match identity {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key).unwrap(),
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        config
    }
}

// ============================================================================
// Clients
// ============================================================================

/// Open a TLS connection to a local server
pub async fn connect(addr: SocketAddr, config: ClientConfig) -> io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(("127.0.0.1", addr.port())).await?;
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, tcp).await
}

/// Whether the server closes the connection within [`TIMEOUT`]
pub async fn closed_by_server(stream: &mut TlsStream<TcpStream>) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

/// Whether the connection stays open for `duration`
pub async fn stays_open(stream: &mut TlsStream<TcpStream>, duration: Duration) -> bool {
    let mut buf = [0u8; 64];
    tokio::time::timeout(duration, stream.read(&mut buf))
        .await
        .is_err()
}

// ============================================================================
// Recording Handler
// ============================================================================

/// Reports the context of every installed handler and holds connections
/// open until the client or the server closes them
pub struct RecordingFactory {
    tx: mpsc::UnboundedSender<HandlerContext>,
}

impl RecordingFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HandlerContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingFactory { tx }), rx)
    }
}

impl HandlerFactory for RecordingFactory {
    fn build(&self, context: HandlerContext) -> Result<Box<dyn ProtocolHandler>, HandlerError> {
        let _ = self.tx.send(context);
        Ok(Box::new(HoldOpen))
    }
}

struct HoldOpen;

impl ProtocolHandler for HoldOpen {
    fn serve(self: Box<Self>, mut connection: TlsConnection) -> HandlerFuture {
        Box::pin(async move {
            let mut buf = [0u8; 1024];
            while connection.read(&mut buf).await? > 0 {}
            Ok(())
        })
    }
}

/// Refuses every connection
pub struct RefusingFactory;

impl HandlerFactory for RefusingFactory {
    fn build(&self, _context: HandlerContext) -> Result<Box<dyn ProtocolHandler>, HandlerError> {
        Err(HandlerError("refused for test".to_string()))
    }
}

/// Next recorded handler context, failing the test after [`TIMEOUT`]
pub async fn next_context(rx: &mut mpsc::UnboundedReceiver<HandlerContext>) -> HandlerContext {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("handler channel closed")
}
