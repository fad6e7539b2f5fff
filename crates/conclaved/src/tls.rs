//! Mutual TLS between daemons.
//!
//! Every daemon holds a self-signed certificate, so there is no CA to
//! chain to. Both ends present their certificate and prove they hold its
//! key during the handshake; which certificates are trusted is decided
//! afterwards by fingerprint, against what a session approved.
//!
//! ```text
//! client                               server
//!   pin: expected fingerprint            any certificate, key proven
//!   ─────────────── TLS 1.2/1.3 ───────────────►
//!                                        PeerCertificate extension
//! ```

use std::io;
use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_server::Handle;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures_util::future::BoxFuture;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tower_http::add_extension::AddExtension;

use conclave_common::ConclaveError;

use crate::certs::{Certificate, CertificateStore, fingerprint};
use crate::routes::ApiError;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS configuration failed: {0}")]
    Config(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// This host's certificate and key, ready for either end of a connection
#[derive(Clone)]
pub struct TlsIdentity {
    cert: CertificateDer<'static>,
    key: Vec<u8>,
}

impl TlsIdentity {
    pub fn new(store: &CertificateStore) -> Self {
        Self {
            cert: CertificateDer::from(store.server().der().to_vec()),
            key: store.server_key().to_vec(),
        }
    }

    fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone()))
    }

    /// Server side: require a client certificate, of any issuer
    pub fn server_config(&self) -> Result<rustls::ServerConfig, TlsError> {
        let provider = provider();
        let mut config = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(AnyClientCertificate { provider }))
            .with_single_cert(vec![self.cert.clone()], self.key())?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Client side: present this identity and accept only a server whose
    /// certificate has the `pinned` fingerprint. Without a pin any server
    /// certificate is accepted; the caller reads it from the response.
    pub fn client_config(&self, pinned: Option<&str>) -> Result<rustls::ClientConfig, TlsError> {
        let provider = provider();
        let verifier = PinnedServerCertificate {
            pinned: pinned.map(str::to_string),
            provider: provider.clone(),
        };

        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(vec![self.cert.clone()], self.key())?;
        Ok(config)
    }
}

#[derive(Debug)]
struct PinnedServerCertificate {
    pinned: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(pinned) if *pinned != fingerprint(end_entity.as_ref()) => Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            )),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Accepts every client certificate; the handshake signature still
/// proves possession of its key
#[derive(Debug)]
struct AnyClientCertificate {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AnyClientCertificate {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Certificate the caller presented on the TLS connection. The acceptor
/// stores it as an `Option<PeerCertificate>` request extension.
#[derive(Debug, Clone)]
pub struct PeerCertificate(pub Certificate);

impl PeerCertificate {
    pub fn fingerprint(&self) -> &str {
        self.0.fingerprint()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for PeerCertificate {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Option<PeerCertificate>>()
            .cloned()
            .flatten()
            .ok_or_else(|| ConclaveError::Trust("Failed to authenticate using mTLS".to_string()).into())
    }
}

/// TLS acceptor that hands the client certificate to the router
#[derive(Clone)]
pub struct PeerCertificateAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertificateAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertificateAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = <RustlsAcceptor as Accept<I, S>>::Stream;
    type Service = AddExtension<S, Option<PeerCertificate>>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let peer = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|der| Certificate::from_der(der.as_ref()).ok())
                .map(PeerCertificate);
            Ok((stream, AddExtension::new(service, peer)))
        })
    }
}

/// Serve `app` over mutual TLS on `listener` until `handle` shuts it down
pub async fn serve(listener: TcpListener, app: Router, identity: &TlsIdentity, handle: Handle) -> anyhow::Result<()> {
    let config = RustlsConfig::from_config(Arc::new(identity.server_config()?));

    axum_server::from_tcp(listener.into_std()?)
        .acceptor(PeerCertificateAcceptor::new(config))
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::Context;
    use crate::gateway::tests::gateway_pair;
    use crate::handler::tests::test_handler;
    use crate::routes::tests::app;
    use crate::services::{ServiceError, ServiceRegistry};
    use crate::services::remote::RemoteSystem;
    use axum::routing::get;
    use conclave_common::SessionRole;
    use conclave_common::constants::PROTOCOL_VERSION;
    use conclave_common::JoinIntent;
    use std::time::Duration;

    /// Certificate store and TLS identity in a fresh temp directory
    pub(crate) fn test_identity(name: &str) -> (CertificateStore, TlsIdentity) {
        let dir = std::env::temp_dir().join(format!("conclave-tls-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = CertificateStore::load_or_generate(&dir, name).unwrap();
        let identity = TlsIdentity::new(&store);
        (store, identity)
    }

    /// Serve `app` over mutual TLS on a loopback port; returns `host:port`
    pub(crate) async fn serve_tls(app: Router, identity: &TlsIdentity) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let identity = identity.clone();
        tokio::spawn(async move { serve(listener, app, &identity, Handle::new()).await });
        addr
    }

    fn client(identity: &TlsIdentity, pinned: Option<&str>) -> reqwest::Client {
        reqwest::Client::builder()
            .use_preconfigured_tls(identity.client_config(pinned).unwrap())
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn whoami() -> Router {
        Router::new().route(
            "/whoami",
            get(|peer: PeerCertificate| async move { peer.fingerprint().to_string() }),
        )
    }

    #[tokio::test]
    async fn test_server_sees_client_certificate() {
        let (server, server_identity) = test_identity("tls-server");
        let (caller, caller_identity) = test_identity("tls-caller");
        let addr = serve_tls(whoami(), &server_identity).await;

        let body = client(&caller_identity, Some(server.server().fingerprint()))
            .get(format!("https://{addr}/whoami"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert_eq!(body, caller.server().fingerprint());
    }

    #[tokio::test]
    async fn test_pinned_client_refuses_other_server() {
        let (_, server_identity) = test_identity("tls-pin-server");
        let (caller, caller_identity) = test_identity("tls-pin-caller");
        let addr = serve_tls(whoami(), &server_identity).await;

        let result = client(&caller_identity, Some(caller.server().fingerprint()))
            .get(format!("https://{addr}/whoami"))
            .send()
            .await;
        assert!(result.is_err());

        // Unpinned first contact goes through
        let result = client(&caller_identity, None)
            .get(format!("https://{addr}/whoami"))
            .send()
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_client_without_certificate_is_refused() {
        let (_, server_identity) = test_identity("tls-anon-server");
        let addr = serve_tls(whoami(), &server_identity).await;

        let anonymous = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let result = anonymous.get(format!("https://{addr}/whoami")).send().await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_join_intent_is_bound_to_connection() {
        let handler = Arc::new(test_handler("tls-initiator", ServiceRegistry::default()));
        let ctx = Context::new();
        let (gw, _cli) = gateway_pair(&ctx).await;
        handler
            .start_session(
                SessionRole::Initiating,
                Some("acorn adobe agent alarm".to_string()),
                gw,
                Duration::from_secs(600),
            )
            .await
            .unwrap();
        let addr = serve_tls(app(handler.clone()), &handler.tls).await;

        // Knows the passphrase and node2's public certificate, not its key
        let (victim, _) = test_identity("tls-victim");
        let (_, impostor) = test_identity("tls-impostor");
        let intent = JoinIntent {
            name: "node2".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            address: "10.0.0.2:9443".to_string(),
            certificate: victim.server().pem().to_string(),
            services: vec![],
        };

        let remote = RemoteSystem::new(
            "tls-initiator",
            &addr,
            &impostor,
            Some(handler.certs.server()),
            "acorn adobe agent alarm",
        )
        .unwrap();
        let err = remote.session_join(&intent).await.unwrap_err();

        match err {
            ServiceError::Status { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("does not match its TLS connection"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(handler.temporary_trust_store().await.is_empty());
    }
}
