//! X.509 certificate handling: PEM decoding, fingerprints, and the
//! daemon's self-signed server certificate.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::der::Decode;

use conclave_common::constants::SHORT_FINGERPRINT_LEN;

const SERVER_CERT: &str = "server.crt";
const SERVER_KEY: &str = "server.key";
const CLUSTER_CERT: &str = "cluster.crt";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Invalid certificate file: {0}")]
    BadPem(#[from] pem::PemError),

    #[error("Invalid certificate file: expected {expected} block, found {found:?}")]
    WrongTag { expected: &'static str, found: String },

    #[error("Failed to parse certificate: {0}")]
    BadDer(#[from] x509_cert::der::Error),

    #[error("Failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A parsed certificate together with its PEM text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pem: String,
    der: Vec<u8>,
    fingerprint: String,
}

impl Certificate {
    /// Decode a PEM `CERTIFICATE` block and check that it is valid DER
    pub fn from_pem(text: &str) -> Result<Self, CertificateError> {
        let der = parse_block(text, "CERTIFICATE")?;
        x509_cert::Certificate::from_der(&der)?;

        Ok(Self {
            pem: text.to_string(),
            fingerprint: fingerprint(&der),
            der,
        })
    }

    /// Wrap a DER certificate, as presented on a TLS connection
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        x509_cert::Certificate::from_der(der)?;

        Ok(Self {
            pem: pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec())),
            fingerprint: fingerprint(der),
            der: der.to_vec(),
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Lowercase hex SHA-256 of the DER encoding
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Prefix of the fingerprint shown to operators
    pub fn short_fingerprint(&self) -> &str {
        short_fingerprint(&self.fingerprint)
    }
}

pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

pub fn short_fingerprint(fingerprint: &str) -> &str {
    let end = fingerprint.len().min(SHORT_FINGERPRINT_LEN);
    &fingerprint[..end]
}

fn parse_block(text: &str, expected: &'static str) -> Result<Vec<u8>, CertificateError> {
    let block = pem::parse(text)?;
    if block.tag() != expected {
        return Err(CertificateError::WrongTag {
            expected,
            found: block.tag().to_string(),
        });
    }
    Ok(block.into_contents())
}

/// Certificates owned by this host
#[derive(Clone)]
pub struct CertificateStore {
    dir: PathBuf,
    server: Certificate,
    key: Vec<u8>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("dir", &self.dir)
            .field("server", &self.server.short_fingerprint())
            .finish_non_exhaustive()
    }
}

impl CertificateStore {
    /// Load the server certificate and key from `dir`, generating a
    /// self-signed pair for `name` on first start.
    pub fn load_or_generate(dir: &Path, name: &str) -> Result<Self, CertificateError> {
        let cert_path = dir.join(SERVER_CERT);
        let key_path = dir.join(SERVER_KEY);

        let (server, key) = if cert_path.exists() {
            let server = Certificate::from_pem(&read(&cert_path)?)?;
            let key = parse_block(&read(&key_path)?, "PRIVATE KEY")?;
            (server, key)
        } else {
            fs::create_dir_all(dir).map_err(|source| CertificateError::Io {
                path: dir.to_path_buf(),
                source,
            })?;

            let generated = rcgen::generate_simple_self_signed(vec![name.to_string()])?;
            let pem = generated.cert.pem();
            write(&cert_path, &pem)?;
            write(&key_path, &generated.key_pair.serialize_pem())?;

            tracing::info!(path = %cert_path.display(), "🔐 Generated server certificate");
            (Certificate::from_pem(&pem)?, generated.key_pair.serialize_der())
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            server,
            key,
        })
    }

    pub fn server(&self) -> &Certificate {
        &self.server
    }

    /// PKCS#8 DER of the server key
    pub fn server_key(&self) -> &[u8] {
        &self.key
    }

    /// The shared cluster certificate, present once this host is bootstrapped
    pub fn cluster(&self) -> Result<Option<Certificate>, CertificateError> {
        let path = self.dir.join(CLUSTER_CERT);
        if !path.exists() {
            return Ok(None);
        }

        Ok(Some(Certificate::from_pem(&read(&path)?)?))
    }

    /// Record the certificate of the orchestrator cluster this host
    /// belongs to. Written when formation bootstraps the cluster here, or
    /// when a peer hands it over with an orchestrator join token.
    pub fn set_cluster(&self, cert: &Certificate) -> Result<(), CertificateError> {
        write(&self.dir.join(CLUSTER_CERT), cert.pem())?;
        tracing::info!(fingerprint = %cert.short_fingerprint(), "🔐 Stored cluster certificate");
        Ok(())
    }

    /// Certificate an operator should compare: the cluster certificate
    /// outlives bootstrap, so it wins when present.
    pub fn identity(&self) -> Result<Certificate, CertificateError> {
        Ok(self.cluster()?.unwrap_or_else(|| self.server.clone()))
    }
}

fn read(path: &Path) -> Result<String, CertificateError> {
    fs::read_to_string(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}
