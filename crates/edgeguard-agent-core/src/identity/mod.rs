//! Identity manager - owns the on-disk certificate triple and produces the
//! authenticated transport.
//!
//! The manager never hands out the triple itself. Components that need to
//! talk to the control plane call [`IdentityManager::transport`] and get a
//! `reqwest::Client` configured for mutual TLS: the client certificate is
//! presented, the peer is validated against the stored CA bundle only, and
//! TLS 1.2 is the floor. There is no other authenticated transport
//! constructor in the system.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use x509_parser::pem::Pem;

use crate::config::TlsPaths;

/// Certificates closer than this to expiry trigger a re-bootstrap, so
/// rotation happens with margin rather than at the deadline.
pub const REBOOTSTRAP_MARGIN_HOURS: i64 = 24;

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity not present on disk")]
    Missing,

    #[error("malformed PEM in {path}: {reason}")]
    MalformedPem { path: PathBuf, reason: String },

    #[error("certificate chain validation failed")]
    ChainInvalid,

    #[error("certificate has no subject common name")]
    MissingCommonName,

    #[error("failed to build mTLS transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result of a successful identity verification.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    /// Agent ID, taken from the certificate's Subject Common Name.
    pub agent_id: String,
    pub not_after: DateTime<Utc>,
}

/// The PEM triple as received from the control plane.
#[derive(Debug, Clone)]
pub struct IdentityTriple {
    pub certificate: String,
    pub private_key: String,
    pub ca_cert: String,
}

/// Owns the certificate/key/CA paths and everything derived from them.
pub struct IdentityManager {
    cert_path: PathBuf,
    key_path: PathBuf,
    ca_path: PathBuf,
}

impl IdentityManager {
    /// Creates the manager and the certificate directory (owner-only).
    pub fn new(tls: &TlsPaths) -> Result<Self, IdentityError> {
        if let Some(dir) = tls.cert_file.parent() {
            fs::create_dir_all(dir).map_err(|source| IdentityError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
            }
        }

        Ok(Self {
            cert_path: tls.cert_file.clone(),
            key_path: tls.key_file.clone(),
            ca_path: tls.ca_file.clone(),
        })
    }

    /// Whether all three files of the triple exist.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists() && self.ca_path.exists()
    }

    /// Parses and validates the stored identity.
    ///
    /// Checks that the private key and certificate parse, that the
    /// certificate chain validates against the stored CA bundle, and
    /// extracts the agent ID (Subject CN) and expiry.
    pub fn verify(&self) -> Result<VerifiedIdentity, IdentityError> {
        if !self.has_identity() {
            return Err(IdentityError::Missing);
        }

        let key_bytes = read(&self.key_path)?;
        let mut key_reader: &[u8] = &key_bytes;
        match rustls_pemfile::private_key(&mut key_reader) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(IdentityError::MalformedPem {
                    path: self.key_path.clone(),
                    reason: "no private key found".to_string(),
                })
            }
            Err(e) => {
                return Err(IdentityError::MalformedPem {
                    path: self.key_path.clone(),
                    reason: e.to_string(),
                })
            }
        }

        let cert_bytes = read(&self.cert_path)?;
        let cert_pem = first_pem(&cert_bytes, &self.cert_path)?;
        let cert = cert_pem
            .parse_x509()
            .map_err(|e| IdentityError::MalformedPem {
                path: self.cert_path.clone(),
                reason: e.to_string(),
            })?;

        let ca_bytes = read(&self.ca_path)?;
        let mut chain_ok = false;
        for ca_pem in Pem::iter_from_buffer(&ca_bytes).flatten() {
            if let Ok(ca) = ca_pem.parse_x509() {
                if cert.verify_signature(Some(ca.public_key())).is_ok() {
                    chain_ok = true;
                    break;
                }
            }
        }
        if !chain_ok {
            return Err(IdentityError::ChainInvalid);
        }

        let agent_id = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or(IdentityError::MissingCommonName)?
            .to_string();

        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .unwrap_or_else(Utc::now);

        debug!("identity verified: agent_id={agent_id}, not_after={not_after}");
        Ok(VerifiedIdentity { agent_id, not_after })
    }

    /// Whether the agent must run the bootstrap flow again: any of the
    /// triple is absent, the pair fails to parse, the chain fails to
    /// validate, or the certificate expires within the rotation margin.
    #[must_use]
    pub fn needs_rebootstrap(&self) -> bool {
        let identity = match self.verify() {
            Ok(identity) => identity,
            Err(e) => {
                warn!("identity verification failed: {e}");
                return true;
            }
        };

        let margin = ChronoDuration::hours(REBOOTSTRAP_MARGIN_HOURS);
        if identity.not_after - Utc::now() < margin {
            warn!("certificate expires soon: {}", identity.not_after);
            return true;
        }
        false
    }

    /// Agent ID from the stored certificate, if it verifies.
    #[must_use]
    pub fn agent_id(&self) -> Option<String> {
        self.verify().ok().map(|v| v.agent_id)
    }

    /// Persists a new triple, replacing any previous one.
    ///
    /// Each file is written atomically (temp file + rename). The key and
    /// certificate are owner-only; the CA bundle may be world-readable.
    pub fn store(&self, triple: &IdentityTriple) -> Result<(), IdentityError> {
        write_atomic(&self.cert_path, triple.certificate.as_bytes(), 0o600)?;
        write_atomic(&self.key_path, triple.private_key.as_bytes(), 0o600)?;
        write_atomic(&self.ca_path, triple.ca_cert.as_bytes(), 0o644)?;
        debug!("identity triple saved");
        Ok(())
    }

    /// Removes the triple from disk (uninstall path).
    pub fn delete(&self) -> Result<(), IdentityError> {
        for path in [&self.cert_path, &self.key_path, &self.ca_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(IdentityError::Io {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Builds the authenticated transport: client certificate presented,
    /// peer validated against the stored CA bundle only, TLS >= 1.2.
    pub fn transport(&self) -> Result<reqwest::Client, IdentityError> {
        let cert_pem = read(&self.cert_path)?;
        let key_pem = read(&self.key_path)?;
        let ca_pem = read(&self.ca_path)?;

        // rustls wants key and certificate in one PEM blob.
        let mut identity_pem = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
        identity_pem.extend_from_slice(&key_pem);
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&cert_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem)?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .tls_built_in_root_certs(false)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .timeout(TRANSPORT_TIMEOUT);

        for ca in reqwest::Certificate::from_pem_bundle(&ca_pem)? {
            builder = builder.add_root_certificate(ca);
        }

        Ok(builder.build()?)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, IdentityError> {
    fs::read(path).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn first_pem(bytes: &[u8], path: &Path) -> Result<Pem, IdentityError> {
    Pem::iter_from_buffer(bytes)
        .next()
        .ok_or_else(|| IdentityError::MalformedPem {
            path: path.to_path_buf(),
            reason: "no PEM block found".to_string(),
        })?
        .map_err(|e| IdentityError::MalformedPem {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<(), IdentityError> {
    #[cfg(not(unix))]
    let _ = mode;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::write(&tmp, data).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode)).map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
