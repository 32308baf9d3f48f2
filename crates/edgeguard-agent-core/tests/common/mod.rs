//! Shared fixtures for the integration tests: a throwaway CA that issues
//! agent certificates, and a helper to serve an axum mock control plane on
//! an ephemeral port.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use edgeguard_agent_core::identity::IdentityTriple;

/// A self-signed CA that can issue agent leaf certificates.
pub struct TestCa {
    pub cert: rcgen::Certificate,
    pub key: rcgen::KeyPair,
}

impl TestCa {
    pub fn new() -> Self {
        let key = rcgen::KeyPair::generate().expect("ca key");
        let mut params = rcgen::CertificateParams::new(Vec::new()).expect("ca params");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "EdgeGuard Test CA");
        let cert = params.self_signed(&key).expect("ca cert");
        Self { cert, key }
    }

    /// Issues a leaf with the agent ID as Subject CN.
    pub fn issue(&self, agent_id: &str, valid_for: time::Duration) -> IdentityTriple {
        let leaf_key = rcgen::KeyPair::generate().expect("leaf key");
        let mut params =
            rcgen::CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, agent_id);
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
        params.not_after = time::OffsetDateTime::now_utc() + valid_for;
        let leaf = params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .expect("leaf cert");

        IdentityTriple {
            certificate: leaf.pem(),
            private_key: leaf_key.serialize_pem(),
            ca_cert: self.cert.pem(),
        }
    }
}

/// Binds an ephemeral port and serves `router` on it. Returns the base URL.
pub async fn serve(router: axum::Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock control plane");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("mock control plane failed");
    });
    (format!("http://{addr}"), task)
}

/// Serializes tests that mutate process environment variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
