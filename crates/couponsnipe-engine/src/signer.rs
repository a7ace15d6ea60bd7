//! Per-site signer capabilities.
//!
//! Some sites require extra anti-bot headers on claim requests. The engine
//! treats signature generation as an opaque capability looked up by site
//! identifier: an unknown site is a normal, typed "unsigned" case and a
//! failing signer degrades to unsigned headers. Neither ever aborts an
//! attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};

use couponsnipe_core::Result;

use crate::task::RequestSpec;

/// A site-specific header producer.
#[async_trait]
pub trait SiteSigner: Send + Sync {
    /// Headers to merge into the outgoing request.
    async fn sign(&self, request: &RequestSpec) -> Result<BTreeMap<String, String>>;
}

/// Capability-lookup table keyed by site identifier.
pub struct SignerRegistry {
    signers: HashMap<String, Arc<dyn SiteSigner>>,
}

impl SignerRegistry {
    /// Empty registry: every site is unsigned.
    pub fn new() -> Self {
        Self { signers: HashMap::new() }
    }

    /// Registry with the fingerprint capability attached to the sites whose
    /// claim flows expect it.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let fingerprint: Arc<dyn SiteSigner> = Arc::new(FingerprintSigner::new());
        for site in ["meituan.com", "jd.com"] {
            registry.register(site, Arc::clone(&fingerprint));
        }
        registry
    }

    pub fn register(&mut self, site: &str, signer: Arc<dyn SiteSigner>) {
        self.signers.insert(site.to_string(), signer);
    }

    pub fn is_available(&self, site: &str) -> bool {
        self.signers.contains_key(site)
    }

    /// Sign a request for `site`. Unknown site or signer failure yields
    /// empty (unsigned) headers; execution continues either way.
    pub async fn sign_for(&self, site: &str, request: &RequestSpec) -> BTreeMap<String, String> {
        let Some(signer) = self.signers.get(site) else {
            return BTreeMap::new();
        };
        match signer.sign(request).await {
            Ok(headers) => headers,
            Err(e) => {
                tracing::warn!("⚠️ Signer for {site} failed, sending unsigned: {e}");
                BTreeMap::new()
            }
        }
    }
}

impl Default for SignerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default capability: a per-request client fingerprint hash.
///
/// Hashes session id, request sequence, timestamp, and a random nonce into
/// `X-Fingerprint`, with `X-Request-ID`/`X-Timestamp` alongside. Sites that
/// need a real proprietary signature get their own `SiteSigner` injected by
/// the embedder.
pub struct FingerprintSigner {
    session_id: String,
    sequence: AtomicU64,
}

impl FingerprintSigner {
    pub fn new() -> Self {
        let nonce: u64 = rand::thread_rng().r#gen();
        Self {
            session_id: format!("sess_{}_{nonce:x}", Utc::now().timestamp_millis()),
            sequence: AtomicU64::new(0),
        }
    }
}

impl Default for FingerprintSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SiteSigner for FingerprintSigner {
    async fn sign(&self, request: &RequestSpec) -> Result<BTreeMap<String, String>> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();
        let nonce: u64 = rand::thread_rng().r#gen();

        let mut hasher = Sha256::new();
        hasher.update(self.session_id.as_bytes());
        hasher.update(request.url.as_bytes());
        hasher.update(seq.to_le_bytes());
        hasher.update(now.to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        let digest = hasher.finalize();
        let fingerprint: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        Ok(BTreeMap::from([
            ("X-Fingerprint".to_string(), fingerprint),
            ("X-Request-ID".to_string(), format!("req_{now}_{seq}")),
            ("X-Timestamp".to_string(), now.to_string()),
        ]))
    }
}
