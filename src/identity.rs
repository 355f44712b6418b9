//! Certificate-based agent identity.
//!
//! Agents claim string IDs from the network; the service answers with an
//! [`AgentCertificate`] — an HMAC-SHA256 credential binding the ID to a
//! time window. The certificate is the sole proof of identity on
//! reconnect: a hello presenting a valid certificate for a claimed ID is
//! admitted, a hello without one is rejected while the claim stands.
//!
//! The signing secret never leaves the [`IdentityManager`]; certificates
//! are bearer tokens and clients persist them as plain JSON (§on-disk
//! format below).

use crate::error::{NetworkError, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length of the HMAC signing secret in bytes.
pub const SECRET_LENGTH: usize = 32;

/// An agent identity certificate.
///
/// The on-disk format is this object serialized as UTF-8 JSON with
/// exactly these five fields; readers reject unknown fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentCertificate {
    /// The agent ID this certificate is for.
    pub agent_id: String,
    /// Unix timestamp when the certificate was issued.
    pub issued_at: f64,
    /// Unix timestamp when the certificate expires.
    pub expires_at: f64,
    /// SHA-256 of the canonical signing form, lowercase hex.
    pub certificate_hash: String,
    /// HMAC-SHA256 over the canonical signing form, lowercase hex.
    pub signature: String,
}

impl AgentCertificate {
    /// Whether the certificate's validity window has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        crate::message::now_timestamp() > self.expires_at
    }

    /// Whether this certificate names `agent_id` and is still in window.
    #[must_use]
    pub fn is_valid_for_agent(&self, agent_id: &str) -> bool {
        self.agent_id == agent_id && !self.is_expired()
    }

    /// Serialize to the on-disk JSON form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the on-disk JSON form. Unknown top-level fields are
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidCertificate`] on any parse failure.
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| NetworkError::InvalidCertificate(format!("malformed certificate: {e}")))
    }
}

/// Canonical signing form: keys in lexicographic order, compact JSON.
#[derive(Serialize)]
struct CanonicalForm<'a> {
    agent_id: &'a str,
    expires_at: f64,
    issued_at: f64,
}

#[derive(Default)]
struct IdentityState {
    claimed: HashSet<String>,
    certificates: HashMap<String, AgentCertificate>,
}

/// Statistics snapshot from an identity manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityStats {
    pub claimed_agents: usize,
    pub active_certificates: usize,
    pub ttl_hours: u64,
}

/// Issues, validates, and expires agent identity certificates.
///
/// All state lives behind one mutex; operations are synchronous and never
/// suspend while holding it. Expired entries are swept lazily on every
/// query, and the owning service additionally runs a coarse sweep timer.
pub struct IdentityManager {
    secret: Zeroizing<[u8; SECRET_LENGTH]>,
    ttl: Duration,
    state: Mutex<IdentityState>,
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("secret", &"<REDACTED>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl IdentityManager {
    /// Create a manager with a freshly generated 32-byte secret.
    #[must_use]
    pub fn new(ttl_hours: u64) -> Self {
        let mut secret = [0u8; SECRET_LENGTH];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);
        Self::with_secret(secret, ttl_hours)
    }

    /// Create a manager with a supplied secret (shared-secret clusters).
    #[must_use]
    pub fn with_secret(secret: [u8; SECRET_LENGTH], ttl_hours: u64) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            ttl: Duration::from_secs(ttl_hours * 3600),
            state: Mutex::new(IdentityState::default()),
        }
    }

    /// Certificate lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claim `agent_id` and issue a certificate.
    ///
    /// Returns `None` if the ID is already claimed and `force` is false.
    /// With `force`, any prior certificate is discarded and a fresh one
    /// issued — older certificates for the ID stop validating.
    pub fn claim(&self, agent_id: &str, force: bool) -> Option<AgentCertificate> {
        let mut state = self.lock_swept();
        if state.claimed.contains(agent_id) && !force {
            tracing::warn!(agent_id, "agent id already claimed");
            return None;
        }

        let issued_at = crate::message::now_timestamp();
        let expires_at = issued_at + self.ttl.as_secs_f64();
        let canonical = canonical_form(agent_id, issued_at, expires_at);
        let certificate = AgentCertificate {
            agent_id: agent_id.to_string(),
            issued_at,
            expires_at,
            certificate_hash: sha256_hex(&canonical),
            signature: self.sign(&canonical),
        };

        state.claimed.insert(agent_id.to_string());
        state
            .certificates
            .insert(agent_id.to_string(), certificate.clone());
        tracing::info!(agent_id, expires_at, "issued identity certificate");
        Some(certificate)
    }

    /// Validate a presented certificate.
    ///
    /// Recomputes hash and signature over the canonical form, compares
    /// the signature in constant time, and requires the stored
    /// certificate for the ID to carry the same hash (a force reclaim
    /// therefore invalidates earlier certificates).
    pub fn validate(&self, certificate: &AgentCertificate) -> bool {
        if certificate.is_expired() {
            tracing::warn!(agent_id = %certificate.agent_id, "certificate expired");
            return false;
        }

        let canonical = canonical_form(
            &certificate.agent_id,
            certificate.issued_at,
            certificate.expires_at,
        );
        if !self.verify_signature(&canonical, &certificate.signature) {
            tracing::warn!(agent_id = %certificate.agent_id, "certificate signature mismatch");
            return false;
        }
        if certificate.certificate_hash != sha256_hex(&canonical) {
            tracing::warn!(agent_id = %certificate.agent_id, "certificate hash mismatch");
            return false;
        }

        let state = self.lock_swept();
        match state.certificates.get(&certificate.agent_id) {
            Some(stored) if stored.certificate_hash == certificate.certificate_hash => true,
            _ => {
                tracing::warn!(agent_id = %certificate.agent_id, "certificate not in store");
                false
            }
        }
    }

    /// Release a claim. Idempotent.
    pub fn release(&self, agent_id: &str) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.claimed.remove(agent_id) {
            state.certificates.remove(agent_id);
            tracing::info!(agent_id, "released agent id");
        }
    }

    /// Whether `agent_id` currently has an unexpired claim.
    pub fn is_claimed(&self, agent_id: &str) -> bool {
        self.lock_swept().claimed.contains(agent_id)
    }

    /// The stored certificate for `agent_id`, if unexpired.
    pub fn get(&self, agent_id: &str) -> Option<AgentCertificate> {
        self.lock_swept().certificates.get(agent_id).cloned()
    }

    /// Drop expired certificates and their claims.
    pub fn sweep(&self) {
        drop(self.lock_swept());
    }

    /// Counters for diagnostics.
    pub fn stats(&self) -> IdentityStats {
        let state = self.lock_swept();
        IdentityStats {
            claimed_agents: state.claimed.len(),
            active_certificates: state.certificates.len(),
            ttl_hours: self.ttl.as_secs() / 3600,
        }
    }

    fn lock_swept(&self) -> std::sync::MutexGuard<'_, IdentityState> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = crate::message::now_timestamp();
        let expired: Vec<String> = state
            .certificates
            .iter()
            .filter(|(_, cert)| now > cert.expires_at)
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in expired {
            tracing::debug!(agent_id = %agent_id, "sweeping expired certificate");
            state.claimed.remove(&agent_id);
            state.certificates.remove(&agent_id);
        }
        state
    }

    fn sign(&self, data: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret[..])
            .expect("HMAC accepts keys of any length");
        mac.update(data.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify_signature(&self, data: &str, signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret[..])
            .expect("HMAC accepts keys of any length");
        mac.update(data.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

fn canonical_form(agent_id: &str, issued_at: f64, expires_at: f64) -> String {
    serde_json::to_string(&CanonicalForm {
        agent_id,
        expires_at,
        issued_at,
    })
    .unwrap_or_default()
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}
