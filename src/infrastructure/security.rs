//! C3 — Security Manager. Registration-key-derived peer authentication,
//! session establishment, per-session symmetric keys, audit log, and rate
//! limiting (§4.3). No user/password auth: this carries over the rate
//! limiter and audit-log shape from this codebase's existing security
//! service, but the JWT/Argon2 user-auth path is replaced end to end —
//! see DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::infrastructure::model::{AuditEntry, AuditEventType, Session};
use crate::infrastructure::traits::SecurityStore;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub session_lifetime: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
    pub max_failed_attempts: u32,
    pub auth_token_lifetime: Duration,
    pub encryption_enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_lifetime: Duration::from_secs(3600),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 100,
            max_failed_attempts: 3,
            auth_token_lifetime: Duration::from_secs(5 * 60),
            encryption_enabled: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    pub node_id: String,
    pub nonce: String,
    pub key_proof: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub auth_token: String,
    pub expires_at: DateTime<Utc>,
}

struct IssuedToken {
    initiator_node_id: String,
    source_address: String,
    expires_at: DateTime<Utc>,
}

/// A registration key plus, during rotation, the key it is replacing. Both are
/// accepted for authentication until the grace period elapses (§4.3).
struct KeyRing {
    current: String,
    previous: Option<(String, DateTime<Utc>)>,
    grace_period: Duration,
}

impl KeyRing {
    fn candidates(&self) -> Vec<&str> {
        let mut keys = vec![self.current.as_str()];
        if let Some((old, rotated_at)) = &self.previous {
            if Utc::now().signed_duration_since(*rotated_at).to_std().unwrap_or_default()
                < self.grace_period
            {
                keys.push(old.as_str());
            }
        }
        keys
    }
}

pub struct SecurityManager {
    node_id: String,
    keys: RwLock<KeyRing>,
    store: Arc<dyn SecurityStore>,
    rate_limiter: Arc<RateLimiter>,
    config: SecurityConfig,
    issued_tokens: RwLock<HashMap<String, IssuedToken>>,
}

/// `H(registrationKey ∥ nodeId ∥ nonce)` — HMAC-SHA256 keyed by the
/// registration key, not a bare hash, so it behaves as a real MAC (§4.3).
fn key_proof(registration_key: &str, node_id: &str, nonce: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(registration_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(node_id.as_bytes());
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl SecurityManager {
    pub fn new(
        node_id: String,
        registration_key: String,
        store: Arc<dyn SecurityStore>,
        config: SecurityConfig,
    ) -> Self {
        Self {
            node_id,
            keys: RwLock::new(KeyRing {
                current: registration_key,
                previous: None,
                grace_period: Duration::from_secs(24 * 3600),
            }),
            store,
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_window,
                config.rate_limit_max_requests,
                config.max_failed_attempts,
            )),
            config,
            issued_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Checks a stamped `ChangeEventMetadata.registration_key_hash` against
    /// `H(registrationKey ∥ sourceNodeId)` recomputed from this node's own
    /// raw key material, trying each candidate during a rotation grace
    /// period (§4.3). Events are only ever produced by nodes sharing our
    /// registration key, so the raw key itself — never just a hash of it —
    /// is what a receiver needs to reconstruct the source node's stamp.
    pub async fn verify_registration_key_hash_for(
        &self,
        source_node_id: &str,
        claimed_hash: &str,
    ) -> bool {
        let keys = self.keys.read().await;
        keys.candidates()
            .iter()
            .any(|key| crate::infrastructure::clock::registration_key_hash(key, source_node_id) == claimed_hash)
    }

    /// Builds the `AUTH_REQUEST` payload this node sends as initiator.
    pub async fn build_auth_request(&self, nonce: &str) -> AuthRequest {
        let key = self.keys.read().await.current.clone();
        AuthRequest {
            node_id: self.node_id.clone(),
            nonce: nonce.to_string(),
            key_proof: key_proof(&key, &self.node_id, nonce),
        }
    }

    /// Responder side of the challenge-response handshake (§4.3 step 2).
    /// Failures never reveal whether the key or the nonce was the problem.
    #[instrument(skip(self, request))]
    pub async fn handle_auth_request(
        &self,
        request: &AuthRequest,
        source_address: &str,
    ) -> AppResult<AuthResponse> {
        if !self.rate_limiter.check(source_address).await {
            self.audit(
                AuditEventType::RateLimited,
                Some(&request.node_id),
                source_address,
                "rate limit exceeded for AUTH_REQUEST",
            )
            .await;
            return Err(AppError::TooManyRequests("authentication failed".into()));
        }

        let candidates = self.keys.read().await.candidates();
        let matched = candidates
            .iter()
            .any(|key| key_proof(key, &request.node_id, &request.nonce) == request.key_proof);

        if !matched {
            self.rate_limiter.record_failure(source_address).await;
            self.audit(
                AuditEventType::AuthFailure,
                Some(&request.node_id),
                source_address,
                "key proof mismatch",
            )
            .await;
            return Err(AppError::Unauthorized("authentication failed".into()));
        }

        self.rate_limiter.record_success(source_address).await;

        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.auth_token_lifetime).unwrap_or_default();

        self.issued_tokens.write().await.insert(
            token.clone(),
            IssuedToken {
                initiator_node_id: request.node_id.clone(),
                source_address: source_address.to_string(),
                expires_at,
            },
        );

        self.audit(
            AuditEventType::AuthSuccess,
            Some(&request.node_id),
            source_address,
            "authentication succeeded",
        )
        .await;

        Ok(AuthResponse {
            auth_token: token,
            expires_at,
        })
    }

    /// Session establishment (§4.3 step 3): derives a per-session AES-256-GCM
    /// key from data both sides already hold (the auth token and both node
    /// ids), so no separate Diffie-Hellman round trip is required on this
    /// trusted-LAN model (recorded in DESIGN.md).
    #[instrument(skip(self))]
    pub async fn open_session(
        &self,
        auth_token: &str,
        responder_node_id: &str,
        source_address: &str,
    ) -> AppResult<Session> {
        let issued = {
            let mut tokens = self.issued_tokens.write().await;
            tokens.remove(auth_token)
        };
        let issued = issued
            .ok_or_else(|| AppError::Unauthorized("authentication failed".into()))?;

        if issued.source_address != source_address || Utc::now() > issued.expires_at {
            self.audit(
                AuditEventType::AuthFailure,
                Some(&issued.initiator_node_id),
                source_address,
                "stale or mismatched auth token presented at session open",
            )
            .await;
            return Err(AppError::Unauthorized("authentication failed".into()));
        }

        let registration_key_hash = self.keys.read().await.current.clone();
        let symmetric_key = derive_session_key(
            &registration_key_hash,
            auth_token,
            &issued.initiator_node_id,
            responder_node_id,
        );

        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            peer_node_id: issued.initiator_node_id.clone(),
            symmetric_key,
            established_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.config.session_lifetime).unwrap_or_default(),
            last_used_at: now,
        };

        self.store.save_session(&session).await?;
        self.audit(
            AuditEventType::SessionEstablished,
            Some(&issued.initiator_node_id),
            source_address,
            "session established",
        )
        .await;

        Ok(session)
    }

    /// Validates a session is present and not expired (testable property 7).
    pub async fn validate_session(&self, session_id: &str) -> AppResult<Session> {
        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("session not found".into()))?;

        if session.is_expired(Utc::now()) {
            return Err(AppError::Unauthorized("session expired".into()));
        }
        Ok(session)
    }

    pub async fn revoke_session(&self, session_id: &str, source_address: &str) -> AppResult<()> {
        self.store.revoke_session(session_id).await?;
        self.audit(
            AuditEventType::SessionRevoked,
            None,
            source_address,
            &format!("session {} revoked", session_id),
        )
        .await;
        Ok(())
    }

    pub async fn sweep_expired_sessions(&self) -> AppResult<u64> {
        self.store.sweep_expired_sessions().await
    }

    /// Rotates the registration key, keeping the old one valid through the
    /// grace period (§4.3).
    pub async fn rotate_key(&self, new_key: String, source_address: &str) -> AppResult<()> {
        let mut keys = self.keys.write().await;
        let old = std::mem::replace(&mut keys.current, new_key);
        keys.previous = Some((old, Utc::now()));
        drop(keys);

        self.audit(AuditEventType::KeyRotated, None, source_address, "registration key rotated")
            .await;
        Ok(())
    }

    /// Encrypts a wire payload with the session key (AES-256-GCM); the returned
    /// tuple is `(nonce, ciphertext)`. No-op passthrough when encryption is
    /// disabled by configuration.
    pub fn encrypt(&self, session: &Session, plaintext: &[u8]) -> AppResult<(Vec<u8>, Vec<u8>)> {
        if !self.config.encryption_enabled {
            return Ok((Vec::new(), plaintext.to_vec()));
        }
        let key = Key::<Aes256Gcm>::from_slice(&session.symmetric_key);
        let cipher = Aes256Gcm::new(key);
        let mut nonce_bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AppError::Internal(format!("encryption failed: {}", e)))?;
        Ok((nonce_bytes.to_vec(), ciphertext))
    }

    pub fn decrypt(&self, session: &Session, nonce: &[u8], ciphertext: &[u8]) -> AppResult<Vec<u8>> {
        if !self.config.encryption_enabled {
            return Ok(ciphertext.to_vec());
        }
        let key = Key::<Aes256Gcm>::from_slice(&session.symmetric_key);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(nonce);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| AppError::Integrity(format!("decryption failed: {}", e)))
    }

    /// Lets the initiator derive the same session key the responder computed
    /// in `open_session`, without a second round trip: both sides already
    /// hold the registration key, the auth token, and both node ids (§4.3).
    pub async fn derive_symmetric_key_as_initiator(
        &self,
        auth_token: &str,
        initiator_node_id: &str,
        responder_node_id: &str,
    ) -> Vec<u8> {
        let registration_key = self.keys.read().await.current.clone();
        derive_session_key(&registration_key, auth_token, initiator_node_id, responder_node_id)
    }

    /// An HMAC over the ciphertext, carried in the wire frame's `hmac` field
    /// alongside AES-GCM's own authentication tag (§4.3).
    pub fn frame_hmac(&self, session_key: &[u8], ciphertext: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(session_key).expect("HMAC accepts keys of any length");
        mac.update(ciphertext);
        mac.finalize().into_bytes().to_vec()
    }

    async fn audit(
        &self,
        event_type: AuditEventType,
        source_node_id: Option<&str>,
        source_address: &str,
        detail: &str,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            event_type,
            source_node_id: source_node_id.map(str::to_string),
            source_address: source_address.to_string(),
            detail: detail.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!("failed to persist audit entry: {}", e);
        }
    }
}

fn derive_session_key(
    registration_key: &str,
    auth_token: &str,
    initiator_node_id: &str,
    responder_node_id: &str,
) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(registration_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(auth_token.as_bytes());
    mac.update(initiator_node_id.as_bytes());
    mac.update(responder_node_id.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Rolling-window rate limiter keyed by source address (§4.3 / §9: replaces
/// the ad-hoc per-handler limiting in the source with one shared structure).
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    max_failed_attempts: u32,
    buckets: RwLock<HashMap<String, Bucket>>,
}

struct Bucket {
    request_count: u32,
    failed_attempts: u32,
    window_start: DateTime<Utc>,
    blocked: bool,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32, max_failed_attempts: u32) -> Self {
        Self {
            window,
            max_requests,
            max_failed_attempts,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn window_elapsed(&self, bucket: &Bucket) -> bool {
        Utc::now().signed_duration_since(bucket.window_start).to_std().unwrap_or_default()
            >= self.window
    }

    pub async fn check(&self, source_address: &str) -> bool {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(source_address.to_string()).or_insert(Bucket {
            request_count: 0,
            failed_attempts: 0,
            window_start: Utc::now(),
            blocked: false,
        });

        if self.window_elapsed(bucket) {
            bucket.request_count = 0;
            bucket.failed_attempts = 0;
            bucket.window_start = Utc::now();
            bucket.blocked = false;
        }

        if bucket.blocked || bucket.request_count >= self.max_requests {
            bucket.blocked = true;
            return false;
        }

        bucket.request_count += 1;
        true
    }

    pub async fn record_failure(&self, source_address: &str) {
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get_mut(source_address) {
            bucket.failed_attempts += 1;
            if bucket.failed_attempts >= self.max_failed_attempts {
                bucket.blocked = true;
            }
        }
    }

    pub async fn record_success(&self, source_address: &str) {
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get_mut(source_address) {
            bucket.failed_attempts = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::SyncStore;

    async fn manager() -> SecurityManager {
        let store = Arc::new(SyncStore::new("sqlite::memory:").await.unwrap());
        store.init().await.unwrap();
        SecurityManager::new(
            "node-responder".into(),
            "shared-secret".into(),
            store,
            SecurityConfig::default(),
        )
    }

    #[tokio::test]
    async fn matching_key_authenticates() {
        let responder = manager().await;
        let initiator_key = "shared-secret".to_string();
        let nonce = fresh_nonce();
        let request = AuthRequest {
            node_id: "node-initiator".into(),
            nonce: nonce.clone(),
            key_proof: key_proof(&initiator_key, "node-initiator", &nonce),
        };
        let response = responder.handle_auth_request(&request, "10.0.0.5:9000").await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn mismatched_key_fails_without_revealing_reason() {
        let responder = manager().await;
        let nonce = fresh_nonce();
        let request = AuthRequest {
            node_id: "node-initiator".into(),
            nonce: nonce.clone(),
            key_proof: key_proof("wrong-secret", "node-initiator", &nonce),
        };
        let err = responder.handle_auth_request(&request, "10.0.0.5:9000").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn rate_limiter_blocks_after_window_max() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3, 10);
        for _ in 0..3 {
            assert!(limiter.check("1.2.3.4:1").await);
        }
        assert!(!limiter.check("1.2.3.4:1").await);
    }

    #[tokio::test]
    async fn full_handshake_establishes_session_with_matching_keys_on_both_sides() {
        let responder = manager().await;
        let nonce = fresh_nonce();
        let shared_key = "shared-secret".to_string();
        let request = AuthRequest {
            node_id: "node-initiator".into(),
            nonce: nonce.clone(),
            key_proof: key_proof(&shared_key, "node-initiator", &nonce),
        };
        let auth_response = responder.handle_auth_request(&request, "10.0.0.5:9000").await.unwrap();
        let session = responder
            .open_session(&auth_response.auth_token, "node-responder", "10.0.0.5:9000")
            .await
            .unwrap();
        assert_eq!(session.peer_node_id, "node-initiator");
        assert_eq!(session.symmetric_key.len(), 32);
    }

    #[tokio::test]
    async fn verifies_a_stamped_hash_produced_with_the_current_key() {
        let responder = manager().await;
        let stamped = crate::infrastructure::clock::registration_key_hash("shared-secret", "node-initiator");
        assert!(
            responder
                .verify_registration_key_hash_for("node-initiator", &stamped)
                .await
        );
    }

    #[tokio::test]
    async fn rejects_a_hash_stamped_with_a_different_key() {
        let responder = manager().await;
        let stamped = crate::infrastructure::clock::registration_key_hash("wrong-secret", "node-initiator");
        assert!(
            !responder
                .verify_registration_key_hash_for("node-initiator", &stamped)
                .await
        );
    }

    #[tokio::test]
    async fn accepts_the_previous_key_during_rotation_grace_period() {
        let responder = manager().await;
        let stamped = crate::infrastructure::clock::registration_key_hash("shared-secret", "node-initiator");
        responder.rotate_key("new-secret".into(), "10.0.0.5:9000").await.unwrap();
        assert!(
            responder
                .verify_registration_key_hash_for("node-initiator", &stamped)
                .await
        );
    }
}
