// Wallet-keyed user registry, login challenges and session tokens

pub mod signature;

use std::sync::Arc;

use chrono::Duration;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain_client::normalize_address;
use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult, StorageError};
use crate::storage::DatabaseTrait;
use crate::types::{ChallengeResponse, SessionResponse, User};

pub use signature::{address_of, personal_message_hash, recover_signer};

/// Session token claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionClaims {
    pub sub: String, // user id
    pub wallet: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct UserRegistry {
    database: Arc<dyn DatabaseTrait>,
    clock: Arc<dyn Clock>,
    session_secret: Vec<u8>,
    session_ttl: Duration,
}

impl UserRegistry {
    /// Without a configured secret, sessions are signed with a random key and do not survive a restart.
    pub fn new(
        database: Arc<dyn DatabaseTrait>,
        clock: Arc<dyn Clock>,
        session_secret: Option<&str>,
        session_ttl: Duration,
    ) -> Self {
        let session_secret = match session_secret.filter(|secret| !secret.is_empty()) {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };
        Self { database, clock, session_secret, session_ttl }
    }

    /// Issue a fresh login nonce, registering the wallet on first sight.
    pub async fn challenge(&self, wallet_address: &str) -> LedgerResult<ChallengeResponse> {
        let wallet = normalize_wallet(wallet_address)?;
        let user = self.get_or_register(&wallet).await?;

        let nonce = new_nonce();
        self.database.set_auth_nonce(user.id, &nonce).await?;
        debug!("Issued login nonce for {}", wallet);

        Ok(ChallengeResponse {
            user_id: user.id,
            message: challenge_message(&wallet, &nonce),
            wallet_address: wallet,
        })
    }

    /// Check a signed challenge and open a session. A successful check consumes the nonce.
    pub async fn verify(&self, wallet_address: &str, signature: &str) -> LedgerResult<SessionResponse> {
        let wallet = normalize_wallet(wallet_address)?;
        let user = self.require_user(&wallet).await?;
        let Some(nonce) = user.auth_nonce.as_deref().filter(|nonce| !nonce.is_empty()) else {
            return Err(LedgerError::Unauthenticated("request a login challenge first".to_string()));
        };

        let signer = recover_signer(&challenge_message(&wallet, nonce), signature);
        if signer.as_deref() != Some(wallet.as_str()) {
            warn!(target: "security", "Login signature for {} recovered to {:?}", wallet, signer);
            return Err(LedgerError::Unauthenticated("signature does not match the wallet".to_string()));
        }

        // Single use
        self.database.set_auth_nonce(user.id, &new_nonce()).await?;

        let now = self.clock.now();
        let expires_at = now + self.session_ttl;
        let claims = SessionClaims {
            sub: user.id.to_string(),
            wallet: wallet.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(&self.session_secret))
            .map_err(|e| LedgerError::Storage(StorageError::Backend(anyhow::anyhow!("session token encoding: {}", e))))?;

        info!("🔑 Session opened for {} ({})", wallet, user.id);
        Ok(SessionResponse { token, user_id: user.id, wallet_address: wallet, expires_at })
    }

    /// Resolve a session token to its user.
    pub async fn authenticate(&self, token: &str) -> LedgerResult<User> {
        // Expiry is checked against the service clock below
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        let claims = decode::<SessionClaims>(token, &DecodingKey::from_secret(&self.session_secret), &validation)
            .map_err(|e| {
                debug!("Rejected session token: {}", e);
                LedgerError::Unauthenticated("invalid session token".to_string())
            })?
            .claims;

        if claims.exp <= self.clock.now().timestamp() {
            return Err(LedgerError::Unauthenticated("session expired".to_string()));
        }

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| LedgerError::Unauthenticated("invalid session token".to_string()))?;
        match self.database.get_user(user_id).await? {
            Some(user) if user.wallet_address == claims.wallet => Ok(user),
            _ => Err(LedgerError::Unauthenticated("session user no longer exists".to_string())),
        }
    }

    pub async fn require_user(&self, wallet_address: &str) -> LedgerResult<User> {
        let wallet = normalize_wallet(wallet_address)?;
        self.database
            .get_user_by_wallet(&wallet)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("user with wallet {}", wallet)))
    }

    async fn get_or_register(&self, wallet: &str) -> LedgerResult<User> {
        if let Some(user) = self.database.get_user_by_wallet(wallet).await? {
            return Ok(user);
        }

        let user = User {
            id: Uuid::new_v4(),
            wallet_address: wallet.to_string(),
            legacy_balance: Decimal::ZERO,
            auth_nonce: None,
            created_at: self.clock.now(),
        };

        match self.database.insert_user(&user).await {
            Ok(()) => {
                info!("👤 Registered user {} for wallet {}", user.id, wallet);
                Ok(user)
            }
            // Concurrent first challenge for the same wallet
            Err(StorageError::DuplicateWallet(_)) => self
                .database
                .get_user_by_wallet(wallet)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("user with wallet {}", wallet))),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn challenge_message(wallet: &str, nonce: &str) -> String {
    format!("Sign this message to log in to Price Battles.\n\nWallet: {}\nNonce: {}", wallet, nonce)
}

fn normalize_wallet(wallet_address: &str) -> LedgerResult<String> {
    normalize_address(wallet_address)
        .ok_or_else(|| LedgerError::Validation("wallet address must be a 0x-prefixed 20-byte address".to_string()))
}

fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::Database;
    use chrono::{TimeZone, Utc};
    use k256::ecdsa::SigningKey;

    async fn registry() -> (UserRegistry, Arc<ManualClock>) {
        let database: Arc<dyn DatabaseTrait> = Arc::new(Database::new_test().await.unwrap());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let registry = UserRegistry::new(database, clock.clone(), Some("test-secret"), Duration::hours(1));
        (registry, clock)
    }

    fn signing_key(byte: u8) -> SigningKey {
        let mut secret = [0u8; 32];
        secret[31] = byte;
        SigningKey::from_slice(&secret).unwrap()
    }

    fn sign(key: &SigningKey, message: &str) -> String {
        let (signature, recovery_id) = key.sign_prehash_recoverable(&personal_message_hash(message)).unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        format!("0x{}", hex::encode(bytes))
    }

    #[tokio::test]
    async fn challenge_registers_once_and_rotates_nonce() {
        let (registry, _) = registry().await;
        let wallet = "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01";

        let first = registry.challenge(wallet).await.unwrap();
        let second = registry.challenge(&wallet.to_lowercase()).await.unwrap();

        assert_eq!(first.user_id, second.user_id);
        assert_eq!(first.wallet_address, wallet.to_lowercase());
        assert_ne!(first.message, second.message);

        let user = registry.require_user(wallet).await.unwrap();
        assert_eq!(user.id, first.user_id);
        assert!(user.auth_nonce.is_some());
    }

    #[tokio::test]
    async fn rejects_malformed_wallets() {
        let (registry, _) = registry().await;
        assert!(matches!(registry.challenge("not-a-wallet").await, Err(LedgerError::Validation(_))));
        assert!(matches!(
            registry.require_user("0x0000000000000000000000000000000000000001").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn signed_challenge_opens_a_single_use_session() {
        let (registry, _) = registry().await;
        let key = signing_key(9);
        let wallet = address_of(key.verifying_key());

        let challenge = registry.challenge(&wallet).await.unwrap();
        let signature = sign(&key, &challenge.message);
        let session = registry.verify(&wallet, &signature).await.unwrap();

        let user = registry.authenticate(&session.token).await.unwrap();
        assert_eq!(user.id, challenge.user_id);

        // The nonce was consumed
        assert!(matches!(
            registry.verify(&wallet, &signature).await,
            Err(LedgerError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn signature_from_another_key_is_refused() {
        let (registry, _) = registry().await;
        let wallet = address_of(signing_key(9).verifying_key());

        let challenge = registry.challenge(&wallet).await.unwrap();
        let forged = sign(&signing_key(10), &challenge.message);
        assert!(matches!(registry.verify(&wallet, &forged).await, Err(LedgerError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn sessions_expire_and_reject_tampering() {
        let (registry, clock) = registry().await;
        let key = signing_key(9);
        let wallet = address_of(key.verifying_key());
        let challenge = registry.challenge(&wallet).await.unwrap();
        let session = registry.verify(&wallet, &sign(&key, &challenge.message)).await.unwrap();

        let mut tampered = session.token.clone();
        tampered.push('x');
        assert!(matches!(registry.authenticate(&tampered).await, Err(LedgerError::Unauthenticated(_))));

        clock.advance(Duration::hours(2));
        assert!(matches!(
            registry.authenticate(&session.token).await,
            Err(LedgerError::Unauthenticated(_))
        ));
    }
}
