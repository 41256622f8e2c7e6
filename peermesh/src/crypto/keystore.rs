//! Key storage
//!
//! Persistence of identity key pairs is a swappable collaborator. The
//! controller only needs `load` and `save`; where the bytes live is up to the
//! implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{KeyPair, PrivateKeyJwk, PublicKeyJwk};

/// Capability for loading and saving identity key pairs
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load the key pair for `user_id`, if one was saved
    async fn load(&self, user_id: &str) -> CryptoResult<Option<KeyPair>>;

    /// Save (or replace) the key pair for `user_id`
    async fn save(&self, user_id: &str, key_pair: &KeyPair) -> CryptoResult<()>;
}

/// Process-local key store, lost on exit
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, PrivateKeyJwk>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self, user_id: &str) -> CryptoResult<Option<KeyPair>> {
        let keys = self.keys.read().await;
        keys.get(user_id).map(KeyPair::from_private_jwk).transpose()
    }

    async fn save(&self, user_id: &str, key_pair: &KeyPair) -> CryptoResult<()> {
        let mut keys = self.keys.write().await;
        keys.insert(user_id.to_string(), key_pair.private_jwk());
        Ok(())
    }
}

/// SQLite-backed key store
pub struct SqliteKeyStore {
    /// Database connection pool
    db: SqlitePool,
}

impl SqliteKeyStore {
    /// Wrap an existing pool and make sure the key table exists
    pub async fn new(db: SqlitePool) -> CryptoResult<Self> {
        let store = Self { db };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (creating if needed) the database at `url`
    ///
    /// A single connection is used so that `sqlite::memory:` databases are
    /// shared by every query.
    pub async fn connect(url: &str) -> CryptoResult<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        tracing::info!("Key store opened at: {}", url);
        Self::new(db).await
    }

    async fn migrate(&self) -> CryptoResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity_keys (
                user_id TEXT PRIMARY KEY,
                public_jwk TEXT NOT NULL,
                private_jwk TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Get all identities with a stored key pair
    pub async fn list_identities(&self) -> CryptoResult<Vec<String>> {
        let results = sqlx::query(r#"SELECT user_id FROM identity_keys ORDER BY user_id"#)
            .fetch_all(&self.db)
            .await?;

        Ok(results.into_iter().map(|r| r.get("user_id")).collect())
    }

    /// Delete the key pair of an identity
    pub async fn delete(&self, user_id: &str) -> CryptoResult<()> {
        sqlx::query(r#"DELETE FROM identity_keys WHERE user_id = $1"#)
            .bind(user_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn load(&self, user_id: &str) -> CryptoResult<Option<KeyPair>> {
        let result = sqlx::query(
            r#"SELECT public_jwk, private_jwk FROM identity_keys WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        match result {
            Some(row) => {
                let public_jwk: String = row.get("public_jwk");
                let private_jwk: String = row.get("private_jwk");

                let public: PublicKeyJwk = serde_json::from_str(&public_jwk)?;
                let private: PrivateKeyJwk = serde_json::from_str(&private_jwk)?;
                let key_pair = KeyPair::from_private_jwk(&private)?;

                if key_pair.public_jwk() != public {
                    return Err(CryptoError::InvalidKey(format!(
                        "Stored public key does not match private key for {}",
                        user_id
                    )));
                }
                Ok(Some(key_pair))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, user_id: &str, key_pair: &KeyPair) -> CryptoResult<()> {
        let public_jwk = serde_json::to_string(&key_pair.public_jwk())?;
        let private_jwk = serde_json::to_string(&key_pair.private_jwk())?;

        sqlx::query(
            r#"
            INSERT INTO identity_keys (user_id, public_jwk, private_jwk, updated_at)
            VALUES ($1, $2, $3, CURRENT_TIMESTAMP)
            ON CONFLICT(user_id) DO UPDATE SET
                public_jwk = excluded.public_jwk,
                private_jwk = excluded.private_jwk,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id)
        .bind(&public_jwk)
        .bind(&private_jwk)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
