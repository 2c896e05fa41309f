//! # parley-keystore
//!
//! Optional persistent storage for session keys, backed by SQLite.
//!
//! Keys are encrypted at rest under a 32-byte master key with AES-256-GCM;
//! the conversation id is bound as associated data so a row cannot be
//! silently remapped to another conversation. The store is optional — the
//! client runs purely in memory without one.

use std::path::Path;
use std::sync::Mutex;

use parley_crypto::aead;
use parley_crypto::key::SessionKey;
use rusqlite::{params, Connection, OptionalExtension};

/// Key store error types.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("at-rest decryption failed for {0}")]
    Decryption(String),

    #[error("corrupt row for {0}: {1}")]
    Corrupt(String, String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;

/// Persistent, at-rest-encrypted session key storage.
pub struct KeyStore {
    conn: Mutex<Connection>,
    master: SessionKey,
}

impl KeyStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Sqlite`] if the database cannot be opened
    /// or the schema cannot be created.
    pub fn open(path: &Path, master: SessionKey) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            master,
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory(master: SessionKey) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            master,
        })
    }

    /// Insert or replace the key for a conversation.
    pub fn save_session_key(&self, conversation_id: &str, key: &SessionKey) -> Result<()> {
        let nonce = aead::generate_nonce();
        let ciphertext = aead::encrypt(
            &self.master,
            &nonce,
            key.as_bytes(),
            conversation_id.as_bytes(),
        )
        .map_err(|_| KeyStoreError::Decryption(conversation_id.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO session_keys (conversation_id, nonce, ciphertext)
             VALUES (?1, ?2, ?3)",
            params![conversation_id, nonce.as_slice(), ciphertext],
        )?;
        tracing::debug!(conversation_id, "session key persisted");
        Ok(())
    }

    /// Load the key for a conversation, if stored.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Decryption`] if the master key does not
    /// open the row, and [`KeyStoreError::Corrupt`] for malformed rows.
    pub fn load_session_key(&self, conversation_id: &str) -> Result<Option<SessionKey>> {
        let row: Option<(Vec<u8>, Vec<u8>)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT nonce, ciphertext FROM session_keys WHERE conversation_id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let Some((nonce_bytes, ciphertext)) = row else {
            return Ok(None);
        };
        self.decrypt_row(conversation_id, &nonce_bytes, &ciphertext)
            .map(Some)
    }

    /// Delete the key for a conversation. Returns whether a row existed.
    pub fn delete_session_key(&self, conversation_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM session_keys WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(affected > 0)
    }

    /// Load every stored key.
    pub fn load_all(&self) -> Result<Vec<(String, SessionKey)>> {
        let rows: Vec<(String, Vec<u8>, Vec<u8>)> = {
            let conn = self.lock()?;
            let mut stmt =
                conn.prepare("SELECT conversation_id, nonce, ciphertext FROM session_keys")?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect::<std::result::Result<_, _>>()?
        };

        let mut keys = Vec::with_capacity(rows.len());
        for (conversation_id, nonce_bytes, ciphertext) in rows {
            let key = self.decrypt_row(&conversation_id, &nonce_bytes, &ciphertext)?;
            keys.push((conversation_id, key));
        }
        Ok(keys)
    }

    fn decrypt_row(
        &self,
        conversation_id: &str,
        nonce_bytes: &[u8],
        ciphertext: &[u8],
    ) -> Result<SessionKey> {
        let nonce: [u8; aead::NONCE_SIZE] = nonce_bytes.try_into().map_err(|_| {
            KeyStoreError::Corrupt(conversation_id.to_string(), "bad nonce length".to_string())
        })?;
        let plaintext = aead::decrypt(
            &self.master,
            &nonce,
            ciphertext,
            conversation_id.as_bytes(),
        )
        .map_err(|_| KeyStoreError::Decryption(conversation_id.to_string()))?;
        SessionKey::from_slice(&plaintext).map_err(|e| {
            KeyStoreError::Corrupt(conversation_id.to_string(), e.to_string())
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| KeyStoreError::Unavailable(e.to_string()))
    }
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Create the schema if absent.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS session_keys (
            conversation_id TEXT PRIMARY KEY,
            nonce           BLOB NOT NULL,
            ciphertext      BLOB NOT NULL,
            created_at      INTEGER NOT NULL DEFAULT (unixepoch())
        );",
    )?;
    Ok(())
}
