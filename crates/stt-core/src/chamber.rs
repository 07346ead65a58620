//! Chamber: encrypted on-disk storage for key material and session state.
//!
//! Layout beneath the chamber root:
//!
//! ```text
//! <root>/keys/<id>.key          encrypted key blobs
//! <root>/sessions/<id>.session  encrypted session records
//! ```
//!
//! Every file is `nonce || ciphertext`, where the nonce is the crypto
//! facade's 24-byte AEAD metadata. The associated data binds each blob to
//! `{purpose, node_id_hex, file_id}`, so a file copied between chambers or
//! renamed on disk fails authentication.

use crate::error::ChamberError;
use crate::{NodeId, SessionId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stt_crypto::{AdContext, CryptoProvider, XCHACHA_NONCE_SIZE};

/// Persisted session metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier
    pub session_id: SessionId,
    /// Peer node identifier
    pub peer_node_id: NodeId,
    /// Negotiated capabilities
    pub capabilities: Vec<String>,
    /// Key version at persist time
    pub key_version: u64,
    /// Opaque resumption token
    pub resumption_token: Option<Vec<u8>>,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at_ms: u64,
}

/// Encrypted store rooted at a directory.
pub struct Chamber {
    root: PathBuf,
    keys_dir: PathBuf,
    sessions_dir: PathBuf,
    node_id: NodeId,
    crypto: Arc<dyn CryptoProvider>,
}

impl Chamber {
    /// Open (creating if needed) a chamber at `root`.
    ///
    /// # Errors
    ///
    /// Returns `ChamberError::Io` if the directory structure cannot be
    /// created.
    pub fn open(
        root: impl Into<PathBuf>,
        node_id: NodeId,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self, ChamberError> {
        let root = root.into();
        let keys_dir = root.join("keys");
        let sessions_dir = root.join("sessions");
        fs::create_dir_all(&keys_dir)?;
        fs::create_dir_all(&sessions_dir)?;
        tracing::info!(path = %root.display(), "chamber opened");
        Ok(Self {
            root,
            keys_dir,
            sessions_dir,
            node_id,
            crypto,
        })
    }

    /// Chamber root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a key blob.
    ///
    /// # Errors
    ///
    /// Returns crypto or I/O errors; `ChamberError::Corrupt` for invalid
    /// ids.
    pub fn put_key(&self, id: &str, bytes: &[u8]) -> Result<(), ChamberError> {
        validate_id(id)?;
        let sealed = self.seal(bytes, id)?;
        fs::write(self.key_path(id), sealed)?;
        Ok(())
    }

    /// Load a key blob. Returns `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `ChamberError::Crypto` if the file fails authentication.
    pub fn get_key(&self, id: &str) -> Result<Option<Vec<u8>>, ChamberError> {
        validate_id(id)?;
        let path = self.key_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let sealed = fs::read(path)?;
        self.unseal(&sealed, id).map(Some)
    }

    /// Delete a key blob. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns `ChamberError::Io` on filesystem failure.
    pub fn delete_key(&self, id: &str) -> Result<(), ChamberError> {
        validate_id(id)?;
        let path = self.key_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Store a session record.
    ///
    /// # Errors
    ///
    /// Returns crypto, serialization, or I/O errors.
    pub fn put_session(&self, id: &str, record: &SessionRecord) -> Result<(), ChamberError> {
        validate_id(id)?;
        let bytes = bincode::serialize(record)
            .map_err(|e| ChamberError::Corrupt(format!("session record encode: {e}")))?;
        let sealed = self.seal(&bytes, id)?;
        fs::write(self.session_path(id), sealed)?;
        Ok(())
    }

    /// Load a session record. Returns `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `ChamberError::Crypto` on authentication failure and
    /// `ChamberError::Corrupt` if the decrypted record does not parse.
    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, ChamberError> {
        validate_id(id)?;
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let sealed = fs::read(path)?;
        let bytes = self.unseal(&sealed, id)?;
        let record = bincode::deserialize(&bytes)
            .map_err(|e| ChamberError::Corrupt(format!("session record decode: {e}")))?;
        Ok(Some(record))
    }

    /// Delete a session record. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns `ChamberError::Io` on filesystem failure.
    pub fn delete_session(&self, id: &str) -> Result<(), ChamberError> {
        validate_id(id)?;
        let path = self.session_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Destroy all chamber contents and recreate the empty structure.
    ///
    /// # Errors
    ///
    /// Returns `ChamberError::Io` on filesystem failure.
    pub fn wipe(&self) -> Result<(), ChamberError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.keys_dir)?;
        fs::create_dir_all(&self.sessions_dir)?;
        tracing::info!(path = %self.root.display(), "chamber wiped");
        Ok(())
    }

    fn key_path(&self, id: &str) -> PathBuf {
        self.keys_dir.join(format!("{id}.key"))
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.session"))
    }

    fn ad_context(&self, file_id: &str) -> AdContext {
        AdContext::purpose("chamber_storage")
            .with_str("node_id_hex", hex::encode(self.node_id))
            .with_str("file_id", file_id.to_owned())
    }

    fn seal(&self, data: &[u8], file_id: &str) -> Result<Vec<u8>, ChamberError> {
        let (ciphertext, nonce) = self.crypto.encrypt(data, &self.ad_context(file_id))?;
        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8], file_id: &str) -> Result<Vec<u8>, ChamberError> {
        if sealed.len() < XCHACHA_NONCE_SIZE {
            return Err(ChamberError::Corrupt(format!(
                "file shorter than the {XCHACHA_NONCE_SIZE}-byte nonce"
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(XCHACHA_NONCE_SIZE);
        Ok(self
            .crypto
            .decrypt(ciphertext, nonce, &self.ad_context(file_id))?)
    }
}

fn validate_id(id: &str) -> Result<(), ChamberError> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.contains('\0')
    {
        return Err(ChamberError::Corrupt(format!("invalid entry id {id:?}")));
    }
    Ok(())
}
