//! Durable fingerprint store: one file per camera in an installation directory.
//!
//! Record layout on disk:
//!
//! ```text
//! header: tag (1 byte) || id length (u32 LE) || camera id (UTF-8)
//! plain:  header(0x00) || JSON record
//! sealed: header(0x01) || nonce (12 bytes) || AES-256-GCM(JSON record, aad = camera id)
//! ```
//!
//! Filenames are `hex(camera_id).fp` for ids up to [`MAX_HEX_NAME_BYTES`]
//! bytes and `sha256-<hex digest>.fp` beyond that, so every name stays well
//! under filesystem limits. Writes go to a temp file that is renamed over the
//! target.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::fingerprint::CameraFingerprint;
use crate::store::FingerprintStore;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length.
const NONCE_LEN: usize = 12;

const TAG_PLAIN: u8 = 0x00;
const TAG_SEALED: u8 = 0x01;

const RECORD_EXT: &str = "fp";

/// Longest camera id, in bytes, stored under its hex-encoded name.
pub const MAX_HEX_NAME_BYTES: usize = 100;

const DIGEST_PREFIX: &str = "sha256-";

/// Tag byte and id length.
const HEADER_LEN: usize = 1 + 4;

/// Secret key that seals records at rest. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoreKey([u8; KEY_LEN]);

impl StoreKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a 64-character hex key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `text` is not hex or not 32 bytes.
    pub fn from_hex(text: &str) -> Result<Self> {
        let mut bytes = hex::decode(text.trim())
            .map_err(|e| Error::InvalidConfig(format!("store key is not hex: {e}")))?;
        if bytes.len() != KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(Error::InvalidConfig(format!(
                "store key must be {KEY_LEN} bytes, got {len}"
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    /// Hex encoding of the key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| Error::StorageFailure(e.to_string()))
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreKey(..)")
    }
}

/// Filesystem-backed [`FingerprintStore`].
///
/// A secure store starts locked and refuses every operation until
/// [`unlock`](FileStore::unlock) is called with the installation key.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    secure: bool,
    // Held for the duration of every operation.
    key: Mutex<Option<StoreKey>>,
}

impl FileStore {
    /// Open (creating if needed) the store directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFailure`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, secure: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::StorageFailure(format!("{}: {e}", root.display())))?;
        Ok(Self {
            root,
            secure,
            key: Mutex::new(None),
        })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether records are sealed at rest.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether operations are currently refused.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.secure && self.key.lock().is_none()
    }

    /// Make the store usable with `key`.
    pub fn unlock(&self, key: StoreKey) {
        *self.key.lock() = Some(key);
    }

    /// Drop the key; a secure store refuses operations until unlocked again.
    pub fn lock(&self) {
        *self.key.lock() = None;
    }

    fn record_path(&self, camera_id: &str) -> PathBuf {
        let stem = if camera_id.len() <= MAX_HEX_NAME_BYTES {
            hex::encode(camera_id.as_bytes())
        } else {
            format!("{DIGEST_PREFIX}{}", hex::encode(Sha256::digest(camera_id)))
        };
        self.root.join(format!("{stem}.{RECORD_EXT}"))
    }

    /// The key to seal with, `None` for a plain store, or an error if locked.
    fn active_key<'a>(&self, key: &'a Option<StoreKey>) -> Result<Option<&'a StoreKey>> {
        if !self.secure {
            return Ok(None);
        }
        key.as_ref()
            .map(Some)
            .ok_or_else(|| Error::StorageFailure("store is locked".into()))
    }

    fn header(tag: u8, camera_id: &str) -> Result<Vec<u8>> {
        let id_len = u32::try_from(camera_id.len())
            .map_err(|_| Error::StorageFailure("camera id is too long to store".into()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + camera_id.len());
        out.push(tag);
        out.extend_from_slice(&id_len.to_le_bytes());
        out.extend_from_slice(camera_id.as_bytes());
        Ok(out)
    }

    /// Split a record into its tag, stored camera id and payload.
    fn split_header(bytes: &[u8]) -> Option<(u8, &str, &[u8])> {
        let (head, rest) = bytes.split_at_checked(HEADER_LEN)?;
        let id_len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
        let id_len = usize::try_from(id_len).ok()?;
        let (id, payload) = rest.split_at_checked(id_len)?;
        Some((head[0], std::str::from_utf8(id).ok()?, payload))
    }

    fn encode(key: Option<&StoreKey>, fingerprint: &CameraFingerprint) -> Result<Vec<u8>> {
        let camera_id = fingerprint.camera_id();
        let json = serde_json::to_vec(fingerprint)
            .map_err(|e| Error::StorageFailure(format!("encode record: {e}")))?;

        let Some(key) = key else {
            let mut out = Self::header(TAG_PLAIN, camera_id)?;
            out.extend_from_slice(&json);
            return Ok(out);
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = key
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &json,
                    aad: camera_id.as_bytes(),
                },
            )
            .map_err(|_| Error::StorageFailure("record encryption failed".into()))?;

        let mut out = Self::header(TAG_SEALED, camera_id)?;
        out.reserve(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(key: Option<&StoreKey>, camera_id: &str, bytes: &[u8]) -> Result<CameraFingerprint> {
        let Some((tag, stored_id, body)) = Self::split_header(bytes) else {
            return Err(Error::StorageFailure(format!(
                "record for '{camera_id}' has a malformed header"
            )));
        };
        if stored_id != camera_id {
            return Err(Error::StorageFailure(format!(
                "record for '{camera_id}' holds camera '{stored_id}'"
            )));
        }

        let json = match (tag, key) {
            (TAG_PLAIN, None) => body.to_vec(),
            (TAG_SEALED, Some(key)) => {
                if body.len() < NONCE_LEN {
                    return Err(Error::StorageFailure(format!(
                        "sealed record for '{camera_id}' is truncated"
                    )));
                }
                let (nonce, ciphertext) = body.split_at(NONCE_LEN);
                key.cipher()?
                    .decrypt(
                        Nonce::from_slice(nonce),
                        Payload {
                            msg: ciphertext,
                            aad: camera_id.as_bytes(),
                        },
                    )
                    .map_err(|_| {
                        Error::StorageFailure(format!(
                            "record for '{camera_id}' failed authentication"
                        ))
                    })?
            }
            (TAG_PLAIN, Some(_)) => {
                return Err(Error::StorageFailure(format!(
                    "record for '{camera_id}' is not sealed"
                )));
            }
            (TAG_SEALED, None) => {
                return Err(Error::StorageFailure(format!(
                    "record for '{camera_id}' is sealed but the store is not secure"
                )));
            }
            (tag, _) => {
                return Err(Error::StorageFailure(format!(
                    "record for '{camera_id}' has unknown format tag {tag:#04x}"
                )));
            }
        };

        let fingerprint: CameraFingerprint = serde_json::from_slice(&json)
            .map_err(|e| Error::StorageFailure(format!("record for '{camera_id}': {e}")))?;
        if fingerprint.camera_id() != camera_id {
            return Err(Error::StorageFailure(format!(
                "record for '{camera_id}' holds camera '{}'",
                fingerprint.camera_id()
            )));
        }
        fingerprint
            .validate()
            .map_err(|e| Error::StorageFailure(format!("record for '{camera_id}': {e}")))?;
        Ok(fingerprint)
    }
}

impl FingerprintStore for FileStore {
    fn save(&self, fingerprint: &CameraFingerprint) -> Result<()> {
        let guard = self.key.lock();
        let bytes = Self::encode(self.active_key(&guard)?, fingerprint)?;

        let path = self.record_path(fingerprint.camera_id());
        let temp_path = path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageFailure(format!("{}: {e}", path.display()))
        })?;

        log::debug!(
            "stored fingerprint '{}' ({} bytes)",
            fingerprint.camera_id(),
            bytes.len()
        );
        Ok(())
    }

    fn load(&self, camera_id: &str) -> Result<Option<CameraFingerprint>> {
        let guard = self.key.lock();
        let key = self.active_key(&guard)?;
        let path = self.record_path(camera_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::StorageFailure(format!("{}: {e}", path.display()))),
        };
        Self::decode(key, camera_id, &bytes).map(Some)
    }

    fn delete(&self, camera_id: &str) -> Result<()> {
        let guard = self.key.lock();
        self.active_key(&guard)?;
        let path = self.record_path(camera_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StorageFailure(format!("{}: {e}", path.display()))),
        }
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let guard = self.key.lock();
        self.active_key(&guard)?;
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::StorageFailure(format!("{}: {e}", self.root.display())))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::StorageFailure(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = if stem.starts_with(DIGEST_PREFIX) {
                let bytes = fs::read(&path)
                    .map_err(|e| Error::StorageFailure(format!("{}: {e}", path.display())))?;
                Self::split_header(&bytes).map(|(_, id, _)| id.to_string())
            } else {
                hex::decode(stem)
                    .ok()
                    .and_then(|raw| String::from_utf8(raw).ok())
            };
            match id {
                Some(id) => ids.push(id),
                None => log::warn!("ignoring unrecognised record file {}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
