use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info};

use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, Recorder, RequestContext};
use nimbus_state::{DataKeyRepository, SealedDataKey};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("master key must be {KEY_LEN} bytes of hex: {0}")]
    InvalidMasterKey(String),
    #[error("sealing failed")]
    Seal,
    #[error("authentication failed while opening ciphertext")]
    Open,
    #[error("ciphertext too short ({0} bytes)")]
    Truncated(usize),
    #[error("data key has wrong length ({0} bytes)")]
    BadDataKey(usize),
}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

/// The key that seals every bucket's data key.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidMasterKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| CryptoError::InvalidMasterKey(format!("got {} bytes", b.len())))?;
        Ok(Self(bytes))
    }

    pub fn generate() -> Self {
        Self(random_key())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// `nonce || ciphertext` under `key`.
fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Open)
}

/// Per-bucket envelope encryption.
///
/// A bucket gets its data key on first encrypt. Rotation replaces the
/// stored key, so payloads sealed under the previous key no longer open.
pub struct EnvelopeCipher {
    master: MasterKey,
    keys: Arc<dyn DataKeyRepository>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl EnvelopeCipher {
    pub fn new(master: MasterKey, keys: Arc<dyn DataKeyRepository>, recorder: Recorder, clock: Arc<dyn Clock>) -> Self {
        Self {
            master,
            keys,
            recorder,
            clock,
        }
    }

    async fn store_new_key(&self, bucket: &str) -> CoreResult<[u8; KEY_LEN]> {
        let data_key = random_key();
        let sealed = SealedDataKey {
            bucket: bucket.to_string(),
            sealed: seal(&self.master.0, &data_key)?,
            created_at: self.clock.now(),
        };
        self.keys.put_data_key(&sealed).await?;
        Ok(data_key)
    }

    async fn data_key(&self, bucket: &str) -> CoreResult<Option<[u8; KEY_LEN]>> {
        let Some(stored) = self.keys.get_data_key(bucket).await? else {
            return Ok(None);
        };
        let raw = open(&self.master.0, &stored.sealed)?;
        let len = raw.len();
        let key: [u8; KEY_LEN] = raw.try_into().map_err(|_| CryptoError::BadDataKey(len))?;
        Ok(Some(key))
    }

    pub async fn encrypt(&self, bucket: &str, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let key = match self.data_key(bucket).await? {
            Some(key) => key,
            None => {
                debug!(%bucket, "creating bucket data key");
                self.store_new_key(bucket).await?
            }
        };
        Ok(seal(&key, plaintext)?)
    }

    pub async fn decrypt(&self, bucket: &str, sealed: &[u8]) -> CoreResult<Vec<u8>> {
        let key = self
            .data_key(bucket)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("data key for bucket {bucket}")))?;
        Ok(open(&key, sealed)?)
    }

    pub async fn rotate(&self, ctx: &RequestContext, bucket: &str) -> CoreResult<()> {
        self.store_new_key(bucket).await?;
        info!(%bucket, "bucket data key rotated");
        self.recorder
            .audit(
                ctx,
                AuditAction::DataKeyRotate {
                    bucket: bucket.to_string(),
                },
            )
            .await;
        Ok(())
    }
}
