//! nimbus-crypto — envelope encryption for bucket payloads.
//!
//! A 32-byte master key seals one random data key per bucket; payloads are
//! sealed under the bucket's data key. Both layers use AES-256-GCM with a
//! fresh 12-byte nonce stored in front of the ciphertext.

pub mod envelope;

pub use envelope::{CryptoError, EnvelopeCipher, MasterKey, NONCE_LEN};
