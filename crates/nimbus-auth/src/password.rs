//! Password strength and hashing.

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordVerifier, Version};
use rand::RngCore;

use nimbus_core::{CoreError, CoreResult};

/// Minimum accepted password entropy.
pub const MIN_ENTROPY_BITS: f64 = 50.0;

/// Estimated entropy: `len × log2(pool)`, where the pool is the sum of the
/// character classes the password draws from.
pub fn entropy_bits(password: &str) -> f64 {
    let (mut lower, mut upper, mut digit, mut other) = (false, false, false, false);
    for c in password.chars() {
        match c {
            'a'..='z' => lower = true,
            'A'..='Z' => upper = true,
            '0'..='9' => digit = true,
            _ => other = true,
        }
    }
    let pool = [(lower, 26), (upper, 26), (digit, 10), (other, 32)]
        .iter()
        .filter(|(present, _)| *present)
        .map(|(_, size)| size)
        .sum::<u32>();
    if pool == 0 {
        return 0.0;
    }
    password.chars().count() as f64 * f64::from(pool).log2()
}

pub fn check_strength(password: &str) -> CoreResult<()> {
    let bits = entropy_bits(password);
    if bits < MIN_ENTROPY_BITS {
        return Err(CoreError::InvalidInput(format!(
            "password too weak ({bits:.0} bits, need {MIN_ENTROPY_BITS:.0})"
        )));
    }
    Ok(())
}

/// Argon2id with configurable cost.
#[derive(Clone)]
pub struct PasswordHasher {
    argon: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new(memory_kib: u32, iterations: u32) -> CoreResult<Self> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| CoreError::Internal(format!("argon2 params: {e}")))?;
        Ok(Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// PHC-formatted hash of `password` under a fresh random salt.
    pub fn hash(&self, password: &str) -> CoreResult<String> {
        use argon2::PasswordHasher as _;

        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt).map_err(|e| CoreError::Internal(format!("salt: {e}")))?;
        let hash = self
            .argon
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CoreError::Internal(format!("hash: {e}")))?;
        Ok(hash.to_string())
    }

    /// `false` for a wrong password or an unparseable stored hash.
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        match PasswordHash::new(stored) {
            Ok(parsed) => self.argon.verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_counts_character_classes() {
        assert_eq!(entropy_bits(""), 0.0);
        // 8 lowercase letters: 8 * log2(26) ≈ 37.6
        assert!(entropy_bits("password") < MIN_ENTROPY_BITS);
        // 12 chars over 26+26+10+32 ≈ 78.7
        assert!(entropy_bits("Tr0ub4dor&3x") > MIN_ENTROPY_BITS);
    }

    #[test]
    fn weak_password_is_invalid_input() {
        let err = check_strength("hunter2").unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert!(check_strength("correct-Horse-battery-42").is_ok());
    }

    #[test]
    fn hash_and_verify() {
        let hasher = PasswordHasher::new(8, 1).unwrap();
        let hash = hasher.hash("s3cret-Passphrase").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("s3cret-Passphrase", &hash));
        assert!(!hasher.verify("s3cret-passphrase", &hash));
        assert!(!hasher.verify("anything", "not-a-phc-string"));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = PasswordHasher::new(8, 1).unwrap();
        assert_ne!(hasher.hash("same").unwrap(), hasher.hash("same").unwrap());
    }
}
