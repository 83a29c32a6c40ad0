//! Webhook signature verification.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use nimbus_core::CoreError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Gitlab => "gitlab",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Provider::Github),
            "gitlab" => Ok(Provider::Gitlab),
            other => Err(CoreError::InvalidInput(format!("unsupported webhook provider `{other}`"))),
        }
    }
}

/// `sha256=<hex hmac>` as GitHub sends it in `X-Hub-Signature-256`.
pub fn github_signature(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Compare the presented signature against the expected one in constant time.
pub fn verify_signature(provider: Provider, secret: &str, payload: &[u8], presented: &str) -> bool {
    let expected = match provider {
        Provider::Github => match github_signature(secret, payload) {
            Some(sig) => sig,
            None => return false,
        },
        Provider::Gitlab => secret.to_string(),
    };
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"ref":"refs/heads/main","after":"abc123"}"#;

    #[test]
    fn github_accepts_matching_signature() {
        let sig = github_signature("s3cret", BODY).unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_signature(Provider::Github, "s3cret", BODY, &sig));
    }

    #[test]
    fn github_rejects_altered_payload() {
        let sig = github_signature("s3cret", BODY).unwrap();
        let mut altered = BODY.to_vec();
        altered[10] ^= 0x01;
        assert!(!verify_signature(Provider::Github, "s3cret", &altered, &sig));
        assert!(!verify_signature(Provider::Github, "other", BODY, &sig));
        assert!(!verify_signature(Provider::Github, "s3cret", BODY, ""));
    }

    #[test]
    fn gitlab_compares_the_token() {
        assert!(verify_signature(Provider::Gitlab, "tok", BODY, "tok"));
        assert!(!verify_signature(Provider::Gitlab, "tok", BODY, "tok2"));
    }

    #[test]
    fn parses_providers() {
        assert_eq!("GitHub".parse::<Provider>().unwrap(), Provider::Github);
        assert!("bitbucket".parse::<Provider>().is_err());
    }
}
