//! Push-event extraction from provider payloads.

use serde_json::Value;

use crate::signature::Provider;

/// The parts of a push event a build needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub git_ref: String,
    pub commit: String,
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// `Some` only for push events carrying a ref and a commit.
pub fn extract_push(provider: Provider, event: &str, payload: &[u8]) -> Option<PushEvent> {
    let is_push = match provider {
        Provider::Github => event == "push",
        Provider::Gitlab => event == "Push Hook",
    };
    if !is_push {
        return None;
    }
    let payload: Value = serde_json::from_slice(payload).ok()?;
    let git_ref = str_field(&payload, "ref")?;
    let commit = match provider {
        Provider::Github => str_field(&payload, "after")?,
        Provider::Gitlab => str_field(&payload, "checkout_sha").or_else(|| str_field(&payload, "after"))?,
    };
    Some(PushEvent {
        git_ref: git_ref.to_string(),
        commit: commit.to_string(),
    })
}

/// `refs/heads/main` → `main`. Other refs are returned unchanged.
pub fn normalize_branch(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_push() {
        let body = br#"{"ref":"refs/heads/main","after":"abc123","before":"000"}"#;
        assert_eq!(
            extract_push(Provider::Github, "push", body),
            Some(PushEvent {
                git_ref: "refs/heads/main".into(),
                commit: "abc123".into()
            })
        );
        assert_eq!(extract_push(Provider::Github, "pull_request", body), None);
    }

    #[test]
    fn gitlab_prefers_checkout_sha() {
        let body = br#"{"ref":"refs/heads/dev","after":"aaa","checkout_sha":"bbb"}"#;
        assert_eq!(extract_push(Provider::Gitlab, "Push Hook", body).unwrap().commit, "bbb");
        let body = br#"{"ref":"refs/heads/dev","after":"aaa","checkout_sha":null}"#;
        assert_eq!(extract_push(Provider::Gitlab, "Push Hook", body).unwrap().commit, "aaa");
        assert_eq!(extract_push(Provider::Gitlab, "push", body), None);
    }

    #[test]
    fn malformed_payload_is_ignored() {
        assert_eq!(extract_push(Provider::Github, "push", b"not json"), None);
        assert_eq!(extract_push(Provider::Github, "push", br#"{"ref":"refs/heads/main"}"#), None);
    }

    #[test]
    fn branch_normalization() {
        assert_eq!(normalize_branch("refs/heads/feature/x"), "feature/x");
        assert_eq!(normalize_branch("refs/tags/v1"), "refs/tags/v1");
        assert_eq!(normalize_branch("main"), "main");
    }
}
