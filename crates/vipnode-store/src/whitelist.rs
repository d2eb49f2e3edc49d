//! Registration whitelist.
//!
//! A host may register if its node ID is listed, or if it presents an invite
//! token: hex(HMAC-SHA256(invite_secret, node_id)).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;

type HmacSha256 = Hmac<Sha256>;

/// Who may register as a host. The default whitelist admits everyone.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    ids: HashSet<String>,
    invite_secret: Option<String>,
}

impl Whitelist {
    pub fn new<I, S>(ids: I, invite_secret: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            invite_secret,
        }
    }

    /// Whether registration is gated at all.
    pub fn is_enforced(&self) -> bool {
        !self.ids.is_empty() || self.invite_secret.is_some()
    }

    /// Check a node ID and its (possibly empty) invite token.
    pub fn admits(&self, node_id: &str, token: &str) -> bool {
        if !self.is_enforced() || self.ids.contains(node_id) {
            return true;
        }
        match &self.invite_secret {
            Some(secret) if !token.is_empty() => {
                let expected = invite_token(secret, node_id);
                subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), token.as_bytes()).into()
            }
            _ => false,
        }
    }
}

/// Invite token that admits `node_id` under `secret`.
pub fn invite_token(secret: &str, node_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(node_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_whitelist_admits_everyone() {
        let whitelist = Whitelist::default();
        assert!(!whitelist.is_enforced());
        assert!(whitelist.admits("anyone", ""));
    }

    #[test]
    fn test_listed_ids() {
        let whitelist = Whitelist::new(["foo"], None);
        assert!(whitelist.admits("foo", ""));
        assert!(!whitelist.admits("bar", ""));
    }

    #[test]
    fn test_invite_tokens() {
        let whitelist = Whitelist::new(Vec::<String>::new(), Some("s3cret".to_string()));
        let token = invite_token("s3cret", "bar");
        assert!(whitelist.admits("bar", &token));
        assert!(!whitelist.admits("baz", &token));
        assert!(!whitelist.admits("bar", ""));
        assert!(!whitelist.admits("bar", &invite_token("other", "bar")));
    }
}
