//! Process-wide identity store and egress policy
//!
//! Both values are built once at startup and shared read-only by every
//! session.

use rand::seq::SliceRandom;
use sha2::{Digest, Sha224};
use uuid::{Uuid, Variant};

use super::matcher::{ct_contains, ct_eq_ignore_ascii_case};
use crate::error::TunnelError;

/// Length of a Trojan password digest in hex form
pub const TROJAN_DIGEST_LEN: usize = 56;

/// Accepted client identities
#[derive(Clone)]
pub struct CredentialSet {
    /// Raw 16-byte VLESS user ids
    uuids: Vec<[u8; 16]>,
    /// Lowercase hex SHA-224 of the Trojan password
    trojan_digest: [u8; TROJAN_DIGEST_LEN],
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("uuids", &self.uuids.len())
            .finish_non_exhaustive()
    }
}

impl CredentialSet {
    /// Build from canonical UUID strings and a Trojan password
    pub fn new<S: AsRef<str>>(uuids: &[S], trojan_password: &str) -> Result<Self, TunnelError> {
        let parsed = uuids
            .iter()
            .map(|s| {
                let s = s.as_ref();
                if !is_valid_uuid(s) {
                    return Err(TunnelError::Config(format!(
                        "invalid UUID: {}",
                        mask_uuid(s)
                    )));
                }
                Uuid::parse_str(s)
                    .map(|u| *u.as_bytes())
                    .map_err(|e| TunnelError::Config(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if parsed.is_empty() {
            return Err(TunnelError::Config("no valid UUID configured".into()));
        }
        if trojan_password.is_empty() {
            return Err(TunnelError::Config("Trojan password is empty".into()));
        }

        Ok(Self {
            uuids: parsed,
            trojan_digest: password_to_hex(trojan_password),
        })
    }

    /// Constant-time check of a raw 16-byte VLESS user id
    pub fn verify_uuid(&self, candidate: &[u8]) -> bool {
        ct_contains(candidate, &self.uuids)
    }

    /// Constant-time, case-insensitive check of a 56-byte hex digest
    pub fn verify_trojan(&self, candidate: &[u8]) -> bool {
        ct_eq_ignore_ascii_case(candidate, &self.trojan_digest)
    }

    pub fn uuid_count(&self) -> usize {
        self.uuids.len()
    }
}

/// Fallback egress host used for the single connection retry
#[derive(Debug, Clone, Default)]
pub struct EgressPolicy {
    fallback: Option<String>,
}

impl EgressPolicy {
    /// No fallback; failed connections are not retried
    pub fn none() -> Self {
        Self { fallback: None }
    }

    /// Fixed fallback host
    pub fn fixed(host: impl Into<String>) -> Self {
        Self {
            fallback: Some(host.into()),
        }
    }

    /// A sticky host wins; otherwise one candidate is picked at random.
    /// The choice holds until restart.
    pub fn select(sticky: Option<&str>, candidates: &[String]) -> Self {
        if let Some(host) = sticky.map(str::trim).filter(|h| !h.is_empty()) {
            return Self::fixed(host);
        }
        let fallback = candidates
            .choose(&mut rand::thread_rng())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        Self { fallback }
    }

    pub fn fallback_host(&self) -> Option<&str> {
        self.fallback.as_deref()
    }
}

/// Canonical hyphenated RFC 4122 version-4 UUID
pub fn is_valid_uuid(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    match Uuid::parse_str(s) {
        Ok(u) => u.get_version_num() == 4 && u.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}

/// Mask a UUID for logging
pub fn mask_uuid(uuid: &str) -> String {
    if uuid.len() < 8 || !uuid.is_ascii() {
        return "****".to_string();
    }
    format!(
        "{}****-****-****-****-********{}",
        &uuid[..4],
        &uuid[uuid.len() - 4..]
    )
}

/// SHA-224 of `password`, lowercase hex
pub fn password_to_hex(password: &str) -> [u8; TROJAN_DIGEST_LEN] {
    let hash = Sha224::digest(password.as_bytes());
    let hex_string = hex::encode(hash);
    let mut hex_bytes = [0u8; TROJAN_DIGEST_LEN];
    hex_bytes.copy_from_slice(hex_string.as_bytes());
    hex_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";
    const UUID_B: &str = "2bd334f9-fbc9-44ea-8ecb-bbb56771999d";

    #[test]
    fn test_is_valid_uuid() {
        assert!(is_valid_uuid(UUID_A));
        assert!(is_valid_uuid(&UUID_A.to_uppercase()));
        // version nibble is 7, not 4
        assert!(!is_valid_uuid("2bd334f9-fbc9-74ea-8ecb-bbb56771999d"));
        // simple form is not accepted
        assert!(!is_valid_uuid("d342d11ed4244583b36e524ab1f0afa4"));
        assert!(!is_valid_uuid("not-a-uuid"));
        assert!(!is_valid_uuid(""));
    }

    #[test]
    fn test_mask_uuid() {
        assert_eq!(mask_uuid(UUID_A), "d342****-****-****-****-********afa4");
        assert_eq!(mask_uuid("short"), "****");
    }

    #[test]
    fn test_credential_set_verify_uuid() {
        let creds = CredentialSet::new(&[UUID_A, UUID_B], "secret").unwrap();
        assert_eq!(creds.uuid_count(), 2);
        let a = Uuid::parse_str(UUID_A).unwrap();
        let b = Uuid::parse_str(UUID_B).unwrap();
        assert!(creds.verify_uuid(a.as_bytes()));
        assert!(creds.verify_uuid(b.as_bytes()));
        assert!(!creds.verify_uuid(&[0u8; 16]));
        assert!(!creds.verify_uuid(&a.as_bytes()[..15]));
    }

    #[test]
    fn test_credential_set_uppercase_uuid_normalized() {
        let creds = CredentialSet::new(&[UUID_A.to_uppercase()], "secret").unwrap();
        let a = Uuid::parse_str(UUID_A).unwrap();
        assert!(creds.verify_uuid(a.as_bytes()));
    }

    #[test]
    fn test_credential_set_rejects_invalid() {
        assert!(matches!(
            CredentialSet::new(&["bogus"], "secret"),
            Err(TunnelError::Config(_))
        ));
        let empty: [&str; 0] = [];
        assert!(CredentialSet::new(&empty, "secret").is_err());
        assert!(CredentialSet::new(&[UUID_A], "").is_err());
    }

    #[test]
    fn test_credential_set_verify_trojan_case_insensitive() {
        let creds = CredentialSet::new(&[UUID_A], "secret").unwrap();
        let digest = password_to_hex("secret");
        assert!(creds.verify_trojan(&digest));
        let upper: Vec<u8> = digest.iter().map(|b| b.to_ascii_uppercase()).collect();
        assert!(creds.verify_trojan(&upper));
        assert!(!creds.verify_trojan(&password_to_hex("other")));
        assert!(!creds.verify_trojan(&digest[..55]));
    }

    #[test]
    fn test_credential_set_debug_hides_secrets() {
        let creds = CredentialSet::new(&[UUID_A], "secret").unwrap();
        let dbg = format!("{:?}", creds);
        assert!(!dbg.contains("d342"));
        assert!(!dbg.contains(std::str::from_utf8(&password_to_hex("secret")).unwrap()));
    }

    #[test]
    fn test_egress_policy_sticky_wins() {
        let candidates = vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()];
        let policy = EgressPolicy::select(Some(" 9.9.9.9 "), &candidates);
        assert_eq!(policy.fallback_host(), Some("9.9.9.9"));
    }

    #[test]
    fn test_egress_policy_random_from_list() {
        let candidates = vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()];
        let policy = EgressPolicy::select(None, &candidates);
        let host = policy.fallback_host().unwrap();
        assert!(candidates.iter().any(|c| c == host));
    }

    #[test]
    fn test_egress_policy_empty() {
        assert_eq!(EgressPolicy::select(None, &[]).fallback_host(), None);
        assert_eq!(EgressPolicy::select(Some("  "), &[]).fallback_host(), None);
        assert_eq!(EgressPolicy::none().fallback_host(), None);
    }
}
