use sha2::{Digest, Sha256};

/// Mask a credential down to its last four characters.
///
/// Admin status surfaces never expose full keys or JWTs.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

/// First 12 hex characters of the SHA-256 of a bearer token.
///
/// This is the only identifier that logs and event records may carry for a
/// user token.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_all_but_last_four() {
        assert_eq!(mask_secret("sk-abcdef123456"), "****3456");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = token_fingerprint("token-a");
        let b = token_fingerprint("token-a");
        let c = token_fingerprint("token-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
