//! Webhook signature computation and verification using HMAC.
//!
//! Providers sign the raw request body with a per-endpoint shared secret and
//! send the digest in a header. Deliveries in the wild use a small set of
//! encodings for the same digest, all of which are accepted:
//!
//! - lower-case hex: `3f1a...`
//! - upper-case hex: `3F1A...`
//! - algorithm-prefixed hex: `sha256=3f1a...`
//!
//! Comparison is constant time via [`Mac::verify_slice`].

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// HMAC digest algorithm used by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    /// The algorithm's name as used in `{algorithm}={hex}` signatures.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256 => "sha256",
            SignatureAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            SignatureAlgorithm::Sha256 => 32,
            SignatureAlgorithm::Sha512 => 64,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "hmac-sha256" => Ok(SignatureAlgorithm::Sha256),
            "sha512" | "hmac-sha512" => Ok(SignatureAlgorithm::Sha512),
            other => Err(format!("unsupported signature algorithm: {other}")),
        }
    }
}

/// Parses a presented signature into raw digest bytes.
///
/// Accepts plain hex in either case, or hex prefixed with `{algorithm}=`.
/// A prefix naming a different algorithm is rejected. Returns `None` for
/// malformed input; never panics.
///
/// # Examples
///
/// ```
/// use payhook::webhooks::{SignatureAlgorithm, parse_signature};
///
/// let alg = SignatureAlgorithm::Sha256;
/// assert_eq!(parse_signature("abcd", alg), Some(vec![0xab, 0xcd]));
/// assert_eq!(parse_signature("ABCD", alg), Some(vec![0xab, 0xcd]));
/// assert_eq!(parse_signature("sha256=abcd", alg), Some(vec![0xab, 0xcd]));
/// assert!(parse_signature("sha512=abcd", alg).is_none());
/// assert!(parse_signature("sha256=xyz", alg).is_none());
/// ```
pub fn parse_signature(presented: &str, algorithm: SignatureAlgorithm) -> Option<Vec<u8>> {
    let presented = presented.trim();
    let hex_sig = match presented.split_once('=') {
        Some((prefix, rest)) if prefix.eq_ignore_ascii_case(algorithm.as_str()) => rest,
        Some(_) => return None,
        None => presented,
    };

    hex::decode(hex_sig).ok()
}

/// Computes the HMAC of `payload` under `key`.
pub fn compute_signature(algorithm: SignatureAlgorithm, payload: &[u8], key: &[u8]) -> Vec<u8> {
    match algorithm {
        SignatureAlgorithm::Sha256 => {
            let mut mac =
                <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        SignatureAlgorithm::Sha512 => {
            let mut mac =
                <HmacSha512 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Formats a digest as `{algorithm}={hex}`.
pub fn format_signature(algorithm: SignatureAlgorithm, signature: &[u8]) -> String {
    format!("{}={}", algorithm, hex::encode(signature))
}

/// Verifies a presented signature against `payload` and `key`.
///
/// Returns `true` only if the signature parses in one of the accepted
/// encodings and matches the HMAC of the payload.
///
/// # Examples
///
/// ```
/// use payhook::webhooks::{SignatureAlgorithm, compute_signature, format_signature, verify_signature};
///
/// let alg = SignatureAlgorithm::Sha256;
/// let sig = compute_signature(alg, b"{\"id\":1}", b"key");
///
/// assert!(verify_signature(alg, b"{\"id\":1}", &format_signature(alg, &sig), b"key"));
/// assert!(verify_signature(alg, b"{\"id\":1}", &hex::encode_upper(&sig), b"key"));
/// assert!(!verify_signature(alg, b"{\"id\":2}", &hex::encode(&sig), b"key"));
/// ```
pub fn verify_signature(
    algorithm: SignatureAlgorithm,
    payload: &[u8],
    presented: &str,
    key: &[u8],
) -> bool {
    let Some(expected) = parse_signature(presented, algorithm) else {
        return false;
    };

    match algorithm {
        SignatureAlgorithm::Sha256 => match <HmacSha256 as Mac>::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(payload);
                mac.verify_slice(&expected).is_ok()
            }
            Err(_) => false,
        },
        SignatureAlgorithm::Sha512 => match <HmacSha512 as Mac>::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(payload);
                mac.verify_slice(&expected).is_ok()
            }
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALG: SignatureAlgorithm = SignatureAlgorithm::Sha256;

    #[test]
    fn parse_plain_lower_hex() {
        assert_eq!(parse_signature("1234abcd", ALG), Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn parse_plain_upper_hex() {
        assert_eq!(parse_signature("1234ABCD", ALG), Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn parse_prefixed_hex() {
        assert_eq!(parse_signature("sha256=1234abcd", ALG), Some(vec![0x12, 0x34, 0xab, 0xcd]));
        assert_eq!(parse_signature("SHA256=1234abcd", ALG), Some(vec![0x12, 0x34, 0xab, 0xcd]));
    }

    #[test]
    fn parse_rejects_mismatched_prefix() {
        assert_eq!(parse_signature("sha1=1234abcd", ALG), None);
        assert_eq!(parse_signature("sha512=1234abcd", ALG), None);
    }

    #[test]
    fn parse_rejects_bad_hex() {
        assert_eq!(parse_signature("xyz", ALG), None);
        assert_eq!(parse_signature("abc", ALG), None);
    }

    #[test]
    fn algorithm_from_str() {
        assert_eq!("SHA256".parse(), Ok(SignatureAlgorithm::Sha256));
        assert_eq!("hmac-sha512".parse(), Ok(SignatureAlgorithm::Sha512));
        assert!("md5".parse::<SignatureAlgorithm>().is_err());
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(compute_signature(SignatureAlgorithm::Sha256, b"x", b"k").len(), 32);
        assert_eq!(compute_signature(SignatureAlgorithm::Sha512, b"x", b"k").len(), 64);
    }

    #[test]
    fn verify_accepts_all_encodings() {
        let sig = compute_signature(ALG, b"payload", b"secret");
        assert!(verify_signature(ALG, b"payload", &hex::encode(&sig), b"secret"));
        assert!(verify_signature(ALG, b"payload", &hex::encode_upper(&sig), b"secret"));
        assert!(verify_signature(ALG, b"payload", &format_signature(ALG, &sig), b"secret"));
    }

    #[test]
    fn verify_sha512() {
        let alg = SignatureAlgorithm::Sha512;
        let sig = compute_signature(alg, b"payload", b"secret");
        assert!(verify_signature(alg, b"payload", &format_signature(alg, &sig), b"secret"));
        // A SHA-256 digest never verifies under SHA-512.
        let short = compute_signature(ALG, b"payload", b"secret");
        assert!(!verify_signature(alg, b"payload", &hex::encode(short), b"secret"));
    }

    #[test]
    fn verify_rejects_malformed_without_panicking() {
        for presented in ["", "sha256=", "sha256=zz", "not-a-signature", "=abcd"] {
            assert!(!verify_signature(ALG, b"p", presented, b"secret"));
        }
    }

    #[test]
    fn verify_rejects_truncated_signature() {
        let sig = compute_signature(ALG, b"payload", b"secret");
        assert!(!verify_signature(ALG, b"payload", &hex::encode(&sig[..16]), b"secret"));
    }

    proptest! {
        #[test]
        fn prop_sign_verify_roundtrip(payload: Vec<u8>, secret: Vec<u8>) {
            let sig = compute_signature(ALG, &payload, &secret);
            prop_assert!(verify_signature(ALG, &payload, &hex::encode(&sig), &secret));
        }

        #[test]
        fn prop_wrong_secret_fails(payload: Vec<u8>, secret1: Vec<u8>, secret2: Vec<u8>) {
            prop_assume!(secret1 != secret2);
            let sig = compute_signature(ALG, &payload, &secret1);
            prop_assert!(!verify_signature(ALG, &payload, &hex::encode(&sig), &secret2));
        }

        /// Flipping any single byte of the body invalidates the signature.
        #[test]
        fn prop_single_byte_mutation_fails(
            payload in prop::collection::vec(any::<u8>(), 1..256),
            index: prop::sample::Index,
            flip in 1u8..=255,
        ) {
            let secret = b"endpoint-secret";
            let sig = compute_signature(ALG, &payload, secret);

            let mut mutated = payload.clone();
            let i = index.index(mutated.len());
            mutated[i] ^= flip;

            prop_assert!(!verify_signature(ALG, &mutated, &hex::encode(&sig), secret));
        }

        #[test]
        fn prop_malformed_signature_no_panic(presented: String, payload: Vec<u8>, secret: Vec<u8>) {
            let _ = parse_signature(&presented, ALG);
            let _ = verify_signature(ALG, &payload, &presented, &secret);
        }
    }
}
