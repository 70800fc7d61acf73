//! Cryptographic signature verification
//!
//! Verifies a bundle's detached signature against the trusted-issuer
//! registry. Trusted keys are matched by exact PEM equality and may carry
//! an expiry. A signature that verifies against an untrusted key is
//! accepted with a warning at COMMUNITY level; a signature that does not
//! verify always fails.

use base64::{engine::general_purpose::STANDARD as Base64, Engine as _};
use chrono::Utc;
use p256::ecdsa::signature::Verifier as _;
use rsa::pkcs8::DecodePublicKey;
use rsa::sha2::{Sha256, Sha512};
use rsa::signature::Verifier as _;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use plugon_core::config::TrustedKeySpec;
use plugon_core::types::{SignatureAlgorithm, SignatureSpec, TrustLevel};

/// Registry of trusted issuer keys
#[derive(Debug, Clone, Default)]
pub struct TrustedKeyRegistry {
    keys: Vec<TrustedKeySpec>,
}

impl TrustedKeyRegistry {
    /// Build a registry from configured keys
    pub fn new(keys: Vec<TrustedKeySpec>) -> Self {
        Self { keys }
    }

    /// Find a trusted key by exact PEM equality (modulo surrounding
    /// whitespace)
    pub fn find_by_pem(&self, pem: &str) -> Option<&TrustedKeySpec> {
        let needle = pem.trim();
        self.keys.iter().find(|key| key.public_key.trim() == needle)
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the registry holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Outcome of signature verification
#[derive(Debug, Clone, Serialize)]
pub struct SignatureOutcome {
    /// Whether the bundle passes signature policy
    pub is_valid: bool,

    /// Trust level derived from the verification
    pub trust_level: TrustLevel,

    /// Fatal findings
    pub errors: Vec<String>,

    /// Non-fatal findings
    pub warnings: Vec<String>,

    /// Whether a signature cryptographically verified
    pub verified: bool,

    /// Algorithm used, when a signature was present and recognized
    pub algorithm: Option<SignatureAlgorithm>,
}

impl SignatureOutcome {
    fn fail<S: Into<String>>(error: S) -> Self {
        Self {
            is_valid: false,
            trust_level: TrustLevel::Quarantined,
            errors: vec![error.into()],
            warnings: Vec::new(),
            verified: false,
            algorithm: None,
        }
    }
}

/// Signature policy and verification engine
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    registry: TrustedKeyRegistry,
    require_signatures: bool,
    allow_unsigned: bool,
}

impl SignatureVerifier {
    /// Create a verifier with the given policy
    pub fn new(registry: TrustedKeyRegistry, require_signatures: bool, allow_unsigned: bool) -> Self {
        Self {
            registry,
            require_signatures,
            allow_unsigned,
        }
    }

    /// Verify a bundle against its manifest signature block
    #[instrument(level = "debug", skip(self, bundle, spec), fields(len = bundle.len()))]
    pub fn verify(&self, bundle: &[u8], spec: Option<&SignatureSpec>) -> SignatureOutcome {
        let spec = match spec {
            Some(spec) => spec,
            None => {
                if self.require_signatures && !self.allow_unsigned {
                    return SignatureOutcome::fail(
                        "Bundle is unsigned and unsigned plugins are not allowed",
                    );
                }
                return SignatureOutcome {
                    is_valid: true,
                    trust_level: TrustLevel::Untrusted,
                    errors: Vec::new(),
                    warnings: vec!["bundle is unsigned".to_string()],
                    verified: false,
                    algorithm: None,
                };
            }
        };

        let algorithm: SignatureAlgorithm = match spec.algorithm.parse() {
            Ok(algorithm) => algorithm,
            Err(e) => return SignatureOutcome::fail(e),
        };

        let signature = match Base64.decode(spec.signature.trim()) {
            Ok(bytes) => bytes,
            Err(e) => return SignatureOutcome::fail(format!("Signature is not valid base64: {}", e)),
        };

        let trusted = self.registry.find_by_pem(&spec.public_key);
        if let Some(key) = trusted {
            if let Some(expires_at) = key.expires_at {
                if expires_at < Utc::now() {
                    return SignatureOutcome::fail(format!(
                        "Trusted key for issuer '{}' has expired",
                        key.issuer
                    ));
                }
            }
        }

        match verify_raw(algorithm, &spec.public_key, bundle, &signature) {
            Ok(()) => {
                let (trust_level, warnings) = match trusted {
                    Some(key) => {
                        debug!("✅ signature verified against trusted issuer '{}'", key.issuer);
                        (key.trust_level, Vec::new())
                    }
                    None => {
                        warn!("⚠️ signature verified but signing key is not trusted");
                        (
                            TrustLevel::Community,
                            vec!["signature verified but signing key is not trusted".to_string()],
                        )
                    }
                };
                SignatureOutcome {
                    is_valid: true,
                    trust_level,
                    errors: Vec::new(),
                    warnings,
                    verified: true,
                    algorithm: Some(algorithm),
                }
            }
            Err(e) => SignatureOutcome {
                is_valid: false,
                trust_level: TrustLevel::Quarantined,
                errors: vec![format!("Signature verification failed: {}", e)],
                warnings: Vec::new(),
                verified: false,
                algorithm: Some(algorithm),
            },
        }
    }
}

/// Dispatch raw verification to the backend for the algorithm
fn verify_raw(
    algorithm: SignatureAlgorithm,
    public_key_pem: &str,
    message: &[u8],
    signature: &[u8],
) -> std::result::Result<(), String> {
    match algorithm {
        SignatureAlgorithm::RS256 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|e| format!("invalid RSA public key: {}", e))?;
            let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
            let signature = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|e| format!("malformed RSA signature: {}", e))?;
            verifying_key
                .verify(message, &signature)
                .map_err(|e| e.to_string())
        }
        SignatureAlgorithm::RS512 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|e| format!("invalid RSA public key: {}", e))?;
            let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha512>::new(key);
            let signature = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|e| format!("malformed RSA signature: {}", e))?;
            verifying_key
                .verify(message, &signature)
                .map_err(|e| e.to_string())
        }
        SignatureAlgorithm::ES256 => {
            let verifying_key = p256::ecdsa::VerifyingKey::from_public_key_pem(public_key_pem)
                .map_err(|e| format!("invalid EC public key: {}", e))?;
            let signature = p256::ecdsa::Signature::from_der(signature)
                .or_else(|_| p256::ecdsa::Signature::from_slice(signature))
                .map_err(|e| format!("malformed ECDSA signature: {}", e))?;
            verifying_key
                .verify(message, &signature)
                .map_err(|e| e.to_string())
        }
        // Accepted by policy but fail-closed: no P-521 verifier backend
        SignatureAlgorithm::ES512 => Err("no verifier backend for ES512".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer as _;
    use p256::pkcs8::EncodePublicKey;
    use test_log::test;

    fn es256_keypair() -> (p256::ecdsa::SigningKey, String) {
        let signing_key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let pem = signing_key
            .verifying_key()
            .to_public_key_pem(Default::default())
            .unwrap();
        (signing_key, pem)
    }

    fn sign_es256(signing_key: &p256::ecdsa::SigningKey, message: &[u8]) -> String {
        let signature: p256::ecdsa::Signature = signing_key.sign(message);
        Base64.encode(signature.to_der().as_bytes())
    }

    fn spec(pem: &str, signature: &str) -> SignatureSpec {
        SignatureSpec {
            algorithm: "ES256".to_string(),
            public_key: pem.to_string(),
            signature: signature.to_string(),
        }
    }

    #[test]
    fn test_unsigned_allowed_by_default() {
        let verifier = SignatureVerifier::new(TrustedKeyRegistry::default(), false, true);
        let outcome = verifier.verify(b"bundle", None);
        assert!(outcome.is_valid);
        assert!(!outcome.verified);
        assert_eq!(outcome.trust_level, TrustLevel::Untrusted);
        assert!(outcome.warnings.iter().any(|w| w.contains("unsigned")));
    }

    #[test]
    fn test_unsigned_rejected_when_required() {
        let verifier = SignatureVerifier::new(TrustedKeyRegistry::default(), true, false);
        let outcome = verifier.verify(b"bundle", None);
        assert!(!outcome.is_valid);
        assert!(outcome.errors[0].contains("unsigned"));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let verifier = SignatureVerifier::new(TrustedKeyRegistry::default(), false, true);
        let outcome = verifier.verify(
            b"bundle",
            Some(&SignatureSpec {
                algorithm: "HS256".to_string(),
                public_key: "irrelevant".to_string(),
                signature: Base64.encode(b"sig"),
            }),
        );
        assert!(!outcome.is_valid);
        assert!(outcome.errors[0].contains("HS256"));
    }

    #[test]
    fn test_valid_signature_untrusted_key_is_community_with_warning() {
        let (signing_key, pem) = es256_keypair();
        let bundle = b"bundle bytes";
        let verifier = SignatureVerifier::new(TrustedKeyRegistry::default(), false, true);

        let outcome = verifier.verify(bundle, Some(&spec(&pem, &sign_es256(&signing_key, bundle))));
        assert!(outcome.is_valid);
        assert!(outcome.verified);
        assert_eq!(outcome.trust_level, TrustLevel::Community);
        assert!(!outcome.warnings.is_empty());
        assert_eq!(outcome.algorithm, Some(SignatureAlgorithm::ES256));
    }

    #[test]
    fn test_valid_signature_trusted_key_confers_its_level() {
        let (signing_key, pem) = es256_keypair();
        let bundle = b"bundle bytes";
        let registry = TrustedKeyRegistry::new(vec![TrustedKeySpec {
            issuer: "release-ci".to_string(),
            public_key: pem.clone(),
            trust_level: TrustLevel::Verified,
            expires_at: None,
        }]);
        let verifier = SignatureVerifier::new(registry, true, false);

        let outcome = verifier.verify(bundle, Some(&spec(&pem, &sign_es256(&signing_key, bundle))));
        assert!(outcome.is_valid);
        assert!(outcome.verified);
        assert_eq!(outcome.trust_level, TrustLevel::Verified);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_expired_trusted_key_rejected() {
        let (signing_key, pem) = es256_keypair();
        let bundle = b"bundle bytes";
        let registry = TrustedKeyRegistry::new(vec![TrustedKeySpec {
            issuer: "old-ci".to_string(),
            public_key: pem.clone(),
            trust_level: TrustLevel::Verified,
            expires_at: Some(Utc::now() - chrono::Duration::days(1)),
        }]);
        let verifier = SignatureVerifier::new(registry, false, true);

        let outcome = verifier.verify(bundle, Some(&spec(&pem, &sign_es256(&signing_key, bundle))));
        assert!(!outcome.is_valid);
        assert!(outcome.errors[0].contains("expired"));
    }

    #[test]
    fn test_tampered_bundle_rejected() {
        let (signing_key, pem) = es256_keypair();
        let verifier = SignatureVerifier::new(TrustedKeyRegistry::default(), false, true);

        let signature = sign_es256(&signing_key, b"original");
        let outcome = verifier.verify(b"tampered", Some(&spec(&pem, &signature)));
        assert!(!outcome.is_valid);
        assert!(!outcome.verified);
    }

    #[test]
    fn test_bad_base64_rejected() {
        let (_, pem) = es256_keypair();
        let verifier = SignatureVerifier::new(TrustedKeyRegistry::default(), false, true);
        let outcome = verifier.verify(b"bundle", Some(&spec(&pem, "not base64!!!")));
        assert!(!outcome.is_valid);
        assert!(outcome.errors[0].contains("base64"));
    }

    #[test]
    fn test_es512_fails_closed() {
        let verifier = SignatureVerifier::new(TrustedKeyRegistry::default(), false, true);
        let outcome = verifier.verify(
            b"bundle",
            Some(&SignatureSpec {
                algorithm: "ES512".to_string(),
                public_key: "-----BEGIN PUBLIC KEY-----\nAA==\n-----END PUBLIC KEY-----".to_string(),
                signature: Base64.encode(b"sig"),
            }),
        );
        assert!(!outcome.is_valid);
        assert!(outcome.errors[0].contains("ES512"));
    }

    #[test]
    fn test_pem_lookup_ignores_surrounding_whitespace() {
        let (_, pem) = es256_keypair();
        let registry = TrustedKeyRegistry::new(vec![TrustedKeySpec {
            issuer: "ci".to_string(),
            public_key: pem.clone(),
            trust_level: TrustLevel::Internal,
            expires_at: None,
        }]);
        assert!(registry.find_by_pem(&format!("\n{}\n", pem)).is_some());
        assert!(registry.find_by_pem("other").is_none());
    }
}
