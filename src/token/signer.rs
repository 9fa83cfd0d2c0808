//! rustls signing backed by a private key object on the token.
//!
//! The key never leaves the token: every TLS signature is a `C_Sign` call
//! on a short-lived session. PKCS#11 login state is shared by all sessions
//! of the process, so these sessions inherit the login held by
//! [`TokenSession`](super::TokenSession) and the token serializes
//! concurrent operations itself.

use cryptoki::context::Pkcs11;
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::ObjectHandle;
use cryptoki::slot::Slot;
use rustls::sign::{Signer, SigningKey};
use rustls::{Error, SignatureAlgorithm, SignatureScheme};
use sha2::{Digest, Sha256, Sha384};
use std::fmt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

/// DER of the `namedCurve` OIDs found in `CKA_EC_PARAMS`.
const OID_P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const OID_P384: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];

const RSA_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    EcP256,
    EcP384,
    Unsupported(String),
}

impl KeyKind {
    /// Classify an EC key from its `CKA_EC_PARAMS`.
    pub(crate) fn from_ec_params(params: &[u8]) -> Self {
        match params {
            OID_P256 => KeyKind::EcP256,
            OID_P384 => KeyKind::EcP384,
            other => KeyKind::Unsupported(format!("EC curve {}", hex::encode(other))),
        }
    }

    /// Schemes this key can produce, most preferred first.
    pub fn schemes(&self) -> &'static [SignatureScheme] {
        match self {
            KeyKind::Rsa => RSA_SCHEMES,
            KeyKind::EcP256 => &[SignatureScheme::ECDSA_NISTP256_SHA256],
            KeyKind::EcP384 => &[SignatureScheme::ECDSA_NISTP384_SHA384],
            KeyKind::Unsupported(_) => &[],
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Rsa => f.write_str("RSA"),
            KeyKind::EcP256 => f.write_str("ECDSA P-256"),
            KeyKind::EcP384 => f.write_str("ECDSA P-384"),
            KeyKind::Unsupported(what) => write!(f, "unsupported ({what})"),
        }
    }
}

/// Location of a private key object on the token.
#[derive(Clone)]
struct KeyHandle {
    pkcs11: Pkcs11,
    slot: Slot,
    object: ObjectHandle,
}

impl KeyHandle {
    fn sign(&self, mechanism: &Mechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        run_blocking(|| {
            let session = self
                .pkcs11
                .open_ro_session(self.slot)
                .map_err(|e| Error::General(format!("token session: {e}")))?;
            session
                .sign(mechanism, self.object, data)
                .map_err(|e| Error::General(format!("token signing failed: {e}")))
        })
    }
}

/// Run a token call that may block for the device's latency.
///
/// On a multi-threaded runtime the worker hands its other tasks off first.
/// rustls signs synchronously inside the handshake future, so there is no
/// way to await here.
fn run_blocking<T>(call: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}

/// Opaque signing capability for one token-resident private key.
pub struct TokenSigningKey {
    handle: KeyHandle,
    kind: KeyKind,
}

impl TokenSigningKey {
    pub(crate) fn new(pkcs11: Pkcs11, slot: Slot, object: ObjectHandle, kind: KeyKind) -> Self {
        Self {
            handle: KeyHandle {
                pkcs11,
                slot,
                object,
            },
            kind,
        }
    }

    pub fn kind(&self) -> &KeyKind {
        &self.kind
    }
}

impl fmt::Debug for TokenSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigningKey")
            .field("slot", &self.handle.slot.id())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SigningKey for TokenSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = choose(self.kind.schemes(), offered)?;
        Some(Box::new(TokenSigner {
            handle: self.handle.clone(),
            scheme,
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        match self.kind {
            KeyKind::Rsa => SignatureAlgorithm::RSA,
            KeyKind::EcP256 | KeyKind::EcP384 => SignatureAlgorithm::ECDSA,
            KeyKind::Unsupported(_) => SignatureAlgorithm::Unknown(0),
        }
    }
}

/// First of our schemes the peer offered.
fn choose(supported: &[SignatureScheme], offered: &[SignatureScheme]) -> Option<SignatureScheme> {
    supported
        .iter()
        .copied()
        .find(|scheme| offered.contains(scheme))
}

fn pss(hash_alg: MechanismType, mgf: PkcsMgfType, salt_len: u64) -> PkcsPssParams {
    PkcsPssParams {
        hash_alg,
        mgf,
        s_len: salt_len.into(),
    }
}

struct TokenSigner {
    handle: KeyHandle,
    scheme: SignatureScheme,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl Signer for TokenSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        debug!("Signing handshake message on token with {:?}", self.scheme);

        if let Some(mechanism) = rsa_mechanism(self.scheme) {
            return self.handle.sign(&mechanism, message);
        }

        let digest = match self.scheme {
            SignatureScheme::ECDSA_NISTP256_SHA256 => Sha256::digest(message).to_vec(),
            SignatureScheme::ECDSA_NISTP384_SHA384 => Sha384::digest(message).to_vec(),
            other => {
                return Err(Error::General(format!(
                    "signature scheme {other:?} not supported"
                )))
            }
        };
        let raw = self.handle.sign(&Mechanism::Ecdsa, &digest)?;
        ecdsa_der(self.scheme, &raw)
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

/// PKCS#11 returns ECDSA signatures as raw `r || s`; TLS wants DER.
fn ecdsa_der(scheme: SignatureScheme, raw: &[u8]) -> Result<Vec<u8>, Error> {
    let der = match scheme {
        SignatureScheme::ECDSA_NISTP256_SHA256 => p256::ecdsa::Signature::from_slice(raw)
            .map(|signature| signature.to_der().as_bytes().to_vec()),
        SignatureScheme::ECDSA_NISTP384_SHA384 => p384::ecdsa::Signature::from_slice(raw)
            .map(|signature| signature.to_der().as_bytes().to_vec()),
        other => {
            return Err(Error::General(format!(
                "{other:?} is not an ECDSA scheme"
            )))
        }
    };
    der.map_err(|e| Error::General(format!("malformed {scheme:?} signature from token: {e}")))
}

/// Hash-and-sign RSA mechanisms; the token hashes the message itself.
fn rsa_mechanism(scheme: SignatureScheme) -> Option<Mechanism<'static>> {
    let mechanism = match scheme {
        SignatureScheme::RSA_PKCS1_SHA256 => Mechanism::Sha256RsaPkcs,
        SignatureScheme::RSA_PKCS1_SHA384 => Mechanism::Sha384RsaPkcs,
        SignatureScheme::RSA_PKCS1_SHA512 => Mechanism::Sha512RsaPkcs,
        SignatureScheme::RSA_PSS_SHA256 => Mechanism::Sha256RsaPkcsPss(pss(
            MechanismType::SHA256,
            PkcsMgfType::MGF1_SHA256,
            32,
        )),
        SignatureScheme::RSA_PSS_SHA384 => Mechanism::Sha384RsaPkcsPss(pss(
            MechanismType::SHA384,
            PkcsMgfType::MGF1_SHA384,
            48,
        )),
        SignatureScheme::RSA_PSS_SHA512 => Mechanism::Sha512RsaPkcsPss(pss(
            MechanismType::SHA512,
            PkcsMgfType::MGF1_SHA512,
            64,
        )),
        _ => return None,
    };
    Some(mechanism)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ec_params_classification() {
        assert_eq!(KeyKind::from_ec_params(OID_P256), KeyKind::EcP256);
        assert_eq!(KeyKind::from_ec_params(OID_P384), KeyKind::EcP384);
        assert!(matches!(
            KeyKind::from_ec_params(&[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23]),
            KeyKind::Unsupported(_)
        ));
    }

    #[test]
    fn test_rsa_prefers_pss() {
        let offered = [
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
        ];
        assert_eq!(
            choose(KeyKind::Rsa.schemes(), &offered),
            Some(SignatureScheme::RSA_PSS_SHA384)
        );
    }

    #[test]
    fn test_rsa_falls_back_to_pkcs1() {
        let offered = [SignatureScheme::RSA_PKCS1_SHA512, SignatureScheme::ED25519];
        assert_eq!(
            choose(KeyKind::Rsa.schemes(), &offered),
            Some(SignatureScheme::RSA_PKCS1_SHA512)
        );
    }

    #[test]
    fn test_ec_curve_must_match_offer() {
        let offered = [SignatureScheme::ECDSA_NISTP384_SHA384];
        assert_eq!(choose(KeyKind::EcP256.schemes(), &offered), None);
        assert_eq!(
            choose(KeyKind::EcP384.schemes(), &offered),
            Some(SignatureScheme::ECDSA_NISTP384_SHA384)
        );
    }

    #[test]
    fn test_only_rsa_schemes_map_to_rsa_mechanisms() {
        for scheme in KeyKind::Rsa.schemes() {
            assert!(rsa_mechanism(*scheme).is_some(), "{scheme:?}");
        }
        assert!(rsa_mechanism(SignatureScheme::ECDSA_NISTP256_SHA256).is_none());
    }

    #[test]
    fn test_raw_p256_signature_becomes_verifiable_der() {
        use p256::ecdsa::signature::{Signer as _, Verifier as _};

        let key = p256::ecdsa::SigningKey::from_slice(&[0x11; 32]).unwrap();
        let message = b"TLS 1.3, client CertificateVerify";
        let raw: p256::ecdsa::Signature = key.sign(message);
        assert_eq!(raw.to_bytes().len(), 64);

        let der = ecdsa_der(SignatureScheme::ECDSA_NISTP256_SHA256, &raw.to_bytes()).unwrap();
        assert_eq!(der[0], 0x30);

        let parsed = p256::ecdsa::Signature::from_der(&der).unwrap();
        key.verifying_key().verify(message, &parsed).unwrap();
    }

    #[test]
    fn test_raw_signature_length_is_checked() {
        assert!(ecdsa_der(SignatureScheme::ECDSA_NISTP256_SHA256, &[0x01; 63]).is_err());
        assert!(ecdsa_der(SignatureScheme::ECDSA_NISTP384_SHA384, &[0x01; 64]).is_err());
        assert!(ecdsa_der(SignatureScheme::RSA_PSS_SHA256, &[0x01; 64]).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_token_call_does_not_starve_other_tasks() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::{Duration, Instant};

        // Runs on the only worker, so the inner task can only make progress
        // if the blocking call hands the worker off
        let signer = tokio::spawn(async {
            let ran = Arc::new(AtomicBool::new(false));
            tokio::spawn({
                let ran = ran.clone();
                async move { ran.store(true, Ordering::SeqCst) }
            });

            run_blocking(|| {
                let deadline = Instant::now() + Duration::from_secs(5);
                while !ran.load(Ordering::SeqCst) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(10));
                }
                ran.load(Ordering::SeqCst)
            })
        });

        assert!(signer.await.unwrap());
    }

    #[tokio::test]
    async fn test_token_call_on_current_thread_runtime() {
        assert_eq!(run_blocking(|| 42), 42);
    }

    #[test]
    fn test_token_call_outside_runtime() {
        assert_eq!(run_blocking(|| "signed"), "signed");
    }

    #[test]
    fn test_unsupported_key_offers_nothing() {
        let kind = KeyKind::Unsupported("EC curve 2b8104".into());
        assert_eq!(choose(kind.schemes(), &[SignatureScheme::ED25519]), None);
    }
}
