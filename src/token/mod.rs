//! Hardware credential provider.
//!
//! A [`TokenSession`] logs in to one PKCS#11 token, enumerates every X.509
//! certificate that has a private key with the same `CKA_ID` (a *paired*
//! certificate) and hands out [`Credential`]s. The private keys stay on the
//! token; a credential only carries a handle used to request signatures.

use crate::args::TokenArgs;
use crate::error::{ConfigError, CredentialError};
use crate::pin::resolve_pin;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::object::{
    Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

mod signer;

pub use signer::{KeyKind, TokenSigningKey};

/// Upper bound on intermediates followed when assembling a chain.
const MAX_CHAIN_DEPTH: usize = 8;

/// What is needed to reach the token.
#[derive(Debug)]
pub struct TokenConfig {
    pub module_path: PathBuf,
    pub serial: String,
    pub pin: SecretString,
}

impl TokenConfig {
    pub fn setup(args: &TokenArgs) -> Result<TokenConfig, ConfigError> {
        let pin = resolve_pin(args.pin.as_deref(), args.pin_file.as_deref())?;

        Ok(TokenConfig {
            module_path: args.pkcs11_path.clone(),
            serial: args.token_serial.clone(),
            pin,
        })
    }
}

/// A certificate/private-key pair resident on the token.
#[derive(Debug, Clone)]
pub struct Credential {
    index: usize,
    label: String,
    id: Vec<u8>,
    subject: String,
    chain: Vec<CertificateDer<'static>>,
    key: Arc<TokenSigningKey>,
}

impl Credential {
    /// Position in the enumeration; only stable within one session.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// `CKA_ID` shared by the certificate and its key, hex encoded.
    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    /// Subject distinguished name of the leaf certificate.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Leaf first, then any intermediates found on the token.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn key_kind(&self) -> &KeyKind {
        self.key.kind()
    }

    /// The chain and signing capability in the form rustls presents.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::new(CertifiedKey::new(self.chain.clone(), self.key.clone()))
    }
}

/// An open, logged-in session on one token.
///
/// Owns the login for the process lifetime. [`TokenSession::close`] logs out,
/// after which signatures from any outstanding [`Credential`] fail.
pub struct TokenSession {
    credentials: Vec<Credential>,
    session: Session,
    slot: Slot,
}

impl TokenSession {
    /// Load the module, find the token by serial, log in and enumerate.
    pub fn open(config: &TokenConfig) -> Result<TokenSession, CredentialError> {
        let pkcs11 = Pkcs11::new(&config.module_path).map_err(|e| {
            CredentialError::TokenUnavailable(format!(
                "cannot load PKCS#11 module {}: {e}",
                config.module_path.display()
            ))
        })?;
        pkcs11.initialize(CInitializeArgs::OsThreads).map_err(|e| {
            CredentialError::TokenUnavailable(format!("cannot initialize PKCS#11 module: {e}"))
        })?;

        let slot = find_slot(&pkcs11, &config.serial)?;
        debug!("Token {} found in slot {}", config.serial, slot.id());

        let session = pkcs11.open_ro_session(slot)?;
        let pin = AuthPin::new(config.pin.expose_secret().to_string());
        session
            .login(UserType::User, Some(&pin))
            .map_err(CredentialError::AuthenticationFailed)?;

        let credentials = enumerate(&pkcs11, slot, &session)?;
        if credentials.is_empty() {
            return Err(CredentialError::NoCredentials);
        }
        info!(
            "Token {}: {} certificate(s) with a private key",
            config.serial,
            credentials.len()
        );

        Ok(TokenSession {
            credentials,
            session,
            slot,
        })
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// The credential at `index`, or `IndexOutOfRange`.
    pub fn select(&self, index: usize) -> Result<&Credential, CredentialError> {
        select_index(&self.credentials, index)
    }

    /// Log out and close the session.
    pub fn close(self) -> Result<(), CredentialError> {
        let TokenSession { session, slot, .. } = self;
        session.logout()?;
        debug!("Logged out of token in slot {}", slot.id());
        Ok(())
    }
}

pub(crate) fn select_index<T>(items: &[T], index: usize) -> Result<&T, CredentialError> {
    items.get(index).ok_or(CredentialError::IndexOutOfRange {
        index,
        count: items.len(),
    })
}

fn find_slot(pkcs11: &Pkcs11, serial: &str) -> Result<Slot, CredentialError> {
    let slots = pkcs11.get_slots_with_token().map_err(|e| {
        CredentialError::TokenUnavailable(format!("cannot list token slots: {e}"))
    })?;

    for slot in slots {
        match pkcs11.get_token_info(slot) {
            Ok(info) if info.serial_number().trim() == serial.trim() => return Ok(slot),
            Ok(_) => {}
            Err(e) => warn!("Skipping slot {}: {}", slot.id(), e),
        }
    }

    Err(CredentialError::TokenUnavailable(format!(
        "no attached token has serial '{serial}'"
    )))
}

/// An X.509 certificate object read from the token.
#[derive(Debug, Clone)]
struct TokenCertificate {
    id: Vec<u8>,
    label: String,
    der: CertificateDer<'static>,
    subject: String,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
}

impl TokenCertificate {
    fn parse(id: Vec<u8>, label: String, der: Vec<u8>) -> Result<Self, CredentialError> {
        let (subject, subject_raw, issuer_raw) = {
            let (_, cert) = X509Certificate::from_der(&der)
                .map_err(|e| CredentialError::Certificate(format!("{label}: {e}")))?;
            (
                cert.subject().to_string(),
                cert.subject().as_raw().to_vec(),
                cert.issuer().as_raw().to_vec(),
            )
        };

        Ok(Self {
            id,
            label,
            der: CertificateDer::from(der),
            subject,
            subject_raw,
            issuer_raw,
        })
    }

    fn is_self_signed(&self) -> bool {
        self.subject_raw == self.issuer_raw
    }
}

fn read_certificates(session: &Session) -> Result<Vec<TokenCertificate>, CredentialError> {
    let handles = session.find_objects(&[
        Attribute::Class(ObjectClass::CERTIFICATE),
        Attribute::CertificateType(CertificateType::X_509),
    ])?;

    let mut certificates = Vec::with_capacity(handles.len());
    for handle in handles {
        let mut id = Vec::new();
        let mut label = String::new();
        let mut value = Vec::new();
        for attribute in session.get_attributes(
            handle,
            &[AttributeType::Id, AttributeType::Label, AttributeType::Value],
        )? {
            match attribute {
                Attribute::Id(bytes) => id = bytes,
                Attribute::Label(bytes) => label = String::from_utf8_lossy(&bytes).into_owned(),
                Attribute::Value(bytes) => value = bytes,
                _ => {}
            }
        }

        if value.is_empty() {
            warn!("Certificate object '{}' has no value, skipping", label);
            continue;
        }
        match TokenCertificate::parse(id, label, value) {
            Ok(cert) => certificates.push(cert),
            Err(e) => warn!("Skipping certificate: {}", e),
        }
    }

    Ok(certificates)
}

/// The private key sharing the certificate's `CKA_ID` (or label when the
/// certificate has no ID).
fn find_private_key(
    session: &Session,
    cert: &TokenCertificate,
) -> Result<Option<ObjectHandle>, CredentialError> {
    let selector = if cert.id.is_empty() {
        if cert.label.is_empty() {
            return Ok(None);
        }
        Attribute::Label(cert.label.as_bytes().to_vec())
    } else {
        Attribute::Id(cert.id.clone())
    };

    let keys = session.find_objects(&[Attribute::Class(ObjectClass::PRIVATE_KEY), selector])?;
    Ok(keys.into_iter().next())
}

fn key_kind(session: &Session, key: ObjectHandle) -> Result<KeyKind, CredentialError> {
    let key_type = session
        .get_attributes(key, &[AttributeType::KeyType])?
        .into_iter()
        .find_map(|attribute| match attribute {
            Attribute::KeyType(key_type) => Some(key_type),
            _ => None,
        });

    let kind = match key_type {
        Some(key_type) if key_type == KeyType::RSA => KeyKind::Rsa,
        Some(key_type) if key_type == KeyType::EC => {
            let params = session
                .get_attributes(key, &[AttributeType::EcParams])?
                .into_iter()
                .find_map(|attribute| match attribute {
                    Attribute::EcParams(params) => Some(params),
                    _ => None,
                })
                .unwrap_or_default();
            KeyKind::from_ec_params(&params)
        }
        Some(other) => KeyKind::Unsupported(format!("key type {other:?}")),
        None => KeyKind::Unsupported("key type not readable".to_string()),
    };

    Ok(kind)
}

fn enumerate(
    pkcs11: &Pkcs11,
    slot: Slot,
    session: &Session,
) -> Result<Vec<Credential>, CredentialError> {
    let certificates = read_certificates(session)?;

    let mut credentials = Vec::new();
    for (position, cert) in certificates.iter().enumerate() {
        let Some(key) = find_private_key(session, cert)? else {
            debug!("Certificate '{}' has no private key, not paired", cert.subject);
            continue;
        };

        let kind = key_kind(session, key)?;
        if let KeyKind::Unsupported(reason) = &kind {
            warn!(
                "Certificate '{}' uses a key this proxy cannot sign with: {}",
                cert.subject, reason
            );
        }

        credentials.push(Credential {
            index: credentials.len(),
            label: cert.label.clone(),
            id: cert.id.clone(),
            subject: cert.subject.clone(),
            chain: build_chain(position, &certificates),
            key: Arc::new(TokenSigningKey::new(pkcs11.clone(), slot, key, kind)),
        });
    }

    Ok(credentials)
}

/// The leaf at `leaf` followed by intermediates linked by issuer name.
/// Self-signed roots are left out.
fn build_chain(leaf: usize, certificates: &[TokenCertificate]) -> Vec<CertificateDer<'static>> {
    let mut chain = vec![certificates[leaf].der.clone()];
    let mut used = vec![leaf];
    let mut current = &certificates[leaf];

    while !current.is_self_signed() && chain.len() < MAX_CHAIN_DEPTH {
        let next = certificates
            .iter()
            .enumerate()
            .find(|(i, cert)| !used.contains(i) && cert.subject_raw == current.issuer_raw);

        match next {
            Some((_, issuer)) if issuer.is_self_signed() => break,
            Some((i, issuer)) => {
                chain.push(issuer.der.clone());
                used.push(i);
                current = issuer;
            }
            None => break,
        }
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    struct Issued {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn params(common_name: &str, ca: bool) -> CertificateParams {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        if ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }
        params
    }

    fn root(common_name: &str) -> Issued {
        let key = KeyPair::generate().unwrap();
        let cert = params(common_name, true).self_signed(&key).unwrap();
        Issued { cert, key }
    }

    fn issue(common_name: &str, ca: bool, issuer: &Issued) -> Issued {
        let key = KeyPair::generate().unwrap();
        let cert = params(common_name, ca)
            .signed_by(&key, &issuer.cert, &issuer.key)
            .unwrap();
        Issued { cert, key }
    }

    fn token_cert(id: &[u8], issued: &Issued) -> TokenCertificate {
        TokenCertificate::parse(id.to_vec(), String::new(), issued.cert.der().to_vec()).unwrap()
    }

    #[test]
    fn test_select_out_of_range() {
        let items = ["a", "b"];
        assert_eq!(*select_index(&items, 1).unwrap(), "b");

        let err = select_index(&items, 2).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::IndexOutOfRange { index: 2, count: 2 }
        ));
    }

    #[test]
    fn test_select_from_empty_set() {
        let items: [u8; 0] = [];
        assert!(matches!(
            select_index(&items, 0),
            Err(CredentialError::IndexOutOfRange { index: 0, count: 0 })
        ));
    }

    #[test]
    fn test_subject_is_readable() {
        let ca = root("Token Test Root");
        let leaf = issue("alice", false, &ca);

        let cert = token_cert(b"\x01", &leaf);
        assert_eq!(cert.subject, "CN=alice");
        assert!(!cert.is_self_signed());
        assert!(token_cert(b"", &ca).is_self_signed());
    }

    #[test]
    fn test_chain_follows_intermediates_and_skips_root() {
        let ca = root("Root CA");
        let intermediate = issue("Issuing CA", true, &ca);
        let leaf = issue("alice", false, &intermediate);

        let certificates = vec![
            token_cert(b"", &ca),
            token_cert(b"\x01", &leaf),
            token_cert(b"", &intermediate),
        ];

        let chain = build_chain(1, &certificates);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].as_ref(), leaf.cert.der().as_ref());
        assert_eq!(chain[1].as_ref(), intermediate.cert.der().as_ref());
    }

    #[test]
    fn test_chain_is_leaf_only_without_issuer_on_token() {
        let ca = root("Root CA");
        let leaf = issue("bob", false, &ca);

        let certificates = vec![token_cert(b"\x02", &leaf)];
        let chain = build_chain(0, &certificates);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_invalid_der_is_certificate_error() {
        let err = TokenCertificate::parse(vec![1], "broken".into(), vec![0x30, 0x00]).unwrap_err();
        assert!(matches!(err, CredentialError::Certificate(_)));
    }
}
