//! PKI transforms for backing-service bindings
//!
//! Backing services hand out certificates and keys as PEM. Java applications
//! want them as password protected key stores, so this module converts:
//!
//! - one or more CERTIFICATE blocks into a trust store (`alias0`, `alias1`, ...)
//! - a certificate chain plus one private key into a key store entry
//!
//! Stores are written in the JKS format (see [`jks`]) and every store gets its
//! own random password from [`gen_password`].

pub mod jks;

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use x509_parser::parse_x509_certificate;

pub use jks::StoreEntry;

/// Alias of the single private-key entry in a key store
pub const KEY_STORE_ALIAS: &str = "nuxeo";

/// Length of generated store passwords
pub const PASSWORD_LEN: usize = 12;

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PKCS8_KEY_TAG: &str = "PRIVATE KEY";
const PKCS1_RSA_KEY_TAG: &str = "RSA PRIVATE KEY";

/// DER encoding of the rsaEncryption AlgorithmIdentifier (OID 1.2.840.113549.1.1.1, NULL)
const RSA_ALGORITHM_ID: &[u8] = &[
    0x30, 0x0D, 0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// PEM text could not be parsed
    #[error("failed to parse PEM: {0}")]
    ParseError(String),

    /// No CERTIFICATE block in the input
    #[error("no certificate found in PEM input")]
    NoCertificates,

    /// A CERTIFICATE block does not hold an X.509 certificate
    #[error("invalid certificate #{index}: {message}")]
    InvalidCertificate {
        /// Position of the block among the certificates
        index: usize,
        /// Parser message
        message: String,
    },

    /// No private key block in the input
    #[error("no private key found in PEM input")]
    NoPrivateKey,

    /// The PEM block is not a private key
    #[error("PEM block type '{0}' is not a private key")]
    NotAPrivateKey(String),

    /// More than one private key block
    #[error("expected exactly one private key, found {0}")]
    MultiplePrivateKeys(usize),

    /// A private key type that cannot be stored
    #[error("unsupported private key type '{0}', convert it to PKCS#8 ('PRIVATE KEY')")]
    UnsupportedKeyType(String),

    /// A key store could not be read
    #[error("invalid key store: {0}")]
    InvalidStore(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Build a trust store holding every certificate in `pem_certs`
pub fn to_trust_store(pem_certs: &[u8], password: &str) -> Result<Vec<u8>> {
    let certificates = parse_certificates(pem_certs)?;
    let entries: Vec<StoreEntry> = certificates
        .into_iter()
        .enumerate()
        .map(|(i, certificate)| StoreEntry::TrustedCertificate {
            alias: format!("alias{}", i),
            certificate,
        })
        .collect();
    jks::encode(&entries, password, now_millis())
}

/// Build a key store holding one private key and its certificate chain
pub fn to_key_store(pem_certs: &[u8], pem_key: &[u8], password: &str) -> Result<Vec<u8>> {
    let chain = parse_certificates(pem_certs)?;
    let key = parse_private_key(pem_key)?;
    let entry = StoreEntry::PrivateKey {
        alias: KEY_STORE_ALIAS.to_string(),
        key,
        chain,
    };
    jks::encode(&[entry], password, now_millis())
}

/// Read back a store produced by [`to_trust_store`] or [`to_key_store`]
pub fn decode_store(store: &[u8], password: &str) -> Result<Vec<StoreEntry>> {
    jks::decode(store, password)
}

/// Generate a fresh 12 character alphanumeric password
pub fn gen_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Render DER bytes as an LF-terminated PEM block
pub fn encode_pem(tag: &str, der: &[u8]) -> String {
    let block = pem::Pem::new(tag, der.to_vec());
    pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// Entries a trust store built from `pem_certs` would contain
///
/// Used to check whether an existing store already holds this material.
pub fn expected_trust_entries(pem_certs: &[u8]) -> Result<Vec<StoreEntry>> {
    Ok(parse_certificates(pem_certs)?
        .into_iter()
        .enumerate()
        .map(|(i, certificate)| StoreEntry::TrustedCertificate {
            alias: format!("alias{}", i),
            certificate,
        })
        .collect())
}

/// Entries a key store built from `pem_certs` and `pem_key` would contain
pub fn expected_key_entries(pem_certs: &[u8], pem_key: &[u8]) -> Result<Vec<StoreEntry>> {
    Ok(vec![StoreEntry::PrivateKey {
        alias: KEY_STORE_ALIAS.to_string(),
        key: parse_private_key(pem_key)?,
        chain: parse_certificates(pem_certs)?,
    }])
}

fn parse_blocks(data: &[u8]) -> Result<Vec<pem::Pem>> {
    pem::parse_many(data).map_err(|e| PkiError::ParseError(e.to_string()))
}

/// Extract the DER of every CERTIFICATE block, in order
fn parse_certificates(pem_certs: &[u8]) -> Result<Vec<Vec<u8>>> {
    let certificates: Vec<Vec<u8>> = parse_blocks(pem_certs)?
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_TAG)
        .map(|block| block.into_contents())
        .collect();

    if certificates.is_empty() {
        return Err(PkiError::NoCertificates);
    }

    for (index, der) in certificates.iter().enumerate() {
        parse_x509_certificate(der).map_err(|e| PkiError::InvalidCertificate {
            index,
            message: e.to_string(),
        })?;
    }
    Ok(certificates)
}

/// Extract exactly one private key as PKCS#8 DER
fn parse_private_key(pem_key: &[u8]) -> Result<Vec<u8>> {
    let blocks = parse_blocks(pem_key)?;
    let keys: Vec<&pem::Pem> = blocks
        .iter()
        .filter(|block| block.tag().ends_with(PKCS8_KEY_TAG))
        .collect();

    match keys.as_slice() {
        [] => match blocks.first() {
            Some(other) => Err(PkiError::NotAPrivateKey(other.tag().to_string())),
            None => Err(PkiError::NoPrivateKey),
        },
        [key] => match key.tag() {
            PKCS8_KEY_TAG => Ok(key.contents().to_vec()),
            PKCS1_RSA_KEY_TAG => Ok(wrap_pkcs1_rsa(key.contents())),
            other => Err(PkiError::UnsupportedKeyType(other.to_string())),
        },
        many => Err(PkiError::MultiplePrivateKeys(many.len())),
    }
}

/// Wrap a PKCS#1 RSAPrivateKey into a PKCS#8 PrivateKeyInfo
fn wrap_pkcs1_rsa(pkcs1: &[u8]) -> Vec<u8> {
    let mut content = vec![0x02, 0x01, 0x00];
    content.extend_from_slice(RSA_ALGORITHM_ID);
    content.extend(jks::der_tlv(0x04, pkcs1));
    jks::der_tlv(0x30, &content)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    struct Issued {
        cert_pem: String,
        key_pem: String,
    }

    fn issue(name: &str) -> Issued {
        let key_pair = KeyPair::generate().expect("key generation should succeed");
        let params =
            CertificateParams::new(vec![name.to_string()]).expect("params should be valid");
        let cert = params
            .self_signed(&key_pair)
            .expect("self-signing should succeed");
        Issued {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }
    }

    fn reencode_entries(entries: &[StoreEntry]) -> (Vec<String>, Option<String>) {
        let mut certs = Vec::new();
        let mut key = None;
        for entry in entries {
            match entry {
                StoreEntry::TrustedCertificate { certificate, .. } => {
                    certs.push(encode_pem(CERTIFICATE_TAG, certificate));
                }
                StoreEntry::PrivateKey {
                    key: der, chain, ..
                } => {
                    key = Some(encode_pem(PKCS8_KEY_TAG, der));
                    certs.extend(chain.iter().map(|c| encode_pem(CERTIFICATE_TAG, c)));
                }
            }
        }
        (certs, key)
    }

    /// Story: an Elasticsearch CA bundle becomes a trust store the JVM can read,
    /// and decoding it gives back exactly the PEM that went in
    #[test]
    fn story_trust_store_round_trips_pem() {
        let ca = issue("es-http");
        let other = issue("es-transport");
        let bundle = format!("{}{}", ca.cert_pem, other.cert_pem);

        let store = to_trust_store(bundle.as_bytes(), "trustpass123").unwrap();
        let entries = decode_store(&store, "trustpass123").unwrap();

        let aliases: Vec<&str> = entries
            .iter()
            .map(|e| match e {
                StoreEntry::TrustedCertificate { alias, .. } => alias.as_str(),
                StoreEntry::PrivateKey { alias, .. } => alias.as_str(),
            })
            .collect();
        assert_eq!(aliases, vec!["alias0", "alias1"]);

        let (certs, key) = reencode_entries(&entries);
        assert_eq!(certs, vec![ca.cert_pem, other.cert_pem]);
        assert!(key.is_none());
    }

    /// Story: a Kafka user certificate and key become a key store entry
    #[test]
    fn story_key_store_round_trips_pem() {
        let user = issue("kafka-user");

        let store =
            to_key_store(user.cert_pem.as_bytes(), user.key_pem.as_bytes(), "keypass").unwrap();
        let entries = decode_store(&store, "keypass").unwrap();
        assert_eq!(entries.len(), 1);

        let (certs, key) = reencode_entries(&entries);
        assert_eq!(certs, vec![user.cert_pem]);
        assert_eq!(key, Some(user.key_pem));
    }

    #[test]
    fn test_expected_entries_match_decoded_store() {
        let user = issue("kafka-user");
        let store =
            to_key_store(user.cert_pem.as_bytes(), user.key_pem.as_bytes(), "pw").unwrap();
        let expected =
            expected_key_entries(user.cert_pem.as_bytes(), user.key_pem.as_bytes()).unwrap();
        assert_eq!(decode_store(&store, "pw").unwrap(), expected);

        let store = to_trust_store(user.cert_pem.as_bytes(), "pw").unwrap();
        let expected = expected_trust_entries(user.cert_pem.as_bytes()).unwrap();
        assert_eq!(decode_store(&store, "pw").unwrap(), expected);
    }

    #[test]
    fn test_trust_store_requires_a_certificate() {
        let user = issue("x");
        let err = to_trust_store(user.key_pem.as_bytes(), "pw").unwrap_err();
        assert!(matches!(err, PkiError::NoCertificates));

        let err = to_trust_store(b"", "pw").unwrap_err();
        assert!(matches!(err, PkiError::NoCertificates));
    }

    #[test]
    fn test_malformed_pem_is_rejected() {
        let garbage = b"-----BEGIN CERTIFICATE-----\n!!!not base64!!!\n-----END CERTIFICATE-----\n";
        assert!(to_trust_store(garbage, "pw").is_err());
    }

    #[test]
    fn test_certificate_block_must_hold_x509() {
        let fake = encode_pem(CERTIFICATE_TAG, b"definitely not DER");
        let err = to_trust_store(fake.as_bytes(), "pw").unwrap_err();
        assert!(matches!(err, PkiError::InvalidCertificate { index: 0, .. }));
    }

    #[test]
    fn test_key_store_rejects_non_key_block() {
        let user = issue("x");
        let err =
            to_key_store(user.cert_pem.as_bytes(), user.cert_pem.as_bytes(), "pw").unwrap_err();
        assert!(matches!(err, PkiError::NotAPrivateKey(tag) if tag == "CERTIFICATE"));
    }

    #[test]
    fn test_key_store_rejects_missing_and_duplicate_keys() {
        let user = issue("x");
        let err = to_key_store(user.cert_pem.as_bytes(), b"", "pw").unwrap_err();
        assert!(matches!(err, PkiError::NoPrivateKey));

        let two = format!("{}{}", user.key_pem, user.key_pem);
        let err = to_key_store(user.cert_pem.as_bytes(), two.as_bytes(), "pw").unwrap_err();
        assert!(matches!(err, PkiError::MultiplePrivateKeys(2)));
    }

    #[test]
    fn test_key_store_requires_certificates() {
        let user = issue("x");
        let err = to_key_store(b"", user.key_pem.as_bytes(), "pw").unwrap_err();
        assert!(matches!(err, PkiError::NoCertificates));
    }

    #[test]
    fn test_ec_sec1_keys_are_unsupported() {
        let user = issue("x");
        let sec1 = encode_pem("EC PRIVATE KEY", b"whatever");
        let err = to_key_store(user.cert_pem.as_bytes(), sec1.as_bytes(), "pw").unwrap_err();
        assert!(matches!(err, PkiError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_pkcs1_rsa_keys_are_wrapped_as_pkcs8() {
        let wrapped = wrap_pkcs1_rsa(&[0x30, 0x00]);
        let (tag, content, rest) = jks::der_read(&wrapped).unwrap();
        assert_eq!(tag, 0x30);
        assert!(rest.is_empty());
        assert!(content.starts_with(&[0x02, 0x01, 0x00]));
        assert!(content.ends_with(&[0x04, 0x02, 0x30, 0x00]));
    }

    #[test]
    fn test_encode_pem_uses_lf_and_parses_back() {
        let text = encode_pem(CERTIFICATE_TAG, &[1, 2, 3]);
        assert!(text.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(!text.contains('\r'));
        let blocks = parse_blocks(text.as_bytes()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].contents(), &[1, 2, 3]);
    }

    #[test]
    fn test_gen_password_shape() {
        let a = gen_password();
        let b = gen_password();
        assert_eq!(a.len(), PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
