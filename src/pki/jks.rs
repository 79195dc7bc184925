//! Java KeyStore (JKS) codec
//!
//! Layout of a version 2 store:
//!
//! ```text
//! u32 magic (0xFEEDFEED) | u32 version (2) | u32 entry count
//! entries:
//!   u32 tag (1 = private key, 2 = trusted certificate) | UTF alias | u64 timestamp (ms)
//!   tag 1: u32 len + EncryptedPrivateKeyInfo | u32 chain len | (UTF "X.509" | u32 len + DER)*
//!   tag 2: UTF "X.509" | u32 len + DER
//! SHA-1(password as UTF-16BE || "Mighty Aphrodite" || everything above)
//! ```
//!
//! Private keys are protected with the Sun key protector: a 20 byte salt seeds a
//! SHA-1 keystream that is XORed with the PKCS#8 bytes, followed by a SHA-1
//! check digest over the password and the plaintext key.

use rand::RngCore;
use sha1::{Digest, Sha1};

use super::{PkiError, Result};

const MAGIC: u32 = 0xFEED_FEED;
const VERSION: u32 = 2;
const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERT: u32 = 2;
const CERT_TYPE: &str = "X.509";
const INTEGRITY_WHITENER: &[u8] = b"Mighty Aphrodite";
const DIGEST_LEN: usize = 20;

/// DER encoding of OID 1.3.6.1.4.1.42.2.17.1.1 (Sun JKS key protector)
const KEY_PROTECTOR_OID: &[u8] = &[
    0x06, 0x0A, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x2A, 0x02, 0x11, 0x01, 0x01,
];
const DER_NULL: &[u8] = &[0x05, 0x00];
const TAG_SEQUENCE: u8 = 0x30;
const TAG_OCTET_STRING: u8 = 0x04;

/// One entry of a decoded store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEntry {
    /// Trusted certificate (trust stores)
    TrustedCertificate {
        /// Entry alias
        alias: String,
        /// DER encoded certificate
        certificate: Vec<u8>,
    },
    /// Private key with its certificate chain (key stores)
    PrivateKey {
        /// Entry alias
        alias: String,
        /// PKCS#8 DER encoded private key
        key: Vec<u8>,
        /// DER encoded certificates, leaf first
        chain: Vec<Vec<u8>>,
    },
}

/// Serialize entries into a password protected JKS blob
pub fn encode(entries: &[StoreEntry], password: &str, timestamp_ms: i64) -> Result<Vec<u8>> {
    let password = password_bytes(password);
    let mut out = Vec::new();
    put_u32(&mut out, MAGIC);
    put_u32(&mut out, VERSION);
    put_u32(&mut out, entries.len() as u32);

    for entry in entries {
        match entry {
            StoreEntry::TrustedCertificate { alias, certificate } => {
                put_u32(&mut out, TAG_TRUSTED_CERT);
                put_utf(&mut out, alias)?;
                put_u64(&mut out, timestamp_ms as u64);
                put_certificate(&mut out, certificate)?;
            }
            StoreEntry::PrivateKey { alias, key, chain } => {
                put_u32(&mut out, TAG_PRIVATE_KEY);
                put_utf(&mut out, alias)?;
                put_u64(&mut out, timestamp_ms as u64);
                let protected = protect_key(key, &password);
                put_bytes(&mut out, &encrypted_private_key_info(&protected))?;
                put_u32(&mut out, chain.len() as u32);
                for certificate in chain {
                    put_certificate(&mut out, certificate)?;
                }
            }
        }
    }

    let digest = integrity_digest(&password, &out);
    out.extend_from_slice(&digest);
    Ok(out)
}

/// Parse a JKS blob, verifying the integrity digest and unprotecting keys
pub fn decode(data: &[u8], password: &str) -> Result<Vec<StoreEntry>> {
    if data.len() < DIGEST_LEN {
        return Err(PkiError::InvalidStore("store is truncated".to_string()));
    }
    let password = password_bytes(password);
    let (body, digest) = data.split_at(data.len() - DIGEST_LEN);
    if integrity_digest(&password, body) != digest {
        return Err(PkiError::InvalidStore(
            "integrity check failed: wrong password or corrupted store".to_string(),
        ));
    }

    let mut reader = Reader::new(body);
    if reader.u32()? != MAGIC {
        return Err(PkiError::InvalidStore("not a JKS store".to_string()));
    }
    let version = reader.u32()?;
    if version != VERSION {
        return Err(PkiError::InvalidStore(format!(
            "unsupported JKS version {}",
            version
        )));
    }

    let count = reader.u32()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = reader.u32()?;
        let alias = reader.utf()?;
        let _timestamp = reader.u64()?;
        match tag {
            TAG_TRUSTED_CERT => {
                let certificate = reader.certificate()?;
                entries.push(StoreEntry::TrustedCertificate { alias, certificate });
            }
            TAG_PRIVATE_KEY => {
                let info = reader.bytes()?;
                let protected = parse_encrypted_private_key_info(&info)?;
                let key = unprotect_key(&protected, &password)?;
                let chain_len = reader.u32()?;
                let mut chain = Vec::with_capacity(chain_len as usize);
                for _ in 0..chain_len {
                    chain.push(reader.certificate()?);
                }
                entries.push(StoreEntry::PrivateKey { alias, key, chain });
            }
            other => {
                return Err(PkiError::InvalidStore(format!(
                    "unknown entry tag {}",
                    other
                )))
            }
        }
    }

    if !reader.is_empty() {
        return Err(PkiError::InvalidStore(
            "trailing bytes after last entry".to_string(),
        ));
    }
    Ok(entries)
}

fn password_bytes(password: &str) -> Vec<u8> {
    password
        .encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect()
}

fn integrity_digest(password: &[u8], body: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password);
    hasher.update(INTEGRITY_WHITENER);
    hasher.update(body);
    hasher.finalize().to_vec()
}

fn keystream(password: &[u8], salt: &[u8], len: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(len + DIGEST_LEN);
    let mut digest = salt.to_vec();
    while stream.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(password);
        hasher.update(&digest);
        digest = hasher.finalize().to_vec();
        stream.extend_from_slice(&digest);
    }
    stream.truncate(len);
    stream
}

fn check_digest(password: &[u8], plain: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password);
    hasher.update(plain);
    hasher.finalize().to_vec()
}

fn protect_key(plain: &[u8], password: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; DIGEST_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let stream = keystream(password, &salt, plain.len());
    let mut out = Vec::with_capacity(plain.len() + 2 * DIGEST_LEN);
    out.extend_from_slice(&salt);
    out.extend(plain.iter().zip(stream).map(|(p, k)| p ^ k));
    out.extend_from_slice(&check_digest(password, plain));
    out
}

fn unprotect_key(protected: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    if protected.len() < 2 * DIGEST_LEN {
        return Err(PkiError::InvalidStore(
            "protected key is truncated".to_string(),
        ));
    }
    let (salt, rest) = protected.split_at(DIGEST_LEN);
    let (encrypted, check) = rest.split_at(rest.len() - DIGEST_LEN);
    let stream = keystream(password, salt, encrypted.len());
    let plain: Vec<u8> = encrypted.iter().zip(stream).map(|(c, k)| c ^ k).collect();
    if check_digest(password, &plain) != check {
        return Err(PkiError::InvalidStore(
            "private key check digest mismatch".to_string(),
        ));
    }
    Ok(plain)
}

// =============================================================================
// DER helpers
// =============================================================================

pub(crate) fn der_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let bytes: Vec<u8> = len
        .to_be_bytes()
        .iter()
        .copied()
        .skip_while(|b| *b == 0)
        .collect();
    let mut out = vec![0x80 | bytes.len() as u8];
    out.extend(bytes);
    out
}

pub(crate) fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(der_length(content.len()));
    out.extend_from_slice(content);
    out
}

fn encrypted_private_key_info(protected: &[u8]) -> Vec<u8> {
    let mut algorithm = KEY_PROTECTOR_OID.to_vec();
    algorithm.extend_from_slice(DER_NULL);
    let mut content = der_tlv(TAG_SEQUENCE, &algorithm);
    content.extend(der_tlv(TAG_OCTET_STRING, protected));
    der_tlv(TAG_SEQUENCE, &content)
}

/// Read one TLV, returning (tag, content, remainder)
pub(crate) fn der_read(data: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    let invalid = || PkiError::InvalidStore("malformed DER".to_string());
    let (&tag, rest) = data.split_first().ok_or_else(invalid)?;
    let (&first, rest) = rest.split_first().ok_or_else(invalid)?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7F) as usize;
        if n == 0 || n > std::mem::size_of::<usize>() || rest.len() < n {
            return Err(invalid());
        }
        let len = rest[..n]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len {
        return Err(invalid());
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

fn parse_encrypted_private_key_info(info: &[u8]) -> Result<Vec<u8>> {
    let (tag, content, _) = der_read(info)?;
    if tag != TAG_SEQUENCE {
        return Err(PkiError::InvalidStore(
            "EncryptedPrivateKeyInfo is not a sequence".to_string(),
        ));
    }
    let (tag, algorithm, rest) = der_read(content)?;
    if tag != TAG_SEQUENCE || !algorithm.starts_with(KEY_PROTECTOR_OID) {
        return Err(PkiError::InvalidStore(
            "private key is not protected with the JKS key protector".to_string(),
        ));
    }
    let (tag, protected, _) = der_read(rest)?;
    if tag != TAG_OCTET_STRING {
        return Err(PkiError::InvalidStore(
            "protected key is not an octet string".to_string(),
        ));
    }
    Ok(protected.to_vec())
}

// =============================================================================
// Stream primitives (Java DataOutputStream conventions)
// =============================================================================

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| PkiError::InvalidStore("entry too large".to_string()))?;
    put_u32(out, len);
    out.extend_from_slice(bytes);
    Ok(())
}

// Aliases and certificate types are ASCII, where modified UTF-8 and UTF-8 agree
fn put_utf(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| PkiError::InvalidStore(format!("alias too long: {}", value)))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_certificate(out: &mut Vec<u8>, der: &[u8]) -> Result<()> {
    put_utf(out, CERT_TYPE)?;
    put_bytes(out, der)
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(PkiError::InvalidStore("store is truncated".to_string()));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn utf(&mut self) -> Result<String> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        let len = u16::from_be_bytes(buf) as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| PkiError::InvalidStore("alias is not valid UTF-8".to_string()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn certificate(&mut self) -> Result<Vec<u8>> {
        let cert_type = self.utf()?;
        if cert_type != CERT_TYPE {
            return Err(PkiError::InvalidStore(format!(
                "unsupported certificate type {}",
                cert_type
            )));
        }
        self.bytes()
    }
}
