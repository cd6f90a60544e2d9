//! # BlobCodec
//!
//! The per-blob envelope: OID derivation, optional compression, authenticated
//! encryption, and decoding with a recomputed-hash recheck.
//!
//! Wire format (§4.3):
//! ```text
//! magic(4) || version(1) || flags(1) || kid(8) || oid(32) || ciphertext || tag(16)
//! ```
//!
//! The AEAD nonce is *not* random: it is derived deterministically from the
//! OID so that identical plaintexts always produce identical ciphertexts.
//! That's what makes deduplication possible at the object-store layer — two
//! workers independently encoding the same chunk must agree on every byte of
//! the stored object, or the store would see two different paths for one
//! OID.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{Error, Result};
use crate::keys::{Capability, KeySet};
use crate::oid::{Oid, OID_LEN};

const MAGIC: &[u8; 4] = b"RKB1";
const CODEC_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Blobs are typed so the AAD can bind the envelope to the kind it claims
/// to hold; a dir blob ciphertext can never be replayed as a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    Chunk,
    FileIndex,
    Dir,
    Link,
    Snapshot,
}

impl BlobKind {
    fn tag(self) -> u8 {
        match self {
            BlobKind::Chunk => 0,
            BlobKind::FileIndex => 1,
            BlobKind::Dir => 2,
            BlobKind::Link => 3,
            BlobKind::Snapshot => 4,
        }
    }
}

/// Compress plaintext larger than this and whose zstd output actually beats
/// the raw size; smaller payloads aren't worth the round trip.
const COMPRESS_THRESHOLD: usize = 256;

/// Encodes `plaintext` of the given kind into a storable envelope, returning
/// the envelope bytes and the OID they're addressed by.
pub fn encode(plaintext: &[u8], kind: BlobKind, keys: &KeySet) -> Result<(Oid, Vec<u8>)> {
    if !keys.allows(Capability::EncryptBlob) {
        return Err(Error::Auth(format!(
            "role {} may not encrypt blobs",
            keys.role()
        )));
    }

    let oid = derive_oid(plaintext, keys);

    let (body, compressed) = maybe_compress(plaintext)?;

    let nonce_bytes = derive_nonce(&oid);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(keys.blob_key())
        .map_err(|_| Error::Config("invalid blob key length".into()))?;

    let aad = build_aad(kind, keys.kid());
    let ciphertext = cipher
        .encrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: &body,
                aad: &aad,
            },
        )
        .map_err(|_| Error::Other(anyhow::anyhow!("encryption failure")))?;

    let flags = if compressed { FLAG_COMPRESSED } else { 0 };

    let mut envelope = Vec::with_capacity(4 + 1 + 1 + 8 + OID_LEN + ciphertext.len());
    envelope.extend_from_slice(MAGIC);
    envelope.push(CODEC_VERSION);
    envelope.push(flags);
    envelope.extend_from_slice(keys.kid());
    envelope.extend_from_slice(oid.as_bytes());
    envelope.extend_from_slice(&ciphertext);

    Ok((oid, envelope))
}

/// Decodes an envelope produced by [`encode`], verifying magic, version, kid,
/// AEAD tag, and (after decryption) the OID itself.
pub fn decode(envelope: &[u8], kind: BlobKind, keys: &KeySet) -> Result<Vec<u8>> {
    if !keys.allows(Capability::DecryptBlob) {
        return Err(Error::Auth(format!(
            "role {} may not decrypt blobs",
            keys.role()
        )));
    }

    let header_len = 4 + 1 + 1 + 8 + OID_LEN;
    if envelope.len() < header_len + TAG_LEN {
        return Err(Error::Other(anyhow::anyhow!("envelope truncated")));
    }

    let (magic, rest) = envelope.split_at(4);
    if magic != MAGIC {
        return Err(corrupt_unknown("bad magic"));
    }

    let (version, rest) = rest.split_at(1);
    if version[0] != CODEC_VERSION {
        return Err(corrupt_unknown(&format!(
            "unsupported codec version {}",
            version[0]
        )));
    }

    let (flags, rest) = rest.split_at(1);
    let flags = flags[0];

    let (kid, rest) = rest.split_at(8);
    if kid != keys.kid() {
        return Err(Error::Auth("blob was sealed for a different key id".into()));
    }

    let (oid_bytes, ciphertext) = rest.split_at(OID_LEN);
    let mut oid_arr = [0u8; OID_LEN];
    oid_arr.copy_from_slice(oid_bytes);
    let claimed_oid = Oid::from_bytes(oid_arr);

    let nonce_bytes = derive_nonce(&claimed_oid);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(keys.blob_key())
        .map_err(|_| Error::Config("invalid blob key length".into()))?;

    let aad = build_aad(kind, kid);
    let body = cipher
        .decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| Error::corrupt(claimed_oid, "authentication failed"))?;

    let plaintext = if flags & FLAG_COMPRESSED != 0 {
        decompress(&body)?
    } else {
        body
    };

    let recomputed = derive_oid(&plaintext, keys);
    if recomputed != claimed_oid {
        return Err(Error::corrupt(
            claimed_oid,
            "recomputed hash does not match envelope oid",
        ));
    }

    Ok(plaintext)
}

/// OID = keyed_hash(oid-derivation subkey, plaintext) (spec §4.3 step 1).
pub fn derive_oid(plaintext: &[u8], keys: &KeySet) -> Oid {
    let mut hasher = blake3::Hasher::new_keyed(keys.oid_key());
    hasher.update(plaintext);
    Oid::from_bytes(*hasher.finalize().as_bytes())
}

/// Deterministic 96-bit nonce derived from the OID alone, truncating a
/// keyed BLAKE3 hash under a codec-specific context. Nonce reuse across
/// *distinct* plaintexts would require an OID collision, which the keyed
/// hash already makes infeasible.
fn derive_nonce(oid: &Oid) -> [u8; NONCE_LEN] {
    let mut hasher = blake3::Hasher::new_derive_key("rekkord codec v1 nonce");
    hasher.update(oid.as_bytes());
    let mut out = [0u8; NONCE_LEN];
    let mut reader = hasher.finalize_xof();
    reader.fill(&mut out);
    out
}

fn build_aad(kind: BlobKind, kid: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(2 + 8);
    aad.push(kind.tag());
    aad.push(CODEC_VERSION);
    aad.extend_from_slice(kid);
    aad
}

fn maybe_compress(data: &[u8]) -> Result<(Vec<u8>, bool)> {
    if data.len() < COMPRESS_THRESHOLD {
        return Ok((data.to_vec(), false));
    }

    let compressed = zstd::encode_all(data, 3)?;
    if compressed.len() < data.len() {
        Ok((compressed, true))
    } else {
        Ok((data.to_vec(), false))
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::decode_all(data)?)
}

fn corrupt_unknown(message: &str) -> Error {
    Error::Other(anyhow::anyhow!("{message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRole;

    fn test_keys() -> KeySet {
        KeySet::init_master().derive(KeyRole::Full)
    }

    #[test]
    fn encode_decode_round_trip() {
        let keys = test_keys();
        let plaintext = b"hello rekkord, this is chunk content".to_vec();
        let (oid, envelope) = encode(&plaintext, BlobKind::Chunk, &keys).unwrap();
        let decoded = decode(&envelope, BlobKind::Chunk, &keys).unwrap();
        assert_eq!(decoded, plaintext);
        assert_eq!(derive_oid(&plaintext, &keys), oid);
    }

    #[test]
    fn encoding_is_deterministic() {
        let keys = test_keys();
        let plaintext = b"identical content for dedup".to_vec();
        let (oid1, env1) = encode(&plaintext, BlobKind::Chunk, &keys).unwrap();
        let (oid2, env2) = encode(&plaintext, BlobKind::Chunk, &keys).unwrap();
        assert_eq!(oid1, oid2);
        assert_eq!(env1, env2);
    }

    #[test]
    fn distinct_plaintexts_distinct_oids() {
        let keys = test_keys();
        let (oid1, _) = encode(b"plaintext one", BlobKind::Chunk, &keys).unwrap();
        let (oid2, _) = encode(b"plaintext two", BlobKind::Chunk, &keys).unwrap();
        assert_ne!(oid1, oid2);
    }

    #[test]
    fn tampered_envelope_is_corrupt() {
        let keys = test_keys();
        let (_, mut envelope) = encode(b"tamper me please", BlobKind::Chunk, &keys).unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xff;
        let err = decode(&envelope, BlobKind::Chunk, &keys).unwrap_err();
        assert!(matches!(err, Error::CorruptBlob { .. }));
    }

    #[test]
    fn wrong_role_cannot_decrypt() {
        let master = KeySet::init_master();
        let write_keys = master.derive(KeyRole::Write);
        let full_keys = master.derive(KeyRole::Full);

        let (_, envelope) = encode(b"secret payload", BlobKind::Chunk, &full_keys).unwrap();
        let err = decode(&envelope, BlobKind::Chunk, &write_keys).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn large_compressible_payload_shrinks() {
        let keys = test_keys();
        let plaintext = vec![0x42u8; 64 * 1024];
        let (_, envelope) = encode(&plaintext, BlobKind::Chunk, &keys).unwrap();
        assert!(envelope.len() < plaintext.len());
        let decoded = decode(&envelope, BlobKind::Chunk, &keys).unwrap();
        assert_eq!(decoded, plaintext);
    }
}
