//! # KeyHierarchy
//!
//! A master key and four derived role keys (Full, Write, Log, Config), the
//! per-blob/channel/config subkeys each role carries, and the portable
//! sealed key-file format used to export/import them (§4.2).
//!
//! Role containment (I4) is enforced at the call sites of every
//! cryptographic operation (`codec::decode`, channel append/read, config
//! admin) via [`KeyRole::allows`], checked before any key material is
//! touched. Genuine cryptographic separation between "may encrypt" and "may
//! decrypt" holders of the same symmetric subkey would require asymmetric
//! primitives; this crate keeps the symmetric AEAD design its dependency
//! stack supports and enforces the matrix in software, immediately and
//! unconditionally, rather than by omitting key bytes a role never needed.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use argon2::password_hash::SaltString;
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

const KID_LEN: usize = 8;
const SUBKEY_LEN: usize = 32;
const KEY_FILE_MAGIC: &[u8; 6] = b"RKKEY1";

/// Capabilities gated by [`KeyRole`] (§4.2 role matrix).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    DeriveOid,
    EncryptBlob,
    DecryptBlob,
    WriteChannel,
    ReadChannel,
    AdminConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyRole {
    Master,
    Full,
    Write,
    Log,
    Config,
}

impl KeyRole {
    pub fn allows(self, cap: Capability) -> bool {
        use Capability::*;
        use KeyRole::*;
        match (self, cap) {
            (Master, _) => true,
            (Full, AdminConfig) => false,
            (Full, _) => true,
            (Write, DeriveOid) | (Write, EncryptBlob) | (Write, WriteChannel) => true,
            (Write, _) => false,
            (Log, ReadChannel) => true,
            (Log, _) => false,
            (Config, AdminConfig) => true,
            (Config, _) => false,
        }
    }

    fn tag(self) -> u8 {
        match self {
            KeyRole::Master => 0,
            KeyRole::Full => 1,
            KeyRole::Write => 2,
            KeyRole::Log => 3,
            KeyRole::Config => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => KeyRole::Master,
            1 => KeyRole::Full,
            2 => KeyRole::Write,
            3 => KeyRole::Log,
            4 => KeyRole::Config,
            other => return Err(Error::Config(format!("unknown key role tag {other}"))),
        })
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyRole::Master => "master",
            KeyRole::Full => "full",
            KeyRole::Write => "write",
            KeyRole::Log => "log",
            KeyRole::Config => "config",
        };
        write!(f, "{name}")
    }
}

/// Derived subkeys for one role. Fields a role has no business holding are
/// zero-filled; fields shared between a permitted and a forbidden direction
/// (blob encrypt/decrypt, channel write/read) carry real material with the
/// forbidden direction enforced by [`KeyRole::allows`] at the call site.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    #[zeroize(skip)]
    kid: [u8; KID_LEN],
    #[zeroize(skip)]
    role: KeyRole,
    oid_key: [u8; SUBKEY_LEN],
    blob_key: [u8; SUBKEY_LEN],
    channel_key: [u8; SUBKEY_LEN],
    config_key: [u8; SUBKEY_LEN],
}

impl KeySet {
    /// Generates a fresh, random master key with a fresh `kid` (§4.2
    /// `init_master`).
    pub fn init_master() -> Self {
        let mut kid = [0u8; KID_LEN];
        let mut master = [0u8; SUBKEY_LEN];
        OsRng.fill_bytes(&mut kid);
        OsRng.fill_bytes(&mut master);

        let mut keyset = Self::derive_subkeys(&kid, &master, KeyRole::Master);
        master.zeroize();
        keyset.role = KeyRole::Master;
        keyset
    }

    /// Deterministic derivation of a role's subkeys from this key's
    /// material (§4.2 `derive`: same `(master, role)` always yields the
    /// same subkeys). Only meaningful when called on a `Master` keyset.
    pub fn derive(&self, role: KeyRole) -> KeySet {
        let master = self.master_material();
        let mut derived = Self::derive_subkeys(&self.kid, &master, role);
        derived.zero_forbidden_fields();
        derived
    }

    fn master_material(&self) -> [u8; SUBKEY_LEN] {
        // The master keyset's four subkeys are themselves derived from one
        // secret; for `Master` we fold them back into one seed so `derive`
        // can be called on whichever keyset actually holds full material.
        let mut hasher = blake3::Hasher::new_derive_key("rekkord master fold v1");
        hasher.update(&self.oid_key);
        hasher.update(&self.blob_key);
        hasher.update(&self.channel_key);
        hasher.update(&self.config_key);
        *hasher.finalize().as_bytes()
    }

    fn derive_subkeys(kid: &[u8; KID_LEN], master: &[u8; SUBKEY_LEN], role: KeyRole) -> KeySet {
        let derive_one = |context: &str| -> [u8; SUBKEY_LEN] {
            let mut hasher = blake3::Hasher::new_derive_key(context);
            hasher.update(kid);
            hasher.update(master);
            *hasher.finalize().as_bytes()
        };

        KeySet {
            kid: *kid,
            role,
            oid_key: derive_one("rekkord oid-derivation subkey v1"),
            blob_key: derive_one("rekkord blob-encryption subkey v1"),
            channel_key: derive_one("rekkord channel-signing subkey v1"),
            config_key: derive_one("rekkord config-signing subkey v1"),
        }
    }

    fn zero_forbidden_fields(&mut self) {
        if !self.role.allows(Capability::DeriveOid) {
            self.oid_key.zeroize();
        }
        if !self.role.allows(Capability::EncryptBlob) && !self.role.allows(Capability::DecryptBlob)
        {
            self.blob_key.zeroize();
        }
        if !self.role.allows(Capability::WriteChannel) && !self.role.allows(Capability::ReadChannel)
        {
            self.channel_key.zeroize();
        }
        if !self.role.allows(Capability::AdminConfig) {
            self.config_key.zeroize();
        }
    }

    pub fn kid(&self) -> &[u8; KID_LEN] {
        &self.kid
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub fn oid_key(&self) -> &[u8; SUBKEY_LEN] {
        &self.oid_key
    }

    pub fn blob_key(&self) -> &[u8; SUBKEY_LEN] {
        &self.blob_key
    }

    pub fn channel_key(&self) -> &[u8; SUBKEY_LEN] {
        &self.channel_key
    }

    pub fn config_key(&self) -> &[u8; SUBKEY_LEN] {
        &self.config_key
    }

    pub fn allows(&self, cap: Capability) -> bool {
        self.role.allows(cap)
    }

    /// Signs `message` with the channel-signing subkey (§4.2 "Signing").
    /// Implemented as a keyed BLAKE3 MAC rather than a public-key signature
    /// scheme, consistent with this crate's symmetric-only crypto stack;
    /// verification requires possession of the same `channel_key`.
    pub fn sign_channel(&self, message: &[u8]) -> Result<[u8; 32]> {
        if !self.allows(Capability::WriteChannel) {
            return Err(Error::Auth(format!(
                "role {} may not sign channel entries",
                self.role
            )));
        }
        let mut hasher = blake3::Hasher::new_keyed(&self.channel_key);
        hasher.update(message);
        Ok(*hasher.finalize().as_bytes())
    }

    pub fn verify_channel(&self, message: &[u8], signature: &[u8; 32]) -> Result<()> {
        if !self.allows(Capability::ReadChannel) {
            return Err(Error::Auth(format!(
                "role {} may not read channel entries",
                self.role
            )));
        }
        let mut hasher = blake3::Hasher::new_keyed(&self.channel_key);
        hasher.update(message);
        let expected = hasher.finalize();
        if expected.as_bytes() == signature {
            Ok(())
        } else {
            Err(Error::Auth("channel entry signature mismatch".into()))
        }
    }

    /// Portable sealed key-file bytes for this role (§4.2 `export_key_file`,
    /// §6 key-file format): magic, role, kid, then the sealed subkeys.
    /// `passphrase` selects Argon2id password sealing; `None` raw-seals with
    /// a locally generated symmetric wrapping key whose bytes are embedded
    /// in the file (matches the teacher's "raw key" export path, for
    /// operator convenience when the file itself is kept offline).
    pub fn export_key_file(&self, passphrase: Option<&str>) -> Result<Vec<u8>> {
        let payload = self.serialize_subkeys();
        let sealed = match passphrase {
            Some(pass) => seal_with_passphrase(&payload, pass)?,
            None => seal_raw(&payload)?,
        };

        let mut out = Vec::with_capacity(KEY_FILE_MAGIC.len() + 1 + KID_LEN + sealed.len());
        out.extend_from_slice(KEY_FILE_MAGIC);
        out.push(self.role.tag());
        out.extend_from_slice(&self.kid);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn import_key_file(bytes: &[u8], passphrase: Option<&str>) -> Result<KeySet> {
        if bytes.len() < KEY_FILE_MAGIC.len() + 1 + KID_LEN {
            return Err(Error::Config("key file truncated".into()));
        }
        let (magic, rest) = bytes.split_at(KEY_FILE_MAGIC.len());
        if magic != KEY_FILE_MAGIC {
            return Err(Error::Config("not a rekkord key file".into()));
        }
        let (role_byte, rest) = rest.split_at(1);
        let role = KeyRole::from_tag(role_byte[0])?;
        let (kid_bytes, sealed) = rest.split_at(KID_LEN);
        let mut kid = [0u8; KID_LEN];
        kid.copy_from_slice(kid_bytes);

        let payload = match passphrase {
            Some(pass) => unseal_with_passphrase(sealed, pass)?,
            None => unseal_raw(sealed)?,
        };

        let mut keyset = KeySet::deserialize_subkeys(&kid, role, &payload)?;
        keyset.zero_forbidden_fields();
        Ok(keyset)
    }

    /// Reads the role and key id from a sealed key file without unsealing
    /// the subkeys themselves (§4.2 `identify`, grounded on `RunIdentify` in
    /// `cli/manage.cc`, which reports a key file's metadata without asking
    /// for its passphrase).
    pub fn inspect_key_file(bytes: &[u8]) -> Result<(KeyRole, [u8; KID_LEN])> {
        if bytes.len() < KEY_FILE_MAGIC.len() + 1 + KID_LEN {
            return Err(Error::Config("key file truncated".into()));
        }
        let (magic, rest) = bytes.split_at(KEY_FILE_MAGIC.len());
        if magic != KEY_FILE_MAGIC {
            return Err(Error::Config("not a rekkord key file".into()));
        }
        let (role_byte, rest) = rest.split_at(1);
        let role = KeyRole::from_tag(role_byte[0])?;
        let mut kid = [0u8; KID_LEN];
        kid.copy_from_slice(&rest[..KID_LEN]);
        Ok((role, kid))
    }

    fn serialize_subkeys(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * SUBKEY_LEN);
        out.extend_from_slice(&self.oid_key);
        out.extend_from_slice(&self.blob_key);
        out.extend_from_slice(&self.channel_key);
        out.extend_from_slice(&self.config_key);
        out
    }

    fn deserialize_subkeys(kid: &[u8; KID_LEN], role: KeyRole, payload: &[u8]) -> Result<KeySet> {
        if payload.len() != 4 * SUBKEY_LEN {
            return Err(Error::Config("malformed key file payload".into()));
        }
        let mut oid_key = [0u8; SUBKEY_LEN];
        let mut blob_key = [0u8; SUBKEY_LEN];
        let mut channel_key = [0u8; SUBKEY_LEN];
        let mut config_key = [0u8; SUBKEY_LEN];
        oid_key.copy_from_slice(&payload[0..32]);
        blob_key.copy_from_slice(&payload[32..64]);
        channel_key.copy_from_slice(&payload[64..96]);
        config_key.copy_from_slice(&payload[96..128]);

        Ok(KeySet {
            kid: *kid,
            role,
            oid_key,
            blob_key,
            channel_key,
            config_key,
        })
    }
}

const WRAP_NONCE_LEN: usize = 12;

fn seal_with_passphrase(payload: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let mut wrap_key = [0u8; SUBKEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt.as_str().as_bytes(), &mut wrap_key)
        .map_err(|e| Error::Auth(format!("passphrase hashing failed: {e}")))?;

    let sealed = aead_wrap(&wrap_key, payload)?;
    wrap_key.zeroize();

    let salt_bytes = salt.as_str().as_bytes();
    let mut out = Vec::with_capacity(1 + 1 + salt_bytes.len() + sealed.len());
    out.push(1); // passphrase-sealed marker
    out.push(salt_bytes.len() as u8);
    out.extend_from_slice(salt_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn unseal_with_passphrase(sealed: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    if sealed.is_empty() || sealed[0] != 1 {
        return Err(Error::Auth("key file is not passphrase-sealed".into()));
    }
    let salt_len = sealed[1] as usize;
    if sealed.len() < 2 + salt_len {
        return Err(Error::Config("key file truncated".into()));
    }
    let salt_str = std::str::from_utf8(&sealed[2..2 + salt_len])
        .map_err(|_| Error::Config("malformed salt".into()))?;

    let mut wrap_key = [0u8; SUBKEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt_str.as_bytes(), &mut wrap_key)
        .map_err(|e| Error::Auth(format!("passphrase hashing failed: {e}")))?;

    let result = aead_unwrap(&wrap_key, &sealed[2 + salt_len..]);
    wrap_key.zeroize();
    result.map_err(|_| Error::Auth("wrong passphrase".into()))
}

fn seal_raw(payload: &[u8]) -> Result<Vec<u8>> {
    let mut wrap_key = [0u8; SUBKEY_LEN];
    OsRng.fill_bytes(&mut wrap_key);
    let sealed = aead_wrap(&wrap_key, payload)?;

    let mut out = Vec::with_capacity(1 + SUBKEY_LEN + sealed.len());
    out.push(0); // raw-sealed marker
    out.extend_from_slice(&wrap_key);
    out.extend_from_slice(&sealed);
    wrap_key.zeroize();
    Ok(out)
}

fn unseal_raw(sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.is_empty() || sealed[0] != 0 {
        return Err(Error::Config("key file is not raw-sealed".into()));
    }
    if sealed.len() < 1 + SUBKEY_LEN {
        return Err(Error::Config("key file truncated".into()));
    }
    let mut wrap_key = [0u8; SUBKEY_LEN];
    wrap_key.copy_from_slice(&sealed[1..1 + SUBKEY_LEN]);
    let result = aead_unwrap(&wrap_key, &sealed[1 + SUBKEY_LEN..]);
    wrap_key.zeroize();
    result.map_err(|_| Error::Config("malformed key file".into()))
}

fn aead_wrap(key: &[u8; SUBKEY_LEN], payload: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Config("invalid wrap key length".into()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, payload)
        .map_err(|_| Error::Other(anyhow::anyhow!("key wrap encryption failed")))?;
    let mut out = Vec::with_capacity(WRAP_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_unwrap(key: &[u8; SUBKEY_LEN], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < WRAP_NONCE_LEN {
        return Err(Error::Config("sealed payload truncated".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(WRAP_NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Config("invalid wrap key length".into()))?;
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Auth("key unwrap failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let master = KeySet::init_master();
        let a = master.derive(KeyRole::Write);
        let b = master.derive(KeyRole::Write);
        assert_eq!(a.blob_key(), b.blob_key());
        assert_eq!(a.oid_key(), b.oid_key());
    }

    #[test]
    fn role_matrix_matches_spec() {
        let master = KeySet::init_master();
        let write = master.derive(KeyRole::Write);
        assert!(write.allows(Capability::EncryptBlob));
        assert!(!write.allows(Capability::DecryptBlob));
        assert!(write.allows(Capability::WriteChannel));
        assert!(!write.allows(Capability::ReadChannel));
        assert!(!write.allows(Capability::AdminConfig));

        let log = master.derive(KeyRole::Log);
        assert!(log.allows(Capability::ReadChannel));
        assert!(!log.allows(Capability::WriteChannel));
        assert!(!log.allows(Capability::EncryptBlob));

        let config = master.derive(KeyRole::Config);
        assert!(config.allows(Capability::AdminConfig));
        assert!(!config.allows(Capability::DeriveOid));
    }

    #[test]
    fn config_role_has_zeroed_oid_key() {
        let master = KeySet::init_master();
        let config = master.derive(KeyRole::Config);
        assert_eq!(config.oid_key(), &[0u8; SUBKEY_LEN]);
    }

    #[test]
    fn channel_signature_round_trips() {
        let master = KeySet::init_master();
        let write = master.derive(KeyRole::Write);
        let full = master.derive(KeyRole::Full);

        let sig = write.sign_channel(b"channels/daily/123-abcd").unwrap();
        full.verify_channel(b"channels/daily/123-abcd", &sig).unwrap();
    }

    #[test]
    fn log_role_cannot_sign() {
        let master = KeySet::init_master();
        let log = master.derive(KeyRole::Log);
        assert!(log.sign_channel(b"anything").is_err());
    }

    #[test]
    fn key_file_round_trips_with_passphrase() {
        let master = KeySet::init_master();
        let full = master.derive(KeyRole::Full);
        let exported = full.export_key_file(Some("correct horse battery staple")).unwrap();
        let imported = KeySet::import_key_file(&exported, Some("correct horse battery staple")).unwrap();
        assert_eq!(imported.blob_key(), full.blob_key());
        assert_eq!(imported.role(), KeyRole::Full);
    }

    #[test]
    fn key_file_wrong_passphrase_fails() {
        let master = KeySet::init_master();
        let full = master.derive(KeyRole::Full);
        let exported = full.export_key_file(Some("right")).unwrap();
        assert!(KeySet::import_key_file(&exported, Some("wrong")).is_err());
    }

    #[test]
    fn key_file_raw_seal_round_trips() {
        let master = KeySet::init_master();
        let write = master.derive(KeyRole::Write);
        let exported = write.export_key_file(None).unwrap();
        let imported = KeySet::import_key_file(&exported, None).unwrap();
        assert_eq!(imported.blob_key(), write.blob_key());
    }
}
