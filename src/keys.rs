//! Key hierarchy.
//!
//! Every scope in the hierarchy gets a `CryptoManager`: four subkeys
//! derived from one input key via the KDF-from-key construction with
//! integer subkey ids and an 8-byte context string:
//!
//!   id 1  cipher key          AEAD key for this scope
//!   id 2  MAC key             BLAKE2b key for MACs
//!   id 3  asymmetric seed     Ed25519 keygen seed
//!   id 4  sub-derivation key  source for per-child subkeys
//!
//! The scope newtypes exist so a manager cannot be used outside its
//! scope; they add no behavior beyond what their context implies.
//! Managers are immutable once constructed and derived on demand, so
//! there is no long-lived subkey cache to invalidate.

use std::ops::Deref;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, CryptoMac, NONCE_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use crate::helpers;
use crate::CURRENT_VERSION;

// ---------------------------------------------------------------------------
// KDF contexts (8 bytes, space padded)
// ---------------------------------------------------------------------------

const CONTEXT_MAIN: &[u8; 8] = b"Main    ";
const CONTEXT_ACCOUNT: &[u8; 8] = b"Acct    ";
const CONTEXT_COLLECTION: &[u8; 8] = b"Col     ";
const CONTEXT_COLLECTION_ITEM: &[u8; 8] = b"ColItem ";
const CONTEXT_STORAGE: &[u8; 8] = b"Stor    ";

// ---------------------------------------------------------------------------
// Core manager
// ---------------------------------------------------------------------------

/// A bundle of four context-separated subkeys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoManager {
    #[zeroize(skip)]
    version: u8,
    cipher_key: [u8; SYMMETRIC_KEY_SIZE],
    mac_key: [u8; SYMMETRIC_KEY_SIZE],
    asym_key_seed: [u8; SYMMETRIC_KEY_SIZE],
    sub_derivation_key: [u8; SYMMETRIC_KEY_SIZE],
}

impl CryptoManager {
    fn new(key: &[u8; SYMMETRIC_KEY_SIZE], context: &[u8; 8], version: u8) -> Result<Self> {
        if version > CURRENT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            cipher_key: crypto::derive_subkey(key, 1, context),
            mac_key: crypto::derive_subkey(key, 2, context),
            asym_key_seed: crypto::derive_subkey(key, 3, context),
            sub_derivation_key: crypto::derive_subkey(key, 4, context),
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Attached AEAD encrypt: `nonce || ct || tag`.
    pub fn encrypt(&self, message: &[u8], additional_data: Option<&[u8]>) -> Result<Vec<u8>> {
        crypto::aead_encrypt(&self.cipher_key, message, additional_data)
    }

    /// Inverse of [`CryptoManager::encrypt`].
    pub fn decrypt(&self, nonce_and_ct: &[u8], additional_data: Option<&[u8]>) -> Result<Vec<u8>> {
        crypto::aead_decrypt(&self.cipher_key, nonce_and_ct, additional_data)
    }

    /// Detached AEAD encrypt: `(tag, nonce || ct)`.
    pub fn encrypt_detached(
        &self,
        message: &[u8],
        additional_data: Option<&[u8]>,
    ) -> Result<([u8; TAG_SIZE], Vec<u8>)> {
        crypto::aead_encrypt_detached(&self.cipher_key, message, additional_data)
    }

    /// Inverse of [`CryptoManager::encrypt_detached`].
    pub fn decrypt_detached(
        &self,
        nonce_and_ct: &[u8],
        tag: &[u8; TAG_SIZE],
        additional_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        crypto::aead_decrypt_detached(&self.cipher_key, nonce_and_ct, tag, additional_data)
    }

    /// Verify a detached ciphertext without keeping the plaintext.
    pub fn verify(
        &self,
        nonce_and_ct: &[u8],
        tag: &[u8; TAG_SIZE],
        additional_data: Option<&[u8]>,
    ) -> Result<()> {
        crypto::aead_verify_detached(&self.cipher_key, nonce_and_ct, tag, additional_data)
    }

    /// Deterministic encrypt: the nonce is the keyed hash of the message,
    /// so equal plaintexts under the same key produce equal ciphertexts.
    /// Only used for values that must be server-side comparable
    /// (collection-type UIDs).
    pub fn deterministic_encrypt(
        &self,
        message: &[u8],
        additional_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let digest = crypto::hash(Some(&self.mac_key), message);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        crypto::aead_encrypt_with_nonce(&self.cipher_key, &nonce, message, additional_data)
    }

    /// Inverse of [`CryptoManager::deterministic_encrypt`].
    pub fn deterministic_decrypt(
        &self,
        nonce_and_ct: &[u8],
        additional_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        crypto::aead_decrypt(&self.cipher_key, nonce_and_ct, additional_data)
    }

    /// Incremental MAC, keyed with this scope's MAC key by default.
    pub fn crypto_mac(&self, with_key: bool) -> CryptoMac {
        if with_key {
            CryptoMac::new(Some(&self.mac_key))
        } else {
            CryptoMac::new(None)
        }
    }

    /// Keyed one-shot hash under this scope's MAC key.
    pub fn calc_mac(&self, data: &[u8]) -> [u8; crypto::MAC_SIZE] {
        crypto::hash(Some(&self.mac_key), data)
    }

    /// Derive a per-child subkey: unkeyed BLAKE2b over
    /// `sub_derivation_key || salt`.
    pub fn derive_subkey(&self, salt: &[u8]) -> [u8; SYMMETRIC_KEY_SIZE] {
        let mut mac = CryptoMac::new(None);
        mac.update(&self.sub_derivation_key);
        mac.update(salt);
        mac.finalize()
    }

    fn asym_key_seed(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.asym_key_seed
    }
}

// ---------------------------------------------------------------------------
// Scope newtypes
// ---------------------------------------------------------------------------

/// Root of the hierarchy, keyed by the passphrase-derived main key.
#[derive(Clone)]
pub struct MainCryptoManager(CryptoManager);

impl MainCryptoManager {
    pub fn new(main_key: &[u8; SYMMETRIC_KEY_SIZE], version: u8) -> Result<Self> {
        Ok(Self(CryptoManager::new(main_key, CONTEXT_MAIN, version)?))
    }

    /// The login signing keypair, derived from the asymmetric seed.
    pub fn login_crypto_manager(&self) -> LoginCryptoManager {
        LoginCryptoManager::from_seed(self.0.asym_key_seed())
    }

    pub fn account_crypto_manager(
        &self,
        account_key: &[u8; SYMMETRIC_KEY_SIZE],
    ) -> Result<AccountCryptoManager> {
        AccountCryptoManager::new(account_key, self.0.version)
    }

    pub fn identity_crypto_manager(&self, privkey: &[u8; 32]) -> BoxCryptoManager {
        BoxCryptoManager::from_privkey(privkey)
    }
}

impl Deref for MainCryptoManager {
    type Target = CryptoManager;

    fn deref(&self) -> &CryptoManager {
        &self.0
    }
}

/// Account scope. Owns the deterministic collection-type encryption.
#[derive(Clone)]
pub struct AccountCryptoManager(CryptoManager);

impl AccountCryptoManager {
    pub fn new(account_key: &[u8; SYMMETRIC_KEY_SIZE], version: u8) -> Result<Self> {
        Ok(Self(CryptoManager::new(
            account_key,
            CONTEXT_ACCOUNT,
            version,
        )?))
    }

    /// Deterministic UID for a collection-type string. Equal inputs under
    /// the same account key always produce the same bytes, so the server
    /// can filter by type without learning it.
    pub fn col_type_to_uid(&self, col_type: &str) -> Result<Vec<u8>> {
        self.0
            .deterministic_encrypt(&helpers::pad_fixed(col_type.as_bytes()), None)
    }

    /// Recover the collection-type string from its deterministic UID.
    pub fn col_type_from_uid(&self, uid: &[u8]) -> Result<String> {
        let padded = self.0.deterministic_decrypt(uid, None)?;
        let raw = helpers::unpad_fixed(&padded)?;
        String::from_utf8(raw).map_err(|_| Error::integrity("collection type is not utf-8"))
    }
}

impl Deref for AccountCryptoManager {
    type Target = CryptoManager;

    fn deref(&self) -> &CryptoManager {
        &self.0
    }
}

/// Collection scope without account access. This is all a member who
/// received the collection key through an invitation needs.
#[derive(Clone)]
pub struct MinimalCollectionCryptoManager(CryptoManager);

impl MinimalCollectionCryptoManager {
    pub fn new(collection_key: &[u8; SYMMETRIC_KEY_SIZE], version: u8) -> Result<Self> {
        Ok(Self(CryptoManager::new(
            collection_key,
            CONTEXT_COLLECTION,
            version,
        )?))
    }
}

impl Deref for MinimalCollectionCryptoManager {
    type Target = CryptoManager;

    fn deref(&self) -> &CryptoManager {
        &self.0
    }
}

/// Full collection scope: additionally carries the account manager for
/// sharing operations (invitation creation re-wraps the collection key).
#[derive(Clone)]
pub struct CollectionCryptoManager {
    inner: MinimalCollectionCryptoManager,
    account: AccountCryptoManager,
}

impl CollectionCryptoManager {
    pub fn new(
        account: AccountCryptoManager,
        collection_key: &[u8; SYMMETRIC_KEY_SIZE],
        version: u8,
    ) -> Result<Self> {
        Ok(Self {
            inner: MinimalCollectionCryptoManager::new(collection_key, version)?,
            account,
        })
    }

    pub fn account_crypto_manager(&self) -> &AccountCryptoManager {
        &self.account
    }
}

impl Deref for CollectionCryptoManager {
    type Target = CryptoManager;

    fn deref(&self) -> &CryptoManager {
        &self.inner
    }
}

/// Item scope, derived per item from the parent collection.
#[derive(Clone)]
pub struct CollectionItemCryptoManager(CryptoManager);

impl CollectionItemCryptoManager {
    pub fn new(item_key: &[u8; SYMMETRIC_KEY_SIZE], version: u8) -> Result<Self> {
        Ok(Self(CryptoManager::new(
            item_key,
            CONTEXT_COLLECTION_ITEM,
            version,
        )?))
    }
}

impl Deref for CollectionItemCryptoManager {
    type Target = CryptoManager;

    fn deref(&self) -> &CryptoManager {
        &self.0
    }
}

/// Storage scope, used only to seal the persisted account session.
#[derive(Clone)]
pub struct StorageCryptoManager(CryptoManager);

impl StorageCryptoManager {
    pub fn new(key: &[u8; SYMMETRIC_KEY_SIZE], version: u8) -> Result<Self> {
        Ok(Self(CryptoManager::new(key, CONTEXT_STORAGE, version)?))
    }
}

impl Deref for StorageCryptoManager {
    type Target = CryptoManager;

    fn deref(&self) -> &CryptoManager {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Asymmetric managers
// ---------------------------------------------------------------------------

/// Ed25519 signing scope (login challenges).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LoginCryptoManager {
    privkey: [u8; 32],
    #[zeroize(skip)]
    pubkey: [u8; 32],
}

impl LoginCryptoManager {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let (pubkey, privkey) = crypto::sign_keypair_from_seed(seed);
        Self { privkey, pubkey }
    }

    pub fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }

    pub fn sign_detached(&self, message: &[u8]) -> [u8; crypto::SIGNATURE_SIZE] {
        crypto::sign_detached(&self.privkey, message)
    }

    pub fn verify_detached(
        pubkey: &[u8; 32],
        message: &[u8],
        signature: &[u8; crypto::SIGNATURE_SIZE],
    ) -> Result<()> {
        crypto::sign_verify_detached(pubkey, message, signature)
    }
}

/// X25519 box scope (identity keys, invitation sealing).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BoxCryptoManager {
    privkey: [u8; 32],
    #[zeroize(skip)]
    pubkey: [u8; 32],
}

impl BoxCryptoManager {
    /// Fresh random keypair, or a deterministic one from a seed.
    pub fn keygen(seed: Option<&[u8; 32]>) -> Self {
        let (pubkey, privkey) = match seed {
            Some(seed) => crypto::box_keypair_from_seed(seed),
            None => crypto::box_keypair(),
        };
        Self { privkey, pubkey }
    }

    pub fn from_privkey(privkey: &[u8; 32]) -> Self {
        let (pubkey, privkey) = crypto::box_keypair_from_seed(privkey);
        Self { privkey, pubkey }
    }

    pub fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }

    pub fn privkey(&self) -> &[u8; 32] {
        &self.privkey
    }

    /// Seal to `their_pubkey`, authenticated by this identity.
    /// `nonce[24]` prepended to the ciphertext.
    pub fn encrypt(&self, message: &[u8], their_pubkey: &[u8; 32]) -> Result<Vec<u8>> {
        crypto::box_encrypt(&self.privkey, their_pubkey, message)
    }

    /// Open a box sealed by `their_pubkey` for this identity.
    pub fn decrypt(&self, nonce_and_ct: &[u8], their_pubkey: &[u8; 32]) -> Result<Vec<u8>> {
        crypto::box_decrypt(&self.privkey, their_pubkey, nonce_and_ct)
    }
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Human-comparable rendering of a public key: BLAKE2b-256 of the key,
/// shown as 16 zero-padded 5-digit groups (big-endian 16-bit words), four
/// per line.
pub fn pretty_fingerprint(pubkey: &[u8]) -> String {
    let digest = crypto::hash(None, pubkey);
    let mut out = String::with_capacity(16 * 8);
    for (i, pair) in digest.chunks(2).enumerate() {
        let num = u16::from_be_bytes([pair[0], pair[1]]);
        out.push_str(&format!("{num:05}"));
        if i % 4 == 3 {
            if i != 15 {
                out.push('\n');
            }
        } else {
            out.push_str("   ");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [11u8; 32];

    #[test]
    fn manager_rejects_future_versions() {
        assert!(matches!(
            MainCryptoManager::new(&KEY, CURRENT_VERSION + 1),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn scopes_derive_distinct_cipher_keys() {
        let main = MainCryptoManager::new(&KEY, CURRENT_VERSION).unwrap();
        let account = AccountCryptoManager::new(&KEY, CURRENT_VERSION).unwrap();
        let ct = main.encrypt(b"scoped", None).unwrap();
        assert!(account.decrypt(&ct, None).is_err());
        assert_eq!(main.decrypt(&ct, None).unwrap(), b"scoped");
    }

    #[test]
    fn deterministic_encrypt_is_deterministic() {
        let a = AccountCryptoManager::new(&KEY, CURRENT_VERSION).unwrap();
        let b = AccountCryptoManager::new(&KEY, CURRENT_VERSION).unwrap();
        let uid_a = a.col_type_to_uid("calendar").unwrap();
        let uid_b = b.col_type_to_uid("calendar").unwrap();
        assert_eq!(uid_a, uid_b);
        assert_ne!(uid_a, a.col_type_to_uid("tasks").unwrap());

        let other_key = [12u8; 32];
        let other = AccountCryptoManager::new(&other_key, CURRENT_VERSION).unwrap();
        assert_ne!(uid_a, other.col_type_to_uid("calendar").unwrap());
    }

    #[test]
    fn col_type_roundtrips_through_uid() {
        let account = AccountCryptoManager::new(&KEY, CURRENT_VERSION).unwrap();
        let uid = account.col_type_to_uid("some.collection.type").unwrap();
        assert_eq!(account.col_type_from_uid(&uid).unwrap(), "some.collection.type");
    }

    #[test]
    fn subkey_derivation_depends_on_salt() {
        let manager = AccountCryptoManager::new(&KEY, CURRENT_VERSION).unwrap();
        let a = manager.derive_subkey(b"salt-a");
        let b = manager.derive_subkey(b"salt-b");
        assert_ne!(a, b);
        assert_eq!(a, manager.derive_subkey(b"salt-a"));
    }

    #[test]
    fn login_keypair_is_stable_for_a_main_key() {
        let main = MainCryptoManager::new(&KEY, CURRENT_VERSION).unwrap();
        let login1 = main.login_crypto_manager();
        let login2 = main.login_crypto_manager();
        assert_eq!(login1.pubkey(), login2.pubkey());

        let sig = login1.sign_detached(b"challenge");
        LoginCryptoManager::verify_detached(login2.pubkey(), b"challenge", &sig).unwrap();
    }

    #[test]
    fn box_manager_from_privkey_matches_keygen() {
        let manager = BoxCryptoManager::keygen(Some(&[5u8; 32]));
        let restored = BoxCryptoManager::from_privkey(manager.privkey());
        assert_eq!(manager.pubkey(), restored.pubkey());
    }

    #[test]
    fn fingerprint_layout() {
        let fp = pretty_fingerprint(&KEY);
        let lines: Vec<&str> = fp.split('\n').collect();
        assert_eq!(lines.len(), 4);
        for line in &lines {
            let groups: Vec<&str> = line.split("   ").collect();
            assert_eq!(groups.len(), 4);
            for group in groups {
                assert_eq!(group.len(), 5);
                assert!(group.chars().all(|c| c.is_ascii_digit()));
            }
        }
        assert_eq!(fp, pretty_fingerprint(&KEY));
        assert_ne!(fp, pretty_fingerprint(&[12u8; 32]));
    }
}
