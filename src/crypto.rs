//! Primitives façade.
//!
//! Uniform access to the cryptographic building blocks the rest of the
//! crate is written against:
//!
//!   AEAD      XChaCha20-Poly1305, 24-byte nonces, 16-byte tags,
//!             attached and detached forms
//!   Hashing   keyed/unkeyed BLAKE2b-256, incremental interface
//!   KDF       BLAKE2b KDF-from-key (subkey id + 8-byte context)
//!   pwhash    Argon2id v1.3
//!   Sign      Ed25519 detached signatures
//!   Box       X25519 + XSalsa20-Poly1305, nonce prepended on the wire
//!
//! Decrypt-path failures all collapse to [`Error::Integrity`] so callers
//! cannot distinguish tag, padding, and parse failures.

use blake2::digest::consts::U32;
use blake2::digest::{KeyInit, Mac};
use blake2::{Blake2b, Blake2bMac, Digest};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, AeadInPlace, Payload};
use chacha20poly1305::{KeyInit as AeadKeyInit, Tag, XChaCha20Poly1305, XNonce};
use rand_core::OsRng;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------------

/// Symmetric key length (AEAD, MAC, and derived subkeys).
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;

/// BLAKE2b digest / MAC length.
pub const MAC_SIZE: usize = 32;

/// Argon2id salt length consumed by [`pwhash`].
pub const PWHASH_SALT_SIZE: usize = 16;

/// KDF-from-key context length (space padded).
pub const KDF_CONTEXT_SIZE: usize = 8;

/// Ed25519 detached signature length.
pub const SIGNATURE_SIZE: usize = 64;

// Argon2id cost parameters: opslimit SENSITIVE, memlimit MODERATE
// (262144 KiB). Other language bindings use the same costs; changing
// them breaks login for existing accounts.
const PWHASH_OPSLIMIT: u32 = 4;
const PWHASH_MEMLIMIT_KIB: u32 = 262144;

// ---------------------------------------------------------------------------
// Randomness
// ---------------------------------------------------------------------------

/// Fill a fresh buffer with cryptographically strong random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).expect("OS random source unavailable");
    buf
}

/// Fixed-size variant of [`random_bytes`].
pub fn random_bytes_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).expect("OS random source unavailable");
    buf
}

/// Uniform random integer in `[0, upper)` via rejection sampling.
pub(crate) fn random_below(upper: u32) -> u32 {
    debug_assert!(upper > 0);
    let zone = (u32::MAX / upper) * upper;
    loop {
        let r = u32::from_le_bytes(random_bytes_array::<4>());
        if r < zone {
            return r % upper;
        }
    }
}

// ---------------------------------------------------------------------------
// AEAD (attached)
// ---------------------------------------------------------------------------

fn cipher(key: &[u8; SYMMETRIC_KEY_SIZE]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(GenericArray::from_slice(key))
}

/// Encrypt with a random nonce. Output layout: `nonce[24] || ct || tag[16]`.
pub fn aead_encrypt(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    message: &[u8],
    additional_data: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let nonce = random_bytes_array::<NONCE_SIZE>();
    aead_encrypt_with_nonce(key, &nonce, message, additional_data)
}

/// Encrypt under a caller-supplied nonce. Only the deterministic
/// collection-type path may pass a non-random nonce.
pub fn aead_encrypt_with_nonce(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    message: &[u8],
    additional_data: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let payload = Payload {
        msg: message,
        aad: additional_data.unwrap_or(&[]),
    };
    let ct = cipher(key)
        .encrypt(XNonce::from_slice(nonce), payload)
        .map_err(|_| Error::integrity("aead encrypt"))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt `nonce[24] || ct || tag[16]`.
pub fn aead_decrypt(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    nonce_and_ct: &[u8],
    additional_data: Option<&[u8]>,
) -> Result<Vec<u8>> {
    if nonce_and_ct.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::integrity("ciphertext too short"));
    }
    let (nonce, ct) = nonce_and_ct.split_at(NONCE_SIZE);
    let payload = Payload {
        msg: ct,
        aad: additional_data.unwrap_or(&[]),
    };
    cipher(key)
        .decrypt(XNonce::from_slice(nonce), payload)
        .map_err(|_| Error::integrity("aead decrypt"))
}

// ---------------------------------------------------------------------------
// AEAD (detached)
// ---------------------------------------------------------------------------

/// Detached encrypt. Returns `(tag[16], nonce[24] || ct)`; the tag is not
/// embedded in the ciphertext and doubles as the revision UID upstream.
pub fn aead_encrypt_detached(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    message: &[u8],
    additional_data: Option<&[u8]>,
) -> Result<([u8; TAG_SIZE], Vec<u8>)> {
    let nonce = random_bytes_array::<NONCE_SIZE>();
    let mut buf = message.to_vec();
    let tag = cipher(key)
        .encrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            additional_data.unwrap_or(&[]),
            &mut buf,
        )
        .map_err(|_| Error::integrity("aead encrypt"))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + buf.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&buf);
    Ok((tag.into(), out))
}

/// Detached decrypt of `nonce[24] || ct` under an external tag.
pub fn aead_decrypt_detached(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    nonce_and_ct: &[u8],
    tag: &[u8; TAG_SIZE],
    additional_data: Option<&[u8]>,
) -> Result<Vec<u8>> {
    if nonce_and_ct.len() < NONCE_SIZE {
        return Err(Error::integrity("ciphertext too short"));
    }
    let (nonce, ct) = nonce_and_ct.split_at(NONCE_SIZE);
    let mut buf = ct.to_vec();
    cipher(key)
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            additional_data.unwrap_or(&[]),
            &mut buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| Error::integrity("aead decrypt"))?;
    Ok(buf)
}

/// Detached verify: decrypt and discard the plaintext.
pub fn aead_verify_detached(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    nonce_and_ct: &[u8],
    tag: &[u8; TAG_SIZE],
    additional_data: Option<&[u8]>,
) -> Result<()> {
    let mut pt = aead_decrypt_detached(key, nonce_and_ct, tag, additional_data)?;
    pt.zeroize();
    Ok(())
}

// ---------------------------------------------------------------------------
// Hashing (incremental, keyed and unkeyed)
// ---------------------------------------------------------------------------

enum MacState {
    Keyed(Blake2bMac<U32>),
    Unkeyed(Blake2b<U32>),
}

/// Incremental BLAKE2b-256, keyed (MAC) or unkeyed (plain hash).
pub struct CryptoMac {
    state: MacState,
}

impl CryptoMac {
    pub fn new(key: Option<&[u8]>) -> Self {
        let state = match key {
            Some(key) => MacState::Keyed(
                <Blake2bMac<U32> as KeyInit>::new_from_slice(key)
                    .expect("BLAKE2b key length out of range"),
            ),
            None => MacState::Unkeyed(Blake2b::new()),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            MacState::Keyed(mac) => Mac::update(mac, data),
            MacState::Unkeyed(hash) => Digest::update(hash, data),
        }
    }

    /// Feed `data` preceded by its length as 4 little-endian bytes.
    pub fn update_with_len_prefix(&mut self, data: &[u8]) {
        self.update(&(data.len() as u32).to_le_bytes());
        self.update(data);
    }

    pub fn finalize(self) -> [u8; MAC_SIZE] {
        match self.state {
            MacState::Keyed(mac) => mac.finalize().into_bytes().into(),
            MacState::Unkeyed(hash) => hash.finalize().into(),
        }
    }
}

/// One-shot BLAKE2b-256. `key = None` for a plain hash.
pub fn hash(key: Option<&[u8]>, data: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = CryptoMac::new(key);
    mac.update(data);
    mac.finalize()
}

// ---------------------------------------------------------------------------
// KDF-from-key
// ---------------------------------------------------------------------------

/// Derive a 32-byte subkey from `(parent, subkey_id, context)`.
///
/// BLAKE2b-256 keyed with `parent`, salt = LE64(subkey_id) zero-extended
/// to 16 bytes, personal = `context` zero-extended to 16 bytes, empty
/// message. Bit-compatible with the libsodium KDF construction the other
/// language bindings use.
pub fn derive_subkey(
    parent: &[u8; SYMMETRIC_KEY_SIZE],
    subkey_id: u64,
    context: &[u8; KDF_CONTEXT_SIZE],
) -> [u8; SYMMETRIC_KEY_SIZE] {
    let mut salt = [0u8; 16];
    salt[..8].copy_from_slice(&subkey_id.to_le_bytes());
    let mut persona = [0u8; 16];
    persona[..KDF_CONTEXT_SIZE].copy_from_slice(context);

    let mac = Blake2bMac::<U32>::new_with_salt_and_personal(parent, &salt, &persona)
        .expect("BLAKE2b KDF parameters out of range");
    mac.finalize().into_bytes().into()
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Replaceable Argon2id backend for constrained platforms.
pub type DeriveKeyFn =
    dyn Fn(&[u8; PWHASH_SALT_SIZE], &[u8]) -> Result<[u8; SYMMETRIC_KEY_SIZE]> + Send + Sync;

static CUSTOM_PWHASH: std::sync::OnceLock<std::sync::Arc<DeriveKeyFn>> =
    std::sync::OnceLock::new();

/// Install a platform-native Argon2id implementation. Only honored for the
/// first caller; later calls are ignored (the process-wide backend must not
/// change once keys have been derived).
pub(crate) fn set_pwhash_backend(backend: std::sync::Arc<DeriveKeyFn>) {
    let _ = CUSTOM_PWHASH.set(backend);
}

/// Argon2id v1.3, opslimit 4, memlimit 262144 KiB, one lane, 32-byte output.
pub fn pwhash(password: &[u8], salt: &[u8; PWHASH_SALT_SIZE]) -> Result<[u8; SYMMETRIC_KEY_SIZE]> {
    if let Some(custom) = CUSTOM_PWHASH.get() {
        return custom(salt, password);
    }

    let params = argon2::Params::new(
        PWHASH_MEMLIMIT_KIB,
        PWHASH_OPSLIMIT,
        1,
        Some(SYMMETRIC_KEY_SIZE),
    )
    .map_err(|e| Error::Encoding(format!("argon2 params: {e}")))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut out = [0u8; SYMMETRIC_KEY_SIZE];
    argon
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| Error::Encoding(format!("argon2: {e}")))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Signatures (Ed25519)
// ---------------------------------------------------------------------------

/// Derive an Ed25519 keypair from a 32-byte seed. Returns `(pubkey, seed)`;
/// the seed doubles as the signing key.
pub fn sign_keypair_from_seed(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let signing = ed25519_dalek::SigningKey::from_bytes(seed);
    (signing.verifying_key().to_bytes(), *seed)
}

/// Ed25519 detached signature.
pub fn sign_detached(privkey: &[u8; 32], message: &[u8]) -> [u8; SIGNATURE_SIZE] {
    use ed25519_dalek::Signer;
    let signing = ed25519_dalek::SigningKey::from_bytes(privkey);
    signing.sign(message).to_bytes()
}

/// Verify an Ed25519 detached signature.
pub fn sign_verify_detached(
    pubkey: &[u8; 32],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<()> {
    use ed25519_dalek::Verifier;
    let vk = ed25519_dalek::VerifyingKey::from_bytes(pubkey)
        .map_err(|_| Error::integrity("bad signature pubkey"))?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    vk.verify(message, &sig)
        .map_err(|_| Error::integrity("signature verification failed"))
}

// ---------------------------------------------------------------------------
// Public-key boxes (X25519 + XSalsa20-Poly1305)
// ---------------------------------------------------------------------------

/// Generate an X25519 box keypair. Returns `(pubkey, privkey)`.
pub fn box_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = crypto_box::SecretKey::generate(&mut OsRng);
    (*secret.public_key().as_bytes(), secret.to_bytes())
}

/// Box keypair from a 32-byte seed (the seed is used as the clamped
/// X25519 secret).
pub fn box_keypair_from_seed(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let secret = crypto_box::SecretKey::from(*seed);
    (*secret.public_key().as_bytes(), secret.to_bytes())
}

/// Authenticated box from `privkey` to `pubkey`. Output layout:
/// `nonce[24] || ct || tag[16]`.
pub fn box_encrypt(
    privkey: &[u8; 32],
    their_pubkey: &[u8; 32],
    message: &[u8],
) -> Result<Vec<u8>> {
    let sk = crypto_box::SecretKey::from(*privkey);
    let pk = crypto_box::PublicKey::from(*their_pubkey);
    let salsa = crypto_box::SalsaBox::new(&pk, &sk);
    let nonce = random_bytes_array::<NONCE_SIZE>();
    let ct = salsa
        .encrypt(GenericArray::from_slice(&nonce), message)
        .map_err(|_| Error::integrity("box encrypt"))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open `nonce[24] || ct || tag[16]` from `their_pubkey`.
pub fn box_decrypt(
    privkey: &[u8; 32],
    their_pubkey: &[u8; 32],
    nonce_and_ct: &[u8],
) -> Result<Vec<u8>> {
    if nonce_and_ct.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::integrity("box ciphertext too short"));
    }
    let sk = crypto_box::SecretKey::from(*privkey);
    let pk = crypto_box::PublicKey::from(*their_pubkey);
    let salsa = crypto_box::SalsaBox::new(&pk, &sk);
    let (nonce, ct) = nonce_and_ct.split_at(NONCE_SIZE);
    salsa
        .decrypt(GenericArray::from_slice(nonce), ct)
        .map_err(|_| Error::integrity("box decrypt"))
}

// ---------------------------------------------------------------------------
// Constant-time helpers
// ---------------------------------------------------------------------------

/// Constant-time equality. Lengths are not secret; a length mismatch
/// returns false immediately.
pub fn memcmp(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Overwrite a buffer with zeros, resistant to dead-store elimination.
pub fn memzero(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn aead_attached_roundtrip() {
        let ct = aead_encrypt(&KEY, b"attached", Some(b"ad")).unwrap();
        assert_eq!(ct.len(), NONCE_SIZE + 8 + TAG_SIZE);
        let pt = aead_decrypt(&KEY, &ct, Some(b"ad")).unwrap();
        assert_eq!(pt, b"attached");
    }

    #[test]
    fn aead_wrong_ad_fails() {
        let ct = aead_encrypt(&KEY, b"data", Some(b"good")).unwrap();
        assert!(matches!(
            aead_decrypt(&KEY, &ct, Some(b"bad")),
            Err(Error::Integrity(_))
        ));
        assert!(matches!(
            aead_decrypt(&KEY, &ct, None),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn aead_detached_roundtrip() {
        let (tag, ct) = aead_encrypt_detached(&KEY, b"detached", Some(b"ad")).unwrap();
        assert_eq!(ct.len(), NONCE_SIZE + 8);
        let pt = aead_decrypt_detached(&KEY, &ct, &tag, Some(b"ad")).unwrap();
        assert_eq!(pt, b"detached");
        aead_verify_detached(&KEY, &ct, &tag, Some(b"ad")).unwrap();
    }

    #[test]
    fn aead_detached_tag_tamper_fails() {
        let (mut tag, ct) = aead_encrypt_detached(&KEY, b"detached", None).unwrap();
        tag[0] ^= 0x01;
        assert!(aead_verify_detached(&KEY, &ct, &tag, None).is_err());
    }

    #[test]
    fn kdf_subkeys_distinct_per_id_and_context() {
        let a = derive_subkey(&KEY, 1, b"Main    ");
        let b = derive_subkey(&KEY, 2, b"Main    ");
        let c = derive_subkey(&KEY, 1, b"Acct    ");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, derive_subkey(&KEY, 1, b"Main    "));
    }

    #[test]
    fn keyed_and_unkeyed_hash_differ() {
        let keyed = hash(Some(&KEY), b"data");
        let unkeyed = hash(None, b"data");
        assert_ne!(keyed, unkeyed);
    }

    #[test]
    fn len_prefix_distinguishes_boundaries() {
        // ("ab", "c") and ("a", "bc") must not collide
        let mut m1 = CryptoMac::new(Some(&KEY));
        m1.update_with_len_prefix(b"ab");
        m1.update_with_len_prefix(b"c");
        let mut m2 = CryptoMac::new(Some(&KEY));
        m2.update_with_len_prefix(b"a");
        m2.update_with_len_prefix(b"bc");
        assert_ne!(m1.finalize(), m2.finalize());
    }

    #[test]
    fn sign_roundtrip() {
        let seed = [3u8; 32];
        let (pubkey, privkey) = sign_keypair_from_seed(&seed);
        let sig = sign_detached(&privkey, b"message");
        sign_verify_detached(&pubkey, b"message", &sig).unwrap();
        assert!(sign_verify_detached(&pubkey, b"other", &sig).is_err());
    }

    #[test]
    fn box_roundtrip() {
        let (alice_pub, alice_priv) = box_keypair();
        let (bob_pub, bob_priv) = box_keypair();
        let ct = box_encrypt(&alice_priv, &bob_pub, b"to bob").unwrap();
        let pt = box_decrypt(&bob_priv, &alice_pub, &ct).unwrap();
        assert_eq!(pt, b"to bob");

        let (eve_pub, _) = box_keypair();
        assert!(box_decrypt(&bob_priv, &eve_pub, &ct).is_err());
    }

    #[test]
    fn memcmp_basics() {
        assert!(memcmp(b"same", b"same"));
        assert!(!memcmp(b"same", b"diff"));
        assert!(!memcmp(b"same", b"longer"));
    }

    #[test]
    fn random_below_is_in_range() {
        for _ in 0..100 {
            assert!(random_below(7) < 7);
        }
        assert_eq!(random_below(1), 0);
    }
}
