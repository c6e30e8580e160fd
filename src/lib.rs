//! # Rampart
//!
//! Client-side core of an end-to-end encrypted synchronization protocol.
//!
//! Users authenticate with a remote server, create hierarchical
//! *collections* of *items*, and push/pull encrypted revisions. The
//! server never sees plaintext content or metadata: all keys derive from
//! the user's passphrase, and sharing works by public-key wrapping of
//! collection keys.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rampart::{Account, Client, User, ItemMetadata};
//!
//! # async fn run() -> rampart::Result<()> {
//! let client = Client::new("https://sync.example.com")?;
//! let user = User { username: "alice".into(), email: "alice@example.com".into() };
//! let account = Account::signup(client, &user, "correct horse battery staple").await?;
//!
//! let collections = account.collection_manager();
//! let meta = ItemMetadata { name: Some("Calendar".into()), ..Default::default() };
//! let mut calendar = collections.create("example.calendar", &meta, b"")?;
//! collections.upload(&mut calendar, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! - **Server-blind**: metadata and content are AEAD-encrypted client-side
//! - **Tamper-evident**: a revision UID is the MAC binding its metadata,
//!   deletion state, entity identity, and ordered chunk list
//! - **Length-hiding**: padme padding plus chunk shuffling obscure sizes
//!   and split points
//! - **Shareable**: collection keys travel in signed, sealed invitations
//!
//! ## What's NOT Provided
//!
//! - Rekeying of existing ciphertexts
//! - Forward secrecy for leaked chunks
//! - Server-side conflict resolution
//! - Multi-device passphrase recovery

#![deny(unsafe_code)]

// ---------------------------------------------------------------------------
// Internal modules
// ---------------------------------------------------------------------------

mod account;
mod chunker;
mod crypto;
mod error;
mod fs_cache;
mod helpers;
mod keys;
mod managers;
mod models;
mod service;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub use account::Account;
pub use error::{Error, Result};
pub use fs_cache::FileSystemCache;
pub use keys::pretty_fingerprint;
pub use managers::{
    Collection, CollectionInvitationManager, CollectionListResult, CollectionManager,
    CollectionMemberManager, Item, ItemListResult, ItemManager, ItemRevisionsResult,
};
pub use models::{AccessLevel, ItemMetadata, SignedInvitation};
pub use service::{
    Client, CollectionMember, FetchOptions, IteratorListResponse, Prefetch, RemovedCollection,
    User, UserProfile,
};

/// Lower-level building blocks, exposed for bindings and power users.
pub mod primitives {
    pub use crate::chunker::{chunkify, Rollsum, MAX_CHUNK, MIN_CHUNK, SPLIT_MASK, WINDOW_SIZE};
    pub use crate::crypto::{
        derive_subkey, memcmp, memzero, pwhash, random_bytes, CryptoMac, DeriveKeyFn, MAC_SIZE,
        NONCE_SIZE, PWHASH_SALT_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE,
    };
    pub use crate::helpers::{
        from_base64, msgpack_decode, msgpack_encode, num_from_bytes, num_to_bytes, pad_fixed,
        pad_meta, padme_blocksize, shuffle, to_base64, unpad_fixed, unpad_meta,
    };
    pub use crate::keys::{
        AccountCryptoManager, BoxCryptoManager, CollectionCryptoManager,
        CollectionItemCryptoManager, CryptoManager, LoginCryptoManager, MainCryptoManager,
        MinimalCollectionCryptoManager, StorageCryptoManager,
    };
}

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

/// Current protocol version for accounts, collections, items, and
/// invitations.
pub const CURRENT_VERSION: u8 = 1;

static INIT: tokio::sync::OnceCell<()> = tokio::sync::OnceCell::const_new();

/// One-time process-wide initialization. All public entry points await
/// this; calling it again is a no-op.
pub async fn init() {
    INIT.get_or_init(|| async {
        // sanity-check the OS random source before any key is derived
        let probe = crypto::random_bytes(16);
        debug_assert_ne!(probe, vec![0u8; 16]);
    })
    .await;
}

/// [`init`] plus a platform-native Argon2id backend for constrained
/// targets. The backend sticks for the lifetime of the process.
pub async fn init_with_key_derivation(backend: std::sync::Arc<crypto::DeriveKeyFn>) {
    crypto::set_pwhash_backend(backend);
    init().await;
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn init_is_idempotent() {
        super::init().await;
        super::init().await;
    }
}
