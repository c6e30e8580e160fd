//! Encrypted entities and their wire shapes.
//!
//! `EncryptedRevision` is the cryptographic payload: metadata ciphertext,
//! deletion flag, and an ordered chunk list, all bound together by the
//! revision UID (the detached Poly1305 tag of the metadata under an AD
//! hash covering the rest). `EncryptedItem` and `EncryptedCollection`
//! wrap a revision with identity and key-wrapping state, and serialize
//! directly to the server-facing msgpack shapes.

use std::collections::HashMap;
use std::ops::Deref;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;

use crate::chunker;
use crate::crypto::{self, TAG_SIZE};
use crate::error::{Error, Result};
use crate::helpers::{self, from_base64, to_base64};
use crate::keys::{
    AccountCryptoManager, BoxCryptoManager, CollectionCryptoManager, CollectionItemCryptoManager,
    CryptoManager, MinimalCollectionCryptoManager,
};
use crate::CURRENT_VERSION;

/// Raw UID length; base64-encodes to 32 characters.
pub const UID_SIZE: usize = 24;

/// Marker trait for managers allowed to parent an item.
pub trait CollectionScope: Deref<Target = CryptoManager> {}

impl CollectionScope for MinimalCollectionCryptoManager {}
impl CollectionScope for CollectionCryptoManager {}

/// Generate a fresh entity UID (24 random bytes, base64).
pub(crate) fn random_uid() -> String {
    to_base64(&crypto::random_bytes(UID_SIZE))
}

// ---------------------------------------------------------------------------
// Access levels
// ---------------------------------------------------------------------------

/// Collection access level, integer-encoded on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessLevel {
    #[default]
    ReadOnly,
    Admin,
    ReadWrite,
}

impl AccessLevel {
    fn to_u8(self) -> u8 {
        match self {
            AccessLevel::ReadOnly => 0,
            AccessLevel::Admin => 1,
            AccessLevel::ReadWrite => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AccessLevel::ReadOnly),
            1 => Some(AccessLevel::Admin),
            2 => Some(AccessLevel::ReadWrite),
            _ => None,
        }
    }
}

impl Serialize for AccessLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_u8())
    }
}

impl<'de> Deserialize<'de> for AccessLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        AccessLevel::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid access level {value}")))
    }
}

// ---------------------------------------------------------------------------
// Item metadata
// ---------------------------------------------------------------------------

/// The known-optional metadata prelude. Callers with richer schemas pass
/// their own serde types through the generic meta accessors instead.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Modification time, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

// ---------------------------------------------------------------------------
// Encrypted revision
// ---------------------------------------------------------------------------

/// One chunk: `(mac, ciphertext?)`. The MAC is the keyed BLAKE2b-256 of
/// the plaintext chunk (base64) and doubles as the chunk's server-side
/// identity; the ciphertext is absent in prefetch-light listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord(pub String, pub Option<ByteBuf>);

/// The mutable cryptographic payload of an item.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRevision {
    uid: String,
    #[serde(with = "serde_bytes")]
    meta: Vec<u8>,
    deleted: bool,
    chunks: Vec<ChunkRecord>,
}

impl EncryptedRevision {
    /// Create a revision sealed over `meta` with an empty chunk list.
    pub(crate) fn create(
        crypto_manager: &CollectionItemCryptoManager,
        additional_data: &[u8],
        meta: &[u8],
    ) -> Result<Self> {
        let mut revision = Self {
            uid: String::new(),
            meta: Vec::new(),
            deleted: false,
            chunks: Vec::new(),
        };
        revision.set_meta(crypto_manager, additional_data, meta)?;
        Ok(revision)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub(crate) fn chunks_mut(&mut self) -> &mut Vec<ChunkRecord> {
        &mut self.chunks
    }

    pub(crate) fn is_missing_content(&self) -> bool {
        self.chunks.iter().any(|chunk| chunk.1.is_none())
    }

    /// The AD hash binds deletion state, entity identity, and the ordered
    /// chunk-MAC list into the metadata AEAD.
    fn calc_ad_hash(
        &self,
        crypto_manager: &CryptoManager,
        additional_data: &[u8],
    ) -> Result<[u8; crypto::MAC_SIZE]> {
        let mut mac = crypto_manager.crypto_mac(true);
        mac.update(&[u8::from(self.deleted)]);
        mac.update_with_len_prefix(additional_data);
        let mut chunks_hash = crypto::CryptoMac::new(None);
        for chunk in &self.chunks {
            chunks_hash.update(&from_base64(&chunk.0)?);
        }
        mac.update(&chunks_hash.finalize());
        Ok(mac.finalize())
    }

    fn tag(&self) -> Result<[u8; TAG_SIZE]> {
        from_base64(&self.uid)?
            .try_into()
            .map_err(|_| Error::integrity("revision uid is not a tag"))
    }

    /// Seal `meta` and rebind the revision UID to the current state.
    pub(crate) fn set_meta(
        &mut self,
        crypto_manager: &CollectionItemCryptoManager,
        additional_data: &[u8],
        meta: &[u8],
    ) -> Result<()> {
        let ad_hash = self.calc_ad_hash(crypto_manager, additional_data)?;
        let (tag, ct) =
            crypto_manager.encrypt_detached(&helpers::pad_meta(meta), Some(&ad_hash))?;
        self.uid = to_base64(&tag);
        self.meta = ct;
        Ok(())
    }

    /// Decrypt the metadata, gated by the MAC recomputation.
    pub(crate) fn meta(
        &self,
        crypto_manager: &CollectionItemCryptoManager,
        additional_data: &[u8],
    ) -> Result<Vec<u8>> {
        let ad_hash = self.calc_ad_hash(crypto_manager, additional_data)?;
        let padded = crypto_manager.decrypt_detached(&self.meta, &self.tag()?, Some(&ad_hash))?;
        helpers::unpad_meta(&padded)
    }

    /// Recompute the AD hash and verify the revision MAC.
    pub(crate) fn verify(
        &self,
        crypto_manager: &CollectionItemCryptoManager,
        additional_data: &[u8],
    ) -> Result<()> {
        let ad_hash = self.calc_ad_hash(crypto_manager, additional_data)?;
        crypto_manager.verify(&self.meta, &self.tag()?, Some(&ad_hash))
    }

    /// Chunk, MAC, shuffle, dedup, encrypt, and rebind.
    pub(crate) fn set_content(
        &mut self,
        crypto_manager: &CollectionItemCryptoManager,
        additional_data: &[u8],
        content: &[u8],
    ) -> Result<()> {
        let meta = self.meta(crypto_manager, additional_data)?;

        let mut chunks: Vec<(String, Vec<u8>)> = Vec::new();
        if !content.is_empty() {
            for (start, end) in chunker::chunkify(content) {
                let chunk = &content[start..end];
                chunks.push((to_base64(&crypto_manager.calc_mac(chunk)), chunk.to_vec()));
            }
        }

        // Hide split-point ordering before transport.
        let mut indices = helpers::shuffle(&mut chunks);
        let multi_chunk = indices.len() > 1;

        // Collapse duplicate MACs; dropped slots point at the survivor.
        let mut seen: HashMap<String, u32> = HashMap::new();
        let mut remap: Vec<u32> = Vec::with_capacity(chunks.len());
        let mut kept: Vec<(String, Vec<u8>)> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if let Some(survivor) = seen.get(&chunk.0) {
                remap.push(*survivor);
            } else {
                let pos = kept.len() as u32;
                seen.insert(chunk.0.clone(), pos);
                remap.push(pos);
                kept.push(chunk);
            }
        }
        for index in indices.iter_mut() {
            *index = remap[*index as usize];
        }
        let mut chunks = kept;

        // The trailing directory restores order without any server-side
        // ordering assumption.
        if multi_chunk {
            let buf = helpers::msgpack_encode(&indices)?;
            chunks.push((to_base64(&crypto_manager.calc_mac(&buf)), buf));
        }

        self.chunks = chunks
            .into_iter()
            .map(|(uid, blob)| {
                let ct = crypto_manager.encrypt(&helpers::pad_meta(&blob), None)?;
                Ok(ChunkRecord(uid, Some(ByteBuf::from(ct))))
            })
            .collect::<Result<Vec<_>>>()?;

        self.set_meta(crypto_manager, additional_data, &meta)
    }

    /// Decrypt and reassemble the content in original order.
    pub(crate) fn content(&self, crypto_manager: &CollectionItemCryptoManager) -> Result<Vec<u8>> {
        if self.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut decrypted = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            let ct = chunk
                .1
                .as_ref()
                .ok_or_else(|| Error::MissingContent(format!("chunk {}", chunk.0)))?;
            let padded = crypto_manager.decrypt(ct, None)?;
            let blob = helpers::unpad_meta(&padded)?;
            let mac = from_base64(&chunk.0)?;
            if !crypto::memcmp(&mac, &crypto_manager.calc_mac(&blob)) {
                return Err(Error::integrity("chunk mac mismatch"));
            }
            decrypted.push(blob);
        }

        if decrypted.len() == 1 {
            return Ok(decrypted.remove(0));
        }

        let directory = decrypted.pop().expect("len >= 2 checked above");
        let indices: Vec<u32> = helpers::msgpack_decode(&directory)?;
        let mut out = Vec::new();
        for index in indices {
            let chunk = decrypted
                .get(index as usize)
                .ok_or_else(|| Error::integrity("chunk directory index out of range"))?;
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    /// Replace the current state with a tombstone.
    pub(crate) fn delete(
        &mut self,
        crypto_manager: &CollectionItemCryptoManager,
        additional_data: &[u8],
        preserve_content: bool,
    ) -> Result<()> {
        let meta = self.meta(crypto_manager, additional_data)?;
        self.deleted = true;
        if !preserve_content {
            self.chunks.clear();
        }
        self.set_meta(crypto_manager, additional_data, &meta)
    }
}

// ---------------------------------------------------------------------------
// Encrypted item
// ---------------------------------------------------------------------------

/// An item: identity, optional wrapped key, and its current revision.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedItem {
    uid: String,
    version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption_key: Option<ByteBuf>,
    content: EncryptedRevision,
    /// Last persisted revision UID; `None` until first upload.
    etag: Option<String>,
}

impl EncryptedItem {
    pub(crate) fn create<P: CollectionScope>(parent: &P, meta: &[u8]) -> Result<Self> {
        let uid = random_uid();
        let version = CURRENT_VERSION;
        let item_key = parent.derive_subkey(uid.as_bytes());
        let crypto_manager = CollectionItemCryptoManager::new(&item_key, version)?;
        let content = EncryptedRevision::create(&crypto_manager, uid.as_bytes(), meta)?;
        Ok(Self {
            uid,
            version,
            encryption_key: None,
            content,
            etag: None,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// The current revision UID. Server-side etag of the next upload.
    pub fn etag(&self) -> &str {
        self.content.uid()
    }

    /// The etag of the last persisted revision, if any.
    pub fn last_etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.content.is_deleted()
    }

    pub fn is_missing_content(&self) -> bool {
        self.content.is_missing_content()
    }

    /// Whether the current revision differs from the last persisted one.
    pub fn is_locally_changed(&self) -> bool {
        self.etag.as_deref() != Some(self.content.uid())
    }

    pub(crate) fn mark_saved(&mut self) {
        self.etag = Some(self.content.uid().to_string());
    }

    /// The per-item manager: unwrap the dedicated key if one is present,
    /// otherwise derive from the parent salted by the item UID.
    pub(crate) fn crypto_manager<P: CollectionScope>(
        &self,
        parent: &P,
    ) -> Result<CollectionItemCryptoManager> {
        let item_key: [u8; 32] = match &self.encryption_key {
            Some(wrapped) => parent
                .decrypt(wrapped, None)?
                .try_into()
                .map_err(|_| Error::integrity("item key has wrong length"))?,
            None => parent.derive_subkey(self.uid.as_bytes()),
        };
        CollectionItemCryptoManager::new(&item_key, self.version)
    }

    pub(crate) fn revision(&self) -> &EncryptedRevision {
        &self.content
    }

    pub(crate) fn revision_mut(&mut self) -> &mut EncryptedRevision {
        &mut self.content
    }

    /// Swap in a revision fetched from the server (revision history).
    pub(crate) fn with_revision(&self, revision: EncryptedRevision) -> Self {
        let mut item = self.clone();
        item.etag = Some(revision.uid().to_string());
        item.content = revision;
        item
    }

    pub(crate) fn set_meta(
        &mut self,
        crypto_manager: &CollectionItemCryptoManager,
        meta: &[u8],
    ) -> Result<()> {
        let additional_data = self.uid.clone();
        self.content
            .set_meta(crypto_manager, additional_data.as_bytes(), meta)
    }

    pub(crate) fn meta(&self, crypto_manager: &CollectionItemCryptoManager) -> Result<Vec<u8>> {
        self.content.meta(crypto_manager, self.uid.as_bytes())
    }

    pub(crate) fn set_content(
        &mut self,
        crypto_manager: &CollectionItemCryptoManager,
        content: &[u8],
    ) -> Result<()> {
        let additional_data = self.uid.clone();
        self.content
            .set_content(crypto_manager, additional_data.as_bytes(), content)
    }

    pub(crate) fn content(&self, crypto_manager: &CollectionItemCryptoManager) -> Result<Vec<u8>> {
        self.verify(crypto_manager)?;
        self.content.content(crypto_manager)
    }

    pub(crate) fn delete(
        &mut self,
        crypto_manager: &CollectionItemCryptoManager,
        preserve_content: bool,
    ) -> Result<()> {
        let additional_data = self.uid.clone();
        self.content
            .delete(crypto_manager, additional_data.as_bytes(), preserve_content)
    }

    pub(crate) fn verify(&self, crypto_manager: &CollectionItemCryptoManager) -> Result<()> {
        self.content.verify(crypto_manager, self.uid.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Encrypted collection
// ---------------------------------------------------------------------------

/// A collection: a wrapped symmetric key, a deterministic type UID, and an
/// embedded item whose content is the collection's own metadata/content.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCollection {
    item: EncryptedItem,
    #[serde(default)]
    access_level: AccessLevel,
    #[serde(with = "serde_bytes")]
    collection_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection_type: Option<ByteBuf>,
    #[serde(default)]
    stoken: Option<String>,
}

impl EncryptedCollection {
    pub(crate) fn create(
        account: &AccountCryptoManager,
        collection_type: &str,
        meta: &[u8],
    ) -> Result<(Self, CollectionCryptoManager)> {
        let col_type_uid = account.col_type_to_uid(collection_type)?;
        let key = crypto::random_bytes_array::<32>();
        let collection_key = account.encrypt(&key, Some(&col_type_uid))?;
        let crypto_manager =
            CollectionCryptoManager::new(account.clone(), &key, CURRENT_VERSION)?;
        let item = EncryptedItem::create(&crypto_manager, meta)?;
        Ok((
            Self {
                item,
                access_level: AccessLevel::Admin,
                collection_key,
                collection_type: Some(ByteBuf::from(col_type_uid)),
                stoken: None,
            },
            crypto_manager,
        ))
    }

    pub fn uid(&self) -> &str {
        self.item.uid()
    }

    pub fn etag(&self) -> &str {
        self.item.etag()
    }

    pub fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    pub fn stoken(&self) -> Option<&str> {
        self.stoken.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.item.is_deleted()
    }

    pub(crate) fn item(&self) -> &EncryptedItem {
        &self.item
    }

    pub(crate) fn item_mut(&mut self) -> &mut EncryptedItem {
        &mut self.item
    }

    pub(crate) fn mark_saved(&mut self) {
        self.item.mark_saved();
    }

    fn col_type_uid(&self) -> Result<&[u8]> {
        self.collection_type
            .as_ref()
            .map(|b| b.as_slice())
            .ok_or_else(|| Error::programming("collection predates type UIDs and must be migrated"))
    }

    /// Unwrap the collection key. The type UID is the wrap's associated
    /// data, so a wrong type fails the unwrap.
    pub(crate) fn crypto_manager(
        &self,
        account: &AccountCryptoManager,
    ) -> Result<CollectionCryptoManager> {
        let key: [u8; 32] = account
            .decrypt(&self.collection_key, Some(self.col_type_uid()?))?
            .try_into()
            .map_err(|_| Error::integrity("collection key has wrong length"))?;
        CollectionCryptoManager::new(account.clone(), &key, self.item.version())
    }

    /// Decrypt the collection-type string.
    pub(crate) fn collection_type(&self, account: &AccountCryptoManager) -> Result<String> {
        account.col_type_from_uid(self.col_type_uid()?)
    }

    /// Build a signed invitation wrapping the raw collection key and type
    /// for `username`.
    pub(crate) fn create_invitation(
        &self,
        crypto_manager: &CollectionCryptoManager,
        identity: &BoxCryptoManager,
        username: &str,
        pubkey: &[u8; 32],
        access_level: AccessLevel,
    ) -> Result<SignedInvitation> {
        let account = crypto_manager.account_crypto_manager();
        let encryption_key = account.decrypt(&self.collection_key, Some(self.col_type_uid()?))?;
        let collection_type = self.collection_type(account)?;
        let content = InvitationContent {
            encryption_key: ByteBuf::from(encryption_key),
            collection_type,
        };
        let sealed = identity.encrypt(
            &helpers::pad_fixed(&helpers::msgpack_encode(&content)?),
            pubkey,
        )?;
        Ok(SignedInvitation {
            uid: to_base64(&crypto::random_bytes(32)),
            version: CURRENT_VERSION,
            username: username.to_string(),
            collection: self.uid().to_string(),
            access_level,
            signed_encryption_key: ByteBuf::from(sealed),
            from_username: None,
            from_pubkey: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Invitations
// ---------------------------------------------------------------------------

/// The sealed invitation payload.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InvitationContent {
    pub encryption_key: ByteBuf,
    pub collection_type: String,
}

/// A collection invitation: the collection key and type, sealed from the
/// sender's identity to the recipient's pubkey.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedInvitation {
    pub(crate) uid: String,
    pub(crate) version: u8,
    pub(crate) username: String,
    pub(crate) collection: String,
    pub(crate) access_level: AccessLevel,
    pub(crate) signed_encryption_key: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) from_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) from_pubkey: Option<ByteBuf>,
}

impl SignedInvitation {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn collection_uid(&self) -> &str {
        &self.collection
    }

    pub fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    pub fn from_username(&self) -> Option<&str> {
        self.from_username.as_deref()
    }

    /// The inviter's identity pubkey, needed both to open the box and to
    /// let the user verify the fingerprint out of band.
    pub fn from_pubkey(&self) -> Result<&[u8; 32]> {
        self.from_pubkey
            .as_ref()
            .and_then(|pk| <&[u8; 32]>::try_from(pk.as_slice()).ok())
            .ok_or_else(|| Error::programming("invitation carries no sender pubkey"))
    }

    /// Open the sealed payload with the recipient's identity key.
    pub(crate) fn decrypt_content(&self, identity: &BoxCryptoManager) -> Result<InvitationContent> {
        let padded = identity.decrypt(&self.signed_encryption_key, self.from_pubkey()?)?;
        helpers::msgpack_decode(&helpers::unpad_fixed(&padded)?)
    }
}
