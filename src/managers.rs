//! Upward API: the decrypted views and managers the sync layer drives.
//!
//! `Collection` and `Item` pair an encrypted entity with its derived
//! crypto manager so callers work in plaintext terms. The managers own
//! the create/fetch/list/upload flows and the local cache blobs. Server
//! batch/transaction calls for a single entity must be serialized by the
//! caller; nothing here queues.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::account::Account;
use crate::error::{Error, Result};
use crate::helpers::{msgpack_decode, msgpack_encode};
use crate::keys::{pretty_fingerprint, CollectionCryptoManager, CollectionItemCryptoManager};
use crate::models::{
    AccessLevel, EncryptedCollection, EncryptedItem, ItemMetadata, SignedInvitation,
};
use crate::service::{
    CollectionManagerOnline, CollectionMember, FetchOptions, InvitationManagerOnline,
    ItemDep, ItemManagerOnline, IteratorListResponse, MemberManagerOnline, RemovedCollection,
    UserProfile,
};

/// Local cache blob version.
const CACHE_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Decrypted views
// ---------------------------------------------------------------------------

/// A collection plus its unwrapped crypto manager.
pub struct Collection {
    crypto_manager: CollectionCryptoManager,
    encrypted: EncryptedCollection,
}

impl Collection {
    fn new(crypto_manager: CollectionCryptoManager, encrypted: EncryptedCollection) -> Self {
        Self {
            crypto_manager,
            encrypted,
        }
    }

    fn item_crypto_manager(&self) -> Result<CollectionItemCryptoManager> {
        self.encrypted.item().crypto_manager(&self.crypto_manager)
    }

    pub fn uid(&self) -> &str {
        self.encrypted.uid()
    }

    pub fn etag(&self) -> &str {
        self.encrypted.etag()
    }

    pub fn stoken(&self) -> Option<&str> {
        self.encrypted.stoken()
    }

    pub fn access_level(&self) -> AccessLevel {
        self.encrypted.access_level()
    }

    pub fn is_deleted(&self) -> bool {
        self.encrypted.is_deleted()
    }

    /// Whether this collection has ever been uploaded.
    pub fn is_new(&self) -> bool {
        self.encrypted.item().last_etag().is_none()
    }

    pub fn collection_type(&self) -> Result<String> {
        self.encrypted
            .collection_type(self.crypto_manager.account_crypto_manager())
    }

    /// Recompute and check the revision MAC.
    pub fn verify(&self) -> Result<()> {
        self.encrypted.item().verify(&self.item_crypto_manager()?)
    }

    pub fn meta<T: DeserializeOwned>(&self) -> Result<T> {
        msgpack_decode(&self.meta_raw()?)
    }

    pub fn meta_raw(&self) -> Result<Vec<u8>> {
        self.verify()?;
        self.encrypted.item().meta(&self.item_crypto_manager()?)
    }

    pub fn set_meta<T: Serialize>(&mut self, meta: &T) -> Result<()> {
        self.set_meta_raw(&msgpack_encode(meta)?)
    }

    pub fn set_meta_raw(&mut self, meta: &[u8]) -> Result<()> {
        let crypto_manager = self.item_crypto_manager()?;
        self.encrypted.item_mut().set_meta(&crypto_manager, meta)
    }

    pub fn content(&self) -> Result<Vec<u8>> {
        self.verify()?;
        self.encrypted.item().content(&self.item_crypto_manager()?)
    }

    pub fn set_content(&mut self, content: &[u8]) -> Result<()> {
        let crypto_manager = self.item_crypto_manager()?;
        self.encrypted
            .item_mut()
            .set_content(&crypto_manager, content)
    }

    pub fn delete(&mut self, preserve_content: bool) -> Result<()> {
        let crypto_manager = self.item_crypto_manager()?;
        self.encrypted
            .item_mut()
            .delete(&crypto_manager, preserve_content)
    }

    /// A read-only view of the embedded item.
    pub fn item(&self) -> Result<Item> {
        Ok(Item {
            crypto_manager: self.item_crypto_manager()?,
            encrypted: self.encrypted.item().clone(),
        })
    }

    pub(crate) fn encrypted(&self) -> &EncryptedCollection {
        &self.encrypted
    }

    pub(crate) fn crypto_manager(&self) -> &CollectionCryptoManager {
        &self.crypto_manager
    }

    pub(crate) fn mark_saved(&mut self) {
        self.encrypted.mark_saved();
    }
}

/// An item plus its derived crypto manager.
#[derive(Clone)]
pub struct Item {
    crypto_manager: CollectionItemCryptoManager,
    encrypted: EncryptedItem,
}

impl Item {
    pub fn uid(&self) -> &str {
        self.encrypted.uid()
    }

    pub fn etag(&self) -> &str {
        self.encrypted.etag()
    }

    pub fn is_deleted(&self) -> bool {
        self.encrypted.is_deleted()
    }

    pub fn is_missing_content(&self) -> bool {
        self.encrypted.is_missing_content()
    }

    pub fn is_locally_changed(&self) -> bool {
        self.encrypted.is_locally_changed()
    }

    pub fn verify(&self) -> Result<()> {
        self.encrypted.verify(&self.crypto_manager)
    }

    pub fn meta<T: DeserializeOwned>(&self) -> Result<T> {
        msgpack_decode(&self.meta_raw()?)
    }

    /// Typed convenience for the common metadata prelude.
    pub fn item_meta(&self) -> Result<ItemMetadata> {
        self.meta()
    }

    pub fn meta_raw(&self) -> Result<Vec<u8>> {
        self.encrypted.meta(&self.crypto_manager)
    }

    pub fn set_meta<T: Serialize>(&mut self, meta: &T) -> Result<()> {
        self.set_meta_raw(&msgpack_encode(meta)?)
    }

    pub fn set_meta_raw(&mut self, meta: &[u8]) -> Result<()> {
        self.encrypted.set_meta(&self.crypto_manager, meta)
    }

    pub fn content(&self) -> Result<Vec<u8>> {
        self.encrypted.content(&self.crypto_manager)
    }

    pub fn set_content(&mut self, content: &[u8]) -> Result<()> {
        self.encrypted.set_content(&self.crypto_manager, content)
    }

    pub fn delete(&mut self, preserve_content: bool) -> Result<()> {
        self.encrypted.delete(&self.crypto_manager, preserve_content)
    }

    pub(crate) fn encrypted(&self) -> &EncryptedItem {
        &self.encrypted
    }

    pub(crate) fn mark_saved(&mut self) {
        self.encrypted.mark_saved();
    }
}

// ---------------------------------------------------------------------------
// List results
// ---------------------------------------------------------------------------

pub struct CollectionListResult {
    pub data: Vec<Collection>,
    pub stoken: Option<String>,
    pub done: bool,
    pub removed_memberships: Vec<RemovedCollection>,
}

pub struct ItemListResult {
    pub data: Vec<Item>,
    pub stoken: Option<String>,
    pub done: bool,
}

pub struct ItemRevisionsResult {
    pub data: Vec<Item>,
    pub iterator: Option<String>,
    pub done: bool,
}

// ---------------------------------------------------------------------------
// Collection manager
// ---------------------------------------------------------------------------

pub struct CollectionManager<'a> {
    account: &'a Account,
}

impl<'a> CollectionManager<'a> {
    pub(crate) fn new(account: &'a Account) -> Self {
        Self { account }
    }

    fn online(&self) -> CollectionManagerOnline<'_> {
        CollectionManagerOnline::new(self.account.client())
    }

    /// Create a collection locally. Nothing hits the server until
    /// [`CollectionManager::upload`].
    pub fn create<T: Serialize>(
        &self,
        collection_type: &str,
        meta: &T,
        content: &[u8],
    ) -> Result<Collection> {
        self.create_raw(collection_type, &msgpack_encode(meta)?, content)
    }

    pub fn create_raw(
        &self,
        collection_type: &str,
        meta: &[u8],
        content: &[u8],
    ) -> Result<Collection> {
        let account_crypto_manager = self.account.account_crypto_manager()?;
        let (encrypted, crypto_manager) =
            EncryptedCollection::create(&account_crypto_manager, collection_type, meta)?;
        let mut collection = Collection::new(crypto_manager, encrypted);
        collection.set_content(content)?;
        Ok(collection)
    }

    pub async fn fetch(&self, col_uid: &str, options: Option<&FetchOptions>) -> Result<Collection> {
        let encrypted = self.online().fetch(col_uid, options).await?;
        let crypto_manager = encrypted.crypto_manager(&self.account.account_crypto_manager()?)?;
        Ok(Collection::new(crypto_manager, encrypted))
    }

    /// List collections of the given types.
    pub async fn list(
        &self,
        collection_types: &[&str],
        options: Option<&FetchOptions>,
    ) -> Result<CollectionListResult> {
        let account_crypto_manager = self.account.account_crypto_manager()?;
        let type_uids = collection_types
            .iter()
            .map(|name| account_crypto_manager.col_type_to_uid(name))
            .collect::<Result<Vec<_>>>()?;
        let type_refs: Vec<&[u8]> = type_uids.iter().map(Vec::as_slice).collect();
        let response = self.online().list(&type_refs, options).await?;

        let mut data = Vec::with_capacity(response.data.len());
        for encrypted in response.data {
            let crypto_manager = encrypted.crypto_manager(&account_crypto_manager)?;
            data.push(Collection::new(crypto_manager, encrypted));
        }
        Ok(CollectionListResult {
            data,
            stoken: response.stoken,
            done: response.done,
            removed_memberships: response.removed_memberships.unwrap_or_default(),
        })
    }

    /// Upload as a plain batch: no freshness assertions beyond etags.
    pub async fn upload(
        &self,
        collection: &mut Collection,
        options: Option<&FetchOptions>,
    ) -> Result<()> {
        if collection.is_new() {
            self.online().create(collection.encrypted(), options).await?;
        } else {
            let item_refs = [collection.encrypted().item()];
            ItemManagerOnline::new(self.account.client(), collection.uid())
                .batch(&item_refs, None, options)
                .await?;
        }
        collection.mark_saved();
        debug!(uid = collection.uid(), "collection uploaded");
        Ok(())
    }

    /// Upload as a transaction: the collection stoken must still be
    /// current or the server aborts with a conflict.
    pub async fn transaction(
        &self,
        collection: &mut Collection,
        options: Option<&FetchOptions>,
    ) -> Result<()> {
        let mut effective = options.cloned().unwrap_or_default();
        if effective.stoken.is_none() {
            effective.stoken = collection.stoken().map(str::to_string);
        }
        if collection.is_new() {
            self.online()
                .create(collection.encrypted(), Some(&effective))
                .await?;
        } else {
            let item_refs = [collection.encrypted().item()];
            ItemManagerOnline::new(self.account.client(), collection.uid())
                .transaction(&item_refs, None, Some(&effective))
                .await?;
        }
        collection.mark_saved();
        Ok(())
    }

    /// Serialize for the local cache. `with_content = false` drops chunk
    /// ciphertexts to save space. The blob is not additionally encrypted.
    pub fn cache_save(&self, collection: &Collection, with_content: bool) -> Result<Vec<u8>> {
        let mut encrypted = collection.encrypted().clone();
        if !with_content {
            for chunk in encrypted.item_mut().revision_mut().chunks_mut() {
                chunk.1 = None;
            }
        }
        msgpack_encode(&(CACHE_VERSION, encrypted))
    }

    pub fn cache_load(&self, cached: &[u8]) -> Result<Collection> {
        let (version, encrypted): (u8, EncryptedCollection) = msgpack_decode(cached)?;
        if version > CACHE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let crypto_manager = encrypted.crypto_manager(&self.account.account_crypto_manager()?)?;
        Ok(Collection::new(crypto_manager, encrypted))
    }

    pub fn item_manager(&self, collection: &Collection) -> Result<ItemManager<'a>> {
        Ok(ItemManager {
            account: self.account,
            collection_uid: collection.uid().to_string(),
            collection_crypto_manager: collection.crypto_manager().clone(),
        })
    }

    pub fn member_manager(&self, collection: &Collection) -> CollectionMemberManager<'a> {
        CollectionMemberManager {
            account: self.account,
            collection_uid: collection.uid().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Item manager
// ---------------------------------------------------------------------------

pub struct ItemManager<'a> {
    account: &'a Account,
    collection_uid: String,
    collection_crypto_manager: CollectionCryptoManager,
}

impl<'a> ItemManager<'a> {
    fn online(&self) -> ItemManagerOnline<'_> {
        ItemManagerOnline::new(self.account.client(), &self.collection_uid)
    }

    fn decrypt_item(&self, encrypted: EncryptedItem) -> Result<Item> {
        let crypto_manager = encrypted.crypto_manager(&self.collection_crypto_manager)?;
        Ok(Item {
            crypto_manager,
            encrypted,
        })
    }

    pub fn create<T: Serialize>(&self, meta: &T, content: &[u8]) -> Result<Item> {
        self.create_raw(&msgpack_encode(meta)?, content)
    }

    pub fn create_raw(&self, meta: &[u8], content: &[u8]) -> Result<Item> {
        let encrypted = EncryptedItem::create(&self.collection_crypto_manager, meta)?;
        let mut item = self.decrypt_item(encrypted)?;
        item.set_content(content)?;
        Ok(item)
    }

    pub async fn fetch(&self, item_uid: &str, options: Option<&FetchOptions>) -> Result<Item> {
        let encrypted = self.online().fetch(item_uid, options).await?;
        self.decrypt_item(encrypted)
    }

    pub async fn list(&self, options: Option<&FetchOptions>) -> Result<ItemListResult> {
        let response = self.online().list(options).await?;
        let data = response
            .data
            .into_iter()
            .map(|encrypted| self.decrypt_item(encrypted))
            .collect::<Result<Vec<_>>>()?;
        Ok(ItemListResult {
            data,
            stoken: response.stoken,
            done: response.done,
        })
    }

    /// Which of these items changed server-side since their etags?
    pub async fn fetch_updates(
        &self,
        items: &[&Item],
        options: Option<&FetchOptions>,
    ) -> Result<ItemListResult> {
        let deps: Vec<ItemDep<'_>> = items
            .iter()
            .map(|item| ItemDep {
                uid: item.uid(),
                etag: item.encrypted().last_etag(),
            })
            .collect();
        let response = self.online().fetch_updates(&deps, options).await?;
        let data = response
            .data
            .into_iter()
            .map(|encrypted| self.decrypt_item(encrypted))
            .collect::<Result<Vec<_>>>()?;
        Ok(ItemListResult {
            data,
            stoken: response.stoken,
            done: response.done,
        })
    }

    /// Fetch specific items regardless of local state.
    pub async fn fetch_multi(
        &self,
        item_uids: &[&str],
        options: Option<&FetchOptions>,
    ) -> Result<ItemListResult> {
        let deps: Vec<ItemDep<'_>> = item_uids
            .iter()
            .map(|uid| ItemDep { uid, etag: None })
            .collect();
        let response = self.online().fetch_updates(&deps, options).await?;
        let data = response
            .data
            .into_iter()
            .map(|encrypted| self.decrypt_item(encrypted))
            .collect::<Result<Vec<_>>>()?;
        Ok(ItemListResult {
            data,
            stoken: response.stoken,
            done: response.done,
        })
    }

    /// Upload items; etag conflicts abort the whole call.
    pub async fn batch(
        &self,
        items: &mut [&mut Item],
        deps: Option<&[&Item]>,
        options: Option<&FetchOptions>,
    ) -> Result<()> {
        self.upload_inner(items, deps, options, false).await
    }

    /// Like batch, but the server additionally asserts that `deps` and all
    /// items are still at their stated etags at commit time.
    pub async fn transaction(
        &self,
        items: &mut [&mut Item],
        deps: Option<&[&Item]>,
        options: Option<&FetchOptions>,
    ) -> Result<()> {
        self.upload_inner(items, deps, options, true).await
    }

    async fn upload_inner(
        &self,
        items: &mut [&mut Item],
        deps: Option<&[&Item]>,
        options: Option<&FetchOptions>,
        is_transaction: bool,
    ) -> Result<()> {
        for item in items.iter() {
            self.assert_same_collection(item)?;
        }
        let dep_list: Option<Vec<ItemDep<'_>>> = deps.map(|deps| {
            deps.iter()
                .map(|item| ItemDep {
                    uid: item.uid(),
                    etag: item.encrypted().last_etag(),
                })
                .collect()
        });
        {
            let encrypted: Vec<&EncryptedItem> =
                items.iter().map(|item| item.encrypted()).collect();
            let online = self.online();
            if is_transaction {
                online
                    .transaction(&encrypted, dep_list.as_deref(), options)
                    .await?;
            } else {
                online.batch(&encrypted, dep_list.as_deref(), options).await?;
            }
        }
        for item in items.iter_mut() {
            item.mark_saved();
        }
        debug!(collection = %self.collection_uid, "items uploaded");
        Ok(())
    }

    /// Guard against feeding another collection's items to this manager.
    fn assert_same_collection(&self, item: &Item) -> Result<()> {
        // an item whose key neither unwraps nor derives under this
        // collection cannot produce a valid MAC
        let check = item
            .encrypted()
            .crypto_manager(&self.collection_crypto_manager)
            .and_then(|crypto_manager| item.encrypted().verify(&crypto_manager));
        check.map_err(|_| {
            Error::programming(format!(
                "item {} does not belong to collection {}",
                item.uid(),
                self.collection_uid
            ))
        })
    }

    /// Push chunk ciphertexts out of band. A server-side duplicate counts
    /// as success.
    pub async fn upload_content(&self, item: &Item) -> Result<()> {
        let online = self.online();
        for chunk in item.encrypted().revision().chunks() {
            if let Some(blob) = &chunk.1 {
                online.chunk_upload(item.uid(), &chunk.0, blob).await?;
            }
        }
        Ok(())
    }

    /// Fill in chunk ciphertexts missing from a prefetch-light listing.
    pub async fn download_content(&self, item: &mut Item) -> Result<()> {
        let online = self.online();
        let uid = item.uid().to_string();
        for chunk in item.encrypted.revision_mut().chunks_mut() {
            if chunk.1.is_none() {
                let blob = online.chunk_download(&uid, &chunk.0).await?;
                chunk.1 = Some(serde_bytes::ByteBuf::from(blob));
            }
        }
        Ok(())
    }

    /// Revision history, newest first, paginated by revision UID.
    pub async fn item_revisions(
        &self,
        item: &Item,
        options: Option<&FetchOptions>,
    ) -> Result<ItemRevisionsResult> {
        let response: IteratorListResponse<_> =
            self.online().item_revisions(item.uid(), options).await?;
        let data = response
            .data
            .into_iter()
            .map(|revision| Item {
                crypto_manager: item.crypto_manager.clone(),
                encrypted: item.encrypted().with_revision(revision),
            })
            .collect();
        Ok(ItemRevisionsResult {
            data,
            iterator: response.iterator,
            done: response.done,
        })
    }

    pub fn cache_save(&self, item: &Item, with_content: bool) -> Result<Vec<u8>> {
        let mut encrypted = item.encrypted().clone();
        if !with_content {
            for chunk in encrypted.revision_mut().chunks_mut() {
                chunk.1 = None;
            }
        }
        msgpack_encode(&(CACHE_VERSION, encrypted))
    }

    pub fn cache_load(&self, cached: &[u8]) -> Result<Item> {
        let (version, encrypted): (u8, EncryptedItem) = msgpack_decode(cached)?;
        if version > CACHE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        self.decrypt_item(encrypted)
    }
}

// ---------------------------------------------------------------------------
// Invitation manager
// ---------------------------------------------------------------------------

pub struct CollectionInvitationManager<'a> {
    account: &'a Account,
}

impl<'a> CollectionInvitationManager<'a> {
    pub(crate) fn new(account: &'a Account) -> Self {
        Self { account }
    }

    fn online(&self) -> InvitationManagerOnline<'_> {
        InvitationManagerOnline::new(self.account.client())
    }

    pub async fn list_incoming(
        &self,
        options: Option<&FetchOptions>,
    ) -> Result<IteratorListResponse<SignedInvitation>> {
        self.online().list_incoming(options).await
    }

    pub async fn list_outgoing(
        &self,
        options: Option<&FetchOptions>,
    ) -> Result<IteratorListResponse<SignedInvitation>> {
        self.online().list_outgoing(options).await
    }

    /// Accept: unseal the collection key, re-wrap it under our own
    /// account key, and hand the new wrapping to the server.
    pub async fn accept(&self, invitation: &SignedInvitation) -> Result<()> {
        let identity = self.account.identity_crypto_manager()?;
        let content = invitation.decrypt_content(&identity)?;
        let account_crypto_manager = self.account.account_crypto_manager()?;
        let col_type_uid = account_crypto_manager.col_type_to_uid(&content.collection_type)?;
        let encryption_key =
            account_crypto_manager.encrypt(&content.encryption_key, Some(&col_type_uid))?;
        self.online()
            .accept(invitation, &col_type_uid, &encryption_key)
            .await
    }

    pub async fn reject(&self, invitation: &SignedInvitation) -> Result<()> {
        self.online().reject(invitation).await
    }

    pub async fn disinvite(&self, invitation: &SignedInvitation) -> Result<()> {
        self.online().disinvite(invitation).await
    }

    pub async fn fetch_user_profile(&self, username: &str) -> Result<UserProfile> {
        self.online().fetch_user_profile(username).await
    }

    /// Invite `username` to a collection. The caller is expected to have
    /// verified `pubkey` against the recipient's fingerprint out of band.
    pub async fn invite(
        &self,
        collection: &Collection,
        username: &str,
        pubkey: &[u8; 32],
        access_level: AccessLevel,
    ) -> Result<()> {
        let identity = self.account.identity_crypto_manager()?;
        let invitation = collection.encrypted().create_invitation(
            collection.crypto_manager(),
            &identity,
            username,
            pubkey,
            access_level,
        )?;
        self.online().invite(&invitation).await
    }

    /// Fingerprint for out-of-band identity verification.
    pub fn pretty_fingerprint(&self, pubkey: &[u8]) -> String {
        pretty_fingerprint(pubkey)
    }
}

// ---------------------------------------------------------------------------
// Member manager
// ---------------------------------------------------------------------------

pub struct CollectionMemberManager<'a> {
    account: &'a Account,
    collection_uid: String,
}

impl<'a> CollectionMemberManager<'a> {
    fn online(&self) -> MemberManagerOnline<'_> {
        MemberManagerOnline::new(self.account.client(), &self.collection_uid)
    }

    pub async fn list(
        &self,
        options: Option<&FetchOptions>,
    ) -> Result<IteratorListResponse<CollectionMember>> {
        self.online().list(options).await
    }

    pub async fn remove(&self, username: &str) -> Result<()> {
        self.online().remove(username).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.online().leave().await
    }

    pub async fn modify_access_level(
        &self,
        username: &str,
        access_level: AccessLevel,
    ) -> Result<()> {
        self.online().modify_access_level(username, access_level).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::AccountCryptoManager;
    use crate::CURRENT_VERSION;

    fn collection_pair() -> (Collection, AccountCryptoManager) {
        let account_cm = AccountCryptoManager::new(&[1u8; 32], CURRENT_VERSION).unwrap();
        let (encrypted, crypto_manager) =
            EncryptedCollection::create(&account_cm, "test.collection", b"\x81\xa4name\xa3cal")
                .unwrap();
        (Collection::new(crypto_manager, encrypted), account_cm)
    }

    #[test]
    fn collection_meta_and_content_roundtrip() {
        let (mut collection, _) = collection_pair();
        collection
            .set_meta(&ItemMetadata {
                name: Some("Calendar".into()),
                description: Some("Mine".into()),
                color: Some("#ffffff".into()),
                ..Default::default()
            })
            .unwrap();
        collection.set_content(&[1, 2, 3, 5]).unwrap();

        let meta: ItemMetadata = collection.meta().unwrap();
        assert_eq!(meta.name.as_deref(), Some("Calendar"));
        assert_eq!(meta.color.as_deref(), Some("#ffffff"));
        assert_eq!(collection.content().unwrap(), vec![1, 2, 3, 5]);
        assert_eq!(collection.collection_type().unwrap(), "test.collection");
        assert!(collection.is_new());
    }

    #[test]
    fn collection_item_view_reads_the_same_data() {
        let (mut collection, _) = collection_pair();
        collection.set_content(b"shared bytes").unwrap();
        let item = collection.item().unwrap();
        assert_eq!(item.content().unwrap(), b"shared bytes");
        assert_eq!(item.uid(), collection.uid());
    }

    #[test]
    fn etag_tracks_saved_state() {
        let (mut collection, _) = collection_pair();
        assert!(collection.is_new());
        collection.mark_saved();
        assert!(!collection.is_new());
        let saved_etag = collection.etag().to_string();
        collection.set_content(b"changed").unwrap();
        assert_ne!(collection.etag(), saved_etag);
    }

    #[test]
    fn cache_blob_roundtrip_preserves_decryptability() {
        let (mut collection, account_cm) = collection_pair();
        collection.set_content(b"cache me").unwrap();
        let blob = msgpack_encode(&(CACHE_VERSION, collection.encrypted())).unwrap();

        let (version, encrypted): (u8, EncryptedCollection) = msgpack_decode(&blob).unwrap();
        assert_eq!(version, CACHE_VERSION);
        let crypto_manager = encrypted.crypto_manager(&account_cm).unwrap();
        let restored = Collection::new(crypto_manager, encrypted);
        assert_eq!(restored.content().unwrap(), b"cache me");
    }

    #[test]
    fn cache_blob_without_content_drops_ciphertexts() {
        let (mut collection, account_cm) = collection_pair();
        collection.set_content(b"cache me").unwrap();

        let mut encrypted = collection.encrypted().clone();
        for chunk in encrypted.item_mut().revision_mut().chunks_mut() {
            chunk.1 = None;
        }
        let crypto_manager = encrypted.crypto_manager(&account_cm).unwrap();
        let light = Collection::new(crypto_manager, encrypted);
        assert!(matches!(light.content(), Err(Error::MissingContent(_))));
        // meta is still intact
        light.verify().unwrap();
    }
}
