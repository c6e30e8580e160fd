//! End-to-end roundtrips through the public API, no server required.

use serde::Serialize;
use serde_bytes::ByteBuf;

use rampart::primitives::{
    msgpack_encode, to_base64, AccountCryptoManager, BoxCryptoManager, MainCryptoManager,
    StorageCryptoManager, SYMMETRIC_KEY_SIZE,
};
use rampart::{Account, Error, ItemMetadata, CURRENT_VERSION};

const MAIN_KEY: [u8; 32] = [21u8; 32];
const IDENTITY_SEED: [u8; 32] = [22u8; 32];

// ---------------------------------------------------------------------------
// Offline account bootstrap
//
// A session blob is the one offline entry point into a full Account, so
// craft one from primitives: same construction the signup path uses.
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserBlob<'a> {
    username: &'a str,
    email: &'a str,
    pubkey: ByteBuf,
    encrypted_content: ByteBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionData<'a> {
    user: UserBlob<'a>,
    server_url: &'a str,
    version: u8,
    key: ByteBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionBlob {
    version: u8,
    encrypted_data: ByteBuf,
}

fn offline_account() -> Account {
    let main = MainCryptoManager::new(&MAIN_KEY, CURRENT_VERSION).unwrap();
    let identity = BoxCryptoManager::keygen(Some(&IDENTITY_SEED));

    let account_key = [23u8; SYMMETRIC_KEY_SIZE];
    let mut content = Vec::with_capacity(SYMMETRIC_KEY_SIZE * 2);
    content.extend_from_slice(&account_key);
    content.extend_from_slice(identity.privkey());
    let encrypted_content = main.encrypt(&content, None).unwrap();

    let storage = StorageCryptoManager::new(&[0u8; 32], CURRENT_VERSION).unwrap();
    let session = SessionData {
        user: UserBlob {
            username: "alice",
            email: "alice@example.com",
            pubkey: ByteBuf::from(identity.pubkey().to_vec()),
            encrypted_content: ByteBuf::from(encrypted_content),
        },
        server_url: "https://sync.example.com",
        version: CURRENT_VERSION,
        key: ByteBuf::from(storage.encrypt(&MAIN_KEY, None).unwrap()),
    };
    let blob = SessionBlob {
        version: CURRENT_VERSION,
        encrypted_data: ByteBuf::from(
            storage
                .encrypt(&msgpack_encode(&session).unwrap(), Some(&[CURRENT_VERSION]))
                .unwrap(),
        ),
    };
    Account::restore(&to_base64(&msgpack_encode(&blob).unwrap()), None).unwrap()
}

// ---------------------------------------------------------------------------
// Collections and items
// ---------------------------------------------------------------------------

#[test]
fn collection_meta_and_content_roundtrip() {
    let account = offline_account();
    let collections = account.collection_manager();

    let meta = ItemMetadata {
        name: Some("Calendar".into()),
        description: Some("Mine".into()),
        color: Some("#ffffff".into()),
        ..Default::default()
    };
    let collection = collections
        .create("example.calendar", &meta, &[1, 2, 3, 5])
        .unwrap();

    collection.verify().unwrap();
    let read: ItemMetadata = collection.meta().unwrap();
    assert_eq!(read, meta);
    assert_eq!(collection.content().unwrap(), vec![1, 2, 3, 5]);
    assert_eq!(collection.collection_type().unwrap(), "example.calendar");
}

#[test]
fn collection_meta_change_rebinds_etag() {
    let account = offline_account();
    let collections = account.collection_manager();
    let mut collection = collections
        .create("example.calendar", &ItemMetadata::default(), b"")
        .unwrap();

    let etag_before = collection.etag().to_string();
    collection
        .set_meta(&ItemMetadata {
            name: Some("Calendar2".into()),
            description: Some("Someone".into()),
            color: Some("#000000".into()),
            ..Default::default()
        })
        .unwrap();
    collection.set_content(&[7, 2, 3, 5]).unwrap();

    assert_ne!(collection.etag(), etag_before);
    assert_eq!(collection.content().unwrap(), vec![7, 2, 3, 5]);
}

#[test]
fn empty_content_roundtrips_with_no_chunks() {
    let account = offline_account();
    let collections = account.collection_manager();
    let collection = collections
        .create("example.notes", &ItemMetadata::default(), b"")
        .unwrap();
    assert_eq!(collection.content().unwrap(), b"");
}

#[test]
fn item_roundtrip_and_tombstone() {
    let account = offline_account();
    let collections = account.collection_manager();
    let collection = collections
        .create("example.tasks", &ItemMetadata::default(), b"")
        .unwrap();
    let items = collections.item_manager(&collection).unwrap();

    let meta = ItemMetadata {
        item_type: Some("file".into()),
        name: Some("hello.txt".into()),
        mtime: Some(1_700_000_000_000),
        ..Default::default()
    };
    let mut item = items.create(&meta, b"hello world").unwrap();

    item.verify().unwrap();
    assert_eq!(item.item_meta().unwrap(), meta);
    assert_eq!(item.content().unwrap(), b"hello world");
    assert!(!item.is_deleted());
    assert!(item.is_locally_changed());

    item.delete(false).unwrap();
    assert!(item.is_deleted());
    item.verify().unwrap();
    assert_eq!(item.content().unwrap(), b"");
}

#[test]
fn large_content_survives_chunked_roundtrip() {
    let account = offline_account();
    let collections = account.collection_manager();
    let collection = collections
        .create("example.files", &ItemMetadata::default(), b"")
        .unwrap();
    let items = collections.item_manager(&collection).unwrap();

    // over a MiB so several content-defined chunks are in play
    let mut content = vec![0u8; 1 << 20];
    let mut state = 0x1357_9bdfu32;
    for byte in content.iter_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *byte = (state >> 8) as u8;
    }

    let mut item = items.create(&ItemMetadata::default(), &content).unwrap();
    assert_eq!(item.content().unwrap(), content);

    // successive revisions keep roundtripping
    for payload in [&[1u8, 2, 0][..], &[1, 2, 1], &[1, 2, 2], b"Latest"] {
        item.set_content(payload).unwrap();
        assert_eq!(item.content().unwrap(), payload);
    }
}

#[test]
fn items_from_another_collection_are_rejected() {
    let account = offline_account();
    let collections = account.collection_manager();
    let col_a = collections
        .create("example.a", &ItemMetadata::default(), b"")
        .unwrap();
    let col_b = collections
        .create("example.b", &ItemMetadata::default(), b"")
        .unwrap();

    let items_a = collections.item_manager(&col_a).unwrap();
    let items_b = collections.item_manager(&col_b).unwrap();
    let foreign = items_a.create(&ItemMetadata::default(), b"x").unwrap();

    // cache blobs are collection-scoped: loading a foreign item fails its MAC
    let blob = items_a.cache_save(&foreign, true).unwrap();
    let reloaded = items_b.cache_load(&blob).unwrap();
    assert!(reloaded.verify().is_err());
}

#[test]
fn cache_blobs_roundtrip_with_and_without_content() {
    let account = offline_account();
    let collections = account.collection_manager();
    let mut collection = collections
        .create("example.cache", &ItemMetadata::default(), b"")
        .unwrap();
    collection.set_content(b"cached bytes").unwrap();

    let full = collections.cache_save(&collection, true).unwrap();
    let restored = collections.cache_load(&full).unwrap();
    assert_eq!(restored.content().unwrap(), b"cached bytes");

    let light = collections.cache_save(&collection, false).unwrap();
    assert!(light.len() < full.len());
    let restored = collections.cache_load(&light).unwrap();
    assert!(matches!(restored.content(), Err(Error::MissingContent(_))));

    let items = collections.item_manager(&collection).unwrap();
    let item = items.create(&ItemMetadata::default(), b"item bytes").unwrap();
    let blob = items.cache_save(&item, true).unwrap();
    assert_eq!(
        items.cache_load(&blob).unwrap().content().unwrap(),
        b"item bytes"
    );
}

// ---------------------------------------------------------------------------
// Filesystem cache
// ---------------------------------------------------------------------------

#[test]
fn fs_cache_roundtrips_account_collections_and_items() {
    use rampart::FileSystemCache;

    let account = offline_account();
    let collections = account.collection_manager();
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileSystemCache::new(tmp.path(), account.username()).unwrap();

    let key = [9u8; 32];
    cache.save_account(&account, Some(&key)).unwrap();
    let restored = cache.load_account(Some(&key)).unwrap();
    assert_eq!(restored.username(), account.username());

    let collection = collections
        .create("example.cached", &ItemMetadata::default(), b"col content")
        .unwrap();
    cache.collection_save(&collections, &collection).unwrap();
    assert_eq!(cache.collection_list().unwrap(), vec![collection.uid().to_string()]);

    let loaded = cache.collection_load(&collections, collection.uid()).unwrap();
    assert_eq!(loaded.content().unwrap(), b"col content");

    let items = collections.item_manager(&collection).unwrap();
    let item = items.create(&ItemMetadata::default(), b"item content").unwrap();
    cache.item_save(&items, collection.uid(), &item).unwrap();
    let loaded = cache.item_load(&items, collection.uid(), item.uid()).unwrap();
    assert_eq!(loaded.content().unwrap(), b"item content");

    cache.item_unset(collection.uid(), item.uid()).unwrap();
    assert!(cache.item_list(collection.uid()).unwrap().is_empty());

    cache.save_stoken("tok-1").unwrap();
    assert_eq!(cache.load_stoken().unwrap().as_deref(), Some("tok-1"));
    assert!(cache.collection_load_stoken(collection.uid()).unwrap().is_none());

    cache.collection_unset(collection.uid()).unwrap();
    assert!(cache.collection_list().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[test]
fn session_save_restore_roundtrip() {
    let account = offline_account();
    let key = [5u8; 32];
    let saved = account.save(Some(&key)).unwrap();
    let restored = Account::restore(&saved, Some(&key)).unwrap();
    assert_eq!(restored.username(), "alice");
    assert_eq!(restored.version(), account.version());

    // the restored account still derives the same deterministic type uids
    let collections = restored.collection_manager();
    let col = collections
        .create("example.calendar", &ItemMetadata::default(), b"")
        .unwrap();
    assert_eq!(col.collection_type().unwrap(), "example.calendar");
}

#[test]
fn session_restore_rejects_wrong_key() {
    let account = offline_account();
    let saved = account.save(Some(&[5u8; 32])).unwrap();
    assert!(matches!(
        Account::restore(&saved, Some(&[6u8; 32])),
        Err(Error::Integrity(_))
    ));
}

// ---------------------------------------------------------------------------
// Invitations (crypto path only; transport is server-side)
// ---------------------------------------------------------------------------

#[test]
fn invitation_key_wrap_roundtrip_across_accounts() {
    let sender_account = AccountCryptoManager::new(&[31u8; 32], CURRENT_VERSION).unwrap();
    let recipient_account = AccountCryptoManager::new(&[32u8; 32], CURRENT_VERSION).unwrap();

    // the sender's wrap and the recipient's re-wrap are bound to the same
    // type string but different type uids
    let sender_uid = sender_account.col_type_to_uid("example.shared").unwrap();
    let recipient_uid = recipient_account.col_type_to_uid("example.shared").unwrap();
    assert_ne!(sender_uid, recipient_uid);

    let collection_key = [77u8; 32];
    let wrapped = recipient_account
        .encrypt(&collection_key, Some(&recipient_uid))
        .unwrap();
    assert_eq!(
        recipient_account
            .decrypt(&wrapped, Some(&recipient_uid))
            .unwrap(),
        collection_key
    );
    assert!(recipient_account
        .decrypt(&wrapped, Some(&sender_uid))
        .is_err());
}
