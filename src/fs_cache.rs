//! On-disk cache for accounts, collections, and items.
//!
//! Offline-first callers persist encrypted entities between runs. The
//! blobs stored here are the same msgpack cache shapes the managers
//! produce; nothing is additionally encrypted, so pair the account blob
//! with an `encryption_key` if the disk is untrusted.
//!
//! Directory layout:
//! ```text
//! {base}/{username}/
//!   account
//!   stoken
//!   cols/
//!     {col_uid}/
//!       col
//!       items/
//!         {item_uid}
//! ```
//! UIDs are url-safe base64, so they are usable as file names as-is.

use std::fs;
use std::path::{Path, PathBuf};

use crate::account::Account;
use crate::crypto::SYMMETRIC_KEY_SIZE;
use crate::error::Result;
use crate::managers::{Collection, CollectionManager, Item, ItemManager};

pub struct FileSystemCache {
    user_dir: PathBuf,
}

impl FileSystemCache {
    /// Open (creating if needed) the cache for one user.
    pub fn new(base: &Path, username: &str) -> Result<Self> {
        let user_dir = base.join(username);
        fs::create_dir_all(user_dir.join("cols"))?;
        Ok(Self { user_dir })
    }

    fn col_dir(&self, col_uid: &str) -> PathBuf {
        self.user_dir.join("cols").join(col_uid)
    }

    fn item_path(&self, col_uid: &str, item_uid: &str) -> PathBuf {
        self.col_dir(col_uid).join("items").join(item_uid)
    }

    /// Remove everything cached for this user.
    pub fn clear_user(self) -> Result<()> {
        fs::remove_dir_all(&self.user_dir)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Account and sync token
    // -----------------------------------------------------------------------

    pub fn save_account(
        &self,
        account: &Account,
        encryption_key: Option<&[u8; SYMMETRIC_KEY_SIZE]>,
    ) -> Result<()> {
        let saved = account.save(encryption_key)?;
        fs::write(self.user_dir.join("account"), saved)?;
        Ok(())
    }

    pub fn load_account(
        &self,
        encryption_key: Option<&[u8; SYMMETRIC_KEY_SIZE]>,
    ) -> Result<Account> {
        let saved = fs::read_to_string(self.user_dir.join("account"))?;
        Account::restore(&saved, encryption_key)
    }

    /// The collection-list stoken to resume syncing from.
    pub fn save_stoken(&self, stoken: &str) -> Result<()> {
        fs::write(self.user_dir.join("stoken"), stoken)?;
        Ok(())
    }

    pub fn load_stoken(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.user_dir.join("stoken")) {
            Ok(stoken) => Ok(Some(stoken)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Per-collection item stoken.
    pub fn collection_save_stoken(&self, col_uid: &str, stoken: &str) -> Result<()> {
        fs::write(self.col_dir(col_uid).join("stoken"), stoken)?;
        Ok(())
    }

    pub fn collection_load_stoken(&self, col_uid: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.col_dir(col_uid).join("stoken")) {
            Ok(stoken) => Ok(Some(stoken)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    pub fn collection_save(
        &self,
        manager: &CollectionManager<'_>,
        collection: &Collection,
    ) -> Result<()> {
        let dir = self.col_dir(collection.uid());
        fs::create_dir_all(dir.join("items"))?;
        fs::write(dir.join("col"), manager.cache_save(collection, true)?)?;
        Ok(())
    }

    /// Like [`FileSystemCache::collection_save`] but without chunk
    /// ciphertexts.
    pub fn collection_save_lite(
        &self,
        manager: &CollectionManager<'_>,
        collection: &Collection,
    ) -> Result<()> {
        let dir = self.col_dir(collection.uid());
        fs::create_dir_all(dir.join("items"))?;
        fs::write(dir.join("col"), manager.cache_save(collection, false)?)?;
        Ok(())
    }

    pub fn collection_load(
        &self,
        manager: &CollectionManager<'_>,
        col_uid: &str,
    ) -> Result<Collection> {
        let cached = fs::read(self.col_dir(col_uid).join("col"))?;
        manager.cache_load(&cached)
    }

    /// Forget a collection and all its cached items.
    pub fn collection_unset(&self, col_uid: &str) -> Result<()> {
        fs::remove_dir_all(self.col_dir(col_uid))?;
        Ok(())
    }

    pub fn collection_list(&self) -> Result<Vec<String>> {
        let mut uids = Vec::new();
        for entry in fs::read_dir(self.user_dir.join("cols"))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                uids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(uids)
    }

    // -----------------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------------

    pub fn item_save(
        &self,
        manager: &ItemManager<'_>,
        col_uid: &str,
        item: &Item,
    ) -> Result<()> {
        let path = self.item_path(col_uid, item.uid());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, manager.cache_save(item, true)?)?;
        Ok(())
    }

    pub fn item_load(
        &self,
        manager: &ItemManager<'_>,
        col_uid: &str,
        item_uid: &str,
    ) -> Result<Item> {
        let cached = fs::read(self.item_path(col_uid, item_uid))?;
        manager.cache_load(&cached)
    }

    pub fn item_unset(&self, col_uid: &str, item_uid: &str) -> Result<()> {
        fs::remove_file(self.item_path(col_uid, item_uid))?;
        Ok(())
    }

    pub fn item_list(&self, col_uid: &str) -> Result<Vec<String>> {
        let dir = self.col_dir(col_uid).join("items");
        let mut uids = Vec::new();
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    uids.push(entry?.file_name().to_string_lossy().into_owned());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(uids)
    }
}
