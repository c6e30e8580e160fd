//! Account lifecycle: signup, login, password change, session persistence.
//!
//! The account owns the passphrase-derived main key. Everything else
//! (account key, identity key) lives inside the server-held encrypted
//! content blob and is decrypted on demand, so there is no long-lived
//! subkey cache to invalidate.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, PWHASH_SALT_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{Error, Result};
use crate::helpers::{from_base64, msgpack_decode, msgpack_encode, to_base64};
use crate::keys::{
    AccountCryptoManager, BoxCryptoManager, MainCryptoManager, StorageCryptoManager,
};
use crate::managers::{CollectionInvitationManager, CollectionManager};
use crate::service::{
    Authenticator, Client, LoginBody, LoginChallenge, LoginResponseUser, PasswordChangeBody, User,
};
use crate::CURRENT_VERSION;

const ACTION_LOGIN: &str = "login";
const ACTION_CHANGE_PASSWORD: &str = "changePassword";

/// A logged-in account.
pub struct Account {
    user: LoginResponseUser,
    version: u8,
    main_key: [u8; SYMMETRIC_KEY_SIZE],
    client: Client,
}

impl Drop for Account {
    fn drop(&mut self) {
        self.main_key.zeroize();
    }
}

impl Account {
    // -----------------------------------------------------------------------
    // Signup / login
    // -----------------------------------------------------------------------

    /// Create a new account on the server.
    pub async fn signup(client: Client, user: &User, password: &str) -> Result<Account> {
        crate::init().await;
        let salt = crypto::random_bytes_array::<32>();
        let main_key = derive_main_key(password, &salt)?;
        Self::signup_common(client, user, main_key, &salt).await
    }

    async fn signup_common(
        mut client: Client,
        user: &User,
        main_key: [u8; SYMMETRIC_KEY_SIZE],
        salt: &[u8; 32],
    ) -> Result<Account> {
        let version = CURRENT_VERSION;
        let main_crypto_manager = MainCryptoManager::new(&main_key, version)?;
        let login_crypto_manager = main_crypto_manager.login_crypto_manager();

        let account_key = crypto::random_bytes_array::<SYMMETRIC_KEY_SIZE>();
        let identity = BoxCryptoManager::keygen(None);

        let mut content = [0u8; SYMMETRIC_KEY_SIZE * 2];
        content[..SYMMETRIC_KEY_SIZE].copy_from_slice(&account_key);
        content[SYMMETRIC_KEY_SIZE..].copy_from_slice(identity.privkey());
        let encrypted_content = main_crypto_manager.encrypt(&content, None)?;
        content.zeroize();

        let response = Authenticator::new(&client)
            .signup(
                user,
                salt,
                login_crypto_manager.pubkey(),
                identity.pubkey(),
                &encrypted_content,
            )
            .await?;

        client.set_token(Some(&response.token));
        debug!(username = %response.user.username, "signed up");
        Ok(Account {
            user: response.user,
            version,
            main_key,
            client,
        })
    }

    /// Log in with a username and password. An uninitialized user is
    /// transparently signed up instead.
    pub async fn login(client: Client, username: &str, password: &str) -> Result<Account> {
        crate::init().await;
        let authenticator = Authenticator::new(&client);
        let challenge = match authenticator.login_challenge(username).await {
            Ok(challenge) => challenge,
            Err(Error::Unauthorized { code, .. }) if code == "user_not_init" => {
                let user = User {
                    username: username.to_string(),
                    email: String::new(),
                };
                return Self::signup(client, &user, password).await;
            }
            Err(err) => return Err(err),
        };

        let salt: [u8; 32] = challenge
            .salt
            .get(..32)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::integrity("login salt too short"))?;
        let main_key = derive_main_key(password, &salt)?;
        Self::login_common(client, username, main_key, challenge).await
    }

    async fn login_common(
        mut client: Client,
        username: &str,
        main_key: [u8; SYMMETRIC_KEY_SIZE],
        challenge: LoginChallenge,
    ) -> Result<Account> {
        let version = challenge.version;
        let main_crypto_manager = MainCryptoManager::new(&main_key, version)?;
        let login_crypto_manager = main_crypto_manager.login_crypto_manager();

        let host = client.host();
        let response = msgpack_encode(&LoginBody {
            username,
            challenge: &challenge.challenge,
            host: &host,
            action: ACTION_LOGIN,
        })?;
        let signature = login_crypto_manager.sign_detached(&response);

        let login_response = Authenticator::new(&client)
            .login(&response, &signature)
            .await?;

        client.set_token(Some(&login_response.token));
        debug!(username, "logged in");
        Ok(Account {
            user: login_response.user,
            version,
            main_key,
            client,
        })
    }

    /// Refresh an expired auth token using the stored main key.
    pub async fn fetch_token(&mut self) -> Result<()> {
        let authenticator = Authenticator::new(&self.client);
        let challenge = authenticator.login_challenge(&self.user.username).await?;

        let host = self.client.host();
        let response = msgpack_encode(&LoginBody {
            username: &self.user.username,
            challenge: &challenge.challenge,
            host: &host,
            action: ACTION_LOGIN,
        })?;
        let signature = self
            .main_crypto_manager()?
            .login_crypto_manager()
            .sign_detached(&response);
        let login_response = authenticator.login(&response, &signature).await?;
        self.client.set_token(Some(&login_response.token));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Password change / logout
    // -----------------------------------------------------------------------

    /// Re-wrap the encrypted content under a new passphrase. The request
    /// is signed with the old login key; the server swaps credentials
    /// atomically.
    pub async fn change_password(&mut self, new_password: &str) -> Result<()> {
        let authenticator = Authenticator::new(&self.client);
        let challenge = authenticator.login_challenge(&self.user.username).await?;

        let old_main_crypto_manager = MainCryptoManager::new(&self.main_key, self.version)?;
        let content =
            Zeroizing::new(old_main_crypto_manager.decrypt(&self.user.encrypted_content, None)?);
        let old_login_crypto_manager = old_main_crypto_manager.login_crypto_manager();

        let salt: [u8; 32] = challenge
            .salt
            .get(..32)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::integrity("login salt too short"))?;
        let new_main_key = derive_main_key(new_password, &salt)?;
        let new_main_crypto_manager = MainCryptoManager::new(&new_main_key, self.version)?;
        let new_login_crypto_manager = new_main_crypto_manager.login_crypto_manager();
        let encrypted_content = new_main_crypto_manager.encrypt(&content, None)?;

        let host = self.client.host();
        let response = msgpack_encode(&PasswordChangeBody {
            username: &self.user.username,
            challenge: &challenge.challenge,
            host: &host,
            action: ACTION_CHANGE_PASSWORD,
            login_pubkey: new_login_crypto_manager.pubkey(),
            encrypted_content: &encrypted_content,
        })?;
        let signature = old_login_crypto_manager.sign_detached(&response);
        authenticator.change_password(&response, &signature).await?;

        self.main_key.zeroize();
        self.main_key = new_main_key;
        self.user.encrypted_content = ByteBuf::from(encrypted_content);
        Ok(())
    }

    /// Invalidate the token server-side and zeroize key material.
    pub async fn logout(mut self) -> Result<()> {
        let result = Authenticator::new(&self.client).logout().await;
        self.main_key.zeroize();
        self.client.set_token(None);
        result
    }

    /// A one-off URL for the account dashboard (billing and co).
    pub async fn fetch_dashboard_url(&self) -> Result<String> {
        Authenticator::new(&self.client).fetch_dashboard_url().await
    }

    // -----------------------------------------------------------------------
    // Session persistence
    // -----------------------------------------------------------------------

    /// Serialize this session to an encrypted blob. `encryption_key`
    /// protects the blob at rest; all zeros when absent.
    pub fn save(&self, encryption_key: Option<&[u8; SYMMETRIC_KEY_SIZE]>) -> Result<String> {
        let version = CURRENT_VERSION;
        let storage_key = encryption_key.copied().unwrap_or([0u8; SYMMETRIC_KEY_SIZE]);
        let crypto_manager = StorageCryptoManager::new(&storage_key, version)?;
        let content = SessionData {
            user: self.user.clone(),
            auth_token: self.auth_token(),
            server_url: self.client.server_url().to_string(),
            version: self.version,
            key: ByteBuf::from(crypto_manager.encrypt(&self.main_key, None)?),
        };
        let blob = SessionBlob {
            version,
            encrypted_data: ByteBuf::from(
                crypto_manager.encrypt(&msgpack_encode(&content)?, Some(&[version]))?,
            ),
        };
        Ok(to_base64(&msgpack_encode(&blob)?))
    }

    /// Restore a session saved by [`Account::save`]. Fails with an
    /// integrity error when the wrong key is supplied.
    pub fn restore(
        saved: &str,
        encryption_key: Option<&[u8; SYMMETRIC_KEY_SIZE]>,
    ) -> Result<Account> {
        let blob: SessionBlob = msgpack_decode(&from_base64(saved)?)?;
        let storage_key = encryption_key.copied().unwrap_or([0u8; SYMMETRIC_KEY_SIZE]);
        let crypto_manager = StorageCryptoManager::new(&storage_key, blob.version)?;
        let content: SessionData = msgpack_decode(
            &crypto_manager.decrypt(&blob.encrypted_data, Some(&[blob.version]))?,
        )?;
        let main_key_buf = Zeroizing::new(crypto_manager.decrypt(&content.key, None)?);
        let main_key: [u8; SYMMETRIC_KEY_SIZE] = main_key_buf
            .as_slice()
            .try_into()
            .map_err(|_| Error::integrity("main key has wrong length"))?;

        let mut client = Client::new(&content.server_url)?;
        client.set_token(content.auth_token.as_deref());
        Ok(Account {
            user: content.user,
            version: content.version,
            main_key,
            client,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors and managers
    // -----------------------------------------------------------------------

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn auth_token(&self) -> Option<String> {
        // the token only lives inside the client; surface it for saving
        self.client.token().map(str::to_string)
    }

    pub(crate) fn main_crypto_manager(&self) -> Result<MainCryptoManager> {
        MainCryptoManager::new(&self.main_key, self.version)
    }

    /// Split the encrypted content blob into `(account key, identity key)`.
    /// Derived on every call; both halves stay wrapped so they are wiped
    /// once the downstream manager has been constructed.
    fn decrypted_content(&self) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>)> {
        let content = Zeroizing::new(
            self.main_crypto_manager()?
                .decrypt(&self.user.encrypted_content, None)?,
        );
        if content.len() != SYMMETRIC_KEY_SIZE * 2 {
            return Err(Error::integrity("account content has wrong length"));
        }
        let account_key: Zeroizing<[u8; 32]> =
            Zeroizing::new(content[..SYMMETRIC_KEY_SIZE].try_into().unwrap());
        let identity_privkey: Zeroizing<[u8; 32]> =
            Zeroizing::new(content[SYMMETRIC_KEY_SIZE..].try_into().unwrap());
        Ok((account_key, identity_privkey))
    }

    pub(crate) fn account_crypto_manager(&self) -> Result<AccountCryptoManager> {
        let (account_key, _) = self.decrypted_content()?;
        self.main_crypto_manager()?
            .account_crypto_manager(&account_key)
    }

    pub(crate) fn identity_crypto_manager(&self) -> Result<BoxCryptoManager> {
        let (_, identity_privkey) = self.decrypted_content()?;
        Ok(self
            .main_crypto_manager()?
            .identity_crypto_manager(&identity_privkey))
    }

    /// Entry point to collections.
    pub fn collection_manager(&self) -> CollectionManager<'_> {
        CollectionManager::new(self)
    }

    /// Entry point to invitations.
    pub fn invitation_manager(&self) -> CollectionInvitationManager<'_> {
        CollectionInvitationManager::new(self)
    }
}

fn derive_main_key(password: &str, salt: &[u8; 32]) -> Result<[u8; SYMMETRIC_KEY_SIZE]> {
    let salt: &[u8; PWHASH_SALT_SIZE] = salt[..PWHASH_SALT_SIZE].try_into().unwrap();
    crypto::pwhash(password.as_bytes(), salt)
}

// ---------------------------------------------------------------------------
// Session blob shapes
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionBlob {
    version: u8,
    encrypted_data: ByteBuf,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionData {
    user: LoginResponseUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    server_url: String,
    version: u8,
    key: ByteBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_account() -> Account {
        let main_key = [42u8; SYMMETRIC_KEY_SIZE];
        let main = MainCryptoManager::new(&main_key, CURRENT_VERSION).unwrap();
        let account_key = [43u8; SYMMETRIC_KEY_SIZE];
        let identity = BoxCryptoManager::keygen(Some(&[44u8; 32]));
        let mut content = [0u8; SYMMETRIC_KEY_SIZE * 2];
        content[..SYMMETRIC_KEY_SIZE].copy_from_slice(&account_key);
        content[SYMMETRIC_KEY_SIZE..].copy_from_slice(identity.privkey());
        let encrypted_content = main.encrypt(&content, None).unwrap();

        let mut client = Client::new("https://sync.example.com").unwrap();
        client.set_token(Some("test-token"));
        Account {
            user: LoginResponseUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                pubkey: ByteBuf::from(vec![0u8; 32]),
                encrypted_content: ByteBuf::from(encrypted_content),
            },
            version: CURRENT_VERSION,
            main_key,
            client,
        }
    }

    #[test]
    fn session_roundtrip() {
        let account = test_account();
        let key = [7u8; 32];
        let saved = account.save(Some(&key)).unwrap();
        let restored = Account::restore(&saved, Some(&key)).unwrap();

        assert_eq!(restored.username(), "alice");
        assert_eq!(restored.version(), account.version());
        assert_eq!(restored.main_key, account.main_key);
        assert_eq!(restored.auth_token().as_deref(), Some("test-token"));
        assert_eq!(
            restored.client().server_url().as_str(),
            account.client().server_url().as_str()
        );
    }

    #[test]
    fn session_restore_with_wrong_key_fails() {
        let account = test_account();
        let saved = account.save(Some(&[7u8; 32])).unwrap();
        assert!(matches!(
            Account::restore(&saved, Some(&[8u8; 32])),
            Err(Error::Integrity(_))
        ));
        assert!(matches!(
            Account::restore(&saved, None),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn session_blob_tamper_fails_restore() {
        let account = test_account();
        let key = [7u8; 32];
        let saved = account.save(Some(&key)).unwrap();
        let mut blob: SessionBlob = msgpack_decode(&from_base64(&saved).unwrap()).unwrap();
        let len = blob.encrypted_data.len();
        blob.encrypted_data[len / 2] ^= 0x01;
        let tampered = to_base64(&msgpack_encode(&blob).unwrap());
        assert!(matches!(
            Account::restore(&tampered, Some(&key)),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn session_without_key_uses_zero_key() {
        let account = test_account();
        let saved = account.save(None).unwrap();
        let restored = Account::restore(&saved, None).unwrap();
        assert_eq!(restored.main_key, account.main_key);
    }

    #[test]
    fn account_managers_derive_from_content() {
        let account = test_account();
        let account_cm = account.account_crypto_manager().unwrap();
        // deterministic across derivations
        let uid1 = account_cm.col_type_to_uid("cal").unwrap();
        let uid2 = account
            .account_crypto_manager()
            .unwrap()
            .col_type_to_uid("cal")
            .unwrap();
        assert_eq!(uid1, uid2);

        let identity = account.identity_crypto_manager().unwrap();
        assert_eq!(
            identity.pubkey(),
            BoxCryptoManager::keygen(Some(&[44u8; 32])).pubkey()
        );
    }
}
