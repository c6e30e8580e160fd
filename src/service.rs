//! Server transport and endpoint bindings.
//!
//! Everything here is a thin, typed shim over the HTTP API: msgpack
//! bodies both ways, bearer auth, and status-code to error-taxonomy
//! mapping. No cryptography happens at this layer; it moves ciphertext
//! the encrypted models produced.

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, ErrorBody, Result};
use crate::helpers::{msgpack_decode, msgpack_encode};
use crate::models::{
    AccessLevel, EncryptedCollection, EncryptedItem, EncryptedRevision, SignedInvitation,
};

const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";
const API_BASE: &str = "api/v1/";

// ---------------------------------------------------------------------------
// Fetch options
// ---------------------------------------------------------------------------

/// How much chunk data list/fetch calls should carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prefetch {
    /// Everything inline.
    Auto,
    /// Chunk MACs only; ciphertexts are downloaded on demand.
    Medium,
}

/// Query parameters recognized across list/fetch operations.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    pub limit: Option<usize>,
    pub stoken: Option<String>,
    pub iterator: Option<String>,
    pub prefetch: Option<Prefetch>,
    pub with_collection: Option<bool>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn stoken(mut self, stoken: Option<&str>) -> Self {
        self.stoken = stoken.map(str::to_string);
        self
    }

    pub fn iterator(mut self, iterator: Option<&str>) -> Self {
        self.iterator = iterator.map(str::to_string);
        self
    }

    pub fn prefetch(mut self, prefetch: Prefetch) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_collection(mut self, with_collection: bool) -> Self {
        self.with_collection = Some(with_collection);
        self
    }

    fn apply(&self, url: &mut Url) {
        let mut query = url.query_pairs_mut();
        if let Some(limit) = self.limit {
            query.append_pair("limit", &limit.to_string());
        }
        if let Some(stoken) = &self.stoken {
            query.append_pair("stoken", stoken);
        }
        if let Some(iterator) = &self.iterator {
            query.append_pair("iterator", iterator);
        }
        if let Some(prefetch) = self.prefetch {
            let value = match prefetch {
                Prefetch::Auto => "auto",
                Prefetch::Medium => "medium",
            };
            query.append_pair("prefetch", value);
        }
        if let Some(with_collection) = self.with_collection {
            query.append_pair("withCollection", if with_collection { "1" } else { "0" });
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Account identity as the server sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
}

/// User payload returned by signup/login.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponseUser {
    pub username: String,
    pub email: String,
    pub pubkey: ByteBuf,
    pub encrypted_content: ByteBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignupBody<'a> {
    user: &'a User,
    salt: ByteBuf,
    login_pubkey: ByteBuf,
    pubkey: ByteBuf,
    encrypted_content: ByteBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoginChallenge {
    #[serde(default)]
    pub username: Option<String>,
    pub challenge: ByteBuf,
    pub salt: ByteBuf,
    pub version: u8,
}

/// The msgpack map that gets signed by the login key. Field order is part
/// of the signed bytes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginBody<'a> {
    pub username: &'a str,
    #[serde(with = "serde_bytes")]
    pub challenge: &'a [u8],
    pub host: &'a str,
    pub action: &'a str,
}

/// Signed variant used by password change.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PasswordChangeBody<'a> {
    pub username: &'a str,
    #[serde(with = "serde_bytes")]
    pub challenge: &'a [u8],
    pub host: &'a str,
    pub action: &'a str,
    #[serde(with = "serde_bytes")]
    pub login_pubkey: &'a [u8],
    #[serde(with = "serde_bytes")]
    pub encrypted_content: &'a [u8],
}

#[derive(Debug, Serialize)]
struct SignedRequest {
    response: ByteBuf,
    signature: ByteBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: LoginResponseUser,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DashboardUrlResponse {
    pub url: String,
}

/// Generic stoken-paginated listing.
#[derive(Clone, Debug, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub stoken: Option<String>,
    pub done: bool,
}

/// Iterator-paginated listing (revision history).
#[derive(Clone, Debug, Deserialize)]
pub struct IteratorListResponse<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub iterator: Option<String>,
    pub done: bool,
}

/// A collection this user lost access to, reported by filtered listings.
#[derive(Clone, Debug, Deserialize)]
pub struct RemovedCollection {
    pub uid: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CollectionListResponse {
    pub data: Vec<EncryptedCollection>,
    #[serde(default)]
    pub stoken: Option<String>,
    pub done: bool,
    #[serde(default, rename = "removedMemberships")]
    pub removed_memberships: Option<Vec<RemovedCollection>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CollectionListBody {
    collection_types: Vec<ByteBuf>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ItemDep<'a> {
    pub uid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ItemBatchBody<'a> {
    items: &'a [&'a EncryptedItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    deps: Option<&'a [ItemDep<'a>]>,
}

/// Member of a collection.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMember {
    pub username: String,
    pub access_level: AccessLevel,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberPatchBody {
    access_level: AccessLevel,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UserProfile {
    pub pubkey: ByteBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvitationAcceptBody<'a> {
    #[serde(with = "serde_bytes")]
    collection_type: &'a [u8],
    #[serde(with = "serde_bytes")]
    encryption_key: &'a [u8],
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Msgpack-over-HTTP client with bearer auth.
#[derive(Clone)]
pub struct Client {
    inner: reqwest::Client,
    server_url: Url,
    auth_token: Option<String>,
}

impl Client {
    pub fn new(server_url: &str) -> Result<Self> {
        let mut server_url = Url::parse(server_url)?;
        // endpoint joining assumes a trailing slash
        if !server_url.path().ends_with('/') {
            server_url.set_path(&format!("{}/", server_url.path()));
        }
        let inner = reqwest::Client::builder()
            .user_agent(concat!("rampart/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::from)?;
        Ok(Self {
            inner,
            server_url,
            auth_token: None,
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    /// Host (and port, when explicit) as signed into login challenges.
    pub fn host(&self) -> String {
        let host = self.server_url.host_str().unwrap_or_default();
        match self.server_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    pub fn set_token(&mut self, token: Option<&str>) {
        self.auth_token = token.map(str::to_string);
    }

    pub fn has_token(&self) -> bool {
        self.auth_token.is_some()
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    fn url(&self, path: &str, options: Option<&FetchOptions>) -> Result<Url> {
        let mut url = self.server_url.join(API_BASE)?.join(path)?;
        if let Some(options) = options {
            options.apply(&mut url);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
        content_type: &str,
    ) -> Result<Vec<u8>> {
        debug!(%method, path = url.path(), "request");
        let mut request = self
            .inner
            .request(method, url)
            .header(reqwest::header::ACCEPT, CONTENT_TYPE_MSGPACK);
        if let Some(token) = &self.auth_token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?.to_vec();
        if status.is_success() {
            return Ok(bytes);
        }
        Err(map_error(status, &bytes))
    }

    /// Msgpack request with a typed msgpack response.
    pub(crate) async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path, None)?;
        let body = body.map(msgpack_encode).transpose()?;
        let bytes = self.send(method, url, body, CONTENT_TYPE_MSGPACK).await?;
        Ok(msgpack_decode(&bytes)?)
    }

    /// Like [`Client::request`] but with list query options applied.
    pub(crate) async fn request_with_options<B, T>(
        &self,
        method: Method,
        path: &str,
        options: Option<&FetchOptions>,
        body: Option<&B>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path, options)?;
        let body = body.map(msgpack_encode).transpose()?;
        let bytes = self.send(method, url, body, CONTENT_TYPE_MSGPACK).await?;
        Ok(msgpack_decode(&bytes)?)
    }

    /// Msgpack request where the response body is discarded.
    pub(crate) async fn request_no_content<B>(
        &self,
        method: Method,
        path: &str,
        options: Option<&FetchOptions>,
        body: Option<&B>,
    ) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        let url = self.url(path, options)?;
        let body = body.map(msgpack_encode).transpose()?;
        self.send(method, url, body, CONTENT_TYPE_MSGPACK).await?;
        Ok(())
    }

    /// Raw-bytes request (out-of-band chunk transfer).
    pub(crate) async fn request_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let url = self.url(path, None)?;
        self.send(method, url, body, "application/octet-stream")
            .await
    }
}

/// Map an HTTP failure status to the error taxonomy.
fn map_error(status: StatusCode, body: &[u8]) -> Error {
    let parsed: ErrorBody = msgpack_decode(body).unwrap_or_default();
    let detail = parsed.detail.unwrap_or_else(|| status.to_string());
    match status.as_u16() {
        401 => Error::Unauthorized {
            code: parsed.code.unwrap_or_else(|| "unauthorized".into()),
            detail,
        },
        403 => Error::PermissionDenied(detail),
        404 => Error::NotFound(detail),
        409 => Error::Conflict(detail),
        502 | 503 | 504 => Error::TemporaryServer {
            status: status.as_u16(),
            detail,
        },
        code => {
            warn!(%status, "unexpected server response");
            Error::Server {
                status: code,
                detail,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication endpoints
// ---------------------------------------------------------------------------

pub(crate) struct Authenticator<'a> {
    client: &'a Client,
}

impl<'a> Authenticator<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn signup(
        &self,
        user: &User,
        salt: &[u8],
        login_pubkey: &[u8],
        pubkey: &[u8],
        encrypted_content: &[u8],
    ) -> Result<LoginResponse> {
        let body = SignupBody {
            user,
            salt: ByteBuf::from(salt.to_vec()),
            login_pubkey: ByteBuf::from(login_pubkey.to_vec()),
            pubkey: ByteBuf::from(pubkey.to_vec()),
            encrypted_content: ByteBuf::from(encrypted_content.to_vec()),
        };
        self.client
            .request(Method::POST, "authentication/signup/", Some(&body))
            .await
    }

    pub async fn login_challenge(&self, username: &str) -> Result<LoginChallenge> {
        #[derive(Serialize)]
        struct Body<'b> {
            username: &'b str,
        }
        self.client
            .request(
                Method::POST,
                "authentication/login_challenge/",
                Some(&Body { username }),
            )
            .await
    }

    pub async fn login(&self, response: &[u8], signature: &[u8]) -> Result<LoginResponse> {
        let body = SignedRequest {
            response: ByteBuf::from(response.to_vec()),
            signature: ByteBuf::from(signature.to_vec()),
        };
        self.client
            .request(Method::POST, "authentication/login/", Some(&body))
            .await
    }

    pub async fn logout(&self) -> Result<()> {
        self.client
            .request_no_content::<()>(Method::POST, "authentication/logout/", None, None)
            .await
    }

    pub async fn change_password(&self, response: &[u8], signature: &[u8]) -> Result<()> {
        let body = SignedRequest {
            response: ByteBuf::from(response.to_vec()),
            signature: ByteBuf::from(signature.to_vec()),
        };
        self.client
            .request_no_content(
                Method::POST,
                "authentication/change_password/",
                None,
                Some(&body),
            )
            .await
    }

    pub async fn fetch_dashboard_url(&self) -> Result<String> {
        let response: DashboardUrlResponse = self
            .client
            .request::<(), _>(Method::POST, "authentication/dashboard_url/", None)
            .await?;
        Ok(response.url)
    }
}

// ---------------------------------------------------------------------------
// Collection endpoints
// ---------------------------------------------------------------------------

pub(crate) struct CollectionManagerOnline<'a> {
    client: &'a Client,
}

impl<'a> CollectionManagerOnline<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn fetch(
        &self,
        col_uid: &str,
        options: Option<&FetchOptions>,
    ) -> Result<EncryptedCollection> {
        self.client
            .request_with_options::<(), _>(
                Method::GET,
                &format!("collection/{col_uid}/"),
                options,
                None,
            )
            .await
    }

    /// List collections of the given (deterministically encrypted) types.
    pub async fn list(
        &self,
        collection_types: &[&[u8]],
        options: Option<&FetchOptions>,
    ) -> Result<CollectionListResponse> {
        let body = CollectionListBody {
            collection_types: collection_types
                .iter()
                .map(|bytes| ByteBuf::from(bytes.to_vec()))
                .collect(),
        };
        self.client
            .request_with_options(
                Method::POST,
                "collection/list_multi/",
                options,
                Some(&body),
            )
            .await
    }

    pub async fn create(
        &self,
        collection: &EncryptedCollection,
        options: Option<&FetchOptions>,
    ) -> Result<()> {
        self.client
            .request_no_content(Method::POST, "collection/", options, Some(collection))
            .await
    }
}

// ---------------------------------------------------------------------------
// Item endpoints
// ---------------------------------------------------------------------------

pub(crate) struct ItemManagerOnline<'a> {
    client: &'a Client,
    base: String,
}

impl<'a> ItemManagerOnline<'a> {
    pub fn new(client: &'a Client, col_uid: &str) -> Self {
        Self {
            client,
            base: format!("collection/{col_uid}/item/"),
        }
    }

    pub async fn fetch(
        &self,
        item_uid: &str,
        options: Option<&FetchOptions>,
    ) -> Result<EncryptedItem> {
        self.client
            .request_with_options::<(), _>(
                Method::GET,
                &format!("{}{item_uid}/", self.base),
                options,
                None,
            )
            .await
    }

    pub async fn list(
        &self,
        options: Option<&FetchOptions>,
    ) -> Result<ListResponse<EncryptedItem>> {
        self.client
            .request_with_options::<(), _>(Method::GET, &self.base, options, None)
            .await
    }

    pub async fn item_revisions(
        &self,
        item_uid: &str,
        options: Option<&FetchOptions>,
    ) -> Result<IteratorListResponse<EncryptedRevision>> {
        self.client
            .request_with_options::<(), _>(
                Method::GET,
                &format!("{}{item_uid}/revision/", self.base),
                options,
                None,
            )
            .await
    }

    /// Ask which of `(uid, etag)` pairs changed server-side.
    pub async fn fetch_updates(
        &self,
        items: &[ItemDep<'_>],
        options: Option<&FetchOptions>,
    ) -> Result<ListResponse<EncryptedItem>> {
        self.client
            .request_with_options(
                Method::POST,
                &format!("{}fetch_updates/", self.base),
                options,
                Some(&items),
            )
            .await
    }

    pub async fn batch(
        &self,
        items: &[&EncryptedItem],
        deps: Option<&[ItemDep<'_>]>,
        options: Option<&FetchOptions>,
    ) -> Result<()> {
        let body = ItemBatchBody { items, deps };
        let url_path = format!("{}batch/", self.base);
        self.client
            .request_no_content(Method::POST, &url_path, options, Some(&body))
            .await
    }

    pub async fn transaction(
        &self,
        items: &[&EncryptedItem],
        deps: Option<&[ItemDep<'_>]>,
        options: Option<&FetchOptions>,
    ) -> Result<()> {
        let body = ItemBatchBody { items, deps };
        let url_path = format!("{}transaction/", self.base);
        self.client
            .request_no_content(Method::POST, &url_path, options, Some(&body))
            .await
    }

    /// Upload one chunk out of band. A conflict means the server already
    /// has it, which is success for our purposes.
    pub async fn chunk_upload(&self, item_uid: &str, chunk_uid: &str, blob: &[u8]) -> Result<()> {
        let path = format!("{}{item_uid}/chunk/{chunk_uid}/", self.base);
        match self
            .client
            .request_raw(Method::PUT, &path, Some(blob.to_vec()))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn chunk_download(&self, item_uid: &str, chunk_uid: &str) -> Result<Vec<u8>> {
        let path = format!("{}{item_uid}/chunk/{chunk_uid}/download/", self.base);
        self.client.request_raw(Method::GET, &path, None).await
    }
}

// ---------------------------------------------------------------------------
// Invitation endpoints
// ---------------------------------------------------------------------------

pub(crate) struct InvitationManagerOnline<'a> {
    client: &'a Client,
}

impl<'a> InvitationManagerOnline<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn list_incoming(
        &self,
        options: Option<&FetchOptions>,
    ) -> Result<IteratorListResponse<SignedInvitation>> {
        self.client
            .request_with_options::<(), _>(Method::GET, "invitation/incoming/", options, None)
            .await
    }

    pub async fn list_outgoing(
        &self,
        options: Option<&FetchOptions>,
    ) -> Result<IteratorListResponse<SignedInvitation>> {
        self.client
            .request_with_options::<(), _>(Method::GET, "invitation/outgoing/", options, None)
            .await
    }

    pub async fn accept(
        &self,
        invitation: &SignedInvitation,
        collection_type_uid: &[u8],
        encryption_key: &[u8],
    ) -> Result<()> {
        let body = InvitationAcceptBody {
            collection_type: collection_type_uid,
            encryption_key,
        };
        self.client
            .request_no_content(
                Method::POST,
                &format!("invitation/incoming/{}/accept/", invitation.uid()),
                None,
                Some(&body),
            )
            .await
    }

    pub async fn reject(&self, invitation: &SignedInvitation) -> Result<()> {
        self.client
            .request_no_content::<()>(
                Method::DELETE,
                &format!("invitation/incoming/{}/", invitation.uid()),
                None,
                None,
            )
            .await
    }

    pub async fn disinvite(&self, invitation: &SignedInvitation) -> Result<()> {
        self.client
            .request_no_content::<()>(
                Method::DELETE,
                &format!("invitation/outgoing/{}/", invitation.uid()),
                None,
                None,
            )
            .await
    }

    pub async fn fetch_user_profile(&self, username: &str) -> Result<UserProfile> {
        let mut path = String::from("invitation/outgoing/fetch_user_profile/");
        path.push_str(&format!("?username={username}"));
        self.client.request::<(), _>(Method::GET, &path, None).await
    }

    pub async fn invite(&self, invitation: &SignedInvitation) -> Result<()> {
        self.client
            .request_no_content(Method::POST, "invitation/outgoing/", None, Some(invitation))
            .await
    }
}

// ---------------------------------------------------------------------------
// Member endpoints
// ---------------------------------------------------------------------------

pub(crate) struct MemberManagerOnline<'a> {
    client: &'a Client,
    base: String,
}

impl<'a> MemberManagerOnline<'a> {
    pub fn new(client: &'a Client, col_uid: &str) -> Self {
        Self {
            client,
            base: format!("collection/{col_uid}/member/"),
        }
    }

    pub async fn list(
        &self,
        options: Option<&FetchOptions>,
    ) -> Result<IteratorListResponse<CollectionMember>> {
        self.client
            .request_with_options::<(), _>(Method::GET, &self.base, options, None)
            .await
    }

    pub async fn remove(&self, username: &str) -> Result<()> {
        self.client
            .request_no_content::<()>(
                Method::DELETE,
                &format!("{}{username}/", self.base),
                None,
                None,
            )
            .await
    }

    pub async fn leave(&self) -> Result<()> {
        self.client
            .request_no_content::<()>(Method::POST, &format!("{}leave/", self.base), None, None)
            .await
    }

    pub async fn modify_access_level(
        &self,
        username: &str,
        access_level: AccessLevel,
    ) -> Result<()> {
        let body = MemberPatchBody { access_level };
        self.client
            .request_no_content(
                Method::PATCH,
                &format!("{}{username}/", self.base),
                None,
                Some(&body),
            )
            .await
    }
}
