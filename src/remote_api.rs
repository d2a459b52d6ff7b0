//! Client for the cloud drive API.
//!
//! The engine only depends on the [`DriveApi`] trait. [`HttpDrive`] is the
//! production implementation over HTTPS with bearer-token auth and a single
//! refresh attempt on 401. [`InMemoryDrive`] is a deterministic in-memory
//! drive used by tests, mirroring how the filesystem layer exports its own
//! in-memory backend.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExitCause, ExitCode, ExitInfo, SyncResult};
use crate::types::{NodeId, NodeType, SyncTime};

/// Default timeout for unary HTTP jobs. Download/upload streams override it.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for streaming transfers.
pub const STREAM_HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// One item as described by the drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub size: i64,
    pub created_at: SyncTime,
    pub modified_at: SyncTime,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default = "default_true")]
    pub can_write: bool,
}

fn default_true() -> bool {
    true
}

/// Action codes delivered by the long-poll listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCode {
    Create,
    Restore,
    MoveIn,
    Rename,
    Edit,
    AccessRightUpdate,
    Trash,
    Delete,
    MoveOut,
    AclInsert,
    AclUpdate,
    AclRemove,
}

impl ActionCode {
    /// How the remote observer mutates its snapshot for this action.
    pub fn mutation(&self) -> SnapshotMutation {
        match self {
            ActionCode::Create | ActionCode::Restore | ActionCode::MoveIn => {
                SnapshotMutation::Insert
            }
            ActionCode::Rename | ActionCode::Edit | ActionCode::AccessRightUpdate => {
                SnapshotMutation::Update
            }
            ActionCode::Trash | ActionCode::Delete | ActionCode::MoveOut => {
                SnapshotMutation::Remove
            }
            ActionCode::AclInsert | ActionCode::AclUpdate | ActionCode::AclRemove => {
                SnapshotMutation::UpdateRights
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMutation {
    Insert,
    Update,
    Remove,
    UpdateRights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub action: ActionCode,
    pub item: RemoteItem,
    #[serde(default)]
    pub path: Option<String>,
}

/// One page of the bootstrap full listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPage {
    pub items: Vec<RemoteItem>,
    pub cursor: String,
    pub has_more: bool,
}

/// One long-poll batch of changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<RemoteChange>,
    pub cursor: String,
}

/// Declares a new chunked upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartRequest {
    pub total_size: u64,
    pub total_chunks: u64,
    /// Set when creating a new file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    /// Set when replacing the content of an existing file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<NodeId>,
}

/// A streaming download: reader plus the metadata needed to drive it.
pub struct DownloadStream {
    pub reader: Box<dyn Read + Send>,
    pub content_length: Option<u64>,
    pub mime_type: Option<String>,
}

/// The operations the engine issues against the drive.
pub trait DriveApi: Send + Sync {
    /// Bootstrap full listing (paginated, recursive). `cursor` resumes a
    /// partially fetched bootstrap.
    fn bootstrap_listing(&self, cursor: Option<&str>, limit: usize) -> SyncResult<ListingPage>;

    /// Long-poll for changes after `cursor`. Returns an empty batch on
    /// timeout without changes.
    fn continue_listing(&self, cursor: &str) -> SyncResult<ChangeBatch>;

    /// Single-shot upload with `conflict=error` semantics.
    fn upload(
        &self,
        parent_id: &NodeId,
        name: &str,
        data: &[u8],
        content_hash: &str,
        created: SyncTime,
        modified: SyncTime,
    ) -> SyncResult<RemoteItem>;

    fn start_upload_session(&self, request: &SessionStartRequest) -> SyncResult<String>;

    fn upload_chunk(
        &self,
        token: &str,
        chunk_number: u64,
        chunk_hash: &str,
        data: &[u8],
    ) -> SyncResult<()>;

    fn finish_upload_session(
        &self,
        token: &str,
        total_chunk_hash: &str,
    ) -> SyncResult<RemoteItem>;

    fn cancel_upload_session(&self, token: &str) -> SyncResult<()>;

    fn download(&self, file_id: &NodeId) -> SyncResult<DownloadStream>;

    /// Move and optionally rename in one call.
    fn move_item(
        &self,
        file_id: &NodeId,
        dest_parent_id: &NodeId,
        new_name: Option<&str>,
    ) -> SyncResult<()>;

    fn create_dir(&self, parent_id: &NodeId, name: &str) -> SyncResult<RemoteItem>;

    fn delete(&self, file_id: &NodeId) -> SyncResult<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// OAuth2 token pair. `refresh` is long-lived; `access` expires and is
/// renewed through the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

/// OAuth2 client for the drive's token endpoint.
pub struct AuthClient {
    client: reqwest::blocking::Client,
    token_url: String,
    client_id: String,
}

impl AuthClient {
    pub fn new(token_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .expect("Could not build HTTP client");
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
        }
    }

    pub fn token_from_authorization_code(&self, code: &str) -> SyncResult<TokenPair> {
        self.token_request(&[("grant_type", "authorization_code"), ("code", code)])
    }

    pub fn token_from_password(&self, username: &str, password: &str) -> SyncResult<TokenPair> {
        self.token_request(&[
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ])
    }

    pub fn refresh(&self, refresh_token: &str) -> SyncResult<TokenPair> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
    }

    fn token_request(&self, fields: &[(&str, &str)]) -> SyncResult<TokenPair> {
        let mut form: Vec<(&str, &str)> = vec![("client_id", &self.client_id)];
        form.extend_from_slice(fields);

        let response = self.client.post(&self.token_url).form(&form).send()?;

        if !response.status().is_success() {
            log::warn!("Token endpoint returned {}", response.status());
            return Err(ExitInfo::new(ExitCode::InvalidToken, ExitCause::LoginError));
        }

        let body: TokenResponse = response
            .json()
            .map_err(|_| ExitInfo::new(ExitCode::DataError, ExitCause::LoginError))?;

        Ok(TokenPair {
            access: body.access_token,
            refresh: body.refresh_token,
        })
    }
}

fn exit_info_for_status(status: reqwest::StatusCode) -> ExitInfo {
    use reqwest::StatusCode;

    match status {
        StatusCode::UNAUTHORIZED => ExitInfo::new(ExitCode::InvalidToken, ExitCause::LoginError),
        StatusCode::FORBIDDEN => {
            ExitInfo::new(ExitCode::BackError, ExitCause::HttpErrForbidden)
        }
        StatusCode::NOT_FOUND => ExitInfo::new(ExitCode::BackError, ExitCause::NotFound),
        StatusCode::CONFLICT => ExitInfo::new(ExitCode::BackError, ExitCause::FileExists),
        StatusCode::GONE => ExitInfo::new(ExitCode::DataError, ExitCause::InvalidSnapshot),
        StatusCode::PAYLOAD_TOO_LARGE => {
            ExitInfo::new(ExitCode::BackError, ExitCause::FileTooBig)
        }
        StatusCode::TOO_MANY_REQUESTS => ExitInfo::from(ExitCode::RateLimited),
        StatusCode::INSUFFICIENT_STORAGE => {
            ExitInfo::new(ExitCode::BackError, ExitCause::QuotaExceeded)
        }
        _ => ExitInfo::from(ExitCode::BackError),
    }
}

/// Production drive client over HTTPS.
pub struct HttpDrive {
    client: reqwest::blocking::Client,
    base_url: String,
    drive_id: String,
    auth: AuthClient,
    tokens: Mutex<TokenPair>,
}

impl HttpDrive {
    pub fn new(
        base_url: impl Into<String>,
        drive_id: impl Into<String>,
        auth: AuthClient,
        tokens: TokenPair,
    ) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .expect("Could not build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            drive_id: drive_id.into(),
            auth,
            tokens: Mutex::new(tokens),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/drives/{}/{}", self.base_url, self.drive_id, suffix)
    }

    fn access_token(&self) -> String {
        self.tokens.lock().unwrap().access.clone()
    }

    /// Run a request, refreshing the access token once on 401. A refresh
    /// failure surfaces as `InvalidToken` and pauses the sync upstream.
    fn send_with_refresh(
        &self,
        build: impl Fn(&str) -> reqwest::blocking::RequestBuilder,
    ) -> SyncResult<reqwest::blocking::Response> {
        let response = build(&self.access_token()).send()?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Self::check_status(response);
        }

        log::info!("Access token rejected; attempting refresh");
        let refreshed = {
            let mut tokens = self.tokens.lock().unwrap();
            let new_pair = self.auth.refresh(&tokens.refresh)?;
            *tokens = new_pair.clone();
            new_pair
        };

        let retried = build(&refreshed.access).send()?;
        Self::check_status(retried)
    }

    fn check_status(
        response: reqwest::blocking::Response,
    ) -> SyncResult<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            log::warn!("Drive API returned HTTP {}", status);
            Err(exit_info_for_status(status))
        }
    }
}

impl DriveApi for HttpDrive {
    fn bootstrap_listing(&self, cursor: Option<&str>, limit: usize) -> SyncResult<ListingPage> {
        let url = self.url("files/listing");
        let response = self.send_with_refresh(|token| {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(token)
                .query(&[("recursive", "true"), ("limit", &limit.to_string())]);
            if let Some(cursor) = cursor {
                request = request.query(&[("cursor", cursor)]);
            }
            request
        })?;

        response
            .json()
            .map_err(|_| ExitInfo::from(ExitCode::DataError))
    }

    fn continue_listing(&self, cursor: &str) -> SyncResult<ChangeBatch> {
        let url = self.url("files/listing/continue");
        let response = self.send_with_refresh(|token| {
            self.client
                .get(&url)
                .bearer_auth(token)
                .timeout(STREAM_HTTP_TIMEOUT)
                .query(&[("cursor", cursor)])
        })?;

        response
            .json()
            .map_err(|_| ExitInfo::from(ExitCode::DataError))
    }

    fn upload(
        &self,
        parent_id: &NodeId,
        name: &str,
        data: &[u8],
        content_hash: &str,
        created: SyncTime,
        modified: SyncTime,
    ) -> SyncResult<RemoteItem> {
        let url = self.url("upload");
        let response = self.send_with_refresh(|token| {
            self.client
                .post(&url)
                .bearer_auth(token)
                .timeout(STREAM_HTTP_TIMEOUT)
                .query(&[
                    ("conflict", "error"),
                    ("file_name", name),
                    ("directory_id", parent_id.as_str()),
                    ("total_hash", content_hash),
                    ("created_at", &created.to_string()),
                    ("last_modified_at", &modified.to_string()),
                ])
                .body(data.to_vec())
        })?;

        response
            .json()
            .map_err(|_| ExitInfo::from(ExitCode::DataError))
    }

    fn start_upload_session(&self, request: &SessionStartRequest) -> SyncResult<String> {
        #[derive(Deserialize)]
        struct StartResponse {
            token: String,
        }

        let url = self.url("upload/session/start");
        let response = self.send_with_refresh(|token| {
            self.client.post(&url).bearer_auth(token).json(request)
        })?;

        let body: StartResponse = response
            .json()
            .map_err(|_| ExitInfo::from(ExitCode::DataError))?;
        Ok(body.token)
    }

    fn upload_chunk(
        &self,
        token: &str,
        chunk_number: u64,
        chunk_hash: &str,
        data: &[u8],
    ) -> SyncResult<()> {
        let url = self.url(&format!("upload/session/{token}/chunk"));
        self.send_with_refresh(|access| {
            self.client
                .post(&url)
                .bearer_auth(access)
                .timeout(STREAM_HTTP_TIMEOUT)
                .query(&[
                    ("chunk_number", chunk_number.to_string()),
                    ("chunk_size", data.len().to_string()),
                    ("chunk_hash", chunk_hash.to_string()),
                ])
                .body(data.to_vec())
        })?;
        Ok(())
    }

    fn finish_upload_session(
        &self,
        token: &str,
        total_chunk_hash: &str,
    ) -> SyncResult<RemoteItem> {
        #[derive(Serialize)]
        struct FinishRequest<'a> {
            total_chunk_hash: &'a str,
        }

        let url = self.url(&format!("upload/session/{token}/finish"));
        let response = self.send_with_refresh(|access| {
            self.client
                .post(&url)
                .bearer_auth(access)
                .json(&FinishRequest { total_chunk_hash })
        })?;

        response
            .json()
            .map_err(|_| ExitInfo::from(ExitCode::DataError))
    }

    fn cancel_upload_session(&self, token: &str) -> SyncResult<()> {
        let url = self.url(&format!("upload/session/{token}"));
        self.send_with_refresh(|access| self.client.delete(&url).bearer_auth(access))?;
        Ok(())
    }

    fn download(&self, file_id: &NodeId) -> SyncResult<DownloadStream> {
        let url = self.url(&format!("files/{}/download", file_id));
        let response = self.send_with_refresh(|token| {
            self.client
                .get(&url)
                .bearer_auth(token)
                .timeout(STREAM_HTTP_TIMEOUT)
        })?;

        let content_length = response.content_length();
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_owned());

        Ok(DownloadStream {
            reader: Box::new(response),
            content_length,
            mime_type,
        })
    }

    fn move_item(
        &self,
        file_id: &NodeId,
        dest_parent_id: &NodeId,
        new_name: Option<&str>,
    ) -> SyncResult<()> {
        #[derive(Serialize)]
        struct MoveRequest<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            name: Option<&'a str>,
        }

        let url = self.url(&format!("files/{}/move/{}", file_id, dest_parent_id));
        self.send_with_refresh(|token| {
            self.client
                .post(&url)
                .bearer_auth(token)
                .json(&MoveRequest { name: new_name })
        })?;
        Ok(())
    }

    fn create_dir(&self, parent_id: &NodeId, name: &str) -> SyncResult<RemoteItem> {
        #[derive(Serialize)]
        struct CreateDirRequest<'a> {
            parent_id: &'a str,
            name: &'a str,
        }

        let url = self.url("directories");
        let response = self.send_with_refresh(|token| {
            self.client.post(&url).bearer_auth(token).json(&CreateDirRequest {
                parent_id: parent_id.as_str(),
                name,
            })
        })?;

        response
            .json()
            .map_err(|_| ExitInfo::from(ExitCode::DataError))
    }

    fn delete(&self, file_id: &NodeId) -> SyncResult<()> {
        let url = self.url(&format!("files/{}", file_id));
        self.send_with_refresh(|token| self.client.delete(&url).bearer_auth(token))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation for tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SessionState {
    request: SessionStartRequest,
    chunks: HashMap<u64, (String, Vec<u8>)>,
    canceled: bool,
}

struct DriveInner {
    root_id: NodeId,
    items: HashMap<NodeId, RemoteItem>,
    contents: HashMap<NodeId, Vec<u8>>,
    change_log: Vec<RemoteChange>,
    next_id: u64,
    next_token: u64,
    sessions: HashMap<String, SessionState>,
    clock: SyncTime,
    /// When set, history before this log index is lost and stale cursors
    /// are rejected, like a drive that expired its change feed.
    history_floor: usize,
}

/// Deterministic in-memory drive. Tests drive the "remote user" through the
/// mutator methods; the engine sees the same trait surface as production.
#[derive(Clone)]
pub struct InMemoryDrive {
    inner: Arc<Mutex<DriveInner>>,
}

impl InMemoryDrive {
    pub fn new() -> Self {
        let root_id = NodeId::from("drive-root");
        let mut items = HashMap::new();
        items.insert(
            root_id.clone(),
            RemoteItem {
                id: root_id.clone(),
                parent_id: root_id.clone(),
                name: String::new(),
                node_type: NodeType::Directory,
                size: 0,
                created_at: 0,
                modified_at: 0,
                mime_type: None,
                can_write: true,
            },
        );

        Self {
            inner: Arc::new(Mutex::new(DriveInner {
                root_id,
                items,
                contents: HashMap::new(),
                change_log: Vec::new(),
                next_id: 1,
                next_token: 1,
                sessions: HashMap::new(),
                clock: 2_000_000,
                history_floor: 0,
            })),
        }
    }

    pub fn root_id(&self) -> NodeId {
        self.inner.lock().unwrap().root_id.clone()
    }

    /// Simulate the server expiring its change history: previously handed
    /// out cursors become invalid and force a bootstrap.
    pub fn expire_history(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.history_floor = inner.change_log.len();
    }

    pub fn item(&self, id: &NodeId) -> Option<RemoteItem> {
        self.inner.lock().unwrap().items.get(id).cloned()
    }

    pub fn content(&self, id: &NodeId) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().contents.get(id).cloned()
    }

    /// Resolve a `/`-separated path from the root.
    pub fn item_at_path(&self, path: &str) -> Option<RemoteItem> {
        let inner = self.inner.lock().unwrap();
        let mut current = inner.root_id.clone();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            let child = inner
                .items
                .values()
                .find(|item| item.parent_id == current && item.name == segment && item.id != inner.root_id)?;
            current = child.id.clone();
        }
        inner.items.get(&current).cloned()
    }

    pub fn open_session_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .values()
            .filter(|session| !session.canceled)
            .count()
    }

    /// Test-side mutation: create a directory as if a remote user did it.
    pub fn remote_mkdir(&self, parent_id: &NodeId, name: &str) -> NodeId {
        let mut inner = self.inner.lock().unwrap();
        inner.insert_item(parent_id.clone(), name, NodeType::Directory, Vec::new())
    }

    /// Test-side mutation: create or replace a file as a remote user.
    pub fn remote_write(&self, parent_id: &NodeId, name: &str, data: &[u8]) -> NodeId {
        let mut inner = self.inner.lock().unwrap();

        let existing = inner
            .items
            .values()
            .find(|item| item.parent_id == *parent_id && item.name == name)
            .map(|item| item.id.clone());

        match existing {
            Some(id) => {
                inner.clock += 1;
                let stamp = inner.clock;
                if let Some(item) = inner.items.get_mut(&id) {
                    item.size = data.len() as i64;
                    item.modified_at = stamp;
                }
                inner.contents.insert(id.clone(), data.to_vec());
                inner.log_change(ActionCode::Edit, &id);
                id
            }
            None => inner.insert_item(parent_id.clone(), name, NodeType::File, data.to_vec()),
        }
    }

    /// Test-side mutation: delete an item as a remote user.
    pub fn remote_delete(&self, id: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove_subtree(id, ActionCode::Delete);
    }

    /// Test-side mutation: move/rename an item as a remote user.
    pub fn remote_move(&self, id: &NodeId, new_parent: &NodeId, new_name: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let stamp = inner.clock;
        if let Some(item) = inner.items.get_mut(id) {
            item.parent_id = new_parent.clone();
            if let Some(name) = new_name {
                item.name = name.to_owned();
            }
            item.modified_at = stamp;
        }
        inner.log_change(ActionCode::MoveIn, id);
    }
}

impl Default for InMemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveInner {
    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId::from(format!("r{}", self.next_id));
        self.next_id += 1;
        id
    }

    fn insert_item(
        &mut self,
        parent_id: NodeId,
        name: &str,
        node_type: NodeType,
        data: Vec<u8>,
    ) -> NodeId {
        let id = self.alloc_id();
        self.clock += 1;

        let item = RemoteItem {
            id: id.clone(),
            parent_id,
            name: name.to_owned(),
            node_type,
            size: data.len() as i64,
            created_at: self.clock,
            modified_at: self.clock,
            mime_type: None,
            can_write: true,
        };
        self.items.insert(id.clone(), item);
        if node_type == NodeType::File {
            self.contents.insert(id.clone(), data);
        }
        self.log_change(ActionCode::Create, &id);
        id
    }

    fn remove_subtree(&mut self, id: &NodeId, action: ActionCode) {
        let children: Vec<NodeId> = self
            .items
            .values()
            .filter(|item| item.parent_id == *id && item.id != self.root_id)
            .map(|item| item.id.clone())
            .collect();
        for child in children {
            self.remove_subtree(&child, action);
        }

        if let Some(item) = self.items.remove(id) {
            self.contents.remove(id);
            self.change_log.push(RemoteChange {
                action,
                item,
                path: None,
            });
        }
    }

    fn log_change(&mut self, action: ActionCode, id: &NodeId) {
        if let Some(item) = self.items.get(id) {
            self.change_log.push(RemoteChange {
                action,
                item: item.clone(),
                path: None,
            });
        }
    }

    fn cursor(&self) -> String {
        self.change_log.len().to_string()
    }

    fn find_child(&self, parent_id: &NodeId, name: &str) -> Option<&RemoteItem> {
        self.items
            .values()
            .find(|item| item.parent_id == *parent_id && item.name == name && item.id != self.root_id)
    }
}

impl DriveApi for InMemoryDrive {
    fn bootstrap_listing(&self, cursor: Option<&str>, limit: usize) -> SyncResult<ListingPage> {
        let inner = self.inner.lock().unwrap();

        let mut all: Vec<&RemoteItem> = inner
            .items
            .values()
            .filter(|item| item.id != inner.root_id)
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));

        let offset: usize = cursor
            .and_then(|cursor| cursor.strip_prefix("bootstrap:"))
            .and_then(|offset| offset.parse().ok())
            .unwrap_or(0);

        let page: Vec<RemoteItem> = all.iter().skip(offset).take(limit).map(|&i| i.clone()).collect();
        let has_more = offset + page.len() < all.len();

        let next_cursor = if has_more {
            format!("bootstrap:{}", offset + page.len())
        } else {
            inner.cursor()
        };

        Ok(ListingPage {
            items: page,
            cursor: next_cursor,
            has_more,
        })
    }

    fn continue_listing(&self, cursor: &str) -> SyncResult<ChangeBatch> {
        let inner = self.inner.lock().unwrap();

        let position: usize = cursor
            .parse()
            .map_err(|_| ExitInfo::new(ExitCode::DataError, ExitCause::InvalidSnapshot))?;

        if position < inner.history_floor || position > inner.change_log.len() {
            // Lost history: the client must rebuild from a fresh bootstrap.
            return Err(ExitInfo::new(ExitCode::DataError, ExitCause::InvalidSnapshot));
        }

        Ok(ChangeBatch {
            changes: inner.change_log[position..].to_vec(),
            cursor: inner.cursor(),
        })
    }

    fn upload(
        &self,
        parent_id: &NodeId,
        name: &str,
        data: &[u8],
        _content_hash: &str,
        created: SyncTime,
        modified: SyncTime,
    ) -> SyncResult<RemoteItem> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.items.contains_key(parent_id) {
            return Err(ExitInfo::new(ExitCode::BackError, ExitCause::NotFound));
        }
        if inner.find_child(parent_id, name).is_some() {
            // conflict=error
            return Err(ExitInfo::new(ExitCode::BackError, ExitCause::FileExists));
        }

        let id = inner.insert_item(parent_id.clone(), name, NodeType::File, data.to_vec());
        if let Some(item) = inner.items.get_mut(&id) {
            item.created_at = created;
            item.modified_at = modified;
        }
        // Re-log so the change feed carries the final timestamps.
        inner.change_log.pop();
        inner.log_change(ActionCode::Create, &id);
        Ok(inner.items.get(&id).cloned().unwrap())
    }

    fn start_upload_session(&self, request: &SessionStartRequest) -> SyncResult<String> {
        let mut inner = self.inner.lock().unwrap();
        let token = format!("session-{}", inner.next_token);
        inner.next_token += 1;
        inner.sessions.insert(
            token.clone(),
            SessionState {
                request: request.clone(),
                chunks: HashMap::new(),
                canceled: false,
            },
        );
        Ok(token)
    }

    fn upload_chunk(
        &self,
        token: &str,
        chunk_number: u64,
        chunk_hash: &str,
        data: &[u8],
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(token)
            .ok_or_else(|| ExitInfo::new(ExitCode::BackError, ExitCause::NotFound))?;
        if session.canceled {
            return Err(ExitInfo::new(
                ExitCode::OperationCanceled,
                ExitCause::OperationCanceled,
            ));
        }
        session
            .chunks
            .insert(chunk_number, (chunk_hash.to_owned(), data.to_vec()));
        Ok(())
    }

    fn finish_upload_session(
        &self,
        token: &str,
        total_chunk_hash: &str,
    ) -> SyncResult<RemoteItem> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .remove(token)
            .ok_or_else(|| ExitInfo::new(ExitCode::BackError, ExitCause::NotFound))?;

        if session.chunks.len() as u64 != session.request.total_chunks {
            return Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::FileOrDirectoryCorrupted,
            ));
        }

        // Recompute the rolling hash over the chunk hashes in chunk order
        // and verify end-to-end integrity.
        let mut numbers: Vec<u64> = session.chunks.keys().copied().collect();
        numbers.sort_unstable();
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        let mut data = Vec::new();
        for number in &numbers {
            let (hash, chunk) = &session.chunks[number];
            hasher.update(hash.as_bytes());
            data.extend_from_slice(chunk);
        }
        let expected = format!("{:016x}", hasher.digest());
        if expected != total_chunk_hash {
            return Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::FileOrDirectoryCorrupted,
            ));
        }

        if data.len() as u64 != session.request.total_size {
            return Err(ExitInfo::new(
                ExitCode::DataError,
                ExitCause::FileOrDirectoryCorrupted,
            ));
        }

        let id = match (&session.request.file_id, &session.request.file_name) {
            (Some(file_id), _) => {
                if !inner.items.contains_key(file_id) {
                    return Err(ExitInfo::new(ExitCode::BackError, ExitCause::NotFound));
                }
                inner.clock += 1;
                let stamp = inner.clock;
                let len = data.len() as i64;
                if let Some(item) = inner.items.get_mut(file_id) {
                    item.size = len;
                    item.modified_at = stamp;
                }
                inner.contents.insert(file_id.clone(), data);
                inner.log_change(ActionCode::Edit, file_id);
                file_id.clone()
            }
            (None, Some(name)) => {
                let parent = session
                    .request
                    .parent_id
                    .clone()
                    .unwrap_or_else(|| inner.root_id.clone());
                inner.insert_item(parent, name, NodeType::File, data)
            }
            (None, None) => {
                return Err(ExitInfo::new(ExitCode::DataError, ExitCause::InvalidName));
            }
        };

        Ok(inner.items.get(&id).cloned().unwrap())
    }

    fn cancel_upload_session(&self, token: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.remove(token) {
            Some(_) => Ok(()),
            None => Err(ExitInfo::new(ExitCode::BackError, ExitCause::NotFound)),
        }
    }

    fn download(&self, file_id: &NodeId) -> SyncResult<DownloadStream> {
        let inner = self.inner.lock().unwrap();
        let item = inner
            .items
            .get(file_id)
            .ok_or_else(|| ExitInfo::new(ExitCode::BackError, ExitCause::NotFound))?;
        let contents = inner.contents.get(file_id).cloned().unwrap_or_default();

        Ok(DownloadStream {
            content_length: Some(contents.len() as u64),
            mime_type: item.mime_type.clone(),
            reader: Box::new(std::io::Cursor::new(contents)),
        })
    }

    fn move_item(
        &self,
        file_id: &NodeId,
        dest_parent_id: &NodeId,
        new_name: Option<&str>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.items.contains_key(file_id) || !inner.items.contains_key(dest_parent_id) {
            return Err(ExitInfo::new(ExitCode::BackError, ExitCause::NotFound));
        }

        let final_name = new_name
            .map(|name| name.to_owned())
            .unwrap_or_else(|| inner.items[file_id].name.clone());
        if inner
            .find_child(dest_parent_id, &final_name)
            .is_some_and(|occupant| occupant.id != *file_id)
        {
            return Err(ExitInfo::new(
                ExitCode::BackError,
                ExitCause::InvalidDestination,
            ));
        }

        inner.clock += 1;
        let stamp = inner.clock;
        if let Some(item) = inner.items.get_mut(file_id) {
            item.parent_id = dest_parent_id.clone();
            item.name = final_name;
            item.modified_at = stamp;
        }
        inner.log_change(ActionCode::MoveIn, file_id);
        Ok(())
    }

    fn create_dir(&self, parent_id: &NodeId, name: &str) -> SyncResult<RemoteItem> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.items.contains_key(parent_id) {
            return Err(ExitInfo::new(ExitCode::BackError, ExitCause::NotFound));
        }
        if inner.find_child(parent_id, name).is_some() {
            return Err(ExitInfo::new(ExitCode::BackError, ExitCause::FileExists));
        }

        let id = inner.insert_item(parent_id.clone(), name, NodeType::Directory, Vec::new());
        Ok(inner.items.get(&id).cloned().unwrap())
    }

    fn delete(&self, file_id: &NodeId) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.items.contains_key(file_id) {
            return Err(ExitInfo::new(ExitCode::BackError, ExitCause::NotFound));
        }
        inner.remove_subtree(file_id, ActionCode::Delete);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn action_codes_map_to_snapshot_mutations() {
        assert_eq!(ActionCode::Create.mutation(), SnapshotMutation::Insert);
        assert_eq!(ActionCode::Rename.mutation(), SnapshotMutation::Update);
        assert_eq!(ActionCode::Trash.mutation(), SnapshotMutation::Remove);
        assert_eq!(ActionCode::AclUpdate.mutation(), SnapshotMutation::UpdateRights);
    }

    #[test]
    fn in_memory_drive_upload_conflict_is_error() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();

        drive.upload(&root, "a.txt", b"one", "h1", 1, 1).unwrap();
        let err = drive.upload(&root, "a.txt", b"two", "h2", 2, 2).unwrap_err();
        assert_eq!(err.cause(), ExitCause::FileExists);
    }

    #[test]
    fn change_log_cursor_advances_with_mutations() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();

        let bootstrap = drive.bootstrap_listing(None, 100).unwrap();
        assert!(!bootstrap.has_more);

        drive.remote_write(&root, "a.txt", b"x");
        let batch = drive.continue_listing(&bootstrap.cursor).unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].action, ActionCode::Create);

        // Replaying the new cursor yields nothing further.
        let empty = drive.continue_listing(&batch.cursor).unwrap();
        assert!(empty.changes.is_empty());
    }

    #[test]
    fn expired_history_rejects_stale_cursor() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        let bootstrap = drive.bootstrap_listing(None, 100).unwrap();

        drive.remote_write(&root, "a.txt", b"x");
        drive.expire_history();

        let err = drive.continue_listing(&bootstrap.cursor).unwrap_err();
        assert_eq!(err.cause(), ExitCause::InvalidSnapshot);
    }

    #[test]
    fn bootstrap_pagination_covers_all_items() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        for index in 0..25 {
            drive.remote_write(&root, &format!("f{index}.txt"), b"x");
        }

        let mut cursor: Option<String> = None;
        let mut seen = 0;
        loop {
            let page = drive.bootstrap_listing(cursor.as_deref(), 10).unwrap();
            seen += page.items.len();
            if !page.has_more {
                break;
            }
            cursor = Some(page.cursor);
        }
        assert_eq!(seen, 25);
    }

    #[test]
    fn session_round_trip_verifies_rolling_hash() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();

        let token = drive
            .start_upload_session(&SessionStartRequest {
                total_size: 6,
                total_chunks: 2,
                file_name: Some("big.bin".into()),
                parent_id: Some(root.clone()),
                file_id: None,
            })
            .unwrap();

        let h1 = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(b"abc"));
        let h2 = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(b"def"));
        drive.upload_chunk(&token, 1, &h1, b"abc").unwrap();
        drive.upload_chunk(&token, 2, &h2, b"def").unwrap();

        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        hasher.update(h1.as_bytes());
        hasher.update(h2.as_bytes());
        let total = format!("{:016x}", hasher.digest());

        let item = drive.finish_upload_session(&token, &total).unwrap();
        assert_eq!(item.size, 6);
        assert_eq!(drive.content(&item.id).unwrap(), b"abcdef");
    }

    #[test]
    fn session_finish_with_wrong_hash_is_corruption() {
        let drive = InMemoryDrive::new();
        let root = drive.root_id();
        let token = drive
            .start_upload_session(&SessionStartRequest {
                total_size: 3,
                total_chunks: 1,
                file_name: Some("f.bin".into()),
                parent_id: Some(root),
                file_id: None,
            })
            .unwrap();

        let h1 = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(b"abc"));
        drive.upload_chunk(&token, 1, &h1, b"abc").unwrap();

        let err = drive.finish_upload_session(&token, "bogus").unwrap_err();
        assert_eq!(err.cause(), ExitCause::FileOrDirectoryCorrupted);
    }
}
