//! Firebase Realtime Database backend
//!
//! Talks to the database over its REST API: `PUT`/`POST`/`DELETE` on
//! `{database_url}/{path}.json`, and streaming `GET` with
//! `Accept: text/event-stream` for subscriptions. Namespace reservation is a
//! conditional write (`X-Firebase-ETag` then `if-match`), so two devices
//! racing on one code cannot both win.

use super::{
    log_path, namespace_path, slot_path, CandidateLog, LogEntry, NamespaceRecord, RendezvousStore,
    Slot, Subscription,
};
use crate::code::SessionCode;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

/// Connection settings for [`FirebaseStore`]
#[derive(Debug, Clone)]
pub struct FirebaseStoreConfig {
    /// e.g. `https://my-project-default-rtdb.firebaseio.com`
    pub database_url: String,

    /// Database secret or ID token, sent as the `auth` query parameter
    pub auth_token: Option<String>,

    /// Timeout for one-shot requests (streams are not limited)
    pub request_timeout: Duration,
}

impl Default for FirebaseStoreConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            auth_token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Rendezvous store backed by a Firebase Realtime Database
pub struct FirebaseStore {
    base: Url,
    auth_token: Option<String>,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl FirebaseStore {
    pub fn new(config: FirebaseStoreConfig) -> Result<Self> {
        let base = Url::parse(config.database_url.trim_end_matches('/')).map_err(|e| {
            Error::InvalidConfig(format!("database_url {:?}: {}", config.database_url, e))
        })?;

        if base.scheme() != "https" && base.scheme() != "http" {
            return Err(Error::InvalidConfig(format!(
                "database_url must be http(s), got {}",
                base.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base,
            auth_token: config.auth_token,
            request_timeout: config.request_timeout,
            client,
        })
    }

    /// REST URL of a database path
    fn url(&self, path: &str) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}/{}.json",
            self.base.as_str().trim_end_matches('/'),
            path
        ))
        .map_err(|e| Error::InvalidConfig(format!("Invalid database path {}: {}", path, e)))?;

        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("{}: {}", what, e)))?;
        check_status(response, what)
    }

    /// Open an event stream on `path` and hand every event to `on_event`
    ///
    /// The initial request happens here so connection failures surface to the
    /// caller; the body is then read by a background task until `on_event`
    /// returns `false`, the server cancels, or the subscription is dropped.
    async fn stream<T, F>(&self, path: &str, mut on_event: F) -> Result<Subscription<T>>
    where
        T: Send + 'static,
        F: FnMut(StreamEvent, &mpsc::UnboundedSender<T>) -> bool + Send + 'static,
    {
        let url = self.url(path)?;
        let response = self
            .client
            .get(url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("subscribe {}: {}", path, e)))?;
        let response = check_status(response, path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let path = path.to_string();

        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = EventBuffer::default();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(path = %path, "Event stream error: {}", e);
                        return;
                    }
                };

                buffer.push(&chunk);

                while let Some(block) = buffer.next_block() {
                    let block = match block {
                        Ok(block) => block,
                        Err(e) => {
                            warn!(path = %path, "Skipping non UTF-8 event: {}", e);
                            continue;
                        }
                    };

                    let Some(event) = parse_event(&block) else {
                        continue;
                    };
                    trace!(path = %path, event = ?event, "Stream event");

                    match event {
                        StreamEvent::KeepAlive => {}
                        StreamEvent::Cancel(reason) => {
                            warn!(path = %path, "Event stream cancelled by server: {}", reason);
                            return;
                        }
                        StreamEvent::AuthRevoked => {
                            warn!(path = %path, "Event stream auth revoked");
                            return;
                        }
                        event => {
                            if !on_event(event, &tx) {
                                debug!(path = %path, "Subscriber dropped, stopping stream");
                                return;
                            }
                        }
                    }
                }
            }
            debug!(path = %path, "Event stream ended");
        });

        Ok(Subscription::with_task(rx, task))
    }
}

#[async_trait]
impl RendezvousStore for FirebaseStore {
    async fn create_namespace(&self, code: &SessionCode) -> Result<()> {
        let path = namespace_path(code);
        let url = self.url(&path)?;

        let response = self
            .send(
                self.client.get(url.clone()).header("X-Firebase-ETag", "true"),
                "read namespace",
            )
            .await?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::StoreUnavailable("store did not return an ETag".to_string()))?;
        let existing: Value = response
            .json()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("read namespace: {}", e)))?;

        if !existing.is_null() {
            return Err(Error::CodeConflict(code.to_string()));
        }

        let response = self
            .client
            .put(url)
            .header("if-match", etag)
            .json(&NamespaceRecord::now())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("reserve namespace: {}", e)))?;

        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(Error::CodeConflict(code.to_string()));
        }
        check_status(response, "reserve namespace")?;

        debug!(code = %code, "Namespace reserved");
        Ok(())
    }

    async fn publish(&self, code: &SessionCode, slot: Slot, value: Value) -> Result<()> {
        let url = self.url(&slot_path(code, slot))?;
        self.send(self.client.put(url).json(&value), "publish").await?;
        Ok(())
    }

    async fn append(&self, code: &SessionCode, log: CandidateLog, value: Value) -> Result<String> {
        #[derive(Deserialize)]
        struct PushId {
            name: String,
        }

        let url = self.url(&log_path(code, log))?;
        let response = self.send(self.client.post(url).json(&value), "append").await?;
        let push: PushId = response
            .json()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("append: {}", e)))?;
        Ok(push.name)
    }

    async fn subscribe_slot(&self, code: &SessionCode, slot: Slot) -> Result<Subscription<Value>> {
        let mut current = Value::Null;
        self.stream(&slot_path(code, slot), move |event, tx| {
            match event {
                StreamEvent::Put { path, data } => apply_put(&mut current, &path, data),
                StreamEvent::Patch { path, data } => apply_patch(&mut current, &path, data),
                _ => return true,
            }
            current.is_null() || tx.send(current.clone()).is_ok()
        })
        .await
    }

    async fn subscribe_appends(
        &self,
        code: &SessionCode,
        log: CandidateLog,
    ) -> Result<Subscription<LogEntry>> {
        let mut cursor = LogCursor::default();
        self.stream(&log_path(code, log), move |event, tx| {
            let entries = match event {
                StreamEvent::Put { path, data } => cursor.on_put(&path, data),
                StreamEvent::Patch { path, data } => cursor.on_patch(&path, data),
                _ => Vec::new(),
            };
            entries.into_iter().all(|entry| tx.send(entry).is_ok())
        })
        .await
    }

    async fn remove_namespace(&self, code: &SessionCode) -> Result<()> {
        let url = self.url(&namespace_path(code))?;
        self.send(self.client.delete(url), "remove namespace").await?;
        debug!(code = %code, "Namespace removed");
        Ok(())
    }
}

/// Raw event-stream bytes, split into `\n\n`-terminated blocks
///
/// Chunks can end inside a multi-byte character, so text is only decoded
/// once a whole block has arrived.
#[derive(Debug, Default)]
struct EventBuffer {
    bytes: Vec<u8>,
}

impl EventBuffer {
    fn push(&mut self, chunk: &[u8]) {
        // `\r` never occurs inside a multi-byte UTF-8 sequence
        self.bytes.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    fn next_block(&mut self) -> Option<std::result::Result<String, std::string::FromUtf8Error>> {
        let end = self.bytes.windows(2).position(|w| w == b"\n\n")?;
        let block: Vec<u8> = self.bytes.drain(..end + 2).take(end).collect();
        Some(String::from_utf8(block))
    }
}

fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::StoreUnavailable(format!("{}: HTTP {}", what, status)))
    }
}

/// One server-sent event of a database stream
#[derive(Debug, Clone, PartialEq)]
enum StreamEvent {
    Put { path: String, data: Value },
    Patch { path: String, data: Value },
    KeepAlive,
    Cancel(String),
    AuthRevoked,
}

#[derive(Deserialize)]
struct EventPayload {
    path: String,
    data: Value,
}

/// Parse one `event: ...\ndata: ...` block
fn parse_event(block: &str) -> Option<StreamEvent> {
    let mut name = None;
    let mut data = String::new();

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim_start());
        }
    }

    match name? {
        "put" | "patch" => {
            let payload: EventPayload = match serde_json::from_str(&data) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Unparseable stream event payload: {}", e);
                    return None;
                }
            };
            if name == Some("put") {
                Some(StreamEvent::Put {
                    path: payload.path,
                    data: payload.data,
                })
            } else {
                Some(StreamEvent::Patch {
                    path: payload.path,
                    data: payload.data,
                })
            }
        }
        "keep-alive" => Some(StreamEvent::KeepAlive),
        "cancel" => Some(StreamEvent::Cancel(data)),
        "auth_revoked" => Some(StreamEvent::AuthRevoked),
        other => {
            trace!("Ignoring stream event {:?}", other);
            None
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Replace the value at `path` (relative to `root`); `null` deletes
fn apply_put(root: &mut Value, path: &str, data: Value) {
    let segments = segments(path);
    let Some((leaf, parents)) = segments.split_last() else {
        *root = data;
        return;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Default::default());
        }
        node = match node {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => return,
        };
    }

    if !node.is_object() {
        if data.is_null() {
            return;
        }
        *node = Value::Object(Default::default());
    }
    if let Value::Object(map) = node {
        if data.is_null() {
            map.remove(*leaf);
        } else {
            map.insert(leaf.to_string(), data);
        }
    }
}

/// Merge each child of `data` into the value at `path`
fn apply_patch(root: &mut Value, path: &str, data: Value) {
    let Value::Object(children) = data else {
        return;
    };
    let base = path.trim_end_matches('/');
    for (key, value) in children {
        apply_put(root, &format!("{}/{}", base, key), value);
    }
}

/// Tracks which log entries have been delivered to the subscriber
#[derive(Debug, Default)]
struct LogCursor {
    seen: HashSet<String>,
}

impl LogCursor {
    fn on_put(&mut self, path: &str, data: Value) -> Vec<LogEntry> {
        match segments(path).as_slice() {
            [] => self.take_children(data),
            [id] => self.take(id, data).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn on_patch(&mut self, path: &str, data: Value) -> Vec<LogEntry> {
        if segments(path).is_empty() {
            self.take_children(data)
        } else {
            Vec::new()
        }
    }

    fn take_children(&mut self, data: Value) -> Vec<LogEntry> {
        let Value::Object(children) = data else {
            return Vec::new();
        };
        let mut children: Vec<(String, Value)> = children.into_iter().collect();
        // Push ids sort chronologically
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
            .into_iter()
            .filter_map(|(id, value)| self.take(&id, value))
            .collect()
    }

    fn take(&mut self, id: &str, value: Value) -> Option<LogEntry> {
        if value.is_null() || !self.seen.insert(id.to_string()) {
            return None;
        }
        Some(LogEntry {
            id: id.to_string(),
            value,
        })
    }
}
