#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xpan::api::PanClient;
use xpan::chunker::md5_hex;
use xpan::config::Config;
use xpan::credential::{CredentialRecord, MemoryStore};
use xpan::token::TokenManager;
use xpan::transport::{ApiRequest, Body, Connector, RawResponse, RetryPolicy, Transport};
use xpan::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(usize),
    End(usize),
    Create,
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub fs_id: u64,
    pub path: String,
    pub isdir: bool,
    pub content: Vec<u8>,
}

#[derive(Default)]
pub struct State {
    pub valid_token: String,
    pub token_seq: usize,
    pub refresh_calls: usize,
    pub reject_refresh: bool,
    /// Block hash lists of committed files, by path.
    pub stored: HashMap<String, Vec<String>>,
    pub forced_pending: Option<Vec<usize>>,
    pub omit_uploadid: bool,
    /// Invalidates the current token right after a precreate succeeds.
    pub expire_after_precreate: bool,
    pub tampered: HashMap<usize, String>,
    pub failing_blocks: HashSet<usize>,
    /// Paths whose precreate is refused with `errno -7`.
    pub denied_paths: HashSet<String>,
    pub slow_blocks: HashMap<usize, Duration>,
    /// Block indices in completion order.
    pub uploaded: Vec<usize>,
    pub events: Vec<Event>,
    pub creates: Vec<Vec<String>>,
    /// `(method, access_token)` of every pan API call, in arrival order.
    pub calls: Vec<(String, String)>,
    pub files: Vec<RemoteFile>,
}

/// An in-memory stand-in for the Baidu Pan endpoints.
pub struct MockPan {
    pub state: Mutex<State>,
    pub latency: Duration,
    pub refresh_latency: Duration,
}

impl MockPan {
    pub fn new(valid_token: &str) -> Self {
        MockPan {
            state: Mutex::new(State {
                valid_token: valid_token.to_owned(),
                ..State::default()
            }),
            latency: Duration::from_millis(5),
            refresh_latency: Duration::from_millis(20),
        }
    }

    pub fn with<F: FnOnce(&mut State)>(self, f: F) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn refresh(&self, request: &ApiRequest) -> RawResponse {
        let mut state = self.state();
        state.refresh_calls += 1;
        assert_eq!(request.query_value("grant_type"), Some("refresh_token"));
        if state.reject_refresh {
            return json(
                400,
                r#"{"error":"invalid_grant","error_description":"refresh token has been used"}"#,
            );
        }
        state.token_seq += 1;
        let seq = state.token_seq;
        state.valid_token = format!("token-{seq}");
        json(
            200,
            &format!(
                r#"{{"access_token":"token-{seq}","refresh_token":"refresh-{seq}","expires_in":2592000,"scope":"basic netdisk"}}"#
            ),
        )
    }

    fn precreate(&self, state: &mut State, request: &ApiRequest) -> RawResponse {
        let path = request.form_value("path").unwrap().to_owned();
        let hashes: Vec<String> =
            serde_json::from_str(request.form_value("block_list").unwrap()).unwrap();
        assert_eq!(request.form_value("rtype"), Some("3"));

        if state.denied_paths.contains(&path) {
            return json(200, r#"{"errno":-7,"errmsg":"access denied"}"#);
        }

        if state.stored.get(&path) == Some(&hashes) {
            return json(200, r#"{"errno":0,"return_type":2,"block_list":[]}"#);
        }
        let pending = state
            .forced_pending
            .clone()
            .unwrap_or_else(|| (0..hashes.len()).collect());
        let pending = serde_json::to_string(&pending).unwrap();
        if state.expire_after_precreate {
            state.valid_token = "expired".to_owned();
        }
        if state.omit_uploadid {
            json(200, &format!(r#"{{"errno":0,"return_type":1,"block_list":{pending}}}"#))
        } else {
            json(
                200,
                &format!(
                    r#"{{"errno":0,"uploadid":"upload-1","return_type":1,"block_list":{pending}}}"#
                ),
            )
        }
    }

    fn upload(&self, state: &mut State, request: &ApiRequest, partseq: usize) -> RawResponse {
        assert_eq!(request.query_value("uploadid"), Some("upload-1"));
        if state.failing_blocks.contains(&partseq) {
            return json(500, "internal error");
        }
        let data = match &request.body {
            Body::Part { data, .. } => data.clone(),
            other => panic!("block upload without file part: {other:?}"),
        };
        let md5 = state
            .tampered
            .get(&partseq)
            .cloned()
            .unwrap_or_else(|| md5_hex(&data));
        state.uploaded.push(partseq);
        state.events.push(Event::End(partseq));
        json(200, &format!(r#"{{"md5":"{md5}","request_id":1}}"#))
    }

    fn create(&self, state: &mut State, request: &ApiRequest) -> RawResponse {
        let path = request.form_value("path").unwrap().to_owned();
        let size = request.form_value("size").unwrap().to_owned();
        let hashes: Vec<String> =
            serde_json::from_str(request.form_value("block_list").unwrap()).unwrap();
        state.events.push(Event::Create);
        state.creates.push(hashes.clone());
        state.stored.insert(path.clone(), hashes);
        json(
            200,
            &format!(
                r#"{{"errno":0,"fs_id":42,"path":"{path}","size":{size},"ctime":1700000000,"mtime":1700000000,"md5":"etag","isdir":0}}"#
            ),
        )
    }

    fn list(&self, state: &State, request: &ApiRequest) -> RawResponse {
        let dir = request.query_value("dir").unwrap();
        let entries = state
            .files
            .iter()
            .filter(|f| parent_of(&f.path) == dir)
            .map(|f| {
                serde_json::json!({
                    "fs_id": f.fs_id,
                    "path": f.path,
                    "server_filename": f.path.rsplit('/').next().unwrap(),
                    "size": f.content.len(),
                    "isdir": u8::from(f.isdir),
                    "server_mtime": 1700000000,
                    "server_ctime": 1700000000,
                })
            })
            .collect::<Vec<_>>();
        json(200, &serde_json::json!({"errno": 0, "list": entries}).to_string())
    }

    fn filemetas(&self, state: &State, request: &ApiRequest) -> RawResponse {
        let ids: Vec<u64> = serde_json::from_str(request.query_value("fsids").unwrap()).unwrap();
        let metas = state
            .files
            .iter()
            .filter(|f| ids.contains(&f.fs_id))
            .map(|f| {
                serde_json::json!({
                    "fs_id": f.fs_id,
                    "path": f.path,
                    "filename": f.path.rsplit('/').next().unwrap(),
                    "size": f.content.len(),
                    "isdir": 0,
                    "dlink": format!("https://d.pcs.baidu.com/file/{}?fid=1", f.fs_id),
                })
            })
            .collect::<Vec<_>>();
        json(200, &serde_json::json!({"errno": 0, "list": metas}).to_string())
    }

    fn file_content(&self, state: &State, request: &ApiRequest) -> RawResponse {
        let id: u64 = request
            .url
            .rsplit('/')
            .next()
            .and_then(|tail| tail.split('?').next())
            .and_then(|id| id.parse().ok())
            .unwrap();
        match state.files.iter().find(|f| f.fs_id == id) {
            Some(file) => RawResponse {
                status: 200,
                body: file.content.clone(),
            },
            None => json(404, "not found"),
        }
    }
}

#[async_trait]
impl Connector for MockPan {
    async fn execute(&self, request: &ApiRequest) -> Result<RawResponse, Error> {
        if request.url.ends_with("/oauth/2.0/token") {
            tokio::time::sleep(self.refresh_latency).await;
            return Ok(self.refresh(request));
        }

        let method = request.query_value("method").unwrap_or_default().to_owned();
        let token = request.query_value("access_token").unwrap_or_default().to_owned();
        let partseq = request
            .query_value("partseq")
            .and_then(|p| p.parse::<usize>().ok());

        let latency = {
            let mut state = self.state();
            state.calls.push((method.clone(), token.clone()));
            if let Some(index) = partseq {
                state.events.push(Event::Start(index));
                state.slow_blocks.get(&index).copied().unwrap_or(self.latency)
            } else {
                self.latency
            }
        };
        tokio::time::sleep(latency).await;

        let mut state = self.state();
        if token != state.valid_token {
            return Ok(json(200, r#"{"errno":111,"errmsg":"access token expired"}"#));
        }
        let response = match (method.as_str(), partseq) {
            ("precreate", _) => self.precreate(&mut state, request),
            ("upload", Some(index)) => self.upload(&mut state, request, index),
            ("create", _) => self.create(&mut state, request),
            ("list", _) => self.list(&state, request),
            ("filemetas", _) => self.filemetas(&state, request),
            ("uinfo", _) => json(
                200,
                r#"{"errno":0,"baidu_name":"tester","netdisk_name":"tester","avatar_url":"","vip_type":0,"uk":1}"#,
            ),
            ("", _) if request.url.contains("/file/") => self.file_content(&state, request),
            _ => json(404, "unknown endpoint"),
        };
        Ok(response)
    }
}

/// Replays a fixed list of outcomes, one per attempt.
pub struct Scripted {
    outcomes: Mutex<VecDeque<Result<RawResponse, Error>>>,
    pub calls: AtomicUsize,
}

impl Scripted {
    pub fn new(outcomes: Vec<Result<RawResponse, Error>>) -> Self {
        Scripted {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for Scripted {
    async fn execute(&self, _: &ApiRequest) -> Result<RawResponse, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Network("script exhausted".into())))
    }
}

pub fn json(status: u16, body: &str) -> RawResponse {
    RawResponse {
        status,
        body: body.as_bytes().to_vec(),
    }
}

pub fn network_error() -> Result<RawResponse, Error> {
    Err(Error::Network("connection reset by peer".into()))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

pub fn test_policy() -> RetryPolicy {
    RetryPolicy {
        retries: 3,
        base_delay: Duration::from_millis(10),
        jitter: false,
    }
}

pub fn credentials(access_token: &str) -> CredentialRecord {
    CredentialRecord {
        access_token: Some(access_token.to_owned()),
        refresh_token: Some("refresh-0".to_owned()),
        app_key: Some("app-key".to_owned()),
        secret_key: Some("secret-key".to_owned()),
        expires_at: Some(0),
    }
}

pub struct Harness {
    pub mock: Arc<MockPan>,
    pub store: Arc<MemoryStore>,
    pub client: PanClient,
}

pub fn harness(mock: MockPan, record: CredentialRecord) -> Harness {
    let mock = Arc::new(mock);
    let store = Arc::new(MemoryStore::new(record));
    let config = Config::default();
    let transport = Transport::new(mock.clone(), test_policy());
    let tokens = TokenManager::new(&config, store.clone(), transport.clone());
    let client = PanClient::with_parts(config, transport, tokens);
    Harness {
        mock,
        store,
        client,
    }
}

/// Deterministic, non-repeating test content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i / 251) as u8).collect()
}
