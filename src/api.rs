use crate::config::Config;
use crate::credential::CredentialStore;
use crate::error::Error;
use crate::token::{is_expiry_error, TokenManager};
use crate::transport::{ApiRequest, RawResponse, StreamResponse, Transport};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

/// Overwrite the remote object if it already exists.
const RTYPE_OVERWRITE: &str = "3";

/// `return_type` of a precreate answer when the whole file is already on the server.
pub const RETURN_TYPE_RAPID: i64 = 2;

#[derive(Deserialize, Default)]
struct Envelope {
    errno: Option<i64>,
    errmsg: Option<String>,
    error_code: Option<i64>,
    error_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub fs_id: u64,
    pub path: String,
    pub server_filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub isdir: u8,
    #[serde(default)]
    pub category: u32,
    #[serde(default)]
    pub server_mtime: i64,
    #[serde(default)]
    pub server_ctime: i64,
    #[serde(default)]
    pub local_mtime: i64,
    #[serde(default)]
    pub local_ctime: i64,
    pub md5: Option<String>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.isdir != 0
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    list: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub fs_id: u64,
    pub path: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub isdir: u8,
    pub dlink: Option<String>,
    pub md5: Option<String>,
    #[serde(default)]
    pub server_ctime: i64,
    #[serde(default)]
    pub server_mtime: i64,
}

#[derive(Deserialize)]
struct FileMetasResponse {
    #[serde(default)]
    list: Vec<FileMeta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrecreateResponse {
    pub uploadid: Option<String>,
    #[serde(default)]
    pub return_type: i64,
    #[serde(default)]
    pub block_list: Vec<usize>,
}

impl PrecreateResponse {
    pub fn is_rapid_upload(&self) -> bool {
        self.return_type == RETURN_TYPE_RAPID
    }
}

#[derive(Debug, Deserialize)]
struct BlockUploadResponse {
    md5: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedFile {
    pub fs_id: u64,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub ctime: i64,
    #[serde(default)]
    pub mtime: i64,
    pub md5: Option<String>,
    #[serde(default)]
    pub isdir: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub baidu_name: String,
    pub netdisk_name: String,
    pub avatar_url: String,
    pub vip_type: i32,
    pub uk: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Quota {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    #[serde(default)]
    pub expire: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Name,
    Time,
    Size,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            Order::Name => "name",
            Order::Time => "time",
            Order::Size => "size",
        };
        write!(f, "{}", result)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ListOptions {
    pub order: Order,
    pub desc: bool,
    pub start: u32,
    pub limit: u32,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            order: Order::Name,
            desc: false,
            start: 0,
            limit: 1000,
        }
    }
}

/// Authenticated access to the Baidu Pan REST API.
///
/// Every call carries the current access token. When the server answers with one
/// of the token-expiry codes the token is refreshed once and the call is repeated
/// once with the new token.
#[derive(Clone)]
pub struct PanClient {
    config: Arc<Config>,
    transport: Transport,
    tokens: TokenManager,
}

impl PanClient {
    pub fn new(config: Config, store: Arc<dyn CredentialStore>) -> Result<Self, Error> {
        let transport = Transport::from_config(&config)?;
        let tokens = TokenManager::new(&config, store, transport.clone());
        Ok(Self::with_parts(config, transport, tokens))
    }

    pub fn with_parts(config: Config, transport: Transport, tokens: TokenManager) -> Self {
        PanClient {
            config: Arc::new(config),
            transport,
            tokens,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn call<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, Error> {
        let token = self.tokens.get_token()?;
        let err = match self.call_with(request, &token).await {
            Err(err) if err.errno().map_or(false, is_expiry_error) => err,
            other => return other,
        };

        let fresh = match self.renew(&token).await {
            Ok(fresh) => fresh,
            Err(refresh_err) => {
                warn!("{refresh_err}");
                return Err(err);
            }
        };
        debug!(url = %request.url, "retrying with refreshed token");
        self.call_with(request, &fresh).await
    }

    /// Someone else may already have replaced the token we were rejected with.
    async fn renew(&self, stale: &str) -> Result<String, Error> {
        let current = self.tokens.get_token()?;
        if current != stale {
            return Ok(current);
        }
        self.tokens.refresh().await
    }

    async fn call_with<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        token: &str,
    ) -> Result<T, Error> {
        let request = request.with_query("access_token", token);
        match self.transport.send(&request).await {
            Ok(response) => decode(&response),
            // some endpoints reject a bad token with a 4xx and an errno body
            Err(Error::Http { status, body }) => match remote_error(body.as_bytes()) {
                Some(err) => Err(err),
                None => Err(Error::Http { status, body }),
            },
            Err(e) => Err(e),
        }
    }

    pub async fn user_info(&self) -> Result<UserInfo, Error> {
        let request = ApiRequest::get(self.config.nas_url()).query("method", "uinfo");
        self.call(&request).await
    }

    pub async fn quota(&self) -> Result<Quota, Error> {
        let request = ApiRequest::get(self.config.quota_url())
            .query("checkfree", 1)
            .query("checkexpire", 1);
        self.call(&request).await
    }

    pub async fn list_files(&self, dir: &str, options: ListOptions) -> Result<Vec<FileEntry>, Error> {
        let request = ApiRequest::get(self.config.file_url())
            .query("method", "list")
            .query("dir", dir)
            .query("order", options.order)
            .query("desc", u8::from(options.desc))
            .query("start", options.start)
            .query("limit", options.limit)
            .query("web", 1);
        let response: ListResponse = self.call(&request).await?;
        Ok(response.list)
    }

    pub async fn file_metas(&self, fs_ids: &[u64], dlink: bool) -> Result<Vec<FileMeta>, Error> {
        let fsids = serde_json::to_string(fs_ids).map_err(|e| Error::Protocol(e.to_string()))?;
        let request = ApiRequest::get(self.config.multimedia_url())
            .query("method", "filemetas")
            .query("fsids", fsids)
            .query("dlink", u8::from(dlink));
        let response: FileMetasResponse = self.call(&request).await?;
        Ok(response.list)
    }

    pub async fn precreate(
        &self,
        path: &str,
        size: u64,
        block_list: &[String],
    ) -> Result<PrecreateResponse, Error> {
        let request = ApiRequest::post(self.config.file_url())
            .query("method", "precreate")
            .form(vec![
                ("path", path.to_owned()),
                ("size", size.to_string()),
                ("isdir", "0".to_owned()),
                ("autoinit", "1".to_owned()),
                ("block_list", block_list_json(block_list)?),
                ("rtype", RTYPE_OVERWRITE.to_owned()),
            ]);
        self.call(&request).await
    }

    /// Uploads one block and returns the hash the server computed for it.
    pub async fn upload_block(
        &self,
        upload_id: &str,
        path: &str,
        partseq: usize,
        data: Arc<[u8]>,
    ) -> Result<String, Error> {
        let request = ApiRequest::post(self.config.superfile_url())
            .query("method", "upload")
            .query("type", "tmpfile")
            .query("path", path)
            .query("uploadid", upload_id)
            .query("partseq", partseq)
            .part("file", "chunk", data)
            .unbounded();
        let response: BlockUploadResponse = self.call(&request).await?;
        response
            .md5
            .filter(|md5| !md5.is_empty())
            .ok_or_else(|| Error::Protocol(format!("block {partseq} upload answered without md5")))
    }

    pub async fn create_file(
        &self,
        path: &str,
        size: u64,
        upload_id: &str,
        block_list: &[String],
    ) -> Result<CreatedFile, Error> {
        self.create(path, size, false, upload_id, block_list).await
    }

    pub async fn create_dir(&self, path: &str) -> Result<CreatedFile, Error> {
        self.create(path, 0, true, "", &[]).await
    }

    async fn create(
        &self,
        path: &str,
        size: u64,
        isdir: bool,
        upload_id: &str,
        block_list: &[String],
    ) -> Result<CreatedFile, Error> {
        let request = ApiRequest::post(self.config.file_url())
            .query("method", "create")
            .form(vec![
                ("path", path.to_owned()),
                ("size", size.to_string()),
                ("isdir", u8::from(isdir).to_string()),
                ("uploadid", upload_id.to_owned()),
                ("block_list", block_list_json(block_list)?),
                ("rtype", RTYPE_OVERWRITE.to_owned()),
            ]);
        self.call(&request).await
    }

    /// Opens a download link; the body is streamed and has no timeout.
    pub async fn open_download(&self, dlink: &str) -> Result<StreamResponse, Error> {
        let token = self.tokens.get_token()?;
        let request = ApiRequest::get(dlink)
            .query("access_token", token)
            .unbounded();
        self.transport.open(&request).await
    }
}

fn block_list_json(block_list: &[String]) -> Result<String, Error> {
    serde_json::to_string(block_list).map_err(|e| Error::Protocol(e.to_string()))
}

fn remote_error(body: &[u8]) -> Option<Error> {
    let envelope: Envelope = serde_json::from_slice(body).ok()?;
    match (envelope.errno, envelope.error_code) {
        (Some(errno), _) if errno != 0 => Some(Error::remote(errno, envelope.errmsg)),
        (_, Some(code)) if code != 0 => Some(Error::remote(code, envelope.error_msg)),
        _ => None,
    }
}

/// Decodes a JSON answer, turning a non-zero `errno`/`error_code` into [`Error::Remote`].
pub(crate) fn decode<T: DeserializeOwned>(response: &RawResponse) -> Result<T, Error> {
    if let Some(err) = remote_error(&response.body) {
        return Err(err);
    }
    serde_json::from_slice(&response.body).map_err(|e| Error::SerdeJSONError(e, response.text()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn decodes_precreate() {
        let parsed: PrecreateResponse =
            decode(&response(r#"{"errno":0,"uploadid":"N1","return_type":1,"block_list":[0,2]}"#))
                .unwrap();
        assert_eq!(parsed.uploadid.as_deref(), Some("N1"));
        assert_eq!(parsed.block_list, vec![0, 2]);
        assert!(!parsed.is_rapid_upload());

        let rapid: PrecreateResponse = decode(&response(r#"{"errno":0,"return_type":2}"#)).unwrap();
        assert!(rapid.is_rapid_upload());
        assert!(rapid.block_list.is_empty());
    }

    #[test]
    fn errno_becomes_remote_error() {
        let err = decode::<PrecreateResponse>(&response(r#"{"errno":111,"errmsg":"expired"}"#))
            .unwrap_err();
        assert_eq!(err.errno(), Some(111));
    }

    #[test]
    fn pcs_error_code_becomes_remote_error() {
        let body = r#"{"error_code":31064,"error_msg":"file is not authorized","request_id":1}"#;
        let err = decode::<BlockUploadResponse>(&response(body)).unwrap_err();
        assert_eq!(err.errno(), Some(31064));
        assert!(err.to_string().contains("file is not authorized"));
    }

    #[test]
    fn malformed_body_keeps_response_text() {
        let err = decode::<CreatedFile>(&response("<html>busy</html>")).unwrap_err();
        match err {
            Error::SerdeJSONError(_, body) => assert_eq!(body, "<html>busy</html>"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn order_names() {
        assert_eq!(Order::Name.to_string(), "name");
        assert_eq!(Order::Time.to_string(), "time");
        assert_eq!(Order::Size.to_string(), "size");
    }

    #[test]
    fn block_list_is_json_array() {
        let json = block_list_json(&["a".to_owned(), "b".to_owned()]).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
    }
}
