//! Outbound HTTP with a fixed timeout and retry on transient failures.
//!
//! Requests are plain descriptions ([`ApiRequest`]) executed by a [`Connector`].
//! [`Transport`] owns the retry policy: network errors, HTTP 429 and HTTP 5xx are
//! retried with exponential backoff, everything else is handed back to the caller
//! untouched. Application error codes inside a successful response are never
//! inspected here.

use crate::config::Config;
use crate::error::{is_retryable_status, Error};
use async_trait::async_trait;
use futures::{future, stream, Stream, StreamExt};
use rand::Rng;
use reqwest::{multipart, Client, RequestBuilder};
use std::{fmt, pin::Pin, sync::Arc, time::Duration};
use tracing::{trace, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeoutPolicy {
    Default,
    /// Large binary transfers are expected to run long.
    Unbounded,
}

#[derive(Clone)]
pub enum Body {
    Empty,
    Form(Vec<(String, String)>),
    /// A single `multipart/form-data` file part.
    Part {
        field: &'static str,
        file_name: &'static str,
        data: Arc<[u8]>,
    },
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Form(pairs) => f.debug_tuple("Form").field(pairs).finish(),
            Body::Part { field, data, .. } => write!(f, "Part({field}, {} bytes)", data.len()),
        }
    }
}

/// An immutable description of one HTTP request.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Body,
    pub timeout: TimeoutPolicy,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url.into())
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url.into())
    }

    fn new(method: Method, url: String) -> Self {
        ApiRequest {
            method,
            url,
            query: vec![],
            body: Body::Empty,
            timeout: TimeoutPolicy::Default,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_owned(), value.to_string()));
        self
    }

    pub fn form(mut self, pairs: Vec<(&str, String)>) -> Self {
        self.body = Body::Form(pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect());
        self
    }

    pub fn part(mut self, field: &'static str, file_name: &'static str, data: Arc<[u8]>) -> Self {
        self.body = Body::Part {
            field,
            file_name,
            data,
        };
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.timeout = TimeoutPolicy::Unbounded;
        self
    }

    /// Builds a new description with `key` set to `value`, replacing any previous value.
    pub fn with_query(&self, key: &str, value: &str) -> Self {
        let mut request = self.clone();
        request.query.retain(|(k, _)| k != key);
        request.query.push((key.to_owned(), value.to_owned()));
        request
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        match &self.body {
            Body::Form(pairs) => pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, Error>> + Send>>;

/// How much of a failed streamed response is kept in [`Error::Http`].
const ERROR_BODY_LIMIT: usize = 4096;

pub struct StreamResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ChunkStream,
}

/// Executes a single attempt of a request.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<RawResponse, Error>;

    async fn stream(&self, request: &ApiRequest) -> Result<StreamResponse, Error> {
        let response = self.execute(request).await?;
        let content_length = Some(response.body.len() as u64);
        let body = response.body;
        Ok(StreamResponse {
            status: response.status,
            content_length,
            body: Box::pin(stream::once(future::ready(Ok(body)))),
        })
    }
}

pub struct ReqwestConnector {
    client: Client,
    timeout: Duration,
}

impl ReqwestConnector {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .no_proxy()
            .build()?;
        Ok(ReqwestConnector {
            client,
            timeout: config.timeout,
        })
    }

    fn build(&self, request: &ApiRequest) -> Result<RequestBuilder, Error> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .query(&request.query);

        if request.timeout == TimeoutPolicy::Default {
            builder = builder.timeout(self.timeout);
        }

        let builder = match &request.body {
            Body::Empty => builder,
            Body::Form(pairs) => builder.form(pairs),
            Body::Part {
                field,
                file_name,
                data,
            } => {
                let part = multipart::Part::bytes(data.to_vec())
                    .file_name(*file_name)
                    .mime_str("application/octet-stream")?;
                builder.multipart(multipart::Form::new().part(*field, part))
            }
        };
        Ok(builder)
    }
}

fn network(err: reqwest::Error) -> Error {
    Error::Network(err.to_string())
}

#[async_trait]
impl Connector for ReqwestConnector {
    async fn execute(&self, request: &ApiRequest) -> Result<RawResponse, Error> {
        let response = self.build(request)?.send().await.map_err(network)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(network)?.to_vec();
        Ok(RawResponse { status, body })
    }

    async fn stream(&self, request: &ApiRequest) -> Result<StreamResponse, Error> {
        let response = self.build(request)?.send().await.map_err(network)?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(network));
        Ok(StreamResponse {
            status,
            content_length,
            body: Box::pin(body),
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            retries: config.retries,
            base_delay: config.retry_base_delay,
            jitter: true,
        }
    }

    /// `2^attempt * base_delay`, plus up to 20% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay * 2u32.saturating_pow(attempt);
        if self.jitter {
            delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=0.2))
        } else {
            delay
        }
    }
}

#[derive(Clone)]
pub struct Transport {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        Transport { connector, policy }
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self::new(
            Arc::new(ReqwestConnector::new(config)?),
            RetryPolicy::from_config(config),
        ))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn send(&self, request: &ApiRequest) -> Result<RawResponse, Error> {
        let mut attempt = 0;
        loop {
            let err = match self.connector.execute(request).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => Error::Http {
                    status: response.status,
                    body: response.text(),
                },
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= self.policy.retries {
                return Err(err);
            }
            attempt += 1;
            self.backoff(attempt, request, &err).await;
        }
    }

    /// Like [`Transport::send`], but hands back the body as a stream.
    pub async fn open(&self, request: &ApiRequest) -> Result<StreamResponse, Error> {
        let mut attempt = 0;
        loop {
            let err = match self.connector.stream(request).await {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) => Error::Http {
                    status: response.status,
                    body: error_body(response.body).await,
                },
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= self.policy.retries {
                return Err(err);
            }
            attempt += 1;
            self.backoff(attempt, request, &err).await;
        }
    }

    async fn backoff(&self, attempt: u32, request: &ApiRequest, err: &Error) {
        let delay = self.policy.delay(attempt);
        warn!("Request failed, retry attempt {attempt}: {err}");
        trace!(url = %request.url, ?delay, "backing off");
        tokio::time::sleep(delay).await;
    }
}

/// Reads at most [`ERROR_BODY_LIMIT`] bytes; a broken stream ends the read early.
async fn error_body(mut body: ChunkStream) -> String {
    let mut collected = vec![];
    while collected.len() < ERROR_BODY_LIMIT {
        match body.next().await {
            Some(Ok(chunk)) => collected.extend_from_slice(&chunk),
            _ => break,
        }
    }
    collected.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&collected).into_owned()
}
