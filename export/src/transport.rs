//! HTTP transport abstraction for testability.

use std::time::Duration;

use async_trait::async_trait;
use fme_query::{run_abortable, AbortSignal, Instant, QueryError};
use reqwest::Url;
use serde_json::Value;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// No body.
    Empty,
    /// JSON document.
    Json(Value),
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
    /// Raw bytes.
    Bytes {
        /// Payload.
        data: Vec<u8>,
        /// MIME type of the payload.
        content_type: String,
    },
}

/// A single HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: Url,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Payload.
    pub body: RequestBody,
}

impl HttpRequest {
    /// GET request without body.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::Get,
            url,
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    /// POST request with `body`.
    pub fn post(url: Url, body: RequestBody) -> Self {
        Self {
            method: Method::Post,
            url,
            headers: Vec::new(),
            body,
        }
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Response of a completed HTTP call, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Value of the `Content-Type` header.
    pub content_type: Option<String>,
    /// Raw body.
    pub body: Vec<u8>,
    /// Time between sending the request and reading the whole body.
    pub elapsed: Duration,
}

impl HttpResponse {
    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body is declared as JSON.
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|content_type| content_type.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }

    /// Body decoded as JSON.
    pub fn json(&self) -> Result<Value, QueryError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs single HTTP calls. Implementations must stop and return
/// [`QueryError::Cancelled`] once `signal` fires.
#[async_trait(?Send)]
pub trait RequestTransport {
    /// Sends `request`.
    async fn send(&self, request: HttpRequest, signal: &AbortSignal) -> Result<HttpResponse, QueryError>;
}

/// [`RequestTransport`] backed by reqwest (fetch on wasm).
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Transport with a default client.
    pub fn new() -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| QueryError::Other(format!("Failed to create HTTP client: {err}")))?;
        Ok(Self { client })
    }

    /// Transport over an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            Method::Get => self.client.get(request.url),
            Method::Post => self.client.post(request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(pairs) => builder.form(&pairs),
            RequestBody::Bytes { data, content_type } => builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(data),
        }
    }
}

#[async_trait(?Send)]
impl RequestTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest, signal: &AbortSignal) -> Result<HttpResponse, QueryError> {
        let builder = self.build(request);
        let started = Instant::now();

        let exchange = async {
            let response = builder.send().await.map_err(transport_error)?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response.bytes().await.map_err(transport_error)?;
            Ok(HttpResponse {
                status,
                content_type,
                body: body.to_vec(),
                elapsed: Instant::now() - started,
            })
        };

        run_abortable(signal, exchange)
            .await
            .unwrap_or(Err(QueryError::Cancelled))
    }
}

fn transport_error(err: reqwest::Error) -> QueryError {
    // Classify on the error alone. The URL carries user-chosen resource names.
    let err = err.without_url();
    if err.is_decode() {
        return QueryError::Parse(err.to_string());
    }
    match QueryError::classify(err.to_string()) {
        QueryError::Other(message) if err.is_request() || err.is_timeout() => QueryError::Network(message),
        classified => classified,
    }
}
