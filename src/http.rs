//! HTTP 傳輸層。
//!
//! 協議元件只依賴 [`HttpClient`] 特性；正式環境使用以 [`ClientConfig`] 明確設定的
//! [`ReqwestClient`]，測試則注入腳本化的實作。

use std::{collections::HashMap, fmt, time::Duration};

use log::debug;
use reqwest::blocking::Client;
use thiserror::Error;
use url::Url;

/// 傳輸層錯誤：網路或 I/O 失敗。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Invalid URL {0}")]
    InvalidUrl(String),
}

type Result<T> = std::result::Result<T, TransportError>;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_PKIX_CERT: &str = "application/pkix-cert";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
        })
    }
}

/// 待送出的 HTTP 請求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            content_type: None,
            accept: None,
            body: Vec::new(),
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn accept(mut self, accept: &str) -> Self {
        self.accept = Some(accept.to_owned());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// 解析後的 HTTP 回應，只保留協議需要的標頭。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// `Location` 標頭，已依請求 URL 解析為絕對網址。
    pub location: Option<String>,
    /// `Link` 標頭中的各個關係（rel → 目標網址）。
    pub links: Links,
    /// 去除參數後的媒體類型，例如 `application/json`。
    pub content_type: Option<String>,
    pub replay_nonce: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 由原始標頭組出回應；相對網址以 `request_url` 為基準解析。
    pub fn from_parts<'a>(
        request_url: &str,
        status: u16,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        body: Vec<u8>,
    ) -> Self {
        let base = Url::parse(request_url).ok();
        let mut location = None;
        let mut links = Links::default();
        let mut content_type = None;
        let mut replay_nonce = None;

        for (name, value) in headers {
            match name.to_ascii_lowercase().as_str() {
                "location" => location = Some(resolve(base.as_ref(), value.trim())),
                "link" => links.parse_header(base.as_ref(), value),
                "content-type" => content_type = Some(media_type(value)),
                "replay-nonce" => replay_nonce = Some(value.trim().to_owned()),
                _ => {}
            }
        }

        Self {
            status,
            location,
            links,
            content_type,
            replay_nonce,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 以 UTF-8（容錯）取得回應內容，用於錯誤診斷。
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// `Link` 標頭的關係集合。缺少的關係以 `None` 表示，不視為錯誤。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Links {
    relations: HashMap<String, String>,
}

impl Links {
    pub fn get(&self, rel: &str) -> Option<&str> {
        self.relations.get(rel).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// 解析一個 `Link` 標頭值，例如 `<https://ca/new-authz>;rel="next", <...>;rel="up"`。
    ///
    /// 同一關係出現多次時保留第一個。
    fn parse_header(&mut self, base: Option<&Url>, value: &str) {
        for entry in split_link_entries(value) {
            let entry = entry.trim();
            let Some(rest) = entry.strip_prefix('<') else {
                continue;
            };
            let Some(end) = rest.find('>') else {
                continue;
            };
            let target = resolve(base, &rest[..end]);

            for param in rest[end + 1..].split(';') {
                let Some((key, val)) = param.split_once('=') else {
                    continue;
                };
                if !key.trim().eq_ignore_ascii_case("rel") {
                    continue;
                }
                // rel 可以是以空白分隔的多個關係
                for rel in val.trim().trim_matches('"').split_whitespace() {
                    self.relations
                        .entry(rel.to_owned())
                        .or_insert_with(|| target.clone());
                }
            }
        }
    }
}

/// 依逗號切分多個 link 項目，但忽略 `<...>` 與引號內的逗號。
fn split_link_entries(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut in_uri = false;
    let mut in_quote = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '<' if !in_quote => in_uri = true,
            '>' if !in_quote => in_uri = false,
            '"' if !in_uri => in_quote = !in_quote,
            ',' if !in_uri && !in_quote => {
                entries.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&value[start..]);
    entries
}

fn resolve(base: Option<&Url>, target: &str) -> String {
    base.and_then(|b| b.join(target).ok())
        .map(String::from)
        .unwrap_or_else(|| target.to_owned())
}

fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// 執行 HTTP 請求的介面。
pub trait HttpClient: Send + Sync {
    /// 送出請求並回傳回應。任何狀態碼都視為成功取得回應，狀態判斷留給呼叫端。
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// HTTP 用戶端設定。
///
/// 跳過 TLS 驗證必須透過 [`ClientConfig::accept_invalid_certs`] 明確開啟，
/// 不存在隱含的全域不安全用戶端。
#[derive(Debug, Clone)]
pub struct ClientConfig {
    user_agent: String,
    timeout: Option<Duration>,
    accept_invalid_certs: bool,
}

impl ClientConfig {
    /// 預設的 User-Agent。
    pub const DEFAULT_USER_AGENT: &'static str =
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
    /// 預設的請求逾時。
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self {
            user_agent: Self::DEFAULT_USER_AGENT.to_owned(),
            timeout: Some(Self::DEFAULT_TIMEOUT),
            accept_invalid_certs: false,
        }
    }

    /// 設置 User-Agent。
    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_owned();
        self
    }

    /// 設置單一請求的逾時；`None` 表示不設逾時。
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// 是否接受無效的 TLS 憑證。僅應用於本地預先檢查。
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn is_insecure(&self) -> bool {
        self.accept_invalid_certs
    }

    /// 根據設定建立 [`ReqwestClient`]。
    pub fn build(&self) -> Result<ReqwestClient> {
        let mut builder = Client::builder()
            .user_agent(self.user_agent.clone())
            .danger_accept_invalid_certs(self.accept_invalid_certs);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(ReqwestClient {
            client: builder.build().map_err(TransportError::Client)?,
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 基於 `reqwest` 阻塞式用戶端的 [`HttpClient`] 實作。
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl HttpClient for ReqwestClient {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = Url::parse(&request.url)
            .map_err(|_| TransportError::InvalidUrl(request.url.clone()))?;
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Head => self.client.head(url),
            HttpMethod::Post => self.client.post(url).body(request.body.clone()),
        };
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(accept) = &request.accept {
            builder = builder.header(reqwest::header::ACCEPT, accept);
        }

        let map_err = |source| TransportError::Request {
            url: request.url.clone(),
            source,
        };
        let response = builder.send().map_err(map_err)?;
        let status = response.status().as_u16();
        // 跟隨轉址後，相對連結以最終網址解析
        let final_url = response.url().to_string();
        debug!("{} {} -> {} {}", request.method, request.url, final_url, status);

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        let body = response.bytes().map_err(map_err)?.to_vec();

        Ok(HttpResponse::from_parts(
            &final_url,
            status,
            headers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
            body,
        ))
    }
}
