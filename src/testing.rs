//! 測試用的腳本化 HTTP 傳輸。

use std::{
    collections::VecDeque,
    sync::Mutex,
};

use crate::http::{HttpClient, HttpRequest, HttpResponse, TransportError};

/// 預先排好的回應。
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MockResponse {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(value.to_string())
    }
}

/// 依序回放預先排好的回應，並記錄收到的請求。
#[derive(Debug, Default)]
pub struct MockHttp {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response(status: u16) -> MockResponse {
        MockResponse {
            status,
            ..Default::default()
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpClient for MockHttp {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected {} {}", request.method, request.url));

        Ok(HttpResponse::from_parts(
            &request.url,
            response.status,
            response
                .headers
                .iter()
                .map(|(n, v)| (n.as_str(), v.as_str())),
            response.body,
        ))
    }
}
