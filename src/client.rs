//! 簽名請求協議。
//!
//! [`AcmeClient`] 負責取得 nonce、以帳戶金鑰產生 JWS、送出請求並回收回應中的新 nonce。
//! 上層的註冊、授權與憑證模組只處理各自的 JSON 與標頭慣例。

use std::sync::Arc;

use log::debug;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{AcmeError, Result},
    http::{ClientConfig, HttpClient, HttpMethod, HttpRequest, HttpResponse, CONTENT_TYPE_JSON},
    nonce::{Nonce, NonceT},
    signing_key::SigningKey,
};

/// 協議用戶端，持有 HTTP 傳輸與 nonce 來源。
pub struct AcmeClient {
    http: Arc<dyn HttpClient>,
    nonce: Box<dyn NonceT>,
    config: ClientConfig,
}

impl AcmeClient {
    /// 依設定建立用戶端。
    ///
    /// # 錯誤
    ///
    /// 設定要求略過 TLS 驗證時回傳 [`AcmeError::Validation`]：協議請求一律驗證憑證，
    /// 不安全用戶端只能透過 [`AcmeClient::insecure_client`] 另外取得。
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.is_insecure() {
            return Err(AcmeError::Validation(
                "protocol client must verify TLS certificates".to_owned(),
            ));
        }
        let http: Arc<dyn HttpClient> = Arc::new(config.build()?);
        let nonce = Box::new(Nonce::new(http.clone()));
        Ok(Self {
            http,
            nonce,
            config,
        })
    }

    /// 以自訂傳輸與 nonce 來源建立用戶端。
    pub fn with_parts(http: Arc<dyn HttpClient>, nonce: Box<dyn NonceT>) -> Self {
        Self {
            http,
            nonce,
            config: ClientConfig::default(),
        }
    }

    /// 取得底層 HTTP 傳輸。
    pub fn http(&self) -> &dyn HttpClient {
        self.http.as_ref()
    }

    /// 建立一個明確略過 TLS 驗證的用戶端，只用於挑戰回應的本地預先檢查。
    pub fn insecure_client(&self) -> Result<Arc<dyn HttpClient>> {
        let client = self.config.clone().accept_invalid_certs(true).build()?;
        Ok(Arc::new(client))
    }

    /// 對 `url` 送出簽名的 POST 請求。
    ///
    /// 每次呼叫恰好消耗一個 nonce；回應附帶的 `Replay-Nonce` 會被保存供下次使用。
    ///
    /// # 參數
    ///
    /// * `key` - 帳戶簽名金鑰
    /// * `url` - 目標 URL
    /// * `payload` - 要簽名的 JSON 載荷
    /// * `accept` - 選填的 `Accept` 標頭
    ///
    /// # 錯誤
    ///
    /// 網路錯誤回傳 [`AcmeError::Transport`]，非 2xx 狀態回傳 [`AcmeError::Protocol`]。
    pub fn post<P: Serialize>(
        &self,
        key: &SigningKey,
        url: &str,
        payload: &P,
        accept: Option<&str>,
    ) -> Result<HttpResponse> {
        let body = serde_json::to_vec(payload)?;
        let nonce = self.nonce.get(url)?;
        let jws = key.sign(&body, &nonce)?;

        let mut request = HttpRequest::new(HttpMethod::Post, url)
            .content_type(CONTENT_TYPE_JSON)
            .body(jws.to_json()?);
        if let Some(accept) = accept {
            request = request.accept(accept);
        }

        debug!("POST {} {}", url, String::from_utf8_lossy(&body));
        let response = self.execute(&request)?;
        check_status(url, response)
    }

    /// 對 `url` 送出未簽名的 GET 請求。
    pub fn get(&self, url: &str) -> Result<HttpResponse> {
        debug!("GET {}", url);
        let response = self.execute(&HttpRequest::new(HttpMethod::Get, url))?;
        check_status(url, response)
    }

    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let response = self.http.execute(request)?;
        if let Some(nonce) = &response.replay_nonce {
            self.nonce.store(nonce.clone());
        }
        Ok(response)
    }
}

fn check_status(url: &str, response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    Err(AcmeError::Protocol {
        url: url.to_owned(),
        status: response.status,
        reason: format!("unexpected status {}", response.status),
        body: response.body_text(),
    })
}

/// 解析回應 JSON；格式錯誤屬於協議錯誤。
pub(crate) fn parse_json<T: DeserializeOwned>(url: &str, response: &HttpResponse) -> Result<T> {
    serde_json::from_slice(&response.body).map_err(|e| AcmeError::Protocol {
        url: url.to_owned(),
        status: response.status,
        reason: format!("malformed JSON: {}", e),
        body: response.body_text(),
    })
}

/// 取得必要的 `Location` 標頭。
pub(crate) fn require_location(url: &str, response: &HttpResponse) -> Result<String> {
    response
        .location
        .clone()
        .ok_or_else(|| AcmeError::protocol(url, response.status, "missing Location header"))
}

/// 取得必要的 `Link` 關係。
pub(crate) fn require_link(url: &str, response: &HttpResponse, rel: &str) -> Result<String> {
    response.links.get(rel).map(str::to_owned).ok_or_else(|| {
        AcmeError::protocol(
            url,
            response.status,
            format!("missing Link rel=\"{}\" header", rel),
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        http::TransportError,
        jws::Jws,
        nonce::MockNonce,
        signing_key::{Curve, KeyType},
        testing::MockHttp,
    };

    #[test]
    fn test_post_signs_payload_with_fresh_nonce() -> Result<()> {
        let http = Arc::new(MockHttp::new());
        http.push(MockHttp::response(201));
        http.push(MockHttp::response(201));
        let client = AcmeClient::with_parts(http.clone(), Box::new(MockNonce::new("n")));
        let key = SigningKey::generate(KeyType::Ec(Curve::P256))?;

        client.post(&key, "https://ca.example/new-reg", &json!({"contact": []}), None)?;
        client.post(&key, "https://ca.example/new-reg", &json!({}), None)?;

        let requests = http.requests();
        assert_eq!(requests[0].content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        let mut nonces = Vec::new();
        for request in &requests {
            let jws: Jws = serde_json::from_slice(&request.body)?;
            let verified = jws.verify(&key.public_key()?)?.expect("valid signature");
            nonces.push(verified.header.nonce);
        }
        assert_eq!(nonces, vec!["n-0", "n-1"]);
        Ok(())
    }

    #[test]
    fn test_error_status_carries_body() -> Result<()> {
        let http = Arc::new(MockHttp::new());
        http.push(MockHttp::response(400).body(r#"{"type":"malformed"}"#));
        let client = AcmeClient::with_parts(http, Box::new(MockNonce::new("n")));
        let key = SigningKey::generate(KeyType::default())?;

        match client.post(&key, "https://ca.example/new-reg", &json!({}), None) {
            Err(AcmeError::Protocol { status, body, .. }) => {
                assert_eq!(status, 400);
                assert!(body.contains("malformed"));
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_replay_nonce_is_harvested() -> Result<()> {
        let http = Arc::new(MockHttp::new());
        http.push(MockHttp::response(200).header("Replay-Nonce", "fresh"));
        http.push(MockHttp::response(201));
        let client = AcmeClient::with_parts(http.clone(), Box::new(Nonce::new(http.clone())));
        let key = SigningKey::generate(KeyType::default())?;

        client.get("https://ca.example/authz/1")?;
        client.post(&key, "https://ca.example/new-authz", &json!({}), None)?;

        let requests = http.requests();
        // 沒有額外的 HEAD 請求
        assert_eq!(requests.len(), 2);
        let jws: Jws = serde_json::from_slice(&requests[1].body)?;
        let verified = jws.verify(&key.public_key()?)?.expect("valid signature");
        assert_eq!(verified.header.nonce, "fresh");
        Ok(())
    }

    struct UnreachableHttp;

    impl HttpClient for UnreachableHttp {
        fn execute(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            Err(TransportError::InvalidUrl(request.url.clone()))
        }
    }

    #[test]
    fn test_network_failure_is_transport_error() -> Result<()> {
        let http: Arc<dyn HttpClient> = Arc::new(UnreachableHttp);
        let client = AcmeClient::with_parts(http.clone(), Box::new(Nonce::new(http)));
        let key = SigningKey::generate(KeyType::default())?;

        // HEAD 取得 nonce 時即失敗
        let err = client
            .post(&key, "https://ca.example/new-reg", &json!({}), None)
            .unwrap_err();
        assert!(matches!(err, AcmeError::Transport(_)), "got {:?}", err);

        let err = client.get("https://ca.example/authz/1").unwrap_err();
        assert!(matches!(err, AcmeError::Transport(_)), "got {:?}", err);
        Ok(())
    }

    #[test]
    fn test_insecure_protocol_client_is_rejected() {
        let config = ClientConfig::new().accept_invalid_certs(true);
        assert!(matches!(
            AcmeClient::new(config),
            Err(AcmeError::Validation(_))
        ));
    }
}
