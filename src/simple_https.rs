use log::warn;
use serde_json::{Map, Value};

use crate::{
    challenge::{string_field, ChallengeType, Responding},
    error::{AcmeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest},
    payload::ChallengeResponsePayload,
};

/// simpleHttps 挑戰：在固定前綴的 HTTPS 網址提供伺服器發放的權杖。
///
/// `token` 由伺服器發放；`path` 由客戶端選擇，並在刷新之間保留。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleHttps {
    token: String,
    path: String,
}

impl SimpleHttps {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 設定自訂路徑，取代預設的 `<domain>.txt`。
    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_owned();
    }

    /// 權杖必須放置的網址。
    pub fn well_known_url(&self, domain: &str) -> String {
        format!("https://{}/.well-known/acme-challenge/{}", domain, self.path)
    }

    /// 一律採用伺服器的 `token`；`path` 只在伺服器有提供時採用。
    pub(crate) fn merge(&mut self, value: &Map<String, Value>) -> Result<()> {
        let token = string_field(value, "token")?;
        let path = string_field(value, "path")?;
        self.token = token;
        if !path.is_empty() {
            self.path = path;
        }
        Ok(())
    }

    pub(crate) fn inherit(&mut self, previous: &SimpleHttps) {
        if previous.path.is_empty() {
            return;
        }
        if !self.path.is_empty() && self.path != previous.path {
            warn!(
                "Server echoed path {:?}, keeping the client path {:?}",
                self.path, previous.path
            );
        }
        self.path = previous.path.clone();
    }

    pub(crate) fn write_fields(&self, out: &mut Map<String, Value>) {
        if !self.token.is_empty() {
            out.insert("token".to_owned(), Value::String(self.token.clone()));
        }
        if !self.path.is_empty() {
            out.insert("path".to_owned(), Value::String(self.path.clone()));
        }
    }
}

impl Responding for SimpleHttps {
    fn reset_response(&mut self) {
        self.path.clear();
    }

    fn initialize_response(&mut self, domain: &str) -> Result<()> {
        if self.path.is_empty() {
            self.path = format!("{}.txt", domain);
        }
        Ok(())
    }

    fn describe_provisioning_action(&self, domain: &str) -> Result<String> {
        if self.path.is_empty() {
            return Err(AcmeError::IncompleteResponse(
                "simpleHttps path is not set".to_owned(),
            ));
        }
        Ok(format!(
            "Make the quoted token on the next line available (without quotes) as {}\n{:?}",
            self.well_known_url(domain),
            self.token
        ))
    }

    /// 取回權杖網址並比對內容：狀態碼必須為 200，內容與權杖完全相同，
    /// Content-Type 必須不存在或為 `text/plain`。
    fn local_verify(&self, domain: &str, client: &dyn HttpClient) -> Result<()> {
        if self.path.is_empty() {
            return Err(AcmeError::IncompleteResponse(
                "simpleHttps path is not set".to_owned(),
            ));
        }
        let url = self.well_known_url(domain);
        let response = client.execute(&HttpRequest::new(HttpMethod::Get, url.as_str()))?;

        if response.status != 200 {
            return Err(AcmeError::protocol(&url, response.status, "token document not found"));
        }
        if response.body != self.token.as_bytes() {
            return Err(AcmeError::Protocol {
                url: url.clone(),
                status: response.status,
                reason: format!("document does not contain the expected token {:?}", self.token),
                body: response.body_text(),
            });
        }
        match response.content_type.as_deref() {
            None | Some("") | Some("text/plain") => Ok(()),
            Some(other) => Err(AcmeError::protocol(
                &url,
                response.status,
                format!("wrong content type {:?}, expected none or text/plain", other),
            )),
        }
    }

    fn build_response_payload(&self) -> Result<ChallengeResponsePayload> {
        if self.path.is_empty() {
            return Err(AcmeError::IncompleteResponse(
                "cannot send payload for simpleHttps as no path is set".to_owned(),
            ));
        }
        Ok(ChallengeResponsePayload {
            type_: ChallengeType::SimpleHttps.as_str().to_owned(),
            s: None,
            path: Some(self.path.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::MockHttp;

    fn challenge(token: &str, path: &str) -> SimpleHttps {
        SimpleHttps {
            token: token.to_owned(),
            path: path.to_owned(),
        }
    }

    #[test]
    fn test_merge_keeps_path_when_server_omits_it() -> Result<()> {
        let mut simple = challenge("old", "mine.txt");
        simple.merge(json!({"token": "new"}).as_object().unwrap())?;
        assert_eq!(simple.token(), "new");
        assert_eq!(simple.path(), "mine.txt");

        simple.merge(json!({"token": "new", "path": "server.txt"}).as_object().unwrap())?;
        assert_eq!(simple.path(), "server.txt");
        Ok(())
    }

    #[test]
    fn test_payload_requires_path() -> Result<()> {
        let mut simple = challenge("tok", "");
        assert!(matches!(
            simple.build_response_payload(),
            Err(AcmeError::IncompleteResponse(_))
        ));

        simple.initialize_response("example.com")?;
        assert_eq!(simple.path(), "example.com.txt");
        assert_eq!(
            simple.well_known_url("example.com"),
            "https://example.com/.well-known/acme-challenge/example.com.txt"
        );
        assert_eq!(
            serde_json::to_value(simple.build_response_payload()?)?,
            json!({"type": "simpleHttps", "path": "example.com.txt"})
        );

        simple.set_path("custom");
        simple.initialize_response("example.com")?;
        assert_eq!(simple.path(), "custom");
        simple.reset_response();
        assert_eq!(simple.path(), "");
        Ok(())
    }

    #[test]
    fn test_local_verify_checks_document() -> Result<()> {
        let simple = challenge("tok", "p.txt");
        let http = MockHttp::new();

        http.push(MockHttp::response(200).header("Content-Type", "text/plain; charset=utf-8").body("tok"));
        simple.local_verify("example.com", &http)?;
        assert_eq!(
            http.requests()[0].url,
            "https://example.com/.well-known/acme-challenge/p.txt"
        );

        http.push(MockHttp::response(200).body("tok"));
        simple.local_verify("example.com", &http)?;

        http.push(MockHttp::response(404).body("tok"));
        assert!(simple.local_verify("example.com", &http).is_err());

        http.push(MockHttp::response(200).body("tok\n"));
        assert!(simple.local_verify("example.com", &http).is_err());

        http.push(MockHttp::response(200).header("Content-Type", "text/html").body("tok"));
        assert!(simple.local_verify("example.com", &http).is_err());
        Ok(())
    }
}
