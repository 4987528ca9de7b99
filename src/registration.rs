//! 帳戶註冊的建立、更新與查詢。

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    client::{parse_json, require_link, require_location, AcmeClient},
    error::{AcmeError, Result},
    http::HttpResponse,
    jwk::Jwk,
    payload::{NewRegistrationPayload, PayloadT, UpdateRegistrationPayload},
    signing_key::SigningKey,
};

/// 伺服器上的帳戶註冊資源。
///
/// 連結欄位具有黏性：後續回應若省略某個連結，保留先前的值而不清空。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// 註冊資源本身的 URL。
    pub location: String,
    /// 建立授權的端點（`Link: rel="next"`）。
    pub authorization_link: String,
    /// 服務條款（`Link: rel="terms-of-service"`）。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service_link: Option<String>,
    #[serde(rename = "key", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
    /// 伺服器發放的復原權杖，預設不保存。
    #[serde(skip)]
    pub recovery_token: Option<String>,
}

/// 註冊回應的 JSON 內容。
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRegistration {
    key: Option<Jwk>,
    #[serde(default)]
    contact: Vec<String>,
    agreement: Option<String>,
    recovery_token: Option<String>,
}

impl Registration {
    /// 建立新註冊。
    ///
    /// # 參數
    ///
    /// * `client` - 協議用戶端
    /// * `url` - 註冊端點
    /// * `key` - 帳戶簽名金鑰；每個註冊應使用獨立的金鑰
    /// * `contact` - 聯絡方式，例如 `mailto:admin@example.com`
    ///
    /// # 錯誤
    ///
    /// 回應缺少 `Location` 或 `Link: rel="next"` 時回傳 [`AcmeError::Protocol`]，
    /// 回傳的公鑰不符時回傳 [`AcmeError::Integrity`]。
    pub fn create(
        client: &AcmeClient,
        url: &str,
        key: &SigningKey,
        contact: &[String],
    ) -> Result<Self> {
        let payload = NewRegistrationPayload::new(contact);
        payload.validate()?;
        let response = client.post(key, url, &payload, None)?;

        let location = require_location(url, &response)?;
        let authorization_link = require_link(url, &response, "next")?;
        let registration = Self::from_response(url, &response, key, location, authorization_link, None)?;
        info!("Created registration {}", registration.location);
        Ok(registration)
    }

    /// 更新聯絡方式與同意的服務條款。
    pub fn update(
        client: &AcmeClient,
        key: &SigningKey,
        registration: &Registration,
        contact: &[String],
        agreement: Option<&str>,
    ) -> Result<Self> {
        let payload = UpdateRegistrationPayload::new(contact, agreement);
        payload.validate()?;
        registration.send(client, key, &payload)
    }

    /// 以空載荷查詢註冊目前的狀態。
    pub fn fetch(client: &AcmeClient, key: &SigningKey, registration: &Registration) -> Result<Self> {
        registration.send(client, key, &UpdateRegistrationPayload::default())
    }

    /// 伺服器提供服務條款且尚未同意時回傳 `true`。
    pub fn needs_agreement(&self) -> bool {
        match (&self.terms_of_service_link, &self.agreement) {
            (Some(terms), Some(agreed)) => terms != agreed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// 同意目前的服務條款。
    pub fn agree_to_terms(&self, client: &AcmeClient, key: &SigningKey) -> Result<Self> {
        let terms = self.terms_of_service_link.as_deref().ok_or_else(|| {
            AcmeError::Validation("registration has no terms of service link".to_owned())
        })?;
        Self::update(client, key, self, &self.contact, Some(terms))
    }

    fn send(
        &self,
        client: &AcmeClient,
        key: &SigningKey,
        payload: &UpdateRegistrationPayload,
    ) -> Result<Self> {
        let url = self.location.as_str();
        let response = client.post(key, url, payload, None)?;

        let location = response.location.clone().unwrap_or_else(|| self.location.clone());
        let authorization_link = match response.links.get("next") {
            Some(link) => link.to_owned(),
            None => {
                warn!("Registration response from {} has no next link, keeping previous", url);
                self.authorization_link.clone()
            }
        };
        Self::from_response(url, &response, key, location, authorization_link, Some(self))
    }

    fn from_response(
        url: &str,
        response: &HttpResponse,
        key: &SigningKey,
        location: String,
        authorization_link: String,
        previous: Option<&Registration>,
    ) -> Result<Self> {
        let raw: RawRegistration = parse_json(url, response)?;
        let public_key = verify_key(url, raw.key, key)?;

        let terms_of_service_link = response
            .links
            .get("terms-of-service")
            .map(str::to_owned)
            .or_else(|| previous.and_then(|p| p.terms_of_service_link.clone()));

        Ok(Registration {
            location,
            authorization_link,
            terms_of_service_link,
            public_key: Some(public_key),
            contact: raw.contact,
            agreement: raw.agreement,
            recovery_token: raw.recovery_token,
        })
    }
}

/// 確認伺服器回傳的公鑰就是簽名金鑰的公鑰。
fn verify_key(url: &str, echoed: Option<Jwk>, key: &SigningKey) -> Result<Jwk> {
    let expected = key.public_key()?;
    match echoed {
        Some(jwk) if jwk.same_key(&expected) => Ok(jwk),
        Some(_) => Err(AcmeError::Integrity(format!(
            "registration at {} returned a different public key",
            url
        ))),
        None => Err(AcmeError::Integrity(format!(
            "registration at {} did not return a public key",
            url
        ))),
    }
}
