use serde::{Deserialize, Serialize};

use crate::{
    base64::Base64,
    error::{AcmeError, Result},
};

/// 定義所有 API 載荷（Payload）必須實作的功能。
///
/// 載荷由 [`AcmeClient::post`](crate::client::AcmeClient::post) 序列化後簽名，
/// 實作者必須提供送出前的驗證邏輯。
pub trait PayloadT: Serialize + for<'de> Deserialize<'de> {
    /// 送出前檢查載荷資料。
    ///
    /// # 錯誤
    ///
    /// 若驗證失敗，則回傳 [`AcmeError::Validation`]。
    fn validate(&self) -> Result<()>;
}

/// 建立新註冊所需的載荷資料。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRegistrationPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
}

impl NewRegistrationPayload {
    pub fn new(contact: &[String]) -> Self {
        NewRegistrationPayload {
            contact: contact.to_vec(),
        }
    }
}

impl PayloadT for NewRegistrationPayload {
    /// 聯絡方式不得為空字串。
    fn validate(&self) -> Result<()> {
        validate_contact(&self.contact)
    }
}

/// 更新或查詢註冊時的載荷資料。
///
/// 所有欄位為空時序列化為 `{}`，伺服器只回傳目前狀態。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRegistrationPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}

impl UpdateRegistrationPayload {
    pub fn new(contact: &[String], agreement: Option<&str>) -> Self {
        UpdateRegistrationPayload {
            contact: contact.to_vec(),
            agreement: agreement.filter(|a| !a.is_empty()).map(str::to_owned),
        }
    }
}

impl PayloadT for UpdateRegistrationPayload {
    fn validate(&self) -> Result<()> {
        validate_contact(&self.contact)
    }
}

fn validate_contact(contact: &[String]) -> Result<()> {
    if contact.iter().any(|c| c.trim().is_empty()) {
        return Err(AcmeError::Validation(
            "Contact entries cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// 表示一個識別項，用來描述授權所涵蓋的主機名稱。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(domain: &str) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: domain.to_string(),
        }
    }
}

/// 表示建立新授權時所需的載荷資料。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuthorizationPayload {
    pub identifier: Identifier,
}

impl NewAuthorizationPayload {
    pub fn new(domain: &str) -> Self {
        NewAuthorizationPayload {
            identifier: Identifier::dns(domain),
        }
    }
}

impl PayloadT for NewAuthorizationPayload {
    /// 識別項類型必須為 `"dns"` 且值不得為空。
    fn validate(&self) -> Result<()> {
        if self.identifier.type_ != "dns" {
            return Err(AcmeError::Validation(
                "Identifier type must be 'dns'".to_owned(),
            ));
        }
        if self.identifier.value.is_empty() {
            return Err(AcmeError::Validation(
                "Identifier value cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// 挑戰回應的載荷資料，只攜帶該挑戰類型需要的欄位。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponsePayload {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl PayloadT for ChallengeResponsePayload {
    fn validate(&self) -> Result<()> {
        if self.type_.is_empty() {
            return Err(AcmeError::Validation(
                "Challenge response needs a type".to_owned(),
            ));
        }
        Ok(())
    }
}

/// 申請憑證時的載荷資料。
///
/// `csr` 為 DER 編碼 CSR 的 URL 安全 Base64 字串，`authorizations` 為已完成授權的位置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCertificatePayload {
    #[serde(rename = "csr")]
    csr_b64_str: String,
    pub authorizations: Vec<String>,
}

impl NewCertificatePayload {
    pub fn new(csr_der: &[u8], authorizations: &[String]) -> Self {
        NewCertificatePayload {
            csr_b64_str: Base64::new(csr_der).base64_url(),
            authorizations: authorizations.to_vec(),
        }
    }

    pub fn csr(&self) -> &str {
        &self.csr_b64_str
    }
}

impl PayloadT for NewCertificatePayload {
    fn validate(&self) -> Result<()> {
        if self.csr_b64_str.is_empty() {
            return Err(AcmeError::Validation("CSR cannot be empty".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_empty_update_serializes_to_empty_object() -> Result<()> {
        let payload = UpdateRegistrationPayload::default();
        assert_eq!(serde_json::to_string(&payload)?, "{}");
        Ok(())
    }

    #[test]
    fn test_update_payload_shape() -> Result<()> {
        let payload = UpdateRegistrationPayload::new(
            &["mailto:a@example.com".to_owned()],
            Some("https://ca.example/terms"),
        );
        assert_eq!(
            serde_json::to_value(&payload)?,
            json!({"contact": ["mailto:a@example.com"], "agreement": "https://ca.example/terms"})
        );
        Ok(())
    }

    #[test]
    fn test_new_authorization_payload() -> Result<()> {
        let payload = NewAuthorizationPayload::new("example.com");
        payload.validate()?;
        assert_eq!(
            serde_json::to_value(&payload)?,
            json!({"identifier": {"type": "dns", "value": "example.com"}})
        );
        assert!(NewAuthorizationPayload::new("").validate().is_err());
        Ok(())
    }

    #[test]
    fn test_certificate_payload_encodes_csr() -> Result<()> {
        let payload = NewCertificatePayload::new(&[0xfb, 0xff], &["https://ca.example/authz/1".to_owned()]);
        assert_eq!(payload.csr(), "-_8");
        assert_eq!(
            serde_json::to_value(&payload)?,
            json!({"csr": "-_8", "authorizations": ["https://ca.example/authz/1"]})
        );
        Ok(())
    }
}
