use chrono::Utc;
use log::info;
use openssl::{asn1::Asn1Time, x509::X509};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    client::{require_location, AcmeClient},
    error::{AcmeError, Result},
    http::CONTENT_TYPE_PKIX_CERT,
    payload::{NewCertificatePayload, PayloadT},
    signing_key::SigningKey,
};

/// 本地證書操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
}

/// 伺服器簽發的證書。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// DER 編碼的證書內容。
    #[serde(with = "crate::base64::serde_url")]
    pub der: Vec<u8>,
    pub location: String,
    /// 簽發者證書（`Link: rel="up"`）。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_link: Option<String>,
}

impl Certificate {
    /// 提交 CSR 與已完成的授權，申請證書。
    ///
    /// # 參數
    ///
    /// * `client` - 協議用戶端
    /// * `key` - 帳戶簽名金鑰
    /// * `cert_link` - 證書端點，來自授權的 `Link: rel="next"`
    /// * `csr_der` - DER 編碼的 CSR
    /// * `authorizations` - 已完成授權的位置
    ///
    /// # 錯誤
    ///
    /// 回應的 Content-Type 不是 `application/pkix-cert`、缺少 `Location`，或內容不是
    /// 合法的 DER 證書時，即使狀態碼為 2xx 也回傳 [`AcmeError::Protocol`]。
    pub fn request(
        client: &AcmeClient,
        key: &SigningKey,
        cert_link: &str,
        csr_der: &[u8],
        authorizations: &[String],
    ) -> Result<Self> {
        let payload = NewCertificatePayload::new(csr_der, authorizations);
        payload.validate()?;
        let response = client.post(key, cert_link, &payload, Some(CONTENT_TYPE_PKIX_CERT))?;

        if response.content_type.as_deref() != Some(CONTENT_TYPE_PKIX_CERT) {
            return Err(AcmeError::Protocol {
                url: cert_link.to_owned(),
                status: response.status,
                reason: format!(
                    "unexpected content type {:?}, expected {}",
                    response.content_type.as_deref().unwrap_or_default(),
                    CONTENT_TYPE_PKIX_CERT
                ),
                body: response.body_text(),
            });
        }
        let location = require_location(cert_link, &response)?;
        if let Err(e) = X509::from_der(&response.body) {
            return Err(AcmeError::protocol(
                cert_link,
                response.status,
                format!("malformed certificate: {}", e),
            ));
        }

        let certificate = Certificate {
            der: response.body,
            location,
            issuer_link: response.links.get("up").map(str::to_owned),
        };
        info!("Issued certificate {}", certificate.location);
        Ok(certificate)
    }

    /// 解析為 X.509 證書。
    pub fn to_x509(&self) -> std::result::Result<X509, CertificateError> {
        Ok(X509::from_der(&self.der)?)
    }

    /// 以 PEM 格式匯出。
    pub fn to_pem(&self) -> std::result::Result<Vec<u8>, CertificateError> {
        Ok(self.to_x509()?.to_pem()?)
    }

    /// 判斷證書是否應該進行續約
    ///
    /// 剩餘有效時間低於 `threshold_days` 天，或已過期時回傳 `true`。
    pub fn should_renew(&self, threshold_days: u32) -> std::result::Result<bool, CertificateError> {
        let cert = self.to_x509()?;
        let now = Asn1Time::from_unix(Utc::now().timestamp())?;
        let diff = now.diff(cert.not_after())?;
        let remaining_seconds = diff.days as i64 * 86400 + diff.secs as i64;
        let threshold_seconds = threshold_days as i64 * 86400;

        Ok(remaining_seconds < threshold_seconds)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use openssl::{
        asn1::Asn1Time,
        hash::MessageDigest,
        x509::{X509NameBuilder, X509},
    };

    use super::*;
    use crate::{
        jws::Jws,
        nonce::MockNonce,
        signing_key::{Curve, KeyType},
        testing::MockHttp,
    };

    const NEW_CERT: &str = "https://ca.example/acme/new-cert";

    fn self_signed(key: &SigningKey, days: u32) -> Vec<u8> {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "example.com").unwrap();
        let name = name.build();
        let not_before = Asn1Time::days_from_now(0).unwrap();
        let not_after = Asn1Time::days_from_now(days).unwrap();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(key.private_key()).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder.sign(key.private_key(), MessageDigest::sha256()).unwrap();
        builder.build().to_der().unwrap()
    }

    fn setup() -> Result<(Arc<MockHttp>, AcmeClient, SigningKey)> {
        let http = Arc::new(MockHttp::new());
        let client = AcmeClient::with_parts(http.clone(), Box::new(MockNonce::new("n")));
        let key = SigningKey::generate(KeyType::Ec(Curve::P256))?;
        Ok((http, client, key))
    }

    #[test]
    fn test_request_parses_certificate() -> Result<()> {
        let (http, client, key) = setup()?;
        let der = self_signed(&key, 90);
        http.push(
            MockHttp::response(201)
                .header("Content-Type", "application/pkix-cert")
                .header("Location", "/acme/cert/1")
                .header("Link", "</acme/issuer-cert>;rel=\"up\"")
                .body(der.clone()),
        );

        let authz = vec!["https://ca.example/acme/authz/1".to_owned()];
        let cert = Certificate::request(&client, &key, NEW_CERT, &[0x30, 0x00], &authz)?;
        assert_eq!(cert.der, der);
        assert_eq!(cert.location, "https://ca.example/acme/cert/1");
        assert_eq!(cert.issuer_link.as_deref(), Some("https://ca.example/acme/issuer-cert"));

        let request = http.requests().pop().unwrap();
        assert_eq!(request.accept.as_deref(), Some(CONTENT_TYPE_PKIX_CERT));
        let jws: Jws = serde_json::from_slice(&request.body)?;
        let payload = jws.verify(&key.public_key()?)?.unwrap().payload;
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&payload)?,
            serde_json::json!({"csr": "MAA", "authorizations": authz})
        );
        Ok(())
    }

    #[test]
    fn test_json_content_type_is_protocol_error() -> Result<()> {
        let (http, client, key) = setup()?;
        http.push(
            MockHttp::response(200)
                .header("Location", "/acme/cert/1")
                .json(serde_json::json!({"detail": "oops"})),
        );
        match Certificate::request(&client, &key, NEW_CERT, &[0x30, 0x00], &[]) {
            Err(AcmeError::Protocol { status, body, .. }) => {
                assert_eq!(status, 200);
                assert!(body.contains("oops"));
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_missing_location_and_malformed_body() -> Result<()> {
        let (http, client, key) = setup()?;
        http.push(
            MockHttp::response(201)
                .header("Content-Type", "application/pkix-cert")
                .body(self_signed(&key, 90)),
        );
        assert!(Certificate::request(&client, &key, NEW_CERT, &[0x30, 0x00], &[])
            .unwrap_err()
            .is_protocol());

        http.push(
            MockHttp::response(201)
                .header("Content-Type", "application/pkix-cert")
                .header("Location", "/acme/cert/1")
                .body("not a certificate"),
        );
        assert!(Certificate::request(&client, &key, NEW_CERT, &[0x30, 0x00], &[])
            .unwrap_err()
            .is_protocol());
        Ok(())
    }

    #[test]
    fn test_should_renew() -> Result<()> {
        let key = SigningKey::generate(KeyType::default())?;
        let cert = Certificate {
            der: self_signed(&key, 10),
            location: "https://ca.example/acme/cert/1".to_owned(),
            issuer_link: None,
        };
        assert!(cert.should_renew(30).unwrap());
        assert!(!cert.should_renew(5).unwrap());
        assert!(String::from_utf8(cert.to_pem().unwrap()).unwrap().contains("BEGIN CERTIFICATE"));

        let json = serde_json::to_string(&cert)?;
        assert_eq!(serde_json::from_str::<Certificate>(&json)?, cert);
        Ok(())
    }
}
