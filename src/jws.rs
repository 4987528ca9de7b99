//! 此模組提供 JSON Web Signature (JWS) 的建立與驗證。
//!
//! 請求一律使用扁平化 JSON 序列化：`{"protected", "payload", "signature"}`。

use serde::{Deserialize, Serialize};

use crate::{
    base64::{decode_url, Base64},
    jwk::Jwk,
    protection::ProtectedHeader,
    signature::SignatureAlgorithm,
    signing_key::{KeyError, SigningKey},
};

/// 表示一個 JSON Web Signature (JWS) 物件。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jws {
    /// 對應 JWS 中的 "protected" 欄位，包含已編碼的 header 資訊。
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

/// 驗證成功後取得的 JWS 內容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedJws {
    pub header: ProtectedHeader,
    pub payload: Vec<u8>,
}

impl Jws {
    /// 以保護頭與 payload 組出簽名輸入 `header.payload`，並以金鑰簽名。
    pub(crate) fn sign(
        header: &ProtectedHeader,
        payload: &[u8],
        key: &SigningKey,
    ) -> Result<Self, KeyError> {
        let header_b64 = header.to_base64()?;
        let payload_b64 = Base64::new(payload);
        let signing_input = format!("{}.{}", header_b64.as_str(), payload_b64.as_str());
        let signature = key.sign_raw(signing_input.as_bytes())?;

        Ok(Jws {
            header: header_b64.base64_url(),
            payload: payload_b64.base64_url(),
            signature: Base64::new(signature).base64_url(),
        })
    }

    /// 以給定公鑰驗證簽名。
    ///
    /// 保護頭中的 `alg` 必須是已知演算法，且簽名必須能以 `key` 驗證，
    /// 否則回傳 `Ok(None)`。
    pub fn verify(&self, key: &Jwk) -> Result<Option<VerifiedJws>, KeyError> {
        let header_json = match decode_url(&self.header) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let header: ProtectedHeader = match serde_json::from_slice(&header_json) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };
        let Some(alg) = SignatureAlgorithm::from_name(&header.alg) else {
            return Ok(None);
        };
        let (Ok(payload), Ok(signature)) = (decode_url(&self.payload), decode_url(&self.signature))
        else {
            return Ok(None);
        };

        let signing_input = format!("{}.{}", self.header, self.payload);
        let public = key.to_public_key()?;
        if alg.verify(signing_input.as_bytes(), &signature, &public)? {
            Ok(Some(VerifiedJws { header, payload }))
        } else {
            Ok(None)
        }
    }

    /// 將 `Jws` 實例序列化為 JSON 格式的字串。
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
