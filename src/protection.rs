use serde::{Deserialize, Serialize};

use crate::{base64::Base64, jwk::Jwk, signature::SignatureAlgorithm};

/// 用於生成保護頭（Protected Header）的結構體。
///
/// 早期草案協議的每個簽名請求都直接攜帶帳戶公鑰（`jwk`），沒有 `kid` 形式。
pub struct Protection {
    alg: SignatureAlgorithm,
    jwk: Jwk,
}

/// 數字簽章的保護頭部，序列化後作為 JWS 的 `protected` 欄位。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    /// 簽章演算法
    pub alg: String,
    /// 簽署者的公鑰
    pub jwk: Jwk,
    /// 伺服器發放的一次性 nonce
    pub nonce: String,
}

impl ProtectedHeader {
    /// 將保護頭序列化並以 URL 安全 Base64 編碼。
    pub fn to_base64(&self) -> Result<Base64, serde_json::Error> {
        Ok(Base64::new(serde_json::to_vec(self)?))
    }
}

impl Protection {
    pub fn new(alg: SignatureAlgorithm, jwk: Jwk) -> Self {
        Self { alg, jwk }
    }

    /// 以指定 nonce 生成保護頭。
    pub fn create_header(&self, nonce: impl Into<String>) -> ProtectedHeader {
        ProtectedHeader {
            alg: self.alg.name().to_owned(),
            jwk: self.jwk.clone(),
            nonce: nonce.into(),
        }
    }
}
