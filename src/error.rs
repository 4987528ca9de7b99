//! 協議層錯誤分類。
//!
//! 各模組保有自己的錯誤列舉（例如 [`KeyError`]、[`NonceError`]），
//! 在跨越協議邊界時統一轉換為 [`AcmeError`]，讓呼叫端能依錯誤種類決定重試或回報。

use thiserror::Error;

use crate::{
    base64::DecodeError, http::TransportError, nonce::NonceError, signing_key::KeyError,
};

/// 協議操作可能發生的錯誤。
///
/// 每個變體都帶有足夠的上下文（URL、狀態碼、原始回應內容）供呼叫端記錄或重試。
#[derive(Debug, Error)]
pub enum AcmeError {
    /// 網路或 I/O 失敗。
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 伺服器回應不符合協議：狀態碼錯誤、缺少必要標頭或連結、Content-Type 錯誤、JSON 格式錯誤。
    #[error("Protocol error at {url} (status {status}): {reason}")]
    Protocol {
        url: String,
        status: u16,
        reason: String,
        body: String,
    },

    /// 合併伺服器資料時欄位長度或編碼違反協議不變量。
    #[error("Validation error: {0}")]
    Validation(String),

    /// 伺服器回傳的公鑰與簽名金鑰不一致。
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// 在必要的客戶端欄位設定之前嘗試送出挑戰回應。
    #[error("Incomplete challenge response: {0}")]
    IncompleteResponse(String),

    /// 該挑戰類型沒有可回應的實作。
    #[error("Responding to challenge {index} of type {challenge_type:?} is not supported")]
    UnsupportedChallenge { index: usize, challenge_type: String },

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Unsupported elliptic curve: {0}")]
    UnsupportedCurve(String),

    /// 其他金鑰或密碼學操作錯誤。
    #[error("Key error: {0}")]
    Key(KeyError),

    #[error("Nonce error: {0}")]
    Nonce(NonceError),

    /// 本地資料序列化失敗。
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 結果類型，錯誤類型為 [`AcmeError`]。
pub type Result<T> = std::result::Result<T, AcmeError>;

impl From<KeyError> for AcmeError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::UnsupportedKeyType(kind) => AcmeError::UnsupportedKeyType(kind),
            KeyError::UnsupportedCurve(curve) => AcmeError::UnsupportedCurve(curve),
            other => AcmeError::Key(other),
        }
    }
}

impl From<NonceError> for AcmeError {
    fn from(e: NonceError) -> Self {
        match e {
            NonceError::Transport(e) => AcmeError::Transport(e),
            other => AcmeError::Nonce(other),
        }
    }
}

impl From<DecodeError> for AcmeError {
    fn from(e: DecodeError) -> Self {
        AcmeError::Validation(e.to_string())
    }
}

impl AcmeError {
    /// 建立不含回應內容的協議錯誤。
    pub(crate) fn protocol(url: &str, status: u16, reason: impl Into<String>) -> Self {
        AcmeError::Protocol {
            url: url.to_owned(),
            status,
            reason: reason.into(),
            body: String::new(),
        }
    }

    /// 判斷是否為協議錯誤。
    pub fn is_protocol(&self) -> bool {
        matches!(self, AcmeError::Protocol { .. })
    }
}
