use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use thiserror::Error;

/// 錯誤類型，用於描述 Base64 URL 解碼過程中的錯誤。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// 字串不是合法的 URL 安全 Base64 編碼。
    #[error("Invalid base64url data {input:?}: {reason}")]
    Invalid { input: String, reason: String },
}

/// 協議使用的 URL 安全 Base64：編碼時不加填充，解碼時容許有或沒有填充。
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// 提供 URL 安全 Base64 編碼與解碼功能的結構體。
///
/// # 示例
///
/// ```
/// # use acme_draft::base64::Base64;
/// let b64 = Base64::new("Hello, World!");
/// assert_eq!(b64.base64_url(), "SGVsbG8sIFdvcmxkIQ");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64 {
    encoded: String,
}

impl Base64 {
    /// 根據輸入數據生成 URL 安全的 Base64 編碼。
    pub fn new<T: AsRef<[u8]>>(input: T) -> Self {
        Self {
            encoded: URL_SAFE.encode(input.as_ref()),
        }
    }

    /// 從 URL 安全格式的 Base64 字符串生成 `Base64` 實例，並立即驗證其可解碼。
    ///
    /// # 錯誤
    ///
    /// 字串含有非字母表字元或長度不合法時返回 [`DecodeError::Invalid`]。
    pub fn from_url(url_encoded: &str) -> Result<Self, DecodeError> {
        let b64 = Self {
            encoded: url_encoded.trim_end_matches('=').to_string(),
        };
        b64.decode()?;
        Ok(b64)
    }

    /// 將當前編碼的數據解碼為原始二進制數據。
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        URL_SAFE
            .decode(self.encoded.as_bytes())
            .map_err(|e| DecodeError::Invalid {
                input: self.encoded.clone(),
                reason: e.to_string(),
            })
    }

    /// 返回不含填充的 URL 安全 Base64 字串。
    pub fn base64_url(&self) -> String {
        self.encoded.clone()
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

/// 直接解碼 URL 安全 Base64 字串；空字串解碼為空位元組。
pub fn decode_url(input: &str) -> Result<Vec<u8>, DecodeError> {
    Base64::from_url(input)?.decode()
}

/// 以 URL 安全 Base64 字串形式序列化位元組欄位，供持久化記錄使用。
pub(crate) mod serde_url {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{decode_url, Base64};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Base64::new(bytes).as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode_url(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_safe_encoding_has_no_padding() {
        let url_safe = Base64::new([0xfb, 0xff, 0xfe, 0x01]).base64_url();
        assert_eq!(url_safe, "-__-AQ");
        assert!(!url_safe.contains('+'));
        assert!(!url_safe.contains('/'));
        assert!(!url_safe.contains('='));
    }

    #[test]
    fn test_different_lengths() {
        assert_eq!(Base64::new("a").as_str(), "YQ");
        assert_eq!(Base64::new("ab").as_str(), "YWI");
        assert_eq!(Base64::new("abc").as_str(), "YWJj");
    }

    #[test]
    fn test_from_url_accepts_padding() {
        let padded = Base64::from_url("SGVsbG8sIFdvcmxkIQ==").unwrap();
        let bare = Base64::from_url("SGVsbG8sIFdvcmxkIQ").unwrap();
        assert_eq!(padded, bare);
        assert_eq!(bare.decode().unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_empty_input_decodes_to_empty() {
        assert_eq!(decode_url("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_invalid_char() {
        assert!(matches!(
            Base64::from_url("SGVsbG8$Ww"),
            Err(DecodeError::Invalid { .. })
        ));
    }

    #[test]
    fn test_standard_alphabet_is_rejected() {
        assert!(Base64::from_url("+/8").is_err());
    }
}
