use std::result;

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::signing_key::SigningKey;

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
}

/// 為簡化錯誤處理定義 Result 類型
type Result<T> = result::Result<T, CsrError>;

/// CSR 建構器，產生包含主體替代名稱 (SAN) 擴展的證書簽名請求。
///
/// 第一個 SAN 同時作為主體的 CN。
///
/// # 範例
///
/// ```
/// # use acme_draft::{csr::Csr, signing_key::{KeyType, SigningKey}};
/// let key = SigningKey::generate(KeyType::default()).expect("金鑰生成失敗");
/// let der = Csr::new()
///     .set_san("example.com")
///     .set_san("www.example.com")
///     .build_der(&key)
///     .expect("CSR 建立失敗");
/// assert!(!der.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Csr {
    san_entries: Vec<String>,
}

impl Csr {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一個 DNS 主體替代名稱 (SAN)。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    /// 根據已設定的 SAN 項目建立並以 `key` 簽署 CSR。
    ///
    /// # 參數
    ///
    /// * `key` - 憑證金鑰，應與帳戶金鑰不同。
    ///
    /// # 錯誤
    ///
    /// 未設定任何 SAN 時回傳 `CsrError::NoSanEntries`。
    pub fn build(self, key: &SigningKey) -> Result<X509Req> {
        let Some(common_name) = self.san_entries.first() else {
            return Err(CsrError::NoSanEntries);
        };

        let mut req_builder = X509Req::builder()?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        req_builder.set_subject_name(&name.build())?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(key.private_key())?;
        req_builder.sign(key.private_key(), MessageDigest::sha256())?;

        Ok(req_builder.build())
    }

    /// 建立 DER 編碼的 CSR，可直接交給 [`Certificate::request`](crate::certificate::Certificate::request)。
    pub fn build_der(self, key: &SigningKey) -> Result<Vec<u8>> {
        Ok(self.build(key)?.to_der()?)
    }
}
