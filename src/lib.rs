//! # ACME Draft Client
//!
//! 本庫實作早期 ACME 草案協議的客戶端核心：以帳戶金鑰簽名的請求、帳戶註冊、
//! 網域授權與挑戰回應，以及憑證簽發。
//!
//! - **signing_key / jws**: 帳戶金鑰與 JWS 簽名，nonce 位於受保護的標頭中。
//! - **client / nonce / http**: 簽名請求的送出與回應解析，每個 nonce 只使用一次。
//! - **registration**: 註冊的建立、更新與查詢，連結欄位在後續回應中保持不變。
//! - **authorization / challenge**: 授權狀態機與挑戰變體（DVSNI、simpleHttps 及未知類型），
//!   刷新時依挑戰 `uri` 保留客戶端已設定的欄位。
//! - **certificate / csr**: 提交 CSR 並取得 DER 憑證。
//! - **storage**: 註冊、授權與憑證的 JSON 紀錄。
//!
//! 本庫不會重試失敗的請求，也不與使用者互動；錯誤以 [`error::AcmeError`] 回報給呼叫端。
//!
//! ## 示例
//!
//! ```no_run
//! use acme_draft::{
//!     authorization::Authorization,
//!     certificate::Certificate,
//!     client::AcmeClient,
//!     csr::Csr,
//!     http::ClientConfig,
//!     registration::Registration,
//!     signing_key::{KeyType, SigningKey},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AcmeClient::new(ClientConfig::new())?;
//!     let key = SigningKey::generate(KeyType::default())?;
//!
//!     // 1. 建立註冊並同意服務條款
//!     let contact = vec!["mailto:admin@example.com".to_owned()];
//!     let mut reg = Registration::create(&client, "https://ca.example/acme/new-reg", &key, &contact)?;
//!     if reg.needs_agreement() {
//!         reg = reg.agree_to_terms(&client, &key)?;
//!     }
//!
//!     // 2. 建立授權並回應第一個挑戰
//!     let mut auth = Authorization::create(&client, &reg.authorization_link, &key, "example.com")?;
//!     {
//!         let mut responder = auth.respond(0)?;
//!         responder.initialize_response()?;
//!         println!("{}", responder.describe_provisioning_action()?);
//!         responder.submit(&client, &key)?;
//!     }
//!     auth.refresh(&client)?;
//!
//!     // 3. 申請憑證
//!     let cert_key = SigningKey::generate(KeyType::default())?;
//!     let csr = Csr::new().set_san("example.com").build_der(&cert_key)?;
//!     let cert = Certificate::request(&client, &key, &auth.cert_link, &csr, &[auth.location.clone()])?;
//!     std::fs::write("example.com.pem", cert.to_pem()?)?;
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod base64;
pub mod certificate;
pub mod challenge;
pub mod client;
pub mod csr;
pub mod dvsni;
pub mod error;
pub mod http;
pub mod jwk;
pub mod jws;
pub mod nonce;
pub mod payload;
pub mod protection;
pub mod registration;
pub mod signature;
pub mod signing_key;
pub mod simple_https;
pub mod storage;

#[cfg(test)]
mod testing;
