//! 挑戰（Challenge）的資料模型與變體分派。
//!
//! 每個挑戰由共同欄位（類型、狀態、驗證時間、`uri`）與變體資料組成。
//! 具備回應能力的變體實作 [`Responding`]，透過 [`ChallengeData::as_responding`] 查詢，
//! 未知類型以 [`ChallengeData::Opaque`] 原樣保存所有欄位。

use std::fmt;

use log::{debug, warn};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{
    client::{parse_json, AcmeClient},
    dvsni::Dvsni,
    error::{AcmeError, Result},
    http::HttpClient,
    payload::{ChallengeResponsePayload, PayloadT},
    signing_key::SigningKey,
    simple_https::SimpleHttps,
};

/// 挑戰的共同欄位名稱，不屬於任何變體資料。
const RESERVED_FIELDS: [&str; 4] = ["type", "status", "validated", "uri"];

/// 挑戰類型。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    Dvsni,
    SimpleHttps,
    /// 沒有對應實作的類型，保留原始名稱。
    Other(String),
}

impl ChallengeType {
    /// 根據字串返回對應的挑戰類型。
    pub fn from_str(s: &str) -> Self {
        match s {
            "dvsni" => Self::Dvsni,
            "simpleHttps" => Self::SimpleHttps,
            other => Self::Other(other.to_owned()),
        }
    }

    /// 返回挑戰類型對應的字串表示。
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dvsni => "dvsni",
            Self::SimpleHttps => "simpleHttps",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 具備回應能力的挑戰變體。
pub trait Responding {
    /// 清除客戶端設定的欄位。
    fn reset_response(&mut self);

    /// 設定回應所需的客戶端欄位；已設定的值不會被覆寫。
    fn initialize_response(&mut self, domain: &str) -> Result<()>;

    /// 描述使用者需要完成的佈署動作。
    ///
    /// # 錯誤
    ///
    /// 描述所需的客戶端欄位尚未設定時回傳 [`AcmeError::IncompleteResponse`]。
    fn describe_provisioning_action(&self, domain: &str) -> Result<String>;

    /// 送出前的本地預先檢查。
    ///
    /// `client` 由呼叫端明確提供，通常是略過 TLS 驗證的用戶端。
    fn local_verify(&self, domain: &str, client: &dyn HttpClient) -> Result<()>;

    /// 建立送往挑戰 `uri` 的最小回應載荷。
    ///
    /// # 錯誤
    ///
    /// 必要的客戶端欄位尚未設定時回傳 [`AcmeError::IncompleteResponse`]。
    fn build_response_payload(&self) -> Result<ChallengeResponsePayload>;
}

/// 挑戰的變體資料。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeData {
    Dvsni(Dvsni),
    SimpleHttps(SimpleHttps),
    /// 未知類型或沒有 `uri` 的挑戰：保存保留欄位以外的所有欄位。
    Opaque(Map<String, Value>),
}

impl ChallengeData {
    pub fn as_responding(&self) -> Option<&dyn Responding> {
        match self {
            ChallengeData::Dvsni(dvsni) => Some(dvsni),
            ChallengeData::SimpleHttps(simple) => Some(simple),
            ChallengeData::Opaque(_) => None,
        }
    }

    pub fn as_responding_mut(&mut self) -> Option<&mut dyn Responding> {
        match self {
            ChallengeData::Dvsni(dvsni) => Some(dvsni),
            ChallengeData::SimpleHttps(simple) => Some(simple),
            ChallengeData::Opaque(_) => None,
        }
    }

    /// 合併伺服器送來的變體欄位。失敗時不修改任何欄位。
    fn merge(&mut self, value: &Map<String, Value>) -> Result<()> {
        match self {
            ChallengeData::Dvsni(dvsni) => dvsni.merge(value),
            ChallengeData::SimpleHttps(simple) => simple.merge(value),
            ChallengeData::Opaque(bag) => {
                *bag = opaque_fields(value);
                Ok(())
            }
        }
    }

    fn write_fields(&self, out: &mut Map<String, Value>) {
        match self {
            ChallengeData::Dvsni(dvsni) => dvsni.write_fields(out),
            ChallengeData::SimpleHttps(simple) => simple.write_fields(out),
            ChallengeData::Opaque(bag) => {
                for (k, v) in bag {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
    }

    /// 將 `previous` 中客戶端設定的欄位帶到這個新取得的實例上。
    fn inherit_client_fields(&mut self, previous: &ChallengeData) {
        match (self, previous) {
            (ChallengeData::Dvsni(fresh), ChallengeData::Dvsni(old)) => fresh.inherit(old),
            (ChallengeData::SimpleHttps(fresh), ChallengeData::SimpleHttps(old)) => {
                fresh.inherit(old)
            }
            _ => {}
        }
    }
}

fn opaque_fields(value: &Map<String, Value>) -> Map<String, Value> {
    value
        .iter()
        .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn empty_fields(value: &Map<String, Value>, keys: &[&'static str]) -> Vec<&'static str> {
    keys.iter()
        .copied()
        .filter(|k| matches!(value.get(*k), Some(Value::String(s)) if s.is_empty()))
        .collect()
}

/// 取出字串欄位；缺少或 `null` 視為空字串，其他型別視為驗證錯誤。
pub(crate) fn string_field(value: &Map<String, Value>, key: &str) -> Result<String> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(AcmeError::Validation(format!(
            "challenge field {:?} must be a string, got {}",
            key, other
        ))),
    }
}

/// 授權中的單一挑戰。
///
/// `uri` 是跨越多次刷新識別同一挑戰的依據；類型在首次觀察後不再改變。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub challenge_type: ChallengeType,
    pub status: String,
    pub validated: Option<String>,
    pub uri: String,
    pub data: ChallengeData,
    /// 以空字串明確送來的共同欄位，序列化時原樣輸出。
    empty_fields: Vec<&'static str>,
}

impl Challenge {
    /// 從伺服器或本地保存的 JSON 解析挑戰。
    ///
    /// 沒有 `uri` 的挑戰無法回應，一律以 [`ChallengeData::Opaque`] 保存。
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| AcmeError::Validation("challenge must be a JSON object".to_owned()))?;

        let challenge_type = ChallengeType::from_str(&string_field(obj, "type")?);
        let status = string_field(obj, "status")?;
        let validated = Some(string_field(obj, "validated")?).filter(|v| !v.is_empty());
        let uri = string_field(obj, "uri")?;

        let mut data = match (&challenge_type, uri.is_empty()) {
            (ChallengeType::Dvsni, false) => ChallengeData::Dvsni(Dvsni::default()),
            (ChallengeType::SimpleHttps, false) => ChallengeData::SimpleHttps(SimpleHttps::default()),
            _ => ChallengeData::Opaque(Map::new()),
        };
        data.merge(obj)?;

        Ok(Challenge {
            challenge_type,
            status,
            validated,
            uri,
            data,
            empty_fields: empty_fields(obj, &RESERVED_FIELDS),
        })
    }

    /// 序列化為 JSON；空欄位只在收到時即為空字串的情況下輸出。
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        let mut set = |k: &str, v: &str| {
            if !v.is_empty() || self.empty_fields.iter().any(|f| *f == k) {
                out.insert(k.to_owned(), Value::String(v.to_owned()));
            }
        };
        set("type", self.challenge_type.as_str());
        set("status", &self.status);
        set("validated", self.validated.as_deref().unwrap_or_default());
        set("uri", &self.uri);
        self.data.write_fields(&mut out);
        Value::Object(out)
    }

    /// 合併伺服器對此挑戰的更新。
    ///
    /// # 錯誤
    ///
    /// 類型不同，或帶有不同的 `uri` 時回傳 [`AcmeError::Validation`]，且挑戰保持不變。
    pub fn merge(&mut self, value: &Value) -> Result<()> {
        let obj = value
            .as_object()
            .ok_or_else(|| AcmeError::Validation("challenge must be a JSON object".to_owned()))?;

        let challenge_type = string_field(obj, "type")?;
        if challenge_type != self.challenge_type.as_str() {
            return Err(AcmeError::Validation(format!(
                "updated challenge has type {:?}, expected {:?}",
                challenge_type,
                self.challenge_type.as_str()
            )));
        }
        let uri = string_field(obj, "uri")?;
        if !uri.is_empty() && uri != self.uri {
            return Err(AcmeError::Validation(format!(
                "updated challenge has uri {:?}, expected {:?}",
                uri, self.uri
            )));
        }
        let status = string_field(obj, "status")?;
        let validated = string_field(obj, "validated")?;

        self.data.merge(obj)?;
        self.status = status;
        self.validated = Some(validated).filter(|v| !v.is_empty());
        self.empty_fields
            .retain(|k| !matches!(*k, "status" | "validated"));
        self.empty_fields
            .extend(empty_fields(obj, &["status", "validated"]));
        Ok(())
    }

    /// 以先前的實例補上客戶端設定的欄位。
    ///
    /// 只在兩者 `uri` 相同時呼叫；類型不同屬於伺服器違反協議。
    pub(crate) fn inherit_from(&mut self, previous: &Challenge) -> Result<()> {
        if previous.challenge_type != self.challenge_type {
            return Err(AcmeError::Validation(format!(
                "challenge {} changed type from {} to {}",
                self.uri, previous.challenge_type, self.challenge_type
            )));
        }
        self.data.inherit_client_fields(&previous.data);
        Ok(())
    }

    pub fn is_responding(&self) -> bool {
        self.data.as_responding().is_some()
    }
}

impl Serialize for Challenge {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Challenge {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Challenge::from_json(&value).map_err(de::Error::custom)
    }
}

/// 對授權中某個可回應挑戰的操作入口。
pub struct ChallengeResponder<'a> {
    index: usize,
    domain: String,
    challenge: &'a mut Challenge,
}

impl<'a> ChallengeResponder<'a> {
    pub(crate) fn new(index: usize, domain: &str, challenge: &'a mut Challenge) -> Result<Self> {
        if !challenge.is_responding() {
            return Err(AcmeError::UnsupportedChallenge {
                index,
                challenge_type: challenge.challenge_type.as_str().to_owned(),
            });
        }
        Ok(Self {
            index,
            domain: domain.to_owned(),
            challenge,
        })
    }

    pub fn challenge(&self) -> &Challenge {
        self.challenge
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn responding(&self) -> Result<&dyn Responding> {
        self.challenge.data.as_responding().ok_or_else(|| self.unsupported())
    }

    fn responding_mut(&mut self) -> Result<&mut dyn Responding> {
        let err = self.unsupported();
        self.challenge.data.as_responding_mut().ok_or(err)
    }

    fn unsupported(&self) -> AcmeError {
        AcmeError::UnsupportedChallenge {
            index: self.index,
            challenge_type: self.challenge.challenge_type.as_str().to_owned(),
        }
    }

    pub fn reset_response(&mut self) -> Result<()> {
        self.responding_mut()?.reset_response();
        Ok(())
    }

    pub fn initialize_response(&mut self) -> Result<()> {
        let domain = self.domain.clone();
        self.responding_mut()?.initialize_response(&domain)
    }

    pub fn describe_provisioning_action(&self) -> Result<String> {
        self.responding()?.describe_provisioning_action(&self.domain)
    }

    pub fn local_verify(&self, client: &dyn HttpClient) -> Result<()> {
        self.responding()?.local_verify(&self.domain, client)
    }

    pub fn build_response_payload(&self) -> Result<ChallengeResponsePayload> {
        self.responding()?.build_response_payload()
    }

    /// 簽名並送出回應，再把伺服器的回覆合併回挑戰。
    pub fn submit(&mut self, client: &AcmeClient, key: &SigningKey) -> Result<()> {
        let payload = self.build_response_payload()?;
        payload.validate()?;

        let uri = self.challenge.uri.clone();
        let response = client.post(key, &uri, &payload, None)?;
        let value: Value = parse_json(&uri, &response)?;
        if let Err(e) = self.challenge.merge(&value) {
            warn!("Server reply for challenge {} could not be merged: {}", uri, e);
            return Err(e);
        }
        debug!("Challenge {} is now {:?}", uri, self.challenge.status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_opaque_round_trip_keeps_unknown_fields() -> Result<()> {
        let value = json!({
            "type": "recoveryToken",
            "status": "pending",
            "uri": "https://ca.example/challenge/9",
            "extra": {"nested": [1, 2, 3]},
            "hint": "x"
        });
        let challenge = Challenge::from_json(&value)?;
        assert!(matches!(challenge.data, ChallengeData::Opaque(_)));
        assert!(!challenge.is_responding());
        assert_eq!(challenge.to_json(), value);
        Ok(())
    }

    #[test]
    fn test_known_type_without_uri_is_opaque() -> Result<()> {
        let value = json!({"type": "simpleHttps", "status": "valid", "token": "abc"});
        let challenge = Challenge::from_json(&value)?;
        assert!(matches!(challenge.data, ChallengeData::Opaque(_)));
        assert_eq!(challenge.to_json(), value);
        Ok(())
    }

    #[test]
    fn test_simple_https_round_trip() -> Result<()> {
        let value = json!({
            "type": "simpleHttps",
            "status": "valid",
            "validated": "2015-03-01T12:00:00Z",
            "uri": "https://ca.example/challenge/2",
            "token": "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA",
            "path": "example.com.txt"
        });
        let challenge: Challenge = serde_json::from_value(value.clone())?;
        assert_eq!(serde_json::to_value(&challenge)?, value);
        Ok(())
    }

    #[test]
    fn test_dvsni_round_trip() -> Result<()> {
        let value = json!({
            "type": "dvsni",
            "status": "pending",
            "uri": "https://ca.example/challenge/1",
            "r": crate::base64::Base64::new([7u8; 32]).base64_url(),
            "s": crate::base64::Base64::new([9u8; 32]).base64_url(),
            "nonce": "0123456789abcdef0123456789abcdef"
        });
        let challenge = Challenge::from_json(&value)?;
        assert!(matches!(challenge.data, ChallengeData::Dvsni(_)));
        assert_eq!(challenge.to_json(), value);
        Ok(())
    }

    #[test]
    fn test_explicit_empty_fields_round_trip() -> Result<()> {
        let value = json!({
            "type": "simpleHttps",
            "status": "",
            "validated": "",
            "uri": "https://ca.example/challenge/2",
            "token": "t"
        });
        let mut challenge = Challenge::from_json(&value)?;
        assert_eq!(challenge.to_json(), value);

        challenge.merge(&json!({"type": "simpleHttps", "status": "valid", "token": "t"}))?;
        assert_eq!(
            challenge.to_json(),
            json!({
                "type": "simpleHttps",
                "status": "valid",
                "uri": "https://ca.example/challenge/2",
                "token": "t"
            })
        );
        Ok(())
    }

    #[test]
    fn test_merge_rejects_type_and_uri_changes() -> Result<()> {
        let mut challenge = Challenge::from_json(&json!({
            "type": "simpleHttps",
            "uri": "https://ca.example/challenge/2",
            "token": "t"
        }))?;
        let before = challenge.clone();

        let wrong_type = json!({"type": "dvsni", "uri": "https://ca.example/challenge/2"});
        assert!(matches!(challenge.merge(&wrong_type), Err(AcmeError::Validation(_))));
        let wrong_uri = json!({"type": "simpleHttps", "uri": "https://ca.example/challenge/3"});
        assert!(matches!(challenge.merge(&wrong_uri), Err(AcmeError::Validation(_))));
        assert_eq!(challenge, before);

        challenge.merge(&json!({"type": "simpleHttps", "status": "valid", "token": "t"}))?;
        assert_eq!(challenge.status, "valid");
        Ok(())
    }

    #[test]
    fn test_opaque_challenge_cannot_respond() -> Result<()> {
        let mut challenge = Challenge::from_json(&json!({"type": "dns", "uri": "https://ca.example/c/4"}))?;
        match ChallengeResponder::new(3, "example.com", &mut challenge) {
            Err(AcmeError::UnsupportedChallenge { index, challenge_type }) => {
                assert_eq!(index, 3);
                assert_eq!(challenge_type, "dns");
            }
            _ => panic!("opaque challenge must not be responding"),
        }
        Ok(())
    }

    #[test]
    fn test_non_string_field_is_rejected() {
        assert!(Challenge::from_json(&json!({"type": 5})).is_err());
        assert!(Challenge::from_json(&json!([])).is_err());
    }
}
