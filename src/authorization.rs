//! 網域授權的狀態機。
//!
//! 刷新授權時，先以 `uri` 為鍵建立舊挑戰的對照表，再把客戶端設定的欄位
//! （DVSNI 的 `s`、simpleHttps 的 `path`）帶到新取得的挑戰上。`uri` 對不上的挑戰
//! 一律從預設值開始。

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{
    challenge::{Challenge, ChallengeResponder},
    client::{parse_json, require_link, require_location, AcmeClient},
    error::{AcmeError, Result},
    http::HttpResponse,
    payload::{Identifier, NewAuthorizationPayload, PayloadT},
    signing_key::SigningKey,
};

/// 授權狀態。
///
/// 線上格式缺少或為空的狀態視為 `Pending`；無法辨識的值歸為 `Unknown`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthorizationStatus {
    #[default]
    Pending,
    Processing,
    Valid,
    Invalid,
    Revoked,
    Unknown,
}

impl AuthorizationStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "" | "pending" => Self::Pending,
            "processing" => Self::Processing,
            "valid" => Self::Valid,
            "invalid" => Self::Invalid,
            "revoked" => Self::Revoked,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Revoked => "revoked",
            Self::Unknown => "unknown",
        }
    }

    /// 是否為終結狀態，之後不會再轉換。
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid | Self::Revoked | Self::Unknown)
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuthorizationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthorizationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Self::from_str(raw.as_deref().unwrap_or_default()))
    }
}

/// 單一網域的授權資源。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub location: String,
    /// 申請憑證的端點（`Link: rel="next"`）。
    pub cert_link: String,
    pub dns_identifier: String,
    #[serde(default)]
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    /// 伺服器提供的挑戰組合，每組為 `challenges` 的索引集合，依原樣保存。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combinations: Vec<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// 授權回應的 JSON 內容。
#[derive(Debug, Deserialize)]
struct RawAuthorization {
    identifier: Option<Identifier>,
    #[serde(default)]
    status: AuthorizationStatus,
    #[serde(default)]
    challenges: Vec<Value>,
    #[serde(default)]
    combinations: Vec<Vec<usize>>,
    expires: Option<DateTime<Utc>>,
}

impl Authorization {
    /// 為網域建立新授權。
    ///
    /// # 參數
    ///
    /// * `client` - 協議用戶端
    /// * `url` - 授權端點，通常是 [`Registration::authorization_link`](crate::registration::Registration::authorization_link)
    /// * `key` - 帳戶簽名金鑰
    /// * `domain` - 要授權的網域
    ///
    /// # 錯誤
    ///
    /// 回應缺少 `Location`、`Link: rel="next"`，或識別項類型不是 `"dns"` 時
    /// 回傳 [`AcmeError::Protocol`]。
    pub fn create(client: &AcmeClient, url: &str, key: &SigningKey, domain: &str) -> Result<Self> {
        let payload = NewAuthorizationPayload::new(domain);
        payload.validate()?;
        let response = client.post(key, url, &payload, None)?;

        let location = require_location(url, &response)?;
        let cert_link = require_link(url, &response, "next")?;
        let authorization = Self::from_response(url, &response, location, cert_link)?;
        info!(
            "Created authorization {} for {}",
            authorization.location, authorization.dns_identifier
        );
        Ok(authorization)
    }

    /// 以未簽名的 GET 重新取得授權，並保留客戶端已設定的挑戰欄位。
    ///
    /// 失敗時授權保持不變。
    ///
    /// # 錯誤
    ///
    /// 回應缺少 `Link: rel="next"` 或識別項改變時回傳 [`AcmeError::Protocol`]。
    pub fn refresh(&mut self, client: &AcmeClient) -> Result<()> {
        let url = self.location.clone();
        let response = client.get(&url)?;

        let cert_link = require_link(&url, &response, "next")?;
        let fresh = Self::from_response(&url, &response, url.clone(), cert_link)?;
        if fresh.dns_identifier != self.dns_identifier {
            return Err(AcmeError::protocol(
                &url,
                response.status,
                format!(
                    "authorization identifier changed from {} to {}",
                    self.dns_identifier, fresh.dns_identifier
                ),
            ));
        }

        *self = reconcile(self, fresh)?;
        Ok(())
    }

    fn from_response(
        url: &str,
        response: &HttpResponse,
        location: String,
        cert_link: String,
    ) -> Result<Self> {
        let raw: RawAuthorization = parse_json(url, response)?;
        let identifier = match raw.identifier {
            Some(identifier) if identifier.type_ == "dns" => identifier,
            other => {
                return Err(AcmeError::protocol(
                    url,
                    response.status,
                    format!(
                        "unknown identifier type {:?}, expected \"dns\"",
                        other.map(|i| i.type_).unwrap_or_default()
                    ),
                ))
            }
        };
        let challenges = raw
            .challenges
            .iter()
            .map(Challenge::from_json)
            .collect::<Result<Vec<_>>>()?;

        Ok(Authorization {
            location,
            cert_link,
            dns_identifier: identifier.value,
            status: raw.status,
            challenges,
            combinations: raw.combinations,
            expires: raw.expires,
        })
    }

    /// 取得第 `index` 個挑戰的回應入口。
    ///
    /// # 錯誤
    ///
    /// 挑戰類型不支援回應時回傳 [`AcmeError::UnsupportedChallenge`]。
    pub fn respond(&mut self, index: usize) -> Result<ChallengeResponder<'_>> {
        let domain = self.dns_identifier.clone();
        let count = self.challenges.len();
        let challenge = self.challenges.get_mut(index).ok_or_else(|| {
            AcmeError::Validation(format!(
                "no challenge at index {}, authorization has {}",
                index, count
            ))
        })?;
        ChallengeResponder::new(index, &domain, challenge)
    }

    pub fn challenge_mut(&mut self, index: usize) -> Option<&mut Challenge> {
        self.challenges.get_mut(index)
    }

    /// 只有在狀態為 `Valid` 時才回傳到期時間。
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        match self.status {
            AuthorizationStatus::Valid => self.expires,
            _ => None,
        }
    }
}

/// 將 `previous` 中客戶端設定的挑戰欄位帶到 `fresh` 上。
///
/// 以 `uri` 對應舊挑戰；同一 `uri` 的類型改變時整次刷新被拒絕。
pub fn reconcile(previous: &Authorization, mut fresh: Authorization) -> Result<Authorization> {
    let by_uri: HashMap<&str, &Challenge> = previous
        .challenges
        .iter()
        .filter(|c| !c.uri.is_empty())
        .map(|c| (c.uri.as_str(), c))
        .collect();

    for challenge in fresh.challenges.iter_mut() {
        if let Some(old) = by_uri.get(challenge.uri.as_str()) {
            challenge.inherit_from(old)?;
        }
    }
    Ok(fresh)
}
