use log::warn;
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    rand::rand_bytes,
    sha::Sha256,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509},
};
use serde_json::{Map, Value};

use crate::{
    base64::{decode_url, Base64},
    challenge::{string_field, ChallengeType, Responding},
    error::{AcmeError, Result},
    http::HttpClient,
    payload::ChallengeResponsePayload,
    signing_key::{KeyError, SigningKey},
};

const R_LEN: usize = 32;
const S_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const SERVER_NAME_SUFFIX: &str = ".acme.invalid";
const CERTIFICATE_DAYS: u32 = 30;

/// DVSNI 挑戰：以帶有特定 SAN 的自簽 TLS 憑證證明網域控制權。
///
/// `r` 與 `nonce` 由伺服器發放；`s` 由客戶端產生一次，並在刷新之間保留。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dvsni {
    r: Vec<u8>,
    s: Vec<u8>,
    nonce: String,
}

impl Dvsni {
    /// 以已驗證的欄位建立實例。
    pub fn new(r: &[u8], s: &[u8], nonce: &str) -> Result<Self> {
        check(r, s, nonce)?;
        Ok(Self {
            r: r.to_vec(),
            s: s.to_vec(),
            nonce: nonce.to_owned(),
        })
    }

    pub fn r(&self) -> &[u8] {
        &self.r
    }

    pub fn s(&self) -> &[u8] {
        &self.s
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// 合併伺服器欄位。
    ///
    /// 任何欄位違反長度或編碼規則時整批拒絕，不修改現有狀態。
    /// 伺服器未附帶 `s` 時保留客戶端的值。
    pub(crate) fn merge(&mut self, value: &Map<String, Value>) -> Result<()> {
        let r = decode_url(&string_field(value, "r")?)?;
        let s = decode_url(&string_field(value, "s")?)?;
        let nonce = string_field(value, "nonce")?;
        check(&r, &s, &nonce)?;

        self.r = r;
        self.nonce = nonce;
        if !s.is_empty() {
            self.s = s;
        }
        Ok(())
    }

    pub(crate) fn inherit(&mut self, previous: &Dvsni) {
        if previous.s.is_empty() {
            return;
        }
        if !self.s.is_empty() && self.s != previous.s {
            warn!("Server echoed a different DVSNI s value, keeping the client value");
        }
        self.s = previous.s.clone();
    }

    pub(crate) fn write_fields(&self, out: &mut Map<String, Value>) {
        if !self.r.is_empty() {
            out.insert("r".to_owned(), Value::String(Base64::new(&self.r).base64_url()));
        }
        if !self.s.is_empty() {
            out.insert("s".to_owned(), Value::String(Base64::new(&self.s).base64_url()));
        }
        if !self.nonce.is_empty() {
            out.insert("nonce".to_owned(), Value::String(self.nonce.clone()));
        }
    }

    /// 挑戰憑證必須攜帶的三個 SAN：網域本身、`nonce` 與 `hex(SHA-256(r || s))`。
    pub fn dns_names(&self, domain: &str) -> [String; 3] {
        let mut hasher = Sha256::new();
        hasher.update(&self.r);
        hasher.update(&self.s);
        let z = hex::encode(hasher.finish());

        [
            domain.to_owned(),
            format!("{}{}", self.nonce, SERVER_NAME_SUFFIX),
            format!("{}{}", z, SERVER_NAME_SUFFIX),
        ]
    }

    /// 產生挑戰用的自簽憑證，回傳憑證與私鑰串接的 PEM。
    ///
    /// # 錯誤
    ///
    /// `s` 尚未設定時回傳 [`AcmeError::IncompleteResponse`]。
    pub fn make_certificate(&self, key: &SigningKey, domain: &str) -> Result<Vec<u8>> {
        if self.s.is_empty() {
            return Err(AcmeError::IncompleteResponse(
                "DVSNI s value is empty".to_owned(),
            ));
        }
        check(&self.r, &self.s, &self.nonce)?;
        let names = self.dns_names(domain);
        let mut pem = build_certificate(key, &names).map_err(KeyError::from)?;
        pem.extend(key.to_pem()?);
        Ok(pem)
    }
}

fn build_certificate(
    key: &SigningKey,
    names: &[String],
) -> std::result::Result<Vec<u8>, openssl::error::ErrorStack> {
    let pkey = key.private_key();

    // CN 上限 64 字元，使用長度固定的 nonce 名稱
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", &names[1])?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CERTIFICATE_DAYS)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(pkey)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let mut san = SubjectAlternativeName::new();
    for entry in names {
        san.dns(entry);
    }
    let san = san.build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(pkey, MessageDigest::sha256())?;
    builder.build().to_pem()
}

fn check(r: &[u8], s: &[u8], nonce: &str) -> Result<()> {
    if r.len() != R_LEN {
        return Err(AcmeError::Validation(format!(
            "invalid length of DVSNI r, expected {}, got {}",
            R_LEN,
            r.len()
        )));
    }
    if !s.is_empty() && s.len() != S_LEN {
        return Err(AcmeError::Validation(format!(
            "invalid length of DVSNI s, expected 0 or {}, got {}",
            S_LEN,
            s.len()
        )));
    }
    if nonce.len() != NONCE_LEN {
        return Err(AcmeError::Validation(format!(
            "invalid length of DVSNI nonce, expected {}, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    if !nonce.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(AcmeError::Validation(format!(
            "DVSNI nonce is not lowercase hex: {:?}",
            nonce
        )));
    }
    Ok(())
}

impl Responding for Dvsni {
    fn reset_response(&mut self) {
        self.s.clear();
    }

    fn initialize_response(&mut self, _domain: &str) -> Result<()> {
        if self.s.is_empty() {
            let mut s = vec![0u8; S_LEN];
            rand_bytes(&mut s).map_err(KeyError::from)?;
            self.s = s;
        }
        Ok(())
    }

    fn describe_provisioning_action(&self, domain: &str) -> Result<String> {
        if self.s.is_empty() {
            return Err(AcmeError::IncompleteResponse(
                "DVSNI s value is empty".to_owned(),
            ));
        }
        let names = self.dns_names(domain);
        Ok(format!(
            "Configure the TLS server for {} to present a self-signed certificate for SNI name {} \
             with subjectAltNames {}",
            domain,
            names[2],
            names.join(", ")
        ))
    }

    fn local_verify(&self, _domain: &str, _client: &dyn HttpClient) -> Result<()> {
        // 無法在本地完成 TLS 交握檢查，只確認回應欄位齊全
        if self.s.is_empty() {
            return Err(AcmeError::IncompleteResponse(
                "DVSNI s value is empty".to_owned(),
            ));
        }
        check(&self.r, &self.s, &self.nonce)
    }

    fn build_response_payload(&self) -> Result<ChallengeResponsePayload> {
        if self.s.len() != S_LEN {
            return Err(AcmeError::IncompleteResponse(format!(
                "need DVSNI s value ({} bytes) to trigger challenge, got {} bytes",
                S_LEN,
                self.s.len()
            )));
        }
        check(&self.r, &self.s, &self.nonce)?;
        Ok(ChallengeResponsePayload {
            type_: ChallengeType::Dvsni.as_str().to_owned(),
            s: Some(Base64::new(&self.s).base64_url()),
            path: None,
        })
    }
}
