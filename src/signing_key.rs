use openssl::{
    ec::{Asn1Flag, EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    symm::Cipher,
};
use thiserror::Error;

use crate::{
    jwk::Jwk,
    jws::Jws,
    protection::Protection,
    signature::SignatureAlgorithm,
};

/// 金鑰相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    /// 金鑰不屬於支援的橢圓曲線或 RSA 家族。
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),
    /// 橢圓曲線不在支援清單中。
    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),
    #[error("RSA key size {0} is too small, need at least 2048 bits")]
    KeyTooSmall(u32),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 本模組使用的結果類型。
type Result<T> = std::result::Result<T, KeyError>;

/// 支援的橢圓曲線。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    P224,
    P256,
    P384,
    P521,
}

impl Curve {
    pub(crate) fn nid(self) -> Nid {
        match self {
            Curve::P224 => Nid::SECP224R1,
            Curve::P256 => Nid::X9_62_PRIME256V1,
            Curve::P384 => Nid::SECP384R1,
            Curve::P521 => Nid::SECP521R1,
        }
    }

    pub(crate) fn from_nid(nid: Nid) -> Result<Self> {
        match nid {
            Nid::SECP224R1 => Ok(Curve::P224),
            Nid::X9_62_PRIME256V1 => Ok(Curve::P256),
            Nid::SECP384R1 => Ok(Curve::P384),
            Nid::SECP521R1 => Ok(Curve::P521),
            other => Err(KeyError::UnsupportedCurve(
                other
                    .short_name()
                    .map(str::to_owned)
                    .unwrap_or_else(|_| format!("nid {}", other.as_raw())),
            )),
        }
    }

    /// JWK 中的曲線名稱（`crv`）。
    pub fn jwk_name(self) -> &'static str {
        match self {
            Curve::P224 => "P-224",
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
            Curve::P521 => "P-521",
        }
    }

    /// 依 JWK 曲線名稱取得曲線；未知名稱回傳 [`KeyError::UnsupportedCurve`]。
    pub fn from_jwk_name(name: &str) -> Result<Self> {
        match name {
            "P-224" => Ok(Curve::P224),
            "P-256" => Ok(Curve::P256),
            "P-384" => Ok(Curve::P384),
            "P-521" => Ok(Curve::P521),
            other => Err(KeyError::UnsupportedCurve(other.to_owned())),
        }
    }

    /// 座標與簽名分量的位元組長度。
    pub(crate) fn coordinate_len(self) -> usize {
        match self {
            Curve::P224 => 28,
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }
}

/// 產生新金鑰時使用的金鑰類型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa { bits: u32 },
    Ec(Curve),
}

impl Default for KeyType {
    fn default() -> Self {
        KeyType::Ec(Curve::P256)
    }
}

/// 匯出私鑰時可選的 PEM 加密演算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PemCipher {
    Aes128Cbc,
    #[default]
    Aes256Cbc,
    DesEde3Cbc,
}

impl PemCipher {
    fn cipher(self) -> Cipher {
        match self {
            PemCipher::Aes128Cbc => Cipher::aes_128_cbc(),
            PemCipher::Aes256Cbc => Cipher::aes_256_cbc(),
            PemCipher::DesEde3Cbc => Cipher::des_ede3_cbc(),
        }
    }
}

/// 帳戶簽名金鑰。
///
/// 封裝一把私鑰，並在建立時確定簽名演算法：橢圓曲線依曲線選擇 ES256/ES384/ES512（P-224 同樣使用 ES256），
/// RSA 固定使用 PS512。不支援的金鑰在建立時即被拒絕，之後的操作不會再遇到未知類型。
#[derive(Debug, Clone)]
pub struct SigningKey {
    pri_key: PKey<Private>,
    algorithm: SignatureAlgorithm,
}

impl SigningKey {
    const MIN_RSA_BITS: u32 = 2048;

    /// 包裝既有私鑰。
    ///
    /// # 錯誤
    ///
    /// 非 RSA/EC 金鑰回傳 [`KeyError::UnsupportedKeyType`]，
    /// 不支援的曲線回傳 [`KeyError::UnsupportedCurve`]。
    pub fn new(pri_key: PKey<Private>) -> Result<Self> {
        let algorithm = Self::algorithm_for(&pri_key)?;
        Ok(Self { pri_key, algorithm })
    }

    /// 產生一把新的簽名金鑰。
    pub fn generate(key_type: KeyType) -> Result<Self> {
        let pri_key = match key_type {
            KeyType::Rsa { bits } => {
                if bits < Self::MIN_RSA_BITS {
                    return Err(KeyError::KeyTooSmall(bits));
                }
                PKey::from_rsa(Rsa::generate(bits)?)?
            }
            KeyType::Ec(curve) => {
                let mut group = EcGroup::from_curve_name(curve.nid())?;
                group.set_asn1_flag(Asn1Flag::NAMED_CURVE);
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        Self::new(pri_key)
    }

    /// 從未加密的 PEM 私鑰建立簽名金鑰。
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Self::new(PKey::private_key_from_pem(pem)?)
    }

    /// 從以密碼加密的 PEM 私鑰建立簽名金鑰。
    pub fn from_encrypted_pem(pem: &[u8], password: &str) -> Result<Self> {
        Self::new(PKey::private_key_from_pem_passphrase(
            pem,
            password.as_bytes(),
        )?)
    }

    /// 金鑰類型到演算法的決策表。
    fn algorithm_for(pri_key: &PKey<Private>) -> Result<SignatureAlgorithm> {
        match pri_key.id() {
            Id::RSA => Ok(SignatureAlgorithm::PS512),
            Id::EC => {
                let ec = pri_key.ec_key()?;
                let nid = ec
                    .group()
                    .curve_name()
                    .ok_or_else(|| KeyError::UnsupportedCurve("unnamed curve".to_owned()))?;
                Ok(SignatureAlgorithm::for_curve(Curve::from_nid(nid)?))
            }
            other => Err(KeyError::UnsupportedKeyType(format!("{:?}", other))),
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.pri_key
    }

    /// 公鑰的 JWK 表示。
    pub fn public_key(&self) -> Result<Jwk> {
        Jwk::from_private_key(&self.pri_key)
    }

    /// 以 nonce 保護標頭對 payload 簽名，回傳可直接送出的 JWS。
    ///
    /// nonce 位於受簽名保護的標頭內，因此擷取到的簽名無法搭配其他 nonce 重放。
    pub fn sign(&self, payload: &[u8], nonce: &str) -> Result<Jws> {
        let header = Protection::new(self.algorithm, self.public_key()?).create_header(nonce);
        Jws::sign(&header, payload, self)
    }

    /// 對任意位元組做原始簽名，回傳 JWS 格式的簽名值。
    pub(crate) fn sign_raw(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.algorithm.sign(data, &self.pri_key)
    }

    /// 以密碼加密匯出私鑰（PKCS#8 PEM）。
    pub fn encrypted_export(&self, password: &str, cipher: PemCipher) -> Result<Vec<u8>> {
        Ok(self
            .pri_key
            .private_key_to_pem_pkcs8_passphrase(cipher.cipher(), password.as_bytes())?)
    }

    /// 未加密匯出私鑰（PKCS#8 PEM）。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 計算 RFC 7638 金鑰縮影，以 URL 安全 Base64 表示。
    pub fn thumbprint(&self) -> Result<String> {
        self.public_key()?.thumbprint()
    }
}
