use std::fmt;

use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    pkey::{HasPublic, PKey, PKeyRef, Private},
    rsa::Padding,
    sign::{RsaPssSaltlen, Signer, Verifier},
};

use crate::signing_key::{Curve, KeyError};

/// JWS 簽名演算法。
///
/// 演算法是金鑰類型的純函數：橢圓曲線依曲線決定，RSA 一律使用 PS512。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    ES256,
    ES384,
    ES512,
    PS512,
}

impl SignatureAlgorithm {
    pub(crate) fn for_curve(curve: Curve) -> Self {
        match curve {
            Curve::P224 | Curve::P256 => Self::ES256,
            Curve::P384 => Self::ES384,
            Curve::P521 => Self::ES512,
        }
    }

    /// JWS 標頭中 `alg` 欄位的名稱。
    pub fn name(self) -> &'static str {
        match self {
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::PS512 => "PS512",
        }
    }

    /// 依 `alg` 名稱取得演算法。
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ES256" => Some(Self::ES256),
            "ES384" => Some(Self::ES384),
            "ES512" => Some(Self::ES512),
            "PS512" => Some(Self::PS512),
            _ => None,
        }
    }

    fn digest(self) -> MessageDigest {
        match self {
            Self::ES256 => MessageDigest::sha256(),
            Self::ES384 => MessageDigest::sha384(),
            Self::ES512 | Self::PS512 => MessageDigest::sha512(),
        }
    }

    fn is_ecdsa(self) -> bool {
        self != Self::PS512
    }

    /// 簽名資料。
    ///
    /// ECDSA 簽名由 OpenSSL 的 DER 結構轉為 JWS 要求的定長 `r || s`。
    pub(crate) fn sign(self, data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>, KeyError> {
        let mut signer = Signer::new(self.digest(), key)?;
        if self == Self::PS512 {
            signer.set_rsa_padding(Padding::PKCS1_PSS)?;
            signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        signer.update(data)?;
        let der = signer.sign_to_vec()?;

        if !self.is_ecdsa() {
            return Ok(der);
        }
        let sig = EcdsaSig::from_der(&der)?;
        let len = component_len::<Private>(key)? as i32;
        let mut raw = sig.r().to_vec_padded(len)?;
        raw.extend(sig.s().to_vec_padded(len)?);
        Ok(raw)
    }

    /// 以公鑰驗證 JWS 格式的簽名。
    pub fn verify<T: HasPublic>(
        self,
        data: &[u8],
        signature: &[u8],
        key: &PKeyRef<T>,
    ) -> Result<bool, KeyError> {
        let der = if self.is_ecdsa() {
            // 非 EC 公鑰無法驗證 ECDSA 簽名
            let Ok(len) = component_len(key) else {
                return Ok(false);
            };
            if signature.len() != 2 * len {
                return Ok(false);
            }
            let r = BigNum::from_slice(&signature[..len])?;
            let s = BigNum::from_slice(&signature[len..])?;
            EcdsaSig::from_private_components(r, s)?.to_der()?
        } else {
            signature.to_vec()
        };

        let mut verifier = Verifier::new(self.digest(), key)?;
        if self == Self::PS512 {
            verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
            verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        verifier.update(data)?;
        // OpenSSL 對格式錯誤的簽名回傳錯誤而非 false
        Ok(verifier.verify(&der).unwrap_or(false))
    }
}

/// ECDSA 簽名分量 `r`、`s` 的定長位元組數，由金鑰所在曲線決定。
fn component_len<T: HasPublic>(key: &PKeyRef<T>) -> Result<usize, KeyError> {
    let degree = key.ec_key()?.group().degree() as usize;
    Ok((degree + 7) / 8)
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
