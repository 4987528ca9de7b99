use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey, EcPoint},
    pkey::{HasPublic, Id, PKey, PKeyRef, Public},
    rsa::Rsa,
    sha::sha256,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    base64::{decode_url, Base64},
    signing_key::{Curve, KeyError},
};

type Result<T> = std::result::Result<T, KeyError>;

/// JSON Web Key (JWK) 的公鑰表示，支援 RSA 與橢圓曲線金鑰。
///
/// 伺服器回傳的 JWK 可能附帶 `alg`、`kid` 等欄位，反序列化時會忽略。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// RSA 格式的 JWK。
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },
    /// 橢圓曲線格式的 JWK。
    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },
}

impl Jwk {
    /// 由私鑰或公鑰推導出公鑰 JWK。
    pub fn from_private_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self> {
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa()?;
                Ok(Jwk::Rsa {
                    n: Base64::new(rsa.n().to_vec()).base64_url(),
                    e: Base64::new(rsa.e().to_vec()).base64_url(),
                })
            }
            Id::EC => {
                let ec = key.ec_key()?;
                let group = ec.group();
                let curve = Curve::from_nid(
                    group
                        .curve_name()
                        .ok_or_else(|| KeyError::UnsupportedCurve("unnamed curve".to_owned()))?,
                )?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)?;
                let len = curve.coordinate_len() as i32;
                Ok(Jwk::Ec {
                    crv: curve.jwk_name().to_owned(),
                    x: Base64::new(x.to_vec_padded(len)?).base64_url(),
                    y: Base64::new(y.to_vec_padded(len)?).base64_url(),
                })
            }
            other => Err(KeyError::UnsupportedKeyType(format!("{:?}", other))),
        }
    }

    /// 將 JWK 還原為 OpenSSL 公鑰，用於驗證簽名。
    pub fn to_public_key(&self) -> Result<PKey<Public>> {
        match self {
            Jwk::Rsa { n, e } => {
                let rsa = Rsa::from_public_components(
                    BigNum::from_slice(&decode_component(n)?)?,
                    BigNum::from_slice(&decode_component(e)?)?,
                )?;
                Ok(PKey::from_rsa(rsa)?)
            }
            Jwk::Ec { crv, x, y } => {
                let curve = Curve::from_jwk_name(crv)?;
                let group = EcGroup::from_curve_name(curve.nid())?;
                let x = BigNum::from_slice(&decode_component(x)?)?;
                let y = BigNum::from_slice(&decode_component(y)?)?;
                let mut ctx = BigNumContext::new()?;
                let mut point = EcPoint::new(&group)?;
                point.set_affine_coordinates_gfp(&group, &x, &y, &mut ctx)?;
                Ok(PKey::from_ec_key(EcKey::from_public_key(&group, &point)?)?)
            }
        }
    }

    /// 比較兩把金鑰的數學內容是否相同，忽略整數編碼的前導零。
    pub fn same_key(&self, other: &Jwk) -> bool {
        fn number(s: &str) -> Option<Vec<u8>> {
            let bytes = decode_url(s).ok()?;
            let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
            Some(bytes[start..].to_vec())
        }
        fn same(a: &str, b: &str) -> bool {
            match (number(a), number(b)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }

        match (self, other) {
            (Jwk::Rsa { n: n1, e: e1 }, Jwk::Rsa { n: n2, e: e2 }) => {
                same(n1, n2) && same(e1, e2)
            }
            (
                Jwk::Ec {
                    crv: c1,
                    x: x1,
                    y: y1,
                },
                Jwk::Ec {
                    crv: c2,
                    x: x2,
                    y: y2,
                },
            ) => c1 == c2 && same(x1, x2) && same(y1, y2),
            _ => false,
        }
    }

    /// 依 RFC 7638 產生只含必要欄位、依字典序排列的 JSON。
    pub fn to_canonical_json(&self) -> Result<String> {
        let mut map = Map::new();
        match self {
            Jwk::Rsa { n, e } => {
                map.insert("e".to_string(), Value::String(e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(n.clone()));
            }
            Jwk::Ec { crv, x, y } => {
                map.insert("crv".to_string(), Value::String(crv.clone()));
                map.insert("kty".to_string(), Value::String("EC".to_string()));
                map.insert("x".to_string(), Value::String(x.clone()));
                map.insert("y".to_string(), Value::String(y.clone()));
            }
        }
        Ok(serde_json::to_string(&Value::Object(map))?)
    }

    /// 計算金鑰縮影（thumbprint）。
    pub fn thumbprint(&self) -> Result<String> {
        let hash = sha256(self.to_canonical_json()?.as_bytes());
        Ok(Base64::new(hash).base64_url())
    }
}

fn decode_component(s: &str) -> Result<Vec<u8>> {
    decode_url(s).map_err(|e| KeyError::UnsupportedKeyType(format!("malformed JWK: {}", e)))
}
