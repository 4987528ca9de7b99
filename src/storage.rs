//! 註冊、授權與證書的持久化。
//!
//! [`Storage`] 是最小的鍵值介面；[`RecordStore`] 在其上以 JSON 保存協議資料。
//! 加密與編碼屬於上層的責任，這裡只處理結構化紀錄。

use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use log::debug;
use openssl::sha::sha256;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{
    authorization::{Authorization, AuthorizationStatus},
    base64::Base64,
    certificate::Certificate,
    registration::Registration,
};

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error("Record is corrupted: {0}")]
    Corrupted(#[from] serde_json::Error),
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 定義儲存系統所需實現的 API。
///
/// key 是以 `/` 分隔的相對路徑，例如 `authorization/<名稱>`。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 所對應檔案的內容。
    fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 將資料寫入指定 key 所對應的檔案中，必要時建立上層目錄。
    fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 刪除指定 key 所對應的檔案。
    fn remove(&self, key: &str) -> Result<()>;

    /// 檢查指定 key 是否存在於儲存系統中。
    fn exists(&self, key: &str) -> Result<bool>;

    /// 列出目錄 `dir` 下直接包含的檔案 key，依字典序排列。
    fn list(&self, dir: &str) -> Result<Vec<String>>;
}

/// 私有工具，提供 key 正規化與驗證等輔助函式。
struct KeyUtils;

impl KeyUtils {
    /// 正規化 key 為不含前導斜線的相對路徑，並檢查不合法字元與格式。
    fn normalize(key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        if key.contains("//") || key.contains('\\') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid separator in key: {}",
                key
            )));
        }

        let mut parts: Vec<&str> = Vec::new();
        for component in Path::new(key).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(StorageError::InvalidKey(format!(
                            "Cannot use '..' to escape root directory: {}",
                            key
                        )));
                    }
                }
                Component::Normal(name) => match name.to_str() {
                    Some(name) => parts.push(name),
                    None => {
                        return Err(StorageError::InvalidKey(format!(
                            "Non-UTF8 path component in: {}",
                            key
                        )))
                    }
                },
                _ => return Err(StorageError::InvalidKey(format!("Invalid path: {}", key))),
            }
        }
        if parts.is_empty() {
            return Err(StorageError::InvalidKey(format!("Key has no name: {}", key)));
        }
        Ok(parts.join("/"))
    }

    /// 驗證檔案 key，不可以斜線結尾。
    fn verify_file_key(key: &str) -> Result<String> {
        if key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "File key cannot end with '/': {}",
                key
            )));
        }
        Self::normalize(key)
    }
}

/// 以目錄保存資料的儲存實作，每個 key 對應根目錄下的一個檔案。
///
/// 寫入先寫到暫存檔再改名，讀者不會看到寫到一半的內容。
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// 開啟（必要時建立）以 `root` 為根的儲存目錄。
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(KeyUtils::verify_file_key(key)?))
    }

    fn open_private(path: &Path) -> io::Result<fs::File> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }
}

impl Storage for FileStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = Self::open_private(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = KeyUtils::normalize(dir)?;
        let entries = match fs::read_dir(self.root.join(&dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    keys.push(format!("{}/{}", dir, name));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// 以記憶體保存資料的儲存實作，適用於測試或暫時性的使用情境。
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let key = KeyUtils::verify_file_key(key)?;
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        entries
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound(key))
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = KeyUtils::verify_file_key(key)?;
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key, value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let key = KeyUtils::verify_file_key(key)?;
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries
            .remove(&key)
            .map(|_| ())
            .ok_or(StorageError::NotFound(key))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let key = KeyUtils::verify_file_key(key)?;
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.contains_key(&key))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", KeyUtils::normalize(dir)?);
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| {
                k.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/'))
            })
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

const REGISTRATION_DIR: &str = "registration";
const ACCOUNT_DIR: &str = "account";
const AUTHORIZATION_DIR: &str = "authorization";
const AUTHORIZATION_DOMAIN_DIR: &str = "authorization-domain";
const AUTHORIZATION_SEQUENCE: &str = "authorization-sequence";
const CERTIFICATE_DIR: &str = "certificate";

/// 編碼後超過此長度的名稱改用 SHA-256 摘要，避免超出檔名長度限制。
const MAX_NAME_LEN: usize = 128;

/// 授權列表中的摘要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationInfo {
    pub dns_name: String,
    pub location: String,
    pub status: AuthorizationStatus,
    pub expires: Option<DateTime<Utc>>,
}

impl From<&Authorization> for AuthorizationInfo {
    fn from(auth: &Authorization) -> Self {
        AuthorizationInfo {
            dns_name: auth.dns_identifier.clone(),
            location: auth.location.clone(),
            status: auth.status,
            expires: auth.expires,
        }
    }
}

/// 證書列表中的摘要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub location: String,
    pub issuer_link: Option<String>,
}

/// 授權紀錄的外層；`sequence` 在首次保存時分配，之後更新不變。
#[derive(Debug, Serialize, Deserialize)]
struct Stored<T> {
    sequence: u64,
    record: T,
}

/// 以 JSON 紀錄保存協議資料。
///
/// 註冊以帳戶名稱保存；授權與證書歸屬於帳戶，不同帳戶的紀錄互不可見。
/// 紀錄名稱是帳戶名稱、位置或網域的 URL 安全 Base64，過長時改用 SHA-256 摘要。
#[derive(Debug)]
pub struct RecordStore<S: Storage> {
    storage: S,
}

impl<S: Storage> RecordStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn name(name: &str) -> String {
        let encoded = Base64::new(name).base64_url();
        if encoded.len() <= MAX_NAME_LEN {
            return encoded;
        }
        // `.` 不屬於 URL 安全 Base64 字元，兩種名稱不會重疊
        format!("sha256.{}", hex::encode(sha256(name.as_bytes())))
    }

    fn key(dir: &str, name: &str) -> String {
        format!("{}/{}", dir, Self::name(name))
    }

    fn account_dir(account: &str, dir: &str) -> String {
        format!("{}/{}/{}", ACCOUNT_DIR, Self::name(account), dir)
    }

    fn save<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        debug!("Saving record {}", key);
        self.storage.write_file(key, &serde_json::to_vec_pretty(record)?)
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.read_file(key) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 以帳戶名稱保存註冊。
    pub fn save_registration(&self, account: &str, registration: &Registration) -> Result<()> {
        self.save(&Self::key(REGISTRATION_DIR, account), registration)
    }

    pub fn load_registration(&self, account: &str) -> Result<Option<Registration>> {
        self.load(&Self::key(REGISTRATION_DIR, account))
    }

    fn authorization_key(account: &str, location: &str) -> String {
        Self::key(&Self::account_dir(account, AUTHORIZATION_DIR), location)
    }

    fn next_sequence(&self, account: &str) -> Result<u64> {
        let key = Self::account_dir(account, AUTHORIZATION_SEQUENCE);
        let next = self.load::<u64>(&key)?.unwrap_or(0) + 1;
        self.save(&key, &next)?;
        Ok(next)
    }

    /// 保存帳戶的授權。
    ///
    /// 首次保存的授權成為該網域最新的授權；再次保存同一位置只更新內容，不改變順序。
    pub fn save_authorization(&self, account: &str, authorization: &Authorization) -> Result<()> {
        if authorization.location.is_empty() {
            return Err(StorageError::InvalidKey(
                "authorization has no location".to_owned(),
            ));
        }
        let key = Self::authorization_key(account, &authorization.location);
        let existing = self.load::<Stored<Authorization>>(&key)?;
        let sequence = match &existing {
            Some(stored) => stored.sequence,
            None => self.next_sequence(account)?,
        };
        self.save(
            &key,
            &Stored {
                sequence,
                record: authorization,
            },
        )?;

        if existing.is_none() {
            self.storage.write_file(
                &Self::key(
                    &Self::account_dir(account, AUTHORIZATION_DOMAIN_DIR),
                    &authorization.dns_identifier,
                ),
                authorization.location.as_bytes(),
            )?;
        }
        Ok(())
    }

    pub fn load_authorization(&self, account: &str, location: &str) -> Result<Option<Authorization>> {
        Ok(self
            .load::<Stored<Authorization>>(&Self::authorization_key(account, location))?
            .map(|stored| stored.record))
    }

    /// 載入該網域最近建立的授權。
    pub fn load_authorization_by_domain(
        &self,
        account: &str,
        domain: &str,
    ) -> Result<Option<Authorization>> {
        let index = Self::key(&Self::account_dir(account, AUTHORIZATION_DOMAIN_DIR), domain);
        let location = match self.storage.read_file(&index) {
            Ok(data) => String::from_utf8_lossy(&data).into_owned(),
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.load_authorization(account, &location)
    }

    /// 列出帳戶的授權，依網域分組，每組由新到舊排列。
    ///
    /// `status` 為 `Some` 時只列出該狀態的授權。
    pub fn list_authorizations(
        &self,
        account: &str,
        status: Option<AuthorizationStatus>,
    ) -> Result<BTreeMap<String, Vec<AuthorizationInfo>>> {
        let mut found = Vec::new();
        for key in self.storage.list(&Self::account_dir(account, AUTHORIZATION_DIR))? {
            let Some(stored) = self.load::<Stored<Authorization>>(&key)? else {
                continue;
            };
            if status.map_or(true, |s| s == stored.record.status) {
                found.push((stored.sequence, AuthorizationInfo::from(&stored.record)));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));

        let mut by_domain: BTreeMap<String, Vec<AuthorizationInfo>> = BTreeMap::new();
        for (_, info) in found {
            by_domain.entry(info.dns_name.clone()).or_default().push(info);
        }
        Ok(by_domain)
    }

    fn certificate_key(account: &str, location: &str) -> String {
        Self::key(&Self::account_dir(account, CERTIFICATE_DIR), location)
    }

    /// 以位置保存帳戶的證書。
    pub fn save_certificate(&self, account: &str, certificate: &Certificate) -> Result<()> {
        self.save(&Self::certificate_key(account, &certificate.location), certificate)
    }

    pub fn load_certificate(&self, account: &str, location: &str) -> Result<Option<Certificate>> {
        self.load(&Self::certificate_key(account, location))
    }

    /// 列出帳戶的證書，依位置排序。
    pub fn list_certificates(&self, account: &str) -> Result<Vec<CertificateInfo>> {
        let mut infos = Vec::new();
        for key in self.storage.list(&Self::account_dir(account, CERTIFICATE_DIR))? {
            if let Some(cert) = self.load::<Certificate>(&key)? {
                infos.push(CertificateInfo {
                    location: cert.location,
                    issuer_link: cert.issuer_link,
                });
            }
        }
        infos.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn authorization(location: &str, domain: &str, status: AuthorizationStatus) -> Authorization {
        Authorization {
            location: location.to_owned(),
            cert_link: "https://ca.example/acme/new-cert".to_owned(),
            dns_identifier: domain.to_owned(),
            status,
            challenges: vec![serde_json::from_value(json!({
                "type": "simpleHttps",
                "uri": format!("{}/0", location),
                "token": "tok",
                "path": "custom.txt"
            }))
            .unwrap()],
            combinations: vec![vec![0]],
            expires: None,
        }
    }

    fn exercise_storage(storage: &dyn Storage) -> Result<()> {
        storage.write_file("a/one", b"1")?;
        storage.write_file("/a/two", b"2")?;
        storage.write_file("a/nested/three", b"3")?;
        assert_eq!(storage.read_file("a/one")?, b"1");
        assert!(storage.exists("a/two")?);
        assert_eq!(storage.list("a")?, vec!["a/one", "a/two"]);
        assert!(storage.list("missing")?.is_empty());

        storage.write_file("a/one", b"1b")?;
        assert_eq!(storage.read_file("a/one")?, b"1b");

        storage.remove("a/one")?;
        assert!(!storage.exists("a/one")?);
        assert!(matches!(storage.read_file("a/one"), Err(StorageError::NotFound(_))));
        assert!(matches!(storage.remove("a/one"), Err(StorageError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_mem_storage_basic_operations() -> Result<()> {
        exercise_storage(&MemoryStorage::new())
    }

    #[test]
    fn test_file_storage_basic_operations() -> Result<()> {
        let dir = tempdir()?;
        exercise_storage(&FileStorage::open(dir.path())?)
    }

    #[test]
    fn test_invalid_keys() {
        let storage = MemoryStorage::new();
        for key in ["", "a/", "a//b", "../x", "a\\b", "a\nb", "/"] {
            assert!(
                matches!(storage.write_file(key, b"x"), Err(StorageError::InvalidKey(_))),
                "{:?}",
                key
            );
        }
    }

    #[test]
    fn test_registration_records() -> Result<()> {
        let store = RecordStore::new(MemoryStorage::new());
        assert!(store.load_registration("default")?.is_none());

        let registration = Registration {
            location: "https://ca.example/acme/reg/1".to_owned(),
            authorization_link: "https://ca.example/acme/new-authz".to_owned(),
            contact: vec!["mailto:a@example.com".to_owned()],
            recovery_token: Some("secret".to_owned()),
            ..Default::default()
        };
        store.save_registration("default", &registration)?;

        let loaded = store.load_registration("default")?.unwrap();
        assert_eq!(loaded.location, registration.location);
        assert_eq!(loaded.recovery_token, None);
        Ok(())
    }

    #[test]
    fn test_authorization_records() -> Result<()> {
        let dir = tempdir()?;
        let store = RecordStore::new(FileStorage::open(dir.path())?);

        let old = authorization("https://ca.example/acme/authz/1", "example.com", AuthorizationStatus::Invalid);
        let new = authorization("https://ca.example/acme/authz/2", "example.com", AuthorizationStatus::Valid);
        let other = authorization("https://ca.example/acme/authz/3", "example.org", AuthorizationStatus::Pending);
        store.save_authorization("default", &old)?;
        store.save_authorization("default", &new)?;
        store.save_authorization("default", &other)?;
        // 更新既有授權不改變順序
        store.save_authorization("default", &old)?;

        assert_eq!(store.load_authorization("default", &old.location)?, Some(old.clone()));
        assert_eq!(store.load_authorization_by_domain("default", "example.com")?, Some(new.clone()));
        assert_eq!(store.load_authorization_by_domain("default", "example.net")?, None);

        let all = store.list_authorizations("default", None)?;
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["example.com", "example.org"]);
        assert_eq!(
            all["example.com"],
            vec![AuthorizationInfo::from(&new), AuthorizationInfo::from(&old)]
        );

        let valid = store.list_authorizations("default", Some(AuthorizationStatus::Valid))?;
        assert_eq!(valid.len(), 1);
        assert_eq!(valid["example.com"], vec![AuthorizationInfo::from(&new)]);
        Ok(())
    }

    #[test]
    fn test_records_are_scoped_by_account() -> Result<()> {
        let store = RecordStore::new(MemoryStorage::new());
        let auth = authorization("https://ca.example/acme/authz/1", "example.com", AuthorizationStatus::Valid);
        store.save_authorization("alice", &auth)?;

        assert_eq!(store.load_authorization("bob", &auth.location)?, None);
        assert_eq!(store.load_authorization_by_domain("bob", "example.com")?, None);
        assert!(store.list_authorizations("bob", None)?.is_empty());
        assert_eq!(store.list_authorizations("alice", None)?.len(), 1);

        let cert = Certificate {
            der: vec![0x30, 0x03, 0x02, 0x01, 0x01],
            location: "https://ca.example/acme/cert/1".to_owned(),
            issuer_link: None,
        };
        store.save_certificate("alice", &cert)?;
        assert_eq!(store.load_certificate("bob", &cert.location)?, None);
        assert!(store.list_certificates("bob")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_long_location_fits_in_file_name() -> Result<()> {
        let dir = tempdir()?;
        let store = RecordStore::new(FileStorage::open(dir.path())?);
        let location = format!("https://ca.example/acme/authz/{}", "x".repeat(300));
        let auth = authorization(&location, "example.com", AuthorizationStatus::Pending);

        store.save_authorization("default", &auth)?;
        assert_eq!(store.load_authorization("default", &location)?, Some(auth.clone()));
        assert_eq!(store.load_authorization_by_domain("default", "example.com")?, Some(auth));
        for key in store.storage().list(&RecordStore::<FileStorage>::account_dir(
            "default",
            AUTHORIZATION_DIR,
        ))? {
            let name = key.rsplit('/').next().unwrap_or_default();
            assert!(name.len() <= MAX_NAME_LEN, "{}", name);
        }
        Ok(())
    }

    #[test]
    fn test_certificate_records() -> Result<()> {
        let store = RecordStore::new(MemoryStorage::new());
        let cert = Certificate {
            der: vec![0x30, 0x03, 0x02, 0x01, 0x01],
            location: "https://ca.example/acme/cert/1".to_owned(),
            issuer_link: Some("https://ca.example/acme/issuer".to_owned()),
        };
        store.save_certificate("default", &cert)?;
        assert_eq!(store.load_certificate("default", &cert.location)?, Some(cert.clone()));
        assert_eq!(store.load_certificate("default", "https://ca.example/acme/cert/2")?, None);
        assert_eq!(
            store.list_certificates("default")?,
            vec![CertificateInfo {
                location: cert.location,
                issuer_link: cert.issuer_link,
            }]
        );
        Ok(())
    }

    #[test]
    fn test_corrupted_record() -> Result<()> {
        let store = RecordStore::new(MemoryStorage::new());
        let key = RecordStore::<MemoryStorage>::certificate_key("default", "x");
        store.storage().write_file(&key, b"{")?;
        assert!(matches!(
            store.load_certificate("default", "x"),
            Err(StorageError::Corrupted(_))
        ));
        Ok(())
    }
}
