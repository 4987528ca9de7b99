use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::debug;
use thiserror::Error;

use crate::http::{HttpClient, HttpMethod, HttpRequest, TransportError};

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to make request: {0}")]
    Transport(#[from] TransportError),
    /// 當回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response from {0}")]
    NoNonceHeader(String),
}

/// 定義取得與回收 Nonce 的行為。
///
/// 每個 nonce 只能使用一次：`get` 交出的值不會再被交出第二次。
pub trait NonceT: Send + Sync {
    /// 取得一個可用於對 `url` 簽名請求的 nonce。
    fn get(&self, url: &str) -> Result<String, NonceError>;

    /// 保存伺服器在回應中附帶的新 nonce，供下一次請求使用。
    fn store(&self, nonce: String);
}

/// 透過 HTTP 取得 `Replay-Nonce` 的實作。
///
/// 優先使用先前回應中收集到的 nonce；池中沒有可用值時，對目標 URL 發送 HEAD 請求。
pub struct Nonce {
    client: Arc<dyn HttpClient>,
    pool: Mutex<VecDeque<String>>,
}

impl Nonce {
    /// 池中最多保留的 nonce 數量，超過時丟棄最舊的值。
    pub const MAX_POOLED: usize = 16;

    /// 建立一個新的 `Nonce` 實例。
    ///
    /// # 參數
    ///
    /// * `client` - 用來發送 HEAD 請求的 HTTP 用戶端。
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Nonce {
            client,
            pool: Mutex::new(VecDeque::new()),
        }
    }

    fn pop(&self) -> Option<String> {
        self.pool.lock().ok()?.pop_front()
    }

    /// 目前池中的 nonce 數量。
    pub fn pooled(&self) -> usize {
        self.pool.lock().map(|pool| pool.len()).unwrap_or(0)
    }
}

impl NonceT for Nonce {
    fn get(&self, url: &str) -> Result<String, NonceError> {
        if let Some(nonce) = self.pop() {
            return Ok(nonce);
        }

        debug!("Nonce pool empty, fetching a fresh nonce from {}", url);
        let response = self.client.execute(&HttpRequest::new(HttpMethod::Head, url))?;
        response
            .replay_nonce
            .ok_or_else(|| NonceError::NoNonceHeader(url.to_owned()))
    }

    fn store(&self, nonce: String) {
        if nonce.is_empty() {
            return;
        }
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() >= Self::MAX_POOLED {
                pool.pop_front();
            }
            pool.push_back(nonce);
        }
    }
}

/// 模擬 Nonce 實作，用於測試環境。
///
/// 每次呼叫 `get` 回傳 `前綴-序號`，保證值不重複。
#[derive(Debug)]
pub struct MockNonce {
    prefix: String,
    counter: AtomicUsize,
}

impl MockNonce {
    /// 建立一個新的 `MockNonce` 實例。
    ///
    /// # 參數
    ///
    /// * `prefix` - 模擬 nonce 的前綴。
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl NonceT for MockNonce {
    fn get(&self, _url: &str) -> Result<String, NonceError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-{}", self.prefix, n))
    }

    fn store(&self, _nonce: String) {}
}
