//! 内容寻址缓存 - 基础设施层
//!
//! 指纹 → 已观察到的响应。缓存只是优化：写入失败只记录警告，读取失败视为未命中。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::infrastructure::http::{Fingerprint, HttpResponse};

/// 响应缓存
///
/// 所有方法都可能被多个 worker 同时调用。
pub trait ResponseCache: Send + Sync {
    /// 是否存在未过期的条目
    fn has(&self, key: &Fingerprint) -> bool;
    /// 读取未过期的条目
    fn get(&self, key: &Fingerprint) -> Option<HttpResponse>;
    /// 写入条目
    fn put(&self, key: &Fingerprint, response: &HttpResponse, ttl: Duration);
    /// 删除条目，返回之前是否存在
    fn invalidate(&self, key: &Fingerprint) -> bool;
}

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    response: HttpResponse,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(response: &HttpResponse, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        let now = Utc::now();
        Self {
            response: response.clone(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

// ========== 内存缓存 ==========

/// 进程内缓存
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<Fingerprint, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 删除仍然过期的条目；检查之后新 put 的条目会保留
    fn evict_if_expired(&self, key: &Fingerprint) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.is_expired())
            .is_some()
    }
}

impl ResponseCache for MemoryCache {
    fn has(&self, key: &Fingerprint) -> bool {
        self.get(key).is_some()
    }

    fn get(&self, key: &Fingerprint) -> Option<HttpResponse> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.response.clone()),
            Some(_) => true,
            None => false,
        };
        if expired && self.evict_if_expired(key) {
            debug!("缓存条目已过期: {}", key);
        }
        None
    }

    fn put(&self, key: &Fingerprint, response: &HttpResponse, ttl: Duration) {
        self.entries
            .insert(key.clone(), CacheEntry::new(response, ttl));
    }

    fn invalidate(&self, key: &Fingerprint) -> bool {
        self.entries.remove(key).is_some()
    }
}

// ========== 磁盘缓存 ==========

/// 每个指纹一个 JSON 文件的磁盘缓存，进程重启后仍然有效
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// 创建磁盘缓存，目录不存在时自动创建
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    fn read_entry(&self, key: &Fingerprint) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("缓存文件损坏，已忽略 {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl ResponseCache for DiskCache {
    fn has(&self, key: &Fingerprint) -> bool {
        self.get(key).is_some()
    }

    fn get(&self, key: &Fingerprint) -> Option<HttpResponse> {
        let entry = self.read_entry(key)?;
        if entry.is_expired() {
            debug!("缓存条目已过期: {}", key);
            self.invalidate(key);
            return None;
        }
        Some(entry.response)
    }

    fn put(&self, key: &Fingerprint, response: &HttpResponse, ttl: Duration) {
        let path = self.entry_path(key);
        let entry = CacheEntry::new(response, ttl);
        let result = serde_json::to_vec(&entry)
            .map_err(std::io::Error::from)
            .and_then(|bytes| fs::write(&path, bytes));
        if let Err(e) = result {
            warn!("写入缓存失败 {}: {}", path.display(), e);
        }
    }

    fn invalidate(&self, key: &Fingerprint) -> bool {
        fs::remove_file(self.entry_path(key)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::http::HttpRequest;

    fn key(url: &str) -> Fingerprint {
        HttpRequest::get(url).fingerprint()
    }

    #[test]
    fn memory_cache_put_get_invalidate() {
        let cache = MemoryCache::new();
        let k = key("http://x/a");
        assert!(!cache.has(&k));

        cache.put(&k, &HttpResponse::ok("http://x/a", "body"), Duration::from_secs(60));
        assert!(cache.has(&k));
        assert_eq!(cache.get(&k).unwrap().body, "body");

        assert!(cache.invalidate(&k));
        assert!(!cache.has(&k));
        assert!(!cache.invalidate(&k));
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = MemoryCache::new();
        let k = key("http://x/a");
        cache.put(&k, &HttpResponse::ok("http://x/a", "body"), Duration::ZERO);
        assert!(!cache.has(&k));
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_keeps_an_entry_refreshed_after_the_expiry_check() {
        let cache = MemoryCache::new();
        let k = key("http://x/a");
        cache.put(&k, &HttpResponse::ok("http://x/a", "stale"), Duration::ZERO);
        // 另一个 worker 在过期检查之后写入了新条目
        cache.put(&k, &HttpResponse::ok("http://x/a", "fresh"), Duration::from_secs(60));

        assert!(!cache.evict_if_expired(&k));
        assert_eq!(cache.get(&k).unwrap().body, "fresh");
    }

    #[test]
    fn disk_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("http://x/report");
        {
            let cache = DiskCache::open(dir.path()).unwrap();
            cache.put(&k, &HttpResponse::ok("http://x/report", "<html/>"), Duration::from_secs(60));
        }
        let reopened = DiskCache::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&k).unwrap().body, "<html/>");
        assert!(reopened.invalidate(&k));
        assert!(!reopened.has(&k));
    }
}
