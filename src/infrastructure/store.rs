//! 持久化端口 - 基础设施层
//!
//! 批次记录保存在"某个实体的某个字段"中，是整个系统唯一的共享可变资源。
//! 只暴露读、整体写、单条定向更新三种能力。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{RecordUpdate, RequestRecord};

/// 批次记录存储
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 读取字段中的全部记录，不存在时返回空数组
    async fn read(&self, entity_id: &str, field_name: &str) -> Result<Vec<RequestRecord>, StoreError>;

    /// 整体覆盖字段
    async fn write(
        &self,
        entity_id: &str,
        field_name: &str,
        records: Vec<RequestRecord>,
    ) -> Result<(), StoreError>;

    /// 只更新第 `index` 条记录的终态字段
    ///
    /// 实现必须保证与其他更新互斥，不能出现"后写覆盖先写"的丢失更新。
    async fn update_record(
        &self,
        entity_id: &str,
        field_name: &str,
        index: usize,
        update: &RecordUpdate,
    ) -> Result<(), StoreError>;
}

fn apply_at(
    records: &mut [RequestRecord],
    entity_id: &str,
    field_name: &str,
    index: usize,
    update: &RecordUpdate,
) -> Result<(), StoreError> {
    let len = records.len();
    let record = records
        .get_mut(index)
        .ok_or_else(|| StoreError::IndexOutOfRange {
            entity_id: entity_id.to_string(),
            field_name: field_name.to_string(),
            index,
            len,
        })?;
    record.apply(update);
    Ok(())
}

// ========== 内存存储 ==========

/// 进程内存储
#[derive(Default)]
pub struct MemoryStore {
    fields: RwLock<HashMap<(String, String), Vec<RequestRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read(&self, entity_id: &str, field_name: &str) -> Result<Vec<RequestRecord>, StoreError> {
        let fields = self.fields.read().await;
        Ok(fields
            .get(&(entity_id.to_string(), field_name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        entity_id: &str,
        field_name: &str,
        records: Vec<RequestRecord>,
    ) -> Result<(), StoreError> {
        self.fields
            .write()
            .await
            .insert((entity_id.to_string(), field_name.to_string()), records);
        Ok(())
    }

    async fn update_record(
        &self,
        entity_id: &str,
        field_name: &str,
        index: usize,
        update: &RecordUpdate,
    ) -> Result<(), StoreError> {
        let mut fields = self.fields.write().await;
        let records = fields
            .entry((entity_id.to_string(), field_name.to_string()))
            .or_default();
        apply_at(records, entity_id, field_name, index, update)
    }
}

// ========== JSON 文件存储 ==========

/// 每个实体一个 JSON 文件：`{ "<field>": [records...] }`
///
/// 读-改-写由一把存储级互斥锁串行化，同一进程内的定向更新是原子的。
pub struct JsonFileStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// 打开存储目录，不存在时自动创建
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn entity_path(&self, entity_id: &str) -> PathBuf {
        let safe: String = entity_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    async fn load_entity(&self, path: &Path) -> Result<Map<String, JsonValue>, StoreError> {
        let display = path.display().to_string();
        match fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| StoreError::json(display, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(StoreError::io(display, e)),
        }
    }

    async fn save_entity(&self, path: &Path, entity: &Map<String, JsonValue>) -> Result<(), StoreError> {
        let display = path.display().to_string();
        let content =
            serde_json::to_string_pretty(entity).map_err(|e| StoreError::json(display.clone(), e))?;
        // 先写临时文件再改名，读者不会看到写了一半的文件
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::io(tmp.display().to_string(), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::io(display, e))
    }

    fn field_records(
        entity: &Map<String, JsonValue>,
        field_name: &str,
        path: &Path,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        match entity.get(field_name) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| StoreError::json(path.display().to_string(), e)),
            None => Ok(Vec::new()),
        }
    }

    fn put_field(
        entity: &mut Map<String, JsonValue>,
        field_name: &str,
        records: &[RequestRecord],
        path: &Path,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(records)
            .map_err(|e| StoreError::json(path.display().to_string(), e))?;
        entity.insert(field_name.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn read(&self, entity_id: &str, field_name: &str) -> Result<Vec<RequestRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.entity_path(entity_id);
        let entity = self.load_entity(&path).await?;
        Self::field_records(&entity, field_name, &path)
    }

    async fn write(
        &self,
        entity_id: &str,
        field_name: &str,
        records: Vec<RequestRecord>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.entity_path(entity_id);
        let mut entity = self.load_entity(&path).await?;
        Self::put_field(&mut entity, field_name, &records, &path)?;
        self.save_entity(&path, &entity).await?;
        debug!("已写入 {} 条记录: {}.{}", records.len(), entity_id, field_name);
        Ok(())
    }

    async fn update_record(
        &self,
        entity_id: &str,
        field_name: &str,
        index: usize,
        update: &RecordUpdate,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.entity_path(entity_id);
        let mut entity = self.load_entity(&path).await?;
        let mut records = Self::field_records(&entity, field_name, &path)?;
        apply_at(&mut records, entity_id, field_name, index, update)?;
        Self::put_field(&mut entity, field_name, &records, &path)?;
        self.save_entity(&path, &entity).await
    }
}
