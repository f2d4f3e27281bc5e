use crate::models::batch_spec::BatchSpec;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从 TOML 文件加载批次描述
pub async fn load_batch_spec(toml_file_path: &Path) -> Result<BatchSpec> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut spec: BatchSpec = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    // 尽早拒绝未知的请求类型
    spec.variant()
        .with_context(|| format!("批次文件无效: {}", toml_file_path.display()))?;

    spec.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(spec)
}

/// 从文件夹中加载所有批次文件（按文件名排序）
///
/// 单个文件加载失败只记录警告，不影响其他文件。
pub async fn load_all_batch_specs(folder_path: &str) -> Result<Vec<BatchSpec>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut specs = Vec::new();
    for path in toml_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_batch_spec(&path).await {
            Ok(spec) => {
                tracing::info!("成功加载 {} 个请求 ({})", spec.args.len(), spec.variant);
                specs.push(spec);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(specs)
}
