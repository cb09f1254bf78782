use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::Path,
    time::Duration,
};
use anyhow::{Context, Result};

use crate::engine::StoreOptions;

/// 进程启动后，从 config.json 中读到的全局配置
///
/// 缺失的字段使用默认值，所以旧的配置文件依然可以加载。
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 监听地址
    pub bind: String,
    /// keyspace 分片数
    pub shard_count: usize,
    /// 过期清理周期（毫秒）
    pub sweep_interval_ms: u64,
    /// 每次清理每个分片最多检查的 key 数
    pub sweep_keys_per_shard: usize,
    /// 每个订阅者的消息队列长度，满了就断开
    pub pubsub_queue_capacity: usize,
    /// tracing 过滤规则，`RUST_LOG` 优先
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:6380".into(),
            shard_count: 16,
            sweep_interval_ms: 100,
            sweep_keys_per_shard: 20,
            pubsub_queue_capacity: 1024,
            log_filter: "info".into(),
        }
    }
}

impl Config {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            shard_count: self.shard_count.max(1),
            pubsub_queue_capacity: self.pubsub_queue_capacity.max(1),
            ..StoreOptions::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// 从指定路径读取并反序列化 JSON 配置
///
/// 文件不存在时写入一份默认配置；返回值的第二项表示是否新建了文件。
pub fn load<P: AsRef<Path>>(path: P) -> Result<(Config, bool)> {
    let path = path.as_ref();

    // 如果配置文件不存在，创建默认配置
    if !path.exists() {
        let default_cfg = Config::default();
        let default_json = serde_json::to_string_pretty(&default_cfg)?;
        fs::write(path, default_json)
            .with_context(|| format!("Failed to write default config {:?}", path))?;
        return Ok((default_cfg, true));
    }

    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let cfg: Config = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse {:?}", path))?;
    Ok((cfg, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // 文件不存在：写出默认配置，再次加载得到同样的内容
    #[test]
    fn test_missing_file_creates_default() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");

        let (cfg, created) = load(&path)?;
        assert!(created);
        assert_eq!(cfg, Config::default());
        assert!(path.exists());

        let (again, created) = load(&path)?;
        assert!(!created);
        assert_eq!(again, cfg);
        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "bind": "0.0.0.0:7000", "shard_count": 4 }"#)?;

        let (cfg, _) = load(&path)?;
        assert_eq!(cfg.bind, "0.0.0.0:7000");
        assert_eq!(cfg.shard_count, 4);
        assert_eq!(cfg.sweep_keys_per_shard, 20);
        assert_eq!(cfg.store_options().shard_count, 4);
        Ok(())
    }

    #[test]
    fn test_invalid_json_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json")?;
        assert!(load(&path).is_err());
        Ok(())
    }
}
