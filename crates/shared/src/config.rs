//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleEngineConfig {
    /// 单次评估的默认时间预算（毫秒）
    pub default_budget_ms: u64,
    /// 两次预算检查之间评估的候选规则数
    pub batch_size: usize,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            default_budget_ms: 100,
            batch_size: 64,
        }
    }
}

impl RuleEngineConfig {
    pub fn default_budget(&self) -> Duration {
        Duration::from_millis(self.default_budget_ms)
    }
}

/// 评估结果缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// 最多保留的评估结果条数（LRU 淘汰）
    pub capacity: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1000,
            ttl_seconds: 3600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: RuleEngineConfig,
    pub cache: CacheConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（KUNDALI_ 前缀，层级用双下划线，如 KUNDALI_CACHE__TTL_SECONDS -> cache.ttl_seconds）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("KUNDALI_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), service_name, &env)
    }

    /// 从指定目录加载配置（不读取 KUNDALI_ENV / CONFIG_DIR）
    pub fn load_from(
        config_dir: &Path,
        service_name: &str,
        environment: &str,
    ) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", environment)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", environment))).required(false),
            )
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("KUNDALI")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.default_budget_ms, 100);
        assert_eq!(config.engine.batch_size, 64);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert!(!config.observability.json_logs());
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let dir = std::env::temp_dir().join("kundali-config-missing-dir");
        let config = AppConfig::load_from(&dir, "rule-engine", "test").unwrap();

        assert_eq!(config.service_name, "rule-engine");
        assert_eq!(config.environment, "test");
        assert_eq!(config.engine.batch_size, 64);
        assert!(!config.is_production());
    }

    #[test]
    fn test_service_file_overrides_default_file() {
        let dir = std::env::temp_dir().join(format!(
            "kundali-config-layering-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("default.toml"),
            "[cache]\ncapacity = 50\nttl_seconds = 10\n",
        )
        .unwrap();
        fs::write(
            dir.join("rule-engine.toml"),
            "[cache]\ncapacity = 7\n\n[observability]\nlog_format = \"json\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&dir, "rule-engine", "staging").unwrap();

        // 服务配置覆盖默认配置，未覆盖的字段保留默认文件的值
        assert_eq!(config.cache.capacity, 7);
        assert_eq!(config.cache.ttl_seconds, 10);
        assert!(config.cache.enabled);
        assert!(config.observability.json_logs());

        fs::remove_dir_all(&dir).unwrap();
    }
}
