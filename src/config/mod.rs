/// 统一配置系统
///
/// 提供TOML/JSON配置文件、环境变量覆盖和加载后验证
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 为配置段生成 `Default` 实现，字段默认值集中写在一处
macro_rules! config_defaults {
    ($section:ident { $($field:ident: $value:expr),* $(,)? }) => {
        impl Default for $section {
            fn default() -> Self {
                Self {
                    $($field: $value),*
                }
            }
        }
    };
}

/// 绑定配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 文件读取错误
    #[error("Config file error: {0}")]
    FileError(#[from] std::io::Error),
    /// 解析错误
    #[error("Config parse error: {0}")]
    ParseError(String),
    /// 验证错误
    #[error("Config validation error: {0}")]
    ValidationError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// 绑定主配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// 总线配置
    #[serde(default)]
    pub bus: BusConfig,

    /// 持久化存储配置
    #[serde(default)]
    pub storage: StorageConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BindingConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从TOML文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_toml_str(&content)
    }

    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_json_str(&content)
    }

    /// 从JSON字符串解析配置
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 保存为TOML文件
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 从环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("AJS_CALL_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.bus.call_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("AJS_LINK_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.bus.link_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("AJS_STORE_PATH") {
            if !val.is_empty() {
                self.storage.path = Some(PathBuf::from(val));
            }
        }
        if let Ok(val) = env::var("AJS_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                self.logging.level = level;
            }
        }
    }

    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        self.bus.validate()?;
        Ok(())
    }

    /// 自动查找并加载配置文件
    ///
    /// 按以下顺序查找：
    /// 1. ./alljoyn_js.toml
    /// 2. <用户配置目录>/alljoyn_js/config.toml
    /// 3. 使用默认配置
    pub fn load_or_default() -> Self {
        if let Ok(config) = Self::from_toml_file("alljoyn_js.toml") {
            tracing::info!(target: "ajs.config", "Loaded config from alljoyn_js.toml");
            return config;
        }

        if let Some(dir) = dirs::config_dir() {
            let config_path = dir.join("alljoyn_js").join("config.toml");
            if let Ok(config) = Self::from_toml_file(&config_path) {
                tracing::info!(target: "ajs.config", "Loaded config from {:?}", config_path);
                return config;
            }
        }

        tracing::info!(target: "ajs.config", "Using default configuration");
        Self::default()
    }
}

/// 总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 链路超时（毫秒），超过后连接视为丢失
    pub link_timeout_ms: u64,
    /// 方法调用超时（毫秒），0 表示不超时
    pub call_timeout_ms: u64,
    /// 无会话信号默认存活时间（秒）
    pub sessionless_ttl_s: u32,
    /// 应用会话端口
    pub app_port: u16,
    /// 定时器表容量
    pub max_timers: usize,
}

config_defaults!(BusConfig {
    link_timeout_ms: 30_000,
    call_timeout_ms: 10_000,
    sessionless_ttl_s: 30,
    app_port: 2,
    max_timers: 256,
});

impl BusConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_timers == 0 || self.max_timers > 256 {
            return Err(ConfigError::ValidationError(format!(
                "max_timers must be in 1..=256, got {}",
                self.max_timers
            )));
        }
        if self.app_port == 0 {
            return Err(ConfigError::ValidationError(
                "app_port must be non-zero".to_string(),
            ));
        }
        if self.link_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "link_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// 持久化存储配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 属性存储文件路径，缺省时使用内存存储
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// 默认的存储文件位置
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("alljoyn_js").join("store.json"))
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,

    /// 是否输出 target
    pub with_target: bool,
}

config_defaults!(LoggingConfig {
    level: LogLevel::Info,
    with_target: true,
});

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// 跟踪
    Trace,
    /// 调试
    Debug,
    /// 信息
    Info,
    /// 警告
    Warn,
    /// 错误
    Error,
}

impl LogLevel {
    /// 解析日志级别名称（大小写不敏感）
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BindingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.sessionless_ttl_s, 30);
        assert_eq!(config.bus.app_port, 2);
        assert_eq!(config.bus.max_timers, 256);
    }

    #[test]
    fn test_toml_serialization() {
        let mut config = BindingConfig::default();
        config.bus.call_timeout_ms = 2500;
        config.storage.path = Some(PathBuf::from("/tmp/store.json"));
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BindingConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = BindingConfig::from_toml_str(
            r#"
            [bus]
            call_timeout_ms = 0

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.bus.call_timeout_ms, 0);
        assert_eq!(parsed.bus.link_timeout_ms, 30_000);
        assert_eq!(parsed.logging.level, LogLevel::Debug);
        assert!(parsed.storage.path.is_none());
    }

    #[test]
    fn test_json_serialization() {
        let config = BindingConfig::default();
        let json_str = serde_json::to_string(&config).unwrap();
        let parsed = BindingConfig::from_json_str(&json_str).unwrap();
        assert_eq!(config.bus.app_port, parsed.bus.app_port);
    }

    #[test]
    fn test_validation_rejects_bad_timer_capacity() {
        let mut config = BindingConfig::default();
        config.bus.max_timers = 1024;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = BindingConfig::default();
        config.bus.sessionless_ttl_s = 5;
        config.save_toml(&path).unwrap();
        let loaded = BindingConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.bus.sessionless_ttl_s, 5);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("nope"), None);
    }
}
