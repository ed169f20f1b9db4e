use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use config::FileFormat as SourceFormat;

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 环境变量前缀 / Environment variable prefix
pub const ENV_PREFIX: &str = "VIM";

/// 配置错误类型 / Configuration error kinds
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },
    #[error("config key '{key}' not found")]
    KeyNotFound { key: String },
    #[error("config key '{key}' has wrong type: {message}")]
    TypeConversionError { key: String, message: String },
    #[error("config initialisation failed: {message}")]
    InitializationError { message: String },
}

/// 配置数据源信息 / Loaded source description
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: String,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 分层配置管理器 / Layered configuration manager
///
/// 优先级（低到高）/ Priority (low to high):
/// `config/development.toml` < `config/default.toml` < `config/production.toml`
/// < `VIM_*` 环境变量 / env vars < 额外数据源 / extra sources
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 使用额外配置源创建（额外源优先级最高）/ Build with extra sources on top
    pub fn with_sources(extra: Vec<ConfigSource>) -> Result<Self> {
        let defaults = vec![
            ConfigSource::optional_file("config/development.toml"),
            ConfigSource::optional_file("config/default.toml"),
            ConfigSource::optional_file("config/production.toml"),
            ConfigSource::Env {
                prefix: ENV_PREFIX.to_string(),
                separator: "__",
            },
        ];
        Self::from_sources(defaults.into_iter().chain(extra).collect())
    }

    /// 不含任何配置源，所有读取都走默认值 / No sources, every read falls back to its default
    pub fn empty() -> Self {
        Self {
            config: Config::default(),
            sources_info: Vec::new(),
        }
    }

    /// 仅使用给定配置源（测试用）/ Build from exactly these sources (tests)
    pub fn from_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::with_capacity(sources.len());

        for (idx, source) in sources.into_iter().enumerate() {
            let mut info = source.info(idx as u8 + 1);
            if let ConfigSource::File { path, required, .. } = &source {
                let exists = std::path::Path::new(path).exists();
                if !exists && *required {
                    return Err(ConfigError::FileNotFound { path: path.clone() }.into());
                }
                if !exists {
                    sources_info.push(info);
                    continue;
                }
            }
            builder = source.add_to_builder(builder)?;
            info.loaded = true;
            sources_info.push(info);
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("failed to build config: {}", e))?;
        Ok(Self {
            config,
            sources_info,
        })
    }

    /// 获取配置值 / Get a typed value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("failed to read config '{}': {}", key, e))
    }

    /// 获取配置值或默认值 / Get a typed value or the default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 获取配置值（细分错误）/ Get with a classified error
    pub fn get_safe<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.config.get(key).map_err(|e| match e {
            config::ConfigError::NotFound(_) => ConfigError::KeyNotFound {
                key: key.to_string(),
            },
            other => ConfigError::TypeConversionError {
                key: key.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// 反序列化整个配置段 / Deserialize a whole section
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.get_safe(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<serde_json::Value>(key).is_ok()
    }

    pub fn sources_info(&self) -> &[ConfigSourceInfo] {
        &self.sources_info
    }

    /// (总数, 已加载) / (total, loaded)
    pub fn sources_stats(&self) -> (usize, usize) {
        let loaded = self.sources_info.iter().filter(|i| i.loaded).count();
        (self.sources_info.len(), loaded)
    }
}

/// 配置源类型 / Configuration source
pub enum ConfigSource {
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    Env {
        prefix: String,
        separator: &'static str,
    },
    Memory(HashMap<String, serde_json::Value>),
    String {
        content: String,
        format: FileFormat,
    },
}

impl ConfigSource {
    pub fn optional_file(path: &str) -> Self {
        ConfigSource::File {
            path: path.to_string(),
            format: Some(FileFormat::Toml),
            required: false,
        }
    }

    /// 必需文件，格式按扩展名识别 / Required file, format by extension
    pub fn required_file(path: &str) -> Self {
        ConfigSource::File {
            path: path.to_string(),
            format: None,
            required: true,
        }
    }

    fn info(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File { path, required, .. } => {
                ("File", format!("file {} (required: {})", path, required))
            }
            ConfigSource::Env { prefix, separator } => (
                "Environment",
                format!("env prefix={} separator={}", prefix, separator),
            ),
            ConfigSource::Memory(map) => ("Memory", format!("{} in-memory keys", map.len())),
            ConfigSource::String { .. } => ("String", "inline string".to_string()),
        };
        ConfigSourceInfo {
            source_type: source_type.to_string(),
            description,
            priority,
            loaded: false,
        }
    }

    fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => {
                let file = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator(separator)
                    .prefix_separator("_")
                    .try_parsing(true)
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                let json = serde_json::to_string(&map)
                    .map_err(|e| anyhow!("failed to encode memory config: {}", e))?;
                Ok(builder.add_source(File::from_str(&json, FileFormat::Json)))
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

/// 安装全局配置管理器（启动时调用一次）/ Install the process-wide manager once at boot
pub fn init_global_config_manager(extra: Vec<ConfigSource>) -> Result<Arc<ConfigManager>> {
    let manager = Arc::new(ConfigManager::with_sources(extra)?);
    let mut guard = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("config manager lock poisoned: {}", e))?;
    *guard = Some(Arc::clone(&manager));
    Ok(manager)
}

/// 获取全局配置管理器（未安装时按默认源懒加载）/ Get the global manager, lazily built from defaults
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    {
        let guard = GLOBAL_CONFIG_MANAGER
            .read()
            .map_err(|e| anyhow!("config manager lock poisoned: {}", e))?;
        if let Some(manager) = guard.as_ref() {
            return Ok(Arc::clone(manager));
        }
    }
    let mut guard = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("config manager lock poisoned: {}", e))?;
    if let Some(manager) = guard.as_ref() {
        return Ok(Arc::clone(manager));
    }
    let manager = Arc::new(ConfigManager::new()?);
    *guard = Some(Arc::clone(&manager));
    Ok(manager)
}
