//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HARMONY__*` 覆盖（双下划线表示嵌套，如 `HARMONY__SERVER__PORT=8080`）。
//! 另外兼容 `PORT` 环境变量。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub model: ModelSection,
    pub generation: GenerationSection,
}

/// [server] 段：监听地址与关闭等待时间
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 关闭时等待生成释放 sequence 的最长时间（秒）
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5174
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// [model] 段：模型文件位置、校验和、上下文与并发
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// 仅文件名，不允许包含路径分隔符
    #[serde(default = "default_file_name")]
    pub file_name: String,
    /// 期望的 SHA-256（十六进制）；设置后 /model/status 会校验文件
    pub sha256: Option<String>,
    #[serde(default = "default_max_context_size")]
    pub max_context_size: usize,
    /// Sequence 池大小（预热 + 并发请求）
    #[serde(default = "default_sequences")]
    pub sequences: usize,
    /// 卸载到 GPU 的层数（仅 llama 后端使用）
    #[serde(default)]
    pub gpu_layers: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            file_name: default_file_name(),
            sha256: None,
            max_context_size: default_max_context_size(),
            sequences: default_sequences(),
            gpu_layers: 0,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("model-cache")
}

fn default_file_name() -> String {
    "gpt-oss-20b-Q4_K_M.gguf".to_string()
}

fn default_max_context_size() -> usize {
    8192
}

fn default_sequences() -> usize {
    4
}

/// [generation] 段：采样默认值与 token 上限
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSection {
    /// 请求未给 maxTokens 时的基础上限
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_warmup_tokens")]
    pub warmup_tokens: u32,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            default_max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            warmup_tokens: default_warmup_tokens(),
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.3
}

fn default_top_p() -> f32 {
    0.9
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_warmup_tokens() -> u32 {
    2
}

/// 从 config 目录加载配置，环境变量 HARMONY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 HARMONY__*（双下划线表示嵌套键）
/// 4. 最后若设置了 PORT，则覆盖 server.port
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HARMONY")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
        cfg.server.port = port;
    }
    Ok(cfg)
}
