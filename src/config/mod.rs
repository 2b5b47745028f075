//! IM 网关配置模块
//!
//! 该模块提供网关进程的全部配置：
//! - 配置文件加载和解析（TOML）
//! - 环境变量覆盖（见 [`ConfigManager`]）
//! - 各子系统配置定义：连接、心跳、会话、投递、消息队列、存储、认证

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

/// 全局配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<GatewayConfig> = OnceLock::new();

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/im-gateway.toml";

/// 配置文件路径环境变量
pub const CONFIG_PATH_ENV: &str = "IM_GATEWAY_CONFIG";

/// 网关完整配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub groups: GroupsConfig,
    pub logging: LoggingConfig,
}

/// 长连接服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub bind_addr: String,
    /// 当前节点标识（写入在线状态，用于跨节点路由）
    pub node_id: String,
    /// 最大帧长度（字节）
    pub max_frame_length: usize,
    /// 每个连接的发送缓冲区（帧数），写满时快速失败
    pub outbound_buffer: usize,
    /// 后台任务并发上限
    pub worker_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9999".to_string(),
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            max_frame_length: 10 * 1024 * 1024,
            outbound_buffer: 1024,
            worker_concurrency: 256,
        }
    }
}

/// 心跳配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// 读空闲超时（秒）
    pub reader_idle_secs: u64,
    /// 写空闲超时（秒），仅记录日志
    pub writer_idle_secs: u64,
    /// 读写空闲超时（秒），仅记录日志
    pub all_idle_secs: u64,
    /// 连续读空闲次数上限，达到后关闭连接
    pub max_idle_strikes: u32,
    /// 任意帧都重置空闲计数（默认只有心跳重置）
    pub reset_on_any_frame: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            reader_idle_secs: 60,
            writer_idle_secs: 30,
            all_idle_secs: 90,
            max_idle_strikes: 3,
            reset_on_any_frame: false,
        }
    }
}

/// 同一用户重复登录时，被顶替连接的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisplacedPolicy {
    /// 关闭旧连接
    #[default]
    Close,
    /// 保留旧连接（旧连接不再是权威会话，发送消息会被拒绝）
    KeepOpen,
}

/// 会话配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub displaced_policy: DisplacedPolicy,
    /// 在线状态过期时间（秒），心跳时刷新
    pub presence_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            displaced_policy: DisplacedPolicy::Close,
            presence_ttl_secs: 300,
        }
    }
}

/// 投递管线配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 投递 MQ 的最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 重试间隔步长（秒），第 n 次失败后等待 n * step
    pub retry_step_secs: u64,
    /// 重试扫描间隔（毫秒）
    pub retry_scan_interval_ms: u64,
    /// 离线消息保留天数
    pub offline_retention_days: u32,
    /// 每个会话缓存的最近消息条数
    pub timeline_window: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_step_secs: 300,
            retry_scan_interval_ms: 1000,
            offline_retention_days: 7,
            timeline_window: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// 进程内队列（单节点 / 测试）
    #[default]
    Memory,
    Kafka,
}

/// 消息队列配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Kafka 服务器地址列表
    pub bootstrap_servers: String,
    /// 消费组前缀；路由 topic 使用 `<group_id>-<node_id>` 以便每个节点都能收到
    pub group_id: String,
    /// 发送超时（毫秒）
    pub publish_timeout_ms: u64,
    /// 消费处理失败后重新投递的基础等待（毫秒），按失败次数线性增长
    pub redelivery_backoff_ms: u64,
    /// 重新投递等待上限（毫秒）
    pub redelivery_max_backoff_ms: u64,
    pub private_topic: String,
    pub group_topic: String,
    pub route_topic: String,
    pub read_receipt_topic: String,
    /// 其他 Kafka 选项
    pub options: HashMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            bootstrap_servers: String::new(),
            group_id: "im-gateway".to_string(),
            publish_timeout_ms: 5000,
            redelivery_backoff_ms: 500,
            redelivery_max_backoff_ms: 30_000,
            private_topic: "im-chat-message".to_string(),
            group_topic: "im-group-message".to_string(),
            route_topic: "im-message-route".to_string(),
            read_receipt_topic: "im-read-receipt".to_string(),
            options: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

/// 存储配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 在线状态、离线队列、序列号、时间线使用的后端
    pub backend: StorageBackend,
    pub redis_url: Option<String>,
    /// 配置后使用 Postgres 持久化消息记录，否则使用内存仓储
    pub postgres_url: Option<String>,
    pub postgres_max_connections: u32,
    /// Redis key 前缀
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            redis_url: None,
            postgres_url: None,
            postgres_max_connections: 10,
            key_prefix: "im".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// 信任上游已校验的 userId
    #[default]
    Trusted,
    Jwt,
}

/// 认证配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
}

/// 群成员目录配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GroupsConfig {
    /// 外部 IM 业务服务地址，配置后通过 HTTP 查询群成员
    pub endpoint: Option<String>,
    /// 请求超时（毫秒）
    pub timeout_ms: Option<u64>,
    /// 静态群成员表（group_id -> member ids），未配置 endpoint 时使用
    #[serde(rename = "static")]
    pub static_members: HashMap<String, Vec<i64>>,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` 或 `json`
    pub format: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

impl GatewayConfig {
    /// 校验配置的一致性
    pub fn validate(&self) -> Result<()> {
        if self.delivery.max_attempts == 0 {
            bail!("delivery.max_attempts must be greater than zero");
        }
        if self.heartbeat.max_idle_strikes == 0 {
            bail!("heartbeat.max_idle_strikes must be greater than zero");
        }
        if self.heartbeat.reader_idle_secs == 0 {
            bail!("heartbeat.reader_idle_secs must be greater than zero");
        }
        if self.server.outbound_buffer == 0 || self.server.worker_concurrency == 0 {
            bail!("server.outbound_buffer and server.worker_concurrency must be positive");
        }

        let topics = [
            ("private_topic", &self.broker.private_topic),
            ("group_topic", &self.broker.group_topic),
            ("route_topic", &self.broker.route_topic),
            ("read_receipt_topic", &self.broker.read_receipt_topic),
        ];
        for (name, topic) in topics {
            if topic.trim().is_empty() {
                bail!("broker.{name} must not be empty");
            }
        }

        if self.broker.backend == BrokerBackend::Kafka
            && self.broker.bootstrap_servers.trim().is_empty()
        {
            bail!("broker.bootstrap_servers is required for the kafka backend");
        }
        if self.storage.backend == StorageBackend::Redis && self.storage.redis_url.is_none() {
            bail!("storage.redis_url is required for the redis backend");
        }
        if self.auth.mode == AuthMode::Jwt
            && self.auth.jwt_secret.as_deref().is_none_or(str::is_empty)
        {
            bail!("auth.jwt_secret is required when auth.mode = \"jwt\"");
        }

        Ok(())
    }

    /// 静态群成员表（键转为 i64）
    pub fn static_group_members(&self) -> Result<HashMap<i64, Vec<i64>>> {
        self.groups
            .static_members
            .iter()
            .map(|(group_id, members)| {
                let id = group_id
                    .parse::<i64>()
                    .with_context(|| format!("invalid group id in groups.static: {group_id}"))?;
                Ok((id, members.clone()))
            })
            .collect()
    }
}

/// 解析 TOML 配置内容
pub fn parse_config(content: &str) -> Result<GatewayConfig> {
    toml::from_str(content).context("invalid gateway configuration")
}

/// 加载配置
///
/// 路径优先级：参数 > 环境变量 `IM_GATEWAY_CONFIG` > `config/im-gateway.toml`。
/// 文件不存在时使用默认配置。
pub fn load_config(path: Option<&str>) -> &'static GatewayConfig {
    APP_CONFIG.get_or_init(|| {
        let path = path
            .map(PathBuf::from)
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut cfg = match load_config_from_file(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err:#}", path.display());
                GatewayConfig::default()
            }
        };
        ConfigManager::apply_env_overrides(&mut cfg);
        cfg
    })
}

/// 获取已加载的配置
pub fn app_config() -> Option<&'static GatewayConfig> {
    APP_CONFIG.get()
}

fn load_config_from_file(path: &Path) -> Result<GatewayConfig> {
    if !path.exists() {
        return Err(anyhow!("configuration file {} does not exist", path.display()));
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    parse_config(&content)
}
