//! 配置管理器 - 负责环境变量对配置文件的覆盖
//!
//! 容器化部署时通常只改少数几个值（节点标识、监听地址、中间件地址），
//! 这些值可以直接通过环境变量覆盖，而不用重新生成配置文件。

use std::env;

use super::GatewayConfig;

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    pub const NODE_ID_ENV: &'static str = "IM_GATEWAY_NODE_ID";
    pub const BIND_ADDR_ENV: &'static str = "IM_GATEWAY_BIND_ADDR";
    pub const REDIS_URL_ENV: &'static str = "IM_GATEWAY_REDIS_URL";
    pub const POSTGRES_URL_ENV: &'static str = "IM_GATEWAY_POSTGRES_URL";
    pub const KAFKA_BOOTSTRAP_ENV: &'static str = "IM_GATEWAY_KAFKA_BOOTSTRAP";

    /// 获取当前环境名称，未设置时为 "development"
    pub fn get_environment() -> String {
        env::var("IM_GATEWAY_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(config: &mut GatewayConfig) {
        Self::apply_overrides(config, |key| env::var(key).ok());
    }

    /// 按给定的查找函数覆盖配置值（空字符串视为未设置）
    pub fn apply_overrides<F>(config: &mut GatewayConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(node_id) = lookup(Self::NODE_ID_ENV) {
            config.server.node_id = node_id;
        }
        if let Some(bind_addr) = lookup(Self::BIND_ADDR_ENV) {
            config.server.bind_addr = bind_addr;
        }
        if let Some(redis_url) = lookup(Self::REDIS_URL_ENV) {
            config.storage.redis_url = Some(redis_url);
        }
        if let Some(postgres_url) = lookup(Self::POSTGRES_URL_ENV) {
            config.storage.postgres_url = Some(postgres_url);
        }
        if let Some(bootstrap) = lookup(Self::KAFKA_BOOTSTRAP_ENV) {
            config.broker.bootstrap_servers = bootstrap;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn overrides_replace_configured_values() {
        let mut config = GatewayConfig::default();
        let vars: HashMap<&str, &str> = HashMap::from([
            (ConfigManager::NODE_ID_ENV, "node-7"),
            (ConfigManager::REDIS_URL_ENV, "redis://cache:6379"),
            (ConfigManager::BIND_ADDR_ENV, ""),
        ]);

        ConfigManager::apply_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.node_id, "node-7");
        assert_eq!(config.storage.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.server.bind_addr, "0.0.0.0:9999");
    }
}
