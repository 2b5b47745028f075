//! 群成员目录

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::repository::GroupDirectory;
use crate::error::{ImError, Result};

/// 配置文件中的静态群成员表
#[derive(Debug, Default, Clone)]
pub struct StaticGroupDirectory {
    groups: HashMap<i64, Vec<i64>>,
}

impl StaticGroupDirectory {
    pub fn new(groups: HashMap<i64, Vec<i64>>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl GroupDirectory for StaticGroupDirectory {
    async fn get_group_member_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        Ok(self.groups.get(&group_id).cloned().unwrap_or_default())
    }
}

/// 通过 IM 业务服务查询：`GET {endpoint}/groups/{id}/members`，返回 `[userId]`
pub struct HttpGroupDirectory {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGroupDirectory {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ImError::Upstream(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn members_url(&self, group_id: i64) -> String {
        format!("{}/groups/{}/members", self.endpoint, group_id)
    }
}

#[async_trait]
impl GroupDirectory for HttpGroupDirectory {
    async fn get_group_member_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        let url = self.members_url(group_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| ImError::Upstream(format!("group member lookup failed: {err}")))?;

        let members: Vec<i64> = response
            .json()
            .await
            .map_err(|err| ImError::Upstream(format!("invalid group member response: {err}")))?;

        debug!(group_id, members = members.len(), "group members fetched");
        Ok(members)
    }
}
