//! 应用层：分发引擎、投递管线、MQ 消费、离线补发、序列号与在线查询

pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod handoff;
pub mod offline;
pub mod pipeline;
pub mod presence;
pub mod retry;
pub mod sequencer;

pub use consumer::DeliveryConsumer;
pub use delivery::{DeliveryOutcome, DeliveryRouter};
pub use dispatcher::{ConnectionContext, MessageDispatcher};
pub use handoff::{Handoff, HandoffQueue};
pub use offline::{OfflineReplayService, ReplayReport};
pub use pipeline::{DeliveryPipeline, DeliveryTracker};
pub use presence::OnlineQueryService;
pub use retry::RetryTracker;
pub use sequencer::Sequencer;

use crate::config::BrokerConfig;

/// 投递管线使用的 topic
#[derive(Debug, Clone)]
pub struct DeliveryTopics {
    pub private: String,
    pub group: String,
    pub route: String,
    pub read_receipt: String,
}

impl DeliveryTopics {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            private: config.private_topic.clone(),
            group: config.group_topic.clone(),
            route: config.route_topic.clone(),
            read_receipt: config.read_receipt_topic.clone(),
        }
    }
}

impl Default for DeliveryTopics {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}
