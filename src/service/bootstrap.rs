//! 应用启动器 - 负责依赖注入、后台任务和优雅停机
//!
//! 装配顺序：配置 -> 适配器（MQ / 存储 / 认证 / 群目录）-> 应用服务 -> 连接处理器。
//! 停机时同一个 `CancellationToken` 依次停止监听、连接循环、MQ 消费和重试扫描。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::application::{
    DeliveryConsumer, DeliveryPipeline, DeliveryRouter, DeliveryTopics, DeliveryTracker,
    MessageDispatcher, OfflineReplayService, OnlineQueryService, RetryTracker, Sequencer,
};
use crate::config::{AuthMode, BrokerBackend, GatewayConfig, StorageBackend};
use crate::domain::model::RetryPolicy;
use crate::domain::repository::{
    GroupDirectory, IdentityValidator, MessageBroker, MessageRepository, OfflineStore,
    PresenceStore, RecordHandler, SequenceGenerator, TimelineIndex,
};
use crate::infrastructure::persistence::{
    InMemoryMessageRepository, InMemoryOfflineStore, InMemoryPresenceStore,
    InMemorySequenceGenerator, InMemoryTimelineIndex, PostgresMessageRepository,
    RedisKeys, RedisOfflineStore, RedisPresenceStore, RedisSequenceGenerator,
    RedisTimelineIndex,
};
use crate::infrastructure::{
    HttpGroupDirectory, InMemoryBroker, JwtIdentityValidator, KafkaMessageBroker,
    KafkaRecordConsumer, SessionRegistry, StaticGroupDirectory, TrustedIdentityValidator,
};
use crate::interface::{ConnectionHandler, GatewayServer};
use crate::metrics::GatewayMetrics;
use crate::utils::BackgroundExecutor;

/// 默认群目录请求超时
const DEFAULT_GROUP_TIMEOUT_MS: u64 = 3000;

/// MQ 适配器
#[derive(Clone)]
pub enum BrokerAdapter {
    /// 进程内队列，由本进程消费
    Memory(Arc<InMemoryBroker>),
    Kafka(Arc<KafkaMessageBroker>),
    /// 只有生产端（测试注入），不启动消费者
    Producer(Arc<dyn MessageBroker>),
}

impl BrokerAdapter {
    pub fn producer(&self) -> Arc<dyn MessageBroker> {
        match self {
            Self::Memory(broker) => broker.clone(),
            Self::Kafka(broker) => broker.clone(),
            Self::Producer(broker) => broker.clone(),
        }
    }
}

/// 外部协作方的具体实现
#[derive(Clone)]
pub struct Adapters {
    pub broker: BrokerAdapter,
    pub presence: Arc<dyn PresenceStore>,
    pub offline: Arc<dyn OfflineStore>,
    pub sequences: Arc<dyn SequenceGenerator>,
    pub timeline: Arc<dyn TimelineIndex>,
    pub repository: Arc<dyn MessageRepository>,
    pub validator: Arc<dyn IdentityValidator>,
    pub groups: Arc<dyn GroupDirectory>,
}

impl Adapters {
    /// 全部使用内存实现（单节点 / 测试）
    pub fn in_memory(config: &GatewayConfig) -> Result<Self> {
        let repository: Arc<dyn MessageRepository> = Arc::new(InMemoryMessageRepository::new());
        Ok(Self {
            broker: BrokerAdapter::Memory(Arc::new(InMemoryBroker::with_redelivery_backoff(
                Duration::from_millis(config.broker.redelivery_backoff_ms),
                Duration::from_millis(config.broker.redelivery_max_backoff_ms),
            ))),
            presence: Arc::new(InMemoryPresenceStore::new(config.session.presence_ttl_secs)),
            offline: Arc::new(InMemoryOfflineStore::new(
                config.delivery.offline_retention_days,
            )),
            sequences: Arc::new(InMemorySequenceGenerator::with_repository(repository.clone())),
            timeline: Arc::new(InMemoryTimelineIndex::new(config.delivery.timeline_window)),
            repository,
            validator: build_validator(config)?,
            groups: build_group_directory(config)?,
        })
    }

    /// 按配置构建
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut adapters = Self::in_memory(config)?;

        if let Some(url) = &config.storage.postgres_url {
            let repository = PostgresMessageRepository::connect(
                url,
                config.storage.postgres_max_connections,
            )
            .await
            .context("failed to connect to postgres")?;
            repository
                .ensure_schema()
                .await
                .context("failed to prepare message schema")?;
            adapters.repository = Arc::new(repository);
            info!("✅ Postgres message repository initialized");
        }

        match config.storage.backend {
            StorageBackend::Memory => {
                adapters.sequences = Arc::new(InMemorySequenceGenerator::with_repository(
                    adapters.repository.clone(),
                ));
            }
            StorageBackend::Redis => {
                let url = config
                    .storage
                    .redis_url
                    .as_deref()
                    .context("storage.redis_url is required for the redis backend")?;
                let client = Arc::new(redis::Client::open(url).context("invalid redis url")?);
                let keys = RedisKeys::new(config.storage.key_prefix.clone());
                adapters.presence = Arc::new(RedisPresenceStore::new(
                    client.clone(),
                    keys.clone(),
                    config.session.presence_ttl_secs,
                ));
                adapters.offline = Arc::new(RedisOfflineStore::new(
                    client.clone(),
                    keys.clone(),
                    config.delivery.offline_retention_days,
                ));
                adapters.sequences = Arc::new(RedisSequenceGenerator::new(
                    client.clone(),
                    keys.clone(),
                    adapters.repository.clone(),
                ));
                adapters.timeline = Arc::new(RedisTimelineIndex::new(
                    client,
                    keys,
                    config.delivery.timeline_window,
                ));
                info!("✅ Redis storage initialized");
            }
        }

        if config.broker.backend == BrokerBackend::Kafka {
            let producer = KafkaMessageBroker::new(&config.broker)
                .context("failed to create kafka producer")?;
            adapters.broker = BrokerAdapter::Kafka(Arc::new(producer));
            info!(servers = %config.broker.bootstrap_servers, "✅ Kafka producer initialized");
        }

        Ok(adapters)
    }
}

fn build_validator(config: &GatewayConfig) -> Result<Arc<dyn IdentityValidator>> {
    match (config.auth.mode, config.auth.jwt_secret.as_deref()) {
        (AuthMode::Jwt, Some(secret)) if !secret.is_empty() => {
            Ok(Arc::new(JwtIdentityValidator::new(
                secret.as_bytes(),
                config.auth.jwt_issuer.as_deref(),
            )))
        }
        (AuthMode::Jwt, _) => bail!("auth.jwt_secret is required when auth.mode is jwt"),
        (AuthMode::Trusted, _) => {
            warn!("trusted auth mode: login tokens are not verified");
            Ok(Arc::new(TrustedIdentityValidator))
        }
    }
}

fn build_group_directory(config: &GatewayConfig) -> Result<Arc<dyn GroupDirectory>> {
    match &config.groups.endpoint {
        Some(endpoint) => {
            let timeout = config.groups.timeout_ms.unwrap_or(DEFAULT_GROUP_TIMEOUT_MS);
            let directory = HttpGroupDirectory::new(endpoint, Duration::from_millis(timeout))
                .context("failed to create group directory client")?;
            Ok(Arc::new(directory))
        }
        None => Ok(Arc::new(StaticGroupDirectory::new(
            config.static_group_members()?,
        ))),
    }
}

/// 装配完成的网关
pub struct Gateway {
    pub node_id: String,
    pub registry: Arc<SessionRegistry>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub consumer: Arc<DeliveryConsumer>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub connections: Arc<ConnectionHandler>,
    pub online: Arc<OnlineQueryService>,
    pub sequencer: Arc<Sequencer>,
    pub metrics: Arc<GatewayMetrics>,
    pub executor: BackgroundExecutor,
    pub shutdown: CancellationToken,
    adapters: Adapters,
    config: GatewayConfig,
    tasks: TaskTracker,
}

impl Gateway {
    pub fn assemble(
        config: &GatewayConfig,
        adapters: Adapters,
        shutdown: CancellationToken,
    ) -> Self {
        let node_id = config.server.node_id.clone();
        let metrics = Arc::new(GatewayMetrics::new());
        let executor =
            BackgroundExecutor::new(config.server.worker_concurrency, shutdown.child_token());
        let topics = DeliveryTopics::from_config(&config.broker);
        let broker = adapters.broker.producer();

        let registry = Arc::new(SessionRegistry::new(
            node_id.clone(),
            adapters.presence.clone(),
            executor.clone(),
        ));

        let tracker = Arc::new(DeliveryTracker::with_pending_ttl(chrono::Duration::days(
            i64::from(config.delivery.offline_retention_days),
        )));
        let retry = RetryTracker::new(RetryPolicy::new(
            config.delivery.max_attempts,
            config.delivery.retry_step_secs,
        ));
        let pipeline = Arc::new(DeliveryPipeline::new(
            broker.clone(),
            topics.clone(),
            retry,
            tracker.clone(),
            metrics.clone(),
        ));

        let sequencer = Arc::new(Sequencer::new(
            adapters.sequences.clone(),
            adapters.timeline.clone(),
            adapters.repository.clone(),
            config.delivery.timeline_window,
        ));
        let replay = Arc::new(OfflineReplayService::new(
            adapters.offline.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let router = Arc::new(DeliveryRouter::new(
            node_id.clone(),
            topics.route.clone(),
            registry.clone(),
            adapters.presence.clone(),
            broker,
            adapters.offline.clone(),
            replay.clone(),
            metrics.clone(),
        ));
        let consumer = Arc::new(DeliveryConsumer::new(
            adapters.repository.clone(),
            sequencer.clone(),
            router,
            adapters.groups.clone(),
            tracker,
            topics,
            metrics.clone(),
        ));

        let dispatcher = Arc::new(MessageDispatcher::new(
            registry.clone(),
            adapters.validator.clone(),
            pipeline.clone(),
            replay,
            executor.clone(),
            metrics.clone(),
            config.session.displaced_policy,
        ));
        let connections = Arc::new(ConnectionHandler::new(
            dispatcher.clone(),
            config.heartbeat.clone(),
            config.server.max_frame_length,
            config.server.outbound_buffer,
            metrics.clone(),
        ));
        let online = Arc::new(OnlineQueryService::new(
            registry.clone(),
            adapters.presence.clone(),
        ));

        Self {
            node_id,
            registry,
            pipeline,
            consumer,
            dispatcher,
            connections,
            online,
            sequencer,
            metrics,
            executor,
            shutdown,
            adapters,
            config: config.clone(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn adapters(&self) -> &Adapters {
        &self.adapters
    }

    /// 启动重试扫描与 MQ 消费
    pub fn start_background(&self) -> Result<()> {
        let interval = Duration::from_millis(self.config.delivery.retry_scan_interval_ms.max(1));
        self.tasks.spawn(
            self.pipeline
                .clone()
                .run_retry_loop(interval, self.shutdown.clone()),
        );

        let handler: Arc<dyn RecordHandler> = self.consumer.clone();
        match &self.adapters.broker {
            BrokerAdapter::Memory(broker) => {
                let broker = broker.clone();
                let shutdown = self.shutdown.clone();
                self.tasks
                    .spawn(async move { broker.run(handler, shutdown).await });
            }
            BrokerAdapter::Kafka(_) => {
                let broker = &self.config.broker;
                let shared = KafkaRecordConsumer::new(
                    broker,
                    &broker.group_id,
                    vec![
                        broker.private_topic.clone(),
                        broker.group_topic.clone(),
                        broker.read_receipt_topic.clone(),
                    ],
                )
                .context("failed to create kafka consumer")?;
                // 路由 topic 每个节点独立消费组，保证每条记录都能到达目标节点
                let route = KafkaRecordConsumer::new(
                    broker,
                    &format!("{}-{}", broker.group_id, self.node_id),
                    vec![broker.route_topic.clone()],
                )
                .context("failed to create kafka route consumer")?;

                for consumer in [shared, route] {
                    let handler = handler.clone();
                    let shutdown = self.shutdown.clone();
                    self.tasks
                        .spawn(async move { consumer.run(handler, shutdown).await });
                }
            }
            BrokerAdapter::Producer(_) => {
                info!("external producer configured, broker consumer not started");
            }
        }
        Ok(())
    }

    /// 停机：关闭连接、停止后台任务并等待结束
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.registry.close_all();
        self.tasks.close();
        self.tasks.wait().await;
        self.executor.shutdown();
        info!(node_id = %self.node_id, "gateway stopped");
    }
}

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点，直到 `shutdown` 被取消
    pub async fn run(config: &'static GatewayConfig, shutdown: CancellationToken) -> Result<()> {
        config.validate()?;

        let adapters = Adapters::from_config(config).await?;
        let gateway = Gateway::assemble(config, adapters, shutdown.clone());
        gateway.start_background()?;

        let server = GatewayServer::bind(&config.server.bind_addr, gateway.connections.clone())
            .await
            .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;

        info!("🚀 IM 网关已启动");
        info!("   Node ID: {}", gateway.node_id);
        info!("   Listen: {}", server.local_addr()?);
        info!(
            "   Broker: {:?}, Storage: {:?}, Auth: {:?}",
            config.broker.backend, config.storage.backend, config.auth.mode
        );

        let served = server.run(shutdown.clone()).await;
        gateway.stop().await;
        served?;
        Ok(())
    }
}
