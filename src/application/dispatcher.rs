//! 分发引擎：按帧类型处理入站消息
//!
//! 运行在连接的读循环里，只做内存操作和非阻塞写入；MQ 发送与持久化交给后台执行器，
//! 慢速的下游不会阻塞心跳处理与帧解码。

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use super::handoff::{Handoff, HandoffQueue};
use super::offline::OfflineReplayService;
use crate::config::DisplacedPolicy;
use crate::domain::model::{
    AuthPayload, AuthResult, ChatMessage, ChatPayload, ConnectionHandle, ContentType, Frame,
    FrameStatus, MessageType, ReadReceiptPayload,
};
use crate::domain::repository::{IdentityValidator, Router};
use crate::infrastructure::{Inbound, SessionRegistry};
use crate::metrics::GatewayMetrics;
use crate::utils::{BackgroundExecutor, next_server_message_id, scoped_message_id};

/// 客户端消息 ID 归属记录的保留时间
const CLIENT_ID_CLAIM_TTL: Duration = Duration::from_secs(600);
/// 归属记录超过该数量时清理过期项
const CLIENT_ID_CLAIM_PRUNE_THRESHOLD: usize = 10_000;

/// 单个连接的分发状态
pub struct ConnectionContext {
    pub handle: ConnectionHandle,
    /// 认证成功后绑定的用户
    pub user_id: Option<i64>,
    handoffs: HandoffQueue,
}

impl ConnectionContext {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            user_id: None,
            handoffs: HandoffQueue::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

pub struct MessageDispatcher {
    registry: Arc<SessionRegistry>,
    validator: Arc<dyn IdentityValidator>,
    router: Arc<dyn Router>,
    replay: Arc<OfflineReplayService>,
    executor: BackgroundExecutor,
    metrics: Arc<GatewayMetrics>,
    displaced_policy: DisplacedPolicy,
    /// 客户端消息 ID -> (发送方, 最近使用时间)
    claims: DashMap<i64, (i64, Instant)>,
}

impl MessageDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        validator: Arc<dyn IdentityValidator>,
        router: Arc<dyn Router>,
        replay: Arc<OfflineReplayService>,
        executor: BackgroundExecutor,
        metrics: Arc<GatewayMetrics>,
        displaced_policy: DisplacedPolicy,
    ) -> Self {
        Self {
            registry,
            validator,
            router,
            replay,
            executor,
            metrics,
            displaced_policy,
            claims: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, ctx: &mut ConnectionContext, inbound: Inbound) {
        let frame = match inbound {
            Inbound::Frame(frame) => frame,
            Inbound::Unrecognized { code, message_id } => {
                warn!(
                    connection_id = ctx.handle.id(),
                    code, message_id, "unrecognized message type dropped"
                );
                self.drop_frame("unknown_type");
                return;
            }
        };

        self.metrics
            .frames_received_total
            .with_label_values(&[frame.message_type.as_str()])
            .inc();

        match frame.message_type {
            MessageType::AuthRequest => self.handle_auth(ctx, frame).await,
            MessageType::ChatMessage => self.handle_chat(ctx, frame),
            MessageType::GroupMessage => self.handle_group(ctx, frame),
            MessageType::ReadReceipt => self.handle_read_receipt(ctx, frame),
            MessageType::ChatAck => self.handle_chat_ack(ctx, frame),
            MessageType::HeartbeatRequest => self.handle_heartbeat(ctx, frame),
            MessageType::AuthResponse | MessageType::HeartbeatResponse => {
                warn!(
                    connection_id = ctx.handle.id(),
                    message_type = %frame.message_type,
                    "server-only message type received from client"
                );
                self.drop_frame("unexpected_type");
            }
        }
    }

    async fn handle_auth(&self, ctx: &mut ConnectionContext, frame: Frame) {
        let message_id = frame.message_id;
        let verified = match frame.decode_json::<AuthPayload>() {
            Ok(claim) => self.validator.validate_identity(&claim).await,
            Err(err) => Err(err),
        };

        let user_id = match verified {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(connection_id = ctx.handle.id(), error = %err, "authentication failed");
                self.reply(ctx, AuthResult::failure(err.to_string()).into_frame(message_id));
                return;
            }
        };

        if let Some(displaced) = self.registry.bind(user_id, ctx.handle.clone()) {
            match self.displaced_policy {
                DisplacedPolicy::Close => {
                    info!(
                        user_id,
                        connection_id = displaced.id(),
                        "closing displaced connection"
                    );
                    displaced.close();
                }
                DisplacedPolicy::KeepOpen => {
                    debug!(
                        user_id,
                        connection_id = displaced.id(),
                        "displaced connection kept open"
                    );
                }
            }
        }
        ctx.user_id = Some(user_id);
        info!(user_id, connection_id = ctx.handle.id(), "connection authenticated");

        self.reply(ctx, AuthResult::success().into_frame(message_id));

        let replay = Arc::clone(&self.replay);
        self.executor.spawn("offline_replay", async move {
            if let Err(err) = replay.replay(user_id).await {
                warn!(user_id, error = %err, "offline replay failed");
            }
        });
    }

    fn handle_chat(&self, ctx: &ConnectionContext, frame: Frame) {
        let Some(sender_id) = self.authorized_sender(ctx, &frame) else {
            return;
        };
        let Some(payload) = self.decode_chat_payload(ctx, &frame) else {
            return;
        };

        let message_id = self.assign_message_id(&frame, sender_id);
        let message = ChatMessage::private(message_id, sender_id, payload);
        self.ack(ctx, frame.message_id, message_id);

        // 本地直推只是优化，持久化管线仍会再投递一次
        if let Ok(push) = message.to_push_frame() {
            if self.registry.send_to_user(message.receiver_id, push) {
                self.router.mark_pushed(message.message_id);
            }
        }

        self.hand_off(ctx, Handoff::Private(message));
    }

    fn handle_group(&self, ctx: &ConnectionContext, frame: Frame) {
        let Some(sender_id) = self.authorized_sender(ctx, &frame) else {
            return;
        };
        let Some(payload) = self.decode_chat_payload(ctx, &frame) else {
            return;
        };

        let message_id = self.assign_message_id(&frame, sender_id);
        let message = ChatMessage::group(message_id, sender_id, payload);
        self.ack(ctx, frame.message_id, message_id);

        self.hand_off(ctx, Handoff::Group(message));
    }

    fn handle_read_receipt(&self, ctx: &ConnectionContext, frame: Frame) {
        let Some(reader_id) = self.authorized_sender(ctx, &frame) else {
            return;
        };
        let Some(payload) = self.decode_payload::<ReadReceiptPayload>(ctx, &frame) else {
            return;
        };
        if payload.message_ids.is_empty() {
            return;
        }

        self.hand_off(
            ctx,
            Handoff::ReadReceipt {
                reader_id,
                message_ids: payload.message_ids,
                conversation_id: payload.conversation_id,
            },
        );
    }

    /// 按连接内的到达顺序交给投递管线
    fn hand_off(&self, ctx: &ConnectionContext, handoff: Handoff) {
        if ctx.handoffs.enqueue(handoff) {
            let queue = ctx.handoffs.clone();
            let router = Arc::clone(&self.router);
            self.executor
                .spawn("route_handoff", async move { queue.drain(router).await });
        }
    }

    fn handle_chat_ack(&self, ctx: &ConnectionContext, frame: Frame) {
        if self.authorized_sender(ctx, &frame).is_none() {
            return;
        }
        self.router.confirm_delivery(frame.message_id);
    }

    fn handle_heartbeat(&self, ctx: &ConnectionContext, frame: Frame) {
        self.reply(ctx, Ok(Frame::heartbeat_response(frame.message_id)));
        if ctx.is_authenticated() {
            self.registry.update_last_heartbeat(ctx.handle.id());
        }
    }

    /// 已认证且仍是权威会话时返回发送方 ID
    fn authorized_sender(&self, ctx: &ConnectionContext, frame: &Frame) -> Option<i64> {
        let Some(user_id) = ctx.user_id else {
            warn!(
                connection_id = ctx.handle.id(),
                message_type = %frame.message_type,
                message_id = frame.message_id,
                "frame from unauthenticated connection dropped"
            );
            self.drop_frame("unauthenticated");
            return None;
        };
        if !self.registry.is_current(user_id, ctx.handle.id()) {
            warn!(
                user_id,
                connection_id = ctx.handle.id(),
                message_type = %frame.message_type,
                "frame from displaced connection dropped"
            );
            self.drop_frame("displaced");
            return None;
        }
        Some(user_id)
    }

    fn decode_payload<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &ConnectionContext,
        frame: &Frame,
    ) -> Option<T> {
        match frame.decode_json() {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(
                    connection_id = ctx.handle.id(),
                    message_type = %frame.message_type,
                    message_id = frame.message_id,
                    error = %err,
                    "malformed payload dropped"
                );
                self.drop_frame("malformed");
                None
            }
        }
    }

    fn decode_chat_payload(&self, ctx: &ConnectionContext, frame: &Frame) -> Option<ChatPayload> {
        let payload = self.decode_payload::<ChatPayload>(ctx, frame)?;
        if ContentType::from_code(payload.content_type).is_none() {
            warn!(
                connection_id = ctx.handle.id(),
                message_id = frame.message_id,
                content_type = payload.content_type,
                "unknown content type dropped"
            );
            self.drop_frame("malformed");
            return None;
        }
        Some(payload)
    }

    /// 客户端未提供消息 ID 时由服务端生成；客户端 ID 已被其他发送方占用时按发送方派生
    fn assign_message_id(&self, frame: &Frame, sender_id: i64) -> i64 {
        let client_id = frame.message_id;
        if client_id <= 0 {
            return next_server_message_id();
        }

        let now = Instant::now();
        let assigned = match self.claims.entry(client_id) {
            Entry::Vacant(slot) => {
                slot.insert((sender_id, now));
                client_id
            }
            Entry::Occupied(mut entry) => {
                let (owner, claimed_at) = *entry.get();
                if owner == sender_id || now.duration_since(claimed_at) > CLIENT_ID_CLAIM_TTL {
                    entry.insert((sender_id, now));
                    client_id
                } else {
                    let scoped = scoped_message_id(sender_id, client_id);
                    debug!(
                        sender_id,
                        client_id,
                        owner,
                        message_id = scoped,
                        "client message id taken by another sender"
                    );
                    scoped
                }
            }
        };

        if self.claims.len() > CLIENT_ID_CLAIM_PRUNE_THRESHOLD {
            self.claims.retain(|_, (_, claimed_at)| {
                now.duration_since(*claimed_at) <= CLIENT_ID_CLAIM_TTL
            });
        }
        assigned
    }

    /// 确认帧沿用客户端的 ID；服务端改写过 ID 时在载荷中返回实际 ID
    fn ack(&self, ctx: &ConnectionContext, client_id: i64, message_id: i64) {
        if client_id > 0 && client_id != message_id {
            let body = serde_json::json!({ "messageId": message_id });
            self.reply(
                ctx,
                Frame::json(MessageType::ChatAck, client_id, FrameStatus::Delivered, &body),
            );
        } else {
            self.reply(ctx, Ok(Frame::chat_ack(message_id)));
        }
    }

    fn reply(&self, ctx: &ConnectionContext, frame: crate::error::Result<Frame>) {
        match frame {
            Ok(frame) => {
                if !ctx.handle.try_send(frame) {
                    debug!(connection_id = ctx.handle.id(), "reply not queued");
                }
            }
            Err(err) => {
                warn!(connection_id = ctx.handle.id(), error = %err, "reply not encodable")
            }
        }
    }

    fn drop_frame(&self, reason: &str) {
        self.metrics
            .frames_dropped_total
            .with_label_values(&[reason])
            .inc();
    }
}
