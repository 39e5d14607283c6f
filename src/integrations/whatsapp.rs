//! WhatsApp Cloud API 集成
//!
//! Webhook 收消息 → 解析参与者 → 轮次入内核队列，立即回 200；
//! 结果由后台任务经 Cloud API 推回。传输层重试靠消息 ID 去重挡住。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{InboundTurn, Kernel, TurnKind};
use crate::delivery::DeliverySink;

/// 去重集合上限，到顶整体清空重计
const SEEN_CAP: usize = 4096;

/// WhatsApp 服务状态
pub struct WhatsappState {
    pub kernel: Kernel,
    pub access_token: String,
    pub phone_number_id: String,
    seen: Mutex<HashSet<String>>,
}

impl WhatsappState {
    pub fn new(
        kernel: Kernel,
        access_token: impl Into<String>,
        phone_number_id: impl Into<String>,
    ) -> Self {
        Self {
            kernel,
            access_token: access_token.into(),
            phone_number_id: phone_number_id.into(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// 记录消息 ID。返回 false 表示重复投递，应丢弃。
    fn remember(&self, message_id: &str) -> bool {
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if seen.len() >= SEEN_CAP {
            seen.clear();
        }
        seen.insert(message_id.to_string())
    }
}

/// Webhook 验证参数
#[derive(Debug, Deserialize)]
pub struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// WhatsApp Webhook 请求体
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub object: Option<String>,
    pub entry: Option<Vec<WebhookEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    pub id: Option<String>,
    pub changes: Option<Vec<WebhookChange>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    pub value: Option<WebhookValue>,
    pub field: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookValue {
    pub messaging_product: Option<String>,
    pub metadata: Option<WebhookMetadata>,
    pub contacts: Option<Vec<WebhookContact>>,
    pub messages: Option<Vec<WebhookMessage>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookMetadata {
    pub display_phone_number: Option<String>,
    #[serde(rename = "phone_number_id")]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookContact {
    pub profile: Option<WebhookProfile>,
    pub wa_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookProfile {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookMessage {
    pub from: String,
    pub id: Option<String>,
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub text: Option<WebhookText>,
    pub image: Option<WebhookMedia>,
    pub audio: Option<WebhookMedia>,
    /// 群消息来源（Cloud API 群组扩展字段）
    pub context: Option<WebhookContext>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookText {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookMedia {
    pub id: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookContext {
    pub group_id: Option<String>,
}

/// WhatsApp 发送消息 API 请求体
#[derive(Debug, Serialize)]
struct SendMessageRequest {
    messaging_product: String,
    to: String,
    #[serde(rename = "type")]
    msg_type: String,
    text: SendMessageText,
}

#[derive(Debug, Serialize)]
struct SendMessageText {
    body: String,
}

/// 经 Cloud API 推送的出站投递，内核升级通知与裁决回灌共用
pub struct WhatsappSink {
    access_token: String,
    phone_number_id: String,
}

impl WhatsappSink {
    pub fn new(access_token: impl Into<String>, phone_number_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            phone_number_id: phone_number_id.into(),
        }
    }
}

#[async_trait::async_trait]
impl DeliverySink for WhatsappSink {
    async fn deliver(&self, to: &str, text: &str) -> Result<(), String> {
        send_whatsapp_message(&self.access_token, &self.phone_number_id, to, text)
            .await
            .map_err(|e| e.to_string())
    }
}

/// 创建 WhatsApp 路由
pub fn create_router(state: Arc<WhatsappState>) -> Router {
    Router::new()
        .route("/webhook", get(webhook_verify).post(webhook_receive))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// GET /webhook - Meta 验证 Webhook
async fn webhook_verify(
    State(_state): State<Arc<WhatsappState>>,
    Query(query): Query<WebhookVerifyQuery>,
) -> Result<String, StatusCode> {
    let verify_token =
        std::env::var("WHATSAPP_VERIFY_TOKEN").unwrap_or_else(|_| "aula".to_string());
    if query.mode.as_deref() == Some("subscribe")
        && query.verify_token.as_deref() == Some(&verify_token)
    {
        Ok(query.challenge.unwrap_or_default())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// POST /webhook - 接收 WhatsApp 消息。轮次入队后立即返回 200，
/// 重试窗口内不会因生成耗时而超时重投。
async fn webhook_receive(
    State(state): State<Arc<WhatsappState>>,
    Json(payload): Json<WebhookPayload>,
) -> StatusCode {
    if payload.object.as_deref() != Some("whatsapp_business_account") {
        return StatusCode::OK;
    }

    let Some(entries) = payload.entry else {
        return StatusCode::OK;
    };

    for entry in entries {
        let Some(changes) = entry.changes else { continue };
        for change in changes {
            let Some(value) = change.value else { continue };
            let Some(messages) = value.messages else { continue };

            for msg in messages {
                if let Some(id) = &msg.id {
                    if !state.remember(id) {
                        tracing::debug!(message_id = %id, "Duplicate webhook delivery dropped");
                        continue;
                    }
                }
                let Some(turn) = turn_from_message(&state, msg) else {
                    continue;
                };
                dispatch_turn(&state, turn);
            }
        }
    }

    StatusCode::OK
}

/// Webhook 消息转入站轮次。不支持的载荷返回 None。
fn turn_from_message(state: &WhatsappState, msg: WebhookMessage) -> Option<InboundTurn> {
    let profile = state.kernel.directory().resolve_or_guest(&msg.from);
    let group_id = msg.context.as_ref().and_then(|c| c.group_id.clone());

    let mut turn = match msg.msg_type.as_deref() {
        Some("text") => {
            let text = msg.text?;
            let body = strip_mention(text.body.trim());
            if body.is_empty() {
                return None;
            }
            InboundTurn::text(&msg.from, &profile.school_id, profile.role, body)
        }
        Some("image") => {
            let media = msg.image?;
            let caption = media.caption.unwrap_or_default();
            InboundTurn::text(&msg.from, &profile.school_id, profile.role, caption)
                .with_media(TurnKind::Image, media.id.unwrap_or_default())
        }
        Some("audio") => {
            let media = msg.audio?;
            InboundTurn::text(&msg.from, &profile.school_id, profile.role, "")
                .with_media(TurnKind::Audio, media.id.unwrap_or_default())
        }
        other => {
            tracing::debug!(msg_type = ?other, "Unsupported message type ignored");
            return None;
        }
    };
    if let Some(group_id) = group_id {
        turn = turn.with_group(group_id);
    }
    Some(turn)
}

/// 轮次入队，后台任务等结果并经 Cloud API 推回
fn dispatch_turn(state: &WhatsappState, turn: InboundTurn) {
    let to = turn.actor_key.clone();
    let rx = state.kernel.queue_turn(turn);
    let access_token = state.access_token.clone();
    let phone_number_id = state.phone_number_id.clone();

    tokio::spawn(async move {
        match rx.await {
            Ok(output) => {
                if let Err(e) =
                    send_whatsapp_message(&access_token, &phone_number_id, &to, &output.text).await
                {
                    tracing::error!(to = %to, "Failed to send WhatsApp message: {}", e);
                }
            }
            Err(_) => {
                tracing::error!(to = %to, "Turn dropped before completion, no reply sent");
            }
        }
    });
}

/// 去掉群聊里开头的 @机器人 提及
fn strip_mention(body: &str) -> String {
    static MENTION_RE: OnceLock<Regex> = OnceLock::new();
    let re = MENTION_RE.get_or_init(|| Regex::new(r"^@\S+\s*").unwrap());
    re.replace(body, "").trim().to_string()
}

/// 通过 WhatsApp Cloud API 发送消息
async fn send_whatsapp_message(
    access_token: &str,
    phone_number_id: &str,
    to: &str,
    body: &str,
) -> anyhow::Result<()> {
    let url = format!(
        "https://graph.facebook.com/v18.0/{}/messages",
        phone_number_id
    );

    for chunk in chunk_body(body) {
        let req = SendMessageRequest {
            messaging_product: "whatsapp".to_string(),
            to: to.replace('+', "").to_string(),
            msg_type: "text".to_string(),
            text: SendMessageText { body: chunk },
        };

        let client = reqwest::Client::new();
        let resp: reqwest::Response = client
            .post(&url)
            .bearer_auth(access_token)
            .json(&req)
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            anyhow::bail!("WhatsApp API error: {}", text);
        }
    }

    Ok(())
}

/// WhatsApp 消息长度上限 4096 字符，按字符分段留余量
fn chunk_body(body: &str) -> Vec<String> {
    let max_len = 4000usize;
    if body.chars().count() <= max_len {
        return vec![body.to_string()];
    }
    body.chars()
        .collect::<Vec<_>>()
        .chunks(max_len)
        .map(|c| c.iter().collect())
        .collect()
}
