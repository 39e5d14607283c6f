//! 轮次管线：内核主体
//!
//! 负责：把入站轮次排入参与者队列，依次完成会话解析、上下文装配、生成、
//! 回复解析、授权与动作执行、升级处理、历史落库与后台压缩触发。
//! 每个提交的轮次必定产出一个 TurnOutput；内部错误走各自的降级路径，
//! 绝不静默丢弃轮次。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::actions::ActionDispatcher;
use crate::authz::PolicyTable;
use crate::config::AppConfig;
use crate::contract::AgentReply;
use crate::core::error::KernelError;
use crate::core::persona::{self, PersonaRegistry};
use crate::core::serializer::TurnSerializer;
use crate::core::turn::{ActionStatus, ActorRole, InboundTurn, TurnKind, TurnOutput};
use crate::delivery::{DeliverySink, NoopSink};
use crate::escalation::{Escalation, EscalationCoordinator};
use crate::llm::{
    parse_reply, ChatMessage, EmbeddingProvider, GenerateClient, OpenAiClient, ScriptedClient,
};
use crate::memory::{ContextAssembler, HistoryEntry, Summarizer};
use crate::session::directory::{ActorDirectory, StaticDirectory};
use crate::session::{Session, SessionManager};
use crate::store::KernelStore;

/// 内核共享状态。轮次任务经 Arc 持有，生命周期与内核一致。
struct KernelInner {
    serializer: TurnSerializer<TurnOutput>,
    store: Arc<dyn KernelStore>,
    client: Arc<dyn GenerateClient>,
    assembler: ContextAssembler,
    summarizer: Arc<Summarizer>,
    sessions: Arc<SessionManager>,
    directory: Arc<dyn ActorDirectory>,
    policy: PolicyTable,
    personas: PersonaRegistry,
    dispatcher: ActionDispatcher,
    coordinator: EscalationCoordinator,
    sink: Arc<dyn DeliverySink>,
    generate_timeout: Duration,
    ack_text: String,
    fallback_text: String,
    deny_text: String,
}

/// 编排内核。克隆开销为一次 Arc 计数。
///
/// 同一参与者的轮次严格按提交顺序处理，不同参与者并行。
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn builder(store: Arc<dyn KernelStore>, client: Arc<dyn GenerateClient>) -> KernelBuilder {
        KernelBuilder::new(store, client)
    }

    /// 提交轮次并等待结果。队列异常时返回兜底结果而非错误，
    /// 接入层无需区分处理。
    pub async fn submit_turn(&self, turn: InboundTurn) -> TurnOutput {
        let actor_key = turn.actor_key.clone();
        let agent = persona::default_agent(turn.role).to_string();
        match self
            .inner
            .serializer
            .submit(&actor_key, process_turn(self.inner.clone(), turn))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(actor_key = %actor_key, error = %e, "Turn lane closed, answering with fallback");
                let mut output =
                    TurnOutput::new(actor_key, agent, self.inner.fallback_text.clone());
                output.fallback = true;
                output
            }
        }
    }

    /// 入队后立即返回接收端，接入层先回传输层 ACK 再等结果
    pub fn queue_turn(&self, turn: InboundTurn) -> oneshot::Receiver<TurnOutput> {
        let actor_key = turn.actor_key.clone();
        self.inner
            .serializer
            .queue(&actor_key, process_turn(self.inner.clone(), turn))
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.inner.sessions.clone()
    }

    pub fn directory(&self) -> Arc<dyn ActorDirectory> {
        self.inner.directory.clone()
    }

    /// 当前有轮次排队或处理中的参与者数
    pub fn active_lanes(&self) -> usize {
        self.inner.serializer.active_lanes()
    }
}

/// 内核装配器：必选存储与生成客户端，其余组件按配置推导，可逐项覆盖
pub struct KernelBuilder {
    store: Arc<dyn KernelStore>,
    client: Arc<dyn GenerateClient>,
    config: AppConfig,
    sink: Arc<dyn DeliverySink>,
    directory: Option<Arc<dyn ActorDirectory>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    dispatcher: Option<ActionDispatcher>,
    policy: Option<PolicyTable>,
    personas: Option<PersonaRegistry>,
}

impl KernelBuilder {
    pub fn new(store: Arc<dyn KernelStore>, client: Arc<dyn GenerateClient>) -> Self {
        Self {
            store,
            client,
            config: AppConfig::default(),
            sink: Arc::new(NoopSink),
            directory: None,
            embedder: None,
            dispatcher: None,
            policy: None,
            personas: None,
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn ActorDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: ActionDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_policy(mut self, policy: PolicyTable) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_personas(mut self, personas: PersonaRegistry) -> Self {
        self.personas = Some(personas);
        self
    }

    pub fn build(self) -> Kernel {
        let cfg = self.config;

        let policy = self.policy.unwrap_or_else(|| match &cfg.authz.policy_path {
            Some(path) => PolicyTable::from_file(path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Policy file load failed, using builtin table");
                PolicyTable::builtin()
            }),
            None => PolicyTable::builtin(),
        });

        let personas = self.personas.unwrap_or_else(|| match &cfg.app.prompts_dir {
            Some(dir) => PersonaRegistry::load(dir),
            None => PersonaRegistry::builtin(),
        });

        let directory = self.directory.unwrap_or_else(|| match &cfg.directory.path {
            Some(path) => match StaticDirectory::from_file(path) {
                Ok(dir) => Arc::new(dir) as Arc<dyn ActorDirectory>,
                Err(e) => {
                    tracing::warn!(error = %e, "Directory load failed, all actors resolve as group members");
                    Arc::new(StaticDirectory::empty(cfg.app.school_id.clone()))
                }
            },
            None => Arc::new(StaticDirectory::empty(cfg.app.school_id.clone())),
        });

        let mut assembler = ContextAssembler::new(self.store.clone())
            .with_raw_window(cfg.memory.raw_window)
            .with_background_budget(cfg.memory.background_budget)
            .with_snapshot_limit(cfg.memory.snapshot_limit);
        let mut summarizer = Summarizer::new(self.store.clone(), self.client.clone())
            .with_raw_window(cfg.memory.raw_window)
            .with_min_block(cfg.memory.snapshot_min_block);
        if let Some(embedder) = self.embedder {
            assembler = assembler.with_embedder(embedder.clone());
            summarizer = summarizer.with_embedder(embedder);
        }

        let sessions = Arc::new(
            SessionManager::new(cfg.session.ttl_secs).with_store(self.store.clone()),
        );
        let coordinator = EscalationCoordinator::new(
            self.store.clone(),
            self.sink.clone(),
            cfg.escalation.authorities.clone(),
        );
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| ActionDispatcher::new(cfg.actions.timeout_secs));

        Kernel {
            inner: Arc::new(KernelInner {
                serializer: TurnSerializer::new(),
                store: self.store,
                client: self.client,
                assembler,
                summarizer: Arc::new(summarizer),
                sessions,
                directory,
                policy,
                personas,
                dispatcher,
                coordinator,
                sink: self.sink,
                generate_timeout: Duration::from_secs(cfg.llm.timeout_secs),
                ack_text: cfg.escalation.ack_text,
                fallback_text: cfg.escalation.fallback_text,
                deny_text: cfg.escalation.deny_text,
            }),
        }
    }
}

/// 按配置与环境变量选择生成后端。无可用 Key 时退回空脚本客户端，
/// 所有轮次以兜底文案回复。
pub fn create_client_from_config(cfg: &AppConfig) -> Arc<dyn GenerateClient> {
    let api_key = cfg
        .llm
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    match api_key.as_deref() {
        Some(key) if !key.is_empty() => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible generate backend");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(key),
            ))
        }
        _ => {
            tracing::warn!("No API key configured, all turns answer with the fallback text");
            Arc::new(ScriptedClient::new())
        }
    }
}

/// 单轮处理。返回装箱 Future：裁决动作会经 [`spawn_resumption`]
/// 再次构造本函数的 Future，装箱断开类型自引用。
fn process_turn(inner: Arc<KernelInner>, turn: InboundTurn) -> BoxFuture<'static, TurnOutput> {
    async move {
        let agent = resolve_agent(&inner, &turn).await;
        let message_text = display_text(&turn);

        let session = inner
            .sessions
            .get_or_create(&turn.actor_key, &turn.school_id, turn.role)
            .await;
        // 群成员无登录态，需要会话的动作对其拒绝
        let has_session = turn.role != ActorRole::GroupMember;

        let bundle = inner
            .assembler
            .assemble(&turn.school_id, &turn.actor_key, &agent, &message_text)
            .await;

        let mut sections: Vec<String> = Vec::new();
        if !bundle.context.is_empty() {
            sections.push(bundle.context.clone());
        }
        if let Some(block) = render_session_context(&session) {
            sections.push(block);
        }
        if turn.role == ActorRole::Admin {
            match inner
                .coordinator
                .queue_for_authority(&turn.school_id, &turn.role.to_string())
                .await
            {
                Ok(queue) if !queue.is_empty() => sections.push(render_authority_queue(&queue)),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to read authority queue"),
            }
        }
        sections.push(format!("当前消息: {}", message_text));

        let messages = [
            ChatMessage::system(inner.personas.system_prompt(&agent, turn.role, &inner.policy)),
            ChatMessage::user(sections.join("\n\n")),
        ];

        let (mut reply, mut fallback) = match generate_reply(&inner, &messages).await {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(actor_key = %turn.actor_key, error = %e, "Turn degraded to fallback reply");
                (AgentReply::fallback(inner.fallback_text.clone()), true)
            }
        };

        let mut action_name: Option<String> = None;
        let mut action_status = ActionStatus::None;
        let mut escalation_id: Option<String> = None;
        let mut text = reply.message.trim().to_string();

        if let Some(req) = reply.admin_escalation.take() {
            match inner
                .coordinator
                .open_or_coalesce(&turn.school_id, &turn.actor_key, &agent, &req)
                .await
            {
                Ok((escalation, _coalesced)) => {
                    escalation_id = Some(escalation.id);
                    // 随升级提出的动作挂起，待裁决回灌后执行
                    if let Some(action) = reply.action.take() {
                        action_name = Some(action.name.trim().to_uppercase());
                        action_status = ActionStatus::HeldForEscalation;
                    }
                    if text.is_empty() {
                        text = inner.ack_text.clone();
                    }
                }
                Err(e) => {
                    // 升级没写进存储就不能向用户承诺已提交
                    tracing::error!(actor_key = %turn.actor_key, error = %e, "Escalation write failed");
                    text = inner.fallback_text.clone();
                    fallback = true;
                    if let Some(action) = reply.action.take() {
                        action_name = Some(action.name.trim().to_uppercase());
                        action_status = ActionStatus::Failed;
                    }
                }
            }
        } else if let Some(action) = reply.action.take() {
            let name = action.name.trim().to_uppercase();
            let auth = inner.policy.authorize(&name, turn.role, has_session);
            if auth.authorized {
                if name == "LOGOUT" {
                    inner.sessions.logout(&turn.actor_key).await;
                    if text.is_empty() {
                        text = "已退出登录。".to_string();
                    }
                    action_status = ActionStatus::Executed;
                } else if name == "DECIDE_ESCALATION" {
                    let (status, note, decided_id) =
                        decide_escalation(&inner, action.params).await;
                    action_status = status;
                    escalation_id = decided_id;
                    if let Some(note) = note {
                        append_line(&mut text, &note);
                    }
                } else {
                    let outcome = inner.dispatcher.dispatch(&name, action.params).await;
                    action_status = outcome.status;
                    if let Some(detail) = outcome.detail {
                        append_line(&mut text, &detail);
                    }
                }
                action_name = Some(name);
            } else if auth
                .reason
                .as_deref()
                .is_some_and(|r| r.starts_with("unknown action"))
            {
                // 策略表没有的动作名按不支持处理，回复文本保留
                tracing::warn!(actor_key = %turn.actor_key, action = %name, "Requested action is not in the policy table");
                action_name = Some(name);
                action_status = ActionStatus::Unsupported;
            } else {
                tracing::info!(
                    actor_key = %turn.actor_key,
                    action = %name,
                    reason = ?auth.reason,
                    "Action denied"
                );
                action_name = Some(name);
                action_status = ActionStatus::Denied;
                text = inner.deny_text.clone();
            }
        }

        if text.is_empty() {
            text = inner.fallback_text.clone();
            fallback = true;
        }

        let mut entry = HistoryEntry::new(
            &turn.school_id,
            &turn.actor_key,
            turn.role,
            &agent,
            &message_text,
            &text,
        );
        if let Some(name) = &action_name {
            entry = entry.with_action(name.clone(), action_status);
        }
        let committed = match inner.store.append_history(entry).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(actor_key = %turn.actor_key, error = %e, "History write failed, turn continues");
                false
            }
        };

        // 裁决结果只有落进历史且非兜底回复才算送达；
        // 否则保持 DECIDED，下一轮重新呈现
        if committed && !fallback {
            for escalation in &bundle.pending {
                if let Err(e) = inner.coordinator.mark_delivered(&escalation.id).await {
                    tracing::warn!(escalation_id = %escalation.id, error = %e, "Failed to mark escalation delivered");
                }
            }
        }
        if committed {
            let summarizer = inner.summarizer.clone();
            let school_id = turn.school_id.clone();
            let actor_key = turn.actor_key.clone();
            tokio::spawn(async move {
                summarizer.maybe_snapshot(&school_id, &actor_key).await;
            });
        }

        if let Some(updates) = &reply.session_updates {
            if !updates.is_empty() {
                inner.sessions.apply_updates(&turn.actor_key, updates).await;
            }
        }

        let mut output = TurnOutput::new(&turn.actor_key, &agent, text);
        output.action = action_name;
        output.action_status = action_status;
        output.escalation_id = escalation_id;
        output.fallback = fallback;
        output
    }
    .boxed()
}

/// 轮次由哪个人设处理。合成轮沿用升级记录上的人设，
/// 保证裁决结果回到发起升级的智能体；通讯录配置的人设覆盖
/// 优先于角色缺省。
async fn resolve_agent(inner: &KernelInner, turn: &InboundTurn) -> String {
    if turn.kind == TurnKind::System {
        if let Ok(Some(escalation)) = inner.store.get_escalation(&turn.text).await {
            return escalation.agent;
        }
    }
    if let Some(agent) = inner
        .directory
        .resolve(&turn.actor_key)
        .and_then(|profile| profile.agent)
    {
        return agent;
    }
    persona::default_agent(turn.role).to_string()
}

/// 入站轮次在历史与提示词中的文字形态
fn display_text(turn: &InboundTurn) -> String {
    match turn.kind {
        TurnKind::Text => turn.text.clone(),
        TurnKind::Image => {
            if turn.text.trim().is_empty() {
                "[图片]".to_string()
            } else {
                format!("[图片] {}", turn.text)
            }
        }
        TurnKind::Audio => {
            if turn.text.trim().is_empty() {
                "[语音]".to_string()
            } else {
                format!("[语音] {}", turn.text)
            }
        }
        TurnKind::System => format!("[系统] 升级 {} 已裁决，请向用户转达结果", turn.text),
    }
}

fn render_session_context(session: &Session) -> Option<String> {
    if session.context.is_empty() {
        return None;
    }
    let mut pairs: Vec<(&String, &String)> = session.context.iter().collect();
    pairs.sort();
    let lines: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect();
    Some(format!("[会话上下文]\n{}", lines.join("\n")))
}

fn render_authority_queue(queue: &[Escalation]) -> String {
    let mut block = String::from("[待裁决队列]");
    for escalation in queue {
        block.push_str(&format!(
            "\n- {}（{}）来自 {}，智能体 {}: {}",
            escalation.id,
            escalation.urgency,
            escalation.actor_key,
            escalation.agent,
            escalation.reason
        ));
    }
    block
}

fn append_line(text: &mut String, line: &str) {
    if text.is_empty() {
        text.push_str(line);
    } else {
        text.push('\n');
        text.push_str(line);
    }
}

/// 生成并解析回复。返回值第二项标记是否走了纯文本透传。
async fn generate_reply(
    inner: &KernelInner,
    messages: &[ChatMessage],
) -> Result<(AgentReply, bool), KernelError> {
    let raw = match tokio::time::timeout(inner.generate_timeout, inner.client.generate(messages))
        .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => return Err(KernelError::Generation(e)),
        Err(_) => {
            return Err(KernelError::GenerationTimeout(
                inner.generate_timeout.as_secs(),
            ))
        }
    };

    match parse_reply(&raw) {
        Ok(reply) => Ok((reply, false)),
        Err(e) => {
            // 生成端偶尔直接说人话：没有任何 JSON 痕迹的非空输出原样转达
            let trimmed = raw.trim();
            if !trimmed.is_empty() && !trimmed.contains('{') {
                tracing::debug!("Reply is plain prose, passing through verbatim");
                Ok((AgentReply::fallback(trimmed), true))
            } else {
                Err(KernelError::Parse(e.to_string()))
            }
        }
    }
}

/// 执行 DECIDE_ESCALATION：裁决升级记录并调度回灌轮次。
/// 返回（动作状态，给裁决者的附注，升级 ID）。
async fn decide_escalation(
    inner: &Arc<KernelInner>,
    params: Value,
) -> (ActionStatus, Option<String>, Option<String>) {
    let Some(escalation_id) = params
        .get("escalation_id")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        tracing::warn!("DECIDE_ESCALATION without escalation_id");
        return (
            ActionStatus::Failed,
            Some("（裁决缺少升级编号，请引用 esc_ 开头的编号重试）".to_string()),
            None,
        );
    };
    let decision = params
        .get("decision")
        .and_then(Value::as_str)
        .unwrap_or("approve")
        .to_string();
    let instruction = params
        .get("instruction")
        .and_then(Value::as_str)
        .map(str::to_string);
    let artifact = params
        .get("artifact")
        .and_then(Value::as_str)
        .map(str::to_string);

    match inner
        .coordinator
        .decide(&escalation_id, decision, instruction, artifact)
        .await
    {
        Ok(escalation) => {
            spawn_resumption(inner, &escalation);
            (ActionStatus::Executed, None, Some(escalation.id))
        }
        Err(e) => {
            tracing::warn!(escalation_id = %escalation_id, error = %e, "Escalation decide failed");
            (
                ActionStatus::Failed,
                Some("（该升级无法裁决：可能已处理或编号有误）".to_string()),
                Some(escalation_id),
            )
        }
    }
}

/// 裁决后在发起方队列排一个合成轮次，把结论转成面向用户的话术推送。
/// 发起方有轮次在队列中时，合成轮次自然排在其后。
fn spawn_resumption(inner: &Arc<KernelInner>, escalation: &Escalation) {
    let profile = inner.directory.resolve_or_guest(&escalation.actor_key);
    let resumption = InboundTurn::system(
        &escalation.actor_key,
        &escalation.school_id,
        profile.role,
        &escalation.id,
    );
    let rx = inner
        .serializer
        .queue(&escalation.actor_key, process_turn(inner.clone(), resumption));

    let sink = inner.sink.clone();
    let actor_key = escalation.actor_key.clone();
    let escalation_id = escalation.id.clone();
    tokio::spawn(async move {
        match rx.await {
            Ok(output) => {
                if let Err(e) = sink.deliver(&actor_key, &output.text).await {
                    tracing::warn!(
                        actor_key = %actor_key,
                        escalation_id = %escalation_id,
                        error = %e,
                        "Failed to push resumption reply"
                    );
                }
            }
            Err(_) => {
                tracing::warn!(escalation_id = %escalation_id, "Resumption turn lane closed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::StaticReplyAction;
    use crate::contract::Urgency;
    use crate::delivery::ChannelSink;
    use crate::escalation::EscalationStatus;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn test_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.escalation.authorities.insert(
            "sch_1".to_string(),
            HashMap::from([("admin".to_string(), "admin_1".to_string())]),
        );
        cfg
    }

    fn test_kernel(
        client: Arc<ScriptedClient>,
    ) -> (
        Kernel,
        Arc<MemoryStore>,
        tokio::sync::mpsc::UnboundedReceiver<(String, String)>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let (sink, rx) = ChannelSink::new();
        let mut dispatcher = ActionDispatcher::new(5);
        dispatcher.register(StaticReplyAction::new("QUERY_SCHEDULE", "周三上午有数学课。"));
        dispatcher.register(StaticReplyAction::new("RELEASE_RESULTS", "已发布本次考试成绩。"));

        let directory = StaticDirectory::from_toml_str(
            r#"
            default_school = "sch_1"
            [[actors]]
            key = "parent_1"
            role = "parent"
            [[actors]]
            key = "admin_1"
            role = "admin"
            "#,
        )
        .unwrap();

        let kernel = Kernel::builder(store.clone(), client)
            .with_config(test_config())
            .with_sink(Arc::new(sink))
            .with_directory(Arc::new(directory))
            .with_dispatcher(dispatcher)
            .build();
        (kernel, store, rx)
    }

    #[tokio::test]
    async fn test_plain_turn_replies_and_commits_history() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(r#"{"message": "你好，有什么可以帮你？", "confidence": 0.9}"#);
        let (kernel, store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "你好"))
            .await;

        assert_eq!(output.text, "你好，有什么可以帮你？");
        assert!(!output.fallback);
        assert_eq!(output.action_status, ActionStatus::None);
        assert_eq!(output.agent, "class_assistant");

        let history = store.recent_history("sch_1", "parent_1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_message, "你好");
        assert_eq!(history[0].reply, "你好，有什么可以帮你？");
    }

    #[tokio::test]
    async fn test_directory_agent_override() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(r#"{"message": "已为您查询。", "confidence": 0.9}"#);
        let store = Arc::new(MemoryStore::new());
        let (sink, _rx) = ChannelSink::new();
        let directory = StaticDirectory::from_toml_str(
            r#"
            default_school = "sch_1"
            [[actors]]
            key = "parent_vip"
            role = "parent"
            agent = "teaching_assistant"
            "#,
        )
        .unwrap();
        let kernel = Kernel::builder(store, client)
            .with_config(test_config())
            .with_sink(Arc::new(sink))
            .with_directory(Arc::new(directory))
            .build();

        let output = kernel
            .submit_turn(InboundTurn::text(
                "parent_vip",
                "sch_1",
                ActorRole::Parent,
                "作业提交到哪里",
            ))
            .await;

        assert_eq!(output.agent, "teaching_assistant");
        assert!(!output.fallback);
    }

    #[tokio::test]
    async fn test_prose_reply_passes_through_as_fallback() {
        let client = Arc::new(ScriptedClient::new());
        client.respond("今天is星期三，下午有家长会。");
        let (kernel, _store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "今天周几"))
            .await;

        assert_eq!(output.text, "今天is星期三，下午有家长会。");
        assert!(output.fallback);
    }

    #[tokio::test]
    async fn test_garbled_reply_uses_fallback_text() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(r#"{"message": 未闭合"#);
        let (kernel, _store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "hi"))
            .await;

        assert!(output.fallback);
        assert_eq!(output.text, AppConfig::default().escalation.fallback_text);
    }

    #[tokio::test]
    async fn test_generation_failure_uses_fallback_text() {
        let client = Arc::new(ScriptedClient::new());
        client.fail("connection refused");
        let (kernel, store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "hi"))
            .await;

        assert!(output.fallback);
        // 兜底轮同样落历史
        let history = store.recent_history("sch_1", "parent_1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout_uses_fallback_text() {
        let client = Arc::new(ScriptedClient::new());
        client.respond_after(
            Duration::from_secs(120),
            r#"{"message": "太迟了", "confidence": 0.9}"#,
        );
        let (kernel, _store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "hi"))
            .await;

        assert!(output.fallback);
    }

    #[tokio::test]
    async fn test_denied_action_replaced_with_polite_deny() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{"message": "好的，马上发布成绩。", "action": {"name": "RELEASE_RESULTS"}, "confidence": 0.9}"#,
        );
        let (kernel, store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "发布成绩"))
            .await;

        assert_eq!(output.action_status, ActionStatus::Denied);
        assert_eq!(output.text, AppConfig::default().escalation.deny_text);
        assert!(!output.fallback);

        let history = store.recent_history("sch_1", "parent_1", 10).await.unwrap();
        assert_eq!(history[0].action_status, ActionStatus::Denied);
    }

    #[tokio::test]
    async fn test_unknown_action_keeps_reply_marks_unsupported() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{"message": "这个我帮不上。", "action": {"name": "MAKE_COFFEE"}, "confidence": 0.4}"#,
        );
        let (kernel, _store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "煮杯咖啡"))
            .await;

        assert_eq!(output.action_status, ActionStatus::Unsupported);
        assert_eq!(output.text, "这个我帮不上。");
    }

    #[tokio::test]
    async fn test_executed_action_appends_detail() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{"message": "帮你查课表。", "action": {"name": "QUERY_SCHEDULE"}, "confidence": 0.9}"#,
        );
        let (kernel, _store, _rx) = test_kernel(client);

        // 查课表不需要登录态，群成员可用
        let output = kernel
            .submit_turn(InboundTurn::text(
                "guest_9",
                "sch_1",
                ActorRole::GroupMember,
                "课表",
            ))
            .await;

        assert_eq!(output.action_status, ActionStatus::Executed);
        assert!(output.text.contains("帮你查课表。"));
        assert!(output.text.contains("周三上午有数学课。"));
    }

    #[tokio::test]
    async fn test_session_updates_applied_and_rendered() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{"message": "好的，记住了。", "session_updates": {"student": "小明"}, "confidence": 0.9}"#,
        );
        client.respond(r#"{"message": "小明这周表现不错。", "confidence": 0.9}"#);
        let (kernel, _store, _rx) = test_kernel(client.clone());

        kernel
            .submit_turn(InboundTurn::text(
                "parent_1",
                "sch_1",
                ActorRole::Parent,
                "我们聊聊小明",
            ))
            .await;
        kernel
            .submit_turn(InboundTurn::text(
                "parent_1",
                "sch_1",
                ActorRole::Parent,
                "他这周怎么样",
            ))
            .await;

        let value = kernel
            .sessions()
            .with_session("parent_1", |s| s.context.get("student").cloned())
            .await
            .flatten();
        assert_eq!(value.as_deref(), Some("小明"));
        // 第二轮提示词携带会话上下文
        let requests = client.requests();
        assert!(requests[1].contains("[会话上下文]"));
        assert!(requests[1].contains("student: 小明"));
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{"message": "记住了。", "session_updates": {"student": "小明"}, "confidence": 0.9}"#,
        );
        client.respond(r#"{"message": "", "action": {"name": "LOGOUT"}, "confidence": 0.9}"#);
        let (kernel, _store, _rx) = test_kernel(client);

        kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "聊聊小明"))
            .await;
        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "退出登录"))
            .await;

        assert_eq!(output.action_status, ActionStatus::Executed);
        assert_eq!(output.text, "已退出登录。");
        assert_eq!(kernel.sessions().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_escalation_opens_acks_and_holds_action() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{
                "message": "",
                "action": {"name": "RELEASE_RESULTS"},
                "admin_escalation": {"authority_role": "admin", "urgency": "high", "reason": "家长要求提前发布成绩"},
                "confidence": 0.8
            }"#,
        );
        let (kernel, store, mut rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text(
                "parent_1",
                "sch_1",
                ActorRole::Parent,
                "现在就发成绩",
            ))
            .await;

        assert_eq!(output.action_status, ActionStatus::HeldForEscalation);
        assert_eq!(output.text, AppConfig::default().escalation.ack_text);
        let escalation_id = output.escalation_id.clone().unwrap();
        assert!(escalation_id.starts_with("esc_"));

        let escalation = store.get_escalation(&escalation_id).await.unwrap().unwrap();
        assert_eq!(escalation.status, EscalationStatus::Pending);
        assert_eq!(escalation.urgency, Urgency::High);

        // 裁决者收到推送通知
        let (to, text) = rx.recv().await.unwrap();
        assert_eq!(to, "admin_1");
        assert!(text.contains(&escalation_id));
        assert!(text.contains("家长要求提前发布成绩"));
    }

    #[tokio::test]
    async fn test_decided_escalation_consumed_and_marked_delivered() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(r#"{"message": "校方已批准提前发布成绩。", "confidence": 0.9}"#);
        let (kernel, store, _rx) = test_kernel(client.clone());

        let mut escalation = Escalation::open(
            "sch_1",
            "parent_1",
            "class_assistant",
            "admin",
            Urgency::Normal,
            "申请提前发布成绩",
        );
        escalation.status = EscalationStatus::Decided;
        escalation.decision = Some("approve".to_string());
        escalation.instruction = Some("按正常流程发布".to_string());
        store.insert_escalation(&escalation).await.unwrap();

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "有结果了吗"))
            .await;

        assert!(!output.fallback);
        let requests = client.requests();
        assert!(requests[0].contains("[管理员裁决]"));
        assert!(requests[0].contains(&escalation.id));

        let stored = store.get_escalation(&escalation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscalationStatus::Delivered);
    }

    #[tokio::test]
    async fn test_decided_escalation_stays_decided_on_fallback_turn() {
        let client = Arc::new(ScriptedClient::new());
        client.fail("boom");
        let (kernel, store, _rx) = test_kernel(client);

        let mut escalation = Escalation::open(
            "sch_1",
            "parent_1",
            "class_assistant",
            "admin",
            Urgency::Normal,
            "申请调班",
        );
        escalation.status = EscalationStatus::Decided;
        escalation.decision = Some("deny".to_string());
        store.insert_escalation(&escalation).await.unwrap();

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "结果呢"))
            .await;

        assert!(output.fallback);
        // 兜底回复没把结论带给用户，记录保持已裁决待送达
        let stored = store.get_escalation(&escalation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscalationStatus::Decided);
    }

    #[tokio::test]
    async fn test_admin_turn_sees_pending_queue() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(r#"{"message": "我看下待办。", "confidence": 0.9}"#);
        let (kernel, store, _rx) = test_kernel(client.clone());

        let escalation = Escalation::open(
            "sch_1",
            "parent_1",
            "class_assistant",
            "admin",
            Urgency::High,
            "家长申请退费",
        );
        store.insert_escalation(&escalation).await.unwrap();

        kernel
            .submit_turn(InboundTurn::text("admin_1", "sch_1", ActorRole::Admin, "有什么待办"))
            .await;

        let requests = client.requests();
        assert!(requests[0].contains("[待裁决队列]"));
        assert!(requests[0].contains(&escalation.id));
        assert!(requests[0].contains("家长申请退费"));
    }

    #[tokio::test]
    async fn test_decide_action_triggers_resumption_delivery() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{
                "message": "",
                "admin_escalation": {"authority_role": "admin", "urgency": "normal", "reason": "申请提前发布成绩"},
                "confidence": 0.8
            }"#,
        );
        let (kernel, store, mut rx) = test_kernel(client.clone());

        let opened = kernel
            .submit_turn(InboundTurn::text(
                "parent_1",
                "sch_1",
                ActorRole::Parent,
                "能提前发成绩吗",
            ))
            .await;
        let escalation_id = opened.escalation_id.clone().unwrap();
        let (notify_to, _) = rx.recv().await.unwrap();
        assert_eq!(notify_to, "admin_1");

        // 裁决轮与回灌轮按生成顺序消费脚本
        client.respond(&format!(
            r#"{{"message": "已批准。", "action": {{"name": "DECIDE_ESCALATION", "params": {{"escalation_id": "{}", "decision": "approve", "instruction": "今晚前发布"}}}}, "confidence": 0.9}}"#,
            escalation_id
        ));
        client.respond(r#"{"message": "校方已批准，成绩今晚发布。", "confidence": 0.9}"#);

        let decided = kernel
            .submit_turn(InboundTurn::text("admin_1", "sch_1", ActorRole::Admin, "批准"))
            .await;
        assert_eq!(decided.action_status, ActionStatus::Executed);
        assert_eq!(decided.escalation_id.as_deref(), Some(escalation_id.as_str()));

        // 回灌结果推送给发起家长
        let (to, text) = rx.recv().await.unwrap();
        assert_eq!(to, "parent_1");
        assert_eq!(text, "校方已批准，成绩今晚发布。");

        let stored = store.get_escalation(&escalation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscalationStatus::Delivered);
        assert_eq!(stored.decision.as_deref(), Some("approve"));

        // 回灌轮沿用发起升级的人设并落历史
        let history = store.recent_history("sch_1", "parent_1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].agent, "class_assistant");
        assert!(history[1].user_message.contains(&escalation_id));
    }

    #[tokio::test]
    async fn test_decide_unknown_escalation_reports_failure() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(
            r#"{"message": "处理 esc_missing。", "action": {"name": "DECIDE_ESCALATION", "params": {"escalation_id": "esc_missing"}}, "confidence": 0.9}"#,
        );
        let (kernel, _store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("admin_1", "sch_1", ActorRole::Admin, "批准那个"))
            .await;

        assert_eq!(output.action_status, ActionStatus::Failed);
        assert!(output.text.contains("无法裁决"));
    }

    #[tokio::test]
    async fn test_empty_reply_message_uses_fallback_text() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(r#"{"message": "", "confidence": 0.2}"#);
        let (kernel, _store, _rx) = test_kernel(client);

        let output = kernel
            .submit_turn(InboundTurn::text("parent_1", "sch_1", ActorRole::Parent, "在吗"))
            .await;

        assert!(output.fallback);
        assert_eq!(output.text, AppConfig::default().escalation.fallback_text);
    }
}
