//! 升级裁决协调
//!
//! 状态机：PENDING -> DECIDED -> DELIVERED，只进不退。
//! 同一参与者 + 智能体最多一条待裁决记录，重复请求并入而不重复通知。
//! 裁决后的回灌轮次由内核排入原参与者队列，本模块只管记录与通知。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::contract::{EscalationRequest, Urgency};
use crate::core::error::KernelError;
use crate::delivery::DeliverySink;
use crate::store::KernelStore;

/// 升级记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    /// 待裁决
    Pending,
    /// 已裁决，待回灌给发起参与者
    Decided,
    /// 裁决结果已送达（终态）
    Delivered,
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationStatus::Pending => write!(f, "pending"),
            EscalationStatus::Decided => write!(f, "decided"),
            EscalationStatus::Delivered => write!(f, "delivered"),
        }
    }
}

pub fn parse_escalation_status(s: &str) -> EscalationStatus {
    match s {
        "decided" => EscalationStatus::Decided,
        "delivered" => EscalationStatus::Delivered,
        _ => EscalationStatus::Pending,
    }
}

/// 升级记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub school_id: String,
    /// 发起方参与者（裁决结果回灌给谁）
    pub actor_key: String,
    /// 发起升级的智能体
    pub agent: String,
    /// 裁决角色（如 admin）
    pub authority_role: String,
    pub urgency: Urgency,
    /// 升级原因
    pub reason: String,
    /// 请求的裁决类型（approval、guidance 等）
    pub decision_kind: String,
    /// 裁决后允许执行的动作名
    pub allowed_actions: Vec<String>,
    /// 附带上下文，并入时追加
    pub context: String,
    pub status: EscalationStatus,
    /// 裁决结论（approve / deny / 自由文本）
    pub decision: Option<String>,
    /// 裁决者给智能体的指示
    pub instruction: Option<String>,
    /// 裁决产物引用（如报告文件），原样转交
    pub artifact: Option<String>,
    pub created_at: i64,
    pub decided_at: Option<i64>,
    pub delivered_at: Option<i64>,
}

impl Escalation {
    pub fn open(
        school_id: impl Into<String>,
        actor_key: impl Into<String>,
        agent: impl Into<String>,
        authority_role: impl Into<String>,
        urgency: Urgency,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("esc_{}", uuid::Uuid::new_v4()),
            school_id: school_id.into(),
            actor_key: actor_key.into(),
            agent: agent.into(),
            authority_role: authority_role.into(),
            urgency,
            reason: reason.into(),
            decision_kind: String::new(),
            allowed_actions: Vec::new(),
            context: String::new(),
            status: EscalationStatus::Pending,
            decision: None,
            instruction: None,
            artifact: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            decided_at: None,
            delivered_at: None,
        }
    }

    pub fn with_decision_kind(mut self, kind: impl Into<String>) -> Self {
        self.decision_kind = kind.into();
        self
    }

    pub fn with_allowed_actions(mut self, actions: Vec<String>) -> Self {
        self.allowed_actions = actions;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// 并入后续同源请求：紧急度取高、上下文追加、允许动作取并集。
    /// 原因保持首条不变，新原因折入上下文。
    fn coalesce(&mut self, req: &EscalationRequest) {
        self.urgency = self.urgency.max(req.urgency);
        if !req.context.trim().is_empty() {
            if !self.context.is_empty() {
                self.context.push('\n');
            }
            self.context.push_str(req.context.trim());
        }
        if !req.reason.trim().is_empty() && req.reason.trim() != self.reason {
            if !self.context.is_empty() {
                self.context.push('\n');
            }
            self.context.push_str("补充: ");
            self.context.push_str(req.reason.trim());
        }
        for action in &req.allowed_actions {
            if !self.allowed_actions.contains(action) {
                self.allowed_actions.push(action.clone());
            }
        }
    }
}

/// 升级协调器：封装状态迁移与裁决者通知
pub struct EscalationCoordinator {
    store: Arc<dyn KernelStore>,
    sink: Arc<dyn DeliverySink>,
    /// school_id -> (角色 -> 参与者标识)
    authorities: HashMap<String, HashMap<String, String>>,
}

impl EscalationCoordinator {
    pub fn new(
        store: Arc<dyn KernelStore>,
        sink: Arc<dyn DeliverySink>,
        authorities: HashMap<String, HashMap<String, String>>,
    ) -> Self {
        Self {
            store,
            sink,
            authorities,
        }
    }

    /// 打开或并入升级请求。返回 (记录, 是否并入)。
    /// 新记录写入失败是硬错误；裁决者通知失败只记日志，记录保持待裁决。
    pub async fn open_or_coalesce(
        &self,
        school_id: &str,
        actor_key: &str,
        agent: &str,
        req: &EscalationRequest,
    ) -> Result<(Escalation, bool), KernelError> {
        if let Some(mut existing) = self
            .store
            .pending_escalation(school_id, actor_key, agent)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))?
        {
            existing.coalesce(req);
            self.store
                .update_escalation(&existing)
                .await
                .map_err(|e| KernelError::Escalation(e.to_string()))?;
            tracing::info!(
                escalation_id = %existing.id,
                urgency = %existing.urgency,
                "Coalesced escalation request"
            );
            return Ok((existing, true));
        }

        let authority_role = if req.authority_role.trim().is_empty() {
            "admin"
        } else {
            req.authority_role.trim()
        };
        let escalation = Escalation::open(
            school_id,
            actor_key,
            agent,
            authority_role,
            req.urgency,
            req.reason.clone(),
        )
        .with_decision_kind(req.decision_kind.clone())
        .with_allowed_actions(req.allowed_actions.clone())
        .with_context(req.context.clone());

        self.store
            .insert_escalation(&escalation)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))?;
        tracing::info!(
            escalation_id = %escalation.id,
            authority_role = %escalation.authority_role,
            urgency = %escalation.urgency,
            "Opened escalation"
        );

        self.notify_authority(&escalation).await;
        Ok((escalation, false))
    }

    /// 裁决：仅允许 PENDING -> DECIDED，裁决字段落定后不可变更
    pub async fn decide(
        &self,
        id: &str,
        decision: impl Into<String>,
        instruction: Option<String>,
        artifact: Option<String>,
    ) -> Result<Escalation, KernelError> {
        let mut escalation = self
            .store
            .get_escalation(id)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))?
            .ok_or_else(|| KernelError::Escalation(format!("escalation not found: {}", id)))?;

        if escalation.status != EscalationStatus::Pending {
            return Err(KernelError::Escalation(format!(
                "escalation {} is {}, cannot decide",
                id, escalation.status
            )));
        }

        escalation.status = EscalationStatus::Decided;
        escalation.decision = Some(decision.into());
        escalation.instruction = instruction;
        escalation.artifact = artifact;
        escalation.decided_at = Some(chrono::Utc::now().timestamp_millis());

        self.store
            .update_escalation(&escalation)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))?;
        tracing::info!(escalation_id = %id, "Escalation decided");
        Ok(escalation)
    }

    /// 送达确认：仅在回灌轮次落库后调用。DELIVERED 上重复调用为幂等空操作。
    pub async fn mark_delivered(&self, id: &str) -> Result<(), KernelError> {
        let mut escalation = self
            .store
            .get_escalation(id)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))?
            .ok_or_else(|| KernelError::Escalation(format!("escalation not found: {}", id)))?;

        match escalation.status {
            EscalationStatus::Delivered => return Ok(()),
            EscalationStatus::Pending => {
                return Err(KernelError::Escalation(format!(
                    "escalation {} is pending, cannot mark delivered",
                    id
                )));
            }
            EscalationStatus::Decided => {}
        }

        escalation.status = EscalationStatus::Delivered;
        escalation.delivered_at = Some(chrono::Utc::now().timestamp_millis());
        self.store
            .update_escalation(&escalation)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))?;
        tracing::info!(escalation_id = %id, "Escalation delivered");
        Ok(())
    }

    /// 已裁决未送达的记录（上下文组装与回灌用）
    pub async fn decided_for(
        &self,
        school_id: &str,
        actor_key: &str,
    ) -> Result<Vec<Escalation>, KernelError> {
        self.store
            .decided_escalations(school_id, actor_key)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))
    }

    /// 某角色的待办队列（裁决者人设的上下文里呈现）
    pub async fn queue_for_authority(
        &self,
        school_id: &str,
        authority_role: &str,
    ) -> Result<Vec<Escalation>, KernelError> {
        self.store
            .escalations_for_authority(school_id, authority_role)
            .await
            .map_err(|e| KernelError::Escalation(e.to_string()))
    }

    /// 按学校 + 角色解析裁决者参与者标识
    pub fn authority_actor(&self, school_id: &str, authority_role: &str) -> Option<&str> {
        self.authorities
            .get(school_id)
            .and_then(|roles| roles.get(authority_role))
            .map(String::as_str)
    }

    /// 通知裁决者有新升级。失败不回滚：记录已是 PENDING，
    /// 裁决者下一轮对话的待办队列仍会呈现它。
    async fn notify_authority(&self, escalation: &Escalation) {
        let Some(authority_key) = self.authority_actor(&escalation.school_id, &escalation.authority_role)
        else {
            tracing::warn!(
                school_id = %escalation.school_id,
                authority_role = %escalation.authority_role,
                "No authority actor configured, escalation waits in queue"
            );
            return;
        };

        let text = format!(
            "[升级待裁决] {}\n来自: {} ({})\n紧急度: {}\n原因: {}\n回复时请引用编号。",
            escalation.id, escalation.actor_key, escalation.agent, escalation.urgency, escalation.reason
        );
        if let Err(e) = self.sink.deliver(authority_key, &text).await {
            tracing::warn!(
                escalation_id = %escalation.id,
                error = %e,
                "Failed to notify authority, escalation stays pending"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::ChannelSink;
    use crate::store::MemoryStore;

    fn request(reason: &str, urgency: Urgency) -> EscalationRequest {
        EscalationRequest {
            authority_role: "admin".into(),
            urgency,
            reason: reason.into(),
            decision_kind: "approval".into(),
            allowed_actions: vec!["RELEASE_RESULTS".into()],
            context: String::new(),
        }
    }

    fn coordinator_with_admin() -> (EscalationCoordinator, tokio::sync::mpsc::UnboundedReceiver<(String, String)>) {
        let store = Arc::new(MemoryStore::new());
        let (sink, rx) = ChannelSink::new();
        let mut authorities = HashMap::new();
        authorities.insert(
            "sch_1".to_string(),
            HashMap::from([("admin".to_string(), "13900000000".to_string())]),
        );
        (
            EscalationCoordinator::new(store, Arc::new(sink), authorities),
            rx,
        )
    }

    #[tokio::test]
    async fn test_open_then_decide_then_deliver() {
        let (coordinator, mut rx) = coordinator_with_admin();

        let (esc, coalesced) = coordinator
            .open_or_coalesce("sch_1", "13800000001", "class_assistant", &request("提前发成绩", Urgency::Normal))
            .await
            .unwrap();
        assert!(!coalesced);
        assert_eq!(esc.status, EscalationStatus::Pending);

        // 裁决者收到一条通知
        let (to, text) = rx.recv().await.unwrap();
        assert_eq!(to, "13900000000");
        assert!(text.contains(&esc.id));

        let decided = coordinator
            .decide(&esc.id, "approve", Some("按流程公布".into()), None)
            .await
            .unwrap();
        assert_eq!(decided.status, EscalationStatus::Decided);
        assert_eq!(decided.decision.as_deref(), Some("approve"));

        coordinator.mark_delivered(&esc.id).await.unwrap();
        // 幂等：重复送达不报错
        coordinator.mark_delivered(&esc.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_decide_twice_rejected() {
        let (coordinator, _rx) = coordinator_with_admin();
        let (esc, _) = coordinator
            .open_or_coalesce("sch_1", "13800000001", "class_assistant", &request("r", Urgency::Low))
            .await
            .unwrap();

        coordinator.decide(&esc.id, "approve", None, None).await.unwrap();
        let second = coordinator.decide(&esc.id, "deny", None, None).await;
        assert!(second.is_err());

        // 首次裁决不可变更
        let stored = coordinator.store.get_escalation(&esc.id).await.unwrap().unwrap();
        assert_eq!(stored.decision.as_deref(), Some("approve"));
    }

    #[tokio::test]
    async fn test_coalesce_single_record_single_notify() {
        let (coordinator, mut rx) = coordinator_with_admin();

        let (first, _) = coordinator
            .open_or_coalesce("sch_1", "13800000001", "class_assistant", &request("第一次请求", Urgency::Low))
            .await
            .unwrap();
        let (second, coalesced) = coordinator
            .open_or_coalesce("sch_1", "13800000001", "class_assistant", &request("第二次请求", Urgency::High))
            .await
            .unwrap();

        assert!(coalesced);
        assert_eq!(first.id, second.id);
        assert_eq!(second.urgency, Urgency::High);
        assert!(second.context.contains("第二次请求"));

        // 只有首次打开产生通知
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_pending_rejected() {
        let (coordinator, _rx) = coordinator_with_admin();
        let (esc, _) = coordinator
            .open_or_coalesce("sch_1", "13800000001", "class_assistant", &request("r", Urgency::Normal))
            .await
            .unwrap();
        assert!(coordinator.mark_delivered(&esc.id).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_authority_keeps_pending() {
        let store = Arc::new(MemoryStore::new());
        let (sink, mut rx) = ChannelSink::new();
        let coordinator = EscalationCoordinator::new(store, Arc::new(sink), HashMap::new());

        let (esc, _) = coordinator
            .open_or_coalesce("sch_x", "13800000001", "class_assistant", &request("r", Urgency::Normal))
            .await
            .unwrap();
        assert_eq!(esc.status, EscalationStatus::Pending);
        assert!(rx.try_recv().is_err());

        let queue = coordinator.queue_for_authority("sch_x", "admin").await.unwrap();
        assert_eq!(queue.len(), 1);
    }
}
