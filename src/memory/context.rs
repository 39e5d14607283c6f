//! 上下文装配
//!
//! 为每轮生成调用组装有界上下文：摘要背景 + 最近原文窗口 + 已裁决待回灌的决定，
//! 越新的内容越靠后。读到的决定只在返回值里标记，
//! 送达确认由内核在该轮落库之后执行，装配阶段不改升级状态。

use std::cmp::Ordering;
use std::sync::Arc;

use crate::escalation::Escalation;
use crate::llm::EmbeddingProvider;
use crate::memory::budget::truncate_to_estimate;
use crate::memory::snapshot::MemorySnapshot;
use crate::memory::tokenizer;
use crate::memory::HistoryEntry;
use crate::store::KernelStore;

/// 装配结果
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    /// 拼好的上下文文本，可能为空
    pub context: String,
    /// 是否携带了已裁决待送达的决定
    pub has_pending_decision: bool,
    /// 本轮读到的已裁决记录，内核在轮次落库后逐条确认送达
    pub pending: Vec<Escalation>,
}

/// 上下文装配器
pub struct ContextAssembler {
    store: Arc<dyn KernelStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    /// 原文窗口大小（最近 N 轮）
    raw_window: usize,
    /// 摘要背景块的 token 预算
    background_budget: usize,
    /// 最多携带的快照数
    snapshot_limit: usize,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn KernelStore>) -> Self {
        Self {
            store,
            embedder: None,
            raw_window: 10,
            background_budget: 1000,
            snapshot_limit: 3,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_raw_window(mut self, raw_window: usize) -> Self {
        self.raw_window = raw_window.max(1);
        self
    }

    pub fn with_background_budget(mut self, tokens: usize) -> Self {
        self.background_budget = tokens.max(1);
        self
    }

    pub fn with_snapshot_limit(mut self, limit: usize) -> Self {
        self.snapshot_limit = limit.max(1);
        self
    }

    /// 组装一轮上下文。存储读取失败按可降级处理：
    /// 缺失的段落直接省略，绝不让单轮因记忆读取失败而中断。
    /// 已裁决记录读不到时保持 DECIDED 原状，下一轮会重试。
    pub async fn assemble(
        &self,
        school_id: &str,
        actor_key: &str,
        agent: &str,
        current_message: &str,
    ) -> ContextBundle {
        let recent = match self
            .store
            .recent_history(school_id, actor_key, self.raw_window)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to read recent history");
                Vec::new()
            }
        };

        let snapshots = match self
            .store
            .snapshots(school_id, actor_key, self.snapshot_limit * 4)
            .await
        {
            Ok(snaps) => snaps,
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to read snapshots");
                Vec::new()
            }
        };
        let picked = self.pick_snapshots(current_message, snapshots).await;

        let decided = match self.store.decided_escalations(school_id, actor_key).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to read decided escalations");
                Vec::new()
            }
        };
        // 只回灌发给当前智能体的决定，其余留给各自的恢复轮次
        let decided: Vec<Escalation> = decided.into_iter().filter(|esc| esc.agent == agent).collect();

        let mut sections: Vec<String> = Vec::new();
        if !picked.is_empty() {
            sections.push(render_background(&picked, self.background_budget));
        }
        if !recent.is_empty() {
            sections.push(render_recent(&recent));
        }
        if !decided.is_empty() {
            sections.push(render_decisions(&decided));
        }

        ContextBundle {
            context: sections.join("\n\n"),
            has_pending_decision: !decided.is_empty(),
            pending: decided,
        }
    }

    /// 快照超过上限时按与当前消息的相关性挑选，
    /// 关键词 Jaccard 为主，双方都有向量时再混入余弦相似度，
    /// 同分取更新的。选出后按时间序返回。
    async fn pick_snapshots(
        &self,
        current_message: &str,
        mut snapshots: Vec<MemorySnapshot>,
    ) -> Vec<MemorySnapshot> {
        if snapshots.len() <= self.snapshot_limit {
            return snapshots;
        }

        let query_tokens = tokenizer::tokenize_to_set(current_message);
        let query_embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(current_message).await {
                Ok(v) if !v.is_empty() => Some(v),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "Embedding failed, keyword ranking only");
                    None
                }
            },
            None => None,
        };

        let mut scored: Vec<(f32, MemorySnapshot)> = snapshots
            .drain(..)
            .map(|snap| {
                let summary_tokens = tokenizer::tokenize_to_set(&snap.summary);
                let mut score = tokenizer::jaccard_similarity(&query_tokens, &summary_tokens);
                if let (Some(query), Some(emb)) = (query_embedding.as_deref(), snap.embedding.as_deref()) {
                    score = (score + cosine_similarity(query, emb)) / 2.0;
                }
                (score, snap)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(b.1.covers_through.cmp(&a.1.covers_through))
        });

        let mut picked: Vec<MemorySnapshot> = scored
            .into_iter()
            .take(self.snapshot_limit)
            .map(|(_, snap)| snap)
            .collect();
        picked.sort_by_key(|snap| snap.covers_through);
        picked
    }
}

fn render_background(snapshots: &[MemorySnapshot], budget: usize) -> String {
    let mut block = String::from("[历史摘要]");
    for snap in snapshots {
        block.push_str("\n- ");
        block.push_str(snap.summary.trim());
    }
    truncate_to_estimate(&block, budget)
}

fn render_recent(entries: &[HistoryEntry]) -> String {
    let mut block = String::from("[最近对话]");
    for entry in entries {
        block.push_str(&format!(
            "\n用户: {}\n{}: {}",
            entry.user_message, entry.agent, entry.reply
        ));
        if let Some(action) = &entry.action {
            block.push_str(&format!("\n（动作 {}: {}）", action, entry.action_status));
        }
    }
    block
}

fn render_decisions(decided: &[Escalation]) -> String {
    let mut block = String::new();
    for esc in decided {
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(&format!("[管理员裁决] {}\n", esc.id));
        block.push_str(&format!("原因: {}\n", esc.reason));
        block.push_str(&format!("结论: {}", esc.decision.as_deref().unwrap_or("-")));
        if let Some(instruction) = &esc.instruction {
            block.push_str(&format!("\n指示: {}", instruction));
        }
        if let Some(artifact) = &esc.artifact {
            block.push_str(&format!("\n附件: {}", artifact));
        }
    }
    block.push_str("\n请在本轮回复中向用户转达上述裁决结果。");
    block
}

/// 余弦相似度
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
