//! 历史压缩
//!
//! 原文窗口之外积累到一定量的旧轮次，后台压缩成一条快照。
//! 水位线单调推进：已被快照覆盖的 seq 不再二次摘要。
//! 摘要失败只记日志，下一轮触发时自然重试。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::llm::{ChatMessage, EmbeddingProvider, GenerateClient};
use crate::memory::snapshot::MemorySnapshot;
use crate::store::KernelStore;

/// 单次压缩的最大轮次数
const MAX_BLOCK: usize = 50;

/// 后台摘要器
pub struct Summarizer {
    store: Arc<dyn KernelStore>,
    client: Arc<dyn GenerateClient>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    /// 原文窗口大小，窗口内的轮次永不压缩
    raw_window: usize,
    /// 低于该块大小不值得压缩
    min_block: usize,
    /// 正在压缩的 (school_id, actor_key)，同一参与者不并发摘要
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl Summarizer {
    pub fn new(store: Arc<dyn KernelStore>, client: Arc<dyn GenerateClient>) -> Self {
        Self {
            store,
            client,
            embedder: None,
            raw_window: 10,
            min_block: 3,
            in_flight: Mutex::new(HashSet::new()),
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

    pub fn with_min_block(mut self, min_block: usize) -> Self {
        self.min_block = min_block.max(1);
        self
    }

    /// 轮次落库后调用。未越过阈值时直接返回，越过则压缩
    /// 水位线之后、原文窗口之前的一段旧轮次。
    pub async fn maybe_snapshot(&self, school_id: &str, actor_key: &str) {
        let latest = match self.store.latest_seq(school_id, actor_key).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to read latest seq");
                return;
            }
        };
        let watermark = match self.store.snapshot_watermark(school_id, actor_key).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to read snapshot watermark");
                return;
            }
        };

        let uncovered = latest.saturating_sub(watermark) as usize;
        if uncovered <= self.raw_window + self.min_block {
            return;
        }

        let key = (school_id.to_string(), actor_key.to_string());
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(key.clone()) {
                return;
            }
        }

        self.compress(school_id, actor_key, watermark, latest).await;
        self.in_flight.lock().await.remove(&key);
    }

    async fn compress(&self, school_id: &str, actor_key: &str, watermark: u64, latest: u64) {
        // 只压缩原文窗口之前的部分
        let block_len = (latest.saturating_sub(watermark) as usize)
            .saturating_sub(self.raw_window)
            .min(MAX_BLOCK);
        if block_len == 0 {
            return;
        }

        let entries = match self
            .store
            .history_block_after(school_id, actor_key, watermark, block_len)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to read history block");
                return;
            }
        };
        let Some(covers_through) = entries.last().map(|entry| entry.seq) else {
            return;
        };

        let mut transcript = String::new();
        for entry in &entries {
            transcript.push_str(&format!(
                "用户: {}\n{}: {}\n",
                entry.user_message, entry.agent, entry.reply
            ));
        }
        let messages = [
            ChatMessage::system(
                "你是校园消息系统的记忆压缩器。把下面这段对话压缩成一段中文摘要，\
                 保留事实、数字、人名与已承诺事项，不要加入评论。",
            ),
            ChatMessage::user(transcript),
        ];

        let summary = match self.client.generate(&messages).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!(actor_key = %actor_key, "Summarizer produced empty text, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Summary generation failed, will retry later");
                return;
            }
        };

        // 生成期间水位线可能已被其他进程推进，推进了就放弃本次结果
        match self.store.snapshot_watermark(school_id, actor_key).await {
            Ok(current) if current != watermark => {
                tracing::info!(
                    actor_key = %actor_key,
                    watermark = current,
                    "Watermark advanced during summarization, dropping result"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to re-check watermark");
                return;
            }
        }

        let mut snapshot = MemorySnapshot::new(school_id, actor_key, summary, covers_through);
        if let Some(embedder) = &self.embedder {
            match embedder.embed(&snapshot.summary).await {
                Ok(embedding) if !embedding.is_empty() => {
                    snapshot = snapshot.with_embedding(embedding);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Snapshot embedding failed, stored without vector");
                }
            }
        }

        if let Err(e) = self.store.put_snapshot(snapshot).await {
            tracing::warn!(actor_key = %actor_key, error = %e, "Failed to store snapshot");
            return;
        }
        tracing::info!(
            actor_key = %actor_key,
            turns = entries.len(),
            covers_through = covers_through,
            "Compressed history block into snapshot"
        );
    }
}
