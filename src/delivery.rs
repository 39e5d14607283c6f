//! 出站投递抽象
//!
//! 内核主动推送消息的出口（升级通知、裁决回灌）。请求-响应路径不经过此处，
//! 由接入层自行回复。

use async_trait::async_trait;

/// 出站投递接口，按参与者标识推送文本
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, to: &str, text: &str) -> Result<(), String>;
}

/// 空投递：丢弃消息，纯库用法或测试缺省
pub struct NoopSink;

#[async_trait]
impl DeliverySink for NoopSink {
    async fn deliver(&self, to: &str, _text: &str) -> Result<(), String> {
        tracing::debug!(to = %to, "NoopSink dropped outbound message");
        Ok(())
    }
}

/// 通道投递：消息进 mpsc，测试端逐条取出断言
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<(String, String)>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    async fn deliver(&self, to: &str, text: &str) -> Result<(), String> {
        self.tx
            .send((to.to_string(), text.to_string()))
            .map_err(|e| format!("channel closed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_captures_messages() {
        let (sink, mut rx) = ChannelSink::new();
        sink.deliver("13800000001", "hello").await.unwrap();
        let (to, text) = rx.recv().await.unwrap();
        assert_eq!(to, "13800000001");
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_noop_sink_accepts_anything() {
        assert!(NoopSink.deliver("anyone", "anything").await.is_ok());
    }
}
