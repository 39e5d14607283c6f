//! 按参与者串行的轮次队列
//!
//! 同一参与者的轮次严格按提交顺序逐个执行，不同参与者完全并行。
//! 每个参与者一条巷道（无界通道 + 工作协程），队列清空即回收，
//! 注册表大小与活跃参与者数同阶。单轮失败不堵队列：该轮的接收端
//! 收到关闭信号，后续轮次照常推进。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::core::error::KernelError;

type Job<T> = (BoxFuture<'static, T>, oneshot::Sender<T>);

struct Lane<T> {
    tx: mpsc::UnboundedSender<Job<T>>,
    /// 在队 + 在执行的轮次数，归零即从注册表摘除
    depth: usize,
}

/// 轮次串行器
pub struct TurnSerializer<T> {
    lanes: Arc<Mutex<HashMap<String, Lane<T>>>>,
}

impl<T: Send + 'static> TurnSerializer<T> {
    pub fn new() -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 同步入队，立即返回接收端。入队顺序即执行顺序。
    /// 接收端等到 Err 表示该轮任务崩溃或巷道关闭，由调用方降级。
    pub fn queue<F>(&self, actor_key: &str, fut: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job<T> = (Box::pin(fut), done_tx);

        let key = actor_key.to_string();
        let mut lanes = lock_lanes(&self.lanes);
        let lane = lanes
            .entry(key.clone())
            .or_insert_with(|| spawn_lane(self.lanes.clone(), key.clone()));
        lane.depth += 1;
        let send_result = lane.tx.send(job);

        if let Err(mpsc::error::SendError(job)) = send_result {
            // 工作协程已消失，换新巷道重投
            let mut fresh = spawn_lane(self.lanes.clone(), key.clone());
            fresh.depth = 1;
            let _ = fresh.tx.send(job);
            lanes.insert(key, fresh);
        }

        done_rx
    }

    /// 入队并等待该轮完成
    pub async fn submit<F>(&self, actor_key: &str, fut: F) -> Result<T, KernelError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.queue(actor_key, fut)
            .await
            .map_err(|_| KernelError::LaneClosed(actor_key.to_string()))
    }

    /// 当前持有巷道的参与者数
    pub fn active_lanes(&self) -> usize {
        lock_lanes(&self.lanes).len()
    }
}

impl<T: Send + 'static> Default for TurnSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_lanes<T>(
    lanes: &Mutex<HashMap<String, Lane<T>>>,
) -> MutexGuard<'_, HashMap<String, Lane<T>>> {
    lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 起一条巷道：工作协程逐个执行任务，任务崩溃只丢弃该轮的发送端。
/// 每轮结束后在注册表锁内扣减深度，归零摘除，通道随之关闭，协程退出。
fn spawn_lane<T: Send + 'static>(
    lanes: Arc<Mutex<HashMap<String, Lane<T>>>>,
    actor_key: String,
) -> Lane<T> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job<T>>();

    tokio::spawn(async move {
        while let Some((fut, done)) = rx.recv().await {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(output) => {
                    let _ = done.send(output);
                }
                Err(_) => {
                    tracing::error!(actor_key = %actor_key, "Turn task panicked, lane advances");
                    drop(done);
                }
            }

            let mut guard = lock_lanes(&lanes);
            if let Some(lane) = guard.get_mut(&actor_key) {
                lane.depth -= 1;
                if lane.depth == 0 {
                    guard.remove(&actor_key);
                }
            }
        }
    });

    Lane { tx, depth: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_per_actor_fifo_with_slow_first_turn() {
        let serializer = TurnSerializer::new();
        let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let l1 = log.clone();
        let rx1 = serializer.queue("13800000001", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            l1.lock().await.push(1);
        });
        let l2 = log.clone();
        let rx2 = serializer.queue("13800000001", async move {
            l2.lock().await.push(2);
        });
        let l3 = log.clone();
        let rx3 = serializer.queue("13800000001", async move {
            l3.lock().await.push(3);
        });

        rx1.await.unwrap();
        rx2.await.unwrap();
        rx3.await.unwrap();
        assert_eq!(*log.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cross_actor_no_head_of_line_blocking() {
        let serializer = TurnSerializer::new();
        let start = Instant::now();

        let slow = serializer.queue("actor_a", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Instant::now()
        });
        let fast = serializer.queue("actor_b", async { Instant::now() });

        let fast_done = fast.await.unwrap();
        let slow_done = slow.await.unwrap();

        assert!(fast_done.duration_since(start) < Duration::from_millis(50));
        assert!(slow_done.duration_since(start) >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_panicked_turn_does_not_block_queue() {
        let serializer = TurnSerializer::new();

        let rx1 = serializer.queue("13800000001", async {
            panic!("boom");
            #[allow(unreachable_code)]
            0
        });
        let rx2 = serializer.queue("13800000001", async { 42 });

        assert!(rx1.await.is_err());
        assert_eq!(rx2.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_lane_removed_after_settlement() {
        let serializer = TurnSerializer::new();
        serializer.submit("13800000001", async { 1 }).await.unwrap();

        // 扣减在回执发送之后，稍等片刻
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(serializer.active_lanes(), 0);
    }

    #[tokio::test]
    async fn test_submit_returns_output() {
        let serializer = TurnSerializer::new();
        let out = serializer.submit("13800000001", async { "ok" }).await.unwrap();
        assert_eq!(out, "ok");
    }
}
