//! 会话管理
//!
//! 每个参与者一个会话：角色、学校、键值上下文。TTL 到期自动失效，
//! 显式登出立即清除。配置存储后写透持久化，写失败记日志放行。

pub mod directory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::turn::{ActorKey, ActorRole};
use crate::store::KernelStore;

/// 单个会话（即持久化档案，时间戳为毫秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub actor_key: ActorKey,
    pub school_id: String,
    pub role: ActorRole,
    /// 键值上下文（正在讨论的学生、偏好语言等）
    pub context: HashMap<String, String>,
    pub created_at: i64,
    pub last_active: i64,
}

impl Session {
    pub fn new(actor_key: impl Into<String>, school_id: impl Into<String>, role: ActorRole) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            actor_key: actor_key.into(),
            school_id: school_id.into(),
            role,
            context: HashMap::new(),
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = chrono::Utc::now().timestamp_millis();
    }

    /// 会话是否过期
    pub fn is_expired(&self, ttl: Duration) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        now - self.last_active > ttl.as_millis() as i64
    }
}

/// 会话管理器
pub struct SessionManager {
    /// 所有会话（actor_key -> Session）
    sessions: RwLock<HashMap<ActorKey, Session>>,
    /// 会话过期时间
    ttl: Duration,
    /// 写透存储（None 为纯内存）
    store: Option<Arc<dyn KernelStore>>,
}

impl SessionManager {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KernelStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 获取或创建参与者的会话。内存未命中时尝试从存储恢复；
    /// 已过期的会话丢弃重建。角色以目录解析结果为准，每轮覆盖。
    pub async fn get_or_create(
        &self,
        actor_key: &str,
        school_id: &str,
        role: ActorRole,
    ) -> Session {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(actor_key) {
                if !session.is_expired(self.ttl) {
                    session.role = role;
                    session.touch();
                    return session.clone();
                }
                sessions.remove(actor_key);
            }
        }

        if let Some(store) = &self.store {
            match store.load_session(actor_key).await {
                Ok(Some(mut restored)) if !restored.is_expired(self.ttl) => {
                    restored.role = role;
                    restored.touch();
                    self.sessions
                        .write()
                        .await
                        .insert(actor_key.to_string(), restored.clone());
                    return restored;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(actor_key = %actor_key, error = %e, "Failed to restore session, creating fresh");
                }
            }
        }

        let session = Session::new(actor_key, school_id, role);
        self.sessions
            .write()
            .await
            .insert(actor_key.to_string(), session.clone());
        self.persist(&session).await;
        session
    }

    /// 闭包内可变访问会话
    pub async fn with_session<F, R>(&self, actor_key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(actor_key).map(f)
    }

    /// 合并会话上下文增量并写透。存储失败记日志，不影响本轮。
    pub async fn apply_updates(&self, actor_key: &str, updates: &HashMap<String, String>) {
        let updated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(actor_key) {
                Some(session) => {
                    for (k, v) in updates {
                        session.context.insert(k.clone(), v.clone());
                    }
                    session.touch();
                    Some(session.clone())
                }
                None => None,
            }
        };
        if let Some(session) = updated {
            self.persist(&session).await;
        }
    }

    /// 显式登出：移除内存与持久化档案
    pub async fn logout(&self, actor_key: &str) {
        self.sessions.write().await.remove(actor_key);
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_session(actor_key).await {
                tracing::warn!(actor_key = %actor_key, error = %e, "Failed to delete persisted session");
            }
        }
    }

    /// 清理过期会话
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(self.ttl));
        before - sessions.len()
    }

    /// 获取活跃会话数
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn persist(&self, session: &Session) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(session).await {
                tracing::warn!(actor_key = %session.actor_key, error = %e, "Failed to persist session");
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(3600)
    }
}

/// 启动会话清扫定时任务
pub fn spawn_session_sweeper(
    manager: Arc<SessionManager>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let removed = manager.cleanup_expired().await;
            if removed > 0 {
                tracing::info!("Cleaned up {} expired sessions", removed);
            }
        }
    })
}
