use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Notifier {
    queue: Arc<Mutex<VecDeque<Notice>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Notifier {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_capacity(config.notice_capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    pub fn push(&self, level: NoticeLevel, message: impl Into<String>) -> u64 {
        let message = message.into();
        match level {
            NoticeLevel::Error => error!(target: "notices", %message, "error notice"),
            NoticeLevel::Warning => warn!(target: "notices", %message, "warning notice"),
            NoticeLevel::Success | NoticeLevel::Info => {
                info!(target: "notices", level = ?level, %message, "notice")
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(Notice {
            id,
            level,
            message,
            created_at: Utc::now(),
        });
        id
    }

    pub fn success(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeLevel::Success, message)
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeLevel::Info, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeLevel::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeLevel::Error, message)
    }

    pub fn drain(&self) -> Vec<Notice> {
        self.queue.lock().drain(..).collect()
    }

    pub fn pending(&self) -> Vec<Notice> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Notice> {
        self.queue.lock().back().cloned()
    }

    pub fn dismiss(&self, id: u64) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|notice| notice.id != id);
        queue.len() != before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    Default,
    Granted,
    Denied,
    Unsupported,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn permission(&self) -> NotificationPermission;

    async fn request_permission(&self) -> NotificationPermission;

    fn show(&self, title: &str, body: &str);
}

#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    fn show(&self, title: &str, body: &str) {
        info!(target: "notifications", title, body, "notification");
    }
}
