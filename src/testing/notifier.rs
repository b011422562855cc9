use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::notify::{Notification, Notifier};

/// Captures notifications for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Notification, Vec<String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `count` notifications arrived, up to one second.
    ///
    /// Dispatch runs on a spawned task, so tests have to give it a chance to
    /// run before inspecting [`RecordingNotifier::sent`].
    pub async fn wait_for(&self, count: usize) -> Vec<(Notification, Vec<String>)> {
        for _ in 0..100 {
            {
                let sent = self.sent.lock().await;
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification, recipients: &[String]) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((notification.clone(), recipients.to_vec()));
        Ok(())
    }
}
