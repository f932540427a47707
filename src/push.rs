//! Push delivery
//!
//! Turns push messages into notifications and routes a click on one back
//! into the site: an open page already showing the target is focused,
//! otherwise a new page is opened.
//!
//! Payloads are usually JSON shaped like an FCM message:
//!
//! ```json
//! {"notification": {"title": "Breaking", "body": "..."}, "data": {"url": "/articles.html"}}
//! ```
//!
//! Top-level `title`/`body` are accepted too, and anything that is not JSON
//! becomes the title verbatim.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clients::{ClientList, NotificationCenter, WindowClient};
use crate::config::WorkerConfig;

/// A notification as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub data: NotificationData,
    pub tag: String,
    /// Alert again even when replacing a notification with the same tag
    pub renotify: bool,
}

/// Data carried through to the click handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Page to show when the notification is clicked
    pub url: String,
}

/// What a notification click did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "client", rename_all = "kebab-case")]
pub enum ClickOutcome {
    /// An open page already showing the target was brought to front
    Focused(WindowClient),
    /// A new page was opened at the target
    Opened(WindowClient),
}

/// Returns the string at `path` inside a JSON value, ignoring empty strings
fn text_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.is_empty())
}

/// Builds the notification for a push payload
///
/// Never fails: a payload that is not JSON is shown as plain text, and a
/// missing payload gets the default title.
pub fn notification_from_payload(payload: Option<&[u8]>, config: &WorkerConfig) -> Notification {
    let push = &config.push;
    let (json, raw_text) = match payload {
        Some(bytes) => match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => (value, None),
            Err(_) => (Value::Null, Some(String::from_utf8_lossy(bytes).into_owned())),
        },
        None => (Value::Null, None),
    };

    let title = text_at(&json, &["notification", "title"])
        .or_else(|| text_at(&json, &["title"]))
        .map(str::to_string)
        .or(raw_text.filter(|t| !t.is_empty()))
        .unwrap_or_else(|| push.default_title.clone());
    let body = text_at(&json, &["notification", "body"])
        .or_else(|| text_at(&json, &["body"]))
        .unwrap_or_default()
        .to_string();
    let url = text_at(&json, &["data", "url"])
        .unwrap_or(push.default_url.as_str())
        .to_string();

    Notification {
        title,
        body,
        icon: push.icon.clone(),
        badge: push.badge.clone(),
        data: NotificationData { url },
        tag: push.tag.clone(),
        renotify: true,
    }
}

/// Receives push messages and notification clicks
#[derive(Debug, Clone)]
pub struct PushSink {
    config: Arc<WorkerConfig>,
    notifications: NotificationCenter,
    clients: ClientList,
}

impl PushSink {
    pub fn new(
        config: Arc<WorkerConfig>,
        notifications: NotificationCenter,
        clients: ClientList,
    ) -> Self {
        Self {
            config,
            notifications,
            clients,
        }
    }

    /// Shows the notification for an incoming push message
    pub async fn on_push(&self, payload: Option<&[u8]>) -> Notification {
        let notification = notification_from_payload(payload, &self.config);
        let alerted = self.notifications.show(notification.clone()).await;
        tracing::info!(
            title = %notification.title,
            url = %notification.data.url,
            alerted,
            "showing push notification"
        );
        notification
    }

    /// Handles a click: closes the notification and focuses or opens a page
    pub async fn on_notification_click(&self, notification: &Notification) -> ClickOutcome {
        self.notifications.close(&notification.tag).await;

        let target = if notification.data.url.is_empty() {
            self.config.push.default_url.as_str()
        } else {
            notification.data.url.as_str()
        };

        for client in self.clients.match_all(true).await {
            if client.url.contains(target) {
                if let Some(focused) = self.clients.focus(client.id).await {
                    tracing::debug!(url = %focused.url, "focused existing page");
                    return ClickOutcome::Focused(focused);
                }
            }
        }

        let absolute = self
            .config
            .resolve(target)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| target.to_string());
        let opened = self.clients.open_window(absolute).await;
        tracing::debug!(url = %opened.url, "opened new page");
        ClickOutcome::Opened(opened)
    }
}
