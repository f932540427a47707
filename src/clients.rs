//! Pages and notifications the worker can reach
//!
//! `ClientList` tracks the open window clients (pages) of the site and
//! `NotificationCenter` holds the notifications currently on screen. Both are
//! in-process and shared by cloning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::push::Notification;

/// An open page of the site
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowClient {
    pub id: u64,
    pub url: String,
    /// Whether the active worker controls this page
    pub controlled: bool,
    pub focused: bool,
}

#[derive(Debug, Default)]
struct ClientListInner {
    clients: BTreeMap<u64, WindowClient>,
    next_id: u64,
}

/// The set of open pages, in the order they were opened
#[derive(Debug, Clone, Default)]
pub struct ClientList {
    inner: Arc<Mutex<ClientListInner>>,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a page that was opened outside the worker's control
    pub async fn add(&self, url: impl Into<String>) -> WindowClient {
        let mut inner = self.inner.lock().await;
        let client = WindowClient {
            id: inner.next_id,
            url: url.into(),
            controlled: false,
            focused: false,
        };
        inner.next_id += 1;
        inner.clients.insert(client.id, client.clone());
        client
    }

    /// Open pages; uncontrolled ones only when asked for
    pub async fn match_all(&self, include_uncontrolled: bool) -> Vec<WindowClient> {
        self.inner
            .lock()
            .await
            .clients
            .values()
            .filter(|c| include_uncontrolled || c.controlled)
            .cloned()
            .collect()
    }

    /// Focuses a page, unfocusing every other one
    pub async fn focus(&self, id: u64) -> Option<WindowClient> {
        let mut inner = self.inner.lock().await;
        if !inner.clients.contains_key(&id) {
            return None;
        }
        for client in inner.clients.values_mut() {
            client.focused = client.id == id;
        }
        inner.clients.get(&id).cloned()
    }

    /// Opens a new focused page controlled by the worker
    pub async fn open_window(&self, url: impl Into<String>) -> WindowClient {
        let mut inner = self.inner.lock().await;
        for client in inner.clients.values_mut() {
            client.focused = false;
        }
        let client = WindowClient {
            id: inner.next_id,
            url: url.into(),
            controlled: true,
            focused: true,
        };
        inner.next_id += 1;
        inner.clients.insert(client.id, client.clone());
        client
    }

    /// Takes control of every open page; returns how many were newly claimed
    pub async fn claim(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut claimed = 0;
        for client in inner.clients.values_mut() {
            if !client.controlled {
                client.controlled = true;
                claimed += 1;
            }
        }
        claimed
    }
}

/// Notifications on screen, at most one per tag
#[derive(Debug, Clone, Default)]
pub struct NotificationCenter {
    shown: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shows a notification, replacing any with the same tag
    ///
    /// Returns whether the user is alerted: always for a new tag, and for a
    /// replacement only when the notification asks to renotify.
    pub async fn show(&self, notification: Notification) -> bool {
        let mut shown = self.shown.lock().await;
        let replaced = match shown.iter().position(|n| n.tag == notification.tag) {
            Some(pos) => {
                shown.remove(pos);
                true
            }
            None => false,
        };
        let alerts = !replaced || notification.renotify;
        shown.push(notification);
        alerts
    }

    /// Closes the notification with this tag, returning it
    pub async fn close(&self, tag: &str) -> Option<Notification> {
        let mut shown = self.shown.lock().await;
        let pos = shown.iter().position(|n| n.tag == tag)?;
        Some(shown.remove(pos))
    }

    pub async fn all(&self) -> Vec<Notification> {
        self.shown.lock().await.clone()
    }
}
