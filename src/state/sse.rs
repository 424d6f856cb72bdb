use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::dto::sse::ServerEvent;

/// Public and admin broadcast hubs.
pub struct SseState {
    public: SseHub,
    admin: AdminSseState,
}

impl SseState {
    pub fn new(public_capacity: usize, admin_capacity: usize) -> Self {
        Self {
            public: SseHub::new(public_capacity),
            admin: AdminSseState::new(admin_capacity),
        }
    }

    pub fn public(&self) -> &SseHub {
        &self.public
    }

    pub fn admin(&self) -> &AdminSseState {
        &self.admin
    }
}

/// Admin hub plus the token held by the single admin stream.
pub struct AdminSseState {
    hub: SseHub,
    token: Mutex<Option<String>>,
}

impl AdminSseState {
    fn new(capacity: usize) -> Self {
        Self {
            hub: SseHub::new(capacity),
            token: Mutex::new(None),
        }
    }

    /// Broadcast channel of the admin stream.
    pub fn hub(&self) -> &SseHub {
        &self.hub
    }

    /// Issue a fresh token, or `None` while another admin stream holds one.
    pub async fn claim_token(&self) -> Option<String> {
        let mut guard = self.token.lock().await;
        if guard.is_some() {
            return None;
        }
        let token = Uuid::new_v4().simple().to_string();
        *guard = Some(token.clone());
        Some(token)
    }

    /// Drop the token once the admin stream closes.
    pub async fn release_token(&self) {
        self.token.lock().await.take();
    }

    /// Whether `provided` matches the issued token. `None` when no admin stream is open.
    pub async fn check_token(&self, provided: &str) -> Option<bool> {
        self.token
            .lock()
            .await
            .as_deref()
            .map(|token| token == provided)
    }
}

/// Broadcast channel behind one SSE stream.
pub struct SseHub {
    sender: broadcast::Sender<ServerEvent>,
}

impl SseHub {
    /// Hub buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Send to every current subscriber. Nobody listening is not an error.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    /// Streams currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_admin_token_at_a_time() {
        let admin = AdminSseState::new(4);
        let token = admin.claim_token().await.unwrap();
        assert!(admin.claim_token().await.is_none());
        assert_eq!(admin.check_token(&token).await, Some(true));
        assert_eq!(admin.check_token("nope").await, Some(false));

        admin.release_token().await;
        assert_eq!(admin.check_token(&token).await, None);
        assert!(admin.claim_token().await.is_some());
    }
}
