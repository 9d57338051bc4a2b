//! Fan-out of incoming kernel messages.
//!
//! Replies on shell/control are matched to the request that caused them by
//! `parent_header.msg_id`; everything else is broadcast. Both transports
//! (WebSocket and ZeroMQ) feed their reader tasks into a [`MessageRouter`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use log::debug;
use tokio::sync::{broadcast, oneshot, watch};

use crate::error::KernelError;
use crate::events::{KernelStatus, EVENT_CHANNEL_CAPACITY};

type ReplySender = oneshot::Sender<Result<JupyterMessage, KernelError>>;

pub struct MessageRouter {
    pending: Mutex<HashMap<String, ReplySender>>,
    closed: Mutex<Option<KernelError>>,
    broadcast_tx: broadcast::Sender<JupyterMessage>,
    status_tx: watch::Sender<KernelStatus>,
}

impl MessageRouter {
    pub fn new() -> Arc<Self> {
        let (broadcast_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY * 4);
        let (status_tx, _) = watch::channel(KernelStatus::Starting);
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            closed: Mutex::new(None),
            broadcast_tx,
            status_tx,
        })
    }

    /// Register interest in the reply to `msg_id`.
    ///
    /// Must be called before the request is sent, so a fast reply is never
    /// missed.
    pub fn register(self: &Arc<Self>, msg_id: &str) -> Result<PendingReply, KernelError> {
        if let Some(reason) = self.closed_reason() {
            return Err(reason);
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_id.to_string(), tx);
        Ok(PendingReply {
            router: self.clone(),
            msg_id: msg_id.to_string(),
            rx: Some(rx),
        })
    }

    /// Deliver a shell/control message to whoever is waiting for it.
    pub fn route_reply(&self, message: JupyterMessage) {
        let waiter = message.parent_header.as_ref().and_then(|parent| {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&parent.msg_id)
        });
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(message));
            }
            None => {
                debug!(
                    "[router] Unsolicited {} reply, broadcasting",
                    message.header.msg_type
                );
                self.route_broadcast(message);
            }
        }
    }

    /// Broadcast an IOPub (or unsolicited) message, tracking kernel status.
    pub fn route_broadcast(&self, message: JupyterMessage) {
        if let JupyterMessageContent::Status(status) = &message.content {
            self.set_status(KernelStatus::from(&status.execution_state));
        }
        // No subscribers is fine
        let _ = self.broadcast_tx.send(message);
    }

    pub fn set_status(&self, status: KernelStatus) {
        self.status_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JupyterMessage> {
        self.broadcast_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<KernelStatus> {
        self.status_tx.subscribe()
    }

    pub fn closed_reason(&self) -> Option<KernelError> {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop routing. Every waiting request fails with `reason`; the status
    /// settles on `status` (`Dead` or `Disposed`). Only the first close counts.
    pub fn close(&self, reason: KernelError, status: KernelStatus) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.clone());
        }
        let waiters: Vec<ReplySender> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for tx in waiters {
            let _ = tx.send(Err(reason.clone()));
        }
        self.set_status(status);
    }

    fn forget(&self, msg_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(msg_id);
    }
}

/// A registered reply slot. Dropping it unregisters the request, so a
/// timed-out request never leaks its entry.
pub struct PendingReply {
    router: Arc<MessageRouter>,
    msg_id: String,
    rx: Option<oneshot::Receiver<Result<JupyterMessage, KernelError>>>,
}

impl PendingReply {
    pub async fn wait(mut self) -> Result<JupyterMessage, KernelError> {
        let Some(rx) = self.rx.take() else {
            return Err(KernelError::SessionDisposed);
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self
                .router
                .closed_reason()
                .unwrap_or(KernelError::SessionDisposed)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.router.forget(&self.msg_id);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::status_message;
    use super::*;

    #[tokio::test]
    async fn test_reply_is_matched_by_parent_msg_id() {
        let router = MessageRouter::new();
        let pending = router.register("req-1").unwrap();

        router.route_reply(status_message("idle", Some("req-1")));

        let reply = pending.wait().await.unwrap();
        assert_eq!(reply.header.msg_type, "status");
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_broadcast() {
        let router = MessageRouter::new();
        let mut rx = router.subscribe();

        router.route_reply(status_message("busy", Some("nobody")));

        assert_eq!(rx.recv().await.unwrap().header.msg_type, "status");
        assert_eq!(*router.status().borrow(), KernelStatus::Busy);
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let router = MessageRouter::new();
        let pending = router.register("req-1").unwrap();

        router.close(
            KernelError::KernelDied("socket closed".into()),
            KernelStatus::Dead,
        );

        assert!(matches!(
            pending.wait().await,
            Err(KernelError::KernelDied(_))
        ));
        assert!(matches!(
            router.register("req-2"),
            Err(KernelError::KernelDied(_))
        ));
        assert_eq!(*router.status().borrow(), KernelStatus::Dead);
    }

    #[test]
    fn test_dropped_reply_unregisters() {
        let router = MessageRouter::new();
        let pending = router.register("req-1").unwrap();
        drop(pending);
        assert!(router.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let router = MessageRouter::new();
        router.close(KernelError::SessionDisposed, KernelStatus::Disposed);
        router.set_status(KernelStatus::Idle);
        assert_eq!(*router.status().borrow(), KernelStatus::Disposed);
    }
}
