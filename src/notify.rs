use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Booking;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Created,
    Rescheduled,
    Canceled,
}

impl NoticeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeKind::Created => "created",
            NoticeKind::Rescheduled => "rescheduled",
            NoticeKind::Canceled => "canceled",
        }
    }
}

/// A booking notice as delivered to `LISTEN host_<id>` subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub host_id: Ulid,
    pub kind: NoticeKind,
    pub booking_id: Ulid,
    /// JSON body.
    pub payload: String,
}

/// Tokens minted for the guest by this transition. Only a dispatcher that
/// delivers to the guest alone may put them on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoticeTokens {
    pub cancel: Option<String>,
    pub reschedule: Option<String>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notification dropped: {0}")]
    Dropped(String),
}

/// Outbound notification seam. Failures are logged by the caller and never
/// roll a booking back.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send_created(
        &self,
        booking: &Booking,
        tokens: &NoticeTokens,
        reminders: &[u32],
    ) -> Result<(), DispatchError>;

    async fn send_rescheduled(
        &self,
        booking: &Booking,
        tokens: &NoticeTokens,
        reminders: &[u32],
    ) -> Result<(), DispatchError>;

    async fn send_canceled(&self, booking: &Booking) -> Result<(), DispatchError>;
}

pub fn channel_name(host_id: Ulid) -> String {
    format!("host_{host_id}")
}

/// Parse `host_<ulid>` (case-insensitive prefix) back into a host id.
pub fn parse_channel(name: &str) -> Option<Ulid> {
    let rest = name.strip_prefix("host_").or_else(|| name.strip_prefix("HOST_"))?;
    Ulid::from_string(rest).ok()
}

/// Broadcast hub for LISTEN/NOTIFY per host.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a host. Creates the channel if needed.
    pub fn subscribe(&self, host_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(host_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a notice. Returns how many subscribers got it.
    pub fn send(&self, notice: Notice) -> usize {
        match self.channels.get(&notice.host_id) {
            Some(sender) => sender.send(notice).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop channels nobody listens on anymore.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Host channels are shared by every listener of a host, so the guest's
    /// tokens never go into the payload.
    fn publish(&self, kind: NoticeKind, booking: &Booking, reminders: &[u32]) {
        let payload = json!({
            "event": kind.as_str(),
            "booking_id": booking.id.to_string(),
            "host_id": booking.host_id.to_string(),
            "status": booking.status.as_str(),
            "start": booking.span.start,
            "end": booking.span.end,
            "timezone": booking.timezone,
            "guest_name": booking.guest.name,
            "guest_email": booking.guest.email,
            "reschedule_count": booking.reschedule_count,
            "reminders": reminders,
        });
        self.send(Notice {
            host_id: booking.host_id,
            kind,
            booking_id: booking.id,
            payload: payload.to_string(),
        });
    }
}

#[async_trait]
impl Dispatcher for NotifyHub {
    async fn send_created(
        &self,
        booking: &Booking,
        _tokens: &NoticeTokens,
        reminders: &[u32],
    ) -> Result<(), DispatchError> {
        self.publish(NoticeKind::Created, booking, reminders);
        Ok(())
    }

    async fn send_rescheduled(
        &self,
        booking: &Booking,
        _tokens: &NoticeTokens,
        reminders: &[u32],
    ) -> Result<(), DispatchError> {
        self.publish(NoticeKind::Rescheduled, booking, reminders);
        Ok(())
    }

    async fn send_canceled(&self, booking: &Booking) -> Result<(), DispatchError> {
        self.publish(NoticeKind::Canceled, booking, &[]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let host = Ulid::new();
        let mut rx = hub.subscribe(host);

        let notice = Notice {
            host_id: host,
            kind: NoticeKind::Created,
            booking_id: Ulid::new(),
            payload: "{}".into(),
        };
        assert_eq!(hub.send(notice.clone()), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, notice);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let host = Ulid::new();
        let delivered = hub.send(Notice {
            host_id: host,
            kind: NoticeKind::Canceled,
            booking_id: Ulid::new(),
            payload: "{}".into(),
        });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let host = Ulid::new();
        drop(hub.subscribe(host));
        hub.prune();
        assert!(hub.channels.is_empty());
    }

    #[test]
    fn channel_name_roundtrip() {
        let host = Ulid::new();
        assert_eq!(parse_channel(&channel_name(host)), Some(host));
        assert_eq!(parse_channel("resource_123"), None);
        assert_eq!(parse_channel("host_not-a-ulid"), None);
    }
}
