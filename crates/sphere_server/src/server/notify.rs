#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use sphere_domain::UserId;
use sphere_protocol::{OutboundEvent, encode_event};
use tracing::{debug, warn};

use crate::server::fanout::fan_out;
use crate::server::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
	Delivered,
	/// The user has no live notification channel; nothing was sent or kept.
	Offline,
	/// The channel existed but the frame could not be queued; the session was evicted.
	Failed,
}

/// Pushes user-targeted events over each user's notification channel.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
	registry: ConnectionRegistry,
	send_timeout: Duration,
	max_frame_bytes: usize,
}

impl NotificationDispatcher {
	pub fn new(registry: ConnectionRegistry, send_timeout: Duration, max_frame_bytes: usize) -> Self {
		Self {
			registry,
			send_timeout,
			max_frame_bytes,
		}
	}

	pub async fn notify(&self, user: &UserId, event: &OutboundEvent) -> NotifyOutcome {
		let Some(session) = self.registry.notification_channel_of(user).await else {
			debug!(user_id = %user, event = event.name(), "notify: user offline; dropping");
			metrics::counter!("sphere_server_notifications_total", "outcome" => "offline").increment(1);
			return NotifyOutcome::Offline;
		};

		let frame = match encode_event(event, self.max_frame_bytes) {
			Ok(f) => Arc::new(f),
			Err(e) => {
				warn!(user_id = %user, event = event.name(), error = %e, "notify: encode failed");
				metrics::counter!("sphere_server_notifications_total", "outcome" => "failed").increment(1);
				return NotifyOutcome::Failed;
			}
		};

		let report = fan_out(&self.registry, vec![session], frame, self.send_timeout).await;
		if report.delivered == 1 {
			metrics::counter!("sphere_server_notifications_total", "outcome" => "delivered").increment(1);
			NotifyOutcome::Delivered
		} else {
			metrics::counter!("sphere_server_notifications_total", "outcome" => "failed").increment(1);
			NotifyOutcome::Failed
		}
	}
}
