#![forbid(unsafe_code)]

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::server::registry::{ConnectionRegistry, DeliveryError, OutboundFrame, SessionHandle};

/// Per-call delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
	pub delivered: usize,
	pub failed: usize,
}

/// Enqueue `frame` to every recipient concurrently.
///
/// A recipient whose queue is closed or stays full past `send_timeout` is evicted;
/// the rest still receive the frame.
pub async fn fan_out(
	registry: &ConnectionRegistry,
	recipients: Vec<SessionHandle>,
	frame: OutboundFrame,
	send_timeout: Duration,
) -> FanoutReport {
	if recipients.is_empty() {
		return FanoutReport::default();
	}

	let sends = recipients.into_iter().map(|recipient| {
		let frame = frame.clone();
		async move {
			let res = recipient.deliver(frame, send_timeout).await;
			(recipient, res)
		}
	});

	let mut report = FanoutReport::default();
	for (recipient, res) in join_all(sends).await {
		match res {
			Ok(()) => report.delivered += 1,
			Err(e) => {
				report.failed += 1;
				match e {
					DeliveryError::Closed => {
						debug!(conn_id = %recipient.id(), "fanout: recipient queue closed; evicting");
					}
					DeliveryError::TimedOut(_) => {
						metrics::counter!("sphere_server_slow_consumer_evictions_total").increment(1);
						warn!(conn_id = %recipient.id(), error = %e, "fanout: slow consumer; evicting");
					}
				}
				registry.evict(recipient.id()).await;
			}
		}
	}

	metrics::counter!("sphere_server_frames_delivered_total").increment(report.delivered as u64);
	if report.failed > 0 {
		metrics::counter!("sphere_server_frames_failed_total").increment(report.failed as u64);
	}

	report
}
