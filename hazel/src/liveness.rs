//! Periodic ping scheduling, the pending-ping counter, and the round-trip sample ring.
//!
//! Pings are tracked separately from the generic reliable [`crate::retransmit::RetransmitTable`]:
//! a ping that goes unacknowledged is not itself retried every 300ms. Instead a fresh ping is sent
//! on every 1500ms tick regardless of whether earlier ones are still outstanding, and it is the
//! *count* of simultaneously-outstanding pings — not a per-ping retry budget — that eventually
//! forces the connection closed. See DESIGN.md for why this departs from the generic retransmit path.

use core::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::HashMap;
use stakker::{FixedTimerKey, CX};

use crate::Endpoint;

pub const PING_INTERVAL: Duration = Duration::from_millis(1500);
pub const MAX_PENDING_PINGS: usize = 10;
const RTT_SAMPLES: usize = 5;

pub struct Liveness {
	timer: FixedTimerKey,
	pending: HashMap<u16, Instant>,
	rtt: [Duration; RTT_SAMPLES],
	next_sample: usize,
}

impl Default for Liveness {
	fn default() -> Self {
		Self {
			timer: FixedTimerKey::default(),
			pending: HashMap::default(),
			rtt: [Duration::ZERO; RTT_SAMPLES],
			next_sample: 0,
		}
	}
}

impl Liveness {
	/// Starts (or restarts) the repeating ping timer for the connection keyed by `key`. Each fire
	/// calls back into [`Endpoint::on_ping_tick`], which reschedules by calling this again.
	pub fn schedule(&mut self, cx: CX![Endpoint], key: SocketAddr) {
		let actor = cx.access_actor().clone();
		self.timer = cx.after(PING_INTERVAL, move |s| actor.apply(s, move |this, cx| this.on_ping_tick(cx, key)));
	}

	pub fn cancel<A>(&mut self, cx: &mut stakker::Cx<A>) {
		cx.timer_del(self.timer);
		self.timer = FixedTimerKey::default();
	}

	/// Records that a ping with `nonce` was just sent. Returns `false` if the pending count has
	/// now reached [`MAX_PENDING_PINGS`], in which case the caller must force-close.
	pub fn record_sent(&mut self, nonce: u16, now: Instant) -> bool {
		self.pending.insert(nonce, now);
		self.pending.len() < MAX_PENDING_PINGS
	}

	/// Records an acknowledgement for `nonce`, if it was a pending ping. Updates the RTT ring and
	/// returns whether `nonce` was in fact a ping (as opposed to a data-message nonce).
	pub fn record_ack(&mut self, nonce: u16, now: Instant) -> bool {
		let Some(sent_at) = self.pending.remove(&nonce) else { return false };

		self.rtt[self.next_sample] = now.saturating_duration_since(sent_at);
		self.next_sample = (self.next_sample + 1) % RTT_SAMPLES;

		true
	}

	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}

	/// The running mean of the 5-sample RTT ring, in whole milliseconds.
	pub fn mean_rtt_millis(&self) -> u64 {
		let total: u64 = self.rtt.iter().map(|d| d.as_millis() as u64).sum();
		total / RTT_SAMPLES as u64
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rtt_ring_reports_running_mean() {
		let mut live = Liveness::default();
		let base = Instant::now();

		for (nonce, rtt_ms) in [(1u16, 10u64), (2, 20), (3, 30), (4, 40), (5, 50)] {
			assert!(live.record_sent(nonce, base));
			assert!(live.record_ack(nonce, base + Duration::from_millis(rtt_ms)));
		}

		assert_eq!(live.mean_rtt_millis(), 30);
	}

	#[test]
	fn pending_count_caps_at_threshold() {
		let mut live = Liveness::default();
		let now = Instant::now();

		for nonce in 0..(MAX_PENDING_PINGS as u16 - 1) {
			assert!(live.record_sent(nonce, now));
		}

		assert!(!live.record_sent(MAX_PENDING_PINGS as u16 - 1, now));
		assert_eq!(live.pending_count(), MAX_PENDING_PINGS);
	}
}
