//! Per-connection mapping from an outbound reliable nonce to its pending completion and timer.

use core::net::SocketAddr;
use std::time::Duration;

use ahash::HashMap;
use log::{debug, trace};
use runtime::Io;
use stakker::{FixedTimerKey, Ret, CX};
use utils::error::*;

use crate::Endpoint;

pub const RETRY_INTERVAL: Duration = Duration::from_millis(300);
pub const MAX_ATTEMPTS: u8 = 10;

/// A pending reliable send's one-shot completion: delivers the sent byte count on ack, or the
/// unit error on attempt exhaustion. `None` for sends with no caller-visible completion (the
/// handshake HELLO, whose outcome is instead observed through the `connected`/`close` events).
type Completion = Option<Ret<Result<usize>>>;

struct Entry {
	bytes: Box<[u8]>,
	attempts: u8,
	timer: FixedTimerKey,
	completion: Completion,
}

/// What happened when a retransmit timer fired.
pub enum Tick {
	/// The datagram was resent; the entry is still outstanding.
	Resent,
	/// `MAX_ATTEMPTS` were exhausted without an ack; the entry has been removed.
	Expired,
}

#[derive(Default)]
pub struct RetransmitTable {
	entries: HashMap<u16, Entry>,
}

impl RetransmitTable {
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn contains(&self, nonce: u16) -> bool {
		self.entries.contains_key(&nonce)
	}

	/// Sends `bytes` for the first time and registers it for retransmission under `nonce`. `key`
	/// identifies the owning connection in the endpoint's connection table, so the timer can find
	/// its way back after a deferral. `completion`, if given, is resolved on ack or expiry, or right
	/// away if this initial send fails at the transport layer.
	pub fn register(&mut self, cx: CX![Endpoint], io: &Io, remote: SocketAddr, key: SocketAddr, nonce: u16, bytes: Box<[u8]>, completion: Completion) -> Result {
		if io.resend(remote, bytes.clone()).is_err() {
			if let Some(completion) = completion {
				completion.ret(Err(()));
			}
			return Err(());
		}

		let timer = schedule_tick(cx, key, nonce);

		self.entries.insert(nonce, Entry { bytes, attempts: 1, timer, completion });

		Ok(())
	}

	/// Called when the retransmit timer for `nonce` fires.
	pub fn tick(&mut self, cx: CX![Endpoint], io: &Io, remote: SocketAddr, key: SocketAddr, nonce: u16) -> Tick {
		let Some(entry) = self.entries.get_mut(&nonce) else { return Tick::Expired };

		if entry.attempts >= MAX_ATTEMPTS {
			let entry = self.entries.remove(&nonce).expect("just checked present");
			debug!("reliable nonce {nonce:#06x} exceeded {MAX_ATTEMPTS} attempts");

			if let Some(completion) = entry.completion {
				completion.ret(Err(()));
			}

			return Tick::Expired;
		}

		entry.attempts += 1;
		trace!("retransmitting nonce {nonce:#06x}, attempt {}", entry.attempts);

		if let Err(()) = io.resend(remote, entry.bytes.clone()) {
			// A transport error on a single send is not fatal; the next tick tries again.
		}

		entry.timer = schedule_tick(cx, key, nonce);

		Tick::Resent
	}

	/// Cancels and removes the entry for `nonce`, resolving its completion with the size of the
	/// originally-sent datagram. Returns `false` for duplicate or unknown acks, which are no-ops.
	pub fn ack(&mut self, cx: CX![Endpoint], nonce: u16) -> bool {
		let Some(entry) = self.entries.remove(&nonce) else { return false };

		cx.timer_del(entry.timer);

		if let Some(completion) = entry.completion {
			completion.ret(Ok(entry.bytes.len()));
		}

		true
	}

	/// Cancels every outstanding timer and fails every pending completion, as happens on close.
	pub fn clear(&mut self, cx: CX![Endpoint]) {
		for (_, entry) in self.entries.drain() {
			cx.timer_del(entry.timer);

			if let Some(completion) = entry.completion {
				completion.ret(Err(()));
			}
		}
	}
}

fn schedule_tick(cx: CX![Endpoint], key: SocketAddr, nonce: u16) -> FixedTimerKey {
	let actor = cx.access_actor().clone();
	cx.after(RETRY_INTERVAL, move |s| actor.apply(s, move |this, cx| this.on_retransmit_tick(cx, key, nonce)))
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::net::UdpSocket;
	use std::rc::Rc;
	use std::time::Instant;

	use stakker::{actor, Fwd, Stakker};

	use super::*;
	use crate::Endpoint;

	/// Spawns a real `Endpoint` actor bound to loopback, plus a raw socket standing in for the
	/// remote peer so sent datagrams can be counted without a second full connection.
	fn setup() -> (Stakker, stakker::Actor<Endpoint>, SocketAddr, UdpSocket) {
		let mut stakker = Stakker::new(Instant::now());

		let bind: SocketAddr = "127.0.0.1:0".parse().expect("valid address");
		let ep = actor!(stakker, Endpoint::init(bind, 0, Fwd::new(|_| {})), Ret::new(|_| {}));

		let remote_sock = UdpSocket::bind("127.0.0.1:0").expect("can bind loopback socket");
		remote_sock.set_nonblocking(true).expect("can set nonblocking");
		let remote = remote_sock.local_addr().expect("bound socket has an address");

		(stakker, ep, remote, remote_sock)
	}

	fn drain_count(sock: &UdpSocket) -> usize {
		let mut buf = [0u8; 1500];
		let mut n = 0;

		while sock.recv_from(&mut buf).is_ok() {
			n += 1;
		}

		n
	}

	#[test]
	fn ack_before_first_tick_sends_exactly_once() {
		let (mut stakker, ep, remote, remote_sock) = setup();

		ep.apply(&mut stakker, |this, cx| {
			let mut table = RetransmitTable::default();
			table.register(cx, &this.io, remote, remote, 1, Box::from([0x01, 0x00, 0x01]), None).expect("send succeeds");

			assert_eq!(drain_count(&remote_sock), 1);

			assert!(table.ack(cx, 1));
			assert!(table.is_empty());

			// A duplicate ack for the same nonce is a no-op.
			assert!(!table.ack(cx, 1));
		});
	}

	#[test]
	fn unacked_send_retransmits_ten_times_then_expires() {
		let (mut stakker, ep, remote, remote_sock) = setup();

		ep.apply(&mut stakker, |this, cx| {
			let mut table = RetransmitTable::default();

			let outcome = Rc::new(RefCell::new(None));
			let recorded = outcome.clone();
			let completion = Ret::new(move |res| *recorded.borrow_mut() = Some(res));

			table
				.register(cx, &this.io, remote, remote, 7, Box::from([0x01, 0x00, 0x07]), Some(completion))
				.expect("send succeeds");

			let mut resent = 0;
			loop {
				match table.tick(cx, &this.io, remote, remote, 7) {
					Tick::Resent => resent += 1,
					Tick::Expired => break,
				}
			}

			assert_eq!(resent, MAX_ATTEMPTS as usize - 1);
			assert_eq!(drain_count(&remote_sock), MAX_ATTEMPTS as usize);
			assert_eq!(*outcome.borrow(), Some(Err(())));
			assert!(table.is_empty());
		});
	}
}
