//! The per-peer connection state machine: `New -> AwaitingHello[Ack] -> Established -> Closed`.
//!
//! Owned by [`crate::Endpoint`] inside its `conns` map, one instance per remote endpoint. All
//! mutation happens from the endpoint actor's single-threaded event loop, so no connection is
//! ever touched by two handlers at once.

use core::net::SocketAddr;
use std::time::Instant;

use collections::bytes::{Cursor, Slice};
use log::warn;
use stakker::{Fwd, Ret, CX};
use utils::error::*;

use crate::liveness::Liveness;
use crate::retransmit::{RetransmitTable, Tick};
use crate::{message, packet, Endpoint};

/// Datagrams are never larger than this; used to size scratch encoding buffers.
const MAX_DATAGRAM: usize = 1500;
/// How many recently-received inbound reliable nonces feed the selective-ack mask.
const INBOUND_WINDOW: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Role {
	/// Awaits a HELLO as the first reliable packet from a new peer.
	Server,
	/// Issues the HELLO.
	Client,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
	New,
	AwaitingHelloAck,
	Established,
	Closed,
}

#[derive(Clone, Copy)]
pub enum ProtocolError {
	/// A codec error: a malformed packed integer, a truncated header or record.
	Codec,
	/// An unexpected HELLO, a version mismatch, or a HELLO after the handshake has completed.
	Handshake,
}

pub struct CloseEvent {
	pub forced: bool,
	pub reason: Option<u8>,
	pub message: Option<String>,
}

/// The connection's subscribable event callbacks. All default to unset; events raised before a
/// callback is registered are simply dropped, mirroring how a fresh event emitter has no listeners.
#[derive(Default)]
struct Events {
	message: Option<Fwd<(u8, Slice)>>,
	hello: Option<Fwd<Slice>>,
	connected: Option<Fwd<()>>,
	close: Option<Fwd<CloseEvent>>,
	error: Option<Fwd<ProtocolError>>,
}

/// The last [`INBOUND_WINDOW`] reliable nonces this connection has received, used to compute the
/// selective-ack mask. Reflects only nonces actually seen on this connection, never a global set.
#[derive(Default)]
struct InboundWindow {
	seen: [u16; INBOUND_WINDOW],
	len: usize,
	next: usize,
}

impl InboundWindow {
	fn contains(&self, nonce: u16) -> bool {
		self.seen[..self.len].contains(&nonce)
	}

	fn insert(&mut self, nonce: u16) {
		self.seen[self.next] = nonce;
		self.next = (self.next + 1) % INBOUND_WINDOW;
		self.len = (self.len + 1).min(INBOUND_WINDOW);
	}

	/// The mask for an inbound reliable nonce `n`: bit `i-1` is set iff `n - i` has not been seen,
	/// for `i` in `1..=8`. Subtraction wraps in `u16` space, which collapses to the same set lookup
	/// as the nonce's true mod-65535 space within this narrow a window.
	fn ack_mask(&self, n: u16) -> u8 {
		let mut mask = 0u8;

		for i in 1..=INBOUND_WINDOW as u16 {
			if !self.contains(n.wrapping_sub(i)) {
				mask |= 1 << (i - 1);
			}
		}

		mask
	}
}

fn encode<X>(f: impl FnOnce(Cursor) -> X) -> Box<[u8]> {
	let mut buf = vec![0u8; MAX_DATAGRAM];
	Cursor::vec(&mut buf, f);
	buf.into_boxed_slice()
}

pub struct Connection {
	remote: SocketAddr,
	role: Role,
	state: State,
	nonce: u16,
	/// The nonce of the in-flight HELLO, while awaiting its ack (client role only).
	hello_nonce: Option<u16>,
	retransmit: RetransmitTable,
	inbound: InboundWindow,
	liveness: Liveness,
	seen_hello: bool,
	connected: bool,
	events: Events,
}

impl Connection {
	pub fn new(remote: SocketAddr, role: Role) -> Self {
		Self {
			remote,
			role,
			state: State::New,
			nonce: 0,
			hello_nonce: None,
			retransmit: RetransmitTable::default(),
			inbound: InboundWindow::default(),
			liveness: Liveness::default(),
			seen_hello: false,
			connected: false,
			events: Events::default(),
		}
	}

	pub fn is_closed(&self) -> bool {
		self.state == State::Closed
	}

	pub fn is_connected(&self) -> bool {
		self.connected
	}

	pub fn mean_rtt_millis(&self) -> u64 {
		self.liveness.mean_rtt_millis()
	}

	pub fn on_message(&mut self, fwd: Fwd<(u8, Slice)>) {
		self.events.message = Some(fwd);
	}

	pub fn on_hello(&mut self, fwd: Fwd<Slice>) {
		self.events.hello = Some(fwd);
	}

	pub fn on_connected(&mut self, fwd: Fwd<()>) {
		self.events.connected = Some(fwd);
	}

	pub fn on_close(&mut self, fwd: Fwd<CloseEvent>) {
		self.events.close = Some(fwd);
	}

	pub fn on_error(&mut self, fwd: Fwd<ProtocolError>) {
		self.events.error = Some(fwd);
	}

	/// Increments the outbound nonce counter, wrapping modulo 65535 (65535 itself is skipped, a
	/// quirk inherited from the reference implementation's wire format).
	fn next_nonce(&mut self) -> u16 {
		self.nonce = ((self.nonce as u32 + 1) % 65535) as u16;
		self.nonce
	}

	fn send_ack(&self, io: &runtime::Io, nonce: u16, mask: u8) {
		let _ = io.resend(self.remote, encode(|c| {
			packet::write_ack(c, nonce, mask);
		}));
	}

	/// Client role: sends the HELLO reliably and transitions to `AwaitingHelloAck`. Fails
	/// synchronously (no state change) if called on anything but a fresh connection.
	pub fn connect(&mut self, cx: CX![Endpoint], io: &runtime::Io, version: u8, payload: &[u8]) -> Result {
		if self.state != State::New {
			warn!("connect() called on a connection that is not new");
			return Err(());
		}

		let nonce = self.next_nonce();
		let bytes = encode(|c| {
			packet::write_hello(c, nonce, version, payload);
		});

		self.state = State::AwaitingHelloAck;
		self.hello_nonce = Some(nonce);

		if self.retransmit.register(cx, io, self.remote, self.remote, nonce, bytes, None).is_err() {
			// No retry timer got scheduled for the HELLO; without a forced close here the
			// connection would sit in `AwaitingHelloAck` forever with nothing left to expire it.
			self.force_close(cx, io);
			return Err(());
		}

		Ok(())
	}

	pub fn send_normal(&mut self, io: &runtime::Io, records: &[(u8, Vec<u8>)]) -> Result<usize> {
		if self.is_closed() {
			return Err(());
		}

		let bytes = encode(|c| {
			let mut cursor = packet::write_normal(c);
			for (tag, payload) in records {
				let (next, _) = message::write_message(cursor, *tag, payload);
				cursor = next;
			}
		});

		let len = bytes.len();
		io.resend(self.remote, bytes)?;
		Ok(len)
	}

	pub fn send_reliable(&mut self, cx: CX![Endpoint], io: &runtime::Io, records: &[(u8, Vec<u8>)], completion: Option<Ret<Result<usize>>>) {
		if self.is_closed() {
			if let Some(ret) = completion {
				ret.ret(Err(()));
			}
			return;
		}

		let nonce = self.next_nonce();
		let bytes = encode(|c| {
			let mut cursor = packet::write_reliable(c, nonce);
			for (tag, payload) in records {
				let (next, _) = message::write_message(cursor, *tag, payload);
				cursor = next;
			}
		});

		// A transport failure here resolves `completion` with an error but does not close the
		// connection; only retransmit exhaustion does that.
		let _ = self.retransmit.register(cx, io, self.remote, self.remote, nonce, bytes, completion);
	}

	pub fn disconnect(&mut self, cx: CX![Endpoint], io: &runtime::Io, forced: bool, reason: Option<u8>, message: Option<String>, completion: Option<Ret<Result<usize>>>) {
		if self.is_closed() {
			warn!("disconnect() called on a connection that is already disconnected");
			if let Some(ret) = completion {
				ret.ret(Err(()));
			}
			return;
		}

		let bytes = if forced {
			encode(packet::write_disconnect_forced)
		} else {
			encode(|c| {
				packet::write_disconnect_graceful(c, reason.unwrap_or(0), message.as_deref());
			})
		};

		let len = bytes.len();
		let res = io.resend(self.remote, bytes);

		self.state = State::Closed;
		self.liveness.cancel(cx);
		self.retransmit.clear(cx);

		self.emit_close(CloseEvent { forced, reason: if forced { None } else { reason }, message: if forced { None } else { message } });

		if let Some(ret) = completion {
			ret.ret(res.map(|()| len));
		}
	}

	/// Forces the connection closed locally: cancels all timers, fails every pending reliable
	/// send, and sends a minimal forced DISCONNECT. Idempotent; a connection already closed is
	/// left untouched.
	pub fn force_close(&mut self, cx: CX![Endpoint], io: &runtime::Io) {
		if self.is_closed() {
			return;
		}

		self.state = State::Closed;
		self.liveness.cancel(cx);
		self.retransmit.clear(cx);

		let _ = io.resend(self.remote, encode(packet::write_disconnect_forced));

		self.emit_close(CloseEvent { forced: true, reason: None, message: None });
	}

	fn protocol_error(&mut self, cx: CX![Endpoint], io: &runtime::Io, kind: ProtocolError) {
		self.emit_error(kind);
		self.force_close(cx, io);
	}

	fn start_liveness(&mut self, cx: CX![Endpoint]) {
		self.liveness.schedule(cx, self.remote);
	}

	pub fn on_ping_tick(&mut self, cx: CX![Endpoint], io: &runtime::Io) {
		if self.is_closed() {
			return;
		}

		let nonce = self.next_nonce();

		let _ = io.resend(self.remote, encode(|c| {
			packet::write_ping(c, nonce);
		}));

		if !self.liveness.record_sent(nonce, Instant::now()) {
			self.force_close(cx, io);
			return;
		}

		self.liveness.schedule(cx, self.remote);
	}

	pub fn on_retransmit_tick(&mut self, cx: CX![Endpoint], io: &runtime::Io, nonce: u16) {
		if let Tick::Expired = self.retransmit.tick(cx, io, self.remote, self.remote, nonce) {
			self.force_close(cx, io);
		}
	}

	fn on_ack(&mut self, cx: CX![Endpoint], nonce: u16) {
		if !self.retransmit.ack(cx, nonce) {
			self.liveness.record_ack(nonce, Instant::now());
		}

		if self.hello_nonce == Some(nonce) && self.state == State::AwaitingHelloAck {
			self.hello_nonce = None;
			self.state = State::Established;
			self.connected = true;
			self.emit_connected();
			self.start_liveness(cx);
		}
	}

	fn dispatch_records(&self, body: &Slice) -> Result {
		message::for_each_message(body, |tag, payload| {
			self.emit_message(tag, payload);
			Ok(())
		})
	}

	pub fn on_datagram(&mut self, cx: CX![Endpoint], io: &runtime::Io, version: u8, buf: Slice) {
		if self.is_closed() {
			return;
		}

		let result = match packet::decode(&buf) {
			Ok(pkt) => self.on_packet(cx, io, version, pkt),
			Err(()) => Err(()),
		};

		if result.is_err() {
			self.protocol_error(cx, io, ProtocolError::Codec);
		}
	}

	fn on_packet(&mut self, cx: CX![Endpoint], io: &runtime::Io, version: u8, pkt: packet::Packet) -> Result {
		match self.state {
			State::New => self.on_new(cx, io, version, pkt),
			State::AwaitingHelloAck => self.on_awaiting_hello_ack(cx, pkt),
			State::Established => self.on_established(cx, io, pkt),
			State::Closed => Ok(()),
		}
	}

	/// Server role only: awaits the first reliable packet, which must be a well-formed HELLO.
	fn on_new(&mut self, cx: CX![Endpoint], io: &runtime::Io, version: u8, pkt: packet::Packet) -> Result {
		match pkt {
			packet::Packet::Hello { nonce, version: peer_version, payload } if peer_version == version && !self.seen_hello => {
				self.seen_hello = true;
				self.state = State::Established;

				self.send_ack(io, nonce, 0xFF);
				self.inbound.insert(nonce);
				self.emit_hello(payload);
				self.start_liveness(cx);

				Ok(())
			}
			packet::Packet::Ignored => Ok(()),
			_ => {
				self.protocol_error(cx, io, ProtocolError::Handshake);
				Ok(())
			}
		}
	}

	/// Client role only: awaits the ack for the HELLO it sent.
	fn on_awaiting_hello_ack(&mut self, cx: CX![Endpoint], pkt: packet::Packet) -> Result {
		match pkt {
			packet::Packet::Ack { nonce, .. } => {
				self.on_ack(cx, nonce);
				Ok(())
			}
			packet::Packet::Ignored => Ok(()),
			_ => Ok(()),
		}
	}

	fn on_established(&mut self, cx: CX![Endpoint], io: &runtime::Io, pkt: packet::Packet) -> Result {
		match pkt {
			packet::Packet::Normal(body) => self.dispatch_records(&body),
			packet::Packet::Reliable { nonce, body } => {
				let mask = self.inbound.ack_mask(nonce);
				self.inbound.insert(nonce);
				self.send_ack(io, nonce, mask);
				self.dispatch_records(&body)
			}
			packet::Packet::Ping { nonce } => {
				self.send_ack(io, nonce, 0);
				Ok(())
			}
			packet::Packet::Ack { nonce, .. } => {
				self.on_ack(cx, nonce);
				Ok(())
			}
			packet::Packet::Hello { .. } if self.role == Role::Server => {
				self.protocol_error(cx, io, ProtocolError::Handshake);
				Ok(())
			}
			packet::Packet::Disconnect(d) => {
				self.state = State::Closed;
				self.liveness.cancel(cx);
				self.retransmit.clear(cx);
				self.emit_close(CloseEvent { forced: !d.graceful, reason: d.reason, message: d.message });
				Ok(())
			}
			packet::Packet::Ignored | packet::Packet::Hello { .. } => Ok(()),
		}
	}

	fn emit_message(&self, tag: u8, payload: Slice) {
		if let Some(fwd) = &self.events.message {
			fwd.fwd((tag, payload));
		}
	}

	fn emit_hello(&self, payload: Slice) {
		if let Some(fwd) = &self.events.hello {
			fwd.fwd(payload);
		}
	}

	fn emit_connected(&self) {
		if let Some(fwd) = &self.events.connected {
			fwd.fwd(());
		}
	}

	fn emit_close(&self, ev: CloseEvent) {
		if let Some(fwd) = &self.events.close {
			fwd.fwd(ev);
		}
	}

	fn emit_error(&self, err: ProtocolError) {
		if let Some(fwd) = &self.events.error {
			fwd.fwd(err);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::net::UdpSocket;
	use std::rc::Rc;
	use std::time::Instant;

	use collections::bytes::Bytes;
	use stakker::{actor, Fwd, Stakker};

	use super::*;

	/// Spawns a real `Endpoint` actor bound to loopback so `Connection` methods taking `cx:
	/// CX![Endpoint]` can be driven directly, same harness as `retransmit`'s tests.
	fn setup() -> (Stakker, stakker::Actor<Endpoint>, SocketAddr, UdpSocket) {
		let mut stakker = Stakker::new(Instant::now());

		let bind: SocketAddr = "127.0.0.1:0".parse().expect("valid address");
		let ep = actor!(stakker, Endpoint::init(bind, 0, Fwd::new(|_| {})), Ret::new(|_| {}));

		let remote_sock = UdpSocket::bind("127.0.0.1:0").expect("can bind loopback socket");
		remote_sock.set_nonblocking(true).expect("can set nonblocking");
		let remote = remote_sock.local_addr().expect("bound socket has an address");

		(stakker, ep, remote, remote_sock)
	}

	fn hello_datagram(nonce: u16, version: u8) -> Slice {
		let mut buf = vec![0; 4];
		Cursor::vec(&mut buf, |c| {
			packet::write_hello(c, nonce, version, &[]);
		});

		let mut b = Bytes::new(buf.len());
		b.copy_from_slice(&buf);
		b.slice(..)
	}

	#[test]
	fn second_hello_force_closes_with_exactly_one_hello_event() {
		let (mut stakker, ep, remote, _remote_sock) = setup();

		ep.apply(&mut stakker, |this, cx| {
			let mut conn = Connection::new(remote, Role::Server);

			let hellos = Rc::new(RefCell::new(0));
			let hellos_seen = hellos.clone();
			conn.on_hello(Fwd::new(move |_| *hellos_seen.borrow_mut() += 1));

			let closed = Rc::new(RefCell::new(0));
			let closes_seen = closed.clone();
			conn.on_close(Fwd::new(move |_| *closes_seen.borrow_mut() += 1));

			conn.on_datagram(cx, &this.io, 0, hello_datagram(1, 0));
			assert!(!conn.is_closed());
			assert_eq!(*hellos.borrow(), 1);
			assert_eq!(*closed.borrow(), 0);

			conn.on_datagram(cx, &this.io, 0, hello_datagram(2, 0));
			assert!(conn.is_closed());
			assert_eq!(*hellos.borrow(), 1);
			assert_eq!(*closed.borrow(), 1);

			// Close is idempotent: further datagrams must not emit a second close.
			conn.on_datagram(cx, &this.io, 0, hello_datagram(3, 0));
			assert_eq!(*closed.borrow(), 1);
		});
	}

	#[test]
	fn hello_version_mismatch_force_closes_without_emitting_hello() {
		let (mut stakker, ep, remote, _remote_sock) = setup();

		ep.apply(&mut stakker, |this, cx| {
			let mut conn = Connection::new(remote, Role::Server);

			let hellos = Rc::new(RefCell::new(0));
			let hellos_seen = hellos.clone();
			conn.on_hello(Fwd::new(move |_| *hellos_seen.borrow_mut() += 1));

			// Connection expects version 0; the peer's HELLO claims version 5.
			conn.on_datagram(cx, &this.io, 0, hello_datagram(1, 5));

			assert!(conn.is_closed());
			assert_eq!(*hellos.borrow(), 0);
		});
	}

	#[test]
	fn inbound_window_computes_selective_ack_mask() {
		let mut w = InboundWindow::default();
		for n in [40u16, 42, 43] {
			w.insert(n);
		}

		// Nonce 43 arrives: mask is computed from {40, 42} seen, relative to 43.
		assert_eq!(w.ack_mask(43), 0xFA);
	}

	#[test]
	fn inbound_window_caps_at_eight_entries() {
		let mut w = InboundWindow::default();
		for n in 0..20u16 {
			w.insert(n);
		}

		assert!(w.contains(19));
		assert!(!w.contains(11));
		assert!(w.contains(12));
	}
}
