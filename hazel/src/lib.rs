//! A reliable messaging layer over UDP, wire-compatible with the Hazel-Networking protocol used
//! by several real-time multiplayer games.
//!
//! [`Endpoint`] is the actor that owns the socket and demultiplexes inbound datagrams by peer
//! address into a [`conn::Connection`] apiece. [`ConnectionHandle`] is the cheaply-cloneable,
//! caller-facing proxy into a single connection, in the same spirit as `net`'s `udp::Socket`.

mod codec;
mod conn;
mod liveness;
mod message;
mod packet;
mod retransmit;

use core::net::SocketAddr;
use std::net::UdpSocket;

use ahash::HashMap;
use collections::bytes::Slice;
use log::{error, warn};
use runtime::Io;
use stakker::{fwd_to, Actor, Fwd, Ret, CX};
use utils::error::*;

pub use conn::{CloseEvent, ProtocolError, Role};

use conn::Connection;

pub struct Endpoint {
	io: Io,
	version: u8,
	conns: HashMap<SocketAddr, Connection>,
	on_connection: Fwd<ConnectionHandle>,
}

impl Endpoint {
	/// Binds a UDP socket at `bind` and starts accepting inbound Hazel connections. Every
	/// connection this endpoint ever knows about - one it dialed via [`Endpoint::connect`], or one
	/// a peer opened by sending a HELLO to an unrecognised address - is announced once through
	/// `on_connection`.
	pub fn init(cx: CX![], bind: SocketAddr, version: u8, on_connection: Fwd<ConnectionHandle>) -> Option<Self> {
		let socket = UdpSocket::bind(bind).ok_or(|err| error!("Failed to bind UDP socket: {err}"))?;

		let read_fwd = fwd_to!([cx], on_datagram() as (SocketAddr, Slice));
		let io = Io::new(socket, read_fwd).ok_or(|err| error!("Failed to register socket: {err:?}"))?;

		Some(Self { io, version, conns: HashMap::default(), on_connection })
	}

	/// Dials `remote` as a client: sends a reliable HELLO carrying `payload` and returns a handle
	/// immediately. The handle's `connected`/`close` callbacks observe the handshake's outcome.
	///
	/// If a connection already occupies `remote` (an earlier, still-live `connect()`, or a peer
	/// that dialed in), it is force-closed first: otherwise its timers, keyed only by `remote`,
	/// would go on firing after being silently dropped and could misapply against the replacement.
	pub fn connect(&mut self, cx: CX![], remote: SocketAddr, payload: &[u8]) -> ConnectionHandle {
		if let Some(mut old) = self.conns.remove(&remote) {
			old.force_close(cx, &self.io);
		}

		let mut conn = Connection::new(remote, Role::Client);
		let _ = conn.connect(cx, &self.io, self.version, payload);

		self.conns.insert(remote, conn);

		self.handle(cx, remote)
	}

	fn handle(&self, cx: CX![], remote: SocketAddr) -> ConnectionHandle {
		ConnectionHandle { endpoint: cx.access_actor().clone(), remote }
	}

	fn on_datagram(&mut self, cx: CX![], remote: SocketAddr, buf: Slice) {
		if !self.conns.contains_key(&remote) {
			if buf.first().copied() != Some(packet::Tag::HELLO.byte()) {
				warn!("dropping unexpected packet from unknown peer {remote}");
				return;
			}

			self.conns.insert(remote, Connection::new(remote, Role::Server));
			self.on_connection.fwd(self.handle(cx, remote));
		}

		let Some(conn) = self.conns.get_mut(&remote) else { return };
		conn.on_datagram(cx, &self.io, self.version, buf);

		self.evict_if_closed(remote);
	}

	fn on_retransmit_tick(&mut self, cx: CX![], remote: SocketAddr, nonce: u16) {
		if let Some(conn) = self.conns.get_mut(&remote) {
			conn.on_retransmit_tick(cx, &self.io, nonce);
		}

		self.evict_if_closed(remote);
	}

	fn on_ping_tick(&mut self, cx: CX![], remote: SocketAddr) {
		if let Some(conn) = self.conns.get_mut(&remote) {
			conn.on_ping_tick(cx, &self.io);
		}

		self.evict_if_closed(remote);
	}

	fn evict_if_closed(&mut self, remote: SocketAddr) {
		if self.conns.get(&remote).is_some_and(Connection::is_closed) {
			self.conns.remove(&remote);
		}
	}

	fn do_send_normal(&mut self, remote: SocketAddr, records: Vec<(u8, Vec<u8>)>) -> Result<usize> {
		let conn = self.conns.get_mut(&remote).ok_or_else(|| warn!("send on an unknown connection {remote}"))?;
		conn.send_normal(&self.io, &records)
	}

	fn do_send_reliable(&mut self, cx: CX![], remote: SocketAddr, records: Vec<(u8, Vec<u8>)>, completion: Option<Ret<Result<usize>>>) {
		let Some(conn) = self.conns.get_mut(&remote) else {
			warn!("send on an unknown connection {remote}");
			if let Some(ret) = completion {
				ret.ret(Err(()));
			}
			return;
		};

		conn.send_reliable(cx, &self.io, &records, completion);
		self.evict_if_closed(remote);
	}

	fn do_disconnect(&mut self, cx: CX![], remote: SocketAddr, forced: bool, reason: Option<u8>, message: Option<String>, completion: Option<Ret<Result<usize>>>) {
		let Some(conn) = self.conns.get_mut(&remote) else {
			if let Some(ret) = completion {
				ret.ret(Err(()));
			}
			return;
		};

		conn.disconnect(cx, &self.io, forced, reason, message, completion);
		self.evict_if_closed(remote);
	}

	fn do_on_message(&mut self, remote: SocketAddr, fwd: Fwd<(u8, Slice)>) {
		if let Some(conn) = self.conns.get_mut(&remote) {
			conn.on_message(fwd);
		}
	}

	fn do_on_hello(&mut self, remote: SocketAddr, fwd: Fwd<Slice>) {
		if let Some(conn) = self.conns.get_mut(&remote) {
			conn.on_hello(fwd);
		}
	}

	fn do_on_connected(&mut self, remote: SocketAddr, fwd: Fwd<()>) {
		if let Some(conn) = self.conns.get_mut(&remote) {
			conn.on_connected(fwd);
		}
	}

	fn do_on_close(&mut self, remote: SocketAddr, fwd: Fwd<CloseEvent>) {
		if let Some(conn) = self.conns.get_mut(&remote) {
			conn.on_close(fwd);
		}
	}

	fn do_on_error(&mut self, remote: SocketAddr, fwd: Fwd<ProtocolError>) {
		if let Some(conn) = self.conns.get_mut(&remote) {
			conn.on_error(fwd);
		}
	}

	fn do_mean_rtt_millis(&self, remote: SocketAddr, ret: Ret<u64>) {
		let millis = self.conns.get(&remote).map_or(0, Connection::mean_rtt_millis);
		ret.ret(millis);
	}
}

/// A cheaply-cloneable handle to a single Hazel connection, proxying into the owning
/// [`Endpoint`] actor much like `net`'s `udp::Socket` proxies into its `Interface`.
#[derive(Clone)]
pub struct ConnectionHandle {
	endpoint: Actor<Endpoint>,
	remote: SocketAddr,
}

impl ConnectionHandle {
	pub fn remote(&self) -> SocketAddr {
		self.remote
	}

	/// Sends an unreliable datagram carrying one message record per `(tag, payload)` pair.
	pub fn send_normal(&self, records: Vec<(u8, Vec<u8>)>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint.defer(move |s| endpoint.apply(s, move |this, _cx| {
			if let Err(()) = this.do_send_normal(remote, records) {
				warn!("failed to send normal packet to {remote}");
			}
		}));
	}

	/// Sends a reliable datagram, retried every 300ms up to 10 times. `completion`, if given, is
	/// resolved with the number of bytes sent once acked, or the unit error on expiry.
	pub fn send_reliable(&self, records: Vec<(u8, Vec<u8>)>, completion: Option<Ret<Result<usize>>>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint
			.defer(move |s| endpoint.apply(s, move |this, cx| this.do_send_reliable(cx, remote, records, completion)));
	}

	/// Closes the connection. `forced`, when set, sends the minimal DISCONNECT form and ignores
	/// `reason`/`message`; otherwise sends the graceful form carrying the optional reason record.
	pub fn disconnect(&self, forced: bool, reason: Option<u8>, message: Option<String>, completion: Option<Ret<Result<usize>>>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint
			.defer(move |s| endpoint.apply(s, move |this, cx| this.do_disconnect(cx, remote, forced, reason, message, completion)));
	}

	/// Delivers the mean of the last five round-trip samples, in milliseconds, to `ret`.
	pub fn mean_rtt_millis(&self, ret: Ret<u64>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint.defer(move |s| endpoint.apply(s, move |this, _cx| this.do_mean_rtt_millis(remote, ret)));
	}

	/// Subscribes to every inbound message record, reliable or not, once the connection reaches
	/// `Established`.
	pub fn on_message(&self, fwd: Fwd<(u8, Slice)>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint.defer(move |s| endpoint.apply(s, move |this, _cx| this.do_on_message(remote, fwd)));
	}

	/// Subscribes to the server-role HELLO payload, fired once when a peer first connects.
	pub fn on_hello(&self, fwd: Fwd<Slice>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint.defer(move |s| endpoint.apply(s, move |this, _cx| this.do_on_hello(remote, fwd)));
	}

	/// Subscribes to the handshake completing, fired once the HELLO (or its ack) lands.
	pub fn on_connected(&self, fwd: Fwd<()>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint.defer(move |s| endpoint.apply(s, move |this, _cx| this.do_on_connected(remote, fwd)));
	}

	/// Subscribes to the connection closing, whether by a graceful or forced disconnect.
	pub fn on_close(&self, fwd: Fwd<CloseEvent>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint.defer(move |s| endpoint.apply(s, move |this, _cx| this.do_on_close(remote, fwd)));
	}

	/// Subscribes to protocol errors, each of which force-closes the connection immediately after.
	pub fn on_error(&self, fwd: Fwd<ProtocolError>) {
		let remote = self.remote;
		let endpoint = self.endpoint.clone();

		self.endpoint.defer(move |s| endpoint.apply(s, move |this, _cx| this.do_on_error(remote, fwd)));
	}
}
