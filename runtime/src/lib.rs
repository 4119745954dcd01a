extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::net::SocketAddr;
use core::time::Duration;
use std::io::{self, ErrorKind};
use std::net::UdpSocket;

use collections::bytes::{Cursor, Slice};
use log::error;
use stakker::Fwd;

mod rt;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{
		WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

/// Translate a `WouldBlock` I/O result into `Ok(None)`, and any other error into the unit error type, logging it.
fn would_block<X>(r: io::Result<X>) -> Result<Option<X>> {
	match r {
		Ok(x) => Ok(Some(x)),
		Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
		Err(err) => {
			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	fn log_stats(&self) {
		log::debug!("{} socket(s) still registered at shutdown", self.fds.len());
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0.. {
			let Poll { events, revents, .. } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				entry.flush_read()?;
			}

			if *revents & POLLOUT != 0 {
				entry.flush_write()?;
			};

			*events = POLLIN;

			if !entry.queue.is_empty() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

struct Entry {
	socket: UdpSocket,
	fwd: Fwd<(SocketAddr, Slice)>,
	queue: VecDeque<(SocketAddr, Box<[u8]>)>,
}

impl Entry {
	fn flush_read(&mut self) -> Result {
		loop {
			let mut buf = Slice::new(1500);

			let Some((n, from)) = would_block(self.socket.recv_from(&mut buf))? else { return Ok(()) };

			buf.truncate(n);
			self.fwd.fwd((from, buf));
		}
	}

	fn flush_write(&mut self) -> Result {
		assert!(!self.queue.is_empty());

		loop {
			let Some((addr, buf)) = self.queue.back() else { return Ok(()) };

			let Some(n) = would_block(self.socket.send_to(buf, addr))? else { return Ok(()) };

			if n != buf.len() {
				error!("Only sent {}/{} bytes to socket", n, buf.len());
				return Err(());
			}

			self.queue.pop_back();
		}
	}
}

/// A non-blocking UDP socket integrated into the runtime's poll loop.
///
/// Unlike a connected socket, every datagram carries the peer address it came from (or is destined to), so a single
/// `Io` can serve a demultiplexer fanning a socket out across many remote peers.
pub struct Io {
	inner: UdpSocket,
}

impl Io {
	pub fn new(inner: UdpSocket, fwd: Fwd<(SocketAddr, Slice)>) -> Result<Self> {
		inner.set_nonblocking(true).map_err(|err| error!("Failed to set socket non-blocking: {err}"))?;

		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry {
				socket: inner.try_clone().expect("socket can be duplicated"),
				fwd,
				queue: VecDeque::new(),
			});

			Ok(Self { inner })
		})
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.inner.local_addr().map_err(|err| error!("Failed to read local address: {err}"))
	}

	pub fn write<X>(&self, to: SocketAddr, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		self.enqueue(to, vec.into_boxed_slice())?;

		Ok(res)
	}

	/// Resends an already-encoded datagram verbatim, for retransmission of reliable packets.
	pub fn resend(&self, to: SocketAddr, bytes: Box<[u8]>) -> Result {
		self.enqueue(to, bytes)
	}

	fn enqueue(&self, to: SocketAddr, bytes: Box<[u8]>) -> Result {
		if would_block(self.inner.send_to(&bytes, to))?.is_none() {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front((to, bytes));
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(())
	}
}

impl Drop for Io {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
