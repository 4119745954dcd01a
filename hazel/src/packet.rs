//! The outer packet envelope: one tag byte, followed by a tag-specific body.

use collections::bytes::{Cursor, Slice};
use log::warn;
use utils::bytes::Cast;
use utils::endian::u16be;
use utils::error::*;

use crate::codec::{self, checked_split};
use crate::message;

#[derive(Clone, Copy, PartialEq, Eq, Cast)]
#[repr(C)]
pub struct Tag(u8);

impl Tag {
	pub const NORMAL: Self = Tag(0x00);
	pub const RELIABLE: Self = Tag(0x01);
	/// Reserved on the wire; silently ignored. Never produced by this implementation.
	pub const FRAGMENT: Self = Tag(0x05);
	pub const HELLO: Self = Tag(0x08);
	pub const DISCONNECT: Self = Tag(0x09);
	pub const ACKNOWLEDGEMENT: Self = Tag(0x0A);
	pub const PING: Self = Tag(0x0C);

	pub fn byte(self) -> u8 {
		self.0
	}
}

/// A decoded outer packet, with its tag-specific fields parsed but its message records left
/// for the caller to iterate lazily via [`message::for_each_message`].
pub enum Packet {
	Normal(Slice),
	Reliable { nonce: u16, body: Slice },
	Hello { nonce: u16, version: u8, payload: Slice },
	Disconnect(Disconnect),
	Ack { nonce: u16, mask: u8 },
	Ping { nonce: u16 },
	/// Reserved type 0x05, or any other byte not in the type set: ignored per spec.
	Ignored,
}

pub struct Disconnect {
	pub graceful: bool,
	pub reason: Option<u8>,
	pub message: Option<String>,
}

/// Parses the outer envelope of a single inbound datagram.
pub fn decode(s: &Slice) -> Result<Packet> {
	let tag = checked_split::<Tag>(s)?;

	Ok(match tag {
		Tag::NORMAL => Packet::Normal(s.split_slice(s.len())),
		Tag::RELIABLE => Packet::Reliable { nonce: read_nonce(s)?, body: s.split_slice(s.len()) },
		Tag::HELLO => {
			let nonce = read_nonce(s)?;
			let version = codec::read_u8(s)?;
			Packet::Hello { nonce, version, payload: s.split_slice(s.len()) }
		}
		Tag::DISCONNECT => Packet::Disconnect(decode_disconnect(s)?),
		Tag::ACKNOWLEDGEMENT => {
			let nonce = read_nonce(s)?;
			let mask = codec::read_u8(s)?;
			Packet::Ack { nonce, mask }
		}
		Tag::PING => Packet::Ping { nonce: read_nonce(s)? },
		Tag::FRAGMENT => Packet::Ignored,
		_ => Packet::Ignored,
	})
}

fn read_nonce(s: &Slice) -> Result<u16> {
	Ok(checked_split::<u16be>(s)?.get())
}

fn decode_disconnect(s: &Slice) -> Result<Disconnect> {
	if s.is_empty() {
		warn!("disconnect packet carried no flag byte");
		return Err(());
	}

	if s.len() == 1 {
		let _flag = codec::read_u8(s)?;
		return Ok(Disconnect { graceful: false, reason: None, message: None });
	}

	let graceful = codec::read_bool(s)?;

	if s.is_empty() {
		return Ok(Disconnect { graceful, reason: None, message: None });
	}

	let (_tag, record, _) = message::read_message(s)?;

	if record.is_empty() {
		warn!("disconnect reason record carried no reason byte");
		return Err(());
	}

	let reason = codec::read_u8(&record)?;
	let message = if !record.is_empty() { Some(codec::read_string(&record)?) } else { None };

	Ok(Disconnect { graceful, reason: Some(reason), message })
}

pub fn write_normal(cursor: Cursor) -> Cursor {
	cursor.push(&Tag::NORMAL)
}

pub fn write_reliable(cursor: Cursor, nonce: u16) -> Cursor {
	cursor.push(&Tag::RELIABLE).push(&u16be::from(nonce))
}

pub fn write_hello(cursor: Cursor, nonce: u16, version: u8, payload: &[u8]) -> Cursor {
	cursor.push(&Tag::HELLO).push(&u16be::from(nonce)).push(&version).push(payload)
}

pub fn write_ping(cursor: Cursor, nonce: u16) -> Cursor {
	cursor.push(&Tag::PING).push(&u16be::from(nonce))
}

pub fn write_ack(cursor: Cursor, nonce: u16, mask: u8) -> Cursor {
	cursor.push(&Tag::ACKNOWLEDGEMENT).push(&u16be::from(nonce)).push(&mask)
}

pub fn write_disconnect_forced(cursor: Cursor) -> Cursor {
	cursor.push(&Tag::DISCONNECT).push(&0u8)
}

/// The reason record's own message tag is unused by this protocol; disconnect reasons are
/// identified positionally (reason byte, then optional message), not by record tag.
const DISCONNECT_REASON_TAG: u8 = 0;

pub fn write_disconnect_graceful(cursor: Cursor, reason: u8, text: Option<&str>) -> Cursor {
	let mut payload = Vec::with_capacity(1 + text.map_or(0, codec::size_of_string));
	payload.push(reason);

	if let Some(t) = text {
		let mut buf = vec![0; codec::size_of_string(t)];
		Cursor::vec(&mut buf, |c| {
			codec::write_string(c, t);
		});
		payload.extend_from_slice(&buf);
	}

	let cursor = cursor.push(&Tag::DISCONNECT).push(&1u8);
	let (cursor, _) = message::write_message(cursor, DISCONNECT_REASON_TAG, &payload);
	cursor
}

pub fn size_of_disconnect_graceful(text: Option<&str>) -> usize {
	2 + message::size_of_message(1 + text.map_or(0, codec::size_of_string))
}

#[cfg(test)]
mod tests {
	use collections::bytes::Bytes;

	use super::*;

	fn slice_of(bytes: &[u8]) -> Slice {
		let mut b = Bytes::new(bytes.len());
		b.copy_from_slice(bytes);
		b.slice(..)
	}

	#[test]
	fn handshake_scenario() {
		let s = slice_of(&[0x08, 0x00, 0x01, 0x00]);

		match decode(&s).unwrap() {
			Packet::Hello { nonce, version, payload } => {
				assert_eq!(nonce, 1);
				assert_eq!(version, 0);
				assert!(payload.is_empty());
			}
			_ => panic!("expected hello"),
		}
	}

	#[test]
	fn ack_round_trips() {
		let mut buf = vec![0; 4];
		Cursor::vec(&mut buf, |c| {
			write_ack(c, 1, 0xFF);
		});
		assert_eq!(buf, [0x0A, 0x00, 0x01, 0xFF]);

		let s = slice_of(&buf);
		match decode(&s).unwrap() {
			Packet::Ack { nonce, mask } => {
				assert_eq!(nonce, 1);
				assert_eq!(mask, 0xFF);
			}
			_ => panic!("expected ack"),
		}
	}

	#[test]
	fn forced_disconnect_scenario() {
		let mut buf = vec![0; 2];
		Cursor::vec(&mut buf, |c| {
			write_disconnect_forced(c);
		});
		assert_eq!(buf, [0x09, 0x00]);

		let s = slice_of(&buf);
		match decode(&s).unwrap() {
			Packet::Disconnect(d) => {
				assert!(!d.graceful);
				assert!(d.reason.is_none());
			}
			_ => panic!("expected disconnect"),
		}
	}

	#[test]
	fn graceful_disconnect_with_reason_scenario() {
		let mut buf = vec![0; size_of_disconnect_graceful(Some("bye"))];
		Cursor::vec(&mut buf, |c| {
			write_disconnect_graceful(c, 4, Some("bye"));
		});
		assert_eq!(buf, [0x09, 0x01, 0x00, 0x05, DISCONNECT_REASON_TAG, 0x04, 0x03, b'b', b'y', b'e']);

		let s = slice_of(&buf);
		match decode(&s).unwrap() {
			Packet::Disconnect(d) => {
				assert!(d.graceful);
				assert_eq!(d.reason, Some(4));
				assert_eq!(d.message.as_deref(), Some("bye"));
			}
			_ => panic!("expected disconnect"),
		}
	}

	#[test]
	fn graceful_disconnect_without_reason_record_is_not_an_error() {
		// A peer may send the graceful flag with no trailing reason record at all.
		let s = slice_of(&[0x09, 0x01]);

		match decode(&s).unwrap() {
			Packet::Disconnect(d) => {
				assert!(d.graceful);
				assert!(d.reason.is_none());
				assert!(d.message.is_none());
			}
			_ => panic!("expected disconnect"),
		}
	}
}
