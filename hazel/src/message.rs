use collections::bytes::{Cursor, Slice};
use log::warn;
use utils::endian::u16be;
use utils::error::*;

use crate::codec::checked_split;

/// Reads one Hazel message record (`u16 BE length`, `u8 tag`, `length` bytes of payload) off the
/// front of `s`. Returns the tag, a view over the payload sharing `s`'s allocation, and the number
/// of bytes consumed.
pub fn read_message(s: &Slice) -> Result<(u8, Slice, usize)> {
	if s.len() < 3 {
		warn!("hazel message record header truncated");
		return Err(());
	}

	let len = checked_split::<u16be>(s)?.get() as usize;
	let tag = checked_split::<u8>(s)?;

	if s.len() < len {
		warn!("hazel message record payload truncated");
		return Err(());
	}

	Ok((tag, s.split_slice(len), 3 + len))
}

/// Writes one Hazel message record, returning the cursor past the write and the number of bytes written.
pub fn write_message(cursor: Cursor, tag: u8, payload: &[u8]) -> (Cursor, usize) {
	let cursor = cursor.push(&u16be::from(payload.len() as u16)).push(&tag).push(payload);

	(cursor, size_of_message(payload.len()))
}

pub fn size_of_message(payload_len: usize) -> usize {
	3 + payload_len
}

/// Calls `f` with each record found in `s`, in order, until `s` is fully consumed.
///
/// `s` is consumed destructively (it shares the caller's underlying allocation); a malformed
/// trailing record is a fatal error for the whole batch.
pub fn for_each_message(s: &Slice, mut f: impl FnMut(u8, Slice) -> Result) -> Result {
	while !s.is_empty() {
		let (tag, payload, _) = read_message(s)?;
		f(tag, payload)?;
	}

	Ok(())
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
	fn message_round_trips() {
		let mut buf = vec![0; 32];
		Cursor::vec(&mut buf, |c| {
			write_message(c, 7, b"ab");
		});
		assert_eq!(buf, [0x00, 0x02, 0x07, b'a', b'b']);
		assert_eq!(buf.len(), size_of_message(2));

		let s = slice_of(&buf);
		let (tag, payload, consumed) = read_message(&s).unwrap();
		assert_eq!(tag, 7);
		assert_eq!(&*payload, b"ab");
		assert_eq!(consumed, 5);
	}

	#[test]
	fn record_multiplex_scenario() {
		// two records: {tag:7, "ab"}, {tag:9, ""}
		let bytes: &[u8] = &[0x00, 0x02, 0x07, 0x61, 0x62, 0x00, 0x00, 0x09];
		let s = slice_of(bytes);

		let mut seen = Vec::new();
		for_each_message(&s, |tag, payload| {
			seen.push((tag, payload.to_vec()));
			Ok(())
		})
		.unwrap();

		assert_eq!(seen, vec![(7, b"ab".to_vec()), (9, Vec::new())]);
	}
}
