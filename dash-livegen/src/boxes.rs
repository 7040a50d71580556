use bytes::Buf;

use crate::Error;

pub const HEADER_SIZE: usize = 8;

/// Four-character box type tag.
pub type BoxType = [u8; 4];

pub struct BoxHeader {
	pub size: usize,
	pub kind: BoxType,
}

/// Parse the `[u32 size][4-byte type]` header at the start of `data`.
///
/// Segments produced by DASH packagers never use `largesize` or the
/// runs-to-EOF form, so any size below 8 is rejected outright.
pub fn header(data: &[u8]) -> Result<BoxHeader, Error> {
	if data.len() < HEADER_SIZE {
		return Err(Error::MalformedSegment(format!(
			"truncated box header: {} bytes left",
			data.len()
		)));
	}

	let mut peek = &data[..HEADER_SIZE];
	let size = peek.get_u32() as usize;
	let mut kind = [0u8; 4];
	peek.copy_to_slice(&mut kind);

	if size < HEADER_SIZE {
		return Err(Error::MalformedSegment(format!(
			"impossible box size {} for {}",
			size,
			type_str(&kind)
		)));
	}
	if size > data.len() {
		return Err(Error::MalformedSegment(format!(
			"box {} claims {} bytes but only {} left",
			type_str(&kind),
			size,
			data.len()
		)));
	}

	Ok(BoxHeader { size, kind })
}

/// Iterate over the sibling boxes stored back to back in `data`.
pub fn boxes(data: &[u8]) -> Boxes {
	Boxes { data, pos: 0 }
}

pub struct Boxes<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> Iterator for Boxes<'a> {
	type Item = Result<(BoxHeader, &'a [u8]), Error>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.pos >= self.data.len() {
			return None;
		}
		match header(&self.data[self.pos..]) {
			Ok(h) => {
				let raw = &self.data[self.pos..self.pos + h.size];
				self.pos += h.size;
				Some(Ok((h, raw)))
			}
			Err(e) => {
				// stop iterating after a parse error
				self.pos = self.data.len();
				Some(Err(e))
			}
		}
	}
}

pub fn read_u32(data: &[u8], pos: usize) -> Result<u32, Error> {
	check(data, pos, 4)?;
	Ok((&data[pos..pos + 4]).get_u32())
}

pub fn read_i32(data: &[u8], pos: usize) -> Result<i32, Error> {
	check(data, pos, 4)?;
	Ok((&data[pos..pos + 4]).get_i32())
}

pub fn read_u64(data: &[u8], pos: usize) -> Result<u64, Error> {
	check(data, pos, 8)?;
	Ok((&data[pos..pos + 8]).get_u64())
}

fn check(data: &[u8], pos: usize, len: usize) -> Result<(), Error> {
	if pos + len > data.len() {
		return Err(Error::MalformedSegment(format!(
			"read of {} bytes at {} past end of box ({} bytes)",
			len,
			pos,
			data.len()
		)));
	}
	Ok(())
}

/// Printable form of a box type for error messages.
pub fn type_str(kind: &BoxType) -> String {
	String::from_utf8_lossy(kind).into_owned()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_header() {
		let data = [0, 0, 0, 12, b's', b't', b'y', b'p', 1, 2, 3, 4];
		let h = header(&data).unwrap();
		assert_eq!(h.size, 12);
		assert_eq!(&h.kind, b"styp");
	}

	#[test]
	fn truncated_header() {
		assert!(header(&[0, 0, 0, 12, b's']).is_err());
	}

	#[test]
	fn impossible_size() {
		let data = [0, 0, 0, 4, b'f', b'r', b'e', b'e'];
		assert!(header(&data).is_err());
	}

	#[test]
	fn size_past_end() {
		let data = [0, 0, 0, 20, b'f', b'r', b'e', b'e', 0, 0];
		assert!(header(&data).is_err());
	}

	#[test]
	fn iterate_siblings() {
		let mut data = vec![0, 0, 0, 9, b'a', b'a', b'a', b'a', 7];
		data.extend_from_slice(&[0, 0, 0, 8, b'b', b'b', b'b', b'b']);
		let kinds: Vec<_> = boxes(&data).map(|b| b.unwrap().0.kind).collect();
		assert_eq!(kinds, vec![*b"aaaa", *b"bbbb"]);
	}

	#[test]
	fn read_helpers() {
		let data = [0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 2];
		assert_eq!(read_u32(&data, 0).unwrap(), 1);
		assert_eq!(read_i32(&data, 4).unwrap(), -1);
		assert_eq!(read_u64(&data, 8).unwrap(), 2);
		assert!(read_u64(&data, 12).is_err());
	}
}
