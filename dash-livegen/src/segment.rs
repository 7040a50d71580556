use std::io::Cursor;

use bytes::{BufMut, Bytes, BytesMut};
use mp4::ReadBox;

use crate::boxes::{self, HEADER_SIZE};
use crate::Error;

/// Timing read from a single media segment, in track ticks.
#[derive(Debug, Clone, Copy)]
pub struct SegmentTiming {
	pub tfdt: u64,
	/// Sum of the trun sample durations. Zero when the segment does not
	/// carry per-sample durations; only the drift validation consumes it.
	pub duration: u64,
}

/// Read tfdt and the summed sample durations out of a media segment.
pub fn probe(data: &[u8]) -> Result<SegmentTiming, Error> {
	for item in boxes::boxes(data) {
		let (h, raw) = item?;
		if &h.kind != b"moof" {
			continue;
		}

		let mut reader = Cursor::new(raw);
		let header = mp4::BoxHeader::read(&mut reader).map_err(|e| Error::MalformedSegment(e.to_string()))?;
		let moof = mp4::MoofBox::read_box(&mut reader, header.size).map_err(|e| Error::MalformedSegment(e.to_string()))?;

		let traf = moof
			.trafs
			.first()
			.ok_or_else(|| Error::MalformedSegment("moof without traf".to_string()))?;
		let tfdt = traf
			.tfdt
			.as_ref()
			.ok_or_else(|| Error::MalformedSegment("traf without tfdt".to_string()))?
			.base_media_decode_time;
		let duration = traf
			.trun
			.as_ref()
			.map(|trun| trun.sample_durations.iter().map(|&d| u64::from(d)).sum())
			.unwrap_or(0);

		return Ok(SegmentTiming { tfdt, duration });
	}

	Err(Error::MalformedSegment("no moof box in media segment".to_string()))
}

/// Rewrite of one media segment for live output.
///
/// Renumbers mfhd, shifts tfdt by `tfdt_offset` (promoting to a 64-bit
/// tfdt when the shifted value no longer fits in 32 bits), strips sidx
/// and the lmsg brand, and keeps every other byte as-is.
pub struct SegmentRewrite {
	pub sequence_number: u32,
	/// Signed shift applied to baseMediaDecodeTime, in track ticks.
	pub tfdt_offset: i64,
}

pub struct RewrittenSegment {
	pub data: Bytes,
	/// baseMediaDecodeTime after the shift.
	pub tfdt: u64,
}

impl SegmentRewrite {
	pub fn apply(&self, data: &[u8]) -> Result<RewrittenSegment, Error> {
		let mut filter = Filter {
			out: BytesMut::with_capacity(data.len() + 4),
			sequence_number: self.sequence_number,
			tfdt_offset: self.tfdt_offset,
			size_change: 0,
			tfdt: None,
		};

		for item in boxes::boxes(data) {
			let (h, raw) = item?;
			match &h.kind {
				b"styp" => filter.styp(raw),
				b"sidx" => {} // a live segment must not carry a segment index
				b"moof" => filter.container(raw, Level::Moof)?,
				_ => filter.copy(raw),
			}
		}

		let tfdt = filter
			.tfdt
			.ok_or_else(|| Error::MalformedSegment("media segment without tfdt".to_string()))?;

		Ok(RewrittenSegment {
			data: filter.out.freeze(),
			tfdt,
		})
	}
}

#[derive(Clone, Copy, PartialEq)]
enum Level {
	Moof,
	Traf,
}

struct Filter {
	out: BytesMut,
	sequence_number: u32,
	tfdt_offset: i64,
	size_change: u32,
	tfdt: Option<u64>,
}

impl Filter {
	fn copy(&mut self, raw: &[u8]) {
		self.out.extend_from_slice(raw);
	}

	/// Recurse into moof or traf; afterwards patch this box's size field
	/// if a tfdt below it grew.
	fn container(&mut self, raw: &[u8], level: Level) -> Result<(), Error> {
		let start = self.out.len();
		let change_before = self.size_change;
		self.copy(&raw[..HEADER_SIZE]);

		for item in boxes::boxes(&raw[HEADER_SIZE..]) {
			let (h, child) = item?;
			match (level, &h.kind) {
				(Level::Moof, b"mfhd") => self.mfhd(child),
				(Level::Moof, b"traf") => self.container(child, Level::Traf)?,
				(Level::Traf, b"tfdt") => self.tfdt(child)?,
				(Level::Traf, b"trun") => self.trun(child)?,
				_ => self.copy(child),
			}
		}

		let grown = self.size_change - change_before;
		if grown != 0 {
			let new_size = raw.len() as u32 + grown;
			self.out[start..start + 4].copy_from_slice(&new_size.to_be_bytes());
		}
		Ok(())
	}

	/// Repack styp without the lmsg brand.
	fn styp(&mut self, raw: &[u8]) {
		let mut brands = Vec::new();
		let mut pos = HEADER_SIZE;
		while pos + 4 <= raw.len() {
			let cell = &raw[pos..pos + 4];
			if cell != b"lmsg" {
				brands.push(cell);
			}
			pos += 4;
		}

		self.out.put_u32((HEADER_SIZE + 4 * brands.len()) as u32);
		self.out.extend_from_slice(b"styp");
		for brand in brands {
			self.out.extend_from_slice(brand);
		}
	}

	/// Overwrite the sequence number (the last four payload bytes).
	fn mfhd(&mut self, raw: &[u8]) {
		self.out.extend_from_slice(&raw[..raw.len() - 4]);
		self.out.put_u32(self.sequence_number);
	}

	/// Shift baseMediaDecodeTime, staying 32-bit when the new value fits.
	fn tfdt(&mut self, raw: &[u8]) -> Result<(), Error> {
		let version = *raw
			.get(HEADER_SIZE)
			.ok_or_else(|| Error::MalformedSegment("truncated tfdt".to_string()))?;

		if version == 0 {
			let base = boxes::read_u32(raw, 12)?;
			let new_time = shifted(u64::from(base), self.tfdt_offset)?;
			if new_time < 1 << 32 {
				self.out.extend_from_slice(&raw[..12]);
				self.out.put_u32(new_time as u32);
				self.out.extend_from_slice(&raw[16..]);
			} else {
				// no room in 32 bits: grow the box and switch to version 1
				self.size_change += 4;
				self.out.put_u32(raw.len() as u32 + 4);
				self.out.extend_from_slice(&raw[4..8]);
				self.out.put_u8(1);
				self.out.extend_from_slice(&raw[9..12]);
				self.out.put_u64(new_time);
				self.out.extend_from_slice(&raw[16..]);
			}
			self.tfdt = Some(new_time);
		} else {
			let base = boxes::read_u64(raw, 12)?;
			let new_time = shifted(base, self.tfdt_offset)?;
			self.out.extend_from_slice(&raw[..12]);
			self.out.put_u64(new_time);
			self.out.extend_from_slice(&raw[20..]);
			self.tfdt = Some(new_time);
		}
		Ok(())
	}

	/// Keep the data offset pointing at the first sample when the moof grew.
	fn trun(&mut self, raw: &[u8]) -> Result<(), Error> {
		let flags = boxes::read_u32(raw, 8)? & 0x00ff_ffff;
		if flags & 0x1 == 0 {
			self.copy(raw);
			return Ok(());
		}

		let offset = boxes::read_i32(raw, 16)?;
		self.out.extend_from_slice(&raw[..16]);
		self.out.put_i32(offset + self.size_change as i32);
		self.out.extend_from_slice(&raw[20..]);
		Ok(())
	}
}

fn shifted(base: u64, offset: i64) -> Result<u64, Error> {
	let new_time = i128::from(base) + i128::from(offset);
	u64::try_from(new_time)
		.map_err(|_| Error::MalformedSegment(format!("tfdt {} out of range after offset {}", base, offset)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testutil;

	// locate a (possibly nested) box by path, e.g. "moof.traf.trun"
	fn find_box<'a>(data: &'a [u8], path: &str) -> &'a [u8] {
		let mut scope = data;
		for name in path.split('.') {
			let mut found = None;
			let search = if std::ptr::eq(scope, data) { scope } else { &scope[8..] };
			for item in boxes::boxes(search) {
				let (h, raw) = item.unwrap();
				if boxes::type_str(&h.kind) == name {
					found = Some(raw);
					break;
				}
			}
			scope = found.unwrap_or_else(|| panic!("no {} box", name));
		}
		scope
	}

	#[test]
	fn probe_v0() {
		let seg = testutil::media_segment(1, 1, 96000, &[48000, 48000], b"samples");
		let timing = probe(&seg).unwrap();
		assert_eq!(timing.tfdt, 96000);
		assert_eq!(timing.duration, 96000);
	}

	#[test]
	fn probe_v1() {
		let trun = testutil::trun(None, Some(&[100, 200]), None);
		let traf = testutil::container(b"traf", &[&testutil::tfhd(1), &testutil::tfdt_v1(1 << 33), &trun]);
		let moof = testutil::container(b"moof", &[&testutil::mfhd(1), &traf]);
		let seg = [moof, testutil::mdat(b"x")].concat();

		let timing = probe(&seg).unwrap();
		assert_eq!(timing.tfdt, 1 << 33);
		assert_eq!(timing.duration, 300);
	}

	#[test]
	fn probe_without_durations() {
		let trun = testutil::trun(Some(0), None, Some(&[10, 20]));
		let traf = testutil::container(b"traf", &[&testutil::tfhd(1), &testutil::tfdt_v0(500), &trun]);
		let moof = testutil::container(b"moof", &[&testutil::mfhd(1), &traf]);

		let timing = probe(&moof).unwrap();
		assert_eq!(timing.tfdt, 500);
		assert_eq!(timing.duration, 0);
	}

	#[test]
	fn probe_needs_moof() {
		assert!(probe(&testutil::mdat(b"x")).is_err());
	}

	#[test]
	fn identity_keeps_bytes() {
		let seg = testutil::media_segment(7, 1, 96000, &[48000, 48000], b"samples");
		let rewrite = SegmentRewrite {
			sequence_number: 7,
			tfdt_offset: 0,
		};
		let out = rewrite.apply(&seg).unwrap();
		assert_eq!(out.data.as_ref(), seg.as_slice());
		assert_eq!(out.tfdt, 96000);
	}

	#[test]
	fn strips_sidx_and_lmsg() {
		let styp = testutil::styp(&[b"msdh", b"lmsg", b"msix"]);
		let sidx = testutil::plain_box(b"sidx", &[0u8; 24]);
		let trun = testutil::trun(None, Some(&[100]), None);
		let traf = testutil::container(b"traf", &[&testutil::tfhd(1), &testutil::tfdt_v0(0), &trun]);
		let moof = testutil::container(b"moof", &[&testutil::mfhd(4), &traf]);
		let mdat = testutil::mdat(b"payload");
		let seg = [styp, sidx, moof.clone(), mdat.clone()].concat();

		let rewrite = SegmentRewrite {
			sequence_number: 4,
			tfdt_offset: 0,
		};
		let out = rewrite.apply(&seg).unwrap();

		let expected = [testutil::styp(&[b"msdh", b"msix"]), moof, mdat].concat();
		assert_eq!(out.data.as_ref(), expected.as_slice());
	}

	#[test]
	fn renumbers_mfhd() {
		let seg = testutil::media_segment(1, 1, 0, &[100], b"x");
		let rewrite = SegmentRewrite {
			sequence_number: 1234,
			tfdt_offset: 0,
		};
		let out = rewrite.apply(&seg).unwrap();

		let mfhd = find_box(&out.data, "moof.mfhd");
		assert_eq!(boxes::read_u32(mfhd, 12).unwrap(), 1234);
	}

	#[test]
	fn shifts_tfdt_in_place() {
		let seg = testutil::media_segment(1, 1, 96000, &[48000], b"x");
		let rewrite = SegmentRewrite {
			sequence_number: 1,
			tfdt_offset: 48000,
		};
		let out = rewrite.apply(&seg).unwrap();

		assert_eq!(out.tfdt, 144000);
		assert_eq!(out.data.len(), seg.len());
		let tfdt = find_box(&out.data, "moof.traf.tfdt");
		assert_eq!(tfdt[8], 0);
		assert_eq!(boxes::read_u32(tfdt, 12).unwrap(), 144000);
	}

	#[test]
	fn negative_offset() {
		let seg = testutil::media_segment(1, 1, 1000, &[100], b"x");
		let rewrite = SegmentRewrite {
			sequence_number: 1,
			tfdt_offset: -400,
		};
		let out = rewrite.apply(&seg).unwrap();
		assert_eq!(out.tfdt, 600);
	}

	#[test]
	fn underflow_is_an_error() {
		let seg = testutil::media_segment(1, 1, 1000, &[100], b"x");
		let rewrite = SegmentRewrite {
			sequence_number: 1,
			tfdt_offset: -2000,
		};
		assert!(rewrite.apply(&seg).is_err());
	}

	#[test]
	fn promotes_to_64_bit() {
		let seg = testutil::media_segment(1, 1, 0xffff_ff00, &[100], b"payload");
		let old_moof = find_box(&seg, "moof");
		let old_trun = find_box(&seg, "moof.traf.trun");
		let old_offset = boxes::read_i32(old_trun, 16).unwrap();

		let rewrite = SegmentRewrite {
			sequence_number: 2,
			tfdt_offset: 0x200,
		};
		let out = rewrite.apply(&seg).unwrap();

		assert_eq!(out.tfdt, 0x1_0000_0100);
		assert_eq!(out.data.len(), seg.len() + 4);

		let moof = find_box(&out.data, "moof");
		assert_eq!(moof.len(), old_moof.len() + 4);
		let traf = find_box(&out.data, "moof.traf");
		let tfdt = find_box(&out.data, "moof.traf.tfdt");
		assert_eq!(tfdt[8], 1);
		assert_eq!(boxes::read_u64(tfdt, 12).unwrap(), 0x1_0000_0100);

		// the recorded sizes must equal the real byte lengths
		assert_eq!(boxes::read_u32(moof, 0).unwrap() as usize, moof.len());
		assert_eq!(boxes::read_u32(traf, 0).unwrap() as usize, traf.len());

		// and the data offset must still point at the first mdat payload byte
		let trun = find_box(&out.data, "moof.traf.trun");
		let new_offset = boxes::read_i32(trun, 16).unwrap();
		assert_eq!(new_offset, old_offset + 4);
		assert_eq!(new_offset as usize, moof.len() + 8);
	}

	#[test]
	fn version1_tfdt_stays_64_bit() {
		let trun = testutil::trun(None, Some(&[100]), None);
		let traf = testutil::container(b"traf", &[&testutil::tfhd(1), &testutil::tfdt_v1(1 << 40), &trun]);
		let moof = testutil::container(b"moof", &[&testutil::mfhd(9), &traf]);
		let seg = [moof.clone(), testutil::mdat(b"x")].concat();

		let rewrite = SegmentRewrite {
			sequence_number: 9,
			tfdt_offset: 1000,
		};
		let out = rewrite.apply(&seg).unwrap();

		assert_eq!(out.tfdt, (1 << 40) + 1000);
		assert_eq!(out.data.len(), seg.len());
		let tfdt = find_box(&out.data, "moof.traf.tfdt");
		assert_eq!(tfdt[8], 1);
	}
}
