use crate::boxes::{self, HEADER_SIZE};
use crate::Error;

/// Track metadata pulled out of an init segment.
///
/// Assumes the moov carries a single track, which is what DASH
/// content with one representation per adaptation set gives us.
#[derive(Debug, Clone, Copy)]
pub struct InitInfo {
	pub track_id: u32,
	pub timescale: u64,
}

/// Extract trackID and media timescale from an init segment.
pub fn inspect(data: &[u8]) -> Result<InitInfo, Error> {
	let layout = walk(data)?;

	let tkhd = layout
		.tkhd
		.first()
		.copied()
		.ok_or_else(|| Error::MalformedSegment("init segment without tkhd".to_string()))?;
	let mdhd = layout
		.mdhd
		.ok_or_else(|| Error::MalformedSegment("init segment without mdhd".to_string()))?;

	let track_id = boxes::read_u32(data, track_id_pos(data, tkhd)?)?;
	// timescale sits at a fixed offset behind the 32-bit creation and modification times
	let timescale = boxes::read_u32(data, mdhd + 20)? as u64;

	Ok(InitInfo { track_id, timescale })
}

/// Byte-exact copy of `data` with every tkhd trackID replaced by `track_id`.
///
/// Used when multiplexing two inits whose source tracks carry clashing ids.
pub fn set_track_id(data: &[u8], track_id: u32) -> Result<Vec<u8>, Error> {
	let layout = walk(data)?;
	if layout.tkhd.is_empty() {
		return Err(Error::MalformedSegment("no tkhd to rewrite".to_string()));
	}

	let mut output = data.to_vec();
	for tkhd in layout.tkhd {
		let pos = track_id_pos(data, tkhd)?;
		output[pos..pos + 4].copy_from_slice(&track_id.to_be_bytes());
	}
	Ok(output)
}

// trackID comes after creation and modification time, which double in width with version 1
fn track_id_pos(data: &[u8], tkhd: usize) -> Result<usize, Error> {
	let vflags = boxes::read_u32(data, tkhd + 8)?;
	let version = vflags >> 24;
	Ok(if version == 0 { tkhd + 20 } else { tkhd + 28 })
}

#[derive(Default)]
struct Layout {
	tkhd: Vec<usize>,
	mdhd: Option<usize>,
}

fn walk(data: &[u8]) -> Result<Layout, Error> {
	let mut layout = Layout::default();
	let mut pos = 0;
	while pos < data.len() {
		let h = boxes::header(&data[pos..])?;
		// a bare trak (as stored by the muxer) walks the same as one inside moov
		match &h.kind {
			b"moov" => walk_children(data, pos, h.size, "moov", &mut layout)?,
			b"trak" => walk_children(data, pos, h.size, "moov.trak", &mut layout)?,
			_ => {}
		}
		pos += h.size;
	}
	Ok(layout)
}

fn walk_children(data: &[u8], pos: usize, size: usize, path: &str, layout: &mut Layout) -> Result<(), Error> {
	let end = pos + size;
	let mut child = pos + HEADER_SIZE;
	while child < end {
		let h = boxes::header(&data[child..end])?;
		let child_path = format!("{}.{}", path, boxes::type_str(&h.kind));
		match child_path.as_str() {
			"moov.trak" | "moov.trak.mdia" => walk_children(data, child, h.size, &child_path, layout)?,
			"moov.trak.tkhd" => layout.tkhd.push(child),
			"moov.trak.mdia.mdhd" => layout.mdhd = Some(child),
			_ => {}
		}
		child += h.size;
	}
	Ok(())
}
