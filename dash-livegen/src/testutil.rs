//! Builders for synthetic ISO BMFF fixtures used by the unit tests.

use bytes::{BufMut, BytesMut};

pub fn plain_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
	let mut out = BytesMut::with_capacity(8 + payload.len());
	out.put_u32((8 + payload.len()) as u32);
	out.extend_from_slice(kind);
	out.extend_from_slice(payload);
	out.to_vec()
}

pub fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
	let mut body = BytesMut::with_capacity(4 + payload.len());
	body.put_u32((u32::from(version) << 24) | (flags & 0x00ff_ffff));
	body.extend_from_slice(payload);
	plain_box(kind, &body)
}

pub fn container(kind: &[u8; 4], children: &[&[u8]]) -> Vec<u8> {
	let payload: Vec<u8> = children.iter().flat_map(|c| c.iter().copied()).collect();
	plain_box(kind, &payload)
}

pub fn styp(brands: &[&[u8; 4]]) -> Vec<u8> {
	let payload: Vec<u8> = brands.iter().flat_map(|b| b.iter().copied()).collect();
	plain_box(b"styp", &payload)
}

pub fn ftyp() -> Vec<u8> {
	let mut payload = BytesMut::new();
	payload.extend_from_slice(b"iso6");
	payload.put_u32(1);
	payload.extend_from_slice(b"dash");
	plain_box(b"ftyp", &payload)
}

pub fn mvhd() -> Vec<u8> {
	full_box(b"mvhd", 0, 0, &[0u8; 96])
}

pub fn tkhd(track_id: u32) -> Vec<u8> {
	let mut payload = BytesMut::new();
	payload.put_u32(0); // creation_time
	payload.put_u32(0); // modification_time
	payload.put_u32(track_id);
	payload.extend_from_slice(&[0u8; 68]);
	full_box(b"tkhd", 0, 7, &payload)
}

pub fn tkhd_v1(track_id: u32) -> Vec<u8> {
	let mut payload = BytesMut::new();
	payload.put_u64(0); // creation_time
	payload.put_u64(0); // modification_time
	payload.put_u32(track_id);
	payload.extend_from_slice(&[0u8; 68]);
	full_box(b"tkhd", 1, 7, &payload)
}

pub fn mdhd(timescale: u32) -> Vec<u8> {
	let mut payload = BytesMut::new();
	payload.put_u32(0); // creation_time
	payload.put_u32(0); // modification_time
	payload.put_u32(timescale);
	payload.put_u32(0); // duration
	payload.put_u16(0x55c4); // language: und
	payload.put_u16(0);
	full_box(b"mdhd", 0, 0, &payload)
}

pub fn hdlr() -> Vec<u8> {
	let mut payload = BytesMut::new();
	payload.put_u32(0);
	payload.extend_from_slice(b"soun");
	payload.extend_from_slice(&[0u8; 12]);
	payload.put_u8(0);
	full_box(b"hdlr", 0, 0, &payload)
}

pub fn trex(track_id: u32) -> Vec<u8> {
	let mut payload = BytesMut::new();
	payload.put_u32(track_id);
	payload.put_u32(1); // default_sample_description_index
	payload.put_u32(0);
	payload.put_u32(0);
	payload.put_u32(0);
	full_box(b"trex", 0, 0, &payload)
}

pub fn init_segment(track_id: u32, timescale: u32) -> Vec<u8> {
	let mdia = container(b"mdia", &[&mdhd(timescale), &hdlr()]);
	let trak = container(b"trak", &[&tkhd(track_id), &mdia]);
	let mvex = container(b"mvex", &[&trex(track_id)]);
	let moov = container(b"moov", &[&mvhd(), &mvex, &trak]);
	[ftyp(), moov].concat()
}

pub fn init_segment_v1(track_id: u32, timescale: u32) -> Vec<u8> {
	let mdia = container(b"mdia", &[&mdhd(timescale), &hdlr()]);
	let trak = container(b"trak", &[&tkhd_v1(track_id), &mdia]);
	let mvex = container(b"mvex", &[&trex(track_id)]);
	let moov = container(b"moov", &[&mvhd(), &mvex, &trak]);
	[ftyp(), moov].concat()
}

pub fn mfhd(sequence_number: u32) -> Vec<u8> {
	full_box(b"mfhd", 0, 0, &sequence_number.to_be_bytes())
}

pub fn tfhd(track_id: u32) -> Vec<u8> {
	// default-base-is-moof, no optional fields
	full_box(b"tfhd", 0, 0x020000, &track_id.to_be_bytes())
}

pub fn tfdt_v0(base_media_decode_time: u32) -> Vec<u8> {
	full_box(b"tfdt", 0, 0, &base_media_decode_time.to_be_bytes())
}

pub fn tfdt_v1(base_media_decode_time: u64) -> Vec<u8> {
	full_box(b"tfdt", 1, 0, &base_media_decode_time.to_be_bytes())
}

pub fn trun(data_offset: Option<i32>, durations: Option<&[u32]>, sizes: Option<&[u32]>) -> Vec<u8> {
	let mut flags = 0u32;
	if data_offset.is_some() {
		flags |= 0x1;
	}
	if durations.is_some() {
		flags |= 0x100;
	}
	if sizes.is_some() {
		flags |= 0x200;
	}
	let count = durations.or(sizes).map(<[u32]>::len).unwrap_or(0);

	let mut payload = BytesMut::new();
	payload.put_u32(count as u32);
	if let Some(offset) = data_offset {
		payload.put_i32(offset);
	}
	for i in 0..count {
		if let Some(durations) = durations {
			payload.put_u32(durations[i]);
		}
		if let Some(sizes) = sizes {
			payload.put_u32(sizes[i]);
		}
	}
	full_box(b"trun", 0, flags, &payload)
}

pub fn mdat(payload: &[u8]) -> Vec<u8> {
	plain_box(b"mdat", payload)
}

/// A complete single-track media segment whose trun data offset points at the
/// first byte of the mdat payload.
pub fn media_segment(
	sequence_number: u32,
	track_id: u32,
	decode_time: u32,
	durations: &[u32],
	payload: &[u8],
) -> Vec<u8> {
	let mfhd = mfhd(sequence_number);
	let tfhd = tfhd(track_id);
	let tfdt = tfdt_v0(decode_time);
	// moof = 8 + mfhd + traf, traf = 8 + tfhd + tfdt + trun
	let trun_size = 8 + 4 + 4 + 4 + 4 * durations.len();
	let traf_size = 8 + tfhd.len() + tfdt.len() + trun_size;
	let moof_size = 8 + mfhd.len() + traf_size;
	let trun = trun(Some((moof_size + 8) as i32), Some(durations), None);
	let traf = container(b"traf", &[&tfhd, &tfdt, &trun]);
	let moof = container(b"moof", &[&mfhd, &traf]);
	assert_eq!(moof.len(), moof_size);

	[styp(&[b"msdh", b"msix"]), moof, mdat(payload)].concat()
}
