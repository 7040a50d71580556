use bytes::{BufMut, BytesMut};

use crate::boxes::{self, HEADER_SIZE};
use crate::{init, Error};

/// Box inventory of an init segment: the pieces the init muxer reassembles.
struct InitSegmentStructure {
	ftyp: Vec<u8>,
	mvhd: Vec<u8>,
	trex: Vec<u8>,
	trak: Vec<u8>,
}

impl InitSegmentStructure {
	fn parse(data: &[u8]) -> Result<Self, Error> {
		let mut ftyp = None;
		let mut mvhd = None;
		let mut trex = None;
		let mut trak = None;

		for item in boxes::boxes(data) {
			let (h, raw) = item?;
			match &h.kind {
				b"ftyp" => ftyp = Some(raw.to_vec()),
				b"moov" => {
					for child in boxes::boxes(&raw[HEADER_SIZE..]) {
						let (ch, craw) = child?;
						match &ch.kind {
							b"mvhd" => mvhd = Some(craw.to_vec()),
							b"trak" => trak = Some(craw.to_vec()),
							b"mvex" => {
								for grand in boxes::boxes(&craw[HEADER_SIZE..]) {
									let (gh, graw) = grand?;
									if &gh.kind == b"trex" {
										trex = Some(graw.to_vec());
									}
								}
							}
							_ => {}
						}
					}
				}
				_ => {}
			}
		}

		match (ftyp, mvhd, trex, trak) {
			(Some(ftyp), Some(mvhd), Some(trex), Some(trak)) => Ok(Self { ftyp, mvhd, trex, trak }),
			_ => Err(Error::MalformedSegment(
				"init segment missing ftyp, mvhd, trex or trak".to_string(),
			)),
		}
	}
}

/// Multiplex two init segments. ftyp and mvhd are taken from the first.
pub struct MultiplexInits {
	first: InitSegmentStructure,
	second: InitSegmentStructure,
}

impl MultiplexInits {
	pub fn new(first: &[u8], second: &[u8]) -> Result<Self, Error> {
		Ok(Self {
			first: InitSegmentStructure::parse(first)?,
			second: InitSegmentStructure::parse(second)?,
		})
	}

	/// Renumber the tracks so the muxed moov carries unique ids.
	pub fn set_track_ids(&mut self, first_id: u32, second_id: u32) -> Result<(), Error> {
		self.first.trak = init::set_track_id(&self.first.trak, first_id)?;
		self.second.trak = init::set_track_id(&self.second.trak, second_id)?;
		Ok(())
	}

	pub fn construct_muxed(&self) -> Vec<u8> {
		let mvex_size = HEADER_SIZE + self.first.trex.len() + self.second.trex.len();
		let moov_size =
			HEADER_SIZE + self.first.mvhd.len() + mvex_size + self.first.trak.len() + self.second.trak.len();

		let mut out = BytesMut::with_capacity(self.first.ftyp.len() + moov_size);
		out.extend_from_slice(&self.first.ftyp);
		out.put_u32(moov_size as u32);
		out.extend_from_slice(b"moov");
		out.extend_from_slice(&self.first.mvhd);
		out.put_u32(mvex_size as u32);
		out.extend_from_slice(b"mvex");
		out.extend_from_slice(&self.first.trex);
		out.extend_from_slice(&self.second.trex);
		out.extend_from_slice(&self.first.trak);
		out.extend_from_slice(&self.second.trak);
		out.to_vec()
	}
}

/// Box inventory of a media segment plus the location of every trun
/// data offset inside the traf.
struct MediaSegmentStructure {
	styp: Option<Vec<u8>>,
	moof: Vec<u8>,
	mdat: Vec<u8>,
	mfhd: Vec<u8>,
	traf: Vec<u8>,
	/// (position of data_offset within traf, current value)
	trun_offsets: Vec<(usize, i32)>,
}

impl MediaSegmentStructure {
	fn parse(data: &[u8]) -> Result<Self, Error> {
		let mut styp = None;
		let mut moof = None;
		let mut mdat = None;
		let mut mfhd = None;
		let mut traf = None;
		let mut trun_offsets = Vec::new();

		for item in boxes::boxes(data) {
			let (h, raw) = item?;
			match &h.kind {
				b"styp" => styp = Some(raw.to_vec()),
				b"mdat" => mdat = Some(raw.to_vec()),
				b"moof" => {
					moof = Some(raw.to_vec());
					for child in boxes::boxes(&raw[HEADER_SIZE..]) {
						let (ch, craw) = child?;
						match &ch.kind {
							b"mfhd" => mfhd = Some(craw.to_vec()),
							b"traf" => {
								traf = Some(craw.to_vec());
								trun_offsets = Self::parse_trun_offsets(craw)?;
							}
							_ => {}
						}
					}
				}
				_ => {}
			}
		}

		match (moof, mdat, mfhd, traf) {
			(Some(moof), Some(mdat), Some(mfhd), Some(traf)) => Ok(Self {
				styp,
				moof,
				mdat,
				mfhd,
				traf,
				trun_offsets,
			}),
			_ => Err(Error::MalformedSegment(
				"media segment missing moof, mdat, mfhd or traf".to_string(),
			)),
		}
	}

	fn parse_trun_offsets(traf: &[u8]) -> Result<Vec<(usize, i32)>, Error> {
		let mut offsets = Vec::new();
		let mut pos = HEADER_SIZE;
		while pos < traf.len() {
			let h = boxes::header(&traf[pos..])?;
			if &h.kind == b"trun" {
				let flags = boxes::read_u32(traf, pos + 8)? & 0x00ff_ffff;
				if flags & 0x1 != 0 {
					offsets.push((pos + 16, boxes::read_i32(traf, pos + 16)?));
				}
			}
			pos += h.size;
		}
		Ok(offsets)
	}

	fn traf_with_mod_offset(&self, delta: i32) -> Vec<u8> {
		let mut traf = self.traf.clone();
		for &(pos, value) in &self.trun_offsets {
			traf[pos..pos + 4].copy_from_slice(&(value + delta).to_be_bytes());
		}
		traf
	}
}

/// Multiplex two media segments. The styp is taken from the first.
pub struct MultiplexMediaSegments {
	first: MediaSegmentStructure,
	second: MediaSegmentStructure,
}

impl MultiplexMediaSegments {
	pub fn new(first: &[u8], second: &[u8]) -> Result<Self, Error> {
		Ok(Self {
			first: MediaSegmentStructure::parse(first)?,
			second: MediaSegmentStructure::parse(second)?,
		})
	}

	/// Interleave whole fragments: styp1 moof1 mdat1 moof2 mdat2.
	pub fn mux_on_fragment_level(&self) -> Vec<u8> {
		let mut out = BytesMut::new();
		if let Some(styp) = &self.first.styp {
			out.extend_from_slice(styp);
		}
		out.extend_from_slice(&self.first.moof);
		out.extend_from_slice(&self.first.mdat);
		out.extend_from_slice(&self.second.moof);
		out.extend_from_slice(&self.second.mdat);
		out.to_vec()
	}

	/// Merge into a single moof and mdat. The sample data is concatenated,
	/// so each trun data offset has to be re-aimed at where its samples
	/// land in the merged mdat.
	pub fn mux_on_sample_level(&self) -> Vec<u8> {
		let delta1 = self.second.traf.len() as i32;
		let delta2 = (self.first.traf.len() + self.first.mdat.len()) as i32 - 8;
		let traf1 = self.first.traf_with_mod_offset(delta1);
		let traf2 = self.second.traf_with_mod_offset(delta2);

		let moof_size = HEADER_SIZE + self.first.mfhd.len() + self.first.traf.len() + self.second.traf.len();
		let mdat_size = self.first.mdat.len() + self.second.mdat.len() - HEADER_SIZE;

		let mut out = BytesMut::new();
		if let Some(styp) = &self.first.styp {
			out.extend_from_slice(styp);
		}
		out.put_u32(moof_size as u32);
		out.extend_from_slice(b"moof");
		out.extend_from_slice(&self.first.mfhd);
		out.extend_from_slice(&traf1);
		out.extend_from_slice(&traf2);
		out.put_u32(mdat_size as u32);
		out.extend_from_slice(b"mdat");
		out.extend_from_slice(&self.first.mdat[HEADER_SIZE..]);
		out.extend_from_slice(&self.second.mdat[HEADER_SIZE..]);
		out.to_vec()
	}
}
