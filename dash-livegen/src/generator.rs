use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{fs, path};

use crate::config::{Config, MuxType};
use crate::mpd::{self, LiveAttrs, Mpd};
use crate::sink::FileWriter;
use crate::{muxer, segment, Error};

/// Minimal head start between starting up and the first publication.
const START_UP_DELAY_S: u64 = 1;
const MINIMUM_UPDATE_PERIOD: &str = "PT30M";
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Per-content-type media state derived from the MPD, the init segment
/// and the files on disk. Read-only once start-up is done.
#[derive(Debug)]
struct TrackMedia {
	content_type: String,
	rel_init_path: String,
	/// Media path with only `$Number$` left to substitute.
	rel_media_pattern: String,
	start_number: u64,
	seg_duration_s: u64,
	track_id: u32,
	/// Track timescale from the init segment.
	timescale: u64,
	first_number: u64,
	last_number: u64,
	/// tfdt of the first segment.
	start_tick: u64,
	/// End of the last segment still within the drift bound.
	end_tick: u64,
	end_number: u64,
}

impl TrackMedia {
	fn rel_media_path(&self, number: u64) -> String {
		self.rel_media_pattern.replace("$Number$", &number.to_string())
	}

	fn abs_media_path(&self, base_path: &Path, number: u64) -> PathBuf {
		base_path.join(self.rel_media_path(number))
	}
}

/// Drives the whole show: analyzes the source, republishes the MPD and
/// loops the media segments onto the sink in real time.
pub struct LiveGenerator {
	config: Config,
	base_path: PathBuf,
	mpd: Mpd,
	tracks: BTreeMap<String, TrackMedia>,
	writer: FileWriter,
	interrupted: Arc<AtomicBool>,

	muxed_init_path: Option<String>,
	muxed_media_pattern: Option<String>,

	mpd_start_number: u64,
	first_segment_in_loop: u64,
	last_segment_in_loop: u64,
	nr_segments_in_loop: u64,
	seg_duration_s: u64,
	loop_duration_s: u64,
}

impl LiveGenerator {
	pub async fn new(config: Config, interrupted: Arc<AtomicBool>) -> Result<Self, Error> {
		log::info!("starting dash-livegen version {}", env!("CARGO_PKG_VERSION"));

		let xml = fs::read_to_string(&config.mpd_file)
			.map_err(|e| Error::Config(format!("cannot read MPD {}: {}", config.mpd_file.display(), e)))?;
		let mpd = Mpd::parse(&xml)?;
		let base_path = config
			.mpd_file
			.parent()
			.unwrap_or_else(|| path::Path::new(""))
			.to_path_buf();
		let writer = FileWriter::new(
			&config.destination,
			config.webdav_user.as_deref(),
			config.webdav_password.as_deref(),
		)
		.await?;

		let mut generator = Self {
			config,
			base_path,
			mpd,
			tracks: BTreeMap::new(),
			writer,
			interrupted,
			muxed_init_path: None,
			muxed_media_pattern: None,
			mpd_start_number: 0,
			first_segment_in_loop: 0,
			last_segment_in_loop: 0,
			nr_segments_in_loop: 0,
			seg_duration_s: 0,
			loop_duration_s: 0,
		};
		generator.init_media().await?;
		generator.check_and_update_media_data()?;
		Ok(generator)
	}

	/// Analyze the MPD and the media files, and clean old output.
	async fn init_media(&mut self) -> Result<(), Error> {
		for set in &self.mpd.adaptation_sets {
			let rel_init_path = set.initialization_path();
			let abs_init_path = self.base_path.join(&rel_init_path);
			let init_data = fs::read(&abs_init_path).map_err(|e| {
				Error::Discovery(format!("cannot read init segment {}: {}", abs_init_path.display(), e))
			})?;
			let info = crate::init::inspect(&init_data)?;
			log::info!("{} trackID = {}", set.content_type, info.track_id);

			let rel_media_pattern = set.media_pattern();
			let (first_number, last_number) = segment_range(&set.content_type, &self.base_path, &rel_media_pattern)?;

			let track = TrackMedia {
				content_type: set.content_type.clone(),
				rel_init_path,
				rel_media_pattern,
				start_number: set.start_number,
				seg_duration_s: set.segment_duration_s()?,
				track_id: info.track_id,
				timescale: info.timescale,
				first_number,
				last_number,
				start_tick: 0,
				end_tick: 0,
				end_number: 0,
			};

			if self.config.mux_type == MuxType::None && !self.config.no_clean {
				self.writer.clean(&track.rel_init_path, &track.rel_media_pattern).await?;
			}
			log::debug!("{} data: {:?}", set.content_type, track);
			self.tracks.insert(set.content_type.clone(), track);
		}

		if self.config.mux_type != MuxType::None {
			let init_path = self
				.mpd
				.muxed_init_path()
				.ok_or_else(|| Error::Unsupported("multiplexing needs both audio and video adaptation sets".to_string()))?;
			let media_pattern = self
				.mpd
				.muxed_media_pattern()
				.ok_or_else(|| Error::Unsupported("multiplexing needs both audio and video adaptation sets".to_string()))?;
			if !self.config.no_clean {
				self.writer.clean(&init_path, &media_pattern).await?;
			}
			self.muxed_init_path = Some(init_path);
			self.muxed_media_pattern = Some(media_pattern);
		}
		Ok(())
	}

	/// Check every segment for timing deviations and pick the loop range.
	fn check_and_update_media_data(&mut self) -> Result<(), Error> {
		log::info!("checking all media segment durations for deviations");

		let mut first_number: Option<u64> = None;
		let mut start_number: Option<u64> = None;
		let mut seg_duration_s: Option<u64> = None;
		let mut last_good_segments = Vec::new();

		for track in self.tracks.values_mut() {
			match first_number {
				None => first_number = Some(track.first_number),
				Some(n) if n != track.first_number => {
					return Err(Error::Discovery(format!(
						"first segment number differs between tracks: {} vs {}",
						n, track.first_number
					)))
				}
				_ => {}
			}
			match start_number {
				None => start_number = Some(track.start_number),
				Some(n) if n != track.start_number => {
					return Err(Error::Discovery(format!(
						"startNumber differs between tracks: {} vs {}",
						n, track.start_number
					)))
				}
				_ => {}
			}
			match seg_duration_s {
				None => seg_duration_s = Some(track.seg_duration_s),
				Some(d) if d != track.seg_duration_s => {
					return Err(Error::Discovery(format!(
						"segment duration differs between tracks: {}s vs {}s",
						d, track.seg_duration_s
					)))
				}
				_ => {}
			}

			let seg_ticks = track.seg_duration_s * track.timescale;
			let max_diff_ticks = track.timescale / 10; // at most 100 ms drift at the wrap
			let mut end: Option<(u64, u64)> = None;

			for seg_nr in track.first_number..=track.last_number {
				let seg_path = track.abs_media_path(&self.base_path, seg_nr);
				let data = fs::read(&seg_path)
					.map_err(|e| Error::Discovery(format!("cannot read {}: {}", seg_path.display(), e)))?;
				let timing = segment::probe(&data)?;

				if seg_nr == track.first_number {
					track.start_tick = timing.tfdt;
					log::info!(
						"first {} segment is {} starting at time {:.3}s",
						track.content_type,
						seg_nr,
						timing.tfdt as f64 / track.timescale as f64
					);
				}

				let end_tick = timing.tfdt + timing.duration;
				let ideal_ticks = track.start_tick + (seg_nr - track.first_number + 1) * seg_ticks;
				if ideal_ticks.abs_diff(end_tick) < max_diff_ticks {
					end = Some((seg_nr, end_tick));
				}
			}

			let (end_number, end_tick) = end.ok_or_else(|| {
				Error::Discovery(format!("no segment of {} ends close enough to its ideal time", track.content_type))
			})?;
			track.end_number = end_number;
			track.end_tick = end_tick;
			log::info!(
				"last good {} segment is {}, end time {:.3}s",
				track.content_type,
				end_number,
				end_tick as f64 / track.timescale as f64
			);
			last_good_segments.push(end_number);
		}

		self.first_segment_in_loop = first_number.ok_or_else(|| Error::Discovery("no tracks in MPD".to_string()))?;
		self.mpd_start_number = start_number.ok_or_else(|| Error::Discovery("no tracks in MPD".to_string()))?;
		self.seg_duration_s = seg_duration_s.ok_or_else(|| Error::Discovery("no tracks in MPD".to_string()))?;
		self.last_segment_in_loop = last_good_segments
			.iter()
			.copied()
			.min()
			.ok_or_else(|| Error::Discovery("no tracks in MPD".to_string()))?;
		if self.last_segment_in_loop < self.first_segment_in_loop {
			return Err(Error::Discovery("no common loop range across tracks".to_string()));
		}
		self.nr_segments_in_loop = self.last_segment_in_loop - self.first_segment_in_loop + 1;
		self.loop_duration_s = self.nr_segments_in_loop * self.seg_duration_s;
		log::info!(
			"will loop segments {}-{} with loop time {}s",
			self.first_segment_in_loop,
			self.last_segment_in_loop,
			self.loop_duration_s
		);
		Ok(())
	}

	/// Publish the live MPD and init segments, then loop media segments
	/// until interrupted.
	pub async fn run(&mut self) -> Result<(), Error> {
		let start_time = wall_clock_s();
		let availability_start_time = start_time + START_UP_DELAY_S.max(self.config.adjust_ast_s);

		let live_mpd = self.process_mpd(availability_start_time)?;
		self.push_init_segments().await?;
		self.push_mpd(&live_mpd).await?;
		self.push_loop(start_time, availability_start_time).await
	}

	pub async fn close(&self) {
		self.writer.close().await;
	}

	fn process_mpd(&mut self, availability_start_time: u64) -> Result<String, Error> {
		let attrs = LiveAttrs {
			availability_start_time: make_timestamp(availability_start_time),
			time_shift_buffer_depth: make_duration_from_s(self.config.time_shift_buffer_depth_s),
			minimum_update_period: MINIMUM_UPDATE_PERIOD.to_string(),
		};

		if self.config.mux_type == MuxType::None {
			self.mpd.make_live(&attrs);
		} else {
			let tracks: Vec<(String, u32)> = self
				.tracks
				.iter()
				.map(|(content_type, track)| (content_type.clone(), track.track_id))
				.collect();
			self.mpd.make_live_multiplexed(&attrs, &tracks)?;
		}

		let target_namespace = self.config.fix_namespace.then_some(mpd::DEFAULT_DASH_NAMESPACE);
		self.mpd.serialize(target_namespace)
	}

	async fn push_init_segments(&self) -> Result<(), Error> {
		if self.config.mux_type == MuxType::None {
			for track in self.tracks.values() {
				let data = self.read_init(&track.rel_init_path)?;
				self.writer.put(&track.rel_init_path, data).await?;
			}
			return Ok(());
		}

		let audio = self.track("audio")?;
		let video = self.track("video")?;
		let audio_init = self.read_init(&audio.rel_init_path)?;
		let video_init = self.read_init(&video.rel_init_path)?;
		let muxed = muxer::MultiplexInits::new(&audio_init, &video_init)?.construct_muxed();
		let init_path = self.muxed_init_path.clone().expect("muxed paths are set when muxing");
		self.writer.put(&init_path, muxed).await
	}

	async fn push_mpd(&self, xml: &str) -> Result<(), Error> {
		let name = self
			.config
			.mpd_file
			.file_name()
			.and_then(|n| n.to_str())
			.ok_or_else(|| Error::Config(format!("bad MPD file name {}", self.config.mpd_file.display())))?;

		let name = if self.config.mux_type == MuxType::None {
			name.to_string()
		} else {
			let level = if self.config.mux_type == MuxType::Fragment {
				"fragment"
			} else {
				"sample"
			};
			log::info!("muxing media on {} level", level);
			match name.rsplit_once('.') {
				Some((base, ext)) => format!("{}_mux.{}", base, ext),
				None => format!("{}_mux", name),
			}
		};

		self.writer.put(&name, xml.as_bytes().to_vec()).await?;
		log::info!("MPD written to {}", name);
		Ok(())
	}

	async fn push_loop(&self, start_time: u64, availability_start_time: u64) -> Result<(), Error> {
		log::info!("starting segment push loop");
		let max_files = (self.config.time_shift_buffer_depth_s.div_ceil(self.seg_duration_s) + 2) as usize;
		log::debug!("keeping at most {} files per track", max_files);

		let mut files_on_disk: BTreeMap<String, VecDeque<String>> = BTreeMap::new();
		let mut in_seg_nr = self.first_segment_in_loop;
		let mut out_seg_nr = self.mpd_start_number;

		while !self.interrupted.load(Ordering::Relaxed) {
			let wraps = (in_seg_nr - self.first_segment_in_loop) / self.nr_segments_in_loop;
			let in_file_seg_nr = in_seg_nr - wraps * self.nr_segments_in_loop;
			let time_offset_s = wraps * self.loop_duration_s;
			let publish_time = start_time + (in_seg_nr - self.first_segment_in_loop + 1) * self.seg_duration_s;
			self.sleep_until(publish_time).await?;

			let mut outputs: BTreeMap<String, segment::RewrittenSegment> = BTreeMap::new();
			for (content_type, track) in &self.tracks {
				let seg_path = track.abs_media_path(&self.base_path, in_file_seg_nr);
				let data = fs::read(&seg_path)
					.map_err(|e| Error::Discovery(format!("cannot read {}: {}", seg_path.display(), e)))?;
				let rewrite = segment::SegmentRewrite {
					sequence_number: out_seg_nr as u32,
					tfdt_offset: tfdt_offset(track.start_tick, time_offset_s, track.timescale),
				};
				outputs.insert(content_type.clone(), rewrite.apply(&data)?);
			}

			if self.config.mux_type == MuxType::None {
				for (content_type, output) in &outputs {
					let track = &self.tracks[content_type];
					let rel_path = track.rel_media_path(out_seg_nr);
					self.writer.put(&rel_path, output.data.to_vec()).await?;
					let window = files_on_disk.entry(content_type.clone()).or_default();
					manage_files(&self.writer, window, rel_path, max_files).await?;
				}
			} else {
				let audio = outputs
					.get("audio")
					.ok_or_else(|| Error::Unsupported("missing audio track for multiplexing".to_string()))?;
				let video = outputs
					.get("video")
					.ok_or_else(|| Error::Unsupported("missing video track for multiplexing".to_string()))?;
				let mux = muxer::MultiplexMediaSegments::new(&audio.data, &video.data)?;
				let data = match self.config.mux_type {
					MuxType::Fragment => mux.mux_on_fragment_level(),
					MuxType::Sample => mux.mux_on_sample_level(),
					MuxType::None => unreachable!(),
				};
				let rel_path = self
					.muxed_media_pattern
					.as_ref()
					.expect("muxed paths are set when muxing")
					.replace("$Number$", &out_seg_nr.to_string());
				self.writer.put(&rel_path, data).await?;
				let window = files_on_disk.entry("mux".to_string()).or_default();
				manage_files(&self.writer, window, rel_path, max_files).await?;
			}

			let seg_avail_time = availability_start_time + (out_seg_nr - self.mpd_start_number + 1) * self.seg_duration_s;
			log::debug!(
				"wrote segment {} from {} to {}, {:.1}s before ideal time",
				in_seg_nr - self.first_segment_in_loop + 1,
				in_file_seg_nr,
				out_seg_nr,
				seg_avail_time as f64 - wall_clock()
			);

			in_seg_nr += 1;
			out_seg_nr += 1;
		}

		Err(Error::Interrupted)
	}

	/// Wait for the wall clock in short slices so an interrupt is noticed
	/// within 100 ms.
	async fn sleep_until(&self, publish_time: u64) -> Result<(), Error> {
		loop {
			if self.interrupted.load(Ordering::Relaxed) {
				return Err(Error::Interrupted);
			}
			let remaining = publish_time as f64 - wall_clock();
			if remaining <= 0.0 {
				return Ok(());
			}
			tokio::time::sleep(Duration::from_secs_f64(remaining.min(SLEEP_SLICE.as_secs_f64()))).await;
		}
	}

	fn track(&self, content_type: &str) -> Result<&TrackMedia, Error> {
		self.tracks
			.get(content_type)
			.ok_or_else(|| Error::Unsupported(format!("missing {} track for multiplexing", content_type)))
	}

	fn read_init(&self, rel_init_path: &str) -> Result<Vec<u8>, Error> {
		let abs_path = self.base_path.join(rel_init_path);
		fs::read(&abs_path).map_err(|e| Error::Discovery(format!("cannot read {}: {}", abs_path.display(), e)))
	}

	#[cfg(test)]
	fn loop_plan(&self) -> (u64, u64, u64, u64, u64) {
		(
			self.first_segment_in_loop,
			self.last_segment_in_loop,
			self.nr_segments_in_loop,
			self.seg_duration_s,
			self.loop_duration_s,
		)
	}
}

/// Find the contiguous range of media segments on disk.
fn segment_range(content_type: &str, base_path: &Path, rel_media_pattern: &str) -> Result<(u64, u64), Error> {
	let media_path = base_path.join(rel_media_pattern);
	let media_dir = media_path
		.parent()
		.map(Path::to_path_buf)
		.unwrap_or_else(|| base_path.to_path_buf());
	let file_pattern = media_path
		.file_name()
		.and_then(|n| n.to_str())
		.ok_or_else(|| Error::Config(format!("bad media pattern {}", rel_media_pattern)))?;
	let re = mpd::number_regex(file_pattern)?;

	let entries = fs::read_dir(&media_dir)
		.map_err(|e| Error::Discovery(format!("cannot list {}: {}", media_dir.display(), e)))?;
	let mut numbers = Vec::new();
	for entry in entries {
		let entry = entry.map_err(|e| Error::Discovery(e.to_string()))?;
		let name = entry.file_name();
		let Some(name) = name.to_str() else { continue };
		if let Some(caps) = re.captures(name) {
			let number: u64 = caps[1]
				.parse()
				.map_err(|e| Error::Discovery(format!("bad segment number in {}: {}", name, e)))?;
			numbers.push(number);
		}
	}
	numbers.sort_unstable();

	let (first, last) = match (numbers.first(), numbers.last()) {
		(Some(first), Some(last)) => (*first, *last),
		_ => {
			return Err(Error::Discovery(format!(
				"no {} media segments matching {}",
				content_type, rel_media_pattern
			)))
		}
	};
	for pair in numbers.windows(2) {
		if pair[1] != pair[0] + 1 {
			return Err(Error::Discovery(format!(
				"{} segment gap between {} and {}",
				content_type, pair[0], pair[1]
			)));
		}
	}

	log::info!("found {} segments {} - {}", content_type, first, last);
	Ok((first, last))
}

/// Rebase a track onto the service timeline: media time starts at zero
/// for the first loop, and every wrap advances by exactly the loop
/// duration, so the tracks cannot drift apart.
fn tfdt_offset(start_tick: u64, time_offset_s: u64, timescale: u64) -> i64 {
	(time_offset_s * timescale) as i64 - start_tick as i64
}

/// Push the new path and delete whatever fell out of the time-shift window.
async fn manage_files(
	writer: &FileWriter,
	files_on_disk: &mut VecDeque<String>,
	rel_path: String,
	max_files: usize,
) -> Result<(), Error> {
	files_on_disk.push_back(rel_path);
	while files_on_disk.len() > max_files {
		let old = files_on_disk.pop_front().expect("non-empty queue");
		writer.delete(&old).await?;
	}
	Ok(())
}

fn make_timestamp(t: u64) -> String {
	let time = chrono::DateTime::<chrono::Utc>::from_timestamp(t as i64, 0).expect("timestamp in range");
	time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn make_duration_from_s(seconds: u64) -> String {
	format!("PT{}S", seconds)
}

fn wall_clock_s() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before 1970")
		.as_secs()
}

fn wall_clock() -> f64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before 1970")
		.as_secs_f64()
}
