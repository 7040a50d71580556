//! Parse a VoD MPD and rewrite it into its live counterpart.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::Error;

pub const DEFAULT_DASH_NAMESPACE: &str = "urn:mpeg:dash:schema:mpd:2011";

/// Attributes stamped onto the MPD element by the live rewrite.
pub struct LiveAttrs {
	pub availability_start_time: String,
	pub time_shift_buffer_depth: String,
	pub minimum_update_period: String,
}

#[derive(Debug, Clone)]
pub struct Representation {
	pub id: String,
	pub bandwidth: String,
}

#[derive(Debug, Clone)]
pub struct AdaptationSet {
	pub content_type: String,
	pub initialization: String,
	pub media: String,
	pub start_number: u64,
	/// SegmentTemplate duration, in SegmentTemplate timescale ticks.
	pub duration: u64,
	pub timescale: u64,
	pub representation: Representation,
}

impl AdaptationSet {
	fn parse(el: &Element) -> Result<Self, Error> {
		let content_type = match attr(el, "contentType") {
			Some(ct) if !ct.is_empty() => ct.to_string(),
			_ => return Err(Error::Config("no contentType for adaptation set".to_string())),
		};

		let template = children_named(el, "SegmentTemplate")
			.next()
			.ok_or_else(|| Error::Config(format!("no SegmentTemplate for content type {}", content_type)))?;
		let initialization = required_attr(template, "initialization", &content_type)?;
		let media = required_attr(template, "media", &content_type)?;
		if !media.contains("$Number$") {
			return Err(Error::Config(format!(
				"media pattern for {} carries no $Number$",
				content_type
			)));
		}
		let start_number = parse_number(&required_attr(template, "startNumber", &content_type)?)?;
		if start_number < 1 {
			return Err(Error::Config(format!("startNumber {} below 1", start_number)));
		}
		let duration = parse_number(&required_attr(template, "duration", &content_type)?)?;
		let timescale = match attr(template, "timescale") {
			Some(ts) => parse_number(ts)?,
			None => 1,
		};

		let mut representations = children_named(el, "Representation");
		let representation = match (representations.next(), representations.next()) {
			(Some(rep), None) => Representation {
				id: required_attr(rep, "id", &content_type)?,
				bandwidth: required_attr(rep, "bandwidth", &content_type)?,
			},
			(Some(_), Some(_)) => {
				let count = 2 + representations.count();
				return Err(Error::Unsupported(format!(
					"{} representations for content type {}, only one supported",
					count, content_type
				)));
			}
			(None, _) => {
				return Err(Error::Unsupported(format!(
					"no representation for content type {}",
					content_type
				)))
			}
		};

		Ok(Self {
			content_type,
			initialization,
			media,
			start_number,
			duration,
			timescale,
			representation,
		})
	}

	pub fn initialization_path(&self) -> String {
		self.initialization
			.replace("$RepresentationID$", &self.representation.id)
			.replace("$Bandwidth$", &self.representation.bandwidth)
	}

	/// Media path with everything but `$Number$` substituted.
	pub fn media_pattern(&self) -> String {
		self.media
			.replace("$RepresentationID$", &self.representation.id)
			.replace("$Bandwidth$", &self.representation.bandwidth)
	}

	pub fn media_path(&self, number: u64) -> String {
		self.media_pattern().replace("$Number$", &number.to_string())
	}

	/// Segment duration in whole seconds.
	pub fn segment_duration_s(&self) -> Result<u64, Error> {
		if self.timescale == 0 || self.duration == 0 || self.duration % self.timescale != 0 {
			return Err(Error::Config(format!(
				"segment duration {}/{} for {} is not a whole number of seconds",
				self.duration, self.timescale, self.content_type
			)));
		}
		Ok(self.duration / self.timescale)
	}
}

/// The manifest: the parsed model plus the element tree the live
/// rewrites operate on.
pub struct Mpd {
	root: Element,
	pub namespace: String,
	pub media_presentation_duration_s: u64,
	pub adaptation_sets: Vec<AdaptationSet>,
	muxed_rep: Option<String>,
}

impl Mpd {
	pub fn parse(xml: &str) -> Result<Self, Error> {
		let root = parse_tree(xml)?;
		if local_name(&root.name) != "MPD" {
			return Err(Error::Config(format!("root element is {}, not MPD", root.name)));
		}
		let namespace = attr(&root, "xmlns").unwrap_or_default().to_string();
		let media_presentation_duration_s = match attr(&root, "mediaPresentationDuration") {
			Some(duration) => duration_to_seconds(duration)?,
			None => 0,
		};

		let mut adaptation_sets: Vec<AdaptationSet> = Vec::new();
		for period in children_named(&root, "Period") {
			for set in children_named(period, "AdaptationSet") {
				let parsed = AdaptationSet::parse(set)?;
				if adaptation_sets.iter().any(|a| a.content_type == parsed.content_type) {
					return Err(Error::Config(format!(
						"duplicate content type {} in MPD",
						parsed.content_type
					)));
				}
				adaptation_sets.push(parsed);
			}
		}

		let audio = adaptation_sets.iter().find(|a| a.content_type == "audio");
		let video = adaptation_sets.iter().find(|a| a.content_type == "video");
		let muxed_rep = match (audio, video) {
			(Some(a), Some(v)) => Some(format!("{}_{}", a.representation.id, v.representation.id)),
			_ => None,
		};

		Ok(Self {
			root,
			namespace,
			media_presentation_duration_s,
			adaptation_sets,
			muxed_rep,
		})
	}

	pub fn muxed_representation_id(&self) -> Option<&str> {
		self.muxed_rep.as_deref()
	}

	/// Init path of the muxed representation, derived from the video template.
	pub fn muxed_init_path(&self) -> Option<String> {
		let muxed = self.muxed_rep.as_deref()?;
		let video = self.adaptation_sets.iter().find(|a| a.content_type == "video")?;
		Some(video.initialization.replace("$RepresentationID$", muxed))
	}

	/// Media pattern of the muxed representation, `$Number$` kept.
	pub fn muxed_media_pattern(&self) -> Option<String> {
		let muxed = self.muxed_rep.as_deref()?;
		let video = self.adaptation_sets.iter().find(|a| a.content_type == "video")?;
		Some(video.media.replace("$RepresentationID$", muxed))
	}

	/// Turn the manifest dynamic: stamp the live attributes, drop the
	/// presentation duration and reset every period start.
	pub fn make_live(&mut self, attrs: &LiveAttrs) {
		set_attr(&mut self.root, "type", "dynamic");
		set_attr(&mut self.root, "availabilityStartTime", &attrs.availability_start_time);
		set_attr(&mut self.root, "timeShiftBufferDepth", &attrs.time_shift_buffer_depth);
		set_attr(&mut self.root, "minimumUpdatePeriod", &attrs.minimum_update_period);
		remove_attr(&mut self.root, "mediaPresentationDuration");

		for node in self.root.children.iter_mut() {
			if let Node::Element(child) = node {
				if local_name(&child.name) == "Period" {
					set_attr(child, "start", "PT0S");
				}
			}
		}
	}

	/// Live rewrite plus folding the audio adaptation set into the video one.
	pub fn make_live_multiplexed(&mut self, attrs: &LiveAttrs, tracks: &[(String, u32)]) -> Result<(), Error> {
		self.make_live(attrs);

		let muxed_rep = self
			.muxed_rep
			.clone()
			.ok_or_else(|| Error::Unsupported("multiplexing needs both audio and video adaptation sets".to_string()))?;

		for node in self.root.children.iter_mut() {
			let Node::Element(period) = node else { continue };
			if local_name(&period.name) != "Period" {
				continue;
			}

			let mut audio_idx = None;
			let mut video_idx = None;
			for (i, child) in period.children.iter().enumerate() {
				let Node::Element(e) = child else { continue };
				if local_name(&e.name) != "AdaptationSet" {
					continue;
				}
				match attr(e, "contentType") {
					Some("audio") => audio_idx = Some(i),
					Some("video") => video_idx = Some(i),
					_ => {}
				}
			}
			let (Some(audio_idx), Some(video_idx)) = (audio_idx, video_idx) else {
				continue;
			};

			let audio_codecs = match &period.children[audio_idx] {
				Node::Element(audio) => children_named(audio, "Representation")
					.next()
					.and_then(|rep| attr(rep, "codecs"))
					.map(str::to_string),
				Node::Text(_) => None,
			};

			if let Node::Element(video) = &mut period.children[video_idx] {
				for (content_type, track_id) in tracks.iter().rev() {
					let component = Element {
						name: "ContentComponent".to_string(),
						attrs: vec![
							("id".to_string(), track_id.to_string()),
							("contentType".to_string(), content_type.clone()),
						],
						children: Vec::new(),
					};
					video.children.insert(0, Node::Element(component));
				}
				remove_attr(video, "contentType");

				if let Some(rep) = video.children.iter_mut().find_map(|n| match n {
					Node::Element(e) if local_name(&e.name) == "Representation" => Some(e),
					_ => None,
				}) {
					let video_codecs = attr(rep, "codecs").map(str::to_string);
					set_attr(rep, "id", &muxed_rep);
					match (&audio_codecs, &video_codecs) {
						(Some(a), Some(v)) => set_attr(rep, "codecs", &format!("{},{}", a, v)),
						_ => log::info!("could not combine codecs"),
					}
				}
			}

			period.children.remove(audio_idx);
			return Ok(());
		}

		Err(Error::Config(
			"no period with both audio and video adaptation sets".to_string(),
		))
	}

	/// Serialize with the UTF-8 prologue. When `target_namespace` is given,
	/// every default-namespace declaration is substituted on the output
	/// string, which keeps the rest of the document untouched.
	pub fn serialize(&self, target_namespace: Option<&str>) -> Result<String, Error> {
		let mut xml = write_tree(&self.root)?;
		if let Some(ns) = target_namespace {
			let re = regex::Regex::new(r#"xmlns="[^"]+""#).expect("static regex");
			let replacement = format!(r#"xmlns="{}""#, ns);
			xml = re.replace_all(&xml, regex::NoExpand(&replacement)).into_owned();
		}
		Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{}", xml))
	}
}

/// Seconds from a `PT[H]H[M]M[S]S` duration.
pub fn duration_to_seconds(duration: &str) -> Result<u64, Error> {
	let re = regex::Regex::new(r"^PT(?:(?P<hours>\d+)H)?(?:(?P<minutes>\d+)M)?(?:(?P<seconds>\d+)S)?$")
		.expect("static regex");
	let caps = re
		.captures(duration)
		.ok_or_else(|| Error::Config(format!("{} does not match a duration", duration)))?;

	let part = |name: &str| -> u64 {
		caps.name(name)
			.map(|m| m.as_str().parse().unwrap_or(0))
			.unwrap_or(0)
	};
	Ok(part("hours") * 3600 + part("minutes") * 60 + part("seconds"))
}

/// Regex matching file names produced by a media pattern, with the
/// `$Number$` position captured.
pub fn number_regex(file_pattern: &str) -> Result<regex::Regex, Error> {
	let parts: Vec<String> = file_pattern.split("$Number$").map(|p| regex::escape(p)).collect();
	if parts.len() != 2 {
		return Err(Error::Config(format!(
			"media pattern {} must contain $Number$ exactly once",
			file_pattern
		)));
	}
	regex::Regex::new(&format!("^{}(\\d+){}$", parts[0], parts[1]))
		.map_err(|e| Error::Config(e.to_string()))
}

fn parse_number(value: &str) -> Result<u64, Error> {
	value
		.parse()
		.map_err(|_| Error::Config(format!("{} is not a number", value)))
}

fn required_attr(el: &Element, name: &str, content_type: &str) -> Result<String, Error> {
	attr(el, name)
		.map(str::to_string)
		.ok_or_else(|| Error::Config(format!("missing {} attribute for content type {}", name, content_type)))
}

// -- minimal element tree ---------------------------------------------------

#[derive(Debug, Clone)]
struct Element {
	name: String,
	attrs: Vec<(String, String)>,
	children: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
	Element(Element),
	Text(String),
}

fn local_name(tag: &str) -> &str {
	tag.rsplit(':').next().unwrap_or(tag)
}

fn attr<'a>(el: &'a Element, name: &str) -> Option<&'a str> {
	el.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn set_attr(el: &mut Element, name: &str, value: &str) {
	if let Some(entry) = el.attrs.iter_mut().find(|(k, _)| k == name) {
		entry.1 = value.to_string();
	} else {
		el.attrs.push((name.to_string(), value.to_string()));
	}
}

fn remove_attr(el: &mut Element, name: &str) {
	el.attrs.retain(|(k, _)| k != name);
}

fn children_named<'a>(el: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> {
	el.children.iter().filter_map(move |node| match node {
		Node::Element(e) if local_name(&e.name) == name => Some(e),
		_ => None,
	})
}

fn parse_tree(xml: &str) -> Result<Element, Error> {
	let mut reader = Reader::from_str(xml);
	let mut stack: Vec<Element> = Vec::new();
	let mut root = None;

	loop {
		match reader.read_event() {
			Ok(Event::Start(e)) => stack.push(element_from(&e)?),
			Ok(Event::Empty(e)) => {
				let element = element_from(&e)?;
				match stack.last_mut() {
					Some(parent) => parent.children.push(Node::Element(element)),
					None => root = Some(element),
				}
			}
			Ok(Event::End(_)) => {
				let element = stack
					.pop()
					.ok_or_else(|| Error::Config("unbalanced MPD document".to_string()))?;
				match stack.last_mut() {
					Some(parent) => parent.children.push(Node::Element(element)),
					None => root = Some(element),
				}
			}
			Ok(Event::Text(t)) => {
				let text = t
					.unescape()
					.map_err(|e| Error::Config(format!("MPD parse error: {}", e)))?;
				if !text.trim().is_empty() {
					if let Some(parent) = stack.last_mut() {
						parent.children.push(Node::Text(text.into_owned()));
					}
				}
			}
			Ok(Event::Eof) => break,
			Ok(_) => {} // declaration, comments and PIs; the prologue is re-added on output
			Err(e) => return Err(Error::Config(format!("MPD parse error: {}", e))),
		}
	}

	root.ok_or_else(|| Error::Config("empty MPD document".to_string()))
}

fn element_from(start: &BytesStart) -> Result<Element, Error> {
	let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
	let mut attrs = Vec::new();
	for attr in start.attributes() {
		let attr = attr.map_err(|e| Error::Config(format!("MPD parse error: {}", e)))?;
		let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
		let value = attr
			.unescape_value()
			.map_err(|e| Error::Config(format!("MPD parse error: {}", e)))?
			.into_owned();
		attrs.push((key, value));
	}
	Ok(Element {
		name,
		attrs,
		children: Vec::new(),
	})
}

fn write_tree(root: &Element) -> Result<String, Error> {
	let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
	write_element(&mut writer, root)?;
	let bytes = writer.into_inner().into_inner();
	String::from_utf8(bytes).map_err(|e| Error::Config(format!("MPD serialization error: {}", e)))
}

fn write_element(writer: &mut Writer<Cursor<Vec<u8>>>, el: &Element) -> Result<(), Error> {
	let mut start = BytesStart::new(el.name.as_str());
	for (key, value) in &el.attrs {
		start.push_attribute((key.as_str(), value.as_str()));
	}

	if el.children.is_empty() {
		writer.write_event(Event::Empty(start)).map_err(ser_err)?;
		return Ok(());
	}

	writer.write_event(Event::Start(start)).map_err(ser_err)?;
	for child in &el.children {
		match child {
			Node::Element(e) => write_element(writer, e)?,
			Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t))).map_err(ser_err)?,
		}
	}
	writer
		.write_event(Event::End(BytesEnd::new(el.name.as_str())))
		.map_err(ser_err)?;
	Ok(())
}

fn ser_err<E: std::fmt::Display>(e: E) -> Error {
	Error::Config(format!("MPD serialization error: {}", e))
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" minBufferTime="PT1.5S" type="static" mediaPresentationDuration="PT20S" profiles="urn:mpeg:dash:profile:isoff-live:2011">
  <Period id="p0">
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Number$.m4s" startNumber="1" duration="96000" timescale="48000"/>
      <Representation id="A1" bandwidth="64000" codecs="mp4a.40.2" audioSamplingRate="48000"/>
    </AdaptationSet>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Number$.m4s" startNumber="1" duration="180000" timescale="90000"/>
      <Representation id="V1" bandwidth="2000000" codecs="avc1.64001f" width="1280" height="720"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

	fn live_attrs() -> LiveAttrs {
		LiveAttrs {
			availability_start_time: "2016-04-01T12:00:00Z".to_string(),
			time_shift_buffer_depth: "PT30S".to_string(),
			minimum_update_period: "PT30M".to_string(),
		}
	}

	#[test]
	fn parse_model() {
		let mpd = Mpd::parse(SAMPLE).unwrap();
		assert_eq!(mpd.namespace, DEFAULT_DASH_NAMESPACE);
		assert_eq!(mpd.media_presentation_duration_s, 20);
		assert_eq!(mpd.adaptation_sets.len(), 2);

		let audio = &mpd.adaptation_sets[0];
		assert_eq!(audio.content_type, "audio");
		assert_eq!(audio.start_number, 1);
		assert_eq!(audio.segment_duration_s().unwrap(), 2);
		assert_eq!(audio.initialization_path(), "A1/init.mp4");
		assert_eq!(audio.media_path(5), "A1/seg_5.m4s");
		assert_eq!(audio.media_pattern(), "A1/seg_$Number$.m4s");

		assert_eq!(mpd.muxed_representation_id(), Some("A1_V1"));
		assert_eq!(mpd.muxed_init_path().unwrap(), "A1_V1/init.mp4");
		assert_eq!(mpd.muxed_media_pattern().unwrap(), "A1_V1/seg_$Number$.m4s");
	}

	#[test]
	fn durations() {
		assert_eq!(duration_to_seconds("PT20S").unwrap(), 20);
		assert_eq!(duration_to_seconds("PT1H2M3S").unwrap(), 3723);
		assert_eq!(duration_to_seconds("PT10M").unwrap(), 600);
		assert!(duration_to_seconds("20 seconds").is_err());
	}

	#[test]
	fn rejects_multiple_representations() {
		let doubled = SAMPLE.replace(
			r#"<Representation id="A1" bandwidth="64000" codecs="mp4a.40.2" audioSamplingRate="48000"/>"#,
			r#"<Representation id="A1" bandwidth="64000"/><Representation id="A2" bandwidth="96000"/>"#,
		);
		match Mpd::parse(&doubled) {
			Err(Error::Unsupported(_)) => {}
			other => panic!("expected Unsupported, got {:?}", other.err()),
		}
	}

	#[test]
	fn rejects_missing_content_type() {
		let broken = SAMPLE.replace(r#"contentType="audio" "#, "");
		assert!(Mpd::parse(&broken).is_err());
	}

	#[test]
	fn rejects_non_mpd_root() {
		assert!(Mpd::parse("<SMIL/>").is_err());
	}

	#[test]
	fn live_rewrite() {
		let mut mpd = Mpd::parse(SAMPLE).unwrap();
		mpd.make_live(&live_attrs());
		let xml = mpd.serialize(None).unwrap();

		assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n"));
		assert!(xml.contains(r#"type="dynamic""#));
		assert!(xml.contains(r#"availabilityStartTime="2016-04-01T12:00:00Z""#));
		assert!(xml.contains(r#"timeShiftBufferDepth="PT30S""#));
		assert!(xml.contains(r#"minimumUpdatePeriod="PT30M""#));
		assert!(xml.contains(r#"start="PT0S""#));
		assert!(!xml.contains("mediaPresentationDuration"));

		// still a valid manifest carrying the same logical content
		let reparsed = Mpd::parse(&xml).unwrap();
		assert_eq!(reparsed.adaptation_sets.len(), 2);
		assert_eq!(reparsed.adaptation_sets[0].representation.id, "A1");
		assert_eq!(reparsed.adaptation_sets[1].representation.id, "V1");
		assert_eq!(reparsed.namespace, mpd.namespace);
	}

	#[test]
	fn muxed_rewrite() {
		let mut mpd = Mpd::parse(SAMPLE).unwrap();
		let tracks = vec![("audio".to_string(), 1), ("video".to_string(), 2)];
		mpd.make_live_multiplexed(&live_attrs(), &tracks).unwrap();
		let xml = mpd.serialize(None).unwrap();

		assert_eq!(xml.matches("<AdaptationSet").count(), 1);
		assert!(xml.contains(r#"<ContentComponent id="1" contentType="audio"/>"#));
		assert!(xml.contains(r#"<ContentComponent id="2" contentType="video"/>"#));
		assert!(xml.contains(r#"id="A1_V1""#));
		assert!(xml.contains(r#"codecs="mp4a.40.2,avc1.64001f""#));
		// the surviving adaptation set no longer names a content type
		assert!(xml.contains(r#"<AdaptationSet mimeType="video/mp4">"#));
	}

	#[test]
	fn namespace_fix() {
		let other = SAMPLE.replace(DEFAULT_DASH_NAMESPACE, "urn:mpeg:DASH:schema:MPD:2011");
		let mut mpd = Mpd::parse(&other).unwrap();
		mpd.make_live(&live_attrs());
		let xml = mpd.serialize(Some(DEFAULT_DASH_NAMESPACE)).unwrap();
		assert!(xml.contains(r#"xmlns="urn:mpeg:dash:schema:mpd:2011""#));
		assert!(!xml.contains("urn:mpeg:DASH:schema:MPD:2011"));
	}

	#[test]
	fn number_regexes() {
		let re = number_regex("seg_$Number$.m4s").unwrap();
		let caps = re.captures("seg_42.m4s").unwrap();
		assert_eq!(&caps[1], "42");
		assert!(re.captures("seg_42.m4s.tmp").is_none());
		assert!(number_regex("seg.m4s").is_err());
	}
}
