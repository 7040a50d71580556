use std::{fs, path};

use serde::Deserialize;

use crate::Error;

/// Config files are versioned; a mismatch is refused outright.
pub const CONFIG_FILE_VERSION: &str = "1.0";

pub const DEFAULT_TIME_SHIFT_BUFFER_DEPTH_S: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxType {
	None,
	Fragment,
	Sample,
}

impl MuxType {
	pub fn parse(value: &str) -> Result<Self, Error> {
		match value {
			"none" | "0" => Ok(MuxType::None),
			"fragment" | "1" => Ok(MuxType::Fragment),
			"sample" | "samples" | "2" => Ok(MuxType::Sample),
			other => Err(Error::UnknownMuxType(other.to_string())),
		}
	}
}

/// Everything the generator needs to run.
#[derive(Debug, Clone)]
pub struct Config {
	pub mpd_file: path::PathBuf,
	pub destination: String,
	pub webdav_user: Option<String>,
	pub webdav_password: Option<String>,
	pub fix_namespace: bool,
	pub mux_type: MuxType,
	pub time_shift_buffer_depth_s: u64,
	pub no_clean: bool,
	pub adjust_ast_s: u64,
}

impl Config {
	pub fn from_file<P>(file: P) -> Result<Self, Error>
	where
		P: AsRef<path::Path>,
	{
		let buf = fs::read_to_string(&file)
			.map_err(|e| Error::Config(format!("cannot read config file {}: {}", file.as_ref().display(), e)))?;
		let parsed: ConfigFile =
			serde_json::from_str(&buf).map_err(|e| Error::Config(format!("invalid config file: {}", e)))?;

		if parsed.version != CONFIG_FILE_VERSION {
			return Err(Error::Config(format!(
				"wrong config file version: {} (should be {})",
				parsed.version, CONFIG_FILE_VERSION
			)));
		}

		let mux_type = match parsed.output.mux_type {
			Some(value) => MuxType::parse(&value)?,
			None => MuxType::None,
		};

		Ok(Self {
			mpd_file: parsed.input.mpd_file,
			destination: parsed.output.destination,
			webdav_user: parsed.output.webdav_user,
			webdav_password: parsed.output.webdav_password,
			fix_namespace: parsed.other.fix_namespace.unwrap_or(false),
			mux_type,
			time_shift_buffer_depth_s: parsed
				.other
				.time_shift_buffer_depth_s
				.unwrap_or(DEFAULT_TIME_SHIFT_BUFFER_DEPTH_S),
			no_clean: parsed.other.no_clean.unwrap_or(false),
			adjust_ast_s: parsed.other.adjust_availability_start_time_s.unwrap_or(0),
		})
	}
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
	version: String,
	input: InputSection,
	output: OutputSection,
	#[serde(default)]
	other: OtherSection,
}

#[derive(Debug, Deserialize)]
struct InputSection {
	mpd_file: path::PathBuf,
}

#[derive(Debug, Deserialize)]
struct OutputSection {
	destination: String,
	webdav_user: Option<String>,
	webdav_password: Option<String>,
	mux_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OtherSection {
	time_shift_buffer_depth_s: Option<u64>,
	fix_namespace: Option<bool>,
	no_clean: Option<bool>,
	adjust_availability_start_time_s: Option<u64>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_config(contents: &str) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(contents.as_bytes()).unwrap();
		file
	}

	#[test]
	fn parse_full_config() {
		let file = write_config(
			r#"{
				"version": "1.0",
				"input": { "mpd_file": "media/source.mpd" },
				"output": {
					"destination": "webdav://dav.example.com/live",
					"webdav_user": "user",
					"webdav_password": "secret",
					"mux_type": "fragment"
				},
				"other": { "time_shift_buffer_depth_s": 60, "no_clean": true }
			}"#,
		);

		let config = Config::from_file(file.path()).unwrap();
		assert_eq!(config.mpd_file, path::Path::new("media/source.mpd"));
		assert_eq!(config.destination, "webdav://dav.example.com/live");
		assert_eq!(config.webdav_user.as_deref(), Some("user"));
		assert_eq!(config.mux_type, MuxType::Fragment);
		assert_eq!(config.time_shift_buffer_depth_s, 60);
		assert!(config.no_clean);
		assert_eq!(config.adjust_ast_s, 0);
		assert!(!config.fix_namespace);
	}

	#[test]
	fn minimal_config_defaults() {
		let file = write_config(
			r#"{
				"version": "1.0",
				"input": { "mpd_file": "a.mpd" },
				"output": { "destination": "/var/www/live" }
			}"#,
		);

		let config = Config::from_file(file.path()).unwrap();
		assert_eq!(config.mux_type, MuxType::None);
		assert_eq!(config.time_shift_buffer_depth_s, DEFAULT_TIME_SHIFT_BUFFER_DEPTH_S);
		assert!(!config.no_clean);
	}

	#[test]
	fn wrong_version_refused() {
		let file = write_config(
			r#"{
				"version": "2.0",
				"input": { "mpd_file": "a.mpd" },
				"output": { "destination": "out" }
			}"#,
		);

		match Config::from_file(file.path()) {
			Err(Error::Config(message)) => assert!(message.contains("version")),
			other => panic!("expected Config error, got {:?}", other.err()),
		}
	}

	#[test]
	fn mux_types() {
		assert_eq!(MuxType::parse("none").unwrap(), MuxType::None);
		assert_eq!(MuxType::parse("fragment").unwrap(), MuxType::Fragment);
		assert_eq!(MuxType::parse("2").unwrap(), MuxType::Sample);
		match MuxType::parse("frags") {
			Err(Error::UnknownMuxType(value)) => assert_eq!(value, "frags"),
			other => panic!("expected UnknownMuxType, got {:?}", other.err()),
		}
	}
}
