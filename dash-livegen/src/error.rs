use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("config error: {0}")]
	Config(String),

	#[error("discovery error: {0}")]
	Discovery(String),

	#[error("malformed segment: {0}")]
	MalformedSegment(String),

	#[error("sink error: {0}")]
	Sink(String),

	#[error("unsupported input: {0}")]
	Unsupported(String),

	#[error("unknown mux type: {0}")]
	UnknownMuxType(String),

	#[error("interrupted")]
	Interrupted,
}

impl Error {
	/// Process exit code reported for this error kind.
	pub fn exit_code(&self) -> i32 {
		match self {
			Error::Interrupted => 0,
			Error::Config(_) | Error::Discovery(_) | Error::MalformedSegment(_) | Error::Sink(_) => 1,
			Error::Unsupported(_) => 2,
			Error::UnknownMuxType(_) => 3,
		}
	}
}
