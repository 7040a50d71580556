use std::path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;

use futures::stream::StreamExt;

use dash_livegen::{Config, Error, LiveGenerator, MuxType};

#[derive(Parser)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Generate live DASH content from a VoD asset
	Run(Run),

	/// Generate live DASH content driven by a JSON config file
	Config(ConfigFile),
}

#[derive(Args, Clone)]
struct Run {
	/// The path to the input DASH manifest (.mpd)
	#[arg()]
	mpd_file: path::PathBuf,

	/// Output destination: a directory or a webdav://host/path URL
	#[arg()]
	destination: String,

	/// WebDAV user
	#[arg(short, long)]
	user: Option<String>,

	/// WebDAV password
	#[arg(short, long)]
	password: Option<String>,

	/// Multiplex audio and video into *_mux.mpd: none, fragment or sample
	#[arg(short, long, default_value = "none")]
	mux: String,

	/// timeShiftBufferDepth (s)
	#[arg(short, long, default_value_t = 30)]
	tsbd: u64,

	/// Leave old files at the destination
	#[arg(short, long)]
	noclean: bool,

	/// Adjust availabilityStartTime (in s)
	#[arg(short, long, default_value_t = 0)]
	adjustast: u64,

	/// Force the default DASH namespace on the output MPD
	#[arg(short, long)]
	fixnamespace: bool,

	/// Verbose output
	#[arg(short, long)]
	verbose: bool,
}

#[derive(Args, Clone)]
struct ConfigFile {
	/// The path to the config file
	#[arg()]
	file: path::PathBuf,

	/// Verbose output
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let verbose = match &cli.command {
		Commands::Run(args) => args.verbose,
		Commands::Config(args) => args.verbose,
	};
	// -v raises the default level; RUST_LOG still wins
	env_logger::Builder::new()
		.filter_level(if verbose {
			log::LevelFilter::Debug
		} else {
			log::LevelFilter::Info
		})
		.parse_default_env()
		.init();

	if let Err(err) = run(cli).await {
		log::error!("{:#}", err);
		let code = err.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1);
		std::process::exit(code);
	}
}

async fn run(cli: Cli) -> anyhow::Result<()> {
	let config = match cli.command {
		Commands::Run(args) => Config {
			mpd_file: args.mpd_file,
			destination: args.destination,
			webdav_user: args.user,
			webdav_password: args.password,
			fix_namespace: args.fixnamespace,
			mux_type: MuxType::parse(&args.mux)?,
			time_shift_buffer_depth_s: args.tsbd,
			no_clean: args.noclean,
			adjust_ast_s: args.adjustast,
		},
		Commands::Config(args) => Config::from_file(&args.file)?,
	};

	let interrupted = Arc::new(AtomicBool::new(false));
	let signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT]).context("cannot install signal handlers")?;
	let handle = signals.handle();
	let signal_task = tokio::spawn(watch_signals(signals, interrupted.clone()));

	let mut generator = LiveGenerator::new(config, interrupted).await?;
	let result = generator.run().await;
	generator.close().await;

	handle.close();
	signal_task.abort();

	match result {
		Err(Error::Interrupted) => {
			log::info!("interrupted, exiting cleanly");
			Ok(())
		}
		other => Ok(other?),
	}
}

async fn watch_signals(mut signals: Signals, interrupted: Arc<AtomicBool>) {
	// wait until a termination signal has been received
	while let Some(signal) = signals.next().await {
		match signal {
			SIGHUP | SIGTERM | SIGINT | SIGQUIT => {
				log::info!("stopping...");
				interrupted.store(true, Ordering::Relaxed);
				break;
			}
			_ => (),
		}
	}
}
