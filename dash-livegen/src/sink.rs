use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, path};

use quick_xml::events::Event;

use crate::{mpd, Error};

const IDLE_POLL: Duration = Duration::from_millis(200);
const QUEUE_WARN_LEN: usize = 5;

enum Job {
	Put { path: String, data: Vec<u8> },
	Delete { path: String },
}

/// File writer that handles the local file system as well as WebDAV.
///
/// Local writes happen inline. WebDAV operations are queued and drained
/// in submission order by a single background task, so a slow server
/// delays uploads instead of stalling the wall clock.
pub struct FileWriter {
	backend: tokio::sync::Mutex<Backend>,
}

enum Backend {
	Local {
		base: path::PathBuf,
	},
	WebDav {
		conn: Arc<WebDavConn>,
		queue: Arc<Mutex<VecDeque<Job>>>,
		interrupted: Arc<AtomicBool>,
	},
}

impl FileWriter {
	pub async fn new(destination: &str, user: Option<&str>, password: Option<&str>) -> Result<Self, Error> {
		let backend = if let Some(rest) = destination.strip_prefix("webdav://") {
			let base = url::Url::parse(&format!("http://{}", rest))
				.map_err(|e| Error::Config(format!("invalid destination {}: {}", destination, e)))?;
			if base.host_str().is_none() {
				return Err(Error::Config(format!("destination {} has no host", destination)));
			}
			log::info!("connecting to {}", base);

			let conn = Arc::new(WebDavConn {
				client: reqwest::Client::new(),
				base,
				user: user.map(str::to_string),
				password: password.map(str::to_string),
			});
			conn.make_base_dirs().await;

			let queue = Arc::new(Mutex::new(VecDeque::new()));
			let interrupted = Arc::new(AtomicBool::new(false));
			tokio::spawn(drain(conn.clone(), queue.clone(), interrupted.clone()));

			Backend::WebDav {
				conn,
				queue,
				interrupted,
			}
		} else {
			Backend::Local {
				base: path::PathBuf::from(destination),
			}
		};

		Ok(Self {
			backend: tokio::sync::Mutex::new(backend),
		})
	}

	pub async fn put(&self, rel_path: &str, data: Vec<u8>) -> Result<(), Error> {
		let backend = self.backend.lock().await;
		match &*backend {
			Backend::Local { base } => write_local(base, rel_path, &data),
			Backend::WebDav { queue, .. } => {
				queue_job(
					queue,
					Job::Put {
						path: rel_path.to_string(),
						data,
					},
				);
				Ok(())
			}
		}
	}

	pub async fn delete(&self, rel_path: &str) -> Result<(), Error> {
		let backend = self.backend.lock().await;
		match &*backend {
			Backend::Local { base } => delete_local(base, rel_path),
			Backend::WebDav { queue, .. } => {
				queue_job(
					queue,
					Job::Delete {
						path: rel_path.to_string(),
					},
				);
				Ok(())
			}
		}
	}

	/// Delete the old init segment and every file matching the media
	/// pattern. Blocking, meant for start-up.
	pub async fn clean(&self, rel_init_path: &str, rel_media_pattern: &str) -> Result<(), Error> {
		let backend = self.backend.lock().await;
		match &*backend {
			Backend::Local { base } => clean_local(base, rel_init_path, rel_media_pattern),
			Backend::WebDav { conn, .. } => clean_webdav(conn, rel_init_path, rel_media_pattern).await,
		}
	}

	pub async fn close(&self) {
		let backend = self.backend.lock().await;
		if let Backend::WebDav { interrupted, .. } = &*backend {
			interrupted.store(true, Ordering::Relaxed);
		}
	}
}

/// Enqueue a WebDAV job, warning when the drain falls behind.
fn queue_job(queue: &Mutex<VecDeque<Job>>, job: Job) {
	let mut queue = queue.lock().expect("queue lock poisoned");
	queue.push_back(job);
	if queue.len() > QUEUE_WARN_LEN {
		log::warn!("upload speed not enough, webdav queue length is {}", queue.len());
	}
}

fn write_local(base: &Path, rel_path: &str, data: &[u8]) -> Result<(), Error> {
	let path = base.join(rel_path);
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)
			.map_err(|e| Error::Sink(format!("cannot create {}: {}", parent.display(), e)))?;
	}
	fs::write(&path, data).map_err(|e| Error::Sink(format!("cannot write {}: {}", path.display(), e)))?;
	log::debug!("wrote {}", path.display());
	Ok(())
}

fn delete_local(base: &Path, rel_path: &str) -> Result<(), Error> {
	let path = base.join(rel_path);
	if path.exists() {
		fs::remove_file(&path).map_err(|e| Error::Sink(format!("cannot delete {}: {}", path.display(), e)))?;
		log::debug!("deleted {}", path.display());
	}
	Ok(())
}

fn clean_local(base: &Path, rel_init_path: &str, rel_media_pattern: &str) -> Result<(), Error> {
	log::info!("removing old init and media files below {}", base.display());
	delete_local(base, rel_init_path)?;

	let media = base.join(rel_media_pattern);
	let dir = media.parent().unwrap_or(base).to_path_buf();
	let file_pattern = media
		.file_name()
		.and_then(|n| n.to_str())
		.ok_or_else(|| Error::Config(format!("bad media pattern {}", rel_media_pattern)))?;
	let re = mpd::number_regex(file_pattern)?;

	let entries = match fs::read_dir(&dir) {
		Ok(entries) => entries,
		Err(_) => return Ok(()), // nothing there yet
	};
	for entry in entries {
		let entry = entry.map_err(|e| Error::Sink(e.to_string()))?;
		let name = entry.file_name();
		let Some(name) = name.to_str() else { continue };
		if re.is_match(name) {
			fs::remove_file(entry.path())
				.map_err(|e| Error::Sink(format!("cannot delete {}: {}", entry.path().display(), e)))?;
			log::debug!("deleted {}", entry.path().display());
		}
	}
	Ok(())
}

async fn clean_webdav(conn: &WebDavConn, rel_init_path: &str, rel_media_pattern: &str) -> Result<(), Error> {
	log::info!("cleaning old files on {}", conn.base);
	if let Err(e) = conn.delete(rel_init_path).await {
		log::warn!("webdav: {}", e);
	}

	let (dir, file_pattern) = match rel_media_pattern.rsplit_once('/') {
		Some((dir, file)) => (dir, file),
		None => ("", rel_media_pattern),
	};
	let re = mpd::number_regex(file_pattern)?;

	for href in conn.list(dir).await? {
		if !re.is_match(href_file_name(&href)) {
			continue;
		}
		// hrefs come back as absolute paths (or full URLs); resolve against the base
		let url = match url::Url::parse(&href) {
			Ok(url) if url.scheme().starts_with("http") => url,
			_ => {
				let mut url = conn.base.clone();
				url.set_path(&href);
				url
			}
		};
		match conn.delete_url(url).await {
			Ok(()) => log::info!("removed {}", href),
			Err(e) => log::warn!("webdav: {}", e),
		}
	}
	Ok(())
}

async fn drain(conn: Arc<WebDavConn>, queue: Arc<Mutex<VecDeque<Job>>>, interrupted: Arc<AtomicBool>) {
	let mut dirs = HashSet::new();
	while !interrupted.load(Ordering::Relaxed) {
		let job = queue.lock().expect("queue lock poisoned").pop_front();
		match job {
			Some(Job::Put { path, data }) => {
				// keep the worker alive on failure; a stale segment is worth
				// less than the next one
				if let Err(e) = conn.put(&mut dirs, &path, data).await {
					log::warn!("webdav: {}", e);
				}
			}
			Some(Job::Delete { path }) => {
				if let Err(e) = conn.delete(&path).await {
					log::warn!("webdav: {}", e);
				}
			}
			None => tokio::time::sleep(IDLE_POLL).await,
		}
	}
}

struct WebDavConn {
	client: reqwest::Client,
	base: url::Url,
	user: Option<String>,
	password: Option<String>,
}

impl WebDavConn {
	fn request(&self, method: reqwest::Method, url: url::Url) -> reqwest::RequestBuilder {
		let mut request = self.client.request(method, url);
		if let Some(user) = &self.user {
			request = request.basic_auth(user, self.password.as_deref());
		}
		request
	}

	fn url_for(&self, rel_path: &str) -> url::Url {
		let mut url = self.base.clone();
		let path = format!("{}/{}", self.base.path().trim_end_matches('/'), rel_path);
		url.set_path(&path);
		url
	}

	/// MKCOL the destination collection itself, component by component.
	async fn make_base_dirs(&self) {
		let segments: Vec<String> = self
			.base
			.path()
			.split('/')
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.collect();
		let mut path = String::new();
		for part in segments {
			path.push('/');
			path.push_str(&part);
			let mut url = self.base.clone();
			url.set_path(&path);
			let method = reqwest::Method::from_bytes(b"MKCOL").expect("valid method");
			if let Err(e) = self.request(method, url).send().await {
				log::debug!("mkcol {} failed: {}", path, e);
			}
		}
	}

	/// Create the directories leading up to a file, remembering what
	/// already exists.
	async fn make_dirs(&self, dirs: &mut HashSet<String>, rel_dir: &str) {
		let mut path = String::new();
		for part in rel_dir.split('/').filter(|p| !p.is_empty()) {
			if !path.is_empty() {
				path.push('/');
			}
			path.push_str(part);
			if dirs.contains(&path) {
				continue;
			}
			let method = reqwest::Method::from_bytes(b"MKCOL").expect("valid method");
			// a 405 here just means the collection already exists
			if let Err(e) = self.request(method, self.url_for(&path)).send().await {
				log::debug!("mkcol {} failed: {}", path, e);
			}
			dirs.insert(path.clone());
		}
	}

	async fn put(&self, dirs: &mut HashSet<String>, rel_path: &str, data: Vec<u8>) -> Result<(), Error> {
		if let Some((dir, _)) = rel_path.rsplit_once('/') {
			self.make_dirs(dirs, dir).await;
		}
		let url = self.url_for(rel_path);
		let response = self
			.request(reqwest::Method::PUT, url.clone())
			.body(data)
			.send()
			.await
			.map_err(|e| Error::Sink(format!("put {}: {}", url, e)))?;
		if !response.status().is_success() {
			return Err(Error::Sink(format!("put {}: status {}", url, response.status())));
		}
		log::debug!("uploaded {}", url);
		Ok(())
	}

	async fn delete(&self, rel_path: &str) -> Result<(), Error> {
		self.delete_url(self.url_for(rel_path)).await
	}

	async fn delete_url(&self, url: url::Url) -> Result<(), Error> {
		let response = self
			.request(reqwest::Method::DELETE, url.clone())
			.send()
			.await
			.map_err(|e| Error::Sink(format!("delete {}: {}", url, e)))?;
		if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
			return Err(Error::Sink(format!("delete {}: status {}", url, response.status())));
		}
		Ok(())
	}

	/// Depth-1 PROPFIND listing of a collection.
	async fn list(&self, rel_dir: &str) -> Result<Vec<String>, Error> {
		let method = reqwest::Method::from_bytes(b"PROPFIND").expect("valid method");
		let url = self.url_for(rel_dir);
		let response = self
			.request(method, url.clone())
			.header("Depth", "1")
			.send()
			.await
			.map_err(|e| Error::Sink(format!("propfind {}: {}", url, e)))?;
		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(Vec::new());
		}
		if !response.status().is_success() {
			return Err(Error::Sink(format!("propfind {}: status {}", url, response.status())));
		}
		let body = response.text().await.map_err(|e| Error::Sink(e.to_string()))?;
		parse_hrefs(&body)
	}
}

fn parse_hrefs(body: &str) -> Result<Vec<String>, Error> {
	let mut reader = quick_xml::Reader::from_str(body);
	let mut hrefs = Vec::new();
	let mut in_href = false;
	loop {
		match reader.read_event() {
			Ok(Event::Start(e)) => in_href = e.local_name().as_ref() == b"href",
			Ok(Event::End(_)) => in_href = false,
			Ok(Event::Text(t)) => {
				if in_href {
					let text = t.unescape().map_err(|e| Error::Sink(e.to_string()))?;
					hrefs.push(text.into_owned());
				}
			}
			Ok(Event::Eof) => break,
			Ok(_) => {}
			Err(e) => return Err(Error::Sink(format!("propfind response parse error: {}", e))),
		}
	}
	Ok(hrefs)
}

/// Servers return absolute hrefs; only the final path component matters
/// for matching.
fn href_file_name(href: &str) -> &str {
	href.trim_end_matches('/').rsplit('/').next().unwrap_or(href)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn local_put_and_delete() {
		let dir = tempfile::tempdir().unwrap();
		let writer = FileWriter::new(dir.path().to_str().unwrap(), None, None).await.unwrap();

		writer.put("V1/seg_1.m4s", b"data".to_vec()).await.unwrap();
		let path = dir.path().join("V1/seg_1.m4s");
		assert_eq!(fs::read(&path).unwrap(), b"data");

		writer.delete("V1/seg_1.m4s").await.unwrap();
		assert!(!path.exists());

		// deleting a missing file is not an error
		writer.delete("V1/seg_1.m4s").await.unwrap();
	}

	#[tokio::test]
	async fn local_clean() {
		let dir = tempfile::tempdir().unwrap();
		let writer = FileWriter::new(dir.path().to_str().unwrap(), None, None).await.unwrap();

		writer.put("V1/init.mp4", b"init".to_vec()).await.unwrap();
		writer.put("V1/seg_1.m4s", b"one".to_vec()).await.unwrap();
		writer.put("V1/seg_2.m4s", b"two".to_vec()).await.unwrap();
		writer.put("V1/other.txt", b"keep".to_vec()).await.unwrap();

		writer.clean("V1/init.mp4", "V1/seg_$Number$.m4s").await.unwrap();

		assert!(!dir.path().join("V1/init.mp4").exists());
		assert!(!dir.path().join("V1/seg_1.m4s").exists());
		assert!(!dir.path().join("V1/seg_2.m4s").exists());
		assert!(dir.path().join("V1/other.txt").exists());
	}

	#[tokio::test]
	async fn clean_with_nothing_to_do() {
		let dir = tempfile::tempdir().unwrap();
		let writer = FileWriter::new(dir.path().to_str().unwrap(), None, None).await.unwrap();
		writer.clean("V1/init.mp4", "V1/seg_$Number$.m4s").await.unwrap();
	}

	#[test]
	fn href_file_names() {
		assert_eq!(href_file_name("/dav/live/seg_4.m4s"), "seg_4.m4s");
		assert_eq!(href_file_name("/dav/live/"), "live");
		assert_eq!(href_file_name("seg_4.m4s"), "seg_4.m4s");
	}

	#[test]
	fn propfind_hrefs() {
		let body = r#"<?xml version="1.0"?>
			<D:multistatus xmlns:D="DAV:">
				<D:response><D:href>/live/</D:href></D:response>
				<D:response><D:href>/live/seg_1.m4s</D:href></D:response>
				<D:response><D:href>/live/seg_2.m4s</D:href></D:response>
			</D:multistatus>"#;
		let hrefs = parse_hrefs(body).unwrap();
		assert_eq!(hrefs, vec!["/live/", "/live/seg_1.m4s", "/live/seg_2.m4s"]);
	}
}
