//! `file://` protocol adapter over the local filesystem
//!
//! Remote paths are rooted at the URL's path: `/a/b.txt` on a connection to
//! `file:///srv/data` is `/srv/data/a/b.txt`. Every operation runs on its own
//! tokio task and reports through its [`AdapterClient`].

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use url::Url;

use super::{AdapterClient, AdapterEventKind, ProtocolAdapter};
use crate::auth::{AuthChallenge, ChallengeResponse, Credential};
use crate::error::{ConnectionError, ConnectionResult, ErrorKind};
use crate::logging::*;
use crate::types::{remote_join, DirectoryEntry, EntryKind, TranscriptKind, UploadSource};

/// Size of data chunks read and written per step
pub const CHUNK_SIZE: usize = 64 * 1024;

pub struct LocalAdapter {
	root: PathBuf,
	host: String,
	/// Credential the connection must present, if any
	required: Option<Credential>,
	failed_challenges: u32,
	current_directory: Arc<Mutex<String>>,
	connected: bool,
	cancel: Arc<AtomicBool>,
	task: Option<JoinHandle<()>>,
}

impl LocalAdapter {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		LocalAdapter {
			root: root.into(),
			host: "localhost".to_string(),
			required: None,
			failed_challenges: 0,
			current_directory: Arc::new(Mutex::new("/".to_string())),
			connected: false,
			cancel: Arc::new(AtomicBool::new(false)),
			task: None,
		}
	}

	pub fn from_url(url: &Url) -> Self {
		let root = url.to_file_path().unwrap_or_else(|_| PathBuf::from(url.path()));
		let mut adapter = Self::new(root);
		if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
			adapter.host = host.to_string();
		}
		adapter
	}

	/// Demand a credential before the connection opens
	pub fn with_required_credential(mut self, credential: Credential) -> Self {
		self.required = Some(credential);
		self
	}

	/// Map a remote path onto the local root, rejecting escapes
	fn resolve(&self, path: &str) -> ConnectionResult<PathBuf> {
		let absolute = if path.starts_with('/') {
			path.to_string()
		} else {
			remote_join(&self.current_directory(), path)
		};
		let mut local = self.root.clone();
		for component in Path::new(&absolute).components() {
			match component {
				Component::Normal(part) => local.push(part),
				Component::RootDir | Component::CurDir => {}
				_ => {
					return Err(ConnectionError::new(
						ErrorKind::PermissionDenied,
						format!("path escapes the connection root: {}", path),
					)
					.with_path(path))
				}
			}
		}
		Ok(local)
	}

	/// Run one operation; its result becomes the completion event
	fn spawn_operation<F, Fut>(
		&mut self,
		client: AdapterClient,
		path: &str,
		sent: AdapterEventKind,
		operation: F,
	) where
		F: FnOnce(Arc<AtomicBool>) -> Fut,
		Fut: Future<Output = ConnectionResult<AdapterEventKind>> + Send + 'static,
	{
		let cancel = Arc::new(AtomicBool::new(false));
		self.cancel = cancel.clone();
		let future = operation(cancel.clone());
		let path = path.to_string();
		self.task = Some(tokio::spawn(async move {
			client.send(sent).await;
			let result = future.await;
			if cancel.load(Ordering::SeqCst) {
				return;
			}
			match result {
				Ok(event) => {
					client.send(event).await;
				}
				Err(e) => {
					let e = if e.path.is_none() { e.with_path(path) } else { e };
					client.append_to_transcript(e.to_string(), TranscriptKind::Error).await;
					client.current_operation_did_fail(e).await;
				}
			}
		}));
	}

	/// Spawn an operation, or fail it right away when the path does not resolve
	fn run<F, Fut>(&mut self, client: AdapterClient, path: &str, line: String, operation: F)
	where
		F: FnOnce(PathBuf, Arc<AtomicBool>) -> Fut,
		Fut: Future<Output = ConnectionResult<AdapterEventKind>> + Send + 'static,
	{
		debug!("[file] {}", line);
		match self.resolve(path) {
			Ok(local) => {
				let sent = AdapterEventKind::AppendToTranscript { text: line, kind: TranscriptKind::Sent };
				self.spawn_operation(client, path, sent, move |cancel| operation(local, cancel))
			}
			Err(e) => self.fail_operation(client, line, e),
		}
	}

	/// Fail the operation without running it
	fn fail_operation(&mut self, client: AdapterClient, line: String, e: ConnectionError) {
		self.task = Some(client.post([
			AdapterEventKind::AppendToTranscript { text: line, kind: TranscriptKind::Sent },
			AdapterEventKind::AppendToTranscript { text: e.to_string(), kind: TranscriptKind::Error },
			AdapterEventKind::CurrentOperationDidFail(e),
		]));
	}

	fn challenge(&self) -> AuthChallenge {
		AuthChallenge {
			host: self.host.clone(),
			protocol: self.name().to_string(),
			previous_failure_count: self.failed_challenges,
			proposed: None,
			operation: None,
		}
	}

	/// Check the root in a spawned task, reporting `intro` first
	fn open(&mut self, client: AdapterClient, intro: Option<AdapterEventKind>) {
		let root = self.root.clone();
		let cancel = Arc::new(AtomicBool::new(false));
		self.cancel = cancel.clone();
		self.set_current_directory("/");
		self.connected = true;
		self.task = Some(tokio::spawn(async move {
			if let Some(intro) = intro {
				client.send(intro).await;
			}
			let opened = match tokio::fs::metadata(&root).await {
				Ok(meta) if meta.is_dir() => Ok(()),
				Ok(_) => Err(ConnectionError::new(
					ErrorKind::HostUnreachable,
					format!("{} is not a directory", root.display()),
				)),
				Err(e) => Err(ConnectionError::new(
					ErrorKind::HostUnreachable,
					format!("{}: {}", root.display(), e),
				)
				.with_source(e)),
			};
			if cancel.load(Ordering::SeqCst) {
				return;
			}
			match opened {
				Ok(()) => {
					client.append_to_transcript("230 connected", TranscriptKind::Received).await;
					client.did_open_connection("/").await;
				}
				Err(e) => {
					client.did_fail_with_error(e).await;
				}
			}
		}));
	}

	fn current_directory(&self) -> String {
		self.current_directory.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	fn set_current_directory(&self, path: &str) {
		*self.current_directory.lock().unwrap_or_else(|e| e.into_inner()) = path.to_string();
	}
}

fn modified(meta: &std::fs::Metadata) -> Option<SystemTime> {
	meta.modified().ok()
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> Option<u32> {
	use std::os::unix::fs::PermissionsExt;
	Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> Option<u32> {
	None
}

#[cfg(unix)]
async fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
	Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "permissions are not supported"))
}

async fn list_directory(remote: String, local: PathBuf) -> ConnectionResult<Vec<DirectoryEntry>> {
	let meta = tokio::fs::metadata(&local).await?;
	if !meta.is_dir() {
		return Err(ConnectionError::new(ErrorKind::NotFound, "not a directory"));
	}
	let mut entries = Vec::new();
	let mut dir = tokio::fs::read_dir(&local).await?;
	while let Some(entry) = dir.next_entry().await? {
		let name = entry.file_name().to_string_lossy().into_owned();
		let file_type = entry.file_type().await?;
		let meta = tokio::fs::symlink_metadata(entry.path()).await?;
		let kind = if file_type.is_symlink() {
			EntryKind::Symlink
		} else if file_type.is_dir() {
			EntryKind::Directory
		} else {
			EntryKind::File
		};
		entries.push(DirectoryEntry {
			path: remote_join(&remote, &name),
			name,
			kind,
			size: if kind == EntryKind::File { meta.len() } else { 0 },
			permissions: mode_of(&meta),
			modified: modified(&meta),
		});
	}
	entries.sort_by(|a, b| a.name.cmp(&b.name));
	Ok(entries)
}

async fn download(
	client: AdapterClient,
	local: PathBuf,
	offset: u64,
	cancel: Arc<AtomicBool>,
) -> ConnectionResult<AdapterEventKind> {
	let mut file = tokio::fs::File::open(&local).await?;
	let meta = file.metadata().await?;
	if meta.is_dir() {
		return Err(ConnectionError::new(ErrorKind::IsADirectory, "cannot download a directory"));
	}
	client.did_learn_transfer_size(meta.len().saturating_sub(offset)).await;
	if offset > 0 {
		file.seek(SeekFrom::Start(offset)).await?;
	}
	let mut buf = vec![0u8; CHUNK_SIZE];
	loop {
		if cancel.load(Ordering::SeqCst) {
			return Err(ConnectionError::cancelled());
		}
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		if !client.did_download_data(buf[..n].to_vec()).await {
			return Err(ConnectionError::not_connected());
		}
	}
	Ok(AdapterEventKind::DidFinishCurrentOperation)
}

async fn upload(
	client: AdapterClient,
	source: UploadSource,
	local: PathBuf,
	offset: u64,
	cancel: Arc<AtomicBool>,
) -> ConnectionResult<AdapterEventKind> {
	let mut target = if offset > 0 {
		let mut f = tokio::fs::OpenOptions::new().write(true).create(true).truncate(false).open(&local).await?;
		f.set_len(offset).await?;
		f.seek(SeekFrom::Start(offset)).await?;
		f
	} else {
		tokio::fs::File::create(&local).await?
	};

	match source {
		UploadSource::Data(data) => {
			let start = (offset as usize).min(data.len());
			client.did_learn_transfer_size((data.len() - start) as u64).await;
			for chunk in data[start..].chunks(CHUNK_SIZE) {
				if cancel.load(Ordering::SeqCst) {
					return Err(ConnectionError::cancelled());
				}
				target.write_all(chunk).await?;
				client.did_upload_data_of_length(chunk.len() as u64).await;
			}
		}
		UploadSource::File(path) => {
			let display = path.display().to_string();
			let mut source = tokio::fs::File::open(&path)
				.await
				.map_err(|e| ConnectionError::local_io(display.clone(), e))?;
			let length = source
				.metadata()
				.await
				.map_err(|e| ConnectionError::local_io(display.clone(), e))?
				.len();
			client.did_learn_transfer_size(length.saturating_sub(offset)).await;
			if offset > 0 {
				source
					.seek(SeekFrom::Start(offset))
					.await
					.map_err(|e| ConnectionError::local_io(display.clone(), e))?;
			}
			let mut buf = vec![0u8; CHUNK_SIZE];
			loop {
				if cancel.load(Ordering::SeqCst) {
					return Err(ConnectionError::cancelled());
				}
				let n = source
					.read(&mut buf)
					.await
					.map_err(|e| ConnectionError::local_io(display.clone(), e))?;
				if n == 0 {
					break;
				}
				target.write_all(&buf[..n]).await?;
				client.did_upload_data_of_length(n as u64).await;
			}
		}
	}
	target.flush().await?;
	Ok(AdapterEventKind::DidFinishCurrentOperation)
}

impl ProtocolAdapter for LocalAdapter {
	fn name(&self) -> &'static str {
		"file"
	}

	fn can_handle(&self, url: &Url) -> bool {
		url.scheme() == "file"
	}

	fn start_connection(&mut self, client: AdapterClient, credential: Option<Credential>) {
		info!("[file] opening {}", self.root.display());
		let connecting = AdapterEventKind::AppendToTranscript {
			text: format!("Connecting to {}", self.root.display()),
			kind: TranscriptKind::Info,
		};
		self.failed_challenges = 0;
		match (&self.required, credential) {
			(None, _) => self.open(client, Some(connecting)),
			(Some(required), Some(given)) if *required == given => self.open(client, Some(connecting)),
			(Some(_), _) => {
				let challenge = AdapterEventKind::DidReceiveAuthenticationChallenge(self.challenge());
				self.task = Some(client.post([connecting, challenge]));
			}
		}
	}

	fn stop_connection(&mut self) {
		self.stop_current_operation();
		if self.connected {
			debug!("[file] closing {}", self.root.display());
		}
		self.connected = false;
	}

	fn close_connection(&mut self, client: AdapterClient) {
		self.stop_connection();
		debug!("[file] QUIT");
		self.task = Some(client.post([
			AdapterEventKind::AppendToTranscript { text: "QUIT".to_string(), kind: TranscriptKind::Sent },
			AdapterEventKind::AppendToTranscript {
				text: "221 goodbye".to_string(),
				kind: TranscriptKind::Received,
			},
			AdapterEventKind::DidCloseConnection,
		]));
	}

	fn change_directory(&mut self, client: AdapterClient, path: &str) {
		let remote = if path.starts_with('/') {
			path.to_string()
		} else {
			remote_join(&self.current_directory(), path)
		};
		let cwd = self.current_directory.clone();
		self.run(client, path, format!("CWD {}", path), move |local, _| async move {
			let meta = tokio::fs::metadata(&local).await?;
			if !meta.is_dir() {
				return Err(ConnectionError::new(ErrorKind::NotFound, "not a directory"));
			}
			*cwd.lock().unwrap_or_else(|e| e.into_inner()) = remote.clone();
			Ok(AdapterEventKind::DidChangeDirectory(remote))
		});
	}

	fn fetch_contents_of_directory(&mut self, client: AdapterClient, path: &str) {
		let remote = path.to_string();
		self.run(client, path, format!("LIST {}", path), move |local, _| async move {
			let entries = list_directory(remote, local).await?;
			Ok(AdapterEventKind::DidLoadContentsOfDirectory(entries))
		});
	}

	fn create_directory(
		&mut self,
		client: AdapterClient,
		path: &str,
		permissions: Option<u32>,
		ignore_existing: bool,
	) {
		self.run(client, path, format!("MKD {}", path), move |local, _| async move {
			match tokio::fs::metadata(&local).await {
				Ok(meta) if meta.is_dir() => {
					if ignore_existing {
						return Ok(AdapterEventKind::DidFinishCurrentOperation);
					}
					return Err(ConnectionError::new(ErrorKind::DirectoryExists, "directory exists"));
				}
				Ok(_) => return Err(ConnectionError::new(ErrorKind::FileExists, "a file has that name")),
				Err(_) => {}
			}
			tokio::fs::create_dir(&local).await?;
			if let Some(mode) = permissions {
				apply_mode(&local, mode).await?;
			}
			Ok(AdapterEventKind::DidFinishCurrentOperation)
		});
	}

	fn delete_item(&mut self, client: AdapterClient, path: &str, directory: bool) {
		let verb = if directory { "RMD" } else { "DELE" };
		self.run(client, path, format!("{} {}", verb, path), move |local, _| async move {
			if directory {
				tokio::fs::remove_dir(&local).await?;
			} else {
				let meta = tokio::fs::symlink_metadata(&local).await?;
				if meta.is_dir() {
					return Err(ConnectionError::new(ErrorKind::IsADirectory, "use rmdir"));
				}
				tokio::fs::remove_file(&local).await?;
			}
			Ok(AdapterEventKind::DidFinishCurrentOperation)
		});
	}

	fn move_item(&mut self, client: AdapterClient, from: &str, to: &str) {
		let line = format!("RNFR {} RNTO {}", from, to);
		let target = match self.resolve(to) {
			Ok(t) => t,
			Err(e) => return self.fail_operation(client, line, e),
		};
		self.run(client, from, line, move |local, _| async move {
			tokio::fs::rename(&local, &target).await?;
			Ok(AdapterEventKind::DidFinishCurrentOperation)
		});
	}

	fn set_permissions(&mut self, client: AdapterClient, mode: u32, path: &str) {
		self.run(client, path, format!("SITE CHMOD {:o} {}", mode, path), move |local, _| async move {
			apply_mode(&local, mode).await?;
			Ok(AdapterEventKind::DidFinishCurrentOperation)
		});
	}

	fn download_contents_of_file(&mut self, client: AdapterClient, path: &str, offset: u64) {
		let reporter = client.clone();
		self.run(client, path, format!("RETR {} @{}", path, offset), move |local, cancel| {
			download(reporter, local, offset, cancel)
		});
	}

	fn upload_data(&mut self, client: AdapterClient, source: UploadSource, path: &str, offset: u64) {
		let reporter = client.clone();
		self.run(client, path, format!("STOR {} @{}", path, offset), move |local, cancel| {
			upload(reporter, source, local, offset, cancel)
		});
	}

	fn check_existence(&mut self, client: AdapterClient, path: &str) {
		self.run(client, path, format!("SIZE {}", path), move |local, _| async move {
			let exists = tokio::fs::try_exists(&local).await?;
			Ok(AdapterEventKind::DidCheckExistence(exists))
		});
	}

	fn stop_current_operation(&mut self) {
		self.cancel.store(true, Ordering::SeqCst);
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}

	fn answer_authentication_challenge(&mut self, client: AdapterClient, response: ChallengeResponse) {
		match response {
			ChallengeResponse::UseCredential(credential) => {
				if self.required.as_ref().map(|r| *r == credential).unwrap_or(true) {
					self.open(client, None);
				} else {
					self.failed_challenges += 1;
					warn!("[file] credential for {} rejected", credential.user);
					let challenge = AdapterEventKind::DidReceiveAuthenticationChallenge(self.challenge());
					self.task = Some(client.post([challenge]));
				}
			}
			ChallengeResponse::ContinueWithoutCredential => {
				let err = ConnectionError::new(ErrorKind::BadCredentials, "a credential is required");
				self.task = Some(client.post([AdapterEventKind::DidFailWithError(err)]));
			}
			ChallengeResponse::Cancel => self.stop_connection(),
		}
	}
}

impl Drop for LocalAdapter {
	fn drop(&mut self) {
		self.stop_current_operation();
	}
}


// vim: ts=4
