//! Recursive uploader
//!
//! Walks a local directory tree, mirrors it as a transfer record hierarchy
//! and feeds the files through a connection's upload queue. Directories are
//! created first in one bulk bracket; uploads are then kept at most
//! `max_concurrent` deep in the queue so that a large tree does not flood it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc;

use crate::config::UploaderConfig;
use crate::connection::{Connection, OperationRequest};
use crate::delegate::{TransferDelegate, TransferEvent};
use crate::error::{ConnectionError, ConnectionResult, ErrorKind};
use crate::logging::*;
use crate::transfer::TransferRecord;
use crate::types::{remote_basename, remote_join, Operation, OperationId, UploadSource};

/// One directory to create on the remote side
#[derive(Debug, Clone)]
pub struct PlannedDirectory {
	pub local: PathBuf,
	pub remote: String,
	pub record: TransferRecord,
}

/// One file to upload
#[derive(Debug, Clone)]
pub struct PlannedFile {
	pub local: PathBuf,
	pub remote: String,
	pub size: u64,
	pub record: TransferRecord,
}

/// Result of a recursive upload, or its plan on a dry run
#[derive(Debug)]
pub struct UploadReport {
	/// Record of the whole tree; sizes and progress roll up into it
	pub root: TransferRecord,
	pub directories: Vec<PlannedDirectory>,
	pub files: Vec<PlannedFile>,
	pub uploaded: usize,
	pub skipped: usize,
	pub failed: usize,
	pub errors: Vec<ConnectionError>,
	pub dry_run: bool,
	/// Bytes of the files uploaded successfully
	pub bytes: u64,
}

impl UploadReport {
	pub fn is_success(&self) -> bool {
		self.errors.is_empty()
	}
}

enum Tracked {
	/// `None` is the remote root itself
	Directory(Option<usize>),
	File(usize),
}

/// Local entries found by the walk, in walk order (parents first)
struct Walked {
	directories: Vec<(PathBuf, String)>,
	files: Vec<(PathBuf, String, u64)>,
	errors: Vec<ConnectionError>,
}

pub struct Uploader {
	config: UploaderConfig,
}

impl Uploader {
	pub fn new(config: UploaderConfig) -> Self {
		Uploader { config }
	}

	pub fn config(&self) -> &UploaderConfig {
		&self.config
	}

	/// Upload the tree below `local_root` into `remote_root`
	pub async fn upload(
		&self,
		connection: &Connection,
		local_root: &Path,
		remote_root: &str,
	) -> ConnectionResult<UploadReport> {
		let meta = tokio::fs::metadata(local_root)
			.await
			.map_err(|e| ConnectionError::local_io(local_root.display().to_string(), e))?;
		if !meta.is_dir() {
			return Err(ConnectionError::new(
				ErrorKind::LocalIo,
				format!("{} is not a directory", local_root.display()),
			)
			.with_path(local_root.display().to_string()));
		}
		let excludes = build_excludes(&self.config.exclude_patterns)?;

		let root = local_root.to_path_buf();
		let remote = remote_root.to_string();
		let walked = tokio::task::spawn_blocking(move || walk(&root, &remote, excludes))
			.await
			.map_err(|e| {
				ConnectionError::new(ErrorKind::Adapter, format!("tree walk failed: {}", e))
			})?;

		let mut report = self.plan(connection, remote_root, walked);
		info!(
			"{} directories and {} files ({} bytes) below {}",
			report.directories.len(),
			report.files.len(),
			report.root.snapshot().map(|s| s.size_with_children).unwrap_or(0),
			local_root.display()
		);
		if self.config.dry_run {
			return Ok(report);
		}
		self.run(connection, remote_root, &mut report).await?;
		Ok(report)
	}

	/// Build the record tree for everything the walk found
	fn plan(&self, connection: &Connection, remote_root: &str, walked: Walked) -> UploadReport {
		let store = connection.transfers();
		let root_name = match remote_basename(remote_root) {
			"" => "/",
			name => name,
		};
		let root = store.create(root_name, true, 0);
		let mut records: HashMap<String, TransferRecord> = HashMap::new();
		records.insert(remote_root.trim_end_matches('/').to_string(), root.clone());
		let parent_of = |records: &HashMap<String, TransferRecord>, remote: &str| {
			let parent = remote.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
			records.get(parent).cloned().unwrap_or_else(|| root.clone())
		};

		let mut directories = Vec::new();
		for (local, remote) in walked.directories {
			let parent = parent_of(&records, &remote);
			let record = store.create_child(&parent, remote_basename(&remote), true, 0);
			records.insert(remote.clone(), record.clone());
			directories.push(PlannedDirectory { local, remote, record });
		}
		let mut files = Vec::new();
		for (local, remote, size) in walked.files {
			let parent = parent_of(&records, &remote);
			let record = store.create_child(&parent, remote_basename(&remote), true, size);
			files.push(PlannedFile { local, remote, size, record });
		}
		for err in &walked.errors {
			warn!("{}", err);
		}

		UploadReport {
			root,
			directories,
			files,
			uploaded: 0,
			skipped: 0,
			failed: 0,
			errors: walked.errors,
			dry_run: self.config.dry_run,
			bytes: 0,
		}
	}

	async fn run(
		&self,
		connection: &Connection,
		remote_root: &str,
		report: &mut UploadReport,
	) -> ConnectionResult<()> {
		let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
		let delegate: Arc<dyn TransferDelegate> = Arc::new(move |event: TransferEvent| {
			let _ = tx.send(event);
		});
		let mut tracked: HashMap<OperationId, Tracked> = HashMap::new();

		// Directories go out in one batch ahead of any upload
		connection.start_bulk_commands().await?;
		let mut submitted = Ok(());
		let targets = std::iter::once(remote_root.to_string())
			.chain(report.directories.iter().map(|d| d.remote.clone()));
		for (n, path) in targets.enumerate() {
			let request = OperationRequest::new(Operation::CreateDirectory {
				path,
				permissions: None,
				ignore_existing: true,
			})
			.with_delegate(delegate.clone());
			match connection.submit(request).await {
				Ok(s) => {
					tracked.insert(s.id, Tracked::Directory(n.checked_sub(1)));
				}
				Err(e) => {
					submitted = Err(e);
					break;
				}
			}
		}
		connection.end_bulk_commands().await?;
		submitted?;

		let limit = self.config.max_concurrent.max(1);
		let mut next_file = 0;
		let mut uploads_pending = 0;
		loop {
			while uploads_pending < limit && next_file < report.files.len() {
				let index = next_file;
				next_file += 1;
				let file = &report.files[index];
				let mut request = OperationRequest::new(Operation::Upload {
					source: UploadSource::File(file.local.clone()),
					remote_path: file.remote.clone(),
					offset: 0,
				})
				.with_record(&file.record)
				.with_overwrite(self.config.overwrite)
				.with_delegate(delegate.clone());
				if let Some(mode) = self.config.file_permissions {
					request = request.with_permissions(mode);
				}
				match connection.submit(request).await {
					Ok(s) => {
						tracked.insert(s.id, Tracked::File(index));
						uploads_pending += 1;
					}
					Err(e) => {
						if e.kind == ErrorKind::NotConnected || e.kind == ErrorKind::Disconnecting {
							return Err(e);
						}
						warn!("cannot queue {}: {}", file.local.display(), e);
						connection.transfers().lock().set_error(file.record.id(), e.clone());
						report.failed += 1;
						report.errors.push(e);
					}
				}
			}
			if tracked.is_empty() {
				break;
			}
			let Some(event) = rx.recv().await else {
				break;
			};
			let (id, outcome) = match event {
				TransferEvent::Progress { .. } => continue,
				TransferEvent::Finished { id, error } => (id, error.map(Err).unwrap_or(Ok(true))),
				TransferEvent::Skipped { id } => (id, Ok(false)),
			};
			match tracked.remove(&id) {
				Some(Tracked::File(index)) => {
					uploads_pending -= 1;
					let file = &report.files[index];
					match outcome {
						Ok(true) => {
							debug!("uploaded {}", file.remote);
							report.uploaded += 1;
							report.bytes += file.size;
						}
						Ok(false) => {
							debug!("skipped {}", file.remote);
							report.skipped += 1;
						}
						Err(e) => {
							report.failed += 1;
							report.errors.push(e);
						}
					}
				}
				Some(Tracked::Directory(index)) => {
					if let Err(e) = outcome {
						if let Some(dir) = index.and_then(|i| report.directories.get(i)) {
							connection.transfers().lock().set_error(dir.record.id(), e.clone());
						}
						report.errors.push(e);
					}
				}
				None => {}
			}
		}

		let (errors, successes) = report.root.problems_counting_errors_and_successes();
		debug!("upload of {} done: {} errors, {} finished", remote_root, errors, successes);
		Ok(())
	}
}

fn build_excludes(patterns: &[String]) -> ConnectionResult<GlobSet> {
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = Glob::new(pattern)
			.map_err(|e| ConnectionError::invalid(format!("bad exclude pattern {}: {}", pattern, e)))?;
		builder.add(glob);
	}
	builder
		.build()
		.map_err(|e| ConnectionError::invalid(format!("cannot build exclude patterns: {}", e)))
}

/// Remote path of `local` below `remote_root`
fn remote_path_for(remote_root: &str, relative: &Path) -> String {
	let parts: Vec<String> =
		relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
	remote_join(remote_root, &parts.join("/"))
}

fn walk(local_root: &Path, remote_root: &str, excludes: GlobSet) -> Walked {
	let mut walked = Walked { directories: Vec::new(), files: Vec::new(), errors: Vec::new() };
	let filter_root = local_root.to_path_buf();
	let walker = ignore::WalkBuilder::new(local_root)
		.standard_filters(false)
		.hidden(false)
		.follow_links(false)
		.sort_by_file_name(|a, b| a.cmp(b))
		// Patterns match the path relative to the root or the bare name
		.filter_entry(move |entry| match entry.path().strip_prefix(&filter_root) {
			Ok(relative) if !relative.as_os_str().is_empty() => {
				!excludes.is_match(relative) && !excludes.is_match(Path::new(entry.file_name()))
			}
			_ => true,
		})
		.build();

	for result in walker {
		let entry = match result {
			Ok(entry) => entry,
			Err(e) => {
				walked.errors.push(ConnectionError::new(ErrorKind::LocalIo, e.to_string()));
				continue;
			}
		};
		if entry.depth() == 0 {
			continue;
		}
		let Ok(relative) = entry.path().strip_prefix(local_root) else {
			continue;
		};
		let remote = remote_path_for(remote_root, relative);
		match entry.file_type() {
			Some(t) if t.is_dir() => walked.directories.push((entry.path().to_path_buf(), remote)),
			Some(t) if t.is_file() => {
				let size = match entry.metadata() {
					Ok(meta) => meta.len(),
					Err(e) => {
						walked.errors.push(ConnectionError::new(ErrorKind::LocalIo, e.to_string()));
						continue;
					}
				};
				walked.files.push((entry.path().to_path_buf(), remote, size));
			}
			_ => debug!("skipping special file {}", entry.path().display()),
		}
	}
	walked
}


// vim: ts=4
