//! Core vocabulary shared by the queue, the state machine and protocol adapters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Protocol phase a connection currently occupies
///
/// Exactly one state is active at a time. The state machine moves to a
/// command's `sent_state` when it dispatches the command; adapters may refine
/// that into one of its sub-states while the command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
	NotConnected,
	Idle,
	SentUsername,
	SentPassword,
	AwaitingCurrentDirectory,
	OpeningDataStream,
	AwaitingDirectoryContents,
	ChangingDirectory,
	CreateDirectory,
	DeleteDirectory,
	RenameFrom,
	RenameTo,
	AwaitingRename,
	DeleteFile,
	DownloadingFile,
	UploadingFile,
	SentOffset,
	SentQuit,
	SentFeatureRequest,
	SettingPermissions,
	SentSize,
	ChangedDirectory,
	SentDisconnect,
	CheckingFileExistence,
}

impl ConnectionState {
	/// States in which the connection is being opened or authenticated
	pub fn is_opening(self) -> bool {
		matches!(
			self,
			ConnectionState::SentUsername
				| ConnectionState::SentPassword
				| ConnectionState::SentFeatureRequest
				| ConnectionState::AwaitingCurrentDirectory
		)
	}

	/// Whether an adapter may report `sub` while a command that entered `self` runs
	pub fn allows_substate(self, sub: ConnectionState) -> bool {
		use ConnectionState::*;
		if self == sub {
			return true;
		}
		match self {
			SentUsername | SentPassword | SentFeatureRequest | AwaitingCurrentDirectory => {
				matches!(sub, SentPassword | SentFeatureRequest | AwaitingCurrentDirectory)
			}
			UploadingFile | DownloadingFile | SentOffset => {
				matches!(sub, OpeningDataStream | SentSize | SentOffset | UploadingFile | DownloadingFile)
			}
			OpeningDataStream | SentSize => {
				matches!(sub, OpeningDataStream | SentSize | SentOffset | UploadingFile | DownloadingFile)
			}
			AwaitingDirectoryContents => matches!(sub, OpeningDataStream),
			AwaitingRename | RenameFrom | RenameTo => matches!(sub, RenameFrom | RenameTo | AwaitingRename),
			ChangingDirectory => matches!(sub, ChangedDirectory),
			SentDisconnect => matches!(sub, SentQuit),
			_ => false,
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// Opaque client-supplied identifier of a requested operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

impl From<u64> for OperationId {
	fn from(v: u64) -> Self {
		OperationId(v)
	}
}

/// Identifies one dispatch of a command to an adapter
///
/// Adapter events carry the ticket of the dispatch they belong to; events
/// whose ticket is no longer current are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u64);

/// Queue a command is placed on, listed in dispatch priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueCategory {
	Commands,
	Uploads,
	Downloads,
	Deletions,
	Renames,
	Permissions,
	ExistenceChecks,
}

impl QueueCategory {
	/// Fixed dispatch priority
	pub const PRIORITY: [QueueCategory; 7] = [
		QueueCategory::Commands,
		QueueCategory::Uploads,
		QueueCategory::Downloads,
		QueueCategory::Deletions,
		QueueCategory::Renames,
		QueueCategory::Permissions,
		QueueCategory::ExistenceChecks,
	];

	pub(crate) fn index(self) -> usize {
		match self {
			QueueCategory::Commands => 0,
			QueueCategory::Uploads => 1,
			QueueCategory::Downloads => 2,
			QueueCategory::Deletions => 3,
			QueueCategory::Renames => 4,
			QueueCategory::Permissions => 5,
			QueueCategory::ExistenceChecks => 6,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			QueueCategory::Commands => "commands",
			QueueCategory::Uploads => "uploads",
			QueueCategory::Downloads => "downloads",
			QueueCategory::Deletions => "deletions",
			QueueCategory::Renames => "renames",
			QueueCategory::Permissions => "permissions",
			QueueCategory::ExistenceChecks => "existence-checks",
		}
	}
}

/// What an existence check does with the rest of its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistsAction {
	/// Report the result to the delegate and continue
	Report,
	/// Drop the dependents when the path exists
	Skip,
	/// Park the dependents until the client confirms an overwrite
	Confirm,
}

/// How an upload treats an already existing remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
	#[default]
	Overwrite,
	Skip,
	Ask,
}

impl std::str::FromStr for OverwritePolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"overwrite" => Ok(OverwritePolicy::Overwrite),
			"skip" => Ok(OverwritePolicy::Skip),
			"ask" => Ok(OverwritePolicy::Ask),
			other => Err(format!("unknown overwrite policy '{}'", other)),
		}
	}
}

/// Where upload data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
	File(PathBuf),
	Data(Vec<u8>),
}

/// Where downloaded data goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
	File(PathBuf),
	/// Data is only handed to the delegate
	Memory,
}

/// Immutable description of one requested action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
	ChangeDirectory { path: String },
	DirectoryContents { path: String },
	CreateDirectory { path: String, permissions: Option<u32>, ignore_existing: bool },
	DeleteFile { path: String },
	DeleteDirectory { path: String },
	Rename { from: String, to: String },
	SetPermissions { path: String, mode: u32 },
	Upload { source: UploadSource, remote_path: String, offset: u64 },
	Download { remote_path: String, target: DownloadTarget, offset: u64 },
	CheckExistence { path: String, on_exists: ExistsAction },
	Disconnect,
}

impl Operation {
	pub fn category(&self) -> QueueCategory {
		match self {
			Operation::ChangeDirectory { .. }
			| Operation::DirectoryContents { .. }
			| Operation::CreateDirectory { .. }
			| Operation::Disconnect => QueueCategory::Commands,
			Operation::Upload { .. } => QueueCategory::Uploads,
			Operation::Download { .. } => QueueCategory::Downloads,
			Operation::DeleteFile { .. } | Operation::DeleteDirectory { .. } => {
				QueueCategory::Deletions
			}
			Operation::Rename { .. } => QueueCategory::Renames,
			Operation::SetPermissions { .. } => QueueCategory::Permissions,
			Operation::CheckExistence { .. } => QueueCategory::ExistenceChecks,
		}
	}

	/// State the connection must be in before the command may run
	pub fn await_state(&self) -> ConnectionState {
		ConnectionState::Idle
	}

	/// State the connection enters once the command is dispatched
	pub fn sent_state(&self) -> ConnectionState {
		match self {
			Operation::ChangeDirectory { .. } => ConnectionState::ChangingDirectory,
			Operation::DirectoryContents { .. } => ConnectionState::AwaitingDirectoryContents,
			Operation::CreateDirectory { .. } => ConnectionState::CreateDirectory,
			Operation::DeleteFile { .. } => ConnectionState::DeleteFile,
			Operation::DeleteDirectory { .. } => ConnectionState::DeleteDirectory,
			Operation::Rename { .. } => ConnectionState::AwaitingRename,
			Operation::SetPermissions { .. } => ConnectionState::SettingPermissions,
			Operation::Upload { offset, .. } => {
				if *offset > 0 {
					ConnectionState::SentOffset
				} else {
					ConnectionState::UploadingFile
				}
			}
			Operation::Download { offset, .. } => {
				if *offset > 0 {
					ConnectionState::SentOffset
				} else {
					ConnectionState::DownloadingFile
				}
			}
			Operation::CheckExistence { .. } => ConnectionState::CheckingFileExistence,
			Operation::Disconnect => ConnectionState::SentDisconnect,
		}
	}

	/// Remote path the operation acts on, used for error context
	pub fn remote_path(&self) -> Option<&str> {
		match self {
			Operation::ChangeDirectory { path }
			| Operation::DirectoryContents { path }
			| Operation::CreateDirectory { path, .. }
			| Operation::DeleteFile { path }
			| Operation::DeleteDirectory { path }
			| Operation::SetPermissions { path, .. }
			| Operation::CheckExistence { path, .. } => Some(path),
			Operation::Rename { from, .. } => Some(from),
			Operation::Upload { remote_path, .. } | Operation::Download { remote_path, .. } => {
				Some(remote_path)
			}
			Operation::Disconnect => None,
		}
	}

	pub fn is_transfer(&self) -> bool {
		matches!(self, Operation::Upload { .. } | Operation::Download { .. })
	}

	pub fn is_upload(&self) -> bool {
		matches!(self, Operation::Upload { .. })
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Operation::ChangeDirectory { path } => write!(f, "cd {}", path),
			Operation::DirectoryContents { path } => write!(f, "list {}", path),
			Operation::CreateDirectory { path, .. } => write!(f, "mkdir {}", path),
			Operation::DeleteFile { path } => write!(f, "delete {}", path),
			Operation::DeleteDirectory { path } => write!(f, "rmdir {}", path),
			Operation::Rename { from, to } => write!(f, "rename {} -> {}", from, to),
			Operation::SetPermissions { path, mode } => write!(f, "chmod {:o} {}", mode, path),
			Operation::Upload { source, remote_path, offset } => match source {
				UploadSource::File(local) => {
					write!(f, "upload {} -> {} @{}", local.display(), remote_path, offset)
				}
				UploadSource::Data(data) => {
					write!(f, "upload <{} bytes> -> {} @{}", data.len(), remote_path, offset)
				}
			},
			Operation::Download { remote_path, target, offset } => match target {
				DownloadTarget::File(local) => {
					write!(f, "download {} -> {} @{}", remote_path, local.display(), offset)
				}
				DownloadTarget::Memory => write!(f, "download {} -> <memory> @{}", remote_path, offset),
			},
			Operation::CheckExistence { path, .. } => write!(f, "exists? {}", path),
			Operation::Disconnect => write!(f, "disconnect"),
		}
	}
}

/// Kind of a remote directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
	File,
	Directory,
	Symlink,
}

/// One item of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
	pub name: String,
	pub path: String,
	pub kind: EntryKind,
	pub size: u64,
	pub permissions: Option<u32>,
	pub modified: Option<SystemTime>,
}

/// Direction of a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
	Sent,
	Received,
	Info,
	Error,
}

/// Join a remote directory and an entry name with `/`
pub fn remote_join(dir: &str, name: &str) -> String {
	if name.starts_with('/') {
		return name.to_string();
	}
	if dir.is_empty() {
		return name.to_string();
	}
	if dir.ends_with('/') {
		format!("{}{}", dir, name)
	} else {
		format!("{}/{}", dir, name)
	}
}

/// Last component of a remote path
pub fn remote_basename(path: &str) -> &str {
	path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_category_priority_is_fixed() {
		let indices: Vec<usize> = QueueCategory::PRIORITY.iter().map(|c| c.index()).collect();
		assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 6]);
	}

	#[test]
	fn test_resumed_transfers_send_offset_first() {
		let op = Operation::Upload {
			source: UploadSource::Data(vec![1, 2, 3]),
			remote_path: "/a".into(),
			offset: 2,
		};
		assert_eq!(op.sent_state(), ConnectionState::SentOffset);
		assert!(ConnectionState::SentOffset.allows_substate(ConnectionState::UploadingFile));

		let op = Operation::Download {
			remote_path: "/a".into(),
			target: DownloadTarget::Memory,
			offset: 0,
		};
		assert_eq!(op.sent_state(), ConnectionState::DownloadingFile);
	}

	#[test]
	fn test_substates() {
		assert!(ConnectionState::AwaitingRename.allows_substate(ConnectionState::RenameFrom));
		assert!(ConnectionState::SentDisconnect.allows_substate(ConnectionState::SentQuit));
		assert!(!ConnectionState::DeleteFile.allows_substate(ConnectionState::UploadingFile));
		assert!(!ConnectionState::Idle.allows_substate(ConnectionState::SentQuit));
	}

	#[test]
	fn test_remote_paths() {
		assert_eq!(remote_join("/srv", "a.txt"), "/srv/a.txt");
		assert_eq!(remote_join("/srv/", "a.txt"), "/srv/a.txt");
		assert_eq!(remote_join("/srv", "/abs"), "/abs");
		assert_eq!(remote_basename("/srv/dir/"), "dir");
		assert_eq!(remote_basename("file"), "file");
	}

	#[test]
	fn test_overwrite_policy_parse() {
		assert_eq!("ask".parse::<OverwritePolicy>(), Ok(OverwritePolicy::Ask));
		assert!("maybe".parse::<OverwritePolicy>().is_err());
	}
}

// vim: ts=4
