//! Error types for xfer connections
//!
//! Every failure that reaches a delegate is a [`ConnectionError`]. The
//! [`ErrorKind`] carries the taxonomy, the remaining fields carry enough
//! context (path, operation identifier, underlying cause) for a caller to
//! decide whether to retry, skip or abort the session.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::types::OperationId;

/// Broad grouping of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
	Connectivity,
	Authentication,
	RemoteFilesystem,
	Transport,
	LocalIo,
	Adapter,
	Client,
}

/// Error kinds reported by the connection layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// URL could not be parsed or no adapter handles its scheme
	BadUrl,
	/// Operation or connection attempt timed out
	Timeout,
	/// DNS failure or host unreachable
	HostUnreachable,
	/// Established connection dropped
	ConnectionLost,
	/// Operation requested on a connection that is not open
	NotConnected,

	/// Server rejected the supplied credentials
	BadCredentials,
	/// Authentication challenge was cancelled
	AuthenticationCancelled,
	/// Server requires an account in addition to the credentials
	AccountRequired,

	NotFound,
	IsADirectory,
	PermissionDenied,
	InsufficientStorage,
	DirectoryExists,
	FileExists,

	/// TLS handshake or certificate failure
	Tls,

	/// Local file could not be created, opened, written or removed
	LocalIo,

	/// Protocol adapter internal failure
	Adapter,

	/// Operation was cancelled by the client
	Cancelled,
	/// An earlier command of the same chain failed
	DependencyFailed,
	/// Request makes no sense in the current connection state
	InvalidOperation,
	/// Connection is draining towards a disconnect
	Disconnecting,
}

impl ErrorKind {
	pub fn category(self) -> ErrorCategory {
		use ErrorKind::*;
		match self {
			BadUrl | Timeout | HostUnreachable | ConnectionLost | NotConnected => {
				ErrorCategory::Connectivity
			}
			BadCredentials | AuthenticationCancelled | AccountRequired => {
				ErrorCategory::Authentication
			}
			NotFound | IsADirectory | PermissionDenied | InsufficientStorage | DirectoryExists
			| FileExists => ErrorCategory::RemoteFilesystem,
			Tls => ErrorCategory::Transport,
			LocalIo => ErrorCategory::LocalIo,
			Adapter => ErrorCategory::Adapter,
			Cancelled | DependencyFailed | InvalidOperation | Disconnecting => ErrorCategory::Client,
		}
	}

	fn describe(self) -> &'static str {
		use ErrorKind::*;
		match self {
			BadUrl => "bad URL",
			Timeout => "timed out",
			HostUnreachable => "host unreachable",
			ConnectionLost => "connection lost",
			NotConnected => "not connected",
			BadCredentials => "bad credentials",
			AuthenticationCancelled => "authentication cancelled",
			AccountRequired => "account required",
			NotFound => "not found",
			IsADirectory => "is a directory",
			PermissionDenied => "permission denied",
			InsufficientStorage => "insufficient storage",
			DirectoryExists => "directory already exists",
			FileExists => "file already exists",
			Tls => "TLS failure",
			LocalIo => "local I/O error",
			Adapter => "protocol adapter error",
			Cancelled => "cancelled",
			DependencyFailed => "dependency failed",
			InvalidOperation => "invalid operation",
			Disconnecting => "connection is disconnecting",
		}
	}
}

/// Error surfaced by a connection, tagged with its originating operation
#[derive(Debug, Clone)]
pub struct ConnectionError {
	pub kind: ErrorKind,
	pub message: String,
	pub path: Option<String>,
	pub operation: Option<OperationId>,
	source: Option<Arc<dyn Error + Send + Sync>>,
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

impl ConnectionError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		ConnectionError { kind, message: message.into(), path: None, operation: None, source: None }
	}

	pub fn with_path(mut self, path: impl Into<String>) -> Self {
		self.path = Some(path.into());
		self
	}

	pub fn with_operation(mut self, id: OperationId) -> Self {
		self.operation = Some(id);
		self
	}

	pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
		self.source = Some(Arc::new(source));
		self
	}

	pub fn cancelled() -> Self {
		Self::new(ErrorKind::Cancelled, "operation cancelled")
	}

	pub fn not_connected() -> Self {
		Self::new(ErrorKind::NotConnected, "connection is not open")
	}

	pub fn invalid(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::InvalidOperation, message)
	}

	/// Local-side I/O failure on `path`
	pub fn local_io(path: impl Into<String>, e: io::Error) -> Self {
		let path = path.into();
		Self::new(ErrorKind::LocalIo, format!("{}: {}", path, e)).with_path(path).with_source(e)
	}

	/// Remote-side I/O failure on `path`, classified by the io error kind
	pub fn remote_io(path: impl Into<String>, e: io::Error) -> Self {
		let path = path.into();
		ConnectionError::from(e).with_path(path)
	}

	pub fn category(&self) -> ErrorCategory {
		self.kind.category()
	}

	/// Whether the failure invalidates the whole connection rather than one command
	pub fn is_connection_fatal(&self) -> bool {
		matches!(
			self.kind.category(),
			ErrorCategory::Connectivity | ErrorCategory::Authentication | ErrorCategory::Transport
		)
	}
}

impl fmt::Display for ConnectionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.kind.describe())?;
		if !self.message.is_empty() {
			write!(f, ": {}", self.message)?;
		}
		if let Some(id) = self.operation {
			write!(f, " (operation {})", id)?;
		}
		Ok(())
	}
}

impl Error for ConnectionError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
	}
}

impl From<io::Error> for ConnectionError {
	fn from(e: io::Error) -> Self {
		let kind = match e.kind() {
			io::ErrorKind::NotFound => ErrorKind::NotFound,
			io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
			io::ErrorKind::AlreadyExists => ErrorKind::FileExists,
			io::ErrorKind::TimedOut => ErrorKind::Timeout,
			io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::BrokenPipe => ErrorKind::ConnectionLost,
			io::ErrorKind::ConnectionRefused => ErrorKind::HostUnreachable,
			_ => ErrorKind::Adapter,
		};
		ConnectionError::new(kind, e.to_string()).with_source(e)
	}
}

impl From<url::ParseError> for ConnectionError {
	fn from(e: url::ParseError) -> Self {
		ConnectionError::new(ErrorKind::BadUrl, e.to_string())
	}
}

/// Configuration loading and validation errors
#[derive(Debug)]
pub enum ConfigError {
	/// Config file could not be read
	Read { path: String, source: io::Error },

	/// Config file is not valid TOML for the expected schema
	Parse { message: String },

	/// A value is out of its accepted range
	Invalid { field: &'static str, message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::Read { path, source } => {
				write!(f, "Cannot read config file {}: {}", path, source)
			}
			ConfigError::Parse { message } => write!(f, "Invalid config file: {}", message),
			ConfigError::Invalid { field, message } => {
				write!(f, "Invalid value for {}: {}", field, message)
			}
		}
	}
}

impl Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
	fn from(e: toml::de::Error) -> Self {
		ConfigError::Parse { message: e.to_string() }
	}
}


// vim: ts=4
