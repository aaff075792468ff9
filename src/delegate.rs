//! Client-facing delegate callbacks
//!
//! A [`ConnectionDelegate`] receives every notification of a connection. All
//! methods are optional (default no-ops); the delegate advertises which ones
//! it actually handles through [`DelegateCapabilities`], computed once when
//! the delegate is installed. The [`Dispatcher`] consults the cached
//! capabilities before each call and supplies default behavior where a
//! capability is missing. Dispatcher calls happen only on the connection's
//! owner task.

use std::sync::Arc;

use crate::auth::AuthChallenge;
use crate::error::{ConnectionError, ErrorKind};
use crate::logging::*;
use crate::transfer::TransferSnapshot;
use crate::types::{ConnectionState, DirectoryEntry, OperationId, TranscriptKind};

// Type aliases to reduce complexity
type OpenFn = dyn Fn(&str) + Send + Sync;
type DisconnectFn = dyn Fn() + Send + Sync;
type ErrorFn = dyn Fn(&ConnectionError) + Send + Sync;
type FinishFn = dyn Fn(OperationId) + Send + Sync;
type PathFn = dyn Fn(OperationId, &str) + Send + Sync;
type ListingFn = dyn Fn(OperationId, &str, &[DirectoryEntry]) + Send + Sync;
type ExistenceFn = dyn Fn(OperationId, &str, bool) + Send + Sync;
type ChallengeFn = dyn Fn(&AuthChallenge) + Send + Sync;
type ProgressFn = dyn Fn(OperationId, &TransferSnapshot) + Send + Sync;
type DataFn = dyn Fn(OperationId, &[u8]) + Send + Sync;
type TranscriptFn = dyn Fn(&str, TranscriptKind) + Send + Sync;
type StateFn = dyn Fn(ConnectionState, ConnectionState) + Send + Sync;

/// Optional delegate methods a delegate actually implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DelegateCapabilities {
	pub connection_events: bool,
	pub operation_events: bool,
	pub directory_contents: bool,
	pub existence_checks: bool,
	pub directory_changes: bool,
	/// Answers authentication challenges itself
	pub authentication: bool,
	/// Answers overwrite confirmations itself
	pub overwrite_confirmation: bool,
	pub transfer_progress: bool,
	pub downloaded_data: bool,
	pub transcript: bool,
	pub state_changes: bool,
}

impl DelegateCapabilities {
	/// No optional method implemented
	pub fn none() -> Self {
		Self::default()
	}

	/// Every plain notification, but neither challenge answering nor transcript
	pub fn notifications() -> Self {
		DelegateCapabilities {
			connection_events: true,
			operation_events: true,
			directory_contents: true,
			existence_checks: true,
			directory_changes: true,
			authentication: false,
			overwrite_confirmation: false,
			transfer_progress: true,
			downloaded_data: true,
			transcript: false,
			state_changes: true,
		}
	}
}

/// Receiver of connection notifications
///
/// Override `capabilities` when implementing `append_to_transcript` or when
/// answering challenges (`did_receive_authentication_challenge`,
/// `upload_needs_overwrite_confirmation`); a delegate that answers must call
/// back into the connection with its decision.
pub trait ConnectionDelegate: Send + Sync {
	fn capabilities(&self) -> DelegateCapabilities {
		DelegateCapabilities::notifications()
	}

	fn connection_did_open(&self, _current_directory: &str) {}

	fn connection_did_disconnect(&self) {}

	/// Connection-fatal failure; the connection is closed afterwards
	fn connection_did_fail(&self, _error: &ConnectionError) {}

	fn operation_did_finish(&self, _id: OperationId) {}

	/// Command-local failure, tagged with the originating operation
	fn operation_did_fail(&self, _error: &ConnectionError) {}

	/// Upload skipped because the remote file exists
	fn operation_was_skipped(&self, _id: OperationId, _path: &str) {}

	fn did_load_directory_contents(&self, _id: OperationId, _path: &str, _entries: &[DirectoryEntry]) {}

	fn did_check_existence(&self, _id: OperationId, _path: &str, _exists: bool) {}

	fn did_change_directory(&self, _id: OperationId, _path: &str) {}

	fn did_receive_authentication_challenge(&self, _challenge: &AuthChallenge) {}

	fn upload_needs_overwrite_confirmation(&self, _id: OperationId, _path: &str) {}

	fn transfer_did_progress(&self, _id: OperationId, _snapshot: &TransferSnapshot) {}

	fn did_download_data(&self, _id: OperationId, _data: &[u8]) {}

	fn append_to_transcript(&self, _text: &str, _kind: TranscriptKind) {}

	fn state_did_change(&self, _from: ConnectionState, _to: ConnectionState) {}
}

/// Delegate implementing nothing
pub struct NoDelegate;

impl ConnectionDelegate for NoDelegate {
	fn capabilities(&self) -> DelegateCapabilities {
		DelegateCapabilities::none()
	}
}

/// Builder for delegates using function closures
///
/// Capabilities follow from the closures that were set.
#[derive(Default)]
pub struct DelegateBuilder {
	open: Option<Box<OpenFn>>,
	disconnect: Option<Box<DisconnectFn>>,
	connection_failed: Option<Box<ErrorFn>>,
	finished: Option<Box<FinishFn>>,
	failed: Option<Box<ErrorFn>>,
	skipped: Option<Box<PathFn>>,
	listing: Option<Box<ListingFn>>,
	existence: Option<Box<ExistenceFn>>,
	changed_directory: Option<Box<PathFn>>,
	challenge: Option<Box<ChallengeFn>>,
	overwrite: Option<Box<PathFn>>,
	progress: Option<Box<ProgressFn>>,
	data: Option<Box<DataFn>>,
	transcript: Option<Box<TranscriptFn>>,
	state: Option<Box<StateFn>>,
}

impl DelegateBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn on_open<F>(mut self, callback: F) -> Self
	where
		F: Fn(&str) + Send + Sync + 'static,
	{
		self.open = Some(Box::new(callback));
		self
	}

	pub fn on_disconnect<F>(mut self, callback: F) -> Self
	where
		F: Fn() + Send + Sync + 'static,
	{
		self.disconnect = Some(Box::new(callback));
		self
	}

	pub fn on_connection_failed<F>(mut self, callback: F) -> Self
	where
		F: Fn(&ConnectionError) + Send + Sync + 'static,
	{
		self.connection_failed = Some(Box::new(callback));
		self
	}

	pub fn on_finish<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId) + Send + Sync + 'static,
	{
		self.finished = Some(Box::new(callback));
		self
	}

	pub fn on_fail<F>(mut self, callback: F) -> Self
	where
		F: Fn(&ConnectionError) + Send + Sync + 'static,
	{
		self.failed = Some(Box::new(callback));
		self
	}

	pub fn on_skip<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId, &str) + Send + Sync + 'static,
	{
		self.skipped = Some(Box::new(callback));
		self
	}

	pub fn on_directory_contents<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId, &str, &[DirectoryEntry]) + Send + Sync + 'static,
	{
		self.listing = Some(Box::new(callback));
		self
	}

	pub fn on_existence<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId, &str, bool) + Send + Sync + 'static,
	{
		self.existence = Some(Box::new(callback));
		self
	}

	pub fn on_change_directory<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId, &str) + Send + Sync + 'static,
	{
		self.changed_directory = Some(Box::new(callback));
		self
	}

	/// Handle authentication challenges; the closure must answer through the connection
	pub fn on_authentication_challenge<F>(mut self, callback: F) -> Self
	where
		F: Fn(&AuthChallenge) + Send + Sync + 'static,
	{
		self.challenge = Some(Box::new(callback));
		self
	}

	/// Handle overwrite confirmations; the closure must answer through the connection
	pub fn on_overwrite_confirmation<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId, &str) + Send + Sync + 'static,
	{
		self.overwrite = Some(Box::new(callback));
		self
	}

	pub fn on_progress<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId, &TransferSnapshot) + Send + Sync + 'static,
	{
		self.progress = Some(Box::new(callback));
		self
	}

	pub fn on_data<F>(mut self, callback: F) -> Self
	where
		F: Fn(OperationId, &[u8]) + Send + Sync + 'static,
	{
		self.data = Some(Box::new(callback));
		self
	}

	pub fn on_transcript<F>(mut self, callback: F) -> Self
	where
		F: Fn(&str, TranscriptKind) + Send + Sync + 'static,
	{
		self.transcript = Some(Box::new(callback));
		self
	}

	pub fn on_state_change<F>(mut self, callback: F) -> Self
	where
		F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
	{
		self.state = Some(Box::new(callback));
		self
	}

	pub fn build(self) -> Arc<dyn ConnectionDelegate> {
		let capabilities = DelegateCapabilities {
			connection_events: self.open.is_some()
				|| self.disconnect.is_some()
				|| self.connection_failed.is_some(),
			operation_events: self.finished.is_some() || self.failed.is_some() || self.skipped.is_some(),
			directory_contents: self.listing.is_some(),
			existence_checks: self.existence.is_some(),
			directory_changes: self.changed_directory.is_some(),
			authentication: self.challenge.is_some(),
			overwrite_confirmation: self.overwrite.is_some(),
			transfer_progress: self.progress.is_some(),
			downloaded_data: self.data.is_some(),
			transcript: self.transcript.is_some(),
			state_changes: self.state.is_some(),
		};
		Arc::new(CompositeDelegate { builder: self, capabilities })
	}
}

/// Internal composite delegate implementation
struct CompositeDelegate {
	builder: DelegateBuilder,
	capabilities: DelegateCapabilities,
}

impl ConnectionDelegate for CompositeDelegate {
	fn capabilities(&self) -> DelegateCapabilities {
		self.capabilities
	}

	fn connection_did_open(&self, current_directory: &str) {
		if let Some(ref callback) = self.builder.open {
			callback(current_directory);
		}
	}

	fn connection_did_disconnect(&self) {
		if let Some(ref callback) = self.builder.disconnect {
			callback();
		}
	}

	fn connection_did_fail(&self, error: &ConnectionError) {
		if let Some(ref callback) = self.builder.connection_failed {
			callback(error);
		}
	}

	fn operation_did_finish(&self, id: OperationId) {
		if let Some(ref callback) = self.builder.finished {
			callback(id);
		}
	}

	fn operation_did_fail(&self, error: &ConnectionError) {
		if let Some(ref callback) = self.builder.failed {
			callback(error);
		}
	}

	fn operation_was_skipped(&self, id: OperationId, path: &str) {
		if let Some(ref callback) = self.builder.skipped {
			callback(id, path);
		}
	}

	fn did_load_directory_contents(&self, id: OperationId, path: &str, entries: &[DirectoryEntry]) {
		if let Some(ref callback) = self.builder.listing {
			callback(id, path, entries);
		}
	}

	fn did_check_existence(&self, id: OperationId, path: &str, exists: bool) {
		if let Some(ref callback) = self.builder.existence {
			callback(id, path, exists);
		}
	}

	fn did_change_directory(&self, id: OperationId, path: &str) {
		if let Some(ref callback) = self.builder.changed_directory {
			callback(id, path);
		}
	}

	fn did_receive_authentication_challenge(&self, challenge: &AuthChallenge) {
		if let Some(ref callback) = self.builder.challenge {
			callback(challenge);
		}
	}

	fn upload_needs_overwrite_confirmation(&self, id: OperationId, path: &str) {
		if let Some(ref callback) = self.builder.overwrite {
			callback(id, path);
		}
	}

	fn transfer_did_progress(&self, id: OperationId, snapshot: &TransferSnapshot) {
		if let Some(ref callback) = self.builder.progress {
			callback(id, snapshot);
		}
	}

	fn did_download_data(&self, id: OperationId, data: &[u8]) {
		if let Some(ref callback) = self.builder.data {
			callback(id, data);
		}
	}

	fn append_to_transcript(&self, text: &str, kind: TranscriptKind) {
		if let Some(ref callback) = self.builder.transcript {
			callback(text, kind);
		}
	}

	fn state_did_change(&self, from: ConnectionState, to: ConnectionState) {
		if let Some(ref callback) = self.builder.state {
			callback(from, to);
		}
	}
}

/// Per-operation notification
#[derive(Debug, Clone)]
pub enum TransferEvent {
	Progress { id: OperationId, snapshot: TransferSnapshot },
	/// The operation's whole chain completed; `error` is set on failure
	Finished { id: OperationId, error: Option<ConnectionError> },
	Skipped { id: OperationId },
}

impl TransferEvent {
	pub fn id(&self) -> OperationId {
		match self {
			TransferEvent::Progress { id, .. }
			| TransferEvent::Finished { id, .. }
			| TransferEvent::Skipped { id } => *id,
		}
	}
}

/// Delegate attached to a single submitted operation
pub trait TransferDelegate: Send + Sync {
	fn on_event(&self, event: TransferEvent);
}

impl<F> TransferDelegate for F
where
	F: Fn(TransferEvent) + Send + Sync,
{
	fn on_event(&self, event: TransferEvent) {
		self(event)
	}
}

/// Routes notifications to the installed delegate, honoring its capabilities
pub struct Dispatcher {
	delegate: Arc<dyn ConnectionDelegate>,
	capabilities: DelegateCapabilities,
}

impl Default for Dispatcher {
	fn default() -> Self {
		Self::new(Arc::new(NoDelegate))
	}
}

impl Dispatcher {
	pub fn new(delegate: Arc<dyn ConnectionDelegate>) -> Self {
		let capabilities = delegate.capabilities();
		Dispatcher { delegate, capabilities }
	}

	/// Install a new delegate and recompute its capabilities
	pub fn set_delegate(&mut self, delegate: Arc<dyn ConnectionDelegate>) {
		self.capabilities = delegate.capabilities();
		self.delegate = delegate;
	}

	pub fn capabilities(&self) -> DelegateCapabilities {
		self.capabilities
	}

	pub fn connection_did_open(&self, current_directory: &str) {
		if self.capabilities.connection_events {
			self.delegate.connection_did_open(current_directory);
		}
	}

	pub fn connection_did_disconnect(&self) {
		if self.capabilities.connection_events {
			self.delegate.connection_did_disconnect();
		}
	}

	pub fn connection_did_fail(&self, error: &ConnectionError) {
		warn!("connection failed: {}", error);
		if self.capabilities.connection_events {
			self.delegate.connection_did_fail(error);
		}
	}

	pub fn operation_did_finish(&self, id: OperationId) {
		if self.capabilities.operation_events {
			self.delegate.operation_did_finish(id);
		}
	}

	pub fn operation_did_fail(&self, error: &ConnectionError) {
		if error.kind == ErrorKind::Cancelled {
			debug!("operation cancelled: {}", error);
		} else {
			warn!("operation failed: {}", error);
		}
		if self.capabilities.operation_events {
			self.delegate.operation_did_fail(error);
		}
	}

	pub fn operation_was_skipped(&self, id: OperationId, path: &str) {
		if self.capabilities.operation_events {
			self.delegate.operation_was_skipped(id, path);
		}
	}

	pub fn did_load_directory_contents(&self, id: OperationId, path: &str, entries: &[DirectoryEntry]) {
		if self.capabilities.directory_contents {
			self.delegate.did_load_directory_contents(id, path, entries);
		}
	}

	pub fn did_check_existence(&self, id: OperationId, path: &str, exists: bool) {
		if self.capabilities.existence_checks {
			self.delegate.did_check_existence(id, path, exists);
		}
	}

	pub fn did_change_directory(&self, id: OperationId, path: &str) {
		if self.capabilities.directory_changes {
			self.delegate.did_change_directory(id, path);
		}
	}

	/// Hand a challenge to the delegate; false when it does not answer challenges
	pub fn did_receive_authentication_challenge(&self, challenge: &AuthChallenge) -> bool {
		if !self.capabilities.authentication {
			return false;
		}
		self.delegate.did_receive_authentication_challenge(challenge);
		true
	}

	/// Ask the delegate to confirm an overwrite; false when it does not answer
	pub fn upload_needs_overwrite_confirmation(&self, id: OperationId, path: &str) -> bool {
		if !self.capabilities.overwrite_confirmation {
			return false;
		}
		self.delegate.upload_needs_overwrite_confirmation(id, path);
		true
	}

	pub fn transfer_did_progress(&self, id: OperationId, snapshot: &TransferSnapshot) {
		if self.capabilities.transfer_progress {
			self.delegate.transfer_did_progress(id, snapshot);
		}
	}

	pub fn did_download_data(&self, id: OperationId, data: &[u8]) {
		if self.capabilities.downloaded_data {
			self.delegate.did_download_data(id, data);
		}
	}

	pub fn append_to_transcript(&self, text: &str, kind: TranscriptKind) {
		if self.capabilities.transcript {
			self.delegate.append_to_transcript(text, kind);
		} else {
			trace!("transcript {:?}: {}", kind, text);
		}
	}

	pub fn state_did_change(&self, from: ConnectionState, to: ConnectionState) {
		if self.capabilities.state_changes {
			self.delegate.state_did_change(from, to);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn test_builder_capabilities_follow_closures() {
		let delegate = DelegateBuilder::new().on_finish(|_| {}).on_transcript(|_, _| {}).build();
		let caps = delegate.capabilities();
		assert!(caps.operation_events);
		assert!(caps.transcript);
		assert!(!caps.authentication);
		assert!(!caps.directory_contents);
	}

	#[test]
	fn test_dispatcher_skips_missing_capabilities() {
		let listed = Arc::new(AtomicUsize::new(0));
		let finished = Arc::new(AtomicUsize::new(0));
		let l = listed.clone();
		let f = finished.clone();
		let delegate = DelegateBuilder::new()
			.on_finish(move |_| {
				f.fetch_add(1, Ordering::SeqCst);
			})
			.build();
		let mut dispatcher = Dispatcher::new(delegate);
		dispatcher.operation_did_finish(OperationId(1));
		dispatcher.did_load_directory_contents(OperationId(2), "/", &[]);
		assert_eq!(finished.load(Ordering::SeqCst), 1);

		dispatcher.set_delegate(
			DelegateBuilder::new()
				.on_directory_contents(move |_, _, _| {
					l.fetch_add(1, Ordering::SeqCst);
				})
				.build(),
		);
		dispatcher.operation_did_finish(OperationId(3));
		dispatcher.did_load_directory_contents(OperationId(4), "/", &[]);
		assert_eq!(finished.load(Ordering::SeqCst), 1);
		assert_eq!(listed.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_challenge_falls_through_without_capability() {
		let dispatcher = Dispatcher::default();
		let challenge = AuthChallenge {
			host: "h".into(),
			protocol: "file".into(),
			previous_failure_count: 0,
			proposed: None,
			operation: None,
		};
		assert!(!dispatcher.did_receive_authentication_challenge(&challenge));
		assert!(!dispatcher.upload_needs_overwrite_confirmation(OperationId(1), "/a"));
	}

	#[test]
	fn test_closure_is_transfer_delegate() {
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		let delegate: Arc<dyn TransferDelegate> = Arc::new(move |event: TransferEvent| {
			assert_eq!(event.id(), OperationId(7));
			c.fetch_add(1, Ordering::SeqCst);
		});
		delegate.on_event(TransferEvent::Skipped { id: OperationId(7) });
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}
}

// vim: ts=4
