//! Connection state machine and queue discipline
//!
//! [`ConnectionMachine`] is the synchronous core of a connection. It owns the
//! protocol state, the operation queues, the command arena and the delegate
//! dispatcher, and it is only ever touched from the connection's owner task.
//! Client requests and adapter events arrive as plain method calls; the
//! adapter is driven fire-and-forget and answers later with ticketed events.
//!
//! At most one command is in flight. The queue check dispatches the next
//! command only when nothing is in flight, no authentication challenge is
//! pending, the connection is idle and no bulk bracket is open. Dependents of
//! a finished command run next, ahead of the seven category queues, so a
//! command chain always executes depth-first and uninterrupted.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use url::Url;
use uuid::Uuid;

use crate::adapter::{AdapterClient, AdapterEvent, AdapterEventKind, ProtocolAdapter};
use crate::auth::{AuthChallenge, ChallengeResponse, Credential, CredentialCache};
use crate::command::{Command, CommandArena, CommandId};
use crate::config::ConnectionConfig;
use crate::delegate::{ConnectionDelegate, Dispatcher, TransferDelegate, TransferEvent};
use crate::error::{ConnectionError, ConnectionResult, ErrorKind};
use crate::logging::*;
use crate::queue::{HistoryEntry, OperationQueues};
use crate::transfer::{RecordId, TransferRecord, TransferStore};
use crate::types::{
	remote_basename, ConnectionState, DirectoryEntry, DownloadTarget, ExistsAction, Operation,
	OperationId, OverwritePolicy, QueueCategory, Ticket, UploadSource,
};

use super::writer::DownloadSink;
use super::DriverMessage;

/// A client request to perform one operation
pub struct OperationRequest {
	operation: Operation,
	id: Option<OperationId>,
	record: Option<RecordId>,
	parent: Option<RecordId>,
	overwrite: OverwritePolicy,
	permissions: Option<u32>,
	delegate: Option<Arc<dyn TransferDelegate>>,
	/// Size of a local upload source, learned before submission
	source_size: Option<u64>,
}

impl OperationRequest {
	pub fn new(operation: Operation) -> Self {
		OperationRequest {
			operation,
			id: None,
			record: None,
			parent: None,
			overwrite: OverwritePolicy::Overwrite,
			permissions: None,
			delegate: None,
			source_size: None,
		}
	}

	/// Use a client-chosen identifier instead of an assigned one
	pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
		self.id = Some(id.into());
		self
	}

	/// Track the transfer in an existing record
	pub fn with_record(mut self, record: &TransferRecord) -> Self {
		self.record = Some(record.id());
		self
	}

	/// Track the transfer in a new record below `parent`
	pub fn with_parent(mut self, parent: &TransferRecord) -> Self {
		self.parent = Some(parent.id());
		self
	}

	/// What an upload does when the remote file exists
	pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
		self.overwrite = policy;
		self
	}

	/// Permissions set on an uploaded file once it is written
	pub fn with_permissions(mut self, mode: u32) -> Self {
		self.permissions = Some(mode);
		self
	}

	pub fn with_delegate(mut self, delegate: Arc<dyn TransferDelegate>) -> Self {
		self.delegate = Some(delegate);
		self
	}

	pub fn operation(&self) -> &Operation {
		&self.operation
	}

	/// Whether accepting the request creates a new root transfer record
	pub(crate) fn creates_root_record(&self) -> bool {
		self.operation.is_transfer() && self.record.is_none() && self.parent.is_none()
	}

	/// Check that a local upload source is a readable regular file and note its size
	///
	/// Runs on the submitting task, so the owner task never stats local files.
	pub async fn check_local_source(&mut self) -> ConnectionResult<()> {
		let Operation::Upload { source: UploadSource::File(local), .. } = &self.operation else {
			return Ok(());
		};
		let display = local.display().to_string();
		let meta = tokio::fs::metadata(local)
			.await
			.map_err(|e| ConnectionError::local_io(display.clone(), e))?;
		if !meta.is_file() {
			return Err(ConnectionError::new(
				ErrorKind::LocalIo,
				format!("{} is not a regular file", display),
			)
			.with_path(display));
		}
		self.source_size = Some(meta.len());
		Ok(())
	}
}

/// Identifier and transfer record of an accepted request
#[derive(Debug, Clone)]
pub struct Submitted {
	pub id: OperationId,
	pub record: Option<TransferRecord>,
}

struct InFlight {
	command: CommandId,
	ticket: Ticket,
	/// Writer of a download to a local file
	download: Option<DownloadSink>,
	/// The adapter finished; completion waits for the writer to flush
	flushing: bool,
}

#[derive(Default)]
struct AuthState {
	/// Challenges received since the connection or the last command succeeded
	attempts: u32,
	pending: Option<AuthChallenge>,
	/// Ticket the challenge arrived with; the answer goes back under it
	ticket: Option<Ticket>,
	awaiting_delegate: bool,
	timeout_deferred: bool,
}

/// Facts about a command that has left the arena, kept for reporting
struct Outcome {
	id: OperationId,
	path: Option<String>,
	record: Option<RecordId>,
	delegate: Option<Arc<dyn TransferDelegate>>,
}

impl Outcome {
	fn of(command: &Command) -> Self {
		Outcome {
			id: command.id,
			path: command.operation.remote_path().map(str::to_string),
			record: command.record(),
			delegate: command.delegate.clone(),
		}
	}
}

pub struct ConnectionMachine {
	url: Url,
	adapter: Box<dyn ProtocolAdapter>,
	tx: mpsc::Sender<DriverMessage>,
	config: ConnectionConfig,
	session: Uuid,

	state: ConnectionState,
	/// Published on every transition, before any reply leaves the owner task
	state_watch: watch::Sender<ConnectionState>,
	arena: CommandArena,
	queues: OperationQueues,
	transfers: TransferStore,
	dispatcher: Dispatcher,

	credential: Option<Credential>,
	credentials: Option<Arc<dyn CredentialCache>>,
	auth: AuthState,

	next_ticket: u64,
	next_operation: u64,
	session_ticket: Option<Ticket>,
	timer_request: Option<Ticket>,
	in_flight: Option<InFlight>,
	disconnect_requested: bool,
	current_directory: String,
	last_upload: Option<RecordId>,
	last_download: Option<RecordId>,
	last_error: Option<ConnectionError>,
}

impl ConnectionMachine {
	pub(crate) fn new(
		url: Url,
		adapter: Box<dyn ProtocolAdapter>,
		tx: mpsc::Sender<DriverMessage>,
		config: ConnectionConfig,
		transfers: TransferStore,
	) -> Self {
		let credential = if url.username().is_empty() {
			None
		} else {
			Some(Credential::new(url.username(), url.password().unwrap_or_default()))
		};
		ConnectionMachine {
			url,
			adapter,
			tx,
			config,
			session: Uuid::new_v4(),
			state: ConnectionState::NotConnected,
			state_watch: watch::channel(ConnectionState::NotConnected).0,
			arena: CommandArena::new(),
			queues: OperationQueues::new(),
			transfers,
			dispatcher: Dispatcher::default(),
			credential,
			credentials: None,
			auth: AuthState::default(),
			next_ticket: 0,
			next_operation: 0,
			session_ticket: None,
			timer_request: None,
			in_flight: None,
			disconnect_requested: false,
			current_directory: String::new(),
			last_upload: None,
			last_download: None,
			last_error: None,
		}
	}

	// === Configuration and queries ===

	pub fn set_delegate(&mut self, delegate: Arc<dyn ConnectionDelegate>) {
		self.dispatcher.set_delegate(delegate);
	}

	pub fn set_credential(&mut self, credential: Option<Credential>) {
		self.credential = credential;
	}

	pub fn set_credential_cache(&mut self, cache: Arc<dyn CredentialCache>) {
		self.credentials = Some(cache);
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
		self.state_watch.subscribe()
	}

	pub fn url(&self) -> &Url {
		&self.url
	}

	/// Identifier stamped on every transfer record of this connection
	pub fn session(&self) -> Uuid {
		self.session
	}

	pub fn current_directory(&self) -> &str {
		&self.current_directory
	}

	pub fn transfers(&self) -> TransferStore {
		self.transfers.clone()
	}

	pub fn is_busy(&self) -> bool {
		self.in_flight.is_some()
	}

	/// Operation identifier of the in-flight command
	pub fn in_flight_operation(&self) -> Option<OperationId> {
		self.in_flight.as_ref().and_then(|f| self.arena.get(f.command)).map(|c| c.id)
	}

	pub fn history(&self) -> &[HistoryEntry] {
		self.queues.history()
	}

	pub fn pending_count(&self) -> usize {
		self.queues.len()
	}

	pub fn files_needing_overwrite_confirmation(&self) -> Vec<String> {
		self.queues.files_needing_overwrite_confirmation().map(str::to_string).collect()
	}

	/// Smoothed speed of the current or most recent upload, bytes per second
	pub fn upload_speed(&self) -> f64 {
		self.last_upload.map(|r| self.transfers.lock().speed(r)).unwrap_or(0.0)
	}

	/// Smoothed speed of the current or most recent download, bytes per second
	pub fn download_speed(&self) -> f64 {
		self.last_download.map(|r| self.transfers.lock().speed(r)).unwrap_or(0.0)
	}

	pub fn queue_description(&self) -> String {
		let mut out = String::new();
		let _ = writeln!(out, "state: {}", self.state);
		if let Some(flight) = &self.in_flight {
			match self.arena.get(flight.command) {
				Some(command) => {
					let _ = writeln!(out, "in flight: {} (ticket {})", command, flight.ticket.0);
				}
				None => {
					let _ = writeln!(out, "in flight: <released {}>", flight.command);
				}
			}
		}
		if self.auth.pending.is_some() {
			let _ = writeln!(out, "awaiting authentication");
		}
		if self.disconnect_requested {
			let _ = writeln!(out, "disconnect requested");
		}
		out.push_str(&self.queues.describe(&self.arena));
		out
	}

	/// Error that closed the connection most recently
	pub fn last_error(&self) -> Option<&ConnectionError> {
		self.last_error.as_ref()
	}

	/// Connect-timeout timer the driver should arm
	pub(crate) fn take_timer_request(&mut self) -> Option<Ticket> {
		self.timer_request.take()
	}

	pub(crate) fn connect_timeout(&self) -> std::time::Duration {
		self.config.connect_timeout()
	}

	fn next_ticket(&mut self) -> Ticket {
		self.next_ticket += 1;
		Ticket(self.next_ticket)
	}

	fn client(&self, ticket: Ticket) -> AdapterClient {
		AdapterClient::new(self.tx.clone(), ticket)
	}

	fn set_state(&mut self, state: ConnectionState) {
		if self.state == state {
			return;
		}
		let from = self.state;
		debug!("state {} -> {}", from, state);
		self.state = state;
		self.state_watch.send_replace(state);
		self.dispatcher.state_did_change(from, state);
	}

	/// (state, event) pair that correct queue discipline never produces
	fn invariant_violation(&self, message: &str) {
		debug_assert!(false, "invariant violation in state {}: {}", self.state, message);
		error!("invariant violation in state {}: {}", self.state, message);
	}

	// === Connection lifecycle ===

	/// Start opening the connection; returns the session ticket
	pub fn connect(&mut self) -> ConnectionResult<Ticket> {
		if self.state != ConnectionState::NotConnected {
			return Err(ConnectionError::invalid(format!("cannot connect while {}", self.state)));
		}
		let ticket = self.next_ticket();
		self.session_ticket = Some(ticket);
		self.timer_request = Some(ticket);
		self.auth = AuthState::default();
		self.disconnect_requested = false;
		self.last_error = None;
		info!("connecting to {} via {}", self.url, self.adapter.name());
		let initial = if self.credential.is_some() {
			ConnectionState::SentPassword
		} else {
			ConnectionState::SentUsername
		};
		self.set_state(initial);
		let client = self.client(ticket);
		self.adapter.start_connection(client, self.credential.clone());
		Ok(ticket)
	}

	/// Disconnect once every queued command has run
	pub fn disconnect(&mut self) {
		if self.state == ConnectionState::NotConnected || self.disconnect_requested {
			return;
		}
		debug!("disconnect requested with {} commands pending", self.queues.len());
		self.disconnect_requested = true;
		self.check_queue();
	}

	/// Drop all pending work and close the connection immediately
	pub fn force_disconnect(&mut self) {
		self.teardown(None);
	}

	/// Alias of [`force_disconnect`](Self::force_disconnect)
	pub fn cancel_all(&mut self) {
		self.teardown(None);
	}

	pub fn handle_connect_timeout(&mut self, ticket: Ticket) {
		if self.session_ticket != Some(ticket) || !self.state.is_opening() {
			return;
		}
		if self.auth.awaiting_delegate {
			debug!("connect timeout deferred while the delegate answers a challenge");
			self.auth.timeout_deferred = true;
			return;
		}
		let err = ConnectionError::new(
			ErrorKind::Timeout,
			format!("no connection after {}s", self.config.connect_timeout_secs),
		);
		self.teardown(Some(err));
	}

	/// Close the connection, reporting the in-flight and queued commands
	///
	/// With `fatal` set the in-flight command fails with that error and the
	/// delegate hears about the connection failure; otherwise everything is
	/// reported as cancelled.
	fn teardown(&mut self, fatal: Option<ConnectionError>) {
		if self.state == ConnectionState::NotConnected && self.in_flight.is_none() && self.queues.is_empty()
		{
			return;
		}
		let mut reported = BTreeSet::new();

		if let Some(flight) = self.in_flight.take() {
			self.adapter.stop_current_operation();
			if let Some(command) = self.arena.release(flight.command) {
				let outcome = Outcome::of(&command);
				if command.operation != Operation::Disconnect {
					let err = fatal.clone().unwrap_or_else(ConnectionError::cancelled);
					reported.insert(outcome.id);
					self.report_failure(&outcome, err);
				}
			}
		}

		for root in self.queues.clear_all() {
			for command in self.arena.release_chain(root) {
				let outcome = Outcome::of(&command);
				if reported.insert(outcome.id) {
					self.report_failure(&outcome, ConnectionError::cancelled());
				} else if let Some(record) = outcome.record {
					self.transfers.lock().set_error(record, ConnectionError::cancelled());
				}
			}
		}

		self.adapter.stop_connection();
		self.session_ticket = None;
		self.timer_request = None;
		self.auth = AuthState::default();
		self.disconnect_requested = false;
		self.set_state(ConnectionState::NotConnected);
		if let Some(err) = fatal {
			self.dispatcher.connection_did_fail(&err);
			self.last_error = Some(err);
		}
		info!("disconnected from {}", self.url);
		self.dispatcher.connection_did_disconnect();
	}

	// === Submission ===

	/// Validate a request, decompose it into commands and queue them
	pub fn submit(&mut self, request: OperationRequest) -> ConnectionResult<Submitted> {
		self.validate(&request.operation)?;

		let id = match request.id {
			Some(id) => id,
			None => {
				self.next_operation += 1;
				OperationId(self.next_operation)
			}
		};
		let record = self.record_for(&request);

		let OperationRequest { operation, overwrite, permissions, delegate, .. } = request;
		let category = operation.category();
		let new_command = |op: Operation| {
			let mut command = Command::new(op, id);
			command.delegate = delegate.clone();
			command
		};

		let root = match operation {
			Operation::Upload { ref remote_path, .. } => {
				let remote_path = remote_path.clone();
				let mut upload = new_command(operation);
				upload.record = record;
				let upload = self.arena.insert(upload);
				if let Some(mode) = permissions {
					let chmod = self.arena.insert(new_command(Operation::SetPermissions {
						path: remote_path.clone(),
						mode,
					}));
					self.arena.add_dependent(upload, chmod);
				}
				let on_exists = match overwrite {
					OverwritePolicy::Overwrite => None,
					OverwritePolicy::Skip => Some(ExistsAction::Skip),
					OverwritePolicy::Ask => Some(ExistsAction::Confirm),
				};
				match on_exists {
					None => upload,
					Some(on_exists) => {
						let check = self.arena.insert(
							new_command(Operation::CheckExistence { path: remote_path, on_exists })
								.with_property("policy", format!("{:?}", overwrite).to_lowercase()),
						);
						self.arena.add_dependent(check, upload);
						check
					}
				}
			}
			op => {
				let mut command = new_command(op);
				command.record = record;
				self.arena.insert(command)
			}
		};

		let root_category = self.arena.get(root).map(|c| c.category()).unwrap_or(category);
		debug!(
			"queued {} on {} ({} pending)",
			self.arena.get(root).map(|c| c.to_string()).unwrap_or_default(),
			root_category.name(),
			self.queues.len() + 1
		);
		self.queues.enqueue(root, root_category);
		self.check_queue();

		Ok(Submitted { id, record: record.map(|r| self.transfers.handle(r)) })
	}

	fn validate(&self, operation: &Operation) -> ConnectionResult<()> {
		if self.state == ConnectionState::NotConnected {
			return Err(ConnectionError::not_connected());
		}
		if self.disconnect_requested {
			return Err(ConnectionError::new(ErrorKind::Disconnecting, "disconnect is pending"));
		}
		match operation {
			Operation::Disconnect => {
				Err(ConnectionError::invalid("use disconnect() to close the connection"))
			}
			Operation::DirectoryContents { path } => {
				if self.listing_pending() {
					Err(ConnectionError::invalid("a directory listing is already pending")
						.with_path(path.clone()))
				} else {
					Ok(())
				}
			}
			Operation::Rename { from, to } if from == to => {
				Err(ConnectionError::invalid("rename source and target are the same")
					.with_path(from.clone()))
			}
			_ => Ok(()),
		}
	}

	/// Whether any directory listing is queued or in flight
	fn listing_pending(&self) -> bool {
		let is_listing = |id: &CommandId| {
			matches!(
				self.arena.get(*id).map(|c| &c.operation),
				Some(Operation::DirectoryContents { .. })
			)
		};
		self.in_flight.as_ref().map(|f| is_listing(&f.command)).unwrap_or(false)
			|| self.queues.iter(QueueCategory::Commands).any(is_listing)
			|| self.queues.chain_iter().any(is_listing)
	}

	fn record_for(&mut self, request: &OperationRequest) -> Option<RecordId> {
		let (name, is_upload, size) = match &request.operation {
			Operation::Upload { source, remote_path, offset } => {
				// An unknown file size is filled in when the adapter learns it
				let total = match source {
					UploadSource::Data(data) => data.len() as u64,
					UploadSource::File(_) => request.source_size.unwrap_or(0),
				};
				(remote_basename(remote_path).to_string(), true, total.saturating_sub(*offset))
			}
			Operation::Download { remote_path, .. } => {
				(remote_basename(remote_path).to_string(), false, 0)
			}
			_ => return None,
		};
		let mut tree = self.transfers.lock();
		let id = match request.record.filter(|r| tree.contains(*r)) {
			Some(existing) => existing,
			None => {
				let id = tree.create(&name, is_upload, size);
				if let Some(parent) = request.parent.filter(|p| tree.contains(*p)) {
					tree.add_child(parent, id);
				}
				id
			}
		};
		tree.set_connection(id, self.session);
		Some(id)
	}

	// === Bulk commands ===

	pub fn start_bulk_commands(&mut self) {
		self.queues.start_bulk();
	}

	pub fn end_bulk_commands(&mut self) {
		if self.queues.end_bulk() {
			debug!("bulk bracket closed with {} commands pending", self.queues.len());
			self.check_queue();
		}
	}

	// === Queue check ===

	/// Dispatch the next command if the connection can take one
	///
	/// Re-entrant calls coalesce into one more pass of the running check.
	pub fn check_queue(&mut self) {
		if !self.queues.begin_check() {
			return;
		}
		loop {
			self.dispatch_ready();
			if !self.queues.end_check() {
				break;
			}
		}
	}

	fn can_dispatch(&self) -> bool {
		self.in_flight.is_none()
			&& self.auth.pending.is_none()
			&& self.state == ConnectionState::Idle
			&& !self.queues.is_bulk()
	}

	fn dispatch_ready(&mut self) {
		while self.can_dispatch() {
			match self.next_command() {
				Some(id) => self.dispatch(id),
				None => {
					if self.disconnect_requested {
						self.dispatch_disconnect();
					}
					break;
				}
			}
		}
	}

	/// Pending chain first, then the queues in priority order
	fn next_command(&mut self) -> Option<CommandId> {
		while let Some(id) = self.queues.peek_chain() {
			match self.arena.get(id) {
				Some(command) if command.await_state == self.state => return self.queues.pop_chain(),
				Some(_) => return None,
				None => {
					self.queues.pop_chain();
				}
			}
		}
		for category in QueueCategory::PRIORITY {
			while let Some(id) = self.queues.peek(category) {
				match self.arena.get(id) {
					Some(command) if command.await_state == self.state => {
						return self.queues.dequeue(category);
					}
					Some(_) => break,
					None => {
						self.queues.dequeue(category);
					}
				}
			}
		}
		None
	}

	fn dispatch_disconnect(&mut self) {
		for path in self.files_needing_overwrite_confirmation() {
			self.resolve_parked(&path, false, ConnectionError::cancelled());
		}
		self.next_operation += 1;
		let id = self.arena.insert(Command::new(Operation::Disconnect, OperationId(self.next_operation)));
		self.dispatch(id);
	}

	fn dispatch(&mut self, id: CommandId) {
		let Some(command) = self.arena.get(id) else {
			return;
		};
		let operation = command.operation.clone();
		let sent_state = command.sent_state;
		let record = command.record();
		let (operation_id, category, summary) = (command.id, command.category(), command.to_string());
		let ticket = self.next_ticket();
		debug!("dispatch {} (ticket {})", summary, ticket.0);
		self.queues.record_history(HistoryEntry {
			ticket,
			id: operation_id,
			category,
			summary,
			sent_state,
		});

		let download = match &operation {
			Operation::Download { target: DownloadTarget::File(local), offset, .. } => {
				Some(DownloadSink::spawn(local.clone(), *offset, ticket, self.tx.clone()))
			}
			_ => None,
		};

		if let Some(record) = record {
			let mut tree = self.transfers.lock();
			tree.set_bytes_transferred(record, 0, Instant::now());
			drop(tree);
			if operation.is_upload() {
				self.last_upload = Some(record);
			} else {
				self.last_download = Some(record);
			}
		}

		self.in_flight = Some(InFlight { command: id, ticket, download, flushing: false });
		self.set_state(sent_state);

		let client = self.client(ticket);
		match operation {
			Operation::ChangeDirectory { path } => self.adapter.change_directory(client, &path),
			Operation::DirectoryContents { path } => {
				self.adapter.fetch_contents_of_directory(client, &path)
			}
			Operation::CreateDirectory { path, permissions, ignore_existing } => {
				self.adapter.create_directory(client, &path, permissions, ignore_existing)
			}
			Operation::DeleteFile { path } => self.adapter.delete_item(client, &path, false),
			Operation::DeleteDirectory { path } => self.adapter.delete_item(client, &path, true),
			Operation::Rename { from, to } => self.adapter.move_item(client, &from, &to),
			Operation::SetPermissions { path, mode } => {
				self.adapter.set_permissions(client, mode, &path)
			}
			Operation::Upload { source, remote_path, offset } => {
				self.adapter.upload_data(client, source, &remote_path, offset)
			}
			Operation::Download { remote_path, offset, .. } => {
				self.adapter.download_contents_of_file(client, &remote_path, offset)
			}
			Operation::CheckExistence { path, .. } => self.adapter.check_existence(client, &path),
			Operation::Disconnect => self.adapter.close_connection(client),
		}
	}

	// === Adapter events ===

	fn is_current(&self, ticket: Ticket) -> bool {
		self.in_flight.as_ref().map(|f| f.ticket == ticket).unwrap_or(false)
	}

	fn is_session(&self, ticket: Ticket) -> bool {
		self.session_ticket.map(|s| ticket >= s).unwrap_or(false)
	}

	fn current_operation(&self) -> Option<&Operation> {
		self.in_flight.as_ref().and_then(|f| self.arena.get(f.command)).map(|c| &c.operation)
	}

	pub fn handle_adapter_event(&mut self, event: AdapterEvent) {
		let AdapterEvent { ticket, kind } = event;
		match kind {
			AdapterEventKind::AppendToTranscript { text, kind } => {
				if self.is_session(ticket) {
					self.dispatcher.append_to_transcript(&text, kind);
				}
			}
			AdapterEventKind::DidOpenConnection { current_directory } => {
				if self.session_ticket != Some(ticket) {
					trace!("dropping open event of ticket {}", ticket.0);
				} else if !self.state.is_opening() {
					self.invariant_violation("connection opened twice");
				} else {
					self.did_open(current_directory);
				}
			}
			AdapterEventKind::DidFailWithError(err) => {
				if self.is_session(ticket) {
					self.fail_connection(err);
				} else {
					debug!("dropping failure of stale ticket {}: {}", ticket.0, err);
				}
			}
			AdapterEventKind::DidCloseConnection => {
				if !self.is_session(ticket) {
					return;
				}
				if matches!(self.current_operation(), Some(Operation::Disconnect)) {
					self.did_close();
				} else {
					self.fail_connection(ConnectionError::new(
						ErrorKind::ConnectionLost,
						"connection closed by the server",
					));
				}
			}
			AdapterEventKind::DidReceiveAuthenticationChallenge(challenge) => {
				let opening = self.session_ticket == Some(ticket) && self.state.is_opening();
				if opening || self.is_current(ticket) {
					self.handle_challenge(ticket, challenge);
				} else {
					debug!("dropping challenge of stale ticket {}", ticket.0);
				}
			}
			AdapterEventKind::DidEnterState(sub)
				if self.session_ticket == Some(ticket) && self.state.is_opening() =>
			{
				if self.state.allows_substate(sub) {
					self.set_state(sub);
				} else {
					self.invariant_violation(&format!("sub-state {} while opening", sub));
				}
			}
			other => {
				if !self.is_current(ticket) {
					trace!("dropping stale event of ticket {}: {:?}", ticket.0, other);
					return;
				}
				self.handle_operation_event(other);
			}
		}
	}

	fn handle_operation_event(&mut self, kind: AdapterEventKind) {
		match kind {
			AdapterEventKind::DidFinishCurrentOperation => self.finish_current(),
			AdapterEventKind::CurrentOperationDidFail(err) => {
				if err.is_connection_fatal() {
					self.fail_connection(err);
				} else {
					self.fail_current(err);
				}
			}
			AdapterEventKind::DidDownloadData(data) => self.on_downloaded(data),
			AdapterEventKind::DidUploadDataOfLength(length) => {
				if matches!(self.current_operation(), Some(Operation::Upload { .. })) {
					self.on_transferred(length);
				} else {
					self.invariant_violation("upload progress without an upload in flight");
				}
			}
			AdapterEventKind::DidLearnTransferSize(size) => {
				let record = self.current_command().and_then(|c| c.record());
				match record {
					Some(record) => self.transfers.lock().set_size(record, size),
					None => self.invariant_violation("transfer size without a transfer in flight"),
				}
			}
			AdapterEventKind::DidLoadContentsOfDirectory(entries) => self.on_listing(entries),
			AdapterEventKind::DidCheckExistence(exists) => self.on_existence(exists),
			AdapterEventKind::DidChangeDirectory(path) => {
				let Some(command) = self.current_command() else {
					return;
				};
				if !matches!(command.operation, Operation::ChangeDirectory { .. }) {
					self.invariant_violation("directory change without cd in flight");
					return;
				}
				let id = command.id;
				self.current_directory = path.clone();
				self.dispatcher.did_change_directory(id, &path);
				self.complete_current();
			}
			AdapterEventKind::DidEnterState(sub) => {
				let base = self.current_command().map(|c| c.sent_state).unwrap_or(self.state);
				if base.allows_substate(sub) || self.state.allows_substate(sub) {
					self.set_state(sub);
				} else {
					self.invariant_violation(&format!("sub-state {} while running {}", sub, base));
				}
			}
			_ => {}
		}
	}

	fn current_command(&self) -> Option<&Command> {
		self.in_flight.as_ref().and_then(|f| self.arena.get(f.command))
	}

	fn did_open(&mut self, current_directory: String) {
		info!("connected to {} in {}", self.url, current_directory);
		self.auth = AuthState::default();
		self.timer_request = None;
		self.current_directory = current_directory;
		self.set_state(ConnectionState::Idle);
		self.dispatcher.connection_did_open(&self.current_directory);
		self.check_queue();
	}

	fn did_close(&mut self) {
		if let Some(flight) = self.in_flight.take() {
			self.arena.release(flight.command);
		}
		self.adapter.stop_connection();
		self.session_ticket = None;
		self.disconnect_requested = false;
		self.set_state(ConnectionState::NotConnected);
		info!("disconnected from {}", self.url);
		self.dispatcher.connection_did_disconnect();
	}

	fn fail_connection(&mut self, err: ConnectionError) {
		let err = match (err.operation, self.in_flight_operation()) {
			(None, Some(id)) => err.with_operation(id),
			_ => err,
		};
		self.teardown(Some(err));
	}

	// === Transfers ===

	fn on_transferred(&mut self, length: u64) {
		let Some(command) = self.current_command() else {
			return;
		};
		let id = command.id;
		let record = command.record();
		let delegate = command.delegate.clone();
		let running = if command.operation.is_upload() {
			ConnectionState::UploadingFile
		} else {
			ConnectionState::DownloadingFile
		};
		if self.state == ConnectionState::SentOffset {
			self.set_state(running);
		}
		let Some(record) = record else {
			return;
		};
		let snapshot = {
			let mut tree = self.transfers.lock();
			tree.add_bytes_transferred(record, length, Instant::now());
			tree.snapshot(record)
		};
		let Some(snapshot) = snapshot else {
			return;
		};
		self.dispatcher.transfer_did_progress(id, &snapshot);
		if let Some(delegate) = delegate {
			delegate.on_event(TransferEvent::Progress { id, snapshot });
		}
	}

	fn on_downloaded(&mut self, data: Vec<u8>) {
		let Some(command) = self.current_command() else {
			return;
		};
		let Operation::Download { target, .. } = &command.operation else {
			self.invariant_violation("download data without a download in flight");
			return;
		};
		let id = command.id;
		let to_file = matches!(target, DownloadTarget::File(_));
		let length = data.len() as u64;
		if to_file {
			match self.in_flight.as_ref().and_then(|f| f.download.as_ref()) {
				Some(sink) => sink.write(data),
				None => {
					self.invariant_violation("download data after the writer was closed");
					return;
				}
			}
		} else {
			self.dispatcher.did_download_data(id, &data);
		}
		self.on_transferred(length);
	}

	// === Results ===

	fn on_listing(&mut self, entries: Vec<DirectoryEntry>) {
		let Some(command) = self.current_command() else {
			return;
		};
		let Operation::DirectoryContents { path } = &command.operation else {
			self.invariant_violation("listing without a listing in flight");
			return;
		};
		let (id, path) = (command.id, path.clone());
		debug!("{} entries in {}", entries.len(), path);
		self.dispatcher.did_load_directory_contents(id, &path, &entries);
		self.complete_current();
	}

	fn on_existence(&mut self, exists: bool) {
		let Some(command) = self.current_command() else {
			return;
		};
		let Operation::CheckExistence { path, on_exists } = &command.operation else {
			self.invariant_violation("existence result without a check in flight");
			return;
		};
		let (id, path, on_exists) = (command.id, path.clone(), *on_exists);
		if on_exists == ExistsAction::Report {
			self.dispatcher.did_check_existence(id, &path, exists);
		}
		if !exists || on_exists == ExistsAction::Report {
			self.complete_current();
			return;
		}

		let Some(flight) = self.in_flight.take() else {
			return;
		};
		let dependents = self.arena.take_dependents(flight.command);
		let delegate = self.arena.release(flight.command).and_then(|c| c.delegate);
		self.set_state(ConnectionState::Idle);

		match on_exists {
			ExistsAction::Confirm => {
				if self.dispatcher.upload_needs_overwrite_confirmation(id, &path) {
					debug!("{} exists, waiting for overwrite confirmation", path);
					self.queues.park_for_confirmation(&path, dependents);
				} else {
					let err = ConnectionError::new(ErrorKind::FileExists, "overwrite not confirmed")
						.with_path(path.clone())
						.with_operation(id);
					self.drop_commands(dependents, Some(err));
				}
			}
			_ => {
				debug!("{} exists, skipping", path);
				self.drop_commands(dependents, None);
				self.dispatcher.operation_was_skipped(id, &path);
				if let Some(delegate) = delegate {
					delegate.on_event(TransferEvent::Skipped { id });
				}
			}
		}
		self.check_queue();
	}

	/// Release chains that will not run; records are marked skipped or failed
	fn drop_commands(&mut self, roots: Vec<CommandId>, error: Option<ConnectionError>) {
		let mut reported = BTreeSet::new();
		for root in roots {
			for command in self.arena.release_chain(root) {
				let outcome = Outcome::of(&command);
				match &error {
					Some(err) if reported.insert(outcome.id) => self.report_failure(&outcome, err.clone()),
					Some(err) => {
						if let Some(record) = outcome.record {
							self.transfers.lock().set_error(record, err.clone());
						}
					}
					None => {
						if let Some(record) = outcome.record {
							self.transfers.lock().mark_skipped(record);
						}
					}
				}
			}
		}
	}

	/// Resolve an overwrite confirmation for `path`
	pub fn confirm_overwrite(&mut self, path: &str, allow: bool) -> ConnectionResult<()> {
		if !self.resolve_parked(path, allow, ConnectionError::new(ErrorKind::FileExists, "overwrite declined"))
		{
			return Err(ConnectionError::invalid(format!("no confirmation pending for {}", path))
				.with_path(path));
		}
		self.check_queue();
		Ok(())
	}

	fn resolve_parked(&mut self, path: &str, allow: bool, decline: ConnectionError) -> bool {
		let Some(parked) = self.queues.take_confirmation(path) else {
			return false;
		};
		if allow {
			debug!("overwrite of {} confirmed", path);
			for id in parked.into_iter().rev() {
				if let Some(category) = self.arena.get(id).map(|c| c.category()) {
					self.queues.push_front(id, category);
				}
			}
		} else if decline.kind == ErrorKind::Cancelled {
			self.drop_commands(parked, Some(decline.with_path(path)));
		} else {
			let ids: BTreeSet<OperationId> =
				parked.iter().filter_map(|c| self.arena.get(*c)).map(|c| c.id).collect();
			let delegates: Vec<_> = parked
				.iter()
				.filter_map(|c| self.arena.get(*c))
				.map(|c| (c.id, c.delegate.clone()))
				.collect();
			self.drop_commands(parked, None);
			for id in ids {
				self.dispatcher.operation_was_skipped(id, path);
			}
			for (id, delegate) in delegates {
				if let Some(delegate) = delegate {
					delegate.on_event(TransferEvent::Skipped { id });
				}
			}
		}
		true
	}

	/// The adapter finished the in-flight command
	///
	/// A download into a file completes once its writer has flushed.
	fn finish_current(&mut self) {
		let Some(flight) = self.in_flight.as_mut() else {
			return;
		};
		if let Some(sink) = flight.download.take() {
			drop(sink);
			flight.flushing = true;
			trace!("waiting for the download writer of ticket {}", flight.ticket.0);
			return;
		}
		if flight.flushing {
			self.invariant_violation("operation finished twice");
		} else {
			self.complete_current();
		}
	}

	/// Result of the in-flight download's writer task
	pub(crate) fn handle_download_written(
		&mut self,
		ticket: Ticket,
		result: Result<(), ConnectionError>,
	) {
		let flushing = match &self.in_flight {
			Some(flight) if flight.ticket == ticket => flight.flushing,
			_ => {
				trace!("dropping write report of stale ticket {}", ticket.0);
				return;
			}
		};
		match result {
			Ok(()) if flushing => self.complete_current(),
			Ok(()) => self.invariant_violation("download writer closed early"),
			Err(e) => {
				if !flushing {
					self.adapter.stop_current_operation();
				}
				self.fail_current(e);
			}
		}
	}

	/// The in-flight command succeeded; its dependents run next
	fn complete_current(&mut self) {
		let Some(flight) = self.in_flight.take() else {
			return;
		};
		let dependents = self.arena.take_dependents(flight.command);
		let Some(command) = self.arena.release(flight.command) else {
			return;
		};
		let outcome = Outcome::of(&command);
		self.auth.attempts = 0;
		debug!("finished {}", command);

		if let Some(record) = outcome.record {
			let snapshot = {
				let mut tree = self.transfers.lock();
				tree.mark_finished(record);
				tree.snapshot(record)
			};
			if let Some(snapshot) = snapshot {
				self.dispatcher.transfer_did_progress(outcome.id, &snapshot);
			}
		}

		self.queues.prepend_chain(dependents);
		self.set_state(ConnectionState::Idle);
		if !self.chain_has(outcome.id) {
			self.dispatcher.operation_did_finish(outcome.id);
			if let Some(delegate) = &outcome.delegate {
				delegate.on_event(TransferEvent::Finished { id: outcome.id, error: None });
			}
		}
		self.check_queue();
	}

	fn chain_has(&self, id: OperationId) -> bool {
		self.queues.chain_iter().any(|c| self.arena.get(*c).map(|c| c.id == id).unwrap_or(false))
	}

	/// The in-flight command failed; the rest of its chain is abandoned
	fn fail_current(&mut self, err: ConnectionError) {
		let Some(flight) = self.in_flight.take() else {
			return;
		};
		let mut abandoned = self.arena.take_dependents(flight.command);
		abandoned.extend(self.queues.take_chain());
		let Some(command) = self.arena.release(flight.command) else {
			return;
		};
		let outcome = Outcome::of(&command);
		let mut err = err.with_operation(outcome.id);
		if err.path.is_none() {
			if let Some(path) = &outcome.path {
				err = err.with_path(path.clone());
			}
		}
		self.report_failure(&outcome, err);

		let mut reported = BTreeSet::from([outcome.id]);
		for root in abandoned {
			for command in self.arena.release_chain(root) {
				let dependent = Outcome::of(&command);
				let dep_err = ConnectionError::new(
					ErrorKind::DependencyFailed,
					format!("operation {} failed", outcome.id),
				)
				.with_operation(dependent.id);
				if reported.insert(dependent.id) {
					self.report_failure(&dependent, dep_err);
				} else if let Some(record) = dependent.record {
					self.transfers.lock().set_error(record, dep_err);
				}
			}
		}

		self.set_state(ConnectionState::Idle);
		self.check_queue();
	}

	fn report_failure(&self, outcome: &Outcome, err: ConnectionError) {
		let err = if err.operation.is_none() { err.with_operation(outcome.id) } else { err };
		if let Some(record) = outcome.record {
			self.transfers.lock().set_error(record, err.clone());
		}
		self.dispatcher.operation_did_fail(&err);
		if let Some(delegate) = &outcome.delegate {
			delegate.on_event(TransferEvent::Finished { id: outcome.id, error: Some(err) });
		}
	}

	// === Cancellation ===

	/// Abandon the in-flight transfer and move on to the next command
	pub fn cancel_transfer(&mut self) -> ConnectionResult<()> {
		let is_transfer = self.current_operation().map(|op| op.is_transfer()).unwrap_or(false);
		if !is_transfer {
			return Err(ConnectionError::invalid("no transfer in progress"));
		}
		info!("cancelling transfer {}", self.in_flight_operation().map(|id| id.to_string()).unwrap_or_default());
		self.adapter.stop_current_operation();
		self.fail_current(ConnectionError::cancelled());
		Ok(())
	}

	// === Authentication ===

	fn handle_challenge(&mut self, ticket: Ticket, mut challenge: AuthChallenge) {
		self.auth.attempts += 1;
		let operation = self.in_flight_operation();
		if self.auth.attempts > self.config.auth_retry_limit {
			let mut err = ConnectionError::new(
				ErrorKind::BadCredentials,
				format!("gave up after {} authentication attempts", self.config.auth_retry_limit),
			);
			if let Some(id) = operation {
				err = err.with_operation(id);
			}
			self.teardown(Some(err));
			return;
		}
		challenge.previous_failure_count = self.auth.attempts - 1;
		challenge.operation = operation;
		debug!(
			"authentication challenge for {}@{} (attempt {})",
			challenge.protocol, challenge.host, self.auth.attempts
		);
		self.auth.pending = Some(challenge.clone());
		self.auth.ticket = Some(ticket);

		if self.dispatcher.did_receive_authentication_challenge(&challenge) {
			self.auth.awaiting_delegate = true;
			return;
		}

		let cached = if challenge.previous_failure_count == 0 {
			self.credentials
				.as_ref()
				.and_then(|cache| cache.credential_for(&challenge.host, &challenge.protocol))
		} else {
			None
		};
		let response = match cached {
			Some(credential) => {
				debug!("answering challenge with cached credential for {}", credential.user);
				ChallengeResponse::UseCredential(credential)
			}
			None => ChallengeResponse::Cancel,
		};
		self.auth.pending = None;
		self.respond_to_challenge(challenge, response);
	}

	/// Answer the pending authentication challenge
	pub fn answer_authentication_challenge(
		&mut self,
		response: ChallengeResponse,
	) -> ConnectionResult<()> {
		let Some(challenge) = self.auth.pending.take() else {
			return Err(ConnectionError::invalid("no authentication challenge pending"));
		};
		self.respond_to_challenge(challenge, response);
		Ok(())
	}

	/// Send `response` to the adapter for a challenge already taken off `auth.pending`
	fn respond_to_challenge(&mut self, challenge: AuthChallenge, response: ChallengeResponse) {
		let ticket = self.auth.ticket.take().or(self.session_ticket).unwrap_or(Ticket(0));
		self.auth.awaiting_delegate = false;
		if std::mem::take(&mut self.auth.timeout_deferred) {
			self.timer_request = self.session_ticket;
		}

		match response {
			ChallengeResponse::Cancel => {
				let mut err = ConnectionError::new(
					ErrorKind::AuthenticationCancelled,
					format!("authentication for {} cancelled", challenge.host),
				);
				if let Some(id) = challenge.operation {
					err = err.with_operation(id);
				}
				self.teardown(Some(err));
			}
			response => {
				if matches!(response, ChallengeResponse::UseCredential(_)) && self.state.is_opening() {
					self.set_state(ConnectionState::SentPassword);
				}
				let client = self.client(ticket);
				self.adapter.answer_authentication_challenge(client, response);
				self.check_queue();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::delegate::DelegateBuilder;
	use std::sync::Mutex;

	/// Adapter recording every call with the ticket it was given
	#[derive(Clone, Default)]
	struct Recorder {
		calls: Arc<Mutex<Vec<(String, Ticket)>>>,
	}

	impl Recorder {
		fn calls(&self) -> Vec<String> {
			self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
		}

		fn last_ticket(&self) -> Ticket {
			self.calls.lock().unwrap().iter().rev().find(|(_, t)| t.0 > 0).map(|(_, t)| *t).unwrap()
		}

		fn push(&self, call: String, ticket: Ticket) {
			self.calls.lock().unwrap().push((call, ticket));
		}
	}

	struct RecordingAdapter(Recorder);

	impl ProtocolAdapter for RecordingAdapter {
		fn name(&self) -> &'static str {
			"mock"
		}
		fn can_handle(&self, _url: &Url) -> bool {
			true
		}
		fn start_connection(&mut self, client: AdapterClient, _credential: Option<Credential>) {
			self.0.push("connect".into(), client.ticket());
		}
		fn stop_connection(&mut self) {
			self.0.push("stop_connection".into(), Ticket(0));
		}
		fn close_connection(&mut self, client: AdapterClient) {
			self.0.push("close".into(), client.ticket());
		}
		fn change_directory(&mut self, client: AdapterClient, path: &str) {
			self.0.push(format!("cd {}", path), client.ticket());
		}
		fn fetch_contents_of_directory(&mut self, client: AdapterClient, path: &str) {
			self.0.push(format!("list {}", path), client.ticket());
		}
		fn create_directory(&mut self, client: AdapterClient, path: &str, _: Option<u32>, _: bool) {
			self.0.push(format!("mkdir {}", path), client.ticket());
		}
		fn delete_item(&mut self, client: AdapterClient, path: &str, _directory: bool) {
			self.0.push(format!("delete {}", path), client.ticket());
		}
		fn move_item(&mut self, client: AdapterClient, from: &str, to: &str) {
			self.0.push(format!("move {} {}", from, to), client.ticket());
		}
		fn set_permissions(&mut self, client: AdapterClient, mode: u32, path: &str) {
			self.0.push(format!("chmod {:o} {}", mode, path), client.ticket());
		}
		fn download_contents_of_file(&mut self, client: AdapterClient, path: &str, _offset: u64) {
			self.0.push(format!("download {}", path), client.ticket());
		}
		fn upload_data(&mut self, client: AdapterClient, _: UploadSource, path: &str, _: u64) {
			self.0.push(format!("upload {}", path), client.ticket());
		}
		fn check_existence(&mut self, client: AdapterClient, path: &str) {
			self.0.push(format!("exists {}", path), client.ticket());
		}
		fn stop_current_operation(&mut self) {
			self.0.push("stop".into(), Ticket(0));
		}
		fn answer_authentication_challenge(&mut self, client: AdapterClient, response: ChallengeResponse) {
			let label = match response {
				ChallengeResponse::UseCredential(c) => format!("answer {}", c.user),
				ChallengeResponse::ContinueWithoutCredential => "answer none".into(),
				ChallengeResponse::Cancel => "answer cancel".into(),
			};
			self.0.push(label, client.ticket());
		}
	}

	#[derive(Default)]
	struct Events(Mutex<Vec<String>>);

	impl Events {
		fn push(&self, s: String) {
			self.0.lock().unwrap().push(s);
		}
		fn all(&self) -> Vec<String> {
			self.0.lock().unwrap().clone()
		}
	}

	fn recording_delegate(events: Arc<Events>) -> Arc<dyn ConnectionDelegate> {
		let (e1, e2, e3, e4, e5) = (events.clone(), events.clone(), events.clone(), events.clone(), events);
		DelegateBuilder::new()
			.on_finish(move |id| e1.push(format!("finish {}", id.0)))
			.on_fail(move |err| {
				e2.push(format!("fail {} {:?}", err.operation.map(|o| o.0).unwrap_or(0), err.kind))
			})
			.on_skip(move |id, _| e3.push(format!("skip {}", id.0)))
			.on_connection_failed(move |err| e4.push(format!("connection failed {:?}", err.kind)))
			.on_disconnect(move || e5.push("disconnected".into()))
			.build()
	}

	fn setup() -> (ConnectionMachine, Recorder, Arc<Events>, mpsc::Receiver<DriverMessage>) {
		let recorder = Recorder::default();
		let (tx, rx) = mpsc::channel(16);
		let url = Url::parse("mock://example.org/").unwrap();
		let mut machine = ConnectionMachine::new(
			url,
			Box::new(RecordingAdapter(recorder.clone())),
			tx,
			ConnectionConfig::default(),
			TransferStore::default(),
		);
		let events = Arc::new(Events::default());
		machine.set_delegate(recording_delegate(events.clone()));
		(machine, recorder, events, rx)
	}

	fn event(ticket: Ticket, kind: AdapterEventKind) -> AdapterEvent {
		AdapterEvent { ticket, kind }
	}

	fn open(machine: &mut ConnectionMachine, recorder: &Recorder) {
		let ticket = machine.connect().unwrap();
		assert_eq!(recorder.last_ticket(), ticket);
		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidOpenConnection { current_directory: "/home".into() },
		));
		assert_eq!(machine.state(), ConnectionState::Idle);
	}

	fn finish(machine: &mut ConnectionMachine, recorder: &Recorder) {
		machine.handle_adapter_event(event(recorder.last_ticket(), AdapterEventKind::DidFinishCurrentOperation));
	}

	fn upload(n: u64, path: &str) -> OperationRequest {
		OperationRequest::new(Operation::Upload {
			source: UploadSource::Data(vec![0u8; 10]),
			remote_path: path.into(),
			offset: 0,
		})
		.with_id(n)
	}

	fn listing(n: u64, path: &str) -> OperationRequest {
		OperationRequest::new(Operation::DirectoryContents { path: path.into() }).with_id(n)
	}

	#[test]
	fn test_upload_dispatches_and_finishes() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);

		let submitted = machine.submit(upload(1, "/remote/a.txt")).unwrap();
		assert_eq!(machine.state(), ConnectionState::UploadingFile);
		assert_eq!(recorder.calls().last().unwrap(), "upload /remote/a.txt");

		let ticket = recorder.last_ticket();
		machine.handle_adapter_event(event(ticket, AdapterEventKind::DidUploadDataOfLength(10)));
		finish(&mut machine, &recorder);

		assert_eq!(machine.state(), ConnectionState::Idle);
		assert_eq!(events.all(), vec!["finish 1"]);
		let record = submitted.record.unwrap();
		assert!(record.is_finished());
		assert_eq!(record.progress(), 100.0);
	}

	#[test]
	fn test_listing_precedes_upload() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);

		machine.start_bulk_commands();
		machine.submit(upload(3, "/b.txt")).unwrap();
		machine.submit(listing(2, "/")).unwrap();
		machine.end_bulk_commands();

		assert_eq!(recorder.calls().last().unwrap(), "list /");
		assert!(!recorder.calls().contains(&"upload /b.txt".to_string()));
		machine.handle_adapter_event(event(
			recorder.last_ticket(),
			AdapterEventKind::DidLoadContentsOfDirectory(vec![]),
		));
		assert_eq!(recorder.calls().last().unwrap(), "upload /b.txt");
		finish(&mut machine, &recorder);
		assert_eq!(events.all(), vec!["finish 2", "finish 3"]);
	}

	#[test]
	fn test_listing_submitted_first_runs_first() {
		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(listing(2, "/")).unwrap();
		machine.submit(upload(3, "/c.txt")).unwrap();
		assert_eq!(machine.state(), ConnectionState::AwaitingDirectoryContents);
		assert_eq!(machine.pending_count(), 1);
	}

	#[test]
	fn test_auth_challenge_suspends_and_resumes() {
		let (mut machine, recorder, events, _rx) = setup();
		let answered = Arc::new(Mutex::new(Vec::new()));
		let a = answered.clone();
		machine.set_delegate(
			DelegateBuilder::new()
				.on_authentication_challenge(move |c| a.lock().unwrap().push(c.operation))
				.build(),
		);
		open(&mut machine, &recorder);

		let download = OperationRequest::new(Operation::Download {
			remote_path: "/big.iso".into(),
			target: DownloadTarget::Memory,
			offset: 0,
		})
		.with_id(4);
		machine.submit(download).unwrap();
		let ticket = recorder.last_ticket();
		machine.submit(listing(5, "/")).unwrap();

		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidReceiveAuthenticationChallenge(AuthChallenge {
				host: "example.org".into(),
				protocol: "mock".into(),
				previous_failure_count: 0,
				proposed: None,
				operation: None,
			}),
		));
		assert_eq!(answered.lock().unwrap().as_slice(), &[Some(OperationId(4))]);
		assert_eq!(machine.pending_count(), 1);

		machine
			.answer_authentication_challenge(ChallengeResponse::UseCredential(Credential::new("u", "p")))
			.unwrap();
		assert_eq!(recorder.calls().last().unwrap(), "answer u");
		// Answer goes back under the download's ticket, so the download resumes
		assert_eq!(recorder.last_ticket(), ticket);
		machine.handle_adapter_event(event(ticket, AdapterEventKind::DidDownloadData(vec![1, 2, 3])));
		finish(&mut machine, &recorder);
		assert_eq!(recorder.calls().last().unwrap(), "list /");
		assert!(events.all().is_empty());
	}

	#[test]
	fn test_auth_cancel_fails_and_disconnects() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		let download = OperationRequest::new(Operation::Download {
			remote_path: "/big.iso".into(),
			target: DownloadTarget::Memory,
			offset: 0,
		})
		.with_id(4);
		machine.submit(download).unwrap();
		machine.submit(listing(6, "/")).unwrap();
		let ticket = recorder.last_ticket();

		// No delegate capability and no cached credential: the default cancels
		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidReceiveAuthenticationChallenge(AuthChallenge {
				host: "example.org".into(),
				protocol: "mock".into(),
				previous_failure_count: 0,
				proposed: None,
				operation: None,
			}),
		));

		assert_eq!(machine.state(), ConnectionState::NotConnected);
		assert_eq!(
			events.all(),
			vec![
				"fail 4 AuthenticationCancelled",
				"fail 6 Cancelled",
				"connection failed AuthenticationCancelled",
				"disconnected",
			]
		);
		assert!(recorder.calls().contains(&"stop_connection".to_string()));
	}

	#[test]
	fn test_cached_credential_answers_first_challenge() {
		let (mut machine, recorder, _events, _rx) = setup();
		let cache = crate::auth::MemoryCredentialCache::new();
		cache.insert("example.org", "mock", Credential::new("cached", "pw"));
		machine.set_credential_cache(Arc::new(cache));
		let ticket = machine.connect().unwrap();
		let challenge = AuthChallenge {
			host: "example.org".into(),
			protocol: "mock".into(),
			previous_failure_count: 0,
			proposed: None,
			operation: None,
		};
		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidReceiveAuthenticationChallenge(challenge.clone()),
		));
		assert_eq!(recorder.calls().last().unwrap(), "answer cached");
		assert_eq!(machine.state(), ConnectionState::SentPassword);
		// The automatic answer consumed the challenge
		assert!(machine.answer_authentication_challenge(ChallengeResponse::Cancel).is_err());
		assert_eq!(machine.state(), ConnectionState::SentPassword);

		// Second challenge: the cached credential was rejected, nothing left to try
		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidReceiveAuthenticationChallenge(challenge),
		));
		assert_eq!(machine.state(), ConnectionState::NotConnected);
	}

	#[test]
	fn test_auth_retry_limit() {
		let (mut machine, recorder, events, _rx) = setup();
		machine.set_delegate(DelegateBuilder::new().on_authentication_challenge(|_| {}).build());
		let ticket = machine.connect().unwrap();
		let challenge = AuthChallenge {
			host: "h".into(),
			protocol: "mock".into(),
			previous_failure_count: 0,
			proposed: None,
			operation: None,
		};
		for _ in 0..3 {
			machine.handle_adapter_event(event(
				ticket,
				AdapterEventKind::DidReceiveAuthenticationChallenge(challenge.clone()),
			));
			machine
				.answer_authentication_challenge(ChallengeResponse::UseCredential(Credential::new(
					"u", "bad",
				)))
				.unwrap();
		}
		assert_eq!(machine.state(), ConnectionState::SentPassword);
		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidReceiveAuthenticationChallenge(challenge),
		));
		assert_eq!(machine.state(), ConnectionState::NotConnected);
		assert!(events.all().is_empty());
		assert!(recorder.calls().iter().filter(|c| c.starts_with("answer")).count() == 3);
	}

	#[test]
	fn test_cancel_transfer_advances_queue() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		let submitted = machine.submit(upload(5, "/x.bin")).unwrap();
		let ticket = recorder.last_ticket();
		machine.submit(OperationRequest::new(Operation::DeleteFile { path: "/old".into() }).with_id(6)).unwrap();

		machine.cancel_transfer().unwrap();
		assert_eq!(recorder.calls().last().unwrap(), "delete /old");
		let record = submitted.record.unwrap();
		assert_eq!(record.error().map(|e| e.kind), Some(ErrorKind::Cancelled));

		// The adapter's late completion of the cancelled upload is dropped
		machine.handle_adapter_event(event(ticket, AdapterEventKind::DidFinishCurrentOperation));
		assert_eq!(machine.state(), ConnectionState::DeleteFile);
		finish(&mut machine, &recorder);
		assert_eq!(events.all(), vec!["fail 5 Cancelled", "finish 6"]);
	}

	#[test]
	fn test_bulk_defers_dispatch() {
		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.start_bulk_commands();
		for (n, path) in [(1, "/a"), (2, "/b"), (3, "/c")] {
			machine
				.submit(OperationRequest::new(Operation::CreateDirectory {
					path: path.into(),
					permissions: None,
					ignore_existing: false,
				})
				.with_id(n))
				.unwrap();
		}
		assert_eq!(recorder.calls(), vec!["connect"]);
		machine.end_bulk_commands();
		finish(&mut machine, &recorder);
		finish(&mut machine, &recorder);
		finish(&mut machine, &recorder);
		assert_eq!(recorder.calls(), vec!["connect", "mkdir /a", "mkdir /b", "mkdir /c"]);
	}

	#[test]
	fn test_single_command_in_flight() {
		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);
		for n in 0..5 {
			machine.submit(OperationRequest::new(Operation::DeleteFile { path: format!("/{}", n) }).with_id(n)).unwrap();
			machine.submit(upload(100 + n, &format!("/u{}", n))).unwrap();
		}
		let mut dispatched = 1;
		while machine.is_busy() {
			assert_eq!(recorder.calls().len(), dispatched + 1);
			finish(&mut machine, &recorder);
			dispatched += 1;
		}
		assert_eq!(machine.history().len(), 10);
		assert_eq!(machine.pending_count(), 0);
	}

	#[test]
	fn test_failed_upload_skips_permissions() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(upload(7, "/p.txt").with_permissions(0o644)).unwrap();
		machine.submit(listing(8, "/")).unwrap();
		machine.handle_adapter_event(event(
			recorder.last_ticket(),
			AdapterEventKind::CurrentOperationDidFail(ConnectionError::new(
				ErrorKind::PermissionDenied,
				"denied",
			)),
		));
		assert_eq!(recorder.calls().last().unwrap(), "list /");
		assert!(!recorder.calls().iter().any(|c| c.starts_with("chmod")));
		assert_eq!(events.all(), vec!["fail 7 PermissionDenied"]);
	}

	#[test]
	fn test_successful_upload_runs_permissions_then_finishes() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(upload(7, "/p.txt").with_permissions(0o600)).unwrap();
		finish(&mut machine, &recorder);
		assert_eq!(recorder.calls().last().unwrap(), "chmod 600 /p.txt");
		assert!(events.all().is_empty());
		finish(&mut machine, &recorder);
		assert_eq!(events.all(), vec!["finish 7"]);
	}

	#[test]
	fn test_skip_policy_skips_existing_file() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		let submitted = machine.submit(upload(9, "/s.txt").with_overwrite(OverwritePolicy::Skip)).unwrap();
		assert_eq!(recorder.calls().last().unwrap(), "exists /s.txt");
		machine.handle_adapter_event(event(recorder.last_ticket(), AdapterEventKind::DidCheckExistence(true)));
		assert_eq!(events.all(), vec!["skip 9"]);
		assert!(submitted.record.unwrap().snapshot().unwrap().skipped);
		assert_eq!(machine.state(), ConnectionState::Idle);
	}

	#[test]
	fn test_ask_policy_parks_until_confirmed() {
		let (mut machine, recorder, events, _rx) = setup();
		let asked = Arc::new(Events::default());
		let a = asked.clone();
		let e = events.clone();
		machine.set_delegate(
			DelegateBuilder::new()
				.on_overwrite_confirmation(move |id, path| a.push(format!("{} {}", id.0, path)))
				.on_finish(move |id| e.push(format!("finish {}", id.0)))
				.build(),
		);
		open(&mut machine, &recorder);
		machine.submit(upload(10, "/q.txt").with_overwrite(OverwritePolicy::Ask)).unwrap();
		machine.handle_adapter_event(event(recorder.last_ticket(), AdapterEventKind::DidCheckExistence(true)));

		assert_eq!(asked.all(), vec!["10 /q.txt"]);
		assert_eq!(machine.files_needing_overwrite_confirmation(), vec!["/q.txt".to_string()]);
		assert!(!machine.is_busy());

		machine.confirm_overwrite("/q.txt", true).unwrap();
		assert_eq!(recorder.calls().last().unwrap(), "upload /q.txt");
		finish(&mut machine, &recorder);
		assert_eq!(events.all(), vec!["finish 10"]);
		assert!(machine.confirm_overwrite("/q.txt", true).is_err());
	}

	#[test]
	fn test_ask_policy_without_capability_declines() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(upload(11, "/r.txt").with_overwrite(OverwritePolicy::Ask)).unwrap();
		machine.handle_adapter_event(event(recorder.last_ticket(), AdapterEventKind::DidCheckExistence(true)));
		assert_eq!(events.all(), vec!["fail 11 FileExists"]);
	}

	#[test]
	fn test_graceful_disconnect_drains_first() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(listing(1, "/")).unwrap();
		machine.submit(upload(2, "/d.txt")).unwrap();
		machine.disconnect();
		let err = machine.submit(listing(3, "/other")).unwrap_err();
		assert_eq!(err.kind, ErrorKind::Disconnecting);

		machine.handle_adapter_event(event(
			recorder.last_ticket(),
			AdapterEventKind::DidLoadContentsOfDirectory(vec![]),
		));
		finish(&mut machine, &recorder);
		assert_eq!(recorder.calls().last().unwrap(), "close");
		assert_eq!(machine.state(), ConnectionState::SentDisconnect);

		machine.handle_adapter_event(event(recorder.last_ticket(), AdapterEventKind::DidCloseConnection));
		assert_eq!(machine.state(), ConnectionState::NotConnected);
		assert_eq!(events.all(), vec!["finish 1", "finish 2", "disconnected"]);
	}

	#[test]
	fn test_force_disconnect_cancels_everything() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(upload(1, "/a")).unwrap();
		machine.submit(upload(2, "/b")).unwrap();
		machine.force_disconnect();
		assert_eq!(machine.state(), ConnectionState::NotConnected);
		assert_eq!(events.all(), vec!["fail 1 Cancelled", "fail 2 Cancelled", "disconnected"]);
		assert_eq!(machine.submit(listing(3, "/")).unwrap_err().kind, ErrorKind::NotConnected);
	}

	#[test]
	fn test_submission_validation() {
		let (mut machine, recorder, _events, _rx) = setup();
		assert_eq!(machine.submit(listing(1, "/")).unwrap_err().kind, ErrorKind::NotConnected);
		open(&mut machine, &recorder);

		machine.submit(listing(1, "/")).unwrap();
		assert_eq!(machine.submit(listing(2, "/")).unwrap_err().kind, ErrorKind::InvalidOperation);

		let rename = OperationRequest::new(Operation::Rename { from: "/a".into(), to: "/a".into() });
		assert_eq!(machine.submit(rename).unwrap_err().kind, ErrorKind::InvalidOperation);
	}

	#[test]
	fn test_one_listing_at_a_time_across_paths() {
		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);

		// Queued behind an upload, the first listing still blocks a second one
		machine.submit(upload(1, "/u.bin")).unwrap();
		machine.submit(listing(2, "/a")).unwrap();
		let err = machine.submit(listing(3, "/b")).unwrap_err();
		assert_eq!(err.kind, ErrorKind::InvalidOperation);
		assert_eq!(err.path.as_deref(), Some("/b"));

		finish(&mut machine, &recorder);
		assert_eq!(recorder.calls().last().unwrap(), "list /a");
		assert!(machine.submit(listing(4, "/b")).is_err());

		machine.handle_adapter_event(event(
			recorder.last_ticket(),
			AdapterEventKind::DidLoadContentsOfDirectory(vec![]),
		));
		machine.submit(listing(5, "/b")).unwrap();
		assert_eq!(recorder.calls().last().unwrap(), "list /b");
	}

	#[tokio::test]
	async fn test_local_source_is_checked_before_submission() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("f.bin");
		std::fs::write(&file, vec![7u8; 123]).unwrap();

		let source = |path: std::path::PathBuf| {
			OperationRequest::new(Operation::Upload {
				source: UploadSource::File(path),
				remote_path: "/f.bin".into(),
				offset: 0,
			})
		};
		let mut missing = source(dir.path().join("absent.bin"));
		assert_eq!(missing.check_local_source().await.unwrap_err().kind, ErrorKind::LocalIo);
		let mut directory = source(dir.path().to_path_buf());
		assert_eq!(directory.check_local_source().await.unwrap_err().kind, ErrorKind::LocalIo);

		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);
		let mut request = source(file);
		request.check_local_source().await.unwrap();
		let submitted = machine.submit(request).unwrap();
		assert_eq!(submitted.record.unwrap().snapshot().unwrap().size, 123);
	}

	#[tokio::test]
	async fn test_file_download_completes_after_writer_flushes() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("out.bin");
		let (mut machine, recorder, events, mut rx) = setup();
		open(&mut machine, &recorder);

		let download = OperationRequest::new(Operation::Download {
			remote_path: "/data.bin".into(),
			target: DownloadTarget::File(target.clone()),
			offset: 0,
		})
		.with_id(12);
		let submitted = machine.submit(download).unwrap();
		let ticket = recorder.last_ticket();
		machine.handle_adapter_event(event(ticket, AdapterEventKind::DidLearnTransferSize(6)));
		machine.handle_adapter_event(event(ticket, AdapterEventKind::DidDownloadData(b"abc".to_vec())));
		machine.handle_adapter_event(event(ticket, AdapterEventKind::DidDownloadData(b"def".to_vec())));
		finish(&mut machine, &recorder);

		// Adapter is done but the data may still be on its way to disk
		assert!(machine.is_busy());
		assert!(events.all().is_empty());

		let Some(DriverMessage::DownloadWritten { ticket: written, result }) = rx.recv().await else {
			panic!("expected the writer's report");
		};
		assert_eq!(written, ticket);
		machine.handle_download_written(written, result);
		assert!(!machine.is_busy());
		assert_eq!(events.all(), vec!["finish 12"]);
		assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
		assert_eq!(submitted.record.unwrap().progress(), 100.0);
	}

	#[tokio::test]
	async fn test_unwritable_download_target_fails_the_download() {
		let dir = tempfile::tempdir().unwrap();
		let (mut machine, recorder, events, mut rx) = setup();
		open(&mut machine, &recorder);

		let download = OperationRequest::new(Operation::Download {
			remote_path: "/data.bin".into(),
			target: DownloadTarget::File(dir.path().to_path_buf()),
			offset: 0,
		})
		.with_id(13);
		machine.submit(download).unwrap();
		machine.submit(listing(14, "/")).unwrap();

		let Some(DriverMessage::DownloadWritten { ticket, result }) = rx.recv().await else {
			panic!("expected the writer's report");
		};
		machine.handle_download_written(ticket, result);
		assert_eq!(events.all(), vec!["fail 13 LocalIo"]);
		assert!(recorder.calls().contains(&"stop".to_string()));
		assert_eq!(recorder.calls().last().unwrap(), "list /");
	}

	#[test]
	fn test_connection_failure_mid_command() {
		let (mut machine, recorder, events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(listing(1, "/")).unwrap();
		machine.handle_adapter_event(event(
			recorder.last_ticket(),
			AdapterEventKind::DidFailWithError(ConnectionError::new(ErrorKind::ConnectionLost, "reset")),
		));
		assert_eq!(machine.state(), ConnectionState::NotConnected);
		assert_eq!(events.all(), vec!["fail 1 ConnectionLost", "connection failed ConnectionLost", "disconnected"]);
	}

	#[test]
	fn test_connect_timeout() {
		let (mut machine, _recorder, events, _rx) = setup();
		let ticket = machine.connect().unwrap();
		assert_eq!(machine.take_timer_request(), Some(ticket));
		machine.handle_connect_timeout(ticket);
		assert_eq!(machine.state(), ConnectionState::NotConnected);
		assert_eq!(machine.last_error().map(|e| e.kind), Some(ErrorKind::Timeout));
		assert_eq!(events.all(), vec!["connection failed Timeout", "disconnected"]);
	}

	#[test]
	fn test_resumed_upload_enters_offset_state() {
		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);
		let resumed = OperationRequest::new(Operation::Upload {
			source: UploadSource::Data(vec![0u8; 100]),
			remote_path: "/resume.bin".into(),
			offset: 40,
		});
		let submitted = machine.submit(resumed).unwrap();
		assert_eq!(machine.state(), ConnectionState::SentOffset);
		assert_eq!(submitted.record.as_ref().unwrap().snapshot().unwrap().size, 60);
		machine.handle_adapter_event(event(recorder.last_ticket(), AdapterEventKind::DidUploadDataOfLength(30)));
		assert_eq!(machine.state(), ConnectionState::UploadingFile);
		assert_eq!(submitted.record.unwrap().progress(), 50.0);
	}

	#[test]
	fn test_substates_follow_running_command() {
		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(listing(1, "/")).unwrap();
		machine.handle_adapter_event(event(
			recorder.last_ticket(),
			AdapterEventKind::DidEnterState(ConnectionState::OpeningDataStream),
		));
		assert_eq!(machine.state(), ConnectionState::OpeningDataStream);
		machine.handle_adapter_event(event(recorder.last_ticket(), AdapterEventKind::DidLoadContentsOfDirectory(vec![])));
		assert_eq!(machine.state(), ConnectionState::Idle);
	}

	#[test]
	fn test_opening_substates_follow_session_ticket() {
		let (mut machine, recorder, _events, _rx) = setup();
		let ticket = machine.connect().unwrap();
		assert_eq!(machine.state(), ConnectionState::SentUsername);

		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidEnterState(ConnectionState::SentFeatureRequest),
		));
		assert_eq!(machine.state(), ConnectionState::SentFeatureRequest);
		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidEnterState(ConnectionState::AwaitingCurrentDirectory),
		));
		assert_eq!(machine.state(), ConnectionState::AwaitingCurrentDirectory);

		// Reports under any other ticket are stale
		machine.handle_adapter_event(event(
			Ticket(ticket.0 + 1),
			AdapterEventKind::DidEnterState(ConnectionState::SentPassword),
		));
		assert_eq!(machine.state(), ConnectionState::AwaitingCurrentDirectory);

		machine.handle_adapter_event(event(
			ticket,
			AdapterEventKind::DidOpenConnection { current_directory: "/".into() },
		));
		assert_eq!(machine.state(), ConnectionState::Idle);
		assert_eq!(recorder.calls(), vec!["connect"]);
	}

	#[test]
	fn test_queue_description_lists_in_flight_and_queued() {
		let (mut machine, recorder, _events, _rx) = setup();
		open(&mut machine, &recorder);
		machine.submit(upload(1, "/a")).unwrap();
		machine.submit(upload(2, "/b")).unwrap();
		let text = machine.queue_description();
		assert!(text.contains("state: UploadingFile"));
		assert!(text.contains("in flight: #1"));
		assert!(text.contains("uploads (1)"));
	}
}

// vim: ts=4
