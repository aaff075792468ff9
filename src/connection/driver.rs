//! Owner task and the async client handle

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use super::machine::{ConnectionMachine, OperationRequest, Submitted};
use super::{ClientCall, DriverMessage};
use crate::adapter::{AdapterRegistry, ProtocolAdapter};
use crate::auth::{ChallengeResponse, Credential, CredentialCache};
use crate::config::Config;
use crate::delegate::{ConnectionDelegate, TransferEvent};
use crate::error::{ConnectionError, ConnectionResult, ErrorKind};
use crate::logging::*;
use crate::transfer::TransferStore;
use crate::types::{ConnectionState, DownloadTarget, ExistsAction, Operation, UploadSource};

/// How a waited-for operation ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
	Finished,
	/// Upload left out because the remote file exists
	Skipped,
}

/// Builder for [`Connection`]
pub struct ConnectionBuilder {
	url: String,
	registry: Option<AdapterRegistry>,
	adapter: Option<Box<dyn ProtocolAdapter>>,
	delegate: Option<Arc<dyn ConnectionDelegate>>,
	credential: Option<Credential>,
	credentials: Option<Arc<dyn CredentialCache>>,
	config: Config,
}

impl ConnectionBuilder {
	pub fn new(url: impl Into<String>) -> Self {
		ConnectionBuilder {
			url: url.into(),
			registry: None,
			adapter: None,
			delegate: None,
			credential: None,
			credentials: None,
			config: Config::default(),
		}
	}

	/// Adapter table to pick the protocol adapter from
	pub fn registry(mut self, registry: AdapterRegistry) -> Self {
		self.registry = Some(registry);
		self
	}

	/// Use this adapter instead of looking one up
	pub fn adapter(mut self, adapter: Box<dyn ProtocolAdapter>) -> Self {
		self.adapter = Some(adapter);
		self
	}

	pub fn delegate(mut self, delegate: Arc<dyn ConnectionDelegate>) -> Self {
		self.delegate = Some(delegate);
		self
	}

	/// Credential presented when connecting; overrides one embedded in the URL
	pub fn credential(mut self, credential: Credential) -> Self {
		self.credential = Some(credential);
		self
	}

	pub fn credential_cache(mut self, cache: Arc<dyn CredentialCache>) -> Self {
		self.credentials = Some(cache);
		self
	}

	pub fn config(mut self, config: Config) -> Self {
		self.config = config;
		self
	}

	/// Spawn the owner task; must be called from within a tokio runtime
	pub fn build(self) -> ConnectionResult<Connection> {
		let url = Url::parse(&self.url)?;
		let adapter = match self.adapter {
			Some(adapter) => adapter,
			None => self.registry.unwrap_or_else(AdapterRegistry::with_defaults).select(&url)?,
		};
		if !adapter.can_handle(&url) {
			return Err(ConnectionError::new(
				ErrorKind::BadUrl,
				format!("{} adapter cannot handle {}", adapter.name(), url),
			));
		}

		let (tx, rx) = mpsc::channel(self.config.connection.channel_capacity);
		let transfers = TransferStore::new(&self.config.transfer);
		let mut machine = ConnectionMachine::new(
			url.clone(),
			adapter,
			tx.clone(),
			self.config.connection.clone(),
			transfers.clone(),
		);
		if let Some(delegate) = self.delegate {
			machine.set_delegate(delegate);
		}
		if self.credential.is_some() {
			machine.set_credential(self.credential);
		}
		if let Some(cache) = self.credentials {
			machine.set_credential_cache(cache);
		}
		let state = machine.subscribe_state();
		let task = tokio::spawn(drive(machine, rx, tx.clone()));

		Ok(Connection { url, tx, state, transfers, task: Some(task) })
	}
}

/// Owner task loop: the only code that touches the machine
async fn drive(
	mut machine: ConnectionMachine,
	mut rx: mpsc::Receiver<DriverMessage>,
	tx: mpsc::Sender<DriverMessage>,
) {
	debug!("owner task started for {}", machine.url());
	while let Some(message) = rx.recv().await {
		match message {
			DriverMessage::Client(call) => call(&mut machine),
			DriverMessage::Adapter(event) => machine.handle_adapter_event(event),
			DriverMessage::ConnectTimeout(ticket) => machine.handle_connect_timeout(ticket),
			DriverMessage::DownloadWritten { ticket, result } => {
				machine.handle_download_written(ticket, result)
			}
			DriverMessage::Shutdown => {
				machine.force_disconnect();
				break;
			}
		}
		if let Some(ticket) = machine.take_timer_request() {
			let tx = tx.clone();
			let timeout = machine.connect_timeout();
			tokio::spawn(async move {
				tokio::time::sleep(timeout).await;
				let _ = tx.send(DriverMessage::ConnectTimeout(ticket)).await;
			});
		}
	}
	debug!("owner task for {} finished", machine.url());
}

/// Async client handle of one connection
///
/// Every method marshals onto the connection's owner task. Dropping the
/// handle force-disconnects and stops the owner task.
pub struct Connection {
	url: Url,
	tx: mpsc::Sender<DriverMessage>,
	state: watch::Receiver<ConnectionState>,
	transfers: TransferStore,
	task: Option<JoinHandle<()>>,
}

impl Connection {
	/// Run `f` against the machine on the owner task and return its result
	pub async fn call<R, F>(&self, f: F) -> ConnectionResult<R>
	where
		F: FnOnce(&mut ConnectionMachine) -> R + Send + 'static,
		R: Send + 'static,
	{
		let (reply, response) = oneshot::channel();
		let call: ClientCall = Box::new(move |machine| {
			let _ = reply.send(f(machine));
		});
		self.tx.send(DriverMessage::Client(call)).await.map_err(|_| ConnectionError::not_connected())?;
		response.await.map_err(|_| ConnectionError::not_connected())
	}

	pub fn url(&self) -> &Url {
		&self.url
	}

	/// Current protocol state
	pub fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	/// Store holding the transfer records of this connection
	pub fn transfers(&self) -> TransferStore {
		self.transfers.clone()
	}

	// === Lifecycle ===

	/// Start opening the connection; requests may be queued right away
	pub async fn connect(&self) -> ConnectionResult<()> {
		self.call(|m| m.connect()).await?.map(|_| ())
	}

	/// Wait until the connection has opened, or report why it did not
	pub async fn wait_until_open(&self) -> ConnectionResult<()> {
		let mut state = self.state.clone();
		let reached = state
			.wait_for(|s| !s.is_opening())
			.await
			.map(|s| *s)
			.map_err(|_| ConnectionError::not_connected())?;
		if reached != ConnectionState::NotConnected {
			return Ok(());
		}
		let last = self.call(|m| m.last_error().cloned()).await?;
		Err(last.unwrap_or_else(ConnectionError::not_connected))
	}

	/// Wait until the connection is closed
	pub async fn wait_until_disconnected(&self) {
		let mut state = self.state.clone();
		let _ = state.wait_for(|s| *s == ConnectionState::NotConnected).await;
	}

	/// Disconnect once all queued work has run
	pub async fn disconnect(&self) -> ConnectionResult<()> {
		self.call(|m| m.disconnect()).await
	}

	/// Cancel everything and close immediately
	pub async fn force_disconnect(&self) -> ConnectionResult<()> {
		self.call(|m| m.force_disconnect()).await
	}

	pub async fn cancel_all(&self) -> ConnectionResult<()> {
		self.call(|m| m.cancel_all()).await
	}

	/// Force-disconnect and wait for the owner task to finish
	pub async fn shutdown(mut self) {
		let _ = self.tx.send(DriverMessage::Shutdown).await;
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}

	pub async fn set_delegate(&self, delegate: Arc<dyn ConnectionDelegate>) -> ConnectionResult<()> {
		self.call(move |m| m.set_delegate(delegate)).await
	}

	// === Operations ===

	/// Queue `request`; a local upload source is checked here, off the owner task
	pub async fn submit(&self, mut request: OperationRequest) -> ConnectionResult<Submitted> {
		request.check_local_source().await?;
		self.call(move |m| m.submit(request)).await?
	}

	/// Submit `request` and wait until its whole chain has run
	///
	/// Replaces any transfer delegate set on the request. A transfer record
	/// created for the request is released once it has run.
	pub async fn perform(&self, request: OperationRequest) -> ConnectionResult<Completion> {
		let owns_record = request.creates_root_record();
		let (done, outcome) = oneshot::channel();
		let done = Mutex::new(Some(done));
		let delegate = move |event: TransferEvent| {
			let result = match event {
				TransferEvent::Progress { .. } => return,
				TransferEvent::Finished { error: None, .. } => Ok(Completion::Finished),
				TransferEvent::Finished { error: Some(err), .. } => Err(err),
				TransferEvent::Skipped { .. } => Ok(Completion::Skipped),
			};
			if let Some(done) = done.lock().unwrap_or_else(|e| e.into_inner()).take() {
				let _ = done.send(result);
			}
		};
		let submitted = self.submit(request.with_delegate(Arc::new(delegate))).await?;
		let result = outcome.await.map_err(|_| ConnectionError::not_connected())?;
		if let Some(record) = submitted.record.filter(|_| owns_record) {
			if !record.release() {
				debug!("transfer record {:?} still in use", record.id());
			}
		}
		result
	}

	pub async fn change_to_directory(&self, path: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::ChangeDirectory { path: path.to_string() }))
			.await
	}

	pub async fn directory_contents(&self, path: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::DirectoryContents { path: path.to_string() }))
			.await
	}

	pub async fn create_directory(
		&self,
		path: &str,
		permissions: Option<u32>,
	) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::CreateDirectory {
			path: path.to_string(),
			permissions,
			ignore_existing: false,
		}))
		.await
	}

	pub async fn delete_file(&self, path: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::DeleteFile { path: path.to_string() })).await
	}

	pub async fn delete_directory(&self, path: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::DeleteDirectory { path: path.to_string() }))
			.await
	}

	pub async fn rename(&self, from: &str, to: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::Rename {
			from: from.to_string(),
			to: to.to_string(),
		}))
		.await
	}

	pub async fn set_permissions(&self, path: &str, mode: u32) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::SetPermissions { path: path.to_string(), mode }))
			.await
	}

	pub async fn upload_file(&self, local: &Path, remote: &str) -> ConnectionResult<Submitted> {
		self.resume_upload_file(local, remote, 0).await
	}

	/// Upload `local` starting at byte `offset`, keeping what the remote file already holds
	pub async fn resume_upload_file(
		&self,
		local: &Path,
		remote: &str,
		offset: u64,
	) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::Upload {
			source: UploadSource::File(local.to_path_buf()),
			remote_path: remote.to_string(),
			offset,
		}))
		.await
	}

	pub async fn upload_data(&self, data: Vec<u8>, remote: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::Upload {
			source: UploadSource::Data(data),
			remote_path: remote.to_string(),
			offset: 0,
		}))
		.await
	}

	pub async fn download_file(&self, remote: &str, local: &Path) -> ConnectionResult<Submitted> {
		self.resume_download_file(remote, local, 0).await
	}

	/// Download into `local` from byte `offset`; earlier bytes of `local` are kept
	pub async fn resume_download_file(
		&self,
		remote: &str,
		local: &Path,
		offset: u64,
	) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::Download {
			remote_path: remote.to_string(),
			target: DownloadTarget::File(local.to_path_buf()),
			offset,
		}))
		.await
	}

	/// Download with the data handed to the delegate only
	pub async fn download_to_memory(&self, remote: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::Download {
			remote_path: remote.to_string(),
			target: DownloadTarget::Memory,
			offset: 0,
		}))
		.await
	}

	pub async fn check_existence(&self, path: &str) -> ConnectionResult<Submitted> {
		self.submit(OperationRequest::new(Operation::CheckExistence {
			path: path.to_string(),
			on_exists: ExistsAction::Report,
		}))
		.await
	}

	// === Queue control ===

	pub async fn start_bulk_commands(&self) -> ConnectionResult<()> {
		self.call(|m| m.start_bulk_commands()).await
	}

	pub async fn end_bulk_commands(&self) -> ConnectionResult<()> {
		self.call(|m| m.end_bulk_commands()).await
	}

	pub async fn cancel_transfer(&self) -> ConnectionResult<()> {
		self.call(|m| m.cancel_transfer()).await?
	}

	pub async fn answer_authentication_challenge(
		&self,
		response: ChallengeResponse,
	) -> ConnectionResult<()> {
		self.call(move |m| m.answer_authentication_challenge(response)).await?
	}

	pub async fn confirm_overwrite(&self, path: &str, allow: bool) -> ConnectionResult<()> {
		let path = path.to_string();
		self.call(move |m| m.confirm_overwrite(&path, allow)).await?
	}

	pub async fn files_needing_overwrite_confirmation(&self) -> ConnectionResult<Vec<String>> {
		self.call(|m| m.files_needing_overwrite_confirmation()).await
	}

	// === Queries ===

	pub async fn upload_speed(&self) -> ConnectionResult<f64> {
		self.call(|m| m.upload_speed()).await
	}

	pub async fn download_speed(&self) -> ConnectionResult<f64> {
		self.call(|m| m.download_speed()).await
	}

	pub async fn current_directory(&self) -> ConnectionResult<String> {
		self.call(|m| m.current_directory().to_string()).await
	}

	pub async fn queue_description(&self) -> ConnectionResult<String> {
		self.call(|m| m.queue_description()).await
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		if self.task.is_none() {
			return;
		}
		if let Err(mpsc::error::TrySendError::Full(message)) = self.tx.try_send(DriverMessage::Shutdown)
		{
			let tx = self.tx.clone();
			if let Ok(runtime) = tokio::runtime::Handle::try_current() {
				runtime.spawn(async move {
					let _ = tx.send(message).await;
				});
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapter::LocalAdapter;
	use crate::delegate::DelegateBuilder;
	use crate::types::DirectoryEntry;

	fn local(root: &Path) -> ConnectionBuilder {
		let url = Url::from_directory_path(root).expect("absolute path");
		ConnectionBuilder::new(url.as_str())
	}

	#[tokio::test]
	async fn test_unknown_scheme_is_rejected() {
		let err = ConnectionBuilder::new("gopher://example.org/").build().err().expect("no adapter");
		assert_eq!(err.kind, ErrorKind::BadUrl);
		let err = ConnectionBuilder::new("not a url").build().err().expect("bad url");
		assert_eq!(err.kind, ErrorKind::BadUrl);
	}

	#[tokio::test]
	async fn test_requests_before_connect_fail() {
		let dir = tempfile::tempdir().unwrap();
		let connection = local(dir.path()).build().unwrap();
		let err = connection.directory_contents("/").await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::NotConnected);
		assert_eq!(connection.state(), ConnectionState::NotConnected);
	}

	#[tokio::test]
	async fn test_open_list_and_disconnect() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
		std::fs::create_dir(dir.path().join("sub")).unwrap();

		let listed: Arc<Mutex<Vec<DirectoryEntry>>> = Arc::default();
		let sink = listed.clone();
		let delegate = DelegateBuilder::new()
			.on_directory_contents(move |_, _, entries| sink.lock().unwrap().extend_from_slice(entries))
			.build();

		let connection = local(dir.path()).delegate(delegate).build().unwrap();
		connection.connect().await.unwrap();
		connection.wait_until_open().await.unwrap();
		assert_eq!(connection.current_directory().await.unwrap(), "/");

		let request = OperationRequest::new(Operation::DirectoryContents { path: "/".into() });
		assert_eq!(connection.perform(request).await.unwrap(), Completion::Finished);
		let names: Vec<String> = listed.lock().unwrap().iter().map(|e| e.name.clone()).collect();
		assert_eq!(names, vec!["a.txt", "sub"]);

		connection.disconnect().await.unwrap();
		connection.wait_until_disconnected().await;
		assert_eq!(connection.state(), ConnectionState::NotConnected);
	}

	#[tokio::test]
	async fn test_missing_root_fails_to_open() {
		let dir = tempfile::tempdir().unwrap();
		let connection = ConnectionBuilder::new("file:///")
			.adapter(Box::new(LocalAdapter::new(dir.path().join("missing"))))
			.build()
			.unwrap();
		connection.connect().await.unwrap();
		let err = connection.wait_until_open().await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::HostUnreachable);
	}

	#[tokio::test]
	async fn test_dropped_handle_stops_owner_task() {
		let dir = tempfile::tempdir().unwrap();
		let connection = local(dir.path()).build().unwrap();
		connection.connect().await.unwrap();
		connection.wait_until_open().await.unwrap();
		let mut state = connection.state.clone();
		drop(connection);
		// The owner task drops the machine, closing the state channel
		while state.changed().await.is_ok() {}
		assert_eq!(*state.borrow(), ConnectionState::NotConnected);
	}
}

// vim: ts=4
