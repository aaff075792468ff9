//! Protocol adapter boundary
//!
//! A protocol adapter implements one wire protocol behind a narrow set of
//! fire-and-forget operations. Each call receives an [`AdapterClient`]
//! stamped with the dispatch ticket; the adapter does its I/O on its own
//! tasks and reports back through the client, which marshals every event onto
//! the connection's owner task. Adapters never touch the operation queues.

pub mod local;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::auth::{AuthChallenge, ChallengeResponse, Credential};
use crate::connection::DriverMessage;
use crate::error::{ConnectionError, ConnectionResult, ErrorKind};
use crate::types::{ConnectionState, DirectoryEntry, Ticket, TranscriptKind, UploadSource};

pub use local::LocalAdapter;

/// Operations a wire protocol implementation offers to the connection
pub trait ProtocolAdapter: Send {
	/// Short protocol name used in challenges and logs
	fn name(&self) -> &'static str;

	/// Whether this adapter can serve `url`
	fn can_handle(&self, url: &Url) -> bool;

	/// Open the connection; reports `DidOpenConnection`, a challenge or `DidFailWithError`
	fn start_connection(&mut self, client: AdapterClient, credential: Option<Credential>);

	/// Drop the connection immediately without reporting back
	fn stop_connection(&mut self);

	/// Close the connection gracefully and report `DidCloseConnection`
	fn close_connection(&mut self, client: AdapterClient);

	fn change_directory(&mut self, client: AdapterClient, path: &str);

	fn fetch_contents_of_directory(&mut self, client: AdapterClient, path: &str);

	fn create_directory(
		&mut self,
		client: AdapterClient,
		path: &str,
		permissions: Option<u32>,
		ignore_existing: bool,
	);

	fn delete_item(&mut self, client: AdapterClient, path: &str, directory: bool);

	fn move_item(&mut self, client: AdapterClient, from: &str, to: &str);

	fn set_permissions(&mut self, client: AdapterClient, mode: u32, path: &str);

	/// Stream the file from `offset`, reporting `DidDownloadData` chunks
	fn download_contents_of_file(&mut self, client: AdapterClient, path: &str, offset: u64);

	/// Write `source` from `offset`, reporting `DidUploadDataOfLength` as data goes out
	fn upload_data(&mut self, client: AdapterClient, source: UploadSource, path: &str, offset: u64);

	fn check_existence(&mut self, client: AdapterClient, path: &str);

	/// Abandon the running operation; no further events for it are expected
	fn stop_current_operation(&mut self);

	fn answer_authentication_challenge(&mut self, client: AdapterClient, response: ChallengeResponse);
}

/// Event reported by an adapter
#[derive(Debug, Clone)]
pub enum AdapterEventKind {
	DidOpenConnection { current_directory: String },
	/// Connection-level failure
	DidFailWithError(ConnectionError),
	DidCloseConnection,
	DidReceiveAuthenticationChallenge(AuthChallenge),
	DidFinishCurrentOperation,
	CurrentOperationDidFail(ConnectionError),
	DidDownloadData(Vec<u8>),
	DidUploadDataOfLength(u64),
	/// Number of bytes the running transfer will move
	DidLearnTransferSize(u64),
	DidLoadContentsOfDirectory(Vec<DirectoryEntry>),
	DidCheckExistence(bool),
	DidChangeDirectory(String),
	/// Protocol sub-state of the running command
	DidEnterState(ConnectionState),
	AppendToTranscript { text: String, kind: TranscriptKind },
}

#[derive(Debug, Clone)]
pub struct AdapterEvent {
	pub ticket: Ticket,
	pub kind: AdapterEventKind,
}

/// Reporting handle given to an adapter for one dispatch
#[derive(Clone)]
pub struct AdapterClient {
	tx: mpsc::Sender<DriverMessage>,
	ticket: Ticket,
}

impl std::fmt::Debug for AdapterClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AdapterClient").field("ticket", &self.ticket).finish()
	}
}

impl AdapterClient {
	pub(crate) fn new(tx: mpsc::Sender<DriverMessage>, ticket: Ticket) -> Self {
		AdapterClient { tx, ticket }
	}

	pub fn ticket(&self) -> Ticket {
		self.ticket
	}

	/// Whether the connection has gone away
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	/// Report an event, waiting for channel capacity; false once the connection is gone
	pub async fn send(&self, kind: AdapterEventKind) -> bool {
		let event = AdapterEvent { ticket: self.ticket, kind };
		self.tx.send(DriverMessage::Adapter(event)).await.is_ok()
	}

	/// Report events in order from a spawned task
	///
	/// For adapter methods, which run on the owner task and must not wait for
	/// channel capacity there. Delivery waits for capacity instead of dropping.
	pub fn post(&self, kinds: impl IntoIterator<Item = AdapterEventKind>) -> JoinHandle<()> {
		let client = self.clone();
		let kinds: Vec<AdapterEventKind> = kinds.into_iter().collect();
		tokio::spawn(async move {
			for kind in kinds {
				if !client.send(kind).await {
					break;
				}
			}
		})
	}

	pub async fn did_open_connection(&self, current_directory: impl Into<String>) -> bool {
		self.send(AdapterEventKind::DidOpenConnection { current_directory: current_directory.into() })
			.await
	}

	pub async fn did_fail_with_error(&self, error: ConnectionError) -> bool {
		self.send(AdapterEventKind::DidFailWithError(error)).await
	}

	pub async fn did_close_connection(&self) -> bool {
		self.send(AdapterEventKind::DidCloseConnection).await
	}

	pub async fn did_receive_authentication_challenge(&self, challenge: AuthChallenge) -> bool {
		self.send(AdapterEventKind::DidReceiveAuthenticationChallenge(challenge)).await
	}

	pub async fn did_finish_current_operation(&self) -> bool {
		self.send(AdapterEventKind::DidFinishCurrentOperation).await
	}

	pub async fn current_operation_did_fail(&self, error: ConnectionError) -> bool {
		self.send(AdapterEventKind::CurrentOperationDidFail(error)).await
	}

	pub async fn did_download_data(&self, data: Vec<u8>) -> bool {
		self.send(AdapterEventKind::DidDownloadData(data)).await
	}

	pub async fn did_upload_data_of_length(&self, length: u64) -> bool {
		self.send(AdapterEventKind::DidUploadDataOfLength(length)).await
	}

	pub async fn did_learn_transfer_size(&self, size: u64) -> bool {
		self.send(AdapterEventKind::DidLearnTransferSize(size)).await
	}

	pub async fn did_load_contents_of_directory(&self, entries: Vec<DirectoryEntry>) -> bool {
		self.send(AdapterEventKind::DidLoadContentsOfDirectory(entries)).await
	}

	pub async fn did_check_existence(&self, exists: bool) -> bool {
		self.send(AdapterEventKind::DidCheckExistence(exists)).await
	}

	pub async fn did_change_directory(&self, path: impl Into<String>) -> bool {
		self.send(AdapterEventKind::DidChangeDirectory(path.into())).await
	}

	pub async fn did_enter_state(&self, state: ConnectionState) -> bool {
		self.send(AdapterEventKind::DidEnterState(state)).await
	}

	pub async fn append_to_transcript(&self, text: impl Into<String>, kind: TranscriptKind) -> bool {
		self.send(AdapterEventKind::AppendToTranscript { text: text.into(), kind }).await
	}
}

type AdapterFactory = Box<dyn Fn(&Url) -> Box<dyn ProtocolAdapter> + Send + Sync>;

struct RegistryEntry {
	scheme: String,
	factory: AdapterFactory,
}

/// Explicit URL scheme to adapter table, built at startup
#[derive(Default)]
pub struct AdapterRegistry {
	entries: Vec<RegistryEntry>,
}

impl AdapterRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry with the adapters shipped in this crate
	pub fn with_defaults() -> Self {
		let mut registry = Self::new();
		registry.register("file", |url| Box::new(LocalAdapter::from_url(url)));
		registry
	}

	/// Register a factory for `scheme`; earlier registrations win on ties
	pub fn register<F>(&mut self, scheme: &str, factory: F)
	where
		F: Fn(&Url) -> Box<dyn ProtocolAdapter> + Send + Sync + 'static,
	{
		self.entries
			.push(RegistryEntry { scheme: scheme.to_ascii_lowercase(), factory: Box::new(factory) });
	}

	pub fn schemes(&self) -> impl Iterator<Item = &str> {
		self.entries.iter().map(|e| e.scheme.as_str())
	}

	/// Instantiate the first adapter registered for the URL's scheme that can handle it
	pub fn select(&self, url: &Url) -> ConnectionResult<Box<dyn ProtocolAdapter>> {
		for entry in self.entries.iter().filter(|e| e.scheme == url.scheme()) {
			let adapter = (entry.factory)(url);
			if adapter.can_handle(url) {
				return Ok(adapter);
			}
		}
		Err(ConnectionError::new(ErrorKind::BadUrl, format!("no adapter handles {}", url)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_registry_selects_by_scheme() {
		let registry = AdapterRegistry::with_defaults();
		let url = Url::parse("file:///tmp").expect("url");
		let adapter = registry.select(&url).expect("file adapter");
		assert_eq!(adapter.name(), "file");

		let url = Url::parse("sftp://example.org/").expect("url");
		let err = registry.select(&url).err().expect("no sftp adapter");
		assert_eq!(err.kind, ErrorKind::BadUrl);
	}

	#[tokio::test]
	async fn test_client_stamps_ticket() {
		let (tx, mut rx) = mpsc::channel(4);
		let client = AdapterClient::new(tx, Ticket(9));
		assert!(client.did_upload_data_of_length(12).await);
		match rx.recv().await {
			Some(DriverMessage::Adapter(event)) => {
				assert_eq!(event.ticket, Ticket(9));
				assert!(matches!(event.kind, AdapterEventKind::DidUploadDataOfLength(12)));
			}
			_ => panic!("expected adapter event"),
		}
	}

	#[tokio::test]
	async fn test_post_waits_for_capacity_and_keeps_order() {
		let (tx, mut rx) = mpsc::channel(1);
		let client = AdapterClient::new(tx, Ticket(2));
		assert!(client.did_upload_data_of_length(1).await);

		// Channel is full: posting must neither block nor lose anything
		let posted = client.post([
			AdapterEventKind::AppendToTranscript { text: "550 denied".into(), kind: TranscriptKind::Error },
			AdapterEventKind::CurrentOperationDidFail(ConnectionError::cancelled()),
			AdapterEventKind::DidCloseConnection,
		]);

		let mut kinds = Vec::new();
		while kinds.len() < 4 {
			match rx.recv().await {
				Some(DriverMessage::Adapter(event)) => kinds.push(event.kind),
				_ => panic!("expected adapter event"),
			}
		}
		posted.await.unwrap();
		assert!(matches!(kinds[0], AdapterEventKind::DidUploadDataOfLength(1)));
		assert!(matches!(kinds[1], AdapterEventKind::AppendToTranscript { .. }));
		assert!(matches!(kinds[2], AdapterEventKind::CurrentOperationDidFail(_)));
		assert!(matches!(kinds[3], AdapterEventKind::DidCloseConnection));
	}
}

// vim: ts=4
