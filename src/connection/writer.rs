//! Download writer task
//!
//! Data of a download into a local file is handed off the owner task to a
//! writer task, which owns the file. Once the owner drops the sink, the writer
//! flushes and reports the result back as a [`DriverMessage::DownloadWritten`]
//! under the dispatch ticket. A write error is reported as soon as it happens.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs as afs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::DriverMessage;
use crate::error::ConnectionError;
use crate::logging::*;
use crate::types::Ticket;

/// Owner-side end of a writer task
#[derive(Debug)]
pub(crate) struct DownloadSink {
	chunks: mpsc::UnboundedSender<Vec<u8>>,
}

impl DownloadSink {
	/// Spawn a writer for `local`, keeping its first `offset` bytes
	pub(crate) fn spawn(
		local: PathBuf,
		offset: u64,
		ticket: Ticket,
		tx: mpsc::Sender<DriverMessage>,
	) -> Self {
		let (chunks, rx) = mpsc::unbounded_channel();
		tokio::spawn(async move {
			let result = write_chunks(&local, offset, rx)
				.await
				.map_err(|e| ConnectionError::local_io(local.display().to_string(), e));
			if let Err(e) = &result {
				debug!("[writer] {}", e);
			}
			let _ = tx.send(DriverMessage::DownloadWritten { ticket, result }).await;
		});
		DownloadSink { chunks }
	}

	/// Queue a chunk; dropped silently once the writer has failed
	pub(crate) fn write(&self, data: Vec<u8>) {
		let _ = self.chunks.send(data);
	}
}

async fn open_target(local: &Path, offset: u64) -> std::io::Result<afs::File> {
	if offset == 0 {
		return afs::File::create(local).await;
	}
	let mut file = afs::OpenOptions::new().write(true).create(true).truncate(false).open(local).await?;
	file.set_len(offset).await?;
	file.seek(SeekFrom::Start(offset)).await?;
	Ok(file)
}

async fn write_chunks(
	local: &Path,
	offset: u64,
	mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
	let mut file = open_target(local, offset).await?;
	let mut written = 0u64;
	while let Some(chunk) = rx.recv().await {
		file.write_all(&chunk).await?;
		written += chunk.len() as u64;
	}
	file.flush().await?;
	trace!("[writer] {} bytes to {}", written, local.display());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ErrorKind;

	async fn written(rx: &mut mpsc::Receiver<DriverMessage>) -> (Ticket, Result<(), ConnectionError>) {
		match rx.recv().await {
			Some(DriverMessage::DownloadWritten { ticket, result }) => (ticket, result),
			_ => panic!("expected a write report"),
		}
	}

	#[tokio::test]
	async fn test_writes_then_reports_after_sink_drops() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("out.bin");
		let (tx, mut rx) = mpsc::channel(4);

		let sink = DownloadSink::spawn(target.clone(), 0, Ticket(7), tx);
		sink.write(b"hello ".to_vec());
		sink.write(b"world".to_vec());
		drop(sink);

		let (ticket, result) = written(&mut rx).await;
		assert_eq!(ticket, Ticket(7));
		assert!(result.is_ok());
		assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
	}

	#[tokio::test]
	async fn test_resume_keeps_prefix_and_truncates_tail() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("part.bin");
		std::fs::write(&target, b"abcdXXXXXX").unwrap();
		let (tx, mut rx) = mpsc::channel(4);

		let sink = DownloadSink::spawn(target.clone(), 4, Ticket(1), tx);
		sink.write(b"ef".to_vec());
		drop(sink);

		assert!(written(&mut rx).await.1.is_ok());
		assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
	}

	#[tokio::test]
	async fn test_open_failure_is_reported_without_waiting() {
		let dir = tempfile::tempdir().unwrap();
		let (tx, mut rx) = mpsc::channel(4);

		// A directory cannot be opened for writing; the sink stays alive
		let sink = DownloadSink::spawn(dir.path().to_path_buf(), 0, Ticket(3), tx);
		let (ticket, result) = written(&mut rx).await;
		assert_eq!(ticket, Ticket(3));
		assert_eq!(result.unwrap_err().kind, ErrorKind::LocalIo);
		sink.write(vec![1, 2, 3]);
	}
}

// vim: ts=4
