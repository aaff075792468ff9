//! Progress display for the CLI
//!
//! Renders transfer progress as a single status line on stderr.

use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

use crate::delegate::{ConnectionDelegate, DelegateCapabilities};
use crate::error::ConnectionError;
use crate::logging::*;
use crate::transfer::{TransferRecord, TransferSnapshot};
use crate::types::OperationId;

/// Width of the progress bar display
pub const PROGRESS_BAR_WIDTH: usize = 30;

/// Bytes per megabyte for display conversions
pub const BYTES_PER_MB: f64 = 1_000_000.0;

/// Throttle updates to this many milliseconds
pub const UPDATE_THROTTLE_MS: u128 = 100;

/// Format one status line for `snapshot`
pub fn render(snapshot: &TransferSnapshot) -> String {
	// Clamp to keep the bar inside its width
	let ratio = (snapshot.progress / 100.0).clamp(0.0, 1.0);
	let filled = (ratio * PROGRESS_BAR_WIDTH as f64) as usize;
	let bar = format!("[{}{}]", "=".repeat(filled), " ".repeat(PROGRESS_BAR_WIDTH - filled));
	let direction = if snapshot.is_upload { "Uploading" } else { "Downloading" };
	format!(
		"{} {}: {} {:.1}/{:.1} MB | {:.1} MB/s",
		direction,
		snapshot.name,
		bar,
		snapshot.bytes_transferred as f64 / BYTES_PER_MB,
		snapshot.size_with_children as f64 / BYTES_PER_MB,
		snapshot.speed / BYTES_PER_MB
	)
}

/// CLI delegate printing transfer progress and operation failures
///
/// With a root record set, the whole tree's totals are shown instead of the
/// reporting operation's own record.
pub struct CliProgress {
	last_update: Mutex<Option<Instant>>,
	root: Option<TransferRecord>,
}

impl CliProgress {
	pub fn new() -> Self {
		Self { last_update: Mutex::new(None), root: None }
	}

	pub fn with_root(root: TransferRecord) -> Self {
		Self { last_update: Mutex::new(None), root: Some(root) }
	}

	fn show(&self, snapshot: &TransferSnapshot) {
		// Throttle updates to every 100ms
		let mut last = self.last_update.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(at) = *last {
			if at.elapsed().as_millis() < UPDATE_THROTTLE_MS {
				return;
			}
		}
		*last = Some(Instant::now());
		drop(last);

		let _ = write!(std::io::stderr(), "\r  {}", render(snapshot));
		let _ = std::io::stderr().flush();
	}

	/// Print the final state and end the status line
	pub fn finish(&self) {
		if let Some(snapshot) = self.root.as_ref().and_then(|r| r.snapshot()) {
			let _ = writeln!(std::io::stderr(), "\r  {}", render(&snapshot));
		} else if self.last_update.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
			let _ = writeln!(std::io::stderr());
		}
	}
}

impl Default for CliProgress {
	fn default() -> Self {
		Self::new()
	}
}

impl ConnectionDelegate for CliProgress {
	fn capabilities(&self) -> DelegateCapabilities {
		DelegateCapabilities {
			operation_events: true,
			transfer_progress: true,
			..DelegateCapabilities::none()
		}
	}

	fn operation_did_fail(&self, error: &ConnectionError) {
		warn!("{}", error);
	}

	fn transfer_did_progress(&self, _id: OperationId, snapshot: &TransferSnapshot) {
		match self.root.as_ref().and_then(|r| r.snapshot()) {
			Some(root) => self.show(&root),
			None => self.show(snapshot),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::TransferConfig;
	use crate::transfer::TransferStore;

	#[test]
	fn test_render_half_done() {
		let store = TransferStore::new(&TransferConfig::default());
		let record = store.create("big.iso", true, 4_000_000);
		store.lock().set_bytes_transferred(record.id(), 2_000_000, Instant::now());

		let line = render(&record.snapshot().unwrap());
		let half = format!("[{}{}]", "=".repeat(15), " ".repeat(15));
		assert!(line.starts_with("Uploading big.iso: "), "{}", line);
		assert!(line.contains(&half), "{}", line);
		assert!(line.contains("2.0/4.0 MB"), "{}", line);
	}

	#[test]
	fn test_render_clamps_overshoot() {
		let store = TransferStore::new(&TransferConfig::default());
		let record = store.create("x", false, 10);
		store.lock().set_bytes_transferred(record.id(), 50, Instant::now());

		let line = render(&record.snapshot().unwrap());
		assert!(line.starts_with("Downloading x: "));
		assert!(line.contains(&format!("[{}]", "=".repeat(PROGRESS_BAR_WIDTH))));
	}
}

// vim: ts=4
