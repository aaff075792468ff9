//! Transfer record trees
//!
//! Every upload or download is tracked by a record. Recursive transfers
//! build a tree: directory records aggregate the sizes and transferred bytes
//! of their descendants. Records live in a [`TransferTree`] arena shared by
//! the connection and its clients; [`TransferRecord`] is the client handle.
//!
//! A root and its subtree stay in the arena until released. Ids carry a
//! generation, so ids of a released tree go stale instead of aliasing the
//! records that reuse their slots. Operations on stale ids are no-ops.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::ConnectionError;

/// Arena handle of a transfer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
	index: u32,
	generation: u32,
}

#[derive(Debug)]
struct RecordNode {
	name: String,
	is_upload: bool,
	size: u64,
	size_with_children: u64,
	bytes_transferred: u64,
	bytes_with_children: u64,
	transfer_start: Option<Instant>,
	last_transfer_time: Option<Instant>,
	last_sample_bytes: u64,
	speed: f64,
	children: Vec<RecordId>,
	parent: Option<RecordId>,
	error: Option<ConnectionError>,
	has_problems: bool,
	finished: bool,
	skipped: bool,
	connection: Option<Uuid>,
}

impl RecordNode {
	/// A leaf whose data is moving right now
	fn is_transferring(&self) -> bool {
		self.children.is_empty()
			&& self.transfer_start.is_some()
			&& !self.finished
			&& self.error.is_none()
	}
}

#[derive(Debug)]
struct RecordSlot {
	generation: u32,
	node: Option<RecordNode>,
}

/// Point-in-time copy of a record, handed to delegates
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
	pub name: String,
	pub path: String,
	pub is_upload: bool,
	pub size: u64,
	pub size_with_children: u64,
	pub bytes_transferred: u64,
	pub progress: f64,
	pub speed: f64,
	pub elapsed: Option<Duration>,
	pub error: Option<ConnectionError>,
	pub has_problems: bool,
	pub finished: bool,
	pub skipped: bool,
}

/// Arena of transfer records
#[derive(Debug)]
pub struct TransferTree {
	slots: Vec<RecordSlot>,
	free: Vec<u32>,
	live: usize,
	sample_interval: Duration,
	smoothing: f64,
}

impl Default for TransferTree {
	fn default() -> Self {
		Self::new(&TransferConfig::default())
	}
}

impl TransferTree {
	pub fn new(config: &TransferConfig) -> Self {
		TransferTree {
			slots: Vec::new(),
			free: Vec::new(),
			live: 0,
			sample_interval: config.speed_update_interval(),
			smoothing: config.speed_smoothing,
		}
	}

	/// Create a new root record
	pub fn create(&mut self, name: &str, is_upload: bool, size: u64) -> RecordId {
		let node = RecordNode {
			name: name.to_string(),
			is_upload,
			size,
			size_with_children: size,
			bytes_transferred: 0,
			bytes_with_children: 0,
			transfer_start: None,
			last_transfer_time: None,
			last_sample_bytes: 0,
			speed: 0.0,
			children: Vec::new(),
			parent: None,
			error: None,
			has_problems: false,
			finished: false,
			skipped: false,
			connection: None,
		};
		self.live += 1;
		if let Some(index) = self.free.pop() {
			let slot = &mut self.slots[index as usize];
			slot.generation = slot.generation.wrapping_add(1);
			slot.node = Some(node);
			RecordId { index, generation: slot.generation }
		} else {
			self.slots.push(RecordSlot { generation: 0, node: Some(node) });
			RecordId { index: (self.slots.len() - 1) as u32, generation: 0 }
		}
	}

	fn node(&self, id: RecordId) -> Option<&RecordNode> {
		self.slots
			.get(id.index as usize)
			.filter(|s| s.generation == id.generation)
			.and_then(|s| s.node.as_ref())
	}

	fn node_mut(&mut self, id: RecordId) -> Option<&mut RecordNode> {
		self.slots
			.get_mut(id.index as usize)
			.filter(|s| s.generation == id.generation)
			.and_then(|s| s.node.as_mut())
	}

	pub fn contains(&self, id: RecordId) -> bool {
		self.node(id).is_some()
	}

	/// Number of live records
	pub fn len(&self) -> usize {
		self.live
	}

	pub fn is_empty(&self) -> bool {
		self.live == 0
	}

	pub fn set_connection(&mut self, id: RecordId, session: Uuid) {
		if let Some(node) = self.node_mut(id) {
			node.connection = Some(session);
		}
	}

	pub fn connection(&self, id: RecordId) -> Option<Uuid> {
		self.node(id).and_then(|n| n.connection)
	}

	/// Attach `child` (a root) under `parent` and roll its totals up the ancestor chain
	///
	/// Returns false if either id is stale, `child` already has a parent or
	/// `child` is an ancestor of `parent`.
	pub fn add_child(&mut self, parent: RecordId, child: RecordId) -> bool {
		if parent == child || !self.contains(parent) {
			return false;
		}
		let (size, bytes, problems) = match self.node(child) {
			Some(node) if node.parent.is_none() => {
				(node.size_with_children, node.bytes_with_children, node.has_problems)
			}
			_ => return false,
		};
		if self.ancestors(parent).any(|a| a == child) {
			return false;
		}

		if let Some(node) = self.node_mut(child) {
			node.parent = Some(parent);
		}
		if let Some(node) = self.node_mut(parent) {
			node.children.push(child);
		}

		let chain: Vec<RecordId> = std::iter::once(parent).chain(self.ancestors(parent)).collect();
		for id in chain {
			let Some(node) = self.node_mut(id) else {
				continue;
			};
			node.size_with_children += size;
			node.bytes_with_children += bytes;
			if problems {
				node.has_problems = true;
			}
		}
		true
	}

	fn ancestors(&self, id: RecordId) -> impl Iterator<Item = RecordId> + '_ {
		let mut cursor = self.node(id).and_then(|n| n.parent);
		std::iter::from_fn(move || {
			let current = cursor?;
			cursor = self.node(current).and_then(|n| n.parent);
			Some(current)
		})
	}

	fn self_and_ancestors(&self, id: RecordId) -> Vec<RecordId> {
		std::iter::once(id).chain(self.ancestors(id)).collect()
	}

	/// `id` and every record below it, parents first
	fn subtree(&self, id: RecordId) -> Vec<RecordId> {
		let mut out = Vec::new();
		let mut stack = vec![id];
		while let Some(rid) = stack.pop() {
			let Some(node) = self.node(rid) else {
				continue;
			};
			out.push(rid);
			stack.extend(node.children.iter().rev().copied());
		}
		out
	}

	/// Set the record's own size, adjusting every ancestor's rollup
	pub fn set_size(&mut self, id: RecordId, size: u64) {
		let Some(old) = self.node(id).map(|n| n.size) else {
			return;
		};
		if old == size {
			return;
		}
		for rid in self.self_and_ancestors(id) {
			if let Some(node) = self.node_mut(rid) {
				node.size_with_children = node.size_with_children - old + size;
			}
		}
		if let Some(node) = self.node_mut(id) {
			node.size = size;
		}
	}

	/// Update bytes transferred of a record at time `now`
	///
	/// Speed is resampled at most once per sample interval, as an
	/// exponentially weighted average of the rate since the last sample.
	pub fn set_bytes_transferred(&mut self, id: RecordId, bytes: u64, now: Instant) {
		let Some(node) = self.node_mut(id) else {
			return;
		};
		let old = node.bytes_transferred;
		node.bytes_transferred = bytes;

		let interval = self.sample_interval;
		let alpha = self.smoothing;
		for rid in self.self_and_ancestors(id) {
			let Some(node) = self.node_mut(rid) else {
				continue;
			};
			node.bytes_with_children = node.bytes_with_children - old + bytes;
			let total = node.bytes_with_children;

			let Some(last) = node.last_transfer_time else {
				node.transfer_start = Some(now);
				node.last_transfer_time = Some(now);
				node.last_sample_bytes = total;
				continue;
			};
			let elapsed = now.saturating_duration_since(last);
			if elapsed < interval || elapsed.is_zero() {
				continue;
			}
			let delta = total.saturating_sub(node.last_sample_bytes) as f64;
			let instant = delta / elapsed.as_secs_f64();
			node.speed =
				if node.speed == 0.0 { instant } else { alpha * instant + (1.0 - alpha) * node.speed };
			node.last_transfer_time = Some(now);
			node.last_sample_bytes = total;
		}
	}

	pub fn add_bytes_transferred(&mut self, id: RecordId, delta: u64, now: Instant) {
		if let Some(bytes) = self.node(id).map(|n| n.bytes_transferred + delta) {
			self.set_bytes_transferred(id, bytes, now);
		}
	}

	/// Mark a record failed and flag every ancestor as having problems
	pub fn set_error(&mut self, id: RecordId, error: ConnectionError) {
		let Some(node) = self.node_mut(id) else {
			return;
		};
		node.error = Some(error);
		for rid in self.self_and_ancestors(id) {
			if let Some(node) = self.node_mut(rid) {
				node.has_problems = true;
			}
		}
	}

	pub fn mark_finished(&mut self, id: RecordId) {
		if let Some(node) = self.node_mut(id) {
			node.finished = true;
		}
	}

	pub fn mark_skipped(&mut self, id: RecordId) {
		if let Some(node) = self.node_mut(id) {
			node.finished = true;
			node.skipped = true;
		}
	}

	/// Free a root record and its whole subtree
	///
	/// Refused for child records, stale ids and trees with a transfer still
	/// moving data. Every id of a released tree goes stale.
	pub fn release(&mut self, root: RecordId) -> bool {
		match self.node(root) {
			Some(node) if node.parent.is_none() => {}
			_ => return false,
		}
		let subtree = self.subtree(root);
		if subtree.iter().filter_map(|id| self.node(*id)).any(RecordNode::is_transferring) {
			return false;
		}
		for id in &subtree {
			self.slots[id.index as usize].node = None;
			self.free.push(id.index);
		}
		self.live -= subtree.len();
		true
	}

	/// Walk the subtree once: (failed records, successfully finished leaves)
	pub fn problems_counting_errors_and_successes(&self, id: RecordId) -> (usize, usize) {
		let mut errors = 0;
		let mut successes = 0;
		for node in self.subtree(id).into_iter().filter_map(|rid| self.node(rid)) {
			if node.error.is_some() {
				errors += 1;
			} else if node.children.is_empty() && node.finished {
				successes += 1;
			}
		}
		(errors, successes)
	}

	pub fn root(&self, id: RecordId) -> RecordId {
		self.ancestors(id).last().unwrap_or(id)
	}

	pub fn parent(&self, id: RecordId) -> Option<RecordId> {
		self.node(id).and_then(|n| n.parent)
	}

	pub fn children(&self, id: RecordId) -> &[RecordId] {
		self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
	}

	/// Names from the root down to this record, joined with `/`
	pub fn path(&self, id: RecordId) -> Option<String> {
		let mut names = Vec::new();
		for rid in self.self_and_ancestors(id) {
			names.push(self.node(rid)?.name.as_str());
		}
		names.reverse();
		Some(names.join("/"))
	}

	/// Aggregate progress in percent; 0 for released records
	pub fn progress(&self, id: RecordId) -> f64 {
		let Some(node) = self.node(id) else {
			return 0.0;
		};
		if node.size_with_children == 0 {
			return if node.finished && node.error.is_none() { 100.0 } else { 0.0 };
		}
		(node.bytes_with_children as f64 / node.size_with_children as f64 * 100.0).min(100.0)
	}

	pub fn speed(&self, id: RecordId) -> f64 {
		self.node(id).map(|n| n.speed).unwrap_or(0.0)
	}

	pub fn snapshot(&self, id: RecordId) -> Option<TransferSnapshot> {
		let node = self.node(id)?;
		Some(TransferSnapshot {
			name: node.name.clone(),
			path: self.path(id)?,
			is_upload: node.is_upload,
			size: node.size,
			size_with_children: node.size_with_children,
			bytes_transferred: node.bytes_with_children,
			progress: self.progress(id),
			speed: node.speed,
			elapsed: node.transfer_start.map(|s| s.elapsed()),
			error: node.error.clone(),
			has_problems: node.has_problems,
			finished: node.finished,
			skipped: node.skipped,
		})
	}
}

/// Transfer arena shared between a connection and its clients
#[derive(Debug, Clone, Default)]
pub struct TransferStore {
	inner: Arc<Mutex<TransferTree>>,
}

impl TransferStore {
	pub fn new(config: &TransferConfig) -> Self {
		TransferStore { inner: Arc::new(Mutex::new(TransferTree::new(config))) }
	}

	pub(crate) fn lock(&self) -> MutexGuard<'_, TransferTree> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Create a new root record
	pub fn create(&self, name: &str, is_upload: bool, size: u64) -> TransferRecord {
		let id = self.lock().create(name, is_upload, size);
		self.handle(id)
	}

	/// Create a record and attach it under `parent`
	pub fn create_child(
		&self,
		parent: &TransferRecord,
		name: &str,
		is_upload: bool,
		size: u64,
	) -> TransferRecord {
		let mut tree = self.lock();
		let id = tree.create(name, is_upload, size);
		tree.add_child(parent.id, id);
		drop(tree);
		self.handle(id)
	}

	pub fn handle(&self, id: RecordId) -> TransferRecord {
		TransferRecord { store: self.clone(), id }
	}

	/// Number of records the store holds
	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}
}

/// Client handle of one transfer record
///
/// Handles outlive the record: once its tree is released, queries return
/// `None` or zero.
#[derive(Clone)]
pub struct TransferRecord {
	store: TransferStore,
	id: RecordId,
}

impl std::fmt::Debug for TransferRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransferRecord").field("id", &self.id).finish()
	}
}

impl TransferRecord {
	pub fn id(&self) -> RecordId {
		self.id
	}

	pub fn snapshot(&self) -> Option<TransferSnapshot> {
		self.store.lock().snapshot(self.id)
	}

	pub fn name(&self) -> Option<String> {
		self.snapshot().map(|s| s.name)
	}

	pub fn path(&self) -> Option<String> {
		self.store.lock().path(self.id)
	}

	pub fn progress(&self) -> f64 {
		self.store.lock().progress(self.id)
	}

	pub fn speed(&self) -> f64 {
		self.store.lock().speed(self.id)
	}

	pub fn error(&self) -> Option<ConnectionError> {
		self.snapshot().and_then(|s| s.error)
	}

	pub fn is_finished(&self) -> bool {
		self.snapshot().map(|s| s.finished).unwrap_or(false)
	}

	pub fn is_released(&self) -> bool {
		!self.store.lock().contains(self.id)
	}

	pub fn root(&self) -> TransferRecord {
		let id = self.store.lock().root(self.id);
		self.store.handle(id)
	}

	pub fn parent(&self) -> Option<TransferRecord> {
		let parent = self.store.lock().parent(self.id);
		parent.map(|p| self.store.handle(p))
	}

	pub fn children(&self) -> Vec<TransferRecord> {
		let ids = self.store.lock().children(self.id).to_vec();
		ids.into_iter().map(|c| self.store.handle(c)).collect()
	}

	/// (errors, successes) over this record's subtree
	pub fn problems_counting_errors_and_successes(&self) -> (usize, usize) {
		self.store.lock().problems_counting_errors_and_successes(self.id)
	}

	/// Free this root record and everything below it
	///
	/// See [`TransferTree::release`] for when this is refused.
	pub fn release(&self) -> bool {
		self.store.lock().release(self.id)
	}
}


// vim: ts=4
