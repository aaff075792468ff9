//! Per-connection operation queues
//!
//! Seven FIFO queues, one per [`QueueCategory`], plus the bookkeeping the
//! queue check needs: the re-entrancy guard with its recheck flag, the bulk
//! bracket depth, the chain of dependents waiting to run next, and the table
//! of commands parked until an overwrite is confirmed.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write;

use crate::command::{CommandArena, CommandId};
use crate::types::{ConnectionState, OperationId, QueueCategory, Ticket};

/// Record of one dispatched command
#[derive(Debug, Clone)]
pub struct HistoryEntry {
	pub ticket: Ticket,
	pub id: OperationId,
	pub category: QueueCategory,
	pub summary: String,
	pub sent_state: ConnectionState,
}

#[derive(Default)]
pub struct OperationQueues {
	queues: [VecDeque<CommandId>; 7],
	history: Vec<HistoryEntry>,
	checking: bool,
	recheck_requested: bool,
	bulk_depth: usize,
	pending_chain: VecDeque<CommandId>,
	overwrite_confirmations: BTreeMap<String, Vec<CommandId>>,
}

impl OperationQueues {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn enqueue(&mut self, command: CommandId, category: QueueCategory) {
		self.queues[category.index()].push_back(command);
	}

	/// Put a command back at the head of its queue
	pub fn push_front(&mut self, command: CommandId, category: QueueCategory) {
		self.queues[category.index()].push_front(command);
	}

	pub fn dequeue(&mut self, category: QueueCategory) -> Option<CommandId> {
		self.queues[category.index()].pop_front()
	}

	pub fn peek(&self, category: QueueCategory) -> Option<CommandId> {
		self.queues[category.index()].front().copied()
	}

	pub fn count(&self, category: QueueCategory) -> usize {
		self.queues[category.index()].len()
	}

	pub fn iter(&self, category: QueueCategory) -> impl Iterator<Item = &CommandId> {
		self.queues[category.index()].iter()
	}

	/// Empty one queue, returning what it held in order
	pub fn clear(&mut self, category: QueueCategory) -> Vec<CommandId> {
		self.queues[category.index()].drain(..).collect()
	}

	/// Empty every queue, the pending chain and the confirmation table
	pub fn clear_all(&mut self) -> Vec<CommandId> {
		let mut drained: Vec<CommandId> = self.pending_chain.drain(..).collect();
		for category in QueueCategory::PRIORITY {
			drained.extend(self.clear(category));
		}
		for (_, parked) in std::mem::take(&mut self.overwrite_confirmations) {
			drained.extend(parked);
		}
		drained
	}

	/// Number of commands waiting in the seven queues and the pending chain
	pub fn len(&self) -> usize {
		self.queues.iter().map(|q| q.len()).sum::<usize>() + self.pending_chain.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	// === Queue check guard ===

	/// Enter the queue check; returns false and requests a recheck if one is running
	pub fn begin_check(&mut self) -> bool {
		if self.checking {
			self.recheck_requested = true;
			return false;
		}
		self.checking = true;
		true
	}

	/// Returns true when a recheck was requested meanwhile and the check must loop
	pub fn end_check(&mut self) -> bool {
		if self.recheck_requested {
			self.recheck_requested = false;
			return true;
		}
		self.checking = false;
		false
	}

	pub fn is_checking(&self) -> bool {
		self.checking
	}

	// === Bulk commands ===

	pub fn start_bulk(&mut self) {
		self.bulk_depth += 1;
	}

	/// Close one bracket; returns true when the outermost bracket closed
	pub fn end_bulk(&mut self) -> bool {
		if self.bulk_depth == 0 {
			return false;
		}
		self.bulk_depth -= 1;
		self.bulk_depth == 0
	}

	pub fn is_bulk(&self) -> bool {
		self.bulk_depth > 0
	}

	// === Dependent chains ===

	/// Schedule `commands` to run next, ahead of anything already pending
	pub fn prepend_chain(&mut self, commands: Vec<CommandId>) {
		for command in commands.into_iter().rev() {
			self.pending_chain.push_front(command);
		}
	}

	pub fn pop_chain(&mut self) -> Option<CommandId> {
		self.pending_chain.pop_front()
	}

	pub fn peek_chain(&self) -> Option<CommandId> {
		self.pending_chain.front().copied()
	}

	pub fn take_chain(&mut self) -> Vec<CommandId> {
		self.pending_chain.drain(..).collect()
	}

	pub fn chain_iter(&self) -> impl Iterator<Item = &CommandId> {
		self.pending_chain.iter()
	}

	// === Overwrite confirmation ===

	pub fn park_for_confirmation(&mut self, path: &str, commands: Vec<CommandId>) {
		self.overwrite_confirmations.entry(path.to_string()).or_default().extend(commands);
	}

	pub fn take_confirmation(&mut self, path: &str) -> Option<Vec<CommandId>> {
		self.overwrite_confirmations.remove(path)
	}

	pub fn files_needing_overwrite_confirmation(&self) -> impl Iterator<Item = &str> {
		self.overwrite_confirmations.keys().map(|k| k.as_str())
	}

	// === History ===

	pub fn record_history(&mut self, entry: HistoryEntry) {
		self.history.push(entry);
	}

	pub fn history(&self) -> &[HistoryEntry] {
		&self.history
	}

	/// Render the queue contents for debugging
	pub fn describe(&self, arena: &CommandArena) -> String {
		let mut out = String::new();
		let label = |id: &CommandId| match arena.get(*id) {
			Some(c) => c.to_string(),
			None => format!("<released {}>", id),
		};

		if self.is_bulk() {
			let _ = writeln!(out, "bulk depth: {}", self.bulk_depth);
		}
		if !self.pending_chain.is_empty() {
			let _ = writeln!(out, "chain ({}):", self.pending_chain.len());
			for id in &self.pending_chain {
				let _ = writeln!(out, "  {}", label(id));
			}
		}
		for category in QueueCategory::PRIORITY {
			let queue = &self.queues[category.index()];
			if queue.is_empty() {
				continue;
			}
			let _ = writeln!(out, "{} ({}):", category.name(), queue.len());
			for id in queue {
				let _ = writeln!(out, "  {}", label(id));
			}
		}
		for (path, parked) in &self.overwrite_confirmations {
			let _ = writeln!(out, "awaiting overwrite confirmation: {} ({})", path, parked.len());
		}
		let _ = write!(out, "history: {} dispatched", self.history.len());
		out
	}
}


// vim: ts=4
