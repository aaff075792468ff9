//! Queueable commands and their dependency chains
//!
//! Commands live in a [`CommandArena`]; dependents and the parent
//! back-reference are stored as [`CommandId`] indices, so a chain never forms
//! an owning cycle. Ids carry a generation and go stale once their command is
//! released.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::delegate::TransferDelegate;
use crate::transfer::RecordId;
use crate::types::{ConnectionState, Operation, OperationId, QueueCategory};

/// Arena handle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId {
	index: u32,
	generation: u32,
}

impl fmt::Display for CommandId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "c{}.{}", self.index, self.generation)
	}
}

/// One queued unit of work
pub struct Command {
	pub operation: Operation,
	pub id: OperationId,
	pub await_state: ConnectionState,
	pub sent_state: ConnectionState,
	/// Free-form annotations shown in queue descriptions
	pub properties: BTreeMap<String, String>,
	pub(crate) record: Option<RecordId>,
	pub(crate) delegate: Option<Arc<dyn TransferDelegate>>,
	dependents: Vec<CommandId>,
	parent: Option<CommandId>,
}

impl Command {
	pub fn new(operation: Operation, id: OperationId) -> Self {
		Command {
			await_state: operation.await_state(),
			sent_state: operation.sent_state(),
			operation,
			id,
			properties: BTreeMap::new(),
			record: None,
			delegate: None,
			dependents: Vec::new(),
			parent: None,
		}
	}

	pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
		self.properties.insert(key.to_string(), value.into());
		self
	}

	pub fn category(&self) -> QueueCategory {
		self.operation.category()
	}

	pub fn dependents(&self) -> &[CommandId] {
		&self.dependents
	}

	pub fn parent(&self) -> Option<CommandId> {
		self.parent
	}

	pub fn record(&self) -> Option<RecordId> {
		self.record
	}
}

impl fmt::Debug for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Command")
			.field("operation", &self.operation)
			.field("id", &self.id)
			.field("await_state", &self.await_state)
			.field("sent_state", &self.sent_state)
			.field("dependents", &self.dependents)
			.field("parent", &self.parent)
			.finish()
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {} [{} -> {}]", self.id, self.operation, self.await_state, self.sent_state)?;
		for (k, v) in &self.properties {
			write!(f, " {}={}", k, v)?;
		}
		Ok(())
	}
}

struct Slot {
	generation: u32,
	command: Option<Command>,
}

/// Owner of every live command of one connection
#[derive(Default)]
pub struct CommandArena {
	slots: Vec<Slot>,
	free: Vec<u32>,
}

impl CommandArena {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, command: Command) -> CommandId {
		if let Some(index) = self.free.pop() {
			let slot = &mut self.slots[index as usize];
			slot.generation = slot.generation.wrapping_add(1);
			slot.command = Some(command);
			CommandId { index, generation: slot.generation }
		} else {
			self.slots.push(Slot { generation: 0, command: Some(command) });
			CommandId { index: (self.slots.len() - 1) as u32, generation: 0 }
		}
	}

	pub fn get(&self, id: CommandId) -> Option<&Command> {
		self.slots
			.get(id.index as usize)
			.filter(|s| s.generation == id.generation)
			.and_then(|s| s.command.as_ref())
	}

	pub fn get_mut(&mut self, id: CommandId) -> Option<&mut Command> {
		self.slots
			.get_mut(id.index as usize)
			.filter(|s| s.generation == id.generation)
			.and_then(|s| s.command.as_mut())
	}

	pub fn contains(&self, id: CommandId) -> bool {
		self.get(id).is_some()
	}

	pub fn len(&self) -> usize {
		self.slots.iter().filter(|s| s.command.is_some()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Append `child` to the dependents of `parent`
	///
	/// Returns false when either id is stale, `child` already has a parent,
	/// or `child` is an ancestor of `parent`.
	pub fn add_dependent(&mut self, parent: CommandId, child: CommandId) -> bool {
		if parent == child || !self.contains(parent) {
			return false;
		}
		match self.get(child) {
			Some(c) if c.parent.is_none() => {}
			_ => return false,
		}
		let mut cursor = self.get(parent).and_then(|p| p.parent);
		while let Some(ancestor) = cursor {
			if ancestor == child {
				return false;
			}
			cursor = self.get(ancestor).and_then(|a| a.parent);
		}

		if let Some(c) = self.get_mut(child) {
			c.parent = Some(parent);
		}
		if let Some(p) = self.get_mut(parent) {
			p.dependents.push(child);
		}
		true
	}

	/// Detach `child` from `parent`; the child stays in the arena as a root
	pub fn remove_dependent(&mut self, parent: CommandId, child: CommandId) -> bool {
		let removed = match self.get_mut(parent) {
			Some(p) => {
				let before = p.dependents.len();
				p.dependents.retain(|d| *d != child);
				before != p.dependents.len()
			}
			None => false,
		};
		if removed {
			if let Some(c) = self.get_mut(child) {
				c.parent = None;
			}
		}
		removed
	}

	/// Depth-first pre-order execution order: `id`, then each dependent's chain
	pub fn sequenced_chain(&self, id: CommandId) -> Vec<CommandId> {
		let mut out = Vec::new();
		let mut stack = vec![id];
		while let Some(next) = stack.pop() {
			let Some(command) = self.get(next) else {
				continue;
			};
			out.push(next);
			for dep in command.dependents.iter().rev() {
				stack.push(*dep);
			}
		}
		out
	}

	/// Detach and return the dependents of `id`, clearing their parent links
	pub fn take_dependents(&mut self, id: CommandId) -> Vec<CommandId> {
		let deps = match self.get_mut(id) {
			Some(c) => std::mem::take(&mut c.dependents),
			None => return Vec::new(),
		};
		for dep in &deps {
			if let Some(c) = self.get_mut(*dep) {
				c.parent = None;
			}
		}
		deps
	}

	/// Remove a single command; its dependents become roots
	pub fn release(&mut self, id: CommandId) -> Option<Command> {
		let parent = self.get(id)?.parent;
		if let Some(parent) = parent {
			self.remove_dependent(parent, id);
		}
		self.take_dependents(id);
		let slot = &mut self.slots[id.index as usize];
		let command = slot.command.take();
		self.free.push(id.index);
		command
	}

	/// Remove `id` and its whole chain, returning them in execution order
	pub fn release_chain(&mut self, id: CommandId) -> Vec<Command> {
		self.sequenced_chain(id).into_iter().filter_map(|c| self.release(c)).collect()
	}
}


// vim: ts=4
