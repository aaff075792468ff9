//! Connections: the state machine and its owner task
//!
//! A [`Connection`] is the async client handle. Every request it makes and
//! every event an adapter reports travels over one bounded channel to the
//! connection's owner task, which is the only place the [`ConnectionMachine`]
//! is touched. Delegate callbacks therefore always run on that task.

mod driver;
mod machine;
mod writer;

pub use driver::{Completion, Connection, ConnectionBuilder};
pub use machine::{ConnectionMachine, OperationRequest, Submitted};

use crate::adapter::AdapterEvent;
use crate::error::ConnectionError;
use crate::types::Ticket;

// Type aliases to reduce complexity
type ClientCall = Box<dyn FnOnce(&mut ConnectionMachine) + Send>;

/// Message delivered to a connection's owner task
pub(crate) enum DriverMessage {
	/// Client request, run against the machine
	Client(ClientCall),
	/// Event reported by the protocol adapter
	Adapter(AdapterEvent),
	/// Connect timer of the given session expired
	ConnectTimeout(Ticket),
	/// Download writer of the given dispatch flushed or failed
	DownloadWritten { ticket: Ticket, result: Result<(), ConnectionError> },
	Shutdown,
}

// vim: ts=4
