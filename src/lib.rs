//! # xfer - Queued Remote File Transfer Client
//!
//! xfer puts one client API in front of many file transfer protocols. Every
//! operation on a connection is wrapped in a command, queued by category and
//! dispatched one at a time to a protocol adapter; results come back through
//! a delegate.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use xfer::{ConnectionBuilder, OperationRequest, Operation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = ConnectionBuilder::new("file:///srv/data/").build()?;
//!     connection.connect().await?;
//!     connection.wait_until_open().await?;
//!     connection.upload_file("notes.txt".as_ref(), "/inbox/notes.txt").await?;
//!     connection.disconnect().await?;
//!     connection.wait_until_disconnected().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Recursive Uploads
//!
//! ```rust,ignore
//! use xfer::{config::UploaderConfig, uploader::Uploader};
//!
//! let report = Uploader::new(UploaderConfig::default())
//!     .upload(&connection, "./site".as_ref(), "/var/www")
//!     .await?;
//! println!("{} uploaded, {} skipped", report.uploaded, report.skipped);
//! ```

pub mod adapter;
pub mod auth;
pub mod command;
pub mod config;
pub mod connection;
pub mod delegate;
pub mod error;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod transfer;
pub mod types;
pub mod uploader;

// Re-export commonly used types and functions
pub use adapter::{AdapterRegistry, LocalAdapter, ProtocolAdapter};
pub use auth::{ChallengeResponse, Credential};
pub use config::Config;
pub use connection::{Completion, Connection, ConnectionBuilder, OperationRequest, Submitted};
pub use delegate::{ConnectionDelegate, DelegateBuilder, TransferEvent};
pub use error::{ConfigError, ConnectionError, ErrorKind};
pub use transfer::{TransferRecord, TransferSnapshot};
pub use types::{ConnectionState, Operation, OperationId, OverwritePolicy};

// vim: ts=4
