//! Authentication challenges and cached credentials

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::types::OperationId;

/// Challenges answered before the connection gives up with `BadCredentials`
pub const AUTH_RETRY_LIMIT: u32 = 3;

/// User name and password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
	pub user: String,
	pub password: String,
}

impl Credential {
	pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
		Credential { user: user.into(), password: password.into() }
	}
}

impl fmt::Debug for Credential {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credential").field("user", &self.user).field("password", &"***").finish()
	}
}

/// Request for credentials raised by a protocol adapter
#[derive(Debug, Clone)]
pub struct AuthChallenge {
	pub host: String,
	pub protocol: String,
	/// Challenges already answered on this connection attempt
	pub previous_failure_count: u32,
	/// Credential suggested by the adapter, usually taken from the URL
	pub proposed: Option<Credential>,
	/// Operation in flight when the challenge arrived
	pub operation: Option<OperationId>,
}

/// How a client answers an authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeResponse {
	UseCredential(Credential),
	ContinueWithoutCredential,
	Cancel,
}

/// Source of stored credentials, consulted when the delegate does not answer challenges
pub trait CredentialCache: Send + Sync {
	fn credential_for(&self, host: &str, protocol: &str) -> Option<Credential>;
}

/// Credentials held in memory, keyed by (host, protocol)
#[derive(Default)]
pub struct MemoryCredentialCache {
	entries: Mutex<HashMap<(String, String), Credential>>,
}

impl MemoryCredentialCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, host: &str, protocol: &str, credential: Credential) {
		self.entries
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert((host.to_string(), protocol.to_string()), credential);
	}

	pub fn remove(&self, host: &str, protocol: &str) -> Option<Credential> {
		self.entries
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(&(host.to_string(), protocol.to_string()))
	}
}

impl CredentialCache for MemoryCredentialCache {
	fn credential_for(&self, host: &str, protocol: &str) -> Option<Credential> {
		self.entries
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(&(host.to_string(), protocol.to_string()))
			.cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_debug_redacts_password() {
		let text = format!("{:?}", Credential::new("alice", "hunter2"));
		assert!(text.contains("alice"));
		assert!(!text.contains("hunter2"));
	}

	#[test]
	fn test_memory_cache_is_keyed_by_protocol() {
		let cache = MemoryCredentialCache::new();
		cache.insert("example.org", "sftp", Credential::new("bob", "pw"));
		assert_eq!(cache.credential_for("example.org", "sftp").map(|c| c.user), Some("bob".into()));
		assert!(cache.credential_for("example.org", "ftp").is_none());
		assert!(cache.remove("example.org", "sftp").is_some());
		assert!(cache.credential_for("example.org", "sftp").is_none());
	}
}

// vim: ts=4
