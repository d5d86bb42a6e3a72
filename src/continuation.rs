use crate::error::EngineError;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
	ReadFile,
	ListDirectory,
	SearchFiles,
}

impl OperationKind {
	pub fn as_str(self) -> &'static str {
		match self {
			OperationKind::ReadFile => "read_file",
			OperationKind::ListDirectory => "list_directory",
			OperationKind::SearchFiles => "search_files",
		}
	}
}

/// Operation-specific resume position. The shape must match the operation
/// kind the token was created for; mixing them up is a usage error, never a
/// silent reinterpretation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cursor {
	Line { next_line: usize },
	Entry { next_index: usize },
	Scan {
		files_examined: usize,
		last_path: Option<String>,
	},
}

impl Cursor {
	pub fn matches(&self, kind: OperationKind) -> bool {
		matches!(
			(self, kind),
			(Cursor::Line { .. }, OperationKind::ReadFile)
				| (Cursor::Entry { .. }, OperationKind::ListDirectory)
				| (Cursor::Scan { .. }, OperationKind::SearchFiles)
		)
	}
}

#[derive(Clone, Debug)]
pub struct ContinuationToken {
	pub id: String,
	pub kind: OperationKind,
	pub target: String,
	pub cursor: Cursor,
	pub parameters: Value,
	pub created_at: Instant,
}

/// Resumable bookmarks for truncated operations. The store is an explicit
/// value owned by the server loop and handed to the dispatcher by reference;
/// it is safe under single-threaded cooperative scheduling only.
///
/// Tokens are evicted by a TTL measured from creation and by an LRU capacity
/// cap, both optional. Eviction runs opportunistically whenever the store is
/// touched.
pub struct TokenStore {
	entries: HashMap<String, ContinuationToken>,
	order: VecDeque<String>,
	capacity: Option<usize>,
	ttl: Option<Duration>,
}

impl TokenStore {
	pub fn new(capacity: Option<usize>, ttl: Option<Duration>) -> Self {
		Self {
			entries: HashMap::new(),
			order: VecDeque::new(),
			capacity,
			ttl
		}
	}

	pub fn generate(
		&mut self,
		kind: OperationKind,
		target: &str,
		cursor: Cursor,
		parameters: Value) -> Result<String, EngineError> {
		if !cursor.matches(kind) {
			return Err(EngineError::usage("cursor shape does not match operation kind"));
		}
		self.evict_expired();
		let id = uuid::Uuid::new_v4().to_string();
		self.entries.insert(id.clone(), ContinuationToken {
			id: id.clone(),
			kind,
			target: target.to_string(),
			cursor,
			parameters,
			created_at: Instant::now(),
		});
		self.order.push_back(id.clone());
		self.trim();
		Ok(id)
	}

	/// Last-write-wins replacement of the cursor; the shape check is the only
	/// merge rule an enum cursor needs.
	pub fn update(&mut self, id: &str, cursor: Cursor) -> Result<(), EngineError> {
		self.evict_expired();
		let entry = self.entries
			.get_mut(id)
			.ok_or(EngineError::TokenNotFound)?;
		if !cursor.matches(entry.kind) {
			return Err(EngineError::usage("cursor shape does not match operation kind"));
		}
		entry.cursor = cursor;
		self.touch(id);
		Ok(())
	}

	/// Owned copy of the token, mainly for its stored parameters.
	pub fn get(&mut self, id: &str) -> Result<ContinuationToken, EngineError> {
		self.evict_expired();
		let token = self.entries
			.get(id)
			.cloned()
			.ok_or(EngineError::TokenNotFound)?;
		self.touch(id);
		Ok(token)
	}

	/// Validates that the token belongs to exactly this `(operation, target)`
	/// pair and returns its cursor. The pair check is the only replay-safety
	/// guard; tokens are not bound to caller identity.
	pub fn resume(
		&mut self,
		id: &str,
		kind: OperationKind,
		target: &str) -> Result<Cursor, EngineError> {
		self.evict_expired();
		let entry = self.entries
			.get(id)
			.ok_or(EngineError::TokenNotFound)?;
		if entry.kind != kind || entry.target != target {
			return Err(EngineError::TokenMismatch {
				token_operation: entry.kind.as_str(),
				token_target: entry.target.clone(),
				operation: kind.as_str(),
				target: target.to_string(),
			});
		}
		let cursor = entry.cursor.clone();
		self.touch(id);
		Ok(cursor)
	}

	pub fn remove(&mut self, id: &str) {
		self.entries.remove(id);
		if let Some(pos) = self.order
			.iter()
			.position(|item| item == id) {
			self.order.remove(pos);
		}
	}

	fn touch(&mut self, id: &str) {
		if let Some(pos) = self.order
			.iter()
			.position(|item| item == id) {
			self.order.remove(pos);
		}
		self.order.push_back(id.to_string());
	}

	fn evict_expired(&mut self) {
		let Some(ttl) = self.ttl else {
			return;
		};
		let now = Instant::now();
		let expired: Vec<String> = self.entries
			.values()
			.filter(|entry| now.duration_since(entry.created_at) > ttl)
			.map(|entry| entry.id.clone())
			.collect();
		for id in expired {
			self.remove(&id);
		}
	}

	fn trim(&mut self) {
		let Some(capacity) = self.capacity else {
			return;
		};
		while self.order.len() > capacity {
			if let Some(id) = self.order.pop_front() {
				self.entries.remove(&id);
			}
		}
	}
}
