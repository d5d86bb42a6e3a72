use crate::budget::{estimate_value_size, SizeBudgetMonitor};
use crate::continuation::Cursor;
use anyhow::Result;
use serde_json::Value;

/// Items are pulled one at a time so the assembler can stop exactly at the
/// budget boundary. `cursor` reports the position the *next* pull would
/// resume from; implementations recompute their sequence from scratch on
/// every call, so slicing by cursor is idempotent.
pub trait ItemSource {
	fn next_item(&mut self) -> Result<Option<Value>>;
	fn cursor(&self) -> Cursor;
}

#[derive(Debug)]
pub struct Chunk {
	pub items: Vec<Value>,
	pub has_more: bool,
	pub next_cursor: Cursor,
}

const YIELD_EVERY: usize = 32;

/// Pull from the source until the monitor stops admitting or the sequence
/// runs dry. A rejected item is never consumed: the chunk's cursor rewinds to
/// just before it, so the next call re-emits it without loss or duplication.
/// The first item of a chunk is admitted unconditionally; an item larger than
/// the whole budget still ships alone rather than stalling resumption with an
/// empty chunk.
pub async fn assemble(source: &mut dyn ItemSource, monitor: &mut SizeBudgetMonitor) -> Result<Chunk> {
	let mut items = Vec::new();
	let mut pulled = 0usize;
	loop {
		let before = source.cursor();
		let Some(item) = source.next_item()? else {
			return Ok(Chunk {
				items,
				has_more: false,
				next_cursor: source.cursor(),
			});
		};
		pulled += 1;
		let estimate = estimate_value_size(&item);
		if !monitor.can_admit(estimate) && !items.is_empty() {
			return Ok(Chunk {
				items,
				has_more: true,
				next_cursor: before,
			});
		}
		monitor.commit(estimate);
		items.push(item);
		if pulled % YIELD_EVERY == 0 {
			tokio::task::yield_now().await;
		}
	}
}

/// Wraps a domain payload with the uniform resumability fields. The token
/// field is only present while `has_more` is true; a missing token in that
/// state is a caller defect, but the partial result stays consumable with an
/// explicit null instead of failing. Envelope fields themselves are not
/// re-checked against the budget (documented approximation).
pub fn build_envelope(domain: Value, has_more: bool, token_id: Option<&str>) -> Value {
	let mut obj = match domain {
		Value::Object(obj) => obj,
		other => {
			let mut obj = serde_json::Map::new();
			obj.insert("items".to_string(), other);
			obj
		}
	};
	obj.insert("has_more".to_string(), Value::Bool(has_more));
	if has_more {
		let token = token_id
			.map(|id| Value::String(id.to_string()))
			.unwrap_or(Value::Null);
		obj.insert("continuation_token".to_string(), token);
	}
	Value::Object(obj)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	struct NumberSource {
		values: Vec<Value>,
		next: usize,
	}

	impl NumberSource {
		fn new(values: Vec<Value>) -> Self {
			Self {
				values,
				next: 0
			}
		}
	}

	impl ItemSource for NumberSource {
		fn next_item(&mut self) -> Result<Option<Value>> {
			if self.next >= self.values.len() {
				return Ok(None);
			}
			let item = self.values[self.next].clone();
			self.next += 1;
			Ok(Some(item))
		}
		fn cursor(&self) -> Cursor {
			Cursor::Entry { next_index: self.next }
		}
	}

	fn string_items(count: usize, len: usize) -> Vec<Value> {
		(0..count).map(|_| Value::String("x".repeat(len))).collect()
	}

	#[tokio::test]
	async fn exhausted_source_has_no_more() {
		let mut source = NumberSource::new(string_items(3, 4));
		let mut monitor = SizeBudgetMonitor::unbounded();
		let chunk = assemble(&mut source, &mut monitor).await.expect("assemble");
		assert_eq!(chunk.items.len(), 3);
		assert!(!chunk.has_more);
		assert_eq!(chunk.next_cursor, Cursor::Entry { next_index: 3 });
	}

	#[tokio::test]
	async fn rejected_item_rewinds_the_cursor() {
		// each item serializes to 12 bytes; threshold 27 admits two
		let mut source = NumberSource::new(string_items(5, 10));
		let mut monitor = SizeBudgetMonitor::with_fraction(30, 0.9);
		let chunk = assemble(&mut source, &mut monitor).await.expect("assemble");
		assert_eq!(chunk.items.len(), 2);
		assert!(chunk.has_more);
		assert_eq!(chunk.next_cursor, Cursor::Entry { next_index: 2 });
	}

	#[tokio::test]
	async fn oversized_single_item_still_ships() {
		let mut source = NumberSource::new(string_items(2, 5000));
		let mut monitor = SizeBudgetMonitor::new(1000);
		let chunk = assemble(&mut source, &mut monitor).await.expect("assemble");
		assert_eq!(chunk.items.len(), 1);
		assert!(chunk.has_more);
		assert_eq!(chunk.next_cursor, Cursor::Entry { next_index: 1 });
	}

	#[tokio::test]
	async fn resumed_chunks_cover_the_sequence_exactly_once() {
		let values = string_items(20, 10);
		let mut collected = Vec::new();
		let mut next = 0usize;
		loop {
			let mut source = NumberSource::new(values.clone());
			source.next = next;
			let mut monitor = SizeBudgetMonitor::with_fraction(50, 0.9);
			let chunk = assemble(&mut source, &mut monitor).await.expect("assemble");
			collected.extend(chunk.items);
			let Cursor::Entry { next_index } = chunk.next_cursor else {
				panic!("unexpected cursor shape");
			};
			next = next_index;
			if !chunk.has_more {
				break;
			}
		}
		assert_eq!(collected, values);
	}

	#[test]
	fn envelope_includes_token_only_while_more_remains() {
		let done = build_envelope(json!({"count": 1}), false, None);
		assert_eq!(done.get("has_more"), Some(&Value::Bool(false)));
		assert!(done.get("continuation_token").is_none());

		let more = build_envelope(json!({"count": 1}), true, Some("abc"));
		assert_eq!(more.get("has_more"), Some(&Value::Bool(true)));
		assert_eq!(
			more.get("continuation_token").and_then(Value::as_str),
			Some("abc")
		);
	}

	#[test]
	fn envelope_with_missing_token_degrades_to_null() {
		let value = build_envelope(json!({"count": 1}), true, None);
		assert_eq!(value.get("has_more"), Some(&Value::Bool(true)));
		assert_eq!(value.get("continuation_token"), Some(&Value::Null));
	}
}
