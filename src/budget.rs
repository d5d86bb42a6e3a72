use serde_json::Value;

/// Fraction of the hard response ceiling a chunk is allowed to fill. The gap
/// absorbs envelope fields and framing that are not tracked per item.
pub const BUDGET_FRACTION: f64 = 0.9;

/// Admission control against a response byte ceiling. Callers ask `can_admit`
/// for each candidate item and `commit` the ones they keep, in order; the
/// running total is only ever built from committed admissions, never
/// recomputed from the partial response.
#[derive(Debug, Clone)]
pub struct SizeBudgetMonitor {
	threshold_bytes: usize,
	current_bytes: usize,
}

impl SizeBudgetMonitor {
	pub fn new(limit_bytes: usize) -> Self {
		Self::with_fraction(limit_bytes, BUDGET_FRACTION)
	}

	pub fn with_fraction(limit_bytes: usize, fraction: f64) -> Self {
		let threshold_bytes = if limit_bytes == usize::MAX {
			usize::MAX
		}
		else {
			(limit_bytes as f64 * fraction) as usize
		};
		Self {
			threshold_bytes,
			current_bytes: 0
		}
	}

	/// Unlimited monitor: everything is admitted.
	pub fn unbounded() -> Self {
		Self::with_fraction(usize::MAX, 1.0)
	}

	pub fn can_admit(&self, estimate: usize) -> bool {
		self.current_bytes.saturating_add(estimate) <= self.threshold_bytes
	}

	pub fn commit(&mut self, estimate: usize) {
		self.current_bytes = self.current_bytes.saturating_add(estimate);
	}

	pub fn used_bytes(&self) -> usize {
		self.current_bytes
	}
}

/// Serialized size of one candidate item. A value that fails to serialize
/// reports `usize::MAX`, so the monitor rejects it instead of anyone
/// panicking; the chunk just ends one item early.
pub fn estimate_value_size(value: &Value) -> usize {
	serde_json::to_string(value).map(|text| text.as_bytes().len()).unwrap_or(usize::MAX)
}
