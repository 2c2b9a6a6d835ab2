use std::{collections::HashMap, sync::Mutex, time::Duration};

use serde::Serialize;

/// Counters for a single request
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
	pub prompt_tokens: usize,
	pub prefill_duration: Duration,

	pub forward_passes: usize,
	pub forward_duration: Duration,

	/// Tokens committed to the sequence (sampled and forced)
	pub generated_tokens: usize,
	pub sampled_tokens: usize,
	pub forced_tokens: usize,

	pub backtracks: usize,
	pub rewound_tokens: usize,

	pub dispatches: usize,
	pub dispatch_duration: Duration,
}

/// Aggregated counters for all requests served by one generator
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct TaskStats {
	/// Number of requests that finished (successfully or not)
	requests: usize,
	failed_requests: usize,

	prompt_tokens: usize,
	prefill_duration: Duration,

	generated_tokens: usize,
	forced_tokens: usize,
	forward_duration: Duration,

	backtracks: usize,
	dispatch_duration: Duration,
}

impl TaskStats {
	pub fn add_request(&mut self, stats: &GenerationStats, failed: bool) {
		self.requests += 1;
		if failed {
			self.failed_requests += 1;
		}
		self.prompt_tokens += stats.prompt_tokens;
		self.prefill_duration += stats.prefill_duration;
		self.generated_tokens += stats.generated_tokens;
		self.forced_tokens += stats.forced_tokens;
		self.forward_duration += stats.forward_duration;
		self.backtracks += stats.backtracks;
		self.dispatch_duration += stats.dispatch_duration;
	}

	pub fn requests(&self) -> usize {
		self.requests
	}

	pub fn failed_requests(&self) -> usize {
		self.failed_requests
	}

	pub fn generated_tokens(&self) -> usize {
		self.generated_tokens
	}
}

#[derive(Debug, Default)]
pub struct EngineStats {
	pub task_stats: Mutex<HashMap<String, TaskStats>>,
}

impl EngineStats {
	pub fn add(&self, task_name: &str, stats: &GenerationStats, failed: bool) {
		let mut ts = self.task_stats.lock().unwrap_or_else(|e| e.into_inner());
		ts.entry(task_name.to_string()).or_default().add_request(stats, failed);
	}

	pub fn snapshot(&self) -> HashMap<String, TaskStats> {
		self.task_stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}
}

#[cfg(test)]
mod test {
	use super::{EngineStats, GenerationStats};

	#[test]
	fn test_aggregation() {
		let stats = EngineStats::default();
		let request = GenerationStats {
			prompt_tokens: 3,
			generated_tokens: 5,
			forced_tokens: 2,
			..Default::default()
		};
		stats.add("chat", &request, false);
		stats.add("chat", &request, true);
		stats.add("other", &request, false);

		let snapshot = stats.snapshot();
		assert_eq!(snapshot["chat"].requests(), 2);
		assert_eq!(snapshot["chat"].failed_requests(), 1);
		assert_eq!(snapshot["chat"].generated_tokens(), 10);
		assert_eq!(snapshot["other"].requests(), 1);
	}
}
