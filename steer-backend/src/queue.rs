use std::collections::VecDeque;

use steer_mods::TokenId;

/// A token that must be injected instead of sampled, together with the mod that asked for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedToken {
	pub token: TokenId,
	pub source: String,
}

/// Per-request FIFO of tokens owed to the sequence before the next sample may occur
#[derive(Debug, Default, Clone)]
pub struct ForcedQueue {
	tokens: VecDeque<ForcedToken>,
}

impl ForcedQueue {
	pub fn new() -> ForcedQueue {
		ForcedQueue::default()
	}

	/// Append tokens behind whatever is already queued
	pub fn push(&mut self, source: &str, tokens: &[TokenId]) {
		self.tokens.extend(tokens.iter().map(|t| ForcedToken {
			token: *t,
			source: source.to_string(),
		}));
	}

	pub fn pop(&mut self) -> Option<ForcedToken> {
		self.tokens.pop_front()
	}

	pub fn len(&self) -> usize {
		self.tokens.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tokens.is_empty()
	}

	pub fn tokens(&self) -> Vec<TokenId> {
		self.tokens.iter().map(|t| t.token).collect()
	}
}

#[cfg(test)]
mod test {
	use super::ForcedQueue;

	#[test]
	fn test_fifo_across_sources() {
		let mut q = ForcedQueue::new();
		q.push("a", &[1, 2]);
		q.push("b", &[]);
		q.push("c", &[3]);
		assert_eq!(q.tokens(), vec![1, 2, 3]);

		let first = q.pop().unwrap();
		assert_eq!((first.token, first.source.as_str()), (1, "a"));
		q.push("d", &[4]);
		let rest: Vec<(u32, String)> = std::iter::from_fn(|| q.pop()).map(|f| (f.token, f.source)).collect();
		assert_eq!(rest, vec![(2, "a".to_string()), (3, "c".to_string()), (4, "d".to_string())]);
		assert!(q.is_empty());
	}
}
