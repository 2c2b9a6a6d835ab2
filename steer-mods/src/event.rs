use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};

/// Identifier of a single vocabulary entry
pub type TokenId = u32;

/// Identifier of a single generation request
pub type RequestId = String;

/// Dense score vector over the vocabulary for the next position
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Logits(Vec<f32>);

impl Logits {
	pub fn new(scores: Vec<f32>) -> Logits {
		Logits(scores)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_slice(&self) -> &[f32] {
		&self.0
	}

	pub fn as_mut_slice(&mut self) -> &mut [f32] {
		&mut self.0
	}

	pub fn into_vec(self) -> Vec<f32> {
		self.0
	}

	pub fn get(&self, token: TokenId) -> Option<f32> {
		self.0.get(token as usize).copied()
	}

	/// Overwrite the score of a single token. Tokens outside the vocabulary are ignored.
	pub fn set(&mut self, token: TokenId, score: f32) {
		if let Some(s) = self.0.get_mut(token as usize) {
			*s = score;
		}
	}

	/// Token with the highest score (the first one on ties)
	pub fn argmax(&self) -> Option<TokenId> {
		let mut best: Option<(usize, f32)> = None;
		for (idx, score) in self.0.iter().copied().enumerate() {
			match best {
				Some((_, b)) if score <= b => {}
				_ => best = Some((idx, score)),
			}
		}
		best.map(|(idx, _)| idx as TokenId)
	}

	/// Numerically stable log-softmax of the scores
	pub fn log_softmax(&self) -> Vec<f32> {
		let max = self.0.iter().copied().fold(f32::NEG_INFINITY, f32::max);
		if !max.is_finite() {
			return vec![f32::NEG_INFINITY; self.0.len()];
		}
		let sum: f32 = self.0.iter().map(|s| (s - max).exp()).sum();
		let lse = max + sum.ln();
		self.0.iter().map(|s| s - lse).collect()
	}

	/// The `k` most likely tokens with their log-probabilities, most likely first
	pub fn top_k_logprobs(&self, k: usize) -> Vec<(TokenId, f32)> {
		let mut ranked: Vec<(TokenId, f32)> = self.log_softmax().into_iter().enumerate().map(|(i, lp)| (i as TokenId, lp)).collect();
		ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
		ranked.truncate(k);
		ranked
	}
}

impl From<Vec<f32>> for Logits {
	fn from(value: Vec<f32>) -> Self {
		Logits(value)
	}
}

/// Layer-wise data a backend may attach to a forward pass. The generation loop hands it to mods as-is and never
/// reports it to the ingest boundary.
#[derive(Clone, Debug, Default)]
pub struct Introspection {
	pub layer: usize,
	pub hidden_states: Vec<f32>,
	pub attention: Option<Vec<f32>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContextInfo {
	pub prompt_length: usize,
}

/// Fired once after the prompt has been processed
#[derive(Clone, Debug)]
pub struct Prefilled {
	pub request_id: RequestId,
	pub step: usize,
	pub max_steps: usize,
	pub context_info: Option<ContextInfo>,
}

/// Fired before the next token is chosen
#[derive(Clone, Debug)]
pub struct ForwardPass {
	pub request_id: RequestId,
	pub step: usize,
	pub logits: Logits,
	pub introspection: Option<Arc<Introspection>>,
}

/// Fired after a token was sampled but before it is committed
#[derive(Clone, Debug)]
pub struct Sampled {
	pub request_id: RequestId,
	pub step: usize,
	pub sampled_token: TokenId,
}

/// Fired after tokens were committed to the sequence
#[derive(Clone, Debug)]
pub struct Added {
	pub request_id: RequestId,
	pub step: usize,
	pub added_tokens: Vec<TokenId>,
	pub forced: bool,
}

/// A point in the per-token generation lifecycle
#[derive(Clone, Debug)]
pub enum Event {
	Prefilled(Prefilled),
	ForwardPass(ForwardPass),
	Sampled(Sampled),
	Added(Added),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
	Prefilled,
	ForwardPass,
	Sampled,
	Added,
}

impl EventKind {
	pub const ALL: [EventKind; 4] = [EventKind::Prefilled, EventKind::ForwardPass, EventKind::Sampled, EventKind::Added];
}

impl Display for EventKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			EventKind::Prefilled => "Prefilled",
			EventKind::ForwardPass => "ForwardPass",
			EventKind::Sampled => "Sampled",
			EventKind::Added => "Added",
		};
		f.write_str(name)
	}
}

impl Event {
	pub fn kind(&self) -> EventKind {
		match self {
			Event::Prefilled(_) => EventKind::Prefilled,
			Event::ForwardPass(_) => EventKind::ForwardPass,
			Event::Sampled(_) => EventKind::Sampled,
			Event::Added(_) => EventKind::Added,
		}
	}

	pub fn request_id(&self) -> &str {
		match self {
			Event::Prefilled(e) => &e.request_id,
			Event::ForwardPass(e) => &e.request_id,
			Event::Sampled(e) => &e.request_id,
			Event::Added(e) => &e.request_id,
		}
	}

	pub fn step(&self) -> usize {
		match self {
			Event::Prefilled(e) => e.step,
			Event::ForwardPass(e) => e.step,
			Event::Sampled(e) => e.step,
			Event::Added(e) => e.step,
		}
	}

	/// Logits carried by a forward pass event
	pub fn logits(&self) -> Option<&Logits> {
		match self {
			Event::ForwardPass(e) => Some(&e.logits),
			_ => None,
		}
	}

	pub fn into_logits(self) -> Option<Logits> {
		match self {
			Event::ForwardPass(e) => Some(e.logits),
			_ => None,
		}
	}
}
