use std::sync::Arc;

use async_trait::async_trait;
use steer_mods::{Introspection, Logits, RequestId, TokenId, Tokenizer};
use thiserror::Error;

use crate::sampling::SamplingParams;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
	#[error("cannot rewind {requested} positions, only {available} generated positions are cached")]
	RewindPastStart { requested: usize, available: usize },

	#[error("prompt is empty")]
	EmptyPrompt,

	#[error("session has not been prefilled")]
	NotPrefilled,

	#[error("logits are stale; a forward pass is required after a commit or rewind")]
	StaleLogits,

	#[error("token {0} is not part of the vocabulary")]
	InvalidToken(TokenId),

	#[error("logits have {actual} entries, vocabulary has {expected}")]
	LogitsShape { expected: usize, actual: usize },

	#[error("context is full ({context_size} positions)")]
	ContextFull { context_size: usize },

	#[error("could not load model: {0}")]
	Load(String),

	#[error("inference error: {0}")]
	Inference(String),
}

/// Result of processing a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefillOutput {
	pub prompt_length: usize,
}

/// Result of a single forward pass at the current position
#[derive(Debug, Clone)]
pub struct ForwardOutput {
	pub logits: Logits,

	/// Passed to mods as-is; never inspected by the generation loop
	pub introspection: Option<Arc<Introspection>>,
}

/// A model that can serve generation requests. Every request gets its own [Session], which exclusively owns the
/// inference state (cache) of that request.
#[async_trait]
pub trait Backend: Send + Sync {
	fn name(&self) -> &str;

	fn tokenizer(&self) -> Arc<dyn Tokenizer>;

	async fn start_session(&self, request_id: &str) -> Result<Box<dyn Session>, BackendError>;
}

/// Inference state for a single request. Operations are issued by exactly one generation loop, in order.
#[async_trait]
pub trait Session: Send {
	fn request_id(&self) -> &RequestId;

	/// Process the prompt, replacing any state the session had
	async fn prefill(&mut self, tokens: &[TokenId], max_steps: usize) -> Result<PrefillOutput, BackendError>;

	/// Compute logits for the next position
	async fn forward_pass(&mut self) -> Result<ForwardOutput, BackendError>;

	/// Choose a token from (possibly adjusted) logits of the most recent forward pass
	async fn sample(&mut self, logits: &Logits, params: &SamplingParams) -> Result<TokenId, BackendError>;

	/// Append tokens to the sequence
	async fn commit(&mut self, tokens: &[TokenId], forced: bool) -> Result<(), BackendError>;

	/// Drop the last `n` generated positions from the cache. Fails when `n` exceeds the number of generated
	/// positions; the prompt can never be rewound.
	async fn rewind(&mut self, n: usize) -> Result<(), BackendError>;

	/// Release the resources held for this request. Called exactly once, however the request ended.
	async fn shutdown(&mut self) -> Result<(), BackendError>;
}
