use std::path::PathBuf;

use serde::Deserialize;
use steer_mods::{TokenId, VocabularyConfig};

use crate::sampling::SamplingParams;

#[derive(Deserialize, Debug, Clone)]
pub struct GenerationConfig {
	/// Maximum number of decode cycles for a request
	#[serde(default = "default_max_tokens")]
	pub max_tokens: usize,

	/// Temperature (randomness) used for sampling. A higher number is more random.
	#[serde(default = "default_temperature")]
	pub temperature: f32,

	/// The cumulative probability after which no more tokens are kept for sampling.
	#[serde(default = "default_top_p")]
	pub top_p: f32,

	/// The top K tokens by score are kept during sampling.
	#[serde(default = "default_top_k")]
	pub top_k: usize,

	/// Tokens that end generation (just like the end-of-sequence token)
	#[serde(default)]
	pub stop_tokens: Vec<TokenId>,

	/// Sequences that end generation as soon as the output contains them
	#[serde(default)]
	pub stop_sequences: Vec<String>,
}

const fn default_max_tokens() -> usize {
	2048
}

const fn default_temperature() -> f32 {
	0.7
}

const fn default_top_p() -> f32 {
	0.9
}

const fn default_top_k() -> usize {
	50
}

impl Default for GenerationConfig {
	fn default() -> Self {
		GenerationConfig {
			max_tokens: default_max_tokens(),
			temperature: default_temperature(),
			top_p: default_top_p(),
			top_k: default_top_k(),
			stop_tokens: vec![],
			stop_sequences: vec![],
		}
	}
}

impl GenerationConfig {
	pub fn sampling(&self) -> SamplingParams {
		SamplingParams {
			temperature: self.temperature,
			top_p: self.top_p,
			top_k: self.top_k,
		}
	}
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub enum CorpusConfig {
	/// Training text included directly in the configuration
	Text(String),

	/// Training text read from a file
	File(PathBuf),
}

/// Configuration of the in-process reference model
#[derive(Deserialize, Debug, Clone)]
pub struct LocalModelConfig {
	/// Text the bigram statistics are gathered from, one document per line
	pub corpus: CorpusConfig,

	/// Explicit vocabulary. When absent, the vocabulary is derived from the corpus.
	pub vocabulary: Option<VocabularyConfig>,

	/// Pseudo-count added to every bigram
	#[serde(default = "default_smoothing")]
	pub smoothing: f32,

	/// Maximum number of positions (prompt and generated tokens) a session can hold
	#[serde(default = "default_context_size")]
	pub context_size: usize,

	/// Seed for sampling. When absent, every session is seeded from entropy.
	pub seed: Option<u64>,

	/// Whether forward passes carry introspection data
	#[serde(default)]
	pub introspection: bool,

	/// Largest vocabulary the model may be trained on. The bigram table holds vocabulary size squared scores.
	#[serde(default = "default_max_vocabulary")]
	pub max_vocabulary: usize,
}

const fn default_smoothing() -> f32 {
	0.01
}

const fn default_context_size() -> usize {
	512
}

const fn default_max_vocabulary() -> usize {
	4096
}
