//! In-process reference model: a smoothed bigram language model over a [Vocabulary]

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};
use steer_mods::{Introspection, Logits, RequestId, TokenId, Tokenizer, Vocabulary};

use crate::{
	backend::{Backend, BackendError, ForwardOutput, PrefillOutput, Session},
	config::{CorpusConfig, LocalModelConfig},
	sampling::{self, SamplingParams},
};

/// Memory taken by a dense bigram table over `vocab_size` tokens
fn table_bytes(vocab_size: usize) -> usize {
	vocab_size.saturating_mul(vocab_size).saturating_mul(std::mem::size_of::<f32>())
}

/// Next-token log-probabilities conditioned on the previous token
#[derive(Debug, Clone)]
pub struct BigramModel {
	rows: Vec<Vec<f32>>,
}

impl BigramModel {
	/// Count bigrams in `documents` and turn them into log-probabilities with additive smoothing
	pub fn fit(vocab_size: usize, documents: &[Vec<TokenId>], smoothing: f32) -> BigramModel {
		let mut counts = vec![vec![0.0f32; vocab_size]; vocab_size];
		for doc in documents {
			for pair in doc.windows(2) {
				let (prev, next) = (pair[0] as usize, pair[1] as usize);
				if prev < vocab_size && next < vocab_size {
					counts[prev][next] += 1.0;
				}
			}
		}

		let rows = counts
			.into_iter()
			.map(|row| {
				let denominator = row.iter().sum::<f32>() + smoothing * vocab_size as f32;
				if denominator <= 0.0 {
					return vec![0.0; vocab_size];
				}
				row.into_iter()
					.map(|c| if c + smoothing > 0.0 { ((c + smoothing) / denominator).ln() } else { f32::NEG_INFINITY })
					.collect()
			})
			.collect();
		BigramModel { rows }
	}

	/// Use the given scores directly. `rows[a][b]` is the score of `b` following `a`.
	pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<BigramModel, BackendError> {
		let n = rows.len();
		if n == 0 {
			return Err(BackendError::Load(String::from("model has no rows")));
		}
		if let Some(bad) = rows.iter().find(|r| r.len() != n) {
			return Err(BackendError::LogitsShape {
				expected: n,
				actual: bad.len(),
			});
		}
		Ok(BigramModel { rows })
	}

	pub fn vocab_size(&self) -> usize {
		self.rows.len()
	}

	pub fn logits(&self, previous: TokenId) -> Option<Logits> {
		self.rows.get(previous as usize).map(|r| Logits::new(r.clone()))
	}
}

#[derive(Debug, Clone)]
pub struct LocalOptions {
	pub context_size: usize,
	pub seed: Option<u64>,
	pub introspection: bool,
}

impl Default for LocalOptions {
	fn default() -> Self {
		LocalOptions {
			context_size: 512,
			seed: None,
			introspection: false,
		}
	}
}

pub struct LocalBackend {
	name: String,
	vocabulary: Arc<Vocabulary>,
	model: Arc<BigramModel>,
	options: LocalOptions,
	sessions_started: AtomicU64,
}

impl LocalBackend {
	pub fn new(name: impl Into<String>, vocabulary: Vocabulary, model: BigramModel, options: LocalOptions) -> Result<LocalBackend, BackendError> {
		if vocabulary.len() != model.vocab_size() {
			return Err(BackendError::LogitsShape {
				expected: vocabulary.len(),
				actual: model.vocab_size(),
			});
		}
		Ok(LocalBackend {
			name: name.into(),
			vocabulary: Arc::new(vocabulary),
			model: Arc::new(model),
			options,
			sessions_started: AtomicU64::new(0),
		})
	}

	/// Build the vocabulary and train the model as configured
	pub async fn from_config(name: &str, config: &LocalModelConfig) -> Result<LocalBackend, BackendError> {
		let corpus = match &config.corpus {
			CorpusConfig::Text(text) => text.clone(),
			CorpusConfig::File(path) => tokio::fs::read_to_string(path)
				.await
				.map_err(|e| BackendError::Load(format!("could not read corpus at {path:?}: {e}")))?,
		};

		let vocabulary = match &config.vocabulary {
			Some(vc) => Vocabulary::new(vc).map_err(|e| BackendError::Load(e.to_string()))?,
			None => Vocabulary::from_corpus(&corpus),
		};

		if vocabulary.len() > config.max_vocabulary {
			return Err(BackendError::Load(format!(
				"vocabulary of {} tokens exceeds the configured maximum of {} (the bigram table would need {} MiB)",
				vocabulary.len(),
				config.max_vocabulary,
				table_bytes(vocabulary.len()) >> 20
			)));
		}

		let eos = vocabulary.eos_token_id();
		let documents: Vec<Vec<TokenId>> = corpus
			.lines()
			.map(|l| l.trim())
			.filter(|l| !l.is_empty())
			.map(|l| {
				let mut tokens = vocabulary.encode(l);
				tokens.extend(eos);
				tokens
			})
			.collect();

		let model = BigramModel::fit(vocabulary.len(), &documents, config.smoothing);
		tracing::info!(
			model = name,
			vocab_size = vocabulary.len(),
			table_mib = table_bytes(vocabulary.len()) >> 20,
			documents = documents.len(),
			context_size = config.context_size,
			"reference model trained"
		);

		LocalBackend::new(
			name,
			vocabulary,
			model,
			LocalOptions {
				context_size: config.context_size,
				seed: config.seed,
				introspection: config.introspection,
			},
		)
	}

	pub fn vocabulary(&self) -> &Vocabulary {
		&self.vocabulary
	}
}

#[async_trait]
impl Backend for LocalBackend {
	fn name(&self) -> &str {
		&self.name
	}

	fn tokenizer(&self) -> Arc<dyn Tokenizer> {
		self.vocabulary.clone()
	}

	async fn start_session(&self, request_id: &str) -> Result<Box<dyn Session>, BackendError> {
		let index = self.sessions_started.fetch_add(1, Ordering::Relaxed);
		let rng = match self.options.seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};
		tracing::debug!(model = %self.name, request_id, session = index, "starting session");
		Ok(Box::new(LocalSession {
			request_id: request_id.to_string(),
			model: self.model.clone(),
			options: self.options.clone(),
			cache: vec![],
			prompt_len: 0,
			prefilled: false,
			fresh_logits: false,
			rng,
		}))
	}
}

pub struct LocalSession {
	request_id: RequestId,
	model: Arc<BigramModel>,
	options: LocalOptions,

	/// One entry per cached position (prompt followed by generated tokens)
	cache: Vec<TokenId>,
	prompt_len: usize,
	prefilled: bool,

	/// Whether the last forward pass reflects the current cache
	fresh_logits: bool,
	rng: StdRng,
}

impl LocalSession {
	fn check_tokens(&self, tokens: &[TokenId]) -> Result<(), BackendError> {
		match tokens.iter().find(|t| **t as usize >= self.model.vocab_size()) {
			Some(t) => Err(BackendError::InvalidToken(*t)),
			None => Ok(()),
		}
	}

	fn introspect(&self) -> Introspection {
		// Token histogram over the context, with uniform attention over all positions
		let mut hidden_states = vec![0.0; self.model.vocab_size()];
		let weight = 1.0 / self.cache.len().max(1) as f32;
		for t in &self.cache {
			hidden_states[*t as usize] += weight;
		}
		Introspection {
			layer: 0,
			hidden_states,
			attention: Some(vec![weight; self.cache.len()]),
		}
	}
}

#[async_trait]
impl Session for LocalSession {
	fn request_id(&self) -> &RequestId {
		&self.request_id
	}

	async fn prefill(&mut self, tokens: &[TokenId], max_steps: usize) -> Result<PrefillOutput, BackendError> {
		if tokens.is_empty() {
			return Err(BackendError::EmptyPrompt);
		}
		if tokens.len() > self.options.context_size {
			return Err(BackendError::ContextFull {
				context_size: self.options.context_size,
			});
		}
		self.check_tokens(tokens)?;

		self.cache = tokens.to_vec();
		self.prompt_len = tokens.len();
		self.prefilled = true;
		self.fresh_logits = false;
		tracing::trace!(request_id = %self.request_id, prompt_length = tokens.len(), max_steps, "prefilled");
		Ok(PrefillOutput {
			prompt_length: tokens.len(),
		})
	}

	async fn forward_pass(&mut self) -> Result<ForwardOutput, BackendError> {
		let Some(last) = self.cache.last().copied().filter(|_| self.prefilled) else {
			return Err(BackendError::NotPrefilled);
		};
		if self.cache.len() >= self.options.context_size {
			return Err(BackendError::ContextFull {
				context_size: self.options.context_size,
			});
		}

		let logits = self.model.logits(last).ok_or(BackendError::InvalidToken(last))?;
		self.fresh_logits = true;
		Ok(ForwardOutput {
			logits,
			introspection: self.options.introspection.then(|| Arc::new(self.introspect())),
		})
	}

	async fn sample(&mut self, logits: &Logits, params: &SamplingParams) -> Result<TokenId, BackendError> {
		if !self.fresh_logits {
			return Err(BackendError::StaleLogits);
		}
		if logits.len() != self.model.vocab_size() {
			return Err(BackendError::LogitsShape {
				expected: self.model.vocab_size(),
				actual: logits.len(),
			});
		}
		sampling::sample(logits, params, &mut self.rng).ok_or_else(|| BackendError::Inference(String::from("no token has a finite score")))
	}

	async fn commit(&mut self, tokens: &[TokenId], forced: bool) -> Result<(), BackendError> {
		if !self.prefilled {
			return Err(BackendError::NotPrefilled);
		}
		self.check_tokens(tokens)?;
		if self.cache.len() + tokens.len() > self.options.context_size {
			return Err(BackendError::ContextFull {
				context_size: self.options.context_size,
			});
		}

		self.cache.extend_from_slice(tokens);
		self.fresh_logits = false;
		tracing::trace!(request_id = %self.request_id, ?tokens, forced, position = self.cache.len(), "committed");
		Ok(())
	}

	async fn rewind(&mut self, n: usize) -> Result<(), BackendError> {
		if !self.prefilled {
			return Err(BackendError::NotPrefilled);
		}
		let available = self.cache.len() - self.prompt_len;
		if n > available {
			return Err(BackendError::RewindPastStart { requested: n, available });
		}
		if n > 0 {
			self.cache.truncate(self.cache.len() - n);
			self.fresh_logits = false;
		}
		tracing::trace!(request_id = %self.request_id, n, position = self.cache.len(), "rewound");
		Ok(())
	}

	async fn shutdown(&mut self) -> Result<(), BackendError> {
		tracing::debug!(request_id = %self.request_id, positions = self.cache.len(), "releasing session");
		self.cache = vec![];
		self.prompt_len = 0;
		self.prefilled = false;
		self.fresh_logits = false;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use steer_mods::{Tokenizer, Vocabulary};

	use super::{BigramModel, LocalBackend, LocalOptions};
	use crate::{
		backend::{Backend, BackendError},
		config::{CorpusConfig, LocalModelConfig},
		sampling::SamplingParams,
	};

	fn backend() -> LocalBackend {
		let vocab = Vocabulary::from_corpus("the cat sat");
		let docs = vec![vocab.encode("the cat sat")];
		let model = BigramModel::fit(vocab.len(), &docs, 0.0);
		LocalBackend::new(
			"test",
			vocab,
			model,
			LocalOptions {
				context_size: 6,
				seed: Some(1),
				introspection: true,
			},
		)
		.unwrap()
	}

	#[test]
	fn test_fit() {
		let vocab = Vocabulary::from_corpus("the cat sat");
		let docs = vec![vocab.encode("the cat sat")];
		let model = BigramModel::fit(vocab.len(), &docs, 0.0);
		let the = vocab.id("the").unwrap();
		let cat = vocab.id(" cat").unwrap();
		assert_eq!(model.logits(the).unwrap().argmax(), Some(cat));
		assert_eq!(model.logits(the).unwrap().get(cat), Some(0.0));

		// Rows without observations are uniform
		let unk = model.logits(0).unwrap();
		assert!(unk.as_slice().iter().all(|s| *s == 0.0));

		assert!(BigramModel::from_rows(vec![vec![0.0, 1.0], vec![0.0]]).is_err());
	}

	#[tokio::test]
	async fn test_session_contract() {
		let backend = backend();
		let vocab = Vocabulary::from_corpus("the cat sat");
		let greedy = SamplingParams::default().with_temperature(0.0);
		let mut session = backend.start_session("r").await.unwrap();

		assert_eq!(session.forward_pass().await.unwrap_err(), BackendError::NotPrefilled);
		assert_eq!(session.prefill(&[], 4).await.unwrap_err(), BackendError::EmptyPrompt);
		session.prefill(&vocab.encode("the"), 4).await.unwrap();

		let fp = session.forward_pass().await.unwrap();
		assert!(fp.introspection.is_some());
		let token = session.sample(&fp.logits, &greedy).await.unwrap();
		assert_eq!(backend.tokenizer().decode(&[token]), " cat");
		session.commit(&[token], false).await.unwrap();

		// Logits are stale after a commit
		assert_eq!(session.sample(&fp.logits, &greedy).await.unwrap_err(), BackendError::StaleLogits);

		// The prompt cannot be rewound
		assert_eq!(
			session.rewind(2).await.unwrap_err(),
			BackendError::RewindPastStart { requested: 2, available: 1 }
		);
		session.rewind(1).await.unwrap();
		assert!(session.rewind(1).await.is_err());

		// Context limit
		session.commit(&[2, 2, 2, 2, 2], true).await.unwrap();
		assert!(matches!(session.forward_pass().await, Err(BackendError::ContextFull { context_size: 6 })));
		assert!(matches!(session.commit(&[2, 2], true).await, Err(BackendError::ContextFull { .. })));
		assert_eq!(session.commit(&[999], true).await.unwrap_err(), BackendError::InvalidToken(999));

		session.shutdown().await.unwrap();
		assert_eq!(session.forward_pass().await.unwrap_err(), BackendError::NotPrefilled);
	}

	#[tokio::test]
	async fn test_vocabulary_limit() {
		let mut config: LocalModelConfig = toml::from_str("corpus = { text = \"the cat sat on the mat\" }").unwrap();
		config.max_vocabulary = 8;
		match LocalBackend::from_config("big", &config).await {
			Err(BackendError::Load(message)) => assert!(message.contains("exceeds the configured maximum of 8")),
			Err(other) => panic!("unexpected error {other:?}"),
			Ok(_) => panic!("vocabulary limit not enforced"),
		}

		config.max_vocabulary = 4096;
		assert!(matches!(config.corpus, CorpusConfig::Text(_)));
		assert!(LocalBackend::from_config("small", &config).await.is_ok());
	}
}
