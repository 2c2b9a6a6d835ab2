use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;
use thiserror::Error;

use crate::event::TokenId;

/// Read-only tokenizer handle that mods may use to encode and decode text
pub trait Tokenizer: Send + Sync {
	fn encode(&self, text: &str) -> Vec<TokenId>;

	fn decode(&self, tokens: &[TokenId]) -> String;

	fn vocab_size(&self) -> usize;

	fn eos_token_id(&self) -> Option<TokenId>;

	/// Decode only the last `count` tokens
	fn decode_last(&self, tokens: &[TokenId], count: usize) -> String {
		self.decode(&tokens[tokens.len().saturating_sub(count)..])
	}
}

#[derive(Debug, Error)]
pub enum VocabularyError {
	#[error("vocabulary is empty")]
	Empty,

	#[error("duplicate token in vocabulary: {0:?}")]
	DuplicateToken(String),

	#[error("special token {0:?} is not part of the vocabulary")]
	UnknownSpecialToken(String),
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct VocabularyConfig {
	/// The tokens, in id order
	pub tokens: Vec<String>,

	/// End-of-sequence token (must be one of `tokens`)
	pub eos: Option<String>,

	/// Token used for input that cannot be matched (must be one of `tokens`)
	pub unknown: Option<String>,
}

pub const DEFAULT_EOS: &str = "</s>";
pub const DEFAULT_UNKNOWN: &str = "<unk>";

/// A fixed vocabulary with a greedy longest-match encoder
#[derive(Debug, Clone)]
pub struct Vocabulary {
	tokens: Vec<String>,
	ids: HashMap<String, TokenId>,
	max_token_chars: usize,
	eos: Option<TokenId>,
	unknown: Option<TokenId>,
}

impl Vocabulary {
	pub fn new(config: &VocabularyConfig) -> Result<Vocabulary, VocabularyError> {
		if config.tokens.is_empty() {
			return Err(VocabularyError::Empty);
		}

		let mut ids = HashMap::with_capacity(config.tokens.len());
		for (id, token) in config.tokens.iter().enumerate() {
			if ids.insert(token.clone(), id as TokenId).is_some() {
				return Err(VocabularyError::DuplicateToken(token.clone()));
			}
		}

		let special = |name: &Option<String>| -> Result<Option<TokenId>, VocabularyError> {
			match name {
				None => Ok(None),
				Some(n) => ids.get(n).copied().map(Some).ok_or_else(|| VocabularyError::UnknownSpecialToken(n.clone())),
			}
		};
		let eos = special(&config.eos)?;
		let unknown = special(&config.unknown)?;

		let max_token_chars = config.tokens.iter().map(|t| t.chars().count()).max().unwrap_or(1);
		Ok(Vocabulary {
			tokens: config.tokens.clone(),
			ids,
			max_token_chars,
			eos,
			unknown,
		})
	}

	/// Build a vocabulary from a text corpus: every distinct character, every distinct word with and without a
	/// leading space, plus the default end-of-sequence and unknown tokens.
	pub fn from_corpus(corpus: &str) -> Vocabulary {
		let mut entries: BTreeSet<String> = corpus.chars().map(String::from).collect();
		for word in corpus.split_whitespace() {
			entries.insert(word.to_string());
			entries.insert(format!(" {word}"));
		}
		entries.remove(DEFAULT_EOS);
		entries.remove(DEFAULT_UNKNOWN);

		let mut tokens = vec![DEFAULT_UNKNOWN.to_string(), DEFAULT_EOS.to_string()];
		tokens.extend(entries);

		let max_token_chars = tokens.iter().map(|t| t.chars().count()).max().unwrap_or(1);
		let ids = tokens.iter().enumerate().map(|(id, t)| (t.clone(), id as TokenId)).collect();
		Vocabulary {
			tokens,
			ids,
			max_token_chars,
			eos: Some(1),
			unknown: Some(0),
		}
	}

	pub fn id(&self, token: &str) -> Option<TokenId> {
		self.ids.get(token).copied()
	}

	pub fn token(&self, id: TokenId) -> Option<&str> {
		self.tokens.get(id as usize).map(|s| s.as_str())
	}

	pub fn len(&self) -> usize {
		self.tokens.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tokens.is_empty()
	}
}

impl Tokenizer for Vocabulary {
	fn encode(&self, text: &str) -> Vec<TokenId> {
		let chars: Vec<(usize, char)> = text.char_indices().collect();
		let mut out = vec![];
		let mut pos = 0;
		while pos < chars.len() {
			let start = chars[pos].0;
			let longest = (1..=self.max_token_chars.min(chars.len() - pos)).rev().find_map(|n| {
				let end = chars.get(pos + n).map(|c| c.0).unwrap_or(text.len());
				self.ids.get(&text[start..end]).map(|id| (n, *id))
			});

			match longest {
				Some((n, id)) => {
					out.push(id);
					pos += n;
				}
				None => {
					tracing::trace!("no token for character {:?}", chars[pos].1);
					if let Some(unk) = self.unknown {
						out.push(unk);
					}
					pos += 1;
				}
			}
		}
		out
	}

	fn decode(&self, tokens: &[TokenId]) -> String {
		tokens
			.iter()
			.filter(|t| Some(**t) != self.eos && Some(**t) != self.unknown)
			.filter_map(|t| self.token(*t))
			.collect()
	}

	fn vocab_size(&self) -> usize {
		self.tokens.len()
	}

	fn eos_token_id(&self) -> Option<TokenId> {
		self.eos
	}
}
