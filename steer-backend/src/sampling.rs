//! Temperature, top-k and nucleus (top-p) sampling over a logits vector

use rand::{
	distributions::{Distribution, WeightedIndex},
	Rng,
};
use serde::Serialize;
use steer_mods::{Logits, TokenId};

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
	/// Temperature used to scale the logits. Zero (or less) selects the most likely token.
	pub temperature: f32,

	/// Cumulative probability after which no more tokens are kept
	pub top_p: f32,

	/// Number of most likely tokens kept (zero keeps all)
	pub top_k: usize,
}

impl Default for SamplingParams {
	fn default() -> Self {
		SamplingParams {
			temperature: 0.7,
			top_p: 0.9,
			top_k: 50,
		}
	}
}

impl SamplingParams {
	pub fn with_temperature(self, temperature: f32) -> SamplingParams {
		SamplingParams { temperature, ..self }
	}
}

/// Pick a token. Returns `None` when no token has a finite score.
pub fn sample(logits: &Logits, params: &SamplingParams, rng: &mut impl Rng) -> Option<TokenId> {
	if params.temperature <= 0.0 {
		return logits.argmax().filter(|t| logits.get(*t).map(|s| s.is_finite()).unwrap_or(false));
	}

	let mut candidates: Vec<(TokenId, f32)> = logits
		.as_slice()
		.iter()
		.enumerate()
		.filter(|(_, s)| s.is_finite())
		.map(|(i, s)| (i as TokenId, s / params.temperature))
		.collect();
	if candidates.is_empty() {
		return None;
	}

	candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
	if params.top_k > 0 {
		candidates.truncate(params.top_k);
	}

	// Softmax over the remaining candidates (sorted, so the first one holds the maximum)
	let max = candidates[0].1;
	let mut probs: Vec<(TokenId, f32)> = candidates.into_iter().map(|(t, s)| (t, (s - max).exp())).collect();
	let sum: f32 = probs.iter().map(|p| p.1).sum();
	for p in probs.iter_mut() {
		p.1 /= sum;
	}

	// Nucleus: keep the smallest prefix whose cumulative probability reaches top_p (at least one token)
	if params.top_p < 1.0 {
		let mut cumulative = 0.0;
		let mut cutoff = probs.len();
		for (i, p) in probs.iter().enumerate() {
			cumulative += p.1;
			if cumulative >= params.top_p {
				cutoff = i + 1;
				break;
			}
		}
		probs.truncate(cutoff.max(1));
	}

	let weights = WeightedIndex::new(probs.iter().map(|p| p.1)).ok()?;
	Some(probs[weights.sample(rng)].0)
}

#[cfg(test)]
mod test {
	use rand::{rngs::StdRng, SeedableRng};
	use steer_mods::{Logits, TOKEN_FORBIDDEN};

	use super::{sample, SamplingParams};

	#[test]
	fn test_greedy() {
		let logits = Logits::new(vec![0.1, 3.0, 2.9]);
		let mut rng = StdRng::seed_from_u64(1);
		let params = SamplingParams::default().with_temperature(0.0);
		for _ in 0..10 {
			assert_eq!(sample(&logits, &params, &mut rng), Some(1));
		}
	}

	#[test]
	fn test_top_k_one_is_greedy() {
		let logits = Logits::new(vec![1.0, 0.5, 4.0, 3.9]);
		let mut rng = StdRng::seed_from_u64(7);
		let params = SamplingParams {
			temperature: 1.5,
			top_p: 1.0,
			top_k: 1,
		};
		for _ in 0..20 {
			assert_eq!(sample(&logits, &params, &mut rng), Some(2));
		}
	}

	#[test]
	fn test_forbidden_tokens_are_never_sampled() {
		let logits = Logits::new(vec![TOKEN_FORBIDDEN, 0.0, f32::NEG_INFINITY, 0.0]);
		let mut rng = StdRng::seed_from_u64(3);
		let params = SamplingParams {
			temperature: 1.0,
			top_p: 1.0,
			top_k: 0,
		};
		for _ in 0..200 {
			let t = sample(&logits, &params, &mut rng).unwrap();
			assert!(t == 1 || t == 3, "sampled {t}");
		}
	}

	#[test]
	fn test_draw_follows_probabilities() {
		let logits = Logits::new(vec![3.0f32.ln(), 0.0, TOKEN_FORBIDDEN]);
		let mut rng = StdRng::seed_from_u64(5);
		let params = SamplingParams {
			temperature: 1.0,
			top_p: 1.0,
			top_k: 0,
		};
		let mut counts = [0usize; 3];
		for _ in 0..4000 {
			counts[sample(&logits, &params, &mut rng).unwrap() as usize] += 1;
		}
		assert_eq!(counts[2], 0);
		let share = counts[0] as f32 / 4000.0;
		assert!((0.7..0.8).contains(&share), "share of most likely token {share}");
	}

	#[test]
	fn test_nucleus_keeps_at_least_one() {
		let logits = Logits::new(vec![10.0, 0.0, 0.0]);
		let mut rng = StdRng::seed_from_u64(11);
		let params = SamplingParams {
			temperature: 1.0,
			top_p: 0.01,
			top_k: 0,
		};
		assert_eq!(sample(&logits, &params, &mut rng), Some(0));
	}

	#[test]
	fn test_nothing_to_sample() {
		let logits = Logits::new(vec![f32::NEG_INFINITY; 3]);
		let mut rng = StdRng::seed_from_u64(0);
		assert_eq!(sample(&logits, &SamplingParams::default(), &mut rng), None);
		assert_eq!(sample(&Logits::default(), &SamplingParams::default().with_temperature(0.0), &mut rng), None);
	}
}
