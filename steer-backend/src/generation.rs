use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use serde_json::Value;
use steer_mods::{
	Action, Added, ContextInfo, Dispatch, DispatchError, Event, ForwardPass, ModCall, ModManager, Prefilled, RequestId, Sampled, TokenId,
	Tokenizer,
};
use uuid::Uuid;

use crate::{
	backend::{Backend, BackendError, Session},
	config::GenerationConfig,
	ingest::{EventRecord, Ingest, ModCallRecord, RequestEnd, RequestStart},
	queue::ForcedQueue,
	sampling::SamplingParams,
	stats::{EngineStats, GenerationStats},
	types::{FinishReason, GenerateError, GenerateRequest, GenerationResult, Prompt},
};

/// The point in a decode cycle at which a mod responded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Forward,
	Choose,
	Add,
}

impl Phase {
	/// Number of cached positions to drop for a `Backtrack { n }` returned in this phase
	pub fn rewind_amount(&self, n: usize) -> usize {
		match self {
			Phase::Forward => n.saturating_add(1),
			Phase::Choose => n,
			// The token committed in this cycle is already one of the n
			Phase::Add => n.saturating_sub(1),
		}
	}
}

/// Everything the loop knows about one request. Owned by a single call to [Generator::generate].
struct RequestState {
	request_id: RequestId,
	step: usize,
	max_steps: usize,
	prompt: Vec<TokenId>,

	/// Committed completion tokens (excluding the prompt)
	sequence: Vec<TokenId>,
	forced: ForcedQueue,
	skip_progress: bool,
	sampling: SamplingParams,
	steps_executed: usize,
	stats: GenerationStats,
}

impl RequestState {
	fn new(request_id: RequestId, prompt: Vec<TokenId>, config: &GenerationConfig) -> RequestState {
		RequestState {
			request_id,
			step: 0,
			max_steps: config.max_tokens,
			prompt,
			sequence: vec![],
			forced: ForcedQueue::new(),
			skip_progress: false,
			sampling: config.sampling(),
			steps_executed: 0,
			stats: GenerationStats::default(),
		}
	}

	fn advance(&mut self) {
		if self.skip_progress {
			self.skip_progress = false;
			tracing::trace!(request_id = %self.request_id, step = self.step, "step not advanced");
		} else {
			self.step += 1;
		}
	}
}

/// How a request ended, before the result is assembled
struct Finish {
	reason: FinishReason,

	/// The terminal action and the mod that returned it
	terminal: Option<(String, Action)>,
}

impl Finish {
	fn natural(reason: FinishReason) -> Finish {
		Finish { reason, terminal: None }
	}

	fn terminal(call: &ModCall) -> Finish {
		let reason = match call.action {
			Action::ForceOutput { .. } => FinishReason::ForceOutput,
			Action::ToolCalls { .. } => FinishReason::ToolCalls,
			_ => FinishReason::EmitError,
		};
		tracing::debug!(mod_name = %call.mod_name, event = %call.event, step = call.step, %reason, "terminal action");
		Finish {
			reason,
			terminal: Some((call.mod_name.clone(), call.action.clone())),
		}
	}
}

fn tool_call_text(request_id: &str, payload: &Value) -> String {
	let body = match payload {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	};
	format!("<tool_call_{request_id}>{body}</tool_call_{request_id}>")
}

/// Drives requests from prefill to termination, interleaving backend calls with mod dispatches
pub struct Generator {
	name: String,
	backend: Arc<dyn Backend>,
	mods: Arc<ModManager>,
	config: GenerationConfig,
	stats: Option<Arc<EngineStats>>,
}

impl Generator {
	pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>, mods: Arc<ModManager>, config: GenerationConfig) -> Generator {
		Generator {
			name: name.into(),
			backend,
			mods,
			config,
			stats: None,
		}
	}

	pub fn with_stats(mut self, stats: Arc<EngineStats>) -> Generator {
		self.stats = Some(stats);
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn config(&self) -> &GenerationConfig {
		&self.config
	}

	pub fn backend(&self) -> &Arc<dyn Backend> {
		&self.backend
	}

	/// Run one request to completion. Terminal actions (including `EmitError`) produce a result; contract violations
	/// and backend faults abort the request with an error. The backend session is released in every case.
	pub async fn generate(&self, request: GenerateRequest, ingest: &mut dyn Ingest) -> Result<GenerationResult, GenerateError> {
		let started = Instant::now();
		let request_id = request.request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
		let tokenizer = self.backend.tokenizer();
		let prompt = match request.prompt {
			Prompt::Text(text) => tokenizer.encode(&text),
			Prompt::Tokens(tokens) => tokens,
		};

		tracing::info!(task = %self.name, model = self.backend.name(), request_id = %request_id, prompt_tokens = prompt.len(), "request started");
		ingest.request_started(RequestStart {
			request_id: request_id.clone(),
			task: self.name.clone(),
			prompt_tokens: prompt.len(),
			max_steps: self.config.max_tokens,
			temperature: self.config.temperature,
			created_at: 0,
		}
		.created_now());

		let mut state = RequestState::new(request_id, prompt, &self.config);
		let outcome = match self.backend.start_session(&state.request_id).await {
			Ok(mut session) => {
				let outcome = self.run(&mut state, session.as_mut(), tokenizer.as_ref(), ingest).await;
				if let Err(e) = session.shutdown().await {
					tracing::warn!(request_id = %state.request_id, "could not release session: {e}");
				}
				outcome
			}
			Err(e) => Err(GenerateError::Backend(e)),
		};

		self.finalize(state, outcome, started.elapsed(), tokenizer.as_ref(), ingest)
	}

	fn finalize(
		&self,
		state: RequestState,
		outcome: Result<Finish, GenerateError>,
		duration: Duration,
		tokenizer: &dyn Tokenizer,
		ingest: &mut dyn Ingest,
	) -> Result<GenerationResult, GenerateError> {
		let finish = match outcome {
			Ok(finish) => finish,
			Err(e) => {
				tracing::error!(task = %self.name, request_id = %state.request_id, step = state.step, "request aborted: {e}");
				ingest.request_finished(
					RequestEnd {
						request_id: state.request_id.clone(),
						finish_reason: None,
						output_text: tokenizer.decode(&state.sequence),
						output_ids: state.sequence,
						error: Some(e.to_string()),
						steps_executed: state.steps_executed,
						duration_ms: duration.as_millis() as u64,
						completed_at: 0,
					}
					.completed_now(),
				);
				if let Some(stats) = &self.stats {
					stats.add(&self.name, &state.stats, true);
				}
				return Err(e);
			}
		};

		let mut output_ids = state.sequence;
		let mut terminated_by = None;
		let mut tool_calls = None;
		let mut error = None;
		if let Some((mod_name, action)) = finish.terminal {
			match action {
				Action::ForceOutput { tokens } => output_ids = tokens,
				Action::ToolCalls { payload } => {
					output_ids = tokenizer.encode(&tool_call_text(&state.request_id, &payload));
					tool_calls = Some(payload);
				}
				Action::EmitError { message } => error = Some(message),
				_ => {}
			}
			terminated_by = Some(mod_name);
		}

		if let Some(eos) = tokenizer.eos_token_id() {
			output_ids.retain(|t| *t != eos);
		}
		let output_text = tokenizer.decode(&output_ids);

		tracing::info!(
			task = %self.name,
			request_id = %state.request_id,
			finish_reason = %finish.reason,
			steps = state.steps_executed,
			output_tokens = output_ids.len(),
			forced_tokens = state.stats.forced_tokens,
			backtracks = state.stats.backtracks,
			?duration,
			"request finished"
		);
		tracing::debug!(request_id = %state.request_id, "output: {output_text}");

		ingest.request_finished(
			RequestEnd {
				request_id: state.request_id.clone(),
				finish_reason: Some(finish.reason),
				output_ids: output_ids.clone(),
				output_text: output_text.clone(),
				error: error.clone(),
				steps_executed: state.steps_executed,
				duration_ms: duration.as_millis() as u64,
				completed_at: 0,
			}
			.completed_now(),
		);
		if let Some(stats) = &self.stats {
			stats.add(&self.name, &state.stats, false);
		}

		Ok(GenerationResult {
			request_id: state.request_id,
			output_ids,
			output_text,
			finish_reason: finish.reason,
			terminated_by,
			tool_calls,
			error,
			steps_executed: state.steps_executed,
			stats: state.stats,
			duration,
		})
	}

	async fn run(&self, state: &mut RequestState, session: &mut dyn Session, tokenizer: &dyn Tokenizer, ingest: &mut dyn Ingest) -> Result<Finish, GenerateError> {
		if let Some(finish) = self.prefill(state, session, tokenizer, ingest).await? {
			return Ok(finish);
		}

		let eos = tokenizer.eos_token_id();
		loop {
			if state.step >= state.max_steps {
				tracing::debug!(request_id = %state.request_id, step = state.step, "step limit reached");
				return Ok(Finish::natural(FinishReason::MaxSteps));
			}

			// Forward pass
			let start = Instant::now();
			let output = match session.forward_pass().await {
				Ok(output) => output,
				Err(BackendError::ContextFull { context_size }) => {
					tracing::warn!(request_id = %state.request_id, context_size, "ending generation because context is full");
					return Ok(Finish::natural(FinishReason::ContextFull));
				}
				Err(e) => return Err(e.into()),
			};
			state.stats.forward_passes += 1;
			state.stats.forward_duration += start.elapsed();

			let event = Event::ForwardPass(ForwardPass {
				request_id: state.request_id.clone(),
				step: state.step,
				logits: output.logits,
				introspection: output.introspection,
			});
			let dispatch = self.dispatch(state, &event, tokenizer, ingest)?;
			if let Some(call) = dispatch.terminal() {
				return Ok(Finish::terminal(call));
			}

			let mut logits = event.into_logits().unwrap_or_default();
			let mut temperature = None;
			let mut backtrack = None;
			for call in &dispatch.calls {
				match &call.action {
					Action::AdjustedLogits { logits: adjusted, token_temp } => {
						logits = adjusted.clone();
						if token_temp.is_some() {
							temperature = *token_temp;
						}
					}
					Action::ForceTokens { tokens } => state.forced.push(&call.mod_name, tokens),
					Action::Backtrack { n, tokens } => {
						backtrack = Some((call, *n, tokens));
						break;
					}
					_ => {}
				}
			}
			if let Some((call, n, tokens)) = backtrack {
				self.backtrack(state, session, Phase::Forward, &call.mod_name, n, tokens.as_deref()).await?;
				state.advance();
				continue;
			}

			// Choose: forced tokens take precedence over sampling
			let (token, forced) = match state.forced.pop() {
				Some(forced) => {
					tracing::trace!(request_id = %state.request_id, step = state.step, token = forced.token, source = %forced.source, "injecting forced token");
					(forced.token, true)
				}
				None => {
					let params = match temperature {
						Some(t) => state.sampling.with_temperature(t),
						None => state.sampling,
					};
					let token = session.sample(&logits, &params).await?;
					tracing::trace!(request_id = %state.request_id, step = state.step, token, "sampled");

					let event = Event::Sampled(Sampled {
						request_id: state.request_id.clone(),
						step: state.step,
						sampled_token: token,
					});
					let dispatch = self.dispatch(state, &event, tokenizer, ingest)?;
					if let Some(call) = dispatch.terminal() {
						return Ok(Finish::terminal(call));
					}

					let mut backtracked = false;
					for call in &dispatch.calls {
						match &call.action {
							Action::ForceTokens { tokens } => state.forced.push(&call.mod_name, tokens),
							Action::Backtrack { n, tokens } => {
								self.backtrack(state, session, Phase::Choose, &call.mod_name, *n, tokens.as_deref()).await?;
								backtracked = true;
								break;
							}
							_ => {}
						}
					}
					if backtracked {
						state.advance();
						continue;
					}

					state.stats.sampled_tokens += 1;
					(token, false)
				}
			};

			// Add
			session.commit(&[token], forced).await?;
			state.sequence.push(token);
			state.steps_executed += 1;
			state.stats.generated_tokens += 1;
			if forced {
				state.stats.forced_tokens += 1;
			}

			let event = Event::Added(Added {
				request_id: state.request_id.clone(),
				step: state.step,
				added_tokens: vec![token],
				forced,
			});
			let dispatch = self.dispatch(state, &event, tokenizer, ingest)?;
			if let Some(call) = dispatch.terminal() {
				return Ok(Finish::terminal(call));
			}

			let mut rewound = 0;
			for call in &dispatch.calls {
				match &call.action {
					Action::ForceTokens { tokens } => state.forced.push(&call.mod_name, tokens),
					Action::Backtrack { n, tokens } => {
						rewound = self.backtrack(state, session, Phase::Add, &call.mod_name, *n, tokens.as_deref()).await?;
						break;
					}
					_ => {}
				}
			}

			if rewound == 0 {
				if let Some(reason) = self.stop_reason(state, token, eos, tokenizer) {
					return Ok(Finish::natural(reason));
				}
			}
			state.advance();
		}
	}

	/// Prefill the session and let mods respond. Returns the finish when a mod ended the request right away.
	async fn prefill(
		&self,
		state: &mut RequestState,
		session: &mut dyn Session,
		tokenizer: &dyn Tokenizer,
		ingest: &mut dyn Ingest,
	) -> Result<Option<Finish>, GenerateError> {
		let prompt_length = self.prefill_session(state, session).await?;
		let event = self.prefilled_event(state, prompt_length);
		let dispatch = self.dispatch(state, &event, tokenizer, ingest)?;
		if let Some(call) = dispatch.terminal() {
			return Ok(Some(Finish::terminal(call)));
		}

		for call in &dispatch.calls {
			match &call.action {
				Action::ForceTokens { tokens } => state.forced.push(&call.mod_name, tokens),
				Action::AdjustedPrefill { tokens, max_steps } => {
					tracing::debug!(
						request_id = %state.request_id,
						mod_name = %call.mod_name,
						prompt_tokens = tokens.len(),
						?max_steps,
						"prefilling adjusted prompt"
					);
					state.prompt = tokens.clone();
					if let Some(max_steps) = max_steps {
						state.max_steps = *max_steps;
					}
					let prompt_length = self.prefill_session(state, session).await?;
					ingest.event(EventRecord::new(&self.prefilled_event(state, prompt_length)));
					break;
				}
				_ => {}
			}
		}
		Ok(None)
	}

	async fn prefill_session(&self, state: &mut RequestState, session: &mut dyn Session) -> Result<usize, GenerateError> {
		let start = Instant::now();
		let output = session.prefill(&state.prompt, state.max_steps).await?;
		state.stats.prompt_tokens = state.prompt.len();
		state.stats.prefill_duration += start.elapsed();
		Ok(output.prompt_length)
	}

	fn prefilled_event(&self, state: &RequestState, prompt_length: usize) -> Event {
		Event::Prefilled(Prefilled {
			request_id: state.request_id.clone(),
			step: state.step,
			max_steps: state.max_steps,
			context_info: Some(ContextInfo { prompt_length }),
		})
	}

	/// Rewind the backend and the committed sequence, then queue replacement tokens. Returns the number of positions
	/// that were dropped.
	async fn backtrack(
		&self,
		state: &mut RequestState,
		session: &mut dyn Session,
		phase: Phase,
		mod_name: &str,
		n: usize,
		tokens: Option<&[TokenId]>,
	) -> Result<usize, GenerateError> {
		let amount = phase.rewind_amount(n);
		tracing::debug!(request_id = %state.request_id, step = state.step, mod_name, ?phase, n, amount, "backtrack");
		if amount > 0 {
			session.rewind(amount).await?;
			let keep = state.sequence.len().saturating_sub(amount);
			state.sequence.truncate(keep);
		}
		state.stats.backtracks += 1;
		state.stats.rewound_tokens += amount;

		match tokens {
			Some(tokens) if !tokens.is_empty() => state.forced.push(mod_name, tokens),
			Some(_) if n > 0 => state.skip_progress = true,
			_ => {}
		}
		Ok(amount)
	}

	fn stop_reason(&self, state: &RequestState, token: TokenId, eos: Option<TokenId>, tokenizer: &dyn Tokenizer) -> Option<FinishReason> {
		if Some(token) == eos {
			return Some(FinishReason::EndOfSequence);
		}
		if self.config.stop_tokens.contains(&token) {
			tracing::debug!(request_id = %state.request_id, token, "stop token");
			return Some(FinishReason::StopToken);
		}
		if let Some(longest) = self.config.stop_sequences.iter().map(|s| s.chars().count()).max() {
			// A stop sequence completed by this token starts at most one token per character earlier
			let text = tokenizer.decode_last(&state.sequence, longest + 1);
			if let Some(sequence) = self.config.stop_sequences.iter().find(|s| !s.is_empty() && text.contains(s.as_str())) {
				tracing::debug!(request_id = %state.request_id, ?sequence, "stop sequence");
				return Some(FinishReason::StopSequence);
			}
		}
		None
	}

	/// Report the event, hand it to the mods and report every mod call
	fn dispatch(&self, state: &mut RequestState, event: &Event, tokenizer: &dyn Tokenizer, ingest: &mut dyn Ingest) -> Result<Dispatch, GenerateError> {
		ingest.event(EventRecord::new(event));

		let start = Instant::now();
		let result = self.mods.dispatch(event, tokenizer, &state.sequence);
		state.stats.dispatches += 1;
		state.stats.dispatch_duration += start.elapsed();

		match result {
			Ok(dispatch) => {
				for call in &dispatch.calls {
					ingest.mod_call(ModCallRecord::new(&state.request_id, call, event));
				}
				Ok(dispatch)
			}
			Err(err) => {
				match &err {
					DispatchError::IllegalAction {
						mod_name,
						action,
						logs,
						calls,
						..
					} => {
						for call in calls {
							ingest.mod_call(ModCallRecord::new(&state.request_id, call, event));
						}
						ingest.mod_call(ModCallRecord::illegal(&state.request_id, mod_name, event, *action, logs.clone()));
					}
				}
				Err(err.into())
			}
		}
	}
}

#[cfg(test)]
mod test {
	use serde_json::json;

	use super::{tool_call_text, Phase};

	#[test]
	fn test_rewind_amounts() {
		assert_eq!(Phase::Forward.rewind_amount(0), 1);
		assert_eq!(Phase::Forward.rewind_amount(2), 3);
		assert_eq!(Phase::Choose.rewind_amount(0), 0);
		assert_eq!(Phase::Choose.rewind_amount(2), 2);
		assert_eq!(Phase::Add.rewind_amount(0), 0);
		assert_eq!(Phase::Add.rewind_amount(1), 0);
		assert_eq!(Phase::Add.rewind_amount(3), 2);
		assert_eq!(Phase::Forward.rewind_amount(usize::MAX), usize::MAX);
	}

	#[test]
	fn test_tool_call_text() {
		assert_eq!(
			tool_call_text("r1", &json!({"name": "search"})),
			"<tool_call_r1>{\"name\":\"search\"}</tool_call_r1>"
		);
		assert_eq!(tool_call_text("r2", &json!("raw")), "<tool_call_r2>raw</tool_call_r2>");
	}
}
