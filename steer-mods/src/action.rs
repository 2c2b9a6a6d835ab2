use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::event::{Event, EventKind, Logits, TokenId};

/// A mod's response to an event
#[derive(Clone, Debug, Default)]
pub enum Action {
	#[default]
	Noop,

	/// Replace the prompt (and optionally the step limit) and prefill again
	AdjustedPrefill { tokens: Vec<TokenId>, max_steps: Option<usize> },

	/// Queue tokens that must be injected before anything is sampled again
	ForceTokens { tokens: Vec<TokenId> },

	/// Replace the logits used for sampling, optionally with a temperature for this token only
	AdjustedLogits { logits: Logits, token_temp: Option<f32> },

	/// Retract `n` positions and optionally queue replacement tokens. `Some(vec![])` differs from `None`: it marks
	/// the step as not making progress.
	Backtrack { n: usize, tokens: Option<Vec<TokenId>> },

	/// End the request with exactly these output tokens
	ForceOutput { tokens: Vec<TokenId> },

	/// End the request with a tool call payload
	ToolCalls { payload: Value },

	/// End the request with an error authored by the mod
	EmitError { message: String },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
	Noop,
	AdjustedPrefill,
	ForceTokens,
	AdjustedLogits,
	Backtrack,
	ForceOutput,
	ToolCalls,
	EmitError,
}

impl ActionKind {
	pub const ALL: [ActionKind; 8] = [
		ActionKind::Noop,
		ActionKind::AdjustedPrefill,
		ActionKind::ForceTokens,
		ActionKind::AdjustedLogits,
		ActionKind::Backtrack,
		ActionKind::ForceOutput,
		ActionKind::ToolCalls,
		ActionKind::EmitError,
	];

	/// Terminal actions end dispatch for the event and end the request
	pub fn is_terminal(&self) -> bool {
		matches!(self, ActionKind::ForceOutput | ActionKind::ToolCalls | ActionKind::EmitError)
	}
}

impl Display for ActionKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			ActionKind::Noop => "Noop",
			ActionKind::AdjustedPrefill => "AdjustedPrefill",
			ActionKind::ForceTokens => "ForceTokens",
			ActionKind::AdjustedLogits => "AdjustedLogits",
			ActionKind::Backtrack => "Backtrack",
			ActionKind::ForceOutput => "ForceOutput",
			ActionKind::ToolCalls => "ToolCalls",
			ActionKind::EmitError => "EmitError",
		};
		f.write_str(name)
	}
}

/// Whether `action` is an acceptable response to an event of kind `event`.
///
/// `ForceTokens` is accepted on `Prefilled` so that mods can seed the forced queue before the first step.
pub fn is_legal(event: EventKind, action: ActionKind) -> bool {
	use ActionKind::*;
	match event {
		EventKind::Prefilled => matches!(action, Noop | AdjustedPrefill | ForceTokens | ForceOutput | ToolCalls | EmitError),
		EventKind::ForwardPass => matches!(
			action,
			Noop | ForceTokens | Backtrack | AdjustedLogits | ForceOutput | ToolCalls | EmitError
		),
		EventKind::Sampled | EventKind::Added => matches!(action, Noop | ForceTokens | Backtrack | ForceOutput | ToolCalls | EmitError),
	}
}

impl EventKind {
	pub fn allowed_actions(&self) -> Vec<ActionKind> {
		ActionKind::ALL.into_iter().filter(|a| is_legal(*self, *a)).collect()
	}
}

/// Number of token ids shown in previews of an action
const TOKEN_PREVIEW: usize = 10;

impl Action {
	pub fn kind(&self) -> ActionKind {
		match self {
			Action::Noop => ActionKind::Noop,
			Action::AdjustedPrefill { .. } => ActionKind::AdjustedPrefill,
			Action::ForceTokens { .. } => ActionKind::ForceTokens,
			Action::AdjustedLogits { .. } => ActionKind::AdjustedLogits,
			Action::Backtrack { .. } => ActionKind::Backtrack,
			Action::ForceOutput { .. } => ActionKind::ForceOutput,
			Action::ToolCalls { .. } => ActionKind::ToolCalls,
			Action::EmitError { .. } => ActionKind::EmitError,
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.kind().is_terminal()
	}

	pub fn is_noop(&self) -> bool {
		matches!(self, Action::Noop)
	}

	/// A compact, serializable description of the action for observability. Logits are summarized by their length
	/// only.
	pub fn details(&self) -> Value {
		fn preview(tokens: &[TokenId]) -> Value {
			json!({
				"tokens_preview": &tokens[..tokens.len().min(TOKEN_PREVIEW)],
				"token_count": tokens.len(),
			})
		}

		match self {
			Action::Noop => Value::Null,
			Action::AdjustedPrefill { tokens, max_steps } => json!({
				"token_count": tokens.len(),
				"adjusted_max_steps": max_steps,
			}),
			Action::ForceTokens { tokens } | Action::ForceOutput { tokens } => preview(tokens),
			Action::AdjustedLogits { logits, token_temp } => json!({
				"logits_len": logits.len(),
				"temperature": token_temp,
			}),
			Action::Backtrack { n, tokens } => {
				let mut details = json!({ "backtrack_steps": n });
				if let Some(tokens) = tokens {
					details["tokens"] = preview(tokens);
				}
				details
			}
			Action::ToolCalls { payload } => json!({ "tool_calls": payload }),
			Action::EmitError { message } => json!({ "error_message": message }),
		}
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("action '{action}' not permitted for event type {event}")]
pub struct InvalidAction {
	pub action: ActionKind,
	pub event: EventKind,
}

/// Event-scoped action constructors for mod authors. Helpers that are not permitted for the bound event return
/// [InvalidAction] instead of producing an action that dispatch would later reject.
pub struct Actions<'e> {
	event: &'e Event,
}

impl<'e> Actions<'e> {
	pub fn for_event(event: &'e Event) -> Actions<'e> {
		Actions { event }
	}

	fn require(&self, action: ActionKind) -> Result<(), InvalidAction> {
		let event = self.event.kind();
		if is_legal(event, action) {
			Ok(())
		} else {
			Err(InvalidAction { action, event })
		}
	}

	pub fn noop(&self) -> Action {
		Action::Noop
	}

	pub fn force_output(&self, tokens: impl IntoIterator<Item = TokenId>) -> Result<Action, InvalidAction> {
		self.require(ActionKind::ForceOutput)?;
		Ok(Action::ForceOutput {
			tokens: tokens.into_iter().collect(),
		})
	}

	pub fn tool_calls(&self, payload: Value) -> Result<Action, InvalidAction> {
		self.require(ActionKind::ToolCalls)?;
		Ok(Action::ToolCalls { payload })
	}

	pub fn emit_error(&self, message: impl Into<String>) -> Action {
		Action::EmitError { message: message.into() }
	}

	pub fn adjust_prefill(&self, tokens: impl IntoIterator<Item = TokenId>, max_steps: Option<usize>) -> Result<Action, InvalidAction> {
		self.require(ActionKind::AdjustedPrefill)?;
		Ok(Action::AdjustedPrefill {
			tokens: tokens.into_iter().collect(),
			max_steps,
		})
	}

	/// Adjust the logits of a forward pass. When `logits` is `None`, the logits of the event are used (useful to
	/// only change the temperature).
	pub fn adjust_logits(&self, logits: Option<Logits>, token_temp: Option<f32>) -> Result<Action, InvalidAction> {
		self.require(ActionKind::AdjustedLogits)?;
		let logits = match logits {
			Some(l) => l,
			None => self.event.logits().cloned().ok_or(InvalidAction {
				action: ActionKind::AdjustedLogits,
				event: self.event.kind(),
			})?,
		};
		Ok(Action::AdjustedLogits { logits, token_temp })
	}

	pub fn force_tokens(&self, tokens: impl IntoIterator<Item = TokenId>) -> Result<Action, InvalidAction> {
		self.require(ActionKind::ForceTokens)?;
		Ok(Action::ForceTokens {
			tokens: tokens.into_iter().collect(),
		})
	}

	pub fn backtrack(&self, steps: usize, tokens: Option<Vec<TokenId>>) -> Result<Action, InvalidAction> {
		self.require(ActionKind::Backtrack)?;
		Ok(Action::Backtrack { n: steps, tokens })
	}
}
