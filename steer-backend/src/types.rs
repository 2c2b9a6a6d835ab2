use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use steer_mods::{DispatchError, RequestId, TokenId};
use thiserror::Error;

use crate::{backend::BackendError, stats::GenerationStats};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
	Text(String),
	Tokens(Vec<TokenId>),
}

#[derive(Deserialize, Clone, Debug)]
pub struct GenerateRequest {
	/// Identifier for the request. A random one is generated when absent.
	#[serde(default)]
	pub request_id: Option<RequestId>,

	pub prompt: Prompt,
}

impl GenerateRequest {
	pub fn text(prompt: impl Into<String>) -> GenerateRequest {
		GenerateRequest {
			request_id: None,
			prompt: Prompt::Text(prompt.into()),
		}
	}

	pub fn tokens(prompt: Vec<TokenId>) -> GenerateRequest {
		GenerateRequest {
			request_id: None,
			prompt: Prompt::Tokens(prompt),
		}
	}

	pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> GenerateRequest {
		self.request_id = Some(request_id.into());
		self
	}
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	EndOfSequence,
	StopToken,
	StopSequence,
	MaxSteps,
	ContextFull,
	ForceOutput,
	ToolCalls,
	EmitError,
}

impl Display for FinishReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			FinishReason::EndOfSequence => "end_of_sequence",
			FinishReason::StopToken => "stop_token",
			FinishReason::StopSequence => "stop_sequence",
			FinishReason::MaxSteps => "max_steps",
			FinishReason::ContextFull => "context_full",
			FinishReason::ForceOutput => "force_output",
			FinishReason::ToolCalls => "tool_calls",
			FinishReason::EmitError => "emit_error",
		};
		f.write_str(name)
	}
}

#[derive(Serialize, Clone, Debug)]
pub struct GenerationResult {
	pub request_id: RequestId,
	pub output_ids: Vec<TokenId>,
	pub output_text: String,
	pub finish_reason: FinishReason,

	/// Name of the mod whose terminal action ended the request
	pub terminated_by: Option<String>,

	/// Payload of a `ToolCalls` action
	pub tool_calls: Option<Value>,

	/// Message of an `EmitError` action
	pub error: Option<String>,

	/// Number of tokens committed while generating
	pub steps_executed: usize,
	pub stats: GenerationStats,
	pub duration: Duration,
}

/// A fatal, request-scoped failure. Distinct from an `EmitError` returned by a mod, which ends a request
/// successfully.
#[derive(Error, Debug)]
pub enum GenerateError {
	#[error("contract violation: {0}")]
	ContractViolation(#[from] DispatchError),

	#[error("backend error: {0}")]
	Backend(#[from] BackendError),
}
