//! Write-only reporting of what happened during a request. Nothing reported here ever feeds back into generation.

use std::{
	path::Path,
	time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use serde_json::{json, Value};
use steer_mods::{Action, ActionKind, Event, EventKind, ModCall, RequestId, TokenId};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::types::FinishReason;

/// Number of most likely tokens reported for every forward pass
pub const TOP_LOGPROBS: usize = 20;

fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[derive(Serialize, Debug, Clone)]
pub struct RequestStart {
	pub request_id: RequestId,
	pub task: String,
	pub prompt_tokens: usize,
	pub max_steps: usize,
	pub temperature: f32,
	pub created_at: u64,
}

impl RequestStart {
	pub(crate) fn created_now(mut self) -> RequestStart {
		self.created_at = now_ms();
		self
	}
}

#[derive(Serialize, Debug, Clone)]
pub struct EventRecord {
	pub request_id: RequestId,
	pub event: EventKind,
	pub step: usize,
	pub details: Value,
	pub created_at: u64,
}

impl EventRecord {
	/// Summarize an event. Logits are reduced to their most likely tokens and introspection data is left out.
	pub fn new(event: &Event) -> EventRecord {
		let details = match event {
			Event::Prefilled(e) => json!({
				"max_steps": e.max_steps,
				"prompt_length": e.context_info.as_ref().map(|c| c.prompt_length),
			}),
			Event::ForwardPass(e) => {
				let top: Vec<Value> = e
					.logits
					.top_k_logprobs(TOP_LOGPROBS)
					.into_iter()
					.map(|(token, logprob)| json!({ "token": token, "logprob": logprob }))
					.collect();
				json!({ "top_tokens": top })
			}
			Event::Sampled(e) => json!({ "sampled_token": e.sampled_token }),
			Event::Added(e) => json!({
				"added_tokens": e.added_tokens,
				"added_token_count": e.added_tokens.len(),
				"forced": e.forced,
			}),
		};

		EventRecord {
			request_id: event.request_id().to_string(),
			event: event.kind(),
			step: event.step(),
			details,
			created_at: now_ms(),
		}
	}
}

#[derive(Serialize, Debug, Clone)]
pub struct ActionRecord {
	pub kind: ActionKind,
	pub details: Value,
}

#[derive(Serialize, Debug, Clone)]
pub struct ModCallRecord {
	pub request_id: RequestId,
	pub mod_name: String,
	pub event: EventKind,
	pub step: usize,
	pub logs: Option<String>,
	pub fault: Option<String>,
	pub elapsed_us: u64,

	/// The validated action (absent for a `Noop`)
	pub action: Option<ActionRecord>,

	/// Set when the mod returned an action that is not permitted for the event
	pub illegal: Option<ActionKind>,
	pub created_at: u64,
}

impl ModCallRecord {
	pub fn new(request_id: &str, call: &ModCall, event: &Event) -> ModCallRecord {
		let action = match (&call.action, event) {
			(Action::Noop, _) => None,
			// Forced tokens requested after a commit are reported together with the tokens just added
			(Action::ForceTokens { tokens }, Event::Added(added)) => {
				let all: Vec<TokenId> = added.added_tokens.iter().chain(tokens.iter()).copied().collect();
				Some(ActionRecord {
					kind: ActionKind::ForceTokens,
					details: Action::ForceTokens { tokens: all }.details(),
				})
			}
			(action, _) => Some(ActionRecord {
				kind: action.kind(),
				details: action.details(),
			}),
		};

		ModCallRecord {
			request_id: request_id.to_string(),
			mod_name: call.mod_name.clone(),
			event: call.event,
			step: call.step,
			logs: call.logs.clone(),
			fault: call.fault.as_ref().map(|f| f.to_string()),
			elapsed_us: call.elapsed.as_micros() as u64,
			action,
			illegal: None,
			created_at: now_ms(),
		}
	}

	pub fn illegal(request_id: &str, mod_name: &str, event: &Event, action: ActionKind, logs: Option<String>) -> ModCallRecord {
		ModCallRecord {
			request_id: request_id.to_string(),
			mod_name: mod_name.to_string(),
			event: event.kind(),
			step: event.step(),
			logs,
			fault: None,
			elapsed_us: 0,
			action: None,
			illegal: Some(action),
			created_at: now_ms(),
		}
	}
}

#[derive(Serialize, Debug, Clone)]
pub struct RequestEnd {
	pub request_id: RequestId,
	pub finish_reason: Option<FinishReason>,
	pub output_ids: Vec<TokenId>,
	pub output_text: String,

	/// Fatal error that aborted the request
	pub error: Option<String>,
	pub steps_executed: usize,
	pub duration_ms: u64,
	pub completed_at: u64,
}

impl RequestEnd {
	pub(crate) fn completed_now(mut self) -> RequestEnd {
		self.completed_at = now_ms();
		self
	}
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestRecord {
	RequestStarted(RequestStart),
	Event(EventRecord),
	ModCall(ModCallRecord),
	RequestFinished(RequestEnd),
}

/// Sink for observability records. Implementations must not block the generation loop.
pub trait Ingest: Send {
	fn record(&mut self, record: IngestRecord);

	fn request_started(&mut self, record: RequestStart) {
		self.record(IngestRecord::RequestStarted(record))
	}

	fn event(&mut self, record: EventRecord) {
		self.record(IngestRecord::Event(record))
	}

	fn mod_call(&mut self, record: ModCallRecord) {
		self.record(IngestRecord::ModCall(record))
	}

	fn request_finished(&mut self, record: RequestEnd) {
		self.record(IngestRecord::RequestFinished(record))
	}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIngest;

impl Ingest for NullIngest {
	fn record(&mut self, _record: IngestRecord) {}
}

/// Keeps all records in memory
#[derive(Debug, Default, Clone)]
pub struct IngestAccumulator {
	records: Vec<IngestRecord>,
}

impl IngestAccumulator {
	pub fn new() -> IngestAccumulator {
		IngestAccumulator::default()
	}

	pub fn records(&self) -> &[IngestRecord] {
		&self.records
	}

	pub fn events(&self) -> impl Iterator<Item = &EventRecord> {
		self.records.iter().filter_map(|r| match r {
			IngestRecord::Event(e) => Some(e),
			_ => None,
		})
	}

	pub fn mod_calls(&self) -> impl Iterator<Item = &ModCallRecord> {
		self.records.iter().filter_map(|r| match r {
			IngestRecord::ModCall(c) => Some(c),
			_ => None,
		})
	}

	pub fn finished(&self) -> Option<&RequestEnd> {
		self.records.iter().rev().find_map(|r| match r {
			IngestRecord::RequestFinished(end) => Some(end),
			_ => None,
		})
	}

	pub fn to_json(&self) -> Value {
		json!({ "records": self.records })
	}

	/// Write all records collected so far to a JSON file
	pub async fn write_json(&self, path: &Path) -> Result<(), std::io::Error> {
		let data = serde_json::to_vec_pretty(&self.to_json())?;
		tokio::fs::write(path, data).await
	}
}

impl Ingest for IngestAccumulator {
	fn record(&mut self, record: IngestRecord) {
		self.records.push(record);
	}
}

/// Forwards records to a receiver over an unbounded channel. Records are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelIngest {
	sender: UnboundedSender<IngestRecord>,
}

impl ChannelIngest {
	pub fn new() -> (ChannelIngest, UnboundedReceiver<IngestRecord>) {
		let (sender, receiver) = unbounded_channel();
		(ChannelIngest { sender }, receiver)
	}
}

impl Ingest for ChannelIngest {
	fn record(&mut self, record: IngestRecord) {
		if self.sender.send(record).is_err() {
			tracing::trace!("ingest receiver closed, dropping record");
		}
	}
}
