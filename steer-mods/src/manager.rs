use std::{
	fmt::{Debug, Write},
	panic::{catch_unwind, AssertUnwindSafe},
	time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
	action::{is_legal, Action, ActionKind},
	event::{Event, EventKind, TokenId},
	tokenizer::Tokenizer,
};

/// A runtime failure inside a mod. It is isolated to the mod that raised it: dispatch treats the mod as having
/// returned [Action::Noop] and continues with the next one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ModFault(pub String);

impl From<&str> for ModFault {
	fn from(value: &str) -> Self {
		ModFault(value.to_string())
	}
}

impl From<String> for ModFault {
	fn from(value: String) -> Self {
		ModFault(value)
	}
}

/// What a mod gets to see besides the event: a read-only tokenizer, the request's committed completion and a buffer
/// for diagnostic output
pub struct ModContext<'a> {
	tokenizer: &'a dyn Tokenizer,
	sequence: &'a [TokenId],
	logs: String,
}

impl<'a> ModContext<'a> {
	pub fn new(tokenizer: &'a dyn Tokenizer, sequence: &'a [TokenId]) -> ModContext<'a> {
		ModContext {
			tokenizer,
			sequence,
			logs: String::new(),
		}
	}

	pub fn tokenizer(&self) -> &dyn Tokenizer {
		self.tokenizer
	}

	/// Completion tokens committed so far (prompt excluded). For an `Added` event this includes the added tokens.
	pub fn sequence(&self) -> &[TokenId] {
		self.sequence
	}

	/// Record a line of diagnostic output. It is attached to the call record and never affects generation.
	pub fn log(&mut self, message: impl std::fmt::Display) {
		let _ = writeln!(self.logs, "{message}");
	}

	fn take_logs(&mut self) -> Option<String> {
		if self.logs.is_empty() {
			None
		} else {
			Some(std::mem::take(&mut self.logs))
		}
	}
}

/// A user-supplied interception callback. Returning `Ok(None)` is the same as returning `Ok(Some(Action::Noop))`.
pub trait Mod: Send + Sync {
	fn handle(&self, event: &Event, ctx: &mut ModContext<'_>) -> Result<Option<Action>, ModFault>;
}

impl<F> Mod for F
where
	F: Fn(&Event, &mut ModContext<'_>) -> Result<Option<Action>, ModFault> + Send + Sync,
{
	fn handle(&self, event: &Event, ctx: &mut ModContext<'_>) -> Result<Option<Action>, ModFault> {
		self(event, ctx)
	}
}

/// Wraps a closure so that its signature is inferred as a [Mod]
pub fn mod_fn<F>(f: F) -> F
where
	F: Fn(&Event, &mut ModContext<'_>) -> Result<Option<Action>, ModFault> + Send + Sync,
{
	f
}

/// The record of one mod invocation during a dispatch
#[derive(Debug, Clone)]
pub struct ModCall {
	pub mod_name: String,
	pub event: EventKind,
	pub step: usize,
	pub action: Action,
	pub logs: Option<String>,
	pub fault: Option<ModFault>,
	pub elapsed: Duration,
}

/// The validated, ordered outcome of dispatching one event
#[derive(Debug, Clone, Default)]
pub struct Dispatch {
	pub calls: Vec<ModCall>,
}

impl Dispatch {
	pub fn actions(&self) -> impl Iterator<Item = &Action> {
		self.calls.iter().map(|c| &c.action)
	}

	/// The terminal action of this dispatch, if any (it is always the last one)
	pub fn terminal(&self) -> Option<&ModCall> {
		self.calls.last().filter(|c| c.action.is_terminal())
	}
}

#[derive(Error, Debug)]
pub enum DispatchError {
	#[error("mod '{mod_name}' returned {action}, which is not permitted for event {event} (step {step})")]
	IllegalAction {
		mod_name: String,
		event: EventKind,
		action: ActionKind,
		step: usize,
		logs: Option<String>,

		/// Calls that completed before the offending one
		calls: Vec<ModCall>,
	},
}

struct RegisteredMod {
	name: String,
	handler: Box<dyn Mod>,
}

/// Ordered registry of mods. Registration order is the order in which mods see every event.
#[derive(Default)]
pub struct ModManager {
	mods: Vec<RegisteredMod>,
	time_budget: Option<Duration>,
}

impl Debug for ModManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ModManager")
			.field("mods", &self.names().collect::<Vec<_>>())
			.field("time_budget", &self.time_budget)
			.finish()
	}
}

impl ModManager {
	pub fn new() -> ModManager {
		ModManager::default()
	}

	/// Mods taking longer than this are reported as slow. They are never interrupted.
	pub fn with_time_budget(mut self, budget: Duration) -> ModManager {
		self.time_budget = Some(budget);
		self
	}

	pub fn register(&mut self, name: impl Into<String>, handler: impl Mod + 'static) {
		let name = name.into();
		tracing::debug!(mod_name = %name, position = self.mods.len(), "registering mod");
		self.mods.push(RegisteredMod {
			name,
			handler: Box::new(handler),
		});
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.mods.iter().map(|m| m.name.as_str())
	}

	pub fn len(&self) -> usize {
		self.mods.len()
	}

	pub fn is_empty(&self) -> bool {
		self.mods.is_empty()
	}

	/// Hand the event to every mod in registration order and validate the responses. Dispatch stops after the first
	/// terminal action. An action that is not permitted for the event fails the whole dispatch.
	pub fn dispatch(&self, event: &Event, tokenizer: &dyn Tokenizer, sequence: &[TokenId]) -> Result<Dispatch, DispatchError> {
		let kind = event.kind();
		let step = event.step();
		let mut calls: Vec<ModCall> = Vec::with_capacity(self.mods.len());

		for registered in &self.mods {
			let mut ctx = ModContext::new(tokenizer, sequence);
			let start = Instant::now();
			let result = catch_unwind(AssertUnwindSafe(|| registered.handler.handle(event, &mut ctx)));
			let elapsed = start.elapsed();
			let logs = ctx.take_logs();

			if let Some(budget) = self.time_budget {
				if elapsed > budget {
					tracing::warn!(mod_name = %registered.name, event = %kind, step, ?elapsed, ?budget, "mod exceeded its time budget");
				}
			}

			let (action, fault) = match result {
				Ok(Ok(action)) => (action.unwrap_or_default(), None),
				Ok(Err(fault)) => {
					tracing::warn!(mod_name = %registered.name, event = %kind, step, "mod raised a fault: {fault}");
					(Action::Noop, Some(fault))
				}
				Err(panic) => {
					let message = panic
						.downcast_ref::<&str>()
						.map(|s| s.to_string())
						.or_else(|| panic.downcast_ref::<String>().cloned())
						.unwrap_or_else(|| String::from("mod panicked"));
					tracing::warn!(mod_name = %registered.name, event = %kind, step, "mod panicked: {message}");
					(Action::Noop, Some(ModFault(message)))
				}
			};

			if !is_legal(kind, action.kind()) {
				tracing::error!(mod_name = %registered.name, event = %kind, step, action = %action.kind(), "illegal action");
				return Err(DispatchError::IllegalAction {
					mod_name: registered.name.clone(),
					event: kind,
					action: action.kind(),
					step,
					logs,
					calls,
				});
			}

			if !action.is_noop() {
				tracing::debug!(mod_name = %registered.name, event = %kind, step, action = %action.kind(), "mod responded");
			}

			let terminal = action.is_terminal();
			calls.push(ModCall {
				mod_name: registered.name.clone(),
				event: kind,
				step,
				action,
				logs,
				fault,
				elapsed,
			});

			if terminal {
				break;
			}
		}

		Ok(Dispatch { calls })
	}
}
