use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc, Mutex,
};

use serde_json::json;
use steer_mods::{
	is_legal, mod_fn, Action, ActionKind, Added, DispatchError, Event, EventKind, ForwardPass, Logits, ModFault, ModManager, Prefilled, Sampled,
	Tokenizer, Vocabulary,
};
use tracing_test::traced_test;

fn event(kind: EventKind) -> Event {
	let request_id = String::from("req-1");
	match kind {
		EventKind::Prefilled => Event::Prefilled(Prefilled {
			request_id,
			step: 0,
			max_steps: 16,
			context_info: None,
		}),
		EventKind::ForwardPass => Event::ForwardPass(ForwardPass {
			request_id,
			step: 2,
			logits: Logits::new(vec![0.1, 0.2, 0.3]),
			introspection: None,
		}),
		EventKind::Sampled => Event::Sampled(Sampled {
			request_id,
			step: 2,
			sampled_token: 1,
		}),
		EventKind::Added => Event::Added(Added {
			request_id,
			step: 2,
			added_tokens: vec![1],
			forced: false,
		}),
	}
}

fn action(kind: ActionKind) -> Action {
	match kind {
		ActionKind::Noop => Action::Noop,
		ActionKind::AdjustedPrefill => Action::AdjustedPrefill {
			tokens: vec![1, 2],
			max_steps: Some(4),
		},
		ActionKind::ForceTokens => Action::ForceTokens { tokens: vec![2] },
		ActionKind::AdjustedLogits => Action::AdjustedLogits {
			logits: Logits::new(vec![0.0, 0.0, 1.0]),
			token_temp: None,
		},
		ActionKind::Backtrack => Action::Backtrack { n: 1, tokens: None },
		ActionKind::ForceOutput => Action::ForceOutput { tokens: vec![2, 1] },
		ActionKind::ToolCalls => Action::ToolCalls {
			payload: json!({"name": "lookup"}),
		},
		ActionKind::EmitError => Action::EmitError {
			message: String::from("stop"),
		},
	}
}

fn vocab() -> Vocabulary {
	Vocabulary::from_corpus("a b c")
}

#[traced_test]
#[test]
pub fn test_dispatch_preserves_registration_order() {
	let invoked = Arc::new(Mutex::new(vec![]));
	let mut manager = ModManager::new();
	for i in 0..5usize {
		let invoked = invoked.clone();
		manager.register(
			format!("mod-{i}"),
			mod_fn(move |_event, _ctx| {
				invoked.lock().unwrap().push(i);
				Ok(Some(Action::ForceTokens { tokens: vec![i as u32] }))
			}),
		);
	}

	let dispatch = manager.dispatch(&event(EventKind::ForwardPass), &vocab(), &[]).unwrap();
	assert_eq!(*invoked.lock().unwrap(), vec![0, 1, 2, 3, 4]);
	let names: Vec<&str> = dispatch.calls.iter().map(|c| c.mod_name.as_str()).collect();
	assert_eq!(names, vec!["mod-0", "mod-1", "mod-2", "mod-3", "mod-4"]);
	let forced: Vec<u32> = dispatch
		.actions()
		.map(|a| match a {
			Action::ForceTokens { tokens } => tokens[0],
			other => panic!("unexpected {other:?}"),
		})
		.collect();
	assert_eq!(forced, vec![0, 1, 2, 3, 4]);
	assert_eq!(manager.names().collect::<Vec<_>>(), names);
}

#[traced_test]
#[test]
pub fn test_every_illegal_pair_is_a_contract_violation() {
	for event_kind in EventKind::ALL {
		for action_kind in ActionKind::ALL {
			let mut manager = ModManager::new();
			manager.register("first", mod_fn(|_event, _ctx| Ok(None)));
			manager.register("subject", mod_fn(move |_event, _ctx| Ok(Some(action(action_kind)))));

			let result = manager.dispatch(&event(event_kind), &vocab(), &[]);
			if is_legal(event_kind, action_kind) {
				let dispatch = result.unwrap();
				assert_eq!(dispatch.calls.last().unwrap().action.kind(), action_kind);
			} else {
				match result {
					Err(DispatchError::IllegalAction {
						mod_name,
						event,
						action,
						calls,
						..
					}) => {
						assert_eq!(mod_name, "subject");
						assert_eq!(event, event_kind);
						assert_eq!(action, action_kind);
						assert_eq!(calls.len(), 1);
					}
					Ok(d) => panic!("{event_kind}/{action_kind} should have been rejected, got {d:?}"),
				}
			}
		}
	}
}

#[traced_test]
#[test]
pub fn test_terminal_action_short_circuits_dispatch() {
	for terminal in [ActionKind::ForceOutput, ActionKind::ToolCalls, ActionKind::EmitError] {
		let after = Arc::new(AtomicUsize::new(0));
		let mut manager = ModManager::new();
		manager.register("noop", mod_fn(|_event, _ctx| Ok(Some(Action::Noop))));
		manager.register("terminal", mod_fn(move |_event, _ctx| Ok(Some(action(terminal)))));
		let counter = after.clone();
		manager.register(
			"never",
			mod_fn(move |_event, _ctx| {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(None)
			}),
		);

		let dispatch = manager.dispatch(&event(EventKind::Sampled), &vocab(), &[]).unwrap();
		assert_eq!(after.load(Ordering::SeqCst), 0);
		assert_eq!(dispatch.calls.len(), 2);
		assert_eq!(dispatch.terminal().unwrap().mod_name, "terminal");
	}
}

#[traced_test]
#[test]
pub fn test_none_is_normalized_to_noop() {
	let mut manager = ModManager::new();
	manager.register("silent", mod_fn(|_event, _ctx| Ok(None)));
	manager.register("explicit", mod_fn(|_event, _ctx| Ok(Some(Action::Noop))));

	for kind in EventKind::ALL {
		let dispatch = manager.dispatch(&event(kind), &vocab(), &[]).unwrap();
		assert_eq!(dispatch.calls.len(), 2);
		assert!(dispatch.actions().all(|a| a.is_noop()));
		assert!(dispatch.terminal().is_none());
	}
}

#[traced_test]
#[test]
pub fn test_faulty_mods_are_isolated() {
	let mut manager = ModManager::new();
	manager.register("fails", mod_fn(|_event, _ctx| Err(ModFault::from("lookup table missing"))));
	manager.register(
		"panics",
		mod_fn(|event, _ctx| {
			if event.step() < 100 {
				panic!("index out of range");
			}
			Ok(None)
		}),
	);
	manager.register("healthy", mod_fn(|_event, _ctx| Ok(Some(Action::ForceTokens { tokens: vec![7] }))));

	let dispatch = manager.dispatch(&event(EventKind::Added), &vocab(), &[]).unwrap();
	assert_eq!(dispatch.calls.len(), 3);
	assert!(dispatch.calls[0].action.is_noop());
	assert_eq!(dispatch.calls[0].fault, Some(ModFault::from("lookup table missing")));
	assert!(dispatch.calls[1].action.is_noop());
	assert_eq!(dispatch.calls[1].fault, Some(ModFault::from("index out of range")));
	assert!(dispatch.calls[2].fault.is_none());
	assert!(matches!(dispatch.calls[2].action, Action::ForceTokens { .. }));
}

#[traced_test]
#[test]
pub fn test_diagnostic_output_is_captured_per_mod() {
	let mut manager = ModManager::new();
	manager.register(
		"chatty",
		mod_fn(|event, ctx| {
			ctx.log(format_args!("saw {} at step {}", event.kind(), event.step()));
			let text = ctx.tokenizer().decode(&[2]);
			ctx.log(format_args!("token 2 is {text:?}"));
			Ok(None)
		}),
	);
	manager.register("quiet", mod_fn(|_event, _ctx| Ok(None)));

	let dispatch = manager.dispatch(&event(EventKind::ForwardPass), &vocab(), &[]).unwrap();
	let logs = dispatch.calls[0].logs.as_deref().unwrap();
	assert!(logs.starts_with("saw ForwardPass at step 2\n"));
	assert_eq!(logs.lines().count(), 2);
	assert!(dispatch.calls[1].logs.is_none());
}

#[traced_test]
#[test]
pub fn test_empty_manager_dispatches_nothing() {
	let manager = ModManager::new();
	assert!(manager.is_empty());
	let dispatch = manager.dispatch(&event(EventKind::Prefilled), &vocab(), &[]).unwrap();
	assert!(dispatch.calls.is_empty());
}

#[traced_test]
#[test]
pub fn test_mods_see_committed_sequence() {
	let mut manager = ModManager::new();
	manager.register(
		"reader",
		mod_fn(|_event, ctx| {
			let line = format!("{} tokens: {}", ctx.sequence().len(), ctx.tokenizer().decode(ctx.sequence()));
			ctx.log(line);
			Ok(None)
		}),
	);

	let vocab = vocab();
	let sequence = vocab.encode("a b");
	let dispatch = manager.dispatch(&event(EventKind::Added), &vocab, &sequence).unwrap();
	assert_eq!(dispatch.calls[0].logs.as_deref(), Some("2 tokens: a b\n"));
}
