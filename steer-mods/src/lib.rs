pub mod action;
pub mod builtin;
pub mod event;
pub mod manager;
pub mod tokenizer;

pub use action::{is_legal, Action, ActionKind, Actions, InvalidAction};
pub use event::{Added, ContextInfo, Event, EventKind, ForwardPass, Introspection, Logits, Prefilled, RequestId, Sampled, TokenId};
pub use manager::{mod_fn, Dispatch, DispatchError, Mod, ModCall, ModContext, ModFault, ModManager};
pub use tokenizer::{Tokenizer, Vocabulary, VocabularyConfig};

/// Logit value to indicate a token is forbidden to be present in the result
pub const TOKEN_FORBIDDEN: f32 = -10000.0;
