//! Ready-made mods that can be configured without writing code

use crate::{
	action::Action,
	event::{Event, TokenId},
	manager::{Mod, ModContext, ModFault},
	TOKEN_FORBIDDEN,
};

/// Forbids a fixed set of tokens at every forward pass
pub struct BanTokens {
	tokens: Vec<TokenId>,
}

impl BanTokens {
	pub fn new(tokens: Vec<TokenId>) -> BanTokens {
		BanTokens { tokens }
	}
}

impl Mod for BanTokens {
	fn handle(&self, event: &Event, ctx: &mut ModContext<'_>) -> Result<Option<Action>, ModFault> {
		let Event::ForwardPass(fp) = event else {
			return Ok(None);
		};

		// Nothing to do when every banned token is already forbidden
		if self.tokens.iter().all(|t| fp.logits.get(*t).map(|s| s <= TOKEN_FORBIDDEN).unwrap_or(true)) {
			return Ok(None);
		}

		let mut logits = fp.logits.clone();
		for token in &self.tokens {
			logits.set(*token, TOKEN_FORBIDDEN);
		}
		ctx.log(format_args!("banned {} tokens", self.tokens.len()));
		Ok(Some(Action::AdjustedLogits { logits, token_temp: None }))
	}
}

/// Makes every completion start with a fixed text
pub struct ForcePrefix {
	text: String,
}

impl ForcePrefix {
	pub fn new(text: impl Into<String>) -> ForcePrefix {
		ForcePrefix { text: text.into() }
	}
}

impl Mod for ForcePrefix {
	fn handle(&self, event: &Event, ctx: &mut ModContext<'_>) -> Result<Option<Action>, ModFault> {
		match event {
			Event::Prefilled(_) => {
				let tokens = ctx.tokenizer().encode(&self.text);
				if tokens.is_empty() {
					return Err(ModFault(format!("prefix {:?} encodes to no tokens", self.text)));
				}
				Ok(Some(Action::ForceTokens { tokens }))
			}
			_ => Ok(None),
		}
	}
}

/// Ends a request with an error as soon as the committed completion contains a phrase.
///
/// Only text around the tokens just added is decoded. Tokens retracted by a backtrack no longer count.
pub struct BlockText {
	phrase: String,
	message: String,
}

impl BlockText {
	pub fn new(phrase: impl Into<String>, message: impl Into<String>) -> BlockText {
		BlockText {
			phrase: phrase.into(),
			message: message.into(),
		}
	}
}

impl Mod for BlockText {
	fn handle(&self, event: &Event, ctx: &mut ModContext<'_>) -> Result<Option<Action>, ModFault> {
		let Event::Added(added) = event else {
			return Ok(None);
		};
		if self.phrase.is_empty() {
			return Ok(None);
		}

		// A match ending in the added tokens starts at most one token per phrase character earlier
		let window = added.added_tokens.len() + self.phrase.chars().count();
		let text = ctx.tokenizer().decode_last(ctx.sequence(), window);
		if text.contains(&self.phrase) {
			ctx.log(format_args!("blocked phrase {:?} found", self.phrase));
			Ok(Some(Action::EmitError {
				message: self.message.clone(),
			}))
		} else {
			Ok(None)
		}
	}
}
