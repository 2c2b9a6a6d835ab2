use clap::Parser;
use serde::Deserialize;
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Context};
use steer_backend::{GenerationConfig, LocalModelConfig};
use steer_mods::{
	builtin::{BanTokens, BlockText, ForcePrefix},
	ModManager, Tokenizer,
};

/// Name of the task used when the configuration does not define any
pub const DEFAULT_TASK: &str = "default";

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModConfig {
	/// Never generate any of the tokens these strings encode to
	BanTokens { tokens: Vec<String> },

	/// Start every completion with this text
	ForcePrefix { text: String },

	/// End the request with an error message when the output contains the text
	BlockText { text: String, message: String },
}

impl ModConfig {
	pub fn kind(&self) -> &'static str {
		match self {
			ModConfig::BanTokens { .. } => "ban_tokens",
			ModConfig::ForcePrefix { .. } => "force_prefix",
			ModConfig::BlockText { .. } => "block_text",
		}
	}
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TaskConfig {
	#[serde(flatten)]
	pub generation: GenerationConfig,

	/// Text to prefix each user input with
	pub prefix: Option<String>,

	/// Text to postfix each user input with
	pub postfix: Option<String>,

	/// Mods in the order in which they see events
	#[serde(default)]
	pub mods: Vec<ModConfig>,

	/// Mods taking longer than this (in milliseconds) for a single event are reported
	pub mod_time_budget_ms: Option<u64>,
}

impl TaskConfig {
	pub fn prompt(&self, user: &str) -> String {
		format!("{}{}{}", self.prefix.as_deref().unwrap_or(""), user, self.postfix.as_deref().unwrap_or(""))
	}

	pub fn mod_manager(&self, tokenizer: &dyn Tokenizer) -> anyhow::Result<ModManager> {
		let mut manager = ModManager::new();
		if let Some(ms) = self.mod_time_budget_ms {
			manager = manager.with_time_budget(Duration::from_millis(ms));
		}

		for (index, config) in self.mods.iter().enumerate() {
			let name = format!("{}#{index}", config.kind());
			match config {
				ModConfig::BanTokens { tokens } => {
					let ids: Vec<_> = tokens.iter().flat_map(|t| tokenizer.encode(t)).collect();
					if ids.is_empty() {
						bail!("mod {name} bans no tokens");
					}
					manager.register(name, BanTokens::new(ids));
				}
				ModConfig::ForcePrefix { text } => manager.register(name, ForcePrefix::new(text.clone())),
				ModConfig::BlockText { text, message } => manager.register(name, BlockText::new(text.clone(), message.clone())),
			}
		}
		Ok(manager)
	}
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// The local model serving all tasks
	pub model: LocalModelConfig,

	/// Tasks that can be run
	#[serde(default)]
	pub tasks: HashMap<String, TaskConfig>,
}

impl Config {
	pub async fn load(path: &Path) -> anyhow::Result<Config> {
		let data = tokio::fs::read_to_string(path)
			.await
			.with_context(|| format!("reading config file {}", path.display()))?;
		Ok(toml::from_str(&data)?)
	}

	/// Look up a task by name. Without a name, the only configured task (or a default one when there are none) is used.
	pub fn task(&self, name: Option<&str>) -> anyhow::Result<(String, TaskConfig)> {
		match name {
			Some(name) => match self.tasks.get(name) {
				Some(task) => Ok((name.to_string(), task.clone())),
				None => Err(anyhow!("task '{name}' not found")),
			},
			None => match self.tasks.len() {
				0 => Ok((DEFAULT_TASK.to_string(), TaskConfig::default())),
				1 => Ok(self.tasks.iter().map(|(k, v)| (k.clone(), v.clone())).next().unwrap_or_default()),
				_ => bail!("multiple tasks configured, select one with --task"),
			},
		}
	}
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
	/// Where to load the config file from
	#[arg(long, short = 'm', default_value = "config.toml")]
	pub config_path: PathBuf,

	/// Task to run
	#[arg(long, short = 't')]
	pub task: Option<String>,

	/// Prompt to complete. Can be repeated; prompts are completed concurrently. Read from stdin when absent.
	#[arg(long, short = 'p')]
	pub prompt: Vec<String>,

	/// Write all ingest records to this JSON file
	#[arg(long, short = 'i')]
	pub ingest_path: Option<PathBuf>,

	/// Print full results as JSON lines instead of only the output text
	#[arg(long)]
	pub json: bool,
}

#[cfg(test)]
mod test {
	use steer_mods::Vocabulary;

	use super::{Config, ModConfig, DEFAULT_TASK};

	const CONFIG: &str = r#"
		[model]
		corpus = { text = "the cat sat on the mat" }
		seed = 1

		[tasks.story]
		max_tokens = 12
		temperature = 0.0
		prefix = "the "
		stop_sequences = ["mat"]
		mod_time_budget_ms = 5

		[[tasks.story.mods]]
		type = "ban_tokens"
		tokens = [" cat"]

		[[tasks.story.mods]]
		type = "block_text"
		text = "dog"
		message = "no dogs"
	"#;

	#[test]
	fn test_parse_config() {
		let config: Config = toml::from_str(CONFIG).unwrap();
		let (name, task) = config.task(None).unwrap();
		assert_eq!(name, "story");
		assert_eq!(task.generation.max_tokens, 12);
		assert_eq!(task.generation.temperature, 0.0);
		assert_eq!(task.generation.top_k, 50);
		assert_eq!(task.generation.stop_sequences, vec!["mat".to_string()]);
		assert_eq!(task.prompt("cat"), "the cat");
		assert!(matches!(task.mods[1], ModConfig::BlockText { .. }));
		assert!(config.task(Some("poem")).is_err());

		let vocab = Vocabulary::from_corpus("the cat sat on the mat");
		let manager = task.mod_manager(&vocab).unwrap();
		assert_eq!(manager.names().collect::<Vec<_>>(), vec!["ban_tokens#0", "block_text#1"]);
	}

	#[test]
	fn test_default_task() {
		let config: Config = toml::from_str("[model]\ncorpus = { text = \"a b\" }").unwrap();
		let (name, task) = config.task(None).unwrap();
		assert_eq!(name, DEFAULT_TASK);
		assert!(task.mods.is_empty());
		assert_eq!(task.generation.max_tokens, 2048);
	}
}
