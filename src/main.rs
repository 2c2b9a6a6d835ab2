mod config;

use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use config::{Args, Config};
use steer_backend::{Backend, ChannelIngest, EngineStats, GenerateRequest, Generator, Ingest, IngestAccumulator, LocalBackend};
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?)
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let config = Config::load(&args.config_path).await?;
	let (task_name, task) = config.task(args.task.as_deref())?;

	let backend = Arc::new(LocalBackend::from_config("local", &config.model).await?);
	let mods = task.mod_manager(backend.tokenizer().as_ref())?;
	info!(task = %task_name, mods = mods.len(), "starting");

	let prompts = if args.prompt.is_empty() {
		let mut input = String::new();
		tokio::io::stdin().read_to_string(&mut input).await?;
		vec![input.trim_end().to_string()]
	} else {
		args.prompt.clone()
	};

	let stats = Arc::new(EngineStats::default());
	let generator = Arc::new(Generator::new(task_name.clone(), backend, Arc::new(mods), task.generation.clone()).with_stats(stats.clone()));

	// All requests report into one channel, drained by a single collector
	let (ingest, mut receiver) = ChannelIngest::new();
	let collector = tokio::spawn(async move {
		let mut accumulator = IngestAccumulator::new();
		while let Some(record) = receiver.recv().await {
			accumulator.record(record);
		}
		accumulator
	});

	let handles: Vec<_> = prompts
		.iter()
		.map(|prompt| {
			let generator = generator.clone();
			let mut ingest = ingest.clone();
			let request = GenerateRequest::text(task.prompt(prompt));
			tokio::spawn(async move { generator.generate(request, &mut ingest).await })
		})
		.collect();
	drop(ingest);

	let mut failed = 0;
	for handle in handles {
		match handle.await? {
			Ok(result) => {
				if args.json {
					println!("{}", serde_json::to_string(&result)?);
				} else {
					println!("{}", result.output_text);
				}
			}
			Err(e) => {
				error!("generation failed: {e}");
				failed += 1;
			}
		}
	}

	let accumulator = collector.await?;
	if let Some(path) = &args.ingest_path {
		accumulator.write_json(path).await?;
		info!(path = %path.display(), records = accumulator.records().len(), "ingest records written");
	}

	for (name, task_stats) in stats.snapshot() {
		info!(
			task = %name,
			requests = task_stats.requests(),
			failed = task_stats.failed_requests(),
			generated_tokens = task_stats.generated_tokens(),
			"task statistics"
		);
	}

	if failed > 0 {
		bail!("{failed} of {} requests failed", prompts.len());
	}
	Ok(())
}
