pub mod backend;
pub mod config;
pub mod generation;
pub mod ingest;
pub mod local;
pub mod queue;
pub mod sampling;
pub mod stats;
pub mod types;

pub use backend::{Backend, BackendError, ForwardOutput, PrefillOutput, Session};
pub use config::{CorpusConfig, GenerationConfig, LocalModelConfig};
pub use generation::Generator;
pub use ingest::{ChannelIngest, Ingest, IngestAccumulator, IngestRecord, NullIngest};
pub use local::{BigramModel, LocalBackend, LocalOptions};
pub use sampling::SamplingParams;
pub use stats::{EngineStats, GenerationStats, TaskStats};
pub use types::{FinishReason, GenerateError, GenerateRequest, GenerationResult, Prompt};
