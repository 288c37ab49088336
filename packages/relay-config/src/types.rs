use serde::Deserialize;
use serde_json::{Map, Value};

pub const POLICY_THREAD_BOUNDED: &str = "thread_bounded";
pub const POLICY_TIME_GAP_BOUNDED: &str = "time_gap_bounded";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	pub search: Search,
	pub segmentation: Segmentation,
	#[serde(default)]
	pub tracking: Tracking,
	#[serde(default)]
	pub worker: Worker,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	/// Default model; requests may name another one.
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Search {
	/// Applied when a request carries a non-positive limit.
	pub default_limit: u32,
	pub max_limit: u32,
	/// Per-signal candidate pool fetched before fusion.
	pub candidate_k: u32,
	pub lexical_weight: f32,
	pub vector_weight: f32,
	/// Default deadline for one search call.
	pub timeout_ms: u64,
	#[serde(default = "default_snippet_chars")]
	pub snippet_chars: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Segmentation {
	#[serde(default = "default_summary_max_chars")]
	pub summary_max_chars: u32,
	pub definitions: Vec<DefinitionConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DefinitionConfig {
	pub name: String,
	/// One of `thread_bounded` or `time_gap_bounded`.
	pub kind: String,
	pub max_gap_seconds: Option<i64>,
	/// Optional channel scope. Empty means every channel.
	#[serde(default)]
	pub channels: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Tracking {
	pub enabled: bool,
}
impl Default for Tracking {
	fn default() -> Self {
		Self { enabled: true }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Worker {
	pub poll_interval_ms: u64,
	pub batch_size: u32,
	pub embed_batch_size: u32,
}
impl Default for Worker {
	fn default() -> Self {
		Self { poll_interval_ms: 500, batch_size: 256, embed_batch_size: 32 }
	}
}

fn default_snippet_chars() -> u32 {
	200
}

fn default_summary_max_chars() -> u32 {
	4_096
}
