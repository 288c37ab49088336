pub mod worker;

use std::{path::PathBuf, sync::Arc};

use clap::{
	Parser,
	builder::{
		Styles,
		styling::{AnsiColor, Effects},
	},
};
use tracing_subscriber::EnvFilter;

use relay_service::{Backends, PgBackend, RelayService};
use relay_storage::db::Db;

#[derive(Debug, Parser)]
#[command(version, rename_all = "kebab", styles = styles())]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = relay_config::load(&args.config)?;
	let filter = EnvFilter::new(config.service.log_level.clone());

	tracing_subscriber::fmt().with_env_filter(filter).init();

	let db = Db::connect(&config.storage.postgres).await?;

	db.ensure_schema().await?;

	let backend = Arc::new(PgBackend::new(&db));
	let worker = config.worker.clone();
	let service = RelayService::new(config, Backends::shared(backend))?;
	let rescanned = service.ensure_definitions_current().await?;

	if !rescanned.is_empty() {
		tracing::info!(definitions = ?rescanned, "Segmentation definitions re-scanned.");
	}

	worker::run_worker(worker::WorkerState { db, service, worker }).await
}

fn styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Red.on_default() | Effects::BOLD)
		.usage(AnsiColor::Red.on_default() | Effects::BOLD)
		.literal(AnsiColor::Blue.on_default() | Effects::BOLD)
		.placeholder(AnsiColor::Green.on_default())
}
