use clap::Parser;

use relay_worker::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	relay_worker::run(Args::parse()).await
}
