use clap::Parser;
use flapi::cmd::{run_server, Cli};

#[tokio::main]
async fn main() -> flapi::Result<()> {
    let cli = Cli::parse();
    run_server(&cli).await
}
