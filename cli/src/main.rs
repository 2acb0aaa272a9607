//! The `rpmcache` command.

use anyhow::Result;

async fn run() -> Result<()> {
    rpmcache_utils::initialize_tracing();
    tracing::trace!("starting");
    rpmcache_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
