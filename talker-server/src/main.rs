use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use talker_server::error::BindError;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{e:#}");
            if e.chain().any(|cause| cause.downcast_ref::<BindError>().is_some()) {
                2
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("talker_server=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = talker_server::config::ServerConfig::parse();
    tracing::info!("Starting talker server on {}", config.listen);
    if let Some(ref peer_listen) = config.peer_listen {
        tracing::info!("Peer listener on {peer_listen}");
    }

    let server = talker_server::server::Server::new(config);
    server.run().await
}
