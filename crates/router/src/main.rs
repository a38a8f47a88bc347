use std::path::PathBuf;
use std::sync::Arc;

use forge_common::{IdGenerator, RandomIdGenerator};
use forge_protocol::config::{load_config, RouterConfig};
use forge_router::{server, SessionMultiplexer};
use tokio::net::TcpListener;

struct Args {
    config_path: PathBuf,
}

fn parse_args() -> Args {
    let mut config_path = PathBuf::from("forge-router.toml");
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(value) = iter.next() {
                    config_path = PathBuf::from(value);
                }
            }
            other => {
                tracing::warn!(arg = other, "ignoring unrecognized command line argument");
            }
        }
    }
    Args { config_path }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forge_common::init_logging();

    let args = parse_args();
    let config: RouterConfig = load_config(&args.config_path)?;

    if let Err(issues) = config.validate() {
        for issue in &issues {
            if issue.starts_with("ERROR") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if issues.iter().any(|i| i.starts_with("ERROR")) {
            anyhow::bail!("refusing to start with invalid configuration");
        }
    }

    let id_generator: Arc<dyn IdGenerator> = Arc::new(RandomIdGenerator::new());
    let address = format!("{}:{}", config.listen.address, config.listen.port);
    let multiplexer = Arc::new(SessionMultiplexer::new(config, id_generator));

    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, "session router listening");

    server::run(listener, multiplexer).await
}
