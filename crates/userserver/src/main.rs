use std::path::PathBuf;
use std::sync::Arc;

use forge_common::{Database, IdGenerator, InMemoryDatabase, RandomIdGenerator};
use forge_protocol::config::{load_config, UserServerConfig};
use forge_userserver::encrypter::{ClassicEncrypter, MultiPasswordEncrypter, SaltedPasswordEncrypter};
use forge_userserver::server::{self, ServerState};
use forge_userserver::token::TokenStore;
use forge_userserver::usermanagement::UserManagement;
use tokio::net::TcpListener;

struct Args {
    config_path: PathBuf,
}

fn parse_args() -> Args {
    let mut config_path = PathBuf::from("forge-userserver.toml");
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
    let config: UserServerConfig = load_config(&args.config_path)?;

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

    let db: Arc<dyn Database> = if config.database_url == "memory" {
        Arc::new(InMemoryDatabase::new())
    } else {
        #[cfg(feature = "redis-backend")]
        {
            let backend = forge_common::database::RedisDatabase::connect(&config.database_url)?;
            Arc::new(backend)
        }
        #[cfg(not(feature = "redis-backend"))]
        {
            anyhow::bail!(
                "database_url {:?} requires the redis-backend feature",
                config.database_url
            );
        }
    };

    let id_generator: Arc<dyn IdGenerator> = Arc::new(RandomIdGenerator::new());
    let encrypter = Arc::new(MultiPasswordEncrypter::new(
        Box::new(SaltedPasswordEncrypter::new(id_generator.clone())),
        Box::new(ClassicEncrypter::new(config.password_key.clone())),
    ));

    let user_management = UserManagement::new(
        db.clone(),
        id_generator.clone(),
        encrypter,
        config.max_user_data_total_size,
    );
    let token_store = TokenStore::new(db, id_generator);

    let state = Arc::new(ServerState {
        user_management,
        token_store,
        max_user_data_key_size: config.max_user_data_key_size,
        max_user_data_value_size: config.max_user_data_value_size,
    });

    let address = format!("{}:{}", config.listen.address, config.listen.port);
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, "user service listening");

    server::run(listener, state).await
}
