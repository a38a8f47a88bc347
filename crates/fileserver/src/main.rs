use std::path::PathBuf;
use std::sync::Arc;

use forge_fileserver::ca::CaBackend;
use forge_fileserver::handler::Handler;
use forge_fileserver::FileService;
use forge_protocol::config::{load_config, FileServerConfig, StorageBackend};
use forge_protocol::resp::{read_command, write_value, RespValue};
use forge_protocol::ServiceError;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

struct Args {
    config_path: PathBuf,
}

fn parse_args() -> Args {
    let mut config_path = PathBuf::from("forge-fileserver.toml");
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
    let config: FileServerConfig = load_config(&args.config_path)?;

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

    let (root_handler, ca_backend) = match config.backend {
        StorageBackend::Local => (Handler::local(PathBuf::from(&config.storage_root))?, None),
        StorageBackend::Memory => (Handler::memory(), None),
        StorageBackend::ContentAddressed => {
            let ca = Arc::new(CaBackend::open(&config.storage_root)?);
            (Handler::content_addressed(ca.clone())?, Some(ca))
        }
    };

    let service = Arc::new(Mutex::new(FileService::new(root_handler, ca_backend, config.max_file_size)));

    let address = format!("{}:{}", config.listen.address, config.listen.port);
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, backend = ?config.backend, "file service listening");

    run(listener, service).await
}

async fn run(listener: TcpListener, service: Arc<Mutex<FileService>>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            tracing::debug!(%peer, "connection accepted");
            if let Err(err) = handle_connection(stream, service).await {
                tracing::warn!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, service: Arc<Mutex<FileService>>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    // Each connection tracks its own `USER` selection -- the file service's
    // permission checks are keyed off this per-connection string, not off
    // any session concept.
    let mut user = String::new();
    while let Some(args) = read_command(&mut reader).await? {
        let Some(verb) = args.first().cloned() else {
            write_value(&mut write_half, &RespValue::error(ServiceError::bad_request())).await?;
            continue;
        };
        let reply = {
            let mut service = service.lock().await;
            match service.run_command(&mut user, &verb, &args[1..]) {
                Ok(value) => value,
                Err(err) => RespValue::error(err),
            }
        };
        write_value(&mut write_half, &reply).await?;
    }
    Ok(())
}
