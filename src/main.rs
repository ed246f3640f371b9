use std::sync::Arc;
use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use upload_queue::utils::{format_bytes, format_progress};
use upload_queue::{
    Admission, AppConfig, CallbackResolver, FileHistoryStore, FileInput, FileQueueStore,
    HttpRegistrar, HttpTransfer, ItemCallbacks, UploadEvent, UploadManager, UploadRequest,
};

const CONTEXT_TYPES: [&str; 3] = ["collection", "selection", "proofing"];

fn build_resolver(config: &AppConfig) -> anyhow::Result<CallbackResolver> {
    let mut resolver = CallbackResolver::new();

    for context_type in CONTEXT_TYPES {
        let mut registrar = HttpRegistrar::new(config.api_base(), context_type)?;
        if let Some(token) = &config.token {
            registrar = registrar.with_token(token.clone());
        }
        let registrar = Arc::new(registrar);

        resolver.register(context_type, move |_: &str, _: Option<&str>| {
            ItemCallbacks::new(registrar.clone())
        });
    }

    Ok(resolver)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = AppConfig::load(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path))?;

    let store = FileQueueStore::open(&config.state_dir, config.storage_quota_bytes).await?;
    let history = FileHistoryStore::open(config.state_dir.join("history.json")).await?;
    let mut transfer = HttpTransfer::new(&config.endpoint)?;
    if let Some(token) = &config.token {
        transfer = transfer.with_token(token.clone());
    }

    let handle = UploadManager::builder()
        .config(config.queue.clone())
        .store(Arc::new(store))
        .history(Arc::new(history))
        .transfer(Arc::new(transfer))
        .resolver(build_resolver(&config)?)
        .build()?;
    let manager = handle.manager.clone();
    let mut events = manager.subscribe_events();

    for path in &config.files {
        let file = FileInput::from_path(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let size = file.size();

        let mut request = UploadRequest::new(config.context_type.clone(), config.context_id.clone());
        if let Some(set_id) = &config.set_id {
            request = request.with_set(set_id.clone());
        }

        match manager.add(file, request).await {
            Ok(Admission::Queued { upload_id }) => {
                info!(%upload_id, path = %path.display(), size = %format_bytes(size), "queued")
            }
            Ok(Admission::Duplicate { existing }) => {
                warn!(path = %path.display(), existing = %existing.id, "already in the queue")
            }
            Ok(Admission::AlreadyUploaded { existing }) => {
                warn!(path = %path.display(), existing = %existing.filename, "already uploaded")
            }
            Err(err) => error!(path = %path.display(), error = %err, "not queued"),
        }
    }

    while !manager.stats().await?.is_idle() {
        match events.recv().await {
            Ok(UploadEvent::Progress { upload_id, progress }) => {
                info!(%upload_id, "{}", format_progress(&progress));
            }
            Ok(UploadEvent::StatusChanged { upload_id, old_status, new_status }) => {
                info!(%upload_id, "{:?} -> {:?}", old_status, new_status);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    for item in manager.list_items().await? {
        if let Some(error) = &item.error {
            error!(upload_id = %item.id, filename = %item.filename, status = ?item.status, "{}", error.message);
        }
    }

    drop(manager);
    handle.shutdown().await?;
    Ok(())
}
