fn build_worker_pool(
    config: &DaemonConfig,
    store: &JobStore,
    queue: &Arc<dyn TaskQueue>,
) -> anyhow::Result<WorkerPool> {
    if config.google_api_key.is_empty() {
        warn!("FOLDER_IMPORT_GOOGLE_API_KEY is not set; Drive listings will be rejected");
    }
    if config.dropbox_token.is_empty() {
        warn!("FOLDER_IMPORT_DROPBOX_TOKEN is not set; Dropbox listings will be rejected");
    }

    let timeout = config.operation_timeout;
    let drive = GoogleDriveClient::new(config.google_api_key.clone())
        .and_then(|client| client.with_timeout(timeout))
        .context("failed to build Google Drive client")?;
    let dropbox = DropboxClient::new(config.dropbox_token.clone())
        .and_then(|client| client.with_timeout(timeout))
        .context("failed to build Dropbox client")?;
    let storage = StorageClient::new(
        &config.supabase_url,
        config.storage_bucket.clone(),
        config.supabase_service_key.clone(),
    )
    .with_context(|| {
        format!(
            "invalid FOLDER_IMPORT_SUPABASE_URL {:?}",
            config.supabase_url
        )
    })?
    .with_timeout(timeout)
    .context("failed to build storage client")?;

    let sources = SourceRegistry::new(
        Arc::new(DriveSource::new(drive)),
        Arc::new(DropboxSource::new(dropbox)),
    );
    let aggregator = CompletionAggregator::new(store.clone());
    let retry = config.retry_policy();

    let dispatcher = ChunkDispatcher::new(
        store.clone(),
        Arc::clone(queue),
        sources.clone(),
        aggregator.clone(),
        retry,
        config.chunk_size,
    );
    let processor = FileProcessor::new(
        store.clone(),
        sources,
        Arc::new(StorageDestination::new(storage)),
        aggregator.clone(),
        retry,
        TransferLimits {
            download_concurrency: config.download_concurrency,
            upload_concurrency: config.upload_concurrency,
        },
    );

    Ok(WorkerPool::new(
        Arc::clone(queue),
        Arc::new(dispatcher),
        Arc::new(processor),
        aggregator,
        config.worker_config(),
    ))
}

async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => {
            // Without a signal handler the process can only be killed.
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

fn read_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    read_string(lookup, name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_u32<F>(lookup: &F, name: &str, default: u64) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    u32::try_from(read_u64(lookup, name, default)).unwrap_or(u32::MAX)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match read_string(lookup, name) {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}
