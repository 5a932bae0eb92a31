use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gated_llm_service::{
    AdmissionController, AppConfig, ServiceContext,
    admission::{Admitted, SystemProbe},
    build_router,
    hub::HubMetadataClient,
    model::{HfTokenizer, TokenCodec, TorchScriptLoader, torch_device},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(model = %config.model_id, precision = %config.precision, "admitting model");

    let admission_config = config.clone();
    let (admitted, codec) = tokio::task::spawn_blocking(move || admit(&admission_config))
        .await
        .context("admission task panicked")??;

    let Admitted { model, report } = admitted;
    let context = Arc::new(ServiceContext::new(
        config.model_id.clone(),
        Arc::from(model),
        codec,
        Some(report),
    ));
    let router = build_router(config.clone(), context.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    context.evict();
    Ok(())
}

/// Any failure aborts startup. The tokenizer is resolved first so a bad
/// EOS token is reported before any weights are downloaded.
fn admit(config: &AppConfig) -> anyhow::Result<(Admitted, Arc<dyn TokenCodec>)> {
    let tokenizer = match &config.tokenizer_path {
        Some(path) => HfTokenizer::from_file(path, &config.eos_token)?,
        None => HfTokenizer::from_pretrained(
            &config.model_id,
            config.revision.as_deref(),
            config.hub_token.as_deref(),
            &config.eos_token,
        )?,
    };

    let metadata = HubMetadataClient::new(
        config.hub_endpoint.clone(),
        config.revision.clone(),
        config.hub_token.clone(),
    )?;
    let probe = SystemProbe::new(config.cache_dir.clone(), config.device.accelerator_index());
    let loader = TorchScriptLoader::from_config(config, torch_device(config.device));

    let admitted = AdmissionController::new(&metadata, &probe, &loader, config.precision)
        .check(&config.model_id)
        .with_context(|| format!("model {} was not admitted", config.model_id))?;

    Ok((admitted, Arc::new(tokenizer)))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown requested");
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokenizers::{Tokenizer, models::wordlevel::WordLevel};

    use super::*;

    #[test]
    fn bad_eos_token_fails_before_the_hub_is_contacted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tokenizer.json");
        let vocab: HashMap<String, u32> = [("<unk>", 0), ("hello", 1)]
            .into_iter()
            .map(|(token, id)| (token.to_string(), id))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        Tokenizer::new(model).save(&path, false).unwrap();

        let tokenizer_path = path.to_string_lossy().into_owned();
        let cache_dir = dir.path().to_string_lossy().into_owned();
        let config = AppConfig::from_lookup(|key| match key {
            "TOKENIZER_PATH" => Some(tokenizer_path.clone()),
            "EOS_TOKEN" => Some("</s>".to_string()),
            "HF_ENDPOINT" => Some("http://127.0.0.1:9".to_string()),
            "MODEL_CACHE_DIR" => Some(cache_dir.clone()),
            _ => None,
        })
        .unwrap();

        let err = admit(&config).err().unwrap();
        assert!(err.to_string().contains("end-of-sequence token"), "{err:#}");
    }
}
