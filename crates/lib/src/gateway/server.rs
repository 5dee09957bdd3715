//! Gateway HTTP server: webhook and health endpoints (single port).

use crate::archive::GoogleArchiver;
use crate::channels::{TelegramClient, TelegramUpdate};
use crate::config::{self, Config, Secrets};
use crate::google::{
    docs, drive, DocsClient, DriveClient, RefreshTokenSource, ServiceAccountTokenSource,
    TokenSource, VisionClient, SCOPE_CLOUD_VISION,
};
use crate::llm::GeminiClient;
use crate::pipeline::{Archiver, HandlerContext, HandlerSettings, Services};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;

const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";
const HEALTH_TEXT: &str = "lessonbot is running";

/// Shared state for the HTTP layer.
#[derive(Clone)]
pub struct GatewayState {
    pub handler: Arc<HandlerContext>,
    /// When Some, webhook requests must carry a matching secret header.
    pub webhook_secret: Option<Arc<str>>,
}

impl GatewayState {
    pub fn new(handler: Arc<HandlerContext>, webhook_secret: Option<String>) -> Self {
        Self {
            handler,
            webhook_secret: webhook_secret.map(Arc::from),
        }
    }
}

/// Routes: `GET /`, `GET /health`, `POST /webhook`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/health", get(health_http))
        .route("/webhook", post(telegram_webhook))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` completes.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited")
}

/// Production services from config and secrets. Also returns the Telegram client for webhook management.
pub fn build_services(config: &Config, secrets: &Secrets) -> Result<(Services, TelegramClient)> {
    let telegram = TelegramClient::new(&config.telegram.api_base, secrets.bot_token.clone());

    let vision_tokens: Arc<dyn TokenSource> = Arc::new(
        ServiceAccountTokenSource::from_json(&secrets.vision_credentials, SCOPE_CLOUD_VISION)
            .context("loading vision service-account credentials")?,
    );
    let ocr = VisionClient::new(
        &config.vision.api_base,
        config.vision.language_hints.clone(),
        vision_tokens,
    );

    let summarizer = GeminiClient::new(
        &config.gemini.api_base,
        &config.gemini.model,
        secrets.gemini_api_key.clone(),
    );

    let archiver: Option<Arc<dyn Archiver>> = match (&secrets.archive, config.archive.enabled) {
        (Some(archive), true) => {
            let tokens: Arc<dyn TokenSource> = Arc::new(RefreshTokenSource::new(
                archive.oauth.client_id.clone(),
                archive.oauth.client_secret.clone(),
                archive.oauth.refresh_token.clone(),
            ));
            Some(Arc::new(GoogleArchiver::new(
                DriveClient::new(drive::DEFAULT_API_BASE, tokens.clone()),
                DocsClient::new(docs::DEFAULT_API_BASE, tokens),
                archive.document_id.clone(),
                config.archive.drive_folder_id.clone(),
            )))
        }
        _ => None,
    };

    let services = Services {
        chat: Arc::new(telegram.clone()),
        ocr: Arc::new(ocr),
        summarizer: Arc::new(summarizer),
        archiver,
    };
    Ok((services, telegram))
}

/// Run the webhook server on `port` until SIGINT or SIGTERM.
pub async fn run_gateway(config: Config, secrets: Secrets, port: u16) -> Result<()> {
    let (services, telegram) = build_services(&config, &secrets)?;
    log::info!(
        "archival {}",
        if services.archiver.is_some() { "enabled" } else { "disabled" }
    );
    let handler = Arc::new(HandlerContext::new(
        services,
        HandlerSettings::from_config(&config),
    ));
    log::info!(
        "dedup window {}s",
        handler.dedup().window().as_secs()
    );
    let webhook_secret = config::resolve_webhook_secret(&config);
    let bind = config.server.bind.trim();
    if webhook_secret.is_none() && !config::is_loopback_bind(bind) {
        log::warn!(
            "no webhook secret configured; any client reaching {} can post updates",
            bind
        );
    }

    let registered = match config.telegram.webhook_url.as_deref() {
        Some(url) => match telegram.set_webhook(url, webhook_secret.as_deref()).await {
            Ok(()) => {
                log::info!("telegram webhook registered: {}", url);
                true
            }
            Err(e) => {
                log::warn!("telegram set_webhook failed: {}", e);
                false
            }
        },
        None => false,
    };

    let state = GatewayState::new(handler, webhook_secret);
    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let webhook_owner = registered.then_some(telegram);
    serve(listener, state, shutdown_signal(webhook_owner)).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM, then removes the webhook if this process registered it.
async fn shutdown_signal(telegram: Option<TelegramClient>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("installing SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");

    if let Some(t) = telegram {
        if let Err(e) = t.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }
}

/// POST /webhook: verifies the optional secret, then handles the update to completion on a detached task.
/// Application outcomes always answer 200 so the platform does not retry.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(ref expected) = state.webhook_secret {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_ref() {
            log::warn!("webhook request with a wrong or missing secret token");
            return (StatusCode::FORBIDDEN, "FORBIDDEN");
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            log::warn!("ignoring unparseable update: {}", e);
            return (StatusCode::OK, "OK");
        }
    };
    // The update runs on its own task so a dropped connection does not cancel it midway.
    let handler = state.handler.clone();
    let task = tokio::spawn(async move {
        let outcome = handler.handle(&update).await;
        log::debug!("update {:?}: {:?}", update.update_id, outcome);
        outcome
    });
    match task.await {
        Ok(outcome) => (StatusCode::OK, outcome.response_body()),
        Err(e) => {
            log::error!("update task failed: {}", e);
            (StatusCode::OK, "OK")
        }
    }
}

/// GET / and GET /health.
async fn health_http() -> &'static str {
    HEALTH_TEXT
}
