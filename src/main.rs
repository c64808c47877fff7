//! Lead Capture - multi-tenant chat assistants that turn conversations into leads.

mod chat;
mod config;
mod embed;
mod error;
mod extractor;
mod fields;
mod leads;
mod openrouter;
mod schema;
mod store;
mod tenants;
#[cfg(test)]
mod testing;
mod whatsapp;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chat::{SessionRegistry, TurnDriver};
use config::{AppConfig, StoreSettings};
use embed::WidgetDescriptor;
use error::AppError;
use extractor::LeadExtractor;
use leads::LeadUpserter;
use openrouter::{LlmClient, OpenRouterClient};
use schema::{ChatTurn, Lead, Tenant};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use store::{memory::MemoryStore, supabase::SupabaseStore, Store};
use tenants::{TenantInput, TenantPatch, TenantService};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    tenants: TenantService,
    sessions: SessionRegistry,
    driver: TurnDriver,
    public_base_url: Arc<str>,
}

impl AppState {
    fn new(
        store: Arc<dyn Store>,
        llm: Option<Arc<dyn LlmClient>>,
        config: &AppConfig,
    ) -> Self {
        let sessions = SessionRegistry::new();
        let extractor = llm.as_ref().map(|llm| {
            Arc::new(LeadExtractor::new(
                llm.clone(),
                LeadUpserter::new(store.clone()),
                config.extraction,
            ))
        });
        Self {
            tenants: TenantService::new(store.clone(), sessions.clone()),
            driver: TurnDriver::new(llm, extractor),
            store,
            sessions,
            public_base_url: Arc::from(config.public_base_url.as_str()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "lead_capture=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn Store> = match &config.store {
        StoreSettings::Supabase {
            base_url,
            service_role_key,
            schema,
        } => Arc::new(SupabaseStore::new(base_url, service_role_key, schema)),
        StoreSettings::Memory => {
            warn!("SUPABASE_URL not set; tenants and leads are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    info!("Using {} store", store.name());

    let llm: Option<Arc<dyn LlmClient>> = match &config.llm {
        Some(settings) => {
            info!(
                "OpenRouter client initialized (chat: {}, extraction: {})",
                settings.chat_model, settings.extraction_model
            );
            Some(Arc::new(OpenRouterClient::new(settings)))
        }
        None => {
            warn!("OPENROUTER_API_KEY not set; chat replies with a configuration message");
            None
        }
    };

    let state = AppState::new(store, llm, &config);
    spawn_idle_eviction(state.sessions.clone(), config.session_idle);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tenants", get(list_tenants).post(create_tenant))
        .route(
            "/tenants/{doc_id}",
            get(get_tenant).put(update_tenant).delete(delete_tenant),
        )
        .route("/tenants/{doc_id}/leads", get(list_leads))
        .route(
            "/tenants/{doc_id}/leads/{lead_doc_id}/whatsapp",
            get(whatsapp_link),
        )
        .route("/tenants/{doc_id}/embed-code", get(embed_code))
        .route("/embed/{slug}", get(get_widget))
        .route("/embed/{slug}/sessions", post(open_session))
        .route("/sessions/{id}", get(get_session).delete(close_session))
        .route("/sessions/{id}/messages", post(send_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Periodically drop chat sessions nobody has used for `max_idle`.
fn spawn_idle_eviction(sessions: SessionRegistry, max_idle: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(max_idle.min(Duration::from_secs(60)));
        loop {
            ticker.tick().await;
            let evicted = sessions.evict_idle(max_idle).await;
            if evicted > 0 {
                debug!("Evicted {} idle sessions", evicted);
            }
        }
    });
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

async fn list_tenants(State(state): State<AppState>) -> Result<Json<Vec<Tenant>>, AppError> {
    Ok(Json(state.tenants.list().await?))
}

async fn create_tenant(
    State(state): State<AppState>,
    Json(input): Json<TenantInput>,
) -> Result<(StatusCode, Json<Tenant>), AppError> {
    let tenant = state.tenants.create(input).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<Tenant>, AppError> {
    Ok(Json(state.tenants.get(&doc_id).await?))
}

async fn update_tenant(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Json(patch): Json<TenantPatch>,
) -> Result<Json<Tenant>, AppError> {
    Ok(Json(state.tenants.update(&doc_id, patch).await?))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted_leads: usize,
}

async fn delete_tenant(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted_leads = state.tenants.delete(&doc_id).await?;
    Ok(Json(DeleteResponse { deleted_leads }))
}

/// Leads of a tenant, newest first.
async fn list_leads(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<Vec<Lead>>, AppError> {
    state.tenants.get(&doc_id).await?;
    Ok(Json(state.store.list_leads(&doc_id).await?))
}

#[derive(Serialize)]
struct WhatsAppLink {
    message: String,
    url: String,
}

async fn whatsapp_link(
    State(state): State<AppState>,
    Path((doc_id, lead_doc_id)): Path<(String, String)>,
) -> Result<Json<WhatsAppLink>, AppError> {
    let tenant = state.tenants.get(&doc_id).await?;
    let lead = state
        .store
        .get_lead(&doc_id, &lead_doc_id)
        .await?
        .ok_or(AppError::LeadNotFound)?;

    let message = whatsapp::lead_message(&tenant, &lead);
    let url = whatsapp::send_link(&tenant.profile.whatsapp, &message);
    Ok(Json(WhatsAppLink { message, url }))
}

#[derive(Serialize)]
struct EmbedCode {
    snippet: String,
}

async fn embed_code(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<EmbedCode>, AppError> {
    let tenant = state.tenants.get(&doc_id).await?;
    Ok(Json(EmbedCode {
        snippet: embed::embed_snippet(&state.public_base_url, &tenant.slug),
    }))
}

/// Widget descriptor for a slug. An unknown slug renders nothing.
async fn get_widget(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Response, AppError> {
    match state.tenants.find_by_slug(&slug).await? {
        Some(tenant) => Ok(Json(WidgetDescriptor::for_tenant(&tenant)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Serialize)]
struct SessionView {
    session_id: String,
    transcript: Vec<ChatTurn>,
}

async fn open_session(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<(StatusCode, Json<SessionView>), AppError> {
    let tenant = state
        .tenants
        .find_by_slug(&slug)
        .await?
        .ok_or(AppError::TenantNotFound)?;
    let (session_id, transcript) = state.sessions.open(tenant).await;
    Ok((
        StatusCode::CREATED,
        Json(SessionView {
            session_id,
            transcript,
        }),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.sessions.get(&id).await.ok_or(AppError::SessionNotFound)?;
    let session = session.lock().await;
    Ok(Json(SessionView {
        session_id: session.id.clone(),
        transcript: session.transcript().to_vec(),
    }))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.sessions.close(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::SessionNotFound)
    }
}

#[derive(Deserialize)]
struct SendMessage {
    text: String,
}

/// One visitor turn. Lead capture continues in the background.
async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendMessage>,
) -> Result<Json<ChatTurn>, AppError> {
    let text = body.text.trim();
    if text.is_empty() {
        return Err(AppError::EmptyMessage);
    }

    let session = state.sessions.get(&id).await.ok_or(AppError::SessionNotFound)?;
    let mut session = session.lock().await;
    let outcome = state.driver.send(&mut session, text).await;
    Ok(Json(outcome.reply))
}
