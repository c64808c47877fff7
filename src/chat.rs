//! Per-session conversations and the turn driver.
//!
//! A [`ChatSession`] is opened when a widget mounts and holds the visible
//! transcript plus the model conversation, which is only created on the first
//! turn. Each turn is answered synchronously; lead capture is dispatched after the
//! reply is recorded and runs on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::extractor::LeadExtractor;
use crate::leads::CaptureSequence;
use crate::openrouter::{LlmClient, LlmError, Message};
use crate::schema::{ChatTurn, Tenant};

pub const GENERIC_ERROR_MESSAGE: &str =
    "Desculpe, ocorreu um erro ao processar sua solicitação. Por favor, tente novamente.";
pub const QUOTA_ERROR_MESSAGE: &str =
    "O limite de uso da API foi atingido. Por favor, tente novamente mais tarde.";
pub const MISSING_CONFIG_MESSAGE: &str = "A configuração da API do modelo não foi encontrada. Verifique se a chave de API (OPENROUTER_API_KEY) está configurada corretamente no ambiente.";

pub fn greeting(tenant: &Tenant) -> String {
    format!(
        "Olá! Eu sou o assistente virtual da {}. Como posso ajudar?",
        tenant.profile.name
    )
}

/// Map a model failure to the fixed text shown to the visitor.
pub fn user_facing_error(err: &LlmError) -> &'static str {
    if err.is_quota_exhausted() {
        QUOTA_ERROR_MESSAGE
    } else {
        GENERIC_ERROR_MESSAGE
    }
}

/// The model side of a session, seeded with the tenant prompt.
#[derive(Debug, Clone)]
pub struct ModelConversation {
    system_prompt: String,
    history: Vec<Message>,
}

impl ModelConversation {
    fn new(system_prompt: &str) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            history: Vec::new(),
        }
    }

    /// Completed user/assistant turns, oldest first.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    fn request(&self, user_text: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(Message::user(user_text));
        messages
    }

    fn record(&mut self, user_text: &str, reply: &str) {
        self.history.push(Message::user(user_text));
        self.history.push(Message::assistant(reply));
    }
}

/// One visitor's conversation with a tenant assistant.
#[derive(Debug)]
pub struct ChatSession {
    pub id: String,
    pub tenant: Tenant,
    transcript: Vec<ChatTurn>,
    conversation: Option<ModelConversation>,
    captures: CaptureSequence,
    last_active: Instant,
}

impl ChatSession {
    pub fn new(tenant: Tenant) -> Self {
        let id = format!("ses_{}", Uuid::new_v4().simple());
        let transcript = vec![ChatTurn::ai(greeting(&tenant))];
        Self {
            captures: CaptureSequence::new(id.clone()),
            id,
            tenant,
            transcript,
            conversation: None,
            last_active: Instant::now(),
        }
    }

    pub fn transcript(&self) -> &[ChatTurn] {
        &self.transcript
    }

    pub fn conversation(&self) -> Option<&ModelConversation> {
        self.conversation.as_ref()
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// Result of one visitor turn.
#[derive(Debug)]
pub struct TurnOutcome {
    pub reply: ChatTurn,
    /// Detached lead capture, if one was dispatched.
    pub capture: Option<JoinHandle<()>>,
}

/// Answers visitor turns and dispatches lead capture.
#[derive(Clone)]
pub struct TurnDriver {
    llm: Option<Arc<dyn LlmClient>>,
    extractor: Option<Arc<LeadExtractor>>,
}

impl TurnDriver {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, extractor: Option<Arc<LeadExtractor>>) -> Self {
        Self { llm, extractor }
    }

    /// Handle one visitor message. Never fails: model errors become fixed replies.
    pub async fn send(&self, session: &mut ChatSession, text: &str) -> TurnOutcome {
        session.touch();
        session.transcript.push(ChatTurn::user(text));

        let Some(llm) = &self.llm else {
            error!("OPENROUTER_API_KEY not set; chat is disabled");
            return Self::finish(session, ChatTurn::ai(MISSING_CONFIG_MESSAGE), None);
        };

        let conversation = session
            .conversation
            .get_or_insert_with(|| ModelConversation::new(&session.tenant.profile.prompt));

        let completion = match llm.complete(conversation.request(text)).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!("Chat call failed for session {}: {}", session.id, e);
                return Self::finish(session, ChatTurn::ai(user_facing_error(&e)), None);
            }
        };

        conversation.record(text, &completion.content);
        let history = conversation.history().to_vec();
        debug!(
            "Session {} answered ({} turns in history)",
            session.id,
            history.len()
        );

        let capture = self.extractor.as_ref().map(|extractor| {
            let ticket = session.captures.next_ticket();
            extractor.spawn_capture(session.tenant.clone(), history, Some(ticket))
        });

        Self::finish(
            session,
            ChatTurn::ai_with_sources(completion.content, completion.sources),
            capture,
        )
    }

    fn finish(
        session: &mut ChatSession,
        reply: ChatTurn,
        capture: Option<JoinHandle<()>>,
    ) -> TurnOutcome {
        session.transcript.push(reply.clone());
        TurnOutcome { reply, capture }
    }
}

/// A live session and the tenant it is bound to, readable without locking the
/// session itself.
struct SessionEntry {
    tenant_doc_id: String,
    session: Arc<Mutex<ChatSession>>,
}

/// Live sessions keyed by session id. Each session sits behind its own lock so
/// turns within a session are serialized while sessions proceed independently.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session and return its id with the initial transcript.
    pub async fn open(&self, tenant: Tenant) -> (String, Vec<ChatTurn>) {
        let session = ChatSession::new(tenant);
        let id = session.id.clone();
        let transcript = session.transcript.clone();
        let entry = SessionEntry {
            tenant_doc_id: session.tenant.doc_id.clone(),
            session: Arc::new(Mutex::new(session)),
        };
        info!("Opened chat session {} for tenant {}", id, entry.tenant_doc_id);
        self.sessions.write().await.insert(id.clone(), entry);
        (id, transcript)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<ChatSession>>> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub async fn close(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Drop every session bound to a tenant (after it was edited or deleted).
    /// A turn already in flight finishes on its own handle but the session is no
    /// longer reachable.
    pub async fn discard_tenant(&self, tenant_doc_id: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.tenant_doc_id != tenant_doc_id);
        let removed = before - sessions.len();
        if removed > 0 {
            info!("Discarded {} sessions of tenant {}", removed, tenant_doc_id);
        }
        removed
    }

    /// Drop sessions idle for longer than `max_idle`. A session whose lock is held
    /// is in the middle of a turn, hence not idle.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| match entry.session.try_lock() {
            Ok(s) => s.last_active.elapsed() <= max_idle,
            Err(_) => true,
        });
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
