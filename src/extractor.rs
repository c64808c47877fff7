//! Lead extraction pipeline.
//!
//! After each answered turn the recent conversation is re-scanned with a second,
//! schema-constrained model call, and whatever fields the model found are merged
//! into the session's lead. The pipeline is best-effort: it runs detached from the
//! visible reply and every failure ends at the task boundary.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ExtractionSettings;
use crate::fields::{ExtractionSchema, FieldError};
use crate::leads::{CaptureTicket, LeadUpserter, UpsertOutcome};
use crate::openrouter::{LlmClient, Message, Role};
use crate::schema::{LeadFields, Tenant};

const SCHEMA_NAME: &str = "lead_fields";

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?i:json)?\s*([\s\S]*?)\s*```").expect("fence pattern is valid")
});

/// Why a capture attempt stopped before calling the model.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoCollectionFields,
    InvalidFields(FieldError),
    NotEnoughTurns,
}

/// Result of one capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Skipped(SkipReason),
    NothingExtracted,
    /// A later turn of the same session was saved first.
    Superseded,
    Saved(UpsertOutcome),
}

/// Trailing window of the conversation used as extraction input, or `None` when
/// there is not yet a complete exchange to look at.
pub fn select_window(history: &[Message], settings: ExtractionSettings) -> Option<&[Message]> {
    let start = history.len().saturating_sub(settings.window);
    let window = &history[start..];
    if window.len() < settings.min_turns {
        None
    } else {
        Some(window)
    }
}

/// Render turns as `Cliente: ...` / `Assistente: ...` lines.
pub fn render_transcript(turns: &[Message]) -> String {
    turns
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let speaker = match m.role {
                Role::User => "Cliente",
                _ => "Assistente",
            };
            format!("{}: {}", speaker, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn extraction_prompt(transcript: &str) -> String {
    format!(
        r#"Com base na conversa a seguir, extraia as informações solicitadas.
Se a informação para um campo específico não for encontrada, omita esse campo do objeto JSON final. Não invente valores.

Conversa:
---
{}
---"#,
        transcript
    )
}

/// Strip an optional fenced block and parse the rest as a JSON object.
///
/// Returns `Ok(None)` when there is nothing left to parse.
pub fn unwrap_response(raw: &str) -> Result<Option<Map<String, Value>>> {
    let trimmed = raw.trim();
    let inner = FENCED_BLOCK
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed)
        .trim();

    if inner.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(inner).with_context(|| {
        format!(
            "Invalid JSON in extraction response: {}",
            inner.chars().take(200).collect::<String>()
        )
    })?;

    match value {
        Value::Object(map) => Ok(Some(map)),
        other => anyhow::bail!("Extraction response is not a JSON object: {}", other),
    }
}

/// Keep only schema keys with a usable value. Strings are trimmed and dropped when
/// empty; numbers and booleans are kept as text.
pub fn collect_fields(extracted: Map<String, Value>, schema: &ExtractionSchema) -> LeadFields {
    let mut fields = LeadFields::new();
    for (key, value) in extracted {
        if !schema.contains_key(&key) {
            debug!("Ignoring field '{}' outside the tenant schema", key);
            continue;
        }
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        if !text.is_empty() {
            fields.insert(key, text);
        }
    }
    fields
}

/// Runs extraction for a tenant conversation and persists the result.
pub struct LeadExtractor {
    llm: Arc<dyn LlmClient>,
    upserter: LeadUpserter,
    settings: ExtractionSettings,
}

impl LeadExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, upserter: LeadUpserter, settings: ExtractionSettings) -> Self {
        Self {
            llm,
            upserter,
            settings,
        }
    }

    /// Run one capture attempt over a snapshot of the conversation history.
    ///
    /// With a ticket the lead is the session's record and older turns never
    /// overwrite newer ones; without one a new record is created.
    pub async fn capture(
        &self,
        tenant: &Tenant,
        history: &[Message],
        ticket: Option<&CaptureTicket>,
    ) -> Result<CaptureOutcome> {
        if tenant.profile.collection_fields.is_empty() {
            return Ok(CaptureOutcome::Skipped(SkipReason::NoCollectionFields));
        }

        let schema = match ExtractionSchema::build(&tenant.profile.collection_fields) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Tenant {} has unusable collection fields: {}", tenant.slug, e);
                return Ok(CaptureOutcome::Skipped(SkipReason::InvalidFields(e)));
            }
        };

        let Some(window) = select_window(history, self.settings) else {
            return Ok(CaptureOutcome::Skipped(SkipReason::NotEnoughTurns));
        };

        let prompt = extraction_prompt(&render_transcript(window));
        debug!(
            "Calling LLM for lead extraction ({} turns, {} fields)",
            window.len(),
            schema.fields.len()
        );

        let raw = self
            .llm
            .complete_structured(vec![Message::user(prompt)], SCHEMA_NAME, schema.schema.clone())
            .await
            .context("Lead extraction call failed")?;

        let Some(extracted) = unwrap_response(&raw)? else {
            debug!("Lead extraction returned empty text");
            return Ok(CaptureOutcome::NothingExtracted);
        };

        let fields = collect_fields(extracted, &schema);
        if fields.is_empty() {
            return Ok(CaptureOutcome::NothingExtracted);
        }

        let outcome = match ticket {
            Some(ticket) => self.upserter.upsert_in_turn(&tenant.doc_id, fields, ticket).await,
            None => self.upserter.upsert(&tenant.doc_id, fields, None).await.map(Some),
        }
        .context("Failed to save lead")?;

        let Some(outcome) = outcome else {
            return Ok(CaptureOutcome::Superseded);
        };

        info!(
            "Lead captured for tenant {}: {} fields",
            tenant.slug,
            outcome.lead().fields.len()
        );
        Ok(CaptureOutcome::Saved(outcome))
    }

    /// Fire-and-forget capture. The handle may be dropped; errors are logged here
    /// and never reach the caller.
    pub fn spawn_capture(
        self: &Arc<Self>,
        tenant: Tenant,
        history: Vec<Message>,
        ticket: Option<CaptureTicket>,
    ) -> JoinHandle<()> {
        let extractor = Arc::clone(self);
        tokio::spawn(async move {
            match extractor
                .capture(&tenant, &history, ticket.as_ref())
                .await
            {
                Ok(outcome) => debug!("Lead capture for tenant {}: {:?}", tenant.slug, outcome),
                Err(e) => warn!("Could not capture lead for tenant {}: {:#}", tenant.slug, e),
            }
        })
    }
}
