//! Idempotent per-session lead upsert.
//!
//! A session converges to a single lead record: the first successful extraction
//! creates it, later ones merge into it. Find-then-write is serialized per
//! `(tenant, session)` so overlapping extractions cannot create duplicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::schema::{now_iso8601, Lead, LeadFields, NewLead};
use crate::store::{Store, StoreError};

/// What an upsert did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Lead),
    Merged(Lead),
}

impl UpsertOutcome {
    pub fn lead(&self) -> &Lead {
        match self {
            UpsertOutcome::Created(lead) | UpsertOutcome::Merged(lead) => lead,
        }
    }
}

/// Keyed async mutexes, one per `(tenant, session)` in flight.
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<(String, String), Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(&self, tenant_doc_id: &str, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.lock().await;
        locks
            .entry((tenant_doc_id.to_string(), session_id.to_string()))
            .or_default()
            .clone()
    }

    /// Drop the entry once nobody else holds or waits on it.
    async fn release(&self, tenant_doc_id: &str, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.inner.lock().await;
        let key = (tenant_doc_id.to_string(), session_id.to_string());
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Turn order of one session's captures.
///
/// Captures run detached and may finish out of order. Each one carries a ticket
/// issued in turn order, and a write whose ticket is older than the last one
/// applied for the session is dropped.
#[derive(Debug)]
pub struct CaptureSequence {
    session_id: String,
    issued: u64,
    applied: Arc<AtomicU64>,
}

impl CaptureSequence {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            issued: 0,
            applied: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_ticket(&mut self) -> CaptureTicket {
        self.issued += 1;
        CaptureTicket {
            session_id: self.session_id.clone(),
            seq: self.issued,
            applied: Arc::clone(&self.applied),
        }
    }
}

/// Position of one capture within its session.
#[derive(Debug, Clone)]
pub struct CaptureTicket {
    session_id: String,
    seq: u64,
    applied: Arc<AtomicU64>,
}

impl CaptureTicket {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_superseded(&self) -> bool {
        self.applied.load(Ordering::SeqCst) > self.seq
    }

    fn mark_applied(&self) {
        self.applied.fetch_max(self.seq, Ordering::SeqCst);
    }
}

/// Merge freshly extracted fields into an existing record; new values win per key.
pub fn merge_fields(existing: &LeadFields, incoming: &LeadFields) -> LeadFields {
    let mut merged = existing.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Writes extraction results into the tenant's lead collection.
#[derive(Clone)]
pub struct LeadUpserter {
    store: Arc<dyn Store>,
    locks: SessionLocks,
}

impl LeadUpserter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: SessionLocks::new(),
        }
    }

    /// Create or merge the lead for `session_id`. Without a session id a new record
    /// is always created.
    pub async fn upsert(
        &self,
        tenant_doc_id: &str,
        fields: LeadFields,
        session_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError> {
        let Some(session_id) = session_id else {
            let lead = self
                .store
                .insert_lead(tenant_doc_id, NewLead::new(None, fields))
                .await?;
            info!("Created lead {} without session for tenant {}", lead.id, tenant_doc_id);
            return Ok(UpsertOutcome::Created(lead));
        };

        let lock = self.locks.acquire(tenant_doc_id, session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.upsert_locked(tenant_doc_id, fields, session_id).await
        };
        self.locks.release(tenant_doc_id, session_id, lock).await;
        result
    }

    /// Like [`upsert`](Self::upsert) for a session capture, but drops the write
    /// (`Ok(None)`) when a later turn of the same session has already been applied.
    pub async fn upsert_in_turn(
        &self,
        tenant_doc_id: &str,
        fields: LeadFields,
        ticket: &CaptureTicket,
    ) -> Result<Option<UpsertOutcome>, StoreError> {
        let session_id = ticket.session_id();
        let lock = self.locks.acquire(tenant_doc_id, session_id).await;
        let result = {
            let _guard = lock.lock().await;
            if ticket.is_superseded() {
                debug!(
                    "Dropping capture {} of session {}: a later turn was already saved",
                    ticket.seq, session_id
                );
                Ok(None)
            } else {
                let outcome = self.upsert_locked(tenant_doc_id, fields, session_id).await;
                if outcome.is_ok() {
                    ticket.mark_applied();
                }
                outcome.map(Some)
            }
        };
        self.locks.release(tenant_doc_id, session_id, lock).await;
        result
    }

    async fn upsert_locked(
        &self,
        tenant_doc_id: &str,
        fields: LeadFields,
        session_id: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        match self
            .store
            .find_lead_by_session(tenant_doc_id, session_id)
            .await?
        {
            Some(existing) => {
                let merged = merge_fields(&existing.fields, &fields);
                let lead = self
                    .store
                    .update_lead(tenant_doc_id, &existing.doc_id, merged, now_iso8601())
                    .await?;
                debug!(
                    "Merged {} fields into lead {} (session {})",
                    fields.len(),
                    lead.id,
                    session_id
                );
                Ok(UpsertOutcome::Merged(lead))
            }
            None => {
                let lead = self
                    .store
                    .insert_lead(
                        tenant_doc_id,
                        NewLead::new(Some(session_id.to_string()), fields),
                    )
                    .await?;
                info!(
                    "Created lead {} for session {} (tenant {})",
                    lead.id, session_id, tenant_doc_id
                );
                Ok(UpsertOutcome::Created(lead))
            }
        }
    }
}
