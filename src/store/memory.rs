//! In-memory store, used when Supabase is not configured and in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::schema::{Lead, LeadFields, NewLead, NewTenant, Tenant, TenantProfile};

#[derive(Debug, Default)]
struct Inner {
    tenants: HashMap<String, Tenant>,
    /// tenant doc_id → leads owned by that tenant
    leads: HashMap<String, Vec<Lead>>,
}

/// Tenants and leads held in process memory. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_doc_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let inner = self.inner.read().await;
        let mut tenants: Vec<Tenant> = inner.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.profile.name.cmp(&b.profile.name));
        Ok(tenants)
    }

    async fn get_tenant(&self, doc_id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.inner.read().await.tenants.get(doc_id).cloned())
    }

    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tenants.values().find(|t| t.slug == slug).cloned())
    }

    async fn insert_tenant(&self, tenant: NewTenant) -> Result<Tenant, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tenants.values().any(|t| t.slug == tenant.slug) {
            return Err(StoreError::SlugTaken(tenant.slug));
        }

        let stored = Tenant {
            doc_id: new_doc_id(),
            slug: tenant.slug,
            profile: tenant.profile,
        };
        inner.tenants.insert(stored.doc_id.clone(), stored.clone());
        tracing::debug!("MemoryStore: inserted tenant '{}' ({})", stored.slug, stored.doc_id);
        Ok(stored)
    }

    async fn update_tenant(
        &self,
        doc_id: &str,
        profile: TenantProfile,
    ) -> Result<Option<Tenant>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.tenants.get_mut(doc_id).map(|tenant| {
            tenant.profile = profile;
            tenant.clone()
        }))
    }

    async fn delete_tenant(&self, doc_id: &str) -> Result<Option<usize>, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tenants.remove(doc_id).is_none() {
            return Ok(None);
        }
        let removed = inner.leads.remove(doc_id).map(|l| l.len()).unwrap_or(0);
        tracing::debug!("MemoryStore: deleted tenant {} and {} leads", doc_id, removed);
        Ok(Some(removed))
    }

    async fn list_leads(&self, tenant_doc_id: &str) -> Result<Vec<Lead>, StoreError> {
        let inner = self.inner.read().await;
        let mut leads = inner.leads.get(tenant_doc_id).cloned().unwrap_or_default();
        leads.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(leads)
    }

    async fn get_lead(
        &self,
        tenant_doc_id: &str,
        lead_doc_id: &str,
    ) -> Result<Option<Lead>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .leads
            .get(tenant_doc_id)
            .and_then(|leads| leads.iter().find(|l| l.doc_id == lead_doc_id))
            .cloned())
    }

    async fn find_lead_by_session(
        &self,
        tenant_doc_id: &str,
        session_id: &str,
    ) -> Result<Option<Lead>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .leads
            .get(tenant_doc_id)
            .and_then(|leads| {
                leads
                    .iter()
                    .find(|l| l.session_id.as_deref() == Some(session_id))
            })
            .cloned())
    }

    async fn insert_lead(&self, tenant_doc_id: &str, lead: NewLead) -> Result<Lead, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tenants.contains_key(tenant_doc_id) {
            return Err(StoreError::MissingTenant(tenant_doc_id.to_string()));
        }

        let stored = Lead {
            doc_id: new_doc_id(),
            id: lead.id,
            timestamp: lead.timestamp,
            session_id: lead.session_id,
            fields: lead.fields,
        };
        inner
            .leads
            .entry(tenant_doc_id.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn update_lead(
        &self,
        tenant_doc_id: &str,
        lead_doc_id: &str,
        fields: LeadFields,
        timestamp: String,
    ) -> Result<Lead, StoreError> {
        let mut inner = self.inner.write().await;
        let lead = inner
            .leads
            .get_mut(tenant_doc_id)
            .and_then(|leads| leads.iter_mut().find(|l| l.doc_id == lead_doc_id))
            .ok_or_else(|| StoreError::MissingLead(lead_doc_id.to_string()))?;

        lead.fields = fields;
        lead.timestamp = timestamp;
        Ok(lead.clone())
    }
}
