//! Document storage for tenants and their leads.
//!
//! Defines the [`Store`] trait so the Supabase backend and the in-memory backend
//! can be swapped from configuration.

pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use thiserror::Error;

use crate::schema::{Lead, LeadFields, NewLead, NewTenant, Tenant, TenantProfile};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Storage {operation} failed: {status} - {body}")]
    Http {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("Storage returned an unexpected payload: {0}")]
    Decode(String),
    #[error("Slug \"{0}\" is already in use")]
    SlugTaken(String),
    #[error("Tenant {0} does not exist")]
    MissingTenant(String),
    #[error("Lead {0} does not exist")]
    MissingLead(String),
}

/// Async storage backend implemented by each provider.
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;
    async fn get_tenant(&self, doc_id: &str) -> Result<Option<Tenant>, StoreError>;
    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, StoreError>;
    /// Fails with [`StoreError::SlugTaken`] when the slug already exists.
    async fn insert_tenant(&self, tenant: NewTenant) -> Result<Tenant, StoreError>;
    async fn update_tenant(
        &self,
        doc_id: &str,
        profile: TenantProfile,
    ) -> Result<Option<Tenant>, StoreError>;
    /// Delete a tenant and every lead it owns. Returns the number of leads removed,
    /// or `None` when the tenant did not exist.
    async fn delete_tenant(&self, doc_id: &str) -> Result<Option<usize>, StoreError>;

    /// Leads of a tenant, newest timestamp first.
    async fn list_leads(&self, tenant_doc_id: &str) -> Result<Vec<Lead>, StoreError>;
    async fn get_lead(&self, tenant_doc_id: &str, lead_doc_id: &str)
        -> Result<Option<Lead>, StoreError>;
    async fn find_lead_by_session(
        &self,
        tenant_doc_id: &str,
        session_id: &str,
    ) -> Result<Option<Lead>, StoreError>;
    /// Fails with [`StoreError::MissingTenant`] when the owner is gone.
    async fn insert_lead(&self, tenant_doc_id: &str, lead: NewLead) -> Result<Lead, StoreError>;
    /// Replace a lead's fields and timestamp.
    async fn update_lead(
        &self,
        tenant_doc_id: &str,
        lead_doc_id: &str,
        fields: LeadFields,
        timestamp: String,
    ) -> Result<Lead, StoreError>;
}
