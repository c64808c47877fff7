//! Supabase (PostgREST) store.
//!
//! Expected tables:
//!
//! ```sql
//! create table tenants (
//!   doc_id uuid primary key default gen_random_uuid(),
//!   slug text not null unique,
//!   name text not null,
//!   color text not null,
//!   prompt text not null,
//!   whatsapp text not null,
//!   collection_fields jsonb not null default '[]'
//! );
//! create table leads (
//!   doc_id uuid primary key default gen_random_uuid(),
//!   tenant_id uuid not null references tenants(doc_id) on delete cascade,
//!   id text not null,
//!   timestamp text not null,
//!   session_id text,
//!   fields jsonb not null default '{}'
//! );
//! create index leads_session_idx on leads (tenant_id, session_id);
//! ```

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Store, StoreError};
use crate::schema::{Lead, LeadFields, NewLead, NewTenant, Tenant, TenantProfile};

const TENANT_COLUMNS: &str = "doc_id,slug,name,color,prompt,whatsapp,collection_fields";
const LEAD_COLUMNS: &str = "doc_id,id,timestamp,session_id,fields";

/// Postgres error codes surfaced by PostgREST.
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
    schema: String,
}

impl SupabaseStore {
    pub fn new(base_url: &str, service_role_key: &str, schema: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            service_role_key: service_role_key.to_string(),
            schema: schema.to_string(),
        }
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        self.client
            .request(method, &url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Accept-Profile", &self.schema)
            .header("Content-Profile", &self.schema)
    }

    /// Send a request and decode the returned rows.
    async fn rows<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<Vec<T>, StoreError> {
        let resp = request.send().await?;
        let resp = check_status(operation, resp).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            StoreError::Decode(format!(
                "{}: {} ({})",
                operation,
                e,
                text.chars().take(200).collect::<String>()
            ))
        })
    }
}

async fn check_status(operation: &str, resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Http {
        operation: operation.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// `doc_id` columns are `uuid`; anything else would fail the cast (22P02)
/// instead of matching no row.
fn is_doc_id(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

/// Extract the Postgres error code from a PostgREST error body, if any.
fn postgres_code(err: &StoreError) -> Option<String> {
    match err {
        StoreError::Http { body, .. } => serde_json::from_str::<PostgrestError>(body)
            .ok()
            .and_then(|e| e.code),
        _ => None,
    }
}

#[async_trait]
impl Store for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows: Vec<TenantRow> = self
            .rows(
                "list tenants",
                self.request(Method::GET, "tenants")
                    .query(&[("select", TENANT_COLUMNS), ("order", "name.asc")]),
            )
            .await?;
        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    async fn get_tenant(&self, doc_id: &str) -> Result<Option<Tenant>, StoreError> {
        if !is_doc_id(doc_id) {
            return Ok(None);
        }
        let rows: Vec<TenantRow> = self
            .rows(
                "get tenant",
                self.request(Method::GET, "tenants").query(&[
                    ("select", TENANT_COLUMNS.to_string()),
                    ("doc_id", format!("eq.{}", doc_id)),
                ]),
            )
            .await?;
        Ok(rows.into_iter().next().map(Tenant::from))
    }

    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, StoreError> {
        let rows: Vec<TenantRow> = self
            .rows(
                "find tenant",
                self.request(Method::GET, "tenants").query(&[
                    ("select", TENANT_COLUMNS.to_string()),
                    ("slug", format!("eq.{}", slug)),
                    ("limit", "1".to_string()),
                ]),
            )
            .await?;
        Ok(rows.into_iter().next().map(Tenant::from))
    }

    async fn insert_tenant(&self, tenant: NewTenant) -> Result<Tenant, StoreError> {
        let body = TenantWrite {
            slug: Some(&tenant.slug),
            profile: &tenant.profile,
        };

        let result: Result<Vec<TenantRow>, StoreError> = self
            .rows(
                "insert tenant",
                self.request(Method::POST, "tenants")
                    .header("Prefer", "return=representation")
                    .json(&body),
            )
            .await;

        let rows = match result {
            Err(e) if postgres_code(&e).as_deref() == Some(UNIQUE_VIOLATION) => {
                return Err(StoreError::SlugTaken(tenant.slug));
            }
            other => other?,
        };

        let stored = rows
            .into_iter()
            .next()
            .map(Tenant::from)
            .ok_or_else(|| StoreError::Decode("insert tenant returned no row".to_string()))?;
        info!("Inserted tenant '{}' ({})", stored.slug, stored.doc_id);
        Ok(stored)
    }

    async fn update_tenant(
        &self,
        doc_id: &str,
        profile: TenantProfile,
    ) -> Result<Option<Tenant>, StoreError> {
        if !is_doc_id(doc_id) {
            return Ok(None);
        }
        let body = TenantWrite {
            slug: None,
            profile: &profile,
        };

        let rows: Vec<TenantRow> = self
            .rows(
                "update tenant",
                self.request(Method::PATCH, "tenants")
                    .query(&[("doc_id", format!("eq.{}", doc_id))])
                    .header("Prefer", "return=representation")
                    .json(&body),
            )
            .await?;
        Ok(rows.into_iter().next().map(Tenant::from))
    }

    async fn delete_tenant(&self, doc_id: &str) -> Result<Option<usize>, StoreError> {
        if self.get_tenant(doc_id).await?.is_none() {
            return Ok(None);
        }

        // One filtered DELETE removes the whole sub-collection.
        let deleted_leads: Vec<DocIdRow> = self
            .rows(
                "delete leads",
                self.request(Method::DELETE, "leads")
                    .query(&[
                        ("tenant_id", format!("eq.{}", doc_id)),
                        ("select", "doc_id".to_string()),
                    ])
                    .header("Prefer", "return=representation"),
            )
            .await?;

        let deleted: Vec<DocIdRow> = self
            .rows(
                "delete tenant",
                self.request(Method::DELETE, "tenants")
                    .query(&[
                        ("doc_id", format!("eq.{}", doc_id)),
                        ("select", "doc_id".to_string()),
                    ])
                    .header("Prefer", "return=representation"),
            )
            .await?;

        if deleted.is_empty() {
            return Ok(None);
        }
        info!(
            "Deleted tenant {} and {} leads from Supabase",
            doc_id,
            deleted_leads.len()
        );
        Ok(Some(deleted_leads.len()))
    }

    async fn list_leads(&self, tenant_doc_id: &str) -> Result<Vec<Lead>, StoreError> {
        if !is_doc_id(tenant_doc_id) {
            return Ok(Vec::new());
        }
        let rows: Vec<LeadRow> = self
            .rows(
                "list leads",
                self.request(Method::GET, "leads").query(&[
                    ("select", LEAD_COLUMNS.to_string()),
                    ("tenant_id", format!("eq.{}", tenant_doc_id)),
                    ("order", "timestamp.desc".to_string()),
                ]),
            )
            .await?;
        Ok(rows.into_iter().map(Lead::from).collect())
    }

    async fn get_lead(
        &self,
        tenant_doc_id: &str,
        lead_doc_id: &str,
    ) -> Result<Option<Lead>, StoreError> {
        if !is_doc_id(tenant_doc_id) || !is_doc_id(lead_doc_id) {
            return Ok(None);
        }
        let rows: Vec<LeadRow> = self
            .rows(
                "get lead",
                self.request(Method::GET, "leads").query(&[
                    ("select", LEAD_COLUMNS.to_string()),
                    ("tenant_id", format!("eq.{}", tenant_doc_id)),
                    ("doc_id", format!("eq.{}", lead_doc_id)),
                ]),
            )
            .await?;
        Ok(rows.into_iter().next().map(Lead::from))
    }

    async fn find_lead_by_session(
        &self,
        tenant_doc_id: &str,
        session_id: &str,
    ) -> Result<Option<Lead>, StoreError> {
        if !is_doc_id(tenant_doc_id) {
            return Ok(None);
        }
        let rows: Vec<LeadRow> = self
            .rows(
                "find lead",
                self.request(Method::GET, "leads").query(&[
                    ("select", LEAD_COLUMNS.to_string()),
                    ("tenant_id", format!("eq.{}", tenant_doc_id)),
                    ("session_id", format!("eq.{}", session_id)),
                    ("limit", "1".to_string()),
                ]),
            )
            .await?;
        Ok(rows.into_iter().next().map(Lead::from))
    }

    async fn insert_lead(&self, tenant_doc_id: &str, lead: NewLead) -> Result<Lead, StoreError> {
        if !is_doc_id(tenant_doc_id) {
            return Err(StoreError::MissingTenant(tenant_doc_id.to_string()));
        }
        let body = LeadInsert {
            tenant_id: tenant_doc_id,
            id: &lead.id,
            timestamp: &lead.timestamp,
            session_id: lead.session_id.as_deref(),
            fields: &lead.fields,
        };

        let result: Result<Vec<LeadRow>, StoreError> = self
            .rows(
                "insert lead",
                self.request(Method::POST, "leads")
                    .query(&[("select", LEAD_COLUMNS)])
                    .header("Prefer", "return=representation")
                    .json(&body),
            )
            .await;

        let rows = match result {
            Err(e) if postgres_code(&e).as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                return Err(StoreError::MissingTenant(tenant_doc_id.to_string()));
            }
            other => other?,
        };

        debug!("Inserted lead {} for tenant {}", lead.id, tenant_doc_id);
        rows.into_iter()
            .next()
            .map(Lead::from)
            .ok_or_else(|| StoreError::Decode("insert lead returned no row".to_string()))
    }

    async fn update_lead(
        &self,
        tenant_doc_id: &str,
        lead_doc_id: &str,
        fields: LeadFields,
        timestamp: String,
    ) -> Result<Lead, StoreError> {
        if !is_doc_id(tenant_doc_id) || !is_doc_id(lead_doc_id) {
            return Err(StoreError::MissingLead(lead_doc_id.to_string()));
        }
        let body = LeadUpdate {
            timestamp: &timestamp,
            fields: &fields,
        };

        let rows: Vec<LeadRow> = self
            .rows(
                "update lead",
                self.request(Method::PATCH, "leads")
                    .query(&[
                        ("tenant_id", format!("eq.{}", tenant_doc_id)),
                        ("doc_id", format!("eq.{}", lead_doc_id)),
                        ("select", LEAD_COLUMNS.to_string()),
                    ])
                    .header("Prefer", "return=representation")
                    .json(&body),
            )
            .await?;

        debug!("Updated lead {} for tenant {}", lead_doc_id, tenant_doc_id);
        rows.into_iter()
            .next()
            .map(Lead::from)
            .ok_or_else(|| StoreError::MissingLead(lead_doc_id.to_string()))
    }
}

// ============================================================================
// Supabase row types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TenantRow {
    doc_id: String,
    slug: String,
    name: String,
    color: String,
    prompt: String,
    whatsapp: String,
    #[serde(default)]
    collection_fields: Vec<String>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            doc_id: row.doc_id,
            slug: row.slug,
            profile: TenantProfile {
                name: row.name,
                color: row.color,
                prompt: row.prompt,
                whatsapp: row.whatsapp,
                collection_fields: row.collection_fields,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct TenantWrite<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    slug: Option<&'a str>,
    #[serde(flatten)]
    profile: &'a TenantProfile,
}

#[derive(Debug, Deserialize)]
struct LeadRow {
    doc_id: String,
    id: String,
    timestamp: String,
    session_id: Option<String>,
    #[serde(default)]
    fields: LeadFields,
}

impl From<LeadRow> for Lead {
    fn from(row: LeadRow) -> Self {
        Lead {
            doc_id: row.doc_id,
            id: row.id,
            timestamp: row.timestamp,
            session_id: row.session_id,
            fields: row.fields,
        }
    }
}

#[derive(Debug, Serialize)]
struct LeadInsert<'a> {
    tenant_id: &'a str,
    id: &'a str,
    timestamp: &'a str,
    session_id: Option<&'a str>,
    fields: &'a LeadFields,
}

#[derive(Debug, Serialize)]
struct LeadUpdate<'a> {
    timestamp: &'a str,
    fields: &'a LeadFields,
}

#[derive(Debug, Deserialize)]
struct DocIdRow {
    #[allow(dead_code)]
    doc_id: String,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_code_from_conflict_body() {
        let err = StoreError::Http {
            operation: "insert tenant".to_string(),
            status: 409,
            body: r#"{"code":"23505","details":"Key (slug)=(onzy) already exists.","message":"duplicate key"}"#.to_string(),
        };
        assert_eq!(postgres_code(&err).as_deref(), Some(UNIQUE_VIOLATION));

        let err = StoreError::Decode("x".to_string());
        assert_eq!(postgres_code(&err), None);
    }

    #[test]
    fn test_tenant_write_omits_slug_on_update() {
        let profile = TenantProfile {
            name: "Onzy".to_string(),
            color: "#00ffbb".to_string(),
            prompt: "p".to_string(),
            whatsapp: "55".to_string(),
            collection_fields: vec!["Nome".to_string()],
        };
        let json = serde_json::to_value(TenantWrite { slug: None, profile: &profile }).unwrap();
        assert!(json.get("slug").is_none());
        assert_eq!(json["name"], "Onzy");
        assert_eq!(json["collection_fields"][0], "Nome");
    }

    #[tokio::test]
    async fn test_malformed_doc_ids_are_not_found() {
        // Nothing listens on the discard port; a request would fail.
        let store = SupabaseStore::new("http://127.0.0.1:9", "key", "public");
        let tenant_id = uuid::Uuid::new_v4().to_string();

        assert!(is_doc_id(&tenant_id));
        assert!(store.get_tenant("abc").await.unwrap().is_none());
        assert!(store.delete_tenant("abc").await.unwrap().is_none());
        assert!(store.list_leads("abc").await.unwrap().is_empty());
        assert!(store.get_lead(&tenant_id, "lead_1").await.unwrap().is_none());
        assert!(store
            .find_lead_by_session("abc", "ses_1")
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            store.insert_lead("abc", NewLead::new(None, LeadFields::new())).await,
            Err(StoreError::MissingTenant(_))
        ));
        assert!(matches!(
            store
                .update_lead(&tenant_id, "d1", LeadFields::new(), "t".to_string())
                .await,
            Err(StoreError::MissingLead(_))
        ));
    }

    #[test]
    fn test_lead_row_without_session() {
        let row: LeadRow = serde_json::from_str(
            r#"{"doc_id":"d1","id":"lead_1","timestamp":"2025-01-01T00:00:00.000Z","session_id":null,"fields":{"nome":"Maria"}}"#,
        )
        .unwrap();
        let lead = Lead::from(row);
        assert!(lead.session_id.is_none());
        assert_eq!(lead.fields["nome"], "Maria");
    }
}
