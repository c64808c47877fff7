//! Tenant administration: validated create/update/delete over the store.

use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use validator::{Validate, ValidationError};

use crate::chat::SessionRegistry;
use crate::error::AppError;
use crate::fields::resolve_field_keys;
use crate::schema::{NewTenant, Tenant, TenantProfile};
use crate::store::Store;

pub const DEFAULT_COLOR: &str = "#00ffbb";

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

fn validate_slug(slug: &str) -> Result<(), ValidationError> {
    let ok = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !ok {
        let mut err = ValidationError::new("slug");
        err.message =
            Some("Use apenas letras minúsculas, números, '_' ou '-' (ex: minha_empresa).".into());
        return Err(err);
    }
    Ok(())
}

fn validate_color(color: &str) -> Result<(), ValidationError> {
    let hex = color.strip_prefix('#').unwrap_or("");
    let ok = matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !ok {
        let mut err = ValidationError::new("color");
        err.message = Some("A cor deve estar no formato hexadecimal (ex: #00ffbb).".into());
        return Err(err);
    }
    Ok(())
}

fn validate_whatsapp(number: &str) -> Result<(), ValidationError> {
    if !number.chars().any(|c| c.is_ascii_digit()) {
        let mut err = ValidationError::new("whatsapp");
        err.message = Some("Informe o número do WhatsApp (ex: 5511999998888).".into());
        return Err(err);
    }
    Ok(())
}

/// Tenant form as submitted by the admin console.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TenantInput {
    #[validate(custom(function = "validate_slug"))]
    pub slug: String,

    #[validate(length(min = 1, message = "O nome é obrigatório."))]
    pub name: String,

    #[serde(default = "default_color")]
    #[validate(custom(function = "validate_color"))]
    pub color: String,

    #[validate(length(min = 1, message = "O prompt de sistema é obrigatório."))]
    pub prompt: String,

    #[validate(custom(function = "validate_whatsapp"))]
    pub whatsapp: String,

    #[validate(length(min = 1, message = "Informe ao menos um campo de coleta."))]
    #[serde(default)]
    pub collection_fields: Vec<String>,
}

impl TenantInput {
    /// Trim every value and drop blank collection fields.
    fn normalized(mut self) -> Self {
        self.slug = self.slug.trim().to_string();
        self.name = self.name.trim().to_string();
        self.color = self.color.trim().to_string();
        self.prompt = self.prompt.trim().to_string();
        self.whatsapp = self.whatsapp.trim().to_string();
        self.collection_fields = normalize_fields(self.collection_fields);
        self
    }

    fn into_profile(self) -> TenantProfile {
        TenantProfile {
            name: self.name,
            color: self.color,
            prompt: self.prompt,
            whatsapp: self.whatsapp,
            collection_fields: self.collection_fields,
        }
    }
}

/// Partial edit of a tenant; absent values keep their current setting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantPatch {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub color: Option<String>,
    pub prompt: Option<String>,
    pub whatsapp: Option<String>,
    pub collection_fields: Option<Vec<String>>,
}

pub fn normalize_fields(fields: Vec<String>) -> Vec<String> {
    fields
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

#[derive(Clone)]
pub struct TenantService {
    store: Arc<dyn Store>,
    sessions: SessionRegistry,
}

impl TenantService {
    pub fn new(store: Arc<dyn Store>, sessions: SessionRegistry) -> Self {
        Self { store, sessions }
    }

    pub async fn list(&self) -> Result<Vec<Tenant>, AppError> {
        Ok(self.store.list_tenants().await?)
    }

    pub async fn get(&self, doc_id: &str) -> Result<Tenant, AppError> {
        self.store
            .get_tenant(doc_id)
            .await?
            .ok_or(AppError::TenantNotFound)
    }

    pub async fn find_by_slug(&self, slug: &str) -> Result<Option<Tenant>, AppError> {
        Ok(self.store.find_tenant_by_slug(slug).await?)
    }

    pub async fn create(&self, input: TenantInput) -> Result<Tenant, AppError> {
        let input = input.normalized();
        input.validate()?;
        resolve_field_keys(&input.collection_fields)?;

        let slug = input.slug.clone();
        let tenant = self
            .store
            .insert_tenant(NewTenant {
                slug,
                profile: input.into_profile(),
            })
            .await?;
        info!("Created tenant {} ({})", tenant.slug, tenant.doc_id);
        Ok(tenant)
    }

    /// Merge `patch` into the stored tenant. The slug cannot change.
    pub async fn update(&self, doc_id: &str, patch: TenantPatch) -> Result<Tenant, AppError> {
        let current = self.get(doc_id).await?;

        if let Some(slug) = &patch.slug {
            if slug.trim() != current.slug {
                return Err(AppError::SlugImmutable);
            }
        }

        let profile = current.profile;
        let input = TenantInput {
            slug: current.slug,
            name: patch.name.unwrap_or(profile.name),
            color: patch.color.unwrap_or(profile.color),
            prompt: patch.prompt.unwrap_or(profile.prompt),
            whatsapp: patch.whatsapp.unwrap_or(profile.whatsapp),
            collection_fields: patch.collection_fields.unwrap_or(profile.collection_fields),
        }
        .normalized();
        input.validate()?;
        resolve_field_keys(&input.collection_fields)?;

        let tenant = self
            .store
            .update_tenant(doc_id, input.into_profile())
            .await?
            .ok_or(AppError::TenantNotFound)?;
        self.sessions.discard_tenant(doc_id).await;
        info!("Updated tenant {} ({})", tenant.slug, tenant.doc_id);
        Ok(tenant)
    }

    /// Delete a tenant with all of its leads.
    pub async fn delete(&self, doc_id: &str) -> Result<usize, AppError> {
        let removed = self
            .store
            .delete_tenant(doc_id)
            .await?
            .ok_or(AppError::TenantNotFound)?;
        self.sessions.discard_tenant(doc_id).await;
        info!("Deleted tenant {} and {} leads", doc_id, removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldError;
    use crate::schema::NewLead;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreError;

    fn input(slug: &str) -> TenantInput {
        TenantInput {
            slug: slug.to_string(),
            name: "Onzy".to_string(),
            color: DEFAULT_COLOR.to_string(),
            prompt: "Você é o assistente da Onzy.".to_string(),
            whatsapp: "5511999998888".to_string(),
            collection_fields: vec!["Nome Completo".to_string(), "Telefone".to_string()],
        }
    }

    fn service() -> (Arc<MemoryStore>, SessionRegistry, TenantService) {
        let store = Arc::new(MemoryStore::new());
        let sessions = SessionRegistry::new();
        let service = TenantService::new(store.clone(), sessions.clone());
        (store, sessions, service)
    }

    #[tokio::test]
    async fn test_create_normalizes_fields() {
        let (_, _, service) = service();
        let mut form = input("onzy");
        form.collection_fields = vec![" Nome ".into(), "".into(), "  ".into(), "Email".into()];
        let tenant = service.create(form).await.unwrap();
        assert_eq!(tenant.profile.collection_fields, vec!["Nome", "Email"]);
        assert_eq!(service.get(&tenant.doc_id).await.unwrap(), tenant);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_form() {
        let (_, _, service) = service();

        let mut form = input("Minha Empresa");
        form.color = "verde".into();
        let err = service.create(form).await.unwrap_err();
        let AppError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        let fields = errors.field_errors();
        assert!(fields.contains_key("slug"));
        assert!(fields.contains_key("color"));

        let mut form = input("onzy");
        form.collection_fields = vec!["  ".into()];
        assert!(matches!(
            service.create(form).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_colliding_fields() {
        let (_, _, service) = service();
        let mut form = input("onzy");
        form.collection_fields = vec!["Nome completo".into(), "Nome-Completo".into()];
        assert!(matches!(
            service.create(form).await,
            Err(AppError::InvalidFields(FieldError::Collision { .. }))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_slug_conflicts() {
        let (_, _, service) = service();
        service.create(input("onzy")).await.unwrap();
        let err = service.create(input("onzy")).await.unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::SlugTaken(_))));
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_update_merges_and_keeps_slug() {
        let (_, _, service) = service();
        let tenant = service.create(input("onzy")).await.unwrap();

        let updated = service
            .update(
                &tenant.doc_id,
                TenantPatch {
                    name: Some("Onzy Company".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.slug, "onzy");
        assert_eq!(updated.profile.name, "Onzy Company");
        assert_eq!(updated.profile.prompt, tenant.profile.prompt);

        let err = service
            .update(
                &tenant.doc_id,
                TenantPatch {
                    slug: Some("outra".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SlugImmutable));
    }

    #[tokio::test]
    async fn test_update_discards_live_sessions() {
        let (_, sessions, service) = service();
        let tenant = service.create(input("onzy")).await.unwrap();
        let (id, _) = sessions.open(tenant.clone()).await;

        service
            .update(
                &tenant.doc_id,
                TenantPatch {
                    prompt: Some("Novo prompt".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(sessions.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_edits_discard_sessions_mid_turn() {
        let (_, sessions, service) = service();
        let tenant = service.create(input("onzy")).await.unwrap();

        let (updated_id, _) = sessions.open(tenant.clone()).await;
        let session = sessions.get(&updated_id).await.unwrap();
        let busy = session.lock().await;
        service
            .update(
                &tenant.doc_id,
                TenantPatch {
                    prompt: Some("Novo prompt".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(sessions.get(&updated_id).await.is_none());
        drop(busy);

        let (deleted_id, _) = sessions.open(tenant.clone()).await;
        let session = sessions.get(&deleted_id).await.unwrap();
        let busy = session.lock().await;
        service.delete(&tenant.doc_id).await.unwrap();
        assert!(sessions.get(&deleted_id).await.is_none());
        assert_eq!(sessions.len().await, 0);
        drop(busy);
    }

    #[tokio::test]
    async fn test_delete_cascades_leads() {
        let (store, sessions, service) = service();
        let tenant = service.create(input("onzy")).await.unwrap();
        store
            .insert_lead(&tenant.doc_id, NewLead::new(Some("s".into()), Default::default()))
            .await
            .unwrap();
        sessions.open(tenant.clone()).await;

        assert_eq!(service.delete(&tenant.doc_id).await.unwrap(), 1);
        assert!(matches!(
            service.get(&tenant.doc_id).await,
            Err(AppError::TenantNotFound)
        ));
        assert!(store.list_leads(&tenant.doc_id).await.unwrap().is_empty());
        assert_eq!(sessions.len().await, 0);
        assert!(matches!(
            service.delete(&tenant.doc_id).await,
            Err(AppError::TenantNotFound)
        ));
    }
}
