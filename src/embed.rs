//! Public widget surface: what an embedded assistant needs to render itself.

use serde::Serialize;

use crate::chat::greeting;
use crate::schema::Tenant;

/// Everything the widget shows before the first turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetDescriptor {
    pub slug: String,
    pub name: String,
    pub color: String,
    /// First character of the tenant name, used as the avatar.
    pub initial: String,
    pub title: String,
    pub greeting: String,
}

impl WidgetDescriptor {
    pub fn for_tenant(tenant: &Tenant) -> Self {
        let name = tenant.profile.name.clone();
        Self {
            slug: tenant.slug.clone(),
            initial: name.chars().next().map(String::from).unwrap_or_default(),
            title: format!("{} Assistant", name),
            greeting: greeting(tenant),
            color: tenant.profile.color.clone(),
            name,
        }
    }
}

/// Iframe snippet a tenant pastes into their site.
pub fn embed_snippet(public_base_url: &str, slug: &str) -> String {
    let url = format!("{}/embed/{}", public_base_url.trim_end_matches('/'), slug);
    format!(
        r#"<iframe
  src="{url}"
  style="position: fixed; bottom: 20px; right: 20px; border: none; width: 400px; height: 600px; z-index: 9999; border-radius: 12px; box-shadow: 0 10px 25px rgba(0,0,0,0.2);"
  allow="microphone"
></iframe>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TenantProfile;

    fn tenant(name: &str) -> Tenant {
        Tenant {
            doc_id: "t1".into(),
            slug: "onzy".into(),
            profile: TenantProfile {
                name: name.into(),
                color: "#ff0066".into(),
                prompt: "p".into(),
                whatsapp: "5511999998888".into(),
                collection_fields: vec![],
            },
        }
    }

    #[test]
    fn test_descriptor() {
        let widget = WidgetDescriptor::for_tenant(&tenant("Émile Pães"));
        assert_eq!(widget.initial, "É");
        assert_eq!(widget.title, "Émile Pães Assistant");
        assert_eq!(widget.color, "#ff0066");
        assert_eq!(
            widget.greeting,
            "Olá! Eu sou o assistente virtual da Émile Pães. Como posso ajudar?"
        );
    }

    #[test]
    fn test_snippet_uses_base_url() {
        let snippet = embed_snippet("https://chat.onzy.com/", "onzy");
        assert!(snippet.starts_with("<iframe"));
        assert!(snippet.contains(r#"src="https://chat.onzy.com/embed/onzy""#));
    }
}
