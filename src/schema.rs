//! Domain types shared by the chat, extraction and admin layers.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate an ISO-8601 UTC timestamp for the current time (millisecond precision).
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A tenant-configured assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Storage-assigned id, immutable once assigned.
    pub doc_id: String,
    /// User-chosen slug (e.g. "onzy_company"), unique among tenants.
    pub slug: String,
    #[serde(flatten)]
    pub profile: TenantProfile,
}

/// The editable part of a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantProfile {
    pub name: String,
    pub color: String,
    pub prompt: String,
    pub whatsapp: String,
    /// Human-readable labels, in display/schema order.
    #[serde(default)]
    pub collection_fields: Vec<String>,
}

/// A tenant that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTenant {
    pub slug: String,
    pub profile: TenantProfile,
}

/// Sanitized field key → extracted value.
pub type LeadFields = BTreeMap<String, String>;

/// Structured record extracted from one visitor session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// Storage id.
    pub doc_id: String,
    /// Generated lead id.
    pub id: String,
    /// ISO-8601, refreshed on every merge.
    pub timestamp: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub fields: LeadFields,
}

/// A lead that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLead {
    pub id: String,
    pub timestamp: String,
    pub session_id: Option<String>,
    pub fields: LeadFields,
}

impl NewLead {
    pub fn new(session_id: Option<String>, fields: LeadFields) -> Self {
        Self {
            id: format!("lead_{}", Uuid::new_v4().simple()),
            timestamp: now_iso8601(),
            session_id,
            fields,
        }
    }
}

/// Who authored a visible chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

/// Citation attached to an assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    pub title: String,
}

/// One message of the visible conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<GroundingSource>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text.into(), Vec::new())
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self::new(Sender::Ai, text.into(), Vec::new())
    }

    pub fn ai_with_sources(text: impl Into<String>, sources: Vec<GroundingSource>) -> Self {
        Self::new(Sender::Ai, text.into(), sources)
    }

    fn new(sender: Sender, text: String, sources: Vec<GroundingSource>) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            text,
            sender,
            sources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_utc_iso8601() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_tenant_serializes_flat() {
        let tenant = Tenant {
            doc_id: "doc1".to_string(),
            slug: "onzy".to_string(),
            profile: TenantProfile {
                name: "Onzy".to_string(),
                color: "#00ffbb".to_string(),
                prompt: "Seja gentil".to_string(),
                whatsapp: "5511999998888".to_string(),
                collection_fields: vec!["Nome".to_string()],
            },
        };
        let json = serde_json::to_value(&tenant).unwrap();
        assert_eq!(json["slug"], "onzy");
        assert_eq!(json["name"], "Onzy");
        assert_eq!(json["collection_fields"][0], "Nome");
    }

    #[test]
    fn test_new_lead_ids_are_unique() {
        let a = NewLead::new(None, LeadFields::new());
        let b = NewLead::new(None, LeadFields::new());
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("lead_"));
    }
}
