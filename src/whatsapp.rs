//! WhatsApp hand-off of captured leads.

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::fields::{humanize_field_key, resolve_field_keys};
use crate::schema::{Lead, Tenant};

const SEND_URL: &str = "https://api.whatsapp.com/send";

/// Render a lead as the message forwarded to the tenant's WhatsApp.
///
/// Fields follow the tenant's collection order; values under keys the tenant no
/// longer collects come last.
pub fn lead_message(tenant: &Tenant, lead: &Lead) -> String {
    let ordered: Vec<String> = resolve_field_keys(&tenant.profile.collection_fields)
        .map(|keys| keys.into_iter().map(|f| f.key).collect())
        .unwrap_or_default();

    let mut message = format!("Novo Lead de {}:\n\n", tenant.profile.name);
    let known = ordered
        .iter()
        .filter_map(|key| lead.fields.get_key_value(key));
    let rest = lead
        .fields
        .iter()
        .filter(|(key, _)| !ordered.contains(*key));
    for (key, value) in known.chain(rest) {
        message.push_str(&format!("{}: {}\n", humanize_field_key(key), value));
    }
    message.push_str(&format!("\nRecebido em: {}", received_at(&lead.timestamp)));
    message
}

/// `dd/mm/yyyy HH:MM:SS` in UTC; an unparsable timestamp is shown as stored.
fn received_at(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(dt) => dt
            .with_timezone(&Utc)
            .format("%d/%m/%Y %H:%M:%S")
            .to_string(),
        Err(_) => timestamp.to_string(),
    }
}

/// Deep link that opens a chat with `number` pre-filled with `message`.
/// Only the digits of the number are kept.
pub fn send_link(number: &str, message: &str) -> String {
    let phone: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    match Url::parse_with_params(SEND_URL, &[("phone", phone.as_str()), ("text", message)]) {
        Ok(url) => url.to_string(),
        // SEND_URL is a valid absolute URL
        Err(_) => SEND_URL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TenantProfile;

    fn tenant() -> Tenant {
        Tenant {
            doc_id: "t1".into(),
            slug: "onzy".into(),
            profile: TenantProfile {
                name: "Onzy".into(),
                color: "#00ffbb".into(),
                prompt: "p".into(),
                whatsapp: "+55 (11) 99999-8888".into(),
                collection_fields: vec!["Nome Completo".into(), "Telefone".into()],
            },
        }
    }

    fn lead() -> Lead {
        Lead {
            doc_id: "d1".into(),
            id: "lead_1".into(),
            timestamp: "2024-05-03T14:07:09.123Z".into(),
            session_id: Some("ses_1".into()),
            fields: [
                ("nomeCompleto".to_string(), "Maria Silva".to_string()),
                ("telefone".to_string(), "5511988887777".to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_lead_message_layout() {
        assert_eq!(
            lead_message(&tenant(), &lead()),
            "Novo Lead de Onzy:\n\nNome Completo: Maria Silva\nTelefone: 5511988887777\n\nRecebido em: 03/05/2024 14:07:09"
        );
    }

    #[test]
    fn test_lead_message_follows_collection_order() {
        let mut tenant = tenant();
        tenant.profile.collection_fields = vec!["Telefone".into(), "Nome Completo".into()];
        let mut lead = lead();
        lead.fields.insert("email".into(), "maria@onzy.com".into());

        let message = lead_message(&tenant, &lead);
        let body: Vec<&str> = message.lines().skip(2).take(3).collect();
        assert_eq!(
            body,
            vec![
                "Telefone: 5511988887777",
                "Nome Completo: Maria Silva",
                "Email: maria@onzy.com",
            ]
        );
    }

    #[test]
    fn test_received_at_falls_back_to_raw() {
        assert_eq!(received_at("ontem"), "ontem");
    }

    #[test]
    fn test_send_link_keeps_digits_and_encodes_text() {
        let link = send_link(&tenant().profile.whatsapp, "Olá & até\nlogo");
        let url = Url::parse(&link).unwrap();
        assert_eq!(url.host_str(), Some("api.whatsapp.com"));
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(params[0], ("phone".to_string(), "5511999998888".to_string()));
        assert_eq!(params[1], ("text".to_string(), "Olá & até\nlogo".to_string()));
        assert!(!link.contains(' '));
    }
}
