//! Collection-field keys and the structured-output schema built from them.
//!
//! Tenants author free-text labels ("Nome Completo", "Telefone (WhatsApp)").
//! The same sanitized key is used when building the extraction schema, when
//! filtering the model's answer and when storing lead fields.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("O campo \"{0}\" não contém letras ou números")]
    Empty(String),
    #[error("Os campos \"{first}\" e \"{second}\" geram a mesma chave \"{key}\"")]
    Collision {
        key: String,
        first: String,
        second: String,
    },
}

/// A collection field: the tenant's label and its sanitized key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldKey {
    pub key: String,
    pub label: String,
}

/// Map a human-readable label to a camelCase key made of letters and digits.
///
/// Latin diacritics are folded to ASCII, letters of other scripts are kept as
/// they are, and everything else is dropped. Tokens are split on whitespace and
/// on lower→upper case boundaries, so an already sanitized key maps to itself.
pub fn sanitize_field_key(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .filter_map(|c| {
            let c = fold_diacritic(c);
            if c.is_alphanumeric() || c.is_whitespace() {
                Some(c)
            } else {
                None
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .flat_map(split_case_boundaries)
        .enumerate()
        .map(|(index, token)| {
            if index == 0 {
                token.to_lowercase()
            } else {
                capitalize(token)
            }
        })
        .collect()
}

/// Resolve every label to its key, rejecting empty keys and collisions.
pub fn resolve_field_keys(labels: &[String]) -> Result<Vec<FieldKey>, FieldError> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut keys = Vec::with_capacity(labels.len());

    for label in labels {
        let key = sanitize_field_key(label);
        if key.is_empty() {
            return Err(FieldError::Empty(label.clone()));
        }
        if let Some(first) = seen.get(&key) {
            return Err(FieldError::Collision {
                key,
                first: first.to_string(),
                second: label.clone(),
            });
        }
        seen.insert(key.clone(), label);
        keys.push(FieldKey {
            key,
            label: label.clone(),
        });
    }

    Ok(keys)
}

/// Structured-output schema for lead extraction.
#[derive(Debug, Clone)]
pub struct ExtractionSchema {
    pub fields: Vec<FieldKey>,
    pub schema: Value,
}

impl ExtractionSchema {
    /// Build one optional string property per label, keyed by its sanitized form.
    pub fn build(labels: &[String]) -> Result<Self, FieldError> {
        let fields = resolve_field_keys(labels)?;

        let mut properties = Map::new();
        for field in &fields {
            properties.insert(
                field.key.clone(),
                json!({
                    "type": "string",
                    "description": format!("Extraia o valor para o campo \"{}\" da conversa.", field.label),
                }),
            );
        }

        // No "required" list: the model must be able to omit what it cannot find.
        let schema = json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": false,
        });

        Ok(Self { fields, schema })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.iter().any(|f| f.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Turn a camelCase key back into words for display ("nomeCompleto" → "Nome Completo").
pub fn humanize_field_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if i == 0 {
            out.extend(c.to_uppercase());
        } else {
            if c.is_uppercase() {
                out.push(' ');
            }
            out.push(c);
        }
    }
    out
}

fn split_case_boundaries(word: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;

    for (i, c) in word.char_indices() {
        if let Some(p) = prev {
            if c.is_uppercase() && (p.is_lowercase() || p.is_numeric()) {
                parts.push(&word[start..i]);
                start = i;
            }
        }
        prev = Some(c);
    }
    parts.push(&word[start..]);
    parts
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => {
            let mut out: String = first.to_uppercase().collect();
            out.push_str(&chars.as_str().to_lowercase());
            out
        }
        None => String::new(),
    }
}

fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        'ñ' => 'n',
        'Ñ' => 'N',
        'º' => 'o',
        'ª' => 'a',
        other => other,
    }
}
