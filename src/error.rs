use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

use crate::fields::FieldError;
use crate::store::StoreError;

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Erro de validação")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Campos de coleta inválidos: {0}")]
    InvalidFields(#[from] FieldError),

    #[error("O slug não pode ser alterado")]
    SlugImmutable,

    #[error("Empresa não encontrada")]
    TenantNotFound,

    #[error("Lead não encontrado")]
    LeadNotFound,

    #[error("Sessão não encontrada")]
    SessionNotFound,

    #[error("A mensagem está vazia")]
    EmptyMessage,

    #[error("Erro de armazenamento: {0}")]
    Store(#[from] StoreError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidFields(_) | AppError::SlugImmutable => {
                StatusCode::BAD_REQUEST
            }
            AppError::EmptyMessage => StatusCode::BAD_REQUEST,
            AppError::TenantNotFound | AppError::LeadNotFound | AppError::SessionNotFound => {
                StatusCode::NOT_FOUND
            }
            AppError::Store(StoreError::SlugTaken(_)) => StatusCode::CONFLICT,
            AppError::Store(StoreError::MissingTenant(_)) => StatusCode::NOT_FOUND,
            AppError::Store(StoreError::MissingLead(_)) => StatusCode::NOT_FOUND,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Validation(errors) => {
                let mut details: HashMap<String, Vec<String>> = HashMap::new();
                for (field, field_errors) in errors.field_errors() {
                    let messages = field_errors
                        .iter()
                        .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
                        .collect();
                    details.insert(field.to_string(), messages);
                }
                let body = Json(json!({
                    "error": "Um ou mais campos são inválidos.",
                    "details": details,
                }));
                return (status, body).into_response();
            }
            AppError::InvalidFields(e) => e.to_string(),
            AppError::Store(StoreError::SlugTaken(slug)) => {
                format!("O slug \"{}\" já está em uso.", slug)
            }
            AppError::Store(StoreError::MissingTenant(_)) => "Empresa não encontrada".to_string(),
            AppError::Store(StoreError::MissingLead(_)) => "Lead não encontrado".to_string(),
            AppError::Store(e) => {
                tracing::error!("Store failure: {}", e);
                "Ocorreu um erro inesperado.".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
