use crate::errors::{AppError, AppResult};
use crate::models::{FieldKind, FormDefinition, Lead, LeadStatus};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use uuid::Uuid;

static EMAIL_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex")
});

static PHONE_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"^\+?[0-9][0-9 ().-]{6,18}$").expect("valid phone regex")
});

pub(crate) fn is_valid_email(raw: &str) -> bool {
    EMAIL_RE.is_match(raw)
}

/// JSON Schema for a form definition. Unknown keys are rejected so a stale
/// client cannot smuggle fields the form no longer has.
pub fn schema_for(definition: &FormDefinition) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for field in &definition.fields {
        let schema = match field.kind {
            FieldKind::Number => json!({ "type": "number" }),
            FieldKind::Toggle => json!({ "type": "boolean" }),
            FieldKind::Select => json!({
                "type": "string",
                "enum": field.options.clone().unwrap_or_default(),
            }),
            FieldKind::Text | FieldKind::Email | FieldKind::Phone | FieldKind::Date => {
                json!({ "type": "string" })
            }
        };
        properties.insert(field.key.clone(), schema);
        if field.required {
            required.push(Value::String(field.key.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": Value::Array(required),
        "additionalProperties": false,
    })
}

/// Validates submitted values against the form's schema, then applies the
/// format checks JSON Schema alone does not cover (email, phone). Malformed
/// payloads are rejected here, before anything reaches storage.
pub fn validate_submission(definition: &FormDefinition, values: &Value) -> AppResult<()> {
    let schema = schema_for(definition);
    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|error| AppError::Internal(format!("form schema failed to compile: {}", error)))?;

    if let Err(errors) = compiled.validate(values) {
        let details = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", path, error)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AppError::Validation(format!(
            "Form '{}' submission invalid: {}",
            definition.name, details
        )));
    }

    for field in &definition.fields {
        let Some(raw) = values.get(&field.key).and_then(Value::as_str) else {
            continue;
        };
        match field.kind {
            FieldKind::Email if !EMAIL_RE.is_match(raw) => {
                return Err(AppError::Validation(format!(
                    "Field '{}' is not a valid email address",
                    field.key
                )));
            }
            FieldKind::Phone if !PHONE_RE.is_match(raw) => {
                return Err(AppError::Validation(format!(
                    "Field '{}' is not a valid phone number",
                    field.key
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Turns a validated submission into a Lead owned by the submitting agent.
/// `clientName` is the one promoted key every intake form must carry; email
/// and phone are promoted when present, everything else stays in `fields`.
pub fn build_lead(definition: &FormDefinition, agent_id: &str, values: &Value) -> AppResult<Lead> {
    validate_submission(definition, values)?;

    let client_name = values
        .get("clientName")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            AppError::Validation(format!(
                "Form '{}' submission is missing clientName",
                definition.name
            ))
        })?;

    let now = Utc::now();
    Ok(Lead {
        id: Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        form_id: Some(definition.id.clone()),
        client_name: client_name.to_string(),
        email: values
            .get("email")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        phone: values
            .get("phone")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        status: LeadStatus::New,
        fields: values.clone(),
        created_at: now,
        updated_at: now,
    })
}
