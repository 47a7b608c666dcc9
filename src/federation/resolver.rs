//! Remote actor resolution
//!
//! Dereferences actor references found in inbound activities into full
//! actor documents. A reference is either a bare IRI string or an
//! embedded object carrying an `id`.

use serde_json::Value;
use url::Url;

use crate::data::models::RemoteActor;
use crate::error::AppError;

/// Resolves actor references to full remote actor documents.
#[derive(Clone)]
pub struct ActorResolver {
    http_client: reqwest::Client,
}

impl ActorResolver {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    /// Resolve an actor reference into a full actor document.
    ///
    /// # Errors
    /// `AppError::Validation` when the reference carries no usable IRI;
    /// `AppError::Resolution` when the fetch fails or the document is
    /// missing a required property.
    pub async fn resolve(&self, reference: &Value) -> Result<RemoteActor, AppError> {
        let iri = actor_iri_from_reference(reference)?;
        self.resolve_iri(&iri).await
    }

    /// Resolve an actor by its IRI.
    pub async fn resolve_iri(&self, iri: &str) -> Result<RemoteActor, AppError> {
        let iri = Url::parse(iri)
            .map_err(|e| AppError::Validation(format!("Invalid actor IRI: {}", e)))?;

        let response = self
            .http_client
            .get(iri.as_str())
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| AppError::Resolution(format!("Failed to fetch actor {}: {}", iri, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Resolution(format!(
                "Failed to fetch actor {}: HTTP {}",
                iri,
                response.status()
            )));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| AppError::Resolution(format!("Failed to parse actor {}: {}", iri, e)))?;

        parse_actor_document(&iri, &document)
    }
}

/// Extract the actor IRI from an activity's `actor` property.
///
/// Accepts a plain IRI string or an embedded actor object with an `id`.
pub fn actor_iri_from_reference(reference: &Value) -> Result<String, AppError> {
    match reference {
        Value::String(iri) => Ok(iri.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(|id| id.as_str())
            .map(|id| id.to_string())
            .ok_or_else(|| AppError::Validation("Actor object has no id".to_string())),
        _ => Err(AppError::Validation(
            "Actor reference is neither an IRI nor an object".to_string(),
        )),
    }
}

fn parse_actor_document(iri: &Url, document: &Value) -> Result<RemoteActor, AppError> {
    let missing =
        |field: &str| AppError::Resolution(format!("Actor {} is missing {}", iri, field));

    let document_id = document
        .get("id")
        .and_then(|id| id.as_str())
        .ok_or_else(|| missing("id"))?;
    let document_iri = Url::parse(document_id)
        .map_err(|_| AppError::Resolution(format!("Actor {} has a malformed id", iri)))?;

    let inbox = document
        .get("inbox")
        .and_then(|inbox| inbox.as_str())
        .ok_or_else(|| missing("inbox"))?;
    let inbox = Url::parse(inbox)
        .map_err(|_| AppError::Resolution(format!("Actor {} has a malformed inbox", iri)))?;

    let public_key_pem = document
        .get("publicKey")
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(|pem| pem.as_str())
        .ok_or_else(|| missing("publicKey.publicKeyPem"))?
        .to_string();

    // Prefer the human name, then the handle, then the host.
    let display_name = document
        .get("name")
        .and_then(|name| name.as_str())
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            document
                .get("preferredUsername")
                .and_then(|name| name.as_str())
                .filter(|name| !name.trim().is_empty())
        })
        .map(|name| name.to_string())
        .unwrap_or_else(|| document_iri.host_str().unwrap_or("unknown").to_string());

    let avatar_url = document
        .get("icon")
        .and_then(|icon| icon.get("url"))
        .and_then(|icon_url| icon_url.as_str())
        .map(|icon_url| icon_url.to_string());

    Ok(RemoteActor {
        iri: document_iri,
        inbox,
        display_name,
        avatar_url,
        public_key_pem,
    })
}
