//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox collection
//!
//! All three return 404 while federation is disabled so the instance is
//! indistinguishable from one that never federated.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{HeaderMap, header};

use crate::AppState;
use crate::error::AppError;
use crate::federation::resolver::actor_iri_from_reference;
use crate::federation::{delivery::builder, extract_signature_key_id, key_id_matches_actor};
use crate::metrics::{INBOX_REQUEST_DURATION_SECONDS, INBOX_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /federation/user/:account - Actor profile
/// - POST /federation/inbox - Inbox
/// - GET /federation/outbox - Outbox collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/federation/user/:account", get(actor))
        .route("/federation/inbox", post(inbox))
        .route("/federation/outbox", get(outbox))
}

fn activity_json(document: serde_json::Value) -> Response {
    (
        [(header::CONTENT_TYPE, "application/activity+json")],
        axum::Json(document),
    )
        .into_response()
}

fn ensure_federation_enabled(state: &AppState) -> Result<(), AppError> {
    if state.config.federation.enabled {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

/// GET /federation/user/:account
///
/// Returns the local actor document.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Result<Response, AppError> {
    ensure_federation_enabled(&state)?;

    if account != state.config.federation.account {
        return Err(AppError::NotFound);
    }

    let base_url = state.config.server.base_url();
    let actor_iri = state.config.federation.actor_iri(&base_url);

    Ok(activity_json(builder::person_actor(
        &actor_iri,
        &account,
        &state.local_actor.public_key_pem,
        &base_url,
    )))
}

/// POST /federation/inbox
///
/// Receives incoming ActivityPub activities.
///
/// # Steps
/// 1. Verify HTTP Signature (keyId must belong to the activity's actor)
/// 2. Parse activity
/// 3. Dispatch based on type
async fn inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(), AppError> {
    ensure_federation_enabled(&state)?;

    let _timer = INBOX_REQUEST_DURATION_SECONDS.start_timer();

    // Reject unsigned requests before doing any work.
    if headers.get("signature").is_none() {
        INBOX_REQUESTS_TOTAL
            .with_label_values(&["unauthorized"])
            .inc();
        return Err(AppError::Unauthorized);
    }

    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let actor_reference = activity
        .get("actor")
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;
    let actor_iri = actor_iri_from_reference(actor_reference)?;

    // keyId must point at the actor before any remote key material is fetched.
    let signature_key_id = extract_signature_key_id(&headers)?;
    if !key_id_matches_actor(&signature_key_id, &actor_iri) {
        INBOX_REQUESTS_TOTAL
            .with_label_values(&["unauthorized"])
            .inc();
        return Err(AppError::Validation(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    let sender = state.resolver.resolve_iri(&actor_iri).await?;

    crate::federation::verify_signature(
        "POST",
        "/federation/inbox",
        &headers,
        Some(&body),
        &sender.public_key_pem,
    )?;

    let outcome = state.dispatcher.handle(&activity).await.map_err(|e| {
        INBOX_REQUESTS_TOTAL.with_label_values(&["error"]).inc();
        e
    })?;

    for side_effect_error in &outcome.side_effect_errors {
        tracing::warn!(
            activity_type = %outcome.activity_type.as_str(),
            actor = %actor_iri,
            error = %side_effect_error,
            "Activity handled with degraded side effect"
        );
    }

    INBOX_REQUESTS_TOTAL.with_label_values(&["success"]).inc();
    Ok(())
}

/// GET /federation/outbox
///
/// Returns the most recent locally authored activities as an
/// OrderedCollection, newest first.
async fn outbox(State(state): State<AppState>) -> Result<Response, AppError> {
    ensure_federation_enabled(&state)?;

    let items = state.db.get_outbox_page(20).await?;

    let ordered_items: Vec<serde_json::Value> = items
        .iter()
        .filter_map(|item| serde_json::from_slice(&item.payload).ok())
        .collect();

    let base_url = state.config.server.base_url();
    Ok(activity_json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": format!("{}/federation/outbox", base_url),
        "totalItems": ordered_items.len(),
        "orderedItems": ordered_items,
    })))
}
