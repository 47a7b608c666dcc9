//! Signed activity delivery
//!
//! POSTs activities to remote inboxes with HTTP Signature headers and
//! fans a single activity out to many followers concurrently.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::AppError;
use crate::metrics;

/// Upper bound on simultaneous outbound deliveries during a fan-out.
const MAX_CONCURRENT_DELIVERIES: usize = 10;

/// Outcome of one delivery attempt during a fan-out.
///
/// A failed delivery never aborts the batch; each target gets its own entry.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URL
    pub inbox: String,
    /// Whether the remote inbox accepted the activity
    pub success: bool,
    /// Error message if the attempt failed
    pub error: Option<String>,
}

/// Signed delivery transport
///
/// Holds the local actor's signing identity and sends activities to
/// remote inbox endpoints.
#[derive(Clone)]
pub struct SignedDelivery {
    http_client: reqwest::Client,
    /// Local actor IRI
    actor_iri: String,
    /// Key ID for signatures (actor IRI + #main-key)
    key_id: String,
    /// Private key for signing (PEM)
    private_key_pem: String,
}

impl SignedDelivery {
    pub fn new(http_client: reqwest::Client, actor_iri: String, private_key_pem: String) -> Self {
        let key_id = format!("{}#main-key", actor_iri);
        Self {
            http_client,
            actor_iri,
            key_id,
            private_key_pem,
        }
    }

    pub fn actor_iri(&self) -> &str {
        &self.actor_iri
    }

    /// Deliver an activity to a single inbox
    ///
    /// Signs the request and POSTs it as `application/activity+json`.
    ///
    /// # Errors
    /// `AppError::Delivery` on network failure or a non-2xx response.
    pub async fn post(&self, activity: &serde_json::Value, inbox: &str) -> Result<(), AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let sig_headers = super::signature::sign_request(
            "POST",
            inbox,
            Some(&body),
            &self.private_key_pem,
            &self.key_id,
        )?;

        let mut request = self
            .http_client
            .post(inbox)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Delivery(format!("Failed to deliver to {}: {}", inbox, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Delivery(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox,
                response.status()
            )));
        }

        tracing::debug!(inbox = %inbox, "Delivered activity");
        Ok(())
    }

    /// Deliver one activity to many inboxes concurrently.
    ///
    /// Duplicate inbox URLs are collapsed to a single attempt. Returns one
    /// result per unique target; failures are recorded, never propagated.
    pub async fn deliver_to_many(
        &self,
        activity: serde_json::Value,
        inboxes: Vec<String>,
    ) -> Vec<DeliveryResult> {
        let total = inboxes.len();
        let targets = unique_inbox_targets(inboxes);

        tracing::info!(
            "Delivering to {} unique inboxes (deduplicated from {} total)",
            targets.len(),
            total
        );

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));
        let activity = Arc::new(activity);

        let mut tasks = Vec::with_capacity(targets.len());
        for inbox in targets {
            let semaphore = semaphore.clone();
            let activity = activity.clone();
            let transport = self.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let result = transport.post(&activity, &inbox).await;
                DeliveryResult {
                    inbox,
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in futures::future::join_all(tasks).await {
            if let Ok(result) = task {
                let status = if result.success { "success" } else { "failure" };
                metrics::DELIVERIES_TOTAL.with_label_values(&[status]).inc();
                if let Some(ref error) = result.error {
                    tracing::warn!(inbox = %result.inbox, error = %error, "Delivery failed");
                }
                results.push(result);
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            "Batch delivery complete: {} succeeded, {} failed",
            success_count,
            results.len() - success_count
        );

        results
    }

    /// Send an Accept wrapping a received Follow back to the follower.
    pub async fn send_accept(
        &self,
        follow_activity_iri: &str,
        follower_inbox: &str,
    ) -> Result<(), AppError> {
        let accept_id = format!(
            "{}/accept/{}",
            self.actor_iri,
            crate::data::EntityId::new().0
        );

        let activity = builder::accept(
            &accept_id,
            &self.actor_iri,
            serde_json::json!({
                "type": "Follow",
                "id": follow_activity_iri
            }),
        );

        self.post(&activity, follower_inbox).await?;
        metrics::ACTIVITIES_SENT_TOTAL
            .with_label_values(&["Accept"])
            .inc();

        tracing::info!(
            "Sent Accept to {} for Follow {}",
            follower_inbox,
            follow_activity_iri
        );
        Ok(())
    }
}

/// Deduplicate identical inbox URLs while keeping distinct personal inboxes.
///
/// Collapsing by domain would drop recipients on shared hosts that use
/// different inbox paths.
fn unique_inbox_targets(inboxes: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for inbox in inboxes {
        if seen.insert(inbox.clone()) {
            targets.push(inbox);
        }
    }
    targets
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Public addressing collection.
    pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique IRI)
    /// * `actor` - Actor IRI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity wrapping a freshly authored object
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique IRI)
    /// * `actor` - Actor IRI (author)
    /// * `object` - Object being created (usually a Note)
    /// * `to` - Primary recipients
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Update activity carrying the refreshed actor document.
    pub fn update(id: &str, actor: &str, object: Value, to: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Update",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a publicly addressed Note object
    ///
    /// # Arguments
    /// * `id` - Note ID (unique IRI)
    /// * `attributed_to` - Actor IRI (author)
    /// * `content` - HTML content
    /// * `published` - Publication timestamp (RFC3339)
    /// * `tags` - Hashtag objects (see [`hashtag`])
    /// * `attachment` - Optional image attachment (see [`image_attachment`])
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        tags: Vec<Value>,
        attachment: Option<Value>,
    ) -> Value {
        let mut note = serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": [PUBLIC_AUDIENCE],
            "sensitive": false,
            "tag": tags,
        });
        if let Some(attachment) = attachment {
            note["attachment"] = Value::Array(vec![attachment]);
        }
        note
    }

    /// Build the local actor's Person document
    ///
    /// Served from the actor endpoint and embedded in profile-update
    /// broadcasts.
    pub fn person_actor(
        actor_iri: &str,
        preferred_username: &str,
        public_key_pem: &str,
        base_url: &str,
    ) -> Value {
        let base = base_url.trim_end_matches('/');
        serde_json::json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "type": "Person",
            "id": actor_iri,
            "preferredUsername": preferred_username,
            "inbox": format!("{}/federation/inbox", base),
            "outbox": format!("{}/federation/outbox", base),
            "url": base,
            "manuallyApprovesFollowers": false,
            "discoverable": true,
            "publicKey": {
                "id": format!("{}#main-key", actor_iri),
                "owner": actor_iri,
                "publicKeyPem": public_key_pem
            }
        })
    }

    /// Build a Hashtag tag object
    ///
    /// `name` must already be sanitized; the leading `#` is added here.
    pub fn hashtag(name: &str, base_url: &str) -> Value {
        serde_json::json!({
            "type": "Hashtag",
            "href": format!("{}/tags/{}", base_url.trim_end_matches('/'), name),
            "name": format!("#{}", name)
        })
    }

    /// Build an Image attachment object.
    pub fn image_attachment(url: &str, media_type: &str, description: &str) -> Value {
        serde_json::json!({
            "type": "Image",
            "url": url,
            "mediaType": media_type,
            "name": description
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, extract::State, http::HeaderMap, routing::post};
    use std::sync::Mutex;

    fn test_private_key_pem() -> String {
        use rsa::RsaPrivateKey;
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key pem")
            .to_string()
    }

    #[derive(Clone, Default)]
    struct RecordingInbox {
        requests: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
    }

    async fn spawn_recording_inbox(inbox: RecordingInbox) -> String {
        async fn receive(
            State(inbox): State<RecordingInbox>,
            headers: HeaderMap,
            body: axum::body::Bytes,
        ) -> &'static str {
            inbox.requests.lock().unwrap().push((headers, body.to_vec()));
            ""
        }

        let app = Router::new()
            .route("/inbox", post(receive))
            .with_state(inbox);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/inbox", addr)
    }

    fn test_transport() -> SignedDelivery {
        SignedDelivery::new(
            reqwest::Client::new(),
            "https://local.example/federation/user/streamer".to_string(),
            test_private_key_pem(),
        )
    }

    #[test]
    fn unique_inbox_targets_keeps_distinct_personal_inboxes() {
        let targets = unique_inbox_targets(vec![
            "https://a.example/users/alice/inbox".to_string(),
            "https://a.example/users/bob/inbox".to_string(),
            "https://a.example/users/alice/inbox".to_string(),
        ]);

        assert_eq!(
            targets,
            vec![
                "https://a.example/users/alice/inbox".to_string(),
                "https://a.example/users/bob/inbox".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn post_sends_signed_activity_json() {
        let inbox = RecordingInbox::default();
        let inbox_url = spawn_recording_inbox(inbox.clone()).await;
        let transport = test_transport();

        transport
            .post(&serde_json::json!({"type": "Accept"}), &inbox_url)
            .await
            .unwrap();

        let requests = inbox.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/activity+json"
        );
        let signature = headers.get("signature").unwrap().to_str().unwrap();
        assert!(signature.contains("keyId=\"https://local.example/federation/user/streamer#main-key\""));
        assert!(headers.contains_key("digest"));
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed["type"], "Accept");
    }

    #[tokio::test]
    async fn deliver_to_many_records_per_target_outcomes() {
        let inbox = RecordingInbox::default();
        let good_inbox = spawn_recording_inbox(inbox.clone()).await;
        // Unroutable target: the listener is closed before anything connects.
        let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_inbox = format!("http://{}/inbox", dead_listener.local_addr().unwrap());
        drop(dead_listener);

        let transport = test_transport();
        let results = transport
            .deliver_to_many(
                serde_json::json!({"type": "Create"}),
                vec![good_inbox.clone(), dead_inbox.clone()],
            )
            .await;

        assert_eq!(results.len(), 2);
        let good = results.iter().find(|r| r.inbox == good_inbox).unwrap();
        assert!(good.success);
        assert!(good.error.is_none());
        let dead = results.iter().find(|r| r.inbox == dead_inbox).unwrap();
        assert!(!dead.success);
        assert!(dead.error.is_some());

        assert_eq!(inbox.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_accept_wraps_follow_activity() {
        let inbox = RecordingInbox::default();
        let inbox_url = spawn_recording_inbox(inbox.clone()).await;
        let transport = test_transport();

        transport
            .send_accept("https://remote.example/activities/follow-1", &inbox_url)
            .await
            .unwrap();

        let requests = inbox.requests.lock().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&requests[0].1).unwrap();
        assert_eq!(parsed["type"], "Accept");
        assert_eq!(
            parsed["actor"],
            "https://local.example/federation/user/streamer"
        );
        assert_eq!(parsed["object"]["type"], "Follow");
        assert_eq!(
            parsed["object"]["id"],
            "https://remote.example/activities/follow-1"
        );
    }

    #[test]
    fn note_builder_carries_tags_and_attachment() {
        let note = builder::note(
            "https://local.example/federation/note-1",
            "https://local.example/federation/user/streamer",
            "<p>hello</p>",
            "2026-01-01T00:00:00Z",
            vec![builder::hashtag("owncast", "https://local.example")],
            Some(builder::image_attachment(
                "https://local.example/preview.gif",
                "image/gif",
                "Stream preview",
            )),
        );

        assert_eq!(note["to"][0], builder::PUBLIC_AUDIENCE);
        assert_eq!(note["tag"][0]["name"], "#owncast");
        assert_eq!(note["tag"][0]["href"], "https://local.example/tags/owncast");
        assert_eq!(note["attachment"][0]["mediaType"], "image/gif");
    }
}
