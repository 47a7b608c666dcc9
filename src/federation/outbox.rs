//! Outbound broadcasts
//!
//! Builds the go-live, public-message, and profile-update activities,
//! records them in the outbox log, and fans them out to every follower.

use std::sync::Arc;

use serde_json::Value;

use crate::config::FederationConfig;
use crate::data::{
    Database,
    models::{ApObjectType, EntityId, OutboxItem},
};
use crate::error::AppError;
use crate::federation::delivery::{DeliveryResult, SignedDelivery, builder};
use crate::metrics;

/// Hashtag always attached to go-live notes so instances can be discovered.
const INSTANCE_HASHTAG: &str = "owncast";

/// What a broadcast produced: the persisted activity and one delivery
/// outcome per follower inbox.
#[derive(Debug)]
pub struct BroadcastReport {
    /// IRI of the persisted activity
    pub activity_iri: String,
    /// IRI of the embedded object, when the activity wraps one
    pub object_iri: Option<String>,
    pub deliveries: Vec<DeliveryResult>,
}

impl BroadcastReport {
    pub fn successful_deliveries(&self) -> usize {
        self.deliveries.iter().filter(|d| d.success).count()
    }
}

/// Builds and distributes locally authored activities.
#[derive(Clone)]
pub struct OutboxDistributor {
    db: Arc<Database>,
    delivery: SignedDelivery,
    federation: FederationConfig,
    base_url: String,
    /// Local actor public key (PEM), embedded in profile updates
    public_key_pem: String,
}

impl OutboxDistributor {
    pub fn new(
        db: Arc<Database>,
        delivery: SignedDelivery,
        federation: FederationConfig,
        base_url: String,
        public_key_pem: String,
    ) -> Self {
        Self {
            db,
            delivery,
            federation,
            base_url,
            public_key_pem,
        }
    }

    /// Announce to all followers that the stream has started.
    ///
    /// The note carries the configured go-live message, a link back to the
    /// instance, the stream title when one is set, the instance hashtags,
    /// and a preview image when one exists under the web root.
    pub async fn send_live(&self) -> Result<BroadcastReport, AppError> {
        let tags = self.hashtag_names();

        let mut content = format!("<p>{}</p>", self.federation.go_live_message);
        content.push_str(&format!(
            "<p><a href=\"{0}\">{0}</a></p>",
            self.base_url
        ));
        if !self.federation.stream_title.trim().is_empty() {
            content.push_str(&format!("<p>{}</p>", self.federation.stream_title));
        }
        content.push_str(&hashtag_paragraph(&tags, &self.base_url));

        self.broadcast_note(content, &tags, self.preview_attachment())
            .await
    }

    /// Post an arbitrary public message to all followers.
    pub async fn send_public_message(&self, message: &str) -> Result<BroadcastReport, AppError> {
        let tags = self.hashtag_names();
        let content = format!(
            "<p>{}</p>{}",
            message,
            hashtag_paragraph(&tags, &self.base_url)
        );
        self.broadcast_note(content, &tags, None).await
    }

    /// Broadcast an Update carrying the refreshed local actor document.
    ///
    /// Sent when the account's display settings change so remote servers
    /// re-render the profile.
    pub async fn send_profile_update(&self) -> Result<BroadcastReport, AppError> {
        self.ensure_enabled()?;

        let actor_iri = self.delivery.actor_iri().to_string();
        let actor_document = builder::person_actor(
            &actor_iri,
            &self.federation.account,
            &self.public_key_pem,
            &self.base_url,
        );

        let update_id = EntityId::new();
        let update_iri = self.local_iri(&update_id);
        let activity = builder::update(
            &update_iri,
            &actor_iri,
            actor_document,
            vec![builder::PUBLIC_AUDIENCE],
        );

        self.db
            .add_outbox_item(&OutboxItem {
                id: update_id.0,
                iri: update_iri.clone(),
                object_type: ApObjectType::Update,
                payload: serde_json::to_vec(&activity)
                    .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?,
                created_at: chrono::Utc::now(),
            })
            .await?;

        let deliveries = self.fan_out(activity, "Update").await?;
        Ok(BroadcastReport {
            activity_iri: update_iri,
            object_iri: None,
            deliveries,
        })
    }

    /// Wrap a note in a Create, persist both, and deliver to all followers.
    async fn broadcast_note(
        &self,
        content: String,
        tags: &[String],
        attachment: Option<Value>,
    ) -> Result<BroadcastReport, AppError> {
        self.ensure_enabled()?;

        let actor_iri = self.delivery.actor_iri().to_string();
        let published = chrono::Utc::now().to_rfc3339();

        let note_id = EntityId::new();
        let note_iri = self.local_iri(&note_id);
        let tag_objects = tags
            .iter()
            .map(|tag| builder::hashtag(tag, &self.base_url))
            .collect();
        let note = builder::note(
            &note_iri,
            &actor_iri,
            &content,
            &published,
            tag_objects,
            attachment,
        );

        let create_id = EntityId::new();
        let create_iri = self.local_iri(&create_id);
        let activity = builder::create(
            &create_iri,
            &actor_iri,
            note.clone(),
            vec![builder::PUBLIC_AUDIENCE],
        );

        // Persist the activity and the embedded note before any delivery so
        // inbound Like/Announce references resolve even if fan-out dies.
        self.db
            .add_outbox_item(&OutboxItem {
                id: create_id.0,
                iri: create_iri.clone(),
                object_type: ApObjectType::Create,
                payload: serde_json::to_vec(&activity)
                    .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?,
                created_at: chrono::Utc::now(),
            })
            .await?;
        self.db
            .add_outbox_item(&OutboxItem {
                id: note_id.0,
                iri: note_iri.clone(),
                object_type: ApObjectType::Note,
                payload: serde_json::to_vec(&note)
                    .map_err(|e| AppError::Validation(format!("Failed to serialize note: {}", e)))?,
                created_at: chrono::Utc::now(),
            })
            .await?;

        let deliveries = self.fan_out(activity, "Create").await?;
        Ok(BroadcastReport {
            activity_iri: create_iri,
            object_iri: Some(note_iri),
            deliveries,
        })
    }

    async fn fan_out(
        &self,
        activity: Value,
        activity_type: &str,
    ) -> Result<Vec<DeliveryResult>, AppError> {
        let inboxes = self
            .db
            .list_followers()
            .await?
            .into_iter()
            .map(|follower| follower.inbox.to_string())
            .collect();

        metrics::ACTIVITIES_SENT_TOTAL
            .with_label_values(&[activity_type])
            .inc();

        Ok(self.delivery.deliver_to_many(activity, inboxes).await)
    }

    fn ensure_enabled(&self) -> Result<(), AppError> {
        if self.federation.enabled {
            Ok(())
        } else {
            Err(AppError::Validation("Federation is disabled".to_string()))
        }
    }

    fn local_iri(&self, id: &EntityId) -> String {
        format!("{}/federation/{}", self.base_url, id)
    }

    /// Instance hashtags with unusable characters stripped, plus the
    /// always-on instance tag.
    fn hashtag_names(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for raw in &self.federation.tags {
            let cleaned: String = raw.chars().filter(char::is_ascii_alphanumeric).collect();
            if !cleaned.is_empty() && !tags.contains(&cleaned) {
                tags.push(cleaned);
            }
        }
        // Exact match only: a configured "Owncast" still gains "owncast".
        if !tags.iter().any(|t| t == INSTANCE_HASHTAG) {
            tags.push(INSTANCE_HASHTAG.to_string());
        }
        tags
    }

    /// Pick the stream preview image, if the media pipeline has written one.
    fn preview_attachment(&self) -> Option<Value> {
        let candidates = [("preview.gif", "image/gif"), ("thumbnail.jpg", "image/jpeg")];
        for (file_name, media_type) in candidates {
            if self.federation.web_root.join(file_name).is_file() {
                return Some(builder::image_attachment(
                    &format!("{}/{}", self.base_url, file_name),
                    media_type,
                    "Stream preview",
                ));
            }
        }
        None
    }
}

/// Render the trailing hashtag line the way Mastodon expects: anchors
/// pointing at the local tag timeline, not bare text.
fn hashtag_paragraph(tags: &[String], base_url: &str) -> String {
    let rendered: Vec<String> = tags
        .iter()
        .map(|tag| {
            format!(
                r#"<a class="hashtag" href="{base}/tags/{tag}">#{tag}</a>"#,
                base = base_url.trim_end_matches('/'),
                tag = tag
            )
        })
        .collect();
    format!("<p>{}</p>", rendered.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use axum::{Router, extract::State, routing::post};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingInbox {
        received: Arc<Mutex<Vec<Value>>>,
    }

    async fn spawn_recording_inbox(inbox: RecordingInbox) -> String {
        async fn receive(
            State(inbox): State<RecordingInbox>,
            axum::Json(body): axum::Json<Value>,
        ) {
            inbox.received.lock().unwrap().push(body);
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

    fn test_federation_config(tags: Vec<String>, web_root: PathBuf) -> FederationConfig {
        FederationConfig {
            enabled: true,
            account: "streamer".to_string(),
            go_live_message: "I've gone live!".to_string(),
            stream_title: "Chess Night".to_string(),
            tags,
            web_root,
        }
    }

    async fn create_test_distributor(
        federation: FederationConfig,
    ) -> (OutboxDistributor, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("outbox_test.db"))
                .await
                .unwrap(),
        );

        let private_key_pem = {
            use rsa::RsaPrivateKey;
            use rsa::pkcs8::{EncodePrivateKey, LineEnding};
            let mut rng = rand::thread_rng();
            RsaPrivateKey::new(&mut rng, 1024)
                .unwrap()
                .to_pkcs8_pem(LineEnding::LF)
                .unwrap()
                .to_string()
        };

        let distributor = OutboxDistributor::new(
            db.clone(),
            SignedDelivery::new(
                reqwest::Client::new(),
                "https://local.example/federation/user/streamer".to_string(),
                private_key_pem,
            ),
            federation,
            "https://local.example".to_string(),
            "-----BEGIN PUBLIC KEY-----\nfake\n-----END PUBLIC KEY-----\n".to_string(),
        );

        (distributor, db, temp_dir)
    }

    async fn seed_follower(db: &Database, iri: &str, inbox: &str) {
        db.add_follower(&crate::data::models::Follower {
            iri: url::Url::parse(iri).unwrap(),
            inbox: url::Url::parse(inbox).unwrap(),
            name: None,
            avatar_url: None,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn hashtags_are_sanitized_and_instance_tag_forced() {
        let temp_dir = TempDir::new().unwrap();
        let federation = test_federation_config(
            vec!["Music!".to_string(), "sci-fi".to_string()],
            temp_dir.path().to_path_buf(),
        );
        let (distributor, _db, _temp) = create_test_distributor(federation).await;

        assert_eq!(
            distributor.hashtag_names(),
            vec!["Music".to_string(), "scifi".to_string(), "owncast".to_string()]
        );
    }

    #[tokio::test]
    async fn instance_tag_is_not_duplicated() {
        let temp_dir = TempDir::new().unwrap();
        let federation = test_federation_config(
            vec!["owncast".to_string()],
            temp_dir.path().to_path_buf(),
        );
        let (distributor, _db, _temp) = create_test_distributor(federation).await;

        assert_eq!(distributor.hashtag_names(), vec!["owncast".to_string()]);
    }

    #[tokio::test]
    async fn instance_tag_dedup_is_case_sensitive() {
        let temp_dir = TempDir::new().unwrap();
        let federation = test_federation_config(
            vec!["Owncast".to_string()],
            temp_dir.path().to_path_buf(),
        );
        let (distributor, _db, _temp) = create_test_distributor(federation).await;

        assert_eq!(
            distributor.hashtag_names(),
            vec!["Owncast".to_string(), "owncast".to_string()]
        );
    }

    #[tokio::test]
    async fn send_live_persists_activity_and_note_then_delivers_to_each_follower() {
        let temp_dir = TempDir::new().unwrap();
        let federation = test_federation_config(vec![], temp_dir.path().to_path_buf());
        let (distributor, db, _temp) = create_test_distributor(federation).await;

        let inbox_a = RecordingInbox::default();
        let inbox_b = RecordingInbox::default();
        let inbox_a_url = spawn_recording_inbox(inbox_a.clone()).await;
        let inbox_b_url = spawn_recording_inbox(inbox_b.clone()).await;
        seed_follower(&db, "https://a.example/users/u1", &inbox_a_url).await;
        seed_follower(&db, "https://b.example/users/u2", &inbox_b_url).await;

        let report = distributor.send_live().await.unwrap();

        assert_eq!(report.deliveries.len(), 2);
        assert_eq!(report.successful_deliveries(), 2);
        assert_eq!(db.count_outbox_items().await.unwrap(), 2);

        // Both the activity and the embedded note resolve by IRI.
        assert!(db
            .get_outbox_payload_by_iri(&report.activity_iri)
            .await
            .unwrap()
            .is_some());
        let note_iri = report.object_iri.as_deref().unwrap();
        assert!(db
            .get_outbox_payload_by_iri(note_iri)
            .await
            .unwrap()
            .is_some());

        for inbox in [&inbox_a, &inbox_b] {
            let received = inbox.received.lock().unwrap();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0]["type"], "Create");
            let content = received[0]["object"]["content"].as_str().unwrap();
            assert!(content.contains("I've gone live!"));
            assert!(content.contains("Chess Night"));
            assert!(content.contains("#owncast"));
            assert!(content.contains("/tags/owncast"));
        }
    }

    #[tokio::test]
    async fn send_live_attaches_preview_when_one_exists() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("preview.gif"), b"gif").unwrap();
        let federation = test_federation_config(vec![], temp_dir.path().to_path_buf());
        let (distributor, db, _temp) = create_test_distributor(federation).await;

        let inbox = RecordingInbox::default();
        let inbox_url = spawn_recording_inbox(inbox.clone()).await;
        seed_follower(&db, "https://a.example/users/u1", &inbox_url).await;

        distributor.send_live().await.unwrap();

        let received = inbox.received.lock().unwrap();
        let attachment = &received[0]["object"]["attachment"][0];
        assert_eq!(attachment["url"], "https://local.example/preview.gif");
        assert_eq!(attachment["mediaType"], "image/gif");
    }

    #[tokio::test]
    async fn failed_follower_does_not_block_the_rest() {
        let temp_dir = TempDir::new().unwrap();
        let federation = test_federation_config(vec![], temp_dir.path().to_path_buf());
        let (distributor, db, _temp) = create_test_distributor(federation).await;

        let inbox = RecordingInbox::default();
        let good_inbox = spawn_recording_inbox(inbox.clone()).await;
        let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_inbox = format!("http://{}/inbox", dead_listener.local_addr().unwrap());
        drop(dead_listener);

        seed_follower(&db, "https://a.example/users/u1", &dead_inbox).await;
        seed_follower(&db, "https://b.example/users/u2", &good_inbox).await;

        let report = distributor.send_live().await.unwrap();

        assert_eq!(report.deliveries.len(), 2);
        assert_eq!(report.successful_deliveries(), 1);
        assert_eq!(inbox.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_public_message_carries_the_message() {
        let temp_dir = TempDir::new().unwrap();
        let federation = test_federation_config(vec![], temp_dir.path().to_path_buf());
        let (distributor, db, _temp) = create_test_distributor(federation).await;

        let inbox = RecordingInbox::default();
        let inbox_url = spawn_recording_inbox(inbox.clone()).await;
        seed_follower(&db, "https://a.example/users/u1", &inbox_url).await;

        let report = distributor
            .send_public_message("Big announcement tonight")
            .await
            .unwrap();

        assert_eq!(report.successful_deliveries(), 1);
        let received = inbox.received.lock().unwrap();
        let content = received[0]["object"]["content"].as_str().unwrap();
        assert!(content.contains("Big announcement tonight"));
        assert!(!content.contains("Chess Night"));
    }

    #[tokio::test]
    async fn send_profile_update_broadcasts_actor_document() {
        let temp_dir = TempDir::new().unwrap();
        let federation = test_federation_config(vec![], temp_dir.path().to_path_buf());
        let (distributor, db, _temp) = create_test_distributor(federation).await;

        let inbox = RecordingInbox::default();
        let inbox_url = spawn_recording_inbox(inbox.clone()).await;
        seed_follower(&db, "https://a.example/users/u1", &inbox_url).await;

        let report = distributor.send_profile_update().await.unwrap();

        assert!(report.object_iri.is_none());
        assert_eq!(db.count_outbox_items().await.unwrap(), 1);
        let received = inbox.received.lock().unwrap();
        assert_eq!(received[0]["type"], "Update");
        assert_eq!(received[0]["object"]["type"], "Person");
        assert_eq!(received[0]["object"]["preferredUsername"], "streamer");
    }

    #[tokio::test]
    async fn broadcasts_are_refused_when_federation_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let mut federation = test_federation_config(vec![], temp_dir.path().to_path_buf());
        federation.enabled = false;
        let (distributor, db, _temp) = create_test_distributor(federation).await;

        let result = distributor.send_live().await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(db.count_outbox_items().await.unwrap(), 0);
    }
}
