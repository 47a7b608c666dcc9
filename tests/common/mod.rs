//! Common test utilities for E2E tests

use std::sync::{Arc, Mutex};

use axum::{Json, Router, extract::State, routing::get, routing::post};
use castfed::chat::RecordingChatSink;
use castfed::{AppState, config, federation};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    /// Captures chat notifications emitted by federation handlers
    pub chat: Arc<RecordingChatSink>,
    pub client: reqwest::Client,
    pub _temp_dir: TempDir,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after tweaking the default configuration.
    pub async fn with_config(mutate: impl FnOnce(&mut config::AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config::AppConfig::test_defaults(temp_dir.path());
        mutate(&mut config);

        let chat = Arc::new(RecordingChatSink::new());
        let state = AppState::new(config, chat.clone()).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = castfed::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr,
            state,
            chat,
            client,
            _temp_dir: temp_dir,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}

/// A fake remote ActivityPub server.
///
/// Serves its own actor document, records everything POSTed to its inbox,
/// and can send correctly signed activities to a [`TestServer`].
pub struct RemotePeer {
    pub iri: String,
    pub inbox_url: String,
    pub private_key_pem: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl RemotePeer {
    /// Spawn a remote peer with a fresh RSA identity.
    pub async fn spawn(username: &str, display_name: &str) -> Self {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap()
            .to_string();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let iri = format!("http://{}/users/{}", addr, username);
        let inbox_url = format!("http://{}/inbox", addr);
        let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

        let document = serde_json::json!({
            "id": iri,
            "type": "Person",
            "inbox": inbox_url,
            "preferredUsername": username,
            "name": display_name,
            "publicKey": {
                "id": format!("{}#main-key", iri),
                "owner": iri,
                "publicKeyPem": public_key_pem
            }
        });

        async fn receive(State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>) {
            received.lock().unwrap().push(body);
        }

        let app = Router::new()
            .route(
                &format!("/users/{}", username),
                get(move || async move { Json(document) }),
            )
            .route("/inbox", post(receive).with_state(received.clone()));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            iri,
            inbox_url,
            private_key_pem,
            received,
        }
    }

    /// Everything delivered to this peer's inbox so far.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// POST a correctly signed activity to the test server's inbox.
    pub async fn post_signed(&self, server: &TestServer, activity: &Value) -> reqwest::Response {
        let inbox_url = server.url("/federation/inbox");
        let body = serde_json::to_vec(activity).unwrap();
        let key_id = format!("{}#main-key", self.iri);

        let headers =
            federation::sign_request("POST", &inbox_url, Some(&body), &self.private_key_pem, &key_id)
                .unwrap();

        let mut request = server
            .client
            .post(&inbox_url)
            .header("Content-Type", "application/activity+json")
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }

        request.body(body).send().await.unwrap()
    }

    /// Build a Follow activity addressed to the server's local actor.
    pub fn follow_activity(&self, server: &TestServer) -> Value {
        let config = &server.state.config;
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": format!("{}/activities/follow-1", self.iri),
            "actor": self.iri,
            "object": config.federation.actor_iri(&config.server.base_url())
        })
    }
}
