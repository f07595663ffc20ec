//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::time::Duration;

use axum::{Json, Router, routing::get};
use chrono::Utc;
use fedicore::data::{EntityId, LocalUser, Note};
use fedicore::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const REMOTE_PRIVATE_KEY_PEM: &str = include_str!("../fixtures/remote_private_key.pem");
pub const REMOTE_PUBLIC_KEY_PEM: &str = include_str!("../fixtures/remote_public_key.pem");

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "test.example.com".to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                resolve_timeout_seconds: 5,
                allow_private_hosts: true,
                ..config::FederationConfig::default()
            },
            queue: config::QueueConfig {
                workers: 2,
                capacity: 64,
                max_attempts: 3,
                base_backoff_ms: 10,
                max_backoff_ms: 100,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = fedicore::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public base URL the server renders into documents
    pub fn base_url(&self) -> String {
        self.state.config.server.base_url()
    }

    /// Create a local user in the database
    pub async fn create_user(&self, username: &str) -> LocalUser {
        let user = LocalUser {
            id: EntityId::new().0,
            username: username.to_string(),
            username_lower: username.to_lowercase(),
            name: Some(format!("{} (test)", username)),
            summary: None,
            is_bot: false,
            is_locked: false,
            is_deleted: false,
            is_suspended: false,
            no_federation: false,
            notes_count: 0,
            public_key_pem: REMOTE_PUBLIC_KEY_PEM.to_string(),
            created_at: Utc::now(),
        };
        self.state.db.insert_user(&user).await.unwrap();
        user
    }

    /// Create a public local note
    pub async fn create_note(&self, user: &LocalUser, text: Option<&str>) -> Note {
        let note = Note {
            id: EntityId::new().0,
            user_id: user.id.clone(),
            user_host: None,
            uri: None,
            text: text.map(str::to_string),
            cw: None,
            renote_id: None,
            reply_id: None,
            has_poll: false,
            file_count: 0,
            visibility: "public".to_string(),
            local_only: false,
            created_at: Utc::now(),
        };
        self.state.db.insert_local_note(&note).await.unwrap();
        note
    }

    /// Deliver `activity` to `path`, signed with the remote peer's key
    pub async fn post_signed(&self, path: &str, key_id: &str, activity: &Value) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let signed = fedicore::federation::sign_request(
            "POST",
            &self.url(path),
            Some(&body),
            REMOTE_PRIVATE_KEY_PEM,
            key_id,
        )
        .unwrap();

        let mut request = self
            .client
            .post(self.url(path))
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }
        request.body(body).send().await.unwrap()
    }

    /// Poll until a remote note with `uri` is stored
    pub async fn wait_for_note(&self, uri: &str) -> Option<Note> {
        for _ in 0..50 {
            if let Some(note) = self.state.db.get_note_by_uri(uri).await.unwrap() {
                return Some(note);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }
}

/// A remote server serving one actor, `alice`, with the fixture key
pub struct RemotePeer {
    pub base: String,
}

impl RemotePeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let actor = actor_document(&base);
        let app = Router::new().route(
            "/users/alice",
            get(move || {
                let actor = actor.clone();
                async move { Json(actor) }
            }),
        );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base }
    }

    pub fn actor_uri(&self) -> String {
        format!("{}/users/alice", self.base)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_uri())
    }

    /// A `Create` of a public note by alice
    pub fn create_note(&self, note_id: &str, content: &str) -> Value {
        let note_uri = format!("{}/notes/{}", self.base, note_id);
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": format!("{}/activity", note_uri),
            "actor": self.actor_uri(),
            "object": {
                "type": "Note",
                "id": note_uri,
                "attributedTo": self.actor_uri(),
                "content": content,
                "to": ["https://www.w3.org/ns/activitystreams#Public"]
            }
        })
    }
}

fn actor_document(base: &str) -> Value {
    let actor_uri = format!("{}/users/alice", base);
    json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": actor_uri,
        "type": "Person",
        "preferredUsername": "alice",
        "inbox": format!("{}/inbox", actor_uri),
        "endpoints": {"sharedInbox": format!("{}/inbox", base)},
        "publicKey": {
            "id": format!("{}#main-key", actor_uri),
            "owner": actor_uri,
            "publicKeyPem": REMOTE_PUBLIC_KEY_PEM
        }
    })
}
