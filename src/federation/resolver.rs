//! Remote object resolver
//!
//! Dereferences ActivityPub identifiers into documents. A resolver instance
//! tracks every identifier it has fetched and refuses to fetch one twice,
//! which bounds reference cycles between documents. Create one resolver per
//! delivery or lookup; never share one across unrelated chains.

use super::document::{ap_type, context_includes};
use crate::config::FederationConfig;
use crate::error::FederationError;
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, RESOLVER_FETCHES_TOTAL,
};
use serde_json::Value;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const ACCEPT: &str = "application/activity+json, application/ld+json";

/// Settings shared by every resolver built from the same configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Namespace the fetched `@context` must declare
    pub namespace: String,
    pub user_agent: String,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub allow_private_hosts: bool,
}

impl ResolverConfig {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            timeout: config.resolve_timeout(),
            allow_private_hosts: config.allow_private_hosts,
        }
    }

    /// Build the HTTP client resolvers fetch through
    pub fn build_client(&self) -> Result<reqwest::Client, FederationError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout);

        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }

        Ok(builder.build()?)
    }
}

/// Kinds of collection the resolver can flatten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Collection,
    CollectionPage,
    OrderedCollection,
    OrderedCollectionPage,
}

impl CollectionKind {
    fn from_type(s: &str) -> Option<Self> {
        match s {
            "Collection" => Some(Self::Collection),
            "CollectionPage" => Some(Self::CollectionPage),
            "OrderedCollection" => Some(Self::OrderedCollection),
            "OrderedCollectionPage" => Some(Self::OrderedCollectionPage),
            _ => None,
        }
    }

    fn items_field(self) -> &'static str {
        match self {
            Self::Collection | Self::CollectionPage => "items",
            Self::OrderedCollection | Self::OrderedCollectionPage => "orderedItems",
        }
    }
}

/// A resolved collection with its members under a single name
#[derive(Debug, Clone)]
pub struct Collection {
    pub kind: CollectionKind,
    pub document: Value,
    pub objects: Vec<Value>,
}

/// Dereferences identifiers for one resolution chain
pub struct Resolver {
    http_client: reqwest::Client,
    config: Arc<ResolverConfig>,
    history: Mutex<HashSet<String>>,
}

impl Resolver {
    pub fn new(http_client: reqwest::Client, config: Arc<ResolverConfig>) -> Self {
        Self {
            http_client,
            config,
            history: Mutex::new(HashSet::new()),
        }
    }

    /// Identifiers fetched so far by this resolver
    pub async fn history(&self) -> Vec<String> {
        let mut visited: Vec<String> = self.history.lock().await.iter().cloned().collect();
        visited.sort();
        visited
    }

    /// Resolve a value into a document
    ///
    /// Embedded documents are returned as-is without any network access.
    pub async fn resolve(&self, value: &Value) -> Result<Value, FederationError> {
        match value {
            Value::Null => Err(FederationError::InvalidInput),
            Value::String(uri) => self.resolve_uri(uri).await,
            other => Ok(other.clone()),
        }
    }

    /// Fetch the document behind an identifier
    pub async fn resolve_uri(&self, uri: &str) -> Result<Value, FederationError> {
        {
            let mut history = self.history.lock().await;
            if !history.insert(uri.to_string()) {
                return Err(FederationError::AlreadyResolved(uri.to_string()));
            }
        }

        tracing::debug!(uri = %uri, "Resolving remote object");

        if !self.config.allow_private_hosts {
            check_destination(uri).await?;
        }

        let timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .start_timer();
        let sent = self
            .http_client
            .get(uri)
            .header("Accept", ACCEPT)
            .timeout(self.config.timeout)
            .send()
            .await;
        timer.observe_duration();

        let response = sent.map_err(|e| {
            RESOLVER_FETCHES_TOTAL.with_label_values(&["transport"]).inc();
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
            FederationError::Transport(format!("{}: {}", uri, e))
        })?;

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", status.as_str()])
            .inc();

        if !status.is_success() {
            RESOLVER_FETCHES_TOTAL.with_label_values(&["http_error"]).inc();
            return Err(FederationError::RemoteStatus {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        // An undecodable body is treated the same as a missing one.
        let document = response.json::<Value>().await.unwrap_or(Value::Null);
        if document.is_null() || !context_includes(&document, &self.config.namespace) {
            RESOLVER_FETCHES_TOTAL.with_label_values(&["invalid"]).inc();
            return Err(FederationError::InvalidResponse(uri.to_string()));
        }

        RESOLVER_FETCHES_TOTAL.with_label_values(&["ok"]).inc();
        Ok(document)
    }

    /// Resolve a value and flatten it as a collection
    pub async fn resolve_collection(&self, value: &Value) -> Result<Collection, FederationError> {
        let document = self.resolve(value).await?;

        let type_name = ap_type(&document).unwrap_or_default();
        let kind = CollectionKind::from_type(type_name)
            .ok_or_else(|| FederationError::UnknownCollectionType(type_name.to_string()))?;

        let objects = match document.get(kind.items_field()) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single.clone()],
        };

        Ok(Collection {
            kind,
            document,
            objects,
        })
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Refuse fetches to non-HTTP schemes and internal destinations
///
/// Hosts are checked literally and again after DNS resolution, so a public
/// name pointing at a private address is refused as well.
async fn check_destination(uri: &str) -> Result<(), FederationError> {
    let refused = || FederationError::Refused(uri.to_string());
    let parsed = url::Url::parse(uri).map_err(|_| refused())?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(refused());
    }

    let host = parsed.host_str().unwrap_or_default();
    if host.is_empty() || is_disallowed_host(host) {
        return Err(refused());
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let lookup_host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = tokio::net::lookup_host((lookup_host, port))
        .await
        .map_err(|e| FederationError::Transport(format!("failed to resolve {}: {}", host, e)))?;

    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(refused());
        }
    }

    if !resolved_any {
        return Err(FederationError::Transport(format!("no DNS records for {}", host)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::get};
    use serde_json::json;

    const AS: &str = "https://www.w3.org/ns/activitystreams";

    fn test_config() -> Arc<ResolverConfig> {
        Arc::new(ResolverConfig {
            namespace: AS.to_string(),
            user_agent: "Fedicore/test".to_string(),
            proxy: None,
            timeout: Duration::from_secs(5),
            allow_private_hosts: true,
        })
    }

    fn resolver() -> Resolver {
        let config = test_config();
        Resolver::new(config.build_client().unwrap(), config)
    }

    async fn spawn_remote(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn remote_app() -> Router {
        Router::new()
            .route(
                "/notes/1",
                get(|| async {
                    Json(json!({"@context": AS, "id": "/notes/1", "type": "Note"}))
                }),
            )
            .route(
                "/notes/foreign",
                get(|| async {
                    Json(json!({"@context": "https://example.org/other", "type": "Note"}))
                }),
            )
            .route("/notes/empty", get(|| async { Json(Value::Null) }))
            .route("/gone", get(|| async { StatusCode::GONE }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/ordered",
                get(|| async {
                    Json(json!({
                        "@context": [AS],
                        "type": "OrderedCollection",
                        "orderedItems": ["a", "b"]
                    }))
                }),
            )
    }

    #[tokio::test]
    async fn embedded_documents_are_returned_unchanged() {
        let resolver = resolver();
        let doc = json!({"id": "https://remote.example/notes/1", "type": "Note"});
        assert_eq!(resolver.resolve(&doc).await.unwrap(), doc);
        assert!(resolver.history().await.is_empty());
    }

    #[tokio::test]
    async fn null_is_invalid_input() {
        assert!(matches!(
            resolver().resolve(&Value::Null).await,
            Err(FederationError::InvalidInput)
        ));
    }

    #[tokio::test]
    async fn second_fetch_of_the_same_identifier_fails() {
        let base = spawn_remote(remote_app()).await;
        let resolver = resolver();
        let uri = format!("{}/notes/1", base);

        let doc = resolver.resolve(&json!(uri)).await.unwrap();
        assert_eq!(doc["type"], "Note");
        assert!(matches!(
            resolver.resolve(&json!(uri)).await,
            Err(FederationError::AlreadyResolved(u)) if u == uri
        ));
        assert_eq!(resolver.history().await, vec![uri]);
    }

    #[tokio::test]
    async fn missing_namespace_is_an_invalid_response() {
        let base = spawn_remote(remote_app()).await;
        let resolver = resolver();

        for path in ["/notes/foreign", "/notes/empty"] {
            match resolver.resolve_uri(&format!("{}{}", base, path)).await {
                Err(FederationError::InvalidResponse(_)) => {}
                other => panic!("expected invalid response for {path}, got: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn remote_status_is_classified() {
        let base = spawn_remote(remote_app()).await;
        let resolver = resolver();

        let gone = resolver.resolve_uri(&format!("{}/gone", base)).await.unwrap_err();
        assert_eq!(gone.status(), Some(410));
        assert!(gone.is_client_error());

        let broken = resolver.resolve_uri(&format!("{}/broken", base)).await.unwrap_err();
        assert_eq!(broken.status(), Some(500));
        assert!(broken.is_retryable());
    }

    #[tokio::test]
    async fn collections_expose_objects() {
        let resolver = resolver();
        let unordered = resolver
            .resolve_collection(&json!({"type": "Collection", "items": ["a", "b"]}))
            .await
            .unwrap();
        assert_eq!(unordered.kind, CollectionKind::Collection);
        assert_eq!(unordered.objects, vec![json!("a"), json!("b")]);

        let page = resolver
            .resolve_collection(&json!({"type": "CollectionPage"}))
            .await
            .unwrap();
        assert!(page.objects.is_empty());

        let ordered_page = resolver
            .resolve_collection(&json!({
                "type": "OrderedCollectionPage",
                "orderedItems": ["a", "b"],
                "items": ["ignored"]
            }))
            .await
            .unwrap();
        assert_eq!(ordered_page.kind, CollectionKind::OrderedCollectionPage);
        assert_eq!(ordered_page.objects, vec![json!("a"), json!("b")]);

        let base = spawn_remote(remote_app()).await;
        let ordered = resolver
            .resolve_collection(&json!(format!("{}/ordered", base)))
            .await
            .unwrap();
        assert_eq!(ordered.kind, CollectionKind::OrderedCollection);
        assert_eq!(ordered.objects, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn non_collections_are_rejected() {
        assert!(matches!(
            resolver().resolve_collection(&json!({"type": "Note"})).await,
            Err(FederationError::UnknownCollectionType(t)) if t == "Note"
        ));
    }

    #[tokio::test]
    async fn private_destinations_are_refused_by_default() {
        let config = Arc::new(ResolverConfig {
            allow_private_hosts: false,
            ..(*test_config()).clone()
        });
        let resolver = Resolver::new(config.build_client().unwrap(), config);

        for uri in [
            "http://127.0.0.1:9/users/alice",
            "http://localhost/users/alice",
            "file:///etc/passwd",
        ] {
            let err = resolver.resolve_uri(uri).await.unwrap_err();
            assert!(matches!(err, FederationError::Refused(_)), "{uri}: {err:?}");
            assert!(!err.is_retryable());
        }
    }
}
