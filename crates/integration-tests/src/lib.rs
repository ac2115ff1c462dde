//! Integration tests for the wishlist engine.
//!
//! # Running Tests
//!
//! ```bash
//! # In-process tests (no external services)
//! cargo test -p wishlist-integration-tests
//!
//! # Including PostgreSQL-backed tests
//! WISHLIST_DATABASE_URL=postgres://... cargo test -p wishlist-integration-tests -- --include-ignored
//! ```
//!
//! Each test boots its own server on an ephemeral port with an in-memory
//! store and talks to it over HTTP with `reqwest`.

use std::net::SocketAddr;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tokio::task::JoinHandle;
use wishlist_server::config::{WishlistConfig, parse_api_tokens};
use wishlist_server::db::{MemoryStore, ResourceStore};
use wishlist_server::state::AppState;

/// Client IP every [`TestServer::request`] claims through `X-Forwarded-For`
/// unless it sets its own.
pub const DEFAULT_CLIENT_IP: &str = "198.51.100.20";

/// Bearer tokens known to every test server, as `(token, user, role)`.
pub const TOKENS: &[(&str, &str, &str)] = &[
    ("C3J27XDCG2LmlZGEONYlgCtjfIZ4SOcM", "alice", "user"),
    ("z9CPVNPkNa1Hedcm4pMbXDuCL1mHoOsF", "bob", "user"),
    ("aQfDPrAJ71fTquWoGsbeKXgzg2sye9b2", "carol", "user"),
    ("Rann76dEyTzAeKOmXRrvftva9AW7hipT", "dave", "user"),
    ("gadDZFlRJmCGmUXiAPyhzAnar3ZLt4bn", "erin", "user"),
    ("lz2MPKgcjnCqaXNv1syeefnLOpaMxxND", "frank", "user"),
    ("i9LE1Ki3ylOjt6o0NpUmkVO8JmR8y4EM", "shop", "store_owner"),
    ("fAdggcG9qpVTzqA05MFsHl7UeioEJP2N", "mod", "admin"),
];

/// Token for `user`.
///
/// # Panics
///
/// Panics if `user` has no token in [`TOKENS`].
#[must_use]
pub fn token_for(user: &str) -> &'static str {
    TOKENS
        .iter()
        .find(|(_, name, _)| *name == user)
        .map(|(token, _, _)| *token)
        .unwrap_or_else(|| panic!("no test token for {user}"))
}

/// Default test configuration with every token in [`TOKENS`] registered.
/// Proxy headers are trusted, so tests can pose as distinct clients.
///
/// # Panics
///
/// Panics if the token table fails validation.
#[must_use]
pub fn test_config() -> WishlistConfig {
    let raw = TOKENS
        .iter()
        .map(|(token, user, role)| format!("{token}={user}:{role}"))
        .collect::<Vec<_>>()
        .join(";");
    WishlistConfig {
        api_tokens: parse_api_tokens(&raw, "WISHLIST_API_TOKENS").expect("test tokens are valid"),
        trust_proxy_headers: true,
        ..WishlistConfig::default()
    }
}

/// A decoded API response.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    /// The `data` field of the envelope.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    /// The `error.kind` field of the envelope, if any.
    #[must_use]
    pub fn error_kind(&self) -> Option<&str> {
        self.body["error"]["kind"].as_str()
    }
}

/// A server running in the background for the duration of a test.
pub struct TestServer {
    addr: SocketAddr,
    client: Client,
    direct: Client,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Start a server with [`test_config`] and an in-memory store.
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    /// Start a server with `config` and an in-memory store.
    pub async fn with_config(config: WishlistConfig) -> Self {
        Self::with_store(config, MemoryStore::new()).await
    }

    /// Start a server with `config` over `store`.
    ///
    /// # Panics
    ///
    /// Panics if the listener cannot bind or the client cannot be built.
    pub async fn with_store<S: ResourceStore>(config: WishlistConfig, store: S) -> Self {
        let app = wishlist_server::app(AppState::new(config, store));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("listener has an address");
        let task = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(DEFAULT_CLIENT_IP),
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            addr,
            client,
            direct: Client::new(),
            task,
        }
    }

    /// Absolute URL for `path`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Request as `user`, or anonymously when `None`.
    #[must_use]
    pub fn request(&self, method: Method, path: &str, user: Option<&str>) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match user {
            Some(user) => builder.bearer_auth(token_for(user)),
            None => builder,
        }
    }

    /// Like [`Self::request`], but without any proxy headers, so the server
    /// only sees the TCP peer.
    #[must_use]
    pub fn direct_request(&self, method: Method, path: &str, user: Option<&str>) -> RequestBuilder {
        let builder = self.direct.request(method, self.url(path));
        match user {
            Some(user) => builder.bearer_auth(token_for(user)),
            None => builder,
        }
    }

    /// Create a wishlist owned by `owner` and return its id.
    ///
    /// # Panics
    ///
    /// Panics if creation does not succeed.
    pub async fn create_wishlist(&self, owner: &str, name: &str, is_public: bool) -> String {
        let reply = send(
            self.request(Method::POST, "/api/wishlists", Some(owner))
                .json(&serde_json::json!({ "name": name, "isPublic": is_public })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);
        reply.data()["id"].as_str().expect("wishlist id").to_string()
    }

    /// Add an item to `wishlist_id` as `owner` and return its id.
    ///
    /// # Panics
    ///
    /// Panics if the item is not created.
    pub async fn add_item(&self, owner: &str, wishlist_id: &str, name: &str) -> String {
        let reply = send(
            self.request(
                Method::POST,
                &format!("/api/items?wishlistId={wishlist_id}"),
                Some(owner),
            )
            .json(&serde_json::json!({ "name": name, "priority": 3 })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);
        reply.data()["id"].as_str().expect("item id").to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Send `request` and decode the JSON envelope.
///
/// # Panics
///
/// Panics if the request fails or the body is not JSON.
pub async fn send(request: RequestBuilder) -> Reply {
    let response = request.send().await.expect("request failed");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.json::<Value>().await.expect("response is JSON");
    Reply {
        status,
        headers,
        body,
    }
}
