//! Shared utilities for integration tests.

use bareflow::{Server, ServerConfig, ServerHandle};

/// Config bound to a free loopback port, with body parsing on.
pub fn config() -> ServerConfig {
    ServerConfig { port: 0, address: "127.0.0.1".into(), ..ServerConfig::default() }
}

/// Starts `server` and returns its handle plus the base URL.
pub async fn start(server: Server) -> (ServerHandle, String) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let handle = server.start().await.expect("server starts");
    let base = format!("http://{}", handle.local_addr());
    (handle, base)
}

/// A client that never reuses connections, so shutdown tests don't hang on keep-alive.
#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().pool_max_idle_per_host(0).build().unwrap()
}
