//! Minimal bareflow service: JSON endpoints, a middleware, a slow route with a
//! timeout, and a route added once the server is live.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl http://localhost:3000/slow          # 503 after 200 ms
//!   curl http://localhost:3000/late          # registered at runtime

use std::time::Duration;

use bareflow::{
    CacheOptions, Cacheability, ExpirationKind, Flow, Json, RouteOptions, Server, ServerConfig,
    context,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct User {
    id: String,
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), bareflow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ServerConfig { logging: true, enable_context: true, ..ServerConfig::default() };
    let server = Server::new(config).middleware(tag_client);

    let cached = RouteOptions::cache(CacheOptions {
        cacheability: Some(Cacheability::Public),
        expiration_kind: Some(ExpirationKind::MaxAge),
        expiration_seconds: Some(60),
        revalidation: None,
    });
    server
        .router()
        .get_with("/users/:id", cached, get_user)?
        .post("/users", create_user)?
        .delete("/users/:id", delete_user)?
        .get_with("/slow", RouteOptions::timeout(Duration::from_millis(200)), slow)?;

    let handle = server.start().await?;
    handle.router().runtime().get("/late", |_flow: Flow| async { "added while running" })?;

    handle
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

// Stores the caller's user agent in the request's execution context.
async fn tag_client(flow: Flow) {
    if let (Some(execution), Some(agent)) = (context::current(), flow.request_header("user-agent")) {
        execution.set("agent", agent);
    }
}

// GET /users/:id
async fn get_user(flow: Flow) -> Json<User> {
    Json(User { id: flow.param("id").unwrap_or_default(), name: "alice".into() })
}

// POST /users
async fn create_user(flow: Flow) -> Result<(), bareflow::BoxError> {
    let Some(body) = flow.body().as_json().cloned() else {
        flow.status(400).send("expected a JSON body");
        return Ok(());
    };
    let name = body["name"].as_str().ok_or("missing `name`")?;
    flow.status(201)
        .set_header("Location", "/users/99")
        .json(&User { id: "99".into(), name: name.to_owned() })?;
    Ok(())
}

// DELETE /users/:id → 204 No Content
async fn delete_user(flow: Flow) {
    flow.send_status(204);
}

async fn slow(_flow: Flow) -> &'static str {
    tokio::time::sleep(Duration::from_secs(2)).await;
    "too late"
}
