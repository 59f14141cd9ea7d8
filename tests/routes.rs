//! Routing behavior against a live server.

use std::time::{Duration, Instant};

use bareflow::{Flow, Json, Method, RouteError, RouteOptions, Server};
use serde_json::{Value, json};

mod common;

async fn echo_id(flow: Flow) -> String {
    flow.param("id").unwrap_or_default()
}

#[tokio::test]
async fn matches_params_and_ignores_trailing_slash() {
    let server = Server::new(common::config());
    server.router().get("/users/:id/", echo_id).unwrap();
    let (handle, base) = common::start(server).await;

    for path in ["/users/42", "/users/42/"] {
        let res = reqwest::get(format!("{base}{path}")).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.headers()["content-type"], "text/plain; charset=utf-8");
        assert_eq!(res.text().await.unwrap(), "42");
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unmatched_request_is_404() {
    let server = Server::new(common::config());
    server.router().get("/only-get", |_f: Flow| async { "ok" }).unwrap();
    let (handle, base) = common::start(server).await;
    let client = reqwest::Client::new();

    let missing = client.get(format!("{base}/nope")).send().await.unwrap();
    assert_eq!(missing.status(), 404);
    assert_eq!(missing.text().await.unwrap(), bareflow::NOT_FOUND_BODY);

    let wrong_method = client.post(format!("{base}/only-get")).send().await.unwrap();
    assert_eq!(wrong_method.status(), 404);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let server = Server::new(common::config());
    server.router().get("/", |flow: Flow| async move { flow.id() }).unwrap();
    let (handle, base) = common::start(server).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{base}/")).header("x-request-id", "trace-1").send().await.unwrap();
    assert_eq!(res.headers()["x-request-id"], "trace-1");
    assert_eq!(res.text().await.unwrap(), "trace-1");

    let res = client.get(format!("{base}/")).send().await.unwrap();
    let generated = res.headers()["x-request-id"].to_str().unwrap().to_owned();
    assert_eq!(generated.len(), 36);
    assert_eq!(res.text().await.unwrap(), generated);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn route_timeout_answers_503_early() {
    let server = Server::new(common::config());
    server
        .router()
        .get_with("/slow", RouteOptions::timeout(Duration::from_millis(200)), |_f: Flow| async {
            tokio::time::sleep(Duration::from_millis(2000)).await;
            "too late"
        })
        .unwrap();
    let (handle, base) = common::start(server).await;

    let started = Instant::now();
    let res = reqwest::get(format!("{base}/slow")).await.unwrap();
    assert_eq!(res.status(), 503);
    assert_eq!(res.text().await.unwrap(), bareflow::TIMEOUT_BODY);
    assert!(started.elapsed() < Duration::from_millis(1500), "took {:?}", started.elapsed());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn runtime_route_joins_live_table() {
    let server = Server::new(common::config());
    server.router().get("/existing", |_f: Flow| async { "old" }).unwrap();

    let early = server.router().runtime().get("/early", |_f: Flow| async { "never" });
    assert!(matches!(early, Err(RouteError::NotListening { .. })));

    let (handle, base) = common::start(server).await;
    assert_eq!(reqwest::get(format!("{base}/late")).await.unwrap().status(), 404);

    handle.router().runtime().get("/late", |_f: Flow| async { "new" }).unwrap();
    assert_eq!(reqwest::get(format!("{base}/late")).await.unwrap().text().await.unwrap(), "new");
    assert_eq!(reqwest::get(format!("{base}/existing")).await.unwrap().text().await.unwrap(), "old");

    // Re-declaring at runtime replaces the handler.
    handle.router().runtime().get("/existing", |_f: Flow| async { "replaced" }).unwrap();
    assert_eq!(
        reqwest::get(format!("{base}/existing")).await.unwrap().text().await.unwrap(),
        "replaced"
    );
    assert_eq!(handle.router().routes(), vec!["GET?/existing", "GET?/late"]);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn multi_method_declaration() {
    let server = Server::new(common::config());
    server
        .router()
        .declare(&[Method::Put, Method::Patch], "/items/{id}", RouteOptions::default(), |flow: Flow| async move {
            Json(json!({"method": flow.method().map(|m| m.as_str()), "body": flow.body().as_json().cloned()}))
        })
        .unwrap();
    let (handle, base) = common::start(server).await;
    let client = reqwest::Client::new();

    let res = client.patch(format!("{base}/items/1")).json(&json!({"n": 1})).send().await.unwrap();
    assert_eq!(res.headers()["content-type"], "application/json");
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"method": "PATCH", "body": {"n": 1}}));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_errors_use_default_dispatcher() {
    let server = Server::new(common::config());
    server
        .router()
        .get("/fail", |_f: Flow| async { Err::<(), _>(std::io::Error::other("disk on fire")) })
        .unwrap();
    let (handle, base) = common::start(server).await;

    let res = reqwest::get(format!("{base}/fail")).await.unwrap();
    assert_eq!(res.status(), 500);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "disk on fire");
    assert!(body["stack"].is_string());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn route_cache_options_and_error_statuses() {
    let server = Server::new(common::config());
    server
        .router()
        .get_with("/nocache", RouteOptions::no_cache(), |flow: Flow| async move {
            flow.set_header("Cache-Control", "public, max-age=60");
            "fresh"
        })
        .unwrap()
        .get("/forbidden", |flow: Flow| async move {
            flow.set_header("Cache-Control", "public");
            flow.send_status(403);
        })
        .unwrap();
    let (handle, base) = common::start(server).await;

    let res = reqwest::get(format!("{base}/nocache")).await.unwrap();
    assert_eq!(res.headers()["cache-control"], "no-store");
    assert_eq!(res.headers()["pragma"], "no-cache");

    let res = reqwest::get(format!("{base}/forbidden")).await.unwrap();
    assert_eq!(res.status(), 403);
    assert!(res.headers().get("cache-control").is_none());
    handle.shutdown().await.unwrap();
}
