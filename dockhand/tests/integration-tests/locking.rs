// Copyright 2025 Oxide Computer Company

//! Test cases for the app lock taken around mutating requests.

use chrono::DateTime;
use chrono::Utc;
use dockhand::ApiVersion;
use dockhand::AuthorizedHandler;
use dockhand::Body;
use dockhand::ConfigServer;
use dockhand::HttpHandlerResult;
use dockhand::HttpRouter;
use dockhand::LockStore;
use dockhand::RequestContext;
use dockhand::ResponseWriter;
use dockhand::ServerContext;
use dockhand::Token;
use dockhand::TryLock;
use dockhand::test_util::read_string;
use dockhand::test_util::TestContext;
use http::Method;
use http::StatusCode;
use serde::Deserialize;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::common;
use crate::common::bearer;
use crate::common::ADMIN_TOKEN;

async fn lock_reason(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
    _token: Token,
) -> HttpHandlerResult {
    // Report what the lock says while the handler runs.
    let app = rqctx.app_name().unwrap_or("").to_string();
    let lock = rqctx.server.locks.get_lock(&app).await?;
    writer.write(format!("{} {}", lock.owner, lock.reason)).await
}

async fn deploy(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
    _token: Token,
) -> HttpHandlerResult {
    // The deploy goes on in the background; the lock goes with it.
    rqctx.keep_lock_after_return();
    writer.write("deploying").await
}

#[derive(Deserialize)]
struct SwapParams {
    app1: String,
    app2: String,
}

async fn swap(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
    token: Token,
) -> HttpHandlerResult {
    let params: SwapParams = rqctx.query()?;
    let guards = rqctx
        .server
        .locks
        .acquire_many(
            &[params.app1.as_str(), params.app2.as_str()],
            token.owner_name(),
            "PUT /swap",
            rqctx.server.config.lock_wait(),
        )
        .await?;
    for guard in guards {
        guard.release().await?;
    }
    writer.write("swapped").await
}

fn router() -> HttpRouter<()> {
    let mut router = HttpRouter::new();
    for (method, path, name) in [
        (Method::GET, "/apps/{app}/lock", "app_lock_get"),
        (Method::POST, "/apps/{app}/env", "env_set"),
        (Method::POST, "/apps/{app}/log", "app_log_post"),
    ] {
        router.add(
            ApiVersion::DEFAULT,
            method,
            path,
            AuthorizedHandler::new(name, lock_reason),
        );
    }
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/apps/{app}/deploy",
        AuthorizedHandler::new("deploy", deploy),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::PUT,
        "/swap",
        AuthorizedHandler::new("app_swap", swap),
    );
    router
}

async fn request<Context: ServerContext>(
    testctx: &TestContext<Context>,
    method: Method,
    path: &str,
    expected_status: StatusCode,
) -> Result<String, String> {
    let authorization = bearer(ADMIN_TOKEN);
    let mut response = testctx
        .client_testctx
        .make_request_with_headers(
            method,
            path,
            &[("authorization", authorization.as_str())],
            Body::empty(),
            expected_status,
        )
        .await?;
    Ok(read_string(&mut response).await)
}

#[tokio::test]
async fn test_lock_held_during_request() {
    let (testctx, fixture) =
        common::test_setup("test_lock_held_during_request", router());

    let body =
        request(&testctx, Method::POST, "/apps/myapp/env", StatusCode::OK)
            .await
            .unwrap();
    assert_eq!(body, "admin@example.com POST /apps/myapp/env");

    // Released once the request is done.
    let lock = fixture.store.get_lock("myapp").await.unwrap().unwrap();
    assert!(!lock.locked);

    testctx.teardown().await;
}

#[tokio::test]
async fn test_lock_conflict() {
    let (testctx, fixture) =
        common::test_setup("test_lock_conflict", router());

    let acquired = fixture
        .store
        .try_lock("myapp", "someone@example.com", "POST /deploy", Utc::now())
        .await
        .unwrap();
    assert_eq!(acquired, TryLock::Acquired);

    let message =
        request(&testctx, Method::POST, "/apps/myapp/env", StatusCode::CONFLICT)
            .await
            .unwrap_err();
    assert!(
        message.starts_with(
            "myapp: App locked by someone@example.com, running \
             POST /deploy. Acquired in "
        ),
        "unexpected message: {}",
        message
    );

    // Reads don't take the lock.
    let body =
        request(&testctx, Method::GET, "/apps/myapp/lock", StatusCode::OK)
            .await
            .unwrap();
    assert_eq!(body, "someone@example.com POST /deploy");

    // Neither do exempt handlers.
    let body =
        request(&testctx, Method::POST, "/apps/myapp/log", StatusCode::OK)
            .await
            .unwrap();
    assert_eq!(body, "someone@example.com POST /deploy");

    // The failed request left the other holder's lock alone.
    let lock = fixture.store.get_lock("myapp").await.unwrap().unwrap();
    assert!(lock.locked);
    assert_eq!(lock.owner, "someone@example.com");

    fixture.store.unlock("myapp").await.unwrap();
    request(&testctx, Method::POST, "/apps/myapp/env", StatusCode::OK)
        .await
        .unwrap();

    testctx.teardown().await;
}

#[tokio::test]
async fn test_lock_wait() {
    let fixture = common::Fixture::new();
    let config = dockhand::ConfigServer {
        lock_wait: 5,
        ..common::test_config()
    };
    let testctx = common::test_setup_with_context(
        "test_lock_wait",
        router(),
        (),
        &config,
        fixture.backends(),
    );

    fixture
        .store
        .try_lock("myapp", "someone@example.com", "POST /deploy", Utc::now())
        .await
        .unwrap();
    let store = fixture.store.clone();
    let unlocker = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        store.unlock("myapp").await.unwrap();
    });

    // The request waits for the holder to go away.
    let body =
        request(&testctx, Method::POST, "/apps/myapp/env", StatusCode::OK)
            .await
            .unwrap();
    assert_eq!(body, "admin@example.com POST /apps/myapp/env");
    unlocker.await.unwrap();

    testctx.teardown().await;
}

#[tokio::test]
async fn test_lock_kept_after_return() {
    let (testctx, fixture) =
        common::test_setup("test_lock_kept_after_return", router());

    let body =
        request(&testctx, Method::POST, "/apps/myapp/deploy", StatusCode::OK)
            .await
            .unwrap();
    assert_eq!(body, "deploying");

    let lock = fixture.store.get_lock("myapp").await.unwrap().unwrap();
    assert!(lock.locked);
    assert_eq!(lock.owner, "admin@example.com");
    assert_eq!(lock.reason, "POST /apps/myapp/deploy");

    // Whoever took over the lock releases it.
    testctx.server.locks().release("myapp").await.unwrap();
    let lock = fixture.store.get_lock("myapp").await.unwrap().unwrap();
    assert!(!lock.locked);

    testctx.teardown().await;
}

#[tokio::test]
async fn test_lock_unknown_app() {
    let (testctx, _fixture) =
        common::test_setup("test_lock_unknown_app", router());

    let message =
        request(&testctx, Method::POST, "/apps/nope/env", StatusCode::NOT_FOUND)
            .await
            .unwrap_err();
    assert_eq!(message, "App not found");

    testctx.teardown().await;
}

#[tokio::test]
async fn test_swap_conflict_names_app() {
    let (testctx, fixture) =
        common::test_setup("test_swap_conflict_names_app", router());

    fixture
        .store
        .try_lock("otherapp", "x@example.com", "/test", Utc::now())
        .await
        .unwrap();

    let message = request(
        &testctx,
        Method::PUT,
        "/swap?app1=myapp&app2=otherapp",
        StatusCode::CONFLICT,
    )
    .await
    .unwrap_err();
    assert!(
        message.starts_with("otherapp: App locked by x@example.com, running "),
        "unexpected message: {}",
        message
    );

    // The first app was locked and then given back.
    let lock = fixture.store.get_lock("myapp").await.unwrap().unwrap();
    assert!(!lock.locked);
    let lock = fixture.store.get_lock("otherapp").await.unwrap().unwrap();
    assert_eq!(lock.owner, "x@example.com");

    fixture.store.unlock("otherapp").await.unwrap();
    let body = request(
        &testctx,
        Method::PUT,
        "/swap?app1=myapp&app2=otherapp",
        StatusCode::OK,
    )
    .await
    .unwrap();
    assert_eq!(body, "swapped");

    testctx.teardown().await;
}

/// What the handlers saw while holding the lock.
#[derive(Default)]
struct LockRecorder {
    running: AtomicUsize,
    overlapped: AtomicBool,
    acquired: Mutex<Vec<DateTime<Utc>>>,
}

async fn record_lock(
    rqctx: RequestContext<Arc<LockRecorder>>,
    writer: ResponseWriter,
    _token: Token,
) -> HttpHandlerResult {
    let recorder = Arc::clone(rqctx.context());
    if recorder.running.fetch_add(1, Ordering::SeqCst) != 0 {
        recorder.overlapped.store(true, Ordering::SeqCst);
    }
    let app = rqctx.app_name().unwrap_or("").to_string();
    let lock = rqctx.server.locks.get_lock(&app).await?;
    if let Some(acquired_at) = lock.acquired_at {
        recorder.acquired.lock().unwrap().push(acquired_at);
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    recorder.running.fetch_sub(1, Ordering::SeqCst);
    writer.write("ok").await
}

#[tokio::test]
async fn test_concurrent_mutations_serialize() {
    let fixture = common::Fixture::new();
    let config = ConfigServer {
        lock_wait: 10,
        lock_poll_interval_ms: 10,
        ..common::test_config()
    };
    let recorder = Arc::new(LockRecorder::default());
    let mut router = HttpRouter::new();
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/apps/{app}/env",
        AuthorizedHandler::new("env_set", record_lock),
    );
    let testctx = common::test_setup_with_context(
        "test_concurrent_mutations_serialize",
        router,
        Arc::clone(&recorder),
        &config,
        fixture.backends(),
    );

    const REQUESTS: usize = 4;
    let requests = (0..REQUESTS).map(|_| {
        request(&testctx, Method::POST, "/1.0/apps/myapp/env", StatusCode::OK)
    });
    for result in futures::future::join_all(requests).await {
        assert_eq!(result.unwrap(), "ok");
    }

    // One holder at a time, each taking the lock after the last let go.
    assert!(!recorder.overlapped.load(Ordering::SeqCst));
    let acquired = recorder.acquired.lock().unwrap().clone();
    assert_eq!(acquired.len(), REQUESTS);
    assert!(
        acquired.windows(2).all(|w| w[0] < w[1]),
        "acquisition times out of order: {:?}",
        acquired
    );
    let lock = fixture.store.get_lock("myapp").await.unwrap().unwrap();
    assert!(!lock.locked);

    testctx.teardown().await;
}
