// Copyright 2025 Oxide Computer Company

//! Test cases for streamed responses.

use dockhand::ApiVersion;
use dockhand::AuthorizedHandler;
use dockhand::Body;
use dockhand::Handler;
use dockhand::HttpError;
use dockhand::HttpHandlerResult;
use dockhand::HttpRouter;
use dockhand::JsonStreamWriter;
use dockhand::KeepAlive;
use dockhand::RequestContext;
use dockhand::ResponseWriter;
use dockhand::StreamDecoder;
use dockhand::StreamError;
use dockhand::StreamMessage;
use dockhand::Token;
use dockhand::test_util::read_ndjson;
use dockhand::test_util::read_string;
use dockhand::CONTENT_TYPE_JSON_STREAM;
use http::header;
use http::Method;
use http::Request;
use http::StatusCode;
use http_body_util::BodyExt;
use std::time::Duration;

use crate::common;
use crate::common::bearer;
use crate::common::ADMIN_TOKEN;

async fn progress(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    let stream = JsonStreamWriter::start_stream(&writer).await;
    stream.write_message("---- step 1 ----\n").await?;
    stream.write_message("---- step 2 ----\n").await
}

async fn failed_build(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    let stream = JsonStreamWriter::start_stream(&writer).await;
    stream.write_message("building\n").await?;
    Err(HttpError::for_bad_request("build failed".to_string()))
}

async fn slow_work(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    let keep_alive = KeepAlive::scoped(&writer, Duration::from_millis(20), "");
    tokio::time::sleep(Duration::from_millis(150)).await;
    keep_alive.release().await;
    writer.write("done").await
}

async fn app_run(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
    _token: Token,
) -> HttpHandlerResult {
    // Each chunk of command output is one message.
    let app = rqctx.app_name().unwrap_or("").to_string();
    let stream = JsonStreamWriter::start_stream(&writer).await;
    let script = format!("{}.py\n", app);
    for chunk in ["total 0\n", "Procfile\n", script.as_str()] {
        stream.write_message(chunk).await?;
    }
    Ok(())
}

fn router() -> HttpRouter<()> {
    let mut router = HttpRouter::new();
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/progress",
        Handler::new("progress", progress),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/build",
        Handler::new("build", failed_build),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/slow",
        Handler::new("slow", slow_work),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/apps/{app}/run",
        AuthorizedHandler::new("app_run", app_run),
    );
    router
}

#[tokio::test]
async fn test_json_stream() {
    let (testctx, _fixture) = common::test_setup("test_json_stream", router());

    let mut response = testctx
        .client_testctx
        .make_request_no_body(Method::POST, "/progress", StatusCode::OK)
        .await
        .unwrap();
    let messages: Vec<StreamMessage> = read_ndjson(&mut response).await;
    let texts: Vec<&str> =
        messages.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(texts, vec!["---- step 1 ----\n", "---- step 2 ----\n"]);
    assert!(messages.iter().all(|m| m.error.is_empty()));

    testctx.teardown().await;
}

#[tokio::test]
async fn test_app_run_streams_messages() {
    let (testctx, _fixture) =
        common::test_setup("test_app_run_streams_messages", router());

    let authorization = bearer(ADMIN_TOKEN);
    let mut response = testctx
        .client_testctx
        .make_request_with_headers(
            Method::POST,
            "/1.0/apps/myapp/run",
            &[("authorization", authorization.as_str())],
            Body::empty(),
            StatusCode::OK,
        )
        .await
        .unwrap();
    let messages: Vec<StreamMessage> = read_ndjson(&mut response).await;
    let texts: Vec<&str> =
        messages.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(texts, vec!["total 0\n", "Procfile\n", "myapp.py\n"]);
    assert!(messages.iter().all(|m| m.error.is_empty()));

    testctx.teardown().await;
}

#[tokio::test]
async fn test_error_after_streaming() {
    let (testctx, _fixture) =
        common::test_setup("test_error_after_streaming", router());

    // The status was already sent, so the error arrives in-band.
    let mut response = testctx
        .client_testctx
        .make_request_no_body(Method::POST, "/build", StatusCode::OK)
        .await
        .unwrap();
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        CONTENT_TYPE_JSON_STREAM
    );
    let body = read_string(&mut response).await;
    assert_eq!(body.lines().count(), 2);

    let mut decoder = StreamDecoder::new();
    let error = decoder.feed(body.as_bytes()).unwrap_err();
    assert_eq!(error, StreamError::Remote("build failed".to_string()));

    testctx.teardown().await;
}

#[tokio::test]
async fn test_keep_alive() {
    let (testctx, _fixture) = common::test_setup("test_keep_alive", router());

    let mut response = testctx
        .client_testctx
        .make_request_no_body(Method::POST, "/slow", StatusCode::OK)
        .await
        .unwrap();
    let body = read_string(&mut response).await;
    assert!(body.ends_with("done"), "unexpected body: {:?}", body);
    let keep_alives = body.trim_end_matches("done");
    assert!(keep_alives.len() >= 2, "unexpected body: {:?}", body);
    assert!(keep_alives.chars().all(|c| c == '\n'));

    testctx.teardown().await;
}

async fn two_halves(
    rqctx: RequestContext<async_channel::Receiver<()>>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write("first half").await?;
    // Don't finish until the client has seen the first half.
    rqctx.context().recv().await.map_err(|e| {
        HttpError::for_internal_error(format!("test channel closed: {}", e))
    })?;
    writer.write("second half").await
}

#[tokio::test]
async fn test_writes_reach_client_immediately() {
    let (tx, rx) = async_channel::bounded(1);
    let mut router = HttpRouter::new();
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/halves",
        Handler::new("halves", two_halves),
    );
    let fixture = common::Fixture::new();
    let testctx = common::test_setup_with_context(
        "test_writes_reach_client_immediately",
        router,
        rx,
        &common::test_config(),
        fixture.backends(),
    );
    let client = &testctx.client_testctx;

    let request = Request::builder()
        .uri(client.url("/halves"))
        .body(Body::empty())
        .unwrap();
    let mut response = client.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let frame = response
        .body_mut()
        .frame()
        .await
        .expect("body ended early")
        .expect("error reading body");
    assert_eq!(frame.into_data().unwrap(), "first half");

    tx.send(()).await.unwrap();
    assert_eq!(read_string(&mut response).await, "second half");

    testctx.teardown().await;
}
