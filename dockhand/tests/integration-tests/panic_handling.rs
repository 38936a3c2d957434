// Copyright 2025 Oxide Computer Company

//! Test cases for handler panic handling.

use dockhand::ApiVersion;
use dockhand::Handler;
use dockhand::HttpHandlerResult;
use dockhand::HttpRouter;
use dockhand::RequestContext;
use dockhand::ResponseWriter;
use dockhand::test_util::read_string;
use http::Method;
use http::StatusCode;

use crate::common;

async fn handler_that_panics(
    _rqctx: RequestContext<()>,
    _writer: ResponseWriter,
) -> HttpHandlerResult {
    panic!("test panic message");
}

async fn handler_that_panics_late(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write("partial output\n").await?;
    panic!("test panic message");
}

async fn healthcheck(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write("WORKING").await
}

fn router() -> HttpRouter<()> {
    let mut router = HttpRouter::new();
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/panic",
        Handler::new("panic", handler_that_panics),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/panic-late",
        Handler::new("panic_late", handler_that_panics_late),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/healthcheck",
        Handler::new("healthcheck", healthcheck),
    );
    router
}

#[tokio::test]
async fn test_panic_handler_returns_500() {
    let (testctx, _fixture) =
        common::test_setup("test_panic_handler_returns_500", router());

    let message = testctx
        .client_testctx
        .make_request_error(
            Method::GET,
            "/panic",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
        .await;
    assert_eq!(message, "Internal Server Error");

    // The server keeps serving.
    let mut response = testctx
        .client_testctx
        .make_request_no_body(Method::GET, "/healthcheck", StatusCode::OK)
        .await
        .unwrap();
    assert_eq!(read_string(&mut response).await, "WORKING");

    testctx.teardown().await;
}

#[tokio::test]
async fn test_panic_after_writing() {
    let (testctx, _fixture) =
        common::test_setup("test_panic_after_writing", router());

    // The status is already out; the failure is appended to the body.
    let mut response = testctx
        .client_testctx
        .make_request_no_body(Method::GET, "/panic-late", StatusCode::OK)
        .await
        .unwrap();
    assert_eq!(
        read_string(&mut response).await,
        "partial output\nInternal Server Error\n"
    );

    testctx.teardown().await;
}
