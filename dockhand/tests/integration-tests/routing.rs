// Copyright 2025 Oxide Computer Company

//! Test cases for routing: versions, path variables, misses, and the headers
//! every response carries.

use dockhand::ApiVersion;
use dockhand::Body;
use dockhand::Handler;
use dockhand::HttpHandlerResult;
use dockhand::HttpRouter;
use dockhand::RequestContext;
use dockhand::ResponseWriter;
use dockhand::test_util::read_string;
use dockhand::HEADER_REQUEST_ID;
use http::header;
use http::Method;
use http::Request;
use http::StatusCode;

use crate::common;

async fn info_v1_0(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write("1.0").await
}

async fn info_v1_2(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write("1.2").await
}

async fn team_name(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    let team = rqctx.path_param("team").unwrap_or_default().to_string();
    writer.write(team).await
}

async fn echo_method(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write(rqctx.request.method().to_string()).await
}

fn router() -> HttpRouter<()> {
    let mut router = HttpRouter::new();
    router.add(
        ApiVersion::new(1, 0),
        Method::GET,
        "/info",
        Handler::new("info_v1_0", info_v1_0),
    );
    router.add(
        ApiVersion::new(1, 2),
        Method::GET,
        "/info",
        Handler::new("info_v1_2", info_v1_2),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/teams/{team}",
        Handler::new("team_get", team_name),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/teams",
        Handler::new("team_list", team_name),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/teams",
        Handler::new("team_create", team_name),
    );
    router.add_all(
        ApiVersion::DEFAULT,
        "/any",
        Handler::new("any", echo_method),
    );
    router
}

#[tokio::test]
async fn test_versioned_routes() {
    let (testctx, _fixture) =
        common::test_setup("test_versioned_routes", router());
    let client = &testctx.client_testctx;

    for (path, expected) in [
        ("/info", "1.0"),
        ("/1.0/info", "1.0"),
        ("/1.1/info", "1.0"),
        ("/1.2/info", "1.2"),
        ("/1.10/info", "1.2"),
        ("/2/info", "1.2"),
    ] {
        let mut response = client
            .make_request_no_body(Method::GET, path, StatusCode::OK)
            .await
            .unwrap();
        assert_eq!(read_string(&mut response).await, expected, "{}", path);
    }

    // Nothing is registered below 1.0.
    client
        .make_request_error(Method::GET, "/0.9/info", StatusCode::NOT_FOUND)
        .await;

    testctx.teardown().await;
}

#[tokio::test]
async fn test_path_variables() {
    let (testctx, _fixture) =
        common::test_setup("test_path_variables", router());
    let client = &testctx.client_testctx;

    let mut response = client
        .make_request_no_body(Method::GET, "/teams/front%20end", StatusCode::OK)
        .await
        .unwrap();
    assert_eq!(read_string(&mut response).await, "front end");

    let mut response = client
        .make_request_no_body(Method::GET, "/1.0/teams/ops", StatusCode::OK)
        .await
        .unwrap();
    assert_eq!(read_string(&mut response).await, "ops");

    client
        .make_request_error(Method::GET, "/teams/..", StatusCode::BAD_REQUEST)
        .await;

    testctx.teardown().await;
}

#[tokio::test]
async fn test_route_misses() {
    let (testctx, _fixture) = common::test_setup("test_route_misses", router());
    let client = &testctx.client_testctx;

    // Unknown paths get an empty body.
    let message = client
        .make_request_error(Method::GET, "/nope", StatusCode::NOT_FOUND)
        .await;
    assert_eq!(message, "");

    // Known paths with the wrong method list what would have worked.
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(client.url("/teams"))
        .body(Body::empty())
        .unwrap();
    let mut response = client.send(request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get(header::ALLOW).unwrap(), "GET, POST");
    assert_eq!(read_string(&mut response).await, "Method Not Allowed\n");

    // A catch-all route serves every method.
    for method in [Method::GET, Method::PUT, Method::DELETE] {
        let mut response = client
            .make_request_no_body(method.clone(), "/any", StatusCode::OK)
            .await
            .unwrap();
        assert_eq!(read_string(&mut response).await, method.as_str());
    }

    testctx.teardown().await;
}

#[tokio::test]
async fn test_common_headers() {
    let (testctx, _fixture) =
        common::test_setup("test_common_headers", router());
    let client = &testctx.client_testctx;

    let mut request_ids = Vec::new();
    for path in ["/info", "/nope"] {
        let request = Request::builder()
            .uri(client.url(path))
            .body(Body::empty())
            .unwrap();
        let response = client.send(request).await;
        let headers = response.headers();
        assert_eq!(headers.get("supported-client-min").unwrap(), "1.0.1");
        assert_eq!(
            headers.get("supported-serviceclient-min").unwrap(),
            "1.0.0"
        );
        assert_eq!(headers.get("supported-adminclient-min").unwrap(), "1.0.0");
        let request_id = headers
            .get(HEADER_REQUEST_ID)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(!request_id.is_empty());
        request_ids.push(request_id);
    }
    assert_ne!(request_ids[0], request_ids[1]);

    testctx.teardown().await;
}

#[tokio::test]
async fn test_request_id_header() {
    let fixture = common::Fixture::new();
    let config = dockhand::ConfigServer {
        request_id_header: Some("x-trace-id".to_string()),
        ..common::test_config()
    };
    let testctx = common::test_setup_with_context(
        "test_request_id_header",
        router(),
        (),
        &config,
        fixture.backends(),
    );
    let client = &testctx.client_testctx;

    // A caller-supplied id is reused.
    let request = Request::builder()
        .uri(client.url("/info"))
        .header("x-trace-id", "trace-1234")
        .body(Body::empty())
        .unwrap();
    let response = client.send(request).await;
    assert_eq!(response.headers().get("x-trace-id").unwrap(), "trace-1234");
    assert_eq!(
        response.headers().get(HEADER_REQUEST_ID).unwrap(),
        "trace-1234"
    );

    // Otherwise the generated one is echoed.
    let request = Request::builder()
        .uri(client.url("/info"))
        .body(Body::empty())
        .unwrap();
    let response = client.send(request).await;
    assert_eq!(
        response.headers().get("x-trace-id").unwrap(),
        response.headers().get(HEADER_REQUEST_ID).unwrap()
    );

    testctx.teardown().await;
}
