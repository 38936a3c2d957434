// Copyright 2025 Oxide Computer Company

//! Test cases for bearer-token authentication and permission checks.

use dockhand::ApiVersion;
use dockhand::AuthorizedHandler;
use dockhand::Body;
use dockhand::Handler;
use dockhand::HttpError;
use dockhand::HttpHandlerResult;
use dockhand::HttpRouter;
use dockhand::RequestContext;
use dockhand::ResponseWriter;
use dockhand::Token;
use dockhand::MESSAGE_FORBIDDEN;
use dockhand::MESSAGE_TOKEN_REQUIRED;
use dockhand::permission;
use dockhand::permission::scheme;
use dockhand::test_util::read_string;
use dockhand::test_util::TestContext;
use http::Method;
use http::StatusCode;

use crate::common;
use crate::common::bearer;
use crate::common::ADMIN_TOKEN;
use crate::common::APP_TOKEN;
use crate::common::READER_TOKEN;

async fn ping(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write("pong").await
}

async fn whoami(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
    token: Token,
) -> HttpHandlerResult {
    writer.write(token.owner_name().to_string()).await
}

async fn app_info(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
    token: Token,
) -> HttpHandlerResult {
    // App tokens don't get the app resolved for them.
    let Some(app) = rqctx.app() else {
        return writer.write(rqctx.app_name().unwrap_or("").to_string()).await;
    };
    permission::check(
        &token,
        scheme::APP_READ,
        &permission::contexts_for_app(&app),
    )?;
    writer.write_json(&app).await
}

async fn env_set(
    rqctx: RequestContext<()>,
    writer: ResponseWriter,
    token: Token,
) -> HttpHandlerResult {
    let app = rqctx
        .app()
        .ok_or_else(|| HttpError::for_not_found("App not found".to_string()))?;
    permission::check(
        &token,
        scheme::APP_UPDATE_ENV_SET,
        &permission::contexts_for_app(&app),
    )?;
    writer.write("env updated").await
}

fn router() -> HttpRouter<()> {
    let mut router = HttpRouter::new();
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/ping",
        Handler::new("ping", ping),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/whoami",
        AuthorizedHandler::new("whoami", whoami),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::GET,
        "/apps/{app}",
        AuthorizedHandler::new("app_info", app_info),
    );
    router.add(
        ApiVersion::DEFAULT,
        Method::POST,
        "/apps/{app}/env",
        AuthorizedHandler::new("env_set", env_set),
    );
    router
}

async fn get_as(
    testctx: &TestContext<()>,
    path: &str,
    token: &str,
    expected_status: StatusCode,
) -> Result<String, String> {
    let authorization = bearer(token);
    let mut response = testctx
        .client_testctx
        .make_request_with_headers(
            Method::GET,
            path,
            &[("authorization", authorization.as_str())],
            Body::empty(),
            expected_status,
        )
        .await?;
    Ok(read_string(&mut response).await)
}

#[tokio::test]
async fn test_missing_token() {
    let (testctx, _fixture) =
        common::test_setup("test_missing_token", router());

    let message = testctx
        .client_testctx
        .make_request_error(Method::GET, "/whoami", StatusCode::UNAUTHORIZED)
        .await;
    assert_eq!(message, MESSAGE_TOKEN_REQUIRED);

    // Handlers that don't need a principal run without one.
    let mut response = testctx
        .client_testctx
        .make_request_no_body(Method::GET, "/ping", StatusCode::OK)
        .await
        .unwrap();
    assert_eq!(read_string(&mut response).await, "pong");

    testctx.teardown().await;
}

#[tokio::test]
async fn test_invalid_token_is_ignored() {
    let (testctx, _fixture) =
        common::test_setup("test_invalid_token_is_ignored", router());

    let body = get_as(&testctx, "/ping", "bogus", StatusCode::OK).await;
    assert_eq!(body.unwrap(), "pong");

    let error =
        get_as(&testctx, "/whoami", "bogus", StatusCode::UNAUTHORIZED).await;
    assert_eq!(error.unwrap_err(), MESSAGE_TOKEN_REQUIRED);

    testctx.teardown().await;
}

#[tokio::test]
async fn test_user_token() {
    let (testctx, _fixture) = common::test_setup("test_user_token", router());

    let body = get_as(&testctx, "/whoami", ADMIN_TOKEN, StatusCode::OK).await;
    assert_eq!(body.unwrap(), "admin@example.com");

    // A bare token without the "bearer" prefix is accepted too.
    let mut response = testctx
        .client_testctx
        .make_request_with_headers(
            Method::GET,
            "/whoami",
            &[("authorization", READER_TOKEN)],
            Body::empty(),
            StatusCode::OK,
        )
        .await
        .unwrap();
    assert_eq!(read_string(&mut response).await, "reader@example.com");

    testctx.teardown().await;
}

#[tokio::test]
async fn test_app_resolution() {
    let (testctx, _fixture) =
        common::test_setup("test_app_resolution", router());

    let body =
        get_as(&testctx, "/apps/myapp", ADMIN_TOKEN, StatusCode::OK).await;
    let app: dockhand::App = serde_json::from_str(&body.unwrap()).unwrap();
    assert_eq!(app.name, "myapp");
    assert_eq!(app.pool, "prod");
    assert_eq!(app.teams, vec!["frontend".to_string()]);

    let error =
        get_as(&testctx, "/apps/nope", ADMIN_TOKEN, StatusCode::NOT_FOUND)
            .await;
    assert_eq!(error.unwrap_err(), "App not found");

    testctx.teardown().await;
}

#[tokio::test]
async fn test_app_token_mismatch() {
    let (testctx, _fixture) =
        common::test_setup("test_app_token_mismatch", router());

    let body = get_as(&testctx, "/apps/myapp", APP_TOKEN, StatusCode::OK).await;
    assert_eq!(body.unwrap(), "myapp");

    let error =
        get_as(&testctx, "/apps/otherapp", APP_TOKEN, StatusCode::FORBIDDEN)
            .await;
    assert_eq!(
        error.unwrap_err(),
        "app token mismatch, token for \"myapp\", request for \"otherapp\""
    );

    testctx.teardown().await;
}

#[tokio::test]
async fn test_permission_denied() {
    let (testctx, fixture) =
        common::test_setup("test_permission_denied", router());

    // The reader may read apps of its team but nothing else.
    let body =
        get_as(&testctx, "/apps/myapp", READER_TOKEN, StatusCode::OK).await;
    assert!(body.is_ok());
    let error =
        get_as(&testctx, "/apps/otherapp", READER_TOKEN, StatusCode::FORBIDDEN)
            .await;
    assert_eq!(error.unwrap_err(), MESSAGE_FORBIDDEN);

    let reader = bearer(READER_TOKEN);
    let error = testctx
        .client_testctx
        .make_request_with_headers(
            Method::POST,
            "/apps/myapp/env",
            &[("authorization", reader.as_str())],
            Body::empty(),
            StatusCode::FORBIDDEN,
        )
        .await
        .unwrap_err();
    assert_eq!(error, MESSAGE_FORBIDDEN);

    let admin = bearer(ADMIN_TOKEN);
    let mut response = testctx
        .client_testctx
        .make_request_with_headers(
            Method::POST,
            "/apps/myapp/env",
            &[("authorization", admin.as_str())],
            Body::empty(),
            StatusCode::OK,
        )
        .await
        .unwrap();
    assert_eq!(read_string(&mut response).await, "env updated");

    // Revoked tokens are as good as no token.
    assert!(fixture.tokens.revoke(ADMIN_TOKEN));
    let error =
        get_as(&testctx, "/whoami", ADMIN_TOKEN, StatusCode::UNAUTHORIZED)
            .await;
    assert_eq!(error.unwrap_err(), MESSAGE_TOKEN_REQUIRED);

    testctx.teardown().await;
}
