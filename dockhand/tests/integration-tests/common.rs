// Copyright 2025 Oxide Computer Company

//! Common facilities for automated testing.

use dockhand::permission::ContextType;
use dockhand::permission::Permission;
use dockhand::permission::PermissionContext;
use dockhand::permission::PermissionSet;
use dockhand::test_util::LogContext;
use dockhand::test_util::TestContext;
use dockhand::App;
use dockhand::Authenticator;
use dockhand::Backends;
use dockhand::ConfigLogging;
use dockhand::ConfigLoggingIfExists;
use dockhand::ConfigLoggingLevel;
use dockhand::ConfigServer;
use dockhand::HttpRouter;
use dockhand::MemoryStore;
use dockhand::Principal;
use dockhand::ServerContext;
use dockhand::Token;
use dockhand::TokenTable;
use slog::o;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Token with every permission everywhere.
pub const ADMIN_TOKEN: &str = "admin-token";
/// Token that may only read apps owned by the "frontend" team.
pub const READER_TOKEN: &str = "reader-token";
/// Token that belongs to the app "myapp".
pub const APP_TOKEN: &str = "app-token";

/// The apps and tokens every test server starts with.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub tokens: Arc<TokenTable>,
}

impl Fixture {
    pub fn new() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_app(App::new("myapp", "python", "prod", &["frontend"]));
        store.insert_app(App::new("otherapp", "go", "dev", &["backend"]));

        let tokens = Arc::new(TokenTable::new("api-tokens"));
        tokens.insert(Token::new(
            ADMIN_TOKEN,
            Principal::User { email: "admin@example.com".to_string() },
            [Permission::new("*", PermissionContext::global())]
                .into_iter()
                .collect(),
        ));
        tokens.insert(Token::new(
            READER_TOKEN,
            Principal::User { email: "reader@example.com".to_string() },
            [Permission::new(
                "app.read",
                PermissionContext::new(ContextType::Team, "frontend"),
            )]
            .into_iter()
            .collect(),
        ));
        tokens.insert(Token::new(
            APP_TOKEN,
            Principal::App { app: "myapp".to_string() },
            PermissionSet::new(),
        ));
        Fixture { store, tokens }
    }

    pub fn backends(&self) -> Backends {
        Backends::in_memory(
            Authenticator::new(self.tokens.clone()),
            Arc::clone(&self.store),
        )
    }
}

/// Server configuration for tests: any free port, no waiting for locks.
pub fn test_config() -> ConfigServer {
    // The IP address to which we bind can be any local IP, but we use
    // 127.0.0.1 because we know it's present, it shouldn't expose this server
    // on any external network, and we don't have to go looking for some other
    // local IP (likely in a platform-specific way).  We specify port 0 to
    // request any available port.  This is important because we may run
    // multiple concurrent tests, so any fixed port could result in spurious
    // failures due to port conflicts.
    ConfigServer {
        listen: "127.0.0.1:0".parse().unwrap(),
        lock_wait: 0,
        lock_poll_interval_ms: 10,
        shutdown_timeout: 5,
        ..Default::default()
    }
}

pub fn test_setup(
    test_name: &str,
    router: HttpRouter<()>,
) -> (TestContext<()>, Fixture) {
    let fixture = Fixture::new();
    let testctx = test_setup_with_context(
        test_name,
        router,
        (),
        &test_config(),
        fixture.backends(),
    );
    (testctx, fixture)
}

pub fn test_setup_with_context<Context: ServerContext>(
    test_name: &str,
    router: HttpRouter<Context>,
    ctx: Context,
    config: &ConfigServer,
    backends: Backends,
) -> TestContext<Context> {
    let logctx = create_log_context(test_name);
    let log = logctx.log.new(o!());
    TestContext::new(router, ctx, config, backends, Some(logctx), log)
}

pub fn create_log_context(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Debug,
        path: "UNUSED".into(),
        if_exists: ConfigLoggingIfExists::Fail,
    };
    LogContext::new(test_name, &log_config)
}

/// Value for an Authorization header carrying `token`.
pub fn bearer(token: &str) -> String {
    format!("bearer {}", token)
}

fn make_temp_file() -> std::io::Result<NamedTempFile> {
    tempfile::Builder::new().prefix("dockhand-test-").rand_bytes(5).tempfile()
}

/// A self-signed certificate for "localhost" and its key, written to
/// temporary PEM files for the server config.  Also returns the DER form of
/// the certificate so that clients can check what the server presented.
pub fn tls_key_to_file() -> (NamedTempFile, NamedTempFile, Vec<u8>) {
    let key_pair =
        rcgen::KeyPair::generate().expect("keypair generation failed");
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .expect("invalid certificate params");
    let cert = params.self_signed(&key_pair).expect("failed to sign cert");

    let mut cert_file = make_temp_file().expect("failed to create cert_file");
    let mut key_file = make_temp_file().expect("failed to create key_file");
    cert_file
        .write_all(cert.pem().as_bytes())
        .expect("failed to write cert");
    key_file
        .write_all(key_pair.serialize_pem().as_bytes())
        .expect("failed to write key");

    (cert_file, key_file, cert.der().to_vec())
}
