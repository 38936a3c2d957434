// Copyright 2025 Oxide Computer Company

//! Test cases for TLS support.

use dockhand::ApiVersion;
use dockhand::Body;
use dockhand::ConfigServer;
use dockhand::ConfigTls;
use dockhand::Handler;
use dockhand::HttpHandlerResult;
use dockhand::HttpRouter;
use dockhand::HttpServer;
use dockhand::HttpServerStarter;
use dockhand::RequestContext;
use dockhand::ResponseWriter;
use dockhand::test_util::read_string;
use http::Request;
use http::StatusCode;
use hyper_util::rt::TokioIo;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_rustls::TlsConnector;

use crate::common;

/// Accepts any certificate, remembering the last one the server presented.
#[derive(Debug, Default)]
struct RecordingVerifier {
    presented: Mutex<Option<Vec<u8>>>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.presented.lock().unwrap() = Some(end_entity.to_vec());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        // Default algorithm from rcgen
        vec![SignatureScheme::ECDSA_NISTP256_SHA256]
    }
}

async fn hello(
    _rqctx: RequestContext<()>,
    writer: ResponseWriter,
) -> HttpHandlerResult {
    writer.write("hello over tls").await
}

fn make_server(
    test_name: &str,
    cert_file: &Path,
    key_file: &Path,
) -> Result<HttpServer<()>, String> {
    let logctx = common::create_log_context(test_name);
    let config = ConfigServer {
        tls: Some(ConfigTls {
            cert_file: cert_file.to_path_buf(),
            key_file: key_file.to_path_buf(),
        }),
        ..common::test_config()
    };
    let mut router = HttpRouter::new();
    router.add(
        ApiVersion::DEFAULT,
        http::Method::GET,
        "/hello",
        Handler::new("hello", hello),
    );
    let fixture = common::Fixture::new();
    let result = HttpServerStarter::new(
        &config,
        router,
        (),
        &logctx.log,
        fixture.backends(),
    )
    .map(HttpServerStarter::start)
    .map_err(|e| e.to_string());
    logctx.cleanup_successful();
    result
}

/// Makes one request over a fresh TLS connection.
async fn get_hello(
    server: &HttpServer<()>,
    verifier: Arc<RecordingVerifier>,
) -> (StatusCode, String) {
    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let tcp = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .expect("failed to connect");
    let server_name = ServerName::try_from("localhost".to_string()).unwrap();
    let tls = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS handshake failed");

    let (mut sender, conn) =
        hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .expect("HTTP handshake failed");
    tokio::spawn(conn);

    let request = Request::builder()
        .uri("/hello")
        .header(http::header::HOST, "localhost")
        .body(Body::empty())
        .unwrap();
    let mut response = sender.send_request(request).await.unwrap();
    let status = response.status();
    (status, read_string(&mut response).await)
}

#[tokio::test]
async fn test_tls() {
    let (cert_file, key_file, cert_der) = common::tls_key_to_file();
    let server =
        make_server("test_tls", cert_file.path(), key_file.path()).unwrap();
    assert!(server.using_tls());

    let verifier = Arc::new(RecordingVerifier::default());
    let (status, body) = get_hello(&server, Arc::clone(&verifier)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello over tls");
    assert_eq!(verifier.presented.lock().unwrap().as_ref(), Some(&cert_der));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_tls_refresh() {
    let (cert_file, key_file, _) = common::tls_key_to_file();
    let server =
        make_server("test_tls_refresh", cert_file.path(), key_file.path())
            .unwrap();

    let (cert_file, key_file, cert_der) = common::tls_key_to_file();
    server
        .refresh_tls(&ConfigTls {
            cert_file: cert_file.path().to_path_buf(),
            key_file: key_file.path().to_path_buf(),
        })
        .await
        .unwrap();

    // New connections get the new certificate.
    let verifier = Arc::new(RecordingVerifier::default());
    let (status, _) = get_hello(&server, Arc::clone(&verifier)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verifier.presented.lock().unwrap().as_ref(), Some(&cert_der));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_tls_bad_files() {
    let (cert_file, key_file, _) = common::tls_key_to_file();

    let error = make_server(
        "test_tls_bad_files",
        Path::new("/nonexistent/cert.pem"),
        key_file.path(),
    )
    .err()
    .expect("server started without a certificate");
    assert!(error.contains("failed to open"), "unexpected error: {}", error);

    // A certificate where the key should be.
    let error =
        make_server("test_tls_bad_files", cert_file.path(), cert_file.path())
            .err()
            .expect("server started without a key");
    assert_eq!(error, "expected a single private key");
}
