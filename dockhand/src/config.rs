// Copyright 2020 Oxide Computer Company
/*!
 * Configuration for the control-plane server
 */

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/**
 * Handler names that never take the app lock.  These are either read-mostly
 * (log ingestion, unit status updates), synchronize internally (unit
 * registration, deploy diffs, run) or exist precisely to break a lock
 * (force-unlock).
 */
pub const DEFAULT_LOCK_EXEMPT_HANDLERS: [&str; 6] = [
    "app_log_post",
    "unit_status_set",
    "app_lock_force_delete",
    "unit_register",
    "deploy_diff",
    "app_run",
];

/**
 * Configuration for a control-plane server.
 *
 * This type implements [`serde::Deserialize`] and [`serde::Serialize`] and it
 * can be composed with the consumer's configuration (whatever format that's
 * in).  For example, consumers could define a custom `ApiConfig` for a binary
 * that embeds the server:
 *
 * ```
 * use dockhand::ConfigServer;
 * use serde::Deserialize;
 *
 * #[derive(Deserialize)]
 * struct ApiConfig {
 *     api: ConfigServer,
 *     /* ... (other binary-specific config) */
 * }
 *
 * fn main() -> Result<(), String> {
 *     let my_config: ApiConfig = toml::from_str(
 *         r##"
 *             [api]
 *             listen = "127.0.0.1:8080"
 *             shutdown_timeout = 30
 *             lock_wait = 5
 *             ## Optional, to enable TLS
 *             [api.tls]
 *             cert_file = "/path/to/certs.pem"
 *             key_file = "/path/to/key.pem"
 *         "##
 *     ).map_err(|error| format!("parsing config: {}", error))?;
 *
 *     let server_config: &ConfigServer = &my_config.api;
 *     assert_eq!(server_config.shutdown_timeout().as_secs(), 30);
 *     Ok(())
 * }
 * ```
 */
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ConfigServer {
    /** IP address and TCP port to which to bind for accepting connections */
    pub listen: SocketAddr,
    /** maximum allowed size of a request body read through the helpers */
    pub request_body_max_bytes: usize,
    /** If present, enables TLS with the given configuration */
    pub tls: Option<ConfigTls>,
    /** seconds allowed for reading request headers; 0 disables the limit */
    pub read_timeout: u64,
    /** seconds allowed for producing the response head; 0 disables it */
    pub write_timeout: u64,
    /** seconds allowed for graceful shutdown */
    pub shutdown_timeout: u64,
    /**
     * If set, the name of a header that carries a caller-supplied request id.
     * The value (or a generated one) is echoed back in the same header.
     */
    pub request_id_header: Option<String>,
    /**
     * A list of header names to include as extra properties in the log
     * messages emitted by the per-request logger.  Each header will, if
     * present, be included in the output with a "hdr_"-prefixed property name
     * in lower case that has all hyphens replaced with underscores; e.g.,
     * "X-Forwarded-For" will be included as "hdr_x_forwarded_for".
     */
    pub log_headers: Vec<String>,
    /** seconds a mutating request waits for its app lock */
    pub lock_wait: u64,
    /** milliseconds between attempts to take a held app lock */
    pub lock_poll_interval_ms: u64,
    /** names of handlers that never take the app lock */
    pub lock_exempt_handlers: Vec<String>,
    /**
     * Per-handler maximum flush latency, in milliseconds.  Handlers not listed
     * flush after every write.
     */
    pub flush_latency_ms: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConfigTls {
    /** Path to a PEM file containing a certificate chain for the
     *  server to identify itself with. The first certificate is the
     *  end-entity certificate, and the remaining are intermediate
     *  certificates on the way to a trusted CA.
     */
    pub cert_file: PathBuf,
    /** Path to a PEM-encoded PKCS #8 file containing the private key the
     *  server will use.
     */
    pub key_file: PathBuf,
}

impl ConfigServer {
    pub fn read_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.write_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms.max(1))
    }

    pub fn flush_latency(&self, handler_name: &str) -> Option<Duration> {
        self.flush_latency_ms
            .get(handler_name)
            .copied()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn is_lock_exempt(&self, handler_name: &str) -> bool {
        self.lock_exempt_handlers.iter().any(|h| h == handler_name)
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Default for ConfigServer {
    fn default() -> Self {
        ConfigServer {
            listen: "127.0.0.1:0".parse().unwrap(),
            request_body_max_bytes: 1024 * 1024,
            tls: None,
            read_timeout: 0,
            write_timeout: 0,
            shutdown_timeout: 600,
            request_id_header: None,
            log_headers: Vec::new(),
            lock_wait: 10,
            lock_poll_interval_ms: 100,
            lock_exempt_handlers: DEFAULT_LOCK_EXEMPT_HANDLERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            flush_latency_ms: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::ConfigServer;
    use crate::test_util::read_config;
    use std::time::Duration;

    #[test]
    fn test_config_defaults() {
        let config = read_config::<ConfigServer>("empty", "").unwrap();
        assert_eq!(config, ConfigServer::default());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(600));
        assert_eq!(config.lock_wait(), Duration::from_secs(10));
        assert_eq!(config.read_timeout(), None);
        assert!(config.is_lock_exempt("app_log_post"));
        assert!(config.is_lock_exempt("unit_status_set"));
        assert!(!config.is_lock_exempt("env_set"));
    }

    #[test]
    fn test_config_overrides() {
        let config = read_config::<ConfigServer>(
            "overrides",
            r##"
                listen = "0.0.0.0:8080"
                read_timeout = 5
                shutdown_timeout = 30
                lock_exempt_handlers = [ "app_run" ]
                request_id_header = "X-Request-Id"
                [flush_latency_ms]
                app_log_get = 250
                [tls]
                cert_file = "/etc/dockhand/cert.pem"
                key_file = "/etc/dockhand/key.pem"
            "##,
        )
        .unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert!(config.is_lock_exempt("app_run"));
        assert!(!config.is_lock_exempt("app_log_post"));
        assert_eq!(
            config.flush_latency("app_log_get"),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.flush_latency("app_deploy"), None);
        assert!(config.tls.is_some());
    }

    #[test]
    fn test_config_bad_listen() {
        let error = read_config::<ConfigServer>(
            "bad_listen",
            r##" listen = "not an address" "##,
        )
        .unwrap_err()
        .to_string();
        assert!(error.contains("invalid socket address syntax"), "{}", error);
    }
}
