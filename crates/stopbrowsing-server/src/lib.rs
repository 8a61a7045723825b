//! StopBrowsing Server - block page for redirected requests.
//!
//! Blocked domains resolve to loopback, so a browser visiting one connects
//! to this machine. This server answers every GET, whatever the path, with
//! the block page instead of leaving the browser on a connection error.
//!
//! The page is `<page_dir>/index.html` when configured and readable, read
//! on each request so edits show up without a restart. Otherwise a
//! built-in page is served.
//!
//! ## Example
//!
//! ```no_run
//! use stopbrowsing_core::RedirectConfig;
//! use stopbrowsing_server::RedirectServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = RedirectServer::new(RedirectConfig::default()).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Uri};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info};

use stopbrowsing_core::RedirectConfig;

/// File served from the page directory.
pub const PAGE_FILE: &str = "index.html";

/// Page served when no custom page is available.
pub const BUILTIN_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Blocked by StopBrowsing</title>
<style>
body { font-family: sans-serif; background: #1d1f21; color: #c5c8c6; text-align: center; padding-top: 15vh; }
h1 { font-size: 2.5em; margin-bottom: 0.3em; }
p { font-size: 1.2em; }
</style>
</head>
<body>
<h1>This site is blocked</h1>
<p>StopBrowsing is keeping you focused. Get back to work.</p>
</body>
</html>
"#;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// The configured host and port do not form a socket address.
    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Clone)]
struct PageState {
    page_dir: Option<Arc<PathBuf>>,
}

impl PageState {
    async fn page(&self) -> String {
        let Some(dir) = &self.page_dir else {
            return BUILTIN_PAGE.to_string();
        };

        let path = dir.join(PAGE_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(page) => page,
            Err(e) => {
                debug!(page = %path.display(), "custom page unavailable, using built-in: {}", e);
                BUILTIN_PAGE.to_string()
            }
        }
    }
}

async fn serve_page(State(state): State<PageState>, uri: Uri) -> impl IntoResponse {
    debug!(path = %uri.path(), "serving block page");
    (
        [(header::CACHE_CONTROL, "no-store")],
        Html(state.page().await),
    )
}

/// The block page server.
pub struct RedirectServer {
    router: Router,
    addr: SocketAddr,
}

impl RedirectServer {
    /// Creates a server for the given configuration.
    pub fn new(config: RedirectConfig) -> Result<Self> {
        let ip: IpAddr = config
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| ServerError::InvalidAddress(config.host.clone()))?;
        let addr = SocketAddr::new(ip, config.port);

        let state = PageState {
            page_dir: config.page_dir.map(Arc::new),
        };
        let router = Router::new()
            .fallback(get(serve_page))
            .with_state(state);

        Ok(Self { router, addr })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> Result<()> {
        info!("Starting block page server on {}", self.addr);

        let socket = Socket::new(
            Domain::for_address(self.addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Rebinding right after a restart must not fail on TIME_WAIT sockets.
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_builtin_page_for_any_path() {
        let server = RedirectServer::new(RedirectConfig::default()).unwrap();

        for uri in ["/", "/watch?v=abc", "/deeply/nested/path.html"] {
            let (status, body) = get_body(server.router(), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, BUILTIN_PAGE);
        }
    }

    #[tokio::test]
    async fn test_custom_page() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(PAGE_FILE), "<h1>Go outside</h1>").unwrap();

        let server = RedirectServer::new(RedirectConfig {
            page_dir: Some(tmp.path().to_path_buf()),
            ..RedirectConfig::default()
        })
        .unwrap();

        let (status, body) = get_body(server.router(), "/anything").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>Go outside</h1>");
    }

    #[tokio::test]
    async fn test_missing_custom_page_falls_back() {
        let tmp = TempDir::new().unwrap();
        let server = RedirectServer::new(RedirectConfig {
            page_dir: Some(tmp.path().join("absent")),
            ..RedirectConfig::default()
        })
        .unwrap();

        let (_, body) = get_body(server.router(), "/").await;
        assert_eq!(body, BUILTIN_PAGE);
    }

    #[tokio::test]
    async fn test_page_is_not_cached() {
        let server = RedirectServer::new(RedirectConfig::default()).unwrap();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = server.router().oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
    }

    #[tokio::test]
    async fn test_post_is_rejected() {
        let server = RedirectServer::new(RedirectConfig::default()).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = server.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_address_from_config() {
        let server = RedirectServer::new(RedirectConfig {
            host: "0.0.0.0".into(),
            port: 8080,
            page_dir: None,
        })
        .unwrap();
        assert_eq!(server.addr(), "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_ipv6_address() {
        for host in ["::1", "[::1]"] {
            let server = RedirectServer::new(RedirectConfig {
                host: host.into(),
                port: 80,
                page_dir: None,
            })
            .unwrap();
            assert_eq!(server.addr(), "[::1]:80".parse::<SocketAddr>().unwrap());
        }
    }

    #[test]
    fn test_invalid_address() {
        let result = RedirectServer::new(RedirectConfig {
            host: "not a host".into(),
            ..RedirectConfig::default()
        });
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }
}
