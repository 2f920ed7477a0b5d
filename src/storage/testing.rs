//! In-process HTTP responder for downloader tests

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::storage::huggingface::HubClient;

pub struct Route {
    pub method: &'static str,
    pub path: String,
    pub status: u16,
    pub body: Vec<u8>,
    /// Content-Length to announce instead of the body's real length
    pub declared_len: Option<usize>,
}

impl Route {
    pub fn get(path: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: "GET",
            path: path.to_string(),
            status: 200,
            body: body.into(),
            declared_len: None,
        }
    }

    pub fn head(path: &str, len: usize) -> Self {
        Self {
            method: "HEAD",
            body: vec![0u8; len],
            ..Self::get(path, Vec::new())
        }
    }

    /// Announce `declared_len` bytes but close after sending `body`
    pub fn truncated(path: &str, body: impl Into<Vec<u8>>, declared_len: usize) -> Self {
        Self {
            declared_len: Some(declared_len),
            ..Self::get(path, body)
        }
    }
}

/// Serve `routes` on a loopback port; unknown routes get a 404.
/// Returns the `http://host:port` endpoint.
pub async fn serve(routes: Vec<Route>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let request = String::from_utf8_lossy(&request).to_string();
                let mut line = request.split_whitespace();
                let method = line.next().unwrap_or("").to_string();
                let path = line.next().unwrap_or("").to_string();

                let (status, body, declared_len) = routes
                    .iter()
                    .find(|r| r.method == method && r.path == path)
                    .map(|r| (r.status, r.body.clone(), r.declared_len))
                    .unwrap_or((404, b"not found".to_vec(), None));

                let head = format!(
                    "HTTP/1.1 {} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    status,
                    declared_len.unwrap_or(body.len())
                );
                let _ = socket.write_all(head.as_bytes()).await;
                if method != "HEAD" {
                    let _ = socket.write_all(&body).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Client for `endpoint` that bypasses any system proxy
pub fn client(endpoint: &str) -> HubClient {
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    HubClient::with_client(endpoint, http)
}
