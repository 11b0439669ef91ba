//! OpenAI-compatible `/embeddings` endpoint client.
//!
//! Rate limiting, server errors and transport failures surface as
//! `Unavailable` so the ingestion boundary can retry with backoff.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Embedding, EmbeddingClient, EmbeddingError};

#[derive(Debug, Clone)]
pub struct HttpEmbeddingConfig {
    /// Base URL, e.g. `http://localhost:8080/v1`
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Inputs per request
    pub batch_size: usize,
    /// Honour HTTP(S)_PROXY from the environment
    pub use_system_proxy: bool,
}

impl HttpEmbeddingConfig {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Self {
        Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
            dimension,
            api_key: None,
            timeout: Duration::from_secs(30),
            batch_size: 64,
            use_system_proxy: true,
        }
    }
}

#[derive(Clone)]
pub struct HttpEmbeddingClient {
    http: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    batch_size: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl HttpEmbeddingClient {
    pub fn new(config: HttpEmbeddingConfig) -> Result<Self, EmbeddingError> {
        if config.model.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("missing embedding model name".into()));
        }
        if config.batch_size == 0 {
            return Err(EmbeddingError::InvalidInput("batch_size must be positive".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|_| EmbeddingError::InvalidInput("invalid API key".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .default_headers(headers);
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model,
            dimension: config.dimension,
            batch_size: config.batch_size,
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimension,
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            warn!(status = %status, endpoint = %self.endpoint, "Embedding request failed");
            return Err(classify_status(status, text));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(format!("malformed response: {}", e)))?;
        order_response(parsed, inputs.len())
    }
}

fn classify_status(status: StatusCode, body: String) -> EmbeddingError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EmbeddingError::Unavailable(format!("{}: {}", status, body))
    } else {
        EmbeddingError::InvalidInput(format!("{}: {}", status, body))
    }
}

/// Restore input order and check the response covers every input.
fn order_response(mut parsed: EmbeddingResponse, expected: usize) -> Result<Vec<Embedding>, EmbeddingError> {
    parsed.data.sort_by_key(|entry| entry.index);
    let in_order = parsed.data.iter().enumerate().all(|(i, entry)| entry.index == i);
    if parsed.data.len() != expected || !in_order {
        return Err(EmbeddingError::Unavailable(format!(
            "endpoint returned {} embeddings for {} inputs",
            parsed.data.len(),
            expected
        )));
    }
    Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Unavailable("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(inputs = batch.len(), model = %self.model, "Requesting embeddings");
            vectors.extend(self.request(batch).await?);
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}/v1", addr)
    }

    /// Consume headers and the declared body so closing the socket is clean.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            received.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&received).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if received.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    fn client(base_url: &str) -> HttpEmbeddingClient {
        let config = HttpEmbeddingConfig {
            use_system_proxy: false,
            ..HttpEmbeddingConfig::new(base_url, "test-embed", 2)
        };
        HttpEmbeddingClient::new(config).unwrap()
    }

    #[test]
    fn test_response_reordered_by_index() {
        let parsed: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [{"embedding": [0.0, 1.0], "index": 1}, {"embedding": [1.0, 0.0], "index": 0}]}"#,
        )
        .unwrap();
        let vectors = order_response(parsed, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_short_response_rejected() {
        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [1.0, 0.0], "index": 0}]}"#).unwrap();
        assert!(matches!(order_response(parsed, 2), Err(EmbeddingError::Unavailable(_))));
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_transient());
    }

    #[test]
    fn test_missing_model_rejected() {
        let err = HttpEmbeddingClient::new(HttpEmbeddingConfig::new("http://localhost", " ", 2));
        assert!(matches!(err, Err(EmbeddingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_embed_against_local_endpoint() {
        let body = r#"{"data": [{"embedding": [0.6, 0.8], "index": 0}]}"#.to_string();
        let base = serve_once("200 OK", body).await;
        let vector = client(&base).embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.6, 0.8]);
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let base = serve_once("503 Service Unavailable", r#"{"error": "busy"}"#.to_string()).await;
        let err = client(&base).embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{}/v1", addr)).embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
    }
}
