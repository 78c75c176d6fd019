//! QueryClient - responsibility and behavior
//!
//! Issues queries against the Lakerunner query API and hands each streaming
//! response body to a [`StreamDecoder`].
//!
//! - Builds endpoint URLs from the configured base URL and [`QueryParams`].
//! - Sets the headers the API expects on every request (`api-key`, SSE accept, origin).
//! - Rejects non-200 responses with the status and body text.
//! - Does not retry. A failed request is returned to the caller as is.

// Local crates
use crate::{
    helpers::load_config::Settings,
    query::query::{BaseExpr, GraphRequest, QueryParams},
    stream::decoder::{EventStream, StreamDecoder},
};

// External crates
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::{
    StatusCode, Url,
    header::{ACCEPT, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, ORIGIN},
};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::instrument;

/// Endpoint returning log rows for a graph request.
pub const GRAPH_ENDPOINT: &str = "/api/v1/graph";
/// Endpoint returning tag names or tag values for a single expression.
pub const TAGS_ENDPOINT: &str = "/api/v1/tags/logs";

const USER_AGENT: &str = concat!("lakerunner-cli/", env!("CARGO_PKG_VERSION"));
const API_KEY_HEADER: &str = "api-key";
const MAX_IDLE_CONNECTIONS: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Extra time the transport timeout allows past the query deadline, so a slow
/// stream is stopped by cancellation rather than failing with a timeout error.
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

type ResponseBody = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid query URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid API key header value")]
    InvalidApiKey,
    #[error("invalid origin header value '{0}'")]
    InvalidOrigin(String),
    #[error("failed to marshal request: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to make request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request cancelled before a response arrived")]
    Cancelled,
}

/// HTTP client for one Lakerunner deployment.
#[derive(Debug, Clone)]
pub struct QueryClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl QueryClient {
    pub fn new(settings: &Settings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.request_timeout_secs))
            .timeout(transport_timeout(settings.request_timeout_secs))
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            base_url: settings.query_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            http,
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join `endpoint` onto the base URL and append the non-empty `params`.
    pub fn build_url(&self, endpoint: &str, params: &QueryParams) -> Result<Url, ClientError> {
        let raw = if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.base_url)
        } else {
            format!("{}/{endpoint}", self.base_url)
        };

        let mut url = Url::parse(&raw).map_err(|e| ClientError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;

        let pairs = params.pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        Ok(url)
    }

    /// Headers sent with every query.
    pub fn common_headers(&self) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(
            HeaderName::from_static(API_KEY_HEADER),
            HeaderValue::from_str(&self.api_key).map_err(|_| ClientError::InvalidApiKey)?,
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            ORIGIN,
            HeaderValue::from_str(&self.base_url)
                .map_err(|_| ClientError::InvalidOrigin(self.base_url.clone()))?,
        );
        Ok(headers)
    }

    /// Query log rows. The returned stream stops when `cancel` fires.
    #[instrument(
        name = "lakerunner_client::query_graph",
        target = "client::client::QueryClient",
        skip_all,
        level = "debug"
    )]
    pub async fn query_graph(
        &self,
        request: &GraphRequest,
        params: &QueryParams,
        cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError> {
        self.post_stream(GRAPH_ENDPOINT, request, params, cancel)
            .await
    }

    /// Query tag names, or the values of `params.tag_name` when set.
    #[instrument(
        name = "lakerunner_client::query_tags",
        target = "client::client::QueryClient",
        skip_all,
        level = "debug"
    )]
    pub async fn query_tags(
        &self,
        expression: &BaseExpr,
        params: &QueryParams,
        cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError> {
        self.post_stream(TAGS_ENDPOINT, expression, params, cancel)
            .await
    }

    async fn post_stream<T: Serialize>(
        &self,
        endpoint: &str,
        body: &T,
        params: &QueryParams,
        cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError> {
        let url = self.build_url(endpoint, params)?;
        let body = serde_json::to_vec(body)?;

        tracing::debug!(
            url = %url,
            body_len = body.len(),
            "Sending query request"
        );

        let request = self
            .http
            .post(url)
            .headers(self.common_headers()?)
            .body(body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            response = request => response?,
        };

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body, "Query request rejected");
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!("Query accepted, decoding event stream");
        let body: ResponseBody = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(StreamDecoder::new(StreamReader::new(body), cancel).spawn())
    }
}

/// Total transport timeout for a query whose deadline is `deadline_secs`.
fn transport_timeout(deadline_secs: u64) -> Duration {
    Duration::from_secs(deadline_secs).saturating_add(TRANSPORT_GRACE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::query::{
        FilterOp, LOGS_DATASET, create_expression, create_filter, create_graph_request,
    };
    use futures::StreamExt;
    use http_body_util::{BodyExt, Full};
    use hyper::{Request, Response, body::Incoming, service::service_fn};
    use hyper_util::{
        rt::{TokioExecutor, TokioIo},
        server::conn::auto::Builder as HyperServerBuilder,
    };
    use std::collections::BTreeMap;
    use std::convert::Infallible;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// What the test server saw.
    #[derive(Debug)]
    struct Captured {
        method: String,
        path_and_query: String,
        headers: hyper::HeaderMap,
        body: Vec<u8>,
    }

    /// Serve `status`/`body` for every request on an ephemeral port.
    async fn serve(status: u16, body: &'static str) -> (String, mpsc::UnboundedReceiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let method = req.method().to_string();
                        let path_and_query = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.to_string())
                            .unwrap_or_default();
                        let headers = req.headers().clone();
                        let request_body = req.into_body().collect().await.unwrap().to_bytes();
                        let _ = tx.send(Captured {
                            method,
                            path_and_query,
                            headers,
                            body: request_body.to_vec(),
                        });

                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .header("content-type", "text/event-stream")
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap(),
                        )
                    }
                });

                tokio::spawn(async move {
                    let _ = HyperServerBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (format!("http://{addr}/"), rx)
    }

    fn client_for(base_url: &str) -> QueryClient {
        QueryClient::new(&Settings {
            query_url: base_url.to_string(),
            api_key: "test-key".to_string(),
            request_timeout_secs: 10,
        })
        .unwrap()
    }

    fn graph_request() -> GraphRequest {
        let filter = create_filter("resource.service.name", FilterOp::Has, vec![String::new()]);
        let expr = create_expression(LOGS_DATASET, 10, Some(filter.into()));
        create_graph_request(BTreeMap::from([("a".to_string(), expr)]))
    }

    #[test]
    fn build_url_normalizes_slashes_and_encodes_params() {
        let client = client_for("https://query.example.com/");
        let params = QueryParams::new("2024-01-01T00:00:00Z", "2024-01-01T01:00:00Z")
            .with_tag("resource.service.name", "string");

        let url = client.build_url("api/v1/tags/logs", &params).unwrap();

        assert_eq!(
            url.as_str(),
            "https://query.example.com/api/v1/tags/logs?s=2024-01-01T00%3A00%3A00Z&e=2024-01-01T01%3A00%3A00Z&tagName=resource.service.name&dataType=string"
        );
    }

    #[test]
    fn build_url_without_params_has_no_query() {
        let client = client_for("https://query.example.com");
        let url = client
            .build_url(GRAPH_ENDPOINT, &QueryParams::default())
            .unwrap();

        assert_eq!(url.as_str(), "https://query.example.com/api/v1/graph");
    }

    #[test]
    fn build_url_rejects_garbage_base() {
        let client = client_for("not a url");
        assert!(matches!(
            client.build_url(GRAPH_ENDPOINT, &QueryParams::default()),
            Err(ClientError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn common_headers_carry_key_and_origin() {
        let client = client_for("https://query.example.com/");
        assert_eq!(client.base_url(), "https://query.example.com");
        let headers = client.common_headers().unwrap();

        assert_eq!(headers[ACCEPT], "text/event-stream");
        assert_eq!(headers["api-key"], "test-key");
        assert_eq!(headers[CONTENT_TYPE], "text/plain;charset=UTF-8");
        assert_eq!(headers[CONNECTION], "keep-alive");
        assert_eq!(headers[ORIGIN], "https://query.example.com");
    }

    #[test]
    fn transport_timeout_outlasts_query_deadline() {
        for secs in [1, 60, 3600] {
            assert!(transport_timeout(secs) > Duration::from_secs(secs));
        }
        assert_eq!(transport_timeout(u64::MAX), Duration::MAX);
    }

    #[test]
    fn api_key_with_newline_is_rejected() {
        let client = QueryClient::new(&Settings {
            query_url: "http://localhost".into(),
            api_key: "bad\nkey".into(),
            request_timeout_secs: 1,
        })
        .unwrap();

        assert!(matches!(
            client.common_headers(),
            Err(ClientError::InvalidApiKey)
        ));
    }

    #[tokio::test]
    async fn query_graph_streams_decoded_events() {
        let (base_url, mut seen) = serve(
            200,
            "event: ping\n\
             data: {\"id\":\"1\",\"type\":\"event\",\"message\":{\"timestamp\":1704067200123,\"tags\":{\"_cardinalhq.message\":\"hello\"}}}\n\
             \n\
             data: NOT_JSON\n\
             data: {\"id\":\"2\",\"type\":\"event\",\"message\":{\"tsns\":1704067200123456789}}\n\
             data: {\"type\":\"done\"}\n\
             data: {\"id\":\"3\",\"type\":\"event\"}\n",
        )
        .await;
        let client = client_for(&base_url);
        let cancel = CancellationToken::new();

        let stream = client
            .query_graph(
                &graph_request(),
                &QueryParams::new("2024-01-01T00:00:00Z", "2024-01-01T01:00:00Z"),
                &cancel,
            )
            .await
            .unwrap();
        let events: Vec<_> = stream.map(|item| item.unwrap()).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp_ms(), Some(1_704_067_200_123));
        assert_eq!(events[0].tag_str("_cardinalhq.message"), Some("hello"));
        assert_eq!(
            events[1].payload["tsns"].as_i64(),
            Some(1_704_067_200_123_456_789)
        );

        let captured = seen.recv().await.unwrap();
        assert_eq!(captured.method, "POST");
        assert_eq!(
            captured.path_and_query,
            "/api/v1/graph?s=2024-01-01T00%3A00%3A00Z&e=2024-01-01T01%3A00%3A00Z"
        );
        assert_eq!(captured.headers["api-key"], "test-key");
        assert_eq!(captured.headers["accept"], "text/event-stream");
        assert!(
            captured.headers["user-agent"]
                .to_str()
                .unwrap()
                .starts_with("lakerunner-cli/")
        );

        let body: serde_json::Value = serde_json::from_slice(&captured.body).unwrap();
        assert_eq!(body["baseExpressions"]["a"]["dataset"], "logs");
        assert_eq!(body["baseExpressions"]["a"]["limit"], 10);
    }

    #[tokio::test]
    async fn query_tags_posts_bare_expression() {
        let (base_url, mut seen) = serve(
            200,
            "data: {\"type\":\"data\",\"message\":{\"level\":\"INFO\"}}\n",
        )
        .await;
        let client = client_for(&base_url);
        let cancel = CancellationToken::new();
        let expr = create_expression(LOGS_DATASET, 1000, None);

        let stream = client
            .query_tags(&expr, &QueryParams::new("a", "b").with_tag("level", "string"), &cancel)
            .await
            .unwrap();
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);

        let captured = seen.recv().await.unwrap();
        assert_eq!(
            captured.path_and_query,
            "/api/v1/tags/logs?s=a&e=b&tagName=level&dataType=string"
        );
        let body: serde_json::Value = serde_json::from_slice(&captured.body).unwrap();
        assert_eq!(body["id"], "logs_query");
        assert!(body.get("filter").is_none());
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error_with_body() {
        let (base_url, _seen) = serve(401, "invalid api key").await;
        let client = client_for(&base_url);
        let cancel = CancellationToken::new();

        let err = client
            .query_graph(&graph_request(), &QueryParams::default(), &cancel)
            .await
            .unwrap_err();

        match err {
            ClientError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid api key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_aborts_request() {
        let (base_url, _seen) = serve(200, "").await;
        let client = client_for(&base_url);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .query_graph(&graph_request(), &QueryParams::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Cancelled));
    }
}
