use super::{
    MockDns,
    MockError,
    TxtRecords,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{
        StatusCode,
        Uri,
    },
    response::{
        IntoResponse,
        Response,
    },
    Router,
};
use std::{
    collections::HashMap,
    net::{
        Ipv4Addr,
        SocketAddr,
    },
};
use tokio::{
    net::TcpListener,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// A test httpreq endpoint that creates and deletes TXT records in its own [`MockDns`].
///
/// It does not check any headers. Tests that care about them wrap [`router`] themselves.
pub struct MockHttpReqEndpoint {
    addr: SocketAddr,
    dns: MockDns,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MockHttpReqEndpoint {
    /// Starts the endpoint and its DNS server on free loopback ports.
    pub async fn new() -> Result<Self, MockError> {
        let any = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        Self::bind(any, any).await
    }

    pub async fn bind(http_addr: SocketAddr, dns_addr: SocketAddr) -> Result<Self, MockError> {
        let mut dns = MockDns::bind(dns_addr).await?;
        dns.run()?;

        let listener = TcpListener::bind(http_addr).await.map_err(MockError::Bind)?;
        let addr = listener.local_addr().map_err(MockError::Bind)?;
        let stop = CancellationToken::new();

        let app = router(dns.records().clone());
        let task = tokio::spawn({
            let stop = stop.clone();
            async move {
                if let Err(err) = axum::serve(listener, app)
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
                {
                    error!(%addr, "mock httpreq endpoint failed: {err}");
                }
            }
        });

        info!(%addr, dns = %dns.addr(), "mock httpreq endpoint listening");

        Ok(Self {
            addr,
            dns,
            stop,
            task: Some(task),
        })
    }

    /// Base URL of the endpoint, e.g. `http://127.0.0.1:41234`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn dns(&self) -> &MockDns {
        &self.dns
    }

    /// Stops the DNS server and the HTTP server.
    pub async fn close(&mut self) -> Result<(), MockError> {
        self.dns.close().await?;
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("mock httpreq endpoint task failed: {err}");
            }
        }
        Ok(())
    }
}

/// The endpoint's routes: `/present` and `/cleanup` update `records`, any other path is accepted and ignored.
pub fn router(records: TxtRecords) -> Router {
    Router::new().fallback(handle_challenge).with_state(records)
}

async fn handle_challenge(State(records): State<TxtRecords>, uri: Uri, body: Bytes) -> Response {
    let body: HashMap<String, String> = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => {
            debug!("rejecting challenge body: {err}");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let field = |key: &str| body.get(key).cloned().unwrap_or_default();

    match uri.path() {
        "/present" => records.present(field("fqdn"), field("value")),
        "/cleanup" => records.cleanup(&field("fqdn")),
        path => debug!(%path, "ignoring challenge for unknown path"),
    }

    StatusCode::NO_CONTENT.into_response()
}
