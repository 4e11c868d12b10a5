use crate::{
    challenge::{
        ChallengeAction,
        ChallengeBody,
        ChallengeRequest,
    },
    config::load_config,
    headers::{
        self,
        KubeSecretStore,
        SecretStore,
    },
};
use async_trait::async_trait;
use reqwest::{
    header::{
        HeaderMap,
        HeaderValue,
        CONTENT_TYPE,
    },
    StatusCode,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const SOLVER_NAME: &str = "httpreq";

#[derive(thiserror::Error, Debug)]
pub enum SolverError {
    #[error("error decoding solver config: {0}")]
    Config(#[source] serde_json::Error),

    #[error("unrecognized challenge action: {0}")]
    UnrecognizedAction(String),

    #[error("invalid endpoint: no endpoint configured")]
    MissingEndpoint,

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("unable to retrieve headers secret, kube client was not configured")]
    KubeClientNotConfigured,

    #[error("unable to fetch headers secret {namespace}/{name}: {source}")]
    SecretFetch {
        name: String,
        namespace: String,
        source: kube::Error,
    },

    #[error("timed out fetching headers secret {namespace}/{name}")]
    SecretTimeout { name: String, namespace: String },

    #[error("unable to decode key {key:?} of headers secret {namespace}/{name}: {source}")]
    SecretDecode {
        name: String,
        namespace: String,
        key: String,
        source: base64::DecodeError,
    },

    #[error("invalid header name {name:?}: {source}")]
    InvalidHeaderName {
        name: String,
        source: reqwest::header::InvalidHeaderName,
    },

    #[error("invalid value for header {name:?}: {source}")]
    InvalidHeaderValue {
        name: String,
        source: reqwest::header::InvalidHeaderValue,
    },

    #[error("unable to serialize challenge body: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("challenge request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected server response: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("unable to create kube client: {0}")]
    KubeClient(#[source] kube::Error),
}

/// A DNS01 challenge solver as driven by the webhook server.
///
/// `initialize` is called at most once, before any `present` or `clean_up`. `present` and `clean_up` may run
/// concurrently.
#[async_trait]
pub trait Solver: Send + Sync {
    /// Identifier used to pick this solver when several are registered.
    fn name(&self) -> &str;

    async fn initialize(
        &mut self,
        kube_config: Option<kube::Config>,
        stop: CancellationToken,
    ) -> Result<(), SolverError>;

    async fn present(&self, ch: ChallengeRequest) -> Result<(), SolverError>;

    async fn clean_up(&self, ch: ChallengeRequest) -> Result<(), SolverError>;
}

/// Process wide settings of the httpreq solver.
#[derive(clap::Args, Clone, Debug)]
pub struct SolverArgs {
    #[clap(
        long,
        env = "HTTPREQ_AUTH_HEADER_NAME",
        default_value = "Authorization",
        help = "Name of the header sent with every challenge request"
    )]
    pub auth_header_name: String,

    #[clap(
        long,
        env = "HTTPREQ_AUTH_HEADER",
        default_value = "",
        hide_env_values = true,
        help = "Value of the default header. Empty disables it. A header secret of the issuer overrides it"
    )]
    pub auth_header: String,
}

impl Default for SolverArgs {
    fn default() -> Self {
        Self {
            auth_header_name: "Authorization".to_string(),
            auth_header: String::new(),
        }
    }
}

/// Sends challenge records to a remote server as HTTP requests.
pub struct HttpReqSolver {
    headers: HeaderMap,
    secrets: Option<Arc<dyn SecretStore>>,
    http: reqwest::Client,
}

impl HttpReqSolver {
    pub fn new(args: &SolverArgs) -> Result<Self, SolverError> {
        Ok(Self {
            headers: headers::default_headers(&args.auth_header_name, &args.auth_header)?,
            secrets: None,
            http: reqwest::Client::new(),
        })
    }

    /// Use `store` for header secret lookups instead of a kube client set up by [`Solver::initialize`].
    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(store);
        self
    }

    /// The headers sent with every request, before secrets are applied.
    pub fn default_headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[instrument(level = "debug", skip_all, fields(action = %ch.action, fqdn = %ch.resolved_fqdn))]
    async fn challenge_request(&self, ch: &ChallengeRequest) -> Result<(), SolverError> {
        let cfg = load_config(ch.config.as_ref())?;
        let url = cfg.url_for(&ch.action)?;

        let mut headers = headers::resolve_headers(
            &self.headers,
            &cfg.header_secret_ref,
            &ch.resource_namespace,
            self.secrets.as_deref(),
        )
        .await?;
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));

        let body = serde_json::to_vec(&ChallengeBody::from(ch)).map_err(SolverError::Serialize)?;

        debug!(%url, headers = ?headers.keys().collect::<Vec<_>>(), "sending challenge request");

        let res = self.http.post(url).headers(headers).body(body).send().await?;

        let status = res.status();
        if !status.is_success() {
            warn!(%status, "challenge request rejected");
            return Err(SolverError::UnexpectedStatus(status));
        }

        info!("challenge request accepted");
        Ok(())
    }
}

#[async_trait]
impl Solver for HttpReqSolver {
    fn name(&self) -> &str {
        SOLVER_NAME
    }

    async fn initialize(
        &mut self,
        kube_config: Option<kube::Config>,
        _stop: CancellationToken,
    ) -> Result<(), SolverError> {
        let Some(kube_config) = kube_config else {
            debug!("no kube config, header secrets are unavailable");
            return Ok(());
        };

        let client = kube::Client::try_from(kube_config).map_err(SolverError::KubeClient)?;
        self.secrets = Some(Arc::new(KubeSecretStore::new(client)));
        info!("httpreq solver initialized with kube client");
        Ok(())
    }

    async fn present(&self, mut ch: ChallengeRequest) -> Result<(), SolverError> {
        ch.action = ChallengeAction::Present;
        self.challenge_request(&ch).await
    }

    async fn clean_up(&self, mut ch: ChallengeRequest) -> Result<(), SolverError> {
        ch.action = ChallengeAction::CleanUp;
        self.challenge_request(&ch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::tests::StaticSecrets;
    use serde_json::json;

    #[test]
    fn name() {
        let solver = HttpReqSolver::new(&SolverArgs::default()).unwrap();
        assert_eq!(solver.name(), "httpreq");
    }

    #[test]
    fn default_header_from_args() {
        let solver = HttpReqSolver::new(&SolverArgs {
            auth_header_name: "X-Api-Key".to_string(),
            auth_header: "secret".to_string(),
        })
        .unwrap();
        assert_eq!(solver.default_headers().len(), 1);
        assert_eq!(solver.default_headers()["x-api-key"], "secret");

        let solver = HttpReqSolver::new(&SolverArgs::default()).unwrap();
        assert!(solver.default_headers().is_empty());

        assert!(HttpReqSolver::new(&SolverArgs {
            auth_header_name: "Authorization".to_string(),
            auth_header: "line\nbreak".to_string(),
        })
        .is_err());
    }

    #[tokio::test]
    async fn initialize_without_kube_config() {
        let mut solver = HttpReqSolver::new(&SolverArgs::default()).unwrap();
        let stop = CancellationToken::new();
        solver.initialize(None, stop.clone()).await.unwrap();
        assert!(solver.secrets.is_none());
        stop.cancel();
    }

    #[tokio::test]
    async fn initialize_with_kube_config() {
        let mut solver = HttpReqSolver::new(&SolverArgs::default()).unwrap();
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        solver.initialize(Some(config), CancellationToken::new()).await.unwrap();
        assert!(solver.secrets.is_some());
    }

    // The endpoint below is never contacted, every case fails before the request is sent.

    #[tokio::test]
    async fn malformed_config() {
        let solver = HttpReqSolver::new(&SolverArgs::default()).unwrap();
        let ch = ChallengeRequest::new(
            ChallengeAction::Present,
            "test1.example.com.",
            "k",
            Some(json!({ "endpoint": ["http://127.0.0.1:1"] })),
        );
        assert!(matches!(solver.present(ch).await, Err(SolverError::Config(_))));
    }

    #[tokio::test]
    async fn missing_endpoint() {
        let solver = HttpReqSolver::new(&SolverArgs::default()).unwrap();
        let ch = ChallengeRequest::new(ChallengeAction::CleanUp, "test1.example.com.", "k", None);
        assert!(matches!(solver.clean_up(ch).await, Err(SolverError::MissingEndpoint)));
    }

    #[tokio::test]
    async fn secret_without_kube_client() {
        let solver = HttpReqSolver::new(&SolverArgs::default()).unwrap();
        let ch = ChallengeRequest::new(
            ChallengeAction::Present,
            "test1.example.com.",
            "k",
            Some(json!({ "endpoint": "http://127.0.0.1:1", "headerSecretRef": { "name": "headers" } })),
        );
        let err = solver.present(ch).await.unwrap_err();
        assert!(matches!(err, SolverError::KubeClientNotConfigured));
        assert_eq!(
            err.to_string(),
            "unable to retrieve headers secret, kube client was not configured"
        );
    }

    #[tokio::test]
    async fn secret_fetch_error_propagates() {
        let solver = HttpReqSolver::new(&SolverArgs::default())
            .unwrap()
            .with_secret_store(Arc::new(StaticSecrets::default()));
        let mut ch = ChallengeRequest::new(
            ChallengeAction::Present,
            "test1.example.com.",
            "k",
            Some(json!({ "endpoint": "http://127.0.0.1:1", "headerSecretRef": { "name": "headers" } })),
        );
        ch.resource_namespace = "cert-manager".to_string();
        let err = solver.present(ch).await.unwrap_err();
        assert!(matches!(
            err,
            SolverError::SecretFetch { ref namespace, .. } if namespace == "cert-manager"
        ));
        assert!(err.to_string().contains("cert-manager/headers"));
    }
}
