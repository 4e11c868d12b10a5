use crate::{
    config::HeaderSecretRef,
    solver::SolverError,
};
use async_trait::async_trait;
use base64::prelude::*;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use reqwest::header::{
    HeaderMap,
    HeaderName,
    HeaderValue,
};
use std::{
    collections::BTreeMap,
    time::Duration,
};

/// Upper bound for a single secret lookup.
pub const SECRET_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of the secrets referenced by `headerSecretRef`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the data of secret `namespace/name` as key -> raw bytes.
    async fn secret_data(&self, name: &str, namespace: &str) -> Result<BTreeMap<String, Vec<u8>>, kube::Error>;
}

/// [`SecretStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn secret_data(&self, name: &str, namespace: &str) -> Result<BTreeMap<String, Vec<u8>>, kube::Error> {
        trace!(%name, %namespace, "secret lookup");
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, bytes)| (key, bytes.0))
            .collect())
    }
}

/// The process wide header set. An empty `value` disables the header.
pub fn default_headers(name: &str, value: &str) -> Result<HeaderMap, SolverError> {
    let mut headers = HeaderMap::new();
    if value.is_empty() {
        return Ok(headers);
    }
    headers.insert(header_name(name)?, header_value(name, value.as_bytes())?);
    Ok(headers)
}

/// Computes the headers for one outbound challenge request.
///
/// Starts from a copy of `defaults`. When `secret_ref` names a secret, every key of that secret is set as a
/// header, replacing a default of the same name. Secret values hold the base64 encoded header value.
pub async fn resolve_headers(
    defaults: &HeaderMap,
    secret_ref: &HeaderSecretRef,
    request_namespace: &str,
    store: Option<&dyn SecretStore>,
) -> Result<HeaderMap, SolverError> {
    let mut headers = defaults.clone();
    if secret_ref.name.is_empty() {
        return Ok(headers);
    }

    let store = store.ok_or(SolverError::KubeClientNotConfigured)?;

    let name = secret_ref.name.as_str();
    let namespace = if secret_ref.namespace.is_empty() {
        request_namespace
    } else {
        secret_ref.namespace.as_str()
    };

    debug!(%name, %namespace, "fetching header secret");
    let data = match tokio::time::timeout(SECRET_FETCH_TIMEOUT, store.secret_data(name, namespace)).await {
        Ok(Ok(data)) => data,
        Ok(Err(source)) => {
            return Err(SolverError::SecretFetch {
                name: name.to_string(),
                namespace: namespace.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(SolverError::SecretTimeout {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
        }
    };

    for (key, encoded) in data {
        let decoded = BASE64_STANDARD
            .decode(&encoded)
            .map_err(|source| SolverError::SecretDecode {
                name: name.to_string(),
                namespace: namespace.to_string(),
                key: key.clone(),
                source,
            })?;
        trace!(header = %key, "header from secret");
        headers.insert(header_name(&key)?, header_value(&key, &decoded)?);
    }

    Ok(headers)
}

fn header_name(name: &str) -> Result<HeaderName, SolverError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|source| SolverError::InvalidHeaderName {
        name: name.to_string(),
        source,
    })
}

fn header_value(name: &str, value: &[u8]) -> Result<HeaderValue, SolverError> {
    HeaderValue::from_bytes(value).map_err(|source| SolverError::InvalidHeaderValue {
        name: name.to_string(),
        source,
    })
}
