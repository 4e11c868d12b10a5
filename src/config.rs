use crate::{
    challenge::ChallengeAction,
    solver::SolverError,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSON;
use reqwest::Url;
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};
use std::path::Path;

pub const DEFAULT_PRESENT_PATH: &str = "/present";
pub const DEFAULT_CLEANUP_PATH: &str = "/cleanup";

/// Solver configuration set on the cert-manager issuer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct IssuerConfig {
    /// Base URL of the remote server
    pub endpoint: String,
    /// Path for presenting a new challenge record. Defaults to "/present"
    pub present_path: String,
    /// Path for deleting previous challenge records. Defaults to "/cleanup"
    pub cleanup_path: String,
    /// Reference to a Secret with HTTP headers to add to challenge requests
    pub header_secret_ref: HeaderSecretRef,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HeaderSecretRef {
    /// Secret name. Headers are only looked up when this is set.
    pub name: String,
    /// Secret namespace, defaults to the namespace of the challenge.
    pub namespace: String,
}

impl IssuerConfig {
    /// Builds the absolute URL to POST to for `action`.
    ///
    /// The action path is joined onto the endpoint's own path, so `https://host/api` with the default
    /// present path becomes `https://host/api/present`.
    pub fn url_for(&self, action: &ChallengeAction) -> Result<Url, SolverError> {
        let path = match action {
            ChallengeAction::Present if self.present_path.is_empty() => DEFAULT_PRESENT_PATH,
            ChallengeAction::Present => self.present_path.as_str(),
            ChallengeAction::CleanUp if self.cleanup_path.is_empty() => DEFAULT_CLEANUP_PATH,
            ChallengeAction::CleanUp => self.cleanup_path.as_str(),
            ChallengeAction::Other(action) => return Err(SolverError::UnrecognizedAction(action.clone())),
        };

        if self.endpoint.is_empty() {
            return Err(SolverError::MissingEndpoint);
        }

        let mut url = Url::parse(&self.endpoint).map_err(|err| SolverError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: err.to_string(),
        })?;
        if url.cannot_be_a_base() {
            return Err(SolverError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "endpoint cannot carry a path".to_string(),
            });
        }

        let joined = join_path(url.path(), path);
        url.set_path(&joined);
        Ok(url)
    }
}

/// Joins `elem` onto `base` and cleans the result: no empty or `.` segments, `..` drops the previous
/// segment, and a trailing slash on `elem` is kept.
fn join_path(base: &str, elem: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(elem.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut joined = format!("/{}", segments.join("/"));
    if elem.ends_with('/') && !segments.is_empty() {
        joined.push('/');
    }
    joined
}

/// Decodes the per-challenge solver config. A missing config yields the defaults.
pub fn load_config(config: Option<&JSON>) -> Result<IssuerConfig, SolverError> {
    let Some(config) = config else {
        return Ok(IssuerConfig::default());
    };
    IssuerConfig::deserialize(&config.0).map_err(SolverError::Config)
}

/// Reads an issuer config from a JSON file.
pub fn load_issuer_config_file(path: impl AsRef<Path>) -> eyre::Result<IssuerConfig> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|err| eyre::eyre!("unable to read {path:?}: {err}"))?;
    let config = serde_json::from_slice(&raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(endpoint: &str) -> IssuerConfig {
        IssuerConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_paths() {
        let cfg = config("http://127.0.0.1:8080");
        assert_eq!(
            cfg.url_for(&ChallengeAction::Present).unwrap().as_str(),
            "http://127.0.0.1:8080/present"
        );
        assert_eq!(
            cfg.url_for(&ChallengeAction::CleanUp).unwrap().as_str(),
            "http://127.0.0.1:8080/cleanup"
        );
    }

    #[test]
    fn endpoint_path_is_preserved() {
        let cfg = IssuerConfig {
            endpoint: "https://dns.example.net/api/v1/".to_string(),
            present_path: "acme/present".to_string(),
            cleanup_path: "//acme//cleanup/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            cfg.url_for(&ChallengeAction::Present).unwrap().as_str(),
            "https://dns.example.net/api/v1/acme/present"
        );
        assert_eq!(
            cfg.url_for(&ChallengeAction::CleanUp).unwrap().as_str(),
            "https://dns.example.net/api/v1/acme/cleanup/"
        );
    }

    #[test]
    fn query_is_kept() {
        let cfg = config("https://dns.example.net/hook?zone=example");
        assert_eq!(
            cfg.url_for(&ChallengeAction::Present).unwrap().as_str(),
            "https://dns.example.net/hook/present?zone=example"
        );
    }

    #[test]
    fn unrecognized_action() {
        let cfg = IssuerConfig {
            endpoint: "https://dns.example.net".to_string(),
            present_path: "/p".to_string(),
            cleanup_path: "/c".to_string(),
            ..Default::default()
        };
        for cfg in [cfg, IssuerConfig::default()] {
            let err = cfg
                .url_for(&ChallengeAction::Other("Refresh".to_string()))
                .unwrap_err();
            assert!(matches!(err, SolverError::UnrecognizedAction(action) if action == "Refresh"));
        }
    }

    #[test]
    fn empty_or_invalid_endpoint() {
        assert!(matches!(
            IssuerConfig::default().url_for(&ChallengeAction::Present),
            Err(SolverError::MissingEndpoint)
        ));
        assert!(matches!(
            config("not a url").url_for(&ChallengeAction::Present),
            Err(SolverError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            config("mailto:dns@example.net").url_for(&ChallengeAction::CleanUp),
            Err(SolverError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn join_path_cleans() {
        assert_eq!(join_path("/", "/present"), "/present");
        assert_eq!(join_path("/a/b", "../c"), "/a/c");
        assert_eq!(join_path("/", "../../x/"), "/x/");
        assert_eq!(join_path("/", "/"), "/");
    }

    #[test]
    fn load_config_defaults() {
        assert_eq!(load_config(None).unwrap(), IssuerConfig::default());
        let cfg = load_config(Some(&JSON(json!({ "endpoint": "http://localhost" })))).unwrap();
        assert_eq!(cfg.endpoint, "http://localhost");
        assert_eq!(cfg.present_path, "");
        assert_eq!(cfg.header_secret_ref, HeaderSecretRef::default());
    }

    #[test]
    fn load_config_full() {
        let cfg = load_config(Some(&JSON(json!({
            "endpoint": "https://dns.example.net",
            "presentPath": "/add",
            "cleanupPath": "/remove",
            "headerSecretRef": { "name": "httpreq-headers", "namespace": "cert-manager" }
        }))))
        .unwrap();
        assert_eq!(cfg.present_path, "/add");
        assert_eq!(cfg.cleanup_path, "/remove");
        assert_eq!(cfg.header_secret_ref.name, "httpreq-headers");
        assert_eq!(cfg.header_secret_ref.namespace, "cert-manager");
    }

    #[test]
    fn load_config_malformed() {
        let err = load_config(Some(&JSON(json!({ "endpoint": 42 })))).unwrap_err();
        assert!(matches!(err, SolverError::Config(_)));
        assert!(err.to_string().starts_with("error decoding solver config"));

        let err = load_config(Some(&JSON(json!("endpoint")))).unwrap_err();
        assert!(matches!(err, SolverError::Config(_)));
    }

    #[test]
    fn load_issuer_config_from_file() {
        let path = std::env::temp_dir().join(format!("httpreq-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"endpoint":"http://localhost:8080","presentPath":"/p"}"#).unwrap();
        let cfg = load_issuer_config_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.endpoint, "http://localhost:8080");
        assert_eq!(cfg.present_path, "/p");
    }
}
