use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSON;
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// The lifecycle step a challenge request asks for.
///
/// The webhook API transports this as a plain string. Values other than `Present` and `CleanUp` are
/// kept verbatim so they can be rejected with a useful message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChallengeAction {
    Present,
    CleanUp,
    Other(String),
}

impl From<String> for ChallengeAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Present" => ChallengeAction::Present,
            "CleanUp" => ChallengeAction::CleanUp,
            _ => ChallengeAction::Other(value),
        }
    }
}

impl From<ChallengeAction> for String {
    fn from(action: ChallengeAction) -> Self {
        action.to_string()
    }
}

impl fmt::Display for ChallengeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeAction::Present => f.write_str("Present"),
            ChallengeAction::CleanUp => f.write_str("CleanUp"),
            ChallengeAction::Other(other) => f.write_str(other),
        }
    }
}

/// A DNS01 challenge as handed to a solver by the webhook server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    #[serde(default)]
    pub uid: String,
    pub action: ChallengeAction,
    /// Challenge type, always "dns-01" for this solver.
    #[serde(rename = "type", default)]
    pub type_: String,
    /// The domain being validated, without the `_acme-challenge` prefix.
    #[serde(default)]
    pub dns_name: String,
    /// The TXT record value to present.
    pub key: String,
    /// Namespace of the issuer or challenge resource. Used as the default namespace for secret lookups.
    #[serde(default)]
    pub resource_namespace: String,
    /// Fully qualified name of the TXT record, with a trailing dot.
    #[serde(rename = "resolvedFQDN")]
    pub resolved_fqdn: String,
    #[serde(default)]
    pub resolved_zone: String,
    #[serde(default)]
    pub allow_ambient_credentials: bool,
    /// Solver specific configuration, decoded into an [`crate::config::IssuerConfig`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<JSON>,
}

impl ChallengeRequest {
    /// A dns-01 request for `resolved_fqdn` carrying `key`, with the given solver config.
    pub fn new(
        action: ChallengeAction,
        resolved_fqdn: impl ToString,
        key: impl ToString,
        config: Option<serde_json::Value>,
    ) -> Self {
        Self {
            uid: String::new(),
            action,
            type_: "dns-01".to_string(),
            dns_name: String::new(),
            key: key.to_string(),
            resource_namespace: String::new(),
            resolved_fqdn: resolved_fqdn.to_string(),
            resolved_zone: String::new(),
            allow_ambient_credentials: false,
            config: config.map(JSON),
        }
    }
}

/// Payload POSTed to the remote endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeBody {
    pub fqdn: String,
    pub value: String,
}

impl From<&ChallengeRequest> for ChallengeBody {
    fn from(ch: &ChallengeRequest) -> Self {
        ChallengeBody {
            fqdn: ch.resolved_fqdn.clone(),
            value: ch.key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_webhook_request() {
        let raw = serde_json::json!({
            "uid": "6c2b3f4e",
            "action": "Present",
            "type": "dns-01",
            "dnsName": "example.com",
            "key": "testkey1",
            "resourceNamespace": "cert-manager",
            "resolvedFQDN": "_acme-challenge.example.com.",
            "resolvedZone": "example.com.",
            "allowAmbientCredentials": false,
            "config": { "endpoint": "https://dns.example.net" }
        });

        let ch: ChallengeRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(ch.action, ChallengeAction::Present);
        assert_eq!(ch.resolved_fqdn, "_acme-challenge.example.com.");
        assert_eq!(ch.resource_namespace, "cert-manager");
        assert_eq!(
            ch.config.unwrap().0,
            serde_json::json!({ "endpoint": "https://dns.example.net" })
        );
    }

    #[test]
    fn unknown_action_is_kept() {
        let action: ChallengeAction = serde_json::from_value(serde_json::json!("Refresh")).unwrap();
        assert_eq!(action, ChallengeAction::Other("Refresh".to_string()));
        assert_eq!(serde_json::to_value(ChallengeAction::CleanUp).unwrap(), "CleanUp");
    }

    #[test]
    fn body_uses_fqdn_and_key() {
        let ch = ChallengeRequest::new(ChallengeAction::Present, "test1.example.com.", "testkey1", None);
        let body = serde_json::to_value(ChallengeBody::from(&ch)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "fqdn": "test1.example.com.", "value": "testkey1" })
        );
    }
}
