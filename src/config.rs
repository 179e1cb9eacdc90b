use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Formatter;

/// URL schemes accepted for ICE server entries.
const ICE_URL_SCHEMES: &[&str] = &["stun:", "turn:"];

/// Recognised `iceTransportPolicy` names.
pub const ICE_TRANSPORT_POLICIES: &[&str] = &["all", "relay"];
/// Recognised `bundlePolicy` names.
pub const BUNDLE_POLICIES: &[&str] = &["balanced", "max-compat", "max-bundle"];
/// Recognised `rtcpMuxPolicy` names.
pub const RTCP_MUX_POLICIES: &[&str] = &["negotiate", "require"];

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCredentialType {
    #[default]
    Password,
}

impl std::fmt::Display for IceCredentialType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IceCredentialType::Password => f.write_str("password"),
        }
    }
}

/// Single STUN/TURN endpoint, possibly reachable under several URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default)]
    pub credential_type: IceCredentialType,
}

impl IceServer {
    /// Creates a new ICE server entry from a comma separated list of URLs. Every entry is
    /// trimmed and must start with `stun:` or `turn:`.
    ///
    /// `credentials` is positional: the first element is used as a username, the second one as
    /// a credential (password). Any further elements are ignored.
    pub fn parse(urls: &str, credentials: &[&str]) -> Result<Self> {
        let urls = urls
            .split(',')
            .map(|url| {
                let url = url.trim();
                if ICE_URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                    Ok(url.to_owned())
                } else {
                    Err(malformed_url(url))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IceServer {
            urls,
            username: credentials.first().map(|s| s.to_string()),
            credential: credentials.get(1).map(|s| s.to_string()),
            credential_type: IceCredentialType::Password,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(Error::Validation("IceServer: no urls provided".into()));
        }
        for url in self.urls.iter() {
            if !ICE_URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(malformed_url(url));
            }
        }
        Ok(())
    }
}

fn malformed_url(url: &str) -> Error {
    Error::Validation(format!("IceServer: received malformed url: <{url}>"))
}

/// Connection policy passed to [crate::PeerConnection::new].
///
/// Policy fields are kept as names (as in the browser `RTCConfiguration` dictionary) and are
/// resolved against the active backend when a connection is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: String,
    pub bundle_policy: String,
    pub rtcp_mux_policy: String,
    pub peer_identity: String,
}

impl Configuration {
    /// Default configuration: no ICE servers, `all` transport policy, `balanced` bundle policy,
    /// `require` RTCP multiplexing and no peer identity.
    pub fn new() -> Self {
        Configuration {
            ice_servers: Vec::new(),
            ice_transport_policy: "all".into(),
            bundle_policy: "balanced".into(),
            rtcp_mux_policy: "require".into(),
            peer_identity: String::new(),
        }
    }

    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Appends a new [IceServer] built from a comma separated list of `urls`. See
    /// [IceServer::parse] for the meaning of `credentials`.
    ///
    /// On failure the server list is left untouched.
    pub fn add_ice_server(&mut self, urls: &str, credentials: &[&str]) -> Result<()> {
        let server = IceServer::parse(urls, credentials)?;
        self.ice_servers.push(server);
        Ok(())
    }

    /// Checks the ICE server URLs of a configuration which didn't go through
    /// [Configuration::add_ice_server], ie. one deserialized from JSON.
    pub fn validate(&self) -> Result<()> {
        self.ice_servers.iter().try_for_each(IceServer::validate)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::new()
    }
}

/// Case-insensitive lookup of a policy `name` among `known` ones. Returns the canonical name.
pub(crate) fn resolve_policy(
    kind: &str,
    name: &str,
    known: &'static [&'static str],
) -> Result<&'static str> {
    known
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(name.trim()))
        .copied()
        .ok_or_else(|| Error::UnsupportedPolicy(format!("{kind} '{name}'")))
}

#[derive(Debug, Clone, Default)]
pub struct ConfigurationBuilder {
    config: Configuration,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.config.ice_servers.push(server);
        self
    }

    pub fn with_ice_transport_policy(mut self, policy: impl Into<String>) -> Self {
        self.config.ice_transport_policy = policy.into();
        self
    }

    pub fn with_bundle_policy(mut self, policy: impl Into<String>) -> Self {
        self.config.bundle_policy = policy.into();
        self
    }

    pub fn with_rtcp_mux_policy(mut self, policy: impl Into<String>) -> Self {
        self.config.rtcp_mux_policy = policy.into();
        self
    }

    pub fn with_peer_identity(mut self, identity: impl Into<String>) -> Self {
        self.config.peer_identity = identity.into();
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_configuration() {
        let a = Configuration::new();
        let b = Configuration::new();
        assert_eq!(a, b);
        assert!(a.ice_servers.is_empty());
        assert_eq!(a.ice_transport_policy, "all");
        assert_eq!(a.bundle_policy, "balanced");
        assert_eq!(a.rtcp_mux_policy, "require");
        assert_eq!(a.peer_identity, "");
        assert_eq!(Configuration::default(), a);
    }

    #[test]
    fn add_ice_server_with_credentials() {
        let mut config = Configuration::new();
        config
            .add_ice_server(
                "stun:stun.example.com:19302, turn:turn.example.com:3478",
                &["alice", "secret"],
            )
            .unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        let server = &config.ice_servers[0];
        assert_eq!(
            server.urls,
            vec!["stun:stun.example.com:19302", "turn:turn.example.com:3478"]
        );
        assert_eq!(server.username.as_deref(), Some("alice"));
        assert_eq!(server.credential.as_deref(), Some("secret"));
        assert_eq!(server.credential_type, IceCredentialType::Password);
        assert_eq!(server.credential_type.to_string(), "password");
    }

    #[test]
    fn add_ice_server_without_credentials() {
        let mut config = Configuration::new();
        config.add_ice_server("stun:a.example.com", &[]).unwrap();
        config.add_ice_server("turn:b.example.com", &["bob"]).unwrap();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].username, None);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("bob"));
        assert_eq!(config.ice_servers[1].credential, None);
    }

    #[test]
    fn add_ice_server_rejects_malformed_urls() {
        let mut config = Configuration::new();
        config.add_ice_server("stun:ok.example.com", &[]).unwrap();
        let before = config.clone();

        for urls in [
            "http://example.com",
            "stun:ok.example.com, turns:secure.example.com",
            "stun:ok.example.com,",
            "",
            "STUN:upper.example.com",
        ] {
            let err = config.add_ice_server(urls, &["alice", "secret"]).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{urls}: {err}");
            assert_eq!(config, before);
        }
    }

    #[test]
    fn validate_deserialized_configuration() {
        let json = r#"{
            "iceServers": [{"urls": ["stun:stun.example.com"]}, {"urls": ["ftp://nope"]}],
            "bundlePolicy": "max-bundle"
        }"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        assert_eq!(config.bundle_policy, "max-bundle");
        assert_eq!(config.ice_transport_policy, "all");
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let config = Configuration::builder()
            .with_ice_server(IceServer::parse("turn:t.example.com", &["u", "p"]).unwrap())
            .with_ice_transport_policy("relay")
            .build();
        assert!(config.validate().is_ok());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["iceTransportPolicy"], "relay");
        assert_eq!(json["iceServers"][0]["credentialType"], "password");
    }

    #[test]
    fn policy_lookup_is_case_insensitive() {
        assert_eq!(
            resolve_policy("bundle policy", "MAX-Bundle", BUNDLE_POLICIES).unwrap(),
            "max-bundle"
        );
        assert_eq!(
            resolve_policy("ice transport policy", "Relay", ICE_TRANSPORT_POLICIES).unwrap(),
            "relay"
        );
        let err = resolve_policy("rtcp mux policy", "sometimes", RTCP_MUX_POLICIES).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPolicy(_)));
    }
}
