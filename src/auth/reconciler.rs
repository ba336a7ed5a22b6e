//! Split-horizon address reconciliation
//!
//! The identity provider is reachable at one address from inside the deployment
//! network and at another from the browser. Server-to-server calls must target
//! the internal address, while anything placed in a response (redirects, links)
//! must carry the external address. [`AddressReconciler`] rewrites URLs between
//! the two; URLs that match neither address pass through untouched.

use crate::config::ConfigError;

/// Where the identity provider lives, seen from both sides of the network
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEndpoint {
    /// Base URL for server-initiated calls (e.g. `http://keycloak:8080`)
    pub internal_base_url: String,
    /// Base URL the browser sees (e.g. `https://example.com/keycloak`)
    pub external_base_url: String,
    pub realm: String,
    /// Path appended to either base URL to reach the realm (e.g. `/realms/demo`)
    pub realm_path: String,
}

impl ProviderEndpoint {
    pub fn internal_realm_url(&self) -> String {
        format!("{}{}", self.internal_base_url, self.realm_path)
    }

    pub fn external_realm_url(&self) -> String {
        format!("{}{}", self.external_base_url, self.realm_path)
    }

    /// Discovery document, always fetched through the internal address
    pub fn discovery_url(&self) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            self.internal_realm_url()
        )
    }
}

/// One side of the split horizon, pre-parsed for matching
#[derive(Debug, Clone)]
struct HostPattern {
    scheme: String,
    host: String,
    port: Option<u16>,
    /// Path prefix without trailing slash; empty when the base has no path
    base_path: String,
    /// `scheme://host[:port]` followed by `base_path`, used as the rewrite target
    root: String,
}

impl HostPattern {
    fn parse(var: &'static str, base_url: &str) -> Result<Self, ConfigError> {
        let parsed = url::Url::parse(base_url).map_err(|e| ConfigError::InvalidUrl {
            var,
            value: base_url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl {
                var,
                value: base_url.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();

        let base_path = parsed.path().trim_end_matches('/').to_string();
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        let root = format!("{}://{}{}", parsed.scheme(), authority, base_path);

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port: parsed.port_or_known_default(),
            base_path,
            root,
        })
    }

    /// Returns the path remainder after the base path when `url` falls under this pattern
    fn strip<'a>(&self, url: &'a url::Url) -> Option<&'a str> {
        if url.scheme() != self.scheme
            || url.host_str() != Some(self.host.as_str())
            || url.port_or_known_default() != self.port
            || !url.username().is_empty()
        {
            return None;
        }

        let path = url.path();
        if self.base_path.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.base_path.as_str())?;
        // Only match on a segment boundary: /realm must not match /realmx
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

/// Bidirectional URL rewriting between the provider's internal and external addresses
#[derive(Debug, Clone)]
pub struct AddressReconciler {
    internal: HostPattern,
    external: HostPattern,
}

impl AddressReconciler {
    pub fn new(endpoint: &ProviderEndpoint) -> Result<Self, ConfigError> {
        Ok(Self {
            internal: HostPattern::parse("PROVIDER_INTERNAL_URL", &endpoint.internal_base_url)?,
            external: HostPattern::parse("PROVIDER_EXTERNAL_URL", &endpoint.external_base_url)?,
        })
    }

    /// Rewrite an external-address URL to the internal address (for outbound calls)
    pub fn to_internal(&self, url: &str) -> String {
        rewrite(url, &self.external, &self.internal)
    }

    /// Rewrite an internal-address URL to the external address (for responses)
    pub fn to_external(&self, url: &str) -> String {
        rewrite(url, &self.internal, &self.external)
    }

    /// Headers telling a proxy-aware provider which external address the call stands for
    pub fn forwarded_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("x-forwarded-proto", self.external.scheme.clone()),
            ("x-forwarded-host", self.external.host.clone()),
        ];
        if let Some(port) = self.external.port {
            headers.push(("x-forwarded-port", port.to_string()));
        }
        headers
    }
}

fn rewrite(input: &str, from: &HostPattern, to: &HostPattern) -> String {
    let parsed = match url::Url::parse(input) {
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            tracing::debug!(url = %input, "Relative URL passed through unchanged");
            return input.to_string();
        }
        Err(e) => {
            tracing::warn!(
                url = %input,
                error = %e,
                "Malformed URL passed through without rewriting"
            );
            return input.to_string();
        }
    };

    let Some(rest) = from.strip(&parsed) else {
        return input.to_string();
    };

    let mut rewritten = format!("{}{}", to.root, rest);
    if let Some(query) = parsed.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    if let Some(fragment) = parsed.fragment() {
        rewritten.push('#');
        rewritten.push_str(fragment);
    }

    tracing::trace!(from = %input, to = %rewritten, "Rewrote provider URL");
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(internal: &str, external: &str) -> ProviderEndpoint {
        ProviderEndpoint {
            internal_base_url: internal.to_string(),
            external_base_url: external.to_string(),
            realm: "demo".to_string(),
            realm_path: "/realms/demo".to_string(),
        }
    }

    fn reconciler() -> AddressReconciler {
        AddressReconciler::new(&endpoint(
            "http://keycloak:8080/keycloak",
            "https://example.com/keycloak",
        ))
        .unwrap()
    }

    #[test]
    fn test_realm_urls() {
        let ep = endpoint("http://keycloak:8080", "https://sso.example.com");
        assert_eq!(ep.internal_realm_url(), "http://keycloak:8080/realms/demo");
        assert_eq!(ep.external_realm_url(), "https://sso.example.com/realms/demo");
        assert_eq!(
            ep.discovery_url(),
            "http://keycloak:8080/realms/demo/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_to_internal_rewrites_external_urls() {
        let r = reconciler();
        assert_eq!(
            r.to_internal(
                "https://example.com/keycloak/realms/demo/protocol/openid-connect/token"
            ),
            "http://keycloak:8080/keycloak/realms/demo/protocol/openid-connect/token"
        );
    }

    #[test]
    fn test_to_external_preserves_query_and_fragment() {
        let r = reconciler();
        assert_eq!(
            r.to_external("http://keycloak:8080/keycloak/realms/demo/auth?client_id=a&state=b#frag"),
            "https://example.com/keycloak/realms/demo/auth?client_id=a&state=b#frag"
        );
    }

    #[test]
    fn test_unmatched_urls_pass_through() {
        let r = reconciler();
        // Same host as the external provider address but outside its path prefix
        assert_eq!(
            r.to_internal("https://example.com/callback?code=abc"),
            "https://example.com/callback?code=abc"
        );
        assert_eq!(
            r.to_external("http://other:8080/keycloak/realms/demo"),
            "http://other:8080/keycloak/realms/demo"
        );
        // Different port on the internal host
        assert_eq!(
            r.to_external("http://keycloak:9090/keycloak/x"),
            "http://keycloak:9090/keycloak/x"
        );
    }

    #[test]
    fn test_prefix_requires_segment_boundary() {
        let r = reconciler();
        assert_eq!(
            r.to_internal("https://example.com/keycloakx/realms/demo"),
            "https://example.com/keycloakx/realms/demo"
        );
    }

    #[test]
    fn test_malformed_and_relative_pass_through() {
        let r = reconciler();
        assert_eq!(r.to_external("/dashboard"), "/dashboard");
        assert_eq!(r.to_external("http://[::1"), "http://[::1");
        assert_eq!(r.to_internal(""), "");
    }

    #[test]
    fn test_default_port_matches_explicit_port() {
        let r = AddressReconciler::new(&endpoint("http://idp:8080", "https://example.com"))
            .unwrap();
        assert_eq!(
            r.to_internal("https://example.com:443/realms/demo/token"),
            "http://idp:8080/realms/demo/token"
        );
    }

    #[test]
    fn test_round_trip_across_matched_patterns() {
        let r = AddressReconciler::new(&endpoint(
            "http://idp:8080/realm",
            "https://example.com/realm",
        ))
        .unwrap();

        for external in [
            "https://example.com/realm",
            "https://example.com/realm/auth?response_type=code&state=S",
            "https://example.com/realm/protocol/openid-connect/certs",
        ] {
            let internal = r.to_internal(external);
            assert!(internal.starts_with("http://idp:8080/realm"));
            assert_eq!(r.to_external(&internal), external);
            assert_eq!(r.to_internal(&r.to_external(&internal)), internal);
        }
    }

    #[test]
    fn test_forwarded_headers_describe_external_address() {
        let headers = reconciler().forwarded_headers();
        assert!(headers.contains(&("x-forwarded-proto", "https".to_string())));
        assert!(headers.contains(&("x-forwarded-host", "example.com".to_string())));
        assert!(headers.contains(&("x-forwarded-port", "443".to_string())));
    }
}
