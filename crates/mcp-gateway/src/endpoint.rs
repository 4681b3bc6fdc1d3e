//! Pure resolution of a logical session onto a concrete upstream request:
//! URL construction, session-id placement and auth headers.
//!
//! Nothing here performs IO; adapters convert the resolved header pairs into
//! their own client types. Secret values never reach the logs unmasked.

use base64::Engine;

use crate::{
    GatewayResult,
    model::{AuthConfig, SessionIdLocation, UpstreamServerConfig},
};

pub const DEFAULT_SESSION_PARAM: &str = "sessionId";
pub const SESSION_HEADER: &str = "X-Session-ID";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// A concrete upstream request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl ResolvedEndpoint {
    /// Diagnostic rendering with sensitive header values masked.
    pub fn masked(&self) -> String {
        let headers = self
            .headers
            .iter()
            .map(|(name, value)| {
                if is_sensitive(name) {
                    format!("{name}: {}", mask_secret(value))
                } else {
                    format!("{name}: {value}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} [{headers}]", self.url)
    }
}

/// Resolve the connection-establishment target for a session.
pub fn resolve_connect(
    config: &UpstreamServerConfig,
    session_id: &str,
) -> GatewayResult<ResolvedEndpoint> {
    resolve(&config.service_endpoint, config, session_id)
}

/// Resolve the message-send target for a session. Falls back to a path
/// derived from the service endpoint when no message endpoint is configured.
pub fn resolve_message(
    config: &UpstreamServerConfig,
    session_id: &str,
) -> GatewayResult<ResolvedEndpoint> {
    let base = match &config.message_endpoint {
        Some(endpoint) if !endpoint.is_empty() => endpoint.clone(),
        _ => derive_message_endpoint(&config.service_endpoint),
    };
    resolve(&base, config, session_id)
}

/// Resolve a session-independent target (direct tool calls): auth headers
/// only, no session-id placement.
pub fn resolve_direct(config: &UpstreamServerConfig) -> GatewayResult<ResolvedEndpoint> {
    let base = match &config.message_endpoint {
        Some(endpoint) if !endpoint.is_empty() => endpoint.clone(),
        _ => derive_message_endpoint(&config.service_endpoint),
    };
    let mut headers = Vec::new();
    push_auth_headers(config, &mut headers);
    Ok(ResolvedEndpoint { url: base, headers })
}

fn resolve(
    base: &str,
    config: &UpstreamServerConfig,
    session_id: &str,
) -> GatewayResult<ResolvedEndpoint> {
    let param = config
        .session_id_param
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SESSION_PARAM);
    let mut headers = Vec::new();

    let location = match config.session_id_location {
        Some(location) => location,
        None => {
            tracing::warn!(
                endpoint = %base,
                "session id placement not configured, defaulting to query parameter"
            );
            SessionIdLocation::QueryParam
        }
    };
    let url = match location {
        SessionIdLocation::QueryParam => append_query_param(base, param, session_id),
        SessionIdLocation::PathParam => base
            .replace("{sessionId}", session_id)
            .replace("{id}", session_id),
        SessionIdLocation::Header => {
            let name = match config.session_id_param.as_deref() {
                Some(name) if !name.is_empty() => name,
                _ => SESSION_HEADER,
            };
            headers.push((name.to_string(), session_id.to_string()));
            base.to_string()
        }
    };

    push_auth_headers(config, &mut headers);
    Ok(ResolvedEndpoint { url, headers })
}

fn push_auth_headers(config: &UpstreamServerConfig, headers: &mut Vec<(String, String)>) {
    match &config.auth {
        AuthConfig::None => {}
        AuthConfig::ApiKey { key } => {
            headers.push((API_KEY_HEADER.to_string(), key.clone()));
        }
        AuthConfig::BasicAuth { username, password } => {
            let credentials = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            headers.push(("Authorization".to_string(), format!("Basic {credentials}")));
        }
        AuthConfig::OAuth2 { client_id, .. } => {
            tracing::warn!(
                client_id = %mask_secret(client_id),
                "oauth2 token acquisition is not supported, connecting without credentials"
            );
        }
    }
}

/// Derive the message endpoint from a service endpoint by swapping its
/// `/sse` segment for `/message`, or appending `/message` when there is none.
pub fn derive_message_endpoint(service_endpoint: &str) -> String {
    if let Some(stripped) = service_endpoint.strip_suffix("/sse") {
        return format!("{stripped}/message");
    }
    for separator in ["/sse/", "/sse?"] {
        if service_endpoint.contains(separator) {
            let replacement = separator.replacen("/sse", "/message", 1);
            return service_endpoint.replacen(separator, &replacement, 1);
        }
    }
    format!("{}/message", service_endpoint.trim_end_matches('/'))
}

fn append_query_param(base: &str, param: &str, value: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{param}={value}")
}

/// Mask a secret for diagnostics: a short prefix, never the whole value.
pub fn mask_secret(value: &str) -> String {
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        let prefix: String = value.chars().take(4).collect();
        format!("{prefix}****")
    }
}

fn is_sensitive(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("authorization") || name.contains("key") || name.contains("token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthConfig;

    fn config(location: Option<SessionIdLocation>) -> UpstreamServerConfig {
        UpstreamServerConfig {
            service_endpoint: "https://h/sse".to_string(),
            session_id_location: location,
            ..Default::default()
        }
    }

    #[test]
    fn query_param_with_custom_name() {
        let mut config = config(Some(SessionIdLocation::QueryParam));
        config.session_id_param = Some("sid".to_string());
        let resolved = resolve_connect(&config, "abc").unwrap();
        assert_eq!(resolved.url, "https://h/sse?sid=abc");
    }

    #[test]
    fn query_param_appends_to_existing_query() {
        let mut config = config(Some(SessionIdLocation::QueryParam));
        config.service_endpoint = "https://h/sse?x=1".to_string();
        config.session_id_param = Some("sid".to_string());
        let resolved = resolve_connect(&config, "abc").unwrap();
        assert_eq!(resolved.url, "https://h/sse?x=1&sid=abc");
    }

    #[test]
    fn unset_placement_defaults_to_query_param() {
        let resolved = resolve_connect(&config(None), "abc").unwrap();
        assert_eq!(resolved.url, "https://h/sse?sessionId=abc");
    }

    #[test]
    fn path_param_replaces_placeholders() {
        let mut config = config(Some(SessionIdLocation::PathParam));
        config.service_endpoint = "https://h/{sessionId}/sse".to_string();
        let resolved = resolve_connect(&config, "abc").unwrap();
        assert_eq!(resolved.url, "https://h/abc/sse");

        config.service_endpoint = "https://h/servers/{id}/sse".to_string();
        let resolved = resolve_connect(&config, "abc").unwrap();
        assert_eq!(resolved.url, "https://h/servers/abc/sse");
    }

    #[test]
    fn header_placement_leaves_url_unchanged() {
        let resolved = resolve_connect(&config(Some(SessionIdLocation::Header)), "abc").unwrap();
        assert_eq!(resolved.url, "https://h/sse");
        assert!(
            resolved
                .headers
                .contains(&(SESSION_HEADER.to_string(), "abc".to_string()))
        );
    }

    #[test]
    fn derives_message_endpoint_from_sse_segment() {
        assert_eq!(derive_message_endpoint("https://h/sse"), "https://h/message");
        assert_eq!(
            derive_message_endpoint("https://h/sse/v1"),
            "https://h/message/v1"
        );
        assert_eq!(
            derive_message_endpoint("https://h/api"),
            "https://h/api/message"
        );
        // A host that merely contains "sse" is not a segment match.
        assert_eq!(
            derive_message_endpoint("https://ssehost/api"),
            "https://ssehost/api/message"
        );
    }

    #[test]
    fn message_endpoint_overrides_derivation() {
        let mut config = config(Some(SessionIdLocation::QueryParam));
        config.message_endpoint = Some("https://h/rpc".to_string());
        let resolved = resolve_message(&config, "abc").unwrap();
        assert_eq!(resolved.url, "https://h/rpc?sessionId=abc");
    }

    #[test]
    fn api_key_header() {
        let mut config = config(Some(SessionIdLocation::QueryParam));
        config.auth = AuthConfig::ApiKey {
            key: "k-123456".to_string(),
        };
        let resolved = resolve_connect(&config, "abc").unwrap();
        assert!(
            resolved
                .headers
                .contains(&(API_KEY_HEADER.to_string(), "k-123456".to_string()))
        );
    }

    #[test]
    fn basic_auth_header_is_base64() {
        let mut config = config(Some(SessionIdLocation::QueryParam));
        config.auth = AuthConfig::BasicAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let resolved = resolve_connect(&config, "abc").unwrap();
        // base64("user:pass")
        assert!(
            resolved
                .headers
                .contains(&("Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string()))
        );
    }

    #[test]
    fn oauth2_attaches_nothing() {
        let mut config = config(Some(SessionIdLocation::QueryParam));
        config.auth = AuthConfig::OAuth2 {
            client_id: "cid".to_string(),
            client_secret: Some("secret".to_string()),
        };
        let resolved = resolve_connect(&config, "abc").unwrap();
        assert!(resolved.headers.is_empty());
    }

    #[test]
    fn masked_rendering_hides_auth_values() {
        let mut config = config(Some(SessionIdLocation::QueryParam));
        config.auth = AuthConfig::BasicAuth {
            username: "user".to_string(),
            password: "hunter2".to_string(),
        };
        let resolved = resolve_connect(&config, "abc").unwrap();
        let rendered = resolved.masked();
        assert!(!rendered.contains("dXNlcjpodW50ZXIy"));
        assert!(rendered.contains("****"));
    }

    #[test]
    fn mask_keeps_only_a_prefix() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("abcdefgh"), "abcd****");
    }
}
