//! Inbound gateway-key check.
//!
//! Clients present the key as `Authorization: Bearer <key>` or, for
//! Anthropic-style clients, as `x-api-key`. Comparison is constant-time so
//! the key can't be probed byte by byte through response timing.

use axum::http::HeaderMap;
use kiro_core::config::GatewayConfig;
use subtle::ConstantTimeEq;

pub fn authorized(headers: &HeaderMap, config: &GatewayConfig) -> bool {
    let Some(expected) = config.gateway_key.as_deref().filter(|k| !k.is_empty()) else {
        return false;
    };
    let Some(presented) = presented_key(headers) else {
        return false;
    };
    constant_time_eq(presented, expected)
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token);
        }
    }
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        // burn the same comparison work before refusing
        let _ = b.ct_eq(b);
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with_key(key: &str) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.gateway_key = Some(key.to_string());
        config
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_header_authorizes() {
        let config = config_with_key("sk-local-1");
        assert!(authorized(&headers(&[("authorization", "Bearer sk-local-1")]), &config));
        assert!(!authorized(&headers(&[("authorization", "Bearer wrong")]), &config));
        assert!(!authorized(&headers(&[("authorization", "sk-local-1")]), &config));
    }

    #[test]
    fn x_api_key_header_authorizes() {
        let config = config_with_key("sk-local-1");
        assert!(authorized(&headers(&[("x-api-key", "sk-local-1")]), &config));
        assert!(!authorized(&headers(&[("x-api-key", "nope")]), &config));
    }

    #[test]
    fn missing_key_or_config_refuses() {
        let config = config_with_key("sk-local-1");
        assert!(!authorized(&headers(&[]), &config));

        let unconfigured = GatewayConfig::default();
        assert!(!authorized(
            &headers(&[("authorization", "Bearer anything")]),
            &unconfigured
        ));
    }

    #[test]
    fn length_mismatch_refuses() {
        let config = config_with_key("sk-local-1");
        assert!(!authorized(&headers(&[("authorization", "Bearer sk-local-11")]), &config));
        assert!(!authorized(&headers(&[("authorization", "Bearer s")]), &config));
    }
}
