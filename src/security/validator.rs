//! Pluggable request validation.
//!
//! A [`SecurityValidator`] runs once per request after the endpoint has been
//! resolved and before it executes. A denial becomes a 403 through the normal
//! error mapping path; the endpoint never sees the request.

use crate::endpoint::EndpointDescriptor;
use crate::http::RequestInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

pub trait SecurityValidator: Send + Sync + 'static {
    fn validate(&self, request: &RequestInfo, endpoint: &EndpointDescriptor) -> Verdict;
}

/// Requires a shared secret in a header for every endpoint except the listed ones.
#[derive(Debug, Clone)]
pub struct HeaderTokenValidator {
    header: String,
    token: String,
    exempt: Vec<String>,
}

impl HeaderTokenValidator {
    pub fn new(header: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            token: token.into(),
            exempt: Vec::new(),
        }
    }

    /// Skip validation for the endpoint with this name.
    pub fn exempt(mut self, endpoint: impl Into<String>) -> Self {
        self.exempt.push(endpoint.into());
        self
    }
}

impl SecurityValidator for HeaderTokenValidator {
    fn validate(&self, request: &RequestInfo, endpoint: &EndpointDescriptor) -> Verdict {
        if self.exempt.iter().any(|name| *name == endpoint.name) {
            return Verdict::Allow;
        }
        match request.header(&self.header) {
            Some(value) if value == self.token => Verdict::Allow,
            Some(_) => Verdict::Deny(format!("invalid {} header", self.header)),
            None => Verdict::Deny(format!("missing {} header", self.header)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method, Version};

    fn request(token: Option<&'static str>) -> RequestInfo {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert("x-api-key", HeaderValue::from_static(token));
        }
        RequestInfo {
            connection_id: ConnectionId::new(),
            seq: 0,
            peer_addr: "127.0.0.1:1".parse().unwrap(),
            method: Method::GET,
            uri: "/secure".parse().unwrap(),
            version: Version::HTTP_11,
            headers,
            body: Bytes::new(),
            request_id: "r".into(),
            user_id: None,
        }
    }

    #[test]
    fn token_must_match() {
        let validator = HeaderTokenValidator::new("x-api-key", "s3cret");
        let endpoint = EndpointDescriptor::exact("secure", "/secure");
        assert_eq!(validator.validate(&request(Some("s3cret")), &endpoint), Verdict::Allow);
        assert!(matches!(validator.validate(&request(Some("nope")), &endpoint), Verdict::Deny(_)));
        assert!(matches!(validator.validate(&request(None), &endpoint), Verdict::Deny(_)));
    }

    #[test]
    fn exempt_endpoints_pass() {
        let validator = HeaderTokenValidator::new("x-api-key", "s3cret").exempt("healthcheck");
        let endpoint = EndpointDescriptor::exact("healthcheck", "/healthcheck");
        assert_eq!(validator.validate(&request(None), &endpoint), Verdict::Allow);
    }
}
