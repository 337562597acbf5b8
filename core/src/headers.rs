//! Default request headers.

use serde::Deserialize;

use crate::http::HttpMethod;

pub const JSON: &str = "application/json";
pub const JSON_API: &str = "application/vnd.api+json";
pub const FORM: &str = "application/x-www-form-urlencoded";

/// Credentials stamped onto every outgoing request.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct HeaderSettings {
    /// Sent as `X-CSRFToken` on unsafe methods.
    #[serde(default)]
    pub csrf: Option<String>,
    /// Sent as `Authorization: Bearer <token>`.
    #[serde(default)]
    pub bearer: Option<String>,
}

impl HeaderSettings {
    /// Build the header list for a request with the given method and content type.
    pub fn headers_for(&self, method: HttpMethod, content_type: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-Requested-With".to_string(), "XMLHttpRequest".to_string()),
            ("Content-Type".to_string(), content_type.to_string()),
        ];
        if !method.is_safe() {
            if let Some(token) = &self.csrf {
                headers.push(("X-CSRFToken".to_string(), token.clone()));
            }
        }
        if let Some(token) = &self.bearer {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }
}
