//! Network observations reported by the hosting environment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::headers::Header;

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

/// An outbound request of the hosted surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Top-level document request (default: true)
    #[serde(default = "default_true")]
    pub main_frame: bool,
    /// Parsed form body, for POST requests
    #[serde(default)]
    pub form_data: Option<BTreeMap<String, Vec<String>>>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            main_frame: true,
            form_data: None,
        }
    }

    pub fn post_form<I, K, V>(url: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut form = BTreeMap::<String, Vec<String>>::new();
        for (key, value) in fields {
            form.entry(key.into()).or_default().push(value.into());
        }
        Self {
            url: url.into(),
            method: "POST".to_string(),
            main_frame: true,
            form_data: Some(form),
        }
    }

    pub fn subresource(mut self) -> Self {
        self.main_frame = false;
        self
    }

    /// First value of a form field.
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form_data
            .as_ref()?
            .get(name)?
            .first()
            .map(String::as_str)
    }
}

/// Response headers of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default = "default_true")]
    pub main_frame: bool,
}

impl Response {
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status,
            headers: Vec::new(),
            main_frame: true,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request: Request =
            serde_json::from_value(json!({"url": "https://idp.example.org/"})).unwrap();
        assert_eq!(request, Request::get("https://idp.example.org/"));
    }

    #[test]
    fn test_form_value() {
        let request = Request::post_form(
            "https://sp.example.com/acs",
            [("SAMLResponse", "PHNhbWw+"), ("RelayState", "x")],
        );
        assert_eq!(request.form_value("SAMLResponse"), Some("PHNhbWw+"));
        assert_eq!(request.form_value("missing"), None);
        assert_eq!(Request::get("https://a/").form_value("SAMLResponse"), None);
    }

    #[test]
    fn test_response_headers_default_empty() {
        let response: Response =
            serde_json::from_value(json!({"url": "https://idp/", "status": 302})).unwrap();
        assert!(response.headers.is_empty());
        assert!(response.main_frame);
    }
}
