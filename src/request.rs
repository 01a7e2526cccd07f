//! The application-facing request model: enough to build the `:method`,
//! `:authority`, and `:path` pseudo-headers a stream needs to open, plus
//! whatever extra headers and body the caller supplies.

use crate::delegate::StartLine;
use crate::types::Headers;
use bytes::Bytes;
use url::Url;

#[derive(Debug, Clone, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            url,
            headers: headers.unwrap_or_default(),
            body: body.into(),
        }
    }

    #[inline]
    pub fn get(url: Url, headers: Option<Headers>) -> Self {
        Self::new(Method::Get, url, headers, Bytes::new())
    }

    #[inline]
    pub fn post(url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, headers, body)
    }

    #[cfg(feature = "json")]
    pub fn post_json<T: serde::Serialize>(url: Url, value: &T) -> serde_json::Result<Self> {
        let headers = vec![("content-type".to_owned(), "application/json".to_owned())];
        Ok(Self::new(Method::Post, url, Some(headers), serde_json::to_vec(value)?))
    }

    /// The `host` (or `host:port`) this request's `:authority` pseudo-header
    /// should carry, and the socket address a client should connect to.
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().expect("URL cannot be a base"), port),
            None => self.url.host_str().expect("URL cannot be a base").to_owned(),
        }
    }

    pub fn start_line(&self) -> StartLine {
        StartLine::Request {
            method: self.method.to_string(),
            path: if self.url.path().is_empty() { "/".to_owned() } else { self.url.path().to_owned() },
        }
    }

    /// The full header list to hand `Stream::write_headers`: `:authority`
    /// followed by whatever headers the caller attached.
    pub fn header_list(&self) -> Headers {
        let mut full = vec![(":authority".to_owned(), self.authority())];
        full.extend(self.headers.iter().cloned());
        full
    }
}
