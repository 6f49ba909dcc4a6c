//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Requests and responses as seen by calls and the cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use itertools::Itertools as _;
use tether_net_infra::tls::Handshake;
use tether_net_infra::Protocol;

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: Uri) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Uri) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The first value of `name`, if it is valid UTF-8.
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn host(&self) -> &str {
        self.url.host().unwrap_or_default()
    }
}

/// Where a [`Response`] came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum ResponseSource {
    Network,
    Cache,
    /// A stored response that the server confirmed is still valid.
    ConditionalCache,
}

/// What an exchange codec reads off the wire.
#[derive(Clone, Debug, Default)]
pub struct NetworkResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The peer's limit on concurrent streams, if the exchange learned one
    /// (HTTP/2 `SETTINGS_MAX_CONCURRENT_STREAMS`).
    pub max_concurrent_streams: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Response {
    /// The request that produced this response; for cached responses, the
    /// request that originally stored it.
    pub request: Request,
    pub protocol: Protocol,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub handshake: Option<Handshake>,
    pub sent_request_at: DateTime<Utc>,
    pub received_response_at: DateTime<Utc>,
    pub source: ResponseSource,
}

impl Response {
    pub fn new(request: Request, status: StatusCode) -> Self {
        let now = Utc::now();
        Self {
            request,
            protocol: Protocol::Http1_1,
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            handshake: None,
            sent_request_at: now,
            received_response_at: now,
            source: ResponseSource::Network,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The response served when a request may only be answered from the
    /// cache and the cache has nothing usable.
    pub fn unsatisfiable(request: Request) -> Self {
        Self::new(request, StatusCode::GATEWAY_TIMEOUT)
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// Header names listed in `Vary`, lowercased.
    pub fn vary_fields(&self) -> Vec<String> {
        self.headers
            .get_all(header::VARY)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|field| field.trim().to_ascii_lowercase())
            .filter(|field| !field.is_empty())
            .collect()
    }

    pub fn has_vary_all(&self) -> bool {
        self.vary_fields().iter().any(|field| field == "*")
    }

    /// The request headers this response varies on, with the values they had
    /// when it was requested.
    pub fn vary_headers(&self) -> HeaderMap {
        let mut selected = HeaderMap::new();
        for field in self.vary_fields() {
            let Ok(name) = HeaderName::from_bytes(field.as_bytes()) else {
                continue;
            };
            for value in self.request.headers.get_all(&name) {
                selected.append(name.clone(), value.clone());
            }
        }
        selected
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Parses an HTTP-date (RFC 9110 IMF-fixdate, or the obsolete RFC 850 and
/// asctime forms).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    // asctime pads single-digit days with a space.
    let collapsed = value.split_whitespace().join(" ");
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %d %H:%M:%S %Y"]
        .iter()
        .find_map(|format| chrono::NaiveDateTime::parse_from_str(&collapsed, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Merges the headers of a `304 Not Modified` into those of the stored
/// response it validated.
///
/// Warnings of the 1xx kind are dropped from the stored headers and
/// content headers always come from the stored response.
pub fn combine_headers(cached: &HeaderMap, network: &HeaderMap) -> HeaderMap {
    let mut combined = HeaderMap::new();
    for (name, value) in cached {
        if name == header::WARNING && value.as_bytes().starts_with(b"1") {
            continue;
        }
        if is_content_specific(name) || !is_end_to_end(name) || !network.contains_key(name) {
            combined.append(name.clone(), value.clone());
        }
    }
    for (name, value) in network {
        if !is_content_specific(name) && is_end_to_end(name) {
            combined.append(name.clone(), value.clone());
        }
    }
    combined
}

fn is_content_specific(name: &HeaderName) -> bool {
    name == header::CONTENT_LENGTH || name == header::CONTENT_ENCODING || name == header::CONTENT_TYPE
}

fn is_end_to_end(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
