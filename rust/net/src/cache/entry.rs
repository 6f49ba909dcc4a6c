//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The metadata file of a cache entry.
//!
//! Line-based UTF-8:
//!
//! ```text
//! http://example.com/foo
//! GET
//! 1
//! accept-language: fr
//! http/1.1 200 OK
//! 2
//! content-type: text/plain
//! expires: Sun, 06 Nov 2044 08:49:37 GMT
//! sent 1700000000000
//! received 1700000000120
//! tls
//! TLS_AES_128_GCM_SHA256
//! 1
//! 3f1a...e2 example.com,www.example.com -
//! TLSv1.3
//! end
//! ```
//!
//! The vary block lists the request headers the response varies on. `tls` is
//! followed by the cipher suite, the peer certificate count, one line per
//! certificate (public key hash, DNS names, IP addresses, with `-` for an
//! empty list), then the TLS version; plaintext responses have `plain`
//! instead. The closing `end` line makes a truncated file fail to decode.

use std::net::IpAddr;
use std::str::{FromStr as _, Lines};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use itertools::Itertools as _;
use tether_net_infra::tls::{Certificate, CipherSuite, Handshake, TlsVersion};
use tether_net_infra::Protocol;

use crate::http::{Request, Response, ResponseSource};

/// Why an entry's metadata couldn't be read.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub(crate) enum EntryError {
    /// metadata ended early
    Truncated,
    /// malformed {0}
    Malformed(&'static str),
}

type Result<T> = std::result::Result<T, EntryError>;

const PLAINTEXT: &str = "plain";
const TLS: &str = "tls";
const END: &str = "end";

/// Everything about a stored response except its body.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EntryMetadata {
    pub url: Uri,
    pub method: Method,
    pub vary_headers: HeaderMap,
    pub protocol: Protocol,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub sent_request_at: DateTime<Utc>,
    pub received_response_at: DateTime<Utc>,
    pub handshake: Option<Handshake>,
}

impl EntryMetadata {
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.request.url.clone(),
            method: response.request.method.clone(),
            vary_headers: response.vary_headers(),
            protocol: response.protocol,
            status: response.status,
            headers: response.headers.clone(),
            sent_request_at: response.sent_request_at,
            received_response_at: response.received_response_at,
            handshake: response.handshake.clone(),
        }
    }

    /// Whether this entry can answer `request`.
    pub fn matches(&self, request: &Request) -> bool {
        if self.url != request.url || self.method != request.method {
            return false;
        }
        let vary_fields = self
            .headers
            .get_all(http::header::VARY)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|field| field.trim().to_ascii_lowercase())
            .filter(|field| !field.is_empty())
            .collect_vec();
        vary_fields.iter().all(|field| {
            let Ok(name) = HeaderName::from_bytes(field.as_bytes()) else {
                return false;
            };
            self.vary_headers.get_all(&name).iter().eq(request.headers.get_all(&name).iter())
        })
    }

    /// Rebuilds the response, pairing it with `request` and `body`.
    pub fn into_response(self, body: bytes::Bytes) -> Response {
        let Self {
            url,
            method,
            vary_headers,
            protocol,
            status,
            headers,
            sent_request_at,
            received_response_at,
            handshake,
        } = self;
        let request = Request {
            method,
            url,
            headers: vary_headers,
            body: None,
        };
        Response {
            request,
            protocol,
            status,
            headers,
            body,
            handshake,
            sent_request_at,
            received_response_at,
            source: ResponseSource::Cache,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut line = |s: &str| {
            out.push_str(s);
            out.push('\n');
        };

        line(&self.url.to_string());
        line(self.method.as_str());
        line(&self.vary_headers.len().to_string());
        for (name, value) in &self.vary_headers {
            line(&header_line(name, value));
        }
        line(&format!(
            "{} {} {}",
            self.protocol,
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or_default()
        ));
        line(&self.headers.len().to_string());
        for (name, value) in &self.headers {
            line(&header_line(name, value));
        }
        line(&format!("sent {}", self.sent_request_at.timestamp_millis()));
        line(&format!(
            "received {}",
            self.received_response_at.timestamp_millis()
        ));

        match &self.handshake {
            None => line(PLAINTEXT),
            Some(handshake) => {
                line(TLS);
                line(&handshake.cipher_suite.to_string());
                line(&handshake.peer_certificates.len().to_string());
                for certificate in &handshake.peer_certificates {
                    line(&format!(
                        "{} {} {}",
                        hex::encode(certificate.public_key_sha256),
                        list_or_dash(certificate.dns_names.iter()),
                        list_or_dash(certificate.ip_addresses.iter()),
                    ));
                }
                line(&handshake.tls_version.to_string());
            }
        }
        line(END);
        out
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut lines = text.lines();

        let url = Uri::from_str(next(&mut lines)?).map_err(|_| EntryError::Malformed("url"))?;
        let method =
            Method::from_str(next(&mut lines)?).map_err(|_| EntryError::Malformed("method"))?;
        let vary_headers = read_headers(&mut lines)?;

        let mut status_line = next(&mut lines)?.splitn(3, ' ');
        let protocol = status_line
            .next()
            .and_then(|p| Protocol::from_str(p).ok())
            .ok_or(EntryError::Malformed("protocol"))?;
        let status = status_line
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(EntryError::Malformed("status"))?;

        let headers = read_headers(&mut lines)?;
        let sent_request_at = read_timestamp(&mut lines, "sent")?;
        let received_response_at = read_timestamp(&mut lines, "received")?;

        let handshake = match next(&mut lines)? {
            PLAINTEXT => None,
            TLS => Some(read_handshake(&mut lines)?),
            _ => return Err(EntryError::Malformed("transport")),
        };
        if next(&mut lines)? != END {
            return Err(EntryError::Malformed("end marker"));
        }

        Ok(Self {
            url,
            method,
            vary_headers,
            protocol,
            status,
            headers,
            sent_request_at,
            received_response_at,
            handshake,
        })
    }
}

fn header_line(name: &HeaderName, value: &HeaderValue) -> String {
    format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()))
}

fn list_or_dash<T: std::fmt::Display>(mut items: impl Iterator<Item = T>) -> String {
    let joined = items.join(",");
    if joined.is_empty() {
        "-".to_owned()
    } else {
        joined
    }
}

fn next<'a>(lines: &mut Lines<'a>) -> Result<&'a str> {
    lines.next().ok_or(EntryError::Truncated)
}

fn read_count(lines: &mut Lines<'_>, what: &'static str) -> Result<usize> {
    next(lines)?
        .parse()
        .map_err(|_| EntryError::Malformed(what))
}

fn read_headers(lines: &mut Lines<'_>) -> Result<HeaderMap> {
    let count = read_count(lines, "header count")?;
    let mut headers = HeaderMap::new();
    for _ in 0..count {
        let (name, value) = next(lines)?
            .split_once(": ")
            .ok_or(EntryError::Malformed("header"))?;
        let name = HeaderName::from_str(name).map_err(|_| EntryError::Malformed("header name"))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| EntryError::Malformed("header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn read_timestamp(lines: &mut Lines<'_>, label: &'static str) -> Result<DateTime<Utc>> {
    next(lines)?
        .strip_prefix(label)
        .and_then(|rest| rest.trim().parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .ok_or(EntryError::Malformed(label))
}

fn read_handshake(lines: &mut Lines<'_>) -> Result<Handshake> {
    let cipher_suite = next(lines)?;
    if cipher_suite.is_empty() {
        return Err(EntryError::Malformed("cipher suite"));
    }
    let cipher_suite = CipherSuite(cipher_suite.into());

    let count = read_count(lines, "certificate count")?;
    let peer_certificates = (0..count)
        .map(|_| read_certificate(next(lines)?))
        .collect::<Result<Vec<_>>>()?;

    let tls_version =
        TlsVersion::from_str(next(lines)?).map_err(|_| EntryError::Malformed("TLS version"))?;

    Ok(Handshake {
        tls_version,
        cipher_suite,
        peer_certificates,
    })
}

fn read_certificate(line: &str) -> Result<Certificate> {
    let mut fields = line.split(' ');
    let (Some(key), Some(names), Some(ips), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(EntryError::Malformed("certificate"));
    };

    let mut public_key_sha256 = [0u8; 32];
    hex::decode_to_slice(key, &mut public_key_sha256)
        .map_err(|_| EntryError::Malformed("certificate key"))?;
    let dns_names = split_list(names).map(Arc::from).collect();
    let ip_addresses = split_list(ips)
        .map(IpAddr::from_str)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| EntryError::Malformed("certificate address"))?;

    Ok(Certificate {
        dns_names,
        ip_addresses,
        public_key_sha256,
    })
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    (list != "-")
        .then(|| list.split(','))
        .into_iter()
        .flatten()
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeZone as _;
    use const_str::ip_addr;
    use pretty_assertions::assert_eq;

    use super::*;

    fn metadata() -> EntryMetadata {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(http::header::VARY, HeaderValue::from_static("Accept-Language"));
        let mut vary_headers = HeaderMap::new();
        vary_headers.insert(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("fr"));

        EntryMetadata {
            url: Uri::from_static("https://example.com/foo?q=1"),
            method: Method::GET,
            vary_headers,
            protocol: Protocol::Http2,
            status: StatusCode::OK,
            headers,
            sent_request_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            received_response_at: Utc.timestamp_millis_opt(1_700_000_000_120).unwrap(),
            handshake: Some(Handshake {
                tls_version: TlsVersion::Tls1_3,
                cipher_suite: CipherSuite("TLS_AES_128_GCM_SHA256".into()),
                peer_certificates: vec![Certificate {
                    dns_names: vec!["example.com".into(), "*.example.com".into()],
                    ip_addresses: vec![ip_addr!("192.0.2.1")],
                    public_key_sha256: [7; 32],
                }],
            }),
        }
    }

    #[test]
    fn decodes_what_it_encodes() {
        let metadata = metadata();
        assert_eq!(EntryMetadata::decode(&metadata.encode()), Ok(metadata));

        let plaintext = EntryMetadata {
            handshake: None,
            ..self::metadata()
        };
        assert_eq!(EntryMetadata::decode(&plaintext.encode()), Ok(plaintext));
    }

    #[test]
    fn truncated_metadata_is_an_error() {
        let encoded = metadata().encode();
        for len in [0, encoded.len() / 4, encoded.len() / 2, encoded.len() - 3] {
            assert!(
                EntryMetadata::decode(&encoded[..len]).is_err(),
                "decoded {len} bytes"
            );
        }
        assert_eq!(EntryMetadata::decode(""), Err(EntryError::Truncated));
    }

    #[test]
    fn well_formed_but_altered_fields_are_returned_as_is() {
        let encoded = metadata()
            .encode()
            .replace("TLS_AES_128_GCM_SHA256", "TLS_SOMETHING_ELSE");
        let decoded = EntryMetadata::decode(&encoded).expect("well-formed");
        assert_eq!(
            decoded.handshake.expect("present").cipher_suite,
            CipherSuite("TLS_SOMETHING_ELSE".into())
        );
    }

    #[test]
    fn bad_counts_are_rejected() {
        let encoded = metadata().encode().replacen("\n1\n", "\nlots\n", 1);
        assert_matches!(
            EntryMetadata::decode(&encoded),
            Err(EntryError::Malformed("header count"))
        );
    }

    #[test]
    fn matching_honors_vary() {
        let metadata = EntryMetadata {
            url: Uri::from_static("https://example.com/foo?q=1"),
            ..metadata()
        };
        let request = Request::get(Uri::from_static("https://example.com/foo?q=1"));
        assert!(!metadata.matches(&request));
        let request = request.with_header(
            http::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("fr"),
        );
        assert!(metadata.matches(&request));
        assert!(!metadata.matches(&Request::get(Uri::from_static("https://example.com/"))));
    }
}
