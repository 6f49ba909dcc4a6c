//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Deciding whether a request goes to the network, the cache, or both.

use chrono::{DateTime, TimeDelta, Utc};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};

use crate::http::{parse_http_date, Request, Response};

/// The directives of the `Cache-Control` headers (and `Pragma: no-cache`) of a
/// request or response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<TimeDelta>,
    pub s_max_age: Option<TimeDelta>,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    /// `max-stale` without a value accepts any staleness.
    pub max_stale: Option<TimeDelta>,
    pub min_fresh: Option<TimeDelta>,
    pub only_if_cached: bool,
    pub no_transform: bool,
    pub immutable: bool,
}

impl CacheControl {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cache_control = Self::default();
        for (name, value) in headers {
            let is_pragma = name == header::PRAGMA;
            if !is_pragma && name != header::CACHE_CONTROL {
                continue;
            }
            let Ok(value) = value.to_str() else {
                continue;
            };
            for (directive, argument) in Directives(value) {
                if is_pragma {
                    // Only `no-cache` means anything in a Pragma.
                    cache_control.no_cache |= directive.eq_ignore_ascii_case("no-cache");
                    continue;
                }
                match directive.to_ascii_lowercase().as_str() {
                    "no-cache" => cache_control.no_cache = true,
                    "no-store" => cache_control.no_store = true,
                    "max-age" => cache_control.max_age = argument.and_then(parse_seconds),
                    "s-maxage" => cache_control.s_max_age = argument.and_then(parse_seconds),
                    "private" => cache_control.private = true,
                    "public" => cache_control.public = true,
                    "must-revalidate" => cache_control.must_revalidate = true,
                    "max-stale" => {
                        cache_control.max_stale =
                            Some(argument.and_then(parse_seconds).unwrap_or(TimeDelta::MAX))
                    }
                    "min-fresh" => cache_control.min_fresh = argument.and_then(parse_seconds),
                    "only-if-cached" => cache_control.only_if_cached = true,
                    "no-transform" => cache_control.no_transform = true,
                    "immutable" => cache_control.immutable = true,
                    _ => {}
                }
            }
        }
        cache_control
    }
}

/// Splits a header value into `(directive, argument)` pairs, keeping commas
/// inside quoted arguments.
struct Directives<'a>(&'a str);

impl<'a> Iterator for Directives<'a> {
    type Item = (&'a str, Option<&'a str>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = self.0.trim_start_matches([' ', '\t', ',']);
            if rest.is_empty() {
                self.0 = rest;
                return None;
            }
            let name_end = rest.find(['=', ',']).unwrap_or(rest.len());
            let directive = rest[..name_end].trim();
            let rest = &rest[name_end..];

            let Some(rest) = rest.strip_prefix('=') else {
                self.0 = rest;
                if directive.is_empty() {
                    continue;
                }
                return Some((directive, None));
            };

            let rest = rest.trim_start();
            let (argument, rest) = if let Some(quoted) = rest.strip_prefix('"') {
                let end = quoted.find('"').unwrap_or(quoted.len());
                (&quoted[..end], quoted.get(end + 1..).unwrap_or_default())
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                (rest[..end].trim(), &rest[end..])
            };
            self.0 = rest;
            return Some((directive, Some(argument)));
        }
    }
}

/// Delta-seconds, saturating at `i32::MAX`; garbage is ignored.
fn parse_seconds(value: &str) -> Option<TimeDelta> {
    let seconds = value.trim().parse::<u64>().ok()?;
    Some(TimeDelta::seconds(seconds.min(i32::MAX as u64) as i64))
}

/// Whether `response` may be stored and later served for `request`.
pub fn is_cacheable(response: &Response, request: &Request) -> bool {
    let response_caching = CacheControl::parse(&response.headers);
    match response.status.as_u16() {
        200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
        302 | 307 => {
            // Temporary redirects need explicit permission.
            if !response.headers.contains_key(header::EXPIRES)
                && response_caching.max_age.is_none()
                && !response_caching.public
                && !response_caching.private
            {
                return false;
            }
        }
        _ => return false,
    }
    !response_caching.no_store && !CacheControl::parse(&request.headers).no_store
}

/// Whether a request with `method` makes stored responses for its URL
/// obsolete.
pub fn invalidates_cache(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PATCH
        || *method == Method::PUT
        || *method == Method::DELETE
        || method.as_str() == "MOVE"
}

/// The outcome of weighing a request against the stored response for it.
///
/// | `network_request` | `cache_response` | meaning |
/// |---|---|---|
/// | `None` | `None` | unsatisfiable: only-if-cached and nothing usable |
/// | `None` | `Some` | serve from the cache |
/// | `Some` | `None` | go to the network |
/// | `Some` | `Some` | conditional request to validate the stored response |
#[derive(Clone, Debug)]
pub struct CacheStrategy {
    pub network_request: Option<Request>,
    pub cache_response: Option<Response>,
}

impl CacheStrategy {
    pub fn compute(now: DateTime<Utc>, request: &Request, cached: Option<Response>) -> Self {
        let candidate = Self::compute_candidate(now, request, cached);
        if candidate.network_request.is_some()
            && CacheControl::parse(&request.headers).only_if_cached
        {
            return Self {
                network_request: None,
                cache_response: None,
            };
        }
        candidate
    }

    fn network(request: &Request) -> Self {
        Self {
            network_request: Some(request.clone()),
            cache_response: None,
        }
    }

    fn compute_candidate(now: DateTime<Utc>, request: &Request, cached: Option<Response>) -> Self {
        let Some(mut cached) = cached else {
            return Self::network(request);
        };

        let is_https = request.url.scheme_str() == Some("https");
        if is_https && cached.handshake.is_none() {
            return Self::network(request);
        }
        if !is_cacheable(&cached, request) {
            return Self::network(request);
        }

        let request_caching = CacheControl::parse(&request.headers);
        if request_caching.no_cache
            || request.headers.contains_key(header::IF_MODIFIED_SINCE)
            || request.headers.contains_key(header::IF_NONE_MATCH)
        {
            return Self::network(request);
        }

        let response_caching = CacheControl::parse(&cached.headers);
        let dates = ResponseDates::of(&cached);
        if response_caching.immutable && !response_caching.no_cache {
            return Self {
                network_request: None,
                cache_response: Some(cached),
            };
        }

        let age = dates.age(&cached, now);
        let mut fresh = dates.freshness_lifetime(&cached, &response_caching);
        if let Some(max_age) = request_caching.max_age {
            fresh = fresh.min(max_age);
        }
        let min_fresh = request_caching.min_fresh.unwrap_or_default();
        let max_stale = request_caching
            .max_stale
            .filter(|_| !response_caching.must_revalidate)
            .unwrap_or_default();

        let age_ms = age.num_milliseconds();
        let fresh_ms = fresh.num_milliseconds();
        if !response_caching.no_cache
            && age_ms.saturating_add(min_fresh.num_milliseconds())
                < fresh_ms.saturating_add(max_stale.num_milliseconds())
        {
            if age_ms.saturating_add(min_fresh.num_milliseconds()) >= fresh_ms {
                cached.headers.append(
                    header::WARNING,
                    HeaderValue::from_static("110 HttpURLConnection \"Response is stale\""),
                );
            }
            if age > TimeDelta::days(1) && dates.is_heuristic(&response_caching) {
                cached.headers.append(
                    header::WARNING,
                    HeaderValue::from_static("113 HttpURLConnection \"Heuristic expiration\""),
                );
            }
            return Self {
                network_request: None,
                cache_response: Some(cached),
            };
        }

        let condition = if let Some(etag) = cached.headers.get(header::ETAG) {
            (header::IF_NONE_MATCH, etag.clone())
        } else if let Some(last_modified) = &dates.last_modified_string {
            (header::IF_MODIFIED_SINCE, last_modified.clone())
        } else if let Some(served) = &dates.served_date_string {
            (header::IF_MODIFIED_SINCE, served.clone())
        } else {
            // No validator to make the request conditional with.
            return Self::network(request);
        };

        let mut conditional = request.clone();
        conditional.headers.insert(condition.0, condition.1);
        Self {
            network_request: Some(conditional),
            cache_response: Some(cached),
        }
    }
}

/// The dates a stored response carries.
struct ResponseDates {
    served_date: Option<DateTime<Utc>>,
    served_date_string: Option<HeaderValue>,
    last_modified: Option<DateTime<Utc>>,
    last_modified_string: Option<HeaderValue>,
    expires: Option<DateTime<Utc>>,
    age_seconds: Option<i64>,
}

impl ResponseDates {
    fn of(response: &Response) -> Self {
        let date_header = |name: header::HeaderName| {
            let value = response.headers.get(&name)?;
            let date = parse_http_date(value.to_str().ok()?)?;
            Some((date, value.clone()))
        };
        let (served_date, served_date_string) = date_header(header::DATE).unzip();
        let (last_modified, last_modified_string) = date_header(header::LAST_MODIFIED).unzip();
        let expires = date_header(header::EXPIRES).map(|(date, _)| date);
        let age_seconds = response
            .header(&header::AGE)
            .and_then(|age| age.trim().parse::<u64>().ok())
            .map(|age| age.min(i32::MAX as u64) as i64);
        Self {
            served_date,
            served_date_string,
            last_modified,
            last_modified_string,
            expires,
            age_seconds,
        }
    }

    /// How old the response is now: what it was when received, plus the
    /// round trip, plus how long it has been stored.
    fn age(&self, response: &Response, now: DateTime<Utc>) -> TimeDelta {
        let apparent_received_age = self
            .served_date
            .map(|served| (response.received_response_at - served).max(TimeDelta::zero()))
            .unwrap_or_default();
        let received_age = match self.age_seconds {
            Some(seconds) => apparent_received_age.max(TimeDelta::seconds(seconds)),
            None => apparent_received_age,
        };
        let response_duration = response.received_response_at - response.sent_request_at;
        let resident_duration = now - response.received_response_at;
        received_age + response_duration + resident_duration
    }

    fn freshness_lifetime(&self, response: &Response, caching: &CacheControl) -> TimeDelta {
        if let Some(max_age) = caching.max_age {
            return max_age;
        }
        if let Some(expires) = self.expires {
            let served = self.served_date.unwrap_or(response.received_response_at);
            return (expires - served).max(TimeDelta::zero());
        }
        if let Some(last_modified) = self.last_modified {
            // Responses to queries are never heuristically fresh.
            if response.request.url.query().is_none() {
                let served = self.served_date.unwrap_or(response.sent_request_at);
                let delta = served - last_modified;
                return if delta > TimeDelta::zero() {
                    delta / 10
                } else {
                    TimeDelta::zero()
                };
            }
        }
        TimeDelta::zero()
    }

    fn is_heuristic(&self, caching: &CacheControl) -> bool {
        caching.max_age.is_none() && self.expires.is_none()
    }
}

#[cfg(test)]
mod test {
    use http::Uri;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::http::format_http_date;

    fn http_date(date: DateTime<Utc>) -> HeaderValue {
        HeaderValue::from_str(&format_http_date(date)).expect("valid header")
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("valid")
    }

    fn request() -> Request {
        Request::get(Uri::from_static("http://a.example/page"))
    }

    /// A response received `ago` before [`now`] with the given headers.
    fn stored(ago: TimeDelta, headers: &[(header::HeaderName, HeaderValue)]) -> Response {
        let mut response = Response::new(request(), StatusCode::OK).with_body("stored");
        response.sent_request_at = now() - ago;
        response.received_response_at = now() - ago;
        for (name, value) in headers {
            response.headers.append(name.clone(), value.clone());
        }
        response
    }

    fn value(s: &'static str) -> HeaderValue {
        HeaderValue::from_static(s)
    }

    #[test]
    fn parses_directives() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::CACHE_CONTROL,
            value("max-age=60, private=\"set-cookie, x-a\", No-Store"),
        );
        headers.append(header::CACHE_CONTROL, value("max-stale, min-fresh=bogus"));
        headers.append(header::PRAGMA, value("no-cache"));

        assert_eq!(
            CacheControl::parse(&headers),
            CacheControl {
                no_cache: true,
                no_store: true,
                max_age: Some(TimeDelta::seconds(60)),
                private: true,
                max_stale: Some(TimeDelta::MAX),
                ..Default::default()
            }
        );
    }

    #[test]
    fn huge_max_age_saturates() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, value("max-age=99999999999"));
        assert_eq!(
            CacheControl::parse(&headers).max_age,
            Some(TimeDelta::seconds(i32::MAX.into()))
        );
    }

    #[test]
    fn nothing_stored_goes_to_the_network() {
        let strategy = CacheStrategy::compute(now(), &request(), None);
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn fresh_response_is_served() {
        let cached = stored(
            TimeDelta::seconds(30),
            &[(header::CACHE_CONTROL, value("max-age=60"))],
        );
        let strategy = CacheStrategy::compute(now(), &request(), Some(cached));
        assert!(strategy.network_request.is_none());
        let served = strategy.cache_response.expect("served");
        assert!(!served.headers.contains_key(header::WARNING));
    }

    #[test]
    fn age_header_counts_against_freshness() {
        let cached = stored(
            TimeDelta::seconds(30),
            &[
                (header::CACHE_CONTROL, value("max-age=60")),
                (header::AGE, value("45")),
            ],
        );
        let strategy = CacheStrategy::compute(now(), &request(), Some(cached));
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn stale_response_with_etag_is_validated() {
        let cached = stored(
            TimeDelta::seconds(120),
            &[
                (header::CACHE_CONTROL, value("max-age=60")),
                (header::ETAG, value("\"v1\"")),
            ],
        );
        let strategy = CacheStrategy::compute(now(), &request(), Some(cached));
        let conditional = strategy.network_request.expect("validates");
        assert_eq!(conditional.header(&header::IF_NONE_MATCH), Some("\"v1\""));
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn stale_response_with_last_modified_is_validated() {
        let last_modified = http_date(now() - TimeDelta::days(2));
        let cached = stored(
            TimeDelta::seconds(120),
            &[
                (header::CACHE_CONTROL, value("max-age=60")),
                (header::LAST_MODIFIED, last_modified.clone()),
            ],
        );
        let strategy = CacheStrategy::compute(now(), &request(), Some(cached));
        let conditional = strategy.network_request.expect("validates");
        assert_eq!(
            conditional.headers.get(header::IF_MODIFIED_SINCE),
            Some(&last_modified)
        );
    }

    #[test]
    fn stale_response_without_validators_is_replaced() {
        let cached = stored(
            TimeDelta::seconds(120),
            &[(header::CACHE_CONTROL, value("max-age=60"))],
        );
        let strategy = CacheStrategy::compute(now(), &request(), Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn last_modified_gives_heuristic_freshness() {
        // Modified 100 minutes before it was served: fresh for 10 minutes.
        let served = now() - TimeDelta::minutes(5);
        let headers = [
            (header::DATE, http_date(served)),
            (
                header::LAST_MODIFIED,
                http_date(served - TimeDelta::minutes(100)),
            ),
        ];
        let cached = stored(TimeDelta::minutes(5), &headers);
        let strategy = CacheStrategy::compute(now(), &request(), Some(cached));
        assert!(strategy.network_request.is_none());

        let mut with_query = stored(TimeDelta::minutes(5), &headers);
        with_query.request.url = Uri::from_static("http://a.example/page?q=1");
        let request = Request::get(Uri::from_static("http://a.example/page?q=1"));
        let strategy = CacheStrategy::compute(now(), &request, Some(with_query));
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn request_no_cache_goes_to_the_network() {
        let cached = stored(
            TimeDelta::seconds(1),
            &[(header::CACHE_CONTROL, value("max-age=60"))],
        );
        let request = request().with_header(header::CACHE_CONTROL, value("no-cache"));
        let strategy = CacheStrategy::compute(now(), &request, Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn max_stale_serves_stale_responses_unless_they_must_revalidate() {
        let request = request().with_header(header::CACHE_CONTROL, value("max-stale=120"));

        let cached = stored(
            TimeDelta::seconds(120),
            &[(header::CACHE_CONTROL, value("max-age=60"))],
        );
        let strategy = CacheStrategy::compute(now(), &request, Some(cached));
        let served = strategy.cache_response.expect("served");
        assert!(strategy.network_request.is_none());
        assert!(served.headers.contains_key(header::WARNING));

        let cached = stored(
            TimeDelta::seconds(120),
            &[(header::CACHE_CONTROL, value("max-age=60, must-revalidate"))],
        );
        let strategy = CacheStrategy::compute(now(), &request, Some(cached));
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn only_if_cached_without_a_usable_response_is_unsatisfiable() {
        let request = request().with_header(header::CACHE_CONTROL, value("only-if-cached"));
        let strategy = CacheStrategy::compute(now(), &request, None);
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn https_response_without_handshake_is_ignored() {
        let mut cached = stored(
            TimeDelta::seconds(1),
            &[(header::CACHE_CONTROL, value("max-age=60"))],
        );
        cached.request.url = Uri::from_static("https://a.example/page");
        let request = Request::get(Uri::from_static("https://a.example/page"));
        let strategy = CacheStrategy::compute(now(), &request, Some(cached));
        assert!(strategy.cache_response.is_none());
    }

    #[test_case(200, "", true)]
    #[test_case(308, "", true)]
    #[test_case(404, "", true)]
    #[test_case(302, "", false)]
    #[test_case(302, "max-age=60", true)]
    #[test_case(307, "public", true)]
    #[test_case(500, "max-age=60", false)]
    #[test_case(200, "no-store", false)]
    fn cacheability(status: u16, cache_control: &'static str, expected: bool) {
        let mut response = Response::new(
            request(),
            StatusCode::from_u16(status).expect("valid"),
        );
        if !cache_control.is_empty() {
            response
                .headers
                .insert(header::CACHE_CONTROL, value(cache_control));
        }
        assert_eq!(is_cacheable(&response, &request()), expected);
    }

    #[test]
    fn request_no_store_prevents_caching() {
        let response = Response::new(request(), StatusCode::OK);
        let request = request().with_header(header::CACHE_CONTROL, value("no-store"));
        assert!(!is_cacheable(&response, &request));
    }

    #[test_case(Method::POST, true)]
    #[test_case(Method::DELETE, true)]
    #[test_case(Method::from_bytes(b"MOVE").expect("valid"), true)]
    #[test_case(Method::GET, false)]
    #[test_case(Method::HEAD, false)]
    fn invalidating_methods(method: Method, expected: bool) {
        assert_eq!(invalidates_cache(&method), expected);
    }
}
