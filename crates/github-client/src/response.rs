//! Parsed API responses and `Link` header pagination

use crate::ratelimit::RateLimitInfo;
use reqwest::Url;
use reqwest::header::{HeaderMap, LINK};
use serde::de::DeserializeOwned;

/// A successful GitHub response.
#[derive(Debug, Clone)]
pub struct Response {
    /// JSON body; non-JSON bodies become a string, empty bodies `Null`.
    pub data: serde_json::Value,
    pub status: u16,
    pub rate_limit: Option<RateLimitInfo>,
    pub headers: HeaderMap,
    pub pagination: Pagination,
}

impl Response {
    pub(crate) fn new(
        status: u16,
        headers: HeaderMap,
        body: &[u8],
        rate_limit: Option<RateLimitInfo>,
    ) -> Self {
        let data = if body.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
            })
        };
        let pagination = Pagination::from_headers(&headers);
        Self {
            data,
            status,
            rate_limit,
            headers,
            pagination,
        }
    }

    /// Deserialize the body into a typed value.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

/// Page links from the `Link` header.
///
/// The client never follows these itself; callers request the next page
/// with an updated `page` parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub next: Option<u32>,
    pub prev: Option<u32>,
    pub first: Option<u32>,
    pub last: Option<u32>,
    pub next_url: Option<String>,
}

impl Pagination {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .map(Self::parse)
            .unwrap_or_default()
    }

    /// Parse `<url>; rel="next", <url>; rel="last"`.
    pub fn parse(link: &str) -> Self {
        let mut pagination = Pagination::default();
        for part in link.split(',') {
            let mut pieces = part.split(';');
            let Some(target) = pieces.next() else {
                continue;
            };
            let url = target.trim().trim_start_matches('<').trim_end_matches('>');
            let rel = pieces.find_map(|p| {
                p.trim()
                    .strip_prefix("rel=")
                    .map(|r| r.trim_matches('"').to_string())
            });
            let Some(rel) = rel else { continue };
            let page = page_of(url);
            match rel.as_str() {
                "next" => {
                    pagination.next = page;
                    pagination.next_url = Some(url.to_string());
                }
                "prev" => pagination.prev = page,
                "first" => pagination.first = page,
                "last" => pagination.last = page,
                _ => {}
            }
        }
        pagination
    }

    pub fn has_next(&self) -> bool {
        self.next_url.is_some()
    }
}

fn page_of(url: &str) -> Option<u32> {
    let url = Url::parse(url).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_link_header() {
        let link = [
            r#"<https://api.github.com/repositories/1/issues?per_page=30&page=3>; rel="next""#,
            r#"<https://api.github.com/repositories/1/issues?per_page=30&page=1>; rel="prev""#,
            r#"<https://api.github.com/repositories/1/issues?per_page=30&page=1>; rel="first""#,
            r#"<https://api.github.com/repositories/1/issues?per_page=30&page=9>; rel="last""#,
        ]
        .join(", ");
        let p = Pagination::parse(&link);
        assert_eq!(p.next, Some(3));
        assert_eq!(p.prev, Some(1));
        assert_eq!(p.first, Some(1));
        assert_eq!(p.last, Some(9));
        assert!(p.has_next());
        assert!(p.next_url.unwrap().ends_with("page=3"));
    }

    #[test]
    fn last_page_has_no_next() {
        let link = concat!(
            r#"<https://api.github.com/user/repos?page=1>; rel="first", "#,
            r#"<https://api.github.com/user/repos?page=4>; rel="prev""#,
        );
        let p = Pagination::parse(link);
        assert!(!p.has_next());
        assert_eq!(p.prev, Some(4));
    }

    #[test]
    fn missing_link_header() {
        assert_eq!(Pagination::from_headers(&HeaderMap::new()), Pagination::default());
    }

    #[test]
    fn body_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(r#"<https://api.github.com/x?page=2>; rel="next""#),
        );
        let r = Response::new(200, headers, br#"{"login":"octocat"}"#, None);
        assert_eq!(r.data["login"], "octocat");
        assert_eq!(r.pagination.next, Some(2));

        let r = Response::new(204, HeaderMap::new(), b"", None);
        assert!(r.data.is_null());

        let r = Response::new(200, HeaderMap::new(), b"plain text", None);
        assert_eq!(r.data, serde_json::Value::String("plain text".into()));
    }

    #[test]
    fn typed_json() {
        #[derive(serde::Deserialize)]
        struct User {
            login: String,
        }
        let r = Response::new(200, HeaderMap::new(), br#"{"login":"octocat","id":1}"#, None);
        let user: User = r.json().unwrap();
        assert_eq!(user.login, "octocat");
    }
}
