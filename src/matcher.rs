//! Request matching logic.
//!
//! Matches an incoming request against the active mocks of its folder. The
//! predicate is pure: candidates are loaded by the caller and nothing here
//! touches the store.

use crate::model::{canonicalize_json, normalize_base, split_path_query, Mock};
use axum::http::HeaderMap;
use percent_encoding::percent_decode_str;

/// Request headers never considered for matching.
const IGNORED_HEADERS: &[&str] = &[
    "accept-encoding",
    "connection",
    "user-agent",
    "host",
    "content-length",
    "transfer-encoding",
    "upgrade",
    "via",
    "x-real-ip",
];

const IGNORED_HEADER_PREFIX: &str = "x-forwarded-";

/// The parts of a request the matcher looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a str,
    /// Folder-relative path with query
    pub inner_full_path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Whether a header name is excluded from matching.
pub fn is_ignored_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    IGNORED_HEADERS.contains(&name.as_str()) || name.starts_with(IGNORED_HEADER_PREFIX)
}

/// Find the winning mock for a request.
///
/// Among all matching candidates the lowest `display_order` wins, then the
/// lowest id.
pub fn find_match<'a>(candidates: &'a [Mock], request: &RequestView<'_>) -> Option<&'a Mock> {
    candidates
        .iter()
        .filter(|mock| matches_request(mock, request))
        .min_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.id.cmp(&b.id))
        })
}

fn matches_request(mock: &Mock, request: &RequestView<'_>) -> bool {
    mock.method.eq_ignore_ascii_case(request.method.trim())
        && matches_path(&mock.path, request.inner_full_path)
        && mock
            .headers
            .iter()
            .all(|(name, requirement)| {
                if is_ignored_header(name) {
                    return true;
                }
                match request.headers.get(name.as_str()) {
                    None => requirement.is_optional(),
                    Some(_) if requirement.is_optional() => true,
                    Some(value) => value.as_bytes() == requirement.value().as_bytes(),
                }
            })
        && matches_body(mock, request.body)
}

fn matches_path(mock_path: &str, request_path: &str) -> bool {
    let (mock_base, mock_query) = split_path_query(mock_path);
    let (request_base, request_query) = split_path_query(request_path);

    if normalize_base(mock_base) != normalize_base(request_base) {
        return false;
    }

    match mock_query.filter(|q| !q.is_empty()) {
        Some(expected) => {
            sorted_pairs(expected) == sorted_pairs(request_query.unwrap_or_default())
        }
        None => true,
    }
}

fn sorted_pairs(query: &str) -> Vec<(String, String)> {
    let mut pairs = parse_query_string(query);
    pairs.sort();
    pairs
}

fn matches_body(mock: &Mock, body: &[u8]) -> bool {
    let probe = match (&mock.body_contains, mock.body_contains_required) {
        (Some(probe), true) if !probe.trim().is_empty() => canonicalize_json(probe),
        _ => return true,
    };

    if body.is_empty() {
        return false;
    }

    match std::str::from_utf8(body) {
        Ok(text) => canonicalize_json(text).contains(probe.as_str()),
        Err(_) => contains_bytes(body, probe.as_bytes()),
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Parse a query string into decoded key-value pairs, in order.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (urlencoding_decode(key), urlencoding_decode(value)),
            None => (urlencoding_decode(part), String::new()),
        })
        .collect()
}

/// Form-style URL decoding (`+` is a space).
fn urlencoding_decode(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FolderKey, HeaderRequirement, ResponseBody};
    use axum::http::HeaderValue;
    use uuid::Uuid;

    fn make_mock(method: &str, path: &str) -> Mock {
        Mock::new(&FolderKey::root("api"), method, path, 200, ResponseBody::default())
    }

    fn view<'a>(method: &'a str, path: &'a str, headers: &'a HeaderMap, body: &'a [u8]) -> RequestView<'a> {
        RequestView {
            method,
            inner_full_path: path,
            headers,
            body,
        }
    }

    #[test]
    fn test_method_matching() {
        let mocks = vec![make_mock("get", "/users")];
        let headers = HeaderMap::new();

        assert!(find_match(&mocks, &view("GET", "/users", &headers, b"")).is_some());
        assert!(find_match(&mocks, &view("get", "/users", &headers, b"")).is_some());
        assert!(find_match(&mocks, &view("DELETE", "/users", &headers, b"")).is_none());
    }

    #[test]
    fn test_path_trailing_slash() {
        let mocks = vec![make_mock("GET", "/users/")];
        let headers = HeaderMap::new();

        assert!(find_match(&mocks, &view("GET", "/users", &headers, b"")).is_some());
        assert!(find_match(&mocks, &view("GET", "/users//", &headers, b"")).is_some());
        assert!(find_match(&mocks, &view("GET", "/users/1", &headers, b"")).is_none());

        let root = vec![make_mock("GET", "/")];
        assert!(find_match(&root, &view("GET", "/", &headers, b"")).is_some());
    }

    #[test]
    fn test_query_matching() {
        let mocks = vec![make_mock("GET", "/users?x=1")];
        let headers = HeaderMap::new();

        assert!(find_match(&mocks, &view("GET", "/users?x=1", &headers, b"")).is_some());
        assert!(find_match(&mocks, &view("GET", "/users?x=2", &headers, b"")).is_none());
        assert!(find_match(&mocks, &view("GET", "/users", &headers, b"")).is_none());
    }

    #[test]
    fn test_query_order_independent() {
        let mocks = vec![make_mock("GET", "/search?a=1&b=2")];
        let headers = HeaderMap::new();

        assert!(find_match(&mocks, &view("GET", "/search?b=2&a=1", &headers, b"")).is_some());
        assert!(find_match(&mocks, &view("GET", "/search?a=1&b=%32", &headers, b"")).is_some());
    }

    #[test]
    fn test_mock_without_query_accepts_any() {
        let mocks = vec![make_mock("GET", "/users")];
        let headers = HeaderMap::new();

        assert!(find_match(&mocks, &view("GET", "/users?page=3", &headers, b"")).is_some());
    }

    #[test]
    fn test_header_matching() {
        let mut mock = make_mock("GET", "/users");
        mock.headers.insert(
            "X-Auth".to_string(),
            HeaderRequirement::Detailed {
                value: "t".to_string(),
                optional: false,
            },
        );
        let mocks = vec![mock];

        let empty = HeaderMap::new();
        assert!(find_match(&mocks, &view("GET", "/users", &empty, b"")).is_none());

        let mut headers = HeaderMap::new();
        headers.insert("x-auth", HeaderValue::from_static("t"));
        assert!(find_match(&mocks, &view("GET", "/users", &headers, b"")).is_some());

        headers.insert("X-AUTH", HeaderValue::from_static("wrong"));
        assert!(find_match(&mocks, &view("GET", "/users", &headers, b"")).is_none());
    }

    #[test]
    fn test_optional_header_checks_presence_only() {
        let mut mock = make_mock("GET", "/users");
        mock.headers.insert(
            "X-Trace".to_string(),
            HeaderRequirement::Detailed {
                value: "expected".to_string(),
                optional: true,
            },
        );
        let mocks = vec![mock];

        let empty = HeaderMap::new();
        assert!(find_match(&mocks, &view("GET", "/users", &empty, b"")).is_some());

        let mut headers = HeaderMap::new();
        headers.insert("x-trace", HeaderValue::from_static("other"));
        assert!(find_match(&mocks, &view("GET", "/users", &headers, b"")).is_some());
    }

    #[test]
    fn test_ignored_headers_skipped() {
        let mut mock = make_mock("GET", "/users");
        mock.headers
            .insert("User-Agent".to_string(), HeaderRequirement::Literal("curl".to_string()));
        mock.headers
            .insert("X-Forwarded-For".to_string(), HeaderRequirement::Literal("1.2.3.4".to_string()));
        let mocks = vec![mock];

        let headers = HeaderMap::new();
        assert!(find_match(&mocks, &view("GET", "/users", &headers, b"")).is_some());
        assert!(is_ignored_header("X-Forwarded-Proto"));
        assert!(!is_ignored_header("X-Auth"));
    }

    #[test]
    fn test_body_contains_canonicalized() {
        let mut mock = make_mock("POST", "/items");
        mock.body_contains = Some(r#""id":42"#.to_string());
        mock.body_contains_required = true;
        mock.normalize();
        let mocks = vec![mock];
        let headers = HeaderMap::new();

        let body = br#"{"id": 42, "name":"a"}"#;
        assert!(find_match(&mocks, &view("POST", "/items", &headers, body)).is_some());
        assert!(find_match(&mocks, &view("POST", "/items", &headers, b"{}")).is_none());
        assert!(find_match(&mocks, &view("POST", "/items", &headers, b"")).is_none());
    }

    #[test]
    fn test_body_not_inspected_unless_required() {
        let mut mock = make_mock("POST", "/items");
        mock.body_contains = Some("needle".to_string());
        let mocks = vec![mock];
        let headers = HeaderMap::new();

        assert!(find_match(&mocks, &view("POST", "/items", &headers, b"")).is_some());
    }

    #[test]
    fn test_empty_body_probe_is_unset() {
        let mut mock = make_mock("POST", "/items");
        mock.body_contains = Some(String::new());
        mock.body_contains_required = true;
        let mut blank = make_mock("POST", "/blank");
        blank.body_contains = Some("  ".to_string());
        blank.body_contains_required = true;
        let mocks = vec![mock, blank];
        let headers = HeaderMap::new();

        assert!(find_match(&mocks, &view("POST", "/items", &headers, b"")).is_some());
        assert!(find_match(&mocks, &view("POST", "/items", &headers, b"{}")).is_some());
        assert!(find_match(&mocks, &view("POST", "/blank", &headers, b"")).is_some());
    }

    #[test]
    fn test_binary_body_byte_substring() {
        let mut mock = make_mock("POST", "/upload");
        mock.body_contains = Some("PNG".to_string());
        mock.body_contains_required = true;
        let mocks = vec![mock];
        let headers = HeaderMap::new();

        let body = [0x89, b'P', b'N', b'G', 0xff];
        assert!(find_match(&mocks, &view("POST", "/upload", &headers, &body)).is_some());
        let other = [0x89, b'J', b'P', 0xff];
        assert!(find_match(&mocks, &view("POST", "/upload", &headers, &other)).is_none());
    }

    #[test]
    fn test_tie_break_order() {
        let mut a = make_mock("GET", "/users");
        a.display_order = 2;
        let mut b = make_mock("GET", "/users");
        b.display_order = 1;
        b.id = Uuid::from_u128(9);
        let mut c = make_mock("GET", "/users");
        c.display_order = 1;
        c.id = Uuid::from_u128(3);

        let mocks = vec![a, b, c];
        let headers = HeaderMap::new();
        let winner = find_match(&mocks, &view("GET", "/users", &headers, b"")).unwrap();
        assert_eq!(winner.id, Uuid::from_u128(3));
    }

    #[test]
    fn test_parse_query_string() {
        let params = parse_query_string("foo=bar&baz=qux&flag");
        assert_eq!(
            params,
            vec![
                ("foo".to_string(), "bar".to_string()),
                ("baz".to_string(), "qux".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );

        let params = parse_query_string("name=John%20Doe&city=New+York&e=%C3%A9");
        assert_eq!(params[0].1, "John Doe");
        assert_eq!(params[1].1, "New York");
        assert_eq!(params[2].1, "é");
    }
}
