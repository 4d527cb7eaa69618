//! Translation between cookie-jar records and `Cookie` / `Set-Cookie` headers.
//!
//! # Design
//! Outbound, only name/value pairs survive: attributes are meaningless in a
//! request `Cookie` header. Inbound, every `Set-Cookie` header value may hold
//! several cookies folded with commas, so values are split back apart before
//! attribute parsing. Commas inside `Expires` dates are told apart from
//! separators by looking ahead for the next `name=`.
//!
//! Values are passed through verbatim in both directions, so what the jar
//! stores is exactly what the embedded server set. Both directions share one
//! name/value grammar: a cookie the parser accepts can always be sent back.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use http::HeaderValue;

use crate::error::CookieError;

/// One cookie as the desktop shell's jar stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    /// Absolute expiry; `None` is a session cookie.
    pub expiration: Option<DateTime<Utc>>,
}

impl CookieRecord {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            expiration: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Session cookies never count as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at < now)
    }
}

/// Serialize jar records into a request `Cookie` header value.
///
/// Returns `None` for an empty list so no header is set at all.
pub fn outbound_header(cookies: &[CookieRecord]) -> Result<Option<String>, CookieError> {
    if cookies.is_empty() {
        return Ok(None);
    }
    let mut pairs = Vec::with_capacity(cookies.len());
    for cookie in cookies {
        if !is_valid_name(&cookie.name) {
            return Err(CookieError::InvalidName(cookie.name.clone()));
        }
        if !is_valid_value(&cookie.value) {
            return Err(CookieError::InvalidValue(cookie.name.clone()));
        }
        pairs.push(format!("{}={}", cookie.name, cookie.value));
    }
    Ok(Some(pairs.join("; ")))
}

/// Parse every `Set-Cookie` value of a response into jar records.
///
/// Malformed cookie strings are skipped. A header value that is not visible
/// ASCII aborts the whole batch.
pub fn inbound_records<'a, I>(values: I, now: DateTime<Utc>) -> Result<Vec<CookieRecord>, CookieError>
where
    I: IntoIterator<Item = &'a HeaderValue>,
{
    let mut records = Vec::new();
    for value in values {
        for cookie in split_set_cookie(value.to_str()?) {
            match parse_set_cookie(cookie, now) {
                Ok(record) => records.push(record),
                Err(err) => tracing::debug!(%err, "skipping malformed Set-Cookie entry"),
            }
        }
    }
    Ok(records)
}

/// Split a comma-folded `Set-Cookie` value into individual cookie strings.
///
/// A comma separates two cookies only when the text after it (skipping
/// whitespace) reaches `=` before any `;` or `,`. This keeps
/// `Expires=Wed, 21 Oct 2015 07:28:00 GMT` in one piece.
pub fn split_set_cookie(header: &str) -> Vec<&str> {
    let bytes = header.as_bytes();
    let mut cookies = Vec::new();
    let mut start = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] != b',' {
            pos += 1;
            continue;
        }
        let separator = pos;
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let next_start = pos;
        while pos < bytes.len() && !matches!(bytes[pos], b'=' | b';' | b',') {
            pos += 1;
        }
        if pos < bytes.len() && bytes[pos] == b'=' {
            push_trimmed(&mut cookies, &header[start..separator]);
            start = next_start;
        } else {
            pos = separator + 1;
        }
    }
    push_trimmed(&mut cookies, &header[start..]);
    cookies
}

fn push_trimmed<'a>(cookies: &mut Vec<&'a str>, cookie: &'a str) {
    let cookie = cookie.trim();
    if !cookie.is_empty() {
        cookies.push(cookie);
    }
}

/// Parse one cookie string (no comma folding) into a record.
///
/// Names and values that `outbound_header` could not send are rejected as
/// malformed. `Expires` wins over `Max-Age`; `Max-Age` is relative to `now`, and a
/// non-positive value marks the cookie as already expired. Unparseable
/// attribute values are ignored as if absent.
pub fn parse_set_cookie(cookie: &str, now: DateTime<Utc>) -> Result<CookieRecord, CookieError> {
    let mut parts = cookie.split(';');
    let pair = parts.next().unwrap_or_default();
    let (name, value) = pair
        .split_once('=')
        .ok_or_else(|| CookieError::Malformed(cookie.to_string()))?;
    let (name, value) = (name.trim(), value.trim());
    if !is_valid_name(name) || !is_valid_value(value) {
        return Err(CookieError::Malformed(cookie.to_string()));
    }

    let mut record = CookieRecord::new(name, value);
    let mut expires = None;
    let mut max_age = None;

    for attribute in parts {
        let (key, value) = match attribute.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (attribute.trim(), ""),
        };
        match key.to_ascii_lowercase().as_str() {
            "expires" => expires = parse_cookie_date(value),
            "max-age" => max_age = value.parse::<i64>().ok(),
            "domain" => {
                let domain = value.trim_start_matches('.');
                if !domain.is_empty() {
                    record.domain = Some(domain.to_ascii_lowercase());
                }
            }
            "path" if value.starts_with('/') => record.path = Some(value.to_string()),
            "secure" => record.secure = true,
            "httponly" => record.http_only = true,
            _ => {}
        }
    }

    record.expiration = match (expires, max_age) {
        (Some(at), _) => Some(at),
        (None, Some(seconds)) if seconds <= 0 => Some(DateTime::<Utc>::UNIX_EPOCH),
        (None, Some(seconds)) => Some(
            Duration::try_seconds(seconds)
                .and_then(|delta| now.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        ),
        (None, None) => None,
    };
    Ok(record)
}

/// Parse an `Expires` date in RFC 1123, RFC 850 or asctime form.
fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return Some(at.with_timezone(&Utc));
    }
    const LEGACY_FORMATS: [&str; 3] = [
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    LEGACY_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(value, format)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

/// Visible ASCII without `;` or `=`.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b';' && b != b'=')
}

/// Visible ASCII or space, without `;`. No tabs or other controls.
fn is_valid_value(value: &str) -> bool {
    value.bytes().all(|b| (b == b' ' || b.is_ascii_graphic()) && b != b';')
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn header(value: &str) -> HeaderValue {
        HeaderValue::from_str(value).unwrap()
    }

    #[test]
    fn outbound_joins_name_value_pairs() {
        let cookies = vec![
            CookieRecord::new("session", "abc123").with_path("/").http_only(),
            CookieRecord::new("theme", "dark").secure(),
        ];
        assert_eq!(
            outbound_header(&cookies).unwrap().as_deref(),
            Some("session=abc123; theme=dark")
        );
    }

    #[test]
    fn outbound_empty_list_sets_no_header() {
        assert_eq!(outbound_header(&[]).unwrap(), None);
    }

    #[test]
    fn outbound_rejects_unusable_names_and_values() {
        let bad_name = [CookieRecord::new("bad name", "x")];
        assert!(matches!(outbound_header(&bad_name), Err(CookieError::InvalidName(_))));
        let bad_value = [CookieRecord::new("ok", "a;b")];
        assert!(matches!(outbound_header(&bad_value), Err(CookieError::InvalidValue(_))));
    }

    #[test]
    fn split_separates_folded_cookies() {
        let folded = "a=1; Path=/, b=2; HttpOnly,c=3";
        assert_eq!(split_set_cookie(folded), ["a=1; Path=/", "b=2; HttpOnly", "c=3"]);
    }

    #[test]
    fn split_keeps_commas_inside_expires() {
        let folded = "a=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Path=/, b=2";
        assert_eq!(
            split_set_cookie(folded),
            ["a=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Path=/", "b=2"]
        );
    }

    #[test]
    fn split_single_cookie_is_unchanged() {
        assert_eq!(split_set_cookie("only=1; Secure"), ["only=1; Secure"]);
        assert!(split_set_cookie("  ").is_empty());
    }

    #[test]
    fn parse_reads_all_attributes() {
        let record = parse_set_cookie(
            "session=abc; Domain=.Example.com; Path=/app; Secure; HttpOnly; SameSite=Lax",
            now(),
        )
        .unwrap();
        assert_eq!(record.name, "session");
        assert_eq!(record.value, "abc");
        assert_eq!(record.domain.as_deref(), Some("example.com"));
        assert_eq!(record.path.as_deref(), Some("/app"));
        assert!(record.secure);
        assert!(record.http_only);
        assert_eq!(record.expiration, None);
        assert!(!record.is_expired(now()));
    }

    #[test]
    fn parse_expires_rfc1123() {
        let record = parse_set_cookie("a=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT", now()).unwrap();
        assert_eq!(
            record.expiration,
            Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap())
        );
        assert!(record.is_expired(now()));
    }

    #[test]
    fn parse_expires_dashed_form() {
        let record = parse_set_cookie("a=; expires=Thu, 01-Jan-1970 00:00:00 GMT", now()).unwrap();
        assert_eq!(record.expiration, Some(DateTime::<Utc>::UNIX_EPOCH));
        assert_eq!(record.value, "");
    }

    #[test]
    fn parse_max_age_is_relative_to_now() {
        let record = parse_set_cookie("a=1; Max-Age=3600", now()).unwrap();
        assert_eq!(record.expiration, Some(now() + Duration::hours(1)));
        assert!(!record.is_expired(now()));
    }

    #[test]
    fn parse_non_positive_max_age_is_expired() {
        for cookie in ["a=1; Max-Age=0", "a=1; Max-Age=-5"] {
            let record = parse_set_cookie(cookie, now()).unwrap();
            assert!(record.is_expired(now()), "{cookie}");
        }
    }

    #[test]
    fn parse_prefers_expires_over_max_age() {
        let record =
            parse_set_cookie("a=1; Max-Age=3600; Expires=Wed, 21 Oct 2015 07:28:00 GMT", now()).unwrap();
        assert!(record.is_expired(now()));
    }

    #[test]
    fn parse_ignores_garbage_attribute_values() {
        let record = parse_set_cookie("a=1; Expires=soon; Max-Age=later; Path=relative", now()).unwrap();
        assert_eq!(record.expiration, None);
        assert_eq!(record.path, None);
    }

    #[test]
    fn parse_rejects_missing_pair() {
        assert!(matches!(parse_set_cookie("novalue", now()), Err(CookieError::Malformed(_))));
        assert!(matches!(parse_set_cookie("=1", now()), Err(CookieError::Malformed(_))));
    }

    #[test]
    fn parse_rejects_what_outbound_cannot_send() {
        for cookie in ["bad name=1", "tab=a\tb", "ctl\x01=1"] {
            assert!(matches!(parse_set_cookie(cookie, now()), Err(CookieError::Malformed(_))), "{cookie:?}");
        }
    }

    #[test]
    fn every_parsed_cookie_is_sendable() {
        let values = [header("cart[item]=1; Path=/"), header("a/b=x y"), header("user@x=tok=en")];
        let records = inbound_records(values.iter(), now()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            outbound_header(&records).unwrap().as_deref(),
            Some("cart[item]=1; a/b=x y; user@x=tok=en")
        );
    }

    #[test]
    fn inbound_splits_and_skips_malformed() {
        let values = [header("a=1, b=2; Path=/"), header("garbage"), header("c=3")];
        let records = inbound_records(values.iter(), now()).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn inbound_aborts_on_unreadable_header() {
        let values = [header("a=1"), HeaderValue::from_bytes(b"b=\xff").unwrap()];
        let err = inbound_records(values.iter(), now()).unwrap_err();
        assert!(matches!(err, CookieError::InvalidHeader(_)));
    }

    #[test]
    fn outbound_then_inbound_recovers_pairs() {
        let cookies = vec![
            CookieRecord::new("session", "abc123"),
            CookieRecord::new("csrf", "tok=en"),
        ];
        let joined = outbound_header(&cookies).unwrap().unwrap();
        let set_cookie: Vec<_> = joined.split("; ").map(header).collect();
        let records = inbound_records(set_cookie.iter(), now()).unwrap();
        let pairs: Vec<_> = records.iter().map(|r| (r.name.as_str(), r.value.as_str())).collect();
        assert_eq!(pairs, [("session", "abc123"), ("csrf", "tok=en")]);
    }
}
