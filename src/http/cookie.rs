//! Session-cookie parsing and `Set-Cookie` construction, grounded in the
//! teacher's cookie utilities but narrowed to the one cookie the server
//! itself issues (`webservSessionId`); arbitrary request cookies are already
//! handled generically by `request::parse_cookie_header`.

pub const SESSION_COOKIE_NAME: &str = "webservSessionId";

/// Builds a `Set-Cookie` header value for a freshly created session.
pub fn build_set_cookie(session_id: &str, max_age_secs: u64) -> String {
    format!(
        "{SESSION_COOKIE_NAME}={session_id}; Path=/; HttpOnly; Max-Age={max_age_secs}"
    )
}

pub fn find_session_cookie(cookies: &[(String, String)]) -> Option<&str> {
    cookies
        .iter()
        .find(|(k, _)| k == SESSION_COOKIE_NAME)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_header_shape() {
        let header = build_set_cookie("abc123", 3600);
        assert_eq!(header, "webservSessionId=abc123; Path=/; HttpOnly; Max-Age=3600");
    }

    #[test]
    fn finds_session_cookie_among_others() {
        let cookies = vec![
            ("a".to_string(), "1".to_string()),
            (SESSION_COOKIE_NAME.to_string(), "xyz".to_string()),
        ];
        assert_eq!(find_session_cookie(&cookies), Some("xyz"));
    }

    #[test]
    fn missing_session_cookie_is_none() {
        let cookies = vec![("a".to_string(), "1".to_string())];
        assert_eq!(find_session_cookie(&cookies), None);
    }
}
