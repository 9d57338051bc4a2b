//! Password login against a Jupyter server's `/login` form.
//!
//! The server hands out an `_xsrf` cookie on `GET /login`; posting the
//! password with that token returns the session cookies. Subsequent REST and
//! WebSocket requests carry them as `Cookie` plus `X-XSRFToken` headers.

use std::collections::HashMap;

use log::{debug, info};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;

use crate::error::KernelError;

const XSRF_COOKIE: &str = "_xsrf";

/// Cookies collected from a login exchange, in arrival order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    /// Record one `Set-Cookie` header value. Attributes after the first `;`
    /// are ignored; a later cookie with the same name replaces the earlier.
    pub fn add_set_cookie(&mut self, header: &str) {
        let pair = header.split(';').next().unwrap_or_default().trim();
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let value = value.trim().trim_matches('"').to_string();
        match self.cookies.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value,
            None => self.cookies.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `Cookie` header value.
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Headers to attach to every authenticated request.
    pub fn auth_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if !self.is_empty() {
            headers.insert("Cookie".to_string(), self.header_value());
        }
        if let Some(xsrf) = self.get(XSRF_COOKIE) {
            headers.insert("X-XSRFToken".to_string(), xsrf.to_string());
        }
        headers
    }

    /// Whether the server issued a login session cookie.
    fn has_session_cookie(&self) -> bool {
        self.cookies
            .iter()
            .any(|(name, _)| name.starts_with("username-"))
    }

    fn absorb(&mut self, response: &reqwest::Response) {
        for value in response.headers().get_all(SET_COOKIE) {
            if let Ok(value) = value.to_str() {
                self.add_set_cookie(value);
            }
        }
    }
}

/// Log in with `password`, returning the headers that authenticate later
/// requests.
pub async fn login(
    base_url: &str,
    password: &str,
    accept_invalid_certs: bool,
) -> Result<HashMap<String, String>, KernelError> {
    let base_url = base_url.trim_end_matches('/');
    let login_url = format!("{}/login", base_url);

    // Redirects would swallow the Set-Cookie headers of the 302
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(|e| KernelError::Password(e.to_string()))?;

    let mut jar = CookieJar::default();

    debug!("[password] Fetching login form from {}", login_url);
    let response = client
        .get(&login_url)
        .send()
        .await
        .map_err(|e| KernelError::Password(format!("{}: {}", login_url, e)))?;
    jar.absorb(&response);

    let xsrf = jar.get(XSRF_COOKIE).unwrap_or_default().to_string();

    let mut request = client
        .post(&login_url)
        .form(&[(XSRF_COOKIE, xsrf.as_str()), ("password", password)]);
    if !jar.is_empty() {
        request = request
            .header(COOKIE, jar.header_value())
            .header("X-XSRFToken", xsrf.as_str());
    }
    let response = request
        .send()
        .await
        .map_err(|e| KernelError::Password(format!("{}: {}", login_url, e)))?;
    let status = response.status();
    jar.absorb(&response);

    if !login_succeeded(status, &jar) {
        return Err(KernelError::Password(format!(
            "server rejected the password (HTTP {})",
            status.as_u16()
        )));
    }

    info!("[password] Logged in to {}", base_url);
    Ok(jar.auth_headers())
}

/// A successful login redirects away from the form and sets the session
/// cookie; a wrong password re-renders the form with 200 or answers 401.
fn login_succeeded(status: StatusCode, jar: &CookieJar) -> bool {
    status.is_redirection() && jar.has_session_cookie()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_jar_parses_set_cookie() {
        let mut jar = CookieJar::default();
        jar.add_set_cookie("_xsrf=2|abc|def; expires=Wed, 01 Jan 2031 00:00:00 GMT; Path=/");
        jar.add_set_cookie("username-localhost-8888=\"2|token\"; HttpOnly; Path=/");

        assert_eq!(jar.get("_xsrf"), Some("2|abc|def"));
        assert_eq!(jar.get("username-localhost-8888"), Some("2|token"));
        assert_eq!(
            jar.header_value(),
            "_xsrf=2|abc|def; username-localhost-8888=2|token"
        );
    }

    #[test]
    fn test_later_cookie_replaces_earlier() {
        let mut jar = CookieJar::default();
        jar.add_set_cookie("_xsrf=old; Path=/");
        jar.add_set_cookie("_xsrf=new; Path=/");
        assert_eq!(jar.header_value(), "_xsrf=new");
    }

    #[test]
    fn test_malformed_cookie_is_ignored() {
        let mut jar = CookieJar::default();
        jar.add_set_cookie("no-equals-sign");
        jar.add_set_cookie("=value");
        assert!(jar.is_empty());
        assert!(jar.auth_headers().is_empty());
    }

    #[test]
    fn test_auth_headers_carry_xsrf() {
        let mut jar = CookieJar::default();
        jar.add_set_cookie("_xsrf=abc");
        jar.add_set_cookie("username-host=xyz");

        let headers = jar.auth_headers();
        assert_eq!(headers["X-XSRFToken"], "abc");
        assert_eq!(headers["Cookie"], "_xsrf=abc; username-host=xyz");
    }

    #[test]
    fn test_login_success_needs_redirect_and_session_cookie() {
        let mut jar = CookieJar::default();
        jar.add_set_cookie("_xsrf=abc");
        assert!(!login_succeeded(StatusCode::FOUND, &jar));

        jar.add_set_cookie("username-host=xyz");
        assert!(login_succeeded(StatusCode::FOUND, &jar));
        assert!(!login_succeeded(StatusCode::OK, &jar));
    }
}
