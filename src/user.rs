//! Identity resolution
//!
//! The router only needs an opaque, session-stable user id to key backend
//! lifecycles and settings. Resolution order: the forwarded-user header set
//! by an upstream authenticating proxy, then the router's own id cookie,
//! then a shared anonymous id for unauthenticated single-user deployments.

use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use uuid::Uuid;

/// Header an upstream proxy uses to assert the signed-in user
pub const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

/// Cookie carrying the router-issued user id
pub const USER_COOKIE: &str = "nbgate-user";

const ANONYMOUS_USER: &str = "anonymous";

/// Resolves a request to an opaque user id, optionally issuing an id cookie
pub trait UserDirectory: Send + Sync {
    /// Opaque user id for this request; stable for the session
    fn user_id(&self, headers: &HeaderMap) -> String;

    /// `Set-Cookie` value to attach when the request carries no id cookie
    fn issue_cookie(&self, headers: &HeaderMap) -> Option<HeaderValue>;
}

/// Default directory: forwarded-user header, then cookie, then anonymous
#[derive(Debug, Default)]
pub struct CookieUserDirectory;

impl CookieUserDirectory {
    fn cookie_user(headers: &HeaderMap) -> Option<String> {
        let cookies = headers.get(COOKIE)?.to_str().ok()?;
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name == USER_COOKIE && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
    }

    fn forwarded_user(headers: &HeaderMap) -> Option<String> {
        headers
            .get(FORWARDED_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

impl UserDirectory for CookieUserDirectory {
    fn user_id(&self, headers: &HeaderMap) -> String {
        Self::forwarded_user(headers)
            .or_else(|| Self::cookie_user(headers))
            .unwrap_or_else(|| ANONYMOUS_USER.to_string())
    }

    fn issue_cookie(&self, headers: &HeaderMap) -> Option<HeaderValue> {
        if Self::cookie_user(headers).is_some() {
            return None;
        }
        let id = Self::forwarded_user(headers).unwrap_or_else(|| Uuid::new_v4().to_string());
        HeaderValue::from_str(&format!("{USER_COOKIE}={id}; Path=/; HttpOnly")).ok()
    }
}
