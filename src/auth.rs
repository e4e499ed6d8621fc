//! Auth handoff
//!
//! The sign-in/out/callback paths belong to an external auth gateway; the
//! router only hands them over. The OAuth protocol itself is out of scope.

use crate::error::{redirect_response, RouterBody};
use crate::user::USER_COOKIE;
use hyper::header::HeaderValue;
use hyper::Response;
use tracing::debug;

/// Handles the auth-flow paths given the normalized path and raw query
pub trait AuthFlow: Send + Sync {
    fn handle(&self, path: &str, query: &str) -> Response<RouterBody>;
}

/// Default flow: bounce sign-in and the OAuth callback to the configured
/// gateway, and clear the identity cookie on sign-out.
pub struct GatewayAuthFlow {
    gateway_url: String,
}

impl GatewayAuthFlow {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        let mut gateway_url = gateway_url.into();
        while gateway_url.ends_with('/') {
            gateway_url.pop();
        }
        Self { gateway_url }
    }
}

impl AuthFlow for GatewayAuthFlow {
    fn handle(&self, path: &str, query: &str) -> Response<RouterBody> {
        if path.starts_with("/signout") {
            debug!("Signing out; clearing identity cookie");
            let mut resp = redirect_response("/");
            resp.headers_mut().insert(
                hyper::header::SET_COOKIE,
                HeaderValue::from_str(&format!("{USER_COOKIE}=; Path=/; Max-Age=0"))
                    .expect("static cookie value"),
            );
            return resp;
        }

        let location = if query.is_empty() {
            format!("{}{}", self.gateway_url, path)
        } else {
            format!("{}{}?{}", self.gateway_url, path, query)
        };
        debug!(path, location = %location, "Handing off to auth gateway");
        redirect_response(&location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_signin_redirects_to_gateway() {
        let flow = GatewayAuthFlow::new("https://auth.example.com/");
        let resp = flow.handle("/signin", "next=%2Ftree");
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(hyper::header::LOCATION).unwrap(),
            "https://auth.example.com/signin?next=%2Ftree"
        );
    }

    #[test]
    fn test_oauthcallback_preserves_path() {
        let flow = GatewayAuthFlow::new("https://auth.example.com");
        let resp = flow.handle("/oauthcallback", "code=abc&state=xyz");
        assert_eq!(
            resp.headers().get(hyper::header::LOCATION).unwrap(),
            "https://auth.example.com/oauthcallback?code=abc&state=xyz"
        );
    }

    #[test]
    fn test_signout_clears_cookie() {
        let flow = GatewayAuthFlow::new("https://auth.example.com");
        let resp = flow.handle("/signout", "");
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get(hyper::header::LOCATION).unwrap(), "/");
        let cookie = resp.headers().get(hyper::header::SET_COOKIE).unwrap();
        assert!(cookie.to_str().unwrap().contains("Max-Age=0"));
    }
}
