//! Ordered path classification for the request dispatcher
//!
//! Every request path maps to exactly one [`RouteCategory`]. The rules are a
//! declarative table scanned top to bottom; first match wins, and the order
//! is load-bearing: the EULA acceptance path, auth handoff and static assets
//! are matched before the EULA gate short-circuits everything else.

/// Prefix for requests carrying an explicit backend port, e.g.
/// `/_proxy/8081/some/path`.
pub const EXPLICIT_PROXY_PREFIX: &str = "/_proxy/";

/// Path prefixes proxied to the per-user backend once it is ready
pub const BACKEND_PREFIXES: &[&str] = &[
    "/api",
    "/tree",
    "/notebooks",
    "/nbconvert",
    "/nbextensions",
    "/files",
    "/edit",
    "/sessions",
];

/// What the dispatcher should do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteCategory {
    /// `/accepted_eula` - record acceptance, redirect to the referer
    EulaAccept,
    /// Sign-in/out/callback paths handed to the auth gateway
    Auth,
    /// `/static` and `/custom` assets, served even pre-EULA
    Static,
    /// EULA marker absent - serve the EULA page instead of the request
    EulaPage,
    /// `/` - redirect to the recorded startup path
    Root,
    /// Path encodes a backend port; forward raw to that port
    ExplicitProxyPort(u16),
    /// `/_nocachecontent/` - local or proxied per runtime switch
    NoCacheContent,
    /// Proxied to the per-user backend; `tree` marks `/tree` navigation
    BackendProxied { tree: bool },
    /// `/_info` diagnostics
    Info,
    /// `/_restart` - respond then terminate the process
    Restart,
    /// `/_setting` read/write
    Setting,
    /// Anything else: 404, empty body
    NotFound,
}

enum RuleTarget {
    EulaAccept,
    Auth,
    Static,
    Root,
    ExplicitProxy,
    NoCacheContent,
    Backend { tree: bool },
    Info,
    Restart,
    Setting,
}

struct RouteRule {
    prefix: &'static str,
    /// Match the whole path rather than a prefix
    exact: bool,
    /// Matched even while the EULA marker is absent
    pre_eula: bool,
    target: RuleTarget,
}

const fn prefix_rule(prefix: &'static str, target: RuleTarget) -> RouteRule {
    RouteRule {
        prefix,
        exact: false,
        pre_eula: false,
        target,
    }
}

const fn pre_eula_rule(prefix: &'static str, target: RuleTarget) -> RouteRule {
    RouteRule {
        prefix,
        exact: false,
        pre_eula: true,
        target,
    }
}

/// The dispatch table. Order is the contract.
const RULES: &[RouteRule] = &[
    pre_eula_rule("/accepted_eula", RuleTarget::EulaAccept),
    pre_eula_rule("/signin", RuleTarget::Auth),
    pre_eula_rule("/signout", RuleTarget::Auth),
    pre_eula_rule("/oauthcallback", RuleTarget::Auth),
    pre_eula_rule("/static", RuleTarget::Static),
    pre_eula_rule("/custom", RuleTarget::Static),
    // Everything below is gated on EULA acceptance.
    RouteRule {
        prefix: "/",
        exact: true,
        pre_eula: false,
        target: RuleTarget::Root,
    },
    prefix_rule(EXPLICIT_PROXY_PREFIX, RuleTarget::ExplicitProxy),
    prefix_rule("/_nocachecontent/", RuleTarget::NoCacheContent),
    prefix_rule("/api", RuleTarget::Backend { tree: false }),
    prefix_rule("/tree", RuleTarget::Backend { tree: true }),
    prefix_rule("/notebooks", RuleTarget::Backend { tree: false }),
    prefix_rule("/nbconvert", RuleTarget::Backend { tree: false }),
    prefix_rule("/nbextensions", RuleTarget::Backend { tree: false }),
    prefix_rule("/files", RuleTarget::Backend { tree: false }),
    prefix_rule("/edit", RuleTarget::Backend { tree: false }),
    prefix_rule("/sessions", RuleTarget::Backend { tree: false }),
    prefix_rule("/_info", RuleTarget::Info),
    prefix_rule("/_restart", RuleTarget::Restart),
    prefix_rule("/_setting", RuleTarget::Setting),
];

impl RouteRule {
    fn matches(&self, path: &str) -> bool {
        if self.exact {
            path == self.prefix
        } else {
            path.starts_with(self.prefix)
        }
    }
}

/// Extract the backend port from an explicit-proxy path.
/// Returns `None` when the segment after the prefix is not a non-zero port.
pub fn explicit_proxy_port(path: &str) -> Option<u16> {
    let rest = path.strip_prefix(EXPLICIT_PROXY_PREFIX)?;
    let segment = rest.split('/').next()?;
    match segment.parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        _ => None,
    }
}

/// Classify a normalized path (query already stripped) into exactly one
/// category, honoring the table order and the EULA gate.
pub fn classify(path: &str, eula_accepted: bool) -> RouteCategory {
    for rule in RULES {
        if !eula_accepted && !rule.pre_eula {
            // Gate: none of the remaining rules apply until acceptance.
            return RouteCategory::EulaPage;
        }
        if !rule.matches(path) {
            continue;
        }
        match rule.target {
            RuleTarget::EulaAccept => return RouteCategory::EulaAccept,
            RuleTarget::Auth => return RouteCategory::Auth,
            RuleTarget::Static => return RouteCategory::Static,
            RuleTarget::Root => return RouteCategory::Root,
            RuleTarget::ExplicitProxy => match explicit_proxy_port(path) {
                Some(port) => return RouteCategory::ExplicitProxyPort(port),
                // Not a valid port segment; keep scanning.
                None => continue,
            },
            RuleTarget::NoCacheContent => return RouteCategory::NoCacheContent,
            RuleTarget::Backend { tree } => return RouteCategory::BackendProxied { tree },
            RuleTarget::Info => return RouteCategory::Info,
            RuleTarget::Restart => return RouteCategory::Restart,
            RuleTarget::Setting => return RouteCategory::Setting,
        }
    }
    RouteCategory::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eula_accept_matches_regardless_of_state() {
        assert_eq!(classify("/accepted_eula", false), RouteCategory::EulaAccept);
        assert_eq!(classify("/accepted_eula", true), RouteCategory::EulaAccept);
    }

    #[test]
    fn test_auth_paths() {
        for path in ["/signin", "/signout", "/oauthcallback"] {
            assert_eq!(classify(path, false), RouteCategory::Auth);
            assert_eq!(classify(path, true), RouteCategory::Auth);
        }
    }

    #[test]
    fn test_static_served_pre_eula() {
        assert_eq!(classify("/static/eula.css", false), RouteCategory::Static);
        assert_eq!(classify("/custom/theme.js", false), RouteCategory::Static);
    }

    #[test]
    fn test_eula_gate_short_circuits_everything_else() {
        for path in ["/", "/tree/x", "/api/y", "/_info", "/_restart", "/nope"] {
            assert_eq!(classify(path, false), RouteCategory::EulaPage, "{path}");
        }
    }

    #[test]
    fn test_root_is_exact() {
        assert_eq!(classify("/", true), RouteCategory::Root);
        assert_eq!(classify("/readme", true), RouteCategory::NotFound);
    }

    #[test]
    fn test_explicit_proxy_port() {
        assert_eq!(
            classify("/_proxy/8081/tree", true),
            RouteCategory::ExplicitProxyPort(8081)
        );
        // No valid port segment falls through to 404.
        assert_eq!(classify("/_proxy/abc/tree", true), RouteCategory::NotFound);
        assert_eq!(classify("/_proxy/0/tree", true), RouteCategory::NotFound);
    }

    #[test]
    fn test_nocache_content() {
        assert_eq!(
            classify("/_nocachecontent/page.html", true),
            RouteCategory::NoCacheContent
        );
    }

    #[test]
    fn test_backend_prefixes() {
        for prefix in BACKEND_PREFIXES {
            let path = format!("{prefix}/something");
            let tree = *prefix == "/tree";
            assert_eq!(
                classify(&path, true),
                RouteCategory::BackendProxied { tree },
                "{path}"
            );
        }
    }

    #[test]
    fn test_tree_flag_only_for_tree() {
        assert_eq!(
            classify("/tree/foo", true),
            RouteCategory::BackendProxied { tree: true }
        );
        assert_eq!(
            classify("/api/sessions", true),
            RouteCategory::BackendProxied { tree: false }
        );
    }

    #[test]
    fn test_local_handlers() {
        assert_eq!(classify("/_info", true), RouteCategory::Info);
        assert_eq!(classify("/_restart", true), RouteCategory::Restart);
        assert_eq!(classify("/_setting", true), RouteCategory::Setting);
    }

    #[test]
    fn test_unmatched_is_not_found() {
        assert_eq!(classify("/unknown", true), RouteCategory::NotFound);
        assert_eq!(classify("/favicon.ico", true), RouteCategory::NotFound);
    }
}
