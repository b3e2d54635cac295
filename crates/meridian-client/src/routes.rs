//! Route catalogue
//!
//! A [`Route`] pairs an HTTP method with a service base and a path
//! template. Parameters are substituted with percent-encoding, but the
//! endpoint's identity keeps the unsubstituted template: rate limits on
//! parameterized routes apply to the route, not to one parameter value,
//! so throttle windows must be shared across substitutions.

use std::fmt;

use reqwest::Method;

/// The Meridian service family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Account service: profiles, tokens, device credentials.
    Account,
    /// Web portal (interactive login).
    Portal,
    /// Batch query gateway.
    Gateway,
    /// Friends/social graph.
    Social,
    /// Presence fan-out.
    Presence,
    /// Storefront and content.
    Catalog,
}

impl Service {
    pub fn base(&self) -> &'static str {
        match self {
            Service::Account => "https://account.public.meridianhq.com",
            Service::Portal => "https://www.meridianhq.com",
            Service::Gateway => "https://gateway.meridianhq.com/query",
            Service::Social => "https://social.public.meridianhq.com",
            Service::Presence => "https://presence.public.meridianhq.com",
            Service::Catalog => "https://catalog.public.meridianhq.com",
        }
    }

    fn default_auth(&self) -> Option<AuthSlot> {
        match self {
            Service::Portal => None,
            _ => Some(AuthSlot::SessionBearer),
        }
    }
}

/// Named credential placeholders for the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSlot {
    /// Client basic token of the exchange tier.
    ExchangeBasic,
    /// Client basic token of the session tier.
    SessionBasic,
    /// Live exchange-tier bearer token.
    ExchangeBearer,
    /// Live session-tier bearer token.
    SessionBearer,
}

/// Identity of an endpoint for throttle coalescing: method plus the
/// unsubstituted URL template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub method: Method,
    pub identity: String,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.identity)
    }
}

/// A concrete request target.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    base: String,
    template: String,
    url: String,
    pub auth: Option<AuthSlot>,
}

impl Route {
    /// Route on a first-party service, with that service's default
    /// authorization.
    pub fn service(method: Method, service: Service, template: &str) -> Self {
        Self::custom(method, service.base(), template).with_auth(service.default_auth())
    }

    /// Route on an arbitrary base URL, unauthorized by default.
    pub fn custom(method: Method, base: &str, template: &str) -> Self {
        let base = base.trim_end_matches('/').to_owned();
        let url = format!("{base}{template}");
        Self {
            method,
            base,
            template: template.to_owned(),
            url,
            auth: None,
        }
    }

    /// Override the authorization slot.
    pub fn auth(self, slot: AuthSlot) -> Self {
        self.with_auth(Some(slot))
    }

    fn with_auth(mut self, auth: Option<AuthSlot>) -> Self {
        self.auth = auth;
        self
    }

    /// Substitute a `{name}` template parameter. String values are
    /// percent-encoded (including `/`) so the substituted URL stays
    /// unambiguous.
    pub fn param(mut self, name: &str, value: impl fmt::Display) -> Self {
        let needle = format!("{{{name}}}");
        self.url = self.url.replace(&needle, &quote(&value.to_string()));
        self
    }

    /// The fully substituted URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The throttle identity: method + unsubstituted template.
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            method: self.method.clone(),
            identity: format!("{}{}", self.base, self.template),
        }
    }
}

/// Percent-encode everything outside the URL-unreserved set, `/`
/// included.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_substitutes_and_encodes() {
        let route = Route::service(
            Method::GET,
            Service::Social,
            "/social/api/public/friends/{subject}",
        )
        .param("subject", "user with/slash");
        assert_eq!(
            route.url(),
            "https://social.public.meridianhq.com/social/api/public/friends/user%20with%2Fslash"
        );
    }

    #[test]
    fn key_uses_unsubstituted_template() {
        let first = Route::service(Method::GET, Service::Catalog, "/catalog/api/items/{item}")
            .param("item", "item-1");
        let second = Route::service(Method::GET, Service::Catalog, "/catalog/api/items/{item}")
            .param("item", "item-2");
        assert_eq!(
            first.key(),
            second.key(),
            "rate limits on parameterized routes are shared across values"
        );
        assert_ne!(first.url(), second.url());
    }

    #[test]
    fn key_distinguishes_methods() {
        let get = Route::service(Method::GET, Service::Social, "/social/api/requests");
        let post = Route::service(Method::POST, Service::Social, "/social/api/requests");
        assert_ne!(get.key(), post.key());
    }

    #[test]
    fn default_auth_follows_service() {
        let social = Route::service(Method::GET, Service::Social, "/x");
        assert_eq!(social.auth, Some(AuthSlot::SessionBearer));

        let portal = Route::service(Method::GET, Service::Portal, "/x");
        assert_eq!(portal.auth, None);

        let overridden = Route::service(Method::GET, Service::Account, "/x")
            .auth(AuthSlot::ExchangeBearer);
        assert_eq!(overridden.auth, Some(AuthSlot::ExchangeBearer));
    }

    #[test]
    fn custom_route_trims_trailing_slash() {
        let route = Route::custom(Method::POST, "http://127.0.0.1:9999/", "/query");
        assert_eq!(route.url(), "http://127.0.0.1:9999/query");
        assert_eq!(route.auth, None);
    }

    #[test]
    fn quote_leaves_unreserved_untouched() {
        assert_eq!(quote("abc-DEF_123.~"), "abc-DEF_123.~");
        assert_eq!(quote("a b"), "a%20b");
        assert_eq!(quote("a/b"), "a%2Fb");
    }
}
