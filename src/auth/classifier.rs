// Endpoint classification: authentication surface vs protected resources

use reqwest::Url;

use super::types::EndpointKind;

pub const DEFAULT_LOGIN_PATH: &str = "/api/login";
pub const DEFAULT_REFRESH_PATH: &str = "/api/refresh";
pub const DEFAULT_LOGOUT_PATH: &str = "/api/logout";

/// Alternate refresh route some deployments expose
pub const REFRESH_ALIAS_PATH: &str = "/api/auth/refresh";

/// Decides whether a URL belongs to the login/refresh/logout surface.
///
/// Matching is by path only: scheme, host, query and fragment are ignored and a
/// single trailing slash is tolerated.
#[derive(Debug, Clone)]
pub struct EndpointClassifier {
    auth_paths: Vec<String>,
}

impl Default for EndpointClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIN_PATH, DEFAULT_REFRESH_PATH, DEFAULT_LOGOUT_PATH)
    }
}

impl EndpointClassifier {
    pub fn new(login_path: &str, refresh_path: &str, logout_path: &str) -> Self {
        let mut auth_paths: Vec<String> = [login_path, refresh_path, logout_path, REFRESH_ALIAS_PATH]
            .iter()
            .map(|p| normalize(p))
            .collect();
        auth_paths.sort();
        auth_paths.dedup();
        Self { auth_paths }
    }

    pub fn classify(&self, url: &str) -> EndpointKind {
        let path = match Url::parse(url) {
            Ok(parsed) => normalize(parsed.path()),
            Err(_) => normalize(url.split(['?', '#']).next().unwrap_or_default()),
        };

        if self.auth_paths.iter().any(|p| *p == path) {
            EndpointKind::Auth
        } else {
            EndpointKind::Protected
        }
    }

    pub fn is_auth(&self, url: &str) -> bool {
        self.classify(url) == EndpointKind::Auth
    }
}

/// Leading slash, no trailing slash
fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_auth_routes() {
        let classifier = EndpointClassifier::default();
        for url in [
            "http://localhost:8000/api/login",
            "http://localhost:8000/api/refresh",
            "http://localhost:8000/api/auth/refresh",
            "https://mazad.example/api/logout",
            "/api/login",
            "api/refresh",
            "/api/logout/",
            "/api/login?returnUrl=%2Fdashboard",
        ] {
            assert_eq!(classifier.classify(url), EndpointKind::Auth, "{url}");
        }
    }

    #[test]
    fn test_protected_routes() {
        let classifier = EndpointClassifier::default();
        for url in [
            "http://localhost:8000/api/user/profile",
            "http://localhost:8000/api/auctions/12/bids",
            "/api/login-history",
            "/api/refresh/status",
            "/",
            "",
        ] {
            assert_eq!(classifier.classify(url), EndpointKind::Protected, "{url}");
        }
    }

    #[test]
    fn test_host_named_like_auth_route_is_protected() {
        let classifier = EndpointClassifier::default();
        assert!(!classifier.is_auth("http://api-login.example/api/items"));
    }

    #[test]
    fn test_custom_paths() {
        let classifier = EndpointClassifier::new("/v2/session", "/v2/session/renew", "/v2/session/end");
        assert!(classifier.is_auth("http://h/v2/session/renew"));
        assert!(classifier.is_auth("/api/auth/refresh"));
        assert!(!classifier.is_auth("/api/login"));
    }

    proptest! {
        #[test]
        fn prop_query_never_changes_classification(
            segment in "[a-z]{1,12}",
            query in "[a-z0-9=&]{0,20}",
        ) {
            let classifier = EndpointClassifier::default();
            let path = format!("/api/{}", segment);
            let with_query = format!("http://localhost:8000{}?{}", path, query);
            prop_assert_eq!(classifier.classify(&path), classifier.classify(&with_query));
        }
    }
}
