/*
   Waterscope meter reader for Azure B2C fronted portals
   Copyright (C) David Mulder <dmulder@samba.org> 2024

   This program is free software; you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation; either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/
use crate::constants::{
    B2C_POLICY, B2C_TENANT, BROWSER_ACCEPT, BROWSER_ACCEPT_LANGUAGE, BROWSER_USER_AGENT,
    DEFAULT_PORTAL_URL, DEFAULT_PROVIDER_URL, MAX_REDIRECTS, PORTAL_DASHBOARD_PATH,
    PORTAL_LOGIN_PATH,
};
use crate::error::WaterscopeError;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method, StatusCode};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::{form_urlencoded, Url};
use zeroize::Zeroizing;

/// Only the first three characters of a username are ever logged.
pub fn mask_username(username: &str) -> String {
    let prefix: String = username.chars().take(3).collect();
    format!("{}***", prefix)
}

/// A username/password pair supplied by the caller for a single cycle.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Credentials {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        self.password.as_str()
    }

    pub fn masked_username(&self) -> String {
        mask_username(&self.username)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.masked_username())
            .finish_non_exhaustive()
    }
}

/// Every URL the flow touches, derived from the portal and identity
/// provider base URLs.
#[derive(Debug, Clone)]
pub struct Endpoints {
    portal: Url,
    provider: Url,
    login: Url,
    dashboard: Url,
    self_asserted: Url,
    confirmed: Url,
}

fn as_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl Endpoints {
    pub fn new(portal: &str, provider: &str) -> Result<Self, url::ParseError> {
        let portal = as_base(Url::parse(portal)?);
        let provider = as_base(Url::parse(provider)?);
        let policy_base = provider.join(&format!("{}/{}/", B2C_TENANT, B2C_POLICY))?;
        Ok(Endpoints {
            login: portal.join(PORTAL_LOGIN_PATH)?,
            dashboard: portal.join(PORTAL_DASHBOARD_PATH)?,
            self_asserted: policy_base.join("SelfAsserted")?,
            confirmed: policy_base.join("api/CombinedSigninAndSignup/confirmed")?,
            portal,
            provider,
        })
    }

    /// The live portal and its B2C tenant.
    pub fn production() -> Result<Self, url::ParseError> {
        Endpoints::new(DEFAULT_PORTAL_URL, DEFAULT_PROVIDER_URL)
    }

    pub fn portal_root(&self) -> &Url {
        &self.portal
    }

    pub fn provider_root(&self) -> &Url {
        &self.provider
    }

    pub fn login(&self) -> &Url {
        &self.login
    }

    pub fn dashboard(&self) -> &Url {
        &self.dashboard
    }

    pub fn self_asserted(&self) -> &Url {
        &self.self_asserted
    }

    pub fn confirmed(&self) -> &Url {
        &self.confirmed
    }

    /// The `Origin` header value for requests made from provider pages.
    pub fn provider_origin(&self) -> String {
        self.provider.origin().ascii_serialization()
    }

    pub fn portal_origin(&self) -> String {
        self.portal.origin().ascii_serialization()
    }

    /// True when `url` lives on the identity provider's login domain.
    pub fn is_provider_url(&self, url: &Url) -> bool {
        url.host_str() == self.provider.host_str()
            && url.port_or_known_default() == self.provider.port_or_known_default()
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(header::ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static(BROWSER_ACCEPT_LANGUAGE),
    );
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(
        header::UPGRADE_INSECURE_REQUESTS,
        HeaderValue::from_static("1"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers
}

/// Headers a step sets for the host it talks to. They must not follow a
/// redirect onto another origin.
fn strip_origin_bound(headers: &mut HeaderMap) {
    headers.remove(header::ORIGIN);
    headers.remove(header::REFERER);
    headers.remove("x-csrf-token");
    headers.remove("x-requested-with");
}

/// A single outgoing request. Query pairs and form fields keep the order
/// they were added in, the provider is picky about both. The form body is
/// encoded up front and wiped on drop since it may carry the password.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    query: Vec<(String, String)>,
    form: Option<Zeroizing<String>>,
    headers: HeaderMap,
    follow_redirects: bool,
}

impl Request {
    pub fn get(url: &Url) -> Self {
        Request {
            method: Method::GET,
            url: url.clone(),
            query: vec![],
            form: None,
            headers: HeaderMap::new(),
            follow_redirects: true,
        }
    }

    pub fn post(url: &Url) -> Self {
        Request {
            method: Method::POST,
            ..Request::get(url)
        }
    }

    pub fn query(mut self, pairs: &[(&str, &str)]) -> Self {
        self.query.extend(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        self
    }

    pub fn form<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut body = Zeroizing::new(String::with_capacity(1024));
        {
            let mut serializer = form_urlencoded::Serializer::new(&mut *body);
            for (key, value) in fields {
                serializer.append_pair(key.as_ref(), value.as_ref());
            }
        }
        self.form = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => debug!("Dropping unrepresentable value for header {}", name),
        }
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.url.path())
            .field("form_bytes", &self.form.as_ref().map(|b| b.len()))
            .field("follow_redirects", &self.follow_redirects)
            .finish_non_exhaustive()
    }
}

/// The response of a request after any redirects were followed.
#[derive(Debug, Clone)]
pub struct Page {
    pub status: StatusCode,
    /// The URL the request finally landed on.
    pub url: Url,
    pub location: Option<String>,
    pub body: String,
}

/// Cookie-bearing request context for exactly one authentication cycle.
///
/// The portal and the identity provider coordinate purely through cookies
/// on both domains, so every request of a cycle must go through the same
/// `Session`. A `Session` is never shared between cycles or accounts; drop
/// it when the cycle ends.
pub struct Session {
    client: Client,
    jar: Arc<CookieStoreMutex>,
    last_url: Option<Url>,
}

impl Session {
    pub fn new(timeout: Duration) -> Result<Self, WaterscopeError> {
        let jar = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = Client::builder()
            .default_headers(browser_headers())
            .cookie_provider(Arc::clone(&jar))
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .http1_only()
            .build()
            .map_err(|e| WaterscopeError::transport("session setup", e))?;
        Ok(Session {
            client,
            jar,
            last_url: None,
        })
    }

    /// The URL the previous request landed on.
    pub fn last_url(&self) -> Option<&Url> {
        self.last_url.as_ref()
    }

    /// Issue `request`, following redirects manually when asked to so that
    /// cookies from every hop land in the jar and the final URL is known.
    pub async fn send(&mut self, step: &str, request: Request) -> Result<Page, WaterscopeError> {
        let Request {
            mut method,
            mut url,
            query,
            mut form,
            mut headers,
            follow_redirects,
        } = request;

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        if !headers.contains_key(header::REFERER) {
            if let Some(referer) = self
                .last_url
                .as_ref()
                .and_then(|u| HeaderValue::from_str(u.as_str()).ok())
            {
                headers.insert(header::REFERER, referer);
            }
        }

        let mut hops = 0;
        loop {
            debug!("{}: {} {}", step, method, url.path());
            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            if let Some(body) = &form {
                if !headers.contains_key(header::CONTENT_TYPE) {
                    builder = builder.header(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                }
                builder = builder.body(body.as_bytes().to_vec());
            }
            let resp = builder
                .send()
                .await
                .map_err(|e| WaterscopeError::transport(step, e))?;

            let status = resp.status();
            let location = resp
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());

            if follow_redirects && status.is_redirection() {
                if let Some(next) = location.as_deref().and_then(|l| url.join(l).ok()) {
                    hops += 1;
                    if hops > MAX_REDIRECTS {
                        return Err(WaterscopeError::Connection(format!(
                            "{}: too many redirects",
                            step
                        )));
                    }
                    if status != StatusCode::TEMPORARY_REDIRECT
                        && status != StatusCode::PERMANENT_REDIRECT
                    {
                        method = Method::GET;
                        form = None;
                        headers.remove(header::CONTENT_TYPE);
                    }
                    if next.origin() != url.origin() {
                        strip_origin_bound(&mut headers);
                    }
                    debug!("{}: {} redirect to {}", step, status, next.path());
                    url = next;
                    continue;
                }
            }

            let body = resp
                .text()
                .await
                .map_err(|e| WaterscopeError::transport(step, e))?;
            debug!("{}: {} ({} bytes)", step, status, body.len());
            self.last_url = Some(url.clone());
            return Ok(Page {
                status,
                url,
                location,
                body,
            });
        }
    }

    /// Snapshot of the unexpired cookies as (name, value) pairs, in jar order.
    pub fn cookies(&self) -> Vec<(String, String)> {
        match self.jar.lock() {
            Ok(store) => store
                .iter_unexpired()
                .map(|c| (c.name().to_string(), c.value().to_string()))
                .collect(),
            Err(_) => {
                error!("Cookie jar lock poisoned");
                vec![]
            }
        }
    }

    pub fn cookie_names(&self) -> Vec<String> {
        self.cookies().into_iter().map(|(name, _)| name).collect()
    }

    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookies().iter().any(|(n, _)| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_mask_username() {
        assert_eq!(mask_username("user@example.com"), "use***");
        assert_eq!(mask_username("ab"), "ab***");
        assert_eq!(mask_username("ñandú@example.com"), "ñan***");
    }

    #[test]
    fn test_credentials_debug_is_masked() {
        let creds = Credentials::new("user@example.com", "pw123");
        let out = format!("{:?}", creds);
        assert!(out.contains("use***"));
        assert!(!out.contains("pw123"));
        assert!(!out.contains("example.com"));
    }

    #[test]
    fn test_production_endpoints() {
        let ep = Endpoints::production().unwrap();
        assert_eq!(ep.login().as_str(), "https://waterscope.us/Home/Main");
        assert_eq!(
            ep.dashboard().as_str(),
            "https://waterscope.us/Consumer/Consumer/Index"
        );
        assert_eq!(
            ep.self_asserted().as_str(),
            "https://metronb2c.b2clogin.com/metronb2c.onmicrosoft.com/B2C_1_mainsso_web/SelfAsserted"
        );
        assert_eq!(
            ep.confirmed().as_str(),
            "https://metronb2c.b2clogin.com/metronb2c.onmicrosoft.com/B2C_1_mainsso_web/api/CombinedSigninAndSignup/confirmed"
        );
        assert_eq!(ep.provider_origin(), "https://metronb2c.b2clogin.com");
    }

    #[test]
    fn test_is_provider_url() {
        let ep = Endpoints::new("http://127.0.0.1:8000", "http://127.0.0.1:9000").unwrap();
        assert!(ep.is_provider_url(&Url::parse("http://127.0.0.1:9000/x?tx=1").unwrap()));
        assert!(!ep.is_provider_url(&Url::parse("http://127.0.0.1:8000/x").unwrap()));
        let prod = Endpoints::production().unwrap();
        assert!(prod.is_provider_url(
            &Url::parse("https://metronb2c.b2clogin.com/metronb2c.onmicrosoft.com/oauth2/v2.0/authorize").unwrap()
        ));
    }

    #[tokio::test]
    async fn test_send_follows_redirects_and_keeps_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "/landed")
                    .insert_header("Set-Cookie", "hop=1; Path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/landed"))
            .and(header_eq("cookie", "hop=1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .mount(&server)
            .await;

        let start = Url::parse(&format!("{}/start", server.uri())).unwrap();
        let mut session = Session::new(Duration::from_secs(5)).unwrap();
        let page = session
            .send(
                "test",
                Request::post(&start).form(vec![("a".to_string(), "b".to_string())]),
            )
            .await
            .unwrap();
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.url.path(), "/landed");
        assert_eq!(page.body, "done");
        assert!(session.has_cookie("hop"));
        assert_eq!(session.last_url().map(|u| u.path()), Some("/landed"));
    }

    #[tokio::test]
    async fn test_send_without_redirects_exposes_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/elsewhere"))
            .mount(&server)
            .await;

        let start = Url::parse(&format!("{}/start", server.uri())).unwrap();
        let mut session = Session::new(Duration::from_secs(5)).unwrap();
        let page = session
            .send("test", Request::get(&start).follow_redirects(false))
            .await
            .unwrap();
        assert_eq!(page.status, StatusCode::FOUND);
        assert_eq!(page.location.as_deref(), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn test_send_sets_referer_from_last_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/first"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/second"))
            .and(header_eq("referer", format!("{}/first", server.uri()).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut session = Session::new(Duration::from_secs(5)).unwrap();
        let first = Url::parse(&format!("{}/first", server.uri())).unwrap();
        let second = Url::parse(&format!("{}/second", server.uri())).unwrap();
        session.send("test", Request::get(&first)).await.unwrap();
        let page = session.send("test", Request::get(&second)).await.unwrap();
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.body, "ok");
    }

    #[tokio::test]
    async fn test_cross_origin_redirect_drops_step_headers() {
        let portal = MockServer::start().await;
        let other = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/same"),
            )
            .mount(&portal)
            .await;
        Mock::given(method("GET"))
            .and(path("/same"))
            .and(header_eq("x-csrf-token", "secret-csrf"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/away", other.uri()).as_str()),
            )
            .mount(&portal)
            .await;
        Mock::given(method("GET"))
            .and(path("/away"))
            .respond_with(ResponseTemplate::new(200).set_body_string("away"))
            .mount(&other)
            .await;

        let start = Url::parse(&format!("{}/start", portal.uri())).unwrap();
        let mut session = Session::new(Duration::from_secs(5)).unwrap();
        let request = Request::get(&start)
            .header(HeaderName::from_static("x-csrf-token"), "secret-csrf")
            .header(HeaderName::from_static("x-requested-with"), "XMLHttpRequest")
            .header(header::ORIGIN, &portal.uri());
        let page = session.send("test", request).await.unwrap();
        assert_eq!(page.body, "away");

        let received = other.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let headers = &received[0].headers;
        assert!(!headers.contains_key("x-csrf-token"));
        assert!(!headers.contains_key("x-requested-with"));
        assert!(!headers.contains_key("origin"));
        assert!(!headers.contains_key("referer"));
    }

    #[test]
    fn test_request_debug_hides_form() {
        let url = Url::parse("http://127.0.0.1:9000/SelfAsserted").unwrap();
        let request = Request::post(&url).form([("email", "a b@x"), ("password", "pw123")]);
        assert_eq!(
            request.form.as_deref().map(|b| b.as_str()),
            Some("email=a+b%40x&password=pw123")
        );
        let out = format!("{:?}", request);
        assert!(!out.contains("pw123"));
        assert!(out.contains("SelfAsserted"));
    }
}
