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
//! Stateless lookups over provider responses. Every routine returns `None`
//! rather than failing, the caller decides which absence is fatal.
use crate::constants::{
    B2C_CLIENT_ID, B2C_POLICY, B2C_REDIRECT_URI, B2C_RESPONSE_MODE, B2C_RESPONSE_TYPE, B2C_SCOPE,
    CSRF_COOKIE_PREFIX,
};
use crate::session::Endpoints;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

/// The hidden form the provider hands back after confirmation, in document
/// order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoSubmitForm {
    pub action: Option<String>,
    pub fields: Vec<(String, String)>,
}

impl AutoSubmitForm {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn selector(css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Invalid selector {}: {:?}", css, e);
            None
        }
    }
}

fn capture(pattern: &str, haystack: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// The value of the first unexpired `x-ms-cpim-csrf*` cookie.
pub fn extract_csrf(cookies: &[(String, String)]) -> Option<String> {
    cookies
        .iter()
        .find(|(name, value)| name.starts_with(CSRF_COOKIE_PREFIX) && !value.is_empty())
        .map(|(_, value)| value.clone())
}

/// Find the transaction state of the provider interaction. Tried in order:
/// the `tx` query parameter, the `state` query parameter, a `tx=` fragment in
/// the body, a `StateProperties=` fragment in the body, and finally a hidden
/// `tx` input.
pub fn extract_transaction_state(url: &Url, body: &str) -> Option<String> {
    let query_param = |key: &str| {
        url.query_pairs()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    };

    query_param("tx")
        .or_else(|| query_param("state"))
        .or_else(|| capture(r#"tx=([^&\s"']+)"#, body))
        .or_else(|| capture(r#"StateProperties=([^&\s"']+)"#, body))
        .or_else(|| {
            let doc = Html::parse_document(body);
            let sel = selector("input[name=\"tx\"]")?;
            doc.select(&sel)
                .next()
                .and_then(|e| e.value().attr("value"))
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        })
}

/// Collect the named, non-empty inputs of the first form matching `css`.
/// A form without any such input counts as absent.
pub fn extract_form(html: &str, css: &str) -> Option<AutoSubmitForm> {
    let doc = Html::parse_document(html);
    let form_sel = selector(css)?;
    let input_sel = selector("input")?;
    let form = doc.select(&form_sel).next()?;

    let fields: Vec<(String, String)> = form
        .select(&input_sel)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value")?;
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect();

    if fields.is_empty() {
        return None;
    }
    Some(AutoSubmitForm {
        action: form.value().attr("action").map(|a| a.to_string()),
        fields,
    })
}

/// The OAuth artifact form from a confirmation response: the first form on
/// the page.
pub fn extract_autosubmit_form(html: &str) -> Option<AutoSubmitForm> {
    extract_form(html, "form")
}

fn meta_refresh_target(doc: &Html) -> Option<String> {
    let sel = selector("meta[http-equiv]")?;
    doc.select(&sel)
        .filter(|m| {
            m.value()
                .attr("http-equiv")
                .map(|v| v.eq_ignore_ascii_case("refresh"))
                .unwrap_or(false)
        })
        .filter_map(|m| m.value().attr("content"))
        .find_map(|content| capture(r"(?i)url\s*=\s*(.+)", content))
        .map(|target| target.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|target| !target.is_empty())
}

/// Locate the identity provider URL in the portal's answer to the username
/// post. Tried in order: a `Location` header on the provider's domain, a
/// meta refresh, a form posting to the provider, then any absolute provider
/// URL embedded in the markup.
pub fn extract_redirect(
    location: Option<&str>,
    body: &str,
    base: &Url,
    endpoints: &Endpoints,
) -> Option<Url> {
    if let Some(target) = location.and_then(|l| base.join(l).ok()) {
        if endpoints.is_provider_url(&target) {
            return Some(target);
        }
        debug!("Ignoring redirect off the provider domain: {}", target.path());
    }

    let doc = Html::parse_document(body);
    if let Some(target) = meta_refresh_target(&doc).and_then(|t| base.join(&t).ok()) {
        return Some(target);
    }

    if let Some(form_sel) = selector("form[action]") {
        let action = doc
            .select(&form_sel)
            .filter_map(|f| f.value().attr("action"))
            .filter_map(|a| base.join(a).ok())
            .find(|u| endpoints.is_provider_url(u));
        if action.is_some() {
            return action;
        }
    }

    let re = Regex::new(r#"https?://[^\s"'<>]+"#).ok()?;
    let embedded = re
        .find_iter(body)
        .filter_map(|m| Url::parse(&m.as_str().replace("&amp;", "&")).ok())
        .find(|u| endpoints.is_provider_url(u));
    embedded
}

/// Scope and response type are space separated lists whose order the
/// provider does not care about.
fn same_param(key: &str, found: &str, expected: &str) -> bool {
    match key {
        "scope" | "response_type" => {
            let mut a: Vec<String> = found.split_whitespace().map(str::to_lowercase).collect();
            let mut b: Vec<String> = expected
                .split_whitespace()
                .map(str::to_lowercase)
                .collect();
            a.sort();
            b.sort();
            a == b
        }
        _ => found.eq_ignore_ascii_case(expected),
    }
}

/// Compare the parameters of a discovered authorize URL with the tenant
/// configuration. Mismatches are only logged, the provider has the final say.
pub fn check_authorize_params(url: &Url) -> bool {
    let mut consistent = true;
    for (key, expected) in [
        ("client_id", B2C_CLIENT_ID),
        ("p", B2C_POLICY),
        ("redirect_uri", B2C_REDIRECT_URI),
        ("scope", B2C_SCOPE),
        ("response_type", B2C_RESPONSE_TYPE),
        ("response_mode", B2C_RESPONSE_MODE),
    ] {
        let found = url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned());
        match found {
            Some(v) if same_param(key, &v, expected) => {}
            Some(v) => {
                debug!("Authorize URL {} is {}, expected {}", key, v, expected);
                consistent = false;
            }
            None => debug!("Authorize URL carries no {}", key),
        }
    }
    consistent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints::new("http://127.0.0.1:8000/", "http://127.0.0.1:9000/").unwrap()
    }

    fn cookie(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn test_extract_csrf() {
        let jar = vec![
            cookie("x-ms-cpim-trans", "t"),
            cookie("x-ms-cpim-csrf", "token-1"),
            cookie(".ASPXAUTH", "a"),
        ];
        assert_eq!(extract_csrf(&jar).as_deref(), Some("token-1"));
        assert_eq!(extract_csrf(&[cookie("x-ms-cpim-trans", "t")]), None);
        assert_eq!(extract_csrf(&[cookie("x-ms-cpim-csrf", "")]), None);
    }

    #[test]
    fn test_transaction_state_order() {
        let url = Url::parse("https://p/authorize?state=S1&tx=T1").unwrap();
        assert_eq!(
            extract_transaction_state(&url, "tx=BODY").as_deref(),
            Some("T1")
        );

        let url = Url::parse("https://p/authorize?state=S1").unwrap();
        assert_eq!(
            extract_transaction_state(&url, "tx=BODY").as_deref(),
            Some("S1")
        );

        let url = Url::parse("https://p/authorize").unwrap();
        let body = r#"<script>var SETTINGS = {"remoteResource":"x?tx=StateProperties=eyJU&p=B2C"};</script>"#;
        assert_eq!(
            extract_transaction_state(&url, body).as_deref(),
            Some("StateProperties=eyJU")
        );

        let body = r#"<script>var SETTINGS = {"transId":"StateProperties=eyJV","pageViewId":"1"};</script>"#;
        assert_eq!(
            extract_transaction_state(&url, body).as_deref(),
            Some("eyJV")
        );

        let body = r#"<form><input type="hidden" name="tx" value="HIDDEN"></form>"#;
        assert_eq!(
            extract_transaction_state(&url, body).as_deref(),
            Some("HIDDEN")
        );

        assert_eq!(extract_transaction_state(&url, "<html></html>"), None);
    }

    #[test]
    fn test_autosubmit_form() {
        let html = r#"<html><body onload="document.forms[0].submit()">
            <form method="post" action="https://waterscope.us/">
              <input type="hidden" name="state" value="S" />
              <input type="hidden" name="code" value="C&amp;D" />
              <input type="hidden" name="id_token" value="abc123" />
              <input type="hidden" name="empty" value="" />
              <input type="submit" value="Go" />
            </form>
            <form><input name="other" value="x"></form>
            </body></html>"#;
        let form = extract_autosubmit_form(html).unwrap();
        assert_eq!(form.action.as_deref(), Some("https://waterscope.us/"));
        assert_eq!(
            form.fields,
            vec![
                ("state".to_string(), "S".to_string()),
                ("code".to_string(), "C&D".to_string()),
                ("id_token".to_string(), "abc123".to_string()),
            ]
        );
        assert_eq!(form.get("id_token"), Some("abc123"));
    }

    #[test]
    fn test_autosubmit_form_empty_is_absent() {
        assert_eq!(extract_autosubmit_form("<div>Your password is incorrect</div>"), None);
        assert_eq!(
            extract_autosubmit_form(r#"<form><input name="a" value=""><input value="b"></form>"#),
            None
        );
    }

    #[test]
    fn test_redirect_from_location() {
        let ep = endpoints();
        let base = Url::parse("http://127.0.0.1:8000/Home/Main").unwrap();
        let target = extract_redirect(
            Some("http://127.0.0.1:9000/authorize?p=B2C_1_mainsso_web"),
            "",
            &base,
            &ep,
        )
        .unwrap();
        assert_eq!(target.path(), "/authorize");

        // Off-domain Location falls through to the body.
        assert_eq!(extract_redirect(Some("/Home/Error"), "", &base, &ep), None);
    }

    #[test]
    fn test_redirect_from_meta_refresh() {
        let ep = endpoints();
        let base = Url::parse("http://127.0.0.1:8000/Home/Main").unwrap();
        let body = r#"<html><head><meta http-equiv="Refresh" content="0; URL='http://127.0.0.1:9000/authorize?tx=1'"></head></html>"#;
        let target = extract_redirect(None, body, &base, &ep).unwrap();
        assert_eq!(target.as_str(), "http://127.0.0.1:9000/authorize?tx=1");
    }

    #[test]
    fn test_redirect_from_form_and_body() {
        let ep = endpoints();
        let base = Url::parse("http://127.0.0.1:8000/Home/Main").unwrap();
        let body = r#"<form action="/local"></form><form action="http://127.0.0.1:9000/go"></form>"#;
        assert_eq!(
            extract_redirect(None, body, &base, &ep).map(|u| u.path().to_string()),
            Some("/go".to_string())
        );

        let body = r#"<script>window.location = "http://127.0.0.1:9000/authorize?a=1&amp;b=2";</script>"#;
        let target = extract_redirect(None, body, &base, &ep).unwrap();
        assert_eq!(target.query(), Some("a=1&b=2"));

        assert_eq!(
            extract_redirect(None, "<p>User not found</p>", &base, &ep),
            None
        );
    }

    #[test]
    fn test_redirect_skips_foreign_urls_in_body() {
        let ep = endpoints();
        let base = Url::parse("http://127.0.0.1:8000/Home/Main").unwrap();
        let body = r#"<a href="https://cdn.example.com/app.js">x</a>
            <script>var next = 'http://127.0.0.1:9000/authorize?client_id=c&amp;tx=T1';</script>"#;
        let target = extract_redirect(None, body, &base, &ep).unwrap();
        assert_eq!(target.path(), "/authorize");
        assert_eq!(target.query(), Some("client_id=c&tx=T1"));
    }

    #[test]
    fn test_check_authorize_params() {
        let mut good = Url::parse("https://p/authorize").unwrap();
        good.query_pairs_mut()
            .append_pair("client_id", B2C_CLIENT_ID)
            .append_pair("p", B2C_POLICY)
            .append_pair("redirect_uri", B2C_REDIRECT_URI)
            .append_pair("scope", B2C_SCOPE)
            .append_pair("response_type", "id_token code")
            .append_pair("response_mode", B2C_RESPONSE_MODE);
        assert!(check_authorize_params(&good));

        let bad = Url::parse("https://p/authorize?client_id=other&p=B2C_1_other").unwrap();
        assert!(!check_authorize_params(&bad));

        let mut wrong_redirect = Url::parse("https://p/authorize").unwrap();
        wrong_redirect
            .query_pairs_mut()
            .append_pair("client_id", B2C_CLIENT_ID)
            .append_pair("redirect_uri", "https://elsewhere.example.com/")
            .append_pair("response_mode", "query");
        assert!(!check_authorize_params(&wrong_redirect));

        assert!(check_authorize_params(&Url::parse("https://p/authorize").unwrap()));
    }
}
