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
    AUTH_COOKIE_NAMES, B2C_PAGE_ID, B2C_POLICY, USERNAME_FIELD, XHR_ACCEPT, XHR_CONTENT_TYPE,
};
use crate::error::{AuthFailure, WaterscopeError};
use crate::extract::{
    check_authorize_params, extract_autosubmit_form, extract_csrf, extract_redirect,
    extract_transaction_state, AutoSubmitForm,
};
use crate::session::{Credentials, Endpoints, Request, Session};
use reqwest::header::{self, HeaderName};
use reqwest::StatusCode;
use std::fmt;
use url::Url;
use uuid::Uuid;
use zeroize::Zeroizing;

/// The states of the sign-in pipeline. Each successful step moves the
/// session one state forward; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    PageLoaded,
    UsernameSubmitted,
    OAuthPageLoaded,
    PasswordSubmitted,
    OAuthConfirmed,
    TokenExchanged,
    Authenticated,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            AuthState::Init => "init",
            AuthState::PageLoaded => "load login page",
            AuthState::UsernameSubmitted => "submit username",
            AuthState::OAuthPageLoaded => "load provider page",
            AuthState::PasswordSubmitted => "submit password",
            AuthState::OAuthConfirmed => "confirm sign-in",
            AuthState::TokenExchanged => "exchange token",
            AuthState::Authenticated => "verify session",
        };
        f.write_str(step)
    }
}

/// How the transaction state is presented to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEncoding {
    Raw,
    StateProperties,
}

impl TxEncoding {
    fn encode(&self, tx: &str) -> String {
        match self {
            TxEncoding::Raw => tx.to_string(),
            TxEncoding::StateProperties => format!("StateProperties={}", tx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Email,
    SignInName,
}

/// One request shape for the SelfAsserted password post.
#[derive(Debug, Clone, Copy)]
pub struct PasswordVariant {
    pub name: &'static str,
    pub tx: TxEncoding,
    pub field: CredentialField,
}

impl PasswordVariant {
    /// Field pairs borrowed from `creds`; the only owned copy of the
    /// password is the encoded, zeroized request body.
    fn form<'a>(&self, creds: &'a Credentials) -> Vec<(&'static str, &'a str)> {
        match self.field {
            CredentialField::Email => vec![
                ("request_type", "RESPONSE"),
                ("email", creds.username()),
                ("password", creds.password()),
            ],
            CredentialField::SignInName => vec![
                ("signInName", creds.username()),
                ("password", creds.password()),
                ("request_type", "RESPONSE"),
            ],
        }
    }
}

/// Tried in order, the first 200 wins. Append new shapes, never reorder.
pub const PASSWORD_VARIANTS: [PasswordVariant; 3] = [
    PasswordVariant {
        name: "email/tx",
        tx: TxEncoding::Raw,
        field: CredentialField::Email,
    },
    PasswordVariant {
        name: "email/StateProperties",
        tx: TxEncoding::StateProperties,
        field: CredentialField::Email,
    },
    PasswordVariant {
        name: "signInName/tx",
        tx: TxEncoding::Raw,
        field: CredentialField::SignInName,
    },
];

/// Where the transaction state goes on the confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmParam {
    State,
    Tx(TxEncoding),
}

#[derive(Debug, Clone, Copy)]
pub struct ConfirmVariant {
    pub name: &'static str,
    pub param: ConfirmParam,
}

/// Tried in order, the first response carrying a non-empty form wins.
/// Append new shapes, never reorder.
pub const CONFIRM_VARIANTS: [ConfirmVariant; 3] = [
    ConfirmVariant {
        name: "state",
        param: ConfirmParam::State,
    },
    ConfirmVariant {
        name: "tx/StateProperties",
        param: ConfirmParam::Tx(TxEncoding::StateProperties),
    },
    ConfirmVariant {
        name: "tx",
        param: ConfirmParam::Tx(TxEncoding::Raw),
    },
];

/// What the provider's sign-in page handed us. Lives only for the cycle.
struct ProviderPage {
    url: Url,
    csrf: Zeroizing<String>,
    tx: Zeroizing<String>,
}

fn diagnostics() -> String {
    format!(
        r#"{{"pageViewId":"{}","pageId":"{}","trace":[]}}"#,
        Uuid::new_v4(),
        B2C_PAGE_ID
    )
}

fn xhr(request: Request, csrf: &str) -> Request {
    request
        .header(header::ACCEPT, XHR_ACCEPT)
        .header(HeaderName::from_static("x-csrf-token"), csrf)
        .header(HeaderName::from_static("x-requested-with"), "XMLHttpRequest")
}

async fn load_login_page(
    session: &mut Session,
    endpoints: &Endpoints,
) -> Result<(), WaterscopeError> {
    let step = AuthState::PageLoaded.to_string();
    let page = session.send(&step, Request::get(endpoints.login())).await?;
    if page.status != StatusCode::OK {
        return Err(WaterscopeError::status(&step, page.status));
    }
    Ok(())
}

async fn submit_username(
    session: &mut Session,
    endpoints: &Endpoints,
    creds: &Credentials,
) -> Result<Url, WaterscopeError> {
    let step = AuthState::UsernameSubmitted.to_string();
    let request = Request::post(endpoints.login())
        .form(vec![(
            USERNAME_FIELD.to_string(),
            creds.username().to_string(),
        )])
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::ORIGIN, &endpoints.portal_origin())
        .header(header::REFERER, endpoints.login().as_str())
        .follow_redirects(false);
    let page = session.send(&step, request).await?;

    let oauth_url = extract_redirect(
        page.location.as_deref(),
        &page.body,
        &page.url,
        endpoints,
    )
    .ok_or_else(|| {
        warn!(
            "{}: no provider redirect for {} (status {})",
            step,
            creds.masked_username(),
            page.status
        );
        AuthFailure::RedirectNotFound
    })?;
    check_authorize_params(&oauth_url);
    Ok(oauth_url)
}

async fn load_provider_page(
    session: &mut Session,
    endpoints: &Endpoints,
    oauth_url: &Url,
) -> Result<ProviderPage, WaterscopeError> {
    let step = AuthState::OAuthPageLoaded.to_string();
    let request =
        Request::get(oauth_url).header(header::REFERER, endpoints.portal_root().as_str());
    let page = session.send(&step, request).await?;
    if page.status != StatusCode::OK {
        return Err(WaterscopeError::status(&step, page.status));
    }

    let csrf = extract_csrf(&session.cookies()).ok_or_else(|| {
        warn!(
            "{}: no csrf cookie among {:?}",
            step,
            session.cookie_names()
        );
        AuthFailure::CsrfTokenMissing
    })?;
    let tx = extract_transaction_state(&page.url, &page.body)
        .ok_or(AuthFailure::TransactionStateMissing)?;
    debug!("{}: landed on {}", step, page.url.path());

    Ok(ProviderPage {
        url: page.url,
        csrf: Zeroizing::new(csrf),
        tx: Zeroizing::new(tx),
    })
}

async fn submit_password(
    session: &mut Session,
    endpoints: &Endpoints,
    creds: &Credentials,
    provider: &ProviderPage,
) -> Result<Url, WaterscopeError> {
    let step = AuthState::PasswordSubmitted.to_string();
    let origin = endpoints.provider_origin();

    for variant in PASSWORD_VARIANTS.iter() {
        let tx = Zeroizing::new(variant.tx.encode(&provider.tx));
        let request = xhr(Request::post(endpoints.self_asserted()), &provider.csrf)
            .query(&[("tx", tx.as_str()), ("p", B2C_POLICY)])
            .form(variant.form(creds))
            .header(header::CONTENT_TYPE, XHR_CONTENT_TYPE)
            .header(header::ORIGIN, &origin)
            .header(header::REFERER, provider.url.as_str())
            .follow_redirects(false);

        match session.send(&step, request).await {
            Ok(page) if page.status == StatusCode::OK => {
                info!(
                    "{}: accepted shape {} for {}",
                    step,
                    variant.name,
                    creds.masked_username()
                );
                return Ok(endpoints.confirmed().clone());
            }
            Ok(page) => debug!("{}: shape {} got {}", step, variant.name, page.status),
            Err(e) => warn!("{}: shape {} failed: {}", step, variant.name, e),
        }
    }
    Err(AuthFailure::PasswordRejected.into())
}

async fn confirm(
    session: &mut Session,
    creds: &Credentials,
    provider: &ProviderPage,
    confirm_url: &Url,
) -> Result<AutoSubmitForm, WaterscopeError> {
    let step = AuthState::OAuthConfirmed.to_string();

    for variant in CONFIRM_VARIANTS.iter() {
        let diags = diagnostics();
        let (key, tx) = match variant.param {
            ConfirmParam::State => ("state", Zeroizing::new(provider.tx.to_string())),
            ConfirmParam::Tx(encoding) => ("tx", Zeroizing::new(encoding.encode(&provider.tx))),
        };
        let request = xhr(Request::get(confirm_url), &provider.csrf).query(&[
            ("rememberMe", "false"),
            ("csrf_token", provider.csrf.as_str()),
            (key, tx.as_str()),
            ("p", B2C_POLICY),
            ("diags", diags.as_str()),
        ]);

        match session.send(&step, request).await {
            Ok(page) if page.status == StatusCode::OK => match extract_autosubmit_form(&page.body) {
                Some(form) => {
                    info!(
                        "{}: shape {} returned {} fields for {}",
                        step,
                        variant.name,
                        form.fields.len(),
                        creds.masked_username()
                    );
                    return Ok(form);
                }
                None => debug!("{}: shape {} returned no form", step, variant.name),
            },
            Ok(page) => debug!("{}: shape {} got {}", step, variant.name, page.status),
            Err(e) => warn!("{}: shape {} failed: {}", step, variant.name, e),
        }
    }
    warn!(
        "{}: no auto-submit form for {}, credentials may be invalid",
        step,
        creds.masked_username()
    );
    Err(AuthFailure::ConfirmationFailed.into())
}

async fn exchange_token(
    session: &mut Session,
    endpoints: &Endpoints,
    form: AutoSubmitForm,
) -> Result<(), WaterscopeError> {
    let step = AuthState::TokenExchanged.to_string();
    let request = Request::post(endpoints.portal_root())
        .form(form.fields)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::ORIGIN, &endpoints.provider_origin())
        .header(header::REFERER, endpoints.provider_root().as_str());
    let page = session.send(&step, request).await?;
    if page.status != StatusCode::OK {
        return Err(WaterscopeError::status(&step, page.status));
    }
    Ok(())
}

async fn check_authenticated(
    session: &mut Session,
    endpoints: &Endpoints,
    verify_session: bool,
) -> Result<(), WaterscopeError> {
    let step = AuthState::Authenticated.to_string();
    if !AUTH_COOKIE_NAMES.iter().any(|name| session.has_cookie(name)) {
        warn!(
            "{}: no auth cookie among {:?}",
            step,
            session.cookie_names()
        );
        return Err(AuthFailure::NoAuthCookies.into());
    }
    if !verify_session {
        return Ok(());
    }

    let request = Request::get(endpoints.dashboard()).follow_redirects(false);
    let page = session.send(&step, request).await?;
    if page.status != StatusCode::OK {
        warn!("{}: protected page answered {}", step, page.status);
        return Err(AuthFailure::NoAuthCookies.into());
    }
    Ok(())
}

/// Drive `session` from anonymous to authenticated.
///
/// The session must be fresh; it is left holding the portal's auth cookies
/// on success. On failure the session is in an unspecified state and must be
/// discarded. When `verify_session` is set the protected dashboard endpoint
/// is probed as a final confirmation.
pub async fn authenticate(
    session: &mut Session,
    endpoints: &Endpoints,
    creds: &Credentials,
    verify_session: bool,
) -> Result<(), WaterscopeError> {
    let who = creds.masked_username();
    let mut state = AuthState::Init;
    let mut advance = |next: AuthState| {
        debug!("{}: {:?} -> {:?}", who, state, next);
        state = next;
    };

    info!("Starting sign-in for {}", who);
    load_login_page(session, endpoints).await?;
    advance(AuthState::PageLoaded);

    let oauth_url = submit_username(session, endpoints, creds).await?;
    advance(AuthState::UsernameSubmitted);

    let provider = load_provider_page(session, endpoints, &oauth_url).await?;
    advance(AuthState::OAuthPageLoaded);

    let confirm_url = submit_password(session, endpoints, creds, &provider).await?;
    advance(AuthState::PasswordSubmitted);

    let form = confirm(session, creds, &provider, &confirm_url).await?;
    advance(AuthState::OAuthConfirmed);

    exchange_token(session, endpoints, form).await?;
    advance(AuthState::TokenExchanged);

    check_authenticated(session, endpoints, verify_session).await?;
    advance(AuthState::Authenticated);

    info!("Signed in {}", who);
    Ok(())
}
