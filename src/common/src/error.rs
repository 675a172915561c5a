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
use std::fmt;

/// The step of the sign-in flow that refused to continue. These are
/// surfaced separately from transport problems so the caller can avoid
/// hammering the provider with credentials that are likely invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The portal answered the username post without pointing us at the
    /// identity provider. Usually the username was rejected outright.
    RedirectNotFound,
    /// The provider page did not set an `x-ms-cpim-csrf` cookie.
    CsrfTokenMissing,
    /// No transaction state could be found in the provider URL or page.
    TransactionStateMissing,
    /// Every SelfAsserted request shape was refused.
    PasswordRejected,
    /// No confirmation request shape produced an auto-submit form. Invalid
    /// credentials and provider glitches both end up here.
    ConfirmationFailed,
    /// The portal accepted the token exchange but issued no auth cookie, or
    /// the protected endpoint refused the resulting session.
    NoAuthCookies,
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailure::RedirectNotFound => "redirect not found",
            AuthFailure::CsrfTokenMissing => "csrf token missing",
            AuthFailure::TransactionStateMissing => "transaction state missing",
            AuthFailure::PasswordRejected => "password submission rejected",
            AuthFailure::ConfirmationFailed => "oauth confirmation failed",
            AuthFailure::NoAuthCookies => "no auth cookies issued",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WaterscopeError {
    /// Transport failure, timeout, or an unexpected status on a step that
    /// has no fallback shapes.
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication error: {0}")]
    Authentication(AuthFailure),
    /// The dashboard was reached but no reading could be extracted.
    #[error("Data parse error: {0}")]
    DataParse(String),
}

impl WaterscopeError {
    /// Build a connection error from a transport failure. The URL is
    /// stripped since provider URLs embed the transaction state.
    pub(crate) fn transport(step: &str, e: reqwest::Error) -> Self {
        let e = e.without_url();
        if e.is_timeout() {
            WaterscopeError::Connection(format!("{}: request timed out", step))
        } else {
            WaterscopeError::Connection(format!("{}: {}", step, e))
        }
    }

    pub(crate) fn status(step: &str, status: reqwest::StatusCode) -> Self {
        WaterscopeError::Connection(format!("{}: unexpected status {}", step, status))
    }

    /// Connection and parse failures are expected to clear up by the next
    /// scheduled cycle. Authentication failures may not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, WaterscopeError::Authentication(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WaterscopeError::Connection(_) => "connection",
            WaterscopeError::Authentication(_) => "authentication",
            WaterscopeError::DataParse(_) => "data_parse",
        }
    }
}

impl From<AuthFailure> for WaterscopeError {
    fn from(f: AuthFailure) -> Self {
        WaterscopeError::Authentication(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_messages() {
        let e: WaterscopeError = AuthFailure::ConfirmationFailed.into();
        assert_eq!(e.to_string(), "Authentication error: oauth confirmation failed");
        assert_eq!(e.kind(), "authentication");
        assert!(!e.is_transient());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(WaterscopeError::Connection("load page: timed out".into()).is_transient());
        assert!(WaterscopeError::DataParse("reading not found".into()).is_transient());
    }
}
