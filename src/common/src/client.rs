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
use crate::auth::authenticate;
use crate::config::WaterscopeConfig;
use crate::constants::{DEFAULT_CONN_TIMEOUT, DEFAULT_VERIFY_SESSION};
use crate::dashboard::{fetch_dashboard, reading_strategies, DashboardData, ReadingStrategy};
use crate::error::WaterscopeError;
use crate::session::{Credentials, Endpoints, Session};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoints: Endpoints,
    pub timeout: Duration,
    pub verify_session: bool,
    pub strategies: Vec<ReadingStrategy>,
}

impl ClientOptions {
    pub fn new(endpoints: Endpoints) -> Self {
        ClientOptions {
            endpoints,
            timeout: Duration::from_secs(DEFAULT_CONN_TIMEOUT),
            verify_session: DEFAULT_VERIFY_SESSION,
            strategies: reading_strategies(&[]),
        }
    }

    /// Options for `account` against the production portal.
    pub fn from_config(
        config: &WaterscopeConfig,
        account: Option<&str>,
    ) -> Result<Self, WaterscopeError> {
        let endpoints = Endpoints::production()
            .map_err(|e| WaterscopeError::Connection(format!("invalid endpoint: {}", e)))?;
        Ok(ClientOptions {
            endpoints,
            timeout: Duration::from_secs(config.get_connection_timeout(account)),
            verify_session: config.get_verify_session(),
            strategies: reading_strategies(&config.get_reading_selectors()),
        })
    }
}

/// Entry point for the host layer. Holds no connection state: every call
/// builds a fresh `Session`, runs the full sign-in, and drops it.
#[derive(Debug, Clone)]
pub struct MeterClient {
    options: ClientOptions,
}

impl MeterClient {
    pub fn new(options: ClientOptions) -> Self {
        MeterClient { options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    async fn signed_in(&self, creds: &Credentials) -> Result<Session, WaterscopeError> {
        let mut session = Session::new(self.options.timeout)?;
        authenticate(
            &mut session,
            &self.options.endpoints,
            creds,
            self.options.verify_session,
        )
        .await?;
        Ok(session)
    }

    /// Authenticate only. Used to check credentials at setup time.
    pub async fn validate(&self, creds: &Credentials) -> Result<(), WaterscopeError> {
        self.signed_in(creds).await.map(|_| ())
    }

    /// Authenticate and fetch the dashboard.
    pub async fn read(&self, creds: &Credentials) -> Result<DashboardData, WaterscopeError> {
        let mut session = self.signed_in(creds).await?;
        let data = fetch_dashboard(
            &mut session,
            &self.options.endpoints,
            &self.options.strategies,
        )
        .await?;
        info!(
            "Read {} {} for {}",
            data.reading.value,
            data.reading.unit,
            creds.masked_username()
        );
        Ok(data)
    }
}
