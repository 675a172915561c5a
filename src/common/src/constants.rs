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
pub const DEFAULT_CONFIG_PATH: &str = "/etc/waterscope/waterscope.conf";
pub const DEFAULT_STATE_PATH: &str = "/var/cache/waterscoped/readings.json";
pub const DEFAULT_CONN_TIMEOUT: u64 = 30;
pub const DEFAULT_POLL_INTERVAL: u64 = 1800;
pub const MAX_CONN_TIMEOUT: u64 = 600;
pub const MAX_POLL_INTERVAL: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_VERIFY_SESSION: bool = true;

// Portal
pub const DEFAULT_PORTAL_URL: &str = "https://waterscope.us/";
pub const PORTAL_LOGIN_PATH: &str = "Home/Main";
pub const PORTAL_DASHBOARD_PATH: &str = "Consumer/Consumer/Index";
pub const USERNAME_FIELD: &str = "txtSearchUserName";

// Azure B2C tenant the portal delegates to
pub const DEFAULT_PROVIDER_URL: &str = "https://metronb2c.b2clogin.com/";
pub const B2C_TENANT: &str = "metronb2c.onmicrosoft.com";
pub const B2C_POLICY: &str = "B2C_1_mainsso_web";
pub const B2C_CLIENT_ID: &str = "57f60f76-c91d-404d-8f70-828b0f958a83";
pub const B2C_REDIRECT_URI: &str = "https://waterscope.us/";
pub const B2C_RESPONSE_TYPE: &str = "code id_token";
pub const B2C_RESPONSE_MODE: &str = "form_post";
pub const B2C_SCOPE: &str = "openid profile offline_access \
    https://metronb2c.onmicrosoft.com/57f60f76-c91d-404d-8f70-828b0f958a83/read \
    https://metronb2c.onmicrosoft.com/57f60f76-c91d-404d-8f70-828b0f958a83/write";
pub const B2C_PAGE_ID: &str = "CombinedSigninAndSignup";

// Cookies significant to the protocol
pub const CSRF_COOKIE_PREFIX: &str = "x-ms-cpim-csrf";
pub const AUTH_COOKIE_NAMES: [&str; 2] = [".ASPXAUTH", ".AspNet.Cookies"];

// Request shape of a desktop Chrome
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";
pub const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,\
    image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";
pub const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
pub const XHR_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";
pub const XHR_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";
pub const MAX_REDIRECTS: usize = 10;

// Dashboard
pub const READING_UNIT: &str = "ft³";
pub const DEFAULT_READING_SELECTORS: [&str; 2] = ["#lcd-read_NEW", "#lcd-read_NEW_1"];
pub const READING_LABEL_PATTERN: &str = r"(?i)LCD Read[^0-9]*(\d[\d,]*(?:\.\d+)?)\s*Ft3";
pub const BILLING_READ_SELECTOR: &str = "span#billing-read_NEW";
