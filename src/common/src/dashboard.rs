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
    BILLING_READ_SELECTOR, DEFAULT_READING_SELECTORS, READING_LABEL_PATTERN, READING_UNIT,
};
use crate::error::WaterscopeError;
use crate::extract::extract_form;
use crate::session::{Endpoints, Page, Request, Session};
use regex::Regex;
use reqwest::header;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::fmt;

const NUMBER_PATTERN: &str = r"-?\d[\d,]*(?:\.\d+)?";
const BARE_NUMBER_PATTERN: &str = r"^\d+(?:\.\d+)?$";

/// One way of locating the meter reading in the dashboard markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadingStrategy {
    /// A CSS selector; the text of the first matching element is parsed.
    Selector(String),
    /// A regular expression over the page text; capture group 1 (or the
    /// whole match) is parsed.
    Pattern(String),
}

impl fmt::Display for ReadingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingStrategy::Selector(css) => write!(f, "selector {}", css),
            ReadingStrategy::Pattern(re) => write!(f, "pattern {}", re),
        }
    }
}

/// The built-in strategies followed by `extra` selectors, in that order.
pub fn reading_strategies(extra: &[String]) -> Vec<ReadingStrategy> {
    let mut strategies: Vec<ReadingStrategy> = DEFAULT_READING_SELECTORS
        .iter()
        .map(|css| ReadingStrategy::Selector(css.to_string()))
        .collect();
    strategies.push(ReadingStrategy::Pattern(READING_LABEL_PATTERN.to_string()));
    strategies.extend(
        extra
            .iter()
            .filter(|css| !css.trim().is_empty())
            .map(|css| ReadingStrategy::Selector(css.trim().to_string())),
    );
    strategies
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterReading {
    pub value: f64,
    pub unit: String,
    /// The strategy that produced the value.
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardData {
    pub reading: MeterReading,
    pub previous_day_consumption: Option<f64>,
    pub daily_average_consumption: Option<f64>,
    pub billing_read: Option<f64>,
    pub current_cycle_total: Option<f64>,
    pub device_name: Option<String>,
}

/// Parse the first numeric token of `text`, dropping thousands separators.
pub fn parse_number(text: &str) -> Option<f64> {
    let re = Regex::new(NUMBER_PATTERN).ok()?;
    let token = re.find(text)?.as_str().replace(',', "");
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn element_text(element: &ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn parse_selector(css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Skipping unparseable selector {}: {:?}", css, e);
            None
        }
    }
}

fn apply_strategy(doc: &Html, strategy: &ReadingStrategy) -> Option<f64> {
    match strategy {
        ReadingStrategy::Selector(css) => {
            let sel = parse_selector(css)?;
            let element = doc.select(&sel).next()?;
            let text = element_text(&element);
            let value = parse_number(&text);
            if value.is_none() {
                debug!("{} matched unparseable text {:?}", strategy, text);
            }
            value
        }
        ReadingStrategy::Pattern(pattern) => {
            let re = match Regex::new(pattern) {
                Ok(re) => re,
                Err(e) => {
                    warn!("Skipping invalid reading pattern: {}", e);
                    return None;
                }
            };
            let text = doc.root_element().text().collect::<Vec<_>>().join(" ");
            let caps = re.captures(&text)?;
            let m = caps.get(1).or_else(|| caps.get(0))?;
            parse_number(m.as_str())
        }
    }
}

/// Return the first reading any strategy can parse, trying them in order.
pub fn extract_reading(
    html: &str,
    strategies: &[ReadingStrategy],
) -> Result<MeterReading, WaterscopeError> {
    let doc = Html::parse_document(html);
    extract_reading_from(&doc, strategies)
}

fn extract_reading_from(
    doc: &Html,
    strategies: &[ReadingStrategy],
) -> Result<MeterReading, WaterscopeError> {
    for strategy in strategies {
        if let Some(value) = apply_strategy(doc, strategy) {
            debug!("Reading {} found by {}", value, strategy);
            return Ok(MeterReading {
                value,
                unit: READING_UNIT.to_string(),
                strategy: strategy.to_string(),
            });
        }
    }
    Err(WaterscopeError::DataParse("reading not found".to_string()))
}

/// The bare number in the extended-info block whose label contains all of
/// `words`.
fn labelled_value(doc: &Html, words: &[&str]) -> Option<f64> {
    let label_sel = parse_selector("label.src-int_lbl-extended")?;
    let span_sel = parse_selector("span")?;
    let bare = Regex::new(BARE_NUMBER_PATTERN).ok()?;

    let label = doc.select(&label_sel).find(|label| {
        let text = element_text(label);
        words.iter().all(|w| text.contains(w))
    })?;
    let wrapper = label.ancestors().filter_map(ElementRef::wrap).find(|e| {
        e.value().name() == "div" && e.value().classes().any(|c| c == "src-int_wrp-extended")
    })?;
    wrapper
        .select(&span_sel)
        .map(|span| element_text(&span))
        .find(|text| bare.is_match(text))
        .and_then(|text| text.parse::<f64>().ok())
}

fn billing_read(doc: &Html) -> Option<f64> {
    let sel = parse_selector(BILLING_READ_SELECTOR)?;
    doc.select(&sel)
        .next()
        .and_then(|e| parse_number(&element_text(&e)))
}

fn device_name(doc: &Html) -> Option<String> {
    let table_sel = parse_selector("table[style*=\"font-size: 11px\"]")?;
    let span_sel = parse_selector("span")?;
    let table = doc.select(&table_sel).next()?;

    let mut model = None;
    let mut name = None;
    for span in table.select(&span_sel) {
        let text = element_text(&span);
        if text.contains("innov8-VN LTE") {
            model.get_or_insert(text);
        } else if span.value().classes().any(|c| c == "metermname") {
            name.get_or_insert(text);
        }
    }
    let joined = format!("{} {}", model?, name?);
    Some(joined.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Extract the reading plus every secondary metric present. Only a missing
/// reading is an error.
pub fn extract_dashboard(
    html: &str,
    strategies: &[ReadingStrategy],
) -> Result<DashboardData, WaterscopeError> {
    let doc = Html::parse_document(html);
    let reading = extract_reading_from(&doc, strategies)?;
    Ok(DashboardData {
        reading,
        previous_day_consumption: labelled_value(&doc, &["Water", "Consumption"]),
        daily_average_consumption: labelled_value(&doc, &["Daily", "Average"]),
        billing_read: billing_read(&doc),
        current_cycle_total: labelled_value(&doc, &["So far this", "cycle"]),
        device_name: device_name(&doc),
    })
}

async fn get_dashboard(
    session: &mut Session,
    endpoints: &Endpoints,
    step: &str,
) -> Result<Page, WaterscopeError> {
    let page = session.send(step, Request::get(endpoints.dashboard())).await?;
    if page.status != StatusCode::OK {
        return Err(WaterscopeError::status(step, page.status));
    }
    Ok(page)
}

/// Fetch the dashboard over an authenticated session and extract its data.
/// A pending sign-in hand-off form on the page is submitted once before the
/// dashboard is requested again.
pub async fn fetch_dashboard(
    session: &mut Session,
    endpoints: &Endpoints,
    strategies: &[ReadingStrategy],
) -> Result<DashboardData, WaterscopeError> {
    let step = "fetch dashboard";
    let mut page = get_dashboard(session, endpoints, step).await?;

    if let Some(form) = extract_form(&page.body, "form#auto") {
        info!("{}: submitting pending sign-in hand-off", step);
        let target = form
            .action
            .as_deref()
            .and_then(|a| page.url.join(a).ok())
            .unwrap_or_else(|| endpoints.portal_root().clone());
        let request = Request::post(&target)
            .form(form.fields)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        let handoff = session.send(step, request).await?;
        if handoff.status != StatusCode::OK {
            return Err(WaterscopeError::status(step, handoff.status));
        }
        page = get_dashboard(session, endpoints, step).await?;
    }

    extract_dashboard(&page.body, strategies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DASHBOARD: &str = r#"<html><body>
        <div class="lcd"><span id="lcd-read_NEW">1,234.56</span> Ft3</div>
        <div class="src-int_wrp-extended">
          <label class="src-int_lbl-extended">Water Consumption</label>
          <span id="last24HrUsage"><span>16.81</span> <span>Ft3</span></span>
        </div>
        <div class="src-int_wrp-extended">
          <label class="src-int_lbl-extended">Daily Average</label>
          <span id="last24HrUsage">12.5</span>
        </div>
        <div class="src-int_wrp-extended">
          <div><label class="src-int_lbl-extended">So far this billing cycle</label></div>
          <span>gal</span><span>210</span>
        </div>
        <span id="billing-read_NEW">1,200.00 Ft3</span>
        <table style="width:100%; font-size: 11px;">
          <tr><td><span>innov8-VN LTE</span></td>
              <td><span class="metermname">  Metron
                  Spectrum </span></td></tr>
        </table>
        </body></html>"#;

    fn defaults() -> Vec<ReadingStrategy> {
        reading_strategies(&[])
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("123.45"), Some(123.45));
        assert_eq!(parse_number(" 1,234.56 Ft3 "), Some(1234.56));
        assert_eq!(parse_number("-2.5"), Some(-2.5));
        assert_eq!(parse_number("Reading: 42"), Some(42.0));
        assert_eq!(parse_number("NA"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("gallons"), None);
    }

    #[test]
    fn test_primary_selector() {
        let html = r#"<span id="lcd-read_NEW">123.45</span><span id="lcd-read_NEW_1">9.0</span>"#;
        let reading = extract_reading(html, &defaults()).unwrap();
        assert_eq!(reading.value, 123.45);
        assert_eq!(reading.unit, "ft³");
        assert_eq!(reading.strategy, "selector #lcd-read_NEW");
    }

    #[test]
    fn test_fallback_selector_only() {
        let html = r#"<div><span id="lcd-read_NEW_1">88.2</span></div>"#;
        let reading = extract_reading(html, &defaults()).unwrap();
        assert_eq!(reading.value, 88.2);
        assert_eq!(reading.strategy, "selector #lcd-read_NEW_1");
    }

    #[test]
    fn test_unparseable_falls_through() {
        let html = r#"<span id="lcd-read_NEW">NA</span><span id="lcd-read_NEW_1">77.1</span>"#;
        assert_eq!(extract_reading(html, &defaults()).unwrap().value, 77.1);

        let html = r#"<span id="lcd-read_NEW">NA</span><p>LCD Read: 1,001.5 Ft3</p>"#;
        let reading = extract_reading(html, &defaults()).unwrap();
        assert_eq!(reading.value, 1001.5);
        assert!(reading.strategy.starts_with("pattern"));
    }

    #[test]
    fn test_reading_not_found() {
        let html = r#"<span id="lcd-read_NEW">NA</span><span id="lcd-read_NEW_1">--</span>"#;
        assert_eq!(
            extract_reading(html, &defaults()).unwrap_err(),
            WaterscopeError::DataParse("reading not found".to_string())
        );
        assert!(extract_reading("", &defaults()).is_err());
    }

    #[test]
    fn test_configured_selectors_are_appended() {
        let strategies = reading_strategies(&[
            "div.meter > b".to_string(),
            "".to_string(),
            "###".to_string(),
        ]);
        assert_eq!(strategies.len(), 5);
        assert_eq!(strategies[0], ReadingStrategy::Selector("#lcd-read_NEW".to_string()));
        assert_eq!(strategies[3], ReadingStrategy::Selector("div.meter > b".to_string()));

        // An invalid selector is skipped, not fatal.
        let html = r#"<div class="meter"><b>55</b></div>"#;
        let reversed: Vec<ReadingStrategy> = strategies.into_iter().rev().collect();
        assert_eq!(extract_reading(html, &reversed).unwrap().value, 55.0);
    }

    #[test]
    fn test_dashboard_extras() {
        let data = extract_dashboard(DASHBOARD, &defaults()).unwrap();
        assert_eq!(data.reading.value, 1234.56);
        assert_eq!(data.previous_day_consumption, Some(16.81));
        assert_eq!(data.daily_average_consumption, Some(12.5));
        assert_eq!(data.current_cycle_total, Some(210.0));
        assert_eq!(data.billing_read, Some(1200.0));
        assert_eq!(
            data.device_name.as_deref(),
            Some("innov8-VN LTE Metron Spectrum")
        );
    }

    #[test]
    fn test_extras_are_optional() {
        let data = extract_dashboard(r#"<span id="lcd-read_NEW">5</span>"#, &defaults()).unwrap();
        assert_eq!(data.reading.value, 5.0);
        assert_eq!(data.previous_day_consumption, None);
        assert_eq!(data.billing_read, None);
        assert_eq!(data.device_name, None);
    }

    #[tokio::test]
    async fn test_fetch_dashboard_submits_pending_form() {
        let portal = MockServer::start().await;
        let endpoints = Endpoints::new(&portal.uri(), "http://127.0.0.1:1/").unwrap();

        // Served once, then the real dashboard takes over.
        Mock::given(method("GET"))
            .and(path("/Consumer/Consumer/Index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<form id='auto' method='post' action='/'>\
                 <input type='hidden' name='code' value='C1'></form>",
            ))
            .up_to_n_times(1)
            .mount(&portal)
            .await;
        Mock::given(method("GET"))
            .and(path("/Consumer/Consumer/Index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DASHBOARD))
            .mount(&portal)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("code=C1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&portal)
            .await;

        let mut session = Session::new(Duration::from_secs(5)).unwrap();
        let data = fetch_dashboard(&mut session, &endpoints, &defaults())
            .await
            .unwrap();
        assert_eq!(data.reading.value, 1234.56);
    }

    #[tokio::test]
    async fn test_fetch_dashboard_status_error() {
        let portal = MockServer::start().await;
        let endpoints = Endpoints::new(&portal.uri(), "http://127.0.0.1:1/").unwrap();
        Mock::given(method("GET"))
            .and(path("/Consumer/Consumer/Index"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&portal)
            .await;

        let mut session = Session::new(Duration::from_secs(5)).unwrap();
        let err = fetch_dashboard(&mut session, &endpoints, &defaults())
            .await
            .unwrap_err();
        assert!(matches!(err, WaterscopeError::Connection(_)));
    }
}
