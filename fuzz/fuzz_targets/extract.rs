//! Fuzz the provider response extractors.
//!
//! Feeds arbitrary markup, cookie jars and redirect targets through the
//! lookups used during sign-in. None of them may panic; absence is `None`.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use url::Url;

use waterscope_unix_common::extract::{
    check_authorize_params, extract_autosubmit_form, extract_csrf, extract_redirect,
    extract_transaction_state,
};
use waterscope_unix_common::Endpoints;

#[derive(Debug, Arbitrary)]
struct FInput {
    body: String,
    query: String,
    location: Option<String>,
    cookies: Vec<(String, String)>,
}

fuzz_target!(|input: FInput| {
    let Ok(endpoints) = Endpoints::new("https://waterscope.us/", "https://metronb2c.b2clogin.com/")
    else {
        return;
    };
    let Ok(mut url) = Url::parse("https://metronb2c.b2clogin.com/authorize") else {
        return;
    };
    url.set_query(Some(&input.query));

    let _ = extract_csrf(&input.cookies);
    let _ = extract_transaction_state(&url, &input.body);
    if let Some(form) = extract_autosubmit_form(&input.body) {
        assert!(!form.fields.is_empty());
    }
    if let Some(target) = extract_redirect(input.location.as_deref(), &input.body, endpoints.login(), &endpoints) {
        check_authorize_params(&target);
    }
    check_authorize_params(&url);
});
