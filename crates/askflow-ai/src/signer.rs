//! HMAC request signing for the signed-socket backend.
//!
//! The backend authenticates the WebSocket handshake through query
//! parameters: `authorization` (base64 of an assembly that itself embeds a
//! base64 HMAC-SHA256 digest), `date` and `host`. Both encoding levels are
//! checked by the backend's verifier.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use crate::error::{RelayError, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "hmac-sha256";
const SIGNED_HEADERS: &str = "host date request-line";

/// The header values covered by the signature. Consumed once per handshake.
#[derive(Debug, Clone, Copy)]
pub struct SignableRequest<'a> {
    pub host: &'a str,
    pub date: &'a str,
    pub request_line: &'a str,
}

impl SignableRequest<'_> {
    /// The exact string the backend recomputes.
    pub fn signable_string(&self) -> String {
        format!(
            "host: {}\ndate: {}\n{}",
            self.host, self.date, self.request_line
        )
    }
}

/// Produce the base64 `authorization` query value for `request`.
pub fn authorization(api_key: &str, api_secret: &str, request: &SignableRequest<'_>) -> String {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC keys may have any length"));
    mac.update(request.signable_string().as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let assembly = format!(
        "api_key=\"{api_key}\", algorithm=\"{ALGORITHM}\", headers=\"{SIGNED_HEADERS}\", signature=\"{signature}\""
    );
    BASE64.encode(assembly)
}

/// RFC1123 date as expected in the `date` header, e.g. `Wed, 01 Jan 2020 00:00:00 GMT`.
pub fn rfc1123_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Append the signed query string to `endpoint`.
pub fn signed_url(
    endpoint: &Url,
    api_key: &str,
    api_secret: &str,
    now: DateTime<Utc>,
) -> Result<Url> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| RelayError::InvalidConfig(format!("URL '{endpoint}' has no host")))?;
    let date = rfc1123_date(now);
    let request_line = format!("GET {} HTTP/1.1", endpoint.path());
    let authorization = authorization(
        api_key,
        api_secret,
        &SignableRequest {
            host,
            date: &date,
            request_line: &request_line,
        },
    );

    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("authorization", &authorization)
        .append_pair("date", &date)
        .append_pair("host", host);
    Ok(url)
}
