//! HTTP authentication helpers for wiring node credentials into the
//! underlying `jsonrpsee` client builder.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use jsonrpsee::http_client::{HeaderMap, HeaderValue};

/// Basic-auth header map; empty when no user is configured.
pub(crate) fn build_auth_headers(user: Option<&str>, password: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let Some(user) = user.filter(|user| !user.is_empty()) else {
        return Ok(headers);
    };

    let credentials = format!("{user}:{}", password.unwrap_or_default());
    let encoded = BASE64_STANDARD.encode(credentials);
    let value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .context("failed to build Authorization header")?;
    headers.insert("Authorization", value);
    Ok(headers)
}
