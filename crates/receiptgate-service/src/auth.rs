use axum::http::{header, HeaderMap};
use receiptgate_core::ReceiptGateError;
use subtle::ConstantTimeEq;

use crate::config::Config;

/// API-key check for everything except `/health`. Accepts
/// `Authorization: Bearer <key>` or `X-API-Key: <key>`; comparison is
/// constant-time.
///
/// # Errors
/// Returns [`ReceiptGateError::Unauthorized`] on a missing or mismatched key,
/// [`ReceiptGateError::Internal`] if the server reached steady state without
/// a configured key (startup validation should make that impossible).
pub fn require_api_key(headers: &HeaderMap, config: &Config) -> Result<(), ReceiptGateError> {
    if config.allow_insecure_dev {
        return Ok(());
    }

    let presented = bearer_token(headers).or_else(|| header_value(headers, "x-api-key"));
    let Some(presented) = presented else {
        return Err(ReceiptGateError::Unauthorized);
    };

    let Some(expected) = config.api_key.as_deref() else {
        return Err(ReceiptGateError::Internal(
            "authentication not initialised: no API key configured".to_string(),
        ));
    };

    let matches: bool = presented.as_bytes().ct_eq(expected.as_bytes()).into();
    if matches {
        Ok(())
    } else {
        Err(ReceiptGateError::Unauthorized)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(api_key: Option<&str>, insecure: bool) -> Config {
        let mut pairs = vec![("RECEIPTGATE_ALLOW_INSECURE_DEV".to_string(), insecure.to_string())];
        if let Some(key) = api_key {
            pairs.push(("RECEIPTGATE_API_KEY".to_string(), key.to_string()));
        }
        match Config::from_lookup(|name| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        }) {
            Ok(config) => config,
            Err(err) => panic!("test config invalid: {err}"),
        }
    }

    #[test]
    fn bearer_and_x_api_key_headers_are_accepted() {
        let config = config(Some("rg_secret"), false);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer rg_secret"));
        assert!(require_api_key(&headers, &config).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("rg_secret"));
        assert!(require_api_key(&headers, &config).is_ok());
    }

    #[test]
    fn missing_or_wrong_key_is_unauthorized() {
        let config = config(Some("rg_secret"), false);

        let headers = HeaderMap::new();
        assert_eq!(
            require_api_key(&headers, &config),
            Err(ReceiptGateError::Unauthorized)
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("rg_wrong"));
        assert_eq!(
            require_api_key(&headers, &config),
            Err(ReceiptGateError::Unauthorized)
        );
    }

    #[test]
    fn insecure_dev_bypasses_the_check() {
        let config = config(None, true);
        assert!(require_api_key(&HeaderMap::new(), &config).is_ok());
    }
}
