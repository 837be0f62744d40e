use serde::de::DeserializeOwned;

use crate::error::TransportError;

fn http_error(url: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Http(format!("{url}: {e}"))
}

/// GET `url` and return the body. Non-2xx statuses are errors.
pub async fn get_bytes(url: &str) -> Result<Vec<u8>, TransportError> {
    let response = reqwest::get(url).await.map_err(|e| http_error(url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(http_error(url, format!("unexpected status {status}")));
    }
    let body = response.bytes().await.map_err(|e| http_error(url, e))?;
    Ok(body.to_vec())
}

/// GET `url` and decode the JSON body, with optional bearer authorization.
///
/// The body is decoded regardless of status: error responses carry
/// `{error, message}` objects the caller reports verbatim.
pub async fn get_json<T: DeserializeOwned>(
    url: &str,
    bearer: Option<&str>,
) -> Result<T, TransportError> {
    let mut request = reqwest::Client::new().get(url);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(|e| http_error(url, e))?;
    let status = response.status();
    let body = response.bytes().await.map_err(|e| http_error(url, e))?;
    tracing::debug!(%url, %status, len = body.len(), "http response");

    serde_json::from_slice(&body)
        .map_err(|e| http_error(url, format!("status {status}, invalid JSON body: {e}")))
}
