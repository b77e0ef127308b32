use super::*;

pub(super) const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Sent when a resolved wait cannot be encoded.
pub(super) const WAIT_ENCODING_FAILED_BODY: &str =
    "{\"StatusCode\":-1,\"Error\":{\"Message\":\"failed to encode wait result\"}}";

/// Newline-terminated wait body. Headers are already on the wire by the time
/// this runs, so failures fall back to a fixed error body.
pub(super) fn encode_wait_body<T: serde::Serialize>(response: &T) -> Bytes {
    let mut encoded = match serde_json::to_vec(response) {
        Ok(encoded) => encoded,
        Err(error) => {
            warn!(
                reason_code = "wait_encoding_failed",
                reason = %error,
                "wait result encoding failed"
            );
            WAIT_ENCODING_FAILED_BODY.as_bytes().to_vec()
        }
    };
    encoded.push(b'\n');
    Bytes::from(encoded)
}

/// Engine clients sometimes send an empty body where a JSON object is
/// expected; treat it as the default request.
pub(super) fn parse_body<T>(body: &[u8]) -> Result<T, ApiError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|error| ApiError::InvalidRequest(format!("invalid JSON body: {error}")))
}

pub(super) fn query_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(str::trim),
        Some("1" | "true" | "True" | "TRUE" | "yes")
    )
}

pub(super) fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if *name == header::AUTHORIZATION || *name == header::PROXY_AUTHORIZATION {
                "<redacted>".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}
