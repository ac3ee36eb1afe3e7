use axum::extract;

use crate::service::RequestService;

use super::ResponseError;

/// Strips surrounding whitespace and an `http://` scheme from a tapped address.
fn normalize_address(body: &str) -> &str {
    let address = body.trim();
    address.strip_prefix("http://").unwrap_or(address)
}

/// Marks the instance behind the address in the body as recently used.
pub async fn tap_service(
    extract::State(service): extract::State<RequestService>,
    body: String,
) -> Result<(), ResponseError> {
    let address = normalize_address(&body);
    tracing::trace!(address, "tapping service");

    service.resolver().touch(address)?;
    Ok(())
}
