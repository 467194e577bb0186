//! Relay side of the handshake

use crate::service::ServiceLookup;
use crate::ServiceOptions;
use quickrelay_connection::TunnelError;
use quickrelay_proto::HandshakeRequest;
use subtle::ConstantTimeEq;

/// Check a handshake request against the service lookup
pub fn authorize(
    request: &HandshakeRequest,
    lookup: &dyn ServiceLookup,
) -> Result<ServiceOptions, TunnelError> {
    if request.service_name.is_empty() {
        return Err(TunnelError::AuthenticationFailure(
            "missing service name".to_string(),
        ));
    }
    if request.service_token.is_empty() {
        return Err(TunnelError::AuthenticationFailure(
            "missing service token".to_string(),
        ));
    }

    let options = lookup
        .service_options(&request.service_name)
        .map_err(|e| TunnelError::AuthenticationFailure(e.to_string()))?;

    if !tokens_match(&request.service_token, &options.service_token) {
        return Err(TunnelError::AuthenticationFailure(format!(
            "invalid token for service {}",
            request.service_name
        )));
    }

    Ok(options)
}

/// Exact token comparison in constant time
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
