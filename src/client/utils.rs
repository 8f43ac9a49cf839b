use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use crate::client::consts::AUTHORIZATION_HEADER;

pub fn build_request(url: &str, token: &SecretString) -> tokio_tungstenite::tungstenite::Result<Request> {
    let mut request = url.into_client_request()?;
    request.headers_mut()
        .insert(
            AUTHORIZATION_HEADER,
            format!("Bearer {}", token.expose_secret()).as_str().parse()?
        );
    Ok(request)
}

/// Whether `url` is usable as a websocket endpoint.
pub fn validate_websocket_url(url: &str) -> bool {
    url.into_client_request().is_ok()
}
