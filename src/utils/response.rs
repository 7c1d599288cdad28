//! Materialization of synthetic error responses onto the proxy.
//!
//! The mediation core assembles an [`ErrorResponse`]; this module turns
//! it into the proxy's outgoing header object and, for request-phase
//! diversions, writes it straight back to the client.

use bytes::Bytes;
use http::{header, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

use crate::engine::server::ErrorResponse;

/// Builds the client response header for a committed error response.
pub fn build_error_header(response: &ErrorResponse) -> Result<ResponseHeader> {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = ResponseHeader::build(status, Some(response.headers.len() + 1))?;

    for (name, value) in &response.headers {
        resp.append_header(name.clone(), value.clone())?;
    }

    let body_len = response.body.as_ref().map(|b| b.len()).unwrap_or(0);
    resp.insert_header(header::CONTENT_LENGTH, body_len.to_string())?;

    Ok(resp)
}

/// Writes the synthetic response to the client, short-circuiting the
/// origin. Used for diversions discovered in the request phase.
pub async fn send_error_response(session: &mut Session, response: &ErrorResponse) -> Result<()> {
    let header = build_error_header(response)?;
    let body = response.body.clone().filter(|b| !b.is_empty());
    session
        .write_response_header(Box::new(header), body.is_none())
        .await?;
    if let Some(body) = body {
        session.write_response_body(Some(body), true).await?;
    }
    Ok(())
}

/// The fallback body served when the engine supplied none.
pub fn default_error_body(status: u16) -> Bytes {
    Bytes::from(format!(
        "<html><body><h1>{status} {}</h1></body></html>\n",
        StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_status_and_pending_fields() {
        let response = ErrorResponse {
            status: 403,
            reason: None,
            headers: vec![("X-Blocked".to_string(), "yes".to_string())],
            body: Some(Bytes::from_static(b"denied")),
        };
        let header = build_error_header(&response).unwrap();
        assert_eq!(header.status, StatusCode::FORBIDDEN);
        assert_eq!(header.headers.get("X-Blocked").unwrap(), "yes");
        assert_eq!(header.headers.get("Content-Length").unwrap(), "6");
    }

    #[test]
    fn unassigned_status_degrades_to_500() {
        let response = ErrorResponse {
            status: 999,
            ..Default::default()
        };
        let header = build_error_header(&response).unwrap();
        assert_eq!(header.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(header.headers.get("Content-Length").unwrap(), "0");
    }

    #[test]
    fn default_body_names_the_status() {
        let body = default_error_body(403);
        assert!(std::str::from_utf8(&body).unwrap().contains("403 Forbidden"));
    }
}
