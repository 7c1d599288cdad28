//! Pingora adapter: maps the proxy's hook surface onto the mediation
//! layer.
//!
//! Each `ProxyHttp` callback performs the host-side half of one proxy
//! event: recovering wire bytes for the reparser, feeding body chunks to
//! the stream filters, applying queued header actions at serialization,
//! and materializing committed error responses. Session and transaction
//! lifecycles are owned here through the request context.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, StatusCode, Version};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::Result;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::engine::{ConnInfo, Direction};
use crate::utils::headers::apply_header_actions;
use crate::utils::response::{build_error_header, default_error_body, send_error_response};
use crate::waf::event::{EventPlugin, Verdict};
use crate::waf::{SessionContext, TransactionContext};

/// Where proxied traffic goes.
#[derive(Clone, Debug)]
pub struct OriginConfig {
    pub address: String,
    pub tls: bool,
    pub sni: String,
}

/// The WAF gateway proxy service.
pub struct GatewayService {
    event: Arc<EventPlugin>,
    origin: OriginConfig,
}

impl GatewayService {
    pub fn new(event: Arc<EventPlugin>, origin: OriginConfig) -> Self {
        Self { event, origin }
    }
}

/// Per-request context: the mediator session and transaction, plus the
/// pending synthetic body once an error response replaces an origin
/// response mid-stream.
#[derive(Default)]
pub struct GatewayCtx {
    session: Option<Arc<SessionContext>>,
    tx: Option<Arc<TransactionContext>>,
    error_body: Option<Bytes>,
    error_body_sent: bool,
}

#[async_trait]
impl ProxyHttp for GatewayService {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    /// Session-start and transaction-start, before any other filter.
    async fn early_request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<()> {
        let waf_session = self.event.session_start();
        let info = conn_info_of(session);
        let tx = self.event.transaction_start(&waf_session, &info);
        ctx.session = Some(waf_session);
        ctx.tx = Some(tx);
        Ok(())
    }

    /// Read-request-headers: reparse, notify the engine, and decide
    /// between continuing and diverting into the error path.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let Some(tx) = ctx.tx.clone() else {
            return Ok(false);
        };

        if tx.is_bypass() && !self.event.engine_ready() {
            if self.event.settings().early_traffic {
                log::debug!("No engine ready; letting traffic through unchecked");
                return Ok(false);
            }
            session
                .respond_error(StatusCode::SERVICE_UNAVAILABLE.as_u16())
                .await?;
            return Ok(true);
        }

        let raw = serialize_request_head(session.req_header());
        let url = session.req_header().uri.to_string();
        match self.event.request_headers(&tx, &raw, url.as_bytes()) {
            Verdict::Continue => Ok(false),
            Verdict::Divert(status) => {
                // The origin is never contacted.
                if let Some(mut response) = self.event.commit_response(&tx) {
                    if response.body.is_none() {
                        response.body = Some(default_error_body(response.status));
                    }
                    send_error_response(session, &response).await?;
                } else {
                    session.respond_error(status).await?;
                }
                Ok(true)
            }
        }
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(tx) = ctx.tx.clone() {
            let out = self
                .event
                .body_chunk(&tx, Direction::Request, body.take(), end_of_stream);
            *body = if out.is_empty() { None } else { Some(out) };
        }
        Ok(())
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Ok(Box::new(HttpPeer::new(
            self.origin.address.clone(),
            self.origin.tls,
            self.origin.sni.clone(),
        )))
    }

    /// Request headers serialize toward the origin here: the commit
    /// point for request-direction header actions.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(tx) = ctx.tx.clone() else {
            return Ok(());
        };
        let actions = tx.take_header_actions(Direction::Request);
        apply_header_actions(upstream_request, &actions);

        // Declared edits change the body length; let the proxy re-frame.
        if tx.with_filter(Direction::Request, |f| f.have_edits()) {
            upstream_request.remove_header(&header::CONTENT_LENGTH);
        }
        Ok(())
    }

    /// Read-response-headers and send-response-headers: notify the
    /// engine, then either commit the synthetic response over the origin
    /// head or apply response-direction header actions.
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(tx) = ctx.tx.clone() else {
            return Ok(());
        };

        let raw = serialize_response_head(upstream_response);
        let _ = self.event.response_headers(&tx, &raw);

        if let Some(mut response) = self.event.commit_response(&tx) {
            if response.body.is_none() {
                response.body = Some(default_error_body(response.status));
            }
            *upstream_response = build_error_header(&response)?;
            ctx.error_body = response.body;
            return Ok(());
        }

        let actions = tx.take_header_actions(Direction::Response);
        apply_header_actions(upstream_response, &actions);
        if tx.with_filter(Direction::Response, |f| f.have_edits()) {
            upstream_response.remove_header(&header::CONTENT_LENGTH);
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<std::time::Duration>> {
        let Some(tx) = ctx.tx.clone() else {
            return Ok(None);
        };

        let out = self
            .event
            .body_chunk(&tx, Direction::Response, body.take(), end_of_stream);

        if ctx.error_body.is_some() {
            // Origin bytes are being discarded; substitute the synthetic
            // body exactly once.
            *body = if ctx.error_body_sent {
                None
            } else {
                ctx.error_body_sent = true;
                ctx.error_body.clone()
            };
        } else {
            *body = if out.is_empty() { None } else { Some(out) };
        }
        Ok(None)
    }

    /// Transaction-close and session-close.
    async fn logging(&self, _session: &mut Session, e: Option<&pingora_error::Error>, ctx: &mut Self::CTX) {
        if let Some(e) = e {
            log::debug!("Transaction ended with proxy error: {e}");
        }
        if let Some(tx) = ctx.tx.take() {
            self.event.transaction_close(&tx);
        }
        if let Some(session) = ctx.session.take() {
            self.event.session_close(&session);
        }
    }
}

fn conn_info_of(session: &Session) -> ConnInfo {
    let mut info = ConnInfo::default();
    if let Some(addr) = session.client_addr().and_then(|a| a.as_inet()) {
        info.client_ip = addr.ip().to_string();
        info.client_port = addr.port();
    }
    if let Some(addr) = session.server_addr().and_then(|a| a.as_inet()) {
        info.server_ip = addr.ip().to_string();
        info.server_port = addr.port();
    }
    info
}

fn version_token(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        _ => "HTTP/1.1",
    }
}

/// Serializes the request head back to wire form for the reparser.
fn serialize_request_head(req: &RequestHeader) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(req.method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(req.uri.to_string().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(version_token(req.version).as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in req.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.to_vec()
}

/// Serializes the response head back to wire form for the reparser.
fn serialize_response_head(resp: &ResponseHeader) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(version_token(resp.version).as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(resp.status.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(
        resp.status
            .canonical_reason()
            .unwrap_or("Other")
            .as_bytes(),
    );
    out.extend_from_slice(b"\r\n");
    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.to_vec()
}
