//! HTTP query and control surface (tiny_http, one request at a time).
//!
//! Routes:
//! - `GET  /health`                                 -> `OK`
//! - `GET  /metrics`                                -> Prometheus text
//! - `GET  /v1/groups`                              -> group names
//! - `GET  /v1/snapshots/{group}`                   -> every entry of the group
//! - `GET  /v1/snapshots/{group}/{target}/latest`   -> newest entry or 404
//! - `GET  /v1/probes`                              -> per-target probe health
//! - `POST /reload`                                 -> re-read targets and reconcile

use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tiny_http::{Header, Method, Response, Server};

use crate::manager::{Manager, ProbeStatus};
use crate::metrics::render_prometheus;
use crate::registry::Registry;
use crate::reload::ReloadHandle;

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";
const PROM: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct ApiContext {
    pub registry: Arc<Registry>,
    pub manager: Arc<Manager>,
    pub reload: Option<ReloadHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    fn text(status: u16, body: &str) -> Self {
        Self { status, content_type: TEXT, body: format!("{}\n", body) }
    }

    fn json(status: u16, v: &serde_json::Value) -> Self {
        Self { status, content_type: JSON, body: v.to_string() }
    }
}

pub fn bind(addr: &str) -> Result<Server> {
    Server::http(addr).map_err(|e| anyhow!("bind http at {}: {}", addr, e))
}

/// Serve until `server.unblock()` is called.
pub fn serve(server: &Server, ctx: &ApiContext) {
    for rq in server.incoming_requests() {
        let method = rq.method().clone();
        let url = rq.url().to_string();
        let reply = route(ctx, &method, &url);
        debug!("{} {} -> {}", method, url, reply.status);

        let mut resp = Response::from_string(reply.body).with_status_code(reply.status);
        if let Ok(ct) = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes()) {
            resp.add_header(ct);
        }
        if let Err(e) = rq.respond(resp) {
            warn!("http respond error: {}", e);
        }
    }
}

/// Dispatch one request. Kept free of I/O so it can be tested directly.
pub fn route(ctx: &ApiContext, method: &Method, url: &str) -> Reply {
    let path = url.split('?').next().unwrap_or("");
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segs.as_slice()) {
        (Method::Get, []) | (Method::Get, ["health"]) | (Method::Get, ["ready"]) => Reply::text(200, "OK"),

        (Method::Get, ["metrics"]) => Reply {
            status: 200,
            content_type: PROM,
            body: render_prometheus(ctx.registry.len()),
        },

        (Method::Get, ["v1", "groups"]) => Reply::json(200, &serde_json::json!(ctx.registry.groups())),

        (Method::Get, ["v1", "snapshots", group]) => match ctx.registry.list(group) {
            Ok(entries) => {
                let items: Vec<serde_json::Value> = entries.iter().map(|e| e.to_json()).collect();
                Reply::json(200, &serde_json::Value::Array(items))
            }
            Err(e) => Reply::text(400, &format!("{:#}", e)),
        },

        (Method::Get, ["v1", "snapshots", group, target, "latest"]) => {
            match ctx.registry.latest(group, target) {
                Ok(Some(e)) => Reply::json(200, &e.to_json()),
                Ok(None) => Reply::text(404, "not found"),
                Err(e) => Reply::text(400, &format!("{:#}", e)),
            }
        }

        (Method::Get, ["v1", "probes"]) => {
            let rows: Vec<serde_json::Value> = ctx.manager.probe_statuses().iter().map(status_json).collect();
            Reply::json(200, &serde_json::Value::Array(rows))
        }

        (Method::Post, ["reload"]) => match &ctx.reload {
            None => Reply::text(503, "reload not configured"),
            Some(h) => match h.trigger() {
                Ok(report) => match serde_json::to_value(&report) {
                    Ok(v) => Reply::json(200, &v),
                    Err(e) => Reply::text(500, &e.to_string()),
                },
                Err(e) => Reply::text(400, &format!("{:#}", e)),
            },
        },
        (_, ["reload"]) => Reply::text(405, "method not allowed"),

        _ => Reply::text(404, "not found"),
    }
}

fn unix_ms(t: Option<SystemTime>) -> serde_json::Value {
    match t {
        Some(t) => serde_json::json!(t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64),
        None => serde_json::Value::Null,
    }
}

fn status_json(s: &ProbeStatus) -> serde_json::Value {
    serde_json::json!({
        "group": s.target.group,
        "target": s.target.target,
        "address": s.target.address,
        "phase": s.phase.as_str(),
        "last_success_at": unix_ms(s.state.last_success_at),
        "last_error_at": unix_ms(s.state.last_error_at),
        "last_error": s.state.last_error,
        "consecutive_failures": s.state.consecutive_failures,
        "last_generation": s.state.last_generation,
        "consecutive_stale": s.state.consecutive_stale,
        "polls_total": s.state.polls_total,
        "entries_applied": s.state.entries_applied,
    })
}
