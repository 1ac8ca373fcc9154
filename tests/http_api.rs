// tests/http_api.rs
//
// Real HTTP on both sides:
// - a tiny_http stand-in sidecar serving /v1/snapshots;
// - HttpSidecarClient against it (ok / non-2xx / malformed / refused);
// - the query router over a registry fed by a live probe.

mod common;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tiny_http::{Method, Response, Server};

use snaptracker::server::{route, ApiContext};
use snaptracker::{HttpSidecarClient, Manager, Registry, SidecarClient, Target, TargetSet};

use common::{fast_settings, wait_until};

struct FakeSidecar {
    server: Arc<Server>,
    addr: String,
    handle: Option<JoinHandle<()>>,
}

impl FakeSidecar {
    /// Serve `body` with `status` on every request.
    fn start(status: u16, body: &'static str) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind fake sidecar"));
        let addr = server.server_addr().to_ip().expect("ip listener").to_string();
        let srv = server.clone();
        let handle = thread::spawn(move || {
            for rq in srv.incoming_requests() {
                let resp = if rq.url() == "/v1/snapshots" {
                    Response::from_string(body).with_status_code(status)
                } else {
                    Response::from_string("not found").with_status_code(404)
                };
                let _ = rq.respond(resp);
            }
        });
        Self { server, addr, handle: Some(handle) }
    }
}

impl Drop for FakeSidecar {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

const LISTING: &str = r#"{
  "generation": 3,
  "snapshots": [
    {"group":"mainnet","target":"full","slot":120,"base_slot":0,"info":{"size":1024,"hash":"abc"}},
    {"group":"mainnet","target":"full","slot":100,"info":{"size":900}}
  ]
}"#;

fn client() -> HttpSidecarClient {
    HttpSidecarClient::new(Duration::from_millis(500)).unwrap()
}

#[test]
fn http_client_parses_listing() {
    let side = FakeSidecar::start(200, LISTING);
    let t = Target::new("mainnet", "full", &side.addr);
    let l = client().fetch(&t, Duration::from_secs(2)).unwrap();
    assert_eq!(l.generation, Some(3));
    assert_eq!(l.records.len(), 2);
    assert_eq!(l.records[0].info["hash"], "abc");
}

#[test]
fn http_client_accepts_full_url_address() {
    let side = FakeSidecar::start(200, "[]");
    let t = Target::new("mainnet", "full", &format!("http://{}/", side.addr));
    let l = client().fetch(&t, Duration::from_secs(2)).unwrap();
    assert!(l.records.is_empty());
}

#[test]
fn http_client_failures() {
    let bad_status = FakeSidecar::start(503, "[]");
    let t = Target::new("g", "t", &bad_status.addr);
    let err = client().fetch(&t, Duration::from_secs(2)).unwrap_err();
    assert!(format!("{:#}", err).contains("503"));

    let garbage = FakeSidecar::start(200, "<html>");
    let t = Target::new("g", "t", &garbage.addr);
    assert!(client().fetch(&t, Duration::from_secs(2)).is_err());

    // Nothing listens on the port once the sidecar is gone.
    let addr = {
        let gone = FakeSidecar::start(200, "[]");
        gone.addr.clone()
    };
    let t = Target::new("g", "t", &addr);
    assert!(client().fetch(&t, Duration::from_secs(2)).is_err());
}

#[test]
fn query_routes_over_live_probe() {
    let side = FakeSidecar::start(200, LISTING);
    let registry = Arc::new(Registry::new());
    let manager = Arc::new(Manager::new(registry.clone(), Arc::new(client()), fast_settings()));
    let target = Target::new("mainnet", "full", &side.addr);
    manager.reconcile(&TargetSet::from_targets(vec![target]));
    assert!(wait_until(Duration::from_secs(5), || registry.len() == 2));

    let ctx = ApiContext { registry: registry.clone(), manager: manager.clone(), reload: None };

    let r = route(&ctx, &Method::Get, "/v1/snapshots/mainnet/full/latest");
    assert_eq!(r.status, 200);
    let v: serde_json::Value = serde_json::from_str(&r.body).unwrap();
    assert_eq!(v["slot"], 120);
    assert_eq!(v["source"], side.addr.as_str());
    assert_eq!(v["info"]["size"], 1024);

    let r = route(&ctx, &Method::Get, "/v1/snapshots/mainnet");
    let v: serde_json::Value = serde_json::from_str(&r.body).unwrap();
    let slots: Vec<u64> = v.as_array().unwrap().iter().map(|e| e["slot"].as_u64().unwrap()).collect();
    assert_eq!(slots, vec![120, 100]);

    let r = route(&ctx, &Method::Get, "/v1/snapshots/mainnet/incremental/latest");
    assert_eq!(r.status, 404);

    let r = route(&ctx, &Method::Get, "/v1/snapshots/devnet?x=1");
    assert_eq!(r.status, 200);
    assert_eq!(r.body, "[]");

    let r = route(&ctx, &Method::Get, "/v1/groups");
    assert_eq!(r.body, r#"["mainnet"]"#);

    let r = route(&ctx, &Method::Get, "/v1/probes");
    let v: serde_json::Value = serde_json::from_str(&r.body).unwrap();
    assert_eq!(v[0]["consecutive_failures"], 0);
    assert_eq!(v[0]["last_generation"], 3);
    assert_eq!(v[0]["consecutive_stale"], 0);

    assert_eq!(route(&ctx, &Method::Get, "/health").status, 200);
    assert_eq!(route(&ctx, &Method::Get, "/reload").status, 405);
    assert_eq!(route(&ctx, &Method::Post, "/reload").status, 503);
    assert_eq!(route(&ctx, &Method::Get, "/nope").status, 404);

    let m = route(&ctx, &Method::Get, "/metrics");
    assert!(m.body.contains("snaptracker_registry_entries 2"));

    manager.shutdown();
}

#[test]
fn failing_sidecar_shows_in_probe_health() {
    let side = FakeSidecar::start(500, "boom");
    let registry = Arc::new(Registry::new());
    let manager = Arc::new(Manager::new(registry.clone(), Arc::new(client()), fast_settings()));
    let target = Target::new("g", "t", &side.addr);
    manager.reconcile(&TargetSet::from_targets(vec![target.clone()]));

    assert!(wait_until(Duration::from_secs(5), || {
        manager.probe_state(&target).map(|s| s.consecutive_failures).unwrap_or(0) >= 2
    }));
    let st = manager.probe_state(&target).unwrap();
    assert!(st.last_error.unwrap().contains("500"));
    assert!(registry.is_empty());

    manager.shutdown();
}
