//! Client-facing HTTP surface.
//!
//! `POST /sql` is the only user-facing write entry point; its body is raw
//! SQL text, not JSON. A non-leader node answers it with a redirect to the
//! leader's `/forward` endpoint, carrying the compressed body as a URL-safe
//! query parameter so the original request content survives the hop
//! byte-for-byte. `POST /join` accepts membership changes, and `/metrics`
//! exposes the Prometheus registry.

use hyper::header::{HOST, LOCATION};
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

use raft::eraftpb::{ConfChange, ConfChangeType};

use crate::codec;
use crate::command::{JoinRequest, LogCommand, SqlCommand};
use crate::config::{self, RuntimeConfig};
use crate::metrics;
use crate::raft::node::ConsensusHandle;

const LEADER_POLL_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_millis(50);

pub struct ApiContext {
    pub config: RuntimeConfig,
    pub consensus: ConsensusHandle,
}

pub async fn handle(
    ctx: Arc<ApiContext>,
    req: Request<Body>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/sql") => sql_handler(ctx, req).await,
        (&Method::GET, "/forward") => forward_handler(ctx, req).await,
        (&Method::POST, "/join") => join_handler(ctx, req).await,
        (&Method::GET, "/metrics") => Ok(metrics_response()),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "no such resource\n")),
    }
}

/// The user-facing write path: execute locally when leading, otherwise
/// redirect the client to the leader with the body safely encoded.
async fn sql_handler(
    ctx: Arc<ApiContext>,
    req: Request<Body>,
) -> Result<Response<Body>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(&ctx.config.listen)
        .to_string();
    let body = hyper::body::to_bytes(req.into_body()).await?;
    log::debug!(
        "[{:?}] received query: {:?}",
        ctx.consensus.state(),
        String::from_utf8_lossy(&body)
    );

    let Some(leader) = wait_for_leader(&ctx).await else {
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no leader elected\n",
        ));
    };

    if leader != ctx.config.id {
        return Ok(redirect_to_leader(&ctx, leader, &host, &body));
    }
    submit_sql(&ctx, &body).await
}

/// Leader-side target of a redirect: decode and execute exactly as a direct
/// submission. Leadership is not re-verified here; if it moved between
/// redirect and arrival the consensus engine rejects the submission.
async fn forward_handler(
    ctx: Arc<ApiContext>,
    req: Request<Body>,
) -> Result<Response<Body>, hyper::Error> {
    let Some(encoded) = req.uri().query().and_then(forward_query) else {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "missing query parameter\n",
        ));
    };

    let decoded = codec::url_decode(encoded).and_then(|compressed| codec::inflate(&compressed));
    let body = match decoded {
        Ok(body) => body,
        Err(e) => {
            metrics::SQL_REQUEST_COUNTER
                .with_label_values(&["rejected"])
                .inc();
            return Ok(text_response(StatusCode::BAD_REQUEST, &format!("{}\n", e)));
        }
    };
    log::debug!(
        "[{:?}] received forwarded query: {:?}",
        ctx.consensus.state(),
        String::from_utf8_lossy(&body)
    );
    submit_sql(&ctx, &body).await
}

/// Accepts a join request and submits it as a configuration change.
async fn join_handler(
    ctx: Arc<ApiContext>,
    req: Request<Body>,
) -> Result<Response<Body>, hyper::Error> {
    let body = hyper::body::to_bytes(req.into_body()).await?;
    let join: JoinRequest = match serde_json::from_slice(&body) {
        Ok(join) => join,
        Err(e) => {
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("malformed join request: {}\n", e),
            ));
        }
    };

    let Some(peer) = ctx.config.node_by_name(&join.name) else {
        return Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("unknown node name: {}\n", join.name),
        ));
    };

    let mut cc = ConfChange::default();
    cc.node_id = peer.id;
    cc.set_change_type(ConfChangeType::AddNode);
    match bincode::serialize(&join) {
        Ok(context) => cc.set_context(context.into()),
        Err(e) => {
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("{}\n", e),
            ));
        }
    }

    let started = Instant::now();
    match ctx.consensus.submit_conf_change(cc).await {
        Ok(_) => {
            metrics::SUBMIT_HISTOGRAM
                .with_label_values(&["join"])
                .observe(started.elapsed().as_secs_f64());
            log::info!("accepted join of {} as node {}", join.name, peer.id);
            Ok(Response::new(Body::empty()))
        }
        Err(e) => Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("{}\n", e),
        )),
    }
}

/// Blocks until consensus reports a leader, polling every 50ms; bounded only
/// by the optional configured timeout.
async fn wait_for_leader(ctx: &ApiContext) -> Option<u64> {
    let deadline = ctx
        .config
        .leader_wait_timeout_ms
        .map(|ms| tokio::time::Instant::now() + tokio::time::Duration::from_millis(ms));
    loop {
        if let Some(leader) = ctx.consensus.leader() {
            return Some(leader);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
        }
        tokio::time::sleep(LEADER_POLL_INTERVAL).await;
    }
}

fn redirect_to_leader(
    ctx: &ApiContext,
    leader: u64,
    request_host: &str,
    body: &[u8],
) -> Response<Body> {
    let Some(peer) = ctx.config.node(leader) else {
        return text_response(
            StatusCode::BAD_GATEWAY,
            &format!("leader {} is not in the node list\n", leader),
        );
    };
    let encoded = match codec::deflate(body) {
        Ok(compressed) => codec::url_encode(&compressed),
        Err(e) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}\n", e));
        }
    };

    let host = leader_host(request_host, &ctx.config.listen, &peer.listen);
    let location = format!("http://{}/forward?query={}", host, encoded);
    log::info!("redirecting to {}", location);
    metrics::SQL_REQUEST_COUNTER
        .with_label_values(&["redirected"])
        .inc();

    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(Body::empty())
        .unwrap()
}

/// Frames the body as a replicated command, submits it, and waits for the
/// applied result.
async fn submit_sql(ctx: &ApiContext, body: &[u8]) -> Result<Response<Body>, hyper::Error> {
    let framed = SqlCommand::new(body)
        .map_err(|e| e.to_string())
        .and_then(|cmd| bincode::serialize(&LogCommand::Sql(cmd)).map_err(|e| e.to_string()));
    let framed = match framed {
        Ok(framed) => framed,
        Err(e) => {
            metrics::SQL_REQUEST_COUNTER
                .with_label_values(&["rejected"])
                .inc();
            return Ok(text_response(StatusCode::BAD_REQUEST, &format!("{}\n", e)));
        }
    };

    let started = Instant::now();
    match ctx.consensus.submit(framed).await {
        Ok(result) => {
            metrics::SQL_REQUEST_COUNTER
                .with_label_values(&["applied"])
                .inc();
            metrics::SUBMIT_HISTOGRAM
                .with_label_values(&["sql"])
                .observe(started.elapsed().as_secs_f64());
            Ok(Response::new(Body::from(result)))
        }
        Err(e) => {
            metrics::SQL_REQUEST_COUNTER
                .with_label_values(&["rejected"])
                .inc();
            Ok(text_response(StatusCode::BAD_REQUEST, &format!("{}\n", e)))
        }
    }
}

/// Picks the `query` parameter out of a raw query string. The value is
/// URL-safe base64, so no percent-decoding is involved.
fn forward_query(raw_query: &str) -> Option<&str> {
    raw_query
        .split('&')
        .find_map(|pair| pair.strip_prefix("query="))
}

/// Rewrites the request Host header to point at the leader by substituting
/// the local node's name fragment with the leader's.
fn leader_host(request_host: &str, local_listen: &str, leader_listen: &str) -> String {
    let local_name = config::node_name(local_listen);
    let leader_name = config::node_name(leader_listen);
    request_host.replace(
        config::name_fragment(&local_name),
        config::name_fragment(&leader_name),
    )
}

fn metrics_response() -> Response<Body> {
    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY_INSTANCE.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}\n", e));
    }
    Response::new(Body::from(buffer))
}

fn text_response(status: StatusCode, text: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(text.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_host_substitutes_name_fragment() {
        assert_eq!(
            leader_host("127.0.0.1:4002", "127.0.0.1:4002", "127.0.0.1:4001"),
            "127.0.0.1:4001"
        );
        // Socket-path style names substitute only the stripped fragment.
        assert_eq!(
            leader_host("node1.example.test", "./node1.sock", "./node0.sock"),
            "node0.example.test"
        );
        // A host that does not mention the local name is left alone.
        assert_eq!(
            leader_host("unrelated:9999", "127.0.0.1:4002", "127.0.0.1:4001"),
            "unrelated:9999"
        );
    }

    #[test]
    fn forward_query_finds_parameter() {
        assert_eq!(forward_query("query=abc123="), Some("abc123="));
        assert_eq!(forward_query("other=1&query=xyz"), Some("xyz"));
        assert_eq!(forward_query("other=1"), None);
    }

    #[test]
    fn redirect_parameter_round_trips_request_body() {
        let body = b"INSERT INTO t VALUES('a;b', 1, 2, 'c')";
        let encoded = codec::url_encode(&codec::deflate(body).unwrap());
        let recovered = codec::url_decode(&encoded)
            .and_then(|compressed| codec::inflate(&compressed))
            .unwrap();
        assert_eq!(recovered, body);
    }
}
