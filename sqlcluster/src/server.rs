//! Per-node wiring.
//!
//! A `Server` owns everything one cluster node needs: the consensus handle,
//! the inbound raft mailbox, and the listeners. It is deliberately not a
//! process-wide singleton so several nodes can coexist in one test process.

use anyhow::{bail, Context};
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request};
use raft::eraftpb::Message;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Duration;

use crate::api::{self, ApiContext};
use crate::command::JoinRequest;
use crate::config::RuntimeConfig;
use crate::metrics;
use crate::raft::node::{ConsensusHandle, Node};
use crate::raft::storage::DiskStorage;
use crate::raft_client::{PeerRegistry, RaftClient};
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;
use crate::state::SqlState;

const JOIN_ATTEMPTS: u32 = 10;
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct Server {
    config: RuntimeConfig,
    consensus: ConsensusHandle,
    in_mailbox: Sender<Message>,
}

impl Server {
    /// Builds the node: opens the engine and the raft log, starts the drive
    /// task, and hooks up the outbound message pump. Fails fast when a fresh
    /// join is requested over a non-empty log.
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Server> {
        let log_empty = DiskStorage::log_is_empty(&config.data_path);
        if config.join.is_some() && !log_empty {
            bail!("cannot join with an existing log");
        }

        let state = SqlState::new().context("failed to open embedded sql engine")?;
        let registry = PeerRegistry::default();
        let (in_tx, in_rx) = mpsc::channel(1000);

        let (consensus, out_mailbox) = Node::start_raft(
            config.id,
            config.join.is_none(),
            &config.data_path,
            state,
            in_rx,
            registry.clone(),
        )?;
        Self::start_message_pump(
            out_mailbox,
            RaftClient::new(registry, config.node_list.clone()),
        );

        Ok(Server {
            config,
            consensus,
            in_mailbox: in_tx,
        })
    }

    /// Starts the listeners and performs cluster membership bootstrap.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.start_raft_server()?;
        self.start_api_server()?;
        self.bootstrap_membership().await
    }

    pub fn stop(&self) {
        log::info!("server stop");
    }

    fn start_raft_server(&self) -> anyhow::Result<()> {
        let addr = self
            .config
            .raft_addr
            .parse()
            .context("invalid raft listen address")?;
        let raft_service = RaftServiceSVC::new(self.in_mailbox.clone());
        let server = tonic::transport::Server::builder()
            .add_service(RaftServiceServer::new(raft_service))
            .serve(addr);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("raft server terminated: {}", e);
            }
        });
        log::info!("raft server started on {}", addr);
        Ok(())
    }

    fn start_api_server(&self) -> anyhow::Result<()> {
        metrics::init_registry();
        let addr = self
            .config
            .listen
            .parse()
            .context("invalid client listen address")?;
        let ctx = Arc::new(ApiContext {
            config: self.config.clone(),
            consensus: self.consensus.clone(),
        });
        let make_svc = make_service_fn(move |_| {
            let ctx = ctx.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| api::handle(ctx.clone(), req)))
            }
        });
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("api server terminated: {}", e);
            }
        });
        log::info!("api server started on {}", addr);
        Ok(())
    }

    /// Drains the drive loop's outbound mailbox into the peer transport.
    fn start_message_pump(mut out_mailbox: Receiver<Message>, mut client: RaftClient) {
        tokio::spawn(async move {
            while let Some(message) = out_mailbox.recv().await {
                client.post_data(message).await;
            }
        });
    }

    /// Join an existing cluster when a leader address was given (retrying,
    /// fatal on exhaustion), otherwise bootstrap a fresh single-node cluster
    /// or recover from the local log.
    async fn bootstrap_membership(&self) -> anyhow::Result<()> {
        if let Some(leader) = self.config.join.clone() {
            log::info!("attempting to join leader: {}", leader);
            let mut last_error = None;
            for attempt in 0..JOIN_ATTEMPTS {
                match self.join(&leader).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        log::info!("join attempt {} failed; sleeping", attempt);
                        last_error = Some(e);
                    }
                }
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
            }
            Err(last_error.unwrap()).context("exhausted join attempts")
        } else if self.consensus.is_log_empty() {
            log::info!("initializing new cluster");
            Ok(())
        } else {
            log::info!("recovered from log");
            Ok(())
        }
    }

    async fn join(&self, leader: &str) -> anyhow::Result<()> {
        let request = JoinRequest {
            name: self.config.name(),
            connection_string: self.config.connection_string(),
        };
        let body = serde_json::to_vec(&request)?;

        let client = hyper::Client::new();
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}/join", leader))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))?;
        let response = client.request(req).await?;
        if !response.status().is_success() {
            let text = hyper::body::to_bytes(response.into_body()).await?;
            bail!("join rejected: {}", String::from_utf8_lossy(&text).trim_end());
        }
        Ok(())
    }
}
