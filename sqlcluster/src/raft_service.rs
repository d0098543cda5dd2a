//! Inbound raft message transport.
//!
//! Peers push serialized raft messages here; they are handed straight to the
//! drive loop's mailbox. The RPC surface is opaque plumbing for the
//! consensus engine and carries no client-visible semantics.

use pb::raft_service_server::RaftService;
use pb::{PostDataRequest, PostDataResponse, ResultCode};
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::sync::mpsc::Sender;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

pub struct RaftServiceSVC {
    in_mailbox: Sender<RaftMessage>,
}

impl RaftServiceSVC {
    pub fn new(in_mailbox: Sender<RaftMessage>) -> RaftServiceSVC {
        RaftServiceSVC { in_mailbox }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn post_data(
        &self,
        request: tonic::Request<PostDataRequest>,
    ) -> Result<tonic::Response<PostDataResponse>, tonic::Status> {
        let ret = match RaftMessage::parse_from_bytes(&request.into_inner().data) {
            Ok(message) => match self.in_mailbox.send(message).await {
                Ok(()) => ResultCode::Ok,
                Err(e) => {
                    log::warn!("raft mailbox closed: {}", e);
                    ResultCode::Fail
                }
            },
            Err(e) => {
                log::warn!("raft parse error: {}", e);
                ResultCode::Fail
            }
        };
        Ok(tonic::Response::new(PostDataResponse { ret: ret as i32 }))
    }
}
