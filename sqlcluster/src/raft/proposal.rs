use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use raft::prelude::*;

/// Outcome delivered to a submitter once its entry is applied (or fails).
pub type ProposalResult = Result<Vec<u8>, String>;

pub struct Proposal {
    pub normal: Option<Vec<u8>>,
    pub conf_change: Option<ConfChange>,
    /// Log index assigned when the entry was accepted by the leader.
    pub proposed: u64,
    pub responder: Option<Sender<ProposalResult>>,
}

impl Proposal {
    pub fn normal(data: Vec<u8>) -> (Self, Receiver<ProposalResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: Some(data),
            conf_change: None,
            proposed: 0,
            responder: Some(tx),
        };
        (proposal, rx)
    }

    pub fn conf_change(cc: &ConfChange) -> (Self, Receiver<ProposalResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: None,
            conf_change: Some(cc.clone()),
            proposed: 0,
            responder: Some(tx),
        };
        (proposal, rx)
    }

    pub fn respond(&mut self, result: ProposalResult) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(result);
        }
    }
}
