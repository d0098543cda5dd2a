//! Log-entry payload types.
//!
//! A client write becomes a [`SqlCommand`] wrapping the compressed batch
//! text; the command is bincode-framed as a [`LogCommand`] for the raft log
//! and stays byte-identical on every node once committed. Membership changes
//! carry a [`JoinRequest`] instead, tucked into the conf-change context.

use serde_derive::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::engine::SqlEngine;

/// Name under which SQL batch commands appear in the log and in logging.
pub const SQL_COMMAND_NAME: &str = "sql";

/// Every payload that travels through the replicated log as a normal entry.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum LogCommand {
    Sql(SqlCommand),
}

/// A compressed SQL batch. Compression is purely a size optimization and is
/// reversed losslessly before execution.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SqlCommand {
    pub query: Vec<u8>,
}

impl SqlCommand {
    pub fn new(raw: &[u8]) -> Result<SqlCommand, CodecError> {
        Ok(SqlCommand {
            query: codec::deflate(raw)?,
        })
    }

    /// Decompresses the batch, executes it on the node's engine, and formats
    /// the result the way clients see it. Statement failures are part of the
    /// formatted output; only a corrupt payload or engine stderr is a hard
    /// error.
    pub fn apply(&self, engine: &mut SqlEngine) -> Result<Vec<u8>, String> {
        let raw = codec::inflate(&self.query)
            .map_err(|e| format!("rejected {} command: {}", SQL_COMMAND_NAME, e))?;
        let text = String::from_utf8_lossy(&raw);
        let output = engine.execute(&text);
        if !output.stderr.is_empty() {
            return Err(String::from_utf8_lossy(&output.stderr).into_owned());
        }

        let mut formatted = format!("SequenceNumber: {}\n", output.sequence_number).into_bytes();
        formatted.extend_from_slice(&output.stdout);
        Ok(formatted)
    }
}

/// Membership-change payload: JSON on `POST /join`, bincode inside the
/// conf-change entry context so every node learns the joiner's address.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub name: String,
    pub connection_string: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_formats_sequence_header_and_rows() {
        let mut engine = SqlEngine::new().unwrap();
        let cmd =
            SqlCommand::new(b"CREATE TABLE t(a,b,c,d);INSERT INTO t VALUES(1,2,3,4);SELECT * FROM t")
                .unwrap();
        let result = cmd.apply(&mut engine).unwrap();
        assert_eq!(String::from_utf8(result).unwrap(), "SequenceNumber: 0\n1|2|3|4\n");

        // Replaying the same command against the same engine sees the
        // cumulative table state and the next sequence number.
        let result = cmd.apply(&mut engine).unwrap();
        assert!(String::from_utf8(result)
            .unwrap()
            .starts_with("SequenceNumber: 1\n"));
    }

    #[test]
    fn apply_rejects_corrupt_payload() {
        let mut engine = SqlEngine::new().unwrap();
        let cmd = SqlCommand {
            query: b"not compressed at all".to_vec(),
        };
        let err = cmd.apply(&mut engine).unwrap_err();
        assert!(err.contains("rejected sql command"));
    }

    #[test]
    fn log_command_round_trips_through_bincode() {
        let cmd = SqlCommand::new(b"SELECT 1, 2, 3, 4").unwrap();
        let framed = bincode::serialize(&LogCommand::Sql(cmd.clone())).unwrap();
        let LogCommand::Sql(decoded) = bincode::deserialize(&framed).unwrap();
        assert_eq!(decoded.query, cmd.query);
    }

    #[test]
    fn join_request_uses_camel_case_on_the_wire() {
        let request = JoinRequest {
            name: "127.0.0.1:4001".to_string(),
            connection_string: "http://127.0.0.1:5001".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"connectionString\""));
        assert_eq!(serde_json::from_str::<JoinRequest>(&json).unwrap(), request);
    }
}
