//! Embedded SQL batch executor.
//!
//! Each node owns exactly one in-memory SQLite instance. Committed command
//! batches are executed here, statement by statement, and the normalized
//! output is what gets returned to the submitting client. Because every node
//! applies the identical committed sequence, the output of this module must
//! be a pure function of prior batches plus the batch text.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row};
use std::collections::HashMap;

/// Result of executing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Counter value observed by this call; the first batch on a fresh
    /// engine reports 0.
    pub sequence_number: u64,
}

/// One embedded SQLite instance plus the per-node batch counter.
pub struct SqlEngine {
    conn: Connection,
    sequence_number: u64,
}

impl SqlEngine {
    pub fn new() -> Result<SqlEngine, rusqlite::Error> {
        Ok(SqlEngine {
            conn: Connection::open_in_memory()?,
            sequence_number: 0,
        })
    }

    /// Executes a `;`-delimited batch of statements in order.
    ///
    /// The split is purely textual and does not understand string literals;
    /// statements that split to the empty string are skipped without
    /// consuming a line number. A failing statement is folded into the
    /// output as an error line and never aborts the rest of the batch.
    /// The counter increments exactly once per call, success or failure.
    pub fn execute(&mut self, batch: &str) -> SqlOutput {
        let mut output = String::new();
        for (position, statement) in batch.split(';').enumerate() {
            if statement.is_empty() {
                continue;
            }
            output.push_str(&self.run_statement(position + 1, statement));
        }
        let output = filter_errors(&output);

        let sequence_number = self.sequence_number;
        self.sequence_number += 1;

        SqlOutput {
            stdout: output.into_bytes(),
            stderr: Vec::new(),
            sequence_number,
        }
    }

    /// Count of batches executed so far on this engine.
    pub fn applied(&self) -> u64 {
        self.sequence_number
    }

    fn run_statement(&self, line: usize, statement: &str) -> String {
        let mut stmt = match self.conn.prepare(statement) {
            Ok(stmt) => stmt,
            Err(e) => return error_line(line, &e.to_string()),
        };

        let mut out = String::new();
        let mut rows = match stmt.query([]) {
            Ok(rows) => rows,
            Err(e) => return error_line(line, &e.to_string()),
        };
        loop {
            match rows.next() {
                Ok(Some(row)) => {
                    out.push_str(&format!(
                        "{}|{}|{}|{}\n",
                        column_text(row, 0),
                        column_int(row, 1),
                        column_int(row, 2),
                        column_text(row, 3),
                    ));
                }
                Ok(None) => break,
                Err(e) => {
                    out.push_str(&error_line(line, &e.to_string()));
                    break;
                }
            }
        }
        out
    }
}

/// Renders a column as text, tolerating type mismatches and short rows:
/// anything unreadable becomes the default value.
fn column_text(row: &Row<'_>, idx: usize) -> String {
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => v.to_string(),
        Ok(ValueRef::Real(v)) => v.to_string(),
        Ok(ValueRef::Text(v)) | Ok(ValueRef::Blob(v)) => String::from_utf8_lossy(v).into_owned(),
        _ => String::new(),
    }
}

fn column_int(row: &Row<'_>, idx: usize) -> i64 {
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => v,
        Ok(ValueRef::Real(v)) => v as i64,
        Ok(ValueRef::Text(v)) => std::str::from_utf8(v)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        _ => 0,
    }
}

fn error_line(line: usize, message: &str) -> String {
    let message = message.strip_prefix("sqlite3: ").unwrap_or(message);
    format!("Error: near line {}: {}\n", line, message)
}

/// Deduplicates error output by trailing code token.
///
/// Only applies when the combined output begins with `"Error: "`. Each line
/// is split at its last space; the tail is the code, the head the text. A
/// repeated code overwrites the text stored at the code's first position
/// instead of adding a line, so the result keeps first-seen code order with
/// last-seen text. Lines without a space are dropped.
fn filter_errors(output: &str) -> String {
    if !output.starts_with("Error: ") {
        return output.to_string();
    }

    let lines: Vec<&str> = output.split('\n').collect();
    let mut stored: Vec<String> = vec![String::new(); lines.len()];
    let mut codes: HashMap<&str, usize> = HashMap::new();
    let mut count = 0;

    for line in &lines {
        let Some(sep) = line.rfind(' ') else {
            continue;
        };
        let text = &line[..sep];
        let code = &line[sep + 1..];
        match codes.get(code) {
            Some(&first) => stored[first] = text.to_string(),
            None => {
                stored[count] = text.to_string();
                codes.insert(code, count);
                count += 1;
            }
        }
    }

    let mut result = String::new();
    for text in &stored {
        if !text.is_empty() {
            result.push_str(text);
            result.push('\n');
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(output: &SqlOutput) -> String {
        String::from_utf8(output.stdout.clone()).unwrap()
    }

    #[test]
    fn batch_runs_to_completion() {
        let mut engine = SqlEngine::new().unwrap();
        let out =
            engine.execute("CREATE TABLE t(a,b,c,d);INSERT INTO t VALUES(1,2,3,4);SELECT * FROM t");
        assert_eq!(stdout(&out), "1|2|3|4\n");
        assert_eq!(out.sequence_number, 0);
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn four_columns_in_fixed_order() {
        let mut engine = SqlEngine::new().unwrap();
        let out = engine.execute("SELECT 'a', 1, 2, 'b'");
        assert_eq!(stdout(&out), "a|1|2|b\n");

        // Integers render as text in the string positions.
        let out = engine.execute("SELECT 5, 1, 2, 'x'");
        assert_eq!(stdout(&out), "5|1|2|x\n");
    }

    #[test]
    fn failing_statement_does_not_abort_batch() {
        let mut engine = SqlEngine::new().unwrap();
        let out = engine.execute("NOT EVEN SQL;CREATE TABLE t(a,b,c,d);INSERT INTO t VALUES(1,2,3,4)");
        assert!(stdout(&out).starts_with("Error: near line 1:"));

        // The later statements still ran.
        let out = engine.execute("SELECT * FROM t");
        assert_eq!(stdout(&out), "1|2|3|4\n");
    }

    #[test]
    fn empty_statements_skipped_but_positions_counted() {
        let mut engine = SqlEngine::new().unwrap();
        let out = engine.execute("CREATE TABLE t(a,b,c,d);;INSERT INTO t VALUES(1,2,3,4);SELECT * FROM nope");
        assert!(stdout(&out).starts_with("Error: near line 4:"));
    }

    #[test]
    fn sequence_counts_every_call() {
        let mut engine = SqlEngine::new().unwrap();
        assert_eq!(engine.execute("CREATE TABLE t(a,b,c,d)").sequence_number, 0);
        assert_eq!(engine.execute("TOTALLY BOGUS").sequence_number, 1);
        assert_eq!(engine.execute(";;;").sequence_number, 2);
        assert_eq!(engine.applied(), 3);
    }

    #[test]
    fn independent_engines_produce_identical_output() {
        let batches = [
            "CREATE TABLE t(a,b,c,d)",
            "INSERT INTO t VALUES(1,2,3,4);INSERT INTO t VALUES('x',5,6,'y')",
            "SELECT * FROM missing_table",
            "SELECT * FROM t",
        ];
        let mut first = SqlEngine::new().unwrap();
        let mut second = SqlEngine::new().unwrap();
        for batch in batches {
            assert_eq!(first.execute(batch), second.execute(batch));
        }
    }

    #[test]
    fn filter_errors_dedups_by_trailing_code() {
        let out = filter_errors("Error: foo 1\nError: bar 2\nError: baz 1\n");
        assert_eq!(out, "Error: baz\nError: bar\n");
    }

    #[test]
    fn filter_errors_passthrough_without_error_prefix() {
        assert_eq!(filter_errors("1|2|3|4\n"), "1|2|3|4\n");
        assert_eq!(filter_errors(""), "");
    }

    #[test]
    fn filter_errors_keeps_first_seen_order() {
        let out = filter_errors("Error: a 9\nError: b 8\nError: c 9\nError: d 8\n");
        assert_eq!(out, "Error: c\nError: d\n");
    }
}
