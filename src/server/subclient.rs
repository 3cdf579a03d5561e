//! Per-probe receivers.
//!
//! A subclient owns one data acceptor, waits for its probe to dial in,
//! signals readiness, and then consumes the probe's newline-framed JSON
//! records until `<STOP>` or EOF. Its result is the JSON-shaped per-thread
//! aggregate the ingest client later merges.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use serde_json::{json, Map, Value};

use crate::comm::Acceptor;
use crate::errors::{CommError, SessionError};
use crate::utils::pid_tid_key;

/// Counter-and-condvar barrier capability handed to each subclient.
///
/// The ingest client owns the expected count; subclients only bump it.
#[derive(Clone, Default)]
pub struct ReadinessSignal {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl ReadinessSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let (count, condvar) = &*self.inner;
        *count.lock().unwrap() += 1;
        condvar.notify_all();
    }

    /// Block until `expected` notifications have arrived.
    pub fn wait_for(&self, expected: usize) {
        let (count, condvar) = &*self.inner;
        let mut accepted = count.lock().unwrap();
        while *accepted < expected {
            accepted = condvar.wait(accepted).unwrap();
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        *self.inner.0.lock().unwrap()
    }
}

pub struct Subclient {
    acceptor: Box<dyn Acceptor>,
    ready: ReadinessSignal,
    buf_size: usize,
}

impl Subclient {
    pub fn new(acceptor: Box<dyn Acceptor>, ready: ReadinessSignal, buf_size: usize) -> Self {
        Subclient {
            acceptor,
            ready,
            buf_size,
        }
    }

    pub fn dial_instructions(&self) -> String {
        self.acceptor.dial_instructions()
    }

    /// Accept the probe connection, signal readiness, and consume records
    /// until the probe finishes. Runs on its own thread.
    pub fn run(mut self) -> Result<Value, SessionError> {
        let mut connection = self.acceptor.accept(self.buf_size, None)?;
        self.ready.notify();

        let mut parser = RecordParser::new();
        loop {
            match connection.read_line() {
                Ok(line) => {
                    if line == "<STOP>" {
                        break;
                    }
                    if line.is_empty() {
                        continue;
                    }
                    parser.feed(&line)?;
                }
                Err(CommError::Closed) => break,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(parser.finish())
    }
}

/// Accumulates probe records into the per-thread result shape.
#[derive(Default)]
pub struct RecordParser {
    /// TIDs in observation order.
    tids: Vec<String>,
    /// tid → thread metadata (parent, tag, spawn callchains).
    meta: Map<String, Value>,
    /// chain id → frames, global across the stream.
    callchains: Map<String, Value>,
    /// pid_tid → accumulated sample fields.
    samples: Map<String, Value>,
    /// Callchains seen before their `syscall_meta` partner, by child tid.
    pending_chains: HashMap<String, Vec<String>>,
    chain_counter: u64,
}

impl RecordParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Result<(), SessionError> {
        let record: Value = serde_json::from_str(line)
            .map_err(|err| SessionError::Protocol(format!("malformed record: {}", err)))?;

        match field_str(&record, "type")?.as_str() {
            "syscall_meta" => self.feed_syscall_meta(&record),
            "syscall" => self.feed_syscall(&record),
            "sample" => self.feed_sample(&record),
            other => Err(SessionError::Protocol(format!(
                "unknown record type {:?}",
                other
            ))),
        }
    }

    fn feed_syscall_meta(&mut self, record: &Value) -> Result<(), SessionError> {
        let subtype = field_str(record, "subtype")?;
        let comm = field_str(record, "comm")?;
        let pid = field_str(record, "pid")?;
        let tid = field_str(record, "tid")?;
        let time = field_u64(record, "time")?;
        let ret_value = field_str(record, "ret_value")?;

        match subtype.as_str() {
            "new_proc" => {
                let child = ret_value;
                self.insert_thread(&child, json!(tid), &comm, &pid, time);
            }
            "execve" => {
                if self.meta.contains_key(&tid) {
                    self.meta.get_mut(&tid).unwrap()["tag"][0] = json!(comm);
                } else {
                    // The session root was forked before the probes started;
                    // its execve is the first time we see it.
                    self.insert_thread(&tid, Value::Null, &comm, &pid, time);
                }
            }
            "exit" => {
                if let Some(entry) = self.meta.get_mut(&tid) {
                    entry["tag"][3] = json!(time);
                }
            }
            other => {
                return Err(SessionError::Protocol(format!(
                    "unknown syscall_meta subtype {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn insert_thread(&mut self, tid: &str, parent: Value, comm: &str, pid: &str, time: u64) {
        if self.meta.contains_key(tid) {
            return;
        }
        let mut chains = Map::new();
        for chain_id in self.pending_chains.remove(tid).unwrap_or_default() {
            if let Some(frames) = self.callchains.get(&chain_id) {
                chains.insert(chain_id, frames.clone());
            }
        }
        self.tids.push(tid.to_string());
        self.meta.insert(
            tid.to_string(),
            json!({
                "parent": parent,
                "tag": [comm, format!("{}/{}", pid, tid), time, -1],
                "callchains": chains,
            }),
        );
    }

    fn feed_syscall(&mut self, record: &Value) -> Result<(), SessionError> {
        let ret_value = field_str(record, "ret_value")?;
        let callchain = record
            .get("callchain")
            .cloned()
            .ok_or_else(|| SessionError::Protocol("syscall record without callchain".into()))?;

        let chain_id = format!("chain_{}", self.chain_counter);
        self.chain_counter += 1;
        self.callchains.insert(chain_id.clone(), callchain);
        self.pending_chains.entry(ret_value).or_default().push(chain_id);
        Ok(())
    }

    fn feed_sample(&mut self, record: &Value) -> Result<(), SessionError> {
        let event_type = field_str(record, "event_type")?;
        let pid = field_u64(record, "pid")?;
        let tid = field_u64(record, "tid")?;
        let timestamp = field_u64(record, "timestamp")?;
        let period = field_u64(record, "period")?;

        let key = pid_tid_key(pid, tid);
        let entry = self
            .samples
            .entry(key)
            .or_insert_with(|| json!({ "first_time": Value::Null }));

        let first = &mut entry["first_time"];
        if first.is_null() || first.as_u64().unwrap_or(u64::MAX) > timestamp {
            *first = json!(timestamp);
        }

        match event_type.as_str() {
            "task-clock" => {
                let so_far = entry["sampled_time"].as_u64().unwrap_or(0);
                entry["sampled_time"] = json!(so_far + period);
            }
            "offcpu-time" => push_region(entry, "offcpu_regions", timestamp, period)?,
            other => push_region(entry, other, timestamp, period)?,
        }
        Ok(())
    }

    /// The accumulated per-thread result. Keys are only present for the
    /// record families actually seen, so a sample probe's result carries no
    /// thread-tree keys and vice versa.
    pub fn finish(self) -> Value {
        let mut result = Map::new();
        if !self.tids.is_empty() {
            result.insert(
                "syscall_meta".to_string(),
                json!([self.tids, self.meta]),
            );
        }
        if !self.callchains.is_empty() {
            result.insert("syscall".to_string(), Value::Object(self.callchains));
        }
        if !self.samples.is_empty() {
            result.insert("samples".to_string(), Value::Object(self.samples));
        }
        Value::Object(result)
    }
}

fn push_region(
    entry: &mut Value,
    field: &str,
    timestamp: u64,
    period: u64,
) -> Result<(), SessionError> {
    let slot = &mut entry[field];
    if slot.is_null() {
        *slot = json!([]);
    }
    // A probe reusing a scalar field name (e.g. an event called
    // "sampled_time") would otherwise corrupt the aggregate.
    match slot.as_array_mut() {
        Some(regions) => {
            regions.push(json!([timestamp, period]));
            Ok(())
        }
        None => Err(SessionError::Protocol(format!(
            "sample field {:?} clashes with a scalar aggregate",
            field
        ))),
    }
}

fn field_str(record: &Value, key: &str) -> Result<String, SessionError> {
    match record.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(SessionError::Protocol(format!(
            "record is missing field {:?}",
            key
        ))),
    }
}

fn field_u64(record: &Value, key: &str) -> Result<u64, SessionError> {
    let bad = || SessionError::Protocol(format!("record field {:?} is not a u64", key));
    match record.get(key) {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(bad),
        Some(Value::String(s)) => s.parse().map_err(|_| bad()),
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::PipeAcceptor;
    use std::thread;

    fn feed_all(parser: &mut RecordParser, lines: &[&str]) {
        for line in lines {
            parser.feed(line).unwrap();
        }
    }

    #[test]
    fn test_thread_tree_records() {
        let mut parser = RecordParser::new();
        feed_all(
            &mut parser,
            &[
                r#"{"type":"syscall","ret_value":"101","callchain":[["a",""],["b",""]]}"#,
                r#"{"type":"syscall_meta","subtype":"new_proc","comm":"sh","pid":"100","tid":"100","time":42,"ret_value":"101"}"#,
                r#"{"type":"syscall_meta","subtype":"execve","comm":"work","pid":"100","tid":"101","time":50,"ret_value":"0"}"#,
                r#"{"type":"syscall_meta","subtype":"exit","comm":"work","pid":"100","tid":"101","time":90,"ret_value":"0"}"#,
            ],
        );
        let result = parser.finish();

        assert_eq!(result["syscall_meta"][0], json!(["101"]));
        let meta = &result["syscall_meta"][1]["101"];
        assert_eq!(meta["parent"], "100");
        assert_eq!(meta["tag"], json!(["work", "100/101", 42, 90]));
        assert_eq!(meta["callchains"]["chain_0"], json!([["a", ""], ["b", ""]]));
        assert_eq!(result["syscall"]["chain_0"], json!([["a", ""], ["b", ""]]));
    }

    #[test]
    fn test_root_execve_creates_entry() {
        let mut parser = RecordParser::new();
        feed_all(
            &mut parser,
            &[
                r#"{"type":"syscall_meta","subtype":"execve","comm":"app","pid":"200","tid":"200","time":5,"ret_value":"0"}"#,
            ],
        );
        let result = parser.finish();
        let meta = &result["syscall_meta"][1]["200"];
        assert_eq!(meta["parent"], Value::Null);
        assert_eq!(meta["tag"], json!(["app", "200/200", 5, -1]));
    }

    #[test]
    fn test_sample_accumulation() {
        let mut parser = RecordParser::new();
        feed_all(
            &mut parser,
            &[
                r#"{"type":"sample","event_type":"task-clock","pid":"7","tid":"8","timestamp":1000,"period":100}"#,
                r#"{"type":"sample","event_type":"task-clock","pid":"7","tid":"8","timestamp":900,"period":50}"#,
                r#"{"type":"sample","event_type":"offcpu-time","pid":"7","tid":"8","timestamp":1200,"period":30}"#,
                r#"{"type":"sample","event_type":"cycles","pid":"7","tid":"8","timestamp":1300,"period":1000000}"#,
            ],
        );
        let result = parser.finish();
        let entry = &result["samples"]["7_8"];
        assert_eq!(entry["sampled_time"], 150);
        assert_eq!(entry["first_time"], 900);
        assert_eq!(entry["offcpu_regions"], json!([[1200, 30]]));
        assert_eq!(entry["cycles"], json!([[1300, 1000000]]));
        assert!(result.get("syscall_meta").is_none());
    }

    #[test]
    fn test_malformed_record_is_protocol_error() {
        let mut parser = RecordParser::new();
        assert!(matches!(
            parser.feed("not json"),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            parser.feed(r#"{"type":"widget"}"#),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_subclient_notifies_and_returns_result() {
        let acceptor = PipeAcceptor::new().unwrap();
        let instructions = acceptor.dial_instructions();
        let ready = ReadinessSignal::new();
        let subclient = Subclient::new(Box::new(acceptor), ready.clone(), 1024);

        let peer = thread::spawn(move || {
            let mut conn = crate::comm::dial_pipe(&instructions, 64).unwrap();
            conn.write_line(
                r#"{"type":"sample","event_type":"task-clock","pid":"1","tid":"1","timestamp":10,"period":5}"#,
            )
            .unwrap();
            conn.write_line("<STOP>").unwrap();
        });

        let result = subclient.run().unwrap();
        peer.join().unwrap();
        assert_eq!(ready.count(), 1);
        assert_eq!(result["samples"]["1_1"]["sampled_time"], 5);
    }
}
