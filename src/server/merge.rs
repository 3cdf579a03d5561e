//! Merging subclient results into the session output tree.
//!
//! Results are merged in subclient-creation order. The thread-tree probe
//! supplies real thread records; any `pid_tid` seen only by sample probes
//! gets a synthetic placeholder entry. Off-CPU region timestamps are
//! rebased against the session epoch after everything is merged.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::thread;

use serde_json::{json, Map, Value};

use crate::errors::SessionError;
use crate::utils::split_pid_tid;

/// The consolidated session output: shared metadata plus per-thread event
/// counters.
pub struct MergedOutput {
    pub metadata: Value,
    pub final_output: Map<String, Value>,
}

/// Merge per-subclient results and rebase off-CPU timestamps to `epoch`.
pub fn merge(results: &[Value], epoch: u64) -> Result<MergedOutput, SessionError> {
    let mut metadata = json!({
        "thread_tree": [],
        "callchains": {},
        "offcpu_regions": {},
        "sampled_times": {},
    });
    let mut final_output = Map::new();
    let mut known_tids: HashSet<String> = HashSet::new();

    for result in results {
        let Some(entries) = result.as_object() else {
            return Err(SessionError::Protocol(
                "subclient result is not an object".to_string(),
            ));
        };

        if let Some(tree) = entries.get("syscall_meta") {
            let tids = tree
                .get(0)
                .and_then(Value::as_array)
                .ok_or_else(|| bad_shape("syscall_meta tid list"))?;
            let meta = tree
                .get(1)
                .and_then(Value::as_object)
                .ok_or_else(|| bad_shape("syscall_meta metadata"))?;
            for tid in tids {
                let tid_str = tid
                    .as_str()
                    .ok_or_else(|| bad_shape("syscall_meta tid"))?;
                let mut record = meta
                    .get(tid_str)
                    .cloned()
                    .ok_or_else(|| bad_shape("syscall_meta entry"))?;
                record["identifier"] = tid.clone();
                metadata["thread_tree"]
                    .as_array_mut()
                    .unwrap()
                    .push(record);
                known_tids.insert(tid_str.to_string());
            }
        }

        if let Some(chains) = entries.get("syscall").and_then(Value::as_object) {
            let merged = metadata["callchains"].as_object_mut().unwrap();
            for (chain_id, frames) in chains {
                if merged.contains_key(chain_id) {
                    return Err(SessionError::Protocol(format!(
                        "duplicate callchain id {:?} across probes",
                        chain_id
                    )));
                }
                merged.insert(chain_id.clone(), frames.clone());
            }
        }

        for (key, value) in entries {
            if !key.starts_with("sample") {
                continue;
            }
            let threads = value
                .as_object()
                .ok_or_else(|| bad_shape("sample entries"))?;
            for (pid_tid, fields) in threads {
                let Some((pid, tid)) = split_pid_tid(pid_tid) else {
                    return Err(SessionError::Protocol(format!(
                        "could not process PID/TID key {:?}",
                        pid_tid
                    )));
                };

                if !known_tids.contains(tid) {
                    known_tids.insert(tid.to_string());
                    metadata["thread_tree"].as_array_mut().unwrap().push(json!({
                        "identifier": tid,
                        "parent": null,
                        "tag": ["?", format!("{}/{}", pid, tid), -1, -1],
                    }));
                }

                let fields = fields
                    .as_object()
                    .ok_or_else(|| bad_shape("sample fields"))?;
                for (field, counter) in fields {
                    match field.as_str() {
                        "sampled_time" => {
                            metadata["sampled_times"][pid_tid] = counter.clone();
                        }
                        "offcpu_regions" => {
                            metadata["offcpu_regions"][pid_tid] = counter.clone();
                        }
                        "first_time" => {}
                        _ => {
                            final_output
                                .entry(pid_tid.clone())
                                .or_insert_with(|| Value::Object(Map::new()))
                                [field] = counter.clone();
                        }
                    }
                }
            }
        }
    }

    rebase_offcpu(&mut metadata, epoch)?;

    Ok(MergedOutput {
        metadata,
        final_output,
    })
}

/// Region starts arrive on the raw monotonic clock; output is relative to
/// the session epoch.
fn rebase_offcpu(metadata: &mut Value, epoch: u64) -> Result<(), SessionError> {
    let regions = metadata["offcpu_regions"].as_object_mut().unwrap();
    for (pid_tid, list) in regions {
        let list = list
            .as_array_mut()
            .ok_or_else(|| bad_shape("offcpu_regions list"))?;
        for region in list {
            let ts = region
                .get(0)
                .and_then(Value::as_u64)
                .ok_or_else(|| bad_shape("offcpu region timestamp"))?;
            if ts < epoch {
                return Err(SessionError::Protocol(format!(
                    "off-CPU region for {} starts before the session epoch",
                    pid_tid
                )));
            }
            region[0] = json!(ts - epoch);
        }
    }
    Ok(())
}

fn bad_shape(what: &str) -> SessionError {
    SessionError::Protocol(format!("unexpected shape of {}", what))
}

/// Write `metadata.json` and one `<pid_tid>.json` per thread, in parallel.
/// Each document is a single line followed by `\n`.
pub fn write_outputs(output: &MergedOutput, processed_dir: &Path) -> Result<(), SessionError> {
    fn save(path: &Path, value: &Value) -> Result<(), SessionError> {
        let mut file = File::create(path)?;
        let line = serde_json::to_string(value)
            .map_err(|err| SessionError::Protocol(format!("serializing {:?}: {}", path, err)))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    thread::scope(|scope| {
        let mut workers = Vec::new();
        workers.push(scope.spawn(|| save(&processed_dir.join("metadata.json"), &output.metadata)));
        for (pid_tid, counters) in &output.final_output {
            workers.push(scope.spawn(move || {
                save(&processed_dir.join(format!("{}.json", pid_tid)), counters)
            }));
        }
        workers
            .into_iter()
            .map(|w| w.join().expect("output writer panicked"))
            .collect::<Result<(), _>>()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree_result() -> Value {
        json!({
            "syscall_meta": [
                ["100", "101"],
                {
                    "100": {"parent": null, "tag": ["app", "100/100", 0, -1], "callchains": {}},
                    "101": {"parent": "100", "tag": ["worker", "100/101", 10, 90], "callchains": {}},
                }
            ],
            "syscall": {
                "chain_0": [["main", "app"]],
            },
        })
    }

    fn sample_result() -> Value {
        json!({
            "samples": {
                "100_101": {
                    "first_time": 1700000000000000100u64,
                    "sampled_time": 4000,
                    "offcpu_regions": [[1700000000000000500u64, 120]],
                    "cycles": [[1700000000000000200u64, 1000000]],
                },
                "100_102": {
                    "first_time": 1700000000000000300u64,
                    "sampled_time": 10,
                },
            },
        })
    }

    #[test]
    fn test_merge_builds_thread_tree_without_duplicates() {
        let results = vec![tree_result(), sample_result()];
        let merged = merge(&results, 1_700_000_000_000_000_000).unwrap();

        let tree = merged.metadata["thread_tree"].as_array().unwrap();
        // 100 and 101 are real, 102 is synthesized exactly once.
        assert_eq!(tree.len(), 3);
        let ids: Vec<&str> = tree
            .iter()
            .map(|t| t["identifier"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["100", "101", "102"]);

        let placeholder = &tree[2];
        assert_eq!(placeholder["parent"], Value::Null);
        assert_eq!(placeholder["tag"], json!(["?", "100/102", -1, -1]));
    }

    #[test]
    fn test_merge_epoch_rebase() {
        let results = vec![tree_result(), sample_result()];
        let merged = merge(&results, 1_700_000_000_000_000_000).unwrap();
        assert_eq!(
            merged.metadata["offcpu_regions"]["100_101"],
            json!([[500, 120]])
        );
        // Region starts are never negative after the rebase.
        assert!(merged.metadata["offcpu_regions"]["100_101"][0][0]
            .as_u64()
            .unwrap()
            < 1000);
    }

    #[test]
    fn test_merge_region_before_epoch_is_error() {
        let results = vec![sample_result()];
        let result = merge(&results, 1_800_000_000_000_000_000);
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_merge_carves_out_well_known_fields() {
        let results = vec![tree_result(), sample_result()];
        let merged = merge(&results, 1_700_000_000_000_000_000).unwrap();

        assert_eq!(merged.metadata["sampled_times"]["100_101"], 4000);
        // first_time is dropped, counters land in the per-thread output.
        let thread = &merged.final_output["100_101"];
        assert!(thread.get("first_time").is_none());
        assert!(thread.get("sampled_time").is_none());
        assert_eq!(thread["cycles"][0], json!([1700000000000000200u64, 1000000]));
        // A thread with only carved-out fields produces no output file.
        assert!(merged.final_output.get("100_102").is_none());
    }

    #[test]
    fn test_merge_rejects_duplicate_chain_ids() {
        let results = vec![tree_result(), tree_result()];
        let result = merge(&results, 0);
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_write_outputs_single_line_documents() {
        let results = vec![tree_result(), sample_result()];
        let merged = merge(&results, 1_700_000_000_000_000_000).unwrap();

        let dir = TempDir::new().unwrap();
        write_outputs(&merged, dir.path()).unwrap();

        let metadata = fs::read_to_string(dir.path().join("metadata.json")).unwrap();
        assert_eq!(metadata.lines().count(), 1);
        assert!(metadata.ends_with('\n'));
        let parsed: Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(parsed["callchains"]["chain_0"], json!([["main", "app"]]));

        let thread = fs::read_to_string(dir.path().join("100_101.json")).unwrap();
        let parsed: Value = serde_json::from_str(&thread).unwrap();
        assert!(parsed.get("cycles").is_some());
    }
}
