//! Integration tests for the ingest control protocol.
//!
//! Each test spawns a real ingest server on localhost TCP and plays a
//! scripted session frontend against it: control frames, probe data
//! connections, the session epoch, and the file-upload phase.

mod common;

use std::fs;
use std::time::Duration;

use common::{deliver_records, parse_data_endpoints, start_server, BUF_SIZE};
use serde_json::Value;
use tempfile::TempDir;

use adaptyst::comm::dial_tcp;
use adaptyst::errors::SessionError;

const EPOCH: u64 = 1_700_000_000_000_000_000;

const TREE_RECORDS: &[&str] = &[
    r#"{"type":"syscall_meta","subtype":"execve","comm":"a.out","pid":"100","tid":"100","time":1700000000000000010,"ret_value":"0"}"#,
    r#"{"type":"syscall","ret_value":"101","callchain":[["main","a.out"]]}"#,
    r#"{"type":"syscall_meta","subtype":"new_proc","comm":"a.out","pid":"100","tid":"100","time":1700000000000000020,"ret_value":"101"}"#,
    r#"{"type":"syscall_meta","subtype":"exit","comm":"a.out","pid":"100","tid":"101","time":1700000000000000900,"ret_value":"0"}"#,
];

const SAMPLE_RECORDS: &[&str] = &[
    r#"{"type":"sample","event_type":"task-clock","pid":"100","tid":"101","timestamp":1700000000000000100,"period":4000}"#,
    r#"{"type":"sample","event_type":"offcpu-time","pid":"100","tid":"101","timestamp":1700000000000000500,"period":120}"#,
    r#"{"type":"sample","event_type":"cycles","pid":"100","tid":"102","timestamp":1700000000000000200,"period":1000000}"#,
];

#[test]
fn test_full_session_with_file_upload() {
    let working = TempDir::new().unwrap();
    let mut server = start_server(working.path(), Duration::from_secs(5));
    let control = &mut server.control;

    control.write_line("start2 run1").unwrap();
    control.write_line("a.out").unwrap();

    let endpoints = parse_data_endpoints(&control.read_line().unwrap());
    assert_eq!(endpoints.len(), 2);

    // Data connections stay open until after the epoch exchange.
    let tree_conn = deliver_records(&endpoints[0], TREE_RECORDS);
    let sample_conn = deliver_records(&endpoints[1], SAMPLE_RECORDS);

    assert_eq!(control.read_line().unwrap(), "start_profile");
    control.write_line(&EPOCH.to_string()).unwrap();
    assert_eq!(control.read_line().unwrap(), "tstamp_ack");

    drop(tree_conn);
    drop(sample_conn);

    assert_eq!(control.read_line().unwrap(), "out_files");
    let file_frame = control.read_line().unwrap();
    let file_endpoint = &parse_data_endpoints(&file_frame)[0];

    // A regular out-file upload.
    control.write_line("o mylog.txt").unwrap();
    let mut upload = dial_tcp(&file_endpoint.0, file_endpoint.1, BUF_SIZE).unwrap();
    upload.write_bytes(b"probe log contents\n").unwrap();
    drop(upload);
    assert_eq!(control.read_line().unwrap(), "out_file_ok");

    // Malformed names keep the loop alive instead of killing the session.
    control.write_line("x foo.txt").unwrap();
    assert_eq!(control.read_line().unwrap(), "error_wrong_file_format");
    control.write_line("p ../escape.txt").unwrap();
    assert_eq!(control.read_line().unwrap(), "error_wrong_file_format");

    // The source list is read in-band and archived server-side.
    let source = working.path().join("lib.c");
    fs::write(&source, b"void lib(void) {}\n").unwrap();
    control.write_line("p code_paths.lst").unwrap();
    let mut upload = dial_tcp(&file_endpoint.0, file_endpoint.1, BUF_SIZE).unwrap();
    upload
        .write_line(&source.display().to_string())
        .unwrap();
    upload.write_line("/definitely/not/there.c").unwrap();
    drop(upload);
    assert_eq!(control.read_line().unwrap(), "out_file_ok");

    control.write_line("<STOP>").unwrap();
    assert_eq!(control.read_line().unwrap(), "finished");

    server.handle.join().unwrap();

    // Merged metadata: one single-line JSON document.
    let processed = working.path().join("run1").join("processed");
    let metadata_text = fs::read_to_string(processed.join("metadata.json")).unwrap();
    assert_eq!(metadata_text.lines().count(), 1);
    let metadata: Value = serde_json::from_str(&metadata_text).unwrap();

    // One thread_tree entry per observed TID: 100 and 101 from the tree
    // probe, 102 synthesized from the sample probe.
    let tree = metadata["thread_tree"].as_array().unwrap();
    let ids: Vec<&str> = tree
        .iter()
        .map(|t| t["identifier"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["100", "101", "102"]);
    assert_eq!(tree[2]["parent"], Value::Null);
    assert_eq!(tree[2]["tag"][0], "?");

    // Off-CPU regions are rebased against the session epoch.
    assert_eq!(
        metadata["offcpu_regions"]["100_101"],
        serde_json::json!([[500, 120]])
    );
    assert_eq!(metadata["sampled_times"]["100_101"], 4000);
    assert_eq!(metadata["callchains"]["chain_0"][0][0], "main");

    // Event-specific counters land in per-thread documents.
    let cycles: Value =
        serde_json::from_str(&fs::read_to_string(processed.join("100_102.json")).unwrap())
            .unwrap();
    assert_eq!(cycles["cycles"][0][1], 1_000_000);

    // Uploaded artifacts are placed in out/, the source archive in processed/.
    let out = working.path().join("run1").join("out");
    assert_eq!(
        fs::read(out.join("mylog.txt")).unwrap(),
        b"probe log contents\n"
    );
    assert!(processed.join("src.zip").exists());
    assert!(!working.path().join("escape.txt").exists());
}

#[test]
fn test_wrong_start_command_fails_session() {
    let working = TempDir::new().unwrap();
    let mut server = start_server(working.path(), Duration::from_secs(5));

    server.control.write_line("begin2 run1").unwrap();
    assert_eq!(server.control.read_line().unwrap(), "error_wrong_command");

    let result = server.handle.join();
    assert!(matches!(result, Err(SessionError::Protocol(_))));
}

#[test]
fn test_start_count_must_be_positive() {
    let working = TempDir::new().unwrap();
    let mut server = start_server(working.path(), Duration::from_secs(5));

    server.control.write_line("start0 run1").unwrap();
    assert_eq!(server.control.read_line().unwrap(), "error_wrong_command");
    assert!(server.handle.join().is_err());
}

#[test]
fn test_result_dir_cannot_escape_working_dir() {
    let working = TempDir::new().unwrap();
    let mut server = start_server(working.path(), Duration::from_secs(5));

    server.control.write_line("start1 ../evil").unwrap();
    assert_eq!(server.control.read_line().unwrap(), "error_result_dir");
    assert!(server.handle.join().is_err());
    assert!(!working.path().join("..").join("evil").join("processed").exists());
}

#[test]
fn test_bad_epoch_frame() {
    let working = TempDir::new().unwrap();
    let mut server = start_server(working.path(), Duration::from_secs(5));
    let control = &mut server.control;

    control.write_line("start1 run2").unwrap();
    control.write_line("a.out").unwrap();
    let endpoints = parse_data_endpoints(&control.read_line().unwrap());
    let _data = deliver_records(&endpoints[0], SAMPLE_RECORDS);

    assert_eq!(control.read_line().unwrap(), "start_profile");
    control.write_line("three o'clock").unwrap();
    assert_eq!(control.read_line().unwrap(), "error_tstamp");
    assert!(server.handle.join().is_err());
}

#[test]
fn test_file_upload_timeout_recovers() {
    let working = TempDir::new().unwrap();
    let mut server = start_server(working.path(), Duration::from_millis(300));
    let control = &mut server.control;

    control.write_line("start1 run3").unwrap();
    control.write_line("a.out").unwrap();
    let endpoints = parse_data_endpoints(&control.read_line().unwrap());
    let data = deliver_records(&endpoints[0], SAMPLE_RECORDS);

    assert_eq!(control.read_line().unwrap(), "start_profile");
    control.write_line(&EPOCH.to_string()).unwrap();
    assert_eq!(control.read_line().unwrap(), "tstamp_ack");
    drop(data);

    assert_eq!(control.read_line().unwrap(), "out_files");
    let file_endpoint = &parse_data_endpoints(&control.read_line().unwrap())[0];

    // Announce a file but never send its bytes: the per-file deadline
    // converts to error_out_file_timeout without aborting the session.
    control.write_line("o slow.txt").unwrap();
    let stalled = dial_tcp(&file_endpoint.0, file_endpoint.1, BUF_SIZE).unwrap();
    assert_eq!(control.read_line().unwrap(), "error_out_file_timeout");
    drop(stalled);

    control.write_line("<STOP>").unwrap();
    assert_eq!(control.read_line().unwrap(), "finished");
    server.handle.join().unwrap();
}
