//! Common test utilities for the ingest protocol integration tests.
//!
//! The tests play the role of a remote session frontend (the "stub peer"):
//! they dial a real ingest server over localhost TCP and walk the control
//! conversation by hand.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adaptyst::archive::ZipSourceArchiver;
use adaptyst::comm::{dial_tcp, Connection, TcpAcceptor, TcpAcceptorFactory};
use adaptyst::server::{self, IngestOpts, ServerHandle};

pub const BUF_SIZE: usize = 1024;

/// A freshly-spawned ingest server plus the dialed control connection.
pub struct TestServer {
    pub handle: ServerHandle,
    pub control: Box<dyn Connection>,
}

/// Bind a TCP control acceptor, spawn the server on it, and dial back.
pub fn start_server(working_dir: &Path, file_timeout: Duration) -> TestServer {
    let control_acceptor =
        TcpAcceptor::bind("127.0.0.1", 0, false).expect("failed to bind the control acceptor");
    let port = control_acceptor.port();

    let handle = server::spawn(
        Box::new(control_acceptor),
        Arc::new(TcpAcceptorFactory::new("127.0.0.1")),
        Arc::new(ZipSourceArchiver),
        working_dir.to_path_buf(),
        IngestOpts {
            buf_size: BUF_SIZE,
            file_timeout,
            file_upload: true,
        },
    );

    let control = dial_tcp("127.0.0.1", port, BUF_SIZE).expect("failed to dial the server");
    TestServer { handle, control }
}

/// Split a `<type> <inst> <inst> …` frame into per-subclient TCP endpoints.
pub fn parse_data_endpoints(frame: &str) -> Vec<(String, u16)> {
    let mut parts = frame.split(' ');
    assert_eq!(parts.next(), Some("tcp"), "unexpected acceptor type in {:?}", frame);
    parts
        .map(|inst| {
            let (host, port) = inst.rsplit_once('_').expect("malformed dial instructions");
            (host.to_string(), port.parse().expect("malformed port"))
        })
        .collect()
}

/// Dial one data endpoint and deliver the given records, then `<STOP>`.
pub fn deliver_records(endpoint: &(String, u16), records: &[&str]) -> Box<dyn Connection> {
    let mut conn = dial_tcp(&endpoint.0, endpoint.1, BUF_SIZE).expect("failed to dial a probe");
    for record in records {
        conn.write_line(record).unwrap();
    }
    conn.write_line("<STOP>").unwrap();
    conn
}
