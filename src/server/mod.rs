//! The ingest server.
//!
//! One session means one control connection plus N parallel data
//! connections, one per probe. The same code serves the in-process server
//! of a local session (pipe transport) and a TCP listener fed by a remote
//! initiator.

pub mod client;
pub mod merge;
pub mod subclient;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::archive::SourceArchiver;
use crate::comm::{Acceptor, AcceptorFactory};
use crate::errors::SessionError;

pub use client::{IngestClient, IngestOpts};
pub use merge::{merge, write_outputs, MergedOutput};
pub use subclient::{ReadinessSignal, Subclient};

/// A running ingest server thread.
pub struct ServerHandle {
    worker: JoinHandle<Result<(), SessionError>>,
}

impl ServerHandle {
    pub fn join(self) -> Result<(), SessionError> {
        self.worker.join().expect("ingest server thread panicked")
    }
}

/// Accept one control connection on `control_acceptor` and serve the whole
/// session on a dedicated thread.
pub fn spawn(
    mut control_acceptor: Box<dyn Acceptor>,
    factory: Arc<dyn AcceptorFactory>,
    archiver: Arc<dyn SourceArchiver>,
    working_dir: PathBuf,
    opts: IngestOpts,
) -> ServerHandle {
    let worker = thread::spawn(move || {
        let buf_size = opts.buf_size;
        let connection = control_acceptor.accept(buf_size, None)?;
        IngestClient::new(connection, factory, archiver, working_dir, opts).process()
    });
    ServerHandle { worker }
}
