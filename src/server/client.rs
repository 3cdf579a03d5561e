//! The ingest client: server-side coordinator of one profiling session.
//!
//! Owns the control connection and drives it through
//! `AwaitStart → AwaitStartProfile → AwaitTimestamp → Collecting →
//! AwaitFiles → Done`. Spawns one subclient per announced probe, operates
//! the readiness barrier, merges the collected results, and runs the
//! optional file-upload phase.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive::SourceArchiver;
use crate::comm::{AcceptorFactory, Connection, FILE_BUFFER_SIZE};
use crate::errors::{CommError, SessionError};
use crate::server::merge::{merge, write_outputs};
use crate::server::subclient::{ReadinessSignal, Subclient};

pub struct IngestOpts {
    /// Framed-read buffer size for the control and data connections.
    pub buf_size: usize,
    /// Per-read deadline during the file-upload phase.
    pub file_timeout: Duration,
    /// Whether the session returns auxiliary artifacts to the initiator.
    pub file_upload: bool,
}

impl Default for IngestOpts {
    fn default() -> Self {
        IngestOpts {
            buf_size: 1024,
            file_timeout: Duration::from_secs(30),
            file_upload: true,
        }
    }
}

pub struct IngestClient {
    connection: Box<dyn Connection>,
    factory: Arc<dyn AcceptorFactory>,
    archiver: Arc<dyn SourceArchiver>,
    working_dir: PathBuf,
    opts: IngestOpts,
}

impl IngestClient {
    pub fn new(
        connection: Box<dyn Connection>,
        factory: Arc<dyn AcceptorFactory>,
        archiver: Arc<dyn SourceArchiver>,
        working_dir: PathBuf,
        opts: IngestOpts,
    ) -> Self {
        IngestClient {
            connection,
            factory,
            archiver,
            working_dir,
            opts,
        }
    }

    /// Run the whole control conversation. Any early return leaves the peer
    /// with an `error_*` frame explaining why.
    pub fn process(mut self) -> Result<(), SessionError> {
        let start_re = Regex::new(r"^start([1-9][0-9]*) (.+)$").unwrap();

        let start = self.connection.read_line()?;
        let Some(caps) = start_re.captures(&start) else {
            self.connection.write_line("error_wrong_command")?;
            return Err(SessionError::Protocol(format!(
                "expected a start frame, got {:?}",
                start
            )));
        };
        let subclient_cnt: usize = caps[1]
            .parse()
            .map_err(|_| SessionError::Protocol("subclient count overflows".to_string()))?;
        let result_dir = caps[2].to_string();

        let result_path = self.working_dir.join(&result_dir);
        let processed_path = result_path.join("processed");
        let out_path = result_path.join("out");
        if result_dir.contains('/')
            || result_dir == ".."
            || fs::create_dir_all(&processed_path)
                .and_then(|_| fs::create_dir_all(&out_path))
                .is_err()
        {
            self.connection.write_line("error_result_dir")?;
            return Err(SessionError::Protocol(format!(
                "could not create result directory {:?}",
                result_dir
            )));
        }

        let profiled_filename = self.connection.read_line()?;
        debug!("profiling session for {:?} with {} probes", profiled_filename, subclient_cnt);

        let ready = ReadinessSignal::new();
        let mut subclients = Vec::with_capacity(subclient_cnt);
        for _ in 0..subclient_cnt {
            let acceptor = self.factory.make_acceptor()?;
            subclients.push(Subclient::new(acceptor, ready.clone(), self.opts.buf_size));
        }

        let mut instr_msg = self.factory.type_tag().to_string();
        for subclient in &subclients {
            instr_msg.push(' ');
            instr_msg.push_str(&subclient.dial_instructions());
        }

        let workers: Vec<_> = subclients
            .into_iter()
            .map(|subclient| thread::spawn(move || subclient.run()))
            .collect();

        self.connection.write_line(&instr_msg)?;

        ready.wait_for(subclient_cnt);
        self.connection.write_line("start_profile")?;

        let tstamp_msg = self.connection.read_line()?;
        let Ok(epoch) = tstamp_msg.parse::<u64>() else {
            warn!("wrong timestamp received: {:?}", tstamp_msg);
            self.connection.write_line("error_tstamp")?;
            return Err(SessionError::Protocol(format!(
                "expected the session epoch, got {:?}",
                tstamp_msg
            )));
        };
        self.connection.write_line("tstamp_ack")?;

        // Collecting: the subclients return once the probes close their data
        // connections. Every worker is joined before any failure is acted
        // on, so one flaky probe still yields a partial result set.
        let mut results: Vec<Value> = Vec::new();
        let mut first_failure: Option<SessionError> = None;
        for worker in workers {
            match worker.join().expect("subclient thread panicked") {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!("a probe receiver failed: {}", err);
                    first_failure.get_or_insert(err);
                }
            }
        }

        let merged = merge(&results, epoch)?;
        write_outputs(&merged, &processed_path)?;
        info!(
            "merged {} probe result(s) into {}",
            results.len(),
            processed_path.display()
        );

        if let Some(err) = first_failure {
            return Err(err);
        }

        if self.opts.file_upload {
            self.receive_files(&processed_path, &out_path)?;
        } else {
            self.connection.write_line("profiling_finished")?;
        }

        self.connection.write_line("finished")?;
        Ok(())
    }

    /// AwaitFiles: one `o <name>` / `p <name>` frame plus one data
    /// connection per file, until `<STOP>`. Timeouts and bad names are
    /// per-file conditions; the loop keeps going.
    fn receive_files(
        &mut self,
        processed_path: &std::path::Path,
        out_path: &std::path::Path,
    ) -> Result<(), SessionError> {
        let mut file_acceptor = self.factory.make_acceptor()?;
        self.connection.write_line("out_files")?;
        self.connection.write_line(&format!(
            "{} {}",
            file_acceptor.type_tag(),
            file_acceptor.dial_instructions()
        ))?;

        loop {
            let frame = self.connection.read_line()?;
            if frame == "<STOP>" {
                return Ok(());
            }

            let destination = match frame.as_bytes() {
                [b'p', b' ', rest @ ..] if !rest.is_empty() => Some((true, rest)),
                [b'o', b' ', rest @ ..] if !rest.is_empty() => Some((false, rest)),
                _ => None,
            };
            let Some((processed, name)) = destination else {
                self.connection.write_line("error_wrong_file_format")?;
                continue;
            };
            let name = String::from_utf8_lossy(name).into_owned();
            // Names are basenames; anything path-like would escape the
            // session directories.
            if name.contains('/') || name == "." || name == ".." {
                self.connection.write_line("error_wrong_file_format")?;
                continue;
            }

            let target_dir = if processed { processed_path } else { out_path };
            let mut file_connection =
                match file_acceptor.accept(self.opts.buf_size, Some(self.opts.file_timeout)) {
                    Ok(conn) => conn,
                    Err(CommError::Timeout) => {
                        warn!("timed out waiting for the upload connection for {:?}", name);
                        self.connection.write_line("error_out_file_timeout")?;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };

            let reply = if name == "code_paths.lst" {
                self.receive_code_paths(file_connection.as_mut(), processed_path)?
            } else {
                self.receive_file(file_connection.as_mut(), &target_dir.join(&name))?
            };
            self.connection.write_line(reply)?;
        }
    }

    fn receive_file(
        &self,
        connection: &mut dyn Connection,
        path: &std::path::Path,
    ) -> Result<&'static str, SessionError> {
        let mut file = match File::create(path) {
            Ok(file) => file,
            Err(err) => {
                warn!("could not open {} for writing: {}", path.display(), err);
                return Ok("error_out_file");
            }
        };

        let mut buf = vec![0u8; FILE_BUFFER_SIZE];
        loop {
            match connection.read_bytes(&mut buf, self.opts.file_timeout) {
                Ok(0) => return Ok("out_file_ok"),
                Ok(n) => {
                    if let Err(err) = file.write_all(&buf[..n]) {
                        warn!("could not write to {}: {}", path.display(), err);
                        return Ok("error_out_file");
                    }
                }
                Err(CommError::Timeout) => {
                    warn!(
                        "timeout reached while receiving {}, some data may have been lost",
                        path.display()
                    );
                    return Ok("error_out_file_timeout");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// `code_paths.lst` is handled in-band: the connection carries
    /// newline-framed paths on the sender's filesystem, which are
    /// canonicalized and packed into `processed/src.zip`.
    fn receive_code_paths(
        &self,
        connection: &mut dyn Connection,
        processed_path: &std::path::Path,
    ) -> Result<&'static str, SessionError> {
        let mut sources = BTreeSet::new();
        loop {
            match connection.read_line_timeout(self.opts.file_timeout) {
                Ok(line) if line.is_empty() => break,
                Ok(line) => {
                    if let Ok(path) = fs::canonicalize(&line) {
                        sources.insert(path);
                    }
                }
                Err(CommError::Closed) => break,
                Err(CommError::Timeout) => {
                    warn!("timeout reached while receiving the source path list");
                    return Ok("error_out_file_timeout");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.archiver
            .archive(&processed_path.join("src.zip"), &sources)?;
        Ok("out_file_ok")
    }
}
