//! Profiler probe child processes.
//!
//! Each probe launches the patched `perf` as a `record | script` pipeline
//! attached to the profiled PID, pinned to the profiler CPU set. The probe
//! negotiates two channels: the data connection to the ingest server
//! (`ADAPTYST_SERV_CONNECT`) and a frontend pipe (`ADAPTYST_CONNECT`) used
//! to push filter settings in and read the detected source files back out.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::comm::pipe::parse_instructions;
use crate::comm::{Acceptor, Connection, PipeAcceptor};
use crate::config::PerfPaths;
use crate::cpu::CpuPartition;
use crate::errors::{CommError, SessionError};
use crate::event::{CaptureMode, ProbeEvent};
use crate::filter::StackFilter;

/// How long a probe child may take to start its processing script and dial
/// the frontend pipe.
const FRONTEND_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Probe {
    name: String,
    event: ProbeEvent,
    frontend: PipeAcceptor,
    frontend_conn: Option<Box<dyn Connection>>,
    child: Option<Child>,
}

/// What a finished probe left behind.
pub struct ProbeReport {
    pub name: String,
    pub exit_code: i32,
    /// Binaries/libraries the probe saw samples in, for source bundling.
    pub source_files: BTreeSet<PathBuf>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl Probe {
    pub fn new(event: ProbeEvent) -> Result<Self, SessionError> {
        Ok(Probe {
            name: event.probe_name(),
            event,
            frontend: PipeAcceptor::new()?,
            frontend_conn: None,
            child: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn log_path(&self, tmp_dir: &Path, stream: &str) -> PathBuf {
        tmp_dir.join(format!("{}_{}.log", self.name, stream))
    }

    /// Launch the probe pipeline against `target_pid`, with its data
    /// connection dialing `serv_type serv_instructions`.
    pub fn start(
        &mut self,
        paths: &PerfPaths,
        serv_type: &str,
        serv_instructions: &str,
        partition: &CpuPartition,
        mode: CaptureMode,
        target_pid: u32,
        tmp_dir: &Path,
    ) -> Result<(), SessionError> {
        let perf = shell_quote(&paths.perf_bin.to_string_lossy());
        let script = shell_quote(
            &paths
                .script_dir
                .join(self.event.script_name())
                .to_string_lossy(),
        );

        let mut record = vec![perf.clone(), "record".to_string()];
        record.extend(self.event.record_args(mode));
        record.push("-p".to_string());
        record.push(target_pid.to_string());
        record.push("-o".to_string());
        record.push("-".to_string());

        let pipeline = format!(
            "{} | {} script -i - -s {}",
            record.join(" "),
            perf,
            script
        );
        debug!("starting probe {}: {}", self.name, pipeline);

        let stdout_log = File::create(self.log_path(tmp_dir, "stdout"))?;
        let stderr_log = File::create(self.log_path(tmp_dir, "stderr"))?;

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&pipeline)
            .env(
                "ADAPTYST_CONNECT",
                format!("pipe {}", self.frontend.dial_instructions()),
            )
            .env(
                "ADAPTYST_SERV_CONNECT",
                format!("{} {}", serv_type, serv_instructions),
            )
            .env("PYTHONPATH", &paths.trace_lib)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));

        use std::os::unix::process::CommandExt;
        command.process_group(0);
        if let Some(set) = partition.profiler_cpuset() {
            let mask = raw_cpu_mask(&set);
            unsafe {
                command.pre_exec(move || {
                    libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mask);
                    Ok(())
                });
            }
        }

        let child = command.spawn()?;
        self.child = Some(child);

        // The child inherited the peer pipe ends; close our copies so EOF
        // can reach the local readers once the child exits.
        let (frontend_read, frontend_write) = self.frontend.peer_fds();
        unsafe {
            libc::close(frontend_read);
            libc::close(frontend_write);
        }
        if serv_type == "pipe" {
            if let Ok((serv_read, serv_write)) = parse_instructions(serv_instructions) {
                unsafe {
                    libc::close(serv_read);
                    libc::close(serv_write);
                }
            }
        }

        Ok(())
    }

    /// Accept the frontend pipe and push the filter settings, ending with
    /// `<STOP>`. The processing script blocks on this before it emits any
    /// records.
    pub fn push_filter(&mut self, filter: &StackFilter) -> Result<(), SessionError> {
        let mut conn = self
            .frontend
            .accept(1024, Some(FRONTEND_ACCEPT_TIMEOUT))?;
        if let Some(frame) = filter.settings_frame() {
            conn.write_line(&frame.to_string())?;
        }
        conn.write_line("<STOP>")?;
        self.frontend_conn = Some(conn);
        Ok(())
    }

    /// Drain the frontend side channel and reap the child. The `perf`
    /// pipeline exits on its own once the target PID is gone.
    pub fn finish(&mut self, tmp_dir: &Path) -> Result<ProbeReport, SessionError> {
        let mut source_files = BTreeSet::new();

        if let Some(conn) = self.frontend_conn.as_mut() {
            loop {
                match conn.read_line() {
                    Ok(line) => {
                        if line == "<STOP>" {
                            break;
                        }
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(msg) => match msg["type"].as_str() {
                                Some("sources") => {
                                    if let Some(map) = msg["data"].as_object() {
                                        source_files
                                            .extend(map.keys().map(PathBuf::from));
                                    }
                                }
                                Some("missing_symbol_maps") => {
                                    for path in
                                        msg["data"].as_array().into_iter().flatten()
                                    {
                                        warn!(
                                            "probe {}: missing symbol map {}",
                                            self.name, path
                                        );
                                    }
                                }
                                _ => {
                                    return Err(SessionError::Protocol(format!(
                                        "unexpected frontend message from probe {}: {}",
                                        self.name, line
                                    )))
                                }
                            },
                            Err(err) => {
                                return Err(SessionError::Protocol(format!(
                                    "malformed frontend message from probe {}: {}",
                                    self.name, err
                                )))
                            }
                        }
                    }
                    Err(CommError::Closed) => break,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let exit_code = match self.child.take() {
            Some(mut child) => {
                let status = child.wait()?;
                status.code().unwrap_or(1)
            }
            None => 1,
        };

        Ok(ProbeReport {
            name: self.name.clone(),
            exit_code,
            source_files,
            stdout_log: self.log_path(tmp_dir, "stdout"),
            stderr_log: self.log_path(tmp_dir, "stderr"),
        })
    }

    /// SIGTERM the probe's process group if it is still running.
    pub fn terminate(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                unsafe {
                    libc::kill(-(child.id() as i32), libc::SIGTERM);
                }
            }
        }
    }
}

fn raw_cpu_mask(set: &nix::sched::CpuSet) -> libc::cpu_set_t {
    let mut mask: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in 0..nix::sched::CpuSet::count() {
        if set.is_set(cpu).unwrap_or(false) {
            unsafe { libc::CPU_SET(cpu, &mut mask) };
        }
    }
    mask
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
