//! The top-level profiling session controller.
//!
//! Builds the probe set from the validated configuration, binds or dials
//! the ingest peer, runs the warmup handshake, starts the profiled command
//! pinned to its CPU set, waits for everything to settle, and propagates
//! the consolidated exit status.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::archive::{SourceArchiver, ZipSourceArchiver};
use crate::comm::{dial_pipe, dial_tcp, Acceptor, Connection, PipeAcceptor, PipeAcceptorFactory};
use crate::config::PerfPaths;
use crate::cpu::CpuPartition;
use crate::errors::SessionError;
use crate::event::{CaptureMode, ExtraEvent, ProbeEvent};
use crate::filter::StackFilter;
use crate::probe::{Probe, ProbeReport};
use crate::profiled_command::spawn_profiled_child;
use crate::server::{self, IngestOpts, ServerHandle};

/// Where the list of detected source-code files ends up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CodesDst {
    /// Pack the files into `processed/src.zip` on this machine.
    #[default]
    BundleHere,
    /// Stream the list to the remote ingest server, which archives there.
    Server,
    /// Write the newline-separated list to a file.
    File(PathBuf),
    /// Write the newline-separated list to an inherited file descriptor.
    Fd(i32),
}

/// Validated inputs to the controller. Construction and validation happen
/// in the CLI layer; nothing here changes once the session starts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub freq: u32,
    pub buffer: u32,
    pub off_cpu_freq: i64,
    pub off_cpu_buffer: u32,
    pub post_process: u32,
    pub capture_mode: CaptureMode,
    pub warmup: u32,
    pub extra_events: Vec<ExtraEvent>,
    pub filter: StackFilter,
    pub remote: Option<(String, u16)>,
    pub codes_dst: CodesDst,
    pub server_buffer: usize,
    pub file_timeout: Duration,
    pub command: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            freq: 10,
            buffer: 1,
            off_cpu_freq: 1000,
            off_cpu_buffer: 0,
            post_process: 1,
            capture_mode: CaptureMode::User,
            warmup: 1,
            extra_events: Vec::new(),
            filter: StackFilter::default(),
            remote: None,
            codes_dst: CodesDst::BundleHere,
            server_buffer: 1024,
            file_timeout: Duration::from_secs(30),
            command: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Reject combinations the session cannot honor.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.command.is_empty() {
            return Err(SessionError::User(
                "you need to provide the command to be profiled".to_string(),
            ));
        }
        if self.codes_dst == CodesDst::Server && self.remote.is_none() {
            return Err(SessionError::User(
                "--codes cannot be set to \"srv\" if no -a option is specified".to_string(),
            ));
        }
        Ok(())
    }

    /// The probe set this configuration asks for: always the thread tree
    /// and the on-CPU/off-CPU pair, plus one probe per extra event. With
    /// off-CPU frequency 0 the main probe samples on-CPU only.
    pub fn probe_events(&self) -> Vec<ProbeEvent> {
        let mut events = vec![
            ProbeEvent::SyscallTree,
            ProbeEvent::OnOffCpu {
                freq: self.freq,
                buffer: self.buffer,
                off_cpu_freq: self.off_cpu_freq,
                off_cpu_buffer: self.off_cpu_buffer,
            },
        ];
        for event in &self.extra_events {
            events.push(ProbeEvent::Custom {
                event: event.clone(),
                buffer: self.buffer,
            });
        }
        events
    }
}

pub fn run_session(config: &SessionConfig, paths: &PerfPaths) -> Result<i32, SessionError> {
    config.validate()?;
    info!("adaptyst {}", env!("CARGO_PKG_VERSION"));

    let mut session = Session::new(config, paths)?;
    let result = session.run();
    session.settle(result.is_ok());
    result
}

struct Session<'a> {
    config: &'a SessionConfig,
    paths: &'a PerfPaths,
    tmp_dir: PathBuf,
    probes: Vec<Probe>,
    started: Instant,
}

impl<'a> Session<'a> {
    fn new(config: &'a SessionConfig, paths: &'a PerfPaths) -> Result<Self, SessionError> {
        let tmp_dir =
            std::env::temp_dir().join(format!("adaptyst.pid.{}", std::process::id()));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;
        info!(
            "in case of any issues, check the files inside {}",
            tmp_dir.display()
        );

        Ok(Session {
            config,
            paths,
            tmp_dir,
            probes: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Reap leftovers; keep the temp directory for forensics unless the
    /// session succeeded.
    fn settle(&mut self, success: bool) {
        for probe in &mut self.probes {
            probe.terminate();
        }
        if success {
            let _ = fs::remove_dir_all(&self.tmp_dir);
            info!(
                "done in {} ms in total, you can check the results directory now",
                self.started.elapsed().as_millis()
            );
        } else {
            warn!(
                "the session failed; {} has been kept for inspection",
                self.tmp_dir.display()
            );
        }
    }

    fn run(&mut self) -> Result<i32, SessionError> {
        let config = self.config;

        let partition = CpuPartition::detect(config.post_process, config.remote.is_some())?;
        partition.pin_current_thread()?;

        // The command wrapper is forked before any pipe fds exist, so the
        // profiled command inherits none of them. It stays gated on the
        // exec pipe until the warmup is over.
        let mut child = spawn_profiled_child(&config.command, partition.command_cpuset())
            .map_err(|err| SessionError::User(err.to_string()))?;

        for event in config.probe_events() {
            self.probes.push(Probe::new(event)?);
        }

        let profiled_filename = Path::new(&config.command[0])
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| config.command[0].clone());
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let result_dir = format!("{}_{}", profiled_filename.replace('/', "_"), start_millis);

        // Bind the in-process server or dial the remote one.
        let mut server_handle: Option<ServerHandle> = None;
        let mut control: Box<dyn Connection> = match &config.remote {
            Some((host, port)) => dial_tcp(host, *port, config.server_buffer)?,
            None => {
                let working_dir = std::env::current_dir()?.join("results");
                fs::create_dir_all(&working_dir)?;

                let control_acceptor = PipeAcceptor::new()?;
                let instructions = control_acceptor.dial_instructions();
                server_handle = Some(server::spawn(
                    Box::new(control_acceptor),
                    Arc::new(PipeAcceptorFactory),
                    Arc::new(ZipSourceArchiver),
                    working_dir,
                    IngestOpts {
                        buf_size: config.server_buffer,
                        file_timeout: config.file_timeout,
                        // A local session writes its artifacts straight into
                        // the result directory; nothing needs uploading.
                        file_upload: false,
                    },
                ));
                dial_pipe(&instructions, config.server_buffer)?
            }
        };

        control.write_line(&format!("start{} {}", self.probes.len(), result_dir))?;
        control.write_line(&profiled_filename)?;

        let instructions = control.read_line()?;
        if instructions.starts_with("error_") {
            return Err(SessionError::Protocol(format!(
                "the ingest server reported {}",
                instructions
            )));
        }
        let mut parts = instructions.split(' ');
        let serv_type = parts
            .next()
            .ok_or_else(|| SessionError::Protocol("empty dial instruction frame".into()))?
            .to_string();
        let dial_list: Vec<&str> = parts.collect();
        if dial_list.len() != self.probes.len() {
            return Err(SessionError::Protocol(format!(
                "the ingest server offered {} data connection(s) for {} probe(s)",
                dial_list.len(),
                self.probes.len()
            )));
        }

        for (probe, dial) in self.probes.iter_mut().zip(&dial_list) {
            probe.start(
                self.paths,
                &serv_type,
                dial,
                &partition,
                config.capture_mode,
                child.pid,
                &self.tmp_dir,
            )?;
            probe.push_filter(&config.filter)?;
        }

        expect_frame(control.as_mut(), "start_profile")?;

        // Give the probes time to install their hooks before user code runs.
        std::thread::sleep(Duration::from_secs(config.warmup as u64));

        let epoch = monotonic_ns();
        control.write_line(&epoch.to_string())?;
        expect_frame(control.as_mut(), "tstamp_ack")?;

        child
            .signal_exec()
            .map_err(|err| SessionError::Env(err.to_string()))?;
        child
            .wait_for_exec()
            .map_err(|err| SessionError::User(err.to_string()))?;

        let command_exit = child
            .wait()
            .map_err(|err| SessionError::Env(err.to_string()))?;
        if command_exit != 0 {
            warn!("the profiled command exited with code {}", command_exit);
        }

        // The perf pipelines exit on their own once the target is gone;
        // collect their reports and side channels. A failed probe does not
        // cut its siblings short.
        let mut reports: Vec<ProbeReport> = Vec::new();
        let mut probe_failure: Option<SessionError> = None;
        let tmp_dir = self.tmp_dir.clone();
        for probe in &mut self.probes {
            match probe.finish(&tmp_dir) {
                Ok(report) => {
                    if report.exit_code != 0 {
                        warn!(
                            "probe {} exited with code {}",
                            report.name, report.exit_code
                        );
                        probe_failure.get_or_insert(SessionError::Tool {
                            tool: format!("probe {}", report.name),
                            code: report.exit_code,
                        });
                    }
                    reports.push(report);
                }
                Err(err) => {
                    warn!("probe {} failed: {}", probe.name(), err);
                    probe_failure.get_or_insert(err);
                }
            }
        }

        let sources: BTreeSet<PathBuf> = reports
            .iter()
            .flat_map(|r| r.source_files.iter().cloned())
            .collect();

        // The server merges once the data connections close, then tells us
        // whether it wants artifacts back.
        let finish = control.read_line()?;
        match finish.as_str() {
            "profiling_finished" => {}
            "out_files" => {
                let file_instructions = control.read_line()?;
                self.upload_files(control.as_mut(), &file_instructions, &reports, &sources)?;
            }
            other => {
                return Err(SessionError::Protocol(format!(
                    "the ingest server reported {}",
                    other
                )))
            }
        }
        expect_frame(control.as_mut(), "finished")?;

        let result_path = std::env::current_dir()?.join("results").join(&result_dir);
        self.deliver_sources(&sources, &result_path)?;
        if config.remote.is_none() {
            copy_out_files(&reports, &result_path.join("out"));
        }

        if let Some(handle) = server_handle {
            handle.join()?;
        }

        if let Some(err) = probe_failure {
            return Err(err);
        }
        Ok(command_exit)
    }

    /// Remote file-upload phase: one `o`/`p` frame plus one data connection
    /// per artifact, then `<STOP>`.
    fn upload_files(
        &self,
        control: &mut dyn Connection,
        file_instructions: &str,
        reports: &[ProbeReport],
        sources: &BTreeSet<PathBuf>,
    ) -> Result<(), SessionError> {
        let (acceptor_type, dial) = file_instructions
            .split_once(' ')
            .ok_or_else(|| SessionError::Protocol("malformed file acceptor frame".into()))?;
        if acceptor_type != "tcp" {
            return Err(SessionError::Protocol(format!(
                "unsupported file acceptor type {:?}",
                acceptor_type
            )));
        }
        let (host, port) = dial
            .rsplit_once('_')
            .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
            .ok_or_else(|| SessionError::Protocol("malformed file dial instructions".into()))?;

        let mut send = |name: &str,
                        payload: &dyn Fn(&mut dyn Connection) -> Result<(), SessionError>,
                        processed: bool|
         -> Result<(), SessionError> {
            let prefix = if processed { 'p' } else { 'o' };
            control.write_line(&format!("{} {}", prefix, name))?;
            let mut conn = dial_tcp(host, port, self.config.server_buffer)?;
            payload(conn.as_mut())?;
            conn.close();
            match control.read_line()?.as_str() {
                "out_file_ok" => {}
                reply => warn!("the server reported {} for {}", reply, name),
            }
            Ok(())
        };

        for report in reports {
            for log in [&report.stdout_log, &report.stderr_log] {
                if !log.exists() {
                    continue;
                }
                let name = log
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                send(&name, &|conn| Ok(conn.send_file(log)?), false)?;
            }
        }

        if self.config.codes_dst == CodesDst::Server {
            send(
                "code_paths.lst",
                &|conn| {
                    for path in sources {
                        conn.write_line(&path.to_string_lossy())?;
                    }
                    Ok(())
                },
                true,
            )?;
        }

        control.write_line("<STOP>")?;
        Ok(())
    }

    /// Handle the non-`srv` source-code destinations.
    fn deliver_sources(
        &self,
        sources: &BTreeSet<PathBuf>,
        result_path: &Path,
    ) -> Result<(), SessionError> {
        match &self.config.codes_dst {
            CodesDst::Server => Ok(()),
            CodesDst::BundleHere => {
                if self.config.remote.is_some() {
                    warn!("the results live on the remote server; skipping the local source bundle");
                    return Ok(());
                }
                let existing: BTreeSet<PathBuf> = sources
                    .iter()
                    .filter_map(|p| fs::canonicalize(p).ok())
                    .collect();
                ZipSourceArchiver.archive(&result_path.join("processed").join("src.zip"), &existing)
            }
            CodesDst::File(path) => {
                let mut file = fs::File::create(path)?;
                for source in sources {
                    writeln!(file, "{}", source.display())?;
                }
                Ok(())
            }
            CodesDst::Fd(fd) => {
                use std::os::unix::io::FromRawFd;
                let mut file = unsafe { fs::File::from_raw_fd(*fd) };
                for source in sources {
                    writeln!(file, "{}", source.display())?;
                }
                Ok(())
            }
        }
    }
}

/// Local sessions keep their probe logs next to the results.
fn copy_out_files(reports: &[ProbeReport], out_dir: &Path) {
    for report in reports {
        for log in [&report.stdout_log, &report.stderr_log] {
            if let Some(name) = log.file_name() {
                if let Err(err) = fs::copy(log, out_dir.join(name)) {
                    warn!("could not copy {} to the out directory: {}", log.display(), err);
                }
            }
        }
    }
}

fn expect_frame(connection: &mut dyn Connection, expected: &str) -> Result<(), SessionError> {
    let frame = connection.read_line()?;
    if frame != expected {
        return Err(SessionError::Protocol(format!(
            "the ingest server reported {} (expected {})",
            frame, expected
        )));
    }
    Ok(())
}

/// Nanoseconds on the monotonic clock; the session epoch is read from here.
pub fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_srv_codes_without_remote() {
        let config = SessionConfig {
            codes_dst: CodesDst::Server,
            command: vec!["/bin/true".to_string()],
            ..SessionConfig::default()
        };
        let result = config.validate();
        assert!(matches!(result, Err(SessionError::User(_))));
        assert_eq!(result.unwrap_err().exit_code(), 3);
    }

    #[test]
    fn test_validate_rejects_missing_command() {
        let config = SessionConfig::default();
        assert!(matches!(config.validate(), Err(SessionError::User(_))));
    }

    #[test]
    fn test_probe_set_composition() {
        let mut config = SessionConfig {
            command: vec!["/bin/true".to_string()],
            ..SessionConfig::default()
        };
        config.extra_events.push(ExtraEvent {
            name: "cycles".to_string(),
            period: 1_000_000,
            title: "CYCLES".to_string(),
        });

        let events = config.probe_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProbeEvent::SyscallTree));
        assert!(matches!(events[1], ProbeEvent::OnOffCpu { .. }));
        assert!(matches!(events[2], ProbeEvent::Custom { .. }));
    }

    #[test]
    fn test_monotonic_ns_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
