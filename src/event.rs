//! Probe event descriptors and the `perf` argument lists they expand to.

use crate::errors::SessionError;

/// Which stack trace types the sampler captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    Kernel,
    #[default]
    User,
    Both,
}

impl CaptureMode {
    pub fn parse(arg: &str) -> Result<CaptureMode, SessionError> {
        match arg {
            "kernel" => Ok(CaptureMode::Kernel),
            "user" => Ok(CaptureMode::User),
            "both" => Ok(CaptureMode::Both),
            _ => Err(SessionError::User(format!(
                "capture mode must be \"kernel\", \"user\", or \"both\", not {:?}",
                arg
            ))),
        }
    }

    /// perf event modifier selecting the capture side.
    fn modifier(&self) -> &'static str {
        match self {
            CaptureMode::Kernel => ":k",
            CaptureMode::User => ":u",
            CaptureMode::Both => "",
        }
    }
}

/// One `-e EVENT,PERIOD,TITLE` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraEvent {
    pub name: String,
    pub period: u64,
    pub title: String,
}

impl ExtraEvent {
    /// Parse the CLI form. Titles with the reserved `CARM_` prefix are
    /// refused; the roofline preset injects those itself.
    pub fn parse(arg: &str) -> Result<ExtraEvent, SessionError> {
        let invalid = || {
            SessionError::User(format!(
                "the value {:?} must be in form of EVENT,PERIOD,TITLE (PERIOD must be a \
                 number greater than 0)",
                arg
            ))
        };

        let mut parts = arg.splitn(3, ',');
        let (name, period, title) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(period), Some(title))
                if !name.is_empty() && !title.is_empty() =>
            {
                (name, period, title)
            }
            _ => return Err(invalid()),
        };

        let period: u64 = period.parse().map_err(|_| invalid())?;
        if period == 0 {
            return Err(invalid());
        }

        if title.starts_with("CARM_") {
            return Err(SessionError::User(format!(
                "the title in {:?} starts with a reserved keyword CARM_, you cannot use it",
                arg
            )));
        }

        Ok(ExtraEvent {
            name: name.to_string(),
            period,
            title: title.to_string(),
        })
    }
}

/// The event family one probe child samples.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    /// Syscall tracepoints reconstructing the process/thread tree.
    SyscallTree,
    /// The main on-CPU sampling plus optional off-CPU wait regions.
    OnOffCpu {
        freq: u32,
        buffer: u32,
        /// 0 disables off-CPU capture, -1 captures every event.
        off_cpu_freq: i64,
        /// 0 selects adaptive buffering.
        off_cpu_buffer: u32,
    },
    /// A named hardware event sampled every `period` occurrences.
    Custom { event: ExtraEvent, buffer: u32 },
}

impl ProbeEvent {
    /// Human-readable probe name; also names the probe's log files.
    pub fn probe_name(&self) -> String {
        match self {
            ProbeEvent::SyscallTree => "syscall_tree".to_string(),
            ProbeEvent::OnOffCpu { .. } => "onoffcpu".to_string(),
            ProbeEvent::Custom { event, .. } => event.name.replace([':', '/'], "_"),
        }
    }

    /// The processing script fed by this probe's `perf script` stage.
    pub fn script_name(&self) -> &'static str {
        match self {
            ProbeEvent::SyscallTree => "adaptyst-syscall-process.py",
            _ => "adaptyst-process.py",
        }
    }

    /// Arguments for the `perf record` stage of the probe pipeline.
    pub fn record_args(&self, mode: CaptureMode) -> Vec<String> {
        match self {
            ProbeEvent::SyscallTree => vec![
                "-e".to_string(),
                "sched:sched_process_fork,sched:sched_process_exit,\
                 syscalls:sys_exit_execve,syscalls:sys_exit_execveat"
                    .to_string(),
                "-g".to_string(),
            ],
            ProbeEvent::OnOffCpu {
                freq,
                buffer,
                off_cpu_freq,
                off_cpu_buffer,
            } => {
                let mut args = vec![
                    "-e".to_string(),
                    format!("task-clock{}", mode.modifier()),
                    "-F".to_string(),
                    freq.to_string(),
                    "-g".to_string(),
                    "--buffer-events".to_string(),
                    buffer.to_string(),
                ];
                if *off_cpu_freq != 0 {
                    args.push("--off-cpu".to_string());
                    args.push("--off-cpu-freq".to_string());
                    args.push(off_cpu_freq.to_string());
                    if *off_cpu_buffer > 0 {
                        args.push("--off-cpu-buffer-events".to_string());
                        args.push(off_cpu_buffer.to_string());
                    }
                }
                args
            }
            ProbeEvent::Custom { event, buffer } => vec![
                "-e".to_string(),
                format!("{}{}", event.name, mode.modifier()),
                "-c".to_string(),
                event.period.to_string(),
                "-g".to_string(),
                "--buffer-events".to_string(),
                buffer.to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_event_parse() {
        let event = ExtraEvent::parse("cycles,1000000,CYCLES").unwrap();
        assert_eq!(event.name, "cycles");
        assert_eq!(event.period, 1000000);
        assert_eq!(event.title, "CYCLES");
    }

    #[test]
    fn test_extra_event_title_may_contain_commas() {
        let event = ExtraEvent::parse("cycles,5,a,b").unwrap();
        assert_eq!(event.title, "a,b");
    }

    #[test]
    fn test_extra_event_rejects_reserved_title() {
        assert!(matches!(
            ExtraEvent::parse("cycles,1000,CARM_CYCLES"),
            Err(SessionError::User(_))
        ));
    }

    #[test]
    fn test_extra_event_rejects_bad_period() {
        assert!(ExtraEvent::parse("cycles,zero,T").is_err());
        assert!(ExtraEvent::parse("cycles,0,T").is_err());
        assert!(ExtraEvent::parse("cycles").is_err());
    }

    #[test]
    fn test_off_cpu_disabled_drops_flags() {
        let event = ProbeEvent::OnOffCpu {
            freq: 10,
            buffer: 1,
            off_cpu_freq: 0,
            off_cpu_buffer: 0,
        };
        let args = event.record_args(CaptureMode::User);
        assert!(!args.iter().any(|a| a.starts_with("--off-cpu")));
        assert!(args.contains(&"task-clock:u".to_string()));
    }

    #[test]
    fn test_off_cpu_capture_all() {
        let event = ProbeEvent::OnOffCpu {
            freq: 10,
            buffer: 1,
            off_cpu_freq: -1,
            off_cpu_buffer: 0,
        };
        let args = event.record_args(CaptureMode::Both);
        assert!(args.contains(&"--off-cpu".to_string()));
        assert!(args.contains(&"-1".to_string()));
        assert!(args.contains(&"task-clock".to_string()));
    }

    #[test]
    fn test_capture_mode_parse() {
        assert_eq!(CaptureMode::parse("kernel").unwrap(), CaptureMode::Kernel);
        assert!(CaptureMode::parse("everything").is_err());
    }
}
