//! CPU topology partitioning and affinity.
//!
//! The machine is split into two disjoint CPU-id sets: `profiler_set` runs
//! the probes and the post-processing threads, `command_set` runs the
//! profiled command. With isolation disabled (`post_process == 0`) both
//! sets cover every CPU and no affinity is applied.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::errors::SessionError;

/// Number of online hardware threads.
pub fn hw_threads() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Upper bound for `--post-process`, clamped to at least 1.
pub fn max_post_process(hw: usize) -> u32 {
    (hw.saturating_sub(3)).max(1) as u32
}

#[derive(Debug, Clone)]
pub struct CpuPartition {
    profiler: Vec<usize>,
    command: Vec<usize>,
    isolated: bool,
}

impl CpuPartition {
    /// Partition the current machine.
    pub fn detect(post_process: u32, remote: bool) -> Result<CpuPartition, SessionError> {
        Self::plan(hw_threads(), post_process, remote)
    }

    /// Pure partitioning logic.
    ///
    /// Local isolated sessions give the profiler `post_process` processing
    /// CPUs plus one probe CPU and leave the rest to the command; that
    /// requires at least 4 hardware threads. Remote sessions process
    /// elsewhere, so one local CPU suffices for the probes.
    pub fn plan(hw: usize, post_process: u32, remote: bool) -> Result<CpuPartition, SessionError> {
        if post_process == 0 {
            let all: Vec<usize> = (0..hw).collect();
            return Ok(CpuPartition {
                profiler: all.clone(),
                command: all,
                isolated: false,
            });
        }

        if remote {
            if hw < 2 {
                return Err(SessionError::Topology(
                    "at least 2 hardware threads are needed to isolate the profilers; \
                     use -p 0 to disable isolation"
                        .to_string(),
                ));
            }
            return Ok(CpuPartition {
                profiler: vec![0],
                command: (1..hw).collect(),
                isolated: true,
            });
        }

        if hw < 4 {
            return Err(SessionError::Topology(
                "at least 4 hardware threads are needed for profiler isolation; \
                 use -p 0 to disable isolation"
                    .to_string(),
            ));
        }
        let n = post_process as usize;
        if n > hw - 3 {
            return Err(SessionError::Topology(format!(
                "-p {} requested but at most {} post-processing threads fit on {} hardware \
                 threads",
                n,
                hw - 3,
                hw
            )));
        }

        Ok(CpuPartition {
            profiler: (0..=n).collect(),
            command: (n + 1..hw).collect(),
            isolated: true,
        })
    }

    pub fn profiler_set(&self) -> &[usize] {
        &self.profiler
    }

    pub fn command_set(&self) -> &[usize] {
        &self.command
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    /// Affinity mask for probe and processing threads, `None` when shared.
    pub fn profiler_cpuset(&self) -> Option<CpuSet> {
        self.isolated.then(|| cpuset(&self.profiler))
    }

    /// Affinity mask for the profiled command, `None` when shared.
    pub fn command_cpuset(&self) -> Option<CpuSet> {
        self.isolated.then(|| cpuset(&self.command))
    }

    /// Pin the calling thread to the profiler set.
    pub fn pin_current_thread(&self) -> Result<(), SessionError> {
        if let Some(set) = self.profiler_cpuset() {
            sched_setaffinity(Pid::from_raw(0), &set)
                .map_err(|err| SessionError::Env(format!("sched_setaffinity failed: {}", err)))?;
        }
        Ok(())
    }
}

fn cpuset(cpus: &[usize]) -> CpuSet {
    let mut set = CpuSet::new();
    for &cpu in cpus {
        // Out-of-range ids cannot happen for sets built from the topology.
        let _ = set.set(cpu);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_when_post_process_zero() {
        let part = CpuPartition::plan(8, 0, false).unwrap();
        assert!(!part.is_isolated());
        assert_eq!(part.profiler_set(), part.command_set());
        assert!(part.profiler_cpuset().is_none());
    }

    #[test]
    fn test_isolated_split_is_disjoint() {
        let part = CpuPartition::plan(8, 2, false).unwrap();
        assert!(part.is_isolated());
        assert_eq!(part.profiler_set(), &[0, 1, 2]);
        assert_eq!(part.command_set(), &[3, 4, 5, 6, 7]);
        for cpu in part.profiler_set() {
            assert!(!part.command_set().contains(cpu));
        }
    }

    #[test]
    fn test_small_machines_refuse_isolation() {
        assert!(matches!(
            CpuPartition::plan(3, 1, false),
            Err(SessionError::Topology(_))
        ));
        // No isolation requested still works.
        assert!(CpuPartition::plan(3, 0, false).is_ok());
    }

    #[test]
    fn test_post_process_clamping_bounds() {
        assert_eq!(max_post_process(4), 1);
        assert_eq!(max_post_process(3), 1);
        assert_eq!(max_post_process(2), 1);
        assert_eq!(max_post_process(16), 13);
        // hw=4 admits exactly one post-processing thread.
        assert!(CpuPartition::plan(4, 1, false).is_ok());
        assert!(matches!(
            CpuPartition::plan(4, 2, false),
            Err(SessionError::Topology(_))
        ));
    }

    #[test]
    fn test_remote_reserves_one_cpu() {
        let part = CpuPartition::plan(4, 1, true).unwrap();
        assert_eq!(part.profiler_set(), &[0]);
        assert_eq!(part.command_set(), &[1, 2, 3]);
    }
}
