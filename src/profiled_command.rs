//! Fork-pipe-exec wrapper for the profiled command.
//!
//! Provides [`ProfiledChild`] and [`spawn_profiled_child`] which fork a
//! child that waits for a readiness signal before calling exec. The parent
//! uses the gap to attach the probes to the child's PID, run the warmup,
//! and exchange the session epoch with the ingest peer before any user
//! code runs.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::sched::CpuSet;

/// A child process that has been forked but is waiting to exec.
///
/// The child blocks on a pipe until [`signal_exec`](ProfiledChild::signal_exec)
/// is called, at which point it applies its CPU affinity and calls `execv`.
/// A second pipe with `O_CLOEXEC` on the write end lets the parent detect
/// when exec completes.
///
/// On drop, if the child has not been waited on, it is killed with
/// `SIGKILL` and reaped.
pub struct ProfiledChild {
    /// The child's PID, which the probes attach to.
    pub pid: u32,
    /// Write end of the "ready" pipe. Writing signals the child to exec.
    ready_write_fd: Option<i32>,
    /// Read end of the "exec" pipe. EOF means exec succeeded; data means failure.
    exec_read_fd: Option<i32>,
    waited: bool,
}

impl Drop for ProfiledChild {
    fn drop(&mut self) {
        if let Some(fd) = self.ready_write_fd.take() {
            unsafe { libc::close(fd) };
        }
        if let Some(fd) = self.exec_read_fd.take() {
            unsafe { libc::close(fd) };
        }

        if !self.waited {
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
                let mut status: i32 = 0;
                libc::waitpid(self.pid as i32, &mut status, 0);
            }
        }
    }
}

impl ProfiledChild {
    /// Signal the child to call exec. This writes a byte to the ready pipe
    /// and closes it.
    pub fn signal_exec(&mut self) -> Result<()> {
        if let Some(fd) = self.ready_write_fd.take() {
            let buf: [u8; 1] = [1];
            let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
            // Capture errno before close() can clobber it
            let write_err = if ret < 0 {
                Some(std::io::Error::last_os_error())
            } else {
                None
            };
            unsafe { libc::close(fd) };
            if let Some(err) = write_err {
                bail!("Failed to signal the profiled command to exec: {}", err);
            }
        }
        Ok(())
    }

    /// Wait for the child to complete exec. Returns Ok(()) on success.
    ///
    /// Reads from the CLOEXEC exec pipe. EOF means exec succeeded.
    /// If data is read, exec failed and the data contains the errno.
    pub fn wait_for_exec(&mut self) -> Result<()> {
        if let Some(fd) = self.exec_read_fd.take() {
            let mut buf = [0u8; 4];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 4) };
            let read_err = if n < 0 {
                Some(std::io::Error::last_os_error())
            } else {
                None
            };
            unsafe { libc::close(fd) };

            if let Some(err) = read_err {
                bail!("Failed to read the exec status pipe: {}", err);
            }
            if n > 0 {
                // Child wrote errno before _exit - exec failed
                let errno = if n >= 4 {
                    i32::from_ne_bytes(buf)
                } else {
                    buf[0] as i32
                };
                let mut status: i32 = 0;
                unsafe { libc::waitpid(self.pid as i32, &mut status, 0) };
                self.waited = true;
                bail!(
                    "Failed to exec the profiled command: {}",
                    std::io::Error::from_raw_os_error(errno)
                );
            }
            // n == 0: EOF, exec succeeded
        }
        Ok(())
    }

    /// Block until the child exits; returns its exit code, or 128+signal if
    /// it died to one.
    pub fn wait(&mut self) -> Result<i32> {
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.pid as i32, &mut status, 0) };
        if ret < 0 {
            bail!(
                "waitpid on the profiled command failed: {}",
                std::io::Error::last_os_error()
            );
        }
        self.waited = true;
        if libc::WIFEXITED(status) {
            Ok(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Ok(128 + libc::WTERMSIG(status))
        } else {
            Ok(1)
        }
    }
}

/// Resolve a command name to its full path by searching PATH.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);

    // If it contains a slash, treat as a direct path
    if name.contains('/') {
        if !path.exists() {
            bail!("Command not found: {}", name);
        }
        let metadata =
            std::fs::metadata(path).with_context(|| format!("Cannot stat '{}'", name))?;
        if !metadata.is_file() {
            bail!("'{}' is not a regular file", name);
        }
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            bail!("'{}' is not executable", name);
        }
        return Ok(path.to_path_buf());
    }

    // Search PATH
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = Path::new(dir).join(name);
            if candidate.exists() {
                if let Ok(metadata) = std::fs::metadata(&candidate) {
                    use std::os::unix::fs::PermissionsExt;
                    if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                        return Ok(candidate);
                    }
                }
            }
        }
    }

    bail!(
        "Command '{}' not found in PATH. Specify the full path to the executable.",
        name
    );
}

/// Fork a child process that waits to exec the given command, optionally
/// pinned to `affinity` before exec.
///
/// # Safety
///
/// This function calls `libc::fork()`. The child path uses only
/// async-signal-safe functions and **never returns** — it always calls
/// `_exit()` or `execv()`.
pub fn spawn_profiled_child(command: &[String], affinity: Option<CpuSet>) -> Result<ProfiledChild> {
    if command.is_empty() {
        bail!("No command specified to profile");
    }

    // Resolve the executable path before fork (involves Rust allocations)
    let resolved_path =
        resolve_executable(&command[0]).with_context(|| "Failed to resolve the command")?;

    // Prepare CStrings before fork (no allocations allowed in child after fork)
    let path_cstr = CString::new(resolved_path.as_os_str().as_bytes())
        .with_context(|| "Command path contains null byte")?;

    let arg_cstrings: Vec<CString> = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("Argument contains null byte: {}", arg))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut argv: Vec<*const libc::c_char> = arg_cstrings.iter().map(|s| s.as_ptr()).collect();
    argv.push(std::ptr::null());

    // The raw mask for the child-side sched_setaffinity call, prepared
    // before fork.
    let cpu_mask: Option<libc::cpu_set_t> = affinity.map(|set| {
        let mut mask: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in 0..CpuSet::count() {
            if set.is_set(cpu).unwrap_or(false) {
                unsafe { libc::CPU_SET(cpu, &mut mask) };
            }
        }
        mask
    });

    // Create ready_pipe: parent writes to signal child to exec
    let mut ready_fds = [0i32; 2];
    if unsafe { libc::pipe(ready_fds.as_mut_ptr()) } != 0 {
        bail!(
            "Failed to create the ready pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let ready_read = ready_fds[0];
    let ready_write = ready_fds[1];

    // Create exec_pipe with O_CLOEXEC: EOF on exec success, data on failure
    let mut exec_fds = [0i32; 2];
    if unsafe { libc::pipe2(exec_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        unsafe {
            libc::close(ready_read);
            libc::close(ready_write);
        }
        bail!(
            "Failed to create the exec pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let exec_read = exec_fds[0];
    let exec_write = exec_fds[1];

    // Save parent PID before fork for the PR_SET_PDEATHSIG race check
    let parent_pid = unsafe { libc::getpid() };

    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            unsafe {
                libc::close(ready_read);
                libc::close(ready_write);
                libc::close(exec_read);
                libc::close(exec_write);
            }
            bail!("fork() failed: {}", std::io::Error::last_os_error());
        }
        0 => {
            // ===== CHILD PROCESS =====
            // Only async-signal-safe libc calls from here.
            // NEVER return from this branch - always _exit() or exec.
            unsafe {
                libc::close(ready_write);
                libc::close(exec_read);

                // If parent dies before signaling, we get SIGTERM
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);

                // Check for the PR_SET_PDEATHSIG race: if the parent already
                // died between fork() and prctl(), we were reparented.
                if libc::getppid() != parent_pid {
                    libc::_exit(1);
                }

                if let Some(mask) = &cpu_mask {
                    libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), mask);
                }

                // Block until parent signals readiness
                let mut buf = [0u8; 1];
                let n = libc::read(ready_read, buf.as_mut_ptr() as *mut libc::c_void, 1);
                libc::close(ready_read);

                if n <= 0 {
                    // EOF (parent died) or error - exit without exec
                    libc::_exit(1);
                }

                // exec the command (O_CLOEXEC closes exec_write on success)
                libc::execv(path_cstr.as_ptr(), argv.as_ptr());

                // If we get here, exec failed. Write errno to exec_pipe.
                let errno = *libc::__errno_location();
                let errno_bytes = errno.to_ne_bytes();
                libc::write(exec_write, errno_bytes.as_ptr() as *const libc::c_void, 4);
                libc::close(exec_write);
                libc::_exit(127);
            }
        }
        child_pid => {
            // ===== PARENT PROCESS =====
            unsafe {
                libc::close(ready_read);
                libc::close(exec_write);
            }

            Ok(ProfiledChild {
                pid: child_pid as u32,
                ready_write_fd: Some(ready_write),
                exec_read_fd: Some(exec_read),
                waited: false,
            })
        }
    }
}
