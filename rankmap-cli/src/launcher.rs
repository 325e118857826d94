//! Rank Launcher
//!
//! Starts ranks 1..P-1 as child processes of the coordinator and hands back
//! the coordinator's end of each connection.
//!
//! Every child is a copy of the current executable started with the hidden
//! `--rank-worker` flag. Its connection is a pipe pair dup'ed onto fd 3
//! (coordinator → rank) and fd 4 (rank → coordinator); its identity and team
//! shape arrive through environment variables.

use crate::transport::{IPC_FD_ENV, StreamLink};
use rankmap_core::{BindPolicy, Rank};
use rankmap_ipc::{HubMessage, RankMessage};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;

/// Hidden flag that turns the binary into a rank worker
pub const RANK_WORKER_FLAG: &str = "--rank-worker";

/// Rank of a worker process
pub const RANK_ENV: &str = "RANKMAP_RANK";

/// Number of ranks in the job
pub const SIZE_ENV: &str = "RANKMAP_SIZE";

/// Team size of a worker process
pub const THREADS_ENV: &str = "RANKMAP_THREADS";

/// Binding policy of a worker process
pub const BIND_ENV: &str = "RANKMAP_BIND";

/// Errors raised while starting or reaping rank processes
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The running executable could not be located
    #[error("Failed to locate the rankmap executable")]
    CurrentExe(#[source] std::io::Error),

    /// Creating a rank's pipes failed
    #[error("Failed to create pipe for rank {rank}")]
    Pipe {
        /// Rank being started
        rank: Rank,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Starting a rank process failed
    #[error("Failed to spawn rank {rank}")]
    Spawn {
        /// Rank being started
        rank: Rank,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Waiting on a rank process failed
    #[error("Failed to wait for rank {rank}")]
    Wait {
        /// Rank being reaped
        rank: Rank,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// A rank process exited unsuccessfully
    #[error("Rank {rank} exited with {status}")]
    RankFailed {
        /// Rank that failed
        rank: Rank,
        /// Its exit status
        status: ExitStatus,
    },
}

/// Coordinator end of a pipe connection.
pub type HubStream = StreamLink<std::fs::File, std::fs::File, HubMessage, RankMessage>;

/// Lowest fd a pipe end may occupy. Rank workers expect their link on fds 3
/// and 4, so no parent-side end may sit there while the child rearranges them.
const PIPE_FD_FLOOR: RawFd = 10;

/// Create a pipe pair, returning (read_fd, write_fd).
///
/// Both ends are close-on-exec and at or above [`PIPE_FD_FLOOR`].
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let read_fd = match lift_fd(fds[0]) {
        Ok(fd) => fd,
        Err(e) => {
            close_fd(fds[1]);
            return Err(e);
        }
    };
    match lift_fd(fds[1]) {
        Ok(write_fd) => Ok((read_fd, write_fd)),
        Err(e) => {
            close_fd(read_fd);
            Err(e)
        }
    }
}

/// Move `fd` to the lowest free descriptor at or above [`PIPE_FD_FLOOR`],
/// close-on-exec. The original is closed either way.
fn lift_fd(fd: RawFd) -> Result<RawFd, std::io::Error> {
    let lifted = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, PIPE_FD_FLOOR) };
    let result = if lifted < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(lifted)
    };
    close_fd(fd);
    result
}

/// Close a raw file descriptor.
fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send SIGTERM to a process. Returns `Err` if the signal could not be delivered.
fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A running rank process.
///
/// Dropping a handle whose process is still running terminates it.
pub struct RankProcess {
    rank: Rank,
    child: Child,
}

impl RankProcess {
    fn spawn(
        binary: &Path,
        rank: Rank,
        size: usize,
        threads: usize,
        bind: BindPolicy,
        verbose: bool,
    ) -> Result<(Self, HubStream), LaunchError> {
        // cmd_pipe: coordinator writes → rank reads from fd 3
        let (cmd_read, cmd_write) =
            create_pipe().map_err(|source| LaunchError::Pipe { rank, source })?;
        // msg_pipe: rank writes to fd 4 → coordinator reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(source) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(LaunchError::Pipe { rank, source });
            }
        };

        let mut command = Command::new(binary);
        command.arg(RANK_WORKER_FLAG);
        if verbose {
            command.arg("--verbose");
        }
        command
            .env(IPC_FD_ENV, "3,4")
            .env(RANK_ENV, rank.to_string())
            .env(SIZE_ENV, size.to_string())
            .env(THREADS_ENV, threads.to_string())
            .env(BIND_ENV, bind.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // In the child: cmd_read becomes fd 3 and msg_write fd 4. Every pipe
        // end sits above PIPE_FD_FLOOR, so neither dup2 can land on another end.
        unsafe {
            command.pre_exec(move || {
                // dup2 clears close-on-exec on the new descriptor
                if libc::dup2(cmd_read, 3) < 0 || libc::dup2(msg_write, 4) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(cmd_read);
                libc::close(msg_write);
                // Parent-side ends that leaked into the child
                libc::close(cmd_write);
                libc::close(msg_read);
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(source) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(LaunchError::Spawn { rank, source });
            }
        };

        // Child-side ends belong to the child now
        close_fd(cmd_read);
        close_fd(msg_write);

        let writer_file = unsafe { std::fs::File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { std::fs::File::from_raw_fd(msg_read) };

        tracing::debug!(rank, pid = child.id(), threads, "rank process started");
        Ok((Self { rank, child }, StreamLink::new(reader_file, writer_file)))
    }

    /// Rank of this process.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Check if the process is still running
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<ExitStatus, LaunchError> {
        self.child.wait().map_err(|source| LaunchError::Wait {
            rank: self.rank,
            source,
        })
    }
}

impl Drop for RankProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            // Graceful: SIGTERM first, brief wait, then SIGKILL
            let _ = send_sigterm(self.child.id());
            std::thread::sleep(Duration::from_millis(50));
            if self.is_alive() {
                let _ = self.child.kill();
            }
            let _ = self.child.wait();
        }
    }
}

/// Starts rank processes from one executable.
#[derive(Debug, Clone)]
pub struct Launcher {
    binary: PathBuf,
    verbose: bool,
}

impl Launcher {
    /// Launch copies of the running executable.
    pub fn current() -> Result<Self, LaunchError> {
        let binary = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        Ok(Self::with_binary(binary))
    }

    /// Launch copies of `binary`.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            verbose: false,
        }
    }

    /// Pass `--verbose` to every rank.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Start ranks `1..team_sizes.len()`, rank `r` with `team_sizes[r]`
    /// threads. Returns the processes and the coordinator's links, both in
    /// rank order.
    ///
    /// If any rank fails to start, the ones already started are terminated.
    pub fn spawn_ranks(
        &self,
        team_sizes: &[usize],
        bind: BindPolicy,
    ) -> Result<(Vec<RankProcess>, Vec<HubStream>), LaunchError> {
        let size = team_sizes.len();
        let mut processes = Vec::with_capacity(size.saturating_sub(1));
        let mut links = Vec::with_capacity(size.saturating_sub(1));
        for (rank, &threads) in team_sizes.iter().enumerate().skip(1) {
            let (process, link) =
                RankProcess::spawn(&self.binary, rank, size, threads, bind, self.verbose)?;
            processes.push(process);
            links.push(link);
        }
        Ok((processes, links))
    }
}

/// Wait for every rank to exit, reporting the first one that failed.
pub fn wait_all(processes: Vec<RankProcess>) -> Result<(), LaunchError> {
    let mut first_failure = None;
    for mut process in processes {
        let status = process.wait()?;
        if !status.success() {
            tracing::warn!(rank = process.rank(), %status, "rank exited abnormally");
            first_failure.get_or_insert(LaunchError::RankFailed {
                rank: process.rank(),
                status,
            });
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_create_pipe_round_trip() {
        let (read_fd, write_fd) = create_pipe().unwrap();
        let mut writer = unsafe { std::fs::File::from_raw_fd(write_fd) };
        let mut reader = unsafe { std::fs::File::from_raw_fd(read_fd) };
        writer.write_all(b"rank").unwrap();
        drop(writer);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "rank");
    }

    #[test]
    fn test_pipe_ends_clear_of_link_fds() {
        let pipes: Vec<_> = (0..4).map(|_| create_pipe().unwrap()).collect();
        for &(read_fd, write_fd) in &pipes {
            for fd in [read_fd, write_fd] {
                assert!(fd >= PIPE_FD_FLOOR, "pipe end on fd {fd}");
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
                assert_ne!(flags & libc::FD_CLOEXEC, 0);
            }
        }
        for (read_fd, write_fd) in pipes {
            close_fd(read_fd);
            close_fd(write_fd);
        }
    }

    #[test]
    fn test_spawn_missing_binary() {
        let launcher = Launcher::with_binary("/nonexistent/rankmap-binary");
        let err = launcher
            .spawn_ranks(&[1, 1], BindPolicy::None)
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::Spawn { rank: 1, .. }));
    }

    #[test]
    fn test_single_rank_spawns_nothing() {
        let launcher = Launcher::with_binary("/nonexistent/rankmap-binary");
        let (processes, links) = launcher.spawn_ranks(&[4], BindPolicy::None).unwrap();
        assert!(processes.is_empty() && links.is_empty());
    }

    #[test]
    fn test_wait_all_reports_failure() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let processes = vec![RankProcess { rank: 1, child }];
        assert!(matches!(
            wait_all(processes),
            Err(LaunchError::RankFailed { rank: 1, .. })
        ));
    }
}
