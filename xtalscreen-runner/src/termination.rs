use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Stages a child goes through while it is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    /// SIGTERM sent, waiting out the grace period
    Signaled,
    /// SIGKILL sent
    Killed,
    /// Exit status collected
    Reaped,
}

/// Escalating shutdown of a child process: `Running -> Signaled -> Killed -> Reaped`.
///
/// `Killed` is skipped when the child exits within the grace period after
/// the first signal. Every transition is recorded.
#[derive(Debug)]
pub struct Termination {
    grace: Duration,
    poll_interval: Duration,
    history: Vec<TerminationState>,
}

impl Termination {
    pub fn new(grace: Duration, poll_interval: Duration) -> Self {
        Self {
            grace,
            poll_interval,
            history: vec![TerminationState::Running],
        }
    }

    pub fn state(&self) -> TerminationState {
        self.history
            .last()
            .copied()
            .unwrap_or(TerminationState::Running)
    }

    pub fn history(&self) -> &[TerminationState] {
        &self.history
    }

    /// True once a termination signal had to be sent
    pub fn was_signaled(&self) -> bool {
        self.history.contains(&TerminationState::Signaled)
    }

    fn advance(&mut self, next: TerminationState) {
        debug!(from = ?self.state(), to = ?next, "Termination state change");
        self.history.push(next);
    }

    /// Stop `child` and collect its exit status.
    pub async fn terminate(&mut self, child: &mut Child) -> io::Result<ExitStatus> {
        if let Some(status) = child.try_wait()? {
            self.advance(TerminationState::Reaped);
            return Ok(status);
        }

        send_sigterm(child)?;
        self.advance(TerminationState::Signaled);

        let deadline = Instant::now().checked_add(self.grace);
        loop {
            if let Some(status) = child.try_wait()? {
                self.advance(TerminationState::Reaped);
                return Ok(status);
            }
            let now = Instant::now();
            match deadline {
                Some(deadline) if now >= deadline => break,
                Some(deadline) => tokio::time::sleep(self.poll_interval.min(deadline - now)).await,
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }

        warn!(
            pid = ?child.id(),
            grace = ?self.grace,
            "Process ignored termination signal, killing it"
        );
        child.start_kill()?;
        self.advance(TerminationState::Killed);

        let status = child.wait().await?;
        self.advance(TerminationState::Reaped);
        Ok(status)
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        // Exited between the status check and the signal; reaped below.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// Exit code as reported in results. A child killed by signal `N` reports `-N`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;

    /// Spawn a shell script and wait until it printed its first line, so any
    /// signal dispositions it sets up are in place.
    async fn spawn_ready(script: &str) -> Child {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "ready");
        child
    }

    #[tokio::test]
    async fn test_cooperative_child_is_reaped_after_signal() {
        let mut child = spawn_ready("echo ready; exec sleep 30").await;
        let mut termination =
            Termination::new(Duration::from_secs(5), Duration::from_millis(10));

        let status = termination.terminate(&mut child).await.unwrap();

        assert_eq!(exit_code(status), -15);
        assert_eq!(
            termination.history(),
            &[
                TerminationState::Running,
                TerminationState::Signaled,
                TerminationState::Reaped
            ]
        );
        assert!(termination.was_signaled());
    }

    #[tokio::test]
    async fn test_child_ignoring_sigterm_is_killed() {
        let mut child = spawn_ready("trap '' TERM; echo ready; exec sleep 30").await;
        let mut termination =
            Termination::new(Duration::from_millis(200), Duration::from_millis(10));

        let started = Instant::now();
        let status = termination.terminate(&mut child).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(exit_code(status), -9);
        assert_eq!(
            termination.history(),
            &[
                TerminationState::Running,
                TerminationState::Signaled,
                TerminationState::Killed,
                TerminationState::Reaped
            ]
        );
    }

    #[tokio::test]
    async fn test_exited_child_is_reaped_without_signal() {
        let mut child = Command::new("true").spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut termination =
            Termination::new(Duration::from_millis(100), Duration::from_millis(10));

        let status = termination.terminate(&mut child).await.unwrap();

        assert!(status.success());
        assert!(!termination.was_signaled());
        assert_eq!(termination.state(), TerminationState::Reaped);
    }
}
