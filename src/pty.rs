//! PTY-backed `kubectl exec` session.
//!
//! Spawning and all blocking I/O against the pseudo-terminal run on
//! `tokio::task::spawn_blocking`, following the pack's PTY-manager pattern:
//! `portable_pty`'s `MasterPty`/`Child`/reader/writer types are not `Send`
//! across await points in a way async code can use directly, so every touch
//! of them happens inside a blocking closure.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            cols: size.cols,
            rows: size.rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn exec process: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("session is not running")]
    NotRunning,
}

/// Bytes read off the PTY master, handed to the session's output pump.
pub type OutputReceiver = mpsc::Receiver<Vec<u8>>;

/// A live exec child plus the handles needed to drive it.
pub struct SpawnedPty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output_rx: Mutex<Option<OutputReceiver>>,
}

impl SpawnedPty {
    /// Take ownership of the output channel. May only be called once; the
    /// session's output pump is the sole consumer.
    pub fn take_output(&self) -> Option<OutputReceiver> {
        self.output_rx.lock().unwrap().take()
    }

    /// Write bytes to the child's stdin verbatim, with no escaping or
    /// transformation. Writes are serialised by the caller holding this
    /// `SpawnedPty` through a per-session lock.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut w = writer.lock().unwrap();
            w.write_all(&data).map_err(|e| PtyError::Io(e.to_string()))?;
            w.flush().map_err(|e| PtyError::Io(e.to_string()))
        })
        .await
        .map_err(|e| PtyError::Io(e.to_string()))?
    }

    pub async fn resize(&self, size: TerminalSize) -> Result<(), PtyError> {
        let master = self.master.lock().unwrap();
        master
            .resize(size.into())
            .map_err(|e| PtyError::Io(e.to_string()))
    }

    pub async fn kill(&self) -> Result<(), PtyError> {
        let mut child = self.child.lock().unwrap();
        child.kill().map_err(|e| PtyError::Io(e.to_string()))
    }
}

/// Abstracts "spawn a child attached to a pty for this pod/container",
/// letting tests substitute a non-`kubectl` command (see
/// [`test_support::EchoSpawner`]) without touching session logic.
#[async_trait]
pub trait PtySpawner: Send + Sync {
    async fn spawn(
        &self,
        pod: &str,
        container: &str,
        size: TerminalSize,
    ) -> Result<SpawnedPty, PtyError>;
}

/// The init script run inside the exec'd shell: history settings, a
/// coloured prompt, a vim-friendly `.vimrc`, arrow-key history search in
/// `.inputrc`, bash-completion if present, then `exec bash --login` falling
/// back to `sh`.
const INIT_SCRIPT: &str = r#"
export HISTSIZE=1000
export HISTFILESIZE=2000
export HISTCONTROL=ignoredups
export TERM=xterm-256color
export PS1='\[\033[1;32m\]\u@\h\[\033[0m\]:\[\033[1;34m\]\w\[\033[0m\]\$ '
cat > ~/.vimrc <<'VIMRC'
set nocompatible
set backspace=indent,eol,start
set t_Co=256
set ttyfast
set timeoutlen=100
set ttimeoutlen=10
set encoding=utf-8
VIMRC
cat > ~/.inputrc <<'INPUTRC'
"\e[A": history-search-backward
"\e[B": history-search-forward
INPUTRC
if [ -f /etc/bash_completion ]; then
    . /etc/bash_completion
fi
exec bash --login 2>/dev/null || exec sh
"#;

/// Production spawner: `kubectl exec -it -c=<container> <pod> -- /bin/bash
/// -c '<init>'`, attached to a real pseudo-terminal.
pub struct KubectlSpawner;

#[async_trait]
impl PtySpawner for KubectlSpawner {
    async fn spawn(
        &self,
        pod: &str,
        container: &str,
        size: TerminalSize,
    ) -> Result<SpawnedPty, PtyError> {
        let pod = pod.to_string();
        let container = container.to_string();

        let (master, child, writer, reader) = tokio::task::spawn_blocking(move || {
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(size.into())
                .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

            let container_flag = format!("-c={container}");
            let mut cmd = CommandBuilder::new("kubectl");
            cmd.args([
                "exec",
                "-it",
                container_flag.as_str(),
                pod.as_str(),
                "--",
                "/bin/bash",
                "-c",
                INIT_SCRIPT,
            ]);

            let child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
            drop(pair.slave);

            let writer = pair
                .master
                .take_writer()
                .map_err(|e| PtyError::Io(e.to_string()))?;
            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| PtyError::Io(e.to_string()))?;

            Ok::<_, PtyError>((pair.master, child, writer, reader))
        })
        .await
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))??;

        Ok(build_spawned_pty(master, child, writer, reader))
    }
}

/// Spawns the reader pump and assembles a [`SpawnedPty`] from raw
/// `portable_pty` handles. Shared by [`KubectlSpawner`] and test spawners.
fn build_spawned_pty(
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    mut reader: Box<dyn Read + Send>,
) -> SpawnedPty {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        tracing::debug!("pty reader pump ended");
    });

    SpawnedPty {
        master: Mutex::new(master),
        writer: Arc::new(Mutex::new(writer)),
        child: Mutex::new(child),
        output_rx: Mutex::new(Some(rx)),
    }
}

/// Test-only spawners that avoid depending on a real `kubectl` binary or a
/// live cluster.
pub mod test_support {
    use super::*;

    /// Spawns `/bin/cat`, a stand-in shell that echoes stdin to stdout
    /// verbatim — enough to exercise write/read/resize/close without a
    /// Kubernetes cluster.
    pub struct EchoSpawner;

    #[async_trait]
    impl PtySpawner for EchoSpawner {
        async fn spawn(
            &self,
            _pod: &str,
            _container: &str,
            size: TerminalSize,
        ) -> Result<SpawnedPty, PtyError> {
            tokio::task::spawn_blocking(move || {
                let pty_system = native_pty_system();
                let pair = pty_system
                    .openpty(size.into())
                    .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

                let cmd = CommandBuilder::new("cat");
                let child = pair
                    .slave
                    .spawn_command(cmd)
                    .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
                drop(pair.slave);

                let writer = pair
                    .master
                    .take_writer()
                    .map_err(|e| PtyError::Io(e.to_string()))?;
                let reader = pair
                    .master
                    .try_clone_reader()
                    .map_err(|e| PtyError::Io(e.to_string()))?;

                Ok::<_, PtyError>(build_spawned_pty(pair.master, child, writer, reader))
            })
            .await
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::EchoSpawner;
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn echo_spawner_round_trips_bytes() {
        let spawner = EchoSpawner;
        let pty = spawner
            .spawn("p-1", "c-1", TerminalSize::new(80, 24))
            .await
            .expect("spawn should succeed in test environment");

        let mut output_rx = pty.take_output().expect("output channel available");
        pty.write(b"hello\n".to_vec()).await.unwrap();

        let chunk = timeout(Duration::from_secs(2), output_rx.recv())
            .await
            .expect("did not time out")
            .expect("channel open");
        assert_eq!(chunk, b"hello\r\n");

        pty.kill().await.unwrap();
    }

    #[tokio::test]
    async fn resize_is_idempotent() {
        let spawner = EchoSpawner;
        let pty = spawner
            .spawn("p-1", "c-1", TerminalSize::new(80, 24))
            .await
            .unwrap();

        pty.resize(TerminalSize::new(100, 40)).await.unwrap();
        pty.resize(TerminalSize::new(100, 40)).await.unwrap();
        pty.kill().await.unwrap();
    }
}
