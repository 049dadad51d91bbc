//! Driving a non-blocking libssh2 session
//!
//! Sessions are switched to non-blocking mode once authenticated. libssh2
//! then holds the session lock only for the duration of a single call, so
//! channels on one session make progress independently. Every call must be
//! retried while it reports `EAGAIN`.

use crate::TransportError;
use rexec_core::{ChunkCopier, PollRead};
use ssh2::ErrorCode;
use std::io::Read;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Sleep schedule for poll loops: short after activity, growing while idle
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            delay: MIN_POLL_INTERVAL,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.delay = MIN_POLL_INTERVAL;
    }

    pub(crate) fn wait(&mut self) {
        thread::sleep(self.delay);
        self.delay = (self.delay * 2).min(MAX_POLL_INTERVAL);
    }
}

pub(crate) fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Retry a libssh2 call until it stops reporting `EAGAIN`. Blocking.
///
/// Sessions handed out by [`RemoteConnection`](crate::RemoteConnection) are
/// non-blocking, so direct calls on them (including SFTP operations) should
/// go through this helper.
pub fn until_ready<T, F>(mut op: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    let mut backoff = Backoff::new();
    loop {
        match op() {
            Err(e) if would_block(&e) => backoff.wait(),
            other => return other,
        }
    }
}

/// Copy every reader into its copier until `finished` reports that no more
/// data can arrive. Blocking.
///
/// `finished` is only consulted after a round in which no reader produced
/// anything, so data queued before the end is never lost.
pub(crate) fn drain<R, F>(
    pipes: &mut [(R, ChunkCopier)],
    mut finished: F,
    cancel: Option<&CancellationToken>,
) -> Result<(), TransportError>
where
    R: Read,
    F: FnMut() -> bool,
{
    let mut backoff = Backoff::new();
    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(TransportError::Cancelled);
        }

        let mut progressed = false;
        for (reader, copier) in pipes.iter_mut() {
            match copier.poll_copy(reader) {
                Ok(PollRead::Copied(_)) => progressed = true,
                Ok(PollRead::Pending | PollRead::Eof) => {}
                Err(e) => return Err(TransportError::Run(format!("read output: {}", e))),
            }
        }

        if progressed {
            backoff.reset();
        } else if finished() {
            return Ok(());
        } else {
            backoff.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_core::OutputStreams;
    use std::cell::Cell;
    use std::io::{self, ErrorKind};
    use std::rc::Rc;

    /// Produces its chunks one per ready read, with `WouldBlock` in between.
    /// `pending` counts chunks not yet handed out across every reader.
    struct Scripted {
        chunks: Vec<Vec<u8>>,
        pending: Rc<Cell<usize>>,
        ready: bool,
    }

    impl Scripted {
        fn new<I, C>(chunks: I, pending: &Rc<Cell<usize>>) -> Self
        where
            I: IntoIterator<Item = C>,
            C: AsRef<[u8]>,
        {
            let chunks: Vec<Vec<u8>> = chunks.into_iter().map(|c| c.as_ref().to_vec()).collect();
            pending.set(pending.get() + chunks.len());
            Self {
                chunks,
                pending: Rc::clone(pending),
                ready: false,
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.ready = !self.ready;
            if !self.ready || self.chunks.is_empty() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let chunk = self.chunks.remove(0);
            self.pending.set(self.pending.get() - 1);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    struct Failing;

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn test_would_block_classification() {
        let eagain = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_EAGAIN), "would block");
        let other = ssh2::Error::new(ErrorCode::Session(-7), "socket send");
        assert!(would_block(&eagain));
        assert!(!would_block(&other));
    }

    #[test]
    fn test_until_ready_retries_eagain() {
        let mut attempts = 0;
        let value = until_ready(|| {
            attempts += 1;
            if attempts < 4 {
                Err(ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_EAGAIN), "would block"))
            } else {
                Ok(attempts)
            }
        })
        .unwrap();
        assert_eq!(value, 4);
    }

    #[test]
    fn test_until_ready_returns_other_errors() {
        let mut attempts = 0;
        let err = until_ready(|| -> Result<(), ssh2::Error> {
            attempts += 1;
            Err(ssh2::Error::new(ErrorCode::Session(-18), "authentication failed"))
        })
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(!would_block(&err));
    }

    #[test]
    fn test_drain_interleaves_streams() {
        let (streams, captured) = OutputStreams::capture();
        let pending = Rc::new(Cell::new(0));
        let mut pipes = [
            (
                Scripted::new(["o1 ", "o2 ", "o3"], &pending),
                ChunkCopier::new(streams.stdout().clone()),
            ),
            (
                Scripted::new(["e1 ", "e2"], &pending),
                ChunkCopier::new(streams.stderr().clone()),
            ),
        ];

        drain(&mut pipes, || pending.get() == 0, None).unwrap();

        assert_eq!(captured.stdout_lossy(), "o1 o2 o3");
        assert_eq!(captured.stderr_lossy(), "e1 e2");
        assert_eq!(pipes[0].1.total(), 8);
        assert_eq!(pipes[1].1.total(), 5);
    }

    #[test]
    fn test_drain_stderr_without_stdout() {
        let (streams, captured) = OutputStreams::capture();
        let pending = Rc::new(Cell::new(0));
        let mut pipes = [
            (
                Scripted::new(Vec::<Vec<u8>>::new(), &pending),
                ChunkCopier::new(streams.stdout().clone()),
            ),
            (
                Scripted::new(vec![vec![b'e'; 4096]; 64], &pending),
                ChunkCopier::new(streams.stderr().clone()),
            ),
        ];

        drain(&mut pipes, || pending.get() == 0, None).unwrap();

        assert!(captured.stdout().is_empty());
        assert_eq!(captured.stderr().len(), 4096 * 64);
    }

    #[test]
    fn test_drain_stops_on_cancel() {
        let (streams, _captured) = OutputStreams::capture();
        let token = CancellationToken::new();
        token.cancel();
        let pending = Rc::new(Cell::new(0));
        let mut pipes = [(
            Scripted::new(["never"], &pending),
            ChunkCopier::new(streams.stdout().clone()),
        )];

        let err = drain(&mut pipes, || false, Some(&token)).unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[test]
    fn test_drain_read_error() {
        let (streams, _captured) = OutputStreams::capture();
        let mut pipes = [(Failing, ChunkCopier::new(streams.stdout().clone()))];

        let err = drain(&mut pipes, || true, None).unwrap_err();
        assert!(err.to_string().contains("read output"));
    }
}
