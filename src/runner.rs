//! Thread runner (spec section 4.B): spawns `threads` worker tasks bound
//! to an input buffer and an optional output buffer, dispatching
//! read/write/finish callbacks per message.
//!
//! Ordering across workers is not preserved — concurrent workers may
//! commit in an order different from their read order. Stages that need
//! order serialise themselves (see `scale` and `capture`).

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::buffer::{DmaFlags, PacketBuffer};
use crate::error::{PipelineError, Result};
use crate::message::{MsgHeader, HEADER_SIZE};

/// What a stage decided to do with a message during the read phase.
pub enum ReadOutcome<S> {
    /// Open a write of identical size and copy the bytes through
    /// unchanged.
    Copy,
    /// Open a write of `size` bytes, then call `Stage::write` with
    /// `state` to fill it. `state` is the safe replacement for the C
    /// `threadptr` slot: it carries whatever the read phase computed
    /// (e.g. a resample table snapshot) into the write phase without the
    /// two phases sharing a mutable map.
    Write { size: usize, state: S },
    /// The message needs no output at all; consume the input and move
    /// on without opening a write handle.
    Drop,
}

/// A pipeline processing stage driven by the thread runner.
pub trait Stage: Send + Sync {
    type State: Send;

    fn read(&self, header: &MsgHeader, payload: &[u8]) -> Result<ReadOutcome<Self::State>>;
    fn write(&self, state: Self::State, out: &mut [u8]) -> Result<()>;

    /// Invoked exactly once per worker when it exits, with the
    /// cumulative error for that worker (`Ok(())` on a clean shutdown via
    /// `Cancelled`).
    fn finish(&self, _result: Result<()>) {}
}

/// Owns the worker threads for one stage. Dropping (or `join`-ing) blocks
/// until every worker has observed `Cancelled` on its input buffer and
/// exited — the barrier spec section 4.E relies on to make `stop()` safe.
pub struct Runner {
    threads: Vec<JoinHandle<()>>,
}

impl Runner {
    pub fn spawn<S>(
        name: &str,
        threads: usize,
        input: Arc<PacketBuffer>,
        output: Option<Arc<PacketBuffer>>,
        stage: Arc<S>,
    ) -> Self
    where
        S: Stage + 'static,
    {
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let input = input.clone();
            let output = output.clone();
            let stage = stage.clone();
            let thread_name = format!("{name}-{i}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    log::debug!("{thread_name} started");
                    worker_loop(&input, output.as_ref(), stage.as_ref());
                    log::debug!("{thread_name} stopped");
                })
                .expect("failed to spawn stage worker thread");
            handles.push(handle);
        }
        Self { threads: handles }
    }

    pub fn join(self) {
        for h in self.threads {
            let _ = h.join();
        }
    }
}

fn worker_loop<S: Stage>(input: &Arc<PacketBuffer>, output: Option<&Arc<PacketBuffer>>, stage: &S) {
    let mut cumulative: Result<()> = Ok(());

    loop {
        let read_handle = match input.open_read(false) {
            Ok(h) => h,
            Err(PipelineError::Cancelled) => break,
            Err(e) => {
                cumulative = Err(e);
                break;
            }
        };

        let header = match MsgHeader::from_bytes(read_handle.bytes()) {
            Ok(h) => h,
            Err(e) => {
                cumulative = Err(e);
                break;
            }
        };
        let payload = &read_handle.bytes()[HEADER_SIZE..];

        let decision = stage.read(&header, payload);

        match decision {
            Err(e) => {
                cumulative = Err(e);
                break;
            }
            Ok(ReadOutcome::Drop) => {
                read_handle.close();
            }
            Ok(ReadOutcome::Copy) => {
                let bytes = read_handle.bytes().to_vec();
                read_handle.close();
                if let Some(out) = output {
                    if let Err(e) = forward_copy(out, &bytes) {
                        if matches!(e, PipelineError::Cancelled) {
                            break;
                        }
                        cumulative = Err(e);
                        break;
                    }
                }
            }
            Ok(ReadOutcome::Write { size, state }) => {
                read_handle.close();
                if let Some(out) = output {
                    match forward_write(out, size, state, stage) {
                        Ok(()) => {}
                        Err(PipelineError::Cancelled) => break,
                        Err(e) => {
                            cumulative = Err(e);
                            break;
                        }
                    }
                }
            }
        }
    }

    stage.finish(cumulative);
}

fn forward_copy(output: &Arc<PacketBuffer>, bytes: &[u8]) -> Result<()> {
    let mut w = output.open_write(false)?;
    w.set_size(bytes.len())?;
    w.write(bytes)?;
    w.close()
}

fn forward_write<S: Stage>(
    output: &Arc<PacketBuffer>,
    size: usize,
    state: S::State,
    stage: &S,
) -> Result<()> {
    let mut w = output.open_write(false)?;
    w.set_size(size)?;
    {
        let out = w.dma(size, DmaFlags::empty())?;
        stage.write(state, out)?;
    }
    w.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A stage that uppercases ASCII payloads, forwarding the message
    /// header unchanged — enough to exercise the write path without a
    /// real capture/scale stage.
    struct UppercaseStage {
        processed: AtomicUsize,
    }

    impl Stage for UppercaseStage {
        type State = Vec<u8>;

        fn read(&self, header: &MsgHeader, payload: &[u8]) -> Result<ReadOutcome<Self::State>> {
            if header.kind == MsgKind::Close {
                return Ok(ReadOutcome::Drop);
            }
            let upper: Vec<u8> = payload.iter().map(|b| b.to_ascii_uppercase()).collect();
            Ok(ReadOutcome::Write {
                size: HEADER_SIZE + upper.len(),
                state: upper,
            })
        }

        fn write(&self, state: Self::State, out: &mut [u8]) -> Result<()> {
            let header = MsgHeader { kind: MsgKind::VideoFrame, size: out.len() as u32 };
            out[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
            out[HEADER_SIZE..].copy_from_slice(&state);
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn runner_forwards_processed_messages() {
        let input = PacketBuffer::new(4096);
        let output = PacketBuffer::new(4096);
        let stage = Arc::new(UppercaseStage { processed: AtomicUsize::new(0) });

        let runner = Runner::spawn("test", 2, input.clone(), Some(output.clone()), stage.clone());

        for payload in [&b"hi"[..], b"there"] {
            let mut w = input.open_write(false).unwrap();
            let header = MsgHeader { kind: MsgKind::VideoFrame, size: (HEADER_SIZE + payload.len()) as u32 };
            w.set_size(HEADER_SIZE + payload.len()).unwrap();
            w.write(&header.to_bytes()).unwrap();
            w.write(payload).unwrap();
            w.close().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            let r = output.open_read(false).unwrap();
            seen.push(r.bytes()[HEADER_SIZE..].to_vec());
            r.close();
        }
        seen.sort();
        assert_eq!(seen, vec![b"HI".to_vec(), b"THERE".to_vec()]);

        input.cancel_buffer();
        output.cancel_buffer();
        runner.join();
        assert_eq!(stage.processed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn runner_exits_cleanly_on_cancel_with_no_messages() {
        let input = PacketBuffer::new(4096);
        let stage = Arc::new(UppercaseStage { processed: AtomicUsize::new(0) });
        let runner = Runner::spawn("idle", 1, input.clone(), None, stage);
        std::thread::sleep(Duration::from_millis(10));
        input.cancel_buffer();
        runner.join();
    }
}
