//! Shared fixtures for the engine tests
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use fanio::SharedBuffer;

/// Generous upper bound for conditions that should hold almost immediately
pub const SETTLE: Duration = Duration::from_secs(5);

/// Route engine logs to the test harness; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds; panic after `SETTLE`
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + SETTLE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Source fed by the test through a channel.
///
/// Each message is returned by one or more `read()` calls; an `Err` message
/// becomes a read failure; dropping the sender is end of stream.
pub struct ChannelSource {
    rx: Receiver<io::Result<Vec<u8>>>,
    leftover: Vec<u8>,
}

pub fn channel_source() -> (Sender<io::Result<Vec<u8>>>, ChannelSource) {
    let (tx, rx) = mpsc::channel();
    (
        tx,
        ChannelSource {
            rx,
            leftover: Vec::new(),
        },
    )
}

impl Read for ChannelSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv() {
                Ok(Ok(bytes)) => self.leftover = bytes,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(0),
            }
        }
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

/// Source that panics on its first read
pub struct PanickingSource;

impl Read for PanickingSource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        panic!("source exploded");
    }
}

/// Sink that accepts `ok_writes` writes, then fails every write
pub struct FailingSink {
    pub written: SharedBuffer,
    ok_writes: usize,
}

impl FailingSink {
    pub fn new(written: SharedBuffer, ok_writes: usize) -> Self {
        Self { written, ok_writes }
    }
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.ok_writes == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink gone"));
        }
        self.ok_writes -= 1;
        self.written.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that accepts every write and panics when dropped
pub struct PanicOnDropSink {
    pub written: SharedBuffer,
}

impl Write for PanicOnDropSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PanicOnDropSink {
    fn drop(&mut self) {
        panic!("sink exploded on drop");
    }
}

/// Sink that sleeps before every write
pub struct SlowSink {
    pub written: SharedBuffer,
    pub delay: Duration,
}

impl Write for SlowSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        thread::sleep(self.delay);
        self.written.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink whose writes block until the test drops the returned sender
pub struct GatedSink {
    pub written: SharedBuffer,
    gate: Receiver<()>,
    open: bool,
}

pub fn gated_sink(written: SharedBuffer) -> (Sender<()>, GatedSink) {
    let (tx, rx) = mpsc::channel();
    (
        tx,
        GatedSink {
            written,
            gate: rx,
            open: false,
        },
    )
}

impl Write for GatedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            // Blocks until the sender is dropped
            while self.gate.recv().is_ok() {}
            self.open = true;
        }
        self.written.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
