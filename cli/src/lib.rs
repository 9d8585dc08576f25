//! Command implementations behind the `fanio` binary
//!
//! The functions here take already opened readers and writers so that the
//! binary only deals with argument parsing and opening files.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use fanio::{DestinationEvent, DestinationInfo, DestinationState, FanIn, FanInOptions, FanOut};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// Size of the buffer used to move bytes between the engines and the caller
const COPY_BUFFER_SIZE: usize = 8192;

/// A reader or writer together with the name used in logs and reports
pub struct Named<T> {
    pub name: String,
    pub inner: T,
}

impl<T> Named<T> {
    pub fn new(name: impl Into<String>, inner: T) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

pub type NamedInput = Named<Box<dyn Read + Send>>;
pub type NamedOutput = Named<Box<dyn Write + Send>>;

/// Settings of the `merge` command
#[derive(Debug, Clone, Default)]
pub struct MergeSettings {
    pub chunk_size: Option<usize>,
    pub uppercase: bool,
}

/// Merge all `inputs` into `out`; returns the number of bytes copied
///
/// # Errors
///
/// Fails on the first input read error, or if writing to `out` fails.
pub fn run_merge<W: Write>(inputs: Vec<NamedInput>, settings: &MergeSettings, out: &mut W) -> Result<u64> {
    let mut options = FanInOptions::default();
    if let Some(chunk_size) = settings.chunk_size {
        options.chunk_size = chunk_size;
    }
    let fan_in = FanIn::with_options(options);
    if settings.uppercase {
        fan_in.set_chunk_filter(|mut bytes| {
            bytes.make_ascii_uppercase();
            bytes
        });
    }

    for input in inputs {
        let handle = fan_in
            .attach_named_source(&input.name, input.inner)
            .with_context(|| format!("cannot attach input '{}'", input.name))?;
        debug!(input = %input.name, source = %handle, "input attached");
    }

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = fan_in.read(&mut buf).context("merge failed")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("cannot write merged output")?;
        total += n as u64;
    }
    out.flush().context("cannot flush merged output")?;

    info!(bytes = total, "merge finished");
    Ok(total)
}

/// Outcome of the `tee` command
#[derive(Debug)]
pub struct TeeReport {
    /// Bytes read from the input and broadcast
    pub bytes: u64,
    /// Destinations that failed while the others kept receiving data
    pub failed: Vec<DestinationInfo>,
}

impl TeeReport {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Copy `input` to every output; a failing output does not stop the others
///
/// # Errors
///
/// Fails if reading `input` fails or an output cannot be attached.
/// Failures of individual outputs are returned in the report instead.
pub fn run_tee<R: Read>(mut input: R, outputs: Vec<NamedOutput>) -> Result<TeeReport> {
    let fan_out = FanOut::new();
    let mut events = fan_out.subscribe();

    for output in outputs {
        let handle = fan_out
            .attach_named_destination(&output.name, output.inner)
            .with_context(|| format!("cannot attach output '{}'", output.name))?;
        debug!(output = %output.name, destination = %handle, "output attached");
    }

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    let copied: Result<()> = loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(anyhow::Error::new(e).context("cannot read input")),
        };
        if let Err(e) = fan_out.write(&buf[..n]) {
            break Err(anyhow::Error::new(e).context("broadcast failed"));
        }
        total += n as u64;
        warn_about_failures(&mut events);
    };

    // Let the outputs write out what they already got even if the input failed
    fan_out.close().context("cannot close outputs")?;
    warn_about_failures(&mut events);
    copied?;

    let failed: Vec<DestinationInfo> = fan_out
        .destinations()
        .into_iter()
        .filter(|d| d.state == DestinationState::Errored)
        .collect();
    info!(bytes = total, failed = failed.len(), "tee finished");
    Ok(TeeReport {
        bytes: total,
        failed,
    })
}

fn warn_about_failures(events: &mut broadcast::Receiver<DestinationEvent>) {
    loop {
        match events.try_recv() {
            Ok(DestinationEvent::Failed { destination, error }) => {
                warn!(destination = %destination, %error, "output failed, others continue");
            }
            Ok(DestinationEvent::Closed { name, .. }) => debug!(output = %name, "output closed"),
            Err(TryRecvError::Lagged(missed)) => debug!(missed, "destination events lagged"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}
