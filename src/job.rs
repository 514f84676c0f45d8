//! Job values and the rendezvous queue between intake and the worker.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One accepted submission's worth of work.
///
/// Created by the intake handler, consumed and destroyed by the worker.
/// Never shared between jobs.
pub struct Job {
    /// Repository locator, passed verbatim to `git clone`.
    pub repository: String,
    /// Branch name, passed verbatim to `git clone --branch`.
    pub branch: String,
    /// The patch bytes to feed to `git am`.
    pub patch: PatchSource,
}

// ---------------------------------------------------------------------------
// Patch byte source
// ---------------------------------------------------------------------------

/// A finite, forward-only, single-consumer patch byte source.
///
/// Read at most once via [`PatchSource::copy_to`]; closed exactly once,
/// when the value drops — either inside the apply step or with the job if
/// an earlier step failed.
pub enum PatchSource {
    /// An uploaded `patch` form part, already bounded by the form limit.
    Buffered(Bytes),
    /// The body of a GET against a submitted `url`.  Never buffered in
    /// full; streamed chunk-by-chunk, with `limit` as a hard ceiling on
    /// the total bytes accepted.
    Remote {
        response: reqwest::Response,
        limit: u64,
    },
}

impl PatchSource {
    /// Copy the entire source into `writer` and return the number of bytes
    /// written.  A `Remote` source whose body grows past its ceiling
    /// aborts the copy with an error.
    pub async fn copy_to<W>(self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            Self::Buffered(bytes) => {
                writer
                    .write_all(&bytes)
                    .await
                    .context("failed to write buffered patch")?;
                Ok(bytes.len() as u64)
            }
            Self::Remote {
                mut response,
                limit,
            } => {
                let mut written: u64 = 0;
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .context("failed to read patch from upstream")?
                {
                    written += chunk.len() as u64;
                    if written > limit {
                        bail!("remote patch exceeds the {limit}-byte ceiling");
                    }
                    writer
                        .write_all(&chunk)
                        .await
                        .context("failed to write remote patch")?;
                }
                Ok(written)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub type JobSender = flume::Sender<Job>;
pub type JobReceiver = flume::Receiver<Job>;

/// Build the zero-capacity hand-off channel.
///
/// A send completes only when the worker's receive takes the job, so at
/// most one job is in flight system-wide and producers block until the
/// worker is idle.
pub fn job_queue() -> (JobSender, JobReceiver) {
    flume::bounded(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
