//! Frame fetch workers.
//!
//! Each worker is a Tokio task with a private job queue
//! and a private outcome queue.
//! Instances made of more than two frame fragments
//! are fetched with bounded intra-instance concurrency,
//! and fragment decoding runs on the blocking thread pool.
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use futures_util::FutureExt;
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::decode::{DecodeError, FrameDecoder};
use crate::source::{ImageSetSource, SourceError};

/// The request to fetch and decode every frame of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchJob {
    pub datastore_id: String,
    pub image_set_id: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    /// frame identifiers in fragment order
    pub frame_ids: Vec<String>,
    pub instance_number: Option<i64>,
}

/// A fetch job with its decoded pixel data.
#[derive(Debug)]
pub struct FetchResult {
    pub job: FetchJob,
    pub pixel_data: Vec<u8>,
}

/// A fetch job which could not be completed.
#[derive(Debug)]
pub struct FetchFailure {
    pub job: FetchJob,
    pub error: FetchError,
}

pub type FetchOutcome = Result<FetchResult, FetchFailure>;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FetchError {
    #[snafu(display("Could not fetch frame {}", frame_id))]
    FrameFetchFailed {
        frame_id: String,
        source: SourceError,
    },
    #[snafu(display("Could not decode frame {}", frame_id))]
    FrameDecodeFailed {
        frame_id: String,
        source: DecodeError,
    },
    /// Decoding task panicked or was cancelled
    DecodeTaskFailed { source: tokio::task::JoinError },
    #[snafu(display("Fetching instance {} panicked", sop_instance_uid))]
    FetchPanicked { sop_instance_uid: String },
}

/// Intra-instance concurrency settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FanOut {
    /// maximum number of fragment chunks in flight
    pub width: usize,
    /// number of fragments fetched sequentially per chunk
    pub chunk_size: usize,
}

impl Default for FanOut {
    fn default() -> Self {
        FanOut {
            width: 100,
            chunk_size: 5,
        }
    }
}

/// Concatenate decoded fragments in ascending fragment index order.
pub fn assemble_fragments(mut fragments: Vec<(usize, Vec<u8>)>) -> Vec<u8> {
    fragments.sort_by_key(|(index, _)| *index);
    let len = fragments.iter().map(|(_, data)| data.len()).sum();
    let mut out = Vec::with_capacity(len);
    for (_, data) in fragments {
        out.extend_from_slice(&data);
    }
    out
}

async fn fetch_fragment<S, D>(
    source: &S,
    decoder: &Arc<D>,
    datastore_id: &str,
    image_set_id: &str,
    frame_id: &str,
) -> Result<Vec<u8>, FetchError>
where
    S: ImageSetSource,
    D: FrameDecoder + 'static,
{
    let blob = source
        .get_image_frame(datastore_id, image_set_id, frame_id)
        .await
        .context(FrameFetchFailedSnafu { frame_id })?;
    let decoder = Arc::clone(decoder);
    tokio::task::spawn_blocking(move || decoder.decode(&blob))
        .await
        .context(DecodeTaskFailedSnafu)?
        .context(FrameDecodeFailedSnafu { frame_id })
}

/// Fetch a chunk of fragments one after the other.
async fn fetch_chunk<S, D>(
    source: Arc<S>,
    decoder: Arc<D>,
    datastore_id: String,
    image_set_id: String,
    chunk: Vec<(usize, String)>,
) -> Result<Vec<(usize, Vec<u8>)>, FetchError>
where
    S: ImageSetSource,
    D: FrameDecoder + 'static,
{
    let mut out = Vec::with_capacity(chunk.len());
    for (index, frame_id) in chunk {
        let data = fetch_fragment(&*source, &decoder, &datastore_id, &image_set_id, &frame_id)
            .await?;
        out.push((index, data));
    }
    Ok(out)
}

/// Fetch and decode every fragment of a job,
/// returning the concatenated native pixel data.
pub async fn fetch_job<S, D>(
    source: &Arc<S>,
    decoder: &Arc<D>,
    job: &FetchJob,
    fan_out: FanOut,
) -> Result<Vec<u8>, FetchError>
where
    S: ImageSetSource,
    D: FrameDecoder + 'static,
{
    if job.frame_ids.len() <= 2 {
        let mut pixel_data = Vec::new();
        for frame_id in &job.frame_ids {
            let data = fetch_fragment(
                &**source,
                decoder,
                &job.datastore_id,
                &job.image_set_id,
                frame_id,
            )
            .await?;
            pixel_data.extend_from_slice(&data);
        }
        return Ok(pixel_data);
    }

    let indexed: Vec<(usize, String)> = job.frame_ids.iter().cloned().enumerate().collect();
    let chunks: Vec<_> = indexed
        .chunks(fan_out.chunk_size.max(1))
        .map(|chunk| {
            fetch_chunk(
                Arc::clone(source),
                Arc::clone(decoder),
                job.datastore_id.clone(),
                job.image_set_id.clone(),
                chunk.to_vec(),
            )
        })
        .collect();
    debug!(
        "Fetching {} fragments of {} in {} chunks",
        job.frame_ids.len(),
        job.sop_instance_uid,
        chunks.len()
    );

    let fragments: Vec<Vec<(usize, Vec<u8>)>> = stream::iter(chunks)
        .buffer_unordered(fan_out.width.max(1))
        .try_collect()
        .await?;
    Ok(assemble_fragments(fragments.into_iter().flatten().collect()))
}

/// A frame fetch worker.
#[derive(Debug)]
pub struct FrameFetcher {
    jobs: mpsc::UnboundedSender<FetchJob>,
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl FrameFetcher {
    /// Start a new worker on the current Tokio runtime,
    /// returning it alongside its outcome queue.
    pub fn spawn<S, D>(
        index: usize,
        source: Arc<S>,
        decoder: Arc<D>,
        fan_out: FanOut,
    ) -> (Self, mpsc::UnboundedReceiver<FetchOutcome>)
    where
        S: ImageSetSource,
        D: FrameDecoder + 'static,
    {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<FetchJob>();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));

        let stop_flag = Arc::clone(&stopped);
        let handle = tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }
                // a panicking source must still report the job
                let fetched = AssertUnwindSafe(fetch_job(&source, &decoder, &job, fan_out))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        FetchPanickedSnafu {
                            sop_instance_uid: job.sop_instance_uid.clone(),
                        }
                        .fail()
                    });
                let outcome = match fetched {
                    Ok(pixel_data) => Ok(FetchResult { job, pixel_data }),
                    Err(error) => {
                        error!(
                            "Fetcher #{} failed on instance {}: {}",
                            index,
                            job.sop_instance_uid,
                            snafu::Report::from_error(&error)
                        );
                        Err(FetchFailure { job, error })
                    }
                };
                if outcome_tx.send(outcome).is_err() {
                    break;
                }
            }
            debug!("Fetcher #{} finished", index);
        });

        (
            FrameFetcher {
                jobs: job_tx,
                stopped,
                handle,
            },
            outcome_rx,
        )
    }

    /// Queue a job, giving it back if the worker is no longer running.
    pub fn submit(&self, job: FetchJob) -> Result<(), FetchJob> {
        self.jobs.send(job).map_err(|e| e.0)
    }

    /// Stop the worker, abandoning any job in flight.
    pub fn dispose(self) {
        self.stopped.store(true, Ordering::Release);
        self.handle.abort();
    }
}
