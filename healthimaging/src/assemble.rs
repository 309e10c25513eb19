//! Assembly workers.
//!
//! Mapping metadata onto data sets is CPU bound,
//! so each assembly worker runs on a dedicated thread,
//! fed through a private job queue.
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::fetch::FetchResult;
use crate::mapper::{build_dataset, DicomInstance};
use crate::metadata::ImageSetMetadata;

/// The result of assembling one instance.
///
/// `instance` is `None` if the instance could not be mapped.
#[derive(Debug)]
pub struct AssemblyOutcome {
    pub sop_instance_uid: String,
    pub instance: Option<DicomInstance>,
}

/// An assembly worker.
#[derive(Debug)]
pub struct Assembler {
    index: usize,
    jobs: mpsc::UnboundedSender<FetchResult>,
    stopped: Arc<AtomicBool>,
}

impl Assembler {
    /// Start a new worker thread
    /// building data sets from the given image set metadata.
    pub fn spawn(
        index: usize,
        metadata: Arc<ImageSetMetadata>,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<AssemblyOutcome>)> {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<FetchResult>();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));

        let stop_flag = Arc::clone(&stopped);
        thread::Builder::new()
            .name(format!("ahi-assembler-{index}"))
            .spawn(move || {
                while let Some(FetchResult { job, pixel_data }) = job_rx.blocking_recv() {
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let built = panic::catch_unwind(AssertUnwindSafe(|| {
                        build_dataset(
                            &metadata,
                            &job.series_instance_uid,
                            &job.sop_instance_uid,
                            pixel_data,
                        )
                    }));
                    let instance = match built {
                        Ok(Ok(instance)) => Some(instance),
                        Ok(Err(e)) => {
                            error!(
                                "Assembler #{} could not map instance {}: {}",
                                index,
                                job.sop_instance_uid,
                                snafu::Report::from_error(e)
                            );
                            None
                        }
                        Err(_) => {
                            error!(
                                "Assembler #{} panicked on instance {}",
                                index, job.sop_instance_uid
                            );
                            None
                        }
                    };
                    let outcome = AssemblyOutcome {
                        sop_instance_uid: job.sop_instance_uid,
                        instance,
                    };
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
                debug!("Assembler #{} finished", index);
            })?;

        Ok((
            Assembler {
                index,
                jobs: job_tx,
                stopped,
            },
            outcome_rx,
        ))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Queue a fetched instance, giving it back if the worker is gone.
    pub fn submit(&self, result: FetchResult) -> Result<(), FetchResult> {
        self.jobs.send(result).map_err(|e| e.0)
    }

    /// Stop the worker.
    /// The thread is detached and exits once its queue is closed.
    pub fn dispose(self) {
        self.stopped.store(true, Ordering::Release);
    }
}
