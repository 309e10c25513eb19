//! Conversion pipeline orchestration.
//!
//! A conversion fetches the image set metadata,
//! hands one fetch job per instance to the frame fetch workers
//! in round-robin order,
//! forwards every fetch outcome to a background assembly task
//! which distributes them over the assembly workers,
//! and finally returns the assembled instances sorted by instance number.
//!
//! All frames of a series are held in memory until the conversion completes.
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, SelectAll, StreamExt};
use snafu::{ensure, ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::assemble::{Assembler, AssemblyOutcome};
use crate::decode::{FrameDecoder, Jpeg2000Decoder};
use crate::fetch::{FanOut, FetchJob, FetchOutcome, FetchResult, FrameFetcher};
use crate::mapper::DicomInstance;
use crate::metadata::{ImageSetMetadata, MetadataError, SeriesSummary};
use crate::source::{ImageSetSource, SourceError};

/// The reason why image set metadata could not be obtained.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MetadataFailure {
    /// Could not retrieve metadata blob
    FetchMetadata { source: SourceError },
    /// Could not read metadata blob
    ReadMetadata { source: MetadataError },
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Metadata of image set {} is unavailable", image_set_id))]
    MetadataUnavailable {
        image_set_id: String,
        source: MetadataFailure,
    },
    #[snafu(display("Series {} not found in image set {}", series_instance_uid, image_set_id))]
    SeriesNotFound {
        image_set_id: String,
        series_instance_uid: String,
    },
    #[snafu(display("Could not search image sets of study {}", study_instance_uid))]
    SearchImageSets {
        study_instance_uid: String,
        source: SourceError,
    },
    /// Could not start assembly worker
    SpawnAssembler { source: std::io::Error },
    /// Assembly task panicked or was cancelled
    AssemblyTaskFailed { source: tokio::task::JoinError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Conversion settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AhiToDicomOptions {
    fetchers: usize,
    assemblers: usize,
    fan_out: FanOut,
}

impl Default for AhiToDicomOptions {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        AhiToDicomOptions {
            fetchers: 8 * parallelism,
            assemblers: parallelism,
            fan_out: FanOut::default(),
        }
    }
}

impl AhiToDicomOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of frame fetch workers.
    pub fn fetchers(mut self, fetchers: usize) -> Self {
        self.fetchers = fetchers.max(1);
        self
    }

    /// Set the number of assembly workers.
    pub fn assemblers(mut self, assemblers: usize) -> Self {
        self.assemblers = assemblers.max(1);
        self
    }

    /// Set the maximum number of fragment chunks
    /// fetched concurrently for one instance.
    pub fn fan_out_width(mut self, width: usize) -> Self {
        self.fan_out.width = width.max(1);
        self
    }

    /// Set the number of fragments per chunk.
    pub fn fan_out_chunk_size(mut self, chunk_size: usize) -> Self {
        self.fan_out.chunk_size = chunk_size.max(1);
        self
    }

    pub fn fetcher_count(&self) -> usize {
        self.fetchers
    }

    pub fn assembler_count(&self) -> usize {
        self.assemblers
    }

    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }
}

/// Stages of a conversion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConversionState {
    Idle,
    MetadataFetched,
    PoolsInitialized,
    Dispatching,
    AwaitingResults,
    Assembling,
    Drained,
    Complete,
}

fn transition(image_set_id: &str, state: ConversionState) {
    debug!("Conversion of {}: {:?}", image_set_id, state);
}

/// Work item of the background assembly task.
#[derive(Debug)]
enum AssemblyJob {
    Build(FetchResult),
    /// an instance whose fetch failed
    Skip { sop_instance_uid: String },
}

impl From<FetchOutcome> for AssemblyJob {
    fn from(outcome: FetchOutcome) -> Self {
        match outcome {
            Ok(result) => AssemblyJob::Build(result),
            Err(failure) => AssemblyJob::Skip {
                sop_instance_uid: failure.job.sop_instance_uid,
            },
        }
    }
}

/// Merge private worker queues into a single stream.
fn merge<T: Send + 'static>(
    receivers: Vec<mpsc::UnboundedReceiver<T>>,
) -> SelectAll<BoxStream<'static, T>> {
    stream::select_all(receivers.into_iter().map(|rx| {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }))
}

/// Converter of HealthImaging image sets into DICOM instances.
#[derive(Debug)]
pub struct AhiToDicom<S, D = Jpeg2000Decoder> {
    source: Arc<S>,
    decoder: Arc<D>,
    options: AhiToDicomOptions,
}

impl<S> AhiToDicom<S>
where
    S: ImageSetSource,
{
    /// Create a converter which decodes frames with OpenJPEG.
    pub fn new(source: S) -> Self {
        Self::with_decoder(source, Jpeg2000Decoder)
    }
}

impl<S, D> AhiToDicom<S, D>
where
    S: ImageSetSource,
    D: FrameDecoder + 'static,
{
    pub fn with_decoder(source: S, decoder: D) -> Self {
        AhiToDicom {
            source: Arc::new(source),
            decoder: Arc::new(decoder),
            options: AhiToDicomOptions::default(),
        }
    }

    pub fn with_options(mut self, options: AhiToDicomOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &AhiToDicomOptions {
        &self.options
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Retrieve and decompress the metadata of an image set.
    pub async fn get_metadata(
        &self,
        datastore_id: &str,
        image_set_id: &str,
    ) -> Result<ImageSetMetadata> {
        let blob = self
            .source
            .get_image_set_metadata(datastore_id, image_set_id)
            .await
            .context(FetchMetadataSnafu)
            .context(MetadataUnavailableSnafu { image_set_id })?;
        ImageSetMetadata::from_gzip(&blob)
            .context(ReadMetadataSnafu)
            .context(MetadataUnavailableSnafu { image_set_id })
    }

    /// List the series of an image set.
    pub async fn list_series(
        &self,
        datastore_id: &str,
        image_set_id: &str,
    ) -> Result<Vec<SeriesSummary>> {
        let metadata = self.get_metadata(datastore_id, image_set_id).await?;
        Ok(metadata.series_summaries(image_set_id))
    }

    /// Convert one series of an image set,
    /// or all of its series if `series_instance_uid` is `None`.
    ///
    /// Instances which fail to be fetched, decoded or mapped
    /// are logged and left out of the result.
    /// The instances are sorted by instance number,
    /// then by SOP Instance UID.
    pub async fn convert_series(
        &self,
        datastore_id: &str,
        image_set_id: &str,
        series_instance_uid: Option<&str>,
    ) -> Result<Vec<DicomInstance>> {
        transition(image_set_id, ConversionState::Idle);
        let metadata = Arc::new(self.get_metadata(datastore_id, image_set_id).await?);
        transition(image_set_id, ConversionState::MetadataFetched);

        let series_uids: Vec<String> = match series_instance_uid {
            Some(uid) => {
                ensure!(
                    metadata.series(uid).is_some(),
                    SeriesNotFoundSnafu {
                        image_set_id,
                        series_instance_uid: uid,
                    }
                );
                vec![uid.to_string()]
            }
            None => metadata.study.series.keys().cloned().collect(),
        };

        let jobs = collect_jobs(&metadata, datastore_id, image_set_id, &series_uids);
        if jobs.is_empty() {
            info!("Image set {} has no instances to convert", image_set_id);
            return Ok(Vec::new());
        }
        let job_count = jobs.len();

        // pools
        let fetcher_count = self.options.fetchers.min(job_count);
        let assembler_count = self.options.assemblers.min(job_count);
        let mut assemblers = Vec::with_capacity(assembler_count);
        let mut assembly_outcomes = Vec::with_capacity(assembler_count);
        for i in 0..assembler_count {
            let (assembler, outcomes) =
                Assembler::spawn(i, Arc::clone(&metadata)).context(SpawnAssemblerSnafu)?;
            assemblers.push(assembler);
            assembly_outcomes.push(outcomes);
        }
        let mut fetchers = Vec::with_capacity(fetcher_count);
        let mut fetch_outcomes = Vec::with_capacity(fetcher_count);
        for i in 0..fetcher_count {
            let (fetcher, outcomes) = FrameFetcher::spawn(
                i,
                Arc::clone(&self.source),
                Arc::clone(&self.decoder),
                self.options.fan_out,
            );
            fetchers.push(fetcher);
            fetch_outcomes.push(outcomes);
        }
        transition(image_set_id, ConversionState::PoolsInitialized);
        debug!(
            "{} instance(s), {} fetcher(s), {} assembler(s)",
            job_count, fetcher_count, assembler_count
        );

        let (assembly_tx, assembly_rx) = mpsc::unbounded_channel();
        let assembly = tokio::spawn(run_assembly(
            assemblers,
            assembly_outcomes,
            assembly_rx,
            job_count,
        ));

        transition(image_set_id, ConversionState::Dispatching);
        let mut dispatched = 0;
        for (i, job) in jobs.into_iter().enumerate() {
            match fetchers[i % fetcher_count].submit(job) {
                Ok(()) => dispatched += 1,
                Err(job) => {
                    error!(
                        "Fetcher #{} is gone, dropping {}",
                        i % fetcher_count,
                        job.sop_instance_uid
                    );
                    let _ = assembly_tx.send(AssemblyJob::Skip {
                        sop_instance_uid: job.sop_instance_uid,
                    });
                }
            }
        }

        transition(image_set_id, ConversionState::AwaitingResults);
        let mut outcomes = merge(fetch_outcomes);
        let mut received = 0;
        while received < dispatched {
            let Some(outcome) = outcomes.next().await else {
                warn!(
                    "Fetch workers stopped after {} of {} instance(s)",
                    received, dispatched
                );
                break;
            };
            received += 1;
            if assembly_tx.send(AssemblyJob::from(outcome)).is_err() {
                warn!("Assembly task stopped early");
                break;
            }
        }
        drop(assembly_tx);
        transition(image_set_id, ConversionState::Assembling);

        for fetcher in fetchers {
            fetcher.dispose();
        }
        transition(image_set_id, ConversionState::Drained);

        let mut instances = assembly.await.context(AssemblyTaskFailedSnafu)?;
        sort_instances(&mut instances);
        transition(image_set_id, ConversionState::Complete);
        info!(
            "Converted {} of {} instance(s) of image set {}",
            instances.len(),
            job_count,
            image_set_id
        );
        Ok(instances)
    }

    /// Convert every image set of a study.
    ///
    /// Instances are grouped by image set, each group sorted.
    pub async fn convert_study(
        &self,
        datastore_id: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<DicomInstance>> {
        let image_set_ids = self
            .source
            .search_image_sets(datastore_id, study_instance_uid)
            .await
            .context(SearchImageSetsSnafu { study_instance_uid })?;
        info!(
            "Study {} spans {} image set(s)",
            study_instance_uid,
            image_set_ids.len()
        );

        let mut instances = Vec::new();
        for image_set_id in &image_set_ids {
            instances.extend(self.convert_series(datastore_id, image_set_id, None).await?);
        }
        Ok(instances)
    }

    /// Map each image set of a study to its first series.
    pub async fn image_set_series_map(
        &self,
        datastore_id: &str,
        study_instance_uid: &str,
    ) -> Result<BTreeMap<String, SeriesSummary>> {
        let image_set_ids = self
            .source
            .search_image_sets(datastore_id, study_instance_uid)
            .await
            .context(SearchImageSetsSnafu { study_instance_uid })?;

        let mut map = BTreeMap::new();
        for image_set_id in image_set_ids {
            let summaries = self.list_series(datastore_id, &image_set_id).await?;
            match summaries.into_iter().next() {
                Some(summary) => {
                    map.insert(image_set_id, summary);
                }
                None => warn!("Image set {} has no series", image_set_id),
            }
        }
        Ok(map)
    }
}

/// Build one fetch job per instance with at least one frame.
fn collect_jobs(
    metadata: &ImageSetMetadata,
    datastore_id: &str,
    image_set_id: &str,
    series_uids: &[String],
) -> Vec<FetchJob> {
    let mut jobs = Vec::new();
    for series_uid in series_uids {
        let Some(series) = metadata.series(series_uid) else {
            continue;
        };
        for (sop_instance_uid, instance) in &series.instances {
            if instance.image_frames.is_empty() {
                info!("Skipping instance {} without image frames", sop_instance_uid);
                continue;
            }
            jobs.push(FetchJob {
                datastore_id: datastore_id.to_string(),
                image_set_id: image_set_id.to_string(),
                series_instance_uid: series_uid.clone(),
                sop_instance_uid: sop_instance_uid.clone(),
                frame_ids: instance.image_frames.iter().map(|f| f.id.clone()).collect(),
                instance_number: instance.instance_number(),
            });
        }
    }
    jobs
}

/// Sort by instance number, then by SOP Instance UID.
/// Instances without a number go last.
fn sort_instances(instances: &mut [DicomInstance]) {
    instances.sort_by(|a, b| {
        (a.instance_number().is_none(), a.instance_number(), a.sop_instance_uid()).cmp(&(
            b.instance_number().is_none(),
            b.instance_number(),
            b.sop_instance_uid(),
        ))
    });
}

/// Distribute assembly jobs over the assembly workers
/// until `expected` instances are accounted for
/// or no more outcomes can arrive.
async fn run_assembly(
    assemblers: Vec<Assembler>,
    outcome_receivers: Vec<mpsc::UnboundedReceiver<AssemblyOutcome>>,
    mut jobs: mpsc::UnboundedReceiver<AssemblyJob>,
    expected: usize,
) -> Vec<DicomInstance> {
    let mut outcomes = merge(outcome_receivers);
    let mut instances = Vec::with_capacity(expected);
    let mut completed = 0;
    let mut in_flight = 0;
    let mut next_assembler = 0;
    let mut jobs_open = true;

    while completed < expected {
        tokio::select! {
            job = jobs.recv(), if jobs_open => match job {
                Some(AssemblyJob::Build(result)) => {
                    let assembler = &assemblers[next_assembler];
                    next_assembler = (next_assembler + 1) % assemblers.len();
                    match assembler.submit(result) {
                        Ok(()) => in_flight += 1,
                        Err(result) => {
                            error!(
                                "Assembler #{} is gone, dropping {}",
                                assembler.index(),
                                result.job.sop_instance_uid
                            );
                            completed += 1;
                        }
                    }
                }
                Some(AssemblyJob::Skip { sop_instance_uid }) => {
                    debug!("Skipping assembly of {}", sop_instance_uid);
                    completed += 1;
                }
                None => jobs_open = false,
            },
            outcome = outcomes.next(), if in_flight > 0 => match outcome {
                Some(AssemblyOutcome { instance, .. }) => {
                    in_flight -= 1;
                    completed += 1;
                    instances.extend(instance);
                }
                None => {
                    warn!("Assembly workers stopped with {} instance(s) in flight", in_flight);
                    break;
                }
            },
            else => break,
        }
    }

    for assembler in assemblers {
        assembler.dispose();
    }
    instances
}
