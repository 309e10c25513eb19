//! A CLI tool for exporting AWS HealthImaging image sets
//! as DICOM files.
use std::path::PathBuf;

use clap::Parser;
use dicom_dump::dump_file;
use dicom_healthimaging::client::{HeaderName, HeaderValue};
use dicom_healthimaging::{
    save_as_dicom, save_as_png, AhiToDicom, AhiToDicomOptions, HealthImagingClient,
    SeriesSummary,
};
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Convert an AWS HealthImaging image set into DICOM files
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// Data store ID
    #[arg(short = 'd', long = "datastore")]
    datastore_id: String,

    /// Image set ID
    #[arg(
        short = 'i',
        long = "image-set",
        required_unless_present = "study",
        conflicts_with = "study"
    )]
    image_set_id: Option<String>,

    /// Convert every image set of the study with this Study Instance UID
    #[arg(long = "study")]
    study: Option<String>,

    /// Series Instance UID to convert (default is all series)
    #[arg(short = 's', long = "series", requires = "image_set_id")]
    series: Option<String>,

    /// Only list the series instead of converting them
    #[arg(short = 'l', long = "list-series")]
    list_series: bool,

    /// AWS region of the HealthImaging service
    #[arg(long = "region", default_value = "us-east-1")]
    region: String,

    /// Service endpoint URL (overrides the region)
    #[arg(long = "endpoint")]
    endpoint: Option<String>,

    /// Bearer token for authorization
    #[arg(long = "token")]
    bearer_token: Option<String>,

    /// Extra request header, as `name: value` (can be repeated)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(HeaderName, HeaderValue)>,

    /// Directory to write the DICOM files to
    #[arg(short = 'o', long = "out-dir", default_value = ".")]
    out_dir: PathBuf,

    /// Also save the first frame of each instance as PNG
    #[arg(long = "png")]
    png: bool,

    /// Print the contents of each converted object
    #[arg(long = "dump")]
    dump: bool,

    /// Number of frame fetch workers
    /// (default is 8 times the available parallelism)
    #[arg(long = "fetchers")]
    fetchers: Option<usize>,

    /// Number of assembly workers
    /// (default is the available parallelism)
    #[arg(long = "assemblers")]
    assemblers: Option<usize>,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_header(s: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid header `{s}`, expected `name: value`"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| e.to_string())?;
    let value = HeaderValue::from_str(value.trim()).map_err(|e| e.to_string())?;
    Ok((name, value))
}

fn main() {
    let app = App::parse();

    let level = if app.verbose { Level::DEBUG } else { Level::INFO };
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .with_env_filter(log_filter(app.verbose))
            .finish(),
    )
    .whatever_context("Could not set up global logging subscriber")
    .unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Could not start runtime: {}", e);
            std::process::exit(-1);
        });

    runtime.block_on(run(app)).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(-2);
    });
}

/// Logging filter: `info` by default,
/// `debug` for this tool and its library when verbose.
fn log_filter(verbose: bool) -> EnvFilter {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if !verbose {
        return filter;
    }
    ["dicom_healthimaging=debug", "dicom_fromahi=debug"]
        .into_iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(filter, EnvFilter::add_directive)
}

fn print_series(summaries: &[SeriesSummary]) {
    for summary in summaries {
        println!(
            "{}\t{}\t{}\t{}\t{} instance(s)\t{}",
            summary.image_set_id,
            summary.series_instance_uid,
            summary
                .series_number
                .map(|n| n.to_string())
                .unwrap_or_default(),
            summary.modality,
            summary.instance_count,
            summary.series_description,
        );
    }
}

async fn run(app: App) -> Result<(), Whatever> {
    let App {
        datastore_id,
        image_set_id,
        study,
        series,
        list_series,
        region,
        endpoint,
        bearer_token,
        headers,
        out_dir,
        png,
        dump,
        fetchers,
        assemblers,
        verbose: _,
    } = app;

    let mut client = match &endpoint {
        Some(endpoint) => HealthImagingClient::with_endpoint(endpoint),
        None => HealthImagingClient::with_region(&region),
    };
    if let Some(token) = &bearer_token {
        client.set_bearer_token(token);
    }
    for (name, value) in headers {
        client.set_header(name, value);
    }

    let mut options = AhiToDicomOptions::new();
    if let Some(fetchers) = fetchers {
        options = options.fetchers(fetchers);
    }
    if let Some(assemblers) = assemblers {
        options = options.assemblers(assemblers);
    }
    let converter = AhiToDicom::new(client).with_options(options);

    if list_series {
        let summaries = match &image_set_id {
            Some(image_set_id) => converter
                .list_series(&datastore_id, image_set_id)
                .await
                .whatever_context("Could not list series")?,
            None => {
                let study = study
                    .as_deref()
                    .whatever_context("Either an image set or a study is required")?;
                converter
                    .image_set_series_map(&datastore_id, study)
                    .await
                    .whatever_context("Could not list image sets of study")?
                    .into_values()
                    .collect()
            }
        };
        print_series(&summaries);
        return Ok(());
    }

    let instances = match &image_set_id {
        Some(image_set_id) => converter
            .convert_series(&datastore_id, image_set_id, series.as_deref())
            .await
            .whatever_context("Could not convert image set")?,
        None => {
            let study = study
                .as_deref()
                .whatever_context("Either an image set or a study is required")?;
            converter
                .convert_study(&datastore_id, study)
                .await
                .whatever_context("Could not convert study")?
        }
    };

    for instance in &instances {
        let path = save_as_dicom(instance, &out_dir)
            .whatever_context("Could not save DICOM file")?;
        info!("Saved {}", path.display());

        if png {
            let path = out_dir.join(format!("{}.png", instance.sop_instance_uid()));
            match save_as_png(instance, &path) {
                Ok(()) => info!("Saved {}", path.display()),
                Err(e) => error!("{}", Report::from_error(e)),
            }
        }

        if dump {
            dump_file(instance.object()).whatever_context("Could not dump object")?;
        }
    }

    info!("Converted {} instance(s)", instances.len());
    Ok(())
}
