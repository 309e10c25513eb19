use std::time::Duration;

use dicom_dictionary_std::tags;
use bytes::Bytes;
use dicom_healthimaging::{
    AhiToDicom, AhiToDicomOptions, DecodeError, DicomInstance, Error, ImageSetSource,
    InMemoryImageSetSource, SourceError,
};
use serde_json::{json, Value};

const DATASTORE: &str = "ds0";

type Decoder = fn(&[u8]) -> Result<Vec<u8>, DecodeError>;

fn passthrough(blob: &[u8]) -> Result<Vec<u8>, DecodeError> {
    Ok(blob.to_vec())
}

/// An instance entry with the given instance number and frames.
fn instance(sop_instance_uid: &str, instance_number: Option<i64>, frames: &[&str]) -> Value {
    let mut dicom = json!({
        "SOPClassUID": "1.2.840.10008.5.1.4.1.1.7",
        "SOPInstanceUID": sop_instance_uid,
        "BitsAllocated": 8
    });
    if let Some(n) = instance_number {
        dicom["InstanceNumber"] = json!(n);
    }
    json!({
        "DICOM": dicom,
        "ImageFrames": frames.iter().map(|id| json!({ "ID": id })).collect::<Vec<_>>()
    })
}

fn image_set(series: Value) -> Value {
    json!({
        "SchemaVersion": "1.1",
        "Patient": { "DICOM": { "PatientName": "Doe^John", "PatientID": "P-1" } },
        "Study": {
            "DICOM": { "StudyInstanceUID": "1.2.3" },
            "Series": series
        }
    })
}

fn converter(source: InMemoryImageSetSource) -> AhiToDicom<InMemoryImageSetSource, Decoder> {
    AhiToDicom::with_decoder(source, passthrough as Decoder)
        .with_options(AhiToDicomOptions::new().fetchers(3).assemblers(2))
}

fn pixel_data(instance: &DicomInstance) -> Vec<u8> {
    instance
        .object()
        .get(tags::PIXEL_DATA)
        .unwrap()
        .to_bytes()
        .unwrap()
        .into_owned()
}

/// Route library logs to the test output.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn sop_uids(instances: &[DicomInstance]) -> Vec<&str> {
    instances.iter().map(|i| i.sop_instance_uid()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failed_fetch_leaves_four_instances() {
    init_logging();
    let metadata = image_set(json!({
        "1.2.3.1": {
            "DICOM": { "SeriesInstanceUID": "1.2.3.1", "Modality": "CT" },
            "Instances": {
                "1.2.3.1.5": instance("1.2.3.1.5", Some(5), &["f5"]),
                "1.2.3.1.1": instance("1.2.3.1.1", Some(1), &["f1"]),
                "1.2.3.1.4": instance("1.2.3.1.4", Some(4), &["f4"]),
                "1.2.3.1.2": instance("1.2.3.1.2", Some(2), &["f2"]),
                "1.2.3.1.3": instance("1.2.3.1.3", Some(3), &["f3"])
            }
        }
    }));
    let source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &metadata)
        .unwrap()
        .with_frame(DATASTORE, "f1", vec![1_u8])
        .with_frame(DATASTORE, "f2", vec![2_u8])
        // f3 is missing
        .with_frame(DATASTORE, "f4", vec![4_u8])
        .with_frame(DATASTORE, "f5", vec![5_u8]);

    let instances = tokio::time::timeout(
        Duration::from_secs(10),
        converter(source).convert_series(DATASTORE, "is1", Some("1.2.3.1")),
    )
    .await
    .expect("conversion should not block")
    .unwrap();

    assert_eq!(
        sop_uids(&instances),
        vec!["1.2.3.1.1", "1.2.3.1.2", "1.2.3.1.4", "1.2.3.1.5"]
    );
    for instance in &instances {
        let n = instance.instance_number().unwrap() as u8;
        assert_eq!(pixel_data(instance), vec![n]);
        assert_eq!(
            instance
                .object()
                .get(tags::PATIENT_NAME)
                .unwrap()
                .to_str()
                .unwrap(),
            "Doe^John"
        );
    }
}

#[tokio::test]
async fn undecodable_metadata_is_unavailable() {
    let source = InMemoryImageSetSource::new().with_metadata_blob(
        DATASTORE,
        "is1",
        b"{\"not\": \"gzip\"}".to_vec(),
    );
    let err = converter(source)
        .convert_series(DATASTORE, "is1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MetadataUnavailable { .. }));
}

#[tokio::test]
async fn missing_image_set_is_unavailable() {
    let err = converter(InMemoryImageSetSource::new())
        .list_series(DATASTORE, "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MetadataUnavailable { .. }));
}

#[tokio::test]
async fn unknown_series_is_an_error() {
    let source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &image_set(json!({})))
        .unwrap();
    let err = converter(source)
        .convert_series(DATASTORE, "is1", Some("9.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SeriesNotFound { .. }));
}

#[tokio::test]
async fn instances_without_frames_are_excluded() {
    let metadata = image_set(json!({
        "1.1": { "Instances": {
            "1.1.1": instance("1.1.1", Some(1), &["a"]),
            "1.1.2": instance("1.1.2", Some(2), &[])
        }}
    }));
    let source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &metadata)
        .unwrap()
        .with_frame(DATASTORE, "a", vec![1_u8]);

    let instances = converter(source)
        .convert_series(DATASTORE, "is1", None)
        .await
        .unwrap();
    assert_eq!(sop_uids(&instances), vec!["1.1.1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fragments_keep_their_order() {
    let frames: Vec<String> = (0..12).map(|i| format!("frag{i}")).collect();
    let frame_refs: Vec<&str> = frames.iter().map(String::as_str).collect();
    let metadata = image_set(json!({
        "1.1": { "Instances": {
            "1.1.1": instance("1.1.1", Some(1), &frame_refs)
        }}
    }));
    let mut source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &metadata)
        .unwrap();
    for (i, frame) in frames.iter().enumerate() {
        source = source.with_frame(DATASTORE, frame, vec![i as u8; 2]);
    }
    // earlier fragments complete later
    let source = source
        .with_frame_delay("frag0", Duration::from_millis(120))
        .with_frame_delay("frag5", Duration::from_millis(60));

    let converter = AhiToDicom::with_decoder(source, passthrough).with_options(
        AhiToDicomOptions::new()
            .fetchers(1)
            .assemblers(1)
            .fan_out_width(8)
            .fan_out_chunk_size(5),
    );
    let instances = converter
        .convert_series(DATASTORE, "is1", None)
        .await
        .unwrap();

    assert_eq!(instances.len(), 1);
    let expected: Vec<u8> = (0..12_u8).flat_map(|i| [i, i]).collect();
    assert_eq!(pixel_data(&instances[0]), expected);
}

#[tokio::test]
async fn results_are_sorted_by_instance_number() {
    let metadata = image_set(json!({
        "1.1": { "Instances": {
            "1.1.9": instance("1.1.9", None, &["a"]),
            "1.1.3": instance("1.1.3", Some(10), &["b"]),
            "1.1.2": instance("1.1.2", Some(2), &["c"]),
            "1.1.1": instance("1.1.1", Some(2), &["d"])
        }},
        "1.2": { "Instances": {
            "1.2.1": instance("1.2.1", Some(1), &["e"])
        }}
    }));
    let mut source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &metadata)
        .unwrap();
    for id in ["a", "b", "c", "d", "e"] {
        source = source.with_frame(DATASTORE, id, vec![0_u8]);
    }

    let instances = converter(source)
        .convert_series(DATASTORE, "is1", None)
        .await
        .unwrap();
    assert_eq!(
        sop_uids(&instances),
        vec!["1.2.1", "1.1.1", "1.1.2", "1.1.3", "1.1.9"]
    );
}

#[tokio::test]
async fn lists_series() {
    let metadata = image_set(json!({
        "1.1": {
            "DICOM": { "Modality": "MR", "SeriesNumber": 7, "SeriesDescription": "T1" },
            "Instances": { "1.1.1": instance("1.1.1", Some(1), &["a"]) }
        }
    }));
    let source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &metadata)
        .unwrap();
    let series = converter(source).list_series(DATASTORE, "is1").await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].image_set_id, "is1");
    assert_eq!(series[0].series_instance_uid, "1.1");
    assert_eq!(series[0].series_number, Some(7));
    assert_eq!(series[0].modality, "MR");
    assert_eq!(series[0].series_description, "T1");
    assert_eq!(series[0].instance_count, 1);
}

#[tokio::test]
async fn converts_whole_study() {
    let first = image_set(json!({
        "1.1": {
            "DICOM": { "Modality": "CT" },
            "Instances": { "1.1.1": instance("1.1.1", Some(1), &["a"]) }
        }
    }));
    let second = image_set(json!({
        "2.1": {
            "DICOM": { "Modality": "SEG" },
            "Instances": {
                "2.1.2": instance("2.1.2", Some(2), &["c"]),
                "2.1.1": instance("2.1.1", Some(1), &["b"])
            }
        }
    }));
    let source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &first)
        .unwrap()
        .with_metadata_json(DATASTORE, "is2", &second)
        .unwrap()
        .with_frame(DATASTORE, "a", vec![1_u8])
        .with_frame(DATASTORE, "b", vec![2_u8])
        .with_frame(DATASTORE, "c", vec![3_u8])
        .with_study_image_set(DATASTORE, "1.2.3", "is1")
        .with_study_image_set(DATASTORE, "1.2.3", "is2");
    let converter = converter(source);

    let instances = converter.convert_study(DATASTORE, "1.2.3").await.unwrap();
    assert_eq!(sop_uids(&instances), vec!["1.1.1", "2.1.1", "2.1.2"]);

    let map = converter
        .image_set_series_map(DATASTORE, "1.2.3")
        .await
        .unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map["is1"].modality, "CT");
    assert_eq!(map["is2"].series_instance_uid, "2.1");

    assert!(converter
        .convert_study(DATASTORE, "4.5.6")
        .await
        .unwrap()
        .is_empty());
}

/// Panics when asked for the frame `boom`.
struct CrashingSource(InMemoryImageSetSource);

impl ImageSetSource for CrashingSource {
    async fn get_image_set_metadata(
        &self,
        datastore_id: &str,
        image_set_id: &str,
    ) -> Result<Bytes, SourceError> {
        self.0.get_image_set_metadata(datastore_id, image_set_id).await
    }

    async fn get_image_frame(
        &self,
        datastore_id: &str,
        image_set_id: &str,
        image_frame_id: &str,
    ) -> Result<Bytes, SourceError> {
        if image_frame_id == "boom" {
            panic!("source crashed");
        }
        self.0
            .get_image_frame(datastore_id, image_set_id, image_frame_id)
            .await
    }

    async fn search_image_sets(
        &self,
        datastore_id: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<String>, SourceError> {
        self.0.search_image_sets(datastore_id, study_instance_uid).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashing_source_drops_only_its_instance() {
    init_logging();
    let metadata = image_set(json!({
        "1.1": {
            "DICOM": { "SeriesInstanceUID": "1.1" },
            "Instances": {
                "1.1.1": instance("1.1.1", Some(1), &["a"]),
                "1.1.2": instance("1.1.2", Some(2), &["boom"]),
                "1.1.3": instance("1.1.3", Some(3), &["c"])
            }
        }
    }));
    let source = InMemoryImageSetSource::new()
        .with_metadata_json(DATASTORE, "is1", &metadata)
        .unwrap()
        .with_frame(DATASTORE, "a", vec![1_u8])
        .with_frame(DATASTORE, "c", vec![3_u8]);
    let converter = AhiToDicom::with_decoder(CrashingSource(source), passthrough as Decoder)
        .with_options(AhiToDicomOptions::new().fetchers(2).assemblers(1));

    let instances = tokio::time::timeout(
        Duration::from_secs(10),
        converter.convert_series(DATASTORE, "is1", None),
    )
    .await
    .expect("conversion should not block")
    .unwrap();

    assert_eq!(sop_uids(&instances), vec!["1.1.1", "1.1.3"]);
}
