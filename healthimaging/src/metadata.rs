//! Image set metadata model.
//!
//! HealthImaging serves the metadata of an image set
//! as a single gzip-compressed JSON document,
//! organized in a Patient / Study / Series / Instance hierarchy.
//! Attribute values at each level are kept in a loosely typed tree
//! ([`AttributeSet`] of [`AttributeValue`]s),
//! since their DICOM value representation is only known
//! once they are resolved against a data dictionary.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// An error which may occur when reading image set metadata.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MetadataError {
    /// Could not decompress metadata blob
    Decompress { source: std::io::Error },
    /// Could not parse metadata document
    Parse { source: serde_json::Error },
}

/// The root of an image set's metadata document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageSetMetadata {
    #[serde(rename = "SchemaVersion", default)]
    pub schema_version: Option<String>,
    #[serde(rename = "DatastoreID", default)]
    pub datastore_id: Option<String>,
    #[serde(rename = "ImageSetID", default)]
    pub image_set_id: Option<String>,
    #[serde(rename = "Patient", default)]
    pub patient: Patient,
    #[serde(rename = "Study", default)]
    pub study: Study,
}

/// Patient level attributes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Patient {
    #[serde(rename = "DICOM", default)]
    pub dicom: AttributeSet,
}

/// Study level attributes and the series of the image set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Study {
    #[serde(rename = "DICOM", default)]
    pub dicom: AttributeSet,
    /// Series indexed by Series Instance UID
    #[serde(rename = "Series", default)]
    pub series: BTreeMap<String, Series>,
}

/// Series level attributes and the instances of the series.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Series {
    #[serde(rename = "DICOM", default)]
    pub dicom: AttributeSet,
    /// Instances indexed by SOP Instance UID
    #[serde(rename = "Instances", default)]
    pub instances: BTreeMap<String, Instance>,
}

/// Instance level attributes and frame descriptors.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Instance {
    #[serde(rename = "DICOM", default)]
    pub dicom: AttributeSet,
    /// Value representations of attributes
    /// which are not in the standard dictionary,
    /// indexed by tag
    #[serde(rename = "DICOMVRs", default)]
    pub dicom_vrs: BTreeMap<String, String>,
    #[serde(rename = "StoredTransferSyntaxUID", default)]
    pub stored_transfer_syntax_uid: Option<String>,
    /// Frames of the instance, in frame order
    #[serde(rename = "ImageFrames", default)]
    pub image_frames: Vec<ImageFrame>,
}

/// Descriptor of one compressed frame of pixel data.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageFrame {
    /// The opaque image frame identifier
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FrameSizeInBytes", default)]
    pub frame_size_in_bytes: Option<u64>,
    #[serde(rename = "MinPixelValue", default)]
    pub min_pixel_value: Option<f64>,
    #[serde(rename = "MaxPixelValue", default)]
    pub max_pixel_value: Option<f64>,
}

/// A summary of one series in an image set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSummary {
    pub image_set_id: String,
    pub series_instance_uid: String,
    pub series_number: Option<i64>,
    pub modality: String,
    pub series_description: String,
    pub instance_count: usize,
}

impl ImageSetMetadata {
    /// Read the metadata from a gzip compressed JSON blob,
    /// as served by the metadata endpoint.
    pub fn from_gzip(blob: &[u8]) -> Result<Self, MetadataError> {
        let mut json = Vec::new();
        GzDecoder::new(blob)
            .read_to_end(&mut json)
            .context(DecompressSnafu)?;
        Self::from_json_slice(&json)
    }

    /// Read the metadata from an uncompressed JSON document.
    pub fn from_json_slice(json: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(json).context(ParseSnafu)
    }

    /// Look up a series by its Series Instance UID.
    pub fn series(&self, series_instance_uid: &str) -> Option<&Series> {
        self.study.series.get(series_instance_uid)
    }

    /// Look up an instance by its series and SOP Instance UID.
    pub fn instance(&self, series_instance_uid: &str, sop_instance_uid: &str) -> Option<&Instance> {
        self.series(series_instance_uid)?
            .instances
            .get(sop_instance_uid)
    }

    /// Summarize every series of the image set.
    pub fn series_summaries(&self, image_set_id: &str) -> Vec<SeriesSummary> {
        self.study
            .series
            .iter()
            .map(|(uid, series)| SeriesSummary {
                image_set_id: image_set_id.to_string(),
                series_instance_uid: uid.clone(),
                series_number: series.dicom.get("SeriesNumber").and_then(|v| v.to_int()),
                modality: series
                    .dicom
                    .get("Modality")
                    .and_then(|v| v.to_text())
                    .map(Cow::into_owned)
                    .unwrap_or_default(),
                series_description: series
                    .dicom
                    .get("SeriesDescription")
                    .and_then(|v| v.to_text())
                    .map(Cow::into_owned)
                    .unwrap_or_default(),
                instance_count: series.instances.len(),
            })
            .collect()
    }
}

impl Instance {
    /// The value of _Instance Number_, if present and numeric.
    pub fn instance_number(&self) -> Option<i64> {
        self.dicom.get("InstanceNumber").and_then(|v| v.to_int())
    }
}

/// An ordered collection of attributes,
/// keyed by attribute keyword or tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet(Vec<(String, AttributeValue)>);

impl AttributeSet {
    pub fn new() -> Self {
        AttributeSet::default()
    }

    /// Retrieve an attribute value by its key.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert an attribute, replacing any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: AttributeValue) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K, V> FromIterator<(K, V)> for AttributeSet
where
    K: Into<String>,
    V: Into<AttributeValue>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = AttributeSet::new();
        for (k, v) in iter {
            set.insert(k, v.into());
        }
        set
    }
}

/// A loosely typed attribute value from the metadata document.
///
/// Sequence attributes are lists of [`Set`](AttributeValue::Set) items;
/// binary attributes arrive as base64 encoded [`Text`](AttributeValue::Text).
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<AttributeValue>),
    Set(AttributeSet),
}

impl AttributeValue {
    /// Interpret the value as a single integer,
    /// taking the first value of a list
    /// and parsing numeric text.
    pub fn to_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.).map(|f| f as i64)),
            AttributeValue::Text(text) => text.trim().parse().ok(),
            AttributeValue::List(items) => items.first().and_then(AttributeValue::to_int),
            _ => None,
        }
    }

    /// Interpret the value as text,
    /// taking the first value of a list.
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        match self {
            AttributeValue::Text(text) => Some(Cow::Borrowed(text)),
            AttributeValue::Number(n) => Some(Cow::Owned(n.to_string())),
            AttributeValue::List(items) => items.first().and_then(AttributeValue::to_text),
            _ => None,
        }
    }

    /// Whether the value holds no data.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value.into())
    }
}

impl From<AttributeSet> for AttributeValue {
    fn from(value: AttributeSet) -> Self {
        AttributeValue::Set(value)
    }
}

impl From<Vec<AttributeValue>> for AttributeValue {
    fn from(value: Vec<AttributeValue>) -> Self {
        AttributeValue::List(value)
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(b),
            serde_json::Value::Number(n) => AttributeValue::Number(n),
            serde_json::Value::String(s) => AttributeValue::Text(s),
            serde_json::Value::Array(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from).collect())
            }
            serde_json::Value::Object(map) => AttributeValue::Set(map.into_iter().collect()),
        }
    }
}

#[derive(Debug)]
struct AttributeValueVisitor;

impl<'de> Visitor<'de> for AttributeValueVisitor {
    type Value = AttributeValue;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an attribute value")
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(AttributeValue::Null)
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(AttributeValue::Null)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
        Ok(AttributeValue::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(AttributeValue::Number(v.into()))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        Ok(AttributeValue::Number(v.into()))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        serde_json::Number::from_f64(v)
            .map(AttributeValue::Number)
            .ok_or_else(|| E::custom("non-finite number in attribute value"))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
        Ok(AttributeValue::Text(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
        Ok(AttributeValue::Text(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(AttributeValue::List(items))
    }

    fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        AttributeSetVisitor.visit_map(map).map(AttributeValue::Set)
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(AttributeValueVisitor)
    }
}

#[derive(Debug)]
struct AttributeSetVisitor;

impl<'de> Visitor<'de> for AttributeSetVisitor {
    type Value = AttributeSet;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of DICOM attributes")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut attributes = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, AttributeValue>()? {
            attributes.push((key, value));
        }
        Ok(AttributeSet(attributes))
    }
}

impl<'de> Deserialize<'de> for AttributeSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(AttributeSetVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "SchemaVersion": "1.1",
            "DatastoreID": "ds1",
            "ImageSetID": "is1",
            "Patient": { "DICOM": { "PatientName": "Doe^John", "PatientID": "P1" } },
            "Study": {
                "DICOM": { "StudyInstanceUID": "1.2.3" },
                "Series": {
                    "1.2.3.4": {
                        "DICOM": {
                            "Modality": "CT",
                            "SeriesNumber": 2,
                            "SeriesDescription": "AXIAL"
                        },
                        "Instances": {
                            "1.2.3.4.1": {
                                "DICOM": { "InstanceNumber": "7", "Rows": 2 },
                                "DICOMVRs": { "00191010": "LO" },
                                "StoredTransferSyntaxUID": "1.2.840.10008.1.2.4.202",
                                "ImageFrames": [
                                    { "ID": "f1", "FrameSizeInBytes": 8 }
                                ]
                            },
                            "1.2.3.4.2": {
                                "DICOM": { "InstanceNumber": 3 },
                                "ImageFrames": []
                            }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn can_read_gzip_metadata() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(sample().to_string().as_bytes())
            .unwrap();
        let blob = encoder.finish().unwrap();

        let metadata = ImageSetMetadata::from_gzip(&blob).unwrap();
        assert_eq!(metadata.schema_version.as_deref(), Some("1.1"));
        assert_eq!(
            metadata.patient.dicom.get("PatientName"),
            Some(&AttributeValue::from("Doe^John"))
        );

        let instance = metadata.instance("1.2.3.4", "1.2.3.4.1").unwrap();
        assert_eq!(instance.instance_number(), Some(7));
        assert_eq!(instance.image_frames.len(), 1);
        assert_eq!(instance.image_frames[0].id, "f1");
        assert_eq!(
            instance.dicom_vrs.get("00191010").map(String::as_str),
            Some("LO")
        );

        let empty = metadata.instance("1.2.3.4", "1.2.3.4.2").unwrap();
        assert_eq!(empty.instance_number(), Some(3));
        assert!(empty.image_frames.is_empty());
    }

    #[test]
    fn rejects_uncompressed_blob() {
        let blob = sample().to_string().into_bytes();
        let err = ImageSetMetadata::from_gzip(&blob).unwrap_err();
        assert!(matches!(err, MetadataError::Decompress { .. }));
    }

    #[test]
    fn summarizes_series() {
        let metadata: ImageSetMetadata = serde_json::from_value(sample()).unwrap();
        let summaries = metadata.series_summaries("is1");
        assert_eq!(
            summaries,
            vec![SeriesSummary {
                image_set_id: "is1".to_string(),
                series_instance_uid: "1.2.3.4".to_string(),
                series_number: Some(2),
                modality: "CT".to_string(),
                series_description: "AXIAL".to_string(),
                instance_count: 2,
            }]
        );
    }

    #[test]
    fn keeps_nested_attribute_structure() {
        let value: AttributeValue = serde_json::from_value(serde_json::json!([
            { "CodeValue": "123", "CodingSchemeDesignator": "DCM" },
            { "CodeValue": "456" }
        ]))
        .unwrap();

        let AttributeValue::List(items) = value else {
            panic!("expected a list");
        };
        assert_eq!(items.len(), 2);
        let AttributeValue::Set(first) = &items[0] else {
            panic!("expected an attribute set");
        };
        let keys: Vec<_> = first.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["CodeValue", "CodingSchemeDesignator"]);
    }

    #[test]
    fn converts_scalars() {
        assert_eq!(AttributeValue::from("  12 ").to_int(), Some(12));
        assert_eq!(AttributeValue::from(5).to_int(), Some(5));
        assert_eq!(
            AttributeValue::List(vec![AttributeValue::from(9), AttributeValue::from(1)]).to_int(),
            Some(9)
        );
        assert_eq!(AttributeValue::Null.to_int(), None);
        assert_eq!(AttributeValue::from(4).to_text().as_deref(), Some("4"));
    }
}
