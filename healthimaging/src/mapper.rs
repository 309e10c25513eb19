//! Mapping of image set metadata onto DICOM data sets.
//!
//! Every attribute in the metadata tree is identified by
//! either a standard keyword or a tag expression.
//! Its value representation is resolved against the standard data dictionary
//! first and then against the instance's own list of value representations,
//! which HealthImaging provides for attributes unknown to the standard.
//! Failures are isolated per attribute:
//! an attribute which cannot be resolved or converted is logged and left out.
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use base64::Engine;
use dicom_core::dictionary::{DataDictionary, DataDictionaryEntry, VirtualVr};
use dicom_core::value::{DataSetSequence, InMemFragment, Value, C};
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, uids, StandardDataDictionary};
use dicom_object::mem::InMemElement;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::metadata::{AttributeSet, AttributeValue, ImageSetMetadata};

/// Key of the private creator sentinel
/// which HealthImaging may place among the attributes.
const PRIVATE_CREATOR_ID: &str = "PrivateCreatorID";

type InMemValue = Value<InMemDicomObject, InMemFragment>;

/// An error which prevents a single attribute from being mapped.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AttributeError {
    #[snafu(display("Unknown attribute `{}`", key))]
    UnknownAttribute { key: String },
    #[snafu(display("Could not resolve value representation of {}", tag))]
    UnknownVr { tag: Tag },
    #[snafu(display("Invalid base64 payload in {}", tag))]
    InvalidBinary {
        tag: Tag,
        source: base64::DecodeError,
    },
    #[snafu(display("Value of {} cannot be represented as {}", tag, vr))]
    InvalidValue { tag: Tag, vr: VR },
    #[snafu(display("Value {} of {} is out of range for {}", value, tag, vr))]
    OutOfRange { tag: Tag, vr: VR, value: i128 },
    #[snafu(display("Sequence {} has an item which is not an attribute set", tag))]
    NotASequence { tag: Tag },
}

/// An error which prevents a whole instance from being mapped.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MappingError {
    #[snafu(display("Series {} not found in image set", series_instance_uid))]
    SeriesNotFound { series_instance_uid: String },
    #[snafu(display("Instance {} not found in series", sop_instance_uid))]
    InstanceNotFound { sop_instance_uid: String },
    #[snafu(display("Could not build file meta group of {}", sop_instance_uid))]
    BuildMeta {
        sop_instance_uid: String,
        source: dicom_object::meta::Error,
    },
}

/// Value representations declared by an instance
/// for attributes outside of the standard data dictionary.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VrList(HashMap<Tag, VirtualVr>);

impl VrList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the list from the `DICOMVRs` section of an instance.
    /// Entries with an unrecognized tag or VR code are ignored.
    pub fn from_dicom_vrs(dicom_vrs: &BTreeMap<String, String>) -> Self {
        let mut list = VrList::new();
        for (key, code) in dicom_vrs {
            match (parse_tag_expr(key), parse_vr_code(code)) {
                (Some(tag), Some(vr)) => list.insert(tag, vr),
                _ => debug!("Ignoring VR declaration {} = {}", key, code),
            }
        }
        list
    }

    pub fn insert(&mut self, tag: Tag, vr: impl Into<VirtualVr>) {
        self.0.insert(tag, vr.into());
    }

    pub fn get(&self, tag: Tag) -> Option<VirtualVr> {
        self.0.get(&tag).copied()
    }
}

/// Parse a value representation code,
/// including the ambiguous forms such as `US or SS`.
fn parse_vr_code(code: &str) -> Option<VirtualVr> {
    match code.trim() {
        "US or SS" | "US or SS or OW" => Some(VirtualVr::Xs),
        "OB or OW" => Some(VirtualVr::Ox),
        "US or OW" => Some(VirtualVr::Lt),
        code => VR::from_str(code).ok().map(VirtualVr::Exact),
    }
}

/// Interpret an attribute key as a tag.
///
/// Accepts `GGGGEEEE`, `(GGGG,EEEE)`, `GGGG,EEEE`,
/// or a keyword of the standard data dictionary.
pub fn parse_tag_expr(key: &str) -> Option<Tag> {
    let expr = key.trim();
    let hex = expr
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(expr);
    let parts = match hex.split_once(',') {
        Some(parts) => Some(parts),
        None if hex.len() == 8 && hex.is_ascii() => Some(hex.split_at(4)),
        None => None,
    };
    if let Some((group, element)) = parts {
        if group.len() == 4 && element.len() == 4 {
            if let (Ok(group), Ok(element)) = (
                u16::from_str_radix(group, 16),
                u16::from_str_radix(element, 16),
            ) {
                return Some(Tag(group, element));
            }
        }
    }
    StandardDataDictionary.by_name(expr).map(|e| e.tag())
}

/// Resolve the value representation of an attribute:
/// the standard data dictionary first, then the instance's VR list.
pub fn resolve_vr(tag: Tag, vr_list: &VrList) -> Option<VirtualVr> {
    StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.vr())
        .or_else(|| vr_list.get(tag))
}

/// Settle on a concrete VR, inspecting the value when the
/// dictionary only knows a context dependent one.
fn disambiguate(vr: VirtualVr, value: &AttributeValue) -> VR {
    match vr {
        VirtualVr::Exact(vr) => vr,
        VirtualVr::Xs => match value {
            AttributeValue::List(_) => VR::US,
            value => match value.to_int() {
                Some(n) if n > i64::from(i16::MAX) => VR::US,
                Some(_) => VR::SS,
                None => VR::US,
            },
        },
        VirtualVr::Lt => match value {
            AttributeValue::Text(_) => VR::OW,
            _ => VR::US,
        },
        vr => vr.relaxed(),
    }
}

/// Build a new data set from a metadata attribute set.
pub fn map_attributes(set: &AttributeSet, vr_list: &VrList) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    put_attributes(&mut obj, set, vr_list);
    obj
}

/// Insert every attribute of `set` into `obj`,
/// replacing existing elements with the same tag.
///
/// Returns the number of attributes which were left out due to an error.
pub fn put_attributes(obj: &mut InMemDicomObject, set: &AttributeSet, vr_list: &VrList) -> usize {
    let mut failures = 0;
    for (key, value) in set.iter() {
        if key == PRIVATE_CREATOR_ID {
            continue;
        }
        match to_element(key, value, vr_list) {
            Ok(Some(elem)) => {
                obj.put(elem);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Skipping attribute `{}`: {}", key, snafu::Report::from_error(e));
                failures += 1;
            }
        }
    }
    failures
}

/// Convert one attribute into a data element.
/// Attributes which are not meant for the data set yield `None`.
fn to_element(
    key: &str,
    value: &AttributeValue,
    vr_list: &VrList,
) -> Result<Option<InMemElement>, AttributeError> {
    let tag = parse_tag_expr(key).context(UnknownAttributeSnafu { key })?;

    // file meta group is produced separately
    if tag.group() == 0x0002 {
        return Ok(None);
    }
    // private attributes
    if tag.group() % 2 == 1 {
        return Ok(None);
    }

    let vr = resolve_vr(tag, vr_list).context(UnknownVrSnafu { tag })?;
    let vr = disambiguate(vr, value);
    let value = to_value(tag, vr, value, vr_list)?;
    Ok(Some(DataElement::new(tag, vr, value)))
}

/// A single value extracted from an attribute value.
#[derive(Debug, Copy, Clone)]
enum Scalar<'a> {
    Null,
    Bool(bool),
    Number(&'a serde_json::Number),
    Text(&'a str),
    Set(&'a AttributeSet),
}

/// Flatten an attribute value into its individual values,
/// optionally splitting text on the DICOM value delimiter.
fn scalars(value: &AttributeValue, split: bool) -> Vec<Scalar<'_>> {
    fn collect<'a>(value: &'a AttributeValue, split: bool, out: &mut Vec<Scalar<'a>>) {
        match value {
            AttributeValue::Null => out.push(Scalar::Null),
            AttributeValue::Bool(b) => out.push(Scalar::Bool(*b)),
            AttributeValue::Number(n) => out.push(Scalar::Number(n)),
            AttributeValue::Text(text) if split => out.extend(text.split('\\').map(Scalar::Text)),
            AttributeValue::Text(text) => out.push(Scalar::Text(text)),
            AttributeValue::Set(set) => out.push(Scalar::Set(set)),
            AttributeValue::List(items) => {
                for item in items {
                    collect(item, split, out);
                }
            }
        }
    }

    let mut out = Vec::new();
    collect(value, split, &mut out);
    out
}

fn integer_of(scalar: Scalar) -> Option<i128> {
    match scalar {
        Scalar::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.)
                    .map(|f| f as i128)
            }),
        Scalar::Text(text) => {
            let text = text.trim();
            text.parse().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.)
                    .map(|f| f as i128)
            })
        }
        Scalar::Bool(b) => Some(i128::from(b)),
        _ => None,
    }
}

fn float_of(scalar: Scalar) -> Option<f64> {
    match scalar {
        Scalar::Number(n) => n.as_f64(),
        Scalar::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn integers<T>(tag: Tag, vr: VR, value: &AttributeValue) -> Result<C<T>, AttributeError>
where
    T: TryFrom<i128>,
{
    scalars(value, true)
        .into_iter()
        .filter(|s| !matches!(s, Scalar::Null | Scalar::Text("")))
        .map(|s| {
            let n = integer_of(s).context(InvalidValueSnafu { tag, vr })?;
            T::try_from(n)
                .ok()
                .context(OutOfRangeSnafu { tag, vr, value: n })
        })
        .collect()
}

fn floats(tag: Tag, vr: VR, value: &AttributeValue) -> Result<C<f64>, AttributeError> {
    scalars(value, true)
        .into_iter()
        .filter(|s| !matches!(s, Scalar::Null | Scalar::Text("")))
        .map(|s| float_of(s).context(InvalidValueSnafu { tag, vr }))
        .collect()
}

fn texts(
    tag: Tag,
    vr: VR,
    value: &AttributeValue,
    split: bool,
    to_text: impl Fn(Scalar) -> Option<Cow<str>>,
) -> Result<C<String>, AttributeError> {
    scalars(value, split)
        .into_iter()
        .map(|s| {
            to_text(s)
                .map(Cow::into_owned)
                .context(InvalidValueSnafu { tag, vr })
        })
        .collect()
}

fn plain_text(scalar: Scalar) -> Option<Cow<str>> {
    match scalar {
        Scalar::Null => Some(Cow::Borrowed("")),
        Scalar::Text(text) => Some(Cow::Borrowed(text)),
        Scalar::Number(n) => Some(Cow::Owned(n.to_string())),
        _ => None,
    }
}

fn integer_string(scalar: Scalar) -> Option<Cow<str>> {
    match scalar {
        Scalar::Number(_) => integer_of(scalar).map(|n| Cow::Owned(n.to_string())),
        Scalar::Text(text) => Some(Cow::Borrowed(text.trim())),
        Scalar::Null => Some(Cow::Borrowed("")),
        _ => None,
    }
}

fn person_name(scalar: Scalar) -> Option<Cow<str>> {
    match scalar {
        Scalar::Set(set) => {
            let components: Vec<Cow<str>> = ["Alphabetic", "Ideographic", "Phonetic"]
                .iter()
                .map(|group| {
                    set.get(group)
                        .and_then(AttributeValue::to_text)
                        .unwrap_or_default()
                })
                .collect();
            Some(Cow::Owned(components.join("=").trim_end_matches('=').to_string()))
        }
        scalar => plain_text(scalar),
    }
}

fn binary(tag: Tag, vr: VR, value: &AttributeValue) -> Result<PrimitiveValue, AttributeError> {
    let text = match value {
        AttributeValue::Null => return Ok(PrimitiveValue::Empty),
        AttributeValue::Text(text) => text.as_str(),
        AttributeValue::List(items) if items.len() == 1 => match &items[0] {
            AttributeValue::Text(text) => text.as_str(),
            _ => return InvalidValueSnafu { tag, vr }.fail(),
        },
        _ => return InvalidValueSnafu { tag, vr }.fail(),
    };
    // line-wrapped payloads are accepted
    let text: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let data = base64::engine::general_purpose::STANDARD
        .decode(text)
        .context(InvalidBinarySnafu { tag })?;
    Ok(PrimitiveValue::from(data))
}

fn sequence(tag: Tag, value: &AttributeValue, vr_list: &VrList) -> Result<InMemValue, AttributeError> {
    let items: Vec<InMemDicomObject> = match value {
        AttributeValue::Null => Vec::new(),
        AttributeValue::Set(set) => vec![map_attributes(set, vr_list)],
        AttributeValue::List(items) => items
            .iter()
            .map(|item| match item {
                AttributeValue::Set(set) => Ok(map_attributes(set, vr_list)),
                _ => NotASequenceSnafu { tag }.fail(),
            })
            .collect::<Result<_, _>>()?,
        _ => return NotASequenceSnafu { tag }.fail(),
    };
    Ok(Value::from(DataSetSequence::from(items)))
}

/// Convert a metadata value into a DICOM value of the given VR.
fn to_value(
    tag: Tag,
    vr: VR,
    value: &AttributeValue,
    vr_list: &VrList,
) -> Result<InMemValue, AttributeError> {
    if vr == VR::SQ {
        return sequence(tag, value, vr_list);
    }
    if value.is_null() {
        return Ok(PrimitiveValue::Empty.into());
    }

    let primitive = match vr {
        VR::AE
        | VR::AS
        | VR::CS
        | VR::DA
        | VR::DT
        | VR::LO
        | VR::SH
        | VR::TM
        | VR::UC
        | VR::UI => PrimitiveValue::Strs(texts(tag, vr, value, true, plain_text)?),
        // single valued, may contain backslashes
        VR::LT | VR::ST | VR::UT | VR::UR => {
            PrimitiveValue::Strs(texts(tag, vr, value, false, plain_text)?)
        }
        VR::PN => PrimitiveValue::Strs(texts(tag, vr, value, true, person_name)?),
        VR::DS => PrimitiveValue::Strs(texts(tag, vr, value, true, plain_text)?),
        VR::IS => PrimitiveValue::Strs(texts(tag, vr, value, true, integer_string)?),
        VR::SS => PrimitiveValue::I16(integers(tag, vr, value)?),
        VR::US => PrimitiveValue::U16(integers(tag, vr, value)?),
        VR::SL => PrimitiveValue::I32(integers(tag, vr, value)?),
        VR::UL => PrimitiveValue::U32(integers(tag, vr, value)?),
        VR::SV => PrimitiveValue::I64(integers(tag, vr, value)?),
        VR::UV => PrimitiveValue::U64(integers(tag, vr, value)?),
        VR::FL => PrimitiveValue::F32(floats(tag, vr, value)?.into_iter().map(|f| f as f32).collect()),
        VR::FD => PrimitiveValue::F64(floats(tag, vr, value)?),
        VR::AT => PrimitiveValue::Tags(
            scalars(value, true)
                .into_iter()
                .map(|s| match s {
                    Scalar::Text(text) => parse_tag_expr(text),
                    s => integer_of(s)
                        .and_then(|n| u32::try_from(n).ok())
                        .map(|n| Tag((n >> 16) as u16, (n & 0xFFFF) as u16)),
                })
                .map(|t| t.context(InvalidValueSnafu { tag, vr }))
                .collect::<Result<_, _>>()?,
        ),
        VR::OB | VR::OD | VR::OF | VR::OL | VR::OV | VR::OW | VR::UN => binary(tag, vr, value)?,
        VR::SQ => return sequence(tag, value, vr_list),
    };
    Ok(if primitive.multiplicity() == 0 {
        PrimitiveValue::Empty.into()
    } else {
        primitive.into()
    })
}

/// A converted DICOM instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomInstance {
    sop_instance_uid: String,
    series_instance_uid: String,
    instance_number: Option<i64>,
    object: DefaultDicomObject,
}

impl DicomInstance {
    pub fn sop_instance_uid(&self) -> &str {
        &self.sop_instance_uid
    }

    pub fn series_instance_uid(&self) -> &str {
        &self.series_instance_uid
    }

    /// The _Instance Number_ of the instance, if present and valid.
    pub fn instance_number(&self) -> Option<i64> {
        self.instance_number
    }

    pub fn object(&self) -> &DefaultDicomObject {
        &self.object
    }

    pub fn into_inner(self) -> DefaultDicomObject {
        self.object
    }
}

/// Build the complete DICOM object of one instance.
///
/// Attributes are merged from the patient, study, series
/// and instance levels, in this order,
/// so that the most specific level prevails.
/// Non-empty `pixel_data` is attached as native _Pixel Data_.
pub fn build_dataset(
    metadata: &ImageSetMetadata,
    series_instance_uid: &str,
    sop_instance_uid: &str,
    pixel_data: Vec<u8>,
) -> Result<DicomInstance, MappingError> {
    let series = metadata
        .series(series_instance_uid)
        .context(SeriesNotFoundSnafu {
            series_instance_uid,
        })?;
    let instance = series
        .instances
        .get(sop_instance_uid)
        .context(InstanceNotFoundSnafu { sop_instance_uid })?;

    let vr_list = VrList::from_dicom_vrs(&instance.dicom_vrs);
    let mut obj = InMemDicomObject::new_empty();
    let failures = [
        &metadata.patient.dicom,
        &metadata.study.dicom,
        &series.dicom,
        &instance.dicom,
    ]
    .into_iter()
    .map(|set| put_attributes(&mut obj, set, &vr_list))
    .sum::<usize>();
    if failures > 0 {
        warn!(
            "{} attribute(s) of instance {} could not be mapped",
            failures, sop_instance_uid
        );
    }

    if obj.get(tags::SOP_INSTANCE_UID).is_none() {
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ));
    }

    let sop_class_uid = obj
        .get(tags::SOP_CLASS_UID)
        .and_then(|e| e.to_str().ok())
        .map(|uid| uid.trim_end_matches(['\0', ' ']).to_string())
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| {
            warn!(
                "Instance {} has no SOP Class UID, assuming Secondary Capture",
                sop_instance_uid
            );
            uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string()
        });

    if !pixel_data.is_empty() {
        let bits_allocated = obj
            .get(tags::BITS_ALLOCATED)
            .and_then(|e| e.to_int::<u16>().ok())
            .unwrap_or(8);
        let vr = if bits_allocated > 8 { VR::OW } else { VR::OB };
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            vr,
            PrimitiveValue::from(pixel_data),
        ));
    }

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .build()
        .context(BuildMetaSnafu { sop_instance_uid })?;

    Ok(DicomInstance {
        sop_instance_uid: sop_instance_uid.to_string(),
        series_instance_uid: series_instance_uid.to_string(),
        instance_number: instance.instance_number(),
        object: obj.with_exact_meta(meta),
    })
}
