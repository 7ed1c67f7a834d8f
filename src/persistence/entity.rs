//! Persistent entity core: identity, keywords, properties, notes.
//!
//! Every node in the containment tree is a `PersistentEntity`: an HDF5
//! group named `<prefix>-<uuid>` carrying a `uuid` attribute. Keywords are
//! a comma-joined attribute, properties are a typed attribute bag on a
//! lazily-created `properties` subgroup, and notes are an append-only
//! extensible dataset. Readers tolerate absent lazy members and return
//! empty collections.
//!
//! The attribute helpers at the bottom are the binary-layer primitives the
//! rest of the persistor is built from.

use crate::error::{DaqError, Result};
use crate::parameter::PropertyValue;
use chrono::{DateTime, FixedOffset};
use hdf5::types::{TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, Group};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CString;
use tracing::warn;
use uuid::Uuid;

use super::records::{var_ascii, DateTimeOffsetRecord, NoteRecord, NOTES_CHUNK_LEN};

/// Deletes an attribute by name. `hdf5` 0.8 does not expose `delete_attr`
/// on `Group`, so this calls the underlying `H5Adelete` directly.
fn delete_attr(group: &Group, name: &str) -> std::result::Result<(), ()> {
    let cname = CString::new(name).map_err(|_| ())?;
    let ret = unsafe { hdf5_sys::h5a::H5Adelete(group.id(), cname.as_ptr()) };
    if ret >= 0 {
        Ok(())
    } else {
        Err(())
    }
}

/// A timestamped free-text annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub time: DateTime<FixedOffset>,
    pub text: String,
}

/// Handle to one persisted entity.
///
/// Two handles are equal iff their UUIDs are equal, and hash by UUID.
#[derive(Clone)]
pub struct PersistentEntity {
    group: Group,
    uuid: Uuid,
}

impl PartialEq for PersistentEntity {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for PersistentEntity {}

impl std::hash::Hash for PersistentEntity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl PersistentEntity {
    /// Inserts a fresh entity group `<prefix>-<uuid>` under `parent`.
    pub(crate) fn create(parent: &Group, prefix: &str) -> Result<Self> {
        if prefix.contains('/') {
            return Err(DaqError::State(format!(
                "entity label '{prefix}' must not contain '/'"
            )));
        }
        let uuid = Uuid::new_v4();
        let group = parent.create_group(&format!("{prefix}-{uuid}"))?;
        write_str_attr(&group, "uuid", &uuid.to_string())?;
        Ok(Self { group, uuid })
    }

    /// Wraps an existing entity group, reading its `uuid` attribute.
    pub(crate) fn attach(group: Group) -> Result<Self> {
        let raw = read_str_attr(&group, "uuid")?;
        let uuid = Uuid::parse_str(&raw)
            .map_err(|e| DaqError::State(format!("invalid uuid attribute '{raw}': {e}")))?;
        Ok(Self { group, uuid })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub(crate) fn group(&self) -> &Group {
        &self.group
    }

    /// Absolute path of the entity group within the file.
    pub fn path(&self) -> String {
        self.group.name()
    }

    /// Final path segment (`<prefix>-<uuid>`).
    pub(crate) fn link_name(&self) -> String {
        self.path().rsplit('/').next().unwrap_or_default().to_string()
    }

    // --- keywords -----------------------------------------------------

    pub fn keywords(&self) -> Result<BTreeSet<String>> {
        match try_read_str_attr(&self.group, "keywords")? {
            Some(joined) if !joined.is_empty() => {
                Ok(joined.split(',').map(str::to_string).collect())
            }
            _ => Ok(BTreeSet::new()),
        }
    }

    pub fn add_keyword(&self, keyword: &str) -> Result<()> {
        if keyword.contains(',') {
            return Err(DaqError::State(format!(
                "keyword '{keyword}' must not contain ','"
            )));
        }
        let mut keywords = self.keywords()?;
        keywords.insert(keyword.to_string());
        self.write_keywords(&keywords)
    }

    pub fn remove_keyword(&self, keyword: &str) -> Result<()> {
        let mut keywords = self.keywords()?;
        keywords.remove(keyword);
        self.write_keywords(&keywords)
    }

    /// Whether the `keywords` attribute is materialized on the group.
    /// Removing the last keyword removes the attribute entirely.
    pub fn has_keywords_attribute(&self) -> bool {
        self.group.attr("keywords").is_ok()
    }

    pub(crate) fn write_keywords(&self, keywords: &BTreeSet<String>) -> Result<()> {
        if keywords.is_empty() {
            let _ = delete_attr(&self.group, "keywords");
            return Ok(());
        }
        let joined = keywords.iter().cloned().collect::<Vec<_>>().join(",");
        write_str_attr(&self.group, "keywords", &joined)
    }

    // --- properties ---------------------------------------------------

    pub fn properties(&self) -> Result<BTreeMap<String, PropertyValue>> {
        let Ok(bag) = self.group.group("properties") else {
            return Ok(BTreeMap::new());
        };
        read_bag_attrs(&bag)
    }

    /// Adds (or replaces) a property, creating the `properties` subgroup
    /// on first use.
    pub fn add_property(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let bag = if let Ok(bag) = self.group.group("properties") {
            bag
        } else {
            self.group.create_group("properties")?
        };
        write_property_attr(&bag, name, &value.into())
    }

    /// Removes a property if present; the `properties` subgroup itself is
    /// never destroyed. Returns whether anything was removed.
    pub fn remove_property(&self, name: &str) -> Result<bool> {
        let Ok(bag) = self.group.group("properties") else {
            return Ok(false);
        };
        Ok(delete_attr(&bag, name).is_ok())
    }

    // --- notes --------------------------------------------------------

    /// Notes in insertion order; empty when the dataset was never created.
    pub fn notes(&self) -> Result<Vec<Note>> {
        let Ok(dataset) = self.group.dataset("notes") else {
            return Ok(Vec::new());
        };
        dataset
            .read_raw::<NoteRecord>()?
            .into_iter()
            .map(|record| {
                Ok(Note {
                    time: record.time.to_date_time()?,
                    text: record.text.as_str().to_string(),
                })
            })
            .collect()
    }

    /// Appends a note at the dataset tail, creating the dataset on first
    /// use.
    pub fn add_note(&self, time: DateTime<FixedOffset>, text: &str) -> Result<()> {
        let dataset = if let Ok(dataset) = self.group.dataset("notes") {
            dataset
        } else {
            self.group
                .new_dataset::<NoteRecord>()
                .chunk(NOTES_CHUNK_LEN)
                .shape(0..)
                .create("notes")?
        };
        let record = NoteRecord {
            time: DateTimeOffsetRecord::from_date_time(&time),
            text: var_ascii(text)?,
        };
        let tail = dataset.shape()[0];
        dataset.resize((tail + 1,))?;
        dataset.write_slice(&[record], tail..)?;
        Ok(())
    }

    // --- timeline -----------------------------------------------------

    pub fn start_time(&self) -> Result<Option<DateTime<FixedOffset>>> {
        read_time_attrs(&self.group, "startTime")
    }

    pub fn end_time(&self) -> Result<Option<DateTime<FixedOffset>>> {
        read_time_attrs(&self.group, "endTime")
    }

    /// Stamps the end time; settable exactly once.
    pub fn set_end_time(&self, time: DateTime<FixedOffset>) -> Result<()> {
        if self.end_time()?.is_some() {
            return Err(DaqError::State(format!(
                "end time already set on {}",
                self.path()
            )));
        }
        write_time_attrs(&self.group, "endTime", &time)
    }
}

impl std::fmt::Debug for PersistentEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentEntity")
            .field("path", &self.path())
            .field("uuid", &self.uuid)
            .finish()
    }
}

// ---------------------------------------------------------------------
// Binary-layer attribute primitives
// ---------------------------------------------------------------------

fn parse_unicode(value: &str) -> Result<VarLenUnicode> {
    value
        .parse::<VarLenUnicode>()
        .map_err(|_| DaqError::State(format!("string not storable as attribute: {value:?}")))
}

/// Writes (replacing if present) a variable-length string attribute.
pub(crate) fn write_str_attr(group: &Group, name: &str, value: &str) -> Result<()> {
    let _ = delete_attr(group, name);
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&parse_unicode(value)?)?;
    Ok(())
}

pub(crate) fn read_str_attr(group: &Group, name: &str) -> Result<String> {
    let attr = group.attr(name)?;
    // Older writers used ASCII-typed attributes for the same fields.
    match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenAscii => Ok(attr.read_scalar::<VarLenAscii>()?.as_str().to_string()),
        _ => Ok(attr.read_scalar::<VarLenUnicode>()?.as_str().to_string()),
    }
}

pub(crate) fn try_read_str_attr(group: &Group, name: &str) -> Result<Option<String>> {
    if group.attr(name).is_ok() {
        read_str_attr(group, name).map(Some)
    } else {
        Ok(None)
    }
}

/// Writes (replacing if present) an f64 attribute.
pub(crate) fn write_f64_attr(group: &Group, name: &str, value: f64) -> Result<()> {
    let _ = delete_attr(group, name);
    group.new_attr::<f64>().create(name)?.write_scalar(&value)?;
    Ok(())
}

/// Writes the `<prefix>DotNetDateTimeOffsetTicks` / `<prefix>OffsetHours`
/// attribute pair.
pub(crate) fn write_time_attrs(
    group: &Group,
    prefix: &str,
    time: &DateTime<FixedOffset>,
) -> Result<()> {
    let record = DateTimeOffsetRecord::from_date_time(time);
    let ticks_name = format!("{prefix}DotNetDateTimeOffsetTicks");
    let hours_name = format!("{prefix}OffsetHours");
    let _ = delete_attr(group, &ticks_name);
    group
        .new_attr::<i64>()
        .create(ticks_name.as_str())?
        .write_scalar(&record.ticks)?;
    write_f64_attr(group, &hours_name, record.offset_hours)?;
    Ok(())
}

pub(crate) fn read_time_attrs(
    group: &Group,
    prefix: &str,
) -> Result<Option<DateTime<FixedOffset>>> {
    let ticks_name = format!("{prefix}DotNetDateTimeOffsetTicks");
    let Ok(ticks_attr) = group.attr(&ticks_name) else {
        return Ok(None);
    };
    let ticks = ticks_attr.read_scalar::<i64>()?;
    let hours = group
        .attr(&format!("{prefix}OffsetHours"))?
        .read_scalar::<f64>()?;
    let record = DateTimeOffsetRecord {
        ticks,
        offset_hours: hours,
    };
    record.to_date_time().map(Some)
}

/// Writes one scalar value as a natively-typed attribute, replacing any
/// previous value.
pub(crate) fn write_property_attr(
    group: &Group,
    name: &str,
    value: &PropertyValue,
) -> Result<()> {
    let _ = delete_attr(group, name);
    match value {
        PropertyValue::Bool(v) => {
            group.new_attr::<bool>().create(name)?.write_scalar(v)?;
        }
        PropertyValue::Int(v) => {
            group.new_attr::<i64>().create(name)?.write_scalar(v)?;
        }
        PropertyValue::Float(v) => {
            group.new_attr::<f64>().create(name)?.write_scalar(v)?;
        }
        PropertyValue::Text(v) => {
            group
                .new_attr::<VarLenUnicode>()
                .create(name)?
                .write_scalar(&parse_unicode(v)?)?;
        }
    }
    Ok(())
}

fn read_property_attr(attr: &Attribute) -> Result<Option<PropertyValue>> {
    let value = match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::Boolean => PropertyValue::Bool(attr.read_scalar::<bool>()?),
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
            PropertyValue::Int(attr.read_scalar::<i64>()?)
        }
        TypeDescriptor::Float(_) => PropertyValue::Float(attr.read_scalar::<f64>()?),
        TypeDescriptor::VarLenUnicode => {
            PropertyValue::Text(attr.read_scalar::<VarLenUnicode>()?.as_str().to_string())
        }
        TypeDescriptor::VarLenAscii => {
            PropertyValue::Text(attr.read_scalar::<VarLenAscii>()?.as_str().to_string())
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Reads every attribute of a bag group as a typed scalar map.
pub(crate) fn read_bag_attrs(bag: &Group) -> Result<BTreeMap<String, PropertyValue>> {
    let mut out = BTreeMap::new();
    for name in bag.attr_names()? {
        let attr = bag.attr(&name)?;
        match read_property_attr(&attr)? {
            Some(value) => {
                out.insert(name, value);
            }
            None => {
                warn!(attribute = %name, group = %bag.name(), "skipping attribute of unsupported type");
            }
        }
    }
    Ok(out)
}

/// Writes a whole bag as attributes of the `name` subgroup of `parent`,
/// creating it if needed.
pub(crate) fn write_bag(
    parent: &Group,
    name: &str,
    values: &BTreeMap<String, PropertyValue>,
) -> Result<Group> {
    let bag = if let Ok(bag) = parent.group(name) {
        bag
    } else {
        parent.create_group(name)?
    };
    for (key, value) in values {
        write_property_attr(&bag, key, value)?;
    }
    Ok(bag)
}
