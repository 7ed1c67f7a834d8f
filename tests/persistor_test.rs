//! Hierarchical persistor scenarios: lifecycle gates, deletion rules, and
//! the keyword/property/note conventions.

use epoch_daq::persistence::H5EpochPersistor;
use epoch_daq::{
    DaqError, DeviceRef, Epoch, EpochDuration, Measurement, PreloadedStimulus, PropertyValue,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn t0() -> chrono::DateTime<chrono::FixedOffset> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

fn t(minutes: i64) -> chrono::DateTime<chrono::FixedOffset> {
    t0() + chrono::Duration::minutes(minutes)
}

fn khz() -> Measurement {
    Measurement::new(1000.0, "Hz")
}

fn completed_epoch(device: &DeviceRef, protocol_id: &str) -> Arc<Epoch> {
    let mut epoch = Epoch::new(protocol_id, EpochDuration::Definite(Duration::from_secs(1)));
    epoch.add_stimulus(
        device.clone(),
        Box::new(
            PreloadedStimulus::new(
                "pulse",
                "mV",
                khz(),
                vec![Measurement::new(5.0, "mV"); 1000],
            )
            .with_parameter("amplitude_mv", 5.0),
        ),
    );
    epoch.add_response(device.clone(), khz());
    epoch.add_parameter("sweeps", 4i64);
    epoch.add_keyword("ok");
    let epoch = Arc::new(epoch);
    epoch.set_start_time(t(1));
    epoch.append_response_data(
        device,
        epoch_daq::IoData::new(vec![Measurement::new(0.5, "microsiemens"); 1000], khz()),
        t(1),
    );
    epoch
}

#[test]
fn test_create_refuses_existing_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("e.h5");
    let p = H5EpochPersistor::create(&path, "p", t0()).unwrap();
    drop(p);
    assert!(matches!(
        H5EpochPersistor::create(&path, "p", t0()),
        Err(DaqError::FileAlreadyExists(_))
    ));
}

#[test]
fn test_open_refuses_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        H5EpochPersistor::open(&dir.path().join("absent.h5")),
        Err(DaqError::FileNotFound(_))
    ));
}

/// A stale format version is a hard open failure.
#[test]
fn test_open_refuses_version_mismatch() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("old.h5");
    {
        let file = hdf5::File::create(&path).unwrap();
        file.new_attr::<u32>()
            .create("version")
            .unwrap()
            .write_scalar(&1u32)
            .unwrap();
        file.create_group("experiment-legacy").unwrap();
    }
    let err = H5EpochPersistor::open(&path).unwrap_err();
    assert!(matches!(
        err,
        DaqError::VersionMismatch {
            found: 1,
            expected: 2
        }
    ));
}

#[test]
fn test_open_refuses_missing_version_attribute() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bare.h5");
    {
        let file = hdf5::File::create(&path).unwrap();
        file.create_group("experiment-legacy").unwrap();
    }
    let err = H5EpochPersistor::open(&path).unwrap_err();
    assert!(err.to_string().contains("version"));
}

#[test]
fn test_open_requires_exactly_one_top_level_group() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("two-roots.h5");
    {
        let file = hdf5::File::create(&path).unwrap();
        file.new_attr::<u32>()
            .create("version")
            .unwrap()
            .write_scalar(&2u32)
            .unwrap();
        file.create_group("experiment-a").unwrap();
        file.create_group("experiment-b").unwrap();
    }
    let err = H5EpochPersistor::open(&path).unwrap_err();
    assert!(err.to_string().contains("top-level"));
}

#[test]
fn test_round_trip_through_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("e.h5");
    {
        let p = H5EpochPersistor::create(&path, "patch clamp", t0()).unwrap();
        p.add_device("D", "M").unwrap();
        p.close(t(10)).unwrap();
    }
    let p = H5EpochPersistor::open(&path).unwrap();
    let experiment = p.experiment();
    assert_eq!(experiment.purpose().unwrap(), "patch clamp");
    assert_eq!(experiment.start_time().unwrap(), Some(t0()));
    assert_eq!(experiment.end_time().unwrap(), Some(t(10)));
    let devices = experiment.devices().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].manufacturer().unwrap(), "M");
}

#[test]
fn test_duplicate_device_identity_is_rejected() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    p.add_device("D", "M").unwrap();
    // Same name under another manufacturer is a different device.
    p.add_device("D", "Other").unwrap();
    assert!(matches!(
        p.add_device("D", "M"),
        Err(DaqError::DuplicatePersistedDevice { .. })
    ));
}

#[test]
fn test_block_lifecycle_gates() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();

    // No open group yet.
    assert!(p.begin_epoch_block("proto", t(1)).is_err());
    assert!(p.end_epoch_group(t(1)).is_err());
    assert!(p.end_epoch_block(t(1)).is_err());

    let source = p.add_source("src", None).unwrap();
    p.begin_epoch_group("g", &source, t(1)).unwrap();
    p.begin_epoch_block("proto", t(2)).unwrap();

    // A group cannot end while its block is open; a second block cannot
    // open.
    assert!(p.end_epoch_group(t(3)).is_err());
    assert!(p.begin_epoch_block("other", t(3)).is_err());

    p.end_epoch_block(t(4)).unwrap();
    p.end_epoch_group(t(5)).unwrap();
}

#[test]
fn test_serialize_requires_matching_open_block() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let device = DeviceRef::new("D", "M");
    let epoch = completed_epoch(&device, "proto");

    assert!(matches!(
        p.serialize(&epoch),
        Err(DaqError::State(ref m)) if m.contains("no open epoch block")
    ));

    let source = p.add_source("src", None).unwrap();
    p.begin_epoch_group("g", &source, t(1)).unwrap();
    p.begin_epoch_block("other-proto", t(2)).unwrap();
    assert!(matches!(
        p.serialize(&epoch),
        Err(DaqError::State(ref m)) if m.contains("does not match")
    ));
}

#[test]
fn test_serialize_interns_devices_and_writes_payload() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let device = DeviceRef::new("D", "M");
    let source = p.add_source("src", None).unwrap();
    p.begin_epoch_group("g", &source, t(1)).unwrap();
    p.begin_epoch_block("proto", t(2)).unwrap();

    // The device was never added explicitly; serialize interns it.
    assert!(p.experiment().devices().unwrap().is_empty());
    let persisted = p.serialize(&completed_epoch(&device, "proto")).unwrap();

    let devices = p.experiment().devices().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name().unwrap(), "D");

    assert_eq!(persisted.protocol_id().unwrap(), "proto");
    assert_eq!(
        persisted.protocol_parameters().unwrap()["sweeps"],
        PropertyValue::Int(4)
    );
    assert_eq!(persisted.keywords().unwrap().len(), 1);
    assert_eq!(persisted.start_time().unwrap(), Some(t(1)));
    // End time is start + duration for a definite epoch.
    assert_eq!(
        persisted.end_time().unwrap(),
        Some(t(1) + chrono::Duration::seconds(1))
    );

    let stimuli = persisted.stimuli().unwrap();
    assert_eq!(stimuli.len(), 1);
    assert_eq!(stimuli[0].stimulus_id().unwrap(), "pulse");
    assert_eq!(
        stimuli[0].parameters().unwrap()["amplitude_mv"],
        PropertyValue::Float(5.0)
    );
    assert_eq!(stimuli[0].device().unwrap().name().unwrap(), "D");

    let responses = persisted.responses().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].input_time().unwrap(), Some(t(1)));
    let data = responses[0].data().unwrap();
    assert_eq!(data.len(), 1000);
    // The 12-byte unit was silently truncated to the fixed field width.
    assert_eq!(data[0].display_unit(), "microsieme");
    assert_eq!(
        responses[0].configuration_spans().unwrap()[0].duration,
        Duration::from_secs(1)
    );
}

/// Deletion respects the open traversal stack and source back-links.
#[test]
fn test_delete_guards() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let source = p.add_source("src", None).unwrap();
    let group = p.begin_epoch_group("g", &source, t(1)).unwrap();

    // The experiment and the open group both refuse deletion.
    let experiment = p.experiment();
    assert!(matches!(
        p.delete(&experiment),
        Err(DaqError::DeleteRefused(_))
    ));
    assert!(matches!(p.delete(&group), Err(DaqError::DeleteRefused(_))));

    // The source is still referenced by the group.
    assert!(matches!(
        p.delete(&source),
        Err(DaqError::DeleteRefused(_))
    ));

    p.end_epoch_group(t(2)).unwrap();
    p.delete(&group).unwrap();
    assert!(p.experiment().epoch_groups().unwrap().is_empty());

    // The back-link went with the group, so the source is now free.
    assert!(source.epoch_groups().unwrap().is_empty());
    p.delete(&source).unwrap();
    assert!(p.experiment().sources().unwrap().is_empty());
}

#[test]
fn test_nested_source_references_block_deletion() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let parent = p.add_source("prep", None).unwrap();
    let child = p.add_source("cell-1", Some(&parent)).unwrap();
    p.begin_epoch_group("g", &child, t(1)).unwrap();
    p.end_epoch_group(t(2)).unwrap();

    // A reference held through a nested source still protects the parent.
    assert!(matches!(
        p.delete(&parent),
        Err(DaqError::DeleteRefused(_))
    ));
}

/// Keyword addition is idempotent; removing the last one drops the attribute.
#[test]
fn test_keyword_round_trip() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let source = p.add_source("src", None).unwrap();

    source.add_keyword("x").unwrap();
    source.add_keyword("x").unwrap();
    assert_eq!(
        source.keywords().unwrap().into_iter().collect::<Vec<_>>(),
        vec!["x".to_string()]
    );

    source.remove_keyword("x").unwrap();
    assert!(source.keywords().unwrap().is_empty());
    assert!(!source.has_keywords_attribute());
}

#[test]
fn test_keywords_serialize_as_sorted_join() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let source = p.add_source("src", None).unwrap();
    source.add_keyword("zeta").unwrap();
    source.add_keyword("alpha").unwrap();
    assert_eq!(
        source.keywords().unwrap().into_iter().collect::<Vec<_>>(),
        vec!["alpha".to_string(), "zeta".to_string()]
    );
    assert!(source.add_keyword("a,b").is_err());
}

#[test]
fn test_property_bag_round_trip() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let source = p.add_source("src", None).unwrap();

    assert!(source.properties().unwrap().is_empty());
    source.add_property("temperature_c", 32.5).unwrap();
    source.add_property("passage", 7i64).unwrap();
    source.add_property("viable", true).unwrap();
    source.add_property("strain", "C57BL/6").unwrap();

    let props = source.properties().unwrap();
    assert_eq!(props["temperature_c"], PropertyValue::Float(32.5));
    assert_eq!(props["passage"], PropertyValue::Int(7));
    assert_eq!(props["viable"], PropertyValue::Bool(true));
    assert_eq!(props["strain"], PropertyValue::Text("C57BL/6".into()));

    // Replacement overwrites in place.
    source.add_property("passage", 8i64).unwrap();
    assert_eq!(
        source.properties().unwrap()["passage"],
        PropertyValue::Int(8)
    );

    assert!(source.remove_property("viable").unwrap());
    assert!(!source.remove_property("viable").unwrap());
    assert!(!source.properties().unwrap().contains_key("viable"));
}

/// Notes append in order; an absent dataset reads as empty.
#[test]
fn test_notes_append_only_in_order() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let source = p.add_source("src", None).unwrap();

    assert!(source.notes().unwrap().is_empty());
    source.add_note(t(1), "seal formed").unwrap();
    source.add_note(t(2), "broke in").unwrap();

    let notes = source.notes().unwrap();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].text, "seal formed");
    assert_eq!(notes[0].time, t(1));
    assert_eq!(notes[1].text, "broke in");
}

/// Entity handles compare and hash by UUID.
#[test]
fn test_entity_equality_is_by_uuid() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("e.h5");
    let p = H5EpochPersistor::create(&path, "p", t0()).unwrap();
    let a = p.add_source("a", None).unwrap();
    let b = p.add_source("b", None).unwrap();
    assert_ne!(a, b);

    let resolved = p.experiment().sources().unwrap();
    let a_again = resolved.iter().find(|s| s.uuid() == a.uuid()).unwrap();
    assert_eq!(&a, a_again);

    let mut seen = std::collections::HashSet::new();
    seen.insert(a.uuid());
    seen.insert(b.uuid());
    seen.insert(a_again.uuid());
    assert_eq!(seen.len(), 2);
}

#[test]
fn test_close_unwinds_open_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("e.h5");
    let p = H5EpochPersistor::create(&path, "p", t0()).unwrap();
    let source = p.add_source("src", None).unwrap();
    let outer = p.begin_epoch_group("outer", &source, t(1)).unwrap();
    let inner = p.begin_epoch_group("inner", &source, t(2)).unwrap();
    p.begin_epoch_block("proto", t(3)).unwrap();

    p.close(t(9)).unwrap();
    assert_eq!(inner.end_time().unwrap(), Some(t(9)));
    assert_eq!(outer.end_time().unwrap(), Some(t(9)));
    assert_eq!(p.experiment().end_time().unwrap(), Some(t(9)));

    // End times stamp exactly once, so a second close fails.
    assert!(p.close(t(10)).is_err());
}

#[test]
fn test_epoch_group_source_back_link() {
    let dir = TempDir::new().unwrap();
    let p = H5EpochPersistor::create(&dir.path().join("e.h5"), "p", t0()).unwrap();
    let source = p.add_source("src", None).unwrap();
    let group = p.begin_epoch_group("g", &source, t(1)).unwrap();

    // The group resolves its source and the source sees the group back,
    // through hard links rather than copies.
    assert_eq!(group.source().unwrap().uuid(), source.uuid());
    let back = source.epoch_groups().unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].uuid(), group.uuid());
}
