//! Capture document decoding.
//!
//! A capture is a gzip-compressed JSON object. Only two of its keys matter
//! here: `entities`, an array of unit/vehicle objects, and `events`, an array
//! of event tuples. Everything else (mission metadata, markers, timestamps) is
//! skipped without being materialized.
//!
//! ```text
//! {
//!   "entities": [{"type": "unit", "id": 1, "name": "A", "side": "WEST",
//!                 "isPlayer": 1, "positions": [[pos, dir, alive, vehicle, "A2"], ...]}, ...],
//!   "events":   [[frame, "killed", victim_id, [killer_id, "weapon"], distance], ...],
//!   ...
//! }
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use flate2::bufread::GzDecoder;
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::Value;
use tracing::trace;

use crate::analyzer::{Analyzer, CaptureRecord};
use crate::error::{Result, StatsError};
use crate::types::{EntityId, KillEvent, PlayerEntity, UNKNOWN_WEAPON};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Index of the display-name override inside a position snapshot.
const NAME_SLOT: usize = 4;

/// Decompressed byte stream of one capture file.
pub type CaptureReader = BufReader<GzDecoder<BufReader<File>>>;

/// Open a capture file and set up gzip decompression.
pub fn open_capture(path: &Path) -> Result<CaptureReader> {
    let file = File::open(path).map_err(|source| StatsError::FileOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let head = reader.fill_buf().map_err(StatsError::Decompression)?;
    if !head.starts_with(&GZIP_MAGIC) {
        return Err(StatsError::Decompression(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a gzip stream",
        )));
    }

    Ok(BufReader::new(GzDecoder::new(reader)))
}

/// Turns a decompressed capture document into [`CaptureRecord`]s.
///
/// Implementations must keep only player units, interpret only `killed`
/// events, skip records whose fields have unexpected types, and fail only
/// when the document itself cannot be read. `Analyzer::finish` is called after
/// a successful decode.
pub trait CaptureDecoder: Send + Sync {
    fn decode(&self, reader: &mut dyn Read, analyzer: &mut dyn Analyzer) -> Result<()>;
}

/// Token-stream decoder. Holds at most one entity or event in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingDecoder;

impl CaptureDecoder for StreamingDecoder {
    fn decode(&self, reader: &mut dyn Read, analyzer: &mut dyn Analyzer) -> Result<()> {
        let mut de = serde_json::Deserializer::from_reader(reader);
        DocumentSeed { analyzer: &mut *analyzer }
            .deserialize(&mut de)
            .map_err(StatsError::from_json)?;
        de.end().map_err(StatsError::from_json)?;
        analyzer.finish();
        Ok(())
    }
}

/// Reads the whole document into memory before interpreting it. Only suitable
/// for small captures.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferedDecoder;

impl CaptureDecoder for BufferedDecoder {
    fn decode(&self, reader: &mut dyn Read, analyzer: &mut dyn Analyzer) -> Result<()> {
        let document: Value = serde_json::from_reader(reader).map_err(StatsError::from_json)?;
        let Value::Object(document) = document else {
            return Err(malformed("capture document is not an object"));
        };

        for (key, value) in &document {
            match key.as_str() {
                "entities" => {
                    let entities = value
                        .as_array()
                        .ok_or_else(|| malformed("`entities` is not an array"))?;
                    for entity in entities {
                        if let Some(player) = EntityFields::from_value(entity).into_player() {
                            analyzer.process(CaptureRecord::Player(player));
                        }
                    }
                    analyzer.process(CaptureRecord::EntitiesEnd);
                }
                "events" => {
                    let events = value
                        .as_array()
                        .ok_or_else(|| malformed("`events` is not an array"))?;
                    for event in events {
                        emit_event(event, &mut *analyzer);
                    }
                }
                _ => {}
            }
        }

        analyzer.finish();
        Ok(())
    }
}

fn malformed(msg: &str) -> StatsError {
    StatsError::MalformedDocument(de::Error::custom(msg))
}

fn emit_event<A: Analyzer + ?Sized>(event: &Value, analyzer: &mut A) {
    match interpret_event(event) {
        Some(kill) => analyzer.process(CaptureRecord::Kill(kill)),
        None => trace!("skipping event {event}"),
    }
}

/// Interpret one event tuple, returning `None` for anything that is not a
/// well-formed `killed` event.
pub fn interpret_event(event: &Value) -> Option<KillEvent> {
    let items = event.as_array()?;
    if items.len() < 4 || items[1].as_str()? != "killed" {
        return None;
    }

    let victim = items[2].as_i64()?;
    let cause = items[3].as_array()?;
    let killer = cause.first()?.as_i64()?;
    let weapon = cause.get(1).and_then(Value::as_str).unwrap_or(UNKNOWN_WEAPON);

    Some(KillEvent {
        victim: EntityId(victim),
        killer: EntityId(killer),
        weapon: weapon.to_string(),
    })
}

/// The handful of entity fields needed to recognise and name a player.
#[derive(Debug, Default)]
struct EntityFields {
    kind: Option<String>,
    id: Option<i64>,
    name: Option<String>,
    side: Option<String>,
    is_player: Option<i64>,
    name_override: Option<String>,
}

impl EntityFields {
    fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };
        Self {
            kind: object.get("type").and_then(string_of),
            id: object.get("id").and_then(Value::as_i64),
            name: object.get("name").and_then(string_of),
            side: object.get("side").and_then(string_of),
            is_player: object.get("isPlayer").and_then(Value::as_i64),
            name_override: object
                .get("positions")
                .and_then(Value::as_array)
                .and_then(|positions| positions.iter().filter_map(snapshot_name).last()),
        }
    }

    fn into_player(self) -> Option<PlayerEntity> {
        if self.kind.as_deref() != Some("unit") || self.is_player != Some(1) {
            return None;
        }
        let id = self.id?;
        Some(PlayerEntity {
            id: EntityId(id),
            name: self.name_override.or(self.name).unwrap_or_default(),
            side: self.side.unwrap_or_default(),
        })
    }
}

fn string_of(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn non_empty_name(value: Value) -> Option<String> {
    match value {
        Value::String(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

fn snapshot_name(snapshot: &Value) -> Option<String> {
    snapshot
        .as_array()
        .and_then(|slots| slots.get(NAME_SLOT))
        .cloned()
        .and_then(non_empty_name)
}

/// Generates `visit_*` methods that accept and ignore scalar values, so a
/// record of the wrong shape is skipped instead of failing the document.
macro_rules! ignore_scalars {
    ($default:expr) => {
        fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<Self::Value, E> {
            Ok($default)
        }

        fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<Self::Value, E> {
            Ok($default)
        }

        fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<Self::Value, E> {
            Ok($default)
        }

        fn visit_f64<E: de::Error>(self, _: f64) -> std::result::Result<Self::Value, E> {
            Ok($default)
        }

        fn visit_str<E: de::Error>(self, _: &str) -> std::result::Result<Self::Value, E> {
            Ok($default)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok($default)
        }
    };
}

fn drain_seq<'de, S: SeqAccess<'de>>(seq: &mut S) -> std::result::Result<(), S::Error> {
    while seq.next_element::<IgnoredAny>()?.is_some() {}
    Ok(())
}

fn drain_map<'de, M: MapAccess<'de>>(map: &mut M) -> std::result::Result<(), M::Error> {
    while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
    Ok(())
}

/// Top-level object: dispatches `entities` and `events`, skips the rest.
struct DocumentSeed<'a, A: ?Sized> {
    analyzer: &'a mut A,
}

impl<'de, A: Analyzer + ?Sized> DeserializeSeed<'de> for DocumentSeed<'_, A> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, A: Analyzer + ?Sized> Visitor<'de> for DocumentSeed<'_, A> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a capture document object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<(), M::Error> {
        let analyzer = self.analyzer;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "entities" => {
                    map.next_value_seed(EntitiesSeed { analyzer: &mut *analyzer })?;
                    analyzer.process(CaptureRecord::EntitiesEnd);
                }
                "events" => {
                    map.next_value_seed(EventsSeed { analyzer: &mut *analyzer })?;
                }
                other => {
                    trace!("skipping top-level key {other}");
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

struct EntitiesSeed<'a, A: ?Sized> {
    analyzer: &'a mut A,
}

impl<'de, A: Analyzer + ?Sized> DeserializeSeed<'de> for EntitiesSeed<'_, A> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, A: Analyzer + ?Sized> Visitor<'de> for EntitiesSeed<'_, A> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of entities")
    }

    fn visit_seq<S: SeqAccess<'de>>(self, mut seq: S) -> std::result::Result<(), S::Error> {
        while let Some(fields) = seq.next_element_seed(EntitySeed)? {
            if let Some(player) = fields.into_player() {
                self.analyzer.process(CaptureRecord::Player(player));
            }
        }
        Ok(())
    }
}

struct EntitySeed;

impl<'de> DeserializeSeed<'de> for EntitySeed {
    type Value = EntityFields;

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<EntityFields, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for EntitySeed {
    type Value = EntityFields;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an entity object")
    }

    ignore_scalars!(EntityFields::default());

    fn visit_seq<S: SeqAccess<'de>>(
        self,
        mut seq: S,
    ) -> std::result::Result<EntityFields, S::Error> {
        drain_seq(&mut seq)?;
        Ok(EntityFields::default())
    }

    fn visit_map<M: MapAccess<'de>>(
        self,
        mut map: M,
    ) -> std::result::Result<EntityFields, M::Error> {
        let mut fields = EntityFields::default();
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "type" => fields.kind = string_of(&map.next_value::<Value>()?),
                "id" => fields.id = map.next_value::<Value>()?.as_i64(),
                "name" => fields.name = string_of(&map.next_value::<Value>()?),
                "side" => fields.side = string_of(&map.next_value::<Value>()?),
                "isPlayer" => fields.is_player = map.next_value::<Value>()?.as_i64(),
                "positions" => {
                    if let Some(name) = map.next_value_seed(PositionsSeed)? {
                        fields.name_override = Some(name);
                    }
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(fields)
    }
}

/// Walks the position history and yields the last non-empty name override.
struct PositionsSeed;

impl<'de> DeserializeSeed<'de> for PositionsSeed {
    type Value = Option<String>;

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Option<String>, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for PositionsSeed {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of position snapshots")
    }

    ignore_scalars!(None);

    fn visit_map<M: MapAccess<'de>>(
        self,
        mut map: M,
    ) -> std::result::Result<Option<String>, M::Error> {
        drain_map(&mut map)?;
        Ok(None)
    }

    fn visit_seq<S: SeqAccess<'de>>(
        self,
        mut seq: S,
    ) -> std::result::Result<Option<String>, S::Error> {
        let mut latest = None;
        while let Some(name) = seq.next_element_seed(SnapshotSeed)? {
            if name.is_some() {
                latest = name;
            }
        }
        Ok(latest)
    }
}

/// One position snapshot; only the name slot is decoded.
struct SnapshotSeed;

impl<'de> DeserializeSeed<'de> for SnapshotSeed {
    type Value = Option<String>;

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Option<String>, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for SnapshotSeed {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a position snapshot tuple")
    }

    ignore_scalars!(None);

    fn visit_map<M: MapAccess<'de>>(
        self,
        mut map: M,
    ) -> std::result::Result<Option<String>, M::Error> {
        drain_map(&mut map)?;
        Ok(None)
    }

    fn visit_seq<S: SeqAccess<'de>>(
        self,
        mut seq: S,
    ) -> std::result::Result<Option<String>, S::Error> {
        for _ in 0..NAME_SLOT {
            if seq.next_element::<IgnoredAny>()?.is_none() {
                return Ok(None);
            }
        }
        let name = seq.next_element::<Value>()?.and_then(non_empty_name);
        drain_seq(&mut seq)?;
        Ok(name)
    }
}

struct EventsSeed<'a, A: ?Sized> {
    analyzer: &'a mut A,
}

impl<'de, A: Analyzer + ?Sized> DeserializeSeed<'de> for EventsSeed<'_, A> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, A: Analyzer + ?Sized> Visitor<'de> for EventsSeed<'_, A> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of events")
    }

    fn visit_seq<S: SeqAccess<'de>>(self, mut seq: S) -> std::result::Result<(), S::Error> {
        while let Some(event) = seq.next_element::<Value>()? {
            emit_event(&event, &mut *self.analyzer);
        }
        Ok(())
    }
}
