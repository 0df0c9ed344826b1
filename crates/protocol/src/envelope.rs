//! Message envelope model.
//!
//! An [`Envelope`] is the only thing that flows between stages. It carries the
//! idempotency identity, the completion mask, and a log of per-stage payloads.
//!
//! In memory the payloads are an ordered log of [`StageRecord`]s. On the wire
//! every record is flattened to a top-level field named after its stage, so a
//! stage-2 envelope looks like:
//!
//! ```json
//! {
//!   "idempotencyId": "abc",
//!   "completedStages": 1,
//!   "step1": { "someData": "x" },
//!   "step2": { "someData": "Step 2 data" }
//! }
//! ```
//!
//! Top-level fields the pipeline does not model are kept in
//! [`Envelope::extensions`] and written back unchanged.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::mask::CompletionMask;
use crate::stage::StageId;
use crate::validation::parse_mask;

/// Wire name of the idempotency field.
pub const IDEMPOTENCY_ID_KEY: &str = "idempotencyId";

/// Wire name of the completion mask field.
pub const COMPLETED_STAGES_KEY: &str = "completedStages";

/// Wire name of the data field inside a stage payload.
pub const SOME_DATA_KEY: &str = "someData";

/// Payload produced by one stage for the next.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StagePayload {
    #[serde(rename = "someData")]
    pub some_data: String,

    /// Additional payload fields set by a producer, kept as received.
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl StagePayload {
    pub fn new(some_data: impl Into<String>) -> Self {
        Self {
            some_data: some_data.into(),
            extra: Map::new(),
        }
    }
}

/// One entry in the envelope's stage log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    /// Stage this payload is addressed to.
    pub stage: StageId,
    pub payload: StagePayload,
}

/// The message flowing through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Stable identity of the logical unit of work. Never changes once assigned.
    pub idempotency_id: String,

    /// Stages this envelope has completed.
    pub completed_stages: CompletionMask,

    /// Stage payloads in pipeline order, at most one per stage.
    records: Vec<StageRecord>,

    /// Unmodelled top-level fields, carried forward verbatim.
    pub extensions: Map<String, Value>,
}

impl Envelope {
    /// Create a fresh envelope for the entry stage.
    ///
    /// This is what an external producer submits to the first queue: an empty
    /// completion mask and exactly one `step1` payload.
    pub fn new(idempotency_id: impl Into<String>, payload: StagePayload) -> Self {
        Self {
            idempotency_id: idempotency_id.into(),
            completed_stages: CompletionMask::empty(),
            records: vec![StageRecord {
                stage: StageId::Step1,
                payload,
            }],
            extensions: Map::new(),
        }
    }

    pub(crate) fn from_parts(
        idempotency_id: String,
        completed_stages: CompletionMask,
        records: Vec<StageRecord>,
        extensions: Map<String, Value>,
    ) -> Self {
        let mut envelope = Self {
            idempotency_id,
            completed_stages,
            records: Vec::with_capacity(records.len()),
            extensions,
        };
        for record in records {
            envelope.insert_record(record);
        }
        envelope
    }

    /// Payload addressed to `stage`, if present.
    pub fn payload(&self, stage: StageId) -> Option<&StagePayload> {
        self.records
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.payload)
    }

    pub fn has_stage(&self, stage: StageId) -> bool {
        self.payload(stage).is_some()
    }

    /// The stage log, in pipeline order.
    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Stages for which a payload is present, in pipeline order.
    pub fn stages_with_payload(&self) -> impl Iterator<Item = StageId> + '_ {
        self.records.iter().map(|r| r.stage)
    }

    /// Returns a copy of this envelope with `payload` recorded for `stage`.
    ///
    /// Existing records for other stages are untouched. A record for the
    /// same stage is replaced, which keeps redelivered messages from growing
    /// duplicate entries.
    pub fn with_record(&self, stage: StageId, payload: StagePayload) -> Self {
        let mut next = self.clone();
        next.insert_record(StageRecord { stage, payload });
        // The typed record now owns this key.
        next.extensions.remove(stage.payload_key());
        next
    }

    fn insert_record(&mut self, record: StageRecord) {
        match self.records.binary_search_by_key(&record.stage, |r| r.stage) {
            Ok(pos) => self.records[pos] = record,
            Err(pos) => self.records.insert(pos, record),
        }
    }

    /// Convert to the JSON wire shape.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Parse from the JSON wire shape without stage-specific validation.
    ///
    /// Handlers should use [`crate::validation::validate`] instead, which
    /// reports precisely which check failed.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Split the stage payload fields out of a raw object.
///
/// Keys that name a stage and hold a well-formed payload become records.
/// Everything else, including a stage key whose value is malformed, stays in
/// the returned map so it can be carried forward as-is.
pub(crate) fn split_records(mut fields: Map<String, Value>) -> (Vec<StageRecord>, Map<String, Value>) {
    let mut records = Vec::new();
    for stage in StageId::ALL {
        let Some(value) = fields.get(stage.payload_key()) else {
            continue;
        };
        if let Ok(payload) = StagePayload::deserialize(value) {
            fields.remove(stage.payload_key());
            records.push(StageRecord { stage, payload });
        }
    }
    (records, fields)
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2 + self.records.len() + self.extensions.len()))?;
        map.serialize_entry(IDEMPOTENCY_ID_KEY, &self.idempotency_id)?;
        map.serialize_entry(COMPLETED_STAGES_KEY, &self.completed_stages)?;
        for record in &self.records {
            map.serialize_entry(record.stage.payload_key(), &record.payload)?;
        }
        for (key, value) in &self.extensions {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    /// Lenient structural parse: requires a string `idempotencyId`, treats an
    /// absent or null `completedStages` as zero.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;

        let idempotency_id = match fields.remove(IDEMPOTENCY_ID_KEY) {
            Some(Value::String(id)) => id,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "{IDEMPOTENCY_ID_KEY} must be a string, got {other}"
                )))
            }
            None => return Err(D::Error::missing_field(IDEMPOTENCY_ID_KEY)),
        };

        let completed_stages = match fields.remove(COMPLETED_STAGES_KEY) {
            None | Some(Value::Null) => CompletionMask::empty(),
            Some(value) => parse_mask(&value).map_err(D::Error::custom)?,
        };

        let (records, extensions) = split_records(fields);

        Ok(Envelope::from_parts(
            idempotency_id,
            completed_stages,
            records,
            extensions,
        ))
    }
}
