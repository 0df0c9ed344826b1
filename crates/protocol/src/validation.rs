//! Stage validation at the queue boundary.
//!
//! Messages arrive from the transport as untyped JSON. [`validate`] is the one
//! place that turns such a value into a [`StageMessage`], the typed proof that
//! the value is a well-formed message for a given stage. Checks run in a fixed
//! order and the first failure is reported.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::envelope::{
    split_records, Envelope, StagePayload, COMPLETED_STAGES_KEY, IDEMPOTENCY_ID_KEY, SOME_DATA_KEY,
};
use crate::mask::CompletionMask;
use crate::stage::StageId;

/// The specific check that rejected a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// The value is not a JSON object (includes `null`).
    NotAnObject,
    MissingIdempotencyId,
    IdempotencyIdNotString,
    /// `completedStages` is absent or null on a non-entry stage.
    MissingCompletedStages,
    /// `completedStages` is present but not a non-negative integer.
    CompletedStagesNotInteger,
    /// `completedStages` does not fit the mask width.
    CompletedStagesOutOfRange(u64),
    /// The stage's own payload key is absent.
    MissingPayload,
    /// The payload is present but not an object.
    PayloadNotObject,
    /// The payload's `someData` is absent or not a string.
    PayloadDataNotString,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::NotAnObject => f.write_str("message is not an object"),
            ValidationFailure::MissingIdempotencyId => {
                write!(f, "`{IDEMPOTENCY_ID_KEY}` is missing")
            }
            ValidationFailure::IdempotencyIdNotString => {
                write!(f, "`{IDEMPOTENCY_ID_KEY}` is not a string")
            }
            ValidationFailure::MissingCompletedStages => {
                write!(f, "`{COMPLETED_STAGES_KEY}` is missing")
            }
            ValidationFailure::CompletedStagesNotInteger => {
                write!(f, "`{COMPLETED_STAGES_KEY}` is not a non-negative integer")
            }
            ValidationFailure::CompletedStagesOutOfRange(bits) => {
                write!(f, "`{COMPLETED_STAGES_KEY}` value {bits} is out of range")
            }
            ValidationFailure::MissingPayload => f.write_str("stage payload is missing"),
            ValidationFailure::PayloadNotObject => f.write_str("stage payload is not an object"),
            ValidationFailure::PayloadDataNotString => {
                write!(f, "stage payload `{SOME_DATA_KEY}` is not a string")
            }
        }
    }
}

/// A message failed validation for the stage that received it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid message format: expected {} ({failure})", expected.message_type())]
pub struct ValidationError {
    pub expected: StageId,
    pub failure: ValidationFailure,
}

impl ValidationError {
    fn new(expected: StageId, failure: ValidationFailure) -> Self {
        Self { expected, failure }
    }
}

/// An envelope proven to be a well-formed message for [`StageMessage::stage`].
///
/// Only [`validate`] constructs this type, so holding one guarantees the
/// stage payload is present.
#[derive(Debug, Clone, PartialEq)]
pub struct StageMessage {
    stage: StageId,
    payload: StagePayload,
    envelope: Envelope,
}

impl StageMessage {
    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn idempotency_id(&self) -> &str {
        &self.envelope.idempotency_id
    }

    pub fn completed_stages(&self) -> CompletionMask {
        self.envelope.completed_stages
    }

    /// The payload addressed to this stage.
    pub fn payload(&self) -> &StagePayload {
        &self.payload
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

/// Validate an untyped message against the contract of `expected`.
///
/// Checks, in order:
/// 1. the value is an object;
/// 2. `idempotencyId` is present and a string;
/// 3. `completedStages` is a non-negative integer (absent or null is read as
///    zero on the entry stage only);
/// 4. the stage's payload key is present;
/// 5. the payload is an object;
/// 6. the payload's `someData` is a string.
pub fn validate(raw: &Value, expected: StageId) -> Result<StageMessage, ValidationError> {
    let fail = |failure| ValidationError::new(expected, failure);

    let Value::Object(object) = raw else {
        return Err(fail(ValidationFailure::NotAnObject));
    };

    let idempotency_id = match object.get(IDEMPOTENCY_ID_KEY) {
        None => return Err(fail(ValidationFailure::MissingIdempotencyId)),
        Some(Value::String(id)) => id.clone(),
        Some(_) => return Err(fail(ValidationFailure::IdempotencyIdNotString)),
    };

    let completed_stages = match object.get(COMPLETED_STAGES_KEY) {
        None | Some(Value::Null) if expected.is_entry() => CompletionMask::empty(),
        None | Some(Value::Null) => return Err(fail(ValidationFailure::MissingCompletedStages)),
        Some(value) => parse_mask(value).map_err(fail)?,
    };

    let payload = match object.get(expected.payload_key()) {
        None => return Err(fail(ValidationFailure::MissingPayload)),
        Some(Value::Object(payload)) => payload,
        Some(_) => return Err(fail(ValidationFailure::PayloadNotObject)),
    };

    if !matches!(payload.get(SOME_DATA_KEY), Some(Value::String(_))) {
        return Err(fail(ValidationFailure::PayloadDataNotString));
    }

    let mut fields: Map<String, Value> = object.clone();
    fields.remove(IDEMPOTENCY_ID_KEY);
    fields.remove(COMPLETED_STAGES_KEY);
    let (records, extensions) = split_records(fields);

    let envelope = Envelope::from_parts(idempotency_id, completed_stages, records, extensions);

    // The checks above are exactly what StagePayload needs to deserialize.
    let payload = envelope
        .payload(expected)
        .cloned()
        .ok_or_else(|| fail(ValidationFailure::PayloadDataNotString))?;

    Ok(StageMessage {
        stage: expected,
        payload,
        envelope,
    })
}

/// Boolean form of [`validate`].
pub fn is_stage_message(raw: &Value, expected: StageId) -> bool {
    validate(raw, expected).is_ok()
}

/// Read `completedStages` as a mask.
///
/// Any JSON number with a whole, non-negative value is accepted, so `1.0`
/// reads the same as `1`. Negative values are rejected since no bit pattern
/// corresponds to them.
pub(crate) fn parse_mask(value: &Value) -> Result<CompletionMask, ValidationFailure> {
    let bits = match value.as_u64() {
        Some(bits) => bits,
        None => match value.as_f64() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 => {
                if n > u32::MAX as f64 {
                    // Saturates for values beyond u64.
                    return Err(ValidationFailure::CompletedStagesOutOfRange(n as u64));
                }
                n as u64
            }
            _ => return Err(ValidationFailure::CompletedStagesNotInteger),
        },
    };
    u32::try_from(bits)
        .map(CompletionMask::from_bits)
        .map_err(|_| ValidationFailure::CompletedStagesOutOfRange(bits))
}
