use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, StoreError},
    types::JobData,
};

/// Version written for every new job/trigger data map.
pub const PAYLOAD_VERSION: u64 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u64,
    data: &'a JobData,
}

#[derive(Deserialize)]
struct Envelope {
    v: u64,
    #[serde(default)]
    data: Value,
}

/// Encode a data map as `{"v":1,"data":{...}}`.
pub fn encode(data: &JobData) -> Result<String> {
    Ok(serde_json::to_string(&EnvelopeRef {
        v: PAYLOAD_VERSION,
        data,
    })?)
}

pub fn decode(raw: &str) -> Result<JobData> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    if envelope.v != PAYLOAD_VERSION {
        return Err(StoreError::UnsupportedPayloadVersion(envelope.v));
    }
    if envelope.data.is_null() {
        return Ok(JobData::new());
    }
    Ok(serde_json::from_value(envelope.data)?)
}
