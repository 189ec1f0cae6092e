//! Units of work and their lifecycle
use super::error::StoreError;
use chrono::{DateTime, Utc};
use uuid7::{Uuid, uuid7};

/// Payload of a unit of work.
///
/// Two payloads with the same `unique_key` are the same logical intent; the
/// store admits at most one job per kind and key.
pub trait JobArgs: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> {
    const KIND: &'static str;

    fn unique_key(&self) -> Vec<u8>;

    fn encode_args(&self) -> Result<Vec<u8>, StoreError> {
        minicbor::to_vec(self).map_err(|e| StoreError::Encode(e.to_string()))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    #[n(0)]
    Pending,
    #[n(1)]
    Running,
    #[n(2)]
    Completed,
    #[n(3)]
    Failed,
}

impl JobState {
    /// The worker never touches a job again once it reaches one of these.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

// uuid7 ids sort by creation time, which keeps the jobs tree in FIFO order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid7())
    }
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(Uuid::from(bytes)))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Job {
    #[n(0)]
    pub id: JobId,
    #[n(1)]
    pub kind: String,
    #[n(2)]
    #[cbor(with = "minicbor::bytes")]
    pub unique_key: Vec<u8>,
    #[n(3)]
    #[cbor(with = "minicbor::bytes")]
    pub encoded_args: Vec<u8>,
    #[n(4)]
    pub state: JobState,
    #[n(5)]
    pub attempt: u32,
    #[n(6)]
    pub errors: Vec<String>, // one entry per failed attempt
    #[n(7)]
    pub created_at: TimeStamp,
    #[n(8)]
    pub finalized_at: Option<TimeStamp>,
}

impl Job {
    pub fn new(kind: &str, unique_key: Vec<u8>, encoded_args: Vec<u8>) -> Self {
        Self {
            id: JobId::new(),
            kind: kind.to_owned(),
            unique_key,
            encoded_args,
            state: JobState::Pending,
            attempt: 0,
            errors: vec![],
            created_at: TimeStamp::now(),
            finalized_at: None,
        }
    }

    pub fn decode_args<A: JobArgs>(&self) -> Result<A, StoreError> {
        if self.kind != A::KIND {
            return Err(StoreError::KindMismatch {
                expected: A::KIND,
                found: self.kind.clone(),
            });
        }
        Ok(minicbor::decode(&self.encoded_args)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        minicbor::to_vec(self).map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(minicbor::decode(bytes)?)
    }

    pub(crate) fn finalize(&mut self, state: JobState) {
        self.state = state;
        self.finalized_at = state.is_terminal().then(TimeStamp::now);
    }
}

impl<C> minicbor::Encode<C> for JobId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(self.0.as_bytes())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for JobId {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        JobId::from_slice(d.bytes()?)
            .ok_or_else(|| minicbor::decode::Error::message("job id must be 16 bytes"))
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
