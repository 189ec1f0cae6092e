//! Wire types for the `/emails` endpoint and the job payload they produce
use super::job::JobArgs;
use super::validation::{Checker, Validate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Absent fields decode to their empty value and are rejected by validation,
// so a missing field is reported as an invalid parameter rather than a parse
// failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailCreateRequest {
    pub account_id: Uuid, // would come from an auth token outside of a demo
    pub body: String,
    pub email_recipient: String,
    pub email_sender: String,
    pub idempotency_key: Uuid, // conventionally the `Idempotency-Key` header
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailCreateResponse {
    pub message: String,
}

impl EmailCreateResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Validate for EmailCreateRequest {
    fn validate(&self, check: &mut Checker<'_>) {
        check
            .required_uuid("account_id", &self.account_id)
            .required_str("body", &self.body)
            .required_str("email_recipient", &self.email_recipient)
            .email("email_recipient", &self.email_recipient)
            .required_str("email_sender", &self.email_sender)
            .email("email_sender", &self.email_sender)
            .required_uuid("idempotency_key", &self.idempotency_key)
            .required_str("subject", &self.subject);
    }
}

impl Validate for EmailCreateResponse {
    fn validate(&self, check: &mut Checker<'_>) {
        check.required_str("message", &self.message);
    }
}

/// Payload of a `send_email` job: exactly what the caller submitted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SendEmailArgs {
    #[n(0)]
    #[cbor(with = "cbor_uuid")]
    pub account_id: Uuid,
    #[n(1)]
    pub body: String,
    #[n(2)]
    pub email_recipient: String,
    #[n(3)]
    pub email_sender: String,
    #[n(4)]
    #[cbor(with = "cbor_uuid")]
    pub idempotency_key: Uuid,
    #[n(5)]
    pub subject: String,
}

impl SendEmailArgs {
    /// Compares the fields that describe the email itself. The account and
    /// idempotency key form the job's identity and are left out.
    pub fn same_payload(&self, other: &SendEmailArgs) -> bool {
        self.body == other.body
            && self.email_recipient == other.email_recipient
            && self.email_sender == other.email_sender
            && self.subject == other.subject
    }
}

impl JobArgs for SendEmailArgs {
    const KIND: &'static str = "send_email";

    fn unique_key(&self) -> Vec<u8> {
        [&self.account_id.as_bytes()[..], &self.idempotency_key.as_bytes()[..]].concat()
    }
}

impl From<&EmailCreateRequest> for SendEmailArgs {
    fn from(req: &EmailCreateRequest) -> Self {
        Self {
            account_id: req.account_id,
            body: req.body.clone(),
            email_recipient: req.email_recipient.clone(),
            email_sender: req.email_sender.clone(),
            idempotency_key: req.idempotency_key,
            subject: req.subject.clone(),
        }
    }
}

mod cbor_uuid {
    use uuid::Uuid;

    pub fn encode<C, W: minicbor::encode::Write>(
        v: &Uuid,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(v.as_bytes())?.ok()
    }

    pub fn decode<'b, C>(
        d: &mut minicbor::Decoder<'b>,
        _: &mut C,
    ) -> Result<Uuid, minicbor::decode::Error> {
        Uuid::from_slice(d.bytes()?)
            .map_err(|_| minicbor::decode::Error::message("uuid must be 16 bytes"))
    }
}
