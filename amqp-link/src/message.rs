//! Wire-level message model shared by the link state machines
//!
//! These types mirror the sections of an AMQP 1.0 message the protocol agents
//! actually touch: the body, the properties section, application properties,
//! and message annotations. Encoding to the wire is the AMQP client's job.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of an AMQP node (e.g. `/devices/<id>/twin/` or `$cbs`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkAddress(String);

impl LinkAddress {
    /// Create a link address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for LinkAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Scalar AMQP value used in properties and annotations
///
/// `Null` is a distinct value, not an absent entry; the twin protocol relies
/// on that distinction for the `version` annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmqpValue {
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Long(i64),
    /// Double-precision float
    Double(f64),
    /// UTF-8 string
    String(String),
}

impl AmqpValue {
    /// Whether this value is the explicit null
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for AmqpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{}", value),
            Self::Long(value) => write!(f, "{}", value),
            Self::Double(value) => write!(f, "{}", value),
            Self::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for AmqpValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AmqpValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for AmqpValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AmqpValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Sender-side delivery settlement discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderSettleMode {
    /// Deliveries are sent unsettled and await a disposition
    Unsettled,
    /// Deliveries are settled at send time (fire-and-forget at the link layer)
    Settled,
}

/// Receiver-side delivery settlement discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverSettleMode {
    /// The library settles deliveries as they arrive
    AutoSettle,
    /// The application settles each delivery explicitly
    Explicit,
}

/// Attach-time options carried verbatim to the AMQP client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkOptions {
    /// Per-link attach properties (e.g. `com.microsoft:channel-correlation-id`)
    pub properties: BTreeMap<String, AmqpValue>,
    /// Sender settle mode, when the default is not wanted
    pub sender_settle_mode: Option<SenderSettleMode>,
    /// Receiver settle mode, when the default is not wanted
    pub receiver_settle_mode: Option<ReceiverSettleMode>,
}

impl LinkOptions {
    /// Create an empty options bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attach property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<AmqpValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the sender settle mode
    pub fn with_sender_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.sender_settle_mode = Some(mode);
        self
    }

    /// Set the receiver settle mode
    pub fn with_receiver_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.receiver_settle_mode = Some(mode);
        self
    }
}

/// Message body payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// No body section
    #[default]
    Empty,
    /// Binary payload
    Data(Vec<u8>),
    /// Text payload
    Text(String),
}

impl MessageBody {
    /// Whether the body carries no payload
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Data(data) => data.is_empty(),
            Self::Text(text) => text.is_empty(),
        }
    }

    /// The body as text, when it is a text payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// The fixed AMQP properties section
///
/// `custom` holds caller-supplied keys that ride along in the properties
/// section next to the named fields; the twin protocol maps request
/// properties there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Message identifier, used as the request correlation key by CBS
    pub message_id: Option<String>,
    /// Correlation identifier of a response or twin request
    pub correlation_id: Option<String>,
    /// Destination node
    pub to: Option<String>,
    /// Reply node for request/response exchanges
    pub reply_to: Option<String>,
    /// Additional caller-supplied properties
    pub custom: BTreeMap<String, AmqpValue>,
}

/// An AMQP message as handed to or received from the client library
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmqpMessage {
    /// Body payload
    pub body: MessageBody,
    /// Properties section
    pub properties: MessageProperties,
    /// Application properties (user key/value pairs)
    pub application_properties: BTreeMap<String, AmqpValue>,
    /// Message annotations (service routing: `operation`, `resource`, ...)
    pub message_annotations: BTreeMap<String, AmqpValue>,
}

impl AmqpMessage {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a text body
    pub fn with_text_body(mut self, body: impl Into<String>) -> Self {
        self.body = MessageBody::Text(body.into());
        self
    }

    /// Set a binary body
    pub fn with_data_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = MessageBody::Data(body.into());
        self
    }

    /// Set the message id
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the destination node
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.properties.to = Some(to.into());
        self
    }

    /// Set the reply node
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Add an application property
    pub fn with_application_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<AmqpValue>,
    ) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Add a message annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<AmqpValue>) -> Self {
        self.message_annotations.insert(key.into(), value.into());
        self
    }
}

/// An inbound message plus the delivery context needed for dispositions
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpDelivery {
    /// Opaque delivery tag assigned by the AMQP client
    pub delivery_tag: u64,
    /// The received message
    pub message: AmqpMessage,
}

/// Terminal outcome of a message operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The peer accepted the delivery
    Enqueued,
    /// The delivery was accepted locally
    Completed,
    /// The delivery was rejected
    Rejected,
    /// The delivery was released back to the peer
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_sections() {
        let message = AmqpMessage::new()
            .with_text_body("token")
            .with_message_id("m-1")
            .with_to("$cbs")
            .with_reply_to("cbs")
            .with_application_property("operation", "put-token")
            .with_annotation("resource", "/properties/reported");

        assert_eq!(message.body.as_text(), Some("token"));
        assert_eq!(message.properties.message_id.as_deref(), Some("m-1"));
        assert_eq!(message.properties.to.as_deref(), Some("$cbs"));
        assert_eq!(message.properties.reply_to.as_deref(), Some("cbs"));
        assert_eq!(
            message.application_properties.get("operation"),
            Some(&AmqpValue::String("put-token".to_string()))
        );
        assert_eq!(
            message.message_annotations.get("resource"),
            Some(&AmqpValue::String("/properties/reported".to_string()))
        );
    }

    #[test]
    fn value_display_stringifies_scalars() {
        assert_eq!(AmqpValue::from("7").to_string(), "7");
        assert_eq!(AmqpValue::from(7i64).to_string(), "7");
        assert_eq!(AmqpValue::from(true).to_string(), "true");
        assert_eq!(AmqpValue::Null.to_string(), "null");
    }

    #[test]
    fn empty_body_detection() {
        assert!(MessageBody::Empty.is_empty());
        assert!(MessageBody::Text(String::new()).is_empty());
        assert!(!MessageBody::Text(" ".to_string()).is_empty());
        assert!(!MessageBody::Data(vec![0x7b]).is_empty());
    }

    #[test]
    fn link_options_round_trip() {
        let options = LinkOptions::new()
            .with_property("com.microsoft:api-version", "2018-06-30")
            .with_sender_settle_mode(SenderSettleMode::Settled)
            .with_receiver_settle_mode(ReceiverSettleMode::AutoSettle);

        assert_eq!(
            options.properties.get("com.microsoft:api-version"),
            Some(&AmqpValue::String("2018-06-30".to_string()))
        );
        assert_eq!(options.sender_settle_mode, Some(SenderSettleMode::Settled));
        assert_eq!(
            options.receiver_settle_mode,
            Some(ReceiverSettleMode::AutoSettle)
        );
    }
}
