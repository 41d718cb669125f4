//! Message format (AMQP 1.0 Part 3.2)
//!
//! A bare message is encoded as a sequence of described sections. Sections are
//! written one after another and read back until the payload is exhausted.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{
    de::{self, VariantAccess},
    Serialize,
};
use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Binary, Symbol, Timestamp},
    ser::Serializer,
    value::Value,
};

use super::definitions::Milliseconds;

/// Annotations carried by the delivery-annotations, message-annotations and footer sections
pub type Annotations = BTreeMap<Symbol, Value>;

/// <descriptor name="amqp:header:list" code="0x00000000:0x00000070"/>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:header:list",
    code = "0x0000_0000:0x0000_0070",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Header {
    #[amqp_contract(default)]
    pub durable: bool,

    /// Absent means 4
    pub priority: Option<u8>,

    pub ttl: Option<Milliseconds>,

    #[amqp_contract(default)]
    pub first_acquirer: bool,

    #[amqp_contract(default)]
    pub delivery_count: u32,
}

/// <descriptor name="amqp:delivery-annotations:map" code="0x00000000:0x00000071"/>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:delivery-annotations:map",
    code = "0x0000_0000:0x0000_0071",
    encoding = "basic"
)]
pub struct DeliveryAnnotations(pub Annotations);

/// <descriptor name="amqp:message-annotations:map" code="0x00000000:0x00000072"/>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:message-annotations:map",
    code = "0x0000_0000:0x0000_0072",
    encoding = "basic"
)]
pub struct MessageAnnotations(pub Annotations);

/// Immutable properties of the bare message.
/// <descriptor name="amqp:properties:list" code="0x00000000:0x00000073"/>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:properties:list",
    code = "0x0000_0000:0x0000_0073",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Properties {
    /// One of ulong, uuid, binary or string
    pub message_id: Option<Value>,
    pub user_id: Option<Binary>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<Value>,
    pub content_type: Option<Symbol>,
    pub content_encoding: Option<Symbol>,
    pub absolute_expiry_time: Option<Timestamp>,
    pub creation_time: Option<Timestamp>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

/// <descriptor name="amqp:application-properties:map" code="0x00000000:0x00000074"/>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:application-properties:map",
    code = "0x0000_0000:0x0000_0074",
    encoding = "basic"
)]
pub struct ApplicationProperties(pub BTreeMap<String, Value>);

/// <descriptor name="amqp:data:binary" code="0x00000000:0x00000075"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:data:binary",
    code = "0x0000_0000:0x0000_0075",
    encoding = "basic"
)]
pub struct Data(pub Binary);

/// <descriptor name="amqp:amqp-sequence:list" code="0x00000000:0x00000076"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:amqp-sequence:list",
    code = "0x0000_0000:0x0000_0076",
    encoding = "basic"
)]
pub struct AmqpSequence(pub Vec<Value>);

/// <descriptor name="amqp:amqp-value:*" code="0x00000000:0x00000077"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:amqp-value:*",
    code = "0x0000_0000:0x0000_0077",
    encoding = "basic"
)]
pub struct AmqpValue(pub Value);

/// <descriptor name="amqp:footer:map" code="0x00000000:0x00000078"/>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:footer:map",
    code = "0x0000_0000:0x0000_0078",
    encoding = "basic"
)]
pub struct Footer(pub Annotations);

/// The application data of a message
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// One or more data sections
    Data(Vec<Binary>),

    /// One or more amqp-sequence sections
    Sequence(Vec<Vec<Value>>),

    /// A single amqp-value section
    Value(Value),

    /// No body section at all
    #[default]
    Empty,
}

/// An AMQP message, owned and immutable once handed to a link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Option<Header>,
    pub delivery_annotations: Option<DeliveryAnnotations>,
    pub message_annotations: Option<MessageAnnotations>,
    pub properties: Option<Properties>,
    pub application_properties: Option<ApplicationProperties>,
    pub body: Body,
    pub footer: Option<Footer>,
}

impl Message {
    /// Creates a message whose body is a single amqp-value section
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            body: Body::Value(value.into()),
            ..Default::default()
        }
    }

    /// Creates a message whose body is a single data section
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Body::Data(vec![Binary::from(data.into())]),
            ..Default::default()
        }
    }

    /// Sets the message id
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.properties.get_or_insert_with(Default::default).message_id = Some(id.into());
        self
    }

    /// Sets the subject
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.properties.get_or_insert_with(Default::default).subject = Some(subject.into());
        self
    }

    /// Inserts an application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties
            .get_or_insert_with(Default::default)
            .0
            .insert(key.into(), value.into());
        self
    }

    /// Marks the message durable
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.header.get_or_insert_with(Default::default).durable = durable;
        self
    }

    /// The message id, if set
    pub fn id(&self) -> Option<&Value> {
        self.properties.as_ref()?.message_id.as_ref()
    }

    /// The subject, if set
    pub fn subject(&self) -> Option<&str> {
        self.properties.as_ref()?.subject.as_deref()
    }

    /// Looks up an application property
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.application_properties.as_ref()?.0.get(key)
    }

    /// The body as a string, when it is an amqp-value holding a string
    pub fn body_str(&self) -> Option<&str> {
        match &self.body {
            Body::Value(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Encodes the message into a transfer payload
    pub fn encode(&self) -> Result<Bytes, serde_amqp::Error> {
        let mut buf = BytesMut::new();
        let mut serializer = Serializer::from((&mut buf).writer());

        if let Some(header) = &self.header {
            header.serialize(&mut serializer)?;
        }
        if let Some(annotations) = &self.delivery_annotations {
            annotations.serialize(&mut serializer)?;
        }
        if let Some(annotations) = &self.message_annotations {
            annotations.serialize(&mut serializer)?;
        }
        if let Some(properties) = &self.properties {
            properties.serialize(&mut serializer)?;
        }
        if let Some(properties) = &self.application_properties {
            properties.serialize(&mut serializer)?;
        }
        match &self.body {
            Body::Data(batch) => {
                for data in batch {
                    Data(data.clone()).serialize(&mut serializer)?;
                }
            }
            Body::Sequence(batch) => {
                for sequence in batch {
                    AmqpSequence(sequence.clone()).serialize(&mut serializer)?;
                }
            }
            Body::Value(value) => AmqpValue(value.clone()).serialize(&mut serializer)?,
            Body::Empty => {}
        }
        if let Some(footer) = &self.footer {
            footer.serialize(&mut serializer)?;
        }

        Ok(buf.freeze())
    }

    /// Decodes a message from a complete transfer payload
    pub fn decode(payload: &[u8]) -> Result<Self, serde_amqp::Error> {
        let mut message = Message::default();
        let mut reader = payload;

        while !reader.is_empty() {
            let section: Section = serde_amqp::from_reader(&mut reader)?;
            match section {
                Section::Header(value) => message.header = Some(value),
                Section::DeliveryAnnotations(value) => message.delivery_annotations = Some(value),
                Section::MessageAnnotations(value) => message.message_annotations = Some(value),
                Section::Properties(value) => message.properties = Some(value),
                Section::ApplicationProperties(value) => {
                    message.application_properties = Some(value)
                }
                Section::Data(Data(data)) => match &mut message.body {
                    Body::Data(batch) => batch.push(data),
                    body => *body = Body::Data(vec![data]),
                },
                Section::AmqpSequence(AmqpSequence(sequence)) => match &mut message.body {
                    Body::Sequence(batch) => batch.push(sequence),
                    body => *body = Body::Sequence(vec![sequence]),
                },
                Section::AmqpValue(AmqpValue(value)) => message.body = Body::Value(value),
                Section::Footer(value) => message.footer = Some(value),
            }
        }

        Ok(message)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::new(Value::String(value.to_string()))
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::new(Value::String(value))
    }
}

/// Any one message section, used only while decoding
enum Section {
    Header(Header),
    DeliveryAnnotations(DeliveryAnnotations),
    MessageAnnotations(MessageAnnotations),
    Properties(Properties),
    ApplicationProperties(ApplicationProperties),
    Data(Data),
    AmqpSequence(AmqpSequence),
    AmqpValue(AmqpValue),
    Footer(Footer),
}

enum Field {
    Header,
    DeliveryAnnotations,
    MessageAnnotations,
    Properties,
    ApplicationProperties,
    Data,
    AmqpSequence,
    AmqpValue,
    Footer,
}

struct FieldVisitor {}

impl<'de> de::Visitor<'de> for FieldVisitor {
    type Value = Field;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("message section identifier")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let val = match v {
            "amqp:header:list" => Field::Header,
            "amqp:delivery-annotations:map" => Field::DeliveryAnnotations,
            "amqp:message-annotations:map" => Field::MessageAnnotations,
            "amqp:properties:list" => Field::Properties,
            "amqp:application-properties:map" => Field::ApplicationProperties,
            "amqp:data:binary" => Field::Data,
            "amqp:amqp-sequence:list" => Field::AmqpSequence,
            "amqp:amqp-value:*" => Field::AmqpValue,
            "amqp:footer:map" => Field::Footer,
            _ => return Err(de::Error::custom("Wrong symbol value for section descriptor")),
        };
        Ok(val)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let val = match v {
            0x0000_0000_0000_0070 => Field::Header,
            0x0000_0000_0000_0071 => Field::DeliveryAnnotations,
            0x0000_0000_0000_0072 => Field::MessageAnnotations,
            0x0000_0000_0000_0073 => Field::Properties,
            0x0000_0000_0000_0074 => Field::ApplicationProperties,
            0x0000_0000_0000_0075 => Field::Data,
            0x0000_0000_0000_0076 => Field::AmqpSequence,
            0x0000_0000_0000_0077 => Field::AmqpValue,
            0x0000_0000_0000_0078 => Field::Footer,
            _ => {
                return Err(de::Error::custom(format!(
                    "Wrong code value for section descriptor, found {:#x?}",
                    v
                )))
            }
        };
        Ok(val)
    }
}

impl<'de> de::Deserialize<'de> for Field {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_identifier(FieldVisitor {})
    }
}

struct Visitor {}

impl<'de> de::Visitor<'de> for Visitor {
    type Value = Section;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("enum Section")
    }

    fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
    where
        A: de::EnumAccess<'de>,
    {
        let (val, variant) = data.variant()?;

        match val {
            Field::Header => variant.newtype_variant().map(Section::Header),
            Field::DeliveryAnnotations => {
                variant.newtype_variant().map(Section::DeliveryAnnotations)
            }
            Field::MessageAnnotations => variant.newtype_variant().map(Section::MessageAnnotations),
            Field::Properties => variant.newtype_variant().map(Section::Properties),
            Field::ApplicationProperties => {
                variant.newtype_variant().map(Section::ApplicationProperties)
            }
            Field::Data => variant.newtype_variant().map(Section::Data),
            Field::AmqpSequence => variant.newtype_variant().map(Section::AmqpSequence),
            Field::AmqpValue => variant.newtype_variant().map(Section::AmqpValue),
            Field::Footer => variant.newtype_variant().map(Section::Footer),
        }
    }
}

impl<'de> de::Deserialize<'de> for Section {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        const VARIANTS: &[&str] = &[
            "amqp:header:list",
            "amqp:delivery-annotations:map",
            "amqp:message-annotations:map",
            "amqp:properties:list",
            "amqp:application-properties:map",
            "amqp:data:binary",
            "amqp:amqp-sequence:list",
            "amqp:amqp-value:*",
            "amqp:footer:map",
        ];
        deserializer.deserialize_enum("Section", VARIANTS, Visitor {})
    }
}
