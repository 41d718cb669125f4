//! Performatives defined in AMQP 1.0 Part 2.7

use std::collections::BTreeMap;

use serde::{
    de::{self, VariantAccess},
    ser,
};
use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Array, Symbol},
};

use super::{
    definitions::{
        DeliveryNumber, DeliveryTag, Error, Fields, Handle, Milliseconds, ReceiverSettleMode,
        Role, SenderSettleMode, SequenceNo, TransferNumber,
    },
    messaging::{DeliveryState, Source, Target},
};

/// Negotiate connection parameters.
/// <descriptor name="amqp:open:list" code="0x00000000:0x00000010"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:open:list",
    code = "0x0000_0000:0x0000_0010",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    /// Absent means `u32::MAX`
    pub max_frame_size: Option<u32>,
    /// Absent means `u16::MAX`
    pub channel_max: Option<u16>,
    pub idle_time_out: Option<Milliseconds>,
    pub outgoing_locales: Option<Array<Symbol>>,
    pub incoming_locales: Option<Array<Symbol>>,
    pub offered_capabilities: Option<Array<Symbol>>,
    pub desired_capabilities: Option<Array<Symbol>>,
    pub properties: Option<Fields>,
}

impl Open {
    /// The negotiated upper bound on frame size advertised by this open
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(u32::MAX)
    }

    /// The highest channel number advertised by this open
    pub fn channel_max(&self) -> u16 {
        self.channel_max.unwrap_or(u16::MAX)
    }
}

/// Begin a session on a channel.
/// <descriptor name="amqp:begin:list" code="0x00000000:0x00000011"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:begin:list",
    code = "0x0000_0000:0x0000_0011",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: TransferNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Option<Handle>,
    pub offered_capabilities: Option<Array<Symbol>>,
    pub desired_capabilities: Option<Array<Symbol>>,
    pub properties: Option<Fields>,
}

/// Attach a link to a session.
/// <descriptor name="amqp:attach:list" code="0x00000000:0x00000012"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:attach:list",
    code = "0x0000_0000:0x0000_0012",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Attach {
    pub name: String,
    pub handle: Handle,
    pub role: Role,
    #[amqp_contract(default)]
    pub snd_settle_mode: SenderSettleMode,
    #[amqp_contract(default)]
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Box<Source>>,
    pub target: Option<Box<Target>>,
    pub unsettled: Option<BTreeMap<DeliveryTag, Option<DeliveryState>>>,
    #[amqp_contract(default)]
    pub incomplete_unsettled: bool,
    pub initial_delivery_count: Option<SequenceNo>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Option<Array<Symbol>>,
    pub desired_capabilities: Option<Array<Symbol>>,
    pub properties: Option<Fields>,
}

/// Update link state.
/// <descriptor name="amqp:flow:list" code="0x00000000:0x00000013"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:flow:list",
    code = "0x0000_0000:0x0000_0013",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Flow {
    pub next_incoming_id: Option<TransferNumber>,
    pub incoming_window: u32,
    pub next_outgoing_id: TransferNumber,
    pub outgoing_window: u32,
    pub handle: Option<Handle>,
    pub delivery_count: Option<SequenceNo>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    #[amqp_contract(default)]
    pub drain: bool,
    #[amqp_contract(default)]
    pub echo: bool,
    pub properties: Option<Fields>,
}

/// Transfer a message.
/// <descriptor name="amqp:transfer:list" code="0x00000000:0x00000014"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:transfer:list",
    code = "0x0000_0000:0x0000_0014",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Transfer {
    pub handle: Handle,
    pub delivery_id: Option<DeliveryNumber>,
    pub delivery_tag: Option<DeliveryTag>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    #[amqp_contract(default)]
    pub more: bool,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub state: Option<DeliveryState>,
    #[amqp_contract(default)]
    pub resume: bool,
    #[amqp_contract(default)]
    pub aborted: bool,
    #[amqp_contract(default)]
    pub batchable: bool,
}

/// Inform remote peer of delivery state changes.
/// <descriptor name="amqp:disposition:list" code="0x00000000:0x00000015"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:disposition:list",
    code = "0x0000_0000:0x0000_0015",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Disposition {
    pub role: Role,
    pub first: DeliveryNumber,
    pub last: Option<DeliveryNumber>,
    #[amqp_contract(default)]
    pub settled: bool,
    pub state: Option<DeliveryState>,
    #[amqp_contract(default)]
    pub batchable: bool,
}

/// Detach the link endpoint from the session.
/// <descriptor name="amqp:detach:list" code="0x00000000:0x00000016"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:detach:list",
    code = "0x0000_0000:0x0000_0016",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Detach {
    pub handle: Handle,
    #[amqp_contract(default)]
    pub closed: bool,
    pub error: Option<Error>,
}

/// End the session.
/// <descriptor name="amqp:end:list" code="0x00000000:0x00000017"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:end:list",
    code = "0x0000_0000:0x0000_0017",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct End {
    pub error: Option<Error>,
}

/// Signal a connection close.
/// <descriptor name="amqp:close:list" code="0x00000000:0x00000018"/>
#[derive(Debug, Clone, PartialEq, DeserializeComposite, SerializeComposite)]
#[amqp_contract(
    name = "amqp:close:list",
    code = "0x0000_0000:0x0000_0018",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Close {
    pub error: Option<Error>,
}

/// Any of the nine AMQP performatives
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    /// The name of the performative, used in log and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }
}

impl ser::Serialize for Performative {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Performative::Open(value) => value.serialize(serializer),
            Performative::Begin(value) => value.serialize(serializer),
            Performative::Attach(value) => value.serialize(serializer),
            Performative::Flow(value) => value.serialize(serializer),
            Performative::Transfer(value) => value.serialize(serializer),
            Performative::Disposition(value) => value.serialize(serializer),
            Performative::Detach(value) => value.serialize(serializer),
            Performative::End(value) => value.serialize(serializer),
            Performative::Close(value) => value.serialize(serializer),
        }
    }
}

enum Field {
    Open,
    Begin,
    Attach,
    Flow,
    Transfer,
    Disposition,
    Detach,
    End,
    Close,
}

struct FieldVisitor {}

impl<'de> de::Visitor<'de> for FieldVisitor {
    type Value = Field;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("variant identifier")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let val = match v {
            "amqp:open:list" => Field::Open,
            "amqp:begin:list" => Field::Begin,
            "amqp:attach:list" => Field::Attach,
            "amqp:flow:list" => Field::Flow,
            "amqp:transfer:list" => Field::Transfer,
            "amqp:disposition:list" => Field::Disposition,
            "amqp:detach:list" => Field::Detach,
            "amqp:end:list" => Field::End,
            "amqp:close:list" => Field::Close,
            _ => return Err(de::Error::custom("Wrong symbol value for descriptor")),
        };

        Ok(val)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let val = match v {
            0x0000_0000_0000_0010 => Field::Open,
            0x0000_0000_0000_0011 => Field::Begin,
            0x0000_0000_0000_0012 => Field::Attach,
            0x0000_0000_0000_0013 => Field::Flow,
            0x0000_0000_0000_0014 => Field::Transfer,
            0x0000_0000_0000_0015 => Field::Disposition,
            0x0000_0000_0000_0016 => Field::Detach,
            0x0000_0000_0000_0017 => Field::End,
            0x0000_0000_0000_0018 => Field::Close,
            _ => {
                return Err(de::Error::custom(format!(
                    "Wrong code value for descriptor, found {:#x?}",
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
    type Value = Performative;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("enum Performative")
    }

    fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
    where
        A: de::EnumAccess<'de>,
    {
        let (val, variant) = data.variant()?;

        match val {
            Field::Open => variant.newtype_variant().map(Performative::Open),
            Field::Begin => variant.newtype_variant().map(Performative::Begin),
            Field::Attach => variant.newtype_variant().map(Performative::Attach),
            Field::Flow => variant.newtype_variant().map(Performative::Flow),
            Field::Transfer => variant.newtype_variant().map(Performative::Transfer),
            Field::Disposition => variant.newtype_variant().map(Performative::Disposition),
            Field::Detach => variant.newtype_variant().map(Performative::Detach),
            Field::End => variant.newtype_variant().map(Performative::End),
            Field::Close => variant.newtype_variant().map(Performative::Close),
        }
    }
}

impl<'de> de::Deserialize<'de> for Performative {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        const VARIANTS: &[&str] = &[
            "amqp:open:list",
            "amqp:begin:list",
            "amqp:attach:list",
            "amqp:flow:list",
            "amqp:transfer:list",
            "amqp:disposition:list",
            "amqp:detach:list",
            "amqp:end:list",
            "amqp:close:list",
        ];
        deserializer.deserialize_enum("Performative", VARIANTS, Visitor {})
    }
}
