//! Terminus and delivery state types (AMQP 1.0 Part 3.4 and 3.5)

use std::collections::BTreeMap;

use serde::{
    de::{self, VariantAccess},
    ser,
};
use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Array, Symbol},
    value::Value,
};

use super::definitions::{Error, Fields, SequenceNo};

/// A set of named filters attached to a source
pub type FilterSet = BTreeMap<Symbol, Value>;

/// The descriptor name of the JMS style selector filter
pub const SELECTOR_FILTER_NAME: &str = "apache.org:selector-filter:string";

/// A selector expression, interpreted only by the remote peer
/// <descriptor name="apache.org:selector-filter:string" code="0x0000468C:0x00000004"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "apache.org:selector-filter:string",
    code = "0x0000_468C:0x0000_0004",
    encoding = "basic"
)]
pub struct SelectorFilter(pub String);

/// <type name="source" class="composite" source="list" provides="source">
///     <descriptor name="amqp:source:list" code="0x00000000:0x00000028"/>
/// </type>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:source:list",
    code = "0x0000_0000:0x0000_0028",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Source {
    /// The address of the source
    pub address: Option<String>,

    /// Indicates the durability of the terminus
    #[amqp_contract(default)]
    pub durable: u32,

    /// The expiry policy of the source
    pub expiry_policy: Option<Symbol>,

    /// Duration that an expiring source will be retained
    #[amqp_contract(default)]
    pub timeout: u32,

    /// Request dynamic creation of a remote node
    #[amqp_contract(default)]
    pub dynamic: bool,

    /// Properties of the dynamically created node
    pub dynamic_node_properties: Option<Fields>,

    /// The distribution mode of the link
    pub distribution_mode: Option<Symbol>,

    /// A set of predicates to filter the messages admitted onto the link
    pub filter: Option<FilterSet>,

    /// Default outcome for unsettled transfers
    pub default_outcome: Option<Value>,

    /// Descriptors for the outcomes that can be chosen on this link
    pub outcomes: Option<Array<Symbol>>,

    /// The extension capabilities the sender supports/desires
    pub capabilities: Option<Array<Symbol>>,
}

/// <type name="target" class="composite" source="list" provides="target">
///     <descriptor name="amqp:target:list" code="0x00000000:0x00000029"/>
/// </type>
#[derive(Debug, Clone, Default, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:target:list",
    code = "0x0000_0000:0x0000_0029",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Target {
    /// The address of the target
    pub address: Option<String>,

    /// Indicates the durability of the terminus
    #[amqp_contract(default)]
    pub durable: u32,

    /// The expiry policy of the target
    pub expiry_policy: Option<Symbol>,

    /// Duration that an expiring target will be retained
    #[amqp_contract(default)]
    pub timeout: u32,

    /// Request dynamic creation of a remote node
    #[amqp_contract(default)]
    pub dynamic: bool,

    /// Properties of the dynamically created node
    pub dynamic_node_properties: Option<Fields>,

    /// The extension capabilities the sender supports/desires
    pub capabilities: Option<Array<Symbol>>,
}

impl Source {
    /// The address of the source, if any
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

impl Target {
    /// The address of the target, if any
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

/// <descriptor name="amqp:received:list" code="0x00000000:0x00000023"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:received:list",
    code = "0x0000_0000:0x0000_0023",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Received {
    pub section_number: u32,
    pub section_offset: u64,
}

/// <descriptor name="amqp:accepted:list" code="0x00000000:0x00000024"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:accepted:list",
    code = "0x0000_0000:0x0000_0024",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Accepted {}

/// <descriptor name="amqp:rejected:list" code="0x00000000:0x00000025"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:rejected:list",
    code = "0x0000_0000:0x0000_0025",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Rejected {
    pub error: Option<Error>,
}

/// <descriptor name="amqp:released:list" code="0x00000000:0x00000026"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:released:list",
    code = "0x0000_0000:0x0000_0026",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Released {}

/// <descriptor name="amqp:modified:list" code="0x00000000:0x00000027"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:modified:list",
    code = "0x0000_0000:0x0000_0027",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Modified {
    pub delivery_failed: Option<bool>,
    pub undeliverable_here: Option<bool>,
    pub message_annotations: Option<Fields>,
}

/// The state of a delivery as carried by `transfer` and `disposition`
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Received(Received),
    Accepted(Accepted),
    Rejected(Rejected),
    Released(Released),
    Modified(Modified),
}

impl DeliveryState {
    /// Whether the state is one of the terminal outcomes
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Received(_))
    }

    /// Position reached by a partially received delivery
    pub fn received(section_number: SequenceNo, section_offset: u64) -> Self {
        DeliveryState::Received(Received {
            section_number,
            section_offset,
        })
    }
}

impl ser::Serialize for DeliveryState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            DeliveryState::Received(value) => value.serialize(serializer),
            DeliveryState::Accepted(value) => value.serialize(serializer),
            DeliveryState::Rejected(value) => value.serialize(serializer),
            DeliveryState::Released(value) => value.serialize(serializer),
            DeliveryState::Modified(value) => value.serialize(serializer),
        }
    }
}

enum Field {
    Received,
    Accepted,
    Rejected,
    Released,
    Modified,
}

struct FieldVisitor {}

impl<'de> de::Visitor<'de> for FieldVisitor {
    type Value = Field;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("DeliveryState variant identifier")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let val = match v {
            "amqp:received:list" => Field::Received,
            "amqp:accepted:list" => Field::Accepted,
            "amqp:rejected:list" => Field::Rejected,
            "amqp:released:list" => Field::Released,
            "amqp:modified:list" => Field::Modified,
            _ => return Err(de::Error::custom("Wrong symbol value for descriptor")),
        };
        Ok(val)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let val = match v {
            0x0000_0000_0000_0023 => Field::Received,
            0x0000_0000_0000_0024 => Field::Accepted,
            0x0000_0000_0000_0025 => Field::Rejected,
            0x0000_0000_0000_0026 => Field::Released,
            0x0000_0000_0000_0027 => Field::Modified,
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
    type Value = DeliveryState;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("enum DeliveryState")
    }

    fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
    where
        A: de::EnumAccess<'de>,
    {
        let (val, variant) = data.variant()?;

        match val {
            Field::Received => variant.newtype_variant().map(DeliveryState::Received),
            Field::Accepted => variant.newtype_variant().map(DeliveryState::Accepted),
            Field::Rejected => variant.newtype_variant().map(DeliveryState::Rejected),
            Field::Released => variant.newtype_variant().map(DeliveryState::Released),
            Field::Modified => variant.newtype_variant().map(DeliveryState::Modified),
        }
    }
}

impl<'de> de::Deserialize<'de> for DeliveryState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        const VARIANTS: &[&str] = &[
            "amqp:received:list",
            "amqp:accepted:list",
            "amqp:rejected:list",
            "amqp:released:list",
            "amqp:modified:list",
        ];
        deserializer.deserialize_enum("DeliveryState", VARIANTS, Visitor {})
    }
}
