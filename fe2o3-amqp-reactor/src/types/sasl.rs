//! SASL frame bodies (AMQP 1.0 Part 5.3)

use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Array, Binary, Symbol},
};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Advertise available sasl mechanisms.
/// <descriptor name="amqp:sasl-mechanisms:list" code="0x00000000:0x00000040"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:sasl-mechanisms:list",
    code = "0x0000_0000:0x0000_0040",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct SaslMechanisms {
    pub sasl_server_mechanisms: Array<Symbol>,
}

/// Initiate sasl exchange.
/// <descriptor name="amqp:sasl-init:list" code="0x00000000:0x00000041"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:sasl-init:list",
    code = "0x0000_0000:0x0000_0041",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct SaslInit {
    pub mechanism: Symbol,
    pub initial_response: Option<Binary>,
    pub hostname: Option<String>,
}

/// Security mechanism challenge.
/// <descriptor name="amqp:sasl-challenge:list" code="0x00000000:0x00000042"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:sasl-challenge:list",
    code = "0x0000_0000:0x0000_0042",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct SaslChallenge {
    pub challenge: Binary,
}

/// Security mechanism response.
/// <descriptor name="amqp:sasl-response:list" code="0x00000000:0x00000043"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:sasl-response:list",
    code = "0x0000_0000:0x0000_0043",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct SaslResponse {
    pub response: Binary,
}

/// Indicates the outcome of the sasl dialog.
/// <descriptor name="amqp:sasl-outcome:list" code="0x00000000:0x00000044"/>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:sasl-outcome:list",
    code = "0x0000_0000:0x0000_0044",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct SaslOutcome {
    pub code: SaslCode,
    pub additional_data: Option<Binary>,
}

/// Codes to indicate the outcome of the sasl dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum SaslCode {
    /// Connection authentication succeeded
    Ok = 0,
    /// Connection authentication failed due to an unspecified problem with the supplied
    /// credentials
    Auth = 1,
    /// Connection authentication failed due to a system error
    Sys = 2,
    /// Connection authentication failed due to a system error that is unlikely to be
    /// corrected without intervention
    SysPerm = 3,
    /// Connection authentication failed due to a transient system error
    SysTemp = 4,
}

#[cfg(test)]
mod tests {
    use serde_amqp::{from_slice, to_vec};

    use super::SaslCode;

    #[test]
    fn test_sasl_code_is_ubyte() {
        for code in [SaslCode::Ok, SaslCode::Auth, SaslCode::SysTemp] {
            let buf = to_vec(&code).unwrap();
            assert_eq!(buf, vec![0x50, code as u8]);
            let decoded: SaslCode = from_slice(&buf).unwrap();
            assert_eq!(decoded, code);
        }
    }
}
