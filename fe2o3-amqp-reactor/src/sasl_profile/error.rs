/// SASL profile error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// None of the mechanisms offered by the peer is acceptable
    #[error("No acceptable SASL mechanism among {0:?}")]
    NoAcceptableMechanism(Vec<String>),

    /// The chosen mechanism would reveal credentials over an unencrypted transport
    #[error("Mechanism {0} is not allowed over an unencrypted transport")]
    InsecureMechanism(String),
}
