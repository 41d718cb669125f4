//! Options used when opening a sender or a receiver

use serde_amqp::{primitives::Symbol, value::Value};

use crate::types::{
    definitions::{Fields, ReceiverSettleMode, SenderSettleMode},
    messaging::{FilterSet, SelectorFilter, Source, Target},
};

/// Default credit window of a receiver
pub const DEFAULT_CREDIT: u32 = 10;

/// Filter key used for selectors by convention
pub const DEFAULT_SELECTOR_KEY: &str = "jms-selector";

/// Credit mode for the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// Grants the given batch at attach. Further credit has to be added manually whenever
    /// the available credits are depleted
    Manual(u32),

    /// The receiver will automatically re-fill the credit so that credit plus unsettled
    /// deliveries stays at the given window
    Auto(u32),
}

impl Default for CreditMode {
    fn default() -> Self {
        Self::Auto(DEFAULT_CREDIT)
    }
}

impl CreditMode {
    /// Credit granted when the link is attached
    pub fn initial_credit(&self) -> u32 {
        match self {
            CreditMode::Manual(batch) => *batch,
            CreditMode::Auto(window) => *window,
        }
    }
}

/// Options of a sender link
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub(crate) name: Option<String>,
    pub(crate) target: Option<String>,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) auto_settle: bool,
    pub(crate) capabilities: Vec<Symbol>,
    pub(crate) properties: Option<Fields>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            name: None,
            target: None,
            snd_settle_mode: SenderSettleMode::Unsettled,
            auto_settle: true,
            capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl SenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The name of the link. A unique name is generated when not given
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Address of the target node
    pub fn target(mut self, address: impl Into<String>) -> Self {
        self.target = Some(address.into());
        self
    }

    /// Settlement policy for the sender. [`SenderSettleMode::Settled`] sends every message
    /// pre-settled
    pub fn sender_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = mode;
        self
    }

    /// Whether a delivery is settled locally as soon as the peer reports an outcome
    pub fn auto_settle(mut self, auto_settle: bool) -> Self {
        self.auto_settle = auto_settle;
        self
    }

    /// Adds a capability to the target, for example `"queue"` or `"topic"`
    pub fn add_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    pub(crate) fn target_terminus(&self) -> Target {
        Target {
            address: self.target.clone(),
            capabilities: capabilities(&self.capabilities),
            ..Default::default()
        }
    }
}

/// Options of a receiver link
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub(crate) name: Option<String>,
    pub(crate) source: Option<String>,
    pub(crate) credit_mode: CreditMode,
    pub(crate) auto_accept: bool,
    pub(crate) selector: Option<(String, String)>,
    pub(crate) capabilities: Vec<Symbol>,
    pub(crate) distribution_mode: Option<Symbol>,
    pub(crate) properties: Option<Fields>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            name: None,
            source: None,
            credit_mode: CreditMode::default(),
            auto_accept: false,
            selector: None,
            capabilities: Vec::new(),
            distribution_mode: None,
            properties: None,
        }
    }
}

impl ReceiverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The name of the link. A unique name is generated when not given
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Address of the source node
    pub fn source(mut self, address: impl Into<String>) -> Self {
        self.source = Some(address.into());
        self
    }

    pub fn credit_mode(mut self, credit_mode: CreditMode) -> Self {
        self.credit_mode = credit_mode;
        self
    }

    /// Accepts every message once `on_message` returns without settling it
    pub fn auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    /// Attaches a selector filter under the conventional `"jms-selector"` key
    pub fn selector(self, expression: impl Into<String>) -> Self {
        self.selector_with_key(DEFAULT_SELECTOR_KEY, expression)
    }

    /// Attaches a selector filter under the given key. The expression is interpreted by
    /// the peer only
    pub fn selector_with_key(mut self, key: impl Into<String>, expression: impl Into<String>) -> Self {
        self.selector = Some((key.into(), expression.into()));
        self
    }

    /// Adds a capability to the source, for example `"queue"` or `"topic"`
    pub fn add_capability(mut self, capability: impl Into<Symbol>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Distribution mode of the source, `"move"` or `"copy"`
    pub fn distribution_mode(mut self, mode: impl Into<Symbol>) -> Self {
        self.distribution_mode = Some(mode.into());
        self
    }

    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    pub(crate) fn rcv_settle_mode(&self) -> ReceiverSettleMode {
        ReceiverSettleMode::First
    }

    pub(crate) fn source_terminus(&self) -> Source {
        let filter = self.selector.as_ref().map(|(key, expression)| {
            let mut filter = FilterSet::new();
            let described = serde_amqp::to_value(&SelectorFilter(expression.clone()))
                .unwrap_or_else(|_| Value::String(expression.clone()));
            filter.insert(Symbol::from(key.as_str()), described);
            filter
        });

        Source {
            address: self.source.clone(),
            filter,
            distribution_mode: self.distribution_mode.clone(),
            capabilities: capabilities(&self.capabilities),
            ..Default::default()
        }
    }
}

fn capabilities(capabilities: &[Symbol]) -> Option<serde_amqp::primitives::Array<Symbol>> {
    match capabilities.is_empty() {
        true => None,
        false => Some(capabilities.to_vec().into()),
    }
}

#[cfg(test)]
mod tests {
    use serde_amqp::primitives::Symbol;

    use crate::types::messaging::SELECTOR_FILTER_NAME;

    use super::{CreditMode, ReceiverOptions, SenderOptions};

    #[test]
    fn test_receiver_defaults() {
        let options = ReceiverOptions::default();
        assert_eq!(options.credit_mode, CreditMode::Auto(10));
        assert!(!options.auto_accept);
        assert!(options.source_terminus().filter.is_none());
    }

    #[test]
    fn test_selector_is_attached_to_source() {
        let options = ReceiverOptions::new()
            .source("examples")
            .selector("colour = 'green'")
            .add_capability("topic");
        let source = options.source_terminus();
        let filter = source.filter.unwrap();
        assert!(filter.contains_key(&Symbol::from("jms-selector")));
        assert_eq!(
            source.capabilities.unwrap().0,
            vec![Symbol::from("topic")]
        );
        assert_eq!(SELECTOR_FILTER_NAME, "apache.org:selector-filter:string");
    }

    #[test]
    fn test_sender_target() {
        let target = SenderOptions::new()
            .target("examples")
            .add_capability("queue")
            .target_terminus();
        assert_eq!(target.address(), Some("examples"));
    }
}
