pub mod iface;
pub mod rules;

pub use iface::{AddressScope, Interface};
pub use rules::{Rule, RuleSet, masquerade_rules};
