mod address_filter;
mod glob;

pub use address_filter::{DefaultAction, Policies, PolicyRuleSet};
