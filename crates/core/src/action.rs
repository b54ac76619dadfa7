use serde::{Deserialize, Serialize};

/// Declarative action template. Schemas are optional; an action without a
/// request schema takes whatever parameters the plan task supplies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    pub request_schema: Option<String>,
    pub reply_schema: Option<String>,
    pub feedback_schema: Option<String>,
}

impl ActionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
