use thiserror::Error;

/// Schema self-validation and message verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Message schema has no name")]
    UnnamedSchema,

    #[error("Schema '{schema}' declares an unnamed field")]
    UnnamedField { schema: String },

    #[error("Schema '{schema}' declares field '{field}' more than once")]
    DuplicateField { schema: String, field: String },

    #[error("Schema '{schema}' field '{field}' default does not match its declared type")]
    DefaultTypeMismatch { schema: String, field: String },

    #[error("Message does not satisfy schema '{schema}': field '{field}' is missing")]
    MissingField { schema: String, field: String },

    #[error("Message does not satisfy schema '{schema}': field '{field}' has the wrong type")]
    FieldTypeMismatch { schema: String, field: String },
}

/// Template validation failures raised by the engine's commit methods.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("Template has no name")]
    EmptyName,

    #[error("Tactic '{tactic}' references unknown goal '{goal}'")]
    UnknownGoal { tactic: String, goal: String },

    #[error("Tactic '{tactic}' includes plan '{plan}' which handles goal '{handles}' not '{goal}'")]
    PlanHandlesOtherGoal {
        tactic: String,
        plan: String,
        goal: String,
        handles: String,
    },

    #[error("Tactic '{tactic}' references unknown plan '{plan}'")]
    UnknownPlan { tactic: String, plan: String },

    #[error("Plan '{plan}' does not name the goal it handles")]
    PlanWithoutGoal { plan: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type Result<T> = std::result::Result<T, CommitError>;
