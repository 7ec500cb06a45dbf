use thiserror::Error;

/// Unified error type for the engine.
///
/// The variants follow the recovery contract documented on each: schema and
/// state violations are fatal to the entity that raised them, program errors
/// indicate a bug in a compiled handler, and the remaining variants surface
/// to the orchestrator which records them against the offending
/// (entity, attribute, substep) triple.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Unknown attribute name or out-of-range attribute index.
    #[error("schema violation on `{entity}`: {detail}")]
    Schema { entity: String, detail: String },

    /// Substep protocol violation: nested start, stray end, or freeze while
    /// a substep is active.
    #[error("substep state violation on `{entity}`: {detail}")]
    State { entity: String, detail: String },

    /// A value of the wrong variant reached an operation.
    #[error("type mismatch: expected {expected}, found {found}")]
    Type { expected: String, found: String },

    /// Incompatible units in add/subtract/compare without a forced cast.
    #[error("incompatible units `{left}` and `{right}`")]
    Unit { left: String, right: String },

    /// Division by zero or a domain error on log/sqrt.
    #[error("math error: {detail}")]
    Math { detail: String },

    /// Unknown identifier, local, or missing attribute on another entity.
    #[error("could not resolve `{name}`")]
    Resolution { name: String },

    /// Lock acquisition timed out.
    #[error("lock contention on `{entity}` after {waited_ms}ms")]
    Contention { entity: String, waited_ms: u64 },

    /// External resource I/O failed after the retry budget was spent.
    #[error("resource read of `{resource}` failed: {detail}")]
    Io { resource: String, detail: String },

    /// An external resource produced malformed data.
    #[error("malformed resource data: {detail}")]
    Data { detail: String },

    /// Unknown function or malformed operand list in a compiled action.
    /// Never recoverable; indicates a builder bug upstream.
    #[error("program error: {detail}")]
    Program { detail: String },

    /// Text that could not be parsed into a number by the value factory.
    #[error("could not parse `{text}` as a number")]
    Parse { text: String },
}

impl EngineError {
    pub(crate) fn schema(entity: &str, detail: String) -> Self {
        EngineError::Schema {
            entity: entity.to_string(),
            detail,
        }
    }

    pub(crate) fn state(entity: &str, detail: String) -> Self {
        EngineError::State {
            entity: entity.to_string(),
            detail,
        }
    }

    pub(crate) fn type_mismatch(expected: &str, found: &str) -> Self {
        EngineError::Type {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn math(detail: impl Into<String>) -> Self {
        EngineError::Math {
            detail: detail.into(),
        }
    }

    pub(crate) fn program(detail: impl Into<String>) -> Self {
        EngineError::Program {
            detail: detail.into(),
        }
    }

    pub(crate) fn resolution(name: impl Into<String>) -> Self {
        EngineError::Resolution { name: name.into() }
    }

    /// Whether the orchestrator may continue with the next attribute after
    /// recording this error, or must halt the replicate.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::State { .. } | EngineError::Program { .. } => false,
            _ => true,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
