use super::graph::NodeId;

/// Fatal compilation error. Compilation stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A syntax construct the lowering does not handle.
    UnsupportedSyntax { construct: String, detail: String },
    UndefinedVariable { name: String },
    UndefinedFunction { name: String },
    /// A node left a different number of values than its context requires.
    InvalidStackState {
        node: NodeId,
        expected: i64,
        actual: i64,
        context: &'static str,
    },
    UnknownStructField { structure: String, field: String },
    UnresolvedLabel { label: String },
}

impl CompileError {
    pub fn unsupported(construct: impl Into<String>, detail: impl Into<String>) -> Self {
        CompileError::UnsupportedSyntax {
            construct: construct.into(),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnsupportedSyntax { construct, detail } => {
                write!(f, "unsupported syntax: {} ({})", construct, detail)
            }
            CompileError::UndefinedVariable { name } => {
                write!(f, "undefined variable '{}'", name)
            }
            CompileError::UndefinedFunction { name } => {
                write!(f, "undefined function '{}'", name)
            }
            CompileError::InvalidStackState {
                node,
                expected,
                actual,
                context,
            } => write!(
                f,
                "invalid stack state at node {}: {} must leave {} value(s), left {}",
                node, context, expected, actual
            ),
            CompileError::UnknownStructField { structure, field } => {
                write!(f, "struct {} has no field '{}'", structure, field)
            }
            CompileError::UnresolvedLabel { label } => {
                write!(f, "jump label {} was never placed", label)
            }
        }
    }
}

impl std::error::Error for CompileError {}
