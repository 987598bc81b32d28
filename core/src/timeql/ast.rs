use crate::chain::Direction;
use serde::Serialize;

/// A point in time as written in a query. `Now` and `Ago` are resolved
/// against the engine clock at execution; parsing stays pure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum TimeExpr {
    Now,
    /// Milliseconds since the Unix epoch. Integer and ISO-8601 literals both
    /// land here.
    Absolute(i64),
    /// `<n> <unit> ago`, stored as the offset in milliseconds.
    Ago(i64),
}

impl TimeExpr {
    pub fn resolve(&self, now_ms: i64) -> i64 {
        match self {
            TimeExpr::Now => now_ms,
            TimeExpr::Absolute(ms) => *ms,
            TimeExpr::Ago(offset) => now_ms - offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A literal on the right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CondValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl CondValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CondValue::Int(n) => Some(*n as f64),
            CondValue::Float(n) => Some(*n),
            CondValue::Str(s) => s.parse().ok(),
        }
    }
}

/// One `field <op> value` primary. Conjunctions are plain vectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: CondValue,
}

/// Parsed form of the six statement kinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "statement", rename_all = "snake_case")]
pub enum Statement {
    StateAt {
        at: TimeExpr,
        filter: Vec<Condition>,
    },
    Traverse {
        event_id: String,
        direction: Direction,
        until: Vec<Condition>,
    },
    MatchPattern {
        first: Vec<Condition>,
        followed_by: Option<Vec<Condition>>,
        within_ms: i64,
        in_last_ms: Option<i64>,
    },
    Timeline {
        start: TimeExpr,
        end: TimeExpr,
        filter: Vec<Condition>,
    },
    Compare {
        left: TimeExpr,
        right: TimeExpr,
        metrics: Vec<String>,
    },
    Predict {
        horizon_ms: i64,
        from: Option<TimeExpr>,
    },
}

impl Statement {
    /// The `type` field of every result envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::StateAt { .. } => "state_at",
            Statement::Traverse { .. } => "traverse",
            Statement::MatchPattern { .. } => "match_pattern",
            Statement::Timeline { .. } => "timeline",
            Statement::Compare { .. } => "compare",
            Statement::Predict { .. } => "predict",
        }
    }
}
