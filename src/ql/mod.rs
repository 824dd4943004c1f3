use std::collections::HashMap;
use std::fmt::{Display, Formatter};

pub mod parser;

pub use parser::{ParseError, parse};

/// Reserved system fields addressable as `$etag`, `$modified`, `$id`.
pub mod system_field {
    pub const ETAG: &str = "etag";
    pub const MODIFIED: &str = "modified";
    pub const ID: &str = "id";
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
}

impl Display for ComparisonOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Gt => ">",
            ComparisonOp::Lte => "<=",
            ComparisonOp::Gte => ">=",
        };
        f.write_str(s)
    }
}

/// One side of a comparison or one function argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    /// `$field` reference; the path is stored without the leading `$`.
    Field(String),
    /// `@name` named parameter, resolved out-of-band.
    Parameter(String),
    Value(Value),
}

impl Term {
    pub fn field_path(&self) -> Option<&str> {
        match self {
            Term::Field(path) => Some(path.as_str()),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Term::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub lexpr: Term,
    pub op: ComparisonOp,
    pub rexpr: Term,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionName {
    Exists,
    NotExists,
    StartsWith,
    StartsWithDelimited,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: FunctionName,
    pub args: Vec<Term>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Comparison(Comparison),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Function(Function),
}

impl Expression {
    /// Extract the tri-state existence condition: `exists()` means the
    /// target must already exist, `not_exists()` that it must not, and
    /// anything else is left for the provider to evaluate.
    pub fn where_exists(&self) -> Option<bool> {
        match self {
            Expression::Function(f) if f.name == FunctionName::Exists => Some(true),
            Expression::Function(f) if f.name == FunctionName::NotExists => Some(false),
            _ => None,
        }
    }

    /// Flatten a conjunction into its member expressions.
    /// A single non-AND expression yields itself.
    pub fn conjunction_members(&self) -> Vec<&Expression> {
        match self {
            Expression::And(lexpr, rexpr) => {
                let mut members = lexpr.conjunction_members();
                members.extend(rexpr.conjunction_members());
                members
            }
            other => vec![other],
        }
    }

    /// Substitute `@name` parameters with values from `params`.
    /// Unknown parameters are left untouched so the caller can report them.
    pub fn resolve_parameters(&self, params: &HashMap<String, Value>) -> Expression {
        let resolve_term = |term: &Term| match term {
            Term::Parameter(name) => match params.get(name) {
                Some(value) => Term::Value(value.clone()),
                None => term.clone(),
            },
            other => other.clone(),
        };
        match self {
            Expression::Comparison(c) => Expression::Comparison(Comparison {
                lexpr: resolve_term(&c.lexpr),
                op: c.op,
                rexpr: resolve_term(&c.rexpr),
            }),
            Expression::And(l, r) => Expression::And(
                Box::new(l.resolve_parameters(params)),
                Box::new(r.resolve_parameters(params)),
            ),
            Expression::Or(l, r) => Expression::Or(
                Box::new(l.resolve_parameters(params)),
                Box::new(r.resolve_parameters(params)),
            ),
            Expression::Not(e) => Expression::Not(Box::new(e.resolve_parameters(params))),
            Expression::Function(f) => Expression::Function(Function {
                name: f.name,
                args: f.args.iter().map(resolve_term).collect(),
            }),
        }
    }
}
