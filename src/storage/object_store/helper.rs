use crate::model::object::ObjectQueryConfig;
use crate::ql::{ComparisonOp, Expression, FunctionName, Term, Value, system_field};
use crate::storage::object_store::errors::ObjectStoreError;

/// Normalized listing arguments extracted from a `where` expression plus
/// paging configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryArgs {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub start_after: Option<String>,
    pub end_before: Option<String>,
    pub limit: Option<u64>,
    pub continuation: Option<String>,
    pub paging: bool,
    pub page_size: Option<u64>,
}

impl QueryArgs {
    /// Supported expressions: `starts_with($id, p)`,
    /// `starts_with_delimited($id, p, d)`, `$id > v`, `$id < v`, and
    /// conjunctions thereof. Anything else is a BadRequest.
    pub fn from_parts(
        where_expr: Option<&Expression>,
        limit: Option<u64>,
        continuation: Option<&str>,
        config: Option<&ObjectQueryConfig>,
    ) -> Result<QueryArgs, ObjectStoreError> {
        let mut args = QueryArgs::default();

        if let Some(expr) = where_expr {
            for member in expr.conjunction_members() {
                match member {
                    Expression::Function(f) if f.name == FunctionName::StartsWith => {
                        require_id_field(f.args.first())?;
                        args.prefix = optional_string(f.args.get(1))?;
                    }
                    Expression::Function(f) if f.name == FunctionName::StartsWithDelimited => {
                        require_id_field(f.args.first())?;
                        args.prefix = optional_string(f.args.get(1))?;
                        args.delimiter = optional_string(f.args.get(2))?;
                    }
                    Expression::Comparison(c) => {
                        let (field, op, value) = match (&c.lexpr, &c.rexpr) {
                            (Term::Field(field), Term::Value(value)) => (field.as_str(), c.op, value),
                            (Term::Value(value), Term::Field(field)) => {
                                let flipped = match c.op {
                                    ComparisonOp::Lt => ComparisonOp::Gt,
                                    ComparisonOp::Gt => ComparisonOp::Lt,
                                    keep => keep,
                                };
                                (field.as_str(), flipped, value)
                            }
                            _ => return Err(ObjectStoreError::bad_request("Condition not supported")),
                        };
                        if field != system_field::ID {
                            return Err(ObjectStoreError::bad_request("Condition not supported"));
                        }
                        let value = value
                            .as_str()
                            .ok_or_else(|| ObjectStoreError::bad_request("Condition not supported"))?;
                        match op {
                            ComparisonOp::Gt => args.start_after = Some(value.to_string()),
                            ComparisonOp::Lt => args.end_before = Some(value.to_string()),
                            _ => return Err(ObjectStoreError::bad_request("Condition not supported")),
                        }
                    }
                    _ => return Err(ObjectStoreError::bad_request("Condition not supported")),
                }
            }
        }

        args.limit = limit;
        args.continuation = continuation.map(str::to_string);
        if let Some(config) = config {
            args.paging = config.paging.unwrap_or(false);
            args.page_size = config.page_size.map(u64::from);
        }
        Ok(args)
    }

    /// Effective per-call fetch bound: the smaller of limit and page size
    /// when paging is active.
    pub fn effective_limit(&self) -> Option<u64> {
        match (self.limit, if self.paging { self.page_size } else { None }) {
            (Some(limit), Some(page)) => Some(limit.min(page)),
            (Some(limit), None) => Some(limit),
            (None, Some(page)) => Some(page),
            (None, None) => None,
        }
    }
}

fn require_id_field(term: Option<&Term>) -> Result<(), ObjectStoreError> {
    match term {
        Some(Term::Field(path)) if path == system_field::ID => Ok(()),
        _ => Err(ObjectStoreError::bad_request("Condition not supported")),
    }
}

fn optional_string(term: Option<&Term>) -> Result<Option<String>, ObjectStoreError> {
    match term {
        Some(Term::Value(Value::String(s))) => Ok(Some(s.clone())),
        Some(Term::Value(Value::Null)) => Ok(None),
        None => Ok(None),
        _ => Err(ObjectStoreError::bad_request("Condition not supported")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ql::parse;

    #[test]
    fn extract_prefix_and_delimiter() {
        let expr = parse("starts_with_delimited($id, 'data/', '/')").unwrap();
        let args = QueryArgs::from_parts(Some(&expr), None, None, None).unwrap();
        assert_eq!(args.prefix.as_deref(), Some("data/"));
        assert_eq!(args.delimiter.as_deref(), Some("/"));
    }

    #[test]
    fn extract_range_bounds() {
        let expr = parse("$id > 'a' AND $id < 'z'").unwrap();
        let args = QueryArgs::from_parts(Some(&expr), None, None, None).unwrap();
        assert_eq!(args.start_after.as_deref(), Some("a"));
        assert_eq!(args.end_before.as_deref(), Some("z"));
    }

    #[test]
    fn null_prefix_is_accepted() {
        let expr = parse("starts_with($id, null)").unwrap();
        let args = QueryArgs::from_parts(Some(&expr), None, None, None).unwrap();
        assert_eq!(args.prefix, None);
    }

    #[test]
    fn non_id_conditions_are_rejected() {
        let expr = parse("starts_with($name, 'data/')").unwrap();
        assert!(QueryArgs::from_parts(Some(&expr), None, None, None).is_err());
        let expr = parse("$etag='x'").unwrap();
        assert!(QueryArgs::from_parts(Some(&expr), None, None, None).is_err());
    }

    #[test]
    fn effective_limit_combines_limit_and_page_size() {
        let config = ObjectQueryConfig {
            paging: Some(true),
            page_size: Some(5),
        };
        let args = QueryArgs::from_parts(None, Some(3), None, Some(&config)).unwrap();
        assert_eq!(args.effective_limit(), Some(3));
        let args = QueryArgs::from_parts(None, None, None, Some(&config)).unwrap();
        assert_eq!(args.effective_limit(), Some(5));
    }
}
