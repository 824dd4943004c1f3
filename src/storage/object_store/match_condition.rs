use crate::ql::{ComparisonOp, Expression, FunctionName, Term, Value, system_field};
use crate::storage::object_store::errors::ObjectStoreError;

/// Compiled form of a `where` expression restricted to pre-condition checks
/// on a single target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchCondition {
    pub exists: Option<bool>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_version_match: Option<String>,
    pub if_version_not_match: Option<String>,
    pub if_modified_since: Option<f64>,
    pub if_unmodified_since: Option<f64>,
}

/// The slice of stored state a condition is evaluated against.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchTarget {
    pub etag: Option<String>,
    pub last_modified: Option<f64>,
    pub version: Option<String>,
}

impl MatchCondition {
    pub fn is_empty(&self) -> bool {
        self == &MatchCondition::default()
    }

    /// Compile the conjunction of supported comparisons. Anything the
    /// condition model cannot express is a BadRequest.
    pub fn from_expression(expr: &Expression) -> Result<MatchCondition, ObjectStoreError> {
        let mut condition = MatchCondition::default();
        for member in expr.conjunction_members() {
            match member {
                Expression::Function(f) if f.name == FunctionName::Exists => {
                    condition.exists = Some(true);
                }
                Expression::Function(f) if f.name == FunctionName::NotExists => {
                    condition.exists = Some(false);
                }
                Expression::Comparison(c) => {
                    let (field, op, value) = normalize_comparison(&c.lexpr, c.op, &c.rexpr)?;
                    condition.apply(field, op, value)?;
                }
                _ => {
                    return Err(ObjectStoreError::bad_request("Condition not supported"));
                }
            }
        }
        Ok(condition)
    }

    fn apply(&mut self, field: &str, op: ComparisonOp, value: &Value) -> Result<(), ObjectStoreError> {
        match field {
            system_field::ETAG => {
                let etag = value
                    .as_str()
                    .ok_or_else(|| ObjectStoreError::bad_request("Etag condition requires a string value"))?;
                match op {
                    ComparisonOp::Eq => self.if_match = Some(etag.to_string()),
                    ComparisonOp::Ne => self.if_none_match = Some(etag.to_string()),
                    _ => return Err(ObjectStoreError::bad_request("Etag condition supports only = and !=")),
                }
            }
            "version" => {
                let version = value
                    .as_str()
                    .ok_or_else(|| ObjectStoreError::bad_request("Version condition requires a string value"))?;
                match op {
                    ComparisonOp::Eq => self.if_version_match = Some(version.to_string()),
                    ComparisonOp::Ne => self.if_version_not_match = Some(version.to_string()),
                    _ => return Err(ObjectStoreError::bad_request("Version condition supports only = and !=")),
                }
            }
            system_field::MODIFIED => {
                let instant = value
                    .as_f64()
                    .ok_or_else(|| ObjectStoreError::bad_request("Modified condition requires a numeric value"))?;
                match op {
                    ComparisonOp::Gt | ComparisonOp::Gte => self.if_modified_since = Some(instant),
                    ComparisonOp::Lt | ComparisonOp::Lte => self.if_unmodified_since = Some(instant),
                    _ => {
                        return Err(ObjectStoreError::bad_request(
                            "Modified condition supports only ordering operators",
                        ));
                    }
                }
            }
            _ => {
                return Err(ObjectStoreError::bad_request(format!(
                    "Field `{field}` is not supported in a match condition"
                )));
            }
        }
        Ok(())
    }

    /// Evaluate against the current state; `None` means the object is absent.
    pub fn evaluate(&self, target: Option<&MatchTarget>) -> Result<(), ObjectStoreError> {
        let target = match target {
            None => {
                if self.if_match.is_some() || self.if_unmodified_since.is_some() || self.exists == Some(true) {
                    return Err(ObjectStoreError::precondition_failed("Object does not exist"));
                }
                return Ok(());
            }
            Some(target) => target,
        };

        if self.exists == Some(false) {
            return Err(ObjectStoreError::precondition_failed("Object already exists"));
        }

        let etag = target.etag.as_deref().unwrap_or_default();
        if let Some(if_match) = &self.if_match {
            if if_match != etag && if_match != "*" {
                return Err(ObjectStoreError::precondition_failed("Etag does not match"));
            }
        }
        if let Some(if_none_match) = &self.if_none_match {
            let matched = if_none_match.split(',').map(str::trim).any(|candidate| candidate == etag);
            if matched {
                return Err(ObjectStoreError::NotModified);
            }
        }
        if let Some(expected) = &self.if_version_match {
            if Some(expected.as_str()) != target.version.as_deref() {
                return Err(ObjectStoreError::precondition_failed("Version does not match"));
            }
        }
        if let Some(excluded) = &self.if_version_not_match {
            if Some(excluded.as_str()) == target.version.as_deref() {
                return Err(ObjectStoreError::precondition_failed("Version matches excluded version"));
            }
        }
        if let Some(threshold) = self.if_modified_since {
            if target.last_modified.unwrap_or_default() <= threshold {
                return Err(ObjectStoreError::NotModified);
            }
        }
        if let Some(threshold) = self.if_unmodified_since {
            if target.last_modified.unwrap_or_default() > threshold {
                return Err(ObjectStoreError::precondition_failed("Object modified since given time"));
            }
        }
        Ok(())
    }
}

fn normalize_comparison<'e>(
    lexpr: &'e Term,
    op: ComparisonOp,
    rexpr: &'e Term,
) -> Result<(&'e str, ComparisonOp, &'e Value), ObjectStoreError> {
    if let (Some(field), Some(value)) = (lexpr.field_path(), rexpr.value()) {
        return Ok((field, op, value));
    }
    if let (Some(value), Some(field)) = (lexpr.value(), rexpr.field_path()) {
        let flipped = match op {
            ComparisonOp::Lt => ComparisonOp::Gt,
            ComparisonOp::Gt => ComparisonOp::Lt,
            ComparisonOp::Lte => ComparisonOp::Gte,
            ComparisonOp::Gte => ComparisonOp::Lte,
            keep => keep,
        };
        return Ok((field, flipped, value));
    }
    Err(ObjectStoreError::bad_request("Condition not supported"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ql::parse;

    fn target(etag: &str, last_modified: f64) -> MatchTarget {
        MatchTarget {
            etag: Some(etag.to_string()),
            last_modified: Some(last_modified),
            version: None,
        }
    }

    #[test]
    fn exists_conditions() {
        let cond = MatchCondition::from_expression(&parse("exists()").unwrap()).unwrap();
        assert!(cond.evaluate(None).is_err());
        assert!(cond.evaluate(Some(&target("e1", 0.0))).is_ok());

        let cond = MatchCondition::from_expression(&parse("not_exists()").unwrap()).unwrap();
        assert!(cond.evaluate(None).is_ok());
        assert!(matches!(
            cond.evaluate(Some(&target("e1", 0.0))),
            Err(ObjectStoreError::PreconditionFailed { .. })
        ));
    }

    #[test]
    fn etag_match_with_wildcard() {
        let cond = MatchCondition::from_expression(&parse("$etag='*'").unwrap()).unwrap();
        assert!(cond.evaluate(Some(&target("anything", 0.0))).is_ok());
        assert!(cond.evaluate(None).is_err());

        let cond = MatchCondition::from_expression(&parse("$etag='e1'").unwrap()).unwrap();
        assert!(cond.evaluate(Some(&target("e1", 0.0))).is_ok());
        assert!(cond.evaluate(Some(&target("e2", 0.0))).is_err());
    }

    #[test]
    fn if_none_match_raises_not_modified() {
        let cond = MatchCondition::from_expression(&parse("$etag!='e1'").unwrap()).unwrap();
        assert_eq!(cond.evaluate(Some(&target("e1", 0.0))), Err(ObjectStoreError::NotModified));
        assert!(cond.evaluate(Some(&target("e2", 0.0))).is_ok());
    }

    #[test]
    fn modified_since_conditions() {
        let cond = MatchCondition::from_expression(&parse("$modified > 100").unwrap()).unwrap();
        assert_eq!(cond.evaluate(Some(&target("e", 50.0))), Err(ObjectStoreError::NotModified));
        assert!(cond.evaluate(Some(&target("e", 150.0))).is_ok());

        let cond = MatchCondition::from_expression(&parse("$modified <= 100").unwrap()).unwrap();
        assert!(cond.evaluate(Some(&target("e", 50.0))).is_ok());
        assert!(cond.evaluate(Some(&target("e", 150.0))).is_err());
    }

    #[test]
    fn unsupported_conditions_are_rejected() {
        assert!(MatchCondition::from_expression(&parse("$size > 10").unwrap()).is_err());
        assert!(MatchCondition::from_expression(&parse("starts_with($id, 'a')").unwrap()).is_err());
    }
}
