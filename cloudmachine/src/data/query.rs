use super::entity::{PARTITION_KEY, ROW_KEY};
use crate::common::{CloudMachineError, CloudMachineResult};
use serde_json::Value;
use std::collections::BTreeMap;

/// The shapes a table query can take.
#[derive(Debug, Clone, PartialEq)]
pub enum TableQuery {
    /// Direct lookup of one row; no filter is sent.
    Point {
        partition_key: String,
        row_key: String,
    },
    /// OData filter with `@name` placeholders.
    Filter {
        expression: String,
        parameters: BTreeMap<String, Value>,
    },
}

impl TableQuery {
    /// Builds a query from a key pair where `*` or an empty string is a
    /// wildcard.
    ///
    /// Two concrete keys give a point lookup. One concrete key gives an
    /// equality filter on that key.
    ///
    /// # Errors
    ///
    /// Returns [`CloudMachineError::InvalidQuery`] when both keys are
    /// wildcards.
    pub fn keys(partition_key: &str, row_key: &str) -> CloudMachineResult<Self> {
        let concrete = |key: &str| !key.is_empty() && key != "*";

        match (concrete(partition_key), concrete(row_key)) {
            (true, true) => Ok(TableQuery::Point {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
            }),
            (true, false) => Ok(
                TableQuery::filter(format!("{PARTITION_KEY} eq @partition"))
                    .with_parameter("partition", partition_key),
            ),
            (false, true) => {
                Ok(TableQuery::filter(format!("{ROW_KEY} eq @row")).with_parameter("row", row_key))
            }
            (false, false) => Err(CloudMachineError::InvalidQuery(
                "Both partition key and row key must be valid strings or '*'".to_string(),
            )),
        }
    }

    pub fn filter(expression: impl Into<String>) -> Self {
        TableQuery::Filter {
            expression: expression.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Binds `@name` in a filter query. Has no effect on point lookups.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let TableQuery::Filter { parameters, .. } = &mut self {
            parameters.insert(name.into(), value.into());
        }
        self
    }

    pub fn is_point(&self) -> bool {
        matches!(self, TableQuery::Point { .. })
    }

    /// The filter string sent to the service, or `None` for a point lookup.
    pub fn render(&self) -> CloudMachineResult<Option<String>> {
        match self {
            TableQuery::Point { .. } => Ok(None),
            TableQuery::Filter {
                expression,
                parameters,
            } => render_filter(expression, parameters).map(Some),
        }
    }
}

/// Substitutes every `@name` outside string literals with its OData literal.
pub fn render_filter(
    expression: &str,
    parameters: &BTreeMap<String, Value>,
) -> CloudMachineResult<String> {
    let mut rendered = String::with_capacity(expression.len());
    let mut chars = expression.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_string = !in_string;
                rendered.push(c);
            }
            '@' if !in_string => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(CloudMachineError::InvalidQuery(
                        "'@' must be followed by a parameter name".to_string(),
                    ));
                }
                let value = parameters.get(&name).ok_or_else(|| {
                    CloudMachineError::InvalidQuery(format!("Unknown parameter '@{name}'"))
                })?;
                rendered.push_str(&odata_literal(&name, value)?);
            }
            _ => rendered.push(c),
        }
    }

    Ok(rendered)
}

fn odata_literal(name: &str, value: &Value) -> CloudMachineResult<String> {
    match value {
        Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    Ok(i.to_string())
                } else {
                    Ok(format!("{i}L"))
                }
            } else if let Some(u) = n.as_u64() {
                Ok(format!("{u}L"))
            } else {
                Ok(n.to_string())
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => Err(CloudMachineError::InvalidQuery(
            format!("Parameter '@{name}' must be a string, number or boolean"),
        )),
    }
}
