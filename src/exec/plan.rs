//! Typed plan tree. The planner delivers a JSON document; it is parsed
//! once into `PlanNode` and malformed input is rejected up front.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan node missing field {0}")]
    MissingField(&'static str),

    #[error("field {field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unsupported operator kind {0}")]
    UnsupportedOperator(String),

    #[error("unknown column code {0}")]
    UnknownColumnCode(String),

    #[error("unsupported aggregate function {0}")]
    UnsupportedAggregate(String),

    #[error("range bounds must be integer literals")]
    NonIntegerRange,

    #[error("unsupported plan shape: {0}")]
    UnsupportedShape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    LessThan,
    Equals,
}

/// A parsed literal. Numeric wire literals arrive as floats and are
/// converted to integers; string literals have their surrounding quotes
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        literal: Literal,
    },
    /// `column >= low AND column <= high`, integer bounds only.
    Range {
        column: String,
        low: i64,
        high: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanNode {
    Scan {
        table: String,
    },
    Filter {
        predicate: Predicate,
        input: Box<PlanNode>,
    },
    Project {
        columns: Vec<String>,
        input: Box<PlanNode>,
    },
    Sort {
        column: String,
        direction: SortDirection,
        limit: Option<usize>,
        input: Box<PlanNode>,
    },
    Aggregate {
        group_by: String,
        function: AggFunc,
        arg: Option<String>,
        input: Box<PlanNode>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Delete {
        table: String,
        column: String,
        value: String,
    },
    Update {
        table: String,
        set_column: String,
        set_value: String,
        filter_column: String,
        filter_value: String,
    },
}

/// Read side of a plan, flattened into the pipeline stages it drives.
#[derive(Debug)]
pub struct SelectSpec {
    pub table: String,
    pub predicate: Option<Predicate>,
    pub projection: Option<Vec<String>>,
    pub sort: Option<SortSpec>,
    pub aggregate: Option<AggregateSpec>,
}

#[derive(Debug)]
pub struct SortSpec {
    pub column: String,
    pub direction: SortDirection,
    pub limit: Option<usize>,
}

#[derive(Debug)]
pub struct AggregateSpec {
    pub group_by: String,
    pub function: AggFunc,
    pub arg: Option<String>,
}

pub fn parse_plan(doc: &Value) -> Result<PlanNode, PlanError> {
    parse_node(doc, &HashMap::new())
}

/// Collapse a read plan into scan -> filter -> projection -> sort|aggregate.
/// Each stage may appear at most once and sort/aggregate are exclusive.
pub fn flatten_select(root: PlanNode) -> Result<SelectSpec, PlanError> {
    let mut predicate = None;
    let mut projection = None;
    let mut sort: Option<SortSpec> = None;
    let mut aggregate: Option<AggregateSpec> = None;

    let mut node = root;
    loop {
        node = match node {
            PlanNode::Scan { table } => {
                return Ok(SelectSpec {
                    table,
                    predicate,
                    projection,
                    sort,
                    aggregate,
                });
            }
            PlanNode::Filter {
                predicate: p,
                input,
            } => {
                if predicate.replace(p).is_some() {
                    return Err(PlanError::UnsupportedShape(
                        "more than one filter stage".to_string(),
                    ));
                }
                *input
            }
            PlanNode::Project { columns, input } => {
                if projection.replace(columns).is_some() {
                    return Err(PlanError::UnsupportedShape(
                        "more than one projection stage".to_string(),
                    ));
                }
                *input
            }
            PlanNode::Sort {
                column,
                direction,
                limit,
                input,
            } => {
                if sort.is_some() || aggregate.is_some() {
                    return Err(PlanError::UnsupportedShape(
                        "sort combined with another terminal stage".to_string(),
                    ));
                }
                sort = Some(SortSpec {
                    column,
                    direction,
                    limit,
                });
                *input
            }
            PlanNode::Aggregate {
                group_by,
                function,
                arg,
                input,
            } => {
                if sort.is_some() || aggregate.is_some() {
                    return Err(PlanError::UnsupportedShape(
                        "aggregate combined with another terminal stage".to_string(),
                    ));
                }
                aggregate = Some(AggregateSpec {
                    group_by,
                    function,
                    arg,
                });
                *input
            }
            _ => {
                return Err(PlanError::UnsupportedShape(
                    "write node inside a read plan".to_string(),
                ));
            }
        };
    }
}

fn parse_node(value: &Value, inherited: &HashMap<String, String>) -> Result<PlanNode, PlanError> {
    let obj = value.as_object().ok_or(PlanError::WrongType {
        field: "node",
        expected: "an object",
    })?;

    // A node's refList extends (and shadows) the one it inherited.
    let mut refs = inherited.clone();
    if let Some(list) = obj.get("refList") {
        let map = list.as_object().ok_or(PlanError::WrongType {
            field: "refList",
            expected: "an object",
        })?;
        for (code, name) in map {
            let name = name.as_str().ok_or(PlanError::WrongType {
                field: "refList",
                expected: "a string mapping",
            })?;
            refs.insert(code.clone(), name.to_string());
        }
    }

    let operator = str_field(obj, "operator")?;
    match operator {
        "SCAN" => Ok(PlanNode::Scan {
            table: str_field(obj, "table")?.to_string(),
        }),
        "FILTER" => {
            let condition = obj
                .get("condition")
                .ok_or(PlanError::MissingField("condition"))?;
            Ok(PlanNode::Filter {
                predicate: parse_condition(condition, &refs)?,
                input: parse_child(obj, &refs)?,
            })
        }
        "PROJECT" => Ok(PlanNode::Project {
            columns: parse_columns(obj, &refs)?,
            input: parse_child(obj, &refs)?,
        }),
        "SORT" => {
            let column = resolve_column(str_field(obj, "column")?, &refs)?;
            let direction = match str_field(obj, "sortDirection")? {
                "ASC" => SortDirection::Asc,
                "DESC" => SortDirection::Desc,
                other => return Err(PlanError::UnsupportedOperator(other.to_string())),
            };
            let limit = match obj.get("limit") {
                None | Some(Value::Null) => None,
                Some(v) => Some(
                    v.as_str()
                        .and_then(|s| s.parse::<usize>().ok())
                        .ok_or(PlanError::WrongType {
                            field: "limit",
                            expected: "a numeric string",
                        })?,
                ),
            };
            Ok(PlanNode::Sort {
                column,
                direction,
                limit,
                input: parse_child(obj, &refs)?,
            })
        }
        "AGGREGATE" => {
            let columns = parse_columns(obj, &refs)?;
            let group_by = columns
                .first()
                .cloned()
                .ok_or(PlanError::MissingField("selected_columns"))?;

            let agg = obj
                .get("aggregates")
                .and_then(Value::as_object)
                .ok_or(PlanError::MissingField("aggregates"))?;
            let function = match agg
                .get("function")
                .and_then(Value::as_str)
                .ok_or(PlanError::MissingField("function"))?
            {
                "COUNT" => AggFunc::Count,
                "SUM" => AggFunc::Sum,
                "AVG" => AggFunc::Avg,
                "MIN" => AggFunc::Min,
                "MAX" => AggFunc::Max,
                other => return Err(PlanError::UnsupportedAggregate(other.to_string())),
            };

            let arg = if function == AggFunc::Count {
                None
            } else {
                let index = agg
                    .get("args")
                    .and_then(Value::as_array)
                    .and_then(|a| a.first())
                    .and_then(Value::as_f64)
                    .ok_or(PlanError::MissingField("args"))? as usize;
                Some(
                    columns
                        .get(index)
                        .cloned()
                        .ok_or(PlanError::WrongType {
                            field: "args",
                            expected: "an index into selected_columns",
                        })?,
                )
            };

            Ok(PlanNode::Aggregate {
                group_by,
                function,
                arg,
                input: parse_child(obj, &refs)?,
            })
        }
        "INSERT" => {
            let table = str_field(obj, "table")?.to_string();
            let columns = parse_columns(obj, &refs)?;
            let rows_value = obj
                .get("rows")
                .and_then(Value::as_array)
                .ok_or(PlanError::MissingField("rows"))?;
            let mut rows = Vec::with_capacity(rows_value.len());
            for row in rows_value {
                let values = row.as_array().ok_or(PlanError::WrongType {
                    field: "rows",
                    expected: "a list of lists",
                })?;
                rows.push(
                    values
                        .iter()
                        .map(literal_string)
                        .collect::<Result<Vec<_>, _>>()?,
                );
            }
            Ok(PlanNode::Insert {
                table,
                columns,
                rows,
            })
        }
        "DELETE" => Ok(PlanNode::Delete {
            table: str_field(obj, "table")?.to_string(),
            column: resolve_column(str_field(obj, "column")?, &refs)?,
            value: literal_string(obj.get("value").ok_or(PlanError::MissingField("value"))?)?,
        }),
        "UPDATE" => {
            let (set_column, set_value) = parse_assignment(obj, "set", &refs)?;
            let (filter_column, filter_value) = parse_assignment(obj, "filter", &refs)?;
            Ok(PlanNode::Update {
                table: str_field(obj, "table")?.to_string(),
                set_column,
                set_value,
                filter_column,
                filter_value,
            })
        }
        other => Err(PlanError::UnsupportedOperator(other.to_string())),
    }
}

fn parse_child(
    obj: &serde_json::Map<String, Value>,
    refs: &HashMap<String, String>,
) -> Result<Box<PlanNode>, PlanError> {
    let input = obj.get("input").ok_or(PlanError::MissingField("input"))?;
    Ok(Box::new(parse_node(input, refs)?))
}

/// Column list from `selected_columns` (or `fields`), codes resolved.
fn parse_columns(
    obj: &serde_json::Map<String, Value>,
    refs: &HashMap<String, String>,
) -> Result<Vec<String>, PlanError> {
    let list = obj
        .get("selected_columns")
        .or_else(|| obj.get("fields"))
        .and_then(Value::as_array)
        .ok_or(PlanError::MissingField("selected_columns"))?;

    list.iter()
        .map(|v| {
            let s = v.as_str().ok_or(PlanError::WrongType {
                field: "selected_columns",
                expected: "a list of strings",
            })?;
            resolve_column(s, refs)
        })
        .collect()
}

fn parse_condition(value: &Value, refs: &HashMap<String, String>) -> Result<Predicate, PlanError> {
    let obj = value.as_object().ok_or(PlanError::WrongType {
        field: "condition",
        expected: "an object",
    })?;
    let kind = obj
        .get("op")
        .and_then(|op| op.get("kind"))
        .and_then(Value::as_str)
        .ok_or(PlanError::MissingField("op.kind"))?;
    let operands = obj
        .get("operands")
        .and_then(Value::as_array)
        .ok_or(PlanError::MissingField("operands"))?;

    match kind {
        "GREATER_THAN" | "LESS_THAN" | "EQUALS" => {
            let op = match kind {
                "GREATER_THAN" => CompareOp::GreaterThan,
                "LESS_THAN" => CompareOp::LessThan,
                _ => CompareOp::Equals,
            };
            let column = operand_column(operands.first(), refs)?;
            let literal = operand_literal(operands.get(1))?;
            Ok(Predicate::Compare {
                column,
                op,
                literal,
            })
        }
        "AND" => {
            let (column, low) = parse_bound(operands.first(), refs)?;
            let (_, high) = parse_bound(operands.get(1), refs)?;
            match (low, high) {
                (Literal::Int(low), Literal::Int(high)) => Ok(Predicate::Range {
                    column,
                    low,
                    high,
                }),
                _ => Err(PlanError::NonIntegerRange),
            }
        }
        other => Err(PlanError::UnsupportedOperator(other.to_string())),
    }
}

/// One side of a range AND: a nested comparison with a column operand and
/// a literal operand.
fn parse_bound(
    value: Option<&Value>,
    refs: &HashMap<String, String>,
) -> Result<(String, Literal), PlanError> {
    let obj = value
        .and_then(Value::as_object)
        .ok_or(PlanError::MissingField("operands"))?;
    let operands = obj
        .get("operands")
        .and_then(Value::as_array)
        .ok_or(PlanError::MissingField("operands"))?;
    let column = operand_column(operands.first(), refs)?;
    let literal = operand_literal(operands.get(1))?;
    Ok((column, literal))
}

fn operand_column(
    value: Option<&Value>,
    refs: &HashMap<String, String>,
) -> Result<String, PlanError> {
    let name = value
        .and_then(|v| v.get("name"))
        .and_then(Value::as_str)
        .ok_or(PlanError::MissingField("name"))?;
    resolve_column(name, refs)
}

fn operand_literal(value: Option<&Value>) -> Result<Literal, PlanError> {
    let literal = value
        .and_then(|v| v.get("literal"))
        .ok_or(PlanError::MissingField("literal"))?;
    match literal {
        Value::Number(n) => Ok(Literal::Int(number_to_int(n).ok_or(
            PlanError::WrongType {
                field: "literal",
                expected: "a number",
            },
        )?)),
        Value::String(s) => Ok(Literal::Str(strip_quotes(s))),
        _ => Err(PlanError::WrongType {
            field: "literal",
            expected: "a number or string",
        }),
    }
}

/// Wire numbers are floats; integral values are taken exactly, the rest
/// truncate.
fn number_to_int(n: &serde_json::Number) -> Option<i64> {
    n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
}

fn str_field<'a>(
    obj: &'a serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<&'a str, PlanError> {
    obj.get(name)
        .ok_or(PlanError::MissingField(name))?
        .as_str()
        .ok_or(PlanError::WrongType {
            field: name,
            expected: "a string",
        })
}

/// Resolve a `$k` reference code via the refList; plain names pass
/// through with backticks removed.
fn resolve_column(name: &str, refs: &HashMap<String, String>) -> Result<String, PlanError> {
    let cleaned = name.replace('`', "");
    if cleaned.starts_with('$') {
        return refs
            .get(&cleaned)
            .cloned()
            .ok_or(PlanError::UnknownColumnCode(cleaned));
    }
    Ok(cleaned)
}

/// Literal row/filter value as a string, surrounding quotes stripped,
/// numeric floats converted to integers.
fn literal_string(value: &Value) -> Result<String, PlanError> {
    match value {
        Value::String(s) => Ok(strip_quotes(s)),
        Value::Number(n) => Ok(number_to_int(n)
            .ok_or(PlanError::WrongType {
                field: "value",
                expected: "a number",
            })?
            .to_string()),
        _ => Err(PlanError::WrongType {
            field: "value",
            expected: "a string or number",
        }),
    }
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn parse_assignment(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
    refs: &HashMap<String, String>,
) -> Result<(String, String), PlanError> {
    let pair = obj
        .get(field)
        .and_then(Value::as_object)
        .ok_or(PlanError::MissingField(field))?;
    let column = pair
        .get("column")
        .and_then(Value::as_str)
        .ok_or(PlanError::MissingField("column"))?;
    let value = pair
        .get("value")
        .ok_or(PlanError::MissingField("value"))?;
    Ok((resolve_column(column, refs)?, literal_string(value)?))
}
