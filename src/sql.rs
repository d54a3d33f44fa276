use std::collections::HashMap;

use chrono::NaiveDateTime;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent {
        id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        description: Option<String>,
    },
    UpdateEvent {
        id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        description: Option<String>,
    },
    DeleteEvent {
        id: Ulid,
    },
    InsertResource {
        id: Ulid,
        name: String,
        kind: String,
    },
    UpdateResource {
        id: Ulid,
        name: String,
        kind: String,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertAllocation {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
    },
    BatchInsertAllocations {
        allocations: Vec<Allocation>,
    },
    UpdateAllocation {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
    },
    DeleteAllocation {
        id: Ulid,
    },
    SelectEvents {
        from: Option<Ms>,
    },
    SelectResources,
    SelectAllocations,
    SelectConflicts,
    SelectReport,
    SelectDashboard,
}

const EVENT_COLUMNS: &[&str] = &["id", "title", "start", "end", "description"];
const RESOURCE_COLUMNS: &[&str] = &["id", "name", "kind"];
const ALLOCATION_COLUMNS: &[&str] = &["id", "event_id", "resource_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let columns = &insert.columns;

    match table.as_str() {
        "events" => {
            let row = single_row(&rows, "events")?;
            let cols = bind_columns(columns, row, EVENT_COLUMNS, "events")?;
            Ok(Command::InsertEvent {
                id: parse_ulid(required(&cols, "id")?)?,
                title: parse_string(required(&cols, "title")?)?,
                start: parse_time(required(&cols, "start")?)?,
                end: parse_time(required(&cols, "end")?)?,
                description: optional(&cols, "description", parse_string_or_null)?,
            })
        }
        "resources" => {
            let row = single_row(&rows, "resources")?;
            let cols = bind_columns(columns, row, RESOURCE_COLUMNS, "resources")?;
            Ok(Command::InsertResource {
                id: parse_ulid(required(&cols, "id")?)?,
                name: parse_string(required(&cols, "name")?)?,
                kind: parse_string(required(&cols, "kind")?)?,
            })
        }
        "allocations" => {
            let mut allocations = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let alloc = parse_allocation_row(columns, row)
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                allocations.push(alloc);
            }
            if let [alloc] = allocations.as_slice() {
                Ok(Command::InsertAllocation {
                    id: alloc.id,
                    event_id: alloc.event_id,
                    resource_id: alloc.resource_id,
                })
            } else {
                Ok(Command::BatchInsertAllocations { allocations })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_allocation_row(columns: &[Ident], row: &[Expr]) -> Result<Allocation, SqlError> {
    let cols = bind_columns(columns, row, ALLOCATION_COLUMNS, "allocations")?;
    Ok(Allocation {
        id: parse_ulid(required(&cols, "id")?)?,
        event_id: parse_ulid(required(&cols, "event_id")?)?,
        resource_id: parse_ulid(required(&cols, "resource_id")?)?,
    })
}

/// UPDATE replaces the whole row: every required column must be assigned.
fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut cols: HashMap<String, &Expr> = HashMap::new();
    for assignment in assignments {
        let name = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        if name == "id" {
            return Err(SqlError::Unsupported("changing id".into()));
        }
        cols.insert(name, &assignment.value);
    }

    match table.as_str() {
        "events" => Ok(Command::UpdateEvent {
            id,
            title: parse_string(required(&cols, "title")?)?,
            start: parse_time(required(&cols, "start")?)?,
            end: parse_time(required(&cols, "end")?)?,
            description: optional(&cols, "description", parse_string_or_null)?,
        }),
        "resources" => Ok(Command::UpdateResource {
            id,
            name: parse_string(required(&cols, "name")?)?,
            kind: parse_string(required(&cols, "kind")?)?,
        }),
        "allocations" => Ok(Command::UpdateAllocation {
            id,
            event_id: parse_ulid(required(&cols, "event_id")?)?,
            resource_id: parse_ulid(required(&cols, "resource_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "events" => Ok(Command::DeleteEvent { id }),
        "resources" => Ok(Command::DeleteResource { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    if table != "events" && select.selection.is_some() {
        return Err(SqlError::Unsupported(format!("WHERE on {table}")));
    }

    match table.as_str() {
        "events" => {
            let mut from = None;
            if let Some(selection) = &select.selection {
                extract_start_filter(selection, &mut from)?;
            }
            Ok(Command::SelectEvents { from })
        }
        "resources" => Ok(Command::SelectResources),
        "allocations" => Ok(Command::SelectAllocations),
        "conflicts" => Ok(Command::SelectConflicts),
        "report" => Ok(Command::SelectReport),
        "dashboard" => Ok(Command::SelectDashboard),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Accepts `start >= <time>`, alone or in an AND chain. Anything else is
/// rejected rather than ignored.
fn extract_start_filter(expr: &Expr, from: &mut Option<Ms>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_start_filter(inner, from),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_start_filter(left, from)?;
            extract_start_filter(right, from)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::GtEq,
            right,
        } if expr_column_name(left).as_deref() == Some("start") => {
            let t = parse_time(right)?;
            *from = Some(from.map_or(t, |prev| prev.max(t)));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE clause on events: {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Map a VALUES row onto column names. Without an explicit column list the
/// values are taken positionally in `default_order`.
fn bind_columns<'a>(
    columns: &[Ident],
    row: &'a [Expr],
    default_order: &[&str],
    table: &'static str,
) -> Result<HashMap<String, &'a Expr>, SqlError> {
    if columns.is_empty() {
        if row.len() > default_order.len() {
            return Err(SqlError::WrongArity(table, default_order.len(), row.len()));
        }
        return Ok(default_order
            .iter()
            .map(|c| c.to_string())
            .zip(row.iter())
            .collect());
    }
    if columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    let mut cols = HashMap::with_capacity(columns.len());
    for (ident, expr) in columns.iter().zip(row.iter()) {
        let name = ident.value.to_lowercase();
        if !default_order.contains(&name.as_str()) {
            return Err(SqlError::UnknownColumn(table, name));
        }
        cols.insert(name, expr);
    }
    Ok(cols)
}

fn required<'a>(cols: &HashMap<String, &'a Expr>, name: &'static str) -> Result<&'a Expr, SqlError> {
    cols.get(name).copied().ok_or(SqlError::MissingColumn(name))
}

fn optional<T>(
    cols: &HashMap<String, &Expr>,
    name: &str,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    match cols.get(name) {
        Some(expr) => parse(expr),
        None => Ok(None),
    }
}

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

/// Datetime formats accepted in string literals, interpreted as UTC.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
];

fn parse_datetime_ms(s: &str) -> Option<Ms> {
    DATETIME_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .map(|dt| dt.and_utc().timestamp_millis())
    })
}

/// A time is Unix milliseconds, either bare or quoted, or a quoted
/// `YYYY-MM-DDTHH:MM[:SS]` datetime.
fn parse_time(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_time(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("timestamp out of range".into()));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad timestamp: {e}"))),
        Some(Value::SingleQuotedString(s)) => s
            .parse()
            .ok()
            .or_else(|| parse_datetime_ms(s))
            .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}"))),
        Some(value) => Err(SqlError::Parse(format!("expected time, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
