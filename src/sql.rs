use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::Role;
use crate::limits::DEFAULT_PAGE_SIZE;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: UserId,
        name: String,
        email: String,
    },
    /// Listed under the session user.
    InsertItem {
        id: ItemId,
        name: String,
        description: String,
        available: bool,
    },
    /// Booked by the session user.
    InsertReservation {
        item_id: ItemId,
        start: Ms,
        end: Ms,
    },
    InsertDecision {
        reservation_id: ReservationId,
        approved: bool,
    },
    InsertComment {
        item_id: ItemId,
        text: String,
    },
    SelectReservation {
        id: ReservationId,
    },
    SelectReservations {
        role: Role,
        state: String,
        page: i64,
        size: i64,
    },
    SelectItemBookings {
        item_id: ItemId,
    },
    SelectCommentEligibility {
        item_id: ItemId,
    },
    SelectComments {
        item_id: ItemId,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "users" => &["id", "name", "email"],
        "items" => &["id", "name", "description", "available"],
        "reservations" => &["item_id", "start", "end"],
        "decisions" => &["reservation_id", "approved"],
        "comments" => &["item_id", "text"],
        _ => &[],
    }
}

/// The single VALUES row of an INSERT, keyed by column name.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &'static str) -> Option<&Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table: &'static str = match table.as_str() {
        "users" => "users",
        "items" => "items",
        "reservations" => "reservations",
        "decisions" => "decisions",
        "comments" => "comments",
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = Row {
        table,
        cells: columns.into_iter().zip(values).collect(),
    };

    match table {
        "users" => Ok(Command::InsertUser {
            id: parse_ulid_expr(row.require("id")?)?,
            name: parse_string_expr(row.require("name")?)?,
            email: parse_string_expr(row.require("email")?)?,
        }),
        "items" => Ok(Command::InsertItem {
            id: parse_ulid_expr(row.require("id")?)?,
            name: parse_string_expr(row.require("name")?)?,
            description: parse_string_expr(row.require("description")?)?,
            available: row.get("available").map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "reservations" => Ok(Command::InsertReservation {
            item_id: parse_ulid_expr(row.require("item_id")?)?,
            start: parse_i64_expr(row.require("start")?)?,
            end: parse_i64_expr(row.require("end")?)?,
        }),
        "decisions" => Ok(Command::InsertDecision {
            reservation_id: parse_ulid_expr(row.require("reservation_id")?)?,
            approved: parse_bool(row.require("approved")?)?,
        }),
        _ => Ok(Command::InsertComment {
            item_id: parse_ulid_expr(row.require("item_id")?)?,
            text: parse_string_expr(row.require("text")?)?,
        }),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |name: &str| {
        filters
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, expr)| expr)
    };
    let item_id = || {
        filter("item_id")
            .ok_or(SqlError::MissingFilter("item_id"))
            .and_then(parse_ulid_expr)
    };

    match table.as_str() {
        "reservations" if filter("id").is_some() => Ok(Command::SelectReservation {
            id: filter("id").map(parse_ulid_expr).transpose()?.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "reservations" | "owner_reservations" => Ok(Command::SelectReservations {
            role: if table == "reservations" {
                Role::Booker
            } else {
                Role::Owner
            },
            state: filter("state")
                .map(parse_string_expr)
                .transpose()?
                .unwrap_or_else(|| "ALL".into()),
            page: filter("page").map(parse_i64_expr).transpose()?.unwrap_or(0),
            size: filter("size")
                .map(parse_i64_expr)
                .transpose()?
                .unwrap_or(DEFAULT_PAGE_SIZE),
        }),
        "item_bookings" => Ok(Command::SelectItemBookings { item_id: item_id()? }),
        "comment_eligibility" => Ok(Command::SelectCommentEligibility { item_id: item_id()? }),
        "comments" => Ok(Command::SelectComments { item_id: item_id()? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
/// Pseudo-tables only accept equality filters.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
