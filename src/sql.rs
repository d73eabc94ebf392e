use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLot {
        id: Ulid,
        name: String,
        address: String,
        open_minute: u16,
        close_minute: u16,
    },
    DeleteLot {
        id: Ulid,
    },
    InsertSpot {
        id: Ulid,
        lot_id: Ulid,
        spot_number: String,
        kind: SpotKind,
        is_active: bool,
    },
    DeleteSpot {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        email: String,
        first_name: String,
        last_name: String,
        phone: Option<String>,
    },
    InsertReservation {
        id: Ulid,
        user_id: Ulid,
        spot_id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// Cancels the reservation (status transition); rows are never removed.
    DeleteReservation {
        id: Ulid,
    },
    SelectLots,
    SelectSpots {
        lot_id: Ulid,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectUpcoming {
        user_id: Ulid,
    },
    SelectAvailability {
        start: Ms,
        end: Ms,
        lot_id: Option<Ulid>,
        page: usize,
        limit: usize,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "lots" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("lots", 3, values.len()));
            }
            let open_minute = if values.len() >= 4 {
                parse_time_of_day(&values[3])?
            } else {
                0
            };
            let close_minute = if values.len() >= 5 {
                parse_time_of_day(&values[4])?
            } else {
                23 * 60 + 59
            };
            Ok(Command::InsertLot {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                address: parse_string(&values[2])?,
                open_minute,
                close_minute,
            })
        }
        "spots" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("spots", 3, values.len()));
            }
            let kind = if values.len() >= 4 {
                let s = parse_string(&values[3])?;
                SpotKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad spot type: {s}")))?
            } else {
                SpotKind::Regular
            };
            let is_active = if values.len() >= 5 {
                parse_bool(&values[4])?
            } else {
                true
            };
            Ok(Command::InsertSpot {
                id: parse_ulid(&values[0])?,
                lot_id: parse_ulid(&values[1])?,
                spot_number: parse_string(&values[2])?,
                kind,
                is_active,
            })
        }
        "users" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("users", 4, values.len()));
            }
            let phone = if values.len() >= 5 {
                parse_string_or_null(&values[4])?
            } else {
                None
            };
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                email: parse_string(&values[1])?,
                first_name: parse_string(&values[2])?,
                last_name: parse_string(&values[3])?,
                phone,
            })
        }
        "reservations" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("reservations", 5, values.len()));
            }
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                user_id: parse_ulid(&values[1])?,
                spot_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "lots" => Ok(Command::DeleteLot { id }),
        "spots" => Ok(Command::DeleteSpot { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        // Users are never deleted by this core
        "users" => Err(SqlError::Unsupported("DELETE FROM users".into())),
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

    match table.as_str() {
        "lots" => Ok(Command::SelectLots),
        "spots" => {
            let mut lot_id = None;
            if let Some(selection) = &select.selection {
                extract_eq_filter(selection, "lot_id", &mut |e| {
                    lot_id = Some(parse_ulid_expr(e)?);
                    Ok(())
                })?;
            }
            Ok(Command::SelectSpots {
                lot_id: lot_id.ok_or(SqlError::MissingFilter("lot_id"))?,
            })
        }
        "reservations" => {
            let id = extract_where_id(&select.selection)?;
            Ok(Command::SelectReservation { id })
        }
        "upcoming" => {
            let mut user_id = None;
            if let Some(selection) = &select.selection {
                extract_eq_filter(selection, "user_id", &mut |e| {
                    user_id = Some(parse_ulid_expr(e)?);
                    Ok(())
                })?;
            }
            Ok(Command::SelectUpcoming {
                user_id: user_id.ok_or(SqlError::MissingFilter("user_id"))?,
            })
        }
        "availability" => {
            let (mut start, mut end, mut lot_id) = (None, None, None);
            let (mut page, mut limit) = (1usize, 0usize);
            if let Some(selection) = &select.selection {
                extract_availability_filters(
                    selection, &mut start, &mut end, &mut lot_id, &mut page, &mut limit,
                )?;
            }
            Ok(Command::SelectAvailability {
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                lot_id,
                page,
                limit,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_availability_filters(
    expr: &Expr,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
    lot_id: &mut Option<Ulid>,
    page: &mut usize,
    limit: &mut usize,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, start, end, lot_id, page, limit)?;
                extract_availability_filters(right, start, end, lot_id, page, limit)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                match col.as_deref() {
                    Some("lot_id") => *lot_id = Some(parse_ulid_expr(right)?),
                    Some("page") => *page = parse_usize_expr(right)?,
                    Some("limit") => *limit = parse_usize_expr(right)?,
                    _ => {}
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Walk ANDed equality predicates calling `f` on the value bound to `column`.
fn extract_eq_filter(
    expr: &Expr,
    column: &str,
    f: &mut impl FnMut(&Expr) -> Result<(), SqlError>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_eq_filter(left, column, f)?;
                extract_eq_filter(right, column, f)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some(column) {
                    f(right)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_expr(expr)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// 'HH:MM' → minutes since midnight.
fn parse_time_of_day(expr: &Expr) -> Result<u16, SqlError> {
    let s = parse_string_expr(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time of day: {s}")))
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
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
