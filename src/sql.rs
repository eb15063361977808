use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBlock {
        resource_id: Ulid,
        span: Span,
        reason: BlockReason,
        notes: Option<String>,
    },
    UpdateBlock {
        id: Ulid,
        patch: BlockPatch,
    },
    DeleteBlock {
        id: Ulid,
    },
    InsertBooking {
        booking_ref: Ulid,
        resource_id: Ulid,
        span: Span,
    },
    DeleteBooking {
        booking_ref: Ulid,
    },
    SelectBlocks {
        resource_id: Ulid,
        range_start: Option<Ms>,
        range_end: Option<Ms>,
    },
    SelectBookingBlocks {
        booking_ref: Ulid,
    },
    SelectAvailability {
        resource_id: Ulid,
        window: Span,
    },
    SelectFree {
        resource_id: Ulid,
        span: Span,
    },
    SelectFreeRanges {
        resource_id: Ulid,
        window: Span,
        min_duration: Option<Ms>,
    },
    SelectSlots {
        resource_id: Ulid,
        date: NaiveDate,
        slot_minutes: Option<i64>,
        open_hour: Option<u32>,
        close_hour: Option<u32>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        /// `None` is `UNLISTEN *`.
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if trimmed.to_uppercase().starts_with("UNLISTEN ") {
        let target = trimmed[9..].trim().trim_matches(';').trim();
        let channel = match target {
            "*" => None,
            name => Some(name.to_string()),
        };
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "blocks" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("blocks", 3, values.len()));
            }
            let resource_id = parse_ulid(&values[0])?;
            let start = parse_ms(&values[1])?;
            let end = parse_ms(&values[2])?;
            let reason = if values.len() >= 4 {
                parse_reason(&values[3])?
            } else {
                BlockReason::Manual
            };
            let notes = if values.len() >= 5 {
                parse_string_or_null(&values[4])?
            } else {
                None
            };
            Ok(Command::InsertBlock {
                resource_id,
                span: Span::new(start, end),
                reason,
                notes,
            })
        }
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::InsertBooking {
                booking_ref: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                span: Span::new(parse_ms(&values[2])?, parse_ms(&values[3])?),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "blocks" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut start = None;
    let mut end = None;
    let mut patch = BlockPatch::default();
    for a in assignments {
        let col = assignment_column(a)?;
        match col.as_str() {
            "start" => start = Some(parse_ms(&a.value)?),
            "end" => end = Some(parse_ms(&a.value)?),
            "reason" => patch.reason = Some(parse_reason(&a.value)?),
            "notes" => patch.notes = Some(parse_string_or_null(&a.value)?),
            other => return Err(SqlError::Parse(format!("unknown column in SET: {other}"))),
        }
    }
    // The span is always replaced whole.
    patch.span = match (start, end) {
        (Some(s), Some(e)) => Some(Span::new(s, e)),
        (None, None) => None,
        _ => {
            return Err(SqlError::Parse(
                "start and end must be set together".into(),
            ))
        }
    };
    Ok(Command::UpdateBlock { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "blocks" => Ok(Command::DeleteBlock { id }),
        "bookings" => Ok(Command::DeleteBooking { booking_ref: id }),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "blocks" => {
            if let Some(booking_ref) = filters.booking_ref {
                return Ok(Command::SelectBookingBlocks { booking_ref });
            }
            Ok(Command::SelectBlocks {
                resource_id: filters
                    .resource_id
                    .ok_or(SqlError::MissingFilter("resource_id"))?,
                range_start: filters.start,
                range_end: filters.end,
            })
        }
        "availability" => Ok(Command::SelectAvailability {
            resource_id: filters
                .resource_id
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            window: filters.window()?,
        }),
        "free" => Ok(Command::SelectFree {
            resource_id: filters
                .resource_id
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            span: filters.window()?,
        }),
        "free_ranges" => Ok(Command::SelectFreeRanges {
            resource_id: filters
                .resource_id
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            window: filters.window()?,
            min_duration: filters.min_duration,
        }),
        "slots" => Ok(Command::SelectSlots {
            resource_id: filters
                .resource_id
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            date: filters.day.ok_or(SqlError::MissingFilter("day"))?,
            slot_minutes: filters.slot_minutes,
            open_hour: filters.open_hour,
            close_hour: filters.close_hour,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// WHERE-clause filters recognized across the pseudo-tables. Each table
/// picks the ones it needs and rejects on what is missing.
#[derive(Default)]
struct Filters {
    resource_id: Option<Ulid>,
    booking_ref: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    min_duration: Option<Ms>,
    day: Option<NaiveDate>,
    slot_minutes: Option<i64>,
    open_hour: Option<u32>,
    close_hour: Option<u32>,
}

impl Filters {
    fn window(&self) -> Result<Span, SqlError> {
        Ok(Span::new(
            self.start.ok_or(SqlError::MissingFilter("start"))?,
            self.end.ok_or(SqlError::MissingFilter("end"))?,
        ))
    }
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, f)?;
                extract_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("resource_id") => f.resource_id = Some(parse_ulid(right)?),
                Some("booking_ref") => f.booking_ref = Some(parse_ulid(right)?),
                Some("min_duration") => f.min_duration = Some(parse_i64(right)?),
                Some("day") | Some("date") => f.day = Some(parse_date(right)?),
                Some("slot_minutes") => f.slot_minutes = Some(parse_i64(right)?),
                Some("open_hour") => f.open_hour = Some(parse_u32(right)?),
                Some("close_hour") => f.close_hour = Some(parse_u32(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    f.start = Some(parse_ms(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    f.end = Some(parse_ms(right)?);
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
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
                parse_ulid(right)
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
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

/// Timestamp literal: raw unix millis, an RFC 3339 timestamp, or a bare
/// date (midnight UTC).
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad timestamp: {e}"))),
            Value::SingleQuotedString(s) => parse_ms_literal(s),
            _ => Err(SqlError::Parse(format!("expected timestamp, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_ms(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ms_literal(s: &str) -> Result<Ms, SqlError> {
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis());
    }
    Err(SqlError::Parse(format!("bad timestamp: {s}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
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
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date: {e}"))),
        _ => Err(SqlError::Parse(format!("expected date string, got {expr:?}"))),
    }
}

fn parse_reason(expr: &Expr) -> Result<BlockReason, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => BlockReason::from_tag(&s.to_lowercase())
            .ok_or_else(|| SqlError::Parse(format!("unknown reason: {s}"))),
        _ => Err(SqlError::Parse(format!("expected reason string, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        _ => Err(SqlError::Parse(format!(
            "expected string or NULL, got {expr:?}"
        ))),
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
