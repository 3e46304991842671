use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::AvailabilityRequest;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertProfile(SchedulingProfile),
    InsertEventType(EventType),
    UpdateEventType(EventType),
    InsertBooking {
        host_id: Ulid,
        event_type: Option<String>,
        span: Span,
        guest: Guest,
        timezone: Option<String>,
        /// Absent means "derive from the caller".
        source: Option<BookingSource>,
    },
    Reschedule {
        booking_id: Ulid,
        token: String,
        span: Span,
    },
    CancelBooking {
        booking_id: Ulid,
        token: String,
    },
    ConfirmBooking {
        booking_id: Ulid,
    },
    SelectAvailability(AvailabilityRequest),
    SelectBookings {
        host_id: Ulid,
        active_only: bool,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectEventTypes {
        host_id: Ulid,
    },
    SelectProfile {
        host_id: Ulid,
    },
    SelectRateLimit {
        endpoint: String,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
    Ping,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_ascii_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by its column name.
struct Row {
    table: &'static str,
    cols: HashMap<String, Expr>,
}

impl Row {
    fn opt(&self, col: &str) -> Option<&Expr> {
        self.cols.get(col).filter(|e| !is_null(e))
    }

    fn req(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.opt(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.req(col)?)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.req(col)?)
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.opt(col).map(parse_string_expr).transpose()
    }

    fn opt_u32(&self, col: &str) -> Result<Option<u32>, SqlError> {
        self.opt(col).map(parse_u32_expr).transpose()
    }

    fn instant(&self, col: &'static str) -> Result<Ms, SqlError> {
        parse_instant_expr(self.req(col)?)
    }

    fn span(&self) -> Result<Span, SqlError> {
        Ok(Span {
            start: self.instant("start")?,
            end: self.instant("end")?,
        })
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table: &'static str = match table.as_str() {
        "profiles" => "profiles",
        "event_types" => "event_types",
        "event_type_updates" => "event_type_updates",
        "bookings" => "bookings",
        "reschedules" => "reschedules",
        "confirmations" => "confirmations",
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = single_row(insert, table)?;

    match table {
        "profiles" => Ok(Command::UpsertProfile(parse_profile(&row)?)),
        "event_types" => Ok(Command::InsertEventType(parse_event_type(&row)?)),
        "event_type_updates" => Ok(Command::UpdateEventType(parse_event_type(&row)?)),
        "bookings" => Ok(Command::InsertBooking {
            host_id: row.ulid("host_id")?,
            event_type: row.opt_string("event_type")?,
            span: row.span()?,
            guest: Guest {
                name: row.string("guest_name")?,
                email: row.string("guest_email")?,
                phone: row.opt_string("guest_phone")?,
            },
            timezone: row.opt_string("timezone")?,
            source: row
                .opt_string("source")?
                .map(|s| s.parse().map_err(SqlError::Parse))
                .transpose()?,
        }),
        "reschedules" => Ok(Command::Reschedule {
            booking_id: row.ulid("booking_id")?,
            token: row.string("token")?,
            span: row.span()?,
        }),
        _ => Ok(Command::ConfirmBooking {
            booking_id: row.ulid("booking_id")?,
        }),
    }
}

fn parse_profile(row: &Row) -> Result<SchedulingProfile, SqlError> {
    let working_hours = WorkingHours::from_json(&row.string("working_hours")?).map_err(SqlError::Parse)?;
    let reminders = split_list(&row.opt_string("reminders")?.unwrap_or_default())
        .map(|r| {
            r.parse::<u32>()
                .map_err(|e| SqlError::Parse(format!("bad reminder '{r}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SchedulingProfile {
        host_id: row.ulid("host_id")?,
        timezone: row.string("timezone")?,
        working_hours,
        slot_minutes: row.opt_u32("slot_minutes")?.unwrap_or(30),
        buffer_minutes: row.opt_u32("buffer_minutes")?.unwrap_or(0),
        min_notice_minutes: row.opt_u32("min_notice_minutes")?.unwrap_or(0),
        calendars: split_list(&row.opt_string("calendars")?.unwrap_or_default())
            .map(str::to_string)
            .collect(),
        reminders,
    })
}

fn parse_event_type(row: &Row) -> Result<EventType, SqlError> {
    let working_hours = row
        .opt_string("working_hours")?
        .map(|s| WorkingHours::from_json(&s).map_err(SqlError::Parse))
        .transpose()?;
    Ok(EventType {
        id: row.ulid("id")?,
        host_id: row.ulid("host_id")?,
        slug: row.string("slug")?,
        title: row.opt_string("title")?,
        duration_minutes: row.opt_u32("duration_minutes")?,
        buffer_minutes: row.opt_u32("buffer_minutes")?,
        min_notice_minutes: row.opt_u32("min_notice_minutes")?,
        working_hours,
        requires_confirmation: row
            .opt("requires_confirmation")
            .map(parse_bool)
            .transpose()?
            .unwrap_or(false),
    })
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty())
}

fn single_row(insert: &ast::Insert, table: &'static str) -> Result<Row, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("{table}: column list required")));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    match rows.as_slice() {
        [] => Err(SqlError::Parse("empty VALUES".into())),
        [values] => {
            if values.len() != insert.columns.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            let cols = insert
                .columns
                .iter()
                .map(|c| c.value.to_lowercase())
                .zip(values.iter().cloned())
                .collect();
            Ok(Row { table, cols })
        }
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = equality_filters(delete.selection.as_ref())?;
    Ok(Command::CancelBooking {
        booking_id: parse_ulid_expr(filter(&filters, "id")?)?,
        token: parse_string_expr(filter(&filters, "token")?)?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    // `SELECT 1` and friends: a keepalive that also flushes pending notices
    let Some(from) = select.from.first() else {
        return Ok(Command::Ping);
    };
    let table = table_factor_name(&from.relation)?;
    let filters = equality_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability(AvailabilityRequest {
            host_id: parse_ulid_expr(filter(&filters, "host_id")?)?,
            date: parse_string_expr(filter(&filters, "date")?)?,
            timezone: filters.get("timezone").map(parse_string_expr).transpose()?,
            duration_minutes: filters.get("duration").map(parse_u32_expr).transpose()?,
            event_type: filters.get("event_type").map(parse_string_expr).transpose()?,
        })),
        "bookings" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectBooking {
                    id: parse_ulid_expr(id)?,
                });
            }
            Ok(Command::SelectBookings {
                host_id: parse_ulid_expr(filter(&filters, "host_id")?)?,
                active_only: filters
                    .get("active")
                    .map(parse_bool)
                    .transpose()?
                    .unwrap_or(false),
            })
        }
        "event_types" => Ok(Command::SelectEventTypes {
            host_id: parse_ulid_expr(filter(&filters, "host_id")?)?,
        }),
        "profiles" => Ok(Command::SelectProfile {
            host_id: parse_ulid_expr(filter(&filters, "host_id")?)?,
        }),
        "rate_limit" => Ok(Command::SelectRateLimit {
            endpoint: parse_string_expr(filter(&filters, "endpoint")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `col = value` pairs from an AND-chain.
fn equality_filters(selection: Option<&Expr>) -> Result<HashMap<String, Expr>, SqlError> {
    let mut out = HashMap::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_equalities(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.insert(col, right.as_ref().clone());
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter<'a>(filters: &'a HashMap<String, Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    filters.get(col).ok_or(SqlError::MissingFilter(col))
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
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

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Unix milliseconds, as a number or string, or an RFC 3339 string.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp '{s}': {e}")));
    }
    parse_i64_expr(expr)
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

#[derive(Debug, Error)]
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
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_upsert_profile() {
        let sql = format!(
            r#"INSERT INTO profiles (host_id, timezone, working_hours, slot_minutes, calendars, reminders)
               VALUES ('{HOST}', 'America/New_York', '{{"mon": ["09:00-12:00", "13:00-17:00"]}}', 45, 'work, personal', '1440,60')"#
        );
        let Command::UpsertProfile(p) = parse_sql(&sql).unwrap() else {
            panic!("expected UpsertProfile");
        };
        assert_eq!(p.host_id.to_string(), HOST);
        assert_eq!(p.timezone, "America/New_York");
        assert_eq!(p.slot_minutes, 45);
        assert_eq!(p.buffer_minutes, 0);
        assert_eq!(p.calendars, vec!["work", "personal"]);
        assert_eq!(p.reminders, vec![1440, 60]);
        assert_eq!(p.working_hours.blocks_for(DayOfWeek::Mon).len(), 2);
        assert!(p.working_hours.blocks_for(DayOfWeek::Tue).is_empty());
    }

    #[test]
    fn parse_insert_booking_with_rfc3339() {
        let sql = format!(
            r#"INSERT INTO bookings (host_id, start, "end", guest_name, guest_email, source)
               VALUES ('{HOST}', '2025-06-02T13:00:00Z', 1748870999999, 'Ada', 'ada@example.com', 'agent')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking {
                span,
                guest,
                source,
                timezone,
                event_type,
                ..
            } => {
                assert_eq!(span.start, 1_748_869_200_000);
                assert_eq!(span.end, 1_748_870_999_999);
                assert_eq!(guest.email, "ada@example.com");
                assert_eq!(guest.phone, None);
                assert_eq!(source, Some(BookingSource::AutomatedAgent));
                assert_eq!(timezone, None);
                assert_eq!(event_type, None);
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn insert_booking_needs_guest_email() {
        let sql = format!(
            r#"INSERT INTO bookings (host_id, start, "end", guest_name) VALUES ('{HOST}', 1, 2, 'Ada')"#
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("bookings", "guest_email"))
        ));
    }

    #[test]
    fn insert_requires_column_list() {
        let sql = format!("INSERT INTO confirmations VALUES ('{HOST}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_reschedule_and_confirm() {
        let sql = format!(
            r#"INSERT INTO reschedules (booking_id, token, start, "end") VALUES ('{HOST}', 'abc.def', 1000, 2000)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Reschedule {
                booking_id: Ulid::from_string(HOST).unwrap(),
                token: "abc.def".into(),
                span: Span::new(1000, 2000),
            }
        );

        let sql = format!("INSERT INTO confirmations (booking_id) VALUES ('{HOST}')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::ConfirmBooking { .. }));
    }

    #[test]
    fn parse_event_type_insert_and_update() {
        let sql = format!(
            r#"INSERT INTO event_types (id, host_id, slug, duration_minutes, requires_confirmation)
               VALUES ('{HOST}', '{HOST}', 'intro', 45, true)"#
        );
        let Command::InsertEventType(et) = parse_sql(&sql).unwrap() else {
            panic!("expected InsertEventType");
        };
        assert_eq!(et.slug, "intro");
        assert_eq!(et.duration_minutes, Some(45));
        assert_eq!(et.buffer_minutes, None);
        assert!(et.requires_confirmation);

        let sql = format!(
            r#"INSERT INTO event_type_updates (id, host_id, slug, title, buffer_minutes) VALUES ('{HOST}', '{HOST}', 'intro', NULL, 10)"#
        );
        let Command::UpdateEventType(et) = parse_sql(&sql).unwrap() else {
            panic!("expected UpdateEventType");
        };
        assert_eq!(et.title, None);
        assert_eq!(et.buffer_minutes, Some(10));
    }

    #[test]
    fn parse_cancel() {
        let sql = format!("DELETE FROM bookings WHERE id = '{HOST}' AND token = 'tok'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelBooking {
                booking_id: Ulid::from_string(HOST).unwrap(),
                token: "tok".into(),
            }
        );
        let sql = format!("DELETE FROM bookings WHERE id = '{HOST}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("token"))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE host_id = '{HOST}' AND date = '2025-06-02' AND timezone = 'Europe/Berlin' AND duration = 60"
        );
        let Command::SelectAvailability(req) = parse_sql(&sql).unwrap() else {
            panic!("expected SelectAvailability");
        };
        assert_eq!(req.date, "2025-06-02");
        assert_eq!(req.timezone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(req.duration_minutes, Some(60));
        assert_eq!(req.event_type, None);

        let sql = format!("SELECT * FROM availability WHERE host_id = '{HOST}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_select_bookings() {
        let sql = format!("SELECT * FROM bookings WHERE host_id = '{HOST}' AND active = true");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                active_only: true,
                ..
            }
        ));
        let sql = format!("SELECT * FROM bookings WHERE id = '{HOST}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectBooking { .. }));
        let sql = format!("SELECT * FROM event_types WHERE host_id = '{HOST}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectEventTypes { .. }));
        let sql = "SELECT * FROM rate_limit WHERE endpoint = 'availability'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectRateLimit {
                endpoint: "availability".into()
            }
        );
    }

    #[test]
    fn parse_listen_unlisten() {
        let sql = format!("LISTEN host_{HOST};");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Listen {
                channel: format!("host_{HOST}")
            }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
        assert!(matches!(parse_sql("unlisten host_x").unwrap(), Command::Unlisten { .. }));
        assert_eq!(parse_sql("SELECT 1").unwrap(), Command::Ping);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO resources (id) VALUES ('{HOST}')")),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE host_id > 'x'"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO bookings (host_id, start, \"end\", guest_name, guest_email) VALUES ('nope', 1, 2, 'a', 'b')"),
            Err(SqlError::Parse(_))
        ));
    }
}
