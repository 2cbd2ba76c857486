use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{NewField, NewMessage, NewReservation, NewUser};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser(NewUser),
    Authenticate {
        email: String,
        password: String,
    },
    InsertField(NewField),
    UpdateField {
        id: Ulid,
        patch: FieldPatch,
    },
    DeleteField {
        id: Ulid,
    },
    SelectFields {
        id: Option<Ulid>,
    },
    SelectAvailability {
        field_id: Option<Ulid>,
        date: Option<NaiveDate>,
    },
    SelectAvailabilitySummary {
        field_id: Option<Ulid>,
        date: Option<NaiveDate>,
    },
    InsertReservation(NewReservation),
    CancelReservation {
        id: Ulid,
        user_id: Ulid,
    },
    /// `None` lists every reservation.
    SelectReservations {
        user_id: Option<Ulid>,
    },
    InsertMessage(NewMessage),
    SelectMessages,
    DeleteMessage {
        id: Ulid,
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

impl Command {
    /// Statements only the admin login may run.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::InsertField(_)
                | Command::UpdateField { .. }
                | Command::DeleteField { .. }
                | Command::SelectReservations { user_id: None }
                | Command::SelectMessages
                | Command::DeleteMessage { .. }
                | Command::Listen { .. }
                | Command::Unlisten { .. }
                | Command::UnlistenAll
        )
    }
}

// Column order used when an INSERT omits its column list.
const USER_COLUMNS: &[&str] = &["id", "name", "email", "password", "phone"];
const FIELD_COLUMNS: &[&str] = &["id", "name", "surface_type", "price", "available_hours", "image", "location"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "field_id",
    "date",
    "start_time",
    "end_time",
    "user_name",
    "user_email",
    "user_phone",
    "payment_method",
];
const MESSAGE_COLUMNS: &[&str] = &["id", "name", "email", "phone", "subject", "body", "user_id"];

fn table_columns(table: &str) -> Option<&'static [&'static str]> {
    match table {
        "users" => Some(USER_COLUMNS),
        "fields" => Some(FIELD_COLUMNS),
        "reservations" => Some(RESERVATION_COLUMNS),
        "messages" => Some(MESSAGE_COLUMNS),
        _ => None,
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if let Some(cmd) = parse_session_command(trimmed) {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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

/// LISTEN / UNLISTEN / the `SELECT 1` keepalive, matched before the SQL parser.
fn parse_session_command(sql: &str) -> Option<Command> {
    let mut words = sql.split_whitespace();
    let first = words.next()?.to_uppercase();
    let rest: Vec<&str> = words.collect();
    let channel = || rest.first().map(|c| c.trim_matches('"').to_lowercase());

    match (first.as_str(), rest.len()) {
        ("LISTEN", 1) => channel().map(|channel| Command::Listen { channel }),
        ("UNLISTEN", 1) if rest[0] == "*" => Some(Command::UnlistenAll),
        ("UNLISTEN", 1) => channel().map(|channel| Command::Unlisten { channel }),
        ("SELECT", 1) if rest[0] == "1" => Some(Command::Ping),
        _ => None,
    }
}

/// Table a SELECT reads from, used to describe result columns without
/// binding parameters. `SELECT 1` reports as `"?column?"`.
pub fn result_table(sql: &str) -> Option<String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if matches!(parse_session_command(trimmed), Some(Command::Ping)) {
        return Some("?column?".into());
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if !words.first()?.eq_ignore_ascii_case("select") {
        return None;
    }
    let from = words.iter().position(|w| w.eq_ignore_ascii_case("from"))?;
    let table = words.get(from + 1)?;
    Some(table.trim_matches(|c| c == '"' || c == ';').to_lowercase())
}

// ── INSERT ────────────────────────────────────────────────────

/// One INSERT row keyed by column name. NULL is stored as `None`.
struct Row {
    values: HashMap<String, Option<String>>,
}

impl Row {
    fn from_insert(table: &str, insert: &ast::Insert) -> Result<Self, SqlError> {
        let known = table_columns(table).ok_or_else(|| SqlError::UnknownTable(table.to_string()))?;
        let exprs = extract_insert_values(insert)?;

        let columns: Vec<String> = if insert.columns.is_empty() {
            known.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if exprs.len() != columns.len() {
            return Err(SqlError::WrongArity(known_name(table), columns.len(), exprs.len()));
        }

        let mut values = HashMap::with_capacity(columns.len());
        for (column, expr) in columns.into_iter().zip(exprs.iter()) {
            if !known.contains(&column.as_str()) {
                return Err(SqlError::UnknownColumn(column));
            }
            values.insert(column, expr_text(expr)?);
        }
        Ok(Self { values })
    }

    fn text(&self, column: &'static str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }

    fn required(&self, column: &'static str) -> Result<String, SqlError> {
        self.text(column)
            .map(str::to_string)
            .ok_or(SqlError::MissingColumn(column))
    }

    fn optional(&self, column: &'static str) -> String {
        self.text(column).unwrap_or_default().to_string()
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_text(column, &self.required(column)?)
    }

    fn optional_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        match self.text(column).map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse_ulid_text(column, s).map(Some),
        }
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        let s = self.required(column)?;
        parse_date(&s).ok_or_else(|| SqlError::invalid(column, &s, "a YYYY-MM-DD date"))
    }

    fn clock(&self, column: &'static str) -> Result<NaiveTime, SqlError> {
        let s = self.required(column)?;
        parse_clock_text(column, &s)
    }

    fn optional_clock(&self, column: &'static str) -> Result<Option<NaiveTime>, SqlError> {
        match self.text(column).map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse_clock_text(column, s).map(Some),
        }
    }
}

/// Static name for arity errors.
fn known_name(table: &str) -> &'static str {
    match table {
        "users" => "users",
        "fields" => "fields",
        "reservations" => "reservations",
        _ => "messages",
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = Row::from_insert(&table, insert)?;

    match table.as_str() {
        "users" => Ok(Command::RegisterUser(NewUser {
            id: row.ulid("id")?,
            name: row.required("name")?,
            email: row.required("email")?,
            password: row.required("password")?,
            phone: row.required("phone")?,
        })),
        "fields" => Ok(Command::InsertField(NewField {
            id: row.ulid("id")?,
            name: row.required("name")?,
            surface_type: row.required("surface_type")?,
            price: parse_price(&row.optional("price"))?,
            available_hours: parse_hours(&row.optional("available_hours"))?,
            image: row.optional("image"),
            location: row.optional("location"),
        })),
        "reservations" => Ok(Command::InsertReservation(NewReservation {
            id: row.ulid("id")?,
            user_id: row.ulid("user_id")?,
            field_id: row.ulid("field_id")?,
            date: row.date("date")?,
            start_time: row.clock("start_time")?,
            end_time: row.optional_clock("end_time")?,
            user_name: row.required("user_name")?,
            user_email: row.required("user_email")?,
            user_phone: row.required("user_phone")?,
            payment_method: match row.text("payment_method").map(str::trim) {
                None | Some("") => PaymentMethod::default(),
                Some(s) => PaymentMethod::parse(s)
                    .ok_or_else(|| SqlError::invalid("payment_method", s, "'transfer' or 'card'"))?,
            },
        })),
        "messages" => Ok(Command::InsertMessage(NewMessage {
            id: row.ulid("id")?,
            name: row.required("name")?,
            email: row.required("email")?,
            phone: row.optional("phone"),
            subject: row.required("subject")?,
            body: row.required("body")?,
            user_id: row.optional_ulid("user_id")?,
        })),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.insert(column, expr_text(&assignment.value)?);
    }
    let filters = where_filters(selection)?;

    match table.as_str() {
        "fields" => {
            let id = filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?;
            filters.only(&["id"])?;
            let mut patch = FieldPatch::default();
            for (column, value) in set {
                let value = value.unwrap_or_default();
                match column.as_str() {
                    "name" => patch.name = Some(value),
                    "surface_type" => patch.surface_type = Some(value),
                    "price" => patch.price = Some(parse_price(&value)?),
                    "available_hours" => patch.available_hours = Some(parse_hours(&value)?),
                    "image" => patch.image = Some(value),
                    "location" => patch.location = Some(value),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateField { id, patch })
        }
        "reservations" => {
            let status = set
                .get("status")
                .cloned()
                .flatten()
                .ok_or(SqlError::MissingColumn("status"))?;
            if set.len() != 1 || ReservationStatus::parse(&status) != Some(ReservationStatus::Cancelled) {
                return Err(SqlError::Unsupported(
                    "reservations only support SET status = 'cancelled'".into(),
                ));
            }
            filters.only(&["id", "user_id"])?;
            Ok(Command::CancelReservation {
                id: filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?,
                user_id: filters.ulid("user_id")?.ok_or(SqlError::MissingFilter("user_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;
    filters.only(&["id"])?;
    let id = filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "fields" => Ok(Command::DeleteField { id }),
        "messages" => Ok(Command::DeleteMessage { id }),
        "reservations" => Err(SqlError::Unsupported(
            "reservations are never deleted; cancel with UPDATE reservations SET status = 'cancelled'".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "users" => {
            filters.only(&["email", "password"])?;
            Ok(Command::Authenticate {
                email: filters.text("email").ok_or(SqlError::MissingFilter("email"))?,
                password: filters.text("password").ok_or(SqlError::MissingFilter("password"))?,
            })
        }
        "fields" => {
            filters.only(&["id"])?;
            Ok(Command::SelectFields {
                id: filters.ulid("id")?,
            })
        }
        "availability" | "availability_summary" => {
            filters.only(&["field_id", "date"])?;
            let field_id = filters.ulid("field_id")?;
            let date = match filters.text("date") {
                Some(s) => Some(parse_date(&s).ok_or_else(|| SqlError::invalid("date", &s, "a YYYY-MM-DD date"))?),
                None => None,
            };
            if table == "availability" {
                Ok(Command::SelectAvailability { field_id, date })
            } else {
                Ok(Command::SelectAvailabilitySummary { field_id, date })
            }
        }
        "reservations" => {
            filters.only(&["user_id"])?;
            Ok(Command::SelectReservations {
                user_id: filters.ulid("user_id")?,
            })
        }
        "messages" => {
            filters.only(&[])?;
            Ok(Command::SelectMessages)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` conditions joined by AND.
struct Filters {
    eq: HashMap<String, Option<String>>,
}

impl Filters {
    fn text(&self, column: &str) -> Option<String> {
        self.eq.get(column).cloned().flatten()
    }

    fn ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.text(column).map(|s| parse_ulid_text(column, &s)).transpose()
    }

    /// Reject filters on any other column.
    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.eq.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(unknown) => Err(SqlError::UnknownColumn(unknown.clone())),
            None => Ok(()),
        }
    }
}

fn where_filters(selection: &Option<Expr>) -> Result<Filters, SqlError> {
    let mut eq = HashMap::new();
    if let Some(expr) = selection {
        collect_eq(expr, &mut eq)?;
    }
    Ok(Filters { eq })
}

fn collect_eq(expr: &Expr, out: &mut HashMap<String, Option<String>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq(left, out)?;
            collect_eq(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(column, expr_text(right)?);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!(
            "WHERE supports only col = value joined by AND, got {other}"
        ))),
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
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
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

/// A literal as text. Numbers and booleans keep their SQL spelling; NULL is `None`.
fn expr_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s)
            | Value::DoubleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            Value::Placeholder(p) => Err(SqlError::Parse(format!("unbound parameter {p}"))),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match expr_text(expr)? {
            Some(s) => Ok(Some(format!("-{s}"))),
            None => Err(SqlError::Parse("cannot negate NULL".into())),
        },
        Expr::Cast { expr, .. } | Expr::Nested(expr) => expr_text(expr),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn parse_ulid_text(column: &'static str, s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|_| SqlError::invalid(column, s, "a ULID"))
}

fn parse_clock_text(column: &'static str, s: &str) -> Result<NaiveTime, SqlError> {
    parse_clock(s).ok_or_else(|| SqlError::invalid(column, s, "an HH:MM time"))
}

fn parse_price(s: &str) -> Result<i64, SqlError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    s.parse().map_err(|_| SqlError::invalid("price", s, "a whole number"))
}

fn parse_hours(s: &str) -> Result<Vec<HourWindow>, SqlError> {
    HourWindow::parse_list(s).ok_or_else(|| SqlError::invalid("available_hours", s, "HH:MM-HH:MM[,HH:MM-HH:MM...]"))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    InvalidValue {
        column: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl SqlError {
    fn invalid(column: &'static str, value: &str, expected: &'static str) -> Self {
        SqlError::InvalidValue {
            column,
            value: value.to_string(),
            expected,
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => write!(f, "{t}: expected {expected} values, got {got}"),
            SqlError::MissingColumn(c) => write!(f, "missing required value: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue { column, value, expected } => {
                write!(f, "invalid {column} {value:?}: expected {expected}")
            }
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn other() -> Ulid {
        Ulid::from_string(OTHER).unwrap()
    }

    #[test]
    fn parse_register_user() {
        let sql = format!(
            "INSERT INTO users (id, name, email, password, phone) VALUES ('{ID}', 'Ana', 'ana@example.com', 's3cret', '+56 9 1234')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::RegisterUser(NewUser {
                id: id(),
                name: "Ana".into(),
                email: "ana@example.com".into(),
                password: "s3cret".into(),
                phone: "+56 9 1234".into(),
            })
        );
        assert!(!cmd.requires_admin());
    }

    #[test]
    fn insert_columns_matched_by_name() {
        let sql = format!(
            "INSERT INTO users (phone, password, email, name, id) VALUES ('1', 'pw', 'a@b.c', 'Ana', '{ID}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::RegisterUser(u) => {
                assert_eq!(u.id, id());
                assert_eq!(u.name, "Ana");
                assert_eq!(u.phone, "1");
            }
            other => panic!("expected RegisterUser, got {other:?}"),
        }
    }

    #[test]
    fn insert_without_column_list_is_positional() {
        let sql = format!("INSERT INTO users VALUES ('{ID}', 'Ana', 'a@b.c', 'pw', '1')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::RegisterUser(_)));
    }

    #[test]
    fn insert_arity_and_unknown_column() {
        let sql = format!("INSERT INTO users (id, name) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("users", 2, 1))));
        let sql = format!("INSERT INTO users (id, nickname) VALUES ('{ID}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "nickname"));
    }

    #[test]
    fn parse_insert_field() {
        let sql = format!(
            "INSERT INTO fields (id, name, surface_type, price, available_hours, image, location) \
             VALUES ('{ID}', 'Central', 'synthetic', 25000, '17:00-20:00,21:00-23:00', 'central.jpg', 'Av. 1')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertField(f) => {
                assert_eq!(f.name, "Central");
                assert_eq!(f.price, 25_000);
                assert_eq!(f.available_hours.len(), 2);
                assert_eq!(f.image, "central.jpg");
            }
            other => panic!("expected InsertField, got {other:?}"),
        }
    }

    #[test]
    fn insert_field_optional_columns_default() {
        let sql = format!("INSERT INTO fields (id, name, surface_type) VALUES ('{ID}', 'Sur', 'grass')");
        match parse_sql(&sql).unwrap() {
            Command::InsertField(f) => {
                assert_eq!(f.price, 0);
                assert!(f.available_hours.is_empty());
                assert_eq!(f.location, "");
            }
            other => panic!("expected InsertField, got {other:?}"),
        }
        let bad = format!("INSERT INTO fields (id, name, surface_type, available_hours) VALUES ('{ID}', 'Sur', 'grass', '9-5')");
        assert!(matches!(
            parse_sql(&bad),
            Err(SqlError::InvalidValue { column: "available_hours", .. })
        ));
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            "INSERT INTO reservations (id, user_id, field_id, date, start_time, end_time, user_name, user_email, user_phone, payment_method) \
             VALUES ('{ID}', '{OTHER}', '{OTHER}', '2025-06-10', '18:00', '19:00', 'Ana', 'ana@example.com', '123', 'card')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation(r) => {
                assert_eq!(r.id, id());
                assert_eq!(r.user_id, other());
                assert_eq!(r.date, parse_date("2025-06-10").unwrap());
                assert_eq!(r.start_time, parse_clock("18:00").unwrap());
                assert_eq!(r.end_time, parse_clock("19:00"));
                assert_eq!(r.payment_method, PaymentMethod::Card);
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn reservation_defaults_and_bad_values() {
        let sql = format!(
            "INSERT INTO reservations (id, user_id, field_id, date, start_time, user_name, user_email, user_phone) \
             VALUES ('{ID}', '{OTHER}', '{OTHER}', '2025-06-10', '18:00', 'Ana', 'a@b.c', '1')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation(r) => {
                assert_eq!(r.end_time, None);
                assert_eq!(r.payment_method, PaymentMethod::Transfer);
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }

        let bad_date = sql.replace("2025-06-10", "10/06/2025");
        assert!(matches!(
            parse_sql(&bad_date),
            Err(SqlError::InvalidValue { column: "date", .. })
        ));
        let bad_time = sql.replace("'18:00'", "'evening'");
        assert!(matches!(
            parse_sql(&bad_time),
            Err(SqlError::InvalidValue { column: "start_time", .. })
        ));
        let null_name = sql.replace("'Ana'", "NULL");
        assert!(matches!(parse_sql(&null_name), Err(SqlError::MissingColumn("user_name"))));
    }

    #[test]
    fn parse_insert_message() {
        let sql = format!(
            "INSERT INTO messages (id, name, email, subject, body) VALUES ('{ID}', 'Ana', 'a@b.c', 'Hola', 'Consulta')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertMessage(m) => {
                assert_eq!(m.phone, "");
                assert_eq!(m.user_id, None);
            }
            other => panic!("expected InsertMessage, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_field() {
        let sql = format!("UPDATE fields SET price = 30000, location = 'Av. 2' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::UpdateField {
                id: id(),
                patch: FieldPatch {
                    price: Some(30_000),
                    location: Some("Av. 2".into()),
                    ..Default::default()
                },
            }
        );
        assert!(cmd.requires_admin());
        assert!(matches!(
            parse_sql("UPDATE fields SET price = 1"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_cancel_reservation() {
        let sql = format!("UPDATE reservations SET status = 'cancelled' WHERE id = '{ID}' AND user_id = '{OTHER}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelReservation {
                id: id(),
                user_id: other()
            }
        );
        let confirm = format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{ID}' AND user_id = '{OTHER}'");
        assert!(matches!(parse_sql(&confirm), Err(SqlError::Unsupported(_))));
        let no_owner = format!("UPDATE reservations SET status = 'cancelled' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&no_owner), Err(SqlError::MissingFilter("user_id"))));
    }

    #[test]
    fn parse_deletes() {
        assert_eq!(
            parse_sql(&format!("DELETE FROM fields WHERE id = '{ID}'")).unwrap(),
            Command::DeleteField { id: id() }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM messages WHERE id = '{ID}'")).unwrap(),
            Command::DeleteMessage { id: id() }
        );
        assert!(matches!(
            parse_sql(&format!("DELETE FROM reservations WHERE id = '{ID}'")),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_authenticate() {
        let cmd = parse_sql("SELECT * FROM users WHERE email = 'ana@example.com' AND password = 'pw'").unwrap();
        assert_eq!(
            cmd,
            Command::Authenticate {
                email: "ana@example.com".into(),
                password: "pw".into()
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM users WHERE email = 'a@b.c'"),
            Err(SqlError::MissingFilter("password"))
        ));
    }

    #[test]
    fn parse_select_fields() {
        assert_eq!(parse_sql("SELECT * FROM fields").unwrap(), Command::SelectFields { id: None });
        assert_eq!(
            parse_sql(&format!("SELECT * FROM fields WHERE id = '{ID}'")).unwrap(),
            Command::SelectFields { id: Some(id()) }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE field_id = '{ID}' AND date = '2025-06-10'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                field_id: Some(id()),
                date: parse_date("2025-06-10"),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM availability_summary").unwrap(),
            Command::SelectAvailabilitySummary {
                field_id: None,
                date: None
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM availability WHERE start >= 1"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM availability WHERE hour = '18:00'"),
            Err(SqlError::UnknownColumn(_))
        ));
    }

    #[test]
    fn parse_select_reservations() {
        let mine = parse_sql(&format!("SELECT * FROM reservations WHERE user_id = '{ID}'")).unwrap();
        assert_eq!(mine, Command::SelectReservations { user_id: Some(id()) });
        assert!(!mine.requires_admin());

        let all = parse_sql("SELECT * FROM reservations").unwrap();
        assert_eq!(all, Command::SelectReservations { user_id: None });
        assert!(all.requires_admin());
    }

    #[test]
    fn parse_select_messages_is_admin() {
        let cmd = parse_sql("SELECT * FROM messages").unwrap();
        assert_eq!(cmd, Command::SelectMessages);
        assert!(cmd.requires_admin());
    }

    #[test]
    fn parse_session_commands() {
        assert_eq!(parse_sql("LISTEN fields").unwrap(), Command::Listen { channel: "fields".into() });
        assert_eq!(parse_sql("listen \"Fields\";").unwrap(), Command::Listen { channel: "fields".into() });
        assert_eq!(parse_sql("UNLISTEN fields").unwrap(), Command::Unlisten { channel: "fields".into() });
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
        assert_eq!(parse_sql("SELECT 1").unwrap(), Command::Ping);
        assert_eq!(parse_sql("select 1;").unwrap(), Command::Ping);
        assert!(!Command::Ping.requires_admin());
        assert!(Command::Listen { channel: "fields".into() }.requires_admin());
    }

    #[test]
    fn result_table_detection() {
        assert_eq!(result_table("SELECT * FROM availability WHERE field_id = $1").as_deref(), Some("availability"));
        assert_eq!(result_table("select id from Fields;").as_deref(), Some("fields"));
        assert_eq!(result_table("SELECT 1").as_deref(), Some("?column?"));
        assert_eq!(result_table("INSERT INTO fields VALUES ($1)"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("SELECT * FROM resources"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql(" ; "), Err(SqlError::Empty)));
    }

    #[test]
    fn bad_ulid_is_invalid_value() {
        assert!(matches!(
            parse_sql("DELETE FROM fields WHERE id = 'nope'"),
            Err(SqlError::InvalidValue { column: "id", .. })
        ));
    }
}
