use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{parse_date, parse_table_numbers, parse_time};
use crate::model::Contact;

/// Parsed console command.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTable {
        number: u32,
        capacity: u32,
    },
    DeleteTable {
        id: Ulid,
    },
    /// Walk-in or phone booking. Runs the same allocation as the public site.
    InsertBooking {
        date: NaiveDate,
        time: NaiveTime,
        guests: u32,
        contact: Contact,
        tables: Vec<u32>,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertCoverImage {
        title: String,
        image: String,
    },
    DeleteCoverImage {
        id: Ulid,
    },
    SelectTables,
    SelectBookings {
        date: Option<NaiveDate>,
    },
    SelectCoverImages,
    SelectAvailability {
        date: NaiveDate,
        time: NaiveTime,
        guests: u32,
    },
}

const TABLE_COLUMNS: &[&str] = &["number", "capacity"];
const BOOKING_COLUMNS: &[&str] = &[
    "date",
    "time",
    "guests",
    "name",
    "email",
    "phone_number",
    "comments",
    "tables",
];
const COVER_IMAGE_COLUMNS: &[&str] = &["title", "image"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "tables" => {
            let row = Row::from_insert(insert, TABLE_COLUMNS)?;
            Ok(Command::InsertTable {
                number: parse_u32(row.required("number")?)?,
                capacity: parse_u32(row.required("capacity")?)?,
            })
        }
        "bookings" => {
            let row = Row::from_insert(insert, BOOKING_COLUMNS)?;
            let tables = match row.optional("tables") {
                Some(expr) => match parse_string_or_null(expr)? {
                    Some(raw) => parse_table_numbers(&raw)
                        .ok_or_else(|| SqlError::Parse(format!("bad table list: {raw}")))?,
                    None => Vec::new(),
                },
                None => Vec::new(),
            };
            Ok(Command::InsertBooking {
                date: parse_date_expr(row.required("date")?)?,
                time: parse_time_expr(row.required("time")?)?,
                guests: parse_u32(row.required("guests")?)?,
                contact: Contact {
                    name: parse_string(row.required("name")?)?,
                    email: parse_string(row.required("email")?)?,
                    phone_number: parse_string(row.required("phone_number")?)?,
                    comments: row
                        .optional("comments")
                        .map(parse_string_or_null)
                        .transpose()?
                        .flatten()
                        .filter(|c| !c.trim().is_empty()),
                },
                tables,
            })
        }
        "cover_images" => {
            let row = Row::from_insert(insert, COVER_IMAGE_COLUMNS)?;
            Ok(Command::InsertCoverImage {
                title: parse_string(row.required("title")?)?,
                image: parse_string(row.required("image")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "tables" => Ok(Command::DeleteTable { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "cover_images" => Ok(Command::DeleteCoverImage { id }),
        _ => Err(SqlError::UnknownTable(table)),
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
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "tables" => Ok(Command::SelectTables),
        "cover_images" => Ok(Command::SelectCoverImages),
        "bookings" => Ok(Command::SelectBookings {
            date: filter("date").map(parse_date_expr).transpose()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            date: parse_date_expr(filter("date").ok_or(SqlError::MissingFilter("date"))?)?,
            time: parse_time_expr(filter("time").ok_or(SqlError::MissingFilter("time"))?)?,
            guests: parse_u32(filter("guests").ok_or(SqlError::MissingFilter("guests"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms joined by AND. Anything else in the WHERE clause is rejected.
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

/// First VALUES row of an INSERT, keyed by column name. Without a column list the
/// values are taken positionally in `default_columns` order.
struct Row {
    values: Vec<(String, Expr)>,
}

impl Row {
    fn from_insert(insert: &ast::Insert, default_columns: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        if insert.columns.len() > values.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
        }
        for col in &columns {
            if !default_columns.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(col.clone()));
            }
        }
        Ok(Self {
            values: columns.into_iter().zip(values).collect(),
        })
    }

    fn optional(&self, col: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.optional(col).ok_or(SqlError::MissingColumn(col))
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected a non-negative integer, got {s}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date (YYYY-MM-DD): {s}")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    parse_time(&s).ok_or_else(|| SqlError::Parse(format!("bad time (HH:MM): {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_insert_table() {
        let cmd = parse_sql("INSERT INTO tables (number, capacity) VALUES (7, 4)").unwrap();
        assert_eq!(cmd, Command::InsertTable { number: 7, capacity: 4 });
    }

    #[test]
    fn parse_insert_table_positional() {
        let cmd = parse_sql("INSERT INTO tables VALUES (3, '6')").unwrap();
        assert_eq!(cmd, Command::InsertTable { number: 3, capacity: 6 });
    }

    #[test]
    fn parse_insert_booking() {
        let sql = "INSERT INTO bookings (date, time, guests, name, email, phone_number) \
                   VALUES ('2031-05-01', '19:30', 4, 'Olga', 'olga@example.com', '+79990001122')";
        match parse_sql(sql).unwrap() {
            Command::InsertBooking {
                date,
                time,
                guests,
                contact,
                tables,
            } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2031, 5, 1).unwrap());
                assert_eq!(time, NaiveTime::from_hms_opt(19, 30, 0).unwrap());
                assert_eq!(guests, 4);
                assert_eq!(contact.name, "Olga");
                assert_eq!(contact.comments, None);
                assert!(tables.is_empty());
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_with_comments_and_tables() {
        let sql = "INSERT INTO bookings (date, time, guests, name, email, phone_number, comments, tables) \
                   VALUES ('2031-05-01', '19:30', 4, 'Olga', 'olga@example.com', '+7999', 'window', '2,5')";
        match parse_sql(sql).unwrap() {
            Command::InsertBooking {
                contact, tables, ..
            } => {
                assert_eq!(contact.comments.as_deref(), Some("window"));
                assert_eq!(tables, vec![2, 5]);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_missing_column() {
        let sql = "INSERT INTO bookings (date, time, guests) VALUES ('2031-05-01', '19:30', 4)";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("name"))));
    }

    #[test]
    fn parse_insert_rejects_unknown_column() {
        let sql = "INSERT INTO tables (number, seats) VALUES (1, 4)";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn(c)) if c == "seats"));
    }

    #[test]
    fn parse_insert_cover_image() {
        let cmd = parse_sql("INSERT INTO cover_images (title, image) VALUES ('Terrace', 'covers/t.jpg')").unwrap();
        assert_eq!(
            cmd,
            Command::InsertCoverImage {
                title: "Terrace".into(),
                image: "covers/t.jpg".into()
            }
        );
    }

    #[test]
    fn parse_deletes() {
        let id = Ulid::from_string(ID).unwrap();
        assert_eq!(
            parse_sql(&format!("DELETE FROM tables WHERE id = '{ID}'")).unwrap(),
            Command::DeleteTable { id }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM bookings WHERE id = '{ID}'")).unwrap(),
            Command::DeleteBooking { id }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM cover_images WHERE id = '{ID}'")).unwrap(),
            Command::DeleteCoverImage { id }
        );
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_selects() {
        assert_eq!(parse_sql("SELECT * FROM tables").unwrap(), Command::SelectTables);
        assert_eq!(parse_sql("SELECT * FROM cover_images").unwrap(), Command::SelectCoverImages);
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { date: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM bookings WHERE date = '2031-05-01'").unwrap(),
            Command::SelectBookings {
                date: NaiveDate::from_ymd_opt(2031, 5, 1)
            }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = "SELECT * FROM availability WHERE date = '2031-05-01' AND time = '20:00' AND guests = 3";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability {
                date: NaiveDate::from_ymd_opt(2031, 5, 1).unwrap(),
                time: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
                guests: 3,
            }
        );
    }

    #[test]
    fn parse_select_availability_requires_guests() {
        let sql = "SELECT * FROM availability WHERE date = '2031-05-01' AND time = '20:00'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("guests"))));
    }

    #[test]
    fn parse_rejects_range_filters() {
        let sql = "SELECT * FROM bookings WHERE date >= '2031-05-01'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM holds"),
            Err(SqlError::UnknownTable(t)) if t == "holds"
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
