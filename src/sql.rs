use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        email: Option<String>,
    },
    /// Sign-in callback. `user_id` is used if no existing user matches.
    InsertConnection {
        user_id: Ulid,
        connection: NewConnection,
    },
    DeleteConnection {
        user_id: Ulid,
        provider: Option<Provider>,
    },
    InsertWigwam {
        id: Ulid,
        owner_id: Ulid,
        details: PropertyDetails,
        /// `(start, end)` of the listing created with the wigwam.
        initial_listing: Option<(Ms, Ms)>,
    },
    DeleteWigwam {
        id: Ulid,
    },
    InsertListing {
        id: Ulid,
        wigwam_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteListing {
        id: Ulid,
    },
    InsertRental {
        id: Ulid,
        wigwam_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteRental {
        id: Ulid,
    },
    InsertParty {
        wigwam_id: Ulid,
        user_id: Ulid,
    },
    InsertShare {
        wigwam_id: Ulid,
        user_id: Ulid,
        friends: Vec<String>,
    },
    SelectWigwams(WigwamFilter),
    SelectListings {
        wigwam_id: Option<Ulid>,
    },
    SelectRentals(RentalFilter),
    SelectAvailability {
        wigwam_id: Ulid,
    },
    SelectUser {
        id: Ulid,
    },
    SelectConnections {
        user_id: Ulid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WigwamFilter {
    All,
    Id(Ulid),
    Owner(Ulid),
    /// The wigwam, only if `owner` owns it.
    OwnedBy { id: Ulid, owner: Ulid },
    /// Wigwams listed for the whole of `[start, end]`.
    Range { start: Ms, end: Ms },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RentalFilter {
    Recent,
    Wigwam(Ulid),
    User(Ulid),
    /// The user's current or next stay at the wigwam.
    Current { wigwam: Ulid, user: Ulid },
}

// Column order used when an INSERT omits its column list.
const USER_COLUMNS: &[&str] = &["id", "email"];
const CONNECTION_COLUMNS: &[&str] = &["user_id", "provider", "uid", "name", "email", "token", "expires_at"];
const WIGWAM_COLUMNS: &[&str] = &[
    "id",
    "owner_id",
    "name",
    "description",
    "location",
    "price",
    "picture_url",
    "start",
    "end",
];
const LISTING_COLUMNS: &[&str] = &["id", "wigwam_id", "start", "end"];
const RENTAL_COLUMNS: &[&str] = &["id", "wigwam_id", "user_id", "start", "end"];
const PARTY_COLUMNS: &[&str] = &["wigwam_id", "user_id"];
const SHARE_COLUMNS: &[&str] = &["wigwam_id", "user_id", "friends"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "users" => {
            let row = Row::new("users", USER_COLUMNS, &columns, &values)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.required("id")?)?,
                email: row.string("email")?,
            })
        }
        "connections" => {
            let row = Row::new("connections", CONNECTION_COLUMNS, &columns, &values)?;
            let tag = parse_string(row.required("provider")?)?;
            Ok(Command::InsertConnection {
                user_id: parse_ulid(row.required("user_id")?)?,
                connection: NewConnection {
                    provider: parse_provider(&tag)?,
                    uid: parse_string(row.required("uid")?)?,
                    name: row.string("name")?,
                    email: row.string("email")?,
                    access_token: row.string("token")?,
                    expires_at: row.i64("expires_at")?,
                },
            })
        }
        "wigwams" => {
            let row = Row::new("wigwams", WIGWAM_COLUMNS, &columns, &values)?;
            let initial_listing = match (row.i64("start")?, row.i64("end")?) {
                (Some(start), Some(end)) => Some((start, end)),
                (None, None) => None,
                _ => return Err(SqlError::Parse("wigwams: start and end go together".into())),
            };
            Ok(Command::InsertWigwam {
                id: parse_ulid(row.required("id")?)?,
                owner_id: parse_ulid(row.required("owner_id")?)?,
                details: PropertyDetails {
                    name: parse_string(row.required("name")?)?,
                    description: row.string("description")?,
                    location: row.string("location")?,
                    price: row.i64("price")?,
                    picture_url: row.string("picture_url")?,
                },
                initial_listing,
            })
        }
        "listings" => {
            let row = Row::new("listings", LISTING_COLUMNS, &columns, &values)?;
            Ok(Command::InsertListing {
                id: parse_ulid(row.required("id")?)?,
                wigwam_id: parse_ulid(row.required("wigwam_id")?)?,
                start: parse_i64(row.required("start")?)?,
                end: parse_i64(row.required("end")?)?,
            })
        }
        "rentals" => {
            let row = Row::new("rentals", RENTAL_COLUMNS, &columns, &values)?;
            Ok(Command::InsertRental {
                id: parse_ulid(row.required("id")?)?,
                wigwam_id: parse_ulid(row.required("wigwam_id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
                start: parse_i64(row.required("start")?)?,
                end: parse_i64(row.required("end")?)?,
            })
        }
        "parties" => {
            let row = Row::new("parties", PARTY_COLUMNS, &columns, &values)?;
            Ok(Command::InsertParty {
                wigwam_id: parse_ulid(row.required("wigwam_id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
            })
        }
        "shares" => {
            let row = Row::new("shares", SHARE_COLUMNS, &columns, &values)?;
            let friends = match row.get("friends") {
                Some(expr) => parse_string_list(expr)?,
                None => Vec::new(),
            };
            Ok(Command::InsertShare {
                wigwam_id: parse_ulid(row.required("wigwam_id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
                friends,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "wigwams" => Ok(Command::DeleteWigwam { id: filter_ulid(&filters, "id")? }),
        "listings" => Ok(Command::DeleteListing { id: filter_ulid(&filters, "id")? }),
        "rentals" => Ok(Command::DeleteRental { id: filter_ulid(&filters, "id")? }),
        "connections" => {
            let provider = match find_filter(&filters, "provider", BinaryOperator::Eq) {
                Some(expr) => Some(parse_provider(&parse_string(expr)?)?),
                None => None,
            };
            Ok(Command::DeleteConnection {
                user_id: filter_ulid(&filters, "user_id")?,
                provider,
            })
        }
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
    let filters = collect_filters(select.selection.as_ref())?;
    let eq = |col: &str| find_filter(&filters, col, BinaryOperator::Eq);

    match table.as_str() {
        "wigwams" => {
            let filter = if let Some(id) = eq("id") {
                match eq("owner_id") {
                    Some(owner) => WigwamFilter::OwnedBy {
                        id: parse_ulid(id)?,
                        owner: parse_ulid(owner)?,
                    },
                    None => WigwamFilter::Id(parse_ulid(id)?),
                }
            } else if let Some(owner) = eq("owner_id") {
                WigwamFilter::Owner(parse_ulid(owner)?)
            } else {
                let start = find_filter(&filters, "start", BinaryOperator::GtEq);
                let end = find_filter(&filters, "end", BinaryOperator::LtEq);
                match (start, end) {
                    (Some(s), Some(e)) => WigwamFilter::Range {
                        start: parse_i64(s)?,
                        end: parse_i64(e)?,
                    },
                    (None, None) => WigwamFilter::All,
                    (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
                    (Some(_), None) => return Err(SqlError::MissingFilter("end")),
                }
            };
            Ok(Command::SelectWigwams(filter))
        }
        "listings" => Ok(Command::SelectListings {
            wigwam_id: eq("wigwam_id").map(parse_ulid).transpose()?,
        }),
        "rentals" => {
            let filter = match (eq("wigwam_id"), eq("user_id")) {
                (Some(w), Some(u)) => RentalFilter::Current {
                    wigwam: parse_ulid(w)?,
                    user: parse_ulid(u)?,
                },
                (Some(w), None) => RentalFilter::Wigwam(parse_ulid(w)?),
                (None, Some(u)) => RentalFilter::User(parse_ulid(u)?),
                (None, None) => RentalFilter::Recent,
            };
            Ok(Command::SelectRentals(filter))
        }
        "availability" => Ok(Command::SelectAvailability {
            wigwam_id: filter_ulid(&filters, "wigwam_id")?,
        }),
        "users" => Ok(Command::SelectUser {
            id: filter_ulid(&filters, "id")?,
        }),
        "connections" => Ok(Command::SelectConnections {
            user_id: filter_ulid(&filters, "user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Rows and filters ──────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    columns: Vec<&'a str>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        defaults: &'static [&'static str],
        columns: &'a [String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<&'a str> = if columns.is_empty() {
            // Positional: a short row leaves the trailing columns unset.
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
            }
            defaults[..values.len()].to_vec()
        } else {
            if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
                return Err(SqlError::UnknownColumn(table, unknown.clone()));
            }
            if values.len() != columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns.iter().map(String::as_str).collect()
        };
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let pos = self.columns.iter().position(|c| *c == column)?;
        self.values.get(pos)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string_or_null).transpose().map(Option::flatten)
    }

    fn i64(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.get(column).map(parse_i64_or_null).transpose().map(Option::flatten)
    }
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_filters(selection: Option<&Expr>) -> Result<Vec<(String, BinaryOperator, &Expr)>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, BinaryOperator, &'a Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, op.clone(), right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn find_filter<'a>(filters: &[(String, BinaryOperator, &'a Expr)], column: &str, op: BinaryOperator) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(c, o, _)| c == column && *o == op)
        .map(|(_, _, e)| *e)
}

fn filter_ulid(filters: &[(String, BinaryOperator, &Expr)], column: &'static str) -> Result<Ulid, SqlError> {
    let expr = find_filter(filters, column, BinaryOperator::Eq).ok_or(SqlError::MissingFilter(column))?;
    parse_ulid(expr)
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

/// The single VALUES row of an INSERT.
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
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

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

/// `ARRAY['a', 'b']` or a comma-separated string.
fn parse_string_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    match expr {
        Expr::Array(array) => array.elem.iter().map(parse_string).collect(),
        _ => Ok(parse_string_or_null(expr)?
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()),
    }
}

fn parse_provider(tag: &str) -> Result<Provider, SqlError> {
    Provider::from_tag(tag).ok_or_else(|| SqlError::Parse(format!("unknown provider: {tag}")))
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

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn insert_user() {
        let cmd = parse_sql(&format!("INSERT INTO users (id, email) VALUES ('{A}', 'a@example.com')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertUser {
                id: ulid(A),
                email: Some("a@example.com".into())
            }
        );
    }

    #[test]
    fn insert_user_without_column_list() {
        let cmd = parse_sql(&format!("INSERT INTO users VALUES ('{A}', NULL)")).unwrap();
        assert_eq!(cmd, Command::InsertUser { id: ulid(A), email: None });
    }

    #[test]
    fn insert_connection_by_column_name() {
        let sql = format!(
            "INSERT INTO connections (provider, uid, user_id, token, expires_at) \
             VALUES ('gplus', '1234', '{A}', 'tok', 1893456000000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertConnection { user_id, connection } => {
                assert_eq!(user_id, ulid(A));
                assert_eq!(connection.provider, Provider::Google);
                assert_eq!(connection.uid, "1234");
                assert_eq!(connection.access_token.as_deref(), Some("tok"));
                assert_eq!(connection.expires_at, Some(1_893_456_000_000));
                assert_eq!(connection.name, None);
                assert_eq!(connection.email, None);
            }
            other => panic!("expected InsertConnection, got {other:?}"),
        }
    }

    #[test]
    fn insert_connection_unknown_provider() {
        let sql = format!("INSERT INTO connections (user_id, provider, uid) VALUES ('{A}', 'myspace', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn delete_connection_with_and_without_provider() {
        let sql = format!("DELETE FROM connections WHERE user_id = '{A}' AND provider = 'facebook'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteConnection {
                user_id: ulid(A),
                provider: Some(Provider::Facebook)
            }
        );
        let sql = format!("DELETE FROM connections WHERE user_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteConnection {
                user_id: ulid(A),
                provider: None
            }
        );
    }

    #[test]
    fn insert_wigwam_with_initial_listing() {
        let sql = format!(
            r#"INSERT INTO wigwams (id, owner_id, name, price, start, "end") VALUES ('{A}', '{B}', 'Tipi', 80, 1000, 2000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWigwam {
                id,
                owner_id,
                details,
                initial_listing,
            } => {
                assert_eq!(id, ulid(A));
                assert_eq!(owner_id, ulid(B));
                assert_eq!(details.name, "Tipi");
                assert_eq!(details.price, Some(80));
                assert_eq!(details.description, None);
                assert_eq!(initial_listing, Some((1000, 2000)));
            }
            other => panic!("expected InsertWigwam, got {other:?}"),
        }
    }

    #[test]
    fn insert_wigwam_half_window_errors() {
        let sql = format!("INSERT INTO wigwams (id, owner_id, name, start) VALUES ('{A}', '{B}', 'Tipi', 1000)");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn insert_wigwam_requires_name() {
        let sql = format!("INSERT INTO wigwams (id, owner_id) VALUES ('{A}', '{B}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("name"))));
    }

    #[test]
    fn insert_listing_and_rental() {
        let sql = format!(r#"INSERT INTO listings (id, wigwam_id, start, "end") VALUES ('{A}', '{B}', 1000, 2000)"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertListing {
                id: ulid(A),
                wigwam_id: ulid(B),
                start: 1000,
                end: 2000
            }
        );

        let sql = format!(r#"INSERT INTO rentals (id, wigwam_id, user_id, start, "end") VALUES ('{A}', '{B}', '{A}', 1000, 2000)"#);
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertRental { start: 1000, end: 2000, .. }));
    }

    #[test]
    fn deletes_by_id() {
        let id = ulid(A);
        assert_eq!(
            parse_sql(&format!("DELETE FROM wigwams WHERE id = '{A}'")).unwrap(),
            Command::DeleteWigwam { id }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM listings WHERE id = '{A}'")).unwrap(),
            Command::DeleteListing { id }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM rentals WHERE id = '{A}'")).unwrap(),
            Command::DeleteRental { id }
        );
        assert!(matches!(
            parse_sql("DELETE FROM rentals"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn party_and_share() {
        let sql = format!("INSERT INTO parties (wigwam_id, user_id) VALUES ('{A}', '{B}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertParty {
                wigwam_id: ulid(A),
                user_id: ulid(B)
            }
        );

        let sql = format!("INSERT INTO shares (wigwam_id, user_id, friends) VALUES ('{A}', '{B}', 'f1, f2,')");
        match parse_sql(&sql).unwrap() {
            Command::InsertShare { friends, .. } => assert_eq!(friends, vec!["f1", "f2"]),
            other => panic!("expected InsertShare, got {other:?}"),
        }

        let sql = format!("INSERT INTO shares (wigwam_id, user_id, friends) VALUES ('{A}', '{B}', ARRAY['f1', 'f3'])");
        match parse_sql(&sql).unwrap() {
            Command::InsertShare { friends, .. } => assert_eq!(friends, vec!["f1", "f3"]),
            other => panic!("expected InsertShare, got {other:?}"),
        }
    }

    #[test]
    fn select_wigwams_filters() {
        assert_eq!(parse_sql("SELECT * FROM wigwams").unwrap(), Command::SelectWigwams(WigwamFilter::All));
        assert_eq!(
            parse_sql(&format!("SELECT * FROM wigwams WHERE id = '{A}'")).unwrap(),
            Command::SelectWigwams(WigwamFilter::Id(ulid(A)))
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM wigwams WHERE owner_id = '{A}'")).unwrap(),
            Command::SelectWigwams(WigwamFilter::Owner(ulid(A)))
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM wigwams WHERE owner_id = '{B}' AND id = '{A}'")).unwrap(),
            Command::SelectWigwams(WigwamFilter::OwnedBy { id: ulid(A), owner: ulid(B) })
        );
        assert_eq!(
            parse_sql(r#"SELECT * FROM wigwams WHERE start >= 1000 AND "end" <= 2000"#).unwrap(),
            Command::SelectWigwams(WigwamFilter::Range { start: 1000, end: 2000 })
        );
        assert!(matches!(
            parse_sql("SELECT * FROM wigwams WHERE start >= 1000"),
            Err(SqlError::MissingFilter("end"))
        ));
    }

    #[test]
    fn select_listings_and_rentals() {
        assert_eq!(
            parse_sql("SELECT * FROM listings").unwrap(),
            Command::SelectListings { wigwam_id: None }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM listings WHERE wigwam_id = '{A}'")).unwrap(),
            Command::SelectListings { wigwam_id: Some(ulid(A)) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM rentals").unwrap(),
            Command::SelectRentals(RentalFilter::Recent)
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM rentals WHERE user_id = '{A}'")).unwrap(),
            Command::SelectRentals(RentalFilter::User(ulid(A)))
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM rentals WHERE (wigwam_id = '{B}')")).unwrap(),
            Command::SelectRentals(RentalFilter::Wigwam(ulid(B)))
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM rentals WHERE wigwam_id = '{B}' AND user_id = '{A}'")).unwrap(),
            Command::SelectRentals(RentalFilter::Current { wigwam: ulid(B), user: ulid(A) })
        );
    }

    #[test]
    fn select_single_entity_tables_need_filter() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM availability WHERE wigwam_id = '{A}'")).unwrap(),
            Command::SelectAvailability { wigwam_id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM users WHERE id = '{A}'")).unwrap(),
            Command::SelectUser { id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM connections WHERE user_id = '{A}'")).unwrap(),
            Command::SelectConnections { user_id: ulid(A) }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM availability"),
            Err(SqlError::MissingFilter("wigwam_id"))
        ));
    }

    #[test]
    fn unknown_column_and_arity_errors() {
        let sql = format!("INSERT INTO users (id, nickname) VALUES ('{A}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("users", _))));
        let sql = format!("INSERT INTO users (id) VALUES ('{A}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("users", 1, 2))));
    }

    #[test]
    fn negative_timestamp_parses() {
        let sql = format!(r#"INSERT INTO listings (id, wigwam_id, start, "end") VALUES ('{A}', '{B}', -5, 10)"#);
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertListing { start: -5, .. }));
    }

    #[test]
    fn unknown_table_and_empty() {
        assert!(matches!(
            parse_sql(&format!("INSERT INTO foobar (id) VALUES ('{A}')")),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEC nonsense"), Err(SqlError::Parse(_))));
    }
}
