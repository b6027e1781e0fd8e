use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
    },
    InsertUser {
        id: Ulid,
        username: String,
    },
    InsertApplication {
        id: Ulid,
        name: String,
    },
    InsertWorkstation {
        id: Ulid,
        room_id: Ulid,
        identifier: String,
        name: Option<String>,
        colour: Option<String>,
        offset_x: f32,
        offset_y: f32,
    },
    InsertHeartbeat {
        workstation_id: Ulid,
        seen_at: Ms,
    },
    InsertWorkgroup(NewWorkgroup),
    InsertMember {
        workgroup_id: Ulid,
        workstation_id: Ulid,
    },
    DeleteMember {
        workgroup_id: Ulid,
        workstation_id: Ulid,
    },
    /// Member sharing, or every active member when `workstation_id` is `None`.
    SetSharing {
        workgroup_id: Ulid,
        workstation_id: Option<Ulid>,
        enabled: bool,
    },
    SelectAvailability {
        room_id: Ulid,
    },
    SelectMembers {
        workgroup_id: Ulid,
    },
    SelectHistory {
        owner_id: Ulid,
        count: Option<usize>,
    },
    SelectWorkgroup {
        owner_id: Ulid,
        id: Ulid,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed
        .get(..7)
        .is_some_and(|head| head.eq_ignore_ascii_case("LISTEN "))
    {
        let channel = trimmed[7..].trim().trim_matches(';').trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
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

fn require(values: &[Expr], table: &'static str, n: usize) -> Result<(), SqlError> {
    if values.len() < n {
        return Err(SqlError::WrongArity(table, n, values.len()));
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            require(&values, "rooms", 2)?;
            Ok(Command::InsertRoom {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "users" => {
            require(&values, "users", 2)?;
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                username: parse_string(&values[1])?,
            })
        }
        "applications" => {
            require(&values, "applications", 2)?;
            Ok(Command::InsertApplication {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "workstations" => {
            require(&values, "workstations", 3)?;
            let optional = |i: usize| match values.get(i) {
                Some(v) => parse_string_or_null(v),
                None => Ok(None),
            };
            let offset = |i: usize| match values.get(i) {
                Some(v) => parse_f32(v),
                None => Ok(0.0),
            };
            Ok(Command::InsertWorkstation {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                identifier: parse_string(&values[2])?,
                name: optional(3)?,
                colour: optional(4)?,
                offset_x: offset(5)?,
                offset_y: offset(6)?,
            })
        }
        "heartbeats" => {
            require(&values, "heartbeats", 2)?;
            Ok(Command::InsertHeartbeat {
                workstation_id: parse_ulid(&values[0])?,
                seen_at: parse_i64(&values[1])?,
            })
        }
        "workgroups" => {
            require(&values, "workgroups", 4)?;
            let sharing_default = match values.get(4) {
                Some(v) => parse_bool(v)?,
                None => true,
            };
            let applications = match values.get(5) {
                Some(v) => parse_ulid_list(v)?,
                None => Vec::new(),
            };
            Ok(Command::InsertWorkgroup(NewWorkgroup {
                owner_id: parse_ulid(&values[0])?,
                room_id: parse_ulid_or_null(&values[1])?,
                duration_minutes: parse_i64(&values[2])?,
                workstations: parse_ulid_list(&values[3])?,
                sharing_default,
                applications,
            }))
        }
        "members" => {
            require(&values, "members", 2)?;
            Ok(Command::InsertMember {
                workgroup_id: parse_ulid(&values[0])?,
                workstation_id: parse_ulid(&values[1])?,
            })
        }
        "sharing" => {
            require(&values, "sharing", 3)?;
            Ok(Command::SetSharing {
                workgroup_id: parse_ulid(&values[0])?,
                workstation_id: parse_ulid_or_null(&values[1])?,
                enabled: parse_bool(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "members" => Ok(Command::DeleteMember {
            workgroup_id: required_ulid(&filters, "workgroup_id")?,
            workstation_id: required_ulid(&filters, "workstation_id")?,
        }),
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
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            room_id: required_ulid(&filters, "room_id")?,
        }),
        "members" => Ok(Command::SelectMembers {
            workgroup_id: required_ulid(&filters, "workgroup_id")?,
        }),
        "workgroups" => {
            let owner_id = required_ulid(&filters, "owner_id")?;
            if let Some(id) = filter(&filters, "id") {
                return Ok(Command::SelectWorkgroup {
                    owner_id,
                    id: parse_ulid(id)?,
                });
            }
            let count = filter(&filters, "count").map(parse_usize).transpose()?;
            Ok(Command::SelectHistory { owner_id, count })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

type Filters<'a> = Vec<(String, &'a Expr)>;

/// Collect `column = value` conjuncts. Anything but AND-ed equalities is
/// rejected rather than silently ignored.
fn where_filters(selection: &Option<Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

fn filter<'a>(filters: &Filters<'a>, col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
}

fn required_ulid(filters: &Filters<'_>, col: &'static str) -> Result<Ulid, SqlError> {
    filter(filters, col)
        .ok_or(SqlError::MissingFilter(col))
        .and_then(parse_ulid)
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
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => parse_ulid_str(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

/// A comma-separated id list in one string. NULL and `''` are both empty.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(Vec::new()),
        Some(Value::SingleQuotedString(s)) => s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(parse_ulid_str)
            .collect(),
        Some(value) => Err(SqlError::Parse(format!("expected id list, got {value:?}"))),
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

/// Numeric text of a literal, with a leading minus folded in.
fn number_text(expr: &Expr) -> Result<String, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(format!("-{}", number_text(expr)?)),
        _ => match extract_value(expr) {
            Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => Ok(s.trim().to_string()),
            Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
            None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
        },
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = number_text(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid count")))
}

fn parse_f32(expr: &Expr) -> Result<f32, SqlError> {
    let s = number_text(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
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
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRY";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_room() {
        let cmd = parse_sql(&format!("INSERT INTO rooms (id, name) VALUES ('{A}', 'Lab 2')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertRoom {
                id: ulid(A),
                name: "Lab 2".into()
            }
        );
    }

    #[test]
    fn parse_insert_workstation_defaults() {
        let sql = format!("INSERT INTO workstations (id, room_id, identifier) VALUES ('{A}', '{B}', 'pc-07')");
        match parse_sql(&sql).unwrap() {
            Command::InsertWorkstation {
                identifier,
                name,
                colour,
                offset_x,
                offset_y,
                ..
            } => {
                assert_eq!(identifier, "pc-07");
                assert_eq!(name, None);
                assert_eq!(colour, None);
                assert_eq!((offset_x, offset_y), (0.0, 0.0));
            }
            cmd => panic!("expected InsertWorkstation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_workstation_full() {
        let sql = format!(
            "INSERT INTO workstations (id, room_id, identifier, name, colour, x, y) \
             VALUES ('{A}', '{B}', 'pc-07', 'Window desk', NULL, 12.5, 80)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWorkstation {
                name,
                colour,
                offset_x,
                offset_y,
                ..
            } => {
                assert_eq!(name.as_deref(), Some("Window desk"));
                assert_eq!(colour, None);
                assert_eq!(offset_x, 12.5);
                assert_eq!(offset_y, 80.0);
            }
            cmd => panic!("expected InsertWorkstation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_workgroup() {
        let sql = format!(
            "INSERT INTO workgroups (owner_id, room_id, duration, workstations, sharing, applications) \
             VALUES ('{A}', NULL, 30, '{A}, {B}', false, '')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertWorkgroup(NewWorkgroup {
                owner_id: ulid(A),
                room_id: None,
                duration_minutes: 30,
                workstations: vec![ulid(A), ulid(B)],
                sharing_default: false,
                applications: Vec::new(),
            })
        );
    }

    #[test]
    fn parse_insert_workgroup_minimal() {
        let sql = format!(
            "INSERT INTO workgroups (owner_id, room_id, duration, workstations) VALUES ('{A}', '{B}', 45, '{A}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWorkgroup(req) => {
                assert_eq!(req.room_id, Some(ulid(B)));
                assert!(req.sharing_default);
                assert!(req.applications.is_empty());
            }
            cmd => panic!("expected InsertWorkgroup, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_bad_id_in_list() {
        let sql = format!(
            "INSERT INTO workgroups (owner_id, room_id, duration, workstations) VALUES ('{A}', NULL, 45, '{A},nope')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_negative_duration_reaches_engine() {
        let sql = format!(
            "INSERT INTO workgroups (owner_id, room_id, duration, workstations) VALUES ('{A}', NULL, -5, '')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWorkgroup(req) => assert_eq!(req.duration_minutes, -5),
            cmd => panic!("expected InsertWorkgroup, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_member_insert_and_delete() {
        let insert = format!("INSERT INTO members (workgroup_id, workstation_id) VALUES ('{A}', '{B}')");
        assert_eq!(
            parse_sql(&insert).unwrap(),
            Command::InsertMember {
                workgroup_id: ulid(A),
                workstation_id: ulid(B)
            }
        );
        let delete = format!("DELETE FROM members WHERE workgroup_id = '{A}' AND workstation_id = '{B}'");
        assert_eq!(
            parse_sql(&delete).unwrap(),
            Command::DeleteMember {
                workgroup_id: ulid(A),
                workstation_id: ulid(B)
            }
        );
    }

    #[test]
    fn parse_delete_member_requires_both_filters() {
        let delete = format!("DELETE FROM members WHERE workgroup_id = '{A}'");
        assert!(matches!(
            parse_sql(&delete),
            Err(SqlError::MissingFilter("workstation_id"))
        ));
    }

    #[test]
    fn parse_sharing_member_and_group() {
        let member = format!("INSERT INTO sharing (workgroup_id, workstation_id, enabled) VALUES ('{A}', '{B}', true)");
        assert_eq!(
            parse_sql(&member).unwrap(),
            Command::SetSharing {
                workgroup_id: ulid(A),
                workstation_id: Some(ulid(B)),
                enabled: true
            }
        );
        let group = format!("INSERT INTO sharing (workgroup_id, workstation_id, enabled) VALUES ('{A}', NULL, 'f')");
        assert_eq!(
            parse_sql(&group).unwrap(),
            Command::SetSharing {
                workgroup_id: ulid(A),
                workstation_id: None,
                enabled: false
            }
        );
    }

    #[test]
    fn parse_selects() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM availability WHERE room_id = '{A}'")).unwrap(),
            Command::SelectAvailability { room_id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM members WHERE workgroup_id = '{A}'")).unwrap(),
            Command::SelectMembers { workgroup_id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM workgroups WHERE owner_id = '{A}'")).unwrap(),
            Command::SelectHistory {
                owner_id: ulid(A),
                count: None
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM workgroups WHERE owner_id = '{A}' AND count = 12")).unwrap(),
            Command::SelectHistory {
                owner_id: ulid(A),
                count: Some(12)
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM workgroups WHERE owner_id = '{A}' AND id = '{B}'")).unwrap(),
            Command::SelectWorkgroup {
                owner_id: ulid(A),
                id: ulid(B)
            }
        );
    }

    #[test]
    fn parse_select_rejects_range_filters() {
        let sql = format!("SELECT * FROM availability WHERE room_id = '{A}' AND x > 3");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_missing_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM availability"),
            Err(SqlError::MissingFilter("room_id"))
        ));
    }

    #[test]
    fn parse_listen() {
        let cmd = parse_sql(&format!("LISTEN workgroup_{A};")).unwrap();
        assert_eq!(
            cmd,
            Command::Listen {
                channel: format!("workgroup_{A}")
            }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_short_row_errors() {
        let sql = format!("INSERT INTO rooms (id) VALUES ('{A}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::WrongArity("rooms", 2, 1))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
