//! Compiles the user-facing query language into SQL.
//!
//! The language is a flat list of whitespace-separated clauses that must all
//! match:
//!
//! - `*` matches everything; so does the empty query.
//! - A bareword matches as a substring across all text fields and metadata
//!   values, case-insensitively.
//! - `field:value` matches a field exactly; `field:"some phrase"` keeps
//!   spaces and is never interpreted as a wildcard.
//! - `field:<value` / `field:>value` / `field:<=value` / `field:>=value`
//!   are range clauses. Timestamps are RFC 3339, optionally quoted.
//! - `*` and `?` in an unquoted value are glob wildcards (`analyzed:F*`).
//! - `meta.<key>:value` targets one metadata entry.
//! - A leading `-` negates a clause, a leading `+` is accepted and ignored.
//! - Unknown fields match nothing; they are not an error.

use chrono::DateTime;

use super::IndexError;

/// A compiled WHERE expression plus its positional parameters.
#[derive(Debug)]
pub(crate) struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Parameter values, kept backend-typed but rusqlite-free for testability.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Text(String),
    Int(i64),
}

/// Text columns searched by bareword clauses.
const BAREWORD_COLUMNS: &[&str] = &[
    "uid",
    "hostname",
    "executable",
    "executable_path",
    "executable_hash",
    "lang",
    "trace",
];

/// Renders the `analyzed` flag the way term clauses see it.
const ANALYZED_EXPR: &str = "(CASE WHEN analyzed <> 0 THEN 'true' ELSE 'false' END)";

pub(crate) fn compile(input: &str) -> Result<CompiledQuery, IndexError> {
    let mut sql = Vec::new();
    let mut params = Vec::new();

    for token in tokenize(input) {
        let clause = parse_token(&token)?;
        let expr = lower(&clause, &mut params)?;
        sql.push(if clause.negated {
            format!("NOT ({expr})")
        } else {
            expr
        });
    }

    if sql.is_empty() {
        sql.push("1 = 1".to_owned());
    }

    Ok(CompiledQuery {
        sql: sql.join(" AND "),
        params,
    })
}

#[derive(Debug, PartialEq)]
struct Clause {
    negated: bool,
    kind: ClauseKind,
}

#[derive(Debug, PartialEq)]
enum ClauseKind {
    All,
    Bareword(String),
    Term {
        field: String,
        value: String,
        phrase: bool,
    },
    Range {
        field: String,
        op: RangeOp,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RangeOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl RangeOp {
    fn sql(self) -> &'static str {
        match self {
            RangeOp::Lt => "<",
            RangeOp::Le => "<=",
            RangeOp::Gt => ">",
            RangeOp::Ge => ">=",
        }
    }
}

/// Splits the input on whitespace, keeping quoted sections together.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn parse_token(token: &str) -> Result<Clause, IndexError> {
    let (negated, token) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };

    if token == "*" {
        return Ok(Clause {
            negated,
            kind: ClauseKind::All,
        });
    }

    let kind = match token.split_once(':') {
        None => ClauseKind::Bareword(unquote(token).to_owned()),
        Some((field, "")) => ClauseKind::Term {
            field: field.to_owned(),
            value: String::new(),
            phrase: false,
        },
        Some((field, rest)) => {
            let (op, value) = if let Some(v) = rest.strip_prefix("<=") {
                (Some(RangeOp::Le), v)
            } else if let Some(v) = rest.strip_prefix(">=") {
                (Some(RangeOp::Ge), v)
            } else if let Some(v) = rest.strip_prefix('<') {
                (Some(RangeOp::Lt), v)
            } else if let Some(v) = rest.strip_prefix('>') {
                (Some(RangeOp::Gt), v)
            } else {
                (None, rest)
            };

            match op {
                Some(op) => ClauseKind::Range {
                    field: field.to_owned(),
                    op,
                    value: unquote(value).to_owned(),
                },
                None => {
                    let phrase = value.len() >= 2
                        && value.starts_with('"')
                        && value.ends_with('"');
                    ClauseKind::Term {
                        field: field.to_owned(),
                        value: unquote(value).to_owned(),
                        phrase,
                    }
                }
            }
        }
    };

    Ok(Clause { negated, kind })
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[derive(Debug)]
enum FieldKind {
    Text(&'static str),
    Bool,
    Time(&'static str),
    Num(&'static str),
    Meta(String),
    Unknown,
}

/// Queryable text columns; field name and column name coincide.
const TEXT_FIELDS: &[&str] = &[
    "uid",
    "hostname",
    "executable",
    "executable_path",
    "executable_hash",
    "lang",
    "trace",
    "forwarder_version",
    "indexer_version",
];

fn classify(field: &str) -> FieldKind {
    if let Some(column) = TEXT_FIELDS.iter().copied().find(|c| *c == field) {
        return FieldKind::Text(column);
    }
    match field {
        "analyzed" => FieldKind::Bool,
        "dumped_at" => FieldKind::Time("dumped_at"),
        "analyzed_at" => FieldKind::Time("analyzed_at"),
        "size" => FieldKind::Num("size"),
        "executable_size" => FieldKind::Num("executable_size"),
        _ => match field.strip_prefix("meta.") {
            Some(key) if !key.is_empty() => FieldKind::Meta(key.to_owned()),
            _ => FieldKind::Unknown,
        },
    }
}

fn lower(clause: &Clause, params: &mut Vec<SqlValue>) -> Result<String, IndexError> {
    match &clause.kind {
        ClauseKind::All => Ok("1 = 1".to_owned()),

        ClauseKind::Bareword(word) => {
            let pattern = format!("%{}%", escape_like(word));
            let mut parts = Vec::new();
            for column in BAREWORD_COLUMNS {
                parts.push(format!("{column} LIKE ? ESCAPE '\\'"));
                params.push(SqlValue::Text(pattern.clone()));
            }
            parts.push(
                "EXISTS (SELECT 1 FROM coredump_meta m WHERE m.uid = coredumps.uid \
                 AND m.value LIKE ? ESCAPE '\\')"
                    .to_owned(),
            );
            params.push(SqlValue::Text(pattern));
            Ok(format!("({})", parts.join(" OR ")))
        }

        ClauseKind::Term {
            field,
            value,
            phrase,
        } => {
            let wildcard = !phrase && has_wildcard(value);
            match classify(field) {
                FieldKind::Text(column) => {
                    if wildcard {
                        params.push(SqlValue::Text(wildcard_to_like(value)));
                        Ok(format!("{column} LIKE ? ESCAPE '\\'"))
                    } else {
                        params.push(SqlValue::Text(value.clone()));
                        Ok(format!("{column} = ?"))
                    }
                }
                FieldKind::Bool => {
                    if wildcard {
                        params.push(SqlValue::Text(wildcard_to_like(value)));
                        Ok(format!("{ANALYZED_EXPR} LIKE ? ESCAPE '\\'"))
                    } else {
                        params.push(SqlValue::Text(value.to_lowercase()));
                        Ok(format!("{ANALYZED_EXPR} = ?"))
                    }
                }
                FieldKind::Time(column) => {
                    params.push(SqlValue::Int(parse_timestamp(value)?));
                    Ok(format!("{column} = ?"))
                }
                FieldKind::Num(column) => {
                    params.push(SqlValue::Int(parse_number(value)?));
                    Ok(format!("{column} = ?"))
                }
                FieldKind::Meta(key) => {
                    params.push(SqlValue::Text(key));
                    let comparison = if wildcard {
                        params.push(SqlValue::Text(wildcard_to_like(value)));
                        "m.value LIKE ? ESCAPE '\\'"
                    } else {
                        params.push(SqlValue::Text(value.clone()));
                        "m.value = ?"
                    };
                    Ok(format!(
                        "EXISTS (SELECT 1 FROM coredump_meta m WHERE m.uid = coredumps.uid \
                         AND m.key = ? AND {comparison})"
                    ))
                }
                FieldKind::Unknown => Ok("0 = 1".to_owned()),
            }
        }

        ClauseKind::Range { field, op, value } => match classify(field) {
            FieldKind::Time(column) => {
                params.push(SqlValue::Int(parse_timestamp(value)?));
                Ok(format!("{column} {} ?", op.sql()))
            }
            FieldKind::Num(column) => {
                params.push(SqlValue::Int(parse_number(value)?));
                Ok(format!("{column} {} ?", op.sql()))
            }
            FieldKind::Text(column) => {
                params.push(SqlValue::Text(value.clone()));
                Ok(format!("{column} {} ?", op.sql()))
            }
            FieldKind::Meta(key) => {
                params.push(SqlValue::Text(key));
                params.push(SqlValue::Text(value.clone()));
                Ok(format!(
                    "EXISTS (SELECT 1 FROM coredump_meta m WHERE m.uid = coredumps.uid \
                     AND m.key = ? AND m.value {} ?)",
                    op.sql()
                ))
            }
            FieldKind::Bool | FieldKind::Unknown => Ok("0 = 1".to_owned()),
        },
    }
}

fn has_wildcard(value: &str) -> bool {
    value.contains('*') || value.contains('?')
}

/// Escapes LIKE metacharacters so user text matches literally.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Converts a glob pattern to a LIKE pattern.
fn wildcard_to_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn parse_timestamp(value: &str) -> Result<i64, IndexError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.timestamp_millis())
        .map_err(|err| IndexError::Query(format!("invalid timestamp {value:?}: {err}")))
}

fn parse_number(value: &str) -> Result<i64, IndexError> {
    value
        .parse()
        .map_err(|err| IndexError::Query(format!("invalid number {value:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(token: &str) -> Clause {
        parse_token(token).unwrap()
    }

    #[test]
    fn tokenizer_respects_quotes() {
        assert_eq!(
            tokenize(r#"hostname:h1 trace:"out of memory" foo"#),
            vec!["hostname:h1", r#"trace:"out of memory""#, "foo"]
        );
    }

    #[test]
    fn token_forms() {
        assert_eq!(parse("*").kind, ClauseKind::All);
        assert_eq!(
            parse("panic").kind,
            ClauseKind::Bareword("panic".to_owned())
        );
        assert_eq!(
            parse("hostname:h1").kind,
            ClauseKind::Term {
                field: "hostname".to_owned(),
                value: "h1".to_owned(),
                phrase: false,
            }
        );
        assert_eq!(
            parse(r#"executable_hash:"aa bb""#).kind,
            ClauseKind::Term {
                field: "executable_hash".to_owned(),
                value: "aa bb".to_owned(),
                phrase: true,
            }
        );
        assert_eq!(
            parse(r#"dumped_at:<"2020-01-01T00:00:00Z""#).kind,
            ClauseKind::Range {
                field: "dumped_at".to_owned(),
                op: RangeOp::Lt,
                value: "2020-01-01T00:00:00Z".to_owned(),
            }
        );
        assert!(parse("-hostname:h1").negated);
        assert!(!parse("+hostname:h1").negated);
    }

    #[test]
    fn empty_query_matches_all() {
        let compiled = compile("").unwrap();
        assert_eq!(compiled.sql, "1 = 1");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn unknown_field_matches_nothing() {
        let compiled = compile("nosuchfield:x").unwrap();
        assert_eq!(compiled.sql, "0 = 1");
    }

    #[test]
    fn bad_timestamp_is_a_query_error() {
        assert!(matches!(
            compile("dumped_at:<notadate"),
            Err(IndexError::Query(_))
        ));
    }

    #[test]
    fn wildcards_map_to_like() {
        let compiled = compile("analyzed:F*").unwrap();
        assert!(compiled.sql.contains("LIKE"));
        assert_eq!(compiled.params, vec![SqlValue::Text("F%".to_owned())]);
    }
}
