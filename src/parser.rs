use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use crate::error::TidepoolError;

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Integer,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Integer(i64),
    Text(String),
    Null,
    Column(String),
    Div(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Star,
    CountStar,
    Items(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        table: String,
    },
    AlterTableAddColumn {
        table: String,
        column: ColumnDef,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        values: Vec<Expr>,
    },
    Select {
        projection: Projection,
        table: Option<String>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
    },
    Delete {
        table: String,
    },
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
    DeallocateAll,
    DiscardAll,
}

impl Statement {
    pub fn parse(input: &str) -> Result<Statement, TidepoolError> {
        let trailer = tuple((multispace0, opt(char(';')), multispace0));
        all_consuming(delimited(multispace0, parse_statement, trailer))(input)
            .map(|(_, stmt)| stmt)
            .map_err(|e| TidepoolError::Parse(format!("cannot parse {:?}: {}", input, e)))
    }

    /// Statements the server still accepts while the transaction is aborted.
    pub fn allowed_in_failed_transaction(&self) -> bool {
        matches!(
            self,
            Statement::Commit | Statement::Rollback | Statement::RollbackToSavepoint(_)
        )
    }

    /// DEALLOCATE/DISCARD drop every server-prepared statement of the session.
    pub fn invalidates_statement_cache(&self) -> bool {
        matches!(self, Statement::DeallocateAll | Statement::DiscardAll)
    }

    /// Table whose cached plans become suspect after this statement runs.
    pub fn altered_table(&self) -> Option<&str> {
        match self {
            Statement::AlterTableAddColumn { table, .. } => Some(table),
            Statement::DropTable { table } => Some(table),
            _ => None,
        }
    }

    pub fn referenced_table(&self) -> Option<&str> {
        match self {
            Statement::CreateTable { table, .. }
            | Statement::DropTable { table }
            | Statement::AlterTableAddColumn { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table } => Some(table),
            Statement::Select { table, .. } => table.as_deref(),
            _ => None,
        }
    }
}

/// Quotes an identifier for inclusion in emitted SQL. Plain lowercase
/// identifiers pass through; anything else is double-quoted with embedded
/// quotes doubled.
pub fn quote_ident(name: &str) -> String {
    let plain = !name.is_empty()
        && !name.chars().next().unwrap_or('0').is_ascii_digit()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn unquoted_identifier(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || c == '_'),
        String::from,
    )(input)
}

fn quoted_identifier(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let mut out = String::new();
    let mut rest = input;
    loop {
        match rest.find('"') {
            Some(idx) => {
                out.push_str(&rest[..idx]);
                if rest[idx + 1..].starts_with('"') {
                    out.push('"');
                    rest = &rest[idx + 2..];
                } else {
                    return Ok((&rest[idx + 1..], out));
                }
            }
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    rest,
                    nom::error::ErrorKind::Char,
                )))
            }
        }
    }
}

fn identifier(input: &str) -> IResult<&str, String> {
    alt((quoted_identifier, unquoted_identifier))(input)
}

fn string_literal(input: &str) -> IResult<&str, String> {
    let (input, _) = char('\'')(input)?;
    let mut out = String::new();
    let mut rest = input;
    loop {
        match rest.find('\'') {
            Some(idx) => {
                out.push_str(&rest[..idx]);
                if rest[idx + 1..].starts_with('\'') {
                    out.push('\'');
                    rest = &rest[idx + 2..];
                } else {
                    return Ok((&rest[idx + 1..], out));
                }
            }
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    rest,
                    nom::error::ErrorKind::Char,
                )))
            }
        }
    }
}

fn integer_literal(input: &str) -> IResult<&str, i64> {
    let (input, neg) = opt(char('-'))(input)?;
    let (input, digits) = digit1(input)?;
    let mut n: i64 = digits.parse().unwrap_or(i64::MAX);
    if neg.is_some() {
        n = -n;
    }
    Ok((input, n))
}

fn primary_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(integer_literal, Expr::Integer),
        map(string_literal, Expr::Text),
        value(Expr::Null, tag_no_case("NULL")),
        map(identifier, Expr::Column),
    ))(input)
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = primary_expr(input)?;
    let (input, rhs) = opt(preceded(
        delimited(multispace0, char('/'), multispace0),
        primary_expr,
    ))(input)?;
    Ok((
        input,
        match rhs {
            Some(rhs) => Expr::Div(Box::new(lhs), Box::new(rhs)),
            None => lhs,
        },
    ))
}

fn comma(input: &str) -> IResult<&str, ()> {
    value((), delimited(multispace0, char(','), multispace0))(input)
}

fn parse_data_type(input: &str) -> IResult<&str, DataType> {
    alt((
        value(DataType::Integer, tag_no_case("INTEGER")),
        value(DataType::Integer, tag_no_case("INT")),
        value(DataType::Text, tag_no_case("TEXT")),
    ))(input)
}

fn parse_column_def(input: &str) -> IResult<&str, ColumnDef> {
    let (input, name) = identifier(input)?;
    let (input, _) = multispace1(input)?;
    let (input, data_type) = parse_data_type(input)?;
    let (input, pk) = opt(preceded(
        multispace1,
        tuple((tag_no_case("PRIMARY"), multispace1, tag_no_case("KEY"))),
    ))(input)?;
    Ok((
        input,
        ColumnDef {
            name,
            data_type,
            primary_key: pk.is_some(),
        },
    ))
}

fn parse_create(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("CREATE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("TABLE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, table) = identifier(input)?;
    let (input, _) = multispace0(input)?;
    let (input, columns) = delimited(
        char('('),
        delimited(
            multispace0,
            separated_list1(comma, parse_column_def),
            multispace0,
        ),
        char(')'),
    )(input)?;
    Ok((input, Statement::CreateTable { table, columns }))
}

fn parse_drop(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("DROP")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("TABLE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, table) = identifier(input)?;
    Ok((input, Statement::DropTable { table }))
}

fn parse_alter(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("ALTER")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("TABLE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, table) = identifier(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("ADD")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = opt(terminated(tag_no_case("COLUMN"), multispace1))(input)?;
    let (input, column) = parse_column_def(input)?;
    Ok((input, Statement::AlterTableAddColumn { table, column }))
}

fn parse_insert(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("INSERT")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("INTO")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, table) = identifier(input)?;
    let (input, _) = multispace0(input)?;
    let (input, columns) = opt(delimited(
        char('('),
        delimited(multispace0, separated_list1(comma, identifier), multispace0),
        char(')'),
    ))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = tag_no_case("VALUES")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, values) = delimited(
        char('('),
        delimited(multispace0, separated_list0(comma, expr), multispace0),
        char(')'),
    )(input)?;
    Ok((
        input,
        Statement::Insert {
            table,
            columns,
            values,
        },
    ))
}

fn parse_projection(input: &str) -> IResult<&str, Projection> {
    alt((
        value(Projection::Star, char('*')),
        value(
            Projection::CountStar,
            tuple((
                tag_no_case("COUNT"),
                multispace0,
                char('('),
                multispace0,
                char('*'),
                multispace0,
                char(')'),
            )),
        ),
        map(separated_list1(comma, expr), Projection::Items),
    ))(input)
}

fn parse_select(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("SELECT")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, projection) = parse_projection(input)?;
    let (input, table) = opt(preceded(
        tuple((multispace1, tag_no_case("FROM"), multispace1)),
        identifier,
    ))(input)?;
    Ok((input, Statement::Select { projection, table }))
}

fn parse_update(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("UPDATE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, table) = identifier(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("SET")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, assignments) = separated_list1(
        comma,
        map(
            tuple((
                identifier,
                delimited(multispace0, char('='), multispace0),
                expr,
            )),
            |(col, _, value)| (col, value),
        ),
    )(input)?;
    Ok((input, Statement::Update { table, assignments }))
}

fn parse_delete(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("DELETE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("FROM")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, table) = identifier(input)?;
    Ok((input, Statement::Delete { table }))
}

fn parse_transaction_control(input: &str) -> IResult<&str, Statement> {
    alt((
        value(
            Statement::Begin,
            pair(
                tag_no_case("START"),
                preceded(multispace1, tag_no_case("TRANSACTION")),
            ),
        ),
        value(Statement::Begin, tag_no_case("BEGIN")),
        value(Statement::Commit, tag_no_case("COMMIT")),
        value(Statement::Commit, tag_no_case("END")),
        map(
            preceded(
                tuple((
                    tag_no_case("ROLLBACK"),
                    multispace1,
                    tag_no_case("TO"),
                    multispace1,
                    opt(terminated(tag_no_case("SAVEPOINT"), multispace1)),
                )),
                identifier,
            ),
            Statement::RollbackToSavepoint,
        ),
        value(Statement::Rollback, tag_no_case("ROLLBACK")),
        map(
            preceded(
                tuple((
                    tag_no_case("RELEASE"),
                    multispace1,
                    opt(terminated(tag_no_case("SAVEPOINT"), multispace1)),
                )),
                identifier,
            ),
            Statement::ReleaseSavepoint,
        ),
        map(
            preceded(pair(tag_no_case("SAVEPOINT"), multispace1), identifier),
            Statement::Savepoint,
        ),
        value(
            Statement::DeallocateAll,
            pair(
                tag_no_case("DEALLOCATE"),
                preceded(multispace1, tag_no_case("ALL")),
            ),
        ),
        value(
            Statement::DiscardAll,
            pair(
                tag_no_case("DISCARD"),
                preceded(multispace1, tag_no_case("ALL")),
            ),
        ),
    ))(input)
}

fn parse_statement(input: &str) -> IResult<&str, Statement> {
    alt((
        parse_create,
        parse_drop,
        parse_alter,
        parse_insert,
        parse_select,
        parse_update,
        parse_delete,
        parse_transaction_control,
    ))(input)
}
