//! Rule text and autodetect condition compiler.
//!
//! Rule grammar:
//! ```text
//! rules    := { '*' function { ',' function } ';' }
//! function := ident '(' [ arg { ',' arg } ] ')'
//! arg      := operand [ op operand ]
//! operand  := "string" | number | <column> | true | false | state
//! ```
//! `#` starts a comment running to the end of the line.

use regex::{Regex, RegexBuilder};

use super::ast::*;
use crate::ftp::error::{FtpError, FtpResult};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Star,
    Comma,
    Semicolon,
    LParen,
    RParen,
    Ident(String),
    Column(String),
    Str(String),
    Number(i64),
    /// `==` or `!=`
    Op(&'static str),
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    peeked: Option<(Token, usize)>,
}

impl Lexer {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            peeked: None,
        }
    }

    fn error(&self, msg: impl std::fmt::Display) -> FtpError {
        FtpError::invalid_config(format!("line {}: {}", self.line, msg))
    }

    fn skip_blanks(&mut self) {
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if c == '#' {
                while self.pos < self.chars.len() && self.chars[self.pos] != '\n' {
                    self.pos += 1;
                }
            } else if c <= ' ' {
                if c == '\n' {
                    self.line += 1;
                }
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> FtpResult<Option<&Token>> {
        if self.peeked.is_none() {
            if let Some(t) = self.lex()? {
                self.peeked = Some((t, self.line));
            }
        }
        Ok(self.peeked.as_ref().map(|(t, _)| t))
    }

    fn next(&mut self) -> FtpResult<Option<Token>> {
        if let Some((t, _)) = self.peeked.take() {
            return Ok(Some(t));
        }
        self.lex()
    }

    fn expect(&mut self, want: Token, what: &str) -> FtpResult<()> {
        match self.next()? {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(self.error(format_args!("expected {what}, found {t:?}"))),
            None => Err(self.error(format_args!("expected {what}, found end of text"))),
        }
    }

    fn lex(&mut self) -> FtpResult<Option<Token>> {
        self.skip_blanks();
        let Some(&c) = self.chars.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        let tok = match c {
            '*' => Token::Star,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '=' | '!' => {
                if self.chars.get(self.pos) != Some(&'=') {
                    return Err(self.error(format_args!("unexpected '{c}'")));
                }
                self.pos += 1;
                Token::Op(if c == '=' { "==" } else { "!=" })
            }
            '<' => {
                let start = self.pos;
                while self.pos < self.chars.len() && self.chars[self.pos] != '>' {
                    if self.chars[self.pos] <= ' ' {
                        return Err(self.error("unterminated column identifier"));
                    }
                    self.pos += 1;
                }
                if self.pos >= self.chars.len() {
                    return Err(self.error("unterminated column identifier"));
                }
                let id: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Token::Column(id)
            }
            '"' => Token::Str(self.lex_string()?),
            c if c.is_ascii_digit() => {
                let start = self.pos - 1;
                while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                let n = digits
                    .parse::<i64>()
                    .map_err(|_| self.error(format_args!("number {digits} is too large")))?;
                Token::Number(n)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = self.pos - 1;
                while self.pos < self.chars.len()
                    && (self.chars[self.pos].is_ascii_alphanumeric() || self.chars[self.pos] == '_')
                {
                    self.pos += 1;
                }
                let ident: String = self.chars[start..self.pos].iter().collect();
                Token::Ident(ident.to_ascii_lowercase())
            }
            c => return Err(self.error(format_args!("unexpected character '{c}'"))),
        };
        Ok(Some(tok))
    }

    fn lex_string(&mut self) -> FtpResult<String> {
        let mut out = String::new();
        loop {
            let Some(&c) = self.chars.get(self.pos) else {
                return Err(self.error("missing end of string"));
            };
            self.pos += 1;
            match c {
                '"' => return Ok(out),
                '\r' | '\n' => return Err(self.error("missing end of string")),
                '\\' => {
                    let Some(&e) = self.chars.get(self.pos) else {
                        return Err(self.error("missing end of string"));
                    };
                    self.pos += 1;
                    out.push(match e {
                        '"' => '"',
                        '\\' => '\\',
                        't' => '\t',
                        'r' => '\r',
                        'n' => '\n',
                        other => {
                            return Err(self.error(format_args!(
                                "unknown escape sequence '\\{other}'"
                            )))
                        }
                    });
                }
                c => out.push(c),
            }
        }
    }
}

// ── Rules ─────────────────────────────────────────────────────────────

const DAY: u8 = 1;
const MONTH: u8 = 2;
const YEAR: u8 = 4;
const FULL: u8 = DAY | MONTH | YEAR;

struct RuleCompiler<'a> {
    lex: Lexer,
    columns: &'a [ColumnDef],
    /// Per-rule record of which columns already hold a value. Date columns
    /// track day/month/year separately.
    assigned: Vec<u8>,
}

/// Compiles the rule text of a server type against its columns.
pub fn compile_rules(text: &str, columns: &[ColumnDef]) -> FtpResult<Vec<Rule>> {
    validate_columns(columns)?;
    let mut c = RuleCompiler {
        lex: Lexer::new(text),
        columns,
        assigned: vec![0; columns.len()],
    };
    let mut rules = Vec::new();
    while let Some(tok) = c.lex.next()? {
        if tok != Token::Star {
            return Err(c.lex.error("rule must start with '*'"));
        }
        c.assigned.iter_mut().for_each(|a| *a = 0);
        let mut functions = vec![c.function()?];
        loop {
            match c.lex.next()? {
                Some(Token::Comma) => functions.push(c.function()?),
                Some(Token::Semicolon) => break,
                _ => return Err(c.lex.error("expected ',' or ';'")),
            }
        }
        rules.push(Rule { functions });
    }
    if rules.is_empty() {
        return Err(FtpError::invalid_config("server type has no parsing rules"));
    }
    Ok(rules)
}

fn validate_columns(columns: &[ColumnDef]) -> FtpResult<()> {
    match columns.first() {
        Some(c) if c.kind == ColumnKind::Name => {}
        _ => return Err(FtpError::invalid_config("first column must be the name column")),
    }
    for (kind, label) in [
        (ColumnKind::Name, "name"),
        (ColumnKind::Ext, "extension"),
        (ColumnKind::Size, "size"),
        (ColumnKind::Date, "date"),
        (ColumnKind::Time, "time"),
        (ColumnKind::Type, "type"),
    ] {
        if columns.iter().filter(|c| c.kind == kind).count() > 1 {
            return Err(FtpError::invalid_config(format!(
                "more than one {label} column"
            )));
        }
    }
    for (i, c) in columns.iter().enumerate() {
        if columns[..i].iter().any(|o| o.id.eq_ignore_ascii_case(&c.id)) {
            return Err(FtpError::invalid_config(format!(
                "duplicate column identifier '{}'",
                c.id
            )));
        }
    }
    Ok(())
}

impl<'a> RuleCompiler<'a> {
    fn function(&mut self) -> FtpResult<Function> {
        let name = match self.lex.next()? {
            Some(Token::Ident(name)) => name,
            _ => return Err(self.lex.error("expected function name")),
        };
        self.lex.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if self.lex.peek()? == Some(&Token::RParen) {
            self.lex.next()?;
        } else {
            loop {
                args.push(self.arg()?);
                match self.lex.next()? {
                    Some(Token::Comma) => {}
                    Some(Token::RParen) => break,
                    _ => return Err(self.lex.error("expected ',' or ')'")),
                }
            }
        }
        self.build(&name, args)
    }

    fn arg(&mut self) -> FtpResult<Expr> {
        let lhs = self.operand()?;
        let op = match self.lex.peek()? {
            Some(Token::Op(op)) => BinOp::from_token(op),
            Some(Token::Ident(id)) => BinOp::from_token(id),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        self.lex.next()?;
        let rhs = self.operand()?;
        let (lt, rt) = (self.type_of(&lhs)?, self.type_of(&rhs)?);
        if lt != rt {
            return Err(self.lex.error("operands of a comparison must have the same type"));
        }
        if op.is_string_only() && lt != OperandType::Str {
            return Err(self.lex.error("operator applies to strings only"));
        }
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn operand(&mut self) -> FtpResult<Expr> {
        Ok(match self.lex.next()? {
            Some(Token::Str(s)) => Expr::Str(s),
            Some(Token::Number(n)) => Expr::Number(n),
            Some(Token::Column(id)) => self.column_expr(&id)?,
            Some(Token::Ident(id)) => match id.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "first_nonempty_line" => Expr::State(StateVar::FirstNonemptyLine),
                "last_nonempty_line" => Expr::State(StateVar::LastNonemptyLine),
                "next_char" => Expr::State(StateVar::NextChar),
                "next_word" => Expr::State(StateVar::NextWord),
                "rest_of_line" => Expr::State(StateVar::RestOfLine),
                _ => return Err(self.lex.error(format_args!("unknown identifier '{id}'"))),
            },
            _ => return Err(self.lex.error("expected a parameter")),
        })
    }

    fn column_expr(&self, id: &str) -> FtpResult<Expr> {
        let lower = id.to_ascii_lowercase();
        Ok(match lower.as_str() {
            "is_dir" => Expr::BoolVar(BoolVar::IsDir),
            "is_hidden" => Expr::BoolVar(BoolVar::IsHidden),
            "is_link" => Expr::BoolVar(BoolVar::IsLink),
            _ => {
                let idx = self
                    .columns
                    .iter()
                    .position(|c| c.id.eq_ignore_ascii_case(id))
                    .ok_or_else(|| self.lex.error(format_args!("unknown column <{id}>")))?;
                Expr::Column(idx)
            }
        })
    }

    fn type_of(&self, e: &Expr) -> FtpResult<OperandType> {
        Ok(match e {
            Expr::Bool(_) | Expr::BoolVar(_) | Expr::Binary { .. } => OperandType::Bool,
            Expr::Number(_) => OperandType::Number,
            Expr::Str(_) => OperandType::Str,
            Expr::State(s) => s.operand_type(),
            Expr::Column(i) => self.columns[*i].kind.operand_type().ok_or_else(|| {
                self.lex.error(format_args!(
                    "column <{}> cannot be used in rules",
                    self.columns[*i].id
                ))
            })?,
        })
    }

    fn bad(&self, name: &str) -> FtpError {
        self.lex.error(format_args!("bad parameters of function {name}()"))
    }

    /// Column parameter of the given operand type.
    fn col(&self, name: &str, e: Option<&Expr>, want: OperandType) -> FtpResult<usize> {
        match e {
            Some(Expr::Column(i)) if self.columns[*i].kind.operand_type() == Some(want) => Ok(*i),
            _ => Err(self.bad(name)),
        }
    }

    fn num(&self, name: &str, e: Option<&Expr>) -> FtpResult<usize> {
        match e {
            Some(Expr::Number(n)) if *n >= 0 => Ok(*n as usize),
            _ => Err(self.bad(name)),
        }
    }

    fn string(&self, name: &str, e: Option<&Expr>) -> FtpResult<String> {
        match e {
            Some(Expr::Str(s)) => Ok(s.clone()),
            _ => Err(self.bad(name)),
        }
    }

    fn mark(&mut self, col: usize, bits: u8) {
        self.assigned[col] |= bits;
    }

    fn require_assigned(&self, col: usize) -> FtpResult<()> {
        let want = if self.columns[col].kind.operand_type() == Some(OperandType::Date) {
            FULL
        } else {
            1
        };
        if self.assigned[col] & want == want {
            Ok(())
        } else {
            Err(self.lex.error(format_args!(
                "column <{}> is read before it is assigned",
                self.columns[col].id
            )))
        }
    }

    fn build(&mut self, name: &str, args: Vec<Expr>) -> FtpResult<Function> {
        use OperandType as T;
        let n = args.len();
        let a0 = args.first();
        let a1 = args.get(1);
        let f = match name {
            "skip_white_spaces" | "skip_to_number" | "white_spaces_and_line_ends" if n == 0 => {
                match name {
                    "skip_white_spaces" => Function::SkipWhiteSpaces,
                    "skip_to_number" => Function::SkipToNumber,
                    _ => Function::WhiteSpacesAndLineEnds,
                }
            }
            "white_spaces" if n == 0 => Function::WhiteSpaces(None),
            "white_spaces" if n == 1 => Function::WhiteSpaces(Some(self.num(name, a0)?)),
            "rest_of_line" | "word" if n <= 1 => {
                let col = match a0 {
                    Some(_) => {
                        let c = self.col(name, a0, T::Str)?;
                        self.mark(c, FULL);
                        Some(c)
                    }
                    None => None,
                };
                if name == "word" {
                    Function::Word(col)
                } else {
                    Function::RestOfLine(col)
                }
            }
            "number" | "positive_number" if n == 1 => {
                let c = self.col(name, a0, T::Number)?;
                self.mark(c, FULL);
                if name == "number" {
                    Function::Number(c)
                } else {
                    Function::PositiveNumber(c)
                }
            }
            "number_with_separators" if n == 2 => {
                let c = self.col(name, a0, T::Number)?;
                let seps = self.string(name, a1)?;
                self.mark(c, FULL);
                Function::NumberWithSeparators(c, seps)
            }
            "month_3" | "month_txt" if n == 1 || n == 2 => {
                let c = self.col(name, a0, T::Date)?;
                let names = match a1 {
                    Some(_) => {
                        let s = self.string(name, a1)?;
                        Some(if name == "month_3" {
                            month_3_list(&s)
                        } else {
                            month_txt_list(&s)
                        }
                        .ok_or_else(|| {
                            self.lex.error(format_args!("invalid month list in {name}()"))
                        })?)
                    }
                    None => None,
                };
                self.mark(c, MONTH);
                if name == "month_3" {
                    Function::Month3(c, names)
                } else {
                    Function::MonthTxt(c, names)
                }
            }
            "month" | "day" | "year" if n == 1 => {
                let c = self.col(name, a0, T::Date)?;
                match name {
                    "month" => {
                        self.mark(c, MONTH);
                        Function::Month(c)
                    }
                    "day" => {
                        self.mark(c, DAY);
                        Function::Day(c)
                    }
                    _ => {
                        self.mark(c, YEAR);
                        Function::Year(c)
                    }
                }
            }
            "time" if n == 1 => {
                let c = self.col(name, a0, T::Time)?;
                self.mark(c, FULL);
                Function::Time(c)
            }
            "year_or_time" if n == 2 => {
                let d = self.col(name, a0, T::Date)?;
                let t = self.col(name, a1, T::Time)?;
                self.mark(d, YEAR);
                Function::YearOrTime(d, t)
            }
            "all" if n == 1 => Function::All(None, self.num(name, a0)?),
            "all" if n == 2 => {
                let c = self.col(name, a0, T::Str)?;
                let count = self.num(name, a1)?;
                self.mark(c, FULL);
                Function::All(Some(c), count)
            }
            "all_to" if n == 1 => Function::AllTo(None, self.string(name, a0)?),
            "all_to" | "all_up_to" if n == 2 => {
                let c = self.col(name, a0, T::Str)?;
                let s = self.string(name, a1)?;
                self.mark(c, FULL);
                if name == "all_to" {
                    Function::AllTo(Some(c), s)
                } else {
                    Function::AllUpTo(c, s)
                }
            }
            "unix_link" if n == 3 => {
                if a0 != Some(&Expr::BoolVar(BoolVar::IsDir)) {
                    return Err(self.bad(name));
                }
                let name_col = self.col(name, a1, T::Str)?;
                if self.columns[name_col].kind != ColumnKind::Name {
                    return Err(self.bad(name));
                }
                let link_col = self.col(name, args.get(2), T::Str)?;
                self.mark(name_col, FULL);
                Function::UnixLink(name_col, link_col)
            }
            "unix_device" if n == 1 => {
                let c = self.col(name, a0, T::Str)?;
                self.mark(c, FULL);
                Function::UnixDevice(c)
            }
            "if" if n == 1 => {
                let e = a0.cloned().ok_or_else(|| self.bad(name))?;
                if self.type_of(&e)? != T::Bool {
                    return Err(self.bad(name));
                }
                Function::If(e)
            }
            "assign" if n == 2 => {
                let (Some(target), Some(value)) = (a0.cloned(), a1.cloned()) else {
                    return Err(self.bad(name));
                };
                let value_type = self.type_of(&value)?;
                if let Expr::Column(src) = value {
                    self.require_assigned(src)?;
                }
                match target {
                    Expr::BoolVar(v) if value_type == T::Bool => {
                        Function::Assign(AssignTarget::Bool(v), value)
                    }
                    Expr::Column(c) if self.columns[c].kind.operand_type() == Some(value_type) => {
                        // dates and times can only be copied between columns
                        if matches!(value_type, T::Date | T::Time)
                            && !matches!(value, Expr::Column(_))
                        {
                            return Err(self.bad(name));
                        }
                        self.mark(c, FULL);
                        Function::Assign(AssignTarget::Column(c), value)
                    }
                    _ => return Err(self.bad(name)),
                }
            }
            "cut_white_spaces" | "cut_white_spaces_end" | "cut_white_spaces_start" if n == 1 => {
                let c = self.col(name, a0, T::Str)?;
                self.require_assigned(c)?;
                match name {
                    "cut_white_spaces" => Function::CutWhiteSpaces(c),
                    "cut_white_spaces_end" => Function::CutWhiteSpacesEnd(c),
                    _ => Function::CutWhiteSpacesStart(c),
                }
            }
            "back" if n == 1 => Function::Back(self.num(name, a0)?),
            "add_string_to_column" if n == 2 => {
                let c = self.col(name, a0, T::Str)?;
                self.require_assigned(c)?;
                let value = a1.cloned().ok_or_else(|| self.bad(name))?;
                if self.type_of(&value)? != T::Str {
                    return Err(self.bad(name));
                }
                if let Expr::Column(src) = value {
                    self.require_assigned(src)?;
                }
                Function::AddStringToColumn(c, value)
            }
            "cut_end_of_string" if n == 2 => {
                let c = self.col(name, a0, T::Str)?;
                self.require_assigned(c)?;
                Function::CutEndOfString(c, self.num(name, a1)?)
            }
            _ if is_known_function(name) => return Err(self.bad(name)),
            _ => return Err(self.lex.error(format_args!("unknown function {name}()"))),
        };
        Ok(f)
    }
}

fn is_known_function(name: &str) -> bool {
    const NAMES: &[&str] = &[
        "skip_white_spaces",
        "skip_to_number",
        "white_spaces",
        "white_spaces_and_line_ends",
        "rest_of_line",
        "word",
        "number",
        "positive_number",
        "number_with_separators",
        "month_3",
        "month_txt",
        "month",
        "day",
        "year",
        "time",
        "year_or_time",
        "all",
        "all_to",
        "all_up_to",
        "unix_link",
        "unix_device",
        "if",
        "assign",
        "cut_white_spaces_end",
        "cut_white_spaces_start",
        "cut_white_spaces",
        "back",
        "add_string_to_column",
        "cut_end_of_string",
    ];
    NAMES.contains(&name)
}

/// `"jan feb mar …"`: twelve three-letter names separated by single spaces.
fn month_3_list(s: &str) -> Option<Vec<String>> {
    let names: Vec<String> = s.split(' ').map(str::to_string).collect();
    (names.len() == 12 && names.iter().all(|m| m.chars().count() == 3)).then_some(names)
}

/// Twelve non-empty month names separated by single spaces.
fn month_txt_list(s: &str) -> Option<Vec<String>> {
    let names: Vec<String> = s.split(' ').map(str::to_string).collect();
    (names.len() == 12 && names.iter().all(|m| !m.is_empty())).then_some(names)
}

// ── Autodetect conditions ─────────────────────────────────────────────

/// Compiled autodetect condition of a server type.
#[derive(Debug, Clone)]
pub enum Condition {
    Always,
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    SystContains(String),
    WelcomeContains(String),
    SystMatches(Regex),
    WelcomeMatches(Regex),
}

impl Condition {
    /// Evaluates against the server's first reply and its SYST reply.
    pub fn evaluate(&self, welcome: &str, syst: &str) -> bool {
        match self {
            Condition::Always => true,
            Condition::Or(a, b) => a.evaluate(welcome, syst) || b.evaluate(welcome, syst),
            Condition::And(a, b) => a.evaluate(welcome, syst) && b.evaluate(welcome, syst),
            Condition::Not(c) => !c.evaluate(welcome, syst),
            Condition::SystContains(p) => contains_ignore_case(syst, p),
            Condition::WelcomeContains(p) => contains_ignore_case(welcome, p),
            Condition::SystMatches(r) => r.is_match(syst),
            Condition::WelcomeMatches(r) => r.is_match(welcome),
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Compiles an autodetect condition such as
/// `not syst_contains("z/VM ") and welcome_contains("FTP")`.
///
/// Precedence: `not` binds tighter than `and`, `and` tighter than `or`.
pub fn compile_condition(text: &str) -> FtpResult<Condition> {
    let mut lex = Lexer::new(text);
    let cond = cond_or(&mut lex)?;
    if lex.next()?.is_some() {
        return Err(lex.error("unexpected text after condition"));
    }
    Ok(cond)
}

fn cond_or(lex: &mut Lexer) -> FtpResult<Condition> {
    let mut left = cond_and(lex)?;
    while matches!(lex.peek()?, Some(Token::Ident(id)) if id == "or") {
        lex.next()?;
        let right = cond_and(lex)?;
        left = Condition::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn cond_and(lex: &mut Lexer) -> FtpResult<Condition> {
    let mut left = cond_unary(lex)?;
    while matches!(lex.peek()?, Some(Token::Ident(id)) if id == "and") {
        lex.next()?;
        let right = cond_unary(lex)?;
        left = Condition::And(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn cond_unary(lex: &mut Lexer) -> FtpResult<Condition> {
    match lex.next()? {
        Some(Token::LParen) => {
            let inner = cond_or(lex)?;
            lex.expect(Token::RParen, "')'")?;
            Ok(inner)
        }
        Some(Token::Ident(id)) if id == "not" => Ok(Condition::Not(Box::new(cond_unary(lex)?))),
        Some(Token::Ident(func)) => {
            lex.expect(Token::LParen, "'('")?;
            let pattern = match lex.next()? {
                Some(Token::Str(s)) => s,
                _ => return Err(lex.error("expected a string")),
            };
            lex.expect(Token::RParen, "')'")?;
            if pattern.is_empty() {
                return Ok(Condition::Always);
            }
            let regex = |p: &str| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| lex.error(format_args!("invalid regular expression: {e}")))
            };
            match func.as_str() {
                "syst_contains" => Ok(Condition::SystContains(pattern)),
                "welcome_contains" => Ok(Condition::WelcomeContains(pattern)),
                "reg_exp_in_syst" => Ok(Condition::SystMatches(regex(&pattern)?)),
                "reg_exp_in_welcome" => Ok(Condition::WelcomeMatches(regex(&pattern)?)),
                _ => Err(lex.error(format_args!("unknown function {func}()"))),
            }
        }
        _ => Err(lex.error("expected a condition")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("name", ColumnKind::Name),
            ColumnDef::new("size", ColumnKind::Size),
            ColumnDef::new("date", ColumnKind::Date),
            ColumnDef::new("time", ColumnKind::Time),
            ColumnDef::new("user", ColumnKind::Text),
        ]
    }

    #[test]
    fn compiles_rules_with_comments_and_expressions() {
        let rules = compile_rules(
            "# comment\r\n* if(next_char!=\"l\"), assign(<is_dir>, next_char==\"d\"),\r\n  word(<user>), white_spaces(), rest_of_line(<name>);\r\n* skip_white_spaces();",
            &cols(),
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].functions.len(), 5);
        assert_eq!(rules[0].functions[2], Function::Word(Some(4)));
        assert!(matches!(
            &rules[0].functions[0],
            Function::If(Expr::Binary { op: BinOp::NotEq, .. })
        ));
    }

    #[test]
    fn string_escapes() {
        let rules = compile_rules("* all_to(<name>, \"a\\\"b\\\\c\\t\");", &cols()).unwrap();
        assert_eq!(
            rules[0].functions[0],
            Function::AllTo(Some(0), "a\"b\\c\t".to_string())
        );
        assert!(compile_rules("* all_to(<name>, \"\\q\");", &cols()).is_err());
        assert!(compile_rules("* all_to(<name>, \"abc);", &cols()).is_err());
    }

    #[test]
    fn rejects_bad_parameters() {
        // number() needs a numeric column
        assert!(compile_rules("* number(<user>);", &cols()).is_err());
        assert!(compile_rules("* frobnicate();", &cols()).is_err());
        assert!(compile_rules("* word(<nope>);", &cols()).is_err());
        // missing ';'
        assert!(compile_rules("* word()", &cols()).is_err());
    }

    #[test]
    fn rejects_read_before_assign() {
        assert!(compile_rules("* cut_white_spaces(<user>);", &cols()).is_err());
        assert!(compile_rules("* word(<user>), cut_white_spaces(<user>);", &cols()).is_ok());
        assert!(compile_rules("* day(<date>), assign(<date>, <date>);", &cols()).is_err());
    }

    #[test]
    fn string_operators_need_strings() {
        assert!(compile_rules("* if(<size> in \"123\");", &cols()).is_err());
        assert!(compile_rules("* if(\"<\" not_in next_word);", &cols()).is_ok());
    }

    #[test]
    fn month_lists_are_validated() {
        assert!(compile_rules(
            "* month_3(<date>, \"jan feb mar apr may jun jul aug sep oct nov dec\");",
            &cols()
        )
        .is_ok());
        assert!(compile_rules("* month_3(<date>, \"jan feb\");", &cols()).is_err());
    }

    #[test]
    fn condition_precedence() {
        let c = compile_condition(
            "not syst_contains(\"z/VM \") and not syst_contains(\"OS/2 \") or welcome_contains(\"VxWorks\")",
        )
        .unwrap();
        assert!(c.evaluate("", "215 UNIX Type: L8"));
        assert!(!c.evaluate("", "215 z/VM Version"));
        assert!(c.evaluate("220 vxworks FTP", "215 z/VM Version"));
    }

    #[test]
    fn condition_regex_and_empty_pattern() {
        let c = compile_condition("reg_exp_in_syst(\"^215 unix\")").unwrap();
        assert!(c.evaluate("", "215 UNIX Type: L8"));
        assert!(!c.evaluate("", "215 Windows_NT"));
        assert!(compile_condition("syst_contains(\"\")")
            .unwrap()
            .evaluate("", ""));
        assert!(compile_condition("reg_exp_in_syst(\"(\")").is_err());
        assert!(compile_condition("syst_contains(\"x\") junk").is_err());
    }
}
