//! Compiled form of a server type's parsing rules.

use serde::{Deserialize, Serialize};

/// Semantic type of a listing column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ColumnKind {
    /// File name; exactly one per server type, always first.
    Name,
    /// Derived from the name, never assigned by rules.
    Ext,
    Size,
    /// Last-write date.
    Date,
    /// Last-write time.
    Time,
    /// File type description, never assigned by rules.
    Type,
    Text,
    GeneralDate,
    GeneralTime,
    Number,
}

impl ColumnKind {
    pub fn operand_type(self) -> Option<OperandType> {
        match self {
            ColumnKind::Name | ColumnKind::Text => Some(OperandType::Str),
            ColumnKind::Size | ColumnKind::Number => Some(OperandType::Number),
            ColumnKind::Date | ColumnKind::GeneralDate => Some(OperandType::Date),
            ColumnKind::Time | ColumnKind::GeneralTime => Some(OperandType::Time),
            ColumnKind::Ext | ColumnKind::Type => None,
        }
    }
}

/// Column of a server type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub id: String,
    pub kind: ColumnKind,
    /// Value used when a rule leaves the column unassigned.
    #[serde(default)]
    pub empty_value: Option<String>,
}

impl ColumnDef {
    pub fn new(id: &str, kind: ColumnKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            empty_value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    Bool,
    Str,
    Number,
    Date,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolVar {
    IsDir,
    IsHidden,
    IsLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateVar {
    FirstNonemptyLine,
    LastNonemptyLine,
    NextChar,
    NextWord,
    RestOfLine,
}

impl StateVar {
    pub fn operand_type(self) -> OperandType {
        match self {
            StateVar::FirstNonemptyLine | StateVar::LastNonemptyLine => OperandType::Bool,
            _ => OperandType::Str,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `==`, exact.
    Eq,
    /// `!=`, exact.
    NotEq,
    /// `eq`, strings, case-insensitive.
    StrEq,
    StrNotEq,
    /// `in`: left is a substring of right.
    In,
    NotIn,
    /// `end_with`: left ends with right.
    EndWith,
    NotEndWith,
}

impl BinOp {
    pub fn from_token(t: &str) -> Option<Self> {
        Some(match t {
            "==" => BinOp::Eq,
            "!=" => BinOp::NotEq,
            "eq" => BinOp::StrEq,
            "not_eq" => BinOp::StrNotEq,
            "in" => BinOp::In,
            "not_in" => BinOp::NotIn,
            "end_with" => BinOp::EndWith,
            "not_end_with" => BinOp::NotEndWith,
            _ => return None,
        })
    }

    /// Operators that only apply to strings.
    pub fn is_string_only(self) -> bool {
        !matches!(self, BinOp::Eq | BinOp::NotEq)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Number(i64),
    Str(String),
    Column(usize),
    BoolVar(BoolVar),
    State(StateVar),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Where `assign` stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignTarget {
    Column(usize),
    Bool(BoolVar),
}

/// One parsing function of a rule. `Option<usize>` is an optional target
/// column, a bare `usize` a required one.
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    SkipWhiteSpaces,
    SkipToNumber,
    WhiteSpaces(Option<usize>),
    WhiteSpacesAndLineEnds,
    RestOfLine(Option<usize>),
    Word(Option<usize>),
    Number(usize),
    PositiveNumber(usize),
    NumberWithSeparators(usize, String),
    Month3(usize, Option<Vec<String>>),
    MonthTxt(usize, Option<Vec<String>>),
    Month(usize),
    Day(usize),
    Year(usize),
    Time(usize),
    YearOrTime(usize, usize),
    All(Option<usize>, usize),
    AllTo(Option<usize>, String),
    AllUpTo(usize, String),
    /// `unix_link(<is_dir>, <name>, <link>)`
    UnixLink(usize, usize),
    UnixDevice(usize),
    If(Expr),
    Assign(AssignTarget, Expr),
    CutWhiteSpaces(usize),
    CutWhiteSpacesEnd(usize),
    CutWhiteSpacesStart(usize),
    Back(usize),
    AddStringToColumn(usize, Expr),
    CutEndOfString(usize, usize),
}

/// `* f1, f2, …;`
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub functions: Vec<Function>,
}
