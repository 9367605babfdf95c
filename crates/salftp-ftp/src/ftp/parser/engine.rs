//! Executes compiled rules over listing text.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, NaiveTime};

use super::ast::*;
use crate::ftp::types::{FtpEntry, FtpEntryKind};

const LANG_EN: u8 = 0x01;
const LANG_DE: u8 = 0x02;
const LANG_NO: u8 = 0x04;
const LANG_SV: u8 = 0x08;
const LANG_ALL: u8 = LANG_EN | LANG_DE | LANG_NO | LANG_SV;

/// Three-letter month names with the languages using them.
const MONTHS_3: &[(&str, u32, u8)] = &[
    ("jan", 1, LANG_ALL),
    ("feb", 2, LANG_ALL),
    ("mar", 3, LANG_EN | LANG_NO | LANG_SV),
    ("apr", 4, LANG_ALL),
    ("may", 5, LANG_EN),
    ("jun", 6, LANG_ALL),
    ("jul", 7, LANG_ALL),
    ("aug", 8, LANG_ALL),
    ("sep", 9, LANG_ALL),
    ("oct", 10, LANG_EN),
    ("nov", 11, LANG_ALL),
    ("dec", 12, LANG_EN | LANG_SV),
    ("mär", 3, LANG_DE),
    ("mai", 5, LANG_DE | LANG_NO),
    ("okt", 10, LANG_DE | LANG_NO | LANG_SV),
    ("dez", 12, LANG_DE),
    ("des", 12, LANG_NO),
    ("maj", 5, LANG_SV),
];

/// Textual month names, matched as a prefix of the current word.
const MONTHS_TXT: &[(&str, u32, u8)] = &[
    ("Jan.", 1, LANG_DE),
    ("Feb.", 2, LANG_DE),
    ("März", 3, LANG_DE),
    ("Apr.", 4, LANG_DE),
    ("Mai", 5, LANG_DE),
    ("Juni", 6, LANG_DE),
    ("Juli", 7, LANG_DE),
    ("Aug.", 8, LANG_DE),
    ("Sept.", 9, LANG_DE),
    ("Okt.", 10, LANG_DE),
    ("Nov.", 11, LANG_DE),
    ("Dez.", 12, LANG_DE),
];

/// Result of running one server type over a listing.
#[derive(Debug, Clone, Default)]
pub struct ParsedListing {
    pub entries: Vec<FtpEntry>,
    /// Lines no rule matched; they are dropped from `entries`.
    pub skipped_lines: usize,
    /// Parsing stopped at a trailing partial line of an incomplete listing.
    pub incomplete_stop: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DateParts {
    day: Option<u32>,
    month: Option<u32>,
    year: Option<i32>,
    /// Year was guessed from the current date and may be one too high.
    year_correction: bool,
}

impl DateParts {
    fn complete(&self) -> Option<(i32, u32, u32)> {
        Some((self.year?, self.month?, self.day?))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Number(i64),
    Time(NaiveTime),
}

#[derive(Debug, Clone)]
struct Row {
    values: Vec<Option<Value>>,
    /// Date columns collect day, month and year separately.
    dates: Vec<Option<DateParts>>,
    is_dir: bool,
    is_hidden: bool,
    is_link: bool,
}

impl Row {
    fn new(columns: usize) -> Self {
        Self {
            values: vec![None; columns],
            dates: vec![None; columns],
            is_dir: false,
            is_hidden: false,
            is_link: false,
        }
    }

    fn text(&self, col: usize) -> &str {
        match &self.values[col] {
            Some(Value::Text(s)) => s,
            _ => "",
        }
    }

    fn date_mut(&mut self, col: usize) -> &mut DateParts {
        self.dates[col].get_or_insert_with(DateParts::default)
    }
}

/// Operand value during expression evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Bool(bool),
    Str(String),
    Number(i64),
    Date(Option<(i32, u32, u32)>),
    Time(Option<NaiveTime>),
}

fn is_eol(c: char) -> bool {
    c == '\r' || c == '\n'
}

fn is_ws(c: char) -> bool {
    c <= ' ' && !is_eol(c)
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Parse state of one listing.
pub(crate) struct ParseRun<'a> {
    text: &'a [char],
    columns: &'a [ColumnDef],
    today: NaiveDate,
    incomplete: bool,
    skip_incomplete: bool,
    lang_mask: u8,
    first_nonempty: Option<(usize, usize)>,
    last_nonempty: Option<(usize, usize)>,
}

impl<'a> ParseRun<'a> {
    pub fn new(
        text: &'a [char],
        columns: &'a [ColumnDef],
        today: NaiveDate,
        incomplete: bool,
    ) -> Self {
        Self {
            text,
            columns,
            today,
            incomplete,
            skip_incomplete: false,
            lang_mask: LANG_ALL,
            first_nonempty: first_nonempty_line(text),
            last_nonempty: last_nonempty_line(text),
        }
    }

    pub fn run(mut self, rules: &[Rule]) -> ParsedListing {
        let mut out = ParsedListing::default();
        let len = self.text.len();
        let mut pos = 0;
        while pos < len {
            let mut matched = None;
            for rule in rules {
                let mut row = Row::new(self.columns.len());
                let mut cur = pos;
                if self.apply_rule(rule, &mut cur, &mut row) {
                    matched = Some((cur, row));
                    break;
                }
            }
            if self.skip_incomplete {
                out.incomplete_stop = true;
                break;
            }
            match matched {
                Some((cur, row)) => {
                    pos = cur.max(pos + 1).min(len);
                    if row.values[0].is_some() {
                        out.entries.push(self.finish(row));
                    }
                }
                None => {
                    out.skipped_lines += 1;
                    pos = self.next_line(pos);
                }
            }
        }
        out
    }

    fn next_line(&self, mut pos: usize) -> usize {
        while pos < self.text.len() && !is_eol(self.text[pos]) {
            pos += 1;
        }
        if pos < self.text.len() && self.text[pos] == '\r' {
            pos += 1;
        }
        if pos < self.text.len() && self.text[pos] == '\n' {
            pos += 1;
        }
        pos
    }

    /// A failed rule leaves the month language guess as it found it.
    fn apply_rule(&mut self, rule: &Rule, s: &mut usize, row: &mut Row) -> bool {
        let lang_mask = self.lang_mask;
        let matched = self.try_rule(rule, s, row);
        if !matched {
            self.lang_mask = lang_mask;
        }
        matched
    }

    fn try_rule(&mut self, rule: &Rule, s: &mut usize, row: &mut Row) -> bool {
        let mut cur = *s;
        let mut all = true;
        for f in &rule.functions {
            if self.skip_incomplete {
                break;
            }
            if !self.apply(f, &mut cur, row) {
                all = false;
                break;
            }
        }
        if matches!(&row.values[0], Some(Value::Text(name)) if name.is_empty()) {
            // an empty name is a parse error even for an incomplete tail
            self.skip_incomplete = false;
            return false;
        }
        if self.skip_incomplete {
            *s = cur;
            return true;
        }
        let len = self.text.len();
        if !all || !(cur == len || is_eol(self.text[cur])) {
            return false;
        }
        if cur < len && self.text[cur] == '\r' {
            cur += 1;
        }
        if cur < len && self.text[cur] == '\n' {
            cur += 1;
        }
        *s = cur;
        true
    }

    fn slice(&self, from: usize, to: usize) -> String {
        self.text[from..to].iter().collect()
    }

    fn apply(&mut self, f: &Function, s: &mut usize, row: &mut Row) -> bool {
        let t = self.text;
        let len = t.len();
        let start = *s;
        let mut p = *s;
        let ok = match f {
            Function::SkipWhiteSpaces => {
                while p < len && is_ws(t[p]) {
                    p += 1;
                }
                true
            }
            Function::SkipToNumber => {
                while p < len && !t[p].is_ascii_digit() && !is_eol(t[p]) {
                    p += 1;
                }
                true
            }
            Function::WhiteSpaces(Some(n)) => {
                let mut count = 0;
                while count < *n && p < len && is_ws(t[p]) {
                    p += 1;
                    count += 1;
                }
                count == *n
            }
            Function::WhiteSpaces(None) => {
                while p < len && is_ws(t[p]) {
                    p += 1;
                }
                p > start
            }
            Function::WhiteSpacesAndLineEnds => {
                while p < len && t[p] <= ' ' {
                    p += 1;
                }
                if p == start {
                    false
                } else if p == len {
                    if self.incomplete {
                        self.skip_incomplete = true;
                        true
                    } else {
                        false
                    }
                } else {
                    true
                }
            }
            Function::RestOfLine(col) => {
                while p < len && !is_eol(t[p]) {
                    p += 1;
                }
                p > start && self.store_text(*col, start, p, row)
            }
            Function::Word(col) => {
                while p < len && t[p] > ' ' {
                    p += 1;
                }
                p > start && self.store_text(*col, start, p, row)
            }
            Function::Number(col) | Function::PositiveNumber(col) => {
                let positive_only = matches!(f, Function::PositiveNumber(_));
                let mut minus = false;
                if p < len && (t[p] == '+' || t[p] == '-') {
                    minus = t[p] == '-';
                    p += 1;
                }
                let digits_start = p;
                let mut num: i64 = 0;
                let mut overflow = false;
                while p < len && t[p].is_ascii_digit() {
                    num = match num
                        .checked_mul(10)
                        .and_then(|n| n.checked_add(i64::from(t[p] as u8 - b'0')))
                    {
                        Some(n) => n,
                        None => {
                            overflow = true;
                            num
                        }
                    };
                    p += 1;
                }
                if overflow || p == digits_start || (p < len && t[p].is_alphabetic()) {
                    false
                } else {
                    self.store_number(*col, minus, num, positive_only, row)
                }
            }
            Function::NumberWithSeparators(col, seps) => {
                let is_sep = |c: char| seps.contains(c);
                while p < len && t[p] != '+' && t[p] != '-' && !t[p].is_ascii_digit() && is_sep(t[p])
                {
                    p += 1;
                }
                let mut minus = false;
                if p < len && (t[p] == '+' || t[p] == '-') {
                    minus = t[p] == '-';
                    p += 1;
                }
                let mut num: i64 = 0;
                let mut overflow = false;
                while p < len {
                    if t[p].is_ascii_digit() {
                        match num
                            .checked_mul(10)
                            .and_then(|n| n.checked_add(i64::from(t[p] as u8 - b'0')))
                        {
                            Some(n) => num = n,
                            None => overflow = true,
                        }
                        p += 1;
                    } else if is_sep(t[p]) {
                        p += 1;
                    } else {
                        break;
                    }
                }
                if overflow || p == start || (p < len && t[p].is_alphabetic()) {
                    false
                } else {
                    self.store_number(*col, minus, num, false, row)
                }
            }
            Function::Month3(col, names) => {
                if p + 2 < len {
                    let word = &t[p..p + 3];
                    let month = match names {
                        Some(names) => names
                            .iter()
                            .position(|m| {
                                m.chars().count() == 3
                                    && m.chars().zip(word).all(|(a, &b)| chars_eq_ignore_case(a, b))
                            })
                            .map(|i| i as u32 + 1),
                        None => self.month_3_all_langs(word),
                    };
                    p += 3;
                    match month {
                        Some(m) if !(p < len && t[p].is_alphabetic()) => {
                            row.date_mut(*col).month = Some(m);
                            true
                        }
                        _ => false,
                    }
                } else {
                    false
                }
            }
            Function::MonthTxt(col, names) => {
                let mut word_end = p;
                while word_end < len && t[word_end] > ' ' {
                    word_end += 1;
                }
                if p < word_end {
                    let word = &t[p..word_end];
                    let found = match names {
                        Some(names) => names.iter().enumerate().find_map(|(i, m)| {
                            prefix_len_ignore_case(word, m).map(|l| (i as u32 + 1, l))
                        }),
                        None => self.month_txt_all_langs(word),
                    };
                    match found {
                        Some((m, l)) => {
                            p += l;
                            if p < len && t[p].is_alphabetic() {
                                false
                            } else {
                                row.date_mut(*col).month = Some(m);
                                true
                            }
                        }
                        None => false,
                    }
                } else {
                    false
                }
            }
            Function::Month(col) | Function::Day(col) | Function::Year(col) => {
                let mut num: i64 = 0;
                while p < len && t[p].is_ascii_digit() {
                    num = (num * 10 + i64::from(t[p] as u8 - b'0')).min(1_000_000);
                    p += 1;
                }
                if p == start || (p < len && t[p].is_alphabetic()) {
                    false
                } else {
                    match f {
                        Function::Month(_) if (1..=12).contains(&num) => {
                            row.date_mut(*col).month = Some(num as u32);
                            true
                        }
                        Function::Day(_) if (1..=31).contains(&num) => {
                            row.date_mut(*col).day = Some(num as u32);
                            true
                        }
                        Function::Year(_) => match normalize_year(num) {
                            Some(y) => {
                                let d = row.date_mut(*col);
                                d.year = Some(y);
                                d.year_correction = false;
                                true
                            }
                            None => false,
                        },
                        _ => false,
                    }
                }
            }
            Function::Time(col) => match parse_time(t, &mut p) {
                Some(time) => {
                    row.values[*col] = Some(Value::Time(time));
                    true
                }
                None => false,
            },
            Function::YearOrTime(dcol, tcol) => {
                let mut num: i64 = 0;
                while p < len && t[p].is_ascii_digit() {
                    num = (num * 10 + i64::from(t[p] as u8 - b'0')).min(1_000_000);
                    p += 1;
                }
                let mut result = None;
                if p > start && num < 24 && p < len && t[p] == ':' {
                    p += 1;
                    let minute_start = p;
                    let mut minute: u32 = 0;
                    while p < len && t[p].is_ascii_digit() {
                        minute = (minute * 10 + u32::from(t[p] as u8 - b'0')).min(1000);
                        p += 1;
                    }
                    if p > minute_start && minute < 60 {
                        result = NaiveTime::from_hms_opt(num as u32, minute, 0)
                            .map(|time| (self.today.year(), Some(time)));
                    }
                } else if p > start && (1601..10000).contains(&num) {
                    result = Some((if num == 1601 { 1602 } else { num as i32 }, None));
                }
                match result {
                    Some((year, time)) if !(p < len && t[p].is_alphabetic()) => {
                        let d = row.date_mut(*dcol);
                        d.year = Some(year);
                        d.year_correction = time.is_some();
                        if let Some(time) = time {
                            row.values[*tcol] = Some(Value::Time(time));
                        }
                        true
                    }
                    _ => false,
                }
            }
            Function::All(col, n) => {
                let mut count = 0;
                while count < *n && p < len && !is_eol(t[p]) {
                    p += 1;
                    count += 1;
                }
                count == *n && self.store_text(*col, start, p, row)
            }
            Function::AllTo(_, pat) | Function::AllUpTo(_, pat) => {
                let col = match f {
                    Function::AllTo(c, _) => *c,
                    Function::AllUpTo(c, _) => Some(*c),
                    _ => None,
                };
                let pat: Vec<char> = pat.chars().collect();
                let found = if pat.is_empty() {
                    Some(p)
                } else {
                    let mut found = None;
                    while p < len && !is_eol(t[p]) {
                        if matches_at(t, p, &pat) {
                            found = Some(p);
                            p += pat.len();
                            break;
                        }
                        p += 1;
                    }
                    found
                };
                match found {
                    Some(at) => {
                        let end = if matches!(f, Function::AllTo(..)) { p } else { at };
                        self.store_text(col, start, end, row)
                    }
                    None => false,
                }
            }
            Function::UnixLink(name_col, link_col) => {
                self.unix_link(&mut p, *name_col, *link_col, row)
            }
            Function::UnixDevice(col) => {
                let mut state = 0;
                if p < len && t[p].is_ascii_digit() {
                    while p < len && !is_eol(t[p]) {
                        let c = t[p];
                        state = match state {
                            0 if !c.is_ascii_digit() => {
                                if c <= ' ' {
                                    1
                                } else if c == ',' {
                                    2
                                } else {
                                    100
                                }
                            }
                            1 if c > ' ' => {
                                if c == ',' {
                                    2
                                } else {
                                    100
                                }
                            }
                            2 if c > ' ' => {
                                if c.is_ascii_digit() {
                                    3
                                } else {
                                    100
                                }
                            }
                            3 if !c.is_ascii_digit() => {
                                if c.is_alphabetic() {
                                    100
                                } else {
                                    4
                                }
                            }
                            other => other,
                        };
                        if state > 3 {
                            break;
                        }
                        p += 1;
                    }
                }
                (state == 3 || state == 4) && self.store_text(Some(*col), start, p, row)
            }
            Function::If(expr) => self.eval_bool(expr, p, row),
            Function::Assign(target, expr) => self.assign(*target, expr, p, row),
            Function::CutWhiteSpaces(col)
            | Function::CutWhiteSpacesEnd(col)
            | Function::CutWhiteSpacesStart(col) => {
                let value = row.text(*col);
                let trimmed = match f {
                    Function::CutWhiteSpacesEnd(_) => value.trim_end_matches(|c: char| c <= ' '),
                    Function::CutWhiteSpacesStart(_) => {
                        value.trim_start_matches(|c: char| c <= ' ')
                    }
                    _ => value.trim_matches(|c: char| c <= ' '),
                }
                .to_string();
                if trimmed.len() != value.len() {
                    row.values[*col] = Some(Value::Text(trimmed));
                }
                true
            }
            Function::Back(n) => {
                let mut count = 0;
                while count < *n && p > 0 && !is_eol(t[p - 1]) {
                    p -= 1;
                    count += 1;
                }
                count == *n
            }
            Function::AddStringToColumn(col, expr) => {
                let add = self.eval_str(expr, p, row);
                if !add.is_empty() {
                    let mut value = row.text(*col).to_string();
                    value.push_str(&add);
                    row.values[*col] = Some(Value::Text(value));
                }
                true
            }
            Function::CutEndOfString(col, n) => {
                let value = row.text(*col);
                let count = value.chars().count();
                if *n <= count {
                    let cut: String = value.chars().take(count - n).collect();
                    row.values[*col] = Some(Value::Text(cut));
                    true
                } else {
                    false
                }
            }
        };
        if ok {
            *s = p;
        }
        ok
    }

    fn store_text(&self, col: Option<usize>, from: usize, to: usize, row: &mut Row) -> bool {
        if let Some(col) = col {
            row.values[col] = Some(Value::Text(self.slice(from, to)));
        }
        true
    }

    fn store_number(
        &self,
        col: usize,
        minus: bool,
        num: i64,
        positive_only: bool,
        row: &mut Row,
    ) -> bool {
        match self.columns[col].kind {
            ColumnKind::Size => {
                if minus {
                    if !positive_only {
                        return false;
                    }
                    row.values[col] = Some(Value::Number(0));
                } else {
                    row.values[col] = Some(Value::Number(num));
                }
            }
            _ => {
                row.values[col] = if minus && positive_only {
                    None
                } else if minus {
                    Some(Value::Number(-num))
                } else {
                    Some(Value::Number(num))
                };
            }
        }
        true
    }

    fn month_3_all_langs(&mut self, word: &[char]) -> Option<u32> {
        let lower: String = word.iter().flat_map(|c| c.to_lowercase()).collect();
        let &(_, month, mask) = MONTHS_3.iter().find(|(name, _, _)| *name == lower)?;
        if self.lang_mask & mask == 0 {
            return None;
        }
        self.lang_mask &= mask;
        Some(month)
    }

    fn month_txt_all_langs(&mut self, word: &[char]) -> Option<(u32, usize)> {
        let (month, mask, l) = MONTHS_TXT
            .iter()
            .find_map(|&(name, month, mask)| {
                prefix_len_ignore_case(word, name).map(|l| (month, mask, l))
            })?;
        if self.lang_mask & mask == 0 {
            return None;
        }
        self.lang_mask &= mask;
        Some((month, l))
    }

    fn unix_link(&self, s: &mut usize, name_col: usize, link_col: usize, row: &mut Row) -> bool {
        let t = self.text;
        let len = t.len();
        let start = *s;
        let mut p = start;
        let mut state = 0;
        let (mut is_file, mut is_file2, mut has_point, mut first_char) = (false, false, false, false);
        let mut name_end = start;
        let mut link_beg = start;
        if p < len && t[p] > ' ' {
            while p < len && !is_eol(t[p]) {
                match state {
                    // first character of the name: '.' is no extension, "->" no arrow
                    0 => state = 1,
                    1 => {
                        if t[p] == '.' {
                            has_point = true;
                        } else if t[p] == '-' && p + 1 < len && t[p + 1] == '>' {
                            name_end = if t[p - 1] == ' ' { p - 1 } else { p };
                            p += 1;
                            if p + 1 < len && t[p + 1] == ' ' {
                                p += 1;
                            }
                            link_beg = p + 1;
                            state = 2;
                            has_point = false;
                        } else if t[p] > ' ' && has_point {
                            is_file = true;
                        }
                    }
                    2 => state = 3,
                    _ => {
                        if t[p] == '.' {
                            has_point = !first_char;
                            first_char = false;
                        } else if t[p] == '/' {
                            has_point = false;
                            is_file2 = false;
                            first_char = true;
                        } else {
                            first_char = false;
                            if t[p] > ' ' && has_point {
                                is_file2 = true;
                            }
                        }
                    }
                }
                p += 1;
            }
            if is_file2 {
                is_file = true;
            }
        }
        if state != 1 && state != 3 {
            return false;
        }
        if state == 1 {
            name_end = p;
        }
        row.is_dir = !is_file;
        row.values[name_col] = Some(Value::Text(self.slice(start, name_end)));
        if state == 3 {
            row.values[link_col] = Some(Value::Text(self.slice(link_beg.min(p), p)));
        }
        *s = p;
        true
    }

    fn assign(&self, target: AssignTarget, expr: &Expr, pos: usize, row: &mut Row) -> bool {
        match target {
            AssignTarget::Bool(var) => {
                let v = self.eval_bool(expr, pos, row);
                match var {
                    BoolVar::IsDir => row.is_dir = v,
                    BoolVar::IsHidden => row.is_hidden = v,
                    BoolVar::IsLink => row.is_link = v,
                }
                true
            }
            AssignTarget::Column(col) => match self.eval(expr, pos, row) {
                Operand::Str(s) => {
                    row.values[col] = Some(Value::Text(s));
                    true
                }
                Operand::Number(n) => {
                    let abs = n.checked_abs().unwrap_or(i64::MAX);
                    self.store_number(col, n < 0, abs, false, row)
                }
                Operand::Date(_) => {
                    if let Expr::Column(src) = expr {
                        row.dates[col] = row.dates[*src];
                    }
                    true
                }
                Operand::Time(_) => {
                    if let Expr::Column(src) = expr {
                        row.values[col] = row.values[*src].clone();
                    }
                    true
                }
                Operand::Bool(_) => false,
            },
        }
    }

    fn eval_bool(&self, expr: &Expr, pos: usize, row: &Row) -> bool {
        matches!(self.eval(expr, pos, row), Operand::Bool(true))
    }

    fn eval_str(&self, expr: &Expr, pos: usize, row: &Row) -> String {
        match self.eval(expr, pos, row) {
            Operand::Str(s) => s,
            _ => String::new(),
        }
    }

    fn eval(&self, expr: &Expr, pos: usize, row: &Row) -> Operand {
        let t = self.text;
        match expr {
            Expr::Bool(b) => Operand::Bool(*b),
            Expr::Number(n) => Operand::Number(*n),
            Expr::Str(s) => Operand::Str(s.clone()),
            Expr::BoolVar(BoolVar::IsDir) => Operand::Bool(row.is_dir),
            Expr::BoolVar(BoolVar::IsHidden) => Operand::Bool(row.is_hidden),
            Expr::BoolVar(BoolVar::IsLink) => Operand::Bool(row.is_link),
            Expr::State(StateVar::FirstNonemptyLine) => {
                Operand::Bool(self.first_nonempty.is_some_and(|(b, e)| pos >= b && pos < e))
            }
            Expr::State(StateVar::LastNonemptyLine) => {
                Operand::Bool(self.last_nonempty.is_some_and(|(b, e)| pos >= b && pos < e))
            }
            Expr::State(StateVar::NextChar) => {
                Operand::Str(t.get(pos).map(|c| c.to_string()).unwrap_or_default())
            }
            Expr::State(StateVar::NextWord) => {
                let mut e = pos;
                while e < t.len() && t[e] > ' ' {
                    e += 1;
                }
                Operand::Str(self.slice(pos, e))
            }
            Expr::State(StateVar::RestOfLine) => {
                let mut e = pos;
                while e < t.len() && !is_eol(t[e]) {
                    e += 1;
                }
                Operand::Str(self.slice(pos, e))
            }
            Expr::Column(i) => match (self.columns[*i].kind.operand_type(), &row.values[*i]) {
                (Some(OperandType::Str), v) => Operand::Str(match v {
                    Some(Value::Text(s)) => s.clone(),
                    _ => String::new(),
                }),
                (Some(OperandType::Number), v) => Operand::Number(match v {
                    Some(Value::Number(n)) => *n,
                    _ => 0,
                }),
                (Some(OperandType::Date), _) => {
                    Operand::Date(row.dates[*i].and_then(|d| d.complete()))
                }
                (Some(OperandType::Time), Some(Value::Time(tm))) => Operand::Time(Some(*tm)),
                _ => Operand::Time(None),
            },
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs, pos, row);
                let r = self.eval(rhs, pos, row);
                Operand::Bool(compare(*op, &l, &r))
            }
        }
    }

    /// Turns a matched row into an entry, filling unassigned columns.
    fn finish(&self, row: Row) -> FtpEntry {
        let mut entry = FtpEntry {
            name: row.text(0).to_string(),
            kind: if row.is_link {
                FtpEntryKind::Symlink
            } else if row.is_dir {
                FtpEntryKind::Directory
            } else {
                FtpEntryKind::File
            },
            is_dir_link: row.is_link && row.is_dir,
            size: 0,
            date: invalid_date(),
            time: NaiveTime::MIN,
            hidden: row.is_hidden,
            permissions: None,
            owner: None,
            group: None,
            link_target: None,
            extra: BTreeMap::new(),
        };
        for (i, col) in self.columns.iter().enumerate().skip(1) {
            let value = &row.values[i];
            match col.kind {
                ColumnKind::Ext | ColumnKind::Type => {}
                ColumnKind::Size => {
                    entry.size = if row.is_dir {
                        0
                    } else {
                        match value {
                            Some(Value::Number(n)) => *n as u64,
                            _ => empty_number(col).max(0) as u64,
                        }
                    };
                }
                ColumnKind::Number => {
                    let n = match value {
                        Some(Value::Number(n)) => Some(*n),
                        _ => col.empty_value.as_deref().and_then(|v| v.parse().ok()),
                    };
                    if let Some(n) = n {
                        entry.extra.insert(col.id.clone(), n.to_string());
                    }
                }
                ColumnKind::Text => {
                    let text = match value {
                        Some(Value::Text(s)) => Some(s.clone()),
                        _ => col.empty_value.clone(),
                    };
                    let Some(text) = text else { continue };
                    match col.id.as_str() {
                        "rights" => entry.permissions = Some(text),
                        "user" => entry.owner = Some(text),
                        "group" => entry.group = Some(text),
                        "link" => entry.link_target = Some(text),
                        _ => {
                            entry.extra.insert(col.id.clone(), text);
                        }
                    }
                }
                ColumnKind::Date => entry.date = self.resolve_date(col, row.dates[i]),
                ColumnKind::GeneralDate => {
                    let d = self.resolve_date(col, row.dates[i]);
                    entry.extra.insert(col.id.clone(), d.format("%Y-%m-%d").to_string());
                }
                ColumnKind::Time => entry.time = resolve_time(col, value),
                ColumnKind::GeneralTime => {
                    let tm = resolve_time(col, value);
                    entry.extra.insert(col.id.clone(), tm.format("%H:%M:%S").to_string());
                }
                ColumnKind::Name => {}
            }
        }
        entry
    }

    fn resolve_date(&self, col: &ColumnDef, parts: Option<DateParts>) -> NaiveDate {
        let parts = parts.unwrap_or_default();
        let Some((mut year, month, day)) = parts.complete() else {
            return col
                .empty_value
                .as_deref()
                .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
                .unwrap_or_else(invalid_date);
        };
        if parts.year_correction
            && (month > self.today.month() || (month == self.today.month() && day > self.today.day()))
        {
            year -= 1;
        }
        NaiveDate::from_ymd_opt(year, month, day).unwrap_or_else(invalid_date)
    }
}

fn resolve_time(col: &ColumnDef, value: &Option<Value>) -> NaiveTime {
    match value {
        Some(Value::Time(t)) => *t,
        _ => col
            .empty_value
            .as_deref()
            .and_then(|v| NaiveTime::parse_from_str(v, "%H:%M:%S").ok())
            .unwrap_or(NaiveTime::MIN),
    }
}

fn empty_number(col: &ColumnDef) -> i64 {
    col.empty_value
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// 1.1.1602, the value used for dates that cannot be represented.
fn invalid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1602, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn normalize_year(num: i64) -> Option<i32> {
    let mut y = num;
    if y < 1000 {
        y += if y < 80 { 2000 } else { 1900 };
    }
    if y == 1601 {
        y = 1602;
    }
    (1602..=9999).contains(&y).then_some(y as i32)
}

/// `h:mm[:ss[.ms]][a|p[m]]`
fn parse_time(t: &[char], s: &mut usize) -> Option<NaiveTime> {
    let len = t.len();
    let mut p = *s;
    let read = |p: &mut usize| -> Option<u32> {
        let start = *p;
        let mut n: u32 = 0;
        while *p < len && t[*p].is_ascii_digit() {
            n = (n * 10 + u32::from(t[*p] as u8 - b'0')).min(100_000);
            *p += 1;
        }
        (*p > start).then_some(n)
    };
    let mut hour = read(&mut p).filter(|h| *h < 24)?;
    if !(p < len && t[p] == ':') {
        return None;
    }
    p += 1;
    let minute = read(&mut p).filter(|m| *m < 60)?;
    let (mut second, mut milli) = (0, 0);
    if p < len && t[p] == ':' {
        p += 1;
        second = read(&mut p).filter(|s| *s < 60)?;
        if p < len && t[p] == '.' {
            p += 1;
            milli = read(&mut p).filter(|m| *m < 1000)?;
        }
    }
    if p < len && matches!(t[p], 'a' | 'A' | 'p' | 'P') {
        if matches!(t[p], 'p' | 'P') && hour < 12 {
            hour += 12;
        }
        p += 1;
        if p < len && matches!(t[p], 'm' | 'M') {
            p += 1;
        }
    }
    if p < len && t[p].is_alphanumeric() {
        return None;
    }
    let time = NaiveTime::from_hms_milli_opt(hour, minute, second, milli)?;
    *s = p;
    Some(time)
}

fn matches_at(t: &[char], at: usize, pat: &[char]) -> bool {
    pat.iter().enumerate().all(|(i, &c)| {
        t.get(at + i)
            .is_some_and(|&x| !is_eol(x) && chars_eq_ignore_case(x, c))
    })
}

/// Length in chars of `name` when it is a case-insensitive prefix of `word`.
fn prefix_len_ignore_case(word: &[char], name: &str) -> Option<usize> {
    let name: Vec<char> = name.chars().collect();
    (name.len() <= word.len()
        && name
            .iter()
            .zip(word)
            .all(|(&a, &b)| chars_eq_ignore_case(a, b)))
    .then_some(name.len())
}

fn compare(op: BinOp, l: &Operand, r: &Operand) -> bool {
    match (l, r) {
        (Operand::Str(a), Operand::Str(b)) => {
            let lower = |s: &str| s.to_lowercase();
            match op {
                BinOp::Eq => a == b,
                BinOp::NotEq => a != b,
                BinOp::StrEq => lower(a) == lower(b),
                BinOp::StrNotEq => lower(a) != lower(b),
                BinOp::In => lower(b).contains(&lower(a)),
                BinOp::NotIn => !lower(b).contains(&lower(a)),
                BinOp::EndWith => lower(a).ends_with(&lower(b)),
                BinOp::NotEndWith => !lower(a).ends_with(&lower(b)),
            }
        }
        _ => match op {
            BinOp::Eq => l == r,
            BinOp::NotEq => l != r,
            _ => false,
        },
    }
}

/// `[begin, end)` of the first line holding a non-blank character. `end`
/// includes the line break, or points one past the text for a last line
/// without one.
fn first_nonempty_line(t: &[char]) -> Option<(usize, usize)> {
    let mut beg = 0;
    let mut non_empty = false;
    let mut i = 0;
    while i < t.len() {
        if is_eol(t[i]) {
            if t[i] == '\r' && i + 1 < t.len() && t[i + 1] == '\n' {
                i += 1;
            }
            if non_empty {
                return Some((beg, i + 1));
            }
            beg = i + 1;
        } else if t[i] > ' ' {
            non_empty = true;
        }
        i += 1;
    }
    non_empty.then_some((beg, t.len() + 1))
}

fn last_nonempty_line(t: &[char]) -> Option<(usize, usize)> {
    let mut end = t.len();
    let mut non_empty = false;
    let mut has_eol = false;
    let mut i = t.len();
    while i > 0 {
        let c = t[i - 1];
        if is_eol(c) {
            if non_empty {
                let mut e = end;
                if !has_eol && e == t.len() {
                    e += 1;
                }
                return Some((i, e));
            }
            end = i;
            has_eol = true;
            if c == '\n' && i >= 2 && t[i - 2] == '\r' {
                i -= 1;
            }
        } else if c > ' ' {
            non_empty = true;
        }
        i -= 1;
    }
    non_empty.then(|| {
        let e = if !has_eol && end == t.len() { end + 1 } else { end };
        (0, e)
    })
}
