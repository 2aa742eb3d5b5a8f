//! Reference patterns such as `PO-{seq:04d}` or `LOAN-{date:%Y}-{seq}`.
//!
//! Placeholders:
//! - `{seq}` / `{seq:0Nd}`: the sequence number, optionally zero-padded to N
//!   digits (`ref` is accepted as an alias of `seq`)
//! - `{date}` / `{date:<strftime>}`: the creation date, `%Y-%m-%d` by default
//! - `{{` and `}}`: literal braces
//!
//! A pattern must contain exactly one sequence placeholder. Date formats are
//! limited to date fields, and a date field of variable digit width (`%-m`,
//! `%-d`, ...) may not touch `{seq}`, otherwise the sequence could not be read
//! back out of a reference.

use chrono::NaiveDate;
use chrono::format::{Fixed, Item, Numeric, Pad, StrftimeItems};
use orderflow_core::{OrderError, OrderResult};
use regex::Regex;

const MAX_SEQ_WIDTH: usize = 20;
const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Seq { width: usize },
    Date(DateField),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DateField {
    format: String,
    expr: String,
    /// First item matches a variable number of digits.
    open_start: bool,
    /// Last item matches a variable number of digits.
    open_end: bool,
}

/// A parsed, validated reference pattern.
#[derive(Debug, Clone)]
pub struct ReferencePattern {
    source: String,
    parts: Vec<Part>,
    matcher: Regex,
}

impl ReferencePattern {
    pub fn parse(source: &str) -> OrderResult<Self> {
        let parts = tokenize(source)?;
        let seq_count = parts.iter().filter(|p| matches!(p, Part::Seq { .. })).count();
        if seq_count != 1 {
            return Err(OrderError::validation(format!(
                "reference pattern '{source}' must contain exactly one {{seq}} placeholder, found {seq_count}"
            )));
        }

        for pair in parts.windows(2) {
            let ambiguous = match pair {
                [Part::Date(date), Part::Seq { .. }] => date.open_end,
                [Part::Seq { .. }, Part::Date(date)] => date.open_start,
                _ => false,
            };
            if ambiguous {
                return Err(OrderError::validation(format!(
                    "reference pattern '{source}': a variable-width date field cannot touch {{seq}}"
                )));
            }
        }

        let mut expr = String::from("^");
        for part in &parts {
            match part {
                Part::Literal(text) => expr.push_str(&regex::escape(text)),
                Part::Seq { .. } => expr.push_str(r"(?P<seq>\d+)"),
                Part::Date(date) => expr.push_str(&date.expr),
            }
        }
        expr.push('$');
        let matcher = Regex::new(&expr).map_err(|e| {
            OrderError::validation(format!("reference pattern '{source}' is not usable: {e}"))
        })?;

        Ok(Self {
            source: source.to_string(),
            parts,
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn format(&self, seq: u64, date: NaiveDate) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Seq { width } => out.push_str(&format!("{seq:0width$}")),
                Part::Date(field) => out.push_str(&date.format(&field.format).to_string()),
            }
        }
        out
    }

    /// Sequence number carried by `reference`, if it matches this pattern.
    pub fn sequence_of(&self, reference: &str) -> Option<u64> {
        self.matcher
            .captures(reference)
            .and_then(|caps| caps.name("seq"))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn matches(&self, reference: &str) -> bool {
        self.sequence_of(reference).is_some()
    }
}

fn tokenize(source: &str) -> OrderResult<Vec<Part>> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => body.push(ch),
                        None => {
                            return Err(OrderError::validation(format!(
                                "reference pattern '{source}' has an unclosed placeholder"
                            )));
                        }
                    }
                }
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(placeholder(source, &body)?);
            }
            '}' => {
                return Err(OrderError::validation(format!(
                    "reference pattern '{source}' has an unmatched '}}'"
                )));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    Ok(parts)
}

fn placeholder(source: &str, body: &str) -> OrderResult<Part> {
    let (name, spec) = match body.split_once(':') {
        Some((name, spec)) => (name.trim(), Some(spec)),
        None => (body.trim(), None),
    };
    match name {
        "seq" | "ref" => {
            let width = match spec {
                None | Some("d") => 0,
                Some(spec) => parse_width(spec).ok_or_else(|| {
                    OrderError::validation(format!(
                        "reference pattern '{source}': unsupported sequence format '{spec}'"
                    ))
                })?,
            };
            Ok(Part::Seq { width })
        }
        "date" => {
            let fmt = spec.unwrap_or(DEFAULT_DATE_FORMAT);
            date_field(fmt).map(Part::Date).ok_or_else(|| {
                OrderError::validation(format!(
                    "reference pattern '{source}': invalid date format '{fmt}'"
                ))
            })
        }
        other => Err(OrderError::validation(format!(
            "reference pattern '{source}': unknown placeholder '{other}'"
        ))),
    }
}

/// Compile a strftime format into a matcher for what it renders. `None` for
/// malformed formats and for fields a plain date cannot supply (times, zones).
fn date_field(format: &str) -> Option<DateField> {
    let mut expr = String::new();
    let mut open = Vec::new();
    for item in StrftimeItems::new(format) {
        let (piece, variable) = match item {
            Item::Literal(text) | Item::Space(text) => (regex::escape(text), false),
            Item::Numeric(numeric, pad) => {
                let width = numeric_width(&numeric)?;
                match pad {
                    Pad::None if width == 1 => (r"\d".to_string(), false),
                    Pad::None => (r"\d+".to_string(), true),
                    Pad::Zero => (format!(r"\d{{{width}}}"), false),
                    Pad::Space => (format!(r"[ \d]{{{width}}}"), false),
                }
            }
            Item::Fixed(Fixed::ShortMonthName | Fixed::ShortWeekdayName) => {
                ("[A-Za-z]{3}".to_string(), false)
            }
            Item::Fixed(Fixed::LongMonthName | Fixed::LongWeekdayName) => {
                ("[A-Za-z]+".to_string(), false)
            }
            _ => return None,
        };
        expr.push_str(&piece);
        open.push(variable);
    }
    Some(DateField {
        format: format.to_string(),
        expr,
        open_start: *open.first()?,
        open_end: *open.last()?,
    })
}

/// Rendered width of a zero-padded date field.
fn numeric_width(numeric: &Numeric) -> Option<usize> {
    match numeric {
        Numeric::Year | Numeric::IsoYear => Some(4),
        Numeric::YearDiv100
        | Numeric::YearMod100
        | Numeric::IsoYearDiv100
        | Numeric::IsoYearMod100
        | Numeric::Month
        | Numeric::Day
        | Numeric::WeekFromSun
        | Numeric::WeekFromMon
        | Numeric::IsoWeek => Some(2),
        Numeric::NumDaysFromSun | Numeric::WeekdayFromMon => Some(1),
        Numeric::Ordinal => Some(3),
        _ => None,
    }
}

/// `0Nd` → N.
fn parse_width(spec: &str) -> Option<usize> {
    let digits = spec.strip_prefix('0')?.strip_suffix('d')?;
    let width: usize = digits.parse().ok()?;
    (width > 0 && width <= MAX_SEQ_WIDTH).then_some(width)
}
