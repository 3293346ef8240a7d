/*!
 * Response formatting.
 *
 * Instruments answer in plain ASCII. Scalars are bare numbers, vectors are
 * framed as `[a;b;c]` and matrices as `[a,b;c,d]`. A [`Format`] turns such a
 * reply into a typed [`Response`].
 */
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// `[sign]digits[.digits][e[sign]digits[.digits]]`
const NUMBER: &str = r"[-+]?[0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+(?:\.[0-9]+)?)?";

static MATRIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    let row = format!("{n}(?:,{n})+", n = NUMBER);
    Regex::new(&format!(r"^\[{row}(?:;{row})*;?\]$", row = row)).expect("valid matrix regex")
});

static ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^\[{n}(?:;{n})*;?\]$", n = NUMBER)).expect("valid array regex")
});

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^{}$", NUMBER)).expect("valid number regex"));

/// Characters that frame a reply and are stripped before parsing
const FRAMING: [char; 4] = ['\n', '[', ']', ';'];

/// A formatted instrument reply
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// No reply was requested
    None,
    /// Text, returned as-is or with framing removed
    Text(String),
    /// A multi-line reply, one entry per line
    Lines(Vec<String>),
    /// A single number
    Number(f64),
    /// A vector of numbers
    Array(Vec<f64>),
    /// Rows of numbers
    Matrix(Vec<Vec<f64>>),
}

impl Response {
    /// Whether no reply was requested
    pub fn is_none(&self) -> bool {
        matches!(self, Response::None)
    }

    /// Get the text, if this is a text reply
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Response::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the lines, if this is a multi-line reply
    pub fn as_lines(&self) -> Option<&[String]> {
        match self {
            Response::Lines(lines) => Some(lines),
            _ => None,
        }
    }

    /// Get the number, if this is a scalar reply
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Response::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the vector, if this is a vector reply
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            Response::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Get the rows, if this is a matrix reply
    pub fn as_matrix(&self) -> Option<&[Vec<f64>]> {
        match self {
            Response::Matrix(rows) => Some(rows),
            _ => None,
        }
    }

    /// Consume the response, returning its text if it is a text reply
    pub fn into_text(self) -> Option<String> {
        match self {
            Response::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::None => Ok(()),
            Response::Text(s) => write!(f, "{}", s),
            Response::Lines(lines) => write!(f, "{}", lines.join("\n")),
            Response::Number(n) => write!(f, "{}", n),
            Response::Array(values) => {
                let fields: Vec<String> = values.iter().map(f64::to_string).collect();
                write!(f, "[{}]", fields.join(";"))
            }
            Response::Matrix(rows) => {
                let rows: Vec<String> = rows
                    .iter()
                    .map(|row| row.iter().map(f64::to_string).collect::<Vec<_>>().join(","))
                    .collect();
                write!(f, "[{}]", rows.join(";"))
            }
        }
    }
}

/// How a raw reply is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Remove `[`, `]`, `;` and newline framing, keep the text
    Strip,
    /// Parse a `[a;b;c]` vector
    Array,
    /// Parse a `[a,b;c,d]` matrix
    Matrix,
    /// Parse a single number
    Number,
    /// Return the text untouched
    None,
    /// Detect matrix, vector, number or multi-line text
    #[default]
    Auto,
}

impl Format {
    /// All formats, in declaration order
    pub const ALL: [Format; 6] = [
        Format::Strip,
        Format::Array,
        Format::Matrix,
        Format::Number,
        Format::None,
        Format::Auto,
    ];

    /// The lowercase name of this format
    pub fn name(&self) -> &'static str {
        match self {
            Format::Strip => "strip",
            Format::Array => "array",
            Format::Matrix => "matrix",
            Format::Number => "number",
            Format::None => "none",
            Format::Auto => "auto",
        }
    }

    /// Apply this format to a raw reply
    pub fn apply(&self, raw: &str) -> Result<Response> {
        match self {
            Format::Strip => Ok(Response::Text(strip(raw).to_string())),
            Format::Array => parse_array(raw).map(Response::Array),
            Format::Matrix => parse_matrix(raw).map(Response::Matrix),
            Format::Number => parse_number(raw).map(Response::Number),
            Format::None => Ok(Response::Text(raw.to_string())),
            Format::Auto => auto(raw),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        Format::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DeviceError::UnknownFormat(s.to_string()))
    }
}

/// Remove reply framing from both ends
pub fn strip(raw: &str) -> &str {
    raw.trim_matches(&FRAMING[..])
}

/// Parse a single number, tolerating surrounding whitespace
pub fn parse_number(raw: &str) -> Result<f64> {
    let text = raw.trim();
    if !NUMBER_RE.is_match(text) {
        return Err(DeviceError::parse(format!("not a number: {:?}", raw)));
    }
    match text.parse::<f64>() {
        Ok(value) => Ok(value),
        // `f64::from_str` rejects fractional exponents, which the wire grammar allows.
        Err(_) => parse_fractional_exponent(text),
    }
}

fn parse_fractional_exponent(text: &str) -> Result<f64> {
    let (mantissa, exponent) = text
        .split_once(['e', 'E'])
        .ok_or_else(|| DeviceError::parse(format!("not a number: {:?}", text)))?;
    let mantissa: f64 = mantissa.parse()?;
    let exponent: f64 = exponent.parse()?;
    Ok(mantissa * 10f64.powf(exponent))
}

/// Parse a `[a;b;c]` vector
pub fn parse_array(raw: &str) -> Result<Vec<f64>> {
    strip(raw).split(';').map(parse_number).collect()
}

/// Parse a `[a,b;c,d]` matrix
pub fn parse_matrix(raw: &str) -> Result<Vec<Vec<f64>>> {
    strip(raw)
        .split(';')
        .map(|row| row.split(',').map(parse_number).collect())
        .collect()
}

/// Detect the shape of a reply and format it accordingly
pub fn auto(raw: &str) -> Result<Response> {
    let body = raw.trim_end_matches(['\r', '\n']);

    if MATRIX_RE.is_match(body) {
        return parse_matrix(body).map(Response::Matrix);
    }
    if ARRAY_RE.is_match(body) {
        return parse_array(body).map(Response::Array);
    }
    if NUMBER_RE.is_match(body) {
        return parse_number(body).map(Response::Number);
    }

    if raw.contains('\n') {
        let mut lines: Vec<String> = strip(raw)
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();
        if lines.len() < 2 {
            return Ok(Response::Text(lines.pop().unwrap_or_default()));
        }
        return Ok(Response::Lines(lines));
    }

    Ok(Response::Text(raw.to_string()))
}
