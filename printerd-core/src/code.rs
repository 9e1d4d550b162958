use crate::errors::ParseError;
use crate::parser;
use crate::types::{
    CodeChannel, CodeFlags, CodeResult, CodeType, ConnectionId, KeywordType, MacroHandle,
};
use serde::{Deserialize, Serialize};

/// Letter assigned to the unnamed parameter (a quoted string directly after
/// the major/minor chunk, e.g. `M117 "message"`).
pub const UNNAMED_LETTER: char = '@';

// ─── Parameter ────────────────────────────────────────────────

/// A single code parameter. The raw value is kept as parsed; typed access is
/// lazy and fails with a `ParseError` on mismatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub letter: char,
    pub raw: String,
    pub quoted: bool,
}

impl Parameter {
    pub fn new(letter: char, raw: impl Into<String>) -> Parameter {
        Parameter {
            letter,
            raw: raw.into(),
            quoted: false,
        }
    }

    pub fn quoted(letter: char, raw: impl Into<String>) -> Parameter {
        Parameter {
            letter,
            raw: raw.into(),
            quoted: true,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn as_int(&self) -> Result<i32, ParseError> {
        self.raw
            .trim()
            .parse::<i32>()
            .map_err(|_| self.mismatch("integer"))
    }

    pub fn as_uint(&self) -> Result<u32, ParseError> {
        self.raw
            .trim()
            .parse::<u32>()
            .map_err(|_| self.mismatch("unsigned integer"))
    }

    pub fn as_float(&self) -> Result<f64, ParseError> {
        self.raw
            .trim()
            .parse::<f64>()
            .map_err(|_| self.mismatch("float"))
    }

    /// G-code booleans are integers; any non-zero value is true.
    pub fn as_bool(&self) -> Result<bool, ParseError> {
        Ok(self.as_int()? != 0)
    }

    /// Colon-separated integer array (e.g. `P0:2:5`).
    pub fn as_int_vec(&self) -> Result<Vec<i32>, ParseError> {
        self.raw
            .split(':')
            .map(|part| {
                part.trim()
                    .parse::<i32>()
                    .map_err(|_| self.mismatch("integer array"))
            })
            .collect()
    }

    /// Colon-separated float array (e.g. `X1.5:2.5`).
    pub fn as_float_vec(&self) -> Result<Vec<f64>, ParseError> {
        self.raw
            .split(':')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|_| self.mismatch("float array"))
            })
            .collect()
    }

    fn mismatch(&self, expected: &str) -> ParseError {
        ParseError::new(format!(
            "invalid value {:?} for parameter '{}', expected {expected}",
            self.raw, self.letter
        ))
    }
}

// ─── Code ─────────────────────────────────────────────────────

/// A parsed G/M/T-code together with its execution state. Owned by the task
/// running it; scheduler locks reference only (channel, class).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Code {
    pub channel: CodeChannel,
    pub flags: CodeFlags,
    pub code_type: CodeType,
    pub major: Option<i32>,
    pub minor: Option<i8>,
    pub parameters: Vec<Parameter>,
    pub comment: Option<String>,
    pub file_position: Option<u64>,
    pub line_number: Option<u64>,
    pub macro_handle: Option<MacroHandle>,
    pub keyword: Option<KeywordType>,
    pub keyword_argument: Option<String>,
    /// IPC connection the code arrived on, if any.
    pub connection: Option<ConnectionId>,
    /// Interceptor connection that resolved this code, if any.
    pub resolved_by: Option<ConnectionId>,
    pub result: Option<CodeResult>,
}

impl Code {
    pub fn new(channel: CodeChannel, code_type: CodeType, major: Option<i32>) -> Code {
        Code {
            channel,
            flags: CodeFlags::default(),
            code_type,
            major,
            minor: None,
            parameters: Vec::new(),
            comment: None,
            file_position: None,
            line_number: None,
            macro_handle: None,
            keyword: None,
            keyword_argument: None,
            connection: None,
            resolved_by: None,
            result: None,
        }
    }

    /// Parse a single line of text into a code on the given channel.
    pub fn parse(channel: CodeChannel, text: &str) -> Result<Code, ParseError> {
        parser::parse(channel, text)
    }

    /// Looks up a parameter by letter.
    pub fn parameter(&self, letter: char) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.letter.eq_ignore_ascii_case(&letter))
    }

    /// The unnamed string argument, if present.
    pub fn unnamed_parameter(&self) -> Option<&Parameter> {
        self.parameter(UNNAMED_LETTER)
    }

    /// File-name argument convention: a quoted unnamed string or `P`.
    pub fn file_argument(&self) -> Option<&str> {
        self.unnamed_parameter()
            .or_else(|| self.parameter('P'))
            .map(Parameter::as_str)
    }

    pub fn is_major(&self, code_type: CodeType, major: i32) -> bool {
        self.code_type == code_type && self.major == Some(major)
    }

    /// Short form used when prefixing error messages, e.g. `M374` or `G1.2`.
    pub fn short_form(&self) -> String {
        let letter = match self.code_type {
            CodeType::GCode => 'G',
            CodeType::MCode => 'M',
            CodeType::TCode => 'T',
            CodeType::Comment => return "(comment)".to_string(),
            CodeType::Keyword => {
                return self
                    .keyword
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_else(|| "(keyword)".to_string());
            }
        };
        match (self.major, self.minor) {
            (Some(major), Some(minor)) => format!("{letter}{major}.{minor}"),
            (Some(major), None) => format!("{letter}{major}"),
            (None, _) => letter.to_string(),
        }
    }
}

/// Canonical text rendering. `parse(render(code))` reproduces the code
/// modulo whitespace.
impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code_type {
            CodeType::Comment => {
                return write!(f, ";{}", self.comment.as_deref().unwrap_or(""));
            }
            CodeType::Keyword => {
                if let Some(keyword) = self.keyword {
                    f.write_str(keyword.as_str())?;
                    if let Some(argument) = &self.keyword_argument {
                        write!(f, " {argument}")?;
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        if let Some(line_number) = self.line_number {
            write!(f, "N{line_number} ")?;
        }
        f.write_str(&self.short_form())?;
        for parameter in &self.parameters {
            f.write_str(" ")?;
            if parameter.letter != UNNAMED_LETTER {
                write!(f, "{}", parameter.letter)?;
            }
            if parameter.quoted {
                write!(f, "\"{}\"", parameter.raw.replace('"', "\"\""))?;
            } else {
                f.write_str(&parameter.raw)?;
            }
        }
        if let Some(comment) = &self.comment {
            write!(f, " ;{comment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_parse_lazily() {
        let p = Parameter::new('X', "10.5");
        assert_eq!(p.as_float().unwrap(), 10.5);
        assert!(p.as_int().is_err());

        let p = Parameter::new('S', "2");
        assert_eq!(p.as_int().unwrap(), 2);
        assert!(p.as_bool().unwrap());

        let p = Parameter::new('P', "0:2:5");
        assert_eq!(p.as_int_vec().unwrap(), vec![0, 2, 5]);
        assert!(p.as_int().is_err());
    }

    #[test]
    fn short_form_includes_minor_number() {
        let mut code = Code::new(CodeChannel::Http, CodeType::GCode, Some(53));
        assert_eq!(code.short_form(), "G53");
        code.minor = Some(4);
        assert_eq!(code.short_form(), "G53.4");
    }

    #[test]
    fn rendering_quotes_and_escapes_strings() {
        let mut code = Code::new(CodeChannel::Usb, CodeType::MCode, Some(117));
        code.parameters
            .push(Parameter::quoted(UNNAMED_LETTER, "say \"hi\""));
        assert_eq!(code.to_string(), "M117 \"say \"\"hi\"\"\"");
    }

    #[test]
    fn file_argument_prefers_unnamed_over_p() {
        let mut code = Code::new(CodeChannel::Http, CodeType::MCode, Some(32));
        code.parameters.push(Parameter::new('P', "fallback.g"));
        assert_eq!(code.file_argument(), Some("fallback.g"));
        code.parameters
            .insert(0, Parameter::quoted(UNNAMED_LETTER, "primary.g"));
        assert_eq!(code.file_argument(), Some("primary.g"));
    }
}
