use crate::code::{Code, Parameter, UNNAMED_LETTER};
use crate::errors::ParseError;
use crate::types::{CodeChannel, CodeType, KeywordType};

/// Scanner state while consuming the parameter section of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Normal,
    InQuotes,
    InParenComment,
    InLineComment,
}

fn is_line_space(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Parse one line of G-code into a `Code`. Single pass, no lookahead past
/// the next character except for the `""` quote escape.
pub(crate) fn parse(channel: CodeChannel, text: &str) -> Result<Code, ParseError> {
    let line = text.strip_suffix('\n').unwrap_or(text);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut chars = line.chars().peekable();
    while chars.peek().is_some_and(|c| is_line_space(*c)) {
        chars.next();
    }

    // Blank line.
    if chars.peek().is_none() {
        return Ok(Code::new(channel, CodeType::Comment, None));
    }

    // Whole-line comment.
    if *chars.peek().unwrap() == ';' {
        chars.next();
        let mut code = Code::new(channel, CodeType::Comment, None);
        code.comment = Some(chars.collect());
        return Ok(code);
    }

    let mut code = Code::new(channel, CodeType::Comment, None);

    // Comment-only line in parentheses.
    if *chars.peek().unwrap() == '(' {
        chars.next();
        let mut content = String::new();
        loop {
            match chars.next() {
                Some(')') => break,
                Some(c) => content.push(c),
                None => return Err(ParseError::new("unterminated parenthesized comment")),
            }
        }
        append_comment(&mut code, &content);
        while chars.peek().is_some_and(|c| is_line_space(*c)) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(code);
        }
    }

    // Optional line number (`N123 G1 ...`).
    if chars.peek().is_some_and(|c| *c == 'N' || *c == 'n') {
        let mut ahead = chars.clone();
        ahead.next();
        if ahead.peek().is_some_and(|c| c.is_ascii_digit()) {
            chars.next();
            let mut digits = String::new();
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                digits.push(chars.next().unwrap());
            }
            code.line_number = digits.parse().ok();
            while chars.peek().is_some_and(|c| is_line_space(*c)) {
                chars.next();
            }
        }
    }

    // First alphabetic run decides between a code letter and a keyword.
    let mut word = String::new();
    while chars.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
        word.push(chars.next().unwrap());
    }

    let code_type = match word.len() {
        0 => {
            return Err(ParseError::new(format!(
                "expected G, M or T code or keyword, found {:?}",
                chars.peek().map(|c| c.to_string()).unwrap_or_default()
            )))
        }
        1 => match word.chars().next().unwrap().to_ascii_uppercase() {
            'G' => CodeType::GCode,
            'M' => CodeType::MCode,
            'T' => CodeType::TCode,
            other => {
                return Err(ParseError::new(format!(
                    "unknown code letter '{other}'"
                )))
            }
        },
        _ => {
            let keyword = KeywordType::from_word(&word.to_ascii_lowercase())
                .ok_or_else(|| ParseError::new(format!("unknown keyword {word:?}")))?;
            return parse_keyword_line(code, keyword, chars);
        }
    };
    code.code_type = code_type;

    // Major number.
    let mut digits = String::new();
    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        digits.push(chars.next().unwrap());
    }
    if digits.is_empty() {
        // A bare T reports the current tool; G and M require a number.
        if code_type != CodeType::TCode {
            return Err(ParseError::new(format!(
                "invalid major number for {word} code"
            )));
        }
    } else {
        code.major = Some(
            digits
                .parse::<i32>()
                .map_err(|_| ParseError::new(format!("invalid major number {digits:?}")))?,
        );
    }

    // Optional minor number after a literal dot.
    if chars.peek().is_some_and(|c| *c == '.') {
        chars.next();
        let mut digits = String::new();
        while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            digits.push(chars.next().unwrap());
        }
        code.minor = Some(
            digits
                .parse::<i8>()
                .map_err(|_| ParseError::new(format!("invalid minor number {digits:?}")))?,
        );
    }

    // Parameter and comment section.
    let mut state = State::Normal;
    let mut letter: Option<char> = None;
    let mut value = String::new();
    let mut quoted = false;
    let mut comment = String::new();

    loop {
        let c = chars.next();
        match state {
            State::Normal => match c {
                None => {
                    flush_parameter(&mut code, &mut letter, &mut value, &mut quoted);
                    break;
                }
                Some(c) if is_line_space(c) => {
                    flush_parameter(&mut code, &mut letter, &mut value, &mut quoted);
                }
                Some(';') => {
                    flush_parameter(&mut code, &mut letter, &mut value, &mut quoted);
                    state = State::InLineComment;
                }
                Some('(') => {
                    flush_parameter(&mut code, &mut letter, &mut value, &mut quoted);
                    state = State::InParenComment;
                }
                Some('"') => {
                    if letter.is_none() {
                        letter = Some(UNNAMED_LETTER);
                    }
                    quoted = true;
                    state = State::InQuotes;
                }
                Some(c) => {
                    if letter.is_none() {
                        letter = Some(c.to_ascii_uppercase());
                    } else if c.is_ascii_alphabetic() && is_numeric_value(&value) {
                        // A letter ends a numeric run and starts the next
                        // parameter (`G1X10Y20`).
                        flush_parameter(&mut code, &mut letter, &mut value, &mut quoted);
                        letter = Some(c.to_ascii_uppercase());
                    } else {
                        value.push(c);
                    }
                }
            },
            State::InQuotes => match c {
                None => return Err(ParseError::new("unterminated quoted string")),
                Some('"') => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        value.push('"');
                    } else {
                        flush_parameter(&mut code, &mut letter, &mut value, &mut quoted);
                        state = State::Normal;
                    }
                }
                Some(c) => value.push(c),
            },
            State::InParenComment => match c {
                None => return Err(ParseError::new("unterminated parenthesized comment")),
                Some(')') => {
                    append_comment(&mut code, &comment);
                    comment.clear();
                    state = State::Normal;
                }
                Some(c) => comment.push(c),
            },
            State::InLineComment => match c {
                None => {
                    append_comment(&mut code, &comment);
                    break;
                }
                Some(c) => comment.push(c),
            },
        }
    }

    Ok(code)
}

/// Rest of a keyword line: the argument runs to the end of the line or an
/// unquoted `;`. Parentheses are expression syntax here, not comments.
fn parse_keyword_line(
    mut code: Code,
    keyword: KeywordType,
    mut chars: std::iter::Peekable<std::str::Chars<'_>>,
) -> Result<Code, ParseError> {
    code.code_type = CodeType::Keyword;
    code.keyword = Some(keyword);

    let mut argument = String::new();
    let mut in_quotes = false;
    loop {
        match chars.next() {
            None => {
                if in_quotes {
                    return Err(ParseError::new("unterminated quoted string"));
                }
                break;
            }
            Some('"') => {
                if in_quotes && chars.peek() == Some(&'"') {
                    chars.next();
                    argument.push_str("\"\"");
                } else {
                    in_quotes = !in_quotes;
                    argument.push('"');
                }
            }
            Some(';') if !in_quotes => {
                let comment: String = chars.collect();
                append_comment(&mut code, &comment);
                break;
            }
            Some(c) => argument.push(c),
        }
    }
    let argument = argument.trim();
    if !argument.is_empty() {
        code.keyword_argument = Some(argument.to_string());
    }
    Ok(code)
}

fn is_numeric_value(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | ':'))
}

fn flush_parameter(code: &mut Code, letter: &mut Option<char>, value: &mut String, quoted: &mut bool) {
    if let Some(l) = letter.take() {
        code.parameters.push(Parameter {
            letter: l,
            raw: std::mem::take(value),
            quoted: *quoted,
        });
    }
    *quoted = false;
}

fn append_comment(code: &mut Code, content: &str) {
    match &mut code.comment {
        Some(existing) => existing.push_str(content),
        None => code.comment = Some(content.to_string()),
    }
}
