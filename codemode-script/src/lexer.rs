//! Indentation-aware tokenizer.

use crate::error::{ParseResult, SyntaxError};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Name(String),
    /// Magnitude only; a leading `-` is a separate operator token.
    Int(u64),
    Float(f64),
    Str(String),
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

const OPERATORS: [&str; 38] = [
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "+",
    "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@",
    "|", "&", "^", "~", "!",
];

const TAB_WIDTH: usize = 8;

pub(crate) fn tokenize(source: &str) -> ParseResult<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            depth: 0,
            indents: vec![0],
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line, self.column)
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    fn run(mut self) -> ParseResult<Vec<Token>> {
        loop {
            if self.at_line_start && self.depth == 0 {
                self.at_line_start = false;
                if !self.indentation()? {
                    continue;
                }
            }

            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\r' | '\x0c' => {
                    self.bump();
                }
                '\n' => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    if self.depth == 0 {
                        self.newline(line, column);
                        self.at_line_start = true;
                    }
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    match self.peek() {
                        Some('\n') => {
                            self.bump();
                        }
                        Some('\r') if self.peek_at(1) == Some('\n') => {
                            self.bump();
                            self.bump();
                        }
                        _ => return Err(self.error("unexpected character after line continuation")),
                    }
                }
                '\'' | '"' => self.string(false, false)?,
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c == '_' || c.is_alphabetic() => self.name()?,
                _ => self.operator()?,
            }
        }

        let (line, column) = (self.line, self.column);
        self.newline(line, column);
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, line, column);
        }
        self.push(TokenKind::Eof, line, column);
        Ok(self.tokens)
    }

    fn newline(&mut self, line: usize, column: usize) {
        let needed = self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent));
        if needed {
            self.push(TokenKind::Newline, line, column);
        }
    }

    /// Measures leading whitespace of a logical line. Returns `false` for blank
    /// or comment-only lines, which produce no tokens.
    fn indentation(&mut self) -> ParseResult<bool> {
        let mut width = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.bump();
        }

        match self.peek() {
            None => return Ok(false),
            Some('\n') => {
                self.bump();
                self.at_line_start = true;
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.bump();
                }
                self.at_line_start = true;
                return Ok(false);
            }
            Some(_) => {}
        }

        let (line, column) = (self.line, self.column);
        let current = self.indents.last().copied().unwrap_or_default();
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, line, column);
        } else if width < current {
            while self.indents.last().is_some_and(|&level| level > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, line, column);
            }
            if self.indents.last().copied() != Some(width) {
                return Err(SyntaxError::new(
                    "unindent does not match any outer indentation level",
                    line,
                    column,
                ));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while self.peek().is_some_and(|c| c != '\n') {
            self.bump();
        }
    }

    fn name(&mut self) -> ParseResult<()> {
        let (line, column) = (self.line, self.column);
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }

        if matches!(self.peek(), Some('\'' | '"')) {
            let prefix = name.to_ascii_lowercase();
            let (raw, formatted) = match prefix.as_str() {
                "r" => (true, false),
                "f" => (false, true),
                "rf" | "fr" => (true, true),
                "u" => (false, false),
                _ => {
                    self.push(TokenKind::Name(name), line, column);
                    return Ok(());
                }
            };
            return self.string_at(raw, formatted, line, column);
        }

        self.push(TokenKind::Name(name), line, column);
        Ok(())
    }

    fn string(&mut self, raw: bool, formatted: bool) -> ParseResult<()> {
        let (line, column) = (self.line, self.column);
        self.string_at(raw, formatted, line, column)
    }

    fn string_at(&mut self, raw: bool, formatted: bool, line: usize, column: usize) -> ParseResult<()> {
        let Some(quote) = self.bump() else {
            return Err(self.error("unterminated string literal"));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(SyntaxError::new("unterminated string literal", line, column));
            };
            if c == quote {
                if !triple {
                    self.bump();
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
            }
            if c == '\n' && !triple {
                return Err(SyntaxError::new("unterminated string literal", line, column));
            }
            if c == '\\' {
                self.bump();
                if raw {
                    value.push('\\');
                    if let Some(next) = self.bump() {
                        value.push(next);
                    }
                } else {
                    self.escape(&mut value)?;
                }
                continue;
            }
            value.push(c);
            self.bump();
        }

        let kind = if formatted {
            TokenKind::FStr(value)
        } else {
            TokenKind::Str(value)
        };
        self.push(kind, line, column);
        Ok(())
    }

    fn escape(&mut self, out: &mut String) -> ParseResult<()> {
        let Some(c) = self.bump() else {
            return Err(self.error("unterminated string literal"));
        };
        match c {
            '\n' => {}
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            'x' => out.push(self.hex_escape(2)?),
            'u' => out.push(self.hex_escape(4)?),
            'U' => out.push(self.hex_escape(8)?),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn hex_escape(&mut self, digits: usize) -> ParseResult<char> {
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("truncated \\x, \\u or \\U escape"))?;
            self.bump();
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| self.error("invalid unicode escape"))
    }

    fn number(&mut self) -> ParseResult<()> {
        let (line, column) = (self.line, self.column);

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.bump();
                self.bump();
                let digits = self.take_digits(|c| c.is_digit(radix));
                let value = u64::from_str_radix(&digits, radix)
                    .map_err(|_| SyntaxError::new("invalid integer literal", line, column))?;
                self.push(TokenKind::Int(value), line, column);
                return Ok(());
            }
        }

        let mut text = self.take_digits(|c| c.is_ascii_digit());
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_none_or(|c| c.is_ascii_digit() || !c.is_alphabetic()) {
            is_float = true;
            self.bump();
            text.push('.');
            text.push_str(&self.take_digits(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = self.peek_at(1);
            let has_digit = match sign {
                Some('+' | '-') => self.peek_at(2).is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if has_digit {
                is_float = true;
                self.bump();
                text.push('e');
                if let Some(s @ ('+' | '-')) = self.peek() {
                    self.bump();
                    text.push(s);
                }
                text.push_str(&self.take_digits(|c| c.is_ascii_digit()));
            }
        }

        let kind = if is_float {
            let text = if text.starts_with('.') { format!("0{text}") } else { text };
            TokenKind::Float(
                text.parse()
                    .map_err(|_| SyntaxError::new("invalid float literal", line, column))?,
            )
        } else {
            TokenKind::Int(
                text.parse()
                    .map_err(|_| SyntaxError::new("integer literal is too large", line, column))?,
            )
        };
        self.push(kind, line, column);
        Ok(())
    }

    fn take_digits(&mut self, accept: impl Fn(char) -> bool) -> String {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if accept(c) {
                digits.push(c);
            } else if c != '_' {
                break;
            }
            self.bump();
        }
        digits
    }

    fn operator(&mut self) -> ParseResult<()> {
        let (line, column) = (self.line, self.column);
        let rest: String = self.chars[self.pos..].iter().take(3).collect();
        let Some(op) = OPERATORS.iter().copied().find(|op| rest.starts_with(op)) else {
            return Err(self.error(format!("invalid character '{}'", rest.chars().next().unwrap_or(' '))));
        };
        if op == "!" {
            return Err(self.error("invalid syntax"));
        }
        for _ in 0..op.chars().count() {
            self.bump();
        }
        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.push(TokenKind::Op(op), line, column);
        Ok(())
    }
}

/// Removes the longest common leading whitespace from every non-blank line.
pub(crate) fn dedent(source: &str) -> String {
    let margin = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);
    if margin == 0 {
        return source.to_owned();
    }

    source
        .lines()
        .map(|line| if line.len() >= margin { &line[margin..] } else { line.trim_start() })
        .collect::<Vec<_>>()
        .join("\n")
}
