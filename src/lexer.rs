use num_bigint::BigInt;

use crate::{
    ast::BinaryOp,
    diagnostics::{Diagnostic, SourceSpan},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    False,
    None,
    True,
    And,
    As,
    Assert,
    Async,
    Await,
    Break,
    Class,
    Continue,
    Def,
    Del,
    Elif,
    Else,
    Except,
    Finally,
    For,
    From,
    Global,
    If,
    Import,
    In,
    Is,
    Lambda,
    Nonlocal,
    Not,
    Or,
    Pass,
    Raise,
    Return,
    Try,
    While,
    With,
    Yield,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::False => "False",
            Keyword::None => "None",
            Keyword::True => "True",
            Keyword::And => "and",
            Keyword::As => "as",
            Keyword::Assert => "assert",
            Keyword::Async => "async",
            Keyword::Await => "await",
            Keyword::Break => "break",
            Keyword::Class => "class",
            Keyword::Continue => "continue",
            Keyword::Def => "def",
            Keyword::Del => "del",
            Keyword::Elif => "elif",
            Keyword::Else => "else",
            Keyword::Except => "except",
            Keyword::Finally => "finally",
            Keyword::For => "for",
            Keyword::From => "from",
            Keyword::Global => "global",
            Keyword::If => "if",
            Keyword::Import => "import",
            Keyword::In => "in",
            Keyword::Is => "is",
            Keyword::Lambda => "lambda",
            Keyword::Nonlocal => "nonlocal",
            Keyword::Not => "not",
            Keyword::Or => "or",
            Keyword::Pass => "pass",
            Keyword::Raise => "raise",
            Keyword::Return => "return",
            Keyword::Try => "try",
            Keyword::While => "while",
            Keyword::With => "with",
            Keyword::Yield => "yield",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Int,
    Float,
    /// A plain string literal; the lexeme is the decoded value.
    Str,
    /// An f-string; the lexeme is the undecoded body between the quotes.
    FString { raw: bool },
    Keyword(Keyword),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Arrow,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Tilde,
    Ampersand,
    Pipe,
    Caret,
    LShift,
    RShift,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    EqualEqual,
    NotEqual,
    Assign,
    AugAssign(BinaryOp),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, Copy, Default)]
struct StringPrefix {
    raw: bool,
    format: bool,
}

/// Turns source text into tokens, including the `Newline`, `Indent` and
/// `Dedent` tokens that carry block structure. Line breaks inside brackets
/// are insignificant.
pub struct Lexer<'a> {
    source: &'a str,
    chars: std::str::CharIndices<'a>,
    current: usize,
    peeked: Option<(usize, char)>,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    brackets: Vec<(char, usize)>,
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices(),
            current: 0,
            peeked: None,
            tokens: Vec::new(),
            indents: vec![0],
            brackets: Vec::new(),
            at_line_start: true,
        }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let next = match self.peeked.take() {
            Some(pair) => Some(pair),
            None => self.chars.next(),
        };
        if let Some((idx, ch)) = next {
            self.current = idx + ch.len_utf8();
        }
        next
    }

    fn peek(&mut self) -> Option<char> {
        if self.peeked.is_none() {
            self.peeked = self.chars.next();
        }
        self.peeked.map(|(_, ch)| ch)
    }

    /// The character after the peeked one.
    fn peek_second(&mut self) -> Option<char> {
        self.peek()?;
        self.chars.clone().next().map(|(_, ch)| ch)
    }

    fn match_next(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn collect_while<F>(&mut self, mut predicate: F)
    where
        F: FnMut(char) -> bool,
    {
        while let Some(ch) = self.peek() {
            if !predicate(ch) {
                break;
            }
            self.bump();
        }
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        let end = self.current;
        self.tokens.push(Token {
            kind,
            lexeme: self.source[start..end].to_string(),
            span: SourceSpan::new(start, end),
        });
    }

    fn error(&self, message: impl Into<String>, start: usize) -> Diagnostic {
        Diagnostic::syntax(message).with_span(SourceSpan::new(start, self.current.max(start + 1)))
    }

    fn line_number(&self, offset: usize) -> usize {
        self.source[..offset.min(self.source.len())].matches('\n').count() + 1
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, Diagnostic> {
        loop {
            if self.at_line_start {
                self.at_line_start = false;
                if self.brackets.is_empty() && self.indentation()? {
                    continue;
                }
            }
            let Some((start, ch)) = self.bump() else {
                break;
            };
            match ch {
                ' ' | '\t' | '\x0c' | '\r' => {}
                '\n' => self.newline(start),
                '#' => self.collect_while(|ch| ch != '\n'),
                '\\' => {
                    self.match_next('\r');
                    if !self.match_next('\n') {
                        return Err(self.error(
                            "unexpected character after line continuation character",
                            start,
                        ));
                    }
                }
                ch if ch.is_alphabetic() || ch == '_' => self.name_or_prefixed_string(start)?,
                '0'..='9' => self.number(start)?,
                '.' if self.peek().is_some_and(|next| next.is_ascii_digit()) => {
                    self.number(start)?
                }
                '"' | '\'' => self.string(start, ch, StringPrefix::default())?,
                _ => self.operator(start, ch)?,
            }
        }
        self.finish()
    }

    /// Measures the indentation of a new logical line. Returns `true` when
    /// the line is blank or comment-only and was skipped entirely.
    fn indentation(&mut self) -> Result<bool, Diagnostic> {
        let mut column = 0;
        loop {
            match self.peek() {
                Some(' ') => column += 1,
                Some('\t') => column = (column / 8 + 1) * 8,
                Some('\x0c') => column = 0,
                _ => break,
            }
            self.bump();
        }
        if self.peek() == Some('#') {
            self.collect_while(|ch| ch != '\n');
        }
        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.bump();
                self.at_line_start = true;
                return Ok(true);
            }
            Some('\r') if self.peek_second() == Some('\n') => {
                self.bump();
                self.bump();
                self.at_line_start = true;
                return Ok(true);
            }
            _ => {}
        }

        let start = self.current;
        let current = self.indents.last().copied().unwrap_or(0);
        if column > current {
            self.indents.push(column);
            self.tokens.push(Token {
                kind: TokenKind::Indent,
                lexeme: String::new(),
                span: SourceSpan::new(start, start),
            });
        } else if column < current {
            while self.indents.last().is_some_and(|&level| column < level) {
                self.indents.pop();
                self.tokens.push(Token {
                    kind: TokenKind::Dedent,
                    lexeme: String::new(),
                    span: SourceSpan::new(start, start),
                });
            }
            if self.indents.last().copied().unwrap_or(0) != column {
                return Err(Diagnostic::indentation(
                    "unindent does not match any outer indentation level",
                )
                .with_span(SourceSpan::new(start, start + 1)));
            }
        }
        Ok(false)
    }

    fn newline(&mut self, start: usize) {
        if !self.brackets.is_empty() {
            return;
        }
        let needs_newline = self
            .tokens
            .last()
            .is_some_and(|token| !matches!(token.kind, TokenKind::Newline));
        if needs_newline {
            self.tokens.push(Token {
                kind: TokenKind::Newline,
                lexeme: "\n".to_string(),
                span: SourceSpan::new(start, start + 1),
            });
        }
        self.at_line_start = true;
    }

    fn finish(mut self) -> Result<Vec<Token>, Diagnostic> {
        if let Some(&(open, offset)) = self.brackets.last() {
            return Err(Diagnostic::syntax(format!("'{open}' was never closed"))
                .with_span(SourceSpan::new(offset, offset + 1)));
        }
        let end = self.source.len();
        let needs_newline = self.tokens.last().is_some_and(|token| {
            !matches!(token.kind, TokenKind::Newline | TokenKind::Dedent)
        });
        if needs_newline {
            self.tokens.push(Token {
                kind: TokenKind::Newline,
                lexeme: String::new(),
                span: SourceSpan::new(end, end),
            });
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.tokens.push(Token {
                kind: TokenKind::Dedent,
                lexeme: String::new(),
                span: SourceSpan::new(end, end),
            });
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            span: SourceSpan::new(end, end),
        });
        Ok(self.tokens)
    }

    fn name_or_prefixed_string(&mut self, start: usize) -> Result<(), Diagnostic> {
        self.collect_while(|ch| ch.is_alphanumeric() || ch == '_');
        let ident = &self.source[start..self.current];
        if let Some(quote @ ('"' | '\'')) = self.peek() {
            let lower = ident.to_ascii_lowercase();
            let prefix = match lower.as_str() {
                "r" => Some(StringPrefix { raw: true, format: false }),
                "u" => Some(StringPrefix::default()),
                "f" => Some(StringPrefix { raw: false, format: true }),
                "rf" | "fr" => Some(StringPrefix { raw: true, format: true }),
                "b" | "br" | "rb" => {
                    return Err(self.error("bytes literals are not supported", start));
                }
                _ => None,
            };
            if let Some(prefix) = prefix {
                self.bump();
                return self.string(start, quote, prefix);
            }
        }
        let kind = keyword_for(ident).map_or(TokenKind::Name, TokenKind::Keyword);
        self.push(kind, start);
        Ok(())
    }

    fn number(&mut self, start: usize) -> Result<(), Diagnostic> {
        let first = self.source[start..].chars().next();
        let mut kind = TokenKind::Int;
        if first == Some('0') && matches!(self.peek(), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B')) {
            self.bump();
            self.collect_while(|ch| ch.is_ascii_hexdigit() || ch == '_');
            if let Some(message) = radix_literal_error(&self.source[start..self.current]) {
                return Err(self.error(message, start));
            }
        } else {
            if first == Some('.') {
                kind = TokenKind::Float;
            }
            self.collect_while(|ch| ch.is_ascii_digit() || ch == '_');
            if kind == TokenKind::Int && self.peek() == Some('.') {
                kind = TokenKind::Float;
                self.bump();
                self.collect_while(|ch| ch.is_ascii_digit() || ch == '_');
            }
            if matches!(self.peek(), Some('e' | 'E')) {
                let sign_then_digit = matches!(self.peek_second(), Some('+' | '-'));
                let digit = self.peek_second().is_some_and(|ch| ch.is_ascii_digit());
                if digit || sign_then_digit {
                    kind = TokenKind::Float;
                    self.bump();
                    if sign_then_digit {
                        self.bump();
                    }
                    self.collect_while(|ch| ch.is_ascii_digit() || ch == '_');
                }
            }
        }
        match self.peek() {
            Some('j' | 'J') => {
                self.bump();
                return Err(self.error("complex literals are not supported", start));
            }
            Some(ch) if ch.is_alphanumeric() || ch == '_' => {
                self.bump();
                return Err(self.error("invalid decimal literal", start));
            }
            _ => {}
        }
        let lexeme = &self.source[start..self.current];
        if !underscores_separate_digits(lexeme, false) {
            return Err(self.error("invalid decimal literal", start));
        }
        if kind == TokenKind::Int && lexeme.starts_with('0') && lexeme.contains(|ch| matches!(ch, '1'..='9')) {
            return Err(self.error(
                "leading zeros in decimal integer literals are not permitted; use an 0o prefix for octal integers",
                start,
            ));
        }
        self.push(kind, start);
        Ok(())
    }

    fn string(&mut self, start: usize, quote: char, prefix: StringPrefix) -> Result<(), Diagnostic> {
        let triple = self.peek() == Some(quote) && self.peek_second() == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }
        let body_start = self.current;
        let body_end = loop {
            let Some((idx, ch)) = self.bump() else {
                let line = self.line_number(self.source.len());
                let message = if triple {
                    format!("unterminated triple-quoted string literal (detected at line {line})")
                } else {
                    format!("unterminated string literal (detected at line {line})")
                };
                return Err(Diagnostic::syntax(message).with_span(SourceSpan::new(start, start + 1)));
            };
            match ch {
                '\\' => {
                    self.bump();
                }
                '\n' if !triple => {
                    let line = self.line_number(start);
                    return Err(Diagnostic::syntax(format!(
                        "unterminated string literal (detected at line {line})"
                    ))
                    .with_span(SourceSpan::new(start, start + 1)));
                }
                ch if ch == quote => {
                    if !triple {
                        break idx;
                    }
                    if self.peek() == Some(quote) && self.peek_second() == Some(quote) {
                        self.bump();
                        self.bump();
                        break idx;
                    }
                }
                _ => {}
            }
        };

        let body = &self.source[body_start..body_end];
        let (kind, lexeme) = if prefix.format {
            (TokenKind::FString { raw: prefix.raw }, body.to_string())
        } else if prefix.raw {
            (TokenKind::Str, body.to_string())
        } else {
            let text = unescape(body).map_err(|message| self.error(message, start))?;
            (TokenKind::Str, text)
        };
        self.tokens.push(Token {
            kind,
            lexeme,
            span: SourceSpan::new(start, self.current),
        });
        Ok(())
    }

    fn operator(&mut self, start: usize, ch: char) -> Result<(), Diagnostic> {
        let kind = match ch {
            '(' | '[' | '{' => {
                self.brackets.push((ch, start));
                match ch {
                    '(' => TokenKind::LParen,
                    '[' => TokenKind::LBracket,
                    _ => TokenKind::LBrace,
                }
            }
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, _)) => {
                        return Err(self.error(
                            format!("closing parenthesis '{ch}' does not match opening parenthesis '{open}'"),
                            start,
                        ));
                    }
                    None => return Err(self.error(format!("unmatched '{ch}'"), start)),
                }
                match ch {
                    ')' => TokenKind::RParen,
                    ']' => TokenKind::RBracket,
                    _ => TokenKind::RBrace,
                }
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '~' => TokenKind::Tilde,
            '.' => {
                if self.peek() == Some('.') && self.peek_second() == Some('.') {
                    return Err(self.error("'...' is not supported", start));
                }
                TokenKind::Dot
            }
            '+' => self.maybe_augmented(BinaryOp::Add, TokenKind::Plus),
            '-' => {
                if self.match_next('>') {
                    TokenKind::Arrow
                } else {
                    self.maybe_augmented(BinaryOp::Sub, TokenKind::Minus)
                }
            }
            '*' => {
                if self.match_next('*') {
                    self.maybe_augmented(BinaryOp::Pow, TokenKind::DoubleStar)
                } else {
                    self.maybe_augmented(BinaryOp::Mul, TokenKind::Star)
                }
            }
            '/' => {
                if self.match_next('/') {
                    self.maybe_augmented(BinaryOp::FloorDiv, TokenKind::DoubleSlash)
                } else {
                    self.maybe_augmented(BinaryOp::Div, TokenKind::Slash)
                }
            }
            '%' => self.maybe_augmented(BinaryOp::Mod, TokenKind::Percent),
            '&' => self.maybe_augmented(BinaryOp::BitAnd, TokenKind::Ampersand),
            '|' => self.maybe_augmented(BinaryOp::BitOr, TokenKind::Pipe),
            '^' => self.maybe_augmented(BinaryOp::BitXor, TokenKind::Caret),
            '<' => {
                if self.match_next('<') {
                    self.maybe_augmented(BinaryOp::LShift, TokenKind::LShift)
                } else if self.match_next('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.match_next('>') {
                    self.maybe_augmented(BinaryOp::RShift, TokenKind::RShift)
                } else if self.match_next('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '=' => {
                if self.match_next('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.match_next('=') {
                    TokenKind::NotEqual
                } else {
                    return Err(self.error("invalid syntax", start));
                }
            }
            '@' => return Err(self.error("decorators are not supported", start)),
            other => {
                return Err(self.error(
                    format!("invalid character '{other}' (U+{:04X})", other as u32),
                    start,
                ));
            }
        };
        self.push(kind, start);
        Ok(())
    }

    fn maybe_augmented(&mut self, op: BinaryOp, plain: TokenKind) -> TokenKind {
        if self.match_next('=') {
            TokenKind::AugAssign(op)
        } else {
            plain
        }
    }
}

fn keyword_for(ident: &str) -> Option<Keyword> {
    use self::Keyword as Kw;
    let keyword = match ident {
        "False" => Kw::False,
        "None" => Kw::None,
        "True" => Kw::True,
        "and" => Kw::And,
        "as" => Kw::As,
        "assert" => Kw::Assert,
        "async" => Kw::Async,
        "await" => Kw::Await,
        "break" => Kw::Break,
        "class" => Kw::Class,
        "continue" => Kw::Continue,
        "def" => Kw::Def,
        "del" => Kw::Del,
        "elif" => Kw::Elif,
        "else" => Kw::Else,
        "except" => Kw::Except,
        "finally" => Kw::Finally,
        "for" => Kw::For,
        "from" => Kw::From,
        "global" => Kw::Global,
        "if" => Kw::If,
        "import" => Kw::Import,
        "in" => Kw::In,
        "is" => Kw::Is,
        "lambda" => Kw::Lambda,
        "nonlocal" => Kw::Nonlocal,
        "not" => Kw::Not,
        "or" => Kw::Or,
        "pass" => Kw::Pass,
        "raise" => Kw::Raise,
        "return" => Kw::Return,
        "try" => Kw::Try,
        "while" => Kw::While,
        "with" => Kw::With,
        "yield" => Kw::Yield,
        _ => return None,
    };
    Some(keyword)
}

/// Decodes backslash escapes in a non-raw string body. A truncated or
/// out-of-range `\x`, `\u` or `\U` escape is an error.
pub fn unescape(body: &str) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices().peekable();
    while let Some((position, ch)) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some((_, esc)) = chars.next() else {
            out.push('\\');
            break;
        };
        match esc {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '0'..='7' => {
                let mut code = esc.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|(_, ch)| ch.to_digit(8)) {
                        Some(digit) => {
                            code = code * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.extend(char::from_u32(code));
            }
            'x' | 'u' | 'U' => {
                let (width, shape) = match esc {
                    'x' => (2, "\\xXX"),
                    'u' => (4, "\\uXXXX"),
                    _ => (8, "\\UXXXXXXXX"),
                };
                let mut code = 0u32;
                let mut taken = 0;
                while taken < width {
                    match chars.peek().and_then(|(_, ch)| ch.to_digit(16)) {
                        Some(digit) => {
                            code = code * 16 + digit;
                            chars.next();
                            taken += 1;
                        }
                        None => break,
                    }
                }
                let last = position + 1 + taken;
                if taken < width {
                    return Err(unicode_error(position, last, &format!("truncated {shape} escape")));
                }
                match char::from_u32(code) {
                    Some(decoded) => out.push(decoded),
                    None => return Err(unicode_error(position, last, "illegal Unicode character")),
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn unicode_error(first: usize, last: usize, reason: &str) -> String {
    format!(
        "(unicode error) 'unicodeescape' codec can't decode bytes in position {first}-{last}: {reason}"
    )
}

/// Every `_` in a numeric literal must sit between two digits, or directly
/// after a radix prefix.
fn underscores_separate_digits(lexeme: &str, hex: bool) -> bool {
    let is_digit = |byte: &u8| if hex { byte.is_ascii_hexdigit() } else { byte.is_ascii_digit() };
    let bytes = lexeme.as_bytes();
    bytes.iter().enumerate().all(|(idx, byte)| {
        if *byte != b'_' {
            return true;
        }
        let before = idx.checked_sub(1).map(|prev| bytes[prev]);
        let after = bytes.get(idx + 1);
        let prefix = idx == 2 && matches!(before, Some(b'x' | b'X' | b'o' | b'O' | b'b' | b'B'));
        (prefix || before.as_ref().is_some_and(is_digit)) && after.is_some_and(is_digit)
    })
}

fn radix_literal_error(lexeme: &str) -> Option<String> {
    let (name, radix) = match lexeme.as_bytes().get(1) {
        Some(b'x' | b'X') => ("hexadecimal", 16),
        Some(b'o' | b'O') => ("octal", 8),
        _ => ("binary", 2),
    };
    let digits = &lexeme[2..];
    if digits.is_empty() || !underscores_separate_digits(lexeme, true) {
        return Some(format!("invalid {name} literal"));
    }
    digits
        .chars()
        .find(|ch| *ch != '_' && !ch.is_digit(radix))
        .map(|ch| format!("invalid digit '{ch}' in {name} literal"))
}

/// Value of an integer literal lexeme (decimal, hex, octal or binary).
pub fn int_value(lexeme: &str) -> Option<BigInt> {
    let cleaned = lexeme.replace('_', "");
    let (digits, radix) = match cleaned.get(..2) {
        Some("0x" | "0X") => (&cleaned[2..], 16),
        Some("0o" | "0O") => (&cleaned[2..], 8),
        Some("0b" | "0B") => (&cleaned[2..], 2),
        _ => (cleaned.as_str(), 10),
    };
    BigInt::parse_bytes(digits.as_bytes(), radix)
}

pub fn float_value(lexeme: &str) -> Option<f64> {
    lexeme.replace('_', "").parse().ok()
}
