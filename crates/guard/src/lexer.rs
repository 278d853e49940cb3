//! PostgreSQL-flavoured tokenizer.
//!
//! Comments are dropped, literals and quoted identifiers become single tokens,
//! so callers can reason about bare words without ever looking inside a string.
//! Anything that cannot be closed (string, quoted identifier, comment, dollar
//! quote) is an error: the gates treat an untokenizable statement as unsafe.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Word,
    /// `"..."` identifier; `text` holds the unescaped name.
    QuotedIdent,
    /// Any string literal form (`'..'`, `E'..'`, `$tag$..$tag$`); `text` is the raw source.
    StringLit,
    Number,
    /// Positional parameter such as `$1`.
    Param,
    /// Single-character punctuation: `( ) , ; . [ ] :`.
    Punct,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Char offsets of the token in the source, `end` exclusive.
    pub offset: usize,
    pub end: usize,
}

impl Token {
    pub fn is_word(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, ch: char) -> bool {
        self.kind == TokenKind::Punct && self.text.len() == 1 && self.text.starts_with(ch)
    }

    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, TokenKind::StringLit | TokenKind::Number)
    }

    /// Identifier text folded the way the catalog compares names.
    pub fn ident_key(&self) -> String {
        self.text.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexErrorKind {
    UnterminatedString,
    UnterminatedQuotedIdent,
    UnterminatedComment,
    UnterminatedDollarQuote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub offset: usize,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            LexErrorKind::UnterminatedString => "unterminated string literal",
            LexErrorKind::UnterminatedQuotedIdent => "unterminated quoted identifier",
            LexErrorKind::UnterminatedComment => "unterminated block comment",
            LexErrorKind::UnterminatedDollarQuote => "unterminated dollar-quoted string",
        };
        write!(f, "{} at offset {}", what, self.offset)
    }
}

impl std::error::Error for LexError {}

const OPERATOR_CHARS: &str = "+-*/<>=~!@#%^&|?";

pub fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    let chars = sql.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i = skip_block_comment(&chars, i)?;
            continue;
        }

        let start = i;

        if c == '\'' {
            i = scan_quoted(&chars, i, '\'', false)
                .ok_or(LexError {
                    kind: LexErrorKind::UnterminatedString,
                    offset: start,
                })?;
            tokens.push(token(TokenKind::StringLit, &chars[start..i], start));
            continue;
        }

        // E'..' escape strings plus B/X/N prefixed literals.
        if matches!(c, 'e' | 'E' | 'b' | 'B' | 'x' | 'X' | 'n' | 'N')
            && chars.get(i + 1) == Some(&'\'')
        {
            let backslash_escapes = matches!(c, 'e' | 'E');
            i = scan_quoted(&chars, i + 1, '\'', backslash_escapes).ok_or(LexError {
                kind: LexErrorKind::UnterminatedString,
                offset: start,
            })?;
            tokens.push(token(TokenKind::StringLit, &chars[start..i], start));
            continue;
        }

        if c == '"' {
            i = scan_quoted(&chars, i, '"', false).ok_or(LexError {
                kind: LexErrorKind::UnterminatedQuotedIdent,
                offset: start,
            })?;
            let inner = chars[start + 1..i - 1]
                .iter()
                .collect::<String>()
                .replace("\"\"", "\"");
            tokens.push(Token {
                kind: TokenKind::QuotedIdent,
                text: inner,
                offset: start,
                end: i,
            });
            continue;
        }

        if c == '$' {
            if chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                tokens.push(token(TokenKind::Param, &chars[start..i], start));
                continue;
            }
            if let Some(tag_end) = dollar_tag_end(&chars, i) {
                let tag = &chars[i..=tag_end];
                i = find_sequence(&chars, tag_end + 1, tag)
                    .map(|pos| pos + tag.len())
                    .ok_or(LexError {
                        kind: LexErrorKind::UnterminatedDollarQuote,
                        offset: start,
                    })?;
                tokens.push(token(TokenKind::StringLit, &chars[start..i], start));
                continue;
            }
            tokens.push(token(TokenKind::Operator, &chars[i..=i], start));
            i += 1;
            continue;
        }

        if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            i = scan_number(&chars, i);
            tokens.push(token(TokenKind::Number, &chars[start..i], start));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(token(TokenKind::Word, &chars[start..i], start));
            continue;
        }

        if c == ':' && chars.get(i + 1) == Some(&':') {
            tokens.push(token(TokenKind::Operator, &chars[i..i + 2], start));
            i += 2;
            continue;
        }

        if "(),;.[]:".contains(c) {
            tokens.push(token(TokenKind::Punct, &chars[i..=i], start));
            i += 1;
            continue;
        }

        if OPERATOR_CHARS.contains(c) {
            i += 1;
            while i < chars.len() && OPERATOR_CHARS.contains(chars[i]) {
                // A comment opener ends the operator.
                let next = chars.get(i + 1).copied();
                if (chars[i] == '-' && next == Some('-')) || (chars[i] == '/' && next == Some('*'))
                {
                    break;
                }
                i += 1;
            }
            tokens.push(token(TokenKind::Operator, &chars[start..i], start));
            continue;
        }

        // Anything else is kept as an opaque operator so it is never silently dropped.
        tokens.push(token(TokenKind::Operator, &chars[i..=i], start));
        i += 1;
    }

    Ok(tokens)
}

fn token(kind: TokenKind, text: &[char], offset: usize) -> Token {
    Token {
        kind,
        text: text.iter().collect(),
        offset,
        end: offset + text.len(),
    }
}

/// The statement without trailing comments and `;` terminators, so it can be
/// embedded in a larger query.
pub fn statement_body(sql: &str) -> Result<String, LexError> {
    let tokens = tokenize(sql)?;
    let end = tokens
        .iter()
        .rev()
        .find(|t| !t.is_punct(';'))
        .map_or(0, |t| t.end);
    Ok(sql.chars().take(end).collect::<String>().trim().to_string())
}

fn skip_block_comment(chars: &[char], start: usize) -> Result<usize, LexError> {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            depth += 1;
            i += 2;
        } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return Ok(i);
            }
        } else {
            i += 1;
        }
    }
    Err(LexError {
        kind: LexErrorKind::UnterminatedComment,
        offset: start,
    })
}

/// Returns the index one past the closing quote. A doubled quote is an escape.
fn scan_quoted(chars: &[char], open: usize, quote: char, backslash_escapes: bool) -> Option<usize> {
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i];
        if backslash_escapes && c == '\\' {
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// For `$tag$` or `$$` starting at `start`, the index of the closing `$` of the tag.
fn dollar_tag_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'$') {
        return Some(i);
    }
    match chars.get(i) {
        Some(c) if c.is_alphabetic() || *c == '_' => {}
        _ => return None,
    }
    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    (chars.get(i) == Some(&'$')).then_some(i)
}

fn find_sequence(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if needle.is_empty() || from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn scan_number(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if chars.get(i) == Some(&'.') && chars.get(i + 1) != Some(&'.') {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(chars.get(i), Some('e' | 'E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+' | '-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(|d| d.is_ascii_digit()) {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}
