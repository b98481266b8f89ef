//! Tokenizer. `//` comments and whitespace are skipped; string and bytes literals
//! accept the raw and triple-quoted forms.

use crate::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(u64),
    Uint(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ident(String),
    True,
    False,
    Null,
    In,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Dot,
    Comma,
    LBracket,
    RBracket,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub pos: usize,
}

const RESERVED: &[&str] = &[
    "as", "break", "const", "continue", "else", "for", "function", "if", "import", "let", "loop", "package",
    "namespace", "return", "var", "void", "while",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    let err = |pos: usize, msg: &str| ExprError::Compile(format!("{} at offset {}", msg, pos));

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        let start = i;

        // string literals with optional raw/bytes prefix
        let mut raw = false;
        let mut bytes = false;
        let mut j = i;
        while j < chars.len() && j - i < 2 {
            match chars[j] {
                'r' | 'R' if !raw => raw = true,
                'b' | 'B' if !bytes => bytes = true,
                _ => break,
            }
            j += 1;
        }
        if !matches!(chars.get(j), Some('"') | Some('\'')) {
            (raw, bytes, j) = (false, false, i);
        }
        if chars[j] == '"' || chars[j] == '\'' {
            let (lit, next) = lex_string(&chars, j, raw, bytes).map_err(|m| err(start, &m))?;
            let tok = if bytes {
                Tok::Bytes(lit)
            } else {
                Tok::Str(String::from_utf8(lit).map_err(|_| err(start, "invalid UTF-8 in string literal"))?)
            };
            out.push(Token { tok, pos: start });
            i = next;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map(|d| d.is_ascii_digit()).unwrap_or(false)) {
            let (tok, next) = lex_number(&chars, i).map_err(|m| err(start, &m))?;
            out.push(Token { tok, pos: start });
            i = next;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let tok = match word.as_str() {
                "true" => Tok::True,
                "false" => Tok::False,
                "null" => Tok::Null,
                "in" => Tok::In,
                w if RESERVED.contains(&w) => return Err(err(start, &format!("reserved identifier '{}'", w))),
                _ => Tok::Ident(word),
            };
            out.push(Token { tok, pos: start });
            continue;
        }

        let two: Option<Tok> = match (c, chars.get(i + 1).copied()) {
            ('=', Some('=')) => Some(Tok::Eq),
            ('!', Some('=')) => Some(Tok::Ne),
            ('<', Some('=')) => Some(Tok::Le),
            ('>', Some('=')) => Some(Tok::Ge),
            ('&', Some('&')) => Some(Tok::AndAnd),
            ('|', Some('|')) => Some(Tok::OrOr),
            _ => None,
        };
        if let Some(tok) = two {
            out.push(Token { tok, pos: start });
            i += 2;
            continue;
        }
        let tok = match c {
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '!' => Tok::Bang,
            '<' => Tok::Lt,
            '>' => Tok::Gt,
            '?' => Tok::Question,
            ':' => Tok::Colon,
            '.' => Tok::Dot,
            ',' => Tok::Comma,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            other => return Err(err(start, &format!("unexpected character {:?}", other))),
        };
        out.push(Token { tok, pos: start });
        i += 1;
    }
    out.push(Token { tok: Tok::Eof, pos: chars.len() });
    Ok(out)
}

fn lex_number(chars: &[char], mut i: usize) -> Result<(Tok, usize), String> {
    let start = i;
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        i += 2;
        let hs = i;
        while i < chars.len() && chars[i].is_ascii_hexdigit() {
            i += 1;
        }
        let digits: String = chars[hs..i].iter().collect();
        let v = u64::from_str_radix(&digits, 16).map_err(|_| "invalid hex literal".to_string())?;
        if matches!(chars.get(i), Some('u') | Some('U')) {
            return Ok((Tok::Uint(v), i + 1));
        }
        return Ok((Tok::Int(v), i));
    }
    let mut is_double = false;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if chars.get(i) == Some(&'.') && chars.get(i + 1).map(|d| d.is_ascii_digit()).unwrap_or(false) {
        is_double = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(chars.get(i), Some('e') | Some('E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+') | Some('-')) {
            j += 1;
        }
        if chars.get(j).map(|d| d.is_ascii_digit()).unwrap_or(false) {
            is_double = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().collect();
    if is_double {
        let v = text.parse::<f64>().map_err(|_| format!("invalid double literal {}", text))?;
        return Ok((Tok::Double(v), i));
    }
    let v = text.parse::<u64>().map_err(|_| format!("integer literal {} out of range", text))?;
    if matches!(chars.get(i), Some('u') | Some('U')) {
        return Ok((Tok::Uint(v), i + 1));
    }
    Ok((Tok::Int(v), i))
}

/// Literal body as bytes. Outside bytes literals only whole characters are produced,
/// so the result is valid UTF-8.
fn lex_string(chars: &[char], i: usize, raw: bool, bytes: bool) -> Result<(Vec<u8>, usize), String> {
    let q = chars[i];
    let triple = chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q);
    let mut j = if triple { i + 3 } else { i + 1 };
    let mut out = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let Some(&c) = chars.get(j) else {
            return Err("unterminated string literal".into());
        };
        if triple {
            if c == q && chars.get(j + 1) == Some(&q) && chars.get(j + 2) == Some(&q) {
                return Ok((out, j + 3));
            }
        } else if c == q {
            return Ok((out, j + 1));
        } else if c == '\n' {
            return Err("newline in string literal".into());
        }
        if c == '\\' && !raw {
            let (esc, next) = unescape(chars, j + 1, bytes)?;
            match esc {
                Escaped::Char(ch) => out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes()),
                Escaped::Byte(b) => out.push(b),
            }
            j = next;
            continue;
        }
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        j += 1;
    }
}

enum Escaped {
    Char(char),
    Byte(u8),
}

/// In bytes literals `\x` and octal escapes denote single bytes and `\u`/`\U` are rejected.
fn unescape(chars: &[char], j: usize, bytes: bool) -> Result<(Escaped, usize), String> {
    let Some(&c) = chars.get(j) else {
        return Err("dangling escape".into());
    };
    let digits = |from: usize, n: usize, radix: u32| -> Result<u32, String> {
        let s: String = chars.get(from..from + n).ok_or("short escape")?.iter().collect();
        u32::from_str_radix(&s, radix).map_err(|_| format!("invalid escape \\{}", s))
    };
    let code = |v: u32, next: usize| -> Result<(Escaped, usize), String> {
        if bytes {
            let b = u8::try_from(v).map_err(|_| "byte escape out of range".to_string())?;
            return Ok((Escaped::Byte(b), next));
        }
        char::from_u32(v).map(|c| (Escaped::Char(c), next)).ok_or_else(|| "invalid code point".to_string())
    };
    let simple = |ch: char| -> Result<(Escaped, usize), String> { Ok((Escaped::Char(ch), j + 1)) };
    match c {
        'n' => simple('\n'),
        't' => simple('\t'),
        'r' => simple('\r'),
        'a' => simple('\u{07}'),
        'b' => simple('\u{08}'),
        'f' => simple('\u{0C}'),
        'v' => simple('\u{0B}'),
        '\\' | '\'' | '"' | '`' | '?' => simple(c),
        'x' | 'X' => code(digits(j + 1, 2, 16)?, j + 3),
        'u' | 'U' if bytes => Err(format!("\\{} escapes are not allowed in bytes literals", c)),
        'u' => code(digits(j + 1, 4, 16)?, j + 5),
        'U' => code(digits(j + 1, 8, 16)?, j + 9),
        '0'..='3' => code(digits(j, 3, 8)?, j + 3),
        other => Err(format!("invalid escape \\{}", other)),
    }
}
