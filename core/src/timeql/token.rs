use crate::error::EngineError;
use std::fmt;

/// Lexical token. Keywords are ordinary identifiers; the parser matches them
/// case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Keyword, field path, unit, or bare event id.
    Ident(String),
    /// Single-quoted string.
    Str(String),
    Int(i64),
    Float(f64),
    Eq,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Int(n) => write!(f, "{n}"),
            Token::Float(n) => write!(f, "{n}"),
            Token::Eq => write!(f, "="),
            Token::EqEq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Comma => write!(f, ","),
        }
    }
}

/// Token plus the byte offset it started at, for error reporting.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub position: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    // Dotted field paths, colon-namespaced event types, and dashed ids all
    // lex as one identifier.
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, EngineError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let c = bytes[pos] as char;

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;

        if c == '\'' {
            pos += 1;
            let content_start = pos;
            while pos < bytes.len() && bytes[pos] as char != '\'' {
                pos += 1;
            }
            if pos >= bytes.len() {
                return Err(EngineError::parse(
                    "unterminated string literal",
                    &input[start..],
                    start,
                ));
            }
            tokens.push(Spanned {
                token: Token::Str(input[content_start..pos].to_string()),
                position: start,
            });
            pos += 1;
            continue;
        }

        if c.is_ascii_digit()
            || (c == '-' && pos + 1 < bytes.len() && (bytes[pos + 1] as char).is_ascii_digit())
        {
            pos += 1;
            let mut is_float = false;
            while pos < bytes.len() {
                let d = bytes[pos] as char;
                if d.is_ascii_digit() {
                    pos += 1;
                } else if d == '.' && !is_float {
                    is_float = true;
                    pos += 1;
                } else {
                    break;
                }
            }
            let text = &input[start..pos];
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| {
                    EngineError::parse("malformed number", text, start)
                })?)
            } else {
                Token::Int(text.parse().map_err(|_| {
                    EngineError::parse("malformed number", text, start)
                })?)
            };
            tokens.push(Spanned {
                token,
                position: start,
            });
            continue;
        }

        if is_ident_start(c) {
            pos += 1;
            while pos < bytes.len() && is_ident_continue(bytes[pos] as char) {
                pos += 1;
            }
            tokens.push(Spanned {
                token: Token::Ident(input[start..pos].to_string()),
                position: start,
            });
            continue;
        }

        let token = match c {
            '=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    Token::EqEq
                } else {
                    pos += 1;
                    Token::Eq
                }
            }
            '!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    Token::Ne
                } else {
                    return Err(EngineError::parse("expected `!=`", "!", start));
                }
            }
            '<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    Token::Le
                } else {
                    pos += 1;
                    Token::Lt
                }
            }
            '>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    Token::Ge
                } else {
                    pos += 1;
                    Token::Gt
                }
            }
            ',' => {
                pos += 1;
                Token::Comma
            }
            other => {
                return Err(EngineError::parse(
                    "unexpected character",
                    other.to_string(),
                    start,
                ));
            }
        };
        tokens.push(Spanned {
            token,
            position: start,
        });
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_tokenize_statement_shapes() {
        assert_eq!(
            kinds("STATE AT '10000'"),
            vec![
                Token::Ident("STATE".into()),
                Token::Ident("AT".into()),
                Token::Str("10000".into()),
            ]
        );

        assert_eq!(
            kinds("data.status >= 500"),
            vec![
                Token::Ident("data.status".into()),
                Token::Ge,
                Token::Int(500),
            ]
        );
    }

    #[test]
    fn test_tokenize_operators() {
        assert_eq!(
            kinds("= == != < <= > >= ,"),
            vec![
                Token::Eq,
                Token::EqEq,
                Token::Ne,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::Comma,
            ]
        );
    }

    #[test]
    fn test_tokenize_numbers() {
        assert_eq!(kinds("42 -7 3.5"), vec![Token::Int(42), Token::Int(-7), Token::Float(3.5)]);
    }

    #[test]
    fn test_identifier_shapes() {
        assert_eq!(
            kinds("eventType http:request span-7"),
            vec![
                Token::Ident("eventType".into()),
                Token::Ident("http:request".into()),
                Token::Ident("span-7".into()),
            ]
        );
    }

    #[test]
    fn test_unterminated_string_errors_with_position() {
        let err = tokenize("STATE AT 'oops").unwrap_err();
        match err {
            EngineError::Parse { position, .. } => assert_eq!(position, 9),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_character() {
        assert!(matches!(
            tokenize("TIMELINE ; now"),
            Err(EngineError::Parse { .. })
        ));
    }
}
