//! Minimal protobuf text-format reader.
//!
//! Enough to read reproxy `LogRecord` files (`.rrpl`): nested messages,
//! repeated fields, quoted strings and bare scalars. Values are kept as
//! text; no schema is involved.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextProtoError {
    #[error("line {line}: unexpected '{found}'")]
    UnexpectedToken { line: usize, found: String },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },
}

/// A field value: a scalar (string contents or bare token) or a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextNode {
    Scalar(String),
    Message(TextMessage),
}

impl TextNode {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            Self::Message(_) => None,
        }
    }

    pub fn as_message(&self) -> Option<&TextMessage> {
        match self {
            Self::Message(m) => Some(m),
            Self::Scalar(_) => None,
        }
    }
}

/// Fields by name; every field may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMessage {
    pub fields: BTreeMap<String, Vec<TextNode>>,
}

impl TextMessage {
    pub fn all(&self, name: &str) -> &[TextNode] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&TextNode> {
        self.all(name).first()
    }

    pub fn message(&self, name: &str) -> Option<&TextMessage> {
        self.first(name).and_then(TextNode::as_message)
    }

    pub fn scalar(&self, name: &str) -> Option<&str> {
        self.first(name).and_then(TextNode::as_scalar)
    }

    /// Read a map field (repeated `{ key: .. value: .. }` entries) whose
    /// values are scalars.
    pub fn scalar_map(&self, name: &str) -> BTreeMap<String, String> {
        self.all(name)
            .iter()
            .filter_map(TextNode::as_message)
            .filter_map(|entry| {
                Some((
                    entry.scalar("key")?.to_string(),
                    entry.scalar("value")?.to_string(),
                ))
            })
            .collect()
    }

    fn push(&mut self, name: String, node: TextNode) {
        self.fields.entry(name).or_default().push(node);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Colon,
    Open(char),
    Close(char),
    Separator,
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, TextProtoError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ':' => {
                chars.next();
                tokens.push((line, Token::Colon));
            }
            ',' | ';' => {
                chars.next();
                tokens.push((line, Token::Separator));
            }
            '{' | '<' => {
                chars.next();
                tokens.push((line, Token::Open(c)));
            }
            '}' | '>' => {
                chars.next();
                tokens.push((line, Token::Close(c)));
            }
            '"' | '\'' => {
                let quote = c;
                let start_line = line;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(TextProtoError::UnterminatedString { line: start_line }),
                        Some('\n') => {
                            return Err(TextProtoError::UnterminatedString { line: start_line });
                        }
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => {
                                return Err(TextProtoError::UnterminatedString { line: start_line });
                            }
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                    }
                }
                // adjacent string literals concatenate
                if let Some((_, Token::Str(prev))) = tokens.last_mut() {
                    prev.push_str(&s);
                } else {
                    tokens.push((start_line, Token::Str(s)));
                }
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, ':' | '{' | '}' | '<' | '>' | ',' | ';' | '#' | '"' | '\'') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((line, Token::Ident(word)));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn unexpected(line: usize, tok: &Token) -> TextProtoError {
        let found = match tok {
            Token::Ident(s) | Token::Str(s) => s.clone(),
            Token::Colon => ":".into(),
            Token::Open(c) | Token::Close(c) => c.to_string(),
            Token::Separator => ",".into(),
        };
        TextProtoError::UnexpectedToken { line, found }
    }

    fn message(&mut self, close: Option<char>) -> Result<TextMessage, TextProtoError> {
        let mut msg = TextMessage::default();
        loop {
            let Some((line, tok)) = self.next() else {
                return match close {
                    None => Ok(msg),
                    Some(_) => Err(TextProtoError::UnexpectedEof),
                };
            };
            let name = match tok {
                Token::Close(c) if Some(c) == close => return Ok(msg),
                Token::Separator => continue,
                Token::Ident(name) => name,
                other => return Err(Self::unexpected(line, &other)),
            };

            if self.peek() == Some(&Token::Colon) {
                self.pos += 1;
            }
            let (line, tok) = self.next().ok_or(TextProtoError::UnexpectedEof)?;
            let node = match tok {
                Token::Open(open) => {
                    let close = if open == '{' { '}' } else { '>' };
                    TextNode::Message(self.message(Some(close))?)
                }
                Token::Ident(s) | Token::Str(s) => TextNode::Scalar(s),
                other => return Err(Self::unexpected(line, &other)),
            };
            msg.push(name, node);
        }
    }
}

/// Parse text-format content into its top-level message.
pub fn parse(text: &str) -> Result<TextMessage, TextProtoError> {
    let tokens = tokenize(text)?;
    Parser { tokens, pos: 0 }.message(None)
}
