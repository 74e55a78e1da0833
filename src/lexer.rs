//! Lexer for shape descriptions using logos
//!
//! Supports tokens like:
//! - Extents: 4, 1024
//! - Operators: @, +, *
//! - Punctuation: [, ], ,

use logos::Logos;

/// Token types for the shape description language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<usize>().ok())]
    Extent(usize),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("@")]
    MatMul,

    #[token("+")]
    Plus,

    #[token("*")]
    Star,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token(",")]
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Extent(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::MatMul => write!(f, "@"),
            Token::Plus => write!(f, "+"),
            Token::Star => write!(f, "*"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
        }
    }
}

/// Lexer wrapper that yields tokens together with their byte offset
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
        }
    }
}

impl<'source> Iterator for Lexer<'source> {
    /// `Err(offset)` marks an unrecognised character
    type Item = (Result<Token, usize>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let tok = self.inner.next()?;
        let offset = self.inner.span().start;
        Some((tok.map_err(|_| offset), offset))
    }
}
