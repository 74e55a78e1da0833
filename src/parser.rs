//! Parser for shape descriptions
//!
//! Recognises a two-operand contraction annotation such as `[4, 3] @ [3, 5]`
//! and nothing more. Shape agreement is checked later, during lowering.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexer, Token};

/// Operand extents of a `[M, K1] @ [K2, N]` description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDescription {
    pub lhs: (usize, usize),
    pub rhs: (usize, usize),
}

/// Parser for shape descriptions
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<(Result<Token, usize>, usize)>,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next();
        Self { lexer, current }
    }

    /// Advance to the next token, returning the current one
    fn advance(&mut self) -> CompileResult<Option<(Token, usize)>> {
        let prev = std::mem::replace(&mut self.current, self.lexer.next());
        match prev {
            None => Ok(None),
            Some((Ok(tok), offset)) => Ok(Some((tok, offset))),
            Some((Err(offset), _)) => Err(CompileError::parse_error(format!(
                "unexpected character at offset {}",
                offset
            ))),
        }
    }

    /// Consume the next token if it is `expected`, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<()> {
        match self.advance()? {
            Some((tok, _)) if tok == expected => Ok(()),
            Some((tok, offset)) => Err(CompileError::parse_error(format!(
                "expected `{}` at offset {}, got `{}`",
                expected, offset, tok
            ))),
            None => Err(CompileError::parse_error(format!(
                "expected `{}`, got end of input",
                expected
            ))),
        }
    }

    /// Parse a complete description
    pub fn parse_description(&mut self) -> CompileResult<ShapeDescription> {
        let lhs = self.parse_shape()?;

        match self.advance()? {
            Some((Token::MatMul, _)) => {}
            Some((tok @ (Token::Plus | Token::Star), _)) => {
                return Err(CompileError::unsupported_op(format!(
                    "element-wise `{}` has no loop-nest lowering",
                    tok
                )));
            }
            Some((tok, offset)) => {
                return Err(CompileError::parse_error(format!(
                    "expected `@` at offset {}, got `{}`",
                    offset, tok
                )));
            }
            None => return Err(CompileError::parse_error("expected `@`, got end of input")),
        }

        let rhs = self.parse_shape()?;

        if let Some((tok, offset)) = self.advance()? {
            return Err(CompileError::parse_error(format!(
                "trailing `{}` at offset {}",
                tok, offset
            )));
        }

        Ok(ShapeDescription { lhs, rhs })
    }

    /// Parse `[rows, cols]`
    fn parse_shape(&mut self) -> CompileResult<(usize, usize)> {
        self.expect(Token::LBracket)?;
        let rows = self.parse_extent()?;
        self.expect(Token::Comma)?;
        let cols = self.parse_extent()?;
        self.expect(Token::RBracket)?;
        Ok((rows, cols))
    }

    fn parse_extent(&mut self) -> CompileResult<usize> {
        match self.advance()? {
            Some((Token::Extent(0), offset)) => Err(CompileError::parse_error(format!(
                "extent at offset {} must be positive",
                offset
            ))),
            Some((Token::Extent(n), _)) => Ok(n),
            Some((tok, offset)) => Err(CompileError::parse_error(format!(
                "expected an extent at offset {}, got `{}`",
                offset, tok
            ))),
            None => Err(CompileError::parse_error("expected an extent, got end of input")),
        }
    }
}

/// Parse a description string in one call
pub fn parse(source: &str) -> CompileResult<ShapeDescription> {
    Parser::new(source.trim()).parse_description()
}
