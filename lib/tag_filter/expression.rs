use thiserror::Error;

/// Nesting limit for parentheses and negations.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unknown word '{word}' at offset {offset}")]
    UnknownWord { word: String, offset: usize },
    #[error("unexpected {found} at offset {offset}")]
    UnexpectedToken { found: &'static str, offset: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expression nests deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(bool),
    Not,
    And,
    Or,
    Open,
    Close,
}

impl Token {
    fn describe(self) -> &'static str {
        match self {
            Token::Literal(true) => "'true'",
            Token::Literal(false) => "'false'",
            Token::Not => "'!'",
            Token::And => "'&&'",
            Token::Or => "'||'",
            Token::Open => "'('",
            Token::Close => "')'",
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '!' => Token::Not,
            '(' => Token::Open,
            ')' => Token::Close,
            '&' | '|' => {
                if chars.next_if(|(_, next)| *next == ch).is_none() {
                    return Err(ExpressionError::UnexpectedChar { found: ch, offset });
                }
                if ch == '&' {
                    Token::And
                } else {
                    Token::Or
                }
            }
            c if c.is_ascii_alphanumeric() => {
                let mut word = String::from(c);
                while let Some((_, next)) = chars.next_if(|(_, next)| next.is_ascii_alphanumeric())
                {
                    word.push(next);
                }
                match word.as_str() {
                    "true" | "1" => Token::Literal(true),
                    "false" | "0" => Token::Literal(false),
                    _ => return Err(ExpressionError::UnknownWord { word, offset }),
                }
            }
            found => return Err(ExpressionError::UnexpectedChar { found, offset }),
        };
        tokens.push((token, offset));
    }

    Ok(tokens)
}

/// Recursive-descent evaluator; precedence is `!` over `&&` over `||`.
struct Parser {
    tokens: Vec<(Token, usize)>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).map(|(token, _)| *token)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let next = self.tokens.get(self.position).copied();
        if next.is_some() {
            self.position += 1;
        }
        next
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep);
        }
        Ok(())
    }

    fn or_expr(&mut self) -> Result<bool, ExpressionError> {
        let mut value = self.and_expr()?;
        while self.peek() == Some(Token::Or) {
            self.position += 1;
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<bool, ExpressionError> {
        let mut value = self.unary()?;
        while self.peek() == Some(Token::And) {
            self.position += 1;
            let rhs = self.unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<bool, ExpressionError> {
        match self.advance() {
            Some((Token::Not, _)) => {
                self.descend()?;
                let value = self.unary()?;
                self.depth -= 1;
                Ok(!value)
            }
            Some((Token::Literal(value), _)) => Ok(value),
            Some((Token::Open, _)) => {
                self.descend()?;
                let value = self.or_expr()?;
                self.depth -= 1;
                match self.advance() {
                    Some((Token::Close, _)) => Ok(value),
                    Some((token, offset)) => Err(ExpressionError::UnexpectedToken {
                        found: token.describe(),
                        offset,
                    }),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some((token, offset)) => Err(ExpressionError::UnexpectedToken {
                found: token.describe(),
                offset,
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

/// Evaluates a pure boolean expression over `true`/`false`/`1`/`0`, `!`, `&&`, `||` and
/// parentheses. Anything else is rejected.
pub fn evaluate(expression: &str) -> Result<bool, ExpressionError> {
    let mut parser = Parser {
        tokens: tokenize(expression)?,
        position: 0,
        depth: 0,
    };

    let value = parser.or_expr()?;
    match parser.advance() {
        None => Ok(value),
        Some((token, offset)) => Err(ExpressionError::UnexpectedToken {
            found: token.describe(),
            offset,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{evaluate, ExpressionError};

    #[test]
    fn literals_and_digits() {
        assert_eq!(evaluate("true"), Ok(true));
        assert_eq!(evaluate("false"), Ok(false));
        assert_eq!(evaluate("1"), Ok(true));
        assert_eq!(evaluate(" 0 "), Ok(false));
    }

    #[test]
    fn precedence_binds_not_then_and_then_or() {
        assert_eq!(evaluate("true || false && false"), Ok(true));
        assert_eq!(evaluate("(true || false) && false"), Ok(false));
        assert_eq!(evaluate("!false && false"), Ok(false));
        assert_eq!(evaluate("!(false && false)"), Ok(true));
        assert_eq!(evaluate("!!true"), Ok(true));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(evaluate(""), Err(ExpressionError::UnexpectedEnd));
        assert_eq!(evaluate("true &&"), Err(ExpressionError::UnexpectedEnd));
        assert_eq!(evaluate("(true"), Err(ExpressionError::UnexpectedEnd));
        assert!(matches!(
            evaluate("true & false"),
            Err(ExpressionError::UnexpectedChar { found: '&', .. })
        ));
        assert!(matches!(
            evaluate("true false"),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            evaluate("10"),
            Err(ExpressionError::UnknownWord { .. })
        ));
        assert!(matches!(
            evaluate("alert(1)"),
            Err(ExpressionError::UnknownWord { .. })
        ));
        assert!(matches!(
            evaluate("true; false"),
            Err(ExpressionError::UnexpectedChar { found: ';', .. })
        ));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let nested = format!("{}true{}", "(".repeat(500), ")".repeat(500));
        assert_eq!(evaluate(&nested), Err(ExpressionError::TooDeep));

        let negations = format!("{}true", "!".repeat(500));
        assert_eq!(evaluate(&negations), Err(ExpressionError::TooDeep));

        let shallow = format!("{}true{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(evaluate(&shallow), Ok(true));
    }
}
