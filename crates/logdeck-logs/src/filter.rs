use thiserror::Error;

use logdeck_types::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unexpected '{token}' at position {position}")]
    Unexpected { token: char, position: usize },

    #[error("expression ends after an operator")]
    DanglingOperator,

    #[error("unclosed '(' at position {0}")]
    UnclosedParen(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Term(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Term(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, haystack: &str) -> bool {
        match self {
            Self::Term(needle) => haystack.contains(needle.as_str()),
            Self::Not(inner) => !inner.eval(haystack),
            Self::And(a, b) => a.eval(haystack) && b.eval(haystack),
            Self::Or(a, b) => a.eval(haystack) || b.eval(haystack),
        }
    }
}

/// Boolean message filter: `error & !(timeout | retry)`.
///
/// `!` binds tighter than `&`, which binds tighter than `|`. Terms match
/// as case-insensitive substrings of the message.
#[derive(Clone)]
pub struct MessageFilter {
    /// Parsed expression, `None` matches everything
    expr: Option<Expr>,

    /// Original pattern string
    pattern: String,
}

impl MessageFilter {
    pub fn parse(pattern: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(pattern);
        let expr = if tokens.is_empty() {
            None
        } else {
            let mut parser = Parser { tokens, pos: 0 };
            let expr = parser.or_expr()?;
            if let Some((token, position)) = parser.tokens.get(parser.pos) {
                return Err(FilterError::Unexpected {
                    token: token_char(token),
                    position: *position,
                });
            }
            Some(expr)
        };

        Ok(Self {
            expr,
            pattern: pattern.to_string(),
        })
    }

    /// Filter that lets everything through
    pub fn all() -> Self {
        Self {
            expr: None,
            pattern: String::new(),
        }
    }

    /// Check if a log entry matches this filter
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.matches_text(&entry.message)
    }

    pub fn matches_text(&self, text: &str) -> bool {
        match &self.expr {
            Some(expr) => expr.eval(&text.to_lowercase()),
            None => true,
        }
    }

    /// Get the original pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }
}

impl std::fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFilter")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Tokens paired with their character offset
fn tokenize(pattern: &str) -> Vec<(Token, usize)> {
    let mut tokens = Vec::new();
    let mut term = String::new();
    let mut term_start = 0;

    let flush = |term: &mut String, start: usize, tokens: &mut Vec<(Token, usize)>| {
        let trimmed = term.trim();
        if !trimmed.is_empty() {
            tokens.push((Token::Term(trimmed.to_lowercase()), start));
        }
        term.clear();
    };

    for (position, c) in pattern.chars().enumerate() {
        let operator = match c {
            '&' => Some(Token::And),
            '|' => Some(Token::Or),
            '!' => Some(Token::Not),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            _ => None,
        };

        match operator {
            Some(token) => {
                flush(&mut term, term_start, &mut tokens);
                tokens.push((token, position));
            }
            None => {
                if term.is_empty() {
                    term_start = position;
                }
                term.push(c);
            }
        }
    }
    flush(&mut term, term_start, &mut tokens);

    tokens
}

fn token_char(token: &Token) -> char {
    match token {
        Token::Term(term) => term.chars().next().unwrap_or(' '),
        Token::And => '&',
        Token::Or => '|',
        Token::Not => '!',
        Token::LParen => '(',
        Token::RParen => ')',
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        match self.advance() {
            Some((Token::Not, _)) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some((Token::Term(term), _)) => Ok(Expr::Term(term)),
            Some((Token::LParen, open)) => {
                let inner = self.or_expr()?;
                match self.advance() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((token, position)) => Err(FilterError::Unexpected {
                        token: token_char(&token),
                        position,
                    }),
                    None => Err(FilterError::UnclosedParen(open)),
                }
            }
            Some((token, position)) => Err(FilterError::Unexpected {
                token: token_char(&token),
                position,
            }),
            None => Err(FilterError::DanglingOperator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, text: &str) -> bool {
        MessageFilter::parse(pattern).unwrap().matches_text(text)
    }

    #[test]
    fn test_term_is_case_insensitive_substring() {
        assert!(matches("Error", "an ERROR occurred"));
        assert!(!matches("error", "everything is fine"));
        assert!(matches("disk full", "warn: Disk Full on /var"));
    }

    #[test]
    fn test_precedence() {
        // a | b & c == a | (b & c)
        assert!(matches("alpha | beta & gamma", "alpha"));
        assert!(!matches("alpha | beta & gamma", "beta"));
        assert!(matches("alpha | beta & gamma", "beta gamma"));

        // !a & b == (!a) & b
        assert!(matches("!alpha & beta", "beta"));
        assert!(!matches("!alpha & beta", "alpha beta"));
    }

    #[test]
    fn test_parentheses() {
        let filter = MessageFilter::parse("error & !(timeout | retry)").unwrap();
        assert!(filter.matches_text("error: disk"));
        assert!(!filter.matches_text("error: timeout"));
        assert!(!filter.matches_text("error after retry"));
        assert!(!filter.matches_text("all good"));
    }

    #[test]
    fn test_empty_matches_everything() {
        let filter = MessageFilter::parse("   ").unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&LogEntry::new("t", "anything")));
        assert!(MessageFilter::all().matches_text(""));
    }

    #[test]
    fn test_errors() {
        assert_eq!(MessageFilter::parse("a &").unwrap_err(), FilterError::DanglingOperator);
        assert_eq!(MessageFilter::parse("(a | b").unwrap_err(), FilterError::UnclosedParen(0));
        assert_eq!(
            MessageFilter::parse("a ) b").unwrap_err(),
            FilterError::Unexpected { token: ')', position: 2 }
        );
        assert!(matches!(
            MessageFilter::parse("& a"),
            Err(FilterError::Unexpected { token: '&', .. })
        ));
    }

    #[test]
    fn test_matches_entry_message() {
        let filter = MessageFilter::parse("boom").unwrap();
        assert!(filter.matches(&LogEntry::new("tcp:1.2.3.4:5", "Boom!")));
        assert!(!filter.matches(&LogEntry::new("boom-source", "quiet")));
    }
}
