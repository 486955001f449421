//! Shell-style patterns matched case-insensitively against whole addresses.
//!
//! `*` matches any run of characters, `?` any single character, `[...]` a
//! character class (`[^...]` or `[!...]` negated, `a-z` ranges) and `\`
//! escapes the next character.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PatternError {
    #[error("unterminated character class")]
    UnclosedClass,
    #[error("empty character class")]
    EmptyClass,
    #[error("dangling escape at end of pattern")]
    TrailingEscape,
    #[error("invalid range {0}-{1}")]
    BadRange(char, char),
}

#[derive(Debug)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

impl Token {
    fn matches(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => true,
            Token::AnyRun => false,
            Token::Class { negated, ranges } => {
                ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
            }
        }
    }
}

#[derive(Debug)]
pub struct Pattern {
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let chars: Vec<char> = pattern.to_lowercase().chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let token = match chars[i] {
                '*' => {
                    i += 1;
                    if matches!(tokens.last(), Some(Token::AnyRun)) {
                        continue;
                    }
                    Token::AnyRun
                }
                '?' => {
                    i += 1;
                    Token::AnyChar
                }
                '\\' => {
                    let c = *chars.get(i + 1).ok_or(PatternError::TrailingEscape)?;
                    i += 2;
                    Token::Literal(c)
                }
                '[' => {
                    let (token, next) = parse_class(&chars, i + 1)?;
                    i = next;
                    token
                }
                c => {
                    i += 1;
                    Token::Literal(c)
                }
            };
            tokens.push(token);
        }

        Ok(Pattern { tokens })
    }

    pub fn matches(&self, input: &str) -> bool {
        let text: Vec<char> = input.to_lowercase().chars().collect();
        let (mut p, mut t) = (0, 0);
        // Last `*` seen and the text position it is currently absorbing up to.
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.tokens.get(p) {
                Some(Token::AnyRun) => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                Some(token) if token.matches(text[t]) => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }

            match star {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    star = Some((star_p, star_t + 1));
                }
                None => return false,
            }
        }

        self.tokens[p..].iter().all(|t| matches!(t, Token::AnyRun))
    }
}

/// Parses a class body starting just after `[`. Returns the token and the
/// index following the closing `]`.
fn parse_class(chars: &[char], mut i: usize) -> Result<(Token, usize), PatternError> {
    let negated = matches!(chars.get(i), Some('^') | Some('!'));
    if negated {
        i += 1;
    }

    let mut ranges = Vec::new();
    loop {
        let lo = match chars.get(i) {
            None => return Err(PatternError::UnclosedClass),
            Some(']') => break,
            Some('\\') => {
                i += 1;
                *chars.get(i).ok_or(PatternError::UnclosedClass)?
            }
            Some(c) => *c,
        };
        i += 1;

        let hi = if chars.get(i) == Some(&'-') && !matches!(chars.get(i + 1), Some(']') | None) {
            let hi = match chars[i + 1] {
                '\\' => *chars.get(i + 2).ok_or(PatternError::UnclosedClass)?,
                c => c,
            };
            i += if chars[i + 1] == '\\' { 3 } else { 2 };
            if hi < lo {
                return Err(PatternError::BadRange(lo, hi));
            }
            hi
        } else {
            lo
        };
        ranges.push((lo, hi));
    }

    if ranges.is_empty() {
        return Err(PatternError::EmptyClass);
    }
    Ok((Token::Class { negated, ranges }, i + 1))
}
