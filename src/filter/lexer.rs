//! Tokenizer for filter expressions.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;

use crate::error::FilterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Number(u32),
    Mac(MacAddr6),
    Ipv4(Ipv4Addr),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Amp,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Number(n) => n.to_string(),
            Token::Mac(m) => m.to_string(),
            Token::Ipv4(ip) => ip.to_string(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::Colon => ":".into(),
            Token::Amp => "&".into(),
            Token::And => "and".into(),
            Token::Or => "or".into(),
            Token::Not => "not".into(),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
        }
    }
}

/// A token and the byte offset it started at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, FilterError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let two = bytes.get(i + 1).copied();
        let (token, width) = match (c, two) {
            (b'(', _) => (Token::LParen, 1),
            (b')', _) => (Token::RParen, 1),
            (b'[', _) => {
                depth += 1;
                (Token::LBracket, 1)
            }
            (b']', _) => {
                depth = depth.saturating_sub(1);
                (Token::RBracket, 1)
            }
            (b':', _) if depth > 0 => (Token::Colon, 1),
            (b'&', Some(b'&')) => (Token::And, 2),
            (b'&', _) => (Token::Amp, 1),
            (b'|', Some(b'|')) => (Token::Or, 2),
            (b'=', Some(b'=')) => (Token::Eq, 2),
            (b'=', _) => (Token::Eq, 1),
            (b'!', Some(b'=')) => (Token::Ne, 2),
            (b'!', _) => (Token::Not, 1),
            (b'<', Some(b'=')) => (Token::Le, 2),
            (b'<', _) => (Token::Lt, 1),
            (b'>', Some(b'=')) => (Token::Ge, 2),
            (b'>', _) => (Token::Gt, 1),
            _ if is_word_byte(c, depth) => {
                while i < bytes.len() && is_word_byte(bytes[i], depth) {
                    i += 1;
                }
                tokens.push(Spanned {
                    token: classify_word(&input[start..i])?,
                    position: start,
                });
                continue;
            }
            _ => {
                return Err(FilterError::UnexpectedToken {
                    token: input[start..].chars().next().unwrap_or('?').to_string(),
                    position: start,
                })
            }
        };

        tokens.push(Spanned {
            token,
            position: start,
        });
        i += width;
    }

    Ok(tokens)
}

// Outside brackets a colon belongs to a MAC address.
fn is_word_byte(c: u8, depth: usize) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || (c == b':' && depth == 0)
}

fn classify_word(word: &str) -> Result<Token, FilterError> {
    match word {
        "and" => return Ok(Token::And),
        "or" => return Ok(Token::Or),
        "not" => return Ok(Token::Not),
        _ => {}
    }

    if word.contains(':') {
        return parse_mac(word).map(Token::Mac);
    }

    let first = word.as_bytes()[0];
    if first.is_ascii_digit() {
        if word.bytes().filter(|b| *b == b'.').count() == 3 {
            return word
                .parse::<Ipv4Addr>()
                .map(Token::Ipv4)
                .map_err(|_| FilterError::InvalidAddress(word.to_string()));
        }
        return parse_number(word).map(Token::Number);
    }

    Ok(Token::Word(word.to_string()))
}

pub fn parse_number(word: &str) -> Result<u32, FilterError> {
    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => word.parse::<u32>(),
    };
    parsed.map_err(|_| FilterError::InvalidNumber(word.to_string()))
}

/// Accepts `aa:bb:cc:dd:ee:ff`; single-digit groups are allowed as in pcap.
fn parse_mac(word: &str) -> Result<MacAddr6, FilterError> {
    let invalid = || FilterError::InvalidAddress(word.to_string());
    let mut octets = [0u8; 6];
    let mut count = 0;
    for part in word.split(':') {
        if count == 6 || part.is_empty() || part.len() > 2 {
            return Err(invalid());
        }
        octets[count] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        count += 1;
    }
    if count != 6 {
        return Err(invalid());
    }
    Ok(MacAddr6::from(octets))
}
