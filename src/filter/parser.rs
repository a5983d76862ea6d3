//! Recursive-descent parser that lowers filter expressions into header tests.
//!
//! Every primitive is rewritten into a boolean combination of [`Test`]s, each
//! of which is a single load, optional mask and comparison. Code generation
//! then only has to deal with `and`, `or`, `not` and tests.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;

use super::bpf::BPF_MAXINSNS;
use super::lexer::{tokenize, Spanned, Token};
use crate::error::FilterError;

/// Every primitive compiles to at least a load and a branch.
const MAX_TERMS: usize = BPF_MAXINSNS / 2;
/// Parentheses and `not` nest at most this deep.
const MAX_DEPTH: usize = 256;

const ETH_HEADER_LEN: u32 = 14;
const OFF_ETH_DST: u32 = 0;
const OFF_ETH_SRC: u32 = 6;
const OFF_ETHERTYPE: u32 = 12;
const OFF_VLAN_TCI: u32 = 14;
const OFF_IPV4_FRAG: u32 = ETH_HEADER_LEN + 6;
const OFF_IPV4_PROTO: u32 = ETH_HEADER_LEN + 9;
const OFF_IPV4_SRC: u32 = ETH_HEADER_LEN + 12;
const OFF_IPV4_DST: u32 = ETH_HEADER_LEN + 16;
const OFF_IPV6_NEXT: u32 = ETH_HEADER_LEN + 6;
const OFF_IPV6_PAYLOAD: u32 = ETH_HEADER_LEN + 40;

const ETHERTYPE_IPV4: u32 = 0x0800;
const ETHERTYPE_ARP: u32 = 0x0806;
const ETHERTYPE_RARP: u32 = 0x8035;
const ETHERTYPE_VLAN: u32 = 0x8100;
const ETHERTYPE_QINQ: u32 = 0x88a8;
const ETHERTYPE_IPV6: u32 = 0x86dd;

const IPPROTO_ICMP: u32 = 1;
const IPPROTO_TCP: u32 = 6;
const IPPROTO_UDP: u32 = 17;
const IPPROTO_ICMPV6: u32 = 58;

/// Where a test reads its operand from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    /// `size` bytes at an absolute frame offset.
    Abs { offset: u32, size: u32 },
    /// `size` bytes at an offset past the (variable length) IPv4 header.
    IpPayload { offset: u32, size: u32 },
    /// The frame length.
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Gt,
    Ge,
    /// True when `operand & value != 0`.
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Test {
    pub load: Load,
    pub mask: Option<u32>,
    pub cond: Cond,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Test(Test),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, Copy)]
enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn and(a: Expr, b: Expr) -> Expr {
    Expr::And(Box::new(a), Box::new(b))
}

fn or(a: Expr, b: Expr) -> Expr {
    Expr::Or(Box::new(a), Box::new(b))
}

fn not(e: Expr) -> Expr {
    Expr::Not(Box::new(e))
}

fn and_all(first: Expr, rest: impl IntoIterator<Item = Expr>) -> Expr {
    rest.into_iter().fold(first, and)
}

fn test(load: Load, cond: Cond, value: u32) -> Expr {
    Expr::Test(Test {
        load,
        mask: None,
        cond,
        value,
    })
}

fn abs(offset: u32, size: u32) -> Load {
    Load::Abs { offset, size }
}

fn eq_at(offset: u32, size: u32, value: u32) -> Expr {
    test(abs(offset, size), Cond::Eq, value)
}

fn ethertype(value: u32) -> Expr {
    eq_at(OFF_ETHERTYPE, 2, value)
}

fn ipv4_proto(proto: u32) -> Expr {
    and(ethertype(ETHERTYPE_IPV4), eq_at(OFF_IPV4_PROTO, 1, proto))
}

fn ipv6_next(proto: u32) -> Expr {
    and(ethertype(ETHERTYPE_IPV6), eq_at(OFF_IPV6_NEXT, 1, proto))
}

fn transport(proto: u32) -> Expr {
    if proto == IPPROTO_ICMP {
        return ipv4_proto(proto);
    }
    or(ipv4_proto(proto), ipv6_next(proto))
}

fn directional(dir: Dir, src: Expr, dst: Expr) -> Expr {
    match dir {
        Dir::Src => src,
        Dir::Dst => dst,
        Dir::Either => or(src, dst),
    }
}

fn mac_at(offset: u32, mac: MacAddr6) -> Expr {
    let b = mac.into_array();
    and(
        eq_at(offset + 2, 4, u32::from_be_bytes([b[2], b[3], b[4], b[5]])),
        eq_at(offset, 2, u32::from(u16::from_be_bytes([b[0], b[1]]))),
    )
}

fn ether_host(dir: Dir, mac: MacAddr6) -> Expr {
    directional(dir, mac_at(OFF_ETH_SRC, mac), mac_at(OFF_ETH_DST, mac))
}

fn ip_host(dir: Dir, ip: Ipv4Addr) -> Expr {
    let value = u32::from(ip);
    and(
        ethertype(ETHERTYPE_IPV4),
        directional(
            dir,
            eq_at(OFF_IPV4_SRC, 4, value),
            eq_at(OFF_IPV4_DST, 4, value),
        ),
    )
}

fn port(dir: Dir, port: u32) -> Expr {
    let tcp_or_udp_v4 = or(
        eq_at(OFF_IPV4_PROTO, 1, IPPROTO_TCP),
        eq_at(OFF_IPV4_PROTO, 1, IPPROTO_UDP),
    );
    let not_fragment = not(test(abs(OFF_IPV4_FRAG, 2), Cond::Set, 0x1fff));
    let v4_ports = directional(
        dir,
        test(Load::IpPayload { offset: 0, size: 2 }, Cond::Eq, port),
        test(Load::IpPayload { offset: 2, size: 2 }, Cond::Eq, port),
    );
    let v4 = and_all(
        ethertype(ETHERTYPE_IPV4),
        [tcp_or_udp_v4, not_fragment, v4_ports],
    );

    let tcp_or_udp_v6 = or(
        eq_at(OFF_IPV6_NEXT, 1, IPPROTO_TCP),
        eq_at(OFF_IPV6_NEXT, 1, IPPROTO_UDP),
    );
    let v6_ports = directional(
        dir,
        eq_at(OFF_IPV6_PAYLOAD, 2, port),
        eq_at(OFF_IPV6_PAYLOAD + 2, 2, port),
    );
    let v6 = and_all(ethertype(ETHERTYPE_IPV6), [tcp_or_udp_v6, v6_ports]);

    or(v4, v6)
}

fn vlan(id: Option<u32>) -> Expr {
    let tagged = or(ethertype(ETHERTYPE_VLAN), ethertype(ETHERTYPE_QINQ));
    match id {
        Some(id) => and(
            tagged,
            Expr::Test(Test {
                load: abs(OFF_VLAN_TCI, 2),
                mask: Some(0x0fff),
                cond: Cond::Eq,
                value: id,
            }),
        ),
        None => tagged,
    }
}

fn relation(load: Load, mask: Option<u32>, op: RelOp, value: u32) -> Expr {
    let t = |cond| Expr::Test(Test {
        load,
        mask,
        cond,
        value,
    });
    match op {
        RelOp::Eq => t(Cond::Eq),
        RelOp::Ne => not(t(Cond::Eq)),
        RelOp::Gt => t(Cond::Gt),
        RelOp::Ge => t(Cond::Ge),
        RelOp::Lt => not(t(Cond::Ge)),
        RelOp::Le => not(t(Cond::Gt)),
    }
}

/// Parse a filter expression. `Ok(None)` means the expression was empty.
pub fn parse(input: &str) -> Result<Option<Expr>, FilterError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        terms: 0,
    };
    let expr = parser.or_expr()?;
    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(unexpected(extra));
    }
    Ok(Some(expr))
}

fn unexpected(spanned: &Spanned) -> FilterError {
    FilterError::UnexpectedToken {
        token: spanned.token.describe(),
        position: spanned.position,
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    terms: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_word(&self) -> Option<&str> {
        match self.peek() {
            Some(Token::Word(w)) => Some(w.as_str()),
            _ => None,
        }
    }

    fn next(&mut self) -> Result<&Spanned, FilterError> {
        let spanned = self.tokens.get(self.pos).ok_or(FilterError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(spanned)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.peek_word() == Some(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), FilterError> {
        let spanned = self.next()?;
        if &spanned.token == token {
            Ok(())
        } else {
            Err(unexpected(spanned))
        }
    }

    fn number(&mut self) -> Result<u32, FilterError> {
        let spanned = self.next()?;
        match spanned.token {
            Token::Number(n) => Ok(n),
            _ => Err(unexpected(spanned)),
        }
    }

    fn mac(&mut self) -> Result<MacAddr6, FilterError> {
        let spanned = self.next()?;
        match spanned.token {
            Token::Mac(m) => Ok(m),
            _ => Err(unexpected(spanned)),
        }
    }

    fn ipv4(&mut self) -> Result<Ipv4Addr, FilterError> {
        let spanned = self.next()?;
        match spanned.token {
            Token::Ipv4(ip) => Ok(ip),
            _ => Err(unexpected(spanned)),
        }
    }

    fn relop(&mut self) -> Result<RelOp, FilterError> {
        let spanned = self.next()?;
        Ok(match spanned.token {
            Token::Eq => RelOp::Eq,
            Token::Ne => RelOp::Ne,
            Token::Lt => RelOp::Lt,
            Token::Le => RelOp::Le,
            Token::Gt => RelOp::Gt,
            Token::Ge => RelOp::Ge,
            _ => return Err(unexpected(spanned)),
        })
    }

    fn or_expr(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = or(lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.unary()?;
        while self.eat(&Token::And) {
            let rhs = self.unary()?;
            lhs = and(lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        if self.eat(&Token::Not) {
            return self.nested(|p| Ok(not(p.unary()?)));
        }
        if self.eat(&Token::LParen) {
            return self.nested(|p| {
                let inner = p.or_expr()?;
                p.expect(&Token::RParen)?;
                Ok(inner)
            });
        }
        self.primitive()
    }

    fn nested(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<Expr, FilterError>,
    ) -> Result<Expr, FilterError> {
        if self.depth >= MAX_DEPTH {
            return Err(FilterError::TooComplex);
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn primitive(&mut self) -> Result<Expr, FilterError> {
        self.terms += 1;
        if self.terms > MAX_TERMS {
            return Err(FilterError::TooComplex);
        }
        let spanned = self.next()?.clone();
        let word = match &spanned.token {
            Token::Word(w) => w.as_str(),
            _ => return Err(unexpected(&spanned)),
        };

        match word {
            "ether" => self.ether(),
            "ip" => {
                if self.eat(&Token::LBracket) {
                    let rel = self.accessor(ETH_HEADER_LEN)?;
                    Ok(and(ethertype(ETHERTYPE_IPV4), rel))
                } else if self.eat_word("proto") {
                    Ok(ipv4_proto(self.ip_proto_value()?))
                } else {
                    Ok(ethertype(ETHERTYPE_IPV4))
                }
            }
            "ip6" => {
                if self.eat_word("proto") {
                    Ok(ipv6_next(self.ip_proto_value()?))
                } else {
                    Ok(ethertype(ETHERTYPE_IPV6))
                }
            }
            "arp" => Ok(ethertype(ETHERTYPE_ARP)),
            "rarp" => Ok(ethertype(ETHERTYPE_RARP)),
            "vlan" => {
                let id = match self.peek() {
                    Some(Token::Number(n)) => {
                        let n = *n;
                        self.pos += 1;
                        Some(n)
                    }
                    _ => None,
                };
                Ok(vlan(id))
            }
            "tcp" => Ok(transport(IPPROTO_TCP)),
            "udp" => Ok(transport(IPPROTO_UDP)),
            "icmp" => Ok(transport(IPPROTO_ICMP)),
            "broadcast" => Ok(mac_at(OFF_ETH_DST, MacAddr6::broadcast())),
            "multicast" => Ok(test(abs(OFF_ETH_DST, 1), Cond::Set, 0x01)),
            "host" => Ok(ip_host(Dir::Either, self.ipv4()?)),
            "port" => Ok(port(Dir::Either, self.number()?)),
            "src" => self.directed(Dir::Src),
            "dst" => self.directed(Dir::Dst),
            "len" => {
                let op = self.relop()?;
                Ok(relation(Load::Len, None, op, self.number()?))
            }
            "greater" => Ok(relation(Load::Len, None, RelOp::Ge, self.number()?)),
            "less" => Ok(relation(Load::Len, None, RelOp::Le, self.number()?)),
            _ => Err(unexpected(&spanned)),
        }
    }

    fn ether(&mut self) -> Result<Expr, FilterError> {
        if self.eat(&Token::LBracket) {
            return self.accessor(0);
        }
        let spanned = self.next()?.clone();
        match &spanned.token {
            Token::Word(w) => match w.as_str() {
                "src" => Ok(ether_host(Dir::Src, self.mac()?)),
                "dst" => Ok(ether_host(Dir::Dst, self.mac()?)),
                "host" => Ok(ether_host(Dir::Either, self.mac()?)),
                "broadcast" => Ok(mac_at(OFF_ETH_DST, MacAddr6::broadcast())),
                "multicast" => Ok(test(abs(OFF_ETH_DST, 1), Cond::Set, 0x01)),
                "proto" => self.ether_proto(),
                _ => Err(unexpected(&spanned)),
            },
            _ => Err(unexpected(&spanned)),
        }
    }

    fn ether_proto(&mut self) -> Result<Expr, FilterError> {
        let spanned = self.next()?.clone();
        let value = match &spanned.token {
            Token::Number(n) => *n,
            Token::Word(w) => match w.as_str() {
                "ip" => ETHERTYPE_IPV4,
                "ip6" => ETHERTYPE_IPV6,
                "arp" => ETHERTYPE_ARP,
                "rarp" => ETHERTYPE_RARP,
                "vlan" => ETHERTYPE_VLAN,
                _ => return Err(unexpected(&spanned)),
            },
            _ => return Err(unexpected(&spanned)),
        };
        Ok(ethertype(value))
    }

    fn ip_proto_value(&mut self) -> Result<u32, FilterError> {
        let spanned = self.next()?.clone();
        match &spanned.token {
            Token::Number(n) => Ok(*n),
            Token::Word(w) => match w.as_str() {
                "tcp" => Ok(IPPROTO_TCP),
                "udp" => Ok(IPPROTO_UDP),
                "icmp" => Ok(IPPROTO_ICMP),
                "icmp6" => Ok(IPPROTO_ICMPV6),
                _ => Err(unexpected(&spanned)),
            },
            _ => Err(unexpected(&spanned)),
        }
    }

    fn directed(&mut self, dir: Dir) -> Result<Expr, FilterError> {
        if self.eat_word("port") {
            return Ok(port(dir, self.number()?));
        }
        self.eat_word("host");
        Ok(ip_host(dir, self.ipv4()?))
    }

    /// `[OFF(:SIZE)?] (& MASK)? RELOP VALUE`, the opening bracket already consumed.
    fn accessor(&mut self, base: u32) -> Result<Expr, FilterError> {
        let offset = self.number()?;
        let size = if self.eat(&Token::Colon) {
            self.number()?
        } else {
            1
        };
        if !matches!(size, 1 | 2 | 4) {
            return Err(FilterError::InvalidSize(size));
        }
        self.expect(&Token::RBracket)?;

        let mask = if self.eat(&Token::Amp) {
            Some(self.number()?)
        } else {
            None
        };
        let op = self.relop()?;
        let value = self.number()?;
        let offset = base
            .checked_add(offset)
            .ok_or_else(|| FilterError::InvalidNumber(offset.to_string()))?;
        Ok(relation(abs(offset, size), mask, op, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_ether_accessor() {
        let expr = parse("ether[0:2] == 0xaaaa").unwrap().unwrap();
        assert_eq!(expr, eq_at(0, 2, 0xaaaa));
    }

    #[test]
    fn test_accessor_default_size_and_mask() {
        let expr = parse("ether[0] & 1 != 0").unwrap().unwrap();
        assert_eq!(
            expr,
            not(Expr::Test(Test {
                load: abs(0, 1),
                mask: Some(1),
                cond: Cond::Eq,
                value: 0,
            }))
        );
    }

    #[test]
    fn test_precedence() {
        // and binds tighter than or
        let expr = parse("arp or ip and tcp").unwrap().unwrap();
        match expr {
            Expr::Or(lhs, rhs) => {
                assert_eq!(*lhs, ethertype(ETHERTYPE_ARP));
                assert!(matches!(*rhs, Expr::And(_, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parentheses_and_not() {
        let expr = parse("not (arp or rarp)").unwrap().unwrap();
        assert_eq!(
            expr,
            not(or(ethertype(ETHERTYPE_ARP), ethertype(ETHERTYPE_RARP)))
        );
    }

    #[test]
    fn test_len_relations() {
        assert_eq!(
            parse("len <= 100").unwrap().unwrap(),
            not(test(Load::Len, Cond::Gt, 100))
        );
        assert_eq!(
            parse("greater 64").unwrap().unwrap(),
            test(Load::Len, Cond::Ge, 64)
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse("ip and"), Err(FilterError::UnexpectedEnd));
        assert!(matches!(
            parse("bogus"),
            Err(FilterError::UnexpectedToken { position: 0, .. })
        ));
        assert!(matches!(
            parse("ip tcp"),
            Err(FilterError::UnexpectedToken { position: 3, .. })
        ));
        assert_eq!(parse("ether[0:3] = 1"), Err(FilterError::InvalidSize(3)));
        assert!(parse("(ip").is_err());
        assert!(parse("ether src 10.0.0.1").is_err());
    }

    #[test]
    fn test_long_chain_is_too_complex() {
        let chain = vec!["arp"; 20_000].join(" and ");
        assert_eq!(parse(&chain), Err(FilterError::TooComplex));

        let chain = vec!["arp"; MAX_TERMS].join(" or ");
        assert!(parse(&chain).is_ok());
    }

    #[test]
    fn test_deep_nesting_is_too_complex() {
        let deep = format!("{}arp{}", "(".repeat(20_000), ")".repeat(20_000));
        assert_eq!(parse(&deep), Err(FilterError::TooComplex));

        let negated = format!("{}arp", "not ".repeat(20_000));
        assert_eq!(parse(&negated), Err(FilterError::TooComplex));

        let shallow = format!("{}arp{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert_eq!(parse(&shallow).unwrap(), Some(ethertype(ETHERTYPE_ARP)));
    }
}
