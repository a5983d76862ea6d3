//! Classic BPF instructions and a user-space interpreter.
//!
//! The instruction layout matches `struct sock_filter` on Linux and
//! `struct bpf_insn` on the BSDs, so a program printed with `tcpdump -dd`
//! can be loaded with [`FrameFilter::from_program`](super::FrameFilter::from_program).

use std::fmt;

use crate::error::FilterError;

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// Load sizes
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

// Load modes
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

// ALU operations
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

// Jump conditions
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

// Operand source
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;
pub const BPF_A: u16 = 0x10;

// Misc operations
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Number of scratch memory words.
pub const BPF_MEMWORDS: usize = 16;

/// Upper bound on program length, same as the Linux kernel's.
pub const BPF_MAXINSNS: usize = 4096;

/// A single classic BPF instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Instruction {
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    /// A non-jump statement.
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self::new(code, 0, 0, k)
    }

    fn class(&self) -> u16 {
        self.code & 0x07
    }

    fn size(&self) -> u16 {
        self.code & 0x18
    }

    fn mode(&self) -> u16 {
        self.code & 0xe0
    }

    fn op(&self) -> u16 {
        self.code & 0xf0
    }

    fn src(&self) -> u16 {
        self.code & 0x08
    }
}

/// Check that a program is safe to run: non-empty, bounded, every jump in
/// range, every scratch access in range, and the last instruction a return.
pub fn validate(program: &[Instruction]) -> Result<(), FilterError> {
    if program.is_empty() {
        return Err(FilterError::InvalidProgram("empty program".to_string()));
    }
    if program.len() > BPF_MAXINSNS {
        return Err(FilterError::InvalidProgram(format!(
            "{} instructions exceeds the limit of {}",
            program.len(),
            BPF_MAXINSNS
        )));
    }

    for (pc, ins) in program.iter().enumerate() {
        let remaining = program.len() - pc - 1;
        let bad = |what: &str| FilterError::InvalidProgram(format!("({:03}) {}", pc, what));
        match ins.class() {
            BPF_LD | BPF_LDX => match ins.mode() {
                BPF_IMM | BPF_ABS | BPF_IND | BPF_LEN | BPF_MSH => {}
                BPF_MEM if (ins.k as usize) < BPF_MEMWORDS => {}
                BPF_MEM => return Err(bad("scratch index out of range")),
                _ => return Err(bad("unknown load mode")),
            },
            BPF_ST | BPF_STX => {
                if ins.k as usize >= BPF_MEMWORDS {
                    return Err(bad("scratch index out of range"));
                }
            }
            BPF_ALU => match ins.op() {
                BPF_DIV | BPF_MOD if ins.src() == BPF_K && ins.k == 0 => {
                    return Err(bad("division by constant zero"))
                }
                BPF_ADD | BPF_SUB | BPF_MUL | BPF_DIV | BPF_OR | BPF_AND | BPF_LSH
                | BPF_RSH | BPF_NEG | BPF_MOD | BPF_XOR => {}
                _ => return Err(bad("unknown alu operation")),
            },
            BPF_JMP => {
                if ins.op() == BPF_JA {
                    if ins.k as usize >= remaining {
                        return Err(bad("jump out of range"));
                    }
                } else if ins.jt as usize >= remaining || ins.jf as usize >= remaining {
                    return Err(bad("jump out of range"));
                }
            }
            BPF_RET | BPF_MISC => {}
            _ => unreachable!("class is three bits wide"),
        }
    }

    match program.last() {
        Some(last) if last.class() == BPF_RET => Ok(()),
        _ => Err(FilterError::InvalidProgram(
            "program must end with a return".to_string(),
        )),
    }
}

fn load(packet: &[u8], offset: u32, size: u16) -> Option<u32> {
    let start = offset as usize;
    match size {
        BPF_W => {
            let bytes = packet.get(start..start.checked_add(4)?)?;
            Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        BPF_H => {
            let bytes = packet.get(start..start.checked_add(2)?)?;
            Some(u32::from(u16::from_be_bytes([bytes[0], bytes[1]])))
        }
        BPF_B => packet.get(start).map(|b| u32::from(*b)),
        _ => None,
    }
}

/// Run a validated program against a packet and return its verdict: the
/// number of bytes to accept, 0 meaning reject.
///
/// Out-of-bounds packet loads and division by zero reject the packet, as the
/// kernel interpreter does.
pub fn run(program: &[Instruction], packet: &[u8]) -> u32 {
    execute(program, packet).unwrap_or(0)
}

fn execute(program: &[Instruction], packet: &[u8]) -> Option<u32> {
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut mem = [0u32; BPF_MEMWORDS];
    let len = packet.len() as u32;
    let mut pc = 0usize;

    while let Some(ins) = program.get(pc) {
        pc += 1;
        match ins.class() {
            BPF_LD => {
                a = match ins.mode() {
                    BPF_ABS => load(packet, ins.k, ins.size())?,
                    BPF_IND => load(packet, x.checked_add(ins.k)?, ins.size())?,
                    BPF_LEN => len,
                    BPF_IMM => ins.k,
                    BPF_MEM => *mem.get(ins.k as usize)?,
                    _ => return None,
                };
            }
            BPF_LDX => {
                x = match ins.mode() {
                    BPF_IMM => ins.k,
                    BPF_LEN => len,
                    BPF_MEM => *mem.get(ins.k as usize)?,
                    BPF_MSH => (load(packet, ins.k, BPF_B)? & 0x0f) * 4,
                    _ => return None,
                };
            }
            BPF_ST => *mem.get_mut(ins.k as usize)? = a,
            BPF_STX => *mem.get_mut(ins.k as usize)? = x,
            BPF_ALU => {
                let operand = if ins.src() == BPF_X { x } else { ins.k };
                a = match ins.op() {
                    BPF_ADD => a.wrapping_add(operand),
                    BPF_SUB => a.wrapping_sub(operand),
                    BPF_MUL => a.wrapping_mul(operand),
                    BPF_DIV => a.checked_div(operand)?,
                    BPF_MOD => a.checked_rem(operand)?,
                    BPF_OR => a | operand,
                    BPF_AND => a & operand,
                    BPF_XOR => a ^ operand,
                    BPF_LSH => a.checked_shl(operand).unwrap_or(0),
                    BPF_RSH => a.checked_shr(operand).unwrap_or(0),
                    BPF_NEG => a.wrapping_neg(),
                    _ => return None,
                };
            }
            BPF_JMP => {
                let operand = if ins.src() == BPF_X { x } else { ins.k };
                let taken = match ins.op() {
                    BPF_JA => {
                        pc = pc.checked_add(ins.k as usize)?;
                        continue;
                    }
                    BPF_JEQ => a == operand,
                    BPF_JGT => a > operand,
                    BPF_JGE => a >= operand,
                    BPF_JSET => a & operand != 0,
                    _ => return None,
                };
                pc += usize::from(if taken { ins.jt } else { ins.jf });
            }
            BPF_RET => {
                return Some(match ins.code & 0x18 {
                    BPF_A => a,
                    BPF_X => x,
                    _ => ins.k,
                });
            }
            BPF_MISC => match ins.code & 0xf8 {
                BPF_TAX => x = a,
                BPF_TXA => a = x,
                _ => return None,
            },
            _ => return None,
        }
    }

    // Fell off the end: validated programs never get here.
    None
}

impl fmt::Display for Instruction {
    /// Formats like one line of `tcpdump -d`, without the address column.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match self.size() {
            BPF_W => "",
            BPF_H => "h",
            BPF_B => "b",
            _ => "?",
        };
        match self.class() {
            BPF_LD => match self.mode() {
                BPF_ABS => write!(f, "ld{} [{}]", size, self.k),
                BPF_IND => write!(f, "ld{} [x + {}]", size, self.k),
                BPF_LEN => write!(f, "ld #pktlen"),
                BPF_IMM => write!(f, "ld #{:#x}", self.k),
                BPF_MEM => write!(f, "ld M[{}]", self.k),
                _ => write!(f, "ld ?"),
            },
            BPF_LDX => match self.mode() {
                BPF_MSH => write!(f, "ldxb 4*([{}]&0xf)", self.k),
                BPF_IMM => write!(f, "ldx #{:#x}", self.k),
                BPF_LEN => write!(f, "ldx #pktlen"),
                BPF_MEM => write!(f, "ldx M[{}]", self.k),
                _ => write!(f, "ldx ?"),
            },
            BPF_ST => write!(f, "st M[{}]", self.k),
            BPF_STX => write!(f, "stx M[{}]", self.k),
            BPF_ALU => {
                let name = match self.op() {
                    BPF_ADD => "add",
                    BPF_SUB => "sub",
                    BPF_MUL => "mul",
                    BPF_DIV => "div",
                    BPF_MOD => "mod",
                    BPF_OR => "or",
                    BPF_AND => "and",
                    BPF_XOR => "xor",
                    BPF_LSH => "lsh",
                    BPF_RSH => "rsh",
                    BPF_NEG => return write!(f, "neg"),
                    _ => "?",
                };
                if self.src() == BPF_X {
                    write!(f, "{} x", name)
                } else {
                    write!(f, "{} #{:#x}", name, self.k)
                }
            }
            BPF_JMP => {
                let name = match self.op() {
                    BPF_JA => return write!(f, "ja +{}", self.k),
                    BPF_JEQ => "jeq",
                    BPF_JGT => "jgt",
                    BPF_JGE => "jge",
                    BPF_JSET => "jset",
                    _ => "j?",
                };
                if self.src() == BPF_X {
                    write!(f, "{} x jt +{} jf +{}", name, self.jt, self.jf)
                } else {
                    write!(f, "{} #{:#x} jt +{} jf +{}", name, self.k, self.jt, self.jf)
                }
            }
            BPF_RET => match self.code & 0x18 {
                BPF_A => write!(f, "ret a"),
                _ => write!(f, "ret #{}", self.k),
            },
            BPF_MISC => match self.code & 0xf8 {
                BPF_TAX => write!(f, "tax"),
                BPF_TXA => write!(f, "txa"),
                _ => write!(f, "misc ?"),
            },
            _ => write!(f, "?"),
        }
    }
}
