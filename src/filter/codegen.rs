//! Lowers a parsed [`Expr`] into a classic BPF program.
//!
//! Each boolean node is compiled with a "jump here if true" and a "jump here
//! if false" label, so `not` costs nothing and `and`/`or` short-circuit.
//! Labels are resolved to relative offsets once the whole program is laid out.

use super::bpf::*;
use super::parser::{Cond, Expr, Load, Test};
use crate::error::FilterError;

/// Returned for accepted frames; libpcap uses the same default snap length.
pub const ACCEPT: u32 = 262_144;
pub const REJECT: u32 = 0;

type Label = usize;

struct Pending {
    code: u16,
    k: u32,
    jt: Option<Label>,
    jf: Option<Label>,
}

#[derive(Default)]
struct Codegen {
    out: Vec<Pending>,
    labels: Vec<Option<usize>>,
}

impl Codegen {
    fn label(&mut self) -> Label {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn place(&mut self, label: Label) {
        self.labels[label] = Some(self.out.len());
    }

    fn stmt(&mut self, code: u16, k: u32) {
        self.out.push(Pending {
            code,
            k,
            jt: None,
            jf: None,
        });
    }

    fn branch(&mut self, code: u16, k: u32, jt: Label, jf: Label) {
        self.out.push(Pending {
            code,
            k,
            jt: Some(jt),
            jf: Some(jf),
        });
    }

    fn expr(&mut self, expr: &Expr, on_true: Label, on_false: Label) {
        match expr {
            Expr::And(lhs, rhs) => {
                let next = self.label();
                self.expr(lhs, next, on_false);
                self.place(next);
                self.expr(rhs, on_true, on_false);
            }
            Expr::Or(lhs, rhs) => {
                let next = self.label();
                self.expr(lhs, on_true, next);
                self.place(next);
                self.expr(rhs, on_true, on_false);
            }
            Expr::Not(inner) => self.expr(inner, on_false, on_true),
            Expr::Test(test) => self.test(test, on_true, on_false),
        }
    }

    fn test(&mut self, test: &Test, on_true: Label, on_false: Label) {
        match test.load {
            Load::Abs { offset, size } => self.stmt(BPF_LD | size_code(size) | BPF_ABS, offset),
            Load::IpPayload { offset, size } => {
                self.stmt(BPF_LDX | BPF_MSH | BPF_B, 14);
                self.stmt(BPF_LD | size_code(size) | BPF_IND, 14 + offset);
            }
            Load::Len => self.stmt(BPF_LD | BPF_W | BPF_LEN, 0),
        }
        if let Some(mask) = test.mask {
            self.stmt(BPF_ALU | BPF_AND | BPF_K, mask);
        }
        let cond = match test.cond {
            Cond::Eq => BPF_JEQ,
            Cond::Gt => BPF_JGT,
            Cond::Ge => BPF_JGE,
            Cond::Set => BPF_JSET,
        };
        self.branch(BPF_JMP | cond | BPF_K, test.value, on_true, on_false);
    }

    fn finish(self) -> Result<Vec<Instruction>, FilterError> {
        let resolve = |from: usize, label: Option<Label>| -> Result<u8, FilterError> {
            let Some(label) = label else { return Ok(0) };
            let target = self.labels[label]
                .ok_or_else(|| FilterError::InvalidProgram(format!("unplaced label {}", label)))?;
            let distance = target
                .checked_sub(from + 1)
                .ok_or_else(|| FilterError::InvalidProgram("backward jump".to_string()))?;
            u8::try_from(distance).map_err(|_| FilterError::TooComplex)
        };

        self.out
            .iter()
            .enumerate()
            .map(|(pc, p)| -> Result<Instruction, FilterError> {
                Ok(Instruction::new(
                    p.code,
                    resolve(pc, p.jt)?,
                    resolve(pc, p.jf)?,
                    p.k,
                ))
            })
            .collect()
    }
}

fn size_code(size: u32) -> u16 {
    match size {
        4 => BPF_W,
        2 => BPF_H,
        _ => BPF_B,
    }
}

/// Compile an expression; `None` compiles to a program that accepts everything.
pub fn compile(expr: Option<&Expr>) -> Result<Vec<Instruction>, FilterError> {
    let Some(expr) = expr else {
        return Ok(vec![Instruction::stmt(BPF_RET | BPF_K, ACCEPT)]);
    };

    let mut gen = Codegen::default();
    let accept = gen.label();
    let reject = gen.label();
    gen.expr(expr, accept, reject);
    gen.place(accept);
    gen.stmt(BPF_RET | BPF_K, ACCEPT);
    gen.place(reject);
    gen.stmt(BPF_RET | BPF_K, REJECT);

    let program = gen.finish()?;
    validate(&program)?;
    Ok(program)
}
