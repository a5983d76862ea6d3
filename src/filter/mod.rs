//! Frame filtering.
//!
//! A [`FrameFilter`] is compiled from a pcap-filter style expression such as
//! `ether[0:2] == 0xaaaa` or `arp or (ip and udp port 67)` into a classic BPF
//! program, which is then run in user space against every received frame.
//! Frames the program rejects are counted as discards by the port.

pub mod bpf;
mod codegen;
mod lexer;
mod parser;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use bpf::Instruction;

use crate::error::FilterError;

/// A compiled, immutable frame filter. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct FrameFilter {
    expression: String,
    program: Arc<[Instruction]>,
}

impl FrameFilter {
    /// Compile a filter expression. An empty expression matches every frame.
    pub fn compile(expression: &str) -> Result<Self, FilterError> {
        let expr = parser::parse(expression)?;
        let program = codegen::compile(expr.as_ref())?;
        Ok(Self {
            expression: expression.trim().to_string(),
            program: program.into(),
        })
    }

    /// Wrap an already compiled classic BPF program, e.g. one produced by
    /// `tcpdump -dd`. `expression` is only used for display.
    pub fn from_program(
        expression: impl Into<String>,
        program: Vec<Instruction>,
    ) -> Result<Self, FilterError> {
        bpf::validate(&program)?;
        Ok(Self {
            expression: expression.into(),
            program: program.into(),
        })
    }

    /// True if the frame should be delivered.
    pub fn matches(&self, frame: &[u8]) -> bool {
        bpf::run(&self.program, frame) != 0
    }

    /// The source expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn program(&self) -> &[Instruction] {
        &self.program
    }
}

/// Compile a filter expression.
pub fn compile_filter(expression: &str) -> Result<FrameFilter, FilterError> {
    FrameFilter::compile(expression)
}

impl FromStr for FrameFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl fmt::Display for FrameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl fmt::Debug for FrameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameFilter")
            .field("expression", &self.expression)
            .field("instructions", &self.program.len())
            .finish()
    }
}
