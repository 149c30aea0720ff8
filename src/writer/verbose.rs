//! Verbose writer: logs every instruction that reaches the buffer.

use super::{Downstream, LirFilter};
use crate::lir::{printer, LIns, LInsData};

/// Non-mutating stage that prints appended instructions at `debug` level.
#[derive(Debug, Default)]
pub struct VerboseWriter {
    /// First buffer position not yet logged.
    next: usize,
}

impl VerboseWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> LirFilter<'a> for VerboseWriter {
    fn name(&self) -> &'static str {
        "verbose"
    }

    fn ins(&mut self, data: LInsData<'a>, out: &mut Downstream<'_, 'a>) -> LIns {
        let ins = out.ins(data);
        let buf = out.buffer();
        while self.next < buf.len() {
            log::debug!("    {}", printer::format_ins(buf, buf.handle(self.next)));
            self.next += 1;
        }
        ins
    }
}
