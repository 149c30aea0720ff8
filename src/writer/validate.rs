//! Structural validation of the instruction stream.
//!
//! A validator checks every instruction against the opcode table before
//! passing it on. Violations are internal consistency bugs in whatever feeds
//! the pipeline, so they panic with the validator's pipeline position.

use super::{Downstream, LirFilter};
use crate::lir::{LIns, LInsData, LirBuffer, Payload, MAX_ARGS};

/// Type and shape checker placed at either end of the pipeline.
#[derive(Debug)]
pub struct ValidateWriter {
    position: &'static str,
}

impl ValidateWriter {
    /// `position` names where in the pipeline this validator sits.
    pub fn new(position: &'static str) -> Self {
        Self { position }
    }

    fn fail(&self, data: &LInsData<'_>, msg: String) -> ! {
        panic!(
            "LIR validation failed at {}: {}: {}",
            self.position, data.opcode, msg
        );
    }

    fn check_operand(&self, data: &LInsData<'_>, buf: &LirBuffer<'_>, pos: usize, op: LIns) {
        if op.buffer_id() != buf.id() {
            self.fail(data, format!("operand {} ({}) belongs to another function", pos, op));
        }
        if op.index() >= buf.len() {
            self.fail(data, format!("operand {} ({}) does not precede it", pos, op));
        }
    }

    /// Panics if `data` is malformed with respect to `buf`.
    pub fn check(&self, data: &LInsData<'_>, buf: &LirBuffer<'_>) {
        let info = data.opcode.info();

        let count = data.operand_list().count();
        let contiguous = data.operands[..count].iter().all(Option::is_some);
        if count != info.operands.len() || !contiguous {
            self.fail(
                data,
                format!("expected {} operands, got {}", info.operands.len(), count),
            );
        }

        for (pos, (op, &expected)) in data.operand_list().zip(info.operands).enumerate() {
            self.check_operand(data, buf, pos, op);
            let actual = buf.get(op).ret_type();
            if actual != expected {
                self.fail(
                    data,
                    format!("operand {} ({}) has type {}, expected {}", pos, op, actual, expected),
                );
            }
        }

        if data.payload.kind() != info.payload {
            self.fail(
                data,
                format!("payload {:?} where {:?} is required", data.payload.kind(), info.payload),
            );
        }

        if let Some(ty) = data.payload.imm_type() {
            if ty != info.ret {
                self.fail(data, format!("immediate of type {} for a {} result", ty, info.ret));
            }
        }

        match data.payload {
            Payload::Call(site) => {
                let sig = site.info.sig;
                if site.arg_count() > MAX_ARGS || site.arg_count() != sig.arg_count() {
                    self.fail(
                        data,
                        format!("{} arguments for signature {}", site.arg_count(), sig),
                    );
                }
                if sig.ret().to_lty() != info.ret {
                    self.fail(data, format!("signature {} returns the wrong type", sig));
                }
                for (pos, arg) in site.args_abi_order().enumerate() {
                    self.check_operand(data, buf, pos, arg);
                    let actual = buf.get(arg).ret_type();
                    let expected = sig.arg(pos).map(|a| a.to_lty());
                    if Some(actual) != expected {
                        self.fail(
                            data,
                            format!("argument {} ({}) has type {}, signature is {}", pos, arg, actual, sig),
                        );
                    }
                }
            }
            Payload::Target(Some(label)) => self.check_operand(data, buf, 0, label),
            Payload::Table(cells) if cells.is_empty() => {
                self.fail(data, "jump table without entries".to_string());
            }
            _ => {}
        }
    }
}

impl<'a> LirFilter<'a> for ValidateWriter {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn ins(&mut self, data: LInsData<'a>, out: &mut Downstream<'_, 'a>) -> LIns {
        self.check(&data, out.buffer());
        out.ins(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::LOpcode;
    use crate::writer::WriterPipeline;
    use bumpalo::Bump;

    fn validated<'a>() -> WriterPipeline<'a> {
        let mut pipeline = WriterPipeline::new();
        pipeline.push_outer(Box::new(ValidateWriter::new("start of writer pipeline")));
        pipeline
    }

    #[test]
    fn test_well_formed_stream_passes() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let mut p = validated();
        p.ins(&mut buf, LInsData::op0(LOpcode::Start));
        let base = p.ins(&mut buf, LInsData::new(LOpcode::Param, &[], Payload::Param(0)));
        let v = p.ins(&mut buf, LInsData::new(LOpcode::LdI, &[base], Payload::Disp(4)));
        let w = p.ins(&mut buf, LInsData::op2(LOpcode::AddI, v, v));
        p.ins(&mut buf, LInsData::new(LOpcode::StI, &[w, base], Payload::Disp(4)));
        p.ins(&mut buf, LInsData::op1(LOpcode::RetI, w));
        assert_eq!(buf.len(), 6);
    }

    #[test]
    #[should_panic(expected = "start of writer pipeline")]
    fn test_type_mismatch_panics() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let mut p = validated();
        let q = p.ins(&mut buf, LInsData::immq(1));
        p.ins(&mut buf, LInsData::op2(LOpcode::AddI, q, q));
    }

    #[test]
    #[should_panic(expected = "expected 2 operands")]
    fn test_arity_mismatch_panics() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let mut p = validated();
        let i = p.ins(&mut buf, LInsData::immi(1));
        p.ins(&mut buf, LInsData::op1(LOpcode::SubI, i));
    }

    #[test]
    #[should_panic(expected = "another function")]
    fn test_foreign_operand_panics() {
        let arena = Bump::new();
        let mut other = LirBuffer::new(&arena, 1);
        let foreign = other.append(LInsData::immi(1));
        let mut buf = LirBuffer::new(&arena, 0);
        buf.append(LInsData::immi(2));
        let mut p = validated();
        p.ins(&mut buf, LInsData::op1(LOpcode::NegI, foreign));
    }

    #[test]
    #[should_panic(expected = "immediate of type int64")]
    fn test_payload_mismatch_panics() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let mut p = validated();
        p.ins(&mut buf, LInsData::new(LOpcode::ImmI, &[], Payload::ImmQ(3)));
    }
}
