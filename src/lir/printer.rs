//! Text form of LIR instructions, used by the verbose writer and by
//! `Display` for buffers.

use std::fmt::Write;

use super::buffer::LirBuffer;
use super::ins::{LIns, LInsData, Payload};
use super::opcode::LTy;

/// Format one instruction of `buf`.
pub fn format_ins(buf: &LirBuffer<'_>, ins: LIns) -> String {
    format_data(ins, buf.get(ins))
}

/// Format an instruction record that will receive handle `ins`.
pub fn format_data(ins: LIns, data: &LInsData<'_>) -> String {
    let mut out = String::new();
    if data.ret_type() != LTy::V {
        let _ = write!(out, "{} = ", ins);
    }
    out.push_str(data.opcode.name());

    match data.payload {
        Payload::ImmI(v) => {
            let _ = write!(out, " {}", v);
        }
        Payload::ImmQ(v) => {
            let _ = write!(out, " {}", v);
        }
        Payload::ImmD(v) => {
            let _ = write!(out, " {:?}", v);
        }
        Payload::ImmF(v) => {
            let _ = write!(out, " {:?}", v);
        }
        Payload::Param(p) => {
            let _ = write!(out, " {}", p);
        }
        Payload::Alloc(size) => {
            let _ = write!(out, " {}", size);
        }
        Payload::Comment(text) => {
            let _ = write!(out, " #{}", text);
        }
        _ => {}
    }

    let operands: Vec<_> = data.operand_list().collect();
    match data.payload {
        Payload::Disp(disp) => {
            // Stores print "value, base[disp]", loads print "base[disp]".
            if let Some((base, values)) = operands.split_last() {
                for value in values {
                    let _ = write!(out, " {},", value);
                }
                let _ = write!(out, " {}[{}]", base, disp);
            }
        }
        _ => {
            for (i, op) in operands.iter().enumerate() {
                let sep = if i == 0 { " " } else { ", " };
                let _ = write!(out, "{}{}", sep, op);
            }
        }
    }

    match data.payload {
        Payload::Target(target) => match target {
            Some(label) => {
                let _ = write!(out, " -> {}", label);
            }
            None => out.push_str(" -> ?"),
        },
        Payload::Table(cells) => {
            out.push_str(" [");
            for (i, cell) in cells.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match cell.get() {
                    Some(label) => {
                        let _ = write!(out, "{}", label);
                    }
                    None => out.push('?'),
                }
            }
            out.push(']');
        }
        Payload::Call(site) => {
            let _ = write!(out, " {} (", site.info.name);
            for (i, arg) in site.args_abi_order().enumerate() {
                let sep = if i == 0 { "" } else { " " };
                let _ = write!(out, "{}{}", sep, arg);
            }
            let _ = write!(
                out,
                ") /* {} {} {} */",
                site.info.abi, site.info.sig, site.info.access
            );
        }
        Payload::Guard(record) => {
            let _ = write!(out, " -> exit{} from {}", record.id, record.exit.from);
        }
        _ => {}
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::call::{AbiKind, AccessSet, ArgType, CallInfo, CallSite, TypeSig};
    use crate::lir::opcode::LOpcode;
    use bumpalo::Bump;

    #[test]
    fn test_format_arithmetic_and_memory() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let base = buf.append(LInsData::immq(4096));
        let five = buf.append(LInsData::immi(5));
        let ld = buf.append(LInsData::new(LOpcode::LdI, &[base], Payload::Disp(8)));
        let add = buf.append(LInsData::op2(LOpcode::AddI, ld, five));
        let st = buf.append(LInsData::new(LOpcode::StI, &[add, base], Payload::Disp(-4)));

        assert_eq!(format_ins(&buf, five), "ins1 = immi 5");
        assert_eq!(format_ins(&buf, ld), "ins2 = ldi ins0[8]");
        assert_eq!(format_ins(&buf, add), "ins3 = addi ins2, ins1");
        assert_eq!(format_ins(&buf, st), "sti ins3, ins0[-4]");
    }

    #[test]
    fn test_format_control_and_calls() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let j = buf.append(LInsData::new(LOpcode::J, &[], Payload::Target(None)));
        assert_eq!(format_ins(&buf, j), "j -> ?");

        let a = buf.append(LInsData::immq(1));
        let b = buf.append(LInsData::immd(2.0));
        let info: &CallInfo = arena.alloc(CallInfo {
            name: "g",
            address: 0,
            sig: TypeSig::new(ArgType::Q, &[ArgType::Q, ArgType::D]).unwrap(),
            abi: AbiKind::Cdecl,
            access: AccessSet::STORE,
        });
        let args: &[LIns] = arena.alloc_slice_copy(&[b, a]);
        let site: &CallSite = arena.alloc(CallSite { info, args });
        let call = buf.append(LInsData::new(LOpcode::CallQ, &[], Payload::Call(site)));

        assert_eq!(
            format_ins(&buf, call),
            "ins3 = callq g (ins1 ins2) /* cdecl int64 (int64, float64) store */"
        );
        assert!(buf.to_string().lines().count() == 4);
    }
}
