//! Instruction set definition for the simulated MIPS subset.
//!
//! Every kind is registered under its `(opcode, funct)` decode key together
//! with its static timing metadata: `tuse_*` names the earliest stage at
//! which a source operand must be live, `tnew` the stage whose completion
//! produces the destination value. The hazard unit works exclusively off
//! this table.

use crate::isa::{Word, REG_RA};
use crate::pipeline::{Packet, Pool, Stage, Stall};

/// Which encoding field (if any) names the destination register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteSel {
    Rd,
    Rt,
    /// `$31`, regardless of encoding (the link instruction).
    Ra,
    None,
}

macro_rules! define_instr {
    {
        $(
            $(#[$doc:meta])*
            $name:ident $text:literal : $key:pat =>
                ($trs:ident, $trt:ident, $tnew:ident, $wr:ident);
        )*
    } => {
        /// Instruction kind, one variant per supported operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize))]
        pub enum Kind {
            $( $(#[$doc])* $name, )*
        }

        impl Kind {
            /// Decode-table lookup. The key is `(opcode, Some(funct))` for
            /// R-type words and `(opcode, None)` otherwise.
            pub fn lookup(opcode: u8, funct: Option<u8>) -> Option<Kind> {
                match (opcode, funct) {
                    $( $key => Some(Kind::$name), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self { $( Kind::$name => $text, )* }
            }

            pub fn tuse_rs(self) -> Stage {
                match self { $( Kind::$name => Stage::$trs, )* }
            }

            pub fn tuse_rt(self) -> Stage {
                match self { $( Kind::$name => Stage::$trt, )* }
            }

            pub fn tnew(self) -> Stage {
                match self { $( Kind::$name => Stage::$tnew, )* }
            }

            fn writes(self) -> WriteSel {
                match self { $( Kind::$name => WriteSel::$wr, )* }
            }
        }
    };
}

define_instr! {
    /// `rd = rs + rt`
    Add "add" : (0x00, Some(0x20)) => (Ex, Ex, Mem, Rd);
    /// `rd = rs - rt`
    Sub "sub" : (0x00, Some(0x22)) => (Ex, Ex, Mem, Rd);
    /// `rt = imm16 << 16`
    Lui "lui" : (0x0f, None) => (Begin, Begin, Mem, Rt);
    /// `rt = rs | zext(imm16)`
    Ori "ori" : (0x0d, None) => (Ex, Begin, Ex, Rt);
    /// EX: `addr = rs + sext(imm16)`; MEM: `rt = mem[addr]`
    Lw "lw" : (0x23, None) => (Ex, Begin, Wb, Rt);
    /// EX: `addr = rs + sext(imm16)`; MEM: `mem[addr] = rt`
    Sw "sw" : (0x2b, None) => (Ex, Mem, End, None);
    /// ID: if `rs == rt` then `npc = pc + 4 + (sext(imm16) << 2)`
    Beq "beq" : (0x04, None) => (Id, Id, End, None);
    /// ID: `npc = rs`
    Jr "jr" : (0x00, Some(0x08)) => (Id, Begin, End, None);
    /// ID: `npc = target`, `$31 = pc + 8`
    Jal "jal" : (0x03, None) => (Begin, Begin, Ex, Ra);
    Nop "nop" : (0x00, Some(0x00)) => (Begin, Begin, End, None);
}

/// A decoded instruction: the raw word, the address it was fetched from and
/// its kind. Bit fields are extracted on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    raw: u32,
    pc: Word,
    kind: Kind,
}

impl Instr {
    /// Decode a machine word fetched at `pc`. Unknown encodings fall back to
    /// the no-op entry.
    pub fn decode(raw: u32, pc: Word) -> Instr {
        let opcode = ((raw >> 26) & 0x3f) as u8;
        let funct = (opcode == 0).then(|| (raw & 0x3f) as u8);
        let kind = Kind::lookup(opcode, funct).unwrap_or_else(|| {
            tracing::trace!("unknown encoding {raw:#010x} at {pc}, decoding as nop");
            Kind::Nop
        });
        Instr { raw, pc, kind }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn pc(&self) -> Word {
        self.pc
    }

    pub fn opcode(&self) -> u8 {
        ((self.raw >> 26) & 0x3f) as u8
    }

    pub fn rs(&self) -> u8 {
        ((self.raw >> 21) & 0x1f) as u8
    }

    pub fn rt(&self) -> u8 {
        ((self.raw >> 16) & 0x1f) as u8
    }

    pub fn rd(&self) -> u8 {
        ((self.raw >> 11) & 0x1f) as u8
    }

    pub fn shamt(&self) -> u8 {
        ((self.raw >> 6) & 0x1f) as u8
    }

    pub fn funct(&self) -> u8 {
        (self.raw & 0x3f) as u8
    }

    pub fn imm16(&self) -> u32 {
        self.raw & 0xffff
    }

    pub fn imm16_signed(&self) -> i32 {
        (self.raw & 0xffff) as u16 as i16 as i32
    }

    pub fn imm26(&self) -> u32 {
        self.raw & 0x03ff_ffff
    }

    /// Destination register, or `None` for non-writers.
    pub fn wreg(&self) -> Option<u8> {
        match self.kind.writes() {
            WriteSel::Rd => Some(self.rd()),
            WriteSel::Rt => Some(self.rt()),
            WriteSel::Ra => Some(REG_RA),
            WriteSel::None => None,
        }
    }

    pub fn tuse_rs(&self) -> Stage {
        self.kind.tuse_rs()
    }

    pub fn tuse_rt(&self) -> Stage {
        self.kind.tuse_rt()
    }

    pub fn tnew(&self) -> Stage {
        self.kind.tnew()
    }

    /// Stages left, counted from `stage`, until the destination value is
    /// available to forwarding. Zero means ready now.
    pub fn remaining(&self, stage: Stage) -> i32 {
        (self.kind.tnew().ordinal() - stage.ordinal()).max(0)
    }

    /// Absolute target of the jump-and-link instruction: the region bits of
    /// `pc + 4` glued onto `imm26 << 2`.
    pub fn jump_target(&self) -> Word {
        Word::new(((self.pc + 4).value() & 0xf000_0000) | (self.imm26() << 2))
    }

    /// Conventional MIPS syntax with numeric register names.
    pub fn disasm(&self) -> String {
        match self.kind {
            Kind::Add | Kind::Sub => format!(
                "{} ${}, ${}, ${}",
                self.kind.name(),
                self.rd(),
                self.rs(),
                self.rt()
            ),
            Kind::Lui => format!("lui ${}, {:#x}", self.rt(), self.imm16()),
            Kind::Ori => format!("ori ${}, ${}, {:#x}", self.rt(), self.rs(), self.imm16()),
            Kind::Lw | Kind::Sw => format!(
                "{} ${}, {}(${})",
                self.kind.name(),
                self.rt(),
                self.imm16_signed(),
                self.rs()
            ),
            Kind::Beq => format!(
                "beq ${}, ${}, {}",
                self.rs(),
                self.rt(),
                self.imm16_signed()
            ),
            Kind::Jr => format!("jr ${}", self.rs()),
            Kind::Jal => format!("jal {:#010x}", self.jump_target().value()),
            Kind::Nop => "nop".to_string(),
        }
    }

    /// Run this instruction's share of the current stage.
    ///
    /// Called once per stage as the packet advances; each kind performs work
    /// only at the stage(s) where that work belongs, so results become
    /// visible to forwarding exactly when the timing table says they do.
    pub(crate) fn execute(&self, packet: &mut Packet, pool: &mut Pool) -> Result<(), Stall> {
        match self.kind {
            Kind::Add => {
                if packet.stage == Stage::Ex {
                    let a = pool.read_reg(packet, self.rs())?;
                    let b = pool.read_reg(packet, self.rt())?;
                    pool.write_reg(packet, self.rd(), a + b, "add");
                }
            }
            Kind::Sub => {
                if packet.stage == Stage::Ex {
                    let a = pool.read_reg(packet, self.rs())?;
                    let b = pool.read_reg(packet, self.rt())?;
                    pool.write_reg(packet, self.rd(), a - b, "sub");
                }
            }
            Kind::Lui => {
                if packet.stage == Stage::Ex {
                    let val = Word::new(self.imm16() << 16);
                    pool.write_reg(packet, self.rt(), val, "lui");
                }
            }
            Kind::Ori => {
                if packet.stage == Stage::Ex {
                    let a = pool.read_reg(packet, self.rs())?;
                    pool.write_reg(packet, self.rt(), a | Word::new(self.imm16()), "ori");
                }
            }
            Kind::Lw => {
                if packet.stage == Stage::Ex {
                    let base = pool.read_reg(packet, self.rs())?;
                    packet.addr = Some(base + Word::from(self.imm16_signed()));
                } else if packet.stage == Stage::Mem {
                    if let Some(addr) = packet.addr {
                        let val = pool.read_mem(addr);
                        pool.write_reg(packet, self.rt(), val, "lw");
                    }
                }
            }
            Kind::Sw => {
                if packet.stage == Stage::Ex {
                    let base = pool.read_reg(packet, self.rs())?;
                    packet.addr = Some(base + Word::from(self.imm16_signed()));
                } else if packet.stage == Stage::Mem {
                    if let Some(addr) = packet.addr {
                        let val = pool.read_reg(packet, self.rt())?;
                        pool.write_mem(packet, addr, val);
                    }
                }
            }
            Kind::Beq => {
                if packet.stage == Stage::Id {
                    let a = pool.read_reg(packet, self.rs())?;
                    let b = pool.read_reg(packet, self.rt())?;
                    if a == b {
                        packet.npc = packet.pc + 4 + Word::from(self.imm16_signed() << 2);
                    }
                }
            }
            Kind::Jr => {
                if packet.stage == Stage::Id {
                    packet.npc = pool.read_reg(packet, self.rs())?;
                }
            }
            Kind::Jal => {
                if packet.stage == Stage::Id {
                    let link = packet.pc + 8;
                    packet.npc = self.jump_target();
                    pool.write_reg(packet, REG_RA, link, "jal");
                }
            }
            Kind::Nop => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::HALT_CODE;

    fn decode(raw: u32) -> Instr {
        Instr::decode(raw, Word::new(0x3000))
    }

    #[test]
    fn bit_fields() {
        // add $3, $1, $2
        let instr = decode(0x0022_1820);
        assert_eq!(instr.opcode(), 0);
        assert_eq!(instr.rs(), 1);
        assert_eq!(instr.rt(), 2);
        assert_eq!(instr.rd(), 3);
        assert_eq!(instr.funct(), 0x20);
        assert_eq!(instr.kind(), Kind::Add);
    }

    #[test]
    fn signed_immediate() {
        // lw $5, -4($29)
        let instr = decode(0x8fa5_fffc);
        assert_eq!(instr.kind(), Kind::Lw);
        assert_eq!(instr.imm16_signed(), -4);
        assert_eq!(instr.imm16(), 0xfffc);
    }

    #[test]
    fn timing_table() {
        assert_eq!(Kind::Add.tuse_rs(), Stage::Ex);
        assert_eq!(Kind::Add.tnew(), Stage::Mem);
        assert_eq!(Kind::Lw.tnew(), Stage::Wb);
        assert_eq!(Kind::Ori.tnew(), Stage::Ex);
        assert_eq!(Kind::Beq.tuse_rs(), Stage::Id);
        assert_eq!(Kind::Beq.tnew(), Stage::End);
        assert_eq!(Kind::Lui.tuse_rs(), Stage::Begin);
        assert_eq!(Kind::Sw.tuse_rt(), Stage::Mem);
    }

    #[test]
    fn remaining_counts_down_and_saturates() {
        let lw = decode(0x8fa5_fffc);
        assert_eq!(lw.remaining(Stage::Ex), 2);
        assert_eq!(lw.remaining(Stage::Mem), 1);
        assert_eq!(lw.remaining(Stage::Wb), 0);
        let ori = decode(0x3401_0005);
        assert_eq!(ori.remaining(Stage::Mem), 0);
    }

    #[test]
    fn destination_register() {
        assert_eq!(decode(0x0022_1820).wreg(), Some(3)); // add -> rd
        assert_eq!(decode(0x3401_0005).wreg(), Some(1)); // ori -> rt
        assert_eq!(decode(0x0c10_0008).wreg(), Some(31)); // jal -> $ra
        assert_eq!(decode(0xafa5_0000).wreg(), None); // sw
        assert_eq!(decode(HALT_CODE).wreg(), None); // beq
    }

    #[test]
    fn unknown_encoding_decodes_as_nop() {
        // slt is not in the table
        let instr = decode(0x0022_182a);
        assert_eq!(instr.kind(), Kind::Nop);
        // neither is opcode 0x3f
        assert_eq!(decode(0xfc00_0000).kind(), Kind::Nop);
        // the canonical nop (sll $0, $0, 0) hits the table directly
        assert_eq!(decode(0x0000_0000).kind(), Kind::Nop);
    }

    #[test]
    fn canonical_disassembly() {
        assert_eq!(decode(0x0022_1820).disasm(), "add $3, $1, $2");
        assert_eq!(decode(0x8fa5_fffc).disasm(), "lw $5, -4($29)");
        assert_eq!(decode(0x1022_0007).disasm(), "beq $1, $2, 7");
        assert_eq!(decode(0x3c04_1000).disasm(), "lui $4, 0x1000");
        assert_eq!(decode(0x3484_abcd).disasm(), "ori $4, $4, 0xabcd");
        assert_eq!(decode(0x0c10_0008).disasm(), "jal 0x00400020");
        assert_eq!(decode(0x03e0_0008).disasm(), "jr $31");
        assert_eq!(decode(0x0000_0000).disasm(), "nop");
    }

    #[test]
    fn halt_sentinel_is_a_self_branch() {
        let halt = decode(HALT_CODE);
        assert_eq!(halt.kind(), Kind::Beq);
        assert_eq!(halt.imm16_signed(), -1);
        assert_eq!(halt.rs(), 0);
        assert_eq!(halt.rt(), 0);
    }
}
