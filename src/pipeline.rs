//! Pipeline machinery: the stage ordering, in-flight instruction packets,
//! the one-deep stage slots and the hazard/forwarding unit.

use std::collections::BTreeMap;
use std::fmt;

use crate::behavior::{Behavior, BehaviorKind};
use crate::cpu::{DataMemory, RegisterFile};
use crate::inst::Instr;
use crate::isa::Word;

/// Pipeline stage, totally ordered by position.
///
/// `Begin` and `End` are sentinels, not real stages: a `tuse` of `Begin`
/// marks a source register as unused, a `tnew` of `End` marks an instruction
/// that writes no register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum Stage {
    Begin,
    If,
    Id,
    Ex,
    Mem,
    Wb,
    End,
}

impl Stage {
    /// The five real stages, front to back.
    pub const PIPELINE: [Stage; 5] = [Stage::If, Stage::Id, Stage::Ex, Stage::Mem, Stage::Wb];

    /// Position used for stage distance computations.
    pub const fn ordinal(self) -> i32 {
        self as i32
    }

    /// The monotone advance `BEGIN -> IF -> ID -> EX -> MEM -> WB -> END`.
    pub const fn succ(self) -> Stage {
        match self {
            Stage::Begin => Stage::If,
            Stage::If => Stage::Id,
            Stage::Id => Stage::Ex,
            Stage::Ex => Stage::Mem,
            Stage::Mem => Stage::Wb,
            Stage::Wb | Stage::End => Stage::End,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Stage::Begin => "BEGIN",
            Stage::If => "IF",
            Stage::Id => "ID",
            Stage::Ex => "EX",
            Stage::Mem => "MEM",
            Stage::Wb => "WB",
            Stage::End => "END",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decode-stage verdict: the instruction in ID cannot be served in time by
/// any in-flight producer and must wait a cycle.
///
/// This is an ordinary result variant, not an error type; it is resolved
/// entirely within one `step()` by inserting a bubble into EX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    /// Register the decode stage is waiting for.
    pub reg: u8,
    /// Cycles until the consumer needs the value.
    pub t_use: i32,
    /// Cycles until the producer can deliver it.
    pub t_new: i32,
}

impl fmt::Display for Stall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hazard on ${}: Tuse({}) < Tnew({})",
            self.reg, self.t_use, self.t_new
        )
    }
}

/// A staged write: the value a packet intends to commit, together with the
/// value it overwrites and a short tag naming the operation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Change {
    pub origin: Word,
    pub new: Word,
    pub reason: &'static str,
}

/// An in-flight instruction travelling down the pipeline.
///
/// The packet carries everything its instruction has produced so far but not
/// yet committed: pending register writes (`alu`, committed by WB), pending
/// memory writes (`mem`, committed by MEM) and the memory address computed in
/// EX for loads and stores.
#[derive(Debug, Clone)]
pub struct Packet {
    pub instr: Instr,
    /// Address this instruction was fetched from.
    pub pc: Word,
    /// Predicted next pc: `pc + 4` until a branch resolved in ID overwrites
    /// it.
    pub npc: Word,
    pub stage: Stage,
    pub alu: BTreeMap<u8, Change>,
    pub mem: BTreeMap<Word, Change>,
    pub addr: Option<Word>,
}

impl Packet {
    pub fn new(instr: Instr, pc: Word) -> Self {
        Packet {
            instr,
            pc,
            npc: pc + 4,
            stage: Stage::If,
            alu: BTreeMap::new(),
            mem: BTreeMap::new(),
            addr: None,
        }
    }

    pub fn advance(&mut self) {
        self.stage = self.stage.succ();
    }

    /// Whether ID resolved this packet as a taken branch.
    pub fn taken(&self) -> bool {
        self.npc != self.pc + 4
    }
}

/// The five one-deep stage buffers. A `None` entry is a bubble.
///
/// Stage functions run back to front and overwrite the downstream slot, so
/// within one cycle the map reflects a mid-shift state: slots downstream of
/// the stage currently running have already advanced. The producer scan in
/// [`Pool`] relies on exactly this view.
#[derive(Debug, Clone, Default)]
pub struct Slots {
    inner: [Option<Packet>; 7],
}

impl Slots {
    pub fn get(&self, stage: Stage) -> Option<&Packet> {
        self.inner[stage.ordinal() as usize].as_ref()
    }

    pub fn set(&mut self, stage: Stage, packet: Option<Packet>) {
        self.inner[stage.ordinal() as usize] = packet;
    }

    pub fn take(&mut self, stage: Stage) -> Option<Packet> {
        self.inner[stage.ordinal() as usize].take()
    }
}

/// The hazard/forwarding unit.
///
/// A `Pool` is a per-stage view over the CPU's slots and architectural state.
/// It answers two questions: must the instruction in decode stall, and what
/// value should a stage see for a register right now. Both are derived from
/// the same producer scan so the two paths cannot drift apart.
pub struct Pool<'a> {
    slots: &'a Slots,
    regs: &'a RegisterFile,
    dmem: &'a DataMemory,
    log: &'a mut Vec<Behavior>,
    cycle: u64,
}

impl<'a> Pool<'a> {
    pub(crate) fn new(
        slots: &'a Slots,
        regs: &'a RegisterFile,
        dmem: &'a DataMemory,
        log: &'a mut Vec<Behavior>,
        cycle: u64,
    ) -> Self {
        Pool {
            slots,
            regs,
            dmem,
            log,
            cycle,
        }
    }

    /// Nearest downstream producer of `reg`, scanning from `from` towards WB.
    ///
    /// The first match is the binding one: a newer write shadows any older
    /// producer further down, and the scan order guarantees the newest
    /// in-flight writer is found first.
    fn producer_of(&self, reg: u8, from: Stage) -> Option<(Stage, &Packet)> {
        let mut stage = from;
        while stage != Stage::End {
            if let Some(packet) = self.slots.get(stage) {
                if packet.instr.wreg() == Some(reg) {
                    return Some((stage, packet));
                }
            }
            stage = stage.succ();
        }
        None
    }

    /// Hazard check for one source register of the ID-stage instruction.
    fn detect_hazard(&self, reg: u8, t_use: Stage) -> Result<(), Stall> {
        if reg == 0 {
            return Ok(());
        }
        if let Some((stage, producer)) = self.producer_of(reg, Stage::Ex) {
            let t_new = producer.instr.remaining(stage);
            let t_use = (t_use.ordinal() - Stage::Id.ordinal()).max(0);
            if t_use < t_new {
                return Err(Stall { reg, t_use, t_new });
            }
        }
        Ok(())
    }

    /// Decide whether the ID-stage packet must stall this cycle.
    ///
    /// Each source operand the instruction actually consumes must be
    /// deliverable in time by the most recent in-flight producer, if any.
    pub fn check_stall(&self, packet: &Packet) -> Result<(), Stall> {
        let instr = &packet.instr;
        if instr.tuse_rs() != Stage::Begin {
            self.detect_hazard(instr.rs(), instr.tuse_rs())?;
        }
        if instr.tuse_rt() != Stage::Begin {
            self.detect_hazard(instr.rt(), instr.tuse_rt())?;
        }
        Ok(())
    }

    /// Read `reg` as seen by `packet` at its current stage.
    ///
    /// Forwarding path: if the nearest downstream producer's value is ready
    /// (`Tnew == 0`) it is delivered from the producer's pending writes and a
    /// `Forward` behavior is logged; otherwise the committed register file
    /// value is used. In ID the hazard condition is re-checked against the
    /// producer found here.
    pub fn read_reg(&mut self, packet: &Packet, reg: u8) -> Result<Word, Stall> {
        if reg == 0 {
            return Ok(Word::ZERO);
        }
        let hit = self
            .producer_of(reg, packet.stage.succ())
            .map(|(stage, producer)| {
                let staged = producer.alu.get(&reg).map(|change| change.new);
                (stage, producer.instr.remaining(stage), staged)
            });
        let Some((from_stage, t_new, staged)) = hit else {
            return Ok(self.regs.read(reg));
        };
        if packet.stage == Stage::Id {
            let t_use = if reg == packet.instr.rs() {
                packet.instr.tuse_rs()
            } else {
                packet.instr.tuse_rt()
            };
            let t_use = (t_use.ordinal() - Stage::Id.ordinal()).max(0);
            if t_use < t_new {
                return Err(Stall { reg, t_use, t_new });
            }
        }
        if t_new == 0 {
            if let Some(val) = staged {
                self.log.push(Behavior {
                    cycle: self.cycle,
                    pc: packet.pc,
                    kind: BehaviorKind::Forward {
                        reg,
                        val,
                        from_stage,
                        to_stage: packet.stage,
                    },
                });
                return Ok(val);
            }
        }
        Ok(self.regs.read(reg))
    }

    /// Current best value of `reg` without logging or hazard checks. Used to
    /// capture the overwritten value when staging a write.
    fn peek_reg(&self, packet: &Packet, reg: u8) -> Word {
        if reg == 0 {
            return Word::ZERO;
        }
        if let Some((stage, producer)) = self.producer_of(reg, packet.stage.succ()) {
            if producer.instr.remaining(stage) == 0 {
                if let Some(change) = producer.alu.get(&reg) {
                    return change.new;
                }
            }
        }
        self.regs.read(reg)
    }

    /// Stage a register write on the packet. Writes to `$0` are dropped.
    pub fn write_reg(&mut self, packet: &mut Packet, reg: u8, val: Word, reason: &'static str) {
        if reg == 0 {
            return;
        }
        let origin = self.peek_reg(packet, reg);
        packet.alu.insert(
            reg,
            Change {
                origin,
                new: val,
                reason,
            },
        );
    }

    /// Read data memory. There is no forwarding path out of an in-flight
    /// store; a dependent load one cycle behind observes the committed value,
    /// which MEM has written by the time the load's own MEM phase runs.
    pub fn read_mem(&self, addr: Word) -> Word {
        self.dmem.read(addr)
    }

    /// Stage a memory write on the packet; MEM commits it.
    pub fn write_mem(&mut self, packet: &mut Packet, addr: Word, val: Word) {
        let origin = self.read_mem(addr);
        packet.mem.insert(
            addr,
            Change {
                origin,
                new: val,
                reason: "mem_write",
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_and_successors() {
        assert!(Stage::Begin < Stage::If && Stage::Wb < Stage::End);
        let mut stage = Stage::Begin;
        for expect in Stage::PIPELINE {
            stage = stage.succ();
            assert_eq!(stage, expect);
        }
        assert_eq!(stage.succ(), Stage::End);
        assert_eq!(Stage::End.succ(), Stage::End);
    }

    #[test]
    fn stage_distance_is_ordinal_difference() {
        assert_eq!(Stage::Ex.ordinal() - Stage::Id.ordinal(), 1);
        assert_eq!(Stage::Wb.ordinal() - Stage::Ex.ordinal(), 2);
    }

    #[test]
    fn fresh_packet_predicts_sequential_pc() {
        let instr = Instr::decode(0, Word::new(0x3000));
        let packet = Packet::new(instr, Word::new(0x3000));
        assert_eq!(packet.npc, Word::new(0x3004));
        assert_eq!(packet.stage, Stage::If);
        assert!(!packet.taken());
    }

    #[test]
    fn slots_hold_one_packet_per_stage() {
        let mut slots = Slots::default();
        let instr = Instr::decode(0, Word::new(0x3000));
        slots.set(Stage::Ex, Some(Packet::new(instr, Word::new(0x3000))));
        assert!(slots.get(Stage::Ex).is_some());
        assert!(slots.get(Stage::Mem).is_none());
        let taken = slots.take(Stage::Ex);
        assert!(taken.is_some() && slots.get(Stage::Ex).is_none());
    }
}
