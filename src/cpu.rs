//! The cycle driver: architectural state, the WB->IF stage walk and the
//! per-cycle snapshot history.
//!
//! Stages run back to front inside one `step()`, so each stage reads its
//! input slot before its predecessor overwrites it. That ordering is what
//! implements one-cycle latching without shadow copies of the slot map.

use std::collections::BTreeMap;

use crate::behavior::{Behavior, BehaviorKind, StageStatus};
use crate::inst::Instr;
use crate::isa::{Word, HALT_CODE, TEXT_BASE};
use crate::object::Program;
use crate::pipeline::{Packet, Pool, Slots, Stage};

/// The 32 general-purpose registers. Writes to `$0` are silently dropped.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    regs: [Word; 32],
}

impl RegisterFile {
    fn new() -> Self {
        RegisterFile {
            regs: [Word::ZERO; 32],
        }
    }

    pub fn read(&self, reg: u8) -> Word {
        self.regs[reg as usize]
    }

    /// Returns whether the write actually happened.
    pub fn write(&mut self, reg: u8, val: Word) -> bool {
        if reg == 0 {
            return false;
        }
        self.regs[reg as usize] = val;
        true
    }

    pub fn snapshot(&self) -> [Word; 32] {
        self.regs
    }
}

/// Sparse word-addressed data memory. Unmapped reads return zero.
#[derive(Debug, Clone, Default)]
pub struct DataMemory {
    data: BTreeMap<Word, Word>,
}

impl DataMemory {
    pub fn read(&self, addr: Word) -> Word {
        self.data.get(&addr).copied().unwrap_or_default()
    }

    pub fn write(&mut self, addr: Word, val: Word) {
        self.data.insert(addr, val);
    }

    /// Copy of every touched address.
    pub fn snapshot(&self) -> BTreeMap<Word, Word> {
        self.data.clone()
    }
}

/// Contents of the five stage slots at the end of a cycle. An empty entry is
/// a bubble.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PipelineView {
    #[cfg_attr(feature = "serde", serde(rename = "IF"))]
    pub if_: Option<StageStatus>,
    #[cfg_attr(feature = "serde", serde(rename = "ID"))]
    pub id: Option<StageStatus>,
    #[cfg_attr(feature = "serde", serde(rename = "EX"))]
    pub ex: Option<StageStatus>,
    #[cfg_attr(feature = "serde", serde(rename = "MEM"))]
    pub mem: Option<StageStatus>,
    #[cfg_attr(feature = "serde", serde(rename = "WB"))]
    pub wb: Option<StageStatus>,
}

impl PipelineView {
    pub fn get(&self, stage: Stage) -> Option<&StageStatus> {
        match stage {
            Stage::If => self.if_.as_ref(),
            Stage::Id => self.id.as_ref(),
            Stage::Ex => self.ex.as_ref(),
            Stage::Mem => self.mem.as_ref(),
            Stage::Wb => self.wb.as_ref(),
            Stage::Begin | Stage::End => None,
        }
    }
}

/// Everything observable about one cycle: architectural state after the
/// cycle, the pipeline occupancy and the ordered behavior log.
///
/// Snapshots own copies of the register file and touched memory; they stay
/// valid after the machine has moved on.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Snapshot {
    pub cycle: u64,
    /// Program counter after this cycle's fetch.
    pub pc: Word,
    pub gpr: [Word; 32],
    pub memory: BTreeMap<Word, Word>,
    pub pipeline: PipelineView,
    pub behaviors: Vec<Behavior>,
}

/// The five-stage in-order core.
pub struct Cpu {
    pc: Word,
    cycle: u64,
    regs: RegisterFile,
    imem: Program,
    dmem: DataMemory,
    slots: Slots,
    behaviors: Vec<Behavior>,
    history: Vec<Snapshot>,
    halted: bool,
}

impl Cpu {
    pub fn new(program: Program) -> Self {
        Cpu {
            pc: Word::new(TEXT_BASE),
            cycle: 0,
            regs: RegisterFile::new(),
            imem: program,
            dmem: DataMemory::default(),
            slots: Slots::default(),
            behaviors: Vec::new(),
            history: Vec::new(),
            halted: false,
        }
    }

    /// Seed data memory before (or between) steps.
    pub fn poke_mem(&mut self, addr: Word, val: Word) {
        self.dmem.write(addr, val);
    }

    pub fn pc(&self) -> Word {
        self.pc
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn reg(&self, reg: u8) -> Word {
        self.regs.read(reg)
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn mem(&self) -> &DataMemory {
        &self.dmem
    }

    /// Snapshot of the most recent cycle, if any ran.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.history.last()
    }

    pub fn history(&self) -> &[Snapshot] {
        &self.history
    }

    /// Advance the machine by one clock tick. A no-op once halted.
    pub fn step(&mut self) {
        if self.halted {
            return;
        }
        self.cycle += 1;
        self.behaviors.clear();
        self.stage_wb();
        self.stage_mem();
        self.stage_ex();
        let stalled = self.stage_id();
        self.stage_if(stalled);
        self.capture();
    }

    /// Step until the halt sentinel commits or `max_cycles` is reached.
    pub fn run(&mut self, max_cycles: u64) {
        while !self.halted && self.cycle < max_cycles {
            self.step();
        }
    }

    fn log(&mut self, pc: Word, kind: BehaviorKind) {
        self.behaviors.push(Behavior {
            cycle: self.cycle,
            pc,
            kind,
        });
    }

    /// Commit pending register writes of the retiring packet and detect the
    /// halt sentinel. The packet stays in its slot until MEM overwrites it,
    /// so this cycle's MEM stage can still forward from it.
    fn stage_wb(&mut self) {
        let Some(mut packet) = self.slots.take(Stage::Wb) else {
            return;
        };
        packet.advance();
        for (&reg, change) in &packet.alu {
            if self.regs.write(reg, change.new) {
                self.behaviors.push(Behavior {
                    cycle: self.cycle,
                    pc: packet.pc,
                    kind: BehaviorKind::RegWrite {
                        reg,
                        val: change.new,
                    },
                });
            }
        }
        if packet.instr.raw() == HALT_CODE {
            tracing::debug!(cycle = self.cycle, "halt sentinel committed at write-back");
            self.halted = true;
        }
        self.slots.set(Stage::Wb, Some(packet));
    }

    /// Run the memory phase, commit pending memory writes, move the packet
    /// into WB. A copy stays visible under MEM so that upstream stages of
    /// this same cycle still see the packet at its current position.
    fn stage_mem(&mut self) {
        let Some(mut packet) = self.slots.take(Stage::Mem) else {
            self.slots.set(Stage::Wb, None);
            return;
        };
        packet.advance();
        let instr = packet.instr;
        let mut pool = Pool::new(
            &self.slots,
            &self.regs,
            &self.dmem,
            &mut self.behaviors,
            self.cycle,
        );
        let result = instr.execute(&mut packet, &mut pool);
        debug_assert!(result.is_ok(), "stall raised outside decode");
        for (&addr, change) in &packet.mem {
            self.dmem.write(addr, change.new);
            self.behaviors.push(Behavior {
                cycle: self.cycle,
                pc: packet.pc,
                kind: BehaviorKind::MemWrite {
                    addr,
                    val: change.new,
                },
            });
        }
        self.slots.set(Stage::Mem, Some(packet.clone()));
        self.slots.set(Stage::Wb, Some(packet));
    }

    /// Run the ALU phase, move the packet into MEM (again leaving a copy in
    /// place for the decode-stage scan of this cycle).
    fn stage_ex(&mut self) {
        let Some(mut packet) = self.slots.take(Stage::Ex) else {
            self.slots.set(Stage::Mem, None);
            return;
        };
        packet.advance();
        let instr = packet.instr;
        let mut pool = Pool::new(
            &self.slots,
            &self.regs,
            &self.dmem,
            &mut self.behaviors,
            self.cycle,
        );
        let result = instr.execute(&mut packet, &mut pool);
        debug_assert!(result.is_ok(), "stall raised outside decode");
        self.slots.set(Stage::Ex, Some(packet.clone()));
        self.slots.set(Stage::Mem, Some(packet));
    }

    /// Hazard-check and run the decode phase. On a stall the packet is held
    /// in ID for another attempt and EX receives a bubble; exactly one of
    /// {stall, advance} happens per cycle.
    fn stage_id(&mut self) -> bool {
        let Some(mut packet) = self.slots.take(Stage::Id) else {
            self.slots.set(Stage::Ex, None);
            return false;
        };
        // the packet re-enters here on a retry after a stall
        if packet.stage != Stage::Id {
            packet.advance();
        }
        let instr = packet.instr;
        let mut pool = Pool::new(
            &self.slots,
            &self.regs,
            &self.dmem,
            &mut self.behaviors,
            self.cycle,
        );
        let result = pool
            .check_stall(&packet)
            .and_then(|()| instr.execute(&mut packet, &mut pool));
        match result {
            Ok(()) => {
                self.slots.set(Stage::Ex, Some(packet));
                false
            }
            Err(stall) => {
                tracing::debug!(cycle = self.cycle, %stall, "decode stalls");
                let pc = packet.pc;
                self.slots.set(Stage::Ex, None);
                self.slots.set(Stage::Id, Some(packet));
                self.log(
                    pc,
                    BehaviorKind::Stall {
                        stage: Stage::Id,
                        reason: stall.to_string(),
                    },
                );
                true
            }
        }
    }

    /// Fetch the next instruction into ID. A taken branch that just left ID
    /// redirects the fetch of this very cycle; there is no delay slot and no
    /// wrong-path fetch. Out-of-range targets leave ID empty and the
    /// pipeline drains.
    fn stage_if(&mut self, stalled: bool) {
        if stalled {
            return;
        }
        let redirect = self
            .slots
            .get(Stage::Ex)
            .filter(|p| p.taken())
            .map(|p| (p.pc, p.npc));
        let target = if let Some((branch_pc, npc)) = redirect {
            tracing::debug!(from = %branch_pc, to = %npc, "taken branch redirects fetch");
            self.log(
                branch_pc,
                BehaviorKind::Branch {
                    target_pc: npc,
                    taken: true,
                },
            );
            npc
        } else {
            self.pc
        };
        self.pc = target;
        let offset = target.value().wrapping_sub(TEXT_BASE);
        let index = (offset / 4) as usize;
        match (target.value() >= TEXT_BASE).then(|| self.imem.word(index)).flatten() {
            Some(word) => {
                let instr = Instr::decode(word, target);
                self.slots.set(Stage::Id, Some(Packet::new(instr, target)));
                self.pc = target + 4;
            }
            None => self.slots.set(Stage::Id, None),
        }
    }

    fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.slots.get(stage).map(|p| StageStatus {
            cycle: self.cycle,
            pc: p.pc,
            stage,
            instr_name: p.instr.kind().name(),
            disasm: p.instr.disasm(),
            t_new: p.instr.remaining(stage),
            is_bubble: false,
        })
    }

    fn capture(&mut self) {
        let pipeline = PipelineView {
            if_: self.status(Stage::If),
            id: self.status(Stage::Id),
            ex: self.status(Stage::Ex),
            mem: self.status(Stage::Mem),
            wb: self.status(Stage::Wb),
        };
        self.history.push(Snapshot {
            cycle: self.cycle,
            pc: self.pc,
            gpr: self.regs.snapshot(),
            memory: self.dmem.snapshot(),
            pipeline,
            behaviors: self.behaviors.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(words: &[u32]) -> Cpu {
        let mut cpu = Cpu::new(Program::new(words.to_vec()));
        cpu.run(100);
        assert!(cpu.halted(), "program did not reach the halt sentinel");
        cpu
    }

    #[test]
    fn register_zero_is_immutable() {
        // ori $0, $0, 0xffff; add $1, $0, $0; halt
        let cpu = run(&[0x3400_ffff, 0x0000_0820, HALT_CODE]);
        assert_eq!(cpu.reg(0), Word::ZERO);
        assert_eq!(cpu.reg(1), Word::ZERO);
    }

    #[test]
    fn reg_writes_match_the_snapshot_they_appear_in() {
        // ori $1, $0, 5; ori $2, $0, 7; add $3, $1, $2; halt
        let cpu = run(&[0x3401_0005, 0x3402_0007, 0x0022_1820, HALT_CODE]);
        let mut seen = 0;
        for snap in cpu.history() {
            for behavior in &snap.behaviors {
                if let BehaviorKind::RegWrite { reg, val } = behavior.kind {
                    assert_eq!(snap.gpr[reg as usize], val);
                    seen += 1;
                }
            }
        }
        assert!(seen >= 3);
    }

    #[test]
    fn stall_and_advance_are_exclusive() {
        // lw $2, 0($0); add $3, $2, $2; halt  -- classic load-use stall
        let cpu = run(&[0x8c02_0000, 0x0042_1820, HALT_CODE]);
        let mut stalls = 0;
        for snap in cpu.history() {
            let stalled = snap
                .behaviors
                .iter()
                .any(|b| matches!(b.kind, BehaviorKind::Stall { .. }));
            if stalled {
                // a stall always leaves a bubble in EX
                assert!(snap.pipeline.ex.is_none());
                stalls += 1;
            }
        }
        assert_eq!(stalls, 1);
    }

    #[test]
    fn cycles_are_strictly_increasing() {
        let cpu = run(&[0x3401_0005, HALT_CODE]);
        for (i, snap) in cpu.history().iter().enumerate() {
            assert_eq!(snap.cycle, i as u64 + 1);
        }
    }

    #[test]
    fn step_after_halt_is_a_no_op() {
        let mut cpu = Cpu::new(Program::new(vec![HALT_CODE]));
        cpu.run(100);
        let cycles = cpu.cycle();
        cpu.step();
        assert_eq!(cpu.cycle(), cycles);
        assert_eq!(cpu.history().len() as u64, cycles);
    }

    #[test]
    fn out_of_range_fetch_drains_the_pipeline() {
        // no halt: the program just runs off the end
        let mut cpu = Cpu::new(Program::new(vec![0x3401_0005]));
        cpu.run(20);
        assert!(!cpu.halted());
        assert_eq!(cpu.reg(1), Word::new(5));
        let last = cpu.history().last().unwrap();
        assert!(last.pipeline.id.is_none() && last.pipeline.wb.is_none());
    }
}
