//! Observable micro-events produced while stepping: register and memory
//! writes, forwards, stalls and taken branches. Each carries the cycle and
//! the pc of the instruction it belongs to, and renders in the fixed textual
//! trace format.

use std::fmt;

use crate::isa::Word;
use crate::pipeline::Stage;

/// One log entry of the current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Behavior {
    pub cycle: u64,
    pub pc: Word,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub kind: BehaviorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "type"))]
pub enum BehaviorKind {
    /// WB committed a register value.
    RegWrite { reg: u8, val: Word },
    /// MEM committed a memory value.
    MemWrite { addr: Word, val: Word },
    /// An operand was delivered from an in-flight producer instead of the
    /// register file.
    Forward {
        reg: u8,
        val: Word,
        from_stage: Stage,
        to_stage: Stage,
    },
    /// ID held its instruction and injected a bubble into EX.
    Stall { stage: Stage, reason: String },
    /// ID resolved a taken branch; fetch was redirected.
    Branch { target_pc: Word, taken: bool },
    /// A stage held this instruction when the snapshot was taken.
    StageStatus(StageStatus),
}

/// Per-stage entry of the pipeline snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StageStatus {
    pub cycle: u64,
    pub pc: Word,
    pub stage: Stage,
    pub instr_name: &'static str,
    pub disasm: String,
    pub t_new: i32,
    pub is_bubble: bool,
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}: {}", self.pc, self.kind)
    }
}

impl fmt::Display for BehaviorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BehaviorKind::RegWrite { reg, val } => write!(f, "${reg:2} <= {val}"),
            BehaviorKind::MemWrite { addr, val } => write!(f, "*{addr} <= {val}"),
            BehaviorKind::Forward {
                reg,
                val,
                from_stage,
                to_stage,
            } => {
                write!(f, "{to_stage} <--(${reg:2}: {val})-- {from_stage}")
            }
            BehaviorKind::Stall { stage, .. } => {
                write!(f, "{stage} ---x--> {}", stage.succ())
            }
            BehaviorKind::Branch { target_pc, .. } => write!(f, "PC <= {target_pc}"),
            BehaviorKind::StageStatus(status) => {
                write!(
                    f,
                    "{}: [{}] (t_new={})",
                    status.stage, status.disasm, status.t_new
                )
            }
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{}: {}: [{}] (t_new={})",
            self.pc, self.stage, self.disasm, self.t_new
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(pc: u32, kind: BehaviorKind) -> Behavior {
        Behavior {
            cycle: 1,
            pc: Word::new(pc),
            kind,
        }
    }

    #[test]
    fn reg_write_form() {
        let b = at(
            0x3000,
            BehaviorKind::RegWrite {
                reg: 1,
                val: Word::new(5),
            },
        );
        assert_eq!(b.to_string(), "@00003000: $ 1 <= 00000005");
    }

    #[test]
    fn mem_write_form() {
        let b = at(
            0x3008,
            BehaviorKind::MemWrite {
                addr: Word::new(0x20),
                val: Word::new(0xbeef),
            },
        );
        assert_eq!(b.to_string(), "@00003008: *00000020 <= 0000beef");
    }

    #[test]
    fn forward_form() {
        let b = at(
            0x3008,
            BehaviorKind::Forward {
                reg: 2,
                val: Word::new(7),
                from_stage: Stage::Mem,
                to_stage: Stage::Ex,
            },
        );
        assert_eq!(b.to_string(), "@00003008: EX <--($ 2: 00000007)-- MEM");
    }

    #[test]
    fn stall_form() {
        let b = at(
            0x300c,
            BehaviorKind::Stall {
                stage: Stage::Id,
                reason: "hazard on $2: Tuse(1) < Tnew(2)".into(),
            },
        );
        assert_eq!(b.to_string(), "@0000300c: ID ---x--> EX");
    }

    #[test]
    fn branch_form() {
        let b = at(
            0x3008,
            BehaviorKind::Branch {
                target_pc: Word::new(0x3010),
                taken: true,
            },
        );
        assert_eq!(b.to_string(), "@00003008: PC <= 00003010");
    }

    #[test]
    fn stage_status_form() {
        let status = StageStatus {
            cycle: 3,
            pc: Word::new(0x3000),
            stage: Stage::Ex,
            instr_name: "ori",
            disasm: "ori $1, $0, 0x5".into(),
            t_new: 0,
            is_bubble: false,
        };
        assert_eq!(
            status.to_string(),
            "@00003000: EX: [ori $1, $0, 0x5] (t_new=0)"
        );
        // the same text when carried as a logged behavior
        let wrapped = at(0x3000, BehaviorKind::StageStatus(status));
        assert_eq!(
            wrapped.to_string(),
            "@00003000: EX: [ori $1, $0, 0x5] (t_new=0)"
        );
    }
}
