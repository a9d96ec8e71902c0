//! Opcode tables.
//!
//! Opcode numbering follows the GTA V PC release. Other editions reuse the
//! same logical set but renumber the raw bytes (RDR PC shuffles them, the
//! console builds keep the extended set unshuffled), so decoding goes
//! through an [`OpcodeSet`] picked once per run.

use crate::types::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    IAdd,
    ISub,
    IMul,
    IDiv,
    IMod,
    INot,
    INeg,
    IEq,
    INe,
    IGt,
    IGe,
    ILt,
    ILe,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMod,
    FNeg,
    FEq,
    FNe,
    FGt,
    FGe,
    FLt,
    FLe,
    VAdd,
    VSub,
    VMul,
    VDiv,
    VNeg,
    IAnd,
    IOr,
    IXor,
    IntToFloat,
    FloatToInt,
    FloatToVec,
    PushConstU8,
    PushConstU8U8,
    PushConstU8U8U8,
    PushConstU32,
    PushConstF,
    Dup,
    Drop,
    Native,
    Enter,
    Leave,
    Load,
    Store,
    StoreRev,
    LoadN,
    StoreN,
    ArrayU8,
    ArrayU8Load,
    ArrayU8Store,
    LocalU8,
    LocalU8Load,
    LocalU8Store,
    StaticU8,
    StaticU8Load,
    StaticU8Store,
    IAddU8,
    IMulU8,
    IOffset,
    IOffsetU8,
    IOffsetU8Load,
    IOffsetU8Store,
    PushConstS16,
    IAddS16,
    IMulS16,
    IOffsetS16,
    IOffsetS16Load,
    IOffsetS16Store,
    ArrayU16,
    ArrayU16Load,
    ArrayU16Store,
    LocalU16,
    LocalU16Load,
    LocalU16Store,
    StaticU16,
    StaticU16Load,
    StaticU16Store,
    GlobalU16,
    GlobalU16Load,
    GlobalU16Store,
    J,
    Jz,
    IEqJz,
    INeJz,
    IGtJz,
    IGeJz,
    ILtJz,
    ILeJz,
    Call,
    GlobalU24,
    GlobalU24Load,
    GlobalU24Store,
    PushConstU24,
    Switch,
    String,
    StringHash,
    TextLabelAssignString,
    TextLabelAssignInt,
    TextLabelAppendString,
    TextLabelAppendInt,
    TextLabelCopy,
    Catch,
    Throw,
    CallIndirect,
    PushConstM1,
    PushConst0,
    PushConst1,
    PushConst2,
    PushConst3,
    PushConst4,
    PushConst5,
    PushConst6,
    PushConst7,
    PushConstFM1,
    PushConstF0,
    PushConstF1,
    PushConstF2,
    PushConstF3,
    PushConstF4,
    PushConstF5,
    PushConstF6,
    PushConstF7,
    // Extended wide load/store family, RDR only.
    LocalLoadS,
    LocalStoreS,
    LocalStoreSr,
    StaticLoadS,
    StaticStoreS,
    StaticStoreSr,
    LoadNS,
    StoreNS,
    StoreNSr,
    GlobalLoadS,
    GlobalStoreS,
    GlobalStoreSr,
    /// Sentinel for raw bytes outside the edition's table.
    Last,
}

/// Operand byte count that follows an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLen {
    Fixed(usize),
    /// `1 + 6*count` (RDR: `2 + 6*count`); count lives in the payload.
    Switch,
    /// `4 + name_len` where `name_len` is the fifth operand byte.
    Enter,
}

impl Opcode {
    pub fn operand_len(self) -> OperandLen {
        use Opcode::*;
        match self {
            PushConstU8
            | ArrayU8 | ArrayU8Load | ArrayU8Store
            | LocalU8 | LocalU8Load | LocalU8Store
            | StaticU8 | StaticU8Load | StaticU8Store
            | IAddU8 | IMulU8
            | IOffsetU8 | IOffsetU8Load | IOffsetU8Store
            | TextLabelAssignString | TextLabelAssignInt
            | TextLabelAppendString | TextLabelAppendInt => OperandLen::Fixed(1),
            PushConstU8U8 => OperandLen::Fixed(2),
            PushConstU8U8U8 | Native => OperandLen::Fixed(3),
            PushConstU32 | PushConstF => OperandLen::Fixed(4),
            Leave => OperandLen::Fixed(2),
            PushConstS16
            | IAddS16 | IMulS16
            | IOffsetS16 | IOffsetS16Load | IOffsetS16Store
            | ArrayU16 | ArrayU16Load | ArrayU16Store
            | LocalU16 | LocalU16Load | LocalU16Store
            | StaticU16 | StaticU16Load | StaticU16Store
            | GlobalU16 | GlobalU16Load | GlobalU16Store
            | J | Jz | IEqJz | INeJz | IGtJz | IGeJz | ILtJz | ILeJz => OperandLen::Fixed(2),
            Call | GlobalU24 | GlobalU24Load | GlobalU24Store | PushConstU24 => {
                OperandLen::Fixed(3)
            }
            Switch => OperandLen::Switch,
            Enter => OperandLen::Enter,
            _ => OperandLen::Fixed(0),
        }
    }

    /// Value of an immediate integer push (`push_const_m1` .. `push_const_7`).
    pub fn imm_int_push(self) -> Option<i64> {
        let v = self as i16;
        let base = Opcode::PushConst0 as i16;
        if (Opcode::PushConstM1 as i16..=Opcode::PushConst7 as i16).contains(&v) {
            Some((v - base) as i64)
        } else {
            None
        }
    }

    /// Value of an immediate float push (`push_const_fm1` .. `push_const_f7`).
    pub fn imm_float_push(self) -> Option<f32> {
        let v = self as i16;
        let base = Opcode::PushConstF0 as i16;
        if (Opcode::PushConstFM1 as i16..=Opcode::PushConstF7 as i16).contains(&v) {
            Some((v - base) as f32)
        } else {
            None
        }
    }

    pub fn is_jump(self) -> bool {
        (self as u8) > (Opcode::GlobalU16Store as u8) && (self as u8) < (Opcode::Call as u8)
    }

    pub fn is_conditional_jump(self) -> bool {
        (self as u8) > (Opcode::J as u8) && (self as u8) < (Opcode::Call as u8)
    }

    /// Required operand type of the comparison folded into a fused
    /// compare-and-jump opcode.
    pub fn fused_compare_type(self) -> Option<DataType> {
        use Opcode::*;
        match self {
            IEqJz | INeJz | IGtJz | IGeJz | ILtJz | ILeJz => Some(DataType::Int),
            _ => None,
        }
    }
}

/// Pluggable raw-byte to opcode mapping, one implementation per edition.
pub trait OpcodeSet: Send + Sync {
    /// Exclusive upper bound on valid raw bytes.
    fn count(&self) -> usize;

    fn map(&self, raw: u8) -> Opcode;

    /// The RDR releases widen the switch case count to a u16 and extend the
    /// opcode table past the GTA V set.
    fn is_extended(&self) -> bool {
        self.count() > 127
    }
}

/// GTA V numbering (PC and console): raw bytes are the opcode ordinals.
pub struct VOpcodeSet;

impl OpcodeSet for VOpcodeSet {
    fn count(&self) -> usize {
        127
    }

    fn map(&self, raw: u8) -> Opcode {
        if (raw as usize) < self.count() {
            FLAT_TABLE[raw as usize]
        } else {
            Opcode::Last
        }
    }
}

/// RDR console builds carry the extended set, unshuffled.
pub struct RdrConsoleOpcodeSet;

impl OpcodeSet for RdrConsoleOpcodeSet {
    fn count(&self) -> usize {
        139
    }

    fn map(&self, raw: u8) -> Opcode {
        if (raw as usize) < self.count() {
            FLAT_TABLE[raw as usize]
        } else {
            Opcode::Last
        }
    }
}

/// RDR PC shuffles the raw numbering; this table is indexed by raw byte.
pub struct RdrOpcodeSet;

impl OpcodeSet for RdrOpcodeSet {
    fn count(&self) -> usize {
        139
    }

    fn map(&self, raw: u8) -> Opcode {
        if (raw as usize) < self.count() {
            RDR_REMAP[raw as usize]
        } else {
            Opcode::Last
        }
    }
}

/// Ordinal identity table shared by the unshuffled sets.
static FLAT_TABLE: [Opcode; 139] = {
    use Opcode::*;
    [
        Nop, IAdd, ISub, IMul, IDiv, IMod, INot, INeg, IEq, INe, IGt, IGe, ILt, ILe, FAdd, FSub,
        FMul, FDiv, FMod, FNeg, FEq, FNe, FGt, FGe, FLt, FLe, VAdd, VSub, VMul, VDiv, VNeg, IAnd,
        IOr, IXor, IntToFloat, FloatToInt, FloatToVec, PushConstU8, PushConstU8U8, PushConstU8U8U8,
        PushConstU32, PushConstF, Dup, Drop, Native, Enter, Leave, Load, Store, StoreRev, LoadN,
        StoreN, ArrayU8, ArrayU8Load, ArrayU8Store, LocalU8, LocalU8Load, LocalU8Store, StaticU8,
        StaticU8Load, StaticU8Store, IAddU8, IMulU8, IOffset, IOffsetU8, IOffsetU8Load,
        IOffsetU8Store, PushConstS16, IAddS16, IMulS16, IOffsetS16, IOffsetS16Load,
        IOffsetS16Store, ArrayU16, ArrayU16Load, ArrayU16Store, LocalU16, LocalU16Load,
        LocalU16Store, StaticU16, StaticU16Load, StaticU16Store, GlobalU16, GlobalU16Load,
        GlobalU16Store, J, Jz, IEqJz, INeJz, IGtJz, IGeJz, ILtJz, ILeJz, Call, GlobalU24,
        GlobalU24Load, GlobalU24Store, PushConstU24, Switch, String, StringHash,
        TextLabelAssignString, TextLabelAssignInt, TextLabelAppendString, TextLabelAppendInt,
        TextLabelCopy, Catch, Throw, CallIndirect, PushConstM1, PushConst0, PushConst1, PushConst2,
        PushConst3, PushConst4, PushConst5, PushConst6, PushConst7, PushConstFM1, PushConstF0,
        PushConstF1, PushConstF2, PushConstF3, PushConstF4, PushConstF5, PushConstF6, PushConstF7,
        LocalLoadS, LocalStoreS, LocalStoreSr, StaticLoadS, StaticStoreS, StaticStoreSr, LoadNS,
        StoreNS, StoreNSr, GlobalLoadS, GlobalStoreS, GlobalStoreSr,
    ]
};

/// Raw byte -> opcode for RDR PC, recovered from the shipped shuffle.
static RDR_REMAP: [Opcode; 139] = {
    use Opcode::*;
    [
        PushConst3,       // 0
        IGtJz,            // 1
        INe,              // 2
        IOffsetU8Store,   // 3
        LocalU16Store,    // 4
        VSub,             // 5
        IOffsetS16Load,   // 6
        GlobalU24Load,    // 7
        LocalLoadS,       // 8
        IAddU8,           // 9
        Load,             // 10
        ILt,              // 11
        IMul,             // 12
        PushConst0,       // 13
        PushConstF0,      // 14
        PushConst7,       // 15
        Dup,              // 16
        PushConstFM1,     // 17
        FloatToVec,       // 18
        LocalStoreS,      // 19
        LocalStoreSr,     // 20
        PushConstU8U8U8,  // 21
        CallIndirect,     // 22
        GlobalU16Store,   // 23
        PushConstM1,      // 24
        ArrayU16Store,    // 25
        PushConstS16,     // 26
        IDiv,             // 27
        ArrayU8Load,      // 28
        ILtJz,            // 29
        GlobalU16,        // 30
        INeJz,            // 31
        TextLabelAssignInt, // 32
        Store,            // 33
        Call,             // 34
        IntToFloat,       // 35
        IOr,              // 36
        FNeg,             // 37
        IOffsetS16,       // 38
        LocalU16Load,     // 39
        TextLabelAppendString, // 40
        PushConstF6,      // 41
        StaticLoadS,      // 42
        StaticStoreS,     // 43
        IAnd,             // 44
        PushConst2,       // 45
        PushConstU24,     // 46
        Throw,            // 47
        StaticU8Load,     // 48
        PushConstF4,      // 49
        FEq,              // 50
        FMul,             // 51
        PushConstF1,      // 52
        ILe,              // 53
        IAddS16,          // 54
        VDiv,             // 55
        LocalU16,         // 56
        FNe,              // 57
        StaticStoreSr,    // 58
        LoadNS,           // 59
        VMul,             // 60
        StoreNS,          // 61
        StringHash,       // 62
        PushConstF5,      // 63
        ArrayU16Load,     // 64
        GlobalU24Store,   // 65
        Jz,               // 66
        StoreN,           // 67
        FLe,              // 68
        StoreRev,         // 69
        FDiv,             // 70
        ArrayU8Store,     // 71
        TextLabelAppendInt, // 72
        PushConst6,       // 73
        StoreNSr,         // 74
        IXor,             // 75
        StaticU16Load,    // 76
        Nop,              // 77
        TextLabelAssignString, // 78
        ISub,             // 79
        PushConstU32,     // 80
        PushConstF3,      // 81
        GlobalLoadS,      // 82
        PushConst5,       // 83
        FSub,             // 84
        PushConstU8U8,    // 85
        GlobalU24,        // 86
        PushConstF7,      // 87
        VAdd,             // 88
        INot,             // 89
        FLt,              // 90
        IMulS16,          // 91
        Drop,             // 92
        IOffsetS16Store,  // 93
        StaticU16Store,   // 94
        Native,           // 95
        J,                // 96
        ArrayU8,          // 97
        PushConst1,       // 98
        IGeJz,            // 99
        IOffsetU8,        // 100
        IGt,              // 101
        Switch,           // 102
        PushConstF,       // 103
        FloatToInt,       // 104
        IAdd,             // 105
        IMulU8,           // 106
        Leave,            // 107
        PushConst4,       // 108
        TextLabelCopy,    // 109
        IOffsetU8Load,    // 110
        ArrayU16,         // 111
        LocalU8,          // 112
        GlobalStoreS,     // 113
        StaticU16,        // 114
        FAdd,             // 115
        String,           // 116
        Catch,            // 117
        ILeJz,            // 118
        StaticU8,         // 119
        INeg,             // 120
        VNeg,             // 121
        PushConstF2,      // 122
        StaticU8Store,    // 123
        IMod,             // 124
        IOffset,          // 125
        GlobalU16Load,    // 126
        LocalU8Store,     // 127
        PushConstU8,      // 128
        IEqJz,            // 129
        FGe,              // 130
        FGt,              // 131
        GlobalStoreSr,    // 132
        IGe,              // 133
        Enter,            // 134
        FMod,             // 135
        LocalU8Load,      // 136
        LoadN,            // 137
        IEq,              // 138
    ]
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_set_is_identity_over_its_range() {
        let set = VOpcodeSet;
        assert_eq!(set.map(0), Opcode::Nop);
        assert_eq!(set.map(45), Opcode::Enter);
        assert_eq!(set.map(46), Opcode::Leave);
        assert_eq!(set.map(98), Opcode::Switch);
        assert_eq!(set.map(126), Opcode::PushConstF7);
        assert_eq!(set.map(127), Opcode::Last);
        assert_eq!(set.map(0xff), Opcode::Last);
    }

    #[test]
    fn rdr_remap_is_a_permutation() {
        let set = RdrOpcodeSet;
        let mut seen = std::collections::HashSet::new();
        for raw in 0..139u8 {
            let op = set.map(raw);
            assert_ne!(op, Opcode::Last);
            assert!(seen.insert(op as u8), "raw {raw} duplicates {op:?}");
        }
        assert_eq!(set.map(95), Opcode::Native);
        assert_eq!(set.map(134), Opcode::Enter);
        assert_eq!(set.map(107), Opcode::Leave);
    }

    #[test]
    fn immediate_push_values() {
        assert_eq!(Opcode::PushConstM1.imm_int_push(), Some(-1));
        assert_eq!(Opcode::PushConst5.imm_int_push(), Some(5));
        assert_eq!(Opcode::PushConstFM1.imm_float_push(), Some(-1.0));
        assert_eq!(Opcode::PushConstF7.imm_float_push(), Some(7.0));
        assert_eq!(Opcode::IAdd.imm_int_push(), None);
    }

    #[test]
    fn jump_classification() {
        assert!(Opcode::J.is_jump());
        assert!(!Opcode::J.is_conditional_jump());
        assert!(Opcode::Jz.is_conditional_jump());
        assert!(Opcode::ILeJz.is_conditional_jump());
        assert!(!Opcode::Call.is_jump());
        assert!(!Opcode::GlobalU16Store.is_jump());
    }
}
