//! Per-function decompilation.
//!
//! Every function runs two passes over the same instruction list. The
//! inference pass executes the stack machine symbolically to type frame
//! variables, statics, callee signatures and native descriptors; it emits
//! nothing. The emission pass runs the machine again, this time rendering
//! statements and rebuilding `if`/`else`/`while`/`switch` structure from
//! the jump graph via a [`PathArena`].
//!
//! Refinements that cross the function boundary (statics, natives, other
//! functions' signatures) are returned as [`TypeUpdate`]s; the script
//! driver applies them and re-runs inference on affected functions until
//! the type assignment stops moving.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::codepath::{PathArena, PathId, PathKind};
use crate::error::{DecompileError, Result, StackError};
use crate::hashes::literal_int;
use crate::instruction::{CodeFormat, Instruction, decode_at};
use crate::natives::NativeTable;
use crate::opcodes::Opcode;
use crate::stack::{FuncSnapshot, Stack, TypeUpdate, VarRef, VarScope};
use crate::strings::StringTable;
use crate::types::DataType;
use crate::vars::{ListKind, Var, VarTable};
use crate::{IntStyle, Options, Services};

/// Read-only script surroundings a function needs while decompiling:
/// the string and native tables, snapshots of every function's current
/// signature and the entry-offset index used to resolve call targets.
pub struct ScriptContext<'a> {
    pub services: &'a Services,
    pub opts: &'a Options,
    pub fmt: CodeFormat,
    pub strings: &'a StringTable,
    pub natives: &'a NativeTable,
    pub functions: &'a [FuncSnapshot],
    pub by_location: &'a HashMap<usize, usize>,
}

impl ScriptContext<'_> {
    fn callee(&self, target: usize, caller: &str, offset: usize) -> Result<&FuncSnapshot> {
        let index = self
            .by_location
            .get(&target)
            .ok_or_else(|| DecompileError::UnresolvableJumpTarget {
                function: caller.to_string(),
                offset,
                target,
            })?;
        Ok(&self.functions[*index])
    }
}

pub struct Function {
    pub index: usize,
    pub name: String,
    pub pcount: usize,
    pub vcount: usize,
    pub rcount: usize,
    /// First code byte of the function body within the whole code segment.
    pub location: usize,
    pub max_location: usize,
    /// The function's slice of the code segment, starting at its ENTER.
    pub code: Vec<u8>,
    pub params: VarTable,
    pub vars: VarTable,
    pub return_type: DataType,
    pub native_count: usize,
    pub native_xrefs: HashSet<u64>,
    pub callees: HashSet<usize>,
    pub dirty: bool,
    pub pre_decoded: bool,
    pub is_aggregate: bool,
    instructions: Vec<Instruction>,
    instruction_map: HashMap<usize, usize>,
    body: String,
    pub line_count: usize,
}

impl Function {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        name: String,
        pcount: usize,
        vcount: usize,
        rcount: usize,
        location: usize,
        max_location: usize,
        code: Vec<u8>,
        is_aggregate: bool,
    ) -> Self {
        Function {
            index,
            name,
            pcount,
            vcount,
            rcount,
            location,
            max_location,
            code,
            params: VarTable::new(ListKind::Params, pcount, is_aggregate),
            // The first two frame slots past the parameters are the saved
            // frame and return address.
            vars: VarTable::new(ListKind::Vars, vcount.saturating_sub(2), is_aggregate),
            return_type: DataType::Unk,
            native_count: 0,
            native_xrefs: HashSet::new(),
            callees: HashSet::new(),
            dirty: false,
            pre_decoded: false,
            is_aggregate,
            instructions: Vec::new(),
            instruction_map: HashMap::new(),
            body: String::new(),
            line_count: 0,
        }
    }

    /// Current view of this function's signature as callers see it.
    pub fn snapshot(&self) -> FuncSnapshot {
        FuncSnapshot {
            index: self.index,
            name: self.name.clone(),
            pcount: self.pcount,
            rcount: self.rcount,
            param_types: (0..self.pcount).map(|i| self.params.type_at(i)).collect(),
            return_type: self.return_type,
            is_current: false,
        }
    }

    pub fn apply_param_type(&mut self, param: usize, ty: DataType) -> bool {
        self.params.set_type_at(param, ty)
    }

    pub fn raise_return_type(&mut self, ty: DataType) -> bool {
        if !ty.is_unknown() && self.return_type.precedence() < ty.precedence() {
            self.return_type = ty;
            true
        } else {
            false
        }
    }

    pub fn uses_native(&self, hash: u64) -> bool {
        self.native_xrefs.contains(&hash)
    }

    /// Walk the code block once, decoding instructions and building the
    /// byte-offset index. Two compiler artifacts are cleaned up on the way:
    /// short-circuit conditionals compile to `DUP; (NOP|INOT)*; JZ` and are
    /// collapsed, and unconditional jumps that leave the block (tail calls
    /// into the next function) are replaced by no-ops.
    pub fn find_instructions(&mut self, ctx: &ScriptContext<'_>) -> Result<()> {
        let set = ctx.opts.edition.opcode_set();
        let fmt = ctx.fmt;
        self.instructions.clear();
        self.instruction_map.clear();

        let name_len = *self
            .code
            .get(4)
            .ok_or(DecompileError::TruncatedImage { context: "function entry frame" })?
            as usize;
        let mut pos = name_len + 5;

        while pos < self.code.len() {
            match set.map(self.code[pos]) {
                Opcode::Enter => {
                    return Err(DecompileError::UnexpectedInstruction {
                        function: self.name.clone(),
                        offset: pos,
                        what: "nested function entry",
                    });
                }
                Opcode::Dup => {
                    let mut off = 1usize;
                    loop {
                        match self.code.get(pos + off).map(|&b| set.map(b)) {
                            Some(Opcode::Nop) | Some(Opcode::INot) => off += 1,
                            Some(Opcode::Jz) => {
                                // The duplicate only feeds the fused
                                // conditional; skip the whole pattern.
                                pos = pos + off + 3;
                                break;
                            }
                            _ => {
                                self.instructions
                                    .push(Instruction::new(Opcode::Dup, Vec::new(), pos));
                                pos += 1;
                                break;
                            }
                        }
                    }
                }
                Opcode::J => {
                    let (ins, next) = decode_at(&self.code, pos, set, fmt)?;
                    let target = ins.jump_target(fmt);
                    if target > 0 && (target as usize) < self.code.len() {
                        self.add_instruction(ins);
                    } else {
                        for k in 0..3 {
                            self.add_instruction(Instruction::new(Opcode::Nop, Vec::new(), pos + k));
                        }
                    }
                    pos = next;
                }
                _ => {
                    let (ins, next) = decode_at(&self.code, pos, set, fmt)?;
                    self.add_instruction(ins);
                    pos = next;
                }
            }
        }
        Ok(())
    }

    fn add_instruction(&mut self, ins: Instruction) {
        self.instruction_map.insert(ins.offset(), self.instructions.len());
        self.instructions.push(ins);
    }

    /// Type-inference pass. Returns the refinements that touch state
    /// outside this function.
    pub fn infer(&mut self, ctx: &ScriptContext<'_>, statics: &mut VarTable) -> Result<Vec<TypeUpdate>> {
        let Function {
            ref instructions,
            ref mut params,
            ref mut vars,
            ref mut return_type,
            ref mut native_xrefs,
            ref mut callees,
            ref name,
            index,
            pcount,
            is_aggregate,
            ..
        } = *self;

        let pass = InferPass {
            ctx,
            fmt: ctx.fmt,
            stack: Stack::new(ctx.services, ctx.opts.clone(), true, is_aggregate),
            tables: Tables { params, vars, statics },
            return_type,
            native_xrefs,
            callees,
            func_index: index,
            pcount,
            name,
            outward: Vec::new(),
        };
        pass.run(instructions)
    }

    /// Emission pass: renders the body text. Inference must have run first
    /// so variable names and declarations are stable.
    pub fn emit(&mut self, ctx: &ScriptContext<'_>, statics: &mut VarTable) -> Result<()> {
        let code_len = self.code.len();
        let Function {
            ref mut instructions,
            ref instruction_map,
            ref mut params,
            ref mut vars,
            ref mut return_type,
            ref mut native_count,
            ref name,
            index,
            pcount,
            rcount,
            is_aggregate,
            ..
        } = *self;

        let mut arena = PathArena::new();
        let outer = arena.new_main(code_len as i64, -1);
        let pass = EmitPass {
            ctx,
            fmt: ctx.fmt,
            stack: Stack::new(ctx.services, ctx.opts.clone(), false, is_aggregate),
            out: Emitter::new(),
            arena,
            outer,
            offset: 0,
            instructions,
            instruction_map,
            tables: Tables { params, vars, statics },
            return_type,
            native_count,
            func_index: index,
            pcount,
            rcount,
            name,
            is_aggregate,
        };
        let (body, line_count) = pass.run(ctx.opts.declare_variables)?;
        self.body = body;
        self.line_count = line_count;
        Ok(())
    }

    pub fn first_line(&self, opts: &Options) -> String {
        let ret = match self.rcount {
            0 => "void ".to_string(),
            1 => self.return_type.return_type(),
            3 => "Vector3 ".to_string(),
            n => {
                if self.return_type == DataType::String {
                    format!("char[{}] ", n * 4)
                } else {
                    format!("struct<{n}> ")
                }
            }
        };
        let name: &str = if self.is_aggregate { "func_" } else { &self.name };
        let position = if opts.show_func_position {
            format!("//Position - 0x{:X}", self.location)
        } else {
            String::new()
        };
        format!("{ret}{name}({}){position}", self.params.param_declaration(opts))
    }

    /// Full text of the decompiled function.
    pub fn text(&self, opts: &Options) -> String {
        let body = if self.return_type == DataType::Bool {
            self.body
                .replace("return 0;", "return false;")
                .replace("return 1;", "return true;")
        } else {
            self.body.clone()
        };
        format!("{}\n{}", self.first_line(opts), body)
    }

    pub fn render(&mut self, opts: &Options) -> String {
        self.line_count += 2;
        self.text(opts)
    }

    /// Re-run emission with script-specific identifiers genericized; the
    /// result feeds cross-script deduplication. The function's own rendered
    /// state is left untouched.
    pub fn stateless_render(
        &mut self,
        ctx: &ScriptContext<'_>,
        statics: &mut VarTable,
    ) -> Result<String> {
        let saved_body = std::mem::take(&mut self.body);
        let saved_lines = self.line_count;
        let saved_natives = self.native_count;
        self.is_aggregate = true;
        let result = self
            .emit(ctx, statics)
            .map(|()| format!("{}\n{}", self.first_line(ctx.opts), self.body));
        self.is_aggregate = false;
        self.body = saved_body;
        self.line_count = saved_lines;
        self.native_count = saved_natives;
        result
    }
}

/// The three variable stores an executing function can touch.
struct Tables<'f> {
    params: &'f mut VarTable,
    vars: &'f mut VarTable,
    statics: &'f mut VarTable,
}

impl Tables<'_> {
    fn table(&self, scope: VarScope) -> &VarTable {
        match scope {
            VarScope::Params => self.params,
            VarScope::Locals => self.vars,
            VarScope::Statics => self.statics,
        }
    }

    fn var_mut(&mut self, scope: VarScope, index: usize) -> &mut Var {
        match scope {
            VarScope::Params => self.params.var_at(index),
            VarScope::Locals => self.vars.var_at(index),
            VarScope::Statics => self.statics.var_at(index),
        }
    }

    fn var_ref(&mut self, scope: VarScope, index: usize) -> VarRef {
        let var = self.var_mut(scope, index);
        VarRef {
            scope,
            index,
            ty: var.datatype(),
            immediate_size: var.immediate_size,
        }
    }

    fn type_of(&self, scope: VarScope, index: usize) -> DataType {
        self.table(scope).type_at(index)
    }

    fn is_array(&self, var: &VarRef) -> bool {
        self.table(var.scope)
            .get(var.index)
            .map(|v| v.is_array())
            .unwrap_or(false)
    }
}

/// Raw frame index to owning table. Slots `pcount` and `pcount + 1` hold
/// the saved frame and return address and are never addressed directly.
fn frame_slot(
    pcount: usize,
    raw: usize,
    function: &str,
    offset: usize,
) -> Result<(VarScope, usize)> {
    if raw < pcount {
        Ok((VarScope::Params, raw))
    } else if raw < pcount + 2 {
        Err(DecompileError::UnexpectedInstruction {
            function: function.to_string(),
            offset,
            what: "reserved frame slot access",
        })
    } else {
        Ok((VarScope::Locals, raw - 2 - pcount))
    }
}

fn compare_op(op: Opcode) -> &'static str {
    match op {
        Opcode::IEq | Opcode::FEq | Opcode::IEqJz => "==",
        Opcode::INe | Opcode::FNe | Opcode::INeJz => "!=",
        Opcode::IGt | Opcode::FGt | Opcode::IGtJz => ">",
        Opcode::IGe | Opcode::FGe | Opcode::IGeJz => ">=",
        Opcode::ILt | Opcode::FLt | Opcode::ILtJz => "<",
        _ => "<=",
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

struct InferPass<'c, 'f> {
    ctx: &'f ScriptContext<'c>,
    fmt: CodeFormat,
    stack: Stack<'c>,
    tables: Tables<'f>,
    return_type: &'f mut DataType,
    native_xrefs: &'f mut HashSet<u64>,
    callees: &'f mut HashSet<usize>,
    func_index: usize,
    pcount: usize,
    name: &'f str,
    outward: Vec<TypeUpdate>,
}

impl InferPass<'_, '_> {
    fn run(mut self, instructions: &[Instruction]) -> Result<Vec<TypeUpdate>> {
        for ins in instructions {
            self.step(ins)?;
            self.apply_stack_updates();
        }
        self.tables.vars.check_vars();
        self.tables.params.check_vars();
        Ok(self.outward)
    }

    fn err(&self, e: StackError, offset: usize) -> DecompileError {
        e.at(self.name, offset)
    }

    /// Apply the stack's queued refinements to the tables this pass owns;
    /// everything else is handed outward for the script driver.
    fn apply_stack_updates(&mut self) {
        for update in self.stack.take_updates() {
            match update {
                TypeUpdate::Var { scope, index, ty } => match scope {
                    VarScope::Locals => {
                        self.tables.vars.set_type_at(index, ty);
                    }
                    VarScope::Params => {
                        self.tables.params.set_type_at(index, ty);
                    }
                    VarScope::Statics => {
                        if self.tables.statics.set_type_at(index, ty) {
                            self.outward.push(update);
                        }
                    }
                },
                TypeUpdate::FunctionReturn { function, ty } => {
                    self.raise_function_return(function, ty);
                }
                TypeUpdate::FunctionParam { .. } => self.outward.push(update),
                TypeUpdate::NativeParam { hash, param, ty } => {
                    if self.ctx.services.natives.update_param(hash, param, ty) {
                        self.outward.push(update);
                    }
                }
                TypeUpdate::NativeReturn { hash, ty } => {
                    if self.ctx.services.natives.update_return(hash, ty) {
                        self.outward.push(update);
                    }
                }
            }
        }
    }

    fn raise_function_return(&mut self, function: usize, ty: DataType) {
        if function == self.func_index {
            if self.return_type.precedence() < ty.precedence() {
                *self.return_type = ty;
                self.outward.push(TypeUpdate::FunctionReturn { function, ty });
            }
        } else {
            let current = self
                .ctx
                .functions
                .get(function)
                .map(|f| f.return_type)
                .unwrap_or(DataType::Unk);
            if current.precedence() < ty.precedence() {
                self.outward.push(TypeUpdate::FunctionReturn { function, ty });
            }
        }
    }

    fn function_return_type(&self, function: usize) -> DataType {
        if function == self.func_index {
            *self.return_type
        } else {
            self.ctx
                .functions
                .get(function)
                .map(|f| f.return_type)
                .unwrap_or(DataType::Unk)
        }
    }

    fn set_function_return(&mut self, function: usize, ty: DataType) {
        if function == self.func_index {
            *self.return_type = ty;
        } else {
            self.outward.push(TypeUpdate::FunctionReturn { function, ty });
        }
    }

    /// Push the declared type of an opcode operand onto whatever backs the
    /// stack slots at `index..index + count`.
    fn check_instruction(&mut self, index: usize, ty: DataType, count: usize, function_pars: bool) {
        if ty == DataType::Unk {
            return;
        }
        for i in 0..count {
            let slot = index + i;
            if let Some(var) = self.stack.peek_var(slot) {
                if self.stack.is_literal(slot) || self.stack.is_pointer(slot) {
                    let current = self.tables.type_of(var.scope, var.index);
                    if ty.precedence() < current.precedence() {
                        continue;
                    }
                    if ty == DataType::StringPtr && self.stack.is_pointer(index + 1) {
                        self.tables
                            .var_mut(var.scope, var.index)
                            .set_datatype(DataType::String);
                    } else if function_pars
                        && self.stack.is_pointer(slot)
                        && ty.base_type() != DataType::Unk
                    {
                        self.tables
                            .var_mut(var.scope, var.index)
                            .set_datatype(ty.base_type());
                    } else if !function_pars {
                        self.tables.var_mut(var.scope, var.index).set_datatype(ty);
                    }
                    continue;
                }
            }
            if let Some(func) = self.stack.peek_func(slot) {
                let current = self.function_return_type(func.index);
                if ty.precedence() < current.precedence() {
                    continue;
                }
                if ty == DataType::StringPtr && self.stack.is_pointer(index + 1) {
                    self.set_function_return(func.index, DataType::String);
                } else {
                    self.set_function_return(func.index, ty);
                }
                continue;
            }
            if let Some(hash) = self.stack.peek_native(slot) {
                if self.ctx.services.natives.update_return(hash, ty) {
                    self.outward.push(TypeUpdate::NativeReturn { hash, ty });
                }
            }
        }
    }

    /// Text-label variant: a pointer operand of a matching size becomes a
    /// `char[]` buffer, a literal becomes a `char*`.
    fn check_instruction_string(&mut self, index: usize, strsize: i64, count: usize) {
        for i in 0..count {
            let slot = index + i;
            if let Some(var) = self.stack.peek_var(slot) {
                if self.stack.is_literal(slot) || self.stack.is_pointer(slot) {
                    if self.stack.is_pointer(slot) {
                        let v = self.tables.var_mut(var.scope, var.index);
                        if v.immediate_size == 1 || v.immediate_size as i64 == strsize / 4 {
                            v.set_datatype(DataType::String);
                            v.immediate_size = (strsize / 8) as usize;
                        }
                    } else {
                        self.tables
                            .var_mut(var.scope, var.index)
                            .set_datatype(DataType::StringPtr);
                    }
                    continue;
                }
            }
            if let Some(hash) = self.stack.peek_native(slot) {
                if self
                    .ctx
                    .services
                    .natives
                    .update_return(hash, DataType::StringPtr)
                {
                    self.outward
                        .push(TypeUpdate::NativeReturn { hash, ty: DataType::StringPtr });
                }
            }
        }
    }

    fn set_immediate(&mut self, size: usize) {
        if let Some(var) = self.stack.peek_var(0) {
            if self.stack.is_pointer(0) {
                let v = self.tables.var_mut(var.scope, var.index);
                if v.datatype() == DataType::String {
                    if v.immediate_size != size {
                        v.immediate_size = size;
                        v.make_struct();
                    }
                } else {
                    v.immediate_size = size;
                    v.make_struct();
                }
            }
        }
    }

    fn check_immediate(&mut self, size: usize) {
        if let Some(var) = self.stack.peek_var(0) {
            if self.stack.is_pointer(0) {
                let v = self.tables.var_mut(var.scope, var.index);
                if v.immediate_size < size {
                    v.immediate_size = size;
                }
                v.make_struct();
            }
        }
    }

    fn check_array(&mut self, width: u32, size: i64) {
        if let Some(var) = self.stack.peek_var(0) {
            if self.stack.is_pointer(0) {
                let v = self.tables.var_mut(var.scope, var.index);
                if v.value < size {
                    v.value = size;
                }
                v.immediate_size = width as usize;
                v.make_array();
            }
        }
        self.check_instruction(1, DataType::Int, 1, false);
    }

    fn set_array(&mut self, ty: DataType) {
        if ty == DataType::Unk {
            return;
        }
        if let Some(var) = self.stack.peek_var(0) {
            if self.stack.is_pointer(0) {
                self.tables.var_mut(var.scope, var.index).set_datatype(ty);
            }
        }
    }

    fn push_frame_pointer(&mut self, raw: usize, offset: usize) -> Result<()> {
        let (scope, index) = frame_slot(self.pcount, raw, self.name, offset)?;
        let var = self.tables.var_ref(scope, index);
        let name = self.tables.table(scope).name(index, self.ctx.opts);
        self.stack.push_p_var(&name, var, "");
        self.tables.var_mut(scope, index).mark_called();
        Ok(())
    }

    fn push_frame_value(&mut self, raw: usize, offset: usize) -> Result<()> {
        let (scope, index) = frame_slot(self.pcount, raw, self.name, offset)?;
        let var = self.tables.var_ref(scope, index);
        let name = self.tables.table(scope).name(index, self.ctx.opts);
        self.stack.push_var(&name, var);
        self.tables.var_mut(scope, index).mark_called();
        Ok(())
    }

    fn frame_store(&mut self, ins: &Instruction) -> Result<()> {
        let off = ins.offset();
        let raw = ins.operands_as_uint(self.fmt) as usize;
        let (scope, index) = frame_slot(self.pcount, raw, self.name, off)?;
        let top = self.stack.top_type();
        if top != DataType::Unk {
            if top.precedence() > self.tables.type_of(scope, index).precedence() {
                self.tables.var_mut(scope, index).set_datatype(top);
            }
        } else {
            let current = self.tables.type_of(scope, index);
            self.check_instruction(0, current, 1, false);
        }
        let _ = self.stack.pop();
        if self.stack.top_type() == DataType::Int {
            let lit = self.stack.pop().as_literal().map_err(|e| self.err(e, off))?;
            if raw > self.pcount {
                if let Some(n) = literal_int(&lit, self.ctx.opts.int_style) {
                    self.tables.var_mut(scope, index).value = n as i64;
                }
            }
        } else {
            self.stack.drop_value();
        }
        self.tables.var_mut(scope, index).mark_called();
        Ok(())
    }

    fn static_store(&mut self, ins: &Instruction) {
        let index = ins.operands_as_uint(self.fmt) as usize;
        let top = self.stack.top_type();
        if top != DataType::Unk {
            if self.tables.statics.set_type_at(index, top) {
                self.outward.push(TypeUpdate::Var {
                    scope: VarScope::Statics,
                    index,
                    ty: top,
                });
            }
        } else {
            let current = self.tables.statics.type_at(index);
            self.check_instruction(0, current, 1, false);
        }
        self.stack.drop_value();
    }

    fn push_static_pointer(&mut self, index: usize) {
        let var = {
            let v = self.tables.statics.var_at_fixed(index);
            VarRef {
                scope: VarScope::Statics,
                index,
                ty: v.datatype(),
                immediate_size: v.immediate_size,
            }
        };
        let name = self.tables.statics.name(index, self.ctx.opts);
        self.stack.push_p_var(&name, var, "");
    }

    fn push_static_value(&mut self, index: usize) {
        let var = {
            let v = self.tables.statics.var_at_fixed(index);
            VarRef {
                scope: VarScope::Statics,
                index,
                ty: v.datatype(),
                immediate_size: v.immediate_size,
            }
        };
        let name = self.tables.statics.name(index, self.ctx.opts);
        self.stack.push_var(&name, var);
    }

    /// A constant stack-slot count rendered somewhere above the current
    /// instruction; `LOAD_N`/`STORE_N`/array opcodes need it back as a
    /// number.
    fn peeked_int(&self, index: usize) -> Option<i64> {
        let item = self.stack.peek_item(index);
        literal_int(&item, self.ctx.opts.int_style)
            .map(|n| n as i64)
            .or_else(|| item.trim().parse().ok())
    }

    fn step(&mut self, ins: &Instruction) -> Result<()> {
        use Opcode::*;
        let fmt = self.fmt;
        let off = ins.offset();
        match ins.opcode() {
            Nop => {}

            IAdd => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.op_add().map_err(|e| self.err(e, off))?;
            }
            ISub => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.op_sub().map_err(|e| self.err(e, off))?;
            }
            IMul => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.op_mult().map_err(|e| self.err(e, off))?;
            }
            IDiv => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.op_div().map_err(|e| self.err(e, off))?;
            }
            IMod => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.op_mod().map_err(|e| self.err(e, off))?;
            }
            INot => {
                self.check_instruction(0, DataType::Bool, 1, false);
                self.stack.op_not().map_err(|e| self.err(e, off))?;
            }
            INeg => {
                self.check_instruction(0, DataType::Int, 1, false);
                self.stack.op_neg().map_err(|e| self.err(e, off))?;
            }
            FAdd => {
                self.check_instruction(0, DataType::Float, 2, false);
                self.stack.op_addf().map_err(|e| self.err(e, off))?;
            }
            FSub => {
                self.check_instruction(0, DataType::Float, 2, false);
                self.stack.op_subf().map_err(|e| self.err(e, off))?;
            }
            FMul => {
                self.check_instruction(0, DataType::Float, 2, false);
                self.stack.op_multf().map_err(|e| self.err(e, off))?;
            }
            FDiv => {
                self.check_instruction(0, DataType::Float, 2, false);
                self.stack.op_divf().map_err(|e| self.err(e, off))?;
            }
            FMod => {
                self.check_instruction(0, DataType::Float, 2, false);
                self.stack.op_modf().map_err(|e| self.err(e, off))?;
            }
            FNeg => {
                self.check_instruction(0, DataType::Float, 1, false);
                self.stack.op_negf().map_err(|e| self.err(e, off))?;
            }

            // The inference pass only cares about operand typing, so every
            // comparison collapses to the same stack effect.
            IEq | INe | IGt | IGe | ILt | ILe => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.op_cmp("==").map_err(|e| self.err(e, off))?;
            }
            FEq | FNe | FGt | FGe | FLt | FLe => {
                self.check_instruction(0, DataType::Float, 2, false);
                self.stack.op_cmp("==").map_err(|e| self.err(e, off))?;
            }

            VAdd => self.stack.op_vadd().map_err(|e| self.err(e, off))?,
            VSub => self.stack.op_vsub().map_err(|e| self.err(e, off))?,
            VMul => self.stack.op_vmult().map_err(|e| self.err(e, off))?,
            VDiv => self.stack.op_vdiv().map_err(|e| self.err(e, off))?,
            VNeg => self.stack.op_vneg().map_err(|e| self.err(e, off))?,

            IAnd => self.stack.op_and().map_err(|e| self.err(e, off))?,
            IOr => self.stack.op_or().map_err(|e| self.err(e, off))?,
            IXor => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.op_xor().map_err(|e| self.err(e, off))?;
            }
            IntToFloat => {
                self.check_instruction(0, DataType::Int, 1, false);
                self.stack.op_itof().map_err(|e| self.err(e, off))?;
            }
            FloatToInt => {
                self.check_instruction(0, DataType::Float, 1, false);
                self.stack.op_ftoi().map_err(|e| self.err(e, off))?;
            }
            FloatToVec => {
                self.check_instruction(0, DataType::Float, 1, false);
                self.stack.op_fto_v();
            }

            PushConstU8 => self.stack.push_int(ins.operand(0) as i64),
            PushConstU8U8 => {
                self.stack.push_int(ins.operand(0) as i64);
                self.stack.push_int(ins.operand(1) as i64);
            }
            PushConstU8U8U8 => {
                self.stack.push_int(ins.operand(0) as i64);
                self.stack.push_int(ins.operand(1) as i64);
                self.stack.push_int(ins.operand(2) as i64);
            }
            PushConstU32 | PushConstU24 | PushConstS16 => {
                self.stack.push(ins.operands_as_int(fmt).to_string(), DataType::Int);
            }
            PushConstF => self.stack.push_float(ins.float(fmt)),

            Dup => self.stack.dup(),
            Drop => {
                self.stack.drop_value();
            }

            Native => {
                let hash = self.ctx.natives.hash_at(ins.native_index())?;
                self.native_xrefs.insert(hash);
                let snapshot = self.ctx.services.natives.snapshot(
                    hash,
                    ins.native_param_count(),
                    ins.native_return_count(),
                    false,
                );
                let name = self
                    .ctx
                    .services
                    .natives
                    .display_name(hash, self.ctx.opts.uppercase_natives);
                self.stack
                    .native_call(
                        &snapshot,
                        &name,
                        ins.native_param_count(),
                        ins.native_return_count(),
                    )
                    .map_err(|e| self.err(e, off))?;
            }

            Enter => {
                return Err(DecompileError::UnexpectedInstruction {
                    function: self.name.to_string(),
                    offset: off,
                    what: "nested function entry",
                });
            }
            Leave => {
                self.stack
                    .pop_list_for_call(ins.operand(1) as usize)
                    .map_err(|e| self.err(e, off))?;
            }

            Load => self.stack.op_ref_get().map_err(|e| self.err(e, off))?,
            Store => {
                if self.stack.peek_var(1).is_none() {
                    self.stack.drop_value();
                    self.stack.drop_value();
                } else if self.stack.top_type() == DataType::Int {
                    let lit = self.stack.pop().as_literal().map_err(|e| self.err(e, off))?;
                    if let Some(n) = literal_int(&lit, self.ctx.opts.int_style) {
                        if let Some(var) = self.stack.peek_var(0) {
                            self.tables.var_mut(var.scope, var.index).value = n as i64;
                        }
                    }
                } else {
                    self.stack.drop_value();
                }
            }
            StoreRev => {
                if self.stack.peek_var(1).is_none() {
                    self.stack.drop_value();
                } else if self.stack.top_type() == DataType::Int {
                    let lit = self.stack.pop().as_literal().map_err(|e| self.err(e, off))?;
                    if let Some(n) = literal_int(&lit, self.ctx.opts.int_style) {
                        if let Some(var) = self.stack.peek_var(0) {
                            self.tables.var_mut(var.scope, var.index).value = n as i64;
                        }
                    }
                }
            }
            LoadN => {
                let count = self.peeked_int(1).ok_or_else(|| {
                    self.err(StackError::Unexpected("non-constant stack load count"), off)
                })?;
                self.set_immediate(count as usize);
                self.stack.op_to_stack().map_err(|e| self.err(e, off))?;
            }
            StoreN => {
                let count = self.peeked_int(1).ok_or_else(|| {
                    self.err(StackError::Unexpected("non-constant stack store count"), off)
                })?;
                self.set_immediate(count as usize);
                self.stack.op_from_stack().map_err(|e| self.err(e, off))?;
            }

            ArrayU8 | ArrayU16 => {
                let size = self.peeked_int(1).unwrap_or(-1);
                self.check_array(ins.operands_as_uint(fmt), size);
                self.stack
                    .op_array_get_p(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
            }
            ArrayU8Load | ArrayU16Load => {
                let size = self.peeked_int(1).unwrap_or(-1);
                self.check_array(ins.operands_as_uint(fmt), size);
                self.stack
                    .op_array_get(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
            }
            ArrayU8Store | ArrayU16Store => {
                let size = self.peeked_int(1).unwrap_or(-1);
                self.check_array(ins.operands_as_uint(fmt), size);
                self.set_array(self.stack.item_type(2));
                if let Some(var) = self.stack.peek_var(0) {
                    if self.stack.is_pointer(0) {
                        let ty = self.tables.type_of(var.scope, var.index);
                        self.check_instruction(2, ty, 1, false);
                    }
                }
                self.stack
                    .op_array_set(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
            }

            LocalU8 | LocalU16 => {
                self.push_frame_pointer(ins.operands_as_uint(fmt) as usize, off)?;
            }
            LocalU8Load | LocalU16Load => {
                self.push_frame_value(ins.operands_as_uint(fmt) as usize, off)?;
            }
            LocalU8Store | LocalU16Store => self.frame_store(ins)?,

            StaticU8 | StaticU16 => {
                self.push_static_pointer(ins.operands_as_uint(fmt) as usize);
            }
            StaticU8Load | StaticU16Load => {
                self.push_static_value(ins.operands_as_uint(fmt) as usize);
            }
            StaticU8Store | StaticU16Store => self.static_store(ins),

            // The compiler only ever emits these against struct offsets,
            // so the multiply form types the same way as the add form.
            IAddU8 | IAddS16 | IMulU8 | IMulS16 => {
                self.check_instruction(0, DataType::Int, 1, false);
                self.stack
                    .op_add_imm(ins.operands_as_int(fmt))
                    .map_err(|e| self.err(e, off))?;
            }
            IOffset => self.stack.op_get_imm_p_dyn().map_err(|e| self.err(e, off))?,
            IOffsetU8 | IOffsetS16 => {
                self.check_immediate(ins.operands_as_uint(fmt) as usize + 1);
                self.stack
                    .op_get_imm_p(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
            }
            IOffsetU8Load | IOffsetS16Load => {
                self.check_immediate(ins.operands_as_uint(fmt) as usize + 1);
                self.stack
                    .op_get_imm(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
            }
            IOffsetU8Store | IOffsetS16Store => {
                self.check_immediate(ins.operands_as_uint(fmt) as usize + 1);
                self.stack
                    .op_set_imm(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
            }

            GlobalU16 | GlobalU24 => {
                if self.stack.is_aggregate() {
                    self.stack.push_pointer("Global_");
                } else {
                    self.stack
                        .push_pointer(format!("Global_{}", ins.operands_as_uint(fmt)));
                }
            }
            GlobalU16Load | GlobalU24Load => {
                if self.stack.is_aggregate() {
                    self.stack.push("Global_", DataType::Unk);
                } else {
                    self.stack
                        .push(format!("Global_{}", ins.operands_as_uint(fmt)), DataType::Unk);
                }
            }
            GlobalU16Store | GlobalU24Store => {
                if self.stack.is_aggregate() {
                    self.stack.push("Global_", DataType::Unk);
                } else {
                    self.stack
                        .op_set(&format!("Global_{}", ins.operands_as_uint(fmt)))
                        .map_err(|e| self.err(e, off))?;
                }
            }

            J => {}
            Jz => {
                self.check_instruction(0, DataType::Bool, 1, false);
                self.stack.drop_value();
            }
            IEqJz | INeJz | IGtJz | IGeJz | ILtJz | ILeJz => {
                self.check_instruction(0, DataType::Int, 2, false);
                self.stack.drop_value();
                self.stack.drop_value();
            }

            Call => {
                let target = ins.operands_as_int(fmt) as usize;
                let callee = self.ctx.callee(target, self.name, off)?.clone();
                for j in 0..callee.pcount {
                    let slot = callee.pcount - j - 1;
                    let declared = callee.param_types.get(j).copied().unwrap_or(DataType::Unk);
                    self.check_instruction(slot, declared, 1, true);
                }
                self.callees.insert(callee.index);
                let mut snapshot = callee;
                snapshot.is_current = snapshot.index == self.func_index;
                self.stack
                    .function_call(&snapshot)
                    .map_err(|e| self.err(e, off))?;
            }

            Switch => {
                let count = if fmt.extended { 2 } else { 1 };
                self.check_instruction(0, DataType::Int, count, false);
            }

            String => {
                let _ = self.stack.pop();
                self.stack.push_string_literal("");
            }
            StringHash => {
                self.check_instruction(0, DataType::StringPtr, 1, false);
                self.stack.op_hash().map_err(|e| self.err(e, off))?;
            }
            TextLabelAssignString => {
                let size = ins.operand(0) as i64;
                self.check_instruction_string(0, size, 2);
                self.stack
                    .op_str_cpy(size as usize)
                    .map_err(|e| self.err(e, off))?;
            }
            TextLabelAssignInt => {
                let size = ins.operand(0) as i64;
                self.check_instruction_string(0, size, 1);
                self.check_instruction(1, DataType::Int, 1, false);
                self.stack
                    .op_itos(size as usize)
                    .map_err(|e| self.err(e, off))?;
            }
            TextLabelAppendString => {
                let size = ins.operand(0) as i64;
                self.check_instruction_string(0, size, 2);
                self.stack
                    .op_str_add(size as usize)
                    .map_err(|e| self.err(e, off))?;
            }
            TextLabelAppendInt => {
                let size = ins.operand(0) as i64;
                self.check_instruction_string(0, size, 1);
                self.check_instruction(1, DataType::Int, 1, false);
                self.stack
                    .op_str_add_i(size as usize)
                    .map_err(|e| self.err(e, off))?;
            }
            TextLabelCopy => {
                self.stack.op_memcopy().map_err(|e| self.err(e, off))?;
            }

            Catch | Throw => {}
            CallIndirect => {
                self.stack.pcall().map_err(|e| self.err(e, off))?;
            }

            PushConstM1 | PushConst0 | PushConst1 | PushConst2 | PushConst3 | PushConst4
            | PushConst5 | PushConst6 | PushConst7 => self.stack.push_int(ins.imm_int_push()),
            PushConstFM1 | PushConstF0 | PushConstF1 | PushConstF2 | PushConstF3 | PushConstF4
            | PushConstF5 | PushConstF6 | PushConstF7 => {
                self.stack.push_float(ins.imm_float_push())
            }

            LocalLoadS | LocalStoreS | LocalStoreSr | StaticLoadS | StaticStoreS
            | StaticStoreSr | LoadNS | StoreNS | StoreNSr | GlobalLoadS | GlobalStoreS
            | GlobalStoreSr => {
                if !fmt.extended {
                    return Err(DecompileError::UnexpectedInstruction {
                        function: self.name.to_string(),
                        offset: off,
                        what: "extended opcode outside an extended edition",
                    });
                }
            }

            Last => {
                return Err(DecompileError::UnknownOpcode { raw: 0xff, offset: off });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Indented line writer. `write_else` buffers a pending `else` so that a
/// following conditional can merge into `else if`.
struct Emitter {
    buf: String,
    tabs: String,
    write_else: bool,
    line_count: usize,
}

impl Emitter {
    fn new() -> Self {
        Emitter {
            buf: String::new(),
            tabs: String::new(),
            write_else: false,
            line_count: 0,
        }
    }

    fn raw_line(&mut self, line: &str) {
        let text = format!("{}{}", self.tabs, line);
        self.buf.push_str(text.trim_end());
        self.buf.push('\n');
        self.line_count += 1;
    }

    fn write_line(&mut self, line: &str) {
        if self.write_else {
            self.write_else = false;
            self.raw_line("else");
            self.open_tab(true);
        }
        self.raw_line(line);
    }

    fn open_tab(&mut self, write: bool) {
        if write {
            self.write_line("{");
        }
        self.tabs.push('\t');
    }

    fn close_tab(&mut self, write: bool) {
        self.tabs.pop();
        if write {
            self.write_line("}");
        }
    }
}

struct EmitPass<'c, 'f> {
    ctx: &'f ScriptContext<'c>,
    fmt: CodeFormat,
    stack: Stack<'c>,
    out: Emitter,
    arena: PathArena,
    outer: PathId,
    /// Index into `instructions`, not a byte offset.
    offset: usize,
    instructions: &'f mut Vec<Instruction>,
    instruction_map: &'f HashMap<usize, usize>,
    tables: Tables<'f>,
    return_type: &'f mut DataType,
    native_count: &'f mut usize,
    func_index: usize,
    pcount: usize,
    rcount: usize,
    name: &'f str,
    is_aggregate: bool,
}

impl EmitPass<'_, '_> {
    fn run(mut self, declare_variables: bool) -> Result<(String, usize)> {
        self.out.open_tab(true);
        if declare_variables {
            let decls = self.tables.vars.declarations(self.ctx.opts);
            if !decls.is_empty() {
                for decl in &decls {
                    self.out.write_line(decl);
                }
                self.out.write_line("");
            }
        }

        while self.offset < self.instructions.len() {
            self.decode_instruction()?;
        }

        // Close anything the last instruction left open; a switch that runs
        // to the end of the function never sees its break offset.
        while let Some(parent) = self.arena.parent(self.outer) {
            if self.arena.node(parent).kind == PathKind::Main {
                break;
            }
            if self.arena.is_switch(self.outer) {
                self.out.close_tab(false);
            }
            self.out.close_tab(true);
            self.outer = parent;
        }
        self.out.close_tab(true);

        Ok((self.out.buf, self.out.line_count))
    }

    fn err(&self, e: StackError, offset: usize) -> DecompileError {
        e.at(self.name, offset)
    }

    fn cur_offset(&self) -> usize {
        self.instructions[self.offset].offset()
    }

    fn global_name(&self, ins: &Instruction) -> String {
        if self.is_aggregate {
            "Global".to_string()
        } else if self.ctx.opts.hex_index {
            format!("Global_{:X}", ins.operands_as_uint(self.fmt))
        } else {
            format!("Global_{}", ins.operands_as_uint(self.fmt))
        }
    }

    fn case_label(&self, ins: &Instruction, index: usize) -> String {
        let raw = ins.switch_case_value(index, self.fmt);
        match self.ctx.opts.int_style {
            IntStyle::Uint => self
                .ctx
                .services
                .hashes
                .reverse_unsigned(raw as u32, "", self.ctx.opts),
            _ => self.ctx.services.hashes.reverse(raw as i32, "", self.ctx.opts),
        }
    }

    fn case_comment(&self, label: &str) -> String {
        match literal_int(label, self.ctx.opts.int_style) {
            Some(n) => self.ctx.services.gxt.entry_comment(n, false, self.ctx.opts),
            None => String::new(),
        }
    }

    fn frame_var(&mut self, raw: usize, offset: usize) -> Result<(String, VarRef)> {
        let (scope, index) = frame_slot(self.pcount, raw, self.name, offset)?;
        let var = self.tables.var_ref(scope, index);
        let name = self.tables.table(scope).name(index, self.ctx.opts);
        Ok((name, var))
    }

    fn static_var(&mut self, index: usize) -> (String, VarRef) {
        let var = {
            let v = self.tables.statics.var_at_fixed(index);
            VarRef {
                scope: VarScope::Statics,
                index,
                ty: v.datatype(),
                immediate_size: v.immediate_size,
            }
        };
        let name = self.tables.statics.name(index, self.ctx.opts);
        (name, var)
    }

    /// Store through a named variable, with bool literal fixup. Array
    /// element stores are silenced; they were already rendered through the
    /// array opcodes.
    fn write_var_store(&mut self, name: &str, var: &VarRef, offset: usize) -> Result<()> {
        let line = self
            .stack
            .op_set_var(name, var)
            .map_err(|e| self.err(e, offset))?;
        let line = if self.tables.type_of(var.scope, var.index) == DataType::Bool {
            line.replace("= 0;", "= false;").replace("= 1;", "= true;")
        } else {
            line
        };
        if !self.tables.is_array(var) {
            self.out.write_line(&line);
        }
        Ok(())
    }

    fn return_check(&mut self, text: &str) {
        if self.rcount != 1 {
            return;
        }
        if matches!(
            *self.return_type,
            DataType::Float | DataType::Int | DataType::Bool
        ) {
            return;
        }
        if text.ends_with('f') && text.len() > 1 {
            *self.return_type = DataType::Float;
        } else if literal_int(text, self.ctx.opts.int_style).is_some() {
            *self.return_type = DataType::Int;
        } else if text.starts_with("joaat(") {
            *self.return_type = DataType::Int;
        } else if let Some(rest) = text.strip_prefix("func_") {
            // Adopt an already-decompiled callee's concrete return type.
            let callee = rest
                .split('(')
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|&n| n != self.func_index)
                .and_then(|n| self.ctx.functions.get(n));
            if let Some(snap) = callee {
                if matches!(
                    snap.return_type,
                    DataType::Int | DataType::Float | DataType::Bool
                ) {
                    *self.return_type = snap.return_type;
                }
            }
        } else {
            *self.return_type = DataType::Unsure;
        }
    }

    // ---- structuring ----

    fn is_new_code_path(&self) -> bool {
        let node = self.arena.node(self.outer);
        if node.kind != PathKind::Switch && node.parent.is_some() && node.end_offset >= 0 {
            if self.instruction_map.get(&(node.end_offset as usize)) == Some(&self.offset) {
                return true;
            }
        }
        if let Some(switch) = &node.switch {
            if let Some(&first) = switch.offsets.first() {
                return self.cur_offset() as i64 == first;
            }
        }
        false
    }

    fn handle_new_path(&mut self) {
        loop {
            let cur = self.cur_offset() as i64;
            let node = self.arena.node(self.outer);

            if node.kind != PathKind::Switch && cur == node.end_offset {
                let closed = self.outer;
                if let Some(parent) = self.arena.parent(closed) {
                    self.arena.detach(closed);
                    self.outer = parent;
                    self.out.close_tab(true);
                    continue;
                }
            }

            if node.kind == PathKind::Switch {
                let first = node.switch.as_ref().and_then(|s| s.offsets.first().copied());
                if let Some(first) = first {
                    if cur == first {
                        let remaining =
                            node.switch.as_ref().map(|s| s.offsets.len()).unwrap_or(0);
                        if remaining == 1 {
                            // Only the break offset is left: the switch ends.
                            let (defaulted, escaped) = node
                                .switch
                                .as_ref()
                                .map(|s| {
                                    (
                                        s.has_defaulted,
                                        s.escaped_cases
                                            .get(&s.active_offset)
                                            .copied()
                                            .unwrap_or(false),
                                    )
                                })
                                .unwrap_or((false, false));
                            if defaulted && !escaped {
                                self.out.write_line("break;");
                            }
                            if let Some(s) = self.arena.node_mut(self.outer).switch.as_mut() {
                                s.has_defaulted = false;
                                s.active_offset = -1;
                            }
                            self.out.close_tab(false);
                            let closed = self.outer;
                            if let Some(parent) = self.arena.parent(closed) {
                                self.arena.detach(closed);
                                self.outer = parent;
                            }
                            self.out.close_tab(true);
                            continue;
                        }

                        let labels = node
                            .switch
                            .as_ref()
                            .and_then(|s| s.cases.get(&first))
                            .cloned()
                            .unwrap_or_default();
                        self.out.close_tab(false);
                        for label in &labels {
                            if label == "default" {
                                if let Some(s) = self.arena.node_mut(self.outer).switch.as_mut() {
                                    s.has_defaulted = true;
                                }
                                self.out.write_line("default:");
                            } else {
                                let comment = self.case_comment(label);
                                self.out.write_line(&format!("case {label}:{comment}"));
                            }
                        }
                        self.out.open_tab(false);
                        if let Some(s) = self.arena.node_mut(self.outer).switch.as_mut() {
                            s.active_offset = first;
                            s.offsets.remove(0);
                        }
                        continue;
                    }
                }
            }
            break;
        }
    }

    fn handle_jump(&mut self) -> Result<()> {
        let ins = self.instructions[self.offset].clone();
        let target = ins.jump_target(self.fmt);

        loop {
            let node = self.arena.node(self.outer);
            if node.kind != PathKind::Switch {
                break;
            }
            if node.break_offset == target {
                let escaped = node
                    .switch
                    .as_ref()
                    .map(|s| s.escaped_cases.get(&s.active_offset).copied().unwrap_or(false))
                    .unwrap_or(false);
                if !escaped {
                    self.out.write_line("break;");
                    if let Some(s) = self.arena.node_mut(self.outer).switch.as_mut() {
                        s.has_defaulted = false;
                    }
                }
                return Ok(());
            }
            // A jump straight out of the switch; resolve it against the
            // enclosing path instead.
            match self.arena.parent(self.outer) {
                Some(parent) => self.outer = parent,
                None => break,
            }
        }

        let Some(next) = self.instructions.get(self.offset + 1) else {
            return Ok(());
        };
        let next_offset = next.offset() as i64;

        if next_offset == self.arena.node(self.outer).end_offset {
            if target == next_offset {
                return Ok(());
            }
            if ins.is_while_jump(self.fmt) {
                return Err(DecompileError::UnexpectedInstruction {
                    function: self.name.to_string(),
                    offset: ins.offset(),
                    what: "loop back edge at a conditional boundary",
                });
            }
            // The if-block ends here and skips over more code: that code is
            // the else branch.
            let closed = self.outer;
            if let Some(parent) = self.arena.parent(closed) {
                self.arena.detach(closed);
                self.outer = self.arena.create_child(parent, PathKind::Else, target, -1);
                self.out.close_tab(true);
                self.out.write_else = true;
            }
            return Ok(());
        }

        // Scan forward over dead filler; a jump over real code is one the
        // structurer failed to place, so surface it in the output.
        let mut ahead = 0usize;
        loop {
            let Some(scan) = self.instructions.get(self.offset + 1 + ahead) else {
                break;
            };
            if target == scan.offset() as i64 {
                break;
            }
            match scan.opcode() {
                Opcode::Nop => ahead += 1,
                Opcode::J if scan.operands_as_int(self.fmt) == 0 => ahead += 1,
                _ => {
                    if ins.operands_as_int(self.fmt) != 0 {
                        let cur = ins.offset();
                        debug!(function = self.name, offset = cur, target, "unstructured jump");
                        self.out
                            .write_line(&format!("Jump @{target}; //curOff = {cur}"));
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn check_conditional(&mut self) -> Result<()> {
        let ins = self.instructions[self.offset].clone();
        let off = ins.offset();
        let raw = self.stack.pop().as_literal().map_err(|e| self.err(e, off))?;
        let cond = if raw.starts_with('(') && raw.ends_with(')') {
            raw
        } else {
            format!("({raw})")
        };
        let target = ins.jump_target(self.fmt);

        // Conditional jump to an enclosing loop's end: a break.
        let mut walk = Some(self.outer);
        while let Some(id) = walk {
            let node = self.arena.node(id);
            if node.kind == PathKind::While && target == node.end_offset {
                self.out.write_line(&format!("if {cond}"));
                self.out.open_tab(false);
                self.out.write_line("break;");
                self.out.close_tab(false);
                return Ok(());
            }
            walk = node.parent;
        }

        let target_index =
            self.instruction_map
                .get(&(target as usize))
                .copied()
                .ok_or_else(|| DecompileError::UnresolvableJumpTarget {
                    function: self.name.to_string(),
                    offset: off,
                    target: target as usize,
                })?;
        let back_index = target_index.checked_sub(1).ok_or_else(|| {
            DecompileError::UnresolvableJumpTarget {
                function: self.name.to_string(),
                offset: off,
                target: target as usize,
            }
        })?;

        let is_loop = {
            let back = &self.instructions[back_index];
            back.is_while_jump(self.fmt) && back.jump_target(self.fmt) < off as i64
        };
        if is_loop {
            self.instructions[back_index].nop_out();
            let cond = if cond == "(1)" { "(true)".to_string() } else { cond };
            self.out.write_line(&format!("while {cond}"));
            self.outer = self.arena.create_child(self.outer, PathKind::While, target, -1);
            self.out.open_tab(true);
            return Ok(());
        }

        let mut written = false;
        if self.out.write_else {
            let end = self.arena.node(self.outer).end_offset;
            let mut else_if = end == target;
            if !else_if {
                let back = &self.instructions[back_index];
                if back.opcode() == Opcode::J && end == back.jump_target(self.fmt) {
                    else_if = true;
                }
            }
            if else_if {
                self.out.write_else = false;
                let closed = self.outer;
                if let Some(parent) = self.arena.parent(closed) {
                    self.arena.detach(closed);
                    self.outer = self.arena.create_child(parent, PathKind::If, target, -1);
                    self.out.write_line(&format!("else if {cond}"));
                    self.out.open_tab(true);
                    written = true;
                }
            }
        }
        if !written {
            self.out.write_line(&format!("if {cond}"));
            self.outer = self.arena.create_child(self.outer, PathKind::If, target, -1);
            self.out.open_tab(true);
        }
        Ok(())
    }

    fn handle_switch(&mut self) -> Result<()> {
        let fmt = self.fmt;
        let ins = self.instructions[self.offset].clone();
        let off = ins.offset();

        // The compiler emits the default/fallthrough jump right after the
        // table, possibly behind padding.
        let mut pad = 0usize;
        while self
            .instructions
            .get(self.offset + 1 + pad)
            .map(|i| i.opcode())
            == Some(Opcode::Nop)
        {
            pad += 1;
        }
        let default_index = self.offset + 1 + pad;
        let default_target = self
            .instructions
            .get(default_index)
            .filter(|i| i.opcode().is_jump())
            .map(|i| i.jump_target(fmt))
            .ok_or_else(|| DecompileError::UnexpectedInstruction {
                function: self.name.to_string(),
                offset: off,
                what: "switch without a default jump",
            })?;

        let mut cases: HashMap<i64, Vec<std::string::String>> = HashMap::new();
        let mut order: Vec<i64> = Vec::new();
        for i in 0..ins.switch_case_count(fmt) {
            let label = self.case_label(&ins, i);
            let target = ins.switch_target(i, fmt);
            match cases.entry(target) {
                Entry::Occupied(mut e) => e.get_mut().push(label),
                Entry::Vacant(e) => {
                    e.insert(vec![label]);
                    order.push(target);
                }
            }
        }

        let mut sorted: Vec<i64> = cases.keys().copied().collect();
        sorted.sort_unstable();

        self.instructions[default_index].nop_out();

        // Find the break offset: the last case body that ends in a forward
        // jump names it. A body jumping to the default target means the
        // default offset is reachable by fallthrough, not a real case.
        let mut break_target = default_target;
        let mut use_default = true;
        for i in 0..=sorted.len() {
            let key = if i == sorted.len() { default_target } else { sorted[i] };
            let Some(&idx) = self.instruction_map.get(&(key as usize)) else {
                continue;
            };
            let Some(prev) = idx.checked_sub(1) else { continue };
            if prev.checked_sub(1) == Some(self.offset) {
                continue;
            }
            let before = &self.instructions[prev];
            if before.opcode() != Opcode::J {
                continue;
            }
            let t = before.jump_target(fmt);
            if t == default_target {
                use_default = false;
                break_target = default_target;
                break;
            }
            break_target = t;
        }

        if use_default {
            match cases.entry(default_target) {
                Entry::Occupied(mut e) => e.get_mut().push("default".to_string()),
                Entry::Vacant(e) => {
                    e.insert(vec!["default".to_string()]);
                    order.push(default_target);
                    sorted.push(default_target);
                }
            }
        }

        let Some(&first) = sorted.first() else {
            return Err(DecompileError::UnexpectedInstruction {
                function: self.name.to_string(),
                offset: off,
                what: "switch with no cases",
            });
        };

        // RDR shipped its tables pre-sorted; GTA V keeps table order.
        let offsets = if fmt.extended {
            let mut o: Vec<i64> = cases.keys().copied().collect();
            o.sort_unstable();
            o
        } else {
            order
        };

        let parent = self.outer;
        self.outer = self
            .arena
            .create_switch(parent, cases.clone(), offsets, -1, break_target);

        let selector = self.stack.pop().as_literal().map_err(|e| self.err(e, off))?;
        self.out.write_line(&format!("switch ({selector})"));
        self.out.open_tab(true);
        for label in cases.get(&first).cloned().unwrap_or_default() {
            if label == "default" {
                if let Some(s) = self.arena.node_mut(self.outer).switch.as_mut() {
                    s.has_defaulted = true;
                }
                self.out.write_line("default:");
            } else {
                let comment = self.case_comment(&label);
                self.out.write_line(&format!("case {label}:{comment}"));
            }
        }
        self.out.open_tab(false);
        if let Some(s) = self.arena.node_mut(self.outer).switch.as_mut() {
            s.active_offset = first;
            s.cases.remove(&first);
            s.offsets.retain(|&o| o != first);
        }
        Ok(())
    }

    // ---- the dispatch ----

    fn decode_instruction(&mut self) -> Result<()> {
        use Opcode::*;
        if self.is_new_code_path() {
            self.handle_new_path();
        }

        let ins = self.instructions[self.offset].clone();
        let fmt = self.fmt;
        let off = ins.offset();
        match ins.opcode() {
            Nop => {}

            IAdd => self.stack.op_add().map_err(|e| self.err(e, off))?,
            ISub => self.stack.op_sub().map_err(|e| self.err(e, off))?,
            IMul => self.stack.op_mult().map_err(|e| self.err(e, off))?,
            IDiv => self.stack.op_div().map_err(|e| self.err(e, off))?,
            IMod => self.stack.op_mod().map_err(|e| self.err(e, off))?,
            INot => self.stack.op_not().map_err(|e| self.err(e, off))?,
            INeg => self.stack.op_neg().map_err(|e| self.err(e, off))?,
            FAdd => self.stack.op_addf().map_err(|e| self.err(e, off))?,
            FSub => self.stack.op_subf().map_err(|e| self.err(e, off))?,
            FMul => self.stack.op_multf().map_err(|e| self.err(e, off))?,
            FDiv => self.stack.op_divf().map_err(|e| self.err(e, off))?,
            FMod => self.stack.op_modf().map_err(|e| self.err(e, off))?,
            FNeg => self.stack.op_negf().map_err(|e| self.err(e, off))?,
            op @ (IEq | INe | IGt | IGe | ILt | ILe | FEq | FNe | FGt | FGe | FLt | FLe) => {
                self.stack
                    .op_cmp(compare_op(op))
                    .map_err(|e| self.err(e, off))?;
            }
            VAdd => self.stack.op_vadd().map_err(|e| self.err(e, off))?,
            VSub => self.stack.op_vsub().map_err(|e| self.err(e, off))?,
            VMul => self.stack.op_vmult().map_err(|e| self.err(e, off))?,
            VDiv => self.stack.op_vdiv().map_err(|e| self.err(e, off))?,
            VNeg => self.stack.op_vneg().map_err(|e| self.err(e, off))?,
            IAnd => self.stack.op_and().map_err(|e| self.err(e, off))?,
            IOr => self.stack.op_or().map_err(|e| self.err(e, off))?,
            IXor => self.stack.op_xor().map_err(|e| self.err(e, off))?,
            IntToFloat => self.stack.op_itof().map_err(|e| self.err(e, off))?,
            FloatToInt => self.stack.op_ftoi().map_err(|e| self.err(e, off))?,
            FloatToVec => self.stack.op_fto_v(),

            PushConstU8 => self.stack.push_int(ins.operand(0) as i64),
            PushConstU8U8 => {
                self.stack.push_int(ins.operand(0) as i64);
                self.stack.push_int(ins.operand(1) as i64);
            }
            PushConstU8U8U8 => {
                self.stack.push_int(ins.operand(0) as i64);
                self.stack.push_int(ins.operand(1) as i64);
                self.stack.push_int(ins.operand(2) as i64);
            }
            PushConstU32 | PushConstU24 => {
                let text = match self.ctx.opts.int_style {
                    IntStyle::Uint => self.ctx.services.hashes.reverse_unsigned(
                        ins.operands_as_uint(fmt),
                        "",
                        self.ctx.opts,
                    ),
                    _ => self.ctx.services.hashes.reverse(
                        ins.operands_as_int(fmt) as i32,
                        "",
                        self.ctx.opts,
                    ),
                };
                self.stack.push(text, DataType::Int);
            }
            PushConstS16 => self.stack.push_int(ins.operands_as_int(fmt)),
            PushConstF => self.stack.push_float(ins.float(fmt)),

            Dup => self.stack.dup(),
            Drop => {
                if let Some(line) = self.stack.drop_value() {
                    self.out.write_line(&line);
                }
            }

            Native => {
                let hash = self.ctx.natives.hash_at(ins.native_index())?;
                let snapshot = self.ctx.services.natives.snapshot(
                    hash,
                    ins.native_param_count(),
                    ins.native_return_count(),
                    !self.is_aggregate,
                );
                *self.native_count += 1;
                let name = self
                    .ctx
                    .services
                    .natives
                    .display_name(hash, self.ctx.opts.uppercase_natives);
                let line = self
                    .stack
                    .native_call(
                        &snapshot,
                        &name,
                        ins.native_param_count(),
                        ins.native_return_count(),
                    )
                    .map_err(|e| self.err(e, off))?;
                if !line.is_empty() {
                    self.out.write_line(&line);
                }
            }

            Enter => {
                return Err(DecompileError::UnexpectedInstruction {
                    function: self.name.to_string(),
                    offset: off,
                    what: "nested function entry",
                });
            }
            Leave => {
                if self.arena.is_switch(self.outer) {
                    if let Some(s) = self.arena.node_mut(self.outer).switch.as_mut() {
                        let active = s.active_offset;
                        s.escaped_cases.insert(active, true);
                    }
                }
                let count = ins.operand(1) as usize;
                let ty = if count == 1 { self.stack.top_type() } else { DataType::Unk };
                let text = self
                    .stack
                    .pop_list_for_call(count)
                    .map_err(|e| self.err(e, off))?;
                match count {
                    0 => {
                        if self.offset < self.instructions.len() - 1 {
                            self.out.write_line("return;");
                        }
                    }
                    1 => {
                        match ty {
                            DataType::Bool
                            | DataType::Float
                            | DataType::StringPtr
                            | DataType::Int => *self.return_type = ty,
                            _ => self.return_check(&text),
                        }
                        self.out.write_line(&format!("return {text};"));
                    }
                    _ => {
                        if self.stack.top_type() == DataType::String {
                            *self.return_type = DataType::String;
                        }
                        self.out.write_line(&format!("return {text};"));
                    }
                }
            }

            Load => self.stack.op_ref_get().map_err(|e| self.err(e, off))?,
            Store => {
                let silent = self
                    .stack
                    .peek_var(1)
                    .map(|v| self.tables.is_array(&v))
                    .unwrap_or(false);
                let line = self.stack.op_ref_set().map_err(|e| self.err(e, off))?;
                if !silent {
                    self.out.write_line(&line);
                }
            }
            StoreRev => {
                let silent = self
                    .stack
                    .peek_var(1)
                    .map(|v| self.tables.is_array(&v))
                    .unwrap_or(false);
                let line = self.stack.op_peek_set().map_err(|e| self.err(e, off))?;
                if !silent {
                    self.out.write_line(&line);
                }
            }
            LoadN => self.stack.op_to_stack().map_err(|e| self.err(e, off))?,
            StoreN => {
                let line = self.stack.op_from_stack().map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }

            ArrayU8 | ArrayU16 => self
                .stack
                .op_array_get_p(ins.operands_as_uint(fmt))
                .map_err(|e| self.err(e, off))?,
            ArrayU8Load | ArrayU16Load => self
                .stack
                .op_array_get(ins.operands_as_uint(fmt))
                .map_err(|e| self.err(e, off))?,
            ArrayU8Store | ArrayU16Store => {
                let line = self
                    .stack
                    .op_array_set(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }

            LocalU8 | LocalU16 => {
                let (name, var) = self.frame_var(ins.operands_as_uint(fmt) as usize, off)?;
                self.stack.push_p_var(&name, var, "");
            }
            LocalU8Load | LocalU16Load => {
                let (name, var) = self.frame_var(ins.operands_as_uint(fmt) as usize, off)?;
                self.stack.push_var(&name, var);
            }
            LocalU8Store | LocalU16Store => {
                let (name, var) = self.frame_var(ins.operands_as_uint(fmt) as usize, off)?;
                self.write_var_store(&name, &var, off)?;
            }

            StaticU8 | StaticU16 => {
                let (name, var) = self.static_var(ins.operands_as_uint(fmt) as usize);
                self.stack.push_p_var(&name, var, "");
            }
            StaticU8Load | StaticU16Load => {
                let (name, var) = self.static_var(ins.operands_as_uint(fmt) as usize);
                self.stack.push_var(&name, var);
            }
            StaticU8Store | StaticU16Store => {
                let (name, var) = self.static_var(ins.operands_as_uint(fmt) as usize);
                self.write_var_store(&name, &var, off)?;
            }

            IAddU8 | IAddS16 => self
                .stack
                .op_add_imm(ins.operands_as_int(fmt))
                .map_err(|e| self.err(e, off))?,
            IMulU8 | IMulS16 => self
                .stack
                .op_mult_imm(ins.operands_as_int(fmt))
                .map_err(|e| self.err(e, off))?,
            IOffset => self.stack.op_get_imm_p_dyn().map_err(|e| self.err(e, off))?,
            IOffsetU8 | IOffsetS16 => self
                .stack
                .op_get_imm_p(ins.operands_as_uint(fmt))
                .map_err(|e| self.err(e, off))?,
            IOffsetU8Load | IOffsetS16Load => self
                .stack
                .op_get_imm(ins.operands_as_uint(fmt))
                .map_err(|e| self.err(e, off))?,
            IOffsetU8Store | IOffsetS16Store => {
                let line = self
                    .stack
                    .op_set_imm(ins.operands_as_uint(fmt))
                    .map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }

            GlobalU16 | GlobalU24 => {
                let name = self.global_name(&ins);
                self.stack.push_p_global(name);
            }
            GlobalU16Load | GlobalU24Load => {
                let name = self.global_name(&ins);
                self.stack.push_global(name);
            }
            GlobalU16Store | GlobalU24Store => {
                let name = self.global_name(&ins);
                let line = self.stack.op_set(&name).map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }

            J => self.handle_jump()?,
            Jz => self.check_conditional()?,
            op @ (IEqJz | INeJz | IGtJz | IGeJz | ILtJz | ILeJz) => {
                self.stack
                    .op_cmp(compare_op(op))
                    .map_err(|e| self.err(e, off))?;
                self.check_conditional()?;
            }

            Call => {
                let target = ins.operands_as_int(fmt) as usize;
                let callee = self.ctx.callee(target, self.name, off)?;
                let line = self
                    .stack
                    .function_call_named(&callee.name, callee.pcount, callee.rcount)
                    .map_err(|e| self.err(e, off))?;
                if !line.is_empty() {
                    self.out.write_line(&line);
                }
            }

            Switch => self.handle_switch()?,

            String => {
                let lit = self.stack.pop().as_literal().map_err(|e| self.err(e, off))?;
                let resolved = literal_int(&lit, self.ctx.opts.int_style)
                    .filter(|&n| n >= 0)
                    .map(|n| n as usize)
                    .filter(|&n| self.ctx.strings.contains(n));
                match resolved {
                    Some(n) => {
                        let text = self.ctx.strings.get(n)?;
                        self.stack.push_string_literal(format!("\"{text}\""));
                    }
                    None => self.stack.push_string_literal(format!("StringTable({lit})")),
                }
            }
            StringHash => self.stack.op_hash().map_err(|e| self.err(e, off))?,
            TextLabelAssignString => {
                let line = self
                    .stack
                    .op_str_cpy(ins.operand(0) as usize)
                    .map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }
            TextLabelAssignInt => {
                let line = self
                    .stack
                    .op_itos(ins.operand(0) as usize)
                    .map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }
            TextLabelAppendString => {
                let line = self
                    .stack
                    .op_str_add(ins.operand(0) as usize)
                    .map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }
            TextLabelAppendInt => {
                let line = self
                    .stack
                    .op_str_add_i(ins.operand(0) as usize)
                    .map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }
            TextLabelCopy => {
                let line = self.stack.op_memcopy().map_err(|e| self.err(e, off))?;
                self.out.write_line(&line);
            }

            Catch | Throw => {
                return Err(DecompileError::UnexpectedInstruction {
                    function: self.name.to_string(),
                    offset: off,
                    what: "exception opcode",
                });
            }
            CallIndirect => {
                for line in self.stack.pcall().map_err(|e| self.err(e, off))? {
                    self.out.write_line(&line);
                }
            }

            PushConstM1 | PushConst0 | PushConst1 | PushConst2 | PushConst3 | PushConst4
            | PushConst5 | PushConst6 | PushConst7 => self.stack.push_int(ins.imm_int_push()),
            PushConstFM1 | PushConstF0 | PushConstF1 | PushConstF2 | PushConstF3 | PushConstF4
            | PushConstF5 | PushConstF6 | PushConstF7 => {
                self.stack.push_float(ins.imm_float_push())
            }

            op @ (LocalLoadS | LocalStoreS | LocalStoreSr | StaticLoadS | StaticStoreS
            | StaticStoreSr | LoadNS | StoreNS | StoreNSr | GlobalLoadS | GlobalStoreS
            | GlobalStoreSr) => {
                if !fmt.extended {
                    return Err(DecompileError::UnexpectedInstruction {
                        function: self.name.to_string(),
                        offset: off,
                        what: "extended opcode outside an extended edition",
                    });
                }
                self.stack.push_global(format!("RDR_{op:?}"));
            }

            Last => {
                return Err(DecompileError::UnknownOpcode { raw: 0xff, offset: off });
            }
        }
        self.offset += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natives::{NativeTable, TableCipher};
    use crate::vars::ListKind;

    // Raw V-edition opcode bytes used by the fixtures.
    const ENTER: u8 = 45;
    const LEAVE: u8 = 46;
    const J: u8 = 85;
    const JZ: u8 = 86;
    const GLOBAL_U16_STORE: u8 = 84;
    const LOCAL_U8_STORE: u8 = 57;
    const PUSH_0: u8 = 110;
    const PUSH_1: u8 = 111;
    const PUSH_2: u8 = 112;
    const PUSH_F1: u8 = 120;
    const SWITCH: u8 = 98;
    const DUP: u8 = 42;
    const INOT: u8 = 6;

    fn block(pcount: u8, vcount: u16, body: &[u8], rcount: u8) -> Vec<u8> {
        let mut code = vec![ENTER, pcount, vcount as u8, (vcount >> 8) as u8, 0];
        code.extend_from_slice(body);
        code.extend_from_slice(&[LEAVE, pcount, rcount]);
        code
    }

    struct Fixture {
        services: Services,
        opts: Options,
        strings: StringTable,
        natives: NativeTable,
        statics: VarTable,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                services: Services::default(),
                opts: Options::default(),
                strings: StringTable::from_pages(Vec::new(), 0),
                natives: NativeTable::parse(&[], 0, 0, TableCipher::Rotated).unwrap(),
                statics: VarTable::new_empty(ListKind::Statics, false),
            }
        }

        fn decompile(&mut self, code: Vec<u8>, pcount: usize, vcount: usize, rcount: usize) -> Function {
            let mut func = Function::new(
                0,
                "func_0".to_string(),
                pcount,
                vcount,
                rcount,
                0,
                code.len(),
                code,
                false,
            );
            let snapshots = vec![func.snapshot()];
            let by_location = HashMap::from([(0usize, 0usize)]);
            let ctx = ScriptContext {
                services: &self.services,
                opts: &self.opts,
                fmt: CodeFormat::default(),
                strings: &self.strings,
                natives: &self.natives,
                functions: &snapshots,
                by_location: &by_location,
            };
            func.find_instructions(&ctx).unwrap();
            func.infer(&ctx, &mut self.statics).unwrap();
            func.emit(&ctx, &mut self.statics).unwrap();
            func
        }
    }

    #[test]
    fn trivial_return_renders_and_types() {
        let mut fx = Fixture::new();
        let mut func = fx.decompile(block(0, 2, &[PUSH_1], 1), 0, 2, 1);
        assert_eq!(func.return_type, DataType::Int);
        let text = func.render(&fx.opts);
        assert!(text.starts_with("int func_0()"), "{text}");
        assert!(text.contains("\treturn 1;"), "{text}");
    }

    #[test]
    fn conditional_closes_at_jump_target() {
        // if (0) { Global_5 = 1; }
        let body = [
            PUSH_0,
            JZ, 4, 0,            // over the store, to the LEAVE
            PUSH_1,
            GLOBAL_U16_STORE, 5, 0,
        ];
        let mut fx = Fixture::new();
        let mut func = fx.decompile(block(0, 2, &body, 0), 0, 2, 0);
        let text = func.render(&fx.opts);
        assert!(text.contains("\tif (0)\n\t{\n\t\tGlobal_5 = 1;\n\t}\n"), "{text}");
    }

    #[test]
    fn local_store_types_the_frame_slot() {
        // Frame slot 2 is local 0 when there are no parameters.
        let body = [PUSH_F1, LOCAL_U8_STORE, 2];
        let mut fx = Fixture::new();
        let mut func = fx.decompile(block(0, 3, &body, 0), 0, 3, 0);
        assert_eq!(func.vars.type_at(0), DataType::Float);
        let text = func.render(&fx.opts);
        assert!(text.contains("float fVar0;"), "{text}");
        assert!(text.contains("fVar0 = 1f;"), "{text}");
    }

    #[test]
    fn switch_structure_with_break() {
        // switch (1) { case 5: Global_9 = 2; break; }
        let mut body = vec![PUSH_1, SWITCH, 1];
        body.extend_from_slice(&5i32.to_le_bytes());
        body.extend_from_slice(&3i16.to_le_bytes()); // case target: 17
        body.extend_from_slice(&[J, 7, 0]); // default: straight to the LEAVE
        body.extend_from_slice(&[PUSH_2, GLOBAL_U16_STORE, 9, 0]);
        body.extend_from_slice(&[J, 0, 0]); // break
        let mut fx = Fixture::new();
        let mut func = fx.decompile(block(0, 2, &body, 0), 0, 2, 0);
        let text = func.render(&fx.opts);
        assert!(text.contains("\tswitch (1)\n\t{\n\t\tcase 5:"), "{text}");
        assert!(text.contains("\t\t\tGlobal_9 = 2;\n\t\t\tbreak;\n\t}\n"), "{text}");
    }

    #[test]
    fn dup_jz_short_circuit_is_collapsed() {
        // DUP / INOT / JZ never reaches the instruction list.
        let body = [PUSH_1, DUP, INOT, JZ, 0, 0, GLOBAL_U16_STORE, 3, 0];
        let mut fx = Fixture::new();
        let mut func = fx.decompile(block(0, 2, &body, 0), 0, 2, 0);
        let text = func.render(&fx.opts);
        assert!(text.contains("Global_3 = 1;"), "{text}");
        assert!(!text.contains("Stack.Peek"), "{text}");
    }

    #[test]
    fn out_of_block_jumps_become_nops() {
        let body = [J, 100, 0, PUSH_1, GLOBAL_U16_STORE, 2, 0];
        let mut fx = Fixture::new();
        let mut func = fx.decompile(block(0, 2, &body, 0), 0, 2, 0);
        let text = func.render(&fx.opts);
        assert!(text.contains("Global_2 = 1;"), "{text}");
        assert!(!text.contains("Jump @"), "{text}");
    }
}
