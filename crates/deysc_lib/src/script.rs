//! Whole-script coordination: image parsing, function boundary discovery,
//! the cross-function type fixpoint and final rendering.
//!
//! The lifecycle is parse → [`ScriptFile::decompile`] → [`ScriptFile::render`].
//! Decompilation runs one inference pass per function, then re-runs it on
//! functions dirtied by cross-boundary type refinements (statics, native
//! descriptors, callee signatures) until the assignment is stable, and only
//! then emits code. The lattice is finite and refinement monotonic, so the
//! fixpoint terminates.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::{DecompileError, Result};
use crate::function::{Function, ScriptContext};
use crate::header::ScriptHeader;
use crate::instruction::{CodeFormat, instruction_len};
use crate::natives::NativeTable;
use crate::opcodes::Opcode;
use crate::stack::{FuncSnapshot, TypeUpdate, VarScope};
use crate::strings::StringTable;
use crate::types::DataType;
use crate::vars::{ListKind, VarTable};
use crate::{Options, Services};

/// Hard cap on fixpoint passes. The lattice bounds the true iteration count
/// well below this; hitting the cap means a refinement loop bug.
const MAX_FIXPOINT_PASSES: usize = 64;

pub struct ScriptFile<'s> {
    pub header: ScriptHeader,
    pub opts: Options,
    services: &'s Services,
    fmt: CodeFormat,
    pub strings: StringTable,
    pub natives: NativeTable,
    pub statics: VarTable,
    pub functions: Vec<Function>,
    by_location: HashMap<usize, usize>,
    function_lines: Vec<(String, usize)>,
}

impl<'s> ScriptFile<'s> {
    pub fn parse(data: &[u8], opts: Options, services: &'s Services) -> Result<Self> {
        let header = ScriptHeader::parse(data, opts.is_bit32)?;
        let fmt = CodeFormat {
            swap_endian: opts.swap_endian,
            extended: opts.edition.is_extended(),
        };

        let mut pages = Vec::with_capacity(header.string_table_offsets.len());
        for (i, &off) in header.string_table_offsets.iter().enumerate() {
            let len = ScriptHeader::page_len(i, header.strings_size);
            let page = data
                .get(off..off + len)
                .ok_or(DecompileError::TruncatedImage { context: "string page" })?;
            pages.push(page.to_vec());
        }
        let strings = StringTable::from_pages(pages, header.strings_size);

        let mut code = Vec::with_capacity(header.code_length);
        for (i, &off) in header.code_table_offsets.iter().enumerate() {
            let len = ScriptHeader::page_len(i, header.code_length);
            let page = data
                .get(off..off + len)
                .ok_or(DecompileError::TruncatedImage { context: "code page" })?;
            code.extend_from_slice(page);
        }

        let natives_start = header.natives_offset + header.rsc7_offset;
        let natives = NativeTable::parse(
            data.get(natives_start..)
                .ok_or(DecompileError::TruncatedImage { context: "native table" })?,
            header.natives_count,
            header.code_length,
            opts.native_cipher(),
        )?;

        let mut statics = VarTable::new_empty(ListKind::Statics, false);
        let statics_start = header.statics_offset + header.rsc7_offset;
        let slot = if opts.is_bit32 { 4 } else { 8 };
        let raw = data
            .get(statics_start..statics_start + header.statics_count * slot)
            .ok_or(DecompileError::TruncatedImage { context: "statics segment" })?;
        for i in 0..header.statics_count {
            let value = if opts.is_bit32 {
                BigEndian::read_i32(&raw[i * 4..]) as i64
            } else {
                LittleEndian::read_i64(&raw[i * 8..])
            };
            statics.add_var(value);
        }
        statics.set_script_param_count(header.parameter_count);

        let functions = find_functions(&code, &opts, fmt)?;
        let by_location = functions.iter().map(|f| (f.location, f.index)).collect();

        Ok(ScriptFile {
            header,
            opts,
            services,
            fmt,
            strings,
            natives,
            statics,
            functions,
            by_location,
            function_lines: Vec::new(),
        })
    }

    pub fn script_name(&self) -> &str {
        &self.header.script_name
    }

    fn snapshots(&self) -> Vec<FuncSnapshot> {
        self.functions.iter().map(Function::snapshot).collect()
    }

    fn run_infer(&mut self, index: usize, snapshots: &[FuncSnapshot]) -> Result<Vec<TypeUpdate>> {
        let ctx = ScriptContext {
            services: self.services,
            opts: &self.opts,
            fmt: self.fmt,
            strings: &self.strings,
            natives: &self.natives,
            functions: snapshots,
            by_location: &self.by_location,
        };
        self.functions[index].infer(&ctx, &mut self.statics)
    }

    fn run_emit(&mut self, index: usize, snapshots: &[FuncSnapshot]) -> Result<()> {
        let ctx = ScriptContext {
            services: self.services,
            opts: &self.opts,
            fmt: self.fmt,
            strings: &self.strings,
            natives: &self.natives,
            functions: snapshots,
            by_location: &self.by_location,
        };
        self.functions[index].emit(&ctx, &mut self.statics)
    }

    /// Dirty the target and everyone that calls it.
    fn mark_function_dirty(&mut self, target: usize) {
        self.functions[target].dirty = true;
        for f in &mut self.functions {
            if f.callees.contains(&target) {
                f.dirty = true;
            }
        }
    }

    fn apply_updates(&mut self, origin: usize, updates: Vec<TypeUpdate>) {
        for update in updates {
            match update {
                TypeUpdate::Var { scope: VarScope::Statics, .. } => {
                    // No per-static cross references are kept; a raised
                    // static conservatively re-infers everything.
                    for f in &mut self.functions {
                        f.dirty = true;
                    }
                }
                TypeUpdate::Var { .. } => {}
                TypeUpdate::NativeParam { hash, .. } | TypeUpdate::NativeReturn { hash, .. } => {
                    for f in &mut self.functions {
                        if f.index != origin && f.uses_native(hash) {
                            f.dirty = true;
                        }
                    }
                }
                TypeUpdate::FunctionParam { function, param, ty } => {
                    if self.functions[function].apply_param_type(param, ty) {
                        self.mark_function_dirty(function);
                    }
                }
                TypeUpdate::FunctionReturn { function, ty } => {
                    if function == origin {
                        // Already raised inside the pass.
                        self.mark_function_dirty(function);
                        self.functions[function].dirty = false;
                    } else if self.functions[function].raise_return_type(ty) {
                        self.mark_function_dirty(function);
                    }
                }
            }
        }
    }

    /// Run both decode passes over every function.
    pub fn decompile(&mut self) -> Result<()> {
        for i in 0..self.functions.len() {
            let snapshots = self.snapshots();
            let ctx = ScriptContext {
                services: self.services,
                opts: &self.opts,
                fmt: self.fmt,
                strings: &self.strings,
                natives: &self.natives,
                functions: &snapshots,
                by_location: &self.by_location,
            };
            self.functions[i].find_instructions(&ctx)?;
        }

        for i in 0..self.functions.len() {
            let snapshots = self.snapshots();
            let updates = self.run_infer(i, &snapshots)?;
            self.functions[i].pre_decoded = true;
            self.apply_updates(i, updates);
        }
        self.statics.check_vars();

        let mut pass = 0usize;
        loop {
            let pending: Vec<usize> = self
                .functions
                .iter()
                .filter(|f| f.dirty)
                .map(|f| f.index)
                .collect();
            if pending.is_empty() {
                break;
            }
            pass += 1;
            if pass > MAX_FIXPOINT_PASSES {
                warn!(
                    script = self.header.script_name,
                    pending = pending.len(),
                    "type fixpoint did not settle, emitting with current types"
                );
                for f in &mut self.functions {
                    f.dirty = false;
                }
                break;
            }
            debug!(pass, functions = pending.len(), "re-running type inference");
            for i in pending {
                self.functions[i].dirty = false;
                let snapshots = self.snapshots();
                let updates = self.run_infer(i, &snapshots)?;
                self.apply_updates(i, updates);
            }
        }

        for i in 0..self.functions.len() {
            self.functions[i].native_count = 0;
            let snapshots = self.snapshots();
            self.run_emit(i, &snapshots)?;
            if self.opts.aggregate_functions {
                self.aggregate_function(i)?;
            }
        }
        Ok(())
    }

    fn aggregate_function(&mut self, index: usize) -> Result<()> {
        let snapshots = self.snapshots();
        let stateless = {
            let ctx = ScriptContext {
                services: self.services,
                opts: &self.opts,
                fmt: self.fmt,
                strings: &self.strings,
                natives: &self.natives,
                functions: &snapshots,
                by_location: &self.by_location,
            };
            self.functions[index].stateless_render(&ctx, &mut self.statics)?
        };
        let func = &self.functions[index];
        let name = format!("{}.{}", self.header.script_name, func.name);
        self.services
            .aggregate
            .push(func.native_count, &name, &func.text(&self.opts), &stateless);
        Ok(())
    }

    /// Full decompiled listing. Also records each function's starting line
    /// for callers that index into the output.
    pub fn render(&mut self) -> String {
        let mut out = String::new();
        let mut line = 0usize;
        self.function_lines.clear();

        if self.opts.declare_variables {
            let decls = self.statics.declarations(&self.opts);
            if !decls.is_empty() {
                out.push_str("#region Local Var\n");
                for decl in &decls {
                    out.push_str(decl);
                    out.push('\n');
                }
                out.push_str("#endregion\n\n");
                line += decls.len() + 3;
            }
        }

        for i in 0..self.functions.len() {
            let name = self.functions[i].name.clone();
            self.function_lines.push((name, line));
            let text = self.functions[i].render(&self.opts);
            line += text.lines().count() + 1;
            out.push_str(&text);
            out.push('\n');
        }
        out
    }

    pub fn function_lines(&self) -> &[(String, usize)] {
        &self.function_lines
    }

    /// `index: name` listing of the script's native imports.
    pub fn native_dump(&self) -> Vec<String> {
        self.natives
            .dump(&self.services.natives, self.opts.uppercase_natives)
    }

    pub fn update_static_type(&mut self, index: usize, ty: DataType) -> bool {
        if self.statics.set_type_at(index, ty) {
            for f in &mut self.functions {
                f.dirty = true;
            }
            true
        } else {
            false
        }
    }

    pub fn update_native_return(&mut self, hash: u64, ty: DataType) -> bool {
        if self.services.natives.update_return(hash, ty) {
            for f in &mut self.functions {
                if f.uses_native(hash) {
                    f.dirty = true;
                }
            }
            true
        } else {
            false
        }
    }

    pub fn update_native_param(&mut self, hash: u64, param: usize, ty: DataType) -> bool {
        if self.services.natives.update_param(hash, param, ty) {
            for f in &mut self.functions {
                if f.uses_native(hash) {
                    f.dirty = true;
                }
            }
            true
        } else {
            false
        }
    }
}

struct Boundary {
    start: usize,
    pcount: usize,
    vcount: usize,
    name: Option<String>,
    last_leave: Option<(usize, usize)>,
}

fn close_boundary(
    boundary: Boundary,
    code: &[u8],
    index: usize,
    is_aggregate: bool,
) -> Result<Function> {
    let (end, rcount) = boundary
        .last_leave
        .ok_or(DecompileError::MalformedFunctionFrame {
            offset: boundary.start,
            reason: "function body has no return",
        })?;
    let name = match boundary.name {
        Some(name) => name,
        None if boundary.start == 0 => "__EntryFunction__".to_string(),
        None => format!("func_{index}"),
    };
    Ok(Function::new(
        index,
        name,
        boundary.pcount,
        boundary.vcount,
        rcount,
        boundary.start,
        end,
        code[boundary.start..end].to_vec(),
        is_aggregate,
    ))
}

/// One byte-accurate scan over the code segment. Every `Enter` starts a
/// function; it ends at the end of the last `Leave` before the next
/// `Enter` (or the end of the segment).
fn find_functions(code: &[u8], opts: &Options, fmt: CodeFormat) -> Result<Vec<Function>> {
    let set = opts.edition.opcode_set();
    let mut functions = Vec::new();
    let mut open: Option<Boundary> = None;
    let mut pos = 0usize;

    while pos < code.len() {
        let op = set.map(code[pos]);
        if op == Opcode::Last {
            return Err(DecompileError::UnknownOpcode { raw: code[pos], offset: pos });
        }
        let len = instruction_len(code, pos, op, fmt)?;
        match op {
            Opcode::Enter => {
                if let Some(boundary) = open.take() {
                    let index = functions.len();
                    functions.push(close_boundary(boundary, code, index, false)?);
                }
                let pcount = code[pos + 1] as usize;
                let vcount = if fmt.swap_endian {
                    BigEndian::read_u16(&code[pos + 2..pos + 4]) as usize
                } else {
                    LittleEndian::read_u16(&code[pos + 2..pos + 4]) as usize
                };
                let name_len = code[pos + 4] as usize;
                let name = if name_len > 0 {
                    let raw = &code[pos + 5..pos + 5 + name_len];
                    let text: String = raw
                        .iter()
                        .take_while(|&&b| b != 0)
                        .map(|&b| b as char)
                        .collect();
                    if text.is_empty() { None } else { Some(text) }
                } else {
                    None
                };
                open = Some(Boundary {
                    start: pos,
                    pcount,
                    vcount,
                    name,
                    last_leave: None,
                });
            }
            Opcode::Leave => {
                if let Some(boundary) = open.as_mut() {
                    boundary.last_leave = Some((pos + len, code[pos + 2] as usize));
                }
            }
            _ => {}
        }
        pos += len;
    }

    if let Some(boundary) = open.take() {
        let index = functions.len();
        functions.push(close_boundary(boundary, code, index, false)?);
    }
    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateRegistry;
    use crate::hashes::{GxtLookup, HashLookup};
    use crate::natives::NativeRegistry;

    const CODE_PAGE: usize = 0x200;
    const STATICS: usize = 0x100;
    const NATIVES: usize = 0x150;
    const NAME: usize = 0x80;

    fn put_i32(data: &mut [u8], off: usize, v: i32) {
        LittleEndian::write_i32(&mut data[off..off + 4], v);
    }

    /// Minimal 64-bit PC image: header at 0, code table at 0x90, name,
    /// statics, native table and a single code page at fixed offsets.
    fn image(name: &str, code: &[u8], statics: &[i64], natives: &[u64]) -> Vec<u8> {
        let mut data = vec![0u8; CODE_PAGE + code.len()];
        put_i32(&mut data, 0x00, 0x405A9ED0);
        put_i32(&mut data, 0x10, 0x90); // code block table
        put_i32(&mut data, 0x1C, code.len() as i32);
        put_i32(&mut data, 0x24, statics.len() as i32);
        put_i32(&mut data, 0x2C, natives.len() as i32);
        put_i32(&mut data, 0x30, STATICS as i32);
        put_i32(&mut data, 0x40, NATIVES as i32);
        put_i32(&mut data, 0x60, NAME as i32);
        put_i32(&mut data, 0x68, 0x98); // strings table (zero pages)
        put_i32(&mut data, 0x90, CODE_PAGE as i32);
        data[NAME..NAME + name.len()].copy_from_slice(name.as_bytes());
        for (i, &v) in statics.iter().enumerate() {
            LittleEndian::write_i64(&mut data[STATICS + i * 8..STATICS + i * 8 + 8], v);
        }
        for (i, &h) in natives.iter().enumerate() {
            // Stored rotated right so the parser's left rotation recovers it.
            let stored = h.rotate_right(((code.len() + i) & 0x3F) as u32);
            LittleEndian::write_u64(&mut data[NATIVES + i * 8..NATIVES + i * 8 + 8], stored);
        }
        data[CODE_PAGE..].copy_from_slice(code);
        data
    }

    const ENTER: u8 = 45;
    const LEAVE: u8 = 46;
    const IADD: u8 = 1;
    const NATIVE: u8 = 44;
    const CALL: u8 = 93;
    const LOCAL_U8_LOAD: u8 = 56;
    const STATIC_U8_STORE: u8 = 60;
    const GLOBAL_U16_STORE: u8 = 84;
    const PUSH_2: u8 = 112;
    const PUSH_3: u8 = 113;
    const PUSH_F1: u8 = 120;

    fn call_to(target: usize) -> [u8; 4] {
        [
            CALL,
            target as u8,
            (target >> 8) as u8,
            (target >> 16) as u8,
        ]
    }

    #[test]
    fn function_discovery_names_and_boundaries() {
        let mut code = vec![ENTER, 0, 2, 0, 0];
        code.extend_from_slice(&[LEAVE, 0, 0]);
        code.extend_from_slice(&[ENTER, 1, 3, 0, 0]);
        code.extend_from_slice(&[LEAVE, 1, 1]);
        let data = image("boundaries", &code, &[], &[]);
        let services = Services::default();
        let script = ScriptFile::parse(&data, Options::default(), &services).unwrap();
        assert_eq!(script.script_name(), "boundaries");
        assert_eq!(script.functions.len(), 2);
        assert_eq!(script.functions[0].name, "__EntryFunction__");
        assert_eq!(script.functions[0].location, 0);
        assert_eq!(script.functions[1].name, "func_1");
        assert_eq!(script.functions[1].location, 8);
        assert_eq!(script.functions[1].pcount, 1);
        assert_eq!(script.functions[1].rcount, 1);
    }

    #[test]
    fn missing_return_is_rejected() {
        let code = vec![ENTER, 0, 2, 0, 0, PUSH_2];
        let data = image("broken", &code, &[], &[]);
        let services = Services::default();
        assert!(matches!(
            ScriptFile::parse(&data, Options::default(), &services),
            Err(DecompileError::MalformedFunctionFrame { .. })
        ));
    }

    #[test]
    fn literal_sum_returns_int() {
        let mut code = vec![ENTER, 0, 2, 0, 0];
        code.extend_from_slice(&call_to(12));
        code.extend_from_slice(&[LEAVE, 0, 0]);
        assert_eq!(code.len(), 12);
        code.extend_from_slice(&[ENTER, 0, 2, 0, 0, PUSH_2, PUSH_3, IADD, LEAVE, 0, 1]);
        let data = image("sum", &code, &[], &[]);
        let services = Services::default();
        let mut script = ScriptFile::parse(&data, Options::default(), &services).unwrap();
        script.decompile().unwrap();
        assert_eq!(script.functions[1].return_type, DataType::Int);
        let text = script.render();
        assert!(text.contains("int func_1()"), "{text}");
        assert!(text.contains("return (2 + 3);"), "{text}");
    }

    #[test]
    fn call_argument_raises_callee_parameter() {
        // Entry passes a float literal; the callee only copies the
        // parameter into a global, so the type must come from the caller.
        let mut code = vec![ENTER, 0, 2, 0, 0, PUSH_F1];
        code.extend_from_slice(&call_to(13));
        code.extend_from_slice(&[LEAVE, 0, 0]);
        assert_eq!(code.len(), 13);
        code.extend_from_slice(&[ENTER, 1, 3, 0, 0, LOCAL_U8_LOAD, 0]);
        code.extend_from_slice(&[GLOBAL_U16_STORE, 5, 0]);
        code.extend_from_slice(&[LEAVE, 1, 0]);
        let data = image("raise", &code, &[], &[]);
        let services = Services::default();
        let mut script = ScriptFile::parse(&data, Options::default(), &services).unwrap();
        script.decompile().unwrap();
        assert_eq!(script.functions[1].params.type_at(0), DataType::Float);
        let text = script.render();
        assert!(text.contains("void func_1(float fParam0)"), "{text}");
        assert!(text.contains("func_1(1f);"), "{text}");
    }

    #[test]
    fn static_store_types_the_declaration() {
        let code = {
            let mut c = vec![ENTER, 0, 2, 0, 0];
            c.extend_from_slice(&[PUSH_F1, STATIC_U8_STORE, 0]);
            c.extend_from_slice(&[LEAVE, 0, 0]);
            c
        };
        let data = image("statics", &code, &[0], &[]);
        let services = Services::default();
        let mut script = ScriptFile::parse(&data, Options::default(), &services).unwrap();
        script.decompile().unwrap();
        let text = script.render();
        assert!(text.starts_with("#region Local Var\n"), "{text}");
        assert!(text.contains("float fLocal_0 = 0f;"), "{text}");
        assert!(text.contains("fLocal_0 = 1f;"), "{text}");
    }

    #[test]
    fn aggregate_registry_merges_identical_scripts() {
        let mut code = vec![ENTER, 0, 2, 0, 0];
        code.extend_from_slice(&[NATIVE, 0, 0, 0]);
        code.extend_from_slice(&[LEAVE, 0, 0]);
        let services = Services {
            natives: NativeRegistry::new(),
            hashes: HashLookup::empty(),
            gxt: GxtLookup::empty(),
            aggregate: AggregateRegistry::new(1, 1),
        };
        let mut opts = Options::default();
        opts.aggregate_functions = true;
        for name in ["script_a", "script_b"] {
            let data = image(name, &code, &[], &[0x1122334455667788]);
            let mut script = ScriptFile::parse(&data, opts.clone(), &services).unwrap();
            script.decompile().unwrap();
        }
        let report = services.aggregate.report();
        assert!(report.contains("script_a.__EntryFunction__"), "{report}");
        assert!(report.contains("script_b.__EntryFunction__"), "{report}");
    }

    #[test]
    fn native_dump_lists_unknown_hashes() {
        let code = vec![ENTER, 0, 2, 0, 0, LEAVE, 0, 0];
        let data = image("dump", &code, &[], &[0xDEADBEEF00000001]);
        let services = Services::default();
        let script = ScriptFile::parse(&data, Options::default(), &services).unwrap();
        let dump = script.native_dump();
        assert_eq!(dump.len(), 1);
        assert!(dump[0].contains("unk_0xDEADBEEF00000001") || dump[0].to_lowercase().contains("deadbeef"), "{}", dump[0]);
    }
}
