//! Variable stores for statics, frame locals and parameters.
//!
//! Detection of int/float/bool/struct/array slots happens here; a slot's
//! type only moves up the lattice. After inference, `check_vars` reserves
//! the trailing slots of arrays and structs so declarations and renaming
//! skip them.

use std::collections::HashMap;

use crate::Options;
use crate::types::{DataType, represent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Statics,
    Params,
    Vars,
}

#[derive(Debug, Clone)]
pub struct Var {
    index: usize,
    pub value: i64,
    pub immediate_size: usize,
    datatype: DataType,
    fixed: bool,
    is_struct: bool,
    is_array: bool,
    is_used: bool,
    is_called: bool,
}

impl Var {
    fn new(index: usize, value: i64) -> Self {
        Var {
            index,
            value,
            immediate_size: 1,
            datatype: DataType::Unk,
            fixed: false,
            is_struct: false,
            is_array: false,
            is_used: true,
            is_called: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Raising past a fixed slot requires strictly higher precedence.
    pub fn set_datatype(&mut self, ty: DataType) {
        if self.fixed && ty.precedence() <= self.datatype.precedence() {
            return;
        }
        self.datatype = ty;
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }

    pub fn is_struct(&self) -> bool {
        self.is_struct
    }

    pub fn is_used(&self) -> bool {
        self.is_used
    }

    pub fn is_called(&self) -> bool {
        self.is_called
    }

    pub fn make_array(&mut self) {
        if !self.is_struct {
            self.is_array = true;
        }
    }

    pub fn make_struct(&mut self) {
        self.datatype = DataType::Unk;
        self.is_array = false;
        self.is_struct = true;
    }

    pub fn mark_called(&mut self) {
        self.is_called = true;
    }

    pub fn dont_use(&mut self) {
        self.is_used = false;
    }
}

#[derive(Debug, Clone)]
pub struct VarTable {
    kind: ListKind,
    vars: Vec<Var>,
    script_param_count: usize,
    remap: Option<HashMap<usize, usize>>,
    is_aggregate: bool,
}

impl VarTable {
    pub fn new(kind: ListKind, count: usize, is_aggregate: bool) -> Self {
        VarTable {
            kind,
            vars: (0..count).map(|i| Var::new(i, 0)).collect(),
            script_param_count: 0,
            remap: None,
            is_aggregate,
        }
    }

    pub fn new_empty(kind: ListKind, is_aggregate: bool) -> Self {
        VarTable::new(kind, 0, is_aggregate)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Statics pre-assigned from the image's static segment.
    pub fn add_var(&mut self, value: i64) {
        self.vars.push(Var::new(self.vars.len(), value));
    }

    pub fn set_script_param_count(&mut self, count: usize) {
        if self.kind == ListKind::Statics {
            self.script_param_count = count;
        }
    }

    fn script_param_start(&self) -> usize {
        self.vars.len() - self.script_param_count
    }

    /// A handful of shipped scripts touch frame slots past the reserved
    /// count; extend on demand instead of failing.
    fn broken_check(&mut self, index: usize) {
        while self.vars.len() <= index {
            let i = self.vars.len();
            self.vars.push(Var::new(i, 0));
        }
    }

    pub fn var_at(&mut self, index: usize) -> &mut Var {
        self.broken_check(index);
        &mut self.vars[index]
    }

    /// Access after `check_vars` pins the slot against same-precedence
    /// rewrites.
    pub fn var_at_fixed(&mut self, index: usize) -> &mut Var {
        self.broken_check(index);
        if self.remap.is_some() {
            self.vars[index].fixed = true;
        }
        &mut self.vars[index]
    }

    pub fn get(&self, index: usize) -> Option<&Var> {
        self.vars.get(index)
    }

    pub fn type_at(&self, index: usize) -> DataType {
        self.vars
            .get(index)
            .map(|v| v.datatype)
            .unwrap_or(DataType::Unk)
    }

    /// Monotonic raise; returns whether the slot changed.
    pub fn set_type_at(&mut self, index: usize, ty: DataType) -> bool {
        self.broken_check(index);
        let prev = self.vars[index].datatype;
        if !ty.is_unknown() && (prev.is_unknown() || prev.precedence() < ty.precedence()) {
            self.vars[index].set_datatype(ty);
            self.vars[index].datatype == ty
        } else {
            false
        }
    }

    /// Reserve the slots spanned by arrays/structs and build the shifted
    /// display-index remapping.
    pub fn check_vars(&mut self) {
        let mut remap = HashMap::new();
        let mut k = 0usize;
        let mut i = 0usize;
        while i < self.vars.len() {
            let used = self.vars[i].is_used && (self.kind != ListKind::Vars || self.vars[i].is_called);
            if used {
                if self.vars[i].is_array {
                    let span = (self.vars[i].value.max(0) as usize) * self.vars[i].immediate_size;
                    for j in i + 1..i + 1 + span {
                        self.broken_check(j);
                        self.vars[j].dont_use();
                    }
                } else if self.vars[i].immediate_size > 1 {
                    for j in i + 1..i + self.vars[i].immediate_size {
                        self.broken_check(j);
                        self.vars[j].dont_use();
                    }
                }
                remap.insert(i, k);
                k += 1;
            }
            i += 1;
        }
        self.remap = Some(remap);
    }

    pub fn name(&self, index: usize, opts: &Options) -> String {
        if self.is_aggregate {
            return match self.kind {
                ListKind::Statics => {
                    if index >= self.script_param_start() { "ScriptParam_" } else { "Local_" }
                        .to_string()
                }
                ListKind::Params => "Param".to_string(),
                ListKind::Vars => "Var".to_string(),
            };
        }

        let var = &self.vars[index];
        let mut name = String::new();
        if var.datatype == DataType::String {
            name.push('c');
        } else if var.immediate_size == 1 {
            name.push_str(var.datatype.short_name());
        } else if var.immediate_size == 3 {
            name.push('v');
        }

        match self.kind {
            ListKind::Statics => {
                name.push_str(if index >= self.script_param_start() {
                    "ScriptParam_"
                } else {
                    "Local_"
                });
            }
            ListKind::Vars => name.push_str("Var"),
            ListKind::Params => name.push_str("Param"),
        }

        if opts.shift_variables {
            if let Some(remap) = &self.remap {
                if let Some(shifted) = remap.get(&index) {
                    return format!("{name}{shifted}");
                }
                return format!("{name}unknownVar");
            }
        }

        let display = if self.kind == ListKind::Statics && index >= self.script_param_start() {
            index - self.script_param_start()
        } else {
            index
        };
        format!("{name}{display}")
    }

    /// Declarations for statics and frame vars, with static initializers.
    pub fn declarations(&self, opts: &Options) -> Vec<String> {
        let mut out = Vec::new();
        let mut i = 0usize;
        for (j, var) in self.vars.iter().enumerate() {
            let location = match self.kind {
                ListKind::Statics => {
                    if i >= self.script_param_start() { "ScriptParam_" } else { "Local_" }
                }
                ListKind::Vars => "Var",
                ListKind::Params => panic!("parameters use param_declaration"),
            };

            if !var.is_used || (self.kind == ListKind::Vars && !var.is_called) {
                if !opts.shift_variables {
                    i += 1;
                }
                continue;
            }

            let datatype = if var.immediate_size == 1 {
                var.datatype.var_declaration()
            } else if var.immediate_size == 3 {
                "vector3 v".to_string()
            } else if var.datatype == DataType::String {
                "char c".to_string()
            } else {
                format!("struct<{}> ", var.immediate_size)
            };

            let value = if self.kind == ListKind::Statics {
                self.initializer(j, var, opts)
            } else {
                String::new()
            };

            let decl = if self.is_aggregate {
                datatype
            } else {
                let display = if self.kind == ListKind::Statics && i >= self.script_param_start() {
                    i - self.script_param_start()
                } else {
                    i
                };
                let mut d = format!("{datatype}{location}{display}");
                if var.is_array {
                    d.push_str(&format!("[{}]", var.value));
                }
                if var.datatype == DataType::String {
                    d.push_str(&format!("[{}]", var.immediate_size * if opts.is_bit32 { 4 } else { 8 }));
                }
                d
            };

            out.push(format!("{decl}{value};"));
            i += 1;
        }
        out
    }

    fn initializer(&self, j: usize, var: &Var, opts: &Options) -> String {
        if !var.is_array {
            if var.immediate_size == 1 {
                return format!(" = {}", represent(var.value, var.datatype));
            }
            if var.datatype == DataType::String {
                let mut data = Vec::new();
                for l in 0..var.immediate_size {
                    let raw = self.vars.get(j + l).map(|v| v.value).unwrap_or(0);
                    data.extend_from_slice(&raw.to_le_bytes());
                }
                let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                data.truncate(len);
                return format!(" = \"{}\"", String::from_utf8_lossy(&data));
            }
            if var.immediate_size == 3 {
                let f = |o: usize| {
                    represent(
                        self.vars.get(j + o).map(|v| v.value).unwrap_or(0),
                        DataType::Float,
                    )
                };
                return format!(" = {{ {}, {}, {} }}", f(0), f(1), f(2));
            }
            if var.immediate_size > 1 {
                let mut s = format!(
                    " = {{ {}",
                    represent(self.vars.get(j).map(|v| v.value).unwrap_or(0), DataType::Int)
                );
                for l in 1..var.immediate_size {
                    s.push_str(&format!(
                        ", {}",
                        represent(self.vars.get(j + l).map(|v| v.value).unwrap_or(0), DataType::Int)
                    ));
                }
                s.push_str(" } ");
                return s;
            }
            return String::new();
        }

        // Array initializers.
        if var.immediate_size == 1 {
            let mut s = " = { ".to_string();
            for k in 0..var.value.max(0) as usize {
                s.push_str(&format!(
                    "{}, ",
                    represent(self.vars.get(j + 1 + k).map(|v| v.value).unwrap_or(0), var.datatype)
                ));
            }
            if s.len() > 2 {
                s.truncate(s.len() - 2);
            }
            s.push_str(" }");
            return s;
        }
        if var.datatype == DataType::String {
            let mut s = " = { ".to_string();
            for k in 0..var.value.max(0) as usize {
                let mut data = Vec::new();
                for l in 0..var.immediate_size {
                    let raw = self
                        .vars
                        .get(j + 1 + var.immediate_size * k + l)
                        .map(|v| v.value)
                        .unwrap_or(0);
                    if opts.is_bit32 {
                        data.extend_from_slice(&(raw as i32).to_le_bytes());
                    } else {
                        data.extend_from_slice(&raw.to_le_bytes());
                    }
                }
                let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                data.truncate(len);
                s.push_str(&format!("\"{}\", ", String::from_utf8_lossy(&data)));
            }
            if s.len() > 2 {
                s.truncate(s.len() - 2);
            }
            s.push_str(" }");
            return s;
        }
        if var.immediate_size == 3 {
            let mut s = " = {".to_string();
            for k in 0..var.value.max(0) as usize {
                let f = |o: usize| {
                    represent(
                        self.vars.get(j + o + 3 * k).map(|v| v.value).unwrap_or(0),
                        DataType::Float,
                    )
                };
                s.push_str(&format!("{{ {}, {}, {} }}, ", f(1), f(2), f(3)));
            }
            if s.len() > 2 {
                s.truncate(s.len() - 2);
            }
            s.push_str(" }");
            return s;
        }
        String::new()
    }

    /// Comma-joined parameter list for a function signature.
    pub fn param_declaration(&self, opts: &Options) -> String {
        assert_eq!(self.kind, ListKind::Params);
        let mut decl = String::new();
        let mut i = 0usize;
        for var in &self.vars {
            if !var.is_used {
                if !opts.shift_variables {
                    i += 1;
                }
                continue;
            }

            let datatype = if !var.is_array {
                if var.datatype == DataType::String {
                    format!("char[{}] c", var.immediate_size * 4)
                } else if var.immediate_size == 1 {
                    var.datatype.var_declaration()
                } else if var.immediate_size == 3 {
                    "vector3 v".to_string()
                } else {
                    format!("struct<{}> ", var.immediate_size)
                }
            } else if var.datatype == DataType::String {
                format!("char[{}][] c", var.immediate_size * 4)
            } else if var.immediate_size == 1 {
                var.datatype.var_array_declaration()
            } else if var.immediate_size == 3 {
                "vector3[] v".to_string()
            } else {
                format!("struct<{}>[] ", var.immediate_size)
            };

            if self.is_aggregate {
                decl.push_str("Param, ");
            } else {
                decl.push_str(&format!("{datatype}Param{i}, "));
            }
            i += 1;
        }
        if decl.len() > 2 {
            decl.truncate(decl.len() - 2);
        }
        decl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> Options {
        Options::default()
    }

    #[test]
    fn type_raises_are_monotonic() {
        let mut t = VarTable::new(ListKind::Vars, 4, false);
        assert!(t.set_type_at(0, DataType::Unsure));
        assert!(t.set_type_at(0, DataType::Float));
        // Same or lower precedence never regresses the slot.
        assert!(!t.set_type_at(0, DataType::Int));
        assert!(!t.set_type_at(0, DataType::Unsure));
        assert_eq!(t.type_at(0), DataType::Float);
        assert!(t.set_type_at(0, DataType::Bool));
        assert_eq!(t.type_at(0), DataType::Bool);
    }

    #[test]
    fn check_vars_reserves_struct_spans() {
        let mut t = VarTable::new(ListKind::Vars, 6, false);
        t.var_at(0).mark_called();
        t.var_at(0).immediate_size = 3;
        t.var_at(4).mark_called();
        t.check_vars();
        assert!(!t.get(1).unwrap().is_used());
        assert!(!t.get(2).unwrap().is_used());
        assert!(t.get(4).unwrap().is_used());
    }

    #[test]
    fn names_use_type_prefixes() {
        let mut t = VarTable::new(ListKind::Vars, 2, false);
        t.set_type_at(0, DataType::Float);
        t.set_type_at(1, DataType::Bool);
        assert_eq!(t.name(0, &opts()), "fVar0");
        assert_eq!(t.name(1, &opts()), "bVar1");
    }

    #[test]
    fn statics_split_script_params() {
        let mut t = VarTable::new(ListKind::Statics, 5, false);
        t.set_script_param_count(2);
        assert_eq!(t.name(1, &opts()), "uLocal_1");
        assert_eq!(t.name(3, &opts()), "uScriptParam_0");
        assert_eq!(t.name(4, &opts()), "uScriptParam_1");
    }

    #[test]
    fn broken_frame_slots_extend() {
        let mut t = VarTable::new(ListKind::Vars, 1, false);
        t.var_at(5).mark_called();
        assert_eq!(t.len(), 6);
    }

    #[test]
    fn static_scalar_initializer() {
        let mut t = VarTable::new_empty(ListKind::Statics, false);
        t.add_var(7);
        t.set_type_at(0, DataType::Int);
        t.check_vars();
        let decls = t.declarations(&opts());
        assert_eq!(decls, vec!["int iLocal_0 = 7;".to_string()]);
    }
}
