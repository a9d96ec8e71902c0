//! Symbolic operand stack.
//!
//! Values are rendered expression fragments, not runtime data. Binary ops
//! pop the right operand first; the bytecode pushes operands in source
//! order, so text concatenation must use the second pop on the left.
//!
//! In type-inference mode the same opcode handlers run without emitting
//! statements; instead every retype of a value backed by a variable, a
//! callee function or a native descriptor is queued as a [`TypeUpdate`]
//! for the function decompiler to apply to the owning tables.

use crate::aggregate::can_aggregate_literal;
use crate::error::StackError;
use crate::hashes::{int_to_hex, literal_int};
use crate::natives::NativeSnapshot;
use crate::types::DataType;
use crate::{IntStyle, Options, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Literal,
    Pointer,
    Struct,
}

/// Which variable table a stack value is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    Statics,
    Params,
    Locals,
}

#[derive(Debug, Clone, Copy)]
pub struct VarRef {
    pub scope: VarScope,
    pub index: usize,
    pub ty: DataType,
    pub immediate_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct FuncRef {
    pub index: usize,
    pub ty: DataType,
}

/// Callee view for a direct call site.
#[derive(Debug, Clone)]
pub struct FuncSnapshot {
    pub index: usize,
    pub name: String,
    pub pcount: usize,
    pub rcount: usize,
    pub param_types: Vec<DataType>,
    pub return_type: DataType,
    pub is_current: bool,
}

/// Deferred type refinement against an entity the stack does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeUpdate {
    Var { scope: VarScope, index: usize, ty: DataType },
    FunctionParam { function: usize, param: usize, ty: DataType },
    FunctionReturn { function: usize, ty: DataType },
    NativeParam { hash: u64, param: usize, ty: DataType },
    NativeReturn { hash: u64, ty: DataType },
}

#[derive(Debug, Clone)]
pub struct StackValue {
    kind: ValueKind,
    text: String,
    ty: DataType,
    struct_size: usize,
    variable: Option<VarRef>,
    function: Option<FuncRef>,
    native_hash: Option<u64>,
    global: bool,
}

impl StackValue {
    fn literal(text: String, ty: DataType) -> Self {
        StackValue {
            kind: ValueKind::Literal,
            text,
            ty,
            struct_size: 1,
            variable: None,
            function: None,
            native_hash: None,
            global: false,
        }
    }

    fn pointer(text: String) -> Self {
        StackValue {
            kind: ValueKind::Pointer,
            ..StackValue::literal(text, DataType::Unk)
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn struct_size(&self) -> usize {
        self.struct_size
    }

    pub fn variable(&self) -> Option<&VarRef> {
        self.variable.as_ref()
    }

    pub fn datatype(&self) -> DataType {
        self.ty
    }

    fn is_var_backed(&self) -> bool {
        self.variable.is_some() || self.global
    }

    pub fn as_literal(&self) -> Result<String, StackError> {
        match self.kind {
            ValueKind::Literal => Ok(self.text.clone()),
            ValueKind::Pointer => Ok(format!("&{}", self.text)),
            ValueKind::Struct => Err(StackError::Unexpected("struct used as literal")),
        }
    }

    pub fn as_pointer(&self) -> Result<String, StackError> {
        match self.kind {
            ValueKind::Pointer => {
                if self.is_var_backed() {
                    Ok(format!("&{}", self.text))
                } else {
                    Ok(format!("&({})", self.text))
                }
            }
            ValueKind::Literal => Ok(self.text.clone()),
            ValueKind::Struct => Err(StackError::Unexpected("struct used as pointer")),
        }
    }

    pub fn as_pointer_ref(&self) -> Result<String, StackError> {
        match self.kind {
            ValueKind::Pointer => Ok(self.text.clone()),
            ValueKind::Literal => {
                if self.text.contains(' ') {
                    Ok(format!("*({})", self.text))
                } else {
                    Ok(format!("*{}", self.text))
                }
            }
            ValueKind::Struct => Err(StackError::Unexpected("struct used as pointer")),
        }
    }

    fn as_struct_access(&self) -> Result<String, StackError> {
        match self.kind {
            ValueKind::Pointer => Ok(format!("{}.", self.text)),
            ValueKind::Literal => {
                if self.text.contains(' ') {
                    Ok(format!("({})->", self.text))
                } else {
                    Ok(format!("{}->", self.text))
                }
            }
            ValueKind::Struct => Err(StackError::Unexpected("struct used as pointer")),
        }
    }
}

fn precedence_set(current: DataType, wanted: DataType) -> DataType {
    if current.precedence() < wanted.precedence() {
        wanted
    } else {
        current
    }
}

pub struct Stack<'s> {
    values: Vec<StackValue>,
    decode_var_info: bool,
    is_aggregate: bool,
    opts: Options,
    services: &'s Services,
    pending: Vec<TypeUpdate>,
}

impl<'s> Stack<'s> {
    pub fn new(services: &'s Services, opts: Options, decode_var_info: bool, is_aggregate: bool) -> Self {
        Stack {
            values: Vec::new(),
            decode_var_info,
            is_aggregate,
            opts,
            services,
            pending: Vec::new(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.is_aggregate
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn depth(&self) -> usize {
        self.values.len()
    }

    /// Refinements queued since the last drain.
    pub fn take_updates(&mut self) -> Vec<TypeUpdate> {
        std::mem::take(&mut self.pending)
    }

    pub fn top_type(&self) -> DataType {
        self.values.last().map(|v| v.ty).unwrap_or(DataType::Unk)
    }

    // Retype a value and queue the refinement for whatever backs it.
    fn retype(&mut self, val: &mut StackValue, ty: DataType) {
        if !self.decode_var_info {
            val.ty = ty;
            return;
        }
        val.ty = precedence_set(val.ty, ty);
        if val.kind != ValueKind::Literal {
            return;
        }
        if let Some(hash) = val.native_hash {
            self.pending.push(TypeUpdate::NativeReturn { hash, ty: val.ty });
        }
        if let Some(var) = &mut val.variable {
            var.ty = precedence_set(var.ty, ty);
            self.pending.push(TypeUpdate::Var {
                scope: var.scope,
                index: var.index,
                ty: var.ty,
            });
        }
        if let Some(func) = &mut val.function {
            func.ty = precedence_set(func.ty, ty);
            self.pending.push(TypeUpdate::FunctionReturn {
                function: func.index,
                ty: func.ty,
            });
        }
    }

    fn as_type(&mut self, mut val: StackValue, ty: DataType) -> StackValue {
        if self.decode_var_info {
            self.retype(&mut val, ty);
        }
        val
    }

    // Adopt the other operand's type unless this one is still unresolved.
    fn unify(&mut self, val: &mut StackValue, other: &StackValue) {
        if self.decode_var_info
            && !matches!(val.ty, DataType::Unk | DataType::UnkPtr | DataType::Unsure)
        {
            let ty = other.ty;
            self.retype(val, ty);
        }
    }

    fn literal_comment(&self, val: &StackValue) -> String {
        if val.kind == ValueKind::Literal && val.ty == DataType::Int {
            if let Ok(n) = val.text.parse::<i32>() {
                return self.services.gxt.entry_comment(n, true, &self.opts);
            }
        }
        String::new()
    }

    fn as_literal_statement(&self, val: &StackValue) -> Result<String, StackError> {
        Ok(format!("{}{}", val.as_literal()?, self.literal_comment(val)))
    }

    // ---- pushes ----

    pub fn push(&mut self, text: impl Into<String>, ty: DataType) {
        self.values.push(StackValue::literal(text.into(), ty));
    }

    pub fn push_cond(&mut self, text: impl Into<String>) {
        self.push(text, DataType::Bool);
    }

    pub fn push_string_literal(&mut self, text: impl Into<String>) {
        self.push(text, DataType::StringPtr);
    }

    pub fn push_global(&mut self, text: impl Into<String>) {
        let mut val = StackValue::literal(text.into(), DataType::Unk);
        val.global = true;
        self.values.push(val);
    }

    pub fn push_p_global(&mut self, text: impl Into<String>) {
        let mut val = StackValue::pointer(text.into());
        val.global = true;
        self.values.push(val);
    }

    pub fn push_int(&mut self, value: i64) {
        let text = match self.opts.int_style {
            IntStyle::Int | IntStyle::Hex => int_to_hex(value as i32, self.opts.int_style),
            IntStyle::Uint => (value as u32).to_string(),
        };
        self.push(text, DataType::Int);
    }

    pub fn push_float(&mut self, value: f32) {
        self.push(format!("{value}f"), DataType::Float);
    }

    pub fn push_var(&mut self, name: &str, var: VarRef) {
        let suffix = if var.immediate_size == 3 { ".x" } else { "" };
        let mut val = StackValue::literal(format!("{name}{suffix}"), var.ty);
        val.variable = Some(var);
        self.values.push(val);
    }

    pub fn push_p_var(&mut self, name: &str, var: VarRef, suffix: &str) {
        let mut val = StackValue::pointer(format!("{name}{suffix}"));
        val.ty = var.ty;
        val.variable = Some(var);
        self.values.push(val);
    }

    pub fn push_pointer(&mut self, text: impl Into<String>) {
        self.values.push(StackValue::pointer(text.into()));
    }

    fn push_struct(&mut self, text: String, size: usize) {
        let mut val = StackValue::literal(text, DataType::Unk);
        val.kind = ValueKind::Struct;
        val.struct_size = size;
        self.values.push(val);
    }

    fn push_vector(&mut self, text: String) {
        let mut val = StackValue::literal(text, DataType::Vector3);
        val.kind = ValueKind::Struct;
        val.struct_size = 3;
        self.values.push(val);
    }

    fn push_string_struct(&mut self, text: String, size: usize) {
        let mut val = StackValue::literal(text, DataType::String);
        val.kind = ValueKind::Struct;
        val.struct_size = size;
        self.values.push(val);
    }

    fn push_native(&mut self, text: String, hash: u64, ty: DataType) {
        let mut val = StackValue::literal(text, ty);
        val.native_hash = Some(hash);
        self.values.push(val);
    }

    fn push_struct_native(&mut self, text: String, hash: u64, ty: DataType, size: usize) {
        let mut val = StackValue::literal(text, ty);
        val.kind = ValueKind::Struct;
        val.struct_size = size;
        val.native_hash = Some(hash);
        self.values.push(val);
    }

    // ---- pops and peeks ----

    /// Underflow yields a placeholder rather than failing; some shipped
    /// scripts leave the stack unbalanced across a jump the structurer
    /// already consumed.
    pub fn pop(&mut self) -> StackValue {
        self.values
            .pop()
            .unwrap_or_else(|| StackValue::literal("StackVal".to_string(), DataType::Unk))
    }

    fn peek(&self) -> Option<&StackValue> {
        self.values.last()
    }

    pub fn dup(&mut self) {
        if let Some(top) = self.peek() {
            if top.text.contains('(') && top.text.contains(')') {
                self.push("Stack.Peek()", DataType::Unk);
            } else {
                let copy = top.clone();
                self.values.push(copy);
            }
        }
    }

    /// A dropped call expression still has a side effect worth printing.
    pub fn drop_value(&mut self) -> Option<String> {
        let val = self.pop();
        match val.text.find('(') {
            Some(paren) if paren > 4 && val.text.ends_with(')') => {
                Some(format!("{};", val.text))
            }
            _ => None,
        }
    }

    fn pop_list(&mut self, size: usize) -> Result<Vec<StackValue>, StackError> {
        let mut count = 0usize;
        let mut items = Vec::new();
        while count < size {
            let top = self.pop();
            match top.kind {
                ValueKind::Literal => {
                    items.push(top);
                    count += 1;
                }
                ValueKind::Pointer => {
                    let text = top.as_pointer()?;
                    items.push(StackValue::literal(text, DataType::Unk));
                    count += 1;
                }
                ValueKind::Struct => {
                    if count + top.struct_size > size {
                        return Err(StackError::StructSizeMismatch {
                            expected: size,
                            found: count + top.struct_size,
                        });
                    }
                    count += top.struct_size;
                    items.push(StackValue::literal(top.text, DataType::Unk));
                }
            }
        }
        items.reverse();
        Ok(items)
    }

    // Like pop_list but keeps struct values intact for per-slot typing.
    fn pop_test(&mut self, size: usize) -> Result<Vec<StackValue>, StackError> {
        let mut count = 0usize;
        let mut items = Vec::new();
        while count < size {
            let top = self.pop();
            match top.kind {
                ValueKind::Literal => {
                    items.push(top);
                    count += 1;
                }
                ValueKind::Pointer => {
                    let text = top.as_pointer()?;
                    let mut lit = StackValue::literal(text, top.ty);
                    lit.variable = top.variable;
                    lit.kind = ValueKind::Literal;
                    items.push(lit);
                    count += 1;
                }
                ValueKind::Struct => {
                    if count + top.struct_size > size {
                        return Err(StackError::StructSizeMismatch {
                            expected: size,
                            found: count + top.struct_size,
                        });
                    }
                    count += top.struct_size;
                    items.push(top);
                }
            }
        }
        items.reverse();
        Ok(items)
    }

    fn pop_vector(&mut self) -> Result<String, StackError> {
        let items = self.pop_list(3)?;
        self.as_vector(items)
    }

    fn as_vector(&mut self, mut items: Vec<StackValue>) -> Result<String, StackError> {
        match items.len() {
            1 => {
                items[0].ty = DataType::Vector3;
                items[0].as_literal()
            }
            2 => {
                let a = self.as_type(items.pop().ok_or(StackError::Underflow)?, DataType::Float);
                let b = self.as_type(items.pop().ok_or(StackError::Underflow)?, DataType::Float);
                Ok(format!("Vector({}, {})", a.as_literal()?, b.as_literal()?))
            }
            3 => {
                let x = self.as_type(items.pop().ok_or(StackError::Underflow)?, DataType::Float);
                let y = self.as_type(items.pop().ok_or(StackError::Underflow)?, DataType::Float);
                let z = self.as_type(items.pop().ok_or(StackError::Underflow)?, DataType::Float);
                Ok(format!(
                    "Vector({}, {}, {})",
                    x.as_literal()?,
                    y.as_literal()?,
                    z.as_literal()?
                ))
            }
            _ => Err(StackError::Unexpected("vector operand count")),
        }
    }

    fn as_call(&self, items: &[StackValue]) -> Result<String, StackError> {
        let mut parts = Vec::with_capacity(items.len());
        for val in items {
            match val.kind {
                ValueKind::Literal => parts.push(self.as_literal_statement(val)?),
                ValueKind::Pointer => parts.push(val.as_pointer()?),
                ValueKind::Struct => parts.push(val.text.clone()),
            }
        }
        Ok(parts.join(", "))
    }

    pub fn pop_list_for_call(&mut self, size: usize) -> Result<String, StackError> {
        if size == 0 {
            return Ok(String::new());
        }
        let items = self.pop_list(size)?;
        self.as_call(&items)
    }

    fn empty_stack(&mut self) -> Result<Vec<String>, StackError> {
        let mut out = Vec::with_capacity(self.values.len());
        for val in &self.values {
            match val.kind {
                ValueKind::Literal | ValueKind::Struct => out.push(val.text.clone()),
                ValueKind::Pointer => out.push(val.as_pointer()?),
            }
        }
        self.values.clear();
        Ok(out)
    }

    // Index from the top, counting a multi-slot struct as its slot span.
    fn actual_index(&self, mut index: usize) -> Option<usize> {
        if self.values.is_empty() {
            return None;
        }
        let mut act = 0usize;
        let mut i = 0usize;
        while i < index {
            let pos = self.values.len().checked_sub(i + 1)?;
            let val = &self.values[pos];
            if val.kind == ValueKind::Struct && val.ty != DataType::Vector3 {
                index = index.saturating_sub(val.struct_size - 1);
            }
            if i < index {
                act += 1;
            }
            i += 1;
        }
        if act < self.values.len() {
            Some(self.values.len() - act - 1)
        } else {
            None
        }
    }

    pub fn peek_item(&self, index: usize) -> String {
        let Some(pos) = self.actual_index(index) else { return String::new() };
        let val = &self.values[pos];
        match val.kind {
            ValueKind::Literal => val.text.clone(),
            ValueKind::Pointer => format!("&{}", val.text),
            ValueKind::Struct => String::new(),
        }
    }

    pub fn peek_var(&self, index: usize) -> Option<VarRef> {
        let pos = self.actual_index(index)?;
        self.values[pos].variable
    }

    pub fn peek_func(&self, index: usize) -> Option<FuncRef> {
        let pos = self.actual_index(index)?;
        self.values[pos].function
    }

    pub fn peek_native(&self, index: usize) -> Option<u64> {
        let pos = self.actual_index(index)?;
        self.values[pos].native_hash
    }

    pub fn is_native(&self, index: usize) -> bool {
        self.peek_native(index).is_some()
    }

    pub fn is_pointer(&self, index: usize) -> bool {
        self.actual_index(index)
            .map(|p| self.values[p].kind == ValueKind::Pointer)
            .unwrap_or(false)
    }

    pub fn is_literal(&self, index: usize) -> bool {
        self.actual_index(index)
            .map(|p| self.values[p].kind == ValueKind::Literal)
            .unwrap_or(false)
    }

    pub fn item_type(&self, index: usize) -> DataType {
        self.actual_index(index)
            .map(|p| self.values[p].ty)
            .unwrap_or(DataType::Unk)
    }

    // ---- calls ----

    pub fn function_call_named(
        &mut self,
        name: &str,
        pcount: usize,
        rcount: usize,
    ) -> Result<String, StackError> {
        let args = self.pop_list_for_call(pcount)?;
        let line = if self.is_aggregate {
            format!("func_({args})")
        } else {
            format!("{name}({args})")
        };
        match rcount {
            0 => Ok(format!("{line};")),
            1 => {
                self.push(line, DataType::Unk);
                Ok(String::new())
            }
            n => {
                self.push_struct(line, n);
                Ok(String::new())
            }
        }
    }

    /// Direct call to another decompiled function. In inference mode the
    /// argument types flow both ways: unresolved callee parameters are
    /// raised from the arguments, resolved ones reflow onto the arguments.
    pub fn function_call(&mut self, callee: &FuncSnapshot) -> Result<String, StackError> {
        let args = if self.decode_var_info {
            if callee.pcount == 0 {
                String::new()
            } else {
                let mut items = self.pop_list(callee.pcount)?;
                for (i, item) in items.iter_mut().enumerate() {
                    let declared = callee.param_types.get(i).copied().unwrap_or(DataType::Unk);
                    let got = item.ty;
                    if declared.precedence() < got.precedence() {
                        if !callee.is_current {
                            self.pending.push(TypeUpdate::FunctionParam {
                                function: callee.index,
                                param: i,
                                ty: got,
                            });
                        }
                    } else if declared != got {
                        self.retype(item, declared);
                    }
                }
                self.as_call(&items)?
            }
        } else if callee.pcount > 0 {
            self.pop_list_for_call(callee.pcount)?
        } else {
            String::new()
        };

        let line = if self.is_aggregate {
            "func_()".to_string()
        } else {
            format!("{}({args})", callee.name)
        };
        match callee.rcount {
            0 => Ok(format!("{line};")),
            1 => {
                let mut val = StackValue::literal(line, callee.return_type);
                val.function = Some(FuncRef {
                    index: callee.index,
                    ty: callee.return_type,
                });
                self.values.push(val);
                Ok(String::new())
            }
            n => {
                self.push_struct(line, n);
                Ok(String::new())
            }
        }
    }

    /// Native call site. Arguments are rendered with bool/float literal
    /// fixups against the declared signature, and every observed argument
    /// type is queued against the shared descriptor.
    pub fn native_call(
        &mut self,
        snapshot: &NativeSnapshot,
        name: &str,
        pcount: usize,
        rcount: usize,
    ) -> Result<String, StackError> {
        let items = self.pop_test(pcount)?;
        let mut rendered = Vec::new();
        let mut params = Vec::new();
        let mut count = 0usize;
        for val in &items {
            match val.kind {
                ValueKind::Literal => {
                    let declared = snapshot.params.get(count).copied().unwrap_or(DataType::Unk);
                    if self.decode_var_info {
                        if let Some(var) = val.variable {
                            if var.ty.precedence() < declared.precedence() {
                                self.pending.push(TypeUpdate::Var {
                                    scope: var.scope,
                                    index: var.index,
                                    ty: declared,
                                });
                            } else if var.ty.precedence() > declared.precedence() {
                                self.pending.push(TypeUpdate::NativeParam {
                                    hash: snapshot.hash,
                                    param: count,
                                    ty: var.ty,
                                });
                            }
                        }
                    }
                    rendered.push(self.render_native_arg(val, declared));
                    params.push(val.ty);
                    count += 1;
                }
                ValueKind::Pointer => {
                    rendered.push(val.as_pointer()?);
                    let pointed = val.ty.pointer_type();
                    params.push(if pointed != DataType::Unk { pointed } else { val.ty });
                    count += 1;
                }
                ValueKind::Struct => {
                    rendered.push(val.text.clone());
                    if val.struct_size == 3 && val.ty == DataType::Vector3 {
                        params.extend([DataType::Float, DataType::Float, DataType::Float]);
                        count += 3;
                    } else {
                        for _ in 0..val.struct_size {
                            params.push(DataType::Unk);
                            count += 1;
                        }
                    }
                }
            }
        }

        for (i, &ty) in params.iter().enumerate() {
            self.pending.push(TypeUpdate::NativeParam {
                hash: snapshot.hash,
                param: i,
                ty,
            });
        }

        let line = format!("{name}({})", rendered.join(", "));
        match rcount {
            0 => {
                self.pending.push(TypeUpdate::NativeReturn {
                    hash: snapshot.hash,
                    ty: DataType::None,
                });
                Ok(format!("{line};"))
            }
            1 => {
                self.push_native(line, snapshot.hash, snapshot.returns);
                Ok(String::new())
            }
            2 => {
                self.push_struct_native(line, snapshot.hash, DataType::Unk, 2);
                Ok(String::new())
            }
            3 => {
                self.pending.push(TypeUpdate::NativeReturn {
                    hash: snapshot.hash,
                    ty: DataType::Vector3,
                });
                self.push_struct_native(line, snapshot.hash, DataType::Vector3, 3);
                Ok(String::new())
            }
            _ => Err(StackError::Unexpected("native return slot count")),
        }
    }

    fn render_native_arg(&self, val: &StackValue, declared: DataType) -> String {
        if val.ty == DataType::Bool || declared == DataType::Bool {
            return match val.text.as_str() {
                "0" => "false".to_string(),
                "1" => "true".to_string(),
                other => other.to_string(),
            };
        }
        if val.ty == DataType::Int && declared == DataType::Float {
            if let Some(n) = literal_int(&val.text, self.opts.int_style) {
                return format!("{}f", f32::from_bits(n as u32));
            }
        }
        val.text.clone()
    }

    pub fn pcall(&mut self) -> Result<Vec<String>, StackError> {
        let loc = self.pop().as_literal()?;
        let mut out = Vec::new();
        for s in self.empty_stack()? {
            out.push(format!("Stack.Push({s});"));
        }
        out.push(format!("Call_Loc({loc});"));
        Ok(out)
    }

    // ---- arithmetic and comparison ----

    pub fn op_add(&mut self) -> Result<(), StackError> {
        self.additive("+")
    }

    pub fn op_sub(&mut self) -> Result<(), StackError> {
        self.additive("-")
    }

    fn additive(&mut self, op: &str) -> Result<(), StackError> {
        let s1 = self.pop();
        let s2 = self.pop();
        match (s2.kind, s1.kind) {
            (ValueKind::Literal, ValueKind::Literal) => {
                let right = self.as_type(s1, DataType::Int);
                let left = self.as_type(s2, DataType::Int);
                self.push(
                    format!("({} {op} {})", left.text, right.text),
                    DataType::Int,
                );
                Ok(())
            }
            (ValueKind::Pointer, ValueKind::Literal) => {
                let mut left = s2;
                let mut right = s1;
                self.unify(&mut left, &right);
                self.unify(&mut right, &left);
                self.push(format!("(&{} {op} {})", left.text, right.text), DataType::Unk);
                Ok(())
            }
            (ValueKind::Literal, ValueKind::Pointer) => {
                let mut left = s1;
                let mut right = s2;
                self.unify(&mut left, &right);
                self.unify(&mut right, &left);
                self.push(format!("(&{} {op} {})", left.text, right.text), DataType::Unk);
                Ok(())
            }
            (ValueKind::Pointer, ValueKind::Pointer) => {
                self.push(
                    format!("({} {op} {}) /* PointerArith */", s1.text, s2.text),
                    DataType::Unk,
                );
                Ok(())
            }
            _ => Err(StackError::Unexpected("struct operand in arithmetic")),
        }
    }

    pub fn op_addf(&mut self) -> Result<(), StackError> {
        self.float_binary("+")
    }

    pub fn op_subf(&mut self) -> Result<(), StackError> {
        self.float_binary("-")
    }

    pub fn op_multf(&mut self) -> Result<(), StackError> {
        self.float_binary("*")
    }

    pub fn op_divf(&mut self) -> Result<(), StackError> {
        self.float_binary("/")
    }

    pub fn op_modf(&mut self) -> Result<(), StackError> {
        self.float_binary("%")
    }

    fn float_binary(&mut self, op: &str) -> Result<(), StackError> {
        let s1 = self.pop();
        let s2 = self.pop();
        let right = self.as_type(s1, DataType::Float);
        let left = self.as_type(s2, DataType::Float);
        self.push(
            format!("({} {op} {})", left.as_literal()?, right.as_literal()?),
            DataType::Float,
        );
        Ok(())
    }

    pub fn op_mult(&mut self) -> Result<(), StackError> {
        self.int_binary("*")
    }

    pub fn op_div(&mut self) -> Result<(), StackError> {
        self.int_binary("/")
    }

    pub fn op_mod(&mut self) -> Result<(), StackError> {
        self.int_binary("%")
    }

    fn int_binary(&mut self, op: &str) -> Result<(), StackError> {
        let s1 = self.pop();
        let s2 = self.pop();
        let right = self.as_type(s1, DataType::Int);
        let left = self.as_type(s2, DataType::Int);
        self.push(
            format!("({} {op} {})", left.as_literal()?, right.as_literal()?),
            DataType::Int,
        );
        Ok(())
    }

    pub fn op_not(&mut self) -> Result<(), StackError> {
        let s1 = self.pop();
        let s1 = self.as_type(s1, DataType::Bool);
        let text = s1.as_literal()?;
        if let Some(inner) = text.strip_prefix("!(").and_then(|t| t.strip_suffix(')')) {
            self.push_cond(inner.to_string());
        } else if text.starts_with('(') && text.ends_with(')') {
            self.push_cond(format!("!{text}"));
        } else if !(text.contains("&&") && text.contains("||") && text.contains('^')) {
            if let Some(bare) = text.strip_prefix('!') {
                self.push_cond(bare.to_string());
            } else {
                self.push_cond(format!("!{text}"));
            }
        } else {
            self.push_cond(format!("!({text})"));
        }
        Ok(())
    }

    pub fn op_neg(&mut self) -> Result<(), StackError> {
        let s1 = self.pop();
        let s1 = self.as_type(s1, DataType::Int);
        self.push(format!("-{}", s1.as_literal()?), DataType::Int);
        Ok(())
    }

    pub fn op_negf(&mut self) -> Result<(), StackError> {
        let s1 = self.pop();
        let s1 = self.as_type(s1, DataType::Float);
        self.push(format!("-{}", s1.as_literal()?), DataType::Float);
        Ok(())
    }

    pub fn op_cmp(&mut self, op: &str) -> Result<(), StackError> {
        let s1 = self.pop();
        let mut s2 = self.pop();
        self.unify(&mut s2, &s1);
        let mut s1 = s1;
        self.unify(&mut s1, &s2);
        self.push_cond(format!("{} {op} {}", s2.as_literal()?, s1.as_literal()?));
        Ok(())
    }

    pub fn op_vadd(&mut self) -> Result<(), StackError> {
        self.vector_binary("+")
    }

    pub fn op_vsub(&mut self) -> Result<(), StackError> {
        self.vector_binary("-")
    }

    pub fn op_vmult(&mut self) -> Result<(), StackError> {
        self.vector_binary("*")
    }

    pub fn op_vdiv(&mut self) -> Result<(), StackError> {
        self.vector_binary("/")
    }

    fn vector_binary(&mut self, op: &str) -> Result<(), StackError> {
        let s1 = self.pop_vector()?;
        let s2 = self.pop_vector()?;
        self.push_vector(format!("{s2} {op} {s1}"));
        Ok(())
    }

    pub fn op_vneg(&mut self) -> Result<(), StackError> {
        let s1 = self.pop_vector()?;
        self.push_vector(format!("-{s1}"));
        Ok(())
    }

    pub fn op_fto_v(&mut self) {
        let top = self.pop();
        if top.text.contains('(') && top.text.contains(')') {
            self.push_vector(format!("FtoV({})", top.text));
        } else {
            let text = top.text;
            self.push(text.clone(), DataType::Float);
            self.push(text.clone(), DataType::Float);
            self.push(text, DataType::Float);
        }
    }

    pub fn op_itof(&mut self) -> Result<(), StackError> {
        let s = self.pop();
        let s = self.as_type(s, DataType::Int);
        self.push(format!("IntToFloat({})", s.as_literal()?), DataType::Float);
        Ok(())
    }

    pub fn op_ftoi(&mut self) -> Result<(), StackError> {
        let s = self.pop();
        let s = self.as_type(s, DataType::Float);
        self.push(format!("FloatToInt({})", s.as_literal()?), DataType::Int);
        Ok(())
    }

    pub fn op_and(&mut self) -> Result<(), StackError> {
        self.logical("&&", "&")
    }

    pub fn op_or(&mut self) -> Result<(), StackError> {
        self.logical("||", "|")
    }

    // The compiler reuses one opcode for logical and bitwise forms; integer
    // literals mean the bitwise reading.
    fn logical(&mut self, bool_op: &str, bit_op: &str) -> Result<(), StackError> {
        let s1 = self.pop();
        let s2 = self.pop();
        if s1.kind == ValueKind::Pointer && s2.kind == ValueKind::Pointer {
            self.push(
                format!("({} {bool_op} {}) /* PointerArith */", s2.text, s1.text),
                DataType::Unk,
            );
            return Ok(());
        }
        if s1.kind != ValueKind::Literal && s2.kind != ValueKind::Literal {
            return Err(StackError::Unexpected("non-literal logical operand"));
        }
        if s1.ty == DataType::Bool || s2.ty == DataType::Bool {
            let right = self.as_type(s1, DataType::Bool);
            let left = self.as_type(s2, DataType::Bool);
            self.push_cond(format!("({} {bool_op} {})", left.text, right.text));
        } else if literal_int(&s1.text, self.opts.int_style).is_some()
            || literal_int(&s2.text, self.opts.int_style).is_some()
        {
            let right = self.as_type(s1, DataType::Int);
            let left = self.as_type(s2, DataType::Int);
            self.push(format!("{} {bit_op} {}", left.text, right.text), DataType::Int);
        } else {
            let mut left = s2;
            let mut right = s1;
            self.unify(&mut left, &right);
            self.unify(&mut right, &left);
            self.push(format!("({} {bool_op} {})", left.text, right.text), DataType::Unk);
        }
        Ok(())
    }

    pub fn op_xor(&mut self) -> Result<(), StackError> {
        let s1 = self.pop();
        let s2 = self.pop();
        let right = self.as_type(s1, DataType::Int);
        let left = self.as_type(s2, DataType::Int);
        self.push(
            format!("{} ^ {}", left.as_literal()?, right.as_literal()?),
            DataType::Int,
        );
        Ok(())
    }

    // ---- field and array access ----

    fn imm_suffix(&self, immediate: u32) -> String {
        if self.opts.hex_index {
            format!("{immediate:X}")
        } else {
            immediate.to_string()
        }
    }

    pub fn op_get_imm(&mut self, immediate: u32) -> Result<(), StackError> {
        if self.peek_var(0).map(|v| v.immediate_size) == Some(3) && (1..=2).contains(&immediate) {
            let axis = if immediate == 1 { "y" } else { "z" };
            let access = self.pop().as_struct_access()?;
            if self.is_aggregate && can_aggregate_literal(&access) {
                self.push(access, DataType::Unk);
            } else {
                self.push(format!("{access}{axis}"), DataType::Unk);
            }
            return Ok(());
        }

        let access = self.pop().as_struct_access()?;
        if self.is_aggregate && can_aggregate_literal(&access) {
            self.push(format!("{access}f_"), DataType::Unk);
        } else {
            self.push(
                format!("{access}f_{}", self.imm_suffix(immediate)),
                DataType::Unk,
            );
        }
        Ok(())
    }

    pub fn op_set_imm(&mut self, immediate: u32) -> Result<String, StackError> {
        let pointer = self.pop();
        let value = self.pop();

        let imm = if self.is_aggregate && can_aggregate_literal(&value.as_literal()?) {
            "f_".to_string()
        } else if self.peek_var(0).map(|v| v.ty) == Some(DataType::Vector3) && immediate <= 2 {
            ["x", "y", "z"][immediate as usize].to_string()
        } else {
            format!("f_{}", self.imm_suffix(immediate))
        };

        let comment = self.literal_comment(&value);
        Ok(self.setcheck(
            &format!("{}{imm}", pointer.as_struct_access()?),
            &value.as_literal()?,
            &comment,
        ))
    }

    pub fn op_get_imm_p(&mut self, immediate: u32) -> Result<(), StackError> {
        let access = self.pop().as_struct_access()?;
        if self.is_aggregate && can_aggregate_literal(&access) {
            self.push_pointer(format!("{access}f_"));
        } else {
            self.push_pointer(format!("{access}f_{}", self.imm_suffix(immediate)));
        }
        Ok(())
    }

    pub fn op_get_imm_p_dyn(&mut self) -> Result<(), StackError> {
        let immediate = self.pop().as_literal()?;
        let access = self.pop().as_struct_access()?;
        let parsed = literal_int(&immediate, self.opts.int_style);
        if self.is_aggregate && can_aggregate_literal(&access) {
            match parsed {
                Some(_) => self.push_pointer(format!("{access}f_")),
                None => self.push_pointer(format!("{access}f_[]")),
            }
        } else {
            match parsed {
                Some(n) => {
                    let suffix = if self.opts.hex_index {
                        format!("{n:X}")
                    } else {
                        n.to_string()
                    };
                    self.push_pointer(format!("{access}f_{suffix}"));
                }
                None => self.push_pointer(format!("{access}f_[{immediate}]")),
            }
        }
        Ok(())
    }

    fn array_size_comment(&self, immediate: u32) -> String {
        if !self.opts.show_array_size || immediate == 1 || self.is_aggregate {
            String::new()
        } else {
            format!(" /*{immediate}*/")
        }
    }

    fn pop_array_access(&mut self) -> Result<String, StackError> {
        let val = self.pop();
        match val.kind {
            ValueKind::Pointer => Ok(val.text),
            ValueKind::Literal => Ok(format!("(*{})", val.text)),
            ValueKind::Struct => Err(StackError::Unexpected("struct used as array base")),
        }
    }

    pub fn op_array_get(&mut self, immediate: u32) -> Result<(), StackError> {
        let base = self.pop_array_access()?;
        let index = self.pop().as_literal()?;
        self.push(
            format!("{base}[{index}{}]", self.array_size_comment(immediate)),
            DataType::Unk,
        );
        Ok(())
    }

    pub fn op_array_set(&mut self, immediate: u32) -> Result<String, StackError> {
        let base = self.pop_array_access()?;
        let index = self.pop();
        let value = self.pop();
        let comment = self.literal_comment(&value);
        Ok(self.setcheck(
            &format!("{base}[{}{}]", index.as_literal()?, self.array_size_comment(immediate)),
            &value.as_literal()?,
            &comment,
        ))
    }

    pub fn op_array_get_p(&mut self, immediate: u32) -> Result<(), StackError> {
        match self.peek().map(|v| v.kind) {
            Some(ValueKind::Pointer) => {
                let base = self.pop_array_access()?;
                let index = self.pop().as_literal()?;
                self.push_pointer(format!("{base}[{index}{}]", self.array_size_comment(immediate)));
                Ok(())
            }
            Some(ValueKind::Literal) => {
                let base = self.pop().as_literal()?;
                let index = self.pop().as_literal()?;
                self.push(
                    format!("{base}[{index}{}]", self.array_size_comment(immediate)),
                    DataType::Unk,
                );
                Ok(())
            }
            _ => Err(StackError::Unexpected("struct used as array base")),
        }
    }

    pub fn op_ref_get(&mut self) -> Result<(), StackError> {
        let text = self.pop().as_pointer_ref()?;
        self.push(text, DataType::Unk);
        Ok(())
    }

    pub fn op_to_stack(&mut self) -> Result<(), StackError> {
        let string = matches!(self.top_type(), DataType::StringPtr | DataType::String);
        let pointer = self.pop().as_pointer_ref()?;
        let count = self.pop().as_literal()?;
        let amount = literal_int(&count, self.opts.int_style)
            .ok_or(StackError::Unexpected("non-constant stack load count"))?;
        if string {
            self.push_string_struct(pointer, amount as usize);
        } else {
            self.push_struct(pointer, amount as usize);
        }
        Ok(())
    }

    pub fn op_from_stack(&mut self) -> Result<String, StackError> {
        let pointer = self.pop().as_pointer_ref()?;
        let count = self.pop().as_literal()?;
        let amount = literal_int(&count, self.opts.int_style)
            .ok_or(StackError::Unexpected("non-constant stack store count"))?;
        let items = self.pop_list(amount as usize)?;
        let mut parts = Vec::with_capacity(items.len());
        for val in &items {
            parts.push(self.as_literal_statement(val)?);
        }
        Ok(format!("{pointer} = {{ {} }};", parts.join(", ")))
    }

    pub fn op_add_imm(&mut self, immediate: i64) -> Result<(), StackError> {
        if immediate < 0 {
            let lit = self.pop().as_literal()?;
            self.push(format!("{lit} - {}", -immediate), DataType::Unk);
        } else if immediate > 0 {
            let lit = self.pop().as_literal()?;
            self.push(format!("{lit} + {immediate}"), DataType::Unk);
        }
        Ok(())
    }

    pub fn op_mult_imm(&mut self, immediate: i64) -> Result<(), StackError> {
        let lit = self.pop().as_literal()?;
        self.push(format!("{lit} * {immediate}"), DataType::Unk);
        Ok(())
    }

    // ---- stores ----

    pub fn op_ref_set(&mut self) -> Result<String, StackError> {
        let pointer = self.pop();
        let value = self.pop();
        let comment = self.literal_comment(&value);
        Ok(self.setcheck(&pointer.as_pointer_ref()?, &value.as_literal()?, &comment))
    }

    pub fn op_peek_set(&mut self) -> Result<String, StackError> {
        let value = self.pop().as_literal()?;
        let pointer = self
            .peek()
            .ok_or(StackError::Underflow)?
            .as_pointer_ref()?;
        Ok(self.setcheck(&pointer, &value, ""))
    }

    pub fn op_set(&mut self, location: &str) -> Result<String, StackError> {
        let value = self.pop();
        let comment = self.literal_comment(&value);
        Ok(self.setcheck(location, &value.as_literal()?, &comment))
    }

    pub fn op_set_var(&mut self, location: &str, var: &VarRef) -> Result<String, StackError> {
        let location = if var.immediate_size == 3 {
            format!("{location}.x")
        } else {
            location.to_string()
        };
        self.op_set(&location)
    }

    pub fn op_hash(&mut self) -> Result<(), StackError> {
        let lit = self.pop().as_literal()?;
        self.push(format!("Hash({lit})"), DataType::Int);
        Ok(())
    }

    pub fn op_str_cpy(&mut self, size: usize) -> Result<String, StackError> {
        let dst = self.pop();
        let dst = self.as_type(dst, DataType::StringPtr);
        let src = self.pop();
        let src = self.as_type(src, DataType::StringPtr);
        Ok(format!(
            "StringCopy({}, {}, {size});",
            dst.as_pointer()?,
            src.as_pointer()?
        ))
    }

    pub fn op_str_add(&mut self, size: usize) -> Result<String, StackError> {
        let dst = self.pop();
        let dst = self.as_type(dst, DataType::StringPtr);
        let src = self.pop();
        let src = self.as_type(src, DataType::StringPtr);
        Ok(format!(
            "StringConCat({}, {}, {size});",
            dst.as_pointer()?,
            src.as_pointer()?
        ))
    }

    pub fn op_str_add_i(&mut self, size: usize) -> Result<String, StackError> {
        let dst = self.pop();
        let dst = self.as_type(dst, DataType::StringPtr);
        let value = self.pop();
        let value = self.as_type(value, DataType::Int);
        Ok(format!(
            "StringIntConCat({}, {}, {size});",
            dst.as_pointer()?,
            value.as_literal()?
        ))
    }

    pub fn op_itos(&mut self, size: usize) -> Result<String, StackError> {
        let pointer = self.pop().as_pointer()?;
        let value = self.pop().as_literal()?;
        Ok(format!("IntToString({pointer}, {value}, {size});"))
    }

    pub fn op_memcopy(&mut self) -> Result<String, StackError> {
        let pointer = self.pop().as_pointer()?;
        let value = self.pop().as_literal()?;
        let count = self.pop().as_literal()?;
        let amount = literal_int(&count, self.opts.int_style)
            .ok_or(StackError::Unexpected("non-constant copy count"))?;
        let list = self.pop_list_for_call(amount as usize)?;
        Ok(format!("MemCopy({pointer}, {{{list}}}, {value});"))
    }

    /// Collapse `x = x + 1;` style stores into compound assignments.
    pub fn setcheck(&self, loc: &str, value: &str, suffix: &str) -> String {
        let Some(rest) = value.strip_prefix(&format!("{loc} ")) else {
            return format!("{loc} = {value};{suffix}");
        };
        let Some((op, newval)) = rest.split_once(' ') else {
            return format!("{loc} = {value};{suffix}");
        };
        if newval == "1" || newval == "1f" {
            if op == "+" {
                return format!("{loc}++;");
            }
            if op == "-" {
                return format!("{loc}--;");
            }
        }
        format!("{loc} {op}= {newval};{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Services;

    fn services() -> Services {
        Services::default()
    }

    fn stack(services: &Services) -> Stack<'_> {
        Stack::new(services, Options::default(), false, false)
    }

    #[test]
    fn binary_ops_preserve_push_order() {
        let svc = services();
        let mut st = stack(&svc);
        st.push_int(2);
        st.push_int(3);
        st.op_add().unwrap();
        assert_eq!(st.pop().text(), "(2 + 3)");

        st.push("a", DataType::Float);
        st.push("b", DataType::Float);
        st.op_subf().unwrap();
        assert_eq!(st.pop().text(), "(a - b)");
    }

    #[test]
    fn comparisons_produce_bool_conditions() {
        let svc = services();
        let mut st = stack(&svc);
        st.push("iVar0", DataType::Int);
        st.push_int(5);
        st.op_cmp("==").unwrap();
        let top = st.pop();
        assert_eq!(top.text(), "iVar0 == 5");
        assert_eq!(top.datatype(), DataType::Bool);
    }

    #[test]
    fn struct_pops_must_span_exactly() {
        let svc = services();
        let mut st = stack(&svc);
        st.push_struct("multi()".to_string(), 3);
        let err = st.pop_list(2).unwrap_err();
        assert!(matches!(
            err,
            StackError::StructSizeMismatch { expected: 2, found: 3 }
        ));

        st.clear();
        st.push_struct("multi()".to_string(), 3);
        let items = st.pop_list(3).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn underflow_yields_placeholder() {
        let svc = services();
        let mut st = stack(&svc);
        assert_eq!(st.pop().text(), "StackVal");
    }

    #[test]
    fn setcheck_collapses_compound_assignments() {
        let svc = services();
        let st = stack(&svc);
        assert_eq!(st.setcheck("iVar0", "iVar0 + 1", ""), "iVar0++;");
        assert_eq!(st.setcheck("iVar0", "iVar0 - 1", ""), "iVar0--;");
        assert_eq!(st.setcheck("iVar0", "iVar0 * 4", ""), "iVar0 *= 4;");
        assert_eq!(st.setcheck("iVar0", "5", ""), "iVar0 = 5;");
    }

    #[test]
    fn vector_pop_reverses_component_order() {
        let svc = services();
        let mut st = stack(&svc);
        st.push("x", DataType::Float);
        st.push("y", DataType::Float);
        st.push("z", DataType::Float);
        st.push("x2", DataType::Float);
        st.push("y2", DataType::Float);
        st.push("z2", DataType::Float);
        st.op_vadd().unwrap();
        let top = st.pop();
        assert_eq!(top.text(), "Vector(z, y, x) + Vector(z2, y2, x2)");
        assert_eq!(top.datatype(), DataType::Vector3);
    }

    #[test]
    fn inference_mode_queues_var_updates() {
        let svc = services();
        let mut st = Stack::new(&svc, Options::default(), true, false);
        st.push_var(
            "uVar0",
            VarRef {
                scope: VarScope::Locals,
                index: 0,
                ty: DataType::Unk,
                immediate_size: 1,
            },
        );
        st.push("a", DataType::Float);
        st.op_addf().unwrap();
        let updates = st.take_updates();
        assert!(updates.contains(&TypeUpdate::Var {
            scope: VarScope::Locals,
            index: 0,
            ty: DataType::Float,
        }));
    }

    #[test]
    fn native_float_params_reinterpret_int_literals() {
        let svc = services();
        let mut st = stack(&svc);
        st.push("1065353216", DataType::Int);
        let snapshot = NativeSnapshot {
            hash: 0x1,
            params: vec![DataType::Float],
            returns: DataType::None,
        };
        let line = st.native_call(&snapshot, "SET_SPEED", 1, 0).unwrap();
        assert_eq!(line, "SET_SPEED(1f);");
    }

    #[test]
    fn native_bool_params_rewrite_zero_and_one() {
        let svc = services();
        let mut st = stack(&svc);
        st.push("1", DataType::Int);
        st.push("0", DataType::Int);
        let snapshot = NativeSnapshot {
            hash: 0x2,
            params: vec![DataType::Bool, DataType::Bool],
            returns: DataType::Unk,
        };
        st.native_call(&snapshot, "SET_FLAGS", 2, 1).unwrap();
        assert_eq!(st.pop().text(), "SET_FLAGS(true, false)");
    }

    #[test]
    fn peek_indexing_accounts_for_struct_spans() {
        let svc = services();
        let mut st = stack(&svc);
        st.push("bottom", DataType::Int);
        st.push_struct("multi()".to_string(), 3);
        // Index 3 skips the whole 3-slot struct and lands on the literal.
        assert_eq!(st.peek_item(3), "bottom");
        assert_eq!(st.item_type(3), DataType::Int);
    }

    #[test]
    fn function_call_renders_args_left_to_right() {
        let svc = services();
        let mut st = stack(&svc);
        st.push_int(1);
        st.push_int(2);
        let line = st.function_call_named("func_5", 2, 0).unwrap();
        assert_eq!(line, "func_5(1, 2);");
    }
}
