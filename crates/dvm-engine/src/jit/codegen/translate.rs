//! Phase two: per-instruction translation into Cranelift IR
//!
//! Walks a segment in index order, switching to the native block of every
//! leader the plan recorded. Scalar registers live in frontend variables or
//! plain SSA values as the plan decided; everything else is read and written
//! in the register file. Fallible operations branch to one shared error
//! block carrying the packed status in the `err_code` variable.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::Ieee64;
use cranelift_codegen::ir::{self, types, InstBuilder};
use cranelift_frontend::{FunctionBuilder, Switch, Variable};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::jit::abi::{self, AbiField, Scalar, PTR};
use crate::jit::classify::{family_kind, numeric_kind};
use crate::jit::codegen::plan::{BlockId, BlockPlan, CallDataNeeds, Storage, Target};
use crate::jit::codegen::CodegenError;
use crate::jit::runtime::RuntimeHelper;
use crate::vm::interpreter::{expected_tag, register_tag, tuple_item_tag};
use crate::vm::{ElementKind, ErrorCode, Instruction, MathFn, Opcode, Routine, ScalarKind, Value, ValueTag, ANY_TAG};

/// Call data pointers loaded once in the entry block, each storage class
/// paired with its slot count
struct Bases {
    call_data: ir::Value,
    locals: ir::Value,
    constants: Option<ir::Value>,
    object_fields: Option<(ir::Value, ir::Value)>,
    class_statics: Option<(ir::Value, ir::Value)>,
    globals: Option<(ir::Value, ir::Value)>,
    outer_frames: Option<(ir::Value, ir::Value)>,
}

impl Bases {
    fn load(builder: &mut FunctionBuilder<'_>, call_data: ir::Value, needs: CallDataNeeds) -> Self {
        let mut load_pair = |needed: bool, base: AbiField, len: AbiField| {
            needed.then(|| (abi::load(builder, base, call_data), abi::load(builder, len, call_data)))
        };
        let object_fields = load_pair(needs.object_fields, AbiField::CallObjectFields, AbiField::CallObjectFieldCount);
        let class_statics = load_pair(needs.class_statics, AbiField::CallClassStatics, AbiField::CallStaticsLen);
        let globals = load_pair(needs.globals, AbiField::CallGlobals, AbiField::CallGlobalsLen);
        let outer_frames = load_pair(needs.outer_frames, AbiField::CallOuterFrames, AbiField::CallOuterCount);
        let constants = needs.constants.then(|| abi::load(builder, AbiField::CallConstants, call_data));
        let locals = abi::load(builder, AbiField::CallLocals, call_data);
        Bases {
            call_data,
            locals,
            constants,
            object_fields,
            class_statics,
            globals,
            outer_frames,
        }
    }
}

/// Base pointers reused within one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    /// A field of the heap object held in a register
    Register(u16, AbiField),
    ObjectFields,
    /// Register file and length of an enclosing frame
    OuterFrame(i32, AbiField),
}

/// Storage-class family of a `GetVar*`/`SetVar*` opcode
#[derive(Debug, Clone, Copy)]
enum StorageClass {
    Object,
    Static,
    Global,
    Outer(i32),
}

pub(super) struct Translator<'a> {
    routine: &'a Routine,
    plan: &'a BlockPlan,
    helpers: &'a [ir::FuncRef],
    bases: Bases,
    blocks: Vec<ir::Block>,
    success: ir::Block,
    failure: ir::Block,
    err_code: Variable,
    vars: FxHashMap<u16, (Variable, Option<Variable>)>,
    direct: FxHashMap<u16, Scalar>,
    cache: FxHashMap<CacheKey, ir::Value>,
    /// Condition of a fused compare, consumed by the next `TestB`
    pending: Option<ir::Value>,
    index: usize,
    /// The current block already ends in a terminator
    filled: bool,
}

impl<'a> Translator<'a> {
    /// Translate the planned segment into the function `builder` edits.
    ///
    /// `helpers` holds one imported function reference per
    /// [`RuntimeHelper`], in declaration order.
    pub(super) fn translate(
        routine: &'a Routine,
        plan: &'a BlockPlan,
        helpers: &'a [ir::FuncRef],
        mut builder: FunctionBuilder<'_>,
    ) -> Result<(), CodegenError> {
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let call_data = builder.block_params(entry)[0];
        let bases = Bases::load(&mut builder, call_data, plan.needs());

        let blocks = (0..plan.block_count()).map(|_| builder.create_block()).collect();
        let success = builder.create_block();
        let failure = builder.create_block();
        builder.set_cold_block(failure);
        let err_code = builder.declare_var(types::I32);
        let zero = builder.ins().iconst(types::I32, 0);
        builder.def_var(err_code, zero);

        let mut t = Translator {
            routine,
            plan,
            helpers,
            bases,
            blocks,
            success,
            failure,
            err_code,
            vars: FxHashMap::default(),
            direct: FxHashMap::default(),
            cache: FxHashMap::default(),
            pending: None,
            index: plan.range().start,
            filled: false,
        };
        t.load_registers(&mut builder);
        let first = t.blocks.first().copied().ok_or(t.malformed("segment has no blocks"))?;
        builder.ins().jump(first, &[]);
        t.filled = true;

        t.translate_body(&mut builder)?;
        t.emit_exits(&mut builder);

        builder.seal_all_blocks();
        builder.finalize();
        Ok(())
    }

    fn translate_body(&mut self, b: &mut FunctionBuilder<'_>) -> Result<(), CodegenError> {
        let code = self.routine.instructions();
        for i in self.plan.range().indices() {
            if let Some(id) = self.plan.block_at(i) {
                self.enter(b, id)?;
            }
            let ins = code[i];
            // Cases are consumed by their switch
            if ins.opcode == Opcode::Case || self.filled {
                continue;
            }
            self.index = i;
            self.instruction(b, &ins)?;
        }
        if !self.filled {
            b.ins().jump(self.success, &[]);
            self.filled = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Blocks and exits
    // ------------------------------------------------------------------------

    fn block(&self, id: BlockId) -> Result<ir::Block, CodegenError> {
        self.blocks.get(id.index()).copied().ok_or(self.malformed("unknown block"))
    }

    fn enter(&mut self, b: &mut FunctionBuilder<'_>, id: BlockId) -> Result<(), CodegenError> {
        let block = self.block(id)?;
        if !self.filled {
            b.ins().jump(block, &[]);
        }
        b.switch_to_block(block);
        self.filled = false;
        self.cache.clear();
        self.pending = None;
        Ok(())
    }

    fn target(&self, index: usize) -> Result<ir::Block, CodegenError> {
        match self.plan.target(index)? {
            Target::Block(id) => self.block(id),
            Target::Exit => Ok(self.success),
        }
    }

    fn jump(&mut self, b: &mut FunctionBuilder<'_>, block: ir::Block) {
        b.ins().jump(block, &[]);
        self.filled = true;
    }

    /// Branch to `then` when `cond` is nonzero, else to `otherwise`
    fn branch(&mut self, b: &mut FunctionBuilder<'_>, cond: ir::Value, then: ir::Block, otherwise: ir::Block) {
        if then == otherwise {
            b.ins().jump(then, &[]);
        } else {
            b.ins().brif(cond, then, &[], otherwise, &[]);
        }
        self.filled = true;
    }

    fn emit_exits(&mut self, b: &mut FunctionBuilder<'_>) {
        b.switch_to_block(self.success);
        self.flush(b);
        let ok = b.ins().iconst(types::I32, 0);
        b.ins().return_(&[ok]);

        b.switch_to_block(self.failure);
        self.flush(b);
        let status = b.use_var(self.err_code);
        b.ins().return_(&[status]);
    }

    /// Store every live stack value back to the register file
    fn flush(&mut self, b: &mut FunctionBuilder<'_>) {
        let flushed: Vec<u16> = self
            .plan
            .registers()
            .filter(|(_, p)| matches!(p.storage, Storage::Stack { flush: true, .. }))
            .map(|(reg, _)| reg)
            .collect();
        for reg in flushed {
            if let Some(value) = self.use_lanes(b, reg) {
                self.store_register(b, reg, value);
            }
        }
    }

    fn fail_if(&mut self, b: &mut FunctionBuilder<'_>, cond: ir::Value, code: ErrorCode) {
        let fail = b.create_block();
        let next = b.create_block();
        b.set_cold_block(fail);
        b.ins().brif(cond, fail, &[], next, &[]);

        b.switch_to_block(fail);
        let packed = b.ins().iconst(types::I32, i64::from(code.pack(self.index)));
        b.def_var(self.err_code, packed);
        b.ins().jump(self.failure, &[]);

        b.switch_to_block(next);
    }

    /// Leave through the error block when a runtime status is nonzero
    fn check_status(&mut self, b: &mut FunctionBuilder<'_>, status: ir::Value) {
        let fail = b.create_block();
        let next = b.create_block();
        b.set_cold_block(fail);
        b.ins().brif(status, fail, &[], next, &[]);

        b.switch_to_block(fail);
        let shifted = b.ins().ishl_imm(status, 16);
        let packed = b.ins().bor_imm(shifted, self.index as i64);
        b.def_var(self.err_code, packed);
        b.ins().jump(self.failure, &[]);

        b.switch_to_block(next);
    }

    fn malformed(&self, reason: &'static str) -> CodegenError {
        CodegenError::Malformed {
            range: self.plan.range(),
            reason,
        }
    }

    fn operand_error(&self, reg: u16) -> CodegenError {
        CodegenError::OperandType { index: self.index, reg }
    }

    // ------------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------------

    fn load_registers(&mut self, b: &mut FunctionBuilder<'_>) {
        let stacked: Vec<_> = self
            .plan
            .registers()
            .filter(|(_, p)| matches!(p.storage, Storage::Stack { .. }))
            .collect();
        for (reg, p) in stacked {
            let ty = abi::lane_type(p.kind);
            let lo = b.declare_var(ty);
            let hi = (p.kind == ScalarKind::Complex).then(|| b.declare_var(ty));
            self.vars.insert(reg, (lo, hi));
            let slot = self.slot(b, reg);
            let value = abi::load_scalar(b, p.kind, slot, 0);
            self.def_lanes(b, reg, value);
        }
    }

    fn slot(&self, b: &mut FunctionBuilder<'_>, reg: u16) -> ir::Value {
        abi::slot_addr(b, self.bases.locals, i64::from(reg))
    }

    fn kind_of(&self, reg: u16) -> Result<ScalarKind, CodegenError> {
        self.plan.register(reg).map(|p| p.kind).ok_or(self.operand_error(reg))
    }

    fn use_lanes(&self, b: &mut FunctionBuilder<'_>, reg: u16) -> Option<Scalar> {
        let &(lo, hi) = self.vars.get(&reg)?;
        let lo = b.use_var(lo);
        Some(match hi {
            Some(hi) => Scalar::Pair(lo, b.use_var(hi)),
            None => Scalar::Word(lo),
        })
    }

    fn def_lanes(&self, b: &mut FunctionBuilder<'_>, reg: u16, value: Scalar) {
        if let Some(&(lo, hi)) = self.vars.get(&reg) {
            match (value, hi) {
                (Scalar::Pair(re, im), Some(hi)) => {
                    b.def_var(lo, re);
                    b.def_var(hi, im);
                }
                (value, _) => b.def_var(lo, value.word()),
            }
        }
    }

    fn read(&mut self, b: &mut FunctionBuilder<'_>, reg: u16, kind: ScalarKind) -> Result<Scalar, CodegenError> {
        let p = self.plan.register(reg).ok_or(self.operand_error(reg))?;
        if p.kind != kind {
            return Err(self.operand_error(reg));
        }
        match p.storage {
            Storage::Direct { .. } => self
                .direct
                .get(&reg)
                .copied()
                .ok_or(self.malformed("register read before its definition")),
            Storage::Stack { .. } => self.use_lanes(b, reg).ok_or(self.malformed("undeclared stack value")),
        }
    }

    fn int(&mut self, b: &mut FunctionBuilder<'_>, reg: u16) -> Result<ir::Value, CodegenError> {
        self.read(b, reg, ScalarKind::Int).map(Scalar::word)
    }

    fn float(&mut self, b: &mut FunctionBuilder<'_>, reg: u16) -> Result<ir::Value, CodegenError> {
        self.read(b, reg, ScalarKind::Float).map(Scalar::word)
    }

    fn boolean(&mut self, b: &mut FunctionBuilder<'_>, reg: u16) -> Result<ir::Value, CodegenError> {
        self.read(b, reg, ScalarKind::Bool).map(Scalar::word)
    }

    fn complex(&mut self, b: &mut FunctionBuilder<'_>, reg: u16) -> Result<(ir::Value, ir::Value), CodegenError> {
        self.read(b, reg, ScalarKind::Complex).map(Scalar::pair)
    }

    fn write(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        reg: u16,
        kind: ScalarKind,
        value: Scalar,
    ) -> Result<(), CodegenError> {
        let p = self.plan.register(reg).ok_or(self.operand_error(reg))?;
        if p.kind != kind {
            return Err(self.operand_error(reg));
        }
        self.invalidate(reg);
        match p.storage {
            Storage::Direct { write_through, .. } => {
                self.direct.insert(reg, value);
                if write_through {
                    self.store_register(b, reg, value);
                }
            }
            Storage::Stack { .. } => self.def_lanes(b, reg, value),
        }
        Ok(())
    }

    fn write_int(&mut self, b: &mut FunctionBuilder<'_>, reg: u16, value: ir::Value) -> Result<(), CodegenError> {
        self.write(b, reg, ScalarKind::Int, Scalar::Word(value))
    }

    fn write_float(&mut self, b: &mut FunctionBuilder<'_>, reg: u16, value: ir::Value) -> Result<(), CodegenError> {
        self.write(b, reg, ScalarKind::Float, Scalar::Word(value))
    }

    /// Store an `I8` condition as a bool register
    fn write_cond(&mut self, b: &mut FunctionBuilder<'_>, reg: u16, cond: ir::Value) -> Result<(), CodegenError> {
        let word = b.ins().uextend(types::I64, cond);
        self.write(b, reg, ScalarKind::Bool, Scalar::Word(word))
    }

    fn store_register(&self, b: &mut FunctionBuilder<'_>, reg: u16, value: Scalar) {
        let slot = self.slot(b, reg);
        abi::store_scalar(b, slot, register_tag(self.routine.reg_type(reg)), value);
    }

    /// Make the register file current for a scalar a runtime helper reads
    fn sync(&mut self, b: &mut FunctionBuilder<'_>, reg: u16) -> Result<(), CodegenError> {
        let Some(p) = self.plan.register(reg) else {
            return Ok(());
        };
        match p.storage {
            Storage::Direct {
                write_through: true, ..
            }
            | Storage::Stack { defined: false, .. } => Ok(()),
            Storage::Direct { .. } | Storage::Stack { .. } => {
                let value = self.read(b, reg, p.kind)?;
                self.store_register(b, reg, value);
                Ok(())
            }
        }
    }

    /// Pick up a register a runtime helper just wrote
    fn reload(&mut self, b: &mut FunctionBuilder<'_>, reg: u16) {
        self.invalidate(reg);
        let Some(p) = self.plan.register(reg) else {
            return;
        };
        let slot = self.slot(b, reg);
        let value = abi::load_scalar(b, p.kind, slot, 0);
        match p.storage {
            Storage::Direct { .. } => {
                self.direct.insert(reg, value);
            }
            Storage::Stack { .. } => self.def_lanes(b, reg, value),
        }
    }

    fn invalidate(&mut self, reg: u16) {
        self.cache.retain(|key, _| !matches!(key, CacheKey::Register(r, _) if *r == reg));
    }

    // ------------------------------------------------------------------------
    // Runtime calls and heap access
    // ------------------------------------------------------------------------

    fn call(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        helper: RuntimeHelper,
        args: &[ir::Value],
    ) -> Result<Option<ir::Value>, CodegenError> {
        let callee = *self
            .helpers
            .get(helper as usize)
            .ok_or_else(|| CodegenError::Backend(format!("runtime helper {:?} not imported", helper)))?;
        let inst = b.ins().call(callee, args);
        Ok(b.inst_results(inst).first().copied())
    }

    /// Call a helper that returns a value
    fn call_value(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        helper: RuntimeHelper,
        args: &[ir::Value],
    ) -> Result<ir::Value, CodegenError> {
        self.call(b, helper, args)?
            .ok_or_else(|| CodegenError::Backend(format!("runtime helper {:?} returns nothing", helper)))
    }

    /// Call a fallible helper and branch to the error block on failure
    fn call_checked(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        helper: RuntimeHelper,
        args: &[ir::Value],
    ) -> Result<(), CodegenError> {
        let status = self.call_value(b, helper, args)?;
        self.check_status(b, status);
        Ok(())
    }

    /// Heap pointer of the value in `reg`, after checking its tag
    fn object(&mut self, b: &mut FunctionBuilder<'_>, reg: u16, tag: ValueTag) -> ir::Value {
        let slot = self.slot(b, reg);
        self.check_tag(b, slot, tag);
        abi::load(b, AbiField::ValuePayload, slot)
    }

    fn check_tag(&mut self, b: &mut FunctionBuilder<'_>, slot: ir::Value, tag: ValueTag) {
        let actual = abi::load(b, AbiField::ValueTag, slot);
        let wrong = b.ins().icmp_imm(IntCC::NotEqual, actual, tag as i64);
        self.fail_if(b, wrong, ErrorCode::Value);
    }

    /// `index` with a negative value counted from `len`, bounds checked
    fn normalize(&mut self, b: &mut FunctionBuilder<'_>, index: ir::Value, len: ir::Value) -> ir::Value {
        let wrapped = b.ins().iadd(index, len);
        let negative = b.ins().icmp_imm(IntCC::SignedLessThan, index, 0);
        let i = b.ins().select(negative, wrapped, index);
        let outside = b.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, i, len);
        self.fail_if(b, outside, ErrorCode::Index);
        i
    }

    /// Materialized array object in `reg`
    fn array(&mut self, b: &mut FunctionBuilder<'_>, reg: u16) -> Result<ir::Value, CodegenError> {
        let obj = self.object(b, reg, ValueTag::Array);
        let original = abi::load(b, AbiField::ArrayOriginal, obj);
        let view = b.create_block();
        let next = b.create_block();
        b.set_cold_block(view);
        b.ins().brif(original, view, &[], next, &[]);

        b.switch_to_block(view);
        self.call_checked(b, RuntimeHelper::ArrayReslice, &[obj])?;
        b.ins().jump(next, &[]);

        b.switch_to_block(next);
        Ok(obj)
    }

    fn element_addr(b: &mut FunctionBuilder<'_>, obj: ir::Value, flat: ir::Value, kind: ElementKind) -> ir::Value {
        let data = abi::load(b, AbiField::ArrayData, obj);
        let offset = b.ins().imul_imm(flat, (kind.words() * 8) as i64);
        b.ins().iadd(data, offset)
    }

    /// Flat element offset for one index over the whole array
    fn flat_index(&mut self, b: &mut FunctionBuilder<'_>, obj: ir::Value, index_reg: u16) -> Result<ir::Value, CodegenError> {
        let index = self.int(b, index_reg)?;
        let size = abi::load(b, AbiField::ArraySize, obj);
        Ok(self.normalize(b, index, size))
    }

    /// Flat element offset for the `count` indices in the registers after `base`
    fn flat_multi_index(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        obj: ir::Value,
        base: u16,
        count: i32,
    ) -> Result<ir::Value, CodegenError> {
        let ndim = abi::load(b, AbiField::ArrayNdim, obj);
        let mismatch = b.ins().icmp_imm(IntCC::NotEqual, ndim, i64::from(count));
        self.fail_if(b, mismatch, ErrorCode::Index);

        let dims = abi::load(b, AbiField::ArrayDims, obj);
        let mut flat = b.ins().iconst(types::I64, 0);
        for k in 0..count {
            let index = self.int(b, base + 1 + k as u16)?;
            let dim = b.ins().load(types::I64, abi::flags(), dims, k * 8);
            let i = self.normalize(b, index, dim);
            let stride = b.ins().load(types::I64, abi::flags(), dims, (count + k) * 8);
            let term = b.ins().imul(i, stride);
            flat = b.ins().iadd(flat, term);
        }
        Ok(flat)
    }

    /// Slot of item `index` of the tuple in `reg`, bounds checked
    fn tuple_slot(&mut self, b: &mut FunctionBuilder<'_>, reg: u16, index: i32) -> ir::Value {
        let items_key = CacheKey::Register(reg, AbiField::TupleItems);
        let len_key = CacheKey::Register(reg, AbiField::TupleLen);
        let (items, len) = match (self.cache.get(&items_key), self.cache.get(&len_key)) {
            (Some(&items), Some(&len)) => (items, len),
            _ => {
                let obj = self.object(b, reg, ValueTag::Tuple);
                let len = abi::load(b, AbiField::TupleLen, obj);
                let items = abi::load(b, AbiField::TupleItems, obj);
                self.cache.insert(items_key, items);
                self.cache.insert(len_key, len);
                (items, len)
            }
        };
        self.check_slot(b, len, index);
        abi::slot_addr(b, items, i64::from(index))
    }

    /// Slot of field `index` of the instance in `reg`, bounds checked
    fn field_slot(&mut self, b: &mut FunctionBuilder<'_>, reg: u16, index: i32) -> ir::Value {
        let fields_key = CacheKey::Register(reg, AbiField::InstanceFields);
        let count_key = CacheKey::Register(reg, AbiField::InstanceFieldCount);
        let (fields, count) = match (self.cache.get(&fields_key), self.cache.get(&count_key)) {
            (Some(&fields), Some(&count)) => (fields, count),
            _ => {
                let obj = self.object(b, reg, ValueTag::Object);
                let count = abi::load(b, AbiField::InstanceFieldCount, obj);
                let fields = abi::load(b, AbiField::InstanceFields, obj);
                self.cache.insert(fields_key, fields);
                self.cache.insert(count_key, count);
                (fields, count)
            }
        };
        self.check_slot(b, count, index);
        abi::slot_addr(b, fields, i64::from(index))
    }

    fn base<T>(&self, base: Option<T>) -> Result<T, CodegenError> {
        base.ok_or(self.malformed("call data pointer not loaded"))
    }

    /// Leave with an index error unless `index < len`; negative indices
    /// compare as huge unsigned values and always fail
    fn check_slot(&mut self, b: &mut FunctionBuilder<'_>, len: ir::Value, index: i32) {
        let outside = b.ins().icmp_imm(IntCC::UnsignedLessThanOrEqual, len, i64::from(index));
        self.fail_if(b, outside, ErrorCode::Index);
    }

    /// Address of slot `index` of a storage class, bounds checked
    fn storage_slot(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        class: StorageClass,
        index: i32,
    ) -> Result<ir::Value, CodegenError> {
        let (base, len) = match class {
            StorageClass::Static => self.base(self.bases.class_statics)?,
            StorageClass::Global => self.base(self.bases.globals)?,
            StorageClass::Object => {
                let (fields, count) = self.base(self.bases.object_fields)?;
                if !self.cache.contains_key(&CacheKey::ObjectFields) {
                    let missing = b.ins().icmp_imm(IntCC::Equal, fields, 0);
                    self.fail_if(b, missing, ErrorCode::Value);
                    self.cache.insert(CacheKey::ObjectFields, fields);
                }
                (fields, count)
            }
            StorageClass::Outer(depth) => self.outer_frame(b, depth)?,
        };
        self.check_slot(b, len, index);
        Ok(abi::slot_addr(b, base, i64::from(index)))
    }

    /// Register file and length of the enclosing frame at `depth`
    fn outer_frame(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        depth: i32,
    ) -> Result<(ir::Value, ir::Value), CodegenError> {
        let regs_key = CacheKey::OuterFrame(depth, AbiField::OuterRegisters);
        let len_key = CacheKey::OuterFrame(depth, AbiField::OuterLen);
        if let (Some(&regs), Some(&len)) = (self.cache.get(&regs_key), self.cache.get(&len_key)) {
            return Ok((regs, len));
        }
        let (frames, count) = self.base(self.bases.outer_frames)?;
        self.check_slot(b, count, depth);
        let view = b.ins().iadd_imm(frames, i64::from(depth) * i64::from(abi::OUTER_VIEW_SIZE));
        let regs = abi::load(b, AbiField::OuterRegisters, view);
        let len = abi::load(b, AbiField::OuterLen, view);
        self.cache.insert(regs_key, regs);
        self.cache.insert(len_key, len);
        Ok((regs, len))
    }

    fn constant(&self, index: i32) -> Result<&'a Value, CodegenError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.routine.constants().get(i))
            .ok_or(self.malformed("constant index out of range"))
    }

    fn constant_slot(&mut self, b: &mut FunctionBuilder<'_>, index: i32) -> Result<ir::Value, CodegenError> {
        let constants = self.base(self.bases.constants)?;
        Ok(abi::slot_addr(b, constants, i64::from(index)))
    }

    // ------------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------------

    fn instruction(&mut self, b: &mut FunctionBuilder<'_>, ins: &Instruction) -> Result<(), CodegenError> {
        use Opcode::*;
        use ScalarKind::{Bool as B, Complex as C, Float as F, Int as I};

        let op = ins.opcode;
        let (ra, rb, rc) = (ins.ra(), ins.rb(), ins.rc());
        match op {
            Nop | Case => {}

            Data => {
                let value = match ValueTag::from_u32(ins.a as u32) {
                    Some(ValueTag::Bool) => (B, b.ins().iconst(types::I64, i64::from(ins.b != 0))),
                    Some(ValueTag::Int) => (I, b.ins().iconst(types::I64, i64::from(ins.b))),
                    Some(ValueTag::Float) => (F, b.ins().f64const(f64::from(ins.b))),
                    _ => return Err(self.operand_error(rc)),
                };
                self.write(b, rc, value.0, Scalar::Word(value.1))?;
            }
            GetConst => {
                let src = self.constant_slot(b, ins.b)?;
                let dst = self.slot(b, rc);
                let any = b.ins().iconst(types::I32, i64::from(ANY_TAG));
                // A wildcard move cannot fail
                self.call(b, RuntimeHelper::ValueMove, &[dst, src, any])?;
                self.reload(b, rc);
            }
            GetConstB | GetConstI | GetConstF | GetConstC => {
                let [lo, hi] = self.constant(ins.b)?.words();
                let kind = family_kind(op, GetConstB);
                let value = match kind {
                    B => Scalar::Word(b.ins().iconst(types::I64, i64::from(lo != 0))),
                    I => Scalar::Word(b.ins().iconst(types::I64, lo as i64)),
                    F => Scalar::Word(b.ins().f64const(Ieee64::with_bits(lo))),
                    C => Scalar::Pair(
                        b.ins().f64const(Ieee64::with_bits(lo)),
                        b.ins().f64const(Ieee64::with_bits(hi)),
                    ),
                };
                self.write(b, rc, kind, value)?;
            }
            GetConstS => {
                let src = self.constant_slot(b, ins.b)?;
                let dst = self.slot(b, rc);
                self.call(b, RuntimeHelper::StringMove, &[dst, src])?;
                self.reload(b, rc);
            }
            Move => {
                self.sync(b, ra)?;
                let src = self.slot(b, ra);
                let dst = self.slot(b, rc);
                let any = b.ins().iconst(types::I32, i64::from(ANY_TAG));
                self.call(b, RuntimeHelper::ValueMove, &[dst, src, any])?;
                self.reload(b, rc);
            }
            MoveSS => {
                let src = self.slot(b, ra);
                let dst = self.slot(b, rc);
                self.call(b, RuntimeHelper::StringMove, &[dst, src])?;
                self.reload(b, rc);
            }

            // Typed moves
            MoveBB | MoveII | MoveFF | MoveCC => {
                let kind = family_kind(op, MoveBB);
                let value = self.read(b, ra, kind)?;
                self.write(b, rc, kind, value)?;
            }
            MoveIF => {
                let x = self.float(b, ra)?;
                let v = b.ins().fcvt_to_sint_sat(types::I64, x);
                self.write_int(b, rc, v)?;
            }
            MoveFI => {
                let x = self.int(b, ra)?;
                let v = b.ins().fcvt_from_sint(types::F64, x);
                self.write_float(b, rc, v)?;
            }
            MoveIB => {
                let x = self.boolean(b, ra)?;
                self.write_int(b, rc, x)?;
            }
            MoveBI => {
                let x = self.int(b, ra)?;
                let cond = b.ins().icmp_imm(IntCC::NotEqual, x, 0);
                self.write_cond(b, rc, cond)?;
            }
            MoveCI | MoveCF => {
                let re = if op == MoveCI {
                    let x = self.int(b, ra)?;
                    b.ins().fcvt_from_sint(types::F64, x)
                } else {
                    self.float(b, ra)?
                };
                let im = b.ins().f64const(0.0);
                self.write(b, rc, C, Scalar::Pair(re, im))?;
            }

            // Unary
            NotB => {
                let x = self.boolean(b, ra)?;
                let cond = b.ins().icmp_imm(IntCC::Equal, x, 0);
                self.write_cond(b, rc, cond)?;
            }
            NotI => {
                let x = self.int(b, ra)?;
                let cond = b.ins().icmp_imm(IntCC::Equal, x, 0);
                let v = b.ins().uextend(types::I64, cond);
                self.write_int(b, rc, v)?;
            }
            NegI => {
                let x = self.int(b, ra)?;
                let v = b.ins().ineg(x);
                self.write_int(b, rc, v)?;
            }
            NegF => {
                let x = self.float(b, ra)?;
                let v = b.ins().fneg(x);
                self.write_float(b, rc, v)?;
            }
            NegC => {
                let (re, im) = self.complex(b, ra)?;
                let value = Scalar::Pair(b.ins().fneg(re), b.ins().fneg(im));
                self.write(b, rc, C, value)?;
            }
            BitNotI => {
                let x = self.int(b, ra)?;
                let v = b.ins().bnot(x);
                self.write_int(b, rc, v)?;
            }

            AddIII | SubIII | MulIII | DivIII | ModIII | PowIII | BitAndIII | BitOrIII | BitXorIII | ShlIII
            | ShrIII => self.int_binary(b, ins)?,
            AndBBB | OrBBB => {
                let x = self.boolean(b, ra)?;
                let y = self.boolean(b, rb)?;
                let x = b.ins().icmp_imm(IntCC::NotEqual, x, 0);
                let y = b.ins().icmp_imm(IntCC::NotEqual, y, 0);
                let cond = if op == AndBBB { b.ins().band(x, y) } else { b.ins().bor(x, y) };
                self.write_cond(b, rc, cond)?;
            }
            AddFFF | SubFFF | MulFFF | DivFFF | ModFFF | PowFFF => self.float_binary(b, ins)?,
            MathF => {
                let f = MathFn::from_i32(ins.a).ok_or(CodegenError::Unsupported(op))?;
                let x = self.float(b, rb)?;
                let v = match RuntimeHelper::for_math(f) {
                    Some(helper) => self.call_value(b, helper, &[x])?,
                    None => match f {
                        MathFn::Sqrt => b.ins().sqrt(x),
                        MathFn::Abs => b.ins().fabs(x),
                        MathFn::Ceil => b.ins().ceil(x),
                        MathFn::Floor => b.ins().floor(x),
                        _ => return Err(CodegenError::Unsupported(op)),
                    },
                };
                self.write_float(b, rc, v)?;
            }
            AddCCC | SubCCC | MulCCC | DivCCC => self.complex_binary(b, ins)?,

            _ if op.is_comparison() => {
                let cond = self.compare(b, ins)?;
                if self.plan.is_fused(self.index) {
                    self.pending = Some(cond);
                } else {
                    self.write_cond(b, rc, cond)?;
                }
            }

            // Generic arithmetic on arrays
            Add | Sub | Mul | Div | Mod | Pow => {
                self.sync(b, ra)?;
                self.sync(b, rb)?;
                let opcode = b.ins().iconst(types::I32, i64::from(op.to_u16()));
                let dst = self.slot(b, rc);
                let x = self.slot(b, ra);
                let y = self.slot(b, rb);
                self.call_checked(b, RuntimeHelper::ArrayArith, &[opcode, dst, x, y])?;
                self.reload(b, rc);
            }
            SetIndex => {
                let index = self.slot(b, rb);
                self.check_tag(b, index, ValueTag::None);
                self.sync(b, ra)?;
                let dst = self.slot(b, rc);
                let src = self.slot(b, ra);
                self.call_checked(b, RuntimeHelper::ArrayAssign, &[dst, src])?;
            }

            // Strings and sizes
            AddSSS => {
                let dst = self.slot(b, rc);
                let x = self.slot(b, ra);
                let y = self.slot(b, rb);
                self.call(b, RuntimeHelper::StringConcat, &[dst, x, y])?;
                self.reload(b, rc);
            }
            StringGetChar => {
                let index = self.int(b, rb)?;
                let obj = self.object(b, ra, ValueTag::String);
                let len = abi::load(b, AbiField::StringLen, obj);
                let i = self.normalize(b, index, len);
                let data = abi::load(b, AbiField::StringData, obj);
                let addr = b.ins().iadd(data, i);
                let byte = b.ins().uload8(types::I64, abi::flags(), addr, 0);
                self.write_int(b, rc, byte)?;
            }
            StringSetChar => {
                let index = self.int(b, rb)?;
                let ch = self.int(b, ra)?;
                let slot = self.slot(b, rc);
                self.call_checked(b, RuntimeHelper::StringSetChar, &[slot, index, ch])?;
                self.reload(b, rc);
            }
            SizeIS | SizeIA | SizeIL => {
                let (tag, field) = match op {
                    SizeIS => (ValueTag::String, AbiField::StringLen),
                    SizeIA => (ValueTag::Array, AbiField::ArraySize),
                    _ => (ValueTag::List, AbiField::ListLen),
                };
                let obj = self.object(b, ra, tag);
                let n = abi::load(b, field, obj);
                self.write_int(b, rc, n)?;
            }

            // Arrays
            ArrayGetI | ArrayGetF | ArrayGetC => {
                let kind = numeric_kind(op, ArrayGetI);
                let obj = self.array(b, ra)?;
                let flat = self.flat_index(b, obj, rb)?;
                let addr = Self::element_addr(b, obj, flat, kind);
                let value = abi::load_element(b, kind.scalar(), addr);
                self.write(b, rc, kind.scalar(), value)?;
            }
            ArraySetI | ArraySetF | ArraySetC => {
                let kind = numeric_kind(op, ArraySetI);
                let value = self.read(b, ra, kind.scalar())?;
                let obj = self.array(b, rc)?;
                let flat = self.flat_index(b, obj, rb)?;
                let addr = Self::element_addr(b, obj, flat, kind);
                abi::store_element(b, addr, value);
            }
            ArrayGetMultiI | ArrayGetMultiF | ArrayGetMultiC => {
                let kind = numeric_kind(op, ArrayGetMultiI);
                let obj = self.array(b, ra)?;
                let flat = self.flat_multi_index(b, obj, ra, ins.b)?;
                let addr = Self::element_addr(b, obj, flat, kind);
                let value = abi::load_element(b, kind.scalar(), addr);
                self.write(b, rc, kind.scalar(), value)?;
            }
            ArraySetMultiI | ArraySetMultiF | ArraySetMultiC => {
                let kind = numeric_kind(op, ArraySetMultiI);
                let value = self.read(b, ra, kind.scalar())?;
                let obj = self.array(b, rc)?;
                let flat = self.flat_multi_index(b, obj, rc, ins.b)?;
                let addr = Self::element_addr(b, obj, flat, kind);
                abi::store_element(b, addr, value);
            }

            // Lists and tuples
            ListGetI | ListGetF | ListGetC => {
                let kind = numeric_kind(op, ListGetI);
                let index = self.int(b, rb)?;
                let list = self.slot(b, ra);
                let dst = self.slot(b, rc);
                let tag = expected_tag(self.routine.reg_type(rc), kind);
                let expected = b.ins().iconst(types::I32, i64::from(tag));
                self.call_checked(b, RuntimeHelper::ListGet, &[list, index, dst, expected])?;
                self.reload(b, rc);
            }
            ListSetI | ListSetF | ListSetC => {
                let kind = numeric_kind(op, ListSetI);
                if self.kind_of(ra)? != kind.scalar() {
                    return Err(self.operand_error(ra));
                }
                self.sync(b, ra)?;
                let index = self.int(b, rb)?;
                let list = self.slot(b, rc);
                let src = self.slot(b, ra);
                self.call_checked(b, RuntimeHelper::ListSet, &[list, index, src])?;
            }
            TupleGet => {
                let src = self.tuple_slot(b, ra, ins.b);
                let dst = self.slot(b, rc);
                let tag = register_tag(self.routine.reg_type(rc));
                let expected = b.ins().iconst(types::I32, i64::from(tag));
                self.call_checked(b, RuntimeHelper::ValueMove, &[dst, src, expected])?;
                self.reload(b, rc);
            }
            TupleGetB | TupleGetI | TupleGetF | TupleGetC => {
                let kind = family_kind(op, TupleGetB);
                let addr = self.tuple_slot(b, ra, ins.b);
                let value = abi::load_scalar(b, kind, addr, 0);
                self.write(b, rc, kind, value)?;
            }
            TupleSet => {
                self.sync(b, ra)?;
                let src = self.slot(b, ra);
                let tag = tuple_item_tag(self.routine.reg_type(rc), ins.b as usize);
                // The item type is checked before the tuple itself
                if tag != ANY_TAG {
                    let actual = abi::load(b, AbiField::ValueTag, src);
                    let wrong = b.ins().icmp_imm(IntCC::NotEqual, actual, i64::from(tag));
                    self.fail_if(b, wrong, ErrorCode::Value);
                }
                let dst = self.tuple_slot(b, rc, ins.b);
                let expected = b.ins().iconst(types::I32, i64::from(tag));
                self.call_checked(b, RuntimeHelper::ValueMove, &[dst, src, expected])?;
            }
            TupleSetB | TupleSetI | TupleSetF | TupleSetC => {
                let kind = family_kind(op, TupleSetB);
                let addr = self.tuple_slot(b, rc, ins.b);
                let value = self.read(b, ra, kind)?;
                abi::store_scalar(b, addr, register_tag(self.routine.reg_type(ra)), value);
            }

            // Storage classes
            GetVarOB | GetVarOI | GetVarOF | GetVarOC => {
                self.get_var(b, ins, StorageClass::Object, family_kind(op, GetVarOB))?
            }
            GetVarKB | GetVarKI | GetVarKF | GetVarKC => {
                self.get_var(b, ins, StorageClass::Static, family_kind(op, GetVarKB))?
            }
            GetVarGB | GetVarGI | GetVarGF | GetVarGC => {
                self.get_var(b, ins, StorageClass::Global, family_kind(op, GetVarGB))?
            }
            GetVarHB | GetVarHI | GetVarHF | GetVarHC => {
                self.get_var(b, ins, StorageClass::Outer(ins.a), family_kind(op, GetVarHB))?
            }
            SetVarOB | SetVarOI | SetVarOF | SetVarOC => {
                self.set_var(b, ins, StorageClass::Object, ins.c, family_kind(op, SetVarOB))?
            }
            SetVarKB | SetVarKI | SetVarKF | SetVarKC => {
                self.set_var(b, ins, StorageClass::Static, ins.c, family_kind(op, SetVarKB))?
            }
            SetVarGB | SetVarGI | SetVarGF | SetVarGC => {
                self.set_var(b, ins, StorageClass::Global, ins.c, family_kind(op, SetVarGB))?
            }
            SetVarHB | SetVarHI | SetVarHF | SetVarHC => {
                self.set_var(b, ins, StorageClass::Outer(ins.c), ins.b, family_kind(op, SetVarHB))?
            }

            // Instance fields
            GetFieldB | GetFieldI | GetFieldF | GetFieldC => {
                let kind = family_kind(op, GetFieldB);
                let slot = self.field_slot(b, ra, ins.b);
                let value = abi::load_scalar(b, kind, slot, 0);
                self.write(b, rc, kind, value)?;
            }
            SetFieldB | SetFieldI | SetFieldF | SetFieldC => {
                let kind = family_kind(op, SetFieldB);
                let slot = self.field_slot(b, rc, ins.b);
                let value = self.read(b, ra, kind)?;
                abi::store_scalar(b, slot, register_tag(self.routine.reg_type(ra)), value);
            }

            // Control flow
            Goto => {
                let target = self.target(ins.target())?;
                self.jump(b, target);
            }
            TestB | TestI => {
                let cond = match self.pending.take() {
                    Some(cond) if op == TestB => cond,
                    _ if op == TestB => self.boolean(b, ra)?,
                    _ => self.int(b, ra)?,
                };
                let taken = self.target(ins.target())?;
                let next = self.target(self.index + 1)?;
                self.branch(b, cond, next, taken);
            }
            TestF => {
                let x = self.float(b, ra)?;
                let zero = b.ins().f64const(0.0);
                let is_zero = b.ins().fcmp(FloatCC::Equal, x, zero);
                let taken = self.target(ins.target())?;
                let next = self.target(self.index + 1)?;
                self.branch(b, is_zero, taken, next);
            }
            Switch => self.switch(b, ins)?,
            Return => {
                let exit = b.ins().iconst(types::I64, self.index as i64);
                abi::store(b, AbiField::CallExitIndex, self.bases.call_data, exit);
                let success = self.success;
                self.jump(b, success);
            }

            _ => return Err(CodegenError::Unsupported(op)),
        }
        Ok(())
    }

    fn int_binary(&mut self, b: &mut FunctionBuilder<'_>, ins: &Instruction) -> Result<(), CodegenError> {
        use Opcode::*;
        let x = self.int(b, ins.ra())?;
        let y = self.int(b, ins.rb())?;
        let v = match ins.opcode {
            AddIII => b.ins().iadd(x, y),
            SubIII => b.ins().isub(x, y),
            MulIII => b.ins().imul(x, y),
            DivIII | ModIII => {
                let zero = b.ins().icmp_imm(IntCC::Equal, y, 0);
                self.fail_if(b, zero, ErrorCode::Arithmetic);
                // MIN / -1 traps in hardware; -1 is handled without dividing
                let minus_one = b.ins().icmp_imm(IntCC::Equal, y, -1);
                let one = b.ins().iconst(types::I64, 1);
                let divisor = b.ins().select(minus_one, one, y);
                if ins.opcode == DivIII {
                    let q = b.ins().sdiv(x, divisor);
                    let negated = b.ins().ineg(x);
                    b.ins().select(minus_one, negated, q)
                } else {
                    b.ins().srem(x, divisor)
                }
            }
            PowIII => {
                let fx = b.ins().fcvt_from_sint(types::F64, x);
                let fy = b.ins().fcvt_from_sint(types::F64, y);
                let p = self.call_value(b, RuntimeHelper::Pow, &[fx, fy])?;
                b.ins().fcvt_to_sint_sat(types::I64, p)
            }
            BitAndIII => b.ins().band(x, y),
            BitOrIII => b.ins().bor(x, y),
            BitXorIII => b.ins().bxor(x, y),
            ShlIII => b.ins().ishl(x, y),
            ShrIII => b.ins().sshr(x, y),
            op => return Err(CodegenError::Unsupported(op)),
        };
        self.write_int(b, ins.rc(), v)
    }

    fn float_binary(&mut self, b: &mut FunctionBuilder<'_>, ins: &Instruction) -> Result<(), CodegenError> {
        use Opcode::*;
        let x = self.float(b, ins.ra())?;
        let y = self.float(b, ins.rb())?;
        let v = match ins.opcode {
            AddFFF => b.ins().fadd(x, y),
            SubFFF => b.ins().fsub(x, y),
            MulFFF => b.ins().fmul(x, y),
            DivFFF => b.ins().fdiv(x, y),
            ModFFF => self.call_value(b, RuntimeHelper::Fmod, &[x, y])?,
            PowFFF => self.call_value(b, RuntimeHelper::Pow, &[x, y])?,
            op => return Err(CodegenError::Unsupported(op)),
        };
        self.write_float(b, ins.rc(), v)
    }

    fn complex_binary(&mut self, b: &mut FunctionBuilder<'_>, ins: &Instruction) -> Result<(), CodegenError> {
        use Opcode::*;
        let (ar, ai) = self.complex(b, ins.ra())?;
        let (br, bi) = self.complex(b, ins.rb())?;
        let (re, im) = match ins.opcode {
            AddCCC => (b.ins().fadd(ar, br), b.ins().fadd(ai, bi)),
            SubCCC => (b.ins().fsub(ar, br), b.ins().fsub(ai, bi)),
            MulCCC => {
                let rr = b.ins().fmul(ar, br);
                let ii = b.ins().fmul(ai, bi);
                let ri = b.ins().fmul(ar, bi);
                let ir = b.ins().fmul(ai, br);
                (b.ins().fsub(rr, ii), b.ins().fadd(ri, ir))
            }
            DivCCC => {
                let br2 = b.ins().fmul(br, br);
                let bi2 = b.ins().fmul(bi, bi);
                let norm = b.ins().fadd(br2, bi2);
                let rr = b.ins().fmul(ar, br);
                let ii = b.ins().fmul(ai, bi);
                let re = b.ins().fadd(rr, ii);
                let ir = b.ins().fmul(ai, br);
                let ri = b.ins().fmul(ar, bi);
                let im = b.ins().fsub(ir, ri);
                (b.ins().fdiv(re, norm), b.ins().fdiv(im, norm))
            }
            op => return Err(CodegenError::Unsupported(op)),
        };
        self.write(b, ins.rc(), ScalarKind::Complex, Scalar::Pair(re, im))
    }

    /// `I8` condition of a typed comparison
    fn compare(&mut self, b: &mut FunctionBuilder<'_>, ins: &Instruction) -> Result<ir::Value, CodegenError> {
        use Opcode::*;
        let (ra, rb) = (ins.ra(), ins.rb());
        Ok(match ins.opcode {
            LtBII | LeBII | EqBII | NeBII => {
                let cc = match ins.opcode {
                    LtBII => IntCC::SignedLessThan,
                    LeBII => IntCC::SignedLessThanOrEqual,
                    EqBII => IntCC::Equal,
                    _ => IntCC::NotEqual,
                };
                let x = self.int(b, ra)?;
                let y = self.int(b, rb)?;
                b.ins().icmp(cc, x, y)
            }
            LtBFF | LeBFF | EqBFF | NeBFF => {
                let cc = match ins.opcode {
                    LtBFF => FloatCC::LessThan,
                    LeBFF => FloatCC::LessThanOrEqual,
                    EqBFF => FloatCC::Equal,
                    _ => FloatCC::NotEqual,
                };
                let x = self.float(b, ra)?;
                let y = self.float(b, rb)?;
                b.ins().fcmp(cc, x, y)
            }
            EqBCC | NeBCC => {
                let (ar, ai) = self.complex(b, ra)?;
                let (br, bi) = self.complex(b, rb)?;
                if ins.opcode == EqBCC {
                    let re = b.ins().fcmp(FloatCC::Equal, ar, br);
                    let im = b.ins().fcmp(FloatCC::Equal, ai, bi);
                    b.ins().band(re, im)
                } else {
                    let re = b.ins().fcmp(FloatCC::NotEqual, ar, br);
                    let im = b.ins().fcmp(FloatCC::NotEqual, ai, bi);
                    b.ins().bor(re, im)
                }
            }
            LtBSS | LeBSS | EqBSS | NeBSS => {
                let cc = match ins.opcode {
                    LtBSS => IntCC::SignedLessThan,
                    LeBSS => IntCC::SignedLessThanOrEqual,
                    EqBSS => IntCC::Equal,
                    _ => IntCC::NotEqual,
                };
                let x = self.slot(b, ra);
                let y = self.slot(b, rb);
                let ord = self.call_value(b, RuntimeHelper::StringCompare, &[x, y])?;
                b.ins().icmp_imm(cc, ord, 0)
            }
            op => return Err(CodegenError::Unsupported(op)),
        })
    }

    fn get_var(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        ins: &Instruction,
        class: StorageClass,
        kind: ScalarKind,
    ) -> Result<(), CodegenError> {
        let addr = self.storage_slot(b, class, ins.b)?;
        let value = abi::load_scalar(b, kind, addr, 0);
        self.write(b, ins.rc(), kind, value)
    }

    fn set_var(
        &mut self,
        b: &mut FunctionBuilder<'_>,
        ins: &Instruction,
        class: StorageClass,
        index: i32,
        kind: ScalarKind,
    ) -> Result<(), CodegenError> {
        let addr = self.storage_slot(b, class, index)?;
        let value = self.read(b, ins.ra(), kind)?;
        abi::store_scalar(b, addr, register_tag(self.routine.reg_type(ins.ra())), value);
        Ok(())
    }

    fn switch(&mut self, b: &mut FunctionBuilder<'_>, ins: &Instruction) -> Result<(), CodegenError> {
        let disc = self.int(b, ins.ra())?;
        let code = self.routine.instructions();
        let count = ins.c.max(0) as usize;
        let cases = code
            .get(self.index + 1..=self.index + count)
            .ok_or(self.malformed("switch table runs past the routine"))?;

        let mut table = Switch::new();
        let mut seen = FxHashSet::default();
        for case in cases {
            // The first case for a key wins; non-integral keys never match
            let Some(key) = self.constant(case.a)?.as_int() else {
                continue;
            };
            if seen.insert(key) {
                table.set_entry(key as u64 as u128, self.target(case.target())?);
            }
        }
        let default = self.target(ins.target())?;
        table.emit(b, disc, default);
        self.filled = true;
        Ok(())
    }
}

