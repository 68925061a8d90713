//! A fluent `Proto` builder for tests (spec.md §2.4 "Test tooling"),
//! grounded on the teacher's `lua_vm/table_builder.rs` builder idiom: push
//! one instruction at a time, track the constant/line tables alongside it,
//! and hand the finished shape to [`Heap::alloc_proto`] — no compiler front
//! end needed to exercise the dispatcher.

use crate::gc::{GcHeader, Heap, Proto, UpvalDesc};
use crate::opcode::{Instruction, OpCode};
use crate::value::{GcRef, Value};

pub struct ProtoBuilder {
    constants: Vec<Value>,
    code: Vec<u32>,
    lines: Vec<u32>,
    protos: Vec<GcRef>,
    upvals: Vec<UpvalDesc>,
    num_params: u8,
    is_vararg: bool,
    max_stack: u8,
    source: String,
    line: u32,
}

impl ProtoBuilder {
    pub fn new(source: impl Into<String>) -> Self {
        ProtoBuilder {
            constants: Vec::new(),
            code: Vec::new(),
            lines: Vec::new(),
            protos: Vec::new(),
            upvals: Vec::new(),
            num_params: 0,
            is_vararg: false,
            max_stack: 32,
            source: source.into(),
            line: 1,
        }
    }

    pub fn params(mut self, n: u8) -> Self {
        self.num_params = n;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn max_stack(mut self, n: u8) -> Self {
        self.max_stack = n;
        self
    }

    pub fn line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    pub fn upval(mut self, from_stack: bool, index: u8) -> Self {
        self.upvals.push(UpvalDesc { from_stack, index });
        self
    }

    pub fn child(mut self, proto: GcRef) -> Self {
        self.protos.push(proto);
        self
    }

    /// Interns a constant, returning its index into `K`.
    pub fn konst(&mut self, v: Value) -> u32 {
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    fn push(&mut self, word: u32) -> &mut Self {
        self.code.push(word);
        self.lines.push(self.line);
        self
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> &mut Self {
        self.push(Instruction::encode_abc(op, a, false, b, c))
    }

    pub fn abck(&mut self, op: OpCode, a: u32, k: bool, b: u32, c: u32) -> &mut Self {
        self.push(Instruction::encode_abc(op, a, k, b, c))
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> &mut Self {
        self.push(Instruction::encode_abx(op, a, bx))
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> &mut Self {
        self.push(Instruction::encode_asbx(op, a, sbx))
    }

    pub fn ax(&mut self, op: OpCode, ax: u32) -> &mut Self {
        self.push(Instruction::encode_ax(op, ax))
    }

    pub fn sj(&mut self, op: OpCode, sj: i32) -> &mut Self {
        self.push(Instruction::encode_sj(op, sj))
    }

    pub fn build(self, heap: &mut Heap) -> GcRef {
        let proto = Proto {
            header: GcHeader::default(),
            constants: self.constants,
            code: self.code,
            protos: self.protos,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack: self.max_stack,
            upvals: self.upvals,
            source: self.source.into(),
            lines: self.lines,
        };
        heap.alloc_proto(proto)
    }
}
