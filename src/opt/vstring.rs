//! Virtual strings.
//!
//! `newstr` with a known length starts a char-by-char virtual; calls
//! recognized as string concatenation or slicing become lazy virtuals
//! that remember their operands instead of running. Lengths of virtual
//! strings are known without touching memory, so `strlen` folds and
//! concatenation chains never copy until something real needs the bytes.
//!
//! Forcing a virtual string emits the allocation plus either the char
//! stores (plain) or `copy_str_content` bulk copies (concat, slice) with
//! lengths precomputed.

use smallvec::{smallvec, SmallVec};

use crate::ir::descr::OopSpec;
use crate::ir::ops::OpKind;
use crate::ir::trace::Operation;
use crate::ir::value::{BoxId, Value, ValueKind};

use super::pipeline::Pipeline;
use super::virtualize::{VirtualData, VirtualState};
use super::InvalidLoop;

fn ops_for(unicode: bool) -> (OpKind, OpKind, OpKind, OpKind) {
    if unicode {
        (
            OpKind::NewUnicode,
            OpKind::UnicodeSetItem,
            OpKind::UnicodeLen,
            OpKind::CopyUnicodeContent,
        )
    } else {
        (
            OpKind::NewStr,
            OpKind::StrSetItem,
            OpKind::StrLen,
            OpKind::CopyStrContent,
        )
    }
}

impl Pipeline<'_> {
    pub(crate) fn opt_newstr(&mut self, op: Operation, unicode: bool) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        let length = match op.arg(0).as_const_int() {
            Some(l) if (0..=u16::MAX as i64).contains(&l) => l as usize,
            _ => return self.emit(op),
        };
        self.vals.virtuals.insert(
            result,
            VirtualState::new(VirtualData::StrPlain {
                unicode,
                chars: vec![Value::int(0); length],
            }),
        );
        Ok(())
    }

    pub(crate) fn opt_strsetitem(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        if let (Value::Box(base), Some(index)) = (op.arg(0), op.arg(1).as_const_int()) {
            if let Some(state) = self.vals.virtuals.get_mut(&base) {
                if let VirtualData::StrPlain { chars, .. } = &mut state.data {
                    if let Some(slot) = chars.get_mut(index as usize) {
                        *slot = op.arg(2);
                        return Ok(());
                    }
                }
            }
        }
        op.args[0] = self.force_value(op.arg(0))?;
        self.emit(op)
    }

    pub(crate) fn opt_strgetitem(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        if let (Value::Box(base), Some(index)) = (op.arg(0), op.arg(1).as_const_int()) {
            if let Some(state) = self.vals.virtuals.get(&base) {
                match &state.data {
                    VirtualData::StrPlain { chars, .. } => {
                        if let Some(&ch) = chars.get(index as usize) {
                            self.vals.make_equal(result, ch);
                            return Ok(());
                        }
                    }
                    VirtualData::StrSlice { source, start, .. } => {
                        // reading through a slice reads the source shifted
                        if let Some(s) = start.as_const_int() {
                            let source = *source;
                            let mut inner = op;
                            inner.args[0] = source;
                            inner.args[1] = Value::int(s + index);
                            return self.opt_strgetitem(inner);
                        }
                    }
                    _ => {}
                }
            }
        }
        op.args[0] = self.force_value(op.arg(0))?;
        self.cse_or_emit(op)
    }

    pub(crate) fn opt_strlen(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        if let Some(len) = self.known_str_length(op.arg(0))? {
            self.vals.make_equal(result, len);
            return Ok(());
        }
        // a virtual's length is computable without its bytes
        if let Value::Box(b) = self.vals.resolve(op.arg(0)) {
            if self.vals.is_virtual(b) {
                let len = self.string_length_value(Value::Box(b), op.kind)?;
                self.vals.make_equal(result, len);
                return Ok(());
            }
        }
        op.args[0] = self.force_value(op.arg(0))?;
        self.cse_or_emit(op)
    }

    /// Length of a string value without forcing it, if known.
    fn known_str_length(&mut self, v: Value) -> Result<Option<Value>, InvalidLoop> {
        let v = self.vals.resolve(v);
        let base = match v {
            Value::Box(b) => b,
            Value::Const(_) => return Ok(None),
        };
        let data = match self.vals.virtuals.get(&base) {
            Some(state) => &state.data,
            None => return Ok(None),
        };
        match data {
            VirtualData::StrPlain { chars, .. } => Ok(Some(Value::int(chars.len() as i64))),
            VirtualData::StrSlice { length, .. } => Ok(Some(*length)),
            VirtualData::StrConcat { left, right, .. } => {
                let (left, right) = (*left, *right);
                let ll = self.known_str_length(left)?;
                let rl = self.known_str_length(right)?;
                match (ll, rl) {
                    (Some(Value::Const(a)), Some(Value::Const(b))) => {
                        match (a.as_int(), b.as_int()) {
                            (Some(a), Some(b)) => Ok(Some(Value::int(a + b))),
                            _ => Ok(None),
                        }
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    /// Calls recognized by their effect-info tag as string builtins.
    pub(crate) fn opt_str_call(
        &mut self,
        op: Operation,
        spec: OopSpec,
    ) -> Result<(), InvalidLoop> {
        let unicode = matches!(
            spec,
            OopSpec::UniConcat | OopSpec::UniSlice | OopSpec::UniEq
        );
        match spec {
            OopSpec::StrConcat | OopSpec::UniConcat => {
                let result = self.op_result(&op)?;
                self.vals.virtuals.insert(
                    result,
                    VirtualState::new(VirtualData::StrConcat {
                        unicode,
                        left: op.arg(0),
                        right: op.arg(1),
                    }),
                );
                Ok(())
            }
            OopSpec::StrSlice | OopSpec::UniSlice => {
                let result = self.op_result(&op)?;
                self.vals.virtuals.insert(
                    result,
                    VirtualState::new(VirtualData::StrSlice {
                        unicode,
                        source: op.arg(0),
                        start: op.arg(1),
                        length: op.arg(2),
                    }),
                );
                Ok(())
            }
            OopSpec::StrEq | OopSpec::UniEq => self.opt_str_eq(op),
            OopSpec::None => unreachable!("not a string builtin"),
        }
    }

    /// String equality: decided from known lengths and char values when
    /// possible, otherwise left as the (pure) call.
    fn opt_str_eq(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        if op.arg(0).same_value(op.arg(1)) {
            self.vals.make_equal(result, Value::int(1));
            return Ok(());
        }
        let ll = self.known_str_length(op.arg(0))?;
        let rl = self.known_str_length(op.arg(1))?;
        if let (Some(a), Some(b)) = (ll, rl) {
            if let (Some(a), Some(b)) = (a.as_const_int(), b.as_const_int()) {
                if a != b {
                    self.vals.make_equal(result, Value::int(0));
                    return Ok(());
                }
            }
        }
        if let Some(decided) = self.compare_plain_chars(op.arg(0), op.arg(1)) {
            self.vals.make_equal(result, Value::int(decided as i64));
            return Ok(());
        }
        self.force_op_args(&mut op)?;
        self.cse_or_emit(op)
    }

    fn plain_chars_of(&self, v: Value) -> Option<&[Value]> {
        match self.vals.resolve(v) {
            Value::Box(p) => match &self.vals.virtuals.get(&p)?.data {
                VirtualData::StrPlain { chars, .. } => Some(chars),
                _ => None,
            },
            _ => None,
        }
    }

    /// Compare two virtual plain strings char by char; `None` when any
    /// pair of chars is not decidable at compile time.
    fn compare_plain_chars(&self, a: Value, b: Value) -> Option<bool> {
        let ca = self.plain_chars_of(a)?;
        let cb = self.plain_chars_of(b)?;
        if ca.len() != cb.len() {
            return Some(false);
        }
        let mut all_equal = true;
        for (x, y) in ca.iter().zip(cb.iter()) {
            match (x.as_const_int(), y.as_const_int()) {
                (Some(x), Some(y)) => {
                    if x != y {
                        return Some(false);
                    }
                }
                _ => {
                    if !x.same_value(*y) {
                        all_equal = false;
                    }
                }
            }
        }
        if all_equal {
            Some(true)
        } else {
            None
        }
    }

    /// Emit the materialization of a virtual string. `b` is its box; the
    /// virtual has already been unregistered by the caller.
    pub(crate) fn force_string(&mut self, b: BoxId, data: VirtualData) -> Result<(), InvalidLoop> {
        match data {
            VirtualData::StrPlain { unicode, chars } => {
                let (newstr, setitem, _, _) = ops_for(unicode);
                self.push_out(Operation {
                    kind: newstr,
                    args: smallvec![Value::int(chars.len() as i64)],
                    result: Some(b),
                    descr: None,
                    guard: None,
                });
                self.vals.mark_nonnull(b);
                for (index, ch) in chars.into_iter().enumerate() {
                    if ch.as_const_int() == Some(0) {
                        continue;
                    }
                    let ch = self.force_value(ch)?;
                    self.push_out(Operation {
                        kind: setitem,
                        args: smallvec![Value::Box(b), Value::int(index as i64), ch],
                        result: None,
                        descr: None,
                        guard: None,
                    });
                }
            }
            VirtualData::StrConcat {
                unicode,
                left,
                right,
            } => {
                let (newstr, _, strlen, copy) = ops_for(unicode);
                let left_len = self.string_length_value(left, strlen)?;
                let right_len = self.string_length_value(right, strlen)?;
                let left = self.force_value(left)?;
                let right = self.force_value(right)?;
                let total = self.emit_pure_fresh(
                    OpKind::IntAdd,
                    smallvec![left_len, right_len],
                    ValueKind::Int,
                )?;
                self.push_out(Operation {
                    kind: newstr,
                    args: smallvec![total],
                    result: Some(b),
                    descr: None,
                    guard: None,
                });
                self.vals.mark_nonnull(b);
                self.push_out(Operation {
                    kind: copy,
                    args: smallvec![left, Value::Box(b), Value::int(0), Value::int(0), left_len],
                    result: None,
                    descr: None,
                    guard: None,
                });
                self.push_out(Operation {
                    kind: copy,
                    args: smallvec![right, Value::Box(b), Value::int(0), left_len, right_len],
                    result: None,
                    descr: None,
                    guard: None,
                });
            }
            VirtualData::StrSlice {
                unicode,
                source,
                start,
                length,
            } => {
                let (newstr, _, _, copy) = ops_for(unicode);
                let source = self.force_value(source)?;
                let start = self.force_value(start)?;
                let length = self.force_value(length)?;
                self.push_out(Operation {
                    kind: newstr,
                    args: smallvec![length],
                    result: Some(b),
                    descr: None,
                    guard: None,
                });
                self.vals.mark_nonnull(b);
                self.push_out(Operation {
                    kind: copy,
                    args: smallvec![source, Value::Box(b), start, Value::int(0), length],
                    result: None,
                    descr: None,
                    guard: None,
                });
            }
            VirtualData::Struct { .. } | VirtualData::Array { .. } => {
                unreachable!("not a string virtual")
            }
        }
        Ok(())
    }

    /// Length of a string value, without materializing any virtual bytes.
    /// A concat's length is the `int_add` of its parts' lengths; only a
    /// real string gets a `strlen` emitted on it.
    fn string_length_value(&mut self, v: Value, strlen: OpKind) -> Result<Value, InvalidLoop> {
        let v = self.vals.resolve(v);
        if let Value::Box(b) = v {
            let parts = match self.vals.virtuals.get(&b) {
                Some(state) => match &state.data {
                    VirtualData::StrPlain { chars, .. } => {
                        return Ok(Value::int(chars.len() as i64))
                    }
                    VirtualData::StrSlice { length, .. } => return Ok(*length),
                    VirtualData::StrConcat { left, right, .. } => Some((*left, *right)),
                    _ => None,
                },
                None => None,
            };
            if let Some((left, right)) = parts {
                let ll = self.string_length_value(left, strlen)?;
                let rl = self.string_length_value(right, strlen)?;
                return self.emit_pure_fresh(
                    OpKind::IntAdd,
                    smallvec![ll, rl],
                    ValueKind::Int,
                );
            }
        }
        let v = self.force_value(v)?;
        let args: SmallVec<[Value; 3]> = smallvec![v];
        self.emit_pure_fresh(strlen, args, ValueKind::Int)
    }
}
