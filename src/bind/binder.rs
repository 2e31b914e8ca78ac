//! Binding word occurrences to frames and functions

use crate::error::RuntimeError;
use crate::memory::{Heap, SeriesId};
use crate::symbol::{Sym, SymbolTable};
use crate::value::{Binding, FrameId, FuncId, FuncRef, Value, WordKind, WordSlot};

use super::collect::{collect_frame, CollectMode};
use super::frame::{
    append_frame, copy_deep, frame_from_words, frame_len, frame_words, make_word_list,
};
use super::table::{BindScope, BindTable};

bitflags! {
    /// Options for `bind_block`
    pub struct BindMode: u32 {
        /// Add set-words missing from the frame
        const SET = 0b0001;
        /// Add every word missing from the frame
        const ALL = 0b0010;
        /// Bind inside nested blocks and parens
        const DEEP = 0b0100;
        /// A word missing from the frame is an error
        const STRICT = 0b1000;
    }
}

bitflags! {
    /// Options for `rebind_block`
    pub struct RebindMode: u32 {
        /// Rebind inside nested blocks and parens
        const DEEP = 0b01;
        /// Find the new index by symbol in the destination
        const TRANSLATE = 0b10;
    }
}

/// What a word occurrence can be bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Frame(FrameId),
    Func(FuncId),
}

impl Target {
    fn binding(self, index: usize) -> Binding {
        let index = index as u32;
        match self {
            Target::Frame(frame) => Binding::Absolute { frame, index },
            Target::Func(func) => Binding::Relative { func, index },
        }
    }

    fn owns(self, binding: Binding) -> bool {
        match (self, binding) {
            (Target::Frame(target), Binding::Absolute { frame, .. }) => target == frame,
            (Target::Func(target), Binding::Relative { func, .. }) => target == func,
            _ => false,
        }
    }

    fn words(self, heap: &Heap) -> Result<SeriesId, RuntimeError> {
        match self {
            Target::Frame(frame) => frame_words(heap, frame),
            Target::Func(func) => Ok(func.words()),
        }
    }
}

/// Record every named slot of a word list in the bind table
fn seed(scope: &mut BindScope<'_>, symbols: &SymbolTable, words: SeriesId) {
    for index in 0..scope.heap.len(words) {
        let sym = scope
            .heap
            .get::<WordSlot>(words, index)
            .map_or(Sym::NONE, |slot| slot.sym);
        if !sym.is_none() {
            let canon = symbols.canon(scope.heap, sym);
            scope.set_index(canon, index);
        }
    }
}

/// Bind the words of `body` that the frame defines
///
/// Words the frame lacks are added to it when the mode asks for it,
/// are an error in strict mode, and are otherwise left as they were.
pub fn bind_block(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    frame: FrameId,
    body: SeriesId,
    mode: BindMode,
) -> Result<(), RuntimeError> {
    let words = frame_words(heap, frame)?;
    let mut scope = binds.acquire(heap);
    seed(&mut scope, symbols, words);
    bind_values(&mut scope, symbols, frame, body, mode)
}

fn bind_values(
    scope: &mut BindScope<'_>,
    symbols: &SymbolTable,
    frame: FrameId,
    block: SeriesId,
    mode: BindMode,
) -> Result<(), RuntimeError> {
    for position in 0..scope.heap.len(block) {
        match scope.heap.get::<Value>(block, position) {
            Some(Value::Word(word)) => {
                let canon = symbols.canon(scope.heap, word.sym);
                let index = match scope.index(canon) {
                    Some(index) => index,
                    None if mode.contains(BindMode::ALL)
                        || (mode.contains(BindMode::SET) && word.kind == WordKind::SetWord) =>
                    {
                        let index = append_frame(scope.heap, frame, word.sym)?;
                        scope.set_index(canon, index);
                        index
                    }
                    None if mode.contains(BindMode::STRICT) => {
                        return Err(RuntimeError::NotInContext(word.sym))
                    }
                    None => continue,
                };
                let bound = word.with_binding(Target::Frame(frame).binding(index));
                scope.heap.set(block, position, Value::Word(bound))?;
            }
            Some(Value::Block(inner)) | Some(Value::Paren(inner))
                if mode.contains(BindMode::DEEP) =>
            {
                bind_values(scope, symbols, frame, inner, mode)?
            }
            _ => {}
        }
    }
    Ok(())
}

/// Bind the words of a function body to the function's parameters.
/// Occurrences get the index of the parameter in the word list and
/// are resolved against the call stack when used.
pub fn bind_relative(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    func: FuncId,
    body: SeriesId,
) -> Result<(), RuntimeError> {
    let mut scope = binds.acquire(heap);
    seed(&mut scope, symbols, func.words());
    relative_values(&mut scope, symbols, func, body)
}

fn relative_values(
    scope: &mut BindScope<'_>,
    symbols: &SymbolTable,
    func: FuncId,
    block: SeriesId,
) -> Result<(), RuntimeError> {
    for position in 0..scope.heap.len(block) {
        match scope.heap.get::<Value>(block, position) {
            Some(Value::Word(word)) => {
                let canon = symbols.canon(scope.heap, word.sym);
                if let Some(index) = scope.index(canon).filter(|i| *i > 0) {
                    let bound = word.with_binding(Target::Func(func).binding(index));
                    scope.heap.set(block, position, Value::Word(bound))?;
                }
            }
            Some(Value::Block(inner)) | Some(Value::Paren(inner)) => {
                relative_values(scope, symbols, func, inner)?
            }
            _ => {}
        }
    }
    Ok(())
}

/// Point occurrences bound to `from` at `to` instead
///
/// Without `TRANSLATE` the index is kept, which is right when both
/// share a word list (clones). With it the index is looked up by
/// symbol in the destination's word list and occurrences of words the
/// destination lacks are left alone.
pub fn rebind_block(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    from: Target,
    to: Target,
    body: SeriesId,
    mode: RebindMode,
) -> Result<(), RuntimeError> {
    let deep = mode.contains(RebindMode::DEEP);
    if !mode.contains(RebindMode::TRANSLATE) {
        return rebind_values(heap, from, to, body, deep, None);
    }

    let words = to.words(heap)?;
    let mut scope = binds.acquire(heap);
    seed(&mut scope, symbols, words);
    let BindScope { table, heap } = &mut scope;
    rebind_values(heap, from, to, body, deep, Some((symbols, &**table)))
}

pub(crate) fn rebind_values(
    heap: &mut Heap,
    from: Target,
    to: Target,
    block: SeriesId,
    deep: bool,
    translate: Option<(&SymbolTable, &BindTable)>,
) -> Result<(), RuntimeError> {
    for position in 0..heap.len(block) {
        match heap.get::<Value>(block, position) {
            Some(Value::Word(word)) if from.owns(word.binding) => {
                let index = match translate {
                    Some((symbols, table)) => match table.lookup(symbols.canon(heap, word.sym)) {
                        Some(index) => index,
                        None => continue,
                    },
                    None => word.binding.index().unwrap_or(0),
                };
                let bound = word.with_binding(to.binding(index));
                heap.set(block, position, Value::Word(bound))?;
            }
            Some(Value::Block(inner)) | Some(Value::Paren(inner)) if deep => {
                rebind_values(heap, from, to, inner, deep, translate)?
            }
            _ => {}
        }
    }
    Ok(())
}

/// Reset occurrences to unbound, all of them or only those bound to
/// `target`
pub fn unbind_block(
    heap: &mut Heap,
    body: SeriesId,
    target: Option<Target>,
    deep: bool,
) -> Result<(), RuntimeError> {
    for position in 0..heap.len(body) {
        match heap.get::<Value>(body, position) {
            Some(Value::Word(word))
                if word.binding.is_bound() && target.map_or(true, |t| t.owns(word.binding)) =>
            {
                let unbound = word.with_binding(Binding::Unbound);
                heap.set(body, position, Value::Word(unbound))?;
            }
            Some(Value::Block(inner)) | Some(Value::Paren(inner)) if deep => {
                unbind_block(heap, inner, target, deep)?
            }
            _ => {}
        }
    }
    Ok(())
}

/// Make an object from the set-words of `body`, inheriting the fields
/// of `parent`, and bind `body` into it
pub fn make_object(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    parent: Option<FrameId>,
    body: SeriesId,
) -> Result<FrameId, RuntimeError> {
    let mode = CollectMode::SET | CollectMode::SELF;
    let words = collect_frame(heap, symbols, binds, mode, parent, body)?;
    let object = frame_from_words(heap, words)?;

    if let Some(parent) = parent {
        let (from, to) = (Target::Frame(parent), Target::Frame(object));
        for index in 1..frame_len(heap, parent) {
            let (inherited, nested) = match heap.get::<Value>(parent.series(), index) {
                Some(Value::Block(block)) => {
                    let copy = copy_deep(heap, block)?;
                    (Value::Block(copy), Some(copy))
                }
                Some(Value::Paren(block)) => {
                    let copy = copy_deep(heap, block)?;
                    (Value::Paren(copy), Some(copy))
                }
                Some(Value::Function(mut func)) => {
                    func.body = copy_deep(heap, func.body)?;
                    (Value::Function(func), Some(func.body))
                }
                Some(value) => (value, None),
                None => continue,
            };
            if let Some(nested) = nested {
                rebind_values(heap, from, to, nested, true, None)?;
            }
            heap.set(object.series(), index, inherited)?;
        }
    }

    bind_block(heap, symbols, binds, object, body, BindMode::DEEP)?;
    Ok(object)
}

/// Make a function from parameter names and a body. The body is
/// copied and bound relative to the new function.
pub fn make_function(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    params: &[Sym],
    body: SeriesId,
) -> Result<FuncRef, RuntimeError> {
    {
        let mut scope = binds.acquire(heap);
        for (position, param) in params.iter().enumerate() {
            let canon = symbols.canon(scope.heap, *param);
            if scope.index(canon).is_some() {
                return Err(RuntimeError::DuplicateWord(*param));
            }
            scope.set_index(canon, position + 1);
        }
    }

    let words = make_word_list(heap, params.len(), false)?;
    for param in params {
        heap.push(words, WordSlot::new(*param))?;
    }

    let func = FuncId::new(words);
    let body = copy_deep(heap, body)?;
    bind_relative(heap, symbols, binds, func, body)?;
    Ok(FuncRef { id: func, body })
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::bind::frame::words_of;
    use crate::bind::stack::CallStack;
    use crate::bind::var::get_var;
    use crate::value::WordRef;

    struct Fixture {
        heap: Heap,
        symbols: SymbolTable,
        binds: BindTable,
    }

    impl Fixture {
        fn new() -> Self {
            let mut heap = Heap::default();
            let symbols = SymbolTable::new(&mut heap, 64).unwrap();
            Fixture {
                heap,
                symbols,
                binds: BindTable::new(),
            }
        }

        fn sym(&mut self, name: &str) -> Sym {
            self.symbols.make_word(&mut self.heap, name.as_bytes()).unwrap()
        }

        fn block(&mut self, values: &[Value]) -> SeriesId {
            self.heap.make_from(values).unwrap()
        }

        fn binding(&self, block: SeriesId, index: usize) -> Binding {
            self.heap
                .get::<Value>(block, index)
                .and_then(|v| v.word())
                .unwrap()
                .binding
        }
    }

    #[test]
    pub fn test_make_object_binds_body() {
        let mut f = Fixture::new();
        let (a, b) = (f.sym("a"), f.sym("b"));
        let body = f.block(&[
            Value::Word(WordRef::set_word(a)),
            Value::Integer(1),
            Value::Word(WordRef::set_word(b)),
            Value::Word(WordRef::word(a)),
        ]);
        let object = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, body).unwrap();

        assert_eq!(words_of(&f.heap, object).unwrap(), vec![a, b]);
        assert_eq!(
            f.binding(body, 3),
            Binding::Absolute {
                frame: object,
                index: 1
            }
        );
        assert!(f.binds.is_clear());
    }

    #[test]
    pub fn test_bind_only_versus_all() {
        let mut f = Fixture::new();
        let (x, w) = (f.sym("x"), f.sym("w"));
        let decl = f.block(&[Value::Word(WordRef::set_word(x))]);
        let object = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, decl).unwrap();

        let body = f.block(&[Value::Word(WordRef::word(w))]);
        bind_block(&mut f.heap, &f.symbols, &mut f.binds, object, body, BindMode::empty()).unwrap();
        assert_eq!(f.binding(body, 0), Binding::Unbound);

        bind_block(&mut f.heap, &f.symbols, &mut f.binds, object, body, BindMode::ALL).unwrap();
        let len = frame_len(&f.heap, object);
        assert_eq!(
            f.binding(body, 0),
            Binding::Absolute {
                frame: object,
                index: (len - 1) as u32
            }
        );
    }

    #[test]
    pub fn test_strict_mode_rejects_unknown_words() {
        let mut f = Fixture::new();
        let w = f.sym("missing");
        let decl = f.block(&[]);
        let object = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, decl).unwrap();
        let body = f.block(&[Value::Word(WordRef::word(w))]);

        let result = bind_block(
            &mut f.heap,
            &f.symbols,
            &mut f.binds,
            object,
            body,
            BindMode::STRICT,
        );
        assert_eq!(result, Err(RuntimeError::NotInContext(w)));
        assert!(f.binds.is_clear());
    }

    #[test]
    pub fn test_self_binds_to_slot_zero() {
        let mut f = Fixture::new();
        let body = f.block(&[Value::Word(WordRef::word(Sym::SELF))]);
        let object = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, body).unwrap();
        assert_eq!(
            f.binding(body, 0),
            Binding::Absolute {
                frame: object,
                index: 0
            }
        );
    }

    #[test]
    pub fn test_make_function_binds_relative() {
        let mut f = Fixture::new();
        let (n, other) = (f.sym("n"), f.sym("other"));
        let inner = f.block(&[Value::Word(WordRef::word(n))]);
        let body = f.block(&[Value::Word(WordRef::word(other)), Value::Block(inner)]);
        let func = make_function(&mut f.heap, &f.symbols, &mut f.binds, &[n], body).unwrap();

        assert_ne!(func.body, body);
        assert_eq!(f.binding(body, 0), Binding::Unbound);
        assert_eq!(f.binding(func.body, 0), Binding::Unbound);
        let copied_inner = f.heap.get::<Value>(func.body, 1).and_then(|v| v.nested()).unwrap();
        assert_eq!(
            f.binding(copied_inner, 0),
            Binding::Relative {
                func: func.id,
                index: 1
            }
        );
    }

    #[test]
    pub fn test_duplicate_params() {
        let mut f = Fixture::new();
        let (a, upper) = (f.sym("a"), f.sym("A"));
        let body = f.block(&[]);
        let live = f.heap.live_series().count();

        let result = make_function(&mut f.heap, &f.symbols, &mut f.binds, &[a, upper], body);
        assert_eq!(result, Err(RuntimeError::DuplicateWord(upper)));
        assert!(f.binds.is_clear());
        assert_eq!(f.heap.live_series().count(), live);
    }

    #[test]
    pub fn test_object_fields_come_from_own_body() {
        let mut f = Fixture::new();
        let (a, g, b) = (f.sym("a"), f.sym("g"), f.sym("b"));
        let inner = f.block(&[Value::Word(WordRef::set_word(b)), Value::Integer(2)]);
        let body = f.block(&[
            Value::Word(WordRef::set_word(a)),
            Value::Integer(1),
            Value::Word(WordRef::set_word(g)),
            Value::Block(inner),
        ]);
        let object = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, body).unwrap();

        assert_eq!(words_of(&f.heap, object).unwrap(), vec![a, g]);
        assert_eq!(f.binding(inner, 0), Binding::Unbound);
    }

    #[test]
    pub fn test_rebind_between_function_and_frame() {
        let mut f = Fixture::new();
        let n = f.sym("n");
        let inner = f.block(&[Value::Word(WordRef::word(n))]);
        let body = f.block(&[Value::Block(inner)]);
        let func = make_function(&mut f.heap, &f.symbols, &mut f.binds, &[n], body).unwrap();
        let nested = f.heap.get::<Value>(func.body, 0).and_then(|v| v.nested()).unwrap();

        let mut stack = CallStack::new(8);
        let frame = stack.push_call(&mut f.heap, func.id).unwrap();
        f.heap.set(frame.series(), 1, Value::Integer(5)).unwrap();

        let (relative, absolute) = (Target::Func(func.id), Target::Frame(frame));
        rebind_block(
            &mut f.heap,
            &f.symbols,
            &mut f.binds,
            relative,
            absolute,
            func.body,
            RebindMode::empty(),
        )
        .unwrap();
        assert_eq!(f.binding(nested, 0), relative.binding(1));

        rebind_block(
            &mut f.heap,
            &f.symbols,
            &mut f.binds,
            relative,
            absolute,
            func.body,
            RebindMode::DEEP,
        )
        .unwrap();
        assert_eq!(f.binding(nested, 0), Binding::Absolute { frame, index: 1 });
        let word = f.heap.get::<Value>(nested, 0).and_then(|v| v.word()).unwrap();
        assert_eq!(get_var(&f.heap, &stack, &word), Ok(Value::Integer(5)));

        rebind_block(
            &mut f.heap,
            &f.symbols,
            &mut f.binds,
            absolute,
            relative,
            func.body,
            RebindMode::DEEP,
        )
        .unwrap();
        assert_eq!(
            f.binding(nested, 0),
            Binding::Relative {
                func: func.id,
                index: 1
            }
        );
        let word = f.heap.get::<Value>(nested, 0).and_then(|v| v.word()).unwrap();
        assert_eq!(get_var(&f.heap, &stack, &word), Ok(Value::Integer(5)));
    }

    #[test]
    pub fn test_rebind_translate() {
        let mut f = Fixture::new();
        let (a, b) = (f.sym("a"), f.sym("b"));
        let first = f.block(&[
            Value::Word(WordRef::set_word(a)),
            Value::Word(WordRef::set_word(b)),
        ]);
        let src = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, first).unwrap();
        let second = f.block(&[Value::Word(WordRef::set_word(b))]);
        let dst = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, second).unwrap();

        let body = f.block(&[Value::Word(WordRef::word(a)), Value::Word(WordRef::word(b))]);
        bind_block(&mut f.heap, &f.symbols, &mut f.binds, src, body, BindMode::empty()).unwrap();

        rebind_block(
            &mut f.heap,
            &f.symbols,
            &mut f.binds,
            Target::Frame(src),
            Target::Frame(dst),
            body,
            RebindMode::TRANSLATE,
        )
        .unwrap();

        assert_eq!(f.binding(body, 0), Binding::Absolute { frame: src, index: 1 });
        assert_eq!(f.binding(body, 1), Binding::Absolute { frame: dst, index: 1 });
    }

    #[test]
    pub fn test_unbind() {
        let mut f = Fixture::new();
        let a = f.sym("a");
        let inner = f.block(&[Value::Word(WordRef::word(a))]);
        let body = f.block(&[Value::Word(WordRef::set_word(a)), Value::Block(inner)]);
        let object = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, body).unwrap();
        assert!(f.binding(inner, 0).is_bound());

        unbind_block(&mut f.heap, body, Some(Target::Frame(object)), false).unwrap();
        assert_eq!(f.binding(body, 0), Binding::Unbound);
        assert!(f.binding(inner, 0).is_bound());

        unbind_block(&mut f.heap, body, None, true).unwrap();
        assert_eq!(f.binding(inner, 0), Binding::Unbound);
    }

    #[test]
    pub fn test_inherited_object_reuses_word_list() {
        let mut f = Fixture::new();
        let a = f.sym("a");
        let decl = f.block(&[Value::Word(WordRef::set_word(a)), Value::Integer(5)]);
        let parent = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, decl).unwrap();
        f.heap.set(parent.series(), 1, Value::Integer(5)).unwrap();

        let body = f.block(&[Value::Word(WordRef::set_word(a))]);
        let child = make_object(&mut f.heap, &f.symbols, &mut f.binds, Some(parent), body).unwrap();

        assert_eq!(
            frame_words(&f.heap, child).unwrap(),
            frame_words(&f.heap, parent).unwrap()
        );
        assert_eq!(f.heap.get::<Value>(child.series(), 1), Some(Value::Integer(5)));
        assert_eq!(
            f.binding(body, 0),
            Binding::Absolute {
                frame: child,
                index: 1
            }
        );
    }

    #[test]
    pub fn test_inherited_paren_is_rebound() {
        let mut f = Fixture::new();
        let a = f.sym("a");
        let decl = f.block(&[Value::Word(WordRef::set_word(a)), Value::None]);
        let parent = make_object(&mut f.heap, &f.symbols, &mut f.binds, None, decl).unwrap();
        let paren = f.block(&[Value::Word(WordRef::word(a))]);
        let target = Target::Frame(parent);
        bind_block(
            &mut f.heap,
            &f.symbols,
            &mut f.binds,
            parent,
            paren,
            BindMode::empty(),
        )
        .unwrap();
        f.heap.set(parent.series(), 1, Value::Paren(paren)).unwrap();
        assert_eq!(f.binding(paren, 0), target.binding(1));

        let body = f.block(&[]);
        let child = make_object(&mut f.heap, &f.symbols, &mut f.binds, Some(parent), body).unwrap();

        let copied = match f.heap.get::<Value>(child.series(), 1) {
            Some(Value::Paren(block)) => block,
            other => panic!("expected a paren, found {other:?}"),
        };
        assert_ne!(copied, paren);
        assert_eq!(
            f.binding(copied, 0),
            Binding::Absolute {
                frame: child,
                index: 1
            }
        );
        assert_eq!(f.binding(paren, 0), target.binding(1));
    }
}
