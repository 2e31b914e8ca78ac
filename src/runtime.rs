//! The runtime bundle
//!
//! A `Runtime` owns everything one task of the interpreter mutates:
//! the series heap, the symbol table, the bind table, the call stack
//! and the handle type registry. Nothing in it is shared between
//! threads; separate tasks get separate runtimes.

use std::borrow::Cow;

use tracing::info;

use crate::bind::{
    binder, collect, frame, resolve, var, Activation, BindMode, BindTable, CallStack,
    CollectMode, RebindMode, ResolveMode, Target,
};
use crate::config::RuntimeSettings;
use crate::error::RuntimeError;
use crate::handle::{HandleType, HandleTypes};
use crate::memory::{Heap, HeapStats, RecycleReport, SeriesId};
use crate::symbol::{Sym, SymbolTable};
use crate::value::{FrameId, FuncRef, Value, WordKind, WordRef};

pub struct Runtime {
    heap: Heap,
    symbols: SymbolTable,
    binds: BindTable,
    stack: CallStack,
    handles: HandleTypes,
}

impl Runtime {
    pub fn new(settings: &RuntimeSettings) -> Result<Self, RuntimeError> {
        let mut heap = Heap::new(settings);
        let symbols = SymbolTable::new(&mut heap, settings.symbol_capacity)?;
        info!(
            ballast = settings.ballast,
            symbol_capacity = settings.symbol_capacity,
            "runtime created"
        );
        Ok(Runtime {
            heap,
            symbols,
            binds: BindTable::new(),
            stack: CallStack::new(settings.max_call_depth),
            handles: HandleTypes::new(),
        })
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    pub fn bind_table(&self) -> &BindTable {
        &self.binds
    }

    /// Intern a name
    pub fn intern(&mut self, name: &str) -> Result<Sym, RuntimeError> {
        self.symbols.make_word(&mut self.heap, name.as_bytes())
    }

    /// Spelling of a symbol
    pub fn name(&self, sym: Sym) -> Cow<'_, str> {
        self.symbols.name_str(&self.heap, sym)
    }

    /// An unbound word value
    pub fn word(&mut self, kind: WordKind, name: &str) -> Result<Value, RuntimeError> {
        let sym = self.intern(name)?;
        Ok(Value::Word(WordRef::new(kind, sym)))
    }

    pub fn block(&mut self, values: &[Value]) -> Result<SeriesId, RuntimeError> {
        Ok(self.heap.make_from(values)?)
    }

    pub fn string(&mut self, text: &str) -> Result<Value, RuntimeError> {
        Ok(Value::String(self.heap.make_from(text.as_bytes())?))
    }

    /// Word occurrence at `index` of a block
    pub fn word_at(&self, block: SeriesId, index: usize) -> Option<WordRef> {
        self.heap.get::<Value>(block, index).and_then(|v| v.word())
    }

    pub fn make_object(
        &mut self,
        parent: Option<FrameId>,
        body: SeriesId,
    ) -> Result<FrameId, RuntimeError> {
        binder::make_object(&mut self.heap, &self.symbols, &mut self.binds, parent, body)
    }

    pub fn make_function(
        &mut self,
        params: &[&str],
        body: SeriesId,
    ) -> Result<FuncRef, RuntimeError> {
        let params = params
            .iter()
            .map(|p| self.intern(p))
            .collect::<Result<Vec<_>, _>>()?;
        binder::make_function(&mut self.heap, &self.symbols, &mut self.binds, &params, body)
    }

    pub fn collect_frame(
        &mut self,
        mode: CollectMode,
        prior: Option<FrameId>,
        body: SeriesId,
    ) -> Result<SeriesId, RuntimeError> {
        collect::collect_frame(&mut self.heap, &self.symbols, &mut self.binds, mode, prior, body)
    }

    pub fn collect_words(
        &mut self,
        body: SeriesId,
        mode: CollectMode,
    ) -> Result<Vec<Sym>, RuntimeError> {
        collect::collect_words(&mut self.heap, &self.symbols, &mut self.binds, mode, body)
    }

    pub fn bind(
        &mut self,
        frame: FrameId,
        body: SeriesId,
        mode: BindMode,
    ) -> Result<(), RuntimeError> {
        binder::bind_block(&mut self.heap, &self.symbols, &mut self.binds, frame, body, mode)
    }

    pub fn bind_relative(&mut self, func: &FuncRef, body: SeriesId) -> Result<(), RuntimeError> {
        binder::bind_relative(&mut self.heap, &self.symbols, &mut self.binds, func.id, body)
    }

    pub fn rebind(
        &mut self,
        from: Target,
        to: Target,
        body: SeriesId,
        mode: RebindMode,
    ) -> Result<(), RuntimeError> {
        binder::rebind_block(&mut self.heap, &self.symbols, &mut self.binds, from, to, body, mode)
    }

    pub fn unbind(
        &mut self,
        body: SeriesId,
        target: Option<Target>,
        deep: bool,
    ) -> Result<(), RuntimeError> {
        binder::unbind_block(&mut self.heap, body, target, deep)
    }

    pub fn resolve(
        &mut self,
        target: FrameId,
        source: FrameId,
        selector: Option<&[Sym]>,
        mode: ResolveMode,
    ) -> Result<usize, RuntimeError> {
        resolve::resolve_context(
            &mut self.heap,
            &self.symbols,
            &mut self.binds,
            target,
            source,
            selector,
            mode,
        )
    }

    pub fn clone_frame(&mut self, frame: FrameId, deep: bool) -> Result<FrameId, RuntimeError> {
        frame::clone_frame(&mut self.heap, frame, deep)
    }

    /// Add a field to a frame, returning its index
    pub fn append_frame(&mut self, frame: FrameId, name: &str) -> Result<usize, RuntimeError> {
        let sym = self.intern(name)?;
        frame::append_frame(&mut self.heap, frame, sym)
    }

    /// Index of a field by name, ignoring case
    pub fn find_word(&self, frame: FrameId, name: &str) -> Result<Option<usize>, RuntimeError> {
        let canon = self.symbols.find_canon(&self.heap, name.as_bytes());
        match canon {
            Some(sym) => frame::find_word_index(&self.heap, &self.symbols, frame, sym),
            None => Ok(None),
        }
    }

    pub fn protect_word(
        &mut self,
        frame: FrameId,
        index: usize,
        on: bool,
    ) -> Result<(), RuntimeError> {
        frame::protect_word(&mut self.heap, frame, index, on)
    }

    pub fn words_of(&self, frame: FrameId) -> Result<Vec<Sym>, RuntimeError> {
        frame::words_of(&self.heap, frame)
    }

    /// Value of a frame slot by index
    pub fn field(&self, frame: FrameId, index: usize) -> Option<Value> {
        self.heap.get::<Value>(frame.series(), index)
    }

    pub fn get_var(&self, word: &WordRef) -> Result<Value, RuntimeError> {
        var::get_var(&self.heap, &self.stack, word)
    }

    pub fn set_var(&mut self, word: &WordRef, value: Value) -> Result<(), RuntimeError> {
        var::set_var(&mut self.heap, &self.stack, word, value)
    }

    /// Start a call, filling the leading arguments from `args`
    pub fn call(&mut self, func: &FuncRef, args: &[Value]) -> Result<FrameId, RuntimeError> {
        let frame = self.stack.push_call(&mut self.heap, func.id)?;
        let params = frame::frame_len(&self.heap, frame) - 1;
        for (index, arg) in args.iter().take(params).enumerate() {
            self.heap.set(frame.series(), index + 1, *arg)?;
        }
        Ok(frame)
    }

    /// End the innermost call
    pub fn return_call(&mut self) -> Option<Activation> {
        self.stack.pop_call(&mut self.heap)
    }

    pub fn register_handle_type(&mut self, name: &str) -> Result<HandleType, RuntimeError> {
        let sym = self.intern(name)?;
        let canon = self.symbols.canon(&self.heap, sym);
        self.handles.register(canon)
    }

    pub fn handle_type_name(&self, handle: HandleType) -> Option<Cow<'_, str>> {
        self.handles.name(handle).map(|sym| self.name(sym))
    }

    pub fn collection_pending(&self) -> bool {
        self.heap.collection_pending()
    }

    pub fn recycle(&mut self) -> RecycleReport {
        self.heap.recycle()
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Error message with symbols replaced by their spelling
    pub fn describe(&self, error: &RuntimeError) -> String {
        let text = error.to_string();
        match error.word() {
            Some(sym) => text.replace(&sym.to_string(), &format!("'{}'", self.name(sym))),
            None => text,
        }
    }
}
