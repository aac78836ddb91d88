//! Goto/Label Emulation
//!
//! WebAssembly can only branch outwards, so labels split a body into segments,
//! each wrapped in its own guard block `$G<n>`, all inside one dispatch loop. Two
//! locals drive it:
//! - `$goto_target` is the label id a goto is heading for, -1 when none is in flight
//! - `$goto_reached` becomes 1 once the target label's boundary has been passed
//!
//! A goto stores its target and leaves the current segment. Every later segment is
//! skipped until the target boundary sets the reached flag. Backward gotos fall off the
//! end of the last segment and re-enter the dispatch loop from the top.
//!
//! Every structured block arm is its own label scope. The function body is scope 0 with
//! loop `$D` and first segment `$G0`, a block scope `n` gets `$D<n>` and `$E<n>` but only
//! once a label is defined in it. A goto may leave any number of blocks to reach its
//! label, it can't enter one.

use crate::backends::wasm::control_flow::{BlockKind, BlockToken};
use crate::backends::wasm::function_codegen::{BodyLine, FunctionCodegen};
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::settings::{GOTO_REACHED_LOCAL, GOTO_TARGET_LOCAL};
use crate::{block_log, return_compiler_error, return_unsupported_error};
use rustc_hash::FxHashMap;

const FUNCTION_SCOPE: u32 = 0;

#[derive(Debug)]
struct LabelScope {
    id: u32,

    // Guard block of the segment currently open in this scope
    segment: String,
    labelled: bool,
}

impl LabelScope {
    fn new(id: u32) -> Self {
        LabelScope {
            id,
            segment: entry_segment(id),
            labelled: false,
        }
    }
}

#[derive(Debug)]
pub struct LabelDispatch {
    next_label_id: u32,
    next_scope_id: u32,

    // Open scopes, the function body at the bottom
    scopes: Vec<LabelScope>,

    // Label id to the scope it was defined in
    label_scopes: FxHashMap<u32, u32>,

    // Block scopes that need a dispatch loop
    dispatching: Vec<u32>,
    referenced: Vec<u32>,
    active: bool,
}

impl LabelDispatch {
    pub fn new() -> Self {
        LabelDispatch {
            next_label_id: 1,
            next_scope_id: 1,
            scopes: vec![LabelScope::new(FUNCTION_SCOPE)],
            label_scopes: FxHashMap::default(),
            dispatching: Vec::new(),
            referenced: Vec::new(),
            active: false,
        }
    }

    /// Whether the function needs the two dispatch locals
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether labels were defined at the top level of the function body
    pub fn dispatches_function_body(&self) -> bool {
        self.scopes.first().is_some_and(|scope| scope.labelled)
    }

    fn check_token(&self, token: BlockToken) -> Result<(), CompilerError> {
        if token.kind != BlockKind::GotoGuard || token.id == 0 || token.id >= self.next_label_id {
            return_compiler_error!("Token doesn't name a label of this function", {
                LabelId => token.id,
                BlockKind => token.kind.name(),
            })
        }
        Ok(())
    }
}

fn dispatch_loop(scope: u32) -> String {
    if scope == FUNCTION_SCOPE {
        String::from("$D")
    } else {
        format!("$D{scope}")
    }
}

fn entry_segment(scope: u32) -> String {
    if scope == FUNCTION_SCOPE {
        String::from("$G0")
    } else {
        format!("$E{scope}")
    }
}

fn segment_guard(segment: &str) -> [String; 7] {
    [
        format!("local.get {GOTO_TARGET_LOCAL}"),
        String::from("i32.const -1"),
        String::from("i32.eq"),
        format!("local.get {GOTO_REACHED_LOCAL}"),
        String::from("i32.or"),
        String::from("i32.eqz"),
        format!("br_if {segment}"),
    ]
}

/// Closes the last segment. A goto still in flight means its label is behind us,
/// so dispatch starts over from the top of the scope.
fn scope_epilogue(scope: u32, segment: &str) -> Vec<String> {
    let dispatch = dispatch_loop(scope);
    vec![
        format!("end {segment}"),
        format!("local.get {GOTO_TARGET_LOCAL}"),
        String::from("i32.const -1"),
        String::from("i32.ne"),
        format!("local.get {GOTO_REACHED_LOCAL}"),
        String::from("i32.eqz"),
        String::from("i32.and"),
        format!("br_if {dispatch}"),
        format!("end {dispatch}"),
    ]
}

impl FunctionCodegen<'_> {
    pub fn new_label(&mut self) -> BlockToken {
        let id = self.labels.next_label_id;
        self.labels.next_label_id += 1;
        BlockToken {
            kind: BlockKind::GotoGuard,
            id,
        }
    }

    /// The branch out of the segment is picked in `finish`, once the label's scope is known
    pub fn goto(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        self.labels.check_token(token)?;
        if !self.labels.referenced.contains(&token.id) {
            self.labels.referenced.push(token.id);
        }
        self.labels.active = true;

        self.emit(format!("i32.const {}", token.id));
        self.emit(format!("local.set {GOTO_TARGET_LOCAL}"));
        self.emit("i32.const 0");
        self.emit(format!("local.set {GOTO_REACHED_LOCAL}"));

        let segments = self
            .labels
            .scopes
            .iter()
            .map(|scope| (scope.id, scope.segment.to_owned()))
            .collect();
        self.body.push(BodyLine::GotoBranch {
            label: token.id,
            segments,
        });
        block_log!("goto label ", token.id);
        Ok(())
    }

    /// Ends the current segment of the innermost scope and starts the one guarded by this label
    pub fn define_label(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        self.labels.check_token(token)?;
        if let Some(open) = self.blocks.innermost() {
            if !open.token.kind.has_label_scope() {
                return_unsupported_error!("label inside an expression", {
                    LabelId => token.id,
                    BlockKind => open.token.kind.name(),
                    FunctionName => self.declaration.name,
                })
            }
        }
        if self.labels.label_scopes.contains_key(&token.id) {
            return_compiler_error!("Label defined twice", {
                LabelId => token.id,
                FunctionName => self.declaration.name,
            })
        }

        let Some(scope) = self.labels.scopes.last_mut() else {
            return_compiler_error!("No label scope is open", { LabelId => token.id })
        };
        let id = token.id;
        let previous = std::mem::replace(&mut scope.segment, format!("$G{id}"));
        let scope_id = scope.id;
        if !scope.labelled {
            scope.labelled = true;
            if scope_id != FUNCTION_SCOPE {
                self.labels.dispatching.push(scope_id);
            }
        }
        self.labels.label_scopes.insert(id, scope_id);
        self.labels.active = true;

        self.emit(format!("end {previous}"));
        self.emit(format!("local.get {GOTO_REACHED_LOCAL}"));
        self.emit(format!("local.get {GOTO_TARGET_LOCAL}"));
        self.emit(format!("i32.const {id}"));
        self.emit("i32.eq");
        self.emit("i32.or");
        self.emit(format!("local.set {GOTO_REACHED_LOCAL}"));
        self.emit(format!("block $G{id}"));
        for line in segment_guard(&format!("$G{id}")) {
            self.emit(line);
        }

        block_log!("define label ", id, " in scope ", scope_id);
        Ok(())
    }

    pub fn computed_goto(&mut self) -> Result<(), CompilerError> {
        return_unsupported_error!("computed goto")
    }

    /// Starts the label scope of a block arm, called right after its header
    pub(super) fn open_label_scope(&mut self) {
        let id = self.labels.next_scope_id;
        self.labels.next_scope_id += 1;
        self.labels.scopes.push(LabelScope::new(id));
        self.body.push(BodyLine::LabelScope { scope: id });
    }

    /// Ends the innermost block scope, called right before the arm's terminator
    pub(super) fn close_label_scope(&mut self) -> Result<(), CompilerError> {
        if self.labels.scopes.len() < 2 {
            return_compiler_error!("Label scope closed at the function level")
        }
        let Some(scope) = self.labels.scopes.pop() else {
            return_compiler_error!("No label scope is open")
        };

        if scope.labelled {
            for line in scope_epilogue(scope.id, &scope.segment) {
                self.emit(line);
            }
        }
        Ok(())
    }

    /// What a block scope's placeholder expands to, nothing if no label was defined in it
    pub(super) fn label_scope_prologue(&self, scope: u32) -> Vec<String> {
        if !self.labels.dispatching.contains(&scope) {
            return Vec::new();
        }

        let entry = entry_segment(scope);
        let mut lines = vec![format!("loop {}", dispatch_loop(scope)), format!("block {entry}")];
        lines.extend(segment_guard(&entry));
        lines
    }

    /// The branch a goto takes: out of the segment that was open in the label's scope
    pub(super) fn resolve_goto(&self, label: u32, segments: &[(u32, String)]) -> Result<String, CompilerError> {
        let Some(scope) = self.labels.label_scopes.get(&label) else {
            return_compiler_error!("Goto to a label that is never defined", {
                LabelId => label,
                FunctionName => self.declaration.name,
            })
        };

        match segments.iter().find(|(id, _)| id == scope) {
            Some((_, segment)) => Ok(format!("br {segment}")),
            None => return_unsupported_error!("goto into a block from outside it", {
                LabelId => label,
                FunctionName => self.declaration.name,
            }),
        }
    }

    /// Resets the dispatch locals and, when the function body has labels, opens its
    /// dispatch loop and first segment. Placed before the body.
    pub(super) fn dispatch_prologue(&self) -> Vec<String> {
        let mut lines = vec![
            String::from("i32.const -1"),
            format!("local.set {GOTO_TARGET_LOCAL}"),
            String::from("i32.const 0"),
            format!("local.set {GOTO_REACHED_LOCAL}"),
        ];
        if self.labels.dispatches_function_body() {
            let entry = entry_segment(FUNCTION_SCOPE);
            lines.push(format!("loop {}", dispatch_loop(FUNCTION_SCOPE)));
            lines.push(format!("block {entry}"));
            lines.extend(segment_guard(&entry));
        }
        lines
    }

    pub(super) fn dispatch_epilogue(&self) -> Result<Vec<String>, CompilerError> {
        for id in &self.labels.referenced {
            if !self.labels.label_scopes.contains_key(id) {
                return_compiler_error!("Goto to a label that is never defined", {
                    LabelId => id,
                    FunctionName => self.declaration.name,
                })
            }
        }

        if !self.labels.dispatches_function_body() {
            return Ok(Vec::new());
        }
        match self.labels.scopes.first() {
            Some(scope) => Ok(scope_epilogue(FUNCTION_SCOPE, &scope.segment)),
            None => return_compiler_error!("Function label scope missing"),
        }
    }
}

#[cfg(test)]
#[path = "tests/goto_labels_tests.rs"]
mod tests;
