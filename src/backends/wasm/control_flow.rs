//! Block Nesting Engine
//!
//! Turns the front end's block and branch requests into properly nested
//! `block`/`loop`/`if` regions with named labels:
//! - `$B<n>` plain blocks, ifs, loop exits and branch joins
//! - `$L<n>` loop headers (continue targets)
//! - `$S<n>` switch dispatch blocks and `$C<n>` switch case guards
//!
//! Block ids come from a single per-function counter. Id 0 is never used,
//! a token with id 0 is reserved and gets its id from the first branch to it.

use crate::backends::wasm::function_codegen::{BodyLine, FunctionCodegen};
use crate::backends::wasm::operand::{Constant, Operand, OperandKind, SlotId};
use crate::backends::wasm::types::{MachineType, ValueType};
use crate::compiler_messages::compiler_errors::{CompilerError, ErrorMetaDataKey};
use crate::{block_log, return_compiler_error, return_unsupported_error};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    If,
    IfElse,
    Loop,
    PlainBlock,
    SwitchDispatch,
    SwitchCase,
    GotoGuard,

    // Joins a short circuit expression, the flag is the value produced when jumped to
    PendingBranchResult(bool),
}

impl BlockKind {
    pub fn name(self) -> &'static str {
        match self {
            BlockKind::If => "if",
            BlockKind::IfElse => "if_else",
            BlockKind::Loop => "loop",
            BlockKind::PlainBlock => "block",
            BlockKind::SwitchDispatch => "switch",
            BlockKind::SwitchCase => "case",
            BlockKind::GotoGuard => "label",
            BlockKind::PendingBranchResult(_) => "join",
        }
    }

    /// Statement blocks whose arms can hold labels
    pub fn has_label_scope(self) -> bool {
        matches!(
            self,
            BlockKind::If | BlockKind::IfElse | BlockKind::Loop | BlockKind::PlainBlock | BlockKind::SwitchCase
        )
    }
}

/// Opaque handle to one structured region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockToken {
    pub kind: BlockKind,
    pub id: u32,
}

impl BlockToken {
    pub fn reserved(kind: BlockKind) -> Self {
        BlockToken { kind, id: 0 }
    }

    pub fn is_reserved(&self) -> bool {
        self.id == 0
    }

    /// Label a `br` to this token targets
    pub fn exit_label(&self) -> String {
        match self.kind {
            BlockKind::SwitchDispatch => format!("$S{}", self.id),
            BlockKind::SwitchCase => format!("$C{}", self.id),
            BlockKind::GotoGuard => format!("$G{}", self.id),
            _ => format!("$B{}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct OpenBlock {
    pub token: BlockToken,

    // Operand stack depth when the block was entered, every exit must match it
    pub operand_depth: usize,
}

#[derive(Debug, Clone)]
pub(super) struct SwitchState {
    pub scrutinee: SlotId,
    pub accumulator: SlotId,
    pub machine_type: MachineType,
    pub current_case: u32,
    pub case_values: Vec<i64>,
    pub has_default: bool,
}

#[derive(Debug, Clone)]
struct BlockResult {
    slot: SlotId,
    value_type: ValueType,
    machine_type: MachineType,
}

#[derive(Debug)]
pub struct ControlFlowManager {
    open_blocks: Vec<OpenBlock>,
    next_block_id: u32,
    pub(super) switches: FxHashMap<u32, SwitchState>,
    block_results: FxHashMap<u32, BlockResult>,
}

impl ControlFlowManager {
    pub fn new() -> Self {
        ControlFlowManager {
            open_blocks: Vec::new(),
            next_block_id: 1,
            switches: FxHashMap::default(),
            block_results: FxHashMap::default(),
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_block_id;
        self.next_block_id += 1;
        id
    }

    fn enter(&mut self, token: BlockToken, operand_depth: usize) {
        self.open_blocks.push(OpenBlock {
            token,
            operand_depth,
        });
    }

    pub fn depth(&self) -> usize {
        self.open_blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_blocks.is_empty()
    }

    pub(super) fn innermost(&self) -> Option<&OpenBlock> {
        self.open_blocks.last()
    }

    fn is_open(&self, id: u32) -> bool {
        self.open_blocks.iter().any(|block| block.token.id == id)
    }

    /// The open block matching the token, checking the kind agrees with what was recorded
    fn find_open(&self, token: BlockToken) -> Result<&OpenBlock, CompilerError> {
        match self.open_blocks.iter().rev().find(|b| b.token.id == token.id) {
            Some(block) if block.token.kind == token.kind => Ok(block),
            Some(block) => {
                return_compiler_error!("Block token used with a different kind than it was opened as", {
                    BlockId => token.id,
                    BlockKind => token.kind.name(),
                    ExpectedType => block.token.kind.name(),
                })
            }
            None => {
                return_compiler_error!("Branch to a block that isn't open", {
                    BlockId => token.id,
                    BlockKind => token.kind.name(),
                })
            }
        }
    }

    /// Pops the innermost block, which has to be the one the token names
    fn exit(&mut self, token: BlockToken) -> Result<OpenBlock, CompilerError> {
        match self.open_blocks.last() {
            Some(block) if block.token == token => {}
            Some(block) => {
                let found = block.token;
                return_compiler_error!("Block closed out of order", {
                    BlockId => token.id,
                    BlockKind => token.kind.name(),
                    FoundType => format!("{} {}", found.kind.name(), found.id),
                })
            }
            None => {
                return_compiler_error!("Block closed when no blocks are open", {
                    BlockId => token.id,
                    BlockKind => token.kind.name(),
                })
            }
        }

        match self.open_blocks.pop() {
            Some(block) => Ok(block),
            None => return_compiler_error!("Block stack emptied while closing"),
        }
    }

    fn retag_innermost(&mut self, token: BlockToken) {
        if let Some(block) = self.open_blocks.last_mut() {
            block.token = token;
        }
    }
}

impl FunctionCodegen<'_> {
    fn check_operand_depth(&self, expected: usize, token: BlockToken) -> Result<(), CompilerError> {
        if self.operands.len() != expected {
            return_compiler_error!("Operand stack unbalanced at block boundary", {
                BlockId => token.id,
                BlockKind => token.kind.name(),
                ExpectedType => expected,
                FoundType => self.operands.len(),
            })
        }
        Ok(())
    }

    /// Pops the condition and opens `if`. A pending comparison is tested directly.
    pub fn open_if(&mut self) -> Result<BlockToken, CompilerError> {
        let condition = self.operands.pop()?;
        let condition = self.settle(condition)?;
        self.emit_condition(condition, true)?;

        let token = BlockToken {
            kind: BlockKind::If,
            id: self.blocks.allocate_id(),
        };
        self.emit(format!("if {}", token.exit_label()));
        self.blocks.enter(token, self.operands.len());
        self.open_label_scope();
        block_log!("open if ", token.id);
        Ok(token)
    }

    pub fn open_else(&mut self, token: BlockToken) -> Result<BlockToken, CompilerError> {
        if token.kind != BlockKind::If {
            return_compiler_error!("Else attached to a block that isn't an if", {
                BlockId => token.id,
                BlockKind => token.kind.name(),
            })
        }

        let Some(open) = self.blocks.innermost().copied() else {
            return_compiler_error!("Else with no open if", { BlockId => token.id })
        };
        if open.token != token {
            return_compiler_error!("Else for an if that isn't the innermost block", {
                BlockId => token.id,
                FoundType => open.token.id,
            })
        }
        self.check_operand_depth(open.operand_depth, token)?;

        let token = BlockToken {
            kind: BlockKind::IfElse,
            id: token.id,
        };
        self.blocks.retag_innermost(token);
        self.close_label_scope()?;
        self.emit(format!("else {}", token.exit_label()));
        self.open_label_scope();
        Ok(token)
    }

    pub fn open_block(&mut self) -> Result<BlockToken, CompilerError> {
        let token = BlockToken {
            kind: BlockKind::PlainBlock,
            id: self.blocks.allocate_id(),
        };
        self.emit(format!("block {}", token.exit_label()));
        self.blocks.enter(token, self.operands.len());
        self.open_label_scope();
        block_log!("open block ", token.id);
        Ok(token)
    }

    /// Loops are a `block` around a `loop` so break and continue have separate targets
    pub fn open_loop(&mut self) -> Result<BlockToken, CompilerError> {
        let token = BlockToken {
            kind: BlockKind::Loop,
            id: self.blocks.allocate_id(),
        };
        self.emit(format!("block $B{}", token.id));
        self.emit(format!("loop $L{}", token.id));
        self.blocks.enter(token, self.operands.len());
        self.open_label_scope();
        block_log!("open loop ", token.id);
        Ok(token)
    }

    /// Token for a short circuit join, its block is only opened by the first branch to it
    pub fn reserve_join(&mut self, jump_value: bool) -> BlockToken {
        BlockToken::reserved(BlockKind::PendingBranchResult(jump_value))
    }

    fn open_join(&mut self, token: BlockToken) -> Result<BlockToken, CompilerError> {
        let BlockKind::PendingBranchResult(jump_value) = token.kind else {
            return_compiler_error!("Only branch joins are opened lazily", {
                BlockKind => token.kind.name(),
            })
        };

        let token = BlockToken {
            kind: token.kind,
            id: self.blocks.allocate_id(),
        };
        self.emit(format!("block {} (result i32)", token.exit_label()));
        self.emit(format!("i32.const {}", jump_value as i32));
        self.blocks.enter(token, self.operands.len());
        block_log!("open join ", token.id);
        Ok(token)
    }

    /// Unconditional branch out of the block (`break` for loops and switches)
    pub fn branch(&mut self, token: BlockToken) -> Result<BlockToken, CompilerError> {
        if token.kind == BlockKind::GotoGuard {
            self.goto(token)?;
            return Ok(token);
        }

        let token = self.branch_target(token)?;
        if let Some(jump_value) = self.outer_join_value(token) {
            self.emit(format!("i32.const {}", jump_value as i32));
        }
        self.emit(format!("br {}", token.exit_label()));
        Ok(token)
    }

    /// Pops a condition and branches out of the block when it equals `when`
    pub fn branch_if(&mut self, token: BlockToken, when: bool) -> Result<BlockToken, CompilerError> {
        if matches!(token.kind, BlockKind::GotoGuard | BlockKind::SwitchCase) {
            return_compiler_error!("Conditional branch to a block that can't take one", {
                BlockId => token.id,
                BlockKind => token.kind.name(),
            })
        }

        let condition = self.operands.pop()?;
        let condition = self.settle(condition)?;

        let token = self.branch_target(token)?;

        // Not taken, the extra value is dropped again
        let jump_value = self.outer_join_value(token);
        if let Some(jump_value) = jump_value {
            self.emit(format!("i32.const {}", jump_value as i32));
        }
        self.emit_condition(condition, when)?;
        self.emit(format!("br_if {}", token.exit_label()));
        if jump_value.is_some() {
            self.emit("drop");
        }
        Ok(token)
    }

    /// Opens a reserved join, or checks an open block can be left with the operands as they are
    fn branch_target(&mut self, token: BlockToken) -> Result<BlockToken, CompilerError> {
        if token.is_reserved() {
            return self.open_join(token);
        }

        let open = *self.blocks.find_open(token)?;
        self.check_operand_depth(open.operand_depth, token)?;
        Ok(token)
    }

    /// A join's value sits on the machine stack only while the join is the innermost block.
    /// Branching to it from deeper has to supply the value itself.
    fn outer_join_value(&self, token: BlockToken) -> Option<bool> {
        let BlockKind::PendingBranchResult(jump_value) = token.kind else {
            return None;
        };
        match self.blocks.innermost() {
            Some(open) if open.token == token => None,
            _ => Some(jump_value),
        }
    }

    pub fn continue_loop(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        self.check_loop_token(token)?;
        self.emit(format!("br $L{}", token.id));
        Ok(())
    }

    pub fn continue_loop_if(&mut self, token: BlockToken, when: bool) -> Result<(), CompilerError> {
        let condition = self.operands.pop()?;
        let condition = self.settle(condition)?;
        self.check_loop_token(token)?;
        self.emit_condition(condition, when)?;
        self.emit(format!("br_if $L{}", token.id));
        Ok(())
    }

    fn check_loop_token(&self, token: BlockToken) -> Result<(), CompilerError> {
        if token.kind != BlockKind::Loop {
            return_compiler_error!("Continue to a block that isn't a loop", {
                BlockId => token.id,
                BlockKind => token.kind.name(),
            })
        }
        let open = *self.blocks.find_open(token)?;
        self.check_operand_depth(open.operand_depth, token)
    }

    /// Pushes the value of a short circuit expression whose branches targeted `token`
    pub fn push_pending_branch(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        let BlockKind::PendingBranchResult(jump_value) = token.kind else {
            return_compiler_error!("Pending branch value needs a join token", {
                BlockId => token.id,
                BlockKind => token.kind.name(),
            })
        };

        // Nothing ever jumped, so the expression always falls through
        if token.is_reserved() {
            return self.push_operand(Operand::value(
                OperandKind::Constant(Constant::Int(!jump_value as i64)),
                ValueType::int(false),
            ));
        }

        self.push_operand(Operand::value(
            OperandKind::PendingBranch { join: token },
            ValueType::int(false),
        ))
    }

    /// Leaves the join's value on the machine stack: the jump value if any branch
    /// was taken, its negation if control fell through
    pub(super) fn close_join(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        let open = self.blocks.exit(token).map_err(|e| {
            e.with_metadata(
                ErrorMetaDataKey::CompilationStage,
                "resolving a short circuit value",
            )
        })?;
        self.check_operand_depth(open.operand_depth, token)?;

        self.emit("i32.eqz");
        self.emit(format!("end {}", token.exit_label()));
        block_log!("close join ", token.id);
        Ok(())
    }

    pub fn close_block(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        match token.kind {
            BlockKind::If | BlockKind::IfElse | BlockKind::PlainBlock => {
                let open = self.blocks.exit(token)?;
                self.check_operand_depth(open.operand_depth, token)?;
                self.close_label_scope()?;
                self.emit(format!("end {}", token.exit_label()));
            }
            BlockKind::Loop => {
                let open = self.blocks.exit(token)?;
                self.check_operand_depth(open.operand_depth, token)?;
                self.close_label_scope()?;
                self.emit(format!("end $L{}", token.id));
                self.emit(format!("end $B{}", token.id));
            }
            BlockKind::SwitchDispatch => self.close_switch(token)?,
            BlockKind::SwitchCase | BlockKind::GotoGuard | BlockKind::PendingBranchResult(_) => {
                return_compiler_error!("This kind of block is closed by the backend, not directly", {
                    BlockId => token.id,
                    BlockKind => token.kind.name(),
                })
            }
        }

        block_log!("close ", token.kind.name(), " ", token.id);
        Ok(())
    }

    /// Pops a value as the result of a value producing block. Every arm yields once.
    pub fn yield_block_result(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        self.blocks.find_open(token)?;
        let value = self.operands.pop()?;
        let value = self.settle(value)?;
        let machine_type = self.value_machine_type(&value)?;

        let slot = match self.blocks.block_results.get(&token.id) {
            Some(result) if result.machine_type == machine_type => result.slot,
            Some(result) => {
                return_compiler_error!("Block arms produce different types", {
                    BlockId => token.id,
                    ExpectedType => result.machine_type,
                    FoundType => machine_type,
                })
            }
            None => {
                let slot = self.new_slot(machine_type);
                self.blocks.block_results.insert(
                    token.id,
                    BlockResult {
                        slot,
                        value_type: value.value_type.to_owned(),
                        machine_type,
                    },
                );
                slot
            }
        };

        self.emit_push_value(&value)?;
        self.emit(format!("local.set {slot}"));
        Ok(())
    }

    /// Pushes the result of a closed value producing block
    pub fn push_block_result(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        if self.blocks.is_open(token.id) {
            return_compiler_error!("Block result read before the block closed", {
                BlockId => token.id,
            })
        }

        let Some(result) = self.blocks.block_results.get(&token.id).cloned() else {
            return_compiler_error!("Block never produced a result", {
                BlockId => token.id,
                BlockKind => token.kind.name(),
            })
        };

        self.push_operand(Operand::value(
            OperandKind::LocalSlot(result.slot),
            result.value_type,
        ))
    }

    // Switches

    /// Pops the scrutinee and opens the dispatch block.
    /// The scrutinee goes back on the stack as a local until the switch closes.
    pub fn open_switch(&mut self) -> Result<BlockToken, CompilerError> {
        let scrutinee = self.operands.pop()?;
        let scrutinee = self.settle(scrutinee)?;
        let machine_type = self.value_machine_type(&scrutinee)?;
        if machine_type.is_float() {
            return_compiler_error!("Switch on a floating point value", {
                TypeCode => scrutinee.value_type.code(),
            })
        }

        let scrutinee_slot = self.materialize(&scrutinee)?;
        self.operands.push(Operand::value(
            OperandKind::LocalSlot(scrutinee_slot),
            scrutinee.value_type,
        ));

        let token = BlockToken {
            kind: BlockKind::SwitchDispatch,
            id: self.blocks.allocate_id(),
        };
        let operand_depth = self.operands.len();
        self.emit(format!("block {}", token.exit_label()));
        self.blocks.enter(token, operand_depth);

        let accumulator = self.new_slot(MachineType::I32);
        self.emit("i32.const 0");
        self.emit(format!("local.set {accumulator}"));

        // Code before the first case label can't run, it sits in a guard that is never entered
        let prologue = BlockToken {
            kind: BlockKind::SwitchCase,
            id: self.blocks.allocate_id(),
        };
        self.emit(format!("local.get {accumulator}"));
        self.emit(format!("if {}", prologue.exit_label()));
        self.blocks.enter(prologue, operand_depth);
        self.open_label_scope();

        self.blocks.switches.insert(
            token.id,
            SwitchState {
                scrutinee: scrutinee_slot,
                accumulator,
                machine_type,
                current_case: prologue.id,
                case_values: Vec::new(),
                has_default: false,
            },
        );

        block_log!("open switch ", token.id);
        Ok(token)
    }

    /// Ends the current case guard. Returns the switch state for the next guard.
    fn end_current_case(
        &mut self,
        token: BlockToken,
        closing_switch: bool,
    ) -> Result<SwitchState, CompilerError> {
        self.blocks.find_open(token)?;
        let Some(state) = self.blocks.switches.get(&token.id).cloned() else {
            return_compiler_error!("Switch token has no dispatch state", { BlockId => token.id })
        };

        let case_token = BlockToken {
            kind: BlockKind::SwitchCase,
            id: state.current_case,
        };
        match self.blocks.innermost() {
            Some(open) if open.token == case_token => {}
            _ if closing_switch => {
                return_compiler_error!("Switch closed while a block inside it is still open", {
                    BlockId => token.id,
                    BlockKind => token.kind.name(),
                })
            }
            _ => return_unsupported_error!("case label inside a nested block", {
                BlockId => token.id,
            }),
        }

        let open = self.blocks.exit(case_token)?;
        self.check_operand_depth(open.operand_depth, case_token)?;
        self.close_label_scope()?;
        self.emit(format!("end {}", case_token.exit_label()));
        Ok(state)
    }

    fn open_case_guard(&mut self, token: BlockToken, mut state: SwitchState) -> Result<(), CompilerError> {
        let case_token = BlockToken {
            kind: BlockKind::SwitchCase,
            id: self.blocks.allocate_id(),
        };
        self.emit(format!("local.tee {}", state.accumulator));
        self.emit(format!("if {}", case_token.exit_label()));
        self.blocks.enter(case_token, self.operands.len());
        self.open_label_scope();

        state.current_case = case_token.id;
        self.blocks.switches.insert(token.id, state);
        Ok(())
    }

    /// Starts `case value:`. Falling into it from the previous case keeps the accumulator set.
    pub fn switch_case(&mut self, token: BlockToken, value: i64) -> Result<(), CompilerError> {
        let mut state = self.end_current_case(token, false)?;
        if state.case_values.contains(&value) {
            return_compiler_error!("Duplicate case value", {
                BlockId => token.id,
                FoundType => value,
            })
        }
        state.case_values.push(value);

        let machine_type = state.machine_type;
        self.emit(format!("local.get {}", state.accumulator));
        self.emit(format!("local.get {}", state.scrutinee));
        self.emit(format!("{machine_type}.const {value}"));
        self.emit(format!("{machine_type}.eq"));
        self.emit("i32.or");
        self.open_case_guard(token, state)
    }

    /// Starts `default:`, entered when no case of the whole switch matches.
    /// The case list isn't complete yet so the test is filled in when the function finishes.
    pub fn switch_default(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        let mut state = self.end_current_case(token, false)?;
        if state.has_default {
            return_compiler_error!("Switch has two default labels", { BlockId => token.id })
        }
        state.has_default = true;

        self.body.push(BodyLine::SwitchDefaultGuard {
            switch_id: token.id,
        });
        self.open_case_guard(token, state)
    }

    fn close_switch(&mut self, token: BlockToken) -> Result<(), CompilerError> {
        self.end_current_case(token, true)?;
        let open = self.blocks.exit(token)?;
        self.check_operand_depth(open.operand_depth, token)?;
        self.emit(format!("end {}", token.exit_label()));

        // Drop the scrutinee local pushed by open_switch
        self.operands.pop()?;
        Ok(())
    }

    /// The instructions a default guard expands to once every case value is known
    pub(super) fn render_default_guard(&self, switch_id: u32) -> Result<Vec<String>, CompilerError> {
        let Some(state) = self.blocks.switches.get(&switch_id) else {
            return_compiler_error!("Default label for an unknown switch", { BlockId => switch_id })
        };

        let machine_type = state.machine_type;
        let mut lines = vec![
            format!("local.get {}", state.accumulator),
            String::from("i32.const 1"),
        ];
        for value in &state.case_values {
            lines.push(format!("local.get {}", state.scrutinee));
            lines.push(format!("{machine_type}.const {value}"));
            lines.push(format!("{machine_type}.ne"));
            lines.push(String::from("i32.and"));
        }
        lines.push(String::from("i32.or"));
        Ok(lines)
    }
}

#[cfg(test)]
#[path = "tests/control_flow_tests.rs"]
mod tests;
