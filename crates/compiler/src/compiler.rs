//! Single-pass Pratt compiler.
//!
//! Expression-oriented: blocks are expressions that yield the last
//! un-terminated expression inside them, declarations leave their defined
//! value on the stack, and `if`/`while`/`for` produce values. Each
//! compiled unit therefore leaves exactly one value; a trailing `;`
//! discards it with `Pop`.
//!
//! The compiler keeps a stack of per-function states (locals, upvalue
//! descriptors, scope depth) and a stack of class states
//! (`has_superclass`). Names resolve to locals, then transitively to
//! upvalues in enclosing functions, then to globals.

use raven_core::{Handle, Heap, Obj, ObjFunction, OpCode, Value};
use tracing::trace;

use crate::error::{CompileError, CompileErrors};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind as T};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compile source text into the top-level script function.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Handle, CompileErrors> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.matches(T::Eof) {
        compiler.top_level_unit();
    }
    compiler.emit_op(OpCode::Nil);
    compiler.emit_op(OpCode::Return);

    let state = compiler
        .functions
        .pop()
        .expect("script function state present");
    if compiler.had_error {
        return Err(CompileErrors(compiler.errors));
    }
    if tracing::enabled!(tracing::Level::TRACE) {
        trace!(
            "\n{}",
            raven_core::debug::disassemble_chunk(compiler.heap, &state.function.chunk, "script")
        );
    }
    Ok(compiler.heap.allocate(Obj::Function(state.function)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct Rule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

impl<'src, 'h> Rule<'src, 'h> {
    fn new(
        prefix: Option<ParseFn<'src, 'h>>,
        infix: Option<ParseFn<'src, 'h>>,
        precedence: Precedence,
    ) -> Rule<'src, 'h> {
        Rule {
            prefix,
            infix,
            precedence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    /// -1 while the initializer is being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct UpvalueDescriptor {
    index: u8,
    is_local: bool,
}

/// Per-function compile state.
struct FunctionState {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: i32,
}

impl FunctionState {
    fn new(kind: FunctionKind, name: Option<Handle>) -> FunctionState {
        // Slot 0 belongs to the callee: `this` inside methods, unnamed
        // otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
        };
        FunctionState {
            function: ObjFunction::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// What a compiled unit left behind.
enum Unit {
    /// One value on the stack; `needs_semi` marks expression-statement
    /// units that must be `;`-terminated unless they end the block.
    Value { needs_semi: bool },
    /// Nothing (only `return`, which leaves the frame entirely).
    Bare,
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    current: Token,
    previous: Token,
    lookahead: Option<Token>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Compiler<'src, 'h> {
        Compiler {
            scanner: Scanner::new(source),
            heap,
            current: Token::synthetic(T::Eof),
            previous: Token::synthetic(T::Eof),
            lookahead: None,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            functions: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // ---- Token plumbing ----

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::synthetic(T::Eof));
        loop {
            let scanner = &mut self.scanner;
            let token = self
                .lookahead
                .take()
                .unwrap_or_else(|| scanner.next_token());
            if token.kind == T::Error {
                let message = token.lexeme.clone();
                self.error_at(&token, &message);
                continue;
            }
            self.current = token;
            break;
        }
    }

    /// Kind of the token after `current`, scanning ahead one token.
    fn peek_next(&mut self) -> T {
        let scanner = &mut self.scanner;
        self.lookahead
            .get_or_insert_with(|| scanner.next_token())
            .kind
    }

    fn check(&self, kind: T) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: T) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: T, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // ---- Error reporting ----

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            T::Eof => " at end".to_string(),
            T::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(CompileError {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    /// Skip forward to a statement boundary after a syntax error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != T::Eof {
            if self.previous.kind == T::Semicolon {
                return;
            }
            match self.current.kind {
                T::Class | T::Func | T::Var | T::For | T::If | T::While | T::Print
                | T::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- Emission ----

    fn state(&self) -> &FunctionState {
        self.functions.last().expect("function state present")
    }

    fn state_mut(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("function state present")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state_mut().function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn code_len(&self) -> usize {
        self.state().function.chunk.code.len()
    }

    /// Emit a forward jump with a placeholder offset; returns the offset
    /// of the operand for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, operand: usize) {
        let jump = self.code_len() - operand - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = &mut self.state_mut().function.chunk;
        chunk.code[operand] = bytes[0];
        chunk.code[operand + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.code_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let existing = self
            .state()
            .function
            .chunk
            .constants
            .iter()
            .position(|&c| c == value);
        if let Some(index) = existing {
            return index as u8;
        }
        match self.state_mut().function.chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::object(handle))
    }

    // ---- Scopes, locals, upvalues ----

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Statement-style scope exit: pop (or close) every local belonging
    /// to the scope.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let state = self.state();
            let captured = match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => local.is_captured,
                _ => break,
            };
            self.state_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Expression-style scope exit: the block's value is on top of the
    /// locals, so park it in the reserve register, pop the locals, and
    /// push it back.
    fn end_scope_preserving_value(&mut self) {
        let state = self.state();
        let doomed = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth >= state.scope_depth)
            .count();
        if doomed == 0 {
            self.state_mut().scope_depth -= 1;
            return;
        }
        self.emit_op(OpCode::SetReserve);
        self.end_scope();
        self.emit_op(OpCode::GetReserve);
    }

    fn add_local(&mut self, name: String) {
        if self.state().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let state = self.state();
        let duplicate = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == -1 || local.depth >= state.scope_depth)
            .any(|local| local.name == name);
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    /// Consume an identifier and declare it. Returns the global-name
    /// constant index, or 0 for locals.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(T::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, function: usize, name: &str) -> Option<u8> {
        let found = self.functions[function]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(index, local)| (index, local.depth));
        match found {
            Some((index, -1)) => {
                self.error("Can't read local variable in its own initializer.");
                Some(index as u8)
            }
            Some((index, _)) => Some(index as u8),
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, function: usize, name: &str) -> Option<u8> {
        if function == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(function - 1, name) {
            self.functions[function - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(function, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(function - 1, name) {
            return self.add_upvalue(function, upvalue, false);
        }
        None
    }

    fn add_upvalue(&mut self, function: usize, index: u8, is_local: bool) -> Option<u8> {
        let descriptor = UpvalueDescriptor { index, is_local };
        let state = &mut self.functions[function];
        if let Some(existing) = state.upvalues.iter().position(|&u| u == descriptor) {
            return Some(existing as u8);
        }
        if state.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return Some(0);
        }
        state.upvalues.push(descriptor);
        let count = state.upvalues.len();
        state.function.upvalue_count = count;
        Some((count - 1) as u8)
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };
        if can_assign && self.matches(T::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ---- Units (block members and top-level forms) ----

    fn top_level_unit(&mut self) {
        match self.unit() {
            Unit::Value { needs_semi } => {
                if !self.matches(T::Semicolon) && needs_semi && !self.check(T::Eof) {
                    self.error_at_current("Expect ';' after expression.");
                }
                // Top level keeps the stack neutral between units.
                self.emit_op(OpCode::Pop);
            }
            Unit::Bare => {}
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn unit(&mut self) -> Unit {
        if self.matches(T::Class) {
            self.class_declaration();
            return Unit::Value { needs_semi: false };
        }
        if self.check(T::Func) && self.peek_next() == T::Identifier {
            self.advance();
            self.func_declaration();
            return Unit::Value { needs_semi: false };
        }
        if self.matches(T::Var) {
            self.var_declaration();
            return Unit::Value { needs_semi: true };
        }
        if self.matches(T::Return) {
            self.return_statement();
            return Unit::Bare;
        }
        if self.matches(T::Print) {
            self.print_statement();
            return Unit::Value { needs_semi: true };
        }
        if self.matches(T::If) {
            self.if_expression();
            return Unit::Value { needs_semi: false };
        }
        if self.matches(T::While) {
            self.while_expression();
            return Unit::Value { needs_semi: false };
        }
        if self.matches(T::For) {
            self.for_expression();
            return Unit::Value { needs_semi: false };
        }
        if self.matches(T::LeftBrace) {
            self.block();
            return Unit::Value { needs_semi: false };
        }
        self.expression();
        Unit::Value { needs_semi: true }
    }

    /// Compile `{ ... }` after the opening brace: a sequence of units
    /// whose last un-terminated expression becomes the block's value.
    fn block(&mut self) {
        self.begin_scope();
        let mut have_value = false;
        while !self.check(T::RightBrace) && !self.check(T::Eof) {
            match self.unit() {
                Unit::Bare => {
                    have_value = false;
                }
                Unit::Value { needs_semi } => {
                    if self.matches(T::Semicolon) {
                        self.emit_op(OpCode::Pop);
                        have_value = false;
                    } else if self.check(T::RightBrace) {
                        have_value = true;
                    } else if needs_semi {
                        self.error_at_current("Expect ';' after expression.");
                        have_value = false;
                    } else {
                        self.emit_op(OpCode::Pop);
                        have_value = false;
                    }
                }
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        if !have_value {
            self.emit_op(OpCode::Nil);
        }
        self.consume(T::RightBrace, "Expect '}' after block.");
        self.end_scope_preserving_value();
    }

    // ---- Declarations ----

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        let name = self.previous.lexeme.clone();
        if self.matches(T::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.define_variable(global);
        // Expression orientation: the declaration's value stays behind.
        self.named_variable(&name, false);
    }

    fn func_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous.lexeme.clone();
        // Initialized before the body so the function can recurse.
        self.mark_initialized();
        let name_handle = self.heap.intern(&name);
        self.function_expression(FunctionKind::Function, Some(name_handle));
        self.define_variable(global);
        self.named_variable(&name, false);
    }

    fn function_expression(&mut self, kind: FunctionKind, name: Option<Handle>) {
        self.functions.push(FunctionState::new(kind, name));
        self.begin_scope();

        self.consume(T::LeftParen, "Expect '(' after function name.");
        if !self.check(T::RightParen) {
            loop {
                if self.state().function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.state_mut().function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(T::Comma) {
                    break;
                }
            }
        }
        self.consume(T::RightParen, "Expect ')' after parameters.");
        self.consume(T::LeftBrace, "Expect '{' before function body.");
        self.block();

        // The body block's value is the implicit return value; an
        // initializer always returns its instance instead.
        if self.state().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::Pop);
            self.emit_op_byte(OpCode::GetLocal, 0);
        }
        self.emit_op(OpCode::Return);

        let state = self.functions.pop().expect("function state present");
        let upvalues = state.upvalues;
        let handle = self.heap.allocate(Obj::Function(state.function));
        let constant = self.make_constant(Value::object(handle));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(T::Identifier, "Expect class name.");
        let name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&name);
        self.declare_variable();
        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.matches(T::Less) {
            self.consume(T::Identifier, "Expect superclass name.");
            let superclass = self.previous.lexeme.clone();
            if name == superclass {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&superclass, false);
            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);
            self.named_variable(&name, false);
            self.emit_op(OpCode::Inherit);
            self.classes
                .last_mut()
                .expect("class state present")
                .has_superclass = true;
        }

        self.named_variable(&name, false);
        self.consume(T::LeftBrace, "Expect '{' before class body.");
        while !self.check(T::RightBrace) && !self.check(T::Eof) {
            self.method();
        }
        self.consume(T::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .classes
            .pop()
            .expect("class state present")
            .has_superclass;
        if has_superclass {
            self.end_scope();
        }
        self.named_variable(&name, false);
    }

    fn method(&mut self) {
        self.consume(T::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        let name_handle = self.heap.intern(&name);
        self.function_expression(kind, Some(name_handle));
        self.emit_op_byte(OpCode::Method, constant);
    }

    // ---- Statements ----

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(T::Semicolon) {
            if self.state().kind == FunctionKind::Initializer {
                self.emit_op_byte(OpCode::GetLocal, 0);
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.emit_op(OpCode::Return);
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(T::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        // Print peeks; the printed value is the statement's value and is
        // discarded by the unit machinery.
        self.emit_op(OpCode::Print);
    }

    // ---- Control flow ----

    fn if_expression(&mut self) {
        self.expression();
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.consume(T::LeftBrace, "Expect '{' after condition.");
        self.block();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(T::Else) {
            if self.matches(T::If) {
                self.if_expression();
            } else {
                self.consume(T::LeftBrace, "Expect '{' after 'else'.");
                self.block();
            }
        } else {
            // Without an else the false edge still yields a value.
            self.emit_op(OpCode::Nil);
        }
        self.patch_jump(else_jump);
    }

    fn while_expression(&mut self) {
        // Placeholder for the loop's value; replaced by each iteration's
        // body value.
        self.emit_op(OpCode::Nil);
        let loop_start = self.code_len();
        self.expression();
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.emit_op(OpCode::Pop);
        self.consume(T::LeftBrace, "Expect '{' after condition.");
        self.block();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_expression(&mut self) {
        self.begin_scope();
        self.consume(T::Identifier, "Expect loop variable name.");
        self.declare_variable();
        self.emit_op(OpCode::Nil);
        self.mark_initialized();
        let slot = (self.state().locals.len() - 1) as u8;

        self.consume(T::In, "Expect 'in' after loop variable.");
        self.expression();
        self.emit_op_byte(OpCode::Int, 0);

        let loop_start = self.code_len();
        let exit_jump = self.emit_jump(OpCode::NextJump);
        self.emit_op_byte(OpCode::SetLocal, slot);
        self.emit_op(OpCode::Pop);
        self.consume(T::LeftBrace, "Expect '{' after loop expression.");
        self.block();
        self.emit_op(OpCode::Pop);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.end_scope();
    }

    // ---- Expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(T::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: T) -> Rule<'src, 'h> {
        match kind {
            T::LeftParen => Rule::new(Some(Self::grouping), Some(Self::call), Precedence::Call),
            T::LeftBracket => {
                Rule::new(Some(Self::list_literal), Some(Self::index), Precedence::Call)
            }
            T::LeftBrace => Rule::new(Some(Self::block_expression), None, Precedence::None),
            T::Dot => Rule::new(None, Some(Self::dot), Precedence::Call),
            T::Minus => Rule::new(Some(Self::unary), Some(Self::binary), Precedence::Term),
            T::Plus => Rule::new(None, Some(Self::binary), Precedence::Term),
            T::Slash | T::Star => Rule::new(None, Some(Self::binary), Precedence::Factor),
            T::Not => Rule::new(Some(Self::unary), None, Precedence::None),
            T::BangEqual | T::EqualEqual => {
                Rule::new(None, Some(Self::binary), Precedence::Equality)
            }
            T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
                Rule::new(None, Some(Self::binary), Precedence::Comparison)
            }
            T::Identifier => Rule::new(Some(Self::variable), None, Precedence::None),
            T::String => Rule::new(Some(Self::string), None, Precedence::None),
            T::Number => Rule::new(Some(Self::number), None, Precedence::None),
            T::And => Rule::new(None, Some(Self::and_operator), Precedence::And),
            T::Or => Rule::new(None, Some(Self::or_operator), Precedence::Or),
            T::True | T::False | T::Nil | T::None => {
                Rule::new(Some(Self::literal), None, Precedence::None)
            }
            T::Some => Rule::new(Some(Self::some_operator), None, Precedence::None),
            T::Super => Rule::new(Some(Self::super_expression), None, Precedence::None),
            T::This => Rule::new(Some(Self::this_expression), None, Precedence::None),
            T::Func => Rule::new(Some(Self::anonymous_function), None, Precedence::None),
            T::If => Rule::new(Some(Self::if_prefix), None, Precedence::None),
            T::While => Rule::new(Some(Self::while_prefix), None, Precedence::None),
            T::For => Rule::new(Some(Self::for_prefix), None, Precedence::None),
            _ => Rule::new(None, None, Precedence::None),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(T::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner produced a valid number literal");
        if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
            self.emit_op_byte(OpCode::Int, value as u8);
        } else {
            let constant = self.make_constant(Value::number(value));
            self.emit_op_byte(OpCode::Constant, constant);
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = &self.previous.lexeme;
        let text = lexeme[1..lexeme.len() - 1].to_string();
        let handle = self.heap.intern(&text);
        let constant = self.make_constant(Value::object(handle));
        self.emit_op_byte(OpCode::Constant, constant);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            T::False => self.emit_op(OpCode::False),
            T::True => self.emit_op(OpCode::True),
            T::Nil => self.emit_op(OpCode::Nil),
            T::None => self.emit_op(OpCode::NoneOption),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        // Soft keyword: `dict` immediately before `{` opens a dict
        // literal; anywhere else it is an ordinary identifier.
        if self.previous.lexeme == "dict" && self.check(T::LeftBrace) {
            self.advance();
            self.dict_literal();
            return;
        }
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn block_expression(&mut self, _can_assign: bool) {
        self.block();
    }

    fn if_prefix(&mut self, _can_assign: bool) {
        self.if_expression();
    }

    fn while_prefix(&mut self, _can_assign: bool) {
        self.while_expression();
    }

    fn for_prefix(&mut self, _can_assign: bool) {
        self.for_expression();
    }

    fn anonymous_function(&mut self, _can_assign: bool) {
        self.function_expression(FunctionKind::Function, None);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            T::Minus => self.emit_op(OpCode::Negate),
            T::Not => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn some_operator(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::SomeOption);
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            T::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            T::EqualEqual => self.emit_op(OpCode::Equal),
            T::Greater => self.emit_op(OpCode::Greater),
            T::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            T::Less => self.emit_op(OpCode::Less),
            T::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            T::Plus => self.emit_op(OpCode::Add),
            T::Minus => self.emit_op(OpCode::Subtract),
            T::Star => self.emit_op(OpCode::Multiply),
            T::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_operator(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_operator(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(T::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Too many arguments.");
                } else {
                    count += 1;
                }
                if !self.matches(T::Comma) {
                    break;
                }
            }
        }
        self.consume(T::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(T::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(T::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(T::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Too many elements in list literal.");
                } else {
                    count += 1;
                }
                if !self.matches(T::Comma) {
                    break;
                }
            }
        }
        self.consume(T::RightBracket, "Expect ']' after list elements.");
        self.emit_op_byte(OpCode::List, count as u8);
    }

    fn dict_literal(&mut self) {
        let mut count: u32 = 0;
        if !self.check(T::RightBrace) {
            loop {
                self.expression();
                self.consume(T::FatArrow, "Expect '=>' after dict key.");
                self.expression();
                if count == 255 {
                    self.error("Too many entries in dict literal.");
                } else {
                    count += 1;
                }
                if !self.matches(T::Comma) {
                    break;
                }
            }
        }
        self.consume(T::RightBrace, "Expect '}' after dict entries.");
        self.emit_op_byte(OpCode::Dict, count as u8);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(T::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name);
        if can_assign && self.matches(T::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, constant);
        } else if self.matches(T::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, constant);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, constant);
        }
    }

    fn super_expression(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        self.consume(T::Dot, "Expect '.' after 'super'.");
        self.consume(T::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name);
        self.named_variable("this", false);
        if self.matches(T::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, constant);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::GetSuper, constant);
        }
    }

    fn this_expression(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("compiles cleanly");
        (heap, function)
    }

    fn compile_err(source: &str) -> CompileErrors {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("expected a compile error")
    }

    fn script_code(heap: &Heap, function: Handle) -> Vec<u8> {
        match heap.get(function) {
            Obj::Function(f) => f.chunk.code.clone(),
            _ => panic!("not a function"),
        }
    }

    #[test]
    fn test_arithmetic_statement_bytecode() {
        let (heap, function) = compile_ok("1 + 2;");
        let expected = vec![
            OpCode::Int as u8,
            1,
            OpCode::Int as u8,
            2,
            OpCode::Add as u8,
            OpCode::Pop as u8,
            OpCode::Nil as u8,
            OpCode::Return as u8,
        ];
        assert_eq!(script_code(&heap, function), expected);
    }

    #[test]
    fn test_large_numbers_use_the_constant_pool() {
        let (heap, function) = compile_ok("1000;");
        let code = script_code(&heap, function);
        assert_eq!(code[0], OpCode::Constant as u8);
        match heap.get(function) {
            Obj::Function(f) => {
                assert_eq!(f.chunk.constants[code[1] as usize], Value::number(1000.0));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_print_peeks_and_statement_pops() {
        let (heap, function) = compile_ok("print 7;");
        let expected = vec![
            OpCode::Int as u8,
            7,
            OpCode::Print as u8,
            OpCode::Pop as u8,
            OpCode::Nil as u8,
            OpCode::Return as u8,
        ];
        assert_eq!(script_code(&heap, function), expected);
    }

    #[test]
    fn test_string_literals_are_interned_constants() {
        let (mut heap, function) = compile_ok("\"abc\"; \"abc\";");
        let interned = heap.intern("abc");
        match heap.get(function) {
            Obj::Function(f) => {
                // Both literals share one constant, which is the interned
                // string.
                let strings: Vec<_> = f
                    .chunk
                    .constants
                    .iter()
                    .filter_map(|c| c.as_object())
                    .collect();
                assert_eq!(strings, vec![interned]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_block_yields_last_dangling_expression() {
        // The inner block compiles: 1; is popped, 2 stays, locals none.
        let (heap, function) = compile_ok("var x = { 1; 2 };");
        let code = script_code(&heap, function);
        assert!(code.contains(&(OpCode::DefineGlobal as u8)));
        // No reserve dance: the block declared no locals.
        assert!(!code.contains(&(OpCode::SetReserve as u8)));
    }

    #[test]
    fn test_block_with_locals_preserves_value_through_reserve() {
        let (heap, function) = compile_ok("{ var a = 1; a + 1 };");
        let code = script_code(&heap, function);
        let set = code.iter().position(|&b| b == OpCode::SetReserve as u8);
        let get = code.iter().position(|&b| b == OpCode::GetReserve as u8);
        assert!(set.is_some() && get.is_some());
        assert!(set < get);
    }

    #[test]
    fn test_closure_captures_enclosing_local() {
        let (heap, function) = compile_ok(
            "func outer() { var a = 1; func inner() { a } inner }",
        );
        // Find the inner function among the heap objects and check its
        // upvalue bookkeeping.
        let mut inner_upvalues = Vec::new();
        for index in 0..heap.object_count() as u32 {
            if let Obj::Function(f) = heap.get(Handle::from_index(index)) {
                if f.name.map(|n| heap.string_chars(n) == "inner") == Some(true) {
                    inner_upvalues.push(f.upvalue_count);
                }
            }
        }
        assert_eq!(inner_upvalues, vec![1]);
        let _ = function;
    }

    #[test]
    fn test_invalid_assignment_target() {
        let errors = compile_err("1 = 2;");
        assert!(errors.contains("Invalid assignment target."));
    }

    #[test]
    fn test_duplicate_local_name() {
        let errors = compile_err("{ var a = 1; var a = 2; };");
        assert!(errors.contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn test_return_at_top_level() {
        let errors = compile_err("return 1;");
        assert!(errors.contains("Can't return from top-level code."));
    }

    #[test]
    fn test_super_outside_class() {
        let errors = compile_err("super.x;");
        assert!(errors.contains("Can't use 'super' outside of a class."));
    }

    #[test]
    fn test_super_without_superclass() {
        let errors = compile_err("class A { m() { super.m(); } }");
        assert!(errors.contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_class_cannot_inherit_from_itself() {
        let errors = compile_err("class A < A {}");
        assert!(errors.contains("A class can't inherit from itself."));
    }

    #[test]
    fn test_self_inheritance_class_is_still_one_error() {
        // Panic mode suppresses the cascade after the first error.
        let errors = compile_err("class A < A {}");
        assert_eq!(errors.0.len(), 1);
    }

    #[test]
    fn test_initializer_cannot_return_value() {
        let errors = compile_err("class A { init() { return 1; } }");
        assert!(errors.contains("Can't return a value from an initializer."));
    }

    #[test]
    fn test_local_in_own_initializer() {
        let errors = compile_err("{ var a = a; };");
        assert!(errors.contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn test_missing_semicolon_between_expressions() {
        let errors = compile_err("{ 1 2 };");
        assert!(errors.contains("Expect ';' after expression."));
    }

    #[test]
    fn test_dict_literal_uses_soft_keyword() {
        let (heap, function) = compile_ok("dict { \"a\" => 1 };");
        let code = script_code(&heap, function);
        assert!(code.contains(&(OpCode::Dict as u8)));
        // `dict` alone is an ordinary identifier (a global read).
        let (heap, function) = compile_ok("dict;");
        let code = script_code(&heap, function);
        assert!(code.contains(&(OpCode::GetGlobal as u8)));
    }

    #[test]
    fn test_list_literal_and_index() {
        let (heap, function) = compile_ok("var xs = [1, 2]; xs[0]; xs[0] = 5;");
        let code = script_code(&heap, function);
        assert!(code.contains(&(OpCode::List as u8)));
        assert!(code.contains(&(OpCode::GetIndex as u8)));
        assert!(code.contains(&(OpCode::SetIndex as u8)));
    }

    #[test]
    fn test_comparison_lowering_pairs() {
        let (heap, function) = compile_ok("1 <= 2;");
        let code = script_code(&heap, function);
        let greater = code.iter().position(|&b| b == OpCode::Greater as u8);
        assert!(greater.is_some());
        assert_eq!(code[greater.unwrap() + 1], OpCode::Not as u8);
    }

    #[test]
    fn test_for_in_lowering_shape() {
        let (heap, function) = compile_ok("for c in \"ab\" { print c; }");
        let code = script_code(&heap, function);
        assert!(code.contains(&(OpCode::NextJump as u8)));
        assert!(code.contains(&(OpCode::Loop as u8)));
    }

    #[test]
    fn test_too_many_constants_in_one_chunk() {
        // 300 distinct non-small numbers exhaust the 256-entry pool.
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("{}.5;\n", i + 1000));
        }
        let errors = compile_err(&source);
        assert!(errors.contains("Too many constants in one chunk."));
    }
}
