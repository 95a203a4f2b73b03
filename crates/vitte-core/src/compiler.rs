//! compiler.rs — single-pass Pratt-parsing compiler. There is no AST: each
//! grammar production emits bytecode directly into the chunk of whichever
//! function is currently being compiled, the same way clox's `compiler.c`
//! does it. Rust's borrow checker makes the classic function-pointer
//! parse table awkward, so precedence dispatch here is a `match` on the
//! token kind instead of a table of fn pointers — same algorithm, more
//! idiomatic plumbing.
//!
//! Nested function/method compilation is modelled as a stack of
//! [`FunctionScope`] frames (`Compiler::scopes`, innermost last) rather
//! than a recursive `enclosing: Box<Compiler>` chain: upvalue resolution
//! walks the stack from the top down instead of following pointers, which
//! sidesteps a self-referential struct for no behavioral difference.

use crate::chunk::Chunk;
use crate::config::Config;
use crate::diagnostic::{CompileError, ErrorLocation};
use crate::object::{FunctionObj, GcRef, Heap};
use crate::op::Op;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// -1 means declared but not yet initialized; reading it is an error.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionScope<'src> {
    name: Option<GcRef>,
    arity: u8,
    kind: FunctionKind,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
}

impl<'src> FunctionScope<'src> {
    fn new(kind: FunctionKind, name: Option<GcRef>) -> Self {
        // Slot 0 is reserved: the receiver for methods/initializers, an
        // unnameable placeholder everywhere else.
        let sentinel = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            name,
            arity: 0,
            kind,
            chunk: Chunk::new(),
            locals: vec![Local { name: sentinel, depth: 0, is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

#[derive(PartialEq)]
enum ControlKind {
    Loop,
    Switch,
}

struct ControlContext {
    kind: ControlKind,
    /// Where `continue` jumps back to: the loop head, or the increment
    /// clause when a `for` loop has one.
    continue_target: usize,
    break_jumps: Vec<usize>,
    /// Compiler scope depth when this context was entered, so `break`/
    /// `continue` know how many locals to close without leaving them
    /// declared (the block they're inside hasn't lexically ended).
    scope_depth: i32,
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,
    And,
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () [] ?:
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        BangEqual | EqualEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash => Precedence::Factor,
        LeftParen | Dot | LeftBracket => Precedence::Call,
        Question => Precedence::Assignment,
        _ => Precedence::None,
    }
}

struct Compiler<'a, 'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'a mut Heap,
    #[allow(dead_code)]
    config: &'a Config,
    scopes: Vec<FunctionScope<'src>>,
    classes: Vec<ClassState>,
    controls: Vec<ControlContext>,
}

/// Compiles `source` into a top-level function object living on `heap`.
/// On success the returned [`GcRef`] points at an already-allocated
/// zero-argument `FunctionObj` ready to be wrapped in a closure and run.
pub fn compile(source: &str, heap: &mut Heap, config: &Config) -> Result<GcRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap, config);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let (function_ref, _upvalues) = compiler.end_compiler();
    if compiler.errors.is_empty() {
        Ok(function_ref)
    } else {
        Err(compiler.errors)
    }
}

impl<'a, 'src> Compiler<'a, 'src> {
    fn new(source: &'src str, heap: &'a mut Heap, config: &'a Config) -> Self {
        let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Self {
            scanner: Scanner::new(source),
            previous: dummy,
            current: dummy,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            config,
            scopes: vec![FunctionScope::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            controls: Vec::new(),
        }
    }

    // ---------------------------------------------------------------
    // Token stream plumbing
    // ---------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at(self.current, &message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at_previous(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::AtEnd,
            TokenKind::Error => ErrorLocation::None,
            _ => ErrorLocation::AtLexeme(token.lexeme.to_string()),
        };
        self.errors.push(CompileError { line: token.line, location, message: message.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---------------------------------------------------------------
    // Emission helpers
    // ---------------------------------------------------------------

    fn current_scope(&self) -> &FunctionScope<'src> {
        self.scopes.last().expect("no active function scope")
    }

    fn current_scope_mut(&mut self) -> &mut FunctionScope<'src> {
        self.scopes.last_mut().expect("no active function scope")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_scope_mut().chunk.write_u8(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op.into());
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.current_scope_mut().chunk.write_u16(value, line);
    }

    /// Emits a generic value-pool load (`CONSTANT`/`CONSTANT_16`), escalating
    /// to the wide form once the pool index no longer fits a byte.
    fn emit_constant(&mut self, value: Value) {
        let idx = self.current_scope_mut().chunk.add_constant(value);
        if idx <= u8::MAX as usize {
            self.emit_op(Op::Constant);
            self.emit_byte(idx as u8);
        } else if idx <= u16::MAX as usize {
            self.emit_op(Op::Constant16);
            self.emit_u16(idx as u16);
        } else {
            self.error_at_previous("Too many constants in one chunk.");
        }
    }

    /// Property/class/method names are always plain 8-bit operands — see
    /// the VM's `read_name(false)` call sites.
    fn emit_name_operand(&mut self, idx: usize) {
        if idx > u8::MAX as usize {
            self.error_at_previous("Too many constants in one chunk.");
            return;
        }
        self.emit_byte(idx as u8);
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_scope().chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_scope().chunk.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error_at_previous("Too much code to jump over.");
        }
        self.current_scope_mut().chunk.patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let count_after_opcode = self.current_scope().chunk.len();
        let offset = count_after_opcode - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error_at_previous("Loop body too large.");
        }
        self.emit_u16(offset as u16);
    }

    /// The implicit return every function body ends with. Initializers
    /// return the receiver instead of `nil` — by emitting `GET_LOCAL 0`
    /// here, a bare `return;` inside an initializer gets the right value
    /// with no runtime "is this an initializer" check at all.
    fn emit_return(&mut self) {
        if self.current_scope().kind == FunctionKind::Initializer {
            self.emit_op(Op::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    fn emit_closure(&mut self, function_value: Value, upvalues: &[UpvalueDesc]) {
        let idx = self.current_scope_mut().chunk.add_constant(function_value);
        if idx > u8::MAX as usize {
            self.error_at_previous("Too many constants in one chunk.");
            return;
        }
        self.emit_op(Op::Closure);
        self.emit_byte(idx as u8);
        for uv in upvalues {
            self.emit_byte(uv.is_local as u8);
            self.emit_byte(uv.index);
        }
    }

    fn end_compiler(&mut self) -> (GcRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let scope = self.scopes.pop().expect("end_compiler with no active scope");
        if self.config.debug_print_code && self.errors.is_empty() {
            let label = scope.name.map(|n| self.heap.as_str(n).to_string()).unwrap_or_else(|| "<script>".into());
            log::debug!("{}", crate::disasm::disassemble_chunk(&scope.chunk, &label, self.heap));
        }
        let function_ref = self.heap.alloc_function(FunctionObj {
            arity: scope.arity,
            upvalue_count: scope.upvalues.len() as u8,
            name: scope.name,
            chunk: scope.chunk,
        });
        (function_ref, scope.upvalues)
    }

    // ---------------------------------------------------------------
    // Variable declaration & resolution
    // ---------------------------------------------------------------

    fn identifier_constant(&mut self, token: Token<'src>) -> usize {
        self.intern_constant_string(token.lexeme)
    }

    fn intern_constant_string(&mut self, text: &str) -> usize {
        let name_ref = self.heap.intern_str(text);
        self.current_scope_mut().chunk.add_constant(Value::Obj(name_ref))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_scope().locals.len() >= 256 {
            self.error_at_previous("Too many local variables in function.");
            return;
        }
        self.current_scope_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.current_scope().scope_depth == 0 {
            return; // globals are resolved dynamically by name, never declared
        }
        let name = self.previous.lexeme;
        let scope_depth = self.current_scope().scope_depth;
        let mut duplicate = false;
        for local in self.current_scope().locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error_at_previous("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let scope = self.current_scope_mut();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Declares the identifier just consumed. Returns the global constant
    /// pool index when this is a top-level binding, or `None` for a local
    /// (already pushed onto `locals`, awaiting `define_variable`).
    fn parse_variable(&mut self, message: &str) -> Option<usize> {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_scope().scope_depth > 0 {
            return None;
        }
        Some(self.identifier_constant(self.previous))
    }

    fn define_variable(&mut self, global: Option<usize>) {
        match global {
            None => self.mark_initialized(),
            Some(idx) => {
                let wide = idx > u8::MAX as usize;
                if idx > u16::MAX as usize {
                    self.error_at_previous("Too many globals referenced.");
                    return;
                }
                self.emit_op(if wide { Op::DefineGlobal16 } else { Op::DefineGlobal });
                if wide {
                    self.emit_u16(idx as u16);
                } else {
                    self.emit_byte(idx as u8);
                }
            }
        }
    }

    fn resolve_local(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        let found = self.scopes[scope_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, l)| (i as u8, l.depth));
        match found {
            Some((idx, -1)) => {
                self.error_at_previous("Can't read local variable in its own initializer.");
                Some(idx)
            }
            Some((idx, _)) => Some(idx),
            None => None,
        }
    }

    fn add_upvalue(&mut self, scope_index: usize, index: u8, is_local: bool) -> u8 {
        if let Some(i) =
            self.scopes[scope_index].upvalues.iter().position(|uv| uv.index == index && uv.is_local == is_local)
        {
            return i as u8;
        }
        if self.scopes[scope_index].upvalues.len() >= 255 {
            self.error_at_previous("Too many closure variables in function.");
            return 0;
        }
        self.scopes[scope_index].upvalues.push(UpvalueDesc { index, is_local });
        (self.scopes[scope_index].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        if scope_index == 0 {
            return None;
        }
        let enclosing = scope_index - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.scopes[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(scope_index, local_idx, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_index, upvalue_idx, false));
        }
        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let current_idx = self.scopes.len() - 1;
        let access = if let Some(idx) = self.resolve_local(current_idx, name) {
            VarAccess::Local(idx)
        } else if let Some(idx) = self.resolve_upvalue(current_idx, name) {
            VarAccess::Upvalue(idx)
        } else {
            VarAccess::Global(self.intern_constant_string(name))
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            match access {
                VarAccess::Local(idx) => {
                    self.emit_op(Op::SetLocal);
                    self.emit_byte(idx);
                }
                VarAccess::Upvalue(idx) => {
                    self.emit_op(Op::SetUpvalue);
                    self.emit_byte(idx);
                }
                VarAccess::Global(idx) => self.emit_global_access(idx, false),
            }
        } else {
            match access {
                VarAccess::Local(idx) => {
                    self.emit_op(Op::GetLocal);
                    self.emit_byte(idx);
                }
                VarAccess::Upvalue(idx) => {
                    self.emit_op(Op::GetUpvalue);
                    self.emit_byte(idx);
                }
                VarAccess::Global(idx) => self.emit_global_access(idx, true),
            }
        }
    }

    fn emit_global_access(&mut self, idx: usize, is_get: bool) {
        if idx > u16::MAX as usize {
            self.error_at_previous("Too many globals referenced.");
            return;
        }
        let wide = idx > u8::MAX as usize;
        let op = match (is_get, wide) {
            (true, false) => Op::GetGlobal,
            (true, true) => Op::GetGlobal16,
            (false, false) => Op::SetGlobal,
            (false, true) => Op::SetGlobal16,
        };
        self.emit_op(op);
        if wide {
            self.emit_u16(idx as u16);
        } else {
            self.emit_byte(idx as u8);
        }
    }

    // ---------------------------------------------------------------
    // Scopes
    // ---------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_scope_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_scope_mut().scope_depth -= 1;
        let depth = self.current_scope().scope_depth;
        loop {
            let pop = matches!(self.current_scope().locals.last(), Some(l) if l.depth > depth);
            if !pop {
                break;
            }
            let captured = self.current_scope().locals.last().unwrap().is_captured;
            self.emit_op(if captured { Op::CloseUpvalue } else { Op::Pop });
            self.current_scope_mut().locals.pop();
        }
    }

    /// Emits cleanup for locals declared deeper than `depth` without
    /// removing them from the compiler's own bookkeeping — used by
    /// `break`/`continue`, which jump out of a scope that (syntactically)
    /// hasn't ended yet.
    fn close_locals_above(&mut self, depth: i32) {
        let captures: Vec<bool> = self
            .current_scope()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > depth)
            .map(|l| l.is_captured)
            .collect();
        for captured in captures {
            self.emit_op(if captured { Op::CloseUpvalue } else { Op::Pop });
        }
    }

    // ---------------------------------------------------------------
    // Declarations & statements
    // ---------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name_ref = self.heap.intern_str(self.previous.lexeme);
        self.scopes.push(FunctionScope::new(kind, Some(name_ref)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.current_scope().arity + 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_scope_mut().arity = arity;
                }
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                self.declare_variable();
                self.mark_initialized();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function_ref, upvalues) = self.end_compiler();
        self.emit_closure(Value::Obj(function_ref), &upvalues);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op(Op::Class);
        self.emit_name_operand(name_const);
        let global = if self.current_scope().scope_depth > 0 { None } else { Some(name_const) };
        self.define_variable(global);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous;
            if superclass_name.lexeme == class_name.lexeme {
                self.error_at_previous("A class can't inherit from itself.");
            }
            self.named_variable(superclass_name.lexeme, false);

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name.lexeme, false);
            self.emit_op(Op::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Op::Pop); // the class value pushed for method compilation

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous;
        let name_const = self.identifier_constant(method_name);
        let kind = if method_name.lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op(Op::Method);
        self.emit_name_operand(name_const);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn return_statement(&mut self) {
        if self.current_scope().kind == FunctionKind::Script {
            self.error_at_previous("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_scope().kind == FunctionKind::Initializer {
                self.error_at_previous("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();

        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_scope().chunk.len();
        self.controls.push(ControlContext {
            kind: ControlKind::Loop,
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth: self.current_scope().scope_depth,
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
        self.patch_breaks();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_scope().chunk.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        let mut continue_target = loop_start;
        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.current_scope().chunk.len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            continue_target = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
        }

        self.controls.push(ControlContext {
            kind: ControlKind::Loop,
            continue_target,
            break_jumps: Vec::new(),
            scope_depth: self.current_scope().scope_depth,
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Op::Pop);
        }

        self.patch_breaks();
        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch expression.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        self.controls.push(ControlContext {
            kind: ControlKind::Switch,
            continue_target: 0,
            break_jumps: Vec::new(),
            scope_depth: self.current_scope().scope_depth,
        });

        let mut case_end_jumps = Vec::new();
        while self.match_token(TokenKind::Case) {
            self.emit_op(Op::Dup);
            self.expression();
            self.consume(TokenKind::Colon, "Expect ':' after case value.");
            self.emit_op(Op::Equal);
            let skip_jump = self.emit_jump(Op::JumpIfFalse);
            self.emit_op(Op::Pop); // discard the comparison result (match branch)
            while !self.check(TokenKind::Case) && !self.check(TokenKind::Default) && !self.check(TokenKind::RightBrace)
            {
                self.statement();
            }
            case_end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(skip_jump);
            self.emit_op(Op::Pop); // discard the comparison result (no-match branch)
        }

        let mut has_default = false;
        while self.match_token(TokenKind::Default) {
            if has_default {
                self.error_at_previous("Can't have more than one 'default' in a switch.");
            }
            has_default = true;
            self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Case) && !self.check(TokenKind::Default)
            {
                self.statement();
            }
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");

        // Every exit path — a matched case's jump, a `break`, and the
        // no-match fallthrough — must land on this single pop so the
        // switch leaves the stack exactly as it found it.
        for jump in case_end_jumps {
            self.patch_jump(jump);
        }
        let ctx = self.controls.pop().expect("control context stack underflow");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.emit_op(Op::Pop); // the switch subject
    }

    fn patch_breaks(&mut self) {
        let ctx = self.controls.pop().expect("control context stack underflow");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.controls.is_empty() {
            self.error_at_previous("Can't use 'break' outside of a loop or switch.");
            return;
        }
        let target_depth = self.controls.last().unwrap().scope_depth;
        self.close_locals_above(target_depth);
        let jump = self.emit_jump(Op::Jump);
        self.controls.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        match self.controls.iter().rev().find(|c| c.kind == ControlKind::Loop) {
            None => self.error_at_previous("Can't use 'continue' outside of a loop."),
            Some(ctx) => {
                let (target_depth, continue_target) = (ctx.scope_depth, ctx.continue_target);
                self.close_locals_above(target_depth);
                self.emit_loop(continue_target);
            }
        }
    }

    // ---------------------------------------------------------------
    // Expressions (Pratt parsing)
    // ---------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error_at_previous("Expect expression.");
            return;
        }

        while infix_precedence(self.current.kind) >= precedence {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error_at_previous("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            TokenKind::LeftBracket => self.array_literal(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => self.binary(),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::LeftBracket => self.index_(can_assign),
            TokenKind::Question => self.ternary(),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            _ => unreachable!("unary() dispatched on a non-unary operator"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        let prec = infix_precedence(operator);
        self.parse_precedence(prec.next());
        match operator {
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            _ => unreachable!("binary() dispatched on a non-binary operator"),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self) {
        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Assignment);
        let else_jump = self.emit_jump(Op::Jump);
        self.consume(TokenKind::Colon, "Expect ':' after ternary 'then' branch.");
        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(else_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner only emits well-formed numeric lexemes");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let raw = self.previous.lexeme;
        let content = &raw[1..raw.len() - 1];
        let s = self.heap.intern_str(content);
        self.emit_constant(Value::Obj(s));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(Op::True),
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::Nil => self.emit_op(Op::Nil),
            _ => unreachable!("literal() dispatched on a non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error_at_previous("Can't use 'this' outside of a class.");
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error_at_previous("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error_at_previous("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_const = self.identifier_constant(self.previous);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(Op::SuperInvoke);
            self.emit_name_operand(name_const);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op(Op::GetSuper);
            self.emit_name_operand(name_const);
        }
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(Op::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error_at_previous("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_const = self.identifier_constant(self.previous);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Op::SetProperty);
            self.emit_name_operand(name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(Op::Invoke);
            self.emit_name_operand(name_const);
            self.emit_byte(argc);
        } else {
            self.emit_op(Op::GetProperty);
            self.emit_name_operand(name_const);
        }
    }

    fn index_(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Op::SetIndex);
        } else {
            self.emit_op(Op::GetIndex);
        }
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error_at_previous("Can't have more than 255 array elements.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        self.emit_op(Op::Array);
        self.emit_byte(count.min(255) as u8);
    }
}

enum VarAccess {
    Local(u8),
    Upvalue(u8),
    Global(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;

    fn compile_ok(source: &str) -> (GcRef, Heap) {
        let mut heap = Heap::new();
        let config = Config::default();
        let result = compile(source, &mut heap, &config);
        match result {
            Ok(r) => (r, heap),
            Err(errs) => panic!("expected successful compile, got errors: {errs:?}"),
        }
    }

    fn opcodes(heap: &Heap, f: GcRef) -> Vec<Op> {
        let crate::object::Obj::Function(func) = heap.get(f) else { panic!("not a function") };
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < func.chunk.code.len() {
            let op = Op::try_from(func.chunk.code[ip]).expect("valid opcode");
            out.push(op);
            ip += 1 + operand_len(op, &func.chunk.code[ip..]);
        }
        out
    }

    fn operand_len(op: Op, rest: &[u8]) -> usize {
        match op {
            Op::Constant | Op::DefineGlobal | Op::GetGlobal | Op::SetGlobal | Op::GetLocal | Op::SetLocal
            | Op::GetUpvalue | Op::SetUpvalue | Op::Call | Op::Class | Op::Method | Op::GetProperty
            | Op::SetProperty | Op::GetSuper | Op::Array => 1,
            Op::Constant16 | Op::DefineGlobal16 | Op::GetGlobal16 | Op::SetGlobal16 | Op::Jump | Op::JumpIfFalse
            | Op::Loop => 2,
            Op::Invoke | Op::SuperInvoke => 2,
            Op::Closure => {
                // Not exercised by these tests: a real walk would also
                // need to skip the per-upvalue (is_local, index) pairs
                // that follow the constant byte.
                let _ = rest;
                1
            }
            _ => 0,
        }
    }

    #[test]
    fn simple_arithmetic_compiles() {
        let (f, heap) = compile_ok("print 1 + 2 * 3;");
        let ops = opcodes(&heap, f);
        assert_eq!(
            ops,
            vec![Op::Constant, Op::Constant, Op::Constant, Op::Multiply, Op::Add, Op::Print, Op::Nil, Op::Return]
        );
    }

    #[test]
    fn global_variable_roundtrip() {
        let (f, heap) = compile_ok("var x = 1; x = 2; print x;");
        let ops = opcodes(&heap, f);
        assert!(ops.contains(&Op::DefineGlobal));
        assert!(ops.contains(&Op::SetGlobal));
        assert!(ops.contains(&Op::GetGlobal));
    }

    #[test]
    fn local_variable_uses_get_set_local() {
        let (f, heap) = compile_ok("{ var x = 1; x = x + 1; print x; }");
        let ops = opcodes(&heap, f);
        assert!(ops.contains(&Op::GetLocal));
        assert!(ops.contains(&Op::SetLocal));
        assert!(!ops.contains(&Op::DefineGlobal));
    }

    #[test]
    fn return_from_top_level_is_an_error() {
        let mut heap = Heap::new();
        let config = Config::default();
        let result = compile("return 1;", &mut heap, &config);
        assert!(result.is_err());
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let mut heap = Heap::new();
        let config = Config::default();
        let result = compile("break;", &mut heap, &config);
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_default_in_switch_is_an_error() {
        let mut heap = Heap::new();
        let config = Config::default();
        let src = "switch (1) { default: print 1; default: print 2; }";
        let result = compile(src, &mut heap, &config);
        assert!(result.is_err());
    }

    #[test]
    fn this_outside_class_is_an_error() {
        let mut heap = Heap::new();
        let config = Config::default();
        let result = compile("print this;", &mut heap, &config);
        assert!(result.is_err());
    }

    #[test]
    fn class_with_method_compiles() {
        let (f, heap) = compile_ok("class Greeter { greet() { print \"hi\"; } } var g = Greeter(); g.greet();");
        let ops = opcodes(&heap, f);
        assert!(ops.contains(&Op::Class));
        assert!(ops.contains(&Op::Method));
        assert!(ops.contains(&Op::Invoke));
    }

    #[test]
    fn recovers_after_a_syntax_error_and_reports_both() {
        let mut heap = Heap::new();
        let config = Config::default();
        let src = "var x = ; var y = 1;";
        let result = compile(src, &mut heap, &config);
        assert!(result.is_err());
    }
}
