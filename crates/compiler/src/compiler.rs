//! Single-pass bytecode compiler.
//!
//! A Pratt parser that emits instructions while it parses; there is no AST.
//! Expression parsing is driven by a static rule table keyed by token kind,
//! where each rule is an optional prefix operation, an optional infix
//! operation, and a binding precedence. The rule operations form a closed
//! set, encoded as enums and dispatched in exactly one place each, so the
//! emitter stays inspectable.
//!
//! Functions nest: each function being compiled gets its own [`FnCompiler`]
//! with locals, upvalue descriptors, and scope depth, stacked innermost
//! last. Variable resolution walks name → local → enclosing upvalue →
//! global. The whole chain of in-flight function objects is reported to the
//! heap as GC roots for the duration of compilation, since the collector
//! may run at any interning or allocation point.

use std::io::{self, Write as _};

use tracing::debug;

use fidel_core::chunk::OpCode;
use fidel_core::object::{ObjBody, ObjFunction};
use fidel_core::value::Value;
use fidel_core::{Chunk, Heap, INIT_METHOD_NAME, ObjRef, RootSet};

use crate::scanner::{Scanner, Token, TokenKind};

/// Compiler knobs surfaced on the CLI.
#[derive(Debug, Default, Clone)]
pub struct CompileOptions {
    /// Disassemble each function to the diagnostics sink as it finishes.
    pub print_code: bool,
}

/// Compile a source string into a top-level script function.
///
/// Errors are reported to `diagnostics` as they are found; on any error the
/// result is `None`. `roots` carries whatever the caller can already reach
/// (for the VM: its globals and interned names), so collections triggered
/// by compile-time allocation stay precise.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    roots: RootSet,
    options: &CompileOptions,
    diagnostics: &mut dyn io::Write,
) -> Option<ObjRef> {
    let chars: Vec<char> = source.chars().collect();
    let mut parser = Parser {
        scanner: Scanner::new(&chars),
        chars: &chars,
        heap,
        outer_roots: roots,
        options,
        diagnostics,
        current: Token::synthetic(),
        previous: Token::synthetic(),
        had_error: false,
        panic_mode: false,
        compilers: Vec::new(),
        classes: Vec::new(),
    };

    parser.push_compiler(FunctionKind::Script, None);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.pop_compiler();

    if parser.had_error {
        None
    } else {
        debug!(objects = parser.heap.object_count(), "compile finished");
        Some(function)
    }
}

/// Binding precedences, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // ወይም
    And,        // እና
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
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

/// Prefix positions a token can start an expression from.
#[derive(Debug, Clone, Copy)]
enum PrefixRule {
    Grouping,
    Unary,
    Variable,
    Number,
    Str,
    Literal,
    This,
    Super,
}

/// Infix positions a token can continue an expression from.
#[derive(Debug, Clone, Copy)]
enum InfixRule {
    Binary,
    And,
    Or,
    Call,
    Dot,
}

struct ParseRule {
    prefix: Option<PrefixRule>,
    infix: Option<InfixRule>,
    precedence: Precedence,
}

const fn rule_of(prefix: Option<PrefixRule>, infix: Option<InfixRule>, p: Precedence) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence: p,
    }
}

/// The Pratt rule table.
fn rule(kind: TokenKind) -> ParseRule {
    use InfixRule as I;
    use Precedence as P;
    use PrefixRule as Pre;
    match kind {
        TokenKind::LeftParen => rule_of(Some(Pre::Grouping), Some(I::Call), P::Call),
        TokenKind::Dot => rule_of(None, Some(I::Dot), P::Call),
        TokenKind::Minus => rule_of(Some(Pre::Unary), Some(I::Binary), P::Term),
        TokenKind::Plus => rule_of(None, Some(I::Binary), P::Term),
        TokenKind::Slash | TokenKind::Star => rule_of(None, Some(I::Binary), P::Factor),
        TokenKind::Bang => rule_of(Some(Pre::Unary), None, P::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            rule_of(None, Some(I::Binary), P::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => rule_of(None, Some(I::Binary), P::Comparison),
        TokenKind::Identifier => rule_of(Some(Pre::Variable), None, P::None),
        TokenKind::String => rule_of(Some(Pre::Str), None, P::None),
        TokenKind::Number => rule_of(Some(Pre::Number), None, P::None),
        TokenKind::And => rule_of(None, Some(I::And), P::And),
        TokenKind::Or => rule_of(None, Some(I::Or), P::Or),
        TokenKind::False | TokenKind::Nil | TokenKind::True => {
            rule_of(Some(Pre::Literal), None, P::None)
        }
        TokenKind::This => rule_of(Some(Pre::This), None, P::None),
        TokenKind::Super => rule_of(Some(Pre::Super), None, P::None),
        _ => rule_of(None, None, P::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

struct Local {
    name: String,
    /// Scope depth, or -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Slot 0 is reserved: methods and
/// initializers keep the receiver there under the name `ይህ`, everything
/// else an unnameable sentinel.
struct FnCompiler {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

struct ClassCompiler {
    has_superclass: bool,
}

struct Parser<'src, 'ctx> {
    scanner: Scanner<'src>,
    chars: &'src [char],
    heap: &'ctx mut Heap,
    outer_roots: RootSet<'ctx>,
    options: &'ctx CompileOptions,
    diagnostics: &'ctx mut dyn io::Write,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    /// Chain of functions being compiled, innermost last.
    compilers: Vec<FnCompiler>,
    /// Enclosing class contexts, innermost last.
    classes: Vec<ClassCompiler>,
}

impl Parser<'_, '_> {
    // ----- token plumbing -----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            let TokenKind::Error(message) = self.current.kind else {
                break;
            };
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
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

    fn lexeme(&self, token: Token) -> String {
        self.chars[token.start..token.start + token.length]
            .iter()
            .collect()
    }

    // ----- error reporting -----

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let _ = write!(self.diagnostics, "[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => {
                let _ = write!(self.diagnostics, " at end");
            }
            TokenKind::Error(_) => {}
            _ => {
                let _ = write!(self.diagnostics, " at '{}'", self.lexeme(token));
            }
        }
        let _ = writeln!(self.diagnostics, ": {message}");
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skip to a likely statement boundary so one mistake does not cascade.
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
                _ => {}
            }
            self.advance();
        }
    }

    // ----- compiler chain and GC roots -----

    fn fc(&self) -> &FnCompiler {
        &self.compilers[self.compilers.len() - 1]
    }

    fn fc_mut(&mut self) -> &mut FnCompiler {
        let last = self.compilers.len() - 1;
        &mut self.compilers[last]
    }

    /// GC roots at a compile-time allocation point: whatever the caller
    /// could reach, plus every function on the compiler chain.
    fn chain_handles(&self) -> Vec<ObjRef> {
        let mut handles = self.outer_roots.handles.to_vec();
        handles.extend(self.compilers.iter().map(|c| c.function));
        handles
    }

    fn intern(&mut self, text: &str) -> ObjRef {
        let handles = self.chain_handles();
        let roots = RootSet {
            handles: &handles,
            ..self.outer_roots
        };
        self.heap.intern(text, &roots)
    }

    fn push_compiler(&mut self, kind: FunctionKind, name: Option<String>) {
        let name_ref = name.map(|n| self.intern(&n));
        if let Some(r) = name_ref {
            // The name is not reachable until the function object holds it.
            self.heap.push_temp_root(Value::Obj(r));
        }
        let handles = self.chain_handles();
        let roots = RootSet {
            handles: &handles,
            ..self.outer_roots
        };
        let function = self
            .heap
            .allocate(ObjBody::Function(ObjFunction::new(name_ref)), &roots);
        if name_ref.is_some() {
            self.heap.pop_temp_root();
        }

        // Claim stack slot 0: the receiver for methods, a sentinel
        // otherwise.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "ይህ".to_string(),
            FunctionKind::Script | FunctionKind::Function => String::new(),
        };
        self.compilers.push(FnCompiler {
            function,
            kind,
            locals: vec![Local {
                name: slot_zero,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    fn pop_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let compiler = match self.compilers.pop() {
            Some(c) => c,
            None => unreachable!("compiler chain underflow"),
        };
        self.heap.function_mut(compiler.function).upvalue_count = compiler.upvalues.len();

        if self.options.print_code && !self.had_error {
            let heap = &*self.heap;
            let name = match heap.function(compiler.function).name {
                Some(n) => heap.str(n).to_string(),
                None => "<script>".to_string(),
            };
            let listing = fidel_core::debug::disassemble_chunk(
                heap,
                &heap.function(compiler.function).chunk,
                &name,
            );
            let _ = write!(self.diagnostics, "{listing}");
        }
        (compiler.function, compiler.upvalues)
    }

    // ----- emitting -----

    fn chunk_mut(&mut self) -> &mut Chunk {
        let function = self.fc().function;
        &mut self.heap.function_mut(function).chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, a: OpCode, b: OpCode) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_with_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.fc().kind == FunctionKind::Initializer {
            // An initializer implicitly returns its receiver.
            self.emit_with_operand(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, constant);
    }

    /// Emit a jump with a placeholder offset; returns the offset to patch.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the jump offset bytes themselves.
        let jump = self.chunk_mut().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let code = &mut self.chunk_mut().code;
        code[offset] = bytes[0];
        code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // ----- scopes, locals, upvalues -----

    fn begin_scope(&mut self) {
        self.fc_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fc_mut().scope_depth -= 1;
        loop {
            let fc = self.fc();
            let Some(local) = fc.locals.last() else {
                break;
            };
            if local.depth <= fc.scope_depth {
                break;
            }
            // Captured locals move into their upvalue instead of vanishing.
            let captured = local.is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.fc_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: String) {
        if self.fc().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.fc_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.fc().scope_depth == 0 {
            return;
        }
        let name = self.lexeme(self.previous);
        let mut duplicate = false;
        let fc = self.fc();
        for local in fc.locals.iter().rev() {
            if local.depth != -1 && local.depth < fc.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Variable with this name already declared in this scope.");
        }
        self.add_local(name);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.fc().scope_depth > 0 {
            return 0;
        }
        let name = self.lexeme(self.previous);
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.fc().scope_depth == 0 {
            return;
        }
        let depth = self.fc().scope_depth;
        if let Some(local) = self.fc_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.fc().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_with_operand(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, compiler: usize, name: &str) -> Option<u8> {
        for i in (0..self.compilers[compiler].locals.len()).rev() {
            if self.compilers[compiler].locals[i].name == name {
                if self.compilers[compiler].locals[i].depth == -1 {
                    self.error("Cannot read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    /// Find `name` in an enclosing function, threading an upvalue through
    /// every compiler between it and this one.
    fn resolve_upvalue(&mut self, compiler: usize, name: &str) -> Option<u8> {
        if compiler == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(compiler - 1, name) {
            self.compilers[compiler - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(compiler, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(compiler - 1, name) {
            return Some(self.add_upvalue(compiler, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, compiler: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        // Reuse an existing capture of the same variable.
        if let Some(existing) = self.compilers[compiler]
            .upvalues
            .iter()
            .position(|u| *u == desc)
        {
            return existing as u8;
        }
        if self.compilers[compiler].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.compilers[compiler].upvalues.push(desc);
        (self.compilers[compiler].upvalues.len() - 1) as u8
    }

    // ----- expressions -----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        self.run_prefix(prefix, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                self.run_infix(infix, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn run_prefix(&mut self, rule: PrefixRule, can_assign: bool) {
        match rule {
            PrefixRule::Grouping => self.grouping(),
            PrefixRule::Unary => self.unary(),
            PrefixRule::Variable => self.variable(can_assign),
            PrefixRule::Number => self.number(),
            PrefixRule::Str => self.string(),
            PrefixRule::Literal => self.literal(),
            PrefixRule::This => self.this_(),
            PrefixRule::Super => self.super_(),
        }
    }

    fn run_infix(&mut self, rule: InfixRule, can_assign: bool) {
        match rule {
            InfixRule::Binary => self.binary(),
            InfixRule::And => self.and_(),
            InfixRule::Or => self.or_(),
            InfixRule::Call => self.call(),
            InfixRule::Dot => self.dot(can_assign),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let text = self.lexeme(self.previous);
        // The scanner only accepts digits and an embedded dot here.
        let value: f64 = text.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let token = self.previous;
        // Trim the surrounding quotes.
        let text: String = self.chars[token.start + 1..token.start + token.length - 1]
            .iter()
            .collect();
        let interned = self.intern(&text);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(rule(operator).precedence.next());

        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self) {
        // Short-circuit: on a falsey left operand, skip the right one and
        // keep the left value as the result.
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_with_operand(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Cannot have more than 255 arguments.");
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
        let lexeme = self.lexeme(self.previous);
        let name = self.identifier_constant(&lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_with_operand(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property access and call.
            let argc = self.argument_list();
            self.emit_with_operand(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_with_operand(OpCode::GetProperty, name);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.lexeme(self.previous);
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_with_operand(set_op, arg);
        } else {
            self.emit_with_operand(get_op, arg);
        }
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Cannot use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        match self.classes.last() {
            None => self.error("Cannot use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Cannot use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let lexeme = self.lexeme(self.previous);
        let name = self.identifier_constant(&lexeme);

        // The receiver and the captured superclass bracket the arguments.
        self.named_variable("ይህ", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("ታላቅ", false);
            self.emit_with_operand(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable("ታላቅ", false);
            self.emit_with_operand(OpCode::GetSuper, name);
        }
    }

    // ----- declarations and statements -----

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

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
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

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized the moment its
        // name is bound.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.lexeme(self.previous);
        self.push_compiler(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.heap.function(self.fc().function).arity;
                if arity == 255 {
                    self.error_at_current("Cannot have more than 255 parameters.");
                } else {
                    let function = self.fc().function;
                    self.heap.function_mut(function).arity = arity + 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.pop_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_with_operand(OpCode::Closure, constant);
        // Two operand bytes per capture: whether it is a local of the
        // enclosing function, and its slot or upvalue index there.
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.lexeme(self.previous);
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_with_operand(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name == self.lexeme(self.previous) {
                self.error("A class cannot inherit from itself.");
            }

            // Capture the superclass in a scoped synthetic local so
            // methods can close over it.
            self.begin_scope();
            self.add_local("ታላቅ".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().is_some_and(|c| c.has_superclass) {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let lexeme = self.lexeme(self.previous);
        let constant = self.identifier_constant(&lexeme);

        let kind = if lexeme == INIT_METHOD_NAME {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_with_operand(OpCode::Method, constant);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after a value");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.fc().kind == FunctionKind::Script {
            self.error("Cannot return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.fc().kind == FunctionKind::Initializer {
                self.error("Cannot return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().code.len();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            // Jump out of the loop if the condition is false.
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment runs after the body, so route the body around
            // it and loop back through it.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_compile(source: &str) -> (Option<ObjRef>, Heap, String) {
        let mut heap = Heap::new();
        let mut diagnostics = Vec::new();
        let function = compile(
            source,
            &mut heap,
            RootSet::default(),
            &CompileOptions::default(),
            &mut diagnostics,
        );
        (function, heap, String::from_utf8_lossy(&diagnostics).into())
    }

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let (function, heap, diagnostics) = try_compile(source);
        match function {
            Some(f) => (f, heap),
            None => panic!("compile failed: {diagnostics}"),
        }
    }

    fn ops(heap: &Heap, function: ObjRef) -> Vec<OpCode> {
        let chunk = &heap.function(function).chunk;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).expect("valid opcode");
            out.push(op);
            offset += 1 + operand_len(op);
            if op == OpCode::Closure {
                let index = chunk.code[offset - 1] as usize;
                if let Value::Obj(f) = chunk.constants[index] {
                    offset += 2 * heap.function(f).upvalue_count;
                }
            }
        }
        out
    }

    fn operand_len(op: OpCode) -> usize {
        match op {
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => 2,
            OpCode::Invoke | OpCode::SuperInvoke => 2,
            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Call
            | OpCode::Closure
            | OpCode::Class
            | OpCode::Method => 1,
            _ => 0,
        }
    }

    #[test]
    fn test_arithmetic_precedence_emission() {
        let (function, heap) = compile_ok("1 + 2 * 3;");
        // Multiplication binds tighter, so it is emitted before the add.
        assert_eq!(
            ops(&heap, function),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Multiply,
                OpCode::Add,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
        let constants = &heap.function(function).chunk.constants;
        assert_eq!(constants.len(), 3);
        assert_eq!(constants[0], Value::Number(1.0));
    }

    #[test]
    fn test_print_statement() {
        let (function, heap) = compile_ok("አውጣ 1;");
        assert_eq!(
            ops(&heap, function),
            vec![
                OpCode::Constant,
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return
            ]
        );
    }

    #[test]
    fn test_string_literals_are_interned_constants() {
        let (function, heap) = compile_ok("\"ሀ\" + \"ሀ\";");
        let constants = &heap.function(function).chunk.constants;
        assert_eq!(constants.len(), 2);
        // Both literals resolve to the one canonical string object.
        assert_eq!(constants[0], constants[1]);
    }

    #[test]
    fn test_global_var_declaration() {
        let (function, heap) = compile_ok("መለያ ሀ = 1;");
        assert_eq!(
            ops(&heap, function),
            vec![
                OpCode::Constant,
                OpCode::DefineGlobal,
                OpCode::Nil,
                OpCode::Return
            ]
        );
    }

    #[test]
    fn test_locals_use_slots_not_names() {
        let (function, heap) = compile_ok("{ መለያ ሀ = 1; አውጣ ሀ; }");
        assert_eq!(
            ops(&heap, function),
            vec![
                OpCode::Constant,
                OpCode::GetLocal,
                OpCode::Print,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn test_assignment_is_right_associative() {
        // `a = b = c` only parses when `=` groups to the right; a
        // left-grouped reading would be an invalid assignment target.
        let (function, _, diagnostics) = try_compile("መለያ ሀ; መለያ ለ; ሀ = ለ = 3;");
        assert!(function.is_some(), "{diagnostics}");
    }

    #[test]
    fn test_closure_captures_upvalue() {
        let source = "
            ተግባር ውጪ() {
              መለያ ቁ = 1;
              ተግባር ውስጥ() { አውጣ ቁ; }
            }
        ";
        let (script, heap) = compile_ok(source);
        let outer = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    ObjBody::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let inner = heap
            .function(outer)
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    ObjBody::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(heap.function(outer).upvalue_count, 0);
        assert_eq!(heap.function(inner).upvalue_count, 1);
    }

    #[test]
    fn test_method_compilation_emits_method_op() {
        let (function, heap) = compile_ok("ክፍል ሀ { ለ() { } }");
        let emitted = ops(&heap, function);
        assert!(emitted.contains(&OpCode::Class));
        assert!(emitted.contains(&OpCode::Closure));
        assert!(emitted.contains(&OpCode::Method));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let (function, _, diagnostics) = try_compile("መለያ ሀ; መለያ ለ; ሀ + ለ = 3;");
        assert!(function.is_none());
        assert!(diagnostics.contains("Invalid assignment target."));
    }

    #[test]
    fn test_missing_expression_reports_at_token() {
        let (function, _, diagnostics) = try_compile("አውጣ ;");
        assert!(function.is_none());
        assert!(diagnostics.contains("[line 1] Error"));
        assert!(diagnostics.contains("Expect expression."));
    }

    #[test]
    fn test_top_level_return_rejected() {
        let (function, _, diagnostics) = try_compile("መልስ 5;");
        assert!(function.is_none());
        assert!(diagnostics.contains("Cannot return from top-level code."));
    }

    #[test]
    fn test_initializer_cannot_return_value() {
        let source = "ክፍል ሀ { ማስጀመሪያ() { መልስ 3; } }";
        let (function, _, diagnostics) = try_compile(source);
        assert!(function.is_none());
        assert!(diagnostics.contains("Cannot return a value from an initializer."));
    }

    #[test]
    fn test_this_outside_class_rejected() {
        let (function, _, diagnostics) = try_compile("አውጣ ይህ;");
        assert!(function.is_none());
        assert!(diagnostics.contains("Cannot use 'this' outside of a class."));
    }

    #[test]
    fn test_super_without_superclass_rejected() {
        let (function, _, diagnostics) = try_compile("ክፍል ሀ { ለ() { መልስ ታላቅ.ለ(); } }");
        assert!(function.is_none());
        assert!(diagnostics.contains("Cannot use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_self_inheritance_rejected() {
        let (function, _, diagnostics) = try_compile("ክፍል ሀ < ሀ { }");
        assert!(function.is_none());
        assert!(diagnostics.contains("A class cannot inherit from itself."));
    }

    #[test]
    fn test_duplicate_local_rejected() {
        let (function, _, diagnostics) = try_compile("{ መለያ ሀ = 1; መለያ ሀ = 2; }");
        assert!(function.is_none());
        assert!(diagnostics.contains("Variable with this name already declared in this scope."));
    }

    #[test]
    fn test_own_initializer_read_rejected() {
        let (function, _, diagnostics) = try_compile("{ መለያ ሀ = ሀ; }");
        assert!(function.is_none());
        assert!(diagnostics.contains("Cannot read local variable in its own initializer."));
    }

    #[test]
    fn test_error_recovery_reports_later_statements() {
        // Panic mode must clear at the statement boundary so the second
        // error is also reported.
        let (function, _, diagnostics) = try_compile("መልስ 1; አውጣ ;");
        assert!(function.is_none());
        assert!(diagnostics.contains("Cannot return from top-level code."));
        assert!(diagnostics.contains("Expect expression."));
    }

    #[test]
    fn test_scope_exit_pops_locals() {
        let (function, heap) = compile_ok("{ መለያ ሀ = 1; { መለያ ለ = 2; } }");
        let emitted = ops(&heap, function);
        // Two locals, two pops on the two scope exits.
        assert_eq!(
            emitted
                .iter()
                .filter(|&&op| op == OpCode::Pop)
                .count(),
            2
        );
    }

    #[test]
    fn test_print_code_writes_listing() {
        let mut heap = Heap::new();
        let mut diagnostics = Vec::new();
        let options = CompileOptions { print_code: true };
        let function = compile(
            "አውጣ 1;",
            &mut heap,
            RootSet::default(),
            &options,
            &mut diagnostics,
        );
        assert!(function.is_some());
        let listing = String::from_utf8_lossy(&diagnostics);
        assert!(listing.contains("== <script> =="));
        assert!(listing.contains("Print"));
    }
}
