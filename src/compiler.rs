// File: src/compiler.rs
//
// Single-pass Pratt-style compiler: no AST, no separate parse tree pass.
// Each grammar rule both parses its tokens and emits bytecode for them in
// the same walk, driven by a precedence-climbing expression parser and a
// straight-line recursive-descent statement parser.

use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::gc::Heap;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::{ObjFunction, ObjRef};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
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

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    depth: Option<usize>, // None while the initializer is still being compiled
    is_captured: bool,
}

struct UpvalueRef {
    index: u8,
    is_local: bool,
}

struct FrameState<'src> {
    function_name: Option<String>,
    kind: FunctionKind,
    chunk: Chunk,
    arity: u8,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

impl<'src> FrameState<'src> {
    fn new(kind: FunctionKind, function_name: Option<String>) -> Self {
        // Slot 0 is reserved: the receiver for methods/initializers, an
        // unnamed (inaccessible) slot for plain functions and the script.
        let slot0_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this"
        } else {
            ""
        };
        Self {
            function_name,
            kind,
            chunk: Chunk::new(),
            arity: 0,
            locals: vec![Local {
                name: Token { kind: TokenKind::Identifier, lexeme: slot0_name, line: 0 },
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,

    frames: Vec<FrameState<'src>>,
    class_stack: Vec<ClassState>,
    /// Upvalue descriptors for the function `end_compiler` most recently
    /// finished, stashed here because popping its frame would otherwise
    /// discard them before `function()` can emit the capture pairs.
    pending_upvalues: Vec<UpvalueRef>,
}

type ParseFn<'src> = fn(&mut Compiler<'src>, &mut Heap, bool);

struct Rule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn rule<'src>(kind: TokenKind) -> Rule<'src> {
    use TokenKind::*;
    match kind {
        LeftParen => Rule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call), precedence: Precedence::Call },
        Dot => Rule { prefix: None, infix: Some(Compiler::dot), precedence: Precedence::Call },
        Minus => Rule { prefix: Some(Compiler::unary), infix: Some(Compiler::binary), precedence: Precedence::Term },
        Plus => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Term },
        Slash => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Star => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Bang => Rule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None },
        BangEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        EqualEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        Greater => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        GreaterEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Less => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        LessEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Identifier => Rule { prefix: Some(Compiler::variable), infix: None, precedence: Precedence::None },
        String => Rule { prefix: Some(Compiler::string), infix: None, precedence: Precedence::None },
        Number => Rule { prefix: Some(Compiler::number), infix: None, precedence: Precedence::None },
        And => Rule { prefix: None, infix: Some(Compiler::and), precedence: Precedence::And },
        Or => Rule { prefix: None, infix: Some(Compiler::or), precedence: Precedence::Or },
        False => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        True => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        Nil => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        This => Rule { prefix: Some(Compiler::this), infix: None, precedence: Precedence::None },
        Super => Rule { prefix: Some(Compiler::super_), infix: None, precedence: Precedence::None },
        _ => Rule { prefix: None, infix: None, precedence: Precedence::None },
    }
}

pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut scanner = Scanner::new(source);
    let first = scanner.scan_token();
    let mut compiler = Compiler {
        scanner,
        current: first,
        previous: first,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        frames: vec![FrameState::new(FunctionKind::Script, None)],
        class_stack: Vec::new(),
        pending_upvalues: Vec::new(),
    };

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration(heap);
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    let function = compiler.end_compiler(heap);
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'src> Compiler<'src> {
    fn frame(&mut self) -> &mut FrameState<'src> {
        self.frames.last_mut().expect("compiler always has an active frame")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frame().chunk
    }

    // ---- token stream ------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = if token.kind == TokenKind::Eof { None } else { Some(token.lexeme.to_string()) };
        self.errors.push(CompileError::new(token.line, lexeme, message));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- emission ------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, a: OpCode, b: u8) {
        self.emit_op(a);
        self.emit_byte(b);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_constant(&mut self, heap: &mut Heap, value: Value) {
        let idx = self.make_constant(heap, value);
        self.emit_ops(OpCode::Constant, idx);
    }

    fn make_constant(&mut self, _heap: &mut Heap, value: Value) -> u8 {
        let idx = self.current_chunk().add_constant(value);
        if idx > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn identifier_constant(&mut self, heap: &mut Heap, name: &str) -> u8 {
        let bytes = name.as_bytes().to_vec();
        let obj = self.intern(heap, &bytes);
        self.make_constant(heap, Value::Obj(obj))
    }

    fn intern(&mut self, heap: &mut Heap, bytes: &[u8]) -> ObjRef {
        let mut roots = |h: &mut Heap| self.mark_roots(h);
        heap.alloc_string(bytes, &mut roots)
    }

    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn end_compiler(&mut self, heap: &mut Heap) -> ObjRef {
        self.emit_return();

        #[cfg(feature = "print-code")]
        {
            let frame = self.frames.last().expect("end_compiler called with an active frame");
            let label = frame.function_name.clone().unwrap_or_else(|| "<script>".to_string());
            crate::chunk::disassemble::chunk(&frame.chunk, &label);
        }

        // Intern the name while this frame is still on `self.frames`, so
        // `mark_roots` still walks its constant pool — which, for an
        // enclosing function, already holds finished `ObjFunction`s for
        // any nested functions compiled earlier (added as `Closure`
        // operands). Popping the frame before this allocation would leave
        // those already-built nested functions unrooted.
        let name_str =
            self.frames.last().expect("end_compiler called with an active frame").function_name.clone();
        let name = name_str.map(|n| {
            let bytes = n.as_bytes().to_vec();
            self.intern(heap, &bytes)
        });

        let frame = self.frames.pop().expect("end_compiler called with an active frame");
        let upvalue_count = frame.upvalues.len() as u8;
        self.pending_upvalues = frame.upvalues;
        let function = ObjFunction { arity: frame.arity, upvalue_count, chunk: frame.chunk, name };

        // The frame is gone from `self.frames` now, so `function`'s own
        // constant pool (same nested-function concern as above) needs to
        // be marked explicitly for this final allocation.
        let constants = function.chunk.constants.clone();
        let mut roots = |h: &mut Heap| {
            self.mark_roots(h);
            for &c in &constants {
                h.mark_value(c);
            }
        };
        heap.alloc_function(function, &mut roots)
    }

    /// Marks every value still reachable only through in-progress (not
    /// yet heap-allocated) chunks — every open frame's constant pool —
    /// plus anything captured in already-finished nested functions,
    /// which live as constants in their enclosing frame's pool.
    pub fn mark_roots(&self, heap: &mut Heap) {
        for frame in &self.frames {
            for &constant in &frame.chunk.constants {
                heap.mark_value(constant);
            }
        }
    }

    // ---- scopes ----------------------------------------------------------

    fn begin_scope(&mut self) {
        self.frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame().scope_depth -= 1;
        let depth = self.frame().scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth.map(|d| d > depth).unwrap_or(false) {
                if self.frame().locals.last().unwrap().is_captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
                self.frame().locals.pop();
            } else {
                break;
            }
        }
    }

    // ---- declarations --------------------------------------------------

    fn declaration(&mut self, heap: &mut Heap) {
        if self.matches(TokenKind::Class) {
            self.class_declaration(heap);
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration(heap);
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.statement(heap);
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(heap, name_token.lexeme);
        self.declare_variable(name_token);

        self.emit_ops(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_stack.push(ClassState { has_superclass: false });

        self.named_variable(heap, name_token, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class value pushed for method binding

        self.class_stack.pop();
    }

    fn method(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_token = self.previous;
        let constant = self.identifier_constant(heap, name_token.lexeme);
        let kind =
            if name_token.lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(heap, kind, Some(name_token.lexeme.to_string()));
        self.emit_ops(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name_token = self.previous;
        let global = self.identifier_constant(heap, name_token.lexeme);
        self.mark_initialized();
        self.function(heap, FunctionKind::Function, Some(name_token.lexeme.to_string()));
        self.define_variable(global);
    }

    fn function(&mut self, heap: &mut Heap, kind: FunctionKind, name: Option<String>) {
        self.frames.push(FrameState::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.frame().arity += 1;
                if self.frame().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let param = self.previous;
                self.declare_variable(param);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(heap);

        let function = self.end_compiler(heap);
        let idx = self.make_constant(heap, Value::Obj(function));
        self.emit_ops(OpCode::Closure, idx);

        for uv in std::mem::take(&mut self.pending_upvalues) {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression(heap);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn parse_variable(&mut self, heap: &mut Heap, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous;
        self.declare_variable(name);
        if self.frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(heap, name.lexeme)
    }

    fn declare_variable(&mut self, name: Token<'src>) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        let mut duplicate = false;
        for local in self.frame().locals.iter().rev() {
            if local.depth.map(|d| d < depth).unwrap_or(false) {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame().locals.push(Local { name, depth: None, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        if let Some(local) = self.frame().locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    // ---- statements --------------------------------------------------

    fn statement(&mut self, heap: &mut Heap) {
        if self.matches(TokenKind::Print) {
            self.print_statement(heap);
        } else if self.matches(TokenKind::For) {
            self.for_statement(heap);
        } else if self.matches(TokenKind::If) {
            self.if_statement(heap);
        } else if self.matches(TokenKind::Return) {
            self.return_statement(heap);
        } else if self.matches(TokenKind::While) {
            self.while_statement(heap);
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope();
        } else {
            self.expression_statement(heap);
        }
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.frames.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement(heap);
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression(heap);
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement(heap);
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // ---- expressions -------------------------------------------------

    fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(heap, Precedence::Assignment);
    }

    fn parse_precedence(&mut self, heap: &mut Heap, precedence: Precedence) {
        self.advance();
        let prefix = rule(self.previous.kind).prefix;
        let prefix = match prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, heap, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix.expect("infix rule must exist for looped token");
            infix(self, heap, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, heap: &mut Heap, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        #[cfg(not(feature = "integer-only"))]
        let value = {
            let n: f64 = lexeme.parse().unwrap_or(0.0);
            Value::Number(n)
        };
        #[cfg(feature = "integer-only")]
        let value = {
            let n: i64 = lexeme.parse().unwrap_or(0);
            Value::Number(n)
        };
        self.emit_constant(heap, value);
    }

    fn string(&mut self, heap: &mut Heap, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let bytes = lexeme[1..lexeme.len() - 1].as_bytes().to_vec();
        let obj = self.intern(heap, &bytes);
        self.emit_constant(heap, Value::Obj(obj));
    }

    fn literal(&mut self, _heap: &mut Heap, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() only dispatched for false/true/nil"),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(heap, Precedence::Unary);
        match kind {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary() only dispatched for '!'/'-'"),
        }
    }

    fn binary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let kind = self.previous.kind;
        let rule = rule(kind);
        self.parse_precedence(heap, rule.precedence.next());
        match kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary() only dispatched for binary operator tokens"),
        }
    }

    fn call(&mut self, heap: &mut Heap, _can_assign: bool) {
        let arg_count = self.argument_list(heap);
        self.emit_ops(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap);
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_token = self.previous;
        let name = self.identifier_constant(heap, name_token.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression(heap);
            self.emit_ops(OpCode::SetProperty, name);
        } else {
            self.emit_ops(OpCode::GetProperty, name);
        }
    }

    fn and(&mut self, heap: &mut Heap, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, heap: &mut Heap, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, heap: &mut Heap, can_assign: bool) {
        let name = self.previous;
        self.named_variable_assignable(heap, name, can_assign);
    }

    fn this(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let name = self.previous;
        self.named_variable(heap, name, false);
    }

    fn super_(&mut self, _heap: &mut Heap, _can_assign: bool) {
        self.error("Superclasses are not supported.");
    }

    fn named_variable(&mut self, heap: &mut Heap, name: Token<'src>, can_assign: bool) {
        self.named_variable_assignable(heap, name, can_assign);
    }

    fn named_variable_assignable(&mut self, heap: &mut Heap, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(self.frames.len() - 1, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(self.frames.len() - 1, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let global = self.identifier_constant(heap, name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, global)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression(heap);
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    fn resolve_local(&mut self, frame_idx: usize, name: Token<'src>) -> Option<u8> {
        let frame = &self.frames[frame_idx];
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if local.name.lexeme == name.lexeme {
                if local.depth.is_none() {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: Token<'src>) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        if let Some(local_slot) = self.resolve_local(frame_idx - 1, name) {
            self.frames[frame_idx - 1].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_slot, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(frame_idx - 1, name) {
            return Some(self.add_upvalue(frame_idx, upvalue_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.frames[frame_idx];
        for (i, uv) in frame.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if frame.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueRef { index, is_local });
        (frame.upvalues.len() - 1) as u8
    }
}
