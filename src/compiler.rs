use std::rc::Rc;

use crate::scanner::{Scanner, Token, TokenKind};
use crate::vm::chunk::{op, Chunk};
use crate::vm::heap::Heap;
use crate::vm::object::{FunctionObj, Obj};
use crate::vm::value::{ObjRef, Value};

// ---------------------------------------------------------------------------
// Parser state
// ---------------------------------------------------------------------------

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

// ---------------------------------------------------------------------------
// Precedence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Ternary,    // ?:
    Pipe,       // |>
    Or,         // ||
    And,        // &&
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Equality,   // == != is
    Comparison, // < > <= >= in instanceof
    Shift,      // << >> >>>
    Term,       // + -
    Factor,     // * / %
    Range,      // ..
    Unary,      // ! - ~ typeof
    Call,       // . () [] {}
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Pipe,
            Precedence::Pipe => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Range,
            Precedence::Range => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Infix binding power per token kind.
fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::LeftParen
        | TokenKind::LeftBrace
        | TokenKind::LeftBracket
        | TokenKind::Dot => Precedence::Call,
        TokenKind::Question => Precedence::Ternary,
        TokenKind::Pipe => Precedence::Pipe,
        TokenKind::BarBar => Precedence::Or,
        TokenKind::AmpAmp => Precedence::And,
        TokenKind::Bar => Precedence::BitOr,
        TokenKind::Caret => Precedence::BitXor,
        TokenKind::Amp => Precedence::BitAnd,
        TokenKind::EqualEqual | TokenKind::BangEqual | TokenKind::Is => Precedence::Equality,
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual
        | TokenKind::In
        | TokenKind::Instanceof => Precedence::Comparison,
        TokenKind::LeftShift | TokenKind::RightShift | TokenKind::RightShiftU => Precedence::Shift,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
        TokenKind::DotDot => Precedence::Range,
        _ => Precedence::None,
    }
}

/// Bytecode op for a compound-assignment token, if the token is one.
fn compound_assign_op(kind: TokenKind) -> Option<u8> {
    match kind {
        TokenKind::PlusEqual => Some(op::ADD),
        TokenKind::MinusEqual => Some(op::SUB),
        TokenKind::StarEqual => Some(op::MUL),
        TokenKind::SlashEqual => Some(op::DIV),
        TokenKind::PercentEqual => Some(op::MOD),
        TokenKind::CaretEqual => Some(op::BIT_XOR),
        TokenKind::AmpEqual => Some(op::BIT_AND),
        TokenKind::BarEqual => Some(op::BIT_OR),
        TokenKind::LeftShiftEqual => Some(op::LSH),
        TokenKind::RightShiftEqual => Some(op::ASH),
        TokenKind::RightShiftUEqual => Some(op::RSH),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Function compilation frames
// ---------------------------------------------------------------------------

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Lambda,
    Method,
    Constructor,
    Script,
}

struct Local<'src> {
    name: &'src str,
    /// -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct UpvalueSpec {
    index: u8,
    is_local: bool,
}

struct LoopState {
    continue_target: usize,
    depth: i32,
    break_jumps: Vec<usize>,
}

/// One frame per nested function, method, lambda, or script being compiled.
struct FunctionCompiler<'src> {
    kind: FunctionKind,
    chunk: Chunk,
    arity: usize,
    name: Option<crate::vm::value::StrId>,
    is_lambda: bool,
    varargs: bool,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSpec>,
    scope_depth: i32,
    loop_state: Option<LoopState>,
}

impl<'src> FunctionCompiler<'src> {
    fn new(kind: FunctionKind) -> FunctionCompiler<'src> {
        // Slot 0 is reserved: it names `this` everywhere except plain
        // functions and lambdas, whose receiver slot is anonymous.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Function | FunctionKind::Lambda) {
                ""
            } else {
                "this"
            },
            depth: 0,
            is_captured: false,
        };
        FunctionCompiler {
            kind,
            chunk: Chunk::new(),
            arity: 0,
            name: None,
            is_lambda: kind == FunctionKind::Lambda,
            varargs: false,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_state: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Compile a source unit to its top-level function object, or `None` after
/// reporting compile errors to stderr. Collection is gated off for the
/// duration so in-progress functions and constants cannot be swept.
pub fn compile(heap: &mut Heap, source: &str) -> Option<ObjRef> {
    let was_gc = heap.should_gc;
    heap.should_gc = false;

    let blank = Token {
        kind: TokenKind::Eof,
        text: "",
        line: 0,
    };
    let mut compiler = Compiler {
        parser: Parser {
            scanner: Scanner::new(source),
            current: blank,
            previous: blank,
            had_error: false,
            panic_mode: false,
        },
        heap: &mut *heap,
        frames: vec![FunctionCompiler::new(FunctionKind::Script)],
        class_depth: 0,
    };

    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_return();

    let had_error = compiler.parser.had_error;
    let frame = match compiler.frames.pop() {
        Some(frame) => frame,
        None => unreachable!("script frame missing"),
    };
    let function = heap.alloc(Obj::Function(FunctionObj {
        arity: frame.arity,
        upvalue_count: frame.upvalues.len(),
        chunk: Rc::new(frame.chunk),
        name: None,
        is_lambda: false,
        varargs: false,
    }));

    heap.should_gc = was_gc;
    if had_error {
        None
    } else {
        Some(function)
    }
}

struct Compiler<'src, 'h> {
    parser: Parser<'src>,
    heap: &'h mut Heap,
    frames: Vec<FunctionCompiler<'src>>,
    class_depth: usize,
}

impl<'src, 'h> Compiler<'src, 'h> {
    // -- Token plumbing --

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.text;
            self.error_raw(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error(message);
    }

    fn error(&mut self, message: &str) {
        self.error_raw(message);
    }

    fn error_raw(&mut self, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        let token = self.parser.current;
        eprint!("[{}] Error ", token.line);
        match token.kind {
            TokenKind::Eof => eprint!("at EOF"),
            TokenKind::Error => {}
            _ => eprint!("at '{}'", token.text),
        }
        eprintln!(": {}", message);
        self.parser.had_error = true;
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Function
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::Foreach
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Try
                | TokenKind::Throw
                | TokenKind::Switch
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Import
                | TokenKind::Export => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- Emit helpers --

    fn state(&mut self) -> &mut FunctionCompiler<'src> {
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.state().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_pair(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_uleb(&mut self, value: usize) {
        let line = self.parser.previous.line;
        self.current_chunk().write_uleb128(value, line);
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Constructor {
            self.emit_pair(op::GET_LOCAL, 0);
        } else {
            self.emit_byte(op::NULL);
        }
        self.emit_byte(op::RETURN);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.current_chunk().add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_byte(op::CONSTANT);
        self.emit_uleb(constant);
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let id = self.heap.intern(name);
        self.make_constant(Value::Obj(id.obj))
    }

    fn emit_jump(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        self.emit_pair(0xff, 0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.current_chunk().code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(op::LOOP);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_pair(((offset >> 8) & 0xff) as u8, (offset & 0xff) as u8);
    }

    // -- Scopes, locals, upvalues --

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        loop {
            let captured = {
                let state = self.state();
                match state.locals.last() {
                    Some(local) if local.depth > state.scope_depth => Some(local.is_captured),
                    _ => None,
                }
            };
            match captured {
                Some(captured) => {
                    self.state().locals.pop();
                    if captured {
                        self.emit_byte(op::CLOSE_UPVALUE);
                    } else {
                        self.emit_byte(op::POP);
                    }
                }
                None => break,
            }
        }
    }

    /// Emit pops for locals deeper than `depth` without discarding their
    /// compile-time slots (used by `break`/`continue` leaving a loop body).
    fn emit_pops_to_depth(&mut self, depth: i32) {
        let index = self.frames.len() - 1;
        let ops: Vec<u8> = self.frames[index]
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| {
                if local.is_captured {
                    op::CLOSE_UPVALUE
                } else {
                    op::POP
                }
            })
            .collect();
        for byte in ops {
            self.emit_byte(byte);
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in scope.");
            return;
        }
        self.state().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.text;
        let state = self.state();
        let mut clash = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                clash = true;
                break;
            }
        }
        if clash {
            self.error("Already a variable with this name in scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.text;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: usize) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_byte(op::DEFINE_GLOBAL);
        self.emit_uleb(global);
    }

    fn resolve_local(&mut self, frame: usize, name: &str) -> Option<usize> {
        let mut found = None;
        for (index, local) in self.frames[frame].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((index, local.depth));
                break;
            }
        }
        let (index, depth) = found?;
        if depth == -1 {
            self.error("Cannot read local variable within its own initializer.");
        }
        Some(index)
    }

    fn resolve_upvalue(&mut self, frame: usize, name: &str) -> Option<usize> {
        if frame == 0 {
            return None;
        }
        let enclosing = frame - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local].is_captured = true;
            return Some(self.add_upvalue(frame, local as u8, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame, upvalue as u8, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame: usize, index: u8, is_local: bool) -> usize {
        let spec = UpvalueSpec { index, is_local };
        if let Some(existing) = self.frames[frame].upvalues.iter().position(|u| *u == spec) {
            return existing;
        }
        if self.frames[frame].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame].upvalues.push(spec);
        self.frames[frame].upvalues.len() - 1
    }

    // -- Pratt driver --

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_dispatch(self.parser.previous.kind, can_assign) {
            self.error("Expected expression.");
            return;
        }

        while precedence <= infix_precedence(self.parser.current.kind) {
            self.advance();
            self.infix_dispatch(self.parser.previous.kind, can_assign);
        }

        if can_assign {
            if self.matches(TokenKind::Equal) {
                self.error("Invalid assignment target.");
            } else if compound_assign_op(self.parser.current.kind).is_some() {
                self.advance();
                self.error("Invalid assignment target.");
            }
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn prefix_dispatch(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::LeftBrace => self.object_literal(),
            TokenKind::LeftBracket => self.list_literal(),
            TokenKind::Minus | TokenKind::Bang | TokenKind::Tilde | TokenKind::Typeof => {
                self.unary()
            }
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::String => self.string(),
            TokenKind::Number => self.number(),
            TokenKind::True => self.emit_byte(op::TRUE),
            TokenKind::False => self.emit_byte(op::FALSE),
            TokenKind::Null => self.emit_byte(op::NULL),
            TokenKind::This => self.this_(),
            TokenKind::Super => self.super_(),
            TokenKind::Bar => self.lambda(false),
            TokenKind::BarBar => self.lambda(true),
            TokenKind::Import => self.import_expression(),
            TokenKind::Switch => self.switch_impl(true),
            _ => return false,
        }
        true
    }

    fn infix_dispatch(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::LeftBrace => self.object_body(),
            TokenKind::LeftBracket => self.index(can_assign),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::Question => self.ternary(),
            TokenKind::Pipe => self.pipe(),
            TokenKind::BarBar => self.or_(),
            TokenKind::AmpAmp => self.and_(),
            TokenKind::DotDot => self.range(),
            _ => self.binary(kind),
        }
    }

    // -- Expressions --

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.parser.previous.text.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let raw = self.parser.previous.text;
        let inner = &raw[1..raw.len() - 1];
        let id = self.heap.take_string(unescape(inner));
        self.emit_constant(Value::Obj(id.obj));
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let frame = self.frames.len() - 1;
        let (get_op, set_op, arg, is_global) =
            if let Some(slot) = self.resolve_local(frame, name.text) {
                (op::GET_LOCAL, op::SET_LOCAL, slot, false)
            } else if let Some(upvalue) = self.resolve_upvalue(frame, name.text) {
                (op::GET_UPVALUE, op::SET_UPVALUE, upvalue, false)
            } else {
                let constant = self.identifier_constant(name.text);
                (op::GET_GLOBAL, op::SET_GLOBAL, constant, true)
            };

        let emit_get = |this: &mut Self| {
            if is_global {
                this.emit_byte(get_op);
                this.emit_uleb(arg);
            } else {
                this.emit_pair(get_op, arg as u8);
            }
        };
        let emit_set = |this: &mut Self| {
            if is_global {
                this.emit_byte(set_op);
                this.emit_uleb(arg);
            } else {
                this.emit_pair(set_op, arg as u8);
            }
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            emit_set(self);
        } else if can_assign && compound_assign_op(self.parser.current.kind).is_some() {
            self.advance();
            let binary = match compound_assign_op(self.parser.previous.kind) {
                Some(byte) => byte,
                None => unreachable!("compound token vanished"),
            };
            emit_get(self);
            self.expression();
            self.emit_byte(binary);
            emit_set(self);
        } else {
            emit_get(self);
        }
    }

    fn this_(&mut self) {
        if self.class_depth == 0 {
            self.error("Use of 'this' is not permitted outside of a class.");
        }
        self.named_variable(Token::synthetic("this"), false);
    }

    fn super_(&mut self) {
        if self.class_depth == 0 {
            self.error("Use of 'super' is not permitted outside of a class.");
        }
        self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expected superclass method name.");
        let name = self.identifier_constant(self.parser.previous.text);

        self.named_variable(Token::synthetic("this"), false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_byte(op::SUPER_INVOKE);
            self.emit_uleb(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_byte(op::GET_SUPER);
            self.emit_uleb(name);
        }
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_byte(op::NEGATE),
            TokenKind::Bang => self.emit_byte(op::NOT),
            TokenKind::Tilde => self.emit_byte(op::BIT_NOT),
            TokenKind::Typeof => self.emit_byte(op::TYPEOF),
            _ => unreachable!("not a unary operator"),
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        self.parse_precedence(infix_precedence(operator).next());
        match operator {
            TokenKind::Plus => self.emit_byte(op::ADD),
            TokenKind::Minus => self.emit_byte(op::SUB),
            TokenKind::Star => self.emit_byte(op::MUL),
            TokenKind::Slash => self.emit_byte(op::DIV),
            TokenKind::Percent => self.emit_byte(op::MOD),
            TokenKind::Amp => self.emit_byte(op::BIT_AND),
            TokenKind::Bar => self.emit_byte(op::BIT_OR),
            TokenKind::Caret => self.emit_byte(op::BIT_XOR),
            TokenKind::LeftShift => self.emit_byte(op::LSH),
            TokenKind::RightShift => self.emit_byte(op::ASH),
            TokenKind::RightShiftU => self.emit_byte(op::RSH),
            TokenKind::EqualEqual => self.emit_byte(op::EQUAL),
            TokenKind::BangEqual => self.emit_byte(op::NOT_EQUAL),
            TokenKind::Is => self.emit_byte(op::IS),
            TokenKind::Greater => self.emit_byte(op::GREATER),
            TokenKind::GreaterEqual => self.emit_byte(op::GREATER_EQ),
            TokenKind::Less => self.emit_byte(op::LESS),
            TokenKind::LessEqual => self.emit_byte(op::LESS_EQ),
            TokenKind::In => self.emit_byte(op::IN),
            TokenKind::Instanceof => self.emit_byte(op::INSTANCEOF),
            _ => unreachable!("not a binary operator"),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(op::JUMP_IF_FALSE_SC);
        self.emit_byte(op::POP);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(op::JUMP_IF_FALSE_SC);
        let end_jump = self.emit_jump(op::JUMP);
        self.patch_jump(else_jump);
        self.emit_byte(op::POP);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self) {
        let else_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.parse_precedence(Precedence::Ternary);
        let end_jump = self.emit_jump(op::JUMP);
        self.consume(TokenKind::Colon, "Expected ':' after ternary branch.");
        self.patch_jump(else_jump);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    fn pipe(&mut self) {
        // a |> f is f(a): evaluate f, swap it under a, call with one arg.
        self.parse_precedence(Precedence::Pipe.next());
        self.emit_byte(op::SWAP);
        self.emit_pair(op::CALL, 1);
    }

    fn range(&mut self) {
        self.parse_precedence(Precedence::Range.next());
        self.emit_byte(op::RANGE);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_pair(op::CALL, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Cannot pass more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments.");
        arg_count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let name = self.identifier_constant(self.parser.previous.text);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_byte(op::SET_PROPERTY);
            self.emit_uleb(name);
        } else if can_assign && compound_assign_op(self.parser.current.kind).is_some() {
            self.advance();
            let binary = match compound_assign_op(self.parser.previous.kind) {
                Some(byte) => byte,
                None => unreachable!("compound token vanished"),
            };
            self.emit_byte(op::DUP);
            self.emit_byte(op::GET_PROPERTY);
            self.emit_uleb(name);
            self.expression();
            self.emit_byte(binary);
            self.emit_byte(op::SET_PROPERTY);
            self.emit_uleb(name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_byte(op::INVOKE);
            self.emit_uleb(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_byte(op::GET_PROPERTY);
            self.emit_uleb(name);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expected ']' after index.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_byte(op::SET_INDEX);
        } else if can_assign && compound_assign_op(self.parser.current.kind).is_some() {
            self.advance();
            let binary = match compound_assign_op(self.parser.previous.kind) {
                Some(byte) => byte,
                None => unreachable!("compound token vanished"),
            };
            self.emit_byte(op::DUP_X2);
            self.emit_byte(op::GET_INDEX);
            self.expression();
            self.emit_byte(binary);
            self.emit_byte(op::SET_INDEX);
        } else {
            self.emit_byte(op::GET_INDEX);
        }
    }

    fn list_literal(&mut self) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Cannot have more than 255 items in a list literal.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after list items.");
        self.emit_pair(op::LIST, count.min(255) as u8);
    }

    fn object_literal(&mut self) {
        self.emit_byte(op::OBJECT);
        self.emit_pair(op::CALL, 0);
        self.object_body();
    }

    /// `{ k: v, k2, … }` applied to the value on the stack. Bare `k` is
    /// shorthand for `k: k`.
    fn object_body(&mut self) {
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.consume(
                    TokenKind::Identifier,
                    "Expected identifier key for object key-value pair.",
                );
                let key = self.parser.previous;
                let name = self.identifier_constant(key.text);
                if self.matches(TokenKind::Colon) {
                    self.expression();
                } else {
                    self.named_variable(key, false);
                }
                self.emit_byte(op::SET_PROPERTY_KV);
                self.emit_uleb(name);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after object body.");
    }

    fn import_expression(&mut self) {
        self.consume(TokenKind::String, "Expected import path string.");
        let raw = self.parser.previous.text;
        let path = unescape(&raw[1..raw.len() - 1]);
        let id = self.heap.take_string(path);
        let constant = self.make_constant(Value::Obj(id.obj));
        self.emit_byte(op::IMPORT);
        self.emit_uleb(constant);
    }

    // -- Functions, lambdas, classes --

    fn function(&mut self, kind: FunctionKind, name: Option<&str>) {
        let mut frame = FunctionCompiler::new(kind);
        frame.name = name.map(|n| self.heap.intern(n));
        self.frames.push(frame);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.state().arity += 1;
                if self.state().arity > 255 {
                    self.error("Functions may not exceed 255 parameters.");
                }
                let constant = self.parse_variable("Expected parameter name");
                self.define_variable(constant);
                if self.matches(TokenKind::DotDotDot) {
                    self.state().varargs = true;
                    if self.matches(TokenKind::Comma) {
                        self.error("Varargs parameter must be the last parameter.");
                    }
                    break;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after function parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body");
        self.block();

        self.finish_function();
    }

    fn lambda(&mut self, zero_params: bool) {
        self.frames.push(FunctionCompiler::new(FunctionKind::Lambda));
        self.begin_scope();

        if !zero_params {
            if !self.check(TokenKind::Bar) {
                loop {
                    self.state().arity += 1;
                    if self.state().arity > 255 {
                        self.error("Functions may not exceed 255 parameters.");
                    }
                    let constant = self.parse_variable("Expected parameter name");
                    self.define_variable(constant);
                    if self.matches(TokenKind::DotDotDot) {
                        self.state().varargs = true;
                        break;
                    }
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::Bar, "Expected '|' after lambda parameters.");
        }

        if self.matches(TokenKind::LeftBrace) {
            self.block();
        } else {
            self.expression();
            self.emit_byte(op::RETURN);
        }

        self.finish_function();
    }

    /// Pop the finished function frame, allocate its function object, and
    /// emit the CLOSURE instruction with its upvalue descriptors.
    fn finish_function(&mut self) {
        self.emit_return();
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => unreachable!("function frame missing"),
        };
        let function = self.heap.alloc(Obj::Function(FunctionObj {
            arity: frame.arity,
            upvalue_count: frame.upvalues.len(),
            chunk: Rc::new(frame.chunk),
            name: frame.name,
            is_lambda: frame.is_lambda,
            varargs: frame.varargs,
        }));
        let constant = self.make_constant(Value::Obj(function));
        self.emit_byte(op::CLOSURE);
        self.emit_uleb(constant);
        for upvalue in &frame.upvalues {
            let is_local = if upvalue.is_local { 1 } else { 0 };
            let index = upvalue.index;
            self.emit_pair(is_local, index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected method name.");
        let name_token = self.parser.previous;
        let constant = self.identifier_constant(name_token.text);
        let kind = if name_token.text == "constructor" {
            FunctionKind::Constructor
        } else {
            FunctionKind::Method
        };
        self.function(kind, Some(name_token.text));
        self.emit_byte(op::METHOD);
        self.emit_uleb(constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name.text);
        self.declare_variable();

        self.emit_byte(op::CLASS);
        self.emit_uleb(name_constant);
        self.define_variable(name_constant);

        self.class_depth += 1;

        if self.matches(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expected superclass name.");
            self.variable(false);
            if class_name.text == self.parser.previous.text {
                self.error("A class cannot inherit from itself.");
            }
        } else {
            self.emit_byte(op::OBJECT);
        }

        self.begin_scope();
        self.add_local("super");
        self.define_variable(0);

        self.named_variable(class_name, false);
        self.emit_byte(op::INHERIT);

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body");
        self.emit_byte(op::POP);

        self.end_scope();
        self.class_depth -= 1;
    }

    // -- Statements --

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_byte(op::NULL);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expected function name");
        let name = self.parser.previous.text;
        self.mark_initialized();
        self.function(FunctionKind::Function, Some(name));
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
        self.emit_byte(op::POP);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.statement();
        let else_jump = self.emit_jump(op::JUMP);
        self.patch_jump(then_jump);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Cannot return from top-level of program.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Constructor {
                self.error("Cannot return a value from a constructor.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value");
            self.emit_byte(op::RETURN);
        }
    }

    fn begin_loop(&mut self, continue_target: usize) -> Option<LoopState> {
        let depth = self.state().scope_depth;
        self.state().loop_state.replace(LoopState {
            continue_target,
            depth,
            break_jumps: Vec::new(),
        })
    }

    fn end_loop(&mut self, enclosing: Option<LoopState>) {
        let finished = self.state().loop_state.take();
        if let Some(state) = finished {
            for jump in state.break_jumps {
                self.patch_jump(jump);
            }
        }
        self.state().loop_state = enclosing;
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        let enclosing = self.begin_loop(loop_start);

        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition");

        let exit_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        self.end_loop(enclosing);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initialiser clause.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after condition");
            exit_jump = Some(self.emit_jump(op::JUMP_IF_FALSE));
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(op::JUMP);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_byte(op::POP);
            self.consume(TokenKind::RightParen, "Expected ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let enclosing = self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
        }
        self.end_loop(enclosing);
        self.end_scope();
    }

    /// foreach (var x in e) s lowers to an iterator() / more() / next()
    /// protocol loop over hidden locals.
    fn foreach_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'foreach'.");
        self.consume(TokenKind::Var, "Expected 'var' in foreach.");
        self.consume(TokenKind::Identifier, "Expected loop variable name.");
        let variable = self.parser.previous;
        self.consume(TokenKind::In, "Expected 'in' after loop variable.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after foreach iterable.");

        let iterator_constant = self.identifier_constant("iterator");
        let more_constant = self.identifier_constant("more");
        let next_constant = self.identifier_constant("next");

        // The iterator occupies a hidden slot; the loop variable the next.
        self.emit_byte(op::INVOKE);
        self.emit_uleb(iterator_constant);
        self.emit_byte(0);
        self.add_local("<iterator>");
        self.mark_initialized();
        let iterator_slot = (self.state().locals.len() - 1) as u8;

        self.emit_byte(op::NULL);
        self.add_local(variable.text);
        self.mark_initialized();
        let variable_slot = (self.state().locals.len() - 1) as u8;

        let loop_start = self.current_chunk().code.len();
        let enclosing = self.begin_loop(loop_start);

        self.emit_pair(op::GET_LOCAL, iterator_slot);
        self.emit_byte(op::INVOKE);
        self.emit_uleb(more_constant);
        self.emit_byte(0);
        let exit_jump = self.emit_jump(op::JUMP_IF_FALSE);

        self.emit_pair(op::GET_LOCAL, iterator_slot);
        self.emit_byte(op::INVOKE);
        self.emit_uleb(next_constant);
        self.emit_byte(0);
        self.emit_pair(op::SET_LOCAL, variable_slot);
        self.emit_byte(op::POP);

        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        self.end_loop(enclosing);
        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.state().loop_state.is_none() {
            self.error("Cannot use 'break' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expected ';' after 'break'.");
            return;
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after 'break'.");
        let depth = match &self.state().loop_state {
            Some(state) => state.depth,
            None => unreachable!(),
        };
        self.emit_pops_to_depth(depth);
        let jump = self.emit_jump(op::JUMP);
        if let Some(state) = &mut self.state().loop_state {
            state.break_jumps.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        if self.state().loop_state.is_none() {
            self.error("Cannot use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expected ';' after 'continue'.");
            return;
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after 'continue'.");
        let (depth, target) = match &self.state().loop_state {
            Some(state) => (state.depth, state.continue_target),
            None => unreachable!(),
        };
        self.emit_pops_to_depth(depth);
        self.emit_loop(target);
    }

    fn try_statement(&mut self) {
        let try_begin = self.emit_jump(op::TRY_BEGIN);
        self.consume(TokenKind::LeftBrace, "Expected '{' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_byte(op::TRY_END);
        let skip_catch = self.emit_jump(op::JUMP);

        self.patch_jump(try_begin);
        self.consume(TokenKind::Catch, "Expected 'catch' after try block.");
        if self.matches(TokenKind::LeftParen) {
            self.consume(TokenKind::Identifier, "Expected exception variable name.");
            let binding = self.parser.previous;
            self.consume(TokenKind::RightParen, "Expected ')' after catch binding.");
            self.begin_scope();
            // The thrown value is already on the stack; the binding adopts
            // its slot.
            self.add_local(binding.text);
            self.mark_initialized();
            self.consume(TokenKind::LeftBrace, "Expected '{' after 'catch'.");
            self.block();
            self.end_scope();
        } else {
            self.emit_byte(op::POP);
            self.consume(TokenKind::LeftBrace, "Expected '{' after 'catch'.");
            self.begin_scope();
            self.block();
            self.end_scope();
        }
        self.patch_jump(skip_catch);

        if self.matches(TokenKind::Finally) {
            self.consume(TokenKind::LeftBrace, "Expected '{' after 'finally'.");
            self.begin_scope();
            self.block();
            self.end_scope();
        }
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after throw value.");
        self.emit_byte(op::THROW);
    }

    fn export_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expected export name.");
        let name = self.parser.previous;
        let constant = self.identifier_constant(name.text);
        self.named_variable(name, false);
        self.emit_byte(op::EXPORT);
        self.emit_uleb(constant);
        self.consume(TokenKind::Semicolon, "Expected ';' after export.");
    }

    // -- switch --

    /// Shared lowering for switch statements and switch expressions. The
    /// scrutinee stays on the stack while patterns test against duplicates
    /// of it; every arm jumps to a common landing.
    fn switch_impl(&mut self, is_expression: bool) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before switch cases.");

        let mut end_jumps = Vec::new();
        let mut saw_else = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if saw_else {
                self.error("'else' must be the last switch case.");
                break;
            }
            if self.matches(TokenKind::Else) {
                saw_else = true;
                self.consume(TokenKind::Arrow, "Expected '->' after switch pattern.");
                self.emit_byte(op::POP);
                self.switch_arm_body(is_expression);
                end_jumps.push(self.emit_jump(op::JUMP));
                self.consume(TokenKind::Semicolon, "Expected ';' after switch case.");
                continue;
            }

            let mut hit_jumps = Vec::new();
            let mut fail_jump;
            loop {
                self.emit_byte(op::DUP);
                self.switch_pattern();
                fail_jump = self.emit_jump(op::JUMP_IF_FALSE);
                if self.matches(TokenKind::Comma) {
                    hit_jumps.push(self.emit_jump(op::JUMP));
                    self.patch_jump(fail_jump);
                } else {
                    break;
                }
            }
            for jump in hit_jumps {
                self.patch_jump(jump);
            }
            self.consume(TokenKind::Arrow, "Expected '->' after switch pattern.");
            self.emit_byte(op::POP);
            self.switch_arm_body(is_expression);
            end_jumps.push(self.emit_jump(op::JUMP));
            self.consume(TokenKind::Semicolon, "Expected ';' after switch case.");
            self.patch_jump(fail_jump);
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after switch cases.");

        // No arm matched: discard the scrutinee.
        self.emit_byte(op::POP);
        if is_expression {
            self.emit_byte(op::NULL);
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    /// Compile one pattern test. A duplicate of the scrutinee is on top of
    /// the stack; the test replaces it with a boolean.
    fn switch_pattern(&mut self) {
        if self.matches(TokenKind::In) {
            self.parse_precedence(Precedence::Ternary);
            self.emit_byte(op::IN);
        } else if self.matches(TokenKind::Is) {
            self.parse_precedence(Precedence::Ternary);
            self.emit_byte(op::IS);
        } else if self.matches(TokenKind::Pipe) {
            self.parse_precedence(Precedence::Ternary);
            self.emit_byte(op::SWAP);
            self.emit_pair(op::CALL, 1);
        } else if self.matches(TokenKind::Bang) {
            self.switch_pattern();
            self.emit_byte(op::NOT);
        } else {
            self.parse_precedence(Precedence::Ternary);
            self.emit_byte(op::EQUAL);
        }
    }

    fn switch_arm_body(&mut self, is_expression: bool) {
        if is_expression {
            self.expression();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression();
            self.emit_byte(op::POP);
        }
    }

    // -- Declarations --

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Foreach) {
            self.foreach_statement();
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::Throw) {
            self.throw_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_impl(false);
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Export) {
            self.export_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Function) {
            self.function_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }
}

/// Expand backslash escapes in a string literal body. Unknown escapes keep
/// the backslash verbatim.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('0') => out.push('\0'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object::Obj;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(&mut heap, source).expect("compile error");
        (heap, function)
    }

    fn script_chunk(heap: &Heap, function: ObjRef) -> Rc<Chunk> {
        match heap.get(function) {
            Obj::Function(f) => f.chunk.clone(),
            _ => panic!("not a function"),
        }
    }

    #[test]
    fn empty_script_compiles_to_implicit_return() {
        let (heap, function) = compile_ok("");
        let chunk = script_chunk(&heap, function);
        assert_eq!(chunk.code, vec![op::NULL, op::RETURN]);
    }

    #[test]
    fn expression_statement_pops() {
        let (heap, function) = compile_ok("1;");
        let chunk = script_chunk(&heap, function);
        assert_eq!(
            chunk.code,
            vec![op::CONSTANT, 0, op::POP, op::NULL, op::RETURN]
        );
        assert_eq!(chunk.constants[0], Value::Number(1.0));
    }

    #[test]
    fn binary_precedence_orders_operands() {
        let (heap, function) = compile_ok("1 + 2 * 3;");
        let chunk = script_chunk(&heap, function);
        assert_eq!(
            chunk.code,
            vec![
                op::CONSTANT,
                0,
                op::CONSTANT,
                1,
                op::CONSTANT,
                2,
                op::MUL,
                op::ADD,
                op::POP,
                op::NULL,
                op::RETURN
            ]
        );
    }

    #[test]
    fn global_definition_and_read() {
        let (heap, function) = compile_ok("var a = 1; a;");
        let chunk = script_chunk(&heap, function);
        assert_eq!(
            chunk.code,
            vec![
                op::CONSTANT,
                1,
                op::DEFINE_GLOBAL,
                0,
                op::GET_GLOBAL,
                2,
                op::POP,
                op::NULL,
                op::RETURN
            ]
        );
    }

    #[test]
    fn global_identifiers_share_interned_constant_objects() {
        let (heap, function) = compile_ok("var a = 1; a; a;");
        // Constants 0 and 2 both name `a`; interning makes them identical
        // object handles even across separate constant slots.
        let chunk = script_chunk(&heap, function);
        assert_eq!(chunk.constants[0], chunk.constants[2]);
    }

    #[test]
    fn locals_compile_to_slots() {
        let (heap, function) = compile_ok("{ var a = 1; a; }");
        let chunk = script_chunk(&heap, function);
        assert_eq!(
            chunk.code,
            vec![
                op::CONSTANT,
                0,
                op::GET_LOCAL,
                1,
                op::POP,
                op::POP,
                op::NULL,
                op::RETURN
            ]
        );
    }

    #[test]
    fn self_initialized_local_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile(&mut heap, "{ var a = a; }").is_none());
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile(&mut heap, "1 + 2 = 3;").is_none());
        let mut heap = Heap::new();
        assert!(compile(&mut heap, "a * b += 1;").is_none());
    }

    #[test]
    fn top_level_return_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile(&mut heap, "return 1;").is_none());
    }

    #[test]
    fn constructor_value_return_is_rejected() {
        let mut heap = Heap::new();
        let source = "class A { constructor() { return 1; } }";
        assert!(compile(&mut heap, source).is_none());
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let mut heap = Heap::new();
        assert!(compile(&mut heap, "break;").is_none());
        let mut heap = Heap::new();
        assert!(compile(&mut heap, "continue;").is_none());
    }

    #[test]
    fn too_many_list_items_is_rejected() {
        let items: Vec<String> = (0..256).map(|i| i.to_string()).collect();
        let source = format!("[{}];", items.join(", "));
        let mut heap = Heap::new();
        assert!(compile(&mut heap, &source).is_none());
    }

    #[test]
    fn too_many_locals_is_rejected() {
        let mut body = String::from("{");
        for i in 0..260 {
            body.push_str(&format!("var v{} = 0;", i));
        }
        body.push('}');
        let mut heap = Heap::new();
        assert!(compile(&mut heap, &body).is_none());
    }

    #[test]
    fn jump_patching_if_else() {
        let (heap, function) = compile_ok("if (true) 1; else 2;");
        let chunk = script_chunk(&heap, function);
        // TRUE, JUMP_IF_FALSE over the then-branch, then-branch, JUMP over
        // else, else-branch.
        assert_eq!(chunk.code[0], op::TRUE);
        assert_eq!(chunk.code[1], op::JUMP_IF_FALSE);
        let then_skip = ((chunk.code[2] as usize) << 8) | chunk.code[3] as usize;
        // Lands just past the unconditional else-skip jump.
        let landing = 4 + then_skip;
        assert_eq!(chunk.code[landing], op::CONSTANT);
    }

    #[test]
    fn lambda_flags_are_set() {
        let (heap, function) = compile_ok("var f = |x| x;");
        let chunk = script_chunk(&heap, function);
        let lambda = chunk
            .constants
            .iter()
            .find_map(|&value| match value {
                Value::Obj(r) => match heap.get(r) {
                    Obj::Function(f) if f.is_lambda => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("lambda constant");
        assert_eq!(lambda.arity, 1);
        assert!(!lambda.varargs);
    }

    #[test]
    fn varargs_function_flag() {
        let (heap, function) = compile_ok("function f(a, b...) { return b; }");
        let chunk = script_chunk(&heap, function);
        let f = chunk
            .constants
            .iter()
            .find_map(|&value| match value {
                Value::Obj(r) => match heap.get(r) {
                    Obj::Function(f) if f.varargs => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("varargs function constant");
        assert_eq!(f.arity, 2);
        assert!(!f.is_lambda);
    }

    #[test]
    fn upvalue_capture_is_recorded() {
        let (heap, function) = compile_ok("function outer() { var a = 1; var f = |exp| a; }");
        let chunk = script_chunk(&heap, function);
        let outer = chunk
            .constants
            .iter()
            .find_map(|&value| match value {
                Value::Obj(r) => match heap.get(r) {
                    Obj::Function(f) if f.name.is_some() => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function");
        let lambda = outer
            .chunk
            .constants
            .iter()
            .find_map(|&value| match value {
                Value::Obj(r) => match heap.get(r) {
                    Obj::Function(f) if f.is_lambda => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("lambda");
        assert_eq!(lambda.upvalue_count, 1);
    }

    #[test]
    fn compound_assignment_reuses_target() {
        let (heap, function) = compile_ok("var a = 1; a += 2;");
        let chunk = script_chunk(&heap, function);
        let code = &chunk.code;
        // get, operand, ADD, set appear in order.
        let get = code
            .iter()
            .position(|&b| b == op::GET_GLOBAL)
            .expect("get");
        let add = code.iter().position(|&b| b == op::ADD).expect("add");
        let set = code
            .iter()
            .position(|&b| b == op::SET_GLOBAL)
            .expect("set");
        assert!(get < add && add < set);
    }

    #[test]
    fn unescape_expands_standard_escapes() {
        assert_eq!(unescape(r"a\nb"), "a\nb");
        assert_eq!(unescape(r"a\tb"), "a\tb");
        assert_eq!(unescape(r#"say \"hi\""#), "say \"hi\"");
        assert_eq!(unescape(r"back\\slash"), "back\\slash");
        assert_eq!(unescape(r"odd\q"), "odd\\q");
    }

    #[test]
    fn switch_expression_compiles() {
        let (_heap, _function) =
            compile_ok("var r = switch (5) { 1, 2 -> \"lo\"; else -> \"hi\"; };");
    }

    #[test]
    fn import_is_an_expression() {
        let mut heap = Heap::new();
        assert!(compile(&mut heap, "var m = import \"m\";").is_some());
    }
}
