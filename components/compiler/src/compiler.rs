//! Single-pass bytecode compiler.
//!
//! Lowers Dictu source straight to bytecode with no AST: a Pratt
//! expression parser drives emission, while a stack of per-function
//! contexts tracks locals, scope depth, upvalue captures, loop fixups,
//! and open `with` blocks. Compilation allocates through the heap
//! (interned names, finished function objects) and roots everything it
//! allocates so a collection can run mid-compile without losing work.

use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};
use bytecode_system::{Chunk, OpCode};
use core_types::{CompileDiagnostic, CompileError, ObjId, Value};
use memory_manager::{Heap, Obj, ObjFunction, Table};

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    /// `=` and compound assignment
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `|`
    BitwiseOr,
    /// `^`
    BitwiseXor,
    /// `&`
    BitwiseAnd,
    /// `+` `-`
    Term,
    /// `*` `/` `%`
    Factor,
    /// `**` (right-associative)
    Indices,
    /// `!` unary `-`
    Unary,
    /// `.` `()` `[]`
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
            Precedence::Comparison => Precedence::BitwiseOr,
            Precedence::BitwiseOr => Precedence::BitwiseXor,
            Precedence::BitwiseXor => Precedence::BitwiseAnd,
            Precedence::BitwiseAnd => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Indices,
            Precedence::Indices => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = for<'h> fn(&mut Compiler<'h>, bool);

// rustc cannot coerce an `impl<'h> Compiler<'h>` inherent method reference
// directly into a `for<'h> fn(&mut Compiler<'h>, bool)` pointer (the impl's
// `'h` is early-bound), so each parse-table entry goes through a free
// function that is explicitly generic over `'h`.
fn grouping_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.grouping(can_assign)
}
fn call_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.call(can_assign)
}
fn dict_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.dict(can_assign)
}
fn list_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.list(can_assign)
}
fn subscript_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.subscript(can_assign)
}
fn dot_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.dot(can_assign)
}
fn unary_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.unary(can_assign)
}
fn binary_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.binary(can_assign)
}
fn prefix_incdec_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.prefix_incdec(can_assign)
}
fn variable_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.variable(can_assign)
}
fn string_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.string(can_assign)
}
fn number_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.number(can_assign)
}
fn static_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.static_(can_assign)
}
fn this_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.this_(can_assign)
}
fn super_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.super_(can_assign)
}
fn and_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.and_(can_assign)
}
fn or_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.or_(can_assign)
}
fn literal_fn<'h>(c: &mut Compiler<'h>, can_assign: bool) {
    c.literal(can_assign)
}

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// The kind of function being compiled; selects slot-zero binding and
/// return behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// The script body
    TopLevel,
    /// A `def` function
    Function,
    /// An instance method (`this` in slot zero)
    Method,
    /// An `init` method: returns `this` implicitly
    Initializer,
    /// A `static` method (no `this`)
    Static,
}

/// A local variable: its name, the scope depth it was defined at (`-1`
/// while declared but uninitialized), and whether a closure captured it.
struct Local {
    name: String,
    depth: i32,
    is_upvalue: bool,
}

/// An upvalue the function being compiled captures: an index that is
/// either a local slot of the enclosing function or an index into the
/// enclosing function's own upvalues.
#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueSpec {
    index: u8,
    is_local: bool,
}

/// Loop bookkeeping for `break`/`continue` and the end-of-loop fixup.
struct LoopCtx {
    /// Back-edge target
    start: usize,
    /// First opcode of the body; `Break` rewriting scans from here
    body: usize,
    /// Forward patch for the exit jump; `None` for unconditional loops
    end: Option<usize>,
    /// Scope depth outside the body; break/continue pop locals above it
    scope_depth: i32,
}

/// An open `with` block: the slot holding the file local and the scope
/// depth of the block, so early exits can emit the close.
struct WithCtx {
    slot: u8,
    depth: i32,
}

/// Per-class compilation state, stacked for nesting.
struct ClassCtx {
    has_superclass: bool,
    static_method: bool,
}

/// Per-function compilation state.
struct FnCompiler {
    kind: FunctionKind,
    name: Option<ObjId>,
    arity: u8,
    arity_optional: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueSpec>,
    loops: Vec<LoopCtx>,
    withs: Vec<WithCtx>,
    /// Deduplicates name constants within this function's pool
    string_constants: Table,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

impl FnCompiler {
    fn new(kind: FunctionKind, name: Option<ObjId>) -> Self {
        // Slot zero holds the receiver in methods; in functions it holds
        // the callee and cannot be referenced.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };

        Self {
            kind,
            name,
            arity: 0,
            arity_optional: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                is_upvalue: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
            withs: Vec::new(),
            string_constants: Table::new(),
        }
    }
}

/// The single-pass compiler: parser state plus the stack of function
/// contexts and class contexts.
pub struct Compiler<'h> {
    heap: &'h mut Heap,
    scanner: Scanner,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<CompileDiagnostic>,
    repl: bool,
    compilers: Vec<FnCompiler>,
    classes: Vec<ClassCtx>,
}

/// Compile `source` to a top-level function object.
///
/// In REPL mode expression statements print their value before being
/// discarded. Every object allocated during compilation is rooted until
/// this function returns, so collections triggered by the allocation
/// budget cannot reclaim in-flight work.
pub fn compile(heap: &mut Heap, source: &str, repl: bool) -> Result<ObjId, CompileError> {
    let root_mark = heap.temp_root_count();

    let mut compiler = Compiler {
        heap,
        scanner: Scanner::new(source),
        current: Token::synthetic(""),
        previous: Token::synthetic(""),
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        repl,
        compilers: vec![FnCompiler::new(FunctionKind::TopLevel, None)],
        classes: Vec::new(),
    };

    compiler.advance();
    if !compiler.match_token(TokenKind::Eof) {
        loop {
            compiler.declaration();
            if compiler.match_token(TokenKind::Eof) {
                break;
            }
        }
    }

    let function = compiler.end_compiler();
    let had_error = compiler.had_error;
    let diagnostics = compiler.diagnostics;

    heap.truncate_temp_roots(root_mark);

    if had_error {
        Err(CompileError { diagnostics })
    } else {
        Ok(function)
    }
}

impl<'h> Compiler<'h> {
    // ---- parser plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::synthetic(""));

        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current(&message);
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

        let rendered = match token.kind {
            TokenKind::Eof => format!("Error at end: {}", message),
            TokenKind::Error => format!("Error: {}", message),
            _ => format!("Error at '{}': {}", token.lexeme, message),
        };

        self.diagnostics.push(CompileDiagnostic {
            line: token.line,
            message: rendered,
        });
        self.had_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }

            match self.current.kind {
                TokenKind::Class
                | TokenKind::Trait
                | TokenKind::Def
                | TokenKind::Static
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Break
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::With => return,
                _ => {}
            }

            self.advance();
        }
    }

    /// Step the scanner back to a character offset, one character at a
    /// time. Only the `{` statement disambiguation uses this.
    fn rewind_to(&mut self, start: usize) {
        while self.scanner.position() > start {
            self.scanner.back_track();
        }
    }

    // ---- context and emission --------------------------------------------

    fn ctx(&self) -> &FnCompiler {
        self.compilers.last().expect("compiler context")
    }

    fn ctx_mut(&mut self) -> &mut FnCompiler {
        self.compilers.last_mut().expect("compiler context")
    }

    fn chunk(&self) -> &Chunk {
        &self.ctx().chunk
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.ctx_mut().chunk
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

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte((offset >> 8) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emit a jump with a placeholder offset; returns the placeholder's
    /// position for [`Compiler::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the jump offset's own bytes.
        let jump = self.chunk().len() - offset - 2;

        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        self.chunk_mut().patch_u16(offset, jump as u16);
    }

    fn emit_return(&mut self) {
        // An initializer automatically returns "this".
        if self.ctx().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }

        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.chunk_mut().add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }

        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    /// Intern a string and root it for the rest of the compilation.
    fn intern(&mut self, s: &str) -> ObjId {
        let id = self.heap.intern(s);
        self.heap.push_temp_root(Value::Obj(id));
        id
    }

    /// Constant-pool index for an identifier, deduplicated through the
    /// per-function string-constants cache.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.intern(name);
        let hash = self.heap.string_hash(id).unwrap_or(0);

        if let Some(Value::Number(index)) = self.ctx().string_constants.get(id, hash) {
            return index as u8;
        }

        let index = self.make_constant(Value::Obj(id));
        self.ctx_mut()
            .string_constants
            .set(id, hash, Value::Number(f64::from(index)));
        index
    }

    // ---- scopes and variables --------------------------------------------

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx_mut().scope_depth -= 1;

        loop {
            let Some(local) = self.ctx().locals.last() else {
                break;
            };
            if local.depth <= self.ctx().scope_depth {
                break;
            }

            if local.is_upvalue {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.ctx_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: String) {
        if self.ctx().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }

        // Declared but not yet defined.
        self.ctx_mut().locals.push(Local {
            name,
            depth: -1,
            is_upvalue: false,
        });
    }

    /// Add an already-defined local for a name the compiler conjures
    /// (`super`, `file`); its slot is the value currently on the stack.
    fn add_synthetic_local(&mut self, name: &str) -> u8 {
        if self.ctx().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return 0;
        }

        let depth = self.ctx().scope_depth;
        self.ctx_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            is_upvalue: false,
        });
        (self.ctx().locals.len() - 1) as u8
    }

    fn declare_variable(&mut self) {
        // Global variables are implicitly declared.
        if self.ctx().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme.clone();
        let mut duplicate = false;
        {
            let ctx = self.ctx();
            for local in ctx.locals.iter().rev() {
                if local.depth != -1 && local.depth < ctx.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Variable with this name already declared in this scope.");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);

        // Globals get a name constant; locals get a slot.
        if self.ctx().scope_depth == 0 {
            let name = self.previous.lexeme.clone();
            return self.identifier_constant(&name);
        }

        self.declare_variable();
        0
    }

    fn define_variable(&mut self, global: u8) {
        if self.ctx().scope_depth == 0 {
            self.emit_op_byte(OpCode::DefineGlobal, global);
        } else {
            // Mark the local as defined now.
            let depth = self.ctx().scope_depth;
            if let Some(local) = self.ctx_mut().locals.last_mut() {
                local.depth = depth;
            }
        }
    }

    /// Find `name` among the locals of the compiler at `level`, innermost
    /// binding first. Reading a local in its own initializer is an error
    /// unless the lookup comes from a nested function (`in_function`).
    fn resolve_local(&mut self, level: usize, name: &str, in_function: bool) -> Option<usize> {
        let mut uninitialized = false;
        let mut found = None;

        for (i, local) in self.compilers[level].locals.iter().enumerate().rev() {
            if local.name == name && !local.name.is_empty() {
                if !in_function && local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(i);
                break;
            }
        }

        if uninitialized {
            self.error("Cannot read local variable in its own initializer.");
        }
        found
    }

    /// Add an upvalue to the compiler at `level`, deduplicating.
    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let spec = UpvalueSpec { index, is_local };

        if let Some(existing) = self.compilers[level]
            .upvalues
            .iter()
            .position(|&u| u == spec)
        {
            return existing as u8;
        }

        if self.compilers[level].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        self.compilers[level].upvalues.push(spec);
        (self.compilers[level].upvalues.len() - 1) as u8
    }

    /// Look `name` up in the functions enclosing the compiler at `level`.
    ///
    /// A hit in the immediately enclosing function captures that local;
    /// a hit further out recurses, adding upvalues to every intermediate
    /// function so the capture chain is materialised at compile time.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(level - 1, name, true) {
            // Mark the local so scope exit closes it instead of popping.
            self.compilers[level - 1].locals[local].is_upvalue = true;
            return Some(self.add_upvalue(level, local as u8, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(level - 1, name) {
            return Some(self.add_upvalue(level, upvalue, false));
        }

        None
    }

    /// Compile a read of `name`, or an assignment / compound assignment
    /// to it when `can_assign` allows.
    fn named_variable(&mut self, name: &Token, can_assign: bool) {
        let level = self.compilers.len() - 1;

        let (get_op, set_op, arg) =
            if let Some(local) = self.resolve_local(level, &name.lexeme, false) {
                (OpCode::GetLocal, OpCode::SetLocal, local as u8)
            } else if let Some(upvalue) = self.resolve_upvalue(level, &name.lexeme) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
            } else {
                let constant = self.identifier_constant(&name.lexeme.clone());
                (OpCode::GetGlobal, OpCode::SetGlobal, constant)
            };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::PlusEquals) {
            self.named_variable(name, false);
            self.expression();
            self.emit_op(OpCode::Add);
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::MinusEquals) {
            self.named_variable(name, false);
            self.expression();
            self.emit_ops(OpCode::Negate, OpCode::Add);
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::MultiplyEquals) {
            self.named_variable(name, false);
            self.expression();
            self.emit_op(OpCode::Multiply);
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::DivideEquals) {
            self.named_variable(name, false);
            self.expression();
            self.emit_op(OpCode::Divide);
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::AmpersandEquals) {
            self.named_variable(name, false);
            self.expression();
            self.emit_op(OpCode::BitwiseAnd);
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::CaretEquals) {
            self.named_variable(name, false);
            self.expression();
            self.emit_op(OpCode::BitwiseXor);
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::PipeEquals) {
            self.named_variable(name, false);
            self.expression();
            self.emit_op(OpCode::BitwiseOr);
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ---- expression parsing ----------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix_rule) = rule_for(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while precedence <= rule_for(self.current.kind).precedence {
            self.advance();
            if let Some(infix_rule) = rule_for(self.previous.kind).infix {
                infix_rule(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            // The LHS wasn't a valid assignment target.
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                arg_count += 1;

                if arg_count > 255 {
                    self.error("Cannot have more than 255 arguments.");
                }

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => {}
        }
    }

    fn string(&mut self, _can_assign: bool) {
        // Strip the quotes, then decode escapes before interning.
        let raw = &self.previous.lexeme[1..self.previous.lexeme.len() - 1];
        let decoded = decode_escapes(raw);
        let id = self.intern(&decoded);
        self.emit_constant(Value::Obj(id));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.clone();
        self.named_variable(&name, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = rule_for(operator);

        // `**` is right-associative: parse the right operand at the same
        // precedence instead of one above.
        let next = if operator == TokenKind::StarStar {
            rule.precedence
        } else {
            rule.precedence.next()
        };
        self.parse_precedence(next);

        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_ops(OpCode::Negate, OpCode::Add),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::StarStar => self.emit_op(OpCode::Pow),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Mod),
            TokenKind::Ampersand => self.emit_op(OpCode::BitwiseAnd),
            TokenKind::Caret => self.emit_op(OpCode::BitwiseXor),
            TokenKind::Pipe => self.emit_op(OpCode::BitwiseOr),
            _ => {}
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        // Short circuit when the left operand is false.
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        // When the left operand is false, jump over the short-circuit
        // exit and evaluate the right operand instead.
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(&self.previous.lexeme.clone());

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, arg_count);
            self.emit_byte(name);
        } else if can_assign && self.match_token(TokenKind::PlusEquals) {
            self.compound_property(name, OpCode::Add, false);
        } else if can_assign && self.match_token(TokenKind::MinusEquals) {
            self.compound_property(name, OpCode::Add, true);
        } else if can_assign && self.match_token(TokenKind::MultiplyEquals) {
            self.compound_property(name, OpCode::Multiply, false);
        } else if can_assign && self.match_token(TokenKind::DivideEquals) {
            self.compound_property(name, OpCode::Divide, false);
        } else if can_assign && self.match_token(TokenKind::AmpersandEquals) {
            self.compound_property(name, OpCode::BitwiseAnd, false);
        } else if can_assign && self.match_token(TokenKind::CaretEquals) {
            self.compound_property(name, OpCode::BitwiseXor, false);
        } else if can_assign && self.match_token(TokenKind::PipeEquals) {
            self.compound_property(name, OpCode::BitwiseOr, false);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    /// `obj.field op= rhs`: read the field keeping the instance, evaluate
    /// the right side, combine, store back. Subtraction negates then adds.
    fn compound_property(&mut self, name: u8, op: OpCode, negate: bool) {
        self.emit_op_byte(OpCode::GetPropertyNoPop, name);
        self.expression();
        if negate {
            self.emit_op(OpCode::Negate);
        }
        self.emit_op(op);
        self.emit_op_byte(OpCode::SetProperty, name);
    }

    fn list(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::NewList);

        loop {
            if self.check(TokenKind::RightBracket) {
                break;
            }

            self.expression();
            self.emit_op(OpCode::AddList);

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.consume(TokenKind::RightBracket, "Expected closing ']'");
    }

    fn dict(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::NewDict);

        loop {
            if self.check(TokenKind::RightBrace) {
                break;
            }

            self.expression();
            self.consume(TokenKind::Colon, "Expected ':'");
            self.expression();
            self.emit_op(OpCode::AddDict);

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.consume(TokenKind::RightBrace, "Expected closing '}'");
    }

    fn subscript(&mut self, can_assign: bool) {
        // Slice with no initial index: a[:hi]
        if self.match_token(TokenKind::Colon) {
            self.emit_op(OpCode::Empty);
            self.expression();
            self.emit_op(OpCode::Slice);
            self.consume(TokenKind::RightBracket, "Expected closing ']'");
            return;
        }

        self.expression();

        if self.match_token(TokenKind::Colon) {
            // No upper bound means slice to the end: a[lo:]
            if self.check(TokenKind::RightBracket) {
                self.emit_op(OpCode::Empty);
            } else {
                self.expression();
            }
            self.emit_op(OpCode::Slice);
            self.consume(TokenKind::RightBracket, "Expected closing ']'");
            return;
        }

        self.consume(TokenKind::RightBracket, "Expected closing ']'");

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SubscriptAssign);
        } else if can_assign && self.match_token(TokenKind::PlusEquals) {
            self.compound_subscript(OpCode::Add, false);
        } else if can_assign && self.match_token(TokenKind::MinusEquals) {
            self.compound_subscript(OpCode::Add, true);
        } else if can_assign && self.match_token(TokenKind::MultiplyEquals) {
            self.compound_subscript(OpCode::Multiply, false);
        } else if can_assign && self.match_token(TokenKind::DivideEquals) {
            self.compound_subscript(OpCode::Divide, false);
        } else if can_assign && self.match_token(TokenKind::AmpersandEquals) {
            self.compound_subscript(OpCode::BitwiseAnd, false);
        } else if can_assign && self.match_token(TokenKind::CaretEquals) {
            self.compound_subscript(OpCode::BitwiseXor, false);
        } else if can_assign && self.match_token(TokenKind::PipeEquals) {
            self.compound_subscript(OpCode::BitwiseOr, false);
        } else {
            self.emit_op(OpCode::Subscript);
        }
    }

    /// `a[i] op= rhs`: with target and index still on the stack, evaluate
    /// the right side, read the current element beneath it, combine,
    /// store back.
    fn compound_subscript(&mut self, op: OpCode, negate: bool) {
        self.expression();
        self.emit_op(OpCode::SubscriptPush);
        if negate {
            self.emit_op(OpCode::Negate);
        }
        self.emit_op(op);
        self.emit_op(OpCode::SubscriptAssign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Cannot utilise 'this' outside of a class.");
        } else if self.classes.last().is_some_and(|c| c.static_method) {
            self.error("Cannot utilise 'this' inside a static method.");
        } else {
            self.variable(false);
        }
    }

    fn static_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Cannot utilise 'static' outside of a class.");
        }
    }

    fn push_superclass(&mut self) {
        if self.classes.is_empty() {
            return;
        }
        self.named_variable(&Token::synthetic("super"), false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Cannot utilise 'super' outside of a class.");
        } else if !self.classes.last().is_some_and(|c| c.has_superclass) {
            self.error("Cannot utilise 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(&self.previous.lexeme.clone());

        // Push the receiver.
        self.named_variable(&Token::synthetic("this"), false);

        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();

            self.push_superclass();
            self.emit_op_byte(OpCode::SuperInvoke, arg_count);
            self.emit_byte(name);
        } else {
            self.push_superclass();
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    /// Prefix `++`/`--`: read the target (an identifier or a single
    /// `.field` path), bump it, store it back.
    fn prefix_incdec(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.consume(TokenKind::Identifier, "Expected variable");
        let name = self.previous.clone();
        self.named_variable(&name, false);

        let mut property = None;
        if self.match_token(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "Expect property name after '.'.");
            let arg = self.identifier_constant(&self.previous.lexeme.clone());
            self.emit_op_byte(OpCode::GetPropertyNoPop, arg);
            property = Some(arg);
        }

        match operator {
            TokenKind::PlusPlus => self.emit_op(OpCode::Increment),
            TokenKind::MinusMinus => self.emit_op(OpCode::Decrement),
            _ => return,
        }

        if let Some(arg) = property {
            self.emit_op_byte(OpCode::SetProperty, arg);
        } else {
            let level = self.compilers.len() - 1;
            if let Some(local) = self.resolve_local(level, &name.lexeme, false) {
                self.emit_op_byte(OpCode::SetLocal, local as u8);
            } else if let Some(upvalue) = self.resolve_upvalue(level, &name.lexeme) {
                self.emit_op_byte(OpCode::SetUpvalue, upvalue);
            } else {
                let arg = self.identifier_constant(&name.lexeme.clone());
                self.emit_op_byte(OpCode::SetGlobal, arg);
            }
        }
    }

    // ---- functions and classes -------------------------------------------

    fn push_compiler(&mut self, kind: FunctionKind) {
        let name = if kind == FunctionKind::TopLevel {
            None
        } else {
            let lexeme = self.previous.lexeme.clone();
            Some(self.intern(&lexeme))
        };
        self.compilers.push(FnCompiler::new(kind, name));
    }

    /// Finish the innermost function: emit its implicit return, allocate
    /// the function object, and (for nested functions) emit the closure
    /// construction in the enclosing chunk.
    fn end_compiler(&mut self) -> ObjId {
        self.emit_return();

        let ctx = self.compilers.pop().expect("compiler context");
        let upvalues = ctx.upvalues;

        let function = self.heap.alloc(Obj::Function(ObjFunction {
            name: ctx.name,
            arity: ctx.arity,
            arity_optional: ctx.arity_optional,
            upvalue_count: upvalues.len(),
            chunk: ctx.chunk,
        }));
        self.heap.push_temp_root(Value::Obj(function));

        if !self.compilers.is_empty() {
            // Capture the upvalues in the new closure object.
            let constant = self.make_constant(Value::Obj(function));
            self.emit_op_byte(OpCode::Closure, constant);
            self.emit_byte(upvalues.len() as u8);

            for upvalue in &upvalues {
                self.emit_byte(u8::from(upvalue.is_local));
                self.emit_byte(upvalue.index);
            }
        }

        function
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");

        if !self.check(TokenKind::RightParen) {
            let mut optional = false;
            loop {
                let param_constant = self.parse_variable("Expect parameter name.");
                self.define_variable(param_constant);

                if self.match_token(TokenKind::Equal) {
                    self.ctx_mut().arity_optional += 1;
                    optional = true;
                    self.expression();
                } else {
                    self.ctx_mut().arity += 1;

                    if optional {
                        self.error("Cannot have non-optional parameter after optional.");
                    }
                }

                if u32::from(self.ctx().arity) + u32::from(self.ctx().arity_optional) > 255 {
                    self.error("Cannot have more than 255 parameters.");
                }

                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }

            if self.ctx().arity_optional > 0 {
                self.emit_op(OpCode::DefineOptional);
            }
        }

        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // end_compiler unwinds the scope for us.
        self.end_compiler();
    }

    fn method(&mut self, is_trait: bool) {
        // Methods may be introduced with `def`; `static` marks class
        // statics.
        self.match_token(TokenKind::Def);

        let mut kind = FunctionKind::Method;

        if self.check(TokenKind::Static) {
            self.consume(TokenKind::Static, "Expect static.");
            self.match_token(TokenKind::Def);
            kind = FunctionKind::Static;
            if let Some(class) = self.classes.last_mut() {
                class.static_method = true;
            }
        } else if let Some(class) = self.classes.last_mut() {
            class.static_method = false;
        }

        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(&self.previous.lexeme.clone());

        // A method named "init" is the initializer.
        if self.previous.lexeme == "init" {
            kind = FunctionKind::Initializer;
        }

        self.function(kind);

        if is_trait {
            self.emit_op_byte(OpCode::TraitMethod, constant);
        } else {
            self.emit_op_byte(OpCode::Method, constant);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous.clone();
        let name_constant = self.identifier_constant(&name_token.lexeme.clone());
        self.declare_variable();

        self.classes.push(ClassCtx {
            has_superclass: false,
            static_method: false,
        });

        let has_superclass = self.match_token(TokenKind::Less);
        if has_superclass {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }

            // Create and bind the class first, then attach the superclass
            // inside a scope holding the "super" local so methods can
            // capture it.
            self.emit_op_byte(OpCode::Class, name_constant);
            self.define_variable(name_constant);

            self.begin_scope();
            self.variable(false);
            self.add_synthetic_local("super");
            self.named_variable(&name_token, false);
            self.emit_op(OpCode::Subclass);
        } else {
            self.emit_op_byte(OpCode::Class, name_constant);
        }

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Use) {
                self.use_statement();
            } else {
                self.method(false);
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");

        if has_superclass {
            self.emit_op(OpCode::Pop);
            self.end_scope();
        } else {
            self.define_variable(name_constant);
        }

        self.classes.pop();
    }

    fn trait_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect trait name.");
        let name_constant = self.identifier_constant(&self.previous.lexeme.clone());
        self.declare_variable();

        self.classes.push(ClassCtx {
            has_superclass: false,
            static_method: false,
        });

        self.emit_op_byte(OpCode::Trait, name_constant);

        self.consume(TokenKind::LeftBrace, "Expect '{' before trait body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(true);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after trait body.");

        self.define_variable(name_constant);

        self.classes.pop();
    }

    fn use_statement(&mut self) {
        if self.classes.is_empty() {
            self.error("Cannot utilise 'use' outside of a class.");
        }

        loop {
            self.consume(TokenKind::Identifier, "Expect trait name after use statement.");
            let name = self.previous.clone();
            self.named_variable(&name, false);
            self.emit_op(OpCode::UseTrait);

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after use statement.");
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        loop {
            let global = self.parse_variable("Expect variable name.");

            if self.match_token(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }

            self.define_variable(global);

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
    }

    // ---- statements ------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Trait) {
            self.trait_declaration();
        } else if self.match_token(TokenKind::Def) {
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
        if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::With) {
            self.with_statement();
        } else if self.match_token(TokenKind::Import) {
            self.import_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.brace_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else {
            self.expression_statement();
        }
    }

    /// `{` at statement position is ambiguous: `{};` is an empty dict
    /// expression statement, `{ key :` opens a dict literal, anything
    /// else is a block. The scanner is speculatively advanced one token,
    /// inspected, and rewound character by character.
    fn brace_statement(&mut self) {
        let brace = self.previous.clone();
        let first = self.current.clone();

        self.advance();

        if self.previous.kind == TokenKind::RightBrace && self.check(TokenKind::Semicolon) {
            // `{}` followed by `;`: re-parse from the `{` as an
            // expression statement holding an empty dict.
            let start = self.previous.start;
            self.rewind_to(start);
            self.current = brace;
            self.expression_statement();
            return;
        }

        if self.check(TokenKind::Colon) {
            // `{ key :` opens a dict literal; rewind past the key.
            self.rewind_to(first.start);
            self.current = brace;
            self.expression_statement();
            return;
        }

        // A block: restore the parser to just after the `{`.
        let resume = self.current.start;
        self.rewind_to(resume);
        self.previous = brace;
        self.current = first;

        self.begin_scope();
        self.block();
        self.end_scope();
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        if self.repl {
            self.emit_op(OpCode::PopRepl);
        } else {
            self.emit_op(OpCode::Pop);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // Jump to the else branch when the condition is false.
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.statement();

        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }

        self.patch_jump(end_jump);
    }

    fn while_statement(&mut self) {
        let start = self.chunk().len();
        let scope_depth = self.ctx().scope_depth;

        // `while {` is an unconditioned loop.
        if self.check(TokenKind::LeftBrace) {
            self.emit_op(OpCode::True);
        } else {
            self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
            self.expression();
            self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        }

        let end = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        let body = self.chunk().len();
        self.ctx_mut().loops.push(LoopCtx {
            start,
            body,
            end: Some(end),
            scope_depth,
        });

        self.statement();

        self.emit_loop(start);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        // Scope for the loop variable.
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else {
            self.expression_statement();
        }

        let mut start = self.chunk().len();
        let scope_depth = self.ctx().scope_depth;

        // The exit condition.
        let mut end = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            end = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        // Increment step runs after the body, so jump over it here.
        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);

            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(start);
            start = increment_start;

            self.patch_jump(body_jump);
        }

        let body = self.chunk().len();
        self.ctx_mut().loops.push(LoopCtx {
            start,
            body,
            end,
            scope_depth,
        });

        self.statement();

        // Back to the condition (or the increment).
        self.emit_loop(start);

        self.end_loop();
        self.end_scope();
    }

    /// Finish the innermost loop: patch the exit jump and rewrite every
    /// `Break` placeholder in the body to a real jump past the loop.
    fn end_loop(&mut self) {
        let Some(loop_ctx) = self.ctx_mut().loops.pop() else {
            return;
        };

        if let Some(end) = loop_ctx.end {
            self.patch_jump(end);
            self.emit_op(OpCode::Pop);
        }

        let mut i = loop_ctx.body;
        while i < self.chunk().len() {
            if self.chunk().code[i] == OpCode::Break as u8 {
                self.chunk_mut().code[i] = OpCode::Jump as u8;
                self.patch_jump(i + 1);
                i += 3;
            } else {
                let code = &self.chunk().code;
                let len = OpCode::from_byte(code[i]).map_or(0, |op| op.operand_len(code, i));
                i += 1 + len;
            }
        }
    }

    /// Emit the scope-unwind code shared by `break` and `continue`: close
    /// files for `with` blocks inside the loop and discard locals
    /// belonging to the body.
    fn unwind_loop_scope(&mut self) {
        let Some(loop_ctx) = self.ctx().loops.last() else {
            return;
        };
        let loop_depth = loop_ctx.scope_depth;

        let close_slots: Vec<u8> = self
            .ctx()
            .withs
            .iter()
            .rev()
            .filter(|w| w.depth > loop_depth)
            .map(|w| w.slot)
            .collect();
        for slot in close_slots {
            self.emit_op_byte(OpCode::CloseFile, slot);
        }

        let mut pops: Vec<bool> = Vec::new();
        for local in self.ctx().locals.iter().rev() {
            if local.depth <= loop_depth {
                break;
            }
            pops.push(local.is_upvalue);
        }
        for is_upvalue in pops {
            if is_upvalue {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        if self.ctx().loops.is_empty() {
            self.error("Cannot utilise 'break' outside of a loop.");
            return;
        }

        self.consume(TokenKind::Semicolon, "Expected semicolon after break");

        self.unwind_loop_scope();
        self.emit_jump(OpCode::Break);
    }

    fn continue_statement(&mut self) {
        if self.ctx().loops.is_empty() {
            self.error("Cannot utilise 'continue' outside of a loop.");
            return;
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");

        self.unwind_loop_scope();

        // Jump to the top of the innermost loop.
        let start = self
            .ctx()
            .loops
            .last()
            .map(|l| l.start)
            .unwrap_or_default();
        self.emit_loop(start);
    }

    fn return_statement(&mut self) {
        if self.ctx().kind == FunctionKind::TopLevel {
            self.error("Cannot return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.close_enclosing_files();
            self.emit_return();
        } else {
            if self.ctx().kind == FunctionKind::Initializer {
                self.error("Cannot return a value from an initializer.");
            }

            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            // The return value is computed before the files close, so the
            // expression may still read from them.
            self.close_enclosing_files();
            self.emit_op(OpCode::Return);
        }
    }

    /// Returning through `with` blocks closes their files, innermost
    /// first.
    fn close_enclosing_files(&mut self) {
        let close_slots: Vec<u8> = self.ctx().withs.iter().rev().map(|w| w.slot).collect();
        for slot in close_slots {
            self.emit_op_byte(OpCode::CloseFile, slot);
        }
    }

    fn with_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'with'.");
        self.expression();
        self.consume(TokenKind::Comma, "Expect comma");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after 'with'.");

        self.begin_scope();

        // The opened file becomes a local named "file".
        let slot = self.add_synthetic_local("file");
        self.emit_op(OpCode::OpenFile);

        let depth = self.ctx().scope_depth;
        self.ctx_mut().withs.push(WithCtx { slot, depth });

        self.statement();

        self.emit_op_byte(OpCode::CloseFile, slot);
        self.ctx_mut().withs.pop();
        self.end_scope();
    }

    fn import_statement(&mut self) {
        self.consume(TokenKind::String, "Expect string after import.");
        // The raw path, quotes stripped; no escape decoding.
        let path = self.previous.lexeme[1..self.previous.lexeme.len() - 1].to_string();
        let id = self.intern(&path);
        self.emit_constant(Value::Obj(id));
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");

        self.emit_op(OpCode::Import);
        self.emit_op(OpCode::Pop);
    }
}

/// Decode the escape sequences the language recognises; anything else
/// passes through with its backslash intact.
fn decode_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('n') => {
                out.push('\n');
                chars.next();
            }
            Some('t') => {
                out.push('\t');
                chars.next();
            }
            Some('r') => {
                out.push('\r');
                chars.next();
            }
            Some('v') => {
                out.push('\x0b');
                chars.next();
            }
            Some('\'') => {
                out.push('\'');
                chars.next();
            }
            Some('"') => {
                out.push('"');
                chars.next();
            }
            _ => out.push('\\'),
        }
    }

    out
}

fn rule_for(kind: TokenKind) -> ParseRule {
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        TokenKind::LeftParen => (
            Some(grouping_fn),
            Some(call_fn),
            Precedence::Call,
        ),
        TokenKind::LeftBrace => (Some(dict_fn), None, Precedence::None),
        TokenKind::LeftBracket => (
            Some(list_fn),
            Some(subscript_fn),
            Precedence::Call,
        ),
        TokenKind::Dot => (None, Some(dot_fn), Precedence::Call),
        TokenKind::Minus => (
            Some(unary_fn),
            Some(binary_fn),
            Precedence::Term,
        ),
        TokenKind::Plus => (None, Some(binary_fn), Precedence::Term),
        TokenKind::PlusPlus | TokenKind::MinusMinus => {
            (Some(prefix_incdec_fn), None, Precedence::None)
        }
        TokenKind::Slash | TokenKind::Star | TokenKind::Percent => {
            (None, Some(binary_fn), Precedence::Factor)
        }
        TokenKind::StarStar => (None, Some(binary_fn), Precedence::Indices),
        TokenKind::Ampersand => (None, Some(binary_fn), Precedence::BitwiseAnd),
        TokenKind::Caret => (None, Some(binary_fn), Precedence::BitwiseXor),
        TokenKind::Pipe => (None, Some(binary_fn), Precedence::BitwiseOr),
        TokenKind::Bang => (Some(unary_fn), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            (None, Some(binary_fn), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => (None, Some(binary_fn), Precedence::Comparison),
        TokenKind::Identifier => (Some(variable_fn), None, Precedence::None),
        TokenKind::String => (Some(string_fn), None, Precedence::None),
        TokenKind::Number => (Some(number_fn), None, Precedence::None),
        TokenKind::Static => (Some(static_fn), None, Precedence::None),
        TokenKind::This => (Some(this_fn), None, Precedence::None),
        TokenKind::Super => (Some(super_fn), None, Precedence::None),
        TokenKind::And => (None, Some(and_fn), Precedence::And),
        TokenKind::Or => (None, Some(or_fn), Precedence::Or),
        TokenKind::True | TokenKind::False | TokenKind::Nil => {
            (Some(literal_fn), None, Precedence::None)
        }
        _ => (None, None, Precedence::None),
    };

    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> Result<(Heap, ObjId), CompileError> {
        let mut heap = Heap::new();
        let function = compile(&mut heap, source, false)?;
        Ok((heap, function))
    }

    fn chunk_of(heap: &Heap, function: ObjId) -> &Chunk {
        match heap.get(function) {
            Some(Obj::Function(f)) => &f.chunk,
            _ => panic!("expected function"),
        }
    }

    fn ops_of(chunk: &Chunk) -> Vec<OpCode> {
        let mut ops = Vec::new();
        let mut i = 0;
        while i < chunk.len() {
            let op = OpCode::from_byte(chunk.code[i]).expect("valid opcode");
            ops.push(op);
            i += 1 + op.operand_len(&chunk.code, i);
        }
        ops
    }

    #[test]
    fn test_expression_statement() {
        let (heap, function) = compile_source("1 + 2;").expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert_eq!(
            ops,
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Add,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn test_subtraction_is_negate_then_add() {
        let (heap, function) = compile_source("1 - 2;").expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.windows(2).any(|w| w == [OpCode::Negate, OpCode::Add]));
    }

    #[test]
    fn test_repl_emits_pop_repl() {
        let mut heap = Heap::new();
        let function = compile(&mut heap, "1;", true).expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.contains(&OpCode::PopRepl));
        assert!(!ops.contains(&OpCode::Pop));
    }

    #[test]
    fn test_closure_upvalue_capture() {
        let source = "def make(x) { def inner() { return x; } return inner; }";
        let (heap, function) = compile_source(source).expect("compiles");

        // make's chunk holds inner as a constant with one captured local.
        let top = chunk_of(&heap, function);
        let make = top
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(id) => match heap.get(*id) {
                    Some(Obj::Function(f)) if f.arity == 1 => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("make function constant");

        let inner = make
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(id) => match heap.get(*id) {
                    Some(Obj::Function(f)) if f.arity == 0 => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");

        assert_eq!(inner.upvalue_count, 1);
        assert!(ops_of(&make.chunk).contains(&OpCode::Closure));
    }

    #[test]
    fn test_flattened_capture_through_two_levels() {
        let source =
            "def a(x) { def b() { def c() { return x; } return c; } return b; }";
        let (_heap, _function) = compile_source(source).expect("compiles");
    }

    #[test]
    fn test_break_rewritten_to_jump() {
        let source = "while (true) { break; }";
        let (heap, function) = compile_source(source).expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(!ops.contains(&OpCode::Break));
        assert!(ops.contains(&OpCode::Jump));
    }

    #[test]
    fn test_break_outside_loop_errors() {
        assert!(compile_source("break;").is_err());
    }

    #[test]
    fn test_continue_outside_loop_errors() {
        assert!(compile_source("continue;").is_err());
    }

    #[test]
    fn test_class_with_superclass() {
        let source = "class A { def f() { return 1; } } class B < A { }";
        let (heap, function) = compile_source(source).expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.contains(&OpCode::Class));
        assert!(ops.contains(&OpCode::Subclass));
        assert!(ops.contains(&OpCode::Method));
    }

    #[test]
    fn test_trait_declaration() {
        let source = "trait T { def greet() { return 1; } } class C { use T; }";
        let (heap, function) = compile_source(source).expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.contains(&OpCode::Trait));
        assert!(ops.contains(&OpCode::UseTrait));
    }

    #[test]
    fn test_use_outside_class_is_parse_error() {
        assert!(compile_source("use T;").is_err());
    }

    #[test]
    fn test_return_at_top_level_errors() {
        assert!(compile_source("return 1;").is_err());
    }

    #[test]
    fn test_init_returning_value_errors() {
        assert!(compile_source("class A { def init() { return 1; } }").is_err());
    }

    #[test]
    fn test_duplicate_local_errors() {
        assert!(compile_source("{ var a = 1; var a = 2; }").is_err());
    }

    #[test]
    fn test_local_in_own_initializer_errors() {
        assert!(compile_source("{ var a = a; }").is_err());
    }

    #[test]
    fn test_optional_parameters() {
        let source = "def f(a, b = 2) { return a; }";
        let (heap, function) = compile_source(source).expect("compiles");
        let f = chunk_of(&heap, function)
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(id) => match heap.get(*id) {
                    Some(Obj::Function(f)) if f.name.is_some() => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("function constant");
        assert_eq!(f.arity, 1);
        assert_eq!(f.arity_optional, 1);
        assert!(ops_of(&f.chunk).contains(&OpCode::DefineOptional));
    }

    #[test]
    fn test_required_after_optional_errors() {
        assert!(compile_source("def f(a = 1, b) { return b; }").is_err());
    }

    #[test]
    fn test_string_escapes_decoded() {
        let (heap, function) = compile_source("\"a\\nb\";").expect("compiles");
        let chunk = chunk_of(&heap, function);
        let text = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(id) => heap.string(*id),
                _ => None,
            })
            .expect("string constant");
        assert_eq!(text, "a\nb");
    }

    #[test]
    fn test_unknown_escape_passes_through() {
        let (heap, function) = compile_source("\"a\\qb\";").expect("compiles");
        let chunk = chunk_of(&heap, function);
        let text = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(id) => heap.string(*id),
                _ => None,
            })
            .expect("string constant");
        assert_eq!(text, "a\\qb");
    }

    #[test]
    fn test_brace_disambiguation() {
        // Empty dict expression statement.
        assert!(compile_source("{};").is_ok());
        // Dict literal statement.
        assert!(compile_source("{\"a\": 1};").is_ok());
        // Block.
        assert!(compile_source("{ var x = 1; }").is_ok());
        // Empty block.
        assert!(compile_source("{ }").is_ok());
    }

    #[test]
    fn test_dict_literal_subscript() {
        assert!(compile_source("var x = {\"a\": 1}[\"a\"];").is_ok());
    }

    #[test]
    fn test_with_statement_closes_file() {
        let source = "with(\"file.txt\", \"r\") { var a = 1; }";
        let (heap, function) = compile_source(source).expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.contains(&OpCode::OpenFile));
        assert!(ops.contains(&OpCode::CloseFile));
    }

    #[test]
    fn test_with_return_closes_file() {
        let source = "def f() { with(\"file.txt\", \"r\") { return 1; } }";
        let (heap, function) = compile_source(source).expect("compiles");
        let f = chunk_of(&heap, function)
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(id) => match heap.get(*id) {
                    Some(Obj::Function(f)) => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("function constant");
        // One close for the return path, one for normal completion.
        let closes = ops_of(&f.chunk)
            .iter()
            .filter(|&&op| op == OpCode::CloseFile)
            .count();
        assert_eq!(closes, 2);
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(compile_source("1 + 2 = 3;").is_err());
    }

    #[test]
    fn test_compound_assignment_forms() {
        for op in ["+=", "-=", "*=", "/=", "&=", "^=", "|="] {
            let source = format!("var x = 1; x {} 2;", op);
            assert!(compile_source(&source).is_ok(), "operator {}", op);
        }
    }

    #[test]
    fn test_prefix_increment() {
        let (heap, function) = compile_source("var x = 1; ++x;").expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.contains(&OpCode::Increment));
    }

    #[test]
    fn test_slice_emits_empty_sentinels() {
        let (heap, function) = compile_source("[1, 2, 3][1:];").expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.contains(&OpCode::Empty));
        assert!(ops.contains(&OpCode::Slice));
    }

    #[test]
    fn test_too_many_constants_reports_error() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{} = {}.5;", i, i));
        }
        assert!(compile_source(&source).is_err());
    }

    #[test]
    fn test_multiple_errors_reported() {
        let err = compile_source("var 1 = 2; var 2 = 3;").unwrap_err();
        assert!(err.diagnostics.len() >= 2);
    }

    #[test]
    fn test_import_statement() {
        let (heap, function) = compile_source("import \"Math\";").expect("compiles");
        let ops = ops_of(chunk_of(&heap, function));
        assert!(ops.contains(&OpCode::Import));
    }
}
