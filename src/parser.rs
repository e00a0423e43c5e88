/// Recursive-descent parser.
///
/// Statement-oriented, with precedence-climbing expressions over the
/// operator table below. There is no AST: each grammar production drives
/// the code generator directly. Syntax errors are accumulated and the
/// parser keeps scanning to surface more diagnostics, but nothing is
/// emitted once an error has been recorded.
///
/// Grammar sketch:
///
///   program:    { statement }
///   statement:  functionStatement | classStatement | compoundStatement
///             | selectionStatement | switchStatement | iterationStatement
///             | jumpStatement | varStatement | expressionStatement
///   for:        'for' '(' [ 'var' ] decl-or-expr ( ';' cond ';' step
///             | ':' iterable ) ')' statement
///   switch:     'switch' '(' expr ')' '{' { caseClause } '}'
///             (case bodies collect in a deferred block, spliced after
///              the dispatch tests so fall-through works)

use crate::atom::{Atom, SharedAtom};
use crate::bytecode::Op;
use crate::codegen::{Codegen, DerefType, IdType, Label, RegOrConst, StackType};
use crate::error::ParseErrorList;
use crate::gc::ObjId;
use crate::lexer::{Scanner, Token};
use crate::program::Program;
use crate::runtime::Environment;
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
}

struct OperatorInfo {
    token: Token,
    prec: u8,
    assoc: Assoc,
    sto: bool,
    op: Op,
}

const fn opinfo(token: Token, prec: u8, assoc: Assoc, sto: bool, op: Op) -> OperatorInfo {
    OperatorInfo {
        token,
        prec,
        assoc,
        sto,
        op,
    }
}

// Precedences 1..=15; assignment forms are right-associative and the
// `sto` forms dup the target before the operation.
static OP_INFOS: [OperatorInfo; 31] = [
    opinfo(Token::Sto, 1, Assoc::Right, false, Op::Move),
    opinfo(Token::AddSto, 1, Assoc::Right, true, Op::Add),
    opinfo(Token::SubSto, 1, Assoc::Right, true, Op::Sub),
    opinfo(Token::MulSto, 1, Assoc::Right, true, Op::Mul),
    opinfo(Token::DivSto, 1, Assoc::Right, true, Op::Div),
    opinfo(Token::ModSto, 1, Assoc::Right, true, Op::Mod),
    opinfo(Token::ShlSto, 1, Assoc::Right, true, Op::Shl),
    opinfo(Token::ShrSto, 1, Assoc::Right, true, Op::Shr),
    opinfo(Token::SarSto, 1, Assoc::Right, true, Op::Sar),
    opinfo(Token::AndSto, 1, Assoc::Right, true, Op::And),
    opinfo(Token::OrSto, 1, Assoc::Right, true, Op::Or),
    opinfo(Token::XorSto, 1, Assoc::Right, true, Op::Xor),
    opinfo(Token::Lor, 6, Assoc::Left, false, Op::Lor),
    opinfo(Token::Land, 7, Assoc::Left, false, Op::Land),
    opinfo(Token::Or, 8, Assoc::Left, false, Op::Or),
    opinfo(Token::Xor, 9, Assoc::Left, false, Op::Xor),
    opinfo(Token::Ampersand, 10, Assoc::Left, false, Op::And),
    opinfo(Token::Eq, 11, Assoc::Left, false, Op::Eq),
    opinfo(Token::Ne, 11, Assoc::Left, false, Op::Ne),
    opinfo(Token::Lt, 12, Assoc::Left, false, Op::Lt),
    opinfo(Token::Gt, 12, Assoc::Left, false, Op::Gt),
    opinfo(Token::Ge, 12, Assoc::Left, false, Op::Ge),
    opinfo(Token::Le, 12, Assoc::Left, false, Op::Le),
    opinfo(Token::Shl, 13, Assoc::Left, false, Op::Shl),
    opinfo(Token::Shr, 13, Assoc::Left, false, Op::Shr),
    opinfo(Token::Sar, 13, Assoc::Left, false, Op::Sar),
    opinfo(Token::Plus, 14, Assoc::Left, false, Op::Add),
    opinfo(Token::Minus, 14, Assoc::Left, false, Op::Sub),
    opinfo(Token::Star, 15, Assoc::Left, false, Op::Mul),
    opinfo(Token::Slash, 15, Assoc::Left, false, Op::Div),
    opinfo(Token::Percent, 15, Assoc::Left, false, Op::Mod),
];

struct CaseEntry {
    to_statement: Label,
    from_statement: Option<Label>,
    statement_addr: i32,
}

pub struct Parser<'e, 'p, 's> {
    scanner: Scanner<'s>,
    gen: Codegen<'e, 'p>,
    break_stack: Vec<Vec<Label>>,
    continue_stack: Vec<Vec<Label>>,
    hidden_counter: u32,
}

impl<'e, 'p, 's> Parser<'e, 'p, 's> {
    /// Compile `source` into the program's top-level function. On any
    /// syntax error the accumulated list is returned instead.
    pub fn parse(
        source: &'s str,
        env: &'e mut Environment,
        program: &'p mut Program,
    ) -> Result<ObjId, ParseErrorList> {
        // Protect the program object while unreachable from any VM
        let main = program.main;
        env.heap.add_static_root(main);

        let mut parser = Parser {
            scanner: Scanner::new(source),
            gen: Codegen::new(env, program),
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            hidden_counter: 0,
        };
        parser.program();
        let result = parser.gen.function_end();
        let errors = parser.gen.errors;
        let env = parser.gen.env;
        env.heap.remove_static_root(main);
        match result {
            Some(obj) if errors.is_empty() => Ok(obj),
            _ => Err(errors),
        }
    }

    // ── Token plumbing ──────────────────────────────────────────────────

    fn peek(&mut self) -> Token {
        self.gen.lineno = self.scanner.lineno();
        let t = self.scanner.get_token().clone();
        self.gen.lineno = self.scanner.lineno();
        t
    }

    fn retire(&mut self) -> Token {
        self.scanner.retire_token()
    }

    fn expect(&mut self, token: Token) -> bool {
        if self.peek() == token {
            self.retire();
            return true;
        }
        self.expected_error(&token);
        false
    }

    fn expected_error(&mut self, token: &Token) {
        let what = match token {
            Token::LParen => "expected '('",
            Token::RParen => "expected ')'",
            Token::LBrace => "expected '{'",
            Token::RBrace => "expected '}'",
            Token::LBracket => "expected '['",
            Token::RBracket => "expected ']'",
            Token::Semicolon => "expected ';'",
            Token::Colon => "expected ':'",
            Token::While => "expected 'while'",
            Token::Identifier(_) => "identifier",
            _ => "syntax error",
        };
        self.gen.print_error(what);
    }

    fn identifier(&mut self) -> Option<Atom> {
        match self.peek() {
            Token::Identifier(name) => {
                let atom = self.gen.env.atoms.atomize(&name);
                self.retire();
                Some(atom)
            }
            _ => {
                self.gen.print_error("identifier");
                None
            }
        }
    }

    // ── Statements ──────────────────────────────────────────────────────

    fn program(&mut self) {
        while self.peek() != Token::Eof {
            if !self.statement() {
                self.gen.print_error("statement expected");
                break;
            }
            if self.gen.nerrors() > 0 {
                break;
            }
        }
    }

    fn statement(&mut self) -> bool {
        match self.peek() {
            Token::Function => self.function_statement(),
            Token::Class => self.class_statement(),
            Token::LBrace => self.compound_statement(),
            Token::If => self.selection_statement(),
            Token::Switch => self.switch_statement(),
            Token::While | Token::Do | Token::For => self.iteration_statement(),
            Token::Break | Token::Continue | Token::Return => self.jump_statement(),
            Token::Var => self.var_statement(),
            Token::Semicolon => {
                self.retire();
                true
            }
            _ => self.expression_statement(),
        }
    }

    fn function_statement(&mut self) -> bool {
        self.retire();
        let Some(name) = self.identifier() else {
            return false;
        };
        if let Some(func) = self.function_expression(false) {
            self.gen.add_named_function(func, name);
        }
        true
    }

    fn class_statement(&mut self) -> bool {
        self.retire();
        let Some(name) = self.identifier() else {
            return false;
        };
        self.gen.add_var(name);
        self.gen.emit_id(name, IdType::MustBeLocal);
        if !self.class_expression() {
            self.gen.print_error("expected class expression");
            return false;
        }
        self.gen.emit_move();
        self.gen.discard_result();
        true
    }

    fn compound_statement(&mut self) -> bool {
        self.retire();
        loop {
            if matches!(self.peek(), Token::RBrace | Token::Eof) {
                break;
            }
            if !self.statement() {
                break;
            }
            if self.gen.nerrors() > 0 {
                break;
            }
        }
        self.expect(Token::RBrace);
        true
    }

    fn selection_statement(&mut self) -> bool {
        self.retire();
        self.expect(Token::LParen);
        self.comma_expression();

        let mut if_label = self.gen.label();
        let mut else_label = self.gen.label();
        self.gen.add_matched_jump(Op::Jf, &mut else_label);

        self.expect(Token::RParen);
        self.statement();

        if self.peek() == Token::Else {
            self.retire();
            self.gen.add_matched_jump(Op::Jmp, &mut if_label);
            self.gen.match_jump(&else_label);
            self.statement();
            self.gen.match_jump(&if_label);
        } else {
            self.gen.match_jump(&else_label);
        }
        true
    }

    fn switch_statement(&mut self) -> bool {
        self.retire();
        self.expect(Token::LParen);
        self.comma_expression();
        self.expect(Token::RParen);
        self.expect(Token::LBrace);

        // Case bodies collect in a deferred block so the dispatch tests
        // stay contiguous; an empty case falls through to the next body
        // by splice order. `break` inside a body binds the switch.
        let deferred_statement_start = self.gen.start_deferred();
        self.gen.end_deferred();
        self.break_stack.push(Vec::new());

        let mut cases: Vec<CaseEntry> = Vec::new();
        let mut default_statement: i32 = 0;
        let mut default_from_label: Option<Label> = None;
        let mut have_default = false;

        loop {
            if !self.case_clause(
                &mut cases,
                &mut default_statement,
                &mut default_from_label,
                &mut have_default,
            ) {
                break;
            }
            if self.gen.nerrors() > 0 {
                break;
            }
        }

        self.expect(Token::RBrace);

        // Jumps past all the cases, or to the default body
        let mut end_jump_label = self.gen.label();
        self.gen.add_matched_jump(Op::Jmp, &mut end_jump_label);

        let statement_start = self.gen.emit_deferred();
        let after_statements_label = self.gen.label();

        if have_default {
            self.gen.match_jump_to_addr(
                &end_jump_label,
                default_statement - deferred_statement_start + statement_start,
            );
            if let Some(mut label) = default_from_label {
                label.matched_addr += statement_start - deferred_statement_start;
                self.gen
                    .match_jump_to_label(&label, &after_statements_label);
            }
        } else {
            self.gen
                .match_jump_to_label(&end_jump_label, &after_statements_label);
        }

        for case in &cases {
            self.gen.match_jump_to_addr(
                &case.to_statement,
                case.statement_addr - deferred_statement_start + statement_start,
            );
            if let Some(mut from) = case.from_statement {
                from.matched_addr += statement_start - deferred_statement_start;
                self.gen.match_jump_to_label(&from, &after_statements_label);
            }
        }

        // Break jumps were emitted into the deferred block; relocate
        // their patch sites into the spliced code
        let breaks = self.break_stack.pop().unwrap_or_default();
        for mut b in breaks {
            b.matched_addr += statement_start - deferred_statement_start;
            self.gen.match_jump_to_label(&b, &after_statements_label);
        }

        self.gen.discard_result();
        true
    }

    fn case_clause(
        &mut self,
        cases: &mut Vec<CaseEntry>,
        default_statement: &mut i32,
        default_from_label: &mut Option<Label>,
        have_default: &mut bool,
    ) -> bool {
        let is_default = match self.peek() {
            Token::Case => false,
            Token::Default => true,
            _ => return false,
        };
        self.retire();

        if is_default {
            if *have_default {
                self.gen.print_error("multiple default cases not allowed");
            }
            *have_default = true;
        } else {
            self.comma_expression();
            self.gen.emit_case_test();
        }

        self.expect(Token::Colon);

        if is_default {
            *default_statement = self.gen.resume_deferred();
            self.case_body();
            let mut label = self.gen.label();
            self.gen.add_matched_jump(Op::Jmp, &mut label);
            *default_from_label = Some(label);
            self.gen.end_deferred();
        } else {
            let mut to_statement = self.gen.label();
            self.gen.add_matched_jump(Op::Jt, &mut to_statement);
            let statement_addr = self.gen.resume_deferred();
            let from_statement = if self.case_body() {
                let mut label = self.gen.label();
                self.gen.add_matched_jump(Op::Jmp, &mut label);
                Some(label)
            } else {
                None
            };
            self.gen.end_deferred();
            cases.push(CaseEntry {
                to_statement,
                from_statement,
                statement_addr,
            });
        }
        true
    }

    /// The statement list of one case, up to the next label or the
    /// closing brace. Returns whether anything was emitted (an empty
    /// body falls through).
    fn case_body(&mut self) -> bool {
        let mut parsed_any = false;
        loop {
            if matches!(
                self.peek(),
                Token::Case | Token::Default | Token::RBrace | Token::Eof
            ) {
                break;
            }
            if !self.statement() {
                break;
            }
            parsed_any = true;
            if self.gen.nerrors() > 0 {
                break;
            }
        }
        parsed_any
    }

    fn iteration_statement(&mut self) -> bool {
        let keyword = self.retire();

        self.break_stack.push(Vec::new());
        self.continue_stack.push(Vec::new());

        match keyword {
            Token::While => {
                self.expect(Token::LParen);
                let mut label = self.gen.label();
                self.comma_expression();
                self.gen.add_matched_jump(Op::Jf, &mut label);
                self.expect(Token::RParen);
                self.statement();

                let continues = self.continue_stack.last().cloned().unwrap_or_default();
                for c in &continues {
                    self.gen.match_jump(c);
                }
                self.gen.jump_to_label(Op::Jmp, &label);
                self.gen.match_jump(&label);
            }
            Token::Do => {
                let label = self.gen.label();
                self.statement();

                let continues = self.continue_stack.last().cloned().unwrap_or_default();
                for c in &continues {
                    self.gen.match_jump(c);
                }

                self.expect(Token::While);
                self.expect(Token::LParen);
                self.comma_expression();
                self.gen.jump_to_label(Op::Jt, &label);
                self.expect(Token::RParen);
                self.expect(Token::Semicolon);
            }
            Token::For => {
                self.expect(Token::LParen);
                if self.peek() == Token::Var {
                    self.retire();

                    // Hold the name in case this turns into for-in
                    let name = match self.peek() {
                        Token::Identifier(n) => self.gen.env.atoms.atomize(&n),
                        _ => Atom::NONE,
                    };
                    let count = self.variable_declaration_list();
                    if count == 0 {
                        self.gen.print_error("missing var declaration");
                    }
                    if self.peek() == Token::Colon {
                        if count != 1 {
                            self.gen.print_error("only one var declaration allowed here");
                        }
                        self.retire();
                        self.for_iteration(Some(name), None);
                    } else {
                        self.for_loop_cond_and_it();
                    }
                } else if self.comma_expression() {
                    if self.peek() == Token::Colon {
                        self.retire();
                        // The left expression is the assignment target;
                        // it must be re-pushable each iteration.
                        let target = match self.gen.top_type() {
                            StackType::Local | StackType::RefK | StackType::UpValue => {
                                let snap = self.gen.snapshot_top();
                                self.gen.discard_result();
                                Some(snap)
                            }
                            _ => {
                                self.gen
                                    .print_error("for-in target must be a simple variable");
                                None
                            }
                        };
                        self.for_iteration(None, target);
                    } else {
                        self.for_loop_cond_and_it();
                    }
                }
            }
            _ => unreachable!(),
        }

        let breaks = self.break_stack.pop().unwrap_or_default();
        for b in &breaks {
            self.gen.match_jump(b);
        }
        self.continue_stack.pop();

        true
    }

    /// `for (init; cond; step)` — the step expression collects in a
    /// deferred block and is spliced in after the body.
    fn for_loop_cond_and_it(&mut self) {
        self.expect(Token::Semicolon);
        let label = self.gen.label();
        let mut exit_label = None;
        if self.comma_expression() {
            let mut exit = label;
            self.gen.add_matched_jump(Op::Jf, &mut exit);
            exit_label = Some(exit);
        }
        self.gen.start_deferred();
        self.expect(Token::Semicolon);
        if self.comma_expression() {
            self.gen.discard_result();
        }
        self.gen.end_deferred();
        self.expect(Token::RParen);
        self.statement();

        let continues = self.continue_stack.last().cloned().unwrap_or_default();
        for c in &continues {
            self.gen.match_jump(c);
        }

        self.gen.emit_deferred();
        self.gen.jump_to_label(Op::Jmp, &label);
        if let Some(exit) = exit_label {
            self.gen.match_jump(&exit);
        }
    }

    /// `for (var v : iterable)` lowers to
    ///
    ///   var %itN = new iterable.iterator(iterable);
    ///   while (!%itN.done()) { v = %itN.getValue(); body; %itN.next(); }
    ///
    /// The iterator lives in a hidden local so the loop variable carries
    /// the element values.
    fn for_iteration(&mut self, var_name: Option<Atom>, target: Option<(StackType, RegOrConst)>) {
        let hidden = {
            let name = format!("%it{}", self.hidden_counter);
            self.hidden_counter += 1;
            self.gen.env.atoms.atomize(&name)
        };
        self.gen.add_var(hidden);
        self.gen.emit_id(hidden, IdType::MustBeLocal);

        self.comma_expression();
        self.expect(Token::RParen);

        self.gen.emit_dup();
        self.gen.emit_push();
        self.gen
            .emit_id(Atom::from(SharedAtom::IteratorProp), IdType::NotLocal);
        self.gen.emit_deref(DerefType::Prop);
        self.gen.emit_call_ret(Op::New, RegOrConst::default(), 1);
        self.gen.emit_move();
        self.gen.discard_result();

        let mut label = self.gen.label();
        self.gen.emit_id(hidden, IdType::MightBeLocal);
        self.gen
            .emit_id(Atom::from(SharedAtom::Done), IdType::NotLocal);
        self.gen.emit_deref(DerefType::Prop);
        self.gen.emit_call_ret(Op::Call, RegOrConst::default(), 0);
        self.gen.add_matched_jump(Op::Jt, &mut label);

        // loopvar = %it.getValue()
        let have_target = var_name.is_some() || target.is_some();
        if let Some(name) = var_name {
            self.gen.emit_id(name, IdType::MightBeLocal);
        } else if let Some((ty, reg)) = target {
            self.gen.push_descriptor(ty, reg);
        }
        if have_target {
            self.gen.emit_id(hidden, IdType::MightBeLocal);
            self.gen
                .emit_id(Atom::from(SharedAtom::GetValue), IdType::NotLocal);
            self.gen.emit_deref(DerefType::Prop);
            self.gen.emit_call_ret(Op::Call, RegOrConst::default(), 0);
            self.gen.emit_move();
            self.gen.discard_result();
        }

        self.statement();

        let continues = self.continue_stack.last().cloned().unwrap_or_default();
        for c in &continues {
            self.gen.match_jump(c);
        }

        self.gen.emit_id(hidden, IdType::MightBeLocal);
        self.gen
            .emit_id(Atom::from(SharedAtom::Next), IdType::NotLocal);
        self.gen.emit_deref(DerefType::Prop);
        self.gen.emit_call_ret(Op::Call, RegOrConst::default(), 0);
        self.gen.discard_result();

        self.gen.jump_to_label(Op::Jmp, &label);
        self.gen.match_jump(&label);
    }

    fn jump_statement(&mut self) -> bool {
        match self.peek() {
            Token::Break | Token::Continue => {
                let is_break = self.peek() == Token::Break;
                self.retire();
                self.expect(Token::Semicolon);

                // A placeholder JMP; the enclosing loop resolves it
                let mut label = self.gen.label();
                self.gen.add_matched_jump(Op::Jmp, &mut label);
                let stack = if is_break {
                    &mut self.break_stack
                } else {
                    &mut self.continue_stack
                };
                match stack.last_mut() {
                    Some(entries) => entries.push(label),
                    None => self.gen.print_error("break/continue outside of loop"),
                }
                true
            }
            Token::Return => {
                self.retire();
                let mut count = 0u8;
                if self.comma_expression() {
                    count = 1;
                }
                if count == 0 && self.gen.function_is_ctor() {
                    self.gen.push_this();
                    count = 1;
                }
                self.gen.emit_call_ret(Op::Ret, RegOrConst::default(), count);
                self.expect(Token::Semicolon);
                true
            }
            _ => false,
        }
    }

    fn var_statement(&mut self) -> bool {
        self.retire();
        if self.variable_declaration_list() == 0 {
            self.gen.print_error("missing var declaration");
        }
        self.expect(Token::Semicolon);
        true
    }

    fn variable_declaration_list(&mut self) -> u32 {
        let mut count = 0;
        while self.variable_declaration() {
            count += 1;
            if self.peek() != Token::Comma {
                break;
            }
            self.retire();
        }
        count
    }

    fn variable_declaration(&mut self) -> bool {
        let Token::Identifier(name) = self.peek() else {
            return false;
        };
        let atom = self.gen.env.atoms.atomize(&name);
        self.gen.add_var(atom);
        self.retire();
        if self.peek() != Token::Sto {
            return true;
        }
        self.retire();
        self.gen.emit_id(atom, IdType::MustBeLocal);
        if !self.arithmetic_expression(1) {
            self.gen.print_error("expected variable initializer");
            return false;
        }
        self.gen.emit_move();
        self.gen.discard_result();
        true
    }

    fn expression_statement(&mut self) -> bool {
        if !self.comma_expression() {
            return false;
        }
        self.gen.discard_result();
        self.expect(Token::Semicolon);
        true
    }

    // ── Classes ─────────────────────────────────────────────────────────

    fn class_expression(&mut self) -> bool {
        self.gen.class_start();
        self.expect(Token::LBrace);
        while self.class_contents() {
            if self.gen.nerrors() > 0 {
                break;
            }
        }
        self.expect(Token::RBrace);
        self.gen.class_end();
        true
    }

    fn class_contents(&mut self) -> bool {
        match self.peek() {
            Token::Function => {
                self.retire();
                let Some(name) = self.identifier() else {
                    return false;
                };
                if let (Some(func), Some(class)) =
                    (self.function_expression(false), self.gen.current_class())
                {
                    self.gen.set_class_property(class, name, Value::Object(func));
                }
                true
            }
            Token::Constructor => {
                self.retire();
                let Some(func) = self.function_expression(true) else {
                    return false;
                };
                if let Some(class) = self.gen.current_class() {
                    self.gen.set_class_property(
                        class,
                        Atom::from(SharedAtom::Constructor),
                        Value::Object(func),
                    );
                }
                true
            }
            Token::Var => {
                self.retire();
                loop {
                    let Token::Identifier(name) = self.peek() else {
                        return false;
                    };
                    let atom = self.gen.env.atoms.atomize(&name);
                    self.retire();
                    let mut v = Value::Null;
                    if self.peek() == Token::Sto {
                        self.retire();
                        v = match self.peek() {
                            Token::Float(f) => Value::Float(f),
                            Token::Integer(i) => Value::Integer(i as i32),
                            Token::String(ref s) => {
                                let lit = self.gen.program.add_string_literal(s);
                                Value::StringLiteral(lit)
                            }
                            Token::True => Value::Bool(true),
                            Token::False => Value::Bool(false),
                            Token::Null => Value::Null,
                            Token::Undefined => Value::Undefined,
                            _ => {
                                self.gen.print_error("constant value required");
                                Value::Undefined
                            }
                        };
                        self.retire();
                    }
                    if let Some(class) = self.gen.current_class() {
                        self.gen.set_class_property(class, atom, v);
                    }
                    if self.peek() != Token::Comma {
                        break;
                    }
                    self.retire();
                }
                self.expect(Token::Semicolon);
                true
            }
            _ => false,
        }
    }

    // ── Expressions ─────────────────────────────────────────────────────

    fn argument_list(&mut self) -> u32 {
        let mut count = 0;
        if !self.arithmetic_expression(1) {
            return count;
        }
        self.gen.emit_push();
        count += 1;
        while self.peek() == Token::Comma {
            self.retire();
            self.arithmetic_expression(1);
            self.gen.emit_push();
            count += 1;
        }
        count
    }

    fn property_name(&mut self) -> bool {
        match self.peek() {
            Token::Identifier(name) => {
                let atom = self.gen.env.atoms.atomize(&name);
                self.gen.emit_id(atom, IdType::NotLocal);
                self.retire();
                true
            }
            Token::String(s) => {
                self.gen.push_k_str(&s);
                self.retire();
                true
            }
            Token::Float(f) => {
                self.gen.push_k(Value::Float(f));
                self.retire();
                true
            }
            Token::Integer(i) => {
                self.gen.push_k(Value::Integer(i as i32));
                self.retire();
                true
            }
            _ => false,
        }
    }

    fn property_assignment(&mut self) -> bool {
        if !self.property_name() {
            return false;
        }
        if !self.expect(Token::Colon) {
            return false;
        }
        if !self.arithmetic_expression(1) {
            self.gen.print_error("expected expression");
            return false;
        }
        true
    }

    fn formal_parameter_list(&mut self) {
        if !matches!(self.peek(), Token::Identifier(_)) {
            return;
        }
        loop {
            if let Token::Identifier(name) = self.peek() {
                let atom = self.gen.env.atoms.atomize(&name);
                self.gen.function_add_param(atom);
                self.retire();
            }
            if self.peek() != Token::Comma {
                return;
            }
            self.retire();
            if !matches!(self.peek(), Token::Identifier(_)) {
                self.gen.print_error("identifier");
                return;
            }
        }
    }

    fn function_expression(&mut self, ctor: bool) -> Option<ObjId> {
        self.expect(Token::LParen);
        self.gen.function_start(ctor);
        self.formal_parameter_list();
        self.gen.function_params_end();
        self.expect(Token::RParen);
        self.expect(Token::LBrace);
        loop {
            if matches!(self.peek(), Token::RBrace | Token::Eof) {
                break;
            }
            if !self.statement() {
                break;
            }
            if self.gen.nerrors() > 0 {
                break;
            }
        }
        self.expect(Token::RBrace);
        self.gen.function_end()
    }

    fn primary_expression(&mut self) -> bool {
        match self.peek() {
            Token::LParen => {
                self.retire();
                self.comma_expression();
                self.expect(Token::RParen);
                true
            }
            Token::Identifier(name) => {
                let atom = self.gen.env.atoms.atomize(&name);
                self.gen.emit_id(atom, IdType::MightBeLocal);
                self.retire();
                true
            }
            Token::This => {
                self.gen.push_this();
                self.retire();
                true
            }
            Token::Float(f) => {
                self.gen.push_k(Value::Float(f));
                self.retire();
                true
            }
            Token::Integer(i) => {
                self.gen.push_k(Value::Integer(i as i32));
                self.retire();
                true
            }
            Token::String(s) => {
                self.gen.push_k_str(&s);
                self.retire();
                true
            }
            Token::True => {
                self.gen.push_k(Value::Bool(true));
                self.retire();
                true
            }
            Token::False => {
                self.gen.push_k(Value::Bool(false));
                self.retire();
                true
            }
            Token::Null => {
                self.gen.push_k(Value::Null);
                self.retire();
                true
            }
            Token::Undefined => {
                self.gen.push_k(Value::Undefined);
                self.retire();
                true
            }
            Token::LBracket => {
                self.retire();
                self.gen.emit_load_lit(true);
                if self.arithmetic_expression(1) {
                    self.gen.emit_append_elt();
                    while self.peek() == Token::Comma {
                        self.retire();
                        if !self.arithmetic_expression(1) {
                            self.gen.print_error("expected array element");
                            break;
                        }
                        self.gen.emit_append_elt();
                    }
                }
                self.expect(Token::RBracket);
                true
            }
            Token::LBrace => {
                self.retire();
                self.gen.emit_load_lit(false);
                if self.property_assignment() {
                    self.gen.emit_append_prop();
                    while self.peek() == Token::Comma {
                        self.retire();
                        if !self.property_assignment() {
                            self.gen.print_error("expected object member");
                            break;
                        }
                        self.gen.emit_append_prop();
                    }
                }
                self.expect(Token::RBrace);
                true
            }
            _ => false,
        }
    }

    fn object_expression(&mut self) -> bool {
        match self.peek() {
            Token::New => {
                self.retire();
                self.primary_expression();
                let mut arg_count = 0;
                if self.peek() == Token::LParen {
                    self.retire();
                    arg_count = self.argument_list();
                    self.expect(Token::RParen);
                }
                self.gen
                    .emit_call_ret(Op::New, RegOrConst::default(), arg_count as u8);
                true
            }
            Token::Delete => {
                // Deletion is unsupported; evaluate for side effects only
                self.retire();
                self.unary_expression();
                true
            }
            Token::Function => {
                self.retire();
                match self.function_expression(false) {
                    Some(func) => {
                        self.gen.push_k(Value::Object(func));
                        true
                    }
                    None => false,
                }
            }
            Token::Class => {
                self.retire();
                self.class_expression()
            }
            _ => false,
        }
    }

    fn postfix_expression(&mut self) -> bool {
        if !self.primary_expression() {
            return false;
        }
        let mut object_reg = RegOrConst::default();
        loop {
            match self.peek() {
                Token::Incr => {
                    self.retire();
                    self.gen.emit_un_op(Op::PostInc);
                }
                Token::Decr => {
                    self.retire();
                    self.gen.emit_un_op(Op::PostDec);
                }
                Token::LParen => {
                    self.retire();
                    let arg_count = self.argument_list();
                    self.expect(Token::RParen);
                    self.gen.emit_call_ret(Op::Call, object_reg, arg_count as u8);
                    object_reg = RegOrConst::default();
                }
                Token::LBracket => {
                    self.retire();
                    self.comma_expression();
                    self.expect(Token::RBracket);
                    object_reg = self.gen.emit_deref(DerefType::Elt);
                }
                Token::Period => {
                    self.retire();
                    let Some(name) = self.identifier() else {
                        return true;
                    };
                    self.gen.emit_id(name, IdType::NotLocal);
                    object_reg = self.gen.emit_deref(DerefType::Prop);
                }
                _ => return true,
            }
        }
    }

    fn unary_expression(&mut self) -> bool {
        if self.object_expression() {
            return true;
        }
        if self.postfix_expression() {
            return true;
        }

        let op = match self.peek() {
            Token::Incr => Op::PreInc,
            Token::Decr => Op::PreDec,
            Token::Minus => Op::UMinus,
            Token::Twiddle => Op::UNot,
            Token::Bang => Op::UNeg,
            _ => return false,
        };
        self.retire();
        self.unary_expression();
        self.gen.emit_un_op(op);
        true
    }

    fn arithmetic_expression(&mut self, min_prec: u8) -> bool {
        if !self.unary_expression() {
            return false;
        }

        if self.peek() == Token::Question {
            // Ternary: leave one of the two arms in a fresh temporary
            self.retire();
            let mut if_label = self.gen.label();
            let mut else_label = self.gen.label();
            self.gen.add_matched_jump(Op::Jf, &mut else_label);
            self.gen.push_tmp();
            self.comma_expression();
            self.gen.emit_move();
            self.expect(Token::Colon);
            self.gen.add_matched_jump(Op::Jmp, &mut if_label);
            self.gen.match_jump(&else_label);
            self.arithmetic_expression(1);
            self.gen.emit_move();
            self.gen.match_jump(&if_label);
        }

        loop {
            let token = self.peek();
            let Some(info) = OP_INFOS.iter().find(|i| i.token == token) else {
                break;
            };
            if info.prec < min_prec {
                break;
            }
            let next_min_prec = if info.assoc == Assoc::Left {
                info.prec + 1
            } else {
                info.prec
            };
            let (sto, op) = (info.sto, info.op);
            self.retire();
            if sto {
                self.gen.emit_dup();
            }

            if op == Op::Land || op == Op::Lor {
                // Short circuit: skip the right side when the left
                // already decides the result
                let mut pass_label = self.gen.label();
                let mut skip_label1 = self.gen.label();
                let mut skip_label2 = self.gen.label();
                let skip_result = op != Op::Land;
                let skip_op = if skip_result { Op::Jt } else { Op::Jf };

                // Falling through both tests means the right side decided
                // the result; the skip path is the short-circuit value.
                let (pass_value, skip_value) = if op == Op::Land { (1, 0) } else { (0, 1) };

                self.gen.add_matched_jump(skip_op, &mut skip_label1);
                if !self.arithmetic_expression(next_min_prec) {
                    self.gen.print_error("expected right-hand side expression");
                    return false;
                }
                self.gen.add_matched_jump(skip_op, &mut skip_label2);

                self.gen.push_tmp();
                self.gen.push_k(Value::Integer(pass_value));
                self.gen.emit_move();
                self.gen.add_matched_jump(Op::Jmp, &mut pass_label);
                self.gen.match_jump(&skip_label1);
                self.gen.match_jump(&skip_label2);
                self.gen.push_k(Value::Integer(skip_value));
                self.gen.emit_move();
                self.gen.match_jump(&pass_label);
            } else {
                if !self.arithmetic_expression(next_min_prec) {
                    self.gen.print_error("expected right-hand side expression");
                    return false;
                }
                self.gen.emit_bin_op(op);
            }

            if sto {
                self.gen.emit_move();
            }
        }
        true
    }

    fn comma_expression(&mut self) -> bool {
        if !self.arithmetic_expression(1) {
            return false;
        }
        while self.peek() == Token::Comma {
            self.retire();
            self.gen.discard_result();
            if !self.arithmetic_expression(1) {
                self.gen.print_error("expected expression");
                return false;
            }
        }
        true
    }
}
