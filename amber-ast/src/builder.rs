// amber-ast - Syntax tree contract for the Amber ahead-of-time compiler
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Programmatic tree construction.
//!
//! A front end producing this tree must assign unique [`NodeId`]s and real
//! source locations. `AstBuilder` does the first and synthesizes the second
//! (one line per node), which is what the compiler test suites use in lieu of
//! a parser.

use crate::node::*;
use crate::ops::*;

/// Builds AST nodes with fresh ids and synthetic locations.
#[derive(Debug, Default)]
pub struct AstBuilder {
    next_id: u32,
    next_line: u32,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            next_line: 0,
        }
    }

    /// Hand out a fresh node id.
    pub fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Synthetic location; each call advances one line so locations stay
    /// distinguishable in error messages.
    pub fn loc(&mut self) -> SourceLoc {
        self.next_line += 1;
        SourceLoc::new(self.next_line, 1)
    }

    // =========================================================================
    // Identifiers and literals
    // =========================================================================

    pub fn ident(&mut self, name: &str) -> Identifier {
        Identifier {
            id: self.fresh_id(),
            loc: self.loc(),
            name: name.to_string(),
        }
    }

    pub fn id_expr(&mut self, name: &str) -> Expr {
        let ident = self.ident(name);
        Expr {
            loc: ident.loc,
            kind: ExprKind::Identifier(ident),
        }
    }

    pub fn number(&mut self, value: f64) -> Expr {
        self.expr(ExprKind::Literal(Lit::Number(value)))
    }

    pub fn string(&mut self, value: &str) -> Expr {
        self.expr(ExprKind::Literal(Lit::String(value.to_string())))
    }

    pub fn boolean(&mut self, value: bool) -> Expr {
        self.expr(ExprKind::Literal(Lit::Boolean(value)))
    }

    pub fn null(&mut self) -> Expr {
        self.expr(ExprKind::Literal(Lit::Null))
    }

    /// `undefined` is spelled as an identifier in source; the compiler treats
    /// it as a literal rather than a binding.
    pub fn undefined(&mut self) -> Expr {
        self.id_expr("undefined")
    }

    pub fn this(&mut self) -> Expr {
        self.expr(ExprKind::This)
    }

    // =========================================================================
    // Compound expressions
    // =========================================================================

    pub fn expr(&mut self, kind: ExprKind) -> Expr {
        Expr {
            loc: self.loc(),
            kind,
        }
    }

    pub fn binary(&mut self, op: BinaryOp, left: Expr, right: Expr) -> Expr {
        self.expr(ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn logical(&mut self, op: LogicalOp, left: Expr, right: Expr) -> Expr {
        self.expr(ExprKind::Logical {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn unary(&mut self, op: UnaryOp, argument: Expr) -> Expr {
        self.expr(ExprKind::Unary {
            op,
            argument: Box::new(argument),
        })
    }

    pub fn update(&mut self, op: UpdateOp, prefix: bool, argument: Expr) -> Expr {
        self.expr(ExprKind::Update {
            op,
            prefix,
            argument: Box::new(argument),
        })
    }

    pub fn assign(&mut self, op: AssignOp, target: Expr, value: Expr) -> Expr {
        self.expr(ExprKind::Assignment {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    /// `name = value`
    pub fn assign_name(&mut self, name: &str, value: Expr) -> Expr {
        let target = self.id_expr(name);
        self.assign(AssignOp::Assign, target, value)
    }

    pub fn conditional(&mut self, test: Expr, consequent: Expr, alternate: Expr) -> Expr {
        self.expr(ExprKind::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    pub fn call(&mut self, callee: Expr, arguments: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            callee: Box::new(callee),
            arguments,
        })
    }

    /// `name(args...)`
    pub fn call_name(&mut self, name: &str, arguments: Vec<Expr>) -> Expr {
        let callee = self.id_expr(name);
        self.call(callee, arguments)
    }

    /// `object.name`
    pub fn member(&mut self, object: Expr, name: &str) -> Expr {
        self.expr(ExprKind::Member {
            object: Box::new(object),
            property: MemberProperty::Static(name.to_string()),
        })
    }

    /// `object[key]`
    pub fn member_computed(&mut self, object: Expr, key: Expr) -> Expr {
        self.expr(ExprKind::Member {
            object: Box::new(object),
            property: MemberProperty::Computed(Box::new(key)),
        })
    }

    pub fn array(&mut self, elements: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Array(elements))
    }

    pub fn object(&mut self, entries: Vec<(&str, Expr)>) -> Expr {
        let properties = entries
            .into_iter()
            .map(|(key, value)| ObjectProperty {
                loc: value.loc,
                key: key.to_string(),
                value,
            })
            .collect();
        self.expr(ExprKind::Object(properties))
    }

    pub fn template(&mut self, quasis: Vec<&str>, expressions: Vec<Expr>) -> Expr {
        debug_assert_eq!(quasis.len(), expressions.len() + 1);
        self.expr(ExprKind::TemplateLiteral {
            quasis: quasis.into_iter().map(str::to_string).collect(),
            expressions,
        })
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Expression-bodied arrow: `(params) => body`.
    pub fn arrow(&mut self, params: &[&str], body: Expr) -> Expr {
        let node = self.function_node(None, params, FunctionBody::Expression(Box::new(body)), true);
        self.expr(ExprKind::Function(node))
    }

    /// Block-bodied arrow: `(params) => { body }`.
    pub fn arrow_block(&mut self, params: &[&str], body: Vec<Stmt>) -> Expr {
        let node = self.function_node(None, params, FunctionBody::Block(body), true);
        self.expr(ExprKind::Function(node))
    }

    /// Anonymous or named function expression.
    pub fn function_expr(&mut self, name: Option<&str>, params: &[&str], body: Vec<Stmt>) -> Expr {
        let node = self.function_node(name, params, FunctionBody::Block(body), false);
        self.expr(ExprKind::Function(node))
    }

    /// `function name(params) { body }` statement.
    pub fn function_decl(&mut self, name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
        let node = self.function_node(Some(name), params, FunctionBody::Block(body), false);
        Stmt {
            id: self.fresh_id(),
            loc: node.loc,
            kind: StmtKind::FunctionDeclaration(node),
        }
    }

    fn function_node(
        &mut self,
        name: Option<&str>,
        params: &[&str],
        body: FunctionBody,
        is_arrow: bool,
    ) -> FunctionNode {
        FunctionNode {
            id: self.fresh_id(),
            loc: self.loc(),
            name: name.map(|n| self.ident(n)),
            params: params.iter().map(|p| self.ident(p)).collect(),
            body,
            is_arrow,
            is_async: false,
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub fn stmt(&mut self, kind: StmtKind) -> Stmt {
        Stmt {
            id: self.fresh_id(),
            loc: self.loc(),
            kind,
        }
    }

    pub fn expr_stmt(&mut self, expr: Expr) -> Stmt {
        self.stmt(StmtKind::Expression(expr))
    }

    pub fn decl(&mut self, kind: DeclKind, name: &str, init: Option<Expr>) -> Stmt {
        let id = self.ident(name);
        let declarator = Declarator {
            loc: id.loc,
            id,
            init,
        };
        self.stmt(StmtKind::VariableDeclaration {
            kind,
            declarations: vec![declarator],
        })
    }

    pub fn var(&mut self, name: &str, init: Option<Expr>) -> Stmt {
        self.decl(DeclKind::Var, name, init)
    }

    pub fn let_(&mut self, name: &str, init: Option<Expr>) -> Stmt {
        self.decl(DeclKind::Let, name, init)
    }

    pub fn const_(&mut self, name: &str, init: Expr) -> Stmt {
        self.decl(DeclKind::Const, name, Some(init))
    }

    pub fn ret(&mut self, value: Option<Expr>) -> Stmt {
        self.stmt(StmtKind::Return(value))
    }

    pub fn block(&mut self, body: Vec<Stmt>) -> Stmt {
        self.stmt(StmtKind::Block(body))
    }

    pub fn if_(&mut self, test: Expr, consequent: Stmt, alternate: Option<Stmt>) -> Stmt {
        self.stmt(StmtKind::If {
            test,
            consequent: Box::new(consequent),
            alternate: alternate.map(Box::new),
        })
    }

    pub fn while_(&mut self, test: Expr, body: Stmt) -> Stmt {
        self.stmt(StmtKind::While {
            test,
            body: Box::new(body),
        })
    }

    pub fn do_while(&mut self, body: Stmt, test: Expr) -> Stmt {
        self.stmt(StmtKind::DoWhile {
            body: Box::new(body),
            test,
        })
    }

    pub fn for_(
        &mut self,
        init: Option<ForInit>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Stmt,
    ) -> Stmt {
        self.stmt(StmtKind::For {
            init,
            test,
            update,
            body: Box::new(body),
        })
    }

    pub fn switch(&mut self, discriminant: Expr, cases: Vec<SwitchCase>) -> Stmt {
        self.stmt(StmtKind::Switch {
            discriminant,
            cases,
        })
    }

    pub fn case(&mut self, test: Option<Expr>, consequent: Vec<Stmt>) -> SwitchCase {
        SwitchCase {
            loc: self.loc(),
            test,
            consequent,
        }
    }

    pub fn break_(&mut self) -> Stmt {
        self.stmt(StmtKind::Break)
    }

    pub fn import(&mut self, names: &[&str], source: &str) -> Stmt {
        let specifiers = names
            .iter()
            .map(|n| {
                let local = self.ident(n);
                ImportSpecifier {
                    loc: local.loc,
                    imported: n.to_string(),
                    local,
                }
            })
            .collect();
        self.stmt(StmtKind::ImportDeclaration {
            specifiers,
            source: source.to_string(),
        })
    }

    pub fn export(&mut self, declaration: Stmt) -> Stmt {
        self.stmt(StmtKind::ExportNamedDeclaration(Box::new(declaration)))
    }

    pub fn program(&mut self, source_filename: &str, body: Vec<Stmt>) -> Program {
        Program {
            source_filename: source_filename.to_string(),
            body,
        }
    }
}
