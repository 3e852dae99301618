//! Syntax tree accepted by the graph builder.
//!
//! This is the subset of ESTree that stax lowers, deserialized from the JSON
//! an external JavaScript parser produces. Node kinds outside the subset
//! deserialize to `Other` and are rejected during lowering. Extra ESTree
//! properties are ignored.

use serde::{Deserialize, Serialize};

/// A complete program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Statement>,
}

/// Source offsets carried by every node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    #[serde(default)]
    pub start: Option<u32>,
    #[serde(default)]
    pub end: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Statement {
    ExpressionStatement(ExpressionStatement),
    VariableDeclaration(VariableDeclaration),
    FunctionDeclaration(FunctionDeclaration),
    BlockStatement(Block),
    #[serde(other)]
    Other,
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::ExpressionStatement(_) => "ExpressionStatement",
            Statement::VariableDeclaration(_) => "VariableDeclaration",
            Statement::FunctionDeclaration(_) => "FunctionDeclaration",
            Statement::BlockStatement(_) => "BlockStatement",
            Statement::Other => "statement",
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Statement::ExpressionStatement(stmt) => stmt.span(),
            Statement::VariableDeclaration(decl) => decl.span(),
            Statement::FunctionDeclaration(decl) => decl.span(),
            Statement::BlockStatement(block) => block.span(),
            Statement::Other => Span::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionStatement {
    pub expression: Expression,
    #[serde(default)]
    pub start: Option<u32>,
    #[serde(default)]
    pub end: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub declarations: Vec<VariableDeclarator>,
    /// `const`, `let` or `var`; all bind the same way.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub start: Option<u32>,
    #[serde(default)]
    pub end: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclarator {
    pub id: Expression,
    #[serde(default)]
    pub init: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub id: Option<Expression>,
    #[serde(default)]
    pub params: Vec<Expression>,
    pub body: Block,
    #[serde(default)]
    pub start: Option<u32>,
    #[serde(default)]
    pub end: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub body: Vec<Statement>,
    #[serde(default)]
    pub start: Option<u32>,
    #[serde(default)]
    pub end: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expression {
    Identifier(Identifier),
    Literal(Literal),
    BinaryExpression(BinaryExpression),
    UnaryExpression(UnaryExpression),
    CallExpression(CallExpression),
    ConditionalExpression(ConditionalExpression),
    #[serde(other)]
    Other,
}

impl Expression {
    pub fn kind(&self) -> &'static str {
        match self {
            Expression::Identifier(_) => "Identifier",
            Expression::Literal(_) => "Literal",
            Expression::BinaryExpression(_) => "BinaryExpression",
            Expression::UnaryExpression(_) => "UnaryExpression",
            Expression::CallExpression(_) => "CallExpression",
            Expression::ConditionalExpression(_) => "ConditionalExpression",
            Expression::Other => "expression",
        }
    }

    /// The name, when this is a plain identifier.
    pub fn as_identifier(&self) -> Option<&str> {
        match self {
            Expression::Identifier(ident) => Some(&ident.name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    pub value: LiteralValue,
    #[serde(default)]
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    Bool(bool),
    Number(f64),
    String(String),
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryExpression {
    pub operator: String,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryExpression {
    pub operator: String,
    pub argument: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExpression {
    pub callee: Box<Expression>,
    #[serde(default)]
    pub arguments: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalExpression {
    pub test: Box<Expression>,
    pub consequent: Box<Expression>,
    pub alternate: Box<Expression>,
}

macro_rules! impl_span {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn span(&self) -> Span {
                Span { start: self.start, end: self.end }
            }
        })*
    };
}

impl_span!(ExpressionStatement, VariableDeclaration, FunctionDeclaration, Block);

/// Parse a program from ESTree JSON.
pub fn from_json(text: &str) -> Result<Program, String> {
    serde_json::from_str(text).map_err(|e| format!("invalid syntax tree: {}", e))
}
