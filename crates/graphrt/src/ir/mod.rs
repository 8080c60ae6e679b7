//! Typed functional IR consumed by the storage planner and graph codegen.
//!
//! Expressions are immutable, `Arc`-shared DAG nodes. Every map in the
//! planner and codegen is keyed by node identity ([`ExprAddr`]), never by
//! structural equality: the input is a DAG and deep comparison would merge
//! distinct occurrences, corrupting reference counts.
//!
//! The IR arrives already fused and type-checked. Operator fusion and type
//! inference are upstream passes; this crate only validates what it needs
//! (static shapes, supported variants) and rejects the rest.

pub mod visit;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use visit::MemoTranslate;

/// Scalar type family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DTypeCode {
    Int,
    UInt,
    Float,
}

/// Element type of a tensor: family, bit width, vector lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DType {
    pub code: DTypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl DType {
    pub const fn new(code: DTypeCode, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    pub const fn float(bits: u8) -> Self {
        Self::new(DTypeCode::Float, bits, 1)
    }

    pub const fn int(bits: u8) -> Self {
        Self::new(DTypeCode::Int, bits, 1)
    }

    pub const fn uint(bits: u8) -> Self {
        Self::new(DTypeCode::UInt, bits, 1)
    }

    pub const fn f32() -> Self {
        Self::float(32)
    }

    pub const fn f64() -> Self {
        Self::float(64)
    }

    pub const fn i8() -> Self {
        Self::int(8)
    }

    pub const fn i32() -> Self {
        Self::int(32)
    }

    pub const fn i64() -> Self {
        Self::int(64)
    }

    pub const fn u8() -> Self {
        Self::uint(8)
    }

    pub const fn bool_() -> Self {
        Self::uint(1)
    }

    /// Bytes occupied by one (possibly vectorised) element group.
    pub fn packed_bytes(&self) -> u64 {
        (u64::from(self.bits) * u64::from(self.lanes) + 7) / 8
    }

    /// Wire name used by the graph JSON, e.g. `"float32"`, `"uint8"`.
    /// Lanes participate in byte sizing only and are not encoded here.
    pub fn json_name(&self) -> String {
        let prefix = match self.code {
            DTypeCode::Int => "int",
            DTypeCode::UInt => "uint",
            DTypeCode::Float => "float",
        };
        format!("{prefix}{}", self.bits)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.json_name())?;
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

/// One axis extent. Symbolic extents survive upstream passes but are fatal
/// to the planner, which must know every byte ahead of time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(i64),
    Symbolic(String),
}

/// Checked tensor type: shape plus element dtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub shape: Vec<Dim>,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(shape: impl Into<Vec<Dim>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn with_dims(dims: &[i64], dtype: DType) -> Self {
        Self::new(
            dims.iter().copied().map(Dim::Static).collect::<Vec<_>>(),
            dtype,
        )
    }

    /// Concrete dimensions, rejecting symbolic extents.
    pub fn static_dims(&self) -> Result<Vec<i64>> {
        let mut dims = Vec::with_capacity(self.shape.len());
        for dim in &self.shape {
            match dim {
                Dim::Static(value) => dims.push(*value),
                Dim::Symbolic(name) => {
                    return Err(CompileError::SymbolicShape { dim: name.clone() })
                }
            }
        }
        Ok(dims)
    }

    /// Byte footprint: element count times `ceil(bits * lanes / 8)`.
    pub fn byte_len(&self) -> Result<u64> {
        let mut size: u64 = 1;
        for dim in &self.shape {
            match dim {
                Dim::Static(value) if *value < 0 => {
                    return Err(CompileError::NegativeShape { dim: *value })
                }
                Dim::Static(value) => size = size.saturating_mul(*value as u64),
                Dim::Symbolic(name) => {
                    return Err(CompileError::SymbolicShape { dim: name.clone() })
                }
            }
        }
        Ok(size.saturating_mul(self.dtype.packed_bytes()))
    }
}

/// Checked type of a tensor-valued expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Tensor(TensorType),
    Tuple(Vec<Type>),
}

impl Type {
    /// Number of tensor outputs an expression of this type produces.
    pub fn tensor_outputs(&self) -> usize {
        match self {
            Type::Tensor(_) => 1,
            Type::Tuple(fields) => fields.len(),
        }
    }
}

/// Dense constant payload embedded in the IR.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    pub ty: TensorType,
    pub bytes: Arc<[u8]>,
}

impl TensorData {
    pub fn new(ty: TensorType, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            ty,
            bytes: bytes.into(),
        }
    }

    /// All-zero payload sized from the tensor type.
    pub fn zeroed(ty: TensorType) -> Result<Self> {
        let len = ty.byte_len()?;
        Ok(Self::new(ty, vec![0u8; len as usize]))
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Function attributes the backend cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FnAttrs {
    /// Set on fused subgraphs; only primitive functions may be called.
    pub primitive: bool,
    /// Name of an external code generator claiming this function.
    pub compiler: Option<String>,
    /// Externally visible symbol, required when `compiler` is set.
    pub global_symbol: Option<String>,
}

/// Body of a `Function` expression.
#[derive(Debug, Clone)]
pub struct FunctionNode {
    pub params: Vec<Expr>,
    pub body: Expr,
    pub attrs: FnAttrs,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Var { name: String },
    Constant(TensorData),
    Tuple(Vec<Expr>),
    TupleGetItem { tuple: Expr, index: usize },
    Call { op: Expr, args: Vec<Expr> },
    Function(FunctionNode),
    Let { var: Expr, value: Expr, body: Expr },
    GlobalVar { name: String },
    Op { name: String },
    If { cond: Expr, then_branch: Expr, else_branch: Expr },
    RefCreate { value: Expr },
    RefRead { reference: Expr },
    RefWrite { reference: Expr, value: Expr },
    Constructor { name: String },
    Match { data: Expr },
}

struct ExprNode {
    kind: ExprKind,
    ty: Option<Type>,
}

/// Stable identity of an expression node, used as a map key everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprAddr(usize);

/// Immutable, reference-counted expression handle. Cloning shares the node;
/// equality and hashing are by node identity.
#[derive(Clone)]
pub struct Expr(Arc<ExprNode>);

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Expr {}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({})", self.kind_name())
    }
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Option<Type>) -> Self {
        Self(Arc::new(ExprNode { kind, ty }))
    }

    pub fn addr(&self) -> ExprAddr {
        ExprAddr(Arc::as_ptr(&self.0) as usize)
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.0.kind {
            ExprKind::Var { .. } => "Var",
            ExprKind::Constant(_) => "Constant",
            ExprKind::Tuple(_) => "Tuple",
            ExprKind::TupleGetItem { .. } => "TupleGetItem",
            ExprKind::Call { .. } => "Call",
            ExprKind::Function(_) => "Function",
            ExprKind::Let { .. } => "Let",
            ExprKind::GlobalVar { .. } => "GlobalVar",
            ExprKind::Op { .. } => "Op",
            ExprKind::If { .. } => "If",
            ExprKind::RefCreate { .. } => "RefCreate",
            ExprKind::RefRead { .. } => "RefRead",
            ExprKind::RefWrite { .. } => "RefWrite",
            ExprKind::Constructor { .. } => "Constructor",
            ExprKind::Match { .. } => "Match",
        }
    }

    pub fn ty(&self) -> Option<&Type> {
        self.0.ty.as_ref()
    }

    /// The resolved type, or an error naming the offending variant.
    pub fn checked_type(&self) -> Result<&Type> {
        self.ty().ok_or(CompileError::UntypedExpr {
            kind: self.kind_name(),
        })
    }

    pub fn var(name: impl Into<String>, ty: Type) -> Self {
        Self::new(ExprKind::Var { name: name.into() }, Some(ty))
    }

    pub fn constant(data: TensorData) -> Self {
        let ty = Type::Tensor(data.ty.clone());
        Self::new(ExprKind::Constant(data), Some(ty))
    }

    pub fn tuple(fields: Vec<Expr>) -> Result<Self> {
        let mut field_types = Vec::with_capacity(fields.len());
        for field in &fields {
            field_types.push(field.checked_type()?.clone());
        }
        Ok(Self::new(
            ExprKind::Tuple(fields),
            Some(Type::Tuple(field_types)),
        ))
    }

    pub fn tuple_get_item(tuple: Expr, index: usize) -> Result<Self> {
        let ty = match tuple.checked_type()? {
            Type::Tuple(fields) => {
                fields
                    .get(index)
                    .cloned()
                    .ok_or(CompileError::TupleArityMismatch {
                        index,
                        len: fields.len(),
                    })?
            }
            Type::Tensor(_) => {
                return Err(CompileError::UnsupportedVariant {
                    kind: "Tensor",
                    context: "tuple projection",
                })
            }
        };
        Ok(Self::new(ExprKind::TupleGetItem { tuple, index }, Some(ty)))
    }

    pub fn call(op: Expr, args: Vec<Expr>, ty: Type) -> Self {
        Self::new(ExprKind::Call { op, args }, Some(ty))
    }

    pub fn function(params: Vec<Expr>, body: Expr, attrs: FnAttrs) -> Self {
        Self::new(ExprKind::Function(FunctionNode { params, body, attrs }), None)
    }

    pub fn let_(var: Expr, value: Expr, body: Expr) -> Self {
        let ty = body.ty().cloned();
        Self::new(ExprKind::Let { var, value, body }, ty)
    }

    pub fn global_var(name: impl Into<String>) -> Self {
        Self::new(ExprKind::GlobalVar { name: name.into() }, None)
    }

    pub fn op(name: impl Into<String>) -> Self {
        Self::new(ExprKind::Op { name: name.into() }, None)
    }

    pub fn var_name(&self) -> Option<&str> {
        match self.kind() {
            ExprKind::Var { name } => Some(name),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionNode> {
        match self.kind() {
            ExprKind::Function(function) => Some(function),
            _ => None,
        }
    }
}

/// Binds named host tensors into `func` by replacing the matching parameters
/// with embedded constants and dropping them from the parameter list.
///
/// Bound names that match more than one parameter are rejected; bound names
/// that match nothing are ignored.
pub fn bind_params(func: &Expr, bindings: &BTreeMap<String, TensorData>) -> Result<Expr> {
    let function = func
        .as_function()
        .ok_or(CompileError::UnsupportedVariant {
            kind: func.kind_name(),
            context: "parameter binding",
        })?;

    let mut by_name: HashMap<&str, &Expr> = HashMap::new();
    let mut repeated: HashSet<&str> = HashSet::new();
    for param in &function.params {
        let name = param.var_name().ok_or(CompileError::UnsupportedVariant {
            kind: param.kind_name(),
            context: "function parameter",
        })?;
        if by_name.insert(name, param).is_some() {
            repeated.insert(name);
        }
    }

    let mut substitutions: HashMap<ExprAddr, Expr> = HashMap::new();
    for (name, data) in bindings {
        let Some(param) = by_name.get(name.as_str()) else {
            continue;
        };
        if repeated.contains(name.as_str()) {
            return Err(CompileError::NameCollision { name: name.clone() });
        }
        substitutions.insert(param.addr(), Expr::constant(data.clone()));
    }

    let mut binder = ParamBinder {
        memo: HashMap::new(),
        substitutions,
    };
    let body = binder.visit(&function.body)?;
    let params = function
        .params
        .iter()
        .filter(|param| !binder.substitutions.contains_key(&param.addr()))
        .cloned()
        .collect();
    Ok(Expr::function(params, body, function.attrs.clone()))
}

struct ParamBinder {
    memo: HashMap<ExprAddr, Expr>,
    substitutions: HashMap<ExprAddr, Expr>,
}

impl MemoTranslate for ParamBinder {
    type Output = Expr;

    fn memo(&mut self) -> &mut HashMap<ExprAddr, Expr> {
        &mut self.memo
    }

    fn translate(&mut self, expr: &Expr) -> Result<Expr> {
        if let Some(replacement) = self.substitutions.get(&expr.addr()) {
            return Ok(replacement.clone());
        }
        match expr.kind() {
            ExprKind::Tuple(fields) => {
                let rebuilt = fields
                    .iter()
                    .map(|field| self.visit(field))
                    .collect::<Result<Vec<_>>>()?;
                if rebuilt.iter().zip(fields).all(|(new, old)| new == old) {
                    Ok(expr.clone())
                } else {
                    Expr::tuple(rebuilt)
                }
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let rebuilt = self.visit(tuple)?;
                if rebuilt == *tuple {
                    Ok(expr.clone())
                } else {
                    Expr::tuple_get_item(rebuilt, *index)
                }
            }
            ExprKind::Call { op, args } => {
                let rebuilt = args
                    .iter()
                    .map(|arg| self.visit(arg))
                    .collect::<Result<Vec<_>>>()?;
                if rebuilt.iter().zip(args).all(|(new, old)| new == old) {
                    Ok(expr.clone())
                } else {
                    Ok(Expr::call(
                        op.clone(),
                        rebuilt,
                        expr.checked_type()?.clone(),
                    ))
                }
            }
            ExprKind::Let { var, value, body } => {
                let value = self.visit(value)?;
                let body = self.visit(body)?;
                Ok(Expr::let_(var.clone(), value, body))
            }
            _ => Ok(expr.clone()),
        }
    }
}
