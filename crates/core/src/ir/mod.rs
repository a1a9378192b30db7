//! Lowering MQL query statements to IR.
//!
//! The IR is what the backend code generator consumes: a small plan tree
//! with constants folded, parameters numbered, and the result type fully
//! resolved (including view shapes for object results).

use std::collections::HashMap;

use uuid::Uuid;

use meridiandb_schema::ids;
use meridiandb_schema::{ObjectData, PointerKind, QualName, SchemaView};
use meridiandb_wire::descriptor::{ShapePointer, TypeExpr, ViewShapeMetadata, ViewShapes};
use meridiandb_wire::Cardinality;

use crate::dbstate::Modaliases;
use crate::error::{CompilerError, QueryError, Result, Span};
use crate::mql::ast::{
    BinOpKind, Expr, Literal, QueryStmt, ShapeElementAst, TypeName,
};

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub modaliases: Modaliases,
    pub implicit_tid_in_shapes: bool,
    pub implicit_tname_in_shapes: bool,
    pub implicit_id_in_shapes: bool,
    pub constant_folding: bool,
    pub json_parameters: bool,
    pub implicit_limit: u64,
    pub allow_writing_protected_pointers: bool,
    pub apply_query_rewrites: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            modaliases: crate::dbstate::default_modaliases(),
            implicit_tid_in_shapes: false,
            implicit_tname_in_shapes: false,
            implicit_id_in_shapes: false,
            constant_folding: true,
            json_parameters: false,
            implicit_limit: 0,
            allow_writing_protected_pointers: false,
            apply_query_rewrites: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrParam {
    pub name: String,
    pub ty: TypeExpr,
    pub required: bool,
    /// Element type id when the parameter is an array.
    pub array_element_type_id: Option<Uuid>,
}

/// A lowered value expression with parameters numbered.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    IntConst(i64),
    FloatConst(f64),
    StrConst(String),
    BoolConst(bool),
    Param { index: usize, ty: TypeExpr },
    Tuple(Vec<ValueExpr>),
    NamedTuple(Vec<(String, ValueExpr)>),
    Array(Vec<ValueExpr>),
    Set(Vec<ValueExpr>),
    FuncCall { name: String, args: Vec<ValueExpr> },
    BinOp {
        op: BinOpKind,
        lhs: Box<ValueExpr>,
        rhs: Box<ValueExpr>,
    },
    /// `.field` reference, resolved against the enclosing object.
    FieldRef(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSel {
    pub name: String,
    pub is_link: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    SelectValue {
        expr: ValueExpr,
    },
    SelectShape {
        type_name: QualName,
        type_id: Uuid,
        fields: Vec<FieldSel>,
        filter: Option<ValueExpr>,
        limit: Option<u64>,
    },
    Insert {
        type_name: QualName,
        type_id: Uuid,
        assignments: Vec<(String, ValueExpr)>,
    },
    Update {
        type_name: QualName,
        type_id: Uuid,
        filter: Option<ValueExpr>,
        assignments: Vec<(String, ValueExpr)>,
    },
    Delete {
        type_name: QualName,
        type_id: Uuid,
        filter: Option<ValueExpr>,
    },
}

#[derive(Debug, Clone)]
pub struct Ir {
    pub plan: Plan,
    pub stype: TypeExpr,
    pub view_shapes: ViewShapes,
    pub view_shapes_metadata: ViewShapeMetadata,
    pub cardinality: Cardinality,
    pub params: Vec<IrParam>,
    pub has_dml: bool,
    pub json_parameters: bool,
}

impl Ir {
    pub fn is_single(&self) -> bool {
        self.cardinality.is_single()
    }
}

/// Resolve a (possibly unqualified) name against the module aliases.
pub fn resolve_name(name: &str, modaliases: &Modaliases, _span: Span) -> Result<QualName> {
    if let Some((alias, local)) = name.rsplit_once("::") {
        // A leading alias segment resolves through the alias map.
        let module = modaliases
            .get(&Some(alias.to_string()))
            .cloned()
            .unwrap_or_else(|| alias.to_string());
        return Ok(QualName::new(module, local));
    }
    let module = modaliases
        .get(&None)
        .cloned()
        .unwrap_or_else(|| crate::dbstate::DEFAULT_MODULE.to_string());
    Ok(QualName::new(module, name))
}

/// Resolve a scalar-or-collection type name to a type expression.
pub fn resolve_type(
    ty: &TypeName,
    schema: &SchemaView,
    modaliases: &Modaliases,
    span: Span,
) -> Result<TypeExpr> {
    match ty.name.as_str() {
        "array" => {
            let element = ty.element.as_deref().ok_or_else(|| {
                CompilerError::query_at("array type requires an element type", span)
            })?;
            let inner = resolve_type(element, schema, modaliases, span)?;
            return Ok(TypeExpr::Array(Box::new(inner)));
        }
        "range" => {
            let element = ty.element.as_deref().ok_or_else(|| {
                CompilerError::query_at("range type requires an element type", span)
            })?;
            let inner = resolve_type(element, schema, modaliases, span)?;
            return Ok(TypeExpr::Range(Box::new(inner)));
        }
        _ => {}
    }

    // Bare scalar names fall through to `std`.
    let qual = if ty.name.contains("::") {
        resolve_name(&ty.name, modaliases, span)?
    } else if ids::known_type_id(&ty.name).is_some() {
        QualName::std(&ty.name)
    } else {
        resolve_name(&ty.name, modaliases, span)?
    };

    let obj = schema
        .get_by_name(&qual)
        .or_else(|| schema.std_scalar(&ty.name))
        .ok_or_else(|| CompilerError::query_at(format!("unknown type {qual}"), span))?;

    match &obj.data {
        ObjectData::ScalarType(_) => Ok(TypeExpr::Scalar(obj.id)),
        ObjectData::ObjectType(_) => Ok(TypeExpr::Object(obj.id)),
        _ => Err(CompilerError::query_at(
            format!("{qual} is not a type"),
            span,
        )),
    }
}

struct Lowerer<'a> {
    schema: &'a SchemaView,
    options: &'a CompilerOptions,
    params: Vec<IrParam>,
    param_index: HashMap<String, usize>,
}

impl<'a> Lowerer<'a> {
    fn new(schema: &'a SchemaView, options: &'a CompilerOptions) -> Self {
        Self {
            schema,
            options,
            params: Vec::new(),
            param_index: HashMap::new(),
        }
    }

    fn record_param(
        &mut self,
        name: &str,
        ty: TypeExpr,
        required: bool,
        span: Span,
    ) -> Result<usize> {
        if let Some(&idx) = self.param_index.get(name) {
            if self.params[idx].ty != ty {
                return Err(CompilerError::query_at(
                    format!("parameter ${name} used with conflicting type casts"),
                    span,
                ));
            }
            return Ok(idx);
        }
        let array_element_type_id = match &ty {
            TypeExpr::Array(el) => match el.as_ref() {
                TypeExpr::Scalar(id) => Some(*id),
                _ => None,
            },
            _ => None,
        };
        let idx = self.params.len();
        self.params.push(IrParam {
            name: name.to_string(),
            ty,
            required,
            array_element_type_id,
        });
        self.param_index.insert(name.to_string(), idx);
        Ok(idx)
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<(ValueExpr, TypeExpr, Cardinality)> {
        match expr {
            Expr::Literal(lit, _) => Ok(match lit {
                Literal::Int(v) => (
                    ValueExpr::IntConst(*v),
                    TypeExpr::Scalar(ids::INT64_TYPE_ID),
                    Cardinality::One,
                ),
                Literal::Float(v) => (
                    ValueExpr::FloatConst(*v),
                    TypeExpr::Scalar(ids::FLOAT64_TYPE_ID),
                    Cardinality::One,
                ),
                Literal::Str(v) => (
                    ValueExpr::StrConst(v.clone()),
                    TypeExpr::Scalar(ids::STR_TYPE_ID),
                    Cardinality::One,
                ),
                Literal::Bool(v) => (
                    ValueExpr::BoolConst(*v),
                    TypeExpr::Scalar(ids::BOOL_TYPE_ID),
                    Cardinality::One,
                ),
            }),

            Expr::Param { name, span } => Err(CompilerError::query_at(
                format!("missing a type cast before the parameter ${name}"),
                *span,
            )),

            Expr::Cast {
                ty,
                optional,
                expr,
                span,
            } => {
                let target = resolve_type(ty, self.schema, &self.options.modaliases, *span)?;
                if let Expr::Param { name, .. } = expr.as_ref() {
                    let index =
                        self.record_param(name, target.clone(), !*optional, *span)?;
                    let cardinality = if *optional {
                        Cardinality::AtMostOne
                    } else {
                        Cardinality::One
                    };
                    return Ok((
                        ValueExpr::Param {
                            index,
                            ty: target.clone(),
                        },
                        target,
                        cardinality,
                    ));
                }
                let (inner, _, cardinality) = self.lower_expr(expr)?;
                Ok((inner, target, cardinality))
            }

            Expr::Tuple(elements, _) => {
                let mut values = Vec::with_capacity(elements.len());
                let mut types = Vec::with_capacity(elements.len());
                for el in elements {
                    let (v, t, _) = self.lower_expr(el)?;
                    values.push(v);
                    types.push(t);
                }
                Ok((
                    ValueExpr::Tuple(values),
                    TypeExpr::Tuple(types),
                    Cardinality::One,
                ))
            }

            Expr::NamedTuple(fields, _) => {
                let mut values = Vec::with_capacity(fields.len());
                let mut types = Vec::with_capacity(fields.len());
                for (name, el) in fields {
                    let (v, t, _) = self.lower_expr(el)?;
                    values.push((name.clone(), v));
                    types.push((name.clone().into_boxed_str(), t));
                }
                Ok((
                    ValueExpr::NamedTuple(values),
                    TypeExpr::NamedTuple(types),
                    Cardinality::One,
                ))
            }

            Expr::Array(elements, span) => {
                let mut values = Vec::with_capacity(elements.len());
                let mut element_ty = None;
                for el in elements {
                    let (v, t, _) = self.lower_expr(el)?;
                    match &element_ty {
                        None => element_ty = Some(t),
                        Some(prev) if *prev != t => {
                            return Err(CompilerError::query_at(
                                "array elements must have a uniform type",
                                *span,
                            ))
                        }
                        _ => {}
                    }
                    values.push(v);
                }
                let element_ty =
                    element_ty.unwrap_or(TypeExpr::Scalar(ids::STR_TYPE_ID));
                Ok((
                    ValueExpr::Array(values),
                    TypeExpr::Array(Box::new(element_ty)),
                    Cardinality::One,
                ))
            }

            Expr::SetLit(elements, span) => {
                let mut values = Vec::with_capacity(elements.len());
                let mut element_ty = None;
                for el in elements {
                    let (v, t, _) = self.lower_expr(el)?;
                    match &element_ty {
                        None => element_ty = Some(t),
                        Some(prev) if *prev != t => {
                            return Err(CompilerError::query_at(
                                "set elements must have a uniform type",
                                *span,
                            ))
                        }
                        _ => {}
                    }
                    values.push(v);
                }
                let element_ty =
                    element_ty.unwrap_or(TypeExpr::Scalar(ids::INT64_TYPE_ID));
                let cardinality = match values.len() {
                    0 => Cardinality::AtMostOne,
                    1 => Cardinality::One,
                    _ => Cardinality::AtLeastOne,
                };
                Ok((ValueExpr::Set(values), element_ty, cardinality))
            }

            Expr::FuncCall { name, args, span } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let (v, _, _) = self.lower_expr(arg)?;
                    values.push(v);
                }
                let ret = match name.as_str() {
                    "to_json" => TypeExpr::Scalar(ids::JSON_TYPE_ID),
                    "count" => TypeExpr::Scalar(ids::INT64_TYPE_ID),
                    "uuid_generate_v4" => TypeExpr::Scalar(ids::UUID_TYPE_ID),
                    other => {
                        return Err(CompilerError::query_at(
                            format!("unknown function {other}()"),
                            *span,
                        ))
                    }
                };
                Ok((
                    ValueExpr::FuncCall {
                        name: name.clone(),
                        args: values,
                    },
                    ret,
                    Cardinality::One,
                ))
            }

            Expr::BinOp { op, lhs, rhs, span } => {
                let (lv, lt, _) = self.lower_expr(lhs)?;
                let (rv, _, _) = self.lower_expr(rhs)?;
                if self.options.constant_folding {
                    if let Some(folded) = fold_binop(*op, &lv, &rv) {
                        let ty = match &folded {
                            ValueExpr::IntConst(_) => TypeExpr::Scalar(ids::INT64_TYPE_ID),
                            ValueExpr::FloatConst(_) => TypeExpr::Scalar(ids::FLOAT64_TYPE_ID),
                            ValueExpr::BoolConst(_) => TypeExpr::Scalar(ids::BOOL_TYPE_ID),
                            ValueExpr::StrConst(_) => TypeExpr::Scalar(ids::STR_TYPE_ID),
                            _ => lt.clone(),
                        };
                        return Ok((folded, ty, Cardinality::One));
                    }
                }
                let ty = match op {
                    BinOpKind::Eq | BinOpKind::Lt | BinOpKind::Gt => {
                        TypeExpr::Scalar(ids::BOOL_TYPE_ID)
                    }
                    _ => lt,
                };
                let _ = span;
                Ok((
                    ValueExpr::BinOp {
                        op: *op,
                        lhs: Box::new(lv),
                        rhs: Box::new(rv),
                    },
                    ty,
                    Cardinality::One,
                ))
            }

            Expr::Path { name, span } => {
                if let Some(field) = name.strip_prefix('.') {
                    return Ok((
                        ValueExpr::FieldRef(field.to_string()),
                        TypeExpr::Scalar(ids::STR_TYPE_ID),
                        Cardinality::One,
                    ));
                }
                Err(CompilerError::query_at(
                    format!("expected an expression, found bare name {name:?}"),
                    *span,
                ))
            }

            Expr::Shape { span, .. } => Err(CompilerError::query_at(
                "shapes are only valid at the top level of SELECT",
                *span,
            )),
        }
    }
}

fn fold_binop(op: BinOpKind, lhs: &ValueExpr, rhs: &ValueExpr) -> Option<ValueExpr> {
    match (lhs, rhs) {
        (ValueExpr::IntConst(a), ValueExpr::IntConst(b)) => Some(match op {
            BinOpKind::Add => ValueExpr::IntConst(a.checked_add(*b)?),
            BinOpKind::Sub => ValueExpr::IntConst(a.checked_sub(*b)?),
            BinOpKind::Mul => ValueExpr::IntConst(a.checked_mul(*b)?),
            BinOpKind::Div => ValueExpr::IntConst(a.checked_div(*b)?),
            BinOpKind::Eq => ValueExpr::BoolConst(a == b),
            BinOpKind::Lt => ValueExpr::BoolConst(a < b),
            BinOpKind::Gt => ValueExpr::BoolConst(a > b),
        }),
        (ValueExpr::StrConst(a), ValueExpr::StrConst(b)) => Some(match op {
            BinOpKind::Add => ValueExpr::StrConst(format!("{a}{b}")),
            BinOpKind::Eq => ValueExpr::BoolConst(a == b),
            _ => return None,
        }),
        _ => None,
    }
}

/// Build the output shape of an object-type select and record it in the
/// view shapes.
fn build_shape(
    schema: &SchemaView,
    options: &CompilerOptions,
    type_name: &QualName,
    type_id: Uuid,
    elements: &[ShapeElementAst],
    shapes: &mut ViewShapes,
    metadata: &mut ViewShapeMetadata,
    span: Span,
) -> Result<Vec<FieldSel>> {
    let obj = schema
        .get_by_id(type_id)
        .ok_or_else(|| CompilerError::query_at(format!("unknown type {type_name}"), span))?;
    let objtype = obj.as_object_type().ok_or_else(|| {
        CompilerError::query_at(format!("{type_name} is not an object type"), span)
    })?;

    let mut pointers: Vec<ShapePointer> = Vec::new();
    let mut fields = Vec::new();

    // Implicit fields come first; "id" participates in the type-id of the
    // shape through the metadata flag.
    if options.implicit_tid_in_shapes {
        pointers.push(ShapePointer {
            name: "__tid__".into(),
            target: TypeExpr::uuid(),
            cardinality: Cardinality::One,
            is_link: false,
            is_linkprop: false,
        });
        fields.push(FieldSel {
            name: "__tid__".to_string(),
            is_link: false,
        });
    }
    if options.implicit_tname_in_shapes {
        pointers.push(ShapePointer {
            name: "__tname__".into(),
            target: TypeExpr::str(),
            cardinality: Cardinality::One,
            is_link: false,
            is_linkprop: false,
        });
        fields.push(FieldSel {
            name: "__tname__".to_string(),
            is_link: false,
        });
    }
    let has_explicit_id = elements.iter().any(|el| el.name == "id");
    if options.implicit_id_in_shapes && !has_explicit_id {
        metadata.has_implicit_id.insert(type_id);
        pointers.push(ShapePointer {
            name: "id".into(),
            target: TypeExpr::uuid(),
            cardinality: Cardinality::One,
            is_link: false,
            is_linkprop: false,
        });
        fields.push(FieldSel {
            name: "id".to_string(),
            is_link: false,
        });
    }

    if has_explicit_id {
        pointers.push(ShapePointer {
            name: "id".into(),
            target: TypeExpr::uuid(),
            cardinality: Cardinality::One,
            is_link: false,
            is_linkprop: false,
        });
        fields.push(FieldSel {
            name: "id".to_string(),
            is_link: false,
        });
    }

    // Explicit fields follow the natural pointer order of the type, not
    // the order they were written in.
    let selected: HashMap<&str, &ShapeElementAst> =
        elements.iter().map(|el| (el.name.as_str(), el)).collect();
    for (ptr_name, ptr) in objtype.pointers.iter() {
        let Some(el) = selected.get(&**ptr_name) else {
            continue;
        };
        let cardinality = Cardinality::from_pointer(ptr.required, ptr.multi);
        let is_link = ptr.kind == PointerKind::Link;
        let target = if is_link {
            let target_obj = schema.get_by_id(ptr.target).ok_or_else(|| {
                CompilerError::query_at(
                    format!("link {ptr_name} of {type_name} has an unknown target"),
                    span,
                )
            })?;
            if let Some(nested) = &el.nested {
                build_shape(
                    schema,
                    options,
                    &target_obj.name,
                    target_obj.id,
                    nested,
                    shapes,
                    metadata,
                    span,
                )?;
            } else {
                // A link without an explicit subshape exposes its id.
                shapes.shapes.entry(target_obj.id).or_insert_with(|| {
                    vec![ShapePointer {
                        name: "id".into(),
                        target: TypeExpr::uuid(),
                        cardinality: Cardinality::One,
                        is_link: false,
                        is_linkprop: false,
                    }]
                });
            }
            TypeExpr::Object(ptr.target)
        } else {
            TypeExpr::Scalar(ptr.target)
        };
        pointers.push(ShapePointer {
            name: ptr_name.clone(),
            target,
            cardinality,
            is_link,
            is_linkprop: false,
        });
        fields.push(FieldSel {
            name: ptr_name.to_string(),
            is_link,
        });
    }

    // Anything the user asked for that is not a pointer of the type.
    for el in elements {
        if el.name != "id" && objtype.pointer(&el.name).is_none() {
            return Err(CompilerError::query_at(
                format!("{type_name} has no pointer {:?}", el.name),
                span,
            ));
        }
    }
    shapes.shapes.insert(type_id, pointers);
    Ok(fields)
}

/// Lower a query statement to IR.
pub fn compile_ast_to_ir(
    stmt: &QueryStmt,
    schema: &SchemaView,
    options: &CompilerOptions,
) -> Result<Ir> {
    let mut lowerer = Lowerer::new(schema, options);
    let mut view_shapes = ViewShapes::default();
    let mut metadata = ViewShapeMetadata::default();

    let (plan, stype, cardinality, has_dml) = match stmt {
        QueryStmt::Select {
            expr,
            filter,
            limit,
            span,
        } => {
            let shape_parts: Option<(&str, &[ShapeElementAst], Span)> = match expr {
                Expr::Shape {
                    type_name,
                    elements,
                    span,
                } => Some((type_name.as_str(), elements.as_slice(), *span)),
                Expr::Path { name, span } if !name.starts_with('.') => {
                    Some((name.as_str(), &[], *span))
                }
                _ => None,
            };
            if let Some((type_name, elements, shape_span)) = shape_parts {
                let qual = resolve_name(type_name, &options.modaliases, shape_span)?;
                let obj = schema.get_by_name(&qual).ok_or_else(|| {
                    CompilerError::query_at(format!("unknown type {qual}"), shape_span)
                })?;
                let type_id = obj.id;
                let fields = build_shape(
                    schema,
                    options,
                    &qual,
                    type_id,
                    elements,
                    &mut view_shapes,
                    &mut metadata,
                    shape_span,
                )?;
                let filter_ir = filter
                    .as_ref()
                    .map(|f| lowerer.lower_expr(f))
                    .transpose()?
                    .map(|(v, _, _)| v);
                let explicit_limit = match limit {
                    Some(Expr::Literal(Literal::Int(n), _)) if *n >= 0 => Some(*n as u64),
                    Some(other) => {
                        return Err(CompilerError::query_at(
                            "LIMIT must be a non-negative integer literal",
                            other.span(),
                        ))
                    }
                    None => None,
                };
                let limit = match (explicit_limit, options.implicit_limit) {
                    (Some(e), 0) => Some(e),
                    (Some(e), i) => Some(e.min(i)),
                    (None, 0) => None,
                    (None, i) => Some(i),
                };
                let cardinality = match limit {
                    Some(0) => Cardinality::AtMostOne,
                    Some(1) => Cardinality::AtMostOne,
                    _ => Cardinality::Many,
                };
                (
                    Plan::SelectShape {
                        type_name: qual,
                        type_id,
                        fields,
                        filter: filter_ir,
                        limit,
                    },
                    TypeExpr::Object(type_id),
                    cardinality,
                    false,
                )
            } else {
                let (value, ty, cardinality) = lowerer.lower_expr(expr)?;
                let _ = span;
                (Plan::SelectValue { expr: value }, ty, cardinality, false)
            }
        }

        QueryStmt::Insert {
            type_name,
            assignments,
            span,
        } => {
            let qual = resolve_name(type_name, &options.modaliases, *span)?;
            let obj = schema
                .get_by_name(&qual)
                .ok_or_else(|| CompilerError::query_at(format!("unknown type {qual}"), *span))?;
            let type_id = obj.id;
            let objtype = obj.as_object_type().ok_or_else(|| {
                CompilerError::query_at(format!("{qual} is not an object type"), *span)
            })?;
            let mut lowered = Vec::with_capacity(assignments.len());
            for (field, value) in assignments {
                if objtype.pointer(field).is_none() {
                    return Err(CompilerError::query_at(
                        format!("{qual} has no pointer {field:?}"),
                        *span,
                    ));
                }
                if field == "id" && !options.allow_writing_protected_pointers {
                    return Err(CompilerError::query_at(
                        "cannot assign to protected pointer 'id'",
                        *span,
                    ));
                }
                let (v, _, _) = lowerer.lower_expr(value)?;
                lowered.push((field.clone(), v));
            }
            build_shape(
                schema,
                options,
                &qual,
                type_id,
                &[],
                &mut view_shapes,
                &mut metadata,
                *span,
            )?;
            if !options.implicit_id_in_shapes {
                // DML always returns ids even without the implicit gate.
                metadata.has_implicit_id.insert(type_id);
                view_shapes.shapes.entry(type_id).or_default().push(ShapePointer {
                    name: "id".into(),
                    target: TypeExpr::uuid(),
                    cardinality: Cardinality::One,
                    is_link: false,
                    is_linkprop: false,
                });
            }
            (
                Plan::Insert {
                    type_name: qual,
                    type_id,
                    assignments: lowered,
                },
                TypeExpr::Object(type_id),
                Cardinality::One,
                true,
            )
        }

        QueryStmt::Update {
            type_name,
            filter,
            assignments,
            span,
        } => {
            let qual = resolve_name(type_name, &options.modaliases, *span)?;
            let obj = schema
                .get_by_name(&qual)
                .ok_or_else(|| CompilerError::query_at(format!("unknown type {qual}"), *span))?;
            let type_id = obj.id;
            let mut lowered = Vec::with_capacity(assignments.len());
            for (field, value) in assignments {
                let (v, _, _) = lowerer.lower_expr(value)?;
                lowered.push((field.clone(), v));
            }
            let filter_ir = filter
                .as_ref()
                .map(|f| lowerer.lower_expr(f))
                .transpose()?
                .map(|(v, _, _)| v);
            build_shape(
                schema,
                options,
                &qual,
                type_id,
                &[],
                &mut view_shapes,
                &mut metadata,
                *span,
            )?;
            (
                Plan::Update {
                    type_name: qual,
                    type_id,
                    filter: filter_ir,
                    assignments: lowered,
                },
                TypeExpr::Object(type_id),
                Cardinality::Many,
                true,
            )
        }

        QueryStmt::Delete {
            type_name,
            filter,
            span,
        } => {
            let qual = resolve_name(type_name, &options.modaliases, *span)?;
            let obj = schema
                .get_by_name(&qual)
                .ok_or_else(|| CompilerError::query_at(format!("unknown type {qual}"), *span))?;
            let type_id = obj.id;
            let filter_ir = filter
                .as_ref()
                .map(|f| lowerer.lower_expr(f))
                .transpose()?
                .map(|(v, _, _)| v);
            build_shape(
                schema,
                options,
                &qual,
                type_id,
                &[],
                &mut view_shapes,
                &mut metadata,
                *span,
            )?;
            (
                Plan::Delete {
                    type_name: qual,
                    type_id,
                    filter: filter_ir,
                },
                TypeExpr::Object(type_id),
                Cardinality::Many,
                true,
            )
        }
    };

    let mut ir = Ir {
        plan,
        stype,
        view_shapes,
        view_shapes_metadata: metadata,
        cardinality,
        params: lowerer.params,
        has_dml,
        json_parameters: options.json_parameters,
    };
    renumber_params(&mut ir);
    Ok(ir)
}

/// Parameters extracted by source normalization (reserved `__p` prefix)
/// must take positions after every user parameter, so that the user-facing
/// argument list is a prefix of the backend one.
fn renumber_params(ir: &mut Ir) {
    let is_extracted = |p: &IrParam| p.name.starts_with("__p");
    if ir.params.iter().all(|p| !is_extracted(p)) {
        return;
    }
    let mut order: Vec<usize> = (0..ir.params.len()).collect();
    order.sort_by_key(|&i| (is_extracted(&ir.params[i]), i));
    let mut old_to_new = vec![0usize; ir.params.len()];
    for (new, &old) in order.iter().enumerate() {
        old_to_new[old] = new;
    }
    let mut params = Vec::with_capacity(ir.params.len());
    for &old in &order {
        params.push(ir.params[old].clone());
    }
    ir.params = params;

    fn remap(expr: &mut ValueExpr, map: &[usize]) {
        match expr {
            ValueExpr::Param { index, .. } => *index = map[*index],
            ValueExpr::Tuple(els) | ValueExpr::Array(els) | ValueExpr::Set(els) => {
                els.iter_mut().for_each(|e| remap(e, map))
            }
            ValueExpr::NamedTuple(els) => els.iter_mut().for_each(|(_, e)| remap(e, map)),
            ValueExpr::FuncCall { args, .. } => args.iter_mut().for_each(|e| remap(e, map)),
            ValueExpr::BinOp { lhs, rhs, .. } => {
                remap(lhs, map);
                remap(rhs, map);
            }
            _ => {}
        }
    }
    match &mut ir.plan {
        Plan::SelectValue { expr } => remap(expr, &old_to_new),
        Plan::SelectShape { filter, .. } => {
            if let Some(f) = filter {
                remap(f, &old_to_new);
            }
        }
        Plan::Insert { assignments, .. } => {
            assignments.iter_mut().for_each(|(_, e)| remap(e, &old_to_new))
        }
        Plan::Update {
            filter,
            assignments,
            ..
        } => {
            if let Some(f) = filter {
                remap(f, &old_to_new);
            }
            assignments.iter_mut().for_each(|(_, e)| remap(e, &old_to_new));
        }
        Plan::Delete { filter, .. } => {
            if let Some(f) = filter {
                remap(f, &old_to_new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridiandb_schema::{stdlib, ObjectType, Pointer, SchemaObject, SchemaSnapshot};
    use crate::mql::ast::Statement;
    use crate::mql::parser::parse;

    fn fixture_schema() -> SchemaView {
        let user_id = Uuid::from_u128(0xa1);
        let mut t = ObjectType::default();
        for (name, target, required, multi, kind) in [
            ("name", ids::STR_TYPE_ID, true, false, PointerKind::Property),
            ("age", ids::INT64_TYPE_ID, false, false, PointerKind::Property),
            ("friends", user_id, false, true, PointerKind::Link),
        ] {
            t.pointers.insert(
                name.into(),
                Pointer {
                    id: Uuid::new_v4(),
                    name: name.into(),
                    kind,
                    target,
                    required,
                    multi,
                },
            );
        }
        let user = SchemaSnapshot::new()
            .inserted(SchemaObject::new(
                user_id,
                "default::User".parse().unwrap(),
                ObjectData::ObjectType(t),
            ))
            .unwrap();
        SchemaView::new(stdlib::std_schema().clone(), user, Default::default())
    }

    fn lower(text: &str, options: &CompilerOptions) -> Ir {
        let Statement::Query(q) = parse(text).unwrap() else {
            panic!("expected query");
        };
        compile_ast_to_ir(&q, &fixture_schema(), options).unwrap()
    }

    #[test]
    fn literal_select_is_single() {
        let ir = lower("SELECT 1", &CompilerOptions::default());
        assert_eq!(ir.cardinality, Cardinality::One);
        assert!(!ir.has_dml);
        assert_eq!(ir.stype, TypeExpr::Scalar(ids::INT64_TYPE_ID));
    }

    #[test]
    fn constant_folding_is_gated() {
        let folded = lower("SELECT 1 + 2", &CompilerOptions::default());
        assert_eq!(
            folded.plan,
            Plan::SelectValue {
                expr: ValueExpr::IntConst(3)
            }
        );
        let unfolded = lower(
            "SELECT 1 + 2",
            &CompilerOptions {
                constant_folding: false,
                ..Default::default()
            },
        );
        assert!(matches!(
            unfolded.plan,
            Plan::SelectValue {
                expr: ValueExpr::BinOp { .. }
            }
        ));
    }

    #[test]
    fn shape_select_is_many_and_builds_view_shapes() {
        let ir = lower("SELECT User { name, age }", &CompilerOptions::default());
        assert_eq!(ir.cardinality, Cardinality::Many);
        let TypeExpr::Object(tid) = ir.stype else {
            panic!("expected object result");
        };
        let shape = &ir.view_shapes.shapes[&tid];
        let names: Vec<_> = shape.iter().map(|p| &*p.name).collect();
        assert_eq!(names, vec!["name", "age"]);
    }

    #[test]
    fn implicit_fields_obey_the_options() {
        let opts = CompilerOptions {
            implicit_id_in_shapes: true,
            implicit_tname_in_shapes: true,
            ..Default::default()
        };
        let ir = lower("SELECT User { name }", &opts);
        let TypeExpr::Object(tid) = ir.stype else {
            panic!("expected object result");
        };
        let names: Vec<_> = ir.view_shapes.shapes[&tid]
            .iter()
            .map(|p| &*p.name)
            .collect();
        assert_eq!(names, vec!["__tname__", "id", "name"]);
        assert!(ir.view_shapes_metadata.has_implicit_id.contains(&tid));
    }

    #[test]
    fn params_require_casts_and_get_numbered() {
        let ir = lower(
            "SELECT (<str>$name, <optional int64>$age)",
            &CompilerOptions::default(),
        );
        assert_eq!(ir.params.len(), 2);
        assert_eq!(ir.params[0].name, "name");
        assert!(ir.params[0].required);
        assert!(!ir.params[1].required);

        let Statement::Query(q) = parse("SELECT $oops").unwrap() else {
            panic!();
        };
        let err =
            compile_ast_to_ir(&q, &fixture_schema(), &CompilerOptions::default()).unwrap_err();
        assert!(err.to_string().contains("type cast"));
    }

    #[test]
    fn array_params_carry_element_type() {
        let ir = lower("SELECT <array<str>>$tags", &CompilerOptions::default());
        assert_eq!(ir.params[0].array_element_type_id, Some(ids::STR_TYPE_ID));
    }

    #[test]
    fn insert_is_single_dml() {
        let ir = lower("INSERT User { name := 'a' }", &CompilerOptions::default());
        assert_eq!(ir.cardinality, Cardinality::One);
        assert!(ir.has_dml);
    }

    #[test]
    fn unknown_pointer_is_a_query_error() {
        let Statement::Query(q) = parse("SELECT User { bogus }").unwrap() else {
            panic!();
        };
        let err =
            compile_ast_to_ir(&q, &fixture_schema(), &CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompilerError::Query(_)));
        assert!(err.span().is_some());
    }

    #[test]
    fn implicit_limit_is_applied() {
        let opts = CompilerOptions {
            implicit_limit: 100,
            ..Default::default()
        };
        let ir = lower("SELECT User { name }", &opts);
        let Plan::SelectShape { limit, .. } = ir.plan else {
            panic!();
        };
        assert_eq!(limit, Some(100));
    }
}
