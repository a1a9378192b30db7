//! The type descriptor engine.
//!
//! A descriptor is a flat, self-contained byte buffer describing one type:
//! a sequence of nodes, each a single-byte tag, a 16-byte type id, and a
//! tag-specific payload. Nodes reference earlier nodes by ordinal (their
//! position in the buffer), never by pointer, which is what lets cyclic
//! schemas serialize: the ordinal map provides the back-edges.
//!
//! Ids are deterministic. Built-in scalars use their schema-assigned known
//! ids; composite ids are UUIDv5 over a canonical string encoding of the
//! structure, so equal structures yield equal ids in every process.

use std::collections::HashMap;

use indexmap::IndexMap;
use itertools::Itertools;
use thiserror::Error;
use uuid::Uuid;

use meridiandb_schema::ids::{
    self, EMPTY_TUPLE_ID, NULL_TYPE_ID, STR_TYPE_ID, UUID_TYPE_ID,
};
use meridiandb_schema::SchemaView;

use crate::buffer::{BufReader, BufWriter, DecodeError};
use crate::cardinality::{Cardinality, ProtocolVersion};

pub mod tags {
    pub const SET: u8 = 0x00;
    pub const SHAPE: u8 = 0x01;
    pub const BASE_SCALAR: u8 = 0x02;
    pub const SCALAR: u8 = 0x03;
    pub const TUPLE: u8 = 0x04;
    pub const NAMED_TUPLE: u8 = 0x05;
    pub const ARRAY: u8 = 0x06;
    pub const ENUM: u8 = 0x07;
    pub const INPUT_SHAPE: u8 = 0x08;
    pub const RANGE: u8 = 0x09;
    pub const ANNO_TYPENAME: u8 = 0xff;
}

/// Shape element flag bits.
pub const FLAG_IMPLICIT: u32 = 1 << 0;
pub const FLAG_LINKPROP: u32 = 1 << 1;
pub const FLAG_LINK: u32 = 1 << 2;

/// The descriptor of "no data": an empty buffer under the null id.
pub const NULL_TYPE_DESC: &[u8] = b"";

/// The canonical empty-tuple descriptor, the default input type of a unit.
pub fn empty_tuple_descriptor() -> (Vec<u8>, Uuid) {
    let mut buf = Vec::with_capacity(19);
    buf.put_u8(tags::TUPLE);
    buf.put_uuid(EMPTY_TUPLE_ID);
    buf.put_u16(0);
    (buf, EMPTY_TUPLE_ID)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescribeError {
    #[error("cannot describe type: unknown schema type {0}")]
    UnknownType(Uuid),
    #[error("{0}")]
    Structural(String),
}

/// A type expression to describe: either a direct schema type reference or
/// a collection built over other type expressions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeExpr {
    /// A scalar schema type (base, derived, or enum), by id.
    Scalar(Uuid),
    /// An object schema type, by id; its shape comes from [`ViewShapes`].
    Object(Uuid),
    Tuple(Vec<TypeExpr>),
    NamedTuple(Vec<(Box<str>, TypeExpr)>),
    Array(Box<TypeExpr>),
    Range(Box<TypeExpr>),
}

impl TypeExpr {
    pub fn str() -> Self {
        TypeExpr::Scalar(STR_TYPE_ID)
    }

    pub fn uuid() -> Self {
        TypeExpr::Scalar(UUID_TYPE_ID)
    }
}

/// One element of an output (or input) shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapePointer {
    pub name: Box<str>,
    pub target: TypeExpr,
    pub cardinality: Cardinality,
    pub is_link: bool,
    pub is_linkprop: bool,
}

/// The shapes attached to object types in a query result.
#[derive(Debug, Clone, Default)]
pub struct ViewShapes {
    /// Elements per object type id, in natural pointer order.
    pub shapes: HashMap<Uuid, Vec<ShapePointer>>,
    /// Link properties attached to the shape's reverse link, per type id.
    pub rptr_shapes: HashMap<Uuid, Vec<ShapePointer>>,
}

#[derive(Debug, Clone, Default)]
pub struct ViewShapeMetadata {
    /// Object type ids whose shape carries an implicit `id` field.
    pub has_implicit_id: std::collections::HashSet<Uuid>,
}

#[derive(Debug, Clone, Copy)]
pub struct DescribeOptions<'a> {
    pub protocol: ProtocolVersion,
    pub follow_links: bool,
    pub inline_typenames: bool,
    pub name_filter: &'a str,
}

impl Default for DescribeOptions<'_> {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::CURRENT,
            follow_links: true,
            inline_typenames: false,
            name_filter: "",
        }
    }
}

/// A named query parameter to describe.
#[derive(Debug, Clone)]
pub struct ParamDesc {
    pub name: String,
    pub ty: TypeExpr,
    pub required: bool,
}

/// Builds descriptor buffers. Scoped to a single describe call; the buffer
/// is the result and is not retained.
pub struct DescriptorBuilder<'a> {
    schema: &'a SchemaView,
    shapes: &'a ViewShapes,
    metadata: &'a ViewShapeMetadata,
    protocol: ProtocolVersion,
    inline_typenames: bool,
    buffer: Vec<u8>,
    anno_buffer: Vec<u8>,
    /// Write-once position map: a type id is described at most once; later
    /// references resolve to the recorded ordinal.
    ordinals: IndexMap<Uuid, u16>,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(
        schema: &'a SchemaView,
        shapes: &'a ViewShapes,
        metadata: &'a ViewShapeMetadata,
        protocol: ProtocolVersion,
        inline_typenames: bool,
    ) -> Self {
        Self {
            schema,
            shapes,
            metadata,
            protocol,
            inline_typenames,
            buffer: Vec::new(),
            anno_buffer: Vec::new(),
            ordinals: IndexMap::new(),
        }
    }

    fn register(&mut self, type_id: Uuid) {
        if !self.ordinals.contains_key(&type_id) {
            let pos = self.ordinals.len() as u16;
            self.ordinals.insert(type_id, pos);
        }
    }

    fn ordinal(&self, type_id: Uuid) -> Result<u16, DescribeError> {
        self.ordinals.get(&type_id).copied().ok_or_else(|| {
            DescribeError::Structural(format!("type {type_id} referenced before description"))
        })
    }

    fn collection_type_id(
        kind: &str,
        subtypes: &[Uuid],
        element_names: Option<&[&str]>,
    ) -> Uuid {
        if kind == "tuple" && subtypes.is_empty() {
            return EMPTY_TUPLE_ID;
        }
        let mut canonical = format!("{kind}\0{}", subtypes.iter().join(":"));
        if let Some(names) = element_names {
            canonical.push('\0');
            canonical.push_str(&names.iter().join(":"));
        }
        ids::stable_type_id(&canonical)
    }

    fn object_type_id(
        base_type_id: Uuid,
        subtypes: &[Uuid],
        element_names: &[&str],
        has_implicit_fields: bool,
        link_props: Option<&[bool]>,
        links: Option<&[bool]>,
    ) -> Uuid {
        let mut canonical = format!("{base_type_id}\0{}", subtypes.iter().join(":"));
        canonical.push('\0');
        canonical.push_str(&element_names.iter().join(":"));
        canonical.push_str(&format!(
            "{has_implicit_fields};{link_props:?};{links:?}"
        ));
        ids::stable_type_id(&canonical)
    }

    fn set_type_id(base_type_id: Uuid) -> Uuid {
        ids::stable_type_id(&format!("set-of::{base_type_id}"))
    }

    fn put_shape_element_header(&mut self, flags: u32, cardinality: Cardinality) {
        if self.protocol.has_shape_cardinality() {
            self.buffer.put_u32(flags);
            self.buffer.put_u8(cardinality as u8);
        } else {
            self.buffer.put_u8(flags as u8);
        }
    }

    fn add_annotation(&mut self, type_id: Uuid, display_name: &str) {
        self.anno_buffer.put_u8(tags::ANNO_TYPENAME);
        self.anno_buffer.put_uuid(type_id);
        self.anno_buffer.put_len32_prefixed(display_name.as_bytes());
    }

    fn describe_set(&mut self, target: &TypeExpr) -> Result<Uuid, DescribeError> {
        let inner = self.describe_type(target)?;
        let set_id = Self::set_type_id(inner);
        if self.ordinals.contains_key(&set_id) {
            return Ok(set_id);
        }
        let inner_pos = self.ordinal(inner)?;
        self.buffer.put_u8(tags::SET);
        self.buffer.put_uuid(set_id);
        self.buffer.put_u16(inner_pos);
        self.register(set_id);
        Ok(set_id)
    }

    /// Describe a type, appending any not-yet-described nodes to the buffer
    /// and returning the type's id.
    pub fn describe_type(&mut self, ty: &TypeExpr) -> Result<Uuid, DescribeError> {
        self.describe_type_filtered(ty, true, "")
    }

    pub fn describe_type_filtered(
        &mut self,
        ty: &TypeExpr,
        follow_links: bool,
        name_filter: &str,
    ) -> Result<Uuid, DescribeError> {
        match ty {
            TypeExpr::Tuple(elements) => {
                let subtypes = elements
                    .iter()
                    .map(|el| self.describe_type(el))
                    .collect::<Result<Vec<_>, _>>()?;
                let type_id = Self::collection_type_id("tuple", &subtypes, None);
                if self.ordinals.contains_key(&type_id) {
                    return Ok(type_id);
                }
                let positions = subtypes
                    .iter()
                    .map(|st| self.ordinal(*st))
                    .collect::<Result<Vec<_>, _>>()?;
                self.buffer.put_u8(tags::TUPLE);
                self.buffer.put_uuid(type_id);
                self.buffer.put_u16(positions.len() as u16);
                for pos in positions {
                    self.buffer.put_u16(pos);
                }
                self.register(type_id);
                Ok(type_id)
            }

            TypeExpr::NamedTuple(elements) => {
                let subtypes = elements
                    .iter()
                    .map(|(_, el)| self.describe_type(el))
                    .collect::<Result<Vec<_>, _>>()?;
                let names: Vec<&str> = elements.iter().map(|(n, _)| &**n).collect();
                let type_id = Self::collection_type_id("tuple", &subtypes, Some(&names));
                if self.ordinals.contains_key(&type_id) {
                    return Ok(type_id);
                }
                let positions = subtypes
                    .iter()
                    .map(|st| self.ordinal(*st))
                    .collect::<Result<Vec<_>, _>>()?;
                self.buffer.put_u8(tags::NAMED_TUPLE);
                self.buffer.put_uuid(type_id);
                self.buffer.put_u16(elements.len() as u16);
                for ((name, _), pos) in elements.iter().zip(positions) {
                    self.buffer.put_len32_prefixed(name.as_bytes());
                    self.buffer.put_u16(pos);
                }
                self.register(type_id);
                Ok(type_id)
            }

            TypeExpr::Array(element) => {
                let inner = self.describe_type(element)?;
                let type_id = Self::collection_type_id("array", &[inner], None);
                if self.ordinals.contains_key(&type_id) {
                    return Ok(type_id);
                }
                let inner_pos = self.ordinal(inner)?;
                self.buffer.put_u8(tags::ARRAY);
                self.buffer.put_uuid(type_id);
                self.buffer.put_u16(inner_pos);
                // Number of dimensions (always 1) and dimension
                // cardinality (always unbound).
                self.buffer.put_u16(1);
                self.buffer.put_i32(-1);
                self.register(type_id);
                Ok(type_id)
            }

            TypeExpr::Range(element) => {
                let inner = self.describe_type(element)?;
                let type_id = Self::collection_type_id("range", &[inner], None);
                if self.ordinals.contains_key(&type_id) {
                    return Ok(type_id);
                }
                let inner_pos = self.ordinal(inner)?;
                self.buffer.put_u8(tags::RANGE);
                self.buffer.put_uuid(type_id);
                self.buffer.put_u16(inner_pos);
                self.register(type_id);
                Ok(type_id)
            }

            TypeExpr::Scalar(id) => self.describe_scalar(*id),

            TypeExpr::Object(id) => self.describe_shape(*id, follow_links, name_filter),
        }
    }

    fn describe_scalar(&mut self, id: Uuid) -> Result<Uuid, DescribeError> {
        if self.ordinals.contains_key(&id) {
            return Ok(id);
        }
        let obj = self
            .schema
            .get_by_id(id)
            .ok_or(DescribeError::UnknownType(id))?
            .clone();
        let scalar = obj
            .as_scalar()
            .ok_or_else(|| DescribeError::Structural(format!("{} is not a scalar", obj.name)))?
            .clone();

        if let Some(labels) = &scalar.enum_labels {
            self.buffer.put_u8(tags::ENUM);
            self.buffer.put_uuid(id);
            self.buffer.put_u16(labels.len() as u16);
            for label in labels {
                self.buffer.put_len32_prefixed(label.as_bytes());
            }
            if self.inline_typenames {
                self.add_annotation(id, &obj.name.to_string());
            }
        } else if let Some(base) = scalar.base {
            // Walk to the topmost concrete base.
            let mut top = base;
            while let Some(b) = self
                .schema
                .get_by_id(top)
                .and_then(|o| o.as_scalar())
                .and_then(|s| s.base)
            {
                top = b;
            }
            let base_id = self.describe_scalar(top)?;
            let base_pos = self.ordinal(base_id)?;
            self.buffer.put_u8(tags::SCALAR);
            self.buffer.put_uuid(id);
            self.buffer.put_u16(base_pos);
            if self.inline_typenames {
                self.add_annotation(id, &obj.name.to_string());
            }
        } else {
            self.buffer.put_u8(tags::BASE_SCALAR);
            self.buffer.put_uuid(id);
        }
        self.register(id);
        Ok(id)
    }

    fn describe_shape(
        &mut self,
        base_type_id: Uuid,
        follow_links: bool,
        name_filter: &str,
    ) -> Result<Uuid, DescribeError> {
        struct Element {
            name: String,
            type_id: Uuid,
            is_link: bool,
            is_linkprop: bool,
            cardinality: Cardinality,
        }

        let mut elements: Vec<Element> = Vec::new();
        let shape = self.shapes.shapes.get(&base_type_id).cloned().unwrap_or_default();
        let implicit_id = self.metadata.has_implicit_id.contains(&base_type_id);

        for ptr in &shape {
            if !ptr.name.starts_with(name_filter) {
                continue;
            }
            let name = ptr.name[name_filter.len()..].to_string();
            let type_id = if ptr.cardinality.is_single() || ptr.cardinality == Cardinality::NoResult
            {
                if ptr.is_link && !follow_links {
                    self.describe_scalar(UUID_TYPE_ID)?
                } else {
                    self.describe_type(&ptr.target)?
                }
            } else {
                if ptr.is_link && !follow_links {
                    return Err(DescribeError::Structural(
                        "cannot describe multi links when follow_links=false".into(),
                    ));
                }
                self.describe_set(&ptr.target)?
            };
            elements.push(Element {
                name,
                type_id,
                is_link: ptr.is_link,
                is_linkprop: false,
                cardinality: ptr.cardinality,
            });
        }

        // Link properties attached to the shape's reverse link follow the
        // natural pointers.
        if let Some(rptr_shape) = self.shapes.rptr_shapes.get(&base_type_id).cloned() {
            for ptr in &rptr_shape {
                let type_id = if ptr.cardinality.is_single() {
                    self.describe_type(&ptr.target)?
                } else {
                    self.describe_set(&ptr.target)?
                };
                elements.push(Element {
                    name: ptr.name.to_string(),
                    type_id,
                    is_link: false,
                    is_linkprop: true,
                    cardinality: ptr.cardinality,
                });
            }
        }

        let subtypes: Vec<Uuid> = elements.iter().map(|el| el.type_id).collect();
        let names: Vec<&str> = elements.iter().map(|el| el.name.as_str()).collect();
        let link_props: Vec<bool> = elements.iter().map(|el| el.is_linkprop).collect();
        let links: Vec<bool> = elements.iter().map(|el| el.is_link).collect();

        let type_id = Self::object_type_id(
            base_type_id,
            &subtypes,
            &names,
            implicit_id,
            Some(&link_props),
            Some(&links),
        );
        if self.ordinals.contains_key(&type_id) {
            return Ok(type_id);
        }

        self.buffer.put_u8(tags::SHAPE);
        self.buffer.put_uuid(type_id);
        self.buffer.put_u16(elements.len() as u16);

        for el in &elements {
            let mut flags = 0u32;
            if el.is_linkprop {
                flags |= FLAG_LINKPROP;
            }
            if (implicit_id && el.name == "id") || el.name == "__tid__" {
                if el.type_id != UUID_TYPE_ID {
                    return Err(DescribeError::Structural(format!(
                        "{:?} is expected to be a 'std::uuid' singleton",
                        el.name
                    )));
                }
                flags |= FLAG_IMPLICIT;
            } else if el.name == "__tname__" {
                if el.type_id != STR_TYPE_ID {
                    return Err(DescribeError::Structural(format!(
                        "{:?} is expected to be a 'std::str' singleton",
                        el.name
                    )));
                }
                flags |= FLAG_IMPLICIT;
            }
            if el.is_link {
                flags |= FLAG_LINK;
            }
            let pos = self.ordinal(el.type_id)?;
            self.put_shape_element_header(flags, el.cardinality);
            self.buffer.put_len32_prefixed(el.name.as_bytes());
            self.buffer.put_u16(pos);
        }

        self.register(type_id);
        Ok(type_id)
    }

    /// Describe an input shape over `ty`. With `prepare_state`, only the
    /// substructures are registered and nothing is returned; this
    /// precomputes ordinals without emitting the top-level shape node.
    pub fn describe_input_shape(
        &mut self,
        ty: &TypeExpr,
        input_shapes: &HashMap<Uuid, Vec<ShapePointer>>,
        prepare_state: bool,
    ) -> Result<Option<Uuid>, DescribeError> {
        let TypeExpr::Object(base_type_id) = ty else {
            return self.describe_type(ty).map(Some);
        };
        let Some(shape) = input_shapes.get(base_type_id).cloned() else {
            return self.describe_type(ty).map(Some);
        };

        let mut names: Vec<String> = Vec::with_capacity(shape.len());
        let mut subtypes: Vec<Uuid> = Vec::with_capacity(shape.len());
        let mut cardinalities: Vec<Cardinality> = Vec::with_capacity(shape.len());

        for ptr in &shape {
            let type_id = if matches!(
                ptr.cardinality,
                Cardinality::Many | Cardinality::AtLeastOne
            ) {
                self.describe_set(&ptr.target)?
            } else {
                self.describe_input_shape(&ptr.target, input_shapes, false)?
                    .expect("non-prepare recursion always yields an id")
            };
            names.push(ptr.name.to_string());
            subtypes.push(type_id);
            cardinalities.push(ptr.cardinality);
        }

        if prepare_state {
            return Ok(None);
        }

        let name_refs: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
        let type_id =
            Self::object_type_id(*base_type_id, &subtypes, &name_refs, false, None, None);
        if self.ordinals.contains_key(&type_id) {
            return Ok(Some(type_id));
        }

        self.buffer.put_u8(tags::INPUT_SHAPE);
        self.buffer.put_uuid(type_id);
        self.buffer.put_u16(subtypes.len() as u16);
        for ((name, st), card) in names.iter().zip(&subtypes).zip(&cardinalities) {
            let pos = self.ordinal(*st)?;
            self.put_shape_element_header(0, *card);
            self.buffer.put_len32_prefixed(name.as_bytes());
            self.buffer.put_u16(pos);
        }
        self.register(type_id);
        Ok(Some(type_id))
    }

    /// Consume the builder, returning the full descriptor bytes.
    pub fn finish(self) -> Vec<u8> {
        let mut out = self.buffer;
        out.extend_from_slice(&self.anno_buffer);
        out
    }
}

/// Describe `ty` against `schema`, returning the descriptor bytes and the
/// type id. Deterministic: equal inputs produce byte-identical output.
pub fn describe(
    schema: &SchemaView,
    ty: &TypeExpr,
    shapes: &ViewShapes,
    metadata: &ViewShapeMetadata,
    opts: DescribeOptions<'_>,
) -> Result<(Vec<u8>, Uuid), DescribeError> {
    let mut builder =
        DescriptorBuilder::new(schema, shapes, metadata, opts.protocol, opts.inline_typenames);
    let type_id = builder.describe_type_filtered(ty, opts.follow_links, opts.name_filter)?;
    Ok((builder.finish(), type_id))
}

/// The descriptor used for all JSON-formatted output: a bare `std::str`.
pub fn describe_json() -> (Vec<u8>, Uuid) {
    let mut buf = Vec::with_capacity(17);
    buf.put_u8(tags::BASE_SCALAR);
    buf.put_uuid(STR_TYPE_ID);
    (buf, STR_TYPE_ID)
}

/// Describe the parameters of a query as an implicit shape. An empty
/// parameter list yields the canonical empty-tuple descriptor.
pub fn describe_params(
    schema: &SchemaView,
    params: &[ParamDesc],
    protocol: ProtocolVersion,
) -> Result<(Vec<u8>, Uuid), DescribeError> {
    if params.is_empty() {
        return Ok(empty_tuple_descriptor());
    }

    let shapes = ViewShapes::default();
    let metadata = ViewShapeMetadata::default();
    let mut builder = DescriptorBuilder::new(schema, &shapes, &metadata, protocol, false);

    let mut params_buf: Vec<u8> = Vec::new();
    for param in params {
        let type_id = builder.describe_type(&param.ty)?;
        let pos = builder.ordinal(type_id)?;
        params_buf.put_u32(0);
        params_buf.put_u8(if param.required {
            Cardinality::One as u8
        } else {
            Cardinality::AtMostOne as u8
        });
        params_buf.put_len32_prefixed(param.name.as_bytes());
        params_buf.put_u16(pos);
    }

    let mut full = std::mem::take(&mut builder.buffer);
    let id_pos = full.len() + 1;
    full.put_u8(tags::SHAPE);
    full.put_uuid(NULL_TYPE_ID);
    full.put_u16(params.len() as u16);
    full.put_slice(&params_buf);
    full.put_slice(&builder.anno_buffer);

    // The shape id covers the whole encoding, so it is computed over the
    // buffer with the placeholder id and patched in afterwards.
    let params_id = ids::stable_type_id_from_bytes(&full);
    full[id_pos..id_pos + 16].copy_from_slice(params_id.as_bytes());

    Ok((full, params_id))
}

/// A parsed descriptor node.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDesc {
    Set {
        tid: Uuid,
        inner: Box<TypeDesc>,
    },
    Shape {
        tid: Uuid,
        elements: Vec<ShapeElementDesc>,
    },
    InputShape {
        tid: Uuid,
        elements: Vec<ShapeElementDesc>,
    },
    BaseScalar {
        tid: Uuid,
    },
    Scalar {
        tid: Uuid,
        base: Box<TypeDesc>,
    },
    Tuple {
        tid: Uuid,
        elements: Vec<TypeDesc>,
    },
    NamedTuple {
        tid: Uuid,
        elements: Vec<(String, TypeDesc)>,
    },
    Enum {
        tid: Uuid,
        labels: Vec<String>,
    },
    Array {
        tid: Uuid,
        element: Box<TypeDesc>,
        dim_len: i32,
    },
    Range {
        tid: Uuid,
        inner: Box<TypeDesc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeElementDesc {
    pub name: String,
    pub flags: u32,
    pub cardinality: Option<Cardinality>,
    pub desc: TypeDesc,
}

impl TypeDesc {
    pub fn type_id(&self) -> Uuid {
        match self {
            TypeDesc::Set { tid, .. }
            | TypeDesc::Shape { tid, .. }
            | TypeDesc::InputShape { tid, .. }
            | TypeDesc::BaseScalar { tid }
            | TypeDesc::Scalar { tid, .. }
            | TypeDesc::Tuple { tid, .. }
            | TypeDesc::NamedTuple { tid, .. }
            | TypeDesc::Enum { tid, .. }
            | TypeDesc::Array { tid, .. }
            | TypeDesc::Range { tid, .. } => *tid,
        }
    }
}

fn lookup(codecs: &[TypeDesc], pos: u16) -> Result<TypeDesc, DecodeError> {
    codecs
        .get(pos as usize)
        .cloned()
        .ok_or(DecodeError::BadOrdinal(pos))
}

fn parse_one<'a>(
    reader: &mut &'a [u8],
    codecs: &[TypeDesc],
    protocol: ProtocolVersion,
) -> Result<Option<TypeDesc>, DecodeError> {
    let tag = reader.get_u8()?;
    let tid = reader.get_uuid()?;

    let desc = match tag {
        tags::SET => TypeDesc::Set {
            tid,
            inner: Box::new(lookup(codecs, reader.get_u16()?)?),
        },
        tags::SHAPE | tags::INPUT_SHAPE => {
            let n = reader.get_u16()?;
            let mut elements = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let (flags, cardinality) = if protocol.has_shape_cardinality() {
                    let flags = reader.get_u32()?;
                    let card = Cardinality::from_u8(reader.get_u8()?)?;
                    (flags, Some(card))
                } else {
                    (reader.get_u8()? as u32, None)
                };
                let name = reader.get_len32_prefixed_str()?.to_string();
                let desc = lookup(codecs, reader.get_u16()?)?;
                elements.push(ShapeElementDesc {
                    name,
                    flags,
                    cardinality,
                    desc,
                });
            }
            if tag == tags::SHAPE {
                TypeDesc::Shape { tid, elements }
            } else {
                TypeDesc::InputShape { tid, elements }
            }
        }
        tags::BASE_SCALAR => TypeDesc::BaseScalar { tid },
        tags::SCALAR => TypeDesc::Scalar {
            tid,
            base: Box::new(lookup(codecs, reader.get_u16()?)?),
        },
        tags::TUPLE => {
            let n = reader.get_u16()?;
            let mut elements = Vec::with_capacity(n as usize);
            for _ in 0..n {
                elements.push(lookup(codecs, reader.get_u16()?)?);
            }
            TypeDesc::Tuple { tid, elements }
        }
        tags::NAMED_TUPLE => {
            let n = reader.get_u16()?;
            let mut elements = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let name = reader.get_len32_prefixed_str()?.to_string();
                elements.push((name, lookup(codecs, reader.get_u16()?)?));
            }
            TypeDesc::NamedTuple { tid, elements }
        }
        tags::ENUM => {
            let n = reader.get_u16()?;
            let mut labels = Vec::with_capacity(n as usize);
            for _ in 0..n {
                labels.push(reader.get_len32_prefixed_str()?.to_string());
            }
            TypeDesc::Enum { tid, labels }
        }
        tags::ARRAY => {
            let element = Box::new(lookup(codecs, reader.get_u16()?)?);
            let ndims = reader.get_u16()?;
            if ndims != 1 {
                return Err(DecodeError::BadDimensions(ndims));
            }
            let dim_len = reader.get_i32()?;
            TypeDesc::Array {
                tid,
                element,
                dim_len,
            }
        }
        tags::RANGE => TypeDesc::Range {
            tid,
            inner: Box::new(lookup(codecs, reader.get_u16()?)?),
        },
        0x80..=0xff => {
            // Annotations (and any future tag in the annotation range) are
            // skipped: length-prefixed payload after the id.
            reader.get_len32_prefixed()?;
            return Ok(None);
        }
        other => return Err(DecodeError::InvalidTag(other)),
    };
    Ok(Some(desc))
}

/// Parse a descriptor buffer, returning the top (last) node.
pub fn parse(typedesc: &[u8], protocol: ProtocolVersion) -> Result<TypeDesc, DecodeError> {
    let mut reader: &[u8] = typedesc;
    let mut codecs: Vec<TypeDesc> = Vec::new();
    while reader.remaining() > 0 {
        if let Some(desc) = parse_one(&mut reader, &codecs, protocol)? {
            codecs.push(desc);
        }
    }
    codecs.pop().ok_or(DecodeError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridiandb_schema::stdlib;
    use pretty_assertions::assert_eq;

    fn schema_view() -> SchemaView {
        SchemaView::new(
            stdlib::std_schema().clone(),
            Default::default(),
            Default::default(),
        )
    }

    fn describe_simple(ty: &TypeExpr) -> (Vec<u8>, Uuid) {
        describe(
            &schema_view(),
            ty,
            &ViewShapes::default(),
            &ViewShapeMetadata::default(),
            DescribeOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn base_scalar_is_tag_plus_id() {
        let (bytes, tid) = describe_simple(&TypeExpr::str());
        assert_eq!(tid, STR_TYPE_ID);
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], tags::BASE_SCALAR);
        assert_eq!(&bytes[1..17], STR_TYPE_ID.as_bytes());
    }

    #[test]
    fn duplicate_subtree_described_once() {
        // tuple<str, str>: the str node appears once, referenced twice.
        let ty = TypeExpr::Tuple(vec![TypeExpr::str(), TypeExpr::str()]);
        let (bytes, _) = describe_simple(&ty);
        let str_nodes = bytes
            .windows(17)
            .filter(|w| w[0] == tags::BASE_SCALAR && &w[1..] == STR_TYPE_ID.as_bytes())
            .count();
        assert_eq!(str_nodes, 1);
    }

    #[test]
    fn describe_is_deterministic() {
        let ty = TypeExpr::NamedTuple(vec![
            ("a".into(), TypeExpr::Array(Box::new(TypeExpr::str()))),
            ("b".into(), TypeExpr::Scalar(ids::INT64_TYPE_ID)),
        ]);
        assert_eq!(describe_simple(&ty), describe_simple(&ty));
    }

    #[test]
    fn empty_params_yield_empty_tuple() {
        let (bytes, tid) = describe_params(&schema_view(), &[], ProtocolVersion::CURRENT).unwrap();
        assert_eq!(tid, EMPTY_TUPLE_ID);
        assert_eq!(bytes, empty_tuple_descriptor().0);
    }

    #[test]
    fn params_id_is_patched_into_the_buffer() {
        let params = [ParamDesc {
            name: "limit".into(),
            ty: TypeExpr::Scalar(ids::INT64_TYPE_ID),
            required: true,
        }];
        let (bytes, tid) = describe_params(&schema_view(), &params, ProtocolVersion::CURRENT).unwrap();
        let parsed = parse(&bytes, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(parsed.type_id(), tid);
        let TypeDesc::Shape { elements, .. } = parsed else {
            panic!("params must parse as a shape");
        };
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].name, "limit");
        assert_eq!(elements[0].cardinality, Some(Cardinality::One));
    }

    #[test]
    fn old_protocol_omits_cardinality_byte() {
        let view = schema_view();
        let shapes = ViewShapes {
            shapes: HashMap::from([(
                Uuid::from_u128(0xdead),
                vec![ShapePointer {
                    name: "name".into(),
                    target: TypeExpr::str(),
                    cardinality: Cardinality::One,
                    is_link: false,
                    is_linkprop: false,
                }],
            )]),
            rptr_shapes: HashMap::new(),
        };
        let meta = ViewShapeMetadata::default();
        let ty = TypeExpr::Object(Uuid::from_u128(0xdead));
        let old = describe(
            &view,
            &ty,
            &shapes,
            &meta,
            DescribeOptions {
                protocol: ProtocolVersion(0, 10),
                ..Default::default()
            },
        )
        .unwrap();
        let new = describe(&view, &ty, &shapes, &meta, DescribeOptions::default()).unwrap();
        // u32 flags + u8 cardinality instead of u8 flags: four extra bytes.
        assert_eq!(new.0.len(), old.0.len() + 4);
        assert_eq!(parse(&old.0, ProtocolVersion(0, 10)).unwrap().type_id(), old.1);
    }

    #[test]
    fn implicit_id_with_wrong_type_is_structural_error() {
        let view = schema_view();
        let obj = Uuid::from_u128(0xbeef);
        let shapes = ViewShapes {
            shapes: HashMap::from([(
                obj,
                vec![ShapePointer {
                    name: "id".into(),
                    target: TypeExpr::str(), // not uuid
                    cardinality: Cardinality::One,
                    is_link: false,
                    is_linkprop: false,
                }],
            )]),
            rptr_shapes: HashMap::new(),
        };
        let meta = ViewShapeMetadata {
            has_implicit_id: [obj].into_iter().collect(),
        };
        let err = describe(
            &view,
            &TypeExpr::Object(obj),
            &shapes,
            &meta,
            DescribeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DescribeError::Structural(_)));
    }

    #[test]
    fn input_shapes_encode_and_prepare() {
        let view = schema_view();
        let obj = Uuid::from_u128(0xcafe);
        let input_shapes = HashMap::from([(
            obj,
            vec![
                ShapePointer {
                    name: "name".into(),
                    target: TypeExpr::str(),
                    cardinality: Cardinality::One,
                    is_link: false,
                    is_linkprop: false,
                },
                ShapePointer {
                    name: "tags".into(),
                    target: TypeExpr::str(),
                    cardinality: Cardinality::Many,
                    is_link: false,
                    is_linkprop: false,
                },
            ],
        )]);
        let shapes = ViewShapes::default();
        let meta = ViewShapeMetadata::default();

        // prepare_state registers substructures without emitting the top
        // shape node.
        let mut builder =
            DescriptorBuilder::new(&view, &shapes, &meta, ProtocolVersion::CURRENT, false);
        let prepared = builder
            .describe_input_shape(&TypeExpr::Object(obj), &input_shapes, true)
            .unwrap();
        assert!(prepared.is_none());
        let prepared_bytes = builder.finish();
        let top = parse(&prepared_bytes, ProtocolVersion::CURRENT).unwrap();
        assert!(!matches!(top, TypeDesc::InputShape { .. }));

        let mut builder =
            DescriptorBuilder::new(&view, &shapes, &meta, ProtocolVersion::CURRENT, false);
        let tid = builder
            .describe_input_shape(&TypeExpr::Object(obj), &input_shapes, false)
            .unwrap()
            .expect("top-level shape id");
        let bytes = builder.finish();
        let parsed = parse(&bytes, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(parsed.type_id(), tid);
        let TypeDesc::InputShape { elements, .. } = parsed else {
            panic!("expected an input shape");
        };
        assert_eq!(elements.len(), 2);
        // The multi element went through the set codec.
        assert!(matches!(elements[1].desc, TypeDesc::Set { .. }));
        assert_eq!(elements[1].cardinality, Some(Cardinality::Many));
    }

    #[test]
    fn annotations_are_skipped_by_parse() {
        let view = schema_view();
        // A derived scalar with inline_typenames generates an annotation.
        let mut user = meridiandb_schema::SchemaSnapshot::new();
        let custom = meridiandb_schema::SchemaObject::new(
            Uuid::from_u128(0x777),
            "default::ticket_id".parse().unwrap(),
            meridiandb_schema::ObjectData::ScalarType(meridiandb_schema::ScalarType {
                base: Some(ids::INT64_TYPE_ID),
                enum_labels: None,
            }),
        );
        user = user.inserted(custom).unwrap();
        let view = SchemaView::new(view.std, user, view.global);
        let (bytes, tid) = describe(
            &view,
            &TypeExpr::Scalar(Uuid::from_u128(0x777)),
            &ViewShapes::default(),
            &ViewShapeMetadata::default(),
            DescribeOptions {
                inline_typenames: true,
                ..Default::default()
            },
        )
        .unwrap();
        let parsed = parse(&bytes, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(parsed.type_id(), tid);
        assert!(matches!(parsed, TypeDesc::Scalar { .. }));
    }
}
