//! Wire-level encodings: byte buffers, cardinality codes, and the type
//! descriptor engine that describes query input/output shapes to clients.

pub mod buffer;
pub mod cardinality;
pub mod descriptor;

pub use buffer::{BufReader, BufWriter, DecodeError};
pub use cardinality::{Cardinality, ProtocolVersion};
pub use descriptor::{
    DescribeError, DescribeOptions, DescriptorBuilder, ParamDesc, ShapeElementDesc, ShapePointer,
    TypeDesc, TypeExpr, ViewShapeMetadata, ViewShapes,
};
