//! Source vertex and index buffer layouts.

/// Vertex attribute semantic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VertexAttribute {
    Position,
    Normal,
    Tangent,
    Color,
    TexCoord0,
    TexCoord1,
}

/// Per-component storage format of an attribute.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VertexFormat {
    Float32,
    UInt32,
    SInt32,
    Float16,
    UNorm16,
    SNorm16,
    UNorm8,
    SNorm8,
    UInt8,
    SInt8,
}

impl VertexFormat {
    /// Size of one component in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            VertexFormat::Float32 | VertexFormat::UInt32 | VertexFormat::SInt32 => 4,
            VertexFormat::Float16 | VertexFormat::UNorm16 | VertexFormat::SNorm16 => 2,
            VertexFormat::UNorm8 | VertexFormat::SNorm8 | VertexFormat::UInt8 | VertexFormat::SInt8 => 1,
        }
    }
}

/// One attribute in an interleaved vertex stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VertexAttributeDescriptor {
    pub attribute: VertexAttribute,
    pub format: VertexFormat,
    pub dimension: usize,
}

impl VertexAttributeDescriptor {
    pub const fn new(attribute: VertexAttribute, format: VertexFormat, dimension: usize) -> Self {
        Self {
            attribute,
            format,
            dimension,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.format.size_bytes() * self.dimension
    }
}

/// Location of an attribute inside one vertex.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AttributeLocation {
    pub offset: usize,
    pub format: VertexFormat,
    pub dimension: usize,
}

/// Interleaved vertex layout: attributes packed in declaration order.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct VertexLayout {
    pub attributes: Vec<VertexAttributeDescriptor>,
}

impl VertexLayout {
    pub fn new(attributes: Vec<VertexAttributeDescriptor>) -> Self {
        Self { attributes }
    }

    /// Position (f32x3), normal (f32x3), uv (f32x2): 32 bytes per vertex.
    pub fn position_normal_uv() -> Self {
        Self::new(vec![
            VertexAttributeDescriptor::new(VertexAttribute::Position, VertexFormat::Float32, 3),
            VertexAttributeDescriptor::new(VertexAttribute::Normal, VertexFormat::Float32, 3),
            VertexAttributeDescriptor::new(VertexAttribute::TexCoord0, VertexFormat::Float32, 2),
        ])
    }

    /// Bytes per vertex.
    pub fn stride(&self) -> usize {
        self.attributes.iter().map(|a| a.size_bytes()).sum()
    }

    /// Find an attribute's byte offset and format.
    pub fn find(&self, attribute: VertexAttribute) -> Option<AttributeLocation> {
        let mut offset = 0;
        for desc in &self.attributes {
            if desc.attribute == attribute {
                return Some(AttributeLocation {
                    offset,
                    format: desc.format,
                    dimension: desc.dimension,
                });
            }
            offset += desc.size_bytes();
        }
        None
    }
}

/// Index buffer element width.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum IndexFormat {
    U16,
    #[default]
    U32,
}

impl IndexFormat {
    pub fn size_bytes(self) -> usize {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_and_offsets() {
        let layout = VertexLayout::position_normal_uv();
        assert_eq!(layout.stride(), 32);
        assert_eq!(layout.find(VertexAttribute::Position).unwrap().offset, 0);
        assert_eq!(layout.find(VertexAttribute::Normal).unwrap().offset, 12);
        assert_eq!(layout.find(VertexAttribute::TexCoord0).unwrap().offset, 24);
        assert!(layout.find(VertexAttribute::Tangent).is_none());
    }

    #[test]
    fn test_mixed_formats() {
        let layout = VertexLayout::new(vec![
            VertexAttributeDescriptor::new(VertexAttribute::Position, VertexFormat::Float32, 3),
            VertexAttributeDescriptor::new(VertexAttribute::Color, VertexFormat::UNorm8, 4),
            VertexAttributeDescriptor::new(VertexAttribute::TexCoord0, VertexFormat::Float16, 2),
            VertexAttributeDescriptor::new(VertexAttribute::Normal, VertexFormat::Float32, 3),
        ]);
        assert_eq!(layout.stride(), 12 + 4 + 4 + 12);
        let uv = layout.find(VertexAttribute::TexCoord0).unwrap();
        assert_eq!((uv.offset, uv.format), (16, VertexFormat::Float16));
        assert_eq!(layout.find(VertexAttribute::Normal).unwrap().offset, 20);
    }
}
