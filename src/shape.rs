//! Transform shape description.
//!
//! A [`TransformShape`] is fixed once a plan is requested: it names the
//! lengths along each axis, the transform direction, the numeric mode,
//! the precision and how input and output are bound.

use serde::{Deserialize, Serialize};

/// Errors raised when a shape cannot describe a valid transform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("Transform width must be non-zero")]
    ZeroWidth,
    #[error("Transform height must be non-zero")]
    ZeroHeight,
    #[error("Real-valued transforms need an even width, got {0}")]
    OddRealWidth(u32),
    #[error("Complex-to-real transforms require an inverse direction")]
    ComplexToRealForward,
    #[error("Real-to-complex transforms require the forward direction")]
    RealToComplexInverse,
    #[error("Real-to-complex input must be a real texture or a buffer")]
    RealInputTexture,
    #[error("Complex-to-real output must be a real texture or a buffer")]
    RealOutputTexture,
}

/// Transform direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Forward transform.
    Forward,
    /// Inverse transform.
    Inverse,
    /// Inverse transform of the product of two frequency-domain inputs.
    /// Only the first pass multiplies; later passes run as plain inverse.
    InverseConvolve,
}

impl Direction {
    pub fn is_inverse(&self) -> bool {
        !matches!(self, Direction::Forward)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Inverse => "inverse",
            Direction::InverseConvolve => "inverse-convolve",
        }
    }
}

/// Numeric mode of the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    /// Regular complex-to-complex transform.
    ComplexToComplex,
    /// Two complex values per element, transformed side by side (e.g. RGBA data).
    ComplexToComplexDual,
    /// `W / 2 + 1` complex values per row in, `W` real values per row out.
    ComplexToReal,
    /// `W` real values per row in, `W / 2 + 1` complex values per row out.
    RealToComplex,
}

impl TransformType {
    /// Whether the transform has a real-valued side and needs a resolve pass.
    pub fn is_real(&self) -> bool {
        matches!(self, TransformType::ComplexToReal | TransformType::RealToComplex)
    }

    /// Complex values carried by one element.
    pub fn components(&self) -> u32 {
        match self {
            TransformType::ComplexToComplexDual => 2,
            _ => 1,
        }
    }
}

/// Numeric precision of buffers and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Half,
    Single,
}

impl Precision {
    /// Bytes used by one complex value.
    pub fn complex_bytes(&self) -> u64 {
        match self {
            Precision::Half => 4,
            Precision::Single => 8,
        }
    }
}

/// How an input or output resource is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Storage buffer.
    Buffer,
    /// Two- or four-channel texture holding complex values.
    Texture,
    /// Single-channel texture holding real values.
    TextureReal,
}

/// Axis a pass transforms along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// Immutable description of a transform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformShape {
    width: u32,
    height: Option<u32>,
    direction: Direction,
    transform_type: TransformType,
    precision: Precision,
    input_target: Target,
    output_target: Target,
}

impl TransformShape {
    /// One-dimensional forward complex transform over buffers.
    pub fn new_1d(width: u32) -> Self {
        Self {
            width,
            height: None,
            direction: Direction::Forward,
            transform_type: TransformType::ComplexToComplex,
            precision: Precision::Single,
            input_target: Target::Buffer,
            output_target: Target::Buffer,
        }
    }

    /// Two-dimensional forward complex transform over buffers.
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            height: Some(height),
            ..Self::new_1d(width)
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_type(mut self, transform_type: TransformType) -> Self {
        self.transform_type = transform_type;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_targets(mut self, input: Target, output: Target) -> Self {
        self.input_target = input;
        self.output_target = output;
        self
    }

    /// Check the combination of mode, direction and targets.
    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.width == 0 {
            return Err(ShapeError::ZeroWidth);
        }
        if self.height == Some(0) {
            return Err(ShapeError::ZeroHeight);
        }
        match self.transform_type {
            TransformType::RealToComplex => {
                if self.direction != Direction::Forward {
                    return Err(ShapeError::RealToComplexInverse);
                }
                if self.input_target == Target::Texture {
                    return Err(ShapeError::RealInputTexture);
                }
            }
            TransformType::ComplexToReal => {
                if self.direction == Direction::Forward {
                    return Err(ShapeError::ComplexToRealForward);
                }
                if self.output_target == Target::Texture {
                    return Err(ShapeError::RealOutputTexture);
                }
            }
            _ => {}
        }
        if self.transform_type.is_real() && self.width % 2 != 0 {
            return Err(ShapeError::OddRealWidth(self.width));
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    /// Number of rows (1 for one-dimensional transforms).
    pub fn rows(&self) -> u32 {
        self.height.unwrap_or(1)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transform_type(&self) -> TransformType {
        self.transform_type
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn input_target(&self) -> Target {
        self.input_target
    }

    pub fn output_target(&self) -> Target {
        self.output_target
    }

    /// Length of the horizontal complex transform.
    ///
    /// Real modes pack two reals into one complex value, halving the row.
    pub fn complex_width(&self) -> u32 {
        if self.transform_type.is_real() {
            self.width / 2
        } else {
            self.width
        }
    }

    /// Complex elements per row on the frequency side of a real transform.
    pub fn spectrum_width(&self) -> u32 {
        if self.transform_type.is_real() {
            self.width / 2 + 1
        } else {
            self.width
        }
    }

    /// Transform length along `axis`.
    pub fn axis_length(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Horizontal => self.complex_width(),
            Axis::Vertical => self.rows(),
        }
    }

    /// Logical sample count used for normalization.
    pub fn sample_count(&self) -> u64 {
        self.width as u64 * self.rows() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shape_is_valid() {
        let shape = TransformShape::new_2d(256, 128);
        assert!(shape.validate().is_ok());
        assert_eq!(shape.rows(), 128);
        assert_eq!(shape.axis_length(Axis::Horizontal), 256);
        assert_eq!(shape.axis_length(Axis::Vertical), 128);
    }

    #[test]
    fn test_real_modes_pack_rows() {
        let shape = TransformShape::new_1d(512).with_type(TransformType::RealToComplex);
        assert!(shape.validate().is_ok());
        assert_eq!(shape.complex_width(), 256);
        assert_eq!(shape.spectrum_width(), 257);
        assert_eq!(shape.rows(), 1);
    }

    #[test]
    fn test_direction_rules_for_real_modes() {
        let c2r = TransformShape::new_1d(64).with_type(TransformType::ComplexToReal);
        assert_eq!(c2r.validate(), Err(ShapeError::ComplexToRealForward));

        let r2c = TransformShape::new_1d(64)
            .with_type(TransformType::RealToComplex)
            .with_direction(Direction::Inverse);
        assert_eq!(r2c.validate(), Err(ShapeError::RealToComplexInverse));
    }

    #[test]
    fn test_real_texture_rules() {
        let shape = TransformShape::new_1d(64)
            .with_type(TransformType::RealToComplex)
            .with_targets(Target::Texture, Target::Buffer);
        assert_eq!(shape.validate(), Err(ShapeError::RealInputTexture));

        let shape = TransformShape::new_1d(64)
            .with_type(TransformType::ComplexToReal)
            .with_direction(Direction::Inverse)
            .with_targets(Target::Buffer, Target::Texture);
        assert_eq!(shape.validate(), Err(ShapeError::RealOutputTexture));
    }

    #[test]
    fn test_zero_and_odd_sizes_rejected() {
        assert_eq!(TransformShape::new_1d(0).validate(), Err(ShapeError::ZeroWidth));
        assert_eq!(TransformShape::new_2d(8, 0).validate(), Err(ShapeError::ZeroHeight));
        let even = TransformShape::new_1d(30).with_type(TransformType::RealToComplex);
        assert!(even.validate().is_ok());
        let odd = TransformShape::new_1d(31).with_type(TransformType::RealToComplex);
        assert_eq!(odd.validate(), Err(ShapeError::OddRealWidth(31)));
    }
}
