//! Pixel and frame types shared by the render pipeline and the devices.
//!
//! A wall frame is a `width × height` grid of [`Rgb`] pixels stored in
//! raster order, three bytes per pixel. The wall is cut into horizontal
//! slices of `slice_height` rows; in raster order each slice is one
//! contiguous byte range, so a slice view is a zero-copy [`Bytes`] slice.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::WallError;

// ── Rgb ──────────────────────────────────────────────────────────

/// One pixel in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Wire bytes, `[r, g, b]`.
    pub const fn to_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

// ── WallGeometry ─────────────────────────────────────────────────

/// Dimensions of the wall and of the slices it is cut into.
///
/// These are startup constants shared by the server and every device;
/// there is no runtime negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallGeometry {
    /// Columns across the whole wall (and across every slice).
    pub width: usize,
    /// Rows in the whole wall.
    pub height: usize,
    /// Rows per slice.
    pub slice_height: usize,
}

impl Default for WallGeometry {
    fn default() -> Self {
        Self {
            width: 288,
            height: 144,
            slice_height: 48,
        }
    }
}

impl WallGeometry {
    /// Bytes used by one pixel on the wire.
    pub const BYTES_PER_PIXEL: usize = 3;

    /// Build and validate a geometry.
    pub fn new(width: usize, height: usize, slice_height: usize) -> Result<Self, WallError> {
        let geometry = Self {
            width,
            height,
            slice_height,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Check that every dimension is non-zero and slices tile the wall.
    pub fn validate(&self) -> Result<(), WallError> {
        if self.width == 0 || self.height == 0 || self.slice_height == 0 {
            return Err(WallError::Config("wall dimensions must be non-zero".into()));
        }
        if self.height % self.slice_height != 0 {
            return Err(WallError::Config(format!(
                "wall height {} is not a multiple of slice height {}",
                self.height, self.slice_height
            )));
        }
        Ok(())
    }

    /// Number of horizontal slices.
    pub fn slice_count(&self) -> usize {
        self.height / self.slice_height
    }

    /// Bytes in one full wall frame.
    pub fn frame_len(&self) -> usize {
        self.width * self.height * Self::BYTES_PER_PIXEL
    }

    /// Bytes in one slice payload, which is also the wire frame size.
    pub fn slice_len(&self) -> usize {
        self.width * self.slice_height * Self::BYTES_PER_PIXEL
    }

    fn offset(&self, x: usize, y: usize) -> usize {
        (y * self.width + x) * Self::BYTES_PER_PIXEL
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// An immutable, cheaply cloneable wall frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    geometry: WallGeometry,
    data: Bytes,
}

impl Frame {
    /// Wrap raw raster bytes, checking the length against `geometry`.
    pub fn from_bytes(geometry: WallGeometry, data: impl Into<Bytes>) -> Result<Self, WallError> {
        let data = data.into();
        if data.len() != geometry.frame_len() {
            return Err(WallError::InvalidFrameLength {
                expected: geometry.frame_len(),
                actual: data.len(),
            });
        }
        Ok(Self { geometry, data })
    }

    /// An all-black frame.
    pub fn black(geometry: WallGeometry) -> Self {
        Canvas::new(geometry).freeze()
    }

    pub fn geometry(&self) -> &WallGeometry {
        &self.geometry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The bytes of slice `index`, or `None` if out of range.
    pub fn slice(&self, index: usize) -> Option<Bytes> {
        if index >= self.geometry.slice_count() {
            return None;
        }
        let len = self.geometry.slice_len();
        Some(self.data.slice(index * len..(index + 1) * len))
    }

    /// The pixel at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: usize, y: usize) -> Rgb {
        let o = self.geometry.offset(x, y);
        Rgb::new(self.data[o], self.data[o + 1], self.data[o + 2])
    }
}

// ── Canvas ───────────────────────────────────────────────────────

/// Mutable drawing surface an effect renders into before it is frozen
/// into a [`Frame`].
#[derive(Debug)]
pub struct Canvas {
    geometry: WallGeometry,
    data: BytesMut,
}

impl Canvas {
    /// A black canvas.
    pub fn new(geometry: WallGeometry) -> Self {
        Self {
            geometry,
            data: BytesMut::zeroed(geometry.frame_len()),
        }
    }

    pub fn geometry(&self) -> &WallGeometry {
        &self.geometry
    }

    pub fn width(&self) -> usize {
        self.geometry.width
    }

    pub fn height(&self) -> usize {
        self.geometry.height
    }

    /// Set the pixel at `(x, y)`. Out-of-bounds writes are ignored.
    pub fn set(&mut self, x: usize, y: usize, color: Rgb) {
        if x >= self.geometry.width || y >= self.geometry.height {
            return;
        }
        let o = self.geometry.offset(x, y);
        self.data[o..o + 3].copy_from_slice(&color.to_bytes());
    }

    /// Paint every pixel with `color`.
    pub fn fill(&mut self, color: Rgb) {
        let px = color.to_bytes();
        for chunk in self.data.chunks_exact_mut(WallGeometry::BYTES_PER_PIXEL) {
            chunk.copy_from_slice(&px);
        }
    }

    /// Freeze into an immutable frame.
    pub fn freeze(self) -> Frame {
        Frame {
            geometry: self.geometry,
            data: self.data.freeze(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> WallGeometry {
        WallGeometry::new(4, 6, 2).unwrap()
    }

    #[test]
    fn default_geometry_lengths() {
        let g = WallGeometry::default();
        assert_eq!(g.slice_count(), 3);
        assert_eq!(g.slice_len(), 288 * 48 * 3);
        assert_eq!(g.frame_len(), 3 * g.slice_len());
    }

    #[test]
    fn geometry_rejects_ragged_slices() {
        assert!(WallGeometry::new(4, 5, 2).is_err());
        assert!(WallGeometry::new(0, 4, 2).is_err());
    }

    #[test]
    fn from_bytes_checks_length() {
        let err = Frame::from_bytes(small(), vec![0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            WallError::InvalidFrameLength {
                expected: 72,
                actual: 10
            }
        ));
    }

    #[test]
    fn slice_is_band_of_rows() {
        let g = small();
        let mut canvas = Canvas::new(g);
        // paint row 2 (first row of slice 1) red
        for x in 0..g.width {
            canvas.set(x, 2, Rgb::new(0xff, 0, 0));
        }
        let frame = canvas.freeze();

        let s0 = frame.slice(0).unwrap();
        assert!(s0.iter().all(|&b| b == 0));

        let s1 = frame.slice(1).unwrap();
        assert_eq!(s1.len(), g.slice_len());
        assert_eq!(&s1[0..3], &[0xff, 0, 0]);
        assert_eq!(&s1[g.width * 3..g.width * 3 + 3], &[0, 0, 0]);

        assert!(frame.slice(3).is_none());
    }

    #[test]
    fn canvas_set_and_fill() {
        let g = small();
        let mut canvas = Canvas::new(g);
        canvas.fill(Rgb::new(1, 2, 3));
        canvas.set(3, 5, Rgb::new(9, 9, 9));
        canvas.set(99, 99, Rgb::new(7, 7, 7));
        let frame = canvas.freeze();
        assert_eq!(frame.pixel(0, 0), Rgb::new(1, 2, 3));
        assert_eq!(frame.pixel(3, 5), Rgb::new(9, 9, 9));
    }
}
