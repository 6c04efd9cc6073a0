// image.rs — Runtime-sized image container, generic over pixel type.
//
// Every buffer the tracker touches per frame (pyramid layers, gradient
// images, convolution scratch) is an `Image<T>` that is allocated once and
// then refilled in place. `clear_resize` is the hinge of that discipline:
// it changes the logical shape without giving memory back, so a buffer that
// has held the largest shape once never reallocates again.
//
// Memory layout is row-major with an explicit stride (stride >= width):
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|

use std::fmt;

// ---------------------------------------------------------------------------
// Pixel Trait
// ---------------------------------------------------------------------------

/// Trait for types that can serve as pixel values in an Image.
///
/// The pyramid, the tracker and the detector are generic over this trait,
/// so the pixel format is fixed once per pyramid at compile time and every
/// sampling kernel is monomorphized for it.
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Convert this pixel value to f32 (raw value, not normalized).
    fn to_f32(self) -> f32;

    /// Construct a pixel from an f32 value (with appropriate clamping/rounding).
    fn from_f32(v: f32) -> Self;
}

impl Pixel for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for u16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.clamp(0.0, 65535.0).round() as u16
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D image with runtime dimensions, generic over pixel type `T`.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    /// Pixel data in row-major order. Length = height * stride.
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Row stride in elements. Pixels for row y start at index y * stride.
    stride: usize,
}

impl<T: Pixel> Image<T> {
    /// Create a zero-initialized image with the given dimensions.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Create a zero-initialized image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(
            stride >= width,
            "stride ({stride}) must be >= width ({width})"
        );
        Image {
            data: vec![T::default(); height * stride],
            width,
            height,
            stride,
        }
    }

    /// Create an image from an existing pixel vector (stride = width).
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image {
            data,
            width,
            height,
            stride: width,
        }
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image::from_vec(width, height, data)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// True if this image has the same width and height as `other`.
    #[inline]
    pub fn same_shape<U: Pixel>(&self, other: &Image<U>) -> bool {
        self.width == other.width() && self.height == other.height()
    }

    /// Get the pixel value at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.stride + x]
    }

    /// Get pixel value without bounds checking.
    ///
    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, x: usize, y: usize) -> T {
        debug_assert!(x < self.width && y < self.height,
            "get_unchecked({x},{y}) out of bounds for {}x{}", self.width, self.height);
        *self.data.get_unchecked(y * self.stride + x)
    }

    /// Set pixel value without bounds checking.
    ///
    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn set_unchecked(&mut self, x: usize, y: usize, value: T) {
        debug_assert!(x < self.width && y < self.height);
        *self.data.get_unchecked_mut(y * self.stride + x) = value;
    }

    /// Get a mutable reference to the pixel at (x, y).
    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }

    /// Set the pixel at (x, y) to the given value.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        *self.get_mut(x, y) = value;
    }

    /// Borrow a single row as a slice (without stride padding).
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Mutable borrow of a single row.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Change the logical shape to `width × height` (stride = width) and
    /// zero the contents.
    ///
    /// The backing `Vec` only grows, so once a buffer has held a shape it can
    /// be resized to that shape or smaller any number of times without
    /// touching the allocator.
    pub fn clear_resize(&mut self, width: usize, height: usize) {
        let len = width * height;
        self.data.clear();
        self.data.resize(len, T::default());
        self.width = width;
        self.height = height;
        self.stride = width;
    }

    /// Set every pixel to `value`.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Copy `src` into this buffer, resizing it in place first.
    pub fn copy_from(&mut self, src: &Image<T>) {
        self.clear_resize(src.width(), src.height());
        for y in 0..src.height() {
            self.row_mut(y).copy_from_slice(src.row(y));
        }
    }

    /// Iterate over all pixels as `(x, y, value)` tuples.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.data[y * self.stride + x]))
        })
    }

    /// Access the underlying data as a flat slice (includes stride padding).
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Number of elements the buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// True if the continuous point (x, y) is inside the pixel grid,
    /// i.e. both coordinates lie in `[0, dim - 1]`.
    #[inline]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= 0.0 && y >= 0.0 && x <= (self.width as f32 - 1.0) && y <= (self.height as f32 - 1.0)
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

impl<T: Pixel> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("pixel", &std::any::type_name::<T>())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

impl<T: Pixel> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.stride + x]
    }
}

impl<T: Pixel> std::ops::IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }
}

// ---------------------------------------------------------------------------
// Bilinear Interpolation
// ---------------------------------------------------------------------------

/// Bilinear interpolation for sub-pixel access, returned as f32.
///
/// Coordinates are clamped to the image, which replicates the edge pixels.
///
/// # Panics
/// Panics if the image is empty (width or height is 0).
pub fn interpolate_bilinear<T: Pixel>(img: &Image<T>, x: f32, y: f32) -> f32 {
    assert!(img.width() > 0 && img.height() > 0, "cannot interpolate on an empty image");

    let max_x = (img.width() - 1) as f32;
    let max_y = (img.height() - 1) as f32;
    // SAFETY: the clamp puts (x, y) inside [0, width-1] × [0, height-1].
    unsafe { interpolate_bilinear_unchecked(img, x.clamp(0.0, max_x), y.clamp(0.0, max_y)) }
}

/// Bilinear interpolation without the assert or clamp overhead.
///
/// # Safety
/// Caller must guarantee the image is non-empty, x is in [0.0, width-1]
/// and y is in [0.0, height-1].
#[inline(always)]
pub unsafe fn interpolate_bilinear_unchecked<T: Pixel>(img: &Image<T>, x: f32, y: f32) -> f32 {
    let x0 = x as usize; // floor for non-negative
    let y0 = y as usize;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let x1 = if x0 + 1 < img.width() { x0 + 1 } else { x0 };
    let y1 = if y0 + 1 < img.height() { y0 + 1 } else { y0 };

    let p00 = img.get_unchecked(x0, y0).to_f32();
    let p10 = img.get_unchecked(x1, y0).to_f32();
    let p01 = img.get_unchecked(x0, y1).to_f32();
    let p11 = img.get_unchecked(x1, y1).to_f32();

    (1.0 - fx) * (1.0 - fy) * p00
        + fx * (1.0 - fy) * p10
        + (1.0 - fx) * fy * p01
        + fx * fy * p11
}
