//! # Fixed size image buffer

use anyhow::{bail, Result};

/// Row-major image with a fixed width.
///
/// Pyramid buffers are sized once at tracker construction and overwritten in place every frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Image<T> {
    data: Vec<T>,
    width: usize,
}

impl<T: Clone> Image<T> {
    /// Create a new image filled with `fill`.
    ///
    /// # Arguments
    ///
    /// * `width` - width of the image.
    /// * `height` - height of the image.
    /// * `fill` - initial value of every pixel.
    pub fn new(width: usize, height: usize, fill: T) -> Self {
        let width = if height == 0 { 0 } else { width };

        Self {
            data: vec![fill; width * height],
            width,
        }
    }
}

impl<T> Image<T> {
    /// Wrap an existing row-major buffer.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != width * height {
            bail!(
                "buffer of {} elements does not match {}x{} image",
                data.len(),
                width,
                height
            );
        }

        Ok(Self {
            data,
            width: if height == 0 { 0 } else { width },
        })
    }

    /// Get width and height of the image.
    pub fn dim(&self) -> (usize, usize) {
        if self.width == 0 {
            (0, 0)
        } else {
            (self.width, self.data.len() / self.width)
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.dim().1
    }

    /// Get number of pixels.
    ///
    /// This is the same as `width * height`
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get pixel at coordinates.
    ///
    /// # Panics
    ///
    /// When coordinates are out of bounds.
    pub fn get(&self, x: usize, y: usize) -> &T {
        &self.data[self.width * y + x]
    }

    /// Get pixel at signed coordinates, if they are inside the image.
    pub fn get_checked(&self, x: isize, y: isize) -> Option<&T> {
        let (w, h) = self.dim();

        if x < 0 || y < 0 || x as usize >= w || y as usize >= h {
            None
        } else {
            Some(self.get(x as usize, y as usize))
        }
    }

    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        &mut self.data[self.width * y + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        *self.get_mut(x, y) = value;
    }

    /// Get the pixels in row-major order.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Get a single row of pixels.
    pub fn row(&self, y: usize) -> &[T] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    /// Iterate every pixel of the image.
    ///
    /// The resulting iterator yields `(x, y, pixel)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> + '_ {
        let width = self.width.max(1);
        self.data
            .iter()
            .enumerate()
            .map(move |(i, v)| (i % width, i / width, v))
    }

    /// Map every pixel into a new image of the same dimensions.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Image<U> {
        Image {
            data: self.data.iter().map(f).collect(),
            width: self.width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions() {
        let img = Image::new(4, 3, 0u8);
        assert_eq!(img.dim(), (4, 3));
        assert_eq!(img.size(), 12);
        assert_eq!(Image::new(4, 0, 0u8).dim(), (0, 0));
        assert_eq!(Image::new(0, 4, 0u8).dim(), (0, 0));
    }

    #[test]
    fn access() {
        let mut img = Image::new(3, 2, 0i32);
        img.set(2, 1, 5);
        assert_eq!(*img.get(2, 1), 5);
        assert_eq!(img.row(1), &[0, 0, 5]);
        assert_eq!(img.get_checked(3, 0), None);
        assert_eq!(img.get_checked(-1, 0), None);
        assert_eq!(img.get_checked(2, 1), Some(&5));

        let (x, y, _) = img.iter().find(|(_, _, v)| **v == 5).unwrap();
        assert_eq!((x, y), (2, 1));
    }

    #[test]
    fn from_vec_checks_size() {
        assert!(Image::from_vec(2, 2, vec![0u8; 3]).is_err());
        assert!(Image::from_vec(2, 2, vec![0u8; 4]).is_ok());
    }
}
