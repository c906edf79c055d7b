use ndarray::Array4;

/// NCHW float tensor with a batch dimension of 1.
///
/// Image tensors are `[1, 3, H, W]` with values in `[0, 1]`; flow fields are
/// `[1, 2, H, W]` (x displacement in channel 0, y in channel 1); scalar maps
/// (reliability metrics, distance ratio maps, masks) are `[1, 1, H, W]`.
pub type Tensor = Array4<f32>;

/// Interleaved 8-bit RGB frame as decoded from (or written to) FFmpeg.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            data,
            width,
            height,
        }
    }

    /// Solid-color frame, mostly useful in tests.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = vec![0u8; width as usize * height as usize * 3];
        for pixel in data.chunks_exact_mut(3) {
            pixel.copy_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}
