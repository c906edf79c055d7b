//! Pure frame/tensor transforms: RGB <-> NCHW conversion, bilinear resampling,
//! engine alignment, and flow-field helpers.
//!
//! All functions here return new buffers and never mutate their inputs.

use anyhow::{anyhow, Result};
use ndarray::Array4;

use crate::types::{Frame, Tensor};

/// Engine inputs must satisfy `dim * flow_scale % 64 == 0` in both axes.
pub const ENGINE_ALIGNMENT: u32 = 64;

/// Largest denominator accepted when expressing a flow scale as a fraction.
const MAX_SCALE_DENOMINATOR: u32 = 64;

/// Smallest step between dimensions satisfying `dim * scale % 64 == 0`,
/// derived from the rational form `p/q` of the scale: `dim * p / q` is a
/// multiple of 64 exactly when `dim` is a multiple of `64q / gcd(p, 64q)`.
/// `None` when the scale has no small rational form (no aligned dimension
/// would exist for it).
pub fn alignment_period(scale: f32) -> Option<u32> {
    for q in 1..=MAX_SCALE_DENOMINATOR {
        let p = (f64::from(scale) * f64::from(q)).round() as u32;
        if p == 0 {
            continue;
        }
        if (f64::from(p) / f64::from(q) - f64::from(scale)).abs() < 1e-6 {
            let target = ENGINE_ALIGNMENT * q;
            return Some(target / gcd(p, target));
        }
    }
    None
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Grow `(width, height)` until both `width * scale` and `height * scale` are
/// multiples of 64. Dimensions only ever grow.
pub fn aligned_dims(width: u32, height: u32, scale: f32) -> Result<(u32, u32)> {
    let period = alignment_period(scale)
        .ok_or_else(|| anyhow!("flow scale {scale} admits no 64-aligned frame size"))?;
    Ok((width.div_ceil(period) * period, height.div_ceil(period) * period))
}

/// Resample a frame up to engine-aligned dimensions. Returns a clone when the
/// frame is already aligned.
pub fn align_for_engine(frame: &Frame, scale: f32) -> Result<Frame> {
    let (w, h) = aligned_dims(frame.width, frame.height, scale)?;
    if w == frame.width && h == frame.height {
        return Ok(frame.clone());
    }
    Ok(resize_frame(frame, w, h))
}

/// Bilinear resize of an interleaved RGB24 frame.
pub fn resize_frame(frame: &Frame, dst_w: u32, dst_h: u32) -> Frame {
    if dst_w == frame.width && dst_h == frame.height {
        return frame.clone();
    }

    let src = &frame.data;
    let src_w = frame.width as usize;
    let src_h = frame.height as usize;
    let dst_w_us = dst_w as usize;
    let dst_h_us = dst_h as usize;
    let mut dst = vec![0u8; dst_w_us * dst_h_us * 3];

    for dst_y in 0..dst_h_us {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h_us as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w_us {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w_us as f64 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w_us + dst_x) * 3;

            for c in 0..3 {
                let p00 = src[(src_y0 * src_w + src_x0) * 3 + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * 3 + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * 3 + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * 3 + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    Frame::new(dst, dst_w, dst_h)
}

/// Interleaved u8 RGB -> `[1, 3, H, W]` float tensor in `[0, 1]`.
pub fn frame_to_tensor(frame: &Frame) -> Tensor {
    let h = frame.height as usize;
    let w = frame.width as usize;
    let hw = h * w;
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

    let slice = tensor.as_slice_mut().expect("fresh array is contiguous");
    for y in 0..h {
        let row_src = y * w * 3;
        let row_dst = y * w;
        for x in 0..w {
            let src = row_src + x * 3;
            slice[row_dst + x] = frame.data[src] as f32 / 255.0;
            slice[hw + row_dst + x] = frame.data[src + 1] as f32 / 255.0;
            slice[2 * hw + row_dst + x] = frame.data[src + 2] as f32 / 255.0;
        }
    }

    tensor
}

/// `[1, 3, H, W]` float tensor -> interleaved u8 RGB, clipped to `[0, 255]`.
pub fn tensor_to_frame(tensor: &Tensor) -> Frame {
    let shape = tensor.shape();
    let h = shape[2];
    let w = shape[3];
    let hw = h * w;
    let mut rgb = vec![0u8; hw * 3];

    let contiguous = tensor.as_standard_layout();
    let slice = contiguous
        .as_slice()
        .expect("standard layout must be contiguous");
    let r_plane = &slice[..hw];
    let g_plane = &slice[hw..2 * hw];
    let b_plane = &slice[2 * hw..3 * hw];

    for i in 0..hw {
        let dst = i * 3;
        rgb[dst] = (r_plane[i] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
        rgb[dst + 1] = (g_plane[i] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
        rgb[dst + 2] = (b_plane[i] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
    }

    Frame::new(rgb, w as u32, h as u32)
}

/// Bilinear resample of an NCHW tensor (any channel count) to `dst_h x dst_w`,
/// pixel-center aligned.
pub fn resize_tensor(tensor: &Tensor, dst_h: usize, dst_w: usize) -> Tensor {
    let shape = tensor.shape();
    let channels = shape[1];
    let src_h = shape[2];
    let src_w = shape[3];

    if src_h == dst_h && src_w == dst_w {
        return tensor.clone();
    }

    let mut dst = Array4::<f32>::zeros((1, channels, dst_h, dst_w));

    for dst_y in 0..dst_h {
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0) as f32;

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0) as f32;

            for c in 0..channels {
                let p00 = tensor[[0, c, src_y0, src_x0]];
                let p10 = tensor[[0, c, src_y0, src_x1]];
                let p01 = tensor[[0, c, src_y1, src_x0]];
                let p11 = tensor[[0, c, src_y1, src_x1]];

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                dst[[0, c, dst_y, dst_x]] = top * (1.0 - fy) + bot * fy;
            }
        }
    }

    dst
}

/// 2x bilinear downsample, used for the refinement network inputs.
pub fn downsample_half(tensor: &Tensor) -> Tensor {
    let shape = tensor.shape();
    resize_tensor(tensor, (shape[2] / 2).max(1), (shape[3] / 2).max(1))
}

/// Per-pixel flow magnitude `sqrt(u^2 + v^2)` of a `[1, 2, H, W]` field as a
/// `[1, 1, H, W]` map. The caller is responsible for any division epsilon.
pub fn flow_magnitude(flow: &Tensor) -> Tensor {
    let shape = flow.shape();
    debug_assert_eq!(shape[1], 2, "flow field must have 2 channels");
    let h = shape[2];
    let w = shape[3];
    let mut magnitude = Array4::<f32>::zeros((1, 1, h, w));

    for y in 0..h {
        for x in 0..w {
            let u = flow[[0, 0, y, x]];
            let v = flow[[0, 1, y, x]];
            magnitude[[0, 0, y, x]] = (u * u + v * v).sqrt();
        }
    }

    magnitude
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_dims_already_aligned() {
        assert_eq!(aligned_dims(1920, 1088, 1.0).unwrap(), (1920, 1088));
        assert_eq!(aligned_dims(128, 64, 1.0).unwrap(), (128, 64));
    }

    #[test]
    fn test_aligned_dims_grow_only() {
        let (w, h) = aligned_dims(1920, 1080, 1.0).unwrap();
        assert_eq!((w, h), (1920, 1088));

        let (w, h) = aligned_dims(1279, 719, 1.0).unwrap();
        assert_eq!((w, h), (1280, 768));
    }

    #[test]
    fn test_aligned_dims_half_scale() {
        // At scale 0.5 a dimension must be a multiple of 128.
        let (w, h) = aligned_dims(1920, 1080, 0.5).unwrap();
        assert_eq!(w, 1920);
        assert_eq!(h, 1152);
    }

    #[test]
    fn test_aligned_dims_three_quarter_scale() {
        // At scale 0.75 = 3/4 the period is 256: dim * 3/4 is a multiple of
        // 64 only when dim is a multiple of 256.
        let (w, h) = aligned_dims(1920, 1080, 0.75).unwrap();
        assert_eq!((w, h), (2048, 1280));
        for dim in [w, h] {
            let scaled = f64::from(dim) * 0.75;
            assert_eq!(scaled.fract(), 0.0);
            assert_eq!(scaled as u32 % ENGINE_ALIGNMENT, 0, "dim {dim} unaligned");
        }
    }

    #[test]
    fn test_alignment_period_per_scale() {
        assert_eq!(alignment_period(1.0), Some(64));
        assert_eq!(alignment_period(0.5), Some(128));
        assert_eq!(alignment_period(0.75), Some(256));
        assert_eq!(alignment_period(0.25), Some(256));
        // No small fraction approximates 0.333 closely enough.
        assert_eq!(alignment_period(0.333), None);
    }

    #[test]
    fn test_align_for_engine_identity_is_clone() {
        let frame = Frame::solid(128, 64, [9, 9, 9]);
        let aligned = align_for_engine(&frame, 1.0).unwrap();
        assert_eq!(aligned.width, 128);
        assert_eq!(aligned.height, 64);
        assert_eq!(aligned.data, frame.data);
    }

    #[test]
    fn test_resize_frame_solid_color() {
        let frame = Frame::solid(4, 4, [200, 100, 50]);
        let resized = resize_frame(&frame, 8, 8);
        assert_eq!(resized.width, 8);
        assert_eq!(resized.height, 8);
        for pixel in resized.data.chunks_exact(3) {
            assert_eq!(pixel, &[200, 100, 50]);
        }
    }

    #[test]
    fn test_frame_tensor_roundtrip() {
        let mut data = vec![0u8; 8 * 8 * 3];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i * 7 % 256) as u8;
        }
        let frame = Frame::new(data.clone(), 8, 8);

        let tensor = frame_to_tensor(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);

        let restored = tensor_to_frame(&tensor);
        for (a, b) in data.iter().zip(restored.data.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 1, "mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn test_tensor_to_frame_clips() {
        let mut tensor = Array4::<f32>::zeros((1, 3, 1, 1));
        tensor[[0, 0, 0, 0]] = 1.5;
        tensor[[0, 1, 0, 0]] = -0.5;
        tensor[[0, 2, 0, 0]] = 0.5;

        let frame = tensor_to_frame(&tensor);
        assert_eq!(frame.data[0], 255);
        assert_eq!(frame.data[1], 0);
        assert!((frame.data[2] as i32 - 128).abs() <= 1);
    }

    #[test]
    fn test_downsample_half_dims() {
        let tensor = Array4::<f32>::ones((1, 3, 64, 128));
        let half = downsample_half(&tensor);
        assert_eq!(half.shape(), &[1, 3, 32, 64]);
        assert!((half[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_flow_magnitude_three_four_five() {
        let mut flow = Array4::<f32>::zeros((1, 2, 2, 2));
        flow[[0, 0, 0, 0]] = 3.0;
        flow[[0, 1, 0, 0]] = 4.0;

        let magnitude = flow_magnitude(&flow);
        assert_eq!(magnitude.shape(), &[1, 1, 2, 2]);
        assert!((magnitude[[0, 0, 0, 0]] - 5.0).abs() < 1e-6);
        assert!(magnitude[[0, 0, 1, 1]].abs() < 1e-6);
    }
}
