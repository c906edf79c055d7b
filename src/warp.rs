//! Reliability-weighted forward warping (softmax splatting).
//!
//! Every source pixel is scattered bilinearly to its flow destination with a
//! contribution weight of `exp(metric)`; the accumulated result is normalized
//! by the total accumulated weight. Destinations that receive almost no
//! weight are holes: [`warp_coverage`] exposes the accumulated-weight map so
//! callers can detect and repair them.

use ndarray::Array4;

use crate::types::Tensor;

/// Destinations whose warped all-ones mask falls below this are holes.
pub const HOLE_THRESHOLD: f32 = 0.999;

const NORMALIZE_EPS: f32 = 1e-7;

/// Forward-warp `input` along `flow`, weighting each source pixel's
/// contribution by `exp(metric)` ("soft" accumulation mode).
///
/// `input` is `[1, C, H, W]`, `flow` is `[1, 2, H, W]` and `metric` is
/// `[1, 1, H, W]`. Destination pixels that receive no contribution are 0.
pub fn softsplat(input: &Tensor, flow: &Tensor, metric: &Tensor) -> Tensor {
    let shape = input.shape();
    let channels = shape[1];
    let h = shape[2];
    let w = shape[3];
    debug_assert_eq!(flow.shape(), &[1, 2, h, w]);
    debug_assert_eq!(metric.shape(), &[1, 1, h, w]);

    let mut numerator = Array4::<f32>::zeros((1, channels, h, w));
    let mut denominator = Array4::<f32>::zeros((1, 1, h, w));

    for src_y in 0..h {
        for src_x in 0..w {
            let dst_x = src_x as f32 + flow[[0, 0, src_y, src_x]];
            let dst_y = src_y as f32 + flow[[0, 1, src_y, src_x]];

            let x0 = dst_x.floor() as i64;
            let y0 = dst_y.floor() as i64;
            let fx = dst_x - x0 as f32;
            let fy = dst_y - y0 as f32;

            let weight = metric[[0, 0, src_y, src_x]].exp();

            let corners = [
                (x0, y0, (1.0 - fx) * (1.0 - fy)),
                (x0 + 1, y0, fx * (1.0 - fy)),
                (x0, y0 + 1, (1.0 - fx) * fy),
                (x0 + 1, y0 + 1, fx * fy),
            ];

            for (cx, cy, corner_weight) in corners {
                if cx < 0 || cy < 0 || cx >= w as i64 || cy >= h as i64 {
                    continue;
                }
                if corner_weight <= 0.0 {
                    continue;
                }
                let cx = cx as usize;
                let cy = cy as usize;
                let splat = weight * corner_weight;

                denominator[[0, 0, cy, cx]] += splat;
                for c in 0..channels {
                    numerator[[0, c, cy, cx]] += splat * input[[0, c, src_y, src_x]];
                }
            }
        }
    }

    for y in 0..h {
        for x in 0..w {
            let den = denominator[[0, 0, y, x]] + NORMALIZE_EPS;
            for c in 0..channels {
                numerator[[0, c, y, x]] /= den;
            }
        }
    }

    numerator
}

/// Warp an all-ones mask: the result is ~1 where at least one source pixel
/// landed with meaningful confidence and near 0 in the holes.
pub fn warp_coverage(flow: &Tensor, metric: &Tensor) -> Tensor {
    let shape = flow.shape();
    let ones = Array4::<f32>::ones((1, 1, shape[2], shape[3]));
    softsplat(&ones, flow, metric)
}

/// Replace hole pixels of `warped` (where `coverage < HOLE_THRESHOLD`) with
/// the corresponding `fallback` values.
pub fn fill_holes(warped: &mut Tensor, coverage: &Tensor, fallback: &Tensor) {
    let shape = warped.shape().to_vec();
    let channels = shape[1];
    for y in 0..shape[2] {
        for x in 0..shape[3] {
            if coverage[[0, 0, y, x]] < HOLE_THRESHOLD {
                for c in 0..channels {
                    warped[[0, c, y, x]] = fallback[[0, c, y, x]];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_flow(h: usize, w: usize) -> Tensor {
        Array4::<f32>::zeros((1, 2, h, w))
    }

    fn unit_metric(h: usize, w: usize) -> Tensor {
        Array4::<f32>::ones((1, 1, h, w))
    }

    #[test]
    fn test_identity_warp_preserves_ones_mask() {
        let flow = zero_flow(8, 8);
        let metric = unit_metric(8, 8);

        let coverage = warp_coverage(&flow, &metric);
        for value in coverage.iter() {
            assert!(
                (value - 1.0).abs() < 1e-3,
                "identity warp should preserve the mask, got {value}"
            );
            assert!(*value >= HOLE_THRESHOLD, "no holes expected, got {value}");
        }
    }

    #[test]
    fn test_identity_warp_preserves_values() {
        let h = 4;
        let w = 4;
        let mut input = Array4::<f32>::zeros((1, 1, h, w));
        for y in 0..h {
            for x in 0..w {
                input[[0, 0, y, x]] = (y * w + x) as f32 / 16.0;
            }
        }

        let warped = softsplat(&input, &zero_flow(h, w), &unit_metric(h, w));
        for y in 0..h {
            for x in 0..w {
                assert!((warped[[0, 0, y, x]] - input[[0, 0, y, x]]).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_integer_shift_moves_values_and_leaves_hole() {
        let h = 4;
        let w = 4;
        // Shift everything one pixel to the right.
        let mut flow = zero_flow(h, w);
        for y in 0..h {
            for x in 0..w {
                flow[[0, 0, y, x]] = 1.0;
            }
        }
        let metric = unit_metric(h, w);

        let mut input = Array4::<f32>::zeros((1, 1, h, w));
        for y in 0..h {
            for x in 0..w {
                input[[0, 0, y, x]] = x as f32;
            }
        }

        let warped = softsplat(&input, &flow, &metric);
        let coverage = warp_coverage(&flow, &metric);

        for y in 0..h {
            // Column 0 vacated: nothing maps there.
            assert!(coverage[[0, 0, y, 0]] < HOLE_THRESHOLD);
            for x in 1..w {
                assert!(coverage[[0, 0, y, x]] >= HOLE_THRESHOLD);
                assert!((warped[[0, 0, y, x]] - (x as f32 - 1.0)).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_fill_holes_uses_fallback() {
        let h = 2;
        let w = 2;
        let mut warped = Array4::<f32>::zeros((1, 1, h, w));
        let mut coverage = Array4::<f32>::ones((1, 1, h, w));
        coverage[[0, 0, 0, 1]] = 0.0;
        let fallback = Array4::<f32>::from_elem((1, 1, h, w), 0.75);

        fill_holes(&mut warped, &coverage, &fallback);
        assert_eq!(warped[[0, 0, 0, 1]], 0.75);
        assert_eq!(warped[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_higher_metric_dominates_collision() {
        let h = 1;
        let w = 3;
        // Both outer pixels splat onto the center.
        let mut flow = zero_flow(h, w);
        flow[[0, 0, 0, 0]] = 1.0;
        flow[[0, 0, 0, 2]] = -1.0;

        let mut metric = Array4::<f32>::zeros((1, 1, h, w));
        metric[[0, 0, 0, 0]] = 10.0;
        metric[[0, 0, 0, 2]] = -10.0;

        let mut input = Array4::<f32>::zeros((1, 1, h, w));
        input[[0, 0, 0, 0]] = 1.0;
        input[[0, 0, 0, 2]] = 0.0;

        let warped = softsplat(&input, &flow, &metric);
        assert!(
            warped[[0, 0, 0, 1]] > 0.99,
            "high-confidence source should dominate, got {}",
            warped[[0, 0, 0, 1]]
        );
    }
}
