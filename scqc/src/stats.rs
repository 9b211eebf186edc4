//! Statistics functions

use ndarray::prelude::*;
use ndarray::DataMut;
use ndarray_stats::errors::QuantileError;
use noisy_float::prelude::*;
use num_traits::FromPrimitive;
use std::ops::{Add, Div, Mul, Rem, Sub};

/// Return the median. Sorts its argument in place.
pub fn median_mut<S, T>(xs: &mut ArrayBase<S, Ix1>) -> Result<T, QuantileError>
where
    S: DataMut<Elem = T>,
    T: Clone + Copy + Ord + FromPrimitive,
    T: Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T> + Rem<Output = T>,
{
    // ndarray_stats' quantile_mut can overflow the stack on large inputs, so sort instead
    if xs.is_empty() {
        return Err(QuantileError::EmptyInput);
    }
    match xs.as_slice_mut() {
        Some(vector) => vector.sort_unstable(),
        None => {
            let mut owned = xs.to_vec();
            owned.sort_unstable();
            xs.assign(&Array1::from(owned));
        }
    }
    let two = T::from_u64(2).ok_or(QuantileError::EmptyInput)?;
    Ok(if xs.len() % 2 == 0 {
        (xs[xs.len() / 2] + xs[xs.len() / 2 - 1]) / two
    } else {
        xs[xs.len() / 2]
    })
}

/// Median of finite floats. Returns None for an empty slice or if any value is NaN.
pub fn median(xs: &[f64]) -> Option<f64> {
    let mut v = Array1::from(xs.iter().map(|&x| N64::try_new(x)).collect::<Option<Vec<_>>>()?);
    median_mut(&mut v).ok().map(N64::raw)
}

/// Median absolute deviation, unscaled, together with the median
pub fn median_abs_dev(xs: &[f64]) -> Option<(f64, f64)> {
    let m = median(xs)?;
    let dev: Vec<f64> = xs.iter().map(|x| (x - m).abs()).collect();
    Some((m, median(&dev)?))
}

/// Consistency constant making the MAD estimate the standard deviation of normal data
pub const MAD_NORMAL_SCALE: f64 = 1.4826;

#[cfg(test)]
mod test_stats {
    use super::*;
    use ndarray::prelude::array;

    #[test]
    fn test_median_mut() {
        assert_eq!(
            median_mut(&mut Array::<usize, Ix1>::from(vec![])),
            Err(QuantileError::EmptyInput)
        );
        assert_eq!(median_mut(&mut array![1]), Ok(1));
        assert_eq!(median_mut(&mut array![1, 10]), Ok(5));
        assert_eq!(median_mut(&mut array![100, 1, 10]), Ok(10));
        assert_eq!(median_mut(&mut array![1, 1000, 10, 100]), Ok(55));

        assert_eq!(median_mut(&mut array![1.].mapv(n64)), Ok(n64(1.0)));
        assert_eq!(median_mut(&mut array![10., 1.].mapv(n64)), Ok(n64(5.5)));
    }

    #[test]
    fn test_median_abs_dev() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[f64::NAN, 1.0]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        // |x - 3| = 2, 1, 0, 1, 6 -> median 1
        assert_eq!(median_abs_dev(&[1.0, 2.0, 3.0, 4.0, 9.0]), Some((3.0, 1.0)));
    }
}
