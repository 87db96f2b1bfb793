use statrs::distribution::{ContinuousCDF, StudentsT};

/// Minimum observations for a regression with a meaningful p-value
/// (two fitted parameters plus at least one residual degree of freedom).
pub const MIN_OBSERVATIONS: usize = 3;

const PIVOT_TOLERANCE: f64 = 1e-9;

/// Ordinary least-squares fit of `y = slope * x + intercept`, with the
/// Pearson correlation and the two-sided p-value of the slope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r: f64,
    pub p_value: f64,
    pub n: usize,
}

/// Univariate linear regression. Returns `None` when there are too few
/// observations or no variation in `x`; a coefficient from degenerate data
/// would be noise dressed up as a number.
pub fn linear_regression(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
    let n = xs.len();
    if n != ys.len() || n < MIN_OBSERVATIONS {
        return None;
    }
    let nf = n as f64;
    let x_mean = xs.iter().sum::<f64>() / nf;
    let y_mean = ys.iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x - x_mean;
        let dy = y - y_mean;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx <= f64::EPSILON {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    // Constant y fits a horizontal line exactly; correlation is defined as 0.
    let r = if syy <= f64::EPSILON {
        0.0
    } else {
        sxy / (sxx * syy).sqrt()
    };

    let df = (n - 2) as f64;
    let r2 = r * r;
    let p_value = if 1.0 - r2 <= f64::EPSILON {
        // Exact fit: the slope estimate has no residual variance.
        0.0
    } else {
        let t = r.abs() * (df / (1.0 - r2)).sqrt();
        let dist = StudentsT::new(0.0, 1.0, df).ok()?;
        2.0 * (1.0 - dist.cdf(t))
    };

    Some(LinearFit {
        slope,
        intercept,
        r,
        p_value,
        n,
    })
}

/// Multivariate least squares via the normal equations. `rows` are design
/// matrix rows (include a leading 1 for an intercept); returns one
/// coefficient per column, or `None` when the system is singular or
/// underdetermined.
pub fn least_squares(rows: &[Vec<f64>], ys: &[f64]) -> Option<Vec<f64>> {
    let n = rows.len();
    let k = rows.first()?.len();
    if n != ys.len() || n < k || rows.iter().any(|r| r.len() != k) {
        return None;
    }

    // Build X'X and X'y.
    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, &y) in rows.iter().zip(ys) {
        for i in 0..k {
            for j in 0..k {
                xtx[i][j] += row[i] * row[j];
            }
            xty[i] += row[i] * y;
        }
    }

    // Gaussian elimination with partial pivoting.
    for col in 0..k {
        let pivot_row = (col..k)
            .max_by(|&a, &b| xtx[a][col].abs().total_cmp(&xtx[b][col].abs()))?;
        if xtx[pivot_row][col].abs() < PIVOT_TOLERANCE {
            return None;
        }
        xtx.swap(col, pivot_row);
        xty.swap(col, pivot_row);
        for row in 0..k {
            if row == col {
                continue;
            }
            let factor = xtx[row][col] / xtx[col][col];
            for j in col..k {
                xtx[row][j] -= factor * xtx[col][j];
            }
            xty[row] -= factor * xty[col];
        }
    }
    Some((0..k).map(|i| xty[i] / xtx[i][i]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_linear_data_gives_zero_p_value() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * x + 2.0).collect();
        let fit = linear_regression(&xs, &ys).unwrap();
        assert!((fit.slope - 3.0).abs() < 1e-9);
        assert!((fit.intercept - 2.0).abs() < 1e-9);
        assert!((fit.r - 1.0).abs() < 1e-9);
        assert_eq!(fit.p_value, 0.0);
    }

    #[test]
    fn uncorrelated_data_is_not_significant() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let ys = [5.0, 3.0, 6.0, 2.0, 5.0, 4.0];
        let fit = linear_regression(&xs, &ys).unwrap();
        assert!(fit.p_value > 0.5, "p = {}", fit.p_value);
    }

    #[test]
    fn constant_response_has_zero_correlation() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [7.0, 7.0, 7.0, 7.0];
        let fit = linear_regression(&xs, &ys).unwrap();
        assert_eq!(fit.slope, 0.0);
        assert_eq!(fit.r, 0.0);
        assert!(fit.p_value > 0.9);
    }

    #[test]
    fn degenerate_inputs_return_none() {
        assert!(linear_regression(&[1.0, 2.0], &[1.0, 2.0]).is_none());
        assert!(linear_regression(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]).is_none());
        assert!(linear_regression(&[1.0, 2.0, 3.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn least_squares_recovers_exact_coefficients() {
        let beta = [10.0, 2.0, 0.5];
        let points = [(1.0, 1.0), (2.0, 5.0), (3.0, 2.0), (4.0, 8.0), (5.0, 3.0)];
        let rows: Vec<Vec<f64>> = points.iter().map(|&(a, b)| vec![1.0, a, b]).collect();
        let ys: Vec<f64> = points
            .iter()
            .map(|&(a, b)| beta[0] + beta[1] * a + beta[2] * b)
            .collect();
        let solved = least_squares(&rows, &ys).unwrap();
        for (got, want) in solved.iter().zip(beta) {
            assert!((got - want).abs() < 1e-6, "{solved:?}");
        }
    }

    #[test]
    fn collinear_design_is_singular() {
        let rows: Vec<Vec<f64>> = (1..=4).map(|x| vec![1.0, x as f64, 2.0 * x as f64]).collect();
        let ys = [1.0, 2.0, 3.0, 4.0];
        assert!(least_squares(&rows, &ys).is_none());
    }

    #[test]
    fn underdetermined_system_returns_none() {
        let rows = vec![vec![1.0, 2.0, 3.0], vec![1.0, 3.0, 4.0]];
        assert!(least_squares(&rows, &[1.0, 2.0]).is_none());
    }
}
