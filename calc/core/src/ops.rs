//! Chunk kernels executed on the worker pool. Stateless and independent;
//! reductions happen in the dispatcher.

use photon::request::{EquationType, Point};

/// Sorts one chunk of the input array.
pub fn sort_chunk(mut numbers: Vec<i32>) -> Vec<i32> {
    numbers.sort_unstable();
    numbers
}

/// Ascending primes within the inclusive range. 2 is handled explicitly,
/// everything below it is not prime, odd candidates are trial-divided by
/// odd divisors up to their square root.
pub fn find_primes(mut x_from: i32, x_to: i32) -> Vec<i32> {
    if x_from > x_to {
        return Vec::new();
    }

    let mut primes = Vec::new();
    if x_from <= 2 {
        if x_to >= 2 {
            primes.push(2);
        }
        x_from = 3;
    } else if x_from % 2 == 0 {
        x_from += 1;
    }

    let mut candidate = i64::from(x_from);
    while candidate <= i64::from(x_to) {
        if is_odd_prime(candidate as i32) {
            primes.push(candidate as i32);
        }
        candidate += 2;
    }
    primes
}

fn is_odd_prime(n: i32) -> bool {
    let limit = (f64::from(n)).sqrt() as i32;
    let mut divisor = 3;
    while divisor <= limit {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

/// Tabulates the configured function over the progression points
/// `x = origin + k·x_step` that fall inside `[lo, hi]`. Arithmetic is 32-bit
/// and wraps; `y` travels as `i32` so widening would change the protocol.
pub fn tabulate_span(
    equation: EquationType,
    origin: i32,
    x_step: i32,
    lo: i32,
    hi: i32,
    a: i32,
    b: i32,
    c: i32,
) -> Vec<Point> {
    if x_step < 1 || lo > hi {
        return Vec::new();
    }

    let step = i64::from(x_step);
    let delta = i64::from(lo) - i64::from(origin);
    let skipped = if delta <= 0 { 0 } else { (delta + step - 1) / step };
    let mut x = i64::from(origin) + skipped * step;

    let mut points = Vec::new();
    while x <= i64::from(hi) {
        let xi = x as i32;
        let y = match equation {
            EquationType::Linear => a.wrapping_mul(xi).wrapping_add(b),
            EquationType::Quadratic => a
                .wrapping_mul(xi.wrapping_mul(xi))
                .wrapping_add(b.wrapping_mul(xi))
                .wrapping_add(c),
        };
        points.push(Point::new(xi, y));
        x += step;
    }
    points
}

/// Whole-range tabulation: `x = x_from, x_from + x_step, …, x <= x_to`.
pub fn tabulate(
    equation: EquationType,
    x_from: i32,
    x_to: i32,
    x_step: i32,
    a: i32,
    b: i32,
    c: i32,
) -> Vec<Point> {
    tabulate_span(equation, x_from, x_step, x_from, x_to, a, b, c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_chunk() {
        assert_eq!(sort_chunk(vec![5, 3, 9, 3, 1]), vec![1, 3, 3, 5, 9]);
        assert_eq!(sort_chunk(vec![]), Vec::<i32>::new());
        assert_eq!(
            sort_chunk(vec![0, i32::min_value(), i32::max_value(), -1]),
            vec![i32::min_value(), -1, 0, i32::max_value()]
        );
    }

    #[test]
    fn test_primes_reference_range() {
        assert_eq!(find_primes(1, 20), vec![2, 3, 5, 7, 11, 13, 17, 19]);
    }

    #[test]
    fn test_primes_boundaries() {
        assert_eq!(find_primes(2, 2), vec![2]);
        assert_eq!(find_primes(1, 1), Vec::<i32>::new());
        assert_eq!(find_primes(-10, 1), Vec::<i32>::new());
        assert_eq!(find_primes(-10, 2), vec![2]);
        assert_eq!(find_primes(8, 10), Vec::<i32>::new());
        assert_eq!(find_primes(20, 10), Vec::<i32>::new());
        assert_eq!(find_primes(89, 89), vec![89]);
        assert_eq!(find_primes(90, 96), Vec::<i32>::new());
    }

    #[test]
    fn test_primes_match_sieve() {
        let limit = 2000;
        let mut is_prime = vec![true; limit + 1];
        is_prime[0] = false;
        is_prime[1] = false;
        for n in 2..=limit {
            if is_prime[n] {
                let mut multiple = n * n;
                while multiple <= limit {
                    is_prime[multiple] = false;
                    multiple += n;
                }
            }
        }
        let expected: Vec<i32> = (0..=limit).filter(|&n| is_prime[n]).map(|n| n as i32).collect();
        assert_eq!(find_primes(0, limit as i32), expected);
    }

    #[test]
    fn test_tabulate_linear() {
        let points = tabulate(EquationType::Linear, 0, 4, 2, 2, 3, 0);
        assert_eq!(
            points,
            vec![Point::new(0, 3), Point::new(2, 7), Point::new(4, 11)]
        );
    }

    #[test]
    fn test_tabulate_quadratic() {
        let points = tabulate(EquationType::Quadratic, -2, 2, 1, 1, 0, 0);
        assert_eq!(
            points,
            vec![
                Point::new(-2, 4),
                Point::new(-1, 1),
                Point::new(0, 0),
                Point::new(1, 1),
                Point::new(2, 4),
            ]
        );
    }

    #[test]
    fn test_tabulate_step_never_lands_on_to() {
        let points = tabulate(EquationType::Linear, 0, 5, 3, 1, 0, 0);
        assert_eq!(points, vec![Point::new(0, 0), Point::new(3, 3)]);
    }

    #[test]
    fn test_tabulate_span_respects_progression() {
        // Progression from 0 step 3 clipped to [4, 9] holds x = 6, 9 only.
        let points = tabulate_span(EquationType::Linear, 0, 3, 4, 9, 1, 0, 0);
        assert_eq!(points, vec![Point::new(6, 6), Point::new(9, 9)]);

        // Concatenating sub-spans equals the whole tabulation.
        let whole = tabulate(EquationType::Quadratic, -10, 10, 3, 2, -1, 5);
        let mut pieced = Vec::new();
        for &(lo, hi) in &crate::chunk::split_range(-10, 10, 4, 1) {
            pieced.extend(tabulate_span(EquationType::Quadratic, -10, 3, lo, hi, 2, -1, 5));
        }
        assert_eq!(pieced, whole);
    }

    #[test]
    fn test_tabulate_wraps_in_32_bits() {
        let points = tabulate(EquationType::Quadratic, 100_000, 100_000, 1, 1, 0, 0);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].y, 100_000i32.wrapping_mul(100_000));
    }

    #[test]
    fn test_tabulate_invalid_step() {
        assert!(tabulate(EquationType::Linear, 0, 10, 0, 1, 1, 1).is_empty());
        assert!(tabulate(EquationType::Linear, 10, 0, 1, 1, 1, 1).is_empty());
    }
}
