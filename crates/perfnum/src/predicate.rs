//! The numeric property being searched for.

/// A pure test applied to each candidate integer.
pub trait Predicate: Send + Sync + 'static {
    fn is_target(&self, n: u32) -> bool;
}

/// `n` equals the sum of its proper divisors.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfectNumber;

impl Predicate for PerfectNumber {
    fn is_target(&self, n: u32) -> bool {
        if n < 2 {
            return false;
        }
        let sum: u64 = (1..=n / 2).filter(|d| n % d == 0).map(u64::from).sum();
        sum == u64::from(n)
    }
}

impl<F> Predicate for F
where
    F: Fn(u32) -> bool + Send + Sync + 'static,
{
    fn is_target(&self, n: u32) -> bool {
        self(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_perfect_numbers() {
        let p = PerfectNumber;
        for n in [1, 2, 6, 12, 28, 100, 496, 500, 8128] {
            let expected = matches!(n, 6 | 28 | 496 | 8128);
            assert_eq!(p.is_target(n), expected, "n = {n}");
        }
    }

    #[test]
    fn zero_is_not_perfect() {
        assert!(!PerfectNumber.is_target(0));
    }

    #[test]
    fn perfect_numbers_below_ten_thousand() {
        let found: Vec<u32> = (1..=10_000).filter(|&n| PerfectNumber.is_target(n)).collect();
        assert_eq!(found, vec![6, 28, 496, 8128]);
    }

    #[test]
    fn closures_are_predicates() {
        let even = |n: u32| n % 2 == 0;
        assert!(even.is_target(4));
        assert!(!even.is_target(5));
    }
}
