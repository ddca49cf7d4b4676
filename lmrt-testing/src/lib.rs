//! Internal testing utilities for the lmrt crates.

use std::fmt::Debug;
use std::panic::RefUnwindSafe;

/// Utility for creating parametrized (aka. table-driven) tests.
///
/// To create a table driven test:
///
/// 1. Import the `TestCases` trait
/// 2. Create a struct, conventionally named `Case`, that contains the data
///    for a single test case. This struct must implement `Debug`.
/// 3. Create a collection of `Case` instances (eg. an array or Vec),
///    conventionally named `cases`.
/// 4. Call `cases.test_each`, passing the test function as a closure
///
/// `test_each` will run all of the test cases and catch any panics. If all
/// cases succeed (ie. run without panicking), `test_each` will return.
/// Otherwise it will panic with a message that includes the count and debug
/// representations of failing test cases.
///
/// ## Example
///
/// ```
/// use lmrt_testing::TestCases;
///
/// // Add #[test] attribute
/// fn test_multiply() {
///   #[derive(Debug)]
///   struct Case {
///     a: i32,
///     b: i32,
///     expected: i32,
///   }
///
///   let cases = [
///     Case { a: 3, b: 5, expected: 15 },
///   ];
///
///   cases.test_each(|&Case { a, b, expected }| {
///     assert_eq!(a * b, expected);
///   });
/// }
/// # test_multiply();
/// ```
///
/// ## Unwind safety
///
/// Test cases and the test function must be
/// [unwind safe](https://doc.rust-lang.org/std/panic/fn.catch_unwind.html).
/// Practically this means they must not contain or capture values with
/// interior mutability. Values created _within_ the test function are
/// unaffected. Fields that are not unwind safe can be wrapped with
/// [`AssertUnwindSafe`](std::panic::AssertUnwindSafe), or replaced by a
/// simpler value from which the test function constructs the complex one.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call test function `test` with each test case in `self`, catching any panics.
    ///
    /// After all cases have been evaluated, return if no panics occurred or
    /// panic with details of failing cases otherwise.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes test cases
    /// to the test function by value.
    ///
    /// To support printing a debug representation of the case in the event
    /// of an error, each test case is formatted to a string before the test
    /// function is called. This adds a small amount of overhead compared to
    /// [`test_each`](TestCases::test_each).
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + std::panic::UnwindSafe;
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            if std::panic::catch_unwind(|| {
                test(&case);
            })
            .is_err()
            {
                failures.push(case);
            }
        }
        assert_eq!(
            failures.len(),
            0,
            "{} test cases failed: {:?}",
            failures.len(),
            failures
        );
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + std::panic::UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let test = &test;
            let case_str = format!("{:?}", case);

            if std::panic::catch_unwind(move || {
                test(case);
            })
            .is_err()
            {
                failures.push(case_str);
            }
        }
        assert_eq!(
            failures.len(),
            0,
            "{} test cases failed: {:?}",
            failures.len(),
            failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::TestCases;

    #[derive(Clone, Debug)]
    struct Case {
        x: i32,
    }

    #[test]
    fn test_test_cases_success() {
        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each(|case| {
            assert!(case.x > 0);
        });
        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each_value(|case| {
            assert!(case.x > 0);
        });
    }

    #[test]
    #[should_panic(expected = "1 test cases failed")]
    fn test_test_cases_failure() {
        let cases = [Case { x: 1 }, Case { x: -1 }];
        cases.test_each(|case| {
            assert!(case.x > 0);
        });
    }
}
